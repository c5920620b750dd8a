use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use parley_control::ConversationBuilder;
use parley_engine::{
    Coordinator, CredentialSource, ModelProfile, Participant, ScriptedReplyProvider,
    named_flag_termination,
};
use parley_protocol::{MessagePayload, ModelConfig};
use tokio_stream::StreamExt;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "parleyd")]
#[command(about = "parley conversation demo daemon")]
struct Cli {
    #[arg(long, default_value = ".parley")]
    root: PathBuf,
    #[arg(long, default_value = "write a project status report")]
    task: String,
    /// Round budget per run segment.
    #[arg(long, default_value_t = 20)]
    max_rounds: u64,
}

fn profile() -> ModelProfile {
    ModelProfile::new(ModelConfig::new("gpt-4"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .compact()
        .init();

    let cli = Cli::parse();

    let provider = Arc::new(ScriptedReplyProvider::from_lines(&[
        "here is a first outline",
        "the second section is too thin",
        "expanded the second section",
        "SOLUTION_FOUND: report is ready",
    ]));

    let controller = ConversationBuilder::new(&cli.root)
        .participant(Participant::new(
            "writer",
            "Draft and revise the report.",
            profile(),
        ))
        .participant(Participant::new(
            "reviewer",
            "Point out weaknesses in each draft.",
            profile(),
        ))
        .provider(provider.clone())
        .coordinator(Coordinator::new(
            Participant::new("moderator", "Keep the exchange on task.", profile())
                .with_termination(named_flag_termination()),
            cli.max_rounds,
        ))
        .credentials(CredentialSource::from_env())
        .build()?;
    info!(run_id = %controller.run_id(), root = ?controller.run_root(), "conversation ready");

    let mut events = controller.subscribe_stream();
    let event_task = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let Ok(event) = event else {
                // Lagged subscriber; skip the gap and keep reading.
                continue;
            };
            let rendered = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_owned());
            info!(event = %rendered, "event.observed");
        }
    });

    controller
        .seed("operator", MessagePayload::text(cli.task.clone()))
        .await?;
    controller.start().await?;
    controller.wait_until_settled().await;
    info!(state = ?controller.state().await, "first run settled");

    for message in controller.branch_messages(controller.current_branch()) {
        info!(
            ts = message.timestamp,
            sender = %message.sender,
            content = %message.payload.content,
            "transcript"
        );
    }

    // Rewrite the reviewer's critique at timestamp 2 and replay from there
    // on a fresh branch.
    provider.push(MessagePayload::text("rewrote both weak sections"));
    provider.push(MessagePayload::text("SOLUTION_FOUND: revised report is ready"));
    let child = controller
        .edit_and_rewind(
            2,
            MessagePayload::text("both the second and third sections are too thin"),
        )
        .await?;
    controller.wait_until_settled().await;
    info!(branch = %child, state = ?controller.state().await, "rewound run settled");

    for message in controller.branch_messages(child) {
        info!(
            ts = message.timestamp,
            sender = %message.sender,
            content = %message.payload.content,
            "transcript.rewound"
        );
    }

    let bundle_path = controller.save_to_file(None).await?;
    info!(path = ?bundle_path, "history bundle saved");

    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    event_task.abort();
    if let Err(error) = event_task.await {
        warn!(%error, "event task stopped");
    }

    Ok(())
}
