use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use futures_util::StreamExt;
use omni_events::{InMemoryFileStore, LocalFileStore};
use omni_protocol::{Action, Catalog, EventId, FileStore};
use omni_runtime::{FileStoreKind, ShutdownCoordinator, load_config};
use omni_session::{SessionInit, SessionManager};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "omnid")]
#[command(about = "OmniNexus runtime demo daemon")]
struct Cli {
    #[arg(long)]
    config: Option<PathBuf>,
    /// Shell command to run in the sandbox; repeat for several.
    #[arg(long = "command", default_value = "echo hello from omninexus")]
    commands: Vec<String>,
    #[arg(long)]
    user: Option<String>,
    /// Seconds to wait for each command's observation.
    #[arg(long, default_value_t = 30)]
    wait_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .compact()
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref()).context("failed to load configuration")?;
    let store: Arc<dyn FileStore> = match config.file_store {
        FileStoreKind::Local => Arc::new(LocalFileStore::new(config.file_store_path.clone())),
        FileStoreKind::Memory => Arc::new(InMemoryFileStore::new()),
    };

    let shutdown = ShutdownCoordinator::new();
    let catalog = Arc::new(Catalog::standard());
    let manager = SessionManager::builder(store)
        .catalog(catalog.clone())
        .sandbox_config(config.sandbox.clone())
        .runtime_config(config.runtime.clone())
        .shutdown(shutdown.clone())
        .build();

    let conversation = manager
        .create_session(SessionInit {
            user_id: cli.user.clone(),
            ..SessionInit::default()
        })
        .await
        .context("failed to create session")?;
    info!(
        session_id = %conversation.session_id(),
        backend = %conversation.runtime().backend_kind(),
        microagents = conversation.runtime().microagents().len(),
        "session created"
    );

    let (caused_tx, mut caused_rx) = mpsc::unbounded_channel::<EventId>();
    let mut feed = conversation.events(None).await?;
    let printer = tokio::spawn(async move {
        while let Some(item) = feed.next().await {
            let event = match item {
                Ok(event) => event,
                Err(error) => {
                    warn!(%error, "event feed failed");
                    break;
                }
            };
            let rendered = catalog
                .encode(&event)
                .map(|value| value.to_string())
                .unwrap_or_else(|_| "{}".to_owned());
            info!(event = %rendered, "event.appended");
            if let Some(cause) = event.cause {
                let _ = caused_tx.send(cause);
            }
        }
    });

    let wait = Duration::from_secs(cli.wait_secs);
    let outcome = run_commands(&conversation, &cli.commands, &mut caused_rx, wait).await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    printer.abort();
    conversation.detach();
    shutdown.shutdown().await;
    manager.shutdown().await;
    outcome
}

async fn run_commands(
    conversation: &omni_session::Conversation,
    commands: &[String],
    caused: &mut mpsc::UnboundedReceiver<EventId>,
    wait: Duration,
) -> Result<()> {
    for command in commands {
        let id = conversation.send_action(Action::run(command.clone())).await?;
        info!(event_id = id, command = %command, "command submitted");
        let answered = tokio::time::timeout(wait, async {
            while let Some(cause) = caused.recv().await {
                if cause == id {
                    return true;
                }
            }
            false
        })
        .await;
        match answered {
            Ok(true) => {}
            Ok(false) => bail!("event feed ended before command {id} was answered"),
            Err(_) => bail!("no observation for command {id} after {}s", wait.as_secs()),
        }
    }
    Ok(())
}
