use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::info;

use easel_core::{
    AccountRegistry, CoreConfig, Correlator, KeyLockManager, NotificationBus, PassthroughHost,
    TaskOrchestrator, UpstreamInstance,
};
use easel_store::{MemoryBannedWordStore, MemoryDomainStore, MemoryTaskStore, TaskStore};
use easel_types::{Account, AccountFilter, TaskStatus};

mod dry_run;

use dry_run::DryRunGateway;

#[derive(Parser, Debug)]
#[command(name = "easel-engine")]
#[command(about = "Headless Easel drawing-proxy core")]
struct Cli {
    /// Accounts file (JSON array of account records).
    #[arg(long, default_value = "accounts.json")]
    accounts: PathBuf,
    /// Core configuration file (JSON), defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the accounts file and print the registry summary.
    Check,
    /// Run one imagine job end-to-end against the dry-run gateway.
    Demo {
        prompt: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("EASEL_LOG").unwrap_or_else(|_| "info".to_string()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let accounts = load_accounts(&cli.accounts)?;

    match cli.command {
        Command::Check => {
            for account in &accounts {
                info!(
                    "account {} backend={:?} core={} queue={} modes={:?}",
                    account.channel_id,
                    account.backend_family,
                    account.core_size,
                    account.queue_size,
                    account.allowed_modes
                );
            }
            println!("{} account(s) ok", accounts.len());
        }
        Command::Demo { prompt } => {
            run_demo(config, accounts, prompt).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<CoreConfig> {
    let Some(path) = path else {
        return Ok(CoreConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

fn load_accounts(path: &std::path::Path) -> anyhow::Result<Vec<Account>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading accounts {}", path.display()))?;
    let accounts: Vec<Account> =
        serde_json::from_str(&raw).with_context(|| format!("parsing accounts {}", path.display()))?;
    anyhow::ensure!(!accounts.is_empty(), "accounts file is empty");
    Ok(accounts)
}

async fn run_demo(
    config: CoreConfig,
    accounts: Vec<Account>,
    prompt: String,
) -> anyhow::Result<()> {
    let store = Arc::new(MemoryTaskStore::new());
    let registry = Arc::new(AccountRegistry::new());
    let locks = Arc::new(KeyLockManager::new());
    let bus = NotificationBus::new();

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    for account in accounts {
        registry.register(UpstreamInstance::start(
            account,
            Arc::new(DryRunGateway::new(events_tx.clone())),
            store.clone() as Arc<dyn TaskStore>,
            locks.clone(),
            bus.clone(),
        ));
    }

    let orchestrator = TaskOrchestrator::new(
        config,
        store.clone(),
        registry.clone(),
        Arc::new(MemoryDomainStore::default()),
        Arc::new(MemoryBannedWordStore::default()),
        locks.clone(),
        bus.clone(),
        Arc::new(PassthroughHost),
    );
    let correlator = Arc::new(Correlator::new(
        registry.clone(),
        store.clone(),
        locks,
        bus.clone(),
    ));

    // Demultiplex fabricated gateway events into the correlator.
    let feed = correlator.clone();
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            if let Err(e) = feed.on_event(event).await {
                tracing::warn!("event dropped: {e}");
            }
        }
    });

    let mut notices = bus.subscribe();
    let result = orchestrator
        .submit_imagine(easel_core::ImagineParams {
            prompt,
            images: Vec::new(),
            bot_family: None,
            filter: AccountFilter::default(),
        })
        .await;
    info!(
        "submit: code={:?} description={} task={}",
        result.code, result.description, result.result
    );
    anyhow::ensure!(!result.result.is_empty(), "submission failed");
    let task_id = result.result;

    while let Ok(notice) = notices.recv().await {
        if notice.task_id != task_id {
            continue;
        }
        info!("task {} -> {:?} {}", notice.task_id, notice.status, notice.progress);
        if matches!(
            notice.status,
            TaskStatus::Success | TaskStatus::Failure | TaskStatus::Cancel
        ) {
            break;
        }
    }

    let task = orchestrator
        .get_task(&task_id)
        .await?
        .context("task vanished")?;
    println!("{}", serde_json::to_string_pretty(&task)?);
    for instance in registry.all() {
        instance.shutdown();
    }
    Ok(())
}
