//! Vault CLI - file-backed approval queue with cooperating agents
//!
//! Usage:
//!   vault init                      Create the vault directories and config
//!   vault status                    Show queue depths
//!   vault process-all               Dispatch approved and archive rejected items
//!   vault run                       Run the orchestrator loop
//!   vault local-executive [--once]  Run the local executive agent
//!   vault cloud-draft [--once]      Run the cloud draft worker
//!   vault list pending              List items in a queue state
//!   vault approve <id>              Approve a pending item

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use vault_agents::{
    CloudDraftWorker, CloudIntegrationWorker, IntervalScheduler, LocalExecutive, Orchestrator,
    QueryBridge,
};
use vault_core::{VaultConfig, VaultLayout, VaultState};

#[derive(Parser)]
#[command(name = "vault")]
#[command(author, version, about = "File-backed approval queue with cooperating agents")]
struct Cli {
    /// Vault root (defaults to $VAULT_PATH, then ./vault)
    #[arg(long, global = true)]
    vault: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the vault directories and a default config
    Init,

    /// Show item counts per queue state
    Status,

    /// Dispatch approved items to their channel processors
    ProcessApproved,

    /// Archive rejected items
    ProcessRejected,

    /// Process approved, then rejected items
    ProcessAll,

    /// Run the orchestrator periodically
    Run {
        /// Seconds between cycles (defaults to the configured poll interval)
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Run the local executive agent
    LocalExecutive {
        /// Run a single cycle and print its report
        #[arg(long)]
        once: bool,

        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Run the cloud draft worker
    CloudDraft {
        #[arg(long)]
        once: bool,

        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Run the cloud integration worker
    CloudIntegration {
        #[arg(long)]
        once: bool,

        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Show service health records
    Health,

    /// Show pending offline queue items
    Queue {
        /// Only items for this service
        #[arg(long)]
        service: Option<String>,
    },

    /// List items in a queue state (inbox, needs_action, pending, approved, ...)
    List {
        state: String,
    },

    /// Move a pending item to Approved
    Approve {
        /// Item id (file name without .md)
        id: String,
    },

    /// Move a pending item to Rejected
    Reject {
        id: String,
    },
}

/// Resolved vault root and its configuration
struct Vault {
    layout: VaultLayout,
    config: VaultConfig,
}

impl Vault {
    fn open(root: Option<PathBuf>) -> Result<Self> {
        let root = VaultConfig::resolve_root(root);
        let config = VaultConfig::load_or_default(&root)
            .with_context(|| format!("Failed to load config for {}", root.display()))?;
        Ok(Self {
            layout: VaultLayout::new(root),
            config,
        })
    }

    fn orchestrator(&self) -> Result<Orchestrator> {
        Orchestrator::from_config(self.layout.clone(), self.config.clone())
            .context("Failed to build channel processors")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over --verbose
    if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .with_target(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .with_target(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    let vault = Vault::open(cli.vault)?;

    match cli.command {
        Commands::Init => cmd_init(&vault).await,
        Commands::Status => cmd_status(&vault).await,
        Commands::ProcessApproved => print_json(&vault.orchestrator()?.process_approved().await?),
        Commands::ProcessRejected => print_json(&vault.orchestrator()?.process_rejected().await?),
        Commands::ProcessAll => print_json(&vault.orchestrator()?.process_all().await?),
        Commands::Run { interval } => cmd_run(&vault, interval).await,
        Commands::LocalExecutive { once, interval } => {
            cmd_local_executive(&vault, once, interval).await
        }
        Commands::CloudDraft { once, interval } => cmd_cloud_draft(&vault, once, interval).await,
        Commands::CloudIntegration { once, interval } => {
            cmd_cloud_integration(&vault, once, interval).await
        }
        Commands::Health => cmd_health(&vault).await,
        Commands::Queue { service } => cmd_queue(&vault, service).await,
        Commands::List { state } => cmd_list(&vault, &state).await,
        Commands::Approve { id } => cmd_decide(&vault, &id, true).await,
        Commands::Reject { id } => cmd_decide(&vault, &id, false).await,
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn interval_or(interval: Option<u64>, configured: u64) -> Duration {
    Duration::from_secs(interval.unwrap_or(configured).max(1))
}

async fn cmd_init(vault: &Vault) -> Result<()> {
    let root = vault.layout.root();
    info!("Initializing vault in {}", root.display());

    vault
        .layout
        .ensure_dirs(&["local", "cloud"])
        .await
        .context("Failed to create vault directories")?;

    let config_path = VaultConfig::path(root);
    let wrote_config = if config_path.exists() {
        false
    } else {
        VaultConfig::write_default(root)?;
        true
    };

    println!("Initialized vault in {}", root.display());
    println!("Created:");
    for dir in [
        "Inbox/",
        "Needs_Action/cloud/",
        "Pending_Approval/",
        "Approved/",
        "Rejected/",
        "In_Progress/{local,cloud}/",
        "Done/",
        "Updates/",
        "State/",
        "Logs/",
    ] {
        println!("  {}", dir);
    }
    if wrote_config {
        println!("  .vault/config.toml");
    }
    Ok(())
}

async fn cmd_status(vault: &Vault) -> Result<()> {
    let counts = vault.orchestrator()?.status().await?;

    println!("Vault Status ({})", vault.layout.root().display());
    println!("============");
    println!("Role: {}", vault.config.role);
    println!("\nInbox:              {}", counts.inbox);
    println!("Needs Action:       {}", counts.needs_action);
    println!("Needs Action/cloud: {}", counts.needs_action_cloud);
    println!("Pending Approval:   {}", counts.pending_approval);
    println!("Approved:           {}", counts.approved);
    println!("Rejected:           {}", counts.rejected);
    println!("Done:               {}", counts.done);
    Ok(())
}

async fn cmd_run(vault: &Vault, interval: Option<u64>) -> Result<()> {
    let orchestrator = vault.orchestrator()?;
    let interval = interval_or(interval, vault.config.poll.orchestrator_secs);
    let cycles = orchestrator
        .run(&IntervalScheduler::new(), interval)
        .await?;
    info!("Orchestrator stopped after {} cycles", cycles);
    Ok(())
}

async fn cmd_local_executive(vault: &Vault, once: bool, interval: Option<u64>) -> Result<()> {
    let executive = LocalExecutive::new(vault.orchestrator()?)?;
    if once {
        executive.start().await?;
        return print_json(&executive.cycle().await?);
    }

    let interval = interval_or(interval, vault.config.poll.local_executive_secs);
    let cycles = executive.run(&IntervalScheduler::new(), interval).await?;
    info!("Local executive stopped after {} cycles", cycles);
    Ok(())
}

async fn cmd_cloud_draft(vault: &Vault, once: bool, interval: Option<u64>) -> Result<()> {
    let worker = CloudDraftWorker::new(vault.layout.clone());
    if once {
        worker.start().await?;
        return print_json(&worker.cycle().await?);
    }

    let interval = interval_or(interval, vault.config.poll.cloud_draft_secs);
    let cycles = worker.run(&IntervalScheduler::new(), interval).await?;
    info!("Cloud draft worker stopped after {} cycles", cycles);
    Ok(())
}

async fn cmd_cloud_integration(vault: &Vault, once: bool, interval: Option<u64>) -> Result<()> {
    let worker = CloudIntegrationWorker::from_config(vault.layout.clone(), &vault.config)
        .context("Failed to build channel processors")?;
    if once {
        worker.start().await?;
        return print_json(&worker.cycle().await?);
    }

    let interval = interval_or(interval, vault.config.poll.cloud_integration_secs);
    let cycles = worker.run(&IntervalScheduler::new(), interval).await?;
    info!("Cloud integration worker stopped after {} cycles", cycles);
    Ok(())
}

async fn cmd_health(vault: &Vault) -> Result<()> {
    let orchestrator = vault.orchestrator()?;
    let records = orchestrator.executor().health().all_status().await?;
    if records.is_empty() {
        println!("No services tracked yet");
        return Ok(());
    }
    print_json(&records)
}

async fn cmd_queue(vault: &Vault, service: Option<String>) -> Result<()> {
    let orchestrator = vault.orchestrator()?;
    let pending = orchestrator
        .executor()
        .queue()
        .pending(service.as_deref())
        .await?;
    print_json(&pending)
}

async fn cmd_list(vault: &Vault, state: &str) -> Result<()> {
    let state: VaultState = state.parse().map_err(anyhow::Error::msg)?;
    let items = QueryBridge::new(vault.layout.clone()).list(&state).await;
    print_json(&items)
}

async fn cmd_decide(vault: &Vault, id: &str, approve: bool) -> Result<()> {
    let bridge = QueryBridge::new(vault.layout.clone());
    let result = if approve {
        bridge.approve(id).await
    } else {
        bridge.reject(id).await
    };
    print_json(&result)?;

    if !result.is_success() {
        bail!("{}", result.message);
    }
    Ok(())
}
