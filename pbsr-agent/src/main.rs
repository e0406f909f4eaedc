//! pbsr-agent: declarative configuration for Proxmox Backup Server.
//!
//! - `plan` shows what `apply` would change
//! - `apply` converges the server to the manifest and prunes resources the
//!   manifest no longer declares
//! - `destroy` removes every resource the agent manages

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use pbsr_agent::{
    Agent, AgentAuditLogger, ApplyReport, HttpClient, HttpClientConfig, Manifest, StateStore,
};
use pbsr_engine::{Backoff, ReconcileSettings, RetryPolicy, SettlePolicy};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// pbsr Agent
#[derive(Parser, Debug)]
#[command(name = "pbsr-agent", version, about)]
struct Args {
    /// Server endpoint (e.g., https://pbs.example.com:8007)
    #[arg(long, env = "PBS_ENDPOINT", global = true)]
    endpoint: Option<String>,

    /// API token (user@realm!token:secret)
    #[arg(long, env = "PBS_API_TOKEN", hide_env_values = true, global = true)]
    api_token: Option<String>,

    /// Accept self-signed server certificates
    #[arg(long, env = "PBS_INSECURE", global = true)]
    insecure: bool,

    /// State file holding digests and managed resources
    #[arg(long, default_value = "pbsr-state.json", global = true)]
    state_file: PathBuf,

    /// Append an audit record of every mutation to this file (JSON lines)
    #[arg(long, global = true)]
    audit_log: Option<PathBuf>,

    /// Upper bound for one server task, in seconds
    #[arg(long, default_value = "300", global = true)]
    task_timeout_secs: u64,

    /// Interval between task status polls, in milliseconds
    #[arg(long, default_value = "2000", global = true)]
    poll_interval_ms: u64,

    /// Reads after a mutation before giving up on visibility
    #[arg(long, default_value = "10", global = true)]
    settle_attempts: u32,

    /// Attempts for a create that hits lock contention
    #[arg(long, default_value = "3", global = true)]
    create_attempts: u32,

    /// Base delay of the linear create backoff, in milliseconds
    #[arg(long, default_value = "2000", global = true)]
    retry_base_delay_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the changes apply would make
    Plan {
        /// Manifest of desired resources
        #[arg(long, short)]
        manifest: PathBuf,
    },
    /// Converge the server to the manifest
    Apply {
        /// Manifest of desired resources
        #[arg(long, short)]
        manifest: PathBuf,

        /// Delete and recreate resources whose immutable fields changed
        #[arg(long)]
        allow_replace: bool,
    },
    /// Remove every managed resource
    Destroy,
}

impl Args {
    fn settings(&self) -> Result<ReconcileSettings> {
        if self.settle_attempts == 0 || self.create_attempts == 0 {
            bail!("--settle-attempts and --create-attempts must be at least 1");
        }

        let defaults = ReconcileSettings::default();
        Ok(ReconcileSettings {
            task_timeout: Duration::from_secs(self.task_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            create_retry: RetryPolicy {
                max_attempts: self.create_attempts,
                backoff: Backoff::Linear(Duration::from_millis(self.retry_base_delay_ms)),
                ..defaults.create_retry
            },
            settle: SettlePolicy {
                max_attempts: self.settle_attempts,
                ..defaults.settle
            },
        })
    }

    fn client(&self) -> Result<HttpClient> {
        let endpoint = self
            .endpoint
            .clone()
            .context("No endpoint given (--endpoint or PBS_ENDPOINT)")?;
        let api_token = self
            .api_token
            .clone()
            .context("No API token given (--api-token or PBS_API_TOKEN)")?;

        let mut config = HttpClientConfig::new(endpoint, api_token);
        config.insecure = self.insecure;
        HttpClient::new(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "pbsr_agent=info,pbsr_engine=info,reqwest=warn,hyper=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let settings = args.settings()?;
    let client = args.client()?;

    info!("Starting pbsr-agent");
    info!("Endpoint: {}", args.endpoint.as_deref().unwrap_or_default());
    if args.insecure {
        warn!("TLS certificate verification is disabled");
    }

    let audit = Arc::new(match &args.audit_log {
        Some(path) => AgentAuditLogger::new(path),
        None => AgentAuditLogger::new_noop(),
    });
    let agent = Agent::new(Arc::new(client), settings, audit);

    let store = StateStore::new(&args.state_file);
    let mut state = store.load().await?;

    // Ctrl-C cancels every in-flight wait
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling in-flight operations");
                cancel.cancel();
            }
        });
    }

    match &args.command {
        Command::Plan { manifest } => {
            let manifest = Manifest::load(manifest).await?;
            let report = agent.plan(&manifest, &state).await;
            print!("{}", report);
            if !report.has_changes() {
                println!("No changes.");
            }
            if report.has_errors() {
                bail!("Plan failed for some resources");
            }
        }
        Command::Apply {
            manifest,
            allow_replace,
        } => {
            let manifest = Manifest::load(manifest).await?;
            info!(resources = manifest.len(), "Applying manifest");
            let report = agent
                .apply(&manifest, &mut state, *allow_replace, &cancel)
                .await;
            store.save(&state).await?;
            finish(&report)?;
        }
        Command::Destroy => {
            info!(resources = state.len(), "Destroying managed resources");
            let report = agent.destroy(&mut state, &cancel).await;
            store.save(&state).await?;
            finish(&report)?;
        }
    }

    Ok(())
}

fn finish(report: &ApplyReport) -> Result<()> {
    for resource in &report.resources {
        println!("{}", resource);
    }
    match report.failures() {
        0 => Ok(()),
        n => bail!("{} of {} resources failed", n, report.resources.len()),
    }
}
