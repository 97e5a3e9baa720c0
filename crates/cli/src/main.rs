//! ServiceMonitor Scale CLI
//!
//! Operator tooling around the ServiceMonitor controller: probe a Service's
//! metrics endpoints, preview a reconciliation pass, run one by hand and
//! list the ServiceMonitors in the cluster.

mod commands;
mod config;
mod output;
mod session;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use commands::{monitors, plan, probe, reconcile};
use controller_lib::config::keys;
use controller_lib::ReconcileConfig;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// ServiceMonitor Scale CLI
#[derive(Parser)]
#[command(name = "smscale")]
#[command(author, version, about = "CLI for ServiceMonitor Scale", long_about = None)]
pub struct Cli {
    /// Path to kubeconfig file (uses default if not specified)
    #[arg(long, env = "KUBECONFIG", global = true)]
    pub kubeconfig: Option<String>,

    /// Output format (defaults to the config file setting, else table)
    #[arg(long, short, global = true)]
    pub format: Option<output::OutputFormat>,

    /// Enable verbose output
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(flatten)]
    pub settings: ReconcileArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Reconciliation settings, shared with the controller's environment
#[derive(Args, Debug, Default)]
pub struct ReconcileArgs {
    /// Scrape interval written to monitor endpoints
    #[arg(long, env = "SMSCALE_SCRAPE_INTERVAL", global = true)]
    pub interval: Option<String>,

    /// Comma-separated namespaces whose Services are reconciled (`*` for all)
    #[arg(long, env = "SMSCALE_SERVICE_NAMESPACES", global = true)]
    pub service_namespaces: Option<String>,

    /// Namespace ServiceMonitors live in
    #[arg(long, env = "SMSCALE_MONITOR_NAMESPACE", global = true)]
    pub monitor_namespace: Option<String>,

    /// Comma-separated namespaceSelector override
    #[arg(long, env = "SMSCALE_SELECTOR_NAMESPACES", global = true)]
    pub selector_namespaces: Option<String>,

    /// Per-attempt probe timeout in seconds
    #[arg(long, env = "SMSCALE_PROBE_TIMEOUT_SECS", global = true)]
    pub probe_timeout: Option<u64>,

    /// Probe attempts per port
    #[arg(long, env = "SMSCALE_PROBE_ATTEMPTS", global = true)]
    pub probe_attempts: Option<u32>,
}

impl ReconcileArgs {
    pub fn to_config(&self) -> ReconcileConfig {
        let mut values: HashMap<&'static str, String> = HashMap::new();
        let mut set = |key: &'static str, value: Option<String>| {
            if let Some(value) = value {
                values.insert(key, value);
            }
        };
        set(keys::SCRAPE_INTERVAL, self.interval.clone());
        set(keys::SERVICE_NAMESPACES, self.service_namespaces.clone());
        set(keys::MONITOR_NAMESPACE, self.monitor_namespace.clone());
        set(keys::SELECTOR_NAMESPACES, self.selector_namespaces.clone());
        set(keys::PROBE_TIMEOUT_SECS, self.probe_timeout.map(|v| v.to_string()));
        set(keys::PROBE_ATTEMPTS, self.probe_attempts.map(|v| v.to_string()));

        ReconcileConfig::from_lookup(|key| values.get(key).cloned())
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Probe the metrics endpoints of a Service
    Probe {
        /// Service (format: namespace/name or just name)
        service: String,

        /// Probe this address instead of the Service's cluster address
        #[arg(long)]
        address: Option<String>,
    },

    /// Show what a reconciliation pass would change, without writing
    Plan {
        /// Service (format: namespace/name or just name)
        service: String,
    },

    /// Run one reconciliation pass for a Service
    Reconcile {
        /// Service (format: namespace/name or just name)
        service: String,
    },

    /// List ServiceMonitors
    Monitors {
        /// Namespace to list (defaults to the monitor namespace)
        #[arg(long, short)]
        namespace: Option<String>,
    },

    /// Show or change CLI defaults
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the current defaults
    Show,

    /// Change defaults
    Set {
        /// Namespace used for Services given without one
        #[arg(long)]
        namespace: Option<String>,

        /// Default output format
        #[arg(long)]
        default_format: Option<output::OutputFormat>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("debug,hyper=info,rustls=info"))
            .with_writer(std::io::stderr)
            .init();
    }

    if let Err(err) = run(cli).await {
        output::print_error(&format!("{:#}", err));
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let mut settings = config::Config::load()?;
    let format = cli.format.unwrap_or_else(|| settings.format());
    let reconcile = cli.settings.to_config();

    // Ctrl-C aborts an in-flight pass between store calls
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Commands::Probe { service, address } => {
            let key = session::service_key(&service, settings.namespace())?;
            let client = session::connect(cli.kubeconfig.as_deref()).await?;
            let prober = session::prober(&reconcile)?;
            probe::probe_service(client, &prober, &key, address.as_deref(), &cancel, format).await?;
        }
        Commands::Plan { service } => {
            let key = session::service_key(&service, settings.namespace())?;
            let client = session::connect(cli.kubeconfig.as_deref()).await?;
            let reconciler = session::reconciler(client, reconcile)?;
            plan::show_plan(&reconciler, &key, &cancel, format).await?;
        }
        Commands::Reconcile { service } => {
            let key = session::service_key(&service, settings.namespace())?;
            let client = session::connect(cli.kubeconfig.as_deref()).await?;
            let reconciler = session::reconciler(client, reconcile)?;
            reconcile::reconcile_service(&reconciler, &key, &cancel, format).await?;
        }
        Commands::Monitors { namespace } => {
            let namespace = namespace.unwrap_or_else(|| reconcile.monitor_namespace.clone());
            let client = session::connect(cli.kubeconfig.as_deref()).await?;
            monitors::list_monitors(client, &namespace, format).await?;
        }
        Commands::Config(ConfigCommands::Show) => {
            output::print_json(&settings)?;
        }
        Commands::Config(ConfigCommands::Set {
            namespace,
            default_format,
        }) => {
            if let Some(namespace) = namespace {
                settings.default_namespace = Some(namespace);
            }
            if let Some(default_format) = default_format {
                settings.default_format = default_format
                    .to_possible_value()
                    .map(|value| value.get_name().to_string());
            }
            let path = settings.save().context("Failed to save CLI configuration")?;
            output::print_success(&format!("Saved {}", path.display()));
        }
    }

    Ok(())
}
