//! wpod: the WordPress operator daemon.
//!
//! Single binary with two modes, each gated by its own leader lease:
//! - `run`: database placement, routing and site reconciliation
//! - `olm`: existence guards and per-namespace support objects
//!
//! # Usage
//!
//! ```text
//! wpod run --namespace svc0041t-wordpress --max-workers 10
//! wpod olm --cluster-wide --config /etc/wpod/wpod.toml --guard singletons.yaml
//! wpod config --config /etc/wpod/wpod.toml
//! ```

mod config;
mod olm;
mod operator;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use wpo_leader::LeaderExit;
use wpo_store::{KubeStore, ResourceStore};

use crate::config::OperatorConfig;

#[derive(Parser)]
#[command(name = "wpod", about = "WordPress operator daemon")]
struct Cli {
    /// Configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Args)]
struct ScopeArgs {
    /// Namespace to operate in.
    #[arg(long, env = "KUBERNETES_NAMESPACE")]
    namespace: Option<String>,

    /// Watch every namespace.
    #[arg(long)]
    cluster_wide: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile WordPress sites.
    Run {
        #[command(flatten)]
        scope: ScopeArgs,

        /// wp-cli executable.
        #[arg(long)]
        wp_cli: Option<PathBuf>,

        /// PHP interpreter for the install script.
        #[arg(long)]
        php: Option<PathBuf>,

        /// Script that installs WordPress and its theme.
        #[arg(long)]
        install_script: Option<PathBuf>,

        /// WordPress sources.
        #[arg(long)]
        wp_dir: Option<PathBuf>,

        /// Directory with the secrets the install script reads.
        #[arg(long)]
        secret_dir: Option<PathBuf>,

        /// Concurrent site reconciliations.
        #[arg(long)]
        max_workers: Option<usize>,

        /// Log WordPress commands instead of running them.
        #[arg(long)]
        dry_run: bool,
    },

    /// Keep operator-wide objects alive and provision site namespaces.
    Olm {
        #[command(flatten)]
        scope: ScopeArgs,

        /// Manifest of objects that must always exist. Repeatable.
        #[arg(long = "guard")]
        guards: Vec<PathBuf>,

        /// Manifest instantiated into every namespace with sites.
        #[arg(long)]
        namespaced_manifest: Option<PathBuf>,

        /// Namespace the namespaced manifest is written for.
        #[arg(long)]
        sample_namespace: Option<String>,
    },

    /// Print the configuration file merged with defaults, as TOML.
    Config,
}

impl ScopeArgs {
    fn apply(self, config: &mut OperatorConfig) {
        if self.namespace.is_some() {
            config.namespace = self.namespace;
        }
        config.cluster_wide |= self.cluster_wide;
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,wpod=debug,wpo=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut config = OperatorConfig::load(cli.config.as_deref())?;
    if let Command::Config = cli.command {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                cancel.cancel();
            }
        }
    });

    let store: Arc<dyn ResourceStore> = Arc::new(KubeStore::connect().await?);

    let exit = match cli.command {
        Command::Run {
            scope,
            wp_cli,
            php,
            install_script,
            wp_dir,
            secret_dir,
            max_workers,
            dry_run,
        } => {
            scope.apply(&mut config);
            let executor = &mut config.executor;
            for (flag, field) in [
                (wp_cli, &mut executor.wp_cli),
                (php, &mut executor.php),
                (install_script, &mut executor.install_script),
                (wp_dir, &mut executor.wp_dir),
                (secret_dir, &mut executor.secret_dir),
            ] {
                if let Some(value) = flag {
                    *field = value;
                }
            }
            executor.dry_run |= dry_run;
            if let Some(workers) = max_workers {
                config.controller.max_workers = workers;
            }
            operator::run_operator(store, &config, cancel).await?
        }
        Command::Olm {
            scope,
            guards,
            namespaced_manifest,
            sample_namespace,
        } => {
            scope.apply(&mut config);
            config.olm.guards.extend(guards);
            if namespaced_manifest.is_some() {
                config.olm.namespaced_manifest = namespaced_manifest;
            }
            if let Some(sample) = sample_namespace {
                config.olm.sample_namespace = sample;
            }
            olm::run_olm(store, &config, cancel).await?
        }
        Command::Config => return Ok(()),
    };

    if exit == LeaderExit::LostLease {
        error!("leader lease lost, exiting");
        std::process::exit(1);
    }
    info!("wpod stopped");
    Ok(())
}
