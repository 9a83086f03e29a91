// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

use anyhow::{Context as _, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use gateport::{
    config::{Config, KubernetesOptions},
    constants::{
        DEFAULT_CONFIG_PATH, DEFAULT_SERVICE_NAME, DEFAULT_SERVICE_NAMESPACE,
        METRICS_SERVER_PORT, STANDALONE_LEASE_DURATION_SECS, STANDALONE_LEASE_RENEW_DEADLINE_SECS,
        STANDALONE_LEASE_RETRY_PERIOD_SECS, TOKIO_WORKER_THREADS,
    },
    context::Context,
    controller,
    labels::DEFAULT_IGNORE_KEY,
    leader_election::default_identity,
    metrics,
    version::BuildInfo,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Keeps an ingress gateway Service's ports in sync with Gateway declarations
#[derive(Debug, Parser)]
#[command(name = "gateport", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run with settings from a configuration file
    Manager(ManagerArgs),
    /// Run with settings from flags and environment
    Standalone(StandaloneArgs),
    /// Print build information
    Version {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Args)]
struct ManagerArgs {
    /// Path of the YAML configuration file
    #[arg(long, env = "GATEPORT_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[derive(Debug, Args)]
struct StandaloneArgs {
    /// Name of the ingress gateway Service
    #[arg(long, env = "SERVICE_NAME", default_value = DEFAULT_SERVICE_NAME)]
    service_name: String,

    /// Namespace of the ingress gateway Service
    #[arg(long, env = "NAMESPACE", default_value = DEFAULT_SERVICE_NAMESPACE)]
    namespace: String,

    /// Path to a kubeconfig file
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long)]
    context: Option<String>,

    /// Use the in-cluster service account
    #[arg(long)]
    in_cluster: bool,

    /// Ports always kept on the Service
    #[arg(long, value_delimiter = ',', default_value = "80,443,15021")]
    default_ports: Vec<u32>,

    /// Label or annotation key that excludes a Gateway
    #[arg(long, default_value = DEFAULT_IGNORE_KEY)]
    ignore_key: String,

    /// Run without a Lease (only safe with a single replica)
    #[arg(long)]
    no_leader_election: bool,

    /// Namespace for the leader election Lease (auto-detected if empty)
    #[arg(long, default_value = "")]
    leader_election_namespace: String,

    /// Port of the metrics endpoint
    #[arg(long, default_value_t = METRICS_SERVER_PORT)]
    metrics_port: u16,

    /// Disable the metrics endpoint
    #[arg(long)]
    no_metrics: bool,
}

/// Build the configuration for standalone mode.
fn standalone_config(args: &StandaloneArgs) -> Config {
    let mut config = Config::default();

    config.sync.service_name.clone_from(&args.service_name);
    config.sync.namespace.clone_from(&args.namespace);
    config.sync.default_ports.clone_from(&args.default_ports);
    config.sync.ignore_key.clone_from(&args.ignore_key);

    config.kubernetes = KubernetesOptions {
        kubeconfig: args.kubeconfig.clone(),
        context: args.context.clone(),
        in_cluster: args.in_cluster,
    };

    config.manager.leader_election = !args.no_leader_election;
    config
        .manager
        .leader_election_namespace
        .clone_from(&args.leader_election_namespace);
    config.manager.lease_duration_secs = STANDALONE_LEASE_DURATION_SECS;
    config.manager.renew_deadline_secs = STANDALONE_LEASE_RENEW_DEADLINE_SECS;
    config.manager.retry_period_secs = STANDALONE_LEASE_RETRY_PERIOD_SECS;

    config.metrics.enabled = !args.no_metrics;
    config.metrics.port = args.metrics_port;
    config
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match cli.command {
        Command::Version { json } => {
            let info = BuildInfo::current();
            if json {
                println!("{}", info.to_json()?);
            } else {
                println!("{info}");
            }
            return Ok(());
        }
        Command::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "gateport", &mut std::io::stdout());
            return Ok(());
        }
        Command::Manager(args) => Config::load(&args.config)?,
        Command::Standalone(args) => standalone_config(&args),
    };

    init_logging();
    config.validate()?;

    // Build Tokio runtime with custom thread names
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(TOKIO_WORKER_THREADS)
        .thread_name("gateport-controller")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(config))
}

/// Initialize logging
///
/// Respects `RUST_LOG` (default `info`) and `RUST_LOG_FORMAT` (`text` or `json`).
fn init_logging() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let log_format = std::env::var("RUST_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    match log_format.to_lowercase().as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_target(false)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_target(false)
                .with_ansi(true)
                .compact()
                .init();
        }
    }
}

async fn async_main(config: Config) -> Result<()> {
    let build = BuildInfo::current();
    info!(
        version = build.version,
        commit = build.git_commit,
        service = %format!("{}/{}", config.sync.namespace, config.sync.service_name),
        "Starting gateport controller"
    );

    debug!("Initializing Kubernetes client");
    let client = kube_client(&config.kubernetes).await?;
    debug!("Kubernetes client initialized successfully");

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let metrics_server = if config.metrics.enabled {
        let ip: IpAddr = config
            .metrics
            .bind_address
            .parse()
            .with_context(|| format!("invalid metrics bind address {}", config.metrics.bind_address))?;
        let addr = SocketAddr::new(ip, config.metrics.port);
        let token = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = metrics::serve(addr, token).await {
                error!(error = %e, "Metrics server failed");
            }
        }))
    } else {
        None
    };

    let ctx = Arc::new(Context::new(client, config, default_identity()));
    let result = controller::run(ctx, shutdown.clone()).await;

    // stop the metrics server on failures too
    shutdown.cancel();
    if let Some(handle) = metrics_server {
        if let Err(e) = handle.await {
            warn!(error = %e, "Metrics server task failed");
        }
    }

    result?;
    info!("Shutdown complete");
    Ok(())
}

/// Build a client: explicit kubeconfig, then in-cluster, then inference.
async fn kube_client(options: &KubernetesOptions) -> Result<Client> {
    let kube_options = KubeConfigOptions {
        context: options.context.clone(),
        ..Default::default()
    };

    let config = if let Some(path) = &options.kubeconfig {
        let kubeconfig = Kubeconfig::read_from(path)
            .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
        kube::Config::from_custom_kubeconfig(kubeconfig, &kube_options).await?
    } else if options.in_cluster {
        kube::Config::incluster()?
    } else if options.context.is_some() {
        kube::Config::from_kubeconfig(&kube_options).await?
    } else {
        kube::Config::infer().await?
    };

    Ok(Client::try_from(config)?)
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn watch_signals(shutdown: CancellationToken) {
    match shutdown_signal().await {
        Ok(signal) => info!(signal, "Received signal, initiating graceful shutdown"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signals"),
    }
    shutdown.cancel();
}

async fn shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            Ok("SIGINT")
        }
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod main_tests;
