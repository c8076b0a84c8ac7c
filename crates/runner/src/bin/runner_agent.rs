//! Runner agent binary.
//!
//! Pulls pod/PVC tasks from Codefresh and executes them against the
//! configured Kubernetes runtimes until SIGINT or SIGTERM.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, Subcommand};
use codefresh::{ClientOptions, CodefreshClient};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use runner::config::{self, RUNTIME_FILE_PATTERN};
use runner::telemetry::{self, LogFormat};
use runner::{server, Agent, AgentOptions, KubeCluster, KubernetesRuntime, Runtime};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Codefresh runner agent
#[derive(Parser)]
#[command(name = "runner-agent")]
#[command(about = "Pulls pod/PVC tasks from Codefresh and runs them on Kubernetes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the agent
    Start(StartArgs),
    /// Print the version
    Version,
}

#[derive(clap::Args)]
struct StartArgs {
    /// Codefresh API token
    #[arg(long, env = "CODEFRESH_TOKEN", hide_env_values = true)]
    codefresh_token: String,

    /// Codefresh API host
    #[arg(long, env = "CODEFRESH_HOST", default_value = codefresh::DEFAULT_HOST)]
    codefresh_host: String,

    /// ID of this agent as registered in Codefresh
    #[arg(long, env = "AGENT_ID")]
    agent_id: String,

    /// Directory with `*.runtime.yaml` files describing remote runtimes
    #[arg(long, env = "VENONA_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Serve a single runtime with this name from the agent's own cluster
    #[arg(long, env = "CODEFRESH_IN_CLUSTER_RUNTIME")]
    in_cluster_runtime: Option<String>,

    /// Port of the health endpoint
    #[arg(long, env = "PORT", default_value = "8080")]
    port: u16,

    /// Verify TLS certificates of Codefresh and remote clusters
    #[arg(
        long,
        env = "NODE_TLS_REJECT_UNAUTHORIZED",
        default_value = "true",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    tls_reject_unauthorized: bool,

    /// Enable debug logging
    #[arg(short, long, env = "VERBOSE")]
    verbose: bool,

    /// Log line format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Seconds between task polls
    #[arg(
        long,
        env = "TASK_PULLING_INTERVAL",
        default_value = "3",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    task_pulling_interval: u64,

    /// Seconds between status reports
    #[arg(
        long,
        env = "STATUS_REPORTING_INTERVAL",
        default_value = "10",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    status_reporting_interval: u64,

    /// Capacity of each workflow's task buffer
    #[arg(
        long,
        env = "WORKFLOW_BUFFER_SIZE",
        default_value = "20",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    workflow_buffer_size: u64,

    /// Remove finalizers from PVCs after deleting them
    #[arg(long, env = "FORCE_DELETE_PVC")]
    force_delete_pvc: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => start(args).await,
        Commands::Version => {
            println!("runner-agent {VERSION}");
            Ok(())
        }
    }
}

async fn start(args: StartArgs) -> Result<()> {
    telemetry::init(args.verbose, args.log_format);
    info!(version = VERSION, agent_id = %args.agent_id, "Starting runner agent");

    let runtimes = build_runtimes(&args).await?;
    info!(runtimes = ?runtimes.keys().collect::<Vec<_>>(), "Runtimes loaded");

    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("codefresh-runner/{VERSION}"))
            .context("Invalid User-Agent header")?,
    );
    let client = CodefreshClient::new(ClientOptions {
        host: Some(args.codefresh_host.clone()),
        token: args.codefresh_token.clone(),
        agent_id: args.agent_id.clone(),
        headers,
        accept_invalid_certs: !args.tls_reject_unauthorized,
        timeout: None,
    })
    .context("Failed to build Codefresh client")?;

    let mut opts = AgentOptions::new(args.agent_id.clone(), Arc::new(client), runtimes);
    opts.task_pulling_interval = Duration::from_secs(args.task_pulling_interval);
    opts.status_reporting_interval = Duration::from_secs(args.status_reporting_interval);
    opts.buffer_size = usize::try_from(args.workflow_buffer_size)
        .context("Workflow buffer size does not fit in memory")?;

    let agent = Arc::new(Agent::new(opts).context("Failed to build agent")?);
    agent.start().context("Failed to start agent")?;

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let (stop_server, server_stopped) = oneshot::channel::<()>();
    let mut server = tokio::spawn(server::run_server(Arc::clone(&agent), addr, async move {
        let _ = server_stopped.await;
    }));

    tokio::select! {
        () = shutdown_signal() => {}
        result = &mut server => {
            result.context("Health server task failed")?.context("Health server failed")?;
            return Ok(());
        }
    }

    info!("Received shutdown signal, waiting for running tasks to finish");
    if let Err(e) = agent.stop() {
        warn!(error = %e, "Agent was not running");
    }

    tokio::select! {
        () = agent.wait() => info!("All tasks finished"),
        () = shutdown_signal() => {
            warn!("Received second shutdown signal, exiting immediately");
            std::process::exit(1);
        }
    }

    let _ = stop_server.send(());
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Health server failed"),
        Err(e) => error!(error = %e, "Health server task failed"),
    }

    info!("Runner agent stopped");
    Ok(())
}

async fn build_runtimes(args: &StartArgs) -> Result<HashMap<String, Arc<dyn Runtime>>> {
    let mut runtimes: HashMap<String, Arc<dyn Runtime>> = HashMap::new();

    if let Some(name) = &args.in_cluster_runtime {
        let cluster = KubeCluster::in_cluster(args.force_delete_pvc)
            .context("Failed to build in-cluster Kubernetes client")?;
        runtimes.insert(
            name.clone(),
            Arc::new(KubernetesRuntime::new(Arc::new(cluster))),
        );
        return Ok(runtimes);
    }

    let Some(dir) = &args.config_dir else {
        warn!("Neither an in-cluster runtime nor a config dir was given");
        return Ok(runtimes);
    };

    let configs = config::load(dir, RUNTIME_FILE_PATTERN)
        .with_context(|| format!("Failed to load runtime configs from {}", dir.display()))?;

    for (path, config) in configs {
        match KubeCluster::remote(&config, !args.tls_reject_unauthorized, args.force_delete_pvc)
            .await
        {
            Ok(cluster) => {
                info!(runtime = %config.name, file = %path.display(), "Loaded runtime");
                let runtime: Arc<dyn Runtime> = Arc::new(KubernetesRuntime::new(Arc::new(cluster)));
                runtimes.entry(config.name).or_insert(runtime);
            }
            Err(e) => {
                error!(
                    file = %path.display(),
                    error = %e,
                    "Failed to build Kubernetes client for runtime"
                );
            }
        }
    }

    Ok(runtimes)
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
