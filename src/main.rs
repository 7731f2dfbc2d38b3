use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bigip_ctlr::bigip::BigIpClient;
use bigip_ctlr::config::{
    ControllerConfig, FileConfig, OrchestratorConfig, OrchestratorKind, Overrides,
};
use bigip_ctlr::controller::Controller;
use bigip_ctlr::observer::{
    KubernetesOrchestrator, MarathonOrchestrator, Orchestrator, StateObserver,
};
use bigip_ctlr::store::{FileStore, MemoryStore, StateStore};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller until interrupted
    Run(RunArgs),
    /// Run a single reconciliation cycle and exit
    Once(RunArgs),
    /// Show version information
    Version,
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// TOML config file; flags override its values
    #[arg(long, env = "BIGIP_CTLR_CONFIG")]
    config: Option<PathBuf>,

    /// Orchestrator to observe: marathon or kubernetes
    #[arg(long, env = "ORCHESTRATOR")]
    orchestrator: Option<OrchestratorKind>,

    /// Marathon URL, e.g. http://10.0.0.5:8080
    #[arg(long, env = "MARATHON_URL")]
    marathon_url: Option<String>,

    #[arg(long, env = "MARATHON_USERNAME")]
    marathon_username: Option<String>,

    #[arg(long, env = "MARATHON_PASSWORD", hide_env_values = true)]
    marathon_password: Option<String>,

    /// Kubernetes namespace to watch; all namespaces when unset
    #[arg(long, env = "K8S_NAMESPACE")]
    namespace: Option<String>,

    /// BIG-IP management URL
    #[arg(long, env = "BIGIP_URL")]
    bigip_url: Option<String>,

    #[arg(long, env = "BIGIP_USERNAME")]
    bigip_username: Option<String>,

    #[arg(long, env = "BIGIP_PASSWORD", hide_env_values = true)]
    bigip_password: Option<String>,

    /// Accept self-signed BIG-IP certificates
    #[arg(long, env = "BIGIP_INSECURE")]
    bigip_insecure: bool,

    /// BIG-IP partition to manage; repeat or separate with commas, '*' for all
    #[arg(long = "partition", env = "BIGIP_PARTITIONS", value_delimiter = ',')]
    partitions: Vec<String>,

    /// Seconds between orchestrator polls
    #[arg(long, env = "POLL_INTERVAL")]
    poll_interval: Option<u64>,

    /// Operations in flight at once within a phase
    #[arg(long, env = "WORKER_LIMIT")]
    worker_limit: Option<usize>,

    /// Remove services without healthy endpoints instead of keeping empty pools
    #[arg(long, env = "DRAIN_ON_EMPTY")]
    drain_on_empty: bool,

    /// Re-read the device every N cycles to repair drift (0 disables)
    #[arg(long, env = "DRIFT_CHECK_EVERY")]
    drift_check_every: Option<u64>,

    /// Persist the applied state to this file
    #[arg(long, env = "STATE_FILE")]
    state_file: Option<PathBuf>,

    /// Address of the REST API
    #[arg(long, env = "LISTEN")]
    listen: Option<SocketAddr>,

    /// Log planned operations without sending them
    #[arg(long, env = "DRY_RUN")]
    dry_run: bool,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl RunArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            orchestrator: self.orchestrator,
            marathon_url: self.marathon_url.clone(),
            marathon_username: self.marathon_username.clone(),
            marathon_password: self.marathon_password.clone(),
            namespace: self.namespace.clone(),
            bigip_url: self.bigip_url.clone(),
            bigip_username: self.bigip_username.clone(),
            bigip_password: self.bigip_password.clone(),
            bigip_insecure: self.bigip_insecure.then_some(true),
            partitions: self.partitions.clone(),
            poll_interval_secs: self.poll_interval,
            worker_limit: self.worker_limit,
            drain_on_empty: self.drain_on_empty.then_some(true),
            drift_check_every: self.drift_check_every,
            state_file: self.state_file.clone(),
            listen: self.listen,
            dry_run: self.dry_run.then_some(true),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("bigip-ctlr v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Run(run_args) => run_controller(run_args, false).await,
        Commands::Once(run_args) => run_controller(run_args, true).await,
    }
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true))
            .init(),
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = signal::ctrl_c() => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}

async fn run_controller(args: RunArgs, once: bool) -> anyhow::Result<()> {
    init_tracing(args.log_format);

    let file = match &args.config {
        Some(path) => FileConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => FileConfig::default(),
    };
    let config = ControllerConfig::resolve(file, args.overrides())?;

    info!("Starting bigip-ctlr v{}", env!("CARGO_PKG_VERSION"));

    let orchestrator: Arc<dyn Orchestrator> = match &config.orchestrator {
        OrchestratorConfig::Marathon(settings) => {
            info!("Observing Marathon at {}", settings.url);
            Arc::new(MarathonOrchestrator::new(settings)?)
        }
        OrchestratorConfig::Kubernetes(settings) => {
            let orchestrator = KubernetesOrchestrator::connect(settings).await?;
            info!("Connected to Kubernetes cluster");
            Arc::new(orchestrator)
        }
    };
    let traffic = Arc::new(BigIpClient::new(&config.bigip)?);
    let store: Box<dyn StateStore> = match &config.state_file {
        Some(path) => Box::new(FileStore::new(path)),
        None => Box::new(MemoryStore::new()),
    };

    let observer = StateObserver::new(
        orchestrator,
        config.observer_retry.clone(),
        config.partitions().clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    let mut controller = Controller::new(
        observer,
        traffic,
        store,
        config.controller.clone(),
        shutdown_rx.clone(),
    );

    if let Err(e) = controller.initialize().await {
        if once {
            return Err(e).context("initializing applied state");
        }
        error!("Initializing applied state failed, retrying each cycle: {}", e);
    }

    if once {
        let result = controller.run_cycle().await;
        if !result.is_converged() {
            anyhow::bail!(
                "cycle did not converge: {} failed, {} deferred, skipped: {}",
                result.failed.len(),
                result.deferred.len(),
                result.skip_reason.unwrap_or_else(|| "no".to_string())
            );
        }
        info!("Applied {} operations", result.applied.len());
        return Ok(());
    }

    #[cfg(feature = "rest-api")]
    {
        let health = controller.health();
        let listen = config.listen;
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = bigip_ctlr::rest_api::run_server(health, listen, shutdown).await {
                error!("REST API server error: {:?}", e);
            }
        });
    }

    controller.run(config.poll_interval).await;
    Ok(())
}
