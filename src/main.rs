use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use ssp_operator::controller::{
    self, holder_identity, required_crds, run_supervisor, KubeCrdSource, LeaderElector,
    ManagedController, ManagerConfig, ServiceController, VmController,
};
use ssp_operator::Error;
use tokio_util::sync::CancellationToken;
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
    /// Run the operator
    Run(RunArgs),
    /// Show version information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Namespace of the operator's own objects
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "kubevirt")]
    namespace: String,

    /// Only run controllers while holding the leader lease
    #[arg(long, env = "LEADER_ELECT")]
    leader_elect: bool,

    /// Name of the leader election Lease
    #[arg(long, env = "LEASE_NAME", default_value = "ssp-operator-leader")]
    lease_name: String,

    /// Block until every required CRD exists before starting controllers
    #[arg(long, env = "WAIT_FOR_CRDS")]
    wait_for_crds: bool,

    /// Seconds to wait for controllers to stop before aborting them
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value_t = 30)]
    shutdown_grace_secs: u64,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("SSP Operator v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json.then(|| fmt::layer().json().with_target(true)))
        .with((!json).then(|| fmt::layer().with_target(true)))
        .init();
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.log_json);

    info!("Starting SSP Operator v{}", env!("CARGO_PKG_VERSION"));

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    info!("Connected to Kubernetes cluster");

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            match wait_for_shutdown_signal().await {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => {
                    warn!(error = %e, "Failed to install signal handlers");
                    return;
                }
            }
            token.cancel();
        });
    }

    let controllers: Vec<Box<dyn ManagedController>> = vec![
        Box::new(ServiceController::new(client.clone(), args.namespace.clone())),
        Box::new(VmController::new(client.clone())),
    ];

    if args.wait_for_crds {
        controller::wait_for_crds(client.clone(), required_crds(&controllers), token.clone())
            .await?;
        if token.is_cancelled() {
            return Ok(());
        }
        info!("All required CRDs exist");
    }

    let leader_elector = args.leader_elect.then(|| {
        let identity = holder_identity();
        info!(identity = %identity, lease = %args.lease_name, "Leader election enabled");
        LeaderElector::new(client.clone(), &args.namespace, &args.lease_name, identity)
    });

    let config = ManagerConfig {
        shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        leader_elector,
    };

    let source = Arc::new(KubeCrdSource::new(client));
    if let Err(e) = run_supervisor(source, controllers, config, &token).await {
        error!(error = %e, "Operator stopped with an error");
        return Err(e);
    }

    if !token.is_cancelled() {
        info!("CRD availability changed, exiting so the operator restarts");
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
