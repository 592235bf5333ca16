//! Composition of the CRD watch with the operator's controllers
//!
//! The supervisor collects the CRDs every controller depends on, initializes
//! a single [`CrdWatch`] over their union and registers it next to the
//! controllers. Any change in CRD availability (the last missing CRD
//! appearing, or a required CRD going away) cancels the top-level token so
//! the process exits and is restarted with a fresh view of the cluster.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::crd_watch::{CrdList, CrdSource, CrdWatch};
use super::manager::{Manager, ManagerConfig, Runnable};
use crate::error::Result;

/// A unit of work the supervisor registers with the manager
pub trait ManagedController: Send {
    fn name(&self) -> &str;

    /// CRDs this controller needs to do its work
    fn required_crds(&self) -> Vec<String>;

    /// Register runnables with `manager`
    ///
    /// `crds` is already initialized. A controller whose CRDs are missing
    /// should register nothing, or only the parts that do not depend on them.
    fn add_to_manager(self: Box<Self>, manager: &mut Manager, crds: Arc<dyn CrdList>)
        -> Result<()>;
}

/// Sorted union of the CRDs required by `controllers`
pub fn required_crds(controllers: &[Box<dyn ManagedController>]) -> Vec<String> {
    controllers
        .iter()
        .flat_map(|controller| controller.required_crds())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Keeps a [`CrdWatch`] following the cluster for the process lifetime
struct CrdWatchRunnable {
    watch: Arc<CrdWatch>,
    source: Arc<dyn CrdSource>,
}

#[async_trait]
impl Runnable for CrdWatchRunnable {
    async fn start(self: Box<Self>, token: CancellationToken) -> Result<()> {
        self.watch.start(self.source.as_ref(), token).await
    }

    // Every replica restarts on CRD changes, not only the leader.
    fn need_leader_election(&self) -> bool {
        false
    }
}

/// Build a manager running the CRD watch and all `controllers`
///
/// Fails if the initial CRD listing fails or a controller cannot be
/// registered. Missing CRDs are logged but do not fail setup.
pub async fn setup_manager(
    source: Arc<dyn CrdSource>,
    controllers: Vec<Box<dyn ManagedController>>,
    config: ManagerConfig,
    token: &CancellationToken,
) -> Result<Manager> {
    let required = required_crds(&controllers);
    let watch = Arc::new(CrdWatch::new(required));

    let restart = token.clone();
    watch.set_all_crds_added_handler(move || {
        info!("All required CRDs are present, restarting");
        restart.cancel();
    });
    let restart = token.clone();
    watch.set_some_crd_removed_handler(move || {
        info!("A required CRD was removed, restarting");
        restart.cancel();
    });

    watch.init(source.as_ref()).await?;

    let missing = watch.missing_crds();
    if !missing.is_empty() {
        error!(
            missing_crds = ?missing,
            "Some required crds are missing. The operator will not create any new resources."
        );
    }

    let mut manager = Manager::new(config);
    manager.add(
        "crd-watch",
        CrdWatchRunnable {
            watch: watch.clone(),
            source,
        },
    );

    let crds: Arc<dyn CrdList> = watch;
    for controller in controllers {
        let name = controller.name().to_string();
        info!(controller = %name, "Adding controller");
        if let Err(e) = controller.add_to_manager(&mut manager, crds.clone()) {
            error!(controller = %name, error = %e, "Failed to add controller");
            return Err(e);
        }
    }

    Ok(manager)
}

/// Run the supervisor until `token` is cancelled or CRD availability changes
///
/// Returns `Ok(())` after a CRD-driven restart request; the caller is
/// expected to exit so the process is restarted.
pub async fn run_supervisor(
    source: Arc<dyn CrdSource>,
    controllers: Vec<Box<dyn ManagedController>>,
    config: ManagerConfig,
    token: &CancellationToken,
) -> Result<()> {
    let supervisor_token = token.child_token();
    let _guard = supervisor_token.clone().drop_guard();

    let manager = setup_manager(source, controllers, config, &supervisor_token).await?;
    info!(runnables = manager.len(), "Starting manager");
    manager.start(supervisor_token).await
}
