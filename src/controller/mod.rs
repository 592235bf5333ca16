//! Controllers and the machinery that runs them
//!
//! The supervisor tracks optional CRDs through a [`CrdWatch`] and runs every
//! controller as a [`Runnable`] under one [`Manager`]. A change in CRD
//! availability ends the run so the operator restarts.

pub mod crd_controller;
pub mod crd_watch;
#[cfg(test)]
mod crd_watch_test;
pub mod finishable;
pub mod leader;
pub mod manager;
mod resources;
#[cfg(test)]
mod resources_test;
pub mod service_controller;
pub mod supervisor;
#[cfg(test)]
pub(crate) mod test_support;
pub mod vm_controller;

pub use crd_controller::{wait_for_crds, WaitForCrds};
pub use crd_watch::{CrdEvent, CrdHandler, CrdList, CrdSource, CrdWatch, KubeCrdSource};
pub use finishable::{
    run_finishable, Finishable, FinishableController, FinishableReconciler, Outcome,
};
pub use leader::{holder_identity, LeaderElector};
pub use manager::{Manager, ManagerConfig, Runnable, RunnableFn};
pub use resources::{apply_object, FIELD_MANAGER, OPERATOR_NAME};
pub use service_controller::ServiceController;
pub use supervisor::{required_crds, run_supervisor, setup_manager, ManagedController};
pub use vm_controller::VmController;
