//! VirtualMachine controller, active only while KubeVirt is installed
//!
//! Resolves the PersistentVolumeClaims (and bound PersistentVolumes) behind
//! each VM's volumes and reports their state.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::crd_watch::CrdList;
use super::manager::{Manager, RunnableFn};
use super::supervisor::ManagedController;
use crate::crd::{VirtualMachine, VIRTUAL_MACHINE_CRD};
use crate::error::{Error, Result};

pub const VM_CONTROLLER_NAME: &str = "vm-controller";

pub struct VmController {
    client: Client,
}

impl VmController {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl ManagedController for VmController {
    fn name(&self) -> &str {
        VM_CONTROLLER_NAME
    }

    fn required_crds(&self) -> Vec<String> {
        vec![VIRTUAL_MACHINE_CRD.to_string()]
    }

    fn add_to_manager(self: Box<Self>, manager: &mut Manager, crds: Arc<dyn CrdList>) -> Result<()> {
        if !crds.crd_exists(VIRTUAL_MACHINE_CRD) {
            info!(
                controller = VM_CONTROLLER_NAME,
                crd = VIRTUAL_MACHINE_CRD,
                "CRD not installed, controller inactive"
            );
            return Ok(());
        }

        let client = self.client;
        manager.add(
            VM_CONTROLLER_NAME,
            RunnableFn::new(move |token| run_vm_controller(client, token)),
        );
        Ok(())
    }
}

pub struct VmContext {
    pub client: Client,
}

async fn run_vm_controller(client: Client, token: CancellationToken) -> Result<()> {
    let vms: Api<VirtualMachine> = Api::all(client.clone());
    let ctx = Arc::new(VmContext { client });

    info!(controller = VM_CONTROLLER_NAME, "Starting VirtualMachine controller");

    Controller::new(vms, Config::default().any_semantic())
        .graceful_shutdown_on(async move { token.cancelled().await })
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!(object = ?obj, "Reconciled"),
                Err(e) => error!(error = %e, "Reconcile error"),
            }
        })
        .await;

    info!(controller = VM_CONTROLLER_NAME, "Stopped");
    Ok(())
}

#[instrument(skip(vm, ctx), fields(name = %vm.name_any(), namespace = vm.namespace()))]
async fn reconcile(vm: Arc<VirtualMachine>, ctx: Arc<VmContext>) -> Result<Action> {
    // Resources of a provisioning VM are still being created.
    if vm.is_provisioning() {
        debug!("VirtualMachine is provisioning, skipping");
        return Ok(Action::await_change());
    }

    let namespace = vm.namespace().unwrap_or_else(|| "default".to_string());
    let claims: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), &namespace);
    let volumes: Api<PersistentVolume> = Api::all(ctx.client.clone());

    for claim_name in vm.volume_claims() {
        let Some(pvc) = claims.get_opt(claim_name).await? else {
            warn!(claim = %claim_name, "PersistentVolumeClaim not found");
            continue;
        };

        let phase = pvc.status.as_ref().and_then(|status| status.phase.clone());
        let spec = pvc.spec.unwrap_or_default();

        let pv = match spec.volume_name.as_deref() {
            Some(volume_name) if !volume_name.is_empty() => volumes.get_opt(volume_name).await?,
            _ => None,
        };
        let pv_storage_class = pv
            .as_ref()
            .and_then(|pv| pv.spec.as_ref())
            .and_then(|spec| spec.storage_class_name.clone());

        info!(
            claim = %claim_name,
            phase = ?phase,
            storage_class = ?spec.storage_class_name,
            volume = ?spec.volume_name,
            volume_storage_class = ?pv_storage_class,
            "VirtualMachine volume"
        );
    }

    Ok(Action::await_change())
}

fn error_policy(vm: Arc<VirtualMachine>, error: &Error, _ctx: Arc<VmContext>) -> Action {
    error!(name = %vm.name_any(), error = %error, "VirtualMachine reconcile failed");

    let retry = if error.is_retriable() {
        Duration::from_secs(5)
    } else {
        Duration::from_secs(60)
    };
    Action::requeue(retry)
}
