//! KubeVirt VirtualMachine, reduced to the fields the operator reads
//!
//! The CRD is owned and installed by KubeVirt. Unknown fields are ignored on
//! deserialization, so only what the VM controller inspects is modelled.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Name of the CustomResourceDefinition backing [`VirtualMachine`]
pub const VIRTUAL_MACHINE_CRD: &str = "virtualmachines.kubevirt.io";

/// `status.printableStatus` while the VM's resources are still being created
pub const PRINTABLE_STATUS_PROVISIONING: &str = "Provisioning";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "VirtualMachine",
    plural = "virtualmachines",
    namespaced,
    status = "VirtualMachineStatus",
    shortname = "vm"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_strategy: Option<String>,

    #[serde(default)]
    pub template: VirtualMachineInstanceTemplate,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct VirtualMachineInstanceTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<VirtualMachineInstanceSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct VirtualMachineInstanceSpec {
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_volume: Option<DataVolumeSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<PersistentVolumeClaimSource>,
}

impl Volume {
    /// Name of the PersistentVolumeClaim backing this volume, if any
    ///
    /// A DataVolume creates a claim with the same name.
    pub fn claim_name(&self) -> Option<&str> {
        if let Some(dv) = &self.data_volume {
            return Some(dv.name.as_str());
        }
        self.persistent_volume_claim
            .as_ref()
            .map(|pvc| pvc.claim_name.as_str())
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct DataVolumeSource {
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaimSource {
    pub claim_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub printable_status: Option<String>,

    #[serde(default)]
    pub ready: bool,
}

impl VirtualMachine {
    pub fn is_provisioning(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|status| status.printable_status.as_deref())
            == Some(PRINTABLE_STATUS_PROVISIONING)
    }

    /// Claim names of all PVC-backed volumes, in template order
    pub fn volume_claims(&self) -> Vec<&str> {
        self.spec
            .template
            .spec
            .iter()
            .flat_map(|spec| spec.volumes.iter())
            .filter_map(Volume::claim_name)
            .collect()
    }
}
