//! Shared helpers for objects the operator writes
//!
//! All writes go through [`apply_object`], a server-side apply owned by the
//! operator's field manager.

use std::collections::BTreeMap;
use std::fmt::Debug;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, Patch, PatchParams};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::error::{Error, Result};

pub const FIELD_MANAGER: &str = "ssp-operator";
pub const OPERATOR_NAME: &str = "ssp-operator";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";
pub const VERSION_LABEL: &str = "app.kubernetes.io/version";
pub const PART_OF_LABEL: &str = "app.kubernetes.io/part-of";

/// Server-side apply `desired`, taking ownership of conflicting fields
#[instrument(skip(api, desired), fields(name = %desired.name_any(), namespace = desired.namespace()))]
pub async fn apply_object<K>(api: &Api<K>, desired: &K) -> Result<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Debug,
{
    let name = desired
        .meta()
        .name
        .clone()
        .ok_or_else(|| Error::ConfigError(format!("{} without a name", K::kind(&()))))?;

    let applied = api
        .patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(desired))
        .await?;
    debug!(kind = %K::kind(&()), "Applied object");
    Ok(applied)
}

/// Labels on every object created by a given operator component
///
/// `part_of` is copied from the operator Deployment when it carries one.
pub fn standard_labels(
    managed_by: &str,
    component: &str,
    part_of: Option<&str>,
) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), managed_by.to_string());
    labels.insert(COMPONENT_LABEL.to_string(), component.to_string());
    labels.insert(
        VERSION_LABEL.to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
    );
    if let Some(part_of) = part_of.filter(|value| !value.is_empty()) {
        labels.insert(PART_OF_LABEL.to_string(), part_of.to_string());
    }
    labels
}

/// Non-controlling OwnerReference so objects are collected with the operator
pub fn owner_reference(deployment: &Deployment) -> OwnerReference {
    OwnerReference {
        api_version: Deployment::api_version(&()).to_string(),
        kind: Deployment::kind(&()).to_string(),
        name: deployment.name_any(),
        uid: deployment.metadata.uid.clone().unwrap_or_default(),
        controller: None,
        block_owner_deletion: None,
    }
}
