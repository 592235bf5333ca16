//! Init controller that waits until every required CRD is installed
//!
//! Runs as a [`FinishableController`] over CustomResourceDefinitions and
//! finishes once all required CRDs exist and none of them is being deleted.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::runtime::watcher::Config;
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::finishable::{FinishableController, FinishableReconciler, Outcome};
use crate::error::Result;

pub const INIT_CONTROLLER_NAME: &str = "init-controller";

pub struct WaitForCrds {
    api: Api<CustomResourceDefinition>,
    crds: RwLock<HashMap<String, bool>>,
}

impl WaitForCrds {
    pub fn new<I, S>(api: Api<CustomResourceDefinition>, required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let crds = required.into_iter().map(|crd| (crd.into(), false)).collect();
        Self {
            api,
            crds: RwLock::new(crds),
        }
    }

    /// Record whether `name` exists; returns true once all required CRDs do
    fn observe(&self, name: &str, exists: bool) -> bool {
        let mut crds = self.crds.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(seen) = crds.get_mut(name) {
            if *seen != exists {
                debug!(crd = %name, exists, "Required CRD changed");
            }
            *seen = exists;
        }
        crds.values().all(|exists| *exists)
    }

    pub fn all_crds_exist(&self) -> bool {
        self.crds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .all(|exists| *exists)
    }
}

/// A CRD that is being deleted counts as missing
fn is_live(crd: Option<&CustomResourceDefinition>) -> bool {
    crd.is_some_and(|crd| crd.metadata.deletion_timestamp.is_none())
}

#[async_trait]
impl FinishableReconciler<CustomResourceDefinition> for WaitForCrds {
    #[instrument(skip(self, crd), fields(name = %crd.name_any()))]
    async fn reconcile(&self, crd: Arc<CustomResourceDefinition>) -> Result<Outcome> {
        let name = crd.name_any();
        if !self
            .crds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&name)
        {
            return Ok(Outcome::finished_if(self.all_crds_exist()));
        }

        // Read through to the API server, the cached object may be stale.
        let current = self.api.get_opt(&name).await?;
        let finished = self.observe(&name, is_live(current.as_ref()));
        Ok(Outcome::finished_if(finished))
    }
}

/// Block until every CRD in `required` exists or `token` is cancelled
pub async fn wait_for_crds(
    client: Client,
    required: Vec<String>,
    token: CancellationToken,
) -> Result<()> {
    if required.is_empty() {
        return Ok(());
    }

    info!(crds = ?required, "Waiting for required CRDs");
    let api: Api<CustomResourceDefinition> = Api::all(client);
    let reconciler = WaitForCrds::new(api.clone(), required);

    FinishableController::new(INIT_CONTROLLER_NAME, api, Config::default(), reconciler)
        .start(token)
        .await
}
