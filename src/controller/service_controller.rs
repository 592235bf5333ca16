//! Keeps the operator's metrics Service in place
//!
//! At start the Service is applied with the operator Deployment as owner.
//! Afterwards the Service is watched and re-applied whenever it drifts from
//! the desired state or is deleted.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::Api;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::crd_watch::CrdList;
use super::manager::{Manager, RunnableFn};
use super::resources::{apply_object, owner_reference, standard_labels, OPERATOR_NAME, PART_OF_LABEL};
use super::supervisor::ManagedController;
use crate::error::{Error, Result};

pub const SERVICE_CONTROLLER_NAME: &str = "service-controller";
pub const METRICS_SERVICE_NAME: &str = "ssp-operator-metrics";
pub const METRICS_PORT_NAME: &str = "metrics";
pub const SERVICE_MANAGED_BY: &str = "ssp-operator-services";
pub const PROMETHEUS_LABEL_KEY: &str = "prometheus.ssp.kubevirt.io";
pub const PROMETHEUS_LABEL_VALUE: &str = "true";

const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Desired metrics Service in `namespace`
pub fn metrics_service(namespace: &str, owner: Option<&Deployment>) -> Service {
    let part_of = owner
        .and_then(|deployment| deployment.metadata.labels.as_ref())
        .and_then(|labels| labels.get(PART_OF_LABEL))
        .map(String::as_str);

    let mut labels = standard_labels(SERVICE_MANAGED_BY, SERVICE_CONTROLLER_NAME, part_of);
    labels.insert(
        PROMETHEUS_LABEL_KEY.to_string(),
        PROMETHEUS_LABEL_VALUE.to_string(),
    );

    let selector = BTreeMap::from([
        (
            PROMETHEUS_LABEL_KEY.to_string(),
            PROMETHEUS_LABEL_VALUE.to_string(),
        ),
        ("name".to_string(), OPERATOR_NAME.to_string()),
    ]);

    Service {
        metadata: ObjectMeta {
            name: Some(METRICS_SERVICE_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            owner_references: owner.map(|deployment| vec![owner_reference(deployment)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            internal_traffic_policy: Some("Cluster".to_string()),
            ports: Some(vec![ServicePort {
                name: Some(METRICS_PORT_NAME.to_string()),
                port: 443,
                protocol: Some("TCP".to_string()),
                target_port: Some(IntOrString::String(METRICS_PORT_NAME.to_string())),
                ..Default::default()
            }]),
            selector: Some(selector),
            session_affinity: Some("None".to_string()),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

/// Whether `live` has drifted from `desired`
///
/// Extra labels and server-populated fields such as the cluster IP are not
/// drift. A Service that is being deleted is left alone.
pub fn needs_update(live: &Service, desired: &Service) -> bool {
    if live.metadata.deletion_timestamp.is_some() {
        return false;
    }

    let empty = BTreeMap::new();
    let live_labels = live.metadata.labels.as_ref().unwrap_or(&empty);
    let labels_match = desired
        .metadata
        .labels
        .iter()
        .flatten()
        .all(|(key, value)| live_labels.get(key) == Some(value));

    let owners_match = desired
        .metadata
        .owner_references
        .iter()
        .flatten()
        .all(|owner| {
            live.metadata
                .owner_references
                .iter()
                .flatten()
                .any(|live_owner| live_owner.uid == owner.uid)
        });

    let spec_match = match (&live.spec, &desired.spec) {
        (Some(live), Some(desired)) => {
            live.ports == desired.ports
                && live.selector == desired.selector
                && live.type_ == desired.type_
                && live.session_affinity == desired.session_affinity
                && live.internal_traffic_policy == desired.internal_traffic_policy
        }
        (_, None) => true,
        (None, Some(_)) => false,
    };

    !(labels_match && owners_match && spec_match)
}

pub struct ServiceController {
    client: Client,
    namespace: String,
}

impl ServiceController {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

impl ManagedController for ServiceController {
    fn name(&self) -> &str {
        SERVICE_CONTROLLER_NAME
    }

    fn required_crds(&self) -> Vec<String> {
        Vec::new()
    }

    fn add_to_manager(self: Box<Self>, manager: &mut Manager, _crds: Arc<dyn CrdList>) -> Result<()> {
        let ServiceController { client, namespace } = *self;
        manager.add(
            SERVICE_CONTROLLER_NAME,
            RunnableFn::new(move |token| run(client, namespace, token)),
        );
        Ok(())
    }
}

async fn run(client: Client, namespace: String, token: CancellationToken) -> Result<()> {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), &namespace);
    let deployment = deployments.get(OPERATOR_NAME).await.map_err(|e| {
        Error::ConfigError(format!(
            "error getting operator deployment {namespace}/{OPERATOR_NAME}: {e}"
        ))
    })?;

    let api: Api<Service> = Api::namespaced(client, &namespace);
    let desired = metrics_service(&namespace, Some(&deployment));
    apply_object(&api, &desired).await?;
    info!(service = METRICS_SERVICE_NAME, namespace = %namespace, "Metrics service applied");

    let config = watcher::Config::default().fields(&format!("metadata.name={METRICS_SERVICE_NAME}"));
    let mut events = watcher(api.clone(), config).default_backoff().boxed();
    let mut retry = RetryTimer::new(RETRY_INTERVAL);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = retry.expired() => {
                retry.settle(reapply(&api, &desired).await);
            }
            event = events.next() => match event {
                Some(Ok(watcher::Event::Apply(live) | watcher::Event::InitApply(live))) => {
                    if needs_update(&live, &desired) {
                        info!(service = METRICS_SERVICE_NAME, "Metrics service drifted, re-applying");
                        retry.settle(reapply(&api, &desired).await);
                    }
                }
                Some(Ok(watcher::Event::Delete(_))) => {
                    info!(service = METRICS_SERVICE_NAME, "Metrics service deleted, re-creating");
                    retry.settle(reapply(&api, &desired).await);
                }
                Some(Ok(watcher::Event::Init | watcher::Event::InitDone)) => {}
                Some(Err(e)) => warn!(error = %e, "Service watch error"),
                None => break,
            },
        }
    }

    info!(controller = SERVICE_CONTROLLER_NAME, "Stopped");
    Ok(())
}

/// Deadline for retrying a failed apply
///
/// Set only when an apply fails, so unrelated watch traffic does not push the
/// retry back.
struct RetryTimer {
    interval: Duration,
    deadline: Option<Instant>,
}

impl RetryTimer {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
        }
    }

    /// Record the result of an apply
    fn settle(&mut self, applied: bool) {
        self.deadline = if applied {
            None
        } else {
            // Keep an already scheduled retry in place.
            Some(self.deadline.unwrap_or_else(|| Instant::now() + self.interval))
        };
    }

    #[cfg(test)]
    fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolves once a scheduled retry is due; never while none is
    async fn expired(&mut self) {
        match self.deadline {
            Some(deadline) => {
                tokio::time::sleep_until(deadline).await;
                self.deadline = None;
            }
            None => std::future::pending().await,
        }
    }
}

async fn reapply(api: &Api<Service>, desired: &Service) -> bool {
    match apply_object(api, desired).await {
        Ok(_) => true,
        Err(e) => {
            error!(error = %e, "Failed to apply metrics service, retrying");
            false
        }
    }
}
