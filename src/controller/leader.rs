//! Lease-based leader election
//!
//! Only one replica runs the leader-elected runnables at a time. The elector
//! publishes its current leadership on a `watch` channel that the
//! [`Manager`](super::manager::Manager) follows.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;

pub const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct LeaderElector {
    leases: Api<Lease>,
    namespace: String,
    lease_name: String,
    identity: String,
}

impl LeaderElector {
    pub fn new(
        client: Client,
        namespace: impl Into<String>,
        lease_name: impl Into<String>,
        identity: impl Into<String>,
    ) -> Self {
        let namespace = namespace.into();
        Self {
            leases: Api::namespaced(client, &namespace),
            namespace,
            lease_name: lease_name.into(),
            identity: identity.into(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Keep acquiring or renewing the lease until `token` is cancelled
    ///
    /// `leading` is set to `true` while the lease is held and back to `false`
    /// on loss or on an API error.
    pub async fn run(self, leading: watch::Sender<bool>, token: CancellationToken) -> Result<()> {
        loop {
            let wait = match self.try_acquire_or_renew().await {
                Ok(true) => {
                    if leading.send_if_modified(|held| !std::mem::replace(held, true)) {
                        info!(lease = %self.lease_name, identity = %self.identity, "Acquired leadership");
                    }
                    RENEW_INTERVAL
                }
                Ok(false) => {
                    if leading.send_if_modified(|held| std::mem::replace(held, false)) {
                        warn!(lease = %self.lease_name, "Lost leadership");
                    }
                    RETRY_INTERVAL
                }
                Err(e) => {
                    warn!(lease = %self.lease_name, error = %e, "Leader election error");
                    leading.send_if_modified(|held| std::mem::replace(held, false));
                    RETRY_INTERVAL
                }
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        debug!(lease = %self.lease_name, "Leader election stopped");
        Ok(())
    }

    async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = Utc::now();

        let existing = match self.leases.get_opt(&self.lease_name).await? {
            Some(lease) => lease,
            None => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(self.lease_name.clone()),
                        namespace: Some(self.namespace.clone()),
                        ..Default::default()
                    },
                    spec: Some(LeaseSpec {
                        holder_identity: Some(self.identity.clone()),
                        acquire_time: Some(MicroTime(now)),
                        renew_time: Some(MicroTime(now)),
                        lease_duration_seconds: Some(LEASE_DURATION_SECS),
                        ..Default::default()
                    }),
                };
                self.leases.create(&PostParams::default(), &lease).await?;
                info!(lease = %self.lease_name, holder = %self.identity, "Created lease");
                return Ok(true);
            }
        };

        let spec = existing.spec.unwrap_or_default();
        let current_holder = spec.holder_identity.as_deref();

        let patch = if current_holder == Some(self.identity.as_str()) {
            renew_patch(now)
        } else if lease_expired(&spec, now) {
            info!(lease = %self.lease_name, previous = ?current_holder, "Lease expired, taking over");
            takeover_patch(
                &self.identity,
                existing.metadata.resource_version.as_deref(),
                now,
            )
        } else {
            return Ok(false);
        };

        match self
            .leases
            .patch(&self.lease_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(true),
            // Another replica wrote the lease first.
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(lease = %self.lease_name, "Lease changed concurrently, not taking over");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn renew_patch(now: DateTime<Utc>) -> serde_json::Value {
    serde_json::json!({
        "spec": {
            "renewTime": MicroTime(now),
            "leaseDurationSeconds": LEASE_DURATION_SECS,
        }
    })
}

/// Merge patch claiming an expired lease
///
/// Carries the observed resourceVersion so that of two replicas racing for
/// the same expired lease, the slower one gets a conflict.
fn takeover_patch(
    identity: &str,
    resource_version: Option<&str>,
    now: DateTime<Utc>,
) -> serde_json::Value {
    serde_json::json!({
        "metadata": {
            "resourceVersion": resource_version,
        },
        "spec": {
            "holderIdentity": identity,
            "acquireTime": MicroTime(now),
            "renewTime": MicroTime(now),
            "leaseDurationSeconds": LEASE_DURATION_SECS,
        }
    })
}

/// Whether a lease may be taken over at `now`
///
/// A lease that was never renewed counts as expired.
pub(crate) fn lease_expired(spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
    let Some(renew) = spec.renew_time.as_ref() else {
        return true;
    };
    let duration = spec.lease_duration_seconds.unwrap_or(LEASE_DURATION_SECS);
    now > renew.0 + chrono::Duration::seconds(i64::from(duration))
}

/// Identity this replica uses as lease holder
pub fn holder_identity() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string())
    })
}
