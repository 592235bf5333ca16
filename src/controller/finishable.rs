//! Controllers that can stop their own run loop
//!
//! A [`FinishableReconciler`] returns an [`Outcome`]: the usual [`Action`]
//! plus a `finished` flag. When a reconcile reports `finished`, the
//! controller's run loop is cancelled and [`FinishableController::start`]
//! returns. The reconciler never touches the loop itself; the stop signal is
//! a child [`CancellationToken`] owned by the [`Finishable`] wrapper.

use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{Error, Result};

/// Result of a finishable reconcile
#[derive(Clone, Debug)]
pub struct Outcome {
    pub action: Action,
    /// Stop the controller that ran this reconcile
    pub finished: bool,
}

impl Outcome {
    pub fn finished() -> Self {
        Self::finished_if(true)
    }

    pub fn finished_if(finished: bool) -> Self {
        Self {
            action: Action::await_change(),
            finished,
        }
    }
}

impl From<Action> for Outcome {
    fn from(action: Action) -> Self {
        Self {
            action,
            finished: false,
        }
    }
}

#[async_trait]
pub trait FinishableReconciler<K: Send + Sync + 'static>: Send + Sync + 'static {
    async fn reconcile(&self, obj: Arc<K>) -> Result<Outcome>;

    fn error_policy(&self, _obj: Arc<K>, _error: &Error) -> Action {
        Action::requeue(Duration::from_secs(5))
    }
}

/// Wraps a reconciler and cancels `stop` once it reports `finished`
pub struct Finishable<R> {
    reconciler: Arc<R>,
    stop: CancellationToken,
}

impl<R> Finishable<R> {
    pub fn new(reconciler: Arc<R>, stop: CancellationToken) -> Self {
        Self { reconciler, stop }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub async fn reconcile<K>(&self, obj: Arc<K>) -> Result<Action>
    where
        K: Send + Sync + 'static,
        R: FinishableReconciler<K>,
    {
        let outcome = self.reconciler.reconcile(obj).await?;
        if outcome.finished {
            // Cancelling an already cancelled token is a no-op.
            self.stop.cancel();
        }
        Ok(outcome.action)
    }

    pub fn error_policy<K>(&self, obj: Arc<K>, error: &Error) -> Action
    where
        K: Send + Sync + 'static,
        R: FinishableReconciler<K>,
    {
        self.reconciler.error_policy(obj, error)
    }
}

/// Run `run_loop` with a stop token derived from `token`
///
/// The stop token is handed to the [`Finishable`] wrapper before the loop
/// starts and is cancelled on every exit path, including when `run_loop`
/// returns an error without the reconciler ever finishing.
pub async fn run_finishable<R, F, Fut>(
    token: &CancellationToken,
    reconciler: Arc<R>,
    run_loop: F,
) -> Result<()>
where
    F: FnOnce(Arc<Finishable<R>>, CancellationToken) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let stop = token.child_token();
    let _stop_guard = stop.clone().drop_guard();

    let finishable = Arc::new(Finishable::new(reconciler, stop.clone()));
    run_loop(finishable, stop).await
}

/// A kube-rs controller driven by a [`FinishableReconciler`]
pub struct FinishableController<K, R>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    name: String,
    controller: Controller<K>,
    reconciler: Arc<R>,
}

impl<K, R> FinishableController<K, R>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Debug + Unpin,
    R: FinishableReconciler<K>,
{
    pub fn new(name: impl Into<String>, api: Api<K>, config: Config, reconciler: R) -> Self {
        Self {
            name: name.into(),
            controller: Controller::new(api, config),
            reconciler: Arc::new(reconciler),
        }
    }

    /// Also trigger reconciles for objects owned by `K`
    pub fn owns<Child>(mut self, api: Api<Child>, config: Config) -> Self
    where
        Child: Clone + Resource<DynamicType = ()> + DeserializeOwned + Debug + Send + 'static,
    {
        self.controller = self.controller.owns(api, config);
        self
    }

    /// Also trigger reconciles for related objects selected by `mapper`
    pub fn watches<Other, I>(
        mut self,
        api: Api<Other>,
        config: Config,
        mapper: impl Fn(Other) -> I + Sync + Send + 'static,
    ) -> Self
    where
        Other: Clone + Resource + DeserializeOwned + Debug + Send + 'static,
        Other::DynamicType: Default + Debug + Clone + Eq + Hash,
        I: 'static + IntoIterator<Item = ObjectRef<K>>,
        I::IntoIter: Send,
    {
        self.controller = self.controller.watches(api, config, mapper);
        self
    }

    /// Run until the reconciler finishes or `token` is cancelled
    pub async fn start(self, token: CancellationToken) -> Result<()> {
        let Self {
            name,
            controller,
            reconciler,
        } = self;

        info!(controller = %name, "Starting finishable controller");

        run_finishable(&token, reconciler, |finishable, stop| async move {
            controller
                .graceful_shutdown_on(async move { stop.cancelled().await })
                .run(
                    |obj: Arc<K>, ctx: Arc<Finishable<R>>| async move { ctx.reconcile(obj).await },
                    |obj: Arc<K>, err: &Error, ctx: Arc<Finishable<R>>| ctx.error_policy(obj, err),
                    finishable,
                )
                .for_each(|res| async move {
                    match res {
                        Ok((obj, _)) => debug!(object = ?obj, "Reconciled"),
                        Err(e) => error!(error = %e, "Reconcile error"),
                    }
                })
                .await;
            Ok(())
        })
        .await?;

        info!(controller = %name, "Finishable controller stopped");
        Ok(())
    }
}
