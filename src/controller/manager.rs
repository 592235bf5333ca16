//! Registry of long-running background tasks
//!
//! Every task that lives as long as the operator (the CRD watch, each
//! controller) is registered with the [`Manager`] as a [`Runnable`]. All of
//! them share one cancellation token: the first runnable to fail cancels it,
//! and `Manager::start` returns once every task has exited.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::leader::LeaderElector;
use crate::error::{Error, Result};

pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// A task run by the [`Manager`] until its token is cancelled
#[async_trait]
pub trait Runnable: Send + 'static {
    async fn start(self: Box<Self>, token: CancellationToken) -> Result<()>;

    /// Whether the task may only run on the elected leader
    fn need_leader_election(&self) -> bool {
        true
    }
}

/// Adapts an async closure into a [`Runnable`]
pub struct RunnableFn<F> {
    run: F,
    need_leader_election: bool,
}

impl<F, Fut> RunnableFn<F>
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    pub fn new(run: F) -> Self {
        Self {
            run,
            need_leader_election: true,
        }
    }

    /// Run on every replica, leader or not
    pub fn without_leader_election(mut self) -> Self {
        self.need_leader_election = false;
        self
    }
}

#[async_trait]
impl<F, Fut> Runnable for RunnableFn<F>
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn start(self: Box<Self>, token: CancellationToken) -> Result<()> {
        (self.run)(token).await
    }

    fn need_leader_election(&self) -> bool {
        self.need_leader_election
    }
}

pub struct ManagerConfig {
    /// How long to wait for tasks after cancellation before aborting them
    pub shutdown_grace: Duration,
    /// When set, leader-elected runnables start only while holding the lease
    pub leader_elector: Option<LeaderElector>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            leader_elector: None,
        }
    }
}

type NamedRunnable = (String, Box<dyn Runnable>);
/// Outcome of a spawned runnable; the outer `Err` carries a panic message
type TaskResult = (String, std::result::Result<Result<()>, String>);

pub struct Manager {
    config: ManagerConfig,
    runnables: Vec<NamedRunnable>,
}

impl Manager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            runnables: Vec::new(),
        }
    }

    pub fn add<R: Runnable>(&mut self, name: impl Into<String>, runnable: R) {
        let name = name.into();
        debug!(runnable = %name, "Registered runnable");
        self.runnables.push((name, Box::new(runnable)));
    }

    pub fn len(&self) -> usize {
        self.runnables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runnables.is_empty()
    }

    pub fn runnable_names(&self) -> Vec<&str> {
        self.runnables.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Start every runnable and block until `token` is cancelled
    ///
    /// Returns the first runnable failure, if any. A runnable returning `Ok`
    /// early does not stop the others.
    pub async fn start(self, token: CancellationToken) -> Result<()> {
        let Manager { config, runnables } = self;
        let (elected, immediate): (Vec<_>, Vec<_>) = runnables
            .into_iter()
            .partition(|(_, runnable)| runnable.need_leader_election());

        let mut tasks: JoinSet<TaskResult> = JoinSet::new();
        spawn_all(&mut tasks, immediate, &token);

        let mut pending = Some(elected);
        let mut leadership = match config.leader_elector {
            Some(elector) => {
                let (tx, rx) = watch::channel(false);
                info!(identity = %elector.identity(), "Waiting for leadership");
                let elector_token = token.clone();
                tokio::spawn(async move {
                    if let Err(e) = elector.run(tx, elector_token).await {
                        error!(error = %e, "Leader election stopped");
                    }
                });
                Some(rx)
            }
            None => {
                if let Some(elected) = pending.take() {
                    spawn_all(&mut tasks, elected, &token);
                }
                None
            }
        };

        let mut first_error: Option<Error> = None;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                changed = leadership_changed(&mut leadership) => match changed {
                    Some(true) => {
                        if let Some(elected) = pending.take() {
                            info!(count = elected.len(), "Leadership acquired, starting leader-elected runnables");
                            spawn_all(&mut tasks, elected, &token);
                        }
                    }
                    Some(false) => {
                        if pending.is_none() {
                            error!("Leadership lost, stopping");
                            first_error.get_or_insert(Error::LeadershipLost);
                            token.cancel();
                        }
                    }
                    None => leadership = None,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Some(e) = task_failure(joined) {
                        first_error.get_or_insert(e);
                        token.cancel();
                    }
                }
            }
        }

        info!(running = tasks.len(), "Stopping runnables");
        let drained = tokio::time::timeout(config.shutdown_grace, async {
            while let Some(joined) = tasks.join_next().await {
                if let Some(e) = task_failure(joined) {
                    first_error.get_or_insert(e);
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                grace = ?config.shutdown_grace,
                "Runnables did not stop within the shutdown grace period, aborting"
            );
            tasks.abort_all();
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn spawn_all(
    tasks: &mut JoinSet<TaskResult>,
    runnables: Vec<NamedRunnable>,
    token: &CancellationToken,
) {
    for (name, runnable) in runnables {
        let token = token.clone();
        debug!(runnable = %name, "Starting runnable");
        tasks.spawn(async move {
            let result = AssertUnwindSafe(runnable.start(token))
                .catch_unwind()
                .await
                .map_err(panic_message);
            (name, result)
        });
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Log a finished task and turn a failure into the manager's error
fn task_failure(joined: std::result::Result<TaskResult, JoinError>) -> Option<Error> {
    match joined {
        Ok((name, Ok(Ok(())))) => {
            debug!(runnable = %name, "Runnable finished");
            None
        }
        Ok((name, Ok(Err(e)))) => {
            error!(runnable = %name, error = %e, "Runnable failed");
            Some(Error::RunnableError {
                name,
                message: e.to_string(),
            })
        }
        Ok((name, Err(panic))) => {
            error!(runnable = %name, panic = %panic, "Runnable panicked");
            Some(Error::RunnableError {
                name,
                message: format!("panicked: {panic}"),
            })
        }
        // Panics are caught inside the task, so only aborts end up here.
        Err(e) => {
            debug!(error = %e, "Runnable task aborted");
            None
        }
    }
}

/// Resolves on the next leadership change; `None` once the elector is gone
async fn leadership_changed(rx: &mut Option<watch::Receiver<bool>>) -> Option<bool> {
    match rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}
