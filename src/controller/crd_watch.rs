//! Runtime tracking of optional CustomResourceDefinitions
//!
//! `CrdWatch` keeps a lock-guarded view of which CRDs exist in the cluster.
//! Controllers query it before touching a resource kind that may not be
//! installed, and the supervisor registers edge-triggered handlers that fire
//! when the set of required CRDs becomes complete or stops being complete.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::{future, StreamExt};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, ListParams};
use kube::runtime::{metadata_watcher, watcher, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Read-only view of the CRDs known to exist
///
/// Both methods panic when called on a `CrdWatch` that was never initialized.
pub trait CrdList: Send + Sync {
    fn crd_exists(&self, crd_name: &str) -> bool;
    fn missing_crds(&self) -> Vec<String>;
}

/// Callback fired on a transition of the missing set
pub type CrdHandler = Arc<dyn Fn() + Send + Sync>;

/// A change observed on the CRD feed
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CrdEvent {
    Added(String),
    Deleted(String),
    /// Complete set of CRD names, emitted whenever the feed (re)lists
    Relisted(Vec<String>),
}

/// Listing and subscription primitives backing a `CrdWatch`
#[async_trait]
pub trait CrdSource: Send + Sync {
    /// Names of every CRD currently present in the cluster
    async fn list_crds(&self) -> Result<Vec<String>>;

    /// Live feed of CRD additions and deletions
    async fn watch_crds(&self) -> Result<BoxStream<'static, Result<CrdEvent>>>;
}

/// `CrdSource` backed by the API server, reading only CRD metadata
#[derive(Clone)]
pub struct KubeCrdSource {
    api: Api<CustomResourceDefinition>,
}

impl KubeCrdSource {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl CrdSource for KubeCrdSource {
    async fn list_crds(&self) -> Result<Vec<String>> {
        let crds = self
            .api
            .list_metadata(&ListParams::default())
            .await
            .map_err(|e| Error::CrdListError(e.to_string()))?;

        Ok(crds.items.iter().map(|crd| crd.name_any()).collect())
    }

    async fn watch_crds(&self) -> Result<BoxStream<'static, Result<CrdEvent>>> {
        let events = metadata_watcher(self.api.clone(), watcher::Config::default())
            .default_backoff()
            .scan(Vec::new(), |relist: &mut Vec<String>, event| {
                let translated = match event {
                    Ok(event) => translate_event(relist, event_names(event)).map(Ok),
                    Err(e) => Some(Err(Error::WatchError(e))),
                };
                future::ready(Some(translated))
            })
            .filter_map(future::ready)
            .boxed();

        confirm_subscription(events).await
    }
}

/// Wait for the first item of a lazily established feed
///
/// The watcher only connects when polled, so a refused connection or a
/// missing RBAC grant would otherwise show up as an ordinary stream error.
/// An error as the first item fails the subscription; anything else is put
/// back in front of the feed.
pub(crate) async fn confirm_subscription(
    mut events: BoxStream<'static, Result<CrdEvent>>,
) -> Result<BoxStream<'static, Result<CrdEvent>>> {
    match events.next().await {
        Some(Err(e)) => Err(e),
        Some(Ok(first)) => Ok(stream::once(future::ready(Ok(first))).chain(events).boxed()),
        None => Ok(events),
    }
}

fn event_names<K: Resource>(event: watcher::Event<K>) -> watcher::Event<String> {
    match event {
        watcher::Event::Apply(obj) => watcher::Event::Apply(obj.name_any()),
        watcher::Event::Delete(obj) => watcher::Event::Delete(obj.name_any()),
        watcher::Event::Init => watcher::Event::Init,
        watcher::Event::InitApply(obj) => watcher::Event::InitApply(obj.name_any()),
        watcher::Event::InitDone => watcher::Event::InitDone,
    }
}

/// Map a watcher event onto a `CrdEvent`
///
/// Objects seen during a (re)list are buffered in `relist` and delivered as a
/// single `Relisted` snapshot once the list completes, so deletions that
/// happened while the watch was desynced are not lost.
pub(crate) fn translate_event(
    relist: &mut Vec<String>,
    event: watcher::Event<String>,
) -> Option<CrdEvent> {
    match event {
        watcher::Event::Apply(name) => Some(CrdEvent::Added(name)),
        watcher::Event::Delete(name) => Some(CrdEvent::Deleted(name)),
        watcher::Event::Init => {
            relist.clear();
            None
        }
        watcher::Event::InitApply(name) => {
            relist.push(name);
            None
        }
        watcher::Event::InitDone => Some(CrdEvent::Relisted(std::mem::take(relist))),
    }
}

#[derive(Default)]
struct CrdState {
    existing: HashSet<String>,
    missing: HashSet<String>,
    initialized: bool,
    all_crds_added: Option<CrdHandler>,
    some_crd_removed: Option<CrdHandler>,
}

impl CrdState {
    fn crd_added(&mut self, crd_name: &str) -> Option<CrdHandler> {
        self.existing.insert(crd_name.to_string());
        let was_missing = !self.missing.is_empty();
        if self.missing.remove(crd_name) {
            info!(crd = %crd_name, remaining = self.missing.len(), "Required CRD added");
        } else {
            debug!(crd = %crd_name, "CRD added");
        }

        if !self.initialized {
            return None;
        }

        // Only the addition that empties the missing set fires.
        if was_missing && self.missing.is_empty() {
            return self.all_crds_added.clone();
        }
        None
    }

    fn crd_deleted(&mut self, crd_name: &str, required: &HashSet<String>) -> Option<CrdHandler> {
        self.existing.remove(crd_name);
        if !required.contains(crd_name) {
            debug!(crd = %crd_name, "CRD deleted");
            return None;
        }

        let was_complete = self.missing.is_empty();
        if !self.missing.insert(crd_name.to_string()) {
            return None;
        }
        warn!(crd = %crd_name, "Required CRD deleted");

        if self.initialized && was_complete {
            return self.some_crd_removed.clone();
        }
        None
    }

    /// Apply a full listing as a set difference against `existing`
    fn reconcile(&mut self, names: Vec<String>, required: &HashSet<String>) -> Vec<CrdHandler> {
        let listed: HashSet<String> = names.into_iter().collect();

        // Collected first, crd_added and crd_deleted mutate `existing`.
        let added: Vec<String> = listed.difference(&self.existing).cloned().collect();
        let deleted: Vec<String> = self.existing.difference(&listed).cloned().collect();

        let mut fired = Vec::new();
        for name in &added {
            fired.extend(self.crd_added(name));
        }
        for name in &deleted {
            fired.extend(self.crd_deleted(name, required));
        }
        fired
    }
}

/// Tracks existence of a fixed set of required CRDs
///
/// The watch must be initialized with [`CrdWatch::init`] (or started with
/// [`CrdWatch::start`]) before it is queried. Querying an uninitialized watch
/// is a wiring bug and panics.
///
/// Handlers run on the task delivering the event, after the internal lock is
/// released. They should return quickly.
pub struct CrdWatch {
    required: HashSet<String>,
    state: Mutex<CrdState>,
}

impl CrdWatch {
    pub fn new<I, S>(required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let required: HashSet<String> = required.into_iter().map(Into::into).collect();
        let state = CrdState {
            missing: required.clone(),
            ..Default::default()
        };

        Self {
            required,
            state: Mutex::new(state),
        }
    }

    pub fn required_crds(&self) -> &HashSet<String> {
        &self.required
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().initialized
    }

    /// Called once when the last missing required CRD appears
    pub fn set_all_crds_added_handler<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.lock().all_crds_added = Some(Arc::new(handler));
    }

    /// Called once when a required CRD disappears while none were missing
    pub fn set_some_crd_removed_handler<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.lock().some_crd_removed = Some(Arc::new(handler));
    }

    /// Synchronously list all CRDs and mark the watch as initialized
    ///
    /// On error the watch stays uninitialized. Calling it again re-syncs.
    pub async fn init(&self, source: &dyn CrdSource) -> Result<()> {
        let names = source.list_crds().await?;
        self.sync(names, true);
        Ok(())
    }

    /// Keep the CRD sets current until `token` is cancelled
    ///
    /// Initializes first if needed. Errors establishing the subscription or
    /// the follow-up listing are returned; errors on an established feed are
    /// logged and the feed keeps retrying.
    pub async fn start(&self, source: &dyn CrdSource, token: CancellationToken) -> Result<()> {
        if !self.is_initialized() {
            self.init(source).await?;
        }

        let mut events = source.watch_crds().await?;

        // Anything changed between the initial listing and the subscription
        // is picked up here.
        let names = source.list_crds().await?;
        self.sync(names, false);

        info!(required = self.required.len(), "CRD watch started");

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                event = events.next() => match event {
                    Some(Ok(event)) => self.apply(event),
                    Some(Err(e)) => warn!(error = %e, "CRD watch stream error"),
                    None => {
                        warn!("CRD watch stream ended, waiting for shutdown");
                        token.cancelled().await;
                        break;
                    }
                },
            }
        }

        debug!("CRD watch stopped");
        Ok(())
    }

    /// Apply a single feed event
    pub(crate) fn apply(&self, event: CrdEvent) {
        let fired = {
            let mut state = self.lock();
            match event {
                CrdEvent::Added(name) => state.crd_added(&name).into_iter().collect(),
                CrdEvent::Deleted(name) => state
                    .crd_deleted(&name, &self.required)
                    .into_iter()
                    .collect(),
                CrdEvent::Relisted(names) => state.reconcile(names, &self.required),
            }
        };
        fire(fired);
    }

    fn sync(&self, names: Vec<String>, mark_initialized: bool) {
        let fired = {
            let mut state = self.lock();
            let fired = state.reconcile(names, &self.required);
            if mark_initialized {
                state.initialized = true;
            }
            fired
        };
        fire(fired);
    }

    fn lock(&self) -> MutexGuard<'_, CrdState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn initialized_state(&self) -> MutexGuard<'_, CrdState> {
        let state = self.lock();
        assert!(state.initialized, "crd watch not initialized");
        state
    }
}

fn fire(handlers: Vec<CrdHandler>) {
    for handler in handlers {
        handler();
    }
}

impl CrdList for CrdWatch {
    fn crd_exists(&self, crd_name: &str) -> bool {
        self.initialized_state().existing.contains(crd_name)
    }

    fn missing_crds(&self) -> Vec<String> {
        let mut missing: Vec<String> = self.initialized_state().missing.iter().cloned().collect();
        missing.sort();
        missing
    }
}

impl fmt::Debug for CrdWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("CrdWatch")
            .field("required", &self.required)
            .field("existing", &state.existing)
            .field("missing", &state.missing)
            .field("initialized", &state.initialized)
            .finish()
    }
}
