//! In-memory `CrdSource` for exercising the CRD watch and supervisor

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;

use super::crd_watch::{CrdEvent, CrdSource};
use crate::error::{Error, Result};

pub(crate) struct FakeCrdSource {
    crds: Mutex<Vec<String>>,
    events: mpsc::UnboundedSender<Result<CrdEvent>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Result<CrdEvent>>>>,
    fail_list: AtomicBool,
    fail_watch: AtomicBool,
    list_calls: AtomicUsize,
}

impl FakeCrdSource {
    pub(crate) fn new(crds: &[&str]) -> Self {
        let (events, receiver) = mpsc::unbounded_channel();
        Self {
            crds: Mutex::new(crds.iter().map(|s| s.to_string()).collect()),
            events,
            receiver: Mutex::new(Some(receiver)),
            fail_list: AtomicBool::new(false),
            fail_watch: AtomicBool::new(false),
            list_calls: AtomicUsize::new(0),
        }
    }

    /// Install a CRD and publish it on the feed
    pub(crate) fn add(&self, name: &str) {
        self.crds.lock().unwrap().push(name.to_string());
        self.send(CrdEvent::Added(name.to_string()));
    }

    /// Remove a CRD and publish the deletion on the feed
    pub(crate) fn remove(&self, name: &str) {
        self.crds.lock().unwrap().retain(|crd| crd != name);
        self.send(CrdEvent::Deleted(name.to_string()));
    }

    /// Change what listing returns without publishing anything
    pub(crate) fn set_crds(&self, crds: &[&str]) {
        *self.crds.lock().unwrap() = crds.iter().map(|s| s.to_string()).collect();
    }

    pub(crate) fn send(&self, event: CrdEvent) {
        // The receiver is gone once the watch under test has stopped.
        let _ = self.events.send(Ok(event));
    }

    pub(crate) fn send_error(&self, message: &str) {
        let _ = self.events.send(Err(Error::CrdListError(message.to_string())));
    }

    pub(crate) fn fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_watch(&self, fail: bool) {
        self.fail_watch.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CrdSource for FakeCrdSource {
    async fn list_crds(&self) -> Result<Vec<String>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(Error::CrdListError("api server unavailable".to_string()));
        }
        Ok(self.crds.lock().unwrap().clone())
    }

    async fn watch_crds(&self) -> Result<BoxStream<'static, Result<CrdEvent>>> {
        if self.fail_watch.load(Ordering::SeqCst) {
            return Err(Error::CrdListError("watch refused".to_string()));
        }
        let receiver = self
            .receiver
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::CrdListError("already watching".to_string()))?;

        Ok(stream::unfold(receiver, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed())
    }
}

/// Poll `condition` until it holds or a second has passed
pub(crate) async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
