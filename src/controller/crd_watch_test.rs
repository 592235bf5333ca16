//! Unit tests for CRD existence tracking
//!
//! Covers: initialization against a listing, edge-triggered handlers on the
//! missing set, relist reconciliation, concurrent delivery, and the async
//! feed loop driven by an in-memory source.

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::stream::{self, BoxStream, StreamExt};
    use kube::runtime::watcher;
    use kube::Client;
    use tokio_util::sync::CancellationToken;

    use crate::controller::crd_watch::{
        confirm_subscription, translate_event, CrdEvent, CrdList, CrdSource, CrdWatch,
        KubeCrdSource,
    };
    use crate::controller::test_support::{eventually, FakeCrdSource};
    use crate::error::{Error, Result};

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    struct Counters {
        added: Arc<AtomicUsize>,
        removed: Arc<AtomicUsize>,
    }

    impl Counters {
        fn added(&self) -> usize {
            self.added.load(Ordering::SeqCst)
        }

        fn removed(&self) -> usize {
            self.removed.load(Ordering::SeqCst)
        }
    }

    fn counted(watch: &CrdWatch) -> Counters {
        let added = Arc::new(AtomicUsize::new(0));
        let removed = Arc::new(AtomicUsize::new(0));

        let a = added.clone();
        watch.set_all_crds_added_handler(move || {
            a.fetch_add(1, Ordering::SeqCst);
        });
        let r = removed.clone();
        watch.set_some_crd_removed_handler(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });

        Counters { added, removed }
    }

    async fn initialized(required: &[&str], present: &[&str]) -> (CrdWatch, Counters) {
        let watch = CrdWatch::new(required.iter().copied());
        let counters = counted(&watch);
        watch
            .init(&FakeCrdSource::new(present))
            .await
            .expect("init should succeed");
        (watch, counters)
    }

    fn added(name: &str) -> CrdEvent {
        CrdEvent::Added(name.to_string())
    }

    fn deleted(name: &str) -> CrdEvent {
        CrdEvent::Deleted(name.to_string())
    }

    fn relisted(names: &[&str]) -> CrdEvent {
        CrdEvent::Relisted(names.iter().map(|s| s.to_string()).collect())
    }

    // -------------------------------------------------------------------------
    // Construction and initialization
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_empty_required_set_is_satisfied() {
        let (watch, counters) = initialized(&[], &["foo.example.io"]).await;

        assert!(watch.missing_crds().is_empty());
        assert!(watch.crd_exists("foo.example.io"));

        watch.apply(deleted("foo.example.io"));
        assert_eq!(counters.removed(), 0);
        assert!(!watch.crd_exists("foo.example.io"));
    }

    #[test]
    fn test_duplicate_required_names_collapse() {
        let watch = CrdWatch::new(["a.example.io", "a.example.io", "b.example.io"]);
        assert_eq!(watch.required_crds().len(), 2);
        assert!(!watch.is_initialized());
    }

    #[tokio::test]
    async fn test_init_reports_missing_crds() {
        let (watch, counters) =
            initialized(&["a.io", "b.io", "c.io"], &["a.io", "unrelated.io"]).await;

        assert!(watch.is_initialized());
        assert!(watch.crd_exists("a.io"));
        assert!(watch.crd_exists("unrelated.io"));
        assert!(!watch.crd_exists("b.io"));
        assert_eq!(watch.missing_crds(), vec!["b.io", "c.io"]);

        // Nothing fires while the initial listing is applied.
        assert_eq!(counters.added(), 0);
        assert_eq!(counters.removed(), 0);
    }

    #[tokio::test]
    async fn test_init_with_everything_present_does_not_fire() {
        let (watch, counters) = initialized(&["a.io", "b.io"], &["a.io", "b.io"]).await;
        assert!(watch.missing_crds().is_empty());
        assert_eq!(counters.added(), 0);
    }

    #[test]
    #[should_panic(expected = "crd watch not initialized")]
    fn test_crd_exists_before_init_panics() {
        let watch = CrdWatch::new(["a.io"]);
        watch.crd_exists("a.io");
    }

    #[test]
    #[should_panic(expected = "crd watch not initialized")]
    fn test_missing_crds_before_init_panics() {
        let watch = CrdWatch::new(["a.io"]);
        watch.missing_crds();
    }

    #[tokio::test]
    async fn test_failed_init_leaves_watch_uninitialized() {
        let watch = CrdWatch::new(["a.io"]);
        let source = FakeCrdSource::new(&["a.io"]);
        source.fail_list(true);

        assert!(watch.init(&source).await.is_err());
        assert!(!watch.is_initialized());

        source.fail_list(false);
        watch.init(&source).await.expect("retry should succeed");
        assert!(watch.is_initialized());
        assert!(watch.missing_crds().is_empty());
    }

    // -------------------------------------------------------------------------
    // Edge-triggered handlers
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_all_added_fires_once_when_last_missing_appears() {
        let (watch, counters) = initialized(&["a.io", "b.io", "c.io"], &["a.io"]).await;

        watch.apply(added("b.io"));
        assert_eq!(counters.added(), 0);
        assert_eq!(watch.missing_crds(), vec!["c.io"]);

        watch.apply(added("c.io"));
        assert_eq!(counters.added(), 1);
        assert!(watch.missing_crds().is_empty());

        // An unrelated CRD with nothing missing changes nothing.
        watch.apply(added("d.io"));
        assert_eq!(counters.added(), 1);
        assert!(watch.crd_exists("d.io"));
        assert_eq!(counters.removed(), 0);
    }

    #[tokio::test]
    async fn test_all_added_is_order_independent() {
        let (watch, counters) = initialized(&["a.io", "b.io", "c.io"], &["a.io"]).await;

        watch.apply(added("c.io"));
        watch.apply(added("b.io"));

        assert_eq!(counters.added(), 1);
        assert!(watch.missing_crds().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_add_of_present_crd_does_not_fire() {
        let (watch, counters) = initialized(&["a.io"], &[]).await;

        watch.apply(added("a.io"));
        watch.apply(added("a.io"));

        assert_eq!(counters.added(), 1);
    }

    #[tokio::test]
    async fn test_removed_fires_only_on_first_loss() {
        let (watch, counters) = initialized(&["a.io", "b.io"], &["a.io", "b.io"]).await;

        watch.apply(deleted("a.io"));
        assert_eq!(counters.removed(), 1);
        assert_eq!(watch.missing_crds(), vec!["a.io"]);
        assert!(!watch.crd_exists("a.io"));

        watch.apply(deleted("b.io"));
        assert_eq!(counters.removed(), 1);
        assert_eq!(watch.missing_crds(), vec!["a.io", "b.io"]);

        // Deleting an already missing CRD is a no-op.
        watch.apply(deleted("a.io"));
        assert_eq!(counters.removed(), 1);
    }

    #[tokio::test]
    async fn test_unrequired_deletion_never_fires() {
        let (watch, counters) = initialized(&["a.io"], &["a.io", "extra.io"]).await;

        watch.apply(deleted("extra.io"));

        assert_eq!(counters.removed(), 0);
        assert!(!watch.crd_exists("extra.io"));
        assert!(watch.missing_crds().is_empty());
    }

    #[tokio::test]
    async fn test_removed_then_readded_fires_both_edges_again() {
        let (watch, counters) = initialized(&["a.io"], &["a.io"]).await;

        watch.apply(deleted("a.io"));
        watch.apply(added("a.io"));
        watch.apply(deleted("a.io"));
        watch.apply(added("a.io"));

        assert_eq!(counters.removed(), 2);
        assert_eq!(counters.added(), 2);
    }

    #[test]
    fn test_events_before_init_do_not_fire() {
        let watch = CrdWatch::new(["a.io"]);
        let counters = counted(&watch);

        watch.apply(added("a.io"));
        watch.apply(deleted("a.io"));
        watch.apply(added("a.io"));

        assert_eq!(counters.added(), 0);
        assert_eq!(counters.removed(), 0);
    }

    #[tokio::test]
    async fn test_replacing_a_handler_keeps_only_the_last() {
        let (watch, _counters) = initialized(&["a.io"], &[]).await;

        let first = Arc::new(AtomicBool::new(false));
        let second = Arc::new(AtomicBool::new(false));
        let f = first.clone();
        watch.set_all_crds_added_handler(move || f.store(true, Ordering::SeqCst));
        let s = second.clone();
        watch.set_all_crds_added_handler(move || s.store(true, Ordering::SeqCst));

        watch.apply(added("a.io"));

        assert!(!first.load(Ordering::SeqCst));
        assert!(second.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_handler_can_query_the_watch() {
        let watch = Arc::new(CrdWatch::new(["a.io", "b.io"]));
        watch
            .init(&FakeCrdSource::new(&["a.io"]))
            .await
            .unwrap();

        let observed = Arc::new(AtomicBool::new(false));
        let (w, o) = (watch.clone(), observed.clone());
        watch.set_all_crds_added_handler(move || {
            o.store(w.crd_exists("b.io") && w.missing_crds().is_empty(), Ordering::SeqCst);
        });

        watch.apply(added("b.io"));
        assert!(observed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_missing_set_tracks_random_event_sequence() {
        let required = ["a.io", "b.io", "c.io"];
        let universe = ["a.io", "b.io", "c.io", "x.io", "y.io"];
        let (watch, _counters) = initialized(&required, &["x.io"]).await;

        let mut present: HashSet<&str> = HashSet::from(["x.io"]);
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for _ in 0..500 {
            seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            let name = universe[(seed >> 33) as usize % universe.len()];
            if (seed >> 20) & 1 == 0 {
                watch.apply(added(name));
                present.insert(name);
            } else {
                watch.apply(deleted(name));
                present.remove(name);
            }

            let mut expected: Vec<String> = required
                .iter()
                .filter(|crd| !present.contains(*crd))
                .map(|crd| crd.to_string())
                .collect();
            expected.sort();
            assert_eq!(watch.missing_crds(), expected);
            for crd in universe {
                assert_eq!(watch.crd_exists(crd), present.contains(crd));
            }
        }
    }

    // -------------------------------------------------------------------------
    // Relist reconciliation
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_relist_completing_the_set_fires_added() {
        let (watch, counters) = initialized(&["a.io", "b.io"], &["a.io"]).await;

        watch.apply(relisted(&["a.io", "b.io", "z.io"]));

        assert_eq!(counters.added(), 1);
        assert!(watch.crd_exists("z.io"));
        assert!(watch.missing_crds().is_empty());
    }

    #[tokio::test]
    async fn test_relist_missing_a_required_crd_fires_removed() {
        let (watch, counters) = initialized(&["a.io", "b.io"], &["a.io", "b.io", "z.io"]).await;

        watch.apply(relisted(&["a.io"]));

        assert_eq!(counters.removed(), 1);
        assert!(!watch.crd_exists("z.io"));
        assert_eq!(watch.missing_crds(), vec!["b.io"]);
    }

    #[tokio::test]
    async fn test_identical_relist_is_silent() {
        let (watch, counters) = initialized(&["a.io"], &["a.io", "z.io"]).await;

        watch.apply(relisted(&["z.io", "a.io"]));

        assert_eq!(counters.added(), 0);
        assert_eq!(counters.removed(), 0);
    }

    #[test]
    fn test_translate_watcher_events() {
        let mut relist = Vec::new();

        assert_eq!(
            translate_event(&mut relist, watcher::Event::Apply("a.io".to_string())),
            Some(added("a.io"))
        );
        assert_eq!(
            translate_event(&mut relist, watcher::Event::Delete("a.io".to_string())),
            Some(deleted("a.io"))
        );

        assert_eq!(translate_event(&mut relist, watcher::Event::Init), None);
        assert_eq!(
            translate_event(&mut relist, watcher::Event::InitApply("a.io".to_string())),
            None
        );
        assert_eq!(
            translate_event(&mut relist, watcher::Event::InitApply("b.io".to_string())),
            None
        );
        assert_eq!(
            translate_event(&mut relist, watcher::Event::InitDone),
            Some(relisted(&["a.io", "b.io"]))
        );
        assert!(relist.is_empty());
    }

    #[test]
    fn test_interrupted_relist_restarts_buffer() {
        let mut relist = Vec::new();
        translate_event(&mut relist, watcher::Event::Init);
        translate_event(&mut relist, watcher::Event::InitApply("stale.io".to_string()));

        translate_event(&mut relist, watcher::Event::Init);
        translate_event(&mut relist, watcher::Event::InitApply("a.io".to_string()));

        assert_eq!(
            translate_event(&mut relist, watcher::Event::InitDone),
            Some(relisted(&["a.io"]))
        );
    }

    // -------------------------------------------------------------------------
    // Concurrent delivery
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_concurrent_adds_fire_exactly_once() {
        let names: Vec<String> = (0..16).map(|i| format!("crd{i}.example.io")).collect();
        let watch = Arc::new(CrdWatch::new(names.clone()));
        let counters = counted(&watch);
        watch.init(&FakeCrdSource::new(&[])).await.unwrap();

        let threads: Vec<_> = names
            .into_iter()
            .map(|name| {
                let watch = watch.clone();
                std::thread::spawn(move || watch.apply(CrdEvent::Added(name)))
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(counters.added(), 1);
        assert!(watch.missing_crds().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_deletes_fire_exactly_once() {
        let names: Vec<String> = (0..16).map(|i| format!("crd{i}.example.io")).collect();
        let present: Vec<&str> = names.iter().map(String::as_str).collect();
        let watch = Arc::new(CrdWatch::new(names.clone()));
        let counters = counted(&watch);
        watch.init(&FakeCrdSource::new(&present)).await.unwrap();

        let threads: Vec<_> = names
            .clone()
            .into_iter()
            .map(|name| {
                let watch = watch.clone();
                std::thread::spawn(move || watch.apply(CrdEvent::Deleted(name)))
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(counters.removed(), 1);
        assert_eq!(watch.missing_crds().len(), names.len());
    }

    // -------------------------------------------------------------------------
    // Feed loop
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_start_initializes_and_follows_the_feed() {
        let watch = Arc::new(CrdWatch::new(["a.io", "b.io"]));
        let counters = counted(&watch);
        let source = Arc::new(FakeCrdSource::new(&["a.io"]));
        let token = CancellationToken::new();

        let task = {
            let (watch, source, token) = (watch.clone(), source.clone(), token.clone());
            tokio::spawn(async move { watch.start(source.as_ref(), token).await })
        };

        assert!(eventually(|| watch.is_initialized()).await);
        assert_eq!(watch.missing_crds(), vec!["b.io"]);

        source.add("b.io");
        assert!(eventually(|| counters.added() == 1).await);

        source.remove("a.io");
        assert!(eventually(|| counters.removed() == 1).await);
        assert_eq!(watch.missing_crds(), vec!["a.io"]);

        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("start should return after cancellation")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_start_catches_changes_between_init_and_subscribe() {
        let watch = Arc::new(CrdWatch::new(["a.io", "b.io"]));
        let counters = counted(&watch);
        let source = Arc::new(FakeCrdSource::new(&["a.io"]));
        watch.init(source.as_ref()).await.unwrap();

        // Installed after the initial list, never published on the feed.
        source.set_crds(&["a.io", "b.io"]);

        let token = CancellationToken::new();
        let task = {
            let (watch, source, token) = (watch.clone(), source.clone(), token.clone());
            tokio::spawn(async move { watch.start(source.as_ref(), token).await })
        };

        assert!(eventually(|| counters.added() == 1).await);
        assert!(watch.missing_crds().is_empty());
        // One listing for init, one after subscribing.
        assert_eq!(source.list_calls(), 2);

        token.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_feed_errors_are_not_fatal() {
        let watch = Arc::new(CrdWatch::new(["a.io"]));
        let counters = counted(&watch);
        let source = Arc::new(FakeCrdSource::new(&[]));
        let token = CancellationToken::new();

        let task = {
            let (watch, source, token) = (watch.clone(), source.clone(), token.clone());
            tokio::spawn(async move { watch.start(source.as_ref(), token).await })
        };

        assert!(eventually(|| watch.is_initialized()).await);
        source.send_error("connection reset");
        source.add("a.io");
        assert!(eventually(|| counters.added() == 1).await);
        assert!(!task.is_finished());

        token.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_subscription_failure_is_returned() {
        let watch = CrdWatch::new(["a.io"]);
        let source = FakeCrdSource::new(&["a.io"]);
        source.fail_watch(true);

        let result = watch.start(&source, CancellationToken::new()).await;

        assert!(result.is_err());
        // Initialization still happened before the subscription attempt.
        assert!(watch.is_initialized());
    }

    /// Lists fine, but its feed is refused before delivering anything
    struct RefusedFeedSource;

    #[async_trait]
    impl CrdSource for RefusedFeedSource {
        async fn list_crds(&self) -> Result<Vec<String>> {
            Ok(vec!["a.io".to_string()])
        }

        async fn watch_crds(&self) -> Result<BoxStream<'static, Result<CrdEvent>>> {
            // A backed-off watcher keeps retrying after the first failure.
            let events: BoxStream<'static, Result<CrdEvent>> = stream::iter(vec![
                Err(Error::CrdListError("customresourcedefinitions is forbidden".to_string())),
                Ok(relisted(&["a.io"])),
            ])
            .boxed();
            confirm_subscription(events).await
        }
    }

    #[tokio::test]
    async fn test_feed_failing_on_first_item_fails_start() {
        let watch = CrdWatch::new(["a.io"]);

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            watch.start(&RefusedFeedSource, CancellationToken::new()),
        )
        .await
        .expect("start should not keep retrying a refused feed");

        assert!(matches!(result, Err(Error::CrdListError(_))));
    }

    #[tokio::test]
    async fn test_confirmed_feed_keeps_its_first_item() {
        let events: BoxStream<'static, Result<CrdEvent>> =
            stream::iter(vec![Ok(added("a.io")), Ok(deleted("a.io"))]).boxed();

        let events: Vec<CrdEvent> = confirm_subscription(events)
            .await
            .expect("healthy feed is confirmed")
            .map(|event| event.unwrap())
            .collect()
            .await;

        assert_eq!(events, vec![added("a.io"), deleted("a.io")]);
    }

    #[tokio::test]
    async fn test_unreachable_api_server_fails_subscription() {
        // Nothing listens on port 1.
        let config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        let source = KubeCrdSource::new(Client::try_from(config).unwrap());

        let result = tokio::time::timeout(Duration::from_secs(5), source.watch_crds())
            .await
            .expect("a refused connection should surface quickly");

        assert!(matches!(result, Err(Error::WatchError(_))));
    }

    #[tokio::test]
    async fn test_start_returns_promptly_when_already_cancelled() {
        let watch = CrdWatch::new(["a.io"]);
        let source = FakeCrdSource::new(&[]);
        let token = CancellationToken::new();
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), watch.start(&source, token))
            .await
            .expect("start should not block");
        assert!(result.is_ok());
    }
}
