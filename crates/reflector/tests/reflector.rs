#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mirra_core::{namespace_key_func, ChangeEvent, Resource, INNER_STORAGE_ANNOTATION, ZOOKEEPER_STORAGE};
use mirra_reflector::{
    BackendError, EventHandler, Handlers, ListerWatcher, MemoryBackend, Reflector, ReflectorConfig, ReflectorError,
    Subscription,
};

#[derive(Debug, Clone, PartialEq)]
enum Seen {
    Add(Resource),
    Update(Resource, Resource),
    Delete(Resource),
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<Seen>>,
}

impl Recorder {
    fn snapshot(&self) -> Vec<Seen> { self.seen.lock().unwrap().clone() }
    fn len(&self) -> usize { self.seen.lock().unwrap().len() }
    fn has(&self, f: impl Fn(&Seen) -> bool) -> bool { self.seen.lock().unwrap().iter().any(f) }
}

impl EventHandler<Resource> for Recorder {
    fn on_add(&self, obj: &Resource) { self.seen.lock().unwrap().push(Seen::Add(obj.clone())); }
    fn on_update(&self, old: &Resource, new: &Resource) {
        self.seen.lock().unwrap().push(Seen::Update(old.clone(), new.clone()));
    }
    fn on_delete(&self, obj: &Resource) { self.seen.lock().unwrap().push(Seen::Delete(obj.clone())); }
}

struct Harness {
    backend: Arc<MemoryBackend<Resource>>,
    recorder: Arc<Recorder>,
    reflector: Reflector<Resource>,
}

fn harness(resync: Duration) -> Harness {
    let backend = Arc::new(MemoryBackend::with_buffer(namespace_key_func(), 64));
    let recorder = Arc::new(Recorder::default());
    let cfg = ReflectorConfig::default().with_resync_period(resync).with_watch_check_period(Duration::from_millis(20));
    let lw: Arc<dyn ListerWatcher<Resource>> = backend.clone();
    let handler: Arc<dyn EventHandler<Resource>> = recorder.clone();
    let reflector = Reflector::with_config("test", namespace_key_func(), lw, cfg, Some(handler));
    Harness { backend, recorder, reflector }
}

const NEVER: Duration = Duration::from_secs(3600);

async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for: {what}");
}

fn obj(ns: &str, name: &str) -> Resource { Resource::new(ns, name) }

/// Let spawned tasks run without moving a paused clock.
async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

/// Backend whose list calls answer `answered` times and then hang forever.
struct StallingBackend {
    answered: usize,
    lists: AtomicUsize,
}

impl StallingBackend {
    fn new(answered: usize) -> Self { Self { answered, lists: AtomicUsize::new(0) } }
    fn lists(&self) -> usize { self.lists.load(Ordering::SeqCst) }
}

#[async_trait::async_trait]
impl ListerWatcher<Resource> for StallingBackend {
    async fn list(&self) -> Result<Vec<Resource>, BackendError> {
        if self.lists.fetch_add(1, Ordering::SeqCst) < self.answered {
            return Ok(vec![obj("a", "x")]);
        }
        std::future::pending().await
    }

    async fn watch(&self) -> Result<Subscription<Resource>, BackendError> { std::future::pending().await }
}

fn stalling(answered: usize) -> (Arc<StallingBackend>, Reflector<Resource>) {
    let backend = Arc::new(StallingBackend::new(answered));
    let cfg = ReflectorConfig::default()
        .with_resync_period(Duration::from_millis(20))
        .with_watch_check_period(Duration::from_millis(20));
    let lw: Arc<dyn ListerWatcher<Resource>> = backend.clone();
    (backend, Reflector::with_config("stalling", namespace_key_func(), lw, cfg, None))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn initial_list_adds_each_object_once() {
    let h = harness(NEVER);
    h.backend.seed([obj("a", "x")]).unwrap();
    let task = h.reflector.start().await.unwrap();

    assert!(h.reflector.is_running());
    assert_eq!(h.recorder.snapshot(), vec![Seen::Add(obj("a", "x"))]);
    assert_eq!(h.reflector.store().count(), 1);

    h.reflector.stop();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resync_of_unchanged_object_is_an_update() {
    let h = harness(Duration::from_millis(40));
    h.backend.seed([obj("a", "x")]).unwrap();
    let task = h.reflector.start().await.unwrap();

    eventually("first resync", || h.recorder.len() >= 2).await;
    let seen = h.recorder.snapshot();
    assert_eq!(seen[0], Seen::Add(obj("a", "x")));
    assert!(seen[1..].iter().all(|s| *s == Seen::Update(obj("a", "x"), obj("a", "x"))));
    assert_eq!(h.reflector.store().count(), 1);

    h.reflector.stop();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resync_never_deletes_missing_objects() {
    let h = harness(Duration::from_millis(30));
    h.backend.seed([obj("a", "x"), obj("a", "y")]).unwrap();
    // No watch: the object vanishes from the listing without a delete event.
    h.backend.set_watch_failure(true);
    let task = h.reflector.start().await.unwrap();
    assert_eq!(h.reflector.store().count(), 2);

    assert!(h.backend.remove(obj("a", "y")).unwrap());
    let before = h.recorder.len();
    eventually("another resync", || h.recorder.len() > before).await;
    assert_eq!(h.reflector.store().count(), 2);
    assert!(!h.recorder.has(|s| matches!(s, Seen::Delete(_))));

    h.reflector.stop();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watch_events_are_classified_against_the_store() {
    let h = harness(NEVER);
    let task = h.reflector.start().await.unwrap();
    eventually("watch subscribed", || h.backend.subscriber_count() == 1).await;

    h.backend.apply(obj("a", "x")).unwrap();
    let v2 = obj("a", "x").with_data(serde_json::json!({"rev": 2}));
    h.backend.apply(v2.clone()).unwrap();
    h.backend.sync(obj("b", "y")).unwrap();
    assert!(h.backend.remove(obj("b", "y")).unwrap());

    eventually("four transitions", || h.recorder.len() == 4).await;
    assert_eq!(
        h.recorder.snapshot(),
        vec![
            Seen::Add(obj("a", "x")),
            Seen::Update(obj("a", "x"), v2.clone()),
            Seen::Add(obj("b", "y")),
            Seen::Delete(obj("b", "y")),
        ]
    );
    let store = h.reflector.store();
    assert_eq!(store.get_by_key("a/x"), Some(v2));
    assert_eq!(store.get_by_key("b/y"), None);

    h.reflector.stop();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zookeeper_deletion_reports_cached_object() {
    let h = harness(NEVER);
    let cached = obj("a", "x").with_data(serde_json::json!({"created": "2019-01-01"}));
    h.backend.seed([cached.clone()]).unwrap();
    let task = h.reflector.start().await.unwrap();
    eventually("watch subscribed", || h.backend.subscriber_count() == 1).await;

    let hollow = obj("a", "x").with_annotation(INNER_STORAGE_ANNOTATION, ZOOKEEPER_STORAGE);
    h.backend.emit(ChangeEvent::deleted(hollow));

    eventually("delete notified", || h.recorder.has(|s| matches!(s, Seen::Delete(_)))).await;
    assert_eq!(h.recorder.snapshot().last(), Some(&Seen::Delete(cached)));
    assert_eq!(h.reflector.store().get_by_key("a/x"), None);

    h.reflector.stop();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ordinary_deletion_reports_event_object() {
    let h = harness(NEVER);
    h.backend.seed([obj("a", "x").with_data(serde_json::json!(1))]).unwrap();
    let task = h.reflector.start().await.unwrap();
    eventually("watch subscribed", || h.backend.subscriber_count() == 1).await;

    let payload = obj("a", "x").with_data(serde_json::json!("final"));
    h.backend.emit(ChangeEvent::deleted(payload.clone()));

    eventually("delete notified", || h.recorder.has(|s| matches!(s, Seen::Delete(_)))).await;
    assert_eq!(h.recorder.snapshot().last(), Some(&Seen::Delete(payload)));

    h.reflector.stop();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deletion_of_unknown_key_is_ignored() {
    let h = harness(NEVER);
    let task = h.reflector.start().await.unwrap();
    eventually("watch subscribed", || h.backend.subscriber_count() == 1).await;

    h.backend.emit(ChangeEvent::deleted(obj("a", "ghost")));
    h.backend.emit(ChangeEvent::error());
    h.backend.apply(obj("a", "y")).unwrap();

    eventually("later event processed", || h.recorder.len() == 1).await;
    assert_eq!(h.recorder.snapshot(), vec![Seen::Add(obj("a", "y"))]);
    assert!(h.reflector.is_running());

    h.reflector.stop();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn closed_watch_channel_is_relaunched() {
    let h = harness(NEVER);
    let task = h.reflector.start().await.unwrap();
    eventually("first watch", || h.backend.watch_count() == 1 && h.backend.subscriber_count() == 1).await;

    h.backend.disconnect();
    eventually("watch relaunched", || h.backend.watch_count() == 2 && h.backend.subscriber_count() == 1).await;

    h.backend.apply(obj("a", "z")).unwrap();
    eventually("event after relaunch", || h.recorder.has(|s| *s == Seen::Add(obj("a", "z")))).await;

    h.reflector.stop();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscribe_failures_retry_on_health_tick() {
    let h = harness(NEVER);
    h.backend.set_watch_failure(true);
    let task = h.reflector.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(h.backend.watch_count(), 0);

    h.backend.set_watch_failure(false);
    eventually("watch established", || h.backend.subscriber_count() == 1).await;
    assert_eq!(h.backend.watch_count(), 1);

    h.reflector.stop();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn list_failure_recovers_on_next_resync() {
    let h = harness(Duration::from_millis(30));
    h.backend.seed([obj("a", "x")]).unwrap();
    h.backend.set_list_failure(true);
    h.backend.set_watch_failure(true);
    let task = h.reflector.start().await.unwrap();
    assert!(h.reflector.is_running());
    assert_eq!(h.reflector.store().count(), 0);

    h.backend.set_list_failure(false);
    eventually("resync caught up", || h.reflector.store().count() == 1).await;
    assert_eq!(h.recorder.snapshot()[0], Seen::Add(obj("a", "x")));

    h.reflector.stop();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_is_idempotent_and_releases_subscription() {
    let h = harness(NEVER);
    let task = h.reflector.start().await.unwrap();
    eventually("watch subscribed", || h.backend.subscriber_count() == 1).await;

    h.reflector.stop();
    h.reflector.stop();
    tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();

    assert!(h.reflector.is_stopped());
    assert_eq!(h.backend.subscriber_count(), 0);
    assert_eq!(h.backend.watch_count(), 1);
    assert_eq!(h.reflector.start().await.unwrap_err(), ReflectorError::Stopped { name: "test".into() });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_start_is_rejected() {
    let h = harness(NEVER);
    let task = h.reflector.start().await.unwrap();
    assert_eq!(
        h.reflector.clone().start().await.unwrap_err(),
        ReflectorError::AlreadyStarted { name: "test".into() }
    );
    h.reflector.stop();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_in_place_without_observer() {
    let backend = Arc::new(MemoryBackend::with_buffer(namespace_key_func::<Resource>(), 16));
    backend.seed([obj("a", "x"), obj("", "node-1")]).unwrap();
    let lw: Arc<dyn ListerWatcher<Resource>> = backend.clone();
    let reflector = Reflector::new("bare", namespace_key_func(), lw, NEVER, None);

    let runner = tokio::spawn({
        let r = reflector.clone();
        async move { r.run().await }
    });
    eventually("initial sync", || reflector.is_running()).await;
    let mut keys = reflector.store().list_keys();
    keys.sort();
    assert_eq!(keys, vec!["a/x".to_string(), "node-1".to_string()]);

    reflector.stop();
    assert_eq!(runner.await.unwrap(), Ok(()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn partial_handlers_only_fire_what_is_set() {
    let backend = Arc::new(MemoryBackend::with_buffer(namespace_key_func::<Resource>(), 16));
    backend.seed([obj("a", "x")]).unwrap();
    let deleted = Arc::new(Mutex::new(Vec::new()));
    let handler = Handlers::new().delete_fn({
        let deleted = deleted.clone();
        move |o: &Resource| deleted.lock().unwrap().push(o.name.clone())
    });
    let lw: Arc<dyn ListerWatcher<Resource>> = backend.clone();
    let cfg = ReflectorConfig::default().with_resync_period(NEVER).with_watch_check_period(Duration::from_millis(20));
    let handler: Arc<dyn EventHandler<Resource>> = Arc::new(handler);
    let reflector = Reflector::with_config("partial", namespace_key_func(), lw, cfg, Some(handler));
    let task = reflector.start().await.unwrap();
    eventually("watch subscribed", || backend.subscriber_count() == 1).await;

    backend.apply(obj("a", "x")).unwrap();
    assert!(backend.remove(obj("a", "x")).unwrap());
    eventually("delete seen", || !deleted.lock().unwrap().is_empty()).await;
    assert_eq!(*deleted.lock().unwrap(), vec!["x".to_string()]);

    reflector.stop();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_interrupts_pending_resync_list() {
    let (backend, reflector) = stalling(1);
    let task = reflector.start().await.unwrap();
    assert_eq!(reflector.store().count(), 1);
    eventually("resync list in flight", || backend.lists() >= 2).await;

    reflector.stop();
    tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    assert!(reflector.is_stopped());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_interrupts_pending_initial_list() {
    let (backend, reflector) = stalling(0);
    let starter = tokio::spawn({
        let r = reflector.clone();
        async move { r.start().await }
    });
    eventually("initial list in flight", || backend.lists() == 1).await;

    reflector.stop();
    let task = tokio::time::timeout(Duration::from_secs(2), starter).await.unwrap().unwrap().unwrap();
    tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    assert!(reflector.is_stopped());
    assert_eq!(reflector.store().count(), 0);
}

#[tokio::test(start_paused = true)]
async fn closed_watch_is_replaced_within_one_health_tick() {
    let h = harness(NEVER);
    let task = h.reflector.start().await.unwrap();
    settle().await;
    assert_eq!(h.backend.watch_count(), 1);

    h.backend.disconnect();
    settle().await;
    assert_eq!(h.backend.watch_count(), 1);

    tokio::time::advance(h.reflector.config().watch_check_period).await;
    settle().await;
    assert_eq!(h.backend.watch_count(), 2);
    assert_eq!(h.backend.subscriber_count(), 1);

    h.reflector.stop();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stopped_only_once_loops_have_exited() {
    let h = harness(NEVER);
    let task = h.reflector.start().await.unwrap();
    settle().await;

    h.reflector.stop();
    assert!(!h.reflector.is_running());
    assert!(!h.reflector.is_stopped());
    assert_eq!(h.reflector.start().await.unwrap_err(), ReflectorError::Stopped { name: "test".into() });

    task.await.unwrap();
    assert!(h.reflector.is_stopped());
}

#[tokio::test]
async fn stop_before_start_is_immediately_stopped() {
    let h = harness(NEVER);
    h.reflector.stop();
    assert!(h.reflector.is_stopped());
    assert_eq!(h.backend.watch_count(), 0);
}
