use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use mirra_core::{omits_delete_payload, ChangeEvent, EventKind, KeyFunc, Object};
use mirra_store::{Cache, Reader, Store};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::backend::ListerWatcher;
use crate::config::ReflectorConfig;
use crate::handler::{EventHandler, NoopHandler};

const IDLE: u8 = 0;
const STARTING: u8 = 1;
const RUNNING: u8 = 2;
const STOPPING: u8 = 3;
const STOPPED: u8 = 4;

/// Lifecycle misuse. Nothing that happens inside the sync loops surfaces here.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReflectorError {
    #[error("reflector {name} was already started")]
    AlreadyStarted { name: String },
    #[error("reflector {name} is stopped")]
    Stopped { name: String },
}

/// Keeps a local store in step with a [`ListerWatcher`] and reports every
/// add/update/delete to an [`EventHandler`].
///
/// Cloning yields another handle to the same reflector.
pub struct Reflector<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Reflector<T> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

struct Inner<T> {
    name: String,
    store: Arc<dyn Store<T>>,
    lw: Arc<dyn ListerWatcher<T>>,
    handler: Arc<dyn EventHandler<T>>,
    config: ReflectorConfig,
    cancel: CancellationToken,
    state: AtomicU8,
}

impl<T> Reflector<T>
where
    T: Object + Clone + Send + Sync + 'static,
{
    /// Reflector over a fresh [`Cache`] keyed by `key_func`.
    pub fn new(
        name: impl Into<String>,
        key_func: KeyFunc<T>,
        lw: Arc<dyn ListerWatcher<T>>,
        resync_period: Duration,
        handler: Option<Arc<dyn EventHandler<T>>>,
    ) -> Self {
        let config = ReflectorConfig::default().with_resync_period(resync_period);
        Self::with_config(name, key_func, lw, config, handler)
    }

    pub fn with_config(
        name: impl Into<String>,
        key_func: KeyFunc<T>,
        lw: Arc<dyn ListerWatcher<T>>,
        config: ReflectorConfig,
        handler: Option<Arc<dyn EventHandler<T>>>,
    ) -> Self {
        let name = name.into();
        let store: Arc<dyn Store<T>> = Arc::new(Cache::new(name.clone(), key_func));
        Self::with_store(name, store, lw, config, handler)
    }

    /// Reflector writing into a caller-provided store. The reflector must be the
    /// only writer for the add/update classification to hold.
    pub fn with_store(
        name: impl Into<String>,
        store: Arc<dyn Store<T>>,
        lw: Arc<dyn ListerWatcher<T>>,
        config: ReflectorConfig,
        handler: Option<Arc<dyn EventHandler<T>>>,
    ) -> Self {
        let handler = handler.unwrap_or_else(|| Arc::new(NoopHandler) as Arc<dyn EventHandler<T>>);
        let inner = Inner {
            name: name.into(),
            store,
            lw,
            handler,
            config,
            cancel: CancellationToken::new(),
            state: AtomicU8::new(IDLE),
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn name(&self) -> &str { &self.inner.name }

    pub fn config(&self) -> &ReflectorConfig { &self.inner.config }

    /// Read-only view of the mirrored objects.
    pub fn store(&self) -> Reader<T> { Reader::new(Arc::clone(&self.inner.store)) }

    /// True once the initial sync finished and until [`Reflector::stop`].
    pub fn is_running(&self) -> bool { self.inner.state.load(Ordering::SeqCst) == RUNNING }

    /// True once both loops have exited after [`Reflector::stop`], or when
    /// stopped before ever starting. Between `stop()` and loop exit the
    /// reflector is neither running nor stopped.
    pub fn is_stopped(&self) -> bool { self.inner.state.load(Ordering::SeqCst) == STOPPED }

    /// Run the initial full sync, then spawn the steady-state loop.
    ///
    /// Await the returned handle to learn when both loops have exited after
    /// [`Reflector::stop`].
    pub async fn start(&self) -> Result<JoinHandle<()>, ReflectorError> {
        self.begin().await?;
        let inner = Arc::clone(&self.inner);
        Ok(tokio::spawn(async move { inner.steady().await }))
    }

    /// Like [`Reflector::start`] but drives the steady-state loop in the calling
    /// task, returning once stopped.
    pub async fn run(&self) -> Result<(), ReflectorError> {
        self.begin().await?;
        Arc::clone(&self.inner).steady().await;
        Ok(())
    }

    /// Ask both loops to exit. Idempotent.
    pub fn stop(&self) {
        let moved = self.inner.state.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| match s {
            IDLE => Some(STOPPED),
            STARTING | RUNNING => Some(STOPPING),
            _ => None,
        });
        if moved.is_ok() {
            debug!(name = %self.inner.name, "reflector asked to stop");
        }
        self.inner.cancel.cancel();
    }

    async fn begin(&self) -> Result<(), ReflectorError> {
        let name = || self.inner.name.clone();
        match self.inner.state.compare_exchange(IDLE, STARTING, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => {}
            Err(STOPPING | STOPPED) => return Err(ReflectorError::Stopped { name: name() }),
            Err(_) => return Err(ReflectorError::AlreadyStarted { name: name() }),
        }
        info!(name = %self.inner.name, "reflector starting, caching data");
        self.inner.list_all().await;
        // A concurrent stop() already moved us to STOPPING; leave it there.
        let _ = self.inner.state.compare_exchange(STARTING, RUNNING, Ordering::SeqCst, Ordering::SeqCst);
        Ok(())
    }
}

impl<T> Inner<T>
where
    T: Object + Clone + Send + Sync + 'static,
{
    async fn steady(self: Arc<Self>) {
        if self.cancel.is_cancelled() {
            self.state.store(STOPPED, Ordering::SeqCst);
            info!(name = %self.name, "reflector stopped before entering steady state");
            return;
        }
        let mut watch_task = Some(self.spawn_watch());
        let resync = self.config.resync_period.max(Duration::from_millis(1));
        let check = self.config.watch_check_period.max(Duration::from_millis(1));
        let mut sync_tick = interval_at(Instant::now() + resync, resync);
        sync_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut watch_tick = interval_at(Instant::now() + check, check);
        watch_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(name = %self.name, resync_ms = resync.as_millis() as u64, "initial sync done, tickers registered");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    warn!(name = %self.name, "reflector exiting, lister & watcher stopped");
                    break;
                }
                _ = sync_tick.tick() => {
                    info!(name = %self.name, "triggering full resynchronization");
                    self.list_all().await;
                }
                _ = watch_tick.tick() => {
                    if watch_task.as_ref().is_some_and(|h| !h.is_finished()) {
                        continue;
                    }
                    warn!(name = %self.name, "watch loop is out, relaunching");
                    counter!("reflector_watch_restarts_total", 1u64, "reflector" => self.name.clone());
                    watch_task = Some(self.spawn_watch());
                }
            }
        }

        if let Some(handle) = watch_task.take() {
            if let Err(e) = handle.await {
                error!(name = %self.name, error = %e, "watch task ended abnormally");
            }
        }
        self.state.store(STOPPED, Ordering::SeqCst);
        info!(name = %self.name, "reflector stopped");
    }

    fn spawn_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.watch_loop().await })
    }

    /// One full list pass. Failures wait for the next resync tick; a pending
    /// list call is abandoned on cancellation.
    async fn list_all(&self) {
        debug!(name = %self.name, "listing all data");
        counter!("reflector_list_total", 1u64, "reflector" => self.name.clone());
        let listed = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!(name = %self.name, "list abandoned, reflector stopping");
                return;
            }
            res = self.lw.list() => res,
        };
        let objs = match listed {
            Ok(objs) => objs,
            Err(e) => {
                error!(name = %self.name, error = %e, "list all data failed, waiting for next resync");
                counter!("reflector_list_errors_total", 1u64, "reflector" => self.name.clone());
                return;
            }
        };
        debug!(name = %self.name, count = objs.len(), "list all data success");
        for obj in objs {
            self.apply_upsert(obj, "list");
        }
    }

    async fn watch_loop(&self) {
        counter!("reflector_watch_starts_total", 1u64, "reflector" => self.name.clone());
        let subscribed = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            res = self.lw.watch() => res,
        };
        let mut sub = match subscribed {
            Ok(sub) => sub,
            Err(e) => {
                error!(name = %self.name, error = %e, "creating watch failed");
                counter!("reflector_watch_errors_total", 1u64, "reflector" => self.name.clone());
                return;
            }
        };
        info!(name = %self.name, "entered watch loop, waiting for events");
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!(name = %self.name, "watch loop asked to exit");
                    break;
                }
                next = sub.next() => match next {
                    Some(event) => self.dispatch(event),
                    None => {
                        error!(name = %self.name, "watch channel closed");
                        counter!("reflector_watch_errors_total", 1u64, "reflector" => self.name.clone());
                        break;
                    }
                },
            }
        }
        sub.stop();
        info!(name = %self.name, "watch loop exit");
    }

    fn dispatch(&self, event: ChangeEvent<T>) {
        counter!("reflector_events_total", 1u64, "reflector" => self.name.clone(), "kind" => event.kind.as_str());
        match (event.kind, event.data) {
            (EventKind::Error, _) => {
                debug!(name = %self.name, "error event on watch channel, keep watching");
            }
            (kind, None) => {
                warn!(name = %self.name, kind = %kind, "watch event without payload, discarded");
            }
            (EventKind::Added | EventKind::Updated | EventKind::Synced, Some(obj)) => self.apply_upsert(obj, "watch"),
            (EventKind::Deleted, Some(obj)) => self.apply_delete(obj),
        }
    }

    /// Classify `obj` against the store and notify; the read and the write share
    /// one store lock.
    fn apply_upsert(&self, obj: T, origin: &'static str) {
        let prev = match self.store.upsert(obj.clone()) {
            Ok(prev) => prev,
            Err(e) => {
                error!(name = %self.name, origin, error = %e, "local store rejected object, discarded");
                return;
            }
        };
        match prev {
            Some(old) => {
                self.handler.on_update(&old, &obj);
                trace!(name = %self.name, origin, ns = obj.namespace(), obj = obj.name(), "update notified");
            }
            None => {
                self.handler.on_add(&obj);
                trace!(name = %self.name, origin, ns = obj.namespace(), obj = obj.name(), "add notified");
            }
        }
    }

    fn apply_delete(&self, obj: T) {
        let cached = match self.store.take(&obj) {
            Ok(cached) => cached,
            Err(e) => {
                error!(name = %self.name, error = %e, "local store rejected deletion");
                return;
            }
        };
        let Some(cached) = cached else {
            warn!(name = %self.name, ns = obj.namespace(), obj = obj.name(), "no local cache for deleted object");
            return;
        };
        if omits_delete_payload(&obj) {
            self.handler.on_delete(&cached);
            trace!(name = %self.name, ns = obj.namespace(), obj = obj.name(), "delete notified with cached object");
        } else {
            self.handler.on_delete(&obj);
            trace!(name = %self.name, ns = obj.namespace(), obj = obj.name(), "delete notified");
        }
    }
}
