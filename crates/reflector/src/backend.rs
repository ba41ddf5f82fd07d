use mirra_core::ChangeEvent;
use tokio::sync::mpsc;

/// Failures reported by a [`ListerWatcher`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("list failed: {0}")]
    List(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("watch stream closed")]
    Closed,
}

/// Remote collection exposing a full listing and a change subscription.
#[async_trait::async_trait]
pub trait ListerWatcher<T>: Send + Sync {
    /// Full snapshot of the remote objects.
    async fn list(&self) -> Result<Vec<T>, BackendError>;

    /// Open a live subscription. The backend closes the event channel when the
    /// connection is lost.
    async fn watch(&self) -> Result<Subscription<T>, BackendError>;
}

type StopFn = Box<dyn FnOnce() + Send>;

/// Live change stream handed out by [`ListerWatcher::watch`].
pub struct Subscription<T> {
    rx: mpsc::Receiver<ChangeEvent<T>>,
    on_stop: Option<StopFn>,
    stopped: bool,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::Receiver<ChangeEvent<T>>) -> Self { Self { rx, on_stop: None, stopped: false } }

    /// Subscription that runs `on_stop` once when released.
    pub fn with_stop(rx: mpsc::Receiver<ChangeEvent<T>>, on_stop: impl FnOnce() + Send + 'static) -> Self {
        Self { rx, on_stop: Some(Box::new(on_stop)), stopped: false }
    }

    /// Next event, or `None` once the channel is closed and drained.
    pub async fn next(&mut self) -> Option<ChangeEvent<T>> { self.rx.recv().await }

    pub fn events(&mut self) -> &mut mpsc::Receiver<ChangeEvent<T>> { &mut self.rx }

    pub fn is_stopped(&self) -> bool { self.stopped }

    /// Release the subscription. Safe to call more than once.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.rx.close();
        if let Some(f) = self.on_stop.take() {
            f();
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) { self.stop(); }
}
