//! Asynchronous event notification
//!
//! Each registration gets its own delivery task which owns the callback and
//! an [`EventProbe`]. The task polls the probe on a fixed interval, so events
//! of one subscription are delivered in the order they were observed, on a
//! context separate from the registering caller.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use corral_core::{Error, NotificationId, Result};

/// Callback receiving notification statuses
///
/// Invoked with `Ok(())` per event, with an error when delivery breaks
/// down, and with a cancellation error when the subscription ends early.
pub type NotificationCallback = Box<dyn FnMut(Result<()>) + Send + 'static>;

/// Source of one kind of event
#[async_trait]
pub trait EventProbe: Send + 'static {
    /// Check the watched condition once
    ///
    /// Returns how many events occurred since the previous poll. An error
    /// ends the subscription.
    async fn poll(&mut self) -> Result<u64>;
}

/// Notification delivery settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// How often probes are polled, in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
        }
    }
}

impl NotifierConfig {
    /// Set the probe polling interval
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = (interval.as_millis() as u64).max(1);
        self
    }

    /// Probe polling interval, never shorter than one millisecond
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        let ms = if self.poll_interval_ms == 0 {
            1
        } else {
            self.poll_interval_ms
        };
        Duration::from_millis(ms)
    }
}

struct Subscription {
    cancel: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Registry of live subscriptions for one handler
///
/// Dropping the notifier cancels every subscription.
pub struct Notifier {
    config: NotifierConfig,
    poll_gate: Arc<RwLock<()>>,
    subscriptions: Mutex<HashMap<NotificationId, Subscription>>,
}

/// Polling suspended for all subscriptions of a notifier
pub struct Paused {
    _guard: OwnedRwLockWriteGuard<()>,
}

impl Notifier {
    /// Create an empty notifier
    #[must_use]
    pub fn new(config: NotifierConfig) -> Self {
        Self {
            config,
            poll_gate: Arc::new(RwLock::new(())),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Start delivering events from `probe` to `callback` under `id`
    ///
    /// # Errors
    /// [`ErrorKind::AlreadyExists`](corral_core::ErrorKind::AlreadyExists) if
    /// `id` is already in use; the callback is dropped without being invoked.
    pub async fn register(
        &self,
        id: NotificationId,
        probe: Box<dyn EventProbe>,
        callback: NotificationCallback,
    ) -> Result<()> {
        let mut subscriptions = self.subscriptions.lock().await;
        if subscriptions.contains_key(&id) {
            return Err(Error::already_exists(format!(
                "Notification id {id} is already registered"
            )));
        }

        let (cancel, cancelled) = oneshot::channel();

        let task = tokio::spawn(deliver(
            id,
            probe,
            callback,
            cancelled,
            Arc::clone(&self.poll_gate),
            self.config.poll_interval(),
        ));

        subscriptions.insert(id, Subscription { cancel, task });

        tracing::debug!(notification = %id, "Subscription started");
        Ok(())
    }

    /// End one subscription
    ///
    /// Returns once its callback has received the cancellation.
    ///
    /// # Errors
    /// [`ErrorKind::NotFound`](corral_core::ErrorKind::NotFound) for an
    /// unknown id.
    pub async fn unregister(&self, id: NotificationId) -> Result<()> {
        let subscription = self
            .subscriptions
            .lock()
            .await
            .remove(&id)
            .ok_or_else(|| Error::not_found(format!("No notification with id {id}")))?;

        let _ = subscription.cancel.send(());
        subscription.task.await?;

        tracing::debug!(notification = %id, "Subscription ended");
        Ok(())
    }

    /// Number of subscriptions still delivering
    pub async fn active(&self) -> usize {
        let mut subscriptions = self.subscriptions.lock().await;
        subscriptions.retain(|_, s| !s.task.is_finished());
        subscriptions.len()
    }

    /// Suspend polling until the guard is passed to [`shutdown`](Self::shutdown)
    /// or dropped
    ///
    /// Used to keep probes off the backend while it is being torn down.
    pub async fn pause(&self) -> Paused {
        Paused {
            _guard: Arc::clone(&self.poll_gate).write_owned().await,
        }
    }

    /// Cancel every subscription and wait for their callbacks to finish
    ///
    /// Returns how many subscriptions were still delivering.
    pub async fn shutdown(&self, paused: Paused) -> usize {
        let drained: Vec<_> = self.subscriptions.lock().await.drain().collect();

        let mut cancelled = 0;
        let mut tasks = Vec::with_capacity(drained.len());
        for (_, subscription) in drained {
            if subscription.cancel.send(()).is_ok() {
                cancelled += 1;
            }
            tasks.push(subscription.task);
        }

        drop(paused);

        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Notification task did not finish cleanly");
            }
        }

        cancelled
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

async fn deliver(
    id: NotificationId,
    mut probe: Box<dyn EventProbe>,
    mut callback: NotificationCallback,
    mut cancelled: oneshot::Receiver<()>,
    poll_gate: Arc<RwLock<()>>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = &mut cancelled => {
                callback(Err(Error::cancelled(format!("notification {id} cancelled"))));
                break;
            }

            _ = ticker.tick() => {
                let outcome = {
                    let _open = poll_gate.read().await;
                    // A teardown may have completed while we waited
                    if !matches!(cancelled.try_recv(), Err(TryRecvError::Empty)) {
                        callback(Err(Error::cancelled(format!("notification {id} cancelled"))));
                        break;
                    }
                    probe.poll().await
                };

                match outcome {
                    Ok(events) => {
                        for _ in 0..events {
                            callback(Ok(()));
                        }
                    }
                    Err(e) => {
                        tracing::warn!(notification = %id, error = %e, "Event source lost");
                        callback(Err(e));
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::ErrorKind;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::mpsc;

    /// Probe firing whatever was queued through the shared counter
    struct CounterProbe {
        pending: Arc<AtomicU64>,
        fail: bool,
    }

    #[async_trait]
    impl EventProbe for CounterProbe {
        async fn poll(&mut self) -> Result<u64> {
            if self.fail {
                return Err(Error::unavailable("event channel closed"));
            }
            Ok(self.pending.swap(0, Ordering::SeqCst))
        }
    }

    fn probe(pending: &Arc<AtomicU64>) -> Box<dyn EventProbe> {
        Box::new(CounterProbe {
            pending: Arc::clone(pending),
            fail: false,
        })
    }

    fn recorder() -> (NotificationCallback, mpsc::UnboundedReceiver<Result<()>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: NotificationCallback = Box::new(move |status: Result<()>| {
            let _ = tx.send(status);
        });
        (callback, rx)
    }

    fn notifier() -> Notifier {
        Notifier::new(NotifierConfig::default().with_poll_interval(Duration::from_millis(5)))
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Result<()>>) -> Option<Result<()>> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timeout")
    }

    #[tokio::test]
    async fn delivers_then_cancels_on_unregister() {
        let notifier = notifier();
        let pending = Arc::new(AtomicU64::new(0));
        let (callback, mut rx) = recorder();

        let id = NotificationId::next();
        notifier.register(id, probe(&pending), callback).await.unwrap();
        pending.store(2, Ordering::SeqCst);

        assert!(next(&mut rx).await.unwrap().is_ok());
        assert!(next(&mut rx).await.unwrap().is_ok());

        notifier.unregister(id).await.unwrap();
        let last = next(&mut rx).await.unwrap();
        assert_eq!(last.unwrap_err().kind(), ErrorKind::Cancelled);

        // Callback was discarded after the cancellation
        assert!(next(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let notifier = notifier();
        let err = notifier.unregister(NotificationId::next()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn lost_source_reports_error_and_stops() {
        let notifier = notifier();
        let (callback, mut rx) = recorder();
        let failing = Box::new(CounterProbe {
            pending: Arc::new(AtomicU64::new(0)),
            fail: true,
        });

        notifier
            .register(NotificationId::next(), failing, callback)
            .await
            .unwrap();

        let status = next(&mut rx).await.unwrap();
        assert_eq!(status.unwrap_err().kind(), ErrorKind::Unavailable);
        assert!(next(&mut rx).await.is_none());
        assert_eq!(notifier.active().await, 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_every_subscription() {
        let notifier = notifier();
        let pending = Arc::new(AtomicU64::new(0));
        let (first, mut first_rx) = recorder();
        let (second, mut second_rx) = recorder();

        let id = NotificationId::next();
        notifier.register(id, probe(&pending), first).await.unwrap();

        let (duplicate, _) = recorder();
        let err = notifier
            .register(id, probe(&pending), duplicate)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        notifier
            .register(NotificationId::next(), probe(&pending), second)
            .await
            .unwrap();
        assert_eq!(notifier.active().await, 2);

        let paused = notifier.pause().await;
        assert_eq!(notifier.shutdown(paused).await, 2);

        for rx in [&mut first_rx, &mut second_rx] {
            let status = next(rx).await.unwrap();
            assert_eq!(status.unwrap_err().kind(), ErrorKind::Cancelled);
            assert!(next(rx).await.is_none());
        }
        assert_eq!(notifier.active().await, 0);
    }

    #[tokio::test]
    async fn zero_interval_from_config_still_polls() {
        let config: NotifierConfig = serde_json::from_str(r#"{"poll_interval_ms":0}"#).unwrap();
        assert_eq!(config.poll_interval(), Duration::from_millis(1));

        let notifier = Notifier::new(config);
        let pending = Arc::new(AtomicU64::new(0));
        let (callback, mut rx) = recorder();

        notifier
            .register(NotificationId::next(), probe(&pending), callback)
            .await
            .unwrap();
        pending.store(1, Ordering::SeqCst);
        assert!(next(&mut rx).await.unwrap().is_ok());

        let paused = notifier.pause().await;
        assert_eq!(notifier.shutdown(paused).await, 1);
        let status = next(&mut rx).await.unwrap();
        assert_eq!(status.unwrap_err().kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn dropping_notifier_cancels() {
        let notifier = notifier();
        let pending = Arc::new(AtomicU64::new(0));
        let (callback, mut rx) = recorder();

        notifier
            .register(NotificationId::next(), probe(&pending), callback)
            .await
            .unwrap();
        drop(notifier);

        let status = next(&mut rx).await.unwrap();
        assert_eq!(status.unwrap_err().kind(), ErrorKind::Cancelled);
    }
}
