//! Rotation watching.
//!
//! A [`RotationWatcher`] runs one background task per backend that notices
//! when a secret changed upstream. Both strategies end in the same detection
//! path: invalidate every cache entry of the secret, then publish
//! [`SecretEvent::Rotated`].
//!
//! Detection runs under the watcher's control lock and re-checks that the
//! watcher is still `Watching`, so once [`RotationWatcher::stop`] returns no
//! further invalidation or event can come from that watcher.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{ChangeNotice, SecretBackend};
use crate::cache::ResolutionCache;
use crate::error::{Result, SecretError};
use crate::events::{EventBus, SecretEvent};
use crate::model::BackendId;

/// How changes are detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStrategy {
    /// Compare version markers of cached secrets every `interval`. Failed
    /// polls back off exponentially up to `max_backoff`.
    Poll {
        interval: Duration,
        max_backoff: Duration,
    },
    /// Consume the backend's change feed.
    Subscribe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Stopped,
    Watching,
}

struct Control {
    state: WatcherState,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Shared detection path used by both strategies.
#[derive(Clone)]
struct Detector {
    backend: BackendId,
    cache: ResolutionCache,
    events: EventBus,
    control: Arc<Mutex<Control>>,
    cancel: CancellationToken,
}

impl Detector {
    /// Returns false when the watcher was stopped before the change landed.
    fn on_detected_change(&self, secret_name: &str, new_version: Option<String>) -> bool {
        let control = self.control.lock();
        if control.state != WatcherState::Watching || self.cancel.is_cancelled() {
            tracing::debug!(backend = %self.backend, secret = %secret_name, "dropping change detected after stop");
            return false;
        }

        let removed = self.cache.invalidate(&self.backend, secret_name);
        tracing::info!(
            backend = %self.backend,
            secret = %secret_name,
            new_version = ?new_version,
            removed,
            "detected secret rotation"
        );
        self.events.publish(SecretEvent::rotated(
            self.backend.as_str(),
            secret_name,
            new_version,
        ));
        true
    }

    fn on_auth_failure(&self, secret_name: &str) {
        let control = self.control.lock();
        if control.state != WatcherState::Watching || self.cancel.is_cancelled() {
            return;
        }
        self.events.publish(SecretEvent::AuthFailed {
            backend: self.backend.to_string(),
            secret_name: secret_name.to_string(),
        });
    }
}

/// Background detector of upstream secret changes for one backend.
pub struct RotationWatcher {
    backend: Arc<dyn SecretBackend>,
    strategy: WatchStrategy,
    cache: ResolutionCache,
    events: EventBus,
    control: Arc<Mutex<Control>>,
}

impl RotationWatcher {
    pub fn new(
        backend: Arc<dyn SecretBackend>,
        strategy: WatchStrategy,
        cache: ResolutionCache,
        events: EventBus,
    ) -> Self {
        Self {
            backend,
            strategy,
            cache,
            events,
            control: Arc::new(Mutex::new(Control {
                state: WatcherState::Stopped,
                cancel: CancellationToken::new(),
                task: None,
            })),
        }
    }

    pub fn backend_id(&self) -> &BackendId {
        self.backend.id()
    }

    pub fn strategy(&self) -> WatchStrategy {
        self.strategy
    }

    pub fn state(&self) -> WatcherState {
        self.control.lock().state
    }

    /// Start watching. Calling this while already watching is a no-op.
    ///
    /// Fails with `BackendUnsupported` when the subscribe strategy is used
    /// against a backend without a change feed.
    pub fn start(&self) -> Result<()> {
        let mut control = self.control.lock();
        if control.state == WatcherState::Watching {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let detector = Detector {
            backend: self.backend.id().clone(),
            cache: self.cache.clone(),
            events: self.events.clone(),
            control: self.control.clone(),
            cancel: cancel.clone(),
        };

        let task = match self.strategy {
            WatchStrategy::Poll {
                interval,
                max_backoff,
            } => tokio::spawn(poll_loop(
                self.backend.clone(),
                detector,
                interval,
                max_backoff,
            )),
            WatchStrategy::Subscribe => {
                let feed = self.backend.subscribe_changes().ok_or_else(|| {
                    SecretError::unsupported(self.backend.id().as_str(), "change notifications")
                })?;
                tokio::spawn(subscribe_loop(feed, detector))
            }
        };

        control.state = WatcherState::Watching;
        control.cancel = cancel;
        control.task = Some(task);

        tracing::info!(backend = %self.backend.id(), strategy = ?self.strategy, "rotation watcher started");
        Ok(())
    }

    /// Stop watching and wait for the background task to finish.
    ///
    /// No detection callback fires after this returns, even one that was
    /// already running when `stop` was called.
    pub async fn stop(&self) {
        let task = {
            let mut control = self.control.lock();
            if control.state == WatcherState::Stopped {
                return;
            }
            control.state = WatcherState::Stopped;
            control.cancel.cancel();
            control.task.take()
        };

        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        tracing::info!(backend = %self.backend.id(), "rotation watcher stopped");
    }
}

impl Drop for RotationWatcher {
    fn drop(&mut self) {
        let mut control = self.control.lock();
        control.state = WatcherState::Stopped;
        control.cancel.cancel();
        if let Some(task) = control.task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for RotationWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotationWatcher")
            .field("backend", self.backend.id())
            .field("strategy", &self.strategy)
            .field("state", &self.state())
            .finish()
    }
}

async fn poll_loop(
    backend: Arc<dyn SecretBackend>,
    detector: Detector,
    interval: Duration,
    max_backoff: Duration,
) {
    let mut markers: HashMap<String, String> = HashMap::new();
    let mut delay = interval;

    loop {
        tokio::select! {
            _ = detector.cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        match poll_once(backend.as_ref(), &detector, &mut markers).await {
            Ok(()) => delay = interval,
            Err(SecretError::BackendUnsupported { message, .. }) => {
                tracing::error!(
                    backend = %detector.backend,
                    error = %message,
                    "backend cannot be polled for changes, watcher idle"
                );
                break;
            }
            Err(e) => {
                delay = delay.saturating_mul(2).min(max_backoff);
                tracing::warn!(
                    backend = %detector.backend,
                    error = %e,
                    retry_in = ?delay,
                    "rotation poll failed, backing off"
                );
            }
        }
    }
}

/// Compare version markers of every cached secret against the last poll.
///
/// The first marker seen for a secret is its baseline. Markers of secrets no
/// longer cached are forgotten.
async fn poll_once(
    backend: &dyn SecretBackend,
    detector: &Detector,
    markers: &mut HashMap<String, String>,
) -> Result<()> {
    let names = detector.cache.cached_names(&detector.backend);
    markers.retain(|name, _| names.binary_search(name).is_ok());

    for name in names {
        if detector.cancel.is_cancelled() {
            return Ok(());
        }

        let marker = match backend.version_marker(&name).await {
            Ok(marker) => marker,
            Err(SecretError::NotFound { .. }) => {
                markers.remove(&name);
                continue;
            }
            Err(e) => {
                if e.is_auth_failure() {
                    detector.on_auth_failure(&name);
                }
                return Err(e);
            }
        };

        match markers.insert(name.clone(), marker.clone()) {
            Some(previous) if previous != marker => {
                detector.on_detected_change(&name, Some(marker));
            }
            Some(_) => {}
            None => {
                tracing::trace!(backend = %detector.backend, secret = %name, "recorded version baseline");
            }
        }
    }
    Ok(())
}

async fn subscribe_loop(mut feed: mpsc::Receiver<ChangeNotice>, detector: Detector) {
    loop {
        let notice = tokio::select! {
            _ = detector.cancel.cancelled() => break,
            notice = feed.recv() => notice,
        };

        match notice {
            Some(notice) => {
                detector.on_detected_change(&notice.secret_name, notice.new_version);
            }
            None => {
                tracing::warn!(backend = %detector.backend, "change feed closed, watcher idle");
                break;
            }
        }
    }
}
