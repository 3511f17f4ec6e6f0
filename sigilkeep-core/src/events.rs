//! In-process event bus.
//!
//! Rotation, expiry, authentication, and review notifications are published as
//! typed [`SecretEvent`]s over a tokio broadcast channel. Publishing never
//! blocks: with no subscribers the event is dropped, and a subscriber that
//! falls behind skips the events it missed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

/// Default per-subscriber buffer.
pub const DEFAULT_CAPACITY: usize = 256;

/// Notification published on the event bus.
///
/// Serialized with a `type` tag matching the external event names:
///
/// ```json
/// {"type": "secret:rotated", "backend": "vault", "secretName": "db", "newVersion": "3", "timestamp": "..."}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SecretEvent {
    /// A secret changed upstream and its cache entries were invalidated.
    #[serde(rename = "secret:rotated", rename_all = "camelCase")]
    Rotated {
        backend: String,
        secret_name: String,
        new_version: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A credential will stop working at `expires_at` unless replaced.
    #[serde(rename = "secret:expiring-soon", rename_all = "camelCase")]
    ExpiringSoon {
        backend: String,
        secret_name: String,
        expires_at: DateTime<Utc>,
    },

    /// The backend rejected our identity while resolving a secret.
    #[serde(rename = "secret:auth-failed", rename_all = "camelCase")]
    AuthFailed { backend: String, secret_name: String },

    /// A secret that is not rotated automatically is due for manual review.
    #[serde(rename = "secret:review-due", rename_all = "camelCase")]
    ReviewDue { secret_name: String },

    /// A lease could not be renewed; fresh credentials must be requested.
    #[serde(rename = "secret:lease-expired", rename_all = "camelCase")]
    LeaseExpired {
        backend: String,
        lease_id: String,
        role: String,
    },
}

impl SecretEvent {
    /// Build a rotation event stamped with the current time.
    pub fn rotated(
        backend: impl Into<String>,
        secret_name: impl Into<String>,
        new_version: Option<String>,
    ) -> Self {
        Self::Rotated {
            backend: backend.into(),
            secret_name: secret_name.into(),
            new_version,
            timestamp: Utc::now(),
        }
    }

    /// Wire name of the event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Rotated { .. } => "secret:rotated",
            Self::ExpiringSoon { .. } => "secret:expiring-soon",
            Self::AuthFailed { .. } => "secret:auth-failed",
            Self::ReviewDue { .. } => "secret:review-due",
            Self::LeaseExpired { .. } => "secret:lease-expired",
        }
    }

    /// Secret the event is about, when it names one.
    pub fn secret_name(&self) -> Option<&str> {
        match self {
            Self::Rotated { secret_name, .. }
            | Self::ExpiringSoon { secret_name, .. }
            | Self::AuthFailed { secret_name, .. }
            | Self::ReviewDue { secret_name } => Some(secret_name),
            Self::LeaseExpired { .. } => None,
        }
    }
}

/// Publish/subscribe channel for [`SecretEvent`]s.
///
/// Cloning is cheap; clones publish to the same subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SecretEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Returns the number of subscribers that will see it.
    pub fn publish(&self, event: SecretEvent) -> usize {
        let event_type = event.event_type();
        match self.tx.send(event) {
            Ok(receivers) => {
                tracing::debug!(event_type, receivers, "published event");
                receivers
            }
            Err(_) => {
                tracing::trace!(event_type, "no subscribers for event");
                0
            }
        }
    }

    /// Receive all events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SecretEvent> {
        self.tx.subscribe()
    }

    /// Events published from now on as a stream, skipping any a slow
    /// consumer missed.
    pub fn stream(&self) -> impl Stream<Item = SecretEvent> + Send + 'static {
        BroadcastStream::new(self.tx.subscribe()).filter_map(|result| match result {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!(error = %e, "event stream lagged");
                None
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Run `handler` for every event on a dedicated task until `cancel`
    /// fires or the bus is dropped.
    ///
    /// A handler error is logged and the listener moves on to the next event.
    pub fn spawn_listener<F, Fut, E>(
        &self,
        name: impl Into<String>,
        mut handler: F,
        cancel: CancellationToken,
    ) -> JoinHandle<()>
    where
        F: FnMut(SecretEvent) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send,
        E: std::fmt::Display + Send,
    {
        let name = name.into();
        let mut rx = self.tx.subscribe();

        tokio::spawn(async move {
            tracing::debug!(listener = %name, "event listener started");
            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => received,
                };

                match received {
                    Ok(event) => {
                        let event_type = event.event_type();
                        if let Err(e) = handler(event).await {
                            tracing::warn!(listener = %name, event_type, error = %e, "event handler failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(listener = %name, skipped, "event listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!(listener = %name, "event listener stopped");
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
