//! Review schedules for secrets that are not rotated automatically.
//!
//! A schedule with `review_every_days` set becomes due once that many days
//! have passed since the last review (or immediately if it was never
//! reviewed). Dynamic secrets are leased and never due. Each due schedule is
//! announced once with `secret:review-due` until it is marked reviewed.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::{EventBus, SecretEvent};

/// How a secret is kept current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Rotated by the backend.
    #[default]
    Auto,
    /// Rotated by an operator.
    Manual,
    /// Issued per request as a lease.
    Dynamic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewSchedule {
    pub secret_name: String,
    #[serde(default)]
    pub classification: Classification,
    #[serde(default)]
    pub review_every_days: Option<u32>,
    #[serde(default)]
    pub last_reviewed_at: Option<DateTime<Utc>>,
}

impl ReviewSchedule {
    pub fn new(secret_name: impl Into<String>, classification: Classification) -> Self {
        Self {
            secret_name: secret_name.into(),
            classification,
            review_every_days: None,
            last_reviewed_at: None,
        }
    }

    pub fn every_days(mut self, days: u32) -> Self {
        self.review_every_days = Some(days);
        self
    }

    /// When the next review is due, if the schedule has one.
    pub fn next_review_at(&self) -> Option<DateTime<Utc>> {
        if self.classification == Classification::Dynamic {
            return None;
        }
        let days = self.review_every_days?;
        Some(match self.last_reviewed_at {
            Some(last) => last + ChronoDuration::days(i64::from(days)),
            None => DateTime::<Utc>::MIN_UTC,
        })
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_review_at().is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct Reviews {
    schedules: BTreeMap<String, ReviewSchedule>,
    announced: HashSet<String>,
}

/// Tracks review schedules and announces the ones that fall due.
#[derive(Clone, Default)]
pub struct ReviewRegistry {
    inner: Arc<Mutex<Reviews>>,
}

impl ReviewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_schedules(schedules: impl IntoIterator<Item = ReviewSchedule>) -> Self {
        let registry = Self::new();
        for schedule in schedules {
            registry.register(schedule);
        }
        registry
    }

    /// Add or replace the schedule for a secret.
    pub fn register(&self, schedule: ReviewSchedule) {
        let mut reviews = self.inner.lock();
        reviews.announced.remove(&schedule.secret_name);
        reviews
            .schedules
            .insert(schedule.secret_name.clone(), schedule);
    }

    /// Record a review. Returns false for an unknown secret.
    pub fn mark_reviewed(&self, secret_name: &str, at: DateTime<Utc>) -> bool {
        let mut reviews = self.inner.lock();
        let Some(schedule) = reviews.schedules.get_mut(secret_name) else {
            return false;
        };
        schedule.last_reviewed_at = Some(at);
        reviews.announced.remove(secret_name);
        tracing::info!(secret = %secret_name, "secret marked reviewed");
        true
    }

    pub fn get(&self, secret_name: &str) -> Option<ReviewSchedule> {
        self.inner.lock().schedules.get(secret_name).cloned()
    }

    /// Schedules due at `now`, by name.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<ReviewSchedule> {
        self.inner
            .lock()
            .schedules
            .values()
            .filter(|schedule| schedule.is_due(now))
            .cloned()
            .collect()
    }

    /// Publish `secret:review-due` for every newly due schedule.
    ///
    /// Returns how many events were published.
    pub fn check_and_publish(&self, events: &EventBus, now: DateTime<Utc>) -> usize {
        let newly_due: Vec<String> = {
            let mut reviews = self.inner.lock();
            let due: Vec<String> = reviews
                .schedules
                .values()
                .filter(|schedule| schedule.is_due(now))
                .map(|schedule| schedule.secret_name.clone())
                .collect();
            due.into_iter()
                .filter(|name| reviews.announced.insert(name.clone()))
                .collect()
        };

        for secret_name in &newly_due {
            tracing::info!(secret = %secret_name, "secret review due");
            events.publish(SecretEvent::ReviewDue {
                secret_name: secret_name.clone(),
            });
        }
        newly_due.len()
    }

    /// Check schedules every `interval` until cancelled.
    pub fn spawn_checker(
        &self,
        events: EventBus,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.check_and_publish(&events, Utc::now());
                    }
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().schedules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ReviewRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReviewRegistry")
            .field("schedules", &self.len())
            .finish()
    }
}
