//! # Progress Manager
//!
//! Bounded real-time progress streams, one primary stream per tracked audit
//! plus any number of late subscribers.
//!
//! Delivery never blocks: a full stream drops the newest update and a
//! closed subscriber is pruned. Stopping an audit drops its senders, which
//! closes every stream exactly once; stopping again is a no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::ProgressError;
use crate::models::ProgressUpdate;

#[derive(Debug, Default)]
struct TrackedAudit {
    primary: Option<mpsc::Sender<ProgressUpdate>>,
    subscribers: HashMap<u64, mpsc::Sender<ProgressUpdate>>,
}

/// Outcome of delivering to one stream
enum Delivery {
    Sent,
    Dropped,
    Closed,
}

fn deliver(tx: &mpsc::Sender<ProgressUpdate>, update: &ProgressUpdate) -> Delivery {
    match tx.try_send(update.clone()) {
        Ok(()) => Delivery::Sent,
        Err(TrySendError::Full(_)) => Delivery::Dropped,
        Err(TrySendError::Closed(_)) => Delivery::Closed,
    }
}

#[derive(Debug)]
pub struct ProgressManager {
    capacity: usize,
    audits: Mutex<HashMap<String, TrackedAudit>>,
    next_subscriber: AtomicU64,
}

impl Default for ProgressManager {
    fn default() -> Self {
        Self::new(100)
    }
}

impl ProgressManager {
    /// `capacity` bounds every stream handed out
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            audits: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
        }
    }

    fn audits(&self) -> MutexGuard<'_, HashMap<String, TrackedAudit>> {
        self.audits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Begin tracking and return the primary stream
    pub fn start_tracking(
        &self,
        audit_id: &str,
    ) -> Result<mpsc::Receiver<ProgressUpdate>, ProgressError> {
        let mut audits = self.audits();
        if audits.contains_key(audit_id) {
            return Err(ProgressError::AlreadyTracked(audit_id.to_string()));
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        audits.insert(
            audit_id.to_string(),
            TrackedAudit {
                primary: Some(tx),
                subscribers: HashMap::new(),
            },
        );
        tracing::debug!("Tracking progress for {}", audit_id);
        Ok(rx)
    }

    /// Stop tracking and close all of the audit's streams.
    /// Returns whether the audit was tracked.
    pub fn stop_tracking(&self, audit_id: &str) -> bool {
        let removed = self.audits().remove(audit_id);
        match removed {
            Some(mut tracked) => {
                tracked.primary.take();
                tracked.subscribers.clear();
                tracing::debug!("Stopped tracking {}", audit_id);
                true
            }
            None => false,
        }
    }

    /// Stop every tracked audit, returning how many were closed
    pub fn stop_all(&self) -> usize {
        let drained: Vec<(String, TrackedAudit)> = self.audits().drain().collect();
        let count = drained.len();
        drop(drained);
        count
    }

    /// Push an update to every stream of its audit
    pub fn update_progress(&self, update: ProgressUpdate) -> Result<(), ProgressError> {
        let mut audits = self.audits();
        let tracked = audits
            .get_mut(&update.audit_id)
            .ok_or_else(|| ProgressError::NotTracked(update.audit_id.clone()))?;

        let mut dropped = 0;
        if let Some(primary) = &tracked.primary {
            match deliver(primary, &update) {
                Delivery::Sent => {}
                Delivery::Dropped => dropped += 1,
                Delivery::Closed => {
                    tracked.primary = None;
                }
            }
        }

        tracked
            .subscribers
            .retain(|_, tx| match deliver(tx, &update) {
                Delivery::Sent => true,
                Delivery::Dropped => {
                    dropped += 1;
                    true
                }
                Delivery::Closed => false,
            });

        if dropped > 0 {
            tracing::warn!(
                "Progress stream full for {}, dropped '{}' update on {} stream(s)",
                update.audit_id,
                update.step,
                dropped
            );
        }
        Ok(())
    }

    /// Open an extra stream for a tracked audit
    pub fn subscribe(
        &self,
        audit_id: &str,
    ) -> Result<(u64, mpsc::Receiver<ProgressUpdate>), ProgressError> {
        let mut audits = self.audits();
        let tracked = audits
            .get_mut(audit_id)
            .ok_or_else(|| ProgressError::NotTracked(audit_id.to_string()))?;
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        tracked.subscribers.insert(id, tx);
        Ok((id, rx))
    }

    pub fn unsubscribe(&self, audit_id: &str, subscriber: u64) -> bool {
        self.audits()
            .get_mut(audit_id)
            .is_some_and(|t| t.subscribers.remove(&subscriber).is_some())
    }

    pub fn is_tracking(&self, audit_id: &str) -> bool {
        self.audits().contains_key(audit_id)
    }

    /// Sorted ids of tracked audits
    pub fn tracked_audits(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.audits().keys().cloned().collect();
        ids.sort();
        ids
    }
}
