use crate::store::{keys, write_json, KeyValueStore, StoreError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_TAKEOVER_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinationLease {
    pub owner_id: String,
    pub heartbeat_at: DateTime<Utc>,
}

impl CoordinationLease {
    pub fn is_live(&self, now: DateTime<Utc>, timeout: ChronoDuration) -> bool {
        now - self.heartbeat_at < timeout
    }
}

/// Advisory single-writer election over the shared store.
///
/// The lease record is a plain shared value, not a lock: two instances can both
/// observe an expired lease and both write it. The instance whose write lost
/// finds out on its next [`renew`](Self::renew) and steps down.
pub struct CoordinatorService {
    store: Arc<dyn KeyValueStore>,
    self_id: String,
    lease_timeout: ChronoDuration,
}

impl CoordinatorService {
    pub fn new(store: Arc<dyn KeyValueStore>, self_id: String, lease_timeout: Duration) -> Self {
        let lease_timeout = ChronoDuration::from_std(lease_timeout)
            .unwrap_or_else(|_| ChronoDuration::seconds(3));
        Self {
            store,
            self_id,
            lease_timeout,
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn current_lease(&self) -> Option<CoordinationLease> {
        self.read_lease().unwrap_or_else(|err| {
            tracing::warn!(error=%err, "failed to read lease");
            None
        })
    }

    /// A corrupt record reads as no lease; a failed read is an error.
    fn read_lease(&self) -> Result<Option<CoordinationLease>, StoreError> {
        let Some(raw) = self.store.get(keys::LEASE)? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(lease) => Ok(Some(lease)),
            Err(err) => {
                tracing::warn!(error=%err, "discarding corrupt lease record");
                Ok(None)
            }
        }
    }

    pub fn try_acquire(&self, now: DateTime<Utc>) -> bool {
        let current = match self.read_lease() {
            Ok(current) => current,
            Err(err) => {
                tracing::warn!(error=%err, "lease unreadable; staying follower");
                return false;
            }
        };
        if let Some(lease) = current {
            if lease.is_live(now, self.lease_timeout) {
                return false;
            }
            tracing::info!(
                previous_owner = %lease.owner_id,
                instance = %self.self_id,
                "lease expired; taking over"
            );
        }

        let lease = CoordinationLease {
            owner_id: self.self_id.clone(),
            heartbeat_at: now,
        };
        match write_json(self.store.as_ref(), keys::LEASE, &lease) {
            Ok(()) => {
                tracing::info!(instance = %self.self_id, "acquired ingest lease");
                true
            }
            Err(err) => {
                tracing::warn!(error=%err, "failed to write lease; staying follower");
                false
            }
        }
    }

    /// Refreshes the heartbeat when this instance still owns the lease.
    pub fn renew(&self, now: DateTime<Utc>) -> bool {
        let Some(mut lease) = self.current_lease() else {
            return false;
        };
        if lease.owner_id != self.self_id {
            return false;
        }
        lease.heartbeat_at = now;
        if let Err(err) = write_json(self.store.as_ref(), keys::LEASE, &lease) {
            // keep ownership; the next heartbeat retries before the lease expires
            tracing::warn!(error=%err, "failed to renew lease");
        }
        true
    }

    pub fn release(&self) {
        let Some(lease) = self.current_lease() else {
            return;
        };
        if lease.owner_id != self.self_id {
            return;
        }
        match self.store.remove(keys::LEASE) {
            Ok(()) => tracing::info!(instance = %self.self_id, "released ingest lease"),
            Err(err) => tracing::warn!(error=%err, "failed to release lease"),
        }
    }

    pub fn is_owner(&self, now: DateTime<Utc>) -> bool {
        self.current_lease()
            .map(|lease| lease.owner_id == self.self_id && lease.is_live(now, self.lease_timeout))
            .unwrap_or(false)
    }
}
