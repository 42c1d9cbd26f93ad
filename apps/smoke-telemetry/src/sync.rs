use crate::broadcast::{BusMessage, SnapshotBus};
use crate::store::{keys, read_json, write_json_evicting, KeyValueStore};
use crate::telemetry::FleetSnapshot;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{Interval, MissedTickBehavior};

/// With a push bus available the store is only polled to recover from gaps.
const PUSH_RECOVERY_POLL_FACTOR: u32 = 5;

/// Eventually consistent snapshot distribution. Every published snapshot is
/// written to the store; `Push` additionally broadcasts it on the bus.
#[derive(Clone)]
pub enum SnapshotSync {
    Push {
        store: Arc<dyn KeyValueStore>,
        bus: SnapshotBus,
        origin: String,
    },
    Poll {
        store: Arc<dyn KeyValueStore>,
        origin: String,
    },
}

impl SnapshotSync {
    pub fn push(store: Arc<dyn KeyValueStore>, bus: SnapshotBus, origin: String) -> Self {
        SnapshotSync::Push { store, bus, origin }
    }

    pub fn poll(store: Arc<dyn KeyValueStore>, origin: String) -> Self {
        SnapshotSync::Poll { store, origin }
    }

    pub fn transport(&self) -> &'static str {
        match self {
            SnapshotSync::Push { .. } => "push",
            SnapshotSync::Poll { .. } => "poll",
        }
    }

    fn store(&self) -> &Arc<dyn KeyValueStore> {
        match self {
            SnapshotSync::Push { store, .. } | SnapshotSync::Poll { store, .. } => store,
        }
    }

    fn origin(&self) -> &str {
        match self {
            SnapshotSync::Push { origin, .. } | SnapshotSync::Poll { origin, .. } => origin,
        }
    }

    pub fn publish(&self, snapshot: &FleetSnapshot) {
        if let Err(err) = write_json_evicting(self.store().as_ref(), keys::SNAPSHOT, snapshot) {
            tracing::warn!(error=%err, "failed to persist snapshot");
        }
        if let SnapshotSync::Push { bus, origin, .. } = self {
            bus.publish(&BusMessage {
                origin: origin.clone(),
                snapshot: snapshot.clone(),
            });
        }
    }

    pub fn feed(&self, poll_interval: Duration) -> SnapshotFeed {
        let (rx, period) = match self {
            SnapshotSync::Push { bus, .. } => {
                (Some(bus.subscribe()), poll_interval * PUSH_RECOVERY_POLL_FACTOR)
            }
            SnapshotSync::Poll { .. } => (None, poll_interval),
        };
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        SnapshotFeed {
            store: self.store().clone(),
            origin: self.origin().to_string(),
            rx,
            ticker,
            last_seen: None,
        }
    }
}

enum Wake {
    Bus(Result<BusMessage, RecvError>),
    Poll,
}

pub struct SnapshotFeed {
    store: Arc<dyn KeyValueStore>,
    origin: String,
    rx: Option<broadcast::Receiver<BusMessage>>,
    ticker: Interval,
    last_seen: Option<DateTime<Utc>>,
}

impl SnapshotFeed {
    pub async fn next(&mut self) -> FleetSnapshot {
        loop {
            let wake = match self.rx.as_mut() {
                Some(rx) => tokio::select! {
                    msg = rx.recv() => Wake::Bus(msg),
                    _ = self.ticker.tick() => Wake::Poll,
                },
                None => {
                    self.ticker.tick().await;
                    Wake::Poll
                }
            };

            let candidate = match wake {
                Wake::Bus(Ok(message)) if message.origin != self.origin => Some(message.snapshot),
                Wake::Bus(Ok(_)) => None,
                Wake::Bus(Err(RecvError::Lagged(skipped))) => {
                    tracing::debug!(skipped, "snapshot feed lagged");
                    None
                }
                Wake::Bus(Err(RecvError::Closed)) => {
                    tracing::warn!("snapshot bus closed; falling back to store polling");
                    self.rx = None;
                    None
                }
                Wake::Poll => read_json::<FleetSnapshot>(self.store.as_ref(), keys::SNAPSHOT),
            };

            if let Some(snapshot) = candidate {
                if self
                    .last_seen
                    .map(|seen| snapshot.captured_at > seen)
                    .unwrap_or(true)
                {
                    self.last_seen = Some(snapshot.captured_at);
                    return snapshot;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn poll_feed_recovers_state_from_store() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::default());
        let owner = SnapshotSync::poll(store.clone(), "owner".to_string());
        owner.publish(&FleetSnapshot::new(Vec::new(), at(0)));

        let follower = SnapshotSync::poll(store, "follower".to_string());
        let mut feed = follower.feed(Duration::from_millis(10));
        assert_eq!(feed.next().await.captured_at, at(0));

        owner.publish(&FleetSnapshot::new(Vec::new(), at(5)));
        assert_eq!(feed.next().await.captured_at, at(5));
    }

    #[tokio::test]
    async fn push_feed_skips_own_and_older_messages() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::default());
        let bus = SnapshotBus::local();
        let owner = SnapshotSync::push(store.clone(), bus.clone(), "owner".to_string());
        let follower = SnapshotSync::push(store, bus.clone(), "follower".to_string());
        let mut feed = follower.feed(Duration::from_secs(60));

        // bus and store both carry this one; either wakeup yields it once
        owner.publish(&FleetSnapshot::new(Vec::new(), at(10)));
        assert_eq!(feed.next().await.captured_at, at(10));

        follower.publish(&FleetSnapshot::new(Vec::new(), at(20)));
        owner.publish(&FleetSnapshot::new(Vec::new(), at(5)));
        owner.publish(&FleetSnapshot::new(Vec::new(), at(30)));
        assert_eq!(feed.next().await.captured_at, at(30));
    }

    #[test]
    fn transport_names() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::default());
        assert_eq!(SnapshotSync::poll(store.clone(), "a".into()).transport(), "poll");
        assert_eq!(
            SnapshotSync::push(store, SnapshotBus::local(), "a".into()).transport(),
            "push"
        );
    }
}
