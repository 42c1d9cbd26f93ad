use crate::aggregate::AggregationEngine;
use crate::alert::AlertTrigger;
use crate::config::Config;
use crate::coordinator::CoordinatorService;
use crate::ingest::{Ingestor, SourceConfig};
use crate::sync::SnapshotSync;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Follower,
}

/// Everything a cycle mutates. Held behind one async mutex so ingest calls on an
/// instance never interleave.
pub struct EngineState {
    pub aggregation: AggregationEngine,
    pub alerts: AlertTrigger,
}

pub type SharedEngine = Arc<Mutex<EngineState>>;

pub fn shared(aggregation: AggregationEngine, alerts: AlertTrigger) -> SharedEngine {
    Arc::new(Mutex::new(EngineState {
        aggregation,
        alerts,
    }))
}

#[derive(Debug, Clone, Copy)]
pub struct RuntimeSettings {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub takeover_poll_interval: Duration,
    pub follower_poll_interval: Duration,
}

impl RuntimeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            heartbeat_interval: config.heartbeat_interval(),
            takeover_poll_interval: config.takeover_poll_interval(),
            follower_poll_interval: config.follower_poll_interval(),
        }
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// One running engine instance: coordination, ingestion and follower tasks
/// sharing an engine and a role channel.
pub struct Instance {
    coordinator: Arc<CoordinatorService>,
    engine: SharedEngine,
    role_rx: watch::Receiver<Role>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Instance {
    pub fn start(
        coordinator: CoordinatorService,
        engine: SharedEngine,
        ingestor: Ingestor,
        sources: Vec<SourceConfig>,
        sync: SnapshotSync,
        settings: RuntimeSettings,
    ) -> Self {
        let coordinator = Arc::new(coordinator);
        let (role_tx, role_rx) = watch::channel(Role::Follower);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tracing::info!(
            instance = coordinator.self_id(),
            sources = sources.len(),
            transport = sync.transport(),
            "starting instance"
        );

        let tasks = vec![
            tokio::spawn(coordinate(
                coordinator.clone(),
                role_tx,
                settings,
                shutdown_rx.clone(),
            )),
            tokio::spawn(ingest_loop(
                engine.clone(),
                ingestor,
                sources,
                sync.clone(),
                role_rx.clone(),
                settings.poll_interval,
                shutdown_rx.clone(),
            )),
            tokio::spawn(follow(
                engine.clone(),
                sync,
                role_rx.clone(),
                settings.follower_poll_interval,
                shutdown_rx,
            )),
        ];

        Self {
            coordinator,
            engine,
            role_rx,
            shutdown_tx,
            tasks,
        }
    }

    pub fn role(&self) -> Role {
        *self.role_rx.borrow()
    }

    pub fn roles(&self) -> watch::Receiver<Role> {
        self.role_rx.clone()
    }

    pub fn engine(&self) -> SharedEngine {
        self.engine.clone()
    }

    pub fn coordinator(&self) -> Arc<CoordinatorService> {
        self.coordinator.clone()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for mut task in self.tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        self.coordinator.release();
        tracing::info!(instance = self.coordinator.self_id(), "instance stopped");
    }
}

async fn coordinate(
    coordinator: Arc<CoordinatorService>,
    role_tx: watch::Sender<Role>,
    settings: RuntimeSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    if coordinator.try_acquire(Utc::now()) {
        tracing::info!(instance = coordinator.self_id(), "acquired lease at startup");
        role_tx.send_replace(Role::Owner);
    }

    let mut heartbeat = ticker(settings.heartbeat_interval);
    let mut takeover = ticker(settings.takeover_poll_interval);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = heartbeat.tick() => {
                if *role_tx.borrow() == Role::Owner && !coordinator.renew(Utc::now()) {
                    tracing::warn!(instance = coordinator.self_id(), "lease lost; stepping down");
                    role_tx.send_replace(Role::Follower);
                }
            }
            _ = takeover.tick() => {
                if *role_tx.borrow() == Role::Follower && coordinator.try_acquire(Utc::now()) {
                    tracing::info!(instance = coordinator.self_id(), "took over expired lease");
                    role_tx.send_replace(Role::Owner);
                }
            }
        }
    }
}

async fn ingest_loop(
    engine: SharedEngine,
    ingestor: Ingestor,
    sources: Vec<SourceConfig>,
    sync: SnapshotSync,
    role_rx: watch::Receiver<Role>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticks = ticker(poll_interval);
    let mut was_owner = false;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticks.tick() => {}
        }

        let is_owner = *role_rx.borrow() == Role::Owner;
        if !is_owner {
            was_owner = false;
            continue;
        }
        if !was_owner {
            // resume from whatever the previous owner persisted
            engine.lock().await.aggregation.reload(Utc::now());
            was_owner = true;
        }

        let snapshot = ingestor.fetch_cycle(&sources, Utc::now()).await;
        if *role_rx.borrow() != Role::Owner {
            tracing::debug!("lost lease during fetch; dropping cycle");
            continue;
        }

        let now = Utc::now();
        {
            let mut state = engine.lock().await;
            let outcome = state.aggregation.ingest(snapshot.clone(), now);
            if state.alerts.observe(&snapshot, now).is_some() {
                state.alerts.persist();
            }
            tracing::debug!(
                readings = snapshot.readings.len(),
                connected = snapshot.connected,
                fleet_point = outcome.fleet_point_appended,
                location_points = outcome.location_points_appended,
                alert_count = outcome.fleet_stats.alert_count,
                "ingest cycle complete"
            );
        }
        sync.publish(&snapshot);
    }
}

async fn follow(
    engine: SharedEngine,
    sync: SnapshotSync,
    role_rx: watch::Receiver<Role>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut feed = sync.feed(poll_interval);
    loop {
        let snapshot = tokio::select! {
            _ = shutdown.changed() => break,
            snapshot = feed.next() => snapshot,
        };
        if *role_rx.borrow() == Role::Owner {
            continue;
        }

        let now = Utc::now();
        let mut state = engine.lock().await;
        state.aggregation.observe(snapshot.clone());
        state.aggregation.reload(now);
        // notifiers fire locally; the shared history is the owner's
        state.alerts.observe(&snapshot, now);
        state.alerts.reload();
    }
}
