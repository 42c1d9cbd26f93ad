use crate::store::{keys, read_json, write_json_evicting, KeyValueStore};
use crate::telemetry::FleetSnapshot;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const MAX_NOTIFICATIONS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorStatus {
    Safe,
    Warning,
    Danger,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub warning: f64,
    pub danger: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            warning: 100.0,
            danger: 200.0,
        }
    }
}

/// NaN never compares, so it classifies as safe.
pub fn classify(value: f64, thresholds: &Thresholds) -> SensorStatus {
    if value >= thresholds.danger {
        SensorStatus::Danger
    } else if value >= thresholds.warning {
        SensorStatus::Warning
    } else {
        SensorStatus::Safe
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEntry {
    pub id: Uuid,
    pub fired_at: DateTime<Utc>,
    pub title: String,
    pub message: String,
    pub peak_value: f64,
    pub sensor_ids: Vec<String>,
}

pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;
    fn notify(&self, alert: &NotificationEntry) -> Result<()>;
}

pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    fn notify(&self, alert: &NotificationEntry) -> Result<()> {
        tracing::warn!(
            title = %alert.title,
            peak = alert.peak_value,
            sensors = ?alert.sensor_ids,
            "{}",
            alert.message
        );
        Ok(())
    }
}

/// Posts alerts to a webhook from a background task so a slow endpoint never
/// holds up aggregation.
#[derive(Clone)]
pub struct WebhookNotifier {
    tx: mpsc::Sender<NotificationEntry>,
}

impl WebhookNotifier {
    pub fn spawn(url: String, queue: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<NotificationEntry>(queue.max(1));
        tokio::spawn(async move {
            let client = Client::new();
            while let Some(alert) = rx.recv().await {
                match client.post(&url).json(&alert).send().await {
                    Ok(response) if !response.status().is_success() => {
                        tracing::warn!(status=%response.status(), "alert webhook returned non-success");
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!(error=%err, "alert webhook failed"),
                }
            }
        });
        Self { tx }
    }
}

impl Notifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn notify(&self, alert: &NotificationEntry) -> Result<()> {
        self.tx
            .try_send(alert.clone())
            .map_err(|err| anyhow!("webhook queue: {err}"))
    }
}

pub struct SoundNotifier {
    program: String,
    args: Vec<String>,
}

impl SoundNotifier {
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl Notifier for SoundNotifier {
    fn name(&self) -> &'static str {
        "sound"
    }

    fn notify(&self, _alert: &NotificationEntry) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .context("sound notifier needs a tokio runtime")?;
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program))?;
        let program = self.program.clone();
        runtime.spawn(async move {
            match child.wait().await {
                Ok(status) if !status.success() => {
                    tracing::warn!(program=%program, status=%status, "alarm sound command failed");
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(program=%program, error=%err, "alarm sound command lost"),
            }
        });
        Ok(())
    }
}

/// Edge-triggered fleet danger alarm. Fires only on the transition into danger
/// and only once the cooldown since the previous fire has elapsed.
pub struct AlertTrigger {
    thresholds: Thresholds,
    cooldown: ChronoDuration,
    was_in_danger: bool,
    last_fired: Option<DateTime<Utc>>,
    notifiers: Vec<Box<dyn Notifier>>,
    store: Arc<dyn KeyValueStore>,
    history: VecDeque<NotificationEntry>,
}

impl AlertTrigger {
    pub fn new(
        thresholds: Thresholds,
        cooldown: std::time::Duration,
        notifiers: Vec<Box<dyn Notifier>>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let history = load_history(store.as_ref());
        Self {
            thresholds,
            cooldown: ChronoDuration::from_std(cooldown)
                .unwrap_or_else(|_| ChronoDuration::seconds(30)),
            was_in_danger: false,
            last_fired: None,
            notifiers,
            store,
            history,
        }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn notifications(&self) -> Vec<NotificationEntry> {
        self.history.iter().cloned().collect()
    }

    pub fn observe(
        &mut self,
        snapshot: &FleetSnapshot,
        now: DateTime<Utc>,
    ) -> Option<NotificationEntry> {
        let danger: Vec<_> = snapshot
            .readings
            .iter()
            .filter(|r| classify(r.value, &self.thresholds) == SensorStatus::Danger)
            .collect();
        let in_danger = !danger.is_empty();
        let rising = in_danger && !self.was_in_danger;
        self.was_in_danger = in_danger;

        if !rising {
            return None;
        }
        if let Some(last) = self.last_fired {
            if now - last < self.cooldown {
                tracing::debug!("danger alert suppressed by cooldown");
                return None;
            }
        }
        self.last_fired = Some(now);

        let peak = danger
            .iter()
            .map(|r| r.value)
            .fold(f64::NEG_INFINITY, f64::max);
        // JSON has no infinity; keep the persisted history decodable
        let peak = if peak.is_finite() { peak } else { f64::MAX };
        let names: Vec<&str> = danger.iter().map(|r| r.display_name.as_str()).collect();
        let entry = NotificationEntry {
            id: Uuid::new_v4(),
            fired_at: now,
            title: "Smoke danger".to_string(),
            message: format!(
                "{} sensor(s) at or above {}: {}",
                danger.len(),
                self.thresholds.danger,
                names.join(", ")
            ),
            peak_value: peak,
            sensor_ids: danger.iter().map(|r| r.id.clone()).collect(),
        };

        for notifier in &self.notifiers {
            if let Err(err) = notifier.notify(&entry) {
                tracing::warn!(notifier = notifier.name(), error=%err, "alert side effect failed");
            }
        }
        self.record(entry.clone());
        Some(entry)
    }

    fn record(&mut self, entry: NotificationEntry) {
        self.history.push_front(entry);
        self.history.truncate(MAX_NOTIFICATIONS);
    }

    /// Writes the history through to the store. Only the lease holder calls
    /// this; other instances [`reload`](Self::reload) what it wrote.
    pub fn persist(&self) {
        let entries: Vec<&NotificationEntry> = self.history.iter().collect();
        if let Err(err) = write_json_evicting(self.store.as_ref(), keys::NOTIFICATIONS, &entries) {
            tracing::warn!(error=%err, "failed to persist notification history");
        }
    }

    pub fn reload(&mut self) {
        self.history = load_history(self.store.as_ref());
    }
}

fn load_history(store: &dyn KeyValueStore) -> VecDeque<NotificationEntry> {
    read_json::<Vec<NotificationEntry>>(store, keys::NOTIFICATIONS)
        .unwrap_or_default()
        .into_iter()
        .take(MAX_NOTIFICATIONS)
        .collect()
}
