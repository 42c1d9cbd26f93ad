mod series;
mod stats;

#[cfg(test)]
mod tests;

pub use series::TimeSeriesPoint;
pub use stats::{LocationStat, RollingStat};

use crate::alert::{classify, SensorStatus, Thresholds};
use crate::store::{keys, read_json, write_json, write_json_evicting, KeyValueStore};
use crate::telemetry::FleetSnapshot;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use series::{SeriesPolicy, ThrottledSeries};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_STATS_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_MAX_HISTORY_POINTS: usize = 500;

#[derive(Clone, Copy, Debug)]
pub struct AggregationPolicy {
    pub update_interval: Duration,
    pub retention: Duration,
    pub stats_window: Duration,
    pub max_history_points: usize,
}

impl Default for AggregationPolicy {
    fn default() -> Self {
        Self {
            update_interval: DEFAULT_UPDATE_INTERVAL,
            retention: DEFAULT_RETENTION,
            stats_window: DEFAULT_STATS_WINDOW,
            max_history_points: DEFAULT_MAX_HISTORY_POINTS,
        }
    }
}

fn to_chrono(duration: Duration, fallback_secs: i64) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::seconds(fallback_secs))
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetStats {
    pub total_count: usize,
    pub online_count: usize,
    pub average_value: f64,
    pub max_value: f64,
    pub alert_count: usize,
}

impl FleetStats {
    pub fn from_snapshot(snapshot: &FleetSnapshot, thresholds: &Thresholds) -> Self {
        let finite: Vec<f64> = snapshot
            .readings
            .iter()
            .map(|r| r.value)
            .filter(|v| v.is_finite())
            .collect();
        let average_value = mean(&finite).unwrap_or(0.0);
        let max_value = finite.iter().copied().fold(None, |acc: Option<f64>, v| {
            Some(acc.map_or(v, |m| m.max(v)))
        });
        Self {
            total_count: snapshot.readings.len(),
            online_count: snapshot.readings.iter().filter(|r| r.online).count(),
            average_value,
            max_value: max_value.unwrap_or(0.0),
            alert_count: snapshot
                .readings
                .iter()
                .filter(|r| classify(r.value, thresholds) != SensorStatus::Safe)
                .count(),
        }
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

#[derive(Clone, Debug, PartialEq)]
pub struct IngestOutcome {
    pub fleet_stats: FleetStats,
    pub fleet_point_appended: bool,
    pub location_points_appended: usize,
}

/// Owns the rolling series and stats, in memory and in the store. Only the
/// lease holder calls [`ingest`](Self::ingest); followers adopt snapshots with
/// [`observe`](Self::observe) and refresh history with [`reload`](Self::reload).
pub struct AggregationEngine {
    store: Arc<dyn KeyValueStore>,
    series_policy: SeriesPolicy,
    stats_window: ChronoDuration,
    thresholds: Thresholds,
    fleet: ThrottledSeries,
    locations: HashMap<String, ThrottledSeries>,
    stats: HashMap<String, RollingStat>,
    current: Option<FleetSnapshot>,
    fleet_stats: FleetStats,
}

impl AggregationEngine {
    pub fn load(
        store: Arc<dyn KeyValueStore>,
        policy: AggregationPolicy,
        thresholds: Thresholds,
        now: DateTime<Utc>,
    ) -> Self {
        let mut engine = Self {
            store,
            series_policy: SeriesPolicy {
                update_interval: to_chrono(policy.update_interval, 60),
                retention: to_chrono(policy.retention, 30 * 60),
                max_points: policy.max_history_points,
            },
            stats_window: to_chrono(policy.stats_window, 24 * 60 * 60),
            thresholds,
            fleet: ThrottledSeries::default(),
            locations: HashMap::new(),
            stats: HashMap::new(),
            current: None,
            fleet_stats: FleetStats::default(),
        };
        engine.reload(now);
        if let Some(snapshot) = read_json::<FleetSnapshot>(engine.store.as_ref(), keys::SNAPSHOT) {
            engine.observe(snapshot);
        }
        tracing::info!(
            fleet_points = engine.fleet.len(),
            locations = engine.locations.len(),
            stats = engine.stats.len(),
            "restored aggregation state"
        );
        engine
    }

    pub fn ingest(&mut self, snapshot: FleetSnapshot, now: DateTime<Utc>) -> IngestOutcome {
        let policy = self.series_policy;
        let window = self.stats_window;

        let finite: Vec<f64> = snapshot
            .readings
            .iter()
            .map(|r| r.value)
            .filter(|v| v.is_finite())
            .collect();
        let fleet_point_appended = match mean(&finite) {
            Some(avg) => self.fleet.offer(TimeSeriesPoint::fleet(now, avg), &policy),
            None => false,
        };

        let mut seen: HashSet<&str> = HashSet::with_capacity(snapshot.readings.len());
        let mut location_points_appended = 0usize;
        for reading in &snapshot.readings {
            seen.insert(reading.location_key.as_str());
            if !reading.value.is_finite() {
                tracing::debug!(sensor = %reading.id, "skipping non-finite reading in aggregation");
                continue;
            }

            let point = TimeSeriesPoint {
                timestamp: now,
                value: reading.value,
                sensor_id: Some(reading.id.clone()),
                location_key: Some(reading.location_key.clone()),
                display_name: Some(reading.display_name.clone()),
            };
            if self
                .locations
                .entry(reading.location_key.clone())
                .or_default()
                .offer(point, &policy)
            {
                location_points_appended += 1;
            }

            let reset = match self.stats.get_mut(&reading.location_key) {
                Some(stat) if !stat.is_stale(now, window) => {
                    stat.absorb(reading.value, &reading.display_name, now);
                    false
                }
                _ => true,
            };
            if reset {
                self.stats.insert(
                    reading.location_key.clone(),
                    RollingStat::fresh(reading.value, &reading.display_name, now),
                );
            }
        }

        self.locations.retain(|key, series| {
            if !seen.contains(key.as_str()) {
                series.prune(now, policy.retention);
            }
            !series.is_empty()
        });
        self.stats.retain(|_, stat| !stat.is_stale(now, window));

        self.persist();

        let fleet_stats = self.observe(snapshot);
        IngestOutcome {
            fleet_stats,
            fleet_point_appended,
            location_points_appended,
        }
    }

    pub fn observe(&mut self, snapshot: FleetSnapshot) -> FleetStats {
        self.fleet_stats = FleetStats::from_snapshot(&snapshot, &self.thresholds);
        self.current = Some(snapshot);
        self.fleet_stats.clone()
    }

    /// Re-reads series and stats persisted by the lease holder.
    pub fn reload(&mut self, now: DateTime<Utc>) {
        let store = self.store.as_ref();
        let retention = self.series_policy.retention;

        let mut fleet = ThrottledSeries::from_points(
            read_json::<Vec<TimeSeriesPoint>>(store, keys::FLEET_SERIES).unwrap_or_default(),
        );
        fleet.prune(now, retention);
        self.fleet = fleet;

        self.locations = read_json::<BTreeMap<String, Vec<TimeSeriesPoint>>>(
            store,
            keys::LOCATION_SERIES,
        )
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(key, points)| {
            let mut series = ThrottledSeries::from_points(points);
            series.prune(now, retention);
            (!series.is_empty()).then_some((key, series))
        })
        .collect();

        let window = self.stats_window;
        self.stats = read_json::<BTreeMap<String, RollingStat>>(store, keys::LOCATION_STATS)
            .unwrap_or_default()
            .into_iter()
            .filter(|(_, stat)| !stat.is_stale(now, window))
            .collect();
    }

    pub fn fleet_series(&self, now: DateTime<Utc>) -> Vec<TimeSeriesPoint> {
        self.fleet.window(now, self.series_policy.retention)
    }

    pub fn location_series(&self, now: DateTime<Utc>) -> BTreeMap<String, Vec<TimeSeriesPoint>> {
        self.locations
            .iter()
            .map(|(key, series)| (key.clone(), series.window(now, self.series_policy.retention)))
            .filter(|(_, points)| !points.is_empty())
            .collect()
    }

    pub fn location_stats(&self, now: DateTime<Utc>) -> Vec<LocationStat> {
        let mut listed: Vec<LocationStat> = self
            .stats
            .iter()
            .filter(|(_, stat)| !stat.is_stale(now, self.stats_window))
            .map(|(key, stat)| LocationStat::from_stat(key, stat))
            .collect();
        listed.sort_by(|a, b| {
            b.max
                .total_cmp(&a.max)
                .then_with(|| a.location_key.cmp(&b.location_key))
        });
        listed
    }

    pub fn fleet_stats(&self) -> FleetStats {
        self.fleet_stats.clone()
    }

    pub fn current_snapshot(&self) -> Option<FleetSnapshot> {
        self.current.clone()
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    fn persist(&self) {
        let store = self.store.as_ref();
        let stats: BTreeMap<&String, &RollingStat> = self.stats.iter().collect();
        if let Err(err) = write_json_evicting(store, keys::LOCATION_STATS, &stats) {
            tracing::warn!(error=%err, "failed to persist rolling stats");
        }

        let longest = self.locations.values().map(ThrottledSeries::len).max().unwrap_or(0);
        write_history(store, keys::LOCATION_SERIES, longest, |keep| {
            self.locations
                .iter()
                .map(|(key, series)| (key.as_str(), series.newest(keep)))
                .collect::<BTreeMap<&str, Vec<TimeSeriesPoint>>>()
        });

        write_history(store, keys::FLEET_SERIES, self.fleet.len(), |keep| {
            self.fleet.newest(keep)
        });
    }
}

/// Write-through with quota fallback: on `QuotaExceeded` the payload is retried
/// with the retained history halved until it fits or one point remains.
fn write_history<T, F>(store: &dyn KeyValueStore, key: &str, total: usize, render: F)
where
    T: Serialize,
    F: Fn(usize) -> T,
{
    let mut keep = total;
    loop {
        match write_json(store, key, &render(keep)) {
            Ok(()) => {
                if keep < total {
                    tracing::warn!(key, kept = keep, total, "persisted truncated history");
                }
                return;
            }
            Err(err) if err.is_quota() && keep > 1 => {
                keep /= 2;
                tracing::debug!(key, keep, "storage quota hit; halving history");
            }
            Err(err) => {
                tracing::warn!(key, error=%err, "failed to persist history");
                return;
            }
        }
    }
}
