use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

/// 24h accumulator per location. Stale entries are reset outright rather than
/// decayed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollingStat {
    pub max: f64,
    pub min: f64,
    pub sum: f64,
    pub sample_count: u64,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default)]
    pub display_name: String,
}

impl RollingStat {
    pub fn fresh(value: f64, display_name: &str, now: DateTime<Utc>) -> Self {
        Self {
            max: value,
            min: value,
            sum: value,
            sample_count: 1,
            last_updated_at: now,
            display_name: display_name.to_string(),
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>, window: ChronoDuration) -> bool {
        now - self.last_updated_at > window
    }

    pub fn absorb(&mut self, value: f64, display_name: &str, now: DateTime<Utc>) {
        self.max = self.max.max(value);
        self.min = self.min.min(value);
        self.sum += value;
        self.sample_count += 1;
        self.last_updated_at = now;
        if self.display_name != display_name {
            self.display_name = display_name.to_string();
        }
    }

    pub fn avg(&self) -> f64 {
        if self.sample_count == 0 {
            return 0.0;
        }
        self.sum / self.sample_count as f64
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationStat {
    pub location_key: String,
    pub display_name: String,
    pub max: f64,
    pub min: f64,
    pub avg: f64,
    pub sample_count: u64,
    pub last_updated_at: DateTime<Utc>,
}

impl LocationStat {
    pub fn from_stat(location_key: &str, stat: &RollingStat) -> Self {
        Self {
            location_key: location_key.to_string(),
            display_name: stat.display_name.clone(),
            max: stat.max,
            min: stat.min,
            avg: stat.avg(),
            sample_count: stat.sample_count,
            last_updated_at: stat.last_updated_at,
        }
    }
}
