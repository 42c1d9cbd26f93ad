use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl TimeSeriesPoint {
    pub fn fleet(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            timestamp,
            value,
            sensor_id: None,
            location_key: None,
            display_name: None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub(in crate::aggregate) struct SeriesPolicy {
    pub(in crate::aggregate) update_interval: ChronoDuration,
    pub(in crate::aggregate) retention: ChronoDuration,
    pub(in crate::aggregate) max_points: usize,
}

/// Append-with-throttle series: at most one point per update interval, pruned
/// to the retention window on every append.
#[derive(Debug, Default, Clone)]
pub(in crate::aggregate) struct ThrottledSeries {
    points: VecDeque<TimeSeriesPoint>,
}

impl ThrottledSeries {
    pub(in crate::aggregate) fn from_points(mut points: Vec<TimeSeriesPoint>) -> Self {
        points.sort_by_key(|p| p.timestamp);
        Self {
            points: points.into(),
        }
    }

    pub(in crate::aggregate) fn offer(
        &mut self,
        point: TimeSeriesPoint,
        policy: &SeriesPolicy,
    ) -> bool {
        if let Some(last) = self.points.back() {
            // also rejects points from a clock that stepped backwards
            if point.timestamp - last.timestamp < policy.update_interval {
                return false;
            }
        }
        let now = point.timestamp;
        self.points.push_back(point);
        self.prune(now, policy.retention);
        while self.points.len() > policy.max_points.max(1) {
            self.points.pop_front();
        }
        true
    }

    pub(in crate::aggregate) fn prune(&mut self, now: DateTime<Utc>, retention: ChronoDuration) {
        let cutoff = now - retention;
        while let Some(front) = self.points.front() {
            if front.timestamp < cutoff {
                self.points.pop_front();
            } else {
                break;
            }
        }
    }

    pub(in crate::aggregate) fn window(
        &self,
        now: DateTime<Utc>,
        retention: ChronoDuration,
    ) -> Vec<TimeSeriesPoint> {
        let cutoff = now - retention;
        self.points
            .iter()
            .filter(|p| p.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    /// Newest `keep` points, for quota-bounded persistence.
    pub(in crate::aggregate) fn newest(&self, keep: usize) -> Vec<TimeSeriesPoint> {
        let skip = self.points.len().saturating_sub(keep);
        self.points.iter().skip(skip).cloned().collect()
    }

    pub(in crate::aggregate) fn len(&self) -> usize {
        self.points.len()
    }

    pub(in crate::aggregate) fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
