use crate::telemetry::{SensorReading, DEFAULT_UNIT};
use chrono::{DateTime, TimeZone, Utc};

pub const DEFAULT_BUCKET_SECONDS: i64 = 10;
pub const DEFAULT_SEED: u64 = 0x5EED_5A0C_E000_0001;

const SPIKE_PROBABILITY: f64 = 0.04;

pub fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn unit_interval(bits: u64) -> f64 {
    // top 53 bits -> [0, 1)
    (bits >> 11) as f64 / (1u64 << 53) as f64
}

fn mix(seed: u64, sensor_index: u32, time_bucket: i64, lane: u64) -> u64 {
    let a = splitmix64(seed ^ lane.wrapping_mul(0xA24B_AED4_963E_E407));
    let b = splitmix64(a ^ u64::from(sensor_index));
    splitmix64(b ^ time_bucket as u64)
}

pub fn time_bucket(now: DateTime<Utc>, bucket_seconds: i64) -> i64 {
    now.timestamp().div_euclid(bucket_seconds.max(1))
}

/// Simulated concentration for one sensor in one time bucket. Depends only on
/// its arguments, so every instance that observes the same wall-clock bucket
/// reports the same value.
pub fn simulate(seed: u64, sensor_index: u32, time_bucket: i64) -> f64 {
    let baseline = 30.0 + unit_interval(mix(seed, sensor_index, 0, 1)) * 40.0;
    let noise = unit_interval(mix(seed, sensor_index, time_bucket, 2)) * 30.0;
    let spike_roll = unit_interval(mix(seed, sensor_index, time_bucket, 3));
    let value = if spike_roll < SPIKE_PROBABILITY {
        150.0 + unit_interval(mix(seed, sensor_index, time_bucket, 4)) * 250.0
    } else {
        baseline + noise
    };
    (value * 10.0).round() / 10.0
}

#[derive(Debug, Clone)]
pub struct Simulator {
    seed: u64,
    sensor_count: u32,
    bucket_seconds: i64,
}

impl Simulator {
    pub fn new(seed: u64, sensor_count: u32, bucket_seconds: i64) -> Self {
        Self {
            seed,
            sensor_count,
            bucket_seconds: bucket_seconds.max(1),
        }
    }

    pub fn readings(&self, source_id: &str, now: DateTime<Utc>) -> Vec<SensorReading> {
        let bucket = time_bucket(now, self.bucket_seconds);
        let captured_at = Utc
            .timestamp_opt(bucket * self.bucket_seconds, 0)
            .single()
            .unwrap_or(now);
        (0..self.sensor_count)
            .map(|index| {
                let number = index + 1;
                SensorReading {
                    id: format!("{source_id}:sim-{number}"),
                    display_name: format!("Sensor {number}"),
                    location_key: format!("sim-{number}"),
                    value: simulate(self.seed, index, bucket),
                    unit: DEFAULT_UNIT.to_string(),
                    captured_at,
                    online: true,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splitmix_matches_reference_vector() {
        // first outputs of the reference splitmix64 stream seeded with 0
        assert_eq!(splitmix64(0), 0xE220_A839_7B1D_CDAF);
    }

    #[test]
    fn same_bucket_gives_identical_readings_across_instances() {
        let a = Simulator::new(DEFAULT_SEED, 6, DEFAULT_BUCKET_SECONDS);
        let b = Simulator::new(DEFAULT_SEED, 6, DEFAULT_BUCKET_SECONDS);
        let t1 = Utc.timestamp_opt(1_700_000_001, 0).unwrap();
        let t2 = Utc.timestamp_opt(1_700_000_009, 500_000_000).unwrap();
        assert_eq!(a.readings("demo", t1), b.readings("demo", t2));
    }

    #[test]
    fn values_change_between_buckets_and_sensors() {
        let values: Vec<f64> = (0..20).map(|bucket| simulate(DEFAULT_SEED, 0, bucket)).collect();
        assert!(values.windows(2).any(|pair| pair[0] != pair[1]));
        assert_ne!(simulate(DEFAULT_SEED, 0, 5), simulate(DEFAULT_SEED, 1, 5));
    }

    #[test]
    fn values_stay_in_plausible_range() {
        for sensor in 0..8 {
            for bucket in 0..500 {
                let value = simulate(7, sensor, bucket);
                assert!(value.is_finite());
                assert!((30.0..=400.0).contains(&value), "{value}");
            }
        }
    }

    #[test]
    fn spikes_occur_occasionally() {
        let spikes = (0..2_000)
            .filter(|bucket| simulate(DEFAULT_SEED, 3, *bucket) >= 150.0)
            .count();
        assert!(spikes > 0 && spikes < 300, "{spikes}");
    }

    #[test]
    fn captured_at_is_bucket_start() {
        let sim = Simulator::new(1, 1, 10);
        let reading = &sim.readings("demo", Utc.timestamp_opt(1_700_000_007, 0).unwrap())[0];
        assert_eq!(reading.captured_at, Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        assert_eq!(reading.id, "demo:sim-1");
    }
}
