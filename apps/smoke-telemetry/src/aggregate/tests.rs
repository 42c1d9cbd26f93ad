use super::*;
use crate::store::MemoryStore;
use crate::telemetry::SensorReading;
use chrono::TimeZone;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn reading(location: &str, value: f64) -> SensorReading {
    SensorReading {
        id: format!("src:{location}"),
        display_name: location.to_uppercase(),
        location_key: location.to_string(),
        value,
        unit: "ADC".to_string(),
        captured_at: at(0),
        online: true,
    }
}

fn snapshot(readings: Vec<SensorReading>, now: DateTime<Utc>) -> FleetSnapshot {
    FleetSnapshot::new(readings, now)
}

fn engine_with(store: Arc<dyn KeyValueStore>, now: DateTime<Utc>) -> AggregationEngine {
    AggregationEngine::load(store, AggregationPolicy::default(), Thresholds::default(), now)
}

fn engine() -> AggregationEngine {
    engine_with(Arc::new(MemoryStore::default()), at(0))
}

#[test]
fn throttles_fleet_series_to_update_interval() {
    let mut engine = engine();
    for (t, value) in [(0, 50.0), (10, 55.0), (70, 60.0)] {
        engine.ingest(snapshot(vec![reading("s1", value)], at(t)), at(t));
    }

    let series = engine.fleet_series(at(70));
    assert_eq!(series.len(), 2);
    assert_eq!((series[0].timestamp, series[0].value), (at(0), 50.0));
    assert_eq!((series[1].timestamp, series[1].value), (at(70), 60.0));
}

#[test]
fn rapid_cycles_append_one_point_per_location() {
    let mut engine = engine();
    let mut appended = 0;
    for half_seconds in 0..100 {
        let now = Utc.timestamp_millis_opt(1_700_000_000_000 + half_seconds * 500).unwrap();
        let outcome = engine.ingest(snapshot(vec![reading("s1", 40.0)], now), now);
        appended += outcome.location_points_appended;
    }
    assert_eq!(appended, 1);
    assert_eq!(engine.location_series(at(50))["s1"].len(), 1);
}

#[test]
fn locations_throttle_independently() {
    let mut engine = engine();
    engine.ingest(snapshot(vec![reading("a", 10.0)], at(0)), at(0));
    let outcome = engine.ingest(
        snapshot(vec![reading("a", 11.0), reading("b", 20.0)], at(30)),
        at(30),
    );
    assert_eq!(outcome.location_points_appended, 1);
    assert!(!outcome.fleet_point_appended);

    let series = engine.location_series(at(30));
    assert_eq!(series["a"].len(), 1);
    assert_eq!(series["b"].len(), 1);
    assert_eq!(series["b"][0].sensor_id.as_deref(), Some("src:b"));
    assert_eq!(series["b"][0].display_name.as_deref(), Some("B"));
}

#[test]
fn retention_window_prunes_old_points() {
    let mut engine = engine();
    for minute in 0..=40 {
        let now = at(minute * 60);
        engine.ingest(snapshot(vec![reading("s1", minute as f64)], now), now);
    }
    let last = at(40 * 60);
    let epsilon = ChronoDuration::seconds(5);
    let query_at = last + ChronoDuration::minutes(30) + epsilon;
    let cutoff = last + epsilon - ChronoDuration::minutes(30);

    assert!(engine.fleet_series(query_at).iter().all(|p| p.timestamp >= cutoff));
    assert!(engine
        .location_series(query_at)
        .values()
        .flatten()
        .all(|p| p.timestamp >= cutoff));
    // at append time the stored series already holds only the last 30 minutes
    let stored = engine.fleet_series(last);
    assert_eq!(stored.len(), 31);
    assert_eq!(stored[0].timestamp, at(10 * 60));
}

#[test]
fn empty_snapshot_emits_no_point() {
    let mut engine = engine();
    let outcome = engine.ingest(FleetSnapshot::disconnected(at(0)), at(0));
    assert!(!outcome.fleet_point_appended);
    assert_eq!(outcome.fleet_stats, FleetStats::default());
    assert!(engine.fleet_series(at(0)).is_empty());
    assert!(!engine.current_snapshot().unwrap().connected);
}

#[test]
fn stats_accumulate_then_reset_after_gap() {
    let mut engine = engine();
    engine.ingest(snapshot(vec![reading("s1", 10.0)], at(0)), at(0));
    engine.ingest(snapshot(vec![reading("s1", 30.0)], at(60)), at(60));
    engine.ingest(snapshot(vec![reading("s1", 20.0)], at(120)), at(120));

    let stats = engine.location_stats(at(120));
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].max, 30.0);
    assert_eq!(stats[0].min, 10.0);
    assert_eq!(stats[0].avg, 20.0);
    assert_eq!(stats[0].sample_count, 3);

    let later = at(120) + ChronoDuration::hours(24) + ChronoDuration::seconds(1);
    engine.ingest(snapshot(vec![reading("s1", 7.0)], later), later);
    let stats = engine.location_stats(later);
    assert_eq!(stats[0].sample_count, 1);
    assert_eq!((stats[0].max, stats[0].min, stats[0].avg), (7.0, 7.0, 7.0));
}

#[test]
fn departed_sensors_are_swept_after_stats_window() {
    let mut engine = engine();
    engine.ingest(
        snapshot(vec![reading("gone", 90.0), reading("kept", 10.0)], at(0)),
        at(0),
    );
    let later = at(0) + ChronoDuration::hours(25);
    engine.ingest(snapshot(vec![reading("kept", 12.0)], later), later);

    let keys: Vec<String> = engine
        .location_stats(later)
        .into_iter()
        .map(|s| s.location_key)
        .collect();
    assert_eq!(keys, vec!["kept"]);
    assert!(!engine.location_series(later).contains_key("gone"));
}

#[test]
fn stats_listing_is_sorted_by_max_descending() {
    let mut engine = engine();
    engine.ingest(
        snapshot(
            vec![reading("low", 5.0), reading("high", 250.0), reading("mid", 80.0)],
            at(0),
        ),
        at(0),
    );
    let order: Vec<String> = engine
        .location_stats(at(0))
        .into_iter()
        .map(|s| s.location_key)
        .collect();
    assert_eq!(order, vec!["high", "mid", "low"]);
}

#[test]
fn fleet_stats_summarise_snapshot() {
    let mut engine = engine();
    let mut offline = reading("c", 220.0);
    offline.online = false;
    let outcome = engine.ingest(
        snapshot(vec![reading("a", 50.0), reading("b", 150.0), offline], at(0)),
        at(0),
    );
    let stats = outcome.fleet_stats;
    assert_eq!(stats.total_count, 3);
    assert_eq!(stats.online_count, 2);
    assert_eq!(stats.average_value, 140.0);
    assert_eq!(stats.max_value, 220.0);
    assert_eq!(stats.alert_count, 2);
    assert_eq!(engine.fleet_stats(), stats);
}

#[test]
fn non_finite_and_negative_values_do_not_break_aggregation() {
    let mut engine = engine();
    let outcome = engine.ingest(
        snapshot(
            vec![reading("nan", f64::NAN), reading("neg", -3.0), reading("ok", 9.0)],
            at(0),
        ),
        at(0),
    );
    assert!(outcome.fleet_point_appended);
    assert_eq!(engine.fleet_series(at(0))[0].value, 3.0);
    assert_eq!(outcome.fleet_stats.total_count, 3);
    assert!(!engine.location_series(at(0)).contains_key("nan"));
    assert_eq!(engine.location_stats(at(0)).len(), 2);

    let all_nan = engine.ingest(snapshot(vec![reading("nan", f64::NAN)], at(90)), at(90));
    assert!(!all_nan.fleet_point_appended);
}

#[test]
fn replaying_a_snapshot_inside_the_window_leaves_series_alone() {
    let mut engine = engine();
    let snap = snapshot(vec![reading("s1", 40.0)], at(0));
    engine.ingest(snap.clone(), at(0));
    let replay = engine.ingest(snap, at(1));
    assert!(!replay.fleet_point_appended);
    assert_eq!(replay.location_points_appended, 0);
    assert_eq!(engine.fleet_series(at(1)).len(), 1);
    // stats are an accumulator, so a replay counts twice
    assert_eq!(engine.location_stats(at(1))[0].sample_count, 2);
}

#[test]
fn persisted_stats_round_trip_and_drop_stale_entries() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::default());
    let mut writer = engine_with(store.clone(), at(0));
    writer.ingest(snapshot(vec![reading("old", 300.0)], at(0)), at(0));
    let t1 = at(0) + ChronoDuration::hours(20);
    writer.ingest(
        snapshot(vec![reading("a", 10.0), reading("b", 70.0)], t1),
        t1,
    );
    let t2 = t1 + ChronoDuration::minutes(1);
    writer.ingest(
        snapshot(vec![reading("a", 30.0), reading("b", 90.0)], t2),
        t2,
    );

    let reload_at = at(0) + ChronoDuration::hours(24) + ChronoDuration::minutes(5);
    let expected: Vec<LocationStat> = writer
        .location_stats(reload_at)
        .into_iter()
        .filter(|s| s.location_key != "old")
        .collect();

    let reloaded = engine_with(store, reload_at);
    let stats = reloaded.location_stats(reload_at);
    assert_eq!(stats, expected);
    assert!(stats.iter().all(|s| s.location_key != "old"));
    assert_eq!(stats[0].avg, 80.0);
}

#[test]
fn reload_restores_series_and_current_snapshot() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::default());
    let mut writer = engine_with(store.clone(), at(0));
    let snap = snapshot(vec![reading("s1", 42.0)], at(0));
    writer.ingest(snap.clone(), at(0));
    write_json(store.as_ref(), keys::SNAPSHOT, &snap).unwrap();

    let reader = engine_with(store, at(30));
    assert_eq!(reader.fleet_series(at(30)), writer.fleet_series(at(30)));
    assert_eq!(reader.location_series(at(30)), writer.location_series(at(30)));
    assert_eq!(reader.current_snapshot(), Some(snap));
    assert_eq!(reader.fleet_stats().total_count, 1);
}

#[test]
fn follower_observe_does_not_accumulate() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::default());
    let mut owner = engine_with(store.clone(), at(0));
    let mut follower = engine_with(store, at(0));

    let snap = snapshot(vec![reading("s1", 120.0)], at(0));
    owner.ingest(snap.clone(), at(0));
    let stats = follower.observe(snap.clone());
    assert_eq!(stats.alert_count, 1);
    assert!(follower.location_stats(at(0)).is_empty());

    follower.reload(at(0));
    assert_eq!(follower.location_stats(at(0))[0].sample_count, 1);
    assert_eq!(follower.fleet_series(at(0)).len(), 1);
    assert_eq!(follower.current_snapshot(), Some(snap));
}

#[test]
fn quota_pressure_truncates_history_instead_of_dropping_it() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new(6 * 1024));
    let policy = AggregationPolicy {
        retention: Duration::from_secs(24 * 60 * 60),
        ..AggregationPolicy::default()
    };
    let mut engine = AggregationEngine::load(store.clone(), policy, Thresholds::default(), at(0));
    for minute in 0..120 {
        let now = at(minute * 60);
        engine.ingest(snapshot(vec![reading("s1", 20.0)], now), now);
    }

    let persisted: Vec<TimeSeriesPoint> = read_json(store.as_ref(), keys::FLEET_SERIES).unwrap();
    assert!(!persisted.is_empty());
    assert!(persisted.len() < 120);
    assert_eq!(persisted.last().unwrap().timestamp, at(119 * 60));
    // memory keeps the full window
    assert_eq!(engine.fleet_series(at(119 * 60)).len(), 120);
}

#[test]
fn stats_for_new_locations_persist_when_history_fills_the_quota() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new(6 * 1024));
    let policy = AggregationPolicy {
        retention: Duration::from_secs(24 * 60 * 60),
        ..AggregationPolicy::default()
    };
    let mut engine = AggregationEngine::load(store.clone(), policy, Thresholds::default(), at(0));
    for minute in 0..120 {
        let now = at(minute * 60);
        engine.ingest(snapshot(vec![reading("s1", 20.0)], now), now);
    }

    let now = at(120 * 60);
    let mut readings: Vec<SensorReading> =
        (0..25).map(|i| reading(&format!("loc{i:02}"), 30.0)).collect();
    readings.push(reading("s1", 20.0));
    engine.ingest(snapshot(readings, now), now);

    let persisted: BTreeMap<String, RollingStat> =
        read_json(store.as_ref(), keys::LOCATION_STATS).unwrap();
    assert_eq!(persisted.len(), 26);
    assert!(persisted.contains_key("loc24"));

    let reloaded = engine_with(store, now);
    assert_eq!(reloaded.location_stats(now).len(), 26);
}

#[test]
fn history_is_capped() {
    let policy = AggregationPolicy {
        update_interval: Duration::from_secs(1),
        max_history_points: 500,
        ..AggregationPolicy::default()
    };
    let mut engine = AggregationEngine::load(
        Arc::new(MemoryStore::default()),
        policy,
        Thresholds::default(),
        at(0),
    );
    for second in 0..800 {
        engine.ingest(snapshot(vec![reading("s1", 1.0)], at(second)), at(second));
    }
    let series = engine.fleet_series(at(799));
    assert_eq!(series.len(), 500);
    assert_eq!(series[0].timestamp, at(300));
}
