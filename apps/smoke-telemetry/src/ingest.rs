mod simulate;
mod sources;

pub use simulate::{Simulator, DEFAULT_BUCKET_SECONDS, DEFAULT_SEED};
pub use sources::{SourceConfig, SourceFetchError, SourceKind};

use crate::mqtt::LatestMessages;
use crate::telemetry::{normalize_payload, parse_payload_bytes, FleetSnapshot, SensorReading};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde_json::Value as JsonValue;
use std::time::Duration;

const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Clone)]
pub struct Ingestor {
    client: Client,
    mqtt: Option<LatestMessages>,
    mqtt_stale_after: ChronoDuration,
    bucket_seconds: i64,
}

impl Ingestor {
    pub fn new(
        http_timeout: Duration,
        mqtt: Option<LatestMessages>,
        mqtt_stale_after: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(http_timeout).build()?;
        Ok(Self {
            client,
            mqtt,
            mqtt_stale_after: ChronoDuration::from_std(mqtt_stale_after)
                .unwrap_or_else(|_| ChronoDuration::seconds(60)),
            bucket_seconds: DEFAULT_BUCKET_SECONDS,
        })
    }

    pub async fn fetch_cycle(&self, sources: &[SourceConfig], now: DateTime<Utc>) -> FleetSnapshot {
        let enabled: Vec<&SourceConfig> = sources.iter().filter(|s| s.enabled).collect();
        if enabled.is_empty() {
            tracing::debug!("no enabled sources; reporting disconnected");
            return FleetSnapshot::disconnected(now);
        }

        let results =
            futures::future::join_all(enabled.iter().map(|source| self.fetch_source(source, now)))
                .await;

        let mut readings = Vec::new();
        let mut succeeded = 0usize;
        for (source, result) in enabled.iter().zip(results) {
            match result {
                Ok(mut batch) => {
                    succeeded += 1;
                    tracing::trace!(source = %source.id, readings = batch.len(), "fetched source");
                    readings.append(&mut batch);
                }
                Err(err) => {
                    tracing::warn!(source = %source.id, error=%err, "source fetch failed");
                }
            }
        }

        if succeeded == 0 {
            tracing::warn!(sources = enabled.len(), "all sources failed this cycle");
            return FleetSnapshot::disconnected(now);
        }
        FleetSnapshot::new(readings, now)
    }

    async fn fetch_source(
        &self,
        source: &SourceConfig,
        now: DateTime<Utc>,
    ) -> Result<Vec<SensorReading>, SourceFetchError> {
        match &source.kind {
            SourceKind::Http { url } => {
                let payload = self.fetch_http(url, source.api_key.as_deref()).await?;
                Ok(normalize_payload(&source.id, &payload, now))
            }
            SourceKind::Mqtt { topic } => {
                let payload = self.read_mqtt(topic, now)?;
                Ok(normalize_payload(&source.id, &payload, now))
            }
            SourceKind::Simulated { sensor_count, seed } => {
                let simulator = Simulator::new(
                    seed.unwrap_or(DEFAULT_SEED),
                    *sensor_count,
                    self.bucket_seconds,
                );
                Ok(simulator.readings(&source.id, now))
            }
        }
    }

    async fn fetch_http(
        &self,
        url: &str,
        api_key: Option<&str>,
    ) -> Result<JsonValue, SourceFetchError> {
        let mut request = self.client.get(url);
        if let Some(key) = api_key {
            request = request.header(API_KEY_HEADER, key);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(SourceFetchError::Status(response.status()));
        }
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|err| SourceFetchError::Decode(err.to_string()))
    }

    fn read_mqtt(&self, topic: &str, now: DateTime<Utc>) -> Result<JsonValue, SourceFetchError> {
        let latest = self
            .mqtt
            .as_ref()
            .ok_or(SourceFetchError::MqttUnavailable)?
            .latest(topic)
            .ok_or_else(|| SourceFetchError::NoMqttData {
                topic: topic.to_string(),
            })?;
        let age = now - latest.received_at;
        if age > self.mqtt_stale_after {
            return Err(SourceFetchError::StaleMqttData {
                topic: topic.to_string(),
                age_secs: age.num_seconds(),
            });
        }
        let mut payload = latest.payload;
        parse_payload_bytes(&mut payload).map_err(|err| SourceFetchError::Decode(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn mqtt_source(id: &str, topic: &str) -> SourceConfig {
        SourceConfig {
            id: id.to_string(),
            name: id.to_string(),
            kind: SourceKind::Mqtt {
                topic: topic.to_string(),
            },
            api_key: None,
            enabled: true,
        }
    }

    fn http_source(id: &str, url: String, api_key: Option<&str>) -> SourceConfig {
        SourceConfig {
            id: id.to_string(),
            name: id.to_string(),
            kind: SourceKind::Http { url },
            api_key: api_key.map(str::to_string),
            enabled: true,
        }
    }

    /// Serves `/sensors` only to requests carrying the expected key, and
    /// `/broken` as a 500.
    async fn serve_sensors() -> String {
        use axum::http::{HeaderMap, StatusCode};
        use axum::routing::get;
        use axum::{Json, Router};

        async fn sensors(headers: HeaderMap) -> Result<Json<JsonValue>, StatusCode> {
            if headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) != Some("secret") {
                return Err(StatusCode::UNAUTHORIZED);
            }
            Ok(Json(serde_json::json!({
                "sensors": [
                    {"id": "hall", "value": 42, "displayName": "Hallway"},
                    {"id": "garage", "value": 310.5, "online": false}
                ]
            })))
        }

        async fn broken() -> StatusCode {
            StatusCode::INTERNAL_SERVER_ERROR
        }

        let app = Router::new()
            .route("/sensors", get(sensors))
            .route("/broken", get(broken));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn ingestor(latest: Option<LatestMessages>) -> Ingestor {
        Ingestor::new(Duration::from_millis(200), latest, Duration::from_secs(60)).unwrap()
    }

    #[tokio::test]
    async fn failing_source_does_not_abort_cycle() {
        let latest = LatestMessages::default();
        latest.record(
            "smoke/good",
            br#"[{"id":"s1","value":50},{"id":"s2","value":70}]"#.to_vec(),
            now(),
        );
        let sources = vec![
            mqtt_source("good", "smoke/good"),
            mqtt_source("silent", "smoke/silent"),
            SourceConfig {
                id: "down".to_string(),
                name: "down".to_string(),
                kind: SourceKind::Http {
                    url: "http://127.0.0.1:1/sensors".to_string(),
                },
                api_key: None,
                enabled: true,
            },
        ];

        let snapshot = ingestor(Some(latest)).fetch_cycle(&sources, now()).await;
        assert!(snapshot.connected);
        let ids: Vec<&str> = snapshot.readings.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["good:s1", "good:s2"]);
    }

    #[tokio::test]
    async fn all_sources_failing_reports_disconnected() {
        let sources = vec![mqtt_source("a", "smoke/a")];
        let snapshot = ingestor(None).fetch_cycle(&sources, now()).await;
        assert!(!snapshot.connected);
        assert!(snapshot.readings.is_empty());
        assert_eq!(snapshot.captured_at, now());
    }

    #[tokio::test]
    async fn disabled_sources_are_skipped() {
        let mut demo = SourceConfig::demo(3, 1);
        demo.enabled = false;
        let snapshot = ingestor(None).fetch_cycle(&[demo], now()).await;
        assert!(!snapshot.connected);
    }

    #[tokio::test]
    async fn same_raw_id_from_two_sources_does_not_collide() {
        let latest = LatestMessages::default();
        latest.record("t/a", br#"{"id":"s1","value":1}"#.to_vec(), now());
        latest.record("t/b", br#"{"id":"s1","value":2}"#.to_vec(), now());
        let sources = vec![mqtt_source("a", "t/a"), mqtt_source("b", "t/b")];

        let snapshot = ingestor(Some(latest)).fetch_cycle(&sources, now()).await;
        let ids: Vec<&str> = snapshot.readings.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a:s1", "b:s1"]);
        assert!(snapshot.readings.iter().all(|r| r.location_key == "s1"));
    }

    #[tokio::test]
    async fn stale_mqtt_message_counts_as_failure() {
        let latest = LatestMessages::default();
        latest.record(
            "t/a",
            br#"{"id":"s1","value":1}"#.to_vec(),
            now() - ChronoDuration::seconds(120),
        );
        let snapshot = ingestor(Some(latest))
            .fetch_cycle(&[mqtt_source("a", "t/a")], now())
            .await;
        assert!(!snapshot.connected);
    }

    #[tokio::test]
    async fn demo_source_is_deterministic() {
        let sources = vec![SourceConfig::demo(4, 99)];
        let a = ingestor(None).fetch_cycle(&sources, now()).await;
        let b = ingestor(None).fetch_cycle(&sources, now()).await;
        assert_eq!(a.readings, b.readings);
        assert_eq!(a.readings.len(), 4);
    }

    #[tokio::test]
    async fn http_source_sends_api_key_and_decodes_wrapped_payload() {
        let base = serve_sensors().await;
        let sources = vec![http_source("cloud", format!("{base}/sensors"), Some("secret"))];

        let snapshot = ingestor(None).fetch_cycle(&sources, now()).await;
        assert!(snapshot.connected);
        let ids: Vec<&str> = snapshot.readings.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["cloud:hall", "cloud:garage"]);
        assert_eq!(snapshot.readings[0].display_name, "Hallway");
        assert_eq!(snapshot.readings[1].value, 310.5);
        assert!(!snapshot.readings[1].online);
    }

    #[tokio::test]
    async fn http_error_statuses_fail_the_source() {
        let base = serve_sensors().await;
        let ingestor = ingestor(None);

        let missing_key = http_source("cloud", format!("{base}/sensors"), None);
        let err = ingestor.fetch_source(&missing_key, now()).await.unwrap_err();
        assert!(matches!(err, SourceFetchError::Status(s) if s.as_u16() == 401));

        let broken = http_source("cloud", format!("{base}/broken"), Some("secret"));
        let err = ingestor.fetch_source(&broken, now()).await.unwrap_err();
        assert!(matches!(err, SourceFetchError::Status(s) if s.as_u16() == 500));

        let snapshot = ingestor.fetch_cycle(&[missing_key, broken], now()).await;
        assert!(!snapshot.connected);
    }
}
