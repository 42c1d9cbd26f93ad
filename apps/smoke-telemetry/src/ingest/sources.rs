use serde::{Deserialize, Serialize};
use thiserror::Error;

fn default_enabled() -> bool {
    true
}

fn default_sensor_count() -> u32 {
    8
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub kind: SourceKind,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceKind {
    Http {
        url: String,
    },
    Mqtt {
        #[serde(alias = "brokerTopic")]
        topic: String,
    },
    Simulated {
        #[serde(default = "default_sensor_count", rename = "sensorCount")]
        sensor_count: u32,
        #[serde(default)]
        seed: Option<u64>,
    },
}

impl SourceConfig {
    pub fn demo(sensor_count: u32, seed: u64) -> Self {
        Self {
            id: "demo".to_string(),
            name: "Demo sensors".to_string(),
            kind: SourceKind::Simulated {
                sensor_count,
                seed: Some(seed),
            },
            api_key: None,
            enabled: true,
        }
    }

    pub fn mqtt_topic(&self) -> Option<&str> {
        match &self.kind {
            SourceKind::Mqtt { topic } => Some(topic.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceFetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {0}")]
    Status(reqwest::StatusCode),

    #[error("no MQTT listener is running")]
    MqttUnavailable,

    #[error("no message received on {topic}")]
    NoMqttData { topic: String },

    #[error("last message on {topic} is {age_secs}s old")]
    StaleMqttData { topic: String, age_secs: i64 },

    #[error("invalid payload: {0}")]
    Decode(String),
}
