use crate::config::Config;
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

#[derive(Debug, Clone)]
pub struct LatestMessage {
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// Last payload seen per subscribed topic. MQTT sources read from here at
/// cycle time instead of blocking on the broker.
#[derive(Clone, Default)]
pub struct LatestMessages {
    inner: Arc<Mutex<HashMap<String, LatestMessage>>>,
}

impl LatestMessages {
    pub fn record(&self, topic: &str, payload: Vec<u8>, received_at: DateTime<Utc>) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.insert(
                topic.to_string(),
                LatestMessage {
                    payload,
                    received_at,
                },
            );
        }
    }

    /// `filter` may carry `+`/`#` wildcards; the freshest matching topic wins.
    pub fn latest(&self, filter: &str) -> Option<LatestMessage> {
        let guard = self.inner.lock().ok()?;
        if let Some(exact) = guard.get(filter) {
            return Some(exact.clone());
        }
        guard
            .iter()
            .filter(|(topic, _)| rumqttc::mqttbytes::matches(topic, filter))
            .max_by_key(|(_, message)| message.received_at)
            .map(|(_, message)| message.clone())
    }
}

pub fn mqtt_options(config: &Config, client_id: &str) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, config.mqtt_host.clone(), config.mqtt_port);
    options.set_keep_alive(config.mqtt_keepalive());
    if let Some(username) = &config.mqtt_username {
        options.set_credentials(
            username.clone(),
            config.mqtt_password.clone().unwrap_or_default(),
        );
    }
    options
}

pub fn spawn_source_listener(
    config: Config,
    topics: Vec<String>,
    latest: LatestMessages,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let client_id = format!("{}-sources", config.mqtt_client_id);
        loop {
            let (client, mut eventloop) = AsyncClient::new(mqtt_options(&config, &client_id), 32);

            let mut subscribed = true;
            for topic in &topics {
                if let Err(err) = client.subscribe(topic.clone(), QoS::AtLeastOnce).await {
                    tracing::warn!(error=%err, topic=%topic, "failed to subscribe to source topic; retrying");
                    subscribed = false;
                    break;
                }
            }
            if !subscribed {
                sleep(Duration::from_secs(2)).await;
                continue;
            }
            tracing::info!(topics = topics.len(), "subscribed to MQTT source topics");

            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        latest.record(&publish.topic, publish.payload.to_vec(), Utc::now());
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(error=%err, "MQTT source connection dropped; reconnecting");
                        break;
                    }
                }
            }

            sleep(Duration::from_secs(1)).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_message_overwrites_previous() {
        let latest = LatestMessages::default();
        let t0 = Utc::now();
        latest.record("smoke/a", b"one".to_vec(), t0);
        latest.record("smoke/a", b"two".to_vec(), t0);
        latest.record("smoke/b", b"three".to_vec(), t0);

        assert_eq!(latest.latest("smoke/a").unwrap().payload, b"two");
        assert_eq!(latest.latest("smoke/b").unwrap().payload, b"three");
        assert!(latest.latest("smoke/c").is_none());
    }

    #[test]
    fn wildcard_source_reads_freshest_matching_topic() {
        let latest = LatestMessages::default();
        let t0 = Utc::now();
        latest.record("smoke/kitchen/readings", b"kitchen".to_vec(), t0);
        latest.record(
            "smoke/garage/readings",
            b"garage".to_vec(),
            t0 + chrono::Duration::seconds(5),
        );
        latest.record("alarm/garage/readings", b"other".to_vec(), t0 + chrono::Duration::seconds(9));

        assert_eq!(latest.latest("smoke/+/readings").unwrap().payload, b"garage");
        assert_eq!(latest.latest("smoke/#").unwrap().payload, b"garage");
        assert_eq!(latest.latest("#").unwrap().payload, b"other");
        assert!(latest.latest("smoke/+/status").is_none());
    }
}
