use crate::config::Config;
use crate::mqtt::mqtt_options;
use crate::telemetry::FleetSnapshot;
use rumqttc::{AsyncClient, Event, Incoming, QoS};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

const LOCAL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusMessage {
    pub origin: String,
    pub snapshot: FleetSnapshot,
}

#[derive(Clone)]
struct MqttPublisher {
    client: AsyncClient,
    topic: String,
}

/// Best-effort snapshot bus between instances. Backed by an MQTT topic shared
/// through the broker, or by an in-process channel when instances live in one
/// process. Publishing never fails the caller.
#[derive(Clone)]
pub struct SnapshotBus {
    tx: broadcast::Sender<BusMessage>,
    mqtt: Option<MqttPublisher>,
}

impl SnapshotBus {
    pub fn local() -> Self {
        let (tx, _) = broadcast::channel(LOCAL_CAPACITY);
        Self { tx, mqtt: None }
    }

    pub fn mqtt(config: &Config) -> (Self, JoinHandle<()>) {
        let (tx, _) = broadcast::channel(LOCAL_CAPACITY);
        let topic = config.snapshot_topic();
        let client_id = format!("{}-bus", config.mqtt_client_id);
        let (client, mut eventloop) = AsyncClient::new(mqtt_options(config, &client_id), 32);

        let forward_tx = tx.clone();
        let subscriber = client.clone();
        let subscribed_topic = topic.clone();
        let handle = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        if let Err(err) =
                            subscriber.try_subscribe(subscribed_topic.clone(), QoS::AtLeastOnce)
                        {
                            tracing::warn!(error=%err, "failed to subscribe to snapshot topic");
                        } else {
                            tracing::info!(topic=%subscribed_topic, "snapshot bus connected");
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        if publish.topic != subscribed_topic {
                            continue;
                        }
                        let mut payload = publish.payload.to_vec();
                        match simd_json::serde::from_slice::<BusMessage>(&mut payload) {
                            Ok(message) => {
                                let _ = forward_tx.send(message);
                            }
                            Err(err) => {
                                tracing::debug!(error=%err, "ignoring undecodable snapshot message");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(error=%err, "snapshot bus connection dropped; reconnecting");
                        sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        (
            Self {
                tx,
                mqtt: Some(MqttPublisher { client, topic }),
            },
            handle,
        )
    }

    pub fn publish(&self, message: &BusMessage) {
        match &self.mqtt {
            Some(mqtt) => {
                let payload = match serde_json::to_vec(message) {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::warn!(error=%err, "failed to encode snapshot message");
                        return;
                    }
                };
                if let Err(err) =
                    mqtt.client
                        .try_publish(mqtt.topic.clone(), QoS::AtLeastOnce, false, payload)
                {
                    tracing::debug!(error=%err, "failed to publish snapshot");
                }
            }
            None => {
                // no subscribers is fine
                let _ = self.tx.send(message.clone());
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }
}
