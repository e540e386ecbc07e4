//! MQTT link
//!
//! Owns the rumqttc client and its event loop task. Inbound desired-property
//! patches and direct method requests are decoded here and forwarded to the
//! twin worker over a channel; outbound publishes go through the non-blocking
//! `try_publish` so worker threads never await.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::MqttConfig;
use crate::ports::{AlertPublisher, PortError, TwinTransport};
use crate::twin::TwinMessage;

/// Topic layout under the configured base
#[derive(Debug, Clone)]
pub struct Topics {
    pub desired: String,
    pub reported: String,
    pub methods_request: String,
    pub methods_response: String,
    pub alerts: String,
    pub predictions: String,
}

impl Topics {
    pub fn new(base: &str, device_id: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            desired: format!("{base}/twin/{device_id}/desired"),
            reported: format!("{base}/twin/{device_id}/reported"),
            methods_request: format!("{base}/methods/{device_id}/request"),
            methods_response: format!("{base}/methods/{device_id}/response"),
            alerts: format!("{base}/alerts"),
            predictions: format!("{base}/predictions"),
        }
    }
}

pub struct MqttLink {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    topics: Topics,
    device_id: String,
}

impl MqttLink {
    /// Connects to the broker and spawns the event loop task. Incoming
    /// twin traffic is pushed into `twin_tx`.
    pub async fn start(config: &MqttConfig, device_id: &str, twin_tx: Sender<TwinMessage>) -> Result<Arc<Self>> {
        if device_id.is_empty() {
            bail!("device_id is not configured");
        }
        if config.broker_host.is_empty() {
            bail!("mqtt broker_host is not configured");
        }

        let client_id = format!("{}-{}", device_id, &Uuid::new_v4().to_string()[..8]);
        let mut options = MqttOptions::new(client_id, &config.broker_host, config.broker_port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

        let (client, mut eventloop) = AsyncClient::new(options, 32);
        let topics = Topics::new(&config.topic_base, device_id);

        client
            .subscribe(&topics.desired, QoS::AtLeastOnce)
            .await
            .context("subscribing to desired properties")?;
        client
            .subscribe(&topics.methods_request, QoS::AtLeastOnce)
            .await
            .context("subscribing to method requests")?;

        let link = Arc::new(Self {
            client,
            connected: Arc::new(AtomicBool::new(false)),
            topics,
            device_id: device_id.to_string(),
        });

        let connected = Arc::clone(&link.connected);
        let desired_topic = link.topics.desired.clone();
        let methods_topic = link.topics.methods_request.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        connected.store(true, Ordering::SeqCst);
                        info!("mqtt connected");
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = decode_inbound(
                            &publish.topic,
                            &publish.payload,
                            &desired_topic,
                            &methods_topic,
                        );
                        if let Some(message) = message {
                            if twin_tx.send(message).is_err() {
                                // Twin worker is gone, nothing left to feed
                                break;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        connected.store(false, Ordering::SeqCst);
                        error!("mqtt connection error: {e}, retrying in 5s");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        Ok(link)
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }
}

/// Maps an inbound publish to twin work. Unknown topics and malformed
/// payloads are dropped with a warning.
fn decode_inbound(
    topic: &str,
    payload: &[u8],
    desired_topic: &str,
    methods_topic: &str,
) -> Option<TwinMessage> {
    if topic == desired_topic {
        match serde_json::from_slice::<Map<String, Value>>(payload) {
            Ok(patch) => return Some(TwinMessage::DesiredPatch(patch)),
            Err(e) => warn!("ignoring malformed desired patch: {e}"),
        }
        return None;
    }
    if topic == methods_topic {
        let body: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!("ignoring malformed method request: {e}");
                return None;
            }
        };
        let name = body.get("method").and_then(Value::as_str);
        let request_id = body.get("request_id").and_then(Value::as_str);
        match (name, request_id) {
            (Some(name), Some(request_id)) => {
                return Some(TwinMessage::Method {
                    name: name.to_string(),
                    request_id: request_id.to_string(),
                    payload: body.get("payload").cloned().unwrap_or(Value::Null),
                });
            }
            _ => warn!("method request missing method or request_id"),
        }
        return None;
    }
    debug!("ignoring publish on unexpected topic {topic}");
    None
}

impl TwinTransport for MqttLink {
    fn patch_reported(&self, properties: &Map<String, Value>) -> Result<(), PortError> {
        if !self.is_connected() {
            return Err(PortError::NotConnected);
        }
        let envelope = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "device_id": self.device_id,
            "type": "reported_properties",
            "properties": properties,
        });
        let payload = serde_json::to_vec(&envelope)?;
        self.client
            .try_publish(&self.topics.reported, QoS::AtLeastOnce, true, payload)
            .map_err(|e| PortError::Transport(e.to_string()))
    }

    fn respond_method(&self, request_id: &str, status: u16, payload: &Value) -> Result<(), PortError> {
        if !self.is_connected() {
            return Err(PortError::NotConnected);
        }
        let body = json!({
            "request_id": request_id,
            "status": status,
            "payload": payload,
        });
        let bytes = serde_json::to_vec(&body)?;
        self.client
            .try_publish(&self.topics.methods_response, QoS::AtLeastOnce, false, bytes)
            .map_err(|e| PortError::Transport(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl AlertPublisher for MqttLink {
    fn publish(&self, topic: &str, payload: &Value) -> bool {
        if !self.is_connected() {
            debug!("not connected, dropping publish to {topic}");
            return false;
        }
        let bytes = match serde_json::to_vec(payload) {
            Ok(b) => b,
            Err(e) => {
                warn!("unserializable payload for {topic}: {e}");
                return false;
            }
        };
        match self.client.try_publish(topic, QoS::AtMostOnce, false, bytes) {
            Ok(()) => true,
            Err(e) => {
                warn!("publish to {topic} failed: {e}");
                false
            }
        }
    }
}
