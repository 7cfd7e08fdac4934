//! MQTT bridge: connects to the broker and feeds inbound publishes to the
//! router.
//!
//! The embedded broker itself is an external collaborator; this bridge is a
//! client that subscribes to the device and organization topic families and
//! normalizes every publish into the uniform envelope. It also implements
//! the outbound [`crate::Publisher`] seam for the notification fan-out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use aemos_core::{Error, IngressConfig, Result};

use aemos_notify::Publisher;

use crate::message::{Message, Protocol};
use crate::router::MessageRouter;

/// Inbound subscriptions the bridge maintains. Wildcards are fine here:
/// they are the bridge's own broker-side subscriptions, not inbound topics.
const SUBSCRIPTIONS: &[&str] = &[
    "devices/+/datastream",
    "devices/+/status",
    "devices/+/state",
    "devices/+/commands",
    "organizations/+/broadcast",
    "organizations/+/rulechain/+",
];

/// MQTT bridge between the broker and the router.
pub struct MqttBridge {
    config: IngressConfig,
    router: Arc<MessageRouter>,
    client: RwLock<Option<rumqttc::AsyncClient>>,
    running: Arc<RwLock<bool>>,
}

impl MqttBridge {
    pub fn new(config: IngressConfig, router: Arc<MessageRouter>) -> Self {
        Self {
            config,
            router,
            client: RwLock::new(None),
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Connect, subscribe, and spawn the poll loop.
    pub async fn start(&self) -> Result<JoinHandle<()>> {
        let (host, port) = split_addr(&self.config.broker_addr)?;

        let mut options = rumqttc::MqttOptions::new(&self.config.client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_credentials(
            &self.config.internal_username,
            &self.config.internal_password,
        );

        let (client, mut eventloop) = rumqttc::AsyncClient::new(options, 64);
        for topic in SUBSCRIPTIONS {
            client
                .subscribe(*topic, rumqttc::QoS::AtLeastOnce)
                .await
                .map_err(|e| Error::Routing(format!("subscribe {topic}: {e}")))?;
        }
        *self.client.write().await = Some(client);
        *self.running.write().await = true;

        let router = Arc::clone(&self.router);
        let running = Arc::clone(&self.running);
        let handle = tokio::spawn(async move {
            let mut consecutive_errors = 0u32;
            while *running.read().await {
                match eventloop.poll().await {
                    Ok(rumqttc::Event::Incoming(rumqttc::Packet::Publish(publish))) => {
                        consecutive_errors = 0;
                        let message =
                            Message::new(Protocol::Mqtt, publish.topic.clone(), &publish.payload)
                                .with_qos(publish.qos as u8);
                        let response = router.route(message).await;
                        if !response.is_success() {
                            tracing::debug!(
                                topic = %publish.topic,
                                code = ?response.code,
                                "inbound publish rejected"
                            );
                        }
                    }
                    Ok(_) => {
                        consecutive_errors = 0;
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        tracing::error!(error = %e, attempt = consecutive_errors, "mqtt poll error");
                        // Back off before the event loop retries the connection.
                        let backoff = Duration::from_secs(u64::from(consecutive_errors.min(30)));
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
            tracing::info!("mqtt bridge stopped");
        });
        tracing::info!(broker = %self.config.broker_addr, "mqtt bridge started");
        Ok(handle)
    }

    /// Stop the poll loop and disconnect.
    pub async fn shutdown(&self) {
        *self.running.write().await = false;
        if let Some(client) = self.client.write().await.take() {
            let _ = client.disconnect().await;
        }
    }
}

#[async_trait]
impl Publisher for MqttBridge {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let client = self.client.read().await;
        let Some(client) = client.as_ref() else {
            return Err(Error::Routing("mqtt bridge not started".to_string()));
        };
        client
            .publish(topic, rumqttc::QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| Error::Routing(format!("publish {topic}: {e}")))
    }
}

fn split_addr(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::Config(format!("broker address {addr} must be host:port")))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| Error::Config(format!("invalid broker port in {addr}")))?;
    Ok((host.to_string(), port))
}
