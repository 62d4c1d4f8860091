//! Telemetry publishers

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::CloudError;

/// Sends one payload to the remote collector
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `payload` on `topic`
    ///
    /// `CloudError::Connection` means the link is down and further attempts
    /// in the same pass are pointless.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), CloudError>;
}

/// MQTT connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker host
    pub host: String,
    /// Broker port
    pub port: u16,
    pub client_id: String,
    /// Device access token, sent as the MQTT username
    pub access_token: Option<String>,
    pub keep_alive_seconds: u64,
    /// Delay before the event loop retries after a connection error
    pub reconnect_delay_seconds: u64,
    /// Outgoing request channel capacity
    pub channel_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "vehicle-blackbox".to_string(),
            access_token: None,
            keep_alive_seconds: 30,
            reconnect_delay_seconds: 5,
            channel_capacity: 10,
        }
    }
}

/// MQTT publisher with a background event loop
pub struct MqttPublisher {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    event_loop: JoinHandle<()>,
}

impl MqttPublisher {
    /// Create the client and spawn its event loop
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: &MqttConfig, mut shutdown: watch::Receiver<bool>) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_seconds));
        if let Some(token) = &config.access_token {
            options.set_credentials(token.clone(), String::new());
        }

        let (client, mut eventloop) = AsyncClient::new(options, config.channel_capacity);
        let connected = Arc::new(AtomicBool::new(false));
        let reconnect_delay = Duration::from_secs(config.reconnect_delay_seconds);

        let flag = Arc::clone(&connected);
        let event_loop = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                            if ack.code == ConnectReturnCode::Success {
                                flag.store(true, Ordering::SeqCst);
                                info!("Connected to MQTT broker");
                            } else {
                                warn!(code = ?ack.code, "MQTT broker refused connection");
                            }
                        }
                        Ok(Event::Incoming(Packet::Disconnect)) => {
                            flag.store(false, Ordering::SeqCst);
                            warn!("MQTT broker disconnected");
                        }
                        Ok(event) => debug!(?event, "MQTT event"),
                        Err(e) => {
                            if flag.swap(false, Ordering::SeqCst) {
                                warn!(error = %e, "MQTT connection lost");
                            } else {
                                debug!(error = %e, "MQTT connection attempt failed");
                            }
                            tokio::select! {
                                _ = tokio::time::sleep(reconnect_delay) => {}
                                _ = shutdown.changed() => break,
                            }
                        }
                    },
                    _ = shutdown.changed() => break,
                }
            }
            flag.store(false, Ordering::SeqCst);
            debug!("MQTT event loop stopped");
        });

        info!(host = %config.host, port = config.port, "MQTT publisher started");
        Self {
            client,
            connected,
            event_loop,
        }
    }

    /// Whether the broker acknowledged the current connection
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for MqttPublisher {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), CloudError> {
        if !self.is_connected() {
            return Err(CloudError::Connection("MQTT broker link is down".into()));
        }
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .await
            .map_err(|e| CloudError::Publish(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_fails_fast_without_broker() {
        let (_tx, rx) = watch::channel(false);
        let config = MqttConfig {
            host: "127.0.0.1".into(),
            // Nothing listens on the discard port in test environments
            port: 9,
            reconnect_delay_seconds: 60,
            ..Default::default()
        };
        let publisher = MqttPublisher::start(&config, rx);
        let result = publisher.publish("v1/devices/me/telemetry", b"{}").await;
        assert!(matches!(result, Err(CloudError::Connection(_))));
        assert!(!publisher.is_connected());
    }

    #[test]
    fn test_default_config() {
        let config = MqttConfig::default();
        assert_eq!(config.port, 1883);
        assert!(config.access_token.is_none());
    }
}
