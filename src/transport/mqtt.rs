//! MQTT device client
//!
//! Wraps a rumqttc client. A background task drives the event loop, forwards
//! incoming publishes to a channel, renews subscriptions after reconnects and
//! stops when the cancellation token fires.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ConnectionStatus, DeviceClient, DeviceMessage, TransportError};
use crate::config::MqttConfig;

fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Device client backed by rumqttc
pub struct MqttDeviceClient {
    client: AsyncClient,
    qos: QoS,
    /// Filters renewed after every reconnect
    subscriptions: Arc<RwLock<Vec<String>>>,
    status: Arc<RwLock<ConnectionStatus>>,
    incoming: Mutex<mpsc::Receiver<DeviceMessage>>,
}

impl MqttDeviceClient {
    /// Create the client and spawn its event loop task.
    ///
    /// The connection is established lazily by the event loop; failures are
    /// retried every `reconnect_interval` until `cancel` fires.
    pub fn connect(config: &MqttConfig, cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (host, port) = config.parse_address();

        let mut options = MqttOptions::new(config.client_id.clone(), host.clone(), port);
        options.set_keep_alive(std::time::Duration::from_secs(config.keepalive.max(5) as u64));
        options.set_clean_session(config.clean_session);
        if let Some(ref username) = config.username {
            options.set_credentials(username, config.password.as_deref().unwrap_or(""));
        }
        if config.protocol.uses_tls() {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, eventloop) = AsyncClient::new(options, config.channel_capacity);
        let (tx, rx) = mpsc::channel(config.channel_capacity);

        let subscriptions = Arc::new(RwLock::new(Vec::new()));
        let status = Arc::new(RwLock::new(ConnectionStatus::Disconnected));
        let qos = qos_from_u8(config.qos);

        info!(
            "MQTT client '{}' connecting to {}://{}:{}",
            config.client_id, config.protocol, host, port
        );

        let handle = tokio::spawn(event_loop(
            eventloop,
            client.clone(),
            tx,
            subscriptions.clone(),
            status.clone(),
            qos,
            config.reconnect_interval,
            cancel,
        ));

        (
            Self {
                client,
                qos,
                subscriptions,
                status,
                incoming: Mutex::new(rx),
            },
            handle,
        )
    }
}

#[allow(clippy::too_many_arguments)]
async fn event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    tx: mpsc::Sender<DeviceMessage>,
    subscriptions: Arc<RwLock<Vec<String>>>,
    status: Arc<RwLock<ConnectionStatus>>,
    qos: QoS,
    reconnect_interval: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut reconnecting = false;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                *status.write() = ConnectionStatus::Connected;
                info!("MQTT connected (session_present={})", connack.session_present);

                if reconnecting && !connack.session_present {
                    let filters = subscriptions.read().clone();
                    for filter in filters {
                        // try_subscribe: the request channel is drained by this very loop
                        if let Err(e) = client.try_subscribe(filter.clone(), qos) {
                            warn!("MQTT resubscribe to '{}' failed: {}", filter, e);
                        }
                    }
                }
                reconnecting = false;
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = DeviceMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                };
                if tx.send(message).await.is_err() {
                    debug!("MQTT receiver dropped, stopping event loop");
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT connection error: {}", e);
                *status.write() = ConnectionStatus::Backoff;
                reconnecting = true;

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(reconnect_interval) => {}
                }
            }
        }
    }

    if let Err(e) = client.try_disconnect() {
        debug!("MQTT disconnect: {}", e);
    }
    *status.write() = ConnectionStatus::Disconnected;
    info!("MQTT event loop stopped");
}

#[async_trait]
impl DeviceClient for MqttDeviceClient {
    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        {
            let mut subs = self.subscriptions.write();
            if !subs.iter().any(|s| s == filter) {
                subs.push(filter.to_string());
            }
        }

        self.client
            .subscribe(filter, self.qos)
            .await
            .map_err(|e| TransportError::Subscribe(format!("{}: {}", filter, e)))?;

        info!("Subscribed to MQTT filter {}", filter);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        if self.status() != ConnectionStatus::Connected {
            return Err(TransportError::Connection("MQTT not connected".to_string()));
        }

        self.client
            .publish(topic, self.qos, false, payload.to_vec())
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    async fn next_message(&self) -> Option<DeviceMessage> {
        self.incoming.lock().await.recv().await
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }
}
