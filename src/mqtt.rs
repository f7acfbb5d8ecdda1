use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;

use crate::config::MqttConfig;
use crate::error::{BridgeError, Result};
use crate::transport::{InboundMessage, MessageStream, SubscriptionTable, Transport};

/// Discovery configs and STATUS replies can exceed rumqttc's default limit.
const MAX_PACKET_SIZE: usize = 256 * 1024;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// [`Transport`] over a broker connection (rumqttc).
///
/// Every publish the event loop receives goes onto one feed in arrival
/// order. Subscriptions are replayed on every ConnAck, so a broker restart
/// or a dropped connection does not lose them.
pub struct MqttTransport {
    client: AsyncClient,
    subscriptions: Arc<SubscriptionTable>,
    poller: JoinHandle<()>,
}

impl MqttTransport {
    pub fn connect(config: &MqttConfig) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        if let (Some(u), Some(p)) = (&config.username, &config.password) {
            options.set_credentials(u, p);
        }

        let (client, eventloop) = AsyncClient::new(options, 64);
        let subscriptions = Arc::new(SubscriptionTable::new());
        let poller = tokio::spawn(poll_loop(eventloop, client.clone(), subscriptions.clone()));

        tracing::info!("MQTT: connecting to {}:{} as {}", config.host, config.port, config.client_id);
        Self {
            client,
            subscriptions,
            poller,
        }
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

async fn poll_loop(mut eventloop: EventLoop, client: AsyncClient, subscriptions: Arc<SubscriptionTable>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                    retain: publish.retain,
                };
                let topic = message.topic.clone();
                if !subscriptions.dispatch(message).await {
                    tracing::debug!("MQTT: nothing takes {}", topic);
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                let filters = subscriptions.filters();
                tracing::info!("MQTT: connected, restoring {} subscriptions", filters.len());
                for filter in filters {
                    // the request queue is drained by this loop; never wait on it here
                    if let Err(e) = client.try_subscribe(filter.clone(), QoS::AtLeastOnce) {
                        tracing::warn!("MQTT: resubscribe to {} failed: {}", filter, e);
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("MQTT: connection error: {}", e);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

fn transport_error(e: rumqttc::ClientError) -> BridgeError {
    BridgeError::Transport(e.to_string())
}

#[async_trait]
impl Transport for MqttTransport {
    fn take_messages(&self) -> Option<MessageStream> {
        self.subscriptions.take_stream()
    }

    async fn subscribe(&self, filter: &str) -> Result<()> {
        if self.subscriptions.add(filter) {
            self.client
                .subscribe(filter, QoS::AtLeastOnce)
                .await
                .map_err(transport_error)?;
        }
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        if self.subscriptions.remove(filter) {
            self.client.unsubscribe(filter).await.map_err(transport_error)?;
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload.to_vec())
            .await
            .map_err(transport_error)
    }
}
