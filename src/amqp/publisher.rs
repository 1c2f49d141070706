//! Notification delivery to connected players

use crate::amqp::messages::{MessageEnvelope, MessageUtils, OutboundNotification};
use crate::error::{GameFinderError, Result};
use crate::types::{Notification, PeerHandle, Priority, Reliability, SessionId};
use amqprs::{
    channel::{BasicPublishArguments, Channel, ExchangeDeclareArguments},
    BasicProperties,
};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Delivers notifications to a set of peers
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn broadcast(
        &self,
        peers: &[PeerHandle],
        notification: &Notification,
        priority: Priority,
        reliability: Reliability,
    ) -> Result<()>;
}

/// Configuration for notification publishing
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub exchange_name: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            exchange_name: crate::amqp::messages::NOTIFICATIONS_EXCHANGE.to_string(),
            max_retries: 3,
            retry_delay_ms: 500,
        }
    }
}

/// Publishes every notification once per peer on a topic exchange, routed by
/// `<route>.<session_id>`
pub struct AmqpNotifier {
    channel: Channel,
    config: PublisherConfig,
}

impl AmqpNotifier {
    /// Create a new notifier and declare its exchange
    pub async fn new(channel: Channel, config: PublisherConfig) -> Result<Self> {
        let notifier = Self { channel, config };
        notifier.setup_exchange().await?;
        Ok(notifier)
    }

    async fn setup_exchange(&self) -> Result<()> {
        let args = ExchangeDeclareArguments::new(&self.config.exchange_name, "topic");
        self.channel.exchange_declare(args).await.map_err(|e| {
            GameFinderError::AmqpConnectionFailed {
                message: format!("Failed to declare notifications exchange: {}", e),
            }
        })?;

        info!(
            "Declared notifications exchange {}",
            self.config.exchange_name
        );
        Ok(())
    }

    /// Publish with retry and exponential backoff
    async fn publish_with_retry(&self, envelope: &MessageEnvelope<OutboundNotification>) -> Result<()> {
        let mut retry_count = 0;
        let mut delay = Duration::from_millis(self.config.retry_delay_ms);

        loop {
            match self.try_publish(envelope).await {
                Ok(_) => {
                    debug!(
                        "Published notification {} with routing key {}",
                        envelope.correlation_id, envelope.routing_key
                    );
                    return Ok(());
                }
                Err(e) => {
                    retry_count += 1;
                    if retry_count > self.config.max_retries {
                        error!(
                            "Failed to publish notification {} after {} retries: {}",
                            envelope.correlation_id, self.config.max_retries, e
                        );
                        return Err(e);
                    }

                    warn!(
                        "Publish attempt {} failed for notification {}: {}. Retrying in {:?}",
                        retry_count, envelope.correlation_id, e, delay
                    );

                    sleep(delay).await;
                    delay = Duration::from_millis((delay.as_millis() as u64 * 2).min(5000));
                }
            }
        }
    }

    async fn try_publish(&self, envelope: &MessageEnvelope<OutboundNotification>) -> Result<()> {
        let payload = envelope.to_bytes()?;

        let args = BasicPublishArguments::new(&self.config.exchange_name, &envelope.routing_key);
        let mut properties = BasicProperties::default();
        properties
            .with_message_id(&envelope.correlation_id)
            .with_timestamp(envelope.timestamp.timestamp() as u64)
            .with_content_type("application/json")
            .with_priority(priority_level(envelope.payload.priority))
            .with_delivery_mode(delivery_mode(envelope.payload.reliability));

        self.channel
            .basic_publish(properties, payload, args)
            .await
            .map_err(|e| GameFinderError::AmqpConnectionFailed {
                message: format!("Failed to publish notification: {}", e),
            })?;

        Ok(())
    }
}

fn priority_level(priority: Priority) -> u8 {
    match priority {
        Priority::Low => 0,
        Priority::Medium => 5,
        Priority::High => 9,
    }
}

/// AMQP delivery mode: 1 transient, 2 persistent
fn delivery_mode(reliability: Reliability) -> u8 {
    match reliability {
        Reliability::Unreliable => 1,
        Reliability::Reliable => 2,
    }
}

#[async_trait]
impl Notifier for AmqpNotifier {
    async fn broadcast(
        &self,
        peers: &[PeerHandle],
        notification: &Notification,
        priority: Priority,
        reliability: Reliability,
    ) -> Result<()> {
        let route = notification.route();
        let mut failures = 0usize;

        for peer in peers {
            let outbound = OutboundNotification {
                session_id: peer.session_id.clone(),
                route: route.to_string(),
                priority,
                reliability,
                notification: notification.clone(),
            };
            let envelope =
                MessageEnvelope::new(outbound, MessageUtils::routing_key(route, &peer.session_id));
            if self.publish_with_retry(&envelope).await.is_err() {
                failures += 1;
            }
        }

        if failures > 0 {
            return Err(GameFinderError::InternalError {
                message: format!(
                    "{} of {} notification(s) on {} could not be delivered",
                    failures,
                    peers.len(),
                    route
                ),
            }
            .into());
        }
        Ok(())
    }
}

/// In-memory notifier recording every delivery
#[derive(Debug, Default)]
pub struct MockNotifier {
    sent: std::sync::Mutex<Vec<(SessionId, Notification)>>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every (session, notification) pair delivered so far
    pub fn sent(&self) -> Vec<(SessionId, Notification)> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }

    /// Notifications delivered to one session, in order
    pub fn sent_to(&self, session_id: &str) -> Vec<Notification> {
        self.sent()
            .into_iter()
            .filter(|(session, _)| session == session_id)
            .map(|(_, notification)| notification)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.clear();
        }
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn broadcast(
        &self,
        peers: &[PeerHandle],
        notification: &Notification,
        _priority: Priority,
        _reliability: Reliability,
    ) -> Result<()> {
        if let Ok(mut sent) = self.sent.lock() {
            for peer in peers {
                sent.push((peer.session_id.clone(), notification.clone()));
            }
        }
        Ok(())
    }
}

/// Notifier that only logs, used when running without a broker
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn broadcast(
        &self,
        peers: &[PeerHandle],
        notification: &Notification,
        _priority: Priority,
        _reliability: Reliability,
    ) -> Result<()> {
        for peer in peers {
            info!(
                "[offline] {} -> {}: {}",
                notification.route(),
                peer.session_id,
                serde_json::to_string(notification).unwrap_or_default()
            );
        }
        Ok(())
    }
}
