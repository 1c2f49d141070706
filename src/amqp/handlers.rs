//! AMQP consumer for client commands
//!
//! Commands arrive as JSON on the command queue, are validated, and are handed
//! to a [`CommandHandler`]. Every delivery is acknowledged once processed;
//! malformed commands are logged and dropped.

use crate::amqp::messages::{GameFinderCommand, MessageUtils};
use crate::error::{GameFinderError, Result};
use amqprs::{
    channel::{BasicAckArguments, BasicCancelArguments, BasicConsumeArguments, Channel},
    consumer::AsyncConsumer,
    BasicProperties, Deliver,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Receives decoded commands
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle_command(&self, command: GameFinderCommand) -> Result<()>;

    /// Called when a delivery could not be decoded or handled
    async fn handle_error(&self, error: GameFinderError, message_data: &[u8]);
}

/// Consumes the command queue on behalf of a [`CommandHandler`]
pub struct CommandConsumer {
    handler: Arc<dyn CommandHandler>,
    channel: Channel,
    consumer_tag: String,
}

impl CommandConsumer {
    pub fn new(handler: Arc<dyn CommandHandler>, channel: Channel) -> Self {
        let consumer_tag = format!("game-finder-{}", uuid::Uuid::new_v4());

        Self {
            handler,
            channel,
            consumer_tag,
        }
    }

    pub async fn start_consuming(&self, queue_name: &str) -> Result<()> {
        let args = BasicConsumeArguments::new(queue_name, &self.consumer_tag);

        self.channel
            .basic_consume(CommandDelivery::new(self.handler.clone()), args)
            .await
            .map_err(|e| GameFinderError::AmqpConnectionFailed {
                message: format!("Failed to start consuming: {}", e),
            })?;

        info!("Started consuming commands from queue: {}", queue_name);
        Ok(())
    }

    pub async fn stop_consuming(&self) -> Result<()> {
        let args = BasicCancelArguments::new(&self.consumer_tag);

        self.channel.basic_cancel(args).await.map_err(|e| {
            GameFinderError::AmqpConnectionFailed {
                message: format!("Failed to stop consuming: {}", e),
            }
        })?;

        info!("Stopped consuming commands");
        Ok(())
    }
}

struct CommandDelivery {
    handler: Arc<dyn CommandHandler>,
}

impl CommandDelivery {
    fn new(handler: Arc<dyn CommandHandler>) -> Self {
        Self { handler }
    }

    async fn process_message(&self, content: &[u8]) -> Result<()> {
        let command = MessageUtils::deserialize_command(content)?;
        debug!(
            "Command {} for session '{}'",
            command.name(),
            command.session_id()
        );
        self.handler.handle_command(command).await
    }
}

#[async_trait]
impl AsyncConsumer for CommandDelivery {
    async fn consume(
        &mut self,
        channel: &Channel,
        deliver: Deliver,
        _basic_properties: BasicProperties,
        content: Vec<u8>,
    ) {
        let delivery_tag = deliver.delivery_tag();
        let started = Instant::now();

        if let Err(e) = self.process_message(&content).await {
            error!(
                "Command processing failed - delivery_tag: {}, time: {:.2}ms, error: {:#}",
                delivery_tag,
                started.elapsed().as_secs_f64() * 1000.0,
                e
            );
            let error = match e.downcast::<GameFinderError>() {
                Ok(error) => error,
                Err(other) => GameFinderError::InternalError {
                    message: other.to_string(),
                },
            };
            self.handler.handle_error(error, &content).await;
        }

        if let Err(e) = channel
            .basic_ack(BasicAckArguments::new(delivery_tag, false))
            .await
        {
            warn!("Failed to acknowledge delivery {}: {}", delivery_tag, e);
        }
    }
}

/// Handler recording every command, for tests
#[derive(Default)]
pub struct RecordingCommandHandler {
    pub received: tokio::sync::Mutex<Vec<GameFinderCommand>>,
    pub errors: tokio::sync::Mutex<Vec<String>>,
}

impl RecordingCommandHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommandHandler for RecordingCommandHandler {
    async fn handle_command(&self, command: GameFinderCommand) -> Result<()> {
        self.received.lock().await.push(command);
        Ok(())
    }

    async fn handle_error(&self, error: GameFinderError, _message_data: &[u8]) {
        self.errors.lock().await.push(error.to_string());
    }
}
