//! Application state and service coordination
//!
//! Wires the game finder to its transport, the health server and the
//! background tasks (pass loop, configuration watcher, metrics refresh).

use crate::amqp::connection::{AmqpConfig, AmqpConnection};
use crate::amqp::handlers::{CommandConsumer, CommandHandler};
use crate::amqp::messages::{GameFinderCommand, MessageUtils};
use crate::amqp::publisher::{AmqpNotifier, LogNotifier, Notifier, PublisherConfig};
use crate::config::{AppConfig, ConfigWatcher};
use crate::error::{GameFinderError, Result as FinderResult};
use crate::finder::{FindGameOutcome, GameFinderService, ParametersExtractor};
use crate::metrics::health::HealthServerConfig;
use crate::metrics::{HealthServer, MetricsCollector};
use crate::session::{InMemoryPeerDirectory, LocalSessionHost, SessionResolver};
use crate::strategy;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Service-level errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("AMQP connection error: {message}")]
    AmqpConnection { message: String },

    #[error("Service initialization error: {message}")]
    Initialization { message: String },

    #[error("Background task error: {message}")]
    BackgroundTask { message: String },
}

/// How the service is started
#[derive(Debug, Clone, Default)]
pub struct AppOptions {
    /// File watched for game finder settings changes
    pub config_path: Option<PathBuf>,
    /// Run without a broker; notifications are only logged
    pub offline: bool,
}

/// Routes decoded commands to the game finder
pub struct GameFinderCommandHandler {
    finder: Arc<GameFinderService>,
    directory: Arc<InMemoryPeerDirectory>,
    metrics: Option<Arc<MetricsCollector>>,
    shutdown: CancellationToken,
}

impl GameFinderCommandHandler {
    pub fn new(
        finder: Arc<GameFinderService>,
        directory: Arc<InMemoryPeerDirectory>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            finder,
            directory,
            metrics: None,
            shutdown,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn dispatch(&self, command: GameFinderCommand) -> FinderResult<()> {
        match command {
            GameFinderCommand::SessionConnected {
                session_id,
                user_id,
            } => {
                self.directory.connect(session_id, user_id);
            }
            GameFinderCommand::SessionDisconnected { session_id } => {
                self.finder.on_disconnected(&session_id);
                self.directory.disconnect(&session_id);
            }
            GameFinderCommand::FindGame {
                session_id,
                payload,
            } => {
                let payload = MessageUtils::payload_bytes(&payload)?;
                let finder = self.finder.clone();
                let cancel = self.shutdown.child_token();
                tokio::spawn(async move {
                    match finder.find_game(&payload, &session_id, cancel).await {
                        Ok(FindGameOutcome::Found(context)) => info!(
                            "Session '{}' found game {} (session {:?})",
                            session_id, context.game.id, context.session_id
                        ),
                        Ok(FindGameOutcome::Cancelled(reason)) => {
                            debug!("Search of session '{}' cancelled: {}", session_id, reason)
                        }
                        Err(e) => warn!("Search of session '{}' failed: {:#}", session_id, e),
                    }
                });
            }
            GameFinderCommand::CancelGame { session_id } => {
                if !self.finder.cancel(&session_id) {
                    debug!("Session '{}' has no search to cancel", session_id);
                }
            }
            GameFinderCommand::ReadyResponse { session_id, accept } => {
                if !self.finder.resolve_ready(&session_id, accept).await {
                    debug!("Ignored ready answer from session '{}'", session_id);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CommandHandler for GameFinderCommandHandler {
    async fn handle_command(&self, command: GameFinderCommand) -> FinderResult<()> {
        let name = command.name();
        let started = Instant::now();
        let result = self.dispatch(command).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_amqp_operation(name, result.is_ok(), started.elapsed());
        }
        result
    }

    async fn handle_error(&self, error: GameFinderError, message_data: &[u8]) {
        let preview_len = message_data.len().min(100);
        error!(
            "Dropped command ({} bytes): {} - {:?}",
            message_data.len(),
            error,
            String::from_utf8_lossy(&message_data[..preview_len])
        );
    }
}

#[derive(Default)]
struct Runtime {
    consumer: Option<CommandConsumer>,
    health_server: Option<Arc<HealthServer>>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

/// Main application state containing all service components
pub struct AppState {
    config: AppConfig,
    options: AppOptions,
    finder: Arc<GameFinderService>,
    directory: Arc<InMemoryPeerDirectory>,
    host: Arc<LocalSessionHost>,
    metrics: Arc<MetricsCollector>,
    amqp_connection: Option<Arc<AmqpConnection>>,
    shutdown: CancellationToken,
    started: AtomicBool,
    started_at: Instant,
    runtime: Mutex<Runtime>,
}

impl AppState {
    /// Initialize the application with all dependencies
    pub async fn new(config: AppConfig, options: AppOptions) -> Result<Arc<Self>, ServiceError> {
        info!("Initializing {}", config.service.name);

        let metrics =
            Arc::new(
                MetricsCollector::new().map_err(|e| ServiceError::Initialization {
                    message: format!("Failed to create metrics collector: {}", e),
                })?,
            );

        let (amqp_connection, notifier): (Option<Arc<AmqpConnection>>, Arc<dyn Notifier>) =
            if options.offline {
                warn!("Running offline: notifications are logged, no commands are consumed");
                (None, Arc::new(LogNotifier))
            } else {
                let connection = Self::initialize_amqp(&config).await?;
                let notifier = Self::initialize_notifier(&config, &connection).await?;
                (Some(connection), notifier)
            };

        let directory = Arc::new(InMemoryPeerDirectory::new());
        let host = Arc::new(LocalSessionHost::new());
        let settings = config.game_finder.clone();
        info!(
            "Game finder: {:?} strategy, pass every {:?}, ready check {}",
            settings.strategy.kind,
            settings.interval(),
            if settings.ready_check.enabled {
                "enabled"
            } else {
                "disabled"
            }
        );

        let finder = GameFinderService::builder(
            strategy::from_settings(&settings.strategy),
            Arc::new(SessionResolver::new(host.clone())),
            host.clone(),
            notifier,
            directory.clone(),
        )
        .extractor(Arc::new(ParametersExtractor::new()))
        .settings(settings)
        .metrics(metrics.clone())
        .build()
        .map_err(|e| ServiceError::Configuration {
            message: format!("{:#}", e),
        })?;

        Ok(Arc::new(Self {
            config,
            options,
            finder,
            directory,
            host,
            metrics,
            amqp_connection,
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            started_at: Instant::now(),
            runtime: Mutex::new(Runtime::default()),
        }))
    }

    /// Start the health server, command consumption and background tasks
    pub async fn start(self: &Arc<Self>) -> Result<(), ServiceError> {
        info!("Starting {}", self.config.service.name);
        self.started.store(true, Ordering::SeqCst);

        self.start_health_server().await;
        self.start_background_tasks().await;
        if let Some(connection) = &self.amqp_connection {
            self.start_amqp_consumption(connection).await?;
        }

        info!("✅ {} started", self.config.service.name);
        Ok(())
    }

    /// Stop consuming, stop the pass loop (cancelling pending requests) and
    /// wait for the background tasks within the shutdown timeout
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        info!("Starting graceful shutdown of {}", self.config.service.name);
        let mut runtime = self.runtime.lock().await;

        if let Some(consumer) = runtime.consumer.take() {
            if let Err(e) = consumer.stop_consuming().await {
                warn!("Failed to stop command consumer: {}", e);
            }
        }

        self.finder.set_accepting_requests(false);
        self.shutdown.cancel();
        if let Some(server) = runtime.health_server.take() {
            if let Err(e) = server.stop().await {
                warn!("Failed to stop health server: {}", e);
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout();
        for (name, mut task) in runtime.tasks.drain(..) {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => debug!("Background task '{}' stopped", name),
                Ok(Err(e)) => warn!("Background task '{}' ended abnormally: {}", name, e),
                Err(_) => {
                    warn!("Background task '{}' did not stop in time, aborting", name);
                    task.abort();
                }
            }
        }

        self.started.store(false, Ordering::SeqCst);

        info!("Final statistics: {:?}", self.finder.stats());
        info!("✅ {} shutdown completed", self.config.service.name);
        Ok(())
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// True between a successful start and shutdown
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finder(&self) -> Arc<GameFinderService> {
        self.finder.clone()
    }

    pub fn directory(&self) -> Arc<InMemoryPeerDirectory> {
        self.directory.clone()
    }

    pub fn host(&self) -> Arc<LocalSessionHost> {
        self.host.clone()
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    /// Broker connection; `None` when running offline
    pub fn amqp_connection(&self) -> Option<Arc<AmqpConnection>> {
        self.amqp_connection.clone()
    }

    pub fn is_offline(&self) -> bool {
        self.options.offline
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Handler routing commands into this service
    pub fn command_handler(&self) -> GameFinderCommandHandler {
        GameFinderCommandHandler::new(
            self.finder.clone(),
            self.directory.clone(),
            self.shutdown.clone(),
        )
        .with_metrics(self.metrics.clone())
    }

    async fn initialize_amqp(config: &AppConfig) -> Result<Arc<AmqpConnection>, ServiceError> {
        info!("Connecting to AMQP broker: {}", config.amqp.url);

        let amqp_config =
            AmqpConfig::from_settings(&config.amqp).map_err(|e| ServiceError::Configuration {
                message: e.to_string(),
            })?;

        let connection =
            AmqpConnection::new(amqp_config)
                .await
                .map_err(|e| ServiceError::AmqpConnection {
                    message: format!("Failed to connect to AMQP: {}", e),
                })?;

        Ok(Arc::new(connection))
    }

    async fn initialize_notifier(
        config: &AppConfig,
        connection: &AmqpConnection,
    ) -> Result<Arc<dyn Notifier>, ServiceError> {
        let channel = connection
            .connection()
            .open_channel(None)
            .await
            .map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to open publisher channel: {}", e),
            })?;

        let publisher_config = PublisherConfig {
            exchange_name: config.amqp.exchange_name.clone(),
            max_retries: config.amqp.max_retry_attempts,
            retry_delay_ms: config.amqp.retry_delay_ms,
        };
        let notifier = AmqpNotifier::new(channel, publisher_config)
            .await
            .map_err(|e| ServiceError::Initialization {
                message: format!("Failed to initialize notifier: {}", e),
            })?;

        Ok(Arc::new(notifier))
    }

    async fn start_health_server(self: &Arc<Self>) {
        let config = HealthServerConfig {
            port: self.config.service.health_port,
            host: "0.0.0.0".to_string(),
        };
        let server = Arc::new(
            HealthServer::new(config, self.metrics.clone()).with_app_state(self.clone()),
        );

        let task = {
            let server = server.clone();
            tokio::spawn(async move {
                if let Err(e) = server.start().await {
                    error!("Health server failed: {}", e);
                }
            })
        };

        let mut runtime = self.runtime.lock().await;
        runtime.health_server = Some(server);
        runtime.tasks.push(("health_server", task));
    }

    async fn start_amqp_consumption(
        &self,
        connection: &AmqpConnection,
    ) -> Result<(), ServiceError> {
        let queue = self.config.amqp.queue_name.as_str();
        let channel = connection
            .connection()
            .open_channel(None)
            .await
            .map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to open consumer channel: {}", e),
            })?;

        let queue_declare_args = amqprs::channel::QueueDeclareArguments::new(queue)
            .durable(true)
            .auto_delete(false)
            .finish();
        channel
            .queue_declare(queue_declare_args)
            .await
            .map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to declare queue {}: {}", queue, e),
            })?;

        let consumer = CommandConsumer::new(Arc::new(self.command_handler()), channel);
        consumer
            .start_consuming(queue)
            .await
            .map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to start consuming commands: {}", e),
            })?;

        self.runtime.lock().await.consumer = Some(consumer);
        info!("Listening for commands on queue '{}'", queue);
        Ok(())
    }

    async fn start_background_tasks(self: &Arc<Self>) {
        let mut tasks = Vec::new();

        let pass_loop = {
            let finder = self.finder.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move { finder.run(shutdown).await })
        };
        tasks.push(("pass_loop", pass_loop));

        if let Some(path) = &self.options.config_path {
            let watcher = ConfigWatcher::new(
                path.clone(),
                self.config.game_finder.clone(),
                self.config.config_poll_interval(),
            );
            let mut updates = watcher.subscribe();
            let shutdown = self.shutdown.clone();
            tasks.push((
                "config_watcher",
                tokio::spawn(watcher.run(shutdown.clone())),
            ));

            let finder = self.finder.clone();
            let reload = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        changed = updates.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            let settings = updates.borrow_and_update().clone();
                            if let Err(e) = finder.refresh_config(settings) {
                                warn!("Rejected reloaded settings: {:#}", e);
                            }
                        }
                    }
                }
            });
            tasks.push(("config_reload", reload));
        }

        let metrics_refresh = {
            let state = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(5));
                loop {
                    tokio::select! {
                        _ = state.shutdown.cancelled() => break,
                        _ = interval.tick() => state.refresh_metrics(),
                    }
                }
            })
        };
        tasks.push(("metrics_refresh", metrics_refresh));

        info!("{} background tasks started", tasks.len());
        self.runtime.lock().await.tasks.extend(tasks);
    }

    fn refresh_metrics(&self) {
        let stats = self.finder.stats();
        self.metrics.update_from_stats(&stats);
        self.metrics.set_uptime(self.uptime());

        let amqp_alive = self
            .amqp_connection
            .as_ref()
            .map(|connection| connection.is_alive())
            .unwrap_or(true);
        self.metrics.update_component_health("amqp", amqp_alive);
        self.metrics
            .update_component_health("pass_loop", stats.running);

        let status = if !stats.running || !amqp_alive {
            0
        } else if !stats.accepting_requests {
            1
        } else {
            2
        };
        self.metrics.update_health_status(status);
    }
}
