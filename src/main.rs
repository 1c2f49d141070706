//! Main entry point for the game finder service
//!
//! Loads configuration, initializes logging and runs the service until a
//! shutdown signal arrives.

use anyhow::Result;
use clap::Parser;
use game_finder::config::{validate_config, AppConfig};
use game_finder::service::{AppOptions, AppState, HealthCheck, HealthStatus};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::time::Duration;
use tracing::{error, info, warn};

/// Game Finder - periodic matchmaking with ready checks and session handoff
#[derive(Parser)]
#[command(
    name = "game-finder",
    version,
    about = "A matchmaking microservice grouping players into games",
    long_about = "Game Finder consumes FindGame requests over AMQP, runs periodic matching \
                 passes through a pluggable strategy, optionally asks players to confirm in a \
                 ready check, and hands matched players a session and connection token."
)]
struct Args {
    /// Configuration file path; watched for game finder settings changes
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Perform health check and exit
    #[arg(long, help = "Perform a health check and exit with status code")]
    health_check: bool,

    #[arg(
        short,
        long,
        value_name = "LEVEL",
        help = "Override log level (trace, debug, info, warn, error)"
    )]
    log_level: Option<String>,

    #[arg(long, value_name = "URL", help = "Override AMQP connection URL")]
    amqp_url: Option<String>,

    #[arg(long, value_name = "PORT", help = "Override health/metrics HTTP port")]
    http_port: Option<u16>,

    #[arg(long, value_name = "SECONDS", help = "Override seconds between matching passes")]
    interval: Option<f64>,

    #[arg(long, help = "Disable the ready check")]
    no_ready_check: bool,

    #[arg(long, help = "Run without a broker; notifications are only logged")]
    offline: bool,

    #[arg(short, long, help = "Enable debug mode with verbose logging")]
    debug: bool,

    #[arg(
        long,
        help = "Validate configuration and exit without starting service"
    )]
    dry_run: bool,
}

/// Initialize structured logging with the configured level
fn init_logging(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}

/// Connect, run one full health check and exit with its status
async fn perform_health_check(config: AppConfig, options: AppOptions) -> Result<()> {
    info!("Performing health check...");

    let app_state = AppState::new(config, options).await?;
    app_state.start().await?;
    // Give the pass loop a moment to come up
    tokio::time::sleep(Duration::from_millis(200)).await;

    let health = HealthCheck::check(app_state.clone()).await;
    app_state.shutdown().await?;

    match health {
        Ok(health) => {
            println!("Health Check: {}", health.status);
            for check in &health.checks {
                println!(
                    "  {}: {}{}",
                    check.name,
                    check.status,
                    check
                        .message
                        .as_deref()
                        .map(|m| format!(" ({})", m))
                        .unwrap_or_default()
                );
            }
            if health.status == HealthStatus::Unhealthy {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(e) => {
            error!("Health check failed: {}", e);
            std::process::exit(1);
        }
    }
}

/// Wait for shutdown signals (SIGINT, SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C) signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

/// Log a health summary every 30 seconds
async fn health_check_task(app_state: Arc<AppState>) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));

    while app_state.is_running() {
        interval.tick().await;

        match HealthCheck::check(app_state.clone()).await {
            Ok(health) => {
                info!(
                    "Health check: {} - {} group(s) / {} player(s) waiting, {} game(s) found",
                    health.status,
                    health.stats.waiting_groups,
                    health.stats.waiting_players,
                    health.stats.games_found
                );
            }
            Err(e) => {
                warn!("Health check failed: {}", e);
            }
        }
    }
}

fn display_startup_banner(config: &AppConfig, options: &AppOptions) {
    let settings = &config.game_finder;
    info!("🎲 Game Finder");
    info!("   Service: {}", config.service.name);
    info!("   Log level: {}", config.service.log_level);
    info!("   Health port: {}", config.service.health_port);
    if options.offline {
        info!("   AMQP: offline");
    } else {
        info!("   AMQP: {}", config.amqp.url);
    }
    info!("   Strategy: {:?}", settings.strategy.kind);
    info!("   Pass interval: {}s", settings.interval_seconds);
    info!(
        "   Ready check: {}",
        if settings.ready_check.enabled {
            format!("{} ms", settings.ready_check.timeout_ms)
        } else {
            "disabled".to_string()
        }
    );
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
}

impl Args {
    /// Configuration from the file (or the environment) with the command line
    /// flags applied on top
    fn load_config(&self) -> Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::from_file(path)?,
            None => AppConfig::from_env()?,
        };

        if self.debug {
            config.service.log_level = "debug".to_string();
        } else if let Some(level) = &self.log_level {
            config.service.log_level = level.clone();
        }
        if let Some(url) = &self.amqp_url {
            config.amqp.url = url.clone();
        }
        if let Some(port) = self.http_port {
            config.service.health_port = port;
        }

        let settings = &mut config.game_finder;
        if let Some(interval) = self.interval {
            settings.interval_seconds = interval;
        }
        if self.no_ready_check {
            settings.ready_check.enabled = false;
        }

        validate_config(&config)?;
        Ok(config)
    }

    fn options(&self) -> AppOptions {
        AppOptions {
            config_path: self.config.clone(),
            offline: self.offline,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = args.load_config().unwrap_or_else(|e| {
        eprintln!("Configuration error: {:#}", e);
        std::process::exit(1);
    });

    if let Err(e) = init_logging(&config.service.log_level) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    let options = args.options();

    if args.health_check {
        return perform_health_check(config, options).await;
    }

    display_startup_banner(&config, &options);

    if args.dry_run {
        info!("Dry run completed - configuration is valid");
        return Ok(());
    }

    let app_state = match AppState::new(config.clone(), options).await {
        Ok(state) => state,
        Err(e) => {
            error!("Failed to initialize application: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = app_state.start().await {
        error!("Failed to start service: {}", e);
        std::process::exit(1);
    }

    let health_task = tokio::spawn(health_check_task(app_state.clone()));

    info!("Press Ctrl+C to shutdown gracefully...");
    wait_for_shutdown_signal().await;

    info!("🛑 Shutdown signal received, beginning graceful shutdown...");
    health_task.abort();

    if let Err(e) = app_state.shutdown().await {
        warn!("Shutdown finished with errors: {}", e);
    }

    info!("🛑 Game Finder stopped");
    Ok(())
}
