//! Main binary for the ServiceAI notification service
//!
//! Serves the workflow, analytics and template APIs together with the voice
//! and SMS vendor webhooks. Due workflows are triggered by an external
//! scheduler through `POST /api/workflows/execute-due`.

use serviceai_notify::{config::NotifyConfig, manager::NotifyManager, routes::create_router};

use axum::serve;
use clap::{Arg, ArgAction, Command};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Failed to read .env file: {}", e);
        }
    }

    // Parse command line arguments
    let matches = create_cli().get_matches();

    // Load configuration
    let config = load_config(&matches)?;

    init_tracing(&config)?;

    // Validate configuration
    config.validate().map_err(|e| {
        error!("Configuration validation failed: {}", e);
        e
    })?;

    info!("Starting ServiceAI notification service");
    info!(
        environment = ?config.environment,
        host = %config.server.host,
        port = config.server.port,
        store = ?config.database.backend,
        "Configuration loaded"
    );
    if !config.webhooks.verify_signatures {
        warn!("Webhook signatures are NOT verified; development use only");
    }

    // Create cancellation token for graceful shutdown
    let cancellation_token = CancellationToken::new();

    let manager = Arc::new(NotifyManager::new(config.clone()).await.map_err(|e| {
        error!("Failed to initialize notification manager: {}", e);
        e
    })?);

    let app = create_router(manager);

    let addr = SocketAddr::new(
        config
            .server
            .host
            .parse()
            .map_err(|e| format!("Invalid host address: {}", e))?,
        config.server.port,
    );

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to address {}: {}", addr, e);
        e
    })?;

    info!("Notification service started successfully on {}", addr);
    info!("Health check: http://{}/health", addr);
    info!("Metrics: http://{}/metrics", addr);

    let server_task = tokio::spawn({
        let cancellation_token = cancellation_token.clone();
        async move {
            let result = serve(listener, app)
                .with_graceful_shutdown(async move { cancellation_token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
    });

    wait_for_shutdown_signal().await;

    info!("Shutdown signal received, draining in-flight requests...");
    cancellation_token.cancel();

    if let Err(e) = server_task.await {
        error!("Server task error during shutdown: {}", e);
    }

    info!("ServiceAI notification service stopped gracefully");
    Ok(())
}

/// Initialize tracing; `RUST_LOG` wins over the configured level
fn init_tracing(config: &NotifyConfig) -> Result<(), BoxError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "serviceai_notify={},tower_http=info,axum=info,sqlx=warn",
            config.logging.level
        )
        .into()
    });

    let registry = tracing_subscriber::registry().with(env_filter);
    if config.logging.json {
        registry.with(fmt::layer().json().with_target(true)).try_init()?;
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()?;
    }

    Ok(())
}

/// Create CLI argument parser
fn create_cli() -> Command {
    Command::new("notify-server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("ServiceAI notification service - bilingual SMS workflows driven by webhooks")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("HOST")
                .help("Server host address"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("Server port"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON"),
        )
}

/// Load configuration from file and environment, then apply CLI overrides
fn load_config(matches: &clap::ArgMatches) -> Result<NotifyConfig, BoxError> {
    let mut config = match matches.get_one::<String>("config") {
        Some(file) => NotifyConfig::load(Some(Path::new(file)))
            .map_err(|e| format!("Failed to load configuration from {}: {}", file, e))?,
        None => NotifyConfig::from_env()
            .map_err(|e| format!("Failed to load configuration: {}", e))?,
    };

    if let Some(host) = matches.get_one::<String>("host") {
        config.server.host = host.clone();
    }

    if let Some(port_str) = matches.get_one::<String>("port") {
        config.server.port = port_str
            .parse()
            .map_err(|e| format!("Invalid port number '{}': {}", port_str, e))?;
    }

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }

    if matches.get_flag("json-logs") {
        config.logging.json = true;
    }

    Ok(config)
}

/// Wait for shutdown signals
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
            Ok(mut stream) => {
                stream.recv().await;
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
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
