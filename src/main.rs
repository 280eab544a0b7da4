mod agent;
mod api;
mod config;
pub mod registry;
mod relay;
#[cfg(test)]
mod testing;
mod twilio;

use std::net::SocketAddr;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use agent::connector::AgentConnector;
use config::Config;
use relay::session::SessionSettings;
use relay::Relay;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared application state accessible from all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub relay: Relay,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("--version") => println!("voice-relay {VERSION}"),
        Some("--help") | Some("-h") => print_usage(),
        Some("--check-config") => check_config(),
        Some(other) => {
            eprintln!("Unknown option: {other}");
            print_usage();
            std::process::exit(1);
        }
        None => {
            let rt = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");
            rt.block_on(server());
        }
    }
}

fn print_usage() {
    println!("voice-relay {VERSION}");
    println!("Bridges Twilio media streams to a conversational voice agent");
    println!();
    println!("Usage: voice-relay [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --check-config  Load and validate the config, then exit");
    println!("  --version       Print version");
    println!("  --help, -h      Print this help message");
    println!();
    println!("Without options, starts the relay server.");
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_relay=info,tower_http=info".into()),
        )
        .init();
}

fn load_config() -> Config {
    match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    }
}

fn build_connector(config: &Config) -> AgentConnector {
    match AgentConnector::from_config(&config.agent) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Invalid agent credential: {e}");
            std::process::exit(1);
        }
    }
}

fn check_config() {
    init_tracing();
    let config = load_config();
    let connector = build_connector(&config);

    println!("Config OK");
    println!("  listen:      {}:{}", config.server.host, config.server.port);
    println!("  external:    {}", config.server.external_url);
    println!("  agent:       {}", connector.describe());
    println!(
        "  credential:  {:?} ({})",
        config.agent.credential_mode,
        if config.agent.api_key.is_empty() {
            "no key"
        } else {
            "key set"
        }
    );
    println!("  retries:     {}", config.agent.connect_retries);
}

async fn server() {
    init_tracing();
    let config = load_config();
    let connector = build_connector(&config);

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        agent = %connector.describe(),
        "Starting voice-relay"
    );

    let shutdown = CancellationToken::new();
    let settings = SessionSettings::from(&config);
    let teardown = settings.teardown_timeout;
    let relay = Relay::new(connector, settings, shutdown.clone());

    let state = AppState {
        config: config.clone(),
        relay: relay.clone(),
    };

    // Build router
    let app = Router::new()
        // Twilio webhook
        .route(
            "/twilio/voice",
            get(twilio::webhook::handle_voice).post(twilio::webhook::handle_voice),
        )
        // Twilio media stream (WebSocket)
        .route("/twilio/media", get(twilio::media::handle_media_upgrade))
        // Push a payload to every active call
        .route("/api/broadcast", post(api::broadcast::handle_broadcast))
        .route("/api/sessions", get(api::sessions::handle_sessions))
        .route("/api/sessions/{id}", get(api::sessions::handle_session))
        // Health check
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .expect("Invalid server address");

    tracing::info!(%addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind");

    tokio::spawn(watch_signals(shutdown.clone()));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .expect("Server error");

    drain_sessions(&relay, teardown * 2).await;
    tracing::info!("Shut down");
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM.
async fn watch_signals(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("Shutdown requested, closing sessions");
    shutdown.cancel();
}

/// Give cancelled sessions time to send their close frames and deregister.
async fn drain_sessions(relay: &Relay, limit: Duration) {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if relay.registry().is_empty().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            let remaining = relay.registry().len().await;
            tracing::warn!(remaining, "Sessions still open at exit");
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn health() -> &'static str {
    "ok"
}
