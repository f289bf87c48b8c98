use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use courier_server::{backends, config::Config, http, metrics, proxy::Dialer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Default to warn in production, debug in development
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        #[cfg(debug_assertions)]
        {
            "debug".to_string()
        }

        #[cfg(not(debug_assertions))]
        {
            "warn".to_string()
        }
    });

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_level))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("Starting Courier push gateway");

    // Initialize metrics before anything records to them
    let metrics_recorder = metrics::MetricsRecorder::new();
    tracing::info!("Metrics initialized");

    let config = Config::load()?;

    let dialer = Dialer::from_proxy(config.proxy.as_deref())?;

    let router = backends::build_backends(&config, &dialer).await?;
    tracing::info!(backends = router.len(), "Backends initialized");

    let metrics_handle = config
        .metrics
        .prometheus
        .enabled
        .then(|| metrics_recorder.handle().clone());

    let state = http::AppState {
        router: Arc::new(router),
    };
    let app = http::build_router(state, metrics_handle);

    let port = config.http.port;
    let mut listeners = Vec::new();
    for interface in &config.http.bind_addresses {
        let addr: SocketAddr = format!("{interface}:{port}")
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid bind address '{interface}': {e}"))?;
        tracing::info!(%addr, "Listening");
        listeners.push(tokio::net::TcpListener::bind(addr).await?);
    }

    let mut servers = tokio::task::JoinSet::new();
    for listener in listeners {
        let app = app.clone();
        servers.spawn(async move { axum::serve(listener, app).await });
    }
    while let Some(result) = servers.join_next().await {
        result??;
    }

    Ok(())
}
