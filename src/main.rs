use clap::Parser;
use dotenvy::dotenv;
use imgconvert::config::ConvertConfig;
use imgconvert::services::converter::ProcessConverter;
use imgconvert::services::progress::{MemoryProgressStore, ProgressStore, RedisProgressStore};
use imgconvert::services::sweeper::SessionSweeper;
use imgconvert::{AppState, create_app};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind the HTTP server to
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port for the HTTP server
    #[arg(short, long, default_value_t = 8081)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Environment & logging
    dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "imgconvert=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 Starting image conversion service...");

    let config = ConvertConfig::from_env();
    info!(
        "⚙️  Config: Storage={}, Converter={}, Accept=.{} -> .{}, Session TTL={}s",
        config.storage_root.display(),
        config.converter_path.display(),
        config.source_extension,
        config.target_extension,
        config.session_ttl_secs
    );

    // 2. Shared infrastructure, created once and injected everywhere
    tokio::fs::create_dir_all(&config.storage_root).await?;
    let store = setup_progress_store(&config).await?;
    let converter = Arc::new(ProcessConverter::new(
        config.converter_path.clone(),
        config.converter_timeout(),
    ));

    let state = AppState::new(config.clone(), store.clone(), converter);

    // 3. Session sweeper
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let sweeper = SessionSweeper::new(
        state.sessions.clone(),
        store,
        config.session_ttl(),
        config.sweep_interval(),
        shutdown_rx,
    );
    let sweeper_handle = tokio::spawn(sweeper.run());

    // 4. HTTP server
    let app = create_app(state);
    let addr = SocketAddr::new(args.host, args.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("✅ Server listening on: http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = sweeper_handle.await {
        warn!("Session sweeper ended abnormally: {}", e);
    }

    info!("🛑 Server shut down gracefully.");
    Ok(())
}

async fn setup_progress_store(config: &ConvertConfig) -> anyhow::Result<Arc<dyn ProgressStore>> {
    match &config.redis_url {
        Some(url) => {
            let store = RedisProgressStore::connect(url).await?;
            store.ping().await?;
            info!("🗄️  Progress store: redis");
            Ok(Arc::new(store))
        }
        None => {
            warn!("REDIS_URL not set, keeping progress in memory");
            Ok(Arc::new(MemoryProgressStore::new()))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("⌨️  Ctrl+C received, starting graceful shutdown...");
        },
        _ = terminate => {
            info!("💤 SIGTERM received, starting graceful shutdown...");
        },
    }
}
