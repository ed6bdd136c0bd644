use std::net::SocketAddr;

use mimalloc::MiMalloc;
use scanplane::config::AppConfig;
use scanplane::services::{health_monitor, watchdog};
use scanplane::AppState;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scanplane=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = AppConfig::from_env().map_err(|e| anyhow::anyhow!("configuration: {e}"))?;

    let pool = scanplane::db::create_pool(&config.database_url, config.database_max_connections)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    let redis = redis::Client::open(config.redis_url.as_str())?;
    let http = reqwest::Client::builder().build()?;

    let state = AppState {
        db: pool,
        config: config.clone(),
        redis,
        http,
    };

    tokio::spawn(health_monitor::run(state.clone()));
    tokio::spawn(watchdog::run(state.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(
        host = %addr,
        workers = config.workers.len(),
        "Starting scanplane control plane"
    );

    let app = scanplane::routes::router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
