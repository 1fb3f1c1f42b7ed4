use std::net::SocketAddr;
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bridge::ami::{AmiManager, CorrelationIndex, EventDispatcher};
use bridge::config::Config;
use bridge::http::{router, AppState};
use bridge::orchestrator::Orchestrator;
use bridge::store::{PgStore, Store};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to postgres");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("failed to run migrations");

    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));
    let index = Arc::new(CorrelationIndex::new());

    // The AMI reader produces into this channel; the dispatcher is its only
    // consumer and survives session reconnects.
    let (event_tx, event_rx) = mpsc::channel(1024);
    let ami = Arc::new(AmiManager::new(
        store.clone(),
        config.asterisk.clone(),
        event_tx,
    ));
    let _keepalive = ami.spawn_keepalive();
    let _dispatcher = tokio::spawn(EventDispatcher::new(store.clone(), index.clone()).run(event_rx));

    let orchestrator = Arc::new(Orchestrator::new(
        store,
        ami.clone(),
        index,
        config.default_trunk.clone(),
    ));
    let app = router(AppState { orchestrator, ami });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    tracing::info!(%addr, "bridge service starting");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(error) => {
            tracing::error!(%error, %addr, "failed to bind http listener");
            std::process::exit(1);
        }
    };

    if let Err(error) = axum::serve(listener, app).await {
        tracing::error!(%error, "http server exited with error");
        std::process::exit(1);
    }
}
