use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use conversion_relay::auth::DEFAULT_REPLAY_WINDOW;
use conversion_relay::dispatch::{DEFAULT_SEND_TIMEOUT, Dispatcher};
use conversion_relay::ingest::Pipeline;
use conversion_relay::ledger::Ledger;
use conversion_relay::lock::DistributedLock;
use conversion_relay::server::{AdminSecrets, AppState, build_router};
use conversion_relay::shop::ShopResolver;
use conversion_relay::store::{MemoryStore, RedisStore, StoreHandle};
use conversion_relay::worker::{IngestQueue, TaskRunner};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conversion_relay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let data_dir = std::env::var("RELAY_DATA_DIR").unwrap_or_else(|_| "data".into());
    let bind: SocketAddr = std::env::var("RELAY_BIND")
        .unwrap_or_else(|_| "0.0.0.0:3000".into())
        .parse()
        .expect("RELAY_BIND must be a socket address");
    let admin_secrets = AdminSecrets {
        current: std::env::var("RELAY_ADMIN_SECRET").expect("RELAY_ADMIN_SECRET must be set"),
        previous: std::env::var("RELAY_ADMIN_SECRET_PREVIOUS").ok(),
    };

    // With no Redis URL the store falls back to in-process memory, which is
    // only correct for a single instance.
    let store: StoreHandle = match std::env::var("REDIS_URL") {
        Ok(url) => {
            let store = RedisStore::connect(&url, 8)
                .await
                .expect("failed to connect to Redis");
            tracing::info!("using Redis shared store");
            Arc::new(store)
        }
        Err(_) => {
            tracing::warn!("REDIS_URL not set, using the in-process store (single instance only)");
            Arc::new(MemoryStore::new())
        }
    };

    let dispatcher =
        Arc::new(Dispatcher::new(DEFAULT_SEND_TIMEOUT).expect("failed to build HTTP client"));
    let pipeline = Arc::new(Pipeline::new(
        Arc::new(ShopResolver::new(&data_dir)),
        store.clone(),
        Ledger::new(&data_dir),
        dispatcher,
        DEFAULT_REPLAY_WINDOW,
    ));
    let runner = TaskRunner::new(
        pipeline.clone(),
        DistributedLock::new(store),
        IngestQueue::new(&data_dir),
    );

    let app = build_router(AppState::new(pipeline, runner, &data_dir, admin_secrets));

    tracing::info!(%bind, data_dir, "listening");
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .expect("server error");
}
