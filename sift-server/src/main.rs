mod api;

use sift_core::actions::Dispatcher;
use sift_core::breaker::{Admission, RateBreaker};
use sift_core::fetch::LibraryFetcher;
use sift_core::sqlite::SqliteStorage;
use sift_core::{Control, Manager, MemStorage, Pipeline, ScriptRuntime, StaticRuntime, Storage};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // The engine and its HTTP clients are blocking; build them off the
    // async runtime.
    let state = tokio::task::spawn_blocking(build_state)
        .await
        .expect("build engine state");

    let bind = std::env::var("SIFT_BIND").unwrap_or_else(|_| "0.0.0.0:8080".into());
    let app = api::api_router(state);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .unwrap_or_else(|err| panic!("bind {bind}: {err}"));

    tracing::info!(%bind, "sift-server listening");
    axum::serve(listener, app).await.expect("serve");
}

fn build_state() -> api::AppState {
    let storage: Arc<dyn Storage> = match std::env::var("SIFT_DB") {
        Ok(path) if !path.is_empty() => {
            Arc::new(SqliteStorage::open(&path).expect("open sqlite storage"))
        }
        _ => Arc::new(MemStorage::new()),
    };

    let runtime: Arc<dyn ScriptRuntime> = Arc::new(StaticRuntime::new());
    let fetcher =
        Arc::new(LibraryFetcher::new(env_usize("SIFT_LIBRARY_CACHE", 64)).expect("fetcher"));
    let breaker = Arc::new(RateBreaker::new(
        env_usize("SIFT_OUTBOUND_CAP", 0),
        Duration::from_millis(env_u64("SIFT_OUTBOUND_WINDOW_MS", 1_000)),
    ));
    let dispatcher = Arc::new(
        Dispatcher::new(Arc::clone(&runtime), Arc::clone(&fetcher), breaker)
            .expect("build dispatcher"),
    );

    api::AppState {
        pipeline: Arc::new(Pipeline {
            manager: Arc::new(Manager::new(storage, Control::default())),
            dispatcher,
            runtime,
            fetcher,
        }),
        admission: Arc::new(Admission::new(env_usize("SIFT_MAX_PENDING", 256))),
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
