//! Binary entry point: loads configuration, connects to storage, and serves the
//! HTTP/SSE surface.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use orchestrator_api::{circuits, events, health, metrics, runs, tasks, AppState};
use orchestrator_broadcast::Broadcaster;
use orchestrator_circuits::CircuitRegistry;
use orchestrator_store::{InMemoryTaskStore, PostgresTaskStore, TaskStore};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        metrics::metrics,
        tasks::list_tasks,
        tasks::get_task,
        tasks::task_stats,
        tasks::task_progress,
        tasks::retry_task,
        runs::list_runs,
        runs::get_run,
        runs::current_run,
        circuits::list_circuits,
        circuits::get_circuit,
        circuits::reset_circuit,
        circuits::circuits_health,
        events::stream_events,
    ),
    components(schemas(
        health::HealthResponse,
        health::HealthStatus,
        health::OpenCircuitSummary,
        tasks::TaskListResponse,
        tasks::TaskDetail,
        tasks::RetryResponse,
        circuits::CircuitsHealthResponse,
        orchestrator_store::Task,
        orchestrator_store::TaskStats,
        orchestrator_store::Attempt,
        orchestrator_store::ExecutionRun,
        orchestrator_store::CircuitBreakerRow,
        orchestrator_api::ErrorBody,
    )),
    tags(
        (name = "health", description = "Liveness and circuit-breaker health"),
        (name = "metrics", description = "Prometheus metrics"),
        (name = "tasks", description = "Task listing, detail, and retry"),
        (name = "runs", description = "Execution run history"),
        (name = "circuits", description = "Circuit breaker inspection and reset"),
        (name = "events", description = "Server-sent task status events"),
    ),
    info(
        title = "TDD Task Orchestrator API",
        version = env!("CARGO_PKG_VERSION"),
        description = "Run coordination, task inspection, and circuit breaker control for the multi-worker TDD orchestrator",
    )
)]
struct ApiDoc;

async fn build_store() -> Result<Arc<dyn TaskStore>> {
    match std::env::var("DATABASE_URL") {
        Ok(url) => {
            tracing::info!("connecting to postgres store");
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(10)
                .connect(&url)
                .await
                .context("failed to connect to DATABASE_URL")?;
            let store = PostgresTaskStore::new(pool);
            store.check_schema().await.context("schema check failed")?;
            Ok(Arc::new(store))
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set, using in-memory store (not for production)");
            Ok(Arc::new(InMemoryTaskStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "orchestrator_api=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("orchestrator-api starting");

    let store = build_store().await?;
    let broadcaster = Arc::new(Broadcaster::default());
    let circuits = Arc::new(CircuitRegistry::new(
        store.clone(),
        None,
        Default::default(),
        Default::default(),
        Default::default(),
    ));

    let state = AppState::new(store, circuits, broadcaster);

    let app = Router::new()
        .merge(health::routes(state.clone()))
        .merge(metrics::routes(state.clone()))
        .merge(tasks::routes(state.clone()))
        .merge(runs::routes(state.clone()))
        .merge(circuits::routes(state.clone()))
        .merge(events::routes(state))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(%bind_addr, "listening");

    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
