use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};

use engine::api;
use engine::config::Config;
use engine::executor::GatewaySpecialistPort;
use engine::inference::HttpInferenceGateway;
use engine::lock::SqliteLockService;
use engine::orchestrator::{Orchestrator, OrchestratorSettings};
use engine::store::{connect, SqliteStateStore, StateStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // Fatal on missing inference credentials; everything else defaults.
    let config = Config::from_env()?;

    tracing::info!("Starting research engine");

    let pool = connect(&config.database_url).await?;
    let store = SqliteStateStore::new(pool.clone());
    store.migrate().await?;
    let lock_service = SqliteLockService::new(pool);
    lock_service.migrate().await?;

    let gateway = Arc::new(HttpInferenceGateway::new(config.inference.clone())?);
    let specialists = Arc::new(GatewaySpecialistPort::new(gateway.clone()));

    let store: Arc<dyn StateStore> = Arc::new(store);
    let orchestrator = Orchestrator::new(
        store.clone(),
        Some(Arc::new(lock_service)),
        gateway,
        specialists,
        OrchestratorSettings {
            run_lease: config.run_lease,
            heartbeat_staleness: config.heartbeat_staleness,
            lock_ttl: config.lock_ttl,
            lock_attempts: config.lock_attempts,
            lock_backoff: config.lock_backoff,
            task_timeout: config.task_timeout,
            max_iterations: config.max_iterations,
            insight_cap: config.insight_cap,
            confidence_floor: config.confidence_floor,
        },
    )?;

    let allowed_origins = config
        .allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect::<Vec<_>>();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT, header::AUTHORIZATION])
        .max_age(std::time::Duration::from_secs(3600));

    let api_state = api::ApiState {
        orchestrator: Arc::new(orchestrator),
        store,
    };
    let app = api::router().with_state(api_state).layer(cors);

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!(addr = %addr, "Engine API listening");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
