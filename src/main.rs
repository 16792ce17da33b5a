use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

use imagegen::billing::{self, QuotaLedger};
use imagegen::config;
use imagegen::generation::{
    DescriptorPostProcessor, GenerationBackend, GenerationStore, HttpGenerationBackend,
    Orchestrator, OrchestratorConfig, PgGenerationStore, PostProcessor,
};
use imagegen::routes::api_routes;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    // Fail fast if the JWT secret is missing
    if config::JWT_SECRET.is_none() {
        return Err("JWT_SECRET must be set".into());
    }

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(config::DATABASE_URL.as_str())
        .await?;

    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(Box::new(error) as Box<dyn std::error::Error>);
        }
    }

    let ledger = QuotaLedger::postgres(pool.clone());
    let records: Arc<dyn GenerationStore> = Arc::new(PgGenerationStore::new(pool.clone()));
    let backend: Arc<dyn GenerationBackend> = Arc::new(HttpGenerationBackend::from_env()?);
    let post_processor: Arc<dyn PostProcessor> = Arc::new(DescriptorPostProcessor);
    let orchestrator_config = OrchestratorConfig::from_env();
    tracing::info!(
        max_attempts = orchestrator_config.retry.max_attempts,
        deadline_secs = orchestrator_config.deadline.as_secs(),
        compensation = ?orchestrator_config.compensation,
        "generation orchestrator configured"
    );
    let orchestrator = Orchestrator::new(
        ledger.clone(),
        records.clone(),
        backend,
        post_processor,
        orchestrator_config,
    );

    billing::spawn_quota_scheduler(ledger.clone(), records);

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(api_routes())
        .layer(prometheus_layer)
        .layer(Extension(ledger))
        .layer(Extension(orchestrator));

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .map_err(|error| Box::new(error) as Box<dyn std::error::Error>)?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
