use agrimon::external::{
    CropHealthService, HttpCropHealthService, HttpWeatherProvider, WeatherProvider,
};
use agrimon::{
    batching, db, irrigation, metrics, mqtt, rest, Config, IrrigationController, RateLimiter,
    SensorCatalog, SensorPipeline,
};
use anyhow::Context;
use std::future::pending;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("agrimon=info")),
        )
        .init();

    let config = Config::from_env().context("invalid configuration")?;

    info!("Starting agrimon");
    info!("HTTP server: {}", config.http_addr);
    info!("API keys configured: {}", config.api_keys.len());
    info!("Irrigation zones: {}", config.zones.join(", "));

    metrics::init_metrics().context("failed to register metrics")?;

    // Archival is optional; without a database the in-memory logs still serve.
    let mut batcher_handle: Option<JoinHandle<()>> = None;
    let mut pipeline = SensorPipeline::new(Arc::new(SensorCatalog::new()))
        .with_registry_policy(config.collaborator_policy);
    match &config.database_url {
        Some(url) => {
            info!("Database: {}", url.split('@').last().unwrap_or("***"));
            let pool = db::make_pool(url)
                .await
                .context("failed to connect to database")?;

            info!("Archive channel capacity: {}", config.channel_capacity);
            let (tx, rx) = mpsc::channel(config.channel_capacity);
            pipeline = pipeline.with_archive(tx);

            let (batch_size, batch_timeout_ms) = (config.batch_size, config.batch_timeout_ms);
            batcher_handle = Some(tokio::spawn(async move {
                batching::run_batcher(rx, pool, batch_size, batch_timeout_ms).await;
            }));
        }
        None => warn!("DATABASE_URL not set, readings are not archived"),
    }
    let pipeline = Arc::new(pipeline);

    let controller = Arc::new(
        IrrigationController::with_zones(config.zones.iter().cloned())
            .context("failed to provision irrigation zones")?,
    );
    let scheduler_handle = tokio::spawn(irrigation::run_scheduler(
        controller.clone(),
        config.schedule_tick,
    ));

    let mqtt_handle = match &config.mqtt_broker {
        Some(broker) => {
            let client_id = format!("agrimon-{}", uuid::Uuid::new_v4());
            let (broker, port, pipeline) = (broker.clone(), config.mqtt_port, pipeline.clone());
            info!("MQTT broker: {}:{}", broker, port);
            Some(tokio::spawn(async move {
                if let Err(e) = mqtt::run_mqtt(broker, port, client_id, pipeline).await {
                    error!("MQTT task failed: {}", e);
                }
            }))
        }
        None => {
            warn!("MQTT_BROKER not set, MQTT ingest disabled");
            None
        }
    };

    let weather: Option<Arc<dyn WeatherProvider>> = match &config.weather_url {
        Some(url) => Some(Arc::new(HttpWeatherProvider::new(
            url.clone(),
            config.collaborator_policy,
        )?)),
        None => None,
    };
    let crops: Option<Arc<dyn CropHealthService>> = match &config.crop_health_url {
        Some(url) => Some(Arc::new(HttpCropHealthService::new(
            url.clone(),
            config.collaborator_policy,
        )?)),
        None => None,
    };

    let app = rest::create_router(rest::AppState {
        pipeline,
        irrigation: controller,
        limiter: Arc::new(RateLimiter::new(config.tiers.clone())),
        api_keys: Arc::new(config.api_keys.clone()),
        weather,
        crops,
        paging: config.paging,
    });

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.http_addr))?;

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    tokio::select! {
        _ = join_optional(mqtt_handle) => {
            error!("MQTT task terminated");
        }
        _ = join_optional(batcher_handle) => {
            error!("Batcher task terminated");
        }
        _ = scheduler_handle => {
            error!("Scheduler task terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
    Ok(())
}

/// Waits on a task that may not have been started; a missing task never
/// completes.
async fn join_optional(handle: Option<JoinHandle<()>>) {
    match handle {
        Some(handle) => {
            let _ = handle.await;
        }
        None => pending().await,
    }
}
