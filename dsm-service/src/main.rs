//! DSM Service - HTTP microservice for Digital Surface Model queries.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DSM_DATA_DIR` | Root directory of the tile store | current directory |
//! | `DSM_CATALOG` | GeoJSON FeatureCollection of datasets | empty catalog |
//! | `DSM_PORT` | HTTP server port | 8080 |
//! | `DSM_PRELOAD` | Dataset ids to generate at startup, e.g. `3,7` | None |
//! | `DSM_TILE_SOURCE_URL` | URL template of an upstream tile server | None |
//! | `DSM_JOB_RETENTION_SECS` | How long finished export jobs stay pollable | 86400 |
//! | `RUST_LOG` | Log level (e.g., "info", "debug") | "info" |
//!
//! Engine tuning variables (`DSM_EXPORT_ZOOM`, `DSM_MAX_AREA_KM2`, ...) are
//! read by [`dsm::DsmEngineBuilder::from_env`].
//!
//! ## Endpoints
//!
//! - `GET /elevation?lat=X&lon=Y` - Surface elevation at a coordinate
//! - `POST /elevation` - Add elevations to a GeoJSON geometry
//! - `POST /profile` - Surface profile and line of sight between two points
//! - `POST /dsm/export` - Submit a GeoTIFF export
//! - `GET /dsm/export/{id}` - Export status
//! - `GET /dsm/export/{id}/download` - Download a finished export
//! - `GET /datasets` - List catalog datasets
//! - `GET /health` - Health check
//! - `GET /stats` - Cache statistics
//! - `GET /docs` - OpenAPI documentation (Swagger UI)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dsm::{DatasetId, DsmEngine, DsmEngineBuilder, InMemoryCatalog};
use dsm_service::jobs::{JobRegistry, DEFAULT_JOB_RETENTION};
use dsm_service::{router, AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dsm_service=info,dsm=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let port: u16 = std::env::var("DSM_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let engine = build_engine()?;

    let retention = std::env::var("DSM_JOB_RETENTION_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .map_or(DEFAULT_JOB_RETENTION, Duration::from_secs);

    tracing::info!(
        datasets = engine.stats().datasets,
        export_zoom = engine.config().export_zoom,
        max_area_km2 = engine.config().max_area_km2,
        port = port,
        job_retention_secs = retention.as_secs(),
        "Starting DSM service"
    );

    let state = Arc::new(AppState::with_jobs(engine, JobRegistry::with_retention(retention)));

    if let Ok(preload_val) = std::env::var("DSM_PRELOAD") {
        let ids = parse_preload_ids(&preload_val);
        let engine = state.engine.clone();
        tokio::task::spawn_blocking(move || preload(&engine, &ids));
    }

    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("Listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

fn build_engine() -> Result<DsmEngine, Box<dyn std::error::Error>> {
    // The library handles DSM_DATA_DIR and the engine tuning variables
    let mut builder = match DsmEngineBuilder::from_env() {
        Ok(builder) => builder,
        Err(_) => {
            tracing::warn!("DSM_DATA_DIR not set, using current directory");
            DsmEngine::builder().data_dir(".")
        }
    };

    if let Ok(path) = std::env::var("DSM_CATALOG") {
        let text = std::fs::read_to_string(&path)?;
        let catalog = InMemoryCatalog::from_geojson(&text)?;
        tracing::info!(path = %path, datasets = catalog.len(), "Loaded catalog");
        builder = builder.catalog(Arc::new(catalog));
    }

    Ok(builder.build()?)
}

fn preload(engine: &DsmEngine, ids: &[DatasetId]) {
    for &id in ids {
        match engine.generate_dataset(id) {
            Ok(report) => tracing::info!(
                dataset = id,
                generated = report.generated,
                already_present = report.already_present,
                no_data = report.no_data,
                failed = report.failed,
                elapsed_ms = report.elapsed_ms,
                "Preload complete"
            ),
            Err(e) => tracing::warn!(dataset = id, error = %e, "Preload failed"),
        }
    }
}

/// Parse the `DSM_PRELOAD` value: dataset ids separated by `,`.
fn parse_preload_ids(value: &str) -> Vec<DatasetId> {
    value
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .filter_map(|s| match s.trim().parse() {
            Ok(id) => Some(id),
            Err(_) => {
                tracing::warn!(value = s, "Invalid dataset id in DSM_PRELOAD");
                None
            }
        })
        .collect()
}
