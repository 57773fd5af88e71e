//! DSM Service Library
//!
//! HTTP handlers, export jobs and routing for the DSM service.
//! This library is used by both the dsm-service binary and integration tests.

pub mod handlers;
pub mod jobs;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use dsm::DsmEngine;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::jobs::JobRegistry;

/// Application state shared across handlers.
pub struct AppState {
    /// Engine answering samples, profiles and exports.
    pub engine: Arc<DsmEngine>,
    /// Submitted export jobs.
    pub jobs: Arc<JobRegistry>,
}

impl AppState {
    pub fn new(engine: DsmEngine) -> Self {
        Self::with_jobs(engine, JobRegistry::new())
    }

    pub fn with_jobs(engine: DsmEngine, jobs: JobRegistry) -> Self {
        Self {
            engine: Arc::new(engine),
            jobs: Arc::new(jobs),
        }
    }
}

/// OpenAPI documentation for the DSM service.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "DSM Service",
        version = "0.1.0",
        description = "Digital Surface Model sampling, line-of-sight profiles and GeoTIFF exports.",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT"),
        contact(name = "Pedro Sanz Martinez", url = "https://github.com/pedrosanzmtz/dsm")
    ),
    paths(
        handlers::get_elevation,
        handlers::post_profile,
        handlers::post_export,
        handlers::get_export,
        handlers::download_export,
        handlers::list_datasets,
        handlers::health_check,
        handlers::get_stats,
    ),
    components(
        schemas(
            handlers::ElevationResponse,
            handlers::LatLon,
            handlers::ProfileRequest,
            handlers::ProfileResponse,
            handlers::ProfilePointResponse,
            handlers::LineOfSightResponse,
            handlers::ExportBody,
            handlers::DatasetResponse,
            handlers::ErrorResponse,
            handlers::HealthResponse,
            handlers::CacheStatsResponse,
            handlers::StatsResponse,
            jobs::ExportJob,
            jobs::JobStatus,
        )
    ),
    tags(
        (name = "elevation", description = "Surface elevation and profile endpoints"),
        (name = "export", description = "Asynchronous DSM exports"),
        (name = "catalog", description = "Point-cloud dataset catalog"),
        (name = "system", description = "System and health endpoints")
    )
)]
pub struct ApiDoc;

/// Build the service router with tracing, CORS and Swagger UI.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route(
            "/elevation",
            get(handlers::get_elevation).post(handlers::post_elevation),
        )
        .route("/profile", post(handlers::post_profile))
        .route("/dsm/export", post(handlers::post_export))
        .route("/dsm/export/:id", get(handlers::get_export))
        .route("/dsm/export/:id/download", get(handlers::download_export))
        .route("/datasets", get(handlers::list_datasets))
        .route("/health", get(handlers::health_check))
        .route("/stats", get(handlers::get_stats))
        .layer(
            ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            ),
        )
        .with_state(state)
}

// Re-export commonly used types for convenience
pub use handlers::{
    DatasetResponse, ElevationQuery, ElevationResponse, ErrorResponse, HealthResponse, ProfileRequest,
    ProfileResponse, StatsResponse,
};
pub use jobs::{ExportJob, JobStatus};
