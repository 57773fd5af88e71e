//! HTTP request handlers for the DSM service.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use dsm::{Area, DsmError, ExportRequest, PointCloudDataset, DEFAULT_PROFILE_SAMPLES};
use geo::{Coord, Point, Rect};
use geojson::Geometry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::jobs::{spawn_export, ExportJob, JobStatus};
use crate::AppState;

/// Most samples a single profile request may ask for.
pub const MAX_PROFILE_SAMPLES: usize = 10_000;

/// Query parameters for elevation endpoint.
#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ElevationQuery {
    /// Latitude in decimal degrees (-90 to 90).
    pub lat: f64,
    /// Longitude in decimal degrees (-180 to 180).
    pub lon: f64,
}

/// Successful elevation response.
#[derive(Debug, Serialize, ToSchema)]
pub struct ElevationResponse {
    /// Surface elevation in metres; 0 when no dataset has data here.
    pub elevation: f32,
    /// Whether a dataset had data at this point.
    pub found: bool,
    /// Latitude queried.
    pub lat: f64,
    /// Longitude queried.
    pub lon: f64,
}

/// A WGS84 position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    fn point(&self) -> Point<f64> {
        Point::new(self.lon, self.lat)
    }
}

/// Profile request between a transmitter and a receiver.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ProfileRequest {
    pub tx: LatLon,
    pub rx: LatLon,
    /// Number of samples including both endpoints (default 256).
    pub samples: Option<usize>,
    /// Antenna height above the surface at `tx`, metres.
    #[serde(default)]
    pub tx_height: f64,
    /// Antenna height above the surface at `rx`, metres.
    #[serde(default)]
    pub rx_height: f64,
}

/// One profile sample.
#[derive(Debug, Serialize, ToSchema)]
pub struct ProfilePointResponse {
    pub lat: f64,
    pub lon: f64,
    pub distance_m: f64,
    /// `null` where no dataset has data.
    pub elevation: Option<f32>,
}

/// Line-of-sight verdict for the requested antenna heights.
#[derive(Debug, Serialize, ToSchema)]
pub struct LineOfSightResponse {
    pub clear: bool,
    pub first_obstruction_m: Option<f64>,
    pub max_intrusion_m: Option<f64>,
}

/// Surface profile response.
#[derive(Debug, Serialize, ToSchema)]
pub struct ProfileResponse {
    pub distance_m: f64,
    /// Fraction of samples with data (0.0 to 1.0).
    pub coverage: f64,
    pub line_of_sight: LineOfSightResponse,
    pub points: Vec<ProfilePointResponse>,
}

/// Export submission body.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ExportBody {
    /// GeoJSON Polygon or MultiPolygon in WGS84.
    #[schema(value_type = Object)]
    pub area: Geometry,
    /// Output pixel size in metres (service default when omitted).
    pub resolution: Option<f64>,
}

/// Bounding box filter for the dataset listing.
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct DatasetsQuery {
    pub min_lat: Option<f64>,
    pub min_lon: Option<f64>,
    pub max_lat: Option<f64>,
    pub max_lon: Option<f64>,
}

/// Catalog entry.
#[derive(Debug, Serialize, ToSchema)]
pub struct DatasetResponse {
    pub id: u64,
    pub name: String,
    pub srs: u32,
    pub count: u64,
    pub url: String,
    /// `YYYY-MM-DD`
    pub collect_start: Option<String>,
    /// `YYYY-MM-DD`
    pub collect_end: Option<String>,
    pub noisy: bool,
    pub valid: bool,
    pub high_resolution_boundary: bool,
}

impl From<&PointCloudDataset> for DatasetResponse {
    fn from(d: &PointCloudDataset) -> Self {
        Self {
            id: d.id,
            name: d.name.clone(),
            srs: d.srs,
            count: d.count,
            url: d.url.clone(),
            collect_start: d.collection_start.map(|date| date.to_string()),
            collect_end: d.collection_end.map(|date| date.to_string()),
            noisy: d.noisy,
            valid: d.valid,
            high_resolution_boundary: d.high_resolution_boundary.is_some(),
        }
    }
}

/// Error response.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message.
    pub error: String,
}

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Service status.
    pub status: String,
    /// Service version.
    pub version: String,
}

/// Hit/miss counters of one cache.
#[derive(Debug, Serialize, ToSchema)]
pub struct CacheStatsResponse {
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
    /// Cache hit rate (0.0 to 1.0).
    pub hit_rate: f64,
}

impl From<dsm::CacheStats> for CacheStatsResponse {
    fn from(stats: dsm::CacheStats) -> Self {
        Self {
            entries: stats.entry_count,
            hits: stats.hit_count,
            misses: stats.miss_count,
            hit_rate: stats.hit_rate(),
        }
    }
}

/// Service statistics response.
#[derive(Debug, Serialize, ToSchema)]
pub struct StatsResponse {
    /// Datasets in the catalog, including invalidated ones.
    pub datasets: usize,
    /// Decoded tiles held in memory.
    pub tile_cache: CacheStatsResponse,
    /// Memoised profiles.
    pub profile_cache: CacheStatsResponse,
    pub export_jobs: usize,
    pub export_jobs_running: usize,
}

/// Map a library error to a status code and JSON body.
pub fn error_response(e: DsmError) -> Response {
    let status = match &e {
        DsmError::InvalidGeometry { .. } | DsmError::InvalidArea { .. } => StatusCode::BAD_REQUEST,
        DsmError::DatasetNotFound { .. } | DsmError::TileNotFound { .. } => StatusCode::NOT_FOUND,
        DsmError::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(error = %e, "Request failed");
    } else {
        tracing::debug!(error = %e, "Request rejected");
    }
    message(status, e.to_string())
}

fn message(status: StatusCode, error: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: error.into() })).into_response()
}

/// Run a blocking engine call off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, Response>
where
    F: FnOnce() -> dsm::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(error_response(e)),
        Err(e) => Err(message(StatusCode::INTERNAL_SERVER_ERROR, format!("Worker failed: {}", e))),
    }
}

/// Get the surface elevation at a coordinate.
///
/// # Returns
///
/// - `200 OK` with the elevation (0 and `found: false` without coverage)
/// - `400 Bad Request` if coordinates are invalid
/// - `503 Service Unavailable` if the tile store is unreachable
#[utoipa::path(
    get,
    path = "/elevation",
    params(ElevationQuery),
    responses(
        (status = 200, description = "Surface elevation", body = ElevationResponse),
        (status = 400, description = "Invalid coordinates", body = ErrorResponse),
        (status = 503, description = "Tile store unavailable", body = ErrorResponse)
    ),
    tag = "elevation"
)]
pub async fn get_elevation(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ElevationQuery>,
) -> Response {
    tracing::debug!(lat = query.lat, lon = query.lon, "Elevation query");

    let engine = state.engine.clone();
    let (lat, lon) = (query.lat, query.lon);
    match blocking(move || engine.sample_elevation(lat, lon)).await {
        Ok(sample) => Json(ElevationResponse {
            elevation: sample.legacy_value(),
            found: sample.value().is_some(),
            lat,
            lon,
        })
        .into_response(),
        Err(response) => response,
    }
}

/// Add surface elevations to every coordinate of a GeoJSON geometry.
pub async fn post_elevation(State(state): State<Arc<AppState>>, Json(geometry): Json<Geometry>) -> Response {
    let engine = state.engine.clone();
    match blocking(move || dsm::geojson::add_elevations_to_geometry(&engine, geometry)).await {
        Ok(geometry) => Json(geometry).into_response(),
        Err(response) => response,
    }
}

/// Sample the surface between two points and check line of sight.
#[utoipa::path(
    post,
    path = "/profile",
    request_body = ProfileRequest,
    responses(
        (status = 200, description = "Surface profile", body = ProfileResponse),
        (status = 400, description = "Invalid request", body = ErrorResponse)
    ),
    tag = "elevation"
)]
pub async fn post_profile(State(state): State<Arc<AppState>>, Json(request): Json<ProfileRequest>) -> Response {
    let samples = request.samples.unwrap_or(DEFAULT_PROFILE_SAMPLES);
    if samples > MAX_PROFILE_SAMPLES {
        return message(
            StatusCode::BAD_REQUEST,
            format!("At most {} samples per profile, got {}", MAX_PROFILE_SAMPLES, samples),
        );
    }

    let engine = state.engine.clone();
    let (tx, rx) = (request.tx.point(), request.rx.point());
    let profile = match blocking(move || engine.surface_profile(tx, rx, samples)).await {
        Ok(profile) => profile,
        Err(response) => return response,
    };

    let los = profile.line_of_sight(request.tx_height, request.rx_height);
    Json(ProfileResponse {
        distance_m: profile.total_distance_m(),
        coverage: profile.coverage(),
        line_of_sight: LineOfSightResponse {
            clear: los.clear,
            first_obstruction_m: los.first_obstruction_m,
            max_intrusion_m: los.max_intrusion_m.is_finite().then_some(los.max_intrusion_m),
        },
        points: profile
            .points
            .iter()
            .map(|p| ProfilePointResponse {
                lat: p.lat,
                lon: p.lon,
                distance_m: p.distance_m,
                elevation: p.elevation,
            })
            .collect(),
    })
    .into_response()
}

/// Submit a DSM export for an area of interest.
///
/// The selection is validated immediately; the export itself runs in the
/// background. Poll `GET /dsm/export/{id}` for its status.
#[utoipa::path(
    post,
    path = "/dsm/export",
    request_body = ExportBody,
    responses(
        (status = 202, description = "Export accepted", body = ExportJob),
        (status = 400, description = "Invalid or oversized selection", body = ErrorResponse)
    ),
    tag = "export"
)]
pub async fn post_export(State(state): State<Arc<AppState>>, Json(body): Json<ExportBody>) -> Response {
    let area = match dsm::geojson::geometry_to_multi_polygon(&body.area) {
        Ok(area) => area,
        Err(e) => return error_response(e),
    };
    let config = state.engine.config();
    let resolution = body.resolution.unwrap_or(config.export_resolution);
    let request = ExportRequest::new(area).with_resolution(resolution);
    if let Err(e) = request.validate(config.max_area_km2) {
        return error_response(e);
    }

    let job = spawn_export(state.engine.clone(), state.jobs.clone(), request, resolution);
    tracing::info!(job = %job.id, area_km2 = job.area_km2, resolution, "Export submitted");
    (StatusCode::ACCEPTED, Json(job)).into_response()
}

/// Status of an export job.
#[utoipa::path(
    get,
    path = "/dsm/export/{id}",
    params(("id" = Uuid, Path, description = "Export job id")),
    responses(
        (status = 200, description = "Job status", body = ExportJob),
        (status = 404, description = "Unknown job", body = ErrorResponse)
    ),
    tag = "export"
)]
pub async fn get_export(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.jobs.get(&id) {
        Some(job) => Json(job).into_response(),
        None => message(StatusCode::NOT_FOUND, format!("Export {} not found", id)),
    }
}

/// Download the GeoTIFF of a finished export.
#[utoipa::path(
    get,
    path = "/dsm/export/{id}/download",
    params(("id" = Uuid, Path, description = "Export job id")),
    responses(
        (status = 200, description = "GeoTIFF", content_type = "image/tiff"),
        (status = 404, description = "Unknown job", body = ErrorResponse),
        (status = 409, description = "Export not finished", body = ErrorResponse)
    ),
    tag = "export"
)]
pub async fn download_export(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    let Some(job) = state.jobs.get(&id) else {
        return message(StatusCode::NOT_FOUND, format!("Export {} not found", id));
    };
    let (JobStatus::Success, Some(key)) = (job.status, job.blob_key) else {
        return message(
            StatusCode::CONFLICT,
            format!("Export {} is not ready (status {:?})", id, job.status),
        );
    };

    let engine = state.engine.clone();
    let lookup = key.clone();
    match blocking(move || engine.load_export(&lookup)).await {
        Ok(Some(bytes)) => (
            [
                (header::CONTENT_TYPE, "image/tiff".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"dsm-export-{}.tif\"", id),
                ),
            ],
            bytes,
        )
            .into_response(),
        Ok(None) => message(StatusCode::NOT_FOUND, format!("Export file {} is missing", key)),
        Err(response) => response,
    }
}

/// List catalog datasets, optionally only those intersecting a bounding box.
#[utoipa::path(
    get,
    path = "/datasets",
    params(DatasetsQuery),
    responses(
        (status = 200, description = "Datasets, most recent first", body = [DatasetResponse]),
        (status = 400, description = "Incomplete bounding box", body = ErrorResponse)
    ),
    tag = "catalog"
)]
pub async fn list_datasets(State(state): State<Arc<AppState>>, Query(query): Query<DatasetsQuery>) -> Response {
    let datasets = match (query.min_lat, query.min_lon, query.max_lat, query.max_lon) {
        (None, None, None, None) => state.engine.catalog().all_including_invalid(),
        (Some(min_lat), Some(min_lon), Some(max_lat), Some(max_lon)) => {
            let rect = Rect::new(Coord { x: min_lon, y: min_lat }, Coord { x: max_lon, y: max_lat });
            state.engine.datasets_intersecting(&Area::Rect(rect))
        }
        _ => {
            return message(
                StatusCode::BAD_REQUEST,
                "Bounding box needs min_lat, min_lon, max_lat and max_lon",
            )
        }
    };

    let body: Vec<DatasetResponse> = datasets.iter().map(|d| DatasetResponse::from(d.as_ref())).collect();
    Json(body).into_response()
}

/// Health check endpoint.
///
/// Returns service status and version.
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is healthy", body = HealthResponse)),
    tag = "system"
)]
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Cache and job statistics.
#[utoipa::path(
    get,
    path = "/stats",
    responses((status = 200, description = "Service statistics", body = StatsResponse)),
    tag = "system"
)]
pub async fn get_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let stats = state.engine.stats();
    let (_, running, _, _) = state.jobs.counts();

    Json(StatsResponse {
        datasets: stats.datasets,
        tile_cache: stats.tile_cache.into(),
        profile_cache: stats.result_cache.into(),
        export_jobs: state.jobs.len(),
        export_jobs_running: running,
    })
}
