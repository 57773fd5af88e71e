//! In-process registry of DSM export jobs.
//!
//! Exports can take minutes, so the HTTP layer submits them, returns a job id
//! and lets clients poll. Jobs live only as long as the process, and
//! finished ones are dropped once their retention window has passed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dsm::{export_key, DsmEngine, ExportRequest, ExportStats};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Lifecycle of an export job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failure,
}

/// One submitted export.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ExportJob {
    pub id: Uuid,
    pub status: JobStatus,
    /// Output pixel size in metres.
    pub resolution: f64,
    /// Geodesic area of the selection.
    pub area_km2: f64,
    /// Export statistics once the job succeeded.
    #[schema(value_type = Option<Object>)]
    pub stats: Option<ExportStats>,
    /// Error message once the job failed.
    pub error: Option<String>,
    /// Blob store key of the GeoTIFF.
    #[serde(skip)]
    pub blob_key: Option<String>,
    /// When the job reached `success` or `failure`.
    #[serde(skip)]
    pub finished_at: Option<Instant>,
}

impl ExportJob {
    pub fn is_finished(&self) -> bool {
        matches!(self.status, JobStatus::Success | JobStatus::Failure)
    }
}

/// Default time a finished job stays pollable.
pub const DEFAULT_JOB_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Shared map of job id to job.
#[derive(Debug)]
pub struct JobRegistry {
    jobs: DashMap<Uuid, ExportJob>,
    retention: Duration,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::with_retention(DEFAULT_JOB_RETENTION)
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that forgets finished jobs `retention` after they finish.
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            jobs: DashMap::new(),
            retention,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Drop finished jobs older than the retention window. Returns how many
    /// were removed. Pending and running jobs are never dropped.
    pub fn prune(&self) -> usize {
        let before = self.jobs.len();
        let retention = self.retention;
        self.jobs.retain(|_, job| match job.finished_at {
            Some(at) => at.elapsed() < retention,
            None => true,
        });
        let removed = before.saturating_sub(self.jobs.len());
        if removed > 0 {
            tracing::debug!(removed, "Pruned finished export jobs");
        }
        removed
    }

    /// Register a new pending job.
    pub fn submit(&self, resolution: f64, area_km2: f64) -> ExportJob {
        self.prune();
        let job = ExportJob {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            resolution,
            area_km2,
            stats: None,
            error: None,
            blob_key: None,
            finished_at: None,
        };
        self.jobs.insert(job.id, job.clone());
        job
    }

    pub fn get(&self, id: &Uuid) -> Option<ExportJob> {
        self.jobs.get(id).map(|job| job.clone())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Number of jobs per status: `(pending, running, success, failure)`.
    pub fn counts(&self) -> (usize, usize, usize, usize) {
        let mut counts = (0, 0, 0, 0);
        for job in self.jobs.iter() {
            match job.status {
                JobStatus::Pending => counts.0 += 1,
                JobStatus::Running => counts.1 += 1,
                JobStatus::Success => counts.2 += 1,
                JobStatus::Failure => counts.3 += 1,
            }
        }
        counts
    }

    fn update(&self, id: &Uuid, f: impl FnOnce(&mut ExportJob)) {
        if let Some(mut job) = self.jobs.get_mut(id) {
            f(&mut job);
        }
    }

    pub fn mark_running(&self, id: &Uuid) {
        self.update(id, |job| job.status = JobStatus::Running);
    }

    pub fn complete(&self, id: &Uuid, stats: ExportStats, blob_key: String) {
        self.update(id, |job| {
            job.status = JobStatus::Success;
            job.stats = Some(stats);
            job.blob_key = Some(blob_key);
            job.finished_at = Some(Instant::now());
        });
    }

    pub fn fail(&self, id: &Uuid, error: String) {
        self.update(id, |job| {
            job.status = JobStatus::Failure;
            job.error = Some(error);
            job.finished_at = Some(Instant::now());
        });
    }
}

/// Run one export to completion and record the outcome. Blocking.
pub fn run_export(engine: &DsmEngine, jobs: &JobRegistry, id: Uuid, request: ExportRequest) {
    let started = Instant::now();
    jobs.mark_running(&id);
    tracing::info!(job = %id, "Export job started");

    let outcome = engine.export_dsm(&request).and_then(|export| {
        let key = export_key(&id.to_string(), export.stats.resolution);
        engine.store_export(&key, &export)?;
        Ok((export.stats, key))
    });

    let elapsed_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Ok((stats, key)) => {
            tracing::info!(job = %id, key = %key, elapsed_ms, "Export job finished");
            jobs.complete(&id, stats, key);
        }
        Err(e) => {
            tracing::warn!(job = %id, error = %e, elapsed_ms, "Export job failed");
            jobs.fail(&id, e.to_string());
        }
    }
}

/// Submit `request` and run it on the blocking pool.
pub fn spawn_export(engine: Arc<DsmEngine>, jobs: Arc<JobRegistry>, request: ExportRequest, resolution: f64) -> ExportJob {
    let job = jobs.submit(resolution, request.area_km2());
    let id = job.id;
    tokio::task::spawn_blocking(move || run_export(&engine, &jobs, id, request));
    job
}
