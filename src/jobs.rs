//! Asynchronous job tracking for the two-step submit/poll API.
//!
//! Records are immutable snapshots behind `Arc`: every state change clones
//! the current record, mutates the clone, and swaps it in. Readers that
//! already hold a snapshot keep a consistent view while writers move on.
//! Progress is derived at read time from the inference start instant and the
//! processing estimate, so no background task has to tick counters.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::{
    EngineEvent, ProgressHook, TranscribeRequest, Transcriber, TranscriptionResult,
};

/// Progress reported the moment a worker slot is acquired.
const PROCESSING_FLOOR: f32 = 5.0;

/// Derived progress never reaches 100 while the model is still running.
const PROCESSING_CAP: f32 = 99.0;

/// Lifecycle of a submitted job.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one job. Cloned wholesale on every transition.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: Uuid,
    pub status: JobStatus,
    /// Stored floor; the derived value never drops below it.
    progress: f32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    inference_started: Option<Instant>,
    estimated_secs: Option<f64>,
    pub result: Option<TranscriptionResult>,
    pub error: Option<String>,
}

impl JobRecord {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            progress: 0.0,
            created_at: now,
            updated_at: now,
            inference_started: None,
            estimated_secs: None,
            result: None,
            error: None,
        }
    }

    /// Current progress percentage.
    ///
    /// While PROCESSING this interpolates elapsed time against the processing
    /// estimate, clamped between the stored floor and 99. Elapsed time only
    /// grows and the floor is never lowered, so repeated polls of the same
    /// job never see the value go backwards.
    pub fn progress_now(&self) -> f32 {
        if self.status != JobStatus::Processing {
            return self.progress;
        }
        let derived = match (self.inference_started, self.estimated_secs) {
            (Some(started), Some(estimated)) if estimated > 0.0 => {
                (PROCESSING_CAP as f64 * started.elapsed().as_secs_f64() / estimated) as f32
            }
            _ => 0.0,
        };
        self.progress.max(derived).min(PROCESSING_CAP)
    }
}

/// Shared registry of job records.
pub struct JobStore {
    jobs: RwLock<HashMap<Uuid, Arc<JobRecord>>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }

    // Entries are whole-record swaps, so a map behind a poisoned lock is
    // still internally consistent; recover instead of unwinding every caller.
    fn read_map(&self) -> RwLockReadGuard<'_, HashMap<Uuid, Arc<JobRecord>>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_map(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, Arc<JobRecord>>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new PENDING job and returns its snapshot.
    pub fn create(&self) -> Arc<JobRecord> {
        let record = Arc::new(JobRecord::new());
        self.write_map().insert(record.id, Arc::clone(&record));
        record
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<JobRecord>> {
        self.read_map().get(&id).map(Arc::clone)
    }

    pub fn job_count(&self) -> usize {
        self.read_map().len()
    }

    fn update(&self, id: Uuid, apply: impl FnOnce(&mut JobRecord)) -> Option<Arc<JobRecord>> {
        let mut jobs = self.write_map();
        let current = jobs.get(&id)?;
        let mut next = JobRecord::clone(current);
        apply(&mut next);
        next.updated_at = Utc::now();
        let next = Arc::new(next);
        jobs.insert(id, Arc::clone(&next));
        Some(next)
    }

    /// Moves a job to PROCESSING when its inference slot is acquired.
    pub fn mark_processing(&self, id: Uuid, estimated_secs: f64) {
        self.update(id, |job| {
            job.status = JobStatus::Processing;
            job.progress = PROCESSING_FLOOR;
            job.inference_started = Some(Instant::now());
            job.estimated_secs = Some(estimated_secs);
        });
    }

    pub fn complete(&self, id: Uuid, result: TranscriptionResult) {
        self.update(id, |job| {
            job.status = JobStatus::Completed;
            job.progress = 100.0;
            job.result = Some(result);
            job.error = None;
        });
    }

    pub fn fail(&self, id: Uuid, error: String) {
        self.update(id, |job| {
            // Freeze whatever the derived value was at failure time.
            job.progress = job.progress_now();
            job.status = JobStatus::Failed;
            job.error = Some(error);
        });
    }

    /// Drops every record older than `max_age`, counted from creation and
    /// regardless of status. Returns how many were removed.
    pub fn sweep_older_than(&self, max_age: Duration) -> usize {
        let max_age = match chrono::Duration::from_std(max_age) {
            Ok(age) => age,
            Err(_) => return 0,
        };
        let cutoff = Utc::now() - max_age;
        let mut jobs = self.write_map();
        let before = jobs.len();
        jobs.retain(|_, job| job.created_at > cutoff);
        before - jobs.len()
    }

    #[cfg(test)]
    fn backdate(&self, id: Uuid, by: chrono::Duration) {
        self.update(id, |job| {
            job.created_at -= by;
        });
    }
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives one job through the pipeline and records the outcome.
///
/// The job stays PENDING through spooling, conversion, model load and queue
/// wait; the engine's start event flips it to PROCESSING once a slot is held.
pub async fn run_job(
    engine: Arc<dyn Transcriber>,
    store: Arc<JobStore>,
    id: Uuid,
    req: TranscribeRequest,
) {
    let hook_store = Arc::clone(&store);
    let hook: ProgressHook = Box::new(move |event| match event {
        EngineEvent::InferenceStarted { estimated_secs, .. } => {
            hook_store.mark_processing(id, estimated_secs);
        }
    });

    match engine.transcribe(req, Some(hook)).await {
        Ok(result) => {
            debug!(job_id = %id, "job completed");
            store.complete(id, result);
        }
        Err(err) => {
            warn!(job_id = %id, error = %err, "job failed");
            store.fail(id, err.to_string());
        }
    }
}

/// Periodically evicts expired job records for as long as the server runs.
pub fn spawn_sweeper(store: Arc<JobStore>, every: Duration, max_age: Duration) {
    tokio::spawn(async move {
        let mut ticker = time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let swept = store.sweep_older_than(max_age);
            if swept > 0 {
                debug!(swept, remaining = store.job_count(), "swept expired job records");
            }
        }
    });
}
