//! Background job surface for the HTTP layer.
//!
//! Graph generation runs as a background job: `submit` returns a job id
//! immediately, the HTTP layer polls `status`. The worker pool drains a
//! bounded queue; a full queue rejects submission rather than blocking the
//! caller. Cancellation is only guaranteed for jobs still waiting in the
//! queue; an active job's token is cancelled best-effort.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::graph::{
    progress_channel, GenerateParams, GenerationProgress, GenerationStage, GraphData,
    GraphGenerator,
};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

/// What a graph-generation job should do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub document_text: String,
    pub document_title: String,
    pub user_id: Option<String>,
    pub document_id: Option<String>,
}

impl JobSpec {
    pub fn new(document_text: impl Into<String>, document_title: impl Into<String>) -> Self {
        Self {
            document_text: document_text.into(),
            document_title: document_title.into(),
            user_id: None,
            document_id: None,
        }
    }
}

/// Snapshot returned to pollers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    pub progress: GenerationProgress,
    pub result: Option<GraphData>,
    pub error: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub estimated_completion_time: Option<DateTime<Utc>>,
}

/// Executes one job. The seam exists so the queue can be driven without a
/// full orchestrator stack in tests.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn run(
        &self,
        spec: &JobSpec,
        progress: watch::Sender<GenerationProgress>,
        cancel: CancellationToken,
    ) -> Result<GraphData>;
}

#[async_trait]
impl JobHandler for GraphGenerator {
    async fn run(
        &self,
        spec: &JobSpec,
        progress: watch::Sender<GenerationProgress>,
        cancel: CancellationToken,
    ) -> Result<GraphData> {
        let mut params = GenerateParams::new(&spec.document_text, &spec.document_title);
        params.user_id = spec.user_id.clone();
        params.document_id = spec.document_id.clone();
        params.progress = Some(progress);
        params.cancel = Some(cancel);
        self.generate(params).await
    }
}

struct JobEntry {
    spec: JobSpec,
    state: JobState,
    result: Option<GraphData>,
    error: Option<String>,
    attempts: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<Instant>,
    progress: Option<watch::Receiver<GenerationProgress>>,
    cancel: CancellationToken,
}

/// Queue configuration.
#[derive(Debug, Clone, Copy)]
pub struct JobQueueConfig {
    /// Bounded submission queue capacity.
    pub capacity: usize,
    /// Worker pool size.
    pub workers: usize,
    /// Manual retries allowed per job.
    pub max_attempts: u32,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            workers: 4,
            max_attempts: 3,
        }
    }
}

struct Inner {
    handler: Arc<dyn JobHandler>,
    jobs: RwLock<HashMap<String, JobEntry>>,
    tx: mpsc::Sender<String>,
    config: JobQueueConfig,
}

/// Bounded job queue with a worker pool.
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl JobQueue {
    /// Create a queue and start its workers on the current runtime.
    pub fn new(handler: Arc<dyn JobHandler>, config: JobQueueConfig) -> Self {
        let (tx, rx) = mpsc::channel::<String>(config.capacity.max(1));
        let inner = Arc::new(Inner {
            handler,
            jobs: RwLock::new(HashMap::new()),
            tx,
            config,
        });

        let rx = Arc::new(Mutex::new(rx));
        for _ in 0..config.workers.max(1) {
            let inner = inner.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let job_id = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    match job_id {
                        Some(id) => process_job(&inner, &id).await,
                        None => break,
                    }
                }
            });
        }

        Self { inner }
    }

    /// Enqueue a job. Non-blocking: a full queue returns `QUEUE_FULL`.
    pub async fn submit(&self, spec: JobSpec) -> Result<String> {
        let job_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let entry = JobEntry {
            spec,
            state: JobState::Waiting,
            result: None,
            error: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            progress: None,
            cancel: CancellationToken::new(),
        };

        {
            let mut jobs = self.inner.jobs.write().await;
            jobs.insert(job_id.clone(), entry);
        }

        match self.inner.tx.try_send(job_id.clone()) {
            Ok(()) => {
                info!(job_id, "job submitted");
                Ok(job_id)
            }
            Err(_) => {
                let mut jobs = self.inner.jobs.write().await;
                jobs.remove(&job_id);
                Err(Error::QueueFull {
                    capacity: self.inner.config.capacity,
                })
            }
        }
    }

    /// Poll a job's status.
    pub async fn status(&self, job_id: &str) -> Option<JobStatus> {
        let jobs = self.inner.jobs.read().await;
        let entry = jobs.get(job_id)?;

        let progress = entry
            .progress
            .as_ref()
            .map(|rx| rx.borrow().clone())
            .unwrap_or(GenerationProgress {
                stage: GenerationStage::Estimating,
                percentage: 0.0,
                message: "waiting".to_string(),
                chunks_processed: None,
                total_chunks: None,
            });

        let estimated_completion_time = match (entry.state, entry.started_at) {
            (JobState::Active, Some(started)) if progress.percentage > 5.0 => {
                let elapsed = started.elapsed().as_secs_f64();
                let remaining = elapsed * (100.0 - progress.percentage) / progress.percentage;
                Some(Utc::now() + chrono::Duration::milliseconds((remaining * 1000.0) as i64))
            }
            _ => None,
        };

        Some(JobStatus {
            state: entry.state,
            progress,
            result: entry.result.clone(),
            error: entry.error.clone(),
            attempts: entry.attempts,
            max_attempts: self.inner.config.max_attempts,
            created_at: entry.created_at,
            updated_at: entry.updated_at,
            estimated_completion_time,
        })
    }

    /// Cancel a job. Only guaranteed for jobs still waiting; an active job's
    /// token is cancelled best-effort and `false` is returned.
    pub async fn cancel(&self, job_id: &str) -> bool {
        let mut jobs = self.inner.jobs.write().await;
        let Some(entry) = jobs.get_mut(job_id) else {
            return false;
        };
        entry.cancel.cancel();
        match entry.state {
            JobState::Waiting => {
                entry.state = JobState::Failed;
                entry.error = Some("cancelled".to_string());
                entry.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// Re-enqueue a failed job. Returns the job id on success.
    pub async fn retry(&self, job_id: &str) -> Result<String> {
        {
            let mut jobs = self.inner.jobs.write().await;
            let entry = jobs
                .get_mut(job_id)
                .ok_or_else(|| Error::Config(format!("unknown job {job_id}")))?;
            if entry.state != JobState::Failed {
                return Err(Error::Config(format!(
                    "job {job_id} is not failed, cannot retry"
                )));
            }
            if entry.attempts >= self.inner.config.max_attempts {
                return Err(Error::Config(format!(
                    "job {job_id} exhausted its {} attempts",
                    self.inner.config.max_attempts
                )));
            }
            entry.state = JobState::Waiting;
            entry.error = None;
            entry.cancel = CancellationToken::new();
            entry.updated_at = Utc::now();
        }

        match self.inner.tx.try_send(job_id.to_string()) {
            Ok(()) => Ok(job_id.to_string()),
            Err(_) => {
                let mut jobs = self.inner.jobs.write().await;
                if let Some(entry) = jobs.get_mut(job_id) {
                    entry.state = JobState::Failed;
                    entry.error = Some("queue full on retry".to_string());
                }
                Err(Error::QueueFull {
                    capacity: self.inner.config.capacity,
                })
            }
        }
    }
}

async fn process_job(inner: &Arc<Inner>, job_id: &str) {
    let (spec, cancel) = {
        let mut jobs = inner.jobs.write().await;
        let Some(entry) = jobs.get_mut(job_id) else {
            return;
        };
        // A cancelled waiting job is already failed; skip it.
        if entry.state != JobState::Waiting {
            return;
        }
        entry.state = JobState::Active;
        entry.attempts += 1;
        entry.started_at = Some(Instant::now());
        entry.updated_at = Utc::now();
        (entry.spec.clone(), entry.cancel.clone())
    };

    let (progress_tx, progress_rx) = progress_channel();
    {
        let mut jobs = inner.jobs.write().await;
        if let Some(entry) = jobs.get_mut(job_id) {
            entry.progress = Some(progress_rx);
        }
    }

    let result = inner.handler.run(&spec, progress_tx, cancel).await;

    let mut jobs = inner.jobs.write().await;
    let Some(entry) = jobs.get_mut(job_id) else {
        return;
    };
    entry.updated_at = Utc::now();
    match result {
        Ok(graph) => {
            entry.state = JobState::Completed;
            entry.result = Some(graph);
            info!(job_id, "job completed");
        }
        Err(e) => {
            entry.state = JobState::Failed;
            entry.error = Some(e.to_string());
            warn!(job_id, error = %e, "job failed");
        }
    }
}
