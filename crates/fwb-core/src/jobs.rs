//! Job records and the queue contract, with an in-process queue.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info};

use crate::error::BuildFailure;
use crate::executor::BuildArtifact;
use crate::request::{NormalizedRequest, RequestFingerprint};

const BROADCAST_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Started,
    Finished,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

/// Failure payload surfaced to callers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JobFailure {
    pub status: String,
    /// Last non-empty line of the captured error output.
    pub message: String,
    pub detail: String,
    pub retryable: bool,
}

impl From<&BuildFailure> for JobFailure {
    fn from(err: &BuildFailure) -> Self {
        let detail = err.to_string();
        Self {
            status: err.status().to_string(),
            message: fwb_util::last_line(&detail),
            detail,
            retryable: err.is_retryable(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Job {
    pub id: RequestFingerprint,
    pub state: JobState,
    pub request: NormalizedRequest,
    pub enqueued_at_unix_millis: i64,
    pub started_at_unix_millis: Option<i64>,
    pub ended_at_unix_millis: Option<i64>,
    pub result: Option<BuildArtifact>,
    pub error: Option<JobFailure>,
}

/// How long terminal jobs stay visible before a repeat request builds again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Retention {
    pub result_ttl: Duration,
    pub failure_ttl: Duration,
}

impl Retention {
    pub fn production() -> Self {
        Self {
            result_ttl: Duration::from_secs(24 * 60 * 60),
            failure_ttl: Duration::from_secs(12 * 60 * 60),
        }
    }

    pub fn development() -> Self {
        Self {
            result_ttl: Duration::from_secs(15 * 60),
            failure_ttl: Duration::from_secs(15 * 60),
        }
    }

    fn ttl(&self, state: JobState) -> Option<Duration> {
        match state {
            JobState::Finished => Some(self.result_ttl),
            JobState::Failed => Some(self.failure_ttl),
            JobState::Queued | JobState::Started => None,
        }
    }

    pub fn is_expired(&self, job: &Job, now_millis: i64) -> bool {
        match (self.ttl(job.state), job.ended_at_unix_millis) {
            (Some(ttl), Some(ended)) => now_millis >= ended.saturating_add(fwb_util::millis(ttl)),
            _ => false,
        }
    }
}

/// Queue/broker contract: idempotent enqueue by id, lookup, and state transitions.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Inserts a queued job unless one with `id` exists; `true` when created.
    async fn enqueue(&self, id: RequestFingerprint, request: NormalizedRequest) -> (Job, bool);

    async fn fetch(&self, id: &RequestFingerprint) -> Option<Job>;

    /// Waits for the next queued job; `None` when no more can arrive.
    async fn take_next(&self) -> Option<Job>;

    async fn mark_started(&self, id: &RequestFingerprint) -> Option<Job>;

    async fn complete(
        &self,
        id: &RequestFingerprint,
        outcome: Result<BuildArtifact, JobFailure>,
    ) -> Option<Job>;

    /// Every state transition, for callers waiting on a job.
    fn subscribe(&self) -> broadcast::Receiver<Job>;
}

/// Single-process queue with lazy TTL eviction of terminal jobs.
pub struct MemoryQueue {
    jobs: Mutex<HashMap<RequestFingerprint, Job>>,
    pending_tx: mpsc::UnboundedSender<RequestFingerprint>,
    pending_rx: Mutex<mpsc::UnboundedReceiver<RequestFingerprint>>,
    events: broadcast::Sender<Job>,
    retention: Retention,
}

impl MemoryQueue {
    pub fn new(retention: Retention) -> Self {
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            jobs: Mutex::new(HashMap::new()),
            pending_tx,
            pending_rx: Mutex::new(pending_rx),
            events,
            retention,
        }
    }

    pub async fn job_count(&self) -> usize {
        let mut jobs = self.jobs.lock().await;
        self.evict_expired(&mut jobs);
        jobs.len()
    }

    fn evict_expired(&self, jobs: &mut HashMap<RequestFingerprint, Job>) {
        let now = fwb_util::now_millis();
        jobs.retain(|id, job| {
            let expired = self.retention.is_expired(job, now);
            if expired {
                info!("Evicted {:?} job {id}", job.state);
            }
            !expired
        });
    }

    fn publish(&self, job: &Job) {
        let _ = self.events.send(job.clone());
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, id: RequestFingerprint, request: NormalizedRequest) -> (Job, bool) {
        let mut jobs = self.jobs.lock().await;
        self.evict_expired(&mut jobs);
        if let Some(existing) = jobs.get(&id) {
            debug!("Job {id} already present in state {:?}", existing.state);
            return (existing.clone(), false);
        }

        let job = Job {
            id: id.clone(),
            state: JobState::Queued,
            request,
            enqueued_at_unix_millis: fwb_util::now_millis(),
            started_at_unix_millis: None,
            ended_at_unix_millis: None,
            result: None,
            error: None,
        };
        jobs.insert(id.clone(), job.clone());
        drop(jobs);

        info!("Queued job {id}");
        let _ = self.pending_tx.send(id);
        self.publish(&job);
        (job, true)
    }

    async fn fetch(&self, id: &RequestFingerprint) -> Option<Job> {
        let mut jobs = self.jobs.lock().await;
        self.evict_expired(&mut jobs);
        jobs.get(id).cloned()
    }

    async fn take_next(&self) -> Option<Job> {
        let mut pending = self.pending_rx.lock().await;
        loop {
            let id = pending.recv().await?;
            let jobs = self.jobs.lock().await;
            match jobs.get(&id) {
                Some(job) if job.state == JobState::Queued => return Some(job.clone()),
                _ => debug!("Skipping job {id}, no longer queued"),
            }
        }
    }

    async fn mark_started(&self, id: &RequestFingerprint) -> Option<Job> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(id)?;
        job.state = JobState::Started;
        job.started_at_unix_millis = Some(fwb_util::now_millis());
        let job = job.clone();
        drop(jobs);

        info!("Started job {id}");
        self.publish(&job);
        Some(job)
    }

    async fn complete(
        &self,
        id: &RequestFingerprint,
        outcome: Result<BuildArtifact, JobFailure>,
    ) -> Option<Job> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(id)?;
        job.ended_at_unix_millis = Some(fwb_util::now_millis());
        match outcome {
            Ok(artifact) => {
                job.state = JobState::Finished;
                job.result = Some(artifact);
            }
            Err(failure) => {
                job.state = JobState::Failed;
                job.error = Some(failure);
            }
        }
        let job = job.clone();
        drop(jobs);

        info!("Job {id} {:?}", job.state);
        self.publish(&job);
        Some(job)
    }

    fn subscribe(&self) -> broadcast::Receiver<Job> {
        self.events.subscribe()
    }
}
