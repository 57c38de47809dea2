use std::sync::{Arc, RwLock};

use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::error::ValidationError;
use crate::executor::BuildRunner;
use crate::jobs::{Job, JobFailure, JobQueue};
use crate::request::{fingerprint, normalize, BuildRequest, RequestFingerprint};

#[derive(Clone, Debug)]
pub struct Submission {
    pub job: Job,
    /// `true` when an existing job was returned instead of creating one.
    pub reused: bool,
}

/// Accepts requests, deduplicates them by fingerprint and exposes job state.
pub struct Orchestrator {
    catalog: RwLock<Arc<Catalog>>,
    queue: Arc<dyn JobQueue>,
}

impl Orchestrator {
    pub fn new(catalog: Catalog, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            catalog: RwLock::new(Arc::new(catalog)),
            queue,
        }
    }

    pub fn catalog(&self) -> Arc<Catalog> {
        self.catalog
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Swaps in a freshly loaded catalog; in-flight validations keep their snapshot.
    pub fn replace_catalog(&self, catalog: Catalog) {
        *self.catalog.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(catalog);
        info!("Catalog replaced");
    }

    pub async fn submit(&self, raw: &BuildRequest) -> Result<Submission, ValidationError> {
        let id = fingerprint(raw);
        if let Some(job) = self.queue.fetch(&id).await {
            info!("Request {id} matches job in state {:?}", job.state);
            return Ok(Submission { job, reused: true });
        }

        let normalized = normalize(raw, &self.catalog()).map_err(|err| {
            info!("Rejected request {id}: {err}");
            err
        })?;
        let (job, created) = self.queue.enqueue(id, normalized).await;
        Ok(Submission {
            job,
            reused: !created,
        })
    }

    pub async fn status(&self, id: &RequestFingerprint) -> Option<Job> {
        self.queue.fetch(id).await
    }

    /// Waits until the job reaches a terminal state; `None` if it is unknown or evicted.
    pub async fn wait(&self, id: &RequestFingerprint) -> Option<Job> {
        let mut events = self.queue.subscribe();
        let current = self.queue.fetch(id).await?;
        if current.state.is_terminal() {
            return Some(current);
        }
        loop {
            match events.recv().await {
                Ok(job) if &job.id == id && job.state.is_terminal() => return Some(job),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Job event stream lagged by {skipped}");
                    let job = self.queue.fetch(id).await?;
                    if job.state.is_terminal() {
                        return Some(job);
                    }
                }
                Err(RecvError::Closed) => return self.queue.fetch(id).await,
            }
        }
    }
}

/// Starts `workers` loops pulling jobs from `queue` and running them with `runner`.
pub fn spawn_workers(
    queue: Arc<dyn JobQueue>,
    runner: Arc<dyn BuildRunner>,
    workers: usize,
) -> Vec<JoinHandle<()>> {
    (0..workers.max(1))
        .map(|index| {
            let queue = queue.clone();
            let runner = runner.clone();
            tokio::spawn(worker_loop(index, queue, runner))
        })
        .collect()
}

async fn worker_loop(index: usize, queue: Arc<dyn JobQueue>, runner: Arc<dyn BuildRunner>) {
    info!("Worker {index} started");
    while let Some(job) = queue.take_next().await {
        if queue.mark_started(&job.id).await.is_none() {
            continue;
        }

        // A panicking build must only fail its own job.
        let task_runner = runner.clone();
        let request = job.request.clone();
        let joined = tokio::spawn(async move { task_runner.run(&request).await }).await;
        let outcome = match joined {
            Ok(Ok(artifact)) => Ok(artifact),
            Ok(Err(err)) => {
                warn!("Job {} failed: {err}", job.id);
                Err(JobFailure::from(&err))
            }
            Err(join_err) => {
                warn!("Job {} crashed: {join_err}", job.id);
                Err(JobFailure {
                    status: "worker_crashed".into(),
                    message: "build worker crashed".into(),
                    detail: join_err.to_string(),
                    retryable: true,
                })
            }
        };
        queue.complete(&job.id, outcome).await;
    }
    info!("Worker {index} stopped");
}
