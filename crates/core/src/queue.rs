//! In-process job queue with retries, exponential backoff and stall detection.
//!
//! Every claimed job runs in its own task under the configured timeout. A run that times out or
//! whose task dies is reported as stalled and goes through the same retry path as a failed run,
//! so a document can never stay in `processing` once its attempts are used up.

use crate::config::QueueConfig;
use crate::error::PipelineError;
use crate::models::JobPayload;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

pub type JobId = Uuid;

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub payload: JobPayload,
    pub priority: i32,
    /// Attempts that already ran and failed.
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn document_id(&self) -> &str {
        &self.payload.document_id
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnqueueOptions {
    /// Higher priorities are claimed first; equal priorities run in enqueue order.
    pub priority: i32,
    /// Overrides the queue's default attempt limit.
    pub attempts: Option<u32>,
}

/// Coarse progress points of a run. Reported for observability only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Milestone {
    Queued,
    ExtractionStarted,
    ExtractionDone,
    IndexingDone,
}

#[derive(Debug, Clone)]
pub enum QueueEvent {
    Progress {
        job_id: JobId,
        document_id: String,
        milestone: Milestone,
    },
    Completed {
        job_id: JobId,
        document_id: String,
        attempt: u32,
    },
    Retrying {
        job_id: JobId,
        document_id: String,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    Stalled {
        job_id: JobId,
        document_id: String,
        attempt: u32,
    },
    Exhausted {
        job_id: JobId,
        document_id: String,
        error: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
    pub delayed: usize,
}

/// What a handler sees of the job it is running.
pub struct JobContext {
    job: Job,
    attempt: u32,
    events: broadcast::Sender<QueueEvent>,
}

impl JobContext {
    /// Context for a first attempt of `payload` that is not tracked by any queue.
    #[cfg(test)]
    pub(crate) fn detached(payload: JobPayload) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            job: Job {
                id: Uuid::new_v4(),
                payload,
                priority: 0,
                attempts_made: 0,
                max_attempts: 1,
                enqueued_at: Utc::now(),
            },
            attempt: 1,
            events,
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn payload(&self) -> &JobPayload {
        &self.job.payload
    }

    /// 1-based number of the attempt being run.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn progress(&self, milestone: Milestone) {
        let _ = self.events.send(QueueEvent::Progress {
            job_id: self.job.id,
            document_id: self.job.payload.document_id.clone(),
            milestone,
        });
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    type Output: Send + 'static;

    async fn run(&self, context: JobContext) -> Result<Self::Output, PipelineError>;

    /// Called once when a job fails for the last time.
    async fn exhausted(&self, job: &Job, error: &str);
}

#[derive(Debug)]
enum AttemptFailure {
    Failed { error: String, retryable: bool },
    Stalled(String),
}

#[derive(Debug)]
struct Delayed {
    ready_at: Instant,
    job: Job,
}

#[derive(Debug, Default)]
struct QueueState {
    waiting: Vec<(u64, Job)>,
    delayed: Vec<Delayed>,
    active: HashMap<JobId, String>,
    completed: u64,
    failed: u64,
    sequence: u64,
    shutdown: bool,
}

impl QueueState {
    fn push_waiting(&mut self, job: Job) {
        self.sequence += 1;
        self.waiting.push((self.sequence, job));
    }

    fn promote_due(&mut self, now: Instant) {
        let (due, later): (Vec<Delayed>, Vec<Delayed>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|entry| entry.ready_at <= now);
        self.delayed = later;
        for entry in due {
            self.push_waiting(entry.job);
        }
    }

    /// Highest priority, then oldest, among jobs whose document has no run in flight.
    fn take_next(&mut self) -> Option<Job> {
        let busy: HashSet<&str> = self.active.values().map(String::as_str).collect();
        let position = self
            .waiting
            .iter()
            .enumerate()
            .filter(|(_, (_, job))| !busy.contains(job.document_id()))
            .max_by(|(_, (left_seq, left)), (_, (right_seq, right))| {
                left.priority
                    .cmp(&right.priority)
                    .then_with(|| right_seq.cmp(left_seq))
            })
            .map(|(position, _)| position)?;
        let (_, job) = self.waiting.remove(position);
        self.active.insert(job.id, job.document_id().to_string());
        Some(job)
    }

    fn next_delay(&self, now: Instant) -> Option<Duration> {
        self.delayed
            .iter()
            .map(|entry| entry.ready_at.saturating_duration_since(now))
            .min()
    }

    fn is_idle(&self) -> bool {
        self.waiting.is_empty() && self.delayed.is_empty() && self.active.is_empty()
    }
}

struct QueueInner {
    config: QueueConfig,
    state: Mutex<QueueState>,
    wakeup: Notify,
    idle: Notify,
    events: broadcast::Sender<QueueEvent>,
}

/// Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl JobQueue {
    pub fn new(config: QueueConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(QueueInner {
                config,
                state: Mutex::new(QueueState::default()),
                wakeup: Notify::new(),
                idle: Notify::new(),
                events,
            }),
        }
    }

    pub async fn enqueue(&self, payload: JobPayload, options: EnqueueOptions) -> JobId {
        let job = Job {
            id: Uuid::new_v4(),
            priority: options.priority,
            attempts_made: 0,
            max_attempts: options
                .attempts
                .unwrap_or(self.inner.config.max_attempts)
                .max(1),
            enqueued_at: Utc::now(),
            payload,
        };
        let job_id = job.id;
        let document_id = job.document_id().to_string();

        self.inner.state.lock().await.push_waiting(job);
        info!(%job_id, document_id = %document_id, "job queued");
        let _ = self.inner.events.send(QueueEvent::Progress {
            job_id,
            document_id,
            milestone: Milestone::Queued,
        });
        self.inner.wakeup.notify_waiters();
        job_id
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock().await;
        QueueStats {
            waiting: state.waiting.len(),
            active: state.active.len(),
            completed: state.completed,
            failed: state.failed,
            delayed: state.delayed.len(),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Resolves once nothing is waiting, delayed or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.state.lock().await.is_idle() {
                return;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(self.inner.config.poll_interval) => {}
            }
        }
    }

    /// Spawns `config.workers` workers feeding jobs to `handler`.
    pub fn start<H: JobHandler>(&self, handler: Arc<H>) -> WorkerPool {
        let workers = self.inner.config.workers.max(1);
        info!(
            workers,
            max_attempts = self.inner.config.max_attempts,
            job_timeout_secs = self.inner.config.job_timeout.as_secs(),
            "job workers starting"
        );

        let handles = (0..workers)
            .map(|worker| {
                let queue = self.clone();
                let handler = Arc::clone(&handler);
                tokio::spawn(async move { queue.worker_loop(worker, handler).await })
            })
            .collect();

        WorkerPool {
            queue: self.clone(),
            handles,
        }
    }

    #[instrument(skip(self, handler))]
    async fn worker_loop<H: JobHandler>(&self, worker: usize, handler: Arc<H>) {
        loop {
            let wakeup = self.inner.wakeup.notified();
            let claimed = {
                let mut state = self.inner.state.lock().await;
                if state.shutdown {
                    break;
                }
                let now = Instant::now();
                state.promote_due(now);
                match state.take_next() {
                    Some(job) => Ok(job),
                    None => Err(state
                        .next_delay(now)
                        .unwrap_or(self.inner.config.poll_interval)
                        .min(self.inner.config.poll_interval)),
                }
            };

            match claimed {
                Ok(job) => self.execute(handler.as_ref(), Arc::clone(&handler), job).await,
                Err(wait) => {
                    tokio::select! {
                        _ = wakeup => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
        debug!(worker, "job worker stopped");
    }

    async fn execute<H: JobHandler>(&self, handler: &H, shared: Arc<H>, mut job: Job) {
        let attempt = job.attempts_made + 1;
        let job_id = job.id;
        let document_id = job.document_id().to_string();
        let started = Instant::now();
        info!(%job_id, document_id = %document_id, attempt, max_attempts = job.max_attempts, "job started");

        let context = JobContext {
            job: job.clone(),
            attempt,
            events: self.inner.events.clone(),
        };
        let mut task = tokio::spawn(async move { shared.run(context).await });
        let timeout = self.inner.config.job_timeout;

        let outcome = match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(Ok(_))) => Ok(()),
            Ok(Ok(Err(error))) => Err(AttemptFailure::Failed {
                retryable: error.is_retryable(),
                error: error.to_string(),
            }),
            Ok(Err(join_error)) => Err(AttemptFailure::Stalled(format!(
                "worker died mid-run: {join_error}"
            ))),
            Err(_) => {
                task.abort();
                Err(AttemptFailure::Stalled(format!(
                    "run exceeded timeout of {}s",
                    timeout.as_secs()
                )))
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let mut exhausted_with = None;
        {
            let mut state = self.inner.state.lock().await;
            // An exhausted job stays active until its failure has been recorded.
            match outcome {
                Ok(()) => {
                    state.active.remove(&job_id);
                    state.completed += 1;
                    info!(%job_id, document_id = %document_id, attempt, elapsed_ms, "job completed");
                    let _ = self.inner.events.send(QueueEvent::Completed {
                        job_id,
                        document_id: document_id.clone(),
                        attempt,
                    });
                }
                Err(failure) => {
                    let (error, retryable) = match failure {
                        AttemptFailure::Failed { error, retryable } => (error, retryable),
                        AttemptFailure::Stalled(error) => {
                            warn!(%job_id, document_id = %document_id, attempt, %error, "job stalled");
                            let _ = self.inner.events.send(QueueEvent::Stalled {
                                job_id,
                                document_id: document_id.clone(),
                                attempt,
                            });
                            (error, true)
                        }
                    };

                    job.attempts_made = attempt;
                    if retryable && attempt < job.max_attempts {
                        let delay = self.inner.config.backoff_delay(attempt);
                        warn!(
                            %job_id,
                            document_id = %document_id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            %error,
                            "job failed, retrying"
                        );
                        let _ = self.inner.events.send(QueueEvent::Retrying {
                            job_id,
                            document_id: document_id.clone(),
                            attempt,
                            delay,
                            error,
                        });
                        state.active.remove(&job_id);
                        state.delayed.push(Delayed {
                            ready_at: Instant::now() + delay,
                            job,
                        });
                    } else {
                        state.failed += 1;
                        error!(%job_id, document_id = %document_id, attempt, %error, "job exhausted");
                        exhausted_with = Some((job, error));
                    }
                }
            }
        }

        if let Some((job, error)) = exhausted_with {
            handler.exhausted(&job, &error).await;
            self.inner.state.lock().await.active.remove(&job_id);
            let _ = self.inner.events.send(QueueEvent::Exhausted {
                job_id,
                document_id,
                error,
            });
        }

        self.inner.wakeup.notify_waiters();
        if self.inner.state.lock().await.is_idle() {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Running workers of a [`JobQueue`].
pub struct WorkerPool {
    queue: JobQueue,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Stops claiming new jobs and waits for in-flight runs to finish.
    pub async fn shutdown(self) {
        self.queue.inner.state.lock().await.shutdown = true;
        self.queue.inner.wakeup.notify_waiters();
        for handle in self.handles {
            if let Err(error) = handle.await {
                error!(error = %error, "job worker panicked");
            }
        }
        info!("job workers stopped");
    }
}
