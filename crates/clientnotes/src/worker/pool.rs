use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};

use crate::broadcast::job_progress::JobStatus;
use crate::broadcast::job_store::JobStore;
use crate::error::WorkerError;
use crate::pipeline::{Pipeline, StoreProgress};
use crate::worker::job::{DateRange, JobId, JobKind, JobRequest};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Cloneable submit handle. Submitting never blocks on worker availability;
/// jobs wait in FIFO order until a worker is free.
#[derive(Clone)]
pub struct JobQueue {
    sender: Sender<JobId>,
    store: Arc<JobStore>,
    shutdown: Arc<AtomicBool>,
}

impl JobQueue {
    /// A queue and the receiving end its workers pull from.
    pub(crate) fn new(store: Arc<JobStore>, shutdown: Arc<AtomicBool>) -> (Self, Receiver<JobId>) {
        let (sender, receiver) = unbounded::<JobId>();
        (
            Self {
                sender,
                store,
                shutdown,
            },
            receiver,
        )
    }

    pub fn submit(
        &self,
        kind: JobKind,
        date_range: DateRange,
        client_limit: u32,
        owner: &str,
    ) -> Result<JobId, WorkerError> {
        self.submit_request(JobRequest {
            kind,
            date_range,
            client_limit,
            owner: owner.to_string(),
        })
    }

    pub fn submit_request(&self, request: JobRequest) -> Result<JobId, WorkerError> {
        request.validate()?;
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(WorkerError::ChannelClosed);
        }

        let job = self.store.insert(&request);
        info!(
            "Queued {} job {} for {} (owner {})",
            job.kind, job.id, job.date_range, job.owner
        );
        self.enqueue(job.id)?;
        Ok(job.id)
    }

    /// Puts an already stored, still queued job back on the queue.
    pub fn requeue(&self, id: JobId) -> Result<(), WorkerError> {
        let job = self.store.get(id).ok_or(crate::broadcast::StoreError::NotFound(id))?;
        if job.status != JobStatus::Queued {
            return Err(WorkerError::InvalidRequest(format!(
                "job {} is {}, not queued",
                id,
                job.status.as_str()
            )));
        }
        self.enqueue(id)
    }

    /// Jobs submitted but not yet picked up by a worker.
    pub fn depth(&self) -> usize {
        self.sender.len()
    }

    fn enqueue(&self, id: JobId) -> Result<(), WorkerError> {
        self.sender.send(id).map_err(|_| WorkerError::ChannelClosed)
    }
}

pub struct WorkerPool {
    queue: JobQueue,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Starts `worker_count` workers, each running one job at a time.
    pub fn start(
        pipeline: Arc<Pipeline>,
        store: Arc<JobStore>,
        worker_count: usize,
    ) -> Result<Self, WorkerError> {
        if worker_count == 0 {
            return Err(WorkerError::InvalidRequest(
                "worker_count must be > 0".to_string(),
            ));
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let (queue, receiver) = JobQueue::new(Arc::clone(&store), Arc::clone(&shutdown));
        let active = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let worker = Worker {
                id: worker_id,
                receiver: receiver.clone(),
                shutdown: Arc::clone(&shutdown),
                active: Arc::clone(&active),
                pipeline: Arc::clone(&pipeline),
                store: Arc::clone(&store),
            };

            let handle = thread::Builder::new()
                .name(format!("clientnotes-worker-{}", worker_id))
                .spawn(move || worker.run())
                .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;
            workers.push(handle);
        }

        info!("Started {} workers", worker_count);

        Ok(Self {
            queue,
            workers,
            shutdown,
            active,
        })
    }

    pub fn queue(&self) -> JobQueue {
        self.queue.clone()
    }

    /// Workers currently running a job.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stops accepting submissions. Running jobs finish; jobs still queued
    /// stay `queued` and are picked up again after a restart.
    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn wait(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        drop(self.queue);

        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        info!("All workers have stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

struct Worker {
    id: usize,
    receiver: Receiver<JobId>,
    shutdown: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    pipeline: Arc<Pipeline>,
    store: Arc<JobStore>,
}

impl Worker {
    fn run(self) {
        debug!("Worker {} started", self.id);

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                debug!("Worker {} received shutdown signal", self.id);
                break;
            }

            match self.receiver.recv_timeout(POLL_INTERVAL) {
                Ok(id) => {
                    self.active.fetch_add(1, Ordering::SeqCst);
                    self.process(id);
                    self.active.fetch_sub(1, Ordering::SeqCst);
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    debug!("Worker {} job channel disconnected", self.id);
                    break;
                }
            }
        }

        debug!("Worker {} stopped", self.id);
    }

    fn process(&self, id: JobId) {
        let job = match self.store.get(id) {
            Some(job) if job.status == JobStatus::Queued => job,
            Some(job) => {
                warn!(
                    "Worker {} skipping job {}: status is {}",
                    self.id,
                    id,
                    job.status.as_str()
                );
                return;
            }
            None => {
                warn!("Worker {} skipping unknown job {}", self.id, id);
                return;
            }
        };

        debug!("Worker {} processing job {}", self.id, id);
        let progress = StoreProgress::new(Arc::clone(&self.store), id);
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.pipeline.run(&job, &progress)));

        match result {
            Ok(outcome) => {
                debug!("Worker {} finished job {}: {:?}", self.id, id, outcome);
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("Worker {} crashed on job {}: {}", self.id, id, message);
                self.force_fail(id, &format!("worker crashed: {}", message));
                return;
            }
        }

        self.force_fail(id, "pipeline ended without a final status");
    }

    /// Fails `id` unless it already reached a terminal status.
    fn force_fail(&self, id: JobId, error: &str) {
        let finished = self
            .store
            .get(id)
            .map(|job| job.is_finished())
            .unwrap_or(true);
        if finished {
            return;
        }
        if let Err(e) = self.store.fail(id, error) {
            error!("Worker {} could not fail job {}: {}", self.id, id, e);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
