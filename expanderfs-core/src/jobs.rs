//! Deferred job queue.
//!
//! A callback that chooses not to finish on the host's dispatch thread returns
//! `Pending` and hands a [`Job`] to the queue. Worker threads pull jobs off a
//! bounded channel, run each one on the tokio blocking pool, and report the
//! result to the host through [`JobRunner::complete`].

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::thread;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};
use crate::error::{ProviderError, Result, Status};
use crate::inflight::InflightGuard;
use crate::types::{CommandId, DataStreamId, EnumerationId};

/// The work a deferred job performs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKind {
    Read {
        relative_path: PathBuf,
        stream: DataStreamId,
        offset: u64,
        length: u32,
    },
    Write {
        source: PathBuf,
        destination: PathBuf,
        offset: u64,
        length: u32,
    },
    DirectoryEnumerate {
        id: EnumerationId,
        relative_path: PathBuf,
    },
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::Read { .. } => "read",
            JobKind::Write { .. } => "write",
            JobKind::DirectoryEnumerate { .. } => "enumerate",
        }
    }
}

/// A deferred callback waiting for a worker.
#[derive(Debug)]
pub struct Job {
    pub command_id: CommandId,
    pub kind: JobKind,
    pub cancel: CancellationToken,
    // Keeps the command cancellable until the job is dropped.
    registration: Option<InflightGuard>,
}

impl Job {
    pub fn new(command_id: CommandId, kind: JobKind) -> Self {
        Self {
            command_id,
            kind,
            cancel: CancellationToken::new(),
            registration: None,
        }
    }

    /// A job that stays in the in-flight registry until it is finished.
    pub fn registered(registration: InflightGuard, kind: JobKind) -> Self {
        Self {
            command_id: registration.command(),
            kind,
            cancel: registration.token().clone(),
            registration: Some(registration),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registration.is_some()
    }
}

/// Executes deferred jobs. Implemented by the provider.
pub trait JobRunner: Send + Sync {
    /// Runs `job` to completion on the calling thread.
    fn execute(&self, job: &Job) -> Status;

    /// Reports the final status of a deferred command to the host.
    fn complete(&self, command: CommandId, status: Status);
}

/// Cloneable handle for submitting jobs.
#[derive(Debug, Clone)]
pub struct JobSender {
    sender: mpsc::Sender<Job>,
}

impl JobSender {
    /// Queues `job` without blocking. Hands it back if the queue is full or
    /// shut down, so the caller can run it synchronously instead.
    pub fn enqueue(&self, job: Job) -> std::result::Result<(), Job> {
        match self.sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                debug!("Job queue full, {} for {} runs inline", job.kind.name(), job.command_id);
                Err(job)
            }
            Err(TrySendError::Closed(job)) => Err(job),
        }
    }
}

/// Bounded queue of deferred jobs and the workers draining it.
pub struct JobQueue {
    sender: JobSender,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl JobQueue {
    /// Spawns `workers` worker threads driven by `handle`.
    pub fn start(
        handle: Handle,
        workers: usize,
        capacity: usize,
        runner: Weak<dyn JobRunner>,
    ) -> Result<Self> {
        if workers == 0 || capacity == 0 {
            return Err(ProviderError::configuration(
                "job queue needs at least one worker and a non-zero capacity",
            ));
        }

        let (sender, receiver) = mpsc::channel(capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let shutdown = CancellationToken::new();

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let handle = handle.clone();
            let receiver = receiver.clone();
            let worker_shutdown = shutdown.clone();
            let runner = runner.clone();

            let spawned = thread::Builder::new()
                .name(format!("expanderfs-job-worker-{}", i))
                .spawn(move || handle.block_on(worker_loop(i, receiver, worker_shutdown, runner)));
            match spawned {
                Ok(worker) => handles.push(worker),
                Err(e) => {
                    shutdown.cancel();
                    join_all(handles);
                    return Err(ProviderError::configuration(format!(
                        "failed to spawn job worker: {}",
                        e
                    )));
                }
            }
        }

        debug!("Job queue started with {} workers, capacity {}", workers, capacity);
        Ok(Self {
            sender: JobSender { sender },
            receiver,
            workers: Mutex::new(handles),
            shutdown,
        })
    }

    pub fn sender(&self) -> JobSender {
        self.sender.clone()
    }

    pub fn enqueue(&self, job: Job) -> std::result::Result<(), Job> {
        self.sender.enqueue(job)
    }

    /// Stops the workers and cancels every job still queued.
    ///
    /// Jobs already running finish first. Safe to call more than once.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        if workers.is_empty() {
            return;
        }
        join_all(workers);

        let mut dropped = 0;
        if let Ok(mut receiver) = self.receiver.try_lock() {
            receiver.close();
            while let Ok(job) = receiver.try_recv() {
                job.cancel.cancel();
                dropped += 1;
            }
        }
        debug!("Job queue shut down, {} queued jobs cancelled", dropped);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn join_all(workers: Vec<thread::JoinHandle<()>>) {
    for worker in workers {
        if worker.join().is_err() {
            error!("Job worker panicked");
        }
    }
}

async fn worker_loop(
    index: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    shutdown: CancellationToken,
    runner: Weak<dyn JobRunner>,
) {
    loop {
        let job = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                job = receiver.recv() => job,
            }
        };
        let Some(job) = job else {
            debug!("Job worker {} shutting down", index);
            break;
        };
        run_job(index, &runner, job).await;
    }
}

async fn run_job(index: usize, runner: &Weak<dyn JobRunner>, job: Job) {
    if job.cancel.is_cancelled() {
        debug!("Skipping cancelled {} job for {}", job.kind.name(), job.command_id);
        return;
    }
    let Some(runner) = runner.upgrade() else {
        warn!("Provider gone, dropping {} job for {}", job.kind.name(), job.command_id);
        return;
    };

    trace!("Worker {} running {} job for {}", index, job.kind.name(), job.command_id);
    let result = tokio::task::spawn_blocking(move || {
        let status = runner.execute(&job);
        if job.cancel.is_cancelled() {
            debug!("Command {} cancelled, not completing", job.command_id);
        } else {
            runner.complete(job.command_id, status);
        }
    })
    .await;
    if let Err(e) = result {
        error!("Deferred job panicked: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedSender;

    struct RecordingRunner {
        completed: UnboundedSender<(CommandId, Status)>,
        gate: Option<Arc<std::sync::Barrier>>,
    }

    impl JobRunner for RecordingRunner {
        fn execute(&self, job: &Job) -> Status {
            if let Some(gate) = &self.gate {
                gate.wait();
            }
            match job.kind {
                JobKind::Write { .. } => Status::NotSupported,
                _ => Status::Ok,
            }
        }

        fn complete(&self, command: CommandId, status: Status) {
            let _ = self.completed.send((command, status));
        }
    }

    fn read_job(id: i32) -> Job {
        Job::new(
            CommandId(id),
            JobKind::Read {
                relative_path: PathBuf::from("a.txt"),
                stream: DataStreamId::default(),
                offset: 0,
                length: 4,
            },
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_each_job_completes_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner: Arc<dyn JobRunner> = Arc::new(RecordingRunner { completed: tx, gate: None });
        let queue = JobQueue::start(Handle::current(), 3, 64, Arc::downgrade(&runner)).unwrap();

        for id in 0..20 {
            queue.enqueue(read_job(id)).unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..20 {
            let (command, status) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(status, Status::Ok);
            seen.push(command.0);
        }
        seen.sort();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());

        tokio::task::spawn_blocking(move || queue.shutdown()).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_write_job_is_not_supported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner: Arc<dyn JobRunner> = Arc::new(RecordingRunner { completed: tx, gate: None });
        let queue = JobQueue::start(Handle::current(), 1, 4, Arc::downgrade(&runner)).unwrap();

        let job = Job::new(
            CommandId(9),
            JobKind::Write {
                source: PathBuf::from("a"),
                destination: PathBuf::from("b"),
                offset: 0,
                length: 1,
            },
        );
        queue.enqueue(job).unwrap();

        let completion = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(completion, Some((CommandId(9), Status::NotSupported)));
        tokio::task::spawn_blocking(move || queue.shutdown()).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancelled_job_is_not_completed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner: Arc<dyn JobRunner> = Arc::new(RecordingRunner { completed: tx, gate: None });
        let queue = JobQueue::start(Handle::current(), 1, 4, Arc::downgrade(&runner)).unwrap();

        let cancelled = read_job(1);
        cancelled.cancel.cancel();
        queue.enqueue(cancelled).unwrap();
        queue.enqueue(read_job(2)).unwrap();

        let completion = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(completion, Some((CommandId(2), Status::Ok)));
        tokio::task::spawn_blocking(move || queue.shutdown()).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_full_queue_hands_job_back() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let gate = Arc::new(std::sync::Barrier::new(2));
        let runner: Arc<dyn JobRunner> = Arc::new(RecordingRunner {
            completed: tx,
            gate: Some(gate.clone()),
        });
        let queue = JobQueue::start(Handle::current(), 1, 1, Arc::downgrade(&runner)).unwrap();

        // The first job parks the only worker; the second fills the channel.
        queue.enqueue(read_job(1)).unwrap();
        let mut queued = false;
        for _ in 0..100 {
            if queue.enqueue(read_job(2)).is_ok() {
                queued = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(queued);

        let rejected = queue.enqueue(read_job(3)).unwrap_err();
        assert_eq!(rejected.command_id, CommandId(3));

        // Release the parked job, then the queued one.
        let release = gate.clone();
        tokio::task::spawn_blocking(move || {
            release.wait();
            release.wait();
            queue.shutdown();
        })
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dead_runner_drops_jobs() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner: Arc<dyn JobRunner> = Arc::new(RecordingRunner { completed: tx, gate: None });
        let weak = Arc::downgrade(&runner);
        drop(runner);

        let queue = JobQueue::start(Handle::current(), 1, 4, weak).unwrap();
        queue.enqueue(read_job(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::task::spawn_blocking(move || queue.shutdown()).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_stops_every_idle_worker() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner: Arc<dyn JobRunner> = Arc::new(RecordingRunner { completed: tx, gate: None });
        let queue = JobQueue::start(Handle::current(), 4, 4, Arc::downgrade(&runner)).unwrap();
        assert!(!queue.is_shut_down());

        // Every worker watches the queue's token, so the join returns.
        let queue = tokio::time::timeout(
            Duration::from_secs(5),
            tokio::task::spawn_blocking(move || {
                queue.shutdown();
                queue
            }),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(queue.is_shut_down());
        assert!(queue.workers.lock().is_empty());

        let rejected = queue.enqueue(read_job(1)).unwrap_err();
        assert_eq!(rejected.command_id, CommandId(1));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_zero_workers_is_configuration_error() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let runner: Weak<dyn JobRunner> = Weak::<RecordingRunner>::new();
        let err = JobQueue::start(runtime.handle().clone(), 0, 4, runner).err().unwrap();
        assert!(matches!(err, ProviderError::Configuration { .. }));
    }
}
