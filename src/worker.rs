//! Worker execution units and their manager.
//!
//! A worker is an isolated execution unit: one OS thread named
//! `worker-<n>` running a single-threaded cooperative scheduler that
//! multiplexes the worker's job loops plus a stop orchestrator. The only
//! channel back to the manager is a bounded MPMC queue carrying stop
//! commands downward and result snapshots upward; the worker body itself
//! is moved into the thread and shared with nothing.
//!
//! Two stop triggers race inside each worker — a timeout tick and the
//! queue notice — and both funnel into the same stop-and-report sequence.
//! The lifecycle state machine makes that sequence fire exactly once: the
//! loser's `WrongStatus` is swallowed, so every started worker emits
//! exactly one result message.

use std::cell::RefCell;
use std::rc::Rc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tokio::task::LocalSet;
use tracing::{debug, error, info, warn};

use crate::analyse::{Analysable, AnalyseResult, CoreStatus, Lifecycle, Visit};
use crate::balancer::{Balancer, Dispatchable};
use crate::clock::{epoch_ms, uid};
use crate::errors::EngineError;
use crate::job::{self, Job, JobContainer, JobManager};
use crate::settings::Settings;

/// Grace period for in-flight requests and straggler reports after stop
/// is signalled.
const STOP_GATHER_SLACK: Duration = Duration::from_secs(15);

/// Message on the worker queue. A consumer that peeks a foreign kind
/// must re-enqueue it untouched.
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    Stop,
    Result(AnalyseResult),
}

// ── Worker ────────────────────────────────────────────────────────────────────

/// One isolated execution unit running its jobs concurrently.
pub struct Worker {
    lifecycle: Lifecycle,
    jobs: JobManager,
    tx: Sender<WorkerMessage>,
    rx: Receiver<WorkerMessage>,
    weight: u32,
}

impl Worker {
    fn new(tx: Sender<WorkerMessage>, rx: Receiver<WorkerMessage>) -> Self {
        Worker {
            lifecycle: Lifecycle::new("Worker"),
            jobs: JobManager::new("JobManager"),
            tx,
            rx,
            weight: 1,
        }
    }

    /// Assigns a job. Only legal before the worker starts.
    pub fn dispatch(&mut self, job: Job) -> Result<(), EngineError> {
        if self.status() != CoreStatus::Init {
            return Err(EngineError::WrongStatus(format!(
                "{} accepts jobs only before start",
                self.id()
            )));
        }
        self.jobs.add(job);
        Ok(())
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub(crate) fn job(&self, index: usize) -> &Job {
        &self.jobs.items()[index]
    }

    pub(crate) fn job_mut(&mut self, index: usize) -> &mut Job {
        &mut self.jobs.items_mut()[index]
    }

    /// Moves the worker onto its own thread and begins executing jobs.
    ///
    /// A worker with no dispatched jobs does not spawn a thread and stays
    /// in `Init`.
    pub fn spawn(
        mut self,
        ordinal: usize,
        timeout: i64,
        check_interval: u64,
    ) -> Result<Option<JoinHandle<()>>, EngineError> {
        if self.jobs.is_empty() {
            debug!(worker = %self.id(), "no jobs dispatched, not spawning");
            return Ok(None);
        }
        Analysable::start(&mut self)?;
        let name = format!("worker-{}", ordinal);
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            if let Err(e) = start_work(self, timeout, check_interval) {
                error!(worker = %name, error = %e, "worker terminated abnormally");
            }
        })?;
        Ok(Some(handle))
    }
}

impl Analysable for Worker {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn lifecycle_mut(&mut self) -> &mut Lifecycle {
        &mut self.lifecycle
    }

    fn visit_children(&mut self, visit: Visit) -> Result<(), EngineError> {
        for job in self.jobs.iter_mut() {
            visit(job)?;
        }
        Ok(())
    }
}

impl Dispatchable for Worker {
    fn weight(&self) -> u32 {
        self.weight
    }
}

// ── Worker thread body ────────────────────────────────────────────────────────

/// Entry point of a worker thread: runs every job loop plus the stop
/// orchestrator to completion on a single-threaded scheduler.
pub fn start_work(worker: Worker, timeout: i64, check_interval: u64) -> Result<(), EngineError> {
    let on_worker_thread = thread::current()
        .name()
        .map(|name| name.starts_with("worker-"))
        .unwrap_or(false);
    if !on_worker_thread {
        return Err(EngineError::WorkerExecute(
            "start_work can only run on a worker thread".to_string(),
        ));
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = LocalSet::new();
    let worker = Rc::new(RefCell::new(worker));

    local.block_on(&runtime, async {
        let job_count = worker.borrow().job_count();
        let mut tasks = Vec::with_capacity(job_count + 1);
        for index in 0..job_count {
            tasks.push(tokio::task::spawn_local(job::drive(worker.clone(), index)));
        }
        tasks.push(tokio::task::spawn_local(stop_work(
            worker.clone(),
            timeout,
            check_interval,
        )));
        for task in tasks {
            let _ = task.await;
        }
    });
    Ok(())
}

/// Runs both stop triggers concurrently.
async fn stop_work(worker: Rc<RefCell<Worker>>, timeout: i64, check_interval: u64) {
    futures::join!(
        work_timeout(worker.clone(), timeout),
        work_notice(worker.clone(), check_interval),
    );
}

/// Stop trigger: fires once `timeout` seconds elapse, or as soon as the
/// status leaves `Started`. `timeout <= 0` waits indefinitely.
async fn work_timeout(worker: Rc<RefCell<Worker>>, timeout: i64) {
    let mut remaining = if timeout <= 0 { i64::MAX } else { timeout };
    while remaining > 0 && worker.borrow().status() == CoreStatus::Started {
        tokio::time::sleep(Duration::from_secs(1)).await;
        remaining -= 1;
    }
    try_stop_and_analyse(&worker);
}

/// Stop trigger: polls the shared queue for a stop command. Result
/// messages travelling upward are re-enqueued untouched.
async fn work_notice(worker: Rc<RefCell<Worker>>, check_interval: u64) {
    let interval = Duration::from_secs(check_interval.max(1));
    loop {
        let (status, message) = {
            let cell = worker.borrow();
            (cell.status(), cell.rx.try_recv())
        };
        if status != CoreStatus::Started {
            break;
        }
        match message {
            Ok(WorkerMessage::Stop) => break,
            Ok(foreign) => {
                let _ = worker.borrow().tx.send(foreign);
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => break,
        }
        tokio::time::sleep(interval).await;
    }
    try_stop_and_analyse(&worker);
}

/// Stops, analyses and reports exactly once. The competing trigger's
/// `WrongStatus` is swallowed; the queue sees one result per worker.
fn try_stop_and_analyse(worker: &Rc<RefCell<Worker>>) {
    let mut cell = worker.borrow_mut();
    let stopped = cell.stop();
    let outcome = match stopped {
        Ok(()) => cell.analyse(),
        Err(e) => Err(e),
    };
    match outcome {
        Ok(()) => match cell.snapshot() {
            Ok(result) => {
                info!(
                    worker = %cell.id(),
                    total = result.total_request,
                    success = result.success_request,
                    latency_ms = result.latency,
                    "worker analysed"
                );
                if let Err(e) = cell.tx.send(WorkerMessage::Result(result)) {
                    error!(worker = %cell.id(), error = %e, "failed to report result");
                }
            }
            Err(e) => error!(worker = %cell.id(), error = %e, "snapshot failed"),
        },
        Err(EngineError::WrongStatus(_)) => {
            // the other trigger already ran the stop-and-report sequence
        }
        Err(e) => error!(worker = %cell.id(), error = %e, "stop failed"),
    }
}

// ── WorkerManager ─────────────────────────────────────────────────────────────

/// Creates the workers, routes job descriptors to them and gathers their
/// results into one merged snapshot.
pub struct WorkerManager {
    id: String,
    balancer: Balancer,
    workers: Vec<Worker>,
    handles: Vec<JoinHandle<()>>,
    tx: Sender<WorkerMessage>,
    rx: Receiver<WorkerMessage>,
    worker_num: usize,
    timeout: i64,
    check_interval: u64,
    result: Option<AnalyseResult>,
}

impl WorkerManager {
    /// `worker_num` defaults to the CPU count and is clamped to
    /// `[1, 2 * cpu_count]`.
    pub fn new(worker_num: Option<usize>, settings: &Settings) -> Self {
        let cpus = num_cpus::get().max(1);
        let worker_num = worker_num.unwrap_or(cpus).clamp(1, cpus * 2);
        let (tx, rx) = bounded(worker_num * 2);
        let workers = (0..worker_num)
            .map(|_| Worker::new(tx.clone(), rx.clone()))
            .collect();
        WorkerManager {
            id: uid("WorkerManager"),
            balancer: Balancer::round_robin(),
            workers,
            handles: Vec::new(),
            tx,
            rx,
            worker_num,
            timeout: settings.worker_timeout,
            check_interval: settings.worker_check_interval,
            result: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn worker_num(&self) -> usize {
        self.worker_num
    }

    /// Workers actually running (spawned with at least one job).
    pub fn active_workers(&self) -> usize {
        self.handles.len()
    }

    /// The merged result once `stop` has gathered the reports.
    pub fn result(&self) -> Option<&AnalyseResult> {
        self.result.as_ref()
    }

    /// Routes a descriptor: fan-out builds one job per worker, otherwise
    /// the balancer picks a single worker.
    pub fn dispatch(&mut self, container: &JobContainer) -> Result<(), EngineError> {
        if container.reuse_job() {
            let index = self.balancer.choose(&self.workers);
            self.workers[index].dispatch(container.job())
        } else {
            for worker in &mut self.workers {
                worker.dispatch(container.job())?;
            }
            Ok(())
        }
    }

    /// Drops workers that received no jobs and spawns the rest, each on
    /// its own thread.
    pub fn start(&mut self) -> Result<(), EngineError> {
        let workers = std::mem::take(&mut self.workers);
        for (ordinal, worker) in workers.into_iter().enumerate() {
            if let Some(handle) = worker.spawn(ordinal, self.timeout, self.check_interval)? {
                self.handles.push(handle);
            }
        }
        info!(manager = %self.id, active = self.handles.len(), "workers started");
        Ok(())
    }

    /// Signals stop to every active worker and gathers one result from
    /// each, bounded by the worker timeout plus slack. The merge covers
    /// whatever subset actually reported when the deadline expires.
    pub fn stop(&mut self) -> Result<AnalyseResult, EngineError> {
        let active = self.handles.len();
        if active == 0 {
            // an empty job slice still reports: zero requests, zero span
            let now = epoch_ms();
            let merged = AnalyseResult {
                id: self.id.clone(),
                total_request: 0,
                success_request: 0,
                latency: 0,
                qps: 0,
                start_time: now,
                stop_time: now,
            };
            self.result = Some(merged.clone());
            return Ok(merged);
        }
        for _ in 0..active {
            let _ = self.tx.send(WorkerMessage::Stop);
        }

        let deadline = stop_deadline(self.timeout);
        let begun = Instant::now();
        let mut results: Vec<AnalyseResult> = Vec::with_capacity(active);
        while results.len() < active {
            if begun.elapsed() >= deadline {
                warn!(
                    manager = %self.id,
                    received = results.len(),
                    expected = active,
                    "stop deadline expired with missing worker results"
                );
                break;
            }
            match self.rx.recv_timeout(Duration::from_millis(200)) {
                Ok(WorkerMessage::Result(result)) => results.push(result),
                Ok(foreign) => {
                    // leftover stop command from a worker that timed out
                    // on its own; keep it queued without spinning
                    let _ = self.tx.send(foreign);
                    thread::sleep(Duration::from_millis(50));
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        if results.is_empty() {
            return Err(EngineError::ResultTimeout(deadline));
        }

        let merged = AnalyseResult::from_results(&self.id, &results);
        info!(
            manager = %self.id,
            workers = results.len(),
            total = merged.total_request,
            success = merged.success_request,
            "workers merged"
        );
        self.result = Some(merged.clone());
        // Threads parked in an in-flight network call are left to finish
        // on their own; their reports are already in hand or forfeited.
        self.handles.clear();
        Ok(merged)
    }
}

impl Dispatchable for WorkerManager {
    fn weight(&self) -> u32 {
        self.worker_num as u32
    }
}

fn stop_deadline(timeout: i64) -> Duration {
    let base = if timeout > 0 {
        Duration::from_secs(timeout as u64)
    } else {
        Duration::ZERO
    };
    base + STOP_GATHER_SLACK
}

// ── Tests ─────────────────────────────────────────────────────────────────────
