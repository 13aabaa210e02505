//! Periodic job scheduling
//!
//! Every job type runs on its own fixed interval behind a single-flight
//! guard: a tick that arrives while the previous run of the same type is
//! still going is dropped, never queued. Inside a run, work fans out per
//! wallet address and joins before the guard is released.

mod fan_out;
mod jobs;
mod single_flight;

pub use fan_out::{fan_out, TaskOutcome};
pub use jobs::{CallbackSweepJob, ExpirySweepJob, ScanJob};
pub use single_flight::JobGuards;

use crate::chain::ChainFamily;
use crate::metrics;

use async_trait::async_trait;
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Job types, each with its own guard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Trc20Scan,
    EvmScan,
    CallbackSweep,
    ExpirySweep,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::Trc20Scan,
        JobKind::EvmScan,
        JobKind::CallbackSweep,
        JobKind::ExpirySweep,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            JobKind::Trc20Scan => "trc20_scan",
            JobKind::EvmScan => "evm_scan",
            JobKind::CallbackSweep => "callback_sweep",
            JobKind::ExpirySweep => "expiry_sweep",
        }
    }

    pub fn for_family(family: ChainFamily) -> Self {
        match family {
            ChainFamily::Tron => JobKind::Trc20Scan,
            ChainFamily::Evm => JobKind::EvmScan,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Summary of one job invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobReport {
    pub tasks: usize,
    pub failed: usize,
}

#[async_trait]
pub trait Job: Send + Sync {
    fn kind(&self) -> JobKind;

    fn interval(&self) -> Duration;

    /// One invocation; returns only after all of its work has finished
    async fn run(&self) -> JobReport;
}

pub struct Scheduler {
    jobs: Vec<Arc<dyn Job>>,
    guards: Arc<JobGuards>,
    shutdown: Arc<RwLock<bool>>,
}

impl Scheduler {
    pub fn new(guards: Arc<JobGuards>) -> Self {
        Self {
            jobs: Vec::new(),
            guards,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    pub fn register(&mut self, job: Arc<dyn Job>) {
        info!("Registered job {} every {:?}", job.kind(), job.interval());
        self.jobs.push(job);
    }

    /// Start `job` unless its previous invocation is still running.
    ///
    /// The returned handle resolves when the invocation finishes; `None`
    /// means the tick was dropped.
    pub fn fire(&self, job: &Arc<dyn Job>) -> Option<JoinHandle<JobReport>> {
        let kind = job.kind();
        let Some(guard) = self.guards.get(kind).try_acquire() else {
            debug!("{} still running, dropping tick", kind);
            metrics::record_tick_dropped(kind.name());
            return None;
        };

        let job = job.clone();
        Some(tokio::spawn(async move {
            let _guard = guard;
            let started = Instant::now();
            let report = job.run().await;
            let elapsed = started.elapsed();

            metrics::record_job_duration(kind.name(), elapsed.as_secs_f64());
            if report.failed > 0 {
                warn!(
                    "{} finished in {:?}: {}/{} tasks failed",
                    kind, elapsed, report.failed, report.tasks
                );
            } else {
                debug!("{} finished in {:?} ({} tasks)", kind, elapsed, report.tasks);
            }
            report
        }))
    }

    /// Tick every registered job until [`Scheduler::stop`] is called.
    ///
    /// Returns the jobs whose tick loop ended abnormally.
    pub async fn run(self: Arc<Self>) -> Vec<JobKind> {
        info!("Scheduler started with {} jobs", self.jobs.len());

        let (kinds, loops): (Vec<_>, Vec<_>) = self
            .jobs
            .iter()
            .cloned()
            .map(|job| {
                let scheduler = self.clone();
                (job.kind(), tokio::spawn(async move { scheduler.tick_loop(job).await }))
            })
            .unzip();

        let mut dead = Vec::new();
        for (kind, result) in kinds.into_iter().zip(join_all(loops).await) {
            if let Err(e) = result {
                error!("{} tick loop terminated: {}", kind, e);
                metrics::record_task_failure(kind.name());
                dead.push(kind);
            }
        }

        info!("Scheduler stopped");
        dead
    }

    async fn tick_loop(&self, job: Arc<dyn Job>) {
        let mut ticker = interval(job.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if *self.shutdown.read().await {
                break;
            }
            // Completion is observed through the guard, not awaited here
            let _ = self.fire(&job);
        }
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
    }
}
