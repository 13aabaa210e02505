//! At-most-one-running guards for periodic jobs

use super::JobKind;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Held-or-free flag for one job type
#[derive(Debug, Default)]
pub struct SingleFlight {
    running: AtomicBool,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the guard, or `None` if an invocation is still running
    pub fn try_acquire(self: &Arc<Self>) -> Option<FlightGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard {
                flight: self.clone(),
            })
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Releases its [`SingleFlight`] when dropped, including on unwind
#[derive(Debug)]
pub struct FlightGuard {
    flight: Arc<SingleFlight>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.flight.running.store(false, Ordering::Release);
    }
}

/// One guard per job type, owned by whoever builds the scheduler
#[derive(Debug)]
pub struct JobGuards {
    guards: HashMap<JobKind, Arc<SingleFlight>>,
}

impl JobGuards {
    pub fn new() -> Self {
        Self {
            guards: JobKind::ALL
                .iter()
                .map(|kind| (*kind, Arc::new(SingleFlight::new())))
                .collect(),
        }
    }

    pub fn get(&self, kind: JobKind) -> Arc<SingleFlight> {
        self.guards
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| Arc::new(SingleFlight::new()))
    }
}

impl Default for JobGuards {
    fn default() -> Self {
        Self::new()
    }
}
