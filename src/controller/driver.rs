//! Scheduler thread of one rendering context

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::cut::{CutUpdateEngine, CycleReport};
use crate::gpu::StagingBuffers;

#[derive(Debug, Default)]
struct DriverState {
    requested: bool,
    running: bool,
    shutdown: bool,
    cycles: u64,
    last_report: CycleReport,
}

impl DriverState {
    fn busy(&self) -> bool {
        self.requested || self.running
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<DriverState>,
    signal: Condvar,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, DriverState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Owns a context's engine on a dedicated thread and runs one cycle per kick.
pub(crate) struct Driver {
    shared: Arc<Shared>,
    staging: Arc<StagingBuffers>,
    handle: Option<JoinHandle<()>>,
}

impl Driver {
    pub fn spawn(mut engine: CutUpdateEngine) -> std::io::Result<Self> {
        let context = engine.context();
        let staging = Arc::clone(engine.staging());
        let shared = Arc::new(Shared::default());

        let handle = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("lod-cut-{}", context))
                .spawn(move || {
                    loop {
                        {
                            let mut state = shared.state();
                            while !state.requested && !state.shutdown {
                                state = shared.signal.wait(state).unwrap_or_else(|e| e.into_inner());
                            }
                            if state.shutdown {
                                break;
                            }
                            state.requested = false;
                            state.running = true;
                        }

                        let report = engine.run_cycle();

                        let mut state = shared.state();
                        state.running = false;
                        state.cycles += 1;
                        state.last_report = report;
                        shared.signal.notify_all();
                    }
                    log::debug!("Cut update thread of context {} stopped", context);
                })?
        };

        Ok(Self { shared, staging, handle: Some(handle) })
    }

    pub fn staging(&self) -> &StagingBuffers {
        &self.staging
    }

    /// Request one cycle. Ignored while a cycle is pending or running.
    pub fn kick(&self) -> bool {
        let mut state = self.shared.state();
        if state.busy() {
            return false;
        }
        state.requested = true;
        self.shared.signal.notify_all();
        true
    }

    pub fn is_busy(&self) -> bool {
        self.shared.state().busy()
    }

    /// Block until no cycle is pending or running. False on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let state = self.shared.state();
        let (state, _) = self
            .shared
            .signal
            .wait_timeout_while(state, timeout, |s| s.busy())
            .unwrap_or_else(|e| e.into_inner());
        !state.busy()
    }

    pub fn last_report(&self) -> CycleReport {
        self.shared.state().last_report
    }

    pub fn cycles(&self) -> u64 {
        self.shared.state().cycles
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state();
            state.shutdown = true;
            self.shared.signal.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
