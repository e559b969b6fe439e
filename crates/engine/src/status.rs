use std::sync::Arc;

use chrono::{DateTime, Local};
use nix::{errno::Errno, sys::signal::kill, unistd::Pid};
use serde::Serialize;

use crate::{
    config::StreamConfig,
    monitor::ExitSlot,
    store::ConfigStore,
    supervisor::{GenerationExit, ProcessState, ProcessSupervisor},
};

#[derive(Clone, Debug, Serialize)]
pub struct StatusReport {
    pub running: bool,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub argv: Option<Vec<String>>,
    #[serde(serialize_with = "sr_serde_util::serialize_optional_time")]
    pub started_at: Option<DateTime<Local>>,
    pub generation: Option<u64>,
    pub last_exit: Option<GenerationExit>,
    pub config: StreamConfig,
}

/// Assembles status snapshots without waiting on the supervisor.
#[derive(Clone)]
pub struct StatusReporter {
    supervisor: Arc<ProcessSupervisor>,
    store: Arc<dyn ConfigStore>,
}

impl StatusReporter {
    pub fn new(supervisor: Arc<ProcessSupervisor>, store: Arc<dyn ConfigStore>) -> Self {
        Self { supervisor, store }
    }

    /// Liveness is checked against the OS on every call; the engine may have
    /// crashed since the supervisor last changed state.
    pub fn report(&self) -> StatusReport {
        let snapshot = self.supervisor.snapshot();

        let current = match (&snapshot.process, &snapshot.exit) {
            (Some(process), Some(exit)) => Some((process, exit)),
            _ => None,
        };

        let running = current
            .map(|(process, exit)| is_alive(process.pid, exit))
            .unwrap_or(false);

        // an engine that died on its own keeps its handle until the next
        // stop or start, but its outcome is already known
        let last_exit = match current {
            Some((process, exit)) if !running => {
                let recorded = *exit.borrow();
                recorded
                    .map(|outcome| GenerationExit {
                        generation: process.generation,
                        outcome,
                    })
                    .or(snapshot.last_exit)
            }
            _ => snapshot.last_exit,
        };

        // the supervisor only learns of a crash at the next stop or start
        let state = match current {
            Some(_) if !running => ProcessState::Stopped,
            _ => snapshot.state,
        };

        let process = snapshot.process.as_ref().filter(|_| running);

        StatusReport {
            running,
            state,
            pid: process.map(|p| p.pid),
            argv: process.map(|p| p.argv.clone()),
            started_at: process.map(|p| p.started_at),
            generation: process.map(|p| p.generation),
            last_exit,
            config: snapshot.config.unwrap_or_else(|| self.store.load()),
        }
    }
}

fn is_alive(pid: u32, exit: &ExitSlot) -> bool {
    if exit.borrow().is_some() {
        return false;
    }

    !matches!(kill(Pid::from_raw(pid as i32), None), Err(Errno::ESRCH))
}
