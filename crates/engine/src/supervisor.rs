use std::{
    fmt, io,
    path::PathBuf,
    process::Stdio,
    time::Duration,
};

use chrono::{DateTime, Local};
use nix::{
    errno::Errno,
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use serde::Serialize;
use thiserror::Error;
use tokio::{
    process::Command,
    sync::{watch, Mutex},
};
use tracing::{debug, error, info, warn};

use crate::{
    builder::{self, ConfigError},
    config::StreamConfig,
    monitor::{self, ExitOutcome, ExitSlot},
};

/// How long a stopping engine gets to exit on its own after being
/// interrupted before it is killed.
pub const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct SupervisorOptions {
    /// Engine executable, resolved through `PATH` if it is not a path.
    pub program: PathBuf,
    /// Arguments placed before the generated ones, for wrappers such as
    /// `nice -n 10 ffmpeg`.
    pub program_args: Vec<String>,
    pub stop_timeout: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            program_args: Vec::new(),
            stop_timeout: GRACEFUL_STOP_TIMEOUT,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to launch engine {}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Identity of one engine generation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Full command line, program first.
    pub argv: Vec<String>,
    #[serde(serialize_with = "sr_serde_util::serialize_time")]
    pub started_at: DateTime<Local>,
    pub generation: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GenerationExit {
    pub generation: u64,
    pub outcome: ExitOutcome,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// There was no engine to stop.
    AlreadyStopped,
    /// The engine had already exited on its own; no signal was sent.
    Exited(ExitOutcome),
    /// The engine exited after being interrupted.
    Graceful(ExitOutcome),
    /// The engine ignored the interrupt and was killed.
    Forced(ExitOutcome),
}

impl fmt::Display for StopOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopOutcome::AlreadyStopped => write!(f, "engine was not running"),
            StopOutcome::Exited(exit) => write!(f, "engine had already exited ({:?})", exit),
            StopOutcome::Graceful(exit) => write!(f, "engine stopped ({:?})", exit),
            StopOutcome::Forced(exit) => {
                write!(f, "engine did not stop in time and was killed ({:?})", exit)
            }
        }
    }
}

/// What the supervisor last published. Readers get a copy without touching
/// the transition lock.
#[derive(Clone, Debug)]
pub struct SupervisorSnapshot {
    pub state: ProcessState,
    pub process: Option<ProcessInfo>,
    pub exit: Option<ExitSlot>,
    /// Configuration the current or most recent generation was started with.
    pub config: Option<StreamConfig>,
    /// Outcome of the most recent generation that was stopped.
    pub last_exit: Option<GenerationExit>,
}

struct ProcessHandle {
    info: ProcessInfo,
    exit: ExitSlot,
}

#[derive(Default)]
struct Inner {
    handle: Option<ProcessHandle>,
    generation: u64,
}

/// Owns at most one running engine process.
///
/// `start` and `stop` are serialized by a single lock, so two callers can
/// never both spawn an engine, and a new engine is only ever started after
/// the previous one has been reaped.
pub struct ProcessSupervisor {
    options: SupervisorOptions,
    inner: Mutex<Inner>,
    snapshot: watch::Sender<SupervisorSnapshot>,
}

impl ProcessSupervisor {
    pub fn new(options: SupervisorOptions) -> Self {
        let (snapshot, _) = watch::channel(SupervisorSnapshot {
            state: ProcessState::Stopped,
            process: None,
            exit: None,
            config: None,
            last_exit: None,
        });

        Self {
            options,
            inner: Mutex::new(Inner::default()),
            snapshot,
        }
    }

    pub fn snapshot(&self) -> SupervisorSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Starts an engine for `config`, stopping the current one first.
    pub async fn start(&self, config: &StreamConfig) -> Result<ProcessInfo, SupervisorError> {
        let mut inner = self.inner.lock().await;

        if inner.handle.is_some() {
            debug!("stopping previous engine before starting a new one");
            self.stop_locked(&mut inner).await;
        }

        let args = builder::build(config)?;

        self.snapshot
            .send_modify(|snapshot| snapshot.state = ProcessState::Starting);

        let mut argv = vec![self.options.program.display().to_string()];
        argv.extend(self.options.program_args.iter().cloned());
        argv.extend(args);
        info!("starting engine: {}", argv.join(" "));

        let spawned = Command::new(&self.options.program)
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let (child, pid) = match spawned {
            Ok(child) => match child.id() {
                Some(pid) => (child, pid),
                None => {
                    return Err(self.spawn_failed(io::Error::new(
                        io::ErrorKind::Other,
                        "engine exited before it could be tracked",
                    )))
                }
            },
            Err(err) => return Err(self.spawn_failed(err)),
        };

        inner.generation += 1;
        let info = ProcessInfo {
            pid,
            argv,
            started_at: Local::now(),
            generation: inner.generation,
        };

        let exit = monitor::spawn(info.generation, pid, child);

        info!(generation = info.generation, pid, "engine started");

        self.snapshot.send_modify(|snapshot| {
            snapshot.state = ProcessState::Running;
            snapshot.process = Some(info.clone());
            snapshot.exit = Some(exit.clone());
            snapshot.config = Some(config.clone());
        });

        inner.handle = Some(ProcessHandle {
            info: info.clone(),
            exit,
        });

        Ok(info)
    }

    /// Stops the engine if one is running. Returns once the process has been
    /// reaped; calling it with nothing running is a no-op.
    pub async fn stop(&self) -> StopOutcome {
        let mut inner = self.inner.lock().await;
        self.stop_locked(&mut inner).await
    }

    /// Stops the engine and starts a new one. [`ProcessSupervisor::start`]
    /// already stops the previous engine under the same lock, which leaves no
    /// window for another caller between the two steps; prefer it.
    pub async fn restart(&self, config: &StreamConfig) -> Result<ProcessInfo, SupervisorError> {
        self.stop().await;
        self.start(config).await
    }

    fn spawn_failed(&self, source: io::Error) -> SupervisorError {
        error!(
            "failed to launch engine {}: {}",
            self.options.program.display(),
            source
        );

        self.snapshot
            .send_modify(|snapshot| snapshot.state = ProcessState::Stopped);

        SupervisorError::Spawn {
            program: self.options.program.clone(),
            source,
        }
    }

    async fn stop_locked(&self, inner: &mut Inner) -> StopOutcome {
        let handle = match inner.handle.as_ref() {
            Some(handle) => handle,
            None => return StopOutcome::AlreadyStopped,
        };

        let ProcessInfo {
            pid, generation, ..
        } = handle.info;
        let mut exit = handle.exit.clone();

        self.snapshot
            .send_modify(|snapshot| snapshot.state = ProcessState::Stopping);

        let already_exited = *exit.borrow();
        let stopped = match already_exited {
            Some(outcome) => {
                debug!(generation, pid, "engine already exited, clearing handle");
                StopOutcome::Exited(outcome)
            }
            None => {
                info!(generation, pid, "stopping engine");
                send_signal(pid, Signal::SIGINT);

                match tokio::time::timeout(
                    self.options.stop_timeout,
                    monitor::wait_for_exit(&mut exit),
                )
                .await
                {
                    Ok(outcome) => StopOutcome::Graceful(outcome),
                    Err(_) => {
                        warn!(
                            generation,
                            pid,
                            "engine did not stop within {:?}, killing it",
                            self.options.stop_timeout
                        );
                        send_signal(pid, Signal::SIGKILL);
                        StopOutcome::Forced(monitor::wait_for_exit(&mut exit).await)
                    }
                }
            }
        };

        let outcome = match stopped {
            StopOutcome::Exited(outcome)
            | StopOutcome::Graceful(outcome)
            | StopOutcome::Forced(outcome) => outcome,
            StopOutcome::AlreadyStopped => ExitOutcome::Unknown,
        };

        inner.handle = None;

        self.snapshot.send_modify(|snapshot| {
            snapshot.state = ProcessState::Stopped;
            snapshot.process = None;
            snapshot.exit = None;
            snapshot.last_exit = Some(GenerationExit {
                generation,
                outcome,
            });
        });

        info!(generation, pid, "engine stopped");

        stopped
    }
}

/// The process is not reaped until the monitor collects it, so its pid
/// cannot have been reused while a signal is being sent.
fn send_signal(pid: u32, signal: Signal) {
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) => debug!(pid, "sent {}", signal),
        Err(Errno::ESRCH) => debug!(pid, "engine was already gone when sending {}", signal),
        Err(err) => warn!(pid, "failed to send {}: {}", signal, err),
    }
}
