use std::{io, process::ExitStatus};

use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::{
    io::AsyncRead,
    process::Child,
    sync::watch,
};
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};
use tracing::{debug, info, warn};

/// How one generation of the engine ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExitOutcome {
    CleanExit,
    ErrorExit(i32),
    /// Terminated by a signal, so there is no exit code.
    Signaled(i32),
    /// The exit status could not be collected.
    Unknown,
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        if status.success() {
            ExitOutcome::CleanExit
        } else if let Some(code) = status.code() {
            ExitOutcome::ErrorExit(code)
        } else if let Some(signal) = status.signal() {
            ExitOutcome::Signaled(signal)
        } else {
            ExitOutcome::Unknown
        }
    }
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("failed to read engine output")]
    Read(#[source] io::Error),

    #[error("failed to collect engine exit status")]
    Wait(#[source] io::Error),
}

/// Receiving end of a generation's exit record. Holds `None` until the
/// process has been reaped.
pub type ExitSlot = watch::Receiver<Option<ExitOutcome>>;

/// Engine output is split on both `\n` and `\r`, since progress lines are
/// redrawn with carriage returns.
const LINE_DELIMITERS: &[u8] = b"\n\r";

/// Longest line kept in memory. A stream that exceeds it is abandoned.
const MAX_LINE_BYTES: usize = 64 * 1024;

type OutputLines = BoxStream<'static, Result<String, MonitorError>>;

/// Takes ownership of a freshly spawned engine and watches it on a separate
/// task until it exits.
///
/// Output draining and reaping run side by side: the exit slot is filled as
/// soon as the process is reaped, even if a grandchild still holds the output
/// pipe open. The task is never cancelled; it ends on its own once the
/// process is gone and its output is exhausted.
pub fn spawn(generation: u64, pid: u32, mut child: Child) -> ExitSlot {
    let (exit_tx, exit_rx) = watch::channel(None);

    let stdout = child.stdout.take().map(output_lines);
    let stderr = child.stderr.take().map(output_lines);
    let lines = stream::select_all(stdout.into_iter().chain(stderr));

    tokio::spawn(async move {
        let drain = forward(lines, generation, pid);

        let reap = async {
            let outcome = match child.wait().await.map_err(MonitorError::Wait) {
                Ok(status) => ExitOutcome::from(status),
                Err(err) => {
                    warn!(generation, pid, "{:#}", err);
                    ExitOutcome::Unknown
                }
            };

            exit_tx.send_replace(Some(outcome));
            outcome
        };

        let ((), outcome) = tokio::join!(drain, reap);

        match outcome {
            ExitOutcome::CleanExit => info!(generation, pid, "engine exited cleanly"),
            ExitOutcome::ErrorExit(code) => {
                warn!(generation, pid, "engine exited with error code {}", code)
            }
            ExitOutcome::Signaled(signal) => {
                info!(generation, pid, "engine terminated by signal {}", signal)
            }
            ExitOutcome::Unknown => warn!(generation, pid, "engine exit status is unknown"),
        }
    });

    exit_rx
}

fn output_lines<R>(reader: R) -> OutputLines
where
    R: AsyncRead + Send + Unpin + 'static,
{
    FramedRead::new(
        reader,
        AnyDelimiterCodec::new_with_max_length(
            LINE_DELIMITERS.to_vec(),
            Vec::new(),
            MAX_LINE_BYTES,
        ),
    )
    .map(|chunk| {
        chunk
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .map_err(|err| MonitorError::Read(io::Error::new(io::ErrorKind::Other, err)))
    })
    .boxed()
}

/// A stream that fails ends on its own after yielding the error; the other
/// one keeps draining.
async fn forward(mut lines: stream::SelectAll<OutputLines>, generation: u64, pid: u32) {
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                warn!(generation, pid, "stopped reading engine output: {:#}", err);
                continue;
            }
        };
        let line = line.trim_end();

        if !line.is_empty() {
            info!(target: "engine", generation, pid, "{}", line);
        }
    }

    debug!(generation, pid, "engine output closed");
}

/// Waits until the slot holds an outcome. If the monitor went away without
/// recording one, the outcome is reported as unknown.
pub async fn wait_for_exit(exit: &mut ExitSlot) -> ExitOutcome {
    loop {
        let recorded = *exit.borrow_and_update();
        if let Some(outcome) = recorded {
            return outcome;
        }

        if exit.changed().await.is_err() {
            let recorded = *exit.borrow();
            return recorded.unwrap_or(ExitOutcome::Unknown);
        }
    }
}
