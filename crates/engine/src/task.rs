use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use sr_client::{ChannelCommandSink, ChannelCommandSource, Task};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    command::{EngineRequest, EngineResponse},
    status::StatusReporter,
    store::ConfigStore,
    supervisor::ProcessSupervisor,
};

/// Serializes control requests for the engine. Status queries do not go
/// through this task; use [`EngineTask::status`] for those.
pub struct EngineTask {
    supervisor: Arc<ProcessSupervisor>,
    store: Arc<dyn ConfigStore>,
    cmd_tx: ChannelCommandSink<EngineRequest, EngineResponse>,
    cmd_rx: ChannelCommandSource<EngineRequest, EngineResponse>,
}

pub fn create_task(
    supervisor: Arc<ProcessSupervisor>,
    store: Arc<dyn ConfigStore>,
) -> anyhow::Result<EngineTask> {
    let (cmd_tx, cmd_rx) = flume::bounded(256);

    Ok(EngineTask {
        supervisor,
        store,
        cmd_tx,
        cmd_rx,
    })
}

impl EngineTask {
    pub fn cmd(&self) -> ChannelCommandSink<EngineRequest, EngineResponse> {
        self.cmd_tx.clone()
    }

    pub fn status(&self) -> StatusReporter {
        StatusReporter::new(self.supervisor.clone(), self.store.clone())
    }
}

#[async_trait]
impl Task for EngineTask {
    fn name(&self) -> &'static str {
        "engine"
    }

    async fn run(self: Box<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let Self {
            supervisor,
            store,
            cmd_rx,
            ..
        } = *self;

        loop {
            select! {
                _ = cancel.cancelled() => {
                    break;
                }
                cmd = cmd_rx.recv_async() => {
                    let (cmd, ret_tx) = match cmd {
                        Ok(cmd) => cmd,
                        Err(_) => break,
                    };

                    debug!("engine request: {:?}", cmd);
                    let result = exec(&supervisor, store.as_ref(), cmd).await;
                    let _ = ret_tx.send(result);
                }
            }
        }

        info!("shutting down engine");
        supervisor.stop().await;

        Ok(())
    }
}

async fn exec(
    supervisor: &ProcessSupervisor,
    store: &dyn ConfigStore,
    cmd: EngineRequest,
) -> anyhow::Result<EngineResponse> {
    match cmd {
        EngineRequest::Start => {
            let config = store.load();
            let process = supervisor
                .start(&config)
                .await
                .context("failed to start engine")?;

            Ok(EngineResponse::Started { process })
        }
        EngineRequest::Stop => Ok(EngineResponse::Stopped {
            outcome: supervisor.stop().await,
        }),
        EngineRequest::Reload { patch } => {
            let config = store
                .load()
                .merged(&patch)
                .context("invalid configuration update")?;

            store.save(&config).context("failed to save configuration")?;
            info!("configuration updated, restarting engine");

            let process = supervisor
                .start(&config)
                .await
                .context("failed to restart engine")?;

            Ok(EngineResponse::Reloaded { config, process })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, time::Duration};

    use serde_json::json;
    use sr_client::CommandSink;

    use super::*;
    use crate::{
        store::MemoryConfigStore,
        supervisor::{StopOutcome, SupervisorOptions},
    };

    const POLITE: &str = "trap 'exit 0' INT; while true; do sleep 0.05; done";

    fn supervisor(program: &str) -> Arc<ProcessSupervisor> {
        Arc::new(ProcessSupervisor::new(SupervisorOptions {
            program: PathBuf::from(program),
            program_args: vec!["-c".to_owned(), POLITE.to_owned(), "engine".to_owned()],
            stop_timeout: Duration::from_secs(5),
        }))
    }

    fn spawn_task(
        supervisor: Arc<ProcessSupervisor>,
        store: Arc<MemoryConfigStore>,
    ) -> (
        ChannelCommandSink<EngineRequest, EngineResponse>,
        StatusReporter,
        CancellationToken,
        tokio::task::JoinHandle<anyhow::Result<()>>,
    ) {
        let task = create_task(supervisor, store).unwrap();
        let cmd_tx = task.cmd();
        let status = task.status();
        let cancel = CancellationToken::new();
        let join = tokio::spawn(Box::new(task).run(cancel.clone()));

        (cmd_tx, status, cancel, join)
    }

    #[tokio::test]
    async fn reload_saves_then_restarts() {
        let store = Arc::new(MemoryConfigStore::default());
        let (cmd_tx, status, cancel, join) = spawn_task(supervisor("/bin/sh"), store.clone());

        let first = match cmd_tx.command(EngineRequest::Start).await.unwrap() {
            EngineResponse::Started { process } => process,
            other => panic!("unexpected response {other:?}"),
        };

        let patch = json!({ "dji_stream_key": "drone-7" });
        let response = cmd_tx
            .command(EngineRequest::Reload {
                patch: patch.as_object().unwrap().clone(),
            })
            .await
            .unwrap();

        let second = match response {
            EngineResponse::Reloaded { config, process } => {
                assert_eq!(config.dji_stream_key, "drone-7");
                process
            }
            other => panic!("unexpected response {other:?}"),
        };

        assert_eq!(store.load().dji_stream_key, "drone-7");
        assert!(second
            .argv
            .iter()
            .any(|arg| arg == "rtmp://nginx-rtmp:1935/live/drone-7"));
        assert_eq!(second.generation, first.generation + 1);

        let report = status.report();
        assert!(report.running);
        assert_eq!(report.pid, Some(second.pid));

        cancel.cancel();
        join.await.unwrap().unwrap();
        assert!(!status.report().running);
    }

    #[tokio::test]
    async fn invalid_patch_is_rejected_and_not_saved() {
        let store = Arc::new(MemoryConfigStore::default());
        let (cmd_tx, _, cancel, join) = spawn_task(supervisor("/bin/sh"), store.clone());

        let patch = json!({ "disable_usb_audio": "maybe" });
        let result = cmd_tx
            .command(EngineRequest::Reload {
                patch: patch.as_object().unwrap().clone(),
            })
            .await;

        assert!(result.is_err());
        assert!(!store.load().disable_usb_audio);

        cancel.cancel();
        join.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_and_task_survives() {
        let store = Arc::new(MemoryConfigStore::default());
        let (cmd_tx, status, cancel, join) =
            spawn_task(supervisor("/nonexistent/engine"), store);

        assert!(cmd_tx.command(EngineRequest::Start).await.is_err());
        assert!(!status.report().running);

        match cmd_tx.command(EngineRequest::Stop).await.unwrap() {
            EngineResponse::Stopped { outcome } => {
                assert_eq!(outcome, StopOutcome::AlreadyStopped)
            }
            other => panic!("unexpected response {other:?}"),
        }

        cancel.cancel();
        join.await.unwrap().unwrap();
    }
}
