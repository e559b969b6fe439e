use serde::Serialize;
use serde_json::{Map, Value};

use crate::{
    config::StreamConfig,
    supervisor::{ProcessInfo, StopOutcome},
};

#[derive(Clone, Debug)]
pub enum EngineRequest {
    /// Start the engine with the stored configuration.
    Start,
    Stop,
    /// Merge `patch` over the stored configuration, save it, and start the
    /// engine with the result.
    Reload { patch: Map<String, Value> },
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum EngineResponse {
    Started {
        process: ProcessInfo,
    },
    Stopped {
        #[serde(skip)]
        outcome: StopOutcome,
    },
    Reloaded {
        config: StreamConfig,
        process: ProcessInfo,
    },
}
