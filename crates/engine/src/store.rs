use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::StreamConfig;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to write {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode configuration")]
    Encode(#[from] serde_json::Error),
}

/// Persistence for the stream configuration.
///
/// `load` never fails: missing, partial, or corrupt data all produce a fully
/// populated configuration, falling back to the defaults for whatever could
/// not be read.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> StreamConfig;

    fn save(&self, config: &StreamConfig) -> Result<(), StoreError>;
}

/// Stores the configuration as a pretty-printed JSON object.
pub struct JsonConfigStore {
    path: PathBuf,
}

impl JsonConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the directory the configuration file lives in.
    pub fn ensure_dir(&self) -> Result<(), StoreError> {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => {
                fs::create_dir_all(dir).map_err(|source| StoreError::Io {
                    path: dir.to_owned(),
                    source,
                })
            }
            _ => Ok(()),
        }
    }
}

impl ConfigStore for JsonConfigStore {
    fn load(&self) -> StreamConfig {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("{} does not exist, using defaults", self.path.display());
                return StreamConfig::default();
            }
            Err(err) => {
                warn!(
                    "could not read {}, using defaults: {}",
                    self.path.display(),
                    err
                );
                return StreamConfig::default();
            }
        };

        let stored = match serde_json::from_slice(&bytes) {
            Ok(Value::Object(stored)) => stored,
            Ok(_) => {
                warn!(
                    "{} does not hold a JSON object, using defaults",
                    self.path.display()
                );
                return StreamConfig::default();
            }
            Err(err) => {
                warn!(
                    "{} is not valid JSON, using defaults: {}",
                    self.path.display(),
                    err
                );
                return StreamConfig::default();
            }
        };

        // apply keys one at a time so a single bad value only costs that key
        let mut config = StreamConfig::default();
        for (key, value) in stored {
            let mut patch = Map::new();
            patch.insert(key.clone(), value);

            match config.merged(&patch) {
                Ok(merged) => config = merged,
                Err(err) => warn!(
                    "ignoring {} in {}, using its default: {}",
                    key,
                    self.path.display(),
                    err
                ),
            }
        }

        config
    }

    fn save(&self, config: &StreamConfig) -> Result<(), StoreError> {
        self.ensure_dir()?;

        let mut encoded = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut encoded, formatter);
        config.serialize(&mut serializer)?;

        // write next to the target and rename over it, so a crash mid-write
        // never leaves a truncated file behind
        let staging = self.path.with_extension("json.tmp");
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        fs::write(&staging, &encoded).map_err(io_err)?;
        fs::rename(&staging, &self.path).map_err(io_err)?;

        debug!("saved configuration to {}", self.path.display());
        Ok(())
    }
}

/// Keeps the configuration in memory only.
#[derive(Default)]
pub struct MemoryConfigStore {
    config: Mutex<Option<StreamConfig>>,
}

impl MemoryConfigStore {
    pub fn with_config(config: StreamConfig) -> Self {
        Self {
            config: Mutex::new(Some(config)),
        }
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> StreamConfig {
        match self.config.lock() {
            Ok(config) => config.clone().unwrap_or_default(),
            Err(poisoned) => poisoned.into_inner().clone().unwrap_or_default(),
        }
    }

    fn save(&self, config: &StreamConfig) -> Result<(), StoreError> {
        let mut slot = match self.config.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(config.clone());
        Ok(())
    }
}
