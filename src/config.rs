use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use config::{Config, ConfigError};
use serde::Deserialize;
use sr_engine::SupervisorOptions;

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP control surface listens on.
    pub address: SocketAddr,
}

#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    /// Engine executable. A bare name is looked up in `PATH`.
    pub program: PathBuf,

    #[serde(default)]
    pub program_args: Vec<String>,

    /// Milliseconds a stopping engine gets before it is killed.
    #[serde(with = "serde_millis")]
    pub stop_timeout: Duration,

    /// Refuse to start the service when the engine executable cannot be
    /// found. When false, a missing engine is only a warning and every start
    /// request fails until it is installed.
    pub require_program: bool,
}

#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    /// JSON file holding the stream configuration.
    pub path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub store: StoreConfig,

    /// Start the engine with the stored configuration when the service
    /// comes up, as long as a destination is configured.
    pub autostart: bool,
}

impl RelayConfig {
    pub fn read(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut c = Config::new();

        c.set_default("server.address", "0.0.0.0:5001")?;
        c.set_default("engine.program", "ffmpeg")?;
        c.set_default("engine.stop_timeout", 10_000i64)?;
        c.set_default("engine.require_program", false)?;
        c.set_default("store.path", "config/config.json")?;
        c.set_default("autostart", true)?;

        if let Some(path) = path {
            c.merge(config::File::from(path))?;
        }

        c.merge(config::Environment::with_prefix("STREAM_RELAY").separator("__"))?;

        c.try_into()
    }
}

impl EngineConfig {
    pub fn supervisor_options(&self) -> SupervisorOptions {
        SupervisorOptions {
            program: self.program.clone(),
            program_args: self.program_args.clone(),
            stop_timeout: self.stop_timeout,
        }
    }

    /// Resolves the engine executable the same way the OS will when it is
    /// spawned. Returns `None` if it cannot be found.
    pub fn locate_program(&self) -> Option<PathBuf> {
        if self.program.components().count() > 1 {
            return Some(self.program.clone()).filter(|path| path.is_file());
        }

        let search_path = std::env::var_os("PATH")?;
        std::env::split_paths(&search_path)
            .map(|dir| dir.join(&self.program))
            .find(|candidate| candidate.is_file())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn defaults_without_file() {
        let config = RelayConfig::read(None).unwrap();

        assert_eq!(config.server.address, "0.0.0.0:5001".parse().unwrap());
        assert_eq!(config.engine.program, PathBuf::from("ffmpeg"));
        assert_eq!(config.engine.stop_timeout, Duration::from_secs(10));
        assert!(config.engine.program_args.is_empty());
        assert!(!config.engine.require_program);
        assert_eq!(config.store.path, PathBuf::from("config/config.json"));
        assert!(config.autostart);
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relay.toml");
        fs::write(
            &path,
            r#"
autostart = false

[server]
address = "127.0.0.1:8080"

[engine]
program = "/usr/local/bin/ffmpeg"
program_args = ["-hide_banner"]
stop_timeout = 2500
"#,
        )
        .unwrap();

        let config = RelayConfig::read(Some(&path)).unwrap();

        assert!(!config.autostart);
        assert_eq!(config.server.address.port(), 8080);
        assert_eq!(config.engine.program, PathBuf::from("/usr/local/bin/ffmpeg"));
        assert_eq!(config.engine.program_args, vec!["-hide_banner"]);
        assert_eq!(config.engine.stop_timeout, Duration::from_millis(2500));
        assert_eq!(config.store.path, PathBuf::from("config/config.json"));
    }

    #[test]
    fn locates_programs_on_path_and_by_path() {
        let engine = |program: &str| EngineConfig {
            program: PathBuf::from(program),
            program_args: Vec::new(),
            stop_timeout: Duration::from_secs(1),
            require_program: false,
        };

        assert_eq!(engine("/bin/sh").locate_program(), Some(PathBuf::from("/bin/sh")));
        assert!(engine("sh").locate_program().is_some());
        assert!(engine("/nonexistent/ffmpeg").locate_program().is_none());
        assert!(engine("stream-relay-no-such-engine").locate_program().is_none());
    }
}
