use std::path::Path;

use anyhow::Context;
use clap::Parser;
use colored::Colorize;
use prettytable::{cell, row, Table};
use rustyline::{error::ReadlineError, Editor};
use serde_json::{Map, Value};
use sr_client::{ChannelCommandSink, CommandSink};
use sr_engine::{EngineRequest, EngineResponse, StatusReport, StatusReporter, StreamConfig};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[clap(no_binary_name = true)]
#[clap(rename_all = "kebab-case")]
enum Commands {
    /// Start the engine with the stored configuration
    Start,
    /// Stop the engine
    Stop,
    /// Show whether the engine is running and how it was launched
    Status,
    /// Restart the engine with the stored configuration
    Reload,
    /// Change one configuration key, save it, and restart the engine
    Set { key: String, value: String },
    Exit,
}

enum Flow {
    Continue,
    Exit,
}

/// Line-oriented control surface. Runs on its own OS thread, since both the
/// line editor and the command replies block.
pub struct Console {
    cmd_tx: ChannelCommandSink<EngineRequest, EngineResponse>,
    status: StatusReporter,
    cancellation_token: CancellationToken,
}

impl Console {
    pub fn new(
        cmd_tx: ChannelCommandSink<EngineRequest, EngineResponse>,
        status: StatusReporter,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            cmd_tx,
            status,
            cancellation_token,
        }
    }

    /// Executes every non-empty line of `path` that does not start with `#`.
    pub fn run_script(&self, path: &Path) -> anyhow::Result<()> {
        let script = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read script {}", path.display()))?;

        for line in script.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            info!("script: {}", line);
            if let Flow::Exit = self.exec(line) {
                self.cancellation_token.cancel();
                break;
            }
        }

        Ok(())
    }

    pub fn run_interactive(&self) -> anyhow::Result<()> {
        let mut editor = Editor::<()>::new();

        while !self.cancellation_token.is_cancelled() {
            match editor.readline("relay> ") {
                Ok(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }

                    editor.add_history_entry(line);

                    if let Flow::Exit = self.exec(line) {
                        break;
                    }
                }
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
                Err(err) => {
                    error!("interactive error: {:#?}", err);
                    break;
                }
            }
        }

        info!("exiting");
        self.cancellation_token.cancel();

        Ok(())
    }

    fn exec(&self, line: &str) -> Flow {
        let request = match Commands::try_parse_from(line.split_ascii_whitespace()) {
            Ok(request) => request,
            Err(err) => {
                println!("{}", err);
                return Flow::Continue;
            }
        };

        let request = match request {
            Commands::Start => EngineRequest::Start,
            Commands::Stop => EngineRequest::Stop,
            Commands::Reload => EngineRequest::Reload { patch: Map::new() },
            Commands::Set { key, value } => {
                let current = self.status.report().config;
                match patch_for(&current, &key, &value) {
                    Ok(patch) => EngineRequest::Reload { patch },
                    Err(err) => {
                        error!("{:#}", err);
                        return Flow::Continue;
                    }
                }
            }
            Commands::Status => {
                print_status(&self.status.report());
                return Flow::Continue;
            }
            Commands::Exit => return Flow::Exit,
        };

        match self.cmd_tx.command_blocking(request) {
            Ok(EngineResponse::Started { process }) => {
                info!("engine started with pid {}", process.pid)
            }
            Ok(EngineResponse::Stopped { outcome }) => info!("{}", outcome),
            Ok(EngineResponse::Reloaded { process, .. }) => {
                info!("configuration saved, engine restarted with pid {}", process.pid)
            }
            Err(err) => error!("{:#}", err),
        }

        Flow::Continue
    }
}

/// Builds a one-key configuration update. Values for keys that currently
/// hold strings are taken literally; anything else is parsed as JSON first,
/// so `true` and `4` arrive as a bool and a number.
fn patch_for(current: &StreamConfig, key: &str, raw: &str) -> anyhow::Result<Map<String, Value>> {
    let current = serde_json::to_value(current).context("failed to encode configuration")?;

    let value = match current.get(key) {
        Some(Value::String(_)) => Value::String(raw.to_owned()),
        _ => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned())),
    };

    let mut patch = Map::new();
    patch.insert(key.to_owned(), value);
    Ok(patch)
}

fn print_status(report: &StatusReport) {
    let mut table = Table::new();

    let state = if report.running {
        "running".green()
    } else {
        "stopped".red()
    };
    let or_dash = |value: Option<String>| value.unwrap_or_else(|| "-".to_owned());

    table.add_row(row!["engine", state]);
    table.add_row(row!["pid", or_dash(report.pid.map(|pid| pid.to_string()))]);
    table.add_row(row![
        "generation",
        or_dash(report.generation.map(|generation| generation.to_string()))
    ]);
    table.add_row(row![
        "started",
        or_dash(report.started_at.map(|time| time.format("%F %T").to_string()))
    ]);
    table.add_row(row![
        "last exit",
        or_dash(
            report
                .last_exit
                .map(|exit| format!("{:?} (generation {})", exit.outcome, exit.generation))
        )
    ]);
    table.add_row(row!["input", report.config.input_type]);
    table.add_row(row!["output", report.config.output_rtsp_url]);
    table.add_row(row![
        "command",
        or_dash(report.argv.as_ref().map(|argv| argv.join(" ")))
    ]);

    table.printstd();
}
