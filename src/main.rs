use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sr_client::{CommandSink, Task};
use sr_engine::{ConfigStore, EngineRequest, JsonConfigStore, ProcessSupervisor};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::metadata::LevelFilter;
use tracing_subscriber::{filter::Targets, layer::SubscriberExt, util::SubscriberInitExt, Layer};

use crate::cli::interactive::Console;

#[macro_use]
extern crate tracing;

mod cli;
mod config;
mod server;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    // setup colorful backtraces
    color_backtrace::install();

    let mut targets = Targets::new().with_default(LevelFilter::INFO);

    if let Ok(directives) = std::env::var("RUST_LOG") {
        for directive in directives.split(',') {
            if let Some((target, level)) = directive.split_once('=') {
                targets = targets.with_target(
                    target,
                    level.parse::<LevelFilter>().context("invalid log level")?,
                );
            } else {
                targets = targets.with_default(
                    directive
                        .parse::<LevelFilter>()
                        .context("invalid log level")?,
                );
            }
        }
    }

    let (writer, _guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::hourly("logs", "stream-relay"));

    let reg = tracing_subscriber::registry();

    #[cfg(tokio_unstable)]
    let reg = reg.with(console_subscriber::spawn());

    reg
        // writer that outputs to console
        .with(tracing_subscriber::fmt::layer().with_filter(targets))
        // writer that outputs to files
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(Targets::new().with_targets(vec![
                    ("stream_relay", LevelFilter::DEBUG),
                    ("sr_engine", LevelFilter::DEBUG),
                    ("engine", LevelFilter::INFO),
                ])),
        )
        .init();

    let main_args = cli::args::MainArgs::parse();

    debug!("reading config from {:?}", &main_args.config);
    let config = crate::config::RelayConfig::read(main_args.config.as_deref())
        .context("failed to read config file")?;

    run_tasks(config, main_args).await
}

async fn run_tasks(
    config: crate::config::RelayConfig,
    main_args: cli::args::MainArgs,
) -> anyhow::Result<()> {
    let cancellation_token = CancellationToken::new();

    ctrlc::set_handler({
        let cancellation_token = cancellation_token.clone();
        move || {
            info!("received interrupt, shutting down");
            cancellation_token.cancel();
        }
    })
    .context("could not set ctrl+c handler")?;

    let store = JsonConfigStore::new(&config.store.path);
    store
        .ensure_dir()
        .context("failed to create configuration directory")?;
    let store: Arc<dyn ConfigStore> = Arc::new(store);

    match config.engine.locate_program() {
        Some(path) => debug!("using engine at {}", path.display()),
        None if config.engine.require_program => {
            anyhow::bail!("engine {} not found", config.engine.program.display())
        }
        None => warn!(
            "engine {} not found, start requests will fail until it is installed",
            config.engine.program.display()
        ),
    }

    let supervisor = Arc::new(ProcessSupervisor::new(
        config.engine.supervisor_options(),
    ));

    debug!("initializing engine task");
    let engine_task = sr_engine::create_task(supervisor, store.clone())
        .context("failed to initialize engine task")?;
    let engine_cmd_tx = engine_task.cmd();
    let status = engine_task.status();

    let mut join_set = JoinSet::new();

    debug!("starting {} task", engine_task.name());
    join_set.spawn(Box::new(engine_task).run(cancellation_token.clone()));

    join_set.spawn(server::serve(
        config.server.address,
        engine_cmd_tx.clone(),
        status.clone(),
        cancellation_token.clone(),
    ));

    if config.autostart {
        if store.load().output_rtsp_url.is_empty() {
            info!("no destination configured, waiting for a start request");
        } else {
            let cmd_tx = engine_cmd_tx.clone();
            tokio::spawn(async move {
                match cmd_tx.command(EngineRequest::Start).await {
                    Ok(_) => info!("started engine with stored configuration"),
                    Err(err) => error!("could not start engine: {:#}", err),
                }
            });
        }
    }

    // the line editor blocks, so it lives on its own thread and is simply
    // abandoned when the process exits
    if main_args.script.is_some() || !main_args.headless {
        let console = Console::new(engine_cmd_tx, status, cancellation_token.clone());
        let script = main_args.script;
        let interactive = !main_args.headless;

        std::thread::Builder::new()
            .name("console".to_owned())
            .spawn(move || {
                if let Some(script) = script {
                    if let Err(err) = console.run_script(&script) {
                        error!("{:#}", err);
                    }
                }

                if interactive {
                    if let Err(err) = console.run_interactive() {
                        error!("{:#}", err);
                    }
                }
            })
            .context("failed to start console thread")?;
    }

    while let Some(res) = join_set.join_next().await {
        // if task panicked, then will be Some(Err)
        // if task terminated w/ error, then will be Some(Ok(Err))
        // need to propagate errors in both cases

        match res {
            Err(err) => {
                cancellation_token.cancel();
                return Err(err).context("task failed");
            }
            Ok(Err(err)) => {
                cancellation_token.cancel();
                return Err(err).context("task terminated with error");
            }
            _ => {
                info!("exited task");
            }
        }
    }

    Ok(())
}
