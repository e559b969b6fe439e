use std::{convert::Infallible, net::SocketAddr};

use anyhow::Context;
use serde::Serialize;
use serde_json::{Map, Value};
use sr_client::{ChannelCommandSink, CommandSink};
use sr_engine::{EngineRequest, EngineResponse, ProcessInfo, StatusReporter, StreamConfig};
use tokio_util::sync::CancellationToken;
use warp::{http::StatusCode, Filter, Rejection, Reply};

type EngineCommandSink = ChannelCommandSink<EngineRequest, EngineResponse>;

/// Largest configuration update accepted over HTTP.
const MAX_BODY_BYTES: u64 = 64 * 1024;

#[derive(Debug, Serialize)]
struct ControlReply {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<StreamConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    process: Option<ProcessInfo>,
}

pub async fn serve(
    address: SocketAddr,
    cmd_tx: EngineCommandSink,
    status: StatusReporter,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    info!("initializing server");

    let (address, server) = warp::serve(routes(cmd_tx, status))
        .try_bind_with_graceful_shutdown(address, async move { cancel.cancelled().await })
        .context("failed to bind control server")?;

    info!("listening at {}", address);
    server.await;

    Ok(())
}

pub fn routes(
    cmd_tx: EngineCommandSink,
    status: StatusReporter,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let status_route = warp::path!("status")
        .and(warp::get())
        .map(move || {
            debug!("hit status endpoint");
            warp::reply::json(&status.report())
        });

    let start_route = warp::path!("start")
        .and(warp::post())
        .and(with_cmd(cmd_tx.clone()))
        .and_then(start);

    let stop_route = warp::path!("stop")
        .and(warp::post())
        .and(with_cmd(cmd_tx.clone()))
        .and_then(stop);

    let reload_route = warp::path!("config")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and(with_cmd(cmd_tx))
        .and_then(reload);

    status_route.or(start_route).or(stop_route).or(reload_route)
}

fn with_cmd(
    cmd_tx: EngineCommandSink,
) -> impl Filter<Extract = (EngineCommandSink,), Error = Infallible> + Clone {
    warp::any().map(move || cmd_tx.clone())
}

async fn start(cmd_tx: EngineCommandSink) -> Result<impl Reply, Infallible> {
    debug!("hit start endpoint");
    Ok(respond(cmd_tx.command(EngineRequest::Start).await))
}

async fn stop(cmd_tx: EngineCommandSink) -> Result<impl Reply, Infallible> {
    debug!("hit stop endpoint");
    Ok(respond(cmd_tx.command(EngineRequest::Stop).await))
}

async fn reload(
    patch: Map<String, Value>,
    cmd_tx: EngineCommandSink,
) -> Result<impl Reply, Infallible> {
    debug!("hit config endpoint");
    Ok(respond(cmd_tx.command(EngineRequest::Reload { patch }).await))
}

fn respond(result: anyhow::Result<EngineResponse>) -> warp::reply::WithStatus<warp::reply::Json> {
    let (status, reply) = match result {
        Ok(EngineResponse::Started { process }) => (
            StatusCode::OK,
            ControlReply {
                success: true,
                message: format!("engine started with pid {}", process.pid),
                config: None,
                process: Some(process),
            },
        ),
        Ok(EngineResponse::Stopped { outcome }) => (
            StatusCode::OK,
            ControlReply {
                success: true,
                message: outcome.to_string(),
                config: None,
                process: None,
            },
        ),
        Ok(EngineResponse::Reloaded { config, process }) => (
            StatusCode::OK,
            ControlReply {
                success: true,
                message: "configuration saved and engine restarted".to_owned(),
                config: Some(config),
                process: Some(process),
            },
        ),
        Err(err) => {
            error!("control request failed: {:#}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ControlReply {
                    success: false,
                    message: format!("{:#}", err),
                    config: None,
                    process: None,
                },
            )
        }
    };

    warp::reply::with_status(warp::reply::json(&reply), status)
}
