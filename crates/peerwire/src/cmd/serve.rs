use std::time::{SystemTime, UNIX_EPOCH};

use peerwire_peer::{CallContext, ConnectionConfig, RemotePeer, Server, ServerConfig};
use peerwire_transport::Listener;
use serde::Serialize;
use serde_json::Value;

use crate::cmd::{parse_duration, ServeArgs};
use crate::exit::{rpc_error, transport_error, CliResult, SUCCESS};
use crate::output::{print_listening, OutputFormat};

#[derive(Debug, Serialize)]
pub(crate) struct Pong {
    pub pong: bool,
    pub peer: Option<String>,
    pub request_id: u32,
    pub unix_time: u64,
}

pub async fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let read_timeout = parse_duration(&args.read_timeout, false)?;
    let heartbeat = parse_duration(&args.heartbeat, true)?;

    let config = ServerConfig {
        connection: ConnectionConfig {
            read_timeout,
            heartbeat_interval: (!heartbeat.is_zero()).then_some(heartbeat),
            ..ConnectionConfig::default()
        },
        ..ServerConfig::default()
    };

    let server = Server::with_config(config)
        .on_open(|peer: RemotePeer| {
            tracing::info!(conn = peer.id(), peer = %peer.peer_label(), "peer connected");
        })
        .on_close(|peer: RemotePeer| {
            tracing::info!(conn = peer.id(), peer = %peer.peer_label(), "peer disconnected");
        });
    register_builtin_services(&server);

    let listener = Listener::bind(&args.endpoint)
        .await
        .map_err(|err| transport_error("bind failed", err))?;
    let local = listener
        .local_endpoint()
        .map_err(|err| transport_error("bind failed", err))?;
    print_listening(&local, &server.services().names(), format);

    server
        .serve_with_shutdown(listener, shutdown_signal())
        .await
        .map_err(|err| rpc_error("serve failed", err))?;

    Ok(SUCCESS)
}

pub(crate) fn register_builtin_services(server: &Server) {
    server.register("echo", |ctx: CallContext, args: Value| async move {
        tracing::debug!(id = ctx.request_id(), "echo");
        Ok::<_, String>(args)
    });

    server.register("ping", |ctx: CallContext, _args: Value| async move {
        Ok::<_, String>(Pong {
            pong: true,
            peer: ctx.peer_label().map(str::to_string),
            request_id: ctx.request_id(),
            unix_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        })
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "signal handler setup failed; serving until killed");
        std::future::pending::<()>().await;
    }
}
