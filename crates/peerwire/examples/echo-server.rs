//! Minimal echo server on a Unix socket (TCP elsewhere).
//!
//! Run with:
//!   cargo run --example echo-server
//!
//! In another terminal, call it with the endpoint printed on startup:
//!   cargo run --features cli -- call <ENDPOINT> echo --json '{"hello":"world"}'

use peerwire::peer::{CallContext, Server};
use peerwire::transport::{Endpoint, Listener};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let endpoint = if cfg!(unix) {
        let dir = std::env::temp_dir().join(format!("peerwire-echo-{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        Endpoint::unix(dir.join("echo.sock"))
    } else {
        Endpoint::tcp("127.0.0.1:7070")
    };

    let server = Server::new()
        .on_open(|peer| eprintln!("peer connected: {}", peer.peer_label()))
        .on_close(|peer| eprintln!("peer disconnected: {}", peer.peer_label()));
    server.register("echo", |ctx: CallContext, value: serde_json::Value| async move {
        eprintln!("request {} for {}", ctx.request_id(), ctx.service());
        Ok::<_, String>(value)
    });

    let listener = Listener::bind(&endpoint).await?;
    eprintln!("listening on {}", listener.local_endpoint()?);

    server
        .serve_with_shutdown(listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    if let Endpoint::Unix(path) = &endpoint {
        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
    Ok(())
}
