//! Both directions over one TCP connection.
//!
//! The client registers `greet`; as soon as it connects, the server calls
//! that service back through the connection the client opened.
//!
//! Run with:
//!   cargo run --example callback

use std::sync::Arc;

use peerwire::peer::{CallContext, Client, RemotePeer, Server};
use peerwire::transport::{Endpoint, Listener};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (greeted_tx, mut greeted_rx) = mpsc::unbounded_channel();

    let server = Server::new().on_open(move |peer: RemotePeer| {
        let greeted = greeted_tx.clone();
        tokio::spawn(async move {
            let reply = peer.call::<_, String>("greet", "server").await;
            let _ = greeted.send(reply);
        });
    });
    server.register("add", |_ctx: CallContext, (a, b): (i64, i64)| async move {
        Ok::<_, String>(a + b)
    });

    let listener = Listener::bind(&Endpoint::tcp("127.0.0.1:0")).await?;
    let endpoint = listener.local_endpoint()?;
    let server = Arc::new(server);
    let serving = Arc::clone(&server);
    tokio::spawn(async move { serving.serve(listener).await });

    let client = Client::new(endpoint);
    client.register("greet", |ctx: CallContext, name: String| async move {
        Ok::<_, String>(format!("hello {name}, this is request {}", ctx.request_id()))
    });

    let sum: i64 = client.call("add", &(40, 2)).await?;
    println!("client -> server: add(40, 2) = {sum}");

    if let Some(reply) = greeted_rx.recv().await {
        println!("server -> client: {}", reply?);
    }

    client.close();
    server.close_all();
    Ok(())
}
