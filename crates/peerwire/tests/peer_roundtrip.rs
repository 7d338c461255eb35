#![cfg(feature = "peer")]

use std::sync::Arc;
use std::time::Duration;

use peerwire::peer::{CallContext, Client, RemotePeer, RpcError, Server};
use peerwire::transport::{Endpoint, Listener};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

async fn serve(server: Server, endpoint: Endpoint) -> (Arc<Server>, Endpoint) {
    let listener = Listener::bind(&endpoint).await.expect("listener should bind");
    let local = listener.local_endpoint().expect("bound endpoint");
    let server = Arc::new(server);
    let serving = Arc::clone(&server);
    tokio::spawn(async move { serving.serve(listener).await });
    (server, local)
}

fn echo_server() -> Server {
    let server = Server::new();
    server.register("echo", |_ctx: CallContext, value: serde_json::Value| async move {
        Ok::<_, String>(value)
    });
    server
}

#[tokio::test]
async fn tcp_echo_and_missing_service() {
    let (_server, endpoint) = serve(echo_server(), Endpoint::tcp("127.0.0.1:0")).await;
    let client = Client::new(endpoint);

    let value = serde_json::json!({ "nested": [1, "two", null] });
    let echoed: serde_json::Value = client.call("echo", &value).await.unwrap();
    assert_eq!(echoed, value);

    let err = client.call::<_, ()>("missing", &()).await.unwrap_err();
    assert!(err.to_string().contains("service not found"), "{err}");
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn many_concurrent_calls_share_one_connection() {
    let server = Server::new();
    server.register("square", |_ctx: CallContext, n: u64| async move {
        // Later requests finish first.
        tokio::time::sleep(Duration::from_millis(50 - n)).await;
        Ok::<_, String>(n * n)
    });
    let (server, endpoint) = serve(server, Endpoint::tcp("127.0.0.1:0")).await;
    let client = Arc::new(Client::new(endpoint));

    let calls: Vec<_> = (0..50u64)
        .map(|n| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { (n, client.call::<_, u64>("square", &n).await) })
        })
        .collect();

    for call in calls {
        let (n, result) = call.await.unwrap();
        assert_eq!(result.unwrap(), n * n);
    }
    assert_eq!(server.connection_count(), 1);
    assert_eq!(client.pending_calls(), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn unix_socket_callback_roundtrip() {
    let dir = std::env::temp_dir().join(format!(
        "peerwire-it-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let server = echo_server().on_open(move |peer: RemotePeer| {
        let tx = tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(peer.call::<_, u32>("count", &3u32).await);
        });
    });
    let (_server, endpoint) = serve(server, Endpoint::unix(dir.join("peer.sock"))).await;

    let client = Client::new(endpoint);
    client.register("count", |_ctx: CallContext, n: u32| async move {
        Ok::<_, String>(n + 1)
    });
    let _: serde_json::Value = client.call("echo", "hello").await.unwrap();

    let counted = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(counted.unwrap(), 4);

    client.close();
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn server_shutdown_fails_client_calls() {
    let listener = Listener::bind(&Endpoint::tcp("127.0.0.1:0")).await.unwrap();
    let endpoint = listener.local_endpoint().unwrap();
    let server = Arc::new(echo_server());
    server.register("stall", |ctx: CallContext, _: ()| async move {
        ctx.cancellation().cancelled().await;
        Ok::<(), String>(())
    });

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let serving = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            server
                .serve_with_shutdown(listener, async {
                    let _ = stop_rx.await;
                })
                .await
        })
    };

    let client = Arc::new(Client::new(endpoint));
    let stalled = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.call::<_, ()>("stall", &()).await })
    };
    while server.connection_count() == 0 || client.pending_calls() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    stop_tx.send(()).unwrap();
    tokio::time::timeout(WAIT, serving).await.unwrap().unwrap().unwrap();

    let err = tokio::time::timeout(WAIT, stalled).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, RpcError::ClosedConnection), "{err}");
    assert_eq!(client.pending_calls(), 0);
}

#[cfg(feature = "msgpack")]
#[tokio::test]
async fn msgpack_codec_end_to_end() {
    use peerwire::peer::{ClientConfig, MsgPackCodec, ServerConfig};

    let server = Server::with_codec(ServerConfig::default(), MsgPackCodec);
    server.register("len", |_ctx: CallContext, items: Vec<String>| async move {
        Ok::<_, String>(items.len())
    });

    let listener = Listener::bind(&Endpoint::tcp("127.0.0.1:0")).await.unwrap();
    let endpoint = listener.local_endpoint().unwrap();
    let server = Arc::new(server);
    let serving = Arc::clone(&server);
    tokio::spawn(async move { serving.serve(listener).await });

    let client = Client::with_codec(endpoint, ClientConfig::default(), MsgPackCodec);
    let len: usize = client
        .call("len", &vec!["a".to_string(), "b".to_string()])
        .await
        .unwrap();
    assert_eq!(len, 2);
}
