//! The accepting peer role.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use peerwire_transport::Listener;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::client::call_over;
use crate::codec::{JsonCodec, PayloadCodec};
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionId};
use crate::error::Result;
use crate::registry::CallRegistry;
use crate::router::PeerRouter;
use crate::service::{CallContext, ServiceRegistry};

type PeerHook<C> = Arc<dyn Fn(RemotePeer<C>) + Send + Sync>;
type LiveConnections = Arc<Mutex<HashMap<ConnectionId, Connection>>>;

/// Accepts connections and serves registered services on each of them.
///
/// Every accepted connection gets its own call registry and is handed to the
/// `on_open` callback as a [`RemotePeer`], through which the server can call
/// services the connecting side registered.
pub struct Server<C = JsonCodec> {
    config: ServerConfig,
    services: Arc<ServiceRegistry<C>>,
    on_open: Option<PeerHook<C>>,
    on_close: Option<PeerHook<C>>,
    live: LiveConnections,
}

impl Server<JsonCodec> {
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        Self::with_codec(config, JsonCodec)
    }
}

impl Default for Server<JsonCodec> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: PayloadCodec> Server<C> {
    pub fn with_codec(config: ServerConfig, codec: C) -> Self {
        Self {
            config,
            services: Arc::new(ServiceRegistry::with_codec(codec)),
            on_open: None,
            on_close: None,
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Serve `func` as `name`. See [`ServiceRegistry::register`].
    pub fn register<Req, Resp, E, F, Fut>(&self, name: impl Into<String>, func: F) -> bool
    where
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Resp, E>> + Send + 'static,
        Req: DeserializeOwned + 'static,
        Resp: Serialize + 'static,
        E: std::fmt::Display + 'static,
    {
        self.services.register(name, func)
    }

    pub fn services(&self) -> &ServiceRegistry<C> {
        &self.services
    }

    /// Called for every accepted connection before any of its frames is read.
    pub fn on_open(mut self, hook: impl Fn(RemotePeer<C>) + Send + Sync + 'static) -> Self {
        self.on_open = Some(Arc::new(hook));
        self
    }

    /// Called once when an accepted connection closes.
    pub fn on_close(mut self, hook: impl Fn(RemotePeer<C>) + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(hook));
        self
    }

    /// Accept connections until the listener fails.
    pub async fn serve(&self, listener: Listener) -> Result<()> {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Accept connections until `signal` resolves, then close every live
    /// connection.
    pub async fn serve_with_shutdown<F>(&self, listener: Listener, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        if let Ok(endpoint) = listener.local_endpoint() {
            info!(endpoint = %endpoint, "serving");
        }
        tokio::pin!(signal);

        let outcome = loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("shutdown requested");
                    break Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, label)) => {
                        self.handle_connection(stream, label);
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        break Err(err.into());
                    }
                },
            }
        };

        self.close_all();
        outcome
    }

    /// Run the peer protocol over an already-connected stream.
    pub fn handle_connection<S>(&self, stream: S, peer_label: impl Into<String>) -> RemotePeer<C>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let calls = CallRegistry::with_max_pending(self.config.max_pending_calls);
        let call_timeout = self.config.call_timeout;

        let close_hook = {
            let live = Arc::downgrade(&self.live);
            let services = Arc::clone(&self.services);
            let calls = calls.clone();
            let on_close = self.on_close.clone();
            move |conn: &Connection| {
                if let Some(live) = live.upgrade() {
                    lock(&live).remove(&conn.id());
                }
                debug!(conn = conn.id(), peer = %conn.peer_label(), "peer disconnected");
                if let Some(hook) = &on_close {
                    hook(RemotePeer {
                        conn: conn.clone(),
                        calls: calls.clone(),
                        services: Arc::clone(&services),
                        call_timeout,
                    });
                }
            }
        };

        let router = PeerRouter::new(Arc::clone(&self.services), calls.clone())
            .with_max_concurrent_requests(self.config.connection.max_concurrent_requests)
            .with_close_hook(Box::new(close_hook));
        let driver = Connection::new(
            stream,
            peer_label,
            self.config.connection.clone(),
            Arc::new(router),
        );
        let conn = driver.connection().clone();
        lock(&self.live).insert(conn.id(), conn.clone());

        let peer = RemotePeer {
            conn,
            calls,
            services: Arc::clone(&self.services),
            call_timeout,
        };
        debug!(conn = peer.id(), peer = %peer.peer_label(), "peer connected");

        if let Some(hook) = &self.on_open {
            let opened = peer.clone();
            if std::panic::catch_unwind(AssertUnwindSafe(|| hook(opened))).is_err() {
                warn!(conn = peer.id(), "open callback panicked");
            }
        }

        driver.start();
        peer
    }

    /// Connections accepted and not yet closed.
    pub fn connection_count(&self) -> usize {
        lock(&self.live).len()
    }

    /// Close every live connection.
    pub fn close_all(&self) {
        let live: Vec<_> = lock(&self.live).drain().map(|(_, conn)| conn).collect();
        if !live.is_empty() {
            debug!(count = live.len(), "closing live connections");
        }
        for conn in live {
            conn.close();
        }
    }
}

impl<C> std::fmt::Debug for Server<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("services", &self.services)
            .finish_non_exhaustive()
    }
}

fn lock(
    live: &Mutex<HashMap<ConnectionId, Connection>>,
) -> MutexGuard<'_, HashMap<ConnectionId, Connection>> {
    live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// An accepted connection seen from the server, able to call the connecting
/// side's services.
pub struct RemotePeer<C = JsonCodec> {
    conn: Connection,
    calls: CallRegistry,
    services: Arc<ServiceRegistry<C>>,
    call_timeout: Option<Duration>,
}

impl<C> Clone for RemotePeer<C> {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            calls: self.calls.clone(),
            services: Arc::clone(&self.services),
            call_timeout: self.call_timeout,
        }
    }
}

impl<C: PayloadCodec> RemotePeer<C> {
    /// Call `service` on the connected peer.
    pub async fn call<Req, Resp>(&self, service: &str, args: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        call_over(
            &self.conn,
            &self.calls,
            self.services.codec(),
            self.call_timeout,
            service,
            args,
        )
        .await
    }
}

impl<C> RemotePeer<C> {
    pub fn id(&self) -> ConnectionId {
        self.conn.id()
    }

    pub fn peer_label(&self) -> &str {
        self.conn.peer_label()
    }

    pub fn close(&self) {
        self.conn.close();
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    /// Server-initiated calls still awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.calls.len()
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl<C> std::fmt::Debug for RemotePeer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotePeer")
            .field("conn", &self.conn)
            .field("pending", &self.calls.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use peerwire_frame::{FrameKind, FrameReader, FrameWriter, Message};
    use peerwire_transport::Endpoint;
    use tokio::sync::mpsc;

    use super::*;
    use crate::client::Client;
    use crate::config::{ClientConfig, ConnectionConfig};
    use crate::error::RpcError;

    const WAIT: Duration = Duration::from_secs(5);

    async fn start(server: Server) -> (Arc<Server>, Endpoint) {
        let listener = Listener::bind(&Endpoint::tcp("127.0.0.1:0")).await.unwrap();
        let endpoint = listener.local_endpoint().unwrap();
        let server = Arc::new(server);
        let serving = Arc::clone(&server);
        tokio::spawn(async move { serving.serve(listener).await });
        (server, endpoint)
    }

    fn echo_server() -> Server {
        let server = Server::new();
        server.register("echo", |_ctx: CallContext, text: String| async move {
            Ok::<_, String>(text)
        });
        server
    }

    #[tokio::test]
    async fn echo_request_keeps_its_id() {
        let (_server, endpoint) = start(echo_server()).await;

        let stream = peerwire_transport::connect(&endpoint).await.unwrap();
        let (read, write) = tokio::io::split(stream);
        let mut writer = FrameWriter::new(write);
        let mut reader = FrameReader::new(read);

        writer
            .send_message(&Message::request(7, "echo", Bytes::from_static(br#""hi""#)))
            .await
            .unwrap();

        let reply = loop {
            let frame = tokio::time::timeout(WAIT, reader.read_frame()).await.unwrap().unwrap();
            if let Some(message) = frame.into_message().unwrap() {
                break message;
            }
        };
        assert_eq!(reply.id, 7);
        assert_eq!(reply.payload.as_ref(), br#""hi""#);
        assert!(!reply.is_error());
    }

    #[tokio::test]
    async fn client_echo_roundtrip() {
        let (_server, endpoint) = start(echo_server()).await;
        let client = Client::new(endpoint);

        let reply: String = client.call("echo", "hi").await.unwrap();
        assert_eq!(reply, "hi");
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn missing_service_is_a_remote_error() {
        let (_server, endpoint) = start(echo_server()).await;
        let client = Client::new(endpoint);

        let err = client.call::<_, String>("missing", "hi").await.unwrap_err();
        match err {
            RpcError::Remote(message) => assert!(message.contains("service not found")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn oversized_reply_reaches_the_caller_as_an_error() {
        let server = Server::with_config(ServerConfig {
            connection: ConnectionConfig {
                max_payload_size: 1024,
                ..ConnectionConfig::default()
            },
            ..ServerConfig::default()
        });
        server.register("big", |_ctx: CallContext, _: ()| async move {
            Ok::<_, String>("x".repeat(4096))
        });
        let (_server, endpoint) = start(server).await;
        let client = Client::new(endpoint);

        let err = tokio::time::timeout(WAIT, client.call::<_, String>("big", &()))
            .await
            .expect("the caller must get a response")
            .unwrap_err();
        match err {
            RpcError::Remote(message) => assert!(message.starts_with("response too large")),
            other => panic!("unexpected error: {other}"),
        }
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn concurrent_calls_complete_independently() {
        let server = Server::new();
        server.register("sleep", |_ctx: CallContext, millis: u64| async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok::<_, String>(millis)
        });
        let (_server, endpoint) = start(server).await;
        let client = Client::new(endpoint);

        // The slow call is issued first and answered last.
        let (slow, fast) = tokio::join!(
            client.call::<_, u64>("sleep", &300u64),
            client.call::<_, u64>("sleep", &10u64),
        );
        assert_eq!(slow.unwrap(), 300);
        assert_eq!(fast.unwrap(), 10);
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn server_calls_back_into_client() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = echo_server().on_open(move |peer: RemotePeer| {
            let tx = tx.clone();
            tokio::spawn(async move {
                let name = peer.call::<_, String>("whoami", &()).await;
                let _ = tx.send(name);
            });
        });
        let (_server, endpoint) = start(server).await;

        let client = Client::new(endpoint);
        assert!(client.register("whoami", |_ctx: CallContext, _: ()| async move {
            Ok::<_, String>("client-7".to_string())
        }));
        let _: String = client.call("echo", "open").await.unwrap();

        let name = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(name.unwrap(), "client-7");
    }

    #[tokio::test]
    async fn handler_panic_leaves_connection_usable() {
        let server = echo_server();
        server.register("explode", |_ctx: CallContext, _: ()| async move {
            if true {
                panic!("boom");
            }
            Ok::<(), String>(())
        });
        let (_server, endpoint) = start(server).await;
        let client = Client::new(endpoint);

        let before = client.connection().await.unwrap().id();
        let err = client.call::<_, ()>("explode", &()).await.unwrap_err();
        assert!(matches!(err, RpcError::Remote(ref m) if m.contains("handler panicked")));

        let reply: String = client.call("echo", "still here").await.unwrap();
        assert_eq!(reply, "still here");
        assert_eq!(client.connection().await.unwrap().id(), before);
    }

    #[tokio::test]
    async fn heartbeats_keep_idle_connection_alive() {
        let connection = ConnectionConfig {
            read_timeout: Duration::from_millis(300),
            heartbeat_interval: Some(Duration::from_millis(80)),
            ..ConnectionConfig::default()
        };
        let server = Server::with_config(ServerConfig {
            connection: connection.clone(),
            ..ServerConfig::default()
        });
        server.register("echo", |_ctx: CallContext, text: String| async move {
            Ok::<_, String>(text)
        });
        let (server, endpoint) = start(server).await;
        let client = Client::with_config(
            endpoint,
            ClientConfig {
                connection,
                ..ClientConfig::default()
            },
        );

        let first = client.connection().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(!first.is_closed());
        assert_eq!(server.connection_count(), 1);
        let reply: String = client.call("echo", "awake").await.unwrap();
        assert_eq!(reply, "awake");
        assert_eq!(client.connection().await.unwrap().id(), first.id());
    }

    #[tokio::test]
    async fn close_fails_inflight_call_and_client_redials() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = echo_server().on_open(move |peer: RemotePeer| {
            let _ = tx.send(peer);
        });
        server.register("hang", |ctx: CallContext, _: ()| async move {
            ctx.cancellation().cancelled().await;
            Ok::<(), String>(())
        });
        let (_server, endpoint) = start(server).await;
        let client = Arc::new(Client::new(endpoint));

        let first = client.connection().await.unwrap();
        let peer = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();

        let hanging = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.call::<_, ()>("hang", &()).await })
        };
        while client.pending_calls() == 0 {
            tokio::task::yield_now().await;
        }

        peer.close();
        let err = tokio::time::timeout(WAIT, hanging).await.unwrap().unwrap().unwrap_err();
        assert!(matches!(err, RpcError::ClosedConnection));
        assert_eq!(client.pending_calls(), 0);

        tokio::time::timeout(WAIT, first.closed()).await.unwrap();
        let reply: String = client.call("echo", "again").await.unwrap();
        assert_eq!(reply, "again");
        assert_ne!(client.connection().await.unwrap().id(), first.id());
    }

    #[tokio::test]
    async fn close_callback_sees_the_peer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = echo_server().on_close(move |peer: RemotePeer| {
            let _ = tx.send((peer.id(), peer.is_closed()));
        });
        let (server, endpoint) = start(server).await;

        let client = Client::new(endpoint);
        let _: String = client.call("echo", "bye").await.unwrap();
        assert_eq!(server.connection_count(), 1);
        client.close();

        let (_, closed) = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert!(closed);
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_signal_stops_accepting_and_closes_peers() {
        let listener = Listener::bind(&Endpoint::tcp("127.0.0.1:0")).await.unwrap();
        let endpoint = listener.local_endpoint().unwrap();
        let server = Arc::new(echo_server());
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

        let client = Client::new(endpoint);
        let conn = client.connection().await.unwrap();
        let _: String = client.call("echo", "up").await.unwrap();

        stop_tx.send(()).unwrap();
        tokio::time::timeout(WAIT, serving).await.unwrap().unwrap().unwrap();
        assert_eq!(server.connection_count(), 0);

        tokio::time::timeout(WAIT, conn.closed()).await.unwrap();
        assert!(client.call::<_, String>("echo", "down").await.is_err());
    }

    #[tokio::test]
    async fn duplex_streams_can_be_handed_in_directly() {
        let server = echo_server();
        let (near, far) = tokio::io::duplex(16 * 1024);
        let peer = server.handle_connection(near, "in-process");
        assert_eq!(peer.peer_label(), "in-process");
        assert_eq!(server.connection_count(), 1);

        let (read, write) = tokio::io::split(far);
        let mut writer = FrameWriter::new(write);
        let mut reader = FrameReader::new(read);
        writer
            .send_message(&Message::request(1, "echo", Bytes::from_static(br#""dx""#)))
            .await
            .unwrap();

        let frame = tokio::time::timeout(WAIT, reader.read_frame()).await.unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Response);
        let reply = frame.into_message().unwrap().unwrap();
        assert_eq!(reply.payload.as_ref(), br#""dx""#);
    }
}
