//! The dialing peer role.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use peerwire_frame::{FrameKind, Message};
use peerwire_transport::Endpoint;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::codec::{JsonCodec, PayloadCodec};
use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::{Result, RpcError};
use crate::registry::CallRegistry;
use crate::router::PeerRouter;
use crate::service::{CallContext, ServiceRegistry};

type Slot = Arc<Mutex<Option<Connection>>>;

/// Dials one endpoint lazily and multiplexes calls over a single connection.
///
/// The client can serve calls too: services registered with
/// [`Client::register`] are reachable by the server over the same connection.
/// When the connection closes, the next call dials again.
pub struct Client<C = JsonCodec> {
    endpoint: Endpoint,
    config: ClientConfig,
    services: Arc<ServiceRegistry<C>>,
    calls: CallRegistry,
    slot: Slot,
    dial: tokio::sync::Mutex<()>,
}

impl Client<JsonCodec> {
    pub fn new(endpoint: Endpoint) -> Self {
        Self::with_config(endpoint, ClientConfig::default())
    }

    pub fn with_config(endpoint: Endpoint, config: ClientConfig) -> Self {
        Self::with_codec(endpoint, config, JsonCodec)
    }
}

impl<C: PayloadCodec> Client<C> {
    pub fn with_codec(endpoint: Endpoint, config: ClientConfig, codec: C) -> Self {
        let calls = CallRegistry::with_max_pending(config.max_pending_calls);
        Self {
            endpoint,
            services: Arc::new(ServiceRegistry::with_codec(codec)),
            calls,
            config,
            slot: Arc::new(Mutex::new(None)),
            dial: tokio::sync::Mutex::new(()),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Expose a service to the remote side. See [`ServiceRegistry::register`].
    pub fn register<Req, Resp, E, F, Fut>(&self, name: impl Into<String>, func: F) -> bool
    where
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<Resp, E>> + Send + 'static,
        Req: DeserializeOwned + 'static,
        Resp: Serialize + 'static,
        E: std::fmt::Display + 'static,
    {
        self.services.register(name, func)
    }

    /// This client's own services.
    pub fn services(&self) -> &ServiceRegistry<C> {
        &self.services
    }

    /// Call `service` on the remote side.
    pub async fn call<Req, Resp>(&self, service: &str, args: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let conn = self.connection().await?;
        call_over(
            &conn,
            &self.calls,
            self.services.codec(),
            self.config.call_timeout,
            service,
            args,
        )
        .await
    }

    /// The live connection, dialing if there is none.
    ///
    /// Concurrent first callers share one dial.
    pub async fn connection(&self) -> Result<Connection> {
        if let Some(conn) = self.cached() {
            return Ok(conn);
        }

        let _dialing = self.dial.lock().await;
        if let Some(conn) = self.cached() {
            return Ok(conn);
        }

        let stream = peerwire_transport::connect(&self.endpoint).await?;
        let label = stream.peer_label();

        let slot = Arc::downgrade(&self.slot);
        let router = PeerRouter::new(Arc::clone(&self.services), self.calls.clone())
            .with_max_concurrent_requests(self.config.connection.max_concurrent_requests)
            .with_close_hook(Box::new(move |conn: &Connection| {
                if let Some(slot) = slot.upgrade() {
                    let mut cached = lock(&slot);
                    if cached.as_ref().is_some_and(|c| c.id() == conn.id()) {
                        *cached = None;
                    }
                }
            }));

        let driver = Connection::new(
            stream,
            label,
            self.config.connection.clone(),
            Arc::new(router),
        );
        let conn = driver.connection().clone();
        *lock(&self.slot) = Some(conn.clone());
        driver.start();

        debug!(conn = conn.id(), endpoint = %self.endpoint, "client connected");
        Ok(conn)
    }

    fn cached(&self) -> Option<Connection> {
        lock(&self.slot).as_ref().filter(|conn| !conn.is_closed()).cloned()
    }

    /// True while a connection is cached and open.
    pub fn is_connected(&self) -> bool {
        self.cached().is_some()
    }

    /// Calls issued by this client still awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.calls.len()
    }

    /// Close the cached connection, failing its outstanding calls.
    /// A later call dials again.
    pub fn close(&self) {
        let conn = lock(&self.slot).take();
        if let Some(conn) = conn {
            conn.close();
        }
    }
}

impl<C> Drop for Client<C> {
    fn drop(&mut self) {
        let conn = lock(&self.slot).take();
        if let Some(conn) = conn {
            conn.close();
        }
    }
}

impl<C> std::fmt::Debug for Client<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.endpoint)
            .field("calls", &self.calls)
            .finish_non_exhaustive()
    }
}

fn lock(slot: &Mutex<Option<Connection>>) -> MutexGuard<'_, Option<Connection>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Issue one call over `conn` and decode its result.
///
/// The call's registry entry is released on every exit path, including the
/// returned future being dropped.
pub(crate) async fn call_over<C, Req, Resp>(
    conn: &Connection,
    calls: &CallRegistry,
    codec: &C,
    timeout: Option<Duration>,
    service: &str,
    args: &Req,
) -> Result<Resp>
where
    C: PayloadCodec,
    Req: Serialize + ?Sized,
    Resp: DeserializeOwned,
{
    if service.is_empty() || service.len() > u16::MAX as usize {
        return Err(RpcError::InvalidService(service.to_string()));
    }

    let payload = codec.encode(args)?;
    let exchange = async {
        let call = calls.new_call(conn)?;
        let request = Message::request(call.id(), service, payload);
        conn.send(FrameKind::Request, &request).await?;
        call.wait().await
    };

    let reply = match timeout {
        Some(limit) => tokio::time::timeout(limit, exchange)
            .await
            .map_err(|_| RpcError::Timeout(limit))??,
        None => exchange.await?,
    };

    if reply.is_error() {
        return Err(RpcError::Remote(reply.error.unwrap_or_default()));
    }
    Ok(codec.decode(&reply.payload)?)
}
