//! Service registration and request dispatch.
//!
//! Handlers are plain async functions `Fn(CallContext, Req) -> Result<Resp, E>`.
//! At registration they are wrapped in an adapter that decodes the request
//! payload with the registry's [`PayloadCodec`] and encodes the result, so the
//! dispatcher itself only moves bytes.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;
use peerwire_frame::Message;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::{CodecError, JsonCodec, PayloadCodec};
use crate::connection::Connection;

/// Longest service name the envelope can carry.
const MAX_SERVICE_NAME_LEN: usize = u16::MAX as usize;

/// Why a request produced an error response.
///
/// The display string is what travels back to the caller.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("bad payload: {0}")]
    BadPayload(#[source] CodecError),

    #[error("{0}")]
    Handler(String),

    #[error("encode response: {0}")]
    Encode(#[source] CodecError),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// Per-request information handed to a handler.
#[derive(Debug, Clone)]
pub struct CallContext {
    request_id: u32,
    service: String,
    peer_label: Option<String>,
    cancel: CancellationToken,
}

impl CallContext {
    /// Context for a request that did not arrive over a connection.
    pub fn detached(request_id: u32, service: impl Into<String>) -> Self {
        Self {
            request_id,
            service: service.into(),
            peer_label: None,
            cancel: CancellationToken::new(),
        }
    }

    fn from_connection(message: &Message, conn: &Connection) -> Self {
        Self {
            request_id: message.id,
            service: message.service.clone(),
            peer_label: Some(conn.peer_label().to_string()),
            cancel: conn.close_token(),
        }
    }

    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Label of the connection the request arrived on, if any.
    pub fn peer_label(&self) -> Option<&str> {
        self.peer_label.as_deref()
    }

    /// Cancelled when the originating connection closes.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A registered service, type-erased down to bytes in and bytes out.
pub trait ServiceHandler: Send + Sync + 'static {
    fn invoke(
        &self,
        ctx: CallContext,
        payload: Bytes,
    ) -> BoxFuture<'static, Result<Bytes, DispatchError>>;
}

struct TypedHandler<C, F, Req, Resp, E, Fut> {
    func: F,
    codec: Arc<C>,
    _types: PhantomData<fn(Req) -> (Resp, E, Fut)>,
}

impl<C, F, Req, Resp, E, Fut> ServiceHandler for TypedHandler<C, F, Req, Resp, E, Fut>
where
    C: PayloadCodec,
    F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, E>> + Send + 'static,
    Req: DeserializeOwned + 'static,
    Resp: Serialize + 'static,
    E: Display + 'static,
{
    fn invoke(
        &self,
        ctx: CallContext,
        payload: Bytes,
    ) -> BoxFuture<'static, Result<Bytes, DispatchError>> {
        let request: Req = match self.codec.decode(&payload) {
            Ok(request) => request,
            Err(err) => return future::ready(Err(DispatchError::BadPayload(err))).boxed(),
        };

        let call = (self.func)(ctx, request);
        let codec = Arc::clone(&self.codec);
        async move {
            let response = call
                .await
                .map_err(|err| DispatchError::Handler(err.to_string()))?;
            codec.encode(&response).map_err(DispatchError::Encode)
        }
        .boxed()
    }
}

/// Name-to-handler table shared by every connection of one peer role.
pub struct ServiceRegistry<C = JsonCodec> {
    services: RwLock<HashMap<String, Arc<dyn ServiceHandler>>>,
    codec: Arc<C>,
}

impl ServiceRegistry<JsonCodec> {
    pub fn new() -> Self {
        Self::with_codec(JsonCodec)
    }
}

impl Default for ServiceRegistry<JsonCodec> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: PayloadCodec> ServiceRegistry<C> {
    pub fn with_codec(codec: C) -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            codec: Arc::new(codec),
        }
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<dyn ServiceHandler>>> {
        self.services
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<dyn ServiceHandler>>> {
        self.services
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an async function as the handler for `name`.
    ///
    /// Returns `false` when the name is empty or too long for the envelope.
    /// Registering an existing name replaces its handler.
    pub fn register<Req, Resp, E, F, Fut>(&self, name: impl Into<String>, func: F) -> bool
    where
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, E>> + Send + 'static,
        Req: DeserializeOwned + 'static,
        Resp: Serialize + 'static,
        E: Display + 'static,
    {
        let handler = TypedHandler {
            func,
            codec: Arc::clone(&self.codec),
            _types: PhantomData,
        };
        self.register_handler(name, Arc::new(handler))
    }

    /// Register a hand-written [`ServiceHandler`].
    pub fn register_handler(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn ServiceHandler>,
    ) -> bool {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_SERVICE_NAME_LEN {
            warn!(len = name.len(), "rejecting service registration: invalid name");
            return false;
        }

        if self.write().insert(name.clone(), handler).is_some() {
            debug!(service = %name, "service handler replaced");
        } else {
            debug!(service = %name, "service registered");
        }
        true
    }

    /// Remove a service. Returns whether it was registered.
    pub fn unregister(&self, name: &str) -> bool {
        self.write().remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Registered service names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.read().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Run a request that did not arrive over a connection.
    pub async fn dispatch(&self, message: Message) -> Message {
        let ctx = CallContext::detached(message.id, message.service.clone());
        self.dispatch_with(message, ctx).await
    }

    /// Run a request received on `conn`.
    pub async fn dispatch_on(&self, conn: &Connection, message: Message) -> Message {
        let ctx = CallContext::from_connection(&message, conn);
        self.dispatch_with(message, ctx).await
    }

    /// Run `message` through its handler and build the response.
    ///
    /// Never fails: every problem becomes an error response that keeps the
    /// request id.
    pub async fn dispatch_with(&self, message: Message, ctx: CallContext) -> Message {
        let id = message.id;
        match self.invoke(message, ctx).await {
            Ok(payload) => Message::response(id, payload),
            Err(err) => {
                debug!(id, error = %err, "request failed");
                Message::error_response(id, err.to_string())
            }
        }
    }

    async fn invoke(&self, message: Message, ctx: CallContext) -> Result<Bytes, DispatchError> {
        let handler = self
            .read()
            .get(&message.service)
            .cloned()
            .ok_or_else(|| DispatchError::ServiceNotFound(message.service.clone()))?;

        let payload = message.payload;
        let service = message.service;
        // The handler's synchronous prologue runs inside the guarded future.
        let outcome = AssertUnwindSafe(async move { handler.invoke(ctx, payload).await })
            .catch_unwind()
            .await;

        outcome.unwrap_or_else(|panic| {
            let reason = panic_message(panic.as_ref());
            warn!(service = %service, reason = %reason, "service handler panicked");
            Err(DispatchError::Panicked(reason))
        })
    }
}

impl<C> std::fmt::Debug for ServiceRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .services
            .read()
            .map(|services| services.len())
            .unwrap_or_default();
        f.debug_struct("ServiceRegistry")
            .field("services", &count)
            .finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Add {
        a: i64,
        b: i64,
    }

    fn registry() -> ServiceRegistry {
        let registry = ServiceRegistry::new();
        assert!(registry.register("add", |_ctx, args: Add| async move {
            Ok::<_, String>(args.a + args.b)
        }));
        assert!(registry.register("fail", |_ctx, _args: ()| async move {
            Err::<(), _>("refused")
        }));
        registry
    }

    fn request(id: u32, service: &str, payload: &[u8]) -> Message {
        Message::request(id, service, Bytes::copy_from_slice(payload))
    }

    #[tokio::test]
    async fn dispatch_success() {
        let reply = registry()
            .dispatch(request(4, "add", br#"{"a":2,"b":3}"#))
            .await;

        assert_eq!(reply.id, 4);
        assert!(!reply.is_error());
        assert_eq!(reply.payload.as_ref(), b"5");
    }

    #[tokio::test]
    async fn unknown_service_keeps_id() {
        let reply = registry().dispatch(request(42, "missing", b"null")).await;

        assert_eq!(reply.id, 42);
        assert_eq!(reply.error.as_deref(), Some("service not found: missing"));
        assert!(reply.payload.is_empty());
    }

    #[tokio::test]
    async fn bad_payload_is_reported() {
        let reply = registry().dispatch(request(1, "add", b"not json")).await;

        assert_eq!(reply.id, 1);
        let error = reply.error.unwrap();
        assert!(error.starts_with("bad payload:"), "{error}");
    }

    #[tokio::test]
    async fn handler_error_uses_display_string() {
        let reply = registry().dispatch(request(2, "fail", b"null")).await;
        assert_eq!(reply.error.as_deref(), Some("refused"));
    }

    #[tokio::test]
    async fn panics_become_error_responses() {
        let registry = registry();
        registry.register("boom", |_ctx, _args: ()| async move {
            if true {
                panic!("kaboom");
            }
            Ok::<(), String>(())
        });
        registry.register("sync-boom", |_ctx, _args: ()| -> future::Ready<Result<(), String>> {
            panic!("before the future")
        });

        let reply = registry.dispatch(request(3, "boom", b"null")).await;
        assert_eq!(reply.id, 3);
        assert_eq!(reply.error.as_deref(), Some("handler panicked: kaboom"));

        let reply = registry.dispatch(request(5, "sync-boom", b"null")).await;
        assert_eq!(reply.error.as_deref(), Some("handler panicked: before the future"));

        // Still usable afterwards.
        let reply = registry.dispatch(request(6, "add", br#"{"a":1,"b":1}"#)).await;
        assert_eq!(reply.payload.as_ref(), b"2");
    }

    #[test]
    fn invalid_names_rejected() {
        let registry = ServiceRegistry::new();
        let echo = |_ctx: CallContext, v: String| async move { Ok::<_, String>(v) };

        assert!(!registry.register("", echo));
        assert!(!registry.register("x".repeat(70_000), echo));
        assert!(registry.register("x".repeat(65_535), echo));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn last_registration_wins() {
        let registry = ServiceRegistry::new();
        assert!(registry.register("v", |_ctx, _: ()| async { Ok::<_, String>(1) }));
        assert!(registry.register("v", |_ctx, _: ()| async { Ok::<_, String>(2) }));

        assert_eq!(registry.names(), vec!["v".to_string()]);
        let reply = registry.dispatch(request(0, "v", b"null")).await;
        assert_eq!(reply.payload.as_ref(), b"2");

        assert!(registry.unregister("v"));
        assert!(!registry.contains("v"));
    }

    #[tokio::test]
    async fn context_carries_request_details() {
        let registry = ServiceRegistry::new();
        registry.register("whoami", |ctx: CallContext, _: ()| async move {
            Ok::<_, String>(format!("{}:{}", ctx.service(), ctx.request_id()))
        });

        let reply = registry.dispatch(request(77, "whoami", b"null")).await;
        assert_eq!(reply.payload.as_ref(), br#""whoami:77""#);
    }
}
