use std::sync::Arc;

use peerwire_frame::{Action, FrameError, FrameKind, Message};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::codec::PayloadCodec;
use crate::config::DEFAULT_MAX_CONCURRENT_REQUESTS;
use crate::connection::{Connection, ConnectionHandler};
use crate::error::RpcError;
use crate::registry::CallRegistry;
use crate::service::ServiceRegistry;

pub(crate) type CloseHook = Box<dyn Fn(&Connection) + Send + Sync>;

/// Routes inbound requests to this side's services and inbound responses to
/// this side's waiting callers. One per connection.
pub(crate) struct PeerRouter<C> {
    services: Arc<ServiceRegistry<C>>,
    calls: CallRegistry,
    on_close: Option<CloseHook>,
    requests: Arc<Semaphore>,
    max_concurrent_requests: usize,
}

impl<C: PayloadCodec> PeerRouter<C> {
    pub(crate) fn new(services: Arc<ServiceRegistry<C>>, calls: CallRegistry) -> Self {
        Self {
            services,
            calls,
            on_close: None,
            requests: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT_REQUESTS)),
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
        }
    }

    pub(crate) fn with_max_concurrent_requests(mut self, limit: usize) -> Self {
        let limit = limit.clamp(1, Semaphore::MAX_PERMITS);
        self.requests = Arc::new(Semaphore::new(limit));
        self.max_concurrent_requests = limit;
        self
    }

    pub(crate) fn with_close_hook(mut self, hook: CloseHook) -> Self {
        self.on_close = Some(hook);
        self
    }

    fn serve_request(&self, conn: &Connection, request: Message) {
        if request.service.is_empty() {
            warn!(conn = conn.id(), id = request.id, "ignoring request without service name");
            return;
        }

        // The dispatch loop must keep draining responses, so excess requests
        // are refused instead of waited on.
        let Ok(permit) = Arc::clone(&self.requests).try_acquire_owned() else {
            warn!(
                conn = conn.id(),
                id = request.id,
                limit = self.max_concurrent_requests,
                "rejecting request: too many concurrent requests"
            );
            let busy = Message::error_response(
                request.id,
                format!("too many concurrent requests (max {})", self.max_concurrent_requests),
            );
            if let Err(err) = conn.try_send(FrameKind::Response, &busy) {
                debug!(conn = conn.id(), id = request.id, error = %err, "busy response not sent");
            }
            return;
        };

        // Handlers may call back over this same connection, so they must not
        // run on the dispatch loop.
        let services = Arc::clone(&self.services);
        let conn = conn.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let reply = services.dispatch_on(&conn, request).await;
            send_reply(&conn, reply).await;
        });
    }
}

/// Send `reply`, substituting an error response when it is too large to frame.
async fn send_reply(conn: &Connection, reply: Message) {
    let err = match conn.send(FrameKind::Response, &reply).await {
        Ok(()) => return,
        Err(err) => err,
    };

    match err {
        RpcError::Frame(FrameError::PayloadTooLarge { size, max }) => {
            warn!(conn = conn.id(), id = reply.id, size, max, "response exceeds payload limit");
            let fallback = Message::error_response(
                reply.id,
                format!("response too large: {size} bytes (max {max})"),
            );
            if let Err(err) = conn.send(FrameKind::Response, &fallback).await {
                debug!(conn = conn.id(), id = reply.id, error = %err, "response not sent");
            }
        }
        err => debug!(conn = conn.id(), id = reply.id, error = %err, "response not sent"),
    }
}

impl<C: PayloadCodec> ConnectionHandler for PeerRouter<C> {
    fn on_message(&self, conn: &Connection, kind: FrameKind, message: Message) {
        match (kind, message.action) {
            (FrameKind::Request, Action::Request) => self.serve_request(conn, message),
            (FrameKind::Response, Action::Response) => self.calls.resolve(message),
            (kind, action) => warn!(
                conn = conn.id(),
                id = message.id,
                frame = kind.name(),
                ?action,
                "frame type does not match envelope action"
            ),
        }
    }

    fn on_close(&self, conn: &Connection) {
        self.calls.fail_connection(conn.id());
        if let Some(hook) = &self.on_close {
            hook(conn);
        }
    }
}
