//! Outstanding-call bookkeeping.
//!
//! Every call this side originates gets an id and a one-shot completion slot.
//! The id stays reserved until the caller's [`PendingCall`] is dropped, so a
//! late response can never land on a newer call that reused the id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use peerwire_frame::Message;
use tokio::sync::oneshot;
use tracing::debug;

use crate::connection::{Connection, ConnectionId};
use crate::error::{Result, RpcError};

/// Default cap on outstanding calls per registry.
pub const DEFAULT_MAX_PENDING_CALLS: usize = 65_536;

type Completion = std::result::Result<Message, RpcError>;

struct Slot {
    conn: ConnectionId,
    sender: Option<oneshot::Sender<Completion>>,
}

struct State {
    next_id: u32,
    slots: HashMap<u32, Slot>,
}

struct Shared {
    state: Mutex<State>,
    max_pending: usize,
}

/// Maps request ids to waiting callers.
#[derive(Clone)]
pub struct CallRegistry {
    shared: Arc<Shared>,
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::with_max_pending(DEFAULT_MAX_PENDING_CALLS)
    }

    /// Registry that refuses new calls beyond `max_pending` outstanding ones.
    ///
    /// Clamped to the id space: at most `u32::MAX` calls can be outstanding,
    /// so the id search always finds a free id.
    pub fn with_max_pending(max_pending: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    next_id: 0,
                    slots: HashMap::new(),
                }),
                max_pending: max_pending.clamp(1, u32::MAX as usize),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve a fresh id bound to `conn`.
    ///
    /// Fails with [`RpcError::ClosedConnection`] if `conn` is already closed,
    /// and with [`RpcError::TooManyPendingCalls`] at capacity.
    pub fn new_call(&self, conn: &Connection) -> Result<PendingCall> {
        if conn.is_closed() {
            return Err(RpcError::ClosedConnection);
        }

        let mut state = self.lock();
        if state.slots.len() >= self.shared.max_pending {
            return Err(RpcError::TooManyPendingCalls(self.shared.max_pending));
        }

        // At most len + 1 attempts: only `len` ids can be taken.
        let mut id = state.next_id;
        while state.slots.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        state.next_id = id.wrapping_add(1);

        let (tx, rx) = oneshot::channel();
        state.slots.insert(
            id,
            Slot {
                conn: conn.id(),
                sender: Some(tx),
            },
        );

        Ok(PendingCall {
            id,
            rx: Some(rx),
            conn: conn.clone(),
            registry: self.clone(),
        })
    }

    /// Deliver `message` to the call waiting on `message.id`.
    ///
    /// Unknown or already-completed ids are logged and dropped.
    pub fn resolve(&self, message: Message) {
        let sender = {
            let mut state = self.lock();
            state
                .slots
                .get_mut(&message.id)
                .and_then(|slot| slot.sender.take())
        };

        match sender {
            Some(sender) => {
                let _ = sender.send(Ok(message));
            }
            None => debug!(id = message.id, "dropping response for unknown call"),
        }
    }

    /// Release `id`. Dropping a [`PendingCall`] does this automatically.
    pub fn remove(&self, id: u32) {
        self.lock().slots.remove(&id);
    }

    /// Fail every outstanding call bound to `conn` with `ClosedConnection`.
    pub fn fail_connection(&self, conn: ConnectionId) {
        let senders: Vec<_> = {
            let mut state = self.lock();
            state
                .slots
                .values_mut()
                .filter(|slot| slot.conn == conn)
                .filter_map(|slot| slot.sender.take())
                .collect()
        };

        if !senders.is_empty() {
            debug!(conn, count = senders.len(), "failing outstanding calls");
        }
        for sender in senders {
            let _ = sender.send(Err(RpcError::ClosedConnection));
        }
    }

    /// Reserved call ids, completed-but-unconsumed ones included.
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for CallRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallRegistry")
            .field("pending", &self.len())
            .field("max_pending", &self.shared.max_pending)
            .finish()
    }
}

/// A reserved call id. Dropping it releases the id.
pub struct PendingCall {
    id: u32,
    rx: Option<oneshot::Receiver<Completion>>,
    conn: Connection,
    registry: CallRegistry,
}

impl PendingCall {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The connection the call was issued on.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Wait for the response or for the connection to close, whichever
    /// comes first.
    pub async fn wait(mut self) -> Result<Message> {
        let Some(rx) = self.rx.take() else {
            return Err(RpcError::ClosedConnection);
        };

        tokio::select! {
            biased;
            outcome = rx => match outcome {
                Ok(completion) => completion,
                Err(_) => Err(RpcError::ClosedConnection),
            },
            _ = self.conn.closed() => Err(RpcError::ClosedConnection),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("conn", &self.conn.id())
            .finish()
    }
}
