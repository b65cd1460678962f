//! Pending GET requests and their callbacks
//!
//! Every asynchronous GET gets an entry in a side table keyed by its request
//! id. The entry is removed before its completion runs, so a callback fires at
//! most once; a transport failure removes the entry without invoking anything.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::capability::{CapabilityRegistry, HandlerFn, Invocable};
use super::codec;
use super::error::{BridgeError, BridgeResult, CapabilityError, TransportResult};

/// One-shot request identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    /// Create a new random RequestId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Callback supplied by a foreign runtime (script engine, FFI caller, ...)
pub trait ForeignCallback: Send {
    /// Deliver the result of a GET.
    fn call(&self, key: &str, value: &Value);
}

impl<F> ForeignCallback for F
where
    F: Fn(&str, &Value) + Send,
{
    fn call(&self, key: &str, value: &Value) {
        self(key, value)
    }
}

/// Completion attached to an asynchronous GET
pub enum GetCallback {
    /// A handler on a requester object, called with `[key, value]`
    Native {
        /// Requester object name
        requester: String,
        /// Handler name on the requester
        handler: String,
        /// Resolved handler
        target: HandlerFn,
    },
    /// An opaque callback from another runtime
    Foreign(Box<dyn ForeignCallback>),
}

impl GetCallback {
    /// Bind to the handler `handler` on `requester`.
    ///
    /// Only handlers qualify; events cannot receive a value.
    pub fn native(
        requester: &Arc<CapabilityRegistry>,
        handler: &str,
    ) -> Result<Self, CapabilityError> {
        match requester.resolve_handler(handler)? {
            Invocable::Handler(target) => Ok(GetCallback::Native {
                requester: requester.name().to_string(),
                handler: handler.to_string(),
                target,
            }),
            Invocable::Event(name) => Err(CapabilityError::HandlerNotFound(name)),
        }
    }

    /// Wrap a foreign callback.
    pub fn foreign<F>(callback: F) -> Self
    where
        F: ForeignCallback + 'static,
    {
        GetCallback::Foreign(Box::new(callback))
    }

    /// Run the callback.
    pub fn invoke(self, key: &str, value: Value) {
        match self {
            GetCallback::Native { target, .. } => target(&[Value::String(key.to_string()), value]),
            GetCallback::Foreign(callback) => callback.call(key, &value),
        }
    }
}

impl fmt::Debug for GetCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GetCallback::Native {
                requester, handler, ..
            } => write!(f, "GetCallback::Native({requester}.{handler})"),
            GetCallback::Foreign(_) => f.write_str("GetCallback::Foreign"),
        }
    }
}

enum Completion {
    Callback(GetCallback),
    Waiter(oneshot::Sender<BridgeResult<Value>>),
}

struct PendingRequest {
    key: String,
    completion: Completion,
    issued_at: Instant,
}

/// Side table of in-flight GET requests
#[derive(Default)]
pub struct RequestManager {
    pending: HashMap<RequestId, PendingRequest>,
}

impl RequestManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a GET whose result goes to `callback`.
    pub fn track_callback(&mut self, key: &str, callback: GetCallback) -> RequestId {
        self.insert(key, Completion::Callback(callback))
    }

    /// Track a GET whose result is awaited by the caller.
    pub fn track_waiter(&mut self, key: &str) -> (RequestId, oneshot::Receiver<BridgeResult<Value>>) {
        let (tx, rx) = oneshot::channel();
        (self.insert(key, Completion::Waiter(tx)), rx)
    }

    fn insert(&mut self, key: &str, completion: Completion) -> RequestId {
        let id = RequestId::new();
        self.pending.insert(
            id,
            PendingRequest {
                key: key.to_string(),
                completion,
                issued_at: Instant::now(),
            },
        );
        id
    }

    /// Whether `id` is still waiting for its reply.
    pub fn is_pending(&self, id: &RequestId) -> bool {
        self.pending.contains_key(id)
    }

    /// Number of requests in flight.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop a request without completing it.
    pub fn forget(&mut self, id: &RequestId) -> bool {
        self.pending.remove(id).is_some()
    }

    /// Finish request `id` with the raw transport result.
    ///
    /// Returns `false` when the id is unknown (already completed or forgotten).
    pub fn complete(&mut self, id: &RequestId, result: TransportResult<Bytes>) -> bool {
        let Some(request) = self.pending.remove(id) else {
            return false;
        };
        let elapsed = request.issued_at.elapsed();

        let outcome = result
            .map_err(BridgeError::from)
            .and_then(|body| codec::decode_reply("GET", &body).map_err(BridgeError::from));

        match (request.completion, outcome) {
            (Completion::Callback(callback), Ok(value)) => {
                tracing::debug!(key = %request.key, ?elapsed, ?callback, "GET completed");
                callback.invoke(&request.key, value);
            }
            (Completion::Callback(_), Err(err)) => {
                tracing::warn!(key = %request.key, error = %err, "GET failed, callback skipped");
            }
            (Completion::Waiter(waiter), outcome) => {
                if let Err(err) = &outcome {
                    tracing::warn!(key = %request.key, error = %err, "GET failed");
                }
                let _ = waiter.send(outcome);
            }
        }
        true
    }
}

impl fmt::Debug for RequestManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestManager")
            .field("pending", &self.pending.len())
            .finish()
    }
}
