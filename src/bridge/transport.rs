//! Gateway transport and the dispatch channel
//!
//! Transports never touch binding state. They turn commands into HTTP
//! exchanges and report what happened as [`BridgeEvent`]s on the engine's
//! dispatch channel; the engine drains that channel on its own context.

use bytes::Bytes;
use futures::StreamExt;
use std::fmt;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use url::Url;

use super::codec::{Command, Encoded};
use super::error::{TransportError, TransportResult};
use super::request::RequestId;
use super::subscription::SubscriptionId;

/// Everything the engine reacts to, in arrival order
#[derive(Debug)]
pub enum BridgeEvent {
    /// A one-shot command finished
    Reply {
        /// Request the reply belongs to
        request: RequestId,
        /// Command verb (`GET`, `SET`, `PUBLISH`)
        verb: &'static str,
        /// Raw body or the failure
        result: TransportResult<Bytes>,
    },
    /// New bytes arrived on a subscription stream
    Chunk {
        /// Subscription the stream belongs to
        subscription: SubscriptionId,
        /// Raw body bytes
        bytes: Bytes,
    },
    /// A subscription stream ended
    StreamEnded {
        /// Subscription the stream belonged to
        subscription: SubscriptionId,
        /// Why it ended
        reason: TransportError,
    },
    /// The host emitted a local event
    Emitted {
        /// Event name
        event: String,
    },
    /// A host field changed
    FieldChanged {
        /// Field name
        field: String,
    },
}

/// Sending half of the dispatch channel
pub type EventSink = mpsc::UnboundedSender<BridgeEvent>;

/// Host-side handle for announcing local events and field changes
#[derive(Debug, Clone)]
pub struct LocalNotifier {
    sink: EventSink,
}

impl LocalNotifier {
    pub(crate) fn new(sink: EventSink) -> Self {
        Self { sink }
    }

    /// Announce that the host emitted `event`. Returns `false` once the engine is gone.
    pub fn emit(&self, event: &str) -> bool {
        self.sink
            .send(BridgeEvent::Emitted {
                event: event.to_string(),
            })
            .is_ok()
    }

    /// Announce that host field `field` has a new value. Returns `false` once the engine is gone.
    pub fn changed(&self, field: &str) -> bool {
        self.sink
            .send(BridgeEvent::FieldChanged {
                field: field.to_string(),
            })
            .is_ok()
    }
}

/// Owns an open streaming connection; closing or dropping it releases the connection.
pub struct StreamHandle {
    close: Option<Box<dyn FnOnce() + Send>>,
}

impl StreamHandle {
    /// Wrap a function that tears the connection down.
    pub fn new<F>(close: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            close: Some(Box::new(close)),
        }
    }

    /// A handle with nothing to release.
    pub fn detached() -> Self {
        Self { close: None }
    }

    /// Release the connection. Later calls do nothing.
    pub fn close(&mut self) {
        if let Some(close) = self.close.take() {
            close();
        }
    }

    /// Whether the connection has already been released.
    pub fn is_closed(&self) -> bool {
        self.close.is_none()
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Issues commands against the gateway
///
/// Both methods must return immediately; results are delivered later on `sink`.
pub trait Transport: Send + Sync {
    /// Send a one-shot command and deliver exactly one [`BridgeEvent::Reply`].
    fn send(&self, request: RequestId, command: Command, sink: EventSink);

    /// Open a streaming command, delivering [`BridgeEvent::Chunk`]s until the
    /// stream ends ([`BridgeEvent::StreamEnded`]) or the handle is closed.
    fn open_stream(
        &self,
        subscription: SubscriptionId,
        command: Command,
        sink: EventSink,
    ) -> StreamHandle;
}

/// [`Transport`] over HTTP with reqwest, spawned on the ambient tokio runtime
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base: Url,
    request_timeout: Option<Duration>,
    runtime: Handle,
}

impl HttpTransport {
    /// Create a transport for the gateway at `base`.
    ///
    /// `request_timeout` bounds one-shot commands, connecting, and the wait
    /// for a stream's response head; an open stream body is unbounded. Must
    /// be called from within a tokio runtime.
    pub fn new(base: Url, request_timeout: Option<Duration>) -> TransportResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|err| TransportError::Connection(format!("no tokio runtime: {err}")))?;
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = request_timeout {
            builder = builder.connect_timeout(timeout);
        }
        let client = builder.build().map_err(TransportError::from)?;

        Ok(Self {
            client,
            base,
            request_timeout,
            runtime,
        })
    }

    /// Gateway base URL.
    pub fn base(&self) -> &Url {
        &self.base
    }

    fn request(&self, command: &Command) -> (String, reqwest::RequestBuilder) {
        match command.encode(&self.base) {
            Encoded::Path(url) => (url.to_string(), self.client.get(url)),
            Encoded::Body { url, body } => {
                (format!("{url} <- {body}"), self.client.post(url).body(body))
            }
        }
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: RequestId, command: Command, sink: EventSink) {
        let verb = command.verb();
        let (url, mut builder) = self.request(&command);
        if let Some(timeout) = self.request_timeout {
            builder = builder.timeout(timeout);
        }

        self.runtime.spawn(async move {
            tracing::debug!(%url, "gateway request");
            let result = fetch(builder).await.map_err(TransportError::from);

            let _ = sink.send(BridgeEvent::Reply {
                request,
                verb,
                result,
            });
        });
    }

    fn open_stream(
        &self,
        subscription: SubscriptionId,
        command: Command,
        sink: EventSink,
    ) -> StreamHandle {
        let (url, request) = self.request(&command);
        let header_timeout = self.request_timeout;

        let task = self.runtime.spawn(async move {
            tracing::debug!(%url, "opening gateway stream");
            let reason = match open(request, header_timeout).await {
                Ok(response) => {
                    let mut body = response.bytes_stream();
                    loop {
                        match body.next().await {
                            Some(Ok(bytes)) => {
                                let event = BridgeEvent::Chunk {
                                    subscription,
                                    bytes,
                                };
                                if sink.send(event).is_err() {
                                    return;
                                }
                            }
                            Some(Err(err)) => break TransportError::from(err),
                            None => break TransportError::Closed,
                        }
                    }
                }
                Err(err) => err,
            };

            let _ = sink.send(BridgeEvent::StreamEnded {
                subscription,
                reason,
            });
        });

        let abort = task.abort_handle();
        StreamHandle::new(move || abort.abort())
    }
}

/// Send a streaming request and wait for its response head.
///
/// Only the head is bounded by `timeout`; the body stays open.
async fn open(
    request: reqwest::RequestBuilder,
    timeout: Option<Duration>,
) -> TransportResult<reqwest::Response> {
    let head = async move { request.send().await.and_then(reqwest::Response::error_for_status) };
    let response = match timeout {
        Some(bound) => tokio::time::timeout(bound, head)
            .await
            .map_err(|_| TransportError::Timeout)?,
        None => head.await,
    };
    response.map_err(TransportError::from)
}

async fn fetch(request: reqwest::RequestBuilder) -> reqwest::Result<Bytes> {
    let response = request.send().await?.error_for_status()?;
    response.bytes().await
}
