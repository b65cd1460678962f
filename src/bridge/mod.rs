//! Bridge engine and public API
//!
//! [`Bridge`] ties a host object's capability registry to a webdis gateway.
//! All binding-table mutation and message routing happen on whichever context
//! drains the engine's dispatch channel ([`Bridge::dispatch_pending`],
//! [`Bridge::next_event`] or [`Bridge::run`]); transports only produce events.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

// Submodules
pub mod binding;
pub mod capability;
pub mod codec;
pub mod error;
pub mod request;
pub mod subscription;
pub mod transport;

use binding::{BindingDeclarations, BindingRegistry, Delivery, changed_channel};
use capability::{CapabilityRegistry, Invocable, signature};
use codec::{Command, Frame};
use error::{BridgeError, BridgeResult, TransportResult};
use request::{GetCallback, RequestId, RequestManager};
use subscription::{SubscriptionState, SubscriptionTable};
use transport::{BridgeEvent, EventSink, HttpTransport, LocalNotifier, Transport};

/// Configuration for a bridge engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Webdis gateway URL (a trailing slash is added if missing)
    pub server_url: String,

    /// Timeout for one-shot commands, in milliseconds (streams are unbounded)
    pub request_timeout_ms: Option<u64>,

    /// Upper bound for the awaited [`Bridge::get`], in milliseconds
    pub get_timeout_ms: u64,

    /// Bindings applied when the engine is built
    pub bindings: BindingDeclarations,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:7379/".to_string(),
            request_timeout_ms: Some(10_000),
            get_timeout_ms: 5_000,
            bindings: BindingDeclarations::default(),
        }
    }
}

impl BridgeConfig {
    /// Config pointing at `server_url` with default timeouts.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Default::default()
        }
    }

    /// Load a JSON config file.
    pub fn load(path: &Path) -> BridgeResult<Self> {
        let config_error = |detail: String| BridgeError::Config {
            path: path.to_path_buf(),
            detail,
        };
        let data = std::fs::read(path).map_err(|err| config_error(err.to_string()))?;
        serde_json::from_slice(&data).map_err(|err| config_error(err.to_string()))
    }

    /// Gateway URL with a guaranteed trailing slash.
    pub fn server_url(&self) -> BridgeResult<Url> {
        let mut raw = self.server_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let invalid = |detail: String| BridgeError::InvalidUrl {
            url: self.server_url.clone(),
            detail,
        };
        let url = Url::parse(&raw).map_err(|err| invalid(err.to_string()))?;
        if url.cannot_be_a_base() {
            return Err(invalid("not a hierarchical URL (missing scheme?)".to_string()));
        }
        Ok(url)
    }

    /// One-shot request timeout.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// Bound for the awaited GET.
    pub fn get_timeout(&self) -> Duration {
        Duration::from_millis(self.get_timeout_ms)
    }
}

/// Builder for [`Bridge`]
///
/// Hands out a [`LocalNotifier`] before the engine exists so the host object
/// can wire its own change notifications while building its registry.
pub struct BridgeBuilder {
    config: BridgeConfig,
    host: Option<Arc<CapabilityRegistry>>,
    transport: Option<Arc<dyn Transport>>,
    sink: EventSink,
    events: mpsc::UnboundedReceiver<BridgeEvent>,
}

impl BridgeBuilder {
    /// Start building an engine from `config`.
    pub fn new(config: BridgeConfig) -> Self {
        let (sink, events) = mpsc::unbounded_channel();
        Self {
            config,
            host: None,
            transport: None,
            sink,
            events,
        }
    }

    /// Notifier the host uses to announce emitted events and field changes.
    pub fn notifier(&self) -> LocalNotifier {
        LocalNotifier::new(self.sink.clone())
    }

    /// Host object to bind against (required).
    pub fn host(mut self, host: Arc<CapabilityRegistry>) -> Self {
        self.host = Some(host);
        self
    }

    /// Use a specific transport instead of [`HttpTransport`].
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Build the engine and apply the configured bindings.
    ///
    /// Fails without a host object. Without an explicit transport an
    /// [`HttpTransport`] is created, which requires a tokio runtime.
    pub fn build(self) -> BridgeResult<Bridge> {
        let host = self.host.ok_or(BridgeError::MissingHost)?;
        let base = self.config.server_url()?;
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(
                base.clone(),
                self.config.request_timeout(),
            )?),
        };

        let mut bridge = Bridge {
            config: self.config,
            base,
            host,
            transport,
            sink: self.sink,
            events: self.events,
            bindings: BindingRegistry::new(),
            requests: RequestManager::new(),
            subscriptions: SubscriptionTable::new(),
        };

        let declarations = std::mem::take(&mut bridge.config.bindings);
        let bound = bridge.apply_declarations(&declarations);
        tracing::info!(
            host = bridge.host.name(),
            gateway = %bridge.base,
            bound,
            declared = declarations.len(),
            "bridge ready"
        );
        bridge.config.bindings = declarations;

        Ok(bridge)
    }
}

/// Binding engine attached to one host object
pub struct Bridge {
    config: BridgeConfig,
    base: Url,
    host: Arc<CapabilityRegistry>,
    transport: Arc<dyn Transport>,
    sink: EventSink,
    events: mpsc::UnboundedReceiver<BridgeEvent>,
    bindings: BindingRegistry,
    requests: RequestManager,
    subscriptions: SubscriptionTable,
}

enum WaitStep {
    Done(BridgeResult<Value>),
    Event(Option<BridgeEvent>),
}

impl Bridge {
    /// Start building an engine.
    pub fn builder(config: BridgeConfig) -> BridgeBuilder {
        BridgeBuilder::new(config)
    }

    /// Build an engine for `server_url` bound to `host`, over HTTP.
    pub fn connect(server_url: &str, host: Arc<CapabilityRegistry>) -> BridgeResult<Self> {
        BridgeBuilder::new(BridgeConfig::new(server_url))
            .host(host)
            .build()
    }

    /// Current configuration
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Normalized gateway URL
    pub fn server_url(&self) -> &Url {
        &self.base
    }

    /// Host object the engine is bound to
    pub fn host(&self) -> &Arc<CapabilityRegistry> {
        &self.host
    }

    /// Another notifier for the host.
    pub fn notifier(&self) -> LocalNotifier {
        LocalNotifier::new(self.sink.clone())
    }

    // ---------------------------------------------------------------------
    // Binding operations
    // ---------------------------------------------------------------------

    /// Call `local_handler` whenever a message arrives on `remote_channel`.
    ///
    /// Channels containing `*` are pattern subscriptions. Fails without any
    /// network traffic when the handler does not resolve.
    pub fn subscribe_to_event(&mut self, remote_channel: &str, local_handler: &str) -> BridgeResult<()> {
        let target = self.host.resolve_handler(local_handler).inspect_err(|err| {
            tracing::warn!(channel = %remote_channel, error = %err, "subscribe_to_event: handler unresolved");
        })?;
        let local = capability::normalize_name(local_handler);

        tracing::info!(channel = %remote_channel, handler = %local, "binding remote event");
        let previous = self
            .bindings
            .bind_subscribed_event(&local, remote_channel, target);
        self.ensure_subscription(remote_channel);
        self.release_if_unused(previous, remote_channel);
        Ok(())
    }

    /// Publish on `remote_channel` every time the host emits `local_event`.
    pub fn publish_event(&mut self, local_event: &str, remote_channel: &str) -> BridgeResult<()> {
        let local = self.host.resolve_event(local_event).inspect_err(|err| {
            tracing::warn!(channel = %remote_channel, error = %err, "publish_event: event unresolved");
        })?;

        tracing::info!(event = %local, channel = %remote_channel, "publishing local event");
        self.bindings.bind_published_event(&local, remote_channel);
        Ok(())
    }

    /// Write `local_field` whenever `<remote_key>_changed` carries a new value.
    pub fn subscribe_to_property(&mut self, remote_key: &str, local_field: &str) -> BridgeResult<()> {
        let field = self
            .host
            .resolve_writable_field(local_field)
            .inspect_err(|err| {
                tracing::warn!(key = %remote_key, error = %err, "subscribe_to_property: field unresolved");
            })?
            .clone();
        let local = capability::normalize_name(local_field);
        let channel = changed_channel(remote_key);

        tracing::info!(key = %remote_key, field = %local, "binding remote property");
        let previous = self
            .bindings
            .bind_subscribed_property(&local, remote_key, field)
            .map(|key| changed_channel(&key));
        self.ensure_subscription(&channel);
        self.release_if_unused(previous, &channel);
        Ok(())
    }

    /// `SET remote_key` (and publish `<remote_key>_changed`) whenever `local_field` changes.
    ///
    /// The field must be observable.
    pub fn publish_property(&mut self, local_field: &str, remote_key: &str) -> BridgeResult<()> {
        let field = self
            .host
            .resolve_observable_field(local_field)
            .inspect_err(|err| {
                tracing::warn!(key = %remote_key, error = %err, "publish_property: field not observable");
            })?
            .clone();
        let local = capability::normalize_name(local_field);

        tracing::info!(field = %local, key = %remote_key, "publishing local property");
        self.bindings
            .bind_published_property(&local, remote_key, field);
        Ok(())
    }

    /// Apply declaration lists in order. Failing pairs are logged and skipped.
    ///
    /// Returns the number of pairs bound.
    pub fn apply_declarations(&mut self, declarations: &BindingDeclarations) -> usize {
        let mut bound = 0;
        for pair in &declarations.subscribed_events {
            bound += usize::from(self.subscribe_to_event(&pair.remote, &pair.local).is_ok());
        }
        for pair in &declarations.published_events {
            bound += usize::from(self.publish_event(&pair.local, &pair.remote).is_ok());
        }
        for pair in &declarations.subscribed_properties {
            bound += usize::from(self.subscribe_to_property(&pair.remote, &pair.local).is_ok());
        }
        for pair in &declarations.published_properties {
            bound += usize::from(self.publish_property(&pair.local, &pair.remote).is_ok());
        }
        bound
    }

    /// Close the subscription on `remote` and drop the bindings it served.
    pub fn unsubscribe(&mut self, remote: &str) -> bool {
        let dropped = self.bindings.unbind_channel(remote);
        let closed = self.subscriptions.close(remote);
        if closed || dropped > 0 {
            tracing::info!(channel = %remote, dropped, "unsubscribed");
        }
        closed
    }

    fn ensure_subscription(&mut self, remote: &str) {
        let transport = &self.transport;
        let sink = &self.sink;
        let (id, opened) = self.subscriptions.open_or_reuse(remote, |id| {
            transport.open_stream(id, Command::subscribe_for(remote), sink.clone())
        });
        if opened {
            tracing::debug!(channel = %remote, subscription = %id, "stream requested");
        }
    }

    fn release_if_unused(&mut self, previous: Option<String>, current: &str) {
        if let Some(previous) = previous {
            if previous != current && !self.bindings.channel_in_use(&previous) {
                self.subscriptions.close(&previous);
            }
        }
    }

    // ---------------------------------------------------------------------
    // One-shot commands
    // ---------------------------------------------------------------------

    /// `SET key value`, then `PUBLISH <key>_changed value`.
    ///
    /// The change notification is sent on every write, whether or not the
    /// value differs from what the store holds.
    pub fn set(&mut self, key: &str, value: Value) {
        tracing::debug!(%key, %value, "SET");
        self.send(Command::Set {
            key: key.to_string(),
            value: value.clone(),
        });
        self.publish(&changed_channel(key), value);
    }

    /// `PUBLISH channel value`.
    pub fn publish(&mut self, channel: &str, value: Value) {
        tracing::debug!(%channel, %value, "PUBLISH");
        self.send(Command::Publish {
            channel: channel.to_string(),
            value,
        });
    }

    /// `GET key`, waiting for the reply.
    ///
    /// While waiting, other queued events keep being dispatched. The wait is
    /// bounded by [`BridgeConfig::get_timeout`]; a reply arriving after the
    /// bound is discarded.
    pub async fn get(&mut self, key: &str) -> BridgeResult<Value> {
        let (request, mut waiter) = self.requests.track_waiter(key);
        self.transport.send(
            request,
            Command::Get {
                key: key.to_string(),
            },
            self.sink.clone(),
        );

        let bound = self.config.get_timeout();
        let wait = async {
            loop {
                let step = tokio::select! {
                    biased;
                    outcome = &mut waiter => {
                        WaitStep::Done(outcome.unwrap_or(Err(BridgeError::DispatchClosed)))
                    }
                    event = self.events.recv() => WaitStep::Event(event),
                };
                match step {
                    WaitStep::Done(outcome) => return outcome,
                    WaitStep::Event(Some(event)) => self.dispatch(event),
                    WaitStep::Event(None) => return Err(BridgeError::DispatchClosed),
                }
            }
        };

        let waited = tokio::time::timeout(bound, wait).await;
        match waited {
            Ok(outcome) => outcome,
            Err(_) => {
                self.requests.forget(&request);
                tracing::warn!(%key, ?bound, "GET timed out");
                Err(BridgeError::Timeout {
                    key: key.to_string(),
                    elapsed: bound,
                })
            }
        }
    }

    /// `GET key`, delivering the value to `callback` once the reply arrives.
    ///
    /// Returns immediately. The callback runs exactly once on success and not
    /// at all on failure.
    pub fn get_with(&mut self, key: &str, callback: GetCallback) -> RequestId {
        tracing::debug!(%key, ?callback, "asynchronous GET");
        let request = self.requests.track_callback(key, callback);
        self.transport.send(
            request,
            Command::Get {
                key: key.to_string(),
            },
            self.sink.clone(),
        );
        request
    }

    fn send(&mut self, command: Command) {
        self.transport
            .send(RequestId::new(), command, self.sink.clone());
    }

    // ---------------------------------------------------------------------
    // Dispatch
    // ---------------------------------------------------------------------

    /// Dispatch everything already queued without waiting. Returns the count.
    pub fn dispatch_pending(&mut self) -> usize {
        let mut dispatched = 0;
        while let Ok(event) = self.events.try_recv() {
            self.dispatch(event);
            dispatched += 1;
        }
        dispatched
    }

    /// Wait for and dispatch the next event.
    pub async fn next_event(&mut self) -> bool {
        match self.events.recv().await {
            Some(event) => {
                self.dispatch(event);
                true
            }
            None => false,
        }
    }

    /// Dispatch events forever.
    pub async fn run(&mut self) {
        while self.next_event().await {}
    }

    fn dispatch(&mut self, event: BridgeEvent) {
        match event {
            BridgeEvent::Reply {
                request,
                verb,
                result,
            } => {
                if self.requests.is_pending(&request) {
                    self.requests.complete(&request, result);
                } else {
                    log_untracked_reply(verb, result);
                }
            }
            BridgeEvent::Chunk {
                subscription,
                bytes,
            } => {
                for frame in self.subscriptions.on_chunk(subscription, &bytes) {
                    self.route(frame);
                }
            }
            BridgeEvent::StreamEnded {
                subscription,
                reason,
            } => self.subscriptions.on_ended(subscription, &reason),
            BridgeEvent::Emitted { event } => self.on_local_event(&event),
            BridgeEvent::FieldChanged { field } => self.on_field_changed(&field),
        }
    }

    fn route(&mut self, frame: Frame) {
        let deliveries = self.bindings.route(&frame);
        if deliveries.is_empty() {
            tracing::debug!(channel = frame.route_name(), "unrouted message");
            return;
        }

        for delivery in deliveries {
            match delivery {
                Delivery::Invoke {
                    local,
                    target: Invocable::Handler(handler),
                } => {
                    tracing::debug!(channel = frame.route_name(), handler = %local, "remote event");
                    handler(&[]);
                }
                Delivery::Invoke {
                    local,
                    target: Invocable::Event(event),
                } => {
                    tracing::debug!(channel = frame.route_name(), event = %local, "remote event emits local event");
                    let _ = self.sink.send(BridgeEvent::Emitted { event });
                }
                Delivery::Write {
                    local,
                    field,
                    value,
                } => {
                    tracing::debug!(channel = frame.route_name(), field = %local, %value, "remote property changed");
                    if !field.set(value) {
                        tracing::warn!(field = %local, "subscribed field is not writable");
                    }
                }
            }
        }
    }

    fn on_local_event(&mut self, event: &str) {
        let name = capability::normalize_name(event);
        if let Some(channel) = self.bindings.published_event(&name).map(str::to_string) {
            tracing::debug!(event = %name, %channel, "local event published");
            self.publish(&channel, Value::String(signature(&name)));
        }
    }

    fn on_field_changed(&mut self, field: &str) {
        let name = capability::normalize_name(field);
        let Some((key, value)) = self
            .bindings
            .published_property(&name)
            .map(|(key, field)| (key.to_string(), field.get()))
        else {
            return;
        };
        tracing::debug!(field = %name, %key, "local property published");
        self.set(&key, value);
    }

    // ---------------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------------

    /// State of the subscription on `remote`, if one was ever opened.
    pub fn subscription_state(&self, remote: &str) -> Option<SubscriptionState> {
        self.subscriptions.state(remote)
    }

    /// Remote names with a live subscription.
    pub fn live_subscriptions(&self) -> Vec<String> {
        self.subscriptions.live()
    }

    /// Current contents of the four binding tables.
    pub fn bindings(&self) -> BindingDeclarations {
        self.bindings.snapshot()
    }

    /// Number of asynchronous GETs still in flight.
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }
}

/// Decode a SET/PUBLISH reply nobody waits for and log what it says.
fn log_untracked_reply(verb: &'static str, result: TransportResult<Bytes>) {
    let body = match result {
        Ok(body) => body,
        Err(err) => {
            tracing::warn!(verb, error = %err, "gateway command failed");
            return;
        }
    };
    match codec::decode_reply(verb, &body) {
        Ok(value) if codec::is_rejection(&value) => {
            tracing::warn!(verb, reply = %value, "gateway rejected command");
        }
        Ok(value) => tracing::debug!(verb, reply = %value, "gateway reply"),
        Err(err) => tracing::warn!(
            verb,
            error = %err,
            body = %String::from_utf8_lossy(&body),
            "undecodable gateway reply"
        ),
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("server_url", &self.base.as_str())
            .field("host", &self.host.name())
            .field("bindings", &self.bindings)
            .field("subscriptions", &self.subscriptions.live())
            .field("pending_requests", &self.requests.len())
            .finish()
    }
}
