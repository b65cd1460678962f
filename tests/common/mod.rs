//! In-memory gateway used by the engine tests.
//!
//! Replies synchronously on the engine's dispatch channel, keeps a key/value
//! map, and fans `PUBLISH` out to open streams the way webdis would.

#![allow(dead_code)]

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use webdis_bridge::bridge::codec::{Command, value_to_arg};
use webdis_bridge::bridge::error::TransportError;
use webdis_bridge::bridge::request::RequestId;
use webdis_bridge::bridge::subscription::SubscriptionId;
use webdis_bridge::bridge::transport::{BridgeEvent, EventSink, StreamHandle, Transport};
use webdis_bridge::{Bridge, BridgeConfig, CapabilityRegistry, Field, LocalNotifier};

struct OpenStream {
    id: SubscriptionId,
    command: Command,
    sink: EventSink,
    closed: Arc<AtomicBool>,
}

#[derive(Default)]
struct GatewayState {
    commands: Vec<Command>,
    store: HashMap<String, Value>,
    streams: Vec<OpenStream>,
    fail_requests: bool,
    hold_replies: bool,
    held: Vec<(RequestId, Command, EventSink)>,
    canned: Option<Bytes>,
}

/// Recording fake of the webdis gateway
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<GatewayState>,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every command sent, in order.
    pub fn commands(&self) -> Vec<Command> {
        self.state.lock().commands.clone()
    }

    /// Commands sent with the given verb.
    pub fn commands_named(&self, verb: &str) -> Vec<Command> {
        self.commands()
            .into_iter()
            .filter(|command| command.verb() == verb)
            .collect()
    }

    pub fn clear_commands(&self) {
        self.state.lock().commands.clear();
    }

    /// Make every one-shot command fail with a connection error.
    pub fn fail_requests(&self, fail: bool) {
        self.state.lock().fail_requests = fail;
    }

    /// Hold one-shot replies until [`FakeGateway::release_replies`].
    pub fn hold_replies(&self, hold: bool) {
        self.state.lock().hold_replies = hold;
    }

    /// Answer every one-shot command with `body`, whatever it asked.
    pub fn answer_with(&self, body: &str) {
        self.state.lock().canned = Some(Bytes::copy_from_slice(body.as_bytes()));
    }

    pub fn release_replies(&self) {
        let held = std::mem::take(&mut self.state.lock().held);
        for (request, command, sink) in held {
            let result = {
                let mut state = self.state.lock();
                if state.fail_requests {
                    Err(TransportError::Connection("connection refused".into()))
                } else {
                    Ok(reply(&mut state, &command))
                }
            };
            let _ = sink.send(BridgeEvent::Reply {
                request,
                verb: command.verb(),
                result,
            });
        }
    }

    pub fn store_value(&self, key: &str, value: Value) {
        self.state.lock().store.insert(key.to_string(), value);
    }

    pub fn stored(&self, key: &str) -> Option<Value> {
        self.state.lock().store.get(key).cloned()
    }

    /// Number of streams that have not been released.
    pub fn open_streams(&self) -> usize {
        self.state
            .lock()
            .streams
            .iter()
            .filter(|stream| !stream.closed.load(Ordering::SeqCst))
            .count()
    }

    /// Push raw bytes on every open stream subscribed to `remote`.
    pub fn push_raw(&self, remote: &str, bytes: &[u8]) {
        let state = self.state.lock();
        for stream in state.streams.iter().filter(|s| stream_name(&s.command) == remote) {
            if !stream.closed.load(Ordering::SeqCst) {
                let _ = stream.sink.send(BridgeEvent::Chunk {
                    subscription: stream.id,
                    bytes: Bytes::copy_from_slice(bytes),
                });
            }
        }
    }

    /// End every open stream subscribed to `remote` with a transport error.
    pub fn drop_streams(&self, remote: &str) {
        let state = self.state.lock();
        for stream in state.streams.iter().filter(|s| stream_name(&s.command) == remote) {
            let _ = stream.sink.send(BridgeEvent::StreamEnded {
                subscription: stream.id,
                reason: TransportError::Connection("reset by peer".into()),
            });
        }
    }

    /// Publish as a third party would.
    pub fn publish_external(&self, channel: &str, payload: &str) -> usize {
        fan_out(&self.state.lock().streams, channel, payload)
    }
}

fn stream_name(command: &Command) -> &str {
    match command {
        Command::Subscribe { channel } => channel,
        Command::PSubscribe { pattern } => pattern,
        _ => "",
    }
}

/// Glob match supporting `*` only.
fn glob_matches(pattern: &str, channel: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == channel,
        Some((head, tail)) => {
            channel.len() >= head.len()
                && channel.starts_with(head)
                && glob_matches_tail(tail, &channel[head.len()..])
        }
    }
}

fn glob_matches_tail(pattern: &str, rest: &str) -> bool {
    if !pattern.contains('*') {
        return rest.ends_with(pattern);
    }
    (0..=rest.len())
        .filter(|idx| rest.is_char_boundary(*idx))
        .any(|idx| glob_matches(pattern, &rest[idx..]))
}

fn fan_out(streams: &[OpenStream], channel: &str, payload: &str) -> usize {
    let mut delivered = 0;
    for stream in streams.iter().filter(|s| !s.closed.load(Ordering::SeqCst)) {
        let frame = match &stream.command {
            Command::Subscribe { channel: subscribed } if subscribed == channel => {
                json!({"SUBSCRIBE": ["message", channel, payload]})
            }
            Command::PSubscribe { pattern } if glob_matches(pattern, channel) => {
                json!({"PSUBSCRIBE": ["pmessage", pattern, channel, payload]})
            }
            _ => continue,
        };
        let _ = stream.sink.send(BridgeEvent::Chunk {
            subscription: stream.id,
            bytes: Bytes::from(frame.to_string()),
        });
        delivered += 1;
    }
    delivered
}

impl Transport for FakeGateway {
    fn send(&self, request: RequestId, command: Command, sink: EventSink) {
        let verb = command.verb();
        let mut state = self.state.lock();
        state.commands.push(command.clone());

        if state.hold_replies {
            state.held.push((request, command, sink));
            return;
        }
        let result = if state.fail_requests {
            Err(TransportError::Connection("connection refused".into()))
        } else if let Some(body) = state.canned.clone() {
            Ok(body)
        } else {
            Ok(reply(&mut state, &command))
        };
        drop(state);

        let _ = sink.send(BridgeEvent::Reply {
            request,
            verb,
            result,
        });
    }

    fn open_stream(
        &self,
        subscription: SubscriptionId,
        command: Command,
        sink: EventSink,
    ) -> StreamHandle {
        let ack = match &command {
            Command::Subscribe { channel } => json!({"SUBSCRIBE": ["subscribe", channel, 1]}),
            Command::PSubscribe { pattern } => json!({"PSUBSCRIBE": ["psubscribe", pattern, 1]}),
            other => panic!("not a streaming command: {other:?}"),
        };
        let _ = sink.send(BridgeEvent::Chunk {
            subscription,
            bytes: Bytes::from(ack.to_string()),
        });

        let closed = Arc::new(AtomicBool::new(false));
        let mut state = self.state.lock();
        state.commands.push(command.clone());
        state.streams.push(OpenStream {
            id: subscription,
            command,
            sink,
            closed: closed.clone(),
        });
        StreamHandle::new(move || closed.store(true, Ordering::SeqCst))
    }
}

fn reply(state: &mut GatewayState, command: &Command) -> Bytes {
    let body = match command {
        Command::Get { key } => {
            json!({"GET": state.store.get(key).cloned().unwrap_or(Value::Null)})
        }
        Command::Set { key, value } => {
            state
                .store
                .insert(key.clone(), Value::String(value_to_arg(value)));
            json!({"SET": true})
        }
        Command::Publish { channel, value } => {
            let delivered = fan_out(&state.streams, channel, &value_to_arg(value));
            json!({"PUBLISH": delivered})
        }
        other => panic!("not a one-shot command: {other:?}"),
    };
    Bytes::from(body.to_string())
}

/// Host object used across the engine tests.
pub struct TestHost {
    pub calls: Arc<Mutex<Vec<String>>>,
    pub fields: Arc<Mutex<HashMap<String, Value>>>,
    pub writes: Arc<Mutex<Vec<(String, Value)>>>,
}

impl TestHost {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            fields: Arc::new(Mutex::new(HashMap::new())),
            writes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, handler: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == handler).count()
    }

    pub fn field(&self, name: &str) -> Option<Value> {
        self.fields.lock().get(name).cloned()
    }

    /// Values written into `name` by the engine, in order.
    pub fn writes_to(&self, name: &str) -> Vec<Value> {
        self.writes
            .lock()
            .iter()
            .filter(|(field, _)| field == name)
            .map(|(_, value)| value.clone())
            .collect()
    }

    fn handler(&self, name: &'static str) -> impl Fn(&[Value]) + Send + Sync + 'static {
        let calls = self.calls.clone();
        move |args: &[Value]| {
            let mut entry = name.to_string();
            if !args.is_empty() {
                let rendered: Vec<String> = args.iter().map(value_to_arg).collect();
                entry = format!("{name}({})", rendered.join(","));
            }
            calls.lock().push(entry);
        }
    }

    fn field_access(&self, name: &'static str) -> Field {
        let read = self.fields.clone();
        let write = self.fields.clone();
        let log = self.writes.clone();
        Field::read_write(
            move || read.lock().get(name).cloned().unwrap_or(Value::Null),
            move |value: Value| {
                log.lock().push((name.to_string(), value.clone()));
                write.lock().insert(name.to_string(), value);
            },
        )
    }

    /// Registry with handlers, events and fields the tests bind to.
    pub fn registry(&self) -> CapabilityRegistry {
        CapabilityRegistry::new("test-host")
            .with_handler("eventFromRedis", self.handler("eventFromRedis"))
            .with_handler("onAlert", self.handler("onAlert"))
            .with_handler("onFire", self.handler("onFire"))
            .with_handler("getRequestResponse(QString, QVariant)", self.handler("getRequestResponse"))
            .with_event("eventFromCpp")
            .with_event("localSignal")
            .with_field("y", self.field_access("y"))
            .with_field("x", self.field_access("x").observable())
            .with_field("plain", self.field_access("plain"))
            .with_field("constant", Field::read_only(|| json!("fixed")))
    }

    /// Set a local field and announce the change, like a host setter would.
    pub fn set_field(&self, notifier: &LocalNotifier, name: &str, value: Value) {
        self.fields.lock().insert(name.to_string(), value);
        notifier.changed(name);
    }
}

/// Log sink shared between a test and its subscriber.
#[derive(Clone, Default)]
pub struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl SharedWriter {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run `f` with warnings and errors captured; returns the formatted log.
pub fn capture_warnings(f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let make_writer = writer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || make_writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();
    tracing::subscriber::with_default(subscriber, f);
    writer.contents()
}

/// Engine over a fake gateway with a test host.
pub struct Harness {
    pub bridge: Bridge,
    pub gateway: Arc<FakeGateway>,
    pub host: TestHost,
    pub notifier: LocalNotifier,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(BridgeConfig::default())
    }

    pub fn with_config(config: BridgeConfig) -> Self {
        let gateway = FakeGateway::new();
        let host = TestHost::new();
        let builder = Bridge::builder(config);
        let notifier = builder.notifier();
        let bridge = builder
            .host(Arc::new(host.registry()))
            .transport(gateway.clone())
            .build()
            .expect("bridge builds");
        Self {
            bridge,
            gateway,
            host,
            notifier,
        }
    }

    /// Dispatch until the queue is empty.
    pub fn settle(&mut self) -> usize {
        self.bridge.dispatch_pending()
    }
}
