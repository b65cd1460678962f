//! Webdis wire codec
//!
//! Commands travel as URL paths (`COMMAND/arg1/arg2`) with each argument
//! escaped as a single path segment. Responses are JSON objects keyed by the
//! command name; subscription streams carry a sequence of such objects whose
//! value is a `[type, name, ...]` array.
//!
//! A URL cannot carry an argument that is exactly `.` or `..`: URL parsing
//! removes dot segments, escaped or not. Such commands go as a `POST` to the
//! gateway root with the same escaped path as the body.

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde_json::Value;
use url::Url;

use super::error::{CodecError, CodecResult};

/// Marker that switches a subscription to pattern semantics.
pub const WILDCARD: char = '*';

/// Bytes escaped inside one path segment (the WHATWG path-segment set).
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'?')
    .add(b'{')
    .add(b'}')
    .add(b'/')
    .add(b'%');

/// How a command is carried to the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoded {
    /// `GET <base>/COMMAND/arg...`
    Path(Url),
    /// `POST <base>` with `COMMAND/arg...` as the body
    Body {
        /// Gateway root
        url: Url,
        /// Escaped command path
        body: String,
    },
}

fn is_dot_segment(arg: &str) -> bool {
    arg == "." || arg == ".."
}

/// A store command the bridge knows how to send
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `GET key`
    Get {
        /// Key to read
        key: String,
    },
    /// `SET key value`
    Set {
        /// Key to write
        key: String,
        /// New value
        value: Value,
    },
    /// `PUBLISH channel value`
    Publish {
        /// Channel name
        channel: String,
        /// Message payload
        value: Value,
    },
    /// `SUBSCRIBE channel` (streaming)
    Subscribe {
        /// Channel name
        channel: String,
    },
    /// `PSUBSCRIBE pattern` (streaming)
    PSubscribe {
        /// Glob-style channel pattern
        pattern: String,
    },
}

impl Command {
    /// Subscribe command for a remote name: `PSUBSCRIBE` when it contains a wildcard.
    pub fn subscribe_for(name: &str) -> Self {
        if name.contains(WILDCARD) {
            Command::PSubscribe {
                pattern: name.to_string(),
            }
        } else {
            Command::Subscribe {
                channel: name.to_string(),
            }
        }
    }

    /// Command verb as sent on the wire (also the response key).
    pub fn verb(&self) -> &'static str {
        match self {
            Command::Get { .. } => "GET",
            Command::Set { .. } => "SET",
            Command::Publish { .. } => "PUBLISH",
            Command::Subscribe { .. } => "SUBSCRIBE",
            Command::PSubscribe { .. } => "PSUBSCRIBE",
        }
    }

    /// Whether the gateway keeps the response open.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Command::Subscribe { .. } | Command::PSubscribe { .. })
    }

    /// Unescaped arguments in order.
    pub fn args(&self) -> Vec<String> {
        match self {
            Command::Get { key } => vec![key.clone()],
            Command::Set { key, value } => vec![key.clone(), value_to_arg(value)],
            Command::Publish { channel, value } => vec![channel.clone(), value_to_arg(value)],
            Command::Subscribe { channel } => vec![channel.clone()],
            Command::PSubscribe { pattern } => vec![pattern.clone()],
        }
    }

    /// Escaped `COMMAND/arg...` path, one segment per argument.
    pub fn path(&self) -> String {
        std::iter::once(self.verb().to_string())
            .chain(
                self.args()
                    .iter()
                    .map(|arg| utf8_percent_encode(arg, SEGMENT).to_string()),
            )
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Request for this command below `base` (which must end with a slash).
    ///
    /// Uses the URL path unless an argument is a dot segment.
    pub fn encode(&self, base: &Url) -> Encoded {
        if self.args().iter().any(|arg| is_dot_segment(arg)) {
            return Encoded::Body {
                url: base.clone(),
                body: self.path(),
            };
        }
        Encoded::Path(self.to_url(base))
    }

    /// URL form; dot-segment arguments would be dropped by the URL parser.
    fn to_url(&self, base: &Url) -> Url {
        let mut url = base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(self.verb());
            for arg in self.args() {
                segments.push(&arg);
            }
        }
        url
    }
}

/// Render a value as a single command argument.
///
/// Strings go out verbatim, `null` as the empty string, everything else as
/// compact JSON.
pub fn value_to_arg(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Decode a one-shot response and return the value stored under `verb`.
pub fn decode_reply(verb: &str, body: &[u8]) -> CodecResult<Value> {
    let mut map = match serde_json::from_slice::<Value>(body)? {
        Value::Object(map) => map,
        other => return Err(CodecError::NotAnObject(kind_of(&other).to_string())),
    };
    map.remove(verb)
        .ok_or_else(|| CodecError::MissingKey(verb.to_string()))
}

/// Whether a decoded reply reports failure: `false`, or `[false, ...]`.
pub fn is_rejection(value: &Value) -> bool {
    match value {
        Value::Bool(ok) => !ok,
        Value::Array(items) => items.first() == Some(&Value::Bool(false)),
        _ => false,
    }
}

/// A decoded subscription frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `["subscribe", channel, count]`
    Subscribed {
        /// Channel acknowledged
        channel: String,
        /// Number of active subscriptions on the connection
        count: u64,
    },
    /// `["psubscribe", pattern, count]`
    PatternSubscribed {
        /// Pattern acknowledged
        pattern: String,
        /// Number of active subscriptions on the connection
        count: u64,
    },
    /// `["message", channel, payload]`
    Message {
        /// Channel the message was published on
        channel: String,
        /// Message payload
        payload: Value,
    },
    /// `["pmessage", pattern, channel, payload]`
    PatternMessage {
        /// Pattern that matched
        pattern: String,
        /// Concrete channel the message was published on
        channel: String,
        /// Message payload
        payload: Value,
    },
}

impl Frame {
    /// True for `message`/`pmessage`, false for acknowledgments.
    pub fn is_message(&self) -> bool {
        matches!(self, Frame::Message { .. } | Frame::PatternMessage { .. })
    }

    /// Name used to find the binding: the channel for plain messages, the
    /// subscribed pattern for pattern messages.
    pub fn route_name(&self) -> &str {
        match self {
            Frame::Subscribed { channel, .. } => channel,
            Frame::PatternSubscribed { pattern, .. } => pattern,
            Frame::Message { channel, .. } => channel,
            Frame::PatternMessage { pattern, .. } => pattern,
        }
    }

    /// Payload carried by a message frame.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Frame::Message { payload, .. } | Frame::PatternMessage { payload, .. } => Some(payload),
            _ => None,
        }
    }
}

/// Decode a single frame object such as `{"SUBSCRIBE": ["message", "c", "v"]}`.
pub fn decode_frame(body: &[u8]) -> CodecResult<Frame> {
    let value: Value = serde_json::from_slice(body)?;
    frame_from_value(value)
}

/// Decode an already parsed frame object.
pub fn frame_from_value(value: Value) -> CodecResult<Frame> {
    let map = match value {
        Value::Object(map) => map,
        other => return Err(CodecError::NotAnObject(kind_of(&other).to_string())),
    };
    let Some((_, body)) = map.into_iter().next() else {
        return Err(CodecError::MissingKey("SUBSCRIBE".to_string()));
    };
    let items = match body {
        Value::Array(items) => items,
        other => {
            return Err(CodecError::MalformedFrame(format!(
                "expected array, got {}",
                kind_of(&other)
            )));
        }
    };

    let text = |idx: usize| -> CodecResult<String> {
        items
            .get(idx)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CodecError::MalformedFrame(format!("element {idx} is not a string")))
    };
    let count = || items.get(2).and_then(Value::as_u64).unwrap_or(0);
    let payload = |idx: usize| items.get(idx).cloned().unwrap_or(Value::Null);

    match text(0)?.as_str() {
        "subscribe" => Ok(Frame::Subscribed {
            channel: text(1)?,
            count: count(),
        }),
        "psubscribe" => Ok(Frame::PatternSubscribed {
            pattern: text(1)?,
            count: count(),
        }),
        "message" => Ok(Frame::Message {
            channel: text(1)?,
            payload: payload(2),
        }),
        "pmessage" => Ok(Frame::PatternMessage {
            pattern: text(1)?,
            channel: text(2)?,
            payload: payload(3),
        }),
        other => Err(CodecError::MalformedFrame(format!(
            "unknown message type '{other}'"
        ))),
    }
}

/// Reassembles frames from a streamed body.
///
/// Chunk boundaries are arbitrary: one chunk can hold several frames or part
/// of one. Incomplete trailing data stays buffered for the next chunk.
#[derive(Debug, Default)]
pub struct FrameReader {
    buffer: Vec<u8>,
}

impl FrameReader {
    /// Create an empty reader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append a chunk and return every frame it completed, in order.
    ///
    /// Garbage is reported as an error and skipped up to the next `{`.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<CodecResult<Frame>> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut consumed = 0;
        while consumed < self.buffer.len() {
            let rest = &self.buffer[consumed..];
            let leading = rest.iter().take_while(|b| b.is_ascii_whitespace()).count();
            if leading == rest.len() {
                consumed = self.buffer.len();
                break;
            }
            consumed += leading;

            let mut stream =
                serde_json::Deserializer::from_slice(&self.buffer[consumed..]).into_iter::<Value>();
            match stream.next() {
                Some(Ok(value)) => {
                    consumed += stream.byte_offset();
                    frames.push(frame_from_value(value));
                }
                Some(Err(err)) if err.is_eof() => break,
                Some(Err(err)) => {
                    frames.push(Err(err.into()));
                    consumed = match self.buffer[consumed + 1..].iter().position(|b| *b == b'{') {
                        Some(offset) => consumed + 1 + offset,
                        None => self.buffer.len(),
                    };
                }
                None => break,
            }
        }

        self.buffer.drain(..consumed);
        frames
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
