//! Host-object capability registry
//!
//! The host object declares, once at startup, which handlers it can run, which
//! events it can emit and which fields it exposes. The engine resolves local
//! names against this table only; resolution never panics and reports misses
//! as [`CapabilityError`] so callers can log and continue.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use super::error::CapabilityError;

/// Invocable handler. Subscribed events call it with no arguments, GET
/// callbacks with `[key, value]`.
pub type HandlerFn = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// Field getter
pub type ReadFn = Arc<dyn Fn() -> Value + Send + Sync>;

/// Field setter
pub type WriteFn = Arc<dyn Fn(Value) + Send + Sync>;

/// Accessor pair for a host field
#[derive(Clone)]
pub struct Field {
    read: ReadFn,
    write: Option<WriteFn>,
    observable: bool,
}

impl Field {
    /// A field that can only be read.
    pub fn read_only<R>(read: R) -> Self
    where
        R: Fn() -> Value + Send + Sync + 'static,
    {
        Self {
            read: Arc::new(read),
            write: None,
            observable: false,
        }
    }

    /// A readable and writable field.
    pub fn read_write<R, W>(read: R, write: W) -> Self
    where
        R: Fn() -> Value + Send + Sync + 'static,
        W: Fn(Value) + Send + Sync + 'static,
    {
        Self {
            read: Arc::new(read),
            write: Some(Arc::new(write)),
            observable: false,
        }
    }

    /// Mark the field as announcing its changes through
    /// [`LocalNotifier::changed`](super::transport::LocalNotifier::changed).
    pub fn observable(mut self) -> Self {
        self.observable = true;
        self
    }

    /// Current value of the field.
    pub fn get(&self) -> Value {
        (self.read)()
    }

    /// Whether the field accepts writes.
    pub fn is_writable(&self) -> bool {
        self.write.is_some()
    }

    /// Whether the field has a change notification.
    pub fn is_observable(&self) -> bool {
        self.observable
    }

    /// Write a value. Returns `false` for read-only fields.
    pub fn set(&self, value: Value) -> bool {
        match &self.write {
            Some(write) => {
                write(value);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("writable", &self.is_writable())
            .field("observable", &self.observable)
            .finish()
    }
}

/// Something a subscribed event can trigger
#[derive(Clone)]
pub enum Invocable {
    /// A plain handler
    Handler(HandlerFn),
    /// A local event; invoking it emits the event
    Event(String),
}

impl fmt::Debug for Invocable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Invocable::Handler(_) => f.write_str("Invocable::Handler"),
            Invocable::Event(name) => write!(f, "Invocable::Event({name})"),
        }
    }
}

/// Name-to-capability table exposed by a host object
#[derive(Default)]
pub struct CapabilityRegistry {
    name: String,
    handlers: HashMap<String, HandlerFn>,
    events: HashSet<String>,
    fields: HashMap<String, Field>,
}

impl CapabilityRegistry {
    /// Create an empty registry for the named host object.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Host object name (used in log output).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a handler.
    pub fn with_handler<F>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        self.handlers.insert(normalize_name(name), Arc::new(handler));
        self
    }

    /// Register an emittable event.
    pub fn with_event(mut self, name: &str) -> Self {
        self.events.insert(normalize_name(name));
        self
    }

    /// Register a field.
    pub fn with_field(mut self, name: &str, field: Field) -> Self {
        self.fields.insert(normalize_name(name), field);
        self
    }

    /// Resolve something invocable: a handler, or failing that an event.
    pub fn resolve_handler(&self, name: &str) -> Result<Invocable, CapabilityError> {
        let name = normalize_name(name);
        if let Some(handler) = self.handlers.get(&name) {
            return Ok(Invocable::Handler(handler.clone()));
        }
        if self.events.contains(&name) {
            return Ok(Invocable::Event(name));
        }
        Err(CapabilityError::HandlerNotFound(name))
    }

    /// Resolve an emittable event, returning its normalized name.
    pub fn resolve_event(&self, name: &str) -> Result<String, CapabilityError> {
        let name = normalize_name(name);
        if self.events.contains(&name) {
            Ok(name)
        } else {
            Err(CapabilityError::EventNotFound(name))
        }
    }

    /// Resolve a field by name.
    pub fn resolve_field(&self, name: &str) -> Result<&Field, CapabilityError> {
        let name = normalize_name(name);
        self.fields
            .get(&name)
            .ok_or(CapabilityError::FieldNotFound(name))
    }

    /// Resolve a field that accepts writes.
    pub fn resolve_writable_field(&self, name: &str) -> Result<&Field, CapabilityError> {
        let field = self.resolve_field(name)?;
        if field.is_writable() {
            Ok(field)
        } else {
            Err(CapabilityError::NotWritable(normalize_name(name)))
        }
    }

    /// Resolve a field that announces its changes.
    pub fn resolve_observable_field(&self, name: &str) -> Result<&Field, CapabilityError> {
        let field = self.resolve_field(name)?;
        if field.is_observable() {
            Ok(field)
        } else {
            Err(CapabilityError::NotObservable(normalize_name(name)))
        }
    }
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("name", &self.name)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("events", &self.events)
            .field("fields", &self.fields)
            .finish()
    }
}

/// Strip an argument list and surrounding whitespace: `" ping(QString) "` -> `"ping"`.
pub fn normalize_name(name: &str) -> String {
    let trimmed = name.trim();
    let bare = match trimmed.find('(') {
        Some(idx) => &trimmed[..idx],
        None => trimmed,
    };
    bare.trim().to_string()
}

/// Signature published for an event: `name()`.
pub fn signature(name: &str) -> String {
    format!("{}()", normalize_name(name))
}
