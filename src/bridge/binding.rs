//! Binding tables and inbound routing
//!
//! Four tables, each keyed by local name so that rebinding a local name
//! replaces its previous route:
//!
//! - subscribed events: remote channel -> local handler
//! - published events: local event -> remote channel
//! - subscribed properties: remote key (via `<key>_changed`) -> local field
//! - published properties: local field -> remote key

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use super::capability::{Field, Invocable};
use super::codec::Frame;

/// Suffix of the channel announcing changes to a key.
pub const CHANGED_SUFFIX: &str = "_changed";

/// Change channel for `key`.
pub fn changed_channel(key: &str) -> String {
    format!("{key}{CHANGED_SUFFIX}")
}

/// One `{local, remote}` declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingPair {
    /// Local handler, event or field name
    pub local: String,
    /// Remote channel or key
    pub remote: String,
}

impl BindingPair {
    /// Build a pair.
    pub fn new(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
        }
    }
}

/// Declarative binding lists, applied in field order at engine start
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingDeclarations {
    /// Remote channel -> local handler
    pub subscribed_events: Vec<BindingPair>,
    /// Local event -> remote channel
    pub published_events: Vec<BindingPair>,
    /// Remote key -> local field
    pub subscribed_properties: Vec<BindingPair>,
    /// Local field -> remote key
    pub published_properties: Vec<BindingPair>,
}

impl BindingDeclarations {
    /// Total number of declared pairs.
    pub fn len(&self) -> usize {
        self.subscribed_events.len()
            + self.published_events.len()
            + self.subscribed_properties.len()
            + self.published_properties.len()
    }

    /// Whether nothing is declared.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone)]
struct InboundRoute<T> {
    remote: String,
    target: T,
}

/// What to do with one inbound message
pub enum Delivery {
    /// Invoke a subscribed-event target
    Invoke {
        /// Local name bound to the channel
        local: String,
        /// Resolved target
        target: Invocable,
    },
    /// Write a subscribed property
    Write {
        /// Local field name
        local: String,
        /// Resolved field
        field: Field,
        /// Value carried by the message
        value: Value,
    },
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delivery::Invoke { local, .. } => write!(f, "Delivery::Invoke({local})"),
            Delivery::Write { local, value, .. } => write!(f, "Delivery::Write({local} = {value})"),
        }
    }
}

/// The four binding tables
#[derive(Default)]
pub struct BindingRegistry {
    subscribed_events: BTreeMap<String, InboundRoute<Invocable>>,
    published_events: BTreeMap<String, String>,
    subscribed_properties: BTreeMap<String, InboundRoute<Field>>,
    published_properties: BTreeMap<String, InboundRoute<Field>>,
}

impl BindingRegistry {
    /// Create empty tables
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `remote` to `local`. Returns the channel previously bound to `local`.
    pub fn bind_subscribed_event(
        &mut self,
        local: &str,
        remote: &str,
        target: Invocable,
    ) -> Option<String> {
        self.subscribed_events
            .insert(
                local.to_string(),
                InboundRoute {
                    remote: remote.to_string(),
                    target,
                },
            )
            .map(|old| old.remote)
    }

    /// Publish `local` on `remote`. Returns the channel previously bound to `local`.
    pub fn bind_published_event(&mut self, local: &str, remote: &str) -> Option<String> {
        self.published_events
            .insert(local.to_string(), remote.to_string())
    }

    /// Write `field` from changes to `remote_key`. Returns the key previously bound.
    pub fn bind_subscribed_property(
        &mut self,
        local: &str,
        remote_key: &str,
        field: Field,
    ) -> Option<String> {
        self.subscribed_properties
            .insert(
                local.to_string(),
                InboundRoute {
                    remote: remote_key.to_string(),
                    target: field,
                },
            )
            .map(|old| old.remote)
    }

    /// Push changes of `field` to `remote_key`. Returns the key previously bound.
    pub fn bind_published_property(
        &mut self,
        local: &str,
        remote_key: &str,
        field: Field,
    ) -> Option<String> {
        self.published_properties
            .insert(
                local.to_string(),
                InboundRoute {
                    remote: remote_key.to_string(),
                    target: field,
                },
            )
            .map(|old| old.remote)
    }

    /// Remote channel for local event `local`.
    pub fn published_event(&self, local: &str) -> Option<&str> {
        self.published_events.get(local).map(String::as_str)
    }

    /// Remote key and field for local field `local`.
    pub fn published_property(&self, local: &str) -> Option<(&str, &Field)> {
        self.published_properties
            .get(local)
            .map(|route| (route.remote.as_str(), &route.target))
    }

    /// Whether any inbound binding still needs the subscription on `channel`.
    pub fn channel_in_use(&self, channel: &str) -> bool {
        self.subscribed_events
            .values()
            .any(|route| route.remote == channel)
            || self
                .subscribed_properties
                .values()
                .any(|route| changed_channel(&route.remote) == channel)
    }

    /// Drop every inbound binding served by `channel`. Returns how many were removed.
    pub fn unbind_channel(&mut self, channel: &str) -> usize {
        let before = self.subscribed_events.len() + self.subscribed_properties.len();
        self.subscribed_events
            .retain(|_, route| route.remote != channel);
        self.subscribed_properties
            .retain(|_, route| changed_channel(&route.remote) != channel);
        before - (self.subscribed_events.len() + self.subscribed_properties.len())
    }

    /// Deliveries for an inbound frame.
    ///
    /// Acknowledgments yield nothing. Message frames go to every subscribed
    /// event bound to the frame's route name, and, when that name ends in
    /// `_changed`, to every property bound to the stripped key. Frames nobody
    /// is bound to yield nothing.
    pub fn route(&self, frame: &Frame) -> Vec<Delivery> {
        let Some(payload) = frame.payload() else {
            return Vec::new();
        };
        let name = frame.route_name();

        let mut deliveries: Vec<Delivery> = self
            .subscribed_events
            .iter()
            .filter(|(_, route)| route.remote == name)
            .map(|(local, route)| Delivery::Invoke {
                local: local.clone(),
                target: route.target.clone(),
            })
            .collect();

        if let Some(key) = name.strip_suffix(CHANGED_SUFFIX) {
            deliveries.extend(
                self.subscribed_properties
                    .iter()
                    .filter(|(_, route)| route.remote == key)
                    .map(|(local, route)| Delivery::Write {
                        local: local.clone(),
                        field: route.target.clone(),
                        value: payload.clone(),
                    }),
            );
        }

        deliveries
    }

    /// Current bindings as declaration lists (sorted by local name).
    pub fn snapshot(&self) -> BindingDeclarations {
        fn pairs<T>(table: &BTreeMap<String, InboundRoute<T>>) -> Vec<BindingPair> {
            table
                .iter()
                .map(|(local, route)| BindingPair::new(local.clone(), route.remote.clone()))
                .collect()
        }

        BindingDeclarations {
            subscribed_events: pairs(&self.subscribed_events),
            published_events: self
                .published_events
                .iter()
                .map(|(local, remote)| BindingPair::new(local.clone(), remote.clone()))
                .collect(),
            subscribed_properties: pairs(&self.subscribed_properties),
            published_properties: pairs(&self.published_properties),
        }
    }
}

impl fmt::Debug for BindingRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingRegistry")
            .field("bindings", &self.snapshot())
            .finish()
    }
}
