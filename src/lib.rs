//! Webdis Bridge – binds a host object's events and fields to Redis
//!
//! This crate connects an application object to a Redis server reached through
//! a webdis HTTP gateway:
//! - Remote channels trigger local handlers (`SUBSCRIBE`/`PSUBSCRIBE`)
//! - Local events are published to remote channels (`PUBLISH`)
//! - Remote keys feed local fields through their `<key>_changed` channel
//! - Local field changes are written back (`SET` plus a change notification)
//! - One-shot `GET`/`SET`/`PUBLISH` with awaited or callback completion

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Bridge engine modules
pub mod bridge;

// Re-export key types for convenience
pub use bridge::capability::{CapabilityRegistry, Field};
pub use bridge::error::{BridgeError, BridgeResult};
pub use bridge::request::GetCallback;
pub use bridge::transport::LocalNotifier;
pub use bridge::{Bridge, BridgeBuilder, BridgeConfig};

/// Current version of the bridge
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
