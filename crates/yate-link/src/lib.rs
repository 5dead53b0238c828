//! Client for Yate's external-module message bus.
//!
//! The switch hands events to external modules over a newline-delimited,
//! colon-separated wire protocol. This crate implements the subset a routing
//! engine needs: the connect handshake, handler installation by message name
//! and priority, and request/reply message exchange with FIFO reply ordering.
//!
//! [`connect`] splits into a cheaply clonable [`Client`] handle and a
//! [`Connection`] future which drives the socket. Handlers are synchronous
//! callbacks: they either answer a message in place or take ownership of it
//! and answer later through the [`Client`], typically from a spawned task.

use std::collections::BTreeMap;

mod client;
pub mod codec;
pub mod sim;

pub use client::{connect, Client, Connection, HandlerVerdict};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("i/o error on switch transport: {0}")]
    Io(#[from] std::io::Error),
    #[error("switch connection lost")]
    ConnectionLost,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("switch rejected installing a handler for {0:?}")]
    InstallRejected(String),
}

/// A message dispatched by the switch, or originated towards it.
///
/// Parameter order is not semantically meaningful; a sorted map keeps the
/// encoded form deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub time: u64,
    pub name: String,
    pub return_value: String,
    pub params: BTreeMap<String, String>,
}

impl Message {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            time: unix_now(),
            name: name.into(),
            return_value: String::new(),
            params: BTreeMap::new(),
        }
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn set_param(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.params.insert(key.into(), value.into());
    }

    /// Consumes the request into its reply, preserving id, name, current
    /// return value and the (possibly updated) parameter set.
    pub fn into_reply(self, processed: bool) -> MessageReply {
        MessageReply {
            id: self.id,
            processed,
            name: self.name,
            return_value: self.return_value,
            params: self.params,
        }
    }
}

/// The answer to a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageReply {
    pub id: String,
    pub processed: bool,
    pub name: String,
    pub return_value: String,
    pub params: BTreeMap<String, String>,
}

pub(crate) fn unix_now() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
