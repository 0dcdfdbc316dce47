pub mod memory;
pub mod tcp;

pub use memory::{MemoryBus, MemoryConnection};
pub use tcp::{TcpBus, TcpConnection};

use crate::error::TransportError;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;

pub const BUS_ITEM_INTERFACE: &str = "com.victronenergy.BusItem";

/// Where the bus lives, written `tcp:host=venus.local,port=78`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusAddress {
    pub host: String,
    pub port: u16,
}

impl BusAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    pub fn parse(address: &str) -> Option<Self> {
        let params = address.strip_prefix("tcp:")?;
        let mut host = None;
        let mut port = None;
        for pair in params.split(',') {
            match pair.split_once('=')? {
                ("host", h) if !h.is_empty() => host = Some(h.to_string()),
                ("port", p) => port = p.parse().ok(),
                _ => {}
            }
        }
        Some(Self { host: host?, port: port? })
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp:host={},port={}", self.host, self.port)
    }
}

/// What a connection needs to publish one property object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedItem {
    pub path: String,
    pub interface: String,
    pub signature: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BusMethod {
    GetValue,
    SetValue { value: Value },
    GetText,
}

/// A method call from another bus client against one of our objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCall {
    pub call_id: u64,
    pub path: String,
    pub method: BusMethod,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallReply {
    Value(Value),
    Accepted(bool),
    Text(String),
    UnknownObject,
}

/// Opens connections to a bus.
pub trait BusTransport: Send + Sync + 'static {
    type Connection: BusConnection;

    fn connect(
        &self,
        address: &BusAddress,
        timeout: Duration,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;
}

/// One open bus connection. Owned by a single session task.
pub trait BusConnection: Send + 'static {
    fn is_ready(&self) -> bool;

    /// Requests a well-known service name. `Ok(false)` means the bus
    /// answered but would not grant it.
    fn claim_name(&mut self, name: &str) -> impl Future<Output = Result<bool, TransportError>> + Send;

    fn export(&mut self, item: &ExportedItem) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn unexport(&mut self, path: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Next incoming call, `None` once the connection can deliver no more.
    /// Must be cancel safe: it is polled inside `select!`.
    fn next_call(&mut self) -> impl Future<Output = Option<RemoteCall>> + Send;

    fn reply(
        &mut self,
        call_id: u64,
        reply: CallReply,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}
