//! In-process bus.
//!
//! Behaves like a remote bus daemon from the session's point of view:
//! connections claim names, export objects and receive calls from other
//! clients. Tests drive it through the client helpers (`get_value`,
//! `set_value`, `get_text`) and the fault switches.

use super::{BusAddress, BusConnection, BusMethod, BusTransport, CallReply, ExportedItem, RemoteCall};
use crate::error::TransportError;
use crate::value::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};

#[derive(Debug)]
struct ConnectionEntry {
    calls: mpsc::UnboundedSender<RemoteCall>,
    alive: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct BusState {
    refuse_reason: Option<String>,
    reserved_names: HashSet<String>,
    failing_exports: HashSet<String>,
    name_owners: HashMap<String, u64>,
    objects: BTreeMap<String, (u64, ExportedItem)>,
    connections: HashMap<u64, ConnectionEntry>,
    pending: HashMap<u64, oneshot::Sender<CallReply>>,
    unexport_log: Vec<String>,
    closed_connections: u32,
    next_connection_id: u64,
    next_call_id: u64,
}

impl BusState {
    fn drop_connection(&mut self, id: u64) {
        self.connections.remove(&id);
        self.name_owners.retain(|_, owner| *owner != id);
        self.objects.retain(|_, (owner, _)| *owner != id);
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every later `connect` fails as if the host were unreachable.
    pub async fn refuse_connections(&self, reason: &str) {
        self.state.lock().await.refuse_reason = Some(reason.to_string());
    }

    pub async fn accept_connections(&self) {
        self.state.lock().await.refuse_reason = None;
    }

    /// Marks a service name as owned by someone else.
    pub async fn reserve_name(&self, name: &str) {
        self.state.lock().await.reserved_names.insert(name.to_string());
    }

    /// Exports of this object path will be rejected.
    pub async fn fail_export_of(&self, object_path: &str) {
        self.state.lock().await.failing_exports.insert(object_path.to_string());
    }

    pub async fn exported_paths(&self) -> Vec<String> {
        self.state.lock().await.objects.keys().cloned().collect()
    }

    pub async fn exported_item(&self, object_path: &str) -> Option<ExportedItem> {
        self.state.lock().await.objects.get(object_path).map(|(_, item)| item.clone())
    }

    pub async fn name_owned(&self, name: &str) -> bool {
        self.state.lock().await.name_owners.contains_key(name)
    }

    pub async fn unexport_log(&self) -> Vec<String> {
        self.state.lock().await.unexport_log.clone()
    }

    pub async fn closed_connections(&self) -> u32 {
        self.state.lock().await.closed_connections
    }

    pub async fn open_connections(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    /// Drops every client as if the daemon had restarted.
    pub async fn sever_connections(&self) {
        let mut state = self.state.lock().await;
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            if let Some(entry) = state.connections.get(&id) {
                entry.alive.store(false, Ordering::SeqCst);
            }
            state.drop_connection(id);
        }
        state.pending.clear();
    }

    pub async fn get_value(&self, object_path: &str) -> Result<CallReply, TransportError> {
        self.call(object_path, BusMethod::GetValue).await
    }

    pub async fn set_value(&self, object_path: &str, value: Value) -> Result<CallReply, TransportError> {
        self.call(object_path, BusMethod::SetValue { value }).await
    }

    pub async fn get_text(&self, object_path: &str) -> Result<CallReply, TransportError> {
        self.call(object_path, BusMethod::GetText).await
    }

    /// Routes a call to whichever connection exported `object_path` and
    /// waits for its reply.
    async fn call(&self, object_path: &str, method: BusMethod) -> Result<CallReply, TransportError> {
        let reply_rx = {
            let mut state = self.state.lock().await;
            let owner = match state.objects.get(object_path) {
                Some((owner, _)) => *owner,
                None => return Ok(CallReply::UnknownObject),
            };
            let call_id = state.next_call_id;
            state.next_call_id += 1;

            let calls_tx = state
                .connections
                .get(&owner)
                .map(|entry| entry.calls.clone())
                .ok_or(TransportError::Closed)?;
            let (reply_tx, reply_rx) = oneshot::channel();
            state.pending.insert(call_id, reply_tx);

            let call = RemoteCall {
                call_id,
                path: object_path.to_string(),
                method,
            };
            if calls_tx.send(call).is_err() {
                state.pending.remove(&call_id);
                return Err(TransportError::Closed);
            }
            reply_rx
        };

        reply_rx.await.map_err(|_| TransportError::Closed)
    }
}

impl BusTransport for MemoryBus {
    type Connection = MemoryConnection;

    async fn connect(&self, address: &BusAddress, _timeout: Duration) -> Result<MemoryConnection, TransportError> {
        let mut state = self.state.lock().await;
        if let Some(reason) = &state.refuse_reason {
            return Err(TransportError::Unreachable(address.to_string(), reason.clone()));
        }

        let id = state.next_connection_id;
        state.next_connection_id += 1;
        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        state.connections.insert(
            id,
            ConnectionEntry {
                calls: calls_tx,
                alive: Arc::clone(&alive),
            },
        );

        Ok(MemoryConnection {
            id,
            state: Arc::clone(&self.state),
            calls: calls_rx,
            alive,
            open: true,
        })
    }
}

#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    state: Arc<Mutex<BusState>>,
    calls: mpsc::UnboundedReceiver<RemoteCall>,
    alive: Arc<AtomicBool>,
    open: bool,
}

impl BusConnection for MemoryConnection {
    fn is_ready(&self) -> bool {
        self.open && self.alive.load(Ordering::SeqCst)
    }

    async fn claim_name(&mut self, name: &str) -> Result<bool, TransportError> {
        if !self.is_ready() {
            return Err(TransportError::NotReady);
        }
        let mut state = self.state.lock().await;
        if state.reserved_names.contains(name) {
            return Ok(false);
        }
        let owner = state.name_owners.get(name).copied();
        match owner {
            Some(owner) if owner != self.id => Ok(false),
            _ => {
                state.name_owners.insert(name.to_string(), self.id);
                Ok(true)
            }
        }
    }

    async fn export(&mut self, item: &ExportedItem) -> Result<(), TransportError> {
        if !self.is_ready() {
            return Err(TransportError::NotReady);
        }
        let mut state = self.state.lock().await;
        if state.failing_exports.contains(&item.path) {
            return Err(TransportError::ExportRejected(
                item.path.clone(),
                "rejected by bus".to_string(),
            ));
        }
        if state.objects.contains_key(&item.path) {
            return Err(TransportError::ExportRejected(
                item.path.clone(),
                "object path already exported".to_string(),
            ));
        }
        state.objects.insert(item.path.clone(), (self.id, item.clone()));
        Ok(())
    }

    async fn unexport(&mut self, path: &str) -> Result<(), TransportError> {
        if !self.is_ready() {
            return Err(TransportError::NotReady);
        }
        let mut state = self.state.lock().await;
        state.unexport_log.push(path.to_string());
        // Unknown paths are ignored, as a daemon would.
        let owned = matches!(state.objects.get(path), Some((owner, _)) if *owner == self.id);
        if owned {
            state.objects.remove(path);
        }
        Ok(())
    }

    async fn next_call(&mut self) -> Option<RemoteCall> {
        if !self.is_ready() {
            return None;
        }
        self.calls.recv().await
    }

    async fn reply(&mut self, call_id: u64, reply: CallReply) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if let Some(tx) = state.pending.remove(&call_id) {
            // Caller may have given up waiting.
            let _ = tx.send(reply);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.calls.close();
        let mut state = self.state.lock().await;
        state.drop_connection(self.id);
        state.closed_connections += 1;
        Ok(())
    }
}
