//! Newline-delimited JSON transport to a bus relay.
//!
//! The relay runs next to the bus daemon on the GX device and forwards name
//! requests, exports and method calls. Each line is one [`ClientMessage`] or
//! [`RelayMessage`].

use super::{BusAddress, BusConnection, BusTransport, CallReply, ExportedItem, RemoteCall};
use crate::error::TransportError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

const RESPONSE_BUFFER_SIZE: usize = 16;
const CALL_BUFFER_SIZE: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    RequestName { name: String },
    Export { item: ExportedItem },
    Unexport { path: String },
    Reply { call_id: u64, reply: CallReply },
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RelayMessage {
    NameReply { granted: bool },
    Ack,
    Nack { reason: String },
    Call { call: RemoteCall },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpBus;

impl BusTransport for TcpBus {
    type Connection = TcpConnection;

    async fn connect(&self, address: &BusAddress, timeout: Duration) -> Result<TcpConnection, TransportError> {
        let target = (address.host.as_str(), address.port);
        let stream = match time::timeout(timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(TransportError::Unreachable(address.to_string(), e.to_string())),
            Err(_) => return Err(TransportError::Timeout(address.to_string(), timeout.as_millis() as u64)),
        };
        stream.set_nodelay(true)?;
        debug!("Connected to bus relay at {}", address);

        let (reader, writer) = stream.into_split();
        let (responses_tx, responses_rx) = mpsc::channel(RESPONSE_BUFFER_SIZE);
        let (calls_tx, calls_rx) = mpsc::channel(CALL_BUFFER_SIZE);
        let reader_task = tokio::spawn(read_relay(reader, responses_tx, calls_tx));

        Ok(TcpConnection {
            peer: address.to_string(),
            request_timeout: timeout,
            writer,
            responses: responses_rx,
            calls: calls_rx,
            reader_task,
            open: true,
        })
    }
}

/// Splits relay traffic into responses to our requests and incoming calls.
/// Never waits on either queue, so a backlog of undrained calls cannot hold
/// back the Ack a request is waiting for.
async fn read_relay<R: AsyncRead + Unpin>(
    reader: R,
    responses: mpsc::Sender<RelayMessage>,
    calls: mpsc::Sender<RemoteCall>,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Bus relay read error: {}", e);
                break;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match serde_json::from_str::<RelayMessage>(trimmed) {
            Ok(RelayMessage::Call { call }) => match calls.try_send(call) {
                Ok(()) => {}
                Err(TrySendError::Full(call)) => {
                    warn!("Dropping call {} for {}: call queue full", call.call_id, call.path);
                }
                // Closing; responses still matter.
                Err(TrySendError::Closed(_)) => {}
            },
            Ok(other) => match responses.try_send(other) {
                Ok(()) => {}
                Err(TrySendError::Full(other)) => warn!("Dropping unsolicited relay message {:?}", other),
                Err(TrySendError::Closed(_)) => break,
            },
            Err(e) => warn!("Ignoring malformed relay message: {}", e),
        }
    }
    debug!("Bus relay reader finished");
}

#[derive(Debug)]
pub struct TcpConnection {
    peer: String,
    /// Bound on every write and every request/response exchange.
    request_timeout: Duration,
    writer: OwnedWriteHalf,
    responses: mpsc::Receiver<RelayMessage>,
    calls: mpsc::Receiver<RemoteCall>,
    reader_task: JoinHandle<()>,
    open: bool,
}

impl TcpConnection {
    fn timed_out(&mut self) -> TransportError {
        // A late answer would be mistaken for the reply to the next request.
        self.open = false;
        warn!(
            "Bus relay at {} did not answer within {} ms",
            self.peer,
            self.request_timeout.as_millis()
        );
        TransportError::Timeout(self.peer.clone(), self.request_timeout.as_millis() as u64)
    }

    async fn send(&mut self, message: &ClientMessage) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotReady);
        }
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        match time::timeout(self.request_timeout, self.writer.write_all(line.as_bytes())).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.open = false;
                Err(e.into())
            }
            Err(_) => Err(self.timed_out()),
        }
    }

    async fn request(&mut self, message: &ClientMessage) -> Result<RelayMessage, TransportError> {
        let limit = self.request_timeout;
        let exchange = async {
            self.send(message).await?;
            self.responses.recv().await.ok_or(TransportError::Closed)
        };
        match time::timeout(limit, exchange).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(TransportError::Closed)) => {
                self.open = false;
                Err(TransportError::Closed)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(self.timed_out()),
        }
    }

    async fn expect_ack(&mut self, message: &ClientMessage, path: &str) -> Result<(), TransportError> {
        match self.request(message).await? {
            RelayMessage::Ack => Ok(()),
            RelayMessage::Nack { reason } => Err(TransportError::ExportRejected(path.to_string(), reason)),
            other => Err(TransportError::Codec(format!("unexpected relay response {:?}", other))),
        }
    }
}

impl BusConnection for TcpConnection {
    fn is_ready(&self) -> bool {
        self.open && !self.reader_task.is_finished()
    }

    async fn claim_name(&mut self, name: &str) -> Result<bool, TransportError> {
        let request = ClientMessage::RequestName { name: name.to_string() };
        match self.request(&request).await? {
            RelayMessage::NameReply { granted } => Ok(granted),
            other => Err(TransportError::Codec(format!("unexpected relay response {:?}", other))),
        }
    }

    async fn export(&mut self, item: &ExportedItem) -> Result<(), TransportError> {
        let request = ClientMessage::Export { item: item.clone() };
        self.expect_ack(&request, &item.path).await
    }

    async fn unexport(&mut self, path: &str) -> Result<(), TransportError> {
        let request = ClientMessage::Unexport { path: path.to_string() };
        self.expect_ack(&request, path).await
    }

    async fn next_call(&mut self) -> Option<RemoteCall> {
        if !self.open {
            return None;
        }
        self.calls.recv().await
    }

    async fn reply(&mut self, call_id: u64, reply: CallReply) -> Result<(), TransportError> {
        self.send(&ClientMessage::Reply { call_id, reply }).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // Nobody left to say goodbye to once the relay hung up.
        if !self.is_ready() {
            self.open = false;
            self.reader_task.abort();
            return Ok(());
        }
        let farewell = self.send(&ClientMessage::Disconnect).await;
        self.open = false;
        let shutdown = match time::timeout(self.request_timeout, self.writer.shutdown()).await {
            Ok(result) => result.map_err(TransportError::from),
            Err(_) => Err(TransportError::Timeout(
                self.peer.clone(),
                self.request_timeout.as_millis() as u64,
            )),
        };
        self.reader_task.abort();
        farewell?;
        shutdown
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}
