use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use virtual_bmv::bus::tcp::{ClientMessage, RelayMessage};
use virtual_bmv::bus::{BusAddress, BusConnection, BusMethod, BusTransport, CallReply, RemoteCall, TcpBus};
use virtual_bmv::config::BridgeOptions;
use virtual_bmv::device::{DeviceProfile, OBJECT_BASE_PATH, SERVICE_NAME};
use virtual_bmv::session::{BridgeSession, SessionSettings};
use virtual_bmv::status::RecordingSink;
use virtual_bmv::telemetry::SharedTelemetry;
use virtual_bmv::{BridgeError, SessionState, TransportError, Value};

const PROPERTY_COUNT: usize = 10;

/// How the in-test relay behaves.
#[derive(Debug, Clone, Default)]
struct RelayScript {
    refuse_name: bool,
    /// Never answer anything, but keep the socket open.
    silent: bool,
    reject: Option<String>,
    /// Sent once every property is exported.
    calls: Vec<RemoteCall>,
    ignore_unexport: bool,
    hang_up_on_unexport: bool,
}

/// Minimal relay driven by `script`. Every client message is forwarded to
/// `seen`.
async fn fake_relay(listener: TcpListener, script: RelayScript, seen: mpsc::UnboundedSender<ClientMessage>) {
    let (stream, _) = listener.accept().await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut calls = script.calls.clone();
    let mut exported = 0;

    while let Ok(Some(line)) = lines.next_line().await {
        let message: ClientMessage = serde_json::from_str(&line).unwrap();
        let mut outgoing = Vec::new();
        let mut hang_up = false;
        match &message {
            ClientMessage::RequestName { .. } => outgoing.push(RelayMessage::NameReply {
                granted: !script.refuse_name,
            }),
            ClientMessage::Export { item } => {
                if script.reject.as_deref() == Some(item.path.as_str()) {
                    outgoing.push(RelayMessage::Nack {
                        reason: "object path in use".to_string(),
                    });
                } else {
                    exported += 1;
                    outgoing.push(RelayMessage::Ack);
                    if exported == PROPERTY_COUNT {
                        outgoing.extend(calls.drain(..).map(|call| RelayMessage::Call { call }));
                    }
                }
            }
            ClientMessage::Unexport { .. } => {
                if script.hang_up_on_unexport {
                    hang_up = true;
                } else if !script.ignore_unexport {
                    outgoing.push(RelayMessage::Ack);
                }
            }
            ClientMessage::Reply { .. } | ClientMessage::Disconnect => {}
        }
        let done = message == ClientMessage::Disconnect;
        let _ = seen.send(message);
        if hang_up {
            return;
        }
        if !script.silent {
            for reply in outgoing {
                let mut line = serde_json::to_string(&reply).unwrap();
                line.push('\n');
                writer.write_all(line.as_bytes()).await.unwrap();
            }
        }
        if done {
            break;
        }
    }
}

fn tcp_session(port: u16, connect_timeout_ms: u64) -> (BridgeSession<TcpBus>, RecordingSink) {
    let options = BridgeOptions {
        venus_host: "127.0.0.1".to_string(),
        port,
        connect_timeout_ms,
        ..BridgeOptions::default()
    };
    let sink = RecordingSink::new();
    let session = BridgeSession::new(
        TcpBus,
        DeviceProfile::bmv602s(&options),
        SessionSettings::from(&options),
        Arc::new(SharedTelemetry::new()),
        Arc::new(sink.clone()),
    );
    (session, sink)
}

async fn spawn_relay(script: RelayScript) -> (u16, JoinHandle<()>, mpsc::UnboundedReceiver<ClientMessage>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (seen_tx, seen) = mpsc::unbounded_channel();
    let relay = tokio::spawn(fake_relay(listener, script, seen_tx));
    (port, relay, seen)
}

/// Collects client messages until one matches `done`.
async fn collect_until(
    seen: &mut mpsc::UnboundedReceiver<ClientMessage>,
    done: impl Fn(&ClientMessage) -> bool,
) -> Vec<ClientMessage> {
    let mut messages = Vec::new();
    let finished = timeout(Duration::from_secs(5), async {
        while let Some(message) = seen.recv().await {
            let last = done(&message);
            messages.push(message);
            if last {
                break;
            }
        }
    })
    .await;
    assert!(finished.is_ok(), "relay never saw the expected message");
    messages
}

fn drain(seen: &mut mpsc::UnboundedReceiver<ClientMessage>) -> Vec<ClientMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = seen.try_recv() {
        messages.push(message);
    }
    messages
}

#[tokio::test]
async fn test_session_over_tcp_relay() {
    let voltage = format!("{}/Dc/0/Voltage", OBJECT_BASE_PATH);
    let script = RelayScript {
        calls: vec![
            RemoteCall {
                call_id: 41,
                path: format!("{}/ProductName", OBJECT_BASE_PATH),
                method: BusMethod::GetText,
            },
            // What a JavaScript relay sends for 13.0
            RemoteCall {
                call_id: 42,
                path: voltage.clone(),
                method: serde_json::from_str(r#"{"SetValue":{"value":13}}"#).unwrap(),
            },
            RemoteCall {
                call_id: 43,
                path: voltage,
                method: BusMethod::GetValue,
            },
        ],
        ..RelayScript::default()
    };
    let (port, relay, mut seen) = spawn_relay(script).await;

    let (mut session, _) = tcp_session(port, 2000);
    session.start().await.unwrap();
    assert!(session.name_claimed());

    let mut messages = collect_until(&mut seen, |m| matches!(m, ClientMessage::Reply { call_id: 43, .. })).await;

    let report = session.stop().await.unwrap();
    assert_eq!(report.calls_answered, 3);
    assert_eq!(report.unexported, PROPERTY_COUNT);
    assert!(report.connection_closed);
    timeout(Duration::from_secs(5), relay).await.unwrap().unwrap();
    messages.extend(drain(&mut seen));

    assert_eq!(
        messages[0],
        ClientMessage::RequestName {
            name: SERVICE_NAME.to_string()
        }
    );
    let exports = messages
        .iter()
        .filter(|m| matches!(m, ClientMessage::Export { .. }))
        .count();
    assert_eq!(exports, PROPERTY_COUNT);
    assert!(messages.contains(&ClientMessage::Reply {
        call_id: 41,
        reply: CallReply::Text("Device Name".to_string()),
    }));
    assert!(messages.contains(&ClientMessage::Reply {
        call_id: 42,
        reply: CallReply::Accepted(true),
    }));
    assert!(messages.contains(&ClientMessage::Reply {
        call_id: 43,
        reply: CallReply::Value(Value::Number(13.0)),
    }));
    let unexports = messages
        .iter()
        .filter(|m| matches!(m, ClientMessage::Unexport { .. }))
        .count();
    assert_eq!(unexports, PROPERTY_COUNT);
    assert_eq!(messages.last(), Some(&ClientMessage::Disconnect));
}

#[tokio::test]
async fn test_rejected_export_rolls_back_over_tcp() {
    let rejected = format!("{}/Soc", OBJECT_BASE_PATH);
    let script = RelayScript {
        reject: Some(rejected.clone()),
        ..RelayScript::default()
    };
    let (port, relay, mut seen) = spawn_relay(script).await;

    let (mut session, _) = tcp_session(port, 2000);
    let result = session.start().await;
    match result {
        Err(BridgeError::Transport(TransportError::ExportRejected(path, reason))) => {
            assert_eq!(path, rejected);
            assert_eq!(reason, "object path in use");
        }
        other => panic!("unexpected start result: {:?}", other),
    }

    timeout(Duration::from_secs(5), relay).await.unwrap().unwrap();
    let messages = drain(&mut seen);
    let acked_exports = messages
        .iter()
        .filter(|m| matches!(m, ClientMessage::Export { item } if item.path != rejected))
        .count();
    let unexports = messages
        .iter()
        .filter(|m| matches!(m, ClientMessage::Unexport { .. }))
        .count();
    assert!(acked_exports > 0);
    assert_eq!(unexports, acked_exports);
    assert_eq!(messages.last(), Some(&ClientMessage::Disconnect));
}

#[tokio::test]
async fn test_name_refused_over_tcp() {
    let script = RelayScript {
        refuse_name: true,
        ..RelayScript::default()
    };
    let (port, relay, mut seen) = spawn_relay(script).await;

    let (mut session, sink) = tcp_session(port, 2000);
    let result = session.start().await;
    assert!(matches!(
        result,
        Err(BridgeError::Transport(TransportError::NameRefused(_)))
    ));
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(sink.errors_reported(), 1);

    timeout(Duration::from_secs(5), relay).await.unwrap().unwrap();
    let messages = drain(&mut seen);
    assert!(!messages.iter().any(|m| matches!(m, ClientMessage::Export { .. })));
    assert_eq!(messages.last(), Some(&ClientMessage::Disconnect));
}

#[tokio::test]
async fn test_silent_relay_times_out_start() {
    let script = RelayScript {
        silent: true,
        ..RelayScript::default()
    };
    let (port, relay, _seen) = spawn_relay(script).await;

    let (mut session, sink) = tcp_session(port, 300);
    let result = timeout(Duration::from_secs(5), session.start()).await;
    let result = result.expect("start must not hang on a silent relay");
    assert!(matches!(
        result,
        Err(BridgeError::Transport(TransportError::Timeout(_, 300)))
    ));
    assert_eq!(session.state(), SessionState::Idle);
    assert!(!session.name_claimed());
    assert_eq!(sink.errors_reported(), 1);
    relay.abort();
}

#[tokio::test]
async fn test_unanswered_unexport_does_not_block_stop() {
    let script = RelayScript {
        ignore_unexport: true,
        ..RelayScript::default()
    };
    let (port, relay, _seen) = spawn_relay(script).await;

    let (mut session, _) = tcp_session(port, 300);
    session.start().await.unwrap();

    let report = timeout(Duration::from_secs(5), session.stop())
        .await
        .expect("stop must not hang when the relay stops answering")
        .unwrap();
    assert_eq!(report.unexported, 0);
    assert!(report.connection_closed);
    assert_eq!(session.state(), SessionState::Idle);
    relay.abort();
}

#[tokio::test]
async fn test_relay_hangup_during_teardown() {
    let script = RelayScript {
        hang_up_on_unexport: true,
        ..RelayScript::default()
    };
    let (port, relay, _seen) = spawn_relay(script).await;

    let (mut session, _) = tcp_session(port, 2000);
    session.start().await.unwrap();

    let report = timeout(Duration::from_secs(5), session.stop())
        .await
        .expect("stop must finish after the relay hangs up")
        .unwrap();
    assert_eq!(report.unexported, 0);
    assert!(report.connection_closed);
    assert_eq!(session.state(), SessionState::Idle);
    timeout(Duration::from_secs(5), relay).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_connect_to_closed_port_is_unreachable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let address = BusAddress::new("127.0.0.1", port);
    let result = TcpBus.connect(&address, Duration::from_secs(2)).await;
    assert!(matches!(result, Err(TransportError::Unreachable(_, _))));
}

#[tokio::test]
async fn test_relay_hangup_marks_connection_not_ready() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let relay = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        drop(stream);
    });

    let address = BusAddress::new("127.0.0.1", port);
    let mut connection = TcpBus.connect(&address, Duration::from_secs(2)).await.unwrap();
    relay.await.unwrap();

    let gone = timeout(Duration::from_secs(5), async {
        while connection.is_ready() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(gone.is_ok());
    assert!(connection.next_call().await.is_none());
    assert!(connection.close().await.is_ok());
}
