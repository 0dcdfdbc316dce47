use thiserror::Error;

/// Problems with the device description or options. Fatal for a start
/// attempt: the session never reaches `Running`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("path table is empty, nothing to emulate")]
    EmptyPathTable,
    #[error("malformed property path `{0}`")]
    MalformedPath(String),
    #[error("duplicate property path `{0}`")]
    DuplicatePath(String),
    #[error("mapping targets unknown property `{0}`")]
    UnknownMappedPath(String),
    #[error("empty source path for property `{0}`")]
    EmptySourcePath(String),
    #[error("invalid options: {0}")]
    InvalidOptions(String),
}

/// Failures talking to the bus. Fatal for a start attempt, but nothing has
/// been registered yet so a later `start` may simply retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("bus at {0} is unreachable: {1}")]
    Unreachable(String, String),
    #[error("connecting to {0} timed out after {1} ms")]
    Timeout(String, u64),
    #[error("bus refused service name `{0}`")]
    NameRefused(String),
    #[error("connection is not ready")]
    NotReady,
    #[error("export of `{0}` rejected: {1}")]
    ExportRejected(String, String),
    #[error("connection closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(String),
    #[error("codec error: {0}")]
    Codec(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Codec(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("session is already running")]
    AlreadyRunning,
    #[error("session has already completed a run; create a new session")]
    SessionSpent,
}
