//! Protocol errors
//!
//! "Not found on the network" is not an error: resolution returns
//! `Ok(None)` for it. These variants cover the failures that abort an
//! operation.

/// Errors that can occur in the protocol
#[derive(Debug)]
pub enum ProtocolError {
    /// Database error
    Database(String),
    /// Network engine reported failure (retries exhausted)
    Network(String),
    /// Malformed externally-supplied key encoding
    InvalidAddress(String),
    /// Protocol is not running
    NotRunning,
    /// Event sink was dropped mid-operation
    SinkClosed,
    /// IO error
    Io(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Database(e) => write!(f, "database error: {}", e),
            ProtocolError::Network(e) => write!(f, "network error: {}", e),
            ProtocolError::InvalidAddress(e) => write!(f, "invalid address: {}", e),
            ProtocolError::NotRunning => write!(f, "protocol is not running"),
            ProtocolError::SinkClosed => write!(f, "event sink closed"),
            ProtocolError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<rusqlite::Error> for ProtocolError {
    fn from(e: rusqlite::Error) -> Self {
        ProtocolError::Database(e.to_string())
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Io(e.to_string())
    }
}

impl From<crate::network::NetworkError> for ProtocolError {
    fn from(e: crate::network::NetworkError) -> Self {
        ProtocolError::Network(e.to_string())
    }
}
