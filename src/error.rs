use thiserror::Error;

use crate::protocol::ProtocolError;

#[derive(Error, Debug)]
pub enum CiError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out during {operation} with {peer}")]
    Timeout { operation: &'static str, peer: String },

    #[error("Unexpected reply from {peer}: expected {expected:?}, got {got:?}")]
    UnexpectedReply {
        peer: String,
        expected: String,
        got: String,
    },

    #[error("Registration with dispatcher {0} was refused")]
    Registration(String),

    #[error("Could not bind any port in range {start}-{end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("Repository update failed: {0}")]
    RepoUpdate(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

impl CiError {
    /// True for failures that mean "the peer is not reachable right now".
    pub fn is_transport(&self) -> bool {
        matches!(self, CiError::Io(_) | CiError::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, CiError>;
