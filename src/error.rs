use thiserror::Error;

use crate::meeting::MeetingError;

/// Crate-wide error type for agent and transport operations.
#[derive(Debug, Error)]
pub enum BotError {
    #[error("Agent capacity reached ({0})")]
    CapacityExceeded(usize),

    #[error("A join is already in progress")]
    AlreadyConnecting,

    #[error("Agent is not connected")]
    NotConnected,

    #[error("Agent is not in translate mode")]
    NotInTranslateMode,

    #[error("Language '{0}' is already active")]
    AlreadyActive(String),

    #[error("Language '{0}' is not active")]
    NotFound(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Link is closed")]
    LinkClosed,

    #[error("Meeting error: {0}")]
    Meeting(#[from] MeetingError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BotResult<T> = Result<T, BotError>;
