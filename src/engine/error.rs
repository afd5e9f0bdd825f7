use ulid::Ulid;

use crate::model::{BookingStatus, Ms};
use crate::token::TokenError;

#[derive(Debug)]
pub enum EngineError {
    /// Requested interval is malformed (`start >= end`).
    InvalidInterval { start: Ms, end: Ms },
    /// Unknown booking or resource.
    NotFound(Ulid),
    /// Requested interval overlaps the named active booking.
    Conflict(Ulid),
    /// Actor is neither the booking's maker nor the resource's owner.
    Unauthorized(Ulid),
    /// State-machine guard violation.
    InvalidTransition {
        from: BookingStatus,
        action: &'static str,
    },
    /// Presented token parsed but does not match the booking's current slot.
    TokenMismatch,
    /// Presented token is not syntactically a token.
    TokenDecode(String),
    LimitExceeded(&'static str),
    /// Persistence failed after retry; nothing was written.
    Unavailable(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInterval { start, end } => {
                write!(f, "invalid interval: [{start}, {end})")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Conflict(id) => write!(f, "conflict with booking: {id}"),
            EngineError::Unauthorized(actor) => write!(f, "actor {actor} not authorized"),
            EngineError::InvalidTransition { from, action } => {
                write!(f, "cannot {action}: booking is {}", from.as_str())
            }
            EngineError::TokenMismatch => write!(f, "token does not match booking"),
            EngineError::TokenDecode(e) => write!(f, "token decode failed: {e}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Unavailable(e) => write!(f, "persistence unavailable: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<TokenError> for EngineError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Decode(msg) => EngineError::TokenDecode(msg),
            TokenError::Mismatch => EngineError::TokenMismatch,
        }
    }
}
