use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::{Ms, Span};

/// Check-in token payload. Serialized as canonical JSON and handed to the
/// external renderer, which turns it into the artifact shown at the door.
///
/// `resource` carries the human-readable name for the rendered artifact;
/// verification ignores it and matches on `resource_id` and the exact slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPayload {
    pub resource_id: Ulid,
    pub resource: String,
    pub start: Ms,
    pub end: Ms,
}

impl TokenPayload {
    pub fn new(resource_id: Ulid, resource: impl Into<String>, span: Span) -> Self {
        Self {
            resource_id,
            resource: resource.into(),
            start: span.start,
            end: span.end,
        }
    }

    /// Struct fields serialize in declaration order, so equal payloads encode
    /// to byte-equal JSON.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("TokenPayload serializes to JSON")
    }

    pub fn decode(raw: &str) -> Result<Self, TokenError> {
        serde_json::from_str(raw).map_err(|e| TokenError::Decode(e.to_string()))
    }
}

#[derive(Debug)]
pub enum TokenError {
    /// Payload is not syntactically a token.
    Decode(String),
    /// Payload parsed but does not match the booking's current slot.
    Mismatch,
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenError::Decode(e) => write!(f, "token decode failed: {e}"),
            TokenError::Mismatch => write!(f, "token does not match booking"),
        }
    }
}

impl std::error::Error for TokenError {}

/// Verify a presented payload against a booking's *current* fields, never the
/// stored artifact — a token issued before a reschedule must not pass.
pub fn verify(resource_id: Ulid, span: &Span, presented: &str) -> Result<(), TokenError> {
    let payload = TokenPayload::decode(presented)?;
    if payload.resource_id != resource_id
        || payload.start != span.start
        || payload.end != span.end
    {
        return Err(TokenError::Mismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let payload = TokenPayload::new(Ulid::new(), "Pool", Span::new(1000, 2000));
        let decoded = TokenPayload::decode(&payload.encode()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn encoding_is_deterministic() {
        let rid = Ulid::new();
        let a = TokenPayload::new(rid, "Gym", Span::new(0, 100));
        let b = TokenPayload::new(rid, "Gym", Span::new(0, 100));
        assert_eq!(a.encode(), b.encode());
    }

    #[test]
    fn verify_matching_payload() {
        let rid = Ulid::new();
        let span = Span::new(1000, 2000);
        let raw = TokenPayload::new(rid, "Sauna", span).encode();
        assert!(verify(rid, &span, &raw).is_ok());
    }

    #[test]
    fn verify_ignores_resource_name() {
        let rid = Ulid::new();
        let span = Span::new(1000, 2000);
        let raw = TokenPayload::new(rid, "old name", span).encode();
        assert!(verify(rid, &span, &raw).is_ok());
    }

    #[test]
    fn verify_rejects_shifted_start() {
        let rid = Ulid::new();
        let raw = TokenPayload::new(rid, "Pool", Span::new(1000, 2000)).encode();
        let result = verify(rid, &Span::new(1001, 2000), &raw);
        assert!(matches!(result, Err(TokenError::Mismatch)));
    }

    #[test]
    fn verify_rejects_wrong_resource() {
        let span = Span::new(1000, 2000);
        let raw = TokenPayload::new(Ulid::new(), "Pool", span).encode();
        let result = verify(Ulid::new(), &span, &raw);
        assert!(matches!(result, Err(TokenError::Mismatch)));
    }

    #[test]
    fn verify_rejects_garbage() {
        let result = verify(Ulid::new(), &Span::new(0, 1), "not json at all");
        assert!(matches!(result, Err(TokenError::Decode(_))));
    }

    #[test]
    fn verify_rejects_wrong_shape_json() {
        let result = verify(Ulid::new(), &Span::new(0, 1), r#"{"some": "object"}"#);
        assert!(matches!(result, Err(TokenError::Decode(_))));
    }
}
