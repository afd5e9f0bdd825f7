use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start >= span.end {
        return Err(EngineError::InvalidInterval {
            start: span.start,
            end: span.end,
        });
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Pure availability decision over the current snapshot: succeed iff no
/// booking with effective-active status overlaps `span`. A lapsed pending
/// booking never blocks, even before its expiry write-back lands.
///
/// `excluding` skips one booking id — a reschedule must not conflict with the
/// slot it is vacating.
pub(crate) fn check_available(
    rs: &ResourceState,
    span: &Span,
    now: Ms,
    excluding: Option<Ulid>,
) -> Result<(), EngineError> {
    for record in rs.overlapping(span) {
        if excluding == Some(record.id) {
            continue;
        }
        if record.is_active(now) {
            return Err(EngineError::Conflict(record.id));
        }
    }
    Ok(())
}
