use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    /// Construction invariant: `start < end`. Unvalidated caller input goes
    /// through the struct literal instead and is rejected at the engine
    /// boundary (`InvalidInterval`).
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "span start must precede end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Booking lifecycle states. `CheckedIn`, `Canceled`, and `Expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    CheckedIn,
    Canceled,
    Expired,
}

impl BookingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BookingStatus::CheckedIn | BookingStatus::Canceled | BookingStatus::Expired
        )
    }

    /// Active statuses occupy the resource for conflict purposes.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            BookingStatus::Pending | BookingStatus::Confirmed | BookingStatus::CheckedIn
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::CheckedIn => "checked_in",
            BookingStatus::Canceled => "canceled",
            BookingStatus::Expired => "expired",
        }
    }
}

/// Opaque handle to an externally rendered check-in artifact (e.g. a barcode
/// image path). The core never looks inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef(pub String);

impl ArtifactRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Tunable durations. The grace window bounds how long an unconfirmed booking
/// holds its slot past its own start; the tolerance is how early a check-in
/// may happen before the slot opens.
#[derive(Debug, Clone, Copy)]
pub struct Policy {
    pub grace_window_ms: Ms,
    pub checkin_tolerance_ms: Ms,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            grace_window_ms: 3_600_000,    // 1 hour
            checkin_tolerance_ms: 900_000, // 15 minutes
        }
    }
}

/// A single booking on a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRecord {
    pub id: Ulid,
    pub actor_id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
    pub token: ArtifactRef,
    /// `span.start + grace_window`; recomputed whenever the span changes.
    pub expires_at: Ms,
}

impl BookingRecord {
    /// Status as observed by callers: a `Pending` booking past its grace
    /// window reads as `Expired` even before any write-back lands.
    pub fn effective_status(&self, now: Ms) -> BookingStatus {
        if self.status == BookingStatus::Pending && now >= self.expires_at {
            BookingStatus::Expired
        } else {
            self.status
        }
    }

    pub fn is_active(&self, now: Ms) -> bool {
        self.effective_status(now).is_active()
    }
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    /// All booking records (any status), sorted by `span.start`.
    pub bookings: Vec<BookingRecord>,
}

impl ResourceState {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            bookings: Vec::new(),
        }
    }

    /// Insert a record maintaining sort order by span.start.
    pub fn insert_booking(&mut self, record: BookingRecord) {
        let pos = self
            .bookings
            .binary_search_by_key(&record.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, record);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<BookingRecord> {
        if let Some(pos) = self.bookings.iter().position(|b| b.id == id) {
            Some(self.bookings.remove(pos))
        } else {
            None
        }
    }

    pub fn booking(&self, id: Ulid) -> Option<&BookingRecord> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut BookingRecord> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Return only records whose span overlaps the query window.
    /// Uses binary search to skip records starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &BookingRecord> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingCreated {
        id: Ulid,
        resource_id: Ulid,
        actor_id: Ulid,
        span: Span,
        expires_at: Ms,
        token: ArtifactRef,
    },
    /// Interval update: new span, new grace deadline, fresh token.
    BookingRescheduled {
        id: Ulid,
        resource_id: Ulid,
        span: Span,
        expires_at: Ms,
        token: ArtifactRef,
    },
    BookingConfirmed {
        id: Ulid,
        resource_id: Ulid,
    },
    BookingCheckedIn {
        id: Ulid,
        resource_id: Ulid,
    },
    BookingCanceled {
        id: Ulid,
        resource_id: Ulid,
    },
    /// Lazy-expiry write-back: a pending booking lapsed past its grace window.
    BookingLapsed {
        id: Ulid,
        resource_id: Ulid,
    },
    /// Hard delete of a single booking record.
    BookingDeleted {
        id: Ulid,
        resource_id: Ulid,
    },
    /// The external catalog deleted the resource; every dependent booking
    /// goes with it.
    ResourcePurged {
        resource_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

/// Caller-facing view of a booking. `status` is the effective status at the
/// instant of the query, which may differ from what the WAL last recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingView {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub actor_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub status: BookingStatus,
    pub token: ArtifactRef,
    pub expires_at: Ms,
}

impl BookingView {
    pub fn from_record(record: &BookingRecord, resource_id: Ulid, now: Ms) -> Self {
        Self {
            id: record.id,
            resource_id,
            actor_id: record.actor_id,
            start: record.span.start,
            end: record.span.end,
            status: record.effective_status(now),
            token: record.token.clone(),
            expires_at: record.expires_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(start: Ms, end: Ms, status: BookingStatus, expires_at: Ms) -> BookingRecord {
        BookingRecord {
            id: Ulid::new(),
            actor_id: Ulid::new(),
            span: Span::new(start, end),
            status,
            token: ArtifactRef("artifact/test".into()),
            expires_at,
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "span start must precede end")]
    fn span_new_asserts_ordering() {
        let _ = Span::new(200, 100);
    }

    #[test]
    fn span_overlap_symmetry() {
        let a = Span::new(0, 10);
        let b = Span::new(5, 15);
        let c = Span::new(10, 20);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // touching endpoints, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn status_classification() {
        assert!(BookingStatus::Pending.is_active());
        assert!(BookingStatus::Confirmed.is_active());
        assert!(BookingStatus::CheckedIn.is_active());
        assert!(!BookingStatus::Canceled.is_active());
        assert!(!BookingStatus::Expired.is_active());

        assert!(!BookingStatus::Pending.is_terminal());
        assert!(!BookingStatus::Confirmed.is_terminal());
        assert!(BookingStatus::CheckedIn.is_terminal());
        assert!(BookingStatus::Canceled.is_terminal());
        assert!(BookingStatus::Expired.is_terminal());
    }

    #[test]
    fn effective_status_lapses_pending_only() {
        let pending = record(1000, 2000, BookingStatus::Pending, 1500);
        assert_eq!(pending.effective_status(1499), BookingStatus::Pending);
        assert_eq!(pending.effective_status(1500), BookingStatus::Expired);
        assert!(!pending.is_active(1500));

        // A confirmed booking never lapses from the grace window.
        let confirmed = record(1000, 2000, BookingStatus::Confirmed, 1500);
        assert_eq!(confirmed.effective_status(9999), BookingStatus::Confirmed);
        assert!(confirmed.is_active(9999));
    }

    #[test]
    fn booking_ordering() {
        let mut rs = ResourceState::new(Ulid::new());
        rs.insert_booking(record(300, 400, BookingStatus::Pending, 999));
        rs.insert_booking(record(100, 200, BookingStatus::Confirmed, 999));
        rs.insert_booking(record(200, 300, BookingStatus::Pending, 999));
        assert_eq!(rs.bookings[0].span.start, 100);
        assert_eq!(rs.bookings[1].span.start, 200);
        assert_eq!(rs.bookings[2].span.start, 300);
    }

    #[test]
    fn booking_remove() {
        let mut rs = ResourceState::new(Ulid::new());
        let r = record(100, 200, BookingStatus::Pending, 999);
        let id = r.id;
        rs.insert_booking(r);
        assert_eq!(rs.bookings.len(), 1);
        assert!(rs.remove_booking(id).is_some());
        assert!(rs.bookings.is_empty());
    }

    #[test]
    fn remove_nonexistent_returns_none() {
        let mut rs = ResourceState::new(Ulid::new());
        rs.insert_booking(record(100, 200, BookingStatus::Pending, 999));
        assert!(rs.remove_booking(Ulid::new()).is_none());
        assert_eq!(rs.bookings.len(), 1); // original still there
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut rs = ResourceState::new(Ulid::new());
        rs.insert_booking(record(100, 200, BookingStatus::Confirmed, 999)); // past
        rs.insert_booking(record(450, 600, BookingStatus::Pending, 999)); // overlapping
        rs.insert_booking(record(1000, 1100, BookingStatus::Confirmed, 999)); // future

        let query = Span::new(500, 800);
        let hits: Vec<_> = rs.overlapping(&query).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        // Record ending exactly at query.start is NOT overlapping (half-open)
        let mut rs = ResourceState::new(Ulid::new());
        rs.insert_booking(record(100, 200, BookingStatus::Confirmed, 999));
        let hits: Vec<_> = rs.overlapping(&Span::new(200, 300)).collect();
        assert!(hits.is_empty());
    }

    #[test]
    fn overlapping_single_ms_overlap() {
        let mut rs = ResourceState::new(Ulid::new());
        // [100, 201) overlaps query [200, 300) by exactly 1ms
        rs.insert_booking(record(100, 201, BookingStatus::Confirmed, 999));
        let hits: Vec<_> = rs.overlapping(&Span::new(200, 300)).collect();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn overlapping_empty_resource() {
        let rs = ResourceState::new(Ulid::new());
        assert!(rs.overlapping(&Span::new(0, 1000)).next().is_none());
    }

    #[test]
    fn remove_middle_preserves_order() {
        let mut rs = ResourceState::new(Ulid::new());
        let records: Vec<BookingRecord> = (0..3)
            .map(|i| record((i as Ms) * 100, (i as Ms) * 100 + 50, BookingStatus::Pending, 999))
            .collect();
        let ids: Vec<Ulid> = records.iter().map(|r| r.id).collect();
        for r in records {
            rs.insert_booking(r);
        }
        rs.remove_booking(ids[1]); // remove middle
        assert_eq!(rs.bookings.len(), 2);
        assert_eq!(rs.bookings[0].id, ids[0]);
        assert_eq!(rs.bookings[1].id, ids[2]);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingCreated {
            id: Ulid::new(),
            resource_id: Ulid::new(),
            actor_id: Ulid::new(),
            span: Span::new(1000, 2000),
            expires_at: 4_600_000,
            token: ArtifactRef("artifact/abc".into()),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
