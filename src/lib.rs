//! Reservation core for shared amenities: conflict-checked bookings on
//! half-open time intervals, a five-state lifecycle, verifiable check-in
//! tokens, and lazy expiry. Persistence is an append-only WAL; transport
//! and identity live in the embedding service.

pub mod directory;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod token;
pub mod wal;
