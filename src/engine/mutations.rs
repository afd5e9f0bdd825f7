use futures::future::join_all;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::token::{self, TokenPayload};

use super::conflict::{check_available, now_ms, validate_span};
use super::{Engine, EngineError, WalCommand, append_with_retry};

impl Engine {
    /// Book a slot. The availability check and the insert run under the
    /// resource's write lock: of two concurrent overlapping requests exactly
    /// one wins, the loser gets `Conflict` and leaves nothing behind.
    pub async fn create_booking(
        &self,
        actor_id: Ulid,
        resource_id: Ulid,
        span: Span,
    ) -> Result<Ulid, EngineError> {
        validate_span(&span)?;
        if !self.directory.exists(resource_id).await {
            return Err(EngineError::NotFound(resource_id));
        }

        let rs = self.get_or_create_resource(resource_id);
        let guard = rs.clone().write_owned().await;
        // A purge may have won the lock in the meantime; writing to its
        // detached state would resurrect the resource on replay.
        if !self.still_live(resource_id, &rs) {
            return Err(EngineError::NotFound(resource_id));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many bookings on resource"));
        }

        if let Err(e) = check_available(&guard, &span, now_ms(), None) {
            metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let token = self.render_token(resource_id, span).await?;
        let id = Ulid::new();
        let event = Event::BookingCreated {
            id,
            resource_id,
            actor_id,
            span,
            expires_at: span.start + self.policy.grace_window_ms,
            token: token.clone(),
        };
        // On a lost append the commit task releases the rendered artifact.
        self.persist_and_apply(resource_id, guard, event, None, Some(token))
            .await?;

        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
        Ok(id)
    }

    /// Move a booking to a new slot. Allowed while effectively pending or
    /// confirmed; the conflict check excludes the slot being vacated. The
    /// token and grace deadline are derived from the span, so both are
    /// regenerated and the old artifact is released.
    pub async fn reschedule_booking(
        &self,
        booking_id: Ulid,
        actor_id: Ulid,
        new_span: Span,
    ) -> Result<(), EngineError> {
        validate_span(&new_span)?;
        let (resource_id, guard) = self.resolve_booking_write(&booking_id).await?;
        let now = now_ms();

        let record = guard
            .booking(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let from = record.effective_status(now);
        if !matches!(from, BookingStatus::Pending | BookingStatus::Confirmed) {
            return Err(EngineError::InvalidTransition {
                from,
                action: "reschedule",
            });
        }
        let booking_actor = record.actor_id;
        let old_token = record.token.clone();

        self.authorize(actor_id, booking_actor, resource_id).await?;

        if let Err(e) = check_available(&guard, &new_span, now, Some(booking_id)) {
            metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let new_token = self.render_token(resource_id, new_span).await?;
        let event = Event::BookingRescheduled {
            id: booking_id,
            resource_id,
            span: new_span,
            expires_at: new_span.start + self.policy.grace_window_ms,
            token: new_token.clone(),
        };
        // Success drops the stale artifact, failure drops the fresh one.
        self.persist_and_apply(resource_id, guard, event, Some(old_token), Some(new_token))
            .await
    }

    /// Pending → confirmed. Resource owner only; a confirmed booking no
    /// longer lapses from the grace window.
    pub async fn confirm_booking(
        &self,
        booking_id: Ulid,
        actor_id: Ulid,
    ) -> Result<(), EngineError> {
        let (resource_id, guard) = self.resolve_booking_write(&booking_id).await?;
        let now = now_ms();

        let record = guard
            .booking(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let from = record.effective_status(now);
        if from != BookingStatus::Pending {
            return Err(EngineError::InvalidTransition {
                from,
                action: "confirm",
            });
        }

        if self.directory.owner(resource_id).await != Some(actor_id) {
            return Err(EngineError::Unauthorized(actor_id));
        }

        let event = Event::BookingConfirmed {
            id: booking_id,
            resource_id,
        };
        self.persist_and_apply(resource_id, guard, event, None, None)
            .await
    }

    /// Present a token at the door. The payload must match the booking's
    /// *current* resource and slot exactly, and the clock must be inside
    /// `[start - tolerance, end]`.
    pub async fn check_in(
        &self,
        booking_id: Ulid,
        presented: &str,
    ) -> Result<(), EngineError> {
        let (resource_id, guard) = self.resolve_booking_write(&booking_id).await?;
        let now = now_ms();

        let record = guard
            .booking(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let from = record.effective_status(now);
        if !matches!(from, BookingStatus::Pending | BookingStatus::Confirmed) {
            return Err(EngineError::InvalidTransition {
                from,
                action: "check in",
            });
        }

        if let Err(e) = token::verify(resource_id, &record.span, presented) {
            metrics::counter!(observability::CHECKIN_FAILURES_TOTAL).increment(1);
            return Err(e.into());
        }

        let opens_at = record.span.start - self.policy.checkin_tolerance_ms;
        if now < opens_at || now > record.span.end {
            metrics::counter!(observability::CHECKIN_FAILURES_TOTAL).increment(1);
            return Err(EngineError::InvalidTransition {
                from,
                action: "check in outside the slot window",
            });
        }

        let event = Event::BookingCheckedIn {
            id: booking_id,
            resource_id,
        };
        self.persist_and_apply(resource_id, guard, event, None, None)
            .await?;
        metrics::counter!(observability::CHECKINS_TOTAL).increment(1);
        Ok(())
    }

    /// Cancel a booking. Booking actor or resource owner, any time before a
    /// terminal state.
    pub async fn cancel_booking(
        &self,
        booking_id: Ulid,
        actor_id: Ulid,
    ) -> Result<(), EngineError> {
        let (resource_id, guard) = self.resolve_booking_write(&booking_id).await?;
        let now = now_ms();

        let record = guard
            .booking(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let from = record.effective_status(now);
        if from.is_terminal() {
            return Err(EngineError::InvalidTransition {
                from,
                action: "cancel",
            });
        }
        let booking_actor = record.actor_id;

        self.authorize(actor_id, booking_actor, resource_id).await?;

        let event = Event::BookingCanceled {
            id: booking_id,
            resource_id,
        };
        self.persist_and_apply(resource_id, guard, event, None, None)
            .await
    }

    /// Hard-delete a booking record and release its artifact. Only the actor
    /// who made the booking may erase it.
    pub async fn delete_booking(
        &self,
        booking_id: Ulid,
        actor_id: Ulid,
    ) -> Result<(), EngineError> {
        let (resource_id, guard) = self.resolve_booking_write(&booking_id).await?;

        let record = guard
            .booking(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        if record.actor_id != actor_id {
            return Err(EngineError::Unauthorized(actor_id));
        }
        let token = record.token.clone();

        let event = Event::BookingDeleted {
            id: booking_id,
            resource_id,
        };
        self.persist_and_apply(resource_id, guard, event, Some(token), None)
            .await
    }

    /// Referential-integrity delete for a resource removed from the external
    /// catalog: every dependent booking goes inside the same atomic scope,
    /// their artifacts released afterwards fire-and-forget.
    pub async fn purge_resource(&self, resource_id: Ulid) -> Result<(), EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let mut guard = rs.clone().write_owned().await;
        // Another purge may have won the lock
        if !self.still_live(resource_id, &rs) {
            return Err(EngineError::NotFound(resource_id));
        }

        let wal_tx = self.wal_tx.clone();
        let state = self.state.clone();
        let index = self.booking_index.clone();
        let notify = self.notify.clone();
        let renderer = self.artifacts.clone();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        // The purge event and the removal must land together, so the commit
        // runs on its own task and survives the caller giving up on it.
        tokio::spawn(async move {
            let event = Event::ResourcePurged { resource_id };
            let outcome = match append_with_retry(&wal_tx, &event).await {
                Ok(()) => {
                    let records = std::mem::take(&mut guard.bookings);
                    for record in &records {
                        index.remove(&record.id);
                    }
                    state.remove(&resource_id);
                    notify.send(resource_id, &event);
                    notify.remove(&resource_id);
                    drop(guard);

                    tracing::debug!(
                        "purged resource {resource_id}: {} bookings dropped",
                        records.len()
                    );
                    tokio::spawn(async move {
                        let released =
                            join_all(records.iter().map(|r| renderer.release(&r.token))).await;
                        for (record, ok) in records.iter().zip(released) {
                            if !ok {
                                metrics::counter!(observability::ARTIFACT_RELEASE_FAILURES_TOTAL)
                                    .increment(1);
                                tracing::warn!(
                                    "failed to release artifact {}",
                                    record.token.as_str()
                                );
                            }
                        }
                    });
                    Ok(())
                }
                Err(e) => Err(e),
            };
            let _ = done_tx.send(outcome);
        });
        done_rx
            .await
            .unwrap_or_else(|_| Err(EngineError::Unavailable("commit task dropped".into())))
    }

    /// Opportunistic write-back of the lazy expiry rule. Correctness never
    /// depends on this landing — readers already observe the booking as
    /// expired — but persisting it keeps the WAL honest across restarts.
    pub async fn mark_lapsed(&self, booking_id: Ulid) -> Result<(), EngineError> {
        let (resource_id, guard) = self.resolve_booking_write(&booking_id).await?;
        let now = now_ms();

        let record = guard
            .booking(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        if record.status != BookingStatus::Pending || now < record.expires_at {
            return Err(EngineError::InvalidTransition {
                from: record.status,
                action: "lapse",
            });
        }

        let event = Event::BookingLapsed {
            id: booking_id,
            resource_id,
        };
        self.persist_and_apply(resource_id, guard, event, None, None)
            .await?;
        metrics::counter!(observability::BOOKINGS_LAPSED_TOTAL).increment(1);
        Ok(())
    }

    /// Pending bookings whose grace window has passed, by stored status.
    /// Skips resources under write contention; the next sweep catches them.
    pub fn collect_lapsed(&self, now: Ms) -> Vec<Ulid> {
        let mut lapsed = Vec::new();
        for entry in self.state.iter() {
            let rs = entry.value().clone();
            if let Ok(guard) = rs.try_read() {
                for record in &guard.bookings {
                    if record.status == BookingStatus::Pending && now >= record.expires_at {
                        lapsed.push(record.id);
                    }
                }
            }
        }
        lapsed
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state: one create per surviving booking plus its
    /// status transition, if any.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Counter first: any append processed after this read makes the
        // writer refuse the swap, so an acknowledged mutation can never be
        // compacted away.
        let expected_appends = self.wal_appends_since_compact().await;

        // Snapshot the Arcs first; never hold a DashMap shard across an await.
        let resources: Vec<super::SharedResourceState> =
            self.state.iter().map(|e| e.value().clone()).collect();

        let mut events = Vec::new();
        for rs in resources {
            let guard = rs.read().await;
            for record in &guard.bookings {
                events.push(Event::BookingCreated {
                    id: record.id,
                    resource_id: guard.id,
                    actor_id: record.actor_id,
                    span: record.span,
                    expires_at: record.expires_at,
                    token: record.token.clone(),
                });
                let status_event = match record.status {
                    BookingStatus::Pending => None,
                    BookingStatus::Confirmed => Some(Event::BookingConfirmed {
                        id: record.id,
                        resource_id: guard.id,
                    }),
                    BookingStatus::CheckedIn => Some(Event::BookingCheckedIn {
                        id: record.id,
                        resource_id: guard.id,
                    }),
                    BookingStatus::Canceled => Some(Event::BookingCanceled {
                        id: record.id,
                        resource_id: guard.id,
                    }),
                    BookingStatus::Expired => Some(Event::BookingLapsed {
                        id: record.id,
                        resource_id: guard.id,
                    }),
                };
                events.extend(status_event);
            }
        }

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                expected_appends,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Unavailable(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    // ── helpers ──────────────────────────────────────────────────

    async fn authorize(
        &self,
        actor_id: Ulid,
        booking_actor: Ulid,
        resource_id: Ulid,
    ) -> Result<(), EngineError> {
        if actor_id == booking_actor {
            return Ok(());
        }
        if self.directory.owner(resource_id).await == Some(actor_id) {
            return Ok(());
        }
        Err(EngineError::Unauthorized(actor_id))
    }

    /// Encode the payload for the booking's current slot and hand it to the
    /// external renderer.
    async fn render_token(
        &self,
        resource_id: Ulid,
        span: Span,
    ) -> Result<ArtifactRef, EngineError> {
        let name = self.directory.name(resource_id).await.unwrap_or_default();
        let payload = TokenPayload::new(resource_id, name, span).encode();
        self.artifacts
            .render(&payload)
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))
    }
}
