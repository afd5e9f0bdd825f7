use ulid::Ulid;

use crate::model::*;

use super::conflict::now_ms;
use super::{Engine, EngineError, SharedResourceState};

impl Engine {
    /// Bookings currently occupying the resource, effective-status filtered:
    /// a pending booking past its grace window is absent even if no expiry
    /// write-back has landed yet.
    pub async fn list_active_bookings(
        &self,
        resource_id: Ulid,
    ) -> Result<Vec<BookingView>, EngineError> {
        let rs = match self.get_resource(&resource_id) {
            Some(rs) => rs,
            None => return Ok(vec![]),
        };
        let guard = rs.read().await;
        let now = now_ms();
        Ok(guard
            .bookings
            .iter()
            .filter(|b| b.is_active(now))
            .map(|b| BookingView::from_record(b, resource_id, now))
            .collect())
    }

    /// Every booking the actor has made, across all resources and statuses.
    pub async fn list_bookings_for_actor(&self, actor_id: Ulid) -> Vec<BookingView> {
        // Snapshot the Arcs first; never hold a DashMap shard across an await.
        let resources: Vec<SharedResourceState> =
            self.state.iter().map(|e| e.value().clone()).collect();

        let now = now_ms();
        let mut views = Vec::new();
        for rs in resources {
            let guard = rs.read().await;
            views.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| b.actor_id == actor_id)
                    .map(|b| BookingView::from_record(b, guard.id, now)),
            );
        }
        views.sort_by_key(|v| v.start);
        views
    }

    pub async fn get_booking(&self, booking_id: Ulid) -> Result<BookingView, EngineError> {
        let resource_id = self
            .resource_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        let record = guard
            .booking(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        Ok(BookingView::from_record(record, resource_id, now_ms()))
    }
}
