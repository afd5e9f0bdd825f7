use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

/// Background task that opportunistically writes back lapsed pending
/// bookings. Readers already observe those bookings as expired; this only
/// persists what they see, so a missed cycle costs nothing.
pub async fn run_reaper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64;
        for booking_id in engine.collect_lapsed(now) {
            match engine.mark_lapsed(booking_id).await {
                Ok(()) => info!("lapsed booking {booking_id} written back as expired"),
                Err(e) => {
                    // May have been rescheduled or canceled in the meantime
                    tracing::debug!("reaper skip {booking_id}: {e}");
                }
            }
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("WAL compacted after {appends} appends"),
            Err(e) => tracing::warn!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{InMemoryDirectory, InMemoryRenderer};
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("turnstile_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn now() -> Ms {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as Ms
    }

    #[tokio::test]
    async fn reaper_collects_and_writes_back_lapsed() {
        let directory = Arc::new(InMemoryDirectory::new());
        let engine = Arc::new(
            Engine::new(
                test_wal_path("reaper_collect.wal"),
                Arc::new(NotifyHub::new()),
                directory.clone(),
                Arc::new(InMemoryRenderer::new()),
                Policy::default(),
            )
            .unwrap(),
        );

        let rid = Ulid::new();
        directory.add(rid, "Pool", Ulid::new());

        // Booking whose start is already one grace window in the past
        let t = now();
        let start = t - Policy::default().grace_window_ms - 1000;
        let booking_id = engine
            .create_booking(Ulid::new(), rid, Span::new(start, start + 3_600_000))
            .await
            .unwrap();

        let lapsed = engine.collect_lapsed(t);
        assert_eq!(lapsed, vec![booking_id]);

        engine.mark_lapsed(booking_id).await.unwrap();
        assert_eq!(
            engine.get_booking(booking_id).await.unwrap().status,
            BookingStatus::Expired
        );

        // Written back — no longer a candidate
        assert!(engine.collect_lapsed(t).is_empty());
    }

    #[tokio::test]
    async fn mark_lapsed_rejects_unlapsed_booking() {
        let directory = Arc::new(InMemoryDirectory::new());
        let engine = Arc::new(
            Engine::new(
                test_wal_path("reaper_unlapsed.wal"),
                Arc::new(NotifyHub::new()),
                directory.clone(),
                Arc::new(InMemoryRenderer::new()),
                Policy::default(),
            )
            .unwrap(),
        );

        let rid = Ulid::new();
        directory.add(rid, "Gym", Ulid::new());

        let t = now();
        let booking_id = engine
            .create_booking(Ulid::new(), rid, Span::new(t + 3_600_000, t + 7_200_000))
            .await
            .unwrap();

        let result = engine.mark_lapsed(booking_id).await;
        assert!(matches!(
            result,
            Err(crate::engine::EngineError::InvalidTransition { .. })
        ));
    }
}
