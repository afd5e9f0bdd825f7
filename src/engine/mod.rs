mod conflict;
mod error;
mod mutations;
mod queries;

pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::directory::{ArtifactRenderer, ResourceDirectory};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        /// Append count the caller observed when it snapshotted state. If
        /// more appends landed since, the snapshot is stale and the swap
        /// must be refused or those events would be discarded.
        expected_appends: u64,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    #[cfg(test)]
    FailAppends(u32),
}

/// Background task that owns the WAL and batches appends for group commit:
/// block until an Append arrives, drain everything immediately available into
/// one batch, fsync once, answer all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush first so the non-append command sees a settled log
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty
                    }
                }

                flush_and_respond(&mut wal, batch);
                if let Some(cmd) = deferred {
                    handle_non_append(&mut wal, cmd);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, mut batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    let result = match append_err.or(flush_err) {
        Some(e) => Err(e),
        None => Ok(()),
    };

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact {
            events,
            expected_appends,
            response,
        } => {
            // An append processed after the caller's snapshot lives only in
            // the file this swap would discard. Refuse; the next compaction
            // cycle retries with a fresh snapshot.
            let result = if wal.appends_since_compact() != expected_appends {
                Err(io::Error::other("appends raced the compaction snapshot"))
            } else {
                Wal::write_compact_file(wal.path(), &events)
                    .and_then(|()| wal.swap_compact_file())
            };
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        #[cfg(test)]
        WalCommand::FailAppends(n) => wal.set_fail_appends(n),
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// Append through the group-commit writer. A failed append is retried once
/// after a short backoff (transient fsync hiccups), then surfaces as
/// `Unavailable` with nothing applied.
pub(super) async fn append_with_retry(
    wal_tx: &mpsc::Sender<WalCommand>,
    event: &Event,
) -> Result<(), EngineError> {
    match append_once(wal_tx, event).await {
        Ok(()) => Ok(()),
        Err(first) => {
            tracing::warn!("WAL append failed, retrying once: {first}");
            tokio::time::sleep(Duration::from_millis(50)).await;
            append_once(wal_tx, event)
                .await
                .map_err(EngineError::Unavailable)
        }
    }
}

async fn append_once(wal_tx: &mpsc::Sender<WalCommand>, event: &Event) -> Result<(), String> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append {
            event: event.clone(),
            response: tx,
        })
        .await
        .map_err(|_| "WAL writer shut down".to_string())?;
    rx.await
        .map_err(|_| "WAL writer dropped response".to_string())?
        .map_err(|e| e.to_string())
}

/// Fire-and-forget artifact release: failure is logged and counted, never
/// retried.
pub(super) fn release_artifact_later(renderer: Arc<dyn ArtifactRenderer>, artifact: ArtifactRef) {
    tokio::spawn(async move {
        if !renderer.release(&artifact).await {
            metrics::counter!(crate::observability::ARTIFACT_RELEASE_FAILURES_TOTAL).increment(1);
            tracing::warn!("failed to release artifact {}", artifact.as_str());
        }
    });
}

/// The reservation engine. Sole writer of booking status, span, and token:
/// every mutation runs under the owning resource's write lock, so the
/// availability check and the write it justifies are one atomic unit.
/// Distinct resources proceed fully in parallel.
pub struct Engine {
    pub state: Arc<DashMap<Ulid, SharedResourceState>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) directory: Arc<dyn ResourceDirectory>,
    pub(super) artifacts: Arc<dyn ArtifactRenderer>,
    pub(super) policy: Policy,
    /// Reverse lookup: booking id → resource id
    pub(super) booking_index: Arc<DashMap<Ulid, Ulid>>,
}

/// Apply an event directly to a ResourceState (no locking — caller holds the lock).
fn apply_to_resource(rs: &mut ResourceState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::BookingCreated {
            id,
            resource_id,
            actor_id,
            span,
            expires_at,
            token,
        } => {
            rs.insert_booking(BookingRecord {
                id: *id,
                actor_id: *actor_id,
                span: *span,
                status: BookingStatus::Pending,
                token: token.clone(),
                expires_at: *expires_at,
            });
            index.insert(*id, *resource_id);
        }
        Event::BookingRescheduled {
            id,
            span,
            expires_at,
            token,
            ..
        } => {
            // Remove and reinsert to keep the list sorted by span.start.
            if let Some(mut record) = rs.remove_booking(*id) {
                record.span = *span;
                record.expires_at = *expires_at;
                record.token = token.clone();
                rs.insert_booking(record);
            }
        }
        Event::BookingConfirmed { id, .. } => {
            if let Some(record) = rs.booking_mut(*id) {
                record.status = BookingStatus::Confirmed;
            }
        }
        Event::BookingCheckedIn { id, .. } => {
            if let Some(record) = rs.booking_mut(*id) {
                record.status = BookingStatus::CheckedIn;
            }
        }
        Event::BookingCanceled { id, .. } => {
            if let Some(record) = rs.booking_mut(*id) {
                record.status = BookingStatus::Canceled;
            }
        }
        Event::BookingLapsed { id, .. } => {
            if let Some(record) = rs.booking_mut(*id) {
                record.status = BookingStatus::Expired;
            }
        }
        Event::BookingDeleted { id, .. } => {
            rs.remove_booking(*id);
            index.remove(id);
        }
        // Purge is handled at the DashMap level, not here
        Event::ResourcePurged { .. } => {}
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        directory: Arc<dyn ResourceDirectory>,
        artifacts: Arc<dyn ArtifactRenderer>,
        policy: Policy,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: Arc::new(DashMap::new()),
            wal_tx,
            notify,
            directory,
            artifacts,
            policy,
            booking_index: Arc::new(DashMap::new()),
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly. Never use blocking_write here because
        // this may run inside an async context.
        for event in &events {
            match event {
                Event::ResourcePurged { resource_id } => {
                    if let Some((_, rs)) = engine.state.remove(resource_id) {
                        let guard = rs.try_read().expect("replay: uncontended read");
                        for record in &guard.bookings {
                            engine.booking_index.remove(&record.id);
                        }
                    }
                }
                other => {
                    let resource_id = event_resource_id(other);
                    let rs_arc = engine
                        .state
                        .entry(resource_id)
                        .or_insert_with(|| Arc::new(RwLock::new(ResourceState::new(resource_id))))
                        .clone();
                    let mut guard = rs_arc.try_write().expect("replay: uncontended write");
                    apply_to_resource(&mut guard, other, &engine.booking_index);
                }
            }
        }

        Ok(engine)
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    /// Resource state for `id`, created on first use. Callers verify catalog
    /// existence with the directory before inserting.
    pub(super) fn get_or_create_resource(&self, id: Ulid) -> SharedResourceState {
        self.state
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(ResourceState::new(id))))
            .clone()
    }

    /// Whether `rs` is still the state registered for `resource_id`. A purge
    /// can race in between the map lookup and the lock acquisition; a
    /// detached state must never accept writes, or they would land behind
    /// the purge event in the log and resurrect on replay.
    pub(super) fn still_live(&self, resource_id: Ulid, rs: &SharedResourceState) -> bool {
        self.state
            .get(&resource_id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), rs))
    }

    pub fn resource_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_index.get(booking_id).map(|e| *e.value())
    }

    /// Durably append `event`, apply it to the locked resource, and notify,
    /// as one non-cancellable unit. The work runs on a spawned task that
    /// owns the write guard: once a mutation is scheduled it fully commits
    /// (log, memory, notification) or fully rolls back, even if the
    /// requesting future is dropped mid-await — the log and memory never
    /// diverge and no artifact is left dangling. `release_on_ok` /
    /// `release_on_err` carry the artifact whose lifetime hangs on the
    /// outcome.
    pub(super) async fn persist_and_apply(
        &self,
        resource_id: Ulid,
        mut guard: tokio::sync::OwnedRwLockWriteGuard<ResourceState>,
        event: Event,
        release_on_ok: Option<ArtifactRef>,
        release_on_err: Option<ArtifactRef>,
    ) -> Result<(), EngineError> {
        let wal_tx = self.wal_tx.clone();
        let notify = self.notify.clone();
        let index = self.booking_index.clone();
        let renderer = self.artifacts.clone();
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let outcome = match append_with_retry(&wal_tx, &event).await {
                Ok(()) => {
                    apply_to_resource(&mut guard, &event, &index);
                    notify.send(resource_id, &event);
                    if let Some(artifact) = release_on_ok {
                        release_artifact_later(renderer, artifact);
                    }
                    Ok(())
                }
                Err(e) => {
                    if let Some(artifact) = release_on_err {
                        release_artifact_later(renderer, artifact);
                    }
                    Err(e)
                }
            };
            drop(guard);
            let _ = done_tx.send(outcome);
        });
        done_rx
            .await
            .unwrap_or_else(|_| Err(EngineError::Unavailable("commit task dropped".into())))
    }

    /// Lookup booking → resource, get resource, acquire write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<ResourceState>), EngineError> {
        let resource_id = self
            .resource_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.write_owned().await;
        Ok((resource_id, guard))
    }
}

/// Extract the resource_id from an event.
fn event_resource_id(event: &Event) -> Ulid {
    match event {
        Event::BookingCreated { resource_id, .. }
        | Event::BookingRescheduled { resource_id, .. }
        | Event::BookingConfirmed { resource_id, .. }
        | Event::BookingCheckedIn { resource_id, .. }
        | Event::BookingCanceled { resource_id, .. }
        | Event::BookingLapsed { resource_id, .. }
        | Event::BookingDeleted { resource_id, .. }
        | Event::ResourcePurged { resource_id } => *resource_id,
    }
}
