mod availability;
mod conflict;
mod error;
mod holds;
mod mutations;
mod queries;

pub use availability::{fits, free_on_all, free_ranges, merge_overlapping, subtract_ranges};
pub use error::EngineError;
pub use holds::HoldRequest;
pub use queries::BookingFilter;

pub(crate) use conflict::now_ms;

use std::collections::{HashMap, HashSet};
use std::io;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::config::Facility;
use crate::limits::DEFAULT_HOLD_TTL_MS;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::pricing::PriceTable;
use crate::wal::Wal;

pub type SharedCourtDay = Arc<RwLock<CourtDay>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    /// Stop after everything queued ahead of it. Later sends fail.
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. Buffer the batch and fsync once.
/// 4. Answer every sender with the shared result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                if handle_non_append(&mut wal, other).is_break() {
                    return;
                }
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    // Flush what we have before compaction or stats see the log.
                    deferred = Some(other);
                    break;
                }
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(other) = deferred
            && handle_non_append(&mut wal, other).is_break()
        {
            return;
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush of {} events failed: {e}", batch.len());
    }
    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so stray bytes never leak into the next batch.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) -> ControlFlow<()> {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
        WalCommand::Shutdown { response } => {
            tracing::info!("WAL writer stopped");
            let _ = response.send(());
            return ControlFlow::Break(());
        }
    }
    ControlFlow::Continue(())
}

/// The reservation store: per-(court, date) state behind its own lock, plus
/// the indexes that route a hold or booking id back to its court day.
pub struct Engine {
    pub(super) days: DashMap<SlotKey, SharedCourtDay>,
    pub(super) courts: DashMap<Ulid, Court>,
    /// Hold or booking id → the court day that holds it.
    pub(super) entry_index: DashMap<Ulid, SlotKey>,
    /// Holder → ids of their current holds (their cart).
    pub(super) holder_index: DashMap<HolderId, HashSet<Ulid>>,
    /// Recently expired hold ids, so late renew/promote answer `Expired`.
    pub(super) tombstones: DashMap<Ulid, (SlotKey, Ms)>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations share it, compaction and court deletion take it exclusively.
    pub(super) gate: RwLock<()>,
    pub facility: Facility,
    pub default_ttl_ms: Ms,
    pub(super) pricing: PriceTable,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, facility: Facility) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            days: DashMap::new(),
            courts: DashMap::new(),
            entry_index: DashMap::new(),
            holder_index: DashMap::new(),
            tombstones: DashMap::new(),
            wal_tx,
            gate: RwLock::new(()),
            facility,
            default_ttl_ms: DEFAULT_HOLD_TTL_MS,
            pricing: PriceTable::default(),
            notify,
        };

        for event in &events {
            engine.replay(event)?;
        }
        tracing::info!(
            "replayed {} events: {} courts, {} live entries",
            events.len(),
            engine.courts.len(),
            engine.entry_index.len()
        );

        Ok(engine)
    }

    /// Default TTL for requests that do not carry their own.
    pub fn with_default_ttl(mut self, ttl_ms: Ms) -> Self {
        self.default_ttl_ms = ttl_ms;
        self
    }

    /// Price list used to quote new holds. Holds already taken keep their price.
    pub fn with_pricing(mut self, pricing: PriceTable) -> Self {
        self.pricing = pricing;
        self
    }

    /// Stop the WAL writer once everything queued before this call is on disk.
    /// Mutations after it fail with `WalError`.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.wal_tx.send(WalCommand::Shutdown { response: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }

    fn replay(&self, event: &Event) -> io::Result<()> {
        match event {
            Event::CourtCreated { id, name, zone } => {
                self.courts.insert(
                    *id,
                    Court {
                        id: *id,
                        name: name.clone(),
                        zone: zone.clone(),
                    },
                );
            }
            Event::CourtDeleted { id } => self.forget_court(id),
            Event::Batch { events } => {
                for event in events {
                    self.replay(event)?;
                }
            }
            other => {
                let Some(key) = other.key() else {
                    return Ok(());
                };
                // Nothing else can see these locks yet, so try_write always succeeds.
                // Never block here: construction may happen inside a runtime.
                let day = self.day_or_create(key);
                let mut guard = day
                    .try_write()
                    .map_err(|_| io::Error::other(format!("replay: court day {key} is locked")))?;
                self.apply_to_day(&mut guard, other);
            }
        }
        Ok(())
    }

    /// Apply an event to a court day (no locking, the caller holds the lock).
    pub(super) fn apply_to_day(&self, day: &mut CourtDay, event: &Event) {
        match event {
            Event::HoldAcquired {
                id,
                key,
                range,
                holder,
                ttl_ms,
                acquired_at,
                expires_at,
                price,
            } => {
                day.insert_entry(Entry {
                    id: *id,
                    range: *range,
                    kind: EntryKind::Hold {
                        holder: holder.clone(),
                        ttl_ms: *ttl_ms,
                        acquired_at: *acquired_at,
                        expires_at: *expires_at,
                        price: *price,
                    },
                });
                self.entry_index.insert(*id, *key);
                self.holder_index
                    .entry(holder.clone())
                    .or_default()
                    .insert(*id);
            }
            Event::HoldRenewed { id, expires_at, .. } => {
                if let Some(Entry {
                    kind: EntryKind::Hold { expires_at: at, .. },
                    ..
                }) = day.get_entry_mut(id)
                {
                    *at = *expires_at;
                }
            }
            Event::HoldReleased { id, key, reason, at } => {
                // Tombstone first: an id claim that finds the index vacant must see it.
                if *reason == ReleaseReason::Expired {
                    self.tombstones.insert(*id, (*key, *at));
                }
                if let Some(entry) = day.remove_entry(id) {
                    self.unindex_hold(entry.owner(), id);
                }
                self.entry_index.remove(id);
            }
            Event::HoldPromoted {
                hold_id,
                booking_id,
                key,
                confirmed_at,
            } => {
                let Some(hold) = day.remove_entry(hold_id) else {
                    return;
                };
                self.entry_index.remove(hold_id);
                self.unindex_hold(hold.owner(), hold_id);
                day.insert_entry(Entry {
                    id: *booking_id,
                    range: hold.range,
                    kind: EntryKind::Booking {
                        customer: hold.owner().to_string(),
                        hold_id: *hold_id,
                        confirmed_at: *confirmed_at,
                        status: BookingStatus::Confirmed,
                        price: hold.price(),
                    },
                });
                self.entry_index.insert(*booking_id, *key);
            }
            Event::BookingCancelled { id, .. } => {
                if let Some(Entry {
                    kind: EntryKind::Booking { status, .. },
                    ..
                }) = day.get_entry_mut(id)
                {
                    *status = BookingStatus::Cancelled;
                }
            }
            Event::BookingRestored {
                id,
                hold_id,
                key,
                range,
                customer,
                confirmed_at,
                status,
                price,
            } => {
                day.insert_entry(Entry {
                    id: *id,
                    range: *range,
                    kind: EntryKind::Booking {
                        customer: customer.clone(),
                        hold_id: *hold_id,
                        confirmed_at: *confirmed_at,
                        status: *status,
                        price: *price,
                    },
                });
                self.entry_index.insert(*id, *key);
            }
            // The roster lives at the engine level, not inside a court day.
            // Batches span days and are split by the caller.
            Event::CourtCreated { .. } | Event::CourtDeleted { .. } | Event::Batch { .. } => {}
        }
    }

    fn unindex_hold(&self, holder: &str, id: &Ulid) {
        if let Some(mut ids) = self.holder_index.get_mut(holder) {
            ids.remove(id);
        }
        self.holder_index.remove_if(holder, |_, ids| ids.is_empty());
    }

    /// Drop a court and everything recorded against it.
    pub(super) fn forget_court(&self, court_id: &Ulid) {
        let keys: Vec<SlotKey> = self
            .days
            .iter()
            .filter(|e| e.key().court_id == *court_id)
            .map(|e| *e.key())
            .collect();
        for key in keys {
            let Some((_, day)) = self.days.remove(&key) else {
                continue;
            };
            if let Ok(day) = day.try_read() {
                for entry in &day.entries {
                    self.entry_index.remove(&entry.id);
                    if entry.is_hold() {
                        self.unindex_hold(entry.owner(), &entry.id);
                    }
                }
            }
        }
        self.tombstones.retain(|_, (key, _)| key.court_id != *court_id);
        self.courts.remove(court_id);
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_day(&self, key: &SlotKey) -> Option<SharedCourtDay> {
        self.days.get(key).map(|e| e.value().clone())
    }

    pub(super) fn day_or_create(&self, key: SlotKey) -> SharedCourtDay {
        if let Some(day) = self.days.get(&key) {
            return day.value().clone();
        }
        self.days
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(CourtDay::new(key))))
            .value()
            .clone()
    }

    /// WAL-append + apply + notify the owning holder, in that order.
    pub(super) async fn persist_and_apply(
        &self,
        day: &mut CourtDay,
        event: &Event,
    ) -> Result<(), EngineError> {
        let owner = event_owner(day, event);
        self.wal_append(event).await?;
        self.apply_to_day(day, event);
        crate::observability::record_event(event);
        if let Some(owner) = owner {
            self.notify.send(&owner, event);
        }
        Ok(())
    }

    /// `persist_and_apply` for a write made of several events, possibly on
    /// several days. One WAL record carries all of them, so a failed append
    /// leaves every day untouched. Each event's day must be in `days`.
    pub(super) async fn persist_and_apply_batch(
        &self,
        days: &mut HashMap<SlotKey, OwnedRwLockWriteGuard<CourtDay>>,
        events: Vec<Event>,
    ) -> Result<(), EngineError> {
        let mut owners = Vec::with_capacity(events.len());
        for event in &events {
            let day = event
                .key()
                .and_then(|key| days.get(&key))
                .ok_or(EngineError::InvalidRequest("batched event outside locked days"))?;
            owners.push(event_owner(day, event));
        }
        let record = match events.as_slice() {
            [] => return Ok(()),
            [single] => single.clone(),
            _ => Event::Batch {
                events: events.clone(),
            },
        };
        self.wal_append(&record).await?;
        for (event, owner) in events.iter().zip(owners) {
            if let Some(day) = event.key().and_then(|key| days.get_mut(&key)) {
                self.apply_to_day(day, event);
            }
            crate::observability::record_event(event);
            if let Some(owner) = owner {
                self.notify.send(&owner, event);
            }
        }
        Ok(())
    }

    /// Lookup entry → court day, acquire its write lock, and check the entry is still there.
    pub(super) async fn resolve_entry_write(
        &self,
        id: &Ulid,
    ) -> Result<(SlotKey, OwnedRwLockWriteGuard<CourtDay>), EngineError> {
        let key = self
            .entry_index
            .get(id)
            .map(|e| *e.value())
            .ok_or_else(|| self.missing(id))?;
        let day = self.get_day(&key).ok_or_else(|| self.missing(id))?;
        let guard = day.write_owned().await;
        if guard.get_entry(id).is_none() {
            // Removed while we waited for the lock.
            return Err(self.missing(id));
        }
        Ok((key, guard))
    }

    /// Error for an id that is no longer in the store.
    pub(super) fn missing(&self, id: &Ulid) -> EngineError {
        if self.tombstones.contains_key(id) {
            EngineError::Expired(*id)
        } else {
            EngineError::NotFound(*id)
        }
    }
}

/// Holder or customer an event should be delivered to. Looked up before apply,
/// because releases and promotions remove the entry that names them.
fn event_owner(day: &CourtDay, event: &Event) -> Option<String> {
    match event {
        Event::HoldAcquired { holder, .. } => Some(holder.clone()),
        Event::BookingRestored { customer, .. } => Some(customer.clone()),
        Event::HoldRenewed { id, .. }
        | Event::HoldReleased { id, .. }
        | Event::BookingCancelled { id, .. }
        | Event::HoldPromoted { hold_id: id, .. } => {
            day.get_entry(id).map(|e| e.owner().to_string())
        }
        Event::CourtCreated { .. } | Event::CourtDeleted { .. } | Event::Batch { .. } => None,
    }
}
