use std::sync::Arc;

use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::now_ms;
use super::{Engine, EngineError, WalCommand};

impl Engine {
    pub async fn create_court(&self, court: Court) -> Result<(), EngineError> {
        let _gate = self.gate.read().await;
        if self.courts.len() >= MAX_COURTS {
            return Err(EngineError::LimitExceeded("too many courts"));
        }
        if let Some(ref n) = court.name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("court name too long"));
        }
        if let Some(ref z) = court.zone
            && z.len() > MAX_ZONE_LEN
        {
            return Err(EngineError::LimitExceeded("zone name too long"));
        }
        if self.courts.contains_key(&court.id) {
            return Err(EngineError::AlreadyExists(court.id));
        }

        let event = Event::CourtCreated {
            id: court.id,
            name: court.name.clone(),
            zone: court.zone.clone(),
        };
        self.wal_append(&event).await?;
        self.courts.insert(court.id, court);
        Ok(())
    }

    /// Remove a court from the roster. Refused while anything on it still
    /// blocks: an active hold or a confirmed booking on any date.
    pub async fn delete_court(&self, id: Ulid) -> Result<(), EngineError> {
        // Exclusive: no acquire may slip a hold onto the court while we check.
        let _gate = self.gate.write().await;
        if !self.courts.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let now = now_ms();
        let days: Vec<_> = self
            .days
            .iter()
            .filter(|e| e.key().court_id == id)
            .map(|e| e.value().clone())
            .collect();
        for day in days {
            if day.read().await.has_blocking(now) {
                return Err(EngineError::CourtBusy(id));
            }
        }

        let event = Event::CourtDeleted { id };
        self.wal_append(&event).await?;
        self.forget_court(&id);
        Ok(())
    }

    /// Cancel a confirmed booking and free its slot. Cancelling twice is a no-op.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let _gate = self.gate.read().await;
        let (key, mut guard) = self.resolve_entry_write(&id).await?;
        let status = match guard.get_entry(&id).map(|e| &e.kind) {
            Some(EntryKind::Booking { status, .. }) => *status,
            Some(EntryKind::Hold { .. }) => {
                return Err(EngineError::InvalidRequest("not a booking"));
            }
            None => return Err(EngineError::NotFound(id)),
        };
        if status == BookingStatus::Confirmed {
            let event = Event::BookingCancelled { id, key };
            self.persist_and_apply(&mut guard, &event).await?;
        }
        guard
            .get_entry(&id)
            .and_then(|e| Booking::from_entry(&key, e))
            .ok_or(EngineError::NotFound(id))
    }

    /// Holds whose TTL ran out by `now`. Busy days are skipped and picked up next sweep.
    pub fn collect_expired_holds(&self, now: Ms) -> Vec<Ulid> {
        let mut expired = Vec::new();
        for entry in self.days.iter() {
            let day = entry.value().clone();
            if let Ok(guard) = day.try_read() {
                expired.extend(
                    guard
                        .entries
                        .iter()
                        .filter(|e| e.is_lapsed_hold(now))
                        .map(|e| e.id),
                );
            }
        }
        expired
    }

    /// Expire one hold if it is still lapsed once we hold its lock.
    /// `Ok(false)` means a renew, promote or release got there first.
    pub async fn expire_hold(&self, hold_id: Ulid, now: Ms) -> Result<bool, EngineError> {
        let _gate = self.gate.read().await;
        let (key, mut guard) = match self.resolve_entry_write(&hold_id).await {
            Ok(found) => found,
            Err(EngineError::NotFound(_) | EngineError::Expired(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let still_lapsed = guard
            .get_entry(&hold_id)
            .is_some_and(|e| e.is_lapsed_hold(now));
        if !still_lapsed {
            return Ok(false);
        }
        self.expire_entry(&mut guard, key, hold_id, now).await?;
        Ok(true)
    }

    /// Forget expiry tombstones older than the retention window.
    pub fn prune_tombstones(&self, now: Ms) -> usize {
        let before = self.tombstones.len();
        self.tombstones
            .retain(|_, (_, at)| now.saturating_sub(*at) < TOMBSTONE_RETENTION_MS);
        before.saturating_sub(self.tombstones.len())
    }

    /// Drop court days dated before today that no longer hold anything.
    /// Days someone is still using are kept for a later sweep.
    pub fn prune_empty_days(&self, now: Ms) -> usize {
        let today = self.facility.today(now);
        let before = self.days.len();
        self.days.retain(|key, day| {
            key.date >= today
                || Arc::strong_count(day) > 1
                || !day.try_read().is_ok_and(|d| d.entries.is_empty())
        });
        before.saturating_sub(self.days.len())
    }

    /// Rewrite the WAL with only the events needed to rebuild the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Exclusive: an event appended mid-snapshot would be lost by the swap.
        let _gate = self.gate.write().await;

        let mut courts: Vec<Court> = self.courts.iter().map(|e| e.value().clone()).collect();
        courts.sort_by_key(|c| c.id);
        let mut events: Vec<Event> = courts
            .into_iter()
            .map(|c| Event::CourtCreated {
                id: c.id,
                name: c.name,
                zone: c.zone,
            })
            .collect();

        let mut days: Vec<_> = self
            .days
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        days.sort_by_key(|(key, _)| *key);
        for (key, day) in days {
            let guard = day.read().await;
            for entry in &guard.entries {
                events.push(snapshot_event(key, entry));
            }
        }

        for tomb in self.tombstones.iter() {
            let (key, at) = *tomb.value();
            events.push(Event::HoldReleased {
                id: *tomb.key(),
                key,
                reason: ReleaseReason::Expired,
                at,
            });
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        tracing::info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
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
}

fn snapshot_event(key: SlotKey, entry: &Entry) -> Event {
    match &entry.kind {
        EntryKind::Hold {
            holder,
            ttl_ms,
            acquired_at,
            expires_at,
            price,
        } => Event::HoldAcquired {
            id: entry.id,
            key,
            range: entry.range,
            holder: holder.clone(),
            ttl_ms: *ttl_ms,
            acquired_at: *acquired_at,
            expires_at: *expires_at,
            price: *price,
        },
        EntryKind::Booking {
            customer,
            hold_id,
            confirmed_at,
            status,
            price,
        } => Event::BookingRestored {
            id: entry.id,
            hold_id: *hold_id,
            key,
            range: entry.range,
            customer: customer.clone(),
            confirmed_at: *confirmed_at,
            status: *status,
            price: *price,
        },
    }
}
