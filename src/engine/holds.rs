use std::collections::{HashMap, HashSet};

use chrono::{Days, NaiveDate};
use tokio::sync::OwnedRwLockWriteGuard;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{
    find_conflict, intra_batch_conflict, lapsed_overlapping, now_ms, validate_holder,
    validate_request, validate_ttl,
};
use super::{Engine, EngineError};

/// One slot a holder wants: court, date and range, under a caller-chosen id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoldRequest {
    pub id: Ulid,
    pub court_id: Ulid,
    pub date: NaiveDate,
    pub range: TimeRange,
}

impl HoldRequest {
    pub fn new(id: Ulid, court_id: Ulid, date: NaiveDate, range: TimeRange) -> Self {
        Self {
            id,
            court_id,
            date,
            range,
        }
    }

    pub fn key(&self) -> SlotKey {
        SlotKey::new(self.court_id, self.date)
    }
}

impl Engine {
    pub async fn acquire(
        &self,
        request: HoldRequest,
        holder: &str,
        ttl_ms: Option<Ms>,
    ) -> Result<Hold, EngineError> {
        let _gate = self.gate.read().await;
        let mut holds = self.acquire_batch(holder, ttl_ms, vec![request]).await?;
        holds.pop().ok_or(EngineError::NotFound(request.id))
    }

    /// Acquire a whole cart at once. All-or-nothing: if any slot conflicts
    /// (with the store or with another request in the batch) nothing is held.
    pub async fn acquire_many(
        &self,
        holder: &str,
        ttl_ms: Option<Ms>,
        requests: Vec<HoldRequest>,
    ) -> Result<Vec<Hold>, EngineError> {
        let _gate = self.gate.read().await;
        self.acquire_batch(holder, ttl_ms, requests).await
    }

    /// "Fixed court": the same court and time on `weeks` consecutive weekly dates.
    /// Ids after the first are derived by incrementing `request.id`.
    pub async fn acquire_recurring(
        &self,
        request: HoldRequest,
        holder: &str,
        weeks: u32,
        ttl_ms: Option<Ms>,
    ) -> Result<Vec<Hold>, EngineError> {
        let dates = weekly_dates(request.date, weeks)?;
        let mut requests = Vec::with_capacity(dates.len());
        let mut id = request.id;
        for (week, date) in dates.into_iter().enumerate() {
            if week > 0 {
                id = id
                    .increment()
                    .ok_or(EngineError::InvalidRequest("hold id cannot be incremented"))?;
            }
            requests.push(HoldRequest { id, date, ..request });
        }

        let _gate = self.gate.read().await;
        self.acquire_batch(holder, ttl_ms, requests).await
    }

    async fn acquire_batch(
        &self,
        holder: &str,
        ttl_ms: Option<Ms>,
        requests: Vec<HoldRequest>,
    ) -> Result<Vec<Hold>, EngineError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        if requests.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        let now = now_ms();
        let ttl_ms = ttl_ms.unwrap_or(self.default_ttl_ms);
        validate_ttl(ttl_ms)?;
        validate_holder(holder)?;
        let mut claims = Claims::new(self);
        for request in &requests {
            self.validate_hold_request(request, now, &mut claims)?;
        }
        claims.reserve_quota(holder)?;

        // Acquire write locks in sorted order to prevent deadlocks.
        let mut guards = self.lock_days(requests.iter().map(HoldRequest::key)).await;

        // Phase 1: validate every request against current state and each other.
        let mut added: HashMap<SlotKey, usize> = HashMap::new();
        for request in &requests {
            *added.entry(request.key()).or_default() += 1;
        }
        for (key, count) in &added {
            if guards[key].entries.len() + count > MAX_ENTRIES_PER_DAY {
                return Err(EngineError::LimitExceeded("too many entries on court day"));
            }
        }
        for request in &requests {
            if let Some(blocking) = find_conflict(&guards[&request.key()], &request.range, now) {
                metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
                return Err(EngineError::Conflict(blocking));
            }
        }
        let shapes: Vec<_> = requests.iter().map(|r| (r.key(), r.range, r.id)).collect();
        if let Some(id) = intra_batch_conflict(&shapes) {
            metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::Conflict(id));
        }

        // Phase 2: lapsed holds in the way go out with the new ones, in one record.
        let mut events = Vec::with_capacity(requests.len());
        let mut lapsed = HashSet::new();
        for request in &requests {
            let key = request.key();
            for id in lapsed_overlapping(&guards[&key], &request.range, now) {
                if lapsed.insert(id) {
                    events.push(expiry(key, id, now));
                }
            }
        }
        for request in &requests {
            let price = self.price_for(request.court_id, request.date, request.range);
            events.push(hold_acquired(request, holder, ttl_ms, now, price));
        }
        self.persist_and_apply_batch(&mut guards, events).await?;
        claims.commit();

        requests
            .iter()
            .map(|request| {
                let key = request.key();
                Hold::from_entry(&key, guard_entry(&guards[&key], &request.id)?)
                    .ok_or(EngineError::NotFound(request.id))
            })
            .collect()
    }

    /// Push expiry out to `now + ttl`. A hold whose TTL already ran out is
    /// expired instead, and `Expired` is returned.
    pub async fn renew(&self, hold_id: Ulid) -> Result<Hold, EngineError> {
        let _gate = self.gate.read().await;
        let now = now_ms();
        let (key, mut guard) = self.resolve_entry_write(&hold_id).await?;
        let (ttl_ms, expires_at) = match &guard_entry(&guard, &hold_id)?.kind {
            EntryKind::Hold {
                ttl_ms, expires_at, ..
            } => (*ttl_ms, *expires_at),
            EntryKind::Booking { .. } => {
                return Err(EngineError::InvalidRequest("a booking cannot be renewed"));
            }
        };
        if expires_at <= now {
            self.expire_entry(&mut guard, key, hold_id, now).await?;
            return Err(EngineError::Expired(hold_id));
        }

        let event = Event::HoldRenewed {
            id: hold_id,
            key,
            expires_at: now + ttl_ms,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Hold::from_entry(&key, guard_entry(&guard, &hold_id)?).ok_or(EngineError::NotFound(hold_id))
    }

    /// Drop a hold early. Idempotent: `Ok(false)` when there is no such hold.
    pub async fn release(&self, hold_id: Ulid) -> Result<bool, EngineError> {
        let _gate = self.gate.read().await;
        self.release_inner(hold_id, now_ms()).await
    }

    /// Empty a holder's cart. Returns how many holds were released.
    pub async fn release_all(&self, holder: &str) -> Result<usize, EngineError> {
        let _gate = self.gate.read().await;
        let now = now_ms();
        let mut released = 0;
        for id in self.holder_hold_ids(holder) {
            if self.release_inner(id, now).await? {
                released += 1;
            }
        }
        Ok(released)
    }

    async fn release_inner(&self, hold_id: Ulid, now: Ms) -> Result<bool, EngineError> {
        let (key, mut guard) = match self.resolve_entry_write(&hold_id).await {
            Ok(found) => found,
            Err(EngineError::NotFound(_) | EngineError::Expired(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if !guard_entry(&guard, &hold_id)?.is_hold() {
            return Ok(false);
        }
        let event = Event::HoldReleased {
            id: hold_id,
            key,
            reason: ReleaseReason::Released,
            at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(true)
    }

    /// Convert a still-active hold into a confirmed booking under `booking_id`.
    pub async fn promote(&self, hold_id: Ulid, booking_id: Ulid) -> Result<Booking, EngineError> {
        let _gate = self.gate.read().await;
        let now = now_ms();
        let (key, mut guard) = self.resolve_entry_write(&hold_id).await?;
        let mut claims = Claims::new(self);
        claims.claim_id(booking_id, key)?;
        let booking = self
            .promote_locked(&mut guard, key, hold_id, booking_id, now)
            .await?;
        claims.commit();
        Ok(booking)
    }

    /// Checkout: promote every hold in the holder's cart, or none of them.
    /// Lapsed holds are expired and the first one is reported as `Expired`.
    pub async fn promote_all(&self, holder: &str) -> Result<Vec<Booking>, EngineError> {
        let _gate = self.gate.read().await;
        let now = now_ms();
        let mut hold_ids = self.holder_hold_ids(holder);
        if hold_ids.is_empty() {
            return Ok(Vec::new());
        }
        hold_ids.sort();

        let located: Vec<(Ulid, SlotKey)> = hold_ids
            .iter()
            .filter_map(|id| self.entry_index.get(id).map(|k| (*id, *k.value())))
            .collect();
        let mut guards = self.lock_days(located.iter().map(|(_, key)| *key)).await;

        // Phase 1: every hold must still be live. Expire the lapsed ones.
        let mut lapsed = Vec::new();
        let mut live = Vec::new();
        for (id, key) in &located {
            let Some(entry) = guards.get(key).and_then(|g| g.get_entry(id)) else {
                continue; // released or reaped while we were locking
            };
            if entry.is_lapsed_hold(now) {
                lapsed.push((*id, *key));
            } else if entry.is_hold() {
                live.push((*id, *key));
            }
        }
        if let Some((first, _)) = lapsed.first().copied() {
            let events = lapsed.iter().map(|(id, key)| expiry(*key, *id, now)).collect();
            self.persist_and_apply_batch(&mut guards, events).await?;
            return Err(EngineError::Expired(first));
        }

        // Phase 2: the whole cart in one record.
        let mut claims = Claims::new(self);
        let mut promoted = Vec::with_capacity(live.len());
        let mut events = Vec::with_capacity(live.len());
        for (hold_id, key) in live {
            let booking_id = Ulid::new();
            claims.claim_id(booking_id, key)?;
            promoted.push((booking_id, key));
            events.push(Event::HoldPromoted {
                hold_id,
                booking_id,
                key,
                confirmed_at: now,
            });
        }
        self.persist_and_apply_batch(&mut guards, events).await?;
        claims.commit();

        Ok(promoted
            .iter()
            .filter_map(|(id, key)| {
                guards
                    .get(key)
                    .and_then(|g| g.get_entry(id))
                    .and_then(|e| Booking::from_entry(key, e))
            })
            .collect())
    }

    async fn promote_locked(
        &self,
        day: &mut CourtDay,
        key: SlotKey,
        hold_id: Ulid,
        booking_id: Ulid,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        let entry = day.get_entry(&hold_id).ok_or_else(|| self.missing(&hold_id))?;
        if !entry.is_hold() {
            return Err(EngineError::InvalidRequest("already a booking"));
        }
        if entry.is_lapsed_hold(now) {
            self.expire_entry(day, key, hold_id, now).await?;
            return Err(EngineError::Expired(hold_id));
        }

        let event = Event::HoldPromoted {
            hold_id,
            booking_id,
            key,
            confirmed_at: now,
        };
        self.persist_and_apply(day, &event).await?;
        day.get_entry(&booking_id)
            .and_then(|e| Booking::from_entry(&key, e))
            .ok_or(EngineError::NotFound(booking_id))
    }

    // ── Shared helpers ───────────────────────────────────────────

    /// Court, id and calendar checks for one request. The id is claimed on success.
    fn validate_hold_request(
        &self,
        request: &HoldRequest,
        now: Ms,
        claims: &mut Claims<'_>,
    ) -> Result<(), EngineError> {
        if !self.courts.contains_key(&request.court_id) {
            return Err(EngineError::NotFound(request.court_id));
        }
        claims.claim_id(request.id, request.key())?;
        validate_request(&self.facility, &request.key(), &request.range, now)
    }

    pub(super) fn holder_hold_ids(&self, holder: &str) -> Vec<Ulid> {
        self.holder_index
            .get(holder)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Write-lock each distinct key once, in sorted order.
    pub(super) async fn lock_days(
        &self,
        keys: impl Iterator<Item = SlotKey>,
    ) -> HashMap<SlotKey, OwnedRwLockWriteGuard<CourtDay>> {
        let mut keys: Vec<SlotKey> = keys.collect();
        keys.sort();
        keys.dedup();
        let mut guards = HashMap::with_capacity(keys.len());
        for key in keys {
            let guard = self.day_or_create(key).write_owned().await;
            guards.insert(key, guard);
        }
        guards
    }

    pub(super) async fn expire_entry(
        &self,
        day: &mut CourtDay,
        key: SlotKey,
        hold_id: Ulid,
        now: Ms,
    ) -> Result<(), EngineError> {
        self.persist_and_apply(day, &expiry(key, hold_id, now)).await
    }
}

/// Ids and quota taken ahead of a write. Dropped before `commit`, it gives them back.
struct Claims<'a> {
    engine: &'a Engine,
    ids: Vec<Ulid>,
    holder: Option<String>,
    committed: bool,
}

impl<'a> Claims<'a> {
    fn new(engine: &'a Engine) -> Self {
        Self {
            engine,
            ids: Vec::new(),
            holder: None,
            committed: false,
        }
    }

    /// Route `id` to `key` unless a live entry or a fresh tombstone already uses it.
    fn claim_id(&mut self, id: Ulid, key: SlotKey) -> Result<(), EngineError> {
        match self.engine.entry_index.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(EngineError::AlreadyExists(id));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(key);
            }
        }
        self.ids.push(id);
        // Expiry writes the tombstone before it drops the index entry.
        if self.engine.tombstones.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        Ok(())
    }

    /// Count every claimed id against `holder`'s cart.
    fn reserve_quota(&mut self, holder: &str) -> Result<(), EngineError> {
        let mut held = self.engine.holder_index.entry(holder.to_string()).or_default();
        if held.len() + self.ids.len() > MAX_HOLDS_PER_HOLDER {
            drop(held);
            self.engine
                .holder_index
                .remove_if(holder, |_, ids| ids.is_empty());
            return Err(EngineError::LimitExceeded("too many holds for holder"));
        }
        held.extend(self.ids.iter().copied());
        drop(held);
        self.holder = Some(holder.to_string());
        Ok(())
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Claims<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for id in &self.ids {
            self.engine.entry_index.remove(id);
            if let Some(holder) = &self.holder {
                self.engine.unindex_hold(holder, id);
            }
        }
    }
}

/// `weeks` dates seven days apart, starting at `first`.
pub(super) fn weekly_dates(first: NaiveDate, weeks: u32) -> Result<Vec<NaiveDate>, EngineError> {
    if weeks == 0 {
        return Err(EngineError::InvalidRequest("weeks must be positive"));
    }
    if weeks > MAX_RECURRING_WEEKS {
        return Err(EngineError::LimitExceeded("too many recurring weeks"));
    }
    (0..weeks)
        .map(|week| {
            first
                .checked_add_days(Days::new(7 * u64::from(week)))
                .ok_or(EngineError::InvalidRequest("date out of range"))
        })
        .collect()
}

fn expiry(key: SlotKey, id: Ulid, now: Ms) -> Event {
    Event::HoldReleased {
        id,
        key,
        reason: ReleaseReason::Expired,
        at: now,
    }
}

fn hold_acquired(request: &HoldRequest, holder: &str, ttl_ms: Ms, now: Ms, price: Price) -> Event {
    Event::HoldAcquired {
        id: request.id,
        key: request.key(),
        range: request.range,
        holder: holder.to_string(),
        ttl_ms,
        acquired_at: now,
        expires_at: now + ttl_ms,
        price,
    }
}

fn guard_entry<'a>(day: &'a CourtDay, id: &Ulid) -> Result<&'a Entry, EngineError> {
    day.get_entry(id).ok_or(EngineError::NotFound(*id))
}
