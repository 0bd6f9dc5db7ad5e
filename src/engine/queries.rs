use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;
use crate::pricing::PriceSegment;

use super::availability::{fits, free_on_all, free_ranges};
use super::conflict::{find_conflict, now_ms, validate_window};
use super::holds::weekly_dates;
use super::{Engine, EngineError};

/// Filter for booking listings. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub court_id: Option<Ulid>,
    pub date: Option<NaiveDate>,
    pub customer_id: Option<String>,
    pub include_cancelled: bool,
}

impl Engine {
    /// True if an active hold or confirmed booking overlaps `range` on that court and date.
    pub async fn has_conflict(&self, court_id: Ulid, date: NaiveDate, range: TimeRange) -> bool {
        let Some(day) = self.get_day(&SlotKey::new(court_id, date)) else {
            return false;
        };
        let guard = day.read().await;
        find_conflict(&guard, &range, now_ms()).is_some()
    }

    pub async fn get_hold(&self, id: Ulid) -> Option<Hold> {
        let key = self.entry_index.get(&id).map(|e| *e.value())?;
        let day = self.get_day(&key)?;
        let guard = day.read().await;
        guard.get_entry(&id).and_then(|e| Hold::from_entry(&key, e))
    }

    pub async fn get_booking(&self, id: Ulid) -> Option<Booking> {
        let key = self.entry_index.get(&id).map(|e| *e.value())?;
        let day = self.get_day(&key)?;
        let guard = day.read().await;
        guard.get_entry(&id).and_then(|e| Booking::from_entry(&key, e))
    }

    /// A holder's active holds (their cart), ordered by date then start.
    pub async fn holds_for_holder(&self, holder: &str) -> Vec<Hold> {
        let now = now_ms();
        let mut holds = Vec::new();
        for id in self.holder_hold_ids(holder) {
            if let Some(hold) = self.get_hold(id).await
                && hold.is_active(now)
            {
                holds.push(hold);
            }
        }
        holds.sort_by_key(|h| (h.date, h.range.start, h.court_id));
        holds
    }

    pub async fn bookings_for(&self, filter: &BookingFilter) -> Vec<Booking> {
        let days: Vec<_> = self
            .days
            .iter()
            .filter(|e| {
                let key = e.key();
                filter.court_id.is_none_or(|c| c == key.court_id)
                    && filter.date.is_none_or(|d| d == key.date)
            })
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut bookings = Vec::new();
        for (key, day) in days {
            let guard = day.read().await;
            bookings.extend(
                guard
                    .entries
                    .iter()
                    .filter_map(|e| Booking::from_entry(&key, e))
                    .filter(|b| filter.include_cancelled || b.status == BookingStatus::Confirmed)
                    .filter(|b| {
                        filter
                            .customer_id
                            .as_deref()
                            .is_none_or(|c| c == b.customer_id)
                    }),
            );
        }
        bookings.sort_by_key(|b| (b.date, b.range.start, b.court_id));
        bookings
    }

    /// Courts in `zone` (all courts when `None`), ordered by name then id.
    pub fn list_courts(&self, zone: Option<&str>) -> Vec<Court> {
        let mut courts: Vec<Court> = self
            .courts
            .iter()
            .filter(|e| zone.is_none_or(|z| e.value().zone.as_deref() == Some(z)))
            .map(|e| e.value().clone())
            .collect();
        courts.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        courts
    }

    /// Courts of `zone` with nothing blocking `range` on `date`.
    pub async fn available_courts(
        &self,
        zone: Option<&str>,
        date: NaiveDate,
        range: TimeRange,
    ) -> Result<Vec<Court>, EngineError> {
        self.available_fixed_courts(zone, date, range, 1).await
    }

    /// Courts of `zone` free for `range` on each of `weeks` weekly dates from `date`.
    pub async fn available_fixed_courts(
        &self,
        zone: Option<&str>,
        date: NaiveDate,
        range: TimeRange,
        weeks: u32,
    ) -> Result<Vec<Court>, EngineError> {
        validate_window(&self.facility, &range)?;
        let dates = weekly_dates(date, weeks)?;
        let now = now_ms();
        let mut free = Vec::new();
        'courts: for court in self.list_courts(zone) {
            for date in &dates {
                if let Some(day) = self.get_day(&SlotKey::new(court.id, *date))
                    && find_conflict(&*day.read().await, &range, now).is_some()
                {
                    continue 'courts;
                }
            }
            free.push(court);
        }
        Ok(free)
    }

    /// Grid start times on `date` that cannot start a `duration`-minute
    /// booking: the session would run past closing, the start already
    /// passed (facility-local time), or no court in `zone` is free for it.
    pub async fn unavailable_start_times(
        &self,
        zone: Option<&str>,
        date: NaiveDate,
        duration: Minute,
    ) -> Result<Vec<Minute>, EngineError> {
        self.blocked_start_times_at(zone, date, duration, 1, now_ms())
            .await
    }

    /// `unavailable_start_times` for a fixed court: a start stays open only if
    /// one court is free for it on all `weeks` weekly dates.
    pub async fn unavailable_fixed_start_times(
        &self,
        zone: Option<&str>,
        date: NaiveDate,
        duration: Minute,
        weeks: u32,
    ) -> Result<Vec<Minute>, EngineError> {
        self.blocked_start_times_at(zone, date, duration, weeks, now_ms())
            .await
    }

    pub(super) async fn blocked_start_times_at(
        &self,
        zone: Option<&str>,
        date: NaiveDate,
        duration: Minute,
        weeks: u32,
        now: Ms,
    ) -> Result<Vec<Minute>, EngineError> {
        let slot = self.facility.slot_minutes.max(1);
        if duration == 0 || duration % slot != 0 {
            return Err(EngineError::InvalidRequest(
                "duration must be a positive multiple of the slot length",
            ));
        }
        let dates = weekly_dates(date, weeks)?;
        let (today, minute_now) = self.facility.local_now(now);
        let hours = self.facility.hours();

        let mut per_court = Vec::new();
        for court in self.list_courts(zone) {
            let mut per_day = Vec::with_capacity(dates.len());
            for date in &dates {
                if let Some(day) = self.get_day(&SlotKey::new(court.id, *date)) {
                    per_day.push(free_ranges(Some(&*day.read().await), &hours, now));
                }
            }
            per_court.push(free_on_all(&hours, &per_day));
        }

        // Later weeks are always ahead of now; only the first date can have started.
        let blocked = self
            .facility
            .start_times()
            .into_iter()
            .filter(|&start| {
                let Some(end) = start
                    .checked_add(duration)
                    .filter(|&end| end <= self.facility.close)
                else {
                    return true;
                };
                if date < today || (date == today && start < minute_now) {
                    return true;
                }
                let wanted = TimeRange::new(start, end);
                !per_court.iter().any(|free| fits(free, &wanted))
            })
            .collect();
        Ok(blocked)
    }

    /// Band-by-band price of `range` on each of `weeks` weekly dates from `date`.
    pub fn quote(
        &self,
        court_id: Ulid,
        date: NaiveDate,
        range: TimeRange,
        weeks: u32,
    ) -> Result<Vec<PriceSegment>, EngineError> {
        validate_window(&self.facility, &range)?;
        let zone = self
            .courts
            .get(&court_id)
            .map(|c| c.zone.clone())
            .ok_or(EngineError::NotFound(court_id))?;
        Ok(weekly_dates(date, weeks)?
            .into_iter()
            .flat_map(|date| self.pricing.segments(zone.as_deref(), date, range))
            .collect())
    }

    /// Current price of `range` on `date` for the court's zone.
    pub(super) fn price_for(&self, court_id: Ulid, date: NaiveDate, range: TimeRange) -> Price {
        let zone = self.courts.get(&court_id).and_then(|c| c.zone.clone());
        self.pricing.quote(zone.as_deref(), date, range)
    }

    /// A holder's active holds with the sum of their prices.
    pub async fn cart(&self, holder: &str) -> Cart {
        let holds = self.holds_for_holder(holder).await;
        let total = holds.iter().map(|h| h.price).sum();
        Cart {
            holder_id: holder.to_string(),
            holds,
            total,
        }
    }

    /// Opening hours of one court on one date minus everything that blocks.
    pub async fn free_ranges(
        &self,
        court_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<TimeRange>, EngineError> {
        if !self.courts.contains_key(&court_id) {
            return Err(EngineError::NotFound(court_id));
        }
        let hours = self.facility.hours();
        Ok(match self.get_day(&SlotKey::new(court_id, date)) {
            Some(day) => free_ranges(Some(&*day.read().await), &hours, now_ms()),
            None => vec![hours],
        })
    }
}
