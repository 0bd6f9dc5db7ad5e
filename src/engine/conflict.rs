use ulid::Ulid;

use crate::config::Facility;
use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Shape checks shared by mutations and queries: inside opening hours and on the grid.
pub(crate) fn validate_window(facility: &Facility, range: &TimeRange) -> Result<(), EngineError> {
    if !facility.hours().contains_range(range) {
        return Err(EngineError::InvalidRequest("range outside opening hours"));
    }
    if !facility.is_aligned(range) {
        return Err(EngineError::InvalidRequest("range not aligned to slot grid"));
    }
    Ok(())
}

/// Full check for a new hold: window shape plus calendar position relative to `now`.
pub(crate) fn validate_request(
    facility: &Facility,
    key: &SlotKey,
    range: &TimeRange,
    now: Ms,
) -> Result<(), EngineError> {
    validate_window(facility, range)?;
    let (today, minute) = facility.local_now(now);
    if key.date < today {
        return Err(EngineError::InvalidRequest("date is in the past"));
    }
    if key.date == today && range.start < minute {
        return Err(EngineError::InvalidRequest("start time has already passed"));
    }
    if (key.date - today).num_days() > MAX_ADVANCE_DAYS {
        return Err(EngineError::LimitExceeded("date too far ahead"));
    }
    Ok(())
}

pub(crate) fn validate_ttl(ttl_ms: Ms) -> Result<(), EngineError> {
    if !(MIN_HOLD_TTL_MS..=MAX_HOLD_TTL_MS).contains(&ttl_ms) {
        return Err(EngineError::LimitExceeded("hold ttl out of range"));
    }
    Ok(())
}

pub(crate) fn validate_holder(holder: &str) -> Result<(), EngineError> {
    if holder.trim().is_empty() {
        return Err(EngineError::InvalidRequest("holder id is empty"));
    }
    if holder.len() > MAX_HOLDER_ID_LEN {
        return Err(EngineError::LimitExceeded("holder id too long"));
    }
    Ok(())
}

/// First entry that blocks `range` at `now`: an active hold or a confirmed booking.
pub(crate) fn find_conflict(day: &CourtDay, range: &TimeRange, now: Ms) -> Option<Ulid> {
    day.overlapping(range)
        .find(|e| e.blocks(now))
        .map(|e| e.id)
}

/// Holds overlapping `range` whose TTL has run out but the sweep has not reached yet.
pub(crate) fn lapsed_overlapping(day: &CourtDay, range: &TimeRange, now: Ms) -> Vec<Ulid> {
    day.overlapping(range)
        .filter(|e| e.is_lapsed_hold(now))
        .map(|e| e.id)
        .collect()
}

/// First pair of requests on the same key whose ranges overlap; returns the later id.
pub(crate) fn intra_batch_conflict(requests: &[(SlotKey, TimeRange, Ulid)]) -> Option<Ulid> {
    for (i, (key_a, range_a, _)) in requests.iter().enumerate() {
        for (key_b, range_b, id_b) in &requests[i + 1..] {
            if key_a == key_b && range_a.overlaps(range_b) {
                return Some(*id_b);
            }
        }
    }
    None
}
