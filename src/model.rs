use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Every instant (acquisition, expiry, confirmation) uses it.
pub type Ms = i64;

/// Minute of the day, `0..=1440`.
pub type Minute = u16;

pub const MINUTES_PER_DAY: Minute = 24 * 60;

/// Username or session id owning a hold.
pub type HolderId = String;

/// Money in the smallest currency unit.
pub type Price = u64;

/// Half-open range of minutes `[start, end)` within a single day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Minute,
    pub end: Minute,
}

impl TimeRange {
    pub fn new(start: Minute, end: Minute) -> Self {
        debug_assert!(start < end, "TimeRange start must be before end");
        Self { start, end }
    }

    /// Checked constructor for untrusted input.
    pub fn try_new(start: Minute, end: Minute) -> Option<Self> {
        (start < end && end <= MINUTES_PER_DAY).then_some(Self { start, end })
    }

    pub fn duration_minutes(&self) -> Minute {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_range(&self, other: &TimeRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Parse `"08:00-09:30"`.
    pub fn parse(s: &str) -> Option<Self> {
        let (start, end) = s.split_once('-')?;
        Self::try_new(parse_clock(start.trim())?, parse_clock(end.trim())?)
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", format_clock(self.start), format_clock(self.end))
    }
}

/// Parse `"HH:MM"` into a minute of day. `"24:00"` is accepted as end of day.
pub fn parse_clock(s: &str) -> Option<Minute> {
    let (h, m) = s.split_once(':')?;
    if h.is_empty() || h.len() > 2 || m.len() != 2 {
        return None;
    }
    let h: Minute = h.parse().ok()?;
    let m: Minute = m.parse().ok()?;
    if m >= 60 {
        return None;
    }
    let total = h.checked_mul(60)?.checked_add(m)?;
    (total <= MINUTES_PER_DAY).then_some(total)
}

pub fn format_clock(minute: Minute) -> String {
    format!("{:02}:{:02}", minute / 60, minute % 60)
}

/// Unit of mutual exclusion: one court on one calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    pub court_id: Ulid,
    pub date: NaiveDate,
}

impl SlotKey {
    pub fn new(court_id: Ulid, date: NaiveDate) -> Self {
        Self { court_id, date }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.court_id, self.date)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Court {
    pub id: Ulid,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

/// Why a hold left the store without being promoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseReason {
    Released,
    Expired,
}

/// What occupies a range of a court day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Soft reservation that lapses at `expires_at`.
    Hold {
        holder: HolderId,
        ttl_ms: Ms,
        acquired_at: Ms,
        expires_at: Ms,
        price: Price,
    },
    /// Promoted hold. Kept after cancellation for history.
    Booking {
        customer: HolderId,
        hold_id: Ulid,
        confirmed_at: Ms,
        status: BookingStatus,
        price: Price,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: Ulid,
    pub range: TimeRange,
    pub kind: EntryKind,
}

impl Entry {
    pub fn is_hold(&self) -> bool {
        matches!(self.kind, EntryKind::Hold { .. })
    }

    /// True if this entry keeps its range from being taken at `now`.
    pub fn blocks(&self, now: Ms) -> bool {
        match &self.kind {
            EntryKind::Hold { expires_at, .. } => *expires_at > now,
            EntryKind::Booking { status, .. } => *status == BookingStatus::Confirmed,
        }
    }

    pub fn is_lapsed_hold(&self, now: Ms) -> bool {
        matches!(self.kind, EntryKind::Hold { expires_at, .. } if expires_at <= now)
    }

    /// Holder of a hold or customer of a booking.
    pub fn owner(&self) -> &str {
        match &self.kind {
            EntryKind::Hold { holder, .. } => holder,
            EntryKind::Booking { customer, .. } => customer,
        }
    }

    pub fn price(&self) -> Price {
        match &self.kind {
            EntryKind::Hold { price, .. } | EntryKind::Booking { price, .. } => *price,
        }
    }
}

/// Everything recorded against one court on one date, sorted by `range.start`.
#[derive(Debug, Clone)]
pub struct CourtDay {
    pub key: SlotKey,
    pub entries: Vec<Entry>,
}

impl CourtDay {
    pub fn new(key: SlotKey) -> Self {
        Self {
            key,
            entries: Vec::new(),
        }
    }

    pub fn insert_entry(&mut self, entry: Entry) {
        let pos = self
            .entries
            .partition_point(|e| e.range.start <= entry.range.start);
        self.entries.insert(pos, entry);
    }

    pub fn remove_entry(&mut self, id: &Ulid) -> Option<Entry> {
        let pos = self.entries.iter().position(|e| e.id == *id)?;
        Some(self.entries.remove(pos))
    }

    pub fn get_entry(&self, id: &Ulid) -> Option<&Entry> {
        self.entries.iter().find(|e| e.id == *id)
    }

    pub fn get_entry_mut(&mut self, id: &Ulid) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.id == *id)
    }

    /// Entries whose range overlaps `query`. Entries starting at or after
    /// `query.end` are skipped by binary search.
    pub fn overlapping(&self, query: &TimeRange) -> impl Iterator<Item = &Entry> {
        let right_bound = self.entries.partition_point(|e| e.range.start < query.end);
        self.entries[..right_bound]
            .iter()
            .filter(move |e| e.range.end > query.start)
    }

    pub fn has_blocking(&self, now: Ms) -> bool {
        self.entries.iter().any(|e| e.blocks(now))
    }
}

// ── Public views ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub id: Ulid,
    pub court_id: Ulid,
    pub date: NaiveDate,
    pub range: TimeRange,
    pub holder_id: HolderId,
    pub ttl_ms: Ms,
    pub acquired_at: Ms,
    pub expires_at: Ms,
    /// Quoted when the hold was taken.
    pub price: Price,
}

impl Hold {
    pub fn from_entry(key: &SlotKey, entry: &Entry) -> Option<Self> {
        match &entry.kind {
            EntryKind::Hold {
                holder,
                ttl_ms,
                acquired_at,
                expires_at,
                price,
            } => Some(Self {
                id: entry.id,
                court_id: key.court_id,
                date: key.date,
                range: entry.range,
                holder_id: holder.clone(),
                ttl_ms: *ttl_ms,
                acquired_at: *acquired_at,
                expires_at: *expires_at,
                price: *price,
            }),
            EntryKind::Booking { .. } => None,
        }
    }

    pub fn key(&self) -> SlotKey {
        SlotKey::new(self.court_id, self.date)
    }

    pub fn is_active(&self, now: Ms) -> bool {
        self.expires_at > now
    }

    /// Milliseconds left before expiry, zero once lapsed. Drives client countdowns.
    pub fn remaining_ms(&self, now: Ms) -> Ms {
        (self.expires_at - now).max(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub hold_id: Ulid,
    pub court_id: Ulid,
    pub date: NaiveDate,
    pub range: TimeRange,
    pub customer_id: HolderId,
    pub confirmed_at: Ms,
    pub status: BookingStatus,
    pub price: Price,
}

impl Booking {
    pub fn from_entry(key: &SlotKey, entry: &Entry) -> Option<Self> {
        match &entry.kind {
            EntryKind::Booking {
                customer,
                hold_id,
                confirmed_at,
                status,
                price,
            } => Some(Self {
                id: entry.id,
                hold_id: *hold_id,
                court_id: key.court_id,
                date: key.date,
                range: entry.range,
                customer_id: customer.clone(),
                confirmed_at: *confirmed_at,
                status: *status,
                price: *price,
            }),
            EntryKind::Hold { .. } => None,
        }
    }
}

/// A holder's active holds and what checking them out would cost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    pub holder_id: HolderId,
    pub holds: Vec<Hold>,
    pub total: Price,
}

/// WAL record and notification payload. One variant per mutation, except
/// `Batch`, which groups the events of one all-or-nothing write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CourtCreated {
        id: Ulid,
        name: Option<String>,
        zone: Option<String>,
    },
    CourtDeleted {
        id: Ulid,
    },
    HoldAcquired {
        id: Ulid,
        key: SlotKey,
        range: TimeRange,
        holder: HolderId,
        ttl_ms: Ms,
        acquired_at: Ms,
        expires_at: Ms,
        price: Price,
    },
    HoldRenewed {
        id: Ulid,
        key: SlotKey,
        expires_at: Ms,
    },
    HoldReleased {
        id: Ulid,
        key: SlotKey,
        reason: ReleaseReason,
        at: Ms,
    },
    HoldPromoted {
        hold_id: Ulid,
        booking_id: Ulid,
        key: SlotKey,
        confirmed_at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        key: SlotKey,
    },
    /// Written by compaction only: a booking whose originating hold is gone.
    BookingRestored {
        id: Ulid,
        hold_id: Ulid,
        key: SlotKey,
        range: TimeRange,
        customer: HolderId,
        confirmed_at: Ms,
        status: BookingStatus,
        price: Price,
    },
    /// Written as one WAL record, so replay sees all of it or none of it.
    Batch {
        events: Vec<Event>,
    },
}

impl Event {
    /// The court day this event mutates, if any.
    pub fn key(&self) -> Option<SlotKey> {
        match self {
            Event::HoldAcquired { key, .. }
            | Event::HoldRenewed { key, .. }
            | Event::HoldReleased { key, .. }
            | Event::HoldPromoted { key, .. }
            | Event::BookingCancelled { key, .. }
            | Event::BookingRestored { key, .. } => Some(*key),
            Event::CourtCreated { .. } | Event::CourtDeleted { .. } | Event::Batch { .. } => None,
        }
    }
}
