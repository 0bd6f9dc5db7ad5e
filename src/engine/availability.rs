use crate::model::*;

// ── Free-time arithmetic ─────────────────────────────────────────

/// Free ranges of a court day: `hours` minus every entry that blocks at `now`.
/// A missing day means nothing has been recorded, so all of `hours` is free.
pub fn free_ranges(day: Option<&CourtDay>, hours: &TimeRange, now: Ms) -> Vec<TimeRange> {
    let Some(day) = day else {
        return vec![*hours];
    };
    let mut taken: Vec<TimeRange> = day
        .overlapping(hours)
        .filter(|e| e.blocks(now))
        .map(|e| e.range)
        .collect();
    if taken.is_empty() {
        return vec![*hours];
    }
    taken.sort_by_key(|r| r.start);
    let taken = merge_overlapping(&taken);
    subtract_ranges(&[*hours], &taken)
}

/// Merge sorted overlapping/adjacent ranges into disjoint ranges.
pub fn merge_overlapping(sorted: &[TimeRange]) -> Vec<TimeRange> {
    let mut merged: Vec<TimeRange> = Vec::new();
    for &range in sorted {
        if let Some(last) = merged.last_mut()
            && range.start <= last.end
        {
            last.end = last.end.max(range.end);
            continue;
        }
        merged.push(range);
    }
    merged
}

/// `base` minus `to_remove`. Both sorted by start; `to_remove` disjoint.
pub fn subtract_ranges(base: &[TimeRange], to_remove: &[TimeRange]) -> Vec<TimeRange> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(TimeRange::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < b.end {
            result.push(TimeRange::new(current_start, b.end));
        }
    }

    result
}

/// Ranges of `hours` free on every day, given each day's free list.
pub fn free_on_all(hours: &TimeRange, per_day: &[Vec<TimeRange>]) -> Vec<TimeRange> {
    per_day.iter().fold(vec![*hours], |free, day_free| {
        let taken = subtract_ranges(&[*hours], day_free);
        subtract_ranges(&free, &taken)
    })
}

/// True if one free range fully contains `wanted`.
pub fn fits(free: &[TimeRange], wanted: &TimeRange) -> bool {
    free.iter().any(|f| f.contains_range(wanted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ulid::Ulid;

    fn r(start: Minute, end: Minute) -> TimeRange {
        TimeRange::new(start, end)
    }

    fn day_with(entries: Vec<Entry>) -> CourtDay {
        let mut day = CourtDay::new(SlotKey::new(
            Ulid::new(),
            NaiveDate::from_ymd_opt(2025, 3, 14).unwrap(),
        ));
        for e in entries {
            day.insert_entry(e);
        }
        day
    }

    fn hold(start: Minute, end: Minute, expires_at: Ms) -> Entry {
        Entry {
            id: Ulid::new(),
            range: r(start, end),
            kind: EntryKind::Hold {
                holder: "alice".into(),
                ttl_ms: 1,
                acquired_at: 0,
                expires_at,
                price: 0,
            },
        }
    }

    fn booking(start: Minute, end: Minute, status: BookingStatus) -> Entry {
        Entry {
            id: Ulid::new(),
            range: r(start, end),
            kind: EntryKind::Booking {
                customer: "bob".into(),
                hold_id: Ulid::new(),
                confirmed_at: 0,
                status,
                price: 0,
            },
        }
    }

    #[test]
    fn subtract_no_overlap() {
        assert_eq!(subtract_ranges(&[r(360, 480)], &[r(600, 660)]), vec![r(360, 480)]);
    }

    #[test]
    fn subtract_full_overlap() {
        assert!(subtract_ranges(&[r(360, 480)], &[r(300, 500)]).is_empty());
    }

    #[test]
    fn subtract_middle_punch() {
        assert_eq!(
            subtract_ranges(&[r(360, 720)], &[r(480, 540)]),
            vec![r(360, 480), r(540, 720)]
        );
    }

    #[test]
    fn subtract_multiple_punches_across_bases() {
        let base = [r(360, 600), r(660, 900)];
        let remove = [r(420, 480), r(570, 690), r(840, 960)];
        assert_eq!(
            subtract_ranges(&base, &remove),
            vec![r(360, 420), r(480, 570), r(690, 840)]
        );
    }

    #[test]
    fn merge_joins_adjacent() {
        assert_eq!(
            merge_overlapping(&[r(360, 420), r(420, 480), r(450, 500), r(600, 660)]),
            vec![r(360, 500), r(600, 660)]
        );
    }

    #[test]
    fn empty_day_is_all_free() {
        let hours = r(360, 1320);
        assert_eq!(free_ranges(None, &hours, 0), vec![hours]);
    }

    #[test]
    fn lapsed_holds_and_cancelled_bookings_do_not_block() {
        let day = day_with(vec![
            hold(480, 540, 100),
            hold(600, 660, 10),
            booking(720, 780, BookingStatus::Confirmed),
            booking(840, 900, BookingStatus::Cancelled),
        ]);
        let free = free_ranges(Some(&day), &r(360, 1320), 50);
        assert_eq!(free, vec![r(360, 480), r(540, 720), r(780, 1320)]);
    }

    #[test]
    fn free_on_all_keeps_only_common_time() {
        let hours = r(360, 1320);
        let week1 = vec![r(360, 480), r(540, 1320)];
        let week2 = vec![r(360, 900), r(960, 1320)];
        assert_eq!(
            free_on_all(&hours, &[week1, week2]),
            vec![r(360, 480), r(540, 900), r(960, 1320)]
        );
        assert_eq!(free_on_all(&hours, &[]), vec![hours]);
        assert!(free_on_all(&hours, &[vec![r(360, 720)], vec![r(720, 1320)]]).is_empty());
    }

    #[test]
    fn fits_needs_one_containing_range() {
        let free = [r(360, 480), r(480, 540)];
        assert!(fits(&free, &r(360, 420)));
        // Touching ranges are not merged here; callers merge first.
        assert!(!fits(&free, &r(450, 510)));
        assert!(fits(&merge_overlapping(&free), &r(450, 510)));
    }
}
