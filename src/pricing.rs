//! Zone price lists. Each zone has hourly rates per time band, separately for
//! weekdays and weekends. A slot is charged band by band for the minutes it
//! spends in each.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use crate::model::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayType {
    /// Monday to Friday.
    Weekday,
    /// Saturday and Sunday.
    Weekend,
}

impl DayType {
    pub fn of(date: NaiveDate) -> Self {
        match date.weekday() {
            Weekday::Sat | Weekday::Sun => DayType::Weekend,
            _ => DayType::Weekday,
        }
    }
}

/// `price_per_hour` applies to minutes inside `range` on `days` in `zone`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceBand {
    pub zone: String,
    pub days: DayType,
    pub range: TimeRange,
    pub price_per_hour: Price,
}

/// Part of a quote covered by one band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceSegment {
    pub date: NaiveDate,
    pub range: TimeRange,
    pub price: Price,
}

/// File form of a band: `{"zone": "A", "days": "weekday", "start": "06:00", "end": "17:00", "price_per_hour": 60000}`.
#[derive(Debug, Deserialize)]
struct BandRecord {
    zone: String,
    days: DayType,
    start: String,
    end: String,
    price_per_hour: Price,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriceError {
    BadRange { zone: String, start: String, end: String },
    Overlap { zone: String, days: DayType },
}

impl fmt::Display for PriceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriceError::BadRange { zone, start, end } => {
                write!(f, "zone {zone}: bad price band {start:?}-{end:?}")
            }
            PriceError::Overlap { zone, days } => {
                write!(f, "zone {zone}: overlapping {days:?} price bands")
            }
        }
    }
}

impl std::error::Error for PriceError {}

/// Every zone's bands, sorted by start and checked for overlap.
#[derive(Debug, Clone, Default)]
pub struct PriceTable {
    bands: HashMap<(String, DayType), Vec<PriceBand>>,
}

impl PriceTable {
    pub fn new(bands: Vec<PriceBand>) -> Result<Self, PriceError> {
        let mut grouped: HashMap<(String, DayType), Vec<PriceBand>> = HashMap::new();
        for band in bands {
            grouped
                .entry((band.zone.clone(), band.days))
                .or_default()
                .push(band);
        }
        for ((zone, days), bands) in grouped.iter_mut() {
            bands.sort_by_key(|b| b.range.start);
            if bands.windows(2).any(|w| w[0].range.overlaps(&w[1].range)) {
                return Err(PriceError::Overlap {
                    zone: zone.clone(),
                    days: *days,
                });
            }
        }
        Ok(Self { bands: grouped })
    }

    /// Read a JSON array of bands.
    pub fn load(path: &Path) -> io::Result<Self> {
        let raw = fs::read_to_string(path)?;
        let records: Vec<BandRecord> = serde_json::from_str(&raw)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        records
            .into_iter()
            .map(BandRecord::into_band)
            .collect::<Result<Vec<_>, _>>()
            .and_then(Self::new)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }

    pub fn bands(&self, zone: &str, days: DayType) -> &[PriceBand] {
        self.bands
            .get(&(zone.to_string(), days))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// `range` on `date` split at band boundaries. Minutes no band covers are free.
    pub fn segments(&self, zone: Option<&str>, date: NaiveDate, range: TimeRange) -> Vec<PriceSegment> {
        let Some(zone) = zone else {
            return Vec::new();
        };
        self.bands(zone, DayType::of(date))
            .iter()
            .filter_map(|band| {
                let start = range.start.max(band.range.start);
                let end = range.end.min(band.range.end);
                (start < end).then(|| PriceSegment {
                    date,
                    range: TimeRange::new(start, end),
                    price: charge(end - start, band.price_per_hour),
                })
            })
            .collect()
    }

    pub fn quote(&self, zone: Option<&str>, date: NaiveDate, range: TimeRange) -> Price {
        self.segments(zone, date, range).iter().map(|s| s.price).sum()
    }
}

impl BandRecord {
    fn into_band(self) -> Result<PriceBand, PriceError> {
        let range = parse_clock(&self.start)
            .zip(parse_clock(&self.end))
            .and_then(|(start, end)| TimeRange::try_new(start, end));
        match range {
            Some(range) => Ok(PriceBand {
                zone: self.zone,
                days: self.days,
                range,
                price_per_hour: self.price_per_hour,
            }),
            None => Err(PriceError::BadRange {
                zone: self.zone,
                start: self.start,
                end: self.end,
            }),
        }
    }
}

/// Hourly rate applied to `minutes`, rounded half up.
fn charge(minutes: Minute, price_per_hour: Price) -> Price {
    (Price::from(minutes) * price_per_hour + 30) / 60
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2025-03-14 is a Friday.
    fn friday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 14).unwrap()
    }

    fn band(zone: &str, days: DayType, start: Minute, end: Minute, price_per_hour: Price) -> PriceBand {
        PriceBand {
            zone: zone.into(),
            days,
            range: TimeRange::new(start, end),
            price_per_hour,
        }
    }

    fn table() -> PriceTable {
        PriceTable::new(vec![
            band("A", DayType::Weekday, 360, 1020, 60_000),
            band("A", DayType::Weekday, 1020, 1320, 100_000),
            band("A", DayType::Weekend, 360, 1320, 120_000),
        ])
        .unwrap()
    }

    #[test]
    fn day_type_follows_weekday() {
        assert_eq!(DayType::of(friday()), DayType::Weekday);
        assert_eq!(DayType::of(friday().succ_opt().unwrap()), DayType::Weekend);
        assert_eq!(DayType::of(NaiveDate::from_ymd_opt(2025, 3, 16).unwrap()), DayType::Weekend);
    }

    #[test]
    fn slot_inside_one_band() {
        assert_eq!(table().quote(Some("A"), friday(), TimeRange::new(480, 570)), 90_000);
    }

    #[test]
    fn slot_across_bands_is_split() {
        let segments = table().segments(Some("A"), friday(), TimeRange::new(960, 1080));
        assert_eq!(
            segments,
            vec![
                PriceSegment {
                    date: friday(),
                    range: TimeRange::new(960, 1020),
                    price: 60_000,
                },
                PriceSegment {
                    date: friday(),
                    range: TimeRange::new(1020, 1080),
                    price: 100_000,
                },
            ]
        );
        assert_eq!(table().quote(Some("A"), friday(), TimeRange::new(960, 1080)), 160_000);
    }

    #[test]
    fn weekend_uses_its_own_bands() {
        let saturday = friday().succ_opt().unwrap();
        assert_eq!(table().quote(Some("A"), saturday, TimeRange::new(960, 1080)), 240_000);
    }

    #[test]
    fn unpriced_zone_or_gap_is_free() {
        assert_eq!(table().quote(Some("B"), friday(), TimeRange::new(480, 540)), 0);
        assert_eq!(table().quote(None, friday(), TimeRange::new(480, 540)), 0);
        let gappy = PriceTable::new(vec![band("A", DayType::Weekday, 480, 540, 60_000)]).unwrap();
        assert_eq!(gappy.quote(Some("A"), friday(), TimeRange::new(450, 600)), 60_000);
    }

    #[test]
    fn odd_minutes_round_half_up() {
        let t = PriceTable::new(vec![band("A", DayType::Weekday, 0, 1440, 1)]).unwrap();
        assert_eq!(t.quote(Some("A"), friday(), TimeRange::new(0, 30)), 1);
        assert_eq!(t.quote(Some("A"), friday(), TimeRange::new(0, 29)), 0);
    }

    #[test]
    fn overlapping_bands_are_rejected() {
        let err = PriceTable::new(vec![
            band("A", DayType::Weekday, 360, 1020, 1),
            band("A", DayType::Weekday, 960, 1320, 2),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            PriceError::Overlap {
                zone: "A".into(),
                days: DayType::Weekday
            }
        );
        // Same hours on different day types are fine.
        assert!(
            PriceTable::new(vec![
                band("A", DayType::Weekday, 360, 1020, 1),
                band("A", DayType::Weekend, 360, 1020, 2),
            ])
            .is_ok()
        );
    }

    #[test]
    fn load_reads_json_bands() {
        let dir = std::env::temp_dir().join("courthold_test_pricing");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("prices.json");
        fs::write(
            &path,
            r#"[
                {"zone": "A", "days": "weekday", "start": "06:00", "end": "17:00", "price_per_hour": 60000},
                {"zone": "A", "days": "weekend", "start": "06:00", "end": "22:00", "price_per_hour": 120000}
            ]"#,
        )
        .unwrap();
        let table = PriceTable::load(&path).unwrap();
        assert_eq!(table.bands("A", DayType::Weekday)[0].range, TimeRange::new(360, 1020));
        assert_eq!(table.bands("A", DayType::Weekend).len(), 1);

        fs::write(
            &path,
            r#"[{"zone": "A", "days": "weekday", "start": "17:00", "end": "06:00", "price_per_hour": 1}]"#,
        )
        .unwrap();
        let err = PriceTable::load(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
