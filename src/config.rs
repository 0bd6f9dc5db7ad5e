use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Timelike, Utc};
use tracing::warn;

use crate::model::*;

const ENV_PREFIX: &str = "COURTHOLD_";

/// Opening hours, slot grid and local time zone of the facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Facility {
    pub open: Minute,
    pub close: Minute,
    pub slot_minutes: Minute,
    /// Offset of facility-local time from UTC.
    pub utc_offset_minutes: i32,
}

impl Default for Facility {
    fn default() -> Self {
        Self {
            open: 6 * 60,
            close: 22 * 60,
            slot_minutes: 30,
            utc_offset_minutes: 7 * 60,
        }
    }
}

impl Facility {
    pub fn hours(&self) -> TimeRange {
        TimeRange::new(self.open, self.close)
    }

    /// Every bookable start time on the grid: `open`, `open + slot`, ... before `close`.
    pub fn start_times(&self) -> Vec<Minute> {
        (self.open..self.close)
            .step_by(self.slot_minutes.max(1) as usize)
            .collect()
    }

    pub fn is_aligned(&self, range: &TimeRange) -> bool {
        let slot = self.slot_minutes.max(1);
        if range.start < self.open {
            return false;
        }
        (range.start - self.open) % slot == 0 && (range.end - self.open) % slot == 0
    }

    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }

    /// Facility-local date and minute of day at instant `now`.
    pub fn local_now(&self, now: Ms) -> (NaiveDate, Minute) {
        let utc = DateTime::<Utc>::from_timestamp_millis(now).unwrap_or_default();
        let local = utc.with_timezone(&self.offset());
        let minute = (local.hour() * 60 + local.minute()) as Minute;
        (local.date_naive(), minute)
    }

    pub fn today(&self, now: Ms) -> NaiveDate {
        self.local_now(now).0
    }

    fn sanitized(self) -> Self {
        let default = Self::default();
        let valid = self.open < self.close
            && self.close <= MINUTES_PER_DAY
            && self.slot_minutes > 0
            && self.slot_minutes <= self.close - self.open
            && self.utc_offset_minutes.abs() <= 14 * 60;
        if valid {
            self
        } else {
            warn!("invalid facility schedule {self:?}, using defaults");
            default
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    /// TTL applied when a hold request does not carry one.
    pub hold_ttl_ms: Ms,
    pub reap_interval: Duration,
    pub facility: Facility,
    /// Optional JSON roster of courts registered at startup.
    pub courts_file: Option<PathBuf>,
    /// Optional JSON list of zone price bands. Without it every slot costs 0.
    pub prices_file: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(format!("{ENV_PREFIX}{name}")).ok())
    }

    /// Build a config from a variable lookup (names without the prefix).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let facility = Facility {
            open: parse_clock_var(&lookup, "OPEN", 6 * 60),
            close: parse_clock_var(&lookup, "CLOSE", 22 * 60),
            slot_minutes: parse_var(&lookup, "SLOT_MINUTES", 30),
            utc_offset_minutes: parse_var(&lookup, "UTC_OFFSET_MINUTES", 7 * 60),
        }
        .sanitized();

        let hold_ttl_secs: u64 = parse_var(&lookup, "HOLD_TTL_SECS", 300);
        let hold_ttl_ms = Ms::try_from(hold_ttl_secs.saturating_mul(1000))
            .unwrap_or(crate::limits::MAX_HOLD_TTL_MS)
            .clamp(crate::limits::MIN_HOLD_TTL_MS, crate::limits::MAX_HOLD_TTL_MS);

        Self {
            port: parse_var(&lookup, "PORT", 5433),
            bind: lookup("BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(lookup("DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: lookup("PASSWORD").unwrap_or_else(|| "courthold".into()),
            max_connections: parse_var(&lookup, "MAX_CONNECTIONS", 256),
            compact_threshold: parse_var(&lookup, "COMPACT_THRESHOLD", 1000),
            metrics_port: lookup("METRICS_PORT").and_then(|s| s.parse().ok()),
            tls_cert: lookup("TLS_CERT"),
            tls_key: lookup("TLS_KEY"),
            hold_ttl_ms,
            reap_interval: Duration::from_millis(parse_var(&lookup, "REAP_INTERVAL_MS", 5000u64).max(10)),
            facility,
            courts_file: lookup("COURTS_FILE").map(PathBuf::from),
            prices_file: lookup("PRICES_FILE").map(PathBuf::from),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("courthold.wal")
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T {
    match lookup(name) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{ENV_PREFIX}{name}={raw:?} is not valid, using default");
            default
        }),
    }
}

fn parse_clock_var(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: Minute) -> Minute {
    match lookup(name) {
        None => default,
        Some(raw) => parse_clock(raw.trim()).unwrap_or_else(|| {
            warn!("{ENV_PREFIX}{name}={raw:?} is not HH:MM, using default");
            default
        }),
    }
}

/// Read a JSON array of courts: `[{"id": "<ulid>", "name": "Court 1", "zone": "A"}]`.
pub fn load_courts(path: &Path) -> io::Result<Vec<Court>> {
    let raw = fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn defaults_match_facility_grid() {
        let cfg = Config::from_lookup(|_| None);
        assert_eq!(cfg.port, 5433);
        assert_eq!(cfg.hold_ttl_ms, 300_000);
        assert_eq!(cfg.reap_interval, Duration::from_secs(5));
        assert_eq!(cfg.facility, Facility::default());
        assert!(cfg.metrics_port.is_none());
        assert_eq!(cfg.wal_path(), PathBuf::from("./data/courthold.wal"));
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = Config::from_lookup(lookup_from(&[
            ("PORT", "6000"),
            ("HOLD_TTL_SECS", "60"),
            ("OPEN", "08:00"),
            ("CLOSE", "20:00"),
            ("SLOT_MINUTES", "60"),
            ("UTC_OFFSET_MINUTES", "0"),
            ("METRICS_PORT", "9100"),
        ]));
        assert_eq!(cfg.port, 6000);
        assert_eq!(cfg.hold_ttl_ms, 60_000);
        assert_eq!(cfg.facility.open, 480);
        assert_eq!(cfg.facility.close, 1200);
        assert_eq!(cfg.facility.slot_minutes, 60);
        assert_eq!(cfg.metrics_port, Some(9100));
    }

    #[test]
    fn bad_values_fall_back() {
        let cfg = Config::from_lookup(lookup_from(&[
            ("PORT", "not-a-port"),
            ("OPEN", "late"),
            ("HOLD_TTL_SECS", "999999"),
        ]));
        assert_eq!(cfg.port, 5433);
        assert_eq!(cfg.facility.open, 360);
        assert_eq!(cfg.hold_ttl_ms, crate::limits::MAX_HOLD_TTL_MS);
    }

    #[test]
    fn huge_ttl_saturates_at_the_cap() {
        let cfg = Config::from_lookup(lookup_from(&[("HOLD_TTL_SECS", "18446744073709551615")]));
        assert_eq!(cfg.hold_ttl_ms, crate::limits::MAX_HOLD_TTL_MS);
        let cfg = Config::from_lookup(lookup_from(&[("HOLD_TTL_SECS", "9300000000000000")]));
        assert_eq!(cfg.hold_ttl_ms, crate::limits::MAX_HOLD_TTL_MS);
        let cfg = Config::from_lookup(lookup_from(&[("HOLD_TTL_SECS", "0")]));
        assert_eq!(cfg.hold_ttl_ms, crate::limits::MIN_HOLD_TTL_MS);
    }

    #[test]
    fn inverted_hours_use_default_schedule() {
        let cfg = Config::from_lookup(lookup_from(&[("OPEN", "22:00"), ("CLOSE", "06:00")]));
        assert_eq!(cfg.facility, Facility::default());
    }

    #[test]
    fn start_times_cover_six_to_half_past_nine() {
        let starts = Facility::default().start_times();
        assert_eq!(starts.len(), 32);
        assert_eq!(starts.first(), Some(&360));
        assert_eq!(starts.last(), Some(&1290));
    }

    #[test]
    fn alignment_is_relative_to_opening() {
        let f = Facility {
            open: 6 * 60 + 15,
            ..Facility::default()
        };
        assert!(f.is_aligned(&TimeRange::new(375, 435)));
        assert!(!f.is_aligned(&TimeRange::new(360, 420)));
    }

    #[test]
    fn local_now_applies_offset() {
        let f = Facility::default();
        // 2025-03-14T20:30:00Z is 03:30 the next day at UTC+7.
        let now = DateTime::parse_from_rfc3339("2025-03-14T20:30:00Z")
            .unwrap()
            .timestamp_millis();
        let (date, minute) = f.local_now(now);
        assert_eq!(date, NaiveDate::from_ymd_opt(2025, 3, 15).unwrap());
        assert_eq!(minute, 3 * 60 + 30);
    }

    #[test]
    fn courts_file_roundtrip() {
        let dir = std::env::temp_dir().join("courthold_test_config");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("courts.json");
        fs::write(
            &path,
            r#"[{"id": "01ARZ3NDEKTSV4RRFFQ69G5FAV", "name": "Court 1", "zone": "A"},
                {"id": "01BX5ZZKBKACTAV9WEVGEMMVRZ"}]"#,
        )
        .unwrap();
        let courts = load_courts(&path).unwrap();
        assert_eq!(courts.len(), 2);
        assert_eq!(courts[0].zone.as_deref(), Some("A"));
        assert_eq!(courts[1].name, None);
    }

    #[test]
    fn optional_files_from_env() {
        let cfg = Config::from_lookup(|_| None);
        assert_eq!(cfg.courts_file, None);
        assert_eq!(cfg.prices_file, None);
        let cfg = Config::from_lookup(|name| match name {
            "PRICES_FILE" => Some("/etc/courthold/prices.json".into()),
            _ => None,
        });
        assert_eq!(cfg.prices_file, Some(PathBuf::from("/etc/courthold/prices.json")));
    }
}
