//! Time zone resolution and DST-safe conversion of wall-clock times to UTC.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    str::FromStr,
    sync::Arc,
};

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;

use crate::{types::TimeValue, vtimezone::VTimezone};

/// Windows zone names that show up in Outlook/Exchange exports.
const WINDOWS_ZONES: &[(&str, &str)] = &[
    ("UTC", "UTC"),
    ("GMT Standard Time", "Europe/London"),
    ("W. Europe Standard Time", "Europe/Berlin"),
    ("Central Europe Standard Time", "Europe/Budapest"),
    ("Romance Standard Time", "Europe/Paris"),
    ("E. Europe Standard Time", "Europe/Chisinau"),
    ("Eastern Standard Time", "America/New_York"),
    ("Central Standard Time", "America/Chicago"),
    ("Mountain Standard Time", "America/Denver"),
    ("Pacific Standard Time", "America/Los_Angeles"),
    ("China Standard Time", "Asia/Shanghai"),
    ("Tokyo Standard Time", "Asia/Tokyo"),
];

/// Parses a TZID into an IANA zone.
///
/// Accepts IANA names, the `/mozilla.org/` style prefixes and a few Windows names.
pub fn parse_zone(tzid: &str) -> Option<Tz> {
    let trimmed = tzid.trim().trim_matches('"');
    let stripped = trimmed
        .strip_prefix("/mozilla.org/20050126_1/")
        .or_else(|| trimmed.strip_prefix("/mozilla.org/"))
        .or_else(|| trimmed.strip_prefix("/softwarestudio.org/Tzfile/"))
        .or_else(|| trimmed.strip_prefix("/softwarestudio.org/"))
        .unwrap_or(trimmed);

    if let Ok(tz) = Tz::from_str(stripped) {
        return Some(tz);
    }

    WINDOWS_ZONES
        .iter()
        .find(|(windows, _)| windows.eq_ignore_ascii_case(stripped))
        .and_then(|(_, iana)| Tz::from_str(iana).ok())
}

/// Converts a wall-clock time in `tz` to UTC.
///
/// A time inside a DST gap uses the offset in force before the gap, so
/// 02:30 on a spring-forward night becomes 03:30. A time inside a fold
/// resolves to its earlier instant. No local time is ever dropped.
pub fn localize(local: NaiveDateTime, tz: Tz) -> DateTime<Utc> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            // Gaps never exceed a day; the offset a day earlier predates it.
            let before = local.checked_sub_signed(Duration::days(1)).unwrap_or(local);
            let offset = tz.offset_from_utc_datetime(&before).fix();
            local
                .checked_sub_signed(Duration::seconds(i64::from(offset.local_minus_utc())))
                .unwrap_or(local)
                .and_utc()
        }
    }
}

/// Zone governing a wall-clock value.
#[derive(Debug, Clone)]
pub enum Zone {
    Iana(Tz),
    /// Declared by the feed's own VTIMEZONE block
    Defined(Arc<VTimezone>),
}

impl Zone {
    pub fn localize(&self, local: NaiveDateTime) -> DateTime<Utc> {
        match self {
            Self::Iana(tz) => localize(local, *tz),
            Self::Defined(zone) => zone.localize(local),
        }
    }

    /// Wall-clock time of an instant in this zone.
    pub fn local_time(&self, instant: DateTime<Utc>) -> NaiveDateTime {
        match self {
            Self::Iana(tz) => instant.with_timezone(tz).naive_local(),
            Self::Defined(zone) => zone.local_time(instant),
        }
    }
}

impl From<Tz> for Zone {
    fn from(tz: Tz) -> Self {
        Self::Iana(tz)
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Iana(tz) => write!(f, "{}", tz.name()),
            Self::Defined(zone) => write!(f, "{}", zone.tzid),
        }
    }
}

/// 时区解析器，缓存已解析的 TZID
///
/// Known zone names win over the feed's VTIMEZONE blocks, which only fill in
/// identifiers the zone database does not know.
#[derive(Debug)]
pub struct ZoneResolver {
    default_zone: Tz,
    definitions: BTreeMap<String, Arc<VTimezone>>,
    cache: HashMap<String, Option<Zone>>,
}

impl ZoneResolver {
    pub fn new(default_zone: Tz) -> Self {
        Self {
            default_zone,
            definitions: BTreeMap::new(),
            cache: HashMap::new(),
        }
    }

    /// Adds the VTIMEZONE definitions of a feed, keyed by TZID.
    pub fn with_definitions(mut self, definitions: BTreeMap<String, Arc<VTimezone>>) -> Self {
        self.definitions = definitions;
        self.cache.clear();
        self
    }

    pub const fn default_zone(&self) -> Tz {
        self.default_zone
    }

    /// Resolves a TZID, or returns the unknown identifier.
    pub fn resolve(&mut self, tzid: &str) -> Result<Zone, String> {
        if !self.cache.contains_key(tzid) {
            let zone = parse_zone(tzid).map(Zone::Iana).or_else(|| {
                self.definitions
                    .get(tzid.trim().trim_matches('"'))
                    .cloned()
                    .map(Zone::Defined)
            });
            self.cache.insert(tzid.to_string(), zone);
        }
        self.cache
            .get(tzid)
            .cloned()
            .flatten()
            .ok_or_else(|| tzid.to_string())
    }

    /// Zone whose wall clock governs a value.
    ///
    /// Unknown TZIDs fall back to the default zone; the identifier is returned
    /// alongside so the caller can record it.
    pub fn zone_of(&mut self, value: &TimeValue) -> (Zone, Option<String>) {
        match value {
            TimeValue::Utc(_) => (Zone::Iana(Tz::UTC), None),
            TimeValue::Date(_) | TimeValue::Floating(_) => (self.default_zone.into(), None),
            TimeValue::Zoned { tzid, .. } => match self.resolve(tzid) {
                Ok(zone) => (zone, None),
                Err(unknown) => (self.default_zone.into(), Some(unknown)),
            },
        }
    }

    /// Normalizes a value to UTC.
    pub fn to_utc(&mut self, value: &TimeValue) -> (DateTime<Utc>, Option<String>) {
        if let TimeValue::Utc(utc) = value {
            return (*utc, None);
        }
        let (zone, unknown) = self.zone_of(value);
        (zone.localize(value.local()), unknown)
    }
}
