use std::{cmp::Ordering, fmt, str::FromStr};

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::{error::WindowError, zone};

/// 日历原始数据
#[derive(Debug, Clone)]
pub struct CalendarSource {
    /// Raw ICS bytes
    pub bytes: Vec<u8>,
    /// Zone used for floating and all-day values, overrides X-WR-TIMEZONE
    pub default_zone: Option<Tz>,
    /// Display name of the calendar on a merged sheet
    pub name: Option<String>,
    /// CSS color for the calendar's entries
    pub color: Option<String>,
}

impl CalendarSource {
    pub fn inline(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            default_zone: None,
            name: None,
            color: None,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_color(mut self, color: Option<String>) -> Self {
        self.color = color;
        self
    }

    #[must_use]
    pub const fn with_default_zone(mut self, zone: Tz) -> Self {
        self.default_zone = Some(zone);
        self
    }
}

/// A DATE or DATE-TIME value as written in the feed.
///
/// Zone resolution is deferred to expansion; nothing here defaults to UTC.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimeValue {
    /// All-day date
    Date(NaiveDate),
    /// Local time without zone
    Floating(NaiveDateTime),
    /// UTC time (trailing `Z`)
    Utc(DateTime<Utc>),
    /// Local time qualified by a TZID parameter
    Zoned { local: NaiveDateTime, tzid: String },
}

impl TimeValue {
    /// Parses a single DATE / DATE-TIME value.
    pub fn parse(value: &str, tzid: Option<&str>, date_only: bool) -> Result<Self, String> {
        let value = value.trim();

        if value.len() == 8 {
            return NaiveDate::parse_from_str(value, "%Y%m%d")
                .map(Self::Date)
                .map_err(|e| e.to_string());
        }
        if date_only {
            return Err("VALUE=DATE requires YYYYMMDD".to_string());
        }

        if let Some(utc) = value.strip_suffix('Z') {
            return NaiveDateTime::parse_from_str(utc, "%Y%m%dT%H%M%S")
                .map(|dt| Self::Utc(dt.and_utc()))
                .map_err(|e| e.to_string());
        }

        let local =
            NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S").map_err(|e| e.to_string())?;
        Ok(match tzid {
            Some(tzid) if !tzid.trim().is_empty() => Self::Zoned {
                local,
                tzid: tzid.trim().to_string(),
            },
            _ => Self::Floating(local),
        })
    }

    pub const fn is_date(&self) -> bool {
        matches!(self, Self::Date(_))
    }

    /// Wall-clock value; dates start at midnight, UTC values stay in UTC.
    pub fn local(&self) -> NaiveDateTime {
        match self {
            Self::Date(date) => date.and_time(NaiveTime::MIN),
            Self::Floating(local) | Self::Zoned { local, .. } => *local,
            Self::Utc(utc) => utc.naive_utc(),
        }
    }

    pub fn tzid(&self) -> Option<&str> {
        match self {
            Self::Zoned { tzid, .. } => Some(tzid),
            _ => None,
        }
    }
}

impl fmt::Display for TimeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Date(date) => write!(f, "{}", date.format("%Y%m%d")),
            Self::Floating(local) => write!(f, "{}", local.format("%Y%m%dT%H%M%S")),
            Self::Utc(utc) => write!(f, "{}", utc.format("%Y%m%dT%H%M%SZ")),
            Self::Zoned { local, tzid } => {
                write!(f, "TZID={}:{}", tzid, local.format("%Y%m%dT%H%M%S"))
            }
        }
    }
}

/// Half-open `[from, to)` range in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl DateWindow {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self, WindowError> {
        if from >= to {
            return Err(WindowError::Empty);
        }
        Ok(Self { from, to })
    }

    /// Parses window bounds given as RFC 3339 instants or `YYYY-MM-DD` dates.
    ///
    /// Dates denote local midnight in `zone`.
    pub fn parse(from: &str, to: &str, zone: Tz) -> Result<Self, WindowError> {
        Self::new(parse_bound(from, zone)?, parse_bound(to, zone)?)
    }

    /// The whole calendar month in `zone`.
    pub fn month(year: i32, month: u32, zone: Tz) -> Result<Self, WindowError> {
        let first = NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or(WindowError::InvalidMonth { year, month })?;
        let next = if month == 12 {
            NaiveDate::from_ymd_opt(year + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(year, month + 1, 1)
        }
        .ok_or(WindowError::InvalidMonth { year, month })?;

        Self::new(
            zone::localize(first.and_time(NaiveTime::MIN), zone),
            zone::localize(next.and_time(NaiveTime::MIN), zone),
        )
    }

    /// Builds a window from optional query parameters: `from`+`to` wins over `year`+`month`.
    pub fn from_parts(
        from: Option<&str>,
        to: Option<&str>,
        year: Option<i32>,
        month: Option<u32>,
        zone: Tz,
    ) -> Result<Self, WindowError> {
        match (from, to, year, month) {
            (Some(from), Some(to), _, _) => Self::parse(from, to, zone),
            (None, None, Some(year), Some(month)) => Self::month(year, month, zone),
            _ => Err(WindowError::Missing),
        }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.from <= instant && instant < self.to
    }

    /// Whether `[start, end)` intersects the window; `start == end` is a point marker.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        if end <= start {
            return self.contains(start);
        }
        start < self.to && end > self.from
    }

    /// First and last calendar date touched by the window in `zone`.
    pub fn local_dates(&self, zone: Tz) -> (NaiveDate, NaiveDate) {
        let first = self.from.with_timezone(&zone).date_naive();
        let last = (self.to - chrono::Duration::nanoseconds(1))
            .with_timezone(&zone)
            .date_naive();
        (first, last.max(first))
    }
}

fn parse_bound(value: &str, zone: Tz) -> Result<DateTime<Utc>, WindowError> {
    let value = value.trim();
    if let Ok(instant) = DateTime::parse_from_rfc3339(value) {
        return Ok(instant.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(|date| zone::localize(date.and_time(NaiveTime::MIN), zone))
        .map_err(|_| WindowError::InvalidBound(value.to_string()))
}

/// 网格周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    #[default]
    Daily,
    Weekly,
    Monthly,
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" | "day" => Ok(Self::Daily),
            "weekly" | "week" => Ok(Self::Weekly),
            "monthly" | "month" => Ok(Self::Monthly),
            other => Err(format!(
                "Unknown period '{}': expected daily, weekly or monthly",
                other
            )),
        }
    }
}

/// Grid granularity, per-cell capacity and the zone used for calendar dates.
#[derive(Debug, Clone, Copy)]
pub struct GridShape {
    pub period: Period,
    /// `None` shows every occurrence
    pub capacity: Option<usize>,
    pub zone: Tz,
}

impl GridShape {
    pub const fn new(period: Period, capacity: Option<usize>, zone: Tz) -> Self {
        Self {
            period,
            capacity,
            zone,
        }
    }
}

impl Default for GridShape {
    fn default() -> Self {
        Self::new(Period::Daily, None, Tz::UTC)
    }
}

/// One concrete, dated instance of an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Occurrence {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub title: String,
    /// UID of the component that produced this occurrence
    pub source_id: String,
    pub all_day: bool,
    pub location: Option<String>,
    /// Original instant when this is an instance of a series
    pub recurrence_id: Option<DateTime<Utc>>,
    pub calendar: Option<String>,
    pub color: Option<String>,
}

impl Occurrence {
    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }
}

impl Ord for Occurrence {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start
            .cmp(&other.start)
            .then_with(|| self.source_id.cmp(&other.source_id))
            .then_with(|| self.calendar.cmp(&other.calendar))
            .then_with(|| self.end.cmp(&other.end))
            .then_with(|| self.recurrence_id.cmp(&other.recurrence_id))
            .then_with(|| self.title.cmp(&other.title))
            .then_with(|| self.all_day.cmp(&other.all_day))
            .then_with(|| self.location.cmp(&other.location))
            .then_with(|| self.color.cmp(&other.color))
    }
}

impl PartialOrd for Occurrence {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// 局部错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WarningKind {
    /// Malformed recurrence rule, event skipped
    Recurrence,
    /// Unknown TZID, default zone used
    UnknownZone,
    /// Series stopped at the generation cap
    GenerationLimit,
}

/// A local failure recorded while the render went on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    pub component: String,
    pub calendar: Option<String>,
    pub kind: WarningKind,
    pub message: String,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.calendar {
            Some(ref calendar) => write!(
                f,
                "[{:?}] {}/{}: {}",
                self.kind, calendar, self.component, self.message
            ),
            None => write!(f, "[{:?}] {}: {}", self.kind, self.component, self.message),
        }
    }
}

/// Two-letter weekday code used in day labels.
pub fn weekday_code(date: NaiveDate) -> &'static str {
    match date.weekday() {
        chrono::Weekday::Mon => "MO",
        chrono::Weekday::Tue => "TU",
        chrono::Weekday::Wed => "WE",
        chrono::Weekday::Thu => "TH",
        chrono::Weekday::Fri => "FR",
        chrono::Weekday::Sat => "SA",
        chrono::Weekday::Sun => "SU",
    }
}
