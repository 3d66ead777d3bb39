//! VTIMEZONE definitions.
//!
//! Feeds from Exchange and older clients name zones such as
//! `Customized Time Zone` that no zone database knows; the offsets declared in
//! the calendar's own VTIMEZONE block are used instead.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use ical::{parser::ical::component::IcalTimeZone, property::Property};

use crate::{
    error::{ParseError, RecurrenceError},
    rrule::RecurrenceRule,
    types::TimeValue,
};

/// Onsets further back than this cannot be the latest transition of a yearly rule.
const LOOKBACK_DAYS: i64 = 400;

/// One STANDARD or DAYLIGHT block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observance {
    /// UTC offset in seconds before the onset
    pub offset_from: i32,
    /// UTC offset in seconds from the onset on
    pub offset_to: i32,
    /// First onset, in the wall-clock time of `offset_from`
    pub onset: NaiveDateTime,
    pub rule: Option<RecurrenceRule>,
    pub rdates: Vec<NaiveDateTime>,
}

impl Observance {
    /// Latest local time at which this observance took effect, at or before `local`.
    ///
    /// A forward jump only applies once the new clock has passed the onset, so
    /// times in the gap keep the old offset and times in a fold keep the
    /// earlier one.
    fn last_effective(&self, local: NaiveDateTime) -> Option<NaiveDateTime> {
        let jump = Duration::seconds(i64::from((self.offset_to - self.offset_from).max(0)));
        let mut onsets = self.rdates.clone();
        onsets.push(self.onset);

        if let Some(ref rule) = self.rule {
            let from = local
                .checked_sub_signed(Duration::days(LOOKBACK_DAYS))
                .unwrap_or(NaiveDateTime::MIN);
            let to = local
                .checked_add_signed(Duration::days(1))
                .unwrap_or(NaiveDateTime::MAX);
            if let Ok(expanded) = rule.expand(self.onset, from..to, 64) {
                onsets.extend(
                    expanded
                        .dates
                        .into_iter()
                        .filter(|onset| rule.within_until(*onset, self.instant(*onset))),
                );
            }
        }

        onsets
            .into_iter()
            .map(|onset| onset.checked_add_signed(jump).unwrap_or(onset))
            .filter(|effective| *effective <= local)
            .max()
    }

    fn instant(&self, onset: NaiveDateTime) -> DateTime<Utc> {
        shift(onset, self.offset_from)
    }
}

/// 自定义时区定义
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VTimezone {
    pub tzid: String,
    observances: Vec<Observance>,
}

impl VTimezone {
    pub fn new(tzid: impl Into<String>, observances: Vec<Observance>) -> Self {
        Self {
            tzid: tzid.into(),
            observances,
        }
    }

    pub fn observances(&self) -> &[Observance] {
        &self.observances
    }

    /// Reads a VTIMEZONE block.
    pub fn from_ical(zone: &IcalTimeZone) -> Result<Self, ParseError> {
        let tzid = value(&zone.properties, "TZID")
            .map(str::trim)
            .filter(|tzid| !tzid.is_empty())
            .ok_or_else(|| ParseError::MissingProperty {
                component: "VTIMEZONE".to_string(),
                property: "TZID",
            })?
            .to_string();

        let observances = zone
            .transitions
            .iter()
            .map(|transition| read_observance(&tzid, &transition.properties))
            .collect::<Result<Vec<_>, _>>()?;
        if observances.is_empty() {
            return Err(ParseError::InvalidValue {
                property: "VTIMEZONE".to_string(),
                value: tzid,
                reason: "no STANDARD or DAYLIGHT block".to_string(),
            });
        }
        Ok(Self::new(tzid, observances))
    }

    /// UTC offset in seconds for a wall-clock time.
    pub fn offset_at(&self, local: NaiveDateTime) -> i32 {
        let latest = self
            .observances
            .iter()
            .filter_map(|obs| obs.last_effective(local).map(|at| (at, obs.offset_to)))
            .max_by_key(|(at, _)| *at);
        match latest {
            Some((_, offset)) => offset,
            None => self
                .observances
                .iter()
                .min_by_key(|obs| obs.onset)
                .map_or(0, |obs| obs.offset_from),
        }
    }

    pub fn localize(&self, local: NaiveDateTime) -> DateTime<Utc> {
        shift(local, self.offset_at(local))
    }

    /// Wall-clock time of an instant.
    pub fn local_time(&self, instant: DateTime<Utc>) -> NaiveDateTime {
        let utc = instant.naive_utc();
        let guess = unshift(utc, self.offset_at(utc));
        unshift(utc, self.offset_at(guess))
    }
}

fn shift(local: NaiveDateTime, offset: i32) -> DateTime<Utc> {
    local
        .checked_sub_signed(Duration::seconds(i64::from(offset)))
        .unwrap_or(local)
        .and_utc()
}

fn unshift(utc: NaiveDateTime, offset: i32) -> NaiveDateTime {
    utc.checked_add_signed(Duration::seconds(i64::from(offset)))
        .unwrap_or(utc)
}

fn value<'a>(props: &'a [Property], name: &str) -> Option<&'a str> {
    props
        .iter()
        .find(|prop| prop.name.eq_ignore_ascii_case(name))
        .and_then(|prop| prop.value.as_deref())
}

fn invalid(tzid: &str, property: &str, raw: &str, reason: impl Into<String>) -> ParseError {
    ParseError::InvalidValue {
        property: format!("{tzid} {property}"),
        value: raw.to_string(),
        reason: reason.into(),
    }
}

fn read_observance(tzid: &str, props: &[Property]) -> Result<Observance, ParseError> {
    let required = |property: &'static str| {
        value(props, property).ok_or_else(|| ParseError::MissingProperty {
            component: tzid.to_string(),
            property,
        })
    };
    let offset = |property: &'static str| {
        let raw = required(property)?;
        parse_offset(raw).ok_or_else(|| invalid(tzid, property, raw, "expected +HHMM[SS]"))
    };
    let local = |raw: &str| {
        TimeValue::parse(raw, None, false)
            .map(|time| time.local())
            .map_err(|reason| invalid(tzid, "DTSTART", raw, reason))
    };

    let onset = local(required("DTSTART")?)?;
    let rule = match value(props, "RRULE") {
        Some(raw) => {
            let rule: RecurrenceRule = raw
                .parse()
                .map_err(|err: RecurrenceError| invalid(tzid, "RRULE", raw, err.to_string()))?;
            Some(rule)
        }
        None => None,
    };
    let rdates = props
        .iter()
        .filter(|prop| prop.name.eq_ignore_ascii_case("RDATE"))
        .filter_map(|prop| prop.value.as_deref())
        .flat_map(|raw| raw.split(','))
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .map(local)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Observance {
        offset_from: offset("TZOFFSETFROM")?,
        offset_to: offset("TZOFFSETTO")?,
        onset,
        rule,
        rdates,
    })
}

/// Parses `+HHMM` or `-HHMMSS` into seconds east of UTC.
pub fn parse_offset(raw: &str) -> Option<i32> {
    let raw = raw.trim();
    let (sign, digits) = match raw.as_bytes().first()? {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => return None,
    };
    if !(digits.len() == 4 || digits.len() == 6) || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let field = |range: std::ops::Range<usize>| digits.get(range)?.parse::<i32>().ok();
    let hours = field(0..2)?;
    let minutes = field(2..4)?;
    let seconds = if digits.len() == 6 { field(4..6)? } else { 0 };
    if minutes > 59 || seconds > 59 {
        return None;
    }
    Some(sign * (hours * 3_600 + minutes * 60 + seconds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use ical::parser::ical::IcalParser;

    const CUSTOM: &str = "BEGIN:VCALENDAR\r\n\
        VERSION:2.0\r\n\
        BEGIN:VTIMEZONE\r\n\
        TZID:Customized Time Zone\r\n\
        BEGIN:STANDARD\r\n\
        DTSTART:16010101T020000\r\n\
        TZOFFSETFROM:-0400\r\n\
        TZOFFSETTO:-0500\r\n\
        RRULE:FREQ=YEARLY;INTERVAL=1;BYDAY=1SU;BYMONTH=11\r\n\
        END:STANDARD\r\n\
        BEGIN:DAYLIGHT\r\n\
        DTSTART:16010101T020000\r\n\
        TZOFFSETFROM:-0500\r\n\
        TZOFFSETTO:-0400\r\n\
        RRULE:FREQ=YEARLY;INTERVAL=1;BYDAY=2SU;BYMONTH=3\r\n\
        END:DAYLIGHT\r\n\
        END:VTIMEZONE\r\n\
        END:VCALENDAR\r\n";

    fn custom() -> VTimezone {
        let calendar = IcalParser::new(CUSTOM.as_bytes())
            .next()
            .expect("calendar")
            .expect("valid calendar");
        VTimezone::from_ical(&calendar.timezones[0]).expect("valid zone")
    }

    fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn parses_offsets() {
        assert_eq!(parse_offset("+0100"), Some(3_600));
        assert_eq!(parse_offset("-0530"), Some(-19_800));
        assert_eq!(parse_offset("+053045"), Some(19_845));
        assert_eq!(parse_offset("0100"), None);
        assert_eq!(parse_offset("+01:00"), None);
        assert_eq!(parse_offset("+0160"), None);
    }

    #[test]
    fn reads_observances() {
        let zone = custom();
        assert_eq!(zone.tzid, "Customized Time Zone");
        assert_eq!(zone.observances().len(), 2);
        assert!(zone.observances().iter().all(|obs| obs.rule.is_some()));
    }

    #[test]
    fn standard_and_daylight_offsets() {
        let zone = custom();
        assert_eq!(zone.offset_at(local(2024, 1, 15, 9, 0)), -18_000);
        assert_eq!(zone.offset_at(local(2024, 7, 15, 9, 0)), -14_400);
        assert_eq!(
            zone.localize(local(2024, 1, 15, 9, 0)),
            Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).unwrap()
        );
        assert_eq!(
            zone.local_time(Utc.with_ymd_and_hms(2024, 7, 15, 13, 0, 0).unwrap()),
            local(2024, 7, 15, 9, 0)
        );
    }

    #[test]
    fn gap_and_fold_follow_the_iana_policy() {
        let zone = custom();
        // 2024-03-10 02:30 does not exist; it keeps the standard offset.
        assert_eq!(
            zone.localize(local(2024, 3, 10, 2, 30)),
            Utc.with_ymd_and_hms(2024, 3, 10, 7, 30, 0).unwrap()
        );
        // 2024-11-03 01:30 happens twice; the earlier instant wins.
        assert_eq!(
            zone.localize(local(2024, 11, 3, 1, 30)),
            Utc.with_ymd_and_hms(2024, 11, 3, 5, 30, 0).unwrap()
        );
        assert_eq!(
            zone.localize(local(2024, 11, 3, 2, 30)),
            Utc.with_ymd_and_hms(2024, 11, 3, 7, 30, 0).unwrap()
        );
    }

    #[test]
    fn fixed_zone_without_rules() {
        let zone = VTimezone::new(
            "Fixed",
            vec![Observance {
                offset_from: 19_800,
                offset_to: 19_800,
                onset: local(1970, 1, 1, 0, 0),
                rule: None,
                rdates: Vec::new(),
            }],
        );
        assert_eq!(
            zone.localize(local(2024, 5, 1, 12, 0)),
            Utc.with_ymd_and_hms(2024, 5, 1, 6, 30, 0).unwrap()
        );
        // Before the first onset the offset it replaced applies.
        assert_eq!(zone.offset_at(local(1960, 1, 1, 0, 0)), 19_800);
    }

    #[test]
    fn observance_without_offsets_is_rejected() {
        let broken = CUSTOM.replace("TZOFFSETTO:-0500\r\n", "");
        let calendar = IcalParser::new(broken.as_bytes())
            .next()
            .unwrap()
            .unwrap();
        assert!(matches!(
            VTimezone::from_ical(&calendar.timezones[0]),
            Err(ParseError::MissingProperty {
                property: "TZOFFSETTO",
                ..
            })
        ));
    }
}
