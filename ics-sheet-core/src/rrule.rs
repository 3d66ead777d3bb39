//! RRULE parsing and expansion on top of the `rrule` crate.
//!
//! Rules are evaluated on wall-clock time: the series' local DTSTART is handed
//! to the crate as a UTC value, and the produced local times are placed into
//! the series' zone afterwards. DST transitions therefore shift the offset
//! instead of duplicating or skipping instances.

use std::{ops::Range, str::FromStr};

use ::rrule::{RRule, Tz, Unvalidated};
use chrono::{DateTime, Datelike, Duration, Months, NaiveDateTime, Utc};

use crate::{error::RecurrenceError, types::TimeValue};

/// 重复频率
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Secondly,
    Minutely,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl FromStr for Frequency {
    type Err = RecurrenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SECONDLY" => Ok(Self::Secondly),
            "MINUTELY" => Ok(Self::Minutely),
            "HOURLY" => Ok(Self::Hourly),
            "DAILY" => Ok(Self::Daily),
            "WEEKLY" => Ok(Self::Weekly),
            "MONTHLY" => Ok(Self::Monthly),
            "YEARLY" => Ok(Self::Yearly),
            _ => Err(RecurrenceError::UnsupportedFrequency(s.to_string())),
        }
    }
}

/// 重复规则
///
/// COUNT stays with the crate; UNTIL is applied by [`RecurrenceRule::within_until`]
/// because it may be a UTC instant while the crate works on wall-clock time.
#[derive(Debug, Clone)]
pub struct RecurrenceRule {
    pub frequency: Frequency,
    pub interval: u32,
    pub count: Option<u32>,
    /// Inclusive bound
    pub until: Option<TimeValue>,
    /// Parts handed to the crate
    body: String,
    rule: RRule<Unvalidated>,
}

impl PartialEq for RecurrenceRule {
    fn eq(&self, other: &Self) -> bool {
        self.until == other.until && self.body == other.body
    }
}

impl Eq for RecurrenceRule {}

impl FromStr for RecurrenceRule {
    type Err = RecurrenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s.trim();
        let body = body
            .get(..6)
            .filter(|prefix| prefix.eq_ignore_ascii_case("RRULE:"))
            .map_or(body, |_| &body[6..]);

        let mut frequency = None;
        let mut interval = 1;
        let mut count = None;
        let mut until = None;
        let mut kept = Vec::new();

        for part in body.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=').ok_or_else(|| RecurrenceError::InvalidPart {
                part: part.to_string(),
                value: String::new(),
            })?;
            let key = key.trim().to_ascii_uppercase();
            let value = value.trim();

            match key.as_str() {
                "FREQ" => frequency = Some(value.parse::<Frequency>()?),
                "INTERVAL" => interval = positive(&key, value)?,
                "COUNT" => count = Some(positive(&key, value)?),
                "UNTIL" => {
                    until = Some(
                        TimeValue::parse(value, None, false).map_err(|_| invalid(&key, value))?,
                    );
                    continue;
                }
                other if other.starts_with("X-") => continue,
                _ => {}
            }
            kept.push(format!("{key}={value}"));
        }

        let frequency = frequency.ok_or(RecurrenceError::MissingFrequency)?;
        if count.is_some() && until.is_some() {
            return Err(RecurrenceError::CountAndUntil);
        }

        let body = kept.join(";");
        let rule = body
            .parse::<RRule<Unvalidated>>()
            .map_err(|err| RecurrenceError::Rule(err.to_string()))?;

        Ok(Self {
            frequency,
            interval,
            count,
            until,
            body,
            rule,
        })
    }
}

fn invalid(key: &str, value: &str) -> RecurrenceError {
    RecurrenceError::InvalidPart {
        part: key.to_string(),
        value: value.to_string(),
    }
}

fn positive(key: &str, value: &str) -> Result<u32, RecurrenceError> {
    value
        .parse::<u32>()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| invalid(key, value))
}

/// Wall-clock instances produced for one range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Expanded {
    /// Sorted, without duplicates
    pub dates: Vec<NaiveDateTime>,
    /// The generation cap was reached before the range was exhausted.
    pub limited: bool,
}

/// Local time as a crate value; the crate only sees wall-clock time.
fn wall(local: NaiveDateTime) -> DateTime<Tz> {
    local.and_utc().with_timezone(&Tz::UTC)
}

impl RecurrenceRule {
    /// Instances of the series starting at `dtstart` whose local time falls in `range`.
    ///
    /// DTSTART is always the first instance, even when the rule itself would not
    /// produce it. UNTIL is not applied here.
    pub fn expand(
        &self,
        dtstart: NaiveDateTime,
        range: Range<NaiveDateTime>,
        limit: usize,
    ) -> Result<Expanded, RecurrenceError> {
        if range.start >= range.end {
            return Ok(Expanded::default());
        }
        let start = self.rebase(dtstart, range.start);
        let set = self
            .rule
            .clone()
            .build(wall(start))
            .map_err(|err| RecurrenceError::Rule(err.to_string()))?;

        let cap = u16::try_from(limit).unwrap_or(u16::MAX);
        let after = range
            .start
            .checked_sub_signed(Duration::seconds(1))
            .unwrap_or(range.start);
        let result = set.after(wall(after)).before(wall(range.end)).all(cap);
        let limited = result.limited || result.dates.len() >= usize::from(cap);

        let mut dates: Vec<NaiveDateTime> = result
            .dates
            .iter()
            .map(DateTime::naive_utc)
            .filter(|local| range.contains(local))
            .collect();
        if range.contains(&dtstart) {
            dates.push(dtstart);
        }
        dates.sort_unstable();
        dates.dedup();

        Ok(Expanded { dates, limited })
    }

    /// Moves DTSTART forward by whole periods so the crate does not walk
    /// decades of instances before `from`.
    ///
    /// Only rules without COUNT are moved; a one-period margin stays in front of `from`.
    fn rebase(&self, dtstart: NaiveDateTime, from: NaiveDateTime) -> NaiveDateTime {
        if self.count.is_some() || from <= dtstart {
            return dtstart;
        }
        let interval = i64::from(self.interval);
        let elapsed = from.signed_duration_since(dtstart);

        let seconds = |unit: i64| {
            let step = unit.checked_mul(interval)?;
            let periods = elapsed.num_seconds() / step - 1;
            if periods <= 0 {
                return None;
            }
            dtstart.checked_add_signed(Duration::try_seconds(periods.checked_mul(step)?)?)
        };
        let months = |unit: u32| {
            if dtstart.day() > 28 {
                return None;
            }
            let step = unit.checked_mul(self.interval)?;
            let years = u32::try_from(from.year() - dtstart.year()).ok()?;
            let elapsed = (years.checked_mul(12)? + from.month0()).checked_sub(dtstart.month0())?;
            let periods = (elapsed / step).checked_sub(1)?;
            dtstart.checked_add_months(Months::new(periods.checked_mul(step)?))
        };

        let rebased = match self.frequency {
            Frequency::Secondly => seconds(1),
            Frequency::Minutely => seconds(60),
            Frequency::Hourly => seconds(3_600),
            Frequency::Daily => seconds(86_400),
            Frequency::Weekly => seconds(7 * 86_400),
            Frequency::Monthly => months(1),
            Frequency::Yearly => months(12),
        };
        rebased.filter(|start| *start <= from).unwrap_or(dtstart)
    }

    /// Whether an instance lies within the rule's UNTIL bound.
    pub fn within_until(&self, local: NaiveDateTime, instant: DateTime<Utc>) -> bool {
        match &self.until {
            None => true,
            Some(TimeValue::Date(date)) => local.date() <= *date,
            Some(TimeValue::Utc(until)) => instant <= *until,
            Some(other) => local <= other.local(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Weekday};

    fn local(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn dates(rule: &str, start: NaiveDateTime) -> Vec<NaiveDate> {
        let rule: RecurrenceRule = rule.parse().expect("valid rule");
        rule.expand(start, start..local(2100, 1, 1, 0), 1_000)
            .expect("expandable rule")
            .dates
            .into_iter()
            .filter(|date| rule.within_until(*date, date.and_utc()))
            .map(|date| date.date())
            .collect()
    }

    #[test]
    fn parses_frequency_interval_and_bounds() {
        let rule: RecurrenceRule =
            "RRULE:FREQ=MONTHLY;INTERVAL=2;BYDAY=-1FR,2MO;UNTIL=20241231T235959Z;WKST=SU"
                .parse()
                .unwrap();
        assert_eq!(rule.frequency, Frequency::Monthly);
        assert_eq!(rule.interval, 2);
        assert_eq!(rule.count, None);
        assert!(matches!(rule.until, Some(TimeValue::Utc(_))));

        let rule: RecurrenceRule = "FREQ=WEEKLY;COUNT=3;X-NAME=1".parse().unwrap();
        assert_eq!(rule.count, Some(3));
    }

    #[test]
    fn rejects_malformed_rules() {
        let err = |s: &str| s.parse::<RecurrenceRule>().unwrap_err();
        assert_eq!(err("INTERVAL=2"), RecurrenceError::MissingFrequency);
        assert_eq!(
            err("FREQ=WEEKLY;COUNT=3;UNTIL=20240101"),
            RecurrenceError::CountAndUntil
        );
        assert_eq!(
            err("FREQ=SOMETIMES"),
            RecurrenceError::UnsupportedFrequency("SOMETIMES".to_string())
        );
        assert!(matches!(
            err("FREQ=DAILY;INTERVAL=0"),
            RecurrenceError::InvalidPart { .. }
        ));
        assert!(matches!(
            err("FREQ=DAILY;UNTIL=someday"),
            RecurrenceError::InvalidPart { .. }
        ));
        assert!(matches!(err("FREQ=DAILY;BOGUS=1"), RecurrenceError::Rule(_)));
    }

    #[test]
    fn out_of_range_parts_fail_on_expansion() {
        let rule: RecurrenceRule = "FREQ=MONTHLY;BYMONTHDAY=40".parse().unwrap();
        let start = local(2024, 1, 1, 9);
        assert!(matches!(
            rule.expand(start, start..local(2025, 1, 1, 0), 10),
            Err(RecurrenceError::Rule(_))
        ));
    }

    #[test]
    fn weekly_byday_with_interval() {
        // 2024-01-01 is a Monday.
        let got = dates("FREQ=WEEKLY;INTERVAL=2;BYDAY=MO,WE;COUNT=5", local(2024, 1, 1, 9));
        assert_eq!(
            got,
            vec![
                ymd(2024, 1, 1),
                ymd(2024, 1, 3),
                ymd(2024, 1, 15),
                ymd(2024, 1, 17),
                ymd(2024, 1, 29),
            ]
        );
    }

    #[test]
    fn by_hour_expands_within_the_day() {
        let rule: RecurrenceRule = "FREQ=WEEKLY;BYDAY=MO;BYHOUR=9,14;COUNT=4".parse().unwrap();
        let start = local(2024, 1, 1, 9);
        let got = rule
            .expand(start, start..local(2025, 1, 1, 0), 100)
            .unwrap()
            .dates;
        assert_eq!(
            got,
            vec![
                local(2024, 1, 1, 9),
                local(2024, 1, 1, 14),
                local(2024, 1, 8, 9),
                local(2024, 1, 8, 14),
            ]
        );
        assert!(got.iter().all(|date| date.weekday() == Weekday::Mon));
    }

    #[test]
    fn monthly_skips_short_months() {
        let got = dates("FREQ=MONTHLY;COUNT=4", local(2024, 1, 31, 9));
        assert_eq!(
            got,
            vec![
                ymd(2024, 1, 31),
                ymd(2024, 3, 31),
                ymd(2024, 5, 31),
                ymd(2024, 7, 31),
            ]
        );
    }

    #[test]
    fn monthly_last_weekday_with_setpos() {
        let got = dates(
            "FREQ=MONTHLY;BYDAY=MO,TU,WE,TH,FR;BYSETPOS=-1;COUNT=3",
            local(2024, 3, 29, 17),
        );
        assert_eq!(got, vec![ymd(2024, 3, 29), ymd(2024, 4, 30), ymd(2024, 5, 31)]);
    }

    #[test]
    fn yearly_thanksgiving() {
        let got = dates("FREQ=YEARLY;BYMONTH=11;BYDAY=4TH;COUNT=2", local(2024, 11, 28, 12));
        assert_eq!(got, vec![ymd(2024, 11, 28), ymd(2025, 11, 27)]);
    }

    #[test]
    fn until_is_inclusive() {
        let got = dates("FREQ=DAILY;UNTIL=20240103T100000Z", local(2024, 1, 1, 10));
        assert_eq!(got, vec![ymd(2024, 1, 1), ymd(2024, 1, 2), ymd(2024, 1, 3)]);

        let got = dates("FREQ=DAILY;UNTIL=20240102", local(2024, 1, 1, 10));
        assert_eq!(got, vec![ymd(2024, 1, 1), ymd(2024, 1, 2)]);
    }

    #[test]
    fn dtstart_is_kept_when_rule_does_not_match_it() {
        // 2024-01-02 is a Tuesday.
        let got = dates("FREQ=WEEKLY;BYDAY=MO;COUNT=2", local(2024, 1, 2, 9));
        assert_eq!(got.first(), Some(&ymd(2024, 1, 2)));
        assert!(got[1..].iter().all(|date| date.weekday() == Weekday::Mon));
    }

    #[test]
    fn old_dtstart_is_rebased_to_the_range() {
        let rule: RecurrenceRule = "FREQ=DAILY".parse().unwrap();
        let range = local(2024, 1, 1, 0)..local(2024, 2, 1, 0);
        let expanded = rule.expand(local(1724, 1, 1, 7), range, 100).unwrap();
        assert!(!expanded.limited);
        assert_eq!(expanded.dates.len(), 31);
        assert_eq!(expanded.dates[0], local(2024, 1, 1, 7));

        let rule: RecurrenceRule = "FREQ=WEEKLY;INTERVAL=3".parse().unwrap();
        let start = local(2000, 1, 3, 8);
        let range = local(2024, 1, 1, 0)..local(2024, 3, 1, 0);
        let expanded = rule.expand(start, range, 100).unwrap();
        for date in &expanded.dates {
            let weeks = date.signed_duration_since(start).num_weeks();
            assert_eq!(weeks % 3, 0, "{date}");
        }
        assert_eq!(expanded.dates.len(), 3);
    }

    #[test]
    fn cap_marks_result_as_limited() {
        let rule: RecurrenceRule = "FREQ=HOURLY".parse().unwrap();
        let start = local(2024, 1, 1, 0);
        let expanded = rule.expand(start, start..local(2024, 2, 1, 0), 24).unwrap();
        assert!(expanded.limited);
        assert_eq!(expanded.dates.len(), 24);
    }

    #[test]
    fn never_matching_rule_yields_only_dtstart() {
        let got = dates("FREQ=YEARLY;BYMONTH=2;BYMONTHDAY=30", local(2024, 1, 1, 10));
        assert_eq!(got, vec![ymd(2024, 1, 1)]);
    }
}
