//! ICS → [`ComponentSet`].
//!
//! Structural parsing (content lines, unfolding, BEGIN/END nesting) is done
//! by `ical`; this module classifies VEVENTs into single events, recurring
//! series and exception overrides.

use std::{
    collections::{BTreeMap, btree_map::Entry},
    io::{BufReader, Read},
    sync::Arc,
};

use chrono::Duration;
use ical::{
    parser::ical::{IcalParser, component::IcalEvent},
    property::Property,
};

use crate::{error::ParseError, types::TimeValue, vtimezone::VTimezone};

/// Event payload shared by every component kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventData {
    pub summary: String,
    pub start: TimeValue,
    pub end: Option<TimeValue>,
    pub duration: Option<Duration>,
    pub location: Option<String>,
}

/// A series master: DTSTART + RRULE (+ RDATE).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurringEvent {
    pub event: EventData,
    /// Raw RRULE value; validated during expansion
    pub rule: Option<String>,
    pub rdates: Vec<TimeValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverrideAction {
    Cancel,
    Substitute(EventData),
}

/// Cancellation or replacement of one instance of a series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionOverride {
    /// UID of the recurring event
    pub master: String,
    /// Original instant of the instance, as written (RECURRENCE-ID / EXDATE)
    pub original: TimeValue,
    pub action: OverrideAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Component {
    Single(EventData),
    Recurring(RecurringEvent),
    Override(ExceptionOverride),
}

/// UID, plus the original instant for overrides.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentKey {
    pub uid: String,
    pub recurrence_id: Option<String>,
}

impl ComponentKey {
    pub fn master(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            recurrence_id: None,
        }
    }

    pub fn instance(uid: impl Into<String>, original: &TimeValue) -> Self {
        Self {
            uid: uid.into(),
            recurrence_id: Some(original.to_string()),
        }
    }

    /// Identifier reported on occurrences and warnings.
    pub fn id(&self) -> String {
        match self.recurrence_id {
            Some(ref rid) => format!("{}@{}", self.uid, rid),
            None => self.uid.clone(),
        }
    }
}

/// 解析后的日历组件集合
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComponentSet {
    components: BTreeMap<ComponentKey, Component>,
    /// X-WR-TIMEZONE
    pub default_zone: Option<String>,
    /// X-WR-CALNAME
    pub name: Option<String>,
    /// VTIMEZONE definitions by TZID
    pub timezones: BTreeMap<String, Arc<VTimezone>>,
}

impl ComponentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a component; the first definition of a key wins.
    ///
    /// An override is only accepted when its master is a recurring event;
    /// otherwise it is stored as a single event so no override dangles.
    pub fn insert(&mut self, key: ComponentKey, component: Component) -> bool {
        let component = match component {
            Component::Override(exception) => {
                let master_is_recurring = matches!(
                    self.components.get(&ComponentKey::master(exception.master.clone())),
                    Some(Component::Recurring(_))
                );
                match (master_is_recurring, exception.action) {
                    (true, action) => Component::Override(ExceptionOverride {
                        action,
                        ..exception
                    }),
                    (false, OverrideAction::Substitute(event)) => {
                        tracing::debug!("Override {} has no recurring master", key.id());
                        Component::Single(event)
                    }
                    (false, OverrideAction::Cancel) => {
                        tracing::debug!("Dropping cancellation {} without master", key.id());
                        return false;
                    }
                }
            }
            other => other,
        };

        match self.components.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(component);
                true
            }
            Entry::Occupied(slot) => {
                tracing::warn!("Duplicate component {}, keeping the first", slot.key().id());
                false
            }
        }
    }

    pub fn get(&self, key: &ComponentKey) -> Option<&Component> {
        self.components.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ComponentKey, &Component)> {
        self.components.iter()
    }

    /// Overrides belonging to series `uid`.
    pub fn overrides_for<'a>(
        &'a self,
        uid: &'a str,
    ) -> impl Iterator<Item = &'a ExceptionOverride> + 'a {
        self.components
            .range(ComponentKey::master(uid)..)
            .take_while(move |(key, _)| key.uid == uid)
            .filter_map(|(_, component)| match component {
                Component::Override(exception) => Some(exception),
                _ => None,
            })
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Parses raw ICS bytes.
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Result<Self, ParseError> {
        parse(std::io::Cursor::new(bytes.as_ref()))
    }
}

/// Intermediate VEVENT before master/override classification.
struct RawEvent {
    uid: String,
    data: EventData,
    rrule: Option<String>,
    rdates: Vec<TimeValue>,
    exdates: Vec<TimeValue>,
    recurrence_id: Option<TimeValue>,
    cancelled: bool,
}

/// Parses every VCALENDAR in `reader` into one component set.
pub fn parse<R: Read>(reader: R) -> Result<ComponentSet, ParseError> {
    let parser = IcalParser::new(BufReader::new(reader));
    let mut set = ComponentSet::new();
    let mut calendars = 0usize;
    let mut raw_events = Vec::new();

    for calendar in parser {
        let calendar = calendar.map_err(|err| ParseError::Structure(err.to_string()))?;
        calendars += 1;

        if set.default_zone.is_none() {
            set.default_zone = property_value(&calendar.properties, "X-WR-TIMEZONE")
                .map(|tz| tz.trim().to_string())
                .filter(|tz| !tz.is_empty());
        }
        if set.name.is_none() {
            set.name = property_value(&calendar.properties, "X-WR-CALNAME").map(unescape_text);
        }

        for zone in &calendar.timezones {
            match VTimezone::from_ical(zone) {
                Ok(zone) => {
                    set.timezones
                        .entry(zone.tzid.clone())
                        .or_insert_with(|| Arc::new(zone));
                }
                Err(err) => tracing::warn!("Ignoring VTIMEZONE: {}", err),
            }
        }

        for event in &calendar.events {
            raw_events.push(read_event(event)?);
        }
    }

    if calendars == 0 {
        return Err(ParseError::NoCalendar);
    }

    // Masters first so overrides can find them regardless of feed order.
    let (overrides, masters): (Vec<_>, Vec<_>) = raw_events
        .into_iter()
        .partition(|event| event.recurrence_id.is_some());

    for event in masters {
        if event.cancelled {
            tracing::debug!("Skipping cancelled event {}", event.uid);
            continue;
        }
        let key = ComponentKey::master(event.uid.clone());
        let has_recurrence = event.rrule.is_some() || !event.rdates.is_empty();
        if !has_recurrence {
            set.insert(key, Component::Single(event.data));
            continue;
        }

        let inserted = set.insert(
            key,
            Component::Recurring(RecurringEvent {
                event: event.data,
                rule: event.rrule,
                rdates: event.rdates,
            }),
        );
        if inserted {
            for exdate in event.exdates {
                set.insert(
                    ComponentKey::instance(event.uid.clone(), &exdate),
                    Component::Override(ExceptionOverride {
                        master: event.uid.clone(),
                        original: exdate,
                        action: OverrideAction::Cancel,
                    }),
                );
            }
        }
    }

    for event in overrides {
        let Some(original) = event.recurrence_id else {
            continue;
        };
        let action = if event.cancelled {
            OverrideAction::Cancel
        } else {
            OverrideAction::Substitute(event.data)
        };
        set.insert(
            ComponentKey::instance(event.uid.clone(), &original),
            Component::Override(ExceptionOverride {
                master: event.uid,
                original,
                action,
            }),
        );
    }

    tracing::debug!("Parsed {} components from {} calendars", set.len(), calendars);
    Ok(set)
}

fn read_event(event: &IcalEvent) -> Result<RawEvent, ParseError> {
    let props = &event.properties;
    let uid = property_value(props, "UID")
        .map(str::trim)
        .filter(|uid| !uid.is_empty())
        .ok_or_else(|| ParseError::MissingProperty {
            component: "VEVENT".to_string(),
            property: "UID",
        })?
        .to_string();

    let start = time_property(props, "DTSTART")?.ok_or_else(|| ParseError::MissingProperty {
        component: uid.clone(),
        property: "DTSTART",
    })?;
    let end = time_property(props, "DTEND")?;
    let duration = match property_value(props, "DURATION") {
        Some(raw) => Some(parse_duration(raw).ok_or_else(|| ParseError::InvalidValue {
            property: "DURATION".to_string(),
            value: raw.to_string(),
            reason: "expected ISO 8601 duration".to_string(),
        })?),
        None => None,
    };

    let data = EventData {
        summary: property_value(props, "SUMMARY")
            .map(unescape_text)
            .unwrap_or_default(),
        start,
        end,
        duration,
        location: property_value(props, "LOCATION")
            .map(unescape_text)
            .filter(|location| !location.is_empty()),
    };

    Ok(RawEvent {
        uid,
        data,
        rrule: property_value(props, "RRULE").map(str::to_string),
        rdates: time_list(props, "RDATE")?,
        exdates: time_list(props, "EXDATE")?,
        recurrence_id: time_property(props, "RECURRENCE-ID")?,
        cancelled: property_value(props, "STATUS")
            .is_some_and(|status| status.trim().eq_ignore_ascii_case("CANCELLED")),
    })
}

fn find_property<'a>(props: &'a [Property], name: &str) -> Option<&'a Property> {
    props.iter().find(|prop| prop.name.eq_ignore_ascii_case(name))
}

fn property_value<'a>(props: &'a [Property], name: &str) -> Option<&'a str> {
    find_property(props, name).and_then(|prop| prop.value.as_deref())
}

fn param<'a>(prop: &'a Property, name: &str) -> Option<&'a str> {
    prop.params
        .as_ref()?
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .and_then(|(_, values)| values.first())
        .map(String::as_str)
}

fn parse_time(prop: &Property, value: &str) -> Result<TimeValue, ParseError> {
    let date_only = param(prop, "VALUE").is_some_and(|v| v.eq_ignore_ascii_case("DATE"));
    TimeValue::parse(value, param(prop, "TZID"), date_only).map_err(|reason| {
        ParseError::InvalidValue {
            property: prop.name.clone(),
            value: value.to_string(),
            reason,
        }
    })
}

fn time_property(props: &[Property], name: &str) -> Result<Option<TimeValue>, ParseError> {
    let Some(prop) = find_property(props, name) else {
        return Ok(None);
    };
    let value = prop.value.as_deref().unwrap_or_default();
    parse_time(prop, value).map(Some)
}

/// Every value of every occurrence of a multi-valued property (EXDATE, RDATE).
fn time_list(props: &[Property], name: &str) -> Result<Vec<TimeValue>, ParseError> {
    let mut values = Vec::new();
    for prop in props.iter().filter(|prop| prop.name.eq_ignore_ascii_case(name)) {
        if param(prop, "VALUE").is_some_and(|v| v.eq_ignore_ascii_case("PERIOD")) {
            tracing::debug!("Ignoring {} with PERIOD values", name);
            continue;
        }
        for value in prop
            .value
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            values.push(parse_time(prop, value)?);
        }
    }
    Ok(values)
}

/// Parses `[+-]P[nW][nD][T[nH][nM][nS]]`.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let (negative, rest) = match raw.as_bytes().first()? {
        b'-' => (true, &raw[1..]),
        b'+' => (false, &raw[1..]),
        _ => (false, raw),
    };
    let rest = rest.strip_prefix('P')?;
    if rest.is_empty() {
        return None;
    }

    let mut total = Duration::zero();
    let mut number = String::new();
    let mut in_time = false;
    for ch in rest.chars() {
        match ch {
            '0'..='9' => number.push(ch),
            'T' if !in_time && number.is_empty() => in_time = true,
            _ => {
                let n: i64 = number.parse().ok()?;
                number.clear();
                let part = match (ch, in_time) {
                    ('W', false) => Duration::try_weeks(n)?,
                    ('D', false) => Duration::try_days(n)?,
                    ('H', true) => Duration::try_hours(n)?,
                    ('M', true) => Duration::try_minutes(n)?,
                    ('S', true) => Duration::try_seconds(n)?,
                    _ => return None,
                };
                total = total.checked_add(&part)?;
            }
        }
    }
    if !number.is_empty() {
        return None;
    }
    Some(if negative { -total } else { total })
}

/// Undoes RFC 5545 TEXT escaping.
fn unescape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n' | 'N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out.trim().to_string()
}
