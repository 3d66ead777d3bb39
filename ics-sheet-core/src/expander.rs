//! Occurrence expansion.
//!
//! Single events and substitutes are collected into one sorted stream; every
//! recurring series gets its own stream over the instances its rule produces
//! near the window. [`Expansion`] merges them with a min-heap, so output is
//! ordered without sorting the whole result.

use std::{
    cmp::Reverse,
    collections::{BTreeSet, BinaryHeap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::{DateTime, Days, Duration, NaiveDateTime, NaiveTime, Utc};
use chrono_tz::Tz;

use crate::{
    error::RecurrenceError,
    parser::{Component, ComponentKey, ComponentSet, EventData, OverrideAction, RecurringEvent},
    rrule::RecurrenceRule,
    types::{DateWindow, Occurrence, TimeValue, Warning, WarningKind},
    zone::{self, Zone, ZoneResolver},
};

/// Upper bound on instances generated for one series within the window.
pub const MAX_GENERATED: usize = 100_000;

#[derive(Debug, Clone)]
pub struct ExpandOptions {
    /// Zone for floating and all-day values when neither the source nor the feed names one
    pub default_zone: Tz,
    /// Include substitutes whose original instant lies outside the window
    pub moved_into_window: bool,
    pub max_generated: usize,
}

impl Default for ExpandOptions {
    fn default() -> Self {
        Self {
            default_zone: Tz::UTC,
            moved_into_window: true,
            max_generated: MAX_GENERATED,
        }
    }
}

/// Per-source metadata carried onto every occurrence.
#[derive(Debug, Clone, Default)]
pub struct SourceContext {
    pub calendar: Option<String>,
    pub color: Option<String>,
    pub default_zone: Option<Tz>,
}

/// 协作式取消标志
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Guard that cancels when dropped.
    pub fn guard(&self) -> CancelOnDrop {
        CancelOnDrop(self.clone())
    }
}

#[derive(Debug)]
pub struct CancelOnDrop(Cancellation);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Length of an event, applied to every instance of a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Span {
    /// Absolute duration
    Exact(Duration),
    /// Nominal local days
    Days(u64),
}

impl Span {
    /// End of an instance; clamped to the latest representable instant.
    fn end(self, start: DateTime<Utc>, local: NaiveDateTime, zone: &Zone) -> DateTime<Utc> {
        let end = match self {
            Self::Exact(duration) => start
                .checked_add_signed(duration)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            Self::Days(days) => local
                .date()
                .checked_add_days(Days::new(days))
                .map_or(DateTime::<Utc>::MAX_UTC, |date| {
                    zone.localize(date.and_time(NaiveTime::MIN))
                }),
        };
        end.max(start)
    }

    /// How far before the window an instance may start and still reach into it.
    fn reach(self) -> Duration {
        match self {
            Self::Exact(duration) => duration,
            Self::Days(days) => i64::try_from(days)
                .ok()
                .and_then(|days| Duration::try_days(days.saturating_add(1)))
                .unwrap_or(Duration::MAX),
        }
    }

    const fn fallback(start: &TimeValue) -> Self {
        if start.is_date() {
            Self::Days(1)
        } else {
            Self::Exact(Duration::zero())
        }
    }
}

/// Zone resolution state and metadata for one calendar source.
struct Scope {
    resolver: ZoneResolver,
    calendar: Option<String>,
    color: Option<String>,
    unknown: Vec<String>,
}

impl Scope {
    fn to_utc(&mut self, value: &TimeValue) -> DateTime<Utc> {
        let (instant, unknown) = self.resolver.to_utc(value);
        self.unknown.extend(unknown);
        instant
    }

    fn zone_of(&mut self, value: &TimeValue) -> Zone {
        let (zone, unknown) = self.resolver.zone_of(value);
        self.unknown.extend(unknown);
        zone
    }

    /// DTEND or DURATION as a span, if the event declares one.
    fn declared_span(&mut self, event: &EventData) -> Option<Span> {
        if let Some(ref end) = event.end {
            if let (TimeValue::Date(start), TimeValue::Date(end)) = (&event.start, end) {
                let days = end.signed_duration_since(*start).num_days();
                return Some(Span::Days(u64::try_from(days).unwrap_or(0)));
            }
            let start = self.to_utc(&event.start);
            let end = self.to_utc(end);
            return Some(Span::Exact((end - start).max(Duration::zero())));
        }
        event.duration.map(|duration| {
            if event.start.is_date() && duration.num_seconds() % 86_400 == 0 {
                Span::Days(u64::try_from(duration.num_days()).unwrap_or(0))
            } else {
                Span::Exact(duration.max(Duration::zero()))
            }
        })
    }
}

/// One instance of a series before overrides and the window are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Candidate {
    local: NaiveDateTime,
    instant: DateTime<Utc>,
}

/// Instances of one recurring event.
struct SeriesStream {
    uid: String,
    title: String,
    location: Option<String>,
    calendar: Option<String>,
    color: Option<String>,
    all_day: bool,
    span: Span,
    zone: Zone,
    /// Sorted by instant, without duplicates
    candidates: VecDeque<Candidate>,
    overridden: BTreeSet<DateTime<Utc>>,
    window: DateWindow,
    limit: usize,
    limit_hit: bool,
    cancel: Cancellation,
}

impl Iterator for SeriesStream {
    type Item = Occurrence;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.cancel.is_cancelled() {
            let candidate = self.candidates.pop_front()?;
            if candidate.instant >= self.window.to {
                self.candidates.clear();
                return None;
            }
            if self.overridden.contains(&candidate.instant) {
                continue;
            }
            let end = self.span.end(candidate.instant, candidate.local, &self.zone);
            if !self.window.overlaps(candidate.instant, end) {
                continue;
            }
            return Some(Occurrence {
                start: candidate.instant,
                end,
                title: self.title.clone(),
                source_id: self.uid.clone(),
                all_day: self.all_day,
                location: self.location.clone(),
                recurrence_id: Some(candidate.instant),
                calendar: self.calendar.clone(),
                color: self.color.clone(),
            });
        }
        None
    }
}

enum Stream {
    Fixed(std::vec::IntoIter<Occurrence>),
    Series(Box<SeriesStream>),
}

impl Stream {
    fn next(&mut self) -> Option<Occurrence> {
        match self {
            Self::Fixed(occurrences) => occurrences.next(),
            Self::Series(series) => series.next(),
        }
    }
}

/// Collects the streams of all sources before merging.
struct Builder<'o> {
    window: DateWindow,
    options: &'o ExpandOptions,
    cancel: Cancellation,
    fixed: Vec<Occurrence>,
    series: Vec<SeriesStream>,
    warnings: Vec<Warning>,
}

impl Builder<'_> {
    fn add_source(&mut self, set: &ComponentSet, source: &SourceContext) {
        let calendar = source.calendar.clone().or_else(|| set.name.clone());
        let default_zone = match (source.default_zone, set.default_zone.as_deref()) {
            (Some(tz), _) => tz,
            (None, Some(tzid)) => zone::parse_zone(tzid).unwrap_or_else(|| {
                self.warnings.push(Warning {
                    component: "X-WR-TIMEZONE".to_string(),
                    calendar: calendar.clone(),
                    kind: WarningKind::UnknownZone,
                    message: format!(
                        "Unknown calendar zone '{}', using {}",
                        tzid, self.options.default_zone
                    ),
                });
                self.options.default_zone
            }),
            (None, None) => self.options.default_zone,
        };

        let mut scope = Scope {
            resolver: ZoneResolver::new(default_zone).with_definitions(set.timezones.clone()),
            calendar,
            color: source.color.clone(),
            unknown: Vec::new(),
        };

        for (key, component) in set.iter() {
            if self.cancel.is_cancelled() {
                return;
            }
            match component {
                Component::Single(event) => self.add_single(&mut scope, key, event),
                Component::Recurring(series) => self.add_series(&mut scope, set, key, series),
                // Consumed by their series
                Component::Override(_) => {}
            }
            self.flush_unknown(&mut scope, key);
        }
    }

    fn add_single(&mut self, scope: &mut Scope, key: &ComponentKey, event: &EventData) {
        let start = scope.to_utc(&event.start);
        let zone = scope.zone_of(&event.start);
        let span = scope
            .declared_span(event)
            .unwrap_or_else(|| Span::fallback(&event.start));
        let end = span.end(start, event.start.local(), &zone);
        if !self.window.overlaps(start, end) {
            return;
        }
        self.fixed.push(Occurrence {
            start,
            end,
            title: event.summary.clone(),
            source_id: key.id(),
            all_day: event.start.is_date(),
            location: event.location.clone(),
            recurrence_id: None,
            calendar: scope.calendar.clone(),
            color: scope.color.clone(),
        });
    }

    fn add_series(
        &mut self,
        scope: &mut Scope,
        set: &ComponentSet,
        key: &ComponentKey,
        series: &RecurringEvent,
    ) {
        let rule = match series
            .rule
            .as_deref()
            .map(str::parse::<RecurrenceRule>)
            .transpose()
        {
            Ok(rule) => rule,
            Err(err) => return self.skip_series(scope, key, &err),
        };

        let event = &series.event;
        let zone = scope.zone_of(&event.start);
        let span = scope
            .declared_span(event)
            .unwrap_or_else(|| Span::fallback(&event.start));
        let dtstart = event.start.local();

        // DTSTART is always the first instance.
        let mut candidates = vec![Candidate {
            local: dtstart,
            instant: scope.to_utc(&event.start),
        }];
        let mut limit_hit = false;
        if let Some(ref rule) = rule {
            let from = zone
                .local_time(self.window.from)
                .checked_sub_signed(span.reach())
                .and_then(|from| from.checked_sub_signed(Duration::days(1)))
                .unwrap_or(NaiveDateTime::MIN);
            let to = zone
                .local_time(self.window.to)
                .checked_add_signed(Duration::days(1))
                .unwrap_or(NaiveDateTime::MAX);
            let expanded = match rule.expand(dtstart, from..to, self.options.max_generated) {
                Ok(expanded) => expanded,
                Err(err) => return self.skip_series(scope, key, &err),
            };
            limit_hit = expanded.limited;
            candidates.extend(
                expanded
                    .dates
                    .into_iter()
                    .map(|local| Candidate {
                        local,
                        instant: zone.localize(local),
                    })
                    .filter(|candidate| rule.within_until(candidate.local, candidate.instant)),
            );
        }

        candidates.extend(series.rdates.iter().map(|rdate| {
            let instant = scope.to_utc(rdate);
            let local = if rdate.is_date() {
                rdate.local()
            } else {
                zone.local_time(instant)
            };
            Candidate { local, instant }
        }));
        candidates.sort_by_key(|candidate| candidate.instant);
        candidates.dedup_by_key(|candidate| candidate.instant);

        let mut overridden = BTreeSet::new();
        for exception in set.overrides_for(&key.uid) {
            let original = scope.to_utc(&exception.original);
            overridden.insert(original);
            if let OverrideAction::Substitute(ref replacement) = exception.action {
                self.add_substitute(scope, &key.uid, event, span, original, replacement);
            }
        }

        self.series.push(SeriesStream {
            uid: key.uid.clone(),
            title: event.summary.clone(),
            location: event.location.clone(),
            calendar: scope.calendar.clone(),
            color: scope.color.clone(),
            all_day: event.start.is_date(),
            span,
            zone,
            candidates: candidates.into(),
            overridden,
            window: self.window,
            limit: self.options.max_generated.min(usize::from(u16::MAX)),
            limit_hit,
            cancel: self.cancel.clone(),
        });
    }

    fn skip_series(&mut self, scope: &Scope, key: &ComponentKey, err: &RecurrenceError) {
        tracing::warn!("Skipping series {}: {}", key.id(), err);
        self.warnings.push(Warning {
            component: key.id(),
            calendar: scope.calendar.clone(),
            kind: WarningKind::Recurrence,
            message: err.to_string(),
        });
    }

    fn add_substitute(
        &mut self,
        scope: &mut Scope,
        uid: &str,
        master: &EventData,
        master_span: Span,
        original: DateTime<Utc>,
        replacement: &EventData,
    ) {
        if !self.options.moved_into_window && !self.window.contains(original) {
            return;
        }
        let start = scope.to_utc(&replacement.start);
        let zone = scope.zone_of(&replacement.start);
        let span = scope.declared_span(replacement).unwrap_or_else(|| {
            if replacement.start.is_date() == master.start.is_date() {
                master_span
            } else {
                Span::fallback(&replacement.start)
            }
        });
        let end = span.end(start, replacement.start.local(), &zone);
        if !self.window.overlaps(start, end) {
            return;
        }

        let title = if replacement.summary.is_empty() {
            master.summary.clone()
        } else {
            replacement.summary.clone()
        };
        self.fixed.push(Occurrence {
            start,
            end,
            title,
            source_id: uid.to_string(),
            all_day: replacement.start.is_date(),
            location: replacement
                .location
                .clone()
                .or_else(|| master.location.clone()),
            recurrence_id: Some(original),
            calendar: scope.calendar.clone(),
            color: scope.color.clone(),
        });
    }

    fn flush_unknown(&mut self, scope: &mut Scope, key: &ComponentKey) {
        if scope.unknown.is_empty() {
            return;
        }
        let mut unknown = std::mem::take(&mut scope.unknown);
        unknown.sort_unstable();
        unknown.dedup();
        for tzid in unknown {
            tracing::warn!("Unknown TZID '{}' in {}", tzid, key.id());
            self.warnings.push(Warning {
                component: key.id(),
                calendar: scope.calendar.clone(),
                kind: WarningKind::UnknownZone,
                message: format!(
                    "Unknown TZID '{}', using {}",
                    tzid,
                    scope.resolver.default_zone()
                ),
            });
        }
    }

    fn finish(mut self) -> Expansion {
        self.fixed.sort();
        tracing::debug!(
            "Expanding {} fixed occurrences and {} series",
            self.fixed.len(),
            self.series.len()
        );

        let mut streams = Vec::with_capacity(self.series.len() + 1);
        streams.push(Stream::Fixed(self.fixed.into_iter()));
        streams.extend(
            self.series
                .into_iter()
                .map(|series| Stream::Series(Box::new(series))),
        );

        Expansion {
            streams,
            heap: BinaryHeap::new(),
            primed: false,
            warnings: self.warnings,
            cancel: self.cancel,
        }
    }
}

/// Ordered, lazy occurrence sequence over one or more calendar sources.
pub struct Expansion {
    streams: Vec<Stream>,
    heap: BinaryHeap<Reverse<(Occurrence, usize)>>,
    primed: bool,
    warnings: Vec<Warning>,
    cancel: Cancellation,
}

impl Expansion {
    pub fn new<'a>(
        sources: impl IntoIterator<Item = (&'a ComponentSet, SourceContext)>,
        window: DateWindow,
        options: &ExpandOptions,
        cancel: Cancellation,
    ) -> Self {
        let mut builder = Builder {
            window,
            options,
            cancel,
            fixed: Vec::new(),
            series: Vec::new(),
            warnings: Vec::new(),
        };
        for (set, source) in sources {
            builder.add_source(set, &source);
        }
        builder.finish()
    }

    /// Warnings recorded so far; complete once the iterator is exhausted.
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn into_warnings(self) -> Vec<Warning> {
        self.warnings
    }

    fn advance(&mut self, index: usize) {
        let Some(stream) = self.streams.get_mut(index) else {
            return;
        };
        if let Some(occurrence) = stream.next() {
            self.heap.push(Reverse((occurrence, index)));
            return;
        }
        if let Stream::Series(series) = stream {
            if series.limit_hit {
                tracing::warn!("Series {} stopped at the generation limit", series.uid);
                self.warnings.push(Warning {
                    component: series.uid.clone(),
                    calendar: series.calendar.clone(),
                    kind: WarningKind::GenerationLimit,
                    message: format!("Stopped after {} generated instances", series.limit),
                });
            }
        }
    }
}

impl Iterator for Expansion {
    type Item = Occurrence;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cancel.is_cancelled() {
            return None;
        }
        if !self.primed {
            self.primed = true;
            for index in 0..self.streams.len() {
                self.advance(index);
            }
        }
        let Reverse((occurrence, index)) = self.heap.pop()?;
        self.advance(index);
        Some(occurrence)
    }
}

/// Expands a single calendar.
pub fn expand(
    set: &ComponentSet,
    window: DateWindow,
    options: &ExpandOptions,
    cancel: Cancellation,
) -> Expansion {
    Expansion::new([(set, SourceContext::default())], window, options, cancel)
}
