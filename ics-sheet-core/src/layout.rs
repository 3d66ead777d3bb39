//! Projection of ordered occurrences onto a date grid.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::types::{DateWindow, GridShape, Occurrence, Period, weekday_code};

/// One occurrence placed in a cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entry {
    pub label: String,
    pub occurrence: Occurrence,
    /// Day after the first of a multi-day occurrence
    pub continued: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cell {
    pub date: NaiveDate,
    pub label: String,
    pub entries: Vec<Entry>,
    /// Occurrences that did not fit the cell's capacity
    pub overflow: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Row {
    pub label: String,
    pub cells: Vec<Cell>,
}

/// 排版网格
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayoutGrid {
    pub period: Period,
    pub capacity: Option<usize>,
    /// Display zone
    pub zone: String,
    pub window: DateWindow,
    /// Calendar names in display order
    pub calendars: Vec<String>,
    pub rows: Vec<Row>,
}

impl LayoutGrid {
    pub fn cells(&self) -> impl Iterator<Item = &Cell> {
        self.rows.iter().flat_map(|row| row.cells.iter())
    }

    pub fn cell(&self, date: NaiveDate) -> Option<&Cell> {
        self.cells().find(|cell| cell.date == date)
    }

    /// Largest number of visible entries in any cell.
    pub fn max_visible(&self) -> usize {
        self.cells()
            .map(|cell| cell.entries.len())
            .max()
            .unwrap_or(0)
    }

    pub fn total_overflow(&self) -> usize {
        self.cells().map(|cell| cell.overflow).sum()
    }
}

/// `MO 01/05/2024`
pub fn day_label(date: NaiveDate) -> String {
    format!("{} {}", weekday_code(date), date.format("%d/%m/%Y"))
}

fn row_label(period: Period, date: NaiveDate) -> String {
    match period {
        Period::Daily => day_label(date),
        Period::Weekly => {
            let week = date.iso_week();
            format!("Week {}, {}", week.week(), week.year())
        }
        Period::Monthly => date.format("%B %Y").to_string(),
    }
}

fn row_key(period: Period, date: NaiveDate) -> (i32, u32) {
    match period {
        Period::Daily => (date.year(), date.ordinal()),
        Period::Weekly => {
            let week = date.iso_week();
            (week.year(), week.week())
        }
        Period::Monthly => (date.year(), date.month()),
    }
}

fn entry_label(occurrence: &Occurrence, zone: Tz, continued: bool) -> String {
    let local = occurrence.start.with_timezone(&zone);
    let at_midnight = local.hour() == 0 && local.minute() == 0;
    if occurrence.all_day || continued || at_midnight {
        occurrence.title.clone()
    } else {
        format!("[{:02}:{:02}] {}", local.hour(), local.minute(), occurrence.title)
    }
}

/// Local dates an occurrence occupies; an end at exactly midnight excludes that day.
fn occupied_dates(start: DateTime<Utc>, end: DateTime<Utc>, zone: Tz) -> (NaiveDate, NaiveDate) {
    let first = start.with_timezone(&zone).date_naive();
    if end <= start {
        return (first, first);
    }
    let last = (end - Duration::nanoseconds(1))
        .with_timezone(&zone)
        .date_naive();
    (first, last.max(first))
}

/// Places `occurrences` into one cell per window date.
///
/// Cells keep their entries in start order; once a cell is at capacity the
/// remaining occurrences only increment its overflow counter.
pub fn project(
    occurrences: impl IntoIterator<Item = Occurrence>,
    window: &DateWindow,
    shape: &GridShape,
) -> LayoutGrid {
    let zone = shape.zone;
    let (first, last) = window.local_dates(zone);

    let mut cells: Vec<Cell> = first
        .iter_days()
        .take_while(|date| *date <= last)
        .map(|date| Cell {
            date,
            label: day_label(date),
            entries: Vec::new(),
            overflow: 0,
        })
        .collect();

    let mut occurrences: Vec<Occurrence> = occurrences.into_iter().collect();
    occurrences.sort();

    let mut calendars: Vec<String> = Vec::new();
    for occurrence in occurrences {
        if let Some(ref calendar) = occurrence.calendar {
            if !calendars.contains(calendar) {
                calendars.push(calendar.clone());
            }
        }

        let (start_date, end_date) = occupied_dates(occurrence.start, occurrence.end, zone);
        let from = start_date.max(first);
        let to = end_date.min(last);
        for date in from.iter_days().take_while(|date| *date <= to) {
            let Ok(index) = usize::try_from((date - first).num_days()) else {
                continue;
            };
            let Some(cell) = cells.get_mut(index) else {
                break;
            };
            if shape
                .capacity
                .is_some_and(|capacity| cell.entries.len() >= capacity)
            {
                cell.overflow += 1;
                continue;
            }
            let continued = date != start_date;
            cell.entries.push(Entry {
                label: entry_label(&occurrence, zone, continued),
                occurrence: occurrence.clone(),
                continued,
            });
        }
    }

    let mut rows: Vec<Row> = Vec::new();
    let mut current_key = None;
    for cell in cells {
        let key = row_key(shape.period, cell.date);
        if current_key != Some(key) {
            current_key = Some(key);
            rows.push(Row {
                label: row_label(shape.period, cell.date),
                cells: Vec::new(),
            });
        }
        if let Some(row) = rows.last_mut() {
            row.cells.push(cell);
        }
    }

    tracing::debug!(
        "Projected {} rows, {} calendars, period {:?}",
        rows.len(),
        calendars.len(),
        shape.period
    );

    LayoutGrid {
        period: shape.period,
        capacity: shape.capacity,
        zone: zone.name().to_string(),
        window: *window,
        calendars,
        rows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, d, h, min, 0).unwrap()
    }

    fn occurrence(id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Occurrence {
        Occurrence {
            start,
            end,
            title: id.to_uppercase(),
            source_id: id.to_string(),
            all_day: false,
            location: None,
            recurrence_id: None,
            calendar: None,
            color: None,
        }
    }

    fn ymd(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    fn may() -> DateWindow {
        DateWindow::month(2024, 5, Tz::UTC).unwrap()
    }

    #[test]
    fn every_window_date_has_one_cell() {
        let grid = project(Vec::new(), &may(), &GridShape::default());
        assert_eq!(grid.rows.len(), 31);
        assert_eq!(grid.cells().count(), 31);
        assert_eq!(grid.rows[0].label, "WE 01/05/2024");
        assert_eq!(grid.max_visible(), 0);
    }

    #[test]
    fn capacity_keeps_earliest_and_counts_overflow() {
        let occurrences: Vec<_> = (0..5)
            .rev()
            .map(|i| occurrence(&format!("e{i}"), at(3, 8 + i, 0), at(3, 9 + i, 0)))
            .collect();
        let shape = GridShape::new(Period::Daily, Some(3), Tz::UTC);
        let grid = project(occurrences, &may(), &shape);

        let cell = grid.cell(ymd(3)).unwrap();
        let ids: Vec<_> = cell
            .entries
            .iter()
            .map(|entry| entry.occurrence.source_id.as_str())
            .collect();
        assert_eq!(ids, ["e0", "e1", "e2"]);
        assert_eq!(cell.overflow, 2);
        assert_eq!(grid.total_overflow(), 2);
        assert_eq!(grid.max_visible(), 3);
    }

    #[test]
    fn multi_day_occurrence_fills_spanned_cells() {
        let trip = occurrence("trip", at(10, 15, 0), at(13, 0, 0));
        let grid = project(vec![trip], &may(), &GridShape::default());

        for day in 10..=12 {
            assert_eq!(grid.cell(ymd(day)).unwrap().entries.len(), 1, "day {day}");
        }
        assert!(grid.cell(ymd(13)).unwrap().entries.is_empty());

        let first = &grid.cell(ymd(10)).unwrap().entries[0];
        assert_eq!(first.label, "[15:00] TRIP");
        assert!(!first.continued);
        let next = &grid.cell(ymd(11)).unwrap().entries[0];
        assert_eq!(next.label, "TRIP");
        assert!(next.continued);
    }

    #[test]
    fn occurrences_are_clipped_to_the_window() {
        let long = occurrence("long", at(1, 0, 0) - Duration::days(3), at(2, 12, 0));
        let grid = project(vec![long], &may(), &GridShape::default());
        let entry = &grid.cell(ymd(1)).unwrap().entries[0];
        assert!(entry.continued);
        assert_eq!(grid.cell(ymd(2)).unwrap().entries.len(), 1);
        assert_eq!(grid.cells().filter(|c| !c.entries.is_empty()).count(), 2);
    }

    #[test]
    fn dates_follow_the_display_zone() {
        // 23:30 UTC on the 4th is already the 5th in Zurich.
        let late = occurrence("late", at(4, 23, 30), at(4, 23, 45));
        let window = DateWindow::month(2024, 5, Tz::Europe__Zurich).unwrap();
        let shape = GridShape::new(Period::Daily, None, Tz::Europe__Zurich);
        let grid = project(vec![late], &window, &shape);

        assert_eq!(grid.cells().count(), 31);
        let entry = &grid.cell(ymd(5)).unwrap().entries[0];
        assert_eq!(entry.label, "[01:30] LATE");
        assert_eq!(grid.zone, "Europe/Zurich");
    }

    #[test]
    fn all_day_and_midnight_entries_have_bare_titles() {
        let mut holiday = occurrence("holiday", at(9, 0, 0), at(10, 0, 0));
        holiday.all_day = true;
        let midnight = occurrence("midnight", at(20, 0, 0), at(20, 2, 0));
        let grid = project(vec![holiday, midnight], &may(), &GridShape::default());

        assert_eq!(grid.cell(ymd(9)).unwrap().entries[0].label, "HOLIDAY");
        assert!(grid.cell(ymd(10)).unwrap().entries.is_empty());
        assert_eq!(grid.cell(ymd(20)).unwrap().entries[0].label, "MIDNIGHT");
    }

    #[test]
    fn weekly_rows_follow_iso_weeks() {
        let shape = GridShape::new(Period::Weekly, None, Tz::UTC);
        let grid = project(Vec::new(), &may(), &shape);

        // May 2024 starts on a Wednesday: weeks 18 through 22.
        assert_eq!(grid.rows.len(), 5);
        assert_eq!(grid.rows[0].label, "Week 18, 2024");
        assert_eq!(grid.rows[0].cells.len(), 5);
        assert_eq!(grid.rows[1].cells.len(), 7);
        assert_eq!(grid.rows[4].cells.len(), 5);
    }

    #[test]
    fn monthly_rows_follow_calendar_months() {
        let window = DateWindow::parse("2024-04-15", "2024-06-03", Tz::UTC).unwrap();
        let shape = GridShape::new(Period::Monthly, None, Tz::UTC);
        let grid = project(Vec::new(), &window, &shape);

        let labels: Vec<_> = grid.rows.iter().map(|row| row.label.as_str()).collect();
        assert_eq!(labels, ["April 2024", "May 2024", "June 2024"]);
        assert_eq!(grid.rows[0].cells.len(), 16);
        assert_eq!(grid.rows[2].cells.len(), 2);
    }

    #[test]
    fn calendars_are_listed_in_order_of_appearance() {
        let mut a = occurrence("a", at(2, 9, 0), at(2, 10, 0));
        a.calendar = Some("Work".to_string());
        let mut b = occurrence("b", at(1, 9, 0), at(1, 10, 0));
        b.calendar = Some("Home".to_string());
        let grid = project(vec![a, b], &may(), &GridShape::default());
        assert_eq!(grid.calendars, ["Home", "Work"]);
    }
}
