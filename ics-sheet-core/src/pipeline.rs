//! End-to-end sheet construction: parse → expand → project.

use chrono::Datelike;
use serde::Serialize;

use crate::{
    Error, Result,
    expander::{Cancellation, ExpandOptions, Expansion, SourceContext},
    layout::{self, LayoutGrid},
    parser::ComponentSet,
    types::{CalendarSource, DateWindow, GridShape, Occurrence, Warning},
};

/// Everything needed to build one sheet.
#[derive(Debug, Clone)]
pub struct SheetRequest {
    pub sources: Vec<CalendarSource>,
    pub window: DateWindow,
    pub shape: GridShape,
    pub options: ExpandOptions,
}

impl SheetRequest {
    /// Floating and all-day values default to the display zone.
    pub fn new(sources: Vec<CalendarSource>, window: DateWindow, shape: GridShape) -> Self {
        Self {
            sources,
            window,
            shape,
            options: ExpandOptions {
                default_zone: shape.zone,
                ..ExpandOptions::default()
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SheetOutput {
    pub grid: LayoutGrid,
    pub warnings: Vec<Warning>,
}

impl SheetOutput {
    /// `May 2024` for a whole month, otherwise the first and last date.
    pub fn title(&self) -> String {
        let mut cells = self.grid.cells();
        let (Some(first), Some(last)) = (cells.next(), self.grid.cells().last()) else {
            return "Calendar".to_string();
        };
        let (first, last) = (first.date, last.date);
        let whole_month = first.day() == 1
            && first.year() == last.year()
            && first.month() == last.month()
            && last.succ_opt().is_none_or(|next| next.day() == 1);
        if whole_month {
            first.format("%B %Y").to_string()
        } else {
            format!("{} - {}", first.format("%d/%m/%Y"), last.format("%d/%m/%Y"))
        }
    }
}

/// Flat, ordered occurrence list of a request.
#[derive(Debug, Clone, Serialize)]
pub struct OccurrenceList {
    pub occurrences: Vec<Occurrence>,
    pub warnings: Vec<Warning>,
    /// Calendar names in source order
    #[serde(skip)]
    pub calendars: Vec<String>,
}

/// Parses and expands every source of `request`.
pub fn expand_request(request: &SheetRequest, cancel: &Cancellation) -> Result<OccurrenceList> {
    let sets = request
        .sources
        .iter()
        .map(|source| ComponentSet::from_bytes(&source.bytes))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let calendars: Vec<String> = request
        .sources
        .iter()
        .zip(&sets)
        .filter_map(|(source, set)| source.name.clone().or_else(|| set.name.clone()))
        .collect();

    let contexts = request.sources.iter().map(|source| SourceContext {
        calendar: source.name.clone(),
        color: source.color.clone(),
        default_zone: source.default_zone,
    });
    let mut expansion = Expansion::new(
        sets.iter().zip(contexts),
        request.window,
        &request.options,
        cancel.clone(),
    );
    let occurrences: Vec<Occurrence> = expansion.by_ref().collect();
    if cancel.is_cancelled() {
        tracing::info!("Expansion cancelled after {} occurrences", occurrences.len());
        return Err(Error::Cancelled);
    }

    let warnings = expansion.into_warnings();
    tracing::debug!(
        "Expanded {} occurrences from {} sources with {} warnings",
        occurrences.len(),
        sets.len(),
        warnings.len()
    );
    Ok(OccurrenceList {
        occurrences,
        warnings,
        calendars,
    })
}

/// Builds the layout grid of a request.
pub fn build_sheet(request: &SheetRequest, cancel: &Cancellation) -> Result<SheetOutput> {
    let OccurrenceList {
        occurrences,
        warnings,
        calendars,
    } = expand_request(request, cancel)?;

    let mut grid = layout::project(occurrences, &request.window, &request.shape);
    let mut ordered = Vec::with_capacity(grid.calendars.len());
    for name in calendars.into_iter().chain(grid.calendars.drain(..)) {
        if !ordered.contains(&name) {
            ordered.push(name);
        }
    }
    grid.calendars = ordered;

    Ok(SheetOutput { grid, warnings })
}
