//! ICS Sheet Core Library
//!
//! This library turns iCalendar feeds into printable calendar sheets: feeds
//! are parsed into components, expanded into ordered occurrences for a date
//! window and projected onto a day/week/month grid that is rendered as HTML
//! or handed to an external PDF converter.

pub mod error;
pub mod expander;
pub mod fetch;
pub mod layout;
pub mod parser;
pub mod pipeline;
pub mod render;
pub mod rrule;
pub mod types;
pub mod vtimezone;
pub mod zone;

// Re-export core types and error handling
pub use error::{Error, Result};
pub use types::*;

/// Commonly used items
pub mod prelude {
    pub use crate::{
        expander::{Cancellation, ExpandOptions, Expansion, SourceContext, expand},
        fetch::{FetchLimits, fetch_calendar},
        layout::{LayoutGrid, project},
        parser::ComponentSet,
        pipeline::{SheetOutput, SheetRequest, build_sheet, expand_request},
        render::{CommandRenderer, DocumentRenderer, HtmlDocument, HtmlPassthrough},
        types::*,
    };
}
