use thiserror::Error;

/// Fatal: the calendar source cannot be used at all.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("ICS structure invalid: {0}")]
    Structure(String),

    #[error("No VCALENDAR block found")]
    NoCalendar,

    #[error("Component {component} is missing required property {property}")]
    MissingProperty {
        component: String,
        property: &'static str,
    },

    #[error("Invalid {property} value '{value}': {reason}")]
    InvalidValue {
        property: String,
        value: String,
        reason: String,
    },
}

/// Local: the offending event is skipped and the render continues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecurrenceError {
    #[error("RRULE is missing FREQ")]
    MissingFrequency,

    #[error("Unsupported FREQ: {0}")]
    UnsupportedFrequency(String),

    #[error("RRULE has both COUNT and UNTIL")]
    CountAndUntil,

    #[error("Invalid RRULE part {part}={value}")]
    InvalidPart { part: String, value: String },

    #[error("Invalid RRULE: {0}")]
    Rule(String),
}

/// Fatal: the requested window is missing or invalid.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WindowError {
    #[error("Date window is required (from/to or year/month)")]
    Missing,

    #[error("Invalid window bound '{0}': expected RFC 3339 or YYYY-MM-DD")]
    InvalidBound(String),

    #[error("Window start must be before its end")]
    Empty,

    #[error("Invalid month {year}-{month}")]
    InvalidMonth { year: i32, month: u32 },
}

/// Fatal: the remote source is unreachable or too large.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote calendar returned HTTP {0}")]
    Status(u16),

    #[error("Remote calendar exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("Fetching remote calendar timed out")]
    Timeout,

    #[error("Invalid calendar URL: {0}")]
    InvalidUrl(String),
}

/// Fatal: the document renderer failed.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Failed to start renderer '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("Renderer I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Renderer exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("Renderer produced no output")]
    EmptyOutput,

    #[error("Renderer timed out")]
    Timeout,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Recurrence(#[from] RecurrenceError),

    #[error(transparent)]
    Window(#[from] WindowError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Client-visible taxonomy name.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Parse(_) => "ParseError",
            Self::Recurrence(_) => "RecurrenceError",
            Self::Window(_) => "WindowError",
            Self::Fetch(_) => "FetchError",
            Self::Render(_) => "RenderError",
            Self::Config(_) => "ConfigError",
            Self::Cancelled => "Cancelled",
            Self::Json(_) | Self::Internal(_) => "InternalError",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_follow_taxonomy() {
        assert_eq!(Error::from(ParseError::NoCalendar).kind(), "ParseError");
        assert_eq!(Error::from(WindowError::Missing).kind(), "WindowError");
        assert_eq!(Error::from(FetchError::Timeout).kind(), "FetchError");
        assert_eq!(Error::from(RenderError::EmptyOutput).kind(), "RenderError");
        assert_eq!(
            Error::from(RecurrenceError::CountAndUntil).kind(),
            "RecurrenceError"
        );
        assert_eq!(Error::Cancelled.kind(), "Cancelled");
    }
}
