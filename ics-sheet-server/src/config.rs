use std::{env, str::FromStr, time::Duration};

use anyhow::{Context, Result, anyhow};
use chrono_tz::Tz;
use ics_sheet_core::fetch::FetchLimits;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_PDF_COMMAND: &str = "weasyprint - -";
const DEFAULT_RENDER_TIMEOUT: Duration = Duration::from_secs(60);

/// A feed configured on the server, addressable by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedCalendar {
    pub name: String,
    pub url: String,
    pub color: Option<String>,
}

/// 服务配置，启动时从环境变量读取
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Zone of the grid's calendar dates and of bare window dates
    pub display_zone: Tz,
    /// Default entries per cell, `None` for unlimited
    pub cell_capacity: Option<usize>,
    pub fetch: FetchLimits,
    pub render_timeout: Duration,
    /// HTML → PDF converter reading stdin and writing stdout
    pub pdf_command: String,
    pub calendars: Vec<NamedCalendar>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            display_zone: Tz::UTC,
            cell_capacity: None,
            fetch: FetchLimits::default(),
            render_timeout: DEFAULT_RENDER_TIMEOUT,
            pdf_command: DEFAULT_PDF_COMMAND.to_string(),
            calendars: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads the configuration through `lookup`; unset and blank variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let mut config = Self::default();

        if let Some(port) = var("PORT") {
            config.port = parse(&port, "PORT")?;
        }
        if let Some(zone) = var("DISPLAY_TZ") {
            config.display_zone =
                Tz::from_str(&zone).map_err(|_| anyhow!("DISPLAY_TZ: unknown zone '{}'", zone))?;
        }
        if let Some(capacity) = var("CELL_CAPACITY") {
            let capacity: usize = parse(&capacity, "CELL_CAPACITY")?;
            config.cell_capacity = (capacity > 0).then_some(capacity);
        }
        if let Some(secs) = var("FETCH_TIMEOUT_SECS") {
            config.fetch.timeout = Duration::from_secs(parse(&secs, "FETCH_TIMEOUT_SECS")?);
        }
        if let Some(bytes) = var("FETCH_MAX_BYTES") {
            config.fetch.max_bytes = parse(&bytes, "FETCH_MAX_BYTES")?;
        }
        if let Some(secs) = var("RENDER_TIMEOUT_SECS") {
            config.render_timeout = Duration::from_secs(parse(&secs, "RENDER_TIMEOUT_SECS")?);
        }
        if let Some(command) = var("PDF_COMMAND") {
            config.pdf_command = command;
        }

        if let Some(names) = var("CALENDAR_NAMES") {
            for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                let key = env_key(name);
                let url = var(&format!("CALENDAR_URL_{}", key))
                    .with_context(|| format!("CALENDAR_URL_{} is required for '{}'", key, name))?;
                config.calendars.push(NamedCalendar {
                    name: name.to_string(),
                    url,
                    color: var(&format!("CALENDAR_COLOR_{}", key)),
                });
            }
        }

        tracing::debug!(
            "Loaded config: port {}, zone {}, {} named calendars",
            config.port,
            config.display_zone,
            config.calendars.len()
        );
        Ok(config)
    }

    pub fn calendar(&self, name: &str) -> Option<&NamedCalendar> {
        self.calendars
            .iter()
            .find(|calendar| calendar.name.eq_ignore_ascii_case(name.trim()))
    }
}

fn parse<T>(value: &str, key: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("{}: invalid value '{}'", key, value))
}

/// Environment key suffix of a calendar name: `Kids' Club` → `KIDS__CLUB`.
pub fn env_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
