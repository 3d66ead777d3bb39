use std::{collections::HashMap, str::FromStr, time::Duration};

use anyhow::{Context, Result, anyhow};
use chrono::{Datelike, Utc};
use chrono_tz::Tz;
use ics_sheet_core::{
    fetch::{FetchLimits, build_client, fetch_calendar},
    prelude::*,
};
use tokio::io::AsyncWriteExt;

use crate::{Format, WindowArgs};

/// 渲染命令参数
pub struct RenderParams {
    pub inputs: Vec<String>,
    pub window: WindowArgs,
    pub period: String,
    pub capacity: usize,
    pub colors: Vec<String>,
    pub format: Format,
    pub output: Option<String>,
    pub pdf_command: String,
    pub pdf_timeout: u64,
}

/// A feed argument: `[NAME=]PATH_OR_URL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Input {
    pub name: Option<String>,
    pub location: String,
}

impl FromStr for Input {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        // `=` inside a URL query is not a name separator.
        let (name, location) = match s.split_once('=') {
            Some((name, location)) if !name.contains("://") && !name.contains('?') => {
                (Some(name.trim().to_string()), location.trim())
            }
            _ => (None, s),
        };
        if location.is_empty() {
            return Err(anyhow!("Empty calendar location in '{}'", s));
        }
        Ok(Self {
            name: name.filter(|n| !n.is_empty()),
            location: location.to_string(),
        })
    }
}

impl Input {
    fn is_remote(&self) -> bool {
        ["http://", "https://", "webcal://"]
            .iter()
            .any(|scheme| self.location.starts_with(scheme))
    }
}

/// `NAME=#color` pairs.
fn parse_colors(colors: &[String]) -> Result<HashMap<String, String>> {
    colors
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(name, color)| (name.trim().to_string(), color.trim().to_string()))
                .ok_or_else(|| anyhow!("Invalid color '{}': expected NAME=COLOR", pair))
        })
        .collect()
}

fn resolve_window(args: &WindowArgs) -> Result<(DateWindow, Tz)> {
    let zone = Tz::from_str(args.tz.trim())
        .map_err(|_| anyhow!("Unknown time zone '{}'", args.tz))?;
    let window = match (&args.from, &args.to, args.year, args.month) {
        (None, None, None, None) => {
            let today = Utc::now().with_timezone(&zone).date_naive();
            tracing::info!("No window given, using {}", today.format("%B %Y"));
            DateWindow::month(today.year(), today.month(), zone)?
        }
        _ => DateWindow::from_parts(
            args.from.as_deref(),
            args.to.as_deref(),
            args.year,
            args.month,
            zone,
        )?,
    };
    Ok((window, zone))
}

async fn load_sources(
    inputs: &[String],
    colors: &HashMap<String, String>,
) -> Result<Vec<CalendarSource>> {
    let limits = FetchLimits::default();
    let client = build_client(&limits)?;
    let mut sources = Vec::with_capacity(inputs.len());

    for raw in inputs {
        let input: Input = raw.parse()?;
        let bytes = if input.is_remote() {
            fetch_calendar(&client, &input.location, &limits)
                .await
                .with_context(|| format!("Failed to fetch {}", input.location))?
        } else {
            tokio::fs::read(&input.location)
                .await
                .with_context(|| format!("Failed to read {}", input.location))?
        };

        let mut source = CalendarSource::inline(bytes);
        if let Some(name) = input.name {
            source = source.with_color(colors.get(&name).cloned()).with_name(name);
        }
        sources.push(source);
    }
    Ok(sources)
}

/// 渲染命令
pub async fn render_command(params: RenderParams) -> Result<()> {
    let (window, zone) = resolve_window(&params.window)?;
    let period: Period = params.period.parse().map_err(|e: String| anyhow!(e))?;
    let capacity = (params.capacity > 0).then_some(params.capacity);
    let colors = parse_colors(&params.colors)?;

    let sources = load_sources(&params.inputs, &colors).await?;
    println!("✓ Loaded {} calendars", sources.len());

    let request = SheetRequest::new(sources, window, GridShape::new(period, capacity, zone));
    let output = tokio::task::spawn_blocking(move || build_sheet(&request, &Cancellation::new()))
        .await??;
    for warning in &output.warnings {
        eprintln!("⚠ {}", warning);
    }

    let title = output.title();
    let (bytes, extension) = match params.format {
        Format::Json => (serde_json::to_vec_pretty(&output)?, "json"),
        Format::Html => (HtmlDocument::from_grid(&output.grid, &title).html.into_bytes(), "html"),
        Format::Pdf => {
            let renderer = CommandRenderer::from_command_line(
                &params.pdf_command,
                Duration::from_secs(params.pdf_timeout),
            )
            .ok_or_else(|| anyhow!("PDF command is empty"))?;
            let document = HtmlDocument::from_grid(&output.grid, &title);
            (renderer.render(&document).await?, "pdf")
        }
    };

    // 确定输出文件名
    let output_file = params.output.unwrap_or_else(|| {
        let first = window.local_dates(zone).0;
        format!("calendar_{}_{:02}.{}", first.year(), first.month(), extension)
    });

    if output_file == "-" {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(&bytes).await?;
        stdout.flush().await?;
    } else {
        tokio::fs::write(&output_file, &bytes).await?;
        println!("✓ Sheet '{}' saved to {}", title, output_file);
    }
    Ok(())
}

/// 事件列表命令
pub async fn occurrences_command(
    inputs: Vec<String>,
    window: WindowArgs,
    json: bool,
) -> Result<()> {
    let (window, zone) = resolve_window(&window)?;
    let sources = load_sources(&inputs, &HashMap::new()).await?;

    let request = SheetRequest::new(sources, window, GridShape::new(Period::Daily, None, zone));
    let list = tokio::task::spawn_blocking(move || expand_request(&request, &Cancellation::new()))
        .await??;

    if json {
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }

    for occurrence in &list.occurrences {
        let start = occurrence.start.with_timezone(&zone);
        let end = occurrence.end.with_timezone(&zone);
        let calendar = occurrence
            .calendar
            .as_deref()
            .map(|name| format!("[{}] ", name))
            .unwrap_or_default();
        if occurrence.all_day {
            println!(
                "{} {:>13}  {}{}",
                start.format("%Y-%m-%d"),
                "all day",
                calendar,
                occurrence.title
            );
        } else {
            println!(
                "{} {} - {}  {}{}",
                start.format("%Y-%m-%d"),
                start.format("%H:%M"),
                end.format("%H:%M"),
                calendar,
                occurrence.title
            );
        }
    }
    println!("✓ {} occurrences", list.occurrences.len());
    for warning in &list.warnings {
        eprintln!("⚠ {}", warning);
    }
    Ok(())
}
