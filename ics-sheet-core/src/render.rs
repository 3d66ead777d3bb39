//! HTML sheet generation and document rendering.

use std::{process::Stdio, time::Duration};

use async_trait::async_trait;
use chrono::Datelike;
use tokio::{io::AsyncWriteExt, process::Command};

use crate::{
    error::RenderError,
    layout::{Cell, Entry, LayoutGrid},
    types::{Period, weekday_code},
};

const WEEKDAY_CODES: [&str; 7] = ["MO", "TU", "WE", "TH", "FR", "SA", "SU"];
const ZEBRA: [&str; 2] = ["#ffffff", "#f0f0f0"];

const STYLE: &str = "\
@page { size: A4 landscape; margin: 0.2cm; }
body { font-family: 'Roboto', sans-serif; margin: 0; }
h1 { font-size: 1rem; margin: 0 0 0.2rem 0; }
table { width: 100%; table-layout: fixed; border-collapse: collapse; }
td { vertical-align: top; font-size: 0.6rem; padding-top: 0.2rem; line-height: 1.5; }
.cell { white-space: nowrap; overflow: hidden; font-weight: bold; border-top: 1px solid gray; }
.header { font-size: 1rem; vertical-align: middle; }
.label { width: 7rem; }
.day { font-weight: normal; color: #555555; }
.entry { border-left: 3px solid transparent; padding-left: 2px; }
.more { font-weight: normal; font-style: italic; }
";

/// 渲染用 HTML 文档
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtmlDocument {
    pub title: String,
    pub html: String,
}

impl HtmlDocument {
    pub fn new(title: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            html: html.into(),
        }
    }

    /// Builds an A4 landscape sheet from a grid.
    pub fn from_grid(grid: &LayoutGrid, title: &str) -> Self {
        let mut html = String::new();

        html.push_str("<!DOCTYPE html>\n<html>\n<head>\n");
        html.push_str("<meta charset=\"utf-8\">\n");
        html.push_str(&format!("<title>{}</title>\n", escape_html(title)));
        html.push_str("<style type='text/css' media='all'>\n");
        html.push_str(STYLE);
        html.push_str(&format!(
            "td {{ height: {:.2}rem; }}\n",
            cell_height(visible_lines(grid))
        ));
        html.push_str("</style>\n</head>\n<body>\n");
        html.push_str(&format!("<h1>{}</h1>\n", escape_html(title)));

        html.push_str("<table>\n");
        match grid.period {
            Period::Daily => push_daily(&mut html, grid),
            Period::Weekly | Period::Monthly => push_calendar(&mut html, grid),
        }
        html.push_str("</table>\n</body>\n</html>\n");

        Self::new(title, html)
    }
}

/// Height of a cell showing `lines` lines of 0.6rem text.
fn cell_height(lines: usize) -> f64 {
    let lines = f64::from(u32::try_from(lines).unwrap_or(u32::MAX));
    lines * 0.6 * 1.5 + 0.1
}

fn visible_lines(grid: &LayoutGrid) -> usize {
    match grid.period {
        Period::Daily => {
            let columns = daily_columns(grid);
            grid.cells()
                .flat_map(|cell| {
                    columns
                        .iter()
                        .map(move |column| entries_of(cell, column.name).count())
                })
                .max()
                .unwrap_or(0)
                .max(1)
        }
        Period::Weekly | Period::Monthly => {
            let more = usize::from(grid.total_overflow() > 0);
            grid.max_visible() + 1 + more
        }
    }
}

struct Column<'a> {
    name: Option<&'a str>,
    color: Option<&'a str>,
}

/// One column per calendar with entries; uncalendared entries go first.
fn daily_columns(grid: &LayoutGrid) -> Vec<Column<'_>> {
    let entries: Vec<&Entry> = grid.cells().flat_map(|cell| cell.entries.iter()).collect();
    let mut columns = Vec::new();
    if entries.iter().any(|entry| entry.occurrence.calendar.is_none()) || entries.is_empty() {
        columns.push(Column {
            name: None,
            color: None,
        });
    }
    for calendar in &grid.calendars {
        let mut matching = entries
            .iter()
            .filter(|entry| entry.occurrence.calendar.as_deref() == Some(calendar.as_str()))
            .peekable();
        let Some(first) = matching.peek() else {
            continue;
        };
        columns.push(Column {
            name: Some(calendar.as_str()),
            color: first.occurrence.color.as_deref(),
        });
    }
    columns
}

fn entries_of<'a>(cell: &'a Cell, calendar: Option<&'a str>) -> impl Iterator<Item = &'a Entry> {
    cell.entries
        .iter()
        .filter(move |entry| entry.occurrence.calendar.as_deref() == calendar)
}

fn push_daily(html: &mut String, grid: &LayoutGrid) {
    let columns = daily_columns(grid);

    html.push_str("<tr class=\"row\">");
    html.push_str("<td class=\"cell header label\">Date</td>");
    for column in &columns {
        html.push_str(&format!(
            "<td class=\"cell header\">{}</td>",
            escape_html(column.name.unwrap_or("Events"))
        ));
    }
    html.push_str("</tr>\n");

    for (index, cell) in grid.cells().enumerate() {
        let zebra = ZEBRA[(index + 1) % 2];
        html.push_str("<tr class=\"row\">");
        html.push_str(&format!(
            "<td class=\"cell label\" style=\"background-color:{};\">{}",
            zebra,
            escape_html(&cell.label)
        ));
        push_overflow(html, cell.overflow);
        html.push_str("</td>");

        for column in &columns {
            let labels: Vec<String> = entries_of(cell, column.name)
                .map(|entry| escape_html(&entry.label))
                .collect();
            let background = if labels.is_empty() {
                zebra
            } else {
                column.color.and_then(safe_color).unwrap_or(zebra)
            };
            html.push_str(&format!(
                "<td class=\"cell\" style=\"background-color:{};\">{}</td>",
                background,
                labels.join("<br>")
            ));
        }
        html.push_str("</tr>\n");
    }
}

/// Weekly and monthly sheets: one column per weekday or day of month.
fn push_calendar(html: &mut String, grid: &LayoutGrid) {
    let (corner, headers): (&str, Vec<String>) = match grid.period {
        Period::Monthly => ("Month", (1..=31).map(|day| day.to_string()).collect()),
        _ => ("Week", WEEKDAY_CODES.iter().map(ToString::to_string).collect()),
    };

    html.push_str("<tr class=\"row\">");
    html.push_str(&format!("<td class=\"cell header label\">{}</td>", corner));
    for header in &headers {
        html.push_str(&format!("<td class=\"cell header\">{}</td>", header));
    }
    html.push_str("</tr>\n");

    for (index, row) in grid.rows.iter().enumerate() {
        let zebra = ZEBRA[(index + 1) % 2];
        let mut slots: Vec<Option<&Cell>> = vec![None; headers.len()];
        for cell in &row.cells {
            let column = match grid.period {
                Period::Monthly => cell.date.day0() as usize,
                _ => cell.date.weekday().num_days_from_monday() as usize,
            };
            if let Some(slot) = slots.get_mut(column) {
                *slot = Some(cell);
            }
        }

        html.push_str("<tr class=\"row\">");
        html.push_str(&format!(
            "<td class=\"cell label\" style=\"background-color:{};\">{}</td>",
            zebra,
            escape_html(&row.label)
        ));
        for slot in slots {
            let Some(cell) = slot else {
                html.push_str("<td class=\"cell\"></td>");
                continue;
            };
            html.push_str(&format!(
                "<td class=\"cell\" style=\"background-color:{};\">",
                zebra
            ));
            html.push_str(&format!(
                "<div class=\"day\">{} {}</div>",
                weekday_code(cell.date),
                cell.date.format("%d")
            ));
            for entry in &cell.entries {
                let color = entry
                    .occurrence
                    .color
                    .as_deref()
                    .and_then(safe_color)
                    .unwrap_or("transparent");
                html.push_str(&format!(
                    "<div class=\"entry\" style=\"border-left-color:{};\">{}</div>",
                    color,
                    escape_html(&entry.label)
                ));
            }
            push_overflow(html, cell.overflow);
            html.push_str("</td>");
        }
        html.push_str("</tr>\n");
    }
}

fn push_overflow(html: &mut String, overflow: usize) {
    if overflow > 0 {
        html.push_str(&format!("<div class=\"more\">+{} more</div>", overflow));
    }
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Accepts `#rgb`, `#rrggbb`, `#rrggbbaa` and plain color names.
fn safe_color(color: &str) -> Option<&str> {
    let color = color.trim();
    let valid = match color.strip_prefix('#') {
        Some(hex) => {
            matches!(hex.len(), 3 | 6 | 8) && hex.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => !color.is_empty() && color.chars().all(|c| c.is_ascii_alphabetic()),
    };
    valid.then_some(color)
}

/// Turns an HTML sheet into the bytes sent to the client.
#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    fn content_type(&self) -> &'static str;

    async fn render(&self, document: &HtmlDocument) -> Result<Vec<u8>, RenderError>;
}

/// Returns the markup itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlPassthrough;

#[async_trait]
impl DocumentRenderer for HtmlPassthrough {
    fn content_type(&self) -> &'static str {
        "text/html; charset=utf-8"
    }

    async fn render(&self, document: &HtmlDocument) -> Result<Vec<u8>, RenderError> {
        Ok(document.html.clone().into_bytes())
    }
}

/// Pipes HTML through an external converter (e.g. `weasyprint - -`).
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandRenderer {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    /// Splits a whitespace-separated command line.
    pub fn from_command_line(line: &str, timeout: Duration) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect(), timeout))
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl DocumentRenderer for CommandRenderer {
    fn content_type(&self) -> &'static str {
        "application/pdf"
    }

    async fn render(&self, document: &HtmlDocument) -> Result<Vec<u8>, RenderError> {
        tracing::debug!("Rendering '{}' with {}", document.title, self.program);

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RenderError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| RenderError::Io(std::io::Error::other("renderer stdin unavailable")))?;
        let markup = document.html.clone().into_bytes();
        let writer = tokio::spawn(async move {
            stdin.write_all(&markup).await?;
            stdin.shutdown().await
        });

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| RenderError::Timeout)??;

        if !output.status.success() {
            return Err(RenderError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        match writer.await {
            Ok(Err(err)) if err.kind() != std::io::ErrorKind::BrokenPipe => {
                return Err(RenderError::Io(err));
            }
            _ => {}
        }
        if output.stdout.is_empty() {
            return Err(RenderError::EmptyOutput);
        }

        tracing::debug!("Renderer produced {} bytes", output.stdout.len());
        Ok(output.stdout)
    }
}
