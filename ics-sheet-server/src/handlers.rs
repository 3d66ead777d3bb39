use std::{str::FromStr, sync::Arc};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Query, State, rejection::QueryRejection},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono_tz::Tz;
use ics_sheet_core::{
    Error,
    error::{FetchError, WindowError},
    fetch::{build_client, fetch_calendar},
    prelude::*,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::ServerConfig;

const WARNINGS_HEADER: &str = "X-Calendar-Warnings";

/// 应用状态
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub http_client: Client,
    pub renderer: Arc<dyn DocumentRenderer>,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        renderer: Arc<dyn DocumentRenderer>,
    ) -> ics_sheet_core::Result<Self> {
        let http_client = build_client(&config.fetch)?;
        Ok(Self {
            config: Arc::new(config),
            http_client,
            renderer,
        })
    }
}

/// 健康检查响应
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// 错误响应
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

/// Query parameters of `/render`
#[derive(Debug, Default, Deserialize)]
struct RenderQuery {
    url: Option<String>,
    calendars: Option<String>, // 逗号分隔的日历名
    from: Option<String>,
    to: Option<String>,
    year: Option<i32>,
    month: Option<u32>,
    period: Option<String>,
    capacity: Option<usize>,
    tz: Option<String>,
    format: Option<String>, // "pdf", "html" or "json", defaults to "pdf"
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Pdf,
    Html,
    Json,
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pdf" => Ok(Self::Pdf),
            "html" => Ok(Self::Html),
            "json" => Ok(Self::Json),
            other => Err(Error::Config(format!(
                "Unknown format '{}': expected pdf, html or json",
                other
            ))),
        }
    }
}

/// Validated render parameters, checked before anything is fetched.
struct RenderPlan {
    window: DateWindow,
    shape: GridShape,
    format: OutputFormat,
}

impl RenderPlan {
    fn from_query(config: &ServerConfig, query: &RenderQuery) -> Result<Self, Error> {
        let zone = match query.tz.as_deref() {
            Some(tz) => Tz::from_str(tz.trim())
                .map_err(|_| Error::Config(format!("Unknown time zone '{}'", tz)))?,
            None => config.display_zone,
        };
        let period = match query.period.as_deref() {
            Some(period) => period.parse::<Period>().map_err(Error::Config)?,
            None => Period::default(),
        };
        let capacity = match query.capacity {
            Some(0) => None,
            Some(capacity) => Some(capacity),
            None => config.cell_capacity,
        };
        let format = match query.format.as_deref() {
            Some(format) => format.parse()?,
            None => OutputFormat::Pdf,
        };
        let window = DateWindow::from_parts(
            query.from.as_deref(),
            query.to.as_deref(),
            query.year,
            query.month,
            zone,
        )?;

        Ok(Self {
            window,
            shape: GridShape::new(period, capacity, zone),
            format,
        })
    }
}

struct FetchTarget {
    url: String,
    name: Option<String>,
    color: Option<String>,
}

pub fn create_app(config: ServerConfig) -> Result<Router, Error> {
    let renderer = CommandRenderer::from_command_line(&config.pdf_command, config.render_timeout)
        .ok_or_else(|| Error::Config("PDF_COMMAND is empty".to_string()))?;
    tracing::info!("Using PDF converter '{}'", renderer.program());
    Ok(router(AppState::new(config, Arc::new(renderer))?))
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.fetch.max_bytes;
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/calendars", get(list_calendars_handler))
        .route("/render", get(render_handler).post(render_inline_handler))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(DefaultBodyLimit::max(body_limit))
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

/// 根路径处理器
async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "ICS Sheet Service",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Renders iCalendar feeds as printable day/week/month sheets",
        "endpoints": {
            "health": "/health",
            "calendars": "/calendars",
            "render": "/render?url=…|calendars=a,b&year=&month=|from=&to=&period=&capacity=&tz=&format=pdf|html|json"
        }
    }))
}

/// 健康检查处理器
async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Named calendars; URLs stay on the server.
async fn list_calendars_handler(State(state): State<AppState>) -> impl IntoResponse {
    let calendars: Vec<_> = state
        .config
        .calendars
        .iter()
        .map(|calendar| {
            serde_json::json!({
                "name": calendar.name,
                "color": calendar.color,
            })
        })
        .collect();

    Json(serde_json::json!({ "calendars": calendars }))
}

/// Malformed query parameters, e.g. `capacity=abc`.
fn query_error(rejection: &QueryRejection) -> Error {
    let detail = rejection.body_text();
    if ["year:", "month:"].iter().any(|field| detail.contains(field)) {
        Error::Window(WindowError::InvalidBound(detail))
    } else {
        Error::Config(detail)
    }
}

/// Renders remote feeds given by `url` and/or configured `calendars`.
async fn render_handler(
    State(state): State<AppState>,
    query: Result<Query<RenderQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let Query(query) = query.map_err(|rejection| query_error(&rejection))?;
    let plan = RenderPlan::from_query(&state.config, &query)?;
    let targets = fetch_targets(&state.config, &query)?;
    let sources = fetch_sources(&state, targets).await?;
    respond(&state, plan, sources).await
}

/// Renders the request body as an inline feed.
async fn render_inline_handler(
    State(state): State<AppState>,
    query: Result<Query<RenderQuery>, QueryRejection>,
    body: Bytes,
) -> Result<Response, AppError> {
    let Query(query) = query.map_err(|rejection| query_error(&rejection))?;
    let plan = RenderPlan::from_query(&state.config, &query)?;
    respond(&state, plan, vec![CalendarSource::inline(body.to_vec())]).await
}

fn fetch_targets(config: &ServerConfig, query: &RenderQuery) -> Result<Vec<FetchTarget>, Error> {
    let mut targets = Vec::new();

    if let Some(ref url) = query.url {
        targets.push(FetchTarget {
            url: url.clone(),
            name: None,
            color: None,
        });
    }

    let named: Vec<_> = match query.calendars.as_deref() {
        Some(names) => names
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| {
                config
                    .calendar(name)
                    .ok_or_else(|| Error::Config(format!("Unknown calendar '{}'", name)))
            })
            .collect::<Result<_, _>>()?,
        // Without an explicit URL every configured calendar is rendered.
        None if targets.is_empty() => config.calendars.iter().collect(),
        None => Vec::new(),
    };
    targets.extend(named.into_iter().map(|calendar| FetchTarget {
        url: calendar.url.clone(),
        name: Some(calendar.name.clone()),
        color: calendar.color.clone(),
    }));

    if targets.is_empty() {
        return Err(Error::Config(
            "No calendar given: pass url, calendars or POST a feed".to_string(),
        ));
    }
    Ok(targets)
}

/// Fetches all targets concurrently, keeping their order.
async fn fetch_sources(
    state: &AppState,
    targets: Vec<FetchTarget>,
) -> Result<Vec<CalendarSource>, Error> {
    let mut tasks = JoinSet::new();
    for (index, target) in targets.into_iter().enumerate() {
        let client = state.http_client.clone();
        let limits = state.config.fetch;
        tasks.spawn(async move {
            let bytes = fetch_calendar(&client, &target.url, &limits).await?;
            let mut source = CalendarSource::inline(bytes).with_color(target.color);
            source.name = target.name;
            Ok::<_, FetchError>((index, source))
        });
    }

    let mut sources = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        let (index, source) = joined.map_err(|e| Error::Internal(e.to_string()))??;
        sources.push((index, source));
    }
    sources.sort_by_key(|(index, _)| *index);
    Ok(sources.into_iter().map(|(_, source)| source).collect())
}

async fn respond(
    state: &AppState,
    plan: RenderPlan,
    sources: Vec<CalendarSource>,
) -> Result<Response, AppError> {
    tracing::info!(
        "Rendering {} sources from {} to {} ({:?})",
        sources.len(),
        plan.window.from,
        plan.window.to,
        plan.shape.period
    );

    // Dropping this future (client gone) stops the blocking expansion.
    let cancel = Cancellation::new();
    let _guard = cancel.guard();
    let request = SheetRequest::new(sources, plan.window, plan.shape);
    let blocking_cancel = cancel.clone();
    let output = tokio::task::spawn_blocking(move || build_sheet(&request, &blocking_cancel))
        .await
        .map_err(|e| Error::Internal(e.to_string()))??;

    for warning in &output.warnings {
        tracing::warn!("{}", warning);
    }
    let warnings = output.warnings.len().to_string();

    let response = match plan.format {
        OutputFormat::Json => (
            StatusCode::OK,
            [(WARNINGS_HEADER, warnings)],
            Json(&output),
        )
            .into_response(),
        OutputFormat::Html => {
            let document = HtmlDocument::from_grid(&output.grid, &output.title());
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE.as_str(), "text/html; charset=utf-8".to_string()),
                    (WARNINGS_HEADER, warnings),
                ],
                document.html,
            )
                .into_response()
        }
        OutputFormat::Pdf => {
            let document = HtmlDocument::from_grid(&output.grid, &output.title());
            let bytes = state.renderer.render(&document).await?;
            (
                StatusCode::OK,
                [
                    (
                        header::CONTENT_TYPE.as_str(),
                        state.renderer.content_type().to_string(),
                    ),
                    (
                        header::CONTENT_DISPOSITION.as_str(),
                        "inline; filename=\"calendar.pdf\"".to_string(),
                    ),
                    (WARNINGS_HEADER, warnings),
                ],
                bytes,
            )
                .into_response()
        }
    };
    Ok(response)
}

/// 应用错误类型
#[derive(Debug)]
struct AppError(Error);

impl AppError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Parse(_) | Error::Recurrence(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Window(_) | Error::Config(_) => StatusCode::BAD_REQUEST,
            Error::Fetch(FetchError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
            Error::Fetch(FetchError::InvalidUrl(_)) => StatusCode::BAD_REQUEST,
            Error::Fetch(_) | Error::Render(_) => StatusCode::BAD_GATEWAY,
            Error::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            Error::Json(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        } else {
            tracing::info!("Request rejected: {}", self.0);
        }

        let body = Json(ErrorResponse {
            error: self.0.kind().to_string(),
            message: self.0.to_string(),
        });

        (status, body).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::{body::Body, http::Request};
    use ics_sheet_core::error::RenderError;
    use tower::ServiceExt;

    const FEED: &str = "BEGIN:VCALENDAR\r\n\
        VERSION:2.0\r\n\
        BEGIN:VEVENT\r\n\
        UID:lesson\r\n\
        DTSTART:20240506T150000Z\r\n\
        DTEND:20240506T160000Z\r\n\
        SUMMARY:Piano\r\n\
        RRULE:FREQ=WEEKLY;COUNT=3\r\n\
        END:VEVENT\r\n\
        BEGIN:VEVENT\r\n\
        UID:broken\r\n\
        DTSTART:20240507T150000Z\r\n\
        RRULE:FREQ=WEEKLY;COUNT=2;UNTIL=20240601T000000Z\r\n\
        END:VEVENT\r\n\
        END:VCALENDAR\r\n";

    struct FakePdf;

    #[async_trait]
    impl DocumentRenderer for FakePdf {
        fn content_type(&self) -> &'static str {
            "application/pdf"
        }

        async fn render(&self, document: &HtmlDocument) -> Result<Vec<u8>, RenderError> {
            Ok(format!("%PDF {}", document.title).into_bytes())
        }
    }

    fn app() -> Router {
        let mut config = ServerConfig::default();
        config.calendars.push(crate::config::NamedCalendar {
            name: "Family".to_string(),
            url: "https://calendar.example/private-token/basic.ics".to_string(),
            color: Some("#0B8043".to_string()),
        });
        router(AppState::new(config, Arc::new(FakePdf)).unwrap())
    }

    async fn send(request: Request<Body>) -> (StatusCode, Option<String>, Vec<u8>) {
        let response = app().oneshot(request).await.unwrap();
        let status = response.status();
        let warnings = response
            .headers()
            .get(WARNINGS_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, warnings, body.to_vec())
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn json(body: &[u8]) -> serde_json::Value {
        serde_json::from_slice(body).unwrap()
    }

    #[tokio::test]
    async fn health_check() {
        let (status, _, body) = send(get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["status"], "healthy");
    }

    #[tokio::test]
    async fn calendars_hide_urls() {
        let (status, _, body) = send(get("/calendars")).await;
        assert_eq!(status, StatusCode::OK);
        let body = json(&body);
        assert_eq!(body["calendars"][0]["name"], "Family");
        assert_eq!(body["calendars"][0]["color"], "#0B8043");
        assert!(!body.to_string().contains("private-token"));
    }

    #[tokio::test]
    async fn inline_feed_as_json() {
        let (status, warnings, body) = send(post(
            "/render?year=2024&month=5&format=json&capacity=2",
            FEED,
        ))
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(warnings.as_deref(), Some("1"));

        let body = json(&body);
        assert_eq!(body["grid"]["rows"].as_array().unwrap().len(), 31);
        assert_eq!(body["grid"]["capacity"], 2);
        assert_eq!(body["grid"]["rows"][5]["label"], "MO 06/05/2024");
        assert_eq!(
            body["grid"]["rows"][5]["cells"][0]["entries"][0]["label"],
            "[15:00] Piano"
        );
        assert_eq!(body["warnings"][0]["kind"], "Recurrence");
    }

    #[tokio::test]
    async fn inline_feed_as_html_in_display_zone() {
        let (status, _, body) = send(post(
            "/render?from=2024-05-06&to=2024-05-13&format=html&tz=Europe/Zurich&period=weekly",
            FEED,
        ))
        .await;
        assert_eq!(status, StatusCode::OK);
        let html = String::from_utf8(body).unwrap();
        assert!(html.contains("<title>06/05/2024 - 12/05/2024</title>"));
        assert!(html.contains("[17:00] Piano"));
        assert!(html.contains("Week 19, 2024"));
    }

    #[tokio::test]
    async fn pdf_goes_through_renderer() {
        let (status, _, body) = send(post("/render?year=2024&month=5", FEED)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"%PDF May 2024");
    }

    #[tokio::test]
    async fn missing_window_is_a_bad_request() {
        let (status, _, body) = send(post("/render?format=json", FEED)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json(&body)["error"], "WindowError");
    }

    #[tokio::test]
    async fn malformed_feed_is_unprocessable() {
        let (status, _, body) = send(post(
            "/render?year=2024&month=5",
            "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:x\r\n",
        ))
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json(&body)["error"], "ParseError");
    }

    #[tokio::test]
    async fn bad_options_are_config_errors() {
        for uri in [
            "/render?year=2024&month=5&format=docx",
            "/render?year=2024&month=5&tz=Mars/Base",
            "/render?year=2024&month=5&period=hourly",
            "/render?year=2024&month=5&calendars=Strangers",
        ] {
            let (status, _, body) = send(get(uri)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(json(&body)["error"], "ConfigError", "{uri}");
        }
    }

    #[tokio::test]
    async fn malformed_query_values_get_a_json_error() {
        let (status, _, body) = send(get("/render?year=2024&month=5&capacity=abc")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json(&body)["error"], "ConfigError");
        assert!(json(&body)["message"].as_str().is_some_and(|m| m.contains("capacity")));

        let (status, _, body) = send(post("/render?year=twenty&month=5", FEED)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json(&body)["error"], "WindowError");
    }

    #[tokio::test]
    async fn unsupported_url_scheme_is_rejected() {
        let (status, _, body) = send(get("/render?year=2024&month=5&url=file:///etc/passwd")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json(&body)["error"], "FetchError");
    }

    #[test]
    fn status_mapping() {
        let status = |err: Error| AppError(err).status();
        assert_eq!(status(Error::Fetch(FetchError::Timeout)), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status(Error::Fetch(FetchError::Status(500))), StatusCode::BAD_GATEWAY);
        assert_eq!(status(Error::Render(RenderError::Timeout)), StatusCode::BAD_GATEWAY);
        assert_eq!(status(Error::Cancelled), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status(Error::Internal("boom".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
