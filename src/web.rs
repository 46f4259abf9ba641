use crate::cache::CorpusCache;
use crate::render::{self, RenderMode};
use crate::search::SearchCriterion;
use crate::session::{CellAction, SessionError, TablesSession};
use crate::source::{CorpusSource, FixtureCorpus, SourceError};
use crate::taxonomy::{CategoryNode, FlatNode};
use crate::template::{CellPath, TemplateDocument};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use quick_xml::escape::escape;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::compression::CompressionLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::info;

type SharedState = Arc<AppState>;
type WebSession = TablesSession<Arc<FixtureCorpus>>;

const STYLESHEET: &str = r#"<script src="https://cdn.jsdelivr.net/npm/@tailwindcss/browser@4"></script>
    <style>
      .corpus-table { border-collapse: collapse; margin: 1rem 0; }
      .corpus-table td, .corpus-table th { border: 1px solid #cbd5e1; padding: 0.25rem 0.5rem; vertical-align: top; }
      .corpus-table caption { font-weight: 600; text-align: left; padding-bottom: 0.25rem; }
      .search-target { background: #fef9c3; cursor: pointer; }
    </style>"#;

/// Shared by every request. Each request drives its own session over the
/// shared cache.
pub struct AppState {
    pub corpus: Arc<FixtureCorpus>,
    pub cache: Arc<CorpusCache>,
}

impl AppState {
    pub fn new(corpus: FixtureCorpus) -> Self {
        Self {
            corpus: Arc::new(corpus),
            cache: Arc::new(CorpusCache::new()),
        }
    }

    fn session(&self) -> WebSession {
        TablesSession::new(Arc::clone(&self.corpus), Arc::clone(&self.cache))
    }
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub addr: SocketAddr,
    pub corpus_path: PathBuf,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            corpus_path: PathBuf::from("demos/corpus.json"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WebError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to load corpus: {0}")]
    Corpus(#[from] SourceError),
}

pub async fn serve(config: WebConfig) -> Result<(), WebError> {
    let corpus = FixtureCorpus::from_path(&config.corpus_path)?;
    info!(
        corpus = %config.corpus_path.display(),
        categories = corpus.categories.len(),
        views = corpus.views.len(),
        "Loaded corpus"
    );
    let router = build_router(Arc::new(AppState::new(corpus)));
    info!(%config.addr, "Binding HTTP listener");
    let listener = TcpListener::bind(config.addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("HTTP server exited");
    Ok(())
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: message.into(),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::UnknownCategory(_)
            | SessionError::TableNotFound(_)
            | SessionError::NoCell(_) => Self::not_found(err.to_string()),
            SessionError::NotATable(_) | SessionError::NoView => {
                Self::bad_request(err.to_string())
            }
        }
    }
}

impl From<SourceError> for ApiError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::CategoryNotFound(_) => Self::not_found(err.to_string()),
            _ => Self::unavailable(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let payload = json!({ "error": self.message });
        (self.status, Json(payload)).into_response()
    }
}

fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/tables", get(tables_html))
        .route("/api/tables", get(api_tables))
        .route("/api/categories", get(api_categories))
        .route("/api/categories/:id", get(api_category))
        .route("/api/search", post(api_search))
        .route("/healthz", get(health))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CompressionLayer::new())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut stream) = signal(SignalKind::terminate()) {
            let _ = stream.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "corpus-tables-web" }))
}

#[derive(Debug, Default, Deserialize)]
struct TableParams {
    category: Option<u32>,
    view: Option<String>,
    sample: Option<String>,
    #[serde(default)]
    search: bool,
}

#[derive(Debug, Serialize)]
struct TablePayload {
    view: String,
    sample: Option<String>,
    search_mode: bool,
    search_targets: usize,
    /// `None` when the view's markup could not be parsed.
    document: Option<TemplateDocument>,
}

async fn load_table(session: &mut WebSession, params: &TableParams) -> Result<TablePayload, ApiError> {
    if let Some(sample) = params.sample.clone() {
        session.select_sample(Some(sample)).await;
    }
    if params.search {
        session.set_search_mode(true).await;
    }
    let view_name = params
        .view
        .as_deref()
        .map(str::trim)
        .filter(|view| !view.is_empty());
    let view = match (params.category, view_name) {
        (Some(id), _) => session.select_category(id).await?,
        (None, Some(name)) => session.open_view(name).await?,
        (None, None) => {
            return Err(ApiError::bad_request(
                "Provide either `category` or `view` query parameters.",
            ));
        }
    };
    let filename = view.filename.clone();
    let document = view.rendered.clone();
    Ok(TablePayload {
        view: filename,
        sample: session.sample().map(str::to_string),
        search_mode: session.is_search_mode(),
        search_targets: document.as_ref().map_or(0, render::search_targets),
        document,
    })
}

async fn api_tables(
    State(state): State<SharedState>,
    Query(params): Query<TableParams>,
) -> Result<Json<TablePayload>, ApiError> {
    let mut session = state.session();
    Ok(Json(load_table(&mut session, &params).await?))
}

async fn tables_html(
    State(state): State<SharedState>,
    Query(params): Query<TableParams>,
) -> Response {
    let mut session = state.session();
    match load_table(&mut session, &params).await {
        Ok(payload) => Html(render_table_page(&payload, &params, &state.corpus.samples()))
            .into_response(),
        Err(err) => (err.status, Html(render_error_page(&err.message))).into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct CategoryParams {
    parent: Option<u32>,
}

async fn api_categories(
    State(state): State<SharedState>,
    Query(params): Query<CategoryParams>,
) -> Result<Json<Vec<CategoryNode>>, ApiError> {
    let children = state.corpus.children(params.parent).await?;
    state.cache.insert_categories(children.iter().cloned());
    Ok(Json(children))
}

async fn api_category(
    State(state): State<SharedState>,
    Path(id): Path<u32>,
) -> Result<Json<CategoryNode>, ApiError> {
    if let Some(node) = state.cache.category(id) {
        return Ok(Json(node));
    }
    let node = state.corpus.category(id).await?;
    state.cache.insert_category(node.clone());
    Ok(Json(node))
}

#[derive(Debug, Deserialize)]
struct SearchRequest {
    category: Option<u32>,
    view: Option<String>,
    #[serde(default)]
    picks: Vec<CriterionPick>,
}

/// A clicked cell and the value typed into the criterion prompt.
#[derive(Debug, Deserialize)]
struct CriterionPick {
    cell: CellPath,
    value: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    view: String,
    criteria: Vec<SearchCriterion>,
    /// Picks on cells that cannot become criteria.
    ignored: usize,
}

/// Replays cell picks through search mode and returns the resulting query.
async fn api_search(
    State(state): State<SharedState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    let mut session = state.session();
    let params = TableParams {
        category: request.category,
        view: request.view,
        sample: None,
        search: true,
    };
    let payload = load_table(&mut session, &params).await?;
    let mut ignored = 0;
    for pick in request.picks {
        match session.click_cell(pick.cell).await? {
            CellAction::CaptureCriterion(_) => {
                session.confirm_criterion(pick.value);
            }
            _ => ignored += 1,
        }
    }
    Ok(Json(SearchResponse {
        view: payload.view,
        criteria: session.criteria().to_vec(),
        ignored,
    }))
}

async fn home(State(state): State<SharedState>) -> impl IntoResponse {
    let mut session = state.session();
    session.load_roots().await;
    session.expand_all().await;
    Html(render_home(&session.navigator().flatten()))
}

fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, NON_ALPHANUMERIC).to_string()
}

fn table_link(params: &TableParams, sample: Option<&str>, search: bool) -> String {
    let mut link = String::from("/tables?");
    match (params.category, params.view.as_deref()) {
        (Some(id), _) => {
            let _ = write!(link, "category={id}");
        }
        (None, Some(view)) => {
            let _ = write!(link, "view={}", encode_component(view));
        }
        (None, None) => {}
    }
    if let Some(sample) = sample {
        let _ = write!(link, "&sample={}", encode_component(sample));
    }
    if search {
        link.push_str("&search=true");
    }
    link
}

fn page(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>{title}</title>
    {STYLESHEET}
  </head>
  <body class="bg-slate-50 text-slate-900">
    <main class="min-h-screen flex flex-col items-center justify-start py-10 px-4">
      <div class="max-w-5xl w-full space-y-6">
{body}
      </div>
    </main>
  </body>
</html>"#,
        title = escape(title),
    )
}

fn render_home(rows: &[FlatNode<'_>]) -> String {
    let mut body = String::from(
        r#"        <p class="uppercase tracking-wide text-sm text-slate-500">Corpus tables</p>
        <h1 class="text-4xl font-extrabold tracking-tight">Categories</h1>
        <ul class="space-y-1">
"#,
    );
    for row in rows {
        let indent = row.level * 24;
        let name = escape(row.node.name.as_str());
        if row.node.is_end_leaf() {
            let _ = writeln!(
                body,
                r#"          <li style="margin-left: {indent}px"><a class="text-blue-700 hover:underline" href="/tables?category={id}">{name}</a></li>"#,
                id = row.node.id,
            );
        } else {
            let _ = writeln!(
                body,
                r#"          <li style="margin-left: {indent}px" class="font-semibold">{name}</li>"#
            );
        }
    }
    body.push_str("        </ul>");
    page("Corpus tables", &body)
}

fn render_table_page(payload: &TablePayload, params: &TableParams, samples: &[&str]) -> String {
    let mut body = String::new();
    let _ = writeln!(
        body,
        r#"        <p class="uppercase tracking-wide text-sm text-slate-500"><a href="/">Categories</a> / {}</p>"#,
        escape(payload.view.as_str())
    );
    body.push_str(r#"        <nav class="flex flex-wrap gap-3">"#);
    for &sample in samples {
        let active = payload.sample.as_deref() == Some(sample);
        let class = if active { "font-bold underline" } else { "text-blue-700" };
        let _ = write!(
            body,
            r#"<a class="{class}" href="{href}">{label}</a>"#,
            href = table_link(params, Some(sample), false),
            label = escape(sample),
        );
    }
    let (search_label, search_href) = if payload.search_mode {
        ("Leave search", table_link(params, None, false))
    } else {
        ("Search", table_link(params, None, true))
    };
    let _ = writeln!(
        body,
        r#"<a class="ml-auto text-blue-700" href="{search_href}">{search_label}</a></nav>"#
    );
    match &payload.document {
        Some(document) => {
            let mode = if payload.search_mode {
                RenderMode::Search
            } else {
                RenderMode::Answers
            };
            if payload.search_mode {
                let _ = writeln!(
                    body,
                    r#"        <p class="text-slate-600">{} cells can be used as search criteria.</p>"#,
                    payload.search_targets
                );
            }
            body.push_str(&render::to_html(document, mode));
        }
        None => body.push_str(r#"        <p class="text-slate-600">No data.</p>"#),
    }
    page(&payload.view, &body)
}

fn render_error_page(message: &str) -> String {
    let body = format!(
        r#"        <h1 class="text-4xl font-extrabold tracking-tight">Something went wrong</h1>
        <p class="text-lg text-slate-600">{}</p>
        <a href="/" class="inline-flex items-center rounded-md bg-slate-900 px-4 py-2 text-white font-semibold">Back to categories</a>"#,
        escape(message)
    );
    page("Corpus tables • Error", &body)
}

#[cfg(all(test, feature = "web"))]
mod tests {
    use super::*;
    use axum::{body, body::Body, http::Request};
    use serde_json::Value;
    use tower::ServiceExt;

    const CORPUS: &str = r#"{
        "categories": [
            {"id": 1, "name": "Morphology", "hierarchy": ["RMS", "Morphology"], "has_children": true},
            {"id": 12, "name": "Plural", "hierarchy": ["RMS", "Morphology", "Plural"], "parent": 1, "path": "morphology/plural"},
            {"id": 13, "name": "Dual", "parent": 1}
        ],
        "views": [
            {"filename": "morphology-plural.html", "content": "<h2>Number</h2><table><tr><td>{id: 12, field: question}</td><td>{id: 12, field: form}</td></tr></table>"}
        ],
        "answers": [
            {"category": 12, "sample": "S1", "form": "cats"},
            {"category": 12, "sample": "S 2", "form": "kittens"}
        ]
    }"#;

    fn test_router() -> Router {
        let corpus = FixtureCorpus::from_json_str(CORPUS).unwrap();
        build_router(Arc::new(AppState::new(corpus)))
    }

    async fn get_json(uri: &str) -> (StatusCode, Value) {
        let response = test_router()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn get_text(uri: &str) -> (StatusCode, String) {
        let response = test_router()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn api_tables_binds_the_sample() {
        let (status, payload) = get_json("/api/tables?category=12&sample=S1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["view"], "morphology-plural.html");
        assert_eq!(payload["sample"], "S1");
        let cells = &payload["document"]["sections"][0]["tables"][0]["rows"][0]["cells"];
        assert_eq!(cells[0]["content"]["value"], "Plural");
        assert_eq!(cells[1]["content"]["value"], "cats");
    }

    #[tokio::test]
    async fn api_tables_search_mode_drops_the_sample() {
        let (status, payload) = get_json("/api/tables?view=morphology-plural&sample=S1&search=true").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["search_mode"], true);
        assert!(payload["sample"].is_null());
        assert_eq!(payload["search_targets"], 1);
    }

    #[tokio::test]
    async fn api_tables_reports_missing_views() {
        let (status, payload) = get_json("/api/tables?category=13").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(payload["error"].as_str().unwrap().contains("#13"));

        let (status, _) = get_json("/api/tables?category=404").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get_json("/api/tables").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn api_categories_lists_levels() {
        let (status, payload) = get_json("/api/categories").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.as_array().unwrap().len(), 1);

        let (_, payload) = get_json("/api/categories?parent=1").await;
        assert_eq!(payload.as_array().unwrap().len(), 2);

        let (status, payload) = get_json("/api/categories/12").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["path"], "morphology/plural");
    }

    #[tokio::test]
    async fn api_search_collects_criteria_in_order() {
        let request = json!({
            "view": "morphology-plural",
            "picks": [
                {"cell": {"section": 0, "table": 0, "row": 0, "cell": 1}, "value": "cats"},
                {"cell": {"section": 0, "table": 0, "row": 0, "cell": 0}, "value": "ignored"},
                {"cell": {"section": 0, "table": 0, "row": 0, "cell": 1}, "value": "cats"}
            ]
        });
        let response = test_router()
            .oneshot(
                Request::post("/api/search")
                    .header("content-type", "application/json")
                    .body(Body::from(request.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_success());
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let payload: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(payload["ignored"], 1);
        let criteria = payload["criteria"].as_array().unwrap();
        assert_eq!(criteria.len(), 2);
        assert_eq!(criteria[0]["questionId"], 12);
        assert_eq!(criteria[0]["fieldName"], "form");
        assert_eq!(criteria[0]["value"], "cats");
    }

    #[tokio::test]
    async fn table_page_renders_with_sample_links() {
        let (status, html) = get_text("/tables?category=12&sample=S1").await;
        assert_eq!(status, StatusCode::OK);
        assert!(html.contains("<h2>Number</h2>"));
        assert!(html.contains(">cats</td>"));
        assert!(html.contains("href=\"/tables?category=12&sample=S%202\""));
        assert!(html.contains("search=true"));
    }

    #[tokio::test]
    async fn home_lists_the_expanded_tree() {
        let (status, html) = get_text("/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(html.contains("href=\"/tables?category=12\">Plural</a>"));
        assert!(html.contains(">Dual</li>"));
    }

    #[tokio::test]
    async fn error_page_keeps_the_status() {
        let (status, html) = get_text("/tables?category=404").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(html.contains("unknown category #404"));
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (status, payload) = get_json("/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["status"], "ok");
    }
}
