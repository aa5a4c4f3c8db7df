//! Axum JSON bridge exposing the deadline commands to a chat gateway.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path as AxumPath, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use timely_chat::{build_digest, ChatResponder, ChatTurn, Digest, ReminderError, ReminderService};
use timely_core::{Category, Clock, Deadline, RawDeadline, ReminderTarget, ReviewItem};
use timely_storage::{DeadlineStore, StoreError, UpsertOutcome};
use timely_sync::{PipelineStatus, ScrapeError, ScrapePipeline, TriggerOrigin, TriggerOutcome};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "timely-web";

const ADMIN_TOKEN_HEADER: &str = "x-admin-token";
const DEFAULT_REMINDER_LEAD_MINUTES: i64 = 24 * 60;
const MAX_CLEANUP_DAYS: i64 = 3650;

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub admin_token: Option<String>,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("TIMELY_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            admin_token: std::env::var("TIMELY_ADMIN_TOKEN")
                .ok()
                .filter(|token| !token.trim().is_empty()),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ScrapePipeline>,
    pub responder: Arc<ChatResponder>,
    pub reminders: Arc<ReminderService>,
    pub urgency_window: Duration,
    pub admin_token: Option<String>,
}

impl AppState {
    fn store(&self) -> &DeadlineStore {
        self.pipeline.store()
    }

    fn now(&self) -> DateTime<Utc> {
        self.pipeline.clock().now()
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        if err.is_not_found() {
            return Self::not_found(err.to_string());
        }
        if matches!(err, StoreError::InvalidMerge(_)) {
            return Self::bad_request(err.to_string());
        }
        error!(error = %err, "store failure");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl From<ReminderError> for ApiError {
    fn from(err: ReminderError) -> Self {
        let message = err.to_string();
        match err {
            ReminderError::DeadlineNotFound(_) | ReminderError::ReminderNotFound(_) => Self::not_found(message),
            ReminderError::InvalidLead => Self::bad_request(message),
            ReminderError::AlreadyDue { .. } => Self::new(StatusCode::UNPROCESSABLE_ENTITY, message),
            ReminderError::Delivery(_) => Self::new(StatusCode::BAD_GATEWAY, message),
            ReminderError::Store(inner) => inner.into(),
        }
    }
}

impl From<ScrapeError> for ApiError {
    fn from(err: ScrapeError) -> Self {
        let message = err.to_string();
        match err {
            ScrapeError::Network(_) => {
                warn!(error = %message, "admin scrape failed");
                Self::new(StatusCode::BAD_GATEWAY, message)
            }
            ScrapeError::Store(inner) => inner.into(),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn app(state: AppState) -> Router {
    let state = Arc::new(state);
    let admin = Router::new()
        .route("/admin/scrape", post(admin_scrape_handler))
        .route("/admin/merge", post(admin_merge_handler))
        .route("/admin/deadlines", post(admin_add_deadline_handler))
        .route("/admin/cleanup", post(admin_cleanup_handler))
        .route("/admin/review", get(admin_review_handler))
        .route("/admin/review/{id}/dismiss", post(admin_dismiss_handler))
        .route("/admin/status", get(admin_status_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/health", get(health_handler))
        .route("/deadlines", get(deadlines_handler))
        .route("/deadlines/search", get(search_handler))
        .route("/deadlines/next", get(next_handler))
        .route("/deadlines/urgent", get(urgent_handler))
        .route("/deadlines/{id}", get(deadline_detail_handler))
        .route("/chat", post(chat_handler))
        .route("/reminders", post(create_reminder_handler).get(list_reminders_handler))
        .route("/reminders/{id}", delete(cancel_reminder_handler))
        .route("/digest", get(digest_handler))
        .merge(admin)
        .with_state(state)
}

/// Binds `0.0.0.0:port` and serves until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "http bridge listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("serving http bridge")?;
    Ok(())
}

async fn require_admin(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    if let Some(expected) = &state.admin_token {
        let presented = request
            .headers()
            .get(ADMIN_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            warn!(path = %request.uri().path(), "admin request rejected");
            return ApiError::new(StatusCode::UNAUTHORIZED, "admin token required").into_response();
        }
    }
    next.run(request).await
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn admin_scrape_handler(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    match state.pipeline.trigger(TriggerOrigin::Admin).await? {
        TriggerOutcome::Completed(summary) => Ok(Json(summary).into_response()),
        TriggerOutcome::AlreadyRunning => Err(ApiError::new(StatusCode::CONFLICT, "a scrape is already running")),
    }
}

#[derive(Debug, Deserialize)]
struct MergeBody {
    keep_id: i64,
    remove_id: i64,
}

async fn admin_merge_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<MergeBody>,
) -> ApiResult<Response> {
    let outcome = state.store().merge(body.keep_id, body.remove_id, state.now()).await?;
    info!(keep_id = body.keep_id, remove_id = body.remove_id, "deadlines merged");
    Ok(Json(outcome).into_response())
}

#[derive(Debug, Deserialize)]
struct AddDeadlineBody {
    title: String,
    due: String,
    category: Option<String>,
    #[serde(default)]
    description: String,
    link: Option<String>,
}

#[derive(Debug, Serialize)]
struct AddDeadlineResponse {
    outcome: &'static str,
    deadline: Deadline,
}

async fn admin_add_deadline_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AddDeadlineBody>,
) -> ApiResult<Response> {
    if let Some(category) = &body.category {
        category
            .parse::<Category>()
            .map_err(|e| ApiError::bad_request(e.to_string()))?;
    }
    let raw = RawDeadline {
        title: body.title,
        date_text: Some(body.due),
        description: body.description,
        link: body.link.filter(|l| !l.trim().is_empty()),
        category_hint: body.category,
        section: None,
    };
    let draft = state
        .pipeline
        .normalizer()
        .normalize(&raw, state.now())
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let outcome = state.store().upsert(&draft).await?;
    let deadline = state
        .store()
        .get(outcome.id())
        .await?
        .ok_or_else(|| ApiError::not_found(format!("deadline {} not found", outcome.id())))?;

    let (status, outcome) = match outcome {
        UpsertOutcome::Inserted(_) => (StatusCode::CREATED, "inserted"),
        UpsertOutcome::Updated(_) => (StatusCode::OK, "updated"),
        UpsertOutcome::Unchanged(_) => (StatusCode::OK, "unchanged"),
    };
    Ok((status, Json(AddDeadlineResponse { outcome, deadline })).into_response())
}

#[derive(Debug, Deserialize)]
struct CleanupBody {
    days_old: i64,
}

#[derive(Debug, Serialize)]
struct CleanupResponse {
    deleted: u64,
    cutoff: DateTime<Utc>,
    review_items: Vec<ReviewItem>,
}

async fn admin_cleanup_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CleanupBody>,
) -> ApiResult<Json<CleanupResponse>> {
    if !(0..=MAX_CLEANUP_DAYS).contains(&body.days_old) {
        return Err(ApiError::bad_request(format!(
            "days_old must be between 0 and {MAX_CLEANUP_DAYS}"
        )));
    }
    let cutoff = state.now() - Duration::days(body.days_old);
    let deleted = state.store().delete_older_than(cutoff).await?;
    let review_items = state.store().open_review_items().await?;
    Ok(Json(CleanupResponse {
        deleted,
        cutoff,
        review_items,
    }))
}

async fn admin_review_handler(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<ReviewItem>>> {
    Ok(Json(state.store().open_review_items().await?))
}

async fn admin_dismiss_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult<StatusCode> {
    state.store().dismiss_review(id, state.now()).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    deadlines_total: i64,
    upcoming: usize,
    urgent: usize,
    open_review_items: usize,
    reminders_pending: i64,
    cache_age_secs: Option<i64>,
    pipeline: PipelineStatus,
}

async fn admin_status_handler(State(state): State<Arc<AppState>>) -> ApiResult<Json<StatusResponse>> {
    let now = state.now();
    let store = state.store();
    let upcoming = store.list_upcoming(now).await?;
    Ok(Json(StatusResponse {
        deadlines_total: store.count().await?,
        urgent: upcoming
            .iter()
            .filter(|d| d.is_due_within(now, state.urgency_window))
            .count(),
        upcoming: upcoming.len(),
        open_review_items: store.open_review_items().await?.len(),
        reminders_pending: store.count_reminders().await?,
        cache_age_secs: state
            .responder
            .cache()
            .age()
            .await
            .map(|age| age.num_seconds()),
        pipeline: state.pipeline.status(),
    }))
}

#[derive(Debug, Deserialize, Default)]
struct DeadlinesQuery {
    category: Option<String>,
}

async fn deadlines_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeadlinesQuery>,
) -> ApiResult<Json<Vec<Deadline>>> {
    let now = state.now();
    let deadlines = match query.category.as_deref().filter(|c| !c.trim().is_empty()) {
        Some(category) => {
            let category = category
                .parse::<Category>()
                .map_err(|e| ApiError::bad_request(e.to_string()))?;
            state.store().list_by_category(category, now).await?
        }
        None => state.store().list_upcoming(now).await?,
    };
    Ok(Json(deadlines))
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: Option<String>,
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<Vec<Deadline>>> {
    let q = query.q.unwrap_or_default();
    if q.trim().is_empty() {
        return Err(ApiError::bad_request("query parameter q is required"));
    }
    Ok(Json(state.store().search(&q, state.now()).await?))
}

#[derive(Debug, Deserialize)]
struct NextQuery {
    days: Option<i64>,
}

async fn next_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NextQuery>,
) -> ApiResult<Json<Vec<Deadline>>> {
    let days = query.days.unwrap_or(7);
    if !(1..=365).contains(&days) {
        return Err(ApiError::bad_request("days must be between 1 and 365"));
    }
    Ok(Json(
        state
            .store()
            .list_due_within(state.now(), Duration::days(days))
            .await?,
    ))
}

async fn urgent_handler(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Deadline>>> {
    Ok(Json(
        state
            .store()
            .list_due_within(state.now(), state.urgency_window)
            .await?,
    ))
}

async fn deadline_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult<Json<Deadline>> {
    state
        .store()
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("deadline {id} not found")))
}

#[derive(Debug, Deserialize)]
struct ChatBody {
    message: String,
    #[serde(default)]
    history: Vec<ChatTurn>,
}

async fn chat_handler(State(state): State<Arc<AppState>>, Json(body): Json<ChatBody>) -> ApiResult<Response> {
    if body.message.trim().is_empty() {
        return Err(ApiError::bad_request("message must not be empty"));
    }
    let reply = state.responder.respond(&body.message, &body.history).await;
    Ok(Json(reply).into_response())
}

#[derive(Debug, Deserialize)]
struct CreateReminderBody {
    target: String,
    deadline_id: i64,
    lead_minutes: Option<i64>,
}

fn parse_target(raw: &str) -> ApiResult<ReminderTarget> {
    raw.parse::<ReminderTarget>()
        .map_err(|e| ApiError::bad_request(e.to_string()))
}

async fn create_reminder_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateReminderBody>,
) -> ApiResult<Response> {
    let target = parse_target(&body.target)?;
    let lead = Duration::try_minutes(body.lead_minutes.unwrap_or(DEFAULT_REMINDER_LEAD_MINUTES))
        .ok_or_else(|| ApiError::bad_request("lead_minutes is out of range"))?;
    let request = state.reminders.schedule(target, body.deadline_id, lead).await?;
    Ok((StatusCode::CREATED, Json(request)).into_response())
}

#[derive(Debug, Deserialize)]
struct RemindersQuery {
    target: String,
}

async fn list_reminders_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RemindersQuery>,
) -> ApiResult<Response> {
    let target = parse_target(&query.target)?;
    Ok(Json(state.reminders.list_for(target).await?).into_response())
}

async fn cancel_reminder_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult<StatusCode> {
    state.reminders.cancel(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct DigestResponse {
    #[serde(flatten)]
    digest: Digest,
    text: String,
}

async fn digest_handler(State(state): State<Arc<AppState>>) -> ApiResult<Json<DigestResponse>> {
    let now = state.now();
    let deadlines = state.store().list_upcoming(now).await?;
    let digest = build_digest(
        &deadlines,
        now,
        state.urgency_window,
        state.pipeline.normalizer().timezone(),
    );
    let text = digest.render();
    Ok(Json(DigestResponse { digest, text }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use chrono::TimeZone;
    use chrono_tz::America::New_York;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::path::Path;
    use timely_adapters::SectionListExtractor;
    use timely_chat::{AiError, ChatRequest, ContextBuilder, LogSink, SnapshotCache, TextGenerator};
    use timely_core::{CategoryRules, ManualClock};
    use timely_storage::{FetchError, FetchedPage, PageSource, StaticPageSource};
    use timely_sync::Normalizer;
    use tokio::sync::Notify;
    use tower::ServiceExt;
    use uuid::Uuid;

    const PAGE_URL: &str = "https://firstyear.example.edu/summer/deadlines";

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()
    }

    struct Canned;

    #[async_trait]
    impl TextGenerator for Canned {
        fn name(&self) -> &str {
            "canned"
        }

        async fn generate(&self, _request: &ChatRequest) -> Result<String, AiError> {
            Ok("\"Timely: on it.\"".into())
        }
    }

    fn fixture_source() -> Arc<dyn PageSource> {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/deadlines-page/sample/page.html");
        Arc::new(StaticPageSource::from_file(PAGE_URL, path).unwrap())
    }

    async fn state_with(source: Arc<dyn PageSource>, admin_token: Option<&str>) -> AppState {
        let store = DeadlineStore::in_memory().await.unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(start()));
        let pipeline = Arc::new(ScrapePipeline::new(
            source,
            Arc::new(SectionListExtractor::new()),
            Normalizer::new(CategoryRules::builtin(), New_York),
            store.clone(),
            clock.clone(),
        ));
        let cache = Arc::new(SnapshotCache::new(store.clone(), clock.clone(), Duration::minutes(5)));
        let responder = Arc::new(ChatResponder::new(
            Arc::new(Canned),
            cache,
            ContextBuilder::new(CategoryRules::builtin(), Duration::days(3), New_York),
            clock.clone(),
        ));
        let reminders = Arc::new(ReminderService::new(store, Arc::new(LogSink), clock, New_York));
        AppState {
            pipeline,
            responder,
            reminders,
            urgency_window: Duration::days(3),
            admin_token: admin_token.map(str::to_string),
        }
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        send_with(app, method, uri, body, None).await
    }

    async fn send_with(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut builder = axum::http::Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(ADMIN_TOKEN_HEADER, token);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn health_is_ok() {
        let app = app(state_with(fixture_source(), None).await);
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn admin_scrape_then_list_and_filter() {
        let app = app(state_with(fixture_source(), None).await);
        let (status, summary) = send(&app, "POST", "/admin/scrape", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["inserted"], 4);
        assert_eq!(summary["origin"], "admin");

        let (_, all) = send(&app, "GET", "/deadlines", None).await;
        assert_eq!(all.as_array().unwrap().len(), 4);

        let (_, medical) = send(&app, "GET", "/deadlines?category=Medical", None).await;
        assert_eq!(medical.as_array().unwrap().len(), 1);

        let (status, err) = send(&app, "GET", "/deadlines?category=Sports", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(err["error"].as_str().unwrap().contains("Sports"));

        let (_, found) = send(&app, "GET", "/deadlines/search?q=immunization", None).await;
        assert_eq!(found.as_array().unwrap().len(), 1);
        let (status, _) = send(&app, "GET", "/deadlines/search?q=", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, next) = send(&app, "GET", "/deadlines/next?days=20", None).await;
        let next = next.as_array().unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0]["title"], "Housing application opens May 20");

        let id = next[0]["id"].as_i64().unwrap();
        let (status, detail) = send(&app, "GET", &format!("/deadlines/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["category"], "Housing");
        let (status, _) = send(&app, "GET", "/deadlines/9999", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, status_body) = send(&app, "GET", "/admin/status", None).await;
        assert_eq!(status_body["deadlines_total"], 4);
        assert_eq!(status_body["pipeline"]["stage"], "idle");
    }

    #[tokio::test]
    async fn admin_routes_require_the_configured_token() {
        let app = app(state_with(fixture_source(), Some("s3cret")).await);
        let (status, _) = send(&app, "GET", "/admin/status", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = send_with(&app, "GET", "/admin/status", None, Some("wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = send_with(&app, "GET", "/admin/status", None, Some("s3cret")).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(&app, "GET", "/deadlines", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    struct FailingSource;

    #[async_trait]
    impl PageSource for FailingSource {
        fn url(&self) -> &str {
            PAGE_URL
        }

        async fn fetch_page(&self, _run_id: Uuid) -> Result<FetchedPage, FetchError> {
            Err(FetchError::HttpStatus {
                status: 500,
                url: PAGE_URL.to_string(),
            })
        }
    }

    #[tokio::test]
    async fn network_failure_maps_to_bad_gateway() {
        let app = app(state_with(Arc::new(FailingSource), None).await);
        let (status, body) = send(&app, "POST", "/admin/scrape", None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().contains("network failure"));
    }

    #[tokio::test]
    async fn store_failure_during_scrape_is_a_server_error() {
        let state = state_with(fixture_source(), None).await;
        state.pipeline.store().pool().close().await;
        let app = app(state);

        let (status, body) = send(&app, "POST", "/admin/scrape", None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].is_string());
    }

    struct GatedSource {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl PageSource for GatedSource {
        fn url(&self) -> &str {
            PAGE_URL
        }

        async fn fetch_page(&self, run_id: Uuid) -> Result<FetchedPage, FetchError> {
            self.entered.notify_one();
            self.release.notified().await;
            StaticPageSource::new(PAGE_URL, "<h3>June</h3><ul><li>Pay the tuition bill by June 20.</li></ul>")
                .fetch_page(run_id)
                .await
        }
    }

    #[tokio::test]
    async fn overlapping_scrape_is_a_conflict() {
        let gate = Arc::new(GatedSource {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let app = app(state_with(gate.clone(), None).await);

        let first = {
            let app = app.clone();
            tokio::spawn(async move { send(&app, "POST", "/admin/scrape", None).await })
        };
        gate.entered.notified().await;
        let (status, _) = send(&app, "POST", "/admin/scrape", None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        gate.release.notify_one();
        let (status, _) = first.await.unwrap();
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn admin_add_deadline_goes_through_the_normalizer() {
        let app = app(state_with(fixture_source(), None).await);
        let body = json!({"title": "Pay tuition deposit", "due": "June 10", "category": "Financial"});

        let (status, created) = send(&app, "POST", "/admin/deadlines", Some(body.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["outcome"], "inserted");
        assert_eq!(created["deadline"]["category"], "Financial");
        assert_eq!(created["deadline"]["due_at"], "2026-06-11T03:59:59Z");

        let (status, again) = send(&app, "POST", "/admin/deadlines", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(again["outcome"], "unchanged");

        let (status, _) = send(
            &app,
            "POST",
            "/admin/deadlines",
            Some(json!({"title": "Mystery", "due": "someday"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            "POST",
            "/admin/deadlines",
            Some(json!({"title": "Mystery", "due": "June 1", "category": "Sports"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn merge_and_review_flow() {
        let app = app(state_with(fixture_source(), None).await);
        let (_, a) = send(
            &app,
            "POST",
            "/admin/deadlines",
            Some(json!({"title": "Submit housing form", "due": "June 10"})),
        )
        .await;
        let (_, b) = send(
            &app,
            "POST",
            "/admin/deadlines",
            Some(json!({"title": "Submit housing forms", "due": "June 11", "link": "https://example.edu/h"})),
        )
        .await;
        let keep = a["deadline"]["id"].as_i64().unwrap();
        let remove = b["deadline"]["id"].as_i64().unwrap();

        let (status, _) = send(
            &app,
            "POST",
            "/admin/merge",
            Some(json!({"keep_id": keep, "remove_id": keep})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, merged) = send(
            &app,
            "POST",
            "/admin/merge",
            Some(json!({"keep_id": keep, "remove_id": remove})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(merged["removed_id"], remove);
        assert_eq!(merged["kept"]["link"], "https://example.edu/h");

        let (status, _) = send(&app, "GET", &format!("/deadlines/{remove}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, review) = send(&app, "GET", "/admin/review", None).await;
        assert!(review.as_array().unwrap().is_empty());
        let (status, _) = send(&app, "POST", "/admin/review/77/dismiss", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cleanup_removes_past_deadlines() {
        let app = app(state_with(fixture_source(), None).await);
        send(
            &app,
            "POST",
            "/admin/deadlines",
            Some(json!({"title": "Old transcript upload", "due": "2026-03-01"})),
        )
        .await;
        send(
            &app,
            "POST",
            "/admin/deadlines",
            Some(json!({"title": "Upcoming essay", "due": "2026-05-20"})),
        )
        .await;

        let (status, body) = send(&app, "POST", "/admin/cleanup", Some(json!({"days_old": 30}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], 1);
        assert!(body["review_items"].as_array().unwrap().is_empty());

        let (status, _) = send(&app, "POST", "/admin/cleanup", Some(json!({"days_old": -1}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, body) = send(
            &app,
            "POST",
            "/admin/cleanup",
            Some(json!({"days_old": 1_000_000_000_000_000i64})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("days_old"));
    }

    #[tokio::test]
    async fn reminder_lifecycle() {
        let app = app(state_with(fixture_source(), None).await);
        send(&app, "POST", "/admin/scrape", None).await;
        let (_, next) = send(&app, "GET", "/deadlines/next?days=20", None).await;
        let deadline_id = next[0]["id"].as_i64().unwrap();

        let (status, created) = send(
            &app,
            "POST",
            "/reminders",
            Some(json!({"target": "user:42", "deadline_id": deadline_id, "lead_minutes": 60})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["lead_minutes"], 60);
        assert_eq!(created["target"]["kind"], "user");

        let (_, listed) = send(&app, "GET", "/reminders?target=user:42", None).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let (status, _) = send(
            &app,
            "POST",
            "/reminders",
            Some(json!({"target": "group:1", "deadline_id": deadline_id})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            "POST",
            "/reminders",
            Some(json!({"target": "user:42", "deadline_id": deadline_id, "lead_minutes": 60 * 24 * 30})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        for lead in [i64::MAX, 60 * 24 * 400] {
            let (status, _) = send(
                &app,
                "POST",
                "/reminders",
                Some(json!({"target": "user:42", "deadline_id": deadline_id, "lead_minutes": lead})),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "lead {lead}");
        }

        let id = created["id"].as_i64().unwrap();
        let (status, _) = send(&app, "DELETE", &format!("/reminders/{id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, "DELETE", &format!("/reminders/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn chat_replies_are_cleaned_and_empty_messages_rejected() {
        let app = app(state_with(fixture_source(), None).await);
        let (status, reply) = send(&app, "POST", "/chat", Some(json!({"message": "when is housing due?"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["reply"], "on it.");
        assert_eq!(reply["used_fallback"], false);

        let (status, _) = send(&app, "POST", "/chat", Some(json!({"message": "  "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn digest_and_urgent_views() {
        let app = app(state_with(fixture_source(), None).await);
        send(
            &app,
            "POST",
            "/admin/deadlines",
            Some(json!({"title": "Pay tuition deposit", "due": "tomorrow"})),
        )
        .await;

        let (_, urgent) = send(&app, "GET", "/deadlines/urgent", None).await;
        assert_eq!(urgent.as_array().unwrap().len(), 1);

        let (status, digest) = send(&app, "GET", "/digest", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(digest["urgent"].as_array().unwrap().len(), 1);
        assert!(digest["text"].as_str().unwrap().contains("Pay tuition deposit - due tomorrow"));
    }
}
