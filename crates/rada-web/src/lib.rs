//! Axum + Askama dashboard for the session mirror.

use std::path::PathBuf;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path as AxumPath, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rada_core::{SweepMode, SweepStatus};
use rada_storage::MirrorDir;
use rada_sync::{
    maybe_build_scheduler, run_guarded, ActionLog, SettingsError, SettingsStore, SweepController, SyncConfig,
    SyncServices,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "rada-web";

const RECENT_LOG_ENTRIES: usize = 20;

#[derive(Clone)]
pub struct AppState {
    pub services: SyncServices,
    pub controller: Arc<SweepController>,
    pub settings: Arc<SettingsStore>,
    pub log: Arc<ActionLog>,
}

impl AppState {
    pub fn new(services: SyncServices, settings: SettingsStore, log: ActionLog) -> Self {
        let log = Arc::new(log);
        Self {
            services,
            controller: Arc::new(SweepController::new(Some(log.clone()))),
            settings: Arc::new(settings),
            log,
        }
    }

    pub fn from_config(config: &SyncConfig) -> anyhow::Result<Self> {
        Ok(Self::new(
            SyncServices::from_config(config)?,
            SettingsStore::load_or_default(&config.settings_path, &config.download_dir),
            ActionLog::new(&config.log_path),
        ))
    }

    fn mirror(&self) -> MirrorDir {
        MirrorDir::new(self.settings.download_dir())
    }

    async fn record(&self, action: &str, details: &str) {
        if let Err(err) = self.log.append(action, details).await {
            warn!(error = %format!("{err:#}"), "failed to write action log");
        }
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    listing_url: String,
    download_dir: String,
    existing_sessions_count: usize,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    latest_sesja: Option<u32>,
    latest_porzadek: Option<u32>,
    sesja_url: Option<String>,
    porzadek_url: Option<String>,
    discovery_error: Option<String>,
    download_status: SweepStatus,
    base_url: String,
    current_download_dir: String,
    existing_sessions: Vec<u32>,
    existing_sessions_count: usize,
    available_albums: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AlbumRequest {
    #[serde(default)]
    album_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PathRequest {
    #[serde(default)]
    path: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/status", get(status_handler))
        .route("/api/download/latest", post(download_latest_handler))
        .route("/api/download/all", post(download_existing_handler))
        .route("/api/download/from_first", post(download_from_first_handler))
        .route("/api/download/session/{number}", post(download_session_handler))
        .route("/api/download/cancel", post(cancel_handler))
        .route("/api/files", get(files_handler))
        .route("/api/logs", get(logs_handler))
        .route("/download/{*path}", get(file_download_handler))
        .route("/api/settings/folder", get(folder_settings_handler).post(select_album_handler))
        .route("/api/settings/folder/add", post(add_album_handler))
        .route("/api/settings/folder/set_path", post(set_path_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let state = AppState::from_config(&config)?;

    let scheduler = maybe_build_scheduler(
        &config,
        state.services.clone(),
        state.controller.clone(),
        state.settings.clone(),
    )
    .await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!(cron = %config.sync_cron, "scheduled latest-only sweeps enabled");
    }

    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "dashboard listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let mirror = state.mirror();
    match mirror.existing_sessions().await {
        Ok(existing) => render_html(IndexTemplate {
            listing_url: state.services.listing_url().to_string(),
            download_dir: mirror.root().display().to_string(),
            existing_sessions_count: existing.len(),
        }),
        Err(err) => server_error(err),
    }
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    let download_dir = state.settings.download_dir();
    let sweep = state.services.sweep(&download_dir);

    let (latest_session, latest_agenda, discovery_error) = match sweep.discover_latest().await {
        Ok((session, agenda)) => (Some(session), Some(agenda), None),
        Err(err) => (None, None, Some(format!("{err:#}"))),
    };
    let existing_sessions = match sweep.mirror().existing_sessions().await {
        Ok(existing) => existing,
        Err(err) => return server_error(err),
    };

    Json(StatusResponse {
        latest_sesja: latest_session.as_ref().map(|s| s.number),
        latest_porzadek: latest_agenda.as_ref().map(|a| a.number),
        sesja_url: latest_session.map(|s| s.url),
        porzadek_url: latest_agenda.map(|a| a.url),
        discovery_error,
        download_status: state.controller.snapshot(),
        base_url: state.services.listing_url().to_string(),
        current_download_dir: download_dir.display().to_string(),
        existing_sessions_count: existing_sessions.len(),
        existing_sessions,
        available_albums: state.settings.current().available_albums,
    })
    .into_response()
}

async fn download_latest_handler(State(state): State<Arc<AppState>>) -> Response {
    start_sweep(&state, SweepMode::Latest, "Download started")
}

async fn download_existing_handler(State(state): State<Arc<AppState>>) -> Response {
    start_sweep(&state, SweepMode::UpdateExisting, "Update existing sessions started")
}

async fn download_from_first_handler(State(state): State<Arc<AppState>>) -> Response {
    start_sweep(&state, SweepMode::Backfill, "Download all sessions from first started")
}

async fn download_session_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(number): AxumPath<u32>,
) -> Response {
    start_sweep(&state, SweepMode::Session(number), &format!("Download session {number} started"))
}

/// Claims the sweep slot and runs the sweep on a background task.
fn start_sweep(state: &AppState, mode: SweepMode, message: &str) -> Response {
    let guard = match state.controller.try_begin(mode) {
        Ok(guard) => guard,
        Err(err) => return json_error(StatusCode::BAD_REQUEST, err.to_string()),
    };
    let sweep = state.services.sweep(state.settings.download_dir());
    tokio::spawn(async move {
        if let Err(err) = run_guarded(&sweep, guard).await {
            warn!(%mode, error = %format!("{err:#}"), "sweep failed");
        }
    });
    Json(json!({ "message": message })).into_response()
}

async fn cancel_handler(State(state): State<Arc<AppState>>) -> Response {
    let cancelled = state.controller.cancel();
    Json(json!({ "cancelled": cancelled })).into_response()
}

async fn files_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.mirror().list_files().await {
        Ok(files) => Json(files).into_response(),
        Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")),
    }
}

async fn logs_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.log.recent(RECENT_LOG_ENTRIES).await {
        Ok(entries) => Json(entries).into_response(),
        Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")),
    }
}

async fn file_download_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(path): AxumPath<String>,
) -> Response {
    let Some(full) = state.mirror().resolve_relative(&path) else {
        return json_error(StatusCode::NOT_FOUND, format!("not found: {path}"));
    };
    match tokio::fs::read(&full).await {
        Ok(bytes) => {
            let filename = file_name_of(&full);
            (
                [
                    (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                    (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{filename}\"")),
                ],
                bytes,
            )
                .into_response()
        }
        Err(_) => json_error(StatusCode::NOT_FOUND, format!("not found: {path}")),
    }
}

async fn folder_settings_handler(State(state): State<Arc<AppState>>) -> Response {
    let current = state.settings.current();
    Json(json!({
        "current_download_dir": current.download_base_dir.display().to_string(),
        "available_albums": current.available_albums,
    }))
    .into_response()
}

async fn select_album_handler(State(state): State<Arc<AppState>>, Json(req): Json<AlbumRequest>) -> Response {
    let album = req.album_name.unwrap_or_else(|| "SesjeRady".to_string());
    match state.settings.select_album(&album).await {
        Ok(dir) => {
            state
                .record("Folder changed", &format!("New folder: {}", album.trim()))
                .await;
            folder_changed(dir)
        }
        Err(err) => settings_error(err),
    }
}

async fn add_album_handler(State(state): State<Arc<AppState>>, Json(req): Json<AlbumRequest>) -> Response {
    let album = req.album_name.unwrap_or_default();
    match state.settings.add_album(&album).await {
        Ok(albums) => Json(json!({
            "message": format!("Album '{}' added", album.trim()),
            "available_albums": albums,
        }))
        .into_response(),
        Err(err) => settings_error(err),
    }
}

async fn set_path_handler(State(state): State<Arc<AppState>>, Json(req): Json<PathRequest>) -> Response {
    match state.settings.set_path(&req.path).await {
        Ok(dir) => {
            state.record("Folder changed (path)", &dir.display().to_string()).await;
            folder_changed(dir)
        }
        Err(err) => settings_error(err),
    }
}

fn folder_changed(dir: PathBuf) -> Response {
    Json(json!({
        "message": "Folder changed",
        "new_download_dir": dir.display().to_string(),
    }))
    .into_response()
}

fn settings_error(err: SettingsError) -> Response {
    let status = if err.is_invalid_input() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    json_error(status, format!("{err:#}"))
}

fn file_name_of(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().replace('"', ""))
        .unwrap_or_default()
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {err:#}")),
    )
        .into_response()
}

fn json_error(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use rada_adapters::{DocumentPreviewer, PortalParser};
    use rada_storage::{FetchError, FetchedResponse, Fetcher};
    use rada_sync::NoopClassifier;
    use tempfile::TempDir;
    use tower::ServiceExt;

    /// Portal stand-in that is never reachable.
    struct OfflineFetcher;

    #[async_trait]
    impl Fetcher for OfflineFetcher {
        async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
            Err(FetchError::HttpStatus {
                status: 503,
                url: url.to_string(),
            })
        }
    }

    fn state(root: &TempDir) -> AppState {
        let mirror = root.path().join("SesjeRady");
        std::fs::create_dir_all(mirror.join("Sesja3/Porzadek1")).unwrap();
        std::fs::write(mirror.join("Sesja3/Porzadek1/DRUK_NR1_budżet.pdf"), b"%PDF").unwrap();
        std::fs::write(root.path().join("secret.txt"), b"nope").unwrap();

        let services = SyncServices::new(
            Arc::new(OfflineFetcher),
            PortalParser::default(),
            Arc::new(DocumentPreviewer::default()),
            Arc::new(NoopClassifier),
            "https://bip.pila.pl/2025.html",
        );
        AppState::new(
            services,
            SettingsStore::load_or_default(&root.path().join("app_settings.json"), &mirror),
            ActionLog::new(root.path().join("download_log.json")),
        )
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn handler_smoke_get_index() {
        let root = tempfile::tempdir().unwrap();
        let resp = app(state(&root)).oneshot(get("/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("Rada Miasta Session Mirror"));
        assert!(text.contains("https://bip.pila.pl/2025.html"));
    }

    #[tokio::test]
    async fn status_reports_local_state_when_portal_is_unreachable() {
        let root = tempfile::tempdir().unwrap();
        let resp = app(state(&root)).oneshot(get("/api/status")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_json(resp).await;
        assert!(body["latest_sesja"].is_null());
        assert!(body["discovery_error"].is_string());
        assert_eq!(body["existing_sessions"], json!([3]));
        assert_eq!(body["existing_sessions_count"], 1);
        assert_eq!(body["download_status"]["phase"], "idle");
        assert_eq!(body["available_albums"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn download_is_rejected_while_a_sweep_runs() {
        let root = tempfile::tempdir().unwrap();
        let state = state(&root);
        let _guard = state.controller.try_begin(SweepMode::Backfill).unwrap();

        let resp = app(state)
            .oneshot(post_json("/api/download/latest", json!({})))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await, json!({ "error": "Download already in progress" }));
    }

    #[tokio::test]
    async fn cancel_reports_whether_a_sweep_was_running() {
        let root = tempfile::tempdir().unwrap();
        let state = state(&root);
        let router = app(state.clone());

        let idle = router.clone().oneshot(post_json("/api/download/cancel", json!({}))).await.unwrap();
        assert_eq!(body_json(idle).await, json!({ "cancelled": false }));

        let guard = state.controller.try_begin(SweepMode::Backfill).unwrap();
        let running = router.oneshot(post_json("/api/download/cancel", json!({}))).await.unwrap();
        assert_eq!(body_json(running).await, json!({ "cancelled": true }));
        assert!(guard.token().is_cancelled());
    }

    #[tokio::test]
    async fn files_are_listed_and_served() {
        let root = tempfile::tempdir().unwrap();
        let router = app(state(&root));

        let listing = body_json(router.clone().oneshot(get("/api/files")).await.unwrap()).await;
        assert_eq!(listing[0]["path"], "Sesja3/Porzadek1/DRUK_NR1_budżet.pdf");
        assert_eq!(listing[0]["sesja"], "Sesja3");

        let resp = router
            .oneshot(get("/download/Sesja3/Porzadek1/DRUK_NR1_bud%C5%BCet.pdf"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .starts_with("attachment"));
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"%PDF");
    }

    #[tokio::test]
    async fn download_outside_the_mirror_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let router = app(state(&root));

        let escaped = router.clone().oneshot(get("/download/..%2Fsecret.txt")).await.unwrap();
        assert_eq!(escaped.status(), StatusCode::NOT_FOUND);

        let missing = router.oneshot(get("/download/Sesja3/brak.pdf")).await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn albums_can_be_added_and_selected() {
        let root = tempfile::tempdir().unwrap();
        let state = state(&root);
        let router = app(state.clone());

        let empty = router
            .clone()
            .oneshot(post_json("/api/settings/folder/add", json!({ "album_name": " " })))
            .await
            .unwrap();
        assert_eq!(empty.status(), StatusCode::BAD_REQUEST);

        let added = router
            .clone()
            .oneshot(post_json("/api/settings/folder/add", json!({ "album_name": "Kadencja" })))
            .await
            .unwrap();
        assert_eq!(body_json(added).await["available_albums"][4], "Kadencja");

        let selected = router
            .clone()
            .oneshot(post_json("/api/settings/folder", json!({ "album_name": "Kadencja" })))
            .await
            .unwrap();
        assert_eq!(selected.status(), StatusCode::OK);
        assert_eq!(state.settings.download_dir(), root.path().join("Kadencja"));

        let logs = body_json(router.oneshot(get("/api/logs")).await.unwrap()).await;
        assert_eq!(logs[0]["action"], "Folder changed");
    }
}
