//! HTTP server for the submission form and the admin API.
//!
//! # Endpoints
//!
//! | Method | Path | Auth | Description |
//! |--------|------|------|-------------|
//! | `GET`  | `/health` | no | Health check (returns version) |
//! | `POST` | `/api/upload-temp` | no | Silent upload: store and pre-validate a note |
//! | `GET`  | `/api/upload-temp?id=` | no | Read back a silent upload |
//! | `POST` | `/api/create-note` | no | Submit note + cover, NDJSON progress stream |
//! | `POST` | `/api/upload` | yes | Publish one file to the configured targets |
//! | `GET`  | `/api/storage/health` | yes | Check every storage target |
//! | `GET`  | `/api/build/check` | yes | Deploy configuration diagnostics |
//! | `POST` | `/api/build/trigger` | yes | Trigger a build, NDJSON progress stream |
//!
//! Authenticated endpoints take `Authorization: Bearer <key>` (see
//! [`crate::auth`]).
//!
//! # Error Contract
//!
//! Error responses outside a progress stream share one shape:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "tags: at least one tag is required" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `not_found` (404),
//! `configuration` (500), `internal` (500), `transport` (502). Validation
//! failures also carry `fields`, a list of `{ field, message }`.
//!
//! Once a progress stream has started, failures are reported as `error`
//! events in the stream and the HTTP status stays 200.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so the form can be
//! served from the static site's own origin.

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use tower_http::cors::{Any, CorsLayer};

use crate::auth;
use crate::config::{Config, Secrets};
use crate::deploy::{self, BuildHook};
use crate::error::{FieldError, UploadError};
use crate::frontmatter;
use crate::images::extract_image_urls;
use crate::pipeline::{
    self, DirectUpload, PipelineContext, Submission, Targets, UploadedFile,
};
use crate::progress::{self, ProgressEvent, ProgressReporter, Step};
use crate::storage::build_publishers;
use crate::validate::{self, SchemaMode};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    ctx: PipelineContext,
}

/// Starts the HTTP server on `[server].bind`.
///
/// Runs until the process is terminated. Returns an error if the
/// configuration is unusable or binding fails.
pub async fn run_server(config: Config, secrets: Secrets) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    if secrets.api_keys.is_empty() {
        tracing::warn!("API_KEYS is not set; authenticated endpoints will refuse every request");
    }
    let targets: Vec<&str> = config.storage.targets.iter().map(|t| t.as_str()).collect();
    tracing::info!(targets = ?targets, environment = config.site.environment.as_str(), "starting server");

    let ctx = PipelineContext::new(config, secrets)?;
    let app = router(ctx);

    println!("Upload server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the router. Exposed so tests can serve it on an ephemeral port.
pub fn router(ctx: PipelineContext) -> Router {
    let max_body = ctx.config.server.max_body_bytes;
    let state = AppState { ctx };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let protected = Router::new()
        .route("/api/upload", post(handle_direct_upload))
        .route("/api/storage/health", get(handle_storage_health))
        .route("/api/build/check", get(handle_build_check))
        .route("/api/build/trigger", post(handle_build_trigger))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/health", get(handle_health))
        .route(
            "/api/upload-temp",
            post(handle_upload_temp).get(handle_get_upload_temp),
        )
        .route("/api/create-note", post(handle_create_note))
        .merge(protected)
        .layer(DefaultBodyLimit::max(max_body))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<FieldError>,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
    fields: Vec<FieldError>,
}

impl AppError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
            fields: Vec::new(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
                fields: self.fields,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Validation(fields) => {
                let message = fields
                    .iter()
                    .map(|f| f.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                AppError {
                    status: StatusCode::BAD_REQUEST,
                    code: "bad_request".to_string(),
                    message,
                    fields,
                }
            }
            UploadError::Transport(msg) => AppError::new(StatusCode::BAD_GATEWAY, "transport", msg),
            UploadError::Configuration(msg) => {
                tracing::error!(error = %msg, "configuration error");
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "configuration", msg)
            }
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::NOT_FOUND, "not_found", message)
}

fn internal(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

async fn require_api_key(State(state): State<AppState>, req: Request, next: Next) -> Response {
    match auth::authorize(req.headers(), &state.ctx.secrets.api_keys) {
        Ok(()) => next.run(req).await,
        Err(e) => {
            tracing::warn!(path = %req.uri().path(), reason = %e, "unauthorized request");
            AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", e.to_string()).into_response()
        }
    }
}

// ============ Multipart ============

/// A multipart form split into file parts and text parts.
#[derive(Default)]
struct Form {
    files: HashMap<String, UploadedFile>,
    texts: HashMap<String, String>,
}

impl Form {
    async fn read(mut multipart: Multipart) -> Result<Self, AppError> {
        let mut form = Form::default();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| bad_request(format!("invalid multipart body: {}", e)))?
        {
            let name = field.name().unwrap_or_default().to_string();
            match field.file_name().map(str::to_string) {
                Some(file_name) => {
                    let content = field
                        .bytes()
                        .await
                        .map_err(|e| bad_request(format!("failed to read {}: {}", name, e)))?;
                    // Browsers send an empty part when no file was picked.
                    if file_name.is_empty() && content.is_empty() {
                        continue;
                    }
                    form.files.insert(
                        name,
                        UploadedFile {
                            file_name,
                            content: content.to_vec(),
                        },
                    );
                }
                None => {
                    let value = field
                        .text()
                        .await
                        .map_err(|e| bad_request(format!("failed to read {}: {}", name, e)))?;
                    form.texts.insert(name, value);
                }
            }
        }
        Ok(form)
    }

    fn text(&self, name: &str) -> Option<String> {
        self.texts
            .get(name)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn flag(&self, name: &str) -> bool {
        matches!(
            self.text(name).as_deref().map(str::to_ascii_lowercase).as_deref(),
            Some("true" | "1" | "on" | "yes")
        )
    }
}

fn ndjson_response<S>(stream: S) -> Response
where
    S: Stream<Item = Result<String, Infallible>> + Send + 'static,
{
    (
        [
            (header::CONTENT_TYPE, "application/x-ndjson"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /api/upload-temp ============

/// Result of a silent upload, consumed by the submission form.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct SilentUploadResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub frontmatter: serde_json::Value,
    /// Every problem as display lines, grouped under a header line.
    pub errors: Vec<String>,
    pub frontmatter_errors: Vec<FieldError>,
    pub image_errors: Vec<String>,
}

impl SilentUploadResponse {
    fn rejected(id: Option<String>, errors: Vec<String>) -> Self {
        Self {
            success: false,
            id,
            frontmatter: serde_json::Value::Null,
            errors,
            ..Self::default()
        }
    }
}

fn silent_reply(status: StatusCode, body: SilentUploadResponse) -> Response {
    (status, Json(body)).into_response()
}

/// Silent upload: the note is stored even when it has problems, so the form
/// can show them and later submit by id.
async fn handle_upload_temp(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, AppError> {
    let mut form = Form::read(multipart).await?;
    let file = form
        .files
        .remove("file")
        .ok_or_else(|| bad_request("no file provided (multipart field 'file')"))?;
    let ctx = &state.ctx;

    let mut problems = validate::validate_note_name(&file.file_name);
    problems.extend(validate::validate_size(
        file.content.len(),
        ctx.config.upload.max_note_bytes,
        "fileSize",
    ));
    if !problems.is_empty() {
        let errors = problems.iter().map(|e| e.message.clone()).collect();
        return Ok(silent_reply(
            StatusCode::BAD_REQUEST,
            SilentUploadResponse::rejected(None, errors),
        ));
    }

    let id = ctx
        .temp
        .save(&file.file_name, &file.content)
        .await
        .map_err(|e| internal(format!("failed to store the upload: {}", e)))?
        .to_string();
    tracing::info!(%id, file = %file.file_name, "silent upload stored");

    let parsed = std::str::from_utf8(&file.content)
        .map_err(|_| "the note must be UTF-8 text".to_string())
        .and_then(|text| frontmatter::parse(text).map_err(|e| e.to_string()));
    let (fm, body) = match parsed {
        Ok(parsed) => parsed,
        Err(message) => {
            return Ok(silent_reply(
                StatusCode::BAD_REQUEST,
                SilentUploadResponse::rejected(Some(id), vec![message]),
            ));
        }
    };

    let frontmatter_errors = validate::validate_summary(&fm, SchemaMode::Preview);
    let mut image_errors = validate::check_alt_text(&body);
    image_errors.extend(ctx.images.check(&extract_image_urls(&body)).await);

    let mut errors = Vec::new();
    if !frontmatter_errors.is_empty() {
        errors.push("Frontmatter problems:".to_string());
        errors.extend(frontmatter_errors.iter().map(|e| format!("- {}", e)));
    }
    if !image_errors.is_empty() {
        errors.push("Image problems:".to_string());
        errors.extend(image_errors.iter().map(|e| format!("- {}", e)));
    }

    let success = errors.is_empty();
    let status = if success {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    Ok(silent_reply(
        status,
        SilentUploadResponse {
            success,
            id: Some(id),
            frontmatter: frontmatter::mapping_to_json(&fm),
            errors,
            frontmatter_errors,
            image_errors,
        },
    ))
}

// ============ GET /api/upload-temp ============

#[derive(Deserialize)]
struct TempQuery {
    id: Option<String>,
}

async fn handle_get_upload_temp(
    State(state): State<AppState>,
    Query(query): Query<TempQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let id = query
        .id
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| bad_request("missing id parameter"))?;
    let note = state
        .ctx
        .temp
        .load(&id)
        .await
        .map_err(|e| bad_request(e.to_string()))?
        .ok_or_else(|| not_found(format!("no upload with id {}", id)))?;

    let frontmatter = std::str::from_utf8(&note.content)
        .ok()
        .and_then(|text| frontmatter::parse(text).ok())
        .map(|(fm, _)| frontmatter::mapping_to_json(&fm))
        .unwrap_or(serde_json::Value::Null);

    Ok(Json(serde_json::json!({
        "success": true,
        "id": note.id.to_string(),
        "fileName": note.file_name,
        "frontmatter": frontmatter,
    })))
}

// ============ POST /api/create-note ============

/// Final submission. Targets are resolved before the stream starts so a
/// configuration failure is a plain 500; everything after is streamed.
async fn handle_create_note(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, AppError> {
    let mut form = Form::read(multipart).await?;
    let submission = Submission {
        note: form.files.remove("new-note"),
        note_id: form.text("note-id"),
        cover: form.files.remove("cover-image"),
        contributor: form.text("contributor"),
        draft: form.flag("is_draft"),
    };

    let ctx = state.ctx.clone();
    let targets = Targets::from_config(&ctx.config, &ctx.secrets)?;

    let (reporter, stream) = progress::channel();
    tokio::spawn(async move {
        let _ = pipeline::run_submission(&ctx, &targets, submission, &reporter).await;
    });

    Ok(ndjson_response(stream))
}

// ============ POST /api/upload ============

async fn handle_direct_upload(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<pipeline::DirectUploadResult>, AppError> {
    let mut form = Form::read(multipart).await?;
    let file = form
        .files
        .remove("file")
        .ok_or_else(|| bad_request("no file provided (multipart field 'file')"))?;
    let upload = DirectUpload {
        file,
        directory: form.text("directory"),
        trigger_build: form.flag("triggerBuild"),
    };

    let ctx = &state.ctx;
    let targets = Targets::from_config(&ctx.config, &ctx.secrets)?;
    let result =
        pipeline::upload_direct(ctx, &targets, upload, &progress::NoProgress).await?;
    tracing::info!(path = %result.path, build = result.build_triggered, "direct upload");
    Ok(Json(result))
}

// ============ GET /api/storage/health ============

#[derive(Serialize)]
struct TargetHealth {
    target: String,
    description: String,
    ok: bool,
    message: String,
}

#[derive(Serialize)]
struct StorageHealthResponse {
    ok: bool,
    targets: Vec<TargetHealth>,
}

async fn handle_storage_health(
    State(state): State<AppState>,
) -> Result<Json<StorageHealthResponse>, AppError> {
    let ctx = &state.ctx;
    let publishers = build_publishers(&ctx.config, &ctx.secrets)?;

    let mut targets = Vec::new();
    for publisher in publishers {
        let (ok, message) = match publisher.health_check().await {
            Ok(msg) => (true, msg),
            Err(e) => (false, e.to_string()),
        };
        targets.push(TargetHealth {
            target: publisher.name().to_string(),
            description: publisher.description(),
            ok,
            message,
        });
    }
    let ok = targets.iter().all(|t| t.ok);
    Ok(Json(StorageHealthResponse { ok, targets }))
}

// ============ GET /api/build/check ============

async fn handle_build_check(State(state): State<AppState>) -> Json<deploy::DiagnosticReport> {
    Json(deploy::diagnose(&state.ctx.config, &state.ctx.secrets).await)
}

// ============ POST /api/build/trigger ============

#[derive(Deserialize)]
struct TriggerQuery {
    title: Option<String>,
}

async fn handle_build_trigger(
    State(state): State<AppState>,
    Query(query): Query<TriggerQuery>,
) -> Result<Response, AppError> {
    let ctx = state.ctx.clone();
    let Some(hook) = BuildHook::from_secrets(&ctx.config, &ctx.secrets)? else {
        return Err(UploadError::configuration("NETLIFY_BUILD_HOOK is not set").into());
    };
    let targets = Targets {
        publishers: Vec::new(),
        hook: Some(hook),
        tracker: deploy::DeployTracker::from_secrets(&ctx.config, &ctx.secrets)?,
    };
    let title = query
        .title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| "Manual rebuild".to_string());

    let (reporter, stream) = progress::channel();
    tokio::spawn(async move {
        match pipeline::run_build(&targets, &title, &reporter).await {
            Ok(deploy) => {
                let mut done = ProgressEvent::success(Step::Complete, "Build finished");
                if let Some(url) = deploy.as_ref().and_then(|d| d.public_url()) {
                    done = done.with_url(url.to_string());
                }
                reporter.report(done);
            }
            Err(e) => tracing::warn!(error = %e, "manual build failed"),
        }
    });

    Ok(ndjson_response(stream))
}
