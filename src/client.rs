//! Client for the upload server, used by `press submit` and the tests.
//!
//! The client mirrors what the submission form does in a browser:
//!
//! 1. [`prevalidate`] checks names, extensions and sizes locally, before
//!    anything touches the network.
//! 2. [`UploadClient::silent_upload`] sends the note alone for
//!    pre-validation and gets back an id.
//! 3. [`UploadClient::submit`] sends the cover (and the note, or its id)
//!    and follows the NDJSON progress stream through a [`StepTracker`].

use futures::StreamExt;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::deploy::DiagnosticReport;
use crate::error::{FieldError, UploadError};
use crate::progress::{NdjsonDecoder, ProgressEvent};
use crate::server::SilentUploadResponse;
use crate::tracker::StepTracker;
use crate::validate::{self, ImageFormat, Limits};

/// Local checks on the files a contributor picked. No network access.
pub fn prevalidate(note_path: &Path, cover_path: &Path, limits: Limits) -> Result<(), UploadError> {
    let mut errors = Vec::new();

    let note_name = file_name(note_path)?;
    errors.extend(validate::validate_note_name(&note_name));
    match std::fs::metadata(note_path) {
        Ok(meta) => errors.extend(validate::validate_size(
            meta.len() as usize,
            limits.max_note_bytes,
            "fileSize",
        )),
        Err(e) => errors.push(FieldError::new("file", format!("{}: {}", note_path.display(), e))),
    }

    let cover_name = file_name(cover_path)?;
    let cover_ext = validate::extension(&cover_name);
    if cover_ext.as_deref().and_then(ImageFormat::from_extension).is_none() {
        errors.push(FieldError::new(
            "cover",
            "unsupported image format; use JPG, PNG, GIF or WebP",
        ));
    }
    match std::fs::metadata(cover_path) {
        Ok(meta) => errors.extend(validate::validate_size(
            meta.len() as usize,
            limits.max_cover_bytes,
            "cover",
        )),
        Err(e) => errors.push(FieldError::new("cover", format!("{}: {}", cover_path.display(), e))),
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(UploadError::Validation(errors))
    }
}

fn file_name(path: &Path) -> Result<String, UploadError> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| UploadError::field("file", format!("not a file: {}", path.display())))
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub note_path: PathBuf,
    pub cover_path: PathBuf,
    pub contributor: Option<String>,
    pub draft: bool,
    /// Id returned by a silent upload. When set the note is not resent.
    pub note_id: Option<String>,
}

/// What the progress stream amounted to.
#[derive(Debug, Clone, Serialize)]
pub struct StreamOutcome {
    pub success: bool,
    pub url: Option<String>,
    pub events: Vec<ProgressEvent>,
}

pub struct UploadClient {
    base_url: String,
    client: reqwest::Client,
    limits: Limits,
    api_key: Option<String>,
}

impl UploadClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("summary-press/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            limits: Limits {
                max_note_bytes: 5 * 1024 * 1024,
                max_cover_bytes: 2 * 1024 * 1024,
            },
            api_key: None,
        })
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    /// Send the note for pre-validation. Both accepted and rejected notes
    /// yield a [`SilentUploadResponse`]; only transport problems are `Err`.
    pub async fn silent_upload(&self, note_path: &Path) -> Result<SilentUploadResponse, UploadError> {
        let name = file_name(note_path)?;
        if !validate::is_note_extension(&name) {
            return Err(UploadError::field(
                "fileName",
                "the file extension must be .md or .mdx",
            ));
        }
        let content = tokio::fs::read(note_path).await?;
        let form = reqwest::multipart::Form::new().part(
            "file",
            reqwest::multipart::Part::bytes(content).file_name(name),
        );

        let resp = self
            .client
            .post(self.url("/api/upload-temp"))
            .multipart(form)
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() || status == reqwest::StatusCode::BAD_REQUEST {
            let text = resp.text().await?;
            if let Ok(parsed) = serde_json::from_str::<SilentUploadResponse>(&text) {
                return Ok(parsed);
            }
            return Err(error_from_body(status, &text));
        }
        let text = resp.text().await.unwrap_or_default();
        Err(error_from_body(status, &text))
    }

    /// Submit a note and its cover and follow the progress stream.
    ///
    /// `on_event` sees every event as it arrives. The outcome is successful
    /// only if a `complete` event arrived and no `error` event did.
    pub async fn submit<F>(&self, request: &SubmitRequest, on_event: F) -> Result<StreamOutcome, UploadError>
    where
        F: FnMut(&ProgressEvent),
    {
        prevalidate(&request.note_path, &request.cover_path, self.limits)?;

        let cover_name = file_name(&request.cover_path)?;
        let cover = tokio::fs::read(&request.cover_path).await?;
        let mut form = reqwest::multipart::Form::new().part(
            "cover-image",
            reqwest::multipart::Part::bytes(cover).file_name(cover_name),
        );
        match &request.note_id {
            Some(id) => form = form.text("note-id", id.clone()),
            None => {
                let note_name = file_name(&request.note_path)?;
                let note = tokio::fs::read(&request.note_path).await?;
                form = form.part(
                    "new-note",
                    reqwest::multipart::Part::bytes(note).file_name(note_name),
                );
            }
        }
        if let Some(c) = &request.contributor {
            form = form.text("contributor", c.clone());
        }
        form = form.text("is_draft", request.draft.to_string());

        let resp = self
            .client
            .post(self.url("/api/create-note"))
            .multipart(form)
            .send()
            .await?;
        follow_stream(resp, on_event).await
    }

    /// Trigger a rebuild through the authenticated endpoint.
    pub async fn trigger_build<F>(&self, title: Option<&str>, on_event: F) -> Result<StreamOutcome, UploadError>
    where
        F: FnMut(&ProgressEvent),
    {
        let mut req = self.client.post(self.url("/api/build/trigger"));
        if let Some(t) = title {
            req = req.query(&[("title", t)]);
        }
        let resp = self.authed(req).send().await?;
        follow_stream(resp, on_event).await
    }

    /// Deploy diagnostics from the authenticated endpoint.
    pub async fn build_check(&self) -> Result<DiagnosticReport, UploadError> {
        let resp = self
            .authed(self.client.get(self.url("/api/build/check")))
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(error_from_body(status, &text));
        }
        serde_json::from_str(&text)
            .map_err(|e| UploadError::transport(format!("invalid diagnostics response: {}", e)))
    }
}

async fn follow_stream<F>(resp: reqwest::Response, mut on_event: F) -> Result<StreamOutcome, UploadError>
where
    F: FnMut(&ProgressEvent),
{
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(error_from_body(status, &text));
    }

    let mut tracker = StepTracker::new();
    let mut decoder = NdjsonDecoder::new();
    let mut events = Vec::new();
    let mut body = resp.bytes_stream();

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        for event in decoder.push(&chunk) {
            tracker.apply(&event);
            on_event(&event);
            events.push(event);
        }
    }
    if let Some(event) = decoder.finish() {
        tracker.apply(&event);
        on_event(&event);
        events.push(event);
    }

    Ok(StreamOutcome {
        success: tracker.succeeded(),
        url: tracker.final_url().map(str::to_string),
        events,
    })
}

/// Map a `{ "error": { code, message } }` body back onto the taxonomy.
fn error_from_body(status: reqwest::StatusCode, text: &str) -> UploadError {
    let json: serde_json::Value = serde_json::from_str(text).unwrap_or_default();
    let error = json.get("error");
    let code = error
        .and_then(|e| e.get("code"))
        .and_then(|c| c.as_str())
        .unwrap_or_default();
    let message = error
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("server answered {}: {}", status, text));

    match code {
        "configuration" => UploadError::Configuration(message),
        "bad_request" => {
            let fields: Vec<FieldError> = error
                .and_then(|e| e.get("fields"))
                .and_then(|f| f.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|f| {
                            Some(FieldError::new(
                                f.get("field")?.as_str()?,
                                f.get("message")?.as_str()?,
                            ))
                        })
                        .collect()
                })
                .unwrap_or_default();
            if fields.is_empty() {
                UploadError::field("request", message)
            } else {
                UploadError::Validation(fields)
            }
        }
        "unauthorized" => UploadError::Configuration(format!("unauthorized: {}", message)),
        _ => UploadError::Transport(message),
    }
}
