//! Submission workflow.
//!
//! [`run_submission`] drives a note and its cover through every step and
//! reports each one on a [`ProgressReporter`]:
//!
//! ```text
//! validation ──► upload (each target in order) ──► build ──► complete
//!      │                 │                           │
//!      └──── error ──────┴───────── error ───────────┘
//! ```
//!
//! 1. **validation**: note name, size, frontmatter, contributor, schema,
//!    cover format and size, alt text and embedded image URLs.
//! 2. The frontmatter `image` is pointed at the published cover.
//! 3. **upload**: every configured publisher, in order. The first failure
//!    stops the workflow.
//! 4. **build**: build hook trigger, then deploy tracking when configured.
//!    Without a build hook the step is skipped with a warning.
//! 5. **complete**: success event carrying the public URL.
//!
//! Targets are resolved up front with [`Targets::from_config`] so that a
//! missing secret surfaces before any progress is streamed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use std::sync::Arc;
use tracing::Instrument;

use crate::config::{Config, Secrets};
use crate::deploy::{BuildHook, DeployInfo, DeployTracker};
use crate::error::{FieldError, UploadError};
use crate::frontmatter;
use crate::images::{extract_image_urls, ImageChecker};
use crate::progress::{ProgressEvent, ProgressReporter, Step};
use crate::storage::{
    build_publishers, check_path, Layout, PublishBundle, PublishFile, PublishMeta,
    PublishReceipt, Publisher,
};
use crate::temp_store::TempStore;
use crate::validate::{self, ImageFormat, Limits, PreparedNote};

/// Shared, long-lived state the workflow needs.
#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<Config>,
    pub secrets: Arc<Secrets>,
    pub images: ImageChecker,
    pub temp: TempStore,
}

impl PipelineContext {
    pub fn new(config: Config, secrets: Secrets) -> anyhow::Result<Self> {
        let images = ImageChecker::new(&config, &secrets)?;
        let temp = TempStore::new(
            config.upload.temp_dir.clone(),
            std::time::Duration::from_secs(config.upload.temp_ttl_secs),
        );
        Ok(Self {
            config: Arc::new(config),
            secrets: Arc::new(secrets),
            images,
            temp,
        })
    }

    pub fn limits(&self) -> Limits {
        Limits::from(&self.config.upload)
    }

    pub fn layout(&self) -> Layout {
        Layout::from(&self.config.storage)
    }
}

/// Publishers, build hook and deploy tracker for one request.
pub struct Targets {
    pub publishers: Vec<Arc<dyn Publisher>>,
    pub hook: Option<BuildHook>,
    pub tracker: Option<DeployTracker>,
}

impl Targets {
    /// Resolve every target. Missing secrets are configuration errors.
    pub fn from_config(config: &Config, secrets: &Secrets) -> Result<Self, UploadError> {
        Ok(Self {
            publishers: build_publishers(config, secrets)?,
            hook: BuildHook::from_secrets(config, secrets)?,
            tracker: DeployTracker::from_secrets(config, secrets)?,
        })
    }
}

/// A file received from a form.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_name: String,
    pub content: Vec<u8>,
}

/// What the contributor sent. The note comes either inline or as the id of
/// an earlier silent upload.
#[derive(Debug, Clone, Default)]
pub struct Submission {
    pub note: Option<UploadedFile>,
    pub note_id: Option<String>,
    pub cover: Option<UploadedFile>,
    pub contributor: Option<String>,
    pub draft: bool,
}

impl Submission {
    fn label(&self) -> String {
        match (&self.note, &self.note_id) {
            (Some(note), _) => note.file_name.clone(),
            (None, Some(id)) => format!("temp:{}", id),
            (None, None) => "<none>".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionOutcome {
    pub url: Option<String>,
    pub paths: Vec<String>,
    #[serde(skip)]
    pub receipts: Vec<PublishReceipt>,
    pub deploy: Option<DeployInfo>,
}

/// Report a validation failure: one summary event, then one per field.
fn report_field_errors(reporter: &dyn ProgressReporter, headline: &str, errors: &[FieldError]) {
    reporter.report(ProgressEvent::error(Step::Validation, headline));
    for e in errors {
        reporter.report(ProgressEvent::error(Step::Validation, e.to_string()));
    }
}

fn fail_validation(reporter: &dyn ProgressReporter, headline: &str, err: UploadError) -> UploadError {
    match &err {
        UploadError::Validation(errors) => report_field_errors(reporter, headline, errors),
        other => reporter.report(ProgressEvent::error(Step::Validation, other.to_string())),
    }
    err
}

/// Run the whole workflow. Every failure has already been reported on
/// `reporter` when this returns `Err`.
pub async fn run_submission(
    ctx: &PipelineContext,
    targets: &Targets,
    submission: Submission,
    reporter: &dyn ProgressReporter,
) -> Result<SubmissionOutcome, UploadError> {
    let span = tracing::info_span!("submission", note = %submission.label(), draft = submission.draft);
    async move {
        let result = submit(ctx, targets, submission, reporter).await;
        match &result {
            Ok(outcome) => tracing::info!(url = ?outcome.url, "submission published"),
            Err(e) => tracing::warn!(error = %e, code = e.code(), "submission failed"),
        }
        result
    }
    .instrument(span)
    .await
}

async fn submit(
    ctx: &PipelineContext,
    targets: &Targets,
    submission: Submission,
    reporter: &dyn ProgressReporter,
) -> Result<SubmissionOutcome, UploadError> {
    // ── validation ──
    reporter.report(ProgressEvent::info(Step::Validation, "Validating files..."));

    let (note_file, temp_id) = resolve_note(ctx, &submission)
        .await
        .map_err(|e| fail_validation(reporter, "The note could not be read", e))?;

    let Some(cover_file) = submission.cover.as_ref() else {
        return Err(fail_validation(
            reporter,
            "A cover image is required",
            UploadError::field("cover", "please select a cover image"),
        ));
    };

    let limits = ctx.limits();
    let prepared = validate::prepare_note(
        &note_file.file_name,
        &note_file.content,
        submission.contributor.as_deref(),
        limits,
        Utc::now(),
    )
    .map_err(|e| fail_validation(reporter, "Validation failed", e))?;

    let cover_format = validate::validate_cover(
        &cover_file.file_name,
        &cover_file.content,
        limits.max_cover_bytes,
    )
    .map_err(|errors| {
        fail_validation(reporter, "The cover image is invalid", UploadError::Validation(errors))
    })?;

    let mut image_errors: Vec<FieldError> = validate::check_alt_text(&prepared.body)
        .into_iter()
        .map(|m| FieldError::new("images", m))
        .collect();
    let urls = extract_image_urls(&prepared.body);
    if !urls.is_empty() {
        reporter.report(ProgressEvent::info(
            Step::Validation,
            format!("Checking {} embedded image(s)...", urls.len()),
        ));
        image_errors.extend(
            ctx.images
                .check(&urls)
                .await
                .into_iter()
                .map(|m| FieldError::new("images", m)),
        );
    }
    if !image_errors.is_empty() {
        report_field_errors(reporter, "Some images are invalid", &image_errors);
        return Err(UploadError::Validation(image_errors));
    }

    reporter.report(ProgressEvent::success(Step::Validation, "Files validated"));

    // ── publish ──
    let layout = ctx.layout();
    let bundle = build_bundle(&layout, prepared, cover_format, &cover_file.content, submission.draft)
        .map_err(|e| {
            reporter.report(ProgressEvent::error(Step::Upload, e.to_string()));
            e
        })?;
    let title = bundle.meta.title.clone();
    let stem = validate::stem(&note_file.file_name).to_string();

    let receipts = publish_all(targets, &bundle, reporter).await?;

    // ── build ──
    let deploy = run_build(targets, &format!("New summary: {}", title), reporter).await?;

    // ── complete ──
    let url = final_url(&ctx.config, &stem, deploy.as_ref(), &receipts);
    let mut done = ProgressEvent::success(Step::Complete, "Summary published");
    if let Some(u) = &url {
        done = done.with_url(u.clone());
    }
    reporter.report(done);

    if let Some(id) = temp_id {
        if let Err(e) = ctx.temp.remove(&id).await {
            tracing::warn!(error = %e, %id, "failed to remove temp upload");
        }
    }

    Ok(SubmissionOutcome {
        url,
        paths: receipts
            .first()
            .map(|r| r.paths.clone())
            .unwrap_or_default(),
        receipts,
        deploy,
    })
}

/// The note as sent, or loaded back from the silent upload store.
async fn resolve_note(
    ctx: &PipelineContext,
    submission: &Submission,
) -> Result<(UploadedFile, Option<String>), UploadError> {
    if let Some(note) = &submission.note {
        return Ok((note.clone(), None));
    }
    let Some(id) = submission.note_id.as_deref().filter(|s| !s.trim().is_empty()) else {
        return Err(UploadError::field("file", "please select a note file"));
    };
    match ctx.temp.load(id).await {
        Ok(Some(note)) => Ok((
            UploadedFile {
                file_name: note.file_name,
                content: note.content,
            },
            Some(id.to_string()),
        )),
        Ok(None) => Err(UploadError::field(
            "noteId",
            "the uploaded note was not found; please upload it again",
        )),
        Err(e) => Err(UploadError::field("noteId", e.to_string())),
    }
}

/// Point the frontmatter at the published cover and assemble the files.
pub fn build_bundle(
    layout: &Layout,
    prepared: PreparedNote,
    cover_format: ImageFormat,
    cover: &[u8],
    draft: bool,
) -> Result<PublishBundle, UploadError> {
    let stem = prepared.stem().to_string();
    let cover_name = Layout::cover_file_name(&stem, cover_format.extension());
    let mut fm = prepared.frontmatter;
    bind_cover(&mut fm, &layout.cover_url(&cover_name), &prepared.meta.title);

    let text = frontmatter::render(&fm, &prepared.body)
        .map_err(|e| UploadError::transport(format!("failed to serialize the note: {}", e)))?;

    Ok(PublishBundle {
        note: PublishFile {
            path: layout.note_path(&prepared.file_name),
            content: text.into_bytes(),
        },
        cover: Some(PublishFile {
            path: layout.cover_path(&cover_name),
            content: cover.to_vec(),
        }),
        meta: PublishMeta {
            title: prepared.meta.title,
            contributor: validate::summary_meta(&fm).contributor.unwrap_or_default(),
            last_modification: frontmatter::get_str(&fm, "lastModification")
                .unwrap_or_default()
                .to_string(),
            draft,
        },
    })
}

/// `image: { url, alt }`, keeping an existing alt text.
fn bind_cover(fm: &mut Mapping, url: &str, title: &str) {
    let alt = frontmatter::get(fm, "image")
        .and_then(Value::as_mapping)
        .and_then(|img| frontmatter::get_str(img, "alt"))
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("Cover of {}", title));

    let mut image = Mapping::new();
    frontmatter::set_str(&mut image, "url", url);
    frontmatter::set_str(&mut image, "alt", alt);
    frontmatter::set(fm, "image", Value::Mapping(image));
}

async fn publish_all(
    targets: &Targets,
    bundle: &PublishBundle,
    reporter: &dyn ProgressReporter,
) -> Result<Vec<PublishReceipt>, UploadError> {
    let mut receipts = Vec::new();
    for publisher in &targets.publishers {
        reporter.report(ProgressEvent::info(
            Step::Upload,
            format!("Publishing to {}...", publisher.description()),
        ));
        match publisher.publish(bundle, reporter).await {
            Ok(receipt) => {
                tracing::info!(publisher = publisher.name(), url = ?receipt.url, "published");
                let mut event = ProgressEvent::success(Step::Upload, receipt.message.clone());
                if let Some(u) = &receipt.url {
                    event = event.with_url(u.clone());
                }
                reporter.report(event);
                receipts.push(receipt);
            }
            Err(e) => {
                tracing::error!(publisher = publisher.name(), error = %e, "publish failed");
                reporter.report(ProgressEvent::error(
                    Step::Upload,
                    format!("Publishing to {} failed: {}", publisher.name(), e),
                ));
                return Err(e);
            }
        }
    }
    Ok(receipts)
}

/// Trigger the build hook and track the deploy. Without a hook the step is
/// skipped with a warning and `Ok(None)` is returned.
pub async fn run_build(
    targets: &Targets,
    title: &str,
    reporter: &dyn ProgressReporter,
) -> Result<Option<DeployInfo>, UploadError> {
    let Some(hook) = &targets.hook else {
        reporter.report(ProgressEvent::warning(
            Step::Build,
            "Build hook not configured, skipped",
        ));
        return Ok(None);
    };

    // The deploy that is current before the trigger must not be taken for
    // the one the trigger starts.
    let previous = match &targets.tracker {
        Some(tracker) => match tracker.latest_deploy().await {
            Ok(deploy) => deploy.map(|d| d.id),
            Err(e) => {
                tracing::warn!(error = %e, "could not read the latest deploy before triggering");
                None
            }
        },
        None => None,
    };

    reporter.report(ProgressEvent::info(Step::Build, "Triggering the site build..."));
    let since: DateTime<Utc> = Utc::now();
    if let Err(e) = hook.trigger(title).await {
        reporter.report(ProgressEvent::error(
            Step::Build,
            format!("The build could not be triggered: {}", e),
        ));
        return Err(e);
    }
    reporter.report(ProgressEvent::success(Step::Build, "Build triggered"));

    let Some(tracker) = &targets.tracker else {
        return Ok(None);
    };
    reporter.report(ProgressEvent::info(Step::Build, "Waiting for the deployment..."));
    match tracker.wait_for_deploy(since, previous.as_deref(), reporter).await {
        Ok(deploy) => {
            let mut event = ProgressEvent::success(Step::Build, "Deployment ready");
            if let Some(u) = deploy.public_url() {
                event = event.with_url(u.to_string());
            }
            reporter.report(event);
            Ok(Some(deploy))
        }
        Err(e) => {
            reporter.report(ProgressEvent::error(
                Step::Build,
                format!("Deployment failed: {}", e),
            ));
            Err(e)
        }
    }
}

/// Public URL of the note: on the tracked deploy, else on the configured
/// site, else whatever the first publisher pointed at.
pub fn final_url(
    config: &Config,
    slug: &str,
    deploy: Option<&DeployInfo>,
    receipts: &[PublishReceipt],
) -> Option<String> {
    let note_path = config.site.note_path.replace("{slug}", slug);
    if let Some(base) = deploy.and_then(DeployInfo::public_url) {
        return Some(format!(
            "{}/{}",
            base.trim_end_matches('/'),
            note_path.trim_start_matches('/')
        ));
    }
    config
        .note_url(slug)
        .or_else(|| receipts.iter().find_map(|r| r.url.clone()))
}

// ═══════════════════════════════════════════════════════════════════════
// Direct upload
// ═══════════════════════════════════════════════════════════════════════

/// A single file pushed by an authenticated client into one of the
/// publishable directories.
#[derive(Debug, Clone)]
pub struct DirectUpload {
    pub file: UploadedFile,
    /// Target directory; defaults to the notes directory.
    pub directory: Option<String>,
    pub trigger_build: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectUploadResult {
    pub success: bool,
    pub path: String,
    pub targets: Vec<String>,
    pub url: Option<String>,
    pub build_triggered: bool,
}

/// Validate and publish one file, optionally triggering a build.
pub async fn upload_direct(
    ctx: &PipelineContext,
    targets: &Targets,
    upload: DirectUpload,
    reporter: &dyn ProgressReporter,
) -> Result<DirectUploadResult, UploadError> {
    let layout = ctx.layout();
    let limits = ctx.limits();
    let dir = upload
        .directory
        .as_deref()
        .map(|d| d.trim_matches('/').to_string())
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| layout.notes_dir.clone());
    let name = &upload.file.file_name;
    let path = check_path(&format!("{}/{}", dir, name), &layout.allowed_dirs())?;

    let is_cover_dir = path.starts_with(&format!("{}/", layout.covers_dir));
    if is_cover_dir {
        validate::validate_cover(name, &upload.file.content, limits.max_cover_bytes)
            .map_err(UploadError::Validation)?;
    } else {
        let mut errors = validate::validate_note_name(name);
        errors.extend(validate::validate_size(
            upload.file.content.len(),
            limits.max_note_bytes,
            "fileSize",
        ));
        if !errors.is_empty() {
            return Err(UploadError::Validation(errors));
        }
        let text = std::str::from_utf8(&upload.file.content)
            .map_err(|_| UploadError::field("file", "the note must be UTF-8 text"))?;
        let (fm, _) = frontmatter::parse(text)
            .map_err(|e| UploadError::field("frontmatter", e.to_string()))?;
        let errors = validate::validate_summary(&fm, validate::SchemaMode::Submission);
        if !errors.is_empty() {
            return Err(UploadError::Validation(errors));
        }
    }

    let bundle = PublishBundle {
        note: PublishFile {
            path: path.clone(),
            content: upload.file.content,
        },
        cover: None,
        meta: PublishMeta {
            title: name.clone(),
            contributor: "api".to_string(),
            last_modification: validate::format_date(Utc::now()),
            draft: false,
        },
    };

    let receipts = publish_all(targets, &bundle, reporter).await?;
    let mut build_triggered = false;
    if upload.trigger_build {
        if let Some(hook) = &targets.hook {
            hook.trigger(&format!("Upload: {}", name)).await?;
            build_triggered = true;
        }
    }

    Ok(DirectUploadResult {
        success: true,
        path,
        targets: receipts.iter().map(|r| r.target.clone()).collect(),
        url: receipts.iter().find_map(|r| r.url.clone()),
        build_triggered,
    })
}
