//! Validation stages for a submitted note and its cover image.
//!
//! Every check returns [`FieldError`]s tagged with the field that failed so
//! the form can point at it. Nothing in this module touches the network;
//! image URL reachability lives in [`crate::images`].

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use regex::Regex;
use serde_yaml::{Mapping, Value};
use std::sync::OnceLock;

use crate::error::{FieldError, UploadError};
use crate::frontmatter;

pub const ALLOWED_NOTE_EXTENSIONS: &[&str] = &["md", "mdx"];

/// Frontmatter key for the book title, followed by its accepted alias.
pub const TITLE_KEYS: &[&str] = &["bookTitle", "title"];
/// Frontmatter key for the book authors, followed by its accepted alias.
pub const AUTHORS_KEYS: &[&str] = &["bookAuthors", "authors"];

const MIN_SUMMARY_CHARS: usize = 10;

/// Which frontmatter fields are mandatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaMode {
    /// Final submission: title, authors, tags and summary.
    Submission,
    /// Silent pre-validation: only title and summary.
    Preview,
}

/// Size limits applied to uploaded files.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_note_bytes: usize,
    pub max_cover_bytes: usize,
}

impl From<&crate::config::UploadConfig> for Limits {
    fn from(cfg: &crate::config::UploadConfig) -> Self {
        Self {
            max_note_bytes: cfg.max_note_bytes,
            max_cover_bytes: cfg.max_cover_bytes,
        }
    }
}

fn note_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+\.(md|mdx)$").expect("static regex"))
}

fn markdown_image_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"!\[([^\]]*)\]\(([^)]*)\)").expect("static regex"))
}

/// Lower-cased extension without the dot, if any.
pub fn extension(name: &str) -> Option<String> {
    let (_, ext) = name.rsplit_once('.')?;
    if ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

pub fn stem(name: &str) -> &str {
    name.rsplit_once('.').map(|(s, _)| s).unwrap_or(name)
}

pub fn is_note_extension(name: &str) -> bool {
    extension(name)
        .map(|e| ALLOWED_NOTE_EXTENSIONS.contains(&e.as_str()))
        .unwrap_or(false)
}

/// Check the note file name: `.md`/`.mdx` and only letters, digits, `-`, `_`.
pub fn validate_note_name(name: &str) -> Vec<FieldError> {
    let mut errors = Vec::new();
    if !is_note_extension(name) {
        errors.push(FieldError::new(
            "fileName",
            "the file extension must be .md or .mdx",
        ));
    }
    if !note_name_re().is_match(name) {
        errors.push(FieldError::new(
            "fileName",
            "the file name may only contain letters, digits, dashes and underscores",
        ));
    }
    errors
}

pub fn validate_size(len: usize, max: usize, field: &str) -> Vec<FieldError> {
    if len > max {
        vec![FieldError::new(
            field,
            format!("the file must not exceed {}", human_size(max)),
        )]
    } else {
        Vec::new()
    }
}

fn human_size(bytes: usize) -> String {
    const MIB: usize = 1024 * 1024;
    if bytes >= MIB && bytes % MIB == 0 {
        format!("{} MB", bytes / MIB)
    } else if bytes >= 1024 {
        format!("{} KB", bytes / 1024)
    } else {
        format!("{} bytes", bytes)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Cover image
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    Webp,
}

impl ImageFormat {
    /// Detect the format from the file signature.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(ImageFormat::Jpeg)
        } else if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
            Some(ImageFormat::Png)
        } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            Some(ImageFormat::Gif)
        } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            Some(ImageFormat::Webp)
        } else {
            None
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
            "png" => Some(ImageFormat::Png),
            "gif" => Some(ImageFormat::Gif),
            "webp" => Some(ImageFormat::Webp),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
            ImageFormat::Gif => "gif",
            ImageFormat::Webp => "webp",
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
            ImageFormat::Gif => "image/gif",
            ImageFormat::Webp => "image/webp",
        }
    }
}

/// Validate the cover: supported format (by signature), matching extension
/// and size. Returns the detected format when valid.
pub fn validate_cover(name: &str, bytes: &[u8], max: usize) -> Result<ImageFormat, Vec<FieldError>> {
    let mut errors = Vec::new();

    if bytes.is_empty() {
        return Err(vec![FieldError::new("cover", "please select a cover image")]);
    }

    let detected = ImageFormat::sniff(bytes);
    match detected {
        None => errors.push(FieldError::new(
            "cover",
            "unsupported image format; use JPG, PNG, GIF or WebP",
        )),
        Some(format) => {
            let declared = extension(name).and_then(|e| ImageFormat::from_extension(&e));
            if declared != Some(format) {
                errors.push(FieldError::new(
                    "cover",
                    format!(
                        "the file extension does not match its content ({})",
                        format.mime()
                    ),
                ));
            }
        }
    }

    errors.extend(validate_size(bytes.len(), max, "cover"));

    match (detected, errors.is_empty()) {
        (Some(format), true) => Ok(format),
        _ => Err(errors),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Frontmatter schema
// ═══════════════════════════════════════════════════════════════════════

/// Typed view of the fields the workflow needs after validation.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryMeta {
    pub title: String,
    pub authors: Vec<String>,
    pub tags: Vec<String>,
    pub summary: String,
    pub contributor: Option<String>,
    pub last_modification: Option<String>,
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    value
        .as_sequence()?
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect()
}

fn check_required_string(map: &Mapping, keys: &[&str], label: &str, errors: &mut Vec<FieldError>) {
    match frontmatter::get_any(map, keys) {
        None => errors.push(FieldError::new(keys[0], format!("{} is required", label))),
        Some((value, idx)) => match value.as_str() {
            Some(s) if !s.trim().is_empty() => {}
            Some(_) => errors.push(FieldError::new(keys[idx], format!("{} must not be empty", label))),
            None => errors.push(FieldError::new(keys[idx], format!("{} must be a string", label))),
        },
    }
}

fn check_string_list(
    map: &Mapping,
    keys: &[&str],
    label: &str,
    required: bool,
    errors: &mut Vec<FieldError>,
) {
    match frontmatter::get_any(map, keys) {
        None if required => errors.push(FieldError::new(keys[0], format!("{} is required", label))),
        None => {}
        Some((value, idx)) => match string_list(value) {
            None => errors.push(FieldError::new(
                keys[idx],
                format!("{} must be a list of strings", label),
            )),
            Some(list) if required && list.iter().all(|s| s.trim().is_empty()) => errors.push(
                FieldError::new(keys[idx], format!("at least one entry is required in {}", label)),
            ),
            Some(_) => {}
        },
    }
}

/// Parse a frontmatter date: RFC 3339, `YYYY-MM-DD HH:MM:SS` or `YYYY-MM-DD`.
pub fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|d| d.and_utc());
    }
    None
}

pub fn format_date(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Validate the frontmatter schema of a book summary.
pub fn validate_summary(map: &Mapping, mode: SchemaMode) -> Vec<FieldError> {
    let mut errors = Vec::new();
    let submission = mode == SchemaMode::Submission;

    check_required_string(map, TITLE_KEYS, "the book title", &mut errors);
    check_string_list(map, AUTHORS_KEYS, "the book authors", submission, &mut errors);
    check_string_list(map, &["tags"], "tags", submission, &mut errors);
    check_string_list(map, &["quotes"], "quotes", false, &mut errors);

    match frontmatter::get(map, "summary") {
        None => errors.push(FieldError::new("summary", "the summary is required")),
        Some(v) => match v.as_str() {
            Some(s) if s.trim().chars().count() >= MIN_SUMMARY_CHARS => {}
            Some(_) => errors.push(FieldError::new(
                "summary",
                format!("the summary must be at least {} characters", MIN_SUMMARY_CHARS),
            )),
            None => errors.push(FieldError::new("summary", "the summary must be a string")),
        },
    }

    if let Some(v) = frontmatter::get(map, "publishedYear") {
        if v.as_i64().is_none() {
            errors.push(FieldError::new("publishedYear", "the year must be an integer"));
        }
    }

    if let Some(v) = frontmatter::get(map, "author") {
        if v.as_str().is_none() {
            errors.push(FieldError::new("author", "the author must be a string"));
        }
    }

    if let Some(v) = frontmatter::get(map, "contributor") {
        if v.as_str().is_none() {
            errors.push(FieldError::new("contributor", "the contributor must be a string"));
        }
    }

    if let Some(v) = frontmatter::get(map, "lastModification") {
        if v.as_str().and_then(parse_date).is_none() {
            errors.push(FieldError::new("lastModification", "expected a date"));
        }
    }

    if let Some(image) = frontmatter::get(map, "image") {
        match image.as_mapping() {
            None => errors.push(FieldError::new("image", "the image must be an object")),
            Some(img) => {
                if let Some(url) = frontmatter::get(img, "url") {
                    if url.as_str().is_none() {
                        errors.push(FieldError::new("image.url", "the image URL must be a string"));
                    }
                }
                if let Some(alt) = frontmatter::get(img, "alt") {
                    if alt.as_str().is_none() {
                        errors.push(FieldError::new("image.alt", "the alt text must be a string"));
                    }
                }
            }
        }
    }

    errors
}

/// Read the typed fields from an already validated mapping.
pub fn summary_meta(map: &Mapping) -> SummaryMeta {
    let title = frontmatter::get_any(map, TITLE_KEYS)
        .and_then(|(v, _)| v.as_str())
        .unwrap_or_default()
        .to_string();
    let authors = frontmatter::get_any(map, AUTHORS_KEYS)
        .and_then(|(v, _)| string_list(v))
        .unwrap_or_default();
    let tags = frontmatter::get(map, "tags")
        .and_then(string_list)
        .unwrap_or_default();
    SummaryMeta {
        title,
        authors,
        tags,
        summary: frontmatter::get_str(map, "summary")
            .unwrap_or_default()
            .to_string(),
        contributor: frontmatter::get_str(map, "contributor").map(str::to_string),
        last_modification: frontmatter::get_str(map, "lastModification").map(str::to_string),
    }
}

/// Every Markdown image must carry alt text.
pub fn check_alt_text(body: &str) -> Vec<String> {
    markdown_image_re()
        .captures_iter(body)
        .filter(|c| c.get(1).map(|m| m.as_str().trim().is_empty()).unwrap_or(true))
        .map(|c| {
            let target = c.get(2).map(|m| m.as_str()).unwrap_or_default();
            format!("image without alt text: {}", target)
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════
// Full note preparation
// ═══════════════════════════════════════════════════════════════════════

/// A note that passed every offline check, ready to be published.
#[derive(Debug, Clone)]
pub struct PreparedNote {
    pub file_name: String,
    pub frontmatter: Mapping,
    pub body: String,
    pub meta: SummaryMeta,
}

impl PreparedNote {
    pub fn stem(&self) -> &str {
        stem(&self.file_name)
    }
}

/// Run every offline stage on a submitted note.
///
/// Stages stop at the first failing group: name, size, encoding and
/// frontmatter presence, then the full schema. The contributor from the
/// form overrides the frontmatter; a missing `lastModification` defaults to
/// `now`.
pub fn prepare_note(
    file_name: &str,
    bytes: &[u8],
    contributor: Option<&str>,
    limits: Limits,
    now: DateTime<Utc>,
) -> Result<PreparedNote, UploadError> {
    let name_errors = validate_note_name(file_name);
    if !name_errors.is_empty() {
        return Err(UploadError::Validation(name_errors));
    }

    let size_errors = validate_size(bytes.len(), limits.max_note_bytes, "fileSize");
    if !size_errors.is_empty() {
        return Err(UploadError::Validation(size_errors));
    }

    let text = std::str::from_utf8(bytes)
        .map_err(|_| UploadError::field("file", "the note must be UTF-8 text"))?;

    let (mut fm, body) =
        frontmatter::parse(text).map_err(|e| UploadError::field("frontmatter", e.to_string()))?;

    if fm.is_empty() {
        return Err(UploadError::field("frontmatter", "the frontmatter has no data"));
    }

    let form_contributor = contributor.map(str::trim).filter(|c| !c.is_empty());
    match form_contributor {
        Some(c) => frontmatter::set_str(&mut fm, "contributor", c),
        None => {
            let existing = frontmatter::get_str(&fm, "contributor")
                .map(str::trim)
                .filter(|c| !c.is_empty());
            if existing.is_none() {
                return Err(UploadError::field("contributor", "the contributor is required"));
            }
        }
    }

    let last_mod = match frontmatter::get(&fm, "lastModification") {
        None => Some(now),
        Some(v) => v.as_str().and_then(parse_date),
    };
    if let Some(dt) = last_mod {
        frontmatter::set_str(&mut fm, "lastModification", format_date(dt));
    }

    let errors = validate_summary(&fm, SchemaMode::Submission);
    if !errors.is_empty() {
        return Err(UploadError::Validation(errors));
    }

    let meta = summary_meta(&fm);
    Ok(PreparedNote {
        file_name: file_name.to_string(),
        frontmatter: fm,
        body,
        meta,
    })
}
