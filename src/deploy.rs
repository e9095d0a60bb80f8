//! Site rebuilds: build hook trigger, deploy tracking and diagnostics.
//!
//! Three pieces, used independently:
//!
//! - **[`BuildHook`]** POSTs `{}` to the configured build hook URL.
//! - **[`DeployTracker`]** polls the deploy API until the deploy started by
//!   that hook is `ready` or fails.
//! - **[`diagnose`]** checks the deploy configuration without triggering
//!   anything.
//!
//! # Retry Strategy
//!
//! Hook and API calls retry on transient errors, like the publishers:
//! - HTTP 429 and 5xx → retry
//! - Network errors → retry
//! - Other 4xx → fail immediately
//! - Backoff: 1s, 2s, 4s, ... (capped at 2^5)

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::config::{Config, DeployConfig, Secrets};
use crate::error::UploadError;
use crate::progress::{ProgressEvent, ProgressReporter, Step};

/// A deploy that was not the latest one before the trigger may carry a
/// timestamp slightly earlier than the trigger when the clocks disagree.
const CLOCK_SKEW_SECS: i64 = 30;

fn http_client(timeout: Duration) -> Result<reqwest::Client, UploadError> {
    Ok(reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("summary-press/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

/// Send a request built by `make` with retry/backoff and return the final
/// response, whatever its status, unless it is transient on every attempt.
async fn send_with_retry<F>(
    label: &str,
    max_retries: u32,
    make: F,
) -> Result<reqwest::Response, UploadError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        match make().send().await {
            Ok(response) => {
                let status = response.status();
                if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                    let text = response.text().await.unwrap_or_default();
                    tracing::warn!(%status, attempt, "{} transient error", label);
                    last_err = Some(UploadError::transport(format!(
                        "{} error {}: {}",
                        label, status, text
                    )));
                    continue;
                }
                return Ok(response);
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt, "{} request failed", label);
                last_err = Some(e.into());
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| UploadError::transport(format!("{} failed after retries", label))))
}

// ═══════════════════════════════════════════════════════════════════════
// Build hook
// ═══════════════════════════════════════════════════════════════════════

pub struct BuildHook {
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl BuildHook {
    pub fn new(url: impl Into<String>, max_retries: u32) -> Result<Self, UploadError> {
        Ok(Self {
            url: url.into(),
            max_retries,
            client: http_client(Duration::from_secs(30))?,
        })
    }

    /// Build hook from the environment, if one is configured.
    pub fn from_secrets(config: &Config, secrets: &Secrets) -> Result<Option<Self>, UploadError> {
        match &secrets.build_hook {
            Some(url) => Ok(Some(Self::new(url.clone(), config.deploy.max_retries)?)),
            None => Ok(None),
        }
    }

    /// Start a build. `title` shows up in the provider's deploy log.
    pub async fn trigger(&self, title: &str) -> Result<(), UploadError> {
        let response = send_with_retry("build hook", self.max_retries, || {
            self.client
                .post(&self.url)
                .query(&[("trigger_title", title)])
                .json(&serde_json::json!({}))
        })
        .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(UploadError::transport(format!(
                "build hook answered {}: {}",
                status, text
            )));
        }
        tracing::info!(title, "build hook triggered");
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Deploy tracking
// ═══════════════════════════════════════════════════════════════════════

/// The fields of a deploy the tracker cares about.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DeployInfo {
    pub id: String,
    pub state: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub ssl_url: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub deploy_ssl_url: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl DeployInfo {
    pub fn is_ready(&self) -> bool {
        self.state == "ready"
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state.as_str(), "error" | "rejected")
    }

    /// Public URL of the deployed site.
    pub fn public_url(&self) -> Option<&str> {
        self.ssl_url
            .as_deref()
            .or(self.url.as_deref())
            .or(self.deploy_ssl_url.as_deref())
    }

    fn created_after(&self, since: DateTime<Utc>) -> bool {
        let threshold = since - ChronoDuration::seconds(CLOCK_SKEW_SECS);
        self.created_at
            .as_deref()
            .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
            .map(|c| c.with_timezone(&Utc) >= threshold)
            .unwrap_or(false)
    }
}

pub struct DeployTracker {
    client: reqwest::Client,
    api_base: String,
    site_id: String,
    token: String,
    poll_interval: Duration,
    timeout: Duration,
    max_retries: u32,
}

impl DeployTracker {
    pub fn new(config: &DeployConfig, site_id: String, token: String) -> Result<Self, UploadError> {
        Ok(Self {
            client: http_client(Duration::from_secs(30))?,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            site_id,
            token,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            timeout: Duration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
        })
    }

    /// Tracker from the environment. `None` when tracking is disabled or the
    /// site id / API token are not set.
    pub fn from_secrets(config: &Config, secrets: &Secrets) -> Result<Option<Self>, UploadError> {
        if !config.deploy.track {
            return Ok(None);
        }
        match (&secrets.netlify_site_id, &secrets.netlify_api_token) {
            (Some(site), Some(token)) => Ok(Some(Self::new(
                &config.deploy,
                site.clone(),
                token.clone(),
            )?)),
            _ => Ok(None),
        }
    }

    /// Override the poll interval and timeout.
    pub fn with_timing(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.timeout = timeout;
        self
    }

    async fn get_json(&self, path: &str) -> Result<Value, UploadError> {
        let url = format!("{}/{}", self.api_base, path.trim_start_matches('/'));
        let response = send_with_retry("deploy API", self.max_retries, || {
            self.client.get(&url).bearer_auth(&self.token)
        })
        .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(UploadError::configuration(format!(
                "deploy API rejected the token ({})",
                status
            )));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(UploadError::transport(format!(
                "deploy API GET {} answered {}: {}",
                path, status, text
            )));
        }
        Ok(response.json().await?)
    }

    /// Most recent deploy of the site, if any.
    pub async fn latest_deploy(&self) -> Result<Option<DeployInfo>, UploadError> {
        let json = self
            .get_json(&format!("sites/{}/deploys?per_page=1", self.site_id))
            .await?;
        let first = json.as_array().and_then(|a| a.first()).cloned();
        match first {
            Some(v) => Ok(Some(parse_deploy(v)?)),
            None => Ok(None),
        }
    }

    pub async fn deploy(&self, id: &str) -> Result<DeployInfo, UploadError> {
        let json = self.get_json(&format!("deploys/{}", id)).await?;
        parse_deploy(json)
    }

    /// Wait for the deploy triggered at `since` to finish.
    ///
    /// `previous` is the id of the latest deploy read before the trigger
    /// (see [`latest_deploy`](Self::latest_deploy)); that deploy is never
    /// taken for the new one, whatever its timestamp.
    ///
    /// Emits a `build` info event whenever the deploy changes state. Returns
    /// the finished deploy on `ready`, an error on failure or timeout.
    pub async fn wait_for_deploy(
        &self,
        since: DateTime<Utc>,
        previous: Option<&str>,
        reporter: &dyn ProgressReporter,
    ) -> Result<DeployInfo, UploadError> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut deploy_id: Option<String> = None;
        let mut last_state = String::new();

        loop {
            let current = if let Some(id) = deploy_id.clone() {
                Some(self.deploy(&id).await?)
            } else {
                match self.latest_deploy().await? {
                    Some(d) if Some(d.id.as_str()) != previous && d.created_after(since) => {
                        tracing::info!(deploy = %d.id, "tracking deploy");
                        reporter.report(ProgressEvent::info(
                            Step::Build,
                            format!("Deploy {} started", d.id),
                        ));
                        deploy_id = Some(d.id.clone());
                        Some(self.deploy(&d.id).await?)
                    }
                    _ => None,
                }
            };

            if let Some(deploy) = current {
                if deploy.is_ready() {
                    tracing::info!(deploy = %deploy.id, "deploy ready");
                    return Ok(deploy);
                }
                if deploy.is_failed() {
                    let reason = deploy
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "no error message".to_string());
                    tracing::warn!(deploy = %deploy.id, %reason, "deploy failed");
                    return Err(UploadError::transport(format!(
                        "deploy {} failed: {}",
                        deploy.id, reason
                    )));
                }
                if deploy.state != last_state {
                    reporter.report(ProgressEvent::info(
                        Step::Build,
                        format!("Deploy {}: {}", deploy.id, deploy.state),
                    ));
                    last_state = deploy.state.clone();
                }
            }

            if tokio::time::Instant::now() + self.poll_interval > deadline {
                return Err(UploadError::transport(format!(
                    "deploy did not finish within {}s",
                    self.timeout.as_secs()
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

fn parse_deploy(value: Value) -> Result<DeployInfo, UploadError> {
    serde_json::from_value(value)
        .map_err(|e| UploadError::transport(format!("unexpected deploy API response: {}", e)))
}

// ═══════════════════════════════════════════════════════════════════════
// Diagnostics
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Check {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
}

impl Check {
    fn new(name: &str, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub ok: bool,
    pub checks: Vec<Check>,
}

/// A build hook URL points at `api.netlify.com` under `/build_hooks/`.
pub fn looks_like_build_hook(url: &str) -> bool {
    match reqwest::Url::parse(url) {
        Ok(u) => u.host_str() == Some("api.netlify.com") && u.path().contains("/build_hooks/"),
        Err(_) => false,
    }
}

/// Check the deploy configuration: build hook, site id, API token, and
/// whether the API knows the site. Nothing is triggered.
pub async fn diagnose(config: &Config, secrets: &Secrets) -> DiagnosticReport {
    let mut checks = Vec::new();

    checks.push(match &secrets.build_hook {
        None => Check::new("build_hook", CheckStatus::Error, "NETLIFY_BUILD_HOOK is not set"),
        Some(url) if reqwest::Url::parse(url).is_err() => {
            Check::new("build_hook", CheckStatus::Error, "NETLIFY_BUILD_HOOK is not a valid URL")
        }
        Some(url) if !looks_like_build_hook(url) => Check::new(
            "build_hook",
            CheckStatus::Warning,
            "NETLIFY_BUILD_HOOK does not look like https://api.netlify.com/build_hooks/<id>",
        ),
        Some(_) => Check::new("build_hook", CheckStatus::Success, "build hook configured"),
    });

    checks.push(match &secrets.netlify_site_id {
        Some(_) => Check::new("site_id", CheckStatus::Success, "NETLIFY_SITE_ID is set"),
        None => Check::new(
            "site_id",
            CheckStatus::Warning,
            "NETLIFY_SITE_ID is not set; deploys will not be tracked",
        ),
    });

    checks.push(match &secrets.netlify_api_token {
        Some(_) => Check::new("api_token", CheckStatus::Success, "NETLIFY_API_TOKEN is set"),
        None => Check::new(
            "api_token",
            CheckStatus::Warning,
            "NETLIFY_API_TOKEN is not set; deploys will not be tracked",
        ),
    });

    if let (Some(site), Some(token)) = (&secrets.netlify_site_id, &secrets.netlify_api_token) {
        checks.push(check_site(&config.deploy, site, token).await);
    }

    let ok = checks.iter().all(|c| c.status != CheckStatus::Error);
    DiagnosticReport { ok, checks }
}

async fn check_site(config: &DeployConfig, site: &str, token: &str) -> Check {
    let client = match http_client(Duration::from_secs(10)) {
        Ok(c) => c,
        Err(e) => return Check::new("site", CheckStatus::Error, e.to_string()),
    };
    let url = format!("{}/sites/{}", config.api_base.trim_end_matches('/'), site);
    match client.get(&url).bearer_auth(token).send().await {
        Ok(resp) if resp.status().is_success() => {
            let name = resp
                .json::<Value>()
                .await
                .ok()
                .and_then(|v| v.get("name").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| site.to_string());
            Check::new("site", CheckStatus::Success, format!("site {} found", name))
        }
        Ok(resp) if resp.status() == StatusCode::NOT_FOUND => {
            Check::new("site", CheckStatus::Error, format!("site {} not found", site))
        }
        Ok(resp) if resp.status() == StatusCode::UNAUTHORIZED || resp.status() == StatusCode::FORBIDDEN => {
            Check::new("site", CheckStatus::Error, "NETLIFY_API_TOKEN was rejected")
        }
        Ok(resp) => Check::new(
            "site",
            CheckStatus::Error,
            format!("deploy API answered {}", resp.status()),
        ),
        Err(e) => Check::new(
            "site",
            CheckStatus::Error,
            format!("deploy API unreachable: {}", e),
        ),
    }
}
