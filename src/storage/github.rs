//! GitHub publisher.
//!
//! Publishes a submission as a single commit on an upload branch using the
//! [Git Data API](https://docs.github.com/en/rest/git), then opens a pull
//! request against the environment's base branch.
//!
//! # Workflow
//!
//! 1. Resolve the upload branch (`notes/upload-develop` for drafts,
//!    otherwise `notes/upload-<base>`), creating it from the base branch when
//!    it does not exist yet.
//! 2. Create one blob per file (base64).
//! 3. Create a tree on top of the branch head's tree.
//! 4. Create a commit and move the branch to it.
//! 5. Open a pull request. When GitHub answers 422 because one is already
//!    open for the branch, reuse it.
//!
//! # Retries
//!
//! Every call retries with exponential backoff on HTTP 429, 5xx and network
//! errors. Other 4xx answers are returned to the caller.

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;

use super::{check_path, Layout, PublishBundle, PublishReceipt, Publisher};
use crate::config::{Environment, GitHubConfig};
use crate::error::UploadError;
use crate::progress::{ProgressEvent, ProgressReporter, Step};

pub struct GitHubPublisher {
    config: GitHubConfig,
    token: String,
    environment: Environment,
    layout: Layout,
    client: reqwest::Client,
}

/// Branch that collects submissions for a draft flag and environment.
pub fn upload_branch(draft: bool, environment: Environment) -> String {
    if draft {
        "notes/upload-develop".to_string()
    } else {
        format!("notes/upload-{}", environment.base_branch())
    }
}

impl GitHubPublisher {
    pub fn new(
        config: GitHubConfig,
        token: String,
        environment: Environment,
        layout: Layout,
    ) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("summary-press/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            config,
            token,
            environment,
            layout,
            client,
        })
    }

    fn repo_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.owner,
            self.config.repo,
            path.trim_start_matches('/')
        )
    }

    /// Send a request with retry/backoff.
    ///
    /// - HTTP 429 or 5xx → retry with exponential backoff
    /// - Network error → retry
    /// - Anything else → returned as `(status, json body)`
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<(StatusCode, Value), UploadError> {
        let url = self.repo_url(path);
        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut req = self
                .client
                .request(method.clone(), &url)
                .header("Authorization", format!("Bearer {}", self.token))
                .header("Accept", "application/vnd.github+json")
                .header("X-GitHub-Api-Version", "2022-11-28");
            if let Some(body) = body {
                req = req.json(body);
            }

            match req.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        let text = response.text().await.unwrap_or_default();
                        tracing::warn!(%status, %url, attempt, "GitHub API transient error");
                        last_err = Some(UploadError::transport(format!(
                            "GitHub API error {}: {}",
                            status, text
                        )));
                        continue;
                    }
                    let text = response.text().await.unwrap_or_default();
                    let json = if text.trim().is_empty() {
                        Value::Null
                    } else {
                        serde_json::from_str(&text).unwrap_or(Value::String(text))
                    };
                    return Ok((status, json));
                }
                Err(e) => {
                    tracing::warn!(error = %e, %url, attempt, "GitHub API request failed");
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| UploadError::transport("GitHub request failed after retries")))
    }

    /// Like [`call`](Self::call) but any non-2xx status is an error.
    async fn call_ok(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, UploadError> {
        let (status, json) = self.call(method.clone(), path, body).await?;
        if !status.is_success() {
            return Err(api_error(&method, path, status, &json));
        }
        Ok(json)
    }

    /// Head commit of `branch`, or `None` when the branch does not exist.
    async fn branch_head(&self, branch: &str) -> Result<Option<String>, UploadError> {
        let path = format!("git/ref/heads/{}", branch);
        let (status, json) = self.call(Method::GET, &path, None).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(api_error(&Method::GET, &path, status, &json));
        }
        json_str(&json, &["object", "sha"]).map(Some)
    }

    /// Make sure the upload branch exists and return its head commit.
    async fn ensure_branch(&self, branch: &str, base: &str) -> Result<String, UploadError> {
        if let Some(sha) = self.branch_head(branch).await? {
            return Ok(sha);
        }
        let base_sha = self.branch_head(base).await?.ok_or_else(|| {
            UploadError::transport(format!("base branch '{}' does not exist", base))
        })?;
        let body = json!({ "ref": format!("refs/heads/{}", branch), "sha": base_sha });
        self.call_ok(Method::POST, "git/refs", Some(&body)).await?;
        tracing::info!(branch, base, "created upload branch");
        Ok(base_sha)
    }

    async fn create_blob(&self, content: &[u8]) -> Result<String, UploadError> {
        let body = json!({
            "content": base64::engine::general_purpose::STANDARD.encode(content),
            "encoding": "base64",
        });
        let json = self.call_ok(Method::POST, "git/blobs", Some(&body)).await?;
        json_str(&json, &["sha"])
    }

    /// Open a pull request, or find the one already open for `head`.
    async fn open_pull_request(
        &self,
        head: &str,
        base: &str,
        bundle: &PublishBundle,
    ) -> Result<(String, bool), UploadError> {
        let meta = &bundle.meta;
        let title = if meta.draft {
            format!("[Draft] {}", display_title(&meta.title))
        } else {
            format!("[Note] {}", display_title(&meta.title))
        };
        let body = json!({
            "title": title,
            "body": pull_request_body(bundle),
            "head": head,
            "base": base,
            "draft": meta.draft,
        });

        let (status, json) = self.call(Method::POST, "pulls", Some(&body)).await?;
        if status.is_success() {
            return Ok((json_str(&json, &["html_url"])?, true));
        }
        if status != StatusCode::UNPROCESSABLE_ENTITY {
            return Err(api_error(&Method::POST, "pulls", status, &json));
        }

        let query = format!("pulls?state=open&head={}:{}", self.config.owner, head);
        let open = self.call_ok(Method::GET, &query, None).await?;
        let existing = open
            .as_array()
            .and_then(|prs| prs.first())
            .and_then(|pr| pr.get("html_url"))
            .and_then(Value::as_str);
        match existing {
            Some(url) => Ok((url.to_string(), false)),
            None => Err(api_error(&Method::POST, "pulls", status, &json)),
        }
    }
}

#[async_trait]
impl Publisher for GitHubPublisher {
    fn name(&self) -> &str {
        "github"
    }

    fn description(&self) -> String {
        format!("GitHub {}/{}", self.config.owner, self.config.repo)
    }

    async fn publish(
        &self,
        bundle: &PublishBundle,
        reporter: &dyn ProgressReporter,
    ) -> Result<PublishReceipt, UploadError> {
        let allowed = self.layout.allowed_dirs();
        let mut paths = Vec::new();
        for file in bundle.files() {
            paths.push(check_path(&file.path, &allowed)?);
        }

        let branch = upload_branch(bundle.meta.draft, self.environment);
        let base = self.environment.base_branch();

        let head = self.ensure_branch(&branch, base).await?;

        reporter.report(ProgressEvent::info(
            Step::Upload,
            format!("Committing {} file(s) to {}", paths.len(), branch),
        ));

        let blobs =
            futures::future::try_join_all(bundle.files().iter().map(|f| self.create_blob(&f.content)))
                .await?;

        let commit = self
            .call_ok(Method::GET, &format!("git/commits/{}", head), None)
            .await?;
        let base_tree = json_str(&commit, &["tree", "sha"])?;

        let entries: Vec<Value> = paths
            .iter()
            .zip(&blobs)
            .map(|(path, sha)| json!({ "path": path, "mode": "100644", "type": "blob", "sha": sha }))
            .collect();
        let tree = self
            .call_ok(
                Method::POST,
                "git/trees",
                Some(&json!({ "base_tree": base_tree, "tree": entries })),
            )
            .await?;
        let tree_sha = json_str(&tree, &["sha"])?;

        let message = format!("[summary] {}", display_title(&bundle.meta.title));
        let new_commit = self
            .call_ok(
                Method::POST,
                "git/commits",
                Some(&json!({ "message": message, "tree": tree_sha, "parents": [head] })),
            )
            .await?;
        let commit_sha = json_str(&new_commit, &["sha"])?;

        self.call_ok(
            Method::PATCH,
            &format!("git/refs/heads/{}", branch),
            Some(&json!({ "sha": commit_sha, "force": false })),
        )
        .await?;
        tracing::info!(%branch, commit = %commit_sha, "committed submission");

        let (pr_url, created) = self.open_pull_request(&branch, base, bundle).await?;
        let message = if created {
            "Pull request created".to_string()
        } else {
            "A pull request already exists for this branch; it now includes the new commit"
                .to_string()
        };

        Ok(PublishReceipt {
            target: self.name().to_string(),
            message,
            url: Some(pr_url),
            paths,
        })
    }

    async fn health_check(&self) -> Result<String, UploadError> {
        let url = format!(
            "{}/repos/{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.owner,
            self.config.repo
        );
        let resp = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;
        if resp.status().is_success() {
            Ok(format!("repository {}/{} reachable", self.config.owner, self.config.repo))
        } else {
            Err(UploadError::transport(format!(
                "repository {}/{} answered {}",
                self.config.owner,
                self.config.repo,
                resp.status()
            )))
        }
    }
}

fn display_title(title: &str) -> &str {
    if title.trim().is_empty() {
        "New summary"
    } else {
        title
    }
}

fn pull_request_body(bundle: &PublishBundle) -> String {
    let meta = &bundle.meta;
    let status = if meta.draft {
        "This summary is a draft."
    } else {
        "This summary is ready for review."
    };
    let mut body = format!(
        "This pull request was opened automatically after a new summary was submitted.\n\n{}\n\n### Details\n",
        status
    );
    body.push_str(&format!("- title: {}\n", display_title(&meta.title)));
    body.push_str(&format!("- contributor: {}\n", meta.contributor));
    body.push_str(&format!("- lastModification: {}\n", meta.last_modification));
    for file in bundle.files() {
        body.push_str(&format!("- file: `{}`\n", file.path));
    }
    body
}

fn json_str(json: &Value, path: &[&str]) -> Result<String, UploadError> {
    let mut cur = json;
    for key in path {
        cur = cur.get(key).ok_or_else(|| {
            UploadError::transport(format!("unexpected GitHub response: missing {}", path.join(".")))
        })?;
    }
    cur.as_str().map(str::to_string).ok_or_else(|| {
        UploadError::transport(format!("unexpected GitHub response: {} is not a string", path.join(".")))
    })
}

fn api_error(method: &Method, path: &str, status: StatusCode, json: &Value) -> UploadError {
    let detail = json
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| json.to_string());
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return UploadError::configuration(format!(
            "GitHub rejected the token ({} {}): {}",
            method, path, detail
        ));
    }
    UploadError::transport(format!("GitHub {} {} failed with {}: {}", method, path, status, detail))
}
