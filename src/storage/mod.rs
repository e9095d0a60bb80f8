//! Storage backends a validated note is published to.
//!
//! Every backend implements [`Publisher`]. The workflow builds the enabled
//! ones with [`build_publishers`], in the order listed in
//! `storage.targets`, and runs them one after the other.
//!
//! | Target | Backend | What "publish" means |
//! |--------|---------|----------------------|
//! | `github` | [`github::GitHubPublisher`] | One commit on an upload branch + pull request |
//! | `sftp` | [`sftp::SftpPublisher`] | Files written under `<base_path>/<environment>/` |
//! | `local` | [`local::LocalPublisher`] | Files written under a local site checkout |

pub mod github;
pub mod local;
pub mod sftp;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{Config, Secrets, StorageConfig, TargetKind};
use crate::error::UploadError;
use crate::progress::ProgressReporter;

/// A file to publish, addressed by its repository-relative path.
#[derive(Debug, Clone)]
pub struct PublishFile {
    pub path: String,
    pub content: Vec<u8>,
}

/// Metadata describing a submission, used in commit messages and PRs.
#[derive(Debug, Clone)]
pub struct PublishMeta {
    pub title: String,
    pub contributor: String,
    pub last_modification: String,
    pub draft: bool,
}

#[derive(Debug, Clone)]
pub struct PublishBundle {
    pub note: PublishFile,
    pub cover: Option<PublishFile>,
    pub meta: PublishMeta,
}

impl PublishBundle {
    /// Cover first so a note never lands before the image it points to.
    pub fn files(&self) -> Vec<&PublishFile> {
        self.cover.iter().chain(std::iter::once(&self.note)).collect()
    }
}

/// Result of a successful publish on one target.
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    pub target: String,
    pub message: String,
    /// Where the result can be reviewed (pull request, remote path...).
    pub url: Option<String>,
    pub paths: Vec<String>,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Target name as written in `storage.targets`.
    fn name(&self) -> &str;

    /// One-line description for logs and health output.
    fn description(&self) -> String;

    async fn publish(
        &self,
        bundle: &PublishBundle,
        reporter: &dyn ProgressReporter,
    ) -> Result<PublishReceipt, UploadError>;

    /// Check that the backend is reachable with the configured credentials.
    async fn health_check(&self) -> Result<String, UploadError>;
}

/// Where notes and covers go, and the public URL covers are served from.
#[derive(Debug, Clone)]
pub struct Layout {
    pub notes_dir: String,
    pub covers_dir: String,
    pub cover_url_prefix: String,
}

impl From<&StorageConfig> for Layout {
    fn from(cfg: &StorageConfig) -> Self {
        Self {
            notes_dir: cfg.notes_dir.trim_matches('/').to_string(),
            covers_dir: cfg.covers_dir.trim_matches('/').to_string(),
            cover_url_prefix: cfg.cover_url_prefix.trim_end_matches('/').to_string(),
        }
    }
}

impl Layout {
    pub fn note_path(&self, file_name: &str) -> String {
        join_dir(&self.notes_dir, file_name)
    }

    pub fn cover_file_name(stem: &str, ext: &str) -> String {
        format!("{}.{}", stem, ext)
    }

    pub fn cover_path(&self, cover_name: &str) -> String {
        join_dir(&self.covers_dir, cover_name)
    }

    pub fn cover_url(&self, cover_name: &str) -> String {
        format!("{}/{}", self.cover_url_prefix, cover_name)
    }

    /// Directories a publisher may write to, optionally with a sub-directory.
    pub fn allowed_dirs(&self) -> [&str; 2] {
        [self.notes_dir.as_str(), self.covers_dir.as_str()]
    }
}

fn join_dir(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Reject paths that escape the allowed directories.
///
/// Backslashes are normalised to `/`. Absolute paths, `..` and `.`
/// components and empty components are refused.
pub fn check_path(path: &str, allowed_dirs: &[&str]) -> Result<String, UploadError> {
    let normalized = path.replace('\\', "/");
    let invalid = || UploadError::field("path", format!("invalid file path: {}", path));

    if normalized.starts_with('/') || normalized.is_empty() {
        return Err(invalid());
    }
    if normalized
        .split('/')
        .any(|c| c.is_empty() || c == ".." || c == ".")
    {
        return Err(invalid());
    }
    let inside = allowed_dirs.iter().any(|dir| {
        let dir = dir.trim_matches('/');
        normalized
            .strip_prefix(dir)
            .map(|rest| rest.starts_with('/'))
            .unwrap_or(false)
    });
    if !inside {
        return Err(invalid());
    }
    Ok(normalized)
}

/// Build the configured publishers in order.
///
/// A target whose credentials are missing from the environment yields
/// [`UploadError::Configuration`].
pub fn build_publishers(
    config: &Config,
    secrets: &Secrets,
) -> Result<Vec<Arc<dyn Publisher>>, UploadError> {
    let layout = Layout::from(&config.storage);
    let environment = config.site.environment;
    let mut publishers: Vec<Arc<dyn Publisher>> = Vec::new();

    for target in &config.storage.targets {
        let missing_section =
            || UploadError::configuration(format!("[storage.{}] is missing", target.as_str()));
        match target {
            TargetKind::Github => {
                let gh = config.storage.github.as_ref().ok_or_else(missing_section)?;
                let token = secrets
                    .github_token
                    .clone()
                    .ok_or_else(|| UploadError::configuration("GITHUB_TOKEN is not set"))?;
                publishers.push(Arc::new(github::GitHubPublisher::new(
                    gh.clone(),
                    token,
                    environment,
                    layout.clone(),
                )?));
            }
            TargetKind::Sftp => {
                let sftp = config.storage.sftp.as_ref().ok_or_else(missing_section)?;
                let auth = match (&sftp.private_key_path, &secrets.sftp_password) {
                    (Some(key), _) => sftp::SftpAuth::PrivateKey(key.clone()),
                    (None, Some(pw)) => sftp::SftpAuth::Password(pw.clone()),
                    (None, None) => {
                        return Err(UploadError::configuration(
                            "no SFTP authentication configured: set storage.sftp.private_key_path or SFTP_PASSWORD",
                        ))
                    }
                };
                publishers.push(Arc::new(sftp::SftpPublisher::new(
                    sftp.clone(),
                    auth,
                    environment,
                    layout.clone(),
                )));
            }
            TargetKind::Local => {
                let local = config.storage.local.as_ref().ok_or_else(missing_section)?;
                publishers.push(Arc::new(local::LocalPublisher::new(
                    local.root.clone(),
                    layout.clone(),
                )));
            }
        }
    }

    Ok(publishers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    fn layout() -> Layout {
        Layout {
            notes_dir: "src/summaries".into(),
            covers_dir: "public/img".into(),
            cover_url_prefix: "/img".into(),
        }
    }

    #[test]
    fn layout_paths() {
        let l = layout();
        assert_eq!(l.note_path("dune.md"), "src/summaries/dune.md");
        let cover = Layout::cover_file_name("dune", "png");
        assert_eq!(l.cover_path(&cover), "public/img/dune.png");
        assert_eq!(l.cover_url(&cover), "/img/dune.png");
    }

    #[test]
    fn path_checks() {
        let l = layout();
        let dirs = l.allowed_dirs();
        assert_eq!(
            check_path("src\\summaries\\dune.md", &dirs).unwrap(),
            "src/summaries/dune.md"
        );
        assert!(check_path("public/img/x.png", &dirs).is_ok());
        assert!(check_path("src/summaries/../../etc/passwd", &dirs).is_err());
        assert!(check_path("/src/summaries/dune.md", &dirs).is_err());
        assert!(check_path("src/summaries-evil/dune.md", &dirs).is_err());
        assert!(check_path("README.md", &dirs).is_err());
    }

    #[test]
    fn bundle_lists_cover_first() {
        let bundle = PublishBundle {
            note: PublishFile {
                path: "n".into(),
                content: vec![],
            },
            cover: Some(PublishFile {
                path: "c".into(),
                content: vec![],
            }),
            meta: PublishMeta {
                title: "t".into(),
                contributor: "c".into(),
                last_modification: "d".into(),
                draft: false,
            },
        };
        let paths: Vec<&str> = bundle.files().iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["c", "n"]);
    }

    #[test]
    fn missing_token_is_a_configuration_error() {
        let cfg = parse_config(
            "[storage]\ntargets = [\"github\"]\n[storage.github]\nowner = \"o\"\nrepo = \"r\"\n",
        )
        .unwrap();
        let err = build_publishers(&cfg, &Secrets::default()).err().unwrap();
        assert!(matches!(err, UploadError::Configuration(_)));
        assert!(err.to_string().contains("GITHUB_TOKEN"));
    }

    #[test]
    fn sftp_needs_some_auth() {
        let cfg = parse_config(
            "[storage]\ntargets = [\"sftp\"]\n[storage.sftp]\nhost = \"h\"\nusername = \"u\"\n",
        )
        .unwrap();
        assert!(matches!(
            build_publishers(&cfg, &Secrets::default()),
            Err(UploadError::Configuration(_))
        ));
        let secrets = Secrets {
            sftp_password: Some("pw".into()),
            ..Secrets::default()
        };
        let pubs = build_publishers(&cfg, &secrets).unwrap();
        assert_eq!(pubs[0].name(), "sftp");
    }

    #[test]
    fn builds_targets_in_order() {
        let cfg = parse_config(
            "[storage]\ntargets = [\"local\", \"github\"]\n[storage.local]\nroot = \".\"\n[storage.github]\nowner = \"o\"\nrepo = \"r\"\n",
        )
        .unwrap();
        let secrets = Secrets {
            github_token: Some("t".into()),
            ..Secrets::default()
        };
        let names: Vec<String> = build_publishers(&cfg, &secrets)
            .unwrap()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(names, vec!["local", "github"]);
    }
}
