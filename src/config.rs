//! TOML configuration and environment secrets.
//!
//! Settings live in a TOML file (default `./config/press.toml`). Secrets are
//! never read from the file; [`Secrets::from_env`] collects them from the
//! process environment at startup.
//!
//! # Example
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:4321"
//!
//! [site]
//! url = "https://summaries.example.org"
//! note_path = "/summaries/{slug}"
//! environment = "production"
//!
//! [storage]
//! targets = ["github"]
//!
//! [storage.github]
//! owner = "acme"
//! repo = "summaries"
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Used by |
//! |----------|---------|
//! | `GITHUB_TOKEN` | GitHub publisher |
//! | `SFTP_PASSWORD` | SFTP publisher (unless a private key is configured) |
//! | `NETLIFY_BUILD_HOOK` | Build trigger |
//! | `NETLIFY_SITE_ID`, `NETLIFY_API_TOKEN` | Deploy tracking |
//! | `API_KEYS` | Authenticated endpoints (comma separated) |
//! | `ALLOWED_IMAGE_DOMAINS`, `BLOCKED_IMAGE_DOMAINS` | Image URL checks (comma separated) |

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub deploy: DeployConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:4321".to_string()
}
fn default_max_body_bytes() -> usize {
    8 * 1024 * 1024
}

/// Deployment environment. Selects the GitHub base branch and the SFTP
/// sub-directory.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Preview,
    #[default]
    Development,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Production => "production",
            Environment::Preview => "preview",
            Environment::Development => "development",
        }
    }

    /// Long-lived branch the site is built from in this environment.
    pub fn base_branch(&self) -> &'static str {
        match self {
            Environment::Production => "main",
            Environment::Preview => "staging",
            Environment::Development => "develop",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SiteConfig {
    /// Public site URL. Used to resolve root-relative image URLs and to
    /// build the final note URL.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_note_path")]
    pub note_path: String,
    #[serde(default)]
    pub environment: Environment,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            url: None,
            note_path: default_note_path(),
            environment: Environment::default(),
        }
    }
}

fn default_note_path() -> String {
    "/summaries/{slug}".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    #[serde(default = "default_temp_ttl_secs")]
    pub temp_ttl_secs: u64,
    #[serde(default = "default_max_note_bytes")]
    pub max_note_bytes: usize,
    #[serde(default = "default_max_cover_bytes")]
    pub max_cover_bytes: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            temp_dir: default_temp_dir(),
            temp_ttl_secs: default_temp_ttl_secs(),
            max_note_bytes: default_max_note_bytes(),
            max_cover_bytes: default_max_cover_bytes(),
        }
    }
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("./temp-uploads")
}
fn default_temp_ttl_secs() -> u64 {
    24 * 60 * 60
}
fn default_max_note_bytes() -> usize {
    5 * 1024 * 1024
}
fn default_max_cover_bytes() -> usize {
    2 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ValidationConfig {
    #[serde(default)]
    pub allowed_image_domains: Vec<String>,
    #[serde(default)]
    pub blocked_image_domains: Vec<String>,
    #[serde(default = "default_image_timeout_secs")]
    pub image_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub check_image_reachability: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            allowed_image_domains: Vec::new(),
            blocked_image_domains: Vec::new(),
            image_timeout_secs: default_image_timeout_secs(),
            check_image_reachability: true,
        }
    }
}

fn default_image_timeout_secs() -> u64 {
    5
}
fn default_true() -> bool {
    true
}

/// Storage backend kinds a note can be published to.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Github,
    Sftp,
    Local,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Github => "github",
            TargetKind::Sftp => "sftp",
            TargetKind::Local => "local",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub targets: Vec<TargetKind>,
    #[serde(default = "default_notes_dir")]
    pub notes_dir: String,
    #[serde(default = "default_covers_dir")]
    pub covers_dir: String,
    /// Public URL prefix under which published covers are served.
    #[serde(default = "default_cover_url_prefix")]
    pub cover_url_prefix: String,
    pub github: Option<GitHubConfig>,
    pub sftp: Option<SftpConfig>,
    pub local: Option<LocalConfig>,
}

fn default_notes_dir() -> String {
    "src/summaries".to_string()
}
fn default_covers_dir() -> String {
    "public/img".to_string()
}
fn default_cover_url_prefix() -> String {
    "/img".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct GitHubConfig {
    pub owner: String,
    pub repo: String,
    #[serde(default = "default_github_api")]
    pub api_base: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_github_api() -> String {
    "https://api.github.com".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SftpConfig {
    pub host: String,
    #[serde(default = "default_sftp_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    #[serde(default = "default_sftp_base_path")]
    pub base_path: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_sftp_port() -> u16 {
    22
}
fn default_sftp_base_path() -> String {
    "/prisma".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LocalConfig {
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeployConfig {
    #[serde(default = "default_netlify_api")]
    pub api_base: String,
    /// Poll the deploy API until the triggered deploy finishes.
    #[serde(default = "default_true")]
    pub track: bool,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_deploy_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            api_base: default_netlify_api(),
            track: true,
            poll_interval_secs: default_poll_interval_secs(),
            timeout_secs: default_deploy_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_netlify_api() -> String {
    "https://api.netlify.com/api/v1".to_string()
}
fn default_poll_interval_secs() -> u64 {
    5
}
fn default_deploy_timeout_secs() -> u64 {
    600
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

/// Credentials and other values that only come from the environment.
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    pub github_token: Option<String>,
    pub sftp_password: Option<String>,
    pub build_hook: Option<String>,
    pub netlify_site_id: Option<String>,
    pub netlify_api_token: Option<String>,
    pub api_keys: Vec<String>,
    pub allowed_image_domains: Vec<String>,
    pub blocked_image_domains: Vec<String>,
}

impl Secrets {
    pub fn from_env() -> Self {
        Self {
            github_token: env_non_empty("GITHUB_TOKEN"),
            sftp_password: env_non_empty("SFTP_PASSWORD"),
            build_hook: env_non_empty("NETLIFY_BUILD_HOOK"),
            netlify_site_id: env_non_empty("NETLIFY_SITE_ID"),
            netlify_api_token: env_non_empty("NETLIFY_API_TOKEN"),
            api_keys: env_list("API_KEYS"),
            allowed_image_domains: env_list("ALLOWED_IMAGE_DOMAINS"),
            blocked_image_domains: env_list("BLOCKED_IMAGE_DOMAINS"),
        }
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_list(key: &str) -> Vec<String> {
    env_non_empty(key).map(|v| split_list(&v)).unwrap_or_default()
}

/// Split a comma-separated list, dropping blanks.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    /// Defaults with a local target in the current directory, for commands
    /// that can run without a config file.
    pub fn minimal() -> Self {
        Self {
            server: ServerConfig::default(),
            site: SiteConfig::default(),
            upload: UploadConfig::default(),
            validation: ValidationConfig::default(),
            storage: StorageConfig {
                targets: vec![TargetKind::Local],
                notes_dir: default_notes_dir(),
                covers_dir: default_covers_dir(),
                cover_url_prefix: default_cover_url_prefix(),
                github: None,
                sftp: None,
                local: Some(LocalConfig {
                    root: PathBuf::from("."),
                }),
            },
            deploy: DeployConfig::default(),
        }
    }

    /// Image domain lists with the environment additions merged in.
    pub fn image_domains(&self, secrets: &Secrets) -> (Vec<String>, Vec<String>) {
        let mut allowed = self.validation.allowed_image_domains.clone();
        allowed.extend(secrets.allowed_image_domains.iter().cloned());
        let mut blocked = self.validation.blocked_image_domains.clone();
        blocked.extend(secrets.blocked_image_domains.iter().cloned());
        (allowed, blocked)
    }

    /// Public URL of a published note, if the site URL is known.
    pub fn note_url(&self, slug: &str) -> Option<String> {
        let base = self.site.url.as_ref()?;
        let path = self.site.note_path.replace("{slug}", slug);
        Some(format!(
            "{}/{}",
            base.trim_end_matches('/'),
            path.trim_start_matches('/')
        ))
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = parse_config(&content)?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate storage
    if config.storage.targets.is_empty() {
        bail!("storage.targets must list at least one of github, sftp, local");
    }
    for (i, target) in config.storage.targets.iter().enumerate() {
        if config.storage.targets[..i].contains(target) {
            bail!("storage.targets lists '{}' more than once", target.as_str());
        }
        let present = match target {
            TargetKind::Github => config.storage.github.is_some(),
            TargetKind::Sftp => config.storage.sftp.is_some(),
            TargetKind::Local => config.storage.local.is_some(),
        };
        if !present {
            bail!(
                "storage target '{}' is enabled but [storage.{}] is missing",
                target.as_str(),
                target.as_str()
            );
        }
    }
    if config.storage.notes_dir.trim().is_empty() || config.storage.covers_dir.trim().is_empty() {
        bail!("storage.notes_dir and storage.covers_dir must not be empty");
    }

    // Validate site
    if !config.site.note_path.contains("{slug}") {
        bail!("site.note_path must contain the {{slug}} placeholder");
    }

    // Validate limits
    if config.upload.max_note_bytes == 0 || config.upload.max_cover_bytes == 0 {
        bail!("upload.max_note_bytes and upload.max_cover_bytes must be > 0");
    }
    if config.deploy.poll_interval_secs == 0 {
        bail!("deploy.poll_interval_secs must be > 0");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[storage]
targets = ["local"]

[storage.local]
root = "/tmp/site"
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = parse_config(MINIMAL).unwrap();
        assert_eq!(cfg.server.bind, "127.0.0.1:4321");
        assert_eq!(cfg.upload.max_note_bytes, 5 * 1024 * 1024);
        assert_eq!(cfg.upload.max_cover_bytes, 2 * 1024 * 1024);
        assert_eq!(cfg.storage.notes_dir, "src/summaries");
        assert_eq!(cfg.storage.covers_dir, "public/img");
        assert_eq!(cfg.site.environment, Environment::Development);
        assert_eq!(cfg.validation.image_timeout_secs, 5);
        assert!(cfg.deploy.track);
    }

    #[test]
    fn target_without_section_is_rejected() {
        let err = parse_config("[storage]\ntargets = [\"github\"]\n").unwrap_err();
        assert!(err.to_string().contains("[storage.github]"));
    }

    #[test]
    fn empty_targets_rejected() {
        let err = parse_config("[storage]\ntargets = []\n").unwrap_err();
        assert!(err.to_string().contains("at least one"));
    }

    #[test]
    fn duplicate_targets_rejected() {
        let toml = format!("{}\n", MINIMAL.replace("[\"local\"]", "[\"local\", \"local\"]"));
        let err = parse_config(&toml).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn note_path_needs_slug() {
        let toml = format!("[site]\nnote_path = \"/notes\"\n{}", MINIMAL);
        assert!(parse_config(&toml).is_err());
    }

    #[test]
    fn note_url_joins_site_and_path() {
        let toml = format!("[site]\nurl = \"https://example.org/\"\n{}", MINIMAL);
        let cfg = parse_config(&toml).unwrap();
        assert_eq!(
            cfg.note_url("atomic-habits").as_deref(),
            Some("https://example.org/summaries/atomic-habits")
        );
    }

    #[test]
    fn environment_branches() {
        assert_eq!(Environment::Production.base_branch(), "main");
        assert_eq!(Environment::Preview.base_branch(), "staging");
        assert_eq!(Environment::Development.base_branch(), "develop");
    }

    #[test]
    fn split_list_drops_blanks() {
        assert_eq!(
            split_list("a.com, ,b.org,"),
            vec!["a.com".to_string(), "b.org".to_string()]
        );
    }
}
