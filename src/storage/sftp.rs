//! SFTP publisher.
//!
//! Files are written to `<base_path>/<environment>/<relative path>` on the
//! remote host, creating missing directories along the way. `ssh2` is
//! blocking, so each publish runs on the blocking thread pool with its own
//! session.

use async_trait::async_trait;
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{check_path, Layout, PublishBundle, PublishReceipt, Publisher};
use crate::config::{Environment, SftpConfig};
use crate::error::UploadError;
use crate::progress::{ProgressEvent, ProgressReporter, Step};

#[derive(Clone)]
pub enum SftpAuth {
    PrivateKey(PathBuf),
    Password(String),
}

impl std::fmt::Debug for SftpAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SftpAuth::PrivateKey(path) => write!(f, "PrivateKey({})", path.display()),
            SftpAuth::Password(_) => write!(f, "Password(***)"),
        }
    }
}

pub struct SftpPublisher {
    config: SftpConfig,
    auth: SftpAuth,
    environment: Environment,
    layout: Layout,
}

impl SftpPublisher {
    pub fn new(config: SftpConfig, auth: SftpAuth, environment: Environment, layout: Layout) -> Self {
        Self {
            config,
            auth,
            environment,
            layout,
        }
    }

    /// Remote directory every file of this environment is written under.
    pub fn remote_root(&self) -> String {
        remote_path(&self.config.base_path, self.environment.as_str(), "")
    }
}

/// Join `base/environment/relative` with `/`, collapsing duplicate slashes.
pub fn remote_path(base: &str, environment: &str, relative: &str) -> String {
    let parts: Vec<&str> = [base, environment, relative]
        .iter()
        .flat_map(|p| p.split('/'))
        .filter(|p| !p.is_empty())
        .collect();
    format!("/{}", parts.join("/"))
}

fn ssh_err(context: &str, err: impl std::fmt::Display) -> UploadError {
    UploadError::transport(format!("SFTP {}: {}", context, err))
}

fn connect(config: &SftpConfig, auth: &SftpAuth) -> Result<ssh2::Session, UploadError> {
    let timeout = Duration::from_secs(config.timeout_secs);
    let addr = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| ssh_err("resolve", e))?
        .next()
        .ok_or_else(|| UploadError::transport(format!("SFTP host {} did not resolve", config.host)))?;
    let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| ssh_err("connect", e))?;

    let mut session = ssh2::Session::new().map_err(|e| ssh_err("session", e))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
    session.handshake().map_err(|e| ssh_err("handshake", e))?;

    match auth {
        SftpAuth::PrivateKey(key) => session
            .userauth_pubkey_file(&config.username, None, key, None)
            .map_err(|e| ssh_err("key authentication", e))?,
        SftpAuth::Password(password) => session
            .userauth_password(&config.username, password)
            .map_err(|e| ssh_err("password authentication", e))?,
    }
    if !session.authenticated() {
        return Err(UploadError::configuration(format!(
            "SFTP authentication rejected for {}@{}",
            config.username, config.host
        )));
    }
    Ok(session)
}

/// `mkdir -p` over SFTP.
fn ensure_dir(sftp: &ssh2::Sftp, dir: &str) -> Result<(), UploadError> {
    let mut current = String::new();
    for part in dir.split('/').filter(|p| !p.is_empty()) {
        current.push('/');
        current.push_str(part);
        let path = Path::new(&current);
        if sftp.stat(path).is_err() {
            sftp.mkdir(path, 0o755)
                .map_err(|e| ssh_err(&format!("mkdir {}", current), e))?;
        }
    }
    Ok(())
}

fn upload_files(
    config: &SftpConfig,
    auth: &SftpAuth,
    files: &[(String, Vec<u8>)],
) -> Result<(), UploadError> {
    let session = connect(config, auth)?;
    let sftp = session.sftp().map_err(|e| ssh_err("subsystem", e))?;

    for (remote, content) in files {
        if let Some((dir, _)) = remote.rsplit_once('/') {
            ensure_dir(&sftp, dir)?;
        }
        let mut file = sftp
            .create(Path::new(remote))
            .map_err(|e| ssh_err(&format!("create {}", remote), e))?;
        file.write_all(content)
            .map_err(|e| ssh_err(&format!("write {}", remote), e))?;
        tracing::debug!(%remote, bytes = content.len(), "uploaded over SFTP");
    }
    Ok(())
}

#[async_trait]
impl Publisher for SftpPublisher {
    fn name(&self) -> &str {
        "sftp"
    }

    fn description(&self) -> String {
        format!(
            "SFTP {}@{}:{}{}",
            self.config.username,
            self.config.host,
            self.config.port,
            self.remote_root()
        )
    }

    async fn publish(
        &self,
        bundle: &PublishBundle,
        reporter: &dyn ProgressReporter,
    ) -> Result<PublishReceipt, UploadError> {
        let allowed = self.layout.allowed_dirs();
        let mut paths = Vec::new();
        let mut files = Vec::new();
        for file in bundle.files() {
            let rel = check_path(&file.path, &allowed)?;
            let remote = remote_path(&self.config.base_path, self.environment.as_str(), &rel);
            files.push((remote, file.content.clone()));
            paths.push(rel);
        }

        reporter.report(ProgressEvent::info(
            Step::Upload,
            format!("Uploading {} file(s) to {}", files.len(), self.config.host),
        ));

        let config = self.config.clone();
        let auth = self.auth.clone();
        let written = files.clone();
        tokio::task::spawn_blocking(move || upload_files(&config, &auth, &written))
            .await
            .map_err(|e| UploadError::transport(format!("SFTP task failed: {}", e)))??;

        let root = self.remote_root();
        tracing::info!(host = %self.config.host, %root, files = files.len(), "published over SFTP");
        Ok(PublishReceipt {
            target: self.name().to_string(),
            message: format!("Uploaded to {}:{}", self.config.host, root),
            url: None,
            paths,
        })
    }

    async fn health_check(&self) -> Result<String, UploadError> {
        let config = self.config.clone();
        let auth = self.auth.clone();
        let root = self.remote_root();
        let stat_path = root.clone();
        tokio::task::spawn_blocking(move || -> Result<(), UploadError> {
            let session = connect(&config, &auth)?;
            let sftp = session.sftp().map_err(|e| ssh_err("subsystem", e))?;
            sftp.stat(Path::new(&stat_path))
                .map_err(|e| ssh_err(&format!("stat {}", stat_path), e))?;
            Ok(())
        })
        .await
        .map_err(|e| UploadError::transport(format!("SFTP task failed: {}", e)))??;
        Ok(format!("{} reachable", root))
    }
}
