//! Temporary store for silent uploads.
//!
//! A silently uploaded note is kept on disk as `<uuid>--<original name>` so
//! the final submission can refer to it by id instead of sending it again.
//! Entries are kept even when validation failed, and are swept once older
//! than the configured TTL.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

const SEPARATOR: &str = "--";

#[derive(Debug, Clone)]
pub struct TempStore {
    dir: PathBuf,
    ttl: Duration,
}

/// A note loaded back from the store.
#[derive(Debug, Clone)]
pub struct TempNote {
    pub id: Uuid,
    pub file_name: String,
    pub content: Vec<u8>,
}

impl TempStore {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store a note and return its id.
    pub async fn save(&self, file_name: &str, content: &[u8]) -> Result<Uuid> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create temp directory: {}", self.dir.display()))?;

        if let Err(e) = self.sweep().await {
            tracing::warn!(error = %e, "temp upload sweep failed");
        }

        let id = Uuid::new_v4();
        let safe_name = sanitize_name(file_name);
        let path = self.dir.join(format!("{}{}{}", id, SEPARATOR, safe_name));
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write temp upload: {}", path.display()))?;
        Ok(id)
    }

    async fn find(&self, id: &str) -> Result<Option<(Uuid, PathBuf, String)>> {
        let Ok(id) = Uuid::parse_str(id) else {
            bail!("invalid upload id: {}", id);
        };
        let prefix = format!("{}{}", id, SEPARATOR);

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(original) = name.strip_prefix(&prefix) {
                return Ok(Some((id, entry.path(), original.to_string())));
            }
        }
        Ok(None)
    }

    /// Load a note by id. `Ok(None)` when no entry exists.
    pub async fn load(&self, id: &str) -> Result<Option<TempNote>> {
        let Some((id, path, file_name)) = self.find(id).await? else {
            return Ok(None);
        };
        let content = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read temp upload: {}", path.display()))?;
        Ok(Some(TempNote {
            id,
            file_name,
            content,
        }))
    }

    pub async fn remove(&self, id: &str) -> Result<bool> {
        match self.find(id).await? {
            Some((_, path, _)) => {
                tokio::fs::remove_file(&path).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Delete entries older than the TTL. Returns how many were removed.
    pub async fn sweep(&self) -> Result<usize> {
        let mut removed = 0;
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let now = SystemTime::now();
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age > self.ttl {
                tokio::fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "swept expired temp uploads");
        }
        Ok(removed)
    }
}

/// Keep only the final path component and characters safe in file names.
fn sanitize_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "note.md".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn save_then_load_keeps_name() {
        let tmp = TempDir::new().unwrap();
        let store = TempStore::new(tmp.path().join("uploads"), Duration::from_secs(60));
        let id = store.save("dune.md", b"---\nx: 1\n---\n").await.unwrap();
        let note = store.load(&id.to_string()).await.unwrap().unwrap();
        assert_eq!(note.file_name, "dune.md");
        assert_eq!(note.content, b"---\nx: 1\n---\n");
        assert!(store.remove(&id.to_string()).await.unwrap());
        assert!(store.load(&id.to_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_non_uuid_ids() {
        let tmp = TempDir::new().unwrap();
        let store = TempStore::new(tmp.path(), Duration::from_secs(60));
        assert!(store.load("../../etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn missing_dir_means_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = TempStore::new(tmp.path().join("nope"), Duration::from_secs(60));
        let id = Uuid::new_v4().to_string();
        assert!(store.load(&id).await.unwrap().is_none());
        assert_eq!(store.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sweep_removes_expired() {
        let tmp = TempDir::new().unwrap();
        let store = TempStore::new(tmp.path(), Duration::ZERO);
        store.save("a.md", b"a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.sweep().await.unwrap(), 1);
    }

    #[test]
    fn sanitizes_names() {
        assert_eq!(sanitize_name("../../x.md"), "x.md");
        assert_eq!(sanitize_name("my note.md"), "my_note.md");
        assert_eq!(sanitize_name(".."), "note.md");
    }
}
