//! Local filesystem publisher, for a site checkout on the same machine.

use async_trait::async_trait;
use std::path::PathBuf;

use super::{check_path, Layout, PublishBundle, PublishReceipt, Publisher};
use crate::error::UploadError;
use crate::progress::{ProgressEvent, ProgressReporter, Step};

pub struct LocalPublisher {
    root: PathBuf,
    layout: Layout,
}

impl LocalPublisher {
    pub fn new(root: PathBuf, layout: Layout) -> Self {
        Self { root, layout }
    }
}

#[async_trait]
impl Publisher for LocalPublisher {
    fn name(&self) -> &str {
        "local"
    }

    fn description(&self) -> String {
        format!("local directory {}", self.root.display())
    }

    async fn publish(
        &self,
        bundle: &PublishBundle,
        reporter: &dyn ProgressReporter,
    ) -> Result<PublishReceipt, UploadError> {
        let allowed = self.layout.allowed_dirs();
        let files = bundle.files();
        let checked = files
            .iter()
            .map(|f| check_path(&f.path, &allowed))
            .collect::<Result<Vec<_>, _>>()?;

        let mut paths = Vec::new();
        for (file, rel) in files.iter().zip(checked) {
            let dest = self.root.join(&rel);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&dest, &file.content).await?;
            tracing::debug!(path = %dest.display(), "wrote file");
            paths.push(rel);
        }

        reporter.report(ProgressEvent::info(
            Step::Upload,
            format!("Wrote {} file(s) under {}", paths.len(), self.root.display()),
        ));

        Ok(PublishReceipt {
            target: self.name().to_string(),
            message: format!("Written to {}", self.root.display()),
            url: None,
            paths,
        })
    }

    async fn health_check(&self) -> Result<String, UploadError> {
        let meta = tokio::fs::metadata(&self.root).await.map_err(|e| {
            UploadError::configuration(format!("{}: {}", self.root.display(), e))
        })?;
        if !meta.is_dir() {
            return Err(UploadError::configuration(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        let marker = self.root.join(".press-write-check");
        tokio::fs::write(&marker, b"ok").await.map_err(|e| {
            UploadError::configuration(format!("{} is not writable: {}", self.root.display(), e))
        })?;
        tokio::fs::remove_file(&marker).await?;
        Ok(format!("{} is writable", self.root.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::CollectProgress;
    use crate::storage::{PublishFile, PublishMeta};
    use tempfile::TempDir;

    fn layout() -> Layout {
        Layout {
            notes_dir: "src/summaries".into(),
            covers_dir: "public/img".into(),
            cover_url_prefix: "/img".into(),
        }
    }

    fn bundle(note_path: &str) -> PublishBundle {
        PublishBundle {
            note: PublishFile {
                path: note_path.into(),
                content: b"---\nbookTitle: Dune\n---\n".to_vec(),
            },
            cover: Some(PublishFile {
                path: "public/img/dune.png".into(),
                content: vec![0x89, b'P', b'N', b'G'],
            }),
            meta: PublishMeta {
                title: "Dune".into(),
                contributor: "Ada".into(),
                last_modification: "2024-01-01T00:00:00.000Z".into(),
                draft: false,
            },
        }
    }

    #[tokio::test]
    async fn writes_note_and_cover() {
        let tmp = TempDir::new().unwrap();
        let publisher = LocalPublisher::new(tmp.path().to_path_buf(), layout());
        let progress = CollectProgress::default();

        let receipt = publisher
            .publish(&bundle("src/summaries/dune.md"), &progress)
            .await
            .unwrap();

        assert_eq!(receipt.paths, vec!["public/img/dune.png", "src/summaries/dune.md"]);
        let note = std::fs::read_to_string(tmp.path().join("src/summaries/dune.md")).unwrap();
        assert!(note.contains("Dune"));
        assert!(tmp.path().join("public/img/dune.png").exists());
        assert_eq!(progress.events().len(), 1);
    }

    #[tokio::test]
    async fn refuses_paths_outside_layout() {
        let tmp = TempDir::new().unwrap();
        let publisher = LocalPublisher::new(tmp.path().to_path_buf(), layout());
        let err = publisher
            .publish(&bundle("src/summaries/../../evil.md"), &CollectProgress::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[tokio::test]
    async fn health_check_needs_existing_dir() {
        let tmp = TempDir::new().unwrap();
        let ok = LocalPublisher::new(tmp.path().to_path_buf(), layout());
        assert!(ok.health_check().await.is_ok());
        let missing = LocalPublisher::new(tmp.path().join("nope"), layout());
        assert_eq!(missing.health_check().await.unwrap_err().code(), "configuration");
    }

    #[tokio::test]
    async fn health_check_writes_and_cleans_up() {
        let tmp = TempDir::new().unwrap();
        let publisher = LocalPublisher::new(tmp.path().to_path_buf(), layout());
        let msg = publisher.health_check().await.unwrap();
        assert!(msg.ends_with("is writable"));
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);

        let file = tmp.path().join("site.txt");
        std::fs::write(&file, "x").unwrap();
        let not_dir = LocalPublisher::new(file, layout());
        assert_eq!(not_dir.health_check().await.unwrap_err().code(), "configuration");
    }
}
