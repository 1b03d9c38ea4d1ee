use std::path::{Path, PathBuf};

use anyhow::Context;
use bytes::Bytes;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::storage::StorageClient;

/// A request file written to the local upload directory, waiting to be
/// pushed to object storage. The file is removed when the handle drops, so
/// every exit path releases the local stage.
pub struct StagedFile {
    path: PathBuf,
    content_type: String,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "staged file removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, path = %self.path.display(), "failed to remove staged file"),
        }
    }
}

/// Write an incoming form field to the upload directory.
pub async fn stage_upload(
    dir: &Path,
    field_name: &str,
    content_type: &str,
    body: Bytes,
) -> anyhow::Result<StagedFile> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("create upload dir {}", dir.display()))?;
    let ext = ext_from_mime(content_type).unwrap_or("bin");
    let path = dir.join(format!("{}-{}.{}", field_name, Uuid::new_v4(), ext));
    tokio::fs::write(&path, &body)
        .await
        .with_context(|| format!("stage upload to {}", path.display()))?;
    Ok(StagedFile {
        path,
        content_type: content_type.to_string(),
    })
}

#[derive(Debug, Clone)]
pub struct UploadedAsset {
    pub url: String,
    pub key: String,
}

/// Push a staged file to object storage. Returns `None` when the file
/// cannot be read or the transfer fails; callers decide whether "no result"
/// is fatal. The local file is gone by the time this returns, on every path.
pub async fn upload_staged(
    storage: &dyn StorageClient,
    prefix: &str,
    staged: StagedFile,
) -> Option<UploadedAsset> {
    let bytes = match tokio::fs::read(staged.path()).await {
        Ok(b) => Bytes::from(b),
        Err(e) => {
            warn!(error = %e, path = %staged.path().display(), "staged file unreadable");
            return None;
        }
    };

    let file_name = staged
        .path()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let key = format!("{}/{}", prefix, file_name);

    match storage.put_object(&key, bytes, staged.content_type()).await {
        Ok(()) => {
            debug!(%key, "asset uploaded");
            Some(UploadedAsset {
                url: storage.object_url(&key),
                key,
            })
        }
        Err(e) => {
            error!(error = %e, %key, "asset upload failed");
            None
        }
    }
}

fn ext_from_mime(ct: &str) -> Option<&'static str> {
    match ct {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct OkStorage;

    #[async_trait]
    impl StorageClient for OkStorage {
        async fn put_object(&self, _k: &str, _b: Bytes, _ct: &str) -> anyhow::Result<()> {
            Ok(())
        }
        fn object_url(&self, key: &str) -> String {
            format!("https://cdn.test/{}", key)
        }
    }

    struct FailStorage {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StorageClient for FailStorage {
        async fn put_object(&self, _k: &str, _b: Bytes, _ct: &str) -> anyhow::Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("transfer refused")
        }
        fn object_url(&self, key: &str) -> String {
            format!("https://cdn.test/{}", key)
        }
    }

    fn test_dir() -> PathBuf {
        std::env::temp_dir().join("vidtube-upload-tests")
    }

    #[tokio::test]
    async fn upload_returns_url_and_removes_local_file() {
        let staged = stage_upload(&test_dir(), "avatar", "image/png", Bytes::from_static(b"png"))
            .await
            .expect("stage");
        let path = staged.path().to_path_buf();
        assert!(path.exists());

        let asset = upload_staged(&OkStorage, "avatars", staged)
            .await
            .expect("upload should succeed");
        assert!(asset.url.starts_with("https://cdn.test/avatars/"));
        assert!(asset.url.ends_with(".png"));
        assert!(asset.key.starts_with("avatars/avatar-"));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn failed_upload_still_removes_local_file() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let storage = FailStorage {
            attempts: attempts.clone(),
        };
        let staged = stage_upload(&test_dir(), "cover", "image/jpeg", Bytes::from_static(b"jpg"))
            .await
            .expect("stage");
        let path = staged.path().to_path_buf();

        let asset = upload_staged(&storage, "covers", staged).await;
        assert!(asset.is_none());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn missing_staged_file_yields_none() {
        let staged = stage_upload(&test_dir(), "avatar", "image/png", Bytes::from_static(b"png"))
            .await
            .expect("stage");
        std::fs::remove_file(staged.path()).expect("remove before upload");

        let asset = upload_staged(&OkStorage, "avatars", staged).await;
        assert!(asset.is_none());
    }

    #[test]
    fn ext_from_mime_covers_known_types() {
        assert_eq!(ext_from_mime("image/jpeg"), Some("jpg"));
        assert_eq!(ext_from_mime("image/png"), Some("png"));
        assert_eq!(ext_from_mime("image/webp"), Some("webp"));
        assert_eq!(ext_from_mime("application/octet-stream"), None);
    }
}
