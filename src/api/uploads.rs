//! Upload validation and storage.
//!
//! Validation is MIME-allowlist based with a size limit per class of file.
//! Storage is a provider switch: `local` writes under the configured upload
//! root as `{owner_type}/{owner_id}/{uuid}.{ext}`; the cloud providers are
//! recognized but unimplemented and fail loudly instead of silently falling
//! back to local disk.

use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const IMAGE_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/svg+xml",
];

pub const VIDEO_TYPES: &[&str] = &[
    "video/mp4",
    "video/mpeg",
    "video/quicktime",
    "video/x-msvideo",
    "video/webm",
];

pub const DOCUMENT_TYPES: &[&str] = &[
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "text/plain",
];

pub const IMAGE_MAX_BYTES: u64 = 10 * 1024 * 1024;
pub const VIDEO_MAX_BYTES: u64 = 100 * 1024 * 1024;
pub const DOCUMENT_MAX_BYTES: u64 = 25 * 1024 * 1024;
pub const DEFAULT_MAX_BYTES: u64 = 50 * 1024 * 1024;

/// Size limit for a MIME type, by class.
#[must_use]
pub fn size_limit_for(mime_type: &str) -> u64 {
    if IMAGE_TYPES.contains(&mime_type) {
        IMAGE_MAX_BYTES
    } else if VIDEO_TYPES.contains(&mime_type) {
        VIDEO_MAX_BYTES
    } else if DOCUMENT_TYPES.contains(&mime_type) {
        DOCUMENT_MAX_BYTES
    } else {
        DEFAULT_MAX_BYTES
    }
}

fn allowed_mime(mime_type: &str) -> bool {
    IMAGE_TYPES.contains(&mime_type)
        || VIDEO_TYPES.contains(&mime_type)
        || DOCUMENT_TYPES.contains(&mime_type)
}

/// Why a file was rejected before touching storage.
#[derive(Debug, PartialEq, Eq)]
pub enum UploadError {
    MissingFileName,
    UnsupportedType { mime_type: String },
    TooLarge { size_bytes: u64, limit_bytes: u64 },
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingFileName => write!(f, "The uploaded file has no file name."),
            Self::UnsupportedType { mime_type } => {
                write!(f, "The file type '{mime_type}' is not allowed.")
            }
            Self::TooLarge {
                size_bytes,
                limit_bytes,
            } => {
                let size_mb = *size_bytes as f64 / (1024.0 * 1024.0);
                let limit_mb = limit_bytes / (1024 * 1024);
                write!(
                    f,
                    "The file is too large ({size_mb:.1} MB). Maximum size for this type is {limit_mb} MB."
                )
            }
        }
    }
}

impl std::error::Error for UploadError {}

/// Check name, MIME type, and size against the allowlists.
pub fn validate_upload(
    file_name: Option<&str>,
    mime_type: &str,
    size_bytes: u64,
) -> std::result::Result<(), UploadError> {
    let name = file_name.map(str::trim).unwrap_or_default();
    if name.is_empty() {
        return Err(UploadError::MissingFileName);
    }
    if !allowed_mime(mime_type) {
        return Err(UploadError::UnsupportedType {
            mime_type: mime_type.to_string(),
        });
    }
    let limit_bytes = size_limit_for(mime_type);
    if size_bytes > limit_bytes {
        return Err(UploadError::TooLarge {
            size_bytes,
            limit_bytes,
        });
    }
    Ok(())
}

/// Extension from the original file name, lowercased, without the dot.
#[must_use]
pub fn file_extension(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageProvider {
    Local,
    GoogleDrive,
    OneDrive,
}

impl StorageProvider {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::GoogleDrive => "google_drive",
            Self::OneDrive => "onedrive",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "local" => Some(Self::Local),
            "google_drive" => Some(Self::GoogleDrive),
            "onedrive" => Some(Self::OneDrive),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct UploadConfig {
    root: PathBuf,
}

impl UploadConfig {
    #[must_use]
    pub fn new(root: String) -> Self {
        Self {
            root: PathBuf::from(root),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// A file written to storage, ready to be recorded in `file_uploads`.
#[derive(Clone, Debug)]
pub struct StoredFile {
    pub stored_name: String,
    pub file_path: String,
    pub provider: StorageProvider,
}

/// Write file bytes through the chosen provider.
///
/// Only `local` is implemented: `{root}/{owner_type}/{owner_id}/{uuid}.{ext}`.
/// Thumbnails are not generated anywhere yet, so `thumbnail_path` stays NULL
/// at the call sites.
pub async fn store_file(
    config: &UploadConfig,
    provider: StorageProvider,
    owner_type: &str,
    owner_id: Uuid,
    extension: &str,
    bytes: &[u8],
) -> Result<StoredFile> {
    match provider {
        StorageProvider::Local => {
            let stored_name = if extension.is_empty() {
                Uuid::new_v4().to_string()
            } else {
                format!("{}.{extension}", Uuid::new_v4())
            };
            let relative = PathBuf::from(owner_type)
                .join(owner_id.to_string())
                .join(&stored_name);
            let absolute = config.root().join(&relative);
            if let Some(parent) = absolute.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("failed to create upload directory")?;
            }
            tokio::fs::write(&absolute, bytes)
                .await
                .context("failed to write uploaded file")?;
            Ok(StoredFile {
                stored_name,
                file_path: relative.to_string_lossy().into_owned(),
                provider,
            })
        }
        StorageProvider::GoogleDrive => bail!("Google Drive storage is not configured"),
        StorageProvider::OneDrive => bail!("OneDrive storage is not configured"),
    }
}

/// Best-effort removal of a locally stored file. Cloud providers have nothing
/// on disk to remove.
pub async fn remove_file(config: &UploadConfig, provider: &str, file_path: &str) -> Result<()> {
    if StorageProvider::parse(provider) != Some(StorageProvider::Local) {
        return Ok(());
    }
    let absolute = config.root().join(file_path);
    tokio::fs::remove_file(&absolute)
        .await
        .context("failed to remove stored file")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_follow_mime_class() {
        assert_eq!(size_limit_for("image/png"), IMAGE_MAX_BYTES);
        assert_eq!(size_limit_for("video/mp4"), VIDEO_MAX_BYTES);
        assert_eq!(size_limit_for("application/pdf"), DOCUMENT_MAX_BYTES);
        assert_eq!(size_limit_for("application/zip"), DEFAULT_MAX_BYTES);
    }

    #[test]
    fn validation_rejects_unknown_type() {
        let err = validate_upload(Some("archive.zip"), "application/zip", 1024).unwrap_err();
        assert_eq!(
            err,
            UploadError::UnsupportedType {
                mime_type: "application/zip".to_string()
            }
        );
    }

    #[test]
    fn validation_rejects_oversized_image() {
        let err =
            validate_upload(Some("photo.png"), "image/png", IMAGE_MAX_BYTES + 1).unwrap_err();
        assert!(matches!(err, UploadError::TooLarge { .. }));
        // A video of the same size is fine.
        assert!(validate_upload(Some("clip.mp4"), "video/mp4", IMAGE_MAX_BYTES + 1).is_ok());
    }

    #[test]
    fn validation_requires_file_name() {
        assert_eq!(
            validate_upload(None, "image/png", 10).unwrap_err(),
            UploadError::MissingFileName
        );
        assert_eq!(
            validate_upload(Some("  "), "image/png", 10).unwrap_err(),
            UploadError::MissingFileName
        );
    }

    #[test]
    fn extension_is_lowercased() {
        assert_eq!(file_extension("Report.PDF"), "pdf");
        assert_eq!(file_extension("noext"), "");
        assert_eq!(file_extension("archive.tar.gz"), "gz");
    }

    #[test]
    fn provider_round_trip() {
        for provider in [
            StorageProvider::Local,
            StorageProvider::GoogleDrive,
            StorageProvider::OneDrive,
        ] {
            assert_eq!(StorageProvider::parse(provider.as_str()), Some(provider));
        }
        assert_eq!(StorageProvider::parse("dropbox"), None);
    }

    #[tokio::test]
    async fn cloud_providers_fail_loudly() {
        let config = UploadConfig::new("/tmp/elevategs-test-uploads".to_string());
        let owner = Uuid::new_v4();
        let result = store_file(
            &config,
            StorageProvider::GoogleDrive,
            "classwork",
            owner,
            "pdf",
            b"data",
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn local_store_writes_under_owner_path() -> anyhow::Result<()> {
        let root = std::env::temp_dir().join(format!("elevategs-uploads-{}", Uuid::new_v4()));
        let config = UploadConfig::new(root.to_string_lossy().into_owned());
        let owner = Uuid::new_v4();
        let stored = store_file(
            &config,
            StorageProvider::Local,
            "classwork",
            owner,
            "txt",
            b"hello",
        )
        .await?;
        assert!(stored.file_path.starts_with("classwork/"));
        assert!(stored.stored_name.ends_with(".txt"));
        let on_disk = root.join(&stored.file_path);
        assert_eq!(tokio::fs::read(&on_disk).await?, b"hello");

        remove_file(&config, "local", &stored.file_path).await?;
        assert!(!on_disk.exists());
        tokio::fs::remove_dir_all(&root).await.ok();
        Ok(())
    }
}
