//! Storage Adapter - Publishes Rendered Output
//!
//! Persists encoded bytes under `{storageRoot}/files/{kind}/{jobId}/{kind}.png`
//! and mints the public URL the caller serves back to the client. `kind` is
//! always either `"preview"` or `"final"`; both paths exist per job even
//! though the bytes are currently identical (see `pipeline.rs`'s
//! `PREVIEW_EQUALS_FINAL` note).

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ErrorCode, StageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Preview,
    Final,
}

impl OutputKind {
    fn as_str(self) -> &'static str {
        match self {
            OutputKind::Preview => "preview",
            OutputKind::Final => "final",
        }
    }
}

pub struct StorageAdapter {
    storage_root: PathBuf,
    public_base_url: String,
}

impl StorageAdapter {
    pub fn new(storage_root: PathBuf, public_base_url: impl Into<String>) -> Self {
        Self {
            storage_root,
            public_base_url: public_base_url.into(),
        }
    }

    fn file_path(&self, job_id: &str, kind: OutputKind) -> PathBuf {
        self.storage_root
            .join("files")
            .join(kind.as_str())
            .join(job_id)
            .join(format!("{}.png", kind.as_str()))
    }

    fn public_url(&self, job_id: &str, kind: OutputKind) -> String {
        format!(
            "{}/files/{}/{}/{}.png",
            self.public_base_url.trim_end_matches('/'),
            kind.as_str(),
            job_id,
            kind.as_str()
        )
    }

    /// Write `bytes` to disk and return the URL the client will fetch it at.
    pub fn store(&self, job_id: &str, kind: OutputKind, bytes: &[u8]) -> Result<String, StageError> {
        let path = self.file_path(job_id, kind);
        let dir = path.parent().expect("file_path always has a parent");
        fs::create_dir_all(dir).map_err(|e| {
            StageError::new(
                ErrorCode::StoreFailed,
                format!("failed to create {}: {e}", dir.display()),
            )
        })?;
        fs::write(&path, bytes).map_err(|e| {
            StageError::new(
                ErrorCode::StoreFailed,
                format!("failed to write {}: {e}", path.display()),
            )
        })?;
        Ok(self.public_url(job_id, kind))
    }

    /// Resolve the on-disk path for a `GET /files/{kind}/{jobId}/{kind}.png`
    /// request. Returns `None` if `kind` isn't one of the two known values,
    /// letting the HTTP layer 404 instead of trusting an arbitrary path
    /// segment.
    pub fn resolve_public_path(&self, kind: &str, job_id: &str, file_name: &str) -> Option<PathBuf> {
        let kind = match kind {
            "preview" => OutputKind::Preview,
            "final" => OutputKind::Final,
            _ => return None,
        };
        if file_name != format!("{}.png", kind.as_str()) {
            return None;
        }
        if job_id.is_empty() || job_id.contains(['/', '\\']) || job_id.contains("..") {
            return None;
        }
        Some(self.file_path(job_id, kind))
    }

    pub fn root(&self) -> &Path {
        &self.storage_root
    }
}
