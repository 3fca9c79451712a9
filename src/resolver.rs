//! Template Resolver - Content-Addressed, Single-Flight Template Cache
//!
//! Acquires a template package (a ZIP archive) from a remote URL, verifies
//! its SHA-256 checksum, extracts it, and atomically publishes it under
//! `{cache_root}/{templateCode}/{versionSemver}/{checksumSha256}/`. A
//! `TemplateEntry` is "present" iff `manifest.json` exists at its root;
//! partial extractions must never satisfy that predicate.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error::{ErrorCode, StageError};
use crate::hashing;

/// Identity of a cache entry. Two keys differing only in checksum are
/// distinct entries - content addressing, not version addressing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TemplateKey {
    pub template_code: String,
    pub version_semver: String,
    pub checksum_sha256: String,
}

impl TemplateKey {
    fn lock_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.template_code, self.version_semver, self.checksum_sha256
        )
    }
}

/// What happened while resolving a template, surfaced to the pipeline as a
/// response `note` - informational, never affects `ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    Cached,
    Downloaded,
}

pub struct TemplateResolver {
    cache_root: PathBuf,
    client: reqwest::Client,
    /// Per-key single-flight mutexes. Lookups take a shared (read) lock on
    /// the hit path; only a miss pays for the exclusive (write) lock that
    /// inserts a fresh entry, per the double-checked-lookup discipline this
    /// registry is required to follow.
    locks: RwLock<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TemplateResolver {
    pub fn new(cache_root: PathBuf, connect_timeout: Duration, read_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .build()
            .expect("reqwest client configuration is always valid");

        Self {
            cache_root,
            client,
            locks: RwLock::new(HashMap::new()),
        }
    }

    fn final_dir(&self, key: &TemplateKey) -> PathBuf {
        self.cache_root
            .join(&key.template_code)
            .join(&key.version_semver)
            .join(&key.checksum_sha256)
    }

    fn is_present(dir: &Path) -> bool {
        dir.join("manifest.json").exists()
    }

    fn get_or_create_lock(&self, lock_key: &str) -> Arc<tokio::sync::Mutex<()>> {
        if let Some(existing) = self.locks.read().unwrap().get(lock_key) {
            return existing.clone();
        }
        let mut locks = self.locks.write().unwrap();
        locks
            .entry(lock_key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Acquire an extracted template directory for `key`, downloading from
    /// `download_url` if it is not already cached. At most one download and
    /// one extraction ever happen per key, regardless of concurrent callers.
    pub async fn resolve(
        &self,
        key: &TemplateKey,
        download_url: &str,
    ) -> Result<(PathBuf, ResolveOutcome), StageError> {
        let final_dir = self.final_dir(key);

        if Self::is_present(&final_dir) {
            return Ok((final_dir, ResolveOutcome::Cached));
        }

        let lock = self.get_or_create_lock(&key.lock_key());
        let _guard = lock.lock().await;

        if Self::is_present(&final_dir) {
            return Ok((final_dir, ResolveOutcome::Cached));
        }

        let version_dir = final_dir
            .parent()
            .expect("final_dir always has a parent")
            .to_path_buf();
        tokio::fs::create_dir_all(&version_dir).await.map_err(|e| {
            StageError::internal(format!("failed to create cache directory: {e}"))
        })?;

        let tmp_zip = version_dir.join(format!("{}.zip.tmp", key.checksum_sha256));
        let mut zip_guard = CleanupGuard::new(tmp_zip.clone());

        download_to_file(&self.client, download_url, &tmp_zip).await?;

        let expected = key.checksum_sha256.clone();
        let tmp_zip_for_hash = tmp_zip.clone();
        let actual = tokio::task::spawn_blocking(move || hash_file(&tmp_zip_for_hash))
            .await
            .map_err(|e| StageError::internal(format!("hashing task failed: {e}")))??;

        if actual != expected {
            return Err(StageError::new(
                ErrorCode::TemplateChecksumMismatch,
                "downloaded template failed checksum verification",
            )
            .with_detail(serde_json::json!({ "expected": expected, "actual": actual })));
        }

        let staging_dir = path_with_suffix(&final_dir, ".tmp");
        let mut staging_guard = CleanupGuard::new(staging_dir.clone());

        let tmp_zip_for_extract = tmp_zip.clone();
        let staging_for_extract = staging_dir.clone();
        tokio::task::spawn_blocking(move || extract_zip(&tmp_zip_for_extract, &staging_for_extract))
            .await
            .map_err(|e| StageError::internal(format!("extraction task failed: {e}")))??;

        if !Self::is_present(&staging_dir) {
            return Err(StageError::new(
                ErrorCode::TemplateInvalid,
                "extracted template directory has no manifest.json",
            ));
        }

        match std::fs::rename(&staging_dir, &final_dir) {
            Ok(()) => {
                staging_guard.disarm();
            }
            Err(_) if Self::is_present(&final_dir) => {
                // Lost the race to another process/thread; prefer the
                // existing directory and discard our staging copy.
            }
            Err(e) => {
                return Err(StageError::internal(format!(
                    "failed to publish template directory: {e}"
                )));
            }
        }

        zip_guard.disarm();
        drop(staging_guard);

        Ok((final_dir, ResolveOutcome::Downloaded))
    }
}

fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

async fn download_to_file(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
) -> Result<(), StageError> {
    let mut response = client.get(url).send().await.map_err(|e| {
        StageError::new(
            ErrorCode::TemplateDownloadFailed,
            format!("failed to reach {url}: {e}"),
        )
    })?;

    if !response.status().is_success() {
        return Err(StageError::new(
            ErrorCode::TemplateDownloadFailed,
            format!("download returned HTTP {}", response.status()),
        ));
    }

    let mut file = tokio::fs::File::create(dest).await.map_err(|e| {
        StageError::internal(format!("failed to create temp file {}: {e}", dest.display()))
    })?;

    use tokio::io::AsyncWriteExt;
    loop {
        let chunk = response.chunk().await.map_err(|e| {
            StageError::new(
                ErrorCode::TemplateDownloadFailed,
                format!("download interrupted: {e}"),
            )
        })?;
        let Some(bytes) = chunk else { break };
        file.write_all(&bytes).await.map_err(|e| {
            StageError::internal(format!("failed writing temp file: {e}"))
        })?;
    }

    file.flush().await.map_err(|e| StageError::internal(format!("failed flushing temp file: {e}")))?;
    Ok(())
}

fn hash_file(path: &Path) -> Result<String, StageError> {
    let file = std::fs::File::open(path)
        .map_err(|e| StageError::internal(format!("failed to reopen downloaded archive: {e}")))?;
    hashing::sha256_hex_reader(file)
        .map_err(|e| StageError::internal(format!("failed to hash downloaded archive: {e}")))
}

/// Extract `zip_path` into `dest_dir`, rejecting any entry whose name
/// contains a `..` path component (zip-slip / directory traversal).
fn extract_zip(zip_path: &Path, dest_dir: &Path) -> Result<(), StageError> {
    let file = std::fs::File::open(zip_path)
        .map_err(|e| StageError::internal(format!("failed to reopen downloaded archive: {e}")))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| {
        StageError::new(ErrorCode::TemplateExtractError, format!("malformed ZIP archive: {e}"))
    })?;

    std::fs::create_dir_all(dest_dir)
        .map_err(|e| StageError::internal(format!("failed to create staging directory: {e}")))?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| {
            StageError::new(
                ErrorCode::TemplateExtractError,
                format!("failed to read ZIP entry {i}: {e}"),
            )
        })?;

        let Some(enclosed) = entry.enclosed_name() else {
            return Err(StageError::new(
                ErrorCode::TemplateExtractError,
                format!("ZIP entry '{}' attempts directory traversal", entry.name()),
            ));
        };

        let out_path = dest_dir.join(enclosed);

        if entry.name().ends_with('/') {
            std::fs::create_dir_all(&out_path).map_err(|e| {
                StageError::new(ErrorCode::TemplateExtractError, format!("failed to create directory: {e}"))
            })?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StageError::new(ErrorCode::TemplateExtractError, format!("failed to create directory: {e}"))
            })?;
        }

        let mut out_file = std::fs::File::create(&out_path).map_err(|e| {
            StageError::new(ErrorCode::TemplateExtractError, format!("failed to write {}: {e}", out_path.display()))
        })?;
        std::io::copy(&mut entry, &mut out_file).map_err(|e| {
            StageError::new(ErrorCode::TemplateExtractError, format!("failed to extract {}: {e}", out_path.display()))
        })?;
    }

    Ok(())
}

/// Guaranteed-release scope for a temp file or staging directory. Cleans up
/// on drop unless disarmed; cleanup failures are swallowed so they never
/// mask the primary error.
struct CleanupGuard {
    path: Option<PathBuf>,
}

impl CleanupGuard {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn disarm(&mut self) {
        self.path = None;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if path.is_dir() {
                let _ = std::fs::remove_dir_all(&path);
            } else {
                let _ = std::fs::remove_file(&path);
            }
        }
    }
}
