//! Pipeline Orchestrator - Sequences C1 -> C2 -> C3 -> C4
//!
//! `Pipeline::process` is the only entry point the HTTP surface and the CLI
//! call. It mints a job id, times each stage, and guarantees the closed
//! error taxonomy in `error.rs` is the only thing that ever leaves this
//! module as a failure - nothing propagates as a panic or a 5xx.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Instant;

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::error::{ErrorBody, ErrorCode, Note, StageError};
use crate::hashing;
use crate::manifest;
use crate::render;
use crate::resolver::{ResolveOutcome, TemplateKey, TemplateResolver};
use crate::storage::{OutputKind, StorageAdapter};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRequest {
    pub template_code: String,
    pub version_semver: String,
    pub download_url: String,
    pub checksum_sha256: String,
    pub raw_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateInfo {
    pub template_code: String,
    pub version_semver: String,
    pub manifest_version: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Outputs {
    pub preview_url: String,
    pub final_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepTiming {
    pub name: &'static str,
    pub ms: u128,
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Timing {
    pub total_ms: u128,
    pub steps: Vec<StepTiming>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessResult {
    pub ok: bool,
    pub job_id: String,
    pub template: TemplateInfo,
    pub outputs: Outputs,
    pub timing: Timing,
    pub warnings: Vec<String>,
    pub notes: Vec<Note>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureResult {
    pub ok: bool,
    pub job_id: String,
    pub error: ErrorBody,
    pub timing: Timing,
    pub notes: Vec<Note>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum JobResult {
    Success(SuccessResult),
    Failure(FailureResult),
}

impl JobResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, JobResult::Success(_))
    }

    pub fn job_id(&self) -> &str {
        match self {
            JobResult::Success(s) => &s.job_id,
            JobResult::Failure(f) => &f.job_id,
        }
    }
}

pub struct Pipeline {
    resolver: TemplateResolver,
    storage: StorageAdapter,
}

impl Pipeline {
    pub fn new(resolver: TemplateResolver, storage: StorageAdapter) -> Self {
        Self { resolver, storage }
    }

    pub async fn process(&self, request: ProcessRequest) -> JobResult {
        let job_id = mint_job_id();
        let span = tracing::info_span!("job", job_id = %job_id, template_code = %request.template_code);
        let _enter = span.enter();

        let started = Instant::now();
        let mut timing = Timing::default();
        let mut notes = Vec::new();

        debug!("job started");
        drop(_enter);
        let outcome = self
            .run(&request, &job_id, &mut timing, &mut notes)
            .instrument(span.clone())
            .await;
        timing.total_ms = started.elapsed().as_millis();
        let _enter = span.enter();

        match outcome {
            Ok((template, outputs)) => {
                info!(total_ms = timing.total_ms as u64, "job succeeded");
                JobResult::Success(SuccessResult {
                    ok: true,
                    job_id,
                    template,
                    outputs,
                    timing,
                    warnings: Vec::new(),
                    notes,
                })
            }
            Err(err) => {
                warn!(
                    total_ms = timing.total_ms as u64,
                    code = ?err.code,
                    "job failed"
                );
                JobResult::Failure(FailureResult {
                    ok: false,
                    job_id,
                    error: ErrorBody::from(&err),
                    timing,
                    notes,
                })
            }
        }
    }

    async fn run(
        &self,
        request: &ProcessRequest,
        job_id: &str,
        timing: &mut Timing,
        notes: &mut Vec<Note>,
    ) -> Result<(TemplateInfo, Outputs), StageError> {
        validate_request(request)?;

        let key = TemplateKey {
            template_code: request.template_code.clone(),
            version_semver: request.version_semver.clone(),
            checksum_sha256: request.checksum_sha256.clone(),
        };

        debug!(stage = "TEMPLATE_RESOLVE", "entering stage");
        let stage_start = Instant::now();
        let resolved = self.resolver.resolve(&key, &request.download_url).await;
        let stage_ms = stage_start.elapsed().as_millis();
        timing.steps.push(StepTiming { name: "TEMPLATE_RESOLVE", ms: stage_ms });
        let (template_dir, resolve_outcome) =
            log_stage("TEMPLATE_RESOLVE", stage_ms, notes, resolved)?;

        notes.push(match resolve_outcome {
            ResolveOutcome::Cached => {
                Note::new("TEMPLATE_CACHED", "template already present in cache")
            }
            ResolveOutcome::Downloaded => {
                Note::new("TEMPLATE_DOWNLOADED", "template downloaded and extracted")
            }
        });

        debug!(stage = "MANIFEST_LOAD", "entering stage");
        let stage_start = Instant::now();
        let loaded = load_and_validate_manifest(&template_dir);
        let stage_ms = stage_start.elapsed().as_millis();
        timing.steps.push(StepTiming { name: "MANIFEST_LOAD", ms: stage_ms });
        let runtime_spec = log_stage("MANIFEST_LOAD", stage_ms, notes, loaded)?;

        debug!(stage = "RENDER", "entering stage");
        let stage_start = Instant::now();
        let rendered = decode_and_render(&request.raw_path, &runtime_spec);
        let stage_ms = stage_start.elapsed().as_millis();
        timing.steps.push(StepTiming { name: "RENDER", ms: stage_ms });
        let encoded = log_stage("RENDER", stage_ms, notes, rendered)?;

        debug!(stage = "STORE", "entering stage");
        let stage_start = Instant::now();
        let stored = self.store_outputs(job_id, &encoded, notes);
        let stage_ms = stage_start.elapsed().as_millis();
        timing.steps.push(StepTiming { name: "STORE", ms: stage_ms });
        let outputs = log_stage("STORE", stage_ms, notes, stored)?;

        Ok((
            TemplateInfo {
                template_code: runtime_spec.template_code,
                version_semver: runtime_spec.version_semver,
                manifest_version: runtime_spec.manifest_version,
            },
            outputs,
        ))
    }

    fn store_outputs(
        &self,
        job_id: &str,
        bytes: &[u8],
        notes: &mut Vec<Note>,
    ) -> Result<Outputs, StageError> {
        let preview_url = self.storage.store(job_id, OutputKind::Preview, bytes)?;
        notes.push(Note::new(
            "PREVIEW_EQUALS_FINAL",
            "preview output is identical to final output",
        ));
        let final_url = self.storage.store(job_id, OutputKind::Final, bytes)?;
        Ok(Outputs { preview_url, final_url })
    }
}

/// Logs a stage's outcome at `info!`/`warn!` with its elapsed milliseconds,
/// appends a `notes` entry naming the failing stage on error, and passes the
/// result through unchanged. Paths, file contents, and raw image bytes never
/// appear in a log line - only stage names, codes, timings.
fn log_stage<T>(
    stage: &'static str,
    ms: u128,
    notes: &mut Vec<Note>,
    result: Result<T, StageError>,
) -> Result<T, StageError> {
    match &result {
        Ok(_) => info!(stage, ms = ms as u64, "stage completed"),
        Err(e) => {
            warn!(stage, ms = ms as u64, code = ?e.code, "stage failed");
            notes.push(
                Note::new("STAGE_FAILED", format!("{stage} failed: {}", e.message))
                    .with_detail(serde_json::json!({ "stage": stage, "code": e.code })),
            );
            if e.code == ErrorCode::AssetNotFound {
                let mut asset_note = Note::new("ASSET_NOT_FOUND", e.message.clone());
                if let Some(detail) = &e.detail {
                    asset_note = asset_note.with_detail(detail.clone());
                }
                notes.push(asset_note);
            }
        }
    }
    result
}

/// Request-shape checks that happen before any stage is entered; failures
/// here leave `timing.steps` empty and map to `INTERNAL_ERROR`, matching how
/// a malformed request body is handled at the HTTP boundary.
fn validate_request(request: &ProcessRequest) -> Result<(), StageError> {
    if request.template_code.is_empty() {
        return Err(StageError::internal("templateCode must not be empty"));
    }
    if request.download_url.is_empty() {
        return Err(StageError::internal("downloadUrl must not be empty"));
    }
    if semver::Version::parse(&request.version_semver).is_err() {
        return Err(StageError::internal(format!(
            "versionSemver '{}' is not MAJOR.MINOR.PATCH",
            request.version_semver
        )));
    }
    if !hashing::is_sha256_hex(&request.checksum_sha256) {
        return Err(StageError::internal("checksumSha256 must be 64 lowercase hex characters"));
    }
    Ok(())
}

fn load_and_validate_manifest(template_dir: &Path) -> Result<manifest::RuntimeSpec, StageError> {
    let doc = manifest::load_manifest(template_dir)?;
    manifest::validate_manifest(&doc)?;
    let spec = manifest::to_runtime_spec(&doc, template_dir)?;
    manifest::validate_assets(&spec)?;
    Ok(spec)
}

fn decode_and_render(raw_path: &Path, spec: &manifest::RuntimeSpec) -> Result<Vec<u8>, StageError> {
    let raw = image::open(raw_path).map_err(|e| {
        StageError::new(
            ErrorCode::RenderFailed,
            format!("failed to decode raw image {}: {e}", raw_path.display()),
        )
    })?;
    let canvas = render::render(spec, &raw)?;
    encode_png(&canvas)
}

fn encode_png(canvas: &image::RgbaImage) -> Result<Vec<u8>, StageError> {
    let mut bytes = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(canvas.clone())
        .write_to(&mut bytes, image::ImageFormat::Png)
        .map_err(|e| StageError::new(ErrorCode::RenderFailed, format!("failed to encode output PNG: {e}")))?;
    Ok(bytes.into_inner())
}

pub(crate) fn mint_job_id() -> String {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
    format!("job_{millis}_{suffix}")
}
