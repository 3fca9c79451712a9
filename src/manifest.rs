//! Manifest Loader - Parse, Validate, Normalize, Verify
//!
//! Four operations, invoked in strict sequence by the orchestrator:
//! `load_manifest -> validate_manifest -> to_runtime_spec -> validate_assets`.
//! The first two halt on the first structural violation (`MANIFEST_INVALID`);
//! the last is the early-fail asset gate (`ASSET_NOT_FOUND`). Splitting these
//! into distinct sub-kinds is load-bearing: callers branch on it.

use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ErrorCode, StageError};

/// Opaque parsed manifest document. Kept as a `serde_json::Value` rather than
/// a strict typed struct so that a type mismatch on a field (e.g. `width`
/// given as a string) is reported as a `MANIFEST_INVALID` validation failure
/// naming the field, not folded into the JSON-parse error.
pub type ManifestDoc = Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Fit {
    Cover,
    Contain,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputSpec {
    pub width: u32,
    pub height: u32,
    pub format: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackgroundSpec {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhotoSpec {
    pub id: String,
    pub source: String,
    pub x: i64,
    pub y: i64,
    pub w: u32,
    pub h: u32,
    pub fit: Fit,
    pub z: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StickerSpec {
    pub id: String,
    pub path: PathBuf,
    pub x: i64,
    pub y: i64,
    pub w: u32,
    pub h: u32,
    pub rotate: f64,
    pub opacity: f64,
    pub z: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeSpec {
    pub manifest_version: u32,
    pub template_code: String,
    pub version_semver: String,
    pub output: OutputSpec,
    pub background: BackgroundSpec,
    pub photos: Vec<PhotoSpec>,
    pub stickers: Vec<StickerSpec>,
}

/// Read `{template_dir}/manifest.json` as UTF-8 JSON.
pub fn load_manifest(template_dir: &Path) -> Result<ManifestDoc, StageError> {
    let path = template_dir.join("manifest.json");
    let content = fs::read_to_string(&path).map_err(|e| {
        StageError::new(
            ErrorCode::ManifestLoadError,
            format!("failed to read {}: {}", path.display(), e),
        )
    })?;

    serde_json::from_str(&content).map_err(|e| {
        StageError::new(
            ErrorCode::ManifestLoadError,
            format!("malformed manifest JSON: {}", e),
        )
        .with_detail(serde_json::json!({
            "line": e.line(),
            "column": e.column(),
        }))
    })
}

fn invalid(field: &str, reason: &str) -> StageError {
    StageError::new(
        ErrorCode::ManifestInvalid,
        format!("{}: {}", field, reason),
    )
    .with_detail(serde_json::json!({ "field": field }))
}

fn require_object<'a>(doc: &'a Value, field: &str) -> Result<&'a serde_json::Map<String, Value>, StageError> {
    doc.as_object().ok_or_else(|| invalid(field, "expected an object"))
}

fn get<'a>(obj: &'a serde_json::Map<String, Value>, key: &str) -> Option<&'a Value> {
    obj.get(key)
}

fn require_nonempty_string(obj: &serde_json::Map<String, Value>, field: &str) -> Result<String, StageError> {
    match get(obj, field).and_then(Value::as_str) {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        Some(_) => Err(invalid(field, "must be non-empty")),
        None => Err(invalid(field, "missing or not a string")),
    }
}

fn require_positive_u32(obj: &serde_json::Map<String, Value>, field: &str) -> Result<u32, StageError> {
    let n = get(obj, field)
        .and_then(Value::as_i64)
        .ok_or_else(|| invalid(field, "missing or not an integer"))?;
    if n <= 0 {
        return Err(invalid(field, "must be > 0"));
    }
    Ok(n as u32)
}

fn require_int(obj: &serde_json::Map<String, Value>, field: &str) -> Result<i64, StageError> {
    get(obj, field)
        .and_then(Value::as_i64)
        .ok_or_else(|| invalid(field, "missing or not an integer"))
}

fn optional_string(obj: &serde_json::Map<String, Value>, field: &str, default: &str) -> Result<String, StageError> {
    match get(obj, field) {
        None | Some(Value::Null) => Ok(default.to_string()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(invalid(field, "must be a string")),
    }
}

fn optional_number(obj: &serde_json::Map<String, Value>, field: &str, default: f64) -> Result<f64, StageError> {
    match get(obj, field) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v.as_f64().ok_or_else(|| invalid(field, "must be a number")),
    }
}

fn optional_int(obj: &serde_json::Map<String, Value>, field: &str, default: i64) -> Result<i64, StageError> {
    match get(obj, field) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v.as_i64().ok_or_else(|| invalid(field, "must be an integer")),
    }
}

/// Validate manifest structure, halting on the first violation.
pub fn validate_manifest(doc: &ManifestDoc) -> Result<(), StageError> {
    let root = require_object(doc, "$")?;

    let manifest_version = get(root, "manifestVersion")
        .and_then(Value::as_i64)
        .ok_or_else(|| invalid("manifestVersion", "missing or not an integer"))?;
    if manifest_version != 1 {
        return Err(invalid("manifestVersion", "must be 1"));
    }

    require_nonempty_string(root, "templateCode")?;
    require_nonempty_string(root, "versionSemver")?;

    let output = root
        .get("output")
        .and_then(Value::as_object)
        .ok_or_else(|| invalid("output", "missing or not an object"))?;
    require_positive_u32(output, "width")?;
    require_positive_u32(output, "height")?;
    if let Some(v) = output.get("format") {
        if !v.is_null() && !v.is_string() {
            return Err(invalid("output.format", "must be a string"));
        }
    }

    if let Some(assets) = root.get("assets") {
        if !assets.is_null() {
            let assets = assets
                .as_object()
                .ok_or_else(|| invalid("assets", "must be an object"))?;
            if let Some(v) = assets.get("basePath") {
                if !v.is_null() && !v.is_string() {
                    return Err(invalid("assets.basePath", "must be a string"));
                }
            }
        }
    }

    let compose = root
        .get("compose")
        .and_then(Value::as_object)
        .ok_or_else(|| invalid("compose", "missing or not an object"))?;

    require_nonempty_string(compose, "background")?;

    let photos = compose
        .get("photos")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("compose.photos", "missing or not an array"))?;
    if photos.is_empty() {
        return Err(invalid("compose.photos", "must contain at least one photo"));
    }
    for (i, photo) in photos.iter().enumerate() {
        validate_photo(photo, i)?;
    }

    let stickers = compose
        .get("stickers")
        .map(|v| {
            v.as_array()
                .cloned()
                .ok_or_else(|| invalid("compose.stickers", "must be an array"))
        })
        .transpose()?
        .unwrap_or_default();
    for (i, sticker) in stickers.iter().enumerate() {
        validate_sticker(sticker, i)?;
    }

    Ok(())
}

fn validate_photo(photo: &Value, index: usize) -> Result<(), StageError> {
    let field_prefix = format!("compose.photos[{}]", index);
    let obj = photo
        .as_object()
        .ok_or_else(|| invalid(&field_prefix, "must be an object"))?;

    require_nonempty_string(obj, "id").map_err(|_| invalid(&format!("{}.id", field_prefix), "missing or not a string"))?;
    require_nonempty_string(obj, "source").map_err(|_| invalid(&format!("{}.source", field_prefix), "missing or not a string"))?;
    require_int(obj, "x").map_err(|_| invalid(&format!("{}.x", field_prefix), "missing or not an integer"))?;
    require_int(obj, "y").map_err(|_| invalid(&format!("{}.y", field_prefix), "missing or not an integer"))?;
    require_positive_u32(obj, "w").map_err(|_| invalid(&format!("{}.w", field_prefix), "missing or not > 0"))?;
    require_positive_u32(obj, "h").map_err(|_| invalid(&format!("{}.h", field_prefix), "missing or not > 0"))?;

    if let Some(v) = obj.get("fit") {
        match v.as_str() {
            Some("cover") | Some("contain") => {}
            _ => return Err(invalid(&format!("{}.fit", field_prefix), "must be \"cover\" or \"contain\"")),
        }
    }
    if let Some(v) = obj.get("z") {
        if !v.is_null() && v.as_i64().is_none() {
            return Err(invalid(&format!("{}.z", field_prefix), "must be an integer"));
        }
    }
    Ok(())
}

fn validate_sticker(sticker: &Value, index: usize) -> Result<(), StageError> {
    let field_prefix = format!("compose.stickers[{}]", index);
    let obj = sticker
        .as_object()
        .ok_or_else(|| invalid(&field_prefix, "must be an object"))?;

    require_nonempty_string(obj, "id").map_err(|_| invalid(&format!("{}.id", field_prefix), "missing or not a string"))?;
    require_nonempty_string(obj, "src").map_err(|_| invalid(&format!("{}.src", field_prefix), "missing or not a string"))?;
    require_int(obj, "x").map_err(|_| invalid(&format!("{}.x", field_prefix), "missing or not an integer"))?;
    require_int(obj, "y").map_err(|_| invalid(&format!("{}.y", field_prefix), "missing or not an integer"))?;
    require_positive_u32(obj, "w").map_err(|_| invalid(&format!("{}.w", field_prefix), "missing or not > 0"))?;
    require_positive_u32(obj, "h").map_err(|_| invalid(&format!("{}.h", field_prefix), "missing or not > 0"))?;

    if let Some(v) = obj.get("rotate") {
        if !v.is_null() && v.as_f64().is_none() {
            return Err(invalid(&format!("{}.rotate", field_prefix), "must be numeric"));
        }
    }
    if let Some(v) = obj.get("opacity") {
        if !v.is_null() {
            let o = v
                .as_f64()
                .ok_or_else(|| invalid(&format!("{}.opacity", field_prefix), "must be numeric"))?;
            if !(0.0..=1.0).contains(&o) {
                return Err(invalid(&format!("{}.opacity", field_prefix), "must be in [0,1]"));
            }
        }
    }
    if let Some(v) = obj.get("z") {
        if !v.is_null() && v.as_i64().is_none() {
            return Err(invalid(&format!("{}.z", field_prefix), "must be an integer"));
        }
    }
    Ok(())
}

/// Sticker path rule: `assets/`-prefixed sources resolve directly under the
/// template directory, everything else resolves under `basePath`.
fn resolve_sticker_path(template_dir: &Path, base_path: &str, src: &str) -> PathBuf {
    if src.starts_with("assets/") {
        template_dir.join(src)
    } else {
        template_dir.join(base_path).join(src)
    }
}

/// Normalize a validated manifest into the absolute-path runtime spec.
/// Assumes `validate_manifest` already succeeded against `doc`.
pub fn to_runtime_spec(doc: &ManifestDoc, template_dir: &Path) -> Result<RuntimeSpec, StageError> {
    let root = require_object(doc, "$")?;
    let manifest_version = get(root, "manifestVersion").and_then(Value::as_i64).unwrap_or(1) as u32;
    let template_code = require_nonempty_string(root, "templateCode")?;
    let version_semver = require_nonempty_string(root, "versionSemver")?;

    let output = root.get("output").and_then(Value::as_object).unwrap();
    let width = require_positive_u32(output, "width")?;
    let height = require_positive_u32(output, "height")?;
    let format = optional_string(output, "format", "png")?;

    let base_path = root
        .get("assets")
        .and_then(Value::as_object)
        .map(|a| optional_string(a, "basePath", "assets"))
        .transpose()?
        .unwrap_or_else(|| "assets".to_string());

    let compose = root.get("compose").and_then(Value::as_object).unwrap();
    let background_rel = require_nonempty_string(compose, "background")?;
    let background = BackgroundSpec {
        path: template_dir.join(&base_path).join(&background_rel),
    };

    let photos_raw = compose.get("photos").and_then(Value::as_array).unwrap();
    let mut photos = Vec::with_capacity(photos_raw.len());
    for photo in photos_raw {
        let obj = photo.as_object().unwrap();
        photos.push(PhotoSpec {
            id: require_nonempty_string(obj, "id")?,
            source: require_nonempty_string(obj, "source")?,
            x: require_int(obj, "x")?,
            y: require_int(obj, "y")?,
            w: require_positive_u32(obj, "w")?,
            h: require_positive_u32(obj, "h")?,
            fit: match optional_string(obj, "fit", "cover")?.as_str() {
                "contain" => Fit::Contain,
                _ => Fit::Cover,
            },
            z: optional_int(obj, "z", 0)?,
        });
    }

    let stickers_raw = compose
        .get("stickers")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut stickers = Vec::with_capacity(stickers_raw.len());
    for sticker in &stickers_raw {
        let obj = sticker.as_object().unwrap();
        let src = require_nonempty_string(obj, "src")?;
        stickers.push(StickerSpec {
            id: require_nonempty_string(obj, "id")?,
            path: resolve_sticker_path(template_dir, &base_path, &src),
            x: require_int(obj, "x")?,
            y: require_int(obj, "y")?,
            w: require_positive_u32(obj, "w")?,
            h: require_positive_u32(obj, "h")?,
            rotate: optional_number(obj, "rotate", 0.0)?,
            opacity: optional_number(obj, "opacity", 1.0)?,
            z: optional_int(obj, "z", 0)?,
        });
    }

    Ok(RuntimeSpec {
        manifest_version,
        template_code,
        version_semver,
        output: OutputSpec { width, height, format },
        background,
        photos,
        stickers,
    })
}

/// Early-fail gate: every referenced asset must exist on disk before render
/// is attempted. The first missing file wins, reported as `ASSET_NOT_FOUND`.
pub fn validate_assets(spec: &RuntimeSpec) -> Result<(), StageError> {
    if !spec.background.path.exists() {
        return Err(StageError::new(
            ErrorCode::AssetNotFound,
            format!("background asset not found: {}", spec.background.path.display()),
        )
        .with_detail(serde_json::json!({ "path": spec.background.path.to_string_lossy() })));
    }

    for sticker in &spec.stickers {
        if !sticker.path.exists() {
            return Err(StageError::new(
                ErrorCode::AssetNotFound,
                format!(
                    "sticker '{}' asset not found: {}",
                    sticker.id,
                    sticker.path.display()
                ),
            )
            .with_detail(serde_json::json!({
                "path": sticker.path.to_string_lossy(),
                "stickerId": sticker.id,
            })));
        }
    }

    Ok(())
}
