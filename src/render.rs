//! Render Engine - Deterministic 2D Compositor
//!
//! Consumes a `RuntimeSpec` plus a decoded raw photograph and produces an
//! RGBA canvas. Layers are a single `Photo | Sticker` tagged list, sorted by
//! `z` ascending with declaration order as the tiebreak (photos before
//! stickers, both in manifest order) - `Vec::sort_by_key` is stable, so
//! building the combined list photos-then-stickers and sorting once gets
//! that tiebreak for free.

use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, ImageBuffer, Rgba, RgbaImage};
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};

use crate::error::{ErrorCode, StageError};
use crate::manifest::{Fit, PhotoSpec, RuntimeSpec, StickerSpec};

/// Resampling filter used for every resize in the compositor. `Triangle` is
/// the `image` crate's bilinear-equivalent filter; picked once here so every
/// layer resamples identically regardless of type, honoring the spec's
/// fixed-filter determinism requirement.
const RESAMPLE_FILTER: FilterType = FilterType::Triangle;

enum Layer<'a> {
    Photo(&'a PhotoSpec),
    Sticker(&'a StickerSpec),
}

impl Layer<'_> {
    fn z(&self) -> i64 {
        match self {
            Layer::Photo(p) => p.z,
            Layer::Sticker(s) => s.z,
        }
    }
}

pub fn render(spec: &RuntimeSpec, raw: &DynamicImage) -> Result<RgbaImage, StageError> {
    let mut canvas: RgbaImage = ImageBuffer::new(spec.output.width, spec.output.height);
    composite_background(&mut canvas, spec)?;

    let mut layers: Vec<Layer> = Vec::with_capacity(spec.photos.len() + spec.stickers.len());
    layers.extend(spec.photos.iter().map(Layer::Photo));
    layers.extend(spec.stickers.iter().map(Layer::Sticker));
    layers.sort_by_key(Layer::z);

    let raw_rgba = raw.to_rgba8();
    for layer in &layers {
        match layer {
            Layer::Photo(photo) => composite_photo(&mut canvas, &raw_rgba, photo)?,
            Layer::Sticker(sticker) => composite_sticker(&mut canvas, sticker)?,
        }
    }

    Ok(canvas)
}

fn composite_background(canvas: &mut RgbaImage, spec: &RuntimeSpec) -> Result<(), StageError> {
    let bg = image::open(&spec.background.path).map_err(|e| {
        StageError::new(
            ErrorCode::RenderFailed,
            format!("failed to load background {}: {e}", spec.background.path.display()),
        )
    })?;
    // Background is composited as-is at the origin; a background whose
    // dimensions differ from the output canvas is not an error (matches
    // documented upstream behavior - see DESIGN.md Open Questions).
    imageops::overlay(canvas, &bg.to_rgba8(), 0, 0);
    Ok(())
}

fn composite_photo(
    canvas: &mut RgbaImage,
    raw: &RgbaImage,
    photo: &PhotoSpec,
) -> Result<(), StageError> {
    if photo.w == 0 || photo.h == 0 {
        return Err(StageError::new(
            ErrorCode::RenderFailed,
            format!("photo '{}' has a zero-sized tile", photo.id),
        ));
    }
    let tile = fit_tile(raw, photo.w, photo.h, photo.fit);
    imageops::overlay(canvas, &tile, photo.x, photo.y);
    Ok(())
}

fn composite_sticker(canvas: &mut RgbaImage, sticker: &StickerSpec) -> Result<(), StageError> {
    let decoded = image::open(&sticker.path).map_err(|e| {
        StageError::new(
            ErrorCode::RenderFailed,
            format!(
                "failed to load sticker '{}' at {}: {e}",
                sticker.id,
                sticker.path.display()
            ),
        )
    })?;

    let mut tile = imageops::resize(&decoded.to_rgba8(), sticker.w, sticker.h, RESAMPLE_FILTER);

    if sticker.opacity < 1.0 {
        apply_opacity(&mut tile, sticker.opacity);
    }

    // Fast path: a 0-degree rotation skips the transform entirely, which
    // keeps output bytes byte-identical to the un-rotated tile.
    let tile = if sticker.rotate != 0.0 {
        // `rotate_about_center` measures angles clockwise in image space
        // (y grows downward); negate so that the spec's "positive degrees
        // = counter-clockwise" convention holds visually.
        let radians = -(sticker.rotate as f32).to_radians();
        rotate_about_center(&tile, radians, Interpolation::Bilinear, Rgba([0, 0, 0, 0]))
    } else {
        tile
    };

    imageops::overlay(canvas, &tile, sticker.x, sticker.y);
    Ok(())
}

fn apply_opacity(img: &mut RgbaImage, opacity: f64) {
    let opacity = opacity.clamp(0.0, 1.0);
    for pixel in img.pixels_mut() {
        let scaled = (pixel[3] as f64 * opacity).round().clamp(0.0, 255.0);
        pixel[3] = scaled as u8;
    }
}

fn fit_tile(src: &RgbaImage, w: u32, h: u32, fit: Fit) -> RgbaImage {
    match fit {
        Fit::Cover => cover_fit(src, w, h),
        Fit::Contain => contain_fit(src, w, h),
    }
}

/// Scale so the tile fully covers `w x h`, then center-crop the overflow.
fn cover_fit(src: &RgbaImage, w: u32, h: u32) -> RgbaImage {
    let (sw, sh) = src.dimensions();
    let scale = (w as f64 / sw as f64).max(h as f64 / sh as f64);
    let (rw, rh) = scaled_dims(sw, sh, scale);
    let resized = imageops::resize(src, rw, rh, RESAMPLE_FILTER);
    let x_off = rw.saturating_sub(w) / 2;
    let y_off = rh.saturating_sub(h) / 2;
    imageops::crop_imm(&resized, x_off, y_off, w.min(rw), h.min(rh)).to_image()
}

/// Scale so the entire source fits within `w x h`, letterboxing the rest
/// with full transparency.
fn contain_fit(src: &RgbaImage, w: u32, h: u32) -> RgbaImage {
    let (sw, sh) = src.dimensions();
    let scale = (w as f64 / sw as f64).min(h as f64 / sh as f64);
    let (rw, rh) = scaled_dims(sw, sh, scale);
    let resized = imageops::resize(src, rw.min(w), rh.min(h), RESAMPLE_FILTER);
    let mut tile: RgbaImage = ImageBuffer::from_pixel(w, h, Rgba([0, 0, 0, 0]));
    let x_off = w.saturating_sub(resized.width()) / 2;
    let y_off = h.saturating_sub(resized.height()) / 2;
    imageops::overlay(&mut tile, &resized, x_off as i64, y_off as i64);
    tile
}

fn scaled_dims(sw: u32, sh: u32, scale: f64) -> (u32, u32) {
    let rw = ((sw as f64) * scale).round().max(1.0) as u32;
    let rh = ((sh as f64) * scale).round().max(1.0) as u32;
    (rw, rh)
}
