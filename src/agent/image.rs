use base64::Engine as _;

use crate::errors::{DeskPilotError, DeskPilotResult};

/// Resized dimensions snap to this factor so the vision encoder's patch grid
/// lines up.
const PATCH_FACTOR: u32 = 28;
const MIN_PIXELS: u32 = 56 * 56;
const MAX_PIXELS: u32 = 14 * 14 * 4 * 1280;

/// A screenshot prepared for the model: re-encoded PNG with bounded pixel
/// count, plus the sizes needed later for coordinate scaling.
pub struct ProcessedImage {
    pub base64: String,
    pub width: u32,
    pub height: u32,
    pub original_width: u32,
    pub original_height: u32,
}

/// Decodes the raw screenshot, rescales it into the model's pixel budget and
/// returns the base64 PNG payload with both size pairs.
pub fn process_screenshot(bytes: &[u8]) -> DeskPilotResult<ProcessedImage> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| DeskPilotError::Image(format!("screenshot decode: {e}")))?;
    let (ow, oh) = (img.width(), img.height());
    let (tw, th) = smart_resize(ow, oh);

    let resized = if (tw, th) == (ow, oh) {
        img
    } else {
        img.resize_exact(tw, th, image::imageops::FilterType::Lanczos3)
    };

    let mut png_bytes = Vec::new();
    resized
        .write_to(
            &mut std::io::Cursor::new(&mut png_bytes),
            image::ImageFormat::Png,
        )
        .map_err(|e| DeskPilotError::Image(format!("screenshot encode: {e}")))?;

    Ok(ProcessedImage {
        base64: base64::engine::general_purpose::STANDARD.encode(&png_bytes),
        width: tw,
        height: th,
        original_width: ow,
        original_height: oh,
    })
}

/// Rounds each side to the patch factor, then rescales uniformly when the
/// total pixel count falls outside [MIN_PIXELS, MAX_PIXELS].
fn smart_resize(width: u32, height: u32) -> (u32, u32) {
    let round = |v: f64| ((v / PATCH_FACTOR as f64).round().max(1.0) as u32) * PATCH_FACTOR;
    let floor = |v: f64| ((v / PATCH_FACTOR as f64).floor().max(1.0) as u32) * PATCH_FACTOR;
    let ceil = |v: f64| ((v / PATCH_FACTOR as f64).ceil() as u32).max(1) * PATCH_FACTOR;

    let mut w = round(width as f64);
    let mut h = round(height as f64);

    let pixels = w as u64 * h as u64;
    if pixels > MAX_PIXELS as u64 {
        let scale = ((width as f64 * height as f64) / MAX_PIXELS as f64).sqrt();
        w = floor(width as f64 / scale);
        h = floor(height as f64 / scale);
    } else if pixels < MIN_PIXELS as u64 {
        let scale = (MIN_PIXELS as f64 / (width as f64 * height as f64)).sqrt();
        w = ceil(width as f64 * scale);
        h = ceil(height as f64 * scale);
    }
    (w, h)
}

/// Environments may hand screenshots back as base64 text; persisted artifacts
/// always use raw bytes.
pub fn normalize_screenshot(data: &[u8]) -> Vec<u8> {
    if data.starts_with(b"\x89PNG") || data.starts_with(&[0xFF, 0xD8]) {
        return data.to_vec();
    }
    if let Ok(text) = std::str::from_utf8(data) {
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(trimmed) {
                return decoded;
            }
        }
    }
    data.to_vec()
}
