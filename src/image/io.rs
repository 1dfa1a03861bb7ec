//! I/O helpers for projection images, label masks and JSON.
//!
//! - `save_grayscale_f32`: write an `ImageF32` to a grayscale PNG,
//!   stretching its value range to [0, 255].
//! - `save_label_png`: write a `LabelImage` to a 16-bit grayscale PNG
//!   (ids above 65535 wrap).
//! - `write_json_file`: pretty-print a serializable value to disk.
use super::{ImageF32, ImageView, LabelImage};
use image::{GrayImage, ImageBuffer, Luma};
use serde::Serialize;
use std::fs;
use std::path::Path;

/// Save a float image to a grayscale PNG, stretching min..max to 0..255.
pub fn save_grayscale_f32(image: &ImageF32, path: &Path) -> Result<(), String> {
    ensure_parent_dir(path)?;
    let min = image.data.iter().copied().fold(f32::INFINITY, f32::min);
    let max = image.data.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = (max - min).max(f32::EPSILON);
    let mut out = GrayImage::new(image.w as u32, image.h as u32);
    for y in 0..image.h {
        let row = image.row(y);
        for (x, &px) in row.iter().enumerate() {
            let v = ((px - min) / range * 255.0).clamp(0.0, 255.0);
            out.put_pixel(x as u32, y as u32, Luma([v as u8]));
        }
    }
    out.save(path)
        .map_err(|e| format!("Failed to save {}: {e}", path.display()))
}

/// Save a label mask to a 16-bit grayscale PNG.
pub fn save_label_png(masks: &LabelImage, path: &Path) -> Result<(), String> {
    ensure_parent_dir(path)?;
    let data: Vec<u16> = masks.data.iter().map(|&id| id as u16).collect();
    let out: ImageBuffer<Luma<u16>, Vec<u16>> =
        ImageBuffer::from_raw(masks.w as u32, masks.h as u32, data)
            .ok_or_else(|| "Failed to create label buffer".to_string())?;
    out.save(path)
        .map_err(|e| format!("Failed to save {}: {e}", path.display()))
}

/// Serialize a value as pretty JSON to `path`, creating parent directories.
pub fn write_json_file<T: Serialize>(path: &Path, value: &T) -> Result<(), String> {
    ensure_parent_dir(path)?;
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| format!("Failed to serialize JSON for {}: {e}", path.display()))?;
    fs::write(path, json).map_err(|e| format!("Failed to write JSON {}: {e}", path.display()))
}

fn ensure_parent_dir(path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create {}: {e}", parent.display()))?;
        }
    }
    Ok(())
}
