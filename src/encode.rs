//! JPEG encoding of raw YUYV frames.
//!
//! Used for devices that cannot deliver compressed frames themselves, such as
//! the `vivid` virtual camera.

use std::path::Path;

use image::{ImageFormat, RgbImage};

use crate::driver::{DriverError, Result};

/// Layout of a packed YUYV 4:2:2 frame: `[Y0 U Y1 V]` per pixel pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YuyvLayout {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Bytes per row, including any padding.
    pub stride: u32,
}

impl YuyvLayout {
    /// Layout of an unpadded frame.
    pub const fn packed(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            stride: width * 2,
        }
    }
}

/// Convert a YUYV frame to packed RGB24.
pub fn yuyv_to_rgb(data: &[u8], layout: YuyvLayout) -> Result<Vec<u8>> {
    let row_bytes = layout.width as usize * 2;
    let stride = (layout.stride as usize).max(row_bytes);
    let rows = layout.height as usize;

    let mut rgb = Vec::with_capacity(layout.width as usize * rows * 3);
    for row in 0..rows {
        let pixels = data
            .get(row * stride..row * stride + row_bytes)
            .ok_or_else(|| {
                DriverError::CaptureFailed(format!(
                    "short YUYV frame: {} bytes for {}x{}",
                    data.len(),
                    layout.width,
                    layout.height
                ))
            })?;
        for pair in pixels.chunks_exact(4) {
            if let &[y0, u, y1, v] = pair {
                rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
                rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
            }
        }
    }
    Ok(rgb)
}

/// Encode a YUYV frame as a JPEG file at `path`.
pub fn write_yuyv_as_jpeg(path: &Path, data: &[u8], layout: YuyvLayout) -> Result<()> {
    let rgb = yuyv_to_rgb(data, layout)?;
    let image = RgbImage::from_raw(layout.width, layout.height, rgb)
        .ok_or_else(|| DriverError::CaptureFailed("frame size mismatch".to_owned()))?;
    image
        .save_with_format(path, ImageFormat::Jpeg)
        .map_err(|err| DriverError::CaptureFailed(err.to_string()))
}

/// ITU-R BT.601 conversion, clamped to 0-255.
#[allow(clippy::many_single_char_names)]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = f32::from(y);
    let u = f32::from(u) - 128.0;
    let v = f32::from(v) - 128.0;

    let r = 1.402f32.mul_add(v, y);
    let g = 0.714_14f32.mul_add(-v, 0.344_14f32.mul_add(-u, y));
    let b = 1.772f32.mul_add(u, y);

    [clamp(r), clamp(g), clamp(b)]
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn clamp(value: f32) -> u8 {
    value.clamp(0.0, 255.0) as u8
}
