use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use tracing::debug;

use murmur_core::config::MAX_IMAGE_BASE64_BYTES;

use crate::error::{ImageError, Result};

/// JPEG qualities tried in order before any downscaling happens.
const QUALITY_LADDER: [u8; 4] = [85, 70, 55, 40];
/// Scale factor per downscale step.
const DOWNSCALE_NUM: u32 = 3;
const DOWNSCALE_DEN: u32 = 4;
/// Give up once either dimension would fall below this.
const MIN_DIMENSION: u32 = 64;

/// Base64-encoded length of `len` raw bytes.
pub fn base64_len(len: usize) -> usize {
    len.div_ceil(3) * 4
}

/// Reduce `raw` until its base64 form fits the per-image ceiling.
///
/// Returns `(bytes, mime_type)` — the input unchanged when it already fits,
/// otherwise a JPEG re-encode walking the quality ladder and then a
/// progressive downscale. Pure function of the input bytes.
pub fn fit_under_ceiling(raw: &[u8], mime_type: &str) -> Result<(Vec<u8>, String)> {
    if base64_len(raw.len()) <= MAX_IMAGE_BASE64_BYTES {
        return Ok((raw.to_vec(), mime_type.to_string()));
    }

    let img = image::load_from_memory(raw).map_err(|e| ImageError::Decode(e.to_string()))?;

    for quality in QUALITY_LADDER {
        let encoded = encode_jpeg(&img, quality)?;
        if base64_len(encoded.len()) <= MAX_IMAGE_BASE64_BYTES {
            debug!(quality, bytes = encoded.len(), "image fit via quality ladder");
            return Ok((encoded, "image/jpeg".to_string()));
        }
    }

    // Quality alone was not enough; shrink at the ladder floor.
    let mut current = img;
    loop {
        let (w, h) = current.dimensions();
        let (nw, nh) = rounded_dimensions(w, h);
        if nw < MIN_DIMENSION || nh < MIN_DIMENSION {
            return Err(ImageError::Irreducible);
        }
        current = current.resize_exact(nw, nh, FilterType::Lanczos3);
        let encoded = encode_jpeg(&current, QUALITY_LADDER[QUALITY_LADDER.len() - 1])?;
        if base64_len(encoded.len()) <= MAX_IMAGE_BASE64_BYTES {
            debug!(width = nw, height = nh, bytes = encoded.len(), "image fit via downscale");
            return Ok((encoded, "image/jpeg".to_string()));
        }
    }
}

/// Next downscale step, rounded down to even so repeated runs on the same
/// input always pick identical dimensions.
fn rounded_dimensions(w: u32, h: u32) -> (u32, u32) {
    let nw = (w * DOWNSCALE_NUM / DOWNSCALE_DEN) & !1;
    let nh = (h * DOWNSCALE_NUM / DOWNSCALE_DEN) & !1;
    (nw, nh)
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    // Jpeg cannot carry alpha; flatten first.
    let rgb = img.to_rgb8();
    let encoder = JpegEncoder::new_with_quality(&mut out, quality);
    rgb.write_with_encoder(encoder)
        .map_err(|e| ImageError::Encode(e.to_string()))?;
    Ok(out.into_inner())
}
