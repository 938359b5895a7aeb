//! Display color conversion for rendered frames
//!
//! The populator only needs "convert this buffer": `DisplayConverter` is that
//! seam. The default `SrgbConverter` maps linear RGBA (f16/f32) to 8-bit sRGB
//! with straight alpha, processing rows in parallel with rayon.

use half::f16 as F16;
use rayon::prelude::*;
use thiserror::Error;

use super::frame::{Frame, PixelBuffer, RawFrame};

/// Conversion failures. None of these ever reach the cache.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConversionError {
    #[error("buffer holds {actual} values, expected {expected} for {width}x{height} RGBA")]
    SizeMismatch {
        width: usize,
        height: usize,
        expected: usize,
        actual: usize,
    },
    #[error("empty frame ({width}x{height})")]
    Empty { width: usize, height: usize },
    #[error("conversion failed: {0}")]
    Other(String),
}

/// Converts a raw render payload into a display-ready frame.
///
/// Implementations run on worker threads.
pub trait DisplayConverter: Send + Sync {
    fn convert(&self, raw: &RawFrame) -> Result<Frame, ConversionError>;
}

/// Linear light → sRGB 8-bit
#[derive(Debug, Default, Clone, Copy)]
pub struct SrgbConverter;

#[inline]
fn linear_to_srgb(v: f32) -> f32 {
    if v <= 0.003_130_8 {
        v * 12.92
    } else {
        1.055 * v.powf(1.0 / 2.4) - 0.055
    }
}

#[inline]
fn quantize(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0 + 0.5) as u8
}

#[inline]
fn encode_pixel(px: [f32; 4], out: &mut [u8]) {
    out[0] = quantize(linear_to_srgb(px[0]));
    out[1] = quantize(linear_to_srgb(px[1]));
    out[2] = quantize(linear_to_srgb(px[2]));
    out[3] = quantize(px[3]); // alpha stays linear
}

impl DisplayConverter for SrgbConverter {
    fn convert(&self, raw: &RawFrame) -> Result<Frame, ConversionError> {
        let (w, h) = (raw.width, raw.height);
        if w == 0 || h == 0 {
            return Err(ConversionError::Empty { width: w, height: h });
        }
        if !raw.is_consistent() {
            return Err(ConversionError::SizeMismatch {
                width: w,
                height: h,
                expected: w * h * 4,
                actual: raw.buffer.len(),
            });
        }

        let row_len = w * 4;
        let mut dst = vec![0u8; w * h * 4];

        match &raw.buffer {
            PixelBuffer::U8(buf) => dst.copy_from_slice(buf),
            PixelBuffer::F32(buf) => {
                dst.par_chunks_mut(row_len)
                    .zip(buf.par_chunks(row_len))
                    .for_each(|(out_row, src_row)| {
                        for (out, px) in out_row.chunks_mut(4).zip(src_row.chunks(4)) {
                            encode_pixel([px[0], px[1], px[2], px[3]], out);
                        }
                    });
            }
            PixelBuffer::F16(buf) => {
                dst.par_chunks_mut(row_len)
                    .zip(buf.par_chunks(row_len))
                    .for_each(|(out_row, src_row)| {
                        for (out, px) in out_row.chunks_mut(4).zip(src_row.chunks(4)) {
                            let px = [
                                F16::to_f32(px[0]),
                                F16::to_f32(px[1]),
                                F16::to_f32(px[2]),
                                F16::to_f32(px[3]),
                            ];
                            encode_pixel(px, out);
                        }
                    });
            }
        }

        Ok(Frame::from_rgba8(dst, w, h))
    }
}
