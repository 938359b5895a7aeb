//! Frame payloads: raw render output and display-ready frames
//!
//! **Why**: The render engine produces frames in its working precision
//! (8-bit, half or full float, linear light). The cache only ever holds
//! frames that went through display conversion, so the two are separate
//! types:
//! - `RawFrame`: staging payload handed from the render thread
//! - `Frame`: converted, immutable, cheap to clone (Arc-backed)
//!
//! A `Frame` is built once and never mutated afterwards, so a reader that
//! obtained one from the cache always sees the whole frame.

use half::f16 as F16;
use std::sync::Arc;

/// Pixel buffer format - stores different precision levels
#[derive(Debug, Clone)]
pub enum PixelBuffer {
    U8(Vec<u8>),   // 8-bit per channel, already display encoded
    F16(Vec<F16>), // half-float per channel, linear
    F32(Vec<f32>), // full float per channel, linear
}

/// Pixel format type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgba8,
    RgbaF16,
    RgbaF32,
}

impl PixelBuffer {
    pub fn format(&self) -> PixelFormat {
        match self {
            PixelBuffer::U8(_) => PixelFormat::Rgba8,
            PixelBuffer::F16(_) => PixelFormat::RgbaF16,
            PixelBuffer::F32(_) => PixelFormat::RgbaF32,
        }
    }

    /// Number of channel values (not bytes)
    pub fn len(&self) -> usize {
        match self {
            PixelBuffer::U8(b) => b.len(),
            PixelBuffer::F16(b) => b.len(),
            PixelBuffer::F32(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size in bytes
    pub fn mem(&self) -> usize {
        match self {
            PixelBuffer::U8(b) => b.len(),
            PixelBuffer::F16(b) => b.len() * 2,
            PixelBuffer::F32(b) => b.len() * 4,
        }
    }
}

/// Raw frame as produced by the render engine (pre color conversion)
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub buffer: PixelBuffer,
    pub width: usize,
    pub height: usize,
}

impl RawFrame {
    pub fn new(buffer: PixelBuffer, width: usize, height: usize) -> Self {
        Self { buffer, width, height }
    }

    /// Solid RGBA fill in linear float, mostly for tests and the demo engine
    pub fn solid_f32(width: usize, height: usize, rgba: [f32; 4]) -> Self {
        let mut buf = Vec::with_capacity(width * height * 4);
        for _ in 0..width * height {
            buf.extend_from_slice(&rgba);
        }
        Self::new(PixelBuffer::F32(buf), width, height)
    }

    /// Buffer length matches the declared dimensions
    pub fn is_consistent(&self) -> bool {
        self.buffer.len() == self.width * self.height * 4
    }

    pub fn mem(&self) -> usize {
        self.buffer.mem()
    }
}

#[derive(Debug)]
struct FrameData {
    pixels: Vec<u8>, // RGBA8, display encoded
    width: usize,
    height: usize,
}

/// Display-ready frame (RGBA8). Clones share the same pixels.
#[derive(Debug, Clone)]
pub struct Frame {
    data: Arc<FrameData>,
}

impl Frame {
    pub fn from_rgba8(pixels: Vec<u8>, width: usize, height: usize) -> Self {
        Self {
            data: Arc::new(FrameData { pixels, width, height }),
        }
    }

    pub fn width(&self) -> usize {
        self.data.width
    }

    pub fn height(&self) -> usize {
        self.data.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data.pixels
    }

    /// Memory footprint in bytes
    pub fn mem(&self) -> usize {
        self.data.pixels.len()
    }

    /// Both handles point at the same pixel storage
    pub fn ptr_eq(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_frame_consistency() {
        let raw = RawFrame::solid_f32(4, 2, [1.0, 0.5, 0.0, 1.0]);
        assert!(raw.is_consistent());
        assert_eq!(raw.buffer.format(), PixelFormat::RgbaF32);
        assert_eq!(raw.mem(), 4 * 2 * 4 * 4);

        let broken = RawFrame::new(PixelBuffer::U8(vec![0; 7]), 2, 2);
        assert!(!broken.is_consistent());
    }

    #[test]
    fn test_frame_clone_shares_pixels() {
        let frame = Frame::from_rgba8(vec![1, 2, 3, 4], 1, 1);
        let copy = frame.clone();
        assert!(frame.ptr_eq(&copy));
        assert_eq!(copy.pixels(), &[1, 2, 3, 4]);
        assert_eq!(copy.mem(), 4);
    }
}
