//! Frame buffers moving through the capture loop
//!
//! `ColorFrame` is what the capture device hands out (packed 24-bit BGR).
//! `MotionFrame` is the single-channel working copy the detector operates on.

use serde::Deserialize;

/// Default capture resolution
pub const DEFAULT_WIDTH: u32 = 640;
pub const DEFAULT_HEIGHT: u32 = 480;

/// Channel order of a packed 24-bit pixel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelOrder {
    Bgr,
    Rgb,
}

/// Display/capture mode descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoMode {
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u8,
    pub pixel_order: PixelOrder,
}

impl VideoMode {
    pub fn bgr24(width: u32, height: u32) -> Self {
        Self { width, height, bits_per_pixel: 24, pixel_order: PixelOrder::Bgr }
    }

    /// Bytes needed for one frame in this mode
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * usize::from(self.bits_per_pixel / 8)
    }
}

impl Default for VideoMode {
    fn default() -> Self {
        Self::bgr24(DEFAULT_WIDTH, DEFAULT_HEIGHT)
    }
}

/// Packed BGR24 frame as delivered by a capture device
#[derive(Debug, Clone)]
pub struct ColorFrame {
    width: u32,
    height: u32,
    seq: u64,
    data: Vec<u8>,
}

impl ColorFrame {
    /// Wrap a BGR24 buffer. Returns None if the buffer size does not match.
    pub fn from_bgr(width: u32, height: u32, seq: u64, data: Vec<u8>) -> Option<Self> {
        if data.len() != width as usize * height as usize * 3 {
            return None;
        }
        Some(Self { width, height, seq, data })
    }

    /// Uniform frame, mostly useful for calibration and tests
    pub fn filled(width: u32, height: u32, seq: u64, bgr: [u8; 3]) -> Self {
        let data = bgr.iter().copied().cycle().take(width as usize * height as usize * 3).collect();
        Self { width, height, seq, data }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Convert to grayscale using fixed-point BT.601 luma weights
    pub fn to_gray(&self) -> MotionFrame {
        let pixels = self
            .data
            .chunks_exact(3)
            .map(|px| {
                let (b, g, r) = (u32::from(px[0]), u32::from(px[1]), u32::from(px[2]));
                ((r * 4899 + g * 9617 + b * 1868 + 8192) >> 14) as u8
            })
            .collect();
        MotionFrame { width: self.width, height: self.height, seq: self.seq, pixels }
    }
}

/// Single-channel 8-bit frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotionFrame {
    pub width: u32,
    pub height: u32,
    pub seq: u64,
    pub pixels: Vec<u8>,
}

impl MotionFrame {
    pub fn new(width: u32, height: u32, seq: u64, pixels: Vec<u8>) -> Option<Self> {
        if pixels.len() != width as usize * height as usize {
            return None;
        }
        Some(Self { width, height, seq, pixels })
    }

    #[inline]
    pub fn same_dimensions(&self, other: &MotionFrame) -> bool {
        self.width == other.width && self.height == other.height
    }

    /// Expand to BGR24 by replicating the single channel
    pub fn to_bgr(&self) -> Vec<u8> {
        self.pixels.iter().flat_map(|&v| [v, v, v]).collect()
    }
}
