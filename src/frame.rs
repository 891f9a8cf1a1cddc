//! Frame types and the encode path.
//!
//! - `RawImage`: decoded RGB8 pixels as handed over by a transport.
//! - `EncodedFrame`: JPEG bytes shared cheaply between the pump and readers.
//! - `FrameBuffer`: bounded ring of the most recent encoded frames.
//! - `FrameProcessor`: downsample to the configured width, then JPEG-encode.

use std::collections::VecDeque;
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::RgbImage;

use crate::error::PipelineError;

/// Capacity of the per-session frame ring.
pub const FRAME_BUFFER_CAPACITY: usize = 3;

// ----------------------------------------------------------------------------
// RawImage: decoded pixels from a transport
// ----------------------------------------------------------------------------

/// Decoded frame in packed RGB8 layout (`width * height * 3` bytes).
pub struct RawImage {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl RawImage {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            pixels,
            width,
            height,
        }
    }

    /// Solid-color image, handy for synthetic sources.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let pixels = rgb
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 3)
            .collect();
        Self::new(pixels, width, height)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub(crate) fn into_rgb(self) -> Result<RgbImage, PipelineError> {
        let (width, height) = (self.width, self.height);
        let len = self.pixels.len();
        RgbImage::from_raw(width, height, self.pixels).ok_or_else(|| {
            PipelineError::Processing(format!(
                "pixel buffer of {} bytes does not match {}x{} rgb",
                len, width, height
            ))
        })
    }
}

// ----------------------------------------------------------------------------
// EncodedFrame: what readers get
// ----------------------------------------------------------------------------

/// JPEG-encoded frame. Cloning shares the underlying bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedFrame {
    data: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    sequence: u64,
}

impl EncodedFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data: data.into(),
            width,
            height,
            sequence: 0,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Position of this frame in its stream's publication order, starting at 1.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub(crate) fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }
}

// ----------------------------------------------------------------------------
// FrameBuffer: bounded ring of recent frames
// ----------------------------------------------------------------------------

/// Bounded FIFO of encoded frames. Oldest frames are evicted first.
#[derive(Debug)]
pub struct FrameBuffer {
    frames: VecDeque<EncodedFrame>,
    capacity: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::with_capacity(FRAME_BUFFER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a frame, evicting from the front while at capacity.
    pub fn push(&mut self, frame: EncodedFrame) {
        while self.frames.len() >= self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    /// Most recently pushed frame.
    pub fn latest(&self) -> Option<&EncodedFrame> {
        self.frames.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EncodedFrame> + '_ {
        self.frames.iter()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// FrameProcessor: resize + encode
// ----------------------------------------------------------------------------

/// Turns raw transport output into the JPEG bytes served to clients.
#[derive(Clone, Copy, Debug)]
pub struct FrameProcessor {
    max_width: u32,
    quality: u8,
}

impl FrameProcessor {
    /// `quality` is clamped to 1..=100; a `max_width` of 0 disables downsampling.
    pub fn new(max_width: u32, quality: u8) -> Self {
        Self {
            max_width,
            quality: quality.clamp(1, 100),
        }
    }

    pub fn max_width(&self) -> u32 {
        self.max_width
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    pub fn process(&self, raw: RawImage) -> Result<EncodedFrame, PipelineError> {
        if raw.width == 0 || raw.height == 0 {
            return Err(PipelineError::Processing(format!(
                "empty frame ({}x{})",
                raw.width, raw.height
            )));
        }
        let (width, height) = scaled_dimensions(raw.width, raw.height, self.max_width);
        let mut image = raw.into_rgb()?;
        if width != image.width() {
            image = image::imageops::resize(&image, width, height, FilterType::Triangle);
        }

        let mut jpeg = Vec::with_capacity((width as usize * height as usize) / 8);
        JpegEncoder::new_with_quality(&mut jpeg, self.quality)
            .encode_image(&image)
            .map_err(|e| PipelineError::Processing(format!("jpeg encode: {}", e)))?;

        Ok(EncodedFrame::new(jpeg, width, height))
    }
}

/// Target dimensions for a frame capped at `max_width`, aspect ratio kept.
pub fn scaled_dimensions(width: u32, height: u32, max_width: u32) -> (u32, u32) {
    if max_width == 0 || width <= max_width {
        return (width, height);
    }
    let scaled = (height as f64 * max_width as f64 / width as f64).round() as u32;
    (max_width, scaled.max(1))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
