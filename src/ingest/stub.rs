//! Synthetic frame source for `stub://` URLs.
//!
//! Produces a moving gradient so a running deployment can be smoke-tested
//! without a camera. Query parameters:
//! - `width`, `height`: frame size (default 640x480)
//! - `fail_after`: number of frames before every pull fails (default never)

use anyhow::{anyhow, Context, Result};
use url::Url;

use super::{CaptureHints, TransportHandle};
use crate::frame::RawImage;

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const MAX_DIMENSION: u32 = 8192;

pub struct SyntheticSource {
    url: String,
    width: u32,
    height: u32,
    fail_after: Option<u64>,
    frame_count: u64,
    /// Simulated scene state, bumped every 50 frames.
    scene_state: u8,
    released: bool,
}

impl SyntheticSource {
    pub fn open(url: &str) -> Result<Self> {
        let parsed = Url::parse(url).with_context(|| format!("parse stub url '{}'", url))?;
        let mut width = DEFAULT_WIDTH;
        let mut height = DEFAULT_HEIGHT;
        let mut fail_after = None;
        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "width" => width = parse_dimension(&value)?,
                "height" => height = parse_dimension(&value)?,
                "fail_after" => {
                    fail_after = Some(
                        value
                            .parse()
                            .with_context(|| format!("invalid fail_after '{}'", value))?,
                    )
                }
                _ => {}
            }
        }
        log::info!("SyntheticSource: connected to {} ({}x{})", url, width, height);
        Ok(Self {
            url: url.to_string(),
            width,
            height,
            fail_after,
            frame_count: 0,
            scene_state: 0,
            released: false,
        })
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let pixel_count = (self.width * self.height * 3) as usize;

        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }

        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }
}

impl TransportHandle for SyntheticSource {
    fn configure(&mut self, _hints: &CaptureHints) -> Result<()> {
        Ok(())
    }

    fn pull(&mut self) -> Result<RawImage> {
        if self.released {
            return Err(anyhow!("synthetic source {} already released", self.url));
        }
        if let Some(limit) = self.fail_after {
            if self.frame_count >= limit {
                return Err(anyhow!("synthetic source {} reached end of stream", self.url));
            }
        }
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Ok(RawImage::new(pixels, self.width, self.height))
    }

    fn release(&mut self) {
        self.released = true;
    }
}

fn parse_dimension(value: &str) -> Result<u32> {
    let parsed: u32 = value
        .parse()
        .with_context(|| format!("invalid dimension '{}'", value))?;
    if parsed == 0 || parsed > MAX_DIMENSION {
        return Err(anyhow!("dimension {} out of range 1..={}", parsed, MAX_DIMENSION));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_frames_vary_between_pulls() -> Result<()> {
        let mut source = SyntheticSource::open("stub://test?width=8&height=4")?;
        let first = source.pull()?;
        let second = source.pull()?;
        assert_eq!(first.pixels().len(), 8 * 4 * 3);
        assert_ne!(first.pixels(), second.pixels());
        Ok(())
    }

    #[test]
    fn synthetic_source_fails_after_limit() -> Result<()> {
        let mut source = SyntheticSource::open("stub://test?width=4&height=4&fail_after=1")?;
        source.pull()?;
        assert!(source.pull().is_err());
        Ok(())
    }

    #[test]
    fn released_source_refuses_pulls() -> Result<()> {
        let mut source = SyntheticSource::open("stub://test?width=4&height=4")?;
        source.release();
        assert!(source.pull().is_err());
        Ok(())
    }

    #[test]
    fn rejects_zero_dimensions() {
        assert!(SyntheticSource::open("stub://test?width=0").is_err());
    }
}
