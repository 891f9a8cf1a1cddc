//! HTTP motion-JPEG source.
//!
//! Handles two kinds of endpoint:
//! - `multipart/x-mixed-replace` streams: JPEGs are cut out of the byte stream
//!   by their SOI/EOI markers
//! - plain JPEG snapshot URLs: every pull re-fetches the image
//!
//! JPEGs are decoded in memory to RGB; re-encoding happens in the pump.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::Duration;

use image::GenericImageView;

use super::{timeout_option, TransportOptions, OPT_RW_TIMEOUT_US, OPT_TIMEOUT_US};
use super::TransportHandle;
use crate::frame::RawImage;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct MjpegSource {
    url: String,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
    frame_count: u64,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    Snapshot,
}

impl MjpegSource {
    pub fn open(url: &str, options: &TransportOptions) -> Result<Self> {
        let connect_timeout = timeout_option(options, OPT_TIMEOUT_US).unwrap_or(DEFAULT_TIMEOUT);
        let read_timeout = timeout_option(options, OPT_RW_TIMEOUT_US).unwrap_or(DEFAULT_TIMEOUT);
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(connect_timeout)
            .timeout_read(read_timeout)
            .build();

        let response = agent
            .get(url)
            .call()
            .with_context(|| format!("connect to http source {}", url))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        let stream = if content_type.contains("multipart") {
            HttpStream::Mjpeg(MjpegStream::new(response.into_reader()))
        } else {
            // Snapshot endpoint: the first body is discarded, pulls re-fetch.
            HttpStream::Snapshot
        };
        log::info!("MjpegSource: connected to {} ({})", url, content_type);

        Ok(Self {
            url: url.to_string(),
            agent,
            stream: Some(stream),
            frame_count: 0,
        })
    }

    fn fetch_snapshot(&self) -> Result<Vec<u8>> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .with_context(|| format!("fetch jpeg snapshot from {}", self.url))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_JPEG_BYTES as u64)
            .read_to_end(&mut bytes)
            .context("read jpeg snapshot")?;
        if bytes.is_empty() {
            return Err(anyhow!("empty jpeg snapshot"));
        }
        Ok(bytes)
    }
}

impl TransportHandle for MjpegSource {
    fn pull(&mut self) -> Result<RawImage> {
        let jpeg = match self.stream.as_mut() {
            Some(HttpStream::Mjpeg(stream)) => stream.read_next_jpeg()?,
            Some(HttpStream::Snapshot) => self.fetch_snapshot()?,
            None => return Err(anyhow!("http source {} already released", self.url)),
        };
        let image = decode_jpeg(&jpeg)?;
        self.frame_count += 1;
        Ok(image)
    }

    fn release(&mut self) {
        self.stream = None;
        log::debug!(
            "MjpegSource: released {} after {} frames",
            self.url,
            self.frame_count
        );
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn decode_jpeg(bytes: &[u8]) -> Result<RawImage> {
    let image = image::load_from_memory(bytes).context("decode jpeg")?;
    let (width, height) = image.dimensions();
    Ok(RawImage::new(image.into_rgb8().into_raw(), width, height))
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn tiny_jpeg() -> Vec<u8> {
        let image = image::RgbImage::from_pixel(4, 2, image::Rgb([10, 200, 30]));
        let mut out = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 90)
            .encode_image(&image)
            .unwrap();
        out
    }

    #[test]
    fn finds_jpeg_between_markers() {
        let buffer = [0x00, 0x11, 0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9, 0x33];
        assert_eq!(find_jpeg_bounds(&buffer), Some((2, 8)));
        assert_eq!(find_jpeg_bounds(&[0xFF, 0xD8, 0x01]), None);
    }

    #[test]
    fn mjpeg_stream_splits_multipart_body() -> Result<()> {
        let jpeg = tiny_jpeg();
        let mut body = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        body.extend_from_slice(&jpeg);
        body.extend_from_slice(b"\r\n--frame\r\nContent-Type: image/jpeg\r\n\r\n");
        body.extend_from_slice(&jpeg);
        body.extend_from_slice(b"\r\n");

        let mut stream = MjpegStream::new(Box::new(Cursor::new(body)));
        let first = stream.read_next_jpeg()?;
        let second = stream.read_next_jpeg()?;
        assert_eq!(first, jpeg);
        assert_eq!(second, jpeg);
        assert!(stream.read_next_jpeg().is_err());

        let decoded = decode_jpeg(&first)?;
        assert_eq!((decoded.width, decoded.height), (4, 2));
        Ok(())
    }
}
