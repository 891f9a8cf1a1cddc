//! Streaming transport backend using GStreamer.
//!
//! RTSP URLs get an explicit `rtspsrc` pipeline so the low-latency options
//! (TCP transport, zero jitterbuffer latency, socket timeout) can be applied;
//! every other streaming URL goes through `uridecodebin`. Both end in an RGB
//! `appsink` that keeps at most one queued sample and drops the rest.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use std::time::Duration;

use super::{
    timeout_option, CaptureHints, TransportHandle, TransportMode, TransportOptions,
    OPT_RTSP_TRANSPORT, OPT_RW_TIMEOUT_US, OPT_TIMEOUT_US,
};
use crate::frame::RawImage;

const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct GstreamerSource {
    url: String,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    pull_timeout: Duration,
    frame_count: u64,
    released: bool,
}

impl GstreamerSource {
    pub fn open(url: &str, options: &TransportOptions) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let description = pipeline_description(url, options);
        let pipeline = gstreamer::parse::launch(&description)
            .context("build streaming pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("streaming pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        let open_timeout = timeout_option(options, OPT_TIMEOUT_US).unwrap_or(DEFAULT_OPEN_TIMEOUT);
        let pull_timeout =
            timeout_option(options, OPT_RW_TIMEOUT_US).unwrap_or(DEFAULT_PULL_TIMEOUT);

        let mut source = Self {
            url: url.to_string(),
            pipeline,
            appsink,
            pull_timeout,
            frame_count: 0,
            released: false,
        };
        if let Err(err) = source.start(open_timeout) {
            source.release();
            return Err(err);
        }
        Ok(source)
    }

    fn start(&mut self, timeout: Duration) -> Result<()> {
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .context("set streaming pipeline to Playing")?;
        let (result, _current, _pending) = self
            .pipeline
            .state(gstreamer::ClockTime::from_mseconds(timeout.as_millis() as u64));
        result.map_err(|_| anyhow!("pipeline for {} failed to start", self.url))?;
        self.check_bus()?;
        log::info!("GstreamerSource: connected to {}", self.url);
        Ok(())
    }

    fn check_bus(&self) -> Result<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(anyhow!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => return Err(anyhow!("gstreamer reached EOS")),
                _ => {}
            }
        }
        Ok(())
    }
}

impl TransportHandle for GstreamerSource {
    fn configure(&mut self, hints: &CaptureHints) -> Result<()> {
        self.appsink.set_max_buffers(hints.buffer_size.max(1));
        if hints.fps > 0 {
            // Allow a few frame periods before a pull counts as stalled.
            let per_frame = Duration::from_millis((1000 / hints.fps as u64).max(1));
            self.pull_timeout = self.pull_timeout.max(per_frame * 4);
        }
        if hints.transport_mode == TransportMode::Tcp && !self.url.starts_with("rtsp") {
            return Err(anyhow!("transport mode only applies to rtsp sources"));
        }
        Ok(())
    }

    fn pull(&mut self) -> Result<RawImage> {
        if self.released {
            return Err(anyhow!("stream {} already released", self.url));
        }
        self.check_bus()?;
        let sample = self
            .appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(
                self.pull_timeout.as_millis() as u64,
            ))
            .ok_or_else(|| anyhow!("stream {} stalled", self.url))?;
        let image = sample_to_image(&sample)?;
        self.frame_count += 1;
        Ok(image)
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("GstreamerSource: failed to stop pipeline for {}: {}", self.url, err);
        }
        log::debug!(
            "GstreamerSource: released {} after {} frames",
            self.url,
            self.frame_count
        );
    }
}

fn pipeline_description(url: &str, options: &TransportOptions) -> String {
    let sink = "videoconvert ! video/x-raw,format=RGB ! \
                appsink name=appsink sync=false max-buffers=1 drop=true";
    if url.starts_with("rtsp://") || url.starts_with("rtsps://") {
        let protocols = match options.get(OPT_RTSP_TRANSPORT).map(String::as_str) {
            Some("tcp") => " protocols=tcp",
            Some("udp") => " protocols=udp",
            _ => "",
        };
        let timeout = options
            .get(OPT_TIMEOUT_US)
            .map(|us| format!(" timeout={}", us))
            .unwrap_or_default();
        format!(
            "rtspsrc location=\"{}\" latency=0{}{} ! decodebin ! {}",
            url, protocols, timeout, sink
        )
    } else {
        format!("uridecodebin uri=\"{}\" ! {}", url, sink)
    }
}

fn sample_to_image(sample: &gstreamer::Sample) -> Result<RawImage> {
    let buffer = sample.buffer().context("sample missing buffer")?;
    let caps = sample.caps().context("sample missing caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).context("parse caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map sample buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let pixels = data.get(..len).context("sample buffer is truncated")?;
        return Ok(RawImage::new(pixels.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(data.get(start..end).context("sample row is out of bounds")?);
    }
    Ok(RawImage::new(pixels, width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtsp_pipeline_applies_tcp_and_timeout() {
        let mut options = TransportOptions::new();
        options.insert(OPT_RTSP_TRANSPORT.into(), "tcp".into());
        options.insert(OPT_TIMEOUT_US.into(), "5000000".into());
        let description = pipeline_description("rtsp://cam/stream", &options);
        assert!(description.starts_with("rtspsrc location=\"rtsp://cam/stream\" latency=0"));
        assert!(description.contains("protocols=tcp"));
        assert!(description.contains("timeout=5000000"));
        assert!(description.contains("appsink name=appsink"));
    }

    #[test]
    fn other_streams_use_uridecodebin() {
        let description =
            pipeline_description("rtmp://cam/live", &TransportOptions::new());
        assert!(description.starts_with("uridecodebin uri=\"rtmp://cam/live\""));
    }
}
