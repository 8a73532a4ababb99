//! GStreamer-based video file decoding

use std::path::Path;

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info};

use super::decoder::{RawFrame, VideoDecoder, VideoInfo, VideoOpener};
use super::frame::PixelFormat;
use crate::error::{DecodeError, SourceError};

/// Fallback when a container does not advertise a frame rate
const DEFAULT_FPS: f64 = 30.0;

/// Opens video files through a GStreamer decode pipeline
#[derive(Debug, Default, Clone, Copy)]
pub struct GstOpener;

impl VideoOpener for GstOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn VideoDecoder>, SourceError> {
        Ok(Box::new(GstFileDecoder::open(path)?))
    }
}

/// Decodes a file to RGB frames pulled from an appsink
pub struct GstFileDecoder {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    info: VideoInfo,
}

impl GstFileDecoder {
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        let fail = |reason: String| SourceError::Open {
            path: path.to_path_buf(),
            reason,
        };

        gst::init().map_err(|e| fail(format!("Failed to initialize GStreamer: {}", e)))?;

        let pipeline_str = Self::build_pipeline_string(path);
        info!("Pipeline: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| fail(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| fail("Failed to create pipeline".into()))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| fail("Failed to find appsink element".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| fail("Failed to cast to AppSink".into()))?;

        // Preroll so caps and duration are known before the first pull
        pipeline
            .set_state(gst::State::Paused)
            .map_err(|e| fail(format!("Failed to preroll pipeline: {:?}", e)))?;
        let (state_change, _, _) = pipeline.state(Some(gst::ClockTime::from_seconds(5)));
        state_change.map_err(|e| fail(format!("Pipeline did not preroll: {:?}", e)))?;

        let preroll = appsink
            .pull_preroll()
            .map_err(|_| fail("Failed to pull preroll sample".into()))?;
        let caps = preroll.caps().ok_or_else(|| fail("Sample has no caps".into()))?;
        let video_info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|_| fail("Failed to parse video info from caps".into()))?;

        let rate = video_info.fps();
        let fps = if rate.numer() > 0 && rate.denom() > 0 {
            rate.numer() as f64 / rate.denom() as f64
        } else {
            DEFAULT_FPS
        };
        let frame_count = pipeline
            .query_duration::<gst::ClockTime>()
            .map(|d| (d.nseconds() as f64 / 1e9 * fps).round() as u64);

        let info = VideoInfo {
            fps,
            width: video_info.width(),
            height: video_info.height(),
            frame_count,
        };
        debug!("Opened {:?}: {:?}", path, info);

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| fail(format!("Failed to start pipeline: {:?}", e)))?;

        Ok(Self {
            pipeline,
            appsink,
            info,
        })
    }

    fn build_pipeline_string(path: &Path) -> String {
        // sync=false: the frame source paces output itself
        format!(
            "filesrc location=\"{}\" ! \
             decodebin ! \
             videoconvert ! \
             video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=4",
            path.display()
        )
    }

    fn timestamp_of(&self, index: u64) -> gst::ClockTime {
        gst::ClockTime::from_nseconds((index as f64 / self.info.fps * 1e9) as u64)
    }
}

impl VideoDecoder for GstFileDecoder {
    fn info(&self) -> VideoInfo {
        self.info
    }

    fn next_frame(&mut self) -> Result<Option<RawFrame>, DecodeError> {
        if self.appsink.is_eos() {
            return Ok(None);
        }

        let sample = match self.appsink.pull_sample() {
            Ok(sample) => sample,
            Err(_) if self.appsink.is_eos() => return Ok(None),
            Err(_) => {
                return Err(DecodeError::Backend(
                    "Failed to pull sample from pipeline".into(),
                ))
            }
        };

        let buffer = sample
            .buffer()
            .ok_or_else(|| DecodeError::Corrupt("Sample contains no buffer".into()))?;
        let map = buffer
            .map_readable()
            .map_err(|_| DecodeError::Corrupt("Failed to map buffer".into()))?;

        let caps = sample
            .caps()
            .ok_or_else(|| DecodeError::Corrupt("Sample has no caps".into()))?;
        let video_info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|_| DecodeError::Corrupt("Failed to parse video info from caps".into()))?;

        Ok(Some(RawFrame {
            data: Bytes::copy_from_slice(map.as_slice()),
            width: video_info.width(),
            height: video_info.height(),
            stride: video_info.stride()[0] as u32,
            format: PixelFormat::Rgb24, // Output is always RGB after conversion
        }))
    }

    fn seek(&mut self, index: u64) -> Result<(), DecodeError> {
        self.pipeline
            .seek_simple(
                gst::SeekFlags::FLUSH | gst::SeekFlags::ACCURATE,
                self.timestamp_of(index),
            )
            .map_err(|_| DecodeError::Seek(index))
    }
}

impl Drop for GstFileDecoder {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
