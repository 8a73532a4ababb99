use std::path::Path;

use bytes::Bytes;

use super::frame::PixelFormat;
use crate::error::{DecodeError, SourceError};

/// Properties of an opened video
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    /// Unknown for streams without a duration
    pub frame_count: Option<u64>,
}

/// Decoded pixels before the source stamps an index on them
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
}

/// A video being decoded frame by frame
pub trait VideoDecoder: Send {
    fn info(&self) -> VideoInfo;

    /// Next frame, `Ok(None)` at end of stream
    fn next_frame(&mut self) -> Result<Option<RawFrame>, DecodeError>;

    /// Position the decoder so the next frame returned is `index`
    fn seek(&mut self, index: u64) -> Result<(), DecodeError>;
}

/// Opens videos for the frame source
pub trait VideoOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn VideoDecoder>, SourceError>;
}
