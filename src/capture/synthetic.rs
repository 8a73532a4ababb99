//! Generated clip for demo runs and tests
//!
//! Every pixel byte of frame `n` is `n % 256`, so consumers can tell which
//! frame they got from the pixels alone.

use std::path::Path;

use bytes::Bytes;
use tracing::info;

use super::decoder::{RawFrame, VideoDecoder, VideoInfo, VideoOpener};
use super::frame::PixelFormat;
use crate::error::{DecodeError, SourceError};

#[derive(Debug, Clone)]
pub struct SyntheticOpener {
    frames: u64,
    fps: f64,
    width: u32,
    height: u32,
    fail_at: Option<u64>,
}

impl SyntheticOpener {
    pub fn new(frames: u64, fps: f64, width: u32, height: u32) -> Self {
        Self {
            frames,
            fps,
            width,
            height,
            fail_at: None,
        }
    }

    /// Make the decoder report a backend failure when it reaches `index`
    pub fn failing_at(mut self, index: u64) -> Self {
        self.fail_at = Some(index);
        self
    }
}

impl VideoOpener for SyntheticOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn VideoDecoder>, SourceError> {
        if self.frames == 0 || !(self.fps > 0.0) {
            return Err(SourceError::Open {
                path: path.to_path_buf(),
                reason: format!("empty synthetic clip ({} frames @ {} fps)", self.frames, self.fps),
            });
        }

        info!(
            "Opening synthetic clip for {:?}: {} frames {}x{} @ {} fps",
            path, self.frames, self.width, self.height, self.fps
        );

        Ok(Box::new(SyntheticClip {
            opener: self.clone(),
            position: 0,
        }))
    }
}

struct SyntheticClip {
    opener: SyntheticOpener,
    position: u64,
}

impl VideoDecoder for SyntheticClip {
    fn info(&self) -> VideoInfo {
        VideoInfo {
            fps: self.opener.fps,
            width: self.opener.width,
            height: self.opener.height,
            frame_count: Some(self.opener.frames),
        }
    }

    fn next_frame(&mut self) -> Result<Option<RawFrame>, DecodeError> {
        if self.opener.fail_at == Some(self.position) {
            return Err(DecodeError::Backend(format!(
                "injected failure at frame {}",
                self.position
            )));
        }
        if self.position >= self.opener.frames {
            return Ok(None);
        }

        let (width, height) = (self.opener.width, self.opener.height);
        let fill = (self.position % 256) as u8;
        self.position += 1;

        Ok(Some(RawFrame {
            data: Bytes::from(vec![fill; (width * height * 3) as usize]),
            width,
            height,
            stride: width * 3,
            format: PixelFormat::Rgb24,
        }))
    }

    fn seek(&mut self, index: u64) -> Result<(), DecodeError> {
        if index > self.opener.frames {
            return Err(DecodeError::Seek(index));
        }
        self.position = index;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_ends_and_seeks() {
        let mut clip = SyntheticOpener::new(3, 10.0, 2, 2).open(Path::new("clip")).unwrap();
        assert_eq!(clip.info().frame_count, Some(3));

        for expected in 0..3u8 {
            let frame = clip.next_frame().unwrap().unwrap();
            assert_eq!(frame.data[0], expected);
            assert_eq!(frame.data.len(), 12);
        }
        assert!(clip.next_frame().unwrap().is_none());

        clip.seek(1).unwrap();
        assert_eq!(clip.next_frame().unwrap().unwrap().data[0], 1);
        assert!(matches!(clip.seek(9), Err(DecodeError::Seek(9))));
    }

    #[test]
    fn empty_clip_does_not_open() {
        assert!(SyntheticOpener::new(0, 10.0, 2, 2)
            .open(Path::new("clip"))
            .is_err());
    }
}
