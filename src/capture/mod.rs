pub mod decoder;
pub mod frame;
#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_decoder;
pub mod source;
pub mod synthetic;

pub use decoder::{RawFrame, VideoDecoder, VideoInfo, VideoOpener};
pub use frame::{BoundingBox, Frame, FrameMetadata, PixelFormat};
pub use source::FrameSource;
pub use synthetic::SyntheticOpener;

#[cfg(feature = "gstreamer-pipeline")]
pub use gst_decoder::GstOpener;
