//! Tracker network: wire protocol, per-worker links and the broker that fans
//! frames out to every connected tracker process.

pub mod broker;
pub mod cache;
pub mod link;
pub mod wire;
pub mod worker;

use serde::{Deserialize, Serialize};

use crate::capture::BoundingBox;

pub use broker::{DispatchReport, TrackerBroker};
pub use cache::ResultCache;
pub use link::TrackerLink;
pub use worker::{WorkerConnection, WorkerRequest};

/// Display color of a tracker, RGB components in `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Color(pub [f32; 3]);

impl Color {
    pub fn new(r: f32, g: f32, b: f32) -> Self {
        Self([r, g, b])
    }

    pub fn is_valid(&self) -> bool {
        self.0.iter().all(|c| c.is_finite() && (0.0..=1.0).contains(c))
    }

    /// 8-bit RGB for compositing onto frames
    pub fn to_rgb8(self) -> [u8; 3] {
        self.0.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8)
    }
}

/// Who a connected tracker is; fixed at handshake
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerIdentity {
    pub name: String,
    pub color: Color,
    pub address: String,
}

/// One tracker's contribution to the aggregate of a frame
#[derive(Debug, Clone, PartialEq)]
pub struct TrackResult {
    pub name: String,
    /// `None` when the tracker has no box for this frame
    pub bbox: Option<BoundingBox>,
    pub color: Color,
}
