//! Presentation seam
//!
//! The controller hands every frame it shows, with the boxes to draw on it,
//! to a [`Presenter`]. Drawing the boxes is the presenter's job.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, trace};

use crate::bus::{Event, EventBus, EventName};
use crate::capture::Frame;
use crate::error::BusError;
use crate::tracking::{Color, TrackResult};
use crate::DisplayConfig;

pub trait Presenter {
    fn upload_image(&mut self, frame: &Frame, overlays: &[TrackResult]);
}

/// What the tracker panel would show
#[derive(Debug, Default, Clone)]
pub struct Roster {
    pub trackers: BTreeMap<String, RosterEntry>,
    /// Measured tracking rate of the session
    pub real_fps: f64,
    /// Frame rate the loaded video announced
    pub video_fps: f64,
}

#[derive(Debug, Clone)]
pub struct RosterEntry {
    pub color: Color,
    pub address: String,
    pub fps: f64,
}

/// Headless presenter that logs what a window would draw
pub struct LogPresenter {
    config: DisplayConfig,
    roster: Arc<Mutex<Roster>>,
    frames: u64,
}

impl LogPresenter {
    /// Subscribe to the roster events and start presenting
    pub fn new(bus: &EventBus, config: DisplayConfig) -> Result<Self, BusError> {
        let roster = Arc::new(Mutex::new(Roster::default()));

        let names = [
            EventName::ConnectedNewTracker,
            EventName::RemoveTracker,
            EventName::UpdateTrackerFps,
            EventName::UpdateRealFps,
            EventName::SetInitFps,
        ];
        for name in names {
            let roster = roster.clone();
            bus.subscribe(name, move |event| {
                update_roster(&mut roster.lock().unwrap_or_else(PoisonError::into_inner), event)
            })?;
        }

        info!(
            "Presenting at {}x{}{}",
            config.width,
            config.height,
            if config.fullscreen { " (fullscreen)" } else { "" }
        );

        Ok(Self {
            config,
            roster,
            frames: 0,
        })
    }

    pub fn roster(&self) -> Roster {
        self.roster
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn frames_shown(&self) -> u64 {
        self.frames
    }

    /// Factor that fits a `width`x`height` frame into the display
    pub fn fit_scale(&self, width: u32, height: u32) -> f32 {
        if width == 0 || height == 0 {
            return 1.0;
        }
        let sx = self.config.width as f32 / width as f32;
        let sy = self.config.height as f32 / height as f32;
        sx.min(sy)
    }
}

impl Presenter for LogPresenter {
    fn upload_image(&mut self, frame: &Frame, overlays: &[TrackResult]) {
        self.frames += 1;
        let scale = self.fit_scale(frame.width(), frame.height());
        debug!(
            "Frame {} ({}x{} x{:.2}) with {} trackers",
            frame.index(),
            frame.width(),
            frame.height(),
            scale,
            overlays.len()
        );

        for overlay in overlays {
            match overlay.bbox {
                Some(bbox) => trace!(
                    "  {} {:?}: [{:.0}, {:.0}, {:.0}, {:.0}]",
                    overlay.name,
                    overlay.color.to_rgb8(),
                    bbox.x * scale,
                    bbox.y * scale,
                    bbox.width * scale,
                    bbox.height * scale
                ),
                None => trace!("  {}: target lost", overlay.name),
            }
        }
    }
}

fn update_roster(roster: &mut Roster, event: &Event) {
    match event {
        Event::ConnectedNewTracker {
            name,
            color,
            address,
        } => {
            roster.trackers.insert(
                name.clone(),
                RosterEntry {
                    color: *color,
                    address: address.clone(),
                    fps: 0.0,
                },
            );
        }
        Event::RemoveTracker { name } => {
            roster.trackers.remove(name);
        }
        Event::UpdateTrackerFps { name, fps } => {
            if let Some(entry) = roster.trackers.get_mut(name) {
                entry.fps = *fps;
            }
        }
        Event::UpdateRealFps { fps } => roster.real_fps = *fps,
        Event::SetInitFps { fps } => roster.video_fps = *fps,
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roster_follows_tracker_events() {
        let bus = EventBus::new();
        let presenter = LogPresenter::new(&bus, DisplayConfig::default()).unwrap();

        bus.publish(Event::ConnectedNewTracker {
            name: "kcf".into(),
            color: Color::new(1.0, 0.0, 0.0),
            address: "127.0.0.1:4000".into(),
        });
        bus.publish(Event::UpdateTrackerFps {
            name: "kcf".into(),
            fps: 42.0,
        });
        bus.publish(Event::UpdateRealFps { fps: 9.5 });
        bus.publish(Event::SetInitFps { fps: 25.0 });

        let roster = presenter.roster();
        assert_eq!(roster.trackers["kcf"].fps, 42.0);
        assert_eq!(roster.trackers["kcf"].address, "127.0.0.1:4000");
        assert_eq!(roster.real_fps, 9.5);
        assert_eq!(roster.video_fps, 25.0);

        bus.publish(Event::RemoveTracker { name: "kcf".into() });
        assert!(presenter.roster().trackers.is_empty());
    }

    #[test]
    fn frames_are_fitted_to_the_display() {
        let bus = EventBus::new();
        let presenter = LogPresenter::new(&bus, DisplayConfig::default()).unwrap();

        assert_eq!(presenter.fit_scale(640, 360), 2.0);
        assert_eq!(presenter.fit_scale(2560, 720), 0.5);
        assert_eq!(presenter.fit_scale(0, 0), 1.0);
    }
}
