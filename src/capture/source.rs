//! Paced video decoding on a dedicated thread
//!
//! The decode loop lives as long as the source. While playing it decodes the
//! next frame, announces it as `new-frame` and sleeps out the rest of the
//! frame period; at end of stream it starts over at frame 0. A paused seek
//! makes the loop announce exactly one frame at the new position.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use metrics::counter;
use tracing::{debug, error, info, warn};

use super::decoder::{VideoDecoder, VideoInfo, VideoOpener};
use super::frame::{Frame, FrameMetadata};
use crate::bus::{Event, EventBus, EventName};
use crate::error::{DecodeError, SourceError};
use crate::SourceConfig;

/// Pacing used when a video reports no usable frame rate
const FALLBACK_FPS: f64 = 30.0;

pub struct FrameSource {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    bus: Arc<EventBus>,
    opener: Box<dyn VideoOpener>,
    playback: Mutex<Playback>,
    shutdown: AtomicBool,
    idle: Duration,
}

#[derive(Default)]
struct Playback {
    decoder: Option<Box<dyn VideoDecoder>>,
    info: Option<VideoInfo>,
    playing: bool,
    paused: bool,
    /// Index the next decoded frame gets
    position: u64,
    /// Index of the last announced frame
    current: Option<u64>,
    fps: f64,
    /// A decode error ended this load
    failed: bool,
    /// Announce one frame even though paused
    preview: bool,
}

enum Step {
    Announce(Frame, Duration),
    Preview(Frame),
    Idle,
}

impl FrameSource {
    /// Start the decode thread and subscribe to `init-video` and `set-fps`
    pub fn new(
        bus: Arc<EventBus>,
        opener: Box<dyn VideoOpener>,
        config: &SourceConfig,
    ) -> Result<Arc<Self>, SourceError> {
        let shared = Arc::new(Shared {
            bus: bus.clone(),
            opener,
            playback: Mutex::new(Playback::default()),
            shutdown: AtomicBool::new(false),
            idle: Duration::from_millis(config.idle_poll_ms.max(1)),
        });

        let weak = Arc::downgrade(&shared);
        bus.subscribe(EventName::InitVideo, move |event| {
            if let (Some(shared), Event::InitVideo { path }) = (weak.upgrade(), event) {
                if let Err(e) = shared.load(path) {
                    error!("Failed to load video: {}", e);
                }
            }
        })?;

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        bus.subscribe(EventName::SetFps, move |event| {
            if let (Some(shared), Event::SetFps { fps }) = (weak.upgrade(), event) {
                shared.set_fps(*fps);
            }
        })?;

        let thread = thread::Builder::new()
            .name("artemis-decode".into())
            .spawn({
                let shared = shared.clone();
                move || decode_loop(shared)
            })
            .map_err(SourceError::Thread)?;

        Ok(Arc::new(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        }))
    }

    /// Open `path`, rewind to frame 0 and start playing. Announces the
    /// video's frame rate as `set-init-fps`.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<VideoInfo, SourceError> {
        self.shared.load(path.as_ref())
    }

    pub fn start(&self) {
        let mut playback = self.shared.lock();
        playback.playing = playback.decoder.is_some();
        playback.paused = false;
    }

    pub fn pause(&self) {
        self.shared.lock().paused = true;
    }

    /// Flip between playing and paused, returning whether it now plays
    pub fn toggle_play(&self) -> bool {
        let mut playback = self.shared.lock();
        if playback.playing && !playback.paused {
            playback.paused = true;
        } else {
            playback.playing = playback.decoder.is_some();
            playback.paused = false;
        }
        playback.playing && !playback.paused
    }

    pub fn restart(&self) -> Result<(), SourceError> {
        self.shared.lock().seek_to(0)
    }

    /// Move `delta` frames from the current one, clamped to the clip.
    /// Returns the index the next announced frame will carry.
    pub fn seek(&self, delta: i64) -> Result<u64, SourceError> {
        let mut playback = self.shared.lock();
        let last = playback
            .info
            .and_then(|info| info.frame_count)
            .map_or(u64::MAX, |count| count.saturating_sub(1));
        let target = playback
            .current
            .unwrap_or(0)
            .saturating_add_signed(delta)
            .min(last);

        playback.seek_to(target)?;
        debug!("Seek by {} to frame {}", delta, target);
        Ok(target)
    }

    /// Stop playback and release the decoder
    pub fn stop(&self) {
        let mut playback = self.shared.lock();
        if playback.decoder.is_some() {
            info!("Video stopped");
        }
        *playback = Playback {
            fps: playback.fps,
            ..Playback::default()
        };
    }

    pub fn set_fps(&self, fps: f64) {
        self.shared.set_fps(fps);
    }

    pub fn fps(&self) -> f64 {
        self.shared.lock().fps
    }

    pub fn frame_size(&self) -> Option<(u32, u32)> {
        self.shared.lock().info.map(|info| (info.width, info.height))
    }

    pub fn info(&self) -> Option<VideoInfo> {
        self.shared.lock().info
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    pub fn is_playing(&self) -> bool {
        let playback = self.shared.lock();
        playback.playing && !playback.paused
    }

    /// Index of the last announced frame
    pub fn current_index(&self) -> Option<u64> {
        self.shared.lock().current
    }

    /// Whether a decode error stopped the current load
    pub fn has_failed(&self) -> bool {
        self.shared.lock().failed
    }

    /// Stop the decode thread and drop the bus subscriptions
    pub fn shutdown(&self) {
        let Some(thread) = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.bus.unsubscribe(EventName::InitVideo);
        self.shared.bus.unsubscribe(EventName::SetFps);

        if thread.join().is_err() {
            error!("Decode thread panicked");
        }
        debug!("Frame source shut down");
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Playback> {
        self.playback.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load(&self, path: &Path) -> Result<VideoInfo, SourceError> {
        // Opening may be slow; keep the loop running the old video meanwhile
        let decoder = self.opener.open(path)?;
        let info = decoder.info();

        *self.lock() = Playback {
            decoder: Some(decoder),
            info: Some(info),
            playing: true,
            fps: info.fps,
            ..Playback::default()
        };

        info!(
            "Loaded {:?}: {}x{} @ {:.2} fps ({:?} frames)",
            path, info.width, info.height, info.fps, info.frame_count
        );
        self.bus.publish(Event::SetInitFps { fps: info.fps });
        Ok(info)
    }

    fn set_fps(&self, fps: f64) {
        if !(fps.is_finite() && fps > 0.0) {
            warn!("Ignoring invalid frame rate {}", fps);
            return;
        }
        self.lock().fps = fps;
        debug!("Playback rate set to {:.2} fps", fps);
    }

    fn step(&self) -> Step {
        let mut playback = self.lock();
        let preview = std::mem::take(&mut playback.preview);
        let running = playback.playing && !playback.paused;

        if playback.failed || playback.decoder.is_none() || !(running || preview) {
            return Step::Idle;
        }

        match playback.decode_next() {
            Ok(frame) if running => Step::Announce(frame, playback.period()),
            Ok(frame) => Step::Preview(frame),
            Err(e) => {
                error!("Decoding stopped at frame {}: {}", playback.position, e);
                playback.failed = true;
                Step::Idle
            }
        }
    }

    fn announce(&self, frame: Frame) {
        let index = frame.index();
        counter!("artemis.source.frames").increment(1);
        self.bus.publish(Event::NewFrame { frame, index });
    }
}

impl Playback {
    fn seek_to(&mut self, index: u64) -> Result<(), SourceError> {
        let decoder = self.decoder.as_mut().ok_or(SourceError::NotLoaded)?;
        decoder.seek(index)?;
        self.position = index;
        if self.paused {
            self.preview = true;
        }
        Ok(())
    }

    fn decode_next(&mut self) -> Result<Frame, DecodeError> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Err(DecodeError::Backend("no decoder".into()));
        };

        let raw = match decoder.next_frame()? {
            Some(raw) => raw,
            None => {
                decoder.seek(0)?;
                self.position = 0;
                decoder
                    .next_frame()?
                    .ok_or_else(|| DecodeError::Corrupt("stream has no frames".into()))?
            }
        };

        let index = self.position;
        self.position += 1;
        self.current = Some(index);

        Ok(Frame::new(
            raw.data,
            FrameMetadata {
                index,
                width: raw.width,
                height: raw.height,
                stride: raw.stride,
                format: raw.format,
            },
        ))
    }

    fn period(&self) -> Duration {
        let fps = if self.fps.is_finite() && self.fps > 0.0 {
            self.fps
        } else {
            FALLBACK_FPS
        };
        Duration::from_secs_f64(1.0 / fps)
    }
}

fn decode_loop(shared: Arc<Shared>) {
    debug!("Decode loop started");

    while !shared.shutdown.load(Ordering::Acquire) {
        let started = Instant::now();
        match shared.step() {
            Step::Announce(frame, period) => {
                shared.announce(frame);
                thread::sleep(period.saturating_sub(started.elapsed()));
            }
            Step::Preview(frame) => shared.announce(frame),
            Step::Idle => thread::sleep(shared.idle),
        }
    }

    debug!("Decode loop finished");
}
