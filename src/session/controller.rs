//! Session state machine
//!
//! The controller runs on its own (non-runtime) thread. New frames reach it
//! through a bounded channel fed by the `new-frame` subscriber, so a slow
//! tracking round holds back the decode loop instead of piling up frames.
//! Broker calls are driven to completion with [`Handle::block_on`].

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError};
use metrics::gauge;
use tokio::runtime::Handle;
use tracing::{debug, info, instrument, warn};

use super::command::Command;
use super::state::SessionState;
use crate::bus::{Event, EventBus, EventName};
use crate::capture::{BoundingBox, Frame, FrameSource};
use crate::display::Presenter;
use crate::error::SessionError;
use crate::tracking::{DispatchReport, TrackResult, TrackerBroker};
use crate::{Config, Metrics};

/// Requests arriving over the bus
#[derive(Debug)]
enum Signal {
    Stop,
    Failed(String),
}

pub struct SessionController<P> {
    bus: Arc<EventBus>,
    source: Arc<FrameSource>,
    broker: Arc<TrackerBroker>,
    presenter: P,
    runtime: Handle,
    frames: Receiver<Frame>,
    signals: Receiver<Signal>,
    state: SessionState,
    last_frame: Option<Frame>,
    tick_interval: Duration,
    metrics: Metrics,
}

impl<P: Presenter> SessionController<P> {
    /// Subscribe to `new-frame`, `stop-tracking` and `error-tracking`.
    ///
    /// `runtime` must belong to a runtime the controller's thread is not
    /// part of.
    pub fn new(
        bus: Arc<EventBus>,
        source: Arc<FrameSource>,
        broker: Arc<TrackerBroker>,
        presenter: P,
        runtime: Handle,
        config: &Config,
    ) -> Result<Self, SessionError> {
        let (frame_tx, frames) = flume::bounded(config.source.frame_queue.max(1));
        let (signal_tx, signals) = flume::unbounded();

        bus.subscribe(EventName::NewFrame, move |event| {
            if let Event::NewFrame { frame, .. } = event {
                // Fails only once the controller is gone
                let _ = frame_tx.send(frame.clone());
            }
        })?;

        let tx = signal_tx.clone();
        bus.subscribe(EventName::StopTracking, move |_| {
            let _ = tx.send(Signal::Stop);
        })?;

        bus.subscribe(EventName::ErrorTracking, move |event| {
            if let Event::ErrorTracking { name } = event {
                let _ = signal_tx.send(Signal::Failed(name.clone()));
            }
        })?;

        Ok(Self {
            bus,
            source,
            broker,
            presenter,
            runtime,
            frames,
            signals,
            state: SessionState::Playing,
            last_frame: None,
            tick_interval: Duration::from_millis(config.session.tick_interval_ms.max(1)),
            metrics: Metrics::default(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn presenter(&self) -> &P {
        &self.presenter
    }

    pub fn presenter_mut(&mut self) -> &mut P {
        &mut self.presenter
    }

    /// Index of the frame presented last
    pub fn last_frame_index(&self) -> Option<u64> {
        self.last_frame.as_ref().map(Frame::index)
    }

    pub fn metrics(&self) -> Metrics {
        Metrics {
            connected_trackers: self.broker.len(),
            ..self.metrics.clone()
        }
    }

    /// Start tracking `roi` on the frame shown last. With no tracker
    /// connected the session keeps playing.
    #[instrument(skip(self))]
    pub fn select_roi(&mut self, roi: BoundingBox) -> Result<SessionState, SessionError> {
        self.require(SessionState::Playing, "region selection")?;
        let frame = self.last_frame.clone().ok_or(SessionError::NoFrame)?;

        if !roi.is_finite() || roi.width <= 0.0 || roi.height <= 0.0 {
            warn!("Ignoring degenerate region {:?}", roi);
            return Ok(self.state);
        }
        if self.broker.is_empty() {
            info!("No trackers connected, region ignored");
            return Ok(self.state);
        }

        let was_playing = self.source.is_playing();
        self.source.pause();
        let report = self
            .runtime
            .block_on(self.broker.dispatch_init(&frame, roi));
        self.evict(report.failed);
        // Their queued error-tracking names go with them
        self.drain_signals();
        if was_playing {
            self.source.start();
        }

        if self.broker.is_empty() {
            warn!("Every tracker failed to initialize");
        } else {
            self.transition(SessionState::Tracking);
        }
        Ok(self.state)
    }

    /// Pause and browse the results tracked so far
    pub fn request_view(&mut self) -> Result<(), SessionError> {
        self.require(SessionState::Tracking, "viewing")?;
        self.source.pause();
        self.runtime.block_on(self.broker.stop_all());
        self.transition(SessionState::Viewing);
        Ok(())
    }

    pub fn request_stop(&mut self) -> Result<(), SessionError> {
        self.require(SessionState::Tracking, "stopping")?;
        self.runtime.block_on(self.broker.stop_all());
        self.transition(SessionState::Playing);
        Ok(())
    }

    /// Leave the results view
    pub fn request_resume(&mut self) -> Result<(), SessionError> {
        self.require(SessionState::Viewing, "resuming")?;
        self.transition(SessionState::Playing);
        Ok(())
    }

    /// Play or pause; allowed in every state. Returns whether it now plays.
    pub fn toggle_play(&mut self) -> bool {
        self.source.toggle_play()
    }

    pub fn restart(&mut self) -> Result<(), SessionError> {
        self.forbid(SessionState::Tracking, "restart")?;
        Ok(self.source.restart()?)
    }

    /// Move `delta` frames, returning the target index
    pub fn seek(&mut self, delta: i64) -> Result<u64, SessionError> {
        self.forbid(SessionState::Tracking, "seeking")?;
        Ok(self.source.seek(delta)?)
    }

    /// Wait up to one tick interval for a frame and handle it. Returns the
    /// index of the presented frame, if any.
    pub fn tick(&mut self) -> Result<Option<u64>, SessionError> {
        let frame = match self.frames.recv_timeout(self.tick_interval) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        };

        self.drain_signals();
        if self.state == SessionState::Tracking && self.broker.is_empty() {
            info!("No trackers left");
            self.transition(SessionState::Playing);
        }

        Ok(frame.map(|frame| self.handle_frame(frame)))
    }

    /// Carry out one operator command. `Quit` is left to the caller.
    pub fn apply(&mut self, command: Command) -> Result<(), SessionError> {
        debug!("Operator command {:?}", command);
        match command {
            Command::TogglePlay => {
                let playing = self.toggle_play();
                info!("{}", if playing { "Playing" } else { "Paused" });
            }
            Command::Restart => self.restart()?,
            Command::Seek(delta) => {
                let target = self.seek(delta)?;
                debug!("Seeking to frame {}", target);
            }
            Command::SelectRoi(roi) => {
                self.select_roi(roi)?;
            }
            Command::View => self.request_view()?,
            Command::Stop => self.request_stop()?,
            Command::Resume => self.request_resume()?,
            Command::Open(path) => {
                self.bus.publish(Event::InitVideo { path });
            }
            Command::Fps(fps) => {
                self.bus.publish(Event::SetFps { fps });
            }
            Command::Draw { name, draw } => {
                self.bus.publish(Event::ChangedDrawMode { name, draw });
            }
            Command::Listen(address) => {
                self.bus.publish(Event::ChangedAddressServer { address });
            }
            Command::Quit => {}
        }
        Ok(())
    }

    /// Tick until `shutdown` is raised or a `Quit` command arrives. Commands
    /// the session refuses are logged and skipped.
    pub fn run(
        &mut self,
        shutdown: &AtomicBool,
        commands: &Receiver<Command>,
    ) -> Result<(), SessionError> {
        info!("Session running");
        'session: while !shutdown.load(Ordering::Acquire) {
            for command in commands.try_iter() {
                if command == Command::Quit {
                    break 'session;
                }
                if let Err(e) = self.apply(command) {
                    warn!("Command refused: {}", e);
                }
            }
            self.tick()?;
        }
        info!("Session finished in state {}", self.state);
        Ok(())
    }

    fn handle_frame(&mut self, frame: Frame) -> u64 {
        let index = frame.index();
        let overlays = match self.state {
            SessionState::Playing => Vec::new(),
            SessionState::Tracking => self.track(&frame),
            SessionState::Viewing => self.broker.collect_results(index),
        };

        self.presenter.upload_image(&frame, &overlays);
        self.last_frame = Some(frame);
        index
    }

    fn track(&mut self, frame: &Frame) -> Vec<TrackResult> {
        let report = self.runtime.block_on(self.broker.dispatch_frame(frame));
        self.record(&report);

        // Links that failed on this frame are gone before results are read
        self.evict(report.failed);
        self.drain_signals();

        if self.broker.is_empty() && self.state == SessionState::Tracking {
            info!("No trackers left");
            self.transition(SessionState::Playing);
        }
        self.broker.collect_results(frame.index())
    }

    /// Throughput of one tracking round: its wall-clock time as a rate
    fn record(&mut self, report: &DispatchReport) {
        let elapsed = report.elapsed.as_secs_f64();
        if elapsed > 0.0 {
            let fps = 1.0 / elapsed;
            self.metrics.real_fps = fps;
            gauge!("artemis.session.real_fps").set(fps);
            self.bus.publish(Event::UpdateRealFps { fps });
        }

        let tracked = &mut self.metrics;
        tracked.frames_tracked += 1;
        tracked.dispatch_failures += report.failed.len() as u64;
        let ms = elapsed * 1000.0;
        tracked.avg_dispatch_ms += (ms - tracked.avg_dispatch_ms) / tracked.frames_tracked as f64;
    }

    fn drain_signals(&mut self) {
        let mut failed = Vec::new();
        for signal in self.signals.try_iter().collect::<Vec<_>>() {
            match signal {
                Signal::Failed(name) => failed.push(name),
                Signal::Stop => {
                    if let Err(e) = self.request_stop() {
                        debug!("Ignoring stop-tracking: {}", e);
                    }
                }
            }
        }
        self.evict(failed);
    }

    fn evict(&mut self, names: impl IntoIterator<Item = String>) {
        let names: BTreeSet<String> = names.into_iter().collect();
        for name in names {
            if self.runtime.block_on(self.broker.evict_failed(&name)) {
                warn!("Evicted tracker {}", name);
            }
        }
    }

    fn require(&self, state: SessionState, action: &'static str) -> Result<(), SessionError> {
        if self.state == state {
            Ok(())
        } else {
            Err(SessionError::NotAllowed {
                action,
                state: self.state,
            })
        }
    }

    fn forbid(&self, state: SessionState, action: &'static str) -> Result<(), SessionError> {
        if self.state == state {
            Err(SessionError::NotAllowed { action, state })
        } else {
            Ok(())
        }
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            info!("Session {} -> {}", self.state, next);
            self.state = next;
        }
    }
}

impl<P> Drop for SessionController<P> {
    fn drop(&mut self) {
        self.bus.unsubscribe(EventName::NewFrame);
        self.bus.unsubscribe(EventName::StopTracking);
        self.bus.unsubscribe(EventName::ErrorTracking);
    }
}
