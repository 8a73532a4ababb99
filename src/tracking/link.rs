//! One connected tracker worker

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crossbeam::atomic::AtomicCell;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument, warn};

use crate::bus::{Event, EventBus};
use crate::capture::{BoundingBox, Frame};
use crate::error::{LinkError, ProtocolError, TransportError};
use crate::tracking::cache::ResultCache;
use crate::tracking::wire::{self, Message, MAX_CONTROL_MESSAGE_SIZE};
use crate::tracking::{Color, TrackerIdentity};
use crate::TrackingConfig;

/// Byte stream a tracker is reachable over
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// Deadlines applied to every exchange with a worker
#[derive(Debug, Clone, Copy)]
pub struct LinkTimeouts {
    pub handshake: Duration,
    pub reply: Duration,
    pub init_ack: Duration,
}

impl From<&TrackingConfig> for LinkTimeouts {
    fn from(config: &TrackingConfig) -> Self {
        Self {
            handshake: Duration::from_millis(config.handshake_timeout_ms),
            reply: Duration::from_millis(config.reply_timeout_ms),
            init_ack: Duration::from_millis(config.init_ack_timeout_ms),
        }
    }
}

/// Protocol state of one worker connection.
///
/// All exchanges hold the stream lock for the whole round trip, so a link is
/// never sent a frame while it is still working on the previous one.
pub struct TrackerLink {
    identity: TrackerIdentity,
    stream: tokio::sync::Mutex<Option<Box<dyn Transport>>>,
    results: Mutex<ResultCache>,
    draw: AtomicBool,
    fps: AtomicCell<f64>,
    failed: AtomicBool,
    bus: Arc<EventBus>,
    timeouts: LinkTimeouts,
}

impl TrackerLink {
    /// Read the worker's identity record. The link is usable only once this
    /// succeeds.
    #[instrument(skip(io, bus, timeouts))]
    pub async fn handshake<T>(
        mut io: T,
        address: String,
        bus: Arc<EventBus>,
        timeouts: LinkTimeouts,
        result_window: usize,
    ) -> Result<Self, LinkError>
    where
        T: Transport + 'static,
    {
        let msg = within(
            timeouts.handshake,
            wire::read_message(&mut io, MAX_CONTROL_MESSAGE_SIZE),
        )
        .await?;

        let hello = match msg {
            Message::Hello(hello) => hello,
            other => {
                return Err(ProtocolError::Unexpected {
                    expected: "hello",
                    found: other.kind_name(),
                }
                .into())
            }
        };

        debug!("Handshake complete: {} ({})", hello.name, address);

        Ok(Self {
            identity: TrackerIdentity {
                name: hello.name.trim().to_string(),
                color: hello.color,
                address,
            },
            stream: tokio::sync::Mutex::new(Some(Box::new(io))),
            results: Mutex::new(ResultCache::new(result_window)),
            draw: AtomicBool::new(true),
            fps: AtomicCell::new(0.0),
            failed: AtomicBool::new(false),
            bus,
            timeouts,
        })
    }

    pub fn identity(&self) -> &TrackerIdentity {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn color(&self) -> Color {
        self.identity.color
    }

    pub fn address(&self) -> &str {
        &self.identity.address
    }

    pub fn draw(&self) -> bool {
        self.draw.load(Ordering::Relaxed)
    }

    pub fn set_draw(&self, draw: bool) {
        self.draw.store(draw, Ordering::Relaxed);
    }

    /// Last FPS the worker reported
    pub fn fps(&self) -> f64 {
        self.fps.load()
    }

    /// Whether an exchange with this worker has failed; failed links wait
    /// for eviction and refuse further traffic
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Cached box for `index`
    pub fn result(&self, index: u64) -> Option<BoundingBox> {
        self.cache().get(index)
    }

    /// Whether the worker answered for `index`, with or without a box
    pub fn has_result(&self, index: u64) -> bool {
        self.cache().contains(index)
    }

    pub fn cached_results(&self) -> usize {
        self.cache().len()
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, ResultCache> {
        self.results.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send `frame` and wait for the worker's box
    #[instrument(skip(self, frame), fields(tracker = %self.identity.name, nf = frame.index()))]
    pub async fn dispatch_track(&self, frame: &Frame) -> Result<Option<BoundingBox>, LinkError> {
        let started = Instant::now();
        let reply = match self.track_round_trip(frame).await {
            Ok(reply) => reply,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };

        self.cache().insert(frame.index(), reply.bbox);
        self.fps.store(reply.fps);

        metrics::gauge!("artemis.tracker.fps", "tracker" => self.identity.name.clone())
            .set(reply.fps);
        debug!(
            "Reply in {:?}: {:?} @ {:.1} fps",
            started.elapsed(),
            reply.bbox,
            reply.fps
        );

        self.bus.publish(Event::UpdateTrackerFps {
            name: self.identity.name.clone(),
            fps: reply.fps,
        });

        Ok(reply.bbox)
    }

    async fn track_round_trip(&self, frame: &Frame) -> Result<wire::TrackReply, LinkError> {
        let mut guard = self.stream.lock().await;
        let io = self.usable(&mut guard)?;

        within(self.timeouts.reply, async {
            wire::write_message(io, &Message::Track(frame.clone())).await?;
            match wire::read_message(io, MAX_CONTROL_MESSAGE_SIZE).await? {
                Message::Reply(reply) => Ok(reply),
                other => Err(ProtocolError::Unexpected {
                    expected: "reply",
                    found: other.kind_name(),
                }
                .into()),
            }
        })
        .await
    }

    /// Seed the worker's tracker with `frame` and the operator's box. Each
    /// half is acknowledged before the next is sent.
    #[instrument(skip(self, frame), fields(tracker = %self.identity.name, nf = frame.index()))]
    pub async fn dispatch_init(&self, frame: &Frame, ground_truth: BoundingBox) -> Result<(), LinkError> {
        let result = self.init_exchange(frame, ground_truth).await;
        if let Err(e) = &result {
            self.fail(e);
        }
        result
    }

    async fn init_exchange(&self, frame: &Frame, ground_truth: BoundingBox) -> Result<(), LinkError> {
        let mut guard = self.stream.lock().await;
        let io = self.usable(&mut guard)?;
        let limit = self.timeouts.init_ack;

        within(limit, async {
            wire::write_message(io, &Message::InitFrame(frame.clone())).await?;
            expect_ack(wire::read_message(io, MAX_CONTROL_MESSAGE_SIZE).await?)
        })
        .await?;

        within(limit, async {
            wire::write_message(io, &Message::InitBox(ground_truth)).await?;
            expect_ack(wire::read_message(io, MAX_CONTROL_MESSAGE_SIZE).await?)
        })
        .await?;

        // Results from an earlier session describe a different target
        self.cache().clear();
        Ok(())
    }

    /// Wait for any in-flight exchange, then tell the worker to stop
    #[instrument(skip(self), fields(tracker = %self.identity.name))]
    pub async fn stop_tracking(&self) -> Result<(), LinkError> {
        let mut guard = self.stream.lock().await;
        let io = self.usable(&mut guard)?;

        let result = within(self.timeouts.reply, wire::write_message(io, &Message::Stop)).await;
        drop(guard);

        if let Err(e) = &result {
            self.fail(e);
        }
        result
    }

    /// Close the transport. Safe to call more than once.
    pub async fn close(&self) {
        let stream = self.stream.lock().await.take();
        if let Some(mut io) = stream {
            if let Err(e) = io.shutdown().await {
                debug!("Shutdown of {} failed: {}", self.identity.name, e);
            }
            debug!("Closed link to {} ({})", self.identity.name, self.identity.address);
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.stream.lock().await.is_none()
    }

    fn usable<'a>(
        &self,
        guard: &'a mut Option<Box<dyn Transport>>,
    ) -> Result<&'a mut Box<dyn Transport>, LinkError> {
        if self.is_failed() {
            return Err(TransportError::Closed.into());
        }
        guard.as_mut().ok_or_else(|| TransportError::Closed.into())
    }

    /// Mark the link broken and ask for its eviction. The link never removes
    /// itself from the registry.
    pub(crate) fn fail(&self, err: &LinkError) {
        if self.failed.swap(true, Ordering::SeqCst) {
            return;
        }

        warn!(
            "Tracker {} ({}) failed: {}",
            self.identity.name, self.identity.address, err
        );
        metrics::counter!("artemis.dispatch.failures").increment(1);

        self.bus.publish(Event::ErrorTracking {
            name: self.identity.name.clone(),
        });
    }
}

fn expect_ack(msg: Message) -> Result<(), LinkError> {
    match msg {
        Message::Ack => Ok(()),
        other => Err(ProtocolError::Unexpected {
            expected: "ack",
            found: other.kind_name(),
        }
        .into()),
    }
}

/// Run `fut` under `limit`, reporting expiry as a transport failure
async fn within<F, T>(limit: Duration, fut: F) -> Result<T, LinkError>
where
    F: Future<Output = Result<T, LinkError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::TimedOut(limit).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventName;
    use crate::capture::{FrameMetadata, PixelFormat};
    use crate::tracking::wire::{Hello, TrackReply, MAX_FRAME_MESSAGE_SIZE};
    use bytes::Bytes;
    use tokio::io::DuplexStream;

    fn timeouts() -> LinkTimeouts {
        LinkTimeouts {
            handshake: Duration::from_millis(500),
            reply: Duration::from_millis(500),
            init_ack: Duration::from_millis(500),
        }
    }

    fn frame(index: u64) -> Frame {
        Frame::new(
            Bytes::from(vec![0u8; 4 * 4 * 3]),
            FrameMetadata {
                index,
                width: 4,
                height: 4,
                stride: 12,
                format: PixelFormat::Rgb24,
            },
        )
    }

    async fn connected(bus: Arc<EventBus>) -> (TrackerLink, DuplexStream) {
        let (broker_side, mut worker_side) = tokio::io::duplex(1 << 16);
        wire::write_message(
            &mut worker_side,
            &Message::Hello(Hello {
                name: "kcf".into(),
                color: Color::new(1.0, 0.0, 0.0),
            }),
        )
        .await
        .unwrap();

        let link = TrackerLink::handshake(broker_side, "local".into(), bus, timeouts(), 100)
            .await
            .unwrap();
        (link, worker_side)
    }

    #[tokio::test]
    async fn handshake_reads_identity() {
        let (link, _worker) = connected(EventBus::new()).await;
        assert_eq!(link.name(), "kcf");
        assert_eq!(link.color(), Color::new(1.0, 0.0, 0.0));
        assert_eq!(link.address(), "local");
        assert!(link.draw());
    }

    #[tokio::test]
    async fn handshake_rejects_other_messages() {
        let (broker_side, mut worker_side) = tokio::io::duplex(1024);
        wire::write_message(&mut worker_side, &Message::Ack).await.unwrap();

        let err = TrackerLink::handshake(broker_side, "local".into(), EventBus::new(), timeouts(), 10)
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            LinkError::Protocol(ProtocolError::Unexpected { expected: "hello", .. })
        ));
    }

    #[tokio::test]
    async fn handshake_times_out() {
        let (broker_side, _worker_side) = tokio::io::duplex(1024);
        let err = TrackerLink::handshake(broker_side, "local".into(), EventBus::new(), timeouts(), 10)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LinkError::Transport(TransportError::TimedOut(_))));
    }

    #[tokio::test]
    async fn track_stores_reply_under_dispatched_index() {
        let bus = EventBus::new();
        let fps_updates = Arc::new(Mutex::new(Vec::new()));
        let sink = fps_updates.clone();
        bus.subscribe(EventName::UpdateTrackerFps, move |event| {
            if let Event::UpdateTrackerFps { name, fps } = event {
                sink.lock().unwrap().push((name.clone(), *fps));
            }
        })
        .unwrap();

        let (link, mut worker) = connected(bus).await;
        let responder = tokio::spawn(async move {
            match wire::read_message(&mut worker, MAX_FRAME_MESSAGE_SIZE).await.unwrap() {
                Message::Track(f) => assert_eq!(f.index(), 9),
                other => panic!("unexpected {:?}", other),
            }
            wire::write_message(
                &mut worker,
                &Message::Reply(TrackReply {
                    bbox: Some(BoundingBox::new(1.0, 1.0, 2.0, 2.0)),
                    fps: 30.0,
                }),
            )
            .await
            .unwrap();
            worker
        });

        let bbox = link.dispatch_track(&frame(9)).await.unwrap();
        let _worker = responder.await.unwrap();

        assert_eq!(bbox, Some(BoundingBox::new(1.0, 1.0, 2.0, 2.0)));
        assert_eq!(link.result(9), bbox);
        assert!(!link.has_result(8));
        assert_eq!(link.fps(), 30.0);
        assert_eq!(*fps_updates.lock().unwrap(), vec![("kcf".to_string(), 30.0)]);
    }

    #[tokio::test]
    async fn silent_worker_times_out_and_reports_error() {
        let bus = EventBus::new();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        bus.subscribe(EventName::ErrorTracking, move |event| {
            if let Event::ErrorTracking { name } = event {
                sink.lock().unwrap().push(name.clone());
            }
        })
        .unwrap();

        let (link, _worker) = connected(bus).await;
        let err = link.dispatch_track(&frame(0)).await.unwrap_err();

        assert!(matches!(err, LinkError::Transport(TransportError::TimedOut(_))));
        assert!(link.is_failed());
        assert!(!link.has_result(0));
        assert_eq!(*errors.lock().unwrap(), vec!["kcf".to_string()]);

        // Failed links refuse further traffic without reporting twice
        let again = link.dispatch_track(&frame(1)).await.unwrap_err();
        assert!(matches!(again, LinkError::Transport(TransportError::Closed)));
        assert_eq!(errors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn init_waits_for_both_acks() {
        let (link, mut worker) = connected(EventBus::new()).await;
        let responder = tokio::spawn(async move {
            let first = wire::read_message(&mut worker, MAX_FRAME_MESSAGE_SIZE).await.unwrap();
            assert!(matches!(first, Message::InitFrame(f) if f.index() == 5));
            wire::write_message(&mut worker, &Message::Ack).await.unwrap();

            let second = wire::read_message(&mut worker, MAX_FRAME_MESSAGE_SIZE).await.unwrap();
            assert!(matches!(second, Message::InitBox(b) if b == BoundingBox::new(3.0, 4.0, 5.0, 6.0)));
            wire::write_message(&mut worker, &Message::Ack).await.unwrap();
            worker
        });

        link.dispatch_init(&frame(5), BoundingBox::new(3.0, 4.0, 5.0, 6.0))
            .await
            .unwrap();
        let _worker = responder.await.unwrap();
        assert!(!link.is_failed());
    }

    #[tokio::test]
    async fn stop_sends_sentinel_and_close_is_idempotent() {
        let (link, mut worker) = connected(EventBus::new()).await;

        link.stop_tracking().await.unwrap();
        let msg = wire::read_message(&mut worker, MAX_FRAME_MESSAGE_SIZE).await.unwrap();
        assert!(matches!(msg, Message::Stop));

        link.close().await;
        link.close().await;
        assert!(link.is_closed().await);
        assert!(matches!(
            link.stop_tracking().await,
            Err(LinkError::Transport(TransportError::Closed))
        ));
    }
}
