//! Tracker broker: accepts worker connections, fans frames out to every live
//! link and joins the replies before returning.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::bus::{Event, EventBus, EventName};
use crate::capture::{BoundingBox, Frame};
use crate::error::{BrokerError, LinkError, TransportError};
use crate::tracking::link::{LinkTimeouts, TrackerLink};
use crate::tracking::TrackResult;
use crate::TrackingConfig;

/// Outcome of one fan-out round
#[derive(Debug, Default, Clone)]
pub struct DispatchReport {
    pub index: u64,
    /// Links that answered
    pub succeeded: Vec<String>,
    /// Links that failed this round or were already waiting for eviction
    pub failed: Vec<String>,
    pub elapsed: Duration,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

struct Listener {
    address: SocketAddr,
    task: JoinHandle<()>,
}

/// Owner of every tracker link
pub struct TrackerBroker {
    bus: Arc<EventBus>,
    config: TrackingConfig,
    timeouts: LinkTimeouts,
    /// Connection-ordered links; every dispatch works on one snapshot
    registry: ArcSwap<Vec<Arc<TrackerLink>>>,
    /// Bounds how many round trips run at once
    permits: Arc<Semaphore>,
    /// One dispatch round at a time across the whole registry
    flight: tokio::sync::Mutex<()>,
    listener: Mutex<Option<Listener>>,
    runtime: Handle,
}

impl TrackerBroker {
    /// Create the broker and subscribe it to `changed-draw-mode` and
    /// `changed-address-server`
    pub fn new(
        bus: Arc<EventBus>,
        config: TrackingConfig,
        runtime: Handle,
    ) -> Result<Arc<Self>, BrokerError> {
        let broker = Arc::new(Self {
            timeouts: LinkTimeouts::from(&config),
            permits: Arc::new(Semaphore::new(config.max_parallel_dispatch.max(1))),
            registry: ArcSwap::from_pointee(Vec::new()),
            flight: tokio::sync::Mutex::new(()),
            listener: Mutex::new(None),
            bus: bus.clone(),
            config,
            runtime,
        });

        let weak = Arc::downgrade(&broker);
        bus.subscribe(EventName::ChangedDrawMode, move |event| {
            if let (Some(broker), Event::ChangedDrawMode { name, draw }) = (weak.upgrade(), event) {
                broker.set_draw_mode(name, *draw);
            }
        })?;

        let weak = Arc::downgrade(&broker);
        bus.subscribe(EventName::ChangedAddressServer, move |event| {
            if let (Some(broker), Event::ChangedAddressServer { address }) = (weak.upgrade(), event)
            {
                let address = address.clone();
                let runtime = broker.runtime.clone();
                runtime.spawn(async move {
                    if let Err(e) = broker.listen(&address).await {
                        error!("Failed to move tracker server: {}", e);
                    }
                });
            }
        })?;

        Ok(broker)
    }

    /// Bind `address` and accept trackers on it. A previous listener is
    /// stopped; links it accepted stay connected.
    pub async fn listen(self: &Arc<Self>, address: &str) -> Result<SocketAddr, BrokerError> {
        let bind_error = |source| BrokerError::Bind {
            address: address.to_string(),
            source,
        };
        let listener = TcpListener::bind(address).await.map_err(bind_error)?;
        let local = listener.local_addr().map_err(bind_error)?;

        let task = self.runtime.spawn(accept_loop(Arc::downgrade(self), listener));
        let previous = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Listener {
                address: local,
                task,
            });

        if let Some(previous) = previous {
            previous.task.abort();
            info!("Stopped listening on {}", previous.address);
        }

        info!("Server listening on {}", local);
        Ok(local)
    }

    /// Address the accept loop is bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|l| l.address)
    }

    async fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay on {} failed: {}", peer, e);
        }

        if self.len() >= self.config.max_trackers {
            warn!(
                "Refusing tracker at {}: {} trackers already connected",
                peer, self.config.max_trackers
            );
            return;
        }

        let link = match TrackerLink::handshake(
            stream,
            peer.to_string(),
            self.bus.clone(),
            self.timeouts,
            self.config.result_window,
        )
        .await
        {
            Ok(link) => Arc::new(link),
            Err(e) => {
                warn!("Handshake with {} failed: {}", peer, e);
                return;
            }
        };

        let max = self.config.max_trackers;
        let mut refusal = None;
        self.registry.rcu(|current| {
            refusal = if current.iter().any(|l| l.name() == link.name()) {
                Some("name already in use")
            } else if current.len() >= max {
                Some("tracker limit reached")
            } else {
                None
            };

            if refusal.is_some() {
                Arc::clone(current)
            } else {
                let mut next = Vec::clone(current);
                next.push(link.clone());
                Arc::new(next)
            }
        });

        if let Some(reason) = refusal {
            warn!("Refusing tracker {} at {}: {}", link.name(), peer, reason);
            link.close().await;
            return;
        }

        info!("Connection established with {} ({})", peer, link.name());
        metrics::gauge!("artemis.trackers.connected").set(self.len() as f64);

        let identity = link.identity();
        self.bus.publish(Event::ConnectedNewTracker {
            name: identity.name.clone(),
            color: identity.color,
            address: identity.address.clone(),
        });
    }

    /// Track `frame` on every live link concurrently and wait for all of them.
    ///
    /// Calls are serialized: a second call waits until the first returns.
    #[instrument(skip(self, frame), fields(nf = frame.index()))]
    pub async fn dispatch_frame(&self, frame: &Frame) -> DispatchReport {
        let _flight = self.flight.lock().await;
        let started = Instant::now();

        let report = self
            .fan_out(frame.index(), |link| {
                let frame = frame.clone();
                async move { link.dispatch_track(&frame).await.map(|_| ()) }
            })
            .await;

        let elapsed = started.elapsed();
        metrics::histogram!("artemis.dispatch.duration_ms").record(elapsed.as_secs_f64() * 1000.0);
        debug!(
            "Dispatched frame {} to {} trackers in {:?} ({} failed)",
            frame.index(),
            report.succeeded.len() + report.failed.len(),
            elapsed,
            report.failed.len()
        );

        DispatchReport { elapsed, ..report }
    }

    /// Seed every live link with `frame` and the operator's box
    #[instrument(skip(self, frame), fields(nf = frame.index()))]
    pub async fn dispatch_init(&self, frame: &Frame, ground_truth: BoundingBox) -> DispatchReport {
        let _flight = self.flight.lock().await;
        let started = Instant::now();

        let report = self
            .fan_out(frame.index(), |link| {
                let frame = frame.clone();
                async move { link.dispatch_init(&frame, ground_truth).await }
            })
            .await;

        info!(
            "Initialized {} trackers on frame {} ({} failed)",
            report.succeeded.len(),
            frame.index(),
            report.failed.len()
        );

        DispatchReport {
            elapsed: started.elapsed(),
            ..report
        }
    }

    async fn fan_out<F, Fut>(&self, index: u64, exchange: F) -> DispatchReport
    where
        F: Fn(Arc<TrackerLink>) -> Fut,
        Fut: std::future::Future<Output = Result<(), LinkError>> + Send + 'static,
    {
        let links = self.registry.load_full();
        let mut report = DispatchReport {
            index,
            ..Default::default()
        };

        let mut tasks = Vec::with_capacity(links.len());
        for link in links.iter() {
            if link.is_failed() {
                report.failed.push(link.name().to_string());
                continue;
            }

            let permits = self.permits.clone();
            let round_trip = exchange(Arc::clone(link));
            let task = self.runtime.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                round_trip.await
            });
            tasks.push((Arc::clone(link), task));
        }

        // Join barrier: every link has answered or failed past this point
        for (link, task) in tasks {
            let name = link.name().to_string();
            match task.await {
                Ok(Ok(())) => report.succeeded.push(name),
                Ok(Err(_)) => report.failed.push(name),
                Err(e) => {
                    error!("Dispatch task for {} died: {}", name, e);
                    link.fail(&TransportError::Closed.into());
                    report.failed.push(name);
                }
            }
        }

        report
    }

    /// Boxes for frame `index` from every draw-enabled link
    pub fn collect_results(&self, index: u64) -> Vec<TrackResult> {
        self.registry
            .load()
            .iter()
            .filter(|link| link.draw())
            .map(|link| TrackResult {
                name: link.name().to_string(),
                bbox: link.result(index),
                color: link.color(),
            })
            .collect()
    }

    /// Show or hide one tracker in the aggregate
    pub fn set_draw_mode(&self, name: &str, draw: bool) -> bool {
        match self.link(name) {
            Some(link) => {
                link.set_draw(draw);
                debug!("Draw mode of {} set to {}", name, draw);
                true
            }
            None => {
                warn!("No tracker named {} to change draw mode", name);
                false
            }
        }
    }

    /// Evict and close the named link
    pub async fn remove_link(&self, name: &str) -> bool {
        self.remove_where(name, |_| true).await
    }

    /// Evict the named link only if it is marked failed. A healthy link that
    /// took over the name of a failed one stays registered.
    pub async fn evict_failed(&self, name: &str) -> bool {
        self.remove_where(name, TrackerLink::is_failed).await
    }

    async fn remove_where(&self, name: &str, doomed: impl Fn(&TrackerLink) -> bool) -> bool {
        let mut removed = None;
        self.registry.rcu(|current| {
            removed = current
                .iter()
                .find(|l| l.name() == name && doomed(l))
                .cloned();
            current
                .iter()
                .filter(|l| !(l.name() == name && doomed(l)))
                .cloned()
                .collect::<Vec<_>>()
        });

        let Some(link) = removed else {
            return false;
        };

        link.close().await;
        info!("Removed tracker {} ({})", name, link.address());
        metrics::gauge!("artemis.trackers.connected").set(self.len() as f64);

        self.bus.publish(Event::RemoveTracker {
            name: name.to_string(),
        });
        true
    }

    /// Send the stop sentinel to every link
    pub async fn stop_all(&self) {
        let _flight = self.flight.lock().await;
        let report = self
            .fan_out(0, |link| async move { link.stop_tracking().await })
            .await;
        info!(
            "Stopped tracking on {} trackers ({} failed)",
            report.succeeded.len(),
            report.failed.len()
        );
    }

    /// Close every link and the listener
    pub async fn shutdown(&self) {
        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.task.abort();
        }

        let links = self.registry.swap(Arc::new(Vec::new()));
        for link in links.iter() {
            link.close().await;
        }
        metrics::gauge!("artemis.trackers.connected").set(0.0);
        info!("Tracker broker shut down ({} links closed)", links.len());
    }

    pub fn link(&self, name: &str) -> Option<Arc<TrackerLink>> {
        self.registry.load().iter().find(|l| l.name() == name).cloned()
    }

    /// Names of every registered link in connection order
    pub fn names(&self) -> Vec<String> {
        self.registry
            .load()
            .iter()
            .map(|l| l.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.registry.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.load().is_empty()
    }
}

impl Drop for TrackerBroker {
    fn drop(&mut self) {
        if let Some(listener) = self
            .listener
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.task.abort();
        }
    }
}

async fn accept_loop(broker: Weak<TrackerBroker>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let Some(broker) = broker.upgrade() else {
                    break;
                };
                debug!("Accepted connection from {}", peer);
                // Handshakes run apart so one slow worker does not hold up accepts
                tokio::spawn(async move { broker.admit(stream, peer).await });
            }
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameMetadata, PixelFormat};
    use crate::tracking::wire::TrackReply;
    use crate::tracking::{Color, WorkerConnection, WorkerRequest};
    use bytes::Bytes;

    fn config() -> TrackingConfig {
        TrackingConfig {
            listen_address: "127.0.0.1:0".into(),
            handshake_timeout_ms: 1000,
            reply_timeout_ms: 500,
            init_ack_timeout_ms: 500,
            max_parallel_dispatch: 4,
            result_window: 1000,
            max_trackers: 3,
        }
    }

    fn frame(index: u64) -> Frame {
        Frame::new(
            Bytes::from(vec![1u8; 8 * 8 * 3]),
            FrameMetadata {
                index,
                width: 8,
                height: 8,
                stride: 24,
                format: PixelFormat::Rgb24,
            },
        )
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn broker() -> (Arc<EventBus>, Arc<TrackerBroker>, String) {
        let bus = EventBus::new();
        let broker = TrackerBroker::new(bus.clone(), config(), Handle::current()).unwrap();
        let address = broker.listen("127.0.0.1:0").await.unwrap().to_string();
        (bus, broker, address)
    }

    fn spawn_constant_worker(address: String, name: &'static str, bbox: BoundingBox) {
        tokio::spawn(async move {
            let worker = WorkerConnection::connect(&address, name, Color::new(0.0, 1.0, 0.0))
                .await
                .unwrap();
            let _ = worker
                .serve(move |_| TrackReply {
                    bbox: Some(bbox),
                    fps: 30.0,
                })
                .await;
        });
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn announces_and_collects_results() {
        let (bus, broker, address) = broker().await;
        let connected = Arc::new(Mutex::new(Vec::new()));
        let sink = connected.clone();
        bus.subscribe(EventName::ConnectedNewTracker, move |event| {
            if let Event::ConnectedNewTracker { name, color, .. } = event {
                sink.lock().unwrap().push((name.clone(), *color));
            }
        })
        .unwrap();

        spawn_constant_worker(address.clone(), "kcf", BoundingBox::new(1.0, 1.0, 2.0, 2.0));
        spawn_constant_worker(address, "mosse", BoundingBox::new(5.0, 5.0, 1.0, 1.0));
        wait_until(|| broker.len() == 2).await;

        let report = broker.dispatch_frame(&frame(0)).await;
        assert!(report.is_clean());
        assert_eq!(report.succeeded.len(), 2);

        let mut results = broker.collect_results(0);
        results.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].name, "kcf");
        assert_eq!(results[0].bbox, Some(BoundingBox::new(1.0, 1.0, 2.0, 2.0)));
        assert_eq!(results[1].bbox, Some(BoundingBox::new(5.0, 5.0, 1.0, 1.0)));

        // Nothing was dispatched for frame 1
        assert!(broker.collect_results(1).iter().all(|r| r.bbox.is_none()));
        assert_eq!(connected.lock().unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn draw_mode_event_hides_tracker() {
        let (bus, broker, address) = broker().await;
        spawn_constant_worker(address, "kcf", BoundingBox::new(1.0, 1.0, 2.0, 2.0));
        wait_until(|| broker.len() == 1).await;

        broker.dispatch_frame(&frame(0)).await;
        bus.publish(Event::ChangedDrawMode {
            name: "kcf".into(),
            draw: false,
        });

        assert!(broker.collect_results(0).is_empty());
        assert!(broker.link("kcf").unwrap().has_result(0));

        assert!(broker.set_draw_mode("kcf", true));
        assert_eq!(broker.collect_results(0).len(), 1);
        assert!(!broker.set_draw_mode("nobody", true));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failing_worker_is_reported_and_removable() {
        let (bus, broker, address) = broker().await;
        let errors = Arc::new(Mutex::new(Vec::new()));
        let removed = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        bus.subscribe(EventName::ErrorTracking, move |event| {
            if let Event::ErrorTracking { name } = event {
                sink.lock().unwrap().push(name.clone());
            }
        })
        .unwrap();
        let sink = removed.clone();
        bus.subscribe(EventName::RemoveTracker, move |event| {
            if let Event::RemoveTracker { name } = event {
                sink.lock().unwrap().push(name.clone());
            }
        })
        .unwrap();

        spawn_constant_worker(address.clone(), "kcf", BoundingBox::new(1.0, 1.0, 2.0, 2.0));
        // Hangs up on the first frame
        tokio::spawn(async move {
            let mut worker = WorkerConnection::connect(&address, "flaky", Color::new(1.0, 0.0, 0.0))
                .await
                .unwrap();
            let _ = worker.next_request().await;
        });
        wait_until(|| broker.len() == 2).await;

        let report = broker.dispatch_frame(&frame(0)).await;
        assert_eq!(report.succeeded, vec!["kcf".to_string()]);
        assert_eq!(report.failed, vec!["flaky".to_string()]);
        assert_eq!(*errors.lock().unwrap(), vec!["flaky".to_string()]);

        // Still registered until evicted; later rounds skip it
        let report = broker.dispatch_frame(&frame(1)).await;
        assert_eq!(report.failed, vec!["flaky".to_string()]);

        // Only a link marked failed goes this way
        assert!(!broker.evict_failed("kcf").await);
        assert!(broker.evict_failed("flaky").await);
        assert!(!broker.remove_link("flaky").await);
        assert_eq!(broker.names(), vec!["kcf".to_string()]);
        assert_eq!(*removed.lock().unwrap(), vec!["flaky".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn late_joiner_sits_out_the_round_in_flight() {
        let (_bus, broker, address) = broker().await;
        let (received_tx, received) = tokio::sync::oneshot::channel();
        let slow = address.clone();
        tokio::spawn(async move {
            let mut worker = WorkerConnection::connect(&slow, "a", Color::new(1.0, 0.0, 0.0))
                .await
                .unwrap();
            let mut received_tx = Some(received_tx);
            while let Ok(Some(request)) = worker.next_request().await {
                if let WorkerRequest::Track(_) = request {
                    if let Some(tx) = received_tx.take() {
                        let _ = tx.send(());
                    }
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    let bbox = Some(BoundingBox::new(2.0, 2.0, 1.0, 1.0));
                    if worker.reply(bbox, 3.0).await.is_err() {
                        break;
                    }
                }
            }
        });
        wait_until(|| broker.len() == 1).await;

        let round = tokio::spawn({
            let broker = broker.clone();
            async move { broker.dispatch_frame(&frame(7)).await }
        });
        received.await.unwrap();

        // "b" registers while "a" still holds the round
        spawn_constant_worker(address, "b", BoundingBox::new(0.0, 0.0, 1.0, 1.0));
        wait_until(|| broker.len() == 2).await;

        let report = round.await.unwrap();
        assert_eq!(report.succeeded, vec!["a".to_string()]);
        assert!(report.is_clean());
        assert!(broker.link("a").unwrap().has_result(7));
        assert!(!broker.link("b").unwrap().has_result(7));

        let results = broker.collect_results(7);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].bbox, Some(BoundingBox::new(2.0, 2.0, 1.0, 1.0)));
        assert_eq!(results[1].name, "b");
        assert_eq!(results[1].bbox, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn silent_worker_does_not_stall_forever() {
        let (_bus, broker, address) = broker().await;
        tokio::spawn(async move {
            let mut worker = WorkerConnection::connect(&address, "sleepy", Color::new(1.0, 0.0, 0.0))
                .await
                .unwrap();
            // Read requests but never answer
            while let Ok(Some(_)) = worker.next_request().await {}
        });
        wait_until(|| broker.len() == 1).await;

        let report = broker.dispatch_frame(&frame(0)).await;
        assert_eq!(report.failed, vec!["sleepy".to_string()]);
        assert!(report.elapsed < Duration::from_secs(2));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_names_and_limit_are_refused() {
        let (_bus, broker, address) = broker().await;
        for name in ["a", "b", "c"] {
            spawn_constant_worker(address.clone(), name, BoundingBox::new(0.0, 0.0, 1.0, 1.0));
        }
        wait_until(|| broker.len() == 3).await;

        spawn_constant_worker(address.clone(), "a", BoundingBox::new(0.0, 0.0, 1.0, 1.0));
        spawn_constant_worker(address, "d", BoundingBox::new(0.0, 0.0, 1.0, 1.0));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(broker.len(), 3);
        assert!(broker.link("d").is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn init_and_stop_reach_workers() {
        let (_bus, broker, address) = broker().await;
        let (tx, rx) = flume::unbounded();
        tokio::spawn(async move {
            let mut worker = WorkerConnection::connect(&address, "kcf", Color::new(1.0, 0.0, 0.0))
                .await
                .unwrap();
            while let Ok(Some(request)) = worker.next_request().await {
                let needs_ack = matches!(
                    request,
                    WorkerRequest::InitFrame(_) | WorkerRequest::InitBox(_)
                );
                let _ = tx.send(request);
                if needs_ack {
                    worker.ack().await.unwrap();
                }
            }
        });
        wait_until(|| broker.len() == 1).await;

        let report = broker
            .dispatch_init(&frame(4), BoundingBox::new(1.0, 2.0, 3.0, 4.0))
            .await;
        assert!(report.is_clean());
        broker.stop_all().await;

        let mut kinds = Vec::new();
        for _ in 0..3 {
            kinds.push(match rx.recv_async().await.unwrap() {
                WorkerRequest::InitFrame(f) => format!("frame {}", f.index()),
                WorkerRequest::InitBox(b) => format!("box {}", b.x),
                WorkerRequest::Stop => "stop".to_string(),
                WorkerRequest::Track(_) => "track".to_string(),
            });
        }
        assert_eq!(kinds, vec!["frame 4", "box 1", "stop"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn address_change_rebinds_listener() {
        let (bus, broker, first) = broker().await;

        bus.publish(Event::ChangedAddressServer {
            address: "127.0.0.1:0".into(),
        });
        wait_until(|| broker.local_addr().map(|a| a.to_string()) != Some(first.clone())).await;

        let second = broker.local_addr().unwrap().to_string();
        spawn_constant_worker(second, "kcf", BoundingBox::new(0.0, 0.0, 1.0, 1.0));
        wait_until(|| broker.len() == 1).await;

        broker.shutdown().await;
        assert!(broker.is_empty());
        assert!(broker.local_addr().is_none());
    }
}
