//! In-process event bus
//!
//! Every event name has at most one subscriber: each event models the one
//! component that consumes it, not a broadcast. `publish` runs the handler
//! synchronously on the caller's thread, so handlers must return quickly and
//! hand long work to their own threads. Publishing an event nobody listens to
//! is a no-op reported as [`Delivery::NoSubscriber`].

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{debug, trace};

use crate::capture::Frame;
use crate::error::BusError;
use crate::tracking::Color;

/// Names of every event that crosses the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    InitVideo,
    NewFrame,
    SetFps,
    SetInitFps,
    ConnectedNewTracker,
    RemoveTracker,
    ChangedDrawMode,
    UpdateTrackerFps,
    UpdateRealFps,
    StopTracking,
    ErrorTracking,
    ChangedAddressServer,
}

impl EventName {
    pub fn as_str(self) -> &'static str {
        match self {
            EventName::InitVideo => "init-video",
            EventName::NewFrame => "new-frame",
            EventName::SetFps => "set-fps",
            EventName::SetInitFps => "set-init-fps",
            EventName::ConnectedNewTracker => "connected-new-tracker",
            EventName::RemoveTracker => "remove-tracker",
            EventName::ChangedDrawMode => "changed-draw-mode",
            EventName::UpdateTrackerFps => "update-tracker-fps",
            EventName::UpdateRealFps => "update-real-fps",
            EventName::StopTracking => "stop-tracking",
            EventName::ErrorTracking => "error-tracking",
            EventName::ChangedAddressServer => "changed-address-server",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event payloads
#[derive(Debug, Clone)]
pub enum Event {
    InitVideo { path: PathBuf },
    NewFrame { frame: Frame, index: u64 },
    SetFps { fps: f64 },
    SetInitFps { fps: f64 },
    ConnectedNewTracker {
        name: String,
        color: Color,
        address: String,
    },
    RemoveTracker { name: String },
    ChangedDrawMode { name: String, draw: bool },
    UpdateTrackerFps { name: String, fps: f64 },
    UpdateRealFps { fps: f64 },
    StopTracking,
    ErrorTracking { name: String },
    ChangedAddressServer { address: String },
}

impl Event {
    pub fn name(&self) -> EventName {
        match self {
            Event::InitVideo { .. } => EventName::InitVideo,
            Event::NewFrame { .. } => EventName::NewFrame,
            Event::SetFps { .. } => EventName::SetFps,
            Event::SetInitFps { .. } => EventName::SetInitFps,
            Event::ConnectedNewTracker { .. } => EventName::ConnectedNewTracker,
            Event::RemoveTracker { .. } => EventName::RemoveTracker,
            Event::ChangedDrawMode { .. } => EventName::ChangedDrawMode,
            Event::UpdateTrackerFps { .. } => EventName::UpdateTrackerFps,
            Event::UpdateRealFps { .. } => EventName::UpdateRealFps,
            Event::StopTracking => EventName::StopTracking,
            Event::ErrorTracking { .. } => EventName::ErrorTracking,
            Event::ChangedAddressServer { .. } => EventName::ChangedAddressServer,
        }
    }
}

/// Outcome of [`EventBus::publish`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The subscriber ran to completion
    Delivered,
    /// Nobody listens to this event
    NoSubscriber,
    /// The bus was closed
    Closed,
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Name-keyed dispatch table, one handler per event
pub struct EventBus {
    // Read-mostly: written while components are wired, read on every publish
    handlers: ArcSwap<HashMap<EventName, Handler>>,
    closed: AtomicBool,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: ArcSwap::from_pointee(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Register the canonical consumer of `name`
    pub fn subscribe<F>(&self, name: EventName, handler: F) -> Result<(), BusError>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        if self.is_closed() {
            return Err(BusError::Closed);
        }

        let handler: Handler = Arc::new(handler);
        let mut duplicate = false;
        self.handlers.rcu(|current| {
            let mut next = HashMap::clone(current);
            duplicate = next.contains_key(&name);
            if !duplicate {
                next.insert(name, handler.clone());
            }
            next
        });

        if duplicate {
            return Err(BusError::DuplicateSubscription(name));
        }
        debug!("Subscribed to {}", name);
        Ok(())
    }

    /// Drop the subscriber of `name`, returning whether there was one
    pub fn unsubscribe(&self, name: EventName) -> bool {
        let mut removed = false;
        self.handlers.rcu(|current| {
            let mut next = HashMap::clone(current);
            removed = next.remove(&name).is_some();
            next
        });
        removed
    }

    pub fn has_subscriber(&self, name: EventName) -> bool {
        self.handlers.load().contains_key(&name)
    }

    /// Run the subscriber of `event` on the calling thread
    pub fn publish(&self, event: Event) -> Delivery {
        if self.is_closed() {
            return Delivery::Closed;
        }

        let name = event.name();
        // Clone the handler out so it may publish other events itself
        let handler = self.handlers.load().get(&name).cloned();
        match handler {
            Some(handler) => {
                trace!("Emit event {}", name);
                handler(&event);
                Delivery::Delivered
            }
            None => {
                trace!("Event {} has no subscriber", name);
                Delivery::NoSubscriber
            }
        }
    }

    /// Drop every subscriber and refuse further traffic
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.handlers.store(Arc::new(HashMap::new()));
            debug!("Event bus closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
