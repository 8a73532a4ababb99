//! Artemis: compare visual trackers live on a video

use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use artemis::capture::{FrameSource, SyntheticOpener, VideoOpener};
use artemis::display::LogPresenter;
use artemis::{
    Command, Config, Event, EventBus, SessionController, SourceConfig, TrackerBroker,
};
use color_eyre::Result;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("artemis=debug")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Artemis Launching...");

    // Load configuration
    let config = Config::load()?;
    artemis::CONFIG.store(Arc::new(config.clone()));

    // Sockets and dispatch tasks; the session itself runs on this thread
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("artemis-net")
        .build()?;

    let bus = EventBus::new();
    let broker = TrackerBroker::new(
        bus.clone(),
        config.tracking.clone(),
        runtime.handle().clone(),
    )?;
    runtime.block_on(broker.listen(&config.tracking.listen_address))?;

    let source = FrameSource::new(bus.clone(), opener(&config.source), &config.source)?;
    let presenter = LogPresenter::new(&bus, config.display.clone())?;
    let mut controller = SessionController::new(
        bus.clone(),
        source.clone(),
        broker.clone(),
        presenter,
        runtime.handle().clone(),
        &config,
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    runtime.spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Cannot listen for Ctrl-C: {}", e);
                return;
            }
            info!("Interrupted");
            shutdown.store(true, Ordering::Release);
        }
    });

    match &config.source.path {
        Some(path) => {
            bus.publish(Event::InitVideo { path: path.clone() });
        }
        None if config.source.synthetic_frames > 0 => {
            bus.publish(Event::InitVideo {
                path: "synthetic".into(),
            });
        }
        None => info!("No video configured, waiting for one"),
    }

    let commands = operator_commands()?;
    controller.run(&shutdown, &commands)?;

    drop(controller);
    source.shutdown();
    runtime.block_on(broker.shutdown());
    bus.close();

    info!("Artemis shutting down");
    Ok(())
}

/// Read operator commands from stdin, one per line
fn operator_commands() -> Result<flume::Receiver<Command>> {
    let (tx, rx) = flume::unbounded();
    thread::Builder::new()
        .name("artemis-stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Cannot read commands: {}", e);
                        return;
                    }
                };
                match line.parse::<Command>() {
                    Ok(command) => {
                        if tx.send(command).is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("{}", e),
                }
            }
            debug!("Command input closed");
        })?;
    info!("Commands: <enter>/p play-pause, r restart, +/- step, roi X Y W H, view, stop, resume, q quit");
    Ok(rx)
}

fn synthetic(source: &SourceConfig) -> SyntheticOpener {
    SyntheticOpener::new(source.synthetic_frames, source.synthetic_fps, 640, 480)
}

#[cfg(feature = "gstreamer-pipeline")]
fn opener(source: &SourceConfig) -> Box<dyn VideoOpener> {
    if source.synthetic_frames > 0 {
        Box::new(synthetic(source))
    } else {
        Box::new(artemis::capture::GstOpener)
    }
}

#[cfg(not(feature = "gstreamer-pipeline"))]
fn opener(source: &SourceConfig) -> Box<dyn VideoOpener> {
    if source.synthetic_frames == 0 {
        warn!("Built without GStreamer: only the synthetic clip can be played");
    }
    Box::new(synthetic(source))
}
