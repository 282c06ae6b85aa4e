//! Framebridge demo: test-pattern producer -> frame bridge -> clocked consumer

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tokio::sync::oneshot;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use framebridge::capture::{FrameFormat, TestPatternSource};
use framebridge::display::{FrameSink, LogSink};
use framebridge::pipeline::ExecutionContext;
use framebridge::{MediaSession, SampleResponse};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    info!("Framebridge launching...");

    // Load configuration
    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = framebridge::load_config(path.as_deref())?;
    framebridge::CONFIG.store(Arc::new(config.clone()));
    info!("Configuration: {:?}", config);

    // The presentation surface lives on its own thread
    let presenter = ExecutionContext::spawn("presenter")?;
    let sink = Arc::new(Mutex::new(LogSink::new()));
    let (ready_tx, ready_rx) = oneshot::channel::<FrameFormat>();

    let mut source = TestPatternSource::new(config.source.clone());
    let setup_sink = sink.clone();
    let session = Arc::new(MediaSession::open(
        &mut source,
        &config.bridge,
        presenter.handle(),
        move |format| {
            let configured = setup_sink
                .lock()
                .map_err(|_| eyre!("Sink lock poisoned"))
                .and_then(|mut sink| sink.configure(format));
            match configured {
                Ok(()) => {
                    let _ = ready_tx.send(format);
                }
                Err(e) => error!("Surface setup failed: {}", e),
            }
        },
    )?);

    source.start()?;

    // Spawn consumer task pulling on its own clock
    let consumer = tokio::spawn(consume(
        session.clone(),
        sink.clone(),
        config.consumer.fps,
        ready_rx,
    ));

    let mut poll = interval(Duration::from_millis(50));
    let mut ticks = 0u64;
    let interrupted = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break true;
            }
            _ = poll.tick() => {
                if !source.is_running() {
                    break false;
                }
                ticks += 1;
                if ticks % 20 == 0 {
                    let stats = session.stats();
                    info!(
                        delivered = stats.delivered,
                        served = stats.served,
                        evicted = stats.evicted,
                        queued = session.bridge().len(),
                        "Bridge stats"
                    );
                }
            }
        }
    };

    source.stop();

    // Let the consumer pick up whatever is still queued
    if !interrupted {
        while !session.bridge().is_empty() && !consumer.is_finished() {
            poll.tick().await;
        }
    }

    let released = session.close();
    match consumer.await? {
        Ok(misses) => info!("Consumer finished, {} empty requests", misses),
        Err(e) => error!("Consumer failed: {}", e),
    }
    presenter.shutdown();

    let stats = session.stats();
    let sink = sink.lock().map_err(|_| eyre!("Sink lock poisoned"))?;
    info!(
        capacity = session.bridge().capacity(),
        policy = ?session.bridge().policy(),
        delivered = stats.delivered,
        served = stats.served,
        evicted = stats.evicted,
        rejected = stats.rejected,
        released,
        presented = sink.presented(),
        bytes = sink.bytes(),
        "Framebridge shutting down"
    );
    Ok(())
}

/// Rendering clock: waits for surface setup, then pulls one sample per tick.
async fn consume(
    session: Arc<MediaSession>,
    sink: Arc<Mutex<LogSink>>,
    fps: u32,
    ready: oneshot::Receiver<FrameFormat>,
) -> Result<u64> {
    let Ok(format) = ready.await else {
        warn!("Session ended before the first frame");
        return Ok(0);
    };
    info!(
        "Consumer starting at {} fps for {}x{}",
        fps, format.width, format.height
    );

    let mut clock = interval(Duration::from_secs_f64(1.0 / f64::from(fps.max(1))));
    clock.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut misses = 0u64;

    loop {
        clock.tick().await;
        if session.is_closed() {
            break;
        }

        match session.request_sample() {
            SampleResponse::Ready(frame) => {
                let mut sink = sink.lock().map_err(|_| eyre!("Sink lock poisoned"))?;
                if !sink.is_configured() {
                    return Err(eyre!("Frame {} pulled before surface setup", frame.sequence()));
                }
                sink.present(&frame)?;
            }
            SampleResponse::NotReady => misses += 1,
        }
    }

    Ok(misses)
}

fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("framebridge=debug"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_timer(fmt::time::uptime()));

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}
