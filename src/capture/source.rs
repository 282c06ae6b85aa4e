//! Frame sources: callback registration plus a synthetic test-pattern producer

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat, Plane};
use crate::error::SourceError;
use crate::SourceConfig;

/// Invoked on the source's own thread for every produced frame
pub type FrameCallback = Arc<dyn Fn(Frame) + Send + Sync>;

/// Something that pushes frames at its own cadence
pub trait FrameSource: Send {
    /// Route every future frame to `callback`, replacing any earlier subscriber.
    fn subscribe(&mut self, callback: FrameCallback) -> Subscription;
}

struct Subscriber {
    id: u64,
    callback: FrameCallback,
}

/// Single-subscriber callback slot a source emits into.
///
/// Emitting is a wait-free load, so the producer thread never contends with
/// subscribe/cancel.
#[derive(Clone, Default)]
pub struct CallbackSlot {
    current: Arc<ArcSwapOption<Subscriber>>,
    next_id: Arc<AtomicU64>,
}

impl CallbackSlot {
    pub fn subscribe(&self, callback: FrameCallback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.current
            .store(Some(Arc::new(Subscriber { id, callback })));
        Subscription {
            slot: Some(Arc::downgrade(&self.current)),
            id,
        }
    }

    /// Hand `frame` to the subscriber. Returns false (and drops the frame) if
    /// nobody is subscribed.
    pub fn emit(&self, frame: Frame) -> bool {
        match self.current.load_full() {
            Some(subscriber) => {
                (subscriber.callback)(frame);
                true
            }
            None => false,
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.current.load().is_some()
    }
}

/// Handle to a callback registration; unsubscribes on cancel or drop.
pub struct Subscription {
    slot: Option<Weak<ArcSwapOption<Subscriber>>>,
    id: u64,
}

impl Subscription {
    pub fn cancel(mut self) {
        self.unsubscribe();
    }

    fn unsubscribe(&mut self) {
        let Some(slot) = self.slot.take().and_then(|weak| weak.upgrade()) else {
            return;
        };
        let id = self.id;
        // Only clear the slot if nobody replaced us in the meantime.
        slot.rcu(|current| match current {
            Some(subscriber) if subscriber.id == id => None,
            other => other.clone(),
        });
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Build a synthetic frame: a diagonal gradient shifted by `sequence`, with
/// one correctly sized plane per component of `format`.
pub fn pattern_frame(sequence: u64, width: u32, height: u32, format: PixelFormat) -> Frame {
    let shift = sequence as u8;
    let planes = format
        .plane_layout(width, height)
        .into_iter()
        .enumerate()
        .map(|(index, (stride, rows))| {
            let base = shift.wrapping_add((index as u8).wrapping_mul(64));
            let mut data = Vec::with_capacity((stride * rows) as usize);
            for row in 0..rows {
                data.extend(
                    (0..stride).map(|col| base.wrapping_add(col as u8).wrapping_add(row as u8)),
                );
            }
            Plane {
                data: Bytes::from(data),
                stride,
            }
        })
        .collect();

    Frame::new(
        planes,
        FrameMetadata {
            sequence,
            width,
            height,
            format,
            device_timestamp: None,
        },
    )
}

/// Producer thread emitting test-pattern frames at a fixed rate
pub struct TestPatternSource {
    config: SourceConfig,
    slot: CallbackSlot,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<u64>>,
}

impl TestPatternSource {
    pub fn new(config: SourceConfig) -> Self {
        Self {
            config,
            slot: CallbackSlot::default(),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Spawn the producer thread
    #[instrument(skip(self), fields(
        width = self.config.width,
        height = self.config.height,
        fps = self.config.fps,
    ))]
    pub fn start(&mut self) -> Result<(), SourceError> {
        if self.worker.is_some() {
            return Err(SourceError::AlreadyStarted);
        }
        if self.config.fps == 0 {
            return Err(SourceError::InvalidRate);
        }

        self.running.store(true, Ordering::SeqCst);
        let config = self.config.clone();
        let slot = self.slot.clone();
        let running = self.running.clone();

        let worker = std::thread::Builder::new()
            .name("framebridge-source".into())
            .spawn(move || produce(config, slot, running))
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                SourceError::Spawn(e)
            })?;

        self.worker = Some(worker);
        info!("Test pattern source started");
        Ok(())
    }

    /// Stop producing and join the thread. Returns the number of frames emitted.
    pub fn stop(&mut self) -> u64 {
        self.running.store(false, Ordering::SeqCst);
        self.join()
    }

    /// Wait for a bounded source to emit all its frames.
    pub fn wait(&mut self) -> u64 {
        self.join()
    }

    fn join(&mut self) -> u64 {
        let Some(worker) = self.worker.take() else {
            return 0;
        };
        match worker.join() {
            Ok(emitted) => {
                info!("Test pattern source finished after {} frames", emitted);
                emitted
            }
            Err(_) => {
                warn!("Test pattern producer thread panicked");
                0
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl FrameSource for TestPatternSource {
    fn subscribe(&mut self, callback: FrameCallback) -> Subscription {
        self.slot.subscribe(callback)
    }
}

impl Drop for TestPatternSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn produce(config: SourceConfig, slot: CallbackSlot, running: Arc<AtomicBool>) -> u64 {
    let interval = Duration::from_secs_f64(1.0 / f64::from(config.fps));
    let mut next = Instant::now();
    let mut sequence = 0u64;

    while running.load(Ordering::Relaxed) {
        if config.frame_count.is_some_and(|limit| sequence >= limit) {
            break;
        }

        sequence += 1;
        let frame = pattern_frame(sequence, config.width, config.height, config.format);
        if !slot.emit(frame) {
            debug!(sequence, "No subscriber, frame dropped");
        }

        next += interval;
        let now = Instant::now();
        if next > now {
            std::thread::sleep(next - now);
        } else {
            // Running behind; don't try to catch up with a burst.
            next = now;
        }
    }

    running.store(false, Ordering::SeqCst);
    sequence
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn config(frame_count: u64) -> SourceConfig {
        SourceConfig {
            width: 16,
            height: 8,
            fps: 1000,
            format: PixelFormat::I420,
            frame_count: Some(frame_count),
        }
    }

    fn recorder() -> (FrameCallback, Arc<Mutex<Vec<u64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: FrameCallback = Arc::new(move |frame: Frame| {
            sink.lock().unwrap().push(frame.sequence());
        });
        (callback, seen)
    }

    #[test]
    fn pattern_frame_is_valid() {
        let frame = pattern_frame(7, 13, 9, PixelFormat::I420A);
        assert!(frame.validate().is_ok());
        assert_eq!(frame.sequence(), 7);
        for (plane, (stride, rows)) in frame
            .planes
            .iter()
            .zip(PixelFormat::I420A.plane_layout(13, 9))
        {
            assert_eq!(plane.stride, stride);
            assert_eq!(plane.data.len(), (stride * rows) as usize);
        }
    }

    #[test]
    fn source_emits_every_frame_in_order() {
        let mut source = TestPatternSource::new(config(5));
        let (callback, seen) = recorder();
        let _subscription = source.subscribe(callback);

        source.start().unwrap();
        assert_eq!(source.wait(), 5);
        assert!(!source.is_running());
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn start_twice_fails() {
        let mut source = TestPatternSource::new(config(1000));
        source.start().unwrap();
        assert!(matches!(source.start(), Err(SourceError::AlreadyStarted)));
        source.stop();
    }

    #[test]
    fn cancelled_subscription_stops_delivery() {
        let slot = CallbackSlot::default();
        let (callback, seen) = recorder();
        let subscription = slot.subscribe(callback);

        assert!(slot.emit(pattern_frame(1, 4, 4, PixelFormat::Rgb24)));
        subscription.cancel();
        assert!(!slot.is_subscribed());
        assert!(!slot.emit(pattern_frame(2, 4, 4, PixelFormat::Rgb24)));
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn stale_subscription_leaves_replacement_alone() {
        let slot = CallbackSlot::default();
        let (first, _) = recorder();
        let (second, seen) = recorder();

        let old = slot.subscribe(first);
        let _new = slot.subscribe(second);
        drop(old);

        assert!(slot.emit(pattern_frame(3, 4, 4, PixelFormat::Rgb24)));
        assert_eq!(*seen.lock().unwrap(), vec![3]);
    }
}
