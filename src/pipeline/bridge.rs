//! Bounded frame bridge between a push-based producer and a pull-based consumer

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, Producer, RingBuffer};
use ringbuf::HeapRb;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, trace, warn};

use crate::capture::{Frame, FrameFormat};
use crate::error::BridgeError;
use crate::BridgeConfig;

/// What to do with a delivered frame when the queue is already full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued frame to make room (live video prefers freshness)
    #[default]
    DropOldest,
    /// Keep the queue as is and drop the incoming frame
    RejectNewest,
}

/// Outcome of a [`FrameBridge::deliver`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Appended with room to spare
    Queued,
    /// Appended after the oldest frame was dropped
    Evicted,
    /// Queue full under [`OverflowPolicy::RejectNewest`]; the frame was dropped
    Rejected,
    /// Bridge torn down; the frame was dropped
    Closed,
}

type FirstFrameHook = Box<dyn FnOnce(FrameFormat) + Send>;

enum Playback {
    NotStarted { hook: Option<FirstFrameHook> },
    /// `announced` is set once a hook has fired; later hooks are discarded.
    Started { first: FrameFormat, announced: bool },
}

struct State {
    /// Preallocated storage, so admission never allocates
    ring: HeapRb<Frame>,
    last_format: Option<FrameFormat>,
    playback: Playback,
    closed: bool,
}

#[derive(Default)]
struct Stats {
    delivered: AtomicU64,
    served: AtomicU64,
    evicted: AtomicU64,
    rejected: AtomicU64,
    invalid: AtomicU64,
    dropped_closed: AtomicU64,
}

/// Counter snapshot returned by [`FrameBridge::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub delivered: u64,
    pub served: u64,
    pub evicted: u64,
    pub rejected: u64,
    pub invalid: u64,
    pub dropped_closed: u64,
}

/// Thread-safe FIFO of pending frames with a fixed capacity.
///
/// `deliver` and `request` only ever take a short lock; neither waits for the
/// other side. Frames that leave the queue early (eviction, rejection, teardown)
/// are dropped after the lock is released.
pub struct FrameBridge {
    state: Mutex<State>,
    capacity: usize,
    policy: OverflowPolicy,
    stats: CachePadded<Stats>,
}

impl FrameBridge {
    pub fn new(capacity: usize) -> Result<Self, BridgeError> {
        Self::with_policy(capacity, OverflowPolicy::default())
    }

    #[instrument]
    pub fn with_policy(capacity: usize, policy: OverflowPolicy) -> Result<Self, BridgeError> {
        if capacity == 0 {
            return Err(BridgeError::ZeroCapacity);
        }

        debug!("Creating frame bridge");
        Ok(Self {
            state: Mutex::new(State {
                ring: HeapRb::new(capacity),
                last_format: None,
                playback: Playback::NotStarted { hook: None },
                closed: false,
            }),
            capacity,
            policy,
            stats: CachePadded::new(Stats::default()),
        })
    }

    pub fn from_config(config: &BridgeConfig) -> Result<Self, BridgeError> {
        Self::with_policy(config.capacity, config.overflow_policy)
    }

    // Hooks run outside the lock, so a poisoned guard still holds consistent state.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Producer: hand a frame to the bridge. Never blocks on the consumer.
    ///
    /// After teardown every frame is dropped as [`Admission::Closed`], invalid
    /// ones included.
    pub fn deliver(&self, frame: Frame) -> Result<Admission, BridgeError> {
        let format = frame.format();
        let sequence = frame.sequence();

        let (admission, released, announce) = {
            let mut state = self.lock();
            if state.closed {
                (Admission::Closed, Some(frame), None)
            } else if let Err(e) = frame.validate() {
                drop(state);
                self.stats.invalid.fetch_add(1, Ordering::Relaxed);
                warn!("Refusing frame {}: {}", sequence, e);
                return Err(e);
            } else {
                let (admission, released) = if state.ring.is_full() {
                    match self.policy {
                        OverflowPolicy::DropOldest => {
                            (Admission::Evicted, state.ring.push_overwrite(frame))
                        }
                        OverflowPolicy::RejectNewest => (Admission::Rejected, Some(frame)),
                    }
                } else {
                    (Admission::Queued, state.ring.try_push(frame).err())
                };

                let announce = if admission == Admission::Rejected {
                    None
                } else {
                    state.last_format = Some(format);
                    state.mark_started(format)
                };
                (admission, released, announce)
            }
        };

        // Evicted or refused frames are released here, off the lock.
        drop(released);

        match admission {
            Admission::Queued => self.note_delivered(),
            Admission::Evicted => {
                self.note_delivered();
                self.stats.evicted.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("framebridge_frames_evicted_total").increment(1);
            }
            Admission::Rejected => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("framebridge_frames_rejected_total").increment(1);
            }
            Admission::Closed => {
                self.stats.dropped_closed.fetch_add(1, Ordering::Relaxed);
            }
        }
        trace!(sequence, ?admission, "Frame delivered");

        if let Some(hook) = announce {
            debug!(
                "First frame announced: {}x{} {:?}",
                format.width, format.height, format.format
            );
            hook(format);
        }

        Ok(admission)
    }

    fn note_delivered(&self) {
        self.stats.delivered.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("framebridge_frames_delivered_total").increment(1);
    }

    /// Consumer: take the oldest queued frame, or `None` if nothing is pending.
    pub fn request(&self) -> Option<Frame> {
        let frame = self.lock().ring.try_pop()?;

        self.stats.served.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("framebridge_frames_served_total").increment(1);
        trace!(sequence = frame.sequence(), "Frame served");
        Some(frame)
    }

    /// Last admitted frame's format, kept after the queue drains.
    pub fn format(&self) -> Option<FrameFormat> {
        self.lock().last_format
    }

    /// Register the one-shot first-frame hook.
    ///
    /// The announcement happens once per bridge, with the format of the first
    /// admitted frame. A hook registered after that frame arrived runs right
    /// away on the calling thread, unless an earlier hook was already
    /// announced, in which case it is dropped. A registration replaces one that
    /// has not fired yet. Returns whether this hook fired or is pending.
    pub fn on_first_frame<F>(&self, hook: F) -> bool
    where
        F: FnOnce(FrameFormat) + Send + 'static,
    {
        let mut state = self.lock();
        if state.closed {
            return false;
        }

        let first = match &mut state.playback {
            Playback::NotStarted { hook: pending } => {
                *pending = Some(Box::new(hook));
                return true;
            }
            Playback::Started {
                announced: true, ..
            } => {
                debug!("First frame already announced, hook dropped");
                return false;
            }
            Playback::Started { first, announced } => {
                *announced = true;
                *first
            }
        };
        drop(state);
        hook(first);
        true
    }

    /// Tear down: release every queued frame and refuse further traffic.
    ///
    /// Returns the number of frames released. Calling it again is a no-op.
    #[instrument(skip(self), fields(capacity = self.capacity))]
    pub fn close(&self) -> usize {
        let (drained, pending_hook) = {
            let mut state = self.lock();
            if state.closed {
                return 0;
            }
            state.closed = true;

            let mut drained = Vec::with_capacity(state.ring.occupied_len());
            while let Some(frame) = state.ring.try_pop() {
                drained.push(frame);
            }
            let pending_hook = match &mut state.playback {
                Playback::NotStarted { hook } => hook.take(),
                Playback::Started { .. } => None,
            };
            (drained, pending_hook)
        };

        let released = drained.len();
        drop(drained);
        drop(pending_hook);

        let stats = self.stats();
        info!(
            released,
            delivered = stats.delivered,
            served = stats.served,
            evicted = stats.evicted,
            "Frame bridge closed"
        );
        released
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            served: self.stats.served.load(Ordering::Relaxed),
            evicted: self.stats.evicted.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            invalid: self.stats.invalid.load(Ordering::Relaxed),
            dropped_closed: self.stats.dropped_closed.load(Ordering::Relaxed),
        }
    }
}

impl State {
    /// `NotStarted -> Started` transition; hands back the hook to fire, if any.
    fn mark_started(&mut self, format: FrameFormat) -> Option<FirstFrameHook> {
        let hook = match &mut self.playback {
            Playback::NotStarted { hook } => hook.take(),
            Playback::Started { .. } => return None,
        };
        self.playback = Playback::Started {
            first: format,
            announced: hook.is_some(),
        };
        hook
    }
}

impl std::fmt::Debug for FrameBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBridge")
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{pattern_frame, PixelFormat};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn frame(sequence: u64) -> Frame {
        pattern_frame(sequence, 8, 6, PixelFormat::I420)
    }

    fn drain(bridge: &FrameBridge) -> Vec<u64> {
        std::iter::from_fn(|| bridge.request())
            .map(|f| f.sequence())
            .collect()
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert_eq!(FrameBridge::new(0).unwrap_err(), BridgeError::ZeroCapacity);
    }

    #[test]
    fn built_from_config() {
        let bridge = FrameBridge::from_config(&BridgeConfig {
            capacity: 7,
            overflow_policy: OverflowPolicy::RejectNewest,
        })
        .unwrap();
        assert_eq!(bridge.capacity(), 7);
        assert_eq!(bridge.policy(), OverflowPolicy::RejectNewest);
        assert!(bridge.is_empty());
    }

    #[test]
    fn serves_in_delivery_order() {
        let bridge = FrameBridge::new(4).unwrap();
        for seq in 1..=4 {
            assert_eq!(bridge.deliver(frame(seq)).unwrap(), Admission::Queued);
        }
        assert_eq!(bridge.len(), 4);
        assert_eq!(drain(&bridge), vec![1, 2, 3, 4]);
        assert!(bridge.is_empty());
    }

    #[test]
    fn overflow_drops_oldest() {
        let bridge = FrameBridge::new(3).unwrap();
        for seq in 1..=3 {
            bridge.deliver(frame(seq)).unwrap();
        }
        assert_eq!(bridge.deliver(frame(4)).unwrap(), Admission::Evicted);
        assert_eq!(bridge.len(), 3);
        assert_eq!(drain(&bridge), vec![2, 3, 4]);
        assert_eq!(bridge.stats().evicted, 1);
    }

    #[test]
    fn overflow_can_reject_newest() {
        let bridge = FrameBridge::with_policy(2, OverflowPolicy::RejectNewest).unwrap();
        bridge.deliver(frame(1)).unwrap();
        bridge.deliver(frame(2)).unwrap();
        assert_eq!(bridge.deliver(frame(3)).unwrap(), Admission::Rejected);
        assert_eq!(drain(&bridge), vec![1, 2]);

        let stats = bridge.stats();
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.rejected, 1);
    }

    #[test]
    fn capacity_of_one_keeps_latest() {
        let bridge = FrameBridge::new(1).unwrap();
        for seq in 1..=5 {
            bridge.deliver(frame(seq)).unwrap();
            assert!(bridge.len() <= 1);
        }
        assert_eq!(drain(&bridge), vec![5]);
    }

    #[test]
    fn empty_bridge_returns_none() {
        let bridge = FrameBridge::new(2).unwrap();
        assert!(bridge.request().is_none());

        bridge.deliver(frame(1)).unwrap();
        assert_eq!(bridge.request().map(|f| f.sequence()), Some(1));
        assert!(bridge.request().is_none());
        assert!(bridge.request().is_none());
    }

    #[test]
    fn frames_are_served_once() {
        let bridge = FrameBridge::new(8).unwrap();
        let mut seen = Vec::new();
        for seq in 1..=20 {
            bridge.deliver(frame(seq)).unwrap();
            if seq % 3 == 0 {
                seen.extend(bridge.request().map(|f| f.sequence()));
            }
        }
        seen.extend(drain(&bridge));

        let mut dedup = seen.clone();
        dedup.dedup();
        assert_eq!(seen, dedup);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(bridge.stats().served as usize, seen.len());
    }

    #[test]
    fn invalid_frame_is_refused() {
        let bridge = FrameBridge::new(2).unwrap();
        let bad = pattern_frame(1, 0, 4, PixelFormat::Rgb24);
        assert_eq!(
            bridge.deliver(bad).unwrap_err(),
            BridgeError::InvalidDimensions {
                width: 0,
                height: 4
            }
        );
        assert!(bridge.is_empty());
        assert!(bridge.format().is_none());
        assert_eq!(bridge.stats().invalid, 1);
    }

    #[test]
    fn format_survives_drain() {
        let bridge = FrameBridge::new(2).unwrap();
        assert!(bridge.format().is_none());

        bridge
            .deliver(pattern_frame(1, 640, 480, PixelFormat::Nv12))
            .unwrap();
        bridge
            .deliver(pattern_frame(2, 1280, 720, PixelFormat::Nv12))
            .unwrap();
        drain(&bridge);

        assert_eq!(
            bridge.format(),
            Some(FrameFormat {
                width: 1280,
                height: 720,
                format: PixelFormat::Nv12
            })
        );
    }

    #[test]
    fn first_frame_hook_fires_once() {
        let bridge = FrameBridge::new(2).unwrap();
        let fired = Arc::new(Mutex::new(Vec::new()));

        let sink = fired.clone();
        bridge.on_first_frame(move |format| sink.lock().unwrap().push(format));

        bridge
            .deliver(pattern_frame(1, 320, 240, PixelFormat::I420))
            .unwrap();
        bridge
            .deliver(pattern_frame(2, 640, 480, PixelFormat::I420))
            .unwrap();

        let fired = fired.lock().unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!((fired[0].width, fired[0].height), (320, 240));
    }

    #[test]
    fn late_hook_sees_first_format() {
        let bridge = FrameBridge::new(2).unwrap();
        bridge
            .deliver(pattern_frame(1, 320, 240, PixelFormat::I420))
            .unwrap();
        bridge
            .deliver(pattern_frame(2, 640, 480, PixelFormat::I420))
            .unwrap();

        let width = Arc::new(AtomicUsize::new(0));
        let seen = width.clone();
        assert!(bridge.on_first_frame(move |format| {
            seen.store(format.width as usize, Ordering::SeqCst)
        }));
        assert_eq!(width.load(Ordering::SeqCst), 320);
    }

    #[test]
    fn announcement_happens_once_per_bridge() {
        let bridge = FrameBridge::new(2).unwrap();
        bridge.deliver(frame(1)).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let accepted: Vec<bool> = (0..3)
            .map(|_| {
                let counter = fired.clone();
                bridge.on_first_frame(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        assert_eq!(accepted, vec![true, false, false]);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hook_fired_on_delivery_is_not_repeated() {
        let bridge = FrameBridge::new(2).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        bridge.on_first_frame(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        bridge.deliver(frame(1)).unwrap();

        let counter = fired.clone();
        assert!(!bridge.on_first_frame(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn closed_bridge_drops_invalid_frames_quietly() {
        let bridge = FrameBridge::new(2).unwrap();
        bridge.close();

        let bad = pattern_frame(1, 0, 4, PixelFormat::Rgb24);
        assert_eq!(bridge.deliver(bad).unwrap(), Admission::Closed);
        let stats = bridge.stats();
        assert_eq!(stats.invalid, 0);
        assert_eq!(stats.dropped_closed, 1);
    }

    #[test]
    fn close_drains_and_degrades() {
        let bridge = FrameBridge::new(3).unwrap();
        for seq in 1..=3 {
            bridge.deliver(frame(seq)).unwrap();
        }

        assert_eq!(bridge.close(), 3);
        assert!(bridge.is_closed());
        assert!(bridge.is_empty());
        assert!(bridge.request().is_none());
        assert_eq!(bridge.deliver(frame(4)).unwrap(), Admission::Closed);
        assert!(bridge.request().is_none());
        assert_eq!(bridge.close(), 0);
        assert_eq!(bridge.stats().dropped_closed, 1);
    }

    #[test]
    fn close_discards_pending_hook() {
        let bridge = FrameBridge::new(1).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        assert!(bridge.on_first_frame(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        bridge.close();
        bridge.deliver(frame(1)).unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn evicted_frames_release_their_planes() {
        let bridge = FrameBridge::new(1).unwrap();
        let first = frame(1);
        let meta = first.meta.clone();
        bridge.deliver(first).unwrap();
        assert_eq!(Arc::strong_count(&meta), 2);

        bridge.deliver(frame(2)).unwrap();
        assert_eq!(Arc::strong_count(&meta), 1);
    }
}
