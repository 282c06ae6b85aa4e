//! Media session: one bridge per active stream, wired to a frame source on the
//! producer side and to a sample-request entry point on the consumer side.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, instrument, warn};

use crate::capture::{Frame, FrameFormat, FrameSource, Subscription};
use crate::error::SessionError;
use crate::pipeline::{BridgeStats, ContextHandle, FrameBridge};
use crate::BridgeConfig;

/// Answer to a synchronous sample request
#[derive(Debug)]
pub enum SampleResponse {
    Ready(Frame),
    NotReady,
}

impl SampleResponse {
    pub fn into_frame(self) -> Option<Frame> {
        match self {
            SampleResponse::Ready(frame) => Some(frame),
            SampleResponse::NotReady => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, SampleResponse::Ready(_))
    }
}

pub struct MediaSession {
    bridge: Arc<FrameBridge>,
    subscription: Mutex<Option<Subscription>>,
}

impl MediaSession {
    /// Subscribe a fresh bridge to `source`.
    ///
    /// `setup` runs once on `context` when the first frame is admitted, with
    /// that frame's format.
    #[instrument(skip_all, fields(
        capacity = config.capacity,
        policy = ?config.overflow_policy,
        context = context.name(),
    ))]
    pub fn open<S, F>(
        source: &mut S,
        config: &BridgeConfig,
        context: ContextHandle,
        setup: F,
    ) -> Result<Self, SessionError>
    where
        S: FrameSource + ?Sized,
        F: FnOnce(FrameFormat) + Send + 'static,
    {
        if !context.post(|| {}) {
            return Err(SessionError::ContextStopped);
        }

        let bridge = Arc::new(FrameBridge::from_config(config)?);
        bridge.on_first_frame(move |format| {
            let name = context.name().to_owned();
            if context.run_or_post(move || setup(format)) {
                debug!(context = %name, "Surface setup scheduled");
            } else {
                warn!(context = %name, "Context stopped, surface setup skipped");
            }
        });

        // The source must not keep a closed session's bridge alive.
        let producer = Arc::downgrade(&bridge);
        let subscription = source.subscribe(Arc::new(move |frame: Frame| {
            let Some(bridge) = producer.upgrade() else {
                return;
            };
            if let Err(e) = bridge.deliver(frame) {
                debug!("Source frame refused: {}", e);
            }
        }));

        info!("Media session opened");
        Ok(Self {
            bridge,
            subscription: Mutex::new(Some(subscription)),
        })
    }

    /// Consumer entry point: a frame if one is pending, `NotReady` otherwise.
    pub fn request_sample(&self) -> SampleResponse {
        match self.bridge.request() {
            Some(frame) => SampleResponse::Ready(frame),
            None => SampleResponse::NotReady,
        }
    }

    /// Current or last known stream format, without consuming a frame.
    pub fn format(&self) -> Option<FrameFormat> {
        self.bridge.format()
    }

    pub fn stats(&self) -> BridgeStats {
        self.bridge.stats()
    }

    pub fn bridge(&self) -> &FrameBridge {
        &self.bridge
    }

    pub fn is_closed(&self) -> bool {
        self.bridge.is_closed()
    }

    /// Detach from the source and release every pending frame. Idempotent.
    pub fn close(&self) -> usize {
        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
        self.bridge.close()
    }
}

impl Drop for MediaSession {
    fn drop(&mut self) {
        self.close();
    }
}
