//! Consumer-side sinks: one-time surface setup plus per-frame presentation

use color_eyre::{eyre::eyre, Result};
use tracing::{info, instrument, trace};

use crate::capture::{Frame, FrameFormat};

/// Something that renders pulled frames onto a surface
pub trait FrameSink {
    /// Size the surface for the stream. Called once, before any `present`.
    fn configure(&mut self, format: FrameFormat) -> Result<()>;

    /// Copy or render the frame. The frame is released after this returns.
    fn present(&mut self, frame: &Frame) -> Result<()>;
}

/// Sink that validates and counts frames instead of drawing them
#[derive(Debug, Default)]
pub struct LogSink {
    surface: Option<FrameFormat>,
    presented: u64,
    last_sequence: Option<u64>,
    bytes: u64,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn surface(&self) -> Option<FrameFormat> {
        self.surface
    }

    pub fn is_configured(&self) -> bool {
        self.surface.is_some()
    }

    pub fn presented(&self) -> u64 {
        self.presented
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl FrameSink for LogSink {
    #[instrument(skip(self))]
    fn configure(&mut self, format: FrameFormat) -> Result<()> {
        if let Some(existing) = self.surface {
            return Err(eyre!("Surface already configured as {:?}", existing));
        }

        info!(
            "Surface configured: {}x{} {:?}",
            format.width, format.height, format.format
        );
        self.surface = Some(format);
        Ok(())
    }

    fn present(&mut self, frame: &Frame) -> Result<()> {
        let surface = self
            .surface
            .ok_or_else(|| eyre!("Frame {} presented before surface setup", frame.sequence()))?;

        let format = frame.format();
        if format != surface {
            return Err(eyre!(
                "Frame {} is {}x{} {:?}, surface is {}x{} {:?}",
                frame.sequence(),
                frame.width(),
                frame.height(),
                format.format,
                surface.width,
                surface.height,
                surface.format
            ));
        }

        if let Some(last) = self.last_sequence {
            if frame.sequence() <= last {
                return Err(eyre!(
                    "Frame {} presented after frame {}",
                    frame.sequence(),
                    last
                ));
            }
        }

        let latency = frame.timestamp.elapsed();
        metrics::histogram!("framebridge_frame_latency_ms").record(latency.as_secs_f64() * 1000.0);

        self.presented += 1;
        self.bytes += frame.byte_len() as u64;
        self.last_sequence = Some(frame.sequence());
        trace!(
            sequence = frame.sequence(),
            latency_us = latency.as_micros() as u64,
            "Frame presented"
        );
        Ok(())
    }
}
