pub mod frame;
pub mod source;

pub use frame::{Frame, FrameFormat, FrameMetadata, PixelFormat, Plane};
pub use source::{
    pattern_frame, CallbackSlot, FrameCallback, FrameSource, Subscription, TestPatternSource,
};
