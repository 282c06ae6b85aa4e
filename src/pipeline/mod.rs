pub mod bridge;
pub mod context;

pub use bridge::{Admission, BridgeStats, FrameBridge, OverflowPolicy};
pub use context::{ContextHandle, ExecutionContext};
