pub mod sink;

pub use sink::{FrameSink, LogSink};
