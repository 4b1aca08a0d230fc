// src/ring/mod.rs
pub mod frame;
pub mod sink;

pub use frame::{AudioFrame, FrameGeometry};
pub use sink::{OutboundSink, ProducerLease, SinkConfig, SinkStats};

/// Anything the pacer can offer frames to without blocking.
pub trait FrameSink: Send + Sync {
    /// `false` means the frame was not accepted and has been dropped.
    fn try_enqueue(&self, frame: AudioFrame) -> bool;

    fn stats(&self) -> Option<SinkStats> {
        None
    }
}

impl<S: FrameSink + ?Sized> FrameSink for std::sync::Arc<S> {
    fn try_enqueue(&self, frame: AudioFrame) -> bool {
        FrameSink::try_enqueue(&**self, frame)
    }

    fn stats(&self) -> Option<SinkStats> {
        FrameSink::stats(&**self)
    }
}
