// src/lib.rs
pub mod config;
pub mod core;
pub mod io;
pub mod pipeline;
pub mod ring;
pub mod testing;

// Re-export the main types
pub use config::RelayConfig;
pub use core::{ComponentLogger, LogContext, PipelineError, PipelineResult};
pub use core::timestamp::utc_ns_now;
pub use pipeline::{PipelineController, SessionEvent, SessionHandle, SessionPhase, SessionState};
pub use ring::{AudioFrame, FrameGeometry, FrameSink, OutboundSink};
