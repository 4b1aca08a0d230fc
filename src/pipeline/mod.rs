// src/pipeline/mod.rs
pub mod controller;
pub mod pacer;
pub mod session;

pub use controller::PipelineController;
pub use pacer::{FramePacer, PaceEnd, PaceReport};
pub use session::{PlaybackSession, SessionEvent, SessionHandle, SessionPhase, SessionState};
