pub mod error;
pub mod lock;
pub mod logging;
pub mod timestamp;
pub mod wait;

pub use error::{PipelineError, PipelineResult};
pub use logging::{ComponentLogger, LogContext};
pub use timestamp::*;
pub use wait::StopSignal;
