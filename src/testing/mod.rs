//! Sinks, readers and fixtures for exercising the pipeline without a
//! live transport.
mod mocks;

pub use mocks::*;
