// src/io/mod.rs
pub mod fetcher;
pub mod pcm_pipe_out;
pub mod process;
pub mod transcoder;

pub use fetcher::{FetchSource, FetchedStream, FetcherConfig, MediaFetcher, SourceEncoding};
pub use process::{ProcessGroup, ProcessGuard};
pub use transcoder::{TranscodedStream, Transcoder, TranscoderConfig};
