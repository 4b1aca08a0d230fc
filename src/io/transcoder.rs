// src/io/transcoder.rs
use std::io::{self, Read, Write};
use std::process::{ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::core::lock::lock_mutex;
use crate::core::{PipelineError, PipelineResult};
use crate::io::fetcher::{FetchSource, FetchedStream, SourceEncoding};
use crate::io::process::{ProcessGroup, ProcessGuard};
use crate::ring::FrameGeometry;

pub const TRANSCODER_LABEL: &str = "transcoder";

const FEED_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscoderConfig {
    pub program: String,
    pub loglevel: String,
    /// Pass the fetched container as `-f` instead of letting ffmpeg probe.
    pub use_format_hint: bool,
    /// Verbatim argument list replacing the ffmpeg defaults. The process
    /// must read the source on stdin and write canonical PCM to stdout.
    pub args: Option<Vec<String>>,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            loglevel: "error".to_string(),
            use_format_hint: false,
            args: None,
        }
    }
}

impl TranscoderConfig {
    pub fn command_args(
        &self,
        geometry: &FrameGeometry,
        encoding: &SourceEncoding,
    ) -> Vec<String> {
        if let Some(args) = &self.args {
            return args.clone();
        }

        let rate = geometry.sample_rate.to_string();
        let rate = rate.as_str();
        let channels = geometry.channels.to_string();
        let channels = channels.as_str();

        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            self.loglevel.clone(),
        ];

        if encoding.is_raw_pcm() {
            args.extend(["-f", "s16le", "-ar", rate, "-ac", channels].map(String::from));
        } else if self.use_format_hint {
            if let Some(demuxer) = encoding.demuxer() {
                args.extend(["-f", demuxer].map(String::from));
            }
        }

        args.extend(
            [
                "-i", "pipe:0", "-vn", "-f", "s16le", "-acodec", "pcm_s16le", "-ar", rate, "-ac",
                channels, "pipe:1",
            ]
            .map(String::from),
        );
        args
    }
}

/// Canonical PCM output of a running transcoder plus the processes behind it.
pub struct TranscodedStream {
    pub pcm: ChildStdout,
    pub processes: ProcessGroup,
    pub encoding: SourceEncoding,
    upstream_error: Arc<Mutex<Option<PipelineError>>>,
}

impl TranscodedStream {
    /// Where the in-process feeder (HTTP sources only) records a failure.
    pub fn upstream_error_slot(&self) -> Arc<Mutex<Option<PipelineError>>> {
        self.upstream_error.clone()
    }
}

pub struct Transcoder {
    config: TranscoderConfig,
    geometry: FrameGeometry,
}

impl Transcoder {
    pub fn new(config: TranscoderConfig, geometry: FrameGeometry) -> Self {
        Self { config, geometry }
    }

    /// Spawns the transcoder with the fetched stream as its stdin.
    ///
    /// Process sources are chained pipe-to-pipe, files are handed over as
    /// the file descriptor, HTTP bodies are copied by a feeder thread. On
    /// failure every process taken over from the fetcher is reaped.
    pub fn start(&self, fetched: FetchedStream) -> PipelineResult<TranscodedStream> {
        let FetchedStream {
            url,
            source,
            encoding,
        } = fetched;

        let mut processes = ProcessGroup::new();
        let source_kind = source.kind();
        let (stdin, http_reader) = match source {
            FetchSource::Process { guard, stdout } => {
                processes.push(guard);
                (Stdio::from(stdout), None)
            }
            FetchSource::File(file) => (Stdio::from(file), None),
            FetchSource::Http(reader) => (Stdio::piped(), Some(reader)),
        };

        let args = self.config.command_args(&self.geometry, &encoding);
        debug!("[transcoder] {} {}", self.config.program, args.join(" "));

        let mut child = match Command::new(&self.config.program)
            .args(&args)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                processes.terminate_all();
                return Err(PipelineError::transcode_start(&self.config.program, e));
            }
        };

        let feeder_stdin = child.stdin.take();
        let pcm = child.stdout.take();
        processes.push(ProcessGuard::new(TRANSCODER_LABEL, child));

        let Some(pcm) = pcm else {
            processes.terminate_all();
            return Err(PipelineError::transcode_start(
                &self.config.program,
                "stdout unavailable",
            ));
        };

        let upstream_error = Arc::new(Mutex::new(None));
        if let Some(reader) = http_reader {
            let Some(stdin) = feeder_stdin else {
                processes.terminate_all();
                return Err(PipelineError::transcode_start(
                    &self.config.program,
                    "stdin unavailable",
                ));
            };
            if let Err(e) = spawn_feeder(reader, stdin, upstream_error.clone()) {
                processes.terminate_all();
                return Err(PipelineError::transcode_start(&self.config.program, e));
            }
        }

        info!(
            "[transcoder] {} started for {} ({} source, {} Hz, {} ch)",
            self.config.program, url, source_kind, self.geometry.sample_rate, self.geometry.channels
        );

        Ok(TranscodedStream {
            pcm,
            processes,
            encoding,
            upstream_error,
        })
    }
}

fn spawn_feeder(
    mut reader: Box<dyn Read + Send + Sync + 'static>,
    mut stdin: ChildStdin,
    upstream_error: Arc<Mutex<Option<PipelineError>>>,
) -> io::Result<()> {
    thread::Builder::new()
        .name("http-feeder".to_string())
        .spawn(move || {
            let mut buf = vec![0u8; FEED_CHUNK];
            loop {
                let n = match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("[transcoder] http source read failed: {}", e);
                        *lock_mutex(&upstream_error, "feeder") = Some(PipelineError::read(e));
                        break;
                    }
                };
                if let Err(e) = stdin.write_all(&buf[..n]) {
                    // transcoder gone (stop or exit); nothing left to feed
                    debug!("[transcoder] feeder stopped: {}", e);
                    break;
                }
            }
            // dropping stdin signals end-of-input to the transcoder
        })
        .map(|_| ())
}
