use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::core::lock::lock_mutex;
use crate::ring::{AudioFrame, FrameSink, SinkStats};

/// Accepts every frame and remembers when it arrived.
#[derive(Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<(Instant, AudioFrame)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<AudioFrame> {
        lock_mutex(&self.frames, "RecordingSink::frames")
            .iter()
            .map(|(_, f)| f.clone())
            .collect()
    }

    pub fn arrivals(&self) -> Vec<Instant> {
        lock_mutex(&self.frames, "RecordingSink::arrivals")
            .iter()
            .map(|(t, _)| *t)
            .collect()
    }
}

impl FrameSink for RecordingSink {
    fn try_enqueue(&self, frame: AudioFrame) -> bool {
        lock_mutex(&self.frames, "RecordingSink::try_enqueue").push((Instant::now(), frame));
        true
    }
}

/// Rejects everything, counting and timestamping each offer.
#[derive(Default)]
pub struct AlwaysFullSink {
    offered: AtomicU64,
    offers: Mutex<Vec<Instant>>,
}

impl AlwaysFullSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offered(&self) -> u64 {
        self.offered.load(Ordering::Relaxed)
    }

    pub fn offer_times(&self) -> Vec<Instant> {
        lock_mutex(&self.offers, "AlwaysFullSink::offer_times").clone()
    }
}

impl FrameSink for AlwaysFullSink {
    fn try_enqueue(&self, _frame: AudioFrame) -> bool {
        self.offered.fetch_add(1, Ordering::Relaxed);
        lock_mutex(&self.offers, "AlwaysFullSink::try_enqueue").push(Instant::now());
        false
    }

    fn stats(&self) -> Option<SinkStats> {
        Some(SinkStats {
            dropped: self.offered(),
            ..SinkStats::default()
        })
    }
}

/// Hands out at most `chunk` bytes per read, like a slow pipe.
pub struct ChunkedReader {
    data: Vec<u8>,
    pos: usize,
    chunk: usize,
}

impl ChunkedReader {
    pub fn new(data: Vec<u8>, chunk: usize) -> Self {
        Self {
            data,
            pos: 0,
            chunk: chunk.max(1),
        }
    }

    pub fn consumed(&self) -> usize {
        self.pos
    }
}

impl Read for ChunkedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.data.len() - self.pos;
        let n = remaining.min(self.chunk).min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Deterministic non-silent PCM bytes.
pub fn pcm_fixture(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn temp_path(name: &str, ext: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "voice-relay-{}-{}-{}.{}",
        std::process::id(),
        n,
        name,
        ext
    ))
}

/// Writes `data` to a unique file under the system temp dir.
pub fn write_temp_pcm(name: &str, data: &[u8]) -> io::Result<PathBuf> {
    let path = temp_path(name, "pcm");
    std::fs::write(&path, data)?;
    Ok(path)
}

/// Writes an executable shell script, used as a stand-in for external
/// tools such as the extractor.
#[cfg(unix)]
pub fn write_temp_script(name: &str, body: &str) -> io::Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let path = temp_path(name, "sh");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body))?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path)
}
