// src/io/fetcher.rs
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::process::{ChildStdout, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::core::{PipelineError, PipelineResult};
use crate::io::process::ProcessGuard;

const DIRECT_AUDIO_EXTENSIONS: &[&str] = &[
    "mp3", "ogg", "opus", "oga", "flac", "wav", "m4a", "aac", "webm", "mka", "pcm", "raw",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    pub ytdlp_program: String,
    /// Inspect the manifest first and pick the audio format ourselves.
    pub probe: bool,
    /// yt-dlp format selector used when `probe` is off.
    pub format: String,
    pub http_connect_timeout_ms: u64,
    pub http_read_timeout_ms: u64,
    /// Upper bound for the `-J` manifest probe; the extractor is killed
    /// when it runs longer.
    pub probe_timeout_ms: u64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            ytdlp_program: "yt-dlp".to_string(),
            probe: true,
            format: "bestaudio/best".to_string(),
            http_connect_timeout_ms: 5_000,
            http_read_timeout_ms: 10_000,
            probe_timeout_ms: 30_000,
        }
    }
}

/// Declared or guessed encoding of a fetched stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceEncoding {
    pub container: Option<String>,
    pub codec: Option<String>,
}

impl SourceEncoding {
    pub fn from_container(container: &str) -> Self {
        Self {
            container: Some(container.to_string()),
            codec: None,
        }
    }

    /// Headerless s16le input; the transcoder cannot probe it.
    pub fn is_raw_pcm(&self) -> bool {
        matches!(self.container.as_deref(), Some("s16le"))
    }

    /// ffmpeg demuxer name matching the container, when one is known.
    pub fn demuxer(&self) -> Option<&'static str> {
        match self.container.as_deref()? {
            "mp3" => Some("mp3"),
            "ogg" | "oga" | "opus" => Some("ogg"),
            "flac" => Some("flac"),
            "wav" => Some("wav"),
            "aac" => Some("aac"),
            "webm" | "mka" => Some("matroska"),
            "s16le" => Some("s16le"),
            _ => None,
        }
    }
}

pub enum FetchSource {
    /// stdout of an extractor process the session owns.
    Process {
        guard: ProcessGuard,
        stdout: ChildStdout,
    },
    Http(Box<dyn Read + Send + Sync + 'static>),
    File(File),
}

impl FetchSource {
    pub fn kind(&self) -> &'static str {
        match self {
            FetchSource::Process { .. } => "process",
            FetchSource::Http(_) => "http",
            FetchSource::File(_) => "file",
        }
    }
}

pub struct FetchedStream {
    pub url: String,
    pub source: FetchSource,
    pub encoding: SourceEncoding,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SourceKind {
    File(PathBuf),
    DirectHttp,
    Extractor,
}

pub struct MediaFetcher {
    config: FetcherConfig,
}

impl MediaFetcher {
    pub fn new(config: FetcherConfig) -> Self {
        Self { config }
    }

    pub fn fetch(&self, url: &str) -> PipelineResult<FetchedStream> {
        let url = url.trim();
        match classify(url)? {
            SourceKind::File(path) => self.open_file(url, path),
            SourceKind::DirectHttp => self.open_http(url),
            SourceKind::Extractor => self.open_extractor(url),
        }
    }

    fn open_file(&self, url: &str, path: PathBuf) -> PipelineResult<FetchedStream> {
        let file = File::open(&path)
            .map_err(|e| PipelineError::unresolvable(url, format!("{}: {}", path.display(), e)))?;
        debug!("[fetcher] opened {}", path.display());
        Ok(FetchedStream {
            url: url.to_string(),
            source: FetchSource::File(file),
            encoding: encoding_from_extension(url),
        })
    }

    fn open_http(&self, url: &str) -> PipelineResult<FetchedStream> {
        info!("[fetcher] GET {}", url);

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_millis(self.config.http_connect_timeout_ms))
            .timeout_read(Duration::from_millis(self.config.http_read_timeout_ms))
            .build();

        let response = match agent.get(url).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(code, response)) => {
                return Err(PipelineError::unresolvable(
                    url,
                    format!("http status {} {}", code, response.status_text()),
                ));
            }
            Err(e) => return Err(PipelineError::unresolvable(url, e.to_string())),
        };

        let content_type = response.content_type().to_ascii_lowercase();
        if content_type.starts_with("text/") || content_type.contains("html") {
            return Err(PipelineError::NoAudioFormatAvailable {
                url: url.to_string(),
            });
        }

        let encoding = match container_from_mime(&content_type) {
            Some(container) => SourceEncoding::from_container(container),
            None => encoding_from_extension(url),
        };

        Ok(FetchedStream {
            url: url.to_string(),
            source: FetchSource::Http(Box::new(response.into_reader())),
            encoding,
        })
    }

    fn open_extractor(&self, url: &str) -> PipelineResult<FetchedStream> {
        let (selector, encoding) = if self.config.probe {
            let format = self.probe(url)?;
            info!(
                "[fetcher] selected format {} ({} / {})",
                format.format_id,
                format.ext.as_deref().unwrap_or("?"),
                format.acodec.as_deref().unwrap_or("?")
            );
            let encoding = SourceEncoding {
                container: format.ext.clone(),
                codec: format.acodec.clone(),
            };
            (format.format_id, encoding)
        } else {
            (self.config.format.clone(), SourceEncoding::default())
        };

        let program = &self.config.ytdlp_program;
        let socket_timeout = self.socket_timeout_secs();
        let mut child = Command::new(program)
            .args(["-f", &selector, "-o", "-", "--quiet", "--no-warnings", "--no-playlist"])
            .args(["--socket-timeout", &socket_timeout])
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                PipelineError::unresolvable(url, format!("{} not runnable: {}", program, e))
            })?;

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(PipelineError::unresolvable(url, "extractor stdout unavailable"));
        };

        Ok(FetchedStream {
            url: url.to_string(),
            source: FetchSource::Process {
                guard: ProcessGuard::new("yt-dlp", child),
                stdout,
            },
            encoding,
        })
    }

    fn probe(&self, url: &str) -> PipelineResult<ManifestFormat> {
        let program = &self.config.ytdlp_program;
        let timeout = Duration::from_millis(self.config.probe_timeout_ms);
        let socket_timeout = self.socket_timeout_secs();
        debug!("[fetcher] probing {} with {}", url, program);

        let mut child = Command::new(program)
            .args(["-J", "--no-playlist", "--no-warnings"])
            .args(["--socket-timeout", &socket_timeout])
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                PipelineError::unresolvable(url, format!("{} not runnable: {}", program, e))
            })?;

        // drained on threads so a large manifest cannot fill the pipe
        let stdout = collect_pipe("probe-stdout", child.stdout.take());
        let stderr = collect_pipe("probe-stderr", child.stderr.take());
        let mut guard = ProcessGuard::new("yt-dlp-probe", child);

        let status = match guard.wait_deadline(timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                guard.terminate();
                warn!("[fetcher] probe for {} timed out after {:?}", url, timeout);
                return Err(PipelineError::unresolvable(
                    url,
                    format!("probe timed out after {:?}", timeout),
                ));
            }
            Err(e) => {
                guard.terminate();
                return Err(PipelineError::unresolvable(url, format!("probe wait failed: {}", e)));
            }
        };
        let stdout = join_pipe(stdout);
        let stderr = join_pipe(stderr);

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            let reason = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("extractor failed")
                .trim()
                .to_string();
            warn!("[fetcher] probe failed for {}: {}", url, reason);
            return Err(PipelineError::unresolvable(url, reason));
        }

        let manifest: Manifest = serde_json::from_slice(&stdout)
            .map_err(|e| PipelineError::unresolvable(url, format!("unreadable manifest: {}", e)))?;

        if let Some(title) = manifest.title.as_deref() {
            info!("[fetcher] resolved '{}'", title);
        }

        select_audio_format(&manifest).ok_or_else(|| PipelineError::NoAudioFormatAvailable {
            url: url.to_string(),
        })
    }

    fn socket_timeout_secs(&self) -> String {
        self.config.http_read_timeout_ms.div_ceil(1000).max(1).to_string()
    }
}

fn collect_pipe<R>(name: &str, pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>>
where
    R: Read + Send + 'static,
{
    let mut pipe = pipe?;
    let spawned = thread::Builder::new().name(name.to_string()).spawn(move || {
        let mut buf = Vec::new();
        if let Err(e) = pipe.read_to_end(&mut buf) {
            debug!("[fetcher] probe pipe read failed: {}", e);
        }
        buf
    });
    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("[fetcher] could not spawn {} reader: {}", name, e);
            None
        }
    }
}

fn join_pipe(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

/// Subset of a yt-dlp `-J` manifest.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct Manifest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub formats: Vec<ManifestFormat>,
    #[serde(default)]
    pub format_id: Option<String>,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub vcodec: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ManifestFormat {
    pub format_id: String,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub abr: Option<f64>,
    #[serde(default)]
    pub tbr: Option<f64>,
}

impl ManifestFormat {
    fn has_audio(&self) -> bool {
        has_codec(self.acodec.as_deref())
    }

    fn audio_only(&self) -> bool {
        !has_codec(self.vcodec.as_deref())
    }

    fn bitrate(&self) -> f64 {
        self.abr.or(self.tbr).unwrap_or(0.0)
    }
}

fn has_codec(codec: Option<&str>) -> bool {
    matches!(codec, Some(c) if !c.is_empty() && c != "none")
}

/// Audio-only formats win over muxed ones, then the higher audio bitrate.
pub(crate) fn select_audio_format(manifest: &Manifest) -> Option<ManifestFormat> {
    let best = manifest
        .formats
        .iter()
        .filter(|f| f.has_audio())
        .max_by(|a, b| {
            a.audio_only()
                .cmp(&b.audio_only())
                .then(a.bitrate().total_cmp(&b.bitrate()))
        })
        .cloned();

    if best.is_some() || !manifest.formats.is_empty() {
        return best;
    }

    // single-format sources carry the codec fields at the top level
    let format_id = manifest.format_id.clone()?;
    has_codec(manifest.acodec.as_deref()).then(|| ManifestFormat {
        format_id,
        ext: manifest.ext.clone(),
        acodec: manifest.acodec.clone(),
        vcodec: manifest.vcodec.clone(),
        abr: None,
        tbr: None,
    })
}

pub(crate) fn classify(url: &str) -> PipelineResult<SourceKind> {
    if url.is_empty() {
        return Err(PipelineError::unresolvable(url, "empty url"));
    }

    if let Some(path) = url.strip_prefix("file://") {
        if path.is_empty() {
            return Err(PipelineError::unresolvable(url, "empty file path"));
        }
        return Ok(SourceKind::File(PathBuf::from(path)));
    }

    if let Some((scheme, rest)) = url.split_once("://") {
        return match scheme.to_ascii_lowercase().as_str() {
            "http" | "https" if rest.is_empty() => {
                Err(PipelineError::unresolvable(url, "missing host"))
            }
            "http" | "https" => {
                let direct = extension(url)
                    .map(|ext| DIRECT_AUDIO_EXTENSIONS.contains(&ext.as_str()))
                    .unwrap_or(false);
                Ok(if direct {
                    SourceKind::DirectHttp
                } else {
                    SourceKind::Extractor
                })
            }
            other => Err(PipelineError::unresolvable(
                url,
                format!("unsupported scheme '{}'", other),
            )),
        };
    }

    if url.starts_with('/') || url.starts_with("./") || url.starts_with("../") {
        return Ok(SourceKind::File(PathBuf::from(url)));
    }

    // search terms and extractor shorthands ("ytsearch1:...")
    Ok(SourceKind::Extractor)
}

fn extension(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let path = path.split_once("://").map(|(_, rest)| rest).unwrap_or(path);
    let segment = path.rsplit('/').next()?;
    let (_, ext) = segment.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 8 {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

fn encoding_from_extension(url: &str) -> SourceEncoding {
    match extension(url).as_deref() {
        Some("pcm") | Some("raw") => SourceEncoding {
            container: Some("s16le".to_string()),
            codec: Some("pcm_s16le".to_string()),
        },
        Some(ext) => SourceEncoding::from_container(ext),
        None => SourceEncoding::default(),
    }
}

fn container_from_mime(mime: &str) -> Option<&'static str> {
    let essence = mime.split(';').next().unwrap_or("").trim();
    match essence {
        "audio/mpeg" | "audio/mp3" => Some("mp3"),
        "audio/ogg" | "application/ogg" | "audio/opus" => Some("ogg"),
        "audio/flac" | "audio/x-flac" => Some("flac"),
        "audio/wav" | "audio/x-wav" | "audio/wave" => Some("wav"),
        "audio/aac" | "audio/aacp" => Some("aac"),
        "audio/mp4" | "audio/x-m4a" => Some("m4a"),
        "audio/webm" => Some("webm"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(id: &str, acodec: &str, vcodec: &str, abr: Option<f64>) -> ManifestFormat {
        ManifestFormat {
            format_id: id.to_string(),
            ext: Some("webm".to_string()),
            acodec: Some(acodec.to_string()),
            vcodec: Some(vcodec.to_string()),
            abr,
            tbr: None,
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            classify("file:///tmp/a.pcm").unwrap(),
            SourceKind::File(PathBuf::from("/tmp/a.pcm"))
        );
        assert_eq!(
            classify("/srv/music/a.flac").unwrap(),
            SourceKind::File(PathBuf::from("/srv/music/a.flac"))
        );
        assert_eq!(
            classify("https://cdn.example.org/a.MP3?sig=1").unwrap(),
            SourceKind::DirectHttp
        );
        assert_eq!(
            classify("https://www.youtube.com/watch?v=abc").unwrap(),
            SourceKind::Extractor
        );
        assert_eq!(classify("ytsearch1:lofi").unwrap(), SourceKind::Extractor);

        assert!(matches!(
            classify(""),
            Err(PipelineError::SourceUnresolvable { .. })
        ));
        assert!(matches!(
            classify("ftp://example.org/a.mp3"),
            Err(PipelineError::SourceUnresolvable { .. })
        ));
        assert!(classify("https://").is_err());
    }

    #[test]
    fn test_extension() {
        assert_eq!(extension("https://x.org/a/b.Opus#t=1").as_deref(), Some("opus"));
        assert_eq!(extension("https://x.org/watch?v=a.b"), None);
        assert_eq!(extension("https://x.org/"), None);
    }

    #[test]
    fn test_select_prefers_audio_only_then_bitrate() {
        let manifest = Manifest {
            formats: vec![
                format("18", "mp4a.40.2", "avc1", Some(192.0)),
                format("249", "opus", "none", Some(50.0)),
                format("251", "opus", "none", Some(160.0)),
                format("137", "none", "avc1", None),
            ],
            ..Manifest::default()
        };
        let selected = select_audio_format(&manifest).unwrap();
        assert_eq!(selected.format_id, "251");
    }

    #[test]
    fn test_select_falls_back_to_muxed() {
        let manifest = Manifest {
            formats: vec![
                format("18", "mp4a.40.2", "avc1", Some(96.0)),
                format("137", "none", "avc1", None),
            ],
            ..Manifest::default()
        };
        assert_eq!(select_audio_format(&manifest).unwrap().format_id, "18");
    }

    #[test]
    fn test_select_none_when_no_audio() {
        let manifest = Manifest {
            formats: vec![format("137", "none", "avc1", None)],
            ..Manifest::default()
        };
        assert!(select_audio_format(&manifest).is_none());
    }

    #[test]
    fn test_select_single_format_manifest() {
        let json = r#"{"title":"clip","format_id":"0","ext":"mp3","acodec":"mp3","vcodec":"none"}"#;
        let manifest: Manifest = serde_json::from_str(json).unwrap();
        let selected = select_audio_format(&manifest).unwrap();
        assert_eq!(selected.format_id, "0");
        assert_eq!(selected.ext.as_deref(), Some("mp3"));
    }

    #[test]
    fn test_manifest_parsing_ignores_unknown_fields() {
        let json = r#"{
            "title": "x",
            "duration": 12.5,
            "formats": [
                {
                    "format_id": "140", "ext": "m4a", "acodec": "mp4a.40.2",
                    "vcodec": "none", "abr": 129.5, "filesize": 1
                }
            ]
        }"#;
        let manifest: Manifest = serde_json::from_str(json).unwrap();
        assert_eq!(manifest.formats.len(), 1);
        assert_eq!(select_audio_format(&manifest).unwrap().format_id, "140");
    }

    #[test]
    fn test_encoding_guesses() {
        assert!(encoding_from_extension("/tmp/a.pcm").is_raw_pcm());
        assert_eq!(encoding_from_extension("/tmp/a.ogg").demuxer(), Some("ogg"));
        assert_eq!(encoding_from_extension("/tmp/a").container, None);
        assert_eq!(container_from_mime("audio/mpeg; charset=x"), Some("mp3"));
        assert_eq!(container_from_mime("video/mp4"), None);
    }

    #[test]
    fn test_missing_file_is_unresolvable() {
        let fetcher = MediaFetcher::new(FetcherConfig::default());
        let result = fetcher.fetch("/definitely/not/here.pcm");
        assert!(matches!(
            result,
            Err(PipelineError::SourceUnresolvable { .. })
        ));
    }

    #[test]
    fn test_missing_extractor_is_unresolvable() {
        let fetcher = MediaFetcher::new(FetcherConfig {
            ytdlp_program: "/nonexistent/yt-dlp".to_string(),
            ..FetcherConfig::default()
        });
        let result = fetcher.fetch("https://www.example.org/watch?v=1");
        assert!(matches!(
            result,
            Err(PipelineError::SourceUnresolvable { .. })
        ));
    }
}
