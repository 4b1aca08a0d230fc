use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::io::fetcher::FetcherConfig;
use crate::io::transcoder::TranscoderConfig;
use crate::ring::{FrameGeometry, SinkConfig};

// ---------- Relay ----------
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub frame: FrameGeometry,
    pub sink: SinkConfig,
    pub fetcher: FetcherConfig,
    pub transcoder: TranscoderConfig,
}

// ---------- Loader ----------
pub fn load(path: &str) -> anyhow::Result<RelayConfig> {
    let txt = std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
    let cfg = parse(&txt).with_context(|| format!("parsing {}", path))?;
    Ok(cfg)
}

pub fn parse(txt: &str) -> anyhow::Result<RelayConfig> {
    let cfg: RelayConfig = toml::from_str(txt)?;
    cfg.validate()?;
    Ok(cfg)
}

impl RelayConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.frame.validate()?;

        if self.sink.capacity == 0 {
            anyhow::bail!("sink.capacity must be at least 1");
        }
        if self.fetcher.ytdlp_program.trim().is_empty() {
            anyhow::bail!("fetcher.ytdlp_program must not be empty");
        }
        if self.transcoder.program.trim().is_empty() {
            anyhow::bail!("transcoder.program must not be empty");
        }
        if self.fetcher.http_connect_timeout_ms == 0 || self.fetcher.http_read_timeout_ms == 0 {
            anyhow::bail!("fetcher http timeouts must be non-zero");
        }
        if self.fetcher.probe_timeout_ms == 0 {
            anyhow::bail!("fetcher.probe_timeout_ms must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg = parse("").unwrap();
        assert_eq!(cfg.frame, FrameGeometry::default());
        assert_eq!(cfg.frame.frame_bytes(), 3840);
        assert_eq!(cfg.sink.capacity, 50);
        assert_eq!(cfg.transcoder.program, "ffmpeg");
        assert_eq!(cfg.fetcher.ytdlp_program, "yt-dlp");
        assert!(cfg.transcoder.args.is_none());
    }

    #[test]
    fn test_partial_sections() {
        let cfg = parse(
            r#"
            [frame]
            frame_duration_ms = 10

            [sink]
            capacity = 8

            [transcoder]
            program = "cat"
            args = []
            "#,
        )
        .unwrap();

        assert_eq!(cfg.frame.sample_rate, 48_000);
        assert_eq!(cfg.frame.frame_bytes(), 1920);
        assert_eq!(cfg.sink.capacity, 8);
        assert_eq!(cfg.transcoder.program, "cat");
        assert_eq!(cfg.transcoder.args, Some(vec![]));
        assert!(cfg.fetcher.probe);
        assert_eq!(cfg.fetcher.probe_timeout_ms, 30_000);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(parse("[sink]\ncapacity = 0").is_err());
        assert!(parse("[frame]\nbits_per_sample = 24").is_err());
        assert!(parse("[frame]\nframe_duration_ms = 0").is_err());
        assert!(parse("[transcoder]\nprogram = \"  \"").is_err());
        assert!(parse("[fetcher]\nprobe_timeout_ms = 0").is_err());
        assert!(parse("[frame]\nsample_rate = \"fast\"").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = load("/nonexistent/relay.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/relay.toml"));
    }
}
