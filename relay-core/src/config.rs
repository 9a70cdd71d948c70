use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};
use crate::session::SessionKind;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RelayConfig {
    pub paths: PathsSection,
    pub registry: RegistrySection,
    pub supervisor: SupervisorSection,
    pub worker: WorkerSection,
    pub kinds: KindsSection,
    pub extraction: ExtractionConfig,
}

impl RelayConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.data_dir)
    }

    /// Relative registry paths live under the data directory.
    pub fn registry_path(&self) -> PathBuf {
        let path = Path::new(&self.registry.path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir().join(path)
        }
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.scratch_dir)
    }

    pub fn kind(&self, kind: SessionKind) -> &KindSection {
        match kind {
            SessionKind::Relay => &self.kinds.relay,
            SessionKind::Capture => &self.kinds.capture,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.kinds.relay.prefix == self.kinds.capture.prefix {
            return Err(ConfigError::Invalid {
                field: "kinds.*.prefix",
                reason: "relay and capture sessions must use distinct prefixes".into(),
            });
        }
        if self.extraction.cdn.shard_start > self.extraction.cdn.shard_end {
            return Err(ConfigError::Invalid {
                field: "extraction.cdn.shard_start",
                reason: format!(
                    "shard range {}..={} is empty",
                    self.extraction.cdn.shard_start, self.extraction.cdn.shard_end
                ),
            });
        }
        if self.supervisor.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "supervisor.poll_interval_ms",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub data_dir: String,
    pub scratch_dir: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryBackendKind {
    Json,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrySection {
    pub backend: RegistryBackendKind,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSection {
    pub tmux_binary: String,
    pub settle_seconds: u64,
    pub poll_interval_ms: u64,
    pub stop_grace_ms: u64,
    pub log_lines: usize,
}

impl SupervisorSection {
    pub fn settle_window(&self) -> Duration {
        Duration::from_secs(self.settle_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSection {
    pub ffmpeg_binary: String,
    pub default_source: String,
    pub progress_heartbeat: bool,
    pub reconnect: ReconnectSection,
    pub transcode: TranscodeSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectSection {
    pub enabled: bool,
    pub delay_max_seconds: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscodeSection {
    pub video_codec: String,
    pub preset: String,
    pub tune: Option<String>,
    pub video_bitrate: String,
    pub maxrate: String,
    pub bufsize: String,
    pub pix_fmt: String,
    pub gop: u32,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub audio_rate: u32,
    pub audio_channels: u32,
    pub output_format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KindsSection {
    pub relay: KindSection,
    pub capture: KindSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KindSection {
    pub prefix: String,
    pub label: String,
    pub mask_prefix_len: usize,
    /// Endpoint a bare stream key is appended to.
    #[serde(default)]
    pub ingest_base: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionConfig {
    pub user_agent: String,
    pub accept_language: String,
    pub referer: Option<String>,
    pub origin: Option<String>,
    pub cookie_domain: String,
    pub manual_fallback_hint: String,
    pub direct: DirectSection,
    pub endpoints: EndpointsSection,
    pub cdn: CdnSection,
    pub resolver: ResolverSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectSection {
    pub page_timeout_seconds: u64,
    pub probe_timeout_seconds: u64,
    pub strategy_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointsSection {
    pub entry_point: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CdnSection {
    pub templates: Vec<String>,
    pub channel_pattern: String,
    pub shard_start: u32,
    pub shard_end: u32,
    pub max_probes: usize,
    pub probe_timeout_seconds: u64,
    pub strategy_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverSection {
    pub binary: String,
    pub format: String,
    pub timeout_seconds: u64,
}

pub fn load_relay_config<P: AsRef<Path>>(path: P) -> Result<RelayConfig> {
    let config: RelayConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/relay.toml")
    }

    #[test]
    fn load_fixture_config() {
        let config = load_relay_config(fixture()).expect("config should parse");
        assert_eq!(config.registry.backend, RegistryBackendKind::Json);
        assert_eq!(config.kind(SessionKind::Relay).mask_prefix_len, 10);
        assert_eq!(config.kind(SessionKind::Capture).mask_prefix_len, 30);
        assert_eq!(config.supervisor.settle_window(), Duration::from_secs(4));
        assert_eq!(config.extraction.cdn.max_probes, 5);
        assert_eq!(config.extraction.resolver.binary, "yt-dlp");
        assert!(config.kind(SessionKind::Relay).ingest_base.is_some());
        assert!(config.kind(SessionKind::Capture).ingest_base.is_none());
    }

    #[test]
    fn relative_paths_resolve_against_base_dir() {
        let config = load_relay_config(fixture()).unwrap();
        let resolved = config.registry_path();
        assert!(resolved.starts_with(&config.paths.base_dir));
        assert_eq!(resolved, config.data_dir().join("streams.json"));
        assert_eq!(
            config.data_dir(),
            Path::new(&config.paths.base_dir).join("data")
        );
        assert_eq!(
            config.resolve_path("/abs/streams.json"),
            PathBuf::from("/abs/streams.json")
        );
    }

    #[test]
    fn rejects_colliding_kind_prefixes() {
        let raw = std::fs::read_to_string(fixture()).unwrap();
        let mut config: RelayConfig = toml::from_str(&raw).unwrap();
        config.kinds.capture.prefix = config.kinds.relay.prefix.clone();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "kinds.*.prefix", .. })
        ));
    }
}
