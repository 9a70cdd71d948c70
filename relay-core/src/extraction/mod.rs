//! Resolves a playable stream URL from a page reference and a cookie export.
//!
//! Strategies run one after another in a fixed order, each under its own
//! timeout. The first one that yields a URL wins; everything that was tried
//! lands in [`ExtractionResult::tried_methods`].

mod candidates;
mod cdn;
mod direct;
mod endpoints;
mod resolver;

use std::fmt;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE, COOKIE, ORIGIN, REFERER};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{ExtractionConfig, RelayConfig};
use crate::cookies::CookieJar;
use crate::error::ErrorKind;
use crate::supervisor::CommandExecutor;

pub use candidates::{rank_candidates, select_resolver_url, CandidateScanner};
pub use cdn::CdnPatternStrategy;
pub use direct::DirectFetchStrategy;
pub use endpoints::EndpointProbeStrategy;
pub use resolver::ResolverStrategy;

/// Longest resolver stderr excerpt carried in an error message.
pub const STDERR_EXCERPT_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{tool} is not installed or not on PATH")]
    ToolUnavailable { tool: String },
    #[error("{tool} exited with status {status:?}: {stderr}")]
    ToolFailed {
        tool: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("gave up after {0:?}")]
    Timeout(Duration),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl StrategyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StrategyError::Http(err) if err.is_timeout() => ErrorKind::Timeout,
            StrategyError::Http(_) | StrategyError::ToolFailed { .. } => {
                ErrorKind::ExtractionFailure
            }
            StrategyError::ToolUnavailable { .. } => ErrorKind::ToolUnavailable,
            StrategyError::Timeout(_) => ErrorKind::Timeout,
            StrategyError::Io(_) => ErrorKind::Internal,
        }
    }
}

/// What a strategy produced when it ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyOutcome {
    Found(String),
    /// Ran cleanly without producing a URL; the string says why.
    Nothing(String),
}

/// Everything a strategy may look at while it runs.
#[derive(Debug, Clone)]
pub struct ExtractionContext {
    pub source: Url,
    pub jar: CookieJar,
    /// Known stream identifier for the templated CDN guesses.
    pub stream_id: Option<String>,
    pub client: Client,
}

#[async_trait]
pub trait ExtractionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn timeout(&self) -> Duration;

    async fn attempt(&self, ctx: &ExtractionContext) -> Result<StrategyOutcome, StrategyError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamFormat {
    #[serde(rename = "M3U8 (HLS)")]
    Hls,
    #[serde(rename = "DASH (MPD)")]
    Dash,
    #[serde(rename = "Direct Stream")]
    Direct,
}

impl StreamFormat {
    pub fn classify(url: &str) -> Self {
        let lowered = url.to_ascii_lowercase();
        if lowered.contains(".m3u8") {
            StreamFormat::Hls
        } else if lowered.contains(".mpd") {
            StreamFormat::Dash
        } else {
            StreamFormat::Direct
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StreamFormat::Hls => "M3U8 (HLS)",
            StreamFormat::Dash => "DASH (MPD)",
            StreamFormat::Direct => "Direct Stream",
        }
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    NoResult,
    Failed,
}

/// One entry of the tried-methods log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriedMethod {
    pub method: String,
    pub outcome: AttemptOutcome,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractionFailure {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionResult {
    pub success: bool,
    pub source_url: String,
    pub stream_url: Option<String>,
    pub method: Option<String>,
    pub format: Option<StreamFormat>,
    pub tried_methods: Vec<TriedMethod>,
    pub error: Option<ExtractionFailure>,
    pub extracted_at: DateTime<Utc>,
}

impl ExtractionResult {
    fn succeeded(source_url: &str, method: &str, url: String, tried: Vec<TriedMethod>) -> Self {
        Self {
            success: true,
            source_url: source_url.to_string(),
            format: Some(StreamFormat::classify(&url)),
            stream_url: Some(url),
            method: Some(method.to_string()),
            tried_methods: tried,
            error: None,
            extracted_at: Utc::now(),
        }
    }

    fn failed(source_url: &str, tried: Vec<TriedMethod>, kind: ErrorKind, message: String) -> Self {
        Self {
            success: false,
            source_url: source_url.to_string(),
            stream_url: None,
            method: None,
            format: None,
            tried_methods: tried,
            error: Some(ExtractionFailure { kind, message }),
            extracted_at: Utc::now(),
        }
    }

    pub fn link_record(&self) -> Option<LinkRecord> {
        let stream_url = self.stream_url.clone()?;
        Some(LinkRecord {
            extracted_at: self.extracted_at,
            source_url: self.source_url.clone(),
            format: StreamFormat::classify(&stream_url),
            stream_url,
            status: LinkStatus::Active,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Active,
}

/// A resolved stream URL kept on disk for later playback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub extracted_at: DateTime<Utc>,
    pub source_url: String,
    pub stream_url: String,
    pub format: StreamFormat,
    pub status: LinkStatus,
}

impl LinkRecord {
    pub fn save(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let path = path.as_ref();
        let parent = path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;
        let mut file = NamedTempFile::new_in(parent)?;
        serde_json::to_writer_pretty(&mut file, self)?;
        file.write_all(b"\n")?;
        file.persist(path).map_err(|err| err.error)?;
        info!(path = %path.display(), stream_url = %self.stream_url, "link record saved");
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExtractionRequest {
    pub source_url: String,
    pub cookie_text: String,
    pub stream_id: Option<String>,
}

impl ExtractionRequest {
    pub fn new(source_url: impl Into<String>, cookie_text: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            cookie_text: cookie_text.into(),
            stream_id: None,
        }
    }

    pub fn with_stream_id(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
        self
    }
}

pub struct ExtractionPipeline {
    config: ExtractionConfig,
    strategies: Vec<Box<dyn ExtractionStrategy>>,
}

impl fmt::Debug for ExtractionPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.strategies.iter().map(|s| s.name()).collect();
        f.debug_struct("ExtractionPipeline")
            .field("strategies", &names)
            .finish()
    }
}

impl ExtractionPipeline {
    pub fn new(config: ExtractionConfig, strategies: Vec<Box<dyn ExtractionStrategy>>) -> Self {
        Self { config, strategies }
    }

    /// Direct fetch, endpoint probe, CDN guesses, then the resolver tool.
    pub fn standard(
        config: &RelayConfig,
        executor: Arc<dyn CommandExecutor>,
    ) -> Result<Self, regex::Error> {
        let extraction = &config.extraction;
        let strategies: Vec<Box<dyn ExtractionStrategy>> = vec![
            Box::new(DirectFetchStrategy::new(&extraction.direct)),
            Box::new(EndpointProbeStrategy::new(&extraction.endpoints)),
            Box::new(CdnPatternStrategy::new(&extraction.cdn)?),
            Box::new(ResolverStrategy::new(
                &extraction.resolver,
                &extraction.cookie_domain,
                Some(config.scratch_dir()),
                executor,
            )),
        ];
        Ok(Self::new(extraction.clone(), strategies))
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Never fails outright; problems are reported inside the result.
    pub async fn extract(&self, request: &ExtractionRequest) -> ExtractionResult {
        let ctx = match self.prepare(request) {
            Ok(ctx) => ctx,
            Err((kind, message)) => {
                warn!(source = %request.source_url, %kind, %message, "extraction request rejected");
                return ExtractionResult::failed(&request.source_url, Vec::new(), kind, message);
            }
        };

        let mut tried = Vec::with_capacity(self.strategies.len());
        for strategy in &self.strategies {
            let name = strategy.name();
            let limit = strategy.timeout();
            debug!(strategy = name, timeout = ?limit, "trying extraction strategy");
            let outcome = match tokio::time::timeout(limit, strategy.attempt(&ctx)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(StrategyError::Timeout(limit)),
            };
            match outcome {
                Ok(StrategyOutcome::Found(url)) => {
                    info!(strategy = name, stream_url = %url, "stream url resolved");
                    tried.push(TriedMethod {
                        method: name.to_string(),
                        outcome: AttemptOutcome::Succeeded,
                        detail: url.clone(),
                        error_kind: None,
                    });
                    return ExtractionResult::succeeded(&request.source_url, name, url, tried);
                }
                Ok(StrategyOutcome::Nothing(detail)) => {
                    debug!(strategy = name, %detail, "strategy produced no url");
                    tried.push(TriedMethod {
                        method: name.to_string(),
                        outcome: AttemptOutcome::NoResult,
                        detail,
                        error_kind: None,
                    });
                }
                Err(err) => {
                    warn!(strategy = name, kind = %err.kind(), error = %err, "extraction strategy failed");
                    tried.push(TriedMethod {
                        method: name.to_string(),
                        outcome: AttemptOutcome::Failed,
                        detail: err.to_string(),
                        error_kind: Some(err.kind()),
                    });
                }
            }
        }

        let message = format!(
            "no playable stream url found after {} methods; the cookies are probably stale \
             or the stream is not live. Manual fallback: {}",
            tried.len(),
            self.config.manual_fallback_hint
        );
        warn!(source = %request.source_url, attempts = tried.len(), "extraction exhausted");
        ExtractionResult::failed(
            &request.source_url,
            tried,
            ErrorKind::ExtractionFailure,
            message,
        )
    }

    fn prepare(&self, request: &ExtractionRequest) -> Result<ExtractionContext, (ErrorKind, String)> {
        let raw_source = request.source_url.trim();
        if raw_source.is_empty() {
            return Err((ErrorKind::Validation, "source url is required".into()));
        }
        let source = Url::parse(raw_source)
            .map_err(|err| (ErrorKind::Validation, format!("invalid source url: {err}")))?;
        if !matches!(source.scheme(), "http" | "https") {
            return Err((
                ErrorKind::Validation,
                format!("unsupported source scheme {}", source.scheme()),
            ));
        }
        let jar = CookieJar::parse(&request.cookie_text)
            .map_err(|err| (ErrorKind::Validation, err.to_string()))?;
        let client = build_client(&self.config, &jar)?;
        Ok(ExtractionContext {
            source,
            jar,
            stream_id: request
                .stream_id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string),
            client,
        })
    }
}

fn build_client(config: &ExtractionConfig, jar: &CookieJar) -> Result<Client, (ErrorKind, String)> {
    let header = |name: &str, value: &str| {
        HeaderValue::from_str(value)
            .map_err(|err| (ErrorKind::Validation, format!("invalid {name} header: {err}")))
    };
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT_LANGUAGE, header("accept-language", &config.accept_language)?);
    if let Some(referer) = &config.referer {
        headers.insert(REFERER, header("referer", referer)?);
    }
    if let Some(origin) = &config.origin {
        headers.insert(ORIGIN, header("origin", origin)?);
    }
    // cookie values may carry UTF-8, which only the byte constructor accepts
    let cookie = HeaderValue::from_bytes(jar.header_value().as_bytes())
        .map_err(|err| (ErrorKind::Validation, format!("invalid cookie header: {err}")))?;
    headers.insert(COOKIE, cookie);
    Client::builder()
        .user_agent(config.user_agent.clone())
        .default_headers(headers)
        .build()
        .map_err(|err| (ErrorKind::Internal, format!("failed to build http client: {err}")))
}

/// HEAD request used to confirm a candidate exists.
pub(crate) async fn probe(client: &Client, url: &str, timeout: Duration) -> reqwest::Result<StatusCode> {
    let response = client.head(url).timeout(timeout).send().await?;
    Ok(response.status())
}

pub(crate) fn excerpt(text: &str, limit: usize) -> String {
    text.trim().chars().take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_formats_from_url() {
        assert_eq!(
            StreamFormat::classify("https://cdn/x/MASTER.M3U8?t=1"),
            StreamFormat::Hls
        );
        assert_eq!(StreamFormat::classify("https://cdn/x/manifest.mpd"), StreamFormat::Dash);
        assert_eq!(StreamFormat::classify("https://cdn/x/video.mp4"), StreamFormat::Direct);
        assert_eq!(StreamFormat::Hls.to_string(), "M3U8 (HLS)");
    }

    #[test]
    fn link_record_serializes_with_active_status() {
        let result = ExtractionResult::succeeded(
            "https://t.me/somechannel",
            "direct",
            "https://cdn.example.com/live/master.m3u8".into(),
            Vec::new(),
        );
        let record = result.link_record().unwrap();
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["status"], "active");
        assert_eq!(value["format"], "M3U8 (HLS)");
        assert_eq!(value["source_url"], "https://t.me/somechannel");
        assert!(value["extracted_at"].is_string());
    }

    #[test]
    fn failed_result_has_no_link_record() {
        let result = ExtractionResult::failed(
            "https://t.me/x",
            Vec::new(),
            ErrorKind::ExtractionFailure,
            "nothing".into(),
        );
        assert!(result.link_record().is_none());
        assert!(!result.success);
    }

    #[test]
    fn excerpt_truncates_on_char_boundaries() {
        let long = "é".repeat(300);
        assert_eq!(excerpt(&long, STDERR_EXCERPT_CHARS).chars().count(), 200);
        assert_eq!(excerpt("  short \n", STDERR_EXCERPT_CHARS), "short");
    }

    #[test]
    fn client_accepts_non_ascii_cookie_values() {
        let config = crate::config::load_relay_config(
            std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/relay.toml"),
        )
        .unwrap();
        let jar = CookieJar::parse("lang=русский\nbroken=a\u{7f}b\nstel_ssid=abc").unwrap();
        assert_eq!(jar.len(), 2);
        assert!(build_client(&config.extraction, &jar).is_ok());
    }
}
