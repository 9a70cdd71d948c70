use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info};

use crate::config::CdnSection;

use super::{probe, ExtractionContext, ExtractionStrategy, StrategyError, StrategyOutcome};

/// Used in place of a stream identifier nobody supplied.
pub const UNRESOLVED_STREAM_ID: &str = "stream_id";

/// Guesses CDN playlist URLs from templates over a shard range and probes
/// a bounded number of them.
#[derive(Debug, Clone)]
pub struct CdnPatternStrategy {
    templates: Vec<String>,
    channel: Regex,
    shard_start: u32,
    shard_end: u32,
    max_probes: usize,
    probe_timeout: Duration,
    timeout: Duration,
}

impl CdnPatternStrategy {
    pub fn new(config: &CdnSection) -> Result<Self, regex::Error> {
        Ok(Self {
            templates: config.templates.clone(),
            channel: Regex::new(&config.channel_pattern)?,
            shard_start: config.shard_start,
            shard_end: config.shard_end,
            max_probes: config.max_probes,
            probe_timeout: Duration::from_secs(config.probe_timeout_seconds),
            timeout: Duration::from_secs(config.strategy_timeout_seconds),
        })
    }

    /// Shard-major expansion of every template, cut at `max_probes`.
    pub fn candidates(&self, channel: &str, stream_id: &str) -> Vec<String> {
        (self.shard_start..=self.shard_end)
            .flat_map(|shard| {
                self.templates.iter().map(move |template| {
                    template
                        .replace("{shard}", &shard.to_string())
                        .replace("{stream_id}", stream_id)
                        .replace("{channel}", channel)
                })
            })
            .take(self.max_probes)
            .collect()
    }

    fn channel_of<'a>(&self, source: &'a str) -> Option<&'a str> {
        self.channel
            .captures(source)
            .and_then(|captures| captures.get(1))
            .map(|hit| hit.as_str())
    }
}

#[async_trait]
impl ExtractionStrategy for CdnPatternStrategy {
    fn name(&self) -> &'static str {
        "cdn_patterns"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn attempt(&self, ctx: &ExtractionContext) -> Result<StrategyOutcome, StrategyError> {
        let Some(channel) = self.channel_of(ctx.source.as_str()) else {
            return Ok(StrategyOutcome::Nothing(
                "source does not name a channel".into(),
            ));
        };
        let stream_id = match ctx.stream_id.as_deref() {
            Some(id) => id,
            None => {
                info!(channel, "no stream id supplied; probing with placeholder identifier");
                UNRESOLVED_STREAM_ID
            }
        };
        let candidates = self.candidates(channel, stream_id);
        for candidate in &candidates {
            match probe(&ctx.client, candidate, self.probe_timeout).await {
                Ok(status) if status.is_success() => {
                    return Ok(StrategyOutcome::Found(candidate.clone()));
                }
                Ok(status) => debug!(%candidate, %status, "cdn candidate rejected"),
                Err(error) => debug!(%candidate, %error, "cdn candidate unreachable"),
            }
        }
        let unresolved = if ctx.stream_id.is_none() {
            "; stream id unresolved"
        } else {
            ""
        };
        Ok(StrategyOutcome::Nothing(format!(
            "{} cdn candidates for channel {channel} answered nothing{unresolved}",
            candidates.len()
        )))
    }
}
