use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::config::DirectSection;

use super::candidates::{rank_candidates, CandidateScanner};
use super::{probe, ExtractionContext, ExtractionStrategy, StrategyError, StrategyOutcome};

/// Fetches the source page with the cookies attached and scans it for
/// playlist URLs.
#[derive(Debug, Clone)]
pub struct DirectFetchStrategy {
    scanner: CandidateScanner,
    page_timeout: Duration,
    probe_timeout: Duration,
    timeout: Duration,
}

impl DirectFetchStrategy {
    pub fn new(config: &DirectSection) -> Self {
        Self {
            scanner: CandidateScanner::new(),
            page_timeout: Duration::from_secs(config.page_timeout_seconds),
            probe_timeout: Duration::from_secs(config.probe_timeout_seconds),
            timeout: Duration::from_secs(config.strategy_timeout_seconds),
        }
    }
}

#[async_trait]
impl ExtractionStrategy for DirectFetchStrategy {
    fn name(&self) -> &'static str {
        "direct_fetch"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn attempt(&self, ctx: &ExtractionContext) -> Result<StrategyOutcome, StrategyError> {
        let body = ctx
            .client
            .get(ctx.source.clone())
            .timeout(self.page_timeout)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let candidates = rank_candidates(self.scanner.scan(&body));
        debug!(source = %ctx.source, candidates = candidates.len(), "scanned source page");
        let Some(top) = candidates.first() else {
            return Ok(StrategyOutcome::Nothing(
                "page contains no .m3u8 candidates".into(),
            ));
        };
        let status = probe(&ctx.client, top, self.probe_timeout).await?;
        if status.is_success() {
            Ok(StrategyOutcome::Found(top.clone()))
        } else {
            Ok(StrategyOutcome::Nothing(format!(
                "top candidate {top} answered {status} ({} candidates found)",
                candidates.len()
            )))
        }
    }
}
