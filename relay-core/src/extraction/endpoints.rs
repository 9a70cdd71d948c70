use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::config::EndpointsSection;

use super::{ExtractionContext, ExtractionStrategy, StrategyError, StrategyOutcome};

const API_PATH: &str = r"/api/\w+";

/// Records which internal API paths the platform entry point references.
/// Diagnostic only; it never resolves a URL.
#[derive(Debug, Clone)]
pub struct EndpointProbeStrategy {
    entry_point: String,
    api_path: Regex,
    timeout: Duration,
}

impl EndpointProbeStrategy {
    pub fn new(config: &EndpointsSection) -> Self {
        Self {
            entry_point: config.entry_point.clone(),
            api_path: Regex::new(API_PATH).expect("valid regex"),
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }
}

#[async_trait]
impl ExtractionStrategy for EndpointProbeStrategy {
    fn name(&self) -> &'static str {
        "endpoint_probe"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn attempt(&self, ctx: &ExtractionContext) -> Result<StrategyOutcome, StrategyError> {
        let body = ctx
            .client
            .get(&self.entry_point)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let paths: BTreeSet<&str> = self
            .api_path
            .find_iter(&body)
            .map(|hit| hit.as_str())
            .collect();
        debug!(entry_point = %self.entry_point, ?paths, "endpoint probe finished");
        Ok(StrategyOutcome::Nothing(format!(
            "{} references {} api paths",
            self.entry_point,
            paths.len()
        )))
    }
}
