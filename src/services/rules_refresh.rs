//! Rules refresh service
//!
//! Re-fetches the rules document on a fixed interval and swaps the compiled
//! rule set in one step. A failed fetch or parse keeps the previous set.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{error, info, instrument, warn};

use crate::context::ProxyContext;
use crate::error::Result;
use crate::rules::{RuleKind, RuleSet};
use crate::services::fetch::DocumentSource;

pub struct RulesRefreshService {
    source: Arc<dyn DocumentSource>,
    ctx: Arc<ProxyContext>,
    interval: Duration,
}

impl RulesRefreshService {
    pub fn new(source: Arc<dyn DocumentSource>, ctx: Arc<ProxyContext>, interval: Duration) -> Self {
        Self {
            source,
            ctx,
            interval,
        }
    }

    /// Fetch, compile and install the rules document once
    ///
    /// Returns the number of compiled rules now active.
    pub async fn refresh(&self) -> Result<usize> {
        let body = self.source.fetch().await?;
        let rules = RuleSet::from_json(&body)?;

        let count = rules.rule_count();
        info!(
            rules = count,
            rewrite_url = rules.count(RuleKind::RewriteUrl),
            redirect_url = rules.count(RuleKind::RedirectUrl),
            rewrite_html = rules.count(RuleKind::RewriteHtml),
            rewrite_js = rules.count(RuleKind::RewriteJs),
            fast_redirect_url = rules.count(RuleKind::FastRedirectUrl),
            local = rules.local_passthrough(),
            "Rules loaded"
        );
        self.ctx.set_rules(rules);
        Ok(count)
    }

    /// Periodic refresh until the exit signal fires
    #[instrument(skip(self), fields(source = %self.source.location()))]
    pub async fn run(&self) {
        info!(
            "Starting rules refresh service (every {}s)",
            self.interval.as_secs()
        );

        let mut ticker = interval(self.interval);
        ticker.tick().await; // Skip immediate tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!(error = %e, "Rules refresh failed, keeping previous rules");
                    }
                }
                _ = self.ctx.exit().wait() => {
                    info!("Rules refresh service shutting down");
                    break;
                }
            }
        }
    }

    /// Initial load; failure leaves the empty rule set in place
    pub async fn load_initial(&self) {
        if let Err(e) = self.refresh().await {
            error!(error = %e, "Initial rules load failed, running without rules");
        }
    }
}
