use std::sync::Arc;
use std::time::Duration;

use dh_adapters::{parse_match_detail, DetailApi};
use dh_core::{validate, MatchIdToken, RequestOutcome, ValidMatch};
use dh_storage::RateLimiter;
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use crate::gate::{Heartbeat, ShutdownSignal};
use crate::queue::{QueueReceiver, QueueSender};
use crate::{contained_loop, fatal_for, Attempt, Flow, HarvestError, HarvestStats};

#[derive(Debug, Clone, Copy)]
pub struct FetcherSettings {
    pub max_retry: u32,
    pub retry_enabled: bool,
    /// Fixed wait after a 404; the detail service may not have indexed the match yet.
    pub not_indexed_wait: Duration,
    pub long_cooldown: Duration,
    pub heartbeat: Duration,
}

enum Enriched {
    Record(JsonValue),
    Unreadable,
    Exhausted,
    Interrupted,
}

/// One member of the enrichment pool. All members share the detail endpoint's limiter.
pub struct MatchDetailFetcher {
    name: String,
    api: DetailApi,
    limiter: Arc<RateLimiter>,
    input: QueueReceiver<MatchIdToken>,
    output: QueueSender<ValidMatch>,
    stats: Arc<HarvestStats>,
    settings: FetcherSettings,
    heartbeat: Heartbeat,
}

impl MatchDetailFetcher {
    pub fn new(
        name: impl Into<String>,
        api: DetailApi,
        limiter: Arc<RateLimiter>,
        input: QueueReceiver<MatchIdToken>,
        output: QueueSender<ValidMatch>,
        stats: Arc<HarvestStats>,
        settings: FetcherSettings,
    ) -> Self {
        Self {
            name: name.into(),
            api,
            limiter,
            input,
            output,
            stats,
            heartbeat: Heartbeat::new(settings.heartbeat),
            settings,
        }
    }

    pub async fn run(&self, signal: ShutdownSignal) -> Result<(), HarvestError> {
        let signal = &signal;
        contained_loop(&self.name, signal, self.settings.long_cooldown, move || {
            self.fetch_next(signal)
        })
        .await
    }

    async fn fetch_next(&self, signal: &ShutdownSignal) -> anyhow::Result<Flow> {
        if self.heartbeat.due() {
            info!(
                worker = %self.name,
                queue = self.input.name(),
                queued = self.input.depth(),
                "detail fetcher alive"
            );
        }
        let Some(token) = self.input.pop(signal).await? else {
            return Ok(Flow::Stop);
        };

        let data = match self.enrich(token, signal).await? {
            Enriched::Record(data) => data,
            Enriched::Interrupted => return Ok(Flow::Stop),
            Enriched::Unreadable => {
                self.stats.record_dropped();
                return Ok(Flow::Continue);
            }
            Enriched::Exhausted => {
                self.stats.record_exhausted();
                let exhausted = HarvestError::RetriesExhausted {
                    endpoint: self.limiter.endpoint().to_string(),
                    attempts: self.settings.max_retry.max(1),
                };
                warn!(
                    worker = %self.name,
                    match_id = token.get(),
                    error = %exhausted,
                    "giving up on match"
                );
                return Ok(Flow::Continue);
            }
        };

        match parse_match_detail(&data).and_then(validate) {
            Ok(valid) => {
                if !self.output.push(valid, signal).await? {
                    return Ok(Flow::Stop);
                }
            }
            Err(reason) => {
                self.stats.record_dropped();
                debug!(worker = %self.name, match_id = token.get(), %reason, "match dropped");
            }
        }
        Ok(Flow::Continue)
    }

    /// Requests the detail record with bounded retries. 404s wait a fixed cooldown
    /// without touching the shared penalty.
    async fn enrich(
        &self,
        token: MatchIdToken,
        signal: &ShutdownSignal,
    ) -> anyhow::Result<Enriched> {
        let attempts = self.settings.max_retry.max(1);
        for attempt_no in 1..=attempts {
            if signal.is_set() {
                return Ok(Enriched::Interrupted);
            }
            let mut permit = self.limiter.acquire_and_pace().await;
            let attempt = Attempt::from_result(self.api.request_match(token).await)?;

            let fixed_wait = match (attempt.outcome(), &attempt) {
                (RequestOutcome::Success, Attempt::Answered(resp)) => {
                    permit.record_outcome(RequestOutcome::Success);
                    drop(permit);
                    return Ok(match resp.json::<JsonValue>() {
                        Ok(data) => Enriched::Record(data),
                        Err(err) => {
                            warn!(
                                worker = %self.name,
                                match_id = token.get(),
                                error = %err,
                                "detail body unreadable"
                            );
                            Enriched::Unreadable
                        }
                    });
                }
                (RequestOutcome::NotFound, _) => {
                    drop(permit);
                    warn!(
                        worker = %self.name,
                        match_id = token.get(),
                        attempt = attempt_no,
                        "match not indexed yet"
                    );
                    Some(self.settings.not_indexed_wait)
                }
                (outcome, _) => {
                    permit.record_outcome(outcome);
                    let wait = permit.rate_limit_wait();
                    drop(permit);
                    if outcome == RequestOutcome::RateLimited {
                        warn!(
                            worker = %self.name,
                            match_id = token.get(),
                            wait_secs = wait.as_secs_f64(),
                            "detail endpoint rate limited"
                        );
                    } else {
                        error!(
                            worker = %self.name,
                            match_id = token.get(),
                            outcome = outcome.as_str(),
                            status = attempt.status(),
                            "detail request failed"
                        );
                        if !self.settings.retry_enabled {
                            if let Some(fatal) = fatal_for(self.limiter.endpoint(), &attempt) {
                                return Err(fatal.into());
                            }
                        }
                    }
                    None
                }
            };
            if attempt_no < attempts {
                let resumed = match fixed_wait {
                    Some(wait) => signal.sleep(wait).await,
                    None => self.limiter.penalty_sleep(signal.wait()).await,
                };
                if !resumed {
                    return Ok(Enriched::Interrupted);
                }
            }
        }
        Ok(Enriched::Exhausted)
    }
}
