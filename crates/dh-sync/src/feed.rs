use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dh_adapters::{parse_feed_batch, parse_latest_seq, FeedApi, FEED_BATCH_SIZE};
use dh_core::{MatchIdToken, RequestOutcome};
use dh_storage::RateLimiter;
use tracing::{debug, error, info, warn};

use crate::gate::{Heartbeat, ShutdownSignal};
use crate::queue::QueueSender;
use crate::{contained_loop, fatal_for, Attempt, Flow, HarvestError, HarvestStats};

#[derive(Debug, Clone, Copy)]
pub struct PollerSettings {
    pub max_retry: u32,
    pub retry_enabled: bool,
    pub caught_up_wait: Duration,
    pub long_cooldown: Duration,
    pub heartbeat: Duration,
}

/// Asks the history endpoint for the most recent match and returns its sequence number.
pub async fn bootstrap_seq(
    api: &FeedApi,
    limiter: &RateLimiter,
    attempts: u32,
    signal: &ShutdownSignal,
) -> Result<i64, HarvestError> {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        {
            let mut permit = limiter.acquire_and_pace().await;
            match api.request_latest().await {
                Ok(resp) if resp.outcome() == RequestOutcome::Success => {
                    match parse_latest_seq(&resp) {
                        Ok(seq) => {
                            permit.record_outcome(RequestOutcome::Success);
                            info!(seq, "found the starting sequence number");
                            return Ok(seq);
                        }
                        Err(err) => {
                            permit.record_outcome(RequestOutcome::Invalid);
                            warn!(attempt, error = %err, "history response unusable");
                        }
                    }
                }
                Ok(resp) => {
                    permit.record_outcome(resp.outcome());
                    warn!(attempt, status = resp.status.as_u16(), "history request failed");
                }
                Err(err) => {
                    permit.record_outcome(RequestOutcome::Unavailable);
                    warn!(attempt, error = %err, "history request failed");
                }
            }
        }
        if attempt < attempts && !limiter.penalty_sleep(signal.wait()).await {
            break;
        }
    }
    Err(HarvestError::Bootstrap(format!(
        "no sequence number from {} after {attempts} attempts",
        limiter.endpoint()
    )))
}

/// Walks the sequence feed forward and queues ids of matches worth enriching.
pub struct MatchFeedPoller {
    api: FeedApi,
    limiter: Arc<RateLimiter>,
    queue: QueueSender<MatchIdToken>,
    stats: Arc<HarvestStats>,
    settings: PollerSettings,
    cursor: AtomicI64,
    heartbeat: Heartbeat,
}

impl MatchFeedPoller {
    pub fn new(
        api: FeedApi,
        limiter: Arc<RateLimiter>,
        queue: QueueSender<MatchIdToken>,
        stats: Arc<HarvestStats>,
        settings: PollerSettings,
        start_seq: i64,
    ) -> Self {
        Self {
            api,
            limiter,
            queue,
            stats,
            heartbeat: Heartbeat::new(settings.heartbeat),
            settings,
            cursor: AtomicI64::new(start_seq),
        }
    }

    /// Next sequence number to request. Never decreases.
    pub fn cursor(&self) -> i64 {
        self.cursor.load(Ordering::SeqCst)
    }

    pub async fn run(&self, signal: ShutdownSignal) -> Result<(), HarvestError> {
        let signal = &signal;
        contained_loop("feed", signal, self.settings.long_cooldown, move || {
            self.poll_cycle(signal)
        })
        .await
    }

    /// One cycle: request batches until one succeeds, the retry budget runs out, or shutdown.
    async fn poll_cycle(&self, signal: &ShutdownSignal) -> anyhow::Result<Flow> {
        if self.heartbeat.due() {
            info!(
                cursor = self.cursor(),
                queue = self.queue.name(),
                queued = self.queue.depth(),
                "feed poller alive"
            );
        }

        let mut failures = 0u32;
        loop {
            if signal.is_set() {
                return Ok(Flow::Stop);
            }
            let seq_from = self.cursor();

            let mut permit = self.limiter.acquire_and_pace().await;
            let response = self.api.request_batch(seq_from, FEED_BATCH_SIZE).await;
            let attempt = Attempt::from_result(response)?;
            let outcome = match &attempt {
                Attempt::Answered(resp) if resp.outcome() == RequestOutcome::Success => {
                    match parse_feed_batch(resp) {
                        Ok(batch) if batch.returned == 0 => {
                            drop(permit);
                            debug!(seq_from, "caught up with the feed");
                            let slept = signal.sleep(self.settings.caught_up_wait).await;
                            return Ok(if slept { Flow::Continue } else { Flow::Stop });
                        }
                        Ok(batch) => {
                            permit.record_outcome(RequestOutcome::Success);
                            drop(permit);
                            return self.forward(seq_from, batch, signal).await;
                        }
                        Err(err) => {
                            warn!(seq_from, error = %err, "feed batch unreadable");
                            RequestOutcome::Invalid
                        }
                    }
                }
                other => other.outcome(),
            };
            permit.record_outcome(outcome);
            let wait = permit.rate_limit_wait();
            drop(permit);

            failures += 1;
            warn!(
                endpoint = self.limiter.endpoint(),
                seq_from,
                outcome = outcome.as_str(),
                status = attempt.status(),
                failures,
                wait_secs = wait.as_secs_f64(),
                "feed request failed"
            );
            if !self.settings.retry_enabled {
                if let Some(fatal) = fatal_for(self.limiter.endpoint(), &attempt) {
                    return Err(fatal.into());
                }
            }
            if failures >= self.settings.max_retry {
                let exhausted = HarvestError::RetriesExhausted {
                    endpoint: self.limiter.endpoint().to_string(),
                    attempts: failures,
                };
                error!(
                    error = %exhausted,
                    cooldown_secs = self.settings.long_cooldown.as_secs_f64(),
                    "feed keeps failing, cooling down"
                );
                let slept = signal.sleep(self.settings.long_cooldown).await;
                return Ok(if slept { Flow::Continue } else { Flow::Stop });
            }
            if !self.limiter.penalty_sleep(signal.wait()).await {
                return Ok(Flow::Stop);
            }
        }
    }

    async fn forward(
        &self,
        seq_from: i64,
        batch: dh_adapters::FeedBatch,
        signal: &ShutdownSignal,
    ) -> anyhow::Result<Flow> {
        let advance = batch.returned.min(FEED_BATCH_SIZE) as i64;
        let cursor = self.cursor.fetch_add(advance, Ordering::SeqCst) + advance;
        self.stats.record_rejected(batch.rejected as u64);
        debug!(
            seq_from,
            cursor,
            returned = batch.returned,
            accepted = batch.accepted.len(),
            rejected = batch.rejected,
            "feed batch screened"
        );
        for token in batch.accepted {
            if !self.queue.push(token, signal).await? {
                return Ok(Flow::Stop);
            }
            self.stats.record_discovered();
        }
        Ok(Flow::Continue)
    }
}
