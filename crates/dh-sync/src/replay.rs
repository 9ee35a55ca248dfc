use std::sync::Arc;
use std::time::Duration;

use dh_core::RequestOutcome;
use dh_storage::{RateLimiter, ReplayArchive, Transport};
use tracing::{debug, error, info, warn};

use crate::gate::{Heartbeat, ShutdownSignal};
use crate::queue::QueueReceiver;
use crate::{contained_loop, Attempt, Flow, HarvestError, HarvestStats};

/// A replay to fetch for a committed match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayJob {
    pub match_id: i64,
    pub url: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ReplaySettings {
    pub tries: u32,
    pub long_cooldown: Duration,
    pub heartbeat: Duration,
}

/// Downloads replay archives one at a time. The limiter enforces spacing between
/// requests and carries the escalating failure penalty.
pub struct ReplayDownloadWorker {
    transport: Arc<dyn Transport>,
    archive: ReplayArchive,
    limiter: RateLimiter,
    input: QueueReceiver<ReplayJob>,
    stats: Arc<HarvestStats>,
    settings: ReplaySettings,
    heartbeat: Heartbeat,
}

impl ReplayDownloadWorker {
    pub fn new(
        transport: Arc<dyn Transport>,
        archive: ReplayArchive,
        limiter: RateLimiter,
        input: QueueReceiver<ReplayJob>,
        stats: Arc<HarvestStats>,
        settings: ReplaySettings,
    ) -> Self {
        Self {
            transport,
            archive,
            limiter,
            input,
            stats,
            heartbeat: Heartbeat::new(settings.heartbeat),
            settings,
        }
    }

    pub async fn run(&self, signal: ShutdownSignal) -> Result<(), HarvestError> {
        let signal = &signal;
        contained_loop("replays", signal, self.settings.long_cooldown, move || {
            self.download_next(signal)
        })
        .await
    }

    async fn download_next(&self, signal: &ShutdownSignal) -> anyhow::Result<Flow> {
        if self.heartbeat.due() {
            info!(
                queue = self.input.name(),
                queued = self.input.depth(),
                "replay downloader alive"
            );
        }
        let Some(job) = self.input.pop(signal).await? else {
            return Ok(Flow::Stop);
        };

        let tries = self.settings.tries.max(1);
        for attempt_no in 1..=tries {
            if signal.is_set() {
                return Ok(Flow::Stop);
            }
            debug!(
                match_id = job.match_id,
                url = %job.url,
                attempt = attempt_no,
                "requesting replay"
            );
            let mut permit = self.limiter.acquire_and_pace().await;
            let attempt = Attempt::from_result(self.transport.get(&job.url, &[]).await)?;

            match (attempt.outcome(), &attempt) {
                (RequestOutcome::Success, Attempt::Answered(resp)) => {
                    permit.record_outcome(RequestOutcome::Success);
                    drop(permit);
                    let stored = self.archive.store_replay(job.match_id, &resp.body).await?;
                    self.stats.record_replay_written();
                    info!(
                        match_id = stored.match_id,
                        path = %stored.path.display(),
                        bytes = stored.byte_size,
                        sha256 = %stored.content_hash,
                        "replay saved"
                    );
                    return Ok(Flow::Continue);
                }
                (RequestOutcome::NotFound, _) => {
                    drop(permit);
                    self.stats.record_replay_failed();
                    warn!(
                        match_id = job.match_id,
                        url = %job.url,
                        "replay not found upstream, skipping"
                    );
                    return Ok(Flow::Continue);
                }
                (outcome, _) => {
                    permit.record_outcome(outcome);
                    let wait = permit.rate_limit_wait();
                    drop(permit);
                    warn!(
                        match_id = job.match_id,
                        outcome = outcome.as_str(),
                        status = attempt.status(),
                        attempt = attempt_no,
                        wait_secs = wait.as_secs_f64(),
                        "replay request failed"
                    );
                    if attempt_no < tries && !self.limiter.penalty_sleep(signal.wait()).await {
                        return Ok(Flow::Stop);
                    }
                }
            }
        }

        self.stats.record_replay_failed();
        error!(match_id = job.match_id, url = %job.url, tries, "could not get replay");
        Ok(Flow::Continue)
    }
}
