use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dh_adapters::{DetailApi, FeedApi, FeedApiConfig};
use dh_core::RequestOutcome;
use dh_storage::{
    FetchError, FetchedResponse, MatchStore, RateLimiter, ReplayArchive, StoreError, Transport,
};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

mod config;
mod feed;
mod fetcher;
mod gate;
mod queue;
mod replay;
mod sink;
#[cfg(test)]
mod testing;

pub use config::{
    EndpointTiming, HarvestConfig, ReplayTiming, DEFAULT_DETAIL_BASE_URL, DEFAULT_FEED_BASE_URL,
};
pub use feed::{bootstrap_seq, MatchFeedPoller, PollerSettings};
pub use fetcher::{FetcherSettings, MatchDetailFetcher};
pub use gate::{Heartbeat, ShutdownSignal, WorkerGate, WorkerSlot};
pub use queue::{bounded, QueueReceiver, QueueSender};
pub use replay::{ReplayDownloadWorker, ReplayJob, ReplaySettings};
pub use sink::{CommitSink, PROGRESS_EVERY};

pub const CRATE_NAME: &str = "dh-sync";

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("{endpoint} unavailable ({})", describe_status(.status))]
    UpstreamUnavailable { endpoint: String, status: Option<u16> },
    #[error("{endpoint} rejected the credentials ({})", describe_status(.status))]
    AuthFailure { endpoint: String, status: Option<u16> },
    #[error("{endpoint} answered unexpectedly ({})", describe_status(.status))]
    UnexpectedStatus { endpoint: String, status: Option<u16> },
    #[error("{endpoint} still failing after {attempts} attempts")]
    RetriesExhausted { endpoint: String, attempts: u32 },
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error("queue {0} closed")]
    QueueClosed(&'static str),
}

fn describe_status(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!("status {code}"),
        None => "no response".to_string(),
    }
}

/// Error to stop on when retries are disabled; `None` for outcomes that never escalate.
pub(crate) fn fatal_for(endpoint: &str, attempt: &Attempt) -> Option<HarvestError> {
    let endpoint = endpoint.to_string();
    let status = attempt.status();
    match attempt.outcome() {
        RequestOutcome::Unavailable => Some(HarvestError::UpstreamUnavailable { endpoint, status }),
        RequestOutcome::Auth => Some(HarvestError::AuthFailure { endpoint, status }),
        RequestOutcome::Invalid | RequestOutcome::NotFound => {
            Some(HarvestError::UnexpectedStatus { endpoint, status })
        }
        RequestOutcome::Success | RequestOutcome::RateLimited => None,
    }
}

/// One request attempt after transport errors have been classified.
#[derive(Debug)]
pub(crate) enum Attempt {
    Answered(FetchedResponse),
    NoResponse(RequestOutcome),
}

impl Attempt {
    /// Timeouts and connection failures become `NoResponse`; anything else escalates.
    pub(crate) fn from_result(result: Result<FetchedResponse, FetchError>) -> anyhow::Result<Self> {
        match result {
            Ok(resp) => Ok(Attempt::Answered(resp)),
            Err(err) => match err.retry_outcome() {
                Some(outcome) => {
                    warn!(error = %err, outcome = outcome.as_str(), "request got no response");
                    Ok(Attempt::NoResponse(outcome))
                }
                None => Err(err.into()),
            },
        }
    }

    pub(crate) fn outcome(&self) -> RequestOutcome {
        match self {
            Attempt::Answered(resp) => resp.outcome(),
            Attempt::NoResponse(outcome) => *outcome,
        }
    }

    pub(crate) fn status(&self) -> Option<u16> {
        match self {
            Attempt::Answered(resp) => Some(resp.status.as_u16()),
            Attempt::NoResponse(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
}

/// Runs `step` until it stops or fails fatally. Unclassified errors are logged and
/// followed by `cooldown` before the loop resumes.
pub(crate) async fn contained_loop<F, Fut>(
    worker: &str,
    signal: &ShutdownSignal,
    cooldown: Duration,
    mut step: F,
) -> Result<(), HarvestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<Flow>>,
{
    loop {
        if signal.is_set() {
            debug!(worker, "exit requested");
            return Ok(());
        }
        match step().await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Stop) => return Ok(()),
            Err(err) => match err.downcast::<HarvestError>() {
                Ok(HarvestError::QueueClosed(queue)) => {
                    info!(worker, queue, "upstream stage gone, worker exiting");
                    return Ok(());
                }
                Ok(fatal) => {
                    error!(worker, error = %fatal, "fatal harvest error");
                    return Err(fatal);
                }
                Err(other) => {
                    error!(
                        worker,
                        error = ?other,
                        cooldown_secs = cooldown.as_secs_f64(),
                        "unexpected failure, cooling down"
                    );
                    if !signal.sleep(cooldown).await {
                        return Ok(());
                    }
                }
            },
        }
    }
}

#[derive(Debug, Default)]
pub struct HarvestStats {
    discovered: AtomicU64,
    committed: AtomicU64,
    dropped: AtomicU64,
    exhausted: AtomicU64,
    replays_written: AtomicU64,
    replays_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Ids that passed the feed screen.
    pub discovered: u64,
    pub committed: u64,
    /// Rejected by a screen, by validation, or by the store.
    pub dropped: u64,
    /// Given up after the retry budget ran out.
    pub exhausted: u64,
    pub replays_written: u64,
    pub replays_failed: u64,
}

impl StatsSnapshot {
    pub fn seen(&self) -> u64 {
        self.committed + self.dropped + self.exhausted
    }

    pub fn kept_ratio(&self) -> f64 {
        match self.seen() {
            0 => 0.0,
            seen => self.committed as f64 / seen as f64,
        }
    }
}

impl HarvestStats {
    pub fn record_discovered(&self) {
        self.discovered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.record_rejected(1);
    }

    pub fn record_exhausted(&self) {
        self.exhausted.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the running total.
    pub fn record_committed(&self) -> u64 {
        self.committed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_replay_written(&self) {
        self.replays_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replay_failed(&self) {
        self.replays_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            discovered: self.discovered.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            replays_written: self.replays_written.load(Ordering::Relaxed),
            replays_failed: self.replays_failed.load(Ordering::Relaxed),
        }
    }
}

type WorkerResult = (String, Result<(), HarvestError>);

/// Runs a worker in its own task and restarts it after `cooldown` if it panics.
/// The slot is held across restarts so shutdown still waits for it.
async fn supervise<F, Fut>(
    slot: WorkerSlot,
    cooldown: Duration,
    factory: F,
) -> Result<(), HarvestError>
where
    F: Fn(ShutdownSignal) -> Fut,
    Fut: Future<Output = Result<(), HarvestError>> + Send + 'static,
{
    loop {
        let task = tokio::spawn(factory(slot.signal().clone()));
        match task.await {
            Ok(result) => return result,
            Err(err) if err.is_panic() => {
                error!(worker = slot.name(), "worker panicked, restarting after cooldown");
                if !slot.signal().sleep(cooldown).await {
                    return Ok(());
                }
            }
            Err(err) => {
                warn!(worker = slot.name(), error = %err, "worker task cancelled");
                return Ok(());
            }
        }
    }
}

fn spawn_supervised<F, Fut>(
    tasks: &mut JoinSet<WorkerResult>,
    slot: WorkerSlot,
    cooldown: Duration,
    factory: F,
) where
    F: Fn(ShutdownSignal) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), HarvestError>> + Send + 'static,
{
    tasks.spawn(async move {
        let name = slot.name().to_string();
        let result = supervise(slot, cooldown, factory).await;
        (name, result)
    });
}

/// Wires the pipeline: feed poller, enrichment pool, commit sink and optional replay downloader.
pub struct Harvester {
    config: HarvestConfig,
    transport: Arc<dyn Transport>,
    store: Arc<MatchStore>,
    feed_api: FeedApi,
    detail_api: DetailApi,
    feed_limiter: Arc<RateLimiter>,
    detail_limiter: Arc<RateLimiter>,
    gate: WorkerGate,
    stats: Arc<HarvestStats>,
}

impl Harvester {
    pub fn new(
        config: HarvestConfig,
        transport: Arc<dyn Transport>,
        store: Arc<MatchStore>,
    ) -> Self {
        let feed_api = FeedApi::new(
            transport.clone(),
            FeedApiConfig::new(config.feed_base_url.clone(), config.api_key.clone()),
        );
        let detail_api = DetailApi::new(transport.clone(), config.detail_base_url.clone());
        Self {
            feed_limiter: Arc::new(RateLimiter::new("feed", config.feed.pacing())),
            detail_limiter: Arc::new(RateLimiter::new("detail", config.detail.pacing())),
            feed_api,
            detail_api,
            transport,
            store,
            gate: WorkerGate::new(),
            stats: Arc::new(HarvestStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    pub fn gate(&self) -> &WorkerGate {
        &self.gate
    }

    pub fn stats(&self) -> Arc<HarvestStats> {
        self.stats.clone()
    }

    /// The configured resume point, or the sequence number of the newest match upstream.
    pub async fn bootstrap(&self) -> Result<i64, HarvestError> {
        if let Some(seq) = self.config.start_seq {
            info!(seq, "resuming from configured sequence number");
            return Ok(seq);
        }
        bootstrap_seq(
            &self.feed_api,
            &self.feed_limiter,
            self.config.max_retry,
            &self.gate.signal(),
        )
        .await
    }

    pub fn start(&self, start_seq: i64) -> RunningHarvest {
        let config = &self.config;
        let cooldown = config.long_cooldown();
        let liveness = config.queue_liveness();
        let mut tasks = JoinSet::new();

        let (ids_tx, ids_rx) = bounded("matches_queue", config.matches_queue_capacity, liveness);
        let (info_tx, info_rx) =
            bounded("match_info_queue", config.match_info_queue_capacity, liveness);

        let poller = Arc::new(MatchFeedPoller::new(
            self.feed_api.clone(),
            self.feed_limiter.clone(),
            ids_tx,
            self.stats.clone(),
            PollerSettings {
                max_retry: config.max_retry,
                retry_enabled: config.retry_enabled,
                caught_up_wait: config.caught_up_wait(),
                long_cooldown: cooldown,
                heartbeat: config.heartbeat(),
            },
            start_seq,
        ));
        {
            let poller = poller.clone();
            spawn_supervised(&mut tasks, self.gate.register("feed"), cooldown, move |signal| {
                let poller = poller.clone();
                async move { poller.run(signal).await }
            });
        }

        let fetcher_settings = FetcherSettings {
            max_retry: config.max_retry,
            retry_enabled: config.retry_enabled,
            not_indexed_wait: config.not_indexed_wait(),
            long_cooldown: cooldown,
            heartbeat: config.heartbeat(),
        };
        for index in 0..config.fetcher_workers.max(1) {
            let name = format!("fetcher-{index}");
            let fetcher = Arc::new(MatchDetailFetcher::new(
                name.clone(),
                self.detail_api.clone(),
                self.detail_limiter.clone(),
                ids_rx.clone(),
                info_tx.clone(),
                self.stats.clone(),
                fetcher_settings,
            ));
            spawn_supervised(&mut tasks, self.gate.register(name), cooldown, move |signal| {
                let fetcher = fetcher.clone();
                async move { fetcher.run(signal).await }
            });
        }
        drop(ids_rx);
        drop(info_tx);

        let replay_tx = match &config.replay_dir {
            Some(dir) => {
                let (replay_tx, replay_rx) =
                    bounded("replay_queue", config.replay_queue_capacity, liveness);
                let worker = Arc::new(ReplayDownloadWorker::new(
                    self.transport.clone(),
                    ReplayArchive::new(dir),
                    RateLimiter::new("replays", config.replay.pacing()),
                    replay_rx,
                    self.stats.clone(),
                    ReplaySettings {
                        tries: config.replay.tries,
                        long_cooldown: cooldown,
                        heartbeat: config.heartbeat(),
                    },
                ));
                let slot = self.gate.register("replays");
                spawn_supervised(&mut tasks, slot, cooldown, move |signal| {
                    let worker = worker.clone();
                    async move { worker.run(signal).await }
                });
                Some(replay_tx)
            }
            None => None,
        };

        let sink = Arc::new(CommitSink::new(
            self.store.clone(),
            info_rx,
            replay_tx,
            self.stats.clone(),
            cooldown,
        ));
        spawn_supervised(&mut tasks, self.gate.register("sink"), cooldown, move |signal| {
            let sink = sink.clone();
            async move { sink.run(signal).await }
        });

        info!(
            start_seq,
            fetchers = config.fetcher_workers.max(1),
            replays = config.replay_dir.is_some(),
            "harvest started"
        );
        RunningHarvest {
            gate: self.gate.clone(),
            poller,
            stats: self.stats.clone(),
            tasks,
        }
    }
}

/// Handle on a started pipeline.
pub struct RunningHarvest {
    gate: WorkerGate,
    poller: Arc<MatchFeedPoller>,
    stats: Arc<HarvestStats>,
    tasks: JoinSet<WorkerResult>,
}

impl RunningHarvest {
    /// Next sequence number the feed would request. Runs ahead of the store while matches
    /// are still queued.
    pub fn cursor(&self) -> i64 {
        self.poller.cursor()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn active_workers(&self) -> usize {
        self.gate.active()
    }

    /// Resolves with the first fatal worker error, or `None` once every worker has returned.
    pub async fn wait_fatal(&mut self) -> Option<HarvestError> {
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => debug!(worker = %name, "worker finished"),
                Ok((name, Err(err))) => {
                    error!(worker = %name, error = %err, "worker stopped the harvest");
                    return Some(err);
                }
                Err(err) => error!(error = %err, "supervisor task failed"),
            }
        }
        None
    }

    /// Raises the exit flag, waits for every worker, and reports the first fatal error seen.
    pub async fn shutdown(mut self) -> Result<StatsSnapshot, HarvestError> {
        self.gate.request_shutdown().await;
        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            if let Ok((name, Err(err))) = joined {
                warn!(worker = %name, error = %err, "worker ended with an error");
                first_error.get_or_insert(err);
            }
        }
        let snapshot = self.stats.snapshot();
        info!(
            cursor = self.cursor(),
            committed = snapshot.committed,
            dropped = snapshot.dropped,
            exhausted = snapshot.exhausted,
            replays_written = snapshot.replays_written,
            "harvest stopped"
        );
        match first_error {
            Some(err) => Err(err),
            None => Ok(snapshot),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RoutedTransport, REPLAY_BYTES};
    use tempfile::tempdir;

    fn fast_config(dir: &std::path::Path) -> HarvestConfig {
        let quick = EndpointTiming {
            min_interval_secs: 0.0,
            rate_limit_wait_base_secs: 0.005,
            wait_increment_secs: 0.005,
        };
        HarvestConfig {
            feed_base_url: "http://feed.test/".into(),
            detail_base_url: "http://detail.test/api/".into(),
            database_path: dir.join("database"),
            replay_dir: Some(dir.to_path_buf()),
            fetcher_workers: 3,
            start_seq: Some(5_000),
            feed: quick,
            detail: quick,
            replay: ReplayTiming {
                spacing_secs: 0.0,
                penalty_base_secs: 0.005,
                penalty_step_secs: 0.005,
                tries: 2,
            },
            caught_up_wait_secs: 0.01,
            not_indexed_wait_secs: 0.005,
            long_cooldown_secs: 0.01,
            queue_liveness_secs: 1.0,
            ..HarvestConfig::default()
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition reached in time");
    }

    #[tokio::test]
    async fn pipeline_harvests_commits_and_downloads_replays() {
        let dir = tempdir().expect("tempdir");
        let config = fast_config(dir.path());
        let store = Arc::new(
            MatchStore::open(&config.database_path, true)
                .await
                .expect("open store"),
        );
        let transport = Arc::new(RoutedTransport::new(vec![vec![101, 102, 103], vec![104]]));
        let harvester = Harvester::new(config, transport.clone(), store.clone());
        assert_eq!(harvester.bootstrap().await.expect("bootstrap"), 5_000);

        let running = harvester.start(5_000);
        assert_eq!(running.active_workers(), 6);
        wait_until(|| {
            let stats = running.stats();
            stats.committed == 4 && stats.replays_written == 2
        })
        .await;
        assert_eq!(running.cursor(), 5_004);

        let snapshot = running.shutdown().await.expect("clean shutdown");
        assert_eq!(snapshot.committed, 4);
        assert_eq!(snapshot.discovered, 4);
        assert_eq!(harvester.gate().active(), 0);

        assert_eq!(store.get_total_examples().await.expect("count"), 4);
        let archive = ReplayArchive::new(dir.path());
        for match_id in [102, 104] {
            assert_eq!(
                std::fs::read(archive.replay_path(match_id)).expect("replay"),
                REPLAY_BYTES
            );
        }
        assert!(!archive.replay_path(101).exists());
        assert!(transport.feed_starts().windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn bootstrap_reads_history_when_no_start_is_configured() {
        let dir = tempdir().expect("tempdir");
        let mut config = fast_config(dir.path());
        config.start_seq = None;
        let store = Arc::new(
            MatchStore::open(&config.database_path, true)
                .await
                .expect("open store"),
        );
        let transport = Arc::new(RoutedTransport::new(Vec::new()));
        let harvester = Harvester::new(config, transport, store);
        assert_eq!(
            harvester.bootstrap().await.expect("bootstrap"),
            crate::testing::LATEST_SEQ
        );
    }

    #[test]
    fn kept_ratio_counts_every_outcome() {
        let stats = HarvestStats::default();
        assert_eq!(stats.snapshot().kept_ratio(), 0.0);
        stats.record_committed();
        stats.record_committed();
        stats.record_committed();
        stats.record_dropped();
        assert_eq!(stats.snapshot().seen(), 4);
        assert_eq!(stats.snapshot().kept_ratio(), 0.75);
    }

    #[tokio::test]
    async fn unexpected_errors_cool_down_and_resume() {
        let gate = WorkerGate::new();
        let signal = gate.signal();
        let mut calls = 0;
        let result = contained_loop("test", &signal, Duration::from_millis(1), || {
            calls += 1;
            let n = calls;
            async move {
                match n {
                    1 => Err(anyhow::anyhow!("socket exploded")),
                    2 => Ok(Flow::Continue),
                    _ => Ok(Flow::Stop),
                }
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn panicking_worker_is_restarted() {
        let gate = WorkerGate::new();
        let runs = Arc::new(AtomicU64::new(0));
        let slot = gate.register("flaky");
        let result = {
            let runs = runs.clone();
            supervise(slot, Duration::from_millis(1), move |_signal| {
                let runs = runs.clone();
                async move {
                    if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                        panic!("first run blows up");
                    }
                    Ok(())
                }
            })
            .await
        };
        assert!(result.is_ok());
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(gate.active(), 0);
    }
}
