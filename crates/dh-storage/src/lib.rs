//! Upstream HTTP transport, endpoint pacing, replay archive and the match store.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use dh_core::RequestOutcome;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

mod store;

pub use store::{DraftCursor, MatchStore, StoreError, StoreMode};

pub const CRATE_NAME: &str = "dh-storage";

#[derive(Debug, Clone)]
pub struct StoredReplay {
    pub match_id: i64,
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
}

/// Replay files live at `<replay_dir>/replays/<match_id>.dem.bz2`.
#[derive(Debug, Clone)]
pub struct ReplayArchive {
    root: PathBuf,
}

impl ReplayArchive {
    pub fn new(replay_dir: impl AsRef<Path>) -> Self {
        Self {
            root: replay_dir.as_ref().join("replays"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn replay_path(&self, match_id: i64) -> PathBuf {
        self.root.join(format!("{match_id}.dem.bz2"))
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Writes a replay through a temp file in the same directory, then renames it into place.
    pub async fn store_replay(&self, match_id: i64, bytes: &[u8]) -> anyhow::Result<StoredReplay> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating replay directory {}", self.root.display()))?;

        let path = self.replay_path(match_id);
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp replay file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp replay file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp replay file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp replay {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        Ok(StoredReplay {
            match_id,
            path,
            content_hash: Self::sha256_hex(bytes),
            byte_size: bytes.len(),
        })
    }
}

pub fn classify_status(status: StatusCode) -> RequestOutcome {
    match status {
        s if s.is_success() => RequestOutcome::Success,
        StatusCode::NOT_FOUND => RequestOutcome::NotFound,
        StatusCode::TOO_MANY_REQUESTS => RequestOutcome::RateLimited,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RequestOutcome::Auth,
        s if s.is_server_error() => RequestOutcome::Unavailable,
        _ => RequestOutcome::Invalid,
    }
}

/// Transport failures that are worth another attempt are reported as an unavailable upstream.
pub fn classify_reqwest_error(err: &reqwest::Error) -> Option<RequestOutcome> {
    if err.is_timeout() || err.is_connect() {
        Some(RequestOutcome::Unavailable)
    } else {
        None
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn outcome(&self) -> RequestOutcome {
        classify_status(self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|source| FetchError::Decode {
            url: self.final_url.clone(),
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    /// Outcome to record when the failure is retryable, `None` when it should escalate.
    pub fn retry_outcome(&self) -> Option<RequestOutcome> {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::Decode { .. } => None,
        }
    }
}

/// Single GET against an upstream. Retry policy belongs to the caller.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpFetcher {
    async fn get(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self.client.get(url).query(query).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let body = resp.bytes().await?.to_vec();
            debug!(%status, bytes = body.len(), "upstream responded");
            Ok::<_, FetchError>(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

/// Fixed pacing and penalty parameters of one upstream endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointPacing {
    pub min_interval: Duration,
    pub rate_limit_wait_base: Duration,
    pub wait_increment: Duration,
}

/// Mutable pacing state of one endpoint, shared by every worker that calls it.
#[derive(Debug, Clone)]
pub struct EndpointBackoffState {
    pacing: EndpointPacing,
    last_request: Option<Instant>,
    rate_limit_wait: Duration,
}

impl EndpointBackoffState {
    pub fn new(pacing: EndpointPacing) -> Self {
        Self {
            pacing,
            last_request: None,
            rate_limit_wait: pacing.rate_limit_wait_base,
        }
    }

    pub fn rate_limit_wait(&self) -> Duration {
        self.rate_limit_wait
    }

    /// How long a request issued at `now` must still wait to respect `min_interval`.
    pub fn pace_delay(&self, now: Instant) -> Duration {
        match self.last_request {
            Some(last) => self
                .pacing
                .min_interval
                .saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }

    pub fn mark_dispatched(&mut self, now: Instant) {
        self.last_request = Some(now);
    }

    /// Failures grow the penalty without bound; success shrinks it down to the base.
    pub fn record(&mut self, outcome: RequestOutcome) {
        if outcome.grows_backoff() {
            self.rate_limit_wait = self.rate_limit_wait.saturating_add(self.pacing.wait_increment);
        } else if outcome == RequestOutcome::Success {
            self.rate_limit_wait = self
                .rate_limit_wait
                .saturating_sub(self.pacing.wait_increment)
                .max(self.pacing.rate_limit_wait_base);
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    endpoint: String,
    state: Mutex<EndpointBackoffState>,
}

/// Exclusive right to dispatch one request to an endpoint. Hold it until the response arrives.
#[derive(Debug)]
pub struct PacedPermit<'a> {
    state: MutexGuard<'a, EndpointBackoffState>,
}

impl PacedPermit<'_> {
    pub fn record_outcome(&mut self, outcome: RequestOutcome) {
        self.state.record(outcome);
    }

    pub fn rate_limit_wait(&self) -> Duration {
        self.state.rate_limit_wait()
    }
}

impl RateLimiter {
    pub fn new(endpoint: impl Into<String>, pacing: EndpointPacing) -> Self {
        Self {
            endpoint: endpoint.into(),
            state: Mutex::new(EndpointBackoffState::new(pacing)),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Waits for the endpoint lock and for `min_interval` since the previous dispatch,
    /// then stamps the new dispatch time.
    pub async fn acquire_and_pace(&self) -> PacedPermit<'_> {
        let mut state = self.state.lock().await;
        let delay = state.pace_delay(Instant::now());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        state.mark_dispatched(Instant::now());
        PacedPermit { state }
    }

    pub async fn record_outcome(&self, outcome: RequestOutcome) {
        self.state.lock().await.record(outcome);
    }

    pub async fn rate_limit_wait(&self) -> Duration {
        self.state.lock().await.rate_limit_wait()
    }

    /// Sleeps for the current penalty without holding the endpoint lock, unless `interrupt`
    /// resolves first. Returns `false` when interrupted.
    pub async fn penalty_sleep(&self, interrupt: impl Future<Output = ()>) -> bool {
        let wait = self.rate_limit_wait().await;
        tokio::select! {
            _ = tokio::time::sleep(wait) => true,
            _ = interrupt => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pacing() -> EndpointPacing {
        EndpointPacing {
            min_interval: Duration::from_millis(40),
            rate_limit_wait_base: Duration::from_secs(30),
            wait_increment: Duration::from_secs(10),
        }
    }

    #[test]
    fn replay_hashing_is_stable() {
        let hash = ReplayArchive::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn replay_writes_land_under_replays_dir() {
        let dir = tempdir().expect("tempdir");
        let archive = ReplayArchive::new(dir.path());

        let first = archive.store_replay(4_100_000_001, b"old").await.expect("first");
        let second = archive.store_replay(4_100_000_001, b"newer").await.expect("second");

        assert_eq!(first.path, dir.path().join("replays").join("4100000001.dem.bz2"));
        assert_eq!(first.path, second.path);
        assert_eq!(second.byte_size, 5);
        assert_eq!(std::fs::read(&second.path).expect("read"), b"newer");

        let leftovers = std::fs::read_dir(archive.root())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn statuses_map_to_outcomes() {
        assert_eq!(classify_status(StatusCode::OK), RequestOutcome::Success);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RequestOutcome::NotFound);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RequestOutcome::RateLimited
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RequestOutcome::Unavailable
        );
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RequestOutcome::Unavailable
        );
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RequestOutcome::Auth);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RequestOutcome::Auth);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), RequestOutcome::Invalid);
    }

    #[test]
    fn penalty_is_floored_at_base_and_moves_in_increments() {
        let p = pacing();
        let mut state = EndpointBackoffState::new(p);
        assert_eq!(state.rate_limit_wait(), p.rate_limit_wait_base);

        state.record(RequestOutcome::Success);
        assert_eq!(state.rate_limit_wait(), p.rate_limit_wait_base);

        state.record(RequestOutcome::RateLimited);
        state.record(RequestOutcome::Unavailable);
        state.record(RequestOutcome::Auth);
        assert_eq!(state.rate_limit_wait(), Duration::from_secs(60));

        state.record(RequestOutcome::NotFound);
        assert_eq!(state.rate_limit_wait(), Duration::from_secs(60));

        for _ in 0..10 {
            state.record(RequestOutcome::Success);
            let extra = state.rate_limit_wait() - p.rate_limit_wait_base;
            assert_eq!(extra.as_secs() % p.wait_increment.as_secs(), 0);
            assert!(state.rate_limit_wait() >= p.rate_limit_wait_base);
        }
        assert_eq!(state.rate_limit_wait(), p.rate_limit_wait_base);
    }

    #[test]
    fn pace_delay_respects_min_interval() {
        let p = pacing();
        let mut state = EndpointBackoffState::new(p);
        let now = Instant::now();
        assert_eq!(state.pace_delay(now), Duration::ZERO);

        state.mark_dispatched(now);
        assert_eq!(state.pace_delay(now), p.min_interval);
        assert_eq!(
            state.pace_delay(now + Duration::from_millis(15)),
            Duration::from_millis(25)
        );
        assert_eq!(state.pace_delay(now + Duration::from_secs(1)), Duration::ZERO);
    }

    #[tokio::test]
    async fn limiter_spaces_consecutive_dispatches() {
        let limiter = RateLimiter::new("detail", pacing());

        let started = Instant::now();
        {
            let mut permit = limiter.acquire_and_pace().await;
            permit.record_outcome(RequestOutcome::RateLimited);
        }
        {
            let _permit = limiter.acquire_and_pace().await;
        }
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_eq!(limiter.rate_limit_wait().await, Duration::from_secs(40));

        limiter.record_outcome(RequestOutcome::Success).await;
        assert_eq!(limiter.rate_limit_wait().await, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn penalty_sleep_waits_out_the_penalty_unless_interrupted() {
        let limiter = RateLimiter::new(
            "replays",
            EndpointPacing {
                min_interval: Duration::ZERO,
                rate_limit_wait_base: Duration::from_millis(20),
                wait_increment: Duration::from_millis(20),
            },
        );
        let started = Instant::now();
        assert!(limiter.penalty_sleep(std::future::pending::<()>()).await);
        assert!(started.elapsed() >= Duration::from_millis(20));

        limiter.record_outcome(RequestOutcome::Unavailable).await;
        let started = Instant::now();
        assert!(!limiter.penalty_sleep(std::future::ready(())).await);
        assert!(started.elapsed() < Duration::from_millis(40));
    }
}
