//! Harvest configuration: defaults, optional YAML overlay, then environment overrides.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use dh_storage::EndpointPacing;
use serde::{Deserialize, Serialize};

pub const DEFAULT_FEED_BASE_URL: &str = "https://api.steampowered.com/IDOTA2Match_570/";
pub const DEFAULT_DETAIL_BASE_URL: &str = "https://api.opendota.com/api/";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EndpointTiming {
    pub min_interval_secs: f64,
    pub rate_limit_wait_base_secs: f64,
    pub wait_increment_secs: f64,
}

impl EndpointTiming {
    pub fn pacing(&self) -> EndpointPacing {
        EndpointPacing {
            min_interval: secs(self.min_interval_secs),
            rate_limit_wait_base: secs(self.rate_limit_wait_base_secs),
            wait_increment: secs(self.wait_increment_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReplayTiming {
    /// Minimum spacing between replay requests.
    pub spacing_secs: f64,
    pub penalty_base_secs: f64,
    pub penalty_step_secs: f64,
    pub tries: u32,
}

impl ReplayTiming {
    pub fn pacing(&self) -> EndpointPacing {
        EndpointPacing {
            min_interval: secs(self.spacing_secs),
            rate_limit_wait_base: secs(self.penalty_base_secs),
            wait_increment: secs(self.penalty_step_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub api_key: String,
    pub feed_base_url: String,
    pub detail_base_url: String,
    pub database_path: PathBuf,
    pub mem_only: bool,
    pub work_in_memory: bool,
    /// Unset disables replay downloads.
    pub replay_dir: Option<PathBuf>,
    pub fetcher_workers: usize,
    pub max_retry: u32,
    pub retry_enabled: bool,
    /// Feed cursor to resume from instead of asking upstream.
    pub start_seq: Option<i64>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub matches_queue_capacity: usize,
    pub match_info_queue_capacity: usize,
    pub replay_queue_capacity: usize,
    pub feed: EndpointTiming,
    pub detail: EndpointTiming,
    pub replay: ReplayTiming,
    pub caught_up_wait_secs: f64,
    pub not_indexed_wait_secs: f64,
    pub long_cooldown_secs: f64,
    pub queue_liveness_secs: f64,
    pub heartbeat_secs: f64,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            feed_base_url: DEFAULT_FEED_BASE_URL.to_string(),
            detail_base_url: DEFAULT_DETAIL_BASE_URL.to_string(),
            database_path: PathBuf::from("database"),
            mem_only: false,
            work_in_memory: false,
            replay_dir: None,
            fetcher_workers: 2,
            max_retry: 5,
            retry_enabled: true,
            start_seq: None,
            user_agent: "dh-harvester/0.1".to_string(),
            http_timeout_secs: 20,
            matches_queue_capacity: 200,
            match_info_queue_capacity: 200,
            replay_queue_capacity: 1_000,
            feed: EndpointTiming {
                min_interval_secs: 5.0,
                rate_limit_wait_base_secs: 30.0,
                wait_increment_secs: 10.0,
            },
            detail: EndpointTiming {
                min_interval_secs: 0.35,
                rate_limit_wait_base_secs: 30.0,
                wait_increment_secs: 10.0,
            },
            replay: ReplayTiming {
                spacing_secs: 10.0,
                penalty_base_secs: 30.0,
                penalty_step_secs: 10.0,
                tries: 5,
            },
            caught_up_wait_secs: 15.0,
            not_indexed_wait_secs: 60.0,
            long_cooldown_secs: 1_800.0,
            queue_liveness_secs: 600.0,
            heartbeat_secs: 3_600.0,
        }
    }
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Reads the YAML file (if any), then lets environment variables win.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("DH_CONFIG").ok().map(PathBuf::from));
        let mut config = match path {
            Some(path) => Self::from_yaml_file(&path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("decoding harvest config yaml")
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("DH_API_KEY") {
            self.api_key = v;
        }
        if let Ok(v) = std::env::var("DH_FEED_BASE_URL") {
            self.feed_base_url = v;
        }
        if let Ok(v) = std::env::var("DH_DETAIL_BASE_URL") {
            self.detail_base_url = v;
        }
        if let Ok(v) = std::env::var("DH_DATABASE_PATH") {
            self.database_path = PathBuf::from(v);
        }
        if let Some(v) = env_flag("DH_MEM_ONLY") {
            self.mem_only = v;
        }
        if let Some(v) = env_flag("DH_WORK_IN_MEMORY") {
            self.work_in_memory = v;
        }
        if let Ok(v) = std::env::var("DH_REPLAY_DIR") {
            self.replay_dir = (!v.trim().is_empty()).then(|| PathBuf::from(v));
        }
        if let Some(v) = env_parse("DH_FETCHER_WORKERS") {
            self.fetcher_workers = v;
        }
        if let Some(v) = env_parse("DH_MAX_RETRY") {
            self.max_retry = v;
        }
        if let Some(v) = env_flag("DH_RETRY_ENABLED") {
            self.retry_enabled = v;
        }
        if let Some(v) = env_parse("DH_START_SEQ") {
            self.start_seq = Some(v);
        }
        if let Ok(v) = std::env::var("DH_USER_AGENT") {
            self.user_agent = v;
        }
        if let Some(v) = env_parse("DH_HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = v;
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn caught_up_wait(&self) -> Duration {
        secs(self.caught_up_wait_secs)
    }

    pub fn not_indexed_wait(&self) -> Duration {
        secs(self.not_indexed_wait_secs)
    }

    pub fn long_cooldown(&self) -> Duration {
        secs(self.long_cooldown_secs)
    }

    pub fn queue_liveness(&self) -> Duration {
        secs(self.queue_liveness_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        secs(self.heartbeat_secs)
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::ZERO)
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_upstream_etiquette() {
        let config = HarvestConfig::default();
        assert_eq!(config.feed.pacing().min_interval, Duration::from_secs(5));
        assert_eq!(config.detail.pacing().min_interval, Duration::from_millis(350));
        assert!(config.not_indexed_wait() > config.detail.pacing().rate_limit_wait_base);
        assert!(config.matches_queue_capacity > dh_adapters::FEED_BATCH_SIZE);
        assert_eq!(config.replay.tries, 5);
        assert!(config.retry_enabled);
    }

    #[test]
    fn yaml_overlays_only_given_keys() {
        let config = HarvestConfig::from_yaml_str(
            r#"
fetcher_workers: 6
replay_dir: /var/lib/dh
detail:
  min_interval_secs: 1.0
  rate_limit_wait_base_secs: 45
  wait_increment_secs: 5
"#,
        )
        .expect("yaml");
        assert_eq!(config.fetcher_workers, 6);
        assert_eq!(config.replay_dir, Some(PathBuf::from("/var/lib/dh")));
        assert_eq!(config.detail.pacing().rate_limit_wait_base, Duration::from_secs(45));
        assert_eq!(config.feed, HarvestConfig::default().feed);
        assert_eq!(config.max_retry, 5);
    }

    #[test]
    fn negative_durations_clamp_to_zero() {
        assert_eq!(secs(-3.0), Duration::ZERO);
        assert_eq!(secs(f64::NAN), Duration::ZERO);
        assert_eq!(secs(0.25), Duration::from_millis(250));
    }
}
