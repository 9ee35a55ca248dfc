use std::sync::Arc;
use std::time::Duration;

use dh_core::ValidMatch;
use dh_storage::MatchStore;
use tracing::{debug, info, warn};

use crate::gate::ShutdownSignal;
use crate::queue::{QueueReceiver, QueueSender};
use crate::replay::ReplayJob;
use crate::{contained_loop, Flow, HarvestError, HarvestStats};

/// A progress line is logged every this many commits.
pub const PROGRESS_EVERY: u64 = 100;

/// Single consumer of validated matches: persists them and queues replays.
pub struct CommitSink {
    store: Arc<MatchStore>,
    input: QueueReceiver<ValidMatch>,
    replays: Option<QueueSender<ReplayJob>>,
    stats: Arc<HarvestStats>,
    long_cooldown: Duration,
}

impl CommitSink {
    pub fn new(
        store: Arc<MatchStore>,
        input: QueueReceiver<ValidMatch>,
        replays: Option<QueueSender<ReplayJob>>,
        stats: Arc<HarvestStats>,
        long_cooldown: Duration,
    ) -> Self {
        Self {
            store,
            input,
            replays,
            stats,
            long_cooldown,
        }
    }

    pub async fn run(&self, signal: ShutdownSignal) -> Result<(), HarvestError> {
        let signal = &signal;
        contained_loop("sink", signal, self.long_cooldown, move || self.commit_next(signal)).await
    }

    async fn commit_next(&self, signal: &ShutdownSignal) -> anyhow::Result<Flow> {
        let Some(valid) = self.input.pop(signal).await? else {
            return Ok(Flow::Stop);
        };
        let record = valid.into_record();

        if !self.store.commit(&record).await.map_err(HarvestError::from)? {
            self.stats.record_dropped();
            debug!(match_id = record.match_id, "store refused match");
            return Ok(Flow::Continue);
        }

        let committed = self.stats.record_committed();
        let started = record
            .started_at()
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| record.match_time.to_string());
        debug!(
            match_id = record.match_id,
            %started,
            radiant_won = record.radiant_won(),
            "match committed"
        );
        if committed % PROGRESS_EVERY == 0 {
            let snapshot = self.stats.snapshot();
            info!(
                committed,
                seen = snapshot.seen(),
                kept_pct = snapshot.kept_ratio() * 100.0,
                latest_start = %started,
                "harvest progress"
            );
        }

        if let (Some(replays), Some(url)) = (&self.replays, record.replay_url()) {
            let job = ReplayJob {
                match_id: record.match_id,
                url: url.to_string(),
            };
            if let Err(err) = replays.offer(job) {
                warn!(match_id = record.match_id, error = %err, "replay not queued");
            }
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::WorkerGate;
    use crate::queue::bounded;
    use crate::testing::{detail_json, with_replay};
    use dh_adapters::parse_match_detail;
    use dh_core::validate;
    use serde_json::json;
    use tempfile::tempdir;

    fn valid(match_id: i64, replay: bool) -> ValidMatch {
        let mut data = detail_json(match_id, json!(1));
        if replay {
            data = with_replay(data, &format!("http://replay.test/570/{match_id}_5.dem.bz2"));
        }
        validate(parse_match_detail(&data).expect("parse")).expect("valid")
    }

    #[tokio::test]
    async fn commits_and_forwards_replay_urls() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(
            MatchStore::open(dir.path().join("database"), true)
                .await
                .expect("open store"),
        );
        let (tx, rx) = bounded("match_info_queue", 4, Duration::from_secs(1));
        let (replay_tx, replay_rx) = bounded("replay_queue", 4, Duration::from_secs(1));
        let stats = Arc::new(HarvestStats::default());
        let sink = CommitSink::new(
            store.clone(),
            rx,
            Some(replay_tx),
            stats.clone(),
            Duration::from_millis(5),
        );
        let gate = WorkerGate::new();
        let signal = gate.signal();

        tx.push(valid(10, true), &signal).await.expect("push");
        tx.push(valid(11, false), &signal).await.expect("push");
        assert_eq!(sink.commit_next(&signal).await.expect("commit"), Flow::Continue);
        assert_eq!(sink.commit_next(&signal).await.expect("commit"), Flow::Continue);

        assert_eq!(store.get_total_examples().await.expect("count"), 2);
        assert_eq!(stats.snapshot().committed, 2);
        assert_eq!(
            replay_rx.pop(&signal).await.expect("pop"),
            Some(ReplayJob {
                match_id: 10,
                url: "http://replay.test/570/10_5.dem.bz2".into(),
            })
        );
        assert_eq!(replay_rx.depth(), Some(0));
    }

    #[tokio::test]
    async fn stops_when_producers_are_gone() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(
            MatchStore::open(dir.path().join("database"), true)
                .await
                .expect("open store"),
        );
        let (tx, rx) = bounded::<ValidMatch>("match_info_queue", 4, Duration::from_secs(1));
        let stats = Arc::new(HarvestStats::default());
        let sink = CommitSink::new(store, rx, None, stats, Duration::ZERO);
        drop(tx);
        let gate = WorkerGate::new();
        sink.run(gate.signal()).await.expect("clean exit");
    }
}
