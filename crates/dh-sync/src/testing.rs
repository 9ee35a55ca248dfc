//! Transport fakes and payload builders shared by the worker tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use dh_storage::{FetchError, FetchedResponse, Transport};
use reqwest::StatusCode;
use serde_json::{json, Value as JsonValue};

pub const REPLAY_BYTES: &[u8] = b"BZh91AY&SY\x00replay";
pub const LATEST_SEQ: i64 = 3_912_874_001;

pub fn json_ok(body: JsonValue) -> FetchedResponse {
    FetchedResponse {
        status: StatusCode::OK,
        final_url: "http://upstream.test/".into(),
        body: serde_json::to_vec(&body).unwrap(),
    }
}

pub fn status_only(status: StatusCode) -> Result<FetchedResponse, FetchError> {
    Ok(FetchedResponse {
        status,
        final_url: "http://upstream.test/".into(),
        body: Vec::new(),
    })
}

pub fn feed_entry(match_id: i64) -> JsonValue {
    json!({
        "match_id": match_id,
        "match_seq_num": match_id + 10_000,
        "lobby_type": 7,
        "human_players": 10,
        "game_mode": 22,
        "players": (0..10).map(|_| json!({"leaver_status": 0})).collect::<Vec<_>>(),
    })
}

pub fn detail_json(match_id: i64, skill: JsonValue) -> JsonValue {
    let players: Vec<JsonValue> = (0..10)
        .map(|i| {
            let slot = if i < 5 { i } else { 128 + (i - 5) };
            json!({"hero_id": i + 1, "player_slot": slot})
        })
        .collect();
    json!({
        "match_id": match_id,
        "dire_score": 21,
        "radiant_score": 40,
        "duration": 2_410,
        "radiant_win": true,
        "start_time": 1_535_000_000,
        "region": 3,
        "skill": skill,
        "game_mode": 22,
        "lobby_type": 7,
        "human_players": 10,
        "players": players,
    })
}

pub fn with_replay(mut detail: JsonValue, url: &str) -> JsonValue {
    detail["replay_salt"] = json!(1_029_384_756);
    detail["replay_url"] = json!(url);
    detail["throw"] = json!(0);
    detail["loss"] = json!(0);
    detail
}

type Call = (String, Vec<(String, String)>);

fn record_call(calls: &Mutex<Vec<Call>>, url: &str, query: &[(&str, String)]) {
    calls.lock().unwrap().push((
        url.to_string(),
        query.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
    ));
}

/// Answers requests from a fixed script in order; 503 once the script runs out.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<FetchedResponse, FetchError>>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Result<FetchedResponse, FetchError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn urls(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(url, _)| url.clone()).collect()
    }

    pub fn queries(&self) -> Vec<Vec<(String, String)>> {
        self.calls.lock().unwrap().iter().map(|(_, q)| q.clone()).collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        record_call(&self.calls, url, query);
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| status_only(StatusCode::SERVICE_UNAVAILABLE))
    }
}

/// Plays every upstream at once, routing on the URL. Feed batches are served in
/// order, then the feed reports no new matches. Even match ids carry a replay.
pub struct RoutedTransport {
    batches: Mutex<VecDeque<Vec<i64>>>,
    feed_starts: Mutex<Vec<i64>>,
}

impl RoutedTransport {
    pub fn new(batches: Vec<Vec<i64>>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
            feed_starts: Mutex::default(),
        }
    }

    pub fn feed_starts(&self) -> Vec<i64> {
        self.feed_starts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for RoutedTransport {
    async fn get(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        if url.contains("GetMatchHistoryBySequenceNum") {
            if let Some((_, start)) = query.iter().find(|(k, _)| *k == "start_at_match_seq_num") {
                self.feed_starts.lock().unwrap().push(start.parse().unwrap());
            }
            let ids = self.batches.lock().unwrap().pop_front().unwrap_or_default();
            let matches: Vec<JsonValue> = ids.into_iter().map(feed_entry).collect();
            return Ok(json_ok(json!({"result": {"matches": matches}})));
        }
        if url.contains("GetMatchHistory/") {
            return Ok(json_ok(json!({"result": {"matches": [{"match_seq_num": LATEST_SEQ}]}})));
        }
        if url.ends_with(".dem.bz2") {
            return Ok(FetchedResponse {
                status: StatusCode::OK,
                final_url: url.to_string(),
                body: REPLAY_BYTES.to_vec(),
            });
        }
        if let Some(id) = url.rsplit_once("/matches/").and_then(|(_, id)| id.parse::<i64>().ok()) {
            let mut detail = detail_json(id, json!(3));
            if id % 2 == 0 {
                detail = with_replay(detail, &format!("http://replay.test/570/{id}_9.dem.bz2"));
            }
            return Ok(json_ok(detail));
        }
        status_only(StatusCode::NOT_FOUND)
    }
}
