//! Clients for the two upstream APIs: the sequence-ordered match feed and the detail service.

use std::sync::Arc;

use dh_core::{
    MatchIdToken, MatchRecord, ReplayInfo, Team, ValidationFailure, ALL_PICK_GAME_MODE,
    PICKS_PER_TEAM, RANKED_LOBBY_TYPE, REQUIRED_HUMAN_PLAYERS,
};
use dh_storage::{FetchError, FetchedResponse, Transport};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "dh-adapters";

/// Matches requested per feed call.
pub const FEED_BATCH_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed upstream payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone)]
pub struct FeedApiConfig {
    pub base_url: String,
    pub key: String,
    pub format: String,
    pub language: String,
}

impl FeedApiConfig {
    pub fn new(base_url: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            key: key.into(),
            format: "json".to_string(),
            language: "en".to_string(),
        }
    }
}

/// Outcome of screening one feed page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedBatch {
    /// Entries the upstream returned, valid or not.
    pub returned: usize,
    pub accepted: Vec<MatchIdToken>,
    pub rejected: usize,
}

#[derive(Debug, Deserialize)]
struct FeedEnvelope {
    result: FeedResult,
}

#[derive(Debug, Deserialize)]
struct FeedResult {
    #[serde(default)]
    matches: Vec<JsonValue>,
}

#[derive(Clone)]
pub struct FeedApi {
    transport: Arc<dyn Transport>,
    config: FeedApiConfig,
}

impl FeedApi {
    pub fn new(transport: Arc<dyn Transport>, config: FeedApiConfig) -> Self {
        Self { transport, config }
    }

    pub fn history_url(&self) -> String {
        join_url(&self.config.base_url, "GetMatchHistory/v1/")
    }

    pub fn sequence_url(&self) -> String {
        join_url(&self.config.base_url, "GetMatchHistoryBySequenceNum/v1/")
    }

    fn base_query(&self) -> Vec<(&'static str, String)> {
        vec![
            ("key", self.config.key.clone()),
            ("format", self.config.format.clone()),
            ("language", self.config.language.clone()),
        ]
    }

    /// Asks for the single most recent match, whose sequence number seeds the feed cursor.
    pub async fn request_latest(&self) -> Result<FetchedResponse, FetchError> {
        let mut query = self.base_query();
        query.push(("matches_requested", "1".to_string()));
        self.transport.get(&self.history_url(), &query).await
    }

    pub async fn request_batch(
        &self,
        start_at_seq: i64,
        requested: usize,
    ) -> Result<FetchedResponse, FetchError> {
        let mut query = self.base_query();
        query.push(("start_at_match_seq_num", start_at_seq.to_string()));
        query.push(("matches_requested", requested.to_string()));
        self.transport.get(&self.sequence_url(), &query).await
    }
}

pub fn parse_latest_seq(resp: &FetchedResponse) -> Result<i64, AdapterError> {
    let envelope: FeedEnvelope = resp.json()?;
    envelope
        .result
        .matches
        .first()
        .and_then(|m| m.get("match_seq_num"))
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| AdapterError::Malformed("history response carries no match_seq_num".into()))
}

pub fn parse_feed_batch(resp: &FetchedResponse) -> Result<FeedBatch, AdapterError> {
    let envelope: FeedEnvelope = resp.json()?;
    let mut batch = FeedBatch {
        returned: envelope.result.matches.len(),
        ..FeedBatch::default()
    };
    for entry in &envelope.result.matches {
        match screen_feed_match(entry) {
            Ok(token) => batch.accepted.push(token),
            Err(_) => batch.rejected += 1,
        }
    }
    Ok(batch)
}

/// Keeps ranked all-pick matches with ten humans where nobody abandoned.
pub fn screen_feed_match(entry: &JsonValue) -> Result<MatchIdToken, ValidationFailure> {
    let match_id = int_field(entry, "match_id")?;
    require_format(entry, "lobby_type", RANKED_LOBBY_TYPE)?;
    require_format(entry, "human_players", REQUIRED_HUMAN_PLAYERS)?;
    require_format(entry, "game_mode", ALL_PICK_GAME_MODE)?;

    let players = entry
        .get("players")
        .and_then(JsonValue::as_array)
        .ok_or(ValidationFailure::MissingField("players"))?;
    for (index, player) in players.iter().enumerate() {
        match player.get("leaver_status").and_then(JsonValue::as_i64) {
            Some(0 | 1) => {}
            _ => return Err(ValidationFailure::LeaverStatus(index)),
        }
    }

    Ok(MatchIdToken(match_id))
}

#[derive(Clone)]
pub struct DetailApi {
    transport: Arc<dyn Transport>,
    base_url: String,
}

impl DetailApi {
    pub fn new(transport: Arc<dyn Transport>, base_url: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: base_url.into(),
        }
    }

    pub fn match_url(&self, match_id: MatchIdToken) -> String {
        join_url(&self.base_url, &format!("matches/{match_id}"))
    }

    pub async fn request_match(
        &self,
        match_id: MatchIdToken,
    ) -> Result<FetchedResponse, FetchError> {
        self.transport.get(&self.match_url(match_id), &[]).await
    }
}

/// Builds a match record from a detail payload. Range checks are left to `dh_core::validate`.
pub fn parse_match_detail(data: &JsonValue) -> Result<MatchRecord, ValidationFailure> {
    let match_id = int_field(data, "match_id")?;
    let dire_score = int_field(data, "dire_score")?;
    let radiant_score = int_field(data, "radiant_score")?;
    let duration = int_field(data, "duration")?;
    let radiant_win = bool_field(data, "radiant_win")?;
    let start_time = int_field(data, "start_time")?;
    let region = int_field(data, "region")?;
    // Unknown brackets come back as null; they are kept with skill 0.
    let skill = match data.get("skill") {
        None | Some(JsonValue::Null) => 0,
        Some(value) => value.as_i64().ok_or(ValidationFailure::MissingField("skill"))?,
    };

    require_format(data, "game_mode", ALL_PICK_GAME_MODE)?;
    require_format(data, "lobby_type", RANKED_LOBBY_TYPE)?;
    require_format(data, "human_players", REQUIRED_HUMAN_PLAYERS)?;

    let players = data
        .get("players")
        .and_then(JsonValue::as_array)
        .ok_or(ValidationFailure::MissingField("players"))?;
    let mut radiant_picks = Vec::with_capacity(PICKS_PER_TEAM);
    let mut dire_picks = Vec::with_capacity(PICKS_PER_TEAM);
    for player in players {
        let hero = int_field(player, "hero_id")?;
        let slot = int_field(player, "player_slot")?;
        match Team::from_player_slot(slot).ok_or(ValidationFailure::PlayerSlot(slot))? {
            Team::Radiant => radiant_picks.push(hero),
            Team::Dire => dire_picks.push(hero),
        }
    }
    for (side, picks) in [("radiant", &radiant_picks), ("dire", &dire_picks)] {
        if picks.len() != PICKS_PER_TEAM {
            return Err(ValidationFailure::PickCount {
                side,
                count: picks.len(),
            });
        }
    }

    Ok(MatchRecord {
        match_id,
        match_time: start_time,
        winner: i64::from(radiant_win),
        duration,
        radiant_score,
        dire_score,
        skill,
        region,
        radiant_picks,
        dire_picks,
        replay: parse_replay(data),
    })
}

fn parse_replay(data: &JsonValue) -> Option<ReplayInfo> {
    Some(ReplayInfo {
        salt: data.get("replay_salt")?.as_i64()?,
        url: data.get("replay_url")?.as_str()?.to_string(),
        throw: data.get("throw")?.as_i64()?,
        loss: data.get("loss")?.as_i64()?,
    })
}

fn int_field(value: &JsonValue, field: &'static str) -> Result<i64, ValidationFailure> {
    value
        .get(field)
        .and_then(JsonValue::as_i64)
        .ok_or(ValidationFailure::MissingField(field))
}

fn bool_field(value: &JsonValue, field: &'static str) -> Result<bool, ValidationFailure> {
    match value.get(field) {
        Some(JsonValue::Bool(b)) => Ok(*b),
        Some(JsonValue::Number(n)) if n.as_i64() == Some(0) => Ok(false),
        Some(JsonValue::Number(n)) if n.as_i64() == Some(1) => Ok(true),
        _ => Err(ValidationFailure::MissingField(field)),
    }
}

fn require_format(
    value: &JsonValue,
    field: &'static str,
    expected: i64,
) -> Result<(), ValidationFailure> {
    let actual = int_field(value, field)?;
    if actual != expected {
        return Err(ValidationFailure::Format {
            field,
            value: actual,
        });
    }
    Ok(())
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
