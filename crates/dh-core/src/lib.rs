//! Core domain model and validation rules for the draft harvester.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "dh-core";

/// Upstream lobby type for ranked matchmaking.
pub const RANKED_LOBBY_TYPE: i64 = 7;
/// Upstream game mode for ranked all pick.
pub const ALL_PICK_GAME_MODE: i64 = 22;
pub const REQUIRED_HUMAN_PLAYERS: i64 = 10;
pub const PICKS_PER_TEAM: usize = 5;
pub const MAX_HERO_ID: i64 = 130;
/// Skill brackets are 1..=3 upstream; 0 marks an unknown bracket.
pub const MAX_SKILL: i64 = 3;

/// Match identifier discovered by the feed stage, consumed once by an enrichment worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MatchIdToken(pub i64);

impl MatchIdToken {
    pub fn get(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for MatchIdToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Side of the map a player was slotted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Team {
    Radiant,
    Dire,
}

impl Team {
    /// Decodes the team from an 8-bit player slot: the most significant bit selects the side.
    ///
    /// Returns `None` when the slot does not fit in 8 bits.
    pub fn from_player_slot(slot: i64) -> Option<Self> {
        let slot = u8::try_from(slot).ok()?;
        if slot & 0b1000_0000 == 0 {
            Some(Team::Radiant)
        } else {
            Some(Team::Dire)
        }
    }
}

/// Replay metadata. Upstream either returns all four values or none of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayInfo {
    pub salt: i64,
    pub url: String,
    pub throw: i64,
    pub loss: i64,
}

/// Enriched match, the unit of work between the enrichment pool and the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub match_id: i64,
    /// Start time in epoch seconds.
    pub match_time: i64,
    /// 1 when radiant won, 0 when dire won.
    pub winner: i64,
    pub duration: i64,
    pub radiant_score: i64,
    pub dire_score: i64,
    pub skill: i64,
    pub region: i64,
    pub radiant_picks: Vec<i64>,
    pub dire_picks: Vec<i64>,
    pub replay: Option<ReplayInfo>,
}

impl MatchRecord {
    /// Start time as a UTC timestamp; `None` when `match_time` is out of range.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.match_time, 0)
    }

    pub fn radiant_won(&self) -> bool {
        self.winner == 1
    }

    pub fn replay_url(&self) -> Option<&str> {
        self.replay.as_ref().map(|r| r.url.as_str())
    }

    /// Checks every shape and range invariant a persisted match must satisfy.
    pub fn check(&self) -> Result<(), ValidationFailure> {
        if self.match_id < 0 {
            return Err(ValidationFailure::NegativeField("match_id"));
        }
        if self.match_time < 0 {
            return Err(ValidationFailure::NegativeField("match_time"));
        }
        if self.winner != 0 && self.winner != 1 {
            return Err(ValidationFailure::Winner(self.winner));
        }
        if self.duration <= 0 {
            return Err(ValidationFailure::Duration(self.duration));
        }
        if self.radiant_score < 0 {
            return Err(ValidationFailure::NegativeField("radiant_score"));
        }
        if self.dire_score < 0 {
            return Err(ValidationFailure::NegativeField("dire_score"));
        }
        if !(0..=MAX_SKILL).contains(&self.skill) {
            return Err(ValidationFailure::Skill(self.skill));
        }
        if self.region < 0 {
            return Err(ValidationFailure::NegativeField("region"));
        }

        for (side, picks) in [("radiant", &self.radiant_picks), ("dire", &self.dire_picks)] {
            if picks.len() != PICKS_PER_TEAM {
                return Err(ValidationFailure::PickCount {
                    side,
                    count: picks.len(),
                });
            }
            if let Some(&hero) = picks.iter().find(|h| !(0..=MAX_HERO_ID).contains(*h)) {
                return Err(ValidationFailure::HeroOutOfRange(hero));
            }
        }

        let mut seen = HashSet::with_capacity(PICKS_PER_TEAM * 2);
        for &hero in self.radiant_picks.iter().chain(self.dire_picks.iter()) {
            if !seen.insert(hero) {
                return Err(ValidationFailure::DuplicateHero(hero));
            }
        }

        if let Some(replay) = &self.replay {
            if !replay.url.starts_with("http") {
                return Err(ValidationFailure::ReplayUrl(replay.url.clone()));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationFailure {
    #[error("missing or mistyped field `{0}`")]
    MissingField(&'static str),
    #[error("field `{0}` is negative")]
    NegativeField(&'static str),
    #[error("winner must be 0 or 1, got {0}")]
    Winner(i64),
    #[error("duration must be positive, got {0}")]
    Duration(i64),
    #[error("skill bracket {0} out of range")]
    Skill(i64),
    #[error("{side} has {count} picks, expected 5")]
    PickCount { side: &'static str, count: usize },
    #[error("hero id {0} out of range")]
    HeroOutOfRange(i64),
    #[error("hero {0} picked twice")]
    DuplicateHero(i64),
    #[error("player slot {0} is not an 8-bit value")]
    PlayerSlot(i64),
    #[error("replay url `{0}` is not an http url")]
    ReplayUrl(String),
    #[error("unexpected {field}: {value}")]
    Format { field: &'static str, value: i64 },
    #[error("player {0} has no usable leaver status")]
    LeaverStatus(usize),
}

/// A record that passed [`validate`]. Only these travel on the enrichment output queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidMatch(MatchRecord);

impl ValidMatch {
    pub fn record(&self) -> &MatchRecord {
        &self.0
    }

    pub fn into_record(self) -> MatchRecord {
        self.0
    }
}

pub fn validate(record: MatchRecord) -> Result<ValidMatch, ValidationFailure> {
    record.check()?;
    Ok(ValidMatch(record))
}

/// Result of one upstream request attempt, driving the per-endpoint retry state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestOutcome {
    Success,
    RateLimited,
    Unavailable,
    Auth,
    NotFound,
    Invalid,
}

impl RequestOutcome {
    /// Outcomes that grow the shared backoff penalty.
    pub fn grows_backoff(self) -> bool {
        matches!(
            self,
            RequestOutcome::RateLimited
                | RequestOutcome::Unavailable
                | RequestOutcome::Auth
                | RequestOutcome::Invalid
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestOutcome::Success => "success",
            RequestOutcome::RateLimited => "rate_limited",
            RequestOutcome::Unavailable => "unavailable",
            RequestOutcome::Auth => "auth",
            RequestOutcome::NotFound => "not_found",
            RequestOutcome::Invalid => "invalid",
        }
    }
}

/// Picks of one stored match split by result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftPicks {
    pub win_picks: Vec<i64>,
    pub loss_picks: Vec<i64>,
}

/// One page of the training dataset as returned by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftPage {
    pub max_id: i64,
    pub count: usize,
    pub drafts: BTreeMap<i64, DraftPicks>,
}
