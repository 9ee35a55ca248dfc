// Upstream payload fixtures live under fixtures/ at the workspace root.

use std::path::{Path, PathBuf};

use dh_adapters::{parse_feed_batch, parse_match_detail};
use dh_core::{validate, MatchIdToken};
use dh_storage::FetchedResponse;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;

fn fixture_path(relative: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(relative)
}

fn read_fixture(relative: &str) -> Vec<u8> {
    std::fs::read(fixture_path(relative)).expect("read fixture")
}

#[test]
fn sequence_batch_fixture_keeps_only_clean_ranked_all_pick() {
    let resp = FetchedResponse {
        status: StatusCode::OK,
        final_url: "fixture://feed".into(),
        body: read_fixture("feed/sequence_batch.json"),
    };
    let batch = parse_feed_batch(&resp).expect("parse batch");
    assert_eq!(batch.returned, 6);
    assert_eq!(batch.rejected, 4);
    assert_eq!(
        batch.accepted,
        vec![MatchIdToken(4_100_000_001), MatchIdToken(4_100_000_006)]
    );
}

#[test]
fn detail_fixture_with_null_skill_is_accepted() {
    let data: JsonValue =
        serde_json::from_slice(&read_fixture("detail/match_skill_null.json")).expect("json");
    let record = parse_match_detail(&data).expect("parse detail");
    assert_eq!(record.skill, 0);
    assert_eq!(record.radiant_picks, vec![14, 8, 26, 75, 101]);
    assert_eq!(record.dire_picks, vec![1, 44, 53, 86, 119]);
    assert!(validate(record).is_ok());
}

#[test]
fn detail_fixture_with_replay_carries_replay_info() {
    let data: JsonValue =
        serde_json::from_slice(&read_fixture("detail/match_with_replay.json")).expect("json");
    let record = parse_match_detail(&data).expect("parse detail");
    assert_eq!(record.winner, 1);
    assert_eq!(
        record.replay_url(),
        Some("http://replay133.valve.net/570/4100000006_1029384756.dem.bz2")
    );
}
