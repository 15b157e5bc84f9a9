//! End-to-end tick over an in-memory world: datastore sync, fetch fan-out,
//! merge, trim, export, snapshot, and admin commands.

mod common;

use std::sync::Arc;

use common::{CannedFetcher, build_world, climb_points};
use livetrack::bus::{CMD_CAPTURE, CommandBus, TELEMETRY_TICKS};
use livetrack::codec::COORD_MULTIPLIER;
use livetrack::protos::{decode_group, from_differential};
use livetrack::storage::BlobStorage;
use livetrack::track::{LivePoint, TrackerId, tracker_id};
use livetrack::trackers::TrackerFetcher;

const NOW: i64 = 1_700_000_000;

fn two_pilot_config() -> serde_json::Value {
    serde_json::json!([
        {
            "id": 1,
            "name": "alice",
            "share": true,
            "accounts": {"flyme": "alice", "spot": "A".repeat(33)},
            "updated_sec": NOW - 100
        },
        {
            "id": 2,
            "name": "bob",
            "share": false,
            "accounts": {"flyme": "bob"},
            "updated_sec": NOW - 100
        }
    ])
}

#[tokio::test]
async fn test_tick_merges_fetches_and_exports() {
    let flyme_points = climb_points(NOW - 600, 5);
    let spot_points = vec![LivePoint {
        emergency: true,
        message: Some("SOS".to_string()),
        ..LivePoint::new(NOW - 450, 45.5, 6.5, 1500.0)
    }];
    let world = build_world(
        two_pilot_config(),
        vec![
            Arc::new(CannedFetcher::new(TrackerId::Flyme, flyme_points)),
            Arc::new(CannedFetcher::new(TrackerId::Spot, spot_points)),
        ],
    );

    world.ticker.clone().tick(NOW).await;

    // Full group: both pilots present with their merged tracks.
    let bytes = world.storage.load("groups/full.pb").await.unwrap();
    let full = decode_group(&bytes).unwrap();
    assert_eq!(full.tracks.len(), 2);
    assert!(!full.incremental);

    let alice_index = full
        .remote_id
        .iter()
        .position(|id| id == "1")
        .expect("alice in full group");
    let alice = from_differential(&full.tracks[alice_index]);
    alice.check_invariants();
    // Flyme fixes and the Spot emergency interleaved by time.
    assert_eq!(alice.len(), 6);
    let spot_positions: Vec<usize> = alice
        .flags
        .iter()
        .enumerate()
        .filter(|&(_, &f)| tracker_id(f) == Some(TrackerId::Spot))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(spot_positions.len(), 1);
    let spot_at = spot_positions[0];
    assert_eq!(alice.time_sec[spot_at], NOW - 450);
    assert_eq!(
        alice.extra.get(&spot_at).unwrap().message.as_deref(),
        Some("SOS")
    );
    // Coordinates survived the fixed-point round trip.
    assert!((alice.lat[spot_at] - 45.5).abs() <= 1.0 / COORD_MULTIPLIER);

    // Partner group drops bob (share = false) but keeps alice.
    let bytes = world.storage.load("groups/partner.pb").await.unwrap();
    let partner = decode_group(&bytes).unwrap();
    assert_eq!(partner.remote_id, vec!["1".to_string()]);

    // Incremental group only covers the recent window and is flagged so.
    let bytes = world.storage.load("groups/incremental.pb").await.unwrap();
    let incremental = decode_group(&bytes).unwrap();
    assert!(incremental.incremental);
    assert_eq!(incremental.tracks.len(), 2);

    // The periodic snapshot landed on the first tick.
    assert!(world.storage.load("state/current.snap.zst").await.is_ok());

    // One telemetry line was pushed.
    let telemetry = world.bus.get(TELEMETRY_TICKS).await.unwrap().unwrap();
    let lines: Vec<String> = serde_json::from_slice(&telemetry).unwrap();
    assert_eq!(lines.len(), 1);
    let line: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
    assert_eq!(line["pilots"], 2);
    assert_eq!(line["export_ok"], true);
}

#[tokio::test]
async fn test_second_tick_accumulates_without_duplicates() {
    let points = climb_points(NOW - 600, 5);
    let world = build_world(
        two_pilot_config(),
        vec![Arc::new(CannedFetcher::new(TrackerId::Flyme, points))],
    );

    world.ticker.clone().tick(NOW).await;
    // The same feed again one tick later: the merge must not duplicate
    // timestamps.
    world.ticker.clone().tick(NOW + 60).await;

    let bytes = world.storage.load("groups/full.pb").await.unwrap();
    let full = decode_group(&bytes).unwrap();
    let alice_index = full.remote_id.iter().position(|id| id == "1").unwrap();
    let alice = from_differential(&full.tracks[alice_index]);
    alice.check_invariants();
    assert_eq!(alice.len(), 5);
    for pair in alice.time_sec.windows(2) {
        assert!(pair[0] < pair[1]);
    }
}

#[tokio::test]
async fn test_capture_command_writes_debug_snapshot() {
    let world = build_world(
        two_pilot_config(),
        vec![Arc::new(CannedFetcher::new(
            TrackerId::Flyme,
            climb_points(NOW - 300, 2),
        ))],
    );

    world.ticker.clone().tick(NOW).await;
    assert!(world.storage.list("debug/").await.unwrap().is_empty());

    world.bus.set_flag(CMD_CAPTURE);
    world.ticker.clone().tick(NOW + 60).await;

    let captured = world.storage.list("debug/").await.unwrap();
    assert_eq!(captured.len(), 1);
    assert!(captured[0].ends_with(".snap.zst"));
    // The flag was consumed.
    assert!(!world.bus.take_flag(CMD_CAPTURE).await.unwrap());
}

#[tokio::test]
async fn test_restore_then_export_round_trips_state() {
    let world = build_world(
        two_pilot_config(),
        vec![Arc::new(CannedFetcher::new(
            TrackerId::Flyme,
            climb_points(NOW - 600, 3),
        ))],
    );
    world.ticker.clone().tick(NOW).await;

    // A fresh ticker over the same storage restores the snapshot and can
    // export the same tracks without any fetch.
    let pilots_path = world.dir.path().join("pilots.json");
    let ticker = Arc::new(livetrack::scheduler::Ticker::new(
        livetrack::scheduler::TickerSettings::default(),
        Vec::new(),
        Arc::new(livetrack::pilots::FilePilotSource::new(pilots_path)),
        world.storage.clone(),
        world.bus.clone(),
        None,
    ));
    ticker.restore().await;
    ticker.export_once(NOW + 120).await.unwrap();

    let bytes = world.storage.load("groups/full.pb").await.unwrap();
    let full = decode_group(&bytes).unwrap();
    assert_eq!(full.tracks.len(), 2);
    let alice_index = full.remote_id.iter().position(|id| id == "1").unwrap();
    let alice = from_differential(&full.tracks[alice_index]);
    assert_eq!(alice.len(), 3);
}

#[tokio::test]
async fn test_fetch_errors_do_not_block_other_providers() {
    struct FailingFetcher(livetrack::schedule::SchedulePolicy);

    #[async_trait::async_trait]
    impl TrackerFetcher for FailingFetcher {
        fn tracker_id(&self) -> TrackerId {
            TrackerId::Spot
        }
        fn schedule(&self) -> &livetrack::schedule::SchedulePolicy {
            &self.0
        }
        fn validate_account(&self, _account: &str) -> bool {
            true
        }
        async fn fetch_points(
            &self,
            _device: &livetrack::pilots::TrackerDevice,
            _from_sec: i64,
        ) -> anyhow::Result<Vec<LivePoint>> {
            anyhow::bail!("provider down")
        }
    }

    let world = build_world(
        two_pilot_config(),
        vec![
            Arc::new(FailingFetcher(livetrack::schedule::SchedulePolicy::new(60))),
            Arc::new(CannedFetcher::new(
                TrackerId::Flyme,
                climb_points(NOW - 300, 3),
            )),
        ],
    );
    world.ticker.clone().tick(NOW).await;

    // The Flyme delta still landed despite Spot failing outright.
    let bytes = world.storage.load("groups/full.pb").await.unwrap();
    let full = decode_group(&bytes).unwrap();
    assert_eq!(full.tracks.len(), 2);
    let alice_index = full.remote_id.iter().position(|id| id == "1").unwrap();
    let alice = from_differential(&full.tracks[alice_index]);
    assert!(alice.flags.iter().all(|&f| tracker_id(f) == Some(TrackerId::Flyme)));

    // And the telemetry line reports the error.
    let telemetry = world.bus.get(TELEMETRY_TICKS).await.unwrap().unwrap();
    let lines: Vec<String> = serde_json::from_slice(&telemetry).unwrap();
    let line: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
    assert_eq!(line["errors"], 1);
}
