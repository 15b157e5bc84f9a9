//! Shared fixtures for integration tests: an in-memory world (local
//! storage, memory bus, file pilot source) and canned tracker fetchers.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use livetrack::bus::MemoryBus;
use livetrack::pilots::{FilePilotSource, TrackerDevice};
use livetrack::schedule::SchedulePolicy;
use livetrack::scheduler::{Ticker, TickerSettings};
use livetrack::storage::LocalStorage;
use livetrack::track::{LivePoint, TrackerId};
use livetrack::trackers::TrackerFetcher;

/// A fetcher that hands out canned points for every device.
pub struct CannedFetcher {
    tracker: TrackerId,
    policy: SchedulePolicy,
    points: Vec<LivePoint>,
}

impl CannedFetcher {
    pub fn new(tracker: TrackerId, points: Vec<LivePoint>) -> Self {
        Self {
            tracker,
            policy: SchedulePolicy::new(60),
            points,
        }
    }
}

#[async_trait]
impl TrackerFetcher for CannedFetcher {
    fn tracker_id(&self) -> TrackerId {
        self.tracker
    }

    fn schedule(&self) -> &SchedulePolicy {
        &self.policy
    }

    fn validate_account(&self, account: &str) -> bool {
        !account.is_empty()
    }

    async fn fetch_points(
        &self,
        _device: &TrackerDevice,
        from_sec: i64,
    ) -> Result<Vec<LivePoint>> {
        Ok(self
            .points
            .iter()
            .filter(|p| p.time_sec >= from_sec)
            .cloned()
            .collect())
    }
}

pub struct World {
    pub dir: TempDir,
    pub storage: Arc<LocalStorage>,
    pub bus: Arc<MemoryBus>,
    pub ticker: Arc<Ticker>,
}

/// Builds a ticker over a temp directory. `pilots` is the JSON document the
/// datastore mirror serves.
pub fn build_world(pilots: serde_json::Value, fetchers: Vec<Arc<dyn TrackerFetcher>>) -> World {
    let dir = tempfile::tempdir().expect("tempdir");
    let pilots_path = dir.path().join("pilots.json");
    std::fs::write(&pilots_path, serde_json::to_vec(&pilots).unwrap()).expect("write pilots");

    let storage = Arc::new(LocalStorage::new(dir.path().join("data")));
    let bus = Arc::new(MemoryBus::new());
    let ticker = Arc::new(Ticker::new(
        TickerSettings::default(),
        fetchers,
        Arc::new(FilePilotSource::new(pilots_path)),
        storage.clone(),
        bus.clone(),
        None,
    ));
    World {
        dir,
        storage,
        bus,
        ticker,
    }
}

pub fn climb_points(start_sec: i64, count: i64) -> Vec<LivePoint> {
    (0..count)
        .map(|i| {
            LivePoint::new(
                start_sec + i * 60,
                45.0 + i as f64 * 0.001,
                6.0 + i as f64 * 0.001,
                1000.0 + i as f64 * 10.0,
            )
        })
        .collect()
}
