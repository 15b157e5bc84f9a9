//! Fixed-interval tick orchestrator.
//!
//! One tick fans fetches out to every tracker, folds the returned deltas
//! into the pilot tracks, trims and downsamples them, decorates the last
//! fixes with ground altitude, publishes the encoded groups, and handles
//! the slower chores (datastore sync, snapshots, admin commands) on their
//! own sub-intervals. At most one tick runs at a time: the timer drops a
//! fire that lands while the previous tick is still going.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::bus::{CMD_CAPTURE, CMD_EXPORT, CMD_FULL_SYNC, CommandBus, TELEMETRY_TICKS};
use crate::elevation::ElevationClient;
use crate::merge::{merge, remove_before, without_tracker};
use crate::pilots::{PilotRegistry, PilotSource};
use crate::protos::{TrackGroup, encode_group, to_differential};
use crate::simplify::simplify;
use crate::storage::{BlobStorage, load_compressed, save_compressed, sweep_archives};
use crate::track::{
    INCREMENTAL_SEC, LIVE_AGE_OLD_SEC, LIVE_MINIMAL_INTERVAL_SEC, LIVE_OLD_INTERVAL_SEC,
    LIVE_RETENTION_SEC, TrackerId,
};
use crate::trackers::{TrackerFetcher, TrackerUpdates, refresh};

const STATE_PATH: &str = "state/current.snap.zst";
const GROUP_FULL_PATH: &str = "groups/full.pb";
const GROUP_INCREMENTAL_PATH: &str = "groups/incremental.pb";
const GROUP_PARTNER_PATH: &str = "groups/partner.pb";

#[derive(Debug, Clone)]
pub struct TickerSettings {
    pub fetch_timeout: Duration,
    pub partner_strip: TrackerId,
    pub full_sync_interval_sec: i64,
    pub partial_sync_interval_sec: i64,
    pub snapshot_interval_sec: i64,
    pub archive_retention_days: i64,
    pub telemetry_cap: usize,
}

impl Default for TickerSettings {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(40),
            partner_strip: TrackerId::Inreach,
            full_sync_interval_sec: 24 * 3600,
            partial_sync_interval_sec: 10 * 60,
            snapshot_interval_sec: 10 * 60,
            archive_retention_days: 30,
            telemetry_cap: 50,
        }
    }
}

/// Full in-memory state, as persisted to durable storage.
#[derive(Serialize, Deserialize)]
struct StateSnapshot {
    taken_sec: i64,
    pilots: Vec<crate::pilots::Pilot>,
}

pub struct Ticker {
    settings: TickerSettings,
    fetchers: Vec<Arc<dyn TrackerFetcher>>,
    source: Arc<dyn PilotSource>,
    storage: Arc<dyn BlobStorage>,
    bus: Arc<dyn CommandBus>,
    elevation: Option<ElevationClient>,
    registry: Mutex<PilotRegistry>,
    in_tick: AtomicBool,
    last_full_sync_sec: AtomicI64,
    last_partial_sync_sec: AtomicI64,
    last_snapshot_sec: AtomicI64,
    last_archive_day: AtomicI64,
}

impl Ticker {
    pub fn new(
        settings: TickerSettings,
        fetchers: Vec<Arc<dyn TrackerFetcher>>,
        source: Arc<dyn PilotSource>,
        storage: Arc<dyn BlobStorage>,
        bus: Arc<dyn CommandBus>,
        elevation: Option<ElevationClient>,
    ) -> Self {
        Self {
            settings,
            fetchers,
            source,
            storage,
            bus,
            elevation,
            registry: Mutex::new(PilotRegistry::default()),
            in_tick: AtomicBool::new(false),
            last_full_sync_sec: AtomicI64::new(0),
            last_partial_sync_sec: AtomicI64::new(0),
            last_snapshot_sec: AtomicI64::new(0),
            last_archive_day: AtomicI64::new(0),
        }
    }

    /// Timer loop: one spawned tick per interval fire, forever. The
    /// re-entrancy guard in [`Ticker::tick`] drops fires that land while a
    /// tick is still running.
    pub async fn run(self: Arc<Self>, tick_interval: Duration) {
        info!("scheduler running, tick every {tick_interval:?}");
        let mut interval = tokio::time::interval(tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let now_sec = Utc::now().timestamp();
            tokio::spawn(self.clone().tick(now_sec));
        }
    }

    pub async fn tick(self: Arc<Self>, now_sec: i64) {
        if self.in_tick.swap(true, Ordering::SeqCst) {
            warn!("previous tick still running, dropping this one");
            counter!("tick.skipped_reentrant").increment(1);
            return;
        }
        let started = Instant::now();
        counter!("tick.count").increment(1);
        if let Err(err) = self.run_tick(now_sec, started).await {
            counter!("tick.errors").increment(1);
            error!("tick failed: {err:#}");
        }
        histogram!("tick.duration_seconds").record(started.elapsed().as_secs_f64());
        self.in_tick.store(false, Ordering::SeqCst);
    }

    async fn run_tick(&self, now_sec: i64, started: Instant) -> Result<()> {
        let force_full_sync = self.take_flag(CMD_FULL_SYNC).await;
        let force_export = self.take_flag(CMD_EXPORT).await;
        let capture = self.take_flag(CMD_CAPTURE).await;

        self.sync_pilots(now_sec, force_full_sync).await;

        let results = self.fan_out(now_sec).await;
        let (num_deltas, num_errors) = self.apply_updates(now_sec, results).await;
        self.trim_tracks(now_sec).await;
        self.patch_ground_altitude().await;

        let export_ok = match self.export_groups(now_sec).await {
            Ok(()) => true,
            Err(err) => {
                counter!("export.errors").increment(1);
                warn!("export failed: {err:#}");
                false
            }
        };
        if force_export {
            info!("export command processed");
        }

        if capture {
            let path = format!("debug/{now_sec}.snap.zst");
            if let Err(err) = self.save_snapshot(&path, now_sec).await {
                warn!("state capture failed: {err:#}");
            } else {
                info!("captured state to {path}");
            }
        }
        self.periodic_snapshot(now_sec).await;

        let pilots = self.registry.lock().await.len();
        gauge!("pilots.count").set(pilots as f64);
        let line = serde_json::json!({
            "t": now_sec,
            "duration_ms": started.elapsed().as_millis() as u64,
            "pilots": pilots,
            "deltas": num_deltas,
            "errors": num_errors,
            "export_ok": export_ok,
        })
        .to_string();
        if let Err(err) = self
            .bus
            .push_capped(TELEMETRY_TICKS, line, self.settings.telemetry_cap)
            .await
        {
            warn!("telemetry push failed: {err:#}");
        }
        Ok(())
    }

    async fn take_flag(&self, key: &str) -> bool {
        match self.bus.take_flag(key).await {
            Ok(set) => {
                if set {
                    info!("admin command received: {key}");
                }
                set
            }
            Err(err) => {
                warn!("failed to poll {key}: {err:#}");
                false
            }
        }
    }

    /// Pulls configuration from the datastore on its sub-intervals. Sync
    /// failures leave the current roster in place.
    async fn sync_pilots(&self, now_sec: i64, force_full: bool) {
        let full_due = force_full
            || now_sec - self.last_full_sync_sec.load(Ordering::Relaxed)
                >= self.settings.full_sync_interval_sec;
        let partial_since = self.last_partial_sync_sec.load(Ordering::Relaxed);
        let partial_due = now_sec - partial_since >= self.settings.partial_sync_interval_sec;

        if full_due {
            match self.source.full_sync().await {
                Ok(configs) => {
                    let mut registry = self.registry.lock().await;
                    registry.apply_configs(&configs, true);
                    info!("full sync applied, {} pilots", registry.len());
                    self.last_full_sync_sec.store(now_sec, Ordering::Relaxed);
                    self.last_partial_sync_sec.store(now_sec, Ordering::Relaxed);
                }
                Err(err) => warn!("full sync failed: {err:#}"),
            }
        } else if partial_due {
            match self.source.incremental_sync(partial_since).await {
                Ok(configs) => {
                    if !configs.is_empty() {
                        let mut registry = self.registry.lock().await;
                        registry.apply_configs(&configs, false);
                        debug!("partial sync applied, {} records", configs.len());
                    }
                    self.last_partial_sync_sec.store(now_sec, Ordering::Relaxed);
                }
                Err(err) => warn!("partial sync failed: {err:#}"),
            }
        }
    }

    /// Concurrent refresh of every tracker, each under its own timeout. A
    /// timed-out or panicked fetcher contributes nothing this tick.
    async fn fan_out(
        &self,
        now_sec: i64,
    ) -> Vec<(Arc<dyn TrackerFetcher>, TrackerUpdates)> {
        let device_lists = {
            let registry = self.registry.lock().await;
            self.fetchers
                .iter()
                .map(|f| registry.devices_due(f.tracker_id(), now_sec))
                .collect::<Vec<_>>()
        };
        let deadline = Instant::now() + self.settings.fetch_timeout;
        let fetch_timeout = self.settings.fetch_timeout + Duration::from_secs(5);

        let futures = self
            .fetchers
            .iter()
            .cloned()
            .zip(device_lists)
            .map(|(fetcher, devices)| async move {
                fetcher.maintain(now_sec).await;
                if devices.is_empty() {
                    return Some((fetcher, TrackerUpdates::default()));
                }
                debug!(
                    "refreshing {} devices on {}",
                    devices.len(),
                    fetcher.tracker_id()
                );
                match tokio::time::timeout(
                    fetch_timeout,
                    refresh(fetcher.as_ref(), &devices, now_sec, deadline),
                )
                .await
                {
                    Ok(updates) => Some((fetcher, updates)),
                    Err(_) => {
                        counter!("fetch.timeouts", "tracker" => fetcher.tracker_id().name())
                            .increment(1);
                        error!("{} refresh timed out, skipping", fetcher.tracker_id());
                        None
                    }
                }
            });
        futures_util::future::join_all(futures)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Folds fetcher results into pilot tracks and reschedules every
    /// touched device. Merges run in fetcher insertion order.
    async fn apply_updates(
        &self,
        now_sec: i64,
        results: Vec<(Arc<dyn TrackerFetcher>, TrackerUpdates)>,
    ) -> (usize, usize) {
        let mut num_deltas = 0usize;
        let mut num_errors = 0usize;
        let mut registry = self.registry.lock().await;

        for (fetcher, updates) in results {
            let tracker = fetcher.tracker_id();
            for error in &updates.errors {
                warn!("{tracker}: {error}");
            }
            for pilot_id in &updates.fetched {
                let Some(pilot) = registry.get_mut(*pilot_id) else {
                    continue;
                };
                let Some(state) = pilot.trackers.get_mut(&tracker) else {
                    continue;
                };
                state.last_fetch_sec = now_sec;

                if let Some(delta) = updates.track_deltas.get(pilot_id) {
                    state.num_consecutive_errors = 0;
                    if let Some(last) = delta.last_fix_sec() {
                        state.last_fix_sec = state.last_fix_sec.max(last);
                    }
                    pilot.track = merge(&pilot.track, delta);
                    num_deltas += 1;
                } else if let Some(error) = updates.tracker_errors.get(pilot_id) {
                    state.num_errors += 1;
                    state.num_consecutive_errors += 1;
                    num_errors += 1;
                    debug!(
                        "{tracker}: pilot {pilot_id} error #{}: {error}",
                        state.num_consecutive_errors
                    );
                }

                let staleness =
                    (state.last_fix_sec > 0).then(|| now_sec - state.last_fix_sec);
                state.next_fetch_sec = now_sec
                    + fetcher
                        .schedule()
                        .next_fetch_after_sec(state.num_consecutive_errors, staleness);
            }
        }
        (num_deltas, num_errors)
    }

    /// Retention trim plus the two-density simplification pass.
    async fn trim_tracks(&self, now_sec: i64) {
        let mut registry = self.registry.lock().await;
        for pilot in registry.iter_mut() {
            if pilot.track.is_empty() {
                continue;
            }
            let trimmed = remove_before(&pilot.track, now_sec - LIVE_RETENTION_SEC);
            let fine = simplify(&trimmed, LIVE_MINIMAL_INTERVAL_SEC, None, None);
            pilot.track = simplify(
                &fine,
                LIVE_OLD_INTERVAL_SEC,
                None,
                Some(now_sec - LIVE_AGE_OLD_SEC),
            );
        }
    }

    /// Bulk elevation lookup for last fixes lacking a ground altitude.
    async fn patch_ground_altitude(&self) {
        let Some(elevation) = &self.elevation else {
            return;
        };
        let targets: Vec<(i64, f64, f64)> = {
            let registry = self.registry.lock().await;
            registry
                .iter()
                .filter(|p| !p.track.is_empty())
                .filter(|p| {
                    let last = p.track.len() - 1;
                    p.track
                        .extra
                        .get(&last)
                        .is_none_or(|extra| extra.gnd_alt.is_none())
                })
                .map(|p| {
                    let last = p.track.len() - 1;
                    (p.id, p.track.lat[last], p.track.lon[last])
                })
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        let points: Vec<(f64, f64)> = targets.iter().map(|t| (t.1, t.2)).collect();
        let elevations = match elevation.lookup(&points).await {
            Ok(elevations) => elevations,
            Err(err) => {
                warn!("ground altitude lookup failed: {err:#}");
                return;
            }
        };

        let mut registry = self.registry.lock().await;
        for ((pilot_id, lat, _), gnd_alt) in targets.iter().zip(elevations) {
            let Some(gnd_alt) = gnd_alt else {
                continue;
            };
            let Some(pilot) = registry.get_mut(*pilot_id) else {
                continue;
            };
            if pilot.track.is_empty() || pilot.track.lat[pilot.track.len() - 1] != *lat {
                // The track moved underneath us; skip rather than patch a
                // stale index.
                continue;
            }
            let last = pilot.track.len() - 1;
            pilot.track.extra.entry(last).or_default().gnd_alt = Some(gnd_alt);
        }
    }

    /// Builds and persists the three encoded output groups.
    async fn export_groups(&self, now_sec: i64) -> Result<()> {
        let (full, incremental, partner) = {
            let registry = self.registry.lock().await;
            build_groups(&registry, now_sec, self.settings.partner_strip)
        };
        gauge!("export.full_tracks").set(full.tracks.len() as f64);
        self.storage
            .save(GROUP_FULL_PATH, &encode_group(&full))
            .await
            .context("failed to save full group")?;
        self.storage
            .save(GROUP_INCREMENTAL_PATH, &encode_group(&incremental))
            .await
            .context("failed to save incremental group")?;
        self.storage
            .save(GROUP_PARTNER_PATH, &encode_group(&partner))
            .await
            .context("failed to save partner group")?;
        debug!(
            "exported groups: {} full, {} incremental, {} partner",
            full.tracks.len(),
            incremental.tracks.len(),
            partner.tracks.len()
        );
        Ok(())
    }

    /// One-shot export entry point for the CLI.
    pub async fn export_once(&self, now_sec: i64) -> Result<()> {
        self.export_groups(now_sec).await
    }

    async fn save_snapshot(&self, path: &str, now_sec: i64) -> Result<()> {
        let bytes = {
            let registry = self.registry.lock().await;
            let snapshot = StateSnapshot {
                taken_sec: now_sec,
                pilots: registry.iter().cloned().collect(),
            };
            serde_json::to_vec(&snapshot).context("failed to serialize state")?
        };
        save_compressed(self.storage.as_ref(), path, &bytes).await
    }

    async fn periodic_snapshot(&self, now_sec: i64) {
        if now_sec - self.last_snapshot_sec.load(Ordering::Relaxed)
            < self.settings.snapshot_interval_sec
        {
            return;
        }
        if let Err(err) = self.save_snapshot(STATE_PATH, now_sec).await {
            counter!("snapshot.errors").increment(1);
            warn!("snapshot failed: {err:#}");
            return;
        }
        self.last_snapshot_sec.store(now_sec, Ordering::Relaxed);

        // Daily dated archive plus the retention sweep.
        let today = DateTime::from_timestamp(now_sec, 0)
            .unwrap_or_default()
            .date_naive();
        let day_number = today.num_days_from_ce() as i64;
        if self.last_archive_day.swap(day_number, Ordering::Relaxed) != day_number {
            let path = format!("archive/{today}.snap.zst");
            if let Err(err) = self.save_snapshot(&path, now_sec).await {
                counter!("snapshot.errors").increment(1);
                warn!("archive snapshot failed: {err:#}");
            }
            match sweep_archives(
                self.storage.as_ref(),
                "archive/",
                today,
                self.settings.archive_retention_days,
            )
            .await
            {
                Ok(0) => {}
                Ok(deleted) => info!("archive sweep deleted {deleted} snapshots"),
                Err(err) => warn!("archive sweep failed: {err:#}"),
            }
        }
    }

    /// Best-effort warm start from the last persisted snapshot.
    pub async fn restore(&self) {
        match load_compressed(self.storage.as_ref(), STATE_PATH).await {
            Ok(bytes) => match serde_json::from_slice::<StateSnapshot>(&bytes) {
                Ok(snapshot) => {
                    let mut registry = self.registry.lock().await;
                    let count = snapshot.pilots.len();
                    for pilot in snapshot.pilots {
                        registry.insert(pilot);
                    }
                    info!(
                        "restored {count} pilots from snapshot taken at {}",
                        snapshot.taken_sec
                    );
                }
                Err(err) => warn!("ignoring corrupt snapshot: {err:#}"),
            },
            Err(err) => info!("starting cold, no snapshot: {err:#}"),
        }
    }

    /// Final snapshot on the way out.
    pub async fn shutdown(&self, now_sec: i64) {
        info!("shutting down, persisting final snapshot");
        if let Err(err) = self.save_snapshot(STATE_PATH, now_sec).await {
            error!("final snapshot failed: {err:#}");
        }
    }
}

/// The three output groups: full retention, recent-incremental, and the
/// partner export with one tracker stripped and non-sharing pilots
/// excluded. `remote_id` carries the pilot ids of the included tracks.
pub fn build_groups(
    registry: &PilotRegistry,
    now_sec: i64,
    partner_strip: TrackerId,
) -> (TrackGroup, TrackGroup, TrackGroup) {
    let mut full = TrackGroup {
        incremental: false,
        ..Default::default()
    };
    let mut incremental = TrackGroup {
        incremental: true,
        ..Default::default()
    };
    let mut partner = TrackGroup {
        incremental: false,
        ..Default::default()
    };

    for pilot in registry.iter() {
        if !pilot.enabled || pilot.track.is_empty() {
            continue;
        }
        full.tracks.push(to_differential(&pilot.track));
        full.remote_id.push(pilot.id.to_string());

        let recent = remove_before(&pilot.track, now_sec - INCREMENTAL_SEC);
        if !recent.is_empty() {
            incremental.tracks.push(to_differential(&recent));
            incremental.remote_id.push(pilot.id.to_string());
        }

        if pilot.share {
            let stripped = without_tracker(&pilot.track, partner_strip);
            if !stripped.is_empty() {
                partner.tracks.push(to_differential(&stripped));
                partner.remote_id.push(pilot.id.to_string());
            }
        }
    }
    (full, incremental, partner)
}
