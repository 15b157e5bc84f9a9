//! Tracker fetchers, one per external provider.
//!
//! Each provider module owns its account format, feed parsing, and
//! scheduling policy; the shared [`refresh`] driver owns everything common:
//! account validation, the wall-clock deadline, bounded retries, and
//! normalization of provider points into a track delta.

pub mod flymaster;
pub mod flyme;
pub mod inreach;
pub mod skylines;
pub mod spot;

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use metrics::{counter, histogram};
use tracing::{debug, warn};

use crate::pilots::TrackerDevice;
use crate::schedule::SchedulePolicy;
use crate::simplify::simplify;
use crate::track::{LIVE_RETENTION_SEC, LivePoint, LiveTrack, TrackerId, track_from_points};

/// Attempts per device request; only transient failures are retried.
pub const FETCH_ATTEMPTS: usize = 3;

/// Per-request timeout for provider API calls.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything one provider produced during a tick.
#[derive(Debug, Default)]
pub struct TrackerUpdates {
    pub track_deltas: HashMap<i64, LiveTrack>,
    pub tracker_errors: HashMap<i64, String>,
    /// Pilots whose device was looked at this tick (successfully or not);
    /// the scheduler updates their fetch bookkeeping.
    pub fetched: HashSet<i64>,
    /// Provider-level errors not attributable to one pilot.
    pub errors: Vec<String>,
    pub start_fetch_sec: i64,
    pub end_fetch_sec: i64,
}

#[async_trait]
pub trait TrackerFetcher: Send + Sync {
    fn tracker_id(&self) -> TrackerId;

    fn schedule(&self) -> &SchedulePolicy;

    /// Syntactic account check; invalid accounts are rejected per-pilot
    /// without a network call.
    fn validate_account(&self, account: &str) -> bool;

    /// Overlap window behind the last retrieved fix that each fetch
    /// re-requests, so a missed poll cannot lose positions.
    fn lookback_sec(&self) -> i64 {
        30 * 60
    }

    /// Minimal spacing of fixes kept from this provider's feed.
    fn min_interval_sec(&self) -> i64 {
        crate::track::LIVE_MINIMAL_INTERVAL_SEC
    }

    async fn fetch_points(&self, device: &TrackerDevice, from_sec: i64) -> Result<Vec<LivePoint>>;

    /// Provider housekeeping run once per tick outside the fetch fan-out
    /// (proxy reaping and the like). Default: nothing to do.
    async fn maintain(&self, _now_sec: i64) {}
}

/// Window start for a device: the provider lookback anchored on the last
/// retrieved fix, clamped to the retention window.
pub fn fetch_from_sec(fetcher: &dyn TrackerFetcher, device: &TrackerDevice, now_sec: i64) -> i64 {
    let anchored = if device.last_fix_sec > 0 {
        device.last_fix_sec - fetcher.lookback_sec()
    } else {
        i64::MIN
    };
    anchored.max(now_sec - LIVE_RETENTION_SEC)
}

/// Polls every due device of one provider until done or the shared
/// deadline passes. Never returns an error: everything that can go wrong
/// is recorded per-pilot or per-provider in the result.
pub async fn refresh(
    fetcher: &dyn TrackerFetcher,
    devices: &[TrackerDevice],
    now_sec: i64,
    deadline: Instant,
) -> TrackerUpdates {
    let tracker = fetcher.tracker_id();
    let started = Instant::now();
    let mut updates = TrackerUpdates {
        start_fetch_sec: now_sec,
        ..Default::default()
    };

    for (position, device) in devices.iter().enumerate() {
        if Instant::now() >= deadline {
            let remaining = devices.len() - position;
            warn!("{tracker}: deadline reached, {remaining} devices not fetched");
            updates
                .errors
                .push(format!("deadline reached with {remaining} devices left"));
            counter!("fetch.deadline_hits", "tracker" => tracker.name()).increment(1);
            for late in &devices[position..] {
                updates
                    .tracker_errors
                    .insert(late.pilot_id, "fetch deadline reached".to_string());
            }
            break;
        }

        updates.fetched.insert(device.pilot_id);
        if !fetcher.validate_account(&device.account) {
            debug!("{tracker}: invalid account for pilot {}", device.pilot_id);
            updates.tracker_errors.insert(
                device.pilot_id,
                format!("invalid {tracker} account {:?}", device.account),
            );
            counter!("fetch.invalid_accounts", "tracker" => tracker.name()).increment(1);
            continue;
        }

        let from_sec = fetch_from_sec(fetcher, device, now_sec);
        match fetcher.fetch_points(device, from_sec).await {
            Ok(points) => {
                counter!("fetch.devices_ok", "tracker" => tracker.name()).increment(1);
                if points.is_empty() {
                    continue;
                }
                let track = track_from_points(points, tracker, device.is_ufo);
                let track = simplify(&track, fetcher.min_interval_sec(), None, None);
                updates.track_deltas.insert(device.pilot_id, track);
            }
            Err(error) => {
                counter!("fetch.devices_err", "tracker" => tracker.name()).increment(1);
                debug!("{tracker}: pilot {} fetch failed: {error:#}", device.pilot_id);
                updates
                    .tracker_errors
                    .insert(device.pilot_id, format!("{error:#}"));
            }
        }
    }

    updates.end_fetch_sec = now_sec + started.elapsed().as_secs() as i64;
    histogram!("fetch.refresh_duration_seconds", "tracker" => tracker.name())
        .record(started.elapsed().as_secs_f64());
    updates
}

/// GET with bounded retry on transient failures (connect/timeout, 5xx,
/// 429). Returns the final response for the caller to inspect; only
/// repeated transport failures surface as `Err`.
pub async fn get_with_retry(client: &reqwest::Client, url: &str) -> Result<reqwest::Response> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match client
            .get(url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => {
                let status = response.status();
                let transient = status.is_server_error()
                    || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
                if !transient || attempt >= FETCH_ATTEMPTS {
                    return Ok(response);
                }
                debug!("retrying {url} after HTTP {status} (attempt {attempt})");
            }
            Err(error) => {
                if attempt >= FETCH_ATTEMPTS {
                    return Err(error).with_context(|| format!("request to {url} failed"));
                }
                debug!("retrying {url} after transport error: {error} (attempt {attempt})");
            }
        }
        tokio::time::sleep(Duration::from_millis(250 * attempt as u64)).await;
    }
}

/// Like [`get_with_retry`] but requires a success status.
pub async fn get_success_text(client: &reqwest::Client, url: &str) -> Result<String> {
    let response = get_with_retry(client, url).await?;
    let status = response.status();
    if !status.is_success() {
        return Err(anyhow!("HTTP {status} from {url}"));
    }
    response
        .text()
        .await
        .with_context(|| format!("failed to read body from {url}"))
}
