//! XCGlobe Flyme fetcher.

use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::pilots::TrackerDevice;
use crate::schedule::SchedulePolicy;
use crate::track::{LivePoint, TrackerId};
use crate::trackers::{TrackerFetcher, get_success_text};

static ACCOUNT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9][\w.-]{2,}$").unwrap());

pub struct FlymeFetcher {
    client: reqwest::Client,
    base_url: String,
    policy: SchedulePolicy,
}

impl FlymeFetcher {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            policy: SchedulePolicy::new(60),
        }
    }
}

#[async_trait]
impl TrackerFetcher for FlymeFetcher {
    fn tracker_id(&self) -> TrackerId {
        TrackerId::Flyme
    }

    fn schedule(&self) -> &SchedulePolicy {
        &self.policy
    }

    fn validate_account(&self, account: &str) -> bool {
        ACCOUNT_RE.is_match(account)
    }

    async fn fetch_points(&self, device: &TrackerDevice, from_sec: i64) -> Result<Vec<LivePoint>> {
        let url = format!(
            "{}/livetrack/positions.json?user={}&from={}",
            self.base_url, device.account, from_sec
        );
        let body = get_success_text(&self.client, &url).await?;
        parse_positions_json(&body)
    }
}

#[derive(Debug, Deserialize)]
struct PositionsResponse {
    #[serde(default)]
    positions: Vec<Position>,
}

#[derive(Debug, Deserialize)]
struct Position {
    t: i64,
    lat: f64,
    lon: f64,
    #[serde(default)]
    alt: f64,
    #[serde(default)]
    v: Option<f64>,
    #[serde(default)]
    msg: Option<String>,
}

pub fn parse_positions_json(body: &str) -> Result<Vec<LivePoint>> {
    let response: PositionsResponse =
        serde_json::from_str(body).context("malformed flyme feed")?;
    Ok(response
        .positions
        .into_iter()
        .map(|p| LivePoint {
            time_sec: p.t,
            lat: p.lat,
            lon: p.lon,
            alt: p.alt,
            valid: true,
            emergency: false,
            low_bat: false,
            speed: p.v,
            message: p.msg.filter(|m| !m.is_empty()),
        })
        .collect())
}
