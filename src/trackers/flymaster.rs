//! Flymaster live fetcher (lt.flymaster.net).

use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::pilots::TrackerDevice;
use crate::schedule::SchedulePolicy;
use crate::track::{LivePoint, TrackerId};
use crate::trackers::{TrackerFetcher, get_success_text};

static ACCOUNT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").unwrap());

pub struct FlymasterFetcher {
    client: reqwest::Client,
    base_url: String,
    policy: SchedulePolicy,
}

impl FlymasterFetcher {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            // Flymaster devices report continuously in flight; poll a bit
            // wider than the phone-app providers.
            policy: SchedulePolicy::new(90),
        }
    }
}

#[async_trait]
impl TrackerFetcher for FlymasterFetcher {
    fn tracker_id(&self) -> TrackerId {
        TrackerId::Flymaster
    }

    fn schedule(&self) -> &SchedulePolicy {
        &self.policy
    }

    fn validate_account(&self, account: &str) -> bool {
        ACCOUNT_RE.is_match(account)
    }

    async fn fetch_points(&self, device: &TrackerDevice, from_sec: i64) -> Result<Vec<LivePoint>> {
        let url = format!(
            "{}/wlb/getLiveData.php?i={}&from={}",
            self.base_url, device.account, from_sec
        );
        let body = get_success_text(&self.client, &url).await?;
        parse_live_json(&body)
    }
}

/// One fix in Flymaster's terse key scheme: `d` date, `la`/`lo` position,
/// `ai` altitude, `v` speed.
#[derive(Debug, Deserialize)]
struct FlymasterFix {
    d: i64,
    la: f64,
    lo: f64,
    #[serde(default)]
    ai: f64,
    #[serde(default)]
    v: Option<f64>,
}

pub fn parse_live_json(body: &str) -> Result<Vec<LivePoint>> {
    let fixes: Vec<FlymasterFix> =
        serde_json::from_str(body).context("malformed flymaster feed")?;
    Ok(fixes
        .into_iter()
        .map(|fix| LivePoint {
            time_sec: fix.d,
            lat: fix.la,
            lon: fix.lo,
            alt: fix.ai,
            valid: true,
            emergency: false,
            low_bat: false,
            speed: fix.v,
            message: None,
        })
        .collect())
}
