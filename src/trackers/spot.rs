//! SPOT satellite messenger fetcher (findmespot.com public feeds).

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::DateTime;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::pilots::TrackerDevice;
use crate::schedule::SchedulePolicy;
use crate::track::{LivePoint, TrackerId};
use crate::trackers::{TrackerFetcher, get_success_text};

static ACCOUNT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-zA-Z]{33}$").unwrap());

/// Error code SPOT uses for "no messages in the requested window".
const NO_MESSAGES_CODE: &str = "E-0195";

pub struct SpotFetcher {
    client: reqwest::Client,
    base_url: String,
    policy: SchedulePolicy,
}

impl SpotFetcher {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            policy: SchedulePolicy::new(60),
        }
    }

    fn feed_url(&self, feed_id: &str, from_sec: i64) -> String {
        let start = DateTime::from_timestamp(from_sec, 0)
            .unwrap_or_default()
            .format("%Y-%m-%dT%H:%M:%S-0000");
        format!(
            "{}/spot-main-web/consumer/rest-api/2.0/public/feed/{}/message.json?startDate={}",
            self.base_url, feed_id, start
        )
    }
}

#[async_trait]
impl TrackerFetcher for SpotFetcher {
    fn tracker_id(&self) -> TrackerId {
        TrackerId::Spot
    }

    fn schedule(&self) -> &SchedulePolicy {
        &self.policy
    }

    fn validate_account(&self, account: &str) -> bool {
        ACCOUNT_RE.is_match(account)
    }

    async fn fetch_points(&self, device: &TrackerDevice, from_sec: i64) -> Result<Vec<LivePoint>> {
        let url = self.feed_url(&device.account, from_sec);
        let body = get_success_text(&self.client, &url).await?;
        parse_feed_json(&body)
    }
}

#[derive(Debug, Deserialize)]
struct Root {
    response: Response,
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(rename = "feedMessageResponse")]
    feed: Option<FeedMessageResponse>,
    errors: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct FeedMessageResponse {
    messages: Option<Messages>,
}

#[derive(Debug, Deserialize)]
struct Messages {
    message: OneOrMany<SpotMessage>,
}

/// SPOT collapses a single-element message list to a bare object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(Box<T>),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(item) => vec![*item],
            OneOrMany::Many(items) => items,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SpotMessage {
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    altitude: f64,
    #[serde(rename = "unixTime")]
    unix_time: i64,
    #[serde(rename = "messageType", default)]
    message_type: Option<String>,
    #[serde(rename = "messageContent", default)]
    message_content: Option<String>,
    #[serde(rename = "batteryState", default)]
    battery_state: Option<String>,
}

pub fn parse_feed_json(body: &str) -> Result<Vec<LivePoint>> {
    let root: Root = serde_json::from_str(body).context("malformed SPOT feed")?;

    if let Some(errors) = &root.response.errors {
        let text = errors.to_string();
        if text.contains(NO_MESSAGES_CODE) {
            return Ok(Vec::new());
        }
        bail!("SPOT feed error: {text}");
    }

    let messages = root
        .response
        .feed
        .and_then(|f| f.messages)
        .map(|m| m.message.into_vec())
        .unwrap_or_default();

    Ok(messages
        .into_iter()
        .map(|msg| {
            let message_type = msg.message_type.as_deref().unwrap_or_default();
            LivePoint {
                time_sec: msg.unix_time,
                lat: msg.latitude,
                lon: msg.longitude,
                alt: msg.altitude,
                valid: true,
                emergency: matches!(message_type, "HELP" | "SOS" | "HELP-CANCEL"),
                low_bat: msg.battery_state.as_deref() == Some("LOW"),
                speed: None,
                message: msg.message_content.filter(|c| !c.is_empty()),
            }
        })
        .collect())
}
