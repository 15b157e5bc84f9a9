//! Garmin InReach fetcher.
//!
//! Accounts are share URLs; the feed is KML. Garmin rate-limits per source
//! address, so a 429 fails the request over to the proxy pool for a
//! cool-down window.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use chrono::DateTime;
use once_cell::sync::Lazy;
use quick_xml::Reader;
use quick_xml::events::Event;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::debug;

use crate::pilots::TrackerDevice;
use crate::proxy::ProxyPool;
use crate::schedule::SchedulePolicy;
use crate::track::{LivePoint, TrackerId};
use crate::trackers::{TrackerFetcher, get_with_retry};

static ACCOUNT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^https?://[\w.-]*(garmin|inreach|delorme)\.com/[\w~%./-]+$").unwrap()
});

pub struct InreachFetcher {
    client: reqwest::Client,
    policy: SchedulePolicy,
    proxy: Mutex<ProxyPool>,
}

impl InreachFetcher {
    pub fn new(client: reqwest::Client, proxy: ProxyPool) -> Self {
        Self {
            client,
            policy: SchedulePolicy::new(60),
            proxy: Mutex::new(proxy),
        }
    }

    fn feed_url(account: &str, from_sec: i64) -> String {
        let from = DateTime::from_timestamp(from_sec, 0)
            .unwrap_or_default()
            .format("%Y-%m-%dT%H:%M:%SZ");
        format!("{account}?d1={from}")
    }

    async fn send(&self, url: &str, now_sec: i64) -> Result<String> {
        let direct = {
            let proxy = self.proxy.lock().await;
            if proxy.active(now_sec) {
                proxy.client().cloned()
            } else {
                None
            }
        };
        let client = direct.as_ref().unwrap_or(&self.client);
        let response = get_with_retry(client, url).await?;
        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            debug!("inreach rate limited, trying the proxy pool");
            let proxied = {
                let mut proxy = self.proxy.lock().await;
                proxy.activate(now_sec).await?;
                proxy
                    .client()
                    .cloned()
                    .ok_or_else(|| anyhow!("proxy pool active but no client"))?
            };
            let response = get_with_retry(&proxied, url).await?;
            let status = response.status();
            if !status.is_success() {
                bail!("HTTP {status} from {url} (via proxy)");
            }
            return response.text().await.context("failed to read feed body");
        }

        if !status.is_success() {
            bail!("HTTP {status} from {url}");
        }
        response.text().await.context("failed to read feed body")
    }
}

#[async_trait]
impl TrackerFetcher for InreachFetcher {
    fn tracker_id(&self) -> TrackerId {
        TrackerId::Inreach
    }

    fn schedule(&self) -> &SchedulePolicy {
        &self.policy
    }

    fn validate_account(&self, account: &str) -> bool {
        ACCOUNT_RE.is_match(account)
    }

    async fn fetch_points(&self, device: &TrackerDevice, from_sec: i64) -> Result<Vec<LivePoint>> {
        let url = Self::feed_url(&device.account, from_sec);
        let now_sec = chrono::Utc::now().timestamp();
        let kml = self.send(&url, now_sec).await?;
        parse_feed_kml(&kml)
    }

    async fn maintain(&self, now_sec: i64) {
        self.proxy.lock().await.reap_zombies(now_sec).await;
    }
}

#[derive(Default)]
struct PlacemarkFields {
    when: Option<String>,
    coordinates: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
    elevation: Option<f64>,
    velocity: Option<f64>,
    in_emergency: bool,
    text: Option<String>,
}

impl PlacemarkFields {
    fn into_point(self) -> Option<LivePoint> {
        let time_sec = DateTime::parse_from_rfc3339(self.when.as_deref()?)
            .ok()?
            .timestamp();
        // Coordinates come from ExtendedData when present, else from the
        // Point geometry ("lon,lat[,alt]").
        let (lat, lon, coord_alt) = match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => (lat, lon, None),
            _ => {
                let raw = self.coordinates?;
                let mut parts = raw.split(',').map(str::trim);
                let lon = parts.next()?.parse().ok()?;
                let lat = parts.next()?.parse().ok()?;
                let alt = parts.next().and_then(|a| a.parse().ok());
                (lat, lon, alt)
            }
        };
        Some(LivePoint {
            time_sec,
            lat,
            lon,
            alt: self.elevation.or(coord_alt).unwrap_or(0.0),
            valid: true,
            emergency: self.in_emergency,
            low_bat: false,
            speed: self.velocity,
            message: self.text.filter(|t| !t.is_empty()),
        })
    }
}

/// Leading-number parse for InReach's unit-suffixed values
/// ("1389.4 m from MSL", "2.5 km/h").
fn leading_f64(value: &str) -> Option<f64> {
    value.split_whitespace().next()?.parse().ok()
}

/// Parses an InReach share feed. Placemarks without a timestamp or
/// position (route headers, message-only entries) are skipped.
pub fn parse_feed_kml(kml: &str) -> Result<Vec<LivePoint>> {
    let mut reader = Reader::from_str(kml);
    reader.trim_text(true);

    let mut points = Vec::new();
    let mut placemark: Option<PlacemarkFields> = None;
    let mut data_name: Option<String> = None;
    let mut current_tag: Vec<u8> = Vec::new();

    loop {
        match reader.read_event().context("malformed KML feed")? {
            Event::Start(e) => {
                current_tag = e.local_name().as_ref().to_vec();
                match current_tag.as_slice() {
                    b"Placemark" => placemark = Some(PlacemarkFields::default()),
                    b"Data" => {
                        data_name = e
                            .try_get_attribute("name")
                            .context("malformed Data element")?
                            .and_then(|a| a.unescape_value().ok())
                            .map(|v| v.into_owned());
                    }
                    _ => {}
                }
            }
            Event::Text(t) => {
                let Some(pm) = placemark.as_mut() else {
                    continue;
                };
                let text = t.unescape().context("malformed text node")?.into_owned();
                match current_tag.as_slice() {
                    b"when" => pm.when = Some(text),
                    b"coordinates" => pm.coordinates = Some(text),
                    b"value" => match data_name.as_deref() {
                        Some("Latitude") => pm.lat = text.trim().parse().ok(),
                        Some("Longitude") => pm.lon = text.trim().parse().ok(),
                        Some("Elevation") => pm.elevation = leading_f64(&text),
                        Some("Velocity") => pm.velocity = leading_f64(&text),
                        Some("In Emergency") => {
                            pm.in_emergency = text.trim().eq_ignore_ascii_case("true")
                        }
                        Some("Text") => pm.text = Some(text),
                        _ => {}
                    },
                    _ => {}
                }
            }
            Event::End(e) => {
                current_tag.clear();
                if e.local_name().as_ref() == b"Placemark"
                    && let Some(pm) = placemark.take()
                    && let Some(point) = pm.into_point()
                {
                    points.push(point);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<kml xmlns="http://www.opengis.net/kml/2.2">
  <Document>
    <Folder>
      <Placemark>
        <name>Alice</name>
        <TimeStamp><when>2023-11-14T22:13:20Z</when></TimeStamp>
        <ExtendedData>
          <Data name="Latitude"><value>45.602952</value></Data>
          <Data name="Longitude"><value>6.249215</value></Data>
          <Data name="Elevation"><value>1389.4 m from MSL</value></Data>
          <Data name="Velocity"><value>32.5 km/h</value></Data>
          <Data name="In Emergency"><value>False</value></Data>
          <Data name="Text"><value></value></Data>
        </ExtendedData>
        <Point><coordinates>6.249215,45.602952,1389.4</coordinates></Point>
      </Placemark>
      <Placemark>
        <TimeStamp><when>2023-11-14T22:14:20Z</when></TimeStamp>
        <ExtendedData>
          <Data name="In Emergency"><value>True</value></Data>
          <Data name="Text"><value>need help</value></Data>
        </ExtendedData>
        <Point><coordinates>6.250000,45.603500,1400.0</coordinates></Point>
      </Placemark>
      <Placemark>
        <name>Route line, no timestamp</name>
      </Placemark>
    </Folder>
  </Document>
</kml>"#;

    #[test]
    fn test_parse_feed() {
        let points = parse_feed_kml(FEED).unwrap();
        assert_eq!(points.len(), 2);

        let first = &points[0];
        assert_eq!(first.time_sec, 1_700_000_000);
        assert_eq!(first.lat, 45.602952);
        assert_eq!(first.lon, 6.249215);
        assert_eq!(first.alt, 1389.4);
        assert_eq!(first.speed, Some(32.5));
        assert!(!first.emergency);
        // Empty Text must not become a protected message.
        assert_eq!(first.message, None);

        let second = &points[1];
        assert!(second.emergency);
        assert_eq!(second.message.as_deref(), Some("need help"));
        // Falls back to the Point geometry for coordinates.
        assert_eq!(second.lat, 45.6035);
        assert_eq!(second.alt, 1400.0);
    }

    #[test]
    fn test_parse_empty_feed() {
        let kml = r#"<?xml version="1.0"?><kml><Document/></kml>"#;
        assert!(parse_feed_kml(kml).unwrap().is_empty());
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert!(parse_feed_kml("<kml><unclosed").is_err());
    }

    #[test]
    fn test_account_validation() {
        let fetcher = InreachFetcher::new(
            reqwest::Client::new(),
            ProxyPool::new(reqwest::Client::new(), None),
        );
        assert!(fetcher.validate_account("https://share.garmin.com/alice"));
        assert!(fetcher.validate_account("https://eur.explore.garmin.com/Feed/Share/alice"));
        assert!(fetcher.validate_account("https://share.delorme.com/bob"));
        assert!(!fetcher.validate_account("share.garmin.com/alice"));
        assert!(!fetcher.validate_account("https://example.com/alice"));
        assert!(!fetcher.validate_account(""));
    }

    #[test]
    fn test_feed_url() {
        let url = InreachFetcher::feed_url("https://share.garmin.com/alice", 1_700_000_000);
        assert_eq!(
            url,
            "https://share.garmin.com/alice?d1=2023-11-14T22:13:20Z"
        );
    }
}
