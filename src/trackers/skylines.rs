//! Skylines (skylines.aero) live fetcher.
//!
//! The live API serializes series as polyline-style delta strings: each
//! value is zigzag- and base64-ish chunk-encoded relative to its
//! predecessor, per dimension. `points` carries lat/lon pairs at 1e5 fixed
//! point; `barogram_t`/`barogram_h` carry epoch seconds and altitude.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::pilots::TrackerDevice;
use crate::schedule::SchedulePolicy;
use crate::track::{LivePoint, TrackerId};
use crate::trackers::{TrackerFetcher, get_success_text};

static ACCOUNT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").unwrap());

pub struct SkylinesFetcher {
    client: reqwest::Client,
    base_url: String,
    policy: SchedulePolicy,
}

impl SkylinesFetcher {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            policy: SchedulePolicy::new(60),
        }
    }
}

#[async_trait]
impl TrackerFetcher for SkylinesFetcher {
    fn tracker_id(&self) -> TrackerId {
        TrackerId::Skylines
    }

    fn schedule(&self) -> &SchedulePolicy {
        &self.policy
    }

    fn validate_account(&self, account: &str) -> bool {
        ACCOUNT_RE.is_match(account)
    }

    async fn fetch_points(&self, device: &TrackerDevice, from_sec: i64) -> Result<Vec<LivePoint>> {
        let url = format!("{}/api/live/{}", self.base_url, device.account);
        let body = get_success_text(&self.client, &url).await?;
        let points = parse_live_json(&body)?;
        Ok(points.into_iter().filter(|p| p.time_sec >= from_sec).collect())
    }
}

#[derive(Debug, Deserialize)]
struct LiveResponse {
    #[serde(default)]
    flights: Vec<LiveFlight>,
}

#[derive(Debug, Deserialize)]
struct LiveFlight {
    points: String,
    barogram_t: String,
    barogram_h: String,
}

/// Decodes a polyline-style delta string: 5-bit chunks offset by 63,
/// zigzag-signed, one delta per dimension, cumulative per dimension.
pub fn decode_deltas(encoded: &str, dimensions: usize, factor: f64) -> Result<Vec<f64>> {
    let mut values: Vec<i64> = Vec::new();
    let mut current = 0i64;
    let mut shift = 0u32;
    for byte in encoded.bytes() {
        if !(63..=127).contains(&byte) {
            bail!("invalid polyline character {byte:#x}");
        }
        let chunk = (byte - 63) as i64;
        current |= (chunk & 0x1f) << shift;
        if chunk & 0x20 != 0 {
            shift += 5;
            continue;
        }
        // Zigzag back to signed.
        let delta = if current & 1 != 0 {
            !(current >> 1)
        } else {
            current >> 1
        };
        values.push(delta);
        current = 0;
        shift = 0;
    }
    if shift != 0 {
        bail!("truncated polyline string");
    }
    if !values.len().is_multiple_of(dimensions) {
        bail!(
            "polyline length {} not a multiple of {dimensions} dimensions",
            values.len()
        );
    }

    let mut accumulators = vec![0i64; dimensions];
    let mut out = Vec::with_capacity(values.len());
    for (i, delta) in values.into_iter().enumerate() {
        let accumulator = &mut accumulators[i % dimensions];
        *accumulator += delta;
        out.push(*accumulator as f64 / factor);
    }
    Ok(out)
}

pub fn parse_live_json(body: &str) -> Result<Vec<LivePoint>> {
    let response: LiveResponse = serde_json::from_str(body).context("malformed skylines feed")?;
    let mut points = Vec::new();
    for flight in &response.flights {
        let coords = decode_deltas(&flight.points, 2, 1e5)?;
        let times = decode_deltas(&flight.barogram_t, 1, 1.0)?;
        let heights = decode_deltas(&flight.barogram_h, 1, 1.0)?;
        let count = times.len().min(coords.len() / 2).min(heights.len());
        for i in 0..count {
            points.push(LivePoint::new(
                times[i] as i64,
                coords[2 * i],
                coords[2 * i + 1],
                heights[i],
            ));
        }
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Inverse of [`decode_deltas`], used to build test fixtures.
    fn encode_deltas(values: &[f64], dimensions: usize, factor: f64) -> String {
        let mut accumulators = vec![0i64; dimensions];
        let mut out = String::new();
        for (i, value) in values.iter().enumerate() {
            let fixed = (value * factor).round() as i64;
            let delta = fixed - accumulators[i % dimensions];
            accumulators[i % dimensions] = fixed;
            let mut zigzag = if delta < 0 { !(delta as u64) << 1 | 1 } else { (delta as u64) << 1 };
            loop {
                let mut chunk = (zigzag & 0x1f) as u8;
                zigzag >>= 5;
                if zigzag != 0 {
                    chunk |= 0x20;
                }
                out.push((chunk + 63) as char);
                if zigzag == 0 {
                    break;
                }
            }
        }
        out
    }

    #[test]
    fn test_decode_round_trip() {
        let coords = [45.602, 6.249, 45.605, 6.252, 45.61, 6.26];
        let encoded = encode_deltas(&coords, 2, 1e5);
        let decoded = decode_deltas(&encoded, 2, 1e5).unwrap();
        assert_eq!(decoded.len(), coords.len());
        for (original, decoded) in coords.iter().zip(&decoded) {
            assert!((original - decoded).abs() < 1e-5);
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_deltas("\u{7}", 1, 1.0).is_err());
        // A dangling continuation bit is truncated input.
        assert!(decode_deltas("_", 1, 1.0).is_err());
    }

    #[test]
    fn test_decode_dimension_mismatch() {
        let encoded = encode_deltas(&[1.0, 2.0, 3.0], 1, 1.0);
        assert!(decode_deltas(&encoded, 2, 1.0).is_err());
    }

    #[test]
    fn test_parse_live_json() {
        let times = [1_700_000_000.0, 1_700_000_030.0, 1_700_000_060.0];
        let coords = [45.602, 6.249, 45.605, 6.252, 45.61, 6.26];
        let heights = [1350.0, 1375.0, 1390.0];
        let body = serde_json::json!({
            "flights": [{
                "sfid": 12345,
                "points": encode_deltas(&coords, 2, 1e5),
                "barogram_t": encode_deltas(&times, 1, 1.0),
                "barogram_h": encode_deltas(&heights, 1, 1.0),
            }]
        })
        .to_string();

        let points = parse_live_json(&body).unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].time_sec, 1_700_000_000);
        assert!((points[0].lat - 45.602).abs() < 1e-5);
        assert!((points[0].lon - 6.249).abs() < 1e-5);
        assert_eq!(points[2].alt, 1390.0);
        assert!(points.iter().all(|p| p.valid));
    }

    #[test]
    fn test_parse_empty_feed() {
        assert!(parse_live_json(r#"{"flights":[]}"#).unwrap().is_empty());
        assert!(parse_live_json(r#"{}"#).unwrap().is_empty());
    }

    #[test]
    fn test_account_validation() {
        let fetcher = SkylinesFetcher::new(reqwest::Client::new(), "https://skylines.aero");
        assert!(fetcher.validate_account("123"));
        assert!(!fetcher.validate_account("12a"));
        assert!(!fetcher.validate_account(""));
    }
}
