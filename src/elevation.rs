//! Batched point-to-elevation lookups.
//!
//! Ground altitude is decoration for the freshest fix of each track, so the
//! client is aggressively cached and never lets a lookup failure escalate:
//! callers get `None` and move on.

use anyhow::{Context, Result, anyhow};
use moka::future::Cache;
use serde::Deserialize;
use tracing::debug;

use crate::trackers::REQUEST_TIMEOUT;

/// Max points per upstream request.
const BATCH_SIZE: usize = 100;

/// Round coordinates to ~100m grid (0.001 degrees ≈ 111m) so that nearby
/// lookups share a cache entry.
fn round_coord_for_cache(coord: f64) -> i32 {
    (coord * 1000.0).round() as i32
}

/// Cache key for elevation lookups: (lat_millidegrees, lon_millidegrees)
type CacheKey = (i32, i32);

#[derive(Debug, Deserialize)]
struct ElevationResponse {
    elevation: Vec<f64>,
}

#[derive(Clone)]
pub struct ElevationClient {
    client: reqwest::Client,
    base_url: String,
    cache: Cache<CacheKey, Option<i32>>,
}

impl ElevationClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            cache: Cache::builder().max_capacity(250_000).build(),
        }
    }

    /// Elevations for `points` (lat, lon), in order. Unresolvable points
    /// yield `None`.
    pub async fn lookup(&self, points: &[(f64, f64)]) -> Result<Vec<Option<i32>>> {
        let mut results: Vec<Option<Option<i32>>> = vec![None; points.len()];
        let mut misses: Vec<usize> = Vec::new();

        for (index, &(lat, lon)) in points.iter().enumerate() {
            let key = (round_coord_for_cache(lat), round_coord_for_cache(lon));
            match self.cache.get(&key).await {
                Some(cached) => results[index] = Some(cached),
                None => misses.push(index),
            }
        }

        for chunk in misses.chunks(BATCH_SIZE) {
            let batch: Vec<(f64, f64)> = chunk.iter().map(|&i| points[i]).collect();
            let elevations = self.fetch_batch(&batch).await?;
            for (&index, elevation) in chunk.iter().zip(elevations) {
                let (lat, lon) = points[index];
                let key = (round_coord_for_cache(lat), round_coord_for_cache(lon));
                self.cache.insert(key, elevation).await;
                results[index] = Some(elevation);
            }
        }

        Ok(results.into_iter().map(|r| r.unwrap_or(None)).collect())
    }

    async fn fetch_batch(&self, points: &[(f64, f64)]) -> Result<Vec<Option<i32>>> {
        let latitudes: Vec<String> = points.iter().map(|p| format!("{:.6}", p.0)).collect();
        let longitudes: Vec<String> = points.iter().map(|p| format!("{:.6}", p.1)).collect();
        let url = format!(
            "{}/v1/elevation?latitude={}&longitude={}",
            self.base_url,
            latitudes.join(","),
            longitudes.join(",")
        );
        debug!("elevation lookup for {} points", points.len());

        let response = self
            .client
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("elevation request failed")?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("elevation service returned HTTP {status}"));
        }
        let parsed: ElevationResponse = response
            .json()
            .await
            .context("malformed elevation response")?;
        if parsed.elevation.len() != points.len() {
            return Err(anyhow!(
                "elevation service returned {} values for {} points",
                parsed.elevation.len(),
                points.len()
            ));
        }
        Ok(parsed
            .elevation
            .into_iter()
            .map(|e| if e.is_finite() { Some(e.round() as i32) } else { None })
            .collect())
    }
}
