//! Environment-driven settings.
//!
//! Everything has a default that works for local development: a directory
//! store, an in-memory bus, and the public provider endpoints.

use std::env;
use std::time::Duration;

use crate::track::TrackerId;

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// JSON document mirroring the pilot datastore.
    pub pilots_path: String,
    /// S3 bucket for snapshots and groups; unset means the local directory.
    pub s3_bucket: Option<String>,
    pub data_dir: String,
    /// NATS server for the telemetry/command bus; unset means in-memory.
    pub nats_url: Option<String>,
    pub nats_bucket: String,
    /// Elevation service base URL; unset disables ground-altitude patching.
    pub elevation_url: Option<String>,
    /// Proxy provisioner control plane; unset disables 429 failover.
    pub proxy_provisioner_url: Option<String>,
    /// Prometheus exporter port; unset disables the exporter.
    pub metrics_port: Option<u16>,

    pub tick_interval: Duration,
    pub fetch_timeout: Duration,
    /// Tracker stripped from the partner export.
    pub partner_strip: TrackerId,

    pub spot_url: String,
    pub skylines_url: String,
    pub flyme_url: String,
    pub flymaster_url: String,
}

impl Settings {
    pub fn from_env() -> Self {
        let partner_strip = env::var("LIVETRACK_PARTNER_STRIP")
            .ok()
            .and_then(|name| TrackerId::ALL.into_iter().find(|t| t.name() == name))
            .unwrap_or(TrackerId::Inreach);

        Self {
            pilots_path: env_or("LIVETRACK_PILOTS", "pilots.json"),
            s3_bucket: env::var("LIVETRACK_S3_BUCKET").ok(),
            data_dir: env_or("LIVETRACK_DATA_DIR", "/var/livetrack/data"),
            nats_url: env::var("LIVETRACK_NATS_URL").ok(),
            nats_bucket: env_or("LIVETRACK_NATS_BUCKET", "livetrack"),
            elevation_url: env::var("LIVETRACK_ELEVATION_URL").ok(),
            proxy_provisioner_url: env::var("LIVETRACK_PROXY_PROVISIONER").ok(),
            metrics_port: env::var("LIVETRACK_METRICS_PORT")
                .ok()
                .and_then(|p| p.parse().ok()),
            tick_interval: Duration::from_secs(env_parse("LIVETRACK_TICK_SEC", 60)),
            fetch_timeout: Duration::from_secs(env_parse("LIVETRACK_FETCH_TIMEOUT_SEC", 40)),
            partner_strip,
            spot_url: env_or("LIVETRACK_SPOT_URL", "https://api.findmespot.com"),
            skylines_url: env_or("LIVETRACK_SKYLINES_URL", "https://skylines.aero"),
            flyme_url: env_or("LIVETRACK_FLYME_URL", "https://xcglobe.com"),
            flymaster_url: env_or("LIVETRACK_FLYMASTER_URL", "https://lt.flymaster.net"),
        }
    }
}
