//! Prometheus metrics exporter.
//!
//! Counters are pre-registered at zero so dashboards show series before the
//! first event occurs, and the exporter starts before the first tick to
//! avoid scraping a half-initialized recorder.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use crate::track::TrackerId;

/// Installs the recorder and its HTTP listener. Must run inside the tokio
/// runtime.
pub fn init_metrics(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus recorder")?;
    info!("metrics exporter listening on {addr}");
    initialize_tick_metrics();
    Ok(())
}

/// Registers every series the scheduler emits.
pub fn initialize_tick_metrics() {
    counter!("tick.count").absolute(0);
    counter!("tick.skipped_reentrant").absolute(0);
    counter!("tick.errors").absolute(0);
    counter!("export.errors").absolute(0);
    counter!("snapshot.errors").absolute(0);
    for tracker in TrackerId::ALL {
        counter!("fetch.devices_ok", "tracker" => tracker.name()).absolute(0);
        counter!("fetch.devices_err", "tracker" => tracker.name()).absolute(0);
        counter!("fetch.invalid_accounts", "tracker" => tracker.name()).absolute(0);
        counter!("fetch.deadline_hits", "tracker" => tracker.name()).absolute(0);
        counter!("fetch.timeouts", "tracker" => tracker.name()).absolute(0);
    }
}
