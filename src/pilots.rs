//! Pilot registry and configuration sync.
//!
//! The authoritative account datastore lives outside this service; the
//! registry only mirrors it. Configuration flows one way (datastore to
//! registry) and never touches live tracks, so a sync in the middle of the
//! day cannot wipe anyone's trace.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::track::{LiveTrack, TrackerId};

/// Per-provider fetch bookkeeping for one pilot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerState {
    pub account: String,
    /// Timestamp of the most recent fix this provider ever returned.
    pub last_fix_sec: i64,
    pub last_fetch_sec: i64,
    pub next_fetch_sec: i64,
    pub num_errors: u32,
    pub num_consecutive_errors: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pilot {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    /// Whether the pilot opted into partner exports.
    pub share: bool,
    /// UFO (unregistered/drone) devices lose first/last-fix protection.
    pub is_ufo: bool,
    pub track: LiveTrack,
    pub trackers: BTreeMap<TrackerId, TrackerState>,
}

impl Pilot {
    fn from_config(config: &PilotConfig) -> Self {
        Self {
            id: config.id,
            name: config.name.clone(),
            enabled: config.enabled,
            share: config.share,
            is_ufo: config.is_ufo,
            track: LiveTrack::new(Some(config.id), Some(config.name.clone())),
            trackers: BTreeMap::new(),
        }
    }
}

/// One pilot record as the datastore hands it out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PilotConfig {
    pub id: i64,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub share: bool,
    #[serde(default)]
    pub is_ufo: bool,
    /// Provider name to account string, e.g. `"spot": "0abc..."`.
    #[serde(default)]
    pub accounts: HashMap<String, String>,
    /// Seconds since epoch of the record's last modification.
    #[serde(default)]
    pub updated_sec: i64,
}

fn default_true() -> bool {
    true
}

/// Read access to the authoritative pilot/tracker configuration.
#[async_trait]
pub trait PilotSource: Send + Sync {
    async fn full_sync(&self) -> Result<Vec<PilotConfig>>;
    /// Records modified after `since_sec`.
    async fn incremental_sync(&self, since_sec: i64) -> Result<Vec<PilotConfig>>;
}

/// File-backed source: a JSON array of [`PilotConfig`]. The production
/// datastore is an external collaborator; a document on disk is enough to
/// drive the service and its tests.
pub struct FilePilotSource {
    path: PathBuf,
}

impl FilePilotSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PilotSource for FilePilotSource {
    async fn full_sync(&self) -> Result<Vec<PilotConfig>> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("failed to read pilot config {:?}", self.path))?;
        let configs: Vec<PilotConfig> =
            serde_json::from_slice(&bytes).context("malformed pilot config document")?;
        Ok(configs)
    }

    async fn incremental_sync(&self, since_sec: i64) -> Result<Vec<PilotConfig>> {
        let configs = self.full_sync().await?;
        Ok(configs
            .into_iter()
            .filter(|c| c.updated_sec > since_sec)
            .collect())
    }
}

/// In-memory pilot map, owned by the scheduler. All mutation happens
/// synchronously inside a tick.
#[derive(Default)]
pub struct PilotRegistry {
    pilots: HashMap<i64, Pilot>,
}

impl PilotRegistry {
    pub fn len(&self) -> usize {
        self.pilots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pilots.is_empty()
    }

    pub fn get(&self, id: i64) -> Option<&Pilot> {
        self.pilots.get(&id)
    }

    pub fn get_mut(&mut self, id: i64) -> Option<&mut Pilot> {
        self.pilots.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pilot> {
        self.pilots.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Pilot> {
        self.pilots.values_mut()
    }

    pub fn insert(&mut self, pilot: Pilot) {
        self.pilots.insert(pilot.id, pilot);
    }

    /// Applies a batch of datastore records. `full` replaces the whole
    /// roster (pilots missing from the batch are dropped); a partial batch
    /// only upserts. Live tracks and fetch bookkeeping survive updates.
    pub fn apply_configs(&mut self, configs: &[PilotConfig], full: bool) {
        if full {
            let ids: std::collections::HashSet<i64> = configs.iter().map(|c| c.id).collect();
            let before = self.pilots.len();
            self.pilots.retain(|id, _| ids.contains(id));
            let dropped = before - self.pilots.len();
            if dropped > 0 {
                info!("dropped {dropped} pilots no longer in the datastore");
            }
        }
        for config in configs {
            let pilot = self
                .pilots
                .entry(config.id)
                .or_insert_with(|| Pilot::from_config(config));
            pilot.name = config.name.clone();
            pilot.enabled = config.enabled;
            pilot.share = config.share;
            pilot.is_ufo = config.is_ufo;
            pilot.track.name = Some(config.name.clone());

            // Reconcile tracker accounts: new or changed accounts reset the
            // fetch bookkeeping, removed accounts disappear.
            let mut seen = Vec::new();
            for (provider, account) in &config.accounts {
                let Some(tracker) = TrackerId::ALL.iter().find(|t| t.name() == provider) else {
                    warn!("pilot {}: unknown tracker provider {provider:?}", config.id);
                    continue;
                };
                seen.push(*tracker);
                let state = pilot.trackers.entry(*tracker).or_default();
                if state.account != *account {
                    debug!("pilot {}: new {tracker} account", config.id);
                    *state = TrackerState {
                        account: account.clone(),
                        ..Default::default()
                    };
                }
            }
            pilot.trackers.retain(|tracker, _| seen.contains(tracker));
        }
    }

    /// Devices of one provider that are enabled and due for a fetch.
    pub fn devices_due(&self, tracker: TrackerId, now_sec: i64) -> Vec<TrackerDevice> {
        self.pilots
            .values()
            .filter(|p| p.enabled)
            .filter_map(|p| {
                let state = p.trackers.get(&tracker)?;
                if state.next_fetch_sec > now_sec {
                    return None;
                }
                Some(TrackerDevice {
                    pilot_id: p.id,
                    account: state.account.clone(),
                    last_fix_sec: state.last_fix_sec,
                    is_ufo: p.is_ufo,
                })
            })
            .collect()
    }
}

/// A read-only snapshot of one device handed to a fetcher for the duration
/// of a tick's fan-out. Fetchers never see the registry itself.
#[derive(Debug, Clone)]
pub struct TrackerDevice {
    pub pilot_id: i64,
    pub account: String,
    pub last_fix_sec: i64,
    pub is_ufo: bool,
}
