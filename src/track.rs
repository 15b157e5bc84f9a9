use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How long fixes are kept in a live track.
pub const LIVE_RETENTION_SEC: i64 = 24 * 3600;

/// Finest simplification interval, applied over the whole track every tick.
pub const LIVE_MINIMAL_INTERVAL_SEC: i64 = 30;

/// Coarser interval applied to the part of the track older than
/// [`LIVE_AGE_OLD_SEC`].
pub const LIVE_OLD_INTERVAL_SEC: i64 = 120;

/// Age after which fixes are downsampled at [`LIVE_OLD_INTERVAL_SEC`].
pub const LIVE_AGE_OLD_SEC: i64 = 3 * 3600;

/// Window covered by the incremental update group.
pub const INCREMENTAL_SEC: i64 = 3600;

const TRACKER_ID_MASK: u32 = 0x1f;
const FLAG_VALID: u32 = 1 << 5;
const FLAG_EMERGENCY: u32 = 1 << 6;
const FLAG_LOW_BAT: u32 = 1 << 7;
const FLAG_UFO: u32 = 1 << 8;

/// External tracking providers. The discriminant is stored in the low 5 bits
/// of the per-fix flags (0 is reserved).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TrackerId {
    Inreach = 1,
    Spot = 2,
    Skylines = 3,
    Flyme = 4,
    Flymaster = 5,
}

impl TrackerId {
    pub const ALL: [TrackerId; 5] = [
        TrackerId::Inreach,
        TrackerId::Spot,
        TrackerId::Skylines,
        TrackerId::Flyme,
        TrackerId::Flymaster,
    ];

    pub fn from_u8(value: u8) -> Option<TrackerId> {
        match value {
            1 => Some(TrackerId::Inreach),
            2 => Some(TrackerId::Spot),
            3 => Some(TrackerId::Skylines),
            4 => Some(TrackerId::Flyme),
            5 => Some(TrackerId::Flymaster),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TrackerId::Inreach => "inreach",
            TrackerId::Spot => "spot",
            TrackerId::Skylines => "skylines",
            TrackerId::Flyme => "flyme",
            TrackerId::Flymaster => "flymaster",
        }
    }
}

impl std::fmt::Display for TrackerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Numeric tracker id packed in the low bits of a fix's flags.
pub fn tracker_id(flags: u32) -> Option<TrackerId> {
    TrackerId::from_u8((flags & TRACKER_ID_MASK) as u8)
}

pub fn is_valid(flags: u32) -> bool {
    flags & FLAG_VALID != 0
}

pub fn is_emergency(flags: u32) -> bool {
    flags & FLAG_EMERGENCY != 0
}

pub fn is_low_bat(flags: u32) -> bool {
    flags & FLAG_LOW_BAT != 0
}

pub fn is_ufo(flags: u32) -> bool {
    flags & FLAG_UFO != 0
}

/// Packs a tracker id and status bits into a fix's flags word.
pub fn make_flags(
    tracker: TrackerId,
    valid: bool,
    emergency: bool,
    low_bat: bool,
    ufo: bool,
) -> u32 {
    let mut flags = tracker as u32;
    if valid {
        flags |= FLAG_VALID;
    }
    if emergency {
        flags |= FLAG_EMERGENCY;
    }
    if low_bat {
        flags |= FLAG_LOW_BAT;
    }
    if ufo {
        flags |= FLAG_UFO;
    }
    flags
}

/// Sparse per-fix supplemental data. Only a minority of fixes carry any of
/// these fields, so tracks key them by fix index instead of storing a dense
/// parallel array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixExtra {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gnd_alt: Option<i32>,
}

impl FixExtra {
    pub fn is_empty(&self) -> bool {
        self.message.is_none() && self.speed.is_none() && self.gnd_alt.is_none()
    }

    pub fn has_message(&self) -> bool {
        self.message.as_deref().is_some_and(|m| !m.is_empty())
    }
}

/// One pilot's live track: five parallel arrays plus sparse extras.
///
/// `time_sec` is non-decreasing; all arrays share one length; every key of
/// `extra` indexes a live fix. The merge/simplify/trim operations in
/// [`crate::merge`] and [`crate::simplify`] maintain these invariants.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveTrack {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub time_sec: Vec<i64>,
    pub lat: Vec<f64>,
    pub lon: Vec<f64>,
    pub alt: Vec<f64>,
    pub flags: Vec<u32>,
    pub extra: BTreeMap<usize, FixExtra>,
}

impl LiveTrack {
    pub fn new(id: Option<i64>, name: Option<String>) -> Self {
        Self {
            id,
            name,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.time_sec.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time_sec.is_empty()
    }

    /// Timestamp of the most recent fix.
    pub fn last_fix_sec(&self) -> Option<i64> {
        self.time_sec.last().copied()
    }

    /// A track is a UFO track when every fix carries the UFO bit. Such
    /// tracks lose the first/last-fix protection during simplification.
    pub fn is_ufo(&self) -> bool {
        !self.is_empty() && self.flags.iter().all(|&f| is_ufo(f))
    }

    pub fn push_fix(&mut self, time_sec: i64, lat: f64, lon: f64, alt: f64, flags: u32) {
        self.time_sec.push(time_sec);
        self.lat.push(lat);
        self.lon.push(lon);
        self.alt.push(alt);
        self.flags.push(flags);
    }

    /// Copies the fix at `index` of `other` onto the end of this track,
    /// carrying its extra entry along.
    pub fn push_fix_from(&mut self, other: &LiveTrack, index: usize) {
        self.push_fix(
            other.time_sec[index],
            other.lat[index],
            other.lon[index],
            other.alt[index],
            other.flags[index],
        );
        if let Some(extra) = other.extra.get(&index) {
            self.extra.insert(self.len() - 1, extra.clone());
        }
    }

    /// Asserts the structural invariants. Cheap enough to call from tests
    /// after every mutating operation.
    pub fn check_invariants(&self) {
        let n = self.time_sec.len();
        assert_eq!(self.lat.len(), n, "lat length mismatch");
        assert_eq!(self.lon.len(), n, "lon length mismatch");
        assert_eq!(self.alt.len(), n, "alt length mismatch");
        assert_eq!(self.flags.len(), n, "flags length mismatch");
        for (&index, extra) in &self.extra {
            assert!(index < n, "extra index {index} out of bounds (len {n})");
            assert!(!extra.is_empty(), "empty extra entry at {index}");
        }
        for pair in self.time_sec.windows(2) {
            assert!(pair[0] <= pair[1], "time_sec regressed: {pair:?}");
        }
    }
}

/// One normalized provider position, before it is folded into a track.
#[derive(Debug, Clone, PartialEq)]
pub struct LivePoint {
    pub time_sec: i64,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub valid: bool,
    pub emergency: bool,
    pub low_bat: bool,
    pub speed: Option<f64>,
    pub message: Option<String>,
}

impl LivePoint {
    pub fn new(time_sec: i64, lat: f64, lon: f64, alt: f64) -> Self {
        Self {
            time_sec,
            lat,
            lon,
            alt,
            valid: true,
            emergency: false,
            low_bat: false,
            speed: None,
            message: None,
        }
    }
}

/// Builds a track from provider points: sorts by time, drops exact duplicate
/// timestamps (last point wins), stamps the tracker id into the flags.
pub fn track_from_points(
    mut points: Vec<LivePoint>,
    tracker: TrackerId,
    ufo: bool,
) -> LiveTrack {
    points.sort_by_key(|p| p.time_sec);
    let mut track = LiveTrack::default();
    for point in points {
        if track.last_fix_sec() == Some(point.time_sec) {
            // Same-timestamp points from one feed: keep the later-parsed one.
            let last = track.len() - 1;
            track.time_sec.pop();
            track.lat.pop();
            track.lon.pop();
            track.alt.pop();
            track.flags.pop();
            track.extra.remove(&last);
        }
        let flags = make_flags(tracker, point.valid, point.emergency, point.low_bat, ufo);
        track.push_fix(point.time_sec, point.lat, point.lon, point.alt, flags);
        let extra = FixExtra {
            message: point.message.filter(|m| !m.is_empty()),
            speed: point.speed,
            gnd_alt: None,
        };
        if !extra.is_empty() {
            track.extra.insert(track.len() - 1, extra);
        }
    }
    track
}
