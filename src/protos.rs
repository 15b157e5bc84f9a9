//! Binary wire format for encoded track groups.
//!
//! Hand-written prost messages: the schema is small and owning the structs
//! directly keeps the fixed-point conversions next to the field definitions.

use std::collections::HashMap;

use anyhow::Result;
use prost::Message;

use crate::codec::{COORD_MULTIPLIER, diff_decode, diff_decode_i64, diff_encode, diff_encode_i64};
use crate::track::{FixExtra, LiveTrack};

#[derive(Clone, PartialEq, Message)]
pub struct WireExtra {
    #[prost(string, optional, tag = "1")]
    pub message: Option<String>,
    #[prost(double, optional, tag = "2")]
    pub speed: Option<f64>,
    #[prost(sint32, optional, tag = "3")]
    pub gnd_alt: Option<i32>,
}

/// A delta-encoded track: `lat`/`lon` at 1e5 fixed point, `alt` at 1,
/// `time_sec` unsigned-delta so a decoded track can never regress in time.
#[derive(Clone, PartialEq, Message)]
pub struct DifferentialTrack {
    #[prost(int64, optional, tag = "1")]
    pub id: Option<i64>,
    #[prost(string, optional, tag = "2")]
    pub id_str: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub name: Option<String>,
    #[prost(sint64, repeated, tag = "4")]
    pub lat: Vec<i64>,
    #[prost(sint64, repeated, tag = "5")]
    pub lon: Vec<i64>,
    #[prost(sint64, repeated, tag = "6")]
    pub alt: Vec<i64>,
    #[prost(sint64, repeated, tag = "7")]
    pub time_sec: Vec<i64>,
    #[prost(uint32, repeated, tag = "8")]
    pub flags: Vec<u32>,
    #[prost(map = "uint32, message", tag = "9")]
    pub extra: HashMap<u32, WireExtra>,
}

/// A group of encoded tracks as published to consumers and partners.
#[derive(Clone, PartialEq, Message)]
pub struct TrackGroup {
    #[prost(message, repeated, tag = "1")]
    pub tracks: Vec<DifferentialTrack>,
    #[prost(bool, tag = "2")]
    pub incremental: bool,
    #[prost(string, repeated, tag = "3")]
    pub remote_id: Vec<String>,
}

pub fn to_differential(track: &LiveTrack) -> DifferentialTrack {
    DifferentialTrack {
        id: track.id,
        id_str: None,
        name: track.name.clone(),
        lat: diff_encode(&track.lat, COORD_MULTIPLIER, true),
        lon: diff_encode(&track.lon, COORD_MULTIPLIER, true),
        alt: diff_encode(&track.alt, 1.0, true),
        time_sec: diff_encode_i64(&track.time_sec, false),
        flags: track.flags.clone(),
        extra: track
            .extra
            .iter()
            .map(|(&index, extra)| {
                (
                    index as u32,
                    WireExtra {
                        message: extra.message.clone(),
                        speed: extra.speed,
                        gnd_alt: extra.gnd_alt,
                    },
                )
            })
            .collect(),
    }
}

pub fn from_differential(wire: &DifferentialTrack) -> LiveTrack {
    LiveTrack {
        id: wire.id,
        name: wire.name.clone(),
        time_sec: diff_decode_i64(&wire.time_sec),
        lat: diff_decode(&wire.lat, COORD_MULTIPLIER),
        lon: diff_decode(&wire.lon, COORD_MULTIPLIER),
        alt: diff_decode(&wire.alt, 1.0),
        flags: wire.flags.clone(),
        extra: wire
            .extra
            .iter()
            .map(|(&index, extra)| {
                (
                    index as usize,
                    FixExtra {
                        message: extra.message.clone(),
                        speed: extra.speed,
                        gnd_alt: extra.gnd_alt,
                    },
                )
            })
            .collect(),
    }
}

pub fn encode_group(group: &TrackGroup) -> Vec<u8> {
    group.encode_to_vec()
}

pub fn decode_group(bytes: &[u8]) -> Result<TrackGroup> {
    Ok(TrackGroup::decode(bytes)?)
}
