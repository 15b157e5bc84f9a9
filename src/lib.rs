//! livetrack - live GPS track aggregation service.
//!
//! Polls third-party tracker providers (InReach, Spot, Skylines, Flyme,
//! Flymaster) on a fixed tick, merges their positions into one live track
//! per pilot, trims and downsamples for retention, and publishes compact
//! delta-encoded track groups.

pub mod bus;
pub mod codec;
pub mod config;
pub mod elevation;
pub mod merge;
pub mod metrics;
pub mod pilots;
pub mod protos;
pub mod proxy;
pub mod schedule;
pub mod scheduler;
pub mod simplify;
pub mod storage;
pub mod track;
pub mod trackers;

pub use merge::{merge, remove_before, without_tracker};
pub use simplify::simplify;
pub use track::{FixExtra, LivePoint, LiveTrack, TrackerId};
