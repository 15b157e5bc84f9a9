//! Temporal downsampling of live tracks.
//!
//! Simplification removes fixes that are close in time to the previously
//! retained fix, except fixes the track cannot afford to lose: its first and
//! last fix (UFO tracks excepted), emergency fixes, and fixes carrying a
//! message.

use std::collections::BTreeMap;

use crate::track::{FixExtra, LiveTrack, is_emergency};

/// Re-maps sparse extras through a keep mask, compacting indices to the
/// surviving fixes' new positions. Extras of dropped fixes are discarded.
///
/// Every structural track mutation funnels through this helper so that stale
/// indices cannot leak.
pub fn reindex_extras(
    extra: &BTreeMap<usize, FixExtra>,
    keep: &[bool],
) -> BTreeMap<usize, FixExtra> {
    let mut new_index_of = Vec::with_capacity(keep.len());
    let mut next = 0usize;
    for &kept in keep {
        new_index_of.push(if kept { Some(next) } else { None });
        if kept {
            next += 1;
        }
    }
    extra
        .iter()
        .filter_map(|(&index, value)| {
            new_index_of
                .get(index)
                .copied()
                .flatten()
                .map(|new_index| (new_index, value.clone()))
        })
        .collect()
}

/// Applies a keep mask to a track, compacting the parallel arrays and the
/// extras map.
pub fn apply_keep_mask(track: &LiveTrack, keep: &[bool]) -> LiveTrack {
    debug_assert_eq!(keep.len(), track.len());
    let mut result = LiveTrack::new(track.id, track.name.clone());
    for (index, &kept) in keep.iter().enumerate() {
        if kept {
            result.time_sec.push(track.time_sec[index]);
            result.lat.push(track.lat[index]);
            result.lon.push(track.lon[index]);
            result.alt.push(track.alt[index]);
            result.flags.push(track.flags[index]);
        }
    }
    result.extra = reindex_extras(&track.extra, keep);
    result
}

/// Downsamples `track` so that retained fixes inside `[from_sec, to_sec]`
/// (whole track by default) are at least `interval_sec` apart, subject to
/// the protected-fix exceptions. Returns the simplified track; ordering is
/// unchanged and `time_sec` stays strictly ascending.
pub fn simplify(
    track: &LiveTrack,
    interval_sec: i64,
    from_sec: Option<i64>,
    to_sec: Option<i64>,
) -> LiveTrack {
    let len = track.len();
    if len == 0 {
        return track.clone();
    }
    let from_sec = from_sec.unwrap_or(i64::MIN);
    let to_sec = to_sec.unwrap_or(i64::MAX);
    if from_sec > track.time_sec[len - 1] || to_sec < track.time_sec[0] {
        return track.clone();
    }

    let ufo = track.is_ufo();
    let mut keep = vec![true; len];
    let mut last_kept_sec = i64::MIN;
    for index in 0..len {
        let time = track.time_sec[index];
        let protected = (!ufo && (index == 0 || index == len - 1))
            || is_emergency(track.flags[index])
            || track.extra.get(&index).is_some_and(|e| e.has_message());
        let in_range = time >= from_sec && time <= to_sec;
        if !protected && in_range && time.saturating_sub(last_kept_sec) < interval_sec {
            keep[index] = false;
        } else {
            last_kept_sec = time;
        }
    }
    apply_keep_mask(track, &keep)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::{LivePoint, TrackerId, make_flags, track_from_points};

    fn uniform_track(times: &[i64]) -> LiveTrack {
        let mut track = LiveTrack::default();
        for &t in times {
            track.push_fix(t, 45.0, 6.0, 1000.0, 0);
        }
        track
    }

    #[test]
    fn test_simplify_fixture() {
        let track = uniform_track(&[1, 10, 20, 25, 30, 35, 40, 45]);
        let simplified = simplify(&track, 10, None, None);
        simplified.check_invariants();
        assert_eq!(simplified.time_sec, vec![1, 20, 30, 40, 45]);
    }

    #[test]
    fn test_simplify_empty_is_noop() {
        let simplified = simplify(&LiveTrack::default(), 10, None, None);
        assert!(simplified.is_empty());
    }

    #[test]
    fn test_simplify_range_outside_track_is_noop() {
        let track = uniform_track(&[10, 20, 30]);
        assert_eq!(simplify(&track, 60, Some(31), None), track);
        assert_eq!(simplify(&track, 60, None, Some(9)), track);
    }

    #[test]
    fn test_simplify_restricted_range() {
        let track = uniform_track(&[0, 10, 20, 30, 100, 110, 120, 130]);
        // Only the old part of the track is coarsened.
        let simplified = simplify(&track, 60, None, Some(50));
        assert_eq!(simplified.time_sec, vec![0, 100, 110, 120, 130]);
    }

    #[test]
    fn test_simplify_keeps_emergency_and_messages() {
        let mut track = uniform_track(&[0, 10, 20, 30, 40, 50]);
        track.flags[2] = make_flags(TrackerId::Spot, true, true, false, false);
        track.extra.insert(
            3,
            FixExtra {
                message: Some("need pickup".to_string()),
                ..Default::default()
            },
        );
        let simplified = simplify(&track, 100, None, None);
        simplified.check_invariants();
        assert_eq!(simplified.time_sec, vec![0, 20, 30, 50]);
        assert!(is_emergency(simplified.flags[1]));
        // Message followed the fix from index 3 to compacted index 2.
        assert_eq!(
            simplified.extra.get(&2).unwrap().message.as_deref(),
            Some("need pickup")
        );
    }

    #[test]
    fn test_simplify_ufo_track_loses_endpoint_protection() {
        let points = (0..5)
            .map(|i| LivePoint::new(i * 10, 45.0, 6.0, 0.0))
            .collect();
        let track = track_from_points(points, TrackerId::Flymaster, true);
        let simplified = simplify(&track, 100, None, None);
        // No first/last protection: one fix is enough to span the window.
        assert_eq!(simplified.time_sec, vec![0]);
    }

    #[test]
    fn test_simplify_monotonic_output() {
        let track = uniform_track(&[5, 5, 6, 9, 14, 14, 30]);
        let simplified = simplify(&track, 5, None, None);
        for pair in simplified.time_sec.windows(2) {
            assert!(pair[0] < pair[1], "not strictly ascending: {pair:?}");
        }
    }

    #[test]
    fn test_reindex_extras_drops_and_compacts() {
        let mut extra = BTreeMap::new();
        extra.insert(0, FixExtra { speed: Some(1.0), ..Default::default() });
        extra.insert(2, FixExtra { speed: Some(3.0), ..Default::default() });
        extra.insert(4, FixExtra { speed: Some(5.0), ..Default::default() });
        let keep = [true, false, false, true, true];
        let reindexed = reindex_extras(&extra, &keep);
        assert_eq!(reindexed.len(), 2);
        assert_eq!(reindexed.get(&0).unwrap().speed, Some(1.0));
        // Index 2 was dropped; index 4 compacted to 2.
        assert_eq!(reindexed.get(&2).unwrap().speed, Some(5.0));
    }
}
