//! Merging and trimming of live tracks.
//!
//! All operations are value-returning: the scheduler holds single ownership
//! of each pilot's current track and replaces it wholesale, so no aliasing
//! of half-mutated tracks is possible.

use crate::simplify::apply_keep_mask;
use crate::track::{FixExtra, LiveTrack, is_emergency, is_low_bat, is_ufo, is_valid, tracker_id};
use crate::track::{TrackerId, make_flags};

/// Merges two tracks into one, ordered by ascending `time_sec`.
///
/// Fixes with distinct timestamps interleave. When both sides carry a fix at
/// the same timestamp, the coordinates come from the side whose fix is
/// valid; when both or neither are valid the first argument wins. Status
/// bits are OR-combined, the tracker id follows the coordinates, and extras
/// merge field-by-field without overwriting present fields.
pub fn merge(a: &LiveTrack, b: &LiveTrack) -> LiveTrack {
    let mut result = LiveTrack::new(a.id.or(b.id), a.name.clone().or_else(|| b.name.clone()));
    let mut ia = 0usize;
    let mut ib = 0usize;
    while ia < a.len() && ib < b.len() {
        let ta = a.time_sec[ia];
        let tb = b.time_sec[ib];
        if ta < tb {
            result.push_fix_from(a, ia);
            ia += 1;
        } else if tb < ta {
            result.push_fix_from(b, ib);
            ib += 1;
        } else {
            push_resolved(&mut result, a, ia, b, ib);
            ia += 1;
            ib += 1;
        }
    }
    while ia < a.len() {
        result.push_fix_from(a, ia);
        ia += 1;
    }
    while ib < b.len() {
        result.push_fix_from(b, ib);
        ib += 1;
    }
    result
}

/// Resolves a same-timestamp collision and appends the winning fix.
fn push_resolved(result: &mut LiveTrack, a: &LiveTrack, ia: usize, b: &LiveTrack, ib: usize) {
    let flags_a = a.flags[ia];
    let flags_b = b.flags[ib];
    // Coordinates: the valid side wins, first track on a tie.
    let (winner, wi, loser, li) = if is_valid(flags_b) && !is_valid(flags_a) {
        (b, ib, a, ia)
    } else {
        (a, ia, b, ib)
    };

    let tracker = tracker_id(winner.flags[wi])
        .or_else(|| tracker_id(loser.flags[li]))
        .unwrap_or(TrackerId::Inreach);
    let flags = make_flags(
        tracker,
        is_valid(flags_a) || is_valid(flags_b),
        is_emergency(flags_a) || is_emergency(flags_b),
        is_low_bat(flags_a) || is_low_bat(flags_b),
        is_ufo(flags_a) || is_ufo(flags_b),
    );
    result.push_fix(
        winner.time_sec[wi],
        winner.lat[wi],
        winner.lon[wi],
        winner.alt[wi],
        flags,
    );

    let merged_extra = merge_extra(winner.extra.get(&wi), loser.extra.get(&li));
    if let Some(extra) = merged_extra {
        result.extra.insert(result.len() - 1, extra);
    }
}

/// Field-by-field extra merge: the primary side's fields are kept, missing
/// fields adopt the secondary's value.
fn merge_extra(primary: Option<&FixExtra>, secondary: Option<&FixExtra>) -> Option<FixExtra> {
    match (primary, secondary) {
        (None, None) => None,
        (Some(p), None) => Some(p.clone()),
        (None, Some(s)) => Some(s.clone()),
        (Some(p), Some(s)) => Some(FixExtra {
            message: p.message.clone().or_else(|| s.message.clone()),
            speed: p.speed.or(s.speed),
            gnd_alt: p.gnd_alt.or(s.gnd_alt),
        }),
    }
}

/// Returns a deep copy of `track` without the fixes older than
/// `cutoff_sec`. Extras are re-based onto the surviving indices.
pub fn remove_before(track: &LiveTrack, cutoff_sec: i64) -> LiveTrack {
    if track.time_sec.first().is_none_or(|&first| cutoff_sec <= first) {
        return track.clone();
    }
    let keep: Vec<bool> = track.time_sec.iter().map(|&t| t >= cutoff_sec).collect();
    apply_keep_mask(track, &keep)
}

/// Strips every fix attributed to `tracker` (partner-export privacy
/// filtering).
pub fn without_tracker(track: &LiveTrack, tracker: TrackerId) -> LiveTrack {
    let keep: Vec<bool> = track
        .flags
        .iter()
        .map(|&f| tracker_id(f) != Some(tracker))
        .collect();
    if keep.iter().all(|&k| k) {
        return track.clone();
    }
    apply_keep_mask(track, &keep)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::{LivePoint, track_from_points};

    fn track_at(times: &[i64], tracker: TrackerId, valid: bool) -> LiveTrack {
        let points = times
            .iter()
            .map(|&t| LivePoint {
                valid,
                ..LivePoint::new(t, t as f64, -(t as f64), 100.0 + t as f64)
            })
            .collect();
        track_from_points(points, tracker, false)
    }

    #[test]
    fn test_merge_with_empty_is_identity() {
        let track = track_at(&[10, 20, 30], TrackerId::Inreach, true);
        let empty = LiveTrack::default();
        assert_eq!(merge(&track, &empty), track);
        assert_eq!(merge(&empty, &track), track);
    }

    #[test]
    fn test_merge_interleaves_distinct_timestamps() {
        let a = track_at(&[10, 30], TrackerId::Inreach, true);
        let b = track_at(&[20, 40], TrackerId::Spot, true);
        let merged = merge(&a, &b);
        merged.check_invariants();
        assert_eq!(merged.time_sec, vec![10, 20, 30, 40]);
        assert_eq!(tracker_id(merged.flags[1]), Some(TrackerId::Spot));
        assert_eq!(tracker_id(merged.flags[2]), Some(TrackerId::Inreach));
    }

    #[test]
    fn test_merge_valid_side_supplies_coordinates() {
        // Primary has a placeholder (invalid) fix at t=20; the secondary's
        // valid Spot fix must win the collision.
        let mut a = track_at(&[10, 30], TrackerId::Inreach, true);
        let invalid = make_flags(TrackerId::Inreach, false, false, false, false);
        a = merge(
            &a,
            &{
                let mut placeholder = LiveTrack::default();
                placeholder.push_fix(20, 0.0, 0.0, 0.0, invalid);
                placeholder
            },
        );
        let b = track_at(&[20], TrackerId::Spot, true);

        for merged in [merge(&a, &b), merge(&b, &a)] {
            merged.check_invariants();
            assert_eq!(merged.time_sec, vec![10, 20, 30]);
            assert_eq!(tracker_id(merged.flags[1]), Some(TrackerId::Spot));
            assert!(is_valid(merged.flags[1]));
            assert_eq!(merged.lat[1], 20.0);
        }
    }

    #[test]
    fn test_merge_tie_prefers_first_argument() {
        let a = track_at(&[20], TrackerId::Inreach, true);
        let b = track_at(&[20], TrackerId::Spot, true);
        let merged = merge(&a, &b);
        assert_eq!(merged.len(), 1);
        assert_eq!(tracker_id(merged.flags[0]), Some(TrackerId::Inreach));
    }

    #[test]
    fn test_merge_ors_status_flags() {
        let mut a = track_at(&[20], TrackerId::Inreach, true);
        a.flags[0] = make_flags(TrackerId::Inreach, true, true, false, false);
        let mut b = track_at(&[20], TrackerId::Spot, false);
        b.flags[0] = make_flags(TrackerId::Spot, false, false, true, false);
        let merged = merge(&a, &b);
        assert!(is_valid(merged.flags[0]));
        assert!(is_emergency(merged.flags[0]));
        assert!(is_low_bat(merged.flags[0]));
        assert_eq!(tracker_id(merged.flags[0]), Some(TrackerId::Inreach));
    }

    #[test]
    fn test_merge_extras_field_by_field() {
        let mut a = track_at(&[20], TrackerId::Inreach, true);
        a.extra.insert(
            0,
            FixExtra {
                message: Some("hello".to_string()),
                ..Default::default()
            },
        );
        let mut b = track_at(&[20], TrackerId::Spot, false);
        b.extra.insert(
            0,
            FixExtra {
                message: Some("ignored".to_string()),
                speed: Some(42.0),
                ..Default::default()
            },
        );
        let merged = merge(&a, &b);
        let extra = merged.extra.get(&0).unwrap();
        // Present fields are never overwritten; missing ones are adopted.
        assert_eq!(extra.message.as_deref(), Some("hello"));
        assert_eq!(extra.speed, Some(42.0));
    }

    #[test]
    fn test_merge_name_and_id_coalesce() {
        let mut a = track_at(&[10], TrackerId::Inreach, true);
        a.name = None;
        a.id = None;
        let mut b = track_at(&[20], TrackerId::Spot, true);
        b.name = Some("alice".to_string());
        b.id = Some(7);
        let merged = merge(&a, &b);
        assert_eq!(merged.name.as_deref(), Some("alice"));
        assert_eq!(merged.id, Some(7));
    }

    #[test]
    fn test_merge_content_commutative_timestamps() {
        let a = track_at(&[10, 20, 30], TrackerId::Inreach, true);
        let b = track_at(&[15, 20, 35], TrackerId::Spot, false);
        let ab = merge(&a, &b);
        let ba = merge(&b, &a);
        assert_eq!(ab.time_sec, ba.time_sec);
        // One side valid at the collision: resolution is order-independent.
        assert_eq!(ab.lat, ba.lat);
        assert_eq!(ab.flags, ba.flags);
    }

    #[test]
    fn test_remove_before_boundaries() {
        let mut track = track_at(&[10, 20, 30], TrackerId::Inreach, true);
        track.extra.insert(1, FixExtra { speed: Some(5.0), ..Default::default() });
        track.extra.insert(2, FixExtra { speed: Some(6.0), ..Default::default() });

        assert_eq!(remove_before(&track, 10), track);
        assert_eq!(remove_before(&track, 5), track);

        let trimmed = remove_before(&track, 15);
        trimmed.check_invariants();
        assert_eq!(trimmed.time_sec, vec![20, 30]);
        assert_eq!(trimmed.extra.get(&0).unwrap().speed, Some(5.0));
        assert_eq!(trimmed.extra.get(&1).unwrap().speed, Some(6.0));

        let emptied = remove_before(&track, 31);
        assert!(emptied.is_empty());
        assert!(emptied.extra.is_empty());
    }

    #[test]
    fn test_without_tracker() {
        let a = track_at(&[10, 30], TrackerId::Inreach, true);
        let b = track_at(&[20], TrackerId::Spot, true);
        let merged = merge(&a, &b);
        let stripped = without_tracker(&merged, TrackerId::Inreach);
        stripped.check_invariants();
        assert_eq!(stripped.time_sec, vec![20]);
        assert_eq!(tracker_id(stripped.flags[0]), Some(TrackerId::Spot));
        assert_eq!(without_tracker(&merged, TrackerId::Flyme), merged);
    }
}
