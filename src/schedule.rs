//! Adaptive per-device fetch scheduling.
//!
//! Two signals drive the next fetch time: the consecutive-error count backs
//! off geometrically misbehaving or broken accounts, and the age of the last
//! known fix widens the interval for devices that are clearly idle. Both are
//! expressed as ordered rule tables evaluated top-to-bottom (largest
//! threshold first) so the policy is testable and tunable per provider.

use rand::Rng;

/// One `threshold -> delay` rule.
#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub threshold: i64,
    pub delay_sec: i64,
}

const fn rule(threshold: i64, delay_sec: i64) -> Rule {
    Rule {
        threshold,
        delay_sec,
    }
}

/// Error back-off shared by all providers: quick retries for transient
/// hiccups, hours to a day for accounts that keep failing.
pub const ERROR_RULES: [Rule; 5] = [
    rule(30, 24 * 3600),
    rule(20, 3600),
    rule(10, 3 * 60),
    rule(3, 60),
    rule(1, 0),
];

/// Staleness widening shared by all providers: tight while the device is
/// moving, tens of minutes once it has been silent for hours, 30-45 min
/// for devices idle for weeks or months.
pub const STALENESS_RULES: [Rule; 5] = [
    rule(6 * 30 * 24 * 3600, 45 * 60),
    rule(30 * 24 * 3600, 30 * 60),
    rule(24 * 3600, 15 * 60),
    rule(3 * 3600, 10 * 60),
    rule(30 * 60, 2 * 60),
];

#[derive(Debug, Clone)]
pub struct SchedulePolicy {
    /// Floor between two fetches of one device, provider etiquette.
    pub base_delay_sec: i64,
    pub error_rules: &'static [Rule],
    pub staleness_rules: &'static [Rule],
}

impl SchedulePolicy {
    pub const fn new(base_delay_sec: i64) -> Self {
        Self {
            base_delay_sec,
            error_rules: &ERROR_RULES,
            staleness_rules: &STALENESS_RULES,
        }
    }

    /// Seconds to wait before the next fetch of a device, given its
    /// consecutive-error count and the age of its last known fix
    /// (`None` when the device never produced one).
    pub fn next_fetch_after_sec(
        &self,
        num_consecutive_errors: u32,
        staleness_sec: Option<i64>,
    ) -> i64 {
        let error_delay = first_match(self.error_rules, num_consecutive_errors as i64);
        let staleness_delay = staleness_sec
            .map(|age| first_match(self.staleness_rules, age))
            .unwrap_or(0);
        let delay = self.base_delay_sec.max(error_delay).max(staleness_delay);
        jitter(delay)
    }
}

fn first_match(rules: &[Rule], value: i64) -> i64 {
    rules
        .iter()
        .find(|r| value >= r.threshold)
        .map(|r| r.delay_sec)
        .unwrap_or(0)
}

/// +/-20% so that a fleet of devices configured together does not hit a
/// provider in lockstep.
fn jitter(delay_sec: i64) -> i64 {
    let factor: f64 = rand::rng().random_range(0.8..1.2);
    (delay_sec as f64 * factor).round() as i64
}
