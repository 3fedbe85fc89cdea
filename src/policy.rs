//! Trust & Policy Engine (C4)
//!
//! Turns this cycle's flow stats and anomaly verdict into a new trust score,
//! monotonic protection flags, and the quarantine lifecycle, for every
//! device that is currently online. Largest single component by design
//! weight — this is where most of the adaptive behavior lives.

use crate::behavior_log::{self, BehaviorRow};
use crate::config::{GatewayConfig, PolicyConfig};
use crate::detector::Detector;
use crate::flow::FlowStats;
use crate::registry::{Device, Flags, Registry};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;

/// UI-visible derived status, in descending priority order (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Status {
    Online,
    Idle,
    Suspicious,
    NewQuarantined,
    Deceived,
    Contained,
    Offline,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Online => "ONLINE",
            Status::Idle => "IDLE",
            Status::Suspicious => "SUSPICIOUS",
            Status::NewQuarantined => "NEW/QUARANTINED",
            Status::Deceived => "DECEIVED",
            Status::Contained => "CONTAINED",
            Status::Offline => "OFFLINE",
        }
    }
}

/// Project a device's display status. Highest-priority match wins; this is
/// intentionally independent of whether the device was scored this cycle.
pub fn project_status(
    device: &Device,
    is_offline: bool,
    anomalous_this_cycle: bool,
    packets_this_cycle: u64,
) -> Status {
    if is_offline {
        return Status::Offline;
    }
    if device.flags.isolated {
        return Status::Contained;
    }
    if device.flags.redirected {
        return Status::Deceived;
    }
    if device.flags.quarantined {
        return Status::NewQuarantined;
    }
    if anomalous_this_cycle {
        return Status::Suspicious;
    }
    if packets_this_cycle == 0 {
        return Status::Idle;
    }
    Status::Online
}

/// A cycle-scoped threat, consumed by correlation (C5) and enforcement (C6).
#[derive(Debug, Clone)]
pub struct Threat {
    pub ip: String,
    pub mac: String,
    pub score: u32,
    pub trust: i32,
    pub flags: Flags,
    pub reason: String,
    pub correlation_note: Option<String>,
    /// Whether the detector called this device anomalous *this* cycle, as
    /// opposed to being carried in only because it was already redirected.
    pub anomalous: bool,
}

/// Apply the trust-delta table (§4.4) to a prior score. Caller clamps.
fn apply_deltas(trust: i32, anomalous: bool, unique_ports: usize, packet_rate: f64, cfg: &PolicyConfig) -> i32 {
    let mut t = trust;
    if anomalous {
        t -= cfg.anomaly_penalty;
    }
    if unique_ports > cfg.scan_port_threshold {
        t -= cfg.scan_penalty;
    }
    if packet_rate > cfg.flood_rate_threshold {
        t -= cfg.flood_penalty;
    }
    if !anomalous && unique_ports < cfg.good_behavior_port_threshold {
        t += cfg.good_behavior_bonus;
    }
    t
}

/// Flags only ever gain bits within a cycle — clearing requires the
/// quarantine-lift rule or an explicit operator action (§4.4).
fn derive_flags(flags: &mut Flags, trust: i32, cfg: &PolicyConfig) {
    if trust < cfg.redirect_below_trust {
        flags.set_redirected();
    }
    if trust < cfg.isolate_below_trust {
        flags.set_isolated();
    }
}

/// Promote out of quarantine once both trust and age conditions hold.
fn maybe_promote(device: &mut Device, now: DateTime<Utc>, cfg: &PolicyConfig) {
    if device.flags.quarantined
        && device.trust_score > cfg.quarantine_promote_above_trust
        && device.age(now).num_seconds() >= cfg.quarantine_min_age_secs
    {
        device.flags.quarantined = false;
    }
}

/// Run the policy engine over every online device, returning this cycle's
/// Threat set. Offline devices are untouched: not scored, not enforced, flags
/// left exactly as they were (§4.4 offline policy).
pub fn evaluate_cycle(
    registry: &mut Registry,
    flow_stats: &HashMap<String, FlowStats>,
    detector: &Detector,
    config: &GatewayConfig,
    now: DateTime<Utc>,
    window_secs: f64,
) -> Vec<Threat> {
    let mut threats = Vec::new();
    let window_secs = window_secs.max(config.min_window_secs());

    for device in registry.iter_mut() {
        if device.is_offline(now, config.presence.offline_after_secs) {
            continue;
        }

        let stats = flow_stats.get(&device.mac).cloned().unwrap_or_default();
        let packet_rate = stats.packets as f64 / window_secs;
        let unique_ports = stats.unique_ports();
        let verdict = detector.score(packet_rate, unique_ports);

        let was_redirected = device.flags.redirected;

        device.trust_score =
            apply_deltas(device.trust_score, verdict.anomalous, unique_ports, packet_rate, &config.policy);
        device.normalize();
        derive_flags(&mut device.flags, device.trust_score, &config.policy);
        device.normalize();
        maybe_promote(device, now, &config.policy);

        let row = BehaviorRow {
            timestamp: now,
            ip: device.ip.clone(),
            mac: device.mac.clone(),
            packet_rate,
            packets: stats.packets,
            unique_ports,
            score: verdict.score,
            label: verdict.anomalous,
        };
        detector.observe(row, &config.behavior_csv());

        if verdict.anomalous || was_redirected {
            let reason = if verdict.reasons.is_empty() {
                "Flagged: previously redirected".to_string()
            } else {
                verdict.reasons.join(", ")
            };
            threats.push(Threat {
                ip: device.ip.clone(),
                mac: device.mac.clone(),
                score: verdict.score,
                trust: device.trust_score,
                flags: device.flags,
                reason,
                correlation_note: None,
                anomalous: verdict.anomalous,
            });
        }
    }

    threats
}

/// Append one behavior row without going through the full cycle — used by
/// tests and by callers that already hold the device/stats pair.
pub fn log_behavior_row(path: &Path, row: &BehaviorRow) -> std::io::Result<()> {
    behavior_log::append(path, row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectorConfig;
    use crate::registry::canonical_mac;
    use std::collections::HashSet;

    fn device(trust: i32, quarantined: bool, age_secs: i64) -> Device {
        let now = Utc::now();
        let mut d = Device::new("aa:bb:cc:dd:ee:ff", "10.0.0.5", "cam", now - chrono::Duration::seconds(age_secs), trust);
        d.trust_score = trust;
        d.flags.quarantined = quarantined;
        d.last_seen = now;
        d
    }

    #[test]
    fn trust_never_leaves_0_100_band() {
        let cfg = PolicyConfig::default();
        let mut t = 100;
        for _ in 0..20 {
            t = apply_deltas(t, true, 99, 999.0, &cfg).clamp(0, 100);
        }
        assert!((0..=100).contains(&t));
    }

    #[test]
    fn anomalous_device_crosses_redirect_and_isolate_thresholds() {
        let cfg = PolicyConfig::default();
        let mut flags = Flags::default();
        let trust = apply_deltas(50, true, 99, 999.0, &cfg).clamp(0, 100);
        derive_flags(&mut flags, trust, &cfg);
        assert!(trust < cfg.isolate_below_trust || trust < cfg.redirect_below_trust);
    }

    #[test]
    fn isolated_implies_redirected_via_flags_api() {
        let mut flags = Flags::default();
        let cfg = PolicyConfig { isolate_below_trust: 99, redirect_below_trust: 99, ..PolicyConfig::default() };
        derive_flags(&mut flags, 0, &cfg);
        assert!(flags.isolated);
        assert!(flags.redirected);
    }

    #[test]
    fn quarantine_requires_both_trust_and_age() {
        let cfg = PolicyConfig::default();
        let mut d = device(80, true, 10);
        maybe_promote(&mut d, Utc::now(), &cfg);
        assert!(d.flags.quarantined, "too young to promote despite high trust");

        let mut d2 = device(80, true, 120);
        maybe_promote(&mut d2, Utc::now(), &cfg);
        assert!(!d2.flags.quarantined);
    }

    #[test]
    fn offline_device_is_skipped_entirely() {
        let mut registry = Registry::new();
        let now = Utc::now();
        registry.upsert_presence("aa:bb:cc:dd:ee:ff", Some("10.0.0.5"), Some("cam"), now - chrono::Duration::seconds(100), 50);
        let pre_trust = registry.get("aa:bb:cc:dd:ee:ff").unwrap().trust_score;

        let config = GatewayConfig::default();
        let detector = Detector::rule_only(DetectorConfig::default());
        let stats = HashMap::new();
        let threats = evaluate_cycle(&mut registry, &stats, &detector, &config, now, 5.0);

        assert!(threats.is_empty());
        assert_eq!(registry.get("aa:bb:cc:dd:ee:ff").unwrap().trust_score, pre_trust);
    }

    #[test]
    fn status_priority_order() {
        let mut d = device(50, false, 100);
        assert_eq!(project_status(&d, true, true, 10).as_str(), "OFFLINE");
        d.flags.isolated = true;
        d.flags.redirected = true;
        assert_eq!(project_status(&d, false, false, 10).as_str(), "CONTAINED");
        d.flags.isolated = false;
        assert_eq!(project_status(&d, false, false, 10).as_str(), "DECEIVED");
        d.flags.redirected = false;
        d.flags.quarantined = true;
        assert_eq!(project_status(&d, false, false, 10).as_str(), "NEW/QUARANTINED");
        d.flags.quarantined = false;
        assert_eq!(project_status(&d, false, true, 10).as_str(), "SUSPICIOUS");
        assert_eq!(project_status(&d, false, false, 0).as_str(), "IDLE");
        assert_eq!(project_status(&d, false, false, 10).as_str(), "ONLINE");
    }

    proptest::proptest! {
        /// Invariant (§8): trust_score never leaves [0, 100] regardless of
        /// how many deltas are folded in, or in what order.
        #[test]
        fn trust_stays_in_band_under_arbitrary_deltas(
            anomalous_seq in proptest::collection::vec(proptest::bool::ANY, 0..30),
            start in 0i32..=100,
        ) {
            let cfg = PolicyConfig::default();
            let mut t = start;
            for anomalous in anomalous_seq {
                t = apply_deltas(t, anomalous, 99, 999.0, &cfg).clamp(0, 100);
            }
            proptest::prop_assert!((0..=100).contains(&t));
        }

        /// Invariant (§8): isolated implies redirected, for any trust value
        /// derive_flags is handed.
        #[test]
        fn isolated_always_implies_redirected(trust in -50i32..150) {
            let cfg = PolicyConfig::default();
            let mut flags = Flags::default();
            derive_flags(&mut flags, trust, &cfg);
            proptest::prop_assert!(!flags.isolated || flags.redirected);
        }
    }

    #[test]
    fn threat_emitted_for_prior_redirected_even_if_benign_this_cycle() {
        let mut registry = Registry::new();
        let now = Utc::now();
        registry.upsert_presence("aa:bb:cc:dd:ee:ff", Some("10.0.0.5"), Some("cam"), now, 50);
        registry.get_mut(&canonical_mac("aa:bb:cc:dd:ee:ff")).unwrap().flags.set_redirected();

        let config = GatewayConfig::default();
        let detector = Detector::rule_only(DetectorConfig::default());
        let mut stats = HashMap::new();
        stats.insert(
            canonical_mac("aa:bb:cc:dd:ee:ff"),
            FlowStats { packets: 2, ports: HashSet::from([80]) },
        );
        let threats = evaluate_cycle(&mut registry, &stats, &detector, &config, now, 5.0);
        assert_eq!(threats.len(), 1);
    }
}
