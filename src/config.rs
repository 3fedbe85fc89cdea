//! Gateway configuration
//!
//! A single typed settings record replacing the bare threshold literals that
//! the original prototype scattered across its detector, policy engine, and
//! correlation modules.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// AP interface clients associate with (Wi-Fi dump + packet capture).
    pub ap_interface: String,
    /// Directory holding `devices.json`, `behavior.csv`, `honeypot.csv`, the
    /// audit log, and evidence archives.
    pub data_dir: PathBuf,
    /// Packet capture window per cycle, in seconds.
    pub cycle_window_secs: u64,
    /// Sleep between cycles, in seconds.
    pub cycle_sleep_secs: u64,
    /// Presence thresholds.
    pub presence: PresenceConfig,
    /// Anomaly detector thresholds.
    pub detector: DetectorConfig,
    /// Trust & policy engine thresholds.
    pub policy: PolicyConfig,
    /// Correlation engine thresholds.
    pub correlation: CorrelationConfig,
    /// Candidate DHCP lease file paths, tried in order.
    pub dhcp_lease_paths: Vec<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ap_interface: "wlan0".into(),
            data_dir: PathBuf::from("data"),
            cycle_window_secs: 5,
            cycle_sleep_secs: 1,
            presence: PresenceConfig::default(),
            detector: DetectorConfig::default(),
            policy: PolicyConfig::default(),
            correlation: CorrelationConfig::default(),
            dhcp_lease_paths: vec![
                PathBuf::from("/var/lib/misc/dnsmasq.leases"),
                PathBuf::from("/var/lib/dnsmasq/dnsmasq.leases"),
                PathBuf::from("/var/lib/dhcp/dhcpd.leases"),
            ],
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a JSON file, falling back to defaults when the
    /// file is missing or malformed. Mirrors the teacher's
    /// `EdgeConfig::load` convention.
    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &Path) -> Result<(), std::io::Error> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Resolve a well-known file under the data directory.
    pub fn behavior_csv(&self) -> PathBuf {
        self.data_dir.join("behavior.csv")
    }

    /// Resolve the decoy-interaction log.
    pub fn honeypot_csv(&self) -> PathBuf {
        self.data_dir.join("honeypot.csv")
    }

    /// Resolve the registry snapshot path.
    pub fn devices_json(&self) -> PathBuf {
        self.data_dir.join("devices.json")
    }

    /// Resolve the action audit log path.
    pub fn audit_log(&self) -> PathBuf {
        self.data_dir.join("iptables_actions.log")
    }

    /// Minimum capture-window divisor, in seconds, used for packet-rate math.
    pub fn min_window_secs(&self) -> f64 {
        1.0
    }
}

/// Presence-trinity configuration (C1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// A device not seen by any source for longer than this is OFFLINE.
    pub offline_after_secs: i64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self { offline_after_secs: 30 }
    }
}

/// Anomaly detector configuration (C3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Rule-stage packet-rate threshold (packets/sec).
    pub rate_threshold_pps: f64,
    /// Rule-stage unique destination port threshold.
    pub port_threshold: usize,
    /// Score contributed by the packet-rate rule.
    pub rate_score: u32,
    /// Score contributed by the port-count rule.
    pub port_score: u32,
    /// Score contributed by the learned stage when it flags an outlier.
    pub ml_score: u32,
    /// Total score at or above which a device is anomalous.
    pub anomalous_threshold: u32,
    /// Minimum historical rows required before the learned stage trains.
    pub min_training_rows: usize,
    /// Probability (0.0-1.0) that logging an observation kicks off a retrain.
    pub retrain_probability: f64,
    /// Number of isolation trees in the forest.
    pub forest_size: usize,
    /// Sub-sample size drawn per tree.
    pub sample_size: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            rate_threshold_pps: 100.0,
            port_threshold: 20,
            rate_score: 50,
            port_score: 50,
            ml_score: 30,
            anomalous_threshold: 50,
            min_training_rows: 10,
            retrain_probability: 0.1,
            forest_size: 64,
            sample_size: 32,
        }
    }
}

/// Trust & policy engine configuration (C4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub initial_trust: i32,
    pub anomaly_penalty: i32,
    pub scan_penalty: i32,
    pub scan_port_threshold: usize,
    pub flood_penalty: i32,
    pub flood_rate_threshold: f64,
    pub good_behavior_bonus: i32,
    pub good_behavior_port_threshold: usize,
    pub redirect_below_trust: i32,
    pub isolate_below_trust: i32,
    pub quarantine_promote_above_trust: i32,
    pub quarantine_min_age_secs: i64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            initial_trust: 50,
            anomaly_penalty: 20,
            scan_penalty: 10,
            scan_port_threshold: 10,
            flood_penalty: 5,
            flood_rate_threshold: 50.0,
            good_behavior_bonus: 1,
            good_behavior_port_threshold: 5,
            redirect_below_trust: 40,
            isolate_below_trust: 20,
            quarantine_promote_above_trust: 70,
            quarantine_min_age_secs: 60,
        }
    }
}

/// Correlation engine configuration (C5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Most recent N interaction-log rows considered.
    pub history_window: usize,
    /// Score added when a threat's IP appears in the interaction log.
    pub score_escalation: i32,
    /// Trust subtracted on correlation.
    pub trust_penalty: i32,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            history_window: 50,
            score_escalation: 30,
            trust_penalty: 40,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_literals() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.detector.rate_threshold_pps, 100.0);
        assert_eq!(cfg.detector.port_threshold, 20);
        assert_eq!(cfg.policy.redirect_below_trust, 40);
        assert_eq!(cfg.policy.isolate_below_trust, 20);
        assert_eq!(cfg.policy.quarantine_promote_above_trust, 70);
        assert_eq!(cfg.policy.quarantine_min_age_secs, 60);
        assert_eq!(cfg.correlation.history_window, 50);
        assert_eq!(cfg.presence.offline_after_secs, 30);
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = GatewayConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: GatewayConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.ap_interface, back.ap_interface);
        assert_eq!(cfg.detector.forest_size, back.detector.forest_size);
    }
}
