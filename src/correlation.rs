//! Correlation Engine (C5)
//!
//! Consults the decoy-interaction log — owned and written by an external
//! collaborator, read only here — and escalates any Threat whose IP shows up
//! there. Runs strictly after the policy engine emits Threats and strictly
//! before enforcement (§5 ordering guarantees).

use crate::config::CorrelationConfig;
use crate::policy::Threat;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// One row of `honeypot.csv`, written by the external decoy listeners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub timestamp: String,
    pub source_ip: String,
    pub service: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub metadata: String,
}

/// Load the most recent `window` interaction records and tally by source IP.
/// Missing file: empty map. Malformed rows: skipped, not fatal — the file is
/// owned by a collaborator this crate doesn't control and may be read mid-
/// write (§9 Design Notes).
pub fn recent_activity(path: &Path, window: usize) -> HashMap<String, u32> {
    let Ok(file) = std::fs::File::open(path) else {
        return HashMap::new();
    };
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(file);
    let records: Vec<InteractionRecord> = reader
        .deserialize::<InteractionRecord>()
        .filter_map(|r| match r {
            Ok(rec) => Some(rec),
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed honeypot.csv row");
                None
            }
        })
        .collect();

    let start = records.len().saturating_sub(window);
    let mut counts: HashMap<String, u32> = HashMap::new();
    for rec in &records[start..] {
        *counts.entry(rec.source_ip.clone()).or_insert(0) += 1;
    }
    counts
}

/// Escalate each Threat whose IP appears in the recent interaction log.
pub fn correlate(threats: &mut [Threat], honeypot_csv: &Path, config: &CorrelationConfig) {
    let activity = recent_activity(honeypot_csv, config.history_window);
    if activity.is_empty() {
        return;
    }
    for threat in threats.iter_mut() {
        if let Some(count) = activity.get(&threat.ip) {
            threat.score = (threat.score + config.score_escalation as u32).min(100);
            threat.trust = (threat.trust - config.trust_penalty).max(0);
            threat.flags.set_redirected();
            let note = format!("Correlation: Anomaly + Honeypot Interaction ({count} events)");
            threat.correlation_note = Some(note);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Flags;

    fn threat(ip: &str, score: u32, trust: i32) -> Threat {
        Threat {
            ip: ip.to_string(),
            mac: "aa:bb:cc:dd:ee:ff".to_string(),
            score,
            trust,
            flags: Flags::default(),
            reason: "High Packet Rate".to_string(),
            correlation_note: None,
            anomalous: true,
        }
    }

    fn write_honeypot(dir: &std::path::Path, rows: &[(&str, &str)]) -> std::path::PathBuf {
        let path = dir.join("honeypot.csv");
        let mut content = String::from("timestamp,source_ip,service,username,password,metadata\n");
        for (ip, svc) in rows {
            content.push_str(&format!("2026-01-01 00:00:00,{ip},{svc},n/a,n/a,Protocol Emulator\n"));
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn missing_log_is_a_no_op() {
        let mut threats = vec![threat("10.0.0.9", 60, 30)];
        correlate(&mut threats, Path::new("/nonexistent/honeypot.csv"), &CorrelationConfig::default());
        assert_eq!(threats[0].score, 60);
        assert_eq!(threats[0].trust, 30);
        assert!(threats[0].correlation_note.is_none());
    }

    #[test]
    fn matching_ip_escalates_score_and_drops_trust_and_redirects() {
        let dir = std::env::temp_dir().join(format!("sentinel-gw-corr-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = write_honeypot(&dir, &[("10.0.0.9", "MQTT"), ("10.0.0.9", "CoAP"), ("10.0.0.9", "MQTT")]);

        let mut threats = vec![threat("10.0.0.9", 60, 30)];
        correlate(&mut threats, &path, &CorrelationConfig::default());

        assert_eq!(threats[0].score, 90);
        assert_eq!(threats[0].trust, 0);
        assert!(threats[0].flags.redirected);
        assert!(threats[0].correlation_note.as_ref().unwrap().contains("3 events"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn score_and_trust_are_capped_and_floored() {
        let dir = std::env::temp_dir().join(format!("sentinel-gw-corr2-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = write_honeypot(&dir, &[("10.0.0.9", "MQTT")]);

        let mut threats = vec![threat("10.0.0.9", 95, 5)];
        correlate(&mut threats, &path, &CorrelationConfig::default());
        assert_eq!(threats[0].score, 100);
        assert_eq!(threats[0].trust, 0);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn non_matching_ip_is_untouched() {
        let dir = std::env::temp_dir().join(format!("sentinel-gw-corr3-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = write_honeypot(&dir, &[("10.0.0.1", "MQTT")]);

        let mut threats = vec![threat("10.0.0.9", 60, 30)];
        correlate(&mut threats, &path, &CorrelationConfig::default());
        assert_eq!(threats[0].score, 60);
        assert_eq!(threats[0].trust, 30);

        std::fs::remove_dir_all(&dir).ok();
    }
}
