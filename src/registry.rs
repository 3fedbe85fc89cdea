//! Registry Store (C7)
//!
//! Holds the canonical in-memory device registry, keyed by MAC address, and
//! persists it to a JSON snapshot at the end of every cycle. Load tolerates a
//! missing or corrupt file by starting empty.

use crate::GatewayError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Canonical form for a MAC address key: lowercase, colon-separated.
pub fn canonical_mac(mac: &str) -> String {
    mac.trim().to_ascii_lowercase()
}

/// Protection flags for a device. `isolated` implies `redirected` (§3
/// invariant); this is enforced at every mutation site, not just asserted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flags {
    pub redirected: bool,
    pub isolated: bool,
    pub quarantined: bool,
}

impl Flags {
    /// Set isolated, pulling redirected along with it.
    pub fn set_isolated(&mut self) {
        self.isolated = true;
        self.redirected = true;
    }

    /// Set redirected without touching isolation.
    pub fn set_redirected(&mut self) {
        self.redirected = true;
    }

    fn invariant_holds(&self) -> bool {
        !self.isolated || self.redirected
    }
}

/// A single registry entry. Keyed externally by canonical MAC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub mac: String,
    pub ip: String,
    pub hostname: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub trust_score: i32,
    pub flags: Flags,
}

impl Device {
    /// Construct a newly-observed device with the spec's default initial
    /// state: trust 50 (or the configured initial trust), quarantined.
    pub fn new(mac: &str, ip: &str, hostname: &str, now: DateTime<Utc>, initial_trust: i32) -> Self {
        Self {
            mac: canonical_mac(mac),
            ip: ip.to_string(),
            hostname: hostname.to_string(),
            first_seen: now,
            last_seen: now,
            trust_score: initial_trust,
            flags: Flags {
                redirected: false,
                isolated: false,
                quarantined: true,
            },
        }
    }

    /// Clamp trust into [0, 100] and restore the isolated=>redirected
    /// invariant if a caller only touched one of the two flags.
    pub fn normalize(&mut self) {
        self.trust_score = self.trust_score.clamp(0, 100);
        if self.flags.isolated {
            self.flags.redirected = true;
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.first_seen
    }

    pub fn is_offline(&self, now: DateTime<Utc>, offline_after_secs: i64) -> bool {
        (now - self.last_seen).num_seconds() > offline_after_secs
    }
}

/// In-memory registry, keyed by canonical MAC. Callers are expected to hold
/// an external lock around sequences of reads+writes that must be atomic
/// (§5); `Registry` itself only guarantees that a single method call is
/// internally consistent.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    devices: HashMap<String, Device>,
}

impl Registry {
    pub fn new() -> Self {
        Self { devices: HashMap::new() }
    }

    /// Load from a JSON snapshot. Missing or corrupt files produce an empty
    /// registry rather than an error — startup must never block on a bad
    /// snapshot.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<HashMap<String, Device>>(&content) {
                Ok(devices) => Self { devices },
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "registry snapshot corrupt, starting empty");
                    Self::new()
                }
            },
            Err(_) => Self::new(),
        }
    }

    /// Persist the registry as a JSON snapshot. Writes to a temp file in the
    /// same directory and renames over the target, so a crash mid-write
    /// cannot leave a truncated `devices.json` behind.
    pub fn save(&self, path: &Path) -> Result<(), GatewayError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| GatewayError::Persistence(e.to_string()))?;
        }
        let content = serde_json::to_string_pretty(&self.devices)
            .map_err(|e| GatewayError::Persistence(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content).map_err(|e| GatewayError::Persistence(e.to_string()))?;
        std::fs::rename(&tmp, path).map_err(|e| GatewayError::Persistence(e.to_string()))
    }

    /// Upsert presence evidence for a MAC: create the device if unknown,
    /// refresh `last_seen`, and fill IP/hostname when given.
    pub fn upsert_presence(
        &mut self,
        mac: &str,
        ip: Option<&str>,
        hostname: Option<&str>,
        now: DateTime<Utc>,
        initial_trust: i32,
    ) {
        let key = canonical_mac(mac);
        let entry = self.devices.entry(key.clone()).or_insert_with(|| {
            Device::new(&key, ip.unwrap_or("0.0.0.0"), hostname.unwrap_or("unknown"), now, initial_trust)
        });
        entry.last_seen = now;
        if let Some(ip) = ip {
            entry.ip = ip.to_string();
        }
        if let Some(hostname) = hostname {
            if hostname != "unknown" {
                entry.hostname = hostname.to_string();
            }
        }
    }

    pub fn get(&self, mac: &str) -> Option<&Device> {
        self.devices.get(&canonical_mac(mac))
    }

    pub fn get_mut(&mut self, mac: &str) -> Option<&mut Device> {
        self.devices.get_mut(&canonical_mac(mac))
    }

    /// Find a device by its current IP. Used by the manual-action entrypoint
    /// (§4.8), which addresses devices by IP rather than MAC.
    pub fn find_by_ip(&self, ip: &str) -> Option<&Device> {
        self.devices.values().find(|d| d.ip == ip)
    }

    pub fn find_by_ip_mut(&mut self, ip: &str) -> Option<&mut Device> {
        self.devices.values_mut().find(|d| d.ip == ip)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.devices.values_mut()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn new_device_starts_quarantined_with_default_trust() {
        let d = Device::new("AA:BB:CC:DD:EE:FF", "10.0.0.5", "cam", now(), 50);
        assert_eq!(d.mac, "aa:bb:cc:dd:ee:ff");
        assert_eq!(d.trust_score, 50);
        assert!(d.flags.quarantined);
        assert!(!d.flags.redirected);
        assert!(!d.flags.isolated);
    }

    #[test]
    fn isolated_implies_redirected_after_normalize() {
        let mut d = Device::new("aa:bb:cc:dd:ee:ff", "10.0.0.5", "cam", now(), 50);
        d.flags.isolated = true;
        d.flags.redirected = false;
        d.normalize();
        assert!(d.flags.redirected);
    }

    #[test]
    fn trust_clamps_to_0_100() {
        let mut d = Device::new("aa:bb:cc:dd:ee:ff", "10.0.0.5", "cam", now(), 50);
        d.trust_score = 150;
        d.normalize();
        assert_eq!(d.trust_score, 100);
        d.trust_score = -40;
        d.normalize();
        assert_eq!(d.trust_score, 0);
    }

    #[test]
    fn upsert_presence_creates_then_refreshes() {
        let mut reg = Registry::new();
        let t0 = now();
        reg.upsert_presence("AA:BB:CC:DD:EE:FF", Some("10.0.0.5"), Some("cam"), t0, 50);
        assert_eq!(reg.len(), 1);

        let t1 = t0 + chrono::Duration::seconds(5);
        reg.upsert_presence("aa:bb:cc:dd:ee:ff", Some("10.0.0.6"), None, t1, 50);
        let d = reg.get("aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(d.ip, "10.0.0.6");
        assert_eq!(d.hostname, "cam");
        assert_eq!(d.last_seen, t1);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = std::env::temp_dir().join(format!("sentinel-gw-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("devices.json");

        let mut reg = Registry::new();
        reg.upsert_presence("AA:BB:CC:DD:EE:FF", Some("10.0.0.5"), Some("cam"), now(), 50);
        reg.save(&path).unwrap();

        let loaded = Registry::load(&path);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.get("aa:bb:cc:dd:ee:ff").unwrap().ip, "10.0.0.5");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_missing_file_is_empty() {
        let reg = Registry::load(Path::new("/nonexistent/does-not-exist.json"));
        assert!(reg.is_empty());
    }

    proptest::proptest! {
        /// Round-trip law (§8): Save(Registry) then Load produces an equal
        /// registry, for arbitrary trust scores and flag combinations.
        #[test]
        fn save_then_load_preserves_trust_and_flags(
            trust in 0i32..=100,
            redirected in proptest::bool::ANY,
            quarantined in proptest::bool::ANY,
        ) {
            let dir = std::env::temp_dir().join(format!("sentinel-gw-prop-{}", uuid::Uuid::new_v4()));
            std::fs::create_dir_all(&dir).unwrap();
            let path = dir.join("devices.json");

            let mut reg = Registry::new();
            reg.upsert_presence("aa:bb:cc:dd:ee:ff", Some("10.0.0.5"), Some("cam"), now(), trust);
            let d = reg.get_mut("aa:bb:cc:dd:ee:ff").unwrap();
            d.trust_score = trust;
            d.flags.redirected = redirected;
            d.flags.quarantined = quarantined;
            reg.save(&path).unwrap();

            let loaded = Registry::load(&path);
            let reloaded = loaded.get("aa:bb:cc:dd:ee:ff").unwrap();
            proptest::prop_assert_eq!(reloaded.trust_score, trust);
            proptest::prop_assert_eq!(reloaded.flags.redirected, redirected);
            proptest::prop_assert_eq!(reloaded.flags.quarantined, quarantined);

            std::fs::remove_dir_all(&dir).ok();
        }
    }
}
