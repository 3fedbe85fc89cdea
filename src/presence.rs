//! Presence Trinity (C1)
//!
//! Reconciles device presence from three independent evidence sources: DHCP
//! leases, the OS neighbor (ARP) table, and a Wi-Fi station dump. Any
//! positive evidence from any source marks a device present; each source has
//! a distinct blind spot (§4.1) so the union is strictly more reliable than
//! any one of them alone.

use crate::config::GatewayConfig;
use crate::registry::Registry;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::process::Command;

/// One piece of presence evidence for a single MAC.
#[derive(Debug, Clone)]
pub struct Evidence {
    pub mac: String,
    pub ip: Option<String>,
    pub hostname: Option<String>,
}

/// A presence evidence source. Implementations must never panic or abort the
/// caller's cycle — a source that cannot run returns an empty result and logs
/// its own failure (§4.1 failure mode).
#[async_trait::async_trait]
pub trait PresenceSource: Send + Sync {
    /// Human-readable name used in failure logs.
    fn name(&self) -> &'static str;

    /// Collect evidence for this cycle. Errors are swallowed by the caller;
    /// implementations should still log via `tracing::warn!`.
    async fn collect(&self) -> Vec<Evidence>;
}

/// Live DHCP lease source. Parses the first candidate lease file that
/// exists; format: `<expiry-epoch> <mac> <ip> <hostname> <client-id>`.
pub struct DhcpLeaseSource {
    pub candidate_paths: Vec<std::path::PathBuf>,
}

#[async_trait::async_trait]
impl PresenceSource for DhcpLeaseSource {
    fn name(&self) -> &'static str {
        "dhcp"
    }

    async fn collect(&self) -> Vec<Evidence> {
        let Some(path) = self.candidate_paths.iter().find(|p| p.exists()) else {
            return Vec::new();
        };
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(source = "dhcp", error = %e, path = %path.display(), "lease file read failed");
                return Vec::new();
            }
        };
        parse_leases(&content)
    }
}

/// Parse dnsmasq/dhcpd lease lines, keeping only unexpired entries.
fn parse_leases(content: &str) -> Vec<Evidence> {
    let now = chrono::Utc::now().timestamp();
    let mut out = Vec::new();
    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            continue;
        }
        let Ok(expiry) = parts[0].parse::<i64>() else { continue };
        if expiry <= now {
            continue;
        }
        let mac = parts[1].to_string();
        let ip = parts[2].to_string();
        let hostname = parts.get(3).map(|s| s.to_string());
        out.push(Evidence { mac, ip: Some(ip), hostname });
    }
    out
}

/// Live ARP/neighbor-table source, invoked via `ip neigh`.
pub struct NeighborTableSource;

#[async_trait::async_trait]
impl PresenceSource for NeighborTableSource {
    fn name(&self) -> &'static str {
        "arp"
    }

    async fn collect(&self) -> Vec<Evidence> {
        let output = match Command::new("ip").args(["neigh"]).output().await {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!(source = "arp", error = %e, "ip neigh invocation failed");
                return Vec::new();
            }
        };
        if !output.status.success() {
            tracing::warn!(source = "arp", "ip neigh exited non-zero");
            return Vec::new();
        }
        parse_neigh(&String::from_utf8_lossy(&output.stdout))
    }
}

fn parse_neigh(output: &str) -> Vec<Evidence> {
    let mut out = Vec::new();
    for line in output.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }
        let Some(idx) = parts.iter().position(|p| *p == "lladdr") else { continue };
        let Some(mac) = parts.get(idx + 1) else { continue };
        let Some(state) = parts.last() else { continue };
        if *state == "FAILED" || *state == "INCOMPLETE" {
            continue;
        }
        out.push(Evidence {
            mac: mac.to_string(),
            ip: Some(parts[0].to_string()),
            hostname: None,
        });
    }
    out
}

/// Live Wi-Fi station-dump source, invoked via `iw dev <iface> station dump`.
pub struct WifiStationSource {
    pub interface: String,
}

#[async_trait::async_trait]
impl PresenceSource for WifiStationSource {
    fn name(&self) -> &'static str {
        "wifi"
    }

    async fn collect(&self) -> Vec<Evidence> {
        let output = match Command::new("iw")
            .args(["dev", &self.interface, "station", "dump"])
            .output()
            .await
        {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!(source = "wifi", error = %e, "iw station dump failed");
                return Vec::new();
            }
        };
        if !output.status.success() {
            tracing::warn!(source = "wifi", "iw station dump exited non-zero");
            return Vec::new();
        }
        parse_station_dump(&String::from_utf8_lossy(&output.stdout))
    }
}

fn parse_station_dump(output: &str) -> Vec<Evidence> {
    let mut out = Vec::new();
    for line in output.lines() {
        if !line.contains("Station") {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 2 {
            out.push(Evidence { mac: parts[1].to_string(), ip: None, hostname: None });
        }
    }
    out
}

/// A fixed, in-memory source for tests and simulation — no subprocess, no
/// filesystem.
pub struct FakeSource {
    pub label: &'static str,
    pub evidence: Vec<Evidence>,
}

#[async_trait::async_trait]
impl PresenceSource for FakeSource {
    fn name(&self) -> &'static str {
        self.label
    }

    async fn collect(&self) -> Vec<Evidence> {
        self.evidence.clone()
    }
}

/// Build the live trinity for the configured AP interface.
pub fn live_sources(config: &GatewayConfig) -> Vec<Box<dyn PresenceSource>> {
    vec![
        Box::new(DhcpLeaseSource { candidate_paths: config.dhcp_lease_paths.clone() }),
        Box::new(NeighborTableSource),
        Box::new(WifiStationSource { interface: config.ap_interface.clone() }),
    ]
}

/// Poll every source and collapse the union of evidence into one map, keyed
/// by canonical MAC, so a device seen by several sources only gets a single
/// upsert per field. Pulled apart from the registry merge so the Loop Driver
/// can run this — the only async, subprocess-touching half of C1 — before
/// taking the registry lock (§5 concurrency model).
pub async fn collect_all(sources: &[Box<dyn PresenceSource>]) -> HashMap<String, Evidence> {
    let mut merged: HashMap<String, Evidence> = HashMap::new();
    for source in sources {
        for ev in source.collect().await {
            let key = crate::registry::canonical_mac(&ev.mac);
            let slot = merged.entry(key.clone()).or_insert_with(|| Evidence {
                mac: key,
                ip: None,
                hostname: None,
            });
            if ev.ip.is_some() {
                slot.ip = ev.ip;
            }
            if ev.hostname.is_some() {
                slot.hostname = ev.hostname;
            }
        }
    }
    merged
}

/// Apply already-collected evidence into the registry. Synchronous, so it
/// can run while the caller holds the registry lock.
pub fn apply(merged: HashMap<String, Evidence>, registry: &mut Registry, now: DateTime<Utc>, initial_trust: i32) {
    for ev in merged.into_values() {
        registry.upsert_presence(&ev.mac, ev.ip.as_deref(), ev.hostname.as_deref(), now, initial_trust);
    }
}

/// Poll every source and reconcile the union of evidence into the registry
/// in one call — convenience wrapper for tests and simulation callers that
/// don't need the collect/apply split.
pub async fn reconcile(
    sources: &[Box<dyn PresenceSource>],
    registry: &mut Registry,
    now: DateTime<Utc>,
    initial_trust: i32,
) {
    let merged = collect_all(sources).await;
    apply(merged, registry, now, initial_trust);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unexpired_lease_lines() {
        let now = Utc::now().timestamp();
        let content = format!(
            "{} aa:bb:cc:dd:ee:ff 10.0.0.5 camera 01:aa:bb\n{} 11:22:33:44:55:66 10.0.0.6 *\n",
            now + 3600,
            now - 10,
        );
        let evidence = parse_leases(&content);
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].mac, "aa:bb:cc:dd:ee:ff");
        assert_eq!(evidence[0].ip.as_deref(), Some("10.0.0.5"));
    }

    #[test]
    fn parses_neigh_skipping_failed_incomplete() {
        let output = "192.168.10.5 dev wlan0 lladdr aa:bb:cc:dd:ee:ff REACHABLE\n\
                      192.168.10.6 dev wlan0 lladdr 11:22:33:44:55:66 FAILED\n\
                      192.168.10.7 dev wlan0  INCOMPLETE\n";
        let evidence = parse_neigh(output);
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].mac, "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn parses_station_dump_macs() {
        let output = "Station aa:bb:cc:dd:ee:ff (on wlan0)\n\tinactive time:\t10 ms\n";
        let evidence = parse_station_dump(output);
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].mac, "aa:bb:cc:dd:ee:ff");
    }

    #[tokio::test]
    async fn reconcile_merges_across_sources() {
        let sources: Vec<Box<dyn PresenceSource>> = vec![
            Box::new(FakeSource {
                label: "dhcp",
                evidence: vec![Evidence {
                    mac: "AA:BB:CC:DD:EE:FF".into(),
                    ip: Some("10.0.0.5".into()),
                    hostname: Some("camera".into()),
                }],
            }),
            Box::new(FakeSource {
                label: "wifi",
                evidence: vec![Evidence { mac: "aa:bb:cc:dd:ee:ff".into(), ip: None, hostname: None }],
            }),
        ];
        let mut registry = Registry::new();
        let now = Utc::now();
        reconcile(&sources, &mut registry, now, 50).await;
        assert_eq!(registry.len(), 1);
        let d = registry.get("aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(d.ip, "10.0.0.5");
        assert_eq!(d.hostname, "camera");
    }

    #[tokio::test]
    async fn one_failing_source_does_not_block_others() {
        struct FailingSource;
        #[async_trait::async_trait]
        impl PresenceSource for FailingSource {
            fn name(&self) -> &'static str {
                "failing"
            }
            async fn collect(&self) -> Vec<Evidence> {
                Vec::new()
            }
        }

        let sources: Vec<Box<dyn PresenceSource>> = vec![
            Box::new(FailingSource),
            Box::new(FakeSource {
                label: "dhcp",
                evidence: vec![Evidence {
                    mac: "aa:bb:cc:dd:ee:ff".into(),
                    ip: Some("10.0.0.5".into()),
                    hostname: None,
                }],
            }),
        ];
        let mut registry = Registry::new();
        reconcile(&sources, &mut registry, Utc::now(), 50).await;
        assert_eq!(registry.len(), 1);
    }
}
