//! Loop Driver (C8)
//!
//! Ticks the adaptive defense pipeline every cycle and exposes the
//! snapshot/manual-action entrypoints the dashboard router (C11) calls into.
//! The only writer of flags and trust during automated operation; manual
//! actions are the other writer, serialized through the same lock.

use crate::config::GatewayConfig;
use crate::correlation;
use crate::detector::Detector;
use crate::enforcer::Enforcer;
use crate::flow::{self, PacketSource};
use crate::policy;
use crate::presence::{self, PresenceSource};
use crate::registry::{Flags, Registry};
use crate::GatewayError;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::Serialize;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

const ALERT_RING_CAPACITY: usize = 50;
const HONEYPOT_TAIL: usize = 20;

/// One row of the dashboard's device table (§6 contract).
#[derive(Debug, Clone, Serialize)]
pub struct DeviceView {
    pub ip: String,
    pub mac: String,
    pub hostname: String,
    pub packets: u64,
    pub ports: usize,
    pub status: &'static str,
    pub trust_score: i32,
    pub last_seen: DateTime<Utc>,
    pub flags: Flags,
}

/// One entry in the bounded alert ring.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub timestamp: DateTime<Utc>,
    pub ip: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub action: String,
}

/// The read-only view the dashboard router consumes. Replaced wholesale
/// every cycle so a concurrent reader never observes a torn list (§4.8).
#[derive(Debug, Clone, Serialize, Default)]
pub struct Snapshot {
    pub devices: Vec<DeviceView>,
    pub alerts: Vec<Alert>,
    pub honeypot: Vec<correlation::InteractionRecord>,
}

/// Actions the dashboard's manual-override entrypoint accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualAction {
    Isolate,
    Block,
    Kick,
    Quarantine,
    Redirect,
    Release,
    Lockdown,
}

pub struct LoopDriver {
    config: Arc<RwLock<GatewayConfig>>,
    sources: Vec<Box<dyn PresenceSource>>,
    packet_source: Arc<dyn PacketSource>,
    enforcer: Enforcer,
    detector: Detector,
    // Registry and flow-stats reads/writes share this lock (§5): the loop
    // thread holds it for the whole analyze phase, manual actions take it
    // for the duration of their single mutation.
    registry: ReentrantMutex<RefCell<Registry>>,
    alerts: Mutex<VecDeque<Alert>>,
    snapshot: RwLock<Arc<Snapshot>>,
    metrics: Arc<crate::audit::ProcessMetrics>,
}

impl LoopDriver {
    pub fn new(
        config: Arc<RwLock<GatewayConfig>>,
        sources: Vec<Box<dyn PresenceSource>>,
        packet_source: Arc<dyn PacketSource>,
        enforcer: Enforcer,
    ) -> Self {
        let (detector_config, behavior_csv) = {
            let cfg = config.read();
            (cfg.detector.clone(), cfg.behavior_csv())
        };
        Self {
            config,
            sources,
            packet_source,
            enforcer,
            detector: Detector::spawn(detector_config, behavior_csv),
            registry: ReentrantMutex::new(RefCell::new(Registry::new())),
            alerts: Mutex::new(VecDeque::with_capacity(ALERT_RING_CAPACITY)),
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            metrics: crate::audit::ProcessMetrics::new(),
        }
    }

    /// Process-metrics surface consumed by the dashboard's health endpoint.
    pub fn metrics(&self) -> crate::audit::ProcessMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Load the registry snapshot from disk. Call once at startup.
    pub async fn load_registry(&self) {
        let path = self.config.read().devices_json();
        let loaded = tokio::task::spawn_blocking(move || Registry::load(&path)).await.unwrap_or_default();
        *self.registry.lock().borrow_mut() = loaded;
    }

    /// Best-effort persist on shutdown (§5 cancellation policy).
    pub async fn persist_on_shutdown(&self) {
        self.persist().await;
    }

    /// Current published snapshot, for the dashboard router.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.read().clone()
    }

    /// Run the adaptive loop forever.
    pub async fn run(&self) {
        loop {
            if let Err(e) = self.run_cycle().await {
                tracing::error!(error = %e, "cycle failed; retrying next tick");
            }
            let sleep_secs = self.config.read().cycle_sleep_secs;
            tokio::time::sleep(Duration::from_secs(sleep_secs)).await;
        }
    }

    async fn run_cycle(&self) -> Result<(), GatewayError> {
        let cfg = self.config.read().clone();
        let now = Utc::now();

        // Both halves below are async/subprocess-bound; run them before
        // taking the registry lock so the lock's critical section stays
        // synchronous (a re-entrant mutex guard cannot safely be held across
        // an await point — see DESIGN.md).
        let frames = self.packet_source.capture_window(Duration::from_secs(cfg.cycle_window_secs)).await;
        let flow_stats = flow::aggregate(&frames);
        let evidence = presence::collect_all(&self.sources).await;

        let (threats, devices_view, registry_snapshot) = {
            let guard = self.registry.lock();
            let mut registry = guard.borrow_mut();

            presence::apply(evidence, &mut registry, now, cfg.policy.initial_trust);

            let mut threats = policy::evaluate_cycle(
                &mut registry,
                &flow_stats,
                &self.detector,
                &cfg,
                now,
                cfg.cycle_window_secs as f64,
            );
            correlation::correlate(&mut threats, &cfg.honeypot_csv(), &cfg.correlation);

            for threat in &threats {
                if let Some(device) = registry.get_mut(&threat.mac) {
                    device.trust_score = threat.trust;
                    device.flags = threat.flags;
                    device.normalize();
                }
            }

            let views = build_device_views(&registry, &flow_stats, &threats, now, &cfg);
            (threats, views, registry.clone())
        };

        let new_alerts = self.enforce_threats(&threats, now).await;

        {
            let mut ring = self.alerts.lock();
            for alert in new_alerts {
                if ring.len() >= ALERT_RING_CAPACITY {
                    ring.pop_front();
                }
                ring.push_back(alert);
            }
        }

        let path = cfg.devices_json();
        if let Err(e) = tokio::task::spawn_blocking(move || registry_snapshot.save(&path))
            .await
            .unwrap_or_else(|e| Err(GatewayError::Persistence(e.to_string())))
        {
            tracing::warn!(error = %e, "registry persistence failed; in-memory state remains authoritative");
        }

        let honeypot = tokio::task::spawn_blocking({
            let path = cfg.honeypot_csv();
            let window = HONEYPOT_TAIL;
            move || tail_honeypot(&path, window)
        })
        .await
        .unwrap_or_default();

        let alerts_view: Vec<Alert> = self.alerts.lock().iter().cloned().collect();
        *self.snapshot.write() = Arc::new(Snapshot { devices: devices_view, alerts: alerts_view, honeypot });
        self.metrics.record_cycle();

        Ok(())
    }

    async fn enforce_threats(&self, threats: &[policy::Threat], now: DateTime<Utc>) -> Vec<Alert> {
        let mut alerts = Vec::new();
        for threat in threats {
            if threat.flags.isolated {
                if let Err(e) = self.enforcer.isolate(&threat.ip).await {
                    tracing::warn!(error = %e, ip = %threat.ip, "isolate enforcement failed");
                }
                alerts.push(Alert { timestamp: now, ip: threat.ip.clone(), kind: "CONTAINED".into(), action: "isolate".into() });
            } else if threat.flags.redirected {
                if let Err(e) = self.enforcer.redirect(&threat.ip).await {
                    tracing::warn!(error = %e, ip = %threat.ip, "redirect enforcement failed");
                }
                alerts.push(Alert { timestamp: now, ip: threat.ip.clone(), kind: "DECEIVED".into(), action: "redirect".into() });
            }
        }
        alerts
    }

    async fn persist(&self) {
        let path = self.config.read().devices_json();
        let registry = self.registry.lock().borrow().clone();
        if let Err(e) = tokio::task::spawn_blocking(move || registry.save(&path)).await {
            tracing::warn!(error = %e, "shutdown persistence task panicked");
        }
    }

    /// Manual-action entrypoint (§4.8): locate a device by IP, apply the
    /// requested C6 action, mutate flags/trust, persist.
    pub async fn manual_action(&self, ip: &str, action: ManualAction) -> Result<(), GatewayError> {
        if action == ManualAction::Lockdown {
            self.enforcer.lockdown().await?;
            return Ok(());
        }

        let mac = {
            let guard = self.registry.lock();
            let registry = guard.borrow();
            registry
                .find_by_ip(ip)
                .map(|d| d.mac.clone())
                .ok_or_else(|| GatewayError::Validation(format!("no device with ip {ip}")))?
        };

        match action {
            ManualAction::Isolate => {
                self.enforcer.isolate(ip).await?;
                self.mutate_flags(&mac, |f| f.set_isolated());
            }
            ManualAction::Block => {
                self.enforcer.block_mac(&mac).await?;
                self.mutate_flags(&mac, |f| f.set_isolated());
            }
            ManualAction::Kick => {
                self.enforcer.disconnect(&mac).await?;
            }
            ManualAction::Quarantine => {
                self.enforcer.quarantine_mac(ip, &mac).await?;
                self.mutate_flags(&mac, |f| f.set_redirected());
            }
            ManualAction::Redirect => {
                self.enforcer.redirect(ip).await?;
                self.mutate_flags(&mac, |f| f.set_redirected());
            }
            ManualAction::Release => {
                self.enforcer.release(ip, Some(&mac)).await?;
                let initial_trust = self.config.read().policy.initial_trust;
                self.reset_device(&mac, initial_trust);
            }
            ManualAction::Lockdown => unreachable!("handled above"),
        }

        self.persist().await;
        Ok(())
    }

    fn mutate_flags(&self, mac: &str, f: impl FnOnce(&mut Flags)) {
        let guard = self.registry.lock();
        let mut registry = guard.borrow_mut();
        if let Some(device) = registry.get_mut(mac) {
            f(&mut device.flags);
            device.normalize();
        }
    }

    /// Full Release post-condition (§8 scenario 4): trust back to the
    /// configured initial value, all three flags cleared.
    fn reset_device(&self, mac: &str, initial_trust: i32) {
        let guard = self.registry.lock();
        let mut registry = guard.borrow_mut();
        if let Some(device) = registry.get_mut(mac) {
            device.trust_score = initial_trust;
            device.flags = Flags::default();
            device.normalize();
        }
    }
}

fn build_device_views(
    registry: &Registry,
    flow_stats: &std::collections::HashMap<String, flow::FlowStats>,
    threats: &[policy::Threat],
    now: DateTime<Utc>,
    cfg: &GatewayConfig,
) -> Vec<DeviceView> {
    let anomalous_macs: std::collections::HashSet<&str> =
        threats.iter().filter(|t| t.anomalous).map(|t| t.mac.as_str()).collect();

    registry
        .iter()
        .map(|device| {
            let stats = flow_stats.get(&device.mac);
            let packets = stats.map(|s| s.packets).unwrap_or(0);
            let ports = stats.map(|s| s.unique_ports()).unwrap_or(0);
            let is_offline = device.is_offline(now, cfg.presence.offline_after_secs);
            let status = policy::project_status(device, is_offline, anomalous_macs.contains(device.mac.as_str()), packets);
            DeviceView {
                ip: device.ip.clone(),
                mac: device.mac.clone(),
                hostname: device.hostname.clone(),
                packets,
                ports,
                status: status.as_str(),
                trust_score: device.trust_score,
                last_seen: device.last_seen,
                flags: device.flags,
            }
        })
        .collect()
}

fn tail_honeypot(path: &std::path::Path, window: usize) -> Vec<correlation::InteractionRecord> {
    let Ok(file) = std::fs::File::open(path) else {
        return Vec::new();
    };
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(file);
    let records: Vec<correlation::InteractionRecord> =
        reader.deserialize::<correlation::InteractionRecord>().filter_map(Result::ok).collect();
    let start = records.len().saturating_sub(window);
    records[start..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforcer::{Enforcer, SimFirewallBackend};
    use crate::flow::{FakePacketSource, ObservedFrame};
    use crate::presence::{Evidence, FakeSource};

    fn driver_with(
        evidence: Vec<Evidence>,
        frames: Vec<ObservedFrame>,
    ) -> (Arc<LoopDriver>, SimFirewallBackend) {
        let config = Arc::new(RwLock::new(GatewayConfig::default()));
        config.write().data_dir = std::env::temp_dir().join(format!("sentinel-gw-loop-{}", uuid::Uuid::new_v4()));
        let backend = SimFirewallBackend::new();
        let enforcer = Enforcer::new(Arc::new(backend.clone()), &config.read());
        let sources: Vec<Box<dyn PresenceSource>> = vec![Box::new(FakeSource { label: "fake", evidence })];
        let packet_source: Arc<dyn PacketSource> = Arc::new(FakePacketSource { frames });
        (Arc::new(LoopDriver::new(config, sources, packet_source, enforcer)), backend)
    }

    #[tokio::test]
    async fn cycle_onboards_new_device_as_quarantined() {
        let (driver, _backend) = driver_with(
            vec![Evidence { mac: "aa:bb:cc:dd:ee:ff".into(), ip: Some("10.0.0.5".into()), hostname: Some("cam".into()) }],
            vec![],
        );
        driver.run_cycle().await.unwrap();
        let snap = driver.snapshot();
        assert_eq!(snap.devices.len(), 1);
        assert_eq!(snap.devices[0].status, "NEW/QUARANTINED");
    }

    #[tokio::test]
    async fn manual_isolate_rejects_unknown_ip() {
        let (driver, _backend) = driver_with(vec![], vec![]);
        let result = driver.manual_action("10.0.0.99", ManualAction::Isolate).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn manual_release_clears_flags() {
        let (driver, backend) = driver_with(
            vec![Evidence { mac: "aa:bb:cc:dd:ee:ff".into(), ip: Some("10.0.0.5".into()), hostname: None }],
            vec![],
        );
        driver.run_cycle().await.unwrap();
        driver.manual_action("10.0.0.5", ManualAction::Isolate).await.unwrap();
        driver.manual_action("10.0.0.5", ManualAction::Release).await.unwrap();

        let guard = driver.registry.lock();
        let registry = guard.borrow();
        let dev = registry.get("aa:bb:cc:dd:ee:ff").unwrap();
        assert!(!dev.flags.isolated);
        assert!(!dev.flags.redirected);
        assert!(!dev.flags.quarantined);
        assert_eq!(dev.trust_score, 50);
        drop(registry);
        drop(guard);

        assert!(backend.calls().iter().any(|c| c.0.contains("undrop_src")));
    }
}
