//! Response Enforcer (C6)
//!
//! Idempotent firewall/Wi-Fi mutations. Every additive primitive deletes any
//! matching prior rule before adding, so re-asserting policy every cycle is
//! always safe. Built as a small trait over host primitives, with a live
//! `iptables`/`iw` backend and an in-memory simulation backend for tests and
//! non-Linux development.

use crate::config::GatewayConfig;
use crate::GatewayError;
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;

const REDIRECT_PAIRS: [(u16, u16); 3] = [(22, 2222), (80, 8080), (445, 4445)];
const QUARANTINE_RATE_PER_MINUTE: u32 = 5;

/// The eight host primitives named in the design notes, plus the delete-side
/// counterpart each additive primitive needs so `release` can undo it.
#[async_trait::async_trait]
pub trait FirewallBackend: Send + Sync {
    async fn redirect(&self, ip: &str, from_port: u16, to_port: u16) -> Result<(), GatewayError>;
    async fn unredirect(&self, ip: &str, from_port: u16, to_port: u16) -> Result<(), GatewayError>;
    async fn drop_src(&self, ip: &str) -> Result<(), GatewayError>;
    async fn undrop_src(&self, ip: &str) -> Result<(), GatewayError>;
    async fn drop_dst(&self, ip: &str) -> Result<(), GatewayError>;
    async fn undrop_dst(&self, ip: &str) -> Result<(), GatewayError>;
    async fn mac_drop(&self, mac: &str) -> Result<(), GatewayError>;
    async fn unmac_drop(&self, mac: &str) -> Result<(), GatewayError>;
    async fn mac_ratelimit(&self, mac: &str, per_minute: u32) -> Result<(), GatewayError>;
    async fn unmac_ratelimit(&self, mac: &str) -> Result<(), GatewayError>;
    async fn kick(&self, mac: &str) -> Result<(), GatewayError>;
    async fn lockdown(&self) -> Result<(), GatewayError>;
}

/// Live backend: shells out to `iptables` (NAT/filter) and `iw` (station
/// management) via `tokio::process::Command`. Delete-before-add is
/// implemented by ignoring the delete's exit code — `iptables -D` on a rule
/// that was never added fails harmlessly, which is the idempotence contract.
pub struct LiveFirewallBackend {
    pub ap_interface: String,
}

async fn run(cmd: &str, args: &[&str]) -> Result<(), GatewayError> {
    let output = Command::new(cmd)
        .args(args)
        .output()
        .await
        .map_err(|e| GatewayError::Enforcement(format!("{cmd} invocation failed: {e}")))?;
    if !output.status.success() {
        tracing::warn!(cmd, args = ?args, "host command exited non-zero; treating as best-effort");
    }
    Ok(())
}

#[async_trait::async_trait]
impl FirewallBackend for LiveFirewallBackend {
    async fn redirect(&self, ip: &str, from_port: u16, to_port: u16) -> Result<(), GatewayError> {
        self.unredirect(ip, from_port, to_port).await?;
        let from = from_port.to_string();
        let to = to_port.to_string();
        run(
            "iptables",
            &[
                "-t", "nat", "-A", "PREROUTING", "-i", &self.ap_interface, "-s", ip, "-p", "tcp",
                "--dport", &from, "-j", "REDIRECT", "--to-port", &to,
            ],
        )
        .await
    }

    async fn unredirect(&self, ip: &str, from_port: u16, to_port: u16) -> Result<(), GatewayError> {
        let from = from_port.to_string();
        let to = to_port.to_string();
        run(
            "iptables",
            &[
                "-t", "nat", "-D", "PREROUTING", "-i", &self.ap_interface, "-s", ip, "-p", "tcp",
                "--dport", &from, "-j", "REDIRECT", "--to-port", &to,
            ],
        )
        .await
    }

    async fn drop_src(&self, ip: &str) -> Result<(), GatewayError> {
        self.undrop_src(ip).await?;
        run("iptables", &["-A", "FORWARD", "-s", ip, "-j", "DROP"]).await
    }

    async fn undrop_src(&self, ip: &str) -> Result<(), GatewayError> {
        run("iptables", &["-D", "FORWARD", "-s", ip, "-j", "DROP"]).await
    }

    async fn drop_dst(&self, ip: &str) -> Result<(), GatewayError> {
        self.undrop_dst(ip).await?;
        run("iptables", &["-A", "FORWARD", "-d", ip, "-j", "DROP"]).await
    }

    async fn undrop_dst(&self, ip: &str) -> Result<(), GatewayError> {
        run("iptables", &["-D", "FORWARD", "-d", ip, "-j", "DROP"]).await
    }

    async fn mac_drop(&self, mac: &str) -> Result<(), GatewayError> {
        self.unmac_drop(mac).await?;
        run("iptables", &["-A", "FORWARD", "-m", "mac", "--mac-source", mac, "-j", "DROP"]).await
    }

    async fn unmac_drop(&self, mac: &str) -> Result<(), GatewayError> {
        run("iptables", &["-D", "FORWARD", "-m", "mac", "--mac-source", mac, "-j", "DROP"]).await
    }

    async fn mac_ratelimit(&self, mac: &str, per_minute: u32) -> Result<(), GatewayError> {
        self.unmac_ratelimit(mac).await?;
        let limit = format!("{per_minute}/minute");
        run(
            "iptables",
            &["-A", "FORWARD", "-m", "mac", "--mac-source", mac, "-m", "limit", "--limit", &limit, "-j", "ACCEPT"],
        )
        .await
    }

    async fn unmac_ratelimit(&self, mac: &str) -> Result<(), GatewayError> {
        let limit = format!("{QUARANTINE_RATE_PER_MINUTE}/minute");
        run(
            "iptables",
            &["-D", "FORWARD", "-m", "mac", "--mac-source", mac, "-m", "limit", "--limit", &limit, "-j", "ACCEPT"],
        )
        .await
    }

    async fn kick(&self, mac: &str) -> Result<(), GatewayError> {
        run("iw", &["dev", &self.ap_interface, "station", "del", mac]).await
    }

    async fn lockdown(&self) -> Result<(), GatewayError> {
        run("iptables", &["-P", "FORWARD", "DROP"]).await
    }
}

/// One recorded primitive call, for assertions in idempotence/scenario tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall(pub String);

/// In-memory backend for tests and non-Linux development. Records every call
/// rather than touching the host.
#[derive(Default, Clone)]
pub struct SimFirewallBackend {
    pub calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl SimFirewallBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(RecordedCall(call.into()));
    }
}

#[async_trait::async_trait]
impl FirewallBackend for SimFirewallBackend {
    async fn redirect(&self, ip: &str, from_port: u16, to_port: u16) -> Result<(), GatewayError> {
        self.record(format!("redirect {ip} {from_port}->{to_port}"));
        Ok(())
    }
    async fn unredirect(&self, ip: &str, from_port: u16, to_port: u16) -> Result<(), GatewayError> {
        self.record(format!("unredirect {ip} {from_port}->{to_port}"));
        Ok(())
    }
    async fn drop_src(&self, ip: &str) -> Result<(), GatewayError> {
        self.record(format!("drop_src {ip}"));
        Ok(())
    }
    async fn undrop_src(&self, ip: &str) -> Result<(), GatewayError> {
        self.record(format!("undrop_src {ip}"));
        Ok(())
    }
    async fn drop_dst(&self, ip: &str) -> Result<(), GatewayError> {
        self.record(format!("drop_dst {ip}"));
        Ok(())
    }
    async fn undrop_dst(&self, ip: &str) -> Result<(), GatewayError> {
        self.record(format!("undrop_dst {ip}"));
        Ok(())
    }
    async fn mac_drop(&self, mac: &str) -> Result<(), GatewayError> {
        self.record(format!("mac_drop {mac}"));
        Ok(())
    }
    async fn unmac_drop(&self, mac: &str) -> Result<(), GatewayError> {
        self.record(format!("unmac_drop {mac}"));
        Ok(())
    }
    async fn mac_ratelimit(&self, mac: &str, per_minute: u32) -> Result<(), GatewayError> {
        self.record(format!("mac_ratelimit {mac} {per_minute}/min"));
        Ok(())
    }
    async fn unmac_ratelimit(&self, mac: &str) -> Result<(), GatewayError> {
        self.record(format!("unmac_ratelimit {mac}"));
        Ok(())
    }
    async fn kick(&self, mac: &str) -> Result<(), GatewayError> {
        self.record(format!("kick {mac}"));
        Ok(())
    }
    async fn lockdown(&self) -> Result<(), GatewayError> {
        self.record("lockdown");
        Ok(())
    }
}

/// Validate an IPv4 literal suitable for an enforcement target: must parse,
/// and must be neither loopback nor multicast.
pub fn validate_ip(ip: &str) -> Result<Ipv4Addr, GatewayError> {
    let addr: Ipv4Addr = ip.parse().map_err(|_| GatewayError::Validation(format!("invalid IPv4 literal: {ip}")))?;
    if addr.is_loopback() || addr.is_multicast() {
        return Err(GatewayError::Validation(format!("rejected loopback/multicast address: {ip}")));
    }
    Ok(addr)
}

/// Validate a MAC address: six colon-separated hex octets.
pub fn validate_mac(mac: &str) -> Result<String, GatewayError> {
    let octets: Vec<&str> = mac.split(':').collect();
    if octets.len() != 6 || !octets.iter().all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit())) {
        return Err(GatewayError::Validation(format!("invalid MAC address: {mac}")));
    }
    Ok(mac.to_ascii_lowercase())
}

/// Composes the eight primitives into the named higher-level actions,
/// appends the audit log, and packages evidence archives on Isolate. Holds
/// its backend behind `Arc<dyn FirewallBackend>` so the Loop Driver can wire
/// either the live or simulation backend at startup without a generic
/// parameter threading through every caller.
pub struct Enforcer {
    backend: Arc<dyn FirewallBackend>,
    audit_log: PathBuf,
    data_dir: PathBuf,
}

impl Enforcer {
    pub fn new(backend: Arc<dyn FirewallBackend>, config: &GatewayConfig) -> Self {
        Self { backend, audit_log: config.audit_log(), data_dir: config.data_dir.clone() }
    }

    fn audit(&self, action: &str, detail: &str) {
        if let Err(e) = crate::audit::append_line(&self.audit_log, action, detail) {
            tracing::warn!(error = %e, path = %self.audit_log.display(), "failed to append audit log");
        }
    }

    pub async fn redirect(&self, ip: &str) -> Result<(), GatewayError> {
        validate_ip(ip)?;
        for (from, to) in REDIRECT_PAIRS {
            self.backend.redirect(ip, from, to).await?;
        }
        self.audit("redirect", ip);
        Ok(())
    }

    pub async fn isolate(&self, ip: &str) -> Result<(), GatewayError> {
        validate_ip(ip)?;
        self.backend.drop_src(ip).await?;
        self.backend.drop_dst(ip).await?;
        self.audit("isolate", ip);
        self.archive_evidence();
        Ok(())
    }

    pub async fn block_mac(&self, mac: &str) -> Result<(), GatewayError> {
        let mac = validate_mac(mac)?;
        self.backend.mac_drop(&mac).await?;
        self.audit("block_mac", &mac);
        Ok(())
    }

    pub async fn quarantine_mac(&self, ip: &str, mac: &str) -> Result<(), GatewayError> {
        validate_ip(ip)?;
        let mac = validate_mac(mac)?;
        self.redirect(ip).await?;
        self.backend.mac_ratelimit(&mac, QUARANTINE_RATE_PER_MINUTE).await?;
        self.audit("quarantine_mac", &format!("{ip} {mac}"));
        Ok(())
    }

    pub async fn disconnect(&self, mac: &str) -> Result<(), GatewayError> {
        let mac = validate_mac(mac)?;
        self.backend.kick(&mac).await?;
        self.audit("disconnect", &mac);
        Ok(())
    }

    /// Delete every rule the other actions might have installed. Safe to
    /// call on already-clean state — every primitive it calls is itself a
    /// delete, so there is nothing left to go wrong.
    pub async fn release(&self, ip: &str, mac: Option<&str>) -> Result<(), GatewayError> {
        validate_ip(ip)?;
        for (from, to) in REDIRECT_PAIRS {
            self.backend.unredirect(ip, from, to).await?;
        }
        self.backend.undrop_src(ip).await?;
        self.backend.undrop_dst(ip).await?;
        if let Some(mac) = mac {
            let mac = validate_mac(mac)?;
            self.backend.unmac_drop(&mac).await?;
            self.backend.unmac_ratelimit(&mac).await?;
        }
        self.audit("release", ip);
        Ok(())
    }

    pub async fn lockdown(&self) -> Result<(), GatewayError> {
        self.backend.lockdown().await?;
        self.audit("lockdown", "forward chain default policy DROP");
        Ok(())
    }

    /// Bundle behavior.csv, honeypot.csv, and the audit log as they exist
    /// right now into a timestamped zip under `<data_dir>/evidence/`.
    fn archive_evidence(&self) {
        let data_dir = self.data_dir.clone();
        let audit_log = self.audit_log.clone();
        std::thread::spawn(move || {
            if let Err(e) = crate::audit::write_evidence_archive(&data_dir, &audit_log) {
                tracing::warn!(error = %e, "evidence archive failed");
            }
        });
    }
}
