//! Observability (C10)
//!
//! The audit log (forensic trail of every non-read enforcement action) and
//! the evidence archive it feeds, plus a small process-metrics surface the
//! dashboard's health check reads. Structured logging itself is `tracing`,
//! configured once in `main`.

use crate::GatewayError;
use chrono::Utc;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Append one line to the audit log: `[ts] ACTION: detail` (§6 file contract).
pub fn append_line(path: &Path, action: &str, detail: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let line = format!("[{}] {}: {}\n", Utc::now().to_rfc3339(), action.to_uppercase(), detail);
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())
}

/// Read the last `n` lines of the audit log. Used by the dashboard's
/// read-only views; missing file yields an empty vec.
pub fn tail_lines(path: &Path, n: usize) -> Vec<String> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].iter().map(|s| s.to_string()).collect()
}

/// Bundle `behavior.csv`, `honeypot.csv`, and the audit log as they exist
/// right now into a timestamped zip under `<data_dir>/evidence/`. Triggered
/// by Isolate (§4.6).
pub fn write_evidence_archive(data_dir: &Path, audit_log: &Path) -> Result<std::path::PathBuf, GatewayError> {
    let evidence_dir = data_dir.join("evidence");
    std::fs::create_dir_all(&evidence_dir).map_err(|e| GatewayError::Persistence(e.to_string()))?;
    let archive_path = evidence_dir.join(format!("evidence_{}.zip", Utc::now().format("%Y%m%dT%H%M%SZ")));
    let file = std::fs::File::create(&archive_path).map_err(|e| GatewayError::Persistence(e.to_string()))?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for (name, path) in [
        ("behavior.csv", data_dir.join("behavior.csv")),
        ("honeypot.csv", data_dir.join("honeypot.csv")),
        ("iptables_actions.log", audit_log.to_path_buf()),
    ] {
        let Ok(content) = std::fs::read(&path) else { continue };
        zip.start_file(name, options).map_err(|e| GatewayError::Persistence(e.to_string()))?;
        zip.write_all(&content).map_err(|e| GatewayError::Persistence(e.to_string()))?;
    }
    zip.finish().map_err(|e| GatewayError::Persistence(e.to_string()))?;
    Ok(archive_path)
}

/// Process-metrics surface consumed by the dashboard's health endpoint.
/// Deliberately minimal: uptime and a cycle counter, mirroring the teacher's
/// `MetricsCollector` in spirit without carrying over its Prometheus text
/// format (no scrape endpoint is specified for this gateway).
pub struct ProcessMetrics {
    started_at: chrono::DateTime<Utc>,
    cycles_completed: AtomicU64,
}

impl ProcessMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { started_at: Utc::now(), cycles_completed: AtomicU64::new(0) })
    }

    pub fn record_cycle(&self) {
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProcessMetricsSnapshot {
        ProcessMetricsSnapshot {
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0),
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessMetricsSnapshot {
    pub uptime_secs: i64,
    pub cycles_completed: u64,
}
