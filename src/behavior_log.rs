//! Behavior log
//!
//! `behavior.csv` is the shared substrate between C3 (trains its learned
//! stage on historical rows) and C4 (appends one row per scored online
//! device each cycle). One file, one schema, read by one side and written by
//! the other.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Column order matches the dashboard contract exactly:
/// `timestamp, ip, mac, packet_rate, packets, unique_ports, score, label`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorRow {
    pub timestamp: DateTime<Utc>,
    pub ip: String,
    pub mac: String,
    pub packet_rate: f64,
    pub packets: u64,
    pub unique_ports: usize,
    pub score: u32,
    pub label: bool,
}

/// Append one row, writing the header first if the file does not yet exist.
pub fn append(path: &Path, row: &BehaviorRow) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let write_header = !path.exists();
    let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new().has_headers(write_header).from_writer(file);
    writer.serialize(row).map_err(csv_to_io)?;
    writer.flush()
}

/// Load every row currently in the file. Missing file or unparseable rows
/// degrade to an empty/partial result rather than an error — the detector
/// treats "no history yet" as ordinary, not exceptional.
pub fn load_rows(path: &Path) -> Vec<BehaviorRow> {
    let Ok(file) = std::fs::File::open(path) else {
        return Vec::new();
    };
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(file);
    reader
        .deserialize::<BehaviorRow>()
        .filter_map(|r| match r {
            Ok(row) => Some(row),
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed behavior.csv row");
                None
            }
        })
        .collect()
}

fn csv_to_io(e: csv::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, e)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(mac: &str, score: u32) -> BehaviorRow {
        BehaviorRow {
            timestamp: Utc::now(),
            mac: mac.to_string(),
            ip: "10.0.0.5".to_string(),
            packet_rate: 12.0,
            packets: 60,
            unique_ports: 3,
            score,
            label: score >= 50,
        }
    }

    #[test]
    fn append_then_load_round_trips() {
        let dir = std::env::temp_dir().join(format!("sentinel-gw-behlog-{}", uuid::Uuid::new_v4()));
        let path = dir.join("behavior.csv");
        append(&path, &row("aa:bb:cc:dd:ee:ff", 10)).unwrap();
        append(&path, &row("aa:bb:cc:dd:ee:ff", 60)).unwrap();

        let rows = load_rows(&path);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].score, 60);
        assert!(rows[1].label);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_missing_file_is_empty() {
        let rows = load_rows(Path::new("/nonexistent/behavior.csv"));
        assert!(rows.is_empty());
    }
}
