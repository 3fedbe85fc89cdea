//! Anomaly Detector (C3)
//!
//! Hybrid two-stage model over the feature pair (packet_rate,
//! unique_port_count): a threshold rule stage that alone can cross the
//! anomalous bar, plus an isolation-forest-style learned outlier stage that
//! adds a further +30 when it trusts its own training data. Same inputs plus
//! stable model state always yields the same verdict (§4.3 contract).

use crate::behavior_log;
use crate::config::DetectorConfig;
use parking_lot::Mutex;
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;

/// Result of scoring one device for one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub score: u32,
    pub anomalous: bool,
    /// Contributing reasons in the spec's stable order.
    pub reasons: Vec<&'static str>,
}

/// Hybrid detector. Clone-cheap: the model lives behind an `Arc<Mutex<_>>` so
/// every device scored this cycle shares the same trained forest.
#[derive(Clone)]
pub struct Detector {
    config: DetectorConfig,
    model: Arc<Mutex<Option<IsolationForest>>>,
    retrain_tx: tokio::sync::mpsc::Sender<PathBuf>,
}

impl Detector {
    /// Construct a detector and spawn its background retrain worker. The
    /// channel has capacity 1: a pending retrain request is enough, a second
    /// trigger while one is queued or running is simply dropped — this is
    /// the "at-most-one retrain in flight" property from a bounded channel
    /// rather than a coin-flip-guarded boolean (§9 Design Notes).
    pub fn spawn(config: DetectorConfig, behavior_csv: PathBuf) -> Self {
        let model: Arc<Mutex<Option<IsolationForest>>> = Arc::new(Mutex::new(None));
        let (tx, mut rx) = tokio::sync::mpsc::channel::<PathBuf>(1);

        let worker_model = model.clone();
        let worker_config = config.clone();
        tokio::spawn(async move {
            while let Some(csv_path) = rx.recv().await {
                let worker_config = worker_config.clone();
                let rows = tokio::task::spawn_blocking(move || behavior_log::load_rows(&csv_path))
                    .await
                    .unwrap_or_default();
                if rows.len() < worker_config.min_training_rows {
                    continue;
                }
                let points: Vec<(f64, f64)> =
                    rows.iter().map(|r| (r.packet_rate, r.unique_ports as f64)).collect();
                let forest =
                    IsolationForest::fit(&points, worker_config.forest_size, worker_config.sample_size);
                *worker_model.lock() = Some(forest);
                tracing::info!(rows = points.len(), "anomaly detector retrained");
            }
        });

        // Kick off an initial fit from any pre-existing history so a
        // restarted gateway does not run rule-only for its first ten cycles.
        let _ = tx.try_send(behavior_csv.clone());

        Self { config, model, retrain_tx: tx }
    }

    /// Build a detector with no background worker — used by tests that only
    /// need the scoring math.
    pub fn rule_only(config: DetectorConfig) -> Self {
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        Self { config, model: Arc::new(Mutex::new(None)), retrain_tx: tx }
    }

    /// Directly install a trained forest — used by tests exercising the
    /// learned stage without waiting on the background worker.
    pub fn install_model(&self, forest: IsolationForest) {
        *self.model.lock() = Some(forest);
    }

    /// Score one device's traffic this cycle.
    pub fn score(&self, packet_rate: f64, unique_ports: usize) -> Verdict {
        let cfg = &self.config;
        let mut score = 0u32;
        let mut reasons = Vec::new();

        if packet_rate > cfg.rate_threshold_pps {
            score += cfg.rate_score;
            reasons.push("High Packet Rate");
        }
        if unique_ports > cfg.port_threshold {
            score += cfg.port_score;
            reasons.push("Port Scan Detected");
        }

        // Non-blocking: if a retrain holds the lock, skip the learned stage
        // and return rule-only for this call (§5 concurrency model).
        if let Some(guard) = self.model.try_lock() {
            if let Some(forest) = guard.as_ref() {
                if forest.is_outlier(packet_rate, unique_ports as f64) {
                    score += cfg.ml_score;
                    reasons.push("ML Anomaly Detected");
                }
            }
        }

        let score = score.min(100);
        Verdict { score, anomalous: score >= cfg.anomalous_threshold, reasons }
    }

    /// Log one behavior observation and roll the retrain coin-flip. Returns
    /// whether a retrain was actually queued (for tests/observability).
    pub fn observe(&self, row: behavior_log::BehaviorRow, behavior_csv: &std::path::Path) -> bool {
        let _ = behavior_log::append(behavior_csv, &row);
        if rand::thread_rng().gen_bool(self.config.retrain_probability.clamp(0.0, 1.0)) {
            self.retrain_tx.try_send(behavior_csv.to_path_buf()).is_ok()
        } else {
            false
        }
    }
}

/// A minimal isolation forest: an ensemble of randomized binary-split trees
/// over a 2-dimensional feature space. Points that separate out after very
/// few random splits are flagged outliers, per Liu, Ting & Zhou (2008).
#[derive(Clone)]
pub struct IsolationForest {
    trees: Vec<Node>,
    sample_size: usize,
}

#[derive(Clone)]
enum Node {
    Leaf { size: usize },
    Internal { feature: usize, split: f64, left: Box<Node>, right: Box<Node> },
}

impl IsolationForest {
    /// Fit `forest_size` trees, each over a random sub-sample of `data`
    /// capped at `sample_size` points (§4.3 training). Returns a forest with
    /// zero trees if `data` is empty — `is_outlier` then always answers
    /// false.
    pub fn fit(data: &[(f64, f64)], forest_size: usize, sample_size: usize) -> Self {
        if data.is_empty() {
            return Self { trees: Vec::new(), sample_size };
        }
        let mut rng = rand::thread_rng();
        let height_limit = (sample_size.max(2) as f64).log2().ceil() as u32;
        let trees = (0..forest_size)
            .map(|_| {
                let sample: Vec<(f64, f64)> = (0..sample_size.min(data.len()))
                    .map(|_| data[rng.gen_range(0..data.len())])
                    .collect();
                build_node(&sample, 0, height_limit, &mut rng)
            })
            .collect();
        Self { trees, sample_size }
    }

    /// Average normalized path length across the forest; flags the point as
    /// an outlier once it is reliably shorter than expected for normal data.
    pub fn is_outlier(&self, packet_rate: f64, unique_ports: f64) -> bool {
        self.anomaly_score(packet_rate, unique_ports) > 0.6
    }

    pub fn anomaly_score(&self, packet_rate: f64, unique_ports: f64) -> f64 {
        if self.trees.is_empty() {
            return 0.0;
        }
        let point = (packet_rate, unique_ports);
        let avg_path: f64 =
            self.trees.iter().map(|t| path_length(t, point, 0)).sum::<f64>() / self.trees.len() as f64;
        let c = expected_path_length(self.sample_size);
        if c <= 0.0 {
            return 0.0;
        }
        2f64.powf(-avg_path / c)
    }
}

fn expected_path_length(n: usize) -> f64 {
    let n = n.max(2) as f64;
    2.0 * ((n - 1.0).ln() + 0.5772156649) - 2.0 * (n - 1.0) / n
}

fn build_node(sample: &[(f64, f64)], depth: u32, height_limit: u32, rng: &mut impl Rng) -> Node {
    if sample.len() <= 1 || depth >= height_limit {
        return Node::Leaf { size: sample.len() };
    }
    let feature = rng.gen_range(0..2);
    let values: Vec<f64> = sample.iter().map(|p| if feature == 0 { p.0 } else { p.1 }).collect();
    let (min, max) = values.iter().fold((f64::MAX, f64::MIN), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    if (max - min).abs() < f64::EPSILON {
        return Node::Leaf { size: sample.len() };
    }
    let split = rng.gen_range(min..max);
    let (left, right): (Vec<_>, Vec<_>) = sample.iter().partition(|p| {
        let v = if feature == 0 { p.0 } else { p.1 };
        v < split
    });
    if left.is_empty() || right.is_empty() {
        return Node::Leaf { size: sample.len() };
    }
    Node::Internal {
        feature,
        split,
        left: Box::new(build_node(&left, depth + 1, height_limit, rng)),
        right: Box::new(build_node(&right, depth + 1, height_limit, rng)),
    }
}

fn path_length(node: &Node, point: (f64, f64), depth: u32) -> f64 {
    match node {
        Node::Leaf { size } => depth as f64 + expected_path_length(*size),
        Node::Internal { feature, split, left, right } => {
            let v = if *feature == 0 { point.0 } else { point.1 };
            if v < *split {
                path_length(left, point, depth + 1)
            } else {
                path_length(right, point, depth + 1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_stage_alone_can_cross_anomalous_bar() {
        let detector = Detector::rule_only(DetectorConfig::default());
        let verdict = detector.score(600.0, 25);
        assert!(verdict.anomalous);
        assert_eq!(verdict.score, 100);
        assert_eq!(verdict.reasons, vec!["High Packet Rate", "Port Scan Detected"]);
    }

    #[test]
    fn benign_traffic_scores_zero() {
        let detector = Detector::rule_only(DetectorConfig::default());
        let verdict = detector.score(2.0, 3);
        assert!(!verdict.anomalous);
        assert_eq!(verdict.score, 0);
        assert!(verdict.reasons.is_empty());
    }

    #[test]
    fn reason_order_is_stable_with_ml_stage() {
        let detector = Detector::rule_only(DetectorConfig::default());
        // Cluster of normal points plus a far outlier.
        let mut data: Vec<(f64, f64)> = (0..40).map(|i| (1.0 + (i % 3) as f64, 1.0)).collect();
        data.push((900.0, 40.0));
        let forest = IsolationForest::fit(&data, 64, 32);
        detector.install_model(forest);

        let verdict = detector.score(600.0, 25);
        assert_eq!(verdict.reasons[0], "High Packet Rate");
        assert_eq!(verdict.reasons[1], "Port Scan Detected");
    }

    #[test]
    fn empty_forest_never_flags_outliers() {
        let forest = IsolationForest::fit(&[], 64, 32);
        assert!(!forest.is_outlier(1000.0, 99.0));
    }

    #[test]
    fn below_training_minimum_model_stays_untrained() {
        // Fewer than min_training_rows: the retrain worker would skip
        // fitting, so a freshly-spawned detector must stay rule-only.
        let detector = Detector::rule_only(DetectorConfig::default());
        let verdict = detector.score(5.0, 2);
        assert!(!verdict.anomalous);
    }
}
