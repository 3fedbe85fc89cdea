//! Sentinel Gateway - autonomous network-defense gateway for a small IoT LAN
//!
//! Observes every station associated with the access point, classifies each
//! one's behavior, and applies graded countermeasures without operator
//! input: monitor, deceive (redirect to a decoy grid), contain (drop
//! forwarding), or block at the link layer. A thin dashboard surface exposes
//! live state and accepts manual overrides.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         SENTINEL GATEWAY                                │
//! │                                                                         │
//! │  presence (C1)  ──┐                                                    │
//! │  flow stats (C2)  ─┼──▶ detector (C3) ─▶ policy (C4) ─▶ correlation (C5)│
//! │                   ─┘                                        │          │
//! │                                                               ▼         │
//! │                                              enforcer (C6) ◀──┘         │
//! │                                                                         │
//! │  registry (C7) persists every cycle; loop driver (C8) ticks the above   │
//! │  and publishes a snapshot consumed by the dashboard router (C11).       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![allow(dead_code)]

pub mod api;
pub mod audit;
pub mod behavior_log;
pub mod config;
pub mod correlation;
pub mod detector;
pub mod enforcer;
pub mod flow;
pub mod loop_driver;
pub mod policy;
pub mod presence;
pub mod registry;

use config::GatewayConfig;
use enforcer::{Enforcer, FirewallBackend, LiveFirewallBackend};
use loop_driver::LoopDriver;
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;

/// Gateway-wide error taxonomy (§7). The Loop Driver is the single place
/// that downgrades any of these to a log line and continues — the gateway
/// never crashes on a component error.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A presence evidence source failed to collect this cycle.
    #[error("presence source error: {0}")]
    Presence(String),
    /// Packet capture could not run.
    #[error("capture error: {0}")]
    Capture(String),
    /// A firewall/wireless-driver mutation failed.
    #[error("enforcement error: {0}")]
    Enforcement(String),
    /// The anomaly detector's fit or predict stage failed.
    #[error("model error: {0}")]
    Model(String),
    /// Registry or log persistence failed.
    #[error("persistence error: {0}")]
    Persistence(String),
    /// Configuration could not be loaded.
    #[error("config error: {0}")]
    Config(String),
    /// Operator-supplied input failed validation.
    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level gateway: owns configuration and wires the Loop Driver (C8) with
/// a live firewall backend and packet/presence sources. `run` drives the
/// adaptive loop and the dashboard API concurrently until shutdown.
pub struct Gateway {
    /// Shared configuration, readable by every component.
    pub config: Arc<RwLock<GatewayConfig>>,
    driver: Arc<LoopDriver>,
}

impl Gateway {
    /// Construct a gateway wired for live operation: real packet capture,
    /// real presence sources, and the `iptables`/`iw` firewall backend.
    pub fn new(config: GatewayConfig) -> Self {
        let backend: Arc<dyn FirewallBackend> =
            Arc::new(LiveFirewallBackend { ap_interface: config.ap_interface.clone() });
        let enforcer = Enforcer::new(backend, &config);
        let sources = presence::live_sources(&config);
        let packet_source: Arc<dyn flow::PacketSource> =
            Arc::new(flow::LivePacketSource { interface: config.ap_interface.clone() });

        let config = Arc::new(RwLock::new(config));
        let driver = Arc::new(LoopDriver::new(config.clone(), sources, packet_source, enforcer));
        Self { config, driver }
    }

    /// Initialize the registry from disk. Must run before `run`.
    pub async fn init(&self) -> Result<(), GatewayError> {
        self.driver.load_registry().await;
        tracing::info!("sentinel gateway initialized");
        Ok(())
    }

    /// Run the adaptive loop and the dashboard API concurrently until either
    /// exits (shutdown signal) or errors.
    pub async fn run(&self) -> Result<(), GatewayError> {
        let loop_handle = {
            let driver = self.driver.clone();
            tokio::spawn(async move { driver.run().await })
        };
        let api_handle = {
            let driver = self.driver.clone();
            tokio::spawn(async move { api::start_server(driver).await })
        };

        tokio::select! {
            _ = loop_handle => {},
            _ = api_handle => {},
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
            },
        }

        self.driver.persist_on_shutdown().await;
        Ok(())
    }

    /// Expose the loop driver for manual actions (used by the dashboard
    /// router and by tests that drive the pipeline directly).
    pub fn driver(&self) -> Arc<LoopDriver> {
        self.driver.clone()
    }
}
