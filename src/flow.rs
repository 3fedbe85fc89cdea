//! Flow Aggregator (C2)
//!
//! Consumes a bounded window of link-layer frames from the AP interface and
//! reduces them to per-MAC packet counts and distinct destination ports. No
//! payload inspection; MAC is the key, matching registry identity rather than
//! the IP the packet happened to carry this cycle.

use pnet::datalink::{self, Channel, NetworkInterface};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::Packet;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// A single observed frame, reduced to what C2 needs.
#[derive(Debug, Clone)]
pub struct ObservedFrame {
    pub src_mac: String,
    pub tcp_dst_port: Option<u16>,
}

/// Per-cycle, per-MAC traffic counters. Cleared at cycle boundary; never
/// persisted directly (§3).
#[derive(Debug, Clone, Default)]
pub struct FlowStats {
    pub packets: u64,
    pub ports: HashSet<u16>,
}

impl FlowStats {
    pub fn unique_ports(&self) -> usize {
        self.ports.len()
    }
}

/// A bounded packet capture window. Implementations must stop consuming once
/// the window elapses and return whatever was captured so far — partial data
/// is acceptable (§4.2 cancellation).
#[async_trait::async_trait]
pub trait PacketSource: Send + Sync {
    async fn capture_window(&self, window: Duration) -> Vec<ObservedFrame>;
}

/// Live capture on a named interface via a `pnet` datalink channel.
pub struct LivePacketSource {
    pub interface: String,
}

#[async_trait::async_trait]
impl PacketSource for LivePacketSource {
    async fn capture_window(&self, window: Duration) -> Vec<ObservedFrame> {
        let interface_name = self.interface.clone();
        tokio::task::spawn_blocking(move || capture_blocking(&interface_name, window))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "packet capture task panicked");
                Vec::new()
            })
    }
}

fn find_interface(name: &str) -> Option<NetworkInterface> {
    datalink::interfaces().into_iter().find(|i| i.name == name)
}

fn capture_blocking(interface_name: &str, window: Duration) -> Vec<ObservedFrame> {
    let Some(interface) = find_interface(interface_name) else {
        tracing::warn!(interface = interface_name, "AP interface not found");
        return Vec::new();
    };

    let mut rx = match datalink::channel(&interface, Default::default()) {
        Ok(Channel::Ethernet(_tx, rx)) => rx,
        Ok(_) => {
            tracing::warn!(interface = interface_name, "unsupported channel type");
            return Vec::new();
        }
        Err(e) => {
            tracing::warn!(interface = interface_name, error = %e, "failed to open capture channel");
            return Vec::new();
        }
    };

    let deadline = Instant::now() + window;
    let mut frames = Vec::new();
    while Instant::now() < deadline {
        match rx.next() {
            Ok(raw) => {
                if let Some(frame) = parse_frame(raw) {
                    frames.push(frame);
                }
            }
            Err(e) => {
                tracing::warn!(interface = interface_name, error = %e, "capture read failed");
                break;
            }
        }
    }
    frames
}

fn parse_frame(raw: &[u8]) -> Option<ObservedFrame> {
    let eth = EthernetPacket::new(raw)?;
    let src_mac = eth.get_source().to_string();
    let mut tcp_dst_port = None;

    if eth.get_ethertype() == EtherTypes::Ipv4 {
        if let Some(ipv4) = Ipv4Packet::new(eth.payload()) {
            if ipv4.get_next_level_protocol() == IpNextHeaderProtocols::Tcp {
                if let Some(tcp) = TcpPacket::new(ipv4.payload()) {
                    tcp_dst_port = Some(tcp.get_destination());
                }
            }
        }
    }

    Some(ObservedFrame { src_mac, tcp_dst_port })
}

/// A fixed frame sequence for tests and non-privileged environments.
pub struct FakePacketSource {
    pub frames: Vec<ObservedFrame>,
}

#[async_trait::async_trait]
impl PacketSource for FakePacketSource {
    async fn capture_window(&self, _window: Duration) -> Vec<ObservedFrame> {
        self.frames.clone()
    }
}

/// Reduce a captured frame set into per-MAC flow stats.
pub fn aggregate(frames: &[ObservedFrame]) -> HashMap<String, FlowStats> {
    let mut stats: HashMap<String, FlowStats> = HashMap::new();
    for frame in frames {
        let entry = stats.entry(crate::registry::canonical_mac(&frame.src_mac)).or_default();
        entry.packets += 1;
        if let Some(port) = frame.tcp_dst_port {
            entry.ports.insert(port);
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(mac: &str, port: Option<u16>) -> ObservedFrame {
        ObservedFrame { src_mac: mac.to_string(), tcp_dst_port: port }
    }

    #[test]
    fn counts_packets_and_unique_ports_per_mac() {
        let frames = vec![
            frame("aa:bb:cc:dd:ee:ff", Some(80)),
            frame("aa:bb:cc:dd:ee:ff", Some(443)),
            frame("aa:bb:cc:dd:ee:ff", Some(80)),
            frame("11:22:33:44:55:66", None),
        ];
        let stats = aggregate(&frames);
        let a = stats.get("aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(a.packets, 3);
        assert_eq!(a.unique_ports(), 2);

        let b = stats.get("11:22:33:44:55:66").unwrap();
        assert_eq!(b.packets, 1);
        assert_eq!(b.unique_ports(), 0);
    }

    #[tokio::test]
    async fn fake_source_returns_fixed_frames() {
        let source = FakePacketSource { frames: vec![frame("aa:bb:cc:dd:ee:ff", Some(22))] };
        let frames = source.capture_window(Duration::from_secs(5)).await;
        assert_eq!(frames.len(), 1);
    }
}
