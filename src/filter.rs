use std::net::IpAddr;

use ipnetwork::Ipv4Network;
use log::{debug, info, warn};
use pnet::util::MacAddr;

use crate::packet::FrameHeaders;

/// Multicast and reserved space is never a scan target.
pub const DEFAULT_IGNORE_RANGES: &[&str] = &["224.0.0.0/3"];

/// Destination ports above this are treated as ephemeral response traffic.
pub const DEFAULT_MAX_DESTINATION_PORT: u16 = 30000;

/// Decides which frames are candidate connection attempts.
#[derive(Debug, Clone)]
pub struct PacketFilter {
    ignore: Vec<Ipv4Network>,
    max_destination_port: u16,
}

impl PacketFilter {
    /// Builds the ignore list from CIDR strings. Entries that fail to parse
    /// are logged and skipped.
    pub fn new<S: AsRef<str>>(ignore_ranges: &[S], max_destination_port: u16) -> Self {
        let mut ignore = Vec::with_capacity(ignore_ranges.len());

        for range in ignore_ranges {
            let range = range.as_ref();
            match range.parse::<Ipv4Network>() {
                Ok(network) => {
                    debug!("Ignoring range {}", network);
                    ignore.push(network);
                }
                Err(e) => {
                    warn!("Failed to parse ignore range '{}': {}", range, e);
                }
            }
        }

        info!(
            "Loaded {} ignore ranges, max destination port {}",
            ignore.len(),
            max_destination_port
        );

        PacketFilter {
            ignore,
            max_destination_port,
        }
    }

    pub fn should_count(&self, frame: &FrameHeaders) -> bool {
        if frame.destination_mac == MacAddr::broadcast() {
            return false;
        }

        let Some(network) = frame.network else {
            return false;
        };
        if self.is_ignored(network.source) || self.is_ignored(network.destination) {
            return false;
        }

        let Some(transport) = frame.transport else {
            return false;
        };
        if transport.is_mid_connection_ack() {
            return false;
        }

        transport.destination_port <= self.max_destination_port
    }

    /// IPv6 addresses are always ignored.
    fn is_ignored(&self, address: IpAddr) -> bool {
        match address {
            IpAddr::V4(v4) => self.ignore.iter().any(|network| network.contains(v4)),
            IpAddr::V6(_) => true,
        }
    }

    pub fn ignore_ranges(&self) -> &[Ipv4Network] {
        &self.ignore
    }
}

impl Default for PacketFilter {
    fn default() -> Self {
        PacketFilter::new(DEFAULT_IGNORE_RANGES, DEFAULT_MAX_DESTINATION_PORT)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use pnet::packet::tcp::TcpFlags;

    use super::*;
    use crate::packet::testing::*;
    use crate::packet::{parse_frame, TransportHeader, TransportProtocol};

    const SRC: Ipv4Addr = Ipv4Addr::new(10, 1, 0, 5);
    const DST: Ipv4Addr = Ipv4Addr::new(10, 1, 0, 9);

    fn counts(filter: &PacketFilter, frame: &[u8]) -> bool {
        filter.should_count(&parse_frame(frame).unwrap())
    }

    #[test]
    fn test_counts_plain_syn() {
        assert!(counts(&PacketFilter::default(), &syn_frame(SRC, DST, 22)));
    }

    #[test]
    fn test_counts_udp_below_port_limit() {
        assert!(counts(&PacketFilter::default(), &udp_frame(SRC, DST, 161)));
    }

    #[test]
    fn test_rejects_broadcast_destination() {
        let frame = tcp_frame(MacAddr::broadcast(), SRC, DST, 22, TcpFlags::SYN);
        assert!(!counts(&PacketFilter::default(), &frame));
    }

    #[test]
    fn test_rejects_ipv6() {
        let frame = ipv6_syn_frame(Ipv6Addr::LOCALHOST, Ipv6Addr::LOCALHOST, 22);
        assert!(!counts(&PacketFilter::default(), &frame));
    }

    #[test]
    fn test_rejects_mid_connection_ack() {
        let filter = PacketFilter::default();
        assert!(!counts(&filter, &tcp_frame(host_mac(), SRC, DST, 22, TcpFlags::ACK)));
        assert!(!counts(
            &filter,
            &tcp_frame(host_mac(), SRC, DST, 22, TcpFlags::ACK | TcpFlags::PSH)
        ));
        assert!(counts(
            &filter,
            &tcp_frame(host_mac(), SRC, DST, 22, TcpFlags::SYN | TcpFlags::ACK)
        ));
    }

    #[test]
    fn test_rejects_ports_above_limit() {
        let filter = PacketFilter::default();
        assert!(counts(&filter, &syn_frame(SRC, DST, 30000)));
        assert!(!counts(&filter, &syn_frame(SRC, DST, 30001)));
        assert!(!counts(&filter, &udp_frame(SRC, DST, 65535)));
    }

    #[test]
    fn test_rejects_ignored_ranges_on_either_side() {
        let filter = PacketFilter::default();
        let multicast = Ipv4Addr::new(239, 255, 255, 250);
        let limited_broadcast = Ipv4Addr::new(255, 255, 255, 255);

        assert!(!counts(&filter, &udp_frame(SRC, multicast, 1900)));
        assert!(!counts(&filter, &syn_frame(multicast, DST, 22)));
        assert!(!counts(&filter, &udp_frame(SRC, limited_broadcast, 67)));
        assert!(counts(&filter, &syn_frame(SRC, Ipv4Addr::new(223, 255, 255, 255), 22)));
    }

    #[test]
    fn test_rejects_frames_without_layers() {
        let filter = PacketFilter::default();
        let bare = FrameHeaders {
            destination_mac: host_mac(),
            network: None,
            transport: Some(TransportHeader {
                protocol: TransportProtocol::Tcp,
                destination_port: 22,
                syn: true,
                ack: false,
            }),
        };
        assert!(!filter.should_count(&bare));

        let mut icmp = syn_frame(SRC, DST, 22);
        icmp[ETHERNET_LEN + 9] = 1;
        assert!(!counts(&filter, &icmp));
    }

    #[test]
    fn test_malformed_ranges_are_skipped() {
        let filter = PacketFilter::new(&["224.0.0.0/3", "not-a-cidr", "10.1.0.0/16"], 30000);
        assert_eq!(filter.ignore_ranges().len(), 2);
        assert!(!counts(&filter, &syn_frame(SRC, DST, 22)));
        assert!(!counts(&filter, &syn_frame(Ipv4Addr::new(172, 16, 0, 1), DST, 22)));
        assert!(counts(
            &filter,
            &syn_frame(Ipv4Addr::new(172, 16, 0, 1), Ipv4Addr::new(172, 16, 0, 2), 22)
        ));
    }
}
