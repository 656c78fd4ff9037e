//! Header extraction for captured ethernet frames.
//!
//! Only the fields the packet filter needs are decoded: the destination MAC,
//! the IP addresses and, for TCP and UDP, the destination port plus the TCP
//! SYN/ACK flags. Payloads are never inspected.

use std::net::IpAddr;

use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::{TcpFlags, TcpPacket};
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;
use pnet::util::MacAddr;

use crate::error::PacketError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeaders {
    pub destination_mac: MacAddr,
    pub network: Option<NetworkHeader>,
    pub transport: Option<TransportHeader>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkHeader {
    pub source: IpAddr,
    pub destination: IpAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportHeader {
    pub protocol: TransportProtocol,
    pub destination_port: u16,
    pub syn: bool,
    pub ack: bool,
}

impl TransportHeader {
    /// True for TCP segments that belong to an already established exchange.
    pub fn is_mid_connection_ack(&self) -> bool {
        self.protocol == TransportProtocol::Tcp && self.ack && !self.syn
    }
}

type Layers = (Option<NetworkHeader>, Option<TransportHeader>);

pub fn parse_frame(frame: &[u8]) -> Result<FrameHeaders, PacketError> {
    let ethernet = EthernetPacket::new(frame).ok_or(PacketError::Truncated { len: frame.len() })?;

    let (network, transport) = match ethernet.get_ethertype() {
        EtherTypes::Ipv4 => parse_ipv4(ethernet.payload())?,
        EtherTypes::Ipv6 => parse_ipv6(ethernet.payload())?,
        _ => (None, None),
    };

    Ok(FrameHeaders {
        destination_mac: ethernet.get_destination(),
        network,
        transport,
    })
}

fn parse_ipv4(bytes: &[u8]) -> Result<Layers, PacketError> {
    let Some(ip) = Ipv4Packet::new(bytes) else {
        return Ok((None, None));
    };

    let header_len = ip.get_header_length() as usize * 4;
    if ip.get_version() != 4
        || header_len < Ipv4Packet::minimum_packet_size()
        || header_len > bytes.len()
    {
        return Ok((None, None));
    }

    let network = NetworkHeader {
        source: IpAddr::V4(ip.get_source()),
        destination: IpAddr::V4(ip.get_destination()),
    };

    // Non-first fragments carry no transport header.
    if ip.get_fragment_offset() != 0 {
        return Ok((Some(network), None));
    }

    // Offloaded segments may report a zero total length; fall back to the
    // captured length. Ethernet padding past total_length is ignored.
    let end = match ip.get_total_length() as usize {
        total if total >= header_len && total <= bytes.len() => total,
        _ => bytes.len(),
    };

    let transport = parse_transport(ip.get_next_level_protocol(), &bytes[header_len..end])?;
    Ok((Some(network), transport))
}

fn parse_ipv6(bytes: &[u8]) -> Result<Layers, PacketError> {
    let Some(ip) = Ipv6Packet::new(bytes) else {
        return Ok((None, None));
    };

    let network = NetworkHeader {
        source: IpAddr::V6(ip.get_source()),
        destination: IpAddr::V6(ip.get_destination()),
    };
    let transport = parse_transport(ip.get_next_header(), ip.payload())?;
    Ok((Some(network), transport))
}

fn parse_transport(
    protocol: IpNextHeaderProtocol,
    bytes: &[u8],
) -> Result<Option<TransportHeader>, PacketError> {
    match protocol {
        IpNextHeaderProtocols::Tcp => {
            let tcp = TcpPacket::new(bytes).ok_or(PacketError::MalformedPort {
                protocol: "tcp",
                len: bytes.len(),
            })?;
            let flags = tcp.get_flags();
            Ok(Some(TransportHeader {
                protocol: TransportProtocol::Tcp,
                destination_port: tcp.get_destination(),
                syn: flags & TcpFlags::SYN != 0,
                ack: flags & TcpFlags::ACK != 0,
            }))
        }
        IpNextHeaderProtocols::Udp => {
            let udp = UdpPacket::new(bytes).ok_or(PacketError::MalformedPort {
                protocol: "udp",
                len: bytes.len(),
            })?;
            Ok(Some(TransportHeader {
                protocol: TransportProtocol::Udp,
                destination_port: udp.get_destination(),
                syn: false,
                ack: false,
            }))
        }
        _ => Ok(None),
    }
}
