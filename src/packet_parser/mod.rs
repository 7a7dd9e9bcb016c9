mod parse_dns;
mod parse_http;
mod parse_tls;

use pnet_packet::ethernet::{EtherTypes, EthernetPacket};
use pnet_packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::tcp::TcpPacket;
use pnet_packet::udp::UdpPacket;
use pnet_packet::Packet;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PacketParseError {
    #[error("Malformed frame")]
    BadPacket,
    #[error("ARP has no L3 payload")]
    IsArp,
    #[error("Frame is not IPv4")]
    NotIpv4,
    #[error("Unhandled transport layer protocol")]
    UnhandledTransport,
    #[error("Frame carries no hostname")]
    NoHostname,
}

/// A frame from which a hostname could be extracted, attributed to the
/// sending address.
#[derive(Debug, Clone, PartialEq)]
pub struct HostnameFrame {
    pub src: std::net::IpAddr,
    pub dst: std::net::IpAddr,
    pub hostname: String,
}

pub fn parse_ethernet(
    packet_bytes: &[u8],
    log: &slog::Logger,
) -> Result<HostnameFrame, PacketParseError> {
    let ethernet = EthernetPacket::new(packet_bytes).ok_or(PacketParseError::BadPacket)?;
    match ethernet.get_ethertype() {
        EtherTypes::Ipv4 => parse_ipv4(ethernet.payload(), log),
        EtherTypes::Arp => Err(PacketParseError::IsArp),
        // IPv6 is disabled on the hotspot link; nothing to attribute.
        _ => Err(PacketParseError::NotIpv4),
    }
}

pub fn parse_ipv4(
    packet_bytes: &[u8],
    log: &slog::Logger,
) -> Result<HostnameFrame, PacketParseError> {
    let header = Ipv4Packet::new(packet_bytes).ok_or_else(|| {
        slog::debug!(log, "Malformed IPv4 packet");
        PacketParseError::BadPacket
    })?;
    let src = std::net::IpAddr::V4(header.get_source());
    let dst = std::net::IpAddr::V4(header.get_destination());
    let hostname = parse_transport(header.get_next_level_protocol(), header.payload(), log)?;
    Ok(HostnameFrame { src, dst, hostname })
}

fn parse_transport(
    protocol: IpNextHeaderProtocol,
    packet: &[u8],
    log: &slog::Logger,
) -> Result<String, PacketParseError> {
    match protocol {
        IpNextHeaderProtocols::Udp => parse_transport_udp(packet, log),
        IpNextHeaderProtocols::Tcp => parse_transport_tcp(packet, log),
        _ => Err(PacketParseError::UnhandledTransport),
    }
}

fn parse_transport_udp(packet: &[u8], log: &slog::Logger) -> Result<String, PacketParseError> {
    let udp = UdpPacket::new(packet).ok_or_else(|| {
        slog::debug!(log, "Malformed UDP packet");
        PacketParseError::BadPacket
    })?;
    if udp.get_destination() == 53 || udp.get_source() == 53 {
        return parse_dns::query_name(udp.payload(), log).ok_or(PacketParseError::NoHostname);
    }
    Err(PacketParseError::NoHostname)
}

fn parse_transport_tcp(packet: &[u8], log: &slog::Logger) -> Result<String, PacketParseError> {
    let tcp = TcpPacket::new(packet).ok_or_else(|| {
        slog::debug!(log, "Malformed TCP packet");
        PacketParseError::BadPacket
    })?;
    let dst_port = tcp.get_destination();
    let payload = tcp.payload();
    if payload.is_empty() {
        return Err(PacketParseError::NoHostname);
    }
    match dst_port {
        80 => parse_http::host_header(payload).ok_or(PacketParseError::NoHostname),
        443 => parse_tls::server_name(payload).ok_or(PacketParseError::NoHostname),
        _ => Err(PacketParseError::NoHostname),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_logger() -> slog::Logger {
        use slog::Drain;
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        slog::Logger::root(drain, slog::o!())
    }

    fn decode_hex(input: &str) -> Result<Vec<u8>, std::num::ParseIntError> {
        (0..input.len())
            .step_by(2)
            .map(|chunk_i| u8::from_str_radix(&input[chunk_i..chunk_i + 2], 16))
            .collect()
    }

    fn ipv4_frame(proto: u8, src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
        let total_len = 20 + payload.len();
        let mut ip = vec![
            0x45,
            0x00,
            (total_len >> 8) as u8,
            (total_len & 0xff) as u8,
            0x00,
            0x00,
            0x40,
            0x00,
            0x40,
            proto,
            0x00,
            0x00,
        ];
        ip.extend_from_slice(&src);
        ip.extend_from_slice(&dst);
        ip.extend_from_slice(payload);
        ip
    }

    fn udp_datagram(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut udp = Vec::new();
        udp.extend_from_slice(&src_port.to_be_bytes());
        udp.extend_from_slice(&dst_port.to_be_bytes());
        udp.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        udp.extend_from_slice(&[0, 0]);
        udp.extend_from_slice(payload);
        udp
    }

    fn tcp_segment(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut tcp = Vec::new();
        tcp.extend_from_slice(&src_port.to_be_bytes());
        tcp.extend_from_slice(&dst_port.to_be_bytes());
        tcp.extend_from_slice(&[0; 8]);
        tcp.extend_from_slice(&[0x50, 0x18, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00]);
        tcp.extend_from_slice(payload);
        tcp
    }

    #[test]
    fn test_parse_dns_query_frame() {
        let log = make_logger();
        // Standard query for example.com.
        let dns =
            decode_hex("abcd01000001000000000000076578616d706c6503636f6d0000010001").unwrap();
        let frame = ipv4_frame(17, [10, 0, 0, 7], [10, 0, 0, 1], &udp_datagram(49152, 53, &dns));
        let parsed = parse_ipv4(&frame, &log).unwrap();
        assert_eq!(parsed.hostname, "example.com");
        assert_eq!(parsed.src, "10.0.0.7".parse::<std::net::IpAddr>().unwrap());
    }

    #[test]
    fn test_http_host_frame() {
        let log = make_logger();
        let http = b"GET / HTTP/1.1\r\nHost: example.org\r\nUser-Agent: curl\r\n\r\n";
        let frame = ipv4_frame(
            6,
            [10, 0, 0, 7],
            [93, 184, 216, 34],
            &tcp_segment(49200, 80, http),
        );
        let parsed = parse_ipv4(&frame, &log).unwrap();
        assert_eq!(parsed.hostname, "example.org");
    }

    #[test]
    fn test_frame_without_hostname_is_dropped() {
        let log = make_logger();
        let frame = ipv4_frame(
            17,
            [10, 0, 0, 7],
            [1, 1, 1, 1],
            &udp_datagram(49152, 5000, &[1, 2, 3, 4]),
        );
        assert!(matches!(
            parse_ipv4(&frame, &log),
            Err(PacketParseError::NoHostname)
        ));
    }
}
