//! IP packet parsing and construction.
//!
//! Parses inbound IPv4/IPv6 packets down to the TCP or UDP header and builds
//! the packets the protocol handlers send back to the client.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};

use crate::error::{Error, ProtocolError, Result};

pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_PSH: u8 = 0x08;
pub const TCP_ACK: u8 = 0x10;

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const TCP_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const DEFAULT_TTL: u8 = 64;

static NEXT_IP_ID: AtomicU16 = AtomicU16::new(1);

/// IP version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

/// Transport layer protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Tcp,
    Udp,
    Icmp,
    Icmpv6,
    Other(u8),
}

impl TransportProtocol {
    /// Get the IP protocol number.
    pub fn protocol_number(&self) -> u8 {
        match self {
            TransportProtocol::Tcp => 6,
            TransportProtocol::Udp => 17,
            TransportProtocol::Icmp => 1,
            TransportProtocol::Icmpv6 => 58,
            TransportProtocol::Other(n) => *n,
        }
    }

    /// Create from IP protocol number.
    pub fn from_protocol_number(n: u8) -> Self {
        match n {
            6 => TransportProtocol::Tcp,
            17 => TransportProtocol::Udp,
            1 => TransportProtocol::Icmp,
            58 => TransportProtocol::Icmpv6,
            _ => TransportProtocol::Other(n),
        }
    }
}

/// 5-tuple flow identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowTuple {
    /// Source IP address.
    pub src_addr: IpAddr,
    /// Destination IP address.
    pub dst_addr: IpAddr,
    /// Source port.
    pub src_port: u16,
    /// Destination port.
    pub dst_port: u16,
    /// Transport protocol.
    pub protocol: TransportProtocol,
}

impl FlowTuple {
    pub fn src(&self) -> SocketAddr {
        SocketAddr::new(self.src_addr, self.src_port)
    }

    pub fn dst(&self) -> SocketAddr {
        SocketAddr::new(self.dst_addr, self.dst_port)
    }

    /// Get the reverse flow (swap src/dst).
    pub fn reverse(&self) -> Self {
        Self {
            src_addr: self.dst_addr,
            dst_addr: self.src_addr,
            src_port: self.dst_port,
            dst_port: self.src_port,
            protocol: self.protocol,
        }
    }
}

/// Parsed IP packet header information.
#[derive(Debug, Clone)]
pub struct IpPacket<'a> {
    /// IP version.
    pub version: IpVersion,
    /// Offset of the transport header.
    pub header_len: usize,
    /// Total packet length as declared by the IP header.
    pub total_len: usize,
    /// Time to live / hop limit.
    pub ttl: u8,
    /// Transport protocol.
    pub protocol: TransportProtocol,
    /// Source address.
    pub src_addr: IpAddr,
    /// Destination address.
    pub dst_addr: IpAddr,
    /// Packet bytes, trimmed to `total_len`.
    pub data: &'a [u8],
}

impl<'a> IpPacket<'a> {
    /// Parse an IP packet from raw bytes.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::malformed("Empty packet"));
        }

        match (data[0] >> 4) & 0x0f {
            4 => Self::parse_ipv4(data),
            6 => Self::parse_ipv6(data),
            version => Err(Error::malformed(format!("Unknown IP version: {version}"))),
        }
    }

    fn parse_ipv4(data: &'a [u8]) -> Result<Self> {
        if data.len() < IPV4_HEADER_LEN {
            return Err(Error::malformed("IPv4 packet too short"));
        }

        let header_len = ((data[0] & 0x0f) as usize) * 4;
        if header_len < IPV4_HEADER_LEN || data.len() < header_len {
            return Err(Error::malformed("IPv4 header truncated"));
        }

        let total_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if total_len < header_len || total_len > data.len() {
            return Err(Error::malformed(format!(
                "IPv4 total length {total_len} does not match {} bytes",
                data.len()
            )));
        }

        // Fragments are not reassembled
        let frag = u16::from_be_bytes([data[6], data[7]]);
        if frag & 0x3fff != 0 {
            return Err(Error::malformed("IPv4 fragment"));
        }

        Ok(Self {
            version: IpVersion::V4,
            header_len,
            total_len,
            ttl: data[8],
            protocol: TransportProtocol::from_protocol_number(data[9]),
            src_addr: IpAddr::V4(Ipv4Addr::new(data[12], data[13], data[14], data[15])),
            dst_addr: IpAddr::V4(Ipv4Addr::new(data[16], data[17], data[18], data[19])),
            data: &data[..total_len],
        })
    }

    fn parse_ipv6(data: &'a [u8]) -> Result<Self> {
        if data.len() < IPV6_HEADER_LEN {
            return Err(Error::malformed("IPv6 packet too short"));
        }

        let payload_len = u16::from_be_bytes([data[4], data[5]]) as usize;
        let total_len = IPV6_HEADER_LEN + payload_len;
        if total_len > data.len() {
            return Err(Error::malformed("IPv6 payload truncated"));
        }
        let data = &data[..total_len];

        let mut src_bytes = [0u8; 16];
        let mut dst_bytes = [0u8; 16];
        src_bytes.copy_from_slice(&data[8..24]);
        dst_bytes.copy_from_slice(&data[24..40]);

        let (protocol, header_len) = Self::skip_ipv6_extension_headers(data, data[6], IPV6_HEADER_LEN)?;

        Ok(Self {
            version: IpVersion::V6,
            header_len,
            total_len,
            ttl: data[7],
            protocol,
            src_addr: IpAddr::V6(Ipv6Addr::from(src_bytes)),
            dst_addr: IpAddr::V6(Ipv6Addr::from(dst_bytes)),
            data,
        })
    }

    /// Skip IPv6 extension headers to find the transport protocol.
    fn skip_ipv6_extension_headers(
        data: &[u8],
        next_header: u8,
        mut offset: usize,
    ) -> Result<(TransportProtocol, usize)> {
        const HOP_BY_HOP: u8 = 0;
        const ROUTING: u8 = 43;
        const FRAGMENT: u8 = 44;
        const DESTINATION: u8 = 60;

        let mut current = next_header;
        loop {
            match current {
                HOP_BY_HOP | ROUTING | DESTINATION => {
                    if data.len() < offset + 2 {
                        return Err(Error::malformed("IPv6 extension header truncated"));
                    }
                    current = data[offset];
                    offset += (data[offset + 1] as usize + 1) * 8;
                }
                FRAGMENT => return Err(Error::malformed("IPv6 fragment")),
                _ => break,
            }
            if offset > data.len() {
                return Err(Error::malformed("IPv6 extension header truncated"));
            }
        }

        Ok((TransportProtocol::from_protocol_number(current), offset))
    }

    /// Bytes after the IP header(s).
    pub fn transport(&self) -> &'a [u8] {
        &self.data[self.header_len.min(self.data.len())..]
    }

    /// Verify the TCP or UDP checksum against the pseudo-header.
    pub fn transport_checksum_valid(&self) -> bool {
        let segment = self.transport();
        if self.protocol == TransportProtocol::Udp
            && self.version == IpVersion::V4
            && segment.len() >= UDP_HEADER_LEN
            && segment[6] == 0
            && segment[7] == 0
        {
            // UDP over IPv4 may omit the checksum
            return true;
        }
        let sum = pseudo_header_sum(
            self.src_addr,
            self.dst_addr,
            self.protocol.protocol_number(),
            segment.len(),
        );
        fold(sum_bytes(sum, segment)) == 0xffff
    }
}

/// Parsed TCP header.
#[derive(Debug, Clone)]
pub struct TcpSegment<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    /// MSS option, if present.
    pub mss: Option<u16>,
    pub payload: &'a [u8],
}

impl<'a> TcpSegment<'a> {
    pub fn parse(segment: &'a [u8]) -> Result<Self> {
        if segment.len() < TCP_HEADER_LEN {
            return Err(Error::malformed("TCP header truncated"));
        }
        let data_offset = ((segment[12] >> 4) as usize) * 4;
        if data_offset < TCP_HEADER_LEN || data_offset > segment.len() {
            return Err(Error::malformed(format!("Bad TCP data offset {data_offset}")));
        }

        Ok(Self {
            src_port: u16::from_be_bytes([segment[0], segment[1]]),
            dst_port: u16::from_be_bytes([segment[2], segment[3]]),
            seq: u32::from_be_bytes([segment[4], segment[5], segment[6], segment[7]]),
            ack: u32::from_be_bytes([segment[8], segment[9], segment[10], segment[11]]),
            flags: segment[13],
            window: u16::from_be_bytes([segment[14], segment[15]]),
            mss: parse_mss_option(&segment[TCP_HEADER_LEN..data_offset]),
            payload: &segment[data_offset..],
        })
    }

    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Sequence space consumed by this segment.
    pub fn seq_len(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if self.has(TCP_SYN) {
            len += 1;
        }
        if self.has(TCP_FIN) {
            len += 1;
        }
        len
    }
}

fn parse_mss_option(mut options: &[u8]) -> Option<u16> {
    while let Some(&kind) = options.first() {
        match kind {
            0 => return None,
            1 => options = &options[1..],
            _ => {
                let len = *options.get(1)? as usize;
                if len < 2 || len > options.len() {
                    return None;
                }
                if kind == 2 && len == 4 {
                    return Some(u16::from_be_bytes([options[2], options[3]]));
                }
                options = &options[len..];
            }
        }
    }
    None
}

/// Parsed UDP header.
#[derive(Debug, Clone)]
pub struct UdpDatagram<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

impl<'a> UdpDatagram<'a> {
    pub fn parse(segment: &'a [u8]) -> Result<Self> {
        if segment.len() < UDP_HEADER_LEN {
            return Err(Error::malformed("UDP header truncated"));
        }
        let len = u16::from_be_bytes([segment[4], segment[5]]) as usize;
        if len < UDP_HEADER_LEN || len > segment.len() {
            return Err(Error::malformed(format!("Bad UDP length {len}")));
        }
        Ok(Self {
            src_port: u16::from_be_bytes([segment[0], segment[1]]),
            dst_port: u16::from_be_bytes([segment[2], segment[3]]),
            payload: &segment[UDP_HEADER_LEN..len],
        })
    }
}

/// Fields of an outbound TCP segment.
#[derive(Debug, Clone, Copy)]
pub struct TcpFields<'a> {
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub mss: Option<u16>,
    pub payload: &'a [u8],
}

/// Build a complete IP packet carrying a TCP segment.
pub fn build_tcp_packet(src: SocketAddr, dst: SocketAddr, fields: &TcpFields<'_>) -> Result<Vec<u8>> {
    let options_len = if fields.mss.is_some() { 4 } else { 0 };
    let header_len = TCP_HEADER_LEN + options_len;

    let mut segment = Vec::with_capacity(header_len + fields.payload.len());
    segment.extend_from_slice(&src.port().to_be_bytes());
    segment.extend_from_slice(&dst.port().to_be_bytes());
    segment.extend_from_slice(&fields.seq.to_be_bytes());
    segment.extend_from_slice(&fields.ack.to_be_bytes());
    segment.push(((header_len / 4) as u8) << 4);
    segment.push(fields.flags);
    segment.extend_from_slice(&fields.window.to_be_bytes());
    segment.extend_from_slice(&[0, 0, 0, 0]); // checksum, urgent pointer
    if let Some(mss) = fields.mss {
        segment.extend_from_slice(&[2, 4]);
        segment.extend_from_slice(&mss.to_be_bytes());
    }
    segment.extend_from_slice(fields.payload);

    finish_packet(src.ip(), dst.ip(), TransportProtocol::Tcp, segment, 16)
}

/// Build a complete IP packet carrying a UDP datagram.
pub fn build_udp_packet(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Result<Vec<u8>> {
    let len = UDP_HEADER_LEN + payload.len();
    let udp_len = u16::try_from(len).map_err(|_| Error::PayloadTooLarge {
        size: payload.len(),
        max: usize::from(u16::MAX) - UDP_HEADER_LEN,
    })?;

    let mut datagram = Vec::with_capacity(len);
    datagram.extend_from_slice(&src.port().to_be_bytes());
    datagram.extend_from_slice(&dst.port().to_be_bytes());
    datagram.extend_from_slice(&udp_len.to_be_bytes());
    datagram.extend_from_slice(&[0, 0]);
    datagram.extend_from_slice(payload);

    finish_packet(src.ip(), dst.ip(), TransportProtocol::Udp, datagram, 6)
}

/// Largest transport payload that fits in `mtu` for the given transport header size.
pub fn max_payload(mtu: u16, dst: &IpAddr, transport_header: usize) -> usize {
    let ip_header = match dst {
        IpAddr::V4(_) => IPV4_HEADER_LEN,
        IpAddr::V6(_) => IPV6_HEADER_LEN,
    };
    usize::from(mtu).saturating_sub(ip_header + transport_header)
}

/// Fill in the transport checksum and prepend the IP header.
fn finish_packet(
    src: IpAddr,
    dst: IpAddr,
    protocol: TransportProtocol,
    mut segment: Vec<u8>,
    checksum_offset: usize,
) -> Result<Vec<u8>> {
    let proto = protocol.protocol_number();
    let mut checksum = !fold(sum_bytes(pseudo_header_sum(src, dst, proto, segment.len()), &segment));
    if protocol == TransportProtocol::Udp && checksum == 0 {
        checksum = 0xffff;
    }
    segment[checksum_offset..checksum_offset + 2].copy_from_slice(&checksum.to_be_bytes());

    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let total = IPV4_HEADER_LEN + segment.len();
            let total = u16::try_from(total)
                .map_err(|_| Error::PayloadTooLarge { size: total, max: usize::from(u16::MAX) })?;
            let id = NEXT_IP_ID.fetch_add(1, Ordering::Relaxed);

            let mut packet = Vec::with_capacity(usize::from(total));
            packet.extend_from_slice(&[0x45, 0x00]);
            packet.extend_from_slice(&total.to_be_bytes());
            packet.extend_from_slice(&id.to_be_bytes());
            packet.extend_from_slice(&[0x40, 0x00]); // don't fragment
            packet.extend_from_slice(&[DEFAULT_TTL, proto, 0, 0]);
            packet.extend_from_slice(&s.octets());
            packet.extend_from_slice(&d.octets());
            let header_sum = !fold(sum_bytes(0, &packet));
            packet[10..12].copy_from_slice(&header_sum.to_be_bytes());
            packet.extend_from_slice(&segment);
            Ok(packet)
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            let payload_len = u16::try_from(segment.len()).map_err(|_| Error::PayloadTooLarge {
                size: segment.len(),
                max: usize::from(u16::MAX),
            })?;

            let mut packet = Vec::with_capacity(IPV6_HEADER_LEN + segment.len());
            packet.extend_from_slice(&[0x60, 0, 0, 0]);
            packet.extend_from_slice(&payload_len.to_be_bytes());
            packet.extend_from_slice(&[proto, DEFAULT_TTL]);
            packet.extend_from_slice(&s.octets());
            packet.extend_from_slice(&d.octets());
            packet.extend_from_slice(&segment);
            Ok(packet)
        }
        _ => Err(Error::Protocol(ProtocolError::AddressFamilyMismatch {
            src: src.to_string(),
            dst: dst.to_string(),
        })),
    }
}

fn pseudo_header_sum(src: IpAddr, dst: IpAddr, protocol: u8, len: usize) -> u32 {
    let mut sum = match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => sum_bytes(sum_bytes(0, &s.octets()), &d.octets()),
        (IpAddr::V6(s), IpAddr::V6(d)) => sum_bytes(sum_bytes(0, &s.octets()), &d.octets()),
        (s, d) => sum_bytes(
            sum_bytes(0, &ip_bytes(s)),
            &ip_bytes(d),
        ),
    };
    sum += u32::from(protocol);
    sum += (len as u32) >> 16;
    sum += (len as u32) & 0xffff;
    sum
}

fn ip_bytes(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

/// One's complement sum of big-endian 16-bit words.
fn sum_bytes(mut sum: u32, bytes: &[u8]) -> u32 {
    let mut chunks = bytes.chunks_exact(2);
    for chunk in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([chunk[0], chunk[1]])));
        if sum > 0xffff_0000 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(*last) << 8);
    }
    sum
}

/// Fold a 32-bit sum to 16 bits.
fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    // Sample IPv4 TCP SYN packet
    const IPV4_TCP_SYN: &[u8] = &[
        0x45, 0x00, 0x00, 0x2c, // Version, IHL, TOS, Total Length (44)
        0x1c, 0x46, 0x40, 0x00, // ID, Flags, Fragment Offset
        0x40, 0x06, 0x00, 0x00, // TTL, Protocol (TCP), Checksum (placeholder)
        0xc0, 0xa8, 0x01, 0x01, // Source IP: 192.168.1.1
        0x0a, 0x00, 0x00, 0x01, // Dest IP: 10.0.0.1
        0x04, 0x00, // Source port: 1024
        0x00, 0x50, // Dest port: 80
        0x00, 0x00, 0x00, 0x07, // Sequence number
        0x00, 0x00, 0x00, 0x00, // Ack number
        0x60, 0x02, 0xff, 0xff, // Data offset (24), flags (SYN), window
        0x00, 0x00, 0x00, 0x00, // Checksum, urgent pointer
        0x02, 0x04, 0x05, 0xb4, // MSS 1460
    ];

    #[test]
    fn test_parse_ipv4_syn() {
        let packet = IpPacket::parse(IPV4_TCP_SYN).unwrap();

        assert_eq!(packet.version, IpVersion::V4);
        assert_eq!(packet.header_len, 20);
        assert_eq!(packet.protocol, TransportProtocol::Tcp);
        assert_eq!(packet.src_addr, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(packet.dst_addr, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(packet.ttl, 64);

        let segment = TcpSegment::parse(packet.transport()).unwrap();
        assert_eq!(segment.src_port, 1024);
        assert_eq!(segment.dst_port, 80);
        assert_eq!(segment.seq, 7);
        assert!(segment.has(TCP_SYN));
        assert!(!segment.has(TCP_ACK));
        assert_eq!(segment.mss, Some(1460));
        assert_eq!(segment.seq_len(), 1);
        assert!(segment.payload.is_empty());
    }

    #[test]
    fn test_rejects_truncated_packets() {
        assert!(IpPacket::parse(&[]).is_err());
        assert!(IpPacket::parse(&IPV4_TCP_SYN[..30]).is_err());
        assert!(IpPacket::parse(&[0x70; 40]).is_err());
        assert!(TcpSegment::parse(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_built_tcp_packet_checksums() {
        let src: SocketAddr = "10.0.0.1:80".parse().unwrap();
        let dst: SocketAddr = "192.168.1.1:1024".parse().unwrap();
        let bytes = build_tcp_packet(
            src,
            dst,
            &TcpFields {
                seq: 100,
                ack: 8,
                flags: TCP_SYN | TCP_ACK,
                window: 65535,
                mss: Some(1460),
                payload: &[],
            },
        )
        .unwrap();

        let packet = IpPacket::parse(&bytes).unwrap();
        assert!(packet.transport_checksum_valid());
        assert_eq!(fold(sum_bytes(0, &bytes[..20])), 0xffff);

        let segment = TcpSegment::parse(packet.transport()).unwrap();
        assert_eq!(segment.ack, 8);
        assert_eq!(segment.flags, TCP_SYN | TCP_ACK);
        assert_eq!(segment.mss, Some(1460));
    }

    #[test]
    fn test_built_udp_packet_v6() {
        let src: SocketAddr = "[fd00::1]:53".parse().unwrap();
        let dst: SocketAddr = "[fd00::2]:40000".parse().unwrap();
        let bytes = build_udp_packet(src, dst, b"odd").unwrap();

        let packet = IpPacket::parse(&bytes).unwrap();
        assert_eq!(packet.version, IpVersion::V6);
        assert!(packet.transport_checksum_valid());

        let datagram = UdpDatagram::parse(packet.transport()).unwrap();
        assert_eq!(datagram.dst_port, 40000);
        assert_eq!(datagram.payload, b"odd");
    }

    #[test]
    fn test_mixed_families_rejected() {
        let src: SocketAddr = "10.0.0.1:53".parse().unwrap();
        let dst: SocketAddr = "[fd00::2]:53".parse().unwrap();
        assert!(build_udp_packet(src, dst, b"x").is_err());
    }

    #[test]
    fn test_transport_protocol() {
        assert_eq!(TransportProtocol::Tcp.protocol_number(), 6);
        assert_eq!(TransportProtocol::Udp.protocol_number(), 17);
        assert_eq!(TransportProtocol::from_protocol_number(6), TransportProtocol::Tcp);
    }
}
