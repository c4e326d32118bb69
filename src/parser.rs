//! Frame decoder for Ethernet + IPv4 frames.
//!
//! Decoding never fails: a short buffer yields a partially populated
//! [`DecodedFrame`] and the classifier simply skips rules whose fields are
//! missing.

use std::net::Ipv4Addr;

use etherparse::{Ethernet2Header, IpNumber};

pub const PROTO_ICMP: u8 = IpNumber::ICMP.0;
pub const PROTO_TCP: u8 = IpNumber::TCP.0;
pub const PROTO_UDP: u8 = IpNumber::UDP.0;
pub const PROTO_GRE: u8 = IpNumber::GRE.0;

const ETH_LEN: usize = Ethernet2Header::LEN;
const FRAG_OFFSET_MASK: u16 = 0x1fff;

pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedFrame {
    pub header_len: Option<usize>,
    pub frag_offset: Option<u16>,
    pub protocol: Option<u8>,
    pub src_ip: Option<Ipv4Addr>,
    pub dst_ip: Option<Ipv4Addr>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub tcp_flags: Option<u8>,
    pub icmp_type: Option<u8>,
    pub icmp_code: Option<u8>,
}

impl DecodedFrame {
    pub fn is_udp(&self) -> bool {
        self.protocol == Some(PROTO_UDP)
    }

    pub fn is_tcp(&self) -> bool {
        self.protocol == Some(PROTO_TCP)
    }

    pub fn dst_port_is(&self, port: u16) -> bool {
        self.dst_port == Some(port)
    }
}

/// Decode `data`, of which only the first `captured_len` bytes are valid.
pub fn decode(data: &[u8], captured_len: usize) -> DecodedFrame {
    let buf = &data[..data.len().min(captured_len)];
    let mut frame = DecodedFrame::default();

    let Some(ip) = buf.get(ETH_LEN..) else {
        return frame;
    };

    if let Some(&b) = ip.first() {
        frame.header_len = Some(usize::from(b & 0x0f) * 4);
    }
    frame.frag_offset = be_u16(ip, 6).map(|v| v & FRAG_OFFSET_MASK);
    frame.protocol = ip.get(9).copied();
    frame.src_ip = addr(ip, 12);
    frame.dst_ip = addr(ip, 16);

    // Non-initial fragments carry no transport header.
    if frame.frag_offset != Some(0) {
        return frame;
    }
    let (Some(offset), Some(proto)) = (frame.header_len, frame.protocol) else {
        return frame;
    };
    let Some(transport) = ip.get(offset..) else {
        return frame;
    };

    match proto {
        PROTO_TCP | PROTO_UDP if transport.len() >= 4 => {
            frame.src_port = be_u16(transport, 0);
            frame.dst_port = be_u16(transport, 2);
            if proto == PROTO_TCP {
                frame.tcp_flags = transport.get(13).copied();
            }
        }
        PROTO_ICMP if transport.len() >= 2 => {
            frame.icmp_type = Some(transport[0]);
            frame.icmp_code = Some(transport[1]);
        }
        _ => {}
    }
    frame
}

fn be_u16(buf: &[u8], at: usize) -> Option<u16> {
    let bytes = buf.get(at..at + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn addr(buf: &[u8], at: usize) -> Option<Ipv4Addr> {
    let b = buf.get(at..at + 4)?;
    Some(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn decodes_tcp_syn() {
        let raw = tcp([10, 0, 0, 1], [1, 2, 3, 4], 40000, 8888, TCP_SYN);
        let f = decode(&raw, raw.len());
        assert_eq!(f.protocol, Some(PROTO_TCP));
        assert_eq!(f.header_len, Some(20));
        assert_eq!(f.frag_offset, Some(0));
        assert_eq!(f.src_ip, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(f.dst_ip, Some(Ipv4Addr::new(1, 2, 3, 4)));
        assert_eq!(f.src_port, Some(40000));
        assert_eq!(f.dst_port, Some(8888));
        assert_eq!(f.tcp_flags, Some(TCP_SYN));
        assert_eq!(f.icmp_type, None);
    }

    #[test]
    fn decodes_icmp_type_and_code() {
        let raw = ipv4(PROTO_ICMP, [8, 8, 8, 8], [1, 1, 1, 1], &[3, 1, 0, 0]);
        let f = decode(&raw, raw.len());
        assert_eq!(f.icmp_type, Some(3));
        assert_eq!(f.icmp_code, Some(1));
        assert_eq!(f.dst_port, None);
    }

    #[test]
    fn short_buffer_is_partial_not_fatal() {
        let raw = tcp([10, 0, 0, 1], [1, 2, 3, 4], 1, 2, 0);
        assert_eq!(decode(&raw[..10], 10), DecodedFrame::default());

        // IP header up to the protocol byte only
        let f = decode(&raw, ETH_LEN + 10);
        assert_eq!(f.protocol, Some(PROTO_TCP));
        assert_eq!(f.src_ip, None);
        assert_eq!(f.dst_ip, None);
        assert_eq!(f.dst_port, None);

        // Ports present, flags byte cut off
        let f = decode(&raw, ETH_LEN + 20 + 4);
        assert_eq!(f.dst_port, Some(2));
        assert_eq!(f.tcp_flags, None);
    }

    #[test]
    fn non_initial_fragment_has_no_transport_fields() {
        let mut raw = udp([10, 0, 0, 1], [1, 1, 1, 1], 53, 53, b"data");
        // fragment offset 185, MF clear
        raw[ETH_LEN + 6] = 0x00;
        raw[ETH_LEN + 7] = 0xb9;
        let f = decode(&raw, raw.len());
        assert_eq!(f.frag_offset, Some(185));
        assert_eq!(f.src_port, None);
        assert_eq!(f.dst_port, None);
    }

    #[test]
    fn dont_fragment_flag_is_not_an_offset() {
        let raw = udp([10, 0, 0, 1], [1, 1, 1, 1], 1000, 53, b"");
        // builder sets DF (0x4000)
        let f = decode(&raw, raw.len());
        assert_eq!(f.frag_offset, Some(0));
        assert_eq!(f.dst_port, Some(53));
    }

    #[test]
    fn captured_len_limits_buffer() {
        let raw = udp([10, 0, 0, 1], [1, 1, 1, 1], 1000, 53, b"payload");
        let f = decode(&raw, ETH_LEN + 20);
        assert_eq!(f.dst_ip, Some(Ipv4Addr::new(1, 1, 1, 1)));
        assert_eq!(f.dst_port, None);
    }
}
