//! Ordered rule table assigning every frame one category key.
//!
//! Keys look like `protocol:general:specific:dstip|port`, for example
//! `UDP:flood:0xffff:1.1.1.1|80`. Rules are evaluated top to bottom and the
//! first match wins, so attack signatures sit above the generic protocol
//! buckets. Everything not called out explicitly still ends up grouped by
//! destination address and port through the last segment.

use std::fmt;
use std::net::Ipv4Addr;

use crate::config::ClassifierConfig;
use crate::parser::{
    DecodedFrame, PROTO_GRE, PROTO_ICMP, PROTO_TCP, PROTO_UDP, TCP_FIN, TCP_RST, TCP_SYN,
};

/// Frames at least this long are checked for repeated-word flood payloads.
const FLOOD_MIN_LEN: usize = 71;
const FLOOD_WORD_STEP: u32 = 0x101;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rule {
    UdpFloodPattern,
    SpoofedTimeFlood,
    Dns,
    Sip,
    Mgcp,
    AppEndpoint,
    TcpFlags,
    TransportFallback,
    Icmp,
    Gre,
    MiscProto,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Everything a rule may look at for one frame.
pub struct Packet<'a> {
    pub frame: &'a DecodedFrame,
    pub raw: &'a [u8],
    /// Length of the frame on the wire, before capture truncation.
    pub wire_len: u32,
}

type Detector = for<'a> fn(&Classifier, &Packet<'a>) -> Option<String>;

/// Priority order is part of the contract: do not reorder.
const RULES: [(Rule, Detector); 11] = [
    (Rule::UdpFloodPattern, Classifier::detect_udp_flood),
    (Rule::SpoofedTimeFlood, Classifier::detect_spoofed_time_flood),
    (Rule::Dns, Classifier::detect_dns),
    (Rule::Sip, Classifier::detect_sip),
    (Rule::Mgcp, Classifier::detect_mgcp),
    (Rule::AppEndpoint, Classifier::detect_app_endpoint),
    (Rule::TcpFlags, Classifier::detect_tcp_flags),
    (Rule::TransportFallback, Classifier::detect_transport_fallback),
    (Rule::Icmp, Classifier::detect_icmp),
    (Rule::Gre, Classifier::detect_gre),
    (Rule::MiscProto, Classifier::detect_misc_proto),
];

#[derive(Debug, Clone)]
pub struct Classifier {
    config: ClassifierConfig,
}

impl Classifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn classify(&self, frame: &DecodedFrame, raw: &[u8], wire_len: u32) -> String {
        self.classify_with_rule(frame, raw, wire_len).1
    }

    /// Classify and report which rule fired.
    pub fn classify_with_rule(
        &self,
        frame: &DecodedFrame,
        raw: &[u8],
        wire_len: u32,
    ) -> (Rule, String) {
        let packet = Packet {
            frame,
            raw,
            wire_len,
        };
        for (rule, detect) in RULES {
            if let Some(key) = detect(self, &packet) {
                return (rule, key);
            }
        }
        // detect_misc_proto accepts every frame
        (Rule::MiscProto, category(frame, "MiscProto", "Truncated", ""))
    }

    fn detect_udp_flood(&self, p: &Packet<'_>) -> Option<String> {
        if !p.frame.is_udp() || p.raw.len() < FLOOD_MIN_LEN {
            return None;
        }
        let raw = p.raw;
        if raw[52..56] == raw[56..60] && raw[52..54] == raw[54..56] {
            let pattern = format!("0x{:02x}{:02x}", raw[52], raw[53]);
            return Some(category(p.frame, "UDP", "flood", &pattern));
        }
        let word = |at: usize| u32::from(u16::from_le_bytes([raw[at], raw[at + 1]]));
        if word(50) + FLOOD_WORD_STEP == word(66) && word(52) + FLOOD_WORD_STEP == word(68) {
            return Some(category(p.frame, "UDP", "flood", "0x101-offset"));
        }
        None
    }

    fn detect_spoofed_time_flood(&self, p: &Packet<'_>) -> Option<String> {
        let cfg = &self.config;
        let spoofed = p
            .frame
            .src_ip
            .is_some_and(|ip| cfg.spoofed_first_octets.contains(&ip.octets()[0]));
        (p.frame.is_udp()
            && p.frame.dst_port_is(cfg.time_port)
            && p.wire_len == cfg.time_flood_frame_len
            && spoofed)
            .then(|| category(p.frame, "UDP", "flood", "btcentral-time"))
    }

    fn detect_dns(&self, p: &Packet<'_>) -> Option<String> {
        let port = self.config.dns_port;
        if !p.frame.is_udp() || !p.frame.dst_port_is(port) {
            return None;
        }
        let specific = if p.frame.src_port == Some(port) {
            "DNSAnswer"
        } else {
            "DNSReq"
        };
        Some(category(p.frame, "UDP", "DNS", specific))
    }

    fn detect_sip(&self, p: &Packet<'_>) -> Option<String> {
        if !p.frame.is_udp() || !p.frame.dst_port_is(self.config.sip_port) {
            return None;
        }
        let specific = if contains(p.raw, b"REGISTER") {
            "REGISTER"
        } else if contains(p.raw, b"OPTIONS") {
            "OPTIONS"
        } else {
            ""
        };
        Some(category(p.frame, "UDP", "SIP", specific))
    }

    fn detect_mgcp(&self, p: &Packet<'_>) -> Option<String> {
        if !p.frame.is_udp() || !p.frame.dst_port_is(self.config.mgcp_port) {
            return None;
        }
        let specific = if contains(p.raw, b"RSIP") {
            "RestartIP"
        } else {
            ""
        };
        Some(category(p.frame, "UDP", "MGCP", specific))
    }

    fn detect_app_endpoint(&self, p: &Packet<'_>) -> Option<String> {
        let cfg = &self.config;
        (p.frame.is_tcp()
            && p.frame.dst_port_is(cfg.app_port)
            && p.frame.dst_ip == Some(cfg.app_addr))
            .then(|| category(p.frame, "TCP", &cfg.app_name, ""))
    }

    fn detect_tcp_flags(&self, p: &Packet<'_>) -> Option<String> {
        if !p.frame.is_tcp() {
            return None;
        }
        let flags = p.frame.tcp_flags?;
        let general = if flags & TCP_SYN != 0 {
            "SYN"
        } else if flags & (TCP_FIN | TCP_RST) != 0 {
            "Close"
        } else {
            "ACK"
        };
        Some(category(p.frame, "TCP", general, ""))
    }

    fn detect_transport_fallback(&self, p: &Packet<'_>) -> Option<String> {
        match p.frame.protocol? {
            PROTO_UDP => Some(category(p.frame, "UDP", "", "")),
            PROTO_TCP => Some(category(p.frame, "TCP", "", "")),
            _ => None,
        }
    }

    fn detect_icmp(&self, p: &Packet<'_>) -> Option<String> {
        if p.frame.protocol != Some(PROTO_ICMP) {
            return None;
        }
        let general = format!("type-{}", p.frame.icmp_type.unwrap_or(0));
        // the code stands in for the port so types group per code
        Some(format_key(
            "ICMP",
            &general,
            "",
            p.frame.dst_ip,
            p.frame.icmp_code.map(u16::from),
        ))
    }

    fn detect_gre(&self, p: &Packet<'_>) -> Option<String> {
        (p.frame.protocol == Some(PROTO_GRE)).then(|| category(p.frame, "GRE", "", ""))
    }

    fn detect_misc_proto(&self, p: &Packet<'_>) -> Option<String> {
        let general = match p.frame.protocol {
            Some(proto) => format!("Proto-{proto}"),
            None => "Truncated".to_string(),
        };
        Some(category(p.frame, "MiscProto", &general, ""))
    }
}

fn category(frame: &DecodedFrame, protocol: &str, general: &str, specific: &str) -> String {
    format_key(protocol, general, specific, frame.dst_ip, frame.dst_port)
}

fn format_key(
    protocol: &str,
    general: &str,
    specific: &str,
    dst: Option<Ipv4Addr>,
    port: Option<u16>,
) -> String {
    format!(
        "{protocol}:{general}:{specific}:{}|{}",
        dst.unwrap_or(Ipv4Addr::UNSPECIFIED),
        port.unwrap_or(0)
    )
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
