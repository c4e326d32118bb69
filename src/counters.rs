//! Per-run category counters.
//!
//! One [`CategoryCounters`] lives for the duration of a single capture file.
//! Every update is a commutative sum, so the final totals do not depend on
//! the order frames are recorded in.

use std::collections::HashMap;
use std::hash::Hash;
use std::net::Ipv4Addr;

use crate::models::domain::CounterPair;
use crate::parser::DecodedFrame;

/// Secondary dimensions of one frame. Missing fields are not counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dimensions {
    pub protocol: Option<u8>,
    pub src_ip: Option<Ipv4Addr>,
    pub dst_ip: Option<Ipv4Addr>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
}

impl From<&DecodedFrame> for Dimensions {
    fn from(f: &DecodedFrame) -> Self {
        Self {
            protocol: f.protocol,
            src_ip: f.src_ip,
            dst_ip: f.dst_ip,
            src_port: f.src_port,
            dst_port: f.dst_port,
        }
    }
}

/// Selects one secondary dimension for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    SrcIp,
    DstIp,
    SrcPort,
    DstPort,
    ProtoDstPort,
    Protocol,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryStats {
    pub total: CounterPair,
    pub by_src_ip: HashMap<Ipv4Addr, CounterPair>,
    pub by_dst_ip: HashMap<Ipv4Addr, CounterPair>,
    pub by_src_port: HashMap<u16, CounterPair>,
    pub by_dst_port: HashMap<u16, CounterPair>,
    pub by_proto_dst_port: HashMap<(u8, u16), CounterPair>,
    pub by_protocol: HashMap<u8, CounterPair>,
}

impl CategoryStats {
    fn update(&mut self, dims: &Dimensions, len: u64) {
        self.total.add(len);
        bump(&mut self.by_protocol, dims.protocol, len);
        bump(&mut self.by_src_ip, dims.src_ip, len);
        bump(&mut self.by_dst_ip, dims.dst_ip, len);
        bump(&mut self.by_src_port, dims.src_port, len);
        bump(&mut self.by_dst_port, dims.dst_port, len);
        let proto_port = dims.protocol.zip(dims.dst_port);
        bump(&mut self.by_proto_dst_port, proto_port, len);
    }

    /// The `n` heaviest values of one dimension by packet count, rendered as
    /// text, heaviest first.
    pub fn top(&self, dimension: Dimension, n: usize) -> Vec<(String, CounterPair)> {
        let mut rows: Vec<(String, CounterPair)> = match dimension {
            Dimension::SrcIp => render(&self.by_src_ip, |ip| ip.to_string()),
            Dimension::DstIp => render(&self.by_dst_ip, |ip| ip.to_string()),
            Dimension::SrcPort => render(&self.by_src_port, |p| p.to_string()),
            Dimension::DstPort => render(&self.by_dst_port, |p| p.to_string()),
            Dimension::ProtoDstPort => {
                render(&self.by_proto_dst_port, |(proto, port)| format!("{proto}/{port}"))
            }
            Dimension::Protocol => render(&self.by_protocol, |p| p.to_string()),
        };
        rows.sort_by(|a, b| b.1.packets.cmp(&a.1.packets).then_with(|| a.0.cmp(&b.0)));
        rows.truncate(n);
        rows
    }
}

fn bump<K: Eq + Hash>(map: &mut HashMap<K, CounterPair>, key: Option<K>, len: u64) {
    if let Some(key) = key {
        map.entry(key).or_default().add(len);
    }
}

fn render<K, F>(map: &HashMap<K, CounterPair>, label: F) -> Vec<(String, CounterPair)>
where
    F: Fn(&K) -> String,
{
    map.iter().map(|(k, v)| (label(k), *v)).collect()
}

#[derive(Debug, Default)]
pub struct CategoryCounters {
    stats: HashMap<String, CategoryStats>,
    total: CounterPair,
}

impl CategoryCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, category: &str, dims: &Dimensions, len: u64) {
        self.total.add(len);
        // avoid allocating the key for categories already seen
        if let Some(stats) = self.stats.get_mut(category) {
            stats.update(dims, len);
            return;
        }
        self.stats
            .entry(category.to_string())
            .or_default()
            .update(dims, len);
    }

    pub fn get(&self, category: &str) -> Option<&CategoryStats> {
        self.stats.get(category)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CategoryStats)> {
        self.stats.iter()
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    /// Totals across every category.
    pub fn total(&self) -> CounterPair {
        self.total
    }

    /// Category totals only, for persisting.
    pub fn totals(&self) -> HashMap<String, CounterPair> {
        self.stats
            .iter()
            .map(|(k, v)| (k.clone(), v.total))
            .collect()
    }

    /// Hand over the finished category totals, leaving the counters empty.
    pub fn drain(&mut self) -> HashMap<String, CounterPair> {
        self.total = CounterPair::default();
        self.stats.drain().map(|(k, v)| (k, v.total)).collect()
    }

    /// Forget everything; called between input files.
    pub fn reset(&mut self) {
        self.stats.clear();
        self.total = CounterPair::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims(src: [u8; 4], dport: Option<u16>) -> Dimensions {
        Dimensions {
            protocol: Some(17),
            src_ip: Some(Ipv4Addr::from(src)),
            dst_ip: Some(Ipv4Addr::new(1, 1, 1, 1)),
            src_port: Some(1024),
            dst_port: dport,
        }
    }

    #[test]
    fn record_updates_totals_and_dimensions() {
        let mut c = CategoryCounters::new();
        c.record("UDP:DNS:DNSReq:1.1.1.1|53", &dims([10, 0, 0, 1], Some(53)), 80);
        c.record("UDP:DNS:DNSReq:1.1.1.1|53", &dims([10, 0, 0, 2], Some(53)), 120);
        c.record("UDP:::1.1.1.1|0", &dims([10, 0, 0, 1], None), 60);

        let dns = c.get("UDP:DNS:DNSReq:1.1.1.1|53").unwrap();
        assert_eq!(dns.total, CounterPair::new(2, 200));
        assert_eq!(dns.by_src_ip.len(), 2);
        assert_eq!(dns.by_dst_port[&53], CounterPair::new(2, 200));
        assert_eq!(dns.by_proto_dst_port[&(17, 53)], CounterPair::new(2, 200));

        let other = c.get("UDP:::1.1.1.1|0").unwrap();
        assert!(other.by_dst_port.is_empty());
        assert!(other.by_proto_dst_port.is_empty());
        assert_eq!(other.by_protocol[&17], CounterPair::new(1, 60));

        assert_eq!(c.total(), CounterPair::new(3, 260));
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn reset_clears_run() {
        let mut c = CategoryCounters::new();
        c.record("a", &Dimensions::default(), 10);
        c.reset();
        assert!(c.is_empty());
        assert_eq!(c.total(), CounterPair::default());
    }

    #[test]
    fn drain_hands_over_totals() {
        let mut c = CategoryCounters::new();
        c.record("a", &Dimensions::default(), 10);
        c.record("a", &Dimensions::default(), 5);
        let totals = c.drain();
        assert_eq!(totals["a"], CounterPair::new(2, 15));
        assert!(c.is_empty());
        assert_eq!(c.total(), CounterPair::default());
    }

    #[test]
    fn top_orders_by_packets() {
        let mut c = CategoryCounters::new();
        for _ in 0..3 {
            c.record("k", &dims([10, 0, 0, 3], Some(53)), 10);
        }
        c.record("k", &dims([10, 0, 0, 1], Some(53)), 10);
        for _ in 0..2 {
            c.record("k", &dims([10, 0, 0, 2], Some(53)), 10);
        }
        let top = c.get("k").unwrap().top(Dimension::SrcIp, 2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0], ("10.0.0.3".to_string(), CounterPair::new(3, 30)));
        assert_eq!(top[1].0, "10.0.0.2");
    }
}
