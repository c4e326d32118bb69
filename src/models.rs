pub mod domain {
    use std::fmt;

    /// Packet and byte totals for one category or dimension value.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct CounterPair {
        pub packets: u64,
        pub bytes: u64,
    }

    impl CounterPair {
        pub fn new(packets: u64, bytes: u64) -> Self {
            Self { packets, bytes }
        }

        /// Count one frame of `len` bytes.
        pub fn add(&mut self, len: u64) {
            self.packets += 1;
            self.bytes += len;
        }

        pub fn merge(&mut self, other: &CounterPair) {
            self.packets += other.packets;
            self.bytes += other.bytes;
        }

        /// Scale both counters, truncating toward zero.
        pub fn scaled(&self, multiplier: f64) -> CounterPair {
            CounterPair {
                packets: (self.packets as f64 * multiplier) as u64,
                bytes: (self.bytes as f64 * multiplier) as u64,
            }
        }

        /// Select the metric at `offset`: 0 for packets, 1 for bytes.
        pub fn metric(&self, offset: usize) -> u64 {
            match offset {
                0 => self.packets,
                _ => self.bytes,
            }
        }
    }

    /// Name of the ancestor one level up: last segment dropped, trailing
    /// colons stripped. Top-level names have the empty ancestor.
    pub fn parent_name(key: &str) -> &str {
        match key.rsplit_once(':') {
            Some((head, _)) => head.trim_end_matches(':'),
            None => "",
        }
    }

    /// Number of colons; deeper names render first.
    pub fn depth(key: &str) -> usize {
        key.bytes().filter(|&b| b == b':').count()
    }

    /// One line of a persisted statistics file.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct PersistedRecord {
        pub name: String,
        pub packets: u64,
        pub bytes: u64,
    }

    impl PersistedRecord {
        /// Parse `name\tpackets\tbytes`. Anything else yields `None`.
        pub fn parse_line(line: &str) -> Option<Self> {
            let mut fields = line.trim_end().split('\t');
            let name = fields.next()?;
            let packets = fields.next()?.parse().ok()?;
            let bytes = fields.next()?.parse().ok()?;
            if fields.next().is_some() {
                return None;
            }
            Some(Self {
                name: name.trim_end_matches(':').to_string(),
                packets,
                bytes,
            })
        }

        pub fn counters(&self) -> CounterPair {
            CounterPair::new(self.packets, self.bytes)
        }
    }

    impl fmt::Display for PersistedRecord {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}\t{}\t{}", self.name, self.packets, self.bytes)
        }
    }
}

pub mod dto {
    use serde::Serialize;

    /// One chart row: timestamp label then one value per column.
    #[derive(Debug, Serialize, Clone, PartialEq)]
    pub struct FeedRow {
        pub label: String,
        pub values: Vec<f64>,
    }

    /// Everything the charting tool needs for one window and metric.
    #[derive(Debug, Serialize, Clone)]
    pub struct RenderFeed {
        pub title: String,
        pub ylabel: String,
        pub columns: Vec<String>,
        /// Running partial sums across columns, for filled-area stacking.
        pub stacked: Vec<FeedRow>,
        /// Raw per-column rates, for log-scale lines.
        pub lines: Vec<FeedRow>,
    }
}
