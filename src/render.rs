//! Rendering feeds for the external charting tool.
//!
//! Each dirty window yields one feed per metric: a JSON document plus two
//! whitespace separated data tables, stacked and per-group, ready for a
//! gnuplot style plotter.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;
use std::thread;

use tracing::{debug, info};

use crate::config::{RenderConfig, TopNConfig};
use crate::error::Result;
use crate::models::dto::{FeedRow, RenderFeed};
use crate::store::write_atomic;
use crate::topn::{reduce, TopNGroup};
use crate::window::WindowAccumulator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Packets,
    Bits,
}

impl Metric {
    /// Offset of the underlying counter in a [`CounterPair`](crate::models::domain::CounterPair).
    pub fn offset(self) -> usize {
        match self {
            Metric::Packets => 0,
            Metric::Bits => 1,
        }
    }

    pub fn multiplier(self) -> f64 {
        match self {
            Metric::Packets => 1.0,
            Metric::Bits => 8.0,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Metric::Packets => "packets",
            Metric::Bits => "bits",
        }
    }

    fn file_tag(self) -> &'static str {
        match self {
            Metric::Packets => "pps",
            Metric::Bits => "bps",
        }
    }

    fn title_suffix(self) -> &'static str {
        match self {
            Metric::Packets => "Packets",
            Metric::Bits => "Bitrate",
        }
    }
}

fn column_title(group: &TopNGroup) -> String {
    if group.is_other() {
        "Other".to_string()
    } else {
        group.name.clone()
    }
}

/// Reduce the window for `metric` and lay out its chart tables.
pub fn build_feed(
    window: &WindowAccumulator,
    metric: Metric,
    topn: TopNConfig,
    interval_secs: f64,
) -> RenderFeed {
    let offset = metric.offset();
    let groups = reduce(&window.metric_totals(offset), topn);
    debug!(stem = %window.stem, metric = metric.label(), groups = groups.len(), "reduced");

    let mut column_of: HashMap<&str, usize> = HashMap::new();
    for (index, group) in groups.iter().enumerate() {
        for key in &group.covered {
            column_of.insert(key.as_str(), index);
        }
    }

    let multiplier = metric.multiplier();
    let mut stacked = Vec::with_capacity(window.slots().len());
    let mut lines = Vec::with_capacity(window.slots().len());
    for (timestamp, slot) in window.slots() {
        let mut sums = vec![0.0; groups.len()];
        for (name, pair) in slot {
            if let Some(&column) = column_of.get(name.as_str()) {
                sums[column] += pair.metric(offset) as f64;
            }
        }
        let rates: Vec<f64> = sums.iter().map(|v| multiplier * v / interval_secs).collect();
        let running: Vec<f64> = rates
            .iter()
            .scan(0.0, |acc, rate| {
                *acc += rate;
                Some(*acc)
            })
            .collect();
        let label = timestamp.format("%Y%m%d-%H%M").to_string();
        stacked.push(FeedRow {
            label: label.clone(),
            values: running,
        });
        lines.push(FeedRow {
            label,
            values: rates,
        });
    }

    RenderFeed {
        title: format!("{} {}", window.title, metric.title_suffix()),
        ylabel: format!("{}-per-second", metric.label()),
        columns: groups.iter().map(column_title).collect(),
        stacked,
        lines,
    }
}

fn data_table(rows: &[FeedRow]) -> String {
    let mut out = String::new();
    for row in rows {
        out.push_str(&row.label);
        for value in &row.values {
            let _ = write!(out, " {value:.2}");
        }
        out.push('\n');
    }
    out
}

/// Write the JSON document and data tables of one feed under `out_dir`.
pub fn write_feed(out_dir: &Path, base: &str, feed: &RenderFeed) -> Result<()> {
    let json = serde_json::to_vec_pretty(feed)?;
    write_atomic(&out_dir.join(format!("{base}.json")), &json)?;
    write_atomic(
        &out_dir.join(format!("{base}-stacked.dat")),
        data_table(&feed.stacked).as_bytes(),
    )?;
    write_atomic(
        &out_dir.join(format!("{base}-log.dat")),
        data_table(&feed.lines).as_bytes(),
    )?;
    Ok(())
}

fn render_metric(
    window: &WindowAccumulator,
    metric: Metric,
    out_dir: &Path,
    topn: TopNConfig,
    config: &RenderConfig,
) -> Result<()> {
    let feed = build_feed(window, metric, topn, config.interval_secs);
    let base = format!("{}-{}", window.stem, metric.file_tag());
    write_feed(out_dir, &base, &feed)
}

/// Render both metrics of `window`, one per thread.
pub fn render_window(
    window: &WindowAccumulator,
    out_dir: &Path,
    topn: TopNConfig,
    config: &RenderConfig,
) -> Result<()> {
    info!(stem = %window.stem, categories = window.totals().len(), "rendering");
    let (packets, bits) = thread::scope(|s| {
        let packets = s.spawn(|| render_metric(window, Metric::Packets, out_dir, topn, config));
        let bits = render_metric(window, Metric::Bits, out_dir, topn, config);
        let packets = packets
            .join()
            .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
        (packets, bits)
    });
    packets?;
    bits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ViewConfig;
    use crate::models::domain::PersistedRecord;
    use crate::window::Resolution;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn record(name: &str, packets: u64, bytes: u64) -> PersistedRecord {
        PersistedRecord {
            name: name.to_string(),
            packets,
            bytes,
        }
    }

    fn window() -> WindowAccumulator {
        let view = ViewConfig {
            filter: String::new(),
            subtitle: "All subnets".into(),
        };
        let day = NaiveDate::from_ymd_opt(2013, 5, 1).unwrap();
        let mut w = WindowAccumulator::new(Resolution::Daily, day, &view, &RenderConfig::default());
        w.add(
            day.and_hms_opt(12, 0, 0).unwrap(),
            &[record("a", 3000, 30000), record("a:b", 600, 6000), record("d", 30, 300)],
        );
        w.add(
            day.and_hms_opt(12, 5, 0).unwrap(),
            &[record("a", 300, 3000), record("a:b", 60, 600)],
        );
        w
    }

    fn topn(n: usize) -> TopNConfig {
        TopNConfig {
            max_elements: n,
            max_size_fraction: 0.04,
        }
    }

    #[test]
    fn feed_rows_are_rates_in_group_order() {
        let feed = build_feed(&window(), Metric::Packets, topn(2), 300.0);
        assert_eq!(feed.columns, vec!["a:b", "a", "Other"]);
        assert_eq!(feed.ylabel, "packets-per-second");
        assert_eq!(feed.title, "Traffic (All subnets): 5/1/2013 Packets");
        assert_eq!(feed.lines.len(), 2);
        assert_eq!(feed.lines[0].label, "20130501-1200");
        assert_eq!(feed.lines[0].values, vec![2.0, 10.0, 0.1]);
        assert_eq!(feed.lines[1].values, vec![0.2, 1.0, 0.0]);
    }

    #[test]
    fn stacked_row_ends_at_line_sum() {
        let feed = build_feed(&window(), Metric::Bits, topn(2), 300.0);
        for (stacked, line) in feed.stacked.iter().zip(&feed.lines) {
            let sum: f64 = line.values.iter().sum();
            let last = *stacked.values.last().unwrap();
            assert!((last - sum).abs() < 1e-9);
        }
        // bits: 30000 bytes * 8 / 300 s
        assert!((feed.lines[0].values[1] - 800.0).abs() < 1e-9);
    }

    #[test]
    fn no_other_column_when_everything_fits() {
        let feed = build_feed(&window(), Metric::Packets, topn(33), 300.0);
        assert_eq!(feed.columns.len(), 3);
        assert!(!feed.columns.iter().any(|c| c == "Other"));
    }

    #[test]
    fn render_writes_both_metrics() {
        let out = TempDir::new().unwrap();
        let w = window();
        render_window(&w, out.path(), topn(2), &RenderConfig::default()).unwrap();
        for tag in ["pps", "bps"] {
            let base = format!("{}-{}", w.stem, tag);
            let json = std::fs::read_to_string(out.path().join(format!("{base}.json"))).unwrap();
            let doc: serde_json::Value = serde_json::from_str(&json).unwrap();
            assert_eq!(doc["columns"].as_array().unwrap().len(), 3);

            let log = std::fs::read_to_string(out.path().join(format!("{base}-log.dat"))).unwrap();
            assert_eq!(log.lines().count(), 2);
            assert!(out.path().join(format!("{base}-stacked.dat")).exists());
        }
        let stacked = std::fs::read_to_string(
            out.path().join("traffic-20130501-daily-all-pps-stacked.dat"),
        )
        .unwrap();
        assert_eq!(stacked.lines().next().unwrap(), "20130501-1200 2.00 12.00 12.10");
    }
}
