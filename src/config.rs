//! Engine configuration.
//!
//! Every component receives its section of [`EngineConfig`] at construction
//! and never mutates it. The whole structure can be loaded from a JSON file;
//! missing sections and fields fall back to the defaults below.

use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub classifier: ClassifierConfig,
    pub sampling: SamplingConfig,
    pub topn: TopNConfig,
    pub windows: WindowConfig,
    pub render: RenderConfig,
    pub scan: ScanConfig,
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Ports and endpoints the rule table keys on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub dns_port: u16,
    pub sip_port: u16,
    pub mgcp_port: u16,
    /// Time protocol port abused by the spoofed-source flood.
    pub time_port: u16,
    /// Wire length of the spoofed time flood frames.
    pub time_flood_frame_len: u32,
    /// First octets of source ranges seen spoofed in the time flood.
    pub spoofed_first_octets: Vec<u8>,
    pub app_addr: Ipv4Addr,
    pub app_port: u16,
    pub app_name: String,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            dns_port: 53,
            sip_port: 5060,
            mgcp_port: 2727,
            time_port: 37,
            time_flood_frame_len: 60,
            spoofed_first_octets: vec![86, 81, 109, 217],
            app_addr: Ipv4Addr::new(1, 2, 3, 4),
            app_port: 8888,
            app_name: "HotelNet".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Substring marking a sampled capture file.
    pub sample_marker: String,
    /// Basename prefix of small-packet samples.
    pub small_sample_prefix: String,
    pub small_sample_rate: f64,
    pub large_sample_rate: f64,
    /// Directory holding the capture tool's drop-rate files, by date.
    pub capture_stats_dir: Option<PathBuf>,
    /// Categories with at most this many packets fold into their parent.
    pub fold_threshold: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            sample_marker: "sample".to_string(),
            small_sample_prefix: "1".to_string(),
            small_sample_rate: 32.0,
            large_sample_rate: 128.0,
            capture_stats_dir: None,
            fold_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TopNConfig {
    pub max_elements: usize,
    /// Share of the total above which a group is too big to absorb others.
    pub max_size_fraction: f64,
}

impl Default for TopNConfig {
    fn default() -> Self {
        Self {
            max_elements: 33,
            max_size_fraction: 0.04,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub hourly: bool,
    pub daily: bool,
    pub weekly: bool,
    pub monthly: bool,
    pub daily_retention_days: i64,
    pub weekly_retention_days: i64,
    pub monthly_retention_days: i64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            hourly: false,
            daily: true,
            weekly: false,
            monthly: false,
            daily_retention_days: 1,
            weekly_retention_days: 8,
            monthly_retention_days: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Seconds covered by one statistics file.
    pub interval_secs: f64,
    pub title: String,
    pub file_prefix: String,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300.0,
            title: "Traffic".to_string(),
            file_prefix: "traffic".to_string(),
        }
    }
}

/// A filename-filtered slice of the statistics tree, rendered on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewConfig {
    /// Substring a statistics file name must contain; empty matches all.
    pub filter: String,
    pub subtitle: String,
}

impl ViewConfig {
    /// Suffix appended to output file stems.
    pub fn file_suffix(&self) -> String {
        if self.filter.is_empty() {
            "-all".to_string()
        } else {
            format!("-{}", self.filter)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub poll_interval_secs: u64,
    /// Files containing this marker are never aggregated.
    pub skip_marker: String,
    /// Files younger than this may still be written to.
    pub min_file_age_secs: u64,
    pub hourly_lookback_minutes: i64,
    pub scan_all_dates: bool,
    pub views: Vec<ViewConfig>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            skip_marker: "large".to_string(),
            min_file_age_secs: 30,
            hourly_lookback_minutes: 65,
            scan_all_dates: false,
            views: vec![ViewConfig {
                filter: String::new(),
                subtitle: "All subnets".to_string(),
            }],
        }
    }
}
