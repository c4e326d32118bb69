//! Persisted per-capture statistics.
//!
//! Each capture file `<group>-<YYYYMMDD>-<HHMM>.pcap` produces one statistics
//! file `<stats_dir>/<YYYYMMDD>/<basename>.stats` holding one
//! `name\tpackets\tbytes` line per category, scaled up to estimate the
//! unsampled traffic. Files are written through a temporary file and renamed
//! into place, so a reader never sees a partial file.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::config::SamplingConfig;
use crate::error::{Error, Result};
use crate::models::domain::{parent_name, CounterPair, PersistedRecord};

pub const STATS_SUFFIX: &str = ".stats";

/// The parts of a capture file name the statistics layout depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureName {
    pub basename: String,
    pub group: String,
    pub date: NaiveDate,
    pub time: String,
}

impl CaptureName {
    pub fn parse(path: &Path) -> Result<Self> {
        let basename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidFileName(path.display().to_string()))?;
        let parts: Vec<&str> = basename.split('-').collect();
        let [group, date, time] = parts.as_slice() else {
            return Err(Error::InvalidFileName(basename.to_string()));
        };
        let date = NaiveDate::parse_from_str(date, "%Y%m%d")
            .map_err(|_| Error::InvalidFileName(basename.to_string()))?;
        Ok(Self {
            basename: basename.to_string(),
            group: group.to_string(),
            date,
            time: time.to_string(),
        })
    }

    pub fn date_dir(&self) -> String {
        self.date.format("%Y%m%d").to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Written,
    Replaced,
    /// A statistics file already existed and overwriting was not requested.
    Skipped,
}

pub struct StatsStore {
    stats_dir: PathBuf,
    sampling: SamplingConfig,
}

impl StatsStore {
    pub fn new(stats_dir: impl Into<PathBuf>, sampling: SamplingConfig) -> Self {
        Self {
            stats_dir: stats_dir.into(),
            sampling,
        }
    }

    pub fn stats_path(&self, name: &CaptureName) -> PathBuf {
        self.stats_dir
            .join(name.date_dir())
            .join(format!("{}{}", name.basename, STATS_SUFFIX))
    }

    pub fn has_stats(&self, name: &CaptureName) -> bool {
        self.stats_path(name).exists()
    }

    /// Factor turning sampled counts into estimated totals.
    pub fn sample_multiplier(&self, name: &CaptureName) -> f64 {
        let cfg = &self.sampling;
        let mut multiplier = if !name.basename.contains(&cfg.sample_marker) {
            1.0
        } else if name.basename.starts_with(&cfg.small_sample_prefix) {
            cfg.small_sample_rate
        } else {
            cfg.large_sample_rate
        };
        if let Some(dir) = &cfg.capture_stats_dir {
            let path = dir.join(name.date_dir()).join(&name.basename);
            if let Some(correction) = drop_correction(&path) {
                multiplier *= correction;
            }
        }
        multiplier
    }

    /// Fold, scale and write the category totals of one finished capture file.
    pub fn save(
        &self,
        name: &CaptureName,
        totals: &HashMap<String, CounterPair>,
        overwrite: bool,
    ) -> Result<SaveOutcome> {
        let path = self.stats_path(name);
        let multiplier = self.sample_multiplier(name);
        info!(
            path = %path.display(),
            "writing stats (sample rate: {:.2})",
            multiplier
        );
        let folded = fold_low_counts(totals, self.sampling.fold_threshold);
        let records = scale_records(&folded, multiplier);
        write_records(&path, &records, overwrite)
    }
}

/// Correction for packets the capture tool dropped, from its
/// `seen received dropped` file. `None` when absent or unusable.
fn drop_correction(path: &Path) -> Option<f64> {
    let text = fs::read_to_string(path).ok()?;
    let fields: Vec<f64> = text
        .split_whitespace()
        .map(str::parse::<f64>)
        .collect::<std::result::Result<_, _>>()
        .ok()?;
    let (received, dropped) = (*fields.get(1)?, *fields.get(2)?);
    if received <= 0.0 {
        return None;
    }
    debug!(path = %path.display(), received, dropped, "applying drop-rate correction");
    Some((dropped + received) / received)
}

/// Fold categories seen at most `threshold` times into their parent.
///
/// Folded counts accumulate per distinct parent; a parent that is also a
/// surviving category absorbs them into its own line.
pub fn fold_low_counts(
    totals: &HashMap<String, CounterPair>,
    threshold: u64,
) -> BTreeMap<String, CounterPair> {
    let mut kept: BTreeMap<String, CounterPair> = BTreeMap::new();
    let mut folded: BTreeMap<String, CounterPair> = BTreeMap::new();
    for (name, pair) in totals {
        if pair.packets <= threshold && name.contains(':') {
            folded
                .entry(parent_name(name).to_string())
                .or_default()
                .merge(pair);
            continue;
        }
        kept.entry(name.trim_end_matches(':').to_string())
            .or_default()
            .merge(pair);
    }
    for (name, pair) in folded {
        kept.entry(name).or_default().merge(&pair);
    }
    kept
}

pub fn scale_records(
    totals: &BTreeMap<String, CounterPair>,
    multiplier: f64,
) -> Vec<PersistedRecord> {
    totals
        .iter()
        .map(|(name, pair)| {
            let scaled = pair.scaled(multiplier);
            PersistedRecord {
                name: name.clone(),
                packets: scaled.packets,
                bytes: scaled.bytes,
            }
        })
        .collect()
}

/// Write `records` to `path` atomically.
pub fn write_records(
    path: &Path,
    records: &[PersistedRecord],
    overwrite: bool,
) -> Result<SaveOutcome> {
    let existed = path.exists();
    if existed && !overwrite {
        return Ok(SaveOutcome::Skipped);
    }
    let dir = path
        .parent()
        .ok_or_else(|| Error::InvalidFileName(path.display().to_string()))?;
    fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;

    let mut body = String::new();
    for record in records {
        // writing into a String cannot fail
        let _ = writeln!(body, "{record}");
    }
    let tmp = stage(dir, body.as_bytes())?;

    if overwrite {
        tmp.persist(path).map_err(|e| Error::Persist {
            path: path.to_path_buf(),
            source: e,
        })?;
        return Ok(if existed {
            SaveOutcome::Replaced
        } else {
            SaveOutcome::Written
        });
    }
    match tmp.persist_noclobber(path) {
        Ok(_) => Ok(SaveOutcome::Written),
        // lost a race with another writer
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(SaveOutcome::Skipped),
        Err(e) => Err(Error::Persist {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Write `body` to a temporary file in `dir`, ready to be renamed into place.
fn stage(dir: &Path, body: &[u8]) -> Result<NamedTempFile> {
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| Error::io(dir, e))?;
    tmp.write_all(body)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| Error::io(tmp.path(), e))?;
    Ok(tmp)
}

/// Replace `path` with `body` so readers see either the old or the new file.
pub fn write_atomic(path: &Path, body: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::InvalidFileName(path.display().to_string()))?;
    fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
    stage(dir, body)?
        .persist(path)
        .map_err(|e| Error::Persist {
            path: path.to_path_buf(),
            source: e,
        })?;
    Ok(())
}

/// Read a statistics file, skipping lines that are not well formed.
pub fn read_stats_file(path: &Path) -> Result<Vec<PersistedRecord>> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| Error::io(path, e))?;
        if let Some(record) = PersistedRecord::parse_line(&line) {
            records.push(record);
        }
    }
    Ok(records)
}
