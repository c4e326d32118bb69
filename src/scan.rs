//! Polling over the statistics tree for one view.
//!
//! A [`Scanner`] owns the windows of a single view (a file name filter such
//! as `1.1.1.0`, or everything). Every poll ingests files that appeared since
//! the last one, rebuilds the hourly window if enabled, renders what changed
//! and drops windows past their retention.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{EngineConfig, RenderConfig, ScanConfig, TopNConfig, ViewConfig};
use crate::error::{Error, Result};
use crate::render::render_window;
use crate::store::read_stats_file;
use crate::window::WindowSet;

/// Date and time embedded in statistics file names.
const FILE_STAMP_PATTERN: &str = r"-(20\d{6})-(\d{4})\.";

pub struct Scanner {
    root: PathBuf,
    view: ViewConfig,
    scan: ScanConfig,
    topn: TopNConfig,
    render: RenderConfig,
    windows: WindowSet,
    processed: HashMap<PathBuf, SystemTime>,
    stamp_re: Regex,
    cancel: Arc<AtomicBool>,
}

impl Scanner {
    pub fn new(
        root: impl Into<PathBuf>,
        view: ViewConfig,
        config: &EngineConfig,
        cancel: Arc<AtomicBool>,
    ) -> Result<Self> {
        Ok(Self {
            root: root.into(),
            windows: WindowSet::new(config.windows.clone(), config.render.clone(), view.clone()),
            view,
            scan: config.scan.clone(),
            topn: config.topn,
            render: config.render.clone(),
            processed: HashMap::new(),
            stamp_re: Regex::new(FILE_STAMP_PATTERN)?,
            cancel,
        })
    }

    pub fn view(&self) -> &ViewConfig {
        &self.view
    }

    pub fn windows(&self) -> &WindowSet {
        &self.windows
    }

    /// Timestamp embedded in a statistics file name.
    pub fn file_stamp(&self, fname: &str) -> Option<NaiveDateTime> {
        let caps = self.stamp_re.captures(fname)?;
        let text = format!("{}{}", &caps[1], &caps[2]);
        NaiveDateTime::parse_from_str(&text, "%Y%m%d%H%M").ok()
    }

    fn selects(&self, fname: &str) -> bool {
        !fname.contains(&self.scan.skip_marker) && fname.contains(&self.view.filter)
    }

    /// True when no enabled window could still want a file from `stamp`.
    fn too_old(&self, stamp: Option<NaiveDateTime>, now: NaiveDateTime) -> bool {
        if self.scan.scan_all_dates {
            return false;
        }
        let Some(stamp) = stamp else {
            return false;
        };
        let days = (now - stamp).num_days();
        let windows = self.windows.config();
        !((windows.monthly && days < 32) || (windows.weekly && days < 9) || (windows.daily && days < 2))
    }

    fn recently_modified(&self, modified: SystemTime) -> bool {
        let min_age = Duration::from_secs(self.scan.min_file_age_secs);
        SystemTime::now()
            .duration_since(modified)
            .map_or(true, |age| age < min_age)
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Ingest one statistics file into the calendar windows, or into the
    /// hourly window when `hourly` is set.
    pub fn process_stat_file(&mut self, path: &Path, hourly: bool) -> Result<()> {
        let dir = path
            .parent()
            .and_then(Path::file_name)
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if dir.len() != 8 || !dir.starts_with('2') {
            return Err(Error::InvalidDateDir(dir.to_string()));
        }
        let date = NaiveDate::parse_from_str(dir, "%Y%m%d")
            .map_err(|_| Error::InvalidDateDir(dir.to_string()))?;
        let fname = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let stamp = self
            .file_stamp(fname)
            .ok_or_else(|| Error::InvalidFileName(fname.to_string()))?;

        let records = read_stats_file(path)?;
        debug!(path = %path.display(), records = records.len(), "ingesting");
        if hourly {
            self.windows.ingest_hourly(date, stamp, &records);
        } else {
            self.windows.ingest(date, stamp, &records);
        }
        Ok(())
    }

    /// Files under the root in sorted order, with walk errors logged.
    fn walk(&self) -> impl Iterator<Item = walkdir::DirEntry> {
        WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("skipping unreadable entry: {}", e);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
    }

    /// Ingest every statistics file not seen before. Returns how many were
    /// added.
    pub fn scan_new_files(&mut self, now: NaiveDateTime) -> Result<usize> {
        let mut ingested = 0;
        let mut last_dir: Option<PathBuf> = None;
        for entry in self.walk() {
            if self.cancelled() {
                return Err(Error::Cancelled);
            }
            let Some(fname) = entry.file_name().to_str() else {
                continue;
            };
            if !self.selects(fname) || self.too_old(self.file_stamp(fname), now) {
                continue;
            }
            let path = entry.path();
            if self.processed.contains_key(path) {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %path.display(), "cannot stat: {}", e);
                    continue;
                }
            };
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            if metadata.len() == 0 || self.recently_modified(modified) {
                continue;
            }

            let dir = path.parent().map(Path::to_path_buf);
            if dir != last_dir {
                info!(view = %self.view.subtitle, dir = ?dir, "processing stats");
                last_dir = dir;
            }
            match self.process_stat_file(path, false) {
                Ok(()) => ingested += 1,
                Err(e) => warn!(path = %path.display(), "skipping stats file: {}", e),
            }
            self.processed.insert(path.to_path_buf(), modified);
        }
        if ingested > 0 {
            info!(view = %self.view.subtitle, files = ingested, "scan complete");
        }
        Ok(ingested)
    }

    /// Rebuild the hourly window from files of the last lookback period.
    pub fn scan_hourly_files(&mut self, now: NaiveDateTime) -> Result<usize> {
        self.windows.reset_hourly();
        let mut ingested = 0;
        for entry in self.walk() {
            if self.cancelled() {
                return Err(Error::Cancelled);
            }
            let Some(fname) = entry.file_name().to_str() else {
                continue;
            };
            if !self.selects(fname) {
                continue;
            }
            let recent = self
                .file_stamp(fname)
                .is_some_and(|stamp| (now - stamp).num_minutes() <= self.scan.hourly_lookback_minutes);
            if !recent {
                continue;
            }
            match self.process_stat_file(entry.path(), true) {
                Ok(()) => ingested += 1,
                Err(e) => warn!(path = %entry.path().display(), "skipping stats file: {}", e),
            }
        }
        Ok(ingested)
    }

    /// Render every window that changed since it was last rendered.
    pub fn render(&mut self, out_dir: &Path) -> Result<usize> {
        let mut rendered = 0;
        for window in self.windows.dirty_mut() {
            render_window(window, out_dir, self.topn, &self.render)?;
            window.mark_clean();
            rendered += 1;
        }
        Ok(rendered)
    }

    pub fn age_out(&mut self, today: NaiveDate) {
        self.windows.age_out(today);
    }

    /// One full poll: scan, render, age out.
    pub fn poll(&mut self, now: NaiveDateTime, out_dir: &Path) -> Result<()> {
        info!(view = %self.view.subtitle, "scanning");
        let windows = self.windows.config();
        let (calendar, hourly) = (windows.daily || windows.weekly || windows.monthly, windows.hourly);
        if calendar {
            self.scan_new_files(now)?;
        }
        if hourly {
            self.scan_hourly_files(now)?;
        }
        self.render(out_dir)?;
        self.age_out(now.date());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::Resolution;
    use std::fs;
    use tempfile::TempDir;

    fn config() -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.scan.min_file_age_secs = 0;
        cfg
    }

    fn view(filter: &str) -> ViewConfig {
        ViewConfig {
            filter: filter.to_string(),
            subtitle: "test".to_string(),
        }
    }

    fn write_stats(root: &Path, date: &str, name: &str, body: &str) -> PathBuf {
        let dir = root.join(date);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        path
    }

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2013, 5, 1)
            .unwrap()
            .and_hms_opt(13, 0, 0)
            .unwrap()
    }

    fn scanner(root: &Path, filter: &str, cfg: &EngineConfig) -> Scanner {
        Scanner::new(root, view(filter), cfg, Arc::new(AtomicBool::new(false))).unwrap()
    }

    #[test]
    fn file_stamp_from_name() {
        let dir = TempDir::new().unwrap();
        let s = scanner(dir.path(), "", &config());
        assert_eq!(
            s.file_stamp("1.1.1.0-20130501-1205.pcap.stats"),
            NaiveDate::from_ymd_opt(2013, 5, 1).unwrap().and_hms_opt(12, 5, 0)
        );
        assert_eq!(s.file_stamp("notes.txt"), None);
        assert_eq!(s.file_stamp("x-20130501-2575.stats"), None);
    }

    #[test]
    fn new_files_are_ingested_once() {
        let dir = TempDir::new().unwrap();
        write_stats(dir.path(), "20130501", "1.1.1.0-20130501-1200.pcap.stats", "a\t10\t100\n");
        write_stats(dir.path(), "20130501", "1.1.1.0-20130501-1205.pcap.stats", "a\t5\t50\n");
        let mut s = scanner(dir.path(), "", &config());

        assert_eq!(s.scan_new_files(now()).unwrap(), 2);
        assert_eq!(s.scan_new_files(now()).unwrap(), 0);

        let day = NaiveDate::from_ymd_opt(2013, 5, 1).unwrap();
        let daily = s.windows().get(Resolution::Daily, day).unwrap();
        assert_eq!(daily.totals()["a"].packets, 15);
        assert_eq!(daily.slots().len(), 2);
    }

    #[test]
    fn filters_and_skips() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write_stats(root, "20130501", "1.1.1.0-20130501-1200.pcap.stats", "a\t1\t1\n");
        write_stats(root, "20130501", "1.2.3.0-20130501-1200.pcap.stats", "b\t1\t1\n");
        write_stats(root, "20130501", "largesample-20130501-1200.pcap.stats", "c\t1\t1\n");
        write_stats(root, "20130501", "1.1.1.0-20130501-1210.pcap.stats", "");
        write_stats(root, "notadate", "1.1.1.0-20130501-1215.pcap.stats", "d\t1\t1\n");
        write_stats(root, "20130420", "1.1.1.0-20130420-1200.pcap.stats", "e\t1\t1\n");

        let mut s = scanner(root, "1.1.1.0", &config());
        assert_eq!(s.scan_new_files(now()).unwrap(), 1);
        let day = NaiveDate::from_ymd_opt(2013, 5, 1).unwrap();
        let totals = s.windows().get(Resolution::Daily, day).unwrap().totals();
        assert_eq!(totals.len(), 1);
        assert!(totals.contains_key("a"));
    }

    #[test]
    fn scan_all_dates_reaches_old_files() {
        let dir = TempDir::new().unwrap();
        write_stats(dir.path(), "20120101", "x-20120101-0000.pcap.stats", "a\t1\t1\n");
        let mut cfg = config();
        assert_eq!(scanner(dir.path(), "", &cfg).scan_new_files(now()).unwrap(), 0);
        cfg.scan.scan_all_dates = true;
        assert_eq!(scanner(dir.path(), "", &cfg).scan_new_files(now()).unwrap(), 1);
    }

    #[test]
    fn fresh_files_wait() {
        let dir = TempDir::new().unwrap();
        write_stats(dir.path(), "20130501", "x-20130501-1200.pcap.stats", "a\t1\t1\n");
        let mut cfg = config();
        cfg.scan.min_file_age_secs = 3600;
        let mut s = scanner(dir.path(), "", &cfg);
        assert_eq!(s.scan_new_files(now()).unwrap(), 0);
    }

    #[test]
    fn hourly_scan_uses_lookback() {
        let dir = TempDir::new().unwrap();
        write_stats(dir.path(), "20130501", "x-20130501-1150.pcap.stats", "a\t1\t1\n");
        write_stats(dir.path(), "20130501", "x-20130501-1200.pcap.stats", "a\t2\t2\n");
        write_stats(dir.path(), "20130501", "x-20130501-1255.pcap.stats", "a\t4\t4\n");
        let mut cfg = config();
        cfg.windows.hourly = true;
        let mut s = scanner(dir.path(), "", &cfg);

        assert_eq!(s.scan_hourly_files(now()).unwrap(), 2);
        // a second pass rebuilds rather than adds
        assert_eq!(s.scan_hourly_files(now()).unwrap(), 2);
        let day = NaiveDate::from_ymd_opt(2013, 5, 1).unwrap();
        let hourly = s.windows().get(Resolution::Hourly, day).unwrap();
        assert_eq!(hourly.totals()["a"].packets, 6);
        assert!(s.windows().get(Resolution::Daily, day).is_none());
    }

    #[test]
    fn cancel_stops_between_files() {
        let dir = TempDir::new().unwrap();
        write_stats(dir.path(), "20130501", "x-20130501-1200.pcap.stats", "a\t1\t1\n");
        let cancel = Arc::new(AtomicBool::new(true));
        let mut s = Scanner::new(dir.path(), view(""), &config(), cancel).unwrap();
        assert!(matches!(s.scan_new_files(now()), Err(Error::Cancelled)));
    }

    #[test]
    fn poll_renders_dirty_windows_once() {
        let dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write_stats(dir.path(), "20130501", "x-20130501-1200.pcap.stats", "a\t300\t3000\n");
        let mut s = scanner(dir.path(), "", &config());

        s.poll(now(), out.path()).unwrap();
        let json = out.path().join("traffic-20130501-daily-all-pps.json");
        assert!(json.exists());
        assert_eq!(s.render(out.path()).unwrap(), 0);
    }
}
