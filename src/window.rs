//! Calendar windows over persisted statistics.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{Datelike, Days, Months, NaiveDate, NaiveDateTime};
use tracing::{debug, info};

use crate::config::{RenderConfig, ViewConfig, WindowConfig};
use crate::models::domain::{CounterPair, PersistedRecord};

/// Stem date of the hourly window, chosen to sort after every real date.
const HOURLY_STEM_DATE: &str = "99999999";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Resolution {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl Resolution {
    pub const ALL: [Resolution; 4] = [
        Resolution::Hourly,
        Resolution::Daily,
        Resolution::Weekly,
        Resolution::Monthly,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::Hourly => "hourly",
            Resolution::Daily => "daily",
            Resolution::Weekly => "weekly",
            Resolution::Monthly => "monthly",
        }
    }

    /// The window a statistics file dated `date` belongs to.
    pub fn calendar_key(self, date: NaiveDate) -> NaiveDate {
        match self {
            Resolution::Hourly | Resolution::Daily => date,
            Resolution::Weekly => {
                let back = u64::from(date.weekday().num_days_from_sunday());
                date.checked_sub_days(Days::new(back)).unwrap_or(date)
            }
            Resolution::Monthly => date.with_day(1).unwrap_or(date),
        }
    }

    /// Last day covered by the window starting at `key`.
    fn last_day(self, key: NaiveDate) -> NaiveDate {
        let end = match self {
            Resolution::Hourly | Resolution::Daily => Some(key),
            Resolution::Weekly => key.checked_add_days(Days::new(6)),
            Resolution::Monthly => key
                .checked_add_months(Months::new(1))
                .and_then(|d| d.pred_opt()),
        };
        end.unwrap_or(key)
    }

    fn enabled(self, config: &WindowConfig) -> bool {
        match self {
            Resolution::Hourly => config.hourly,
            Resolution::Daily => config.daily,
            Resolution::Weekly => config.weekly,
            Resolution::Monthly => config.monthly,
        }
    }

    /// Days a window is kept past its key; hourly windows are rebuilt instead.
    fn retention_days(self, config: &WindowConfig) -> Option<i64> {
        match self {
            Resolution::Hourly => None,
            Resolution::Daily => Some(config.daily_retention_days),
            Resolution::Weekly => Some(config.weekly_retention_days),
            Resolution::Monthly => Some(config.monthly_retention_days),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn us_date(d: NaiveDate) -> String {
    format!("{}/{}/{}", d.month(), d.day(), d.year())
}

/// Cumulative totals and per-file breakdown for one calendar window.
#[derive(Debug, Clone)]
pub struct WindowAccumulator {
    pub resolution: Resolution,
    pub key: NaiveDate,
    pub title: String,
    pub stem: String,
    totals: HashMap<String, CounterPair>,
    slots: BTreeMap<NaiveDateTime, HashMap<String, CounterPair>>,
    dirty: bool,
}

impl WindowAccumulator {
    pub fn new(
        resolution: Resolution,
        key: NaiveDate,
        view: &ViewConfig,
        render: &RenderConfig,
    ) -> Self {
        let heading = format!("{} ({})", render.title, view.subtitle);
        let title = match resolution {
            Resolution::Hourly => format!("{heading}: 1-hour view - {}", us_date(key)),
            Resolution::Daily => format!("{heading}: {}", us_date(key)),
            Resolution::Weekly | Resolution::Monthly => format!(
                "{heading}: {} to {}",
                us_date(key),
                us_date(resolution.last_day(key))
            ),
        };
        let stem_date = match resolution {
            Resolution::Hourly => HOURLY_STEM_DATE.to_string(),
            _ => key.format("%Y%m%d").to_string(),
        };
        let stem = format!(
            "{}-{}-{}{}",
            render.file_prefix,
            stem_date,
            resolution,
            view.file_suffix()
        );
        Self {
            resolution,
            key,
            title,
            stem,
            totals: HashMap::new(),
            slots: BTreeMap::new(),
            dirty: false,
        }
    }

    /// Add one statistics file recorded at `timestamp`.
    pub fn add(&mut self, timestamp: NaiveDateTime, records: &[PersistedRecord]) {
        self.dirty = true;
        let slot = self.slots.entry(timestamp).or_default();
        for record in records {
            let name = record.name.trim_end_matches(':');
            let pair = record.counters();
            self.totals.entry(name.to_string()).or_default().merge(&pair);
            slot.entry(name.to_string()).or_default().merge(&pair);
        }
    }

    pub fn totals(&self) -> &HashMap<String, CounterPair> {
        &self.totals
    }

    /// Per-file breakdown in chronological order.
    pub fn slots(&self) -> &BTreeMap<NaiveDateTime, HashMap<String, CounterPair>> {
        &self.slots
    }

    /// Cumulative totals of one metric, the reducer's input.
    pub fn metric_totals(&self, offset: usize) -> HashMap<String, u64> {
        self.totals
            .iter()
            .map(|(name, pair)| (name.clone(), pair.metric(offset)))
            .collect()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }
}

/// All live windows of one view.
pub struct WindowSet {
    config: WindowConfig,
    render: RenderConfig,
    view: ViewConfig,
    windows: BTreeMap<(Resolution, NaiveDate), WindowAccumulator>,
}

impl WindowSet {
    pub fn new(config: WindowConfig, render: RenderConfig, view: ViewConfig) -> Self {
        Self {
            config,
            render,
            view,
            windows: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    /// Add the records of a file dated `date` to every enabled daily, weekly
    /// and monthly window.
    pub fn ingest(
        &mut self,
        date: NaiveDate,
        timestamp: NaiveDateTime,
        records: &[PersistedRecord],
    ) {
        for resolution in [Resolution::Daily, Resolution::Weekly, Resolution::Monthly] {
            self.ingest_into(resolution, date, timestamp, records);
        }
    }

    /// Add the records of a recent file to the hourly window.
    pub fn ingest_hourly(
        &mut self,
        date: NaiveDate,
        timestamp: NaiveDateTime,
        records: &[PersistedRecord],
    ) {
        self.ingest_into(Resolution::Hourly, date, timestamp, records);
    }

    fn ingest_into(
        &mut self,
        resolution: Resolution,
        date: NaiveDate,
        timestamp: NaiveDateTime,
        records: &[PersistedRecord],
    ) {
        if !resolution.enabled(&self.config) {
            return;
        }
        let key = resolution.calendar_key(date);
        let window = self.windows.entry((resolution, key)).or_insert_with(|| {
            debug!(%resolution, %key, "opening window");
            WindowAccumulator::new(resolution, key, &self.view, &self.render)
        });
        window.add(timestamp, records);
    }

    /// Drop windows past their retention horizon.
    pub fn age_out(&mut self, today: NaiveDate) {
        let config = &self.config;
        self.windows.retain(|(resolution, key), _| {
            match resolution.retention_days(config) {
                Some(days) => (today - *key).num_days() <= days,
                None => true,
            }
        });
        info!(
            view = %self.view.subtitle,
            daily = self.count(Resolution::Daily),
            weekly = self.count(Resolution::Weekly),
            monthly = self.count(Resolution::Monthly),
            "windows after age-out"
        );
    }

    /// Forget hourly windows ahead of a fresh hourly scan.
    pub fn reset_hourly(&mut self) {
        self.windows.retain(|(resolution, _), _| *resolution != Resolution::Hourly);
    }

    pub fn count(&self, resolution: Resolution) -> usize {
        self.windows.keys().filter(|(r, _)| *r == resolution).count()
    }

    pub fn get(&self, resolution: Resolution, key: NaiveDate) -> Option<&WindowAccumulator> {
        self.windows.get(&(resolution, key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &WindowAccumulator> {
        self.windows.values()
    }

    pub fn dirty_mut(&mut self) -> impl Iterator<Item = &mut WindowAccumulator> {
        self.windows.values_mut().filter(|w| w.is_dirty())
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn at(d: NaiveDate, h: u32, m: u32) -> NaiveDateTime {
        d.and_hms_opt(h, m, 0).unwrap()
    }

    fn record(name: &str, packets: u64, bytes: u64) -> PersistedRecord {
        PersistedRecord {
            name: name.to_string(),
            packets,
            bytes,
        }
    }

    fn all_view() -> ViewConfig {
        ViewConfig {
            filter: String::new(),
            subtitle: "All subnets".into(),
        }
    }

    fn all_resolutions() -> WindowConfig {
        WindowConfig {
            hourly: true,
            daily: true,
            weekly: true,
            monthly: true,
            ..WindowConfig::default()
        }
    }

    #[test]
    fn calendar_keys() {
        // 2013-05-01 was a Wednesday
        let d = date(2013, 5, 1);
        assert_eq!(Resolution::Daily.calendar_key(d), d);
        assert_eq!(Resolution::Weekly.calendar_key(d), date(2013, 4, 28));
        assert_eq!(Resolution::Monthly.calendar_key(d), d);
        assert_eq!(Resolution::Monthly.calendar_key(date(2013, 5, 17)), d);
        // a Sunday is its own week start
        assert_eq!(Resolution::Weekly.calendar_key(date(2013, 5, 5)), date(2013, 5, 5));
    }

    #[test]
    fn titles_and_stems() {
        let render = RenderConfig::default();
        let view = ViewConfig {
            filter: "1.1.1.0".into(),
            subtitle: "Filter: 1.1.1.x".into(),
        };
        let w = WindowAccumulator::new(Resolution::Weekly, date(2013, 4, 28), &view, &render);
        assert_eq!(w.title, "Traffic (Filter: 1.1.1.x): 4/28/2013 to 5/4/2013");
        assert_eq!(w.stem, "traffic-20130428-weekly-1.1.1.0");

        let w = WindowAccumulator::new(Resolution::Monthly, date(2013, 2, 1), &all_view(), &render);
        assert_eq!(w.title, "Traffic (All subnets): 2/1/2013 to 2/28/2013");

        let w = WindowAccumulator::new(Resolution::Hourly, date(2013, 5, 1), &all_view(), &render);
        assert_eq!(w.title, "Traffic (All subnets): 1-hour view - 5/1/2013");
        assert_eq!(w.stem, "traffic-99999999-hourly-all");
    }

    #[test]
    fn ingest_accumulates_totals_and_slots() {
        let mut set = WindowSet::new(all_resolutions(), RenderConfig::default(), all_view());
        let d = date(2013, 5, 1);
        set.ingest(d, at(d, 12, 0), &[record("a:", 10, 1000), record("b", 1, 10)]);
        set.ingest(d, at(d, 12, 5), &[record("a", 5, 500)]);
        assert_eq!(set.len(), 3);
        assert_eq!(set.count(Resolution::Hourly), 0);

        let daily = set.get(Resolution::Daily, d).unwrap();
        assert!(daily.is_dirty());
        assert_eq!(daily.totals()["a"], CounterPair::new(15, 1500));
        assert_eq!(daily.slots().len(), 2);
        assert_eq!(daily.metric_totals(1)["b"], 10);

        let weekly = set.get(Resolution::Weekly, date(2013, 4, 28)).unwrap();
        assert_eq!(weekly.totals()["a"], CounterPair::new(15, 1500));
    }

    #[test]
    fn disabled_resolutions_are_skipped() {
        let mut set = WindowSet::new(WindowConfig::default(), RenderConfig::default(), all_view());
        let d = date(2013, 5, 1);
        set.ingest(d, at(d, 0, 0), &[record("a", 1, 1)]);
        assert_eq!(set.len(), 1);
        assert_eq!(set.count(Resolution::Daily), 1);
    }

    #[test]
    fn age_out_horizons() {
        let mut set = WindowSet::new(all_resolutions(), RenderConfig::default(), all_view());
        let d = date(2013, 5, 1);
        set.ingest(d, at(d, 0, 0), &[record("a", 1, 1)]);
        set.ingest_hourly(d, at(d, 0, 0), &[record("a", 1, 1)]);

        set.age_out(date(2013, 5, 2));
        assert_eq!(set.count(Resolution::Daily), 1);

        set.age_out(date(2013, 5, 3));
        assert_eq!(set.count(Resolution::Daily), 0);
        assert_eq!(set.count(Resolution::Weekly), 1);
        assert_eq!(set.count(Resolution::Hourly), 1);

        // weekly key is 4/28
        set.age_out(date(2013, 5, 7));
        assert_eq!(set.count(Resolution::Weekly), 0);
        assert_eq!(set.count(Resolution::Monthly), 1);

        set.age_out(date(2013, 6, 2));
        assert_eq!(set.count(Resolution::Monthly), 1);
        set.age_out(date(2013, 6, 3));
        assert_eq!(set.count(Resolution::Monthly), 0);
    }

    #[test]
    fn hourly_reset_keeps_other_windows() {
        let mut set = WindowSet::new(all_resolutions(), RenderConfig::default(), all_view());
        let d = date(2013, 5, 1);
        set.ingest(d, at(d, 0, 0), &[record("a", 1, 1)]);
        set.ingest_hourly(d, at(d, 0, 0), &[record("a", 1, 1)]);
        assert_eq!(set.len(), 4);
        set.reset_hourly();
        assert_eq!(set.count(Resolution::Hourly), 0);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn mark_clean_clears_dirty() {
        let mut set = WindowSet::new(WindowConfig::default(), RenderConfig::default(), all_view());
        let d = date(2013, 5, 1);
        set.ingest(d, at(d, 0, 0), &[]);
        for w in set.dirty_mut() {
            w.mark_clean();
        }
        assert_eq!(set.dirty_mut().count(), 0);
    }
}
