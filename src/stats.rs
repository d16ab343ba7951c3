//! The stats aggregator: the single sink every `RequestEvent` flows
//! through, and the source of the periodic and final summary tables.
//!
//! Two views are kept side by side. The interval view is rebuilt each time
//! it's read (for the 2-second periodic table) and its rate is computed
//! against the time since the previous read. The cumulative view merges
//! additively for the whole run and its rate is computed against the time
//! since the run started. Both are backed by the same per-name counters;
//! only the bookkeeping of "since when" differs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hdrhistogram::Histogram;
use tracing::warn;

use crate::request::RequestEvent;

/// Bound on distinct error signatures tracked by name; beyond this, new
/// signatures fold into a catch-all `OTHER` bucket rather than evicting an
/// existing one. This is a deliberate departure from an LRU cache: the
/// count under `OTHER` still reflects every excess error, it just loses
/// the distinction between which excess errors they were.
const MAX_ERROR_KEYS: usize = 200;

/// Running totals for one request name.
#[derive(Debug, Clone, Default)]
pub struct PerNameEntry {
    pub count: u64,
    pub error_count: u64,
    pub sum_ttfb: Duration,
    pub sum_ttlb: Duration,
    pub max_ttlb: Duration,
}

impl PerNameEntry {
    fn add(&mut self, event: &RequestEvent) {
        self.count += 1;
        if event.error.is_error() {
            self.error_count += 1;
        }
        self.sum_ttfb += event.ttfb;
        self.sum_ttlb += event.ttlb;
        if event.ttlb > self.max_ttlb {
            self.max_ttlb = event.ttlb;
        }
    }

    fn merge(&mut self, other: &PerNameEntry) {
        self.count += other.count;
        self.error_count += other.error_count;
        self.sum_ttfb += other.sum_ttfb;
        self.sum_ttlb += other.sum_ttlb;
        if other.max_ttlb > self.max_ttlb {
            self.max_ttlb = other.max_ttlb;
        }
    }

    pub fn avg_ttlb_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_ttlb.as_secs_f64() * 1000.0 / self.count as f64
        }
    }

    pub fn max_ttlb_ms(&self) -> f64 {
        self.max_ttlb.as_secs_f64() * 1000.0
    }

    pub fn error_percentage(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.error_count as f64 * 100.0 / self.count as f64
        }
    }

    pub fn rate(&self, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            self.count as f64 / secs
        }
    }
}

/// A read-only view of the per-name table at one point in time, plus the
/// elapsed window the rate column was computed against.
#[derive(Debug, Clone)]
pub struct Snapshot {
    rows: Vec<(String, PerNameEntry)>,
    pub elapsed: Duration,
}

impl Snapshot {
    pub fn entry(&self, name: &str) -> Option<&PerNameEntry> {
        self.rows.iter().find(|(n, _)| n == name).map(|(_, e)| e)
    }

    pub fn rows(&self) -> &[(String, PerNameEntry)] {
        &self.rows
    }

    pub fn total(&self) -> PerNameEntry {
        let mut total = PerNameEntry::default();
        for (_, entry) in &self.rows {
            total.merge(entry);
        }
        total
    }

    /// Renders the Name/Count/Failures/Avg/Max/Rate table, matching the
    /// original column layout: a `Total` row always closes the table, and
    /// an optional title precedes it for the final run summary.
    pub fn render(&self, title: Option<&str>) -> String {
        let mut out = String::new();
        if let Some(title) = title {
            out.push_str(title);
            out.push('\n');
        }
        out.push_str(&format!(
            "{:<30} {:>8} {:>16} {:>10} {:>10} {:>10}\n",
            "Name", "Count", "Failures", "Avg", "Max", "Rate"
        ));
        out.push_str(&"-".repeat(90));
        out.push('\n');

        for (name, entry) in &self.rows {
            out.push_str(&make_row(name, entry, self.elapsed));
            out.push('\n');
        }
        let total = self.total();
        if total.count == 0 {
            out.push_str(&format!(
                "{:<30} {:>8} {:>16} {:>10} {:>10} {:>10}\n",
                "Total", "0", "", "", "", ""
            ));
        } else {
            out.push_str(&make_row("Total", &total, self.elapsed));
            out.push('\n');
        }
        out
    }
}

fn make_row(name: &str, entry: &PerNameEntry, elapsed: Duration) -> String {
    let truncated: String = name.chars().take(30).collect();
    format!(
        "{:<30} {:>8} {:>16} {:>9.1}ms {:>9.1}ms {:>9.2}/s",
        truncated,
        entry.count,
        format!("{} ({:.1}%)", entry.error_count, entry.error_percentage()),
        entry.avg_ttlb_ms(),
        entry.max_ttlb_ms(),
        entry.rate(elapsed),
    )
}

/// Renders the sorted error-signature table (count descending), or `None`
/// if no errors were recorded.
pub fn render_error_table(errors: &[(String, u64)]) -> Option<String> {
    if errors.is_empty() {
        return None;
    }
    let mut out = String::new();
    out.push_str(&format!("{:>8} {}\n", "Count", "Error"));
    out.push_str(&"-".repeat(40));
    out.push('\n');
    for (signature, count) in errors {
        out.push_str(&format!("{:>8} {}\n", count, signature));
    }
    Some(out)
}

struct Inner {
    start_time: Instant,
    last_read: Mutex<Instant>,
    interval: Mutex<HashMap<String, PerNameEntry>>,
    cumulative: Mutex<HashMap<String, PerNameEntry>>,
    error_counter: Mutex<HashMap<String, u64>>,
    histograms: Mutex<HashMap<String, Histogram<u64>>>,
}

/// Owns the aggregator's state. Call `handle()` to get a cheaply cloneable
/// reference every worker/session can record events through.
pub struct StatsAggregator {
    inner: Arc<Inner>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(Inner {
                start_time: now,
                last_read: Mutex::new(now),
                interval: Mutex::new(HashMap::new()),
                cumulative: Mutex::new(HashMap::new()),
                error_counter: Mutex::new(HashMap::new()),
                histograms: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn handle(&self) -> StatsHandle {
        StatsHandle {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// A cheap, `Clone`-able handle into the aggregator. Virtual users record
/// through this; the runner reads snapshots through this.
#[derive(Clone)]
pub struct StatsHandle {
    inner: Arc<Inner>,
}

impl StatsHandle {
    pub fn record(&self, event: RequestEvent) {
        {
            let mut interval = self.inner.interval.lock().unwrap();
            interval.entry(event.name.clone()).or_default().add(&event);
        }
        {
            let mut cumulative = self.inner.cumulative.lock().unwrap();
            cumulative
                .entry(event.name.clone())
                .or_default()
                .add(&event);
        }
        if event.error.is_error() {
            self.record_error(event.error.signature());
        }

        let ttlb_us = event.ttlb.as_micros().min(60_000_000) as u64;
        let ttlb_us = ttlb_us.max(1);
        let mut histograms = self.inner.histograms.lock().unwrap();
        let hist = histograms.entry(event.name.clone()).or_insert_with(|| {
            Histogram::new_with_bounds(1, 60_000_000, 3).expect("valid histogram bounds")
        });
        if let Err(e) = hist.record(ttlb_us) {
            warn!(name = %event.name, error = %e, "failed to record latency sample");
        }
    }

    /// Records an unexpected scenario bug (anything other than a classified
    /// request failure) directly into the bounded error-signature counter.
    /// Unlike `record`, this has no associated `RequestEvent` — there's no
    /// per-name row to update, just the run-wide signature histogram the
    /// final error table is built from.
    pub fn record_unexpected_error(&self, signature: String) {
        self.record_error(signature);
    }

    fn record_error(&self, signature: String) {
        let mut counter = self.inner.error_counter.lock().unwrap();
        let key = if !counter.contains_key(&signature) && counter.len() >= MAX_ERROR_KEYS {
            "OTHER".to_string()
        } else {
            signature
        };
        *counter.entry(key).or_insert(0) += 1;
    }

    /// Takes the interval map (resetting it) and returns a snapshot whose
    /// rate is computed against the time since the previous call.
    pub fn snapshot_interval(&self) -> Snapshot {
        let now = Instant::now();
        let rows = {
            let mut interval = self.inner.interval.lock().unwrap();
            std::mem::take(&mut *interval)
        };
        let mut last_read = self.inner.last_read.lock().unwrap();
        let elapsed = now.duration_since(*last_read);
        *last_read = now;

        let mut rows: Vec<(String, PerNameEntry)> = rows.into_iter().collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Snapshot { rows, elapsed }
    }

    /// Returns a snapshot of the whole-run cumulative totals without
    /// resetting anything; rate is computed against the run start time.
    pub fn snapshot_cumulative(&self) -> Snapshot {
        let now = Instant::now();
        let elapsed = now.duration_since(self.inner.start_time);
        let cumulative = self.inner.cumulative.lock().unwrap();
        let mut rows: Vec<(String, PerNameEntry)> =
            cumulative.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Snapshot { rows, elapsed }
    }

    /// Error signatures sorted by count descending, for the final table.
    pub fn error_signatures(&self) -> Vec<(String, u64)> {
        let counter = self.inner.error_counter.lock().unwrap();
        let mut entries: Vec<(String, u64)> =
            counter.iter().map(|(k, v)| (k.clone(), *v)).collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries
    }

    /// Ad hoc percentile summary for one name, for callers that want more
    /// than the table's avg/max columns. Not part of the printed table.
    pub fn percentiles(&self, name: &str) -> Option<PercentileSummary> {
        let histograms = self.inner.histograms.lock().unwrap();
        let hist = histograms.get(name)?;
        if hist.is_empty() {
            return None;
        }
        Some(PercentileSummary {
            p50_ms: hist.value_at_quantile(0.50) as f64 / 1000.0,
            p90_ms: hist.value_at_quantile(0.90) as f64 / 1000.0,
            p95_ms: hist.value_at_quantile(0.95) as f64 / 1000.0,
            p99_ms: hist.value_at_quantile(0.99) as f64 / 1000.0,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PercentileSummary {
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{ErrorKind, ErrorSignal};

    fn success(name: &str, ttlb_ms: u64) -> RequestEvent {
        RequestEvent::success(name, Duration::from_millis(ttlb_ms), Duration::from_millis(ttlb_ms))
    }

    fn failure(name: &str, ttlb_ms: u64) -> RequestEvent {
        RequestEvent {
            name: name.to_string(),
            ttfb: Duration::from_millis(ttlb_ms),
            ttlb: Duration::from_millis(ttlb_ms),
            error: ErrorSignal::Structured {
                kind: ErrorKind::Status(500),
                class_name: "HttpStatusError",
                message: "HTTP 500".to_string(),
            },
        }
    }

    #[test]
    fn records_count_and_errors_cumulatively() {
        let agg = StatsAggregator::new();
        let handle = agg.handle();
        handle.record(success("/a", 10));
        handle.record(success("/a", 20));
        handle.record(failure("/a", 30));

        let snapshot = handle.snapshot_cumulative();
        let entry = snapshot.entry("/a").unwrap();
        assert_eq!(entry.count, 3);
        assert_eq!(entry.error_count, 1);
        assert!((entry.avg_ttlb_ms() - 20.0).abs() < 0.001);
        assert_eq!(entry.max_ttlb_ms(), 30.0);
    }

    #[test]
    fn interval_snapshot_resets_between_reads() {
        let agg = StatsAggregator::new();
        let handle = agg.handle();
        handle.record(success("/a", 10));

        let first = handle.snapshot_interval();
        assert_eq!(first.entry("/a").unwrap().count, 1);

        let second = handle.snapshot_interval();
        assert!(second.entry("/a").is_none());

        let cumulative = handle.snapshot_cumulative();
        assert_eq!(cumulative.entry("/a").unwrap().count, 1);
    }

    #[test]
    fn error_signatures_sorted_descending_by_count() {
        let agg = StatsAggregator::new();
        let handle = agg.handle();
        for _ in 0..3 {
            handle.record(failure("/a", 10));
        }
        handle.record(RequestEvent {
            name: "/b".to_string(),
            ttfb: Duration::from_millis(5),
            ttlb: Duration::from_millis(5),
            error: ErrorSignal::Message("boom".to_string()),
        });

        let signatures = handle.error_signatures();
        assert_eq!(signatures[0].1, 3);
        assert!(signatures.iter().any(|(sig, count)| sig == "boom" && *count == 1));
    }

    #[test]
    fn error_signature_bound_folds_excess_into_other() {
        let agg = StatsAggregator::new();
        let handle = agg.handle();
        for i in 0..(MAX_ERROR_KEYS + 5) {
            handle.record(RequestEvent {
                name: "/a".to_string(),
                ttfb: Duration::from_millis(1),
                ttlb: Duration::from_millis(1),
                error: ErrorSignal::Message(format!("unique-error-{i}")),
            });
        }
        let signatures = handle.error_signatures();
        assert!(signatures.len() <= MAX_ERROR_KEYS + 1);
        let other = signatures.iter().find(|(sig, _)| sig == "OTHER");
        assert!(other.is_some());
        assert_eq!(other.unwrap().1, 5);
    }

    #[test]
    fn total_row_merges_all_names() {
        let agg = StatsAggregator::new();
        let handle = agg.handle();
        handle.record(success("/a", 10));
        handle.record(success("/b", 20));

        let snapshot = handle.snapshot_cumulative();
        let total = snapshot.total();
        assert_eq!(total.count, 2);
    }

    #[test]
    fn render_includes_total_row_and_columns() {
        let agg = StatsAggregator::new();
        let handle = agg.handle();
        handle.record(success("/a", 10));
        let snapshot = handle.snapshot_cumulative();
        let rendered = snapshot.render(Some("Summary"));
        assert!(rendered.contains("Summary"));
        assert!(rendered.contains("Name"));
        assert!(rendered.contains("Total"));
        assert!(rendered.contains("/a"));
    }

    #[test]
    fn render_error_table_is_none_when_empty() {
        assert!(render_error_table(&[]).is_none());
    }
}
