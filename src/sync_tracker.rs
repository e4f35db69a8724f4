//! Rolling tracker of camera/stimulus timestamp pairs.
//!
//! Every acquisition-loop iteration records the camera timestamp and the
//! matching stimulus timestamp. The tracker keeps a bounded history and
//! serves windowed statistics to the UI's timing plot.
//!
//! Two behaviors matter for correctness:
//!
//! - Records whose camera/stimulus difference is 100 ms or more are stale
//!   pairings (they arise only across phase transitions) and are rejected
//!   outright, never retained.
//! - `recent(window)` anchors the window at the most recent entry's camera
//!   timestamp, not at wall-clock now, so the displayed window freezes
//!   during idle periods between trials instead of draining to empty.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::debug;

/// Maximum retained records; oldest entries drop on overflow.
const CAPACITY: usize = 100_000;

/// Pairings at or beyond this difference are rejected as stale.
const REJECT_THRESHOLD_MS: f64 = 100.0;

/// Number of histogram bins served by `stats`.
const HISTOGRAM_BINS: usize = 50;

/// One accepted camera/stimulus pairing.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct SyncRecord {
    pub camera_ts_us: u64,
    pub stimulus_ts_us: u64,
    pub diff_ms: f64,
}

/// Windowed summary statistics over the difference series.
#[derive(Clone, Debug, Serialize)]
pub struct SyncStats {
    pub count: usize,
    pub mean_diff_ms: f64,
    pub std_diff_ms: f64,
    pub min_diff_ms: f64,
    pub max_diff_ms: f64,
    pub histogram: Vec<u64>,
    pub bin_edges: Vec<f64>,
}

impl SyncStats {
    fn empty() -> Self {
        Self {
            count: 0,
            mean_diff_ms: 0.0,
            std_diff_ms: 0.0,
            min_diff_ms: 0.0,
            max_diff_ms: 0.0,
            histogram: vec![0; HISTOGRAM_BINS],
            bin_edges: vec![0.0; HISTOGRAM_BINS + 1],
        }
    }
}

struct TrackerInner {
    enabled: bool,
    records: VecDeque<SyncRecord>,
}

/// Thread-safe bounded history of synchronization records.
pub struct SyncTracker {
    inner: Mutex<TrackerInner>,
}

impl Default for SyncTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                enabled: true,
                records: VecDeque::with_capacity(1024),
            }),
        }
    }

    pub fn enable(&self) {
        self.lock().enabled = true;
    }

    pub fn disable(&self) {
        self.lock().enabled = false;
    }

    pub fn clear(&self) {
        self.lock().records.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    /// Record one pairing. Returns false when disabled or rejected.
    pub fn add(&self, camera_ts_us: u64, stimulus_ts_us: u64) -> bool {
        let diff_ms = camera_ts_us.abs_diff(stimulus_ts_us) as f64 / 1000.0;
        if diff_ms >= REJECT_THRESHOLD_MS {
            debug!(
                camera_ts_us,
                stimulus_ts_us, diff_ms, "rejecting stale synchronization record"
            );
            return false;
        }

        let mut inner = self.lock();
        if !inner.enabled {
            return false;
        }
        if inner.records.len() >= CAPACITY {
            inner.records.pop_front();
        }
        inner.records.push_back(SyncRecord {
            camera_ts_us,
            stimulus_ts_us,
            diff_ms,
        });
        true
    }

    /// Entries whose camera timestamp falls within `window_seconds` of the
    /// most recent entry's camera timestamp.
    pub fn recent(&self, window_seconds: f64) -> Vec<SyncRecord> {
        let inner = self.lock();
        let Some(last) = inner.records.back() else {
            return Vec::new();
        };
        let window_us = (window_seconds.max(0.0) * 1e6) as u64;
        let cutoff = last.camera_ts_us.saturating_sub(window_us);
        inner
            .records
            .iter()
            .filter(|r| r.camera_ts_us >= cutoff)
            .copied()
            .collect()
    }

    /// Windowed statistics with a fixed-bin histogram of the differences.
    pub fn stats(&self, window_seconds: f64) -> SyncStats {
        let records = self.recent(window_seconds);
        if records.is_empty() {
            return SyncStats::empty();
        }

        let diffs: Vec<f64> = records.iter().map(|r| r.diff_ms).collect();
        let count = diffs.len();
        let mean = diffs.iter().sum::<f64>() / count as f64;
        let variance = diffs.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / count as f64;
        let min = diffs.iter().copied().fold(f64::INFINITY, f64::min);
        let max = diffs.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        // Degenerate spread still needs a non-empty bin range.
        let span = if max > min { max - min } else { 1e-6 };
        let bin_width = span / HISTOGRAM_BINS as f64;
        let mut histogram = vec![0u64; HISTOGRAM_BINS];
        for d in &diffs {
            let idx = (((d - min) / bin_width) as usize).min(HISTOGRAM_BINS - 1);
            histogram[idx] += 1;
        }
        let bin_edges = (0..=HISTOGRAM_BINS)
            .map(|i| min + bin_width * i as f64)
            .collect();

        SyncStats {
            count,
            mean_diff_ms: mean,
            std_diff_ms: variance.sqrt(),
            min_diff_ms: min,
            max_diff_ms: max,
            histogram,
            bin_edges,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerInner> {
        self.inner.lock().expect("sync tracker lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_recent() {
        let tracker = SyncTracker::new();
        assert!(tracker.add(1_000_000, 1_000_500));
        assert!(tracker.add(2_000_000, 2_001_000));
        let recent = tracker.recent(5.0);
        assert_eq!(recent.len(), 2);
        assert!((recent[1].diff_ms - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_stale_records_rejected() {
        let tracker = SyncTracker::new();
        // Exactly 100 ms is rejected; just under is retained.
        assert!(!tracker.add(0, 100_000));
        assert!(tracker.add(0, 99_999));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_window_anchored_at_last_entry_not_wall_clock() {
        let tracker = SyncTracker::new();
        // A 2-second burst of 100 entries.
        for i in 0..100u64 {
            tracker.add(i * 20_000, i * 20_000 + 100);
        }
        let first = tracker.recent(5.0);
        assert_eq!(first.len(), 100);

        // Idle time passes; the window must not drain.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let second = tracker.recent(5.0);
        assert_eq!(first, second);
    }

    #[test]
    fn test_window_filters_old_entries() {
        let tracker = SyncTracker::new();
        tracker.add(0, 10);
        tracker.add(10_000_000, 10_000_010);
        let recent = tracker.recent(5.0);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].camera_ts_us, 10_000_000);
    }

    #[test]
    fn test_capacity_bounded() {
        let tracker = SyncTracker::new();
        for i in 0..(CAPACITY as u64 + 10) {
            tracker.add(i, i);
        }
        assert_eq!(tracker.len(), CAPACITY);
    }

    #[test]
    fn test_stats_shape_and_values() {
        let tracker = SyncTracker::new();
        for i in 0..10u64 {
            tracker.add(i * 1000, i * 1000 + i * 100);
        }
        let stats = tracker.stats(5.0);
        assert_eq!(stats.count, 10);
        assert_eq!(stats.histogram.len(), 50);
        assert_eq!(stats.bin_edges.len(), 51);
        assert_eq!(stats.histogram.iter().sum::<u64>(), 10);
        assert!(stats.min_diff_ms <= stats.mean_diff_ms);
        assert!(stats.mean_diff_ms <= stats.max_diff_ms);
    }

    #[test]
    fn test_disabled_tracker_drops_records() {
        let tracker = SyncTracker::new();
        tracker.disable();
        assert!(!tracker.add(1, 1));
        assert!(tracker.is_empty());
        tracker.enable();
        assert!(tracker.add(1, 1));
    }
}
