//! Per-frame receive-side metrics: end-to-end latency, stall detection and
//! a sliding-window effective bitrate, appended to the receiver CSV.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::metadata::{EpochClock, MetadataRow};
use crate::Error;

pub const METRICS_FILE: &str = "client_metrics.csv";

const METRICS_HEADER: [&str; 5] = [
    "timestamp_ms",
    "frame_index",
    "latency_ms",
    "stall",
    "effective_bitrate_kbps",
];

/// The effective bitrate looks at the last second of arrivals.
const BITRATE_WINDOW: Duration = Duration::from_secs(1);
/// Minimum window span for a meaningful rate.
const MIN_WINDOW_SPAN: Duration = Duration::from_millis(10);
const MIN_WINDOW_SAMPLES: usize = 5;
/// Rates above 1 Gbit/s are treated as measurement artifacts.
const MAX_PLAUSIBLE_KBPS: f64 = 1_000_000.0;

/// One row of the receiver metrics CSV.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameMetricRow {
    /// Milliseconds relative to the session epoch.
    pub timestamp_ms: i64,
    pub frame_index: u64,
    pub latency_ms: f64,
    pub stall: bool,
    pub effective_bitrate_kbps: f64,
}

/// Mutexed, per-row-flushed writer for the receiver metrics CSV.
pub struct MetricsCsvWriter {
    inner: Mutex<csv::Writer<File>>,
}

impl MetricsCsvWriter {
    pub fn create(path: &Path) -> Result<Self, Error> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(METRICS_HEADER)?;
        writer.flush()?;

        Ok(MetricsCsvWriter {
            inner: Mutex::new(writer),
        })
    }

    /// Append one row and flush it. Failures are logged, not propagated.
    pub fn append(&self, row: &FrameMetricRow) {
        let mut writer = self.inner.lock().unwrap();

        let record = [
            row.timestamp_ms.to_string(),
            row.frame_index.to_string(),
            format!("{:.3}", row.latency_ms),
            row.stall.to_string(),
            format!("{:.3}", row.effective_bitrate_kbps),
        ];
        if let Err(e) = writer.write_record(record) {
            warn!("Failed to write metrics row: {}", e);
            return;
        }
        if let Err(e) = writer.flush() {
            warn!("Failed to flush metrics row: {}", e);
        }
    }
}

/// Computes one metric row per detected frame boundary.
///
/// Owns the receiver frame counter, the inter-arrival state and the bitrate
/// window; the caller supplies the receive time and the running count of
/// bytes written to the output file (the byte delta is derived internally so
/// it can never go negative).
pub struct MetricAggregator {
    clock: EpochClock,
    metadata: HashMap<u64, MetadataRow>,
    stall_threshold: Duration,

    frame_index: u64,
    last_frame_at: Option<Instant>,

    window: VecDeque<(Instant, u64)>,
    last_bytes_written: u64,
    last_bitrate_kbps: f64,
}

impl MetricAggregator {
    pub fn new(clock: EpochClock, metadata: HashMap<u64, MetadataRow>, frame_rate: f64) -> Self {
        let frame_period = if frame_rate > 0.0 {
            Duration::from_secs_f64(1.0 / frame_rate)
        } else {
            Duration::ZERO
        };

        MetricAggregator {
            clock,
            metadata,
            stall_threshold: frame_period * 2,
            frame_index: 0,
            last_frame_at: None,
            window: VecDeque::new(),
            last_bytes_written: 0,
            last_bitrate_kbps: 0.0,
        }
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Record a frame boundary observed at `now`, with `bytes_written` the
    /// total bytes emitted to the output file so far.
    pub fn on_frame_boundary(&mut self, now: Instant, bytes_written: u64) -> FrameMetricRow {
        self.frame_index += 1;

        let e2e_latency_ms = if self.clock.has_sender_epoch() {
            self.metadata
                .get(&self.frame_index)
                .map(|row| (self.clock.relative_ms(now) - row.send_start_ms) as f64)
        } else {
            None
        };

        let inter_arrival = self
            .last_frame_at
            .map(|last| now.saturating_duration_since(last));
        let stall = matches!(
            inter_arrival,
            Some(gap) if !self.stall_threshold.is_zero() && gap > self.stall_threshold
        );

        let latency_ms = e2e_latency_ms
            .or(inter_arrival.map(|gap| gap.as_secs_f64() * 1000.0))
            .unwrap_or(0.0);

        let effective_bitrate_kbps = self.update_bitrate_window(now, bytes_written);

        self.last_frame_at = Some(now);

        FrameMetricRow {
            timestamp_ms: self.clock.relative_ms(now),
            frame_index: self.frame_index,
            latency_ms,
            stall,
            effective_bitrate_kbps,
        }
    }

    /// Slide the one-second window and compute the rate over it.
    ///
    /// The oldest sample only marks the span start; its bits belong to the
    /// interval before the window. Thin or implausible windows reuse the
    /// previous frame's value, and the very first frames produce zero.
    fn update_bitrate_window(&mut self, now: Instant, bytes_written: u64) -> f64 {
        let delta_bits = bytes_written.saturating_sub(self.last_bytes_written) * 8;
        self.last_bytes_written = bytes_written;
        self.window.push_back((now, delta_bits));

        while let Some(&(t, _)) = self.window.front() {
            if now.saturating_duration_since(t) > BITRATE_WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }

        let mut kbps = self.last_bitrate_kbps;
        if self.window.len() >= MIN_WINDOW_SAMPLES {
            let first = self.window.front().expect("window non-empty").0;
            let span = now.saturating_duration_since(first);
            if span >= MIN_WINDOW_SPAN {
                let total_bits: u64 = self.window.iter().skip(1).map(|(_, bits)| bits).sum();
                let computed = total_bits as f64 / span.as_secs_f64() / 1000.0;
                if computed > 0.0 && computed <= MAX_PLAUSIBLE_KBPS {
                    kbps = computed;
                }
            }
        }

        self.last_bitrate_kbps = kbps;
        kbps
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::metadata::testutil::temp_dir;

    const FRAME_PERIOD: Duration = Duration::from_nanos(33_333_333);

    fn clock_with_epoch(start: Instant) -> EpochClock {
        // Receiver started 100ms after the sender epoch.
        EpochClock::from_parts(1_000_000, 1_000_100, start, true)
    }

    fn clock_without_epoch(start: Instant) -> EpochClock {
        EpochClock::from_parts(1_000_100, 1_000_100, start, false)
    }

    fn metadata_rows(n: u64) -> HashMap<u64, MetadataRow> {
        // Frame k sent at (k-1) * 33ms (rounded like the writer would).
        (1..=n)
            .map(|k| {
                let ms = ((k - 1) as f64 * 33.333_333) as i64;
                (
                    k,
                    MetadataRow {
                        frame_id: k,
                        send_start_ms: ms,
                        send_end_ms: ms + 4,
                        frame_bits: 200_000,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn frame_index_increments_per_boundary() {
        let start = Instant::now();
        let mut agg = MetricAggregator::new(clock_without_epoch(start), HashMap::new(), 30.0);

        assert_eq!(agg.frame_index(), 0);
        let row = agg.on_frame_boundary(start, 1000);
        assert_eq!(row.frame_index, 1);
        let row = agg.on_frame_boundary(start + FRAME_PERIOD, 2000);
        assert_eq!(row.frame_index, 2);
    }

    #[test]
    fn e2e_latency_uses_shared_epoch() {
        let start = Instant::now();
        let mut agg = MetricAggregator::new(clock_with_epoch(start), metadata_rows(10), 30.0);

        // Frame 1: received at receiver start = epoch + 100ms; sent at 0ms.
        let row = agg.on_frame_boundary(start, 25_000);
        assert_eq!(row.latency_ms, 100.0);
        assert_eq!(row.timestamp_ms, 100);

        // Frame 2: received 33ms later; sent at 33ms. Latency holds at 100.
        let row = agg.on_frame_boundary(start + Duration::from_millis(33), 50_000);
        assert_eq!(row.latency_ms, 100.0);
    }

    #[test]
    fn latency_law_relative_minus_send_start() {
        let start = Instant::now();
        let rows = metadata_rows(5);
        let mut agg = MetricAggregator::new(clock_with_epoch(start), rows.clone(), 30.0);

        for k in 1..=5u64 {
            let now = start + FRAME_PERIOD * (k as u32 - 1);
            let row = agg.on_frame_boundary(now, k * 25_000);
            let clock = clock_with_epoch(start);
            let expected = (clock.relative_ms(now) - rows[&k].send_start_ms) as f64;
            assert_eq!(row.latency_ms, expected);
        }
    }

    #[test]
    fn falls_back_to_inter_arrival_without_epoch() {
        let start = Instant::now();
        let mut agg = MetricAggregator::new(clock_without_epoch(start), metadata_rows(10), 30.0);

        let row = agg.on_frame_boundary(start, 25_000);
        assert_eq!(row.latency_ms, 0.0);

        let row = agg.on_frame_boundary(start + Duration::from_millis(40), 50_000);
        assert_eq!(row.latency_ms, 40.0);
    }

    #[test]
    fn stall_when_gap_exceeds_twice_frame_period() {
        let start = Instant::now();
        let mut agg = MetricAggregator::new(clock_without_epoch(start), HashMap::new(), 30.0);

        agg.on_frame_boundary(start, 25_000);

        // 50ms < 66.7ms: no stall.
        let row = agg.on_frame_boundary(start + Duration::from_millis(50), 50_000);
        assert!(!row.stall);

        // 120ms gap > 66.7ms: stall.
        let row = agg.on_frame_boundary(start + Duration::from_millis(170), 75_000);
        assert!(row.stall);
    }

    #[test]
    fn constant_rate_stream_converges_to_six_mbps() {
        let start = Instant::now();
        let mut agg = MetricAggregator::new(clock_with_epoch(start), metadata_rows(300), 30.0);

        let mut stalls = 0;
        let mut last_kbps = 0.0;
        for k in 1..=300u64 {
            let now = start + FRAME_PERIOD * (k as u32 - 1);
            let row = agg.on_frame_boundary(now, k * 25_000);
            if row.stall {
                stalls += 1;
            }
            last_kbps = row.effective_bitrate_kbps;

            if k < 5 {
                // Not enough samples: the first frames produce zero.
                assert_eq!(row.effective_bitrate_kbps, 0.0);
            }
            if k >= 31 {
                // 200_000 bits per frame at 30 Hz: 6000 kbit/s.
                assert!((row.effective_bitrate_kbps - 6000.0).abs() < 1.0);
            }
        }

        assert_eq!(agg.frame_index(), 300);
        assert_eq!(stalls, 0);
        assert!((last_kbps - 6000.0).abs() < 1.0);
    }

    #[test]
    fn byte_counter_regression_cannot_go_negative() {
        let start = Instant::now();
        let mut agg = MetricAggregator::new(clock_without_epoch(start), HashMap::new(), 30.0);

        agg.on_frame_boundary(start, 50_000);
        // File rollover: total shrinks. The delta clamps to zero.
        let row = agg.on_frame_boundary(start + FRAME_PERIOD, 10_000);
        assert_eq!(row.effective_bitrate_kbps, 0.0);
    }

    #[test]
    fn implausible_rate_reuses_previous_value() {
        let start = Instant::now();
        let mut agg = MetricAggregator::new(clock_without_epoch(start), HashMap::new(), 30.0);

        // Warm up to a steady 6000 kbit/s.
        let mut now = start;
        let mut bytes = 0u64;
        for _ in 0..30 {
            now += FRAME_PERIOD;
            bytes += 25_000;
            agg.on_frame_boundary(now, bytes);
        }
        let steady = agg
            .on_frame_boundary(now + FRAME_PERIOD, bytes + 25_000)
            .effective_bitrate_kbps;

        // A burst of over a gigabit within the window is rejected and the
        // previous frame's value is reused.
        let row = agg.on_frame_boundary(now + FRAME_PERIOD * 2, bytes + 25_000 + 200_000_000);
        assert_eq!(row.effective_bitrate_kbps, steady);
    }

    #[test]
    fn writer_emits_header_and_rows() {
        let dir = temp_dir("metrics");
        let path = dir.join(METRICS_FILE);
        let writer = MetricsCsvWriter::create(&path).unwrap();

        writer.append(&FrameMetricRow {
            timestamp_ms: 133,
            frame_index: 4,
            latency_ms: 25.5,
            stall: false,
            effective_bitrate_kbps: 6000.0,
        });
        writer.append(&FrameMetricRow {
            timestamp_ms: 170,
            frame_index: 5,
            latency_ms: 37.25,
            stall: true,
            effective_bitrate_kbps: 5800.125,
        });

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(
            lines.next().unwrap(),
            "timestamp_ms,frame_index,latency_ms,stall,effective_bitrate_kbps"
        );
        assert_eq!(lines.next().unwrap(), "133,4,25.500,false,6000.000");
        assert_eq!(lines.next().unwrap(), "170,5,37.250,true,5800.125");

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
