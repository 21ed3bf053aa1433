//! Receive side: the RTP read loop, the Annex-B output file and the
//! per-frame metrics pipeline.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use thiserror::Error as ThisError;

use crate::cancel::CancelToken;
use crate::metadata::{self, EpochClock};
use crate::Error;

mod depacket;
pub mod metrics;
mod summary;

pub use depacket::{Depacketized, H264Depacketizer, ANNEXB_START_CODE};
pub use metrics::{FrameMetricRow, MetricAggregator, MetricsCsvWriter, METRICS_FILE};
pub use summary::{
    compute_summary, write_summary, SummaryMetrics, SUMMARY_JSON_FILE, SUMMARY_TEXT_FILE,
};

/// Output buffering: a mid-run crash loses at most one flush interval.
const OUTPUT_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, ThisError)]
pub enum TransportError {
    #[error("transport closed: {0}")]
    Closed(String),

    #[error("transport read failed: {0}")]
    Read(String),
}

impl TransportError {
    /// Whether this error means the peer went away normally. Matched on the
    /// message text because transports stringify their close conditions.
    pub fn is_clean_close(&self) -> bool {
        match self {
            TransportError::Closed(_) => true,
            TransportError::Read(msg) => msg.contains("closed") || msg.contains("EOF"),
        }
    }
}

/// The inbound RTP track, reduced to what the receive loop needs.
pub trait RtpSource {
    /// Wait up to `timeout` for the next RTP payload. `Ok(None)` means
    /// nothing arrived within the timeout.
    fn poll_payload(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError>;

    /// Ask the sender for a keyframe (RTCP PLI).
    fn request_keyframe(&mut self) -> Result<(), TransportError>;
}

/// Receive-loop configuration.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Where the Annex-B elementary stream is written.
    pub output_path: PathBuf,
    /// Session directory holding the sender's metadata and receiving the
    /// metric artefacts. `None` disables metrics entirely.
    pub session_dir: Option<PathBuf>,
    /// Nominal frame rate, for the stall threshold.
    pub frame_rate: f64,
    /// Stop after this much wall-clock time.
    pub max_duration: Option<Duration>,
    /// Stop once the output file reaches this size.
    pub max_size_bytes: Option<u64>,
    /// Inactivity timeout: no RTP payload for this long ends the loop.
    pub read_timeout: Duration,
    /// Cadence for keyframe requests.
    pub pli_interval: Duration,
    /// Upper bound for one blocking poll on the source.
    pub poll_interval: Duration,
    /// Cadence for flushing and fsyncing the output file.
    pub flush_interval: Duration,
}

impl ReceiverConfig {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        ReceiverConfig {
            output_path: output_path.into(),
            session_dir: None,
            frame_rate: 30.0,
            max_duration: None,
            max_size_bytes: None,
            read_timeout: Duration::from_secs(5),
            pli_interval: Duration::from_secs(3),
            poll_interval: Duration::from_millis(200),
            flush_interval: Duration::from_secs(1),
        }
    }

    pub fn session_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.session_dir = Some(dir.into());
        self
    }

    pub fn frame_rate(mut self, fps: f64) -> Self {
        self.frame_rate = fps;
        self
    }

    pub fn max_duration(mut self, limit: Duration) -> Self {
        self.max_duration = Some(limit);
        self
    }

    pub fn max_size_bytes(mut self, limit: u64) -> Self {
        self.max_size_bytes = Some(limit);
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }
}

/// Counters reported after a clean exit.
#[derive(Debug, Default)]
pub struct ReceiveStats {
    pub packets: u64,
    pub bytes_written: u64,
    pub frames: u64,
    /// Present when a metrics CSV was written and reducible.
    pub summary: Option<SummaryMetrics>,
}

/// Blocking RTP-to-file loop. Owns the output file, the depacketizer and
/// the metric pipeline for the lifetime of the session.
pub struct ReceiveLoop {
    cfg: ReceiverConfig,
    cancel: CancelToken,

    writer: BufWriter<File>,
    depacketizer: H264Depacketizer,
    aggregator: MetricAggregator,
    metrics_writer: Option<MetricsCsvWriter>,

    bytes_written: u64,
    packets: u64,
}

impl ReceiveLoop {
    /// Open the output file and wire up the metric pipeline. Reads the
    /// sender epoch and frame metadata from the session directory when they
    /// exist.
    pub fn new(cfg: ReceiverConfig, cancel: CancelToken) -> Result<Self, Error> {
        if let Some(dir) = cfg.output_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = File::create(&cfg.output_path)?;
        let writer = BufWriter::with_capacity(OUTPUT_BUFFER_SIZE, file);

        let clock = EpochClock::at_receiver_start(cfg.session_dir.as_deref());

        let frame_metadata = cfg
            .session_dir
            .as_ref()
            .map(|dir| dir.join(metadata::METADATA_FILE))
            .filter(|path| path.exists())
            .and_then(|path| match metadata::load_metadata(&path) {
                Ok(rows) => {
                    info!("Loaded {} frame metadata entries", rows.len());
                    Some(rows)
                }
                Err(e) => {
                    warn!("Could not load frame metadata: {}", e);
                    None
                }
            })
            .unwrap_or_default();

        let metrics_writer = match &cfg.session_dir {
            Some(dir) => match MetricsCsvWriter::create(&dir.join(METRICS_FILE)) {
                Ok(w) => Some(w),
                Err(e) => {
                    warn!("Failed to create metrics CSV writer: {}", e);
                    None
                }
            },
            None => None,
        };

        let aggregator = MetricAggregator::new(clock, frame_metadata, cfg.frame_rate);

        Ok(ReceiveLoop {
            cfg,
            cancel,
            writer,
            depacketizer: H264Depacketizer::new(),
            aggregator,
            metrics_writer,
            bytes_written: 0,
            packets: 0,
        })
    }

    /// Run until a terminal condition: cancellation, inactivity timeout,
    /// max duration or size, or a transport close. All of these are normal
    /// local termination; the summary is computed before returning.
    pub fn run(mut self, source: &mut dyn RtpSource) -> Result<ReceiveStats, Error> {
        info!(
            "Writing H264 stream to {} (annex-b)",
            self.cfg.output_path.display()
        );

        let start = Instant::now();
        let mut last_data = start;
        let mut last_flush = start;
        // The first PLI goes out one interval after start.
        let mut last_pli = start;
        let mut scratch = Vec::with_capacity(2048);

        loop {
            let now = Instant::now();

            if self.cancel.is_fired() {
                info!("Cancellation fired, stopping receive loop");
                break;
            }
            if let Some(limit) = self.cfg.max_duration {
                if now.duration_since(start) >= limit {
                    info!("Max duration ({:?}) reached, stopping", limit);
                    break;
                }
            }
            if let Some(limit) = self.cfg.max_size_bytes {
                if self.bytes_written >= limit {
                    info!("Max size ({} bytes) reached, stopping", limit);
                    break;
                }
            }
            if now.duration_since(last_data) > self.cfg.read_timeout {
                info!(
                    "Read timeout ({:?}) - no data received, assuming connection closed",
                    self.cfg.read_timeout
                );
                break;
            }

            if now.duration_since(last_pli) >= self.cfg.pli_interval {
                if let Err(e) = source.request_keyframe() {
                    warn!("Failed to send PLI: {}", e);
                }
                last_pli = now;
            }

            match source.poll_payload(self.cfg.poll_interval) {
                Ok(Some(payload)) => {
                    last_data = Instant::now();
                    self.packets += 1;
                    self.handle_payload(&payload, last_data, &mut scratch);
                }
                Ok(None) => {}
                Err(e) if e.is_clean_close() => {
                    info!("Connection closed: {}", e);
                    break;
                }
                Err(e) => {
                    warn!("Error reading track: {}", e);
                    break;
                }
            }

            if now.duration_since(last_flush) >= self.cfg.flush_interval {
                self.flush_output();
                debug!(
                    "Progress: {} packets, {} bytes, {:?} elapsed",
                    self.packets,
                    self.bytes_written,
                    now.duration_since(start)
                );
                last_flush = now;
            }
        }

        if self.depacketizer.has_partial() {
            warn!("Discarding incomplete FU-A fragment at shutdown");
        }
        if self.depacketizer.dropped_fua() > 0 || self.depacketizer.stapa_overruns() > 0 {
            debug!(
                "Defensive drops: {} FU-A, {} STAP-A overruns, {} unhandled payload types",
                self.depacketizer.dropped_fua(),
                self.depacketizer.stapa_overruns(),
                self.depacketizer.unhandled()
            );
        }

        self.flush_output();
        info!(
            "Completed: {} packets, {} bytes, {} frames",
            self.packets,
            self.bytes_written,
            self.aggregator.frame_index()
        );

        let summary = self.reduce_summary();

        Ok(ReceiveStats {
            packets: self.packets,
            bytes_written: self.bytes_written,
            frames: self.aggregator.frame_index(),
            summary,
        })
    }

    fn handle_payload(&mut self, payload: &[u8], received_at: Instant, scratch: &mut Vec<u8>) {
        scratch.clear();
        let result = self.depacketizer.depacketize(payload, scratch);
        if scratch.is_empty() {
            return;
        }

        if let Err(e) = self.writer.write_all(scratch) {
            warn!("Error writing NAL unit: {}", e);
            return;
        }
        self.bytes_written += scratch.len() as u64;

        if result.frame_start {
            let row = self.aggregator.on_frame_boundary(received_at, self.bytes_written);
            if let Some(writer) = &self.metrics_writer {
                writer.append(&row);
            }
        }
    }

    fn flush_output(&mut self) {
        if let Err(e) = self.writer.flush() {
            warn!("Failed to flush output file: {}", e);
        }
        if let Err(e) = self.writer.get_ref().sync_all() {
            warn!("Failed to fsync output file: {}", e);
        }
    }

    /// Reduce the metrics CSV to the summary artefacts. Failures here are
    /// logged but never turn a clean shutdown into an error.
    fn reduce_summary(&self) -> Option<SummaryMetrics> {
        let dir = self.cfg.session_dir.as_ref()?;
        if self.metrics_writer.is_none() {
            return None;
        }

        match compute_summary(&dir.join(METRICS_FILE)) {
            Ok(summary) => {
                if let Err(e) = write_summary(&summary, dir) {
                    warn!("Failed to write summary artefacts: {}", e);
                }
                Some(summary)
            }
            Err(e) => {
                warn!("Failed to compute summary: {}", e);
                None
            }
        }
    }
}
