//! Optional per-frame controller trace, for debugging and plotting how a
//! controller tracked the stream.

use std::fs::File;
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use crate::control::{ControllerSnapshot, Directive};
use crate::Error;

pub const TRACE_FILE: &str = "controller_trace.csv";

const TRACE_HEADER: [&str; 9] = [
    "frame_index",
    "target_bits",
    "actual_bits",
    "directive",
    "send_start_ms",
    "send_end_ms",
    "rate_bps",
    "mean_frame_bits",
    "variance_frame_bits",
];

/// One trace row, captured after a frame has been sent.
#[derive(Debug, Clone, Copy)]
pub struct TraceRecord {
    pub frame_id: u64,
    pub target_bits: u64,
    pub actual_bits: u64,
    pub directive: Directive,
    pub send_start: Instant,
    pub send_end: Instant,
    pub snapshot: ControllerSnapshot,
}

/// Mutexed, per-row-flushed writer for the controller trace CSV.
pub struct ControllerTraceWriter {
    inner: Mutex<Inner>,
}

struct Inner {
    writer: csv::Writer<File>,
    origin: Instant,
}

impl ControllerTraceWriter {
    /// `origin` is the same instant the frame metadata writer stamps
    /// against, so both sender CSVs share a time base.
    pub fn create(path: &Path, origin: Instant) -> Result<Self, Error> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(TRACE_HEADER)?;
        writer.flush()?;

        Ok(ControllerTraceWriter {
            inner: Mutex::new(Inner { writer, origin }),
        })
    }

    /// Append one row and flush it. Failures are logged, not propagated.
    pub fn append(&self, record: &TraceRecord) {
        let mut inner = self.inner.lock().unwrap();
        let origin = inner.origin;

        let start_ms = record
            .send_start
            .saturating_duration_since(origin)
            .as_millis() as i64;
        let end_ms = record
            .send_end
            .saturating_duration_since(origin)
            .as_millis() as i64;

        let row = [
            record.frame_id.to_string(),
            record.target_bits.to_string(),
            record.actual_bits.to_string(),
            record.directive.to_string(),
            start_ms.to_string(),
            end_ms.to_string(),
            format!("{:.0}", record.snapshot.rate_bps),
            format!("{:.0}", record.snapshot.mean_frame_bits),
            format!("{:.0}", record.snapshot.variance_frame_bits),
        ];
        if let Err(e) = inner.writer.write_record(row) {
            warn!("Failed to write controller trace row: {}", e);
            return;
        }
        if let Err(e) = inner.writer.flush() {
            warn!("Failed to flush controller trace row: {}", e);
        }
    }
}
