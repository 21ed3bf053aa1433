//! Frame-metadata CSV surface shared by the sender (writer) and the
//! receiver (loader), plus the session epoch both sides time against.
//!
//! The two millisecond columns are relative to a single epoch: the sender's
//! start time, persisted as Unix milliseconds in a sibling file so the
//! receiver can compute end-to-end latencies on the same time base.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::Error;

pub const METADATA_FILE: &str = "frame_metadata.csv";
pub const EPOCH_FILE: &str = "start_time.txt";

const METADATA_HEADER: [&str; 4] = ["frame_id", "send_start_ms", "send_end_ms", "frame_bits"];

/// One frame's send-side metadata, as captured by the send loop.
#[derive(Debug, Clone, Copy)]
pub struct FrameMetadata {
    pub frame_id: u64,
    pub send_start: Instant,
    pub send_end: Instant,
    pub bits: u64,
}

/// Append-only, per-row-flushed writer for the frame metadata CSV.
///
/// Serialised under a mutex; a crashed sender still leaves a valid prefix of
/// complete rows. Row failures are logged, never propagated.
pub struct FrameMetadataWriter {
    inner: Mutex<WriterInner>,
}

struct WriterInner {
    writer: csv::Writer<File>,
    origin: Instant,
}

impl FrameMetadataWriter {
    /// Create `frame_metadata.csv` in the session directory, write the
    /// header, and persist the epoch to `start_time.txt`.
    pub fn create(session_dir: &Path) -> Result<Self, Error> {
        fs::create_dir_all(session_dir)?;

        let path = session_dir.join(METADATA_FILE);
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(METADATA_HEADER)?;
        writer.flush()?;

        let origin = Instant::now();
        let epoch_ms = unix_millis_now();
        let epoch_path = session_dir.join(EPOCH_FILE);
        if let Err(e) = fs::write(&epoch_path, format!("{}\n", epoch_ms)) {
            warn!("Failed to write {}: {}", epoch_path.display(), e);
        }

        Ok(FrameMetadataWriter {
            inner: Mutex::new(WriterInner { writer, origin }),
        })
    }

    /// The instant relative to which the millisecond columns are computed.
    pub fn origin(&self) -> Instant {
        self.inner.lock().unwrap().origin
    }

    /// Append one row and flush it.
    pub fn append(&self, metadata: &FrameMetadata) {
        let mut inner = self.inner.lock().unwrap();

        let origin = inner.origin;
        let start_ms = metadata.send_start.saturating_duration_since(origin).as_millis() as i64;
        let end_ms = metadata.send_end.saturating_duration_since(origin).as_millis() as i64;

        let record = [
            metadata.frame_id.to_string(),
            start_ms.to_string(),
            end_ms.to_string(),
            metadata.bits.to_string(),
        ];
        if let Err(e) = inner.writer.write_record(record) {
            warn!("Failed to write frame metadata row: {}", e);
            return;
        }
        if let Err(e) = inner.writer.flush() {
            warn!("Failed to flush frame metadata row: {}", e);
        }
    }
}

/// One loaded row of the frame metadata CSV, as the receiver consumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataRow {
    pub frame_id: u64,
    pub send_start_ms: i64,
    pub send_end_ms: i64,
    pub frame_bits: u64,
}

/// Load the sender's frame metadata, keyed by frame id. Malformed rows are
/// skipped.
pub fn load_metadata(path: &Path) -> Result<HashMap<u64, MetadataRow>, Error> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = HashMap::new();

    for record in reader.records() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                debug!("Skipping malformed metadata row: {}", e);
                continue;
            }
        };
        if record.len() < 4 {
            continue;
        }

        let parsed = (
            record[0].parse::<u64>(),
            record[1].parse::<i64>(),
            record[2].parse::<i64>(),
            record[3].parse::<u64>(),
        );
        if let (Ok(frame_id), Ok(send_start_ms), Ok(send_end_ms), Ok(frame_bits)) = parsed {
            rows.insert(
                frame_id,
                MetadataRow {
                    frame_id,
                    send_start_ms,
                    send_end_ms,
                    frame_bits,
                },
            );
        }
    }

    Ok(rows)
}

/// Read the sender epoch (`start_time.txt`), if present and parseable.
pub fn read_epoch_millis(session_dir: &Path) -> Option<i64> {
    let path = session_dir.join(EPOCH_FILE);
    let data = fs::read_to_string(&path).ok()?;
    match data.trim().parse::<i64>() {
        Ok(ms) => Some(ms),
        Err(e) => {
            warn!("Failed to parse {}: {}", path.display(), e);
            None
        }
    }
}

pub(crate) fn unix_millis_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Translates the receiver's monotonic clock into milliseconds relative to
/// the sender epoch (or the receiver's own start when no epoch file exists).
#[derive(Debug, Clone, Copy)]
pub struct EpochClock {
    epoch_unix_ms: i64,
    start_unix_ms: i64,
    start_instant: Instant,
    has_sender_epoch: bool,
}

impl EpochClock {
    /// Capture "now" as the receiver start and adopt the sender epoch from
    /// the session directory when available.
    pub fn at_receiver_start(session_dir: Option<&Path>) -> Self {
        let start_unix_ms = unix_millis_now();
        let start_instant = Instant::now();

        let sender_epoch = session_dir.and_then(read_epoch_millis);
        match sender_epoch {
            Some(epoch_unix_ms) => {
                debug!("Using sender epoch {} ms", epoch_unix_ms);
                EpochClock {
                    epoch_unix_ms,
                    start_unix_ms,
                    start_instant,
                    has_sender_epoch: true,
                }
            }
            None => EpochClock {
                epoch_unix_ms: start_unix_ms,
                start_unix_ms,
                start_instant,
                has_sender_epoch: false,
            },
        }
    }

    /// Fully specified constructor for deterministic tests.
    pub fn from_parts(
        epoch_unix_ms: i64,
        start_unix_ms: i64,
        start_instant: Instant,
        has_sender_epoch: bool,
    ) -> Self {
        EpochClock {
            epoch_unix_ms,
            start_unix_ms,
            start_instant,
            has_sender_epoch,
        }
    }

    pub fn has_sender_epoch(&self) -> bool {
        self.has_sender_epoch
    }

    /// Milliseconds since the epoch for a receiver-side instant.
    pub fn relative_ms(&self, now: Instant) -> i64 {
        let since_start = now.saturating_duration_since(self.start_instant).as_millis() as i64;
        self.start_unix_ms - self.epoch_unix_ms + since_start
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    /// A fresh directory under the system temp dir.
    pub fn temp_dir(tag: &str) -> PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!(
            "framepace-{}-{}-{}",
            tag,
            std::process::id(),
            n
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
