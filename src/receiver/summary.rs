//! Post-hoc reduction of the receiver metrics CSV into summary artefacts.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Error;

pub const SUMMARY_JSON_FILE: &str = "metrics_summary.json";
pub const SUMMARY_TEXT_FILE: &str = "metrics_summary.txt";

/// Aggregate session metrics, written at clean receiver shutdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryMetrics {
    pub total_frames: u64,
    pub average_latency_ms: f64,
    pub p99_latency_ms: f64,
    /// Fraction of frames flagged as stalled, in [0, 1].
    pub stall_rate: f64,
    /// Mean over rows with a positive bitrate.
    pub effective_bitrate_kbps: f64,
    pub total_stall_frames: u64,
    pub total_duration_seconds: f64,
}

/// Reduce the per-frame CSV to aggregate metrics. Malformed rows are
/// skipped; a file with no valid rows is an error.
pub fn compute_summary(csv_path: &Path) -> Result<SummaryMetrics, Error> {
    let mut reader = csv::Reader::from_path(csv_path)?;

    let mut latencies: Vec<f64> = Vec::new();
    let mut stall_count = 0u64;
    let mut bitrate_sum = 0.0;
    let mut bitrate_count = 0u64;
    let mut first_timestamp: Option<i64> = None;
    let mut last_timestamp = 0i64;

    for record in reader.records() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                debug!("Skipping malformed metrics row: {}", e);
                continue;
            }
        };
        if record.len() < 5 {
            continue;
        }

        let parsed = (
            record[0].parse::<i64>(),
            record[2].parse::<f64>(),
            record[3].parse::<bool>(),
            record[4].parse::<f64>(),
        );
        let (Ok(timestamp_ms), Ok(latency_ms), Ok(stall), Ok(bitrate_kbps)) = parsed else {
            continue;
        };

        latencies.push(latency_ms);
        if stall {
            stall_count += 1;
        }
        if bitrate_kbps > 0.0 {
            bitrate_sum += bitrate_kbps;
            bitrate_count += 1;
        }

        if first_timestamp.is_none() {
            first_timestamp = Some(timestamp_ms);
        }
        last_timestamp = timestamp_ms;
    }

    if latencies.is_empty() {
        return Err(Error::Config(format!(
            "no valid metric rows in {}",
            csv_path.display()
        )));
    }

    let total = latencies.len() as u64;
    let average_latency_ms = latencies.iter().sum::<f64>() / total as f64;

    latencies.sort_by(|a, b| a.partial_cmp(b).expect("latencies are finite"));
    let p99_index = ((total as f64 * 0.99) as usize).min(latencies.len() - 1);
    let p99_latency_ms = latencies[p99_index];

    let effective_bitrate_kbps = if bitrate_count > 0 {
        bitrate_sum / bitrate_count as f64
    } else {
        0.0
    };

    let total_duration_seconds =
        (last_timestamp - first_timestamp.unwrap_or(last_timestamp)) as f64 / 1000.0;

    Ok(SummaryMetrics {
        total_frames: total,
        average_latency_ms,
        p99_latency_ms,
        stall_rate: stall_count as f64 / total as f64,
        effective_bitrate_kbps,
        total_stall_frames: stall_count,
        total_duration_seconds,
    })
}

/// Write the JSON and human-readable summary artefacts to the session
/// directory.
pub fn write_summary(summary: &SummaryMetrics, session_dir: &Path) -> Result<(), Error> {
    fs::create_dir_all(session_dir)?;

    let json_path = session_dir.join(SUMMARY_JSON_FILE);
    let json = serde_json::to_string_pretty(summary)?;
    fs::write(&json_path, json)?;

    let text = format!(
        "Frame Metrics Summary\n\
         ====================\n\
         Total Frames:           {}\n\
         Average Latency:        {:.3} ms\n\
         P99 Latency:            {:.3} ms\n\
         Stall Rate:             {:.2}% ({} frames)\n\
         Effective Bitrate:      {:.2} kbps\n\
         Total Duration:         {:.2} seconds\n",
        summary.total_frames,
        summary.average_latency_ms,
        summary.p99_latency_ms,
        summary.stall_rate * 100.0,
        summary.total_stall_frames,
        summary.effective_bitrate_kbps,
        summary.total_duration_seconds,
    );
    let text_path = session_dir.join(SUMMARY_TEXT_FILE);
    fs::write(&text_path, text)?;

    info!(
        "Summary metrics written to {} and {}",
        json_path.display(),
        text_path.display()
    );
    Ok(())
}
