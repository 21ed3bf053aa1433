//! Cross-module scenarios: a sender stream carried over a lossless in-memory
//! transport must reach the receiver as the identical Annex-B NAL sequence,
//! with the metric artefacts produced alongside.

mod common;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use framepace::cancel::CancelToken;
use framepace::codec::{
    CodecError, CodedUnit, EncodedPacket, EncoderAdapter, EncoderFactory, EncoderSettings,
    MediaSource, RawFrame, StreamKind, VideoDecoder, VideoEncoder,
};
use framepace::control::{BurstConfig, BurstController, Controller};
use framepace::metadata::{FrameMetadataWriter, METADATA_FILE};
use framepace::receiver::{
    ReceiveLoop, ReceiverConfig, RtpSource, TransportError, ANNEXB_START_CODE, METRICS_FILE,
    SUMMARY_JSON_FILE,
};
use framepace::sender::{SampleSink, SendLoop, SenderConfig};

use common::init_log;

fn temp_dir(tag: &str) -> PathBuf {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    let n = COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!(
        "framepace-scenario-{}-{}-{}",
        tag,
        std::process::id(),
        n
    ));
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// A NAL unit with a deterministic non-zero body, so no accidental start
/// codes appear inside it.
fn make_nal(nal_type: u8, frame_no: u8, size: usize) -> Vec<u8> {
    let mut nal = Vec::with_capacity(size);
    nal.push(0x60 | nal_type);
    nal.push(frame_no);
    for i in 2..size {
        nal.push((i % 250 + 1) as u8);
    }
    nal
}

/// RFC 6184 payloads for one NAL: a single payload when it fits the MTU,
/// FU-A fragments otherwise.
fn packetize(nal: &[u8], mtu: usize) -> Vec<Vec<u8>> {
    if nal.len() <= mtu {
        return vec![nal.to_vec()];
    }

    let indicator = (nal[0] & 0xE0) | 28;
    let nal_type = nal[0] & 0x1F;
    let body = &nal[1..];
    let chunk_size = mtu - 2;

    let chunks: Vec<&[u8]> = body.chunks(chunk_size).collect();
    let last = chunks.len() - 1;

    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let mut fu_header = nal_type;
            if i == 0 {
                fu_header |= 0x80;
            }
            if i == last {
                fu_header |= 0x40;
            }
            let mut payload = Vec::with_capacity(2 + chunk.len());
            payload.push(indicator);
            payload.push(fu_header);
            payload.extend_from_slice(chunk);
            payload
        })
        .collect()
}

/// Sender-side transport: packetizes every sample into the channel.
struct PipeSink {
    tx: Sender<Vec<u8>>,
    mtu: usize,
}

impl SampleSink for PipeSink {
    fn write_sample(&mut self, data: &[u8], _duration: Duration) -> std::io::Result<()> {
        for payload in packetize(data, self.mtu) {
            self.tx
                .send(payload)
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))?;
        }
        Ok(())
    }
}

/// Receiver-side transport over the same channel.
struct PipeSource {
    rx: Receiver<Vec<u8>>,
}

impl RtpSource for PipeSource {
    fn poll_payload(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        match self.rx.recv_timeout(timeout) {
            Ok(payload) => Ok(Some(payload)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(TransportError::Closed("track ended (EOF)".into()))
            }
        }
    }

    fn request_keyframe(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct NalSource {
    remaining: usize,
}

impl MediaSource for NalSource {
    fn frame_rate(&self) -> Option<f64> {
        Some(1000.0)
    }

    fn read_unit(&mut self) -> Result<CodedUnit, CodecError> {
        if self.remaining == 0 {
            return Err(CodecError::Eof);
        }
        self.remaining -= 1;
        Ok(CodedUnit {
            stream: StreamKind::Video,
            data: vec![0u8; 16],
        })
    }

    fn seek_start(&mut self) -> Result<(), CodecError> {
        Ok(())
    }
}

struct PassthroughDecoder {
    pending: Option<RawFrame>,
}

impl VideoDecoder for PassthroughDecoder {
    fn send_unit(&mut self, unit: &CodedUnit) -> Result<(), CodecError> {
        self.pending = Some(RawFrame {
            width: 64,
            height: 64,
            data: unit.data.clone(),
            pts: 0,
        });
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<RawFrame, CodecError> {
        self.pending.take().ok_or(CodecError::Again)
    }
}

/// Emits one slice NAL per frame: an IDR for the first frame, non-IDR after.
struct NalEncoder {
    nal_size: usize,
    pending: Option<EncodedPacket>,
}

impl VideoEncoder for NalEncoder {
    fn send_frame(&mut self, frame: &RawFrame) -> Result<(), CodecError> {
        let nal_type = if frame.pts == 1 { 5 } else { 1 };
        self.pending = Some(EncodedPacket {
            data: make_nal(nal_type, frame.pts as u8, self.nal_size),
        });
        Ok(())
    }

    fn receive_packet(&mut self) -> Result<EncodedPacket, CodecError> {
        self.pending.take().ok_or(CodecError::Again)
    }
}

struct NalFactory {
    nal_size: usize,
}

impl EncoderFactory for NalFactory {
    fn open(&mut self, _settings: &EncoderSettings) -> Result<Box<dyn VideoEncoder>, CodecError> {
        Ok(Box::new(NalEncoder {
            nal_size: self.nal_size,
            pending: None,
        }))
    }
}

fn run_sender(dir: &Path, frames: usize, nal_size: usize, tx: Sender<Vec<u8>>, mtu: usize) {
    let metadata = FrameMetadataWriter::create(dir).unwrap();
    let controller = Controller::Burst(BurstController::new(BurstConfig::default()));

    let send_loop = SendLoop::new(
        Box::new(NalSource { remaining: frames }),
        Box::new(PassthroughDecoder { pending: None }),
        EncoderAdapter::new(
            Box::new(NalFactory { nal_size }),
            EncoderSettings::low_latency(64, 64, 30, 32),
        ),
        controller,
        CancelToken::new(),
        SenderConfig::default(),
    )
    .with_metadata_writer(metadata);

    let mut sink = PipeSink { tx, mtu };
    let outcome = send_loop.run(&mut sink).unwrap();
    assert_eq!(outcome, framepace::sender::SendOutcome::Completed);
}

fn expected_annexb(frames: usize, nal_size: usize) -> Vec<u8> {
    let mut expected = Vec::new();
    for frame_no in 1..=frames {
        let nal_type = if frame_no == 1 { 5 } else { 1 };
        expected.extend_from_slice(ANNEXB_START_CODE);
        expected.extend_from_slice(&make_nal(nal_type, frame_no as u8, nal_size));
    }
    expected
}

#[test]
fn lossless_round_trip_preserves_nal_sequence() {
    init_log();

    let dir = temp_dir("roundtrip");
    let frames = 20;
    // Larger than the MTU, so every frame travels as FU-A fragments.
    let nal_size = 3000;
    let mtu = 1200;

    let (tx, rx) = unbounded();
    run_sender(&dir, frames, nal_size, tx, mtu);

    let cfg = ReceiverConfig::new(dir.join("received.h264"))
        .session_dir(&dir)
        .frame_rate(1000.0)
        .read_timeout(Duration::from_millis(200))
        .poll_interval(Duration::from_millis(10));
    let mut source = PipeSource { rx };
    let stats = ReceiveLoop::new(cfg, CancelToken::new())
        .unwrap()
        .run(&mut source)
        .unwrap();

    assert_eq!(stats.frames, frames as u64);

    // The reconstructed file equals the sender's NAL sequence, in order.
    let received = fs::read(dir.join("received.h264")).unwrap();
    assert_eq!(received, expected_annexb(frames, nal_size));

    // Frame metadata, per-frame metrics and the summary all exist.
    assert!(dir.join(METADATA_FILE).exists());
    let metrics = fs::read_to_string(dir.join(METRICS_FILE)).unwrap();
    assert_eq!(metrics.lines().count(), frames + 1);

    let summary = stats.summary.expect("summary present after clean close");
    assert_eq!(summary.total_frames, frames as u64);
    assert!(dir.join(SUMMARY_JSON_FILE).exists());

    // With the shared epoch, every latency is the receiver-relative time
    // minus the matching send_start; in-process that stays near zero but
    // must never be wildly negative.
    for line in metrics.lines().skip(1) {
        let latency: f64 = line.split(',').nth(2).unwrap().parse().unwrap();
        assert!(latency > -5.0, "latency {} out of range", latency);
    }

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn small_nals_travel_as_single_payloads() {
    init_log();

    let dir = temp_dir("single");
    let frames = 10;
    let nal_size = 400;
    let mtu = 1200;

    let (tx, rx) = unbounded();
    run_sender(&dir, frames, nal_size, tx, mtu);

    let cfg = ReceiverConfig::new(dir.join("received.h264"))
        .session_dir(&dir)
        .frame_rate(1000.0)
        .read_timeout(Duration::from_millis(200))
        .poll_interval(Duration::from_millis(10));
    let mut source = PipeSource { rx };
    let stats = ReceiveLoop::new(cfg, CancelToken::new())
        .unwrap()
        .run(&mut source)
        .unwrap();

    // One RTP payload per frame, nothing fragmented.
    assert_eq!(stats.packets, frames as u64);
    assert_eq!(stats.frames, frames as u64);

    let received = fs::read(dir.join("received.h264")).unwrap();
    assert_eq!(received, expected_annexb(frames, nal_size));

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn mixed_parameter_sets_and_slices_reassemble() {
    init_log();

    let dir = temp_dir("mixed");

    // STAP-A with SPS + PPS, then an IDR slice as FU-A, then a small
    // non-IDR slice as a single payload.
    let sps = [0x67, 0x42, 0xc0, 0x1f];
    let pps = [0x68, 0xce, 0x3c, 0x80];
    let mut stapa = vec![0x78];
    stapa.extend_from_slice(&(sps.len() as u16).to_be_bytes());
    stapa.extend_from_slice(&sps);
    stapa.extend_from_slice(&(pps.len() as u16).to_be_bytes());
    stapa.extend_from_slice(&pps);

    let idr = make_nal(5, 1, 2500);
    let slice = make_nal(1, 2, 200);

    let (tx, rx) = unbounded();
    tx.send(stapa).unwrap();
    for fragment in packetize(&idr, 1200) {
        tx.send(fragment).unwrap();
    }
    tx.send(slice.clone()).unwrap();
    drop(tx);

    let cfg = ReceiverConfig::new(dir.join("received.h264"))
        .session_dir(&dir)
        .read_timeout(Duration::from_millis(200))
        .poll_interval(Duration::from_millis(10));
    let mut source = PipeSource { rx };
    let stats = ReceiveLoop::new(cfg, CancelToken::new())
        .unwrap()
        .run(&mut source)
        .unwrap();

    // SPS and PPS are not frame boundaries; the two slices are.
    assert_eq!(stats.frames, 2);

    let mut expected = Vec::new();
    for nal in [&sps[..], &pps[..], &idr[..], &slice[..]] {
        expected.extend_from_slice(ANNEXB_START_CODE);
        expected.extend_from_slice(nal);
    }
    let received = fs::read(dir.join("received.h264")).unwrap();
    assert_eq!(received, expected);

    fs::remove_dir_all(&dir).unwrap();
}
