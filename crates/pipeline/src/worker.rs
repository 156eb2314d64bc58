//! Worker encode channel: a parallel execution context that owns the
//! encoder, fed through an ordered message channel. The controller never
//! shares mutable state with the worker; frames, audio, and encoded chunks
//! all travel as messages.

use std::io::{BufReader, Read, Write as _};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ErrorCode, ExportError};
use crate::frame::{FrameTask, PcmBuffer};
use crate::progress::{CancelToken, ExportPhase};
use crate::settings::{BitrateMode, VideoExportSettings, VideoFormat};
use crate::tuning::PipelineTuning;
use crate::wav;

/// Everything the worker needs to stand up its encoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInit {
    pub settings: VideoExportSettings,
    /// Concrete encoder name chosen by the prober (e.g. "h264_nvenc").
    pub video_encoder: String,
    pub label: String,
    pub stream_mode: bool,
    pub chunk_size: usize,
}

/// Outbound protocol, controller -> worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    Init(WorkerInit),
    AddFrame {
        data: Vec<u8>,
        frame_index: u64,
        timestamp_sec: f64,
        total_frames: u64,
    },
    AddAudio {
        channels_data: Vec<Vec<f32>>,
        sample_rate: u32,
        length: usize,
    },
    Finalize,
    Cancel,
}

/// Inbound protocol, worker -> controller. Chunk positions increase
/// monotonically and chunks are emitted in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    Ready,
    Progress(f64),
    FrameProcessed { frame_index: u64 },
    Chunk { bytes: Vec<u8>, position: u64 },
    Complete { data: Option<Vec<u8>> },
    Error(String),
}

/// Bounded in-flight frame counter with single-waiter wakeup. Only the
/// controller submits, so one waiter is the most that ever sleeps here.
pub struct InFlightGate {
    count: Mutex<usize>,
    cv: Condvar,
    max: usize,
}

impl InFlightGate {
    pub fn new(max: usize) -> Self {
        Self {
            count: Mutex::new(0),
            cv: Condvar::new(),
            max: max.max(1),
        }
    }

    /// Block until a slot frees up, polling the cancel flag. Returns false
    /// when cancelled instead of acquiring.
    pub fn acquire(&self, cancel: &CancelToken) -> bool {
        let mut count = self.count.lock();
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            if *count < self.max {
                *count += 1;
                return true;
            }
            self.cv
                .wait_for(&mut count, Duration::from_millis(50));
        }
    }

    pub fn release(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        self.cv.notify_one();
    }

    pub fn in_flight(&self) -> usize {
        *self.count.lock()
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

/// Controller-side handle to the worker. Dropping it tears the worker down.
pub struct EncodeChannel {
    tx: Sender<WorkerRequest>,
    events: Receiver<WorkerEvent>,
    gate: Arc<InFlightGate>,
    worker: Option<thread::JoinHandle<()>>,
    pump: Option<thread::JoinHandle<()>>,
}

const READY_TIMEOUT: Duration = Duration::from_secs(15);

impl EncodeChannel {
    /// Spawn the worker, send `init`, and wait for `ready`.
    pub fn spawn(init: WorkerInit, tuning: &PipelineTuning) -> Result<Self, ExportError> {
        let (tx, rx_req) = unbounded::<WorkerRequest>();
        let (tx_evt, rx_evt_raw) = unbounded::<WorkerEvent>();
        let (tx_fwd, events) = unbounded::<WorkerEvent>();

        let gate = Arc::new(InFlightGate::new(
            tuning.max_in_flight(init.stream_mode),
        ));

        let label = init.label.clone();
        let worker = thread::Builder::new()
            .name(format!("encode-{label}"))
            .spawn(move || worker_main(rx_req, tx_evt))
            .map_err(|e| {
                ExportError::wrap(ErrorCode::EncoderInitFailed, ExportPhase::Preparing, e)
            })?;

        // Ack pump: releases the gate on every frame acknowledgment and
        // forwards the rest of the event stream to the controller.
        let pump_gate = gate.clone();
        let pump = thread::Builder::new()
            .name(format!("encode-ack-{label}"))
            .spawn(move || {
                for event in rx_evt_raw.iter() {
                    if let WorkerEvent::FrameProcessed { .. } = &event {
                        pump_gate.release();
                    }
                    if tx_fwd.send(event).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| {
                ExportError::wrap(ErrorCode::EncoderInitFailed, ExportPhase::Preparing, e)
            })?;

        let channel = Self {
            tx,
            events,
            gate,
            worker: Some(worker),
            pump: Some(pump),
        };

        channel.send(WorkerRequest::Init(init))?;
        match channel.events.recv_timeout(READY_TIMEOUT) {
            Ok(WorkerEvent::Ready) => Ok(channel),
            Ok(WorkerEvent::Error(msg)) => Err(ExportError::new(
                ErrorCode::EncoderInitFailed,
                ExportPhase::Preparing,
                msg,
            )),
            Ok(other) => Err(ExportError::new(
                ErrorCode::EncoderInitFailed,
                ExportPhase::Preparing,
                format!("unexpected event before ready: {other:?}"),
            )),
            Err(_) => Err(ExportError::new(
                ErrorCode::Timeout,
                ExportPhase::Preparing,
                "encoder worker did not become ready",
            )),
        }
    }

    fn send(&self, req: WorkerRequest) -> Result<(), ExportError> {
        self.tx.send(req).map_err(|_| {
            ExportError::new(
                ErrorCode::FrameEncodeFailed,
                ExportPhase::Rendering,
                "encode worker is gone",
            )
        })
    }

    /// Hand a frame to the worker, blocking on backpressure first. The
    /// frame's image buffer moves into the message; the worker drops it
    /// after writing it to the encoder.
    pub fn submit_frame(&self, task: FrameTask, cancel: &CancelToken) -> Result<(), ExportError> {
        if !self.gate.acquire(cancel) {
            return Err(ExportError::cancelled(ExportPhase::Rendering));
        }
        let result = self.send(WorkerRequest::AddFrame {
            data: task.image.into_raw(),
            frame_index: task.frame_index,
            timestamp_sec: task.timestamp_sec,
            total_frames: task.total_frames,
        });
        if result.is_err() {
            self.gate.release();
        }
        result
    }

    pub fn submit_audio(&self, pcm: &PcmBuffer) -> Result<(), ExportError> {
        let planes = pcm.to_planar();
        let length = planes.first().map(|p| p.len()).unwrap_or(0);
        self.send(WorkerRequest::AddAudio {
            channels_data: planes,
            sample_rate: pcm.sample_rate,
            length,
        })
    }

    pub fn finalize(&self) -> Result<(), ExportError> {
        self.send(WorkerRequest::Finalize)
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(WorkerRequest::Cancel);
    }

    pub fn events(&self) -> &Receiver<WorkerEvent> {
        &self.events
    }

    pub fn in_flight(&self) -> usize {
        self.gate.in_flight()
    }
}

impl Drop for EncodeChannel {
    fn drop(&mut self) {
        // Best-effort teardown on every exit path; a worker mid-encode sees
        // the cancel as soon as it drains the queue.
        let _ = self.tx.send(WorkerRequest::Cancel);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.pump.take() {
            let _ = handle.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Worker side
// ---------------------------------------------------------------------------

struct WorkerEncoder {
    init: WorkerInit,
    scratch: tempfile::TempDir,
    child: Child,
    video_path: PathBuf,
    audio_path: Option<PathBuf>,
    ffmpeg: PathBuf,
}

fn worker_main(rx: Receiver<WorkerRequest>, tx: Sender<WorkerEvent>) {
    let mut encoder: Option<WorkerEncoder> = None;

    let fail = |tx: &Sender<WorkerEvent>, msg: String| {
        warn!("encode worker failed: {msg}");
        let _ = tx.send(WorkerEvent::Error(msg));
    };

    for req in rx.iter() {
        match req {
            WorkerRequest::Init(init) => match WorkerEncoder::start(init) {
                Ok(enc) => {
                    encoder = Some(enc);
                    let _ = tx.send(WorkerEvent::Ready);
                }
                Err(msg) => {
                    fail(&tx, msg);
                    return;
                }
            },
            WorkerRequest::AddFrame {
                data, frame_index, ..
            } => {
                let Some(enc) = encoder.as_mut() else {
                    fail(&tx, "frame before init".to_string());
                    return;
                };
                if let Err(msg) = enc.write_frame(&data) {
                    fail(&tx, msg);
                    return;
                }
                // `data` dropped here: the worker is the last owner.
                let _ = tx.send(WorkerEvent::FrameProcessed { frame_index });
            }
            WorkerRequest::AddAudio {
                channels_data,
                sample_rate,
                ..
            } => {
                let Some(enc) = encoder.as_mut() else {
                    fail(&tx, "audio before init".to_string());
                    return;
                };
                match enc.write_audio(&channels_data, sample_rate) {
                    Ok(()) => {
                        let _ = tx.send(WorkerEvent::Progress(1.0));
                    }
                    Err(msg) => {
                        fail(&tx, msg);
                        return;
                    }
                }
            }
            WorkerRequest::Finalize => {
                let Some(enc) = encoder.take() else {
                    fail(&tx, "finalize before init".to_string());
                    return;
                };
                match enc.finalize(&tx) {
                    Ok(data) => {
                        let _ = tx.send(WorkerEvent::Complete { data });
                    }
                    Err(msg) => fail(&tx, msg),
                }
                return;
            }
            WorkerRequest::Cancel => {
                if let Some(mut enc) = encoder.take() {
                    enc.kill();
                }
                debug!("encode worker cancelled");
                return;
            }
        }
    }
    // Controller dropped the channel; treat as cancel.
    if let Some(mut enc) = encoder.take() {
        enc.kill();
    }
}

impl WorkerEncoder {
    fn start(init: WorkerInit) -> Result<Self, String> {
        let ffmpeg = media_io::ffmpeg_path().map_err(|e| e.to_string())?;
        let scratch = tempfile::tempdir().map_err(|e| format!("scratch dir: {e}"))?;
        let s = &init.settings;
        let video_path = scratch
            .path()
            .join(format!("video-only.{}", s.format.extension()));

        let mut cmd = Command::new(&ffmpeg);
        cmd.arg("-y")
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg("rgba")
            .arg("-s")
            .arg(format!("{}x{}", s.width, s.height))
            .arg("-r")
            .arg(format!("{}", s.frame_rate))
            .arg("-i")
            .arg("-");
        for arg in video_encode_args(s, &init.video_encoder) {
            cmd.arg(arg);
        }
        cmd.arg(&video_path);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let child = cmd
            .spawn()
            .map_err(|e| format!("ffmpeg spawn failed: {e}"))?;

        debug!(label = %init.label, encoder = %init.video_encoder, "worker encoder started");
        Ok(Self {
            init,
            scratch,
            child,
            video_path,
            audio_path: None,
            ffmpeg,
        })
    }

    fn write_frame(&mut self, data: &[u8]) -> Result<(), String> {
        let s = &self.init.settings;
        let expected = s.width as usize * s.height as usize * 4;
        if data.len() != expected {
            return Err(format!(
                "frame size mismatch: got {} bytes, expected {expected}",
                data.len()
            ));
        }
        let stdin = self
            .child
            .stdin
            .as_mut()
            .ok_or_else(|| "encoder stdin closed".to_string())?;
        stdin
            .write_all(data)
            .map_err(|e| format!("encoder rejected frame: {e}"))
    }

    fn write_audio(&mut self, planes: &[Vec<f32>], sample_rate: u32) -> Result<(), String> {
        let pcm = PcmBuffer::from_planar(planes, sample_rate);
        let bytes = wav::encode_wav(&pcm, self.init.settings.audio.bit_depth)
            .map_err(|e| e.to_string())?;
        let path = self.scratch.path().join("audio.wav");
        std::fs::write(&path, bytes).map_err(|e| format!("audio scratch write: {e}"))?;
        self.audio_path = Some(path);
        Ok(())
    }

    /// Close the video pass, run the mux pass, and stream or buffer the
    /// container bytes.
    fn finalize(mut self, tx: &Sender<WorkerEvent>) -> Result<Option<Vec<u8>>, String> {
        // EOF to the encoder, then wait for it to flush the video track.
        drop(self.child.stdin.take());
        let status = self
            .child
            .wait()
            .map_err(|e| format!("encoder wait failed: {e}"))?;
        if !status.success() {
            return Err(format!("video encode failed: {status:?}"));
        }

        let s = &self.init.settings;
        let out_path = self
            .scratch
            .path()
            .join(format!("out.{}", s.format.extension()));

        if let Some(audio) = &self.audio_path {
            let mut cmd = Command::new(&self.ffmpeg);
            cmd.arg("-y")
                .arg("-i")
                .arg(&self.video_path)
                .arg("-i")
                .arg(audio)
                .arg("-c:v")
                .arg("copy")
                .arg("-c:a")
                .arg(s.audio.format.codec().encoder_name())
                .arg("-b:a")
                .arg(format!("{}", s.audio.bitrate))
                .arg("-shortest");
            if matches!(s.format, VideoFormat::Mp4 | VideoFormat::Mov) {
                cmd.arg("-movflags").arg("+faststart");
            }
            cmd.arg(&out_path)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped());
            let out = cmd.output().map_err(|e| format!("mux spawn failed: {e}"))?;
            if !out.status.success() {
                return Err(format!(
                    "mux failed: {}",
                    String::from_utf8_lossy(&out.stderr)
                ));
            }
        } else {
            std::fs::rename(&self.video_path, &out_path)
                .map_err(|e| format!("finalize rename: {e}"))?;
        }

        if self.init.stream_mode {
            stream_chunks(&out_path, self.init.chunk_size.max(1), tx)?;
            Ok(None)
        } else {
            std::fs::read(&out_path)
                .map(Some)
                .map_err(|e| format!("read output: {e}"))
        }
    }

    fn kill(&mut self) {
        drop(self.child.stdin.take());
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Emit the finished container as ordered, positioned chunks. Reads at most
/// one chunk at a time so stream mode never holds the whole file in memory.
fn stream_chunks(
    path: &Path,
    chunk_size: usize,
    tx: &Sender<WorkerEvent>,
) -> Result<u64, String> {
    let file = std::fs::File::open(path).map_err(|e| format!("open output: {e}"))?;
    let mut reader = BufReader::new(file);
    let mut buf = vec![0u8; chunk_size];
    let mut position = 0u64;
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|e| format!("read output: {e}"))?;
        if n == 0 {
            return Ok(position);
        }
        let _ = tx.send(WorkerEvent::Chunk {
            bytes: buf[..n].to_vec(),
            position,
        });
        position += n as u64;
    }
}

/// Encoder arguments for the video-only pass.
fn video_encode_args(s: &VideoExportSettings, encoder: &str) -> Vec<String> {
    let mut args = vec![
        "-c:v".to_string(),
        encoder.to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-g".to_string(),
        s.keyframe_interval.to_string(),
        "-an".to_string(),
    ];
    match s.bitrate_mode {
        BitrateMode::Cbr => {
            args.push("-b:v".to_string());
            args.push(s.bitrate.to_string());
            args.push("-minrate".to_string());
            args.push(s.bitrate.to_string());
            args.push("-maxrate".to_string());
            args.push(s.bitrate.to_string());
            args.push("-bufsize".to_string());
            args.push((s.bitrate * 2).to_string());
        }
        BitrateMode::Vbr => {
            args.push("-b:v".to_string());
            args.push(s.bitrate.to_string());
            if encoder.starts_with("lib") {
                // quality 0..=100 onto the 51..=0 crf scale
                let crf = 51 - (s.quality.min(100) as u32 * 51 / 100);
                args.push("-crf".to_string());
                args.push(crf.to_string());
            }
        }
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::PartialVideoSettings;
    use std::time::Instant;

    #[test]
    fn gate_blocks_at_capacity_and_wakes_on_release() {
        let gate = Arc::new(InFlightGate::new(2));
        let cancel = CancelToken::new();
        assert!(gate.acquire(&cancel));
        assert!(gate.acquire(&cancel));
        assert_eq!(gate.in_flight(), 2);

        let g = gate.clone();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            g.release();
        });

        let start = Instant::now();
        assert!(gate.acquire(&cancel));
        assert!(start.elapsed() >= Duration::from_millis(80));
        assert_eq!(gate.in_flight(), 2);
        releaser.join().unwrap();
    }

    #[test]
    fn gate_never_exceeds_max() {
        let gate = InFlightGate::new(3);
        let cancel = CancelToken::new();
        for _ in 0..3 {
            assert!(gate.acquire(&cancel));
        }
        assert_eq!(gate.in_flight(), gate.max());
        gate.release();
        assert!(gate.in_flight() < gate.max());
    }

    #[test]
    fn cancelled_acquire_returns_false() {
        let gate = Arc::new(InFlightGate::new(1));
        let cancel = CancelToken::new();
        assert!(gate.acquire(&cancel));

        let c = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(80));
            c.cancel();
        });
        // Gate is full; only cancellation can get us out.
        assert!(!gate.acquire(&cancel));
        canceller.join().unwrap();
    }

    #[test]
    fn protocol_messages_are_tagged() {
        let msg = WorkerRequest::Finalize;
        assert_eq!(serde_json::to_string(&msg).unwrap(), r#"{"type":"finalize"}"#);

        let evt = WorkerEvent::Chunk {
            bytes: vec![1, 2],
            position: 512,
        };
        let json = serde_json::to_string(&evt).unwrap();
        assert!(json.contains(r#""type":"chunk""#));
        assert!(json.contains(r#""position":512"#));
    }

    #[test]
    fn chunks_are_contiguous_and_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &payload).unwrap();

        let (tx, rx) = unbounded();
        let total = stream_chunks(&path, 256, &tx).unwrap();
        drop(tx);
        assert_eq!(total, 1000);

        let mut reassembled = Vec::new();
        let mut expected_position = 0u64;
        for event in rx.iter() {
            let WorkerEvent::Chunk { bytes, position } = event else {
                panic!("unexpected event");
            };
            assert_eq!(position, expected_position);
            assert!(bytes.len() <= 256);
            expected_position += bytes.len() as u64;
            reassembled.extend_from_slice(&bytes);
        }
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn vbr_args_map_quality_to_crf() {
        let s = PartialVideoSettings {
            quality: Some(100),
            ..Default::default()
        }
        .merged();
        let args = video_encode_args(&s, "libx264");
        let crf_pos = args.iter().position(|a| a == "-crf").unwrap();
        assert_eq!(args[crf_pos + 1], "0");
    }

    #[test]
    fn cbr_args_pin_min_and_max_rate() {
        let mut s = PartialVideoSettings::default().merged();
        s.bitrate_mode = BitrateMode::Cbr;
        let args = video_encode_args(&s, "h264_nvenc");
        assert!(args.contains(&"-minrate".to_string()));
        assert!(args.contains(&"-maxrate".to_string()));
        assert!(!args.contains(&"-crf".to_string()));
    }
}
