//! Software fallback: a batch encode path used when no native encoder exists
//! for the chosen codec. Frames are staged as numbered PNGs in a scratch
//! directory, audio as a WAV, and a single external encode job assembles the
//! container. Progress comes back through a polled mailbox, never a callback
//! into the job thread.

use std::ffi::OsString;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{io_error_code, ErrorCode, ExportError};
use crate::frame::{FrameTask, PcmBuffer};
use crate::progress::{CancelToken, ExportPhase};
use crate::settings::{BitrateMode, VideoExportSettings, VideoFormat};
use crate::tuning::PipelineTuning;
use crate::wav;

/// Progress bands for the batch path's tail. The frame loop reports plain
/// per-frame fractions; the polled encode job and the container readback map
/// into these slices of the overall run.
pub const ENCODE_BAND: (f64, f64) = (0.70, 0.95);
pub const FINISH_BAND: (f64, f64) = (0.95, 1.0);

/// Map a 0..=1 fraction of one stage into its band of the overall run.
pub fn banded(band: (f64, f64), fraction: f64) -> f64 {
    let f = fraction.clamp(0.0, 1.0);
    band.0 + (band.1 - band.0) * f
}

/// Video speed as a presentation-timestamp rescale. Identity speed needs no
/// filter.
pub fn video_speed_filter(speed: f64) -> Option<String> {
    if (speed - 1.0).abs() < f64::EPSILON || speed <= 0.0 {
        None
    } else {
        Some(format!("setpts=PTS/{speed}"))
    }
}

/// Audio speed via atempo, which only accepts 0.5..=2.0; out-of-range speeds
/// are clamped rather than chained.
pub fn audio_speed_filter(speed: f64) -> Option<String> {
    if (speed - 1.0).abs() < f64::EPSILON || speed <= 0.0 {
        None
    } else {
        Some(format!("atempo={}", speed.clamp(0.5, 2.0)))
    }
}

/// Shared mailbox the encode job publishes into and the controller polls.
#[derive(Default)]
pub struct ProgressCell {
    inner: Mutex<ProgressCellState>,
}

#[derive(Default)]
struct ProgressCellState {
    out_time_sec: f64,
    done: bool,
    error: Option<String>,
}

impl ProgressCell {
    pub fn publish_time(&self, out_time_sec: f64) {
        let mut state = self.inner.lock();
        if out_time_sec > state.out_time_sec {
            state.out_time_sec = out_time_sec;
        }
    }

    pub fn finish(&self, error: Option<String>) {
        let mut state = self.inner.lock();
        state.done = true;
        state.error = error;
    }

    /// (seconds encoded so far, finished, failure message if any)
    pub fn snapshot(&self) -> (f64, bool, Option<String>) {
        let state = self.inner.lock();
        (state.out_time_sec, state.done, state.error.clone())
    }
}

/// Parse one `key=value` line of the encode job's machine-readable progress
/// stream. Returns encoded seconds for time lines, and signals completion on
/// the final status line.
pub fn parse_progress_line(line: &str) -> ProgressLine {
    if let Some(value) = line.strip_prefix("out_time_ms=") {
        // Despite the name this field is in microseconds.
        if let Ok(us) = value.trim().parse::<i64>() {
            return ProgressLine::Time(us.max(0) as f64 / 1_000_000.0);
        }
    } else if let Some(value) = line.strip_prefix("progress=") {
        if value.trim() == "end" {
            return ProgressLine::End;
        }
    }
    ProgressLine::Other
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressLine {
    Time(f64),
    End,
    Other,
}

/// Batch encoder: stage everything to scratch, then run one encode job. Two
/// input modes: numbered frames staged by the render loop, or a single source
/// file re-encoded directly (the single-clip path where only resolution or
/// speed differ from the source).
pub struct BatchEncoder {
    settings: VideoExportSettings,
    scratch: tempfile::TempDir,
    frames_dir: PathBuf,
    frame_count: u64,
    audio_path: Option<PathBuf>,
    source: Option<PathBuf>,
    source_duration_sec: f64,
    speed: f64,
}

impl BatchEncoder {
    pub fn new(settings: VideoExportSettings) -> Result<Self, ExportError> {
        let scratch = tempfile::tempdir().map_err(|e| {
            ExportError::wrap(io_error_code(&e), ExportPhase::Preparing, e)
        })?;
        let frames_dir = scratch.path().join("frames");
        std::fs::create_dir(&frames_dir).map_err(|e| {
            ExportError::wrap(io_error_code(&e), ExportPhase::Preparing, e)
        })?;
        Ok(Self {
            settings,
            scratch,
            frames_dir,
            frame_count: 0,
            audio_path: None,
            source: None,
            source_duration_sec: 0.0,
            speed: 1.0,
        })
    }

    /// Re-encode a source file instead of staged frames.
    pub fn with_source(
        settings: VideoExportSettings,
        source: &Path,
        duration_sec: f64,
        speed: f64,
    ) -> Result<Self, ExportError> {
        let mut enc = Self::new(settings)?;
        enc.source = Some(source.to_path_buf());
        enc.source_duration_sec = duration_sec;
        enc.speed = speed;
        Ok(enc)
    }

    /// Apply a uniform playback-speed adjustment to the assembled output.
    pub fn set_speed(&mut self, speed: f64) {
        self.speed = speed;
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Stage one frame. Frames must arrive in presentation order; the file
    /// name carries the sequence number the pattern input relies on.
    pub fn add_frame(&mut self, task: &FrameTask) -> Result<(), ExportError> {
        let path = self
            .frames_dir
            .join(format!("frame_{:06}.png", self.frame_count));
        task.image.save(&path).map_err(|e| {
            ExportError::wrap(ErrorCode::FrameEncodeFailed, ExportPhase::Rendering, e)
        })?;
        self.frame_count += 1;
        Ok(())
    }

    pub fn add_audio(&mut self, pcm: &PcmBuffer) -> Result<(), ExportError> {
        let bytes = wav::encode_wav(pcm, self.settings.audio.bit_depth)?;
        let path = self.scratch.path().join("audio.wav");
        std::fs::write(&path, bytes).map_err(|e| {
            ExportError::wrap(io_error_code(&e), ExportPhase::Encoding, e)
        })?;
        self.audio_path = Some(path);
        Ok(())
    }

    fn encode_args(&self, output: &Path) -> Vec<OsString> {
        let s = &self.settings;
        let mut args: Vec<OsString> = vec!["-y".into()];
        if let Some(source) = &self.source {
            args.push("-i".into());
            args.push(source.clone().into());
            args.push("-s".into());
            args.push(format!("{}x{}", s.width, s.height).into());
            args.push("-r".into());
            args.push(format!("{}", s.frame_rate).into());
        } else {
            args.push("-framerate".into());
            args.push(format!("{}", s.frame_rate).into());
            args.push("-i".into());
            args.push(self.frames_dir.join("frame_%06d.png").into());
        }
        if let Some(audio) = &self.audio_path {
            args.push("-i".into());
            args.push(audio.clone().into());
        }
        let encoder = s
            .codec
            .software_encoders()
            .first()
            .copied()
            .unwrap_or("libx264");
        args.push("-c:v".into());
        args.push(encoder.into());
        args.push("-pix_fmt".into());
        args.push("yuv420p".into());
        args.push("-g".into());
        args.push(s.keyframe_interval.to_string().into());
        match s.bitrate_mode {
            BitrateMode::Cbr => {
                for (k, v) in [
                    ("-b:v", s.bitrate),
                    ("-minrate", s.bitrate),
                    ("-maxrate", s.bitrate),
                    ("-bufsize", s.bitrate * 2),
                ] {
                    args.push(k.into());
                    args.push(v.to_string().into());
                }
            }
            BitrateMode::Vbr => {
                args.push("-b:v".into());
                args.push(s.bitrate.to_string().into());
            }
        }
        if let Some(vf) = video_speed_filter(self.speed) {
            args.push("-vf".into());
            args.push(vf.into());
        }
        if self.audio_path.is_some() || self.source.is_some() {
            args.push("-c:a".into());
            args.push(s.audio.format.codec().encoder_name().into());
            args.push("-b:a".into());
            args.push(s.audio.bitrate.to_string().into());
            if let Some(af) = audio_speed_filter(self.speed) {
                args.push("-af".into());
                args.push(af.into());
            }
            args.push("-shortest".into());
        }
        if matches!(s.format, VideoFormat::Mp4 | VideoFormat::Mov) {
            args.push("-movflags".into());
            args.push("+faststart".into());
        }
        args.push("-progress".into());
        args.push("pipe:2".into());
        args.push("-nostats".into());
        args.push(output.into());
        args
    }

    /// Run the encode job and poll its mailbox until it finishes, reporting
    /// the encode band's fraction through `on_progress`. Returns the
    /// container bytes.
    pub fn encode(
        self,
        cancel: &CancelToken,
        tuning: &PipelineTuning,
        mut on_progress: impl FnMut(f64),
    ) -> Result<Vec<u8>, ExportError> {
        if self.frame_count == 0 && self.source.is_none() {
            return Err(ExportError::new(
                ErrorCode::MuxerError,
                ExportPhase::Encoding,
                "no frames staged",
            ));
        }
        let ffmpeg = media_io::ffmpeg_path()?;
        let output = self
            .scratch
            .path()
            .join(format!("out.{}", self.settings.format.extension()));
        let duration_sec = if self.source.is_some() {
            self.source_duration_sec / self.speed
        } else {
            self.frame_count as f64 / self.settings.frame_rate / self.speed
        };

        let mut child = Command::new(&ffmpeg)
            .args(self.encode_args(&output))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                ExportError::wrap(ErrorCode::EncoderInitFailed, ExportPhase::Encoding, e)
            })?;

        let cell = Arc::new(ProgressCell::default());
        let stderr = child.stderr.take();
        let reader_cell = cell.clone();
        let reader = thread::spawn(move || {
            let Some(stderr) = stderr else { return };
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                if let ProgressLine::Time(sec) = parse_progress_line(&line) {
                    reader_cell.publish_time(sec);
                }
            }
            debug!("encode job stderr drained");
        });

        let poll = Duration::from_millis(tuning.poll_interval_ms.max(1));
        let status = loop {
            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                let _ = reader.join();
                return Err(ExportError::cancelled(ExportPhase::Encoding));
            }
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    let (sec, _, _) = cell.snapshot();
                    if duration_sec > 0.0 {
                        on_progress((sec / duration_sec).min(1.0));
                    }
                    thread::sleep(poll);
                }
                Err(e) => {
                    let _ = reader.join();
                    return Err(ExportError::wrap(
                        ErrorCode::MuxerError,
                        ExportPhase::Encoding,
                        e,
                    ));
                }
            }
        };
        let _ = reader.join();
        cell.finish(None);

        if !status.success() {
            warn!("batch encode job exited with {status:?}");
            return Err(ExportError::new(
                ErrorCode::MuxerError,
                ExportPhase::Encoding,
                format!("encode job failed: {status:?}"),
            ));
        }
        on_progress(1.0);
        std::fs::read(&output)
            .map_err(|e| ExportError::wrap(io_error_code(&e), ExportPhase::Muxing, e))
    }
}

/// Container remux for the untouched-source path: no re-encode, just a copy
/// of every stream into a fresh container with the index up front.
pub fn stream_copy_args(input: &Path, output: &Path, format: VideoFormat) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-y".into(),
        "-i".into(),
        input.into(),
        "-c".into(),
        "copy".into(),
    ];
    if matches!(format, VideoFormat::Mp4 | VideoFormat::Mov) {
        args.push("-movflags".into());
        args.push("+faststart".into());
    }
    args.push(output.into());
    args
}

pub fn stream_copy(
    input: &Path,
    format: VideoFormat,
    cancel: &CancelToken,
) -> Result<Vec<u8>, ExportError> {
    if cancel.is_cancelled() {
        return Err(ExportError::cancelled(ExportPhase::Muxing));
    }
    let ffmpeg = media_io::ffmpeg_path()?;
    let scratch = tempfile::tempdir()
        .map_err(|e| ExportError::wrap(io_error_code(&e), ExportPhase::Muxing, e))?;
    let output = scratch.path().join(format!("out.{}", format.extension()));

    let result = Command::new(&ffmpeg)
        .args(stream_copy_args(input, &output, format))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| ExportError::wrap(ErrorCode::MuxerError, ExportPhase::Muxing, e))?;
    if !result.status.success() {
        return Err(ExportError::new(
            ErrorCode::MuxerError,
            ExportPhase::Muxing,
            format!("remux failed: {}", String::from_utf8_lossy(&result.stderr)),
        ));
    }
    std::fs::read(&output)
        .map_err(|e| ExportError::wrap(io_error_code(&e), ExportPhase::Muxing, e))
}
