//! The export controller: one caller-owned context per run, no global state.
//! Owns the render loop, strategy selection, progress emission, and teardown;
//! the encoder lives behind the worker channel or the batch fallback.

use std::path::Path;
use std::time::Instant;

use image::RgbaImage;
use timeline::{ClipKind, Sequence};
use tracing::{debug, info, warn};
use uuid::Uuid;

use media_io::{Acceleration, CapabilityProber, MediaInfo};

use crate::error::{io_error_code, ErrorCode, ExportError};
use crate::fallback::{self, BatchEncoder, ENCODE_BAND, FINISH_BAND};
use crate::frame::{upscale, AudioMixdown, FrameRenderer, FrameTask, PcmBuffer};
use crate::progress::{
    CancelToken, ExportOutput, ExportPhase, ExportProgress, ExportResult, ExportStats,
    ProgressEmitter,
};
use crate::settings::{
    AudioExportSettings, AudioFormat, ExportSettings, ImageFormat, NormalizedVideoSettings,
    VideoExportSettings,
};
use crate::sink::OutputTarget;
use crate::tuning::PipelineTuning;
use crate::wav;
use crate::worker::{EncodeChannel, WorkerEvent, WorkerInit};

/// How the encoded bytes get produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeBackend {
    /// Remux the single source clip without re-encoding.
    StreamCopy,
    /// Frame-by-frame submission to the worker encode channel.
    Worker,
    /// Batch fallback: stage frames to scratch, one external encode job.
    Fallback,
}

/// All five conditions for the no-re-encode remux. Every guard is checked;
/// flipping any one forces a re-encode.
pub fn stream_copy_eligible(
    sequence: &Sequence,
    settings: &VideoExportSettings,
    source: &MediaInfo,
) -> bool {
    let Some(clip) = sequence.single_clip() else {
        return false;
    };
    let ClipKind::Video {
        in_offset_sec,
        speed,
        ..
    } = &clip.kind
    else {
        return false;
    };
    if *speed != 1.0 {
        return false;
    }
    if clip.start_sec != 0.0 || *in_offset_sec != 0.0 {
        return false;
    }
    if clip.has_effects() || !clip.has_identity_transform() {
        return false;
    }
    source.resolution() == Some((settings.width, settings.height))
}

/// Strategy order once the stream-copy probe has been ruled out: the batch
/// route when nothing native can encode, the worker when a streaming sink is
/// requested or a hardware tier exists, else batch.
pub fn select_backend(normalized: &NormalizedVideoSettings, streaming: bool) -> EncodeBackend {
    if normalized.needs_fallback {
        EncodeBackend::Fallback
    } else if streaming || normalized.acceleration == Acceleration::Hardware {
        EncodeBackend::Worker
    } else {
        EncodeBackend::Fallback
    }
}

/// Frame count for a duration at a rate; a partial trailing frame still
/// renders.
pub fn total_frame_count(duration_sec: f64, frame_rate: f64) -> u64 {
    (duration_sec * frame_rate).ceil() as u64
}

struct InnerRun {
    frames: u64,
    bytes_written: u64,
}

pub struct ExportPipeline {
    renderer: Box<dyn FrameRenderer>,
    mixdown: Box<dyn AudioMixdown>,
    prober: Box<dyn CapabilityProber>,
    tuning: PipelineTuning,
    forced_backend: Option<EncodeBackend>,
    run_id: Uuid,
}

impl ExportPipeline {
    pub fn new(
        renderer: Box<dyn FrameRenderer>,
        mixdown: Box<dyn AudioMixdown>,
        prober: Box<dyn CapabilityProber>,
    ) -> Self {
        Self {
            renderer,
            mixdown,
            prober,
            tuning: PipelineTuning::default(),
            forced_backend: None,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn with_tuning(mut self, tuning: PipelineTuning) -> Self {
        self.tuning = tuning;
        self
    }

    /// Pin the backend instead of letting strategy selection choose. There is
    /// no mid-run swap; a pinned backend that fails fails the run.
    pub fn force_backend(mut self, backend: EncodeBackend) -> Self {
        self.forced_backend = Some(backend);
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Run one export to completion. The target is closed on success and
    /// aborted on every failure path, including cancellation.
    pub fn run(
        &mut self,
        sequence: &Sequence,
        settings: &ExportSettings,
        mut target: OutputTarget,
        cancel: &CancelToken,
        emitter: &mut ProgressEmitter,
    ) -> ExportResult {
        let started = Instant::now();
        info!(run_id = %self.run_id, sequence = %sequence.name, "export started");

        match self.run_inner(sequence, settings, &mut target, cancel, emitter, started) {
            Ok(run) => {
                let data = target.finish().map_err(|e| {
                    ExportError::wrap(io_error_code(&e), ExportPhase::Muxing, e)
                })?;
                let elapsed = started.elapsed().as_secs_f64();
                let output_bytes = run
                    .bytes_written
                    .max(data.as_ref().map(|d| d.len() as u64).unwrap_or(0));
                let stats = ExportStats {
                    elapsed_seconds: elapsed,
                    frames_rendered: run.frames,
                    encode_fps: if elapsed > 0.0 {
                        run.frames as f64 / elapsed
                    } else {
                        0.0
                    },
                    output_bytes,
                    average_bitrate: if elapsed > 0.0 {
                        ((output_bytes * 8) as f64 / elapsed) as u64
                    } else {
                        0
                    },
                };
                emitter.emit(tick(
                    ExportPhase::Complete,
                    1.0,
                    run.frames,
                    run.frames,
                    output_bytes,
                ));
                info!(
                    run_id = %self.run_id,
                    frames = run.frames,
                    bytes = output_bytes,
                    elapsed_sec = elapsed,
                    "export finished"
                );
                Ok(ExportOutput { data, stats })
            }
            Err(e) => {
                target.abort();
                if e.code == ErrorCode::Cancelled {
                    info!(run_id = %self.run_id, "export cancelled");
                } else {
                    warn!(run_id = %self.run_id, code = ?e.code, "export failed: {}", e.message);
                }
                Err(e)
            }
        }
    }

    fn run_inner(
        &mut self,
        sequence: &Sequence,
        settings: &ExportSettings,
        target: &mut OutputTarget,
        cancel: &CancelToken,
        emitter: &mut ProgressEmitter,
        started: Instant,
    ) -> Result<InnerRun, ExportError> {
        if cancel.is_cancelled() {
            return Err(ExportError::cancelled(ExportPhase::Preparing));
        }
        emitter.emit(tick(ExportPhase::Preparing, 0.0, 0, 0, 0));

        match settings {
            ExportSettings::Video(partial) => {
                let normalized =
                    crate::settings::normalize(partial, self.prober.as_ref(), &self.tuning)?;
                let duration = nonempty_duration(sequence)?;
                let total_frames = total_frame_count(duration, normalized.settings.frame_rate);
                let backend = self.choose_backend(sequence, &normalized, target.is_streaming());
                debug!(
                    run_id = %self.run_id,
                    ?backend,
                    total_frames,
                    codec = ?normalized.settings.codec,
                    substituted = normalized.substituted,
                    "strategy selected"
                );
                match backend {
                    EncodeBackend::StreamCopy => {
                        self.run_stream_copy(sequence, &normalized.settings, target, cancel, emitter)
                    }
                    EncodeBackend::Worker => self.run_worker(
                        sequence,
                        &normalized,
                        duration,
                        total_frames,
                        target,
                        cancel,
                        emitter,
                        started,
                    ),
                    EncodeBackend::Fallback => self.run_fallback(
                        sequence,
                        &normalized.settings,
                        duration,
                        total_frames,
                        target,
                        cancel,
                        emitter,
                        started,
                    ),
                }
            }
            ExportSettings::Audio(audio) => {
                self.run_audio(sequence, audio, target, cancel, emitter)
            }
            ExportSettings::Image(img) => self.run_image(sequence, img, target, cancel, emitter),
            ExportSettings::Sequence(seq_settings) => {
                self.run_image_sequence(sequence, seq_settings, cancel, emitter, started)
            }
        }
    }

    fn choose_backend(
        &self,
        sequence: &Sequence,
        normalized: &NormalizedVideoSettings,
        streaming: bool,
    ) -> EncodeBackend {
        if let Some(backend) = self.forced_backend {
            return backend;
        }
        if let Some(clip) = sequence.single_clip() {
            if let Some(src) = clip.source_path() {
                if let Ok(info) = media_io::probe_media(Path::new(src)) {
                    if stream_copy_eligible(sequence, &normalized.settings, &info) {
                        return EncodeBackend::StreamCopy;
                    }
                }
            }
        }
        select_backend(normalized, streaming)
    }

    fn run_stream_copy(
        &mut self,
        sequence: &Sequence,
        settings: &VideoExportSettings,
        target: &mut OutputTarget,
        cancel: &CancelToken,
        emitter: &mut ProgressEmitter,
    ) -> Result<InnerRun, ExportError> {
        let src = sequence
            .single_clip()
            .and_then(|c| c.source_path())
            .ok_or_else(|| {
                ExportError::new(
                    ErrorCode::MuxerError,
                    ExportPhase::Muxing,
                    "stream copy requires a single source clip",
                )
            })?;
        emitter.emit(tick(ExportPhase::Muxing, 0.0, 0, 0, 0));
        let bytes = fallback::stream_copy(Path::new(src), settings.format, cancel)?;
        target
            .write_chunk(0, &bytes)
            .map_err(|e| ExportError::wrap(io_error_code(&e), ExportPhase::Muxing, e))?;
        emitter.emit(tick(ExportPhase::Muxing, 1.0, 0, 0, bytes.len() as u64));
        Ok(InnerRun {
            frames: 0,
            bytes_written: bytes.len() as u64,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn run_worker(
        &mut self,
        sequence: &Sequence,
        normalized: &NormalizedVideoSettings,
        duration: f64,
        total_frames: u64,
        target: &mut OutputTarget,
        cancel: &CancelToken,
        emitter: &mut ProgressEmitter,
        started: Instant,
    ) -> Result<InnerRun, ExportError> {
        let s = &normalized.settings;
        let encoder = self.prober.encoder_name(s.codec).ok_or_else(|| {
            ExportError::new(
                ErrorCode::UnsupportedCodec,
                ExportPhase::Preparing,
                format!("no encoder for {:?}", s.codec),
            )
        })?;
        let channel = EncodeChannel::spawn(
            WorkerInit {
                settings: s.clone(),
                video_encoder: encoder.to_string(),
                label: self.run_id.to_string(),
                stream_mode: target.is_streaming(),
                chunk_size: self.tuning.chunk_size,
            },
            &self.tuning,
        )?;

        let yield_every = self.tuning.yield_interval(s.codec);
        let mut bytes_written = 0u64;

        for frame in 0..total_frames {
            if cancel.is_cancelled() {
                channel.cancel();
                return Err(ExportError::cancelled(ExportPhase::Rendering));
            }
            let timestamp_sec = frame as f64 / s.frame_rate;
            let image = self.render_frame(sequence, timestamp_sec, s)?;
            channel.submit_frame(
                FrameTask {
                    image,
                    frame_index: frame,
                    timestamp_sec,
                    total_frames,
                },
                cancel,
            )?;
            drain_worker_events(&channel, target, &mut bytes_written)?;

            let done = frame + 1;
            let mut update = tick(
                ExportPhase::Rendering,
                done as f64 / total_frames as f64,
                done,
                total_frames,
                bytes_written,
            );
            update.eta_seconds = eta(started, done, total_frames);
            emitter.emit(update);

            if done % yield_every == 0 {
                std::thread::yield_now();
            }
            if done % self.tuning.cache_release_interval == 0 {
                self.renderer.release_caches();
            }
        }

        if let Some(pcm) = self.mix_audio(sequence, duration, &s.audio, cancel)? {
            channel.submit_audio(&pcm)?;
            emitter.emit(tick(
                ExportPhase::Encoding,
                1.0,
                total_frames,
                total_frames,
                bytes_written,
            ));
        }

        if cancel.is_cancelled() {
            channel.cancel();
            return Err(ExportError::cancelled(ExportPhase::Muxing));
        }
        channel.finalize()?;
        emitter.emit(tick(
            ExportPhase::Muxing,
            0.0,
            total_frames,
            total_frames,
            bytes_written,
        ));

        // Drain until the worker reports a terminal event.
        loop {
            if cancel.is_cancelled() {
                channel.cancel();
                return Err(ExportError::cancelled(ExportPhase::Muxing));
            }
            let event = channel
                .events()
                .recv_timeout(std::time::Duration::from_secs(60))
                .map_err(|_| {
                    ExportError::new(
                        ErrorCode::Timeout,
                        ExportPhase::Muxing,
                        "encoder worker stalled during finalize",
                    )
                })?;
            match event {
                WorkerEvent::Chunk { bytes, position } => {
                    target.write_chunk(position, &bytes).map_err(|e| {
                        ExportError::wrap(io_error_code(&e), ExportPhase::Muxing, e)
                    })?;
                    bytes_written = bytes_written.max(position + bytes.len() as u64);
                }
                WorkerEvent::Complete { data } => {
                    if let Some(data) = data {
                        target.write_chunk(0, &data).map_err(|e| {
                            ExportError::wrap(io_error_code(&e), ExportPhase::Muxing, e)
                        })?;
                        bytes_written = data.len() as u64;
                    }
                    break;
                }
                WorkerEvent::Error(msg) => {
                    return Err(ExportError::new(
                        ErrorCode::MuxerError,
                        ExportPhase::Muxing,
                        msg,
                    ));
                }
                WorkerEvent::Progress(_) | WorkerEvent::FrameProcessed { .. } => {}
                WorkerEvent::Ready => {}
            }
        }

        Ok(InnerRun {
            frames: total_frames,
            bytes_written,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn run_fallback(
        &mut self,
        sequence: &Sequence,
        settings: &VideoExportSettings,
        duration: f64,
        total_frames: u64,
        target: &mut OutputTarget,
        cancel: &CancelToken,
        emitter: &mut ProgressEmitter,
        started: Instant,
    ) -> Result<InnerRun, ExportError> {
        // Single untouched clip that only differs in resolution or speed:
        // re-encode straight from the source, no frame staging.
        let direct = sequence.single_clip().and_then(|clip| match &clip.kind {
            ClipKind::Video {
                src,
                in_offset_sec,
                speed,
            } if clip.start_sec == 0.0
                && *in_offset_sec == 0.0
                && !clip.has_effects()
                && clip.has_identity_transform() =>
            {
                Some((src.clone(), *speed))
            }
            _ => None,
        });

        let encoder = if let Some((src, speed)) = direct {
            debug!(run_id = %self.run_id, source = %src, speed, "direct source re-encode");
            BatchEncoder::with_source(settings.clone(), Path::new(&src), duration, speed)?
        } else {
            let mut enc = BatchEncoder::new(settings.clone())?;
            let yield_every = self.tuning.yield_interval(settings.codec);
            for frame in 0..total_frames {
                if cancel.is_cancelled() {
                    return Err(ExportError::cancelled(ExportPhase::Rendering));
                }
                let timestamp_sec = frame as f64 / settings.frame_rate;
                let image = self.render_frame(sequence, timestamp_sec, settings)?;
                enc.add_frame(&FrameTask {
                    image,
                    frame_index: frame,
                    timestamp_sec,
                    total_frames,
                })?;

                let done = frame + 1;
                let mut update = tick(
                    ExportPhase::Rendering,
                    done as f64 / total_frames as f64,
                    done,
                    total_frames,
                    0,
                );
                update.eta_seconds = eta(started, done, total_frames);
                emitter.emit(update);

                if done % yield_every == 0 {
                    std::thread::yield_now();
                }
                if done % self.tuning.cache_release_interval == 0 {
                    self.renderer.release_caches();
                }
            }
            if let Some(pcm) = self.mix_audio(sequence, duration, &settings.audio, cancel)? {
                enc.add_audio(&pcm)?;
            }
            enc
        };

        emitter.emit(tick(
            ExportPhase::Encoding,
            fallback::banded(ENCODE_BAND, 0.0),
            total_frames,
            total_frames,
            0,
        ));
        let bytes = encoder.encode(cancel, &self.tuning, |fraction| {
            emitter.emit(tick(
                ExportPhase::Encoding,
                fallback::banded(ENCODE_BAND, fraction),
                total_frames,
                total_frames,
                0,
            ));
        })?;

        emitter.emit(tick(
            ExportPhase::Muxing,
            fallback::banded(FINISH_BAND, 0.5),
            total_frames,
            total_frames,
            bytes.len() as u64,
        ));
        target
            .write_chunk(0, &bytes)
            .map_err(|e| ExportError::wrap(io_error_code(&e), ExportPhase::Muxing, e))?;
        Ok(InnerRun {
            frames: total_frames,
            bytes_written: bytes.len() as u64,
        })
    }

    fn run_audio(
        &mut self,
        sequence: &Sequence,
        settings: &AudioExportSettings,
        target: &mut OutputTarget,
        cancel: &CancelToken,
        emitter: &mut ProgressEmitter,
    ) -> Result<InnerRun, ExportError> {
        settings.validate()?;
        let duration = nonempty_duration(sequence)?;
        let pcm = self
            .mixdown
            .mixdown(sequence, 0.0, duration, settings.channels, settings.sample_rate)
            .map_err(|e| {
                ExportError::new(ErrorCode::AudioEncodeFailed, ExportPhase::Encoding, e)
            })?;
        if cancel.is_cancelled() {
            return Err(ExportError::cancelled(ExportPhase::Encoding));
        }
        emitter.emit(tick(ExportPhase::Encoding, 0.5, 0, 0, 0));

        let bytes = match settings.format {
            AudioFormat::Wav => wav::encode_wav(&pcm, settings.bit_depth)?,
            _ => encode_audio_via_ffmpeg(&pcm, settings)?,
        };

        emitter.emit(tick(ExportPhase::Muxing, 1.0, 0, 0, bytes.len() as u64));
        target
            .write_chunk(0, &bytes)
            .map_err(|e| ExportError::wrap(io_error_code(&e), ExportPhase::Muxing, e))?;
        Ok(InnerRun {
            frames: 0,
            bytes_written: bytes.len() as u64,
        })
    }

    fn run_image(
        &mut self,
        sequence: &Sequence,
        settings: &crate::settings::ImageExportSettings,
        target: &mut OutputTarget,
        cancel: &CancelToken,
        emitter: &mut ProgressEmitter,
    ) -> Result<InnerRun, ExportError> {
        if cancel.is_cancelled() {
            return Err(ExportError::cancelled(ExportPhase::Rendering));
        }
        let image = self
            .renderer
            .render(sequence, settings.timestamp_sec, settings.width, settings.height)
            .map_err(|e| {
                ExportError::new(ErrorCode::FrameEncodeFailed, ExportPhase::Rendering, e)
            })?;
        emitter.emit(tick(ExportPhase::Encoding, 0.5, 1, 1, 0));
        let bytes = encode_image(image, settings.format)?;
        target
            .write_chunk(0, &bytes)
            .map_err(|e| ExportError::wrap(io_error_code(&e), ExportPhase::Muxing, e))?;
        Ok(InnerRun {
            frames: 1,
            bytes_written: bytes.len() as u64,
        })
    }

    fn run_image_sequence(
        &mut self,
        sequence: &Sequence,
        settings: &crate::settings::ImageSequenceSettings,
        cancel: &CancelToken,
        emitter: &mut ProgressEmitter,
        started: Instant,
    ) -> Result<InnerRun, ExportError> {
        let duration = nonempty_duration(sequence)?;
        let total_frames = total_frame_count(duration, settings.frame_rate);
        let ext = match settings.format {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
        };
        std::fs::create_dir_all(&settings.output_dir)
            .map_err(|e| ExportError::wrap(io_error_code(&e), ExportPhase::Preparing, e))?;

        let mut bytes_written = 0u64;
        for frame in 0..total_frames {
            if cancel.is_cancelled() {
                return Err(ExportError::cancelled(ExportPhase::Rendering));
            }
            let timestamp_sec = frame as f64 / settings.frame_rate;
            let image = self
                .renderer
                .render(sequence, timestamp_sec, settings.width, settings.height)
                .map_err(|e| {
                    ExportError::new(ErrorCode::FrameEncodeFailed, ExportPhase::Rendering, e)
                })?;
            let bytes = encode_image(image, settings.format)?;
            let path = settings
                .output_dir
                .join(format!("frame_{frame:06}.{ext}"));
            std::fs::write(&path, &bytes)
                .map_err(|e| ExportError::wrap(io_error_code(&e), ExportPhase::Rendering, e))?;
            bytes_written += bytes.len() as u64;

            let done = frame + 1;
            let mut update = tick(
                ExportPhase::Rendering,
                done as f64 / total_frames as f64,
                done,
                total_frames,
                bytes_written,
            );
            update.eta_seconds = eta(started, done, total_frames);
            emitter.emit(update);
            if done % self.tuning.cache_release_interval == 0 {
                self.renderer.release_caches();
            }
        }
        Ok(InnerRun {
            frames: total_frames,
            bytes_written,
        })
    }

    /// Render one frame, going through the native resolution and a Lanczos
    /// upscale when upscaling is enabled and the target exceeds it.
    fn render_frame(
        &mut self,
        sequence: &Sequence,
        timestamp_sec: f64,
        settings: &VideoExportSettings,
    ) -> Result<RgbaImage, ExportError> {
        let upscaling = settings.upscaling.map(|u| u.enabled).unwrap_or(false);
        let (rw, rh) = if upscaling
            && (sequence.width < settings.width || sequence.height < settings.height)
        {
            (sequence.width, sequence.height)
        } else {
            (settings.width, settings.height)
        };
        let image = self
            .renderer
            .render(sequence, timestamp_sec, rw, rh)
            .map_err(|e| {
                ExportError::new(ErrorCode::FrameEncodeFailed, ExportPhase::Rendering, e)
            })?;
        Ok(upscale(image, settings.width, settings.height))
    }

    /// One mixdown over the full range, or None when no unmuted track carries
    /// audio.
    fn mix_audio(
        &mut self,
        sequence: &Sequence,
        duration: f64,
        audio: &AudioExportSettings,
        cancel: &CancelToken,
    ) -> Result<Option<PcmBuffer>, ExportError> {
        if cancel.is_cancelled() {
            return Err(ExportError::cancelled(ExportPhase::Encoding));
        }
        if !sequence_has_audio(sequence) {
            return Ok(None);
        }
        let pcm = self
            .mixdown
            .mixdown(sequence, 0.0, duration, audio.channels, audio.sample_rate)
            .map_err(|e| {
                ExportError::new(ErrorCode::AudioEncodeFailed, ExportPhase::Encoding, e)
            })?;
        Ok(Some(pcm))
    }
}

fn nonempty_duration(sequence: &Sequence) -> Result<f64, ExportError> {
    let duration = sequence.content_end_sec();
    if duration <= 0.0 {
        return Err(ExportError::new(
            ErrorCode::MuxerError,
            ExportPhase::Preparing,
            "timeline is empty",
        ));
    }
    Ok(duration)
}

fn sequence_has_audio(sequence: &Sequence) -> bool {
    sequence.tracks.iter().filter(|t| !t.muted).any(|t| {
        t.clips
            .iter()
            .any(|c| matches!(c.kind, ClipKind::Audio { .. } | ClipKind::Video { .. }))
    })
}

fn tick(
    phase: ExportPhase,
    progress: f64,
    current_frame: u64,
    total_frames: u64,
    bytes_written: u64,
) -> ExportProgress {
    ExportProgress {
        phase,
        progress,
        eta_seconds: None,
        current_frame,
        total_frames,
        bytes_written,
        current_bitrate: None,
    }
}

fn eta(started: Instant, done: u64, total: u64) -> Option<f64> {
    if done == 0 || total <= done {
        return None;
    }
    let per_frame = started.elapsed().as_secs_f64() / done as f64;
    Some(per_frame * (total - done) as f64)
}

fn drain_worker_events(
    channel: &EncodeChannel,
    target: &mut OutputTarget,
    bytes_written: &mut u64,
) -> Result<(), ExportError> {
    for event in channel.events().try_iter() {
        match event {
            WorkerEvent::Chunk { bytes, position } => {
                target
                    .write_chunk(position, &bytes)
                    .map_err(|e| ExportError::wrap(io_error_code(&e), ExportPhase::Rendering, e))?;
                *bytes_written = (*bytes_written).max(position + bytes.len() as u64);
            }
            WorkerEvent::Error(msg) => {
                return Err(ExportError::new(
                    ErrorCode::FrameEncodeFailed,
                    ExportPhase::Rendering,
                    msg,
                ));
            }
            _ => {}
        }
    }
    Ok(())
}

fn encode_image(image: RgbaImage, format: ImageFormat) -> Result<Vec<u8>, ExportError> {
    let mut buf = std::io::Cursor::new(Vec::new());
    let result = match format {
        ImageFormat::Png => {
            image::DynamicImage::ImageRgba8(image).write_to(&mut buf, image::ImageFormat::Png)
        }
        // JPEG has no alpha channel.
        ImageFormat::Jpeg => image::DynamicImage::ImageRgb8(
            image::DynamicImage::ImageRgba8(image).to_rgb8(),
        )
        .write_to(&mut buf, image::ImageFormat::Jpeg),
    };
    result.map_err(|e| {
        ExportError::wrap(ErrorCode::FrameEncodeFailed, ExportPhase::Encoding, e)
    })?;
    Ok(buf.into_inner())
}

fn encode_audio_via_ffmpeg(
    pcm: &PcmBuffer,
    settings: &AudioExportSettings,
) -> Result<Vec<u8>, ExportError> {
    use std::process::{Command, Stdio};

    let ffmpeg = media_io::ffmpeg_path()?;
    let scratch = tempfile::tempdir()
        .map_err(|e| ExportError::wrap(io_error_code(&e), ExportPhase::Encoding, e))?;
    let wav_path = scratch.path().join("mix.wav");
    std::fs::write(&wav_path, wav::encode_wav(pcm, 32)?)
        .map_err(|e| ExportError::wrap(io_error_code(&e), ExportPhase::Encoding, e))?;

    let ext = match settings.format {
        AudioFormat::Mp3 => "mp3",
        AudioFormat::Aac => "m4a",
        AudioFormat::Flac => "flac",
        AudioFormat::Ogg => "ogg",
        AudioFormat::Wav => "wav",
    };
    let out_path = scratch.path().join(format!("out.{ext}"));
    let out = Command::new(ffmpeg)
        .arg("-y")
        .arg("-i")
        .arg(&wav_path)
        .arg("-c:a")
        .arg(settings.format.codec().encoder_name())
        .arg("-b:a")
        .arg(settings.bitrate.to_string())
        .arg(&out_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| ExportError::wrap(ErrorCode::AudioEncodeFailed, ExportPhase::Encoding, e))?;
    if !out.status.success() {
        return Err(ExportError::new(
            ErrorCode::AudioEncodeFailed,
            ExportPhase::Encoding,
            format!(
                "audio encode failed: {}",
                String::from_utf8_lossy(&out.stderr)
            ),
        ));
    }
    std::fs::read(&out_path)
        .map_err(|e| ExportError::wrap(io_error_code(&e), ExportPhase::Encoding, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use media_io::MediaKind;
    use timeline::{Clip, Fps, Track, Transform};

    fn video_clip(src: &str, start: f64, duration: f64, speed: f64) -> Clip {
        Clip {
            id: Uuid::new_v4().to_string(),
            start_sec: start,
            duration_sec: duration,
            kind: ClipKind::Video {
                src: src.to_string(),
                in_offset_sec: 0.0,
                speed,
            },
            effects: Vec::new(),
            transform: None,
        }
    }

    fn single_clip_sequence() -> Sequence {
        let mut seq = Sequence::new("test", 1920, 1080, Fps { num: 30, den: 1 });
        seq.add_track(Track {
            name: "v1".into(),
            muted: false,
            clips: vec![video_clip("/media/a.mp4", 0.0, 10.0, 1.0)],
        });
        seq
    }

    fn source_info(w: u32, h: u32) -> MediaInfo {
        MediaInfo {
            path: "/media/a.mp4".into(),
            kind: MediaKind::Video,
            width: Some(w),
            height: Some(h),
            fps_num: Some(30),
            fps_den: Some(1),
            duration_seconds: Some(10.0),
            audio_channels: Some(2),
            sample_rate: Some(48_000),
        }
    }

    fn settings_1080p() -> VideoExportSettings {
        crate::settings::PartialVideoSettings::default().merged()
    }

    #[test]
    fn stream_copy_allowed_when_all_guards_hold() {
        let seq = single_clip_sequence();
        assert!(stream_copy_eligible(
            &seq,
            &settings_1080p(),
            &source_info(1920, 1080)
        ));
    }

    #[test]
    fn resolution_mismatch_forces_reencode() {
        let seq = single_clip_sequence();
        assert!(!stream_copy_eligible(
            &seq,
            &settings_1080p(),
            &source_info(1280, 720)
        ));
    }

    #[test]
    fn speed_change_forces_reencode() {
        let mut seq = single_clip_sequence();
        seq.tracks[0].clips[0] = video_clip("/media/a.mp4", 0.0, 10.0, 2.0);
        assert!(!stream_copy_eligible(
            &seq,
            &settings_1080p(),
            &source_info(1920, 1080)
        ));
    }

    #[test]
    fn nonzero_start_forces_reencode() {
        let mut seq = single_clip_sequence();
        seq.tracks[0].clips[0] = video_clip("/media/a.mp4", 1.0, 10.0, 1.0);
        assert!(!stream_copy_eligible(
            &seq,
            &settings_1080p(),
            &source_info(1920, 1080)
        ));
    }

    #[test]
    fn effects_or_transform_force_reencode() {
        let mut seq = single_clip_sequence();
        seq.tracks[0].clips[0].effects.push("blur".into());
        assert!(!stream_copy_eligible(
            &seq,
            &settings_1080p(),
            &source_info(1920, 1080)
        ));

        let mut seq = single_clip_sequence();
        seq.tracks[0].clips[0].transform = Some(Transform {
            x: 10.0,
            y: 0.0,
            scale: 1.0,
            rotation: 0.0,
        });
        assert!(!stream_copy_eligible(
            &seq,
            &settings_1080p(),
            &source_info(1920, 1080)
        ));
    }

    #[test]
    fn second_clip_forces_reencode() {
        let mut seq = single_clip_sequence();
        seq.tracks[0]
            .clips
            .push(video_clip("/media/b.mp4", 10.0, 5.0, 1.0));
        assert!(!stream_copy_eligible(
            &seq,
            &settings_1080p(),
            &source_info(1920, 1080)
        ));
    }

    #[test]
    fn muted_tracks_carry_no_audio() {
        let mut seq = single_clip_sequence();
        assert!(sequence_has_audio(&seq));
        seq.tracks[0].muted = true;
        assert!(!sequence_has_audio(&seq));
    }

    #[test]
    fn eta_decreases_with_progress() {
        let started = Instant::now() - std::time::Duration::from_secs(10);
        let early = eta(started, 10, 100).unwrap();
        let late = eta(started, 90, 100).unwrap();
        assert!(late < early);
        assert!(eta(started, 0, 100).is_none());
        assert!(eta(started, 100, 100).is_none());
    }

    #[test]
    fn png_image_encoding_roundtrips() {
        let img = RgbaImage::from_pixel(8, 8, image::Rgba([200, 10, 10, 255]));
        let bytes = encode_image(img, ImageFormat::Png).unwrap();
        assert_eq!(&bytes[1..4], b"PNG");
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (8, 8));
    }

    #[test]
    fn jpeg_encoding_drops_alpha() {
        let img = RgbaImage::from_pixel(8, 8, image::Rgba([0, 255, 0, 128]));
        let bytes = encode_image(img, ImageFormat::Jpeg).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.color().channel_count(), 3);
    }
}
