//! Cross-module pipeline behavior with mock collaborators: no external
//! encoder binary is touched on these paths.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use image::RgbaImage;
use media_io::{Acceleration, StaticProber, VideoCodec};
use pipeline::{
    select_backend, total_frame_count, AudioExportSettings, AudioFormat, AudioMixdown,
    CancelToken, EncodeBackend, ErrorCode, ExportPhase, ExportPipeline, ExportSettings,
    FrameRenderer, ImageExportSettings, ImageFormat, ImageSequenceSettings, MemorySink,
    OutputTarget, PartialVideoSettings, PcmBuffer, PipelineTuning, ProgressEmitter,
};
use timeline::{Clip, ClipKind, Fps, Sequence, Track};

struct SolidRenderer {
    renders: Arc<AtomicU64>,
    cancel_after: Option<(u64, CancelToken)>,
}

impl SolidRenderer {
    fn new() -> Self {
        Self {
            renders: Arc::new(AtomicU64::new(0)),
            cancel_after: None,
        }
    }
}

impl FrameRenderer for SolidRenderer {
    fn render(
        &mut self,
        _sequence: &Sequence,
        _timestamp_sec: f64,
        width: u32,
        height: u32,
    ) -> Result<RgbaImage, String> {
        let n = self.renders.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, token)) = &self.cancel_after {
            if n >= *after {
                token.cancel();
            }
        }
        Ok(RgbaImage::from_pixel(width, height, image::Rgba([30, 30, 30, 255])))
    }
}

struct ConstantMixdown;

impl AudioMixdown for ConstantMixdown {
    fn mixdown(
        &mut self,
        _sequence: &Sequence,
        start_sec: f64,
        end_sec: f64,
        channels: u32,
        sample_rate: u32,
    ) -> Result<PcmBuffer, String> {
        let frames = ((end_sec - start_sec) * sample_rate as f64).round() as usize;
        Ok(PcmBuffer {
            samples: vec![0.25; frames * channels as usize],
            channels,
            sample_rate,
        })
    }
}

fn pipeline_with(renderer: SolidRenderer) -> ExportPipeline {
    ExportPipeline::new(
        Box::new(renderer),
        Box::new(ConstantMixdown),
        Box::new(StaticProber::typical_software()),
    )
}

fn sequence_with_clip(duration_sec: f64) -> Sequence {
    let mut seq = Sequence::new("it", 320, 180, Fps { num: 30, den: 1 });
    seq.add_track(Track {
        name: "v1".into(),
        muted: false,
        clips: vec![Clip {
            id: "c1".into(),
            start_sec: 0.0,
            duration_sec,
            kind: ClipKind::Solid {
                color: "#000000".into(),
            },
            effects: Vec::new(),
            transform: None,
        }],
    });
    seq
}

#[test]
fn empty_timeline_is_a_muxer_error() {
    let seq = Sequence::new("empty", 1920, 1080, Fps { num: 30, den: 1 });
    let (mut emitter, _rx) = ProgressEmitter::channel();
    let err = pipeline_with(SolidRenderer::new())
        .run(
            &seq,
            &ExportSettings::Video(PartialVideoSettings::default()),
            OutputTarget::memory(),
            &CancelToken::new(),
            &mut emitter,
        )
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::MuxerError);
    assert!(err.message.contains("timeline is empty"));
    assert!(!err.recoverable);
}

#[test]
fn cancel_before_run_aborts_the_sink() {
    let seq = sequence_with_clip(2.0);
    let sink = MemorySink::new();
    let probe = sink.clone();
    let cancel = CancelToken::new();
    cancel.cancel();

    let (mut emitter, _rx) = ProgressEmitter::channel();
    let err = pipeline_with(SolidRenderer::new())
        .run(
            &seq,
            &ExportSettings::Video(PartialVideoSettings::default()),
            OutputTarget::stream(sink),
            &cancel,
            &mut emitter,
        )
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Cancelled);
    assert!(err.recoverable);
    assert!(probe.is_aborted());
    assert!(!probe.is_closed());
}

#[test]
fn total_frames_rounds_up_partial_frames() {
    assert_eq!(total_frame_count(10.0, 30.0), 300);
    assert_eq!(total_frame_count(10.01, 30.0), 301);
    assert_eq!(total_frame_count(1.0, 29.97), 30);
}

#[test]
fn duration_covers_overlays_and_markers() {
    let mut seq = sequence_with_clip(2.0);
    seq.overlays.push(timeline::OverlayItem {
        id: "o1".into(),
        start_sec: 1.0,
        duration_sec: 4.0,
        kind: timeline::OverlayKind::Text {
            text: "title".into(),
            color: "#ffffff".into(),
        },
    });
    seq.markers.push(timeline::Marker::new(7.5, "chapter"));
    assert_eq!(seq.content_end_sec(), 7.5);
    assert_eq!(total_frame_count(seq.content_end_sec(), 30.0), 225);
}

#[test]
fn backend_selection_orders_worker_and_fallback() {
    let tuning = PipelineTuning::default();
    let software = StaticProber::typical_software();
    let hardware = StaticProber::typical_software()
        .with_video(VideoCodec::H264, Acceleration::Hardware);
    let nothing = StaticProber::new();

    let partial = PartialVideoSettings::default();
    let sw = pipeline::settings::normalize(&partial, &software, &tuning).unwrap();
    let hw = pipeline::settings::normalize(&partial, &hardware, &tuning).unwrap();
    let none = pipeline::settings::normalize(&partial, &nothing, &tuning).unwrap();

    // Software-only, buffered output: batch fallback carries the run.
    assert_eq!(select_backend(&sw, false), EncodeBackend::Fallback);
    // Streaming sink forces the incremental worker path.
    assert_eq!(select_backend(&sw, true), EncodeBackend::Worker);
    // Hardware tier earns the worker even when buffered.
    assert_eq!(select_backend(&hw, false), EncodeBackend::Worker);
    // Nothing encodable: fallback regardless of target.
    assert!(none.needs_fallback);
    assert_eq!(select_backend(&none, true), EncodeBackend::Fallback);
}

#[test]
fn fallback_render_ticks_cover_the_whole_phase() {
    // Frame staging reports the same per-frame fraction as the worker path;
    // only the encode job's polled progress is banded. The run itself may
    // fail later (no encoder binary needed for this assertion).
    let seq = sequence_with_clip(1.0);
    let (mut emitter, rx) = ProgressEmitter::channel();
    let mut pipeline = pipeline_with(SolidRenderer::new()).force_backend(EncodeBackend::Fallback);
    let _ = pipeline.run(
        &seq,
        &ExportSettings::Video(PartialVideoSettings {
            width: Some(64),
            height: Some(36),
            ..Default::default()
        }),
        OutputTarget::memory(),
        &CancelToken::new(),
        &mut emitter,
    );
    drop(emitter);

    let rendering: Vec<f64> = rx
        .try_iter()
        .filter(|u| u.phase == ExportPhase::Rendering)
        .map(|u| u.progress)
        .collect();
    assert_eq!(rendering.len(), 30);
    assert!(rendering[0] < 0.1);
    assert!((rendering.last().copied().unwrap() - 1.0).abs() < 1e-9);
}

#[test]
fn image_export_returns_png_bytes() {
    let seq = sequence_with_clip(2.0);
    let (mut emitter, _rx) = ProgressEmitter::channel();
    let out = pipeline_with(SolidRenderer::new())
        .run(
            &seq,
            &ExportSettings::Image(ImageExportSettings {
                format: ImageFormat::Png,
                width: 64,
                height: 36,
                timestamp_sec: 1.0,
            }),
            OutputTarget::memory(),
            &CancelToken::new(),
            &mut emitter,
        )
        .unwrap();
    let data = out.data.unwrap();
    assert_eq!(&data[1..4], b"PNG");
    assert_eq!(out.stats.frames_rendered, 1);
}

#[test]
fn audio_only_wav_export_has_exact_layout() {
    let seq = sequence_with_clip(0.5);
    let settings = AudioExportSettings {
        format: AudioFormat::Wav,
        sample_rate: 48_000,
        bit_depth: 16,
        bitrate: 0,
        channels: 2,
    };
    let (mut emitter, _rx) = ProgressEmitter::channel();
    let out = pipeline_with(SolidRenderer::new())
        .run(
            &seq,
            &ExportSettings::Audio(settings),
            OutputTarget::memory(),
            &CancelToken::new(),
            &mut emitter,
        )
        .unwrap();
    let data = out.data.unwrap();
    let header = pipeline::wav::parse_wav_header(&data).unwrap();
    // 0.5 s of stereo 16-bit at 48 kHz.
    assert_eq!(header.channels, 2);
    assert_eq!(header.sample_rate, 48_000);
    assert_eq!(header.data_len as usize, 24_000 * 2 * 2);
}

#[test]
fn sequence_export_writes_numbered_frames_with_monotonic_progress() {
    let seq = sequence_with_clip(1.0);
    let dir = tempfile::tempdir().unwrap();
    let (mut emitter, rx) = ProgressEmitter::channel();
    let out = pipeline_with(SolidRenderer::new())
        .run(
            &seq,
            &ExportSettings::Sequence(ImageSequenceSettings {
                format: ImageFormat::Png,
                width: 32,
                height: 18,
                frame_rate: 10.0,
                output_dir: dir.path().to_path_buf(),
            }),
            OutputTarget::memory(),
            &CancelToken::new(),
            &mut emitter,
        )
        .unwrap();
    assert_eq!(out.stats.frames_rendered, 10);
    assert!(dir.path().join("frame_000000.png").exists());
    assert!(dir.path().join("frame_000009.png").exists());

    let updates: Vec<_> = rx.try_iter().collect();
    assert!(!updates.is_empty());
    let mut last_rank = 0u8;
    let mut last_progress = 0.0f64;
    for u in &updates {
        let rank = u.phase.rank();
        assert!(rank >= last_rank, "phase went backwards");
        if rank > last_rank {
            last_progress = 0.0;
        }
        assert!(u.progress >= last_progress, "progress went backwards");
        last_rank = rank;
        last_progress = u.progress;
    }
    assert_eq!(updates.last().unwrap().phase, ExportPhase::Complete);
}

#[test]
fn cancel_mid_render_stops_promptly() {
    let seq = sequence_with_clip(2.0);
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancelToken::new();
    let mut renderer = SolidRenderer::new();
    renderer.cancel_after = Some((3, cancel.clone()));
    let renders = renderer.renders.clone();

    let (mut emitter, _rx) = ProgressEmitter::channel();
    let err = pipeline_with(renderer)
        .run(
            &seq,
            &ExportSettings::Sequence(ImageSequenceSettings {
                format: ImageFormat::Png,
                width: 32,
                height: 18,
                frame_rate: 30.0,
                output_dir: dir.path().to_path_buf(),
            }),
            OutputTarget::memory(),
            &cancel,
            &mut emitter,
        )
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Cancelled);
    assert!(err.recoverable);
    // The loop stops at the next cancellation check, not at the end.
    assert!(renders.load(Ordering::SeqCst) < 10);
}
