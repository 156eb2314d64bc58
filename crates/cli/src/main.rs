use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use media_io::{CapabilityProber, FfmpegProber, VideoCodec};
use pipeline::{
    select_backend, total_frame_count, AudioExportSettings, AudioFormat, CancelToken,
    ExportPipeline, ExportSettings, FileSink, OutputTarget, PartialVideoSettings,
    PipelineTuning, ProgressEmitter, VideoFormat,
};
use timeline::Sequence;

mod mixdown;
mod render;

use mixdown::FfmpegMixdown;
use render::CpuRenderer;

#[derive(Parser)]
#[command(name = "vireo-cli")]
#[command(about = "Vireo export engine - headless timeline exports")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Export a sequence JSON file to a media file
    Export {
        /// Sequence snapshot (JSON)
        sequence: PathBuf,

        /// Output file path
        #[arg(short, long)]
        output: PathBuf,

        /// Container format (mp4, webm, mov)
        #[arg(long)]
        format: Option<String>,

        /// Output width
        #[arg(long)]
        width: Option<u32>,

        /// Output height
        #[arg(long)]
        height: Option<u32>,

        /// Output frame rate
        #[arg(long)]
        fps: Option<f64>,

        /// Video bitrate in bits/sec
        #[arg(long)]
        bitrate: Option<u64>,

        /// Quality 0-100 (VBR)
        #[arg(long)]
        quality: Option<u8>,

        /// Stream to the output file as bytes are produced instead of
        /// buffering in memory
        #[arg(long)]
        stream: bool,

        /// Export the mixed audio only (format from the output extension)
        #[arg(long)]
        audio_only: bool,
    },

    /// Report encode capabilities, optionally probing media files
    Probe {
        /// Media files to inspect
        files: Vec<PathBuf>,
    },

    /// Summarize a sequence: duration, frame count, chosen strategy
    Inspect {
        /// Sequence snapshot (JSON)
        sequence: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    match cli.command {
        Commands::Export {
            sequence,
            output,
            format,
            width,
            height,
            fps,
            bitrate,
            quality,
            stream,
            audio_only,
        } => export_command(
            sequence, output, format, width, height, fps, bitrate, quality, stream, audio_only,
        ),
        Commands::Probe { files } => probe_command(files),
        Commands::Inspect { sequence } => inspect_command(sequence),
    }
}

fn load_sequence(path: &Path) -> Result<Sequence> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading sequence file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing sequence {}", path.display()))
}

fn parse_format(format: &str) -> Result<VideoFormat> {
    match format {
        "mp4" => Ok(VideoFormat::Mp4),
        "webm" => Ok(VideoFormat::WebM),
        "mov" => Ok(VideoFormat::Mov),
        other => Err(anyhow!("unsupported container format: {other}")),
    }
}

fn audio_format_for(output: &Path) -> Result<AudioFormat> {
    match output.extension().and_then(|e| e.to_str()) {
        Some("mp3") => Ok(AudioFormat::Mp3),
        Some("wav") => Ok(AudioFormat::Wav),
        Some("m4a") | Some("aac") => Ok(AudioFormat::Aac),
        Some("flac") => Ok(AudioFormat::Flac),
        Some("ogg") => Ok(AudioFormat::Ogg),
        other => Err(anyhow!("unsupported audio output extension: {other:?}")),
    }
}

#[allow(clippy::too_many_arguments)]
fn export_command(
    sequence_path: PathBuf,
    output: PathBuf,
    format: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<f64>,
    bitrate: Option<u64>,
    quality: Option<u8>,
    stream: bool,
    audio_only: bool,
) -> Result<()> {
    let sequence = load_sequence(&sequence_path)?;
    info!(
        "Exporting '{}' ({:.2}s) to {}",
        sequence.name,
        sequence.content_end_sec(),
        output.display()
    );

    let settings = if audio_only {
        ExportSettings::Audio(AudioExportSettings {
            format: audio_format_for(&output)?,
            ..AudioExportSettings::default()
        })
    } else {
        let container = format
            .as_deref()
            .or_else(|| output.extension().and_then(|e| e.to_str()))
            .unwrap_or("mp4");
        ExportSettings::Video(PartialVideoSettings {
            format: Some(parse_format(container)?),
            width,
            height,
            frame_rate: fps,
            bitrate,
            quality,
            ..Default::default()
        })
    };

    let prober = FfmpegProber::new().context("probing encoder capabilities")?;
    let mut pipeline = ExportPipeline::new(
        Box::new(CpuRenderer::new()),
        Box::new(FfmpegMixdown::new()),
        Box::new(prober),
    );

    let (mut emitter, rx) = ProgressEmitter::channel();
    let reporter = thread::spawn(move || {
        for update in rx.iter() {
            info!(
                "{:?} {:>5.1}%  frame {}/{}",
                update.phase,
                update.progress * 100.0,
                update.current_frame,
                update.total_frames,
            );
        }
    });

    let target = if stream {
        OutputTarget::stream(
            FileSink::create(&output)
                .with_context(|| format!("creating {}", output.display()))?,
        )
    } else {
        OutputTarget::memory()
    };

    let cancel = CancelToken::new();
    let result = pipeline.run(&sequence, &settings, target, &cancel, &mut emitter);
    drop(emitter);
    let _ = reporter.join();

    let out = result.map_err(|e| anyhow!("{e}"))?;
    if let Some(data) = out.data {
        std::fs::write(&output, data)
            .with_context(|| format!("writing {}", output.display()))?;
    }
    info!(
        "Done: {} frames in {:.2}s ({:.1} fps), {} bytes",
        out.stats.frames_rendered,
        out.stats.elapsed_seconds,
        out.stats.encode_fps,
        out.stats.output_bytes,
    );
    Ok(())
}

fn probe_command(files: Vec<PathBuf>) -> Result<()> {
    let prober = FfmpegProber::new().context("probing encoder capabilities")?;

    let mut video = serde_json::Map::new();
    for codec in [
        VideoCodec::H264,
        VideoCodec::H265,
        VideoCodec::Vp8,
        VideoCodec::Vp9,
        VideoCodec::Av1,
        VideoCodec::ProRes,
    ] {
        video.insert(
            format!("{codec:?}").to_lowercase(),
            serde_json::json!({
                "acceleration": prober.acceleration(codec),
                "encoder": prober.encoder_name(codec),
            }),
        );
    }

    let mut report = serde_json::json!({
        "video": video,
        "best_video_1080p": prober.best_video_codec(1920, 1080),
        "best_audio": prober.best_audio_codec(),
    });

    if !files.is_empty() {
        let mut probed = Vec::new();
        for file in &files {
            match media_io::probe_media(file) {
                Ok(info) => probed.push(serde_json::json!({
                    "file": file,
                    "kind": format!("{:?}", info.kind),
                    "width": info.width,
                    "height": info.height,
                    "fps_num": info.fps_num,
                    "fps_den": info.fps_den,
                    "duration_seconds": info.duration_seconds,
                    "audio_channels": info.audio_channels,
                    "sample_rate": info.sample_rate,
                })),
                Err(e) => probed.push(serde_json::json!({
                    "file": file,
                    "error": e.to_string(),
                })),
            }
        }
        report["media"] = serde_json::json!(probed);
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn inspect_command(sequence_path: PathBuf) -> Result<()> {
    let sequence = load_sequence(&sequence_path)?;
    let duration = sequence.content_end_sec();
    let fps = sequence.fps.as_f64();

    let prober = FfmpegProber::new().context("probing encoder capabilities")?;
    let normalized = pipeline::settings::normalize(
        &PartialVideoSettings {
            width: Some(sequence.width),
            height: Some(sequence.height),
            frame_rate: Some(fps),
            ..Default::default()
        },
        &prober,
        &PipelineTuning::default(),
    )
    .map_err(|e| anyhow!("{e}"))?;
    let backend = select_backend(&normalized, false);

    let report = serde_json::json!({
        "name": sequence.name,
        "resolution": format!("{}x{}", sequence.width, sequence.height),
        "fps": fps,
        "duration_seconds": duration,
        "total_frames": total_frame_count(duration, fps),
        "tracks": sequence.tracks.len(),
        "overlays": sequence.overlays.len(),
        "markers": sequence.markers.len(),
        "single_clip": sequence.single_clip().is_some(),
        "codec": format!("{:?}", normalized.settings.codec),
        "backend": format!("{backend:?}"),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
