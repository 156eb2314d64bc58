use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

mod capability;
pub use capability::{
    resolve_audio_codec, Acceleration, AudioCodec, CapabilityProber, FfmpegProber, StaticProber,
    VideoCodec, AUDIO_FALLBACK_BITRATES, AUDIO_FALLBACK_CODECS, SAFE_DEFAULT_AUDIO_BITRATE,
};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("{0} not found on PATH; please install FFmpeg")]
    ToolMissing(&'static str),
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),
    #[error("parse error: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    sample_rate: Option<String>,
    channels: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct FfprobeJson {
    streams: Option<Vec<FfprobeStream>>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub path: PathBuf,
    pub kind: MediaKind,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps_num: Option<u32>,
    pub fps_den: Option<u32>,
    pub duration_seconds: Option<f64>,
    pub audio_channels: Option<u32>,
    pub sample_rate: Option<u32>,
}

impl MediaInfo {
    pub fn resolution(&self) -> Option<(u32, u32)> {
        match (self.width, self.height) {
            (Some(w), Some(h)) => Some((w, h)),
            _ => None,
        }
    }

    pub fn has_audio(&self) -> bool {
        self.audio_channels.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Image,
    Audio,
}

fn parse_rate(s: &str) -> Option<(u32, u32)> {
    let s = s.trim();
    if s == "0/0" || s == "0" || s.is_empty() {
        return None;
    }
    if let Some((a, b)) = s.split_once('/') {
        let num = a.parse().ok()?;
        let den = b.parse().ok()?;
        if den == 0 {
            return None;
        }
        return Some((num, den));
    }
    // integer fallback
    let v: u32 = s.parse().ok()?;
    Some((v, 1))
}

/// Probe a media file with ffprobe. The export pipeline uses this to verify
/// source resolution before taking the stream-copy shortcut.
pub fn probe_media(path: &Path) -> Result<MediaInfo, ProbeError> {
    let ffprobe = which::which("ffprobe").map_err(|_| ProbeError::ToolMissing("ffprobe"))?;
    let out = Command::new(ffprobe)
        .arg("-v")
        .arg("error")
        .arg("-show_format")
        .arg("-show_streams")
        .arg("-print_format")
        .arg("json")
        .arg(path)
        .output()
        .map_err(|e| ProbeError::FfprobeFailed(e.to_string()))?;
    if !out.status.success() {
        return Err(ProbeError::FfprobeFailed(
            String::from_utf8_lossy(&out.stderr).into(),
        ));
    }
    let parsed: FfprobeJson =
        serde_json::from_slice(&out.stdout).map_err(|e| ProbeError::Parse(e.to_string()))?;

    let mut kind = MediaKind::Video;
    let mut width = None;
    let mut height = None;
    let mut fps = None;
    let mut audio_channels = None;
    let mut sample_rate = None;

    if let Some(streams) = &parsed.streams {
        for s in streams {
            match s.codec_type.as_deref() {
                Some("video") => {
                    kind = MediaKind::Video;
                    width = width.or(s.width);
                    height = height.or(s.height);
                    fps = fps
                        .or_else(|| s.avg_frame_rate.as_deref().and_then(parse_rate))
                        .or_else(|| s.r_frame_rate.as_deref().and_then(parse_rate));
                }
                Some("audio") => {
                    if kind != MediaKind::Video {
                        kind = MediaKind::Audio;
                    }
                    audio_channels = audio_channels.or(s.channels);
                    sample_rate =
                        sample_rate.or(s.sample_rate.as_deref().and_then(|x| x.parse().ok()));
                }
                Some("image") => {
                    if kind != MediaKind::Video {
                        kind = MediaKind::Image;
                    }
                    width = width.or(s.width);
                    height = height.or(s.height);
                }
                _ => {}
            }
        }
    }

    let duration_seconds = parsed
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(|d| d.parse().ok());

    let (fps_num, fps_den) = fps.map(|(n, d)| (Some(n), Some(d))).unwrap_or((None, None));

    Ok(MediaInfo {
        path: path.to_path_buf(),
        kind,
        width,
        height,
        fps_num,
        fps_den,
        duration_seconds,
        audio_channels,
        sample_rate,
    })
}

/// Locate the ffmpeg binary on PATH.
pub fn ffmpeg_path() -> Result<PathBuf, ProbeError> {
    which::which("ffmpeg").map_err(|_| ProbeError::ToolMissing("ffmpeg"))
}
