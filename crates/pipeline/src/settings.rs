//! Export settings and their normalization. The caller hands in a partial
//! request; the controller derives a clamped, codec-substituted copy and
//! never mutates the original.

use crate::error::ExportError;
use crate::tuning::PipelineTuning;
use media_io::{Acceleration, AudioCodec, CapabilityProber, VideoCodec};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoFormat {
    Mp4,
    WebM,
    Mov,
}

impl VideoFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoFormat::Mp4 => "video/mp4",
            VideoFormat::WebM => "video/webm",
            VideoFormat::Mov => "video/quicktime",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            VideoFormat::Mp4 => "mp4",
            VideoFormat::WebM => "webm",
            VideoFormat::Mov => "mov",
        }
    }

    /// Codecs this container claims to hold, in preference order.
    pub fn supported_video_codecs(&self) -> &'static [VideoCodec] {
        match self {
            VideoFormat::Mp4 => &[VideoCodec::H264, VideoCodec::H265, VideoCodec::Av1],
            VideoFormat::WebM => &[VideoCodec::Vp9, VideoCodec::Vp8, VideoCodec::Av1],
            VideoFormat::Mov => &[VideoCodec::H264, VideoCodec::H265, VideoCodec::ProRes],
        }
    }

    pub fn supported_audio_codecs(&self) -> &'static [AudioCodec] {
        match self {
            VideoFormat::Mp4 => &[AudioCodec::Aac, AudioCodec::Mp3],
            VideoFormat::WebM => &[AudioCodec::Opus, AudioCodec::Vorbis],
            VideoFormat::Mov => &[AudioCodec::Aac, AudioCodec::Pcm],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    Mp3,
    Wav,
    Aac,
    Flac,
    Ogg,
}

impl AudioFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "audio/mpeg",
            AudioFormat::Wav => "audio/wav",
            AudioFormat::Aac => "audio/aac",
            AudioFormat::Flac => "audio/flac",
            AudioFormat::Ogg => "audio/ogg",
        }
    }

    pub fn codec(&self) -> AudioCodec {
        match self {
            AudioFormat::Mp3 => AudioCodec::Mp3,
            AudioFormat::Wav => AudioCodec::Pcm,
            AudioFormat::Aac => AudioCodec::Aac,
            AudioFormat::Flac => AudioCodec::Flac,
            AudioFormat::Ogg => AudioCodec::Vorbis,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BitrateMode {
    Cbr,
    Vbr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProResProfile {
    Proxy,
    Lt,
    Standard,
    Hq,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UpscaleSettings {
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioExportSettings {
    pub format: AudioFormat,
    pub sample_rate: u32,
    pub bit_depth: u16,
    pub bitrate: u32,
    pub channels: u32,
}

impl Default for AudioExportSettings {
    fn default() -> Self {
        Self {
            format: AudioFormat::Aac,
            sample_rate: 48_000,
            bit_depth: 16,
            bitrate: 192_000,
            channels: 2,
        }
    }
}

impl AudioExportSettings {
    pub fn validate(&self) -> Result<(), ExportError> {
        if ![44_100, 48_000, 96_000].contains(&self.sample_rate) {
            return Err(ExportError::invalid_settings(format!(
                "unsupported sample rate: {}",
                self.sample_rate
            )));
        }
        if ![16, 24, 32].contains(&self.bit_depth) {
            return Err(ExportError::invalid_settings(format!(
                "unsupported bit depth: {}",
                self.bit_depth
            )));
        }
        if !(1..=2).contains(&self.channels) {
            return Err(ExportError::invalid_settings(format!(
                "unsupported channel count: {}",
                self.channels
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoExportSettings {
    pub format: VideoFormat,
    pub codec: VideoCodec,
    #[serde(default)]
    pub prores_profile: Option<ProResProfile>,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    /// Bits per second.
    pub bitrate: u64,
    pub bitrate_mode: BitrateMode,
    /// 0..=100, mapped onto the encoder's quality scale for VBR.
    pub quality: u8,
    /// Maximum frame distance between keyframes.
    pub keyframe_interval: u32,
    pub audio: AudioExportSettings,
    #[serde(default)]
    pub upscaling: Option<UpscaleSettings>,
}

impl VideoExportSettings {
    pub fn defaults_for(format: VideoFormat) -> Self {
        let codec = format.supported_video_codecs()[0];
        Self {
            format,
            codec,
            prores_profile: None,
            width: 1920,
            height: 1080,
            frame_rate: 30.0,
            bitrate: 8_000_000,
            bitrate_mode: BitrateMode::Vbr,
            quality: 80,
            keyframe_interval: 60,
            audio: AudioExportSettings {
                format: match format {
                    VideoFormat::WebM => AudioFormat::Ogg,
                    _ => AudioFormat::Aac,
                },
                ..AudioExportSettings::default()
            },
            upscaling: None,
        }
    }
}

/// Partial video settings as supplied by a caller; anything unset falls back
/// to the format default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartialVideoSettings {
    pub format: Option<VideoFormat>,
    pub codec: Option<VideoCodec>,
    pub prores_profile: Option<ProResProfile>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f64>,
    pub bitrate: Option<u64>,
    pub bitrate_mode: Option<BitrateMode>,
    pub quality: Option<u8>,
    pub keyframe_interval: Option<u32>,
    pub audio: Option<AudioExportSettings>,
    pub upscaling: Option<UpscaleSettings>,
}

impl PartialVideoSettings {
    pub fn merged(&self) -> VideoExportSettings {
        let format = self.format.unwrap_or(VideoFormat::Mp4);
        let d = VideoExportSettings::defaults_for(format);
        VideoExportSettings {
            format,
            codec: self.codec.unwrap_or(d.codec),
            prores_profile: self.prores_profile.or(d.prores_profile),
            width: self.width.unwrap_or(d.width),
            height: self.height.unwrap_or(d.height),
            frame_rate: self.frame_rate.unwrap_or(d.frame_rate),
            bitrate: self.bitrate.unwrap_or(d.bitrate),
            bitrate_mode: self.bitrate_mode.unwrap_or(d.bitrate_mode),
            quality: self.quality.unwrap_or(d.quality),
            keyframe_interval: self.keyframe_interval.unwrap_or(d.keyframe_interval),
            audio: self.audio.clone().unwrap_or(d.audio),
            upscaling: self.upscaling.or(d.upscaling),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    Png,
    Jpeg,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageExportSettings {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    /// Timeline position to snapshot.
    pub timestamp_sec: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSequenceSettings {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    /// Directory the numbered frame files are written into.
    pub output_dir: std::path::PathBuf,
}

/// Top-level export request, one of the four export kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExportSettings {
    Video(PartialVideoSettings),
    Audio(AudioExportSettings),
    Image(ImageExportSettings),
    Sequence(ImageSequenceSettings),
}

/// Fully-resolved video settings plus what normalization decided about the
/// encode route.
#[derive(Debug, Clone)]
pub struct NormalizedVideoSettings {
    pub settings: VideoExportSettings,
    /// The requested codec was substituted (e.g. ProRes on a platform with
    /// no encodable path in any target container).
    pub substituted: bool,
    /// No native encoder exists for the chosen codec; the software fallback
    /// batch path must carry the run.
    pub needs_fallback: bool,
    pub acceleration: Acceleration,
}

/// Quality applied when substituting a professional codec with a
/// broadly-supported one.
const SUBSTITUTION_QUALITY: u8 = 95;

/// Merge, substitute, clamp. Returns a new normalized copy; `partial` is
/// untouched.
pub fn normalize(
    partial: &PartialVideoSettings,
    prober: &dyn CapabilityProber,
    tuning: &PipelineTuning,
) -> Result<NormalizedVideoSettings, ExportError> {
    let mut s = partial.merged();
    let mut substituted = false;

    if s.width == 0 || s.height == 0 {
        return Err(ExportError::invalid_settings("resolution must be non-zero"));
    }
    if !(s.frame_rate.is_finite() && s.frame_rate > 0.0) {
        return Err(ExportError::invalid_settings(format!(
            "invalid frame rate: {}",
            s.frame_rate
        )));
    }
    s.audio.validate()?;

    // ProRes has no encodable path in any of the target containers on the
    // platforms we run on; it silently maps to H.264/MP4 at a high-quality
    // bitrate so the user still gets a master-grade file.
    if s.codec == VideoCodec::ProRes {
        s.codec = VideoCodec::H264;
        s.format = VideoFormat::Mp4;
        s.prores_profile = None;
        s.bitrate = tuning.high_quality_bitrate;
        s.quality = SUBSTITUTION_QUALITY;
        s.audio.format = AudioFormat::Aac;
        substituted = true;
    }

    // A codec the container does not claim gets swapped for the container's
    // preferred one.
    if !s.format.supported_video_codecs().contains(&s.codec) {
        s.codec = s.format.supported_video_codecs()[0];
        substituted = true;
    }

    // Safety clamp: codecs that destabilize at very high pixel counts are
    // downscaled into their budget, preserving aspect ratio.
    let budget = tuning.pixel_budget(s.codec);
    let pixels = s.width as u64 * s.height as u64;
    if pixels > budget {
        let scale = (budget as f64 / pixels as f64).sqrt();
        s.width = ((s.width as f64 * scale) as u32).max(2);
        s.height = ((s.height as f64 * scale) as u32).max(2);
    }
    // Even dimensions for 4:2:0 subsampling.
    s.width &= !1;
    s.height &= !1;

    let acceleration = prober.acceleration(s.codec);
    let mut needs_fallback = acceleration == Acceleration::None;
    if needs_fallback {
        // One probe pass at normalization time; never re-probed after a
        // failure mid-run.
        if let Some(best) = prober.best_video_codec(s.width, s.height) {
            if s.format.supported_video_codecs().contains(&best) {
                s.codec = best;
                substituted = true;
                needs_fallback = false;
            }
        }
    }

    let (audio_codec, audio_bitrate) = media_io::resolve_audio_codec(
        prober,
        s.audio.format.codec(),
        s.audio.bitrate,
        s.audio.channels,
        s.audio.sample_rate,
        s.format.supported_audio_codecs(),
    );
    s.audio.bitrate = audio_bitrate;
    if audio_codec != s.audio.format.codec() {
        s.audio.format = match audio_codec {
            AudioCodec::Aac => AudioFormat::Aac,
            AudioCodec::Opus | AudioCodec::Vorbis => AudioFormat::Ogg,
            AudioCodec::Mp3 => AudioFormat::Mp3,
            AudioCodec::Flac => AudioFormat::Flac,
            AudioCodec::Pcm => AudioFormat::Wav,
        };
    }

    let acceleration = prober.acceleration(s.codec);
    Ok(NormalizedVideoSettings {
        settings: s,
        substituted,
        needs_fallback,
        acceleration,
    })
}
