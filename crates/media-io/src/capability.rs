//! Runtime capability probing: which video/audio codecs can actually be
//! encoded on this machine, and at what acceleration tier.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoCodec {
    H264,
    H265,
    Vp8,
    Vp9,
    Av1,
    ProRes,
}

impl VideoCodec {
    /// Software encoder names ffmpeg may expose for this codec, in
    /// preference order.
    pub fn software_encoders(&self) -> &'static [&'static str] {
        match self {
            VideoCodec::H264 => &["libx264"],
            VideoCodec::H265 => &["libx265"],
            VideoCodec::Vp8 => &["libvpx"],
            VideoCodec::Vp9 => &["libvpx-vp9"],
            VideoCodec::Av1 => &["libsvtav1", "libaom-av1"],
            VideoCodec::ProRes => &["prores_ks", "prores"],
        }
    }

    pub fn hardware_encoders(&self) -> &'static [&'static str] {
        match self {
            VideoCodec::H264 => &[
                "h264_videotoolbox",
                "h264_nvenc",
                "h264_qsv",
                "h264_vaapi",
            ],
            VideoCodec::H265 => &[
                "hevc_videotoolbox",
                "hevc_nvenc",
                "hevc_qsv",
                "hevc_vaapi",
            ],
            VideoCodec::Vp8 => &["vp8_vaapi"],
            VideoCodec::Vp9 => &["vp9_vaapi", "vp9_qsv"],
            VideoCodec::Av1 => &["av1_nvenc", "av1_qsv", "av1_vaapi"],
            VideoCodec::ProRes => &["prores_videotoolbox"],
        }
    }

    /// Codecs whose encoders hold large per-instance state and destabilize
    /// at very high pixel counts; settings normalization clamps these harder.
    pub fn is_memory_hungry(&self) -> bool {
        matches!(self, VideoCodec::H265 | VideoCodec::Av1 | VideoCodec::ProRes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioCodec {
    Aac,
    Opus,
    Mp3,
    Flac,
    Vorbis,
    Pcm,
}

impl AudioCodec {
    pub fn encoder_name(&self) -> &'static str {
        match self {
            AudioCodec::Aac => "aac",
            AudioCodec::Opus => "libopus",
            AudioCodec::Mp3 => "libmp3lame",
            AudioCodec::Flac => "flac",
            AudioCodec::Vorbis => "libvorbis",
            AudioCodec::Pcm => "pcm_s16le",
        }
    }

    /// Valid encode bitrate range in bits/sec. Lossless and PCM codecs
    /// ignore bitrate entirely.
    pub fn bitrate_range(&self) -> Option<(u32, u32)> {
        match self {
            AudioCodec::Aac => Some((8_000, 512_000)),
            AudioCodec::Opus => Some((6_000, 510_000)),
            AudioCodec::Mp3 => Some((32_000, 320_000)),
            AudioCodec::Vorbis => Some((45_000, 500_000)),
            AudioCodec::Flac | AudioCodec::Pcm => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Acceleration {
    Hardware,
    Software,
    None,
}

/// Queries the runtime for encodable codecs. Injected into the pipeline so
/// tests can substitute a deterministic implementation.
pub trait CapabilityProber: Send + Sync {
    /// Best encodable video codec for the given output resolution, or None
    /// when nothing on this machine can encode video at all.
    fn best_video_codec(&self, width: u32, height: u32) -> Option<VideoCodec>;

    fn best_audio_codec(&self) -> Option<AudioCodec>;

    fn is_audio_config_supported(
        &self,
        codec: AudioCodec,
        bitrate: u32,
        channels: u32,
        sample_rate: u32,
    ) -> bool;

    fn acceleration(&self, codec: VideoCodec) -> Acceleration;

    /// Concrete encoder name to hand an encode job for this codec. Defaults
    /// to the first software encoder; probers that see hardware override it.
    fn encoder_name(&self, codec: VideoCodec) -> Option<&'static str> {
        codec.software_encoders().first().copied()
    }
}

const VIDEO_PREFERENCE: &[VideoCodec] = &[
    VideoCodec::H264,
    VideoCodec::Vp9,
    VideoCodec::H265,
    VideoCodec::Av1,
    VideoCodec::Vp8,
];

const AUDIO_PREFERENCE: &[AudioCodec] = &[AudioCodec::Aac, AudioCodec::Opus, AudioCodec::Mp3];

/// Fixed audio fallback chain tried after the requested codec (spec: a
/// widely-compatible lossy codec, then a second, then a third).
pub const AUDIO_FALLBACK_CODECS: &[AudioCodec] =
    &[AudioCodec::Aac, AudioCodec::Opus, AudioCodec::Mp3];

/// Bitrate tiers probed per codec, after the requested bitrate.
pub const AUDIO_FALLBACK_BITRATES: &[u32] = &[192_000, 128_000, 96_000];

/// Bitrate used when every probe combination fails.
pub const SAFE_DEFAULT_AUDIO_BITRATE: u32 = 128_000;

const SUPPORTED_SAMPLE_RATES: &[u32] = &[44_100, 48_000, 96_000];

/// Prober backed by `ffmpeg -encoders`, parsed once at construction.
pub struct FfmpegProber {
    encoders: String,
    video: HashMap<VideoCodec, Acceleration>,
}

impl FfmpegProber {
    pub fn new() -> Result<Self, crate::ProbeError> {
        let ffmpeg = crate::ffmpeg_path()?;
        let out = Command::new(ffmpeg)
            .arg("-hide_banner")
            .arg("-encoders")
            .output()
            .map_err(|e| crate::ProbeError::FfprobeFailed(e.to_string()))?;
        Ok(Self::from_encoder_list(&String::from_utf8_lossy(
            &out.stdout,
        )))
    }

    /// Build from a raw `ffmpeg -encoders` listing. Split out so tests can
    /// feed canned listings without an ffmpeg binary.
    pub fn from_encoder_list(listing: &str) -> Self {
        let mut video = HashMap::new();
        for codec in [
            VideoCodec::H264,
            VideoCodec::H265,
            VideoCodec::Vp8,
            VideoCodec::Vp9,
            VideoCodec::Av1,
            VideoCodec::ProRes,
        ] {
            let hw = codec.hardware_encoders().iter().any(|e| listing.contains(e));
            let sw = codec.software_encoders().iter().any(|e| listing.contains(e));
            let tier = if hw {
                Acceleration::Hardware
            } else if sw {
                Acceleration::Software
            } else {
                Acceleration::None
            };
            if tier != Acceleration::None {
                debug!(?codec, ?tier, "encoder available");
            }
            video.insert(codec, tier);
        }
        Self {
            encoders: listing.to_string(),
            video,
        }
    }

    /// Concrete encoder name to hand ffmpeg for a codec, preferring hardware.
    pub fn encoder_for(&self, codec: VideoCodec) -> Option<&'static str> {
        codec
            .hardware_encoders()
            .iter()
            .chain(codec.software_encoders())
            .find(|e| self.encoders.contains(*e))
            .copied()
    }
}

impl CapabilityProber for FfmpegProber {
    fn best_video_codec(&self, width: u32, height: u32) -> Option<VideoCodec> {
        let pixels = width as u64 * height as u64;
        // H.264 levels top out around 4K; above that prefer the newer codecs.
        let order: &[VideoCodec] = if pixels > 4096 * 2304 {
            &[
                VideoCodec::H265,
                VideoCodec::Av1,
                VideoCodec::Vp9,
                VideoCodec::H264,
            ]
        } else {
            VIDEO_PREFERENCE
        };
        order
            .iter()
            .find(|c| self.video.get(c).copied().unwrap_or(Acceleration::None) != Acceleration::None)
            .copied()
    }

    fn best_audio_codec(&self) -> Option<AudioCodec> {
        AUDIO_PREFERENCE
            .iter()
            .find(|c| self.encoders.contains(c.encoder_name()))
            .copied()
    }

    fn is_audio_config_supported(
        &self,
        codec: AudioCodec,
        bitrate: u32,
        channels: u32,
        sample_rate: u32,
    ) -> bool {
        if !self.encoders.contains(codec.encoder_name()) {
            return false;
        }
        if !(1..=2).contains(&channels) || !SUPPORTED_SAMPLE_RATES.contains(&sample_rate) {
            return false;
        }
        match codec.bitrate_range() {
            Some((lo, hi)) => bitrate >= lo && bitrate <= hi,
            None => true,
        }
    }

    fn acceleration(&self, codec: VideoCodec) -> Acceleration {
        self.video
            .get(&codec)
            .copied()
            .unwrap_or(Acceleration::None)
    }

    fn encoder_name(&self, codec: VideoCodec) -> Option<&'static str> {
        self.encoder_for(codec)
    }
}

/// Deterministic table-driven prober for tests and constrained environments.
#[derive(Debug, Clone, Default)]
pub struct StaticProber {
    video: HashMap<VideoCodec, Acceleration>,
    audio: Vec<AudioCodec>,
    max_audio_bitrate: Option<u32>,
}

impl StaticProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// A prober that mirrors a typical desktop: software H.264/VP9/AAC/Opus.
    pub fn typical_software() -> Self {
        Self::new()
            .with_video(VideoCodec::H264, Acceleration::Software)
            .with_video(VideoCodec::Vp8, Acceleration::Software)
            .with_video(VideoCodec::Vp9, Acceleration::Software)
            .with_audio(AudioCodec::Aac)
            .with_audio(AudioCodec::Opus)
            .with_audio(AudioCodec::Mp3)
    }

    pub fn with_video(mut self, codec: VideoCodec, tier: Acceleration) -> Self {
        self.video.insert(codec, tier);
        self
    }

    pub fn with_audio(mut self, codec: AudioCodec) -> Self {
        self.audio.push(codec);
        self
    }

    /// Reject audio configs above this bitrate, regardless of codec range.
    pub fn with_max_audio_bitrate(mut self, bitrate: u32) -> Self {
        self.max_audio_bitrate = Some(bitrate);
        self
    }
}

impl CapabilityProber for StaticProber {
    fn best_video_codec(&self, _width: u32, _height: u32) -> Option<VideoCodec> {
        VIDEO_PREFERENCE
            .iter()
            .find(|c| self.video.get(c).copied().unwrap_or(Acceleration::None) != Acceleration::None)
            .copied()
    }

    fn best_audio_codec(&self) -> Option<AudioCodec> {
        AUDIO_PREFERENCE
            .iter()
            .find(|c| self.audio.contains(c))
            .copied()
    }

    fn is_audio_config_supported(
        &self,
        codec: AudioCodec,
        bitrate: u32,
        channels: u32,
        sample_rate: u32,
    ) -> bool {
        if !self.audio.contains(&codec) {
            return false;
        }
        if !(1..=2).contains(&channels) || !SUPPORTED_SAMPLE_RATES.contains(&sample_rate) {
            return false;
        }
        if let Some(max) = self.max_audio_bitrate {
            if bitrate > max {
                return false;
            }
        }
        match codec.bitrate_range() {
            Some((lo, hi)) => bitrate >= lo && bitrate <= hi,
            None => true,
        }
    }

    fn acceleration(&self, codec: VideoCodec) -> Acceleration {
        self.video
            .get(&codec)
            .copied()
            .unwrap_or(Acceleration::None)
    }
}

/// Pick a workable audio codec/bitrate pair: the requested codec first, then
/// the fixed fallback list, each probed at the requested bitrate and then at
/// decreasing tiers. Falls back to the container's first claimed codec at a
/// safe default bitrate when every probe fails.
pub fn resolve_audio_codec(
    prober: &dyn CapabilityProber,
    requested: AudioCodec,
    bitrate: u32,
    channels: u32,
    sample_rate: u32,
    allowed_by_format: &[AudioCodec],
) -> (AudioCodec, u32) {
    let mut candidates = vec![requested];
    for c in AUDIO_FALLBACK_CODECS {
        if !candidates.contains(c) {
            candidates.push(*c);
        }
    }

    for codec in candidates {
        let mut tiers = vec![bitrate];
        tiers.extend(AUDIO_FALLBACK_BITRATES.iter().filter(|b| **b != bitrate));
        for tier in tiers {
            if prober.is_audio_config_supported(codec, tier, channels, sample_rate) {
                return (codec, tier);
            }
        }
    }

    let fallback = allowed_by_format.first().copied().unwrap_or(requested);
    (fallback, SAFE_DEFAULT_AUDIO_BITRATE)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESKTOP_LISTING: &str = "\
 V..... libx264              H.264 / AVC / MPEG-4 AVC\n\
 V..... libx265              H.265 / HEVC\n\
 V..... libvpx-vp9           VP9\n\
 A..... aac                  AAC (Advanced Audio Coding)\n\
 A..... libopus              Opus\n\
 A..... libmp3lame           MP3 (MPEG audio layer 3)\n";

    const HW_LISTING: &str = "\
 V..... libx264              H.264 / AVC\n\
 V..... h264_videotoolbox    VideoToolbox H.264\n\
 A..... aac                  AAC\n";

    #[test]
    fn ffmpeg_prober_parses_software_tiers() {
        let p = FfmpegProber::from_encoder_list(DESKTOP_LISTING);
        assert_eq!(p.acceleration(VideoCodec::H264), Acceleration::Software);
        assert_eq!(p.acceleration(VideoCodec::Av1), Acceleration::None);
        assert_eq!(p.best_video_codec(1920, 1080), Some(VideoCodec::H264));
        assert_eq!(p.best_audio_codec(), Some(AudioCodec::Aac));
    }

    #[test]
    fn ffmpeg_prober_detects_hardware_tier() {
        let p = FfmpegProber::from_encoder_list(HW_LISTING);
        assert_eq!(p.acceleration(VideoCodec::H264), Acceleration::Hardware);
        assert_eq!(p.encoder_for(VideoCodec::H264), Some("h264_videotoolbox"));
    }

    #[test]
    fn best_video_codec_prefers_newer_codecs_above_4k() {
        let p = FfmpegProber::from_encoder_list(DESKTOP_LISTING);
        // 8K exceeds the H.264 tier cutoff; H.265 is available here.
        assert_eq!(p.best_video_codec(7680, 4320), Some(VideoCodec::H265));
    }

    #[test]
    fn no_encoders_means_no_codec() {
        let p = FfmpegProber::from_encoder_list("");
        assert_eq!(p.best_video_codec(1920, 1080), None);
        assert_eq!(p.best_audio_codec(), None);
    }

    #[test]
    fn audio_config_validation() {
        let p = FfmpegProber::from_encoder_list(DESKTOP_LISTING);
        assert!(p.is_audio_config_supported(AudioCodec::Aac, 192_000, 2, 48_000));
        assert!(!p.is_audio_config_supported(AudioCodec::Aac, 192_000, 6, 48_000));
        assert!(!p.is_audio_config_supported(AudioCodec::Aac, 192_000, 2, 22_050));
        assert!(!p.is_audio_config_supported(AudioCodec::Mp3, 1_000_000, 2, 48_000));
    }

    #[test]
    fn resolve_audio_keeps_requested_when_supported() {
        let p = StaticProber::typical_software();
        let (codec, bitrate) =
            resolve_audio_codec(&p, AudioCodec::Opus, 160_000, 2, 48_000, &[AudioCodec::Aac]);
        assert_eq!(codec, AudioCodec::Opus);
        assert_eq!(bitrate, 160_000);
    }

    #[test]
    fn resolve_audio_steps_down_bitrate_tiers() {
        let p = StaticProber::new()
            .with_audio(AudioCodec::Aac)
            .with_max_audio_bitrate(128_000);
        let (codec, bitrate) =
            resolve_audio_codec(&p, AudioCodec::Aac, 320_000, 2, 48_000, &[AudioCodec::Aac]);
        assert_eq!(codec, AudioCodec::Aac);
        assert_eq!(bitrate, 128_000);
    }

    #[test]
    fn resolve_audio_falls_back_across_codecs() {
        let p = StaticProber::new().with_audio(AudioCodec::Mp3);
        let (codec, _) =
            resolve_audio_codec(&p, AudioCodec::Opus, 192_000, 2, 48_000, &[AudioCodec::Aac]);
        assert_eq!(codec, AudioCodec::Mp3);
    }

    #[test]
    fn resolve_audio_uses_format_default_when_all_probes_fail() {
        let p = StaticProber::new();
        let (codec, bitrate) =
            resolve_audio_codec(&p, AudioCodec::Opus, 192_000, 2, 48_000, &[AudioCodec::Vorbis]);
        assert_eq!(codec, AudioCodec::Vorbis);
        assert_eq!(bitrate, SAFE_DEFAULT_AUDIO_BITRATE);
    }
}
