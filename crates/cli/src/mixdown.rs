//! Audio mixdown backed by per-clip f32le decodes. Each audio-bearing clip
//! is decoded at the target channel layout and sample rate, gain-scaled, and
//! summed into one interleaved buffer.

use std::process::{Command, Stdio};

use timeline::{ClipKind, Sequence};
use tracing::warn;

use pipeline::{AudioMixdown, PcmBuffer};

pub struct FfmpegMixdown;

impl FfmpegMixdown {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FfmpegMixdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a clip's audio intersects the requested range: the source seek
/// position, the source span to decode, and the offset (in output frames)
/// where the decoded samples land.
pub fn source_window(
    clip_start: f64,
    clip_end: f64,
    in_offset_sec: f64,
    speed: f64,
    range_start: f64,
    range_end: f64,
    sample_rate: u32,
) -> Option<(f64, f64, usize)> {
    let overlap_start = clip_start.max(range_start);
    let overlap_end = clip_end.min(range_end);
    if overlap_end <= overlap_start {
        return None;
    }
    let seek = in_offset_sec + (overlap_start - clip_start) * speed;
    let source_span = (overlap_end - overlap_start) * speed;
    let offset_frames = ((overlap_start - range_start) * sample_rate as f64).round() as usize;
    Some((seek, source_span, offset_frames))
}

/// Sum gain-scaled samples into the mix at a frame offset, clamping at the
/// mix boundary.
pub fn mix_into(mix: &mut [f32], samples: &[f32], offset_samples: usize, gain: f32) {
    for (i, s) in samples.iter().enumerate() {
        let Some(slot) = mix.get_mut(offset_samples + i) else {
            break;
        };
        *slot = (*slot + s * gain).clamp(-1.0, 1.0);
    }
}

fn decode_f32le(
    src: &str,
    seek_sec: f64,
    span_sec: f64,
    speed: f64,
    channels: u32,
    sample_rate: u32,
) -> Result<Vec<f32>, String> {
    let ffmpeg = media_io::ffmpeg_path().map_err(|e| e.to_string())?;
    let mut cmd = Command::new(ffmpeg);
    cmd.arg("-ss")
        .arg(format!("{seek_sec:.6}"))
        .arg("-t")
        .arg(format!("{span_sec:.6}"))
        .arg("-i")
        .arg(src);
    if let Some(af) = pipeline::fallback::audio_speed_filter(speed) {
        cmd.arg("-af").arg(af);
    }
    let out = cmd
        .arg("-ac")
        .arg(channels.to_string())
        .arg("-ar")
        .arg(sample_rate.to_string())
        .arg("-f")
        .arg("f32le")
        .arg("-")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .map_err(|e| format!("decode spawn failed: {e}"))?;
    if !out.status.success() {
        return Err(format!("decode of {src} failed: {:?}", out.status));
    }
    Ok(out
        .stdout
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

impl AudioMixdown for FfmpegMixdown {
    fn mixdown(
        &mut self,
        sequence: &Sequence,
        start_sec: f64,
        end_sec: f64,
        channels: u32,
        sample_rate: u32,
    ) -> Result<PcmBuffer, String> {
        let frames = ((end_sec - start_sec) * sample_rate as f64).round() as usize;
        let mut mix = vec![0.0f32; frames * channels as usize];

        for track in sequence.tracks.iter().filter(|t| !t.muted) {
            for clip in &track.clips {
                let (src, in_offset_sec, speed, gain) = match &clip.kind {
                    ClipKind::Audio {
                        src,
                        in_offset_sec,
                        speed,
                        gain,
                    } => (src, *in_offset_sec, *speed, *gain as f32),
                    ClipKind::Video {
                        src,
                        in_offset_sec,
                        speed,
                    } => (src, *in_offset_sec, *speed, 1.0),
                    _ => continue,
                };
                let Some((seek, span, offset_frames)) = source_window(
                    clip.start_sec,
                    clip.end_sec(),
                    in_offset_sec,
                    speed,
                    start_sec,
                    end_sec,
                    sample_rate,
                ) else {
                    continue;
                };
                match decode_f32le(src, seek, span, speed, channels, sample_rate) {
                    Ok(samples) => {
                        mix_into(&mut mix, &samples, offset_frames * channels as usize, gain);
                    }
                    // A missing or audio-less source mutes that clip, it does
                    // not fail the mixdown.
                    Err(e) => warn!("{e}"),
                }
            }
        }

        Ok(PcmBuffer {
            samples: mix,
            channels,
            sample_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_none_outside_the_range() {
        assert!(source_window(10.0, 12.0, 0.0, 1.0, 0.0, 5.0, 48_000).is_none());
    }

    #[test]
    fn window_maps_timeline_to_source_time() {
        // Clip at 2..6s, trimmed 1s into its source: exporting 4..10s should
        // decode source 3..5s and land at output frame 0.
        let (seek, span, offset) = source_window(2.0, 6.0, 1.0, 1.0, 4.0, 10.0, 48_000).unwrap();
        assert_eq!(seek, 3.0);
        assert_eq!(span, 2.0);
        assert_eq!(offset, 0);
    }

    #[test]
    fn window_accounts_for_speed() {
        // 2x speed: one output second consumes two source seconds.
        let (seek, span, offset) = source_window(0.0, 3.0, 0.0, 2.0, 1.0, 3.0, 48_000).unwrap();
        assert_eq!(seek, 2.0);
        assert_eq!(span, 4.0);
        assert_eq!(offset, 48_000);
    }

    #[test]
    fn mixing_sums_and_clamps() {
        let mut mix = vec![0.5f32; 4];
        mix_into(&mut mix, &[0.25, 0.25, 1.0, -2.0], 0, 1.0);
        assert_eq!(mix, vec![0.75, 0.75, 1.0, -1.0]);
    }

    #[test]
    fn mixing_respects_offset_and_bounds() {
        let mut mix = vec![0.0f32; 4];
        mix_into(&mut mix, &[0.1, 0.2, 0.3, 0.4], 2, 0.5);
        // Last two source samples fall off the end of the mix.
        assert_eq!(mix, vec![0.0, 0.0, 0.05, 0.1]);
    }
}
