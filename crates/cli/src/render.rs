//! CPU frame renderer: composites the topmost visible clip plus active
//! overlays into an RGBA frame. Decoded stills are cached; the pipeline's
//! scheduled `release_caches` keeps the cache from growing unbounded.

use std::collections::HashMap;
use std::path::Path;
use std::process::{Command, Stdio};

use image::imageops::FilterType;
use image::{Rgba, RgbaImage};
use timeline::{Clip, ClipKind, OverlayKind, Sequence};
use tracing::warn;

use pipeline::FrameRenderer;

pub struct CpuRenderer {
    stills: HashMap<String, RgbaImage>,
}

impl CpuRenderer {
    pub fn new() -> Self {
        Self {
            stills: HashMap::new(),
        }
    }

    fn still(&mut self, src: &str) -> Option<RgbaImage> {
        if let Some(img) = self.stills.get(src) {
            return Some(img.clone());
        }
        match image::open(src) {
            Ok(img) => {
                let rgba = img.to_rgba8();
                self.stills.insert(src.to_string(), rgba.clone());
                Some(rgba)
            }
            Err(e) => {
                warn!("failed to decode {src}: {e}");
                None
            }
        }
    }

    fn paint_clip(&mut self, frame: &mut RgbaImage, clip: &Clip, timestamp_sec: f64) {
        let (w, h) = (frame.width(), frame.height());
        match &clip.kind {
            ClipKind::Solid { color } => {
                let px = parse_hex_color(color);
                for p in frame.pixels_mut() {
                    *p = px;
                }
            }
            ClipKind::Image { src } => {
                if let Some(img) = self.still(src) {
                    let scaled = image::imageops::resize(&img, w, h, FilterType::Triangle);
                    image::imageops::overlay(frame, &scaled, 0, 0);
                }
            }
            ClipKind::Video {
                src,
                in_offset_sec,
                speed,
            } => {
                let source_ts = in_offset_sec + (timestamp_sec - clip.start_sec) * speed;
                match extract_video_frame(src, source_ts) {
                    Some(img) => {
                        let scaled = image::imageops::resize(&img, w, h, FilterType::Triangle);
                        image::imageops::overlay(frame, &scaled, 0, 0);
                    }
                    None => warn!("no frame from {src} at {source_ts:.3}s"),
                }
            }
            ClipKind::Audio { .. } => {}
        }
    }

    fn paint_overlays(&mut self, frame: &mut RgbaImage, sequence: &Sequence, timestamp_sec: f64) {
        let (w, h) = (frame.width(), frame.height());
        for overlay in &sequence.overlays {
            if timestamp_sec < overlay.start_sec || timestamp_sec >= overlay.end_sec() {
                continue;
            }
            match &overlay.kind {
                OverlayKind::Graphic { src } => {
                    if let Some(img) = self.still(src) {
                        image::imageops::overlay(frame, &img, 0, 0);
                    }
                }
                // Placeholder band where a text renderer would draw.
                OverlayKind::Text { .. } | OverlayKind::Subtitle { .. } => {
                    let band_top = h.saturating_sub(h / 8);
                    for y in band_top..h {
                        for x in 0..w {
                            blend(frame.get_pixel_mut(x, y), Rgba([16, 16, 16, 200]));
                        }
                    }
                }
            }
        }
    }
}

impl Default for CpuRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameRenderer for CpuRenderer {
    fn render(
        &mut self,
        sequence: &Sequence,
        timestamp_sec: f64,
        width: u32,
        height: u32,
    ) -> Result<RgbaImage, String> {
        let mut frame = RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 255]));

        // Topmost track wins; tracks later in the list sit above earlier ones.
        let top_clip = sequence
            .tracks
            .iter()
            .rev()
            .filter(|t| !t.muted)
            .flat_map(|t| t.clips.iter())
            .find(|c| {
                timestamp_sec >= c.start_sec
                    && timestamp_sec < c.end_sec()
                    && !matches!(c.kind, ClipKind::Audio { .. })
            });
        if let Some(clip) = top_clip {
            self.paint_clip(&mut frame, clip, timestamp_sec);
        }
        self.paint_overlays(&mut frame, sequence, timestamp_sec);
        Ok(frame)
    }

    fn release_caches(&mut self) {
        self.stills.clear();
    }
}

fn blend(dst: &mut Rgba<u8>, src: Rgba<u8>) {
    let a = src.0[3] as u32;
    for i in 0..3 {
        let d = dst.0[i] as u32;
        let s = src.0[i] as u32;
        dst.0[i] = ((s * a + d * (255 - a)) / 255) as u8;
    }
}

pub fn parse_hex_color(color: &str) -> Rgba<u8> {
    let hex = color.trim_start_matches('#');
    if hex.len() != 6 {
        return Rgba([0, 0, 0, 255]);
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).unwrap_or(0);
    Rgba([channel(0), channel(2), channel(4), 255])
}

/// One-frame extract at a source timestamp, decoded from a PNG pipe.
fn extract_video_frame(src: &str, timestamp_sec: f64) -> Option<RgbaImage> {
    let ffmpeg = media_io::ffmpeg_path().ok()?;
    let out = Command::new(ffmpeg)
        .arg("-ss")
        .arg(format!("{:.3}", timestamp_sec.max(0.0)))
        .arg("-i")
        .arg(Path::new(src))
        .arg("-frames:v")
        .arg("1")
        .arg("-f")
        .arg("image2pipe")
        .arg("-vcodec")
        .arg("png")
        .arg("pipe:1")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !out.status.success() || out.stdout.is_empty() {
        return None;
    }
    image::load_from_memory(&out.stdout)
        .ok()
        .map(|img| img.to_rgba8())
}

#[cfg(test)]
mod tests {
    use super::*;
    use timeline::{Fps, Track};

    fn solid_clip(color: &str, start: f64, duration: f64) -> Clip {
        Clip {
            id: format!("solid-{color}"),
            start_sec: start,
            duration_sec: duration,
            kind: ClipKind::Solid {
                color: color.to_string(),
            },
            effects: Vec::new(),
            transform: None,
        }
    }

    #[test]
    fn hex_colors_parse() {
        assert_eq!(parse_hex_color("#FF0080"), Rgba([255, 0, 128, 255]));
        assert_eq!(parse_hex_color("00ff00"), Rgba([0, 255, 0, 255]));
        assert_eq!(parse_hex_color("bogus"), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn solid_clip_fills_the_frame() {
        let mut seq = Sequence::new("t", 64, 36, Fps { num: 30, den: 1 });
        seq.add_track(Track {
            name: "v1".into(),
            muted: false,
            clips: vec![solid_clip("#102030", 0.0, 5.0)],
        });
        let mut r = CpuRenderer::new();
        let frame = r.render(&seq, 1.0, 64, 36).unwrap();
        assert_eq!(*frame.get_pixel(0, 0), Rgba([16, 32, 48, 255]));
    }

    #[test]
    fn topmost_track_wins() {
        let mut seq = Sequence::new("t", 8, 8, Fps { num: 30, den: 1 });
        seq.add_track(Track {
            name: "bottom".into(),
            muted: false,
            clips: vec![solid_clip("#FF0000", 0.0, 5.0)],
        });
        seq.add_track(Track {
            name: "top".into(),
            muted: false,
            clips: vec![solid_clip("#0000FF", 0.0, 5.0)],
        });
        let mut r = CpuRenderer::new();
        let frame = r.render(&seq, 1.0, 8, 8).unwrap();
        assert_eq!(*frame.get_pixel(4, 4), Rgba([0, 0, 255, 255]));
    }

    #[test]
    fn muted_track_is_skipped() {
        let mut seq = Sequence::new("t", 8, 8, Fps { num: 30, den: 1 });
        seq.add_track(Track {
            name: "bottom".into(),
            muted: false,
            clips: vec![solid_clip("#FF0000", 0.0, 5.0)],
        });
        seq.add_track(Track {
            name: "top".into(),
            muted: true,
            clips: vec![solid_clip("#0000FF", 0.0, 5.0)],
        });
        let mut r = CpuRenderer::new();
        let frame = r.render(&seq, 1.0, 8, 8).unwrap();
        assert_eq!(*frame.get_pixel(4, 4), Rgba([255, 0, 0, 255]));
    }

    #[test]
    fn out_of_range_timestamp_is_black() {
        let mut seq = Sequence::new("t", 8, 8, Fps { num: 30, den: 1 });
        seq.add_track(Track {
            name: "v1".into(),
            muted: false,
            clips: vec![solid_clip("#FFFFFF", 0.0, 1.0)],
        });
        let mut r = CpuRenderer::new();
        let frame = r.render(&seq, 2.0, 8, 8).unwrap();
        assert_eq!(*frame.get_pixel(0, 0), Rgba([0, 0, 0, 255]));
    }
}
