use serde::{Deserialize, Serialize};
use thiserror::Error;

mod markers;
pub use markers::*;

#[derive(Debug, Error)]
pub enum TimelineError {
    #[error("invalid clip: {0}")]
    InvalidClip(String),
    #[error("track not found: {0}")]
    TrackNotFound(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Fps {
    pub num: u32,
    pub den: u32,
}

impl Fps {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    pub fn as_f64(&self) -> f64 {
        self.num.max(1) as f64 / self.den.max(1) as f64
    }
}

/// 2D placement of a clip on the canvas. Identity means the clip fills the
/// frame untouched, which matters for the stream-copy shortcut.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Transform {
    pub x: f64,
    pub y: f64,
    pub scale: f64,
    pub rotation: f64,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            scale: 1.0,
            rotation: 0.0,
        }
    }
}

impl Transform {
    pub fn is_identity(&self) -> bool {
        self.x == 0.0 && self.y == 0.0 && self.scale == 1.0 && self.rotation == 0.0
    }
}

fn default_speed() -> f64 {
    1.0
}

fn default_gain() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClipKind {
    #[serde(rename = "video")]
    Video {
        src: String,
        #[serde(default)]
        in_offset_sec: f64,
        #[serde(default = "default_speed")]
        speed: f64,
    },

    #[serde(rename = "image")]
    Image { src: String },

    #[serde(rename = "solid")]
    Solid { color: String },

    #[serde(rename = "audio")]
    Audio {
        src: String,
        #[serde(default)]
        in_offset_sec: f64,
        #[serde(default = "default_speed")]
        speed: f64,
        #[serde(default = "default_gain")]
        gain: f64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clip {
    pub id: String,
    pub start_sec: f64,
    pub duration_sec: f64,
    #[serde(flatten)]
    pub kind: ClipKind,
    /// Effect identifiers applied to this clip, in order.
    #[serde(default)]
    pub effects: Vec<String>,
    #[serde(default)]
    pub transform: Option<Transform>,
}

impl Clip {
    pub fn end_sec(&self) -> f64 {
        self.start_sec + self.duration_sec
    }

    /// Playback speed factor; 1.0 for kinds that have no time axis.
    pub fn speed(&self) -> f64 {
        match &self.kind {
            ClipKind::Video { speed, .. } | ClipKind::Audio { speed, .. } => *speed,
            ClipKind::Image { .. } | ClipKind::Solid { .. } => 1.0,
        }
    }

    pub fn source_path(&self) -> Option<&str> {
        match &self.kind {
            ClipKind::Video { src, .. }
            | ClipKind::Image { src }
            | ClipKind::Audio { src, .. } => Some(src),
            ClipKind::Solid { .. } => None,
        }
    }

    pub fn has_effects(&self) -> bool {
        !self.effects.is_empty()
    }

    pub fn has_identity_transform(&self) -> bool {
        self.transform.map(|t| t.is_identity()).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub name: String,
    #[serde(default)]
    pub muted: bool,
    pub clips: Vec<Clip>,
}

/// Overlay elements (titles, graphics, subtitles). These live outside the
/// track list because the editing front-ends keep them in separate stores;
/// export duration must account for them all the same.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OverlayKind {
    Text { text: String, color: String },
    Graphic { src: String },
    Subtitle { text: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayItem {
    pub id: String,
    pub start_sec: f64,
    pub duration_sec: f64,
    #[serde(flatten)]
    pub kind: OverlayKind,
}

impl OverlayItem {
    pub fn end_sec(&self) -> f64 {
        self.start_sec + self.duration_sec
    }
}

/// An immutable snapshot of everything the export pipeline needs: tracks,
/// overlay elements, and markers, plus the project canvas and frame rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub fps: Fps,
    #[serde(default)]
    pub tracks: Vec<Track>,
    #[serde(default)]
    pub overlays: Vec<OverlayItem>,
    #[serde(default)]
    pub markers: Vec<Marker>,
}

impl Sequence {
    pub fn new(name: impl Into<String>, width: u32, height: u32, fps: Fps) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            fps,
            tracks: Vec::new(),
            overlays: Vec::new(),
            markers: Vec::new(),
        }
    }

    pub fn add_track(&mut self, track: Track) {
        self.tracks.push(track);
    }

    /// Exportable duration: the maximum end time across all track clips,
    /// overlay items, and marker positions. There is deliberately no stored
    /// duration field to consult; overlays and markers are tracked in
    /// separate collections and a stored value goes stale.
    pub fn content_end_sec(&self) -> f64 {
        let mut end: f64 = 0.0;
        for track in &self.tracks {
            for clip in &track.clips {
                end = end.max(clip.end_sec());
            }
        }
        for overlay in &self.overlays {
            end = end.max(overlay.end_sec());
        }
        for marker in &self.markers {
            end = end.max(marker.at_sec);
        }
        end
    }

    /// Returns the sole clip when the sequence holds exactly one clip across
    /// all tracks and no overlay elements. Feeds strategy selection.
    pub fn single_clip(&self) -> Option<&Clip> {
        if !self.overlays.is_empty() {
            return None;
        }
        let mut found: Option<&Clip> = None;
        for track in &self.tracks {
            for clip in &track.clips {
                if found.is_some() {
                    return None;
                }
                found = Some(clip);
            }
        }
        found
    }

    pub fn audio_clips(&self) -> impl Iterator<Item = (&Track, &Clip)> {
        self.tracks.iter().flat_map(|t| {
            t.clips
                .iter()
                .filter(|c| matches!(c.kind, ClipKind::Audio { .. } | ClipKind::Video { .. }))
                .map(move |c| (t, c))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_clip(id: &str, start: f64, dur: f64) -> Clip {
        Clip {
            id: id.to_string(),
            start_sec: start,
            duration_sec: dur,
            kind: ClipKind::Video {
                src: "a.mp4".to_string(),
                in_offset_sec: 0.0,
                speed: 1.0,
            },
            effects: Vec::new(),
            transform: None,
        }
    }

    #[test]
    fn content_end_covers_clips_overlays_and_markers() {
        let mut seq = Sequence::new("test", 1920, 1080, Fps::new(30, 1));
        seq.add_track(Track {
            name: "V1".to_string(),
            muted: false,
            clips: vec![video_clip("c1", 0.0, 4.0)],
        });
        assert_eq!(seq.content_end_sec(), 4.0);

        seq.overlays.push(OverlayItem {
            id: "o1".to_string(),
            start_sec: 3.0,
            duration_sec: 5.0,
            kind: OverlayKind::Text {
                text: "title".to_string(),
                color: "#FFFFFF".to_string(),
            },
        });
        assert_eq!(seq.content_end_sec(), 8.0);

        seq.markers.push(Marker::new(10.5, "chapter"));
        assert_eq!(seq.content_end_sec(), 10.5);
    }

    #[test]
    fn content_end_is_zero_for_empty_sequence() {
        let seq = Sequence::new("empty", 1280, 720, Fps::new(24, 1));
        assert_eq!(seq.content_end_sec(), 0.0);
    }

    #[test]
    fn single_clip_requires_exactly_one_and_no_overlays() {
        let mut seq = Sequence::new("test", 1920, 1080, Fps::new(30, 1));
        seq.add_track(Track {
            name: "V1".to_string(),
            muted: false,
            clips: vec![video_clip("c1", 0.0, 4.0)],
        });
        assert!(seq.single_clip().is_some());

        let mut two = seq.clone();
        two.tracks[0].clips.push(video_clip("c2", 4.0, 2.0));
        assert!(two.single_clip().is_none());

        let mut with_overlay = seq.clone();
        with_overlay.overlays.push(OverlayItem {
            id: "o1".to_string(),
            start_sec: 0.0,
            duration_sec: 1.0,
            kind: OverlayKind::Subtitle {
                text: "hi".to_string(),
            },
        });
        assert!(with_overlay.single_clip().is_none());
    }

    #[test]
    fn identity_transform_detection() {
        let mut clip = video_clip("c1", 0.0, 1.0);
        assert!(clip.has_identity_transform());
        clip.transform = Some(Transform::default());
        assert!(clip.has_identity_transform());
        clip.transform = Some(Transform {
            scale: 1.5,
            ..Transform::default()
        });
        assert!(!clip.has_identity_transform());
    }

    #[test]
    fn sequence_roundtrips_through_json() {
        let mut seq = Sequence::new("rt", 1920, 1080, Fps::new(30000, 1001));
        seq.add_track(Track {
            name: "V1".to_string(),
            muted: false,
            clips: vec![video_clip("c1", 0.5, 2.5)],
        });
        let json = serde_json::to_string(&seq).unwrap();
        let back: Sequence = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tracks[0].clips[0].id, "c1");
        assert!((back.fps.as_f64() - 29.97).abs() < 0.01);
    }
}
