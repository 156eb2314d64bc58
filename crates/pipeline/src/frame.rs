//! Collaborator seams: the frame renderer and audio mixdown the pipeline
//! drives, plus the owned frame unit that moves into the encode channel.

use image::imageops::FilterType;
use image::RgbaImage;
use timeline::Sequence;

/// Paints one timeline timestamp to an RGBA image at the requested size.
/// Pure from the pipeline's perspective; implementations may cache decoded
/// sources internally and must drop those caches on `release_caches`.
pub trait FrameRenderer: Send {
    fn render(
        &mut self,
        sequence: &Sequence,
        timestamp_sec: f64,
        width: u32,
        height: u32,
    ) -> Result<RgbaImage, String>;

    /// Scheduled resource reclamation: the controller calls this at fixed
    /// frame intervals so decoded-frame caches cannot grow for the whole
    /// run.
    fn release_caches(&mut self) {}
}

/// Interleaved PCM, f32 samples in [-1, 1].
#[derive(Debug, Clone)]
pub struct PcmBuffer {
    pub samples: Vec<f32>,
    pub channels: u32,
    pub sample_rate: u32,
}

impl PcmBuffer {
    pub fn silence(duration_sec: f64, channels: u32, sample_rate: u32) -> Self {
        let frames = (duration_sec * sample_rate as f64).round() as usize;
        Self {
            samples: vec![0.0; frames * channels as usize],
            channels,
            sample_rate,
        }
    }

    /// Split interleaved samples into planar per-channel vectors, the shape
    /// the worker protocol carries.
    pub fn to_planar(&self) -> Vec<Vec<f32>> {
        let ch = self.channels as usize;
        let frames = self.samples.len() / ch.max(1);
        let mut planes = vec![Vec::with_capacity(frames); ch];
        for (i, s) in self.samples.iter().enumerate() {
            planes[i % ch].push(*s);
        }
        planes
    }

    pub fn from_planar(planes: &[Vec<f32>], sample_rate: u32) -> Self {
        let ch = planes.len();
        let frames = planes.iter().map(|p| p.len()).min().unwrap_or(0);
        let mut samples = Vec::with_capacity(frames * ch);
        for f in 0..frames {
            for plane in planes {
                samples.push(plane[f]);
            }
        }
        Self {
            samples,
            channels: ch as u32,
            sample_rate,
        }
    }
}

/// Renders the fully mixed timeline audio for a time range.
pub trait AudioMixdown: Send {
    fn mixdown(
        &mut self,
        sequence: &Sequence,
        start_sec: f64,
        end_sec: f64,
        channels: u32,
        sample_rate: u32,
    ) -> Result<PcmBuffer, String>;
}

/// One rendered frame on its way to an encoder. Owned and single-use: the
/// image buffer moves with the task and whichever side finishes with it last
/// drops it.
#[derive(Debug)]
pub struct FrameTask {
    pub image: RgbaImage,
    pub frame_index: u64,
    pub timestamp_sec: f64,
    pub total_frames: u64,
}

/// Lanczos upscale used when the target resolution exceeds the project's
/// native resolution and upscaling is enabled.
pub fn upscale(image: RgbaImage, width: u32, height: u32) -> RgbaImage {
    if image.width() == width && image.height() == height {
        return image;
    }
    image::imageops::resize(&image, width, height, FilterType::Lanczos3)
}
