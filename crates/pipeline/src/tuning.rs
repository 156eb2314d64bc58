//! Environment-tuned pipeline defaults. These are stability/performance
//! heuristics, not correctness constraints; every call site reads them from
//! this struct so callers can override any of them per export.

use media_io::VideoCodec;

#[derive(Debug, Clone)]
pub struct PipelineTuning {
    /// Frames allowed in flight to the encode channel when buffering the
    /// output in memory.
    pub max_in_flight_buffered: usize,

    /// Frames allowed in flight when streaming to disk. The disk writer
    /// cannot overlap multiple pending encodes without reordering risk.
    pub max_in_flight_streaming: usize,

    /// Micro-yield after this many rendered frames.
    pub yield_every_frames: u64,

    /// Ask the renderer to drop its decoded-frame and media caches after
    /// this many frames.
    pub cache_release_interval: u64,

    /// Interval for polling the fallback job's progress mailbox.
    pub poll_interval_ms: u64,

    /// Chunk size for streaming encoded output to a sink.
    pub chunk_size: usize,

    /// Pixel budget for codecs whose encoders stay stable at high
    /// resolutions (H.264, VP8, VP9): 4096x2304.
    pub pixel_budget_standard: u64,

    /// Pixel budget for memory-hungry codecs (H.265, AV1, ProRes):
    /// 3840x2160. Requests above this are downscaled, preserving aspect.
    pub pixel_budget_memory_hungry: u64,

    /// Video bitrate applied when an unencodable professional codec is
    /// substituted with a broadly-supported one.
    pub high_quality_bitrate: u64,
}

impl Default for PipelineTuning {
    fn default() -> Self {
        Self {
            max_in_flight_buffered: 3,
            max_in_flight_streaming: 1,
            yield_every_frames: 4,
            cache_release_interval: 30,
            poll_interval_ms: 100,
            chunk_size: 256 * 1024,
            pixel_budget_standard: 4096 * 2304,
            pixel_budget_memory_hungry: 3840 * 2160,
            high_quality_bitrate: 50_000_000,
        }
    }
}

impl PipelineTuning {
    pub fn pixel_budget(&self, codec: VideoCodec) -> u64 {
        if codec.is_memory_hungry() {
            self.pixel_budget_memory_hungry
        } else {
            self.pixel_budget_standard
        }
    }

    /// Memory-hungry codecs yield twice as often to keep allocation spikes
    /// in check.
    pub fn yield_interval(&self, codec: VideoCodec) -> u64 {
        if codec.is_memory_hungry() {
            (self.yield_every_frames / 2).max(1)
        } else {
            self.yield_every_frames
        }
    }

    pub fn max_in_flight(&self, streaming: bool) -> usize {
        if streaming {
            self.max_in_flight_streaming
        } else {
            self.max_in_flight_buffered
        }
    }
}
