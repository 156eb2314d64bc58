//! Headless timeline export pipeline: settings normalization, strategy
//! selection (stream copy / worker encode channel / batch fallback), progress
//! and cancellation, and output targets.

pub mod controller;
pub mod error;
pub mod fallback;
pub mod frame;
pub mod progress;
pub mod settings;
pub mod sink;
pub mod tuning;
pub mod wav;
pub mod worker;

pub use controller::{
    select_backend, stream_copy_eligible, total_frame_count, EncodeBackend, ExportPipeline,
};
pub use error::{ErrorCode, ExportError};
pub use frame::{AudioMixdown, FrameRenderer, FrameTask, PcmBuffer};
pub use progress::{
    CancelToken, ExportOutput, ExportPhase, ExportProgress, ExportResult, ExportStats,
    ProgressEmitter,
};
pub use settings::{
    AudioExportSettings, AudioFormat, BitrateMode, ExportSettings, ImageExportSettings,
    ImageFormat, ImageSequenceSettings, NormalizedVideoSettings, PartialVideoSettings,
    ProResProfile, UpscaleSettings, VideoExportSettings, VideoFormat,
};
pub use sink::{FileSink, MemorySink, OutputTarget, StreamingSink};
pub use tuning::PipelineTuning;
pub use worker::{EncodeChannel, InFlightGate, WorkerEvent, WorkerInit, WorkerRequest};
