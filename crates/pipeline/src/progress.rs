use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Export phases in the order they occur. A run never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportPhase {
    Preparing,
    Rendering,
    Encoding,
    Muxing,
    Complete,
}

impl ExportPhase {
    pub fn rank(&self) -> u8 {
        match self {
            ExportPhase::Preparing => 0,
            ExportPhase::Rendering => 1,
            ExportPhase::Encoding => 2,
            ExportPhase::Muxing => 3,
            ExportPhase::Complete => 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportProgress {
    pub phase: ExportPhase,
    /// Completion within the current phase, 0.0..=1.0.
    pub progress: f64,
    pub eta_seconds: Option<f64>,
    pub current_frame: u64,
    pub total_frames: u64,
    pub bytes_written: u64,
    /// Observed output bitrate in bits/sec, once enough bytes have flushed.
    pub current_bitrate: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportStats {
    pub elapsed_seconds: f64,
    pub frames_rendered: u64,
    /// Average encode throughput in frames/sec.
    pub encode_fps: f64,
    pub output_bytes: u64,
    pub average_bitrate: u64,
}

/// Successful export payload. `data` is None when a streaming sink consumed
/// the bytes as they were produced.
#[derive(Debug, Clone)]
pub struct ExportOutput {
    pub data: Option<Vec<u8>>,
    pub stats: ExportStats,
}

pub type ExportResult = Result<ExportOutput, crate::error::ExportError>;

/// Cooperative cancellation flag, polled at every suspension point. Cloned
/// handles share the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

const PROGRESS_CHANNEL_CAP: usize = 64;

/// Producer half of the progress stream. Enforces forward-only phases and
/// non-decreasing progress within a phase, so consumers never observe a
/// rewind even if the underlying work reports noisy fractions.
pub struct ProgressEmitter {
    tx: Sender<ExportProgress>,
    last_phase_rank: u8,
    last_progress: f64,
}

impl ProgressEmitter {
    pub fn channel() -> (ProgressEmitter, Receiver<ExportProgress>) {
        let (tx, rx) = bounded(PROGRESS_CHANNEL_CAP);
        (
            ProgressEmitter {
                tx,
                last_phase_rank: 0,
                last_progress: 0.0,
            },
            rx,
        )
    }

    /// Emit a progress tick. Within a phase, values are clamped to be
    /// non-decreasing; phase transitions reset the floor. Ticks are dropped
    /// when the consumer lags, but phase transitions are always delivered.
    pub fn emit(&mut self, mut update: ExportProgress) {
        let rank = update.phase.rank();
        if rank < self.last_phase_rank {
            // A late event from a slower path; never move backwards.
            return;
        }
        let phase_changed = rank > self.last_phase_rank;
        if phase_changed {
            self.last_phase_rank = rank;
            self.last_progress = 0.0;
        }
        update.progress = update.progress.clamp(self.last_progress, 1.0);
        self.last_progress = update.progress;

        if phase_changed || update.phase == ExportPhase::Complete {
            // Block (with a cap) so terminal transitions cannot be lost.
            let _ = self
                .tx
                .send_timeout(update, Duration::from_millis(500));
        } else if let Err(TrySendError::Full(_)) = self.tx.try_send(update) {
            tracing::trace!("progress consumer lagging; tick dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(phase: ExportPhase, progress: f64) -> ExportProgress {
        ExportProgress {
            phase,
            progress,
            eta_seconds: None,
            current_frame: 0,
            total_frames: 0,
            bytes_written: 0,
            current_bitrate: None,
        }
    }

    #[test]
    fn phases_are_ordered() {
        assert!(ExportPhase::Preparing.rank() < ExportPhase::Rendering.rank());
        assert!(ExportPhase::Rendering.rank() < ExportPhase::Encoding.rank());
        assert!(ExportPhase::Encoding.rank() < ExportPhase::Muxing.rank());
        assert!(ExportPhase::Muxing.rank() < ExportPhase::Complete.rank());
    }

    #[test]
    fn emitter_clamps_regressions_within_phase() {
        let (mut emitter, rx) = ProgressEmitter::channel();
        emitter.emit(tick(ExportPhase::Rendering, 0.5));
        emitter.emit(tick(ExportPhase::Rendering, 0.3)); // noisy regression
        emitter.emit(tick(ExportPhase::Rendering, 0.7));

        let values: Vec<f64> = rx.try_iter().map(|p| p.progress).collect();
        assert_eq!(values, vec![0.5, 0.5, 0.7]);
    }

    #[test]
    fn emitter_drops_stale_phase_events() {
        let (mut emitter, rx) = ProgressEmitter::channel();
        emitter.emit(tick(ExportPhase::Encoding, 0.2));
        emitter.emit(tick(ExportPhase::Rendering, 0.9)); // stale, ignored
        emitter.emit(tick(ExportPhase::Muxing, 0.0));

        let phases: Vec<ExportPhase> = rx.try_iter().map(|p| p.phase).collect();
        assert_eq!(phases, vec![ExportPhase::Encoding, ExportPhase::Muxing]);
    }

    #[test]
    fn phase_transition_resets_progress_floor() {
        let (mut emitter, rx) = ProgressEmitter::channel();
        emitter.emit(tick(ExportPhase::Rendering, 0.9));
        emitter.emit(tick(ExportPhase::Encoding, 0.1));
        let values: Vec<(ExportPhase, f64)> = rx.try_iter().map(|p| (p.phase, p.progress)).collect();
        assert_eq!(values[1], (ExportPhase::Encoding, 0.1));
    }

    #[test]
    fn cancel_token_is_shared_across_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
