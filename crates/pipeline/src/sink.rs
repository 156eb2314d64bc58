//! Output targets: an in-memory growable buffer or a sequential streaming
//! sink that takes ordered, positioned writes and is terminated by exactly
//! one close() or abort().

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

/// A sequential streaming destination. Writes arrive with monotonically
/// increasing positions; implementations must treat close() and abort() as
/// mutually exclusive terminals.
pub trait StreamingSink: Send {
    fn write(&mut self, position: u64, data: &[u8]) -> std::io::Result<()>;

    /// Successful terminal: flush and commit.
    fn close(&mut self) -> std::io::Result<()>;

    /// Failure terminal: the partial output must be marked invalid (here:
    /// removed). Never called after close().
    fn abort(&mut self) -> std::io::Result<()>;
}

/// Streams to a file on disk, deleting the partial file on abort.
pub struct FileSink {
    file: Option<File>,
    path: std::path::PathBuf,
}

impl FileSink {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            file: Some(File::create(path)?),
            path: path.to_path_buf(),
        })
    }
}

impl StreamingSink for FileSink {
    fn write(&mut self, position: u64, data: &[u8]) -> std::io::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| std::io::Error::other("sink already terminated"))?;
        file.seek(SeekFrom::Start(position))?;
        file.write_all(data)
    }

    fn close(&mut self) -> std::io::Result<()> {
        match self.file.take() {
            Some(mut f) => f.flush(),
            None => Err(std::io::Error::other("sink already terminated")),
        }
    }

    fn abort(&mut self) -> std::io::Result<()> {
        if self.file.take().is_some() {
            std::fs::remove_file(&self.path)
        } else {
            Err(std::io::Error::other("sink already terminated"))
        }
    }
}

/// Test sink that records everything it is handed.
#[derive(Default, Clone)]
pub struct MemorySink {
    inner: Arc<Mutex<MemorySinkState>>,
}

#[derive(Default)]
struct MemorySinkState {
    data: Vec<u8>,
    positions: Vec<u64>,
    closed: bool,
    aborted: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.inner.lock().data.clone()
    }

    pub fn positions(&self) -> Vec<u64> {
        self.inner.lock().positions.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.lock().aborted
    }
}

impl StreamingSink for MemorySink {
    fn write(&mut self, position: u64, data: &[u8]) -> std::io::Result<()> {
        let mut state = self.inner.lock();
        if state.closed || state.aborted {
            return Err(std::io::Error::other("sink already terminated"));
        }
        let end = position as usize + data.len();
        if state.data.len() < end {
            state.data.resize(end, 0);
        }
        state.data[position as usize..end].copy_from_slice(data);
        state.positions.push(position);
        Ok(())
    }

    fn close(&mut self) -> std::io::Result<()> {
        let mut state = self.inner.lock();
        if state.closed || state.aborted {
            return Err(std::io::Error::other("sink already terminated"));
        }
        state.closed = true;
        Ok(())
    }

    fn abort(&mut self) -> std::io::Result<()> {
        let mut state = self.inner.lock();
        if state.closed || state.aborted {
            return Err(std::io::Error::other("sink already terminated"));
        }
        state.aborted = true;
        Ok(())
    }
}

/// Where encoded bytes end up: a growable in-memory buffer, or a streaming
/// sink that received them already.
pub enum OutputTarget {
    Memory(Vec<u8>),
    Stream(Box<dyn StreamingSink>),
}

impl OutputTarget {
    pub fn memory() -> Self {
        OutputTarget::Memory(Vec::new())
    }

    pub fn stream(sink: impl StreamingSink + 'static) -> Self {
        OutputTarget::Stream(Box::new(sink))
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, OutputTarget::Stream(_))
    }

    pub fn write_chunk(&mut self, position: u64, data: &[u8]) -> std::io::Result<()> {
        match self {
            OutputTarget::Memory(buf) => {
                let end = position as usize + data.len();
                if buf.len() < end {
                    buf.resize(end, 0);
                }
                buf[position as usize..end].copy_from_slice(data);
                Ok(())
            }
            OutputTarget::Stream(sink) => sink.write(position, data),
        }
    }

    /// Successful terminal. Returns the buffered bytes for the in-memory
    /// target; None when a sink consumed them.
    pub fn finish(self) -> std::io::Result<Option<Vec<u8>>> {
        match self {
            OutputTarget::Memory(buf) => Ok(Some(buf)),
            OutputTarget::Stream(mut sink) => {
                sink.close()?;
                Ok(None)
            }
        }
    }

    /// Failure terminal: streaming sinks are aborted, not closed, so the
    /// partial file is signalled invalid.
    pub fn abort(self) {
        if let OutputTarget::Stream(mut sink) = self {
            if let Err(e) = sink.abort() {
                tracing::warn!("sink abort failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_target_accumulates_positioned_writes() {
        let mut target = OutputTarget::memory();
        target.write_chunk(0, b"abcd").unwrap();
        target.write_chunk(4, b"ef").unwrap();
        assert_eq!(target.finish().unwrap().unwrap(), b"abcdef");
    }

    #[test]
    fn stream_target_returns_no_buffer() {
        let sink = MemorySink::new();
        let probe = sink.clone();
        let mut target = OutputTarget::stream(sink);
        target.write_chunk(0, b"xyz").unwrap();
        assert!(target.finish().unwrap().is_none());
        assert!(probe.is_closed());
        assert!(!probe.is_aborted());
        assert_eq!(probe.bytes(), b"xyz");
    }

    #[test]
    fn abort_marks_sink_invalid_without_close() {
        let sink = MemorySink::new();
        let probe = sink.clone();
        let target = OutputTarget::stream(sink);
        target.abort();
        assert!(probe.is_aborted());
        assert!(!probe.is_closed());
    }

    #[test]
    fn sink_rejects_use_after_terminal() {
        let mut sink = MemorySink::new();
        sink.close().unwrap();
        assert!(sink.write(0, b"x").is_err());
        assert!(sink.abort().is_err());
    }

    #[test]
    fn file_sink_abort_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        let mut sink = FileSink::create(&path).unwrap();
        sink.write(0, b"partial").unwrap();
        assert!(path.exists());
        sink.abort().unwrap();
        assert!(!path.exists());
    }
}
