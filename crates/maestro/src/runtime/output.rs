//! Captured child process output

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

/// Lines retained per process
pub const DEFAULT_OUTPUT_LINES: usize = 1000;

/// Which pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug)]
struct OutputBuffer {
    lines: VecDeque<String>,
    /// Absolute index of `lines[0]`
    first_index: usize,
    capacity: usize,
}

/// Bounded, line-indexed buffer of a process's stdout and stderr
#[derive(Debug, Clone)]
pub struct OutputLog {
    buffer: Arc<Mutex<OutputBuffer>>,
}

impl Default for OutputLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_OUTPUT_LINES)
    }
}

impl OutputLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(OutputBuffer {
                lines: VecDeque::new(),
                first_index: 0,
                capacity: capacity.max(1),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, OutputBuffer> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append one line, evicting the oldest when full
    pub fn push(&self, line: impl Into<String>) {
        let mut buffer = self.lock();
        if buffer.lines.len() == buffer.capacity {
            buffer.lines.pop_front();
            buffer.first_index += 1;
        }
        buffer.lines.push_back(line.into());
    }

    /// Total number of lines ever written
    pub fn len(&self) -> usize {
        let buffer = self.lock();
        buffer.first_index + buffer.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Up to `n` lines starting at absolute line `from`.
    ///
    /// Lines already evicted are skipped; reading past the end yields nothing.
    pub fn lines(&self, from: usize, n: usize) -> Vec<String> {
        let buffer = self.lock();
        let start = from.saturating_sub(buffer.first_index);
        buffer.lines.iter().skip(start).take(n).cloned().collect()
    }

    /// The last `n` lines
    pub fn tail(&self, n: usize) -> Vec<String> {
        let buffer = self.lock();
        let skip = buffer.lines.len().saturating_sub(n);
        buffer.lines.iter().skip(skip).cloned().collect()
    }

    /// Forward every line of `reader` to the log facade and into this buffer
    pub fn capture<R>(&self, name: String, reader: R, stream: OutputStream) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let log = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match stream {
                    OutputStream::Stdout => log::info!("[{}] {}", name, line),
                    OutputStream::Stderr => log::warn!("[{}] {}", name, line),
                }
                log.push(line);
            }
        })
    }
}
