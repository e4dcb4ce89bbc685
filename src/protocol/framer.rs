use std::time::{Duration, Instant};

use super::types::Frame;

/// Reassembles newline-terminated frames from arbitrarily sized chunks.
///
/// A partial line that sits without its newline for longer than the
/// deadline is flushed as a best-effort frame so callers never wait on a
/// controller that stopped mid-line.
#[derive(Debug)]
pub struct LineFramer {
    buffer: Vec<u8>,
    line_started: Option<Instant>,
    deadline: Duration,
    max_line_bytes: usize,
}

impl LineFramer {
    pub fn new(deadline: Duration, max_line_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            line_started: None,
            deadline,
            max_line_bytes: max_line_bytes.max(1),
        }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Bytes held for the line currently being assembled.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    pub fn push(&mut self, chunk: &[u8], now: Instant) -> Vec<Frame> {
        let mut frames = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                frames.push(Frame::from_bytes(&self.buffer));
                self.buffer.clear();
                self.line_started = None;
                continue;
            }
            if self.buffer.is_empty() {
                self.line_started = Some(now);
            }
            self.buffer.push(byte);
            if self.buffer.len() >= self.max_line_bytes {
                log::warn!("Line exceeded {} bytes without a newline, flushing", self.max_line_bytes);
                frames.push(Frame::from_bytes(&self.buffer));
                self.buffer.clear();
                self.line_started = None;
            }
        }
        frames
    }

    /// When the pending partial line will be force-flushed, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.line_started.map(|t| t + self.deadline)
    }

    /// Flushes the partial line if its deadline has passed.
    pub fn poll_timeout(&mut self, now: Instant) -> Option<Frame> {
        let due = self.next_deadline()?;
        if now < due {
            return None;
        }
        let frame = Frame::from_bytes(&self.buffer);
        log::trace!("Line deadline elapsed, flushing partial frame {:?}", frame.as_str());
        self.buffer.clear();
        self.line_started = None;
        Some(frame)
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.line_started = None;
    }
}
