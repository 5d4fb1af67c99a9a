//! Buffer for inbound frames that arrive before the page agent is ready.

use crate::types::protocol::PortFrame;

/// Owned buffer with explicit push/drain operations.
///
/// Drained newest-first. The LIFO order is observable behavior that page
/// listeners have come to rely on; do not quietly change it to FIFO.
///
/// Once drained the queue is abandoned for good: the live delivery path
/// takes over and later pushes are discarded.
#[derive(Debug, Default)]
pub struct MessageQueue {
    buffered: Vec<PortFrame>,
    abandoned: bool,
}

impl MessageQueue {
    pub fn new() -> Self {
        MessageQueue::default()
    }

    /// Buffer a frame. Returns `false` (frame discarded) once abandoned.
    pub fn push(&mut self, frame: PortFrame) -> bool {
        if self.abandoned {
            return false;
        }
        self.buffered.push(frame);
        true
    }

    /// Hand back everything buffered, newest first, and abandon the queue.
    pub fn drain(&mut self) -> Vec<PortFrame> {
        self.abandoned = true;
        let mut out = Vec::with_capacity(self.buffered.len());
        while let Some(frame) = self.buffered.pop() {
            out.push(frame);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.buffered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffered.is_empty()
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned
    }
}
