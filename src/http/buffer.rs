use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};

/// Outcome of a blocking pop.
#[derive(Debug, PartialEq, Eq)]
pub enum Pop {
    Segment(Bytes),
    /// Timed out with nothing sealed yet.
    Empty,
    /// Stopped and fully drained.
    Closed,
}

struct QueueState {
    sealed: VecDeque<Bytes>,
    current: BytesMut,
    stopped: bool,
}

/// FIFO of byte segments between one producer and one consumer.
///
/// The producer fills a current segment; once it reaches `segment_size` it
/// is sealed and becomes visible to the consumer. Consumers never observe a
/// partially filled segment.
pub struct BufferQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
    segment_size: usize,
}

impl BufferQueue {
    pub fn new(segment_size: usize) -> Self {
        let segment_size = segment_size.max(1);
        Self {
            state: Mutex::new(QueueState {
                sealed: VecDeque::new(),
                current: BytesMut::with_capacity(segment_size),
                stopped: false,
            }),
            ready: Condvar::new(),
            segment_size,
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Appends to the current segment, sealing each one that fills up.
    ///
    /// Returns the number of bytes accepted: all of `data`, or zero once the
    /// queue is stopped.
    pub fn write(&self, mut data: &[u8]) -> usize {
        let mut state = self.state();
        if state.stopped {
            return 0;
        }
        let accepted = data.len();
        let mut sealed_any = false;

        while !data.is_empty() {
            let room = self.segment_size - state.current.len();
            let take = room.min(data.len());
            state.current.extend_from_slice(&data[..take]);
            data = &data[take..];

            if state.current.len() == self.segment_size {
                let full = state.current.split().freeze();
                state.sealed.push_back(full);
                state.current.reserve(self.segment_size);
                sealed_any = true;
            }
        }

        drop(state);
        if sealed_any {
            self.ready.notify_all();
        }
        accepted
    }

    /// Queues `segment` ahead of everything already queued.
    pub fn push_front(&self, segment: Bytes) {
        if segment.is_empty() {
            return;
        }
        self.state().sealed.push_front(segment);
        self.ready.notify_all();
    }

    /// Seals the current segment, then queues `segment` after it.
    pub fn push_back(&self, segment: Bytes) {
        let mut state = self.state();
        Self::seal_current(&mut state);
        if !segment.is_empty() {
            state.sealed.push_back(segment);
        }
        drop(state);
        self.ready.notify_all();
    }

    /// Makes a partially filled current segment visible to the consumer.
    pub fn seal(&self) {
        Self::seal_current(&mut self.state());
        self.ready.notify_all();
    }

    fn seal_current(state: &mut QueueState) {
        if !state.current.is_empty() {
            let partial = state.current.split().freeze();
            state.sealed.push_back(partial);
        }
    }

    /// Seals the current segment and refuses further writes.
    pub fn stop(&self) {
        let mut state = self.state();
        Self::seal_current(&mut state);
        state.stopped = true;
        drop(state);
        self.ready.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.state().stopped
    }

    pub fn try_pop(&self) -> Option<Bytes> {
        self.state().sealed.pop_front()
    }

    /// Waits up to `timeout` for a sealed segment.
    pub fn pop_timeout(&self, timeout: Duration) -> Pop {
        let deadline = Instant::now() + timeout;
        let mut state = self.state();
        loop {
            if let Some(segment) = state.sealed.pop_front() {
                return Pop::Segment(segment);
            }
            if state.stopped {
                return Pop::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return Pop::Empty;
            }
            state = match self.ready.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Discards everything queued, sealed or not.
    pub fn clear(&self) {
        let mut state = self.state();
        state.sealed.clear();
        state.current.clear();
    }

    /// Clears the queue and accepts writes again.
    pub fn reset(&self) {
        let mut state = self.state();
        state.sealed.clear();
        state.current.clear();
        state.stopped = false;
    }

    /// True when nothing is queued, including the unsealed current segment.
    pub fn is_drained(&self) -> bool {
        let state = self.state();
        state.sealed.is_empty() && state.current.is_empty()
    }

    /// Bytes currently queued, sealed or not.
    pub fn buffered(&self) -> usize {
        let state = self.state();
        state.sealed.iter().map(Bytes::len).sum::<usize>() + state.current.len()
    }
}

/// Request body as a byte stream over a [`BufferQueue`].
pub struct Body {
    queue: std::sync::Arc<BufferQueue>,
    pending: Bytes,
    timeout: Duration,
}

impl Body {
    pub fn new(queue: std::sync::Arc<BufferQueue>, timeout: Duration) -> Self {
        Self {
            queue,
            pending: Bytes::new(),
            timeout,
        }
    }

    /// A body with no bytes.
    pub fn empty() -> Self {
        let queue = BufferQueue::new(1);
        queue.stop();
        Self::new(std::sync::Arc::new(queue), Duration::ZERO)
    }

    /// Reads the remaining body into memory.
    pub fn to_vec(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.read_to_end(&mut out)?;
        Ok(out)
    }
}

impl Read for Body {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        while self.pending.is_empty() {
            match self.queue.pop_timeout(self.timeout) {
                Pop::Segment(segment) => self.pending = segment,
                Pop::Closed => return Ok(0),
                Pop::Empty => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "timed out waiting for request body",
                    ));
                }
            }
        }
        let n = dst.len().min(self.pending.len());
        dst[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        Ok(n)
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Body")
            .field("pending", &self.pending.len())
            .finish()
    }
}
