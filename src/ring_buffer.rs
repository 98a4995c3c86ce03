//! The thread-safe circular buffer that sits between a capture source and
//! the processing loop. Samples are stored interleaved, one frame holding
//! one sample per channel.
//!
//! Writes never block: whatever does not fit is dropped and the caller is
//! told how many frames made it in. Reads never block either; the one place
//! a thread waits is [RingBuffer::wait_for_read], which always gives up
//! after a timeout so that a cancelled pipeline can shut down.

use log::trace;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Things that go wrong when building or using a [RingBuffer].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RingBufferError {
    /// Capacity must be at least one frame
    ZeroCapacity,
    /// There must be at least one channel
    ZeroChannels,
    /// A slice of samples did not hold a whole number of frames
    PartialFrame {
        /// Number of samples handed in
        samples: usize,
        /// Channel count of the buffer
        channels: usize,
    },
    /// More frames were requested than are available
    Underflow {
        /// Frames asked for
        requested: usize,
        /// Frames that were there
        available: usize,
    },
}

impl fmt::Display for RingBufferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RingBufferError::ZeroCapacity => write!(f, "ring buffer capacity must be positive"),
            RingBufferError::ZeroChannels => write!(f, "ring buffer needs at least one channel"),
            RingBufferError::PartialFrame { samples, channels } => write!(
                f,
                "{} samples is not a whole number of {}-channel frames",
                samples, channels
            ),
            RingBufferError::Underflow {
                requested,
                available,
            } => write!(
                f,
                "requested {} frames but only {} are available",
                requested, available
            ),
        }
    }
}

impl std::error::Error for RingBufferError {}

/// Cursor state, only ever touched with the lock held.
#[derive(Debug)]
struct State {
    data: Box<[f32]>,
    write_pos: usize,
    read_pos: usize,
    count: usize,
}

/// A fixed capacity, multichannel ring buffer for one producer and one
/// consumer. Share it between threads behind an `Arc`.
#[derive(Debug)]
pub struct RingBuffer {
    state: Mutex<State>,
    readable: Condvar,
    capacity: usize,
    n_channels: usize,
}

impl RingBuffer {
    /// Allocates a buffer holding `capacity` frames of `n_channels` samples.
    /// This is the only allocation the buffer ever makes.
    pub fn new(capacity: usize, n_channels: usize) -> Result<Self, RingBufferError> {
        if capacity == 0 {
            return Err(RingBufferError::ZeroCapacity);
        }
        if n_channels == 0 {
            return Err(RingBufferError::ZeroChannels);
        }
        Ok(Self {
            state: Mutex::new(State {
                data: vec![0.0; capacity * n_channels].into_boxed_slice(),
                write_pos: 0,
                read_pos: 0,
                count: 0,
            }),
            readable: Condvar::new(),
            capacity,
            n_channels,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn n_channels(&self) -> usize {
        self.n_channels
    }

    // A panic while holding the lock cannot leave the cursors half updated,
    // so a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Frames that can be read right now.
    pub fn available_read(&self) -> usize {
        self.lock().count
    }

    /// Frames that can be written right now.
    pub fn available_write(&self) -> usize {
        self.capacity - self.lock().count
    }

    /// Copies as many whole frames from `samples` as fit, and returns how
    /// many frames were written. The rest are dropped.
    pub fn write(&self, samples: &[f32]) -> Result<usize, RingBufferError> {
        if samples.len() % self.n_channels != 0 {
            return Err(RingBufferError::PartialFrame {
                samples: samples.len(),
                channels: self.n_channels,
            });
        }
        let requested = samples.len() / self.n_channels;

        let mut state = self.lock();
        let n_frames = requested.min(self.capacity - state.count);
        let mut pos = state.write_pos;
        let mut remaining = &samples[..n_frames * self.n_channels];
        while !remaining.is_empty() {
            // copy up to the end of the backing store, then wrap
            let run = (self.capacity - pos).min(remaining.len() / self.n_channels);
            let (head, tail) = remaining.split_at(run * self.n_channels);
            let start = pos * self.n_channels;
            state.data[start..start + head.len()].copy_from_slice(head);
            pos = (pos + run) % self.capacity;
            remaining = tail;
        }
        state.write_pos = pos;
        state.count += n_frames;
        drop(state);

        if n_frames < requested {
            trace!("ring buffer full, dropped {} frames", requested - n_frames);
        }
        if n_frames > 0 {
            self.readable.notify_all();
        }
        Ok(n_frames)
    }

    /// Reads exactly `count` frames. Asking for more than
    /// [RingBuffer::available_read] is an error and leaves the buffer alone.
    pub fn read(&self, count: usize) -> Result<Vec<f32>, RingBufferError> {
        let mut out = vec![0.0; count * self.n_channels];
        self.read_into(&mut out)?;
        Ok(out)
    }

    /// Fills `out` with the next `out.len() / n_channels` frames.
    pub fn read_into(&self, out: &mut [f32]) -> Result<(), RingBufferError> {
        if out.len() % self.n_channels != 0 {
            return Err(RingBufferError::PartialFrame {
                samples: out.len(),
                channels: self.n_channels,
            });
        }
        let count = out.len() / self.n_channels;

        let mut state = self.lock();
        if count > state.count {
            return Err(RingBufferError::Underflow {
                requested: count,
                available: state.count,
            });
        }
        let mut pos = state.read_pos;
        let mut remaining = &mut out[..];
        while !remaining.is_empty() {
            let run = (self.capacity - pos).min(remaining.len() / self.n_channels);
            let (head, tail) = std::mem::take(&mut remaining).split_at_mut(run * self.n_channels);
            let start = pos * self.n_channels;
            head.copy_from_slice(&state.data[start..start + head.len()]);
            pos = (pos + run) % self.capacity;
            remaining = tail;
        }
        state.read_pos = pos;
        state.count -= count;
        Ok(())
    }

    /// Drains every unread frame.
    pub fn read_whole_buffer(&self) -> Vec<f32> {
        let mut out = vec![0.0; self.available_read() * self.n_channels];
        // single consumer, so what was available is still there
        match self.read_into(&mut out) {
            Ok(()) => out,
            Err(_) => Vec::new(),
        }
    }

    /// Blocks until at least `count` frames are readable or `timeout`
    /// passes. Returns whether the frames are there; a timeout is a normal
    /// outcome, not an error.
    pub fn wait_for_read(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.count < count {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.readable.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
        true
    }

    /// Maps interleaved `in_channels` data onto `out_channels`. Output
    /// channel `j` copies input channel `min(j, in_channels - 1)`, so a mono
    /// output is a channel-0 passthrough and extra outputs repeat the last
    /// input channel.
    pub fn reduce_channels(data: &[f32], in_channels: usize, out_channels: usize) -> Vec<f32> {
        if in_channels == 0 || out_channels == 0 {
            return Vec::new();
        }
        if in_channels == out_channels {
            return data.to_vec();
        }
        data.chunks_exact(in_channels)
            .flat_map(|frame| (0..out_channels).map(move |j| frame[j.min(in_channels - 1)]))
            .collect()
    }
}
