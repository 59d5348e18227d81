//! Lock-free queues between the audio callbacks and the pipeline threads
//!
//! Both directions use a bounded `ArrayQueue` so the real-time callbacks
//! never take a lock:
//!
//! - [`CaptureQueue`]: microphone callback -> send pipeline. Overflow drops
//!   the oldest block.
//! - [`PlaybackBuffer`]: receive pipeline -> speaker callback. This is the
//!   jitter buffer. Overflow drops the oldest frame, underrun plays silence
//!   and re-primes to the target depth.

use crossbeam::queue::ArrayQueue;
use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::audio::frame::AudioFrame;

/// Samples reserved in each pooled capture block
const BLOCK_RESERVE: usize = 4096;

/// Blocks in the pool beyond the queue capacity: one being filled by the
/// callback and one being drained by the pipeline
const SPARE_BLOCKS: usize = 2;

/// Bounded queue of hardware-rate mono blocks from the capture callback.
///
/// Blocks come from a preallocated pool. The callback takes one with
/// [`Self::take_block`], fills it and pushes it; the consumer hands it back
/// with [`Self::recycle`], so steady-state capture does not allocate.
pub struct CaptureQueue {
    queue: ArrayQueue<Vec<f32>>,
    pool: ArrayQueue<Vec<f32>>,
    overflow_count: AtomicU64,
}

impl CaptureQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let pool = ArrayQueue::new(capacity + SPARE_BLOCKS);
        for _ in 0..pool.capacity() {
            let _ = pool.push(Vec::with_capacity(BLOCK_RESERVE));
        }
        Self {
            queue: ArrayQueue::new(capacity),
            pool,
            overflow_count: AtomicU64::new(0),
        }
    }

    /// An empty block from the pool, or a new one if the pool ran dry
    pub fn take_block(&self) -> Vec<f32> {
        self.pool
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(BLOCK_RESERVE))
    }

    /// Return a consumed block to the pool
    pub fn recycle(&self, mut block: Vec<f32>) {
        block.clear();
        let _ = self.pool.push(block);
    }

    /// Push a block, evicting the oldest one when full.
    /// Returns false if a block was evicted.
    pub fn push(&self, block: Vec<f32>) -> bool {
        match self.queue.force_push(block) {
            None => true,
            Some(evicted) => {
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
                self.recycle(evicted);
                false
            }
        }
    }

    /// Blocks ready in the pool
    pub fn pooled(&self) -> usize {
        self.pool.len()
    }

    pub fn pop(&self) -> Option<Vec<f32>> {
        self.queue.pop()
    }

    /// Pop a block, waiting up to `timeout` for one to arrive
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Vec<f32>> {
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        loop {
            if let Some(block) = self.queue.pop() {
                return Some(block);
            }
            if Instant::now() >= deadline {
                return None;
            }
            if backoff.is_completed() {
                thread::sleep(Duration::from_micros(500));
            } else {
                backoff.snooze();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Blocks evicted because the pipeline fell behind
    pub fn overflow_count(&self) -> u64 {
        self.overflow_count.load(Ordering::Relaxed)
    }
}

pub type SharedCaptureQueue = Arc<CaptureQueue>;

/// Collects variable-size blocks into fixed-size frames
pub struct SampleAccumulator {
    pending: Vec<f32>,
    frame_len: usize,
}

impl SampleAccumulator {
    pub fn new(frame_len: usize) -> Self {
        Self {
            pending: Vec::with_capacity(frame_len * 2),
            frame_len,
        }
    }

    pub fn push(&mut self, samples: &[f32]) {
        self.pending.extend_from_slice(samples);
    }

    /// Take the next complete frame, if one is available
    pub fn next_frame(&mut self) -> Option<Vec<f32>> {
        if self.frame_len == 0 || self.pending.len() < self.frame_len {
            return None;
        }
        Some(self.pending.drain(..self.frame_len).collect())
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Jitter buffer of hardware-rate frames waiting for the speaker
pub struct PlaybackBuffer {
    queue: ArrayQueue<AudioFrame>,
    target_depth: usize,
    primed: AtomicBool,
    dropped: AtomicU64,
    underruns: AtomicU64,
}

impl PlaybackBuffer {
    /// `max_depth` bounds latency; playback (re)starts once `target_depth`
    /// frames are queued.
    pub fn new(target_depth: usize, max_depth: usize) -> Self {
        let max_depth = max_depth.max(1);
        Self {
            queue: ArrayQueue::new(max_depth),
            target_depth: target_depth.clamp(1, max_depth),
            primed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
        }
    }

    /// Queue a frame, dropping the oldest one when the bound is reached
    pub fn push_frame(&self, frame: AudioFrame) -> bool {
        match self.queue.force_push(frame) {
            None => true,
            Some(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Pop regardless of priming state
    pub fn pop_frame(&self) -> Option<AudioFrame> {
        self.queue.pop()
    }

    /// Next frame for the speaker, honouring the priming depth
    pub fn next_for_playback(&self) -> Option<AudioFrame> {
        if !self.primed.load(Ordering::Relaxed) {
            if self.queue.len() < self.target_depth {
                return None;
            }
            self.primed.store(true, Ordering::Relaxed);
        }

        match self.queue.pop() {
            Some(frame) => Some(frame),
            None => {
                self.primed.store(false, Ordering::Relaxed);
                self.underruns.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn depth(&self) -> usize {
        self.queue.len()
    }

    pub fn max_depth(&self) -> usize {
        self.queue.capacity()
    }

    pub fn target_depth(&self) -> usize {
        self.target_depth
    }

    pub fn is_primed(&self) -> bool {
        self.primed.load(Ordering::Relaxed)
    }

    /// Frames discarded to keep latency bounded
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Times the speaker found the buffer empty after playback began
    pub fn underrun_count(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }
}

pub type SharedPlaybackBuffer = Arc<PlaybackBuffer>;

/// Speaker-side read position inside the frame currently being played.
///
/// Owned by the output callback; turns whole frames into arbitrary-size
/// device buffers.
pub struct PlaybackCursor {
    current: Option<AudioFrame>,
    position: usize,
    silent_samples: u64,
}

impl PlaybackCursor {
    pub fn new() -> Self {
        Self {
            current: None,
            position: 0,
            silent_samples: 0,
        }
    }

    /// Fill `out` with mono samples, emitting silence when the buffer is dry
    pub fn fill(&mut self, buffer: &PlaybackBuffer, out: &mut [f32]) {
        let mut written = 0;
        while written < out.len() {
            let exhausted = match &self.current {
                Some(frame) => self.position >= frame.len(),
                None => true,
            };
            if exhausted {
                self.current = buffer.next_for_playback();
                self.position = 0;
                if self.current.is_none() {
                    let rest = &mut out[written..];
                    rest.fill(0.0);
                    self.silent_samples += rest.len() as u64;
                    return;
                }
            }

            if let Some(frame) = &self.current {
                let available = &frame.samples()[self.position..];
                let n = available.len().min(out.len() - written);
                out[written..written + n].copy_from_slice(&available[..n]);
                self.position += n;
                written += n;
            }
        }
    }

    /// Samples of silence emitted so far
    pub fn silent_samples(&self) -> u64 {
        self.silent_samples
    }
}

impl Default for PlaybackCursor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_queue_drops_oldest() {
        let queue = CaptureQueue::new(2);

        assert!(queue.push(vec![1.0]));
        assert!(queue.push(vec![2.0]));
        assert!(!queue.push(vec![3.0]));
        assert_eq!(queue.overflow_count(), 1);

        assert_eq!(queue.pop().unwrap(), vec![2.0]);
        assert_eq!(queue.pop().unwrap(), vec![3.0]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_capture_blocks_are_reused() {
        let queue = CaptureQueue::new(2);
        assert_eq!(queue.pooled(), 4);

        let mut block = queue.take_block();
        assert!(block.is_empty());
        assert!(block.capacity() >= BLOCK_RESERVE);
        let addr = block.as_ptr();
        block.extend_from_slice(&[0.5; 480]);
        queue.push(block);
        assert_eq!(queue.pooled(), 3);

        let block = queue.pop().unwrap();
        assert_eq!(block.len(), 480);
        queue.recycle(block);
        assert_eq!(queue.pooled(), 4);

        // Same allocation comes back around, emptied
        let reused: Vec<_> = (0..4).map(|_| queue.take_block()).collect();
        assert!(reused.iter().any(|b| b.as_ptr() == addr));
        assert!(reused.iter().all(|b| b.is_empty()));
        // A dry pool still hands out blocks
        assert!(queue.take_block().capacity() >= BLOCK_RESERVE);
    }

    #[test]
    fn test_evicted_blocks_return_to_pool() {
        let queue = CaptureQueue::new(1);
        for _ in 0..3 {
            let mut block = queue.take_block();
            block.push(1.0);
            queue.push(block);
        }
        assert_eq!(queue.overflow_count(), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pooled(), 2);
    }

    #[test]
    fn test_capture_queue_pop_timeout() {
        let queue = CaptureQueue::new(4);
        let start = Instant::now();
        assert!(queue.pop_timeout(Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));

        queue.push(vec![0.5; 4]);
        assert_eq!(queue.pop_timeout(Duration::from_millis(20)).unwrap().len(), 4);
    }

    #[test]
    fn test_accumulator() {
        let mut acc = SampleAccumulator::new(4);
        acc.push(&[1.0, 2.0, 3.0]);
        assert!(acc.next_frame().is_none());

        acc.push(&[4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
        assert_eq!(acc.next_frame().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(acc.next_frame().unwrap(), vec![5.0, 6.0, 7.0, 8.0]);
        assert!(acc.next_frame().is_none());
        assert_eq!(acc.pending(), 1);
    }

    #[test]
    fn test_playback_priming() {
        let buffer = PlaybackBuffer::new(2, 4);

        buffer.push_frame(AudioFrame::new(vec![0.1; 4], 48000));
        assert!(buffer.next_for_playback().is_none());
        assert!(!buffer.is_primed());

        buffer.push_frame(AudioFrame::new(vec![0.2; 4], 48000));
        assert_eq!(buffer.next_for_playback().unwrap().samples()[0], 0.1);
        assert_eq!(buffer.next_for_playback().unwrap().samples()[0], 0.2);

        // Dry: underrun, then must re-prime before playing again
        assert!(buffer.next_for_playback().is_none());
        assert_eq!(buffer.underrun_count(), 1);
        buffer.push_frame(AudioFrame::new(vec![0.3; 4], 48000));
        assert!(buffer.next_for_playback().is_none());
    }

    #[test]
    fn test_playback_bound_drops_oldest() {
        let buffer = PlaybackBuffer::new(1, 3);
        for i in 0..5 {
            buffer.push_frame(AudioFrame::new(vec![i as f32; 2], 48000));
        }
        assert_eq!(buffer.depth(), 3);
        assert_eq!(buffer.dropped_count(), 2);
        assert_eq!(buffer.pop_frame().unwrap().samples()[0], 2.0);
    }

    #[test]
    fn test_cursor_spans_frames_and_pads_silence() {
        let buffer = PlaybackBuffer::new(1, 8);
        buffer.push_frame(AudioFrame::new(vec![1.0; 3], 48000));
        buffer.push_frame(AudioFrame::new(vec![2.0; 3], 48000));

        let mut cursor = PlaybackCursor::new();
        let mut out = [9.0f32; 4];
        cursor.fill(&buffer, &mut out);
        assert_eq!(out, [1.0, 1.0, 1.0, 2.0]);

        let mut out = [9.0f32; 4];
        cursor.fill(&buffer, &mut out);
        assert_eq!(out, [2.0, 2.0, 0.0, 0.0]);
        assert_eq!(cursor.silent_samples(), 2);
    }
}
