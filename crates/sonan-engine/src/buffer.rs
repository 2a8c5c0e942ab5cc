//! Bounded byte ring between a decode worker and its consumer.
//!
//! [`DecodeBuffer`] is the hand-off point of one input unit:
//! - decode worker → `write` (never blocks, may accept fewer bytes than offered)
//! - converter / render tick → `shift_bytes` (never blocks, returns what is there)
//!
//! A single mutex guards the ring and all flags so that `reset()`, `close()` and the
//! end-of-input signal can never race with a half-applied write. One [`Condvar`] serves as a
//! general "state changed" signal for the worker's park/retry loop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Compute a buffer capacity in bytes for `seconds` of audio at `bytes_per_second`.
///
/// - Non-finite or non-positive `seconds` fall back to 2 seconds.
/// - The result is rounded up to a whole number of `align` bytes (frames) and is never zero.
pub fn calc_buffer_bytes(bytes_per_second: usize, align: usize, seconds: f64) -> usize {
    let secs = if seconds.is_finite() && seconds > 0.0 {
        seconds
    } else {
        2.0
    };
    let align = align.max(1);
    let raw = (bytes_per_second as f64 * secs).ceil() as usize;
    raw.div_ceil(align).max(1).saturating_mul(align)
}

pub struct DecodeBuffer {
    capacity: usize,
    align: usize,
    preload_threshold: usize,
    inner: Mutex<BufferInner>,
    cv: Condvar,
    low_watermark_ms: AtomicU64,
}

struct BufferInner {
    ring: VecDeque<u8>,
    written_total: u64,
    read_total: u64,
    end_of_input: bool,
    closed: bool,
    /// Highest preload progress since the last reset.
    progress: f32,
    markers: VecDeque<SeekMarker>,
    reached: Option<f64>,
}

/// Position (in seconds) that becomes current once the reader passes `offset`.
#[derive(Clone, Copy, Debug)]
struct SeekMarker {
    offset: u64,
    seconds: f64,
}

impl DecodeBuffer {
    /// Create a buffer of `capacity` bytes. Writes are accepted in whole multiples of
    /// `align` bytes so frames never straddle a partial write.
    pub fn new(capacity: usize, align: usize, preload_threshold: usize) -> Self {
        let align = align.max(1);
        let capacity = (capacity / align).max(1) * align;
        Self {
            capacity,
            align,
            preload_threshold: preload_threshold.clamp(1, capacity),
            inner: Mutex::new(BufferInner {
                ring: VecDeque::with_capacity(capacity),
                written_total: 0,
                read_total: 0,
                end_of_input: false,
                closed: false,
                progress: 0.0,
                markers: VecDeque::new(),
                reached: None,
            }),
            cv: Condvar::new(),
            low_watermark_ms: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn preload_threshold(&self) -> usize {
        self.preload_threshold
    }

    /// Append as many whole frames of `bytes` as fit; returns the count accepted.
    ///
    /// Returns 0 when the buffer is full or closed. A short write is backpressure, not an
    /// error.
    pub fn write(&self, bytes: &[u8]) -> usize {
        let mut g = self.lock();
        if g.closed {
            return 0;
        }
        let space = self.capacity - g.ring.len();
        let n = bytes.len().min(space);
        let n = n - n % self.align;
        if n == 0 {
            return 0;
        }
        g.ring.extend(&bytes[..n]);
        g.written_total += n as u64;
        self.update_progress(&mut g);
        drop(g);
        self.cv.notify_all();
        n
    }

    /// Move up to `amount` bytes into `dest`; returns the count moved (0 when empty).
    ///
    /// Never returns more than `amount`, `dest.len()` or the current fill level.
    pub fn shift_bytes(&self, amount: usize, dest: &mut [u8]) -> usize {
        let mut g = self.lock();
        let n = amount.min(dest.len()).min(g.ring.len());
        for (slot, byte) in dest[..n].iter_mut().zip(g.ring.drain(..n)) {
            *slot = byte;
        }
        g.read_total += n as u64;
        while let Some(marker) = g.markers.front().copied() {
            if marker.offset > g.read_total {
                break;
            }
            g.reached = Some(marker.seconds);
            g.markers.pop_front();
        }
        let fill = g.ring.len();
        let draining = g.end_of_input;
        drop(g);
        if n > 0 {
            self.cv.notify_all();
            if !draining {
                self.log_low_watermark(fill);
            }
        }
        n
    }

    /// Drop all buffered bytes, seek markers and the end-of-input flag. Preload progress
    /// restarts from 0.
    pub fn reset(&self) {
        let mut g = self.lock();
        // Dropped bytes count as consumed so markers stay aligned with the reader.
        g.read_total += g.ring.len() as u64;
        g.ring.clear();
        g.end_of_input = false;
        g.progress = 0.0;
        g.markers.clear();
        g.reached = None;
        drop(g);
        self.cv.notify_all();
    }

    /// Release the storage and wake all waiters. Later writes are ignored.
    ///
    /// Idempotent.
    pub fn close(&self) {
        let mut g = self.lock();
        g.closed = true;
        g.ring = VecDeque::new();
        g.markers.clear();
        drop(g);
        self.cv.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn fill_level(&self) -> usize {
        self.lock().ring.len()
    }

    /// Fraction of the preload threshold reached since the last reset, in `[0, 1]`.
    pub fn preload_progress(&self) -> f32 {
        self.lock().progress
    }

    /// Total bytes accepted since creation (not cleared by `reset`).
    pub fn written_total(&self) -> u64 {
        self.lock().written_total
    }

    /// Total bytes shifted out or dropped by `reset` since creation.
    pub fn read_total(&self) -> u64 {
        self.lock().read_total
    }

    /// The producer has no more data. Pins preload progress at 1.0.
    pub fn mark_end_of_input(&self) {
        let mut g = self.lock();
        g.end_of_input = true;
        g.progress = 1.0;
        drop(g);
        self.cv.notify_all();
    }

    pub fn clear_end_of_input(&self) {
        self.lock().end_of_input = false;
    }

    pub fn is_end_of_input(&self) -> bool {
        self.lock().end_of_input
    }

    /// End of input has been signalled and every byte has been shifted out.
    pub fn is_drained(&self) -> bool {
        let g = self.lock();
        g.end_of_input && g.ring.is_empty()
    }

    /// Record that bytes written from now on start at `seconds` of the source.
    pub fn push_seek_marker(&self, seconds: f64) {
        let mut g = self.lock();
        let offset = g.written_total;
        g.markers.push_back(SeekMarker { offset, seconds });
    }

    /// Most recent seek marker the reader has passed, if any since the last call.
    pub fn take_reached_marker(&self) -> Option<f64> {
        self.lock().reached.take()
    }

    /// Wake everything parked on this buffer.
    pub fn notify(&self) {
        self.cv.notify_all();
    }

    /// Park until at least one frame of space is free, the buffer closes or `timeout` passes.
    ///
    /// Returns `true` if there is space.
    pub fn wait_for_space(&self, timeout: Duration) -> bool {
        let g = self.lock();
        let (g, _timeout) = self
            .cv
            .wait_timeout_while(g, timeout, |g| {
                !g.closed && self.capacity - g.ring.len() < self.align
            })
            .unwrap_or_else(PoisonError::into_inner);
        !g.closed && self.capacity - g.ring.len() >= self.align
    }

    /// Park until anything changes or `timeout` passes.
    pub fn wait_for_change(&self, timeout: Duration) {
        let g = self.lock();
        if g.closed {
            return;
        }
        let _ = self.cv.wait_timeout(g, timeout);
    }

    fn update_progress(&self, g: &mut BufferInner) {
        if g.progress >= 1.0 {
            return;
        }
        let p = (g.ring.len() as f32 / self.preload_threshold as f32).clamp(0.0, 1.0);
        if p > g.progress {
            g.progress = p;
        }
    }

    fn log_low_watermark(&self, fill: usize) {
        let threshold = (self.capacity / 8).max(self.align * 16);
        if fill == 0 || fill >= threshold {
            return;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_millis(0))
            .as_millis() as u64;
        let last = self.low_watermark_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) > 1000 {
            self.low_watermark_ms.store(now, Ordering::Relaxed);
            tracing::info!(
                buffered_bytes = fill,
                threshold_bytes = threshold,
                "decode buffer low watermark"
            );
        }
    }
}
