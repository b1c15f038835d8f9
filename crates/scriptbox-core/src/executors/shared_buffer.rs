//! Fixed-capacity input buffer shared between the host and a blocked worker.
//!
//! The layout mirrors a pair of 32-bit words in front of a byte area: a
//! coordination word (`IDLE`, `WAITING`, `READY`) and a length word, followed
//! by at most `capacity` bytes of UTF-8 text. The worker arms the buffer and
//! blocks; the host writes the payload, publishes its length, flips the word
//! to `READY` and wakes exactly one waiter.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use super::truncate_at_char_boundary;

pub const DEFAULT_INPUT_CAPACITY: usize = 10 * 1024;
/// A non-empty answer always keeps at least its first character.
pub const MIN_INPUT_CAPACITY: usize = 4;

pub const SIGNAL_IDLE: i32 = 0;
pub const SIGNAL_WAITING: i32 = 1;
pub const SIGNAL_READY: i32 = 2;

pub struct SharedInputBuffer {
    signal: AtomicI32,
    length: AtomicUsize,
    data: Mutex<Box<[u8]>>,
    wakeup: Condvar,
}

impl SharedInputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            signal: AtomicI32::new(SIGNAL_IDLE),
            length: AtomicUsize::new(0),
            data: Mutex::new(vec![0u8; capacity.max(MIN_INPUT_CAPACITY)].into_boxed_slice()),
            wakeup: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.lock().len()
    }

    /// Current value of the coordination word.
    pub fn signal(&self) -> i32 {
        self.signal.load(Ordering::SeqCst)
    }

    /// Marks the worker as about to wait. Must precede the input request so
    /// a fast answer cannot be lost.
    pub fn arm(&self) {
        let _data = self.data.lock();
        self.signal.store(SIGNAL_WAITING, Ordering::SeqCst);
    }

    /// Blocks the calling thread until the host delivers. An empty string
    /// means the wait was broken without a payload.
    pub fn wait(&self) -> String {
        let mut data = self.data.lock();
        while self.signal.load(Ordering::SeqCst) == SIGNAL_WAITING {
            self.wakeup.wait(&mut data);
        }
        self.signal.store(SIGNAL_IDLE, Ordering::SeqCst);

        let length = self.length.load(Ordering::SeqCst).min(data.len());
        String::from_utf8_lossy(&data[..length]).into_owned()
    }

    /// Writes `text` into the buffer and wakes one waiter. Text longer than
    /// the capacity is cut on a character boundary. Returns the bytes written.
    pub fn deliver(&self, text: &str) -> usize {
        let mut data = self.data.lock();
        let payload = truncate_at_char_boundary(text, data.len());
        if payload.len() < text.len() {
            log::warn!(
                "Input of {} bytes truncated to buffer capacity of {} bytes",
                text.len(),
                data.len()
            );
        }
        data[..payload.len()].copy_from_slice(payload.as_bytes());
        self.length.store(payload.len(), Ordering::SeqCst);
        self.signal.store(SIGNAL_READY, Ordering::SeqCst);
        self.wakeup.notify_one();
        payload.len()
    }

    /// Wakes a waiter with a zero-length payload.
    pub fn wake_empty(&self) {
        let _data = self.data.lock();
        self.length.store(0, Ordering::SeqCst);
        self.signal.store(SIGNAL_READY, Ordering::SeqCst);
        self.wakeup.notify_one();
    }
}

impl Default for SharedInputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_INPUT_CAPACITY)
    }
}
