//! Inter-thread signalling and bounded message queues.
//!
//! A [`Channel`] owns a word of signal bits shared by any number of
//! [`Signal`]s and [`Queue`]s. A consumer thread blocks on a subset of the
//! bits with [`Channel::wait`], or samples them with [`Channel::poll`];
//! producer threads raise bits from wherever they are. Queues keep their bit
//! asserted exactly while they are non-empty, so a wait-set over queue bits
//! doubles as a readiness test.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

mod queue;

pub use queue::{PushError, Queue, QueueSender};

/// State shared between a channel and everything that can wake it.
struct Shared {
    status: Mutex<u32>,
    wakeup: Condvar,
}

impl Shared {
    fn raise(&self, mask: u32) {
        let mut status = self.status.lock().expect("channel poisoned");
        *status |= mask;
        self.wakeup.notify_one();
    }

    fn clear(&self, mask: u32) {
        let mut status = self.status.lock().expect("channel poisoned");
        *status &= !mask;
    }
}

/// A wait-set of signal bits owned by one consumer thread.
pub struct Channel {
    shared: Arc<Shared>,
    allocated: u32,
}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel {
    /// Creates an empty channel with no bits allocated.
    pub fn new() -> Self {
        Channel {
            shared: Arc::new(Shared {
                status: Mutex::new(0),
                wakeup: Condvar::new(),
            }),
            allocated: 0,
        }
    }

    /// Binds a signal to `mask`, which must be a single unallocated bit.
    pub fn signal(&mut self, mask: u32) -> Signal {
        assert_eq!(mask.count_ones(), 1, "signal mask must be a single bit");
        assert_eq!(self.allocated & mask, 0, "signal bit already allocated");
        self.allocated |= mask;
        Signal {
            shared: Arc::clone(&self.shared),
            mask,
        }
    }

    /// Creates a bounded queue whose bit is `mask` and which holds at most
    /// `capacity` elements.
    pub fn queue<T>(&mut self, mask: u32, capacity: usize) -> Queue<T> {
        let signal = self.signal(mask);
        Queue::new(signal, capacity)
    }

    /// Blocks until at least one bit of `mask` is set, and returns the
    /// full set of raised bits restricted to `mask`.
    ///
    /// Bits are left raised; the caller clears them (queues clear their own
    /// bit when drained).
    ///
    /// # Examples
    ///
    /// ```
    /// use apm_channel::Channel;
    ///
    /// let mut channel = Channel::new();
    /// let signal = channel.signal(1 << 3);
    ///
    /// let raiser = std::thread::spawn(move || signal.set());
    /// assert_eq!(channel.wait(1 << 3), 1 << 3);
    /// raiser.join().unwrap();
    /// ```
    pub fn wait(&self, mask: u32) -> u32 {
        let mut status = self.shared.status.lock().expect("channel poisoned");
        loop {
            let ready = *status & mask;
            if ready != 0 {
                return ready;
            }
            status = self.shared.wakeup.wait(status).expect("channel poisoned");
        }
    }

    /// As [`Channel::wait`], but gives up after `timeout` and returns the
    /// (possibly zero) raised subset.
    pub fn wait_timeout(&self, mask: u32, timeout: Duration) -> u32 {
        let status = self.shared.status.lock().expect("channel poisoned");
        let (status, _) = self
            .shared
            .wakeup
            .wait_timeout_while(status, timeout, |s| *s & mask == 0)
            .expect("channel poisoned");
        *status & mask
    }

    /// Returns the raised subset of `mask` without blocking.
    pub fn poll(&self, mask: u32) -> u32 {
        *self.shared.status.lock().expect("channel poisoned") & mask
    }
}

/// A capability to raise (or clear) one bit of a channel.
///
/// Signals are cheap to clone and may be raised from any thread.
#[derive(Clone)]
pub struct Signal {
    shared: Arc<Shared>,
    mask: u32,
}

impl Signal {
    /// Raises the signal bit and wakes the waiting thread.
    pub fn set(&self) {
        self.shared.raise(self.mask);
    }

    /// Clears the signal bit.
    pub fn clear(&self) {
        self.shared.clear(self.mask);
    }

    /// The bit this signal is bound to.
    pub fn mask(&self) -> u32 {
        self.mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const BIT_A: u32 = 1 << 0;
    const BIT_B: u32 = 1 << 1;

    #[test]
    fn wait_sees_raised_bit() {
        let mut channel = Channel::new();
        let signal = channel.signal(BIT_A);
        signal.set();
        assert_eq!(channel.wait(BIT_A | BIT_B), BIT_A);
    }

    #[test]
    fn poll_is_nonblocking_and_masked() {
        let mut channel = Channel::new();
        let a = channel.signal(BIT_A);
        let _b = channel.signal(BIT_B);
        assert_eq!(channel.poll(BIT_A | BIT_B), 0);
        a.set();
        assert_eq!(channel.poll(BIT_B), 0);
        assert_eq!(channel.poll(BIT_A), BIT_A);
        a.clear();
        assert_eq!(channel.poll(BIT_A), 0);
    }

    #[test]
    fn cross_thread_wakeup() {
        let mut channel = Channel::new();
        let signal = channel.signal(BIT_B);
        let handle = thread::spawn(move || signal.set());
        assert_eq!(channel.wait(BIT_B), BIT_B);
        handle.join().unwrap();
    }

    #[test]
    fn wait_timeout_expires() {
        let mut channel = Channel::new();
        let _signal = channel.signal(BIT_A);
        assert_eq!(channel.wait_timeout(BIT_A, Duration::from_millis(1)), 0);
    }

    #[test]
    #[should_panic(expected = "already allocated")]
    fn double_allocation_panics() {
        let mut channel = Channel::new();
        let _a = channel.signal(BIT_A);
        let _b = channel.signal(BIT_A);
    }
}
