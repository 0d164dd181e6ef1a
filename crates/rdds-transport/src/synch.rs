// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rdds contributors

//! Backpressure wait primitive.
//!
//! A [`ThreadSynchResource`] belongs to one link's send strategy. When the
//! strategy cannot push bytes out (the OS send buffer is full), the drain
//! worker parks here until the handle drains or `max_output_pause_period`
//! expires. The lost-on-timeout notification fires at most once per
//! backpressure episode; a successful send closes the episode and re-arms
//! it.
//!
//! For socket-backed links the wait polls the raw fd for writability
//! (`POLLOUT`); handle-less links (tests, in-process wires) wait on a
//! condvar and are woken by `notify_unclogged`.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Poll slice so a waiter observes shutdown promptly.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Outcome of one bounded unclog wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnclogOutcome {
    /// The handle is writable again (or a wake signal arrived).
    Unclogged,

    /// `max_output_pause_period` expired with the handle still clogged.
    TimedOut,

    /// The resource was shut down while waiting.
    Shutdown,
}

#[derive(Debug, Default)]
struct SynchState {
    /// Inside a backpressure episode.
    clogged: bool,
    /// Lost notification already fired for this episode.
    lost_fired: bool,
    /// Pending condvar wake (handle-less wires).
    wake_pending: bool,
    /// Resource torn down.
    shutdown: bool,
}

/// Per-link handle/timeout primitive signaling backpressure timeout.
pub struct ThreadSynchResource {
    /// Raw fd to poll for writability, if the wire is socket-backed.
    handle: Option<i32>,

    /// `max_output_pause_period`; `None` waits indefinitely.
    timeout: Option<Duration>,

    state: Mutex<SynchState>,
    wake: Condvar,
}

impl ThreadSynchResource {
    /// Create a resource for the given handle and pause bound.
    pub fn new(handle: Option<i32>, timeout: Option<Duration>) -> Self {
        Self {
            handle,
            timeout,
            state: Mutex::new(SynchState::default()),
            wake: Condvar::new(),
        }
    }

    /// Configured pause bound.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Mark the start of a backpressure episode.
    ///
    /// Returns false when an episode is already active (the caller must not
    /// arm a second drain worker).
    pub fn enter_backpressure(&self) -> bool {
        let mut state = self.state.lock();
        if state.clogged || state.shutdown {
            return false;
        }
        state.clogged = true;
        state.lost_fired = false;
        true
    }

    /// Close the current episode after a successful drain.
    pub fn clear_backpressure(&self) {
        let mut state = self.state.lock();
        state.clogged = false;
        state.lost_fired = false;
        state.wake_pending = false;
    }

    /// True while a backpressure episode is active.
    pub fn is_clogged(&self) -> bool {
        self.state.lock().clogged
    }

    /// Wake a condvar-based waiter (handle-less wires).
    pub fn notify_unclogged(&self) {
        let mut state = self.state.lock();
        state.wake_pending = true;
        self.wake.notify_all();
    }

    /// Claim the lost notification for this episode.
    ///
    /// At most one caller per episode gets `true`; everything after the
    /// first (and anything outside an episode) gets `false`.
    pub fn try_fire_lost(&self) -> bool {
        let mut state = self.state.lock();
        if !state.clogged || state.lost_fired || state.shutdown {
            return false;
        }
        state.lost_fired = true;
        true
    }

    /// Tear down the resource, releasing any waiter with
    /// [`UnclogOutcome::Shutdown`].
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.wake.notify_all();
    }

    /// Block until the handle drains, bounded by the configured timeout.
    pub fn wait_to_unclog(&self) -> UnclogOutcome {
        let deadline = self.timeout.map(|t| Instant::now() + t);

        loop {
            if self.state.lock().shutdown {
                return UnclogOutcome::Shutdown;
            }

            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return UnclogOutcome::TimedOut;
                    }
                    WAIT_SLICE.min(deadline - now)
                }
                None => WAIT_SLICE,
            };

            let outcome = match self.handle {
                Some(fd) => poll_writable(fd, slice),
                None => self.wait_on_condvar(slice),
            };
            if let Some(outcome) = outcome {
                return outcome;
            }
        }
    }

    /// Condvar slice wait; `Some` on a definite outcome, `None` to keep
    /// looping.
    fn wait_on_condvar(&self, slice: Duration) -> Option<UnclogOutcome> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Some(UnclogOutcome::Shutdown);
        }
        if state.wake_pending {
            state.wake_pending = false;
            return Some(UnclogOutcome::Unclogged);
        }
        self.wake.wait_for(&mut state, slice);
        if state.shutdown {
            return Some(UnclogOutcome::Shutdown);
        }
        if state.wake_pending {
            state.wake_pending = false;
            return Some(UnclogOutcome::Unclogged);
        }
        None
    }
}

/// One bounded poll for fd writability.
///
/// Any poll event (including error conditions) reports `Unclogged`: the
/// subsequent write attempt surfaces the real socket error on the normal
/// send path.
#[cfg(unix)]
fn poll_writable(fd: i32, slice: Duration) -> Option<UnclogOutcome> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    let timeout_ms = slice.as_millis().min(i32::MAX as u128) as i32;

    // SAFETY: pfd points to a valid pollfd for the duration of the call and
    // nfds is 1; poll does not retain the pointer.
    let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    match ret {
        0 => None,
        n if n > 0 => Some(UnclogOutcome::Unclogged),
        _ => {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                None
            } else {
                log::debug!("[SYNCH] poll({}) failed: {}", fd, err);
                Some(UnclogOutcome::Unclogged)
            }
        }
    }
}

#[cfg(not(unix))]
fn poll_writable(_fd: i32, slice: Duration) -> Option<UnclogOutcome> {
    // No fd polling off unix; behave like a silent slice so the deadline
    // still bounds the wait.
    std::thread::sleep(slice);
    None
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_episode_lifecycle() {
        let synch = ThreadSynchResource::new(None, Some(Duration::from_millis(10)));

        assert!(synch.enter_backpressure());
        // Second arm within the same episode is refused.
        assert!(!synch.enter_backpressure());

        assert!(synch.try_fire_lost());
        // At most once per episode.
        assert!(!synch.try_fire_lost());

        synch.clear_backpressure();
        assert!(synch.enter_backpressure());
        assert!(synch.try_fire_lost());
    }

    #[test]
    fn test_lost_requires_active_episode() {
        let synch = ThreadSynchResource::new(None, Some(Duration::from_millis(10)));
        assert!(!synch.try_fire_lost());
    }

    #[test]
    fn test_condvar_wait_times_out() {
        let synch = ThreadSynchResource::new(None, Some(Duration::from_millis(30)));
        synch.enter_backpressure();

        let start = Instant::now();
        assert_eq!(synch.wait_to_unclog(), UnclogOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_condvar_wake_unclogs() {
        let synch = Arc::new(ThreadSynchResource::new(None, Some(Duration::from_secs(5))));
        synch.enter_backpressure();

        let waker = {
            let synch = Arc::clone(&synch);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                synch.notify_unclogged();
            })
        };

        assert_eq!(synch.wait_to_unclog(), UnclogOutcome::Unclogged);
        waker.join().unwrap();
    }

    #[test]
    fn test_shutdown_releases_waiter() {
        let synch = Arc::new(ThreadSynchResource::new(None, None));
        synch.enter_backpressure();

        let waiter = {
            let synch = Arc::clone(&synch);
            thread::spawn(move || synch.wait_to_unclog())
        };

        thread::sleep(Duration::from_millis(20));
        synch.shutdown();
        assert_eq!(waiter.join().unwrap(), UnclogOutcome::Shutdown);
    }

    #[cfg(unix)]
    #[test]
    fn test_fd_poll_reports_writable_socket() {
        use std::net::UdpSocket;
        use std::os::fd::AsRawFd;

        // A fresh UDP socket is immediately writable.
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let synch = ThreadSynchResource::new(
            Some(socket.as_raw_fd()),
            Some(Duration::from_millis(200)),
        );
        synch.enter_backpressure();

        assert_eq!(synch.wait_to_unclog(), UnclogOutcome::Unclogged);
    }
}
