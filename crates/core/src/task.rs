//! Background task plumbing.
//!
//! Every stream runs its loops (RTP send, RTP receive, RTCP) on dedicated
//! threads so that pacing sleeps in one stream never delay another. A loop
//! polls a shared `running` flag between blocking operations; stopping a task
//! clears the flag and joins the thread, handing back whatever state the loop
//! returned.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Longest single sleep between checks of the `running` flag.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A named background thread with a cooperative stop flag.
pub struct Task<T> {
    name: String,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> Task<T> {
    /// Spawn `body` on a new thread. The closure receives the flag it must poll.
    pub fn spawn<F>(name: &str, body: F) -> io::Result<Self>
    where
        F: FnOnce(Arc<AtomicBool>) -> T + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(flag))?;
        tracing::debug!(task = name, "task started");
        Ok(Self {
            name: name.to_string(),
            running,
            handle: Some(handle),
        })
    }

    /// Whether the loop is still executing.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the loop to stop and wait for it, returning its final state.
    ///
    /// Returns `None` if the loop panicked.
    pub fn stop(mut self) -> Option<T> {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(state) => {
                tracing::debug!(task = %self.name, "task stopped");
                Some(state)
            }
            Err(_) => {
                tracing::error!(task = %self.name, "task panicked");
                None
            }
        }
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        // Detach: the loop notices the flag on its next poll.
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Sleep for `duration` in short slices, returning early (with `false`) when
/// `running` is cleared.
pub fn sleep_while_running(running: &AtomicBool, duration: Duration) -> bool {
    let mut remaining = duration;
    while !remaining.is_zero() {
        if !running.load(Ordering::SeqCst) {
            return false;
        }
        let slice = remaining.min(STOP_POLL_INTERVAL);
        thread::sleep(slice);
        remaining -= slice;
    }
    running.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn stop_returns_loop_state() {
        let task = Task::spawn("counter", |running| {
            let mut n = 0u32;
            while running.load(Ordering::SeqCst) {
                n += 1;
                thread::sleep(Duration::from_millis(1));
            }
            n
        })
        .unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(task.is_running());
        let n = task.stop().unwrap();
        assert!(n > 0);
    }

    #[test]
    fn sleep_is_cut_short_by_stop() {
        let running = AtomicBool::new(false);
        let start = Instant::now();
        assert!(!sleep_while_running(&running, Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
