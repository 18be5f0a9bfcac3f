//! The GPU thread's event loop: runs a payload whenever woken, sleeps
//! when allowed and idle, and supports synchronous waits from other
//! threads.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use gchan_utils::IgnorePoison;

#[derive(Default)]
struct State {
    /// Monotonic wakeup requests.
    wakeups: u64,
    /// Wakeups the payload has fully processed.
    done: u64,
    running: bool,
    stopping: bool,
    may_sleep: bool,
}

#[derive(Default)]
pub struct BlockingLoop {
    state: Mutex<State>,
    /// Signals the loop thread.
    worker_cv: Condvar,
    /// Signals waiters when the loop goes idle or exits.
    idle_cv: Condvar,
}

impl BlockingLoop {
    pub fn prepare(&self) {
        let mut state = self.state.get();
        state.wakeups = 1;
        state.done = 0;
        state.running = true;
        state.stopping = false;
        state.may_sleep = false;
    }

    pub fn is_running(&self) -> bool {
        self.state.get().running
    }

    /// All pending wakeups are processed and the loop is parked (or
    /// gone).
    pub fn is_done(&self) -> bool {
        let state = self.state.get();
        !state.running || state.done == state.wakeups
    }

    pub fn wakeup(&self) {
        let mut state = self.state.get();
        state.wakeups += 1;
        state.may_sleep = false;
        self.worker_cv.notify_one();
    }

    pub fn allow_sleep(&self) {
        let mut state = self.state.get();
        state.may_sleep = true;
    }

    /// Non-blocking stop; the loop exits after the current payload run.
    pub fn stop(&self) {
        let mut state = self.state.get();
        state.stopping = true;
        self.worker_cv.notify_one();
        self.idle_cv.notify_all();
    }

    /// Blocks until the loop has caught up with every wakeup issued so
    /// far.
    pub fn wait(&self) {
        let mut state = self.state.get();
        let target = state.wakeups;
        while state.running && state.done < target {
            state = self.idle_cv.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Like `wait`, but yields to `on_yield` every `interval` so a UI
    /// thread is not starved.
    pub fn wait_yield(&self, interval: Duration, mut on_yield: impl FnMut()) {
        let mut state = self.state.get();
        let target = state.wakeups;
        while state.running && state.done < target {
            let (next, timeout) = self
                .idle_cv
                .wait_timeout(state, interval)
                .unwrap_or_else(|e| e.into_inner());
            state = next;
            if timeout.timed_out() {
                drop(state);
                on_yield();
                state = self.state.get();
            }
        }
    }

    /// Runs `payload` until stopped. The payload is invoked at least once
    /// per wakeup; spurious extra runs are fine.
    pub fn run(&self, mut payload: impl FnMut()) {
        loop {
            let target = {
                let mut state = self.state.get();
                loop {
                    if state.stopping {
                        state.running = false;
                        self.idle_cv.notify_all();
                        return;
                    }
                    if state.done < state.wakeups || !state.may_sleep {
                        break state.wakeups;
                    }
                    state = self
                        .worker_cv
                        .wait(state)
                        .unwrap_or_else(|e| e.into_inner());
                }
            };

            payload();

            let mut state = self.state.get();
            state.done = state.done.max(target);
            if state.done >= state.wakeups {
                self.idle_cv.notify_all();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn wait_sees_work_finish() {
        let lp = Arc::new(BlockingLoop::default());
        let counter = Arc::new(AtomicU64::new(0));
        lp.prepare();

        let worker = {
            let lp = Arc::clone(&lp);
            let counter = Arc::clone(&counter);
            std::thread::spawn(move || {
                lp.run(|| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
        };

        lp.allow_sleep();
        lp.wakeup();
        lp.wait();
        assert!(counter.load(Ordering::SeqCst) >= 1);

        lp.stop();
        worker.join().unwrap();
        assert!(!lp.is_running());
        assert!(lp.is_done());
    }

    #[test]
    fn stop_is_nonblocking_and_terminates() {
        let lp = Arc::new(BlockingLoop::default());
        lp.prepare();
        let worker = {
            let lp = Arc::clone(&lp);
            std::thread::spawn(move || lp.run(|| {}))
        };
        lp.stop();
        worker.join().unwrap();
        assert!(!lp.is_running());
    }
}
