// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A one-shot timer bound to a pipeline: arming it schedules a `Timeout`
//! event to be posted via [`Pipeline::post_inbound`] after a delay;
//! destroying it guarantees no callback fires afterward, with no race
//! window. This mirrors the dedicated timer thread the original Mosquitto
//! back-end runs alongside its I/O thread, rather than relying on a bare
//! atomic flag, which cannot close the race between "check flag" and
//! "fire callback" without a second primitive to block on.

use crate::event::Event;
use crate::pipeline::Pipeline;
use crate::platform::deadline_from_now;

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

struct TimerInner {
    generation: u64,
    deadline: Option<Instant>,
    destroyed: bool,
}

struct TimerState {
    inner: Mutex<TimerInner>,
    condvar: Condvar,
}

/// A one-shot timer that posts [`crate::event::TIMEOUT`] to a pipeline's
/// inbound endpoint when it expires.
pub struct PipelineTimer {
    state: Arc<TimerState>,
    thread: Option<JoinHandle<()>>,
}

impl PipelineTimer {
    /// Spawns the timer's worker thread, unarmed, bound to `pipeline`.
    #[must_use]
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        let state = Arc::new(TimerState {
            inner: Mutex::new(TimerInner {
                generation: 0,
                deadline: None,
                destroyed: false,
            }),
            condvar: Condvar::new(),
        });

        let worker_state = Arc::clone(&state);
        let thread = std::thread::spawn(move || run(worker_state, pipeline));

        Self {
            state,
            thread: Some(thread),
        }
    }

    /// Arms (or re-arms) the timer to fire `millis` milliseconds from now.
    /// `0` fires as soon as the worker thread can observe it. Re-arming
    /// before a previous expiry invalidates that expiry: the superseded
    /// generation will not fire.
    pub fn start(&self, millis: u32) {
        let mut inner = self.state.inner.lock().expect("timer mutex poisoned");
        inner.generation += 1;
        inner.deadline = Some(deadline_from_now(millis));
        self.state.condvar.notify_all();
    }

    /// Disarms the timer and blocks until its worker thread has
    /// acknowledged the request. After this returns, no `Timeout` event
    /// from this timer will ever be posted again: either the thread was
    /// idle/waiting and exits immediately, or it was already mid-callback
    /// and this call waits for that one in-flight callback (which was
    /// committed to before `destroy` was called) to finish before the
    /// thread exits.
    pub fn destroy(&mut self) {
        {
            let mut inner = self.state.inner.lock().expect("timer mutex poisoned");
            inner.destroyed = true;
            self.state.condvar.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PipelineTimer {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.destroy();
        }
    }
}

fn run(state: Arc<TimerState>, pipeline: Arc<Pipeline>) {
    'outer: loop {
        let mut inner = state.inner.lock().expect("timer mutex poisoned");
        while inner.deadline.is_none() && !inner.destroyed {
            inner = state.condvar.wait(inner).expect("timer mutex poisoned");
        }
        if inner.destroyed {
            return;
        }
        let generation = inner.generation;
        let mut deadline = inner.deadline.expect("armed timer always has a deadline");

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (new_inner, _timeout_result) = state
                .condvar
                .wait_timeout(inner, deadline - now)
                .expect("timer mutex poisoned");
            inner = new_inner;
            if inner.destroyed {
                return;
            }
            if inner.generation != generation {
                // Re-armed (or a stale wake-up) while we were waiting;
                // restart against whatever is current now.
                continue 'outer;
            }
            deadline = inner.deadline.expect("armed timer always has a deadline");
        }

        if inner.generation != generation {
            continue 'outer;
        }
        inner.deadline = None;
        drop(inner);

        log::debug!("pipeline timer expired, posting Timeout");
        if let Err(err) = pipeline.post_inbound(&Event::bare(crate::event::TIMEOUT)) {
            log::warn!("pipeline rejected Timeout event: {err}");
        }
    }
}
