// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An example reconnect policy, composed on top of the core pipeline the
//! same way any other policy is: installed via
//! [`crate::pipeline::PipelineBuilder::add_policy`], sitting inbound of the
//! adapter policy (`adapter.inbound == reconnect`).
//!
//! Grounded in `session/reconnect_policy.rs`'s `ExponentialBackoffWithJitter`,
//! adapted to run as a pipeline policy reacting to `Disconnect`/`Timeout`
//! events rather than as a parameter consulted by an async session loop.
//! Excluded from the core: nothing else in this crate depends on it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::event::{
    Event, Facility, Kind, Payload, CONN_ACK, DISCONNECT, ENTRY, EXIT, OUTBOUND_CONNECT,
    OUTBOUND_DISCONNECT, OUTBOUND_PUB, OUTBOUND_SUB, TIMEOUT,
};
use crate::hfsm::{Machine, Outcome};
use crate::platform::Platform;
use crate::policy::PolicyCx;
use crate::timer::PipelineTimer;

/// Posted inbound (toward whatever application-facing policy sits further
/// inbound of this one) when a backoff interval has elapsed and the host
/// should re-issue `outbound_connect` with whatever parameters it owns.
/// The core adapter does not retain connection parameters across a
/// disconnect, so actually reconnecting is left to the application
/// observing this event. A pipeline with no policy further inbound simply
/// drops it, which is a no-op, not an error.
pub const RECONNECT_DUE: Kind = Kind::new(Facility::User, 0);

/// Backoff schedule: exponential with jitter, grounded directly in the
/// teacher's `ExponentialBackoffWithJitter`.
///
/// Delays range from `2^7 = 128ms` up to `max_wait`, then have up to 10%
/// shaved off by jitter so that many clients reconnecting at once don't
/// all retry in lockstep.
#[derive(Clone)]
pub struct Backoff {
    /// The longest possible time to wait between reconnect attempts.
    pub max_wait: Duration,
    /// The max number of reconnect attempts before giving up.
    pub max_reconnect_attempts: Option<u32>,
}

impl Backoff {
    const MIN_EXPONENT: u32 = 7;
    const BASE_DELAY_MS: u64 = 2;

    fn should_reconnect(&self, prev_attempts: u32) -> bool {
        match self.max_reconnect_attempts {
            Some(max_attempts) => prev_attempts < max_attempts,
            None => true,
        }
    }

    fn calculate_delay(&self, prev_attempts: u32, random: i32) -> Duration {
        let exponent = prev_attempts.saturating_add(Self::MIN_EXPONENT);
        let interval =
            Duration::from_millis(Self::BASE_DELAY_MS.saturating_pow(exponent)).min(self.max_wait);

        // random is drawn from Platform::get_random (1..=i32::MAX); scale it
        // into a 0.90..=1.0 jitter multiplier.
        let unit = f64::from(random.unsigned_abs()) / f64::from(i32::MAX);
        let jitter_multiplier = 0.90 + unit.clamp(0.0, 1.0) * 0.10;
        interval.mul_f64(jitter_multiplier)
    }

    fn next_delay(&self, prev_attempts: u32, random: i32) -> Option<Duration> {
        if self.should_reconnect(prev_attempts) {
            Some(self.calculate_delay(prev_attempts, random))
        } else {
            None
        }
    }
}

impl Default for Backoff {
    /// Indefinite reconnect, with a max wait time of 60 seconds.
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(60),
            max_reconnect_attempts: None,
        }
    }
}

/// A policy that watches for unplanned disconnects and drives a
/// [`PipelineTimer`] through an exponentially backed-off reconnect
/// schedule. The timer itself is supplied after the pipeline is built
/// (the timer needs an `Arc<Pipeline>`, which doesn't exist until the
/// policy holding it has already been installed) via
/// [`ReconnectPolicy::bind_timer`] against the `Arc<Mutex<_>>` slot
/// returned by [`ReconnectPolicy::new`].
pub struct ReconnectPolicy {
    backoff: Backoff,
    platform: Arc<dyn Platform>,
    timer: Arc<Mutex<Option<PipelineTimer>>>,
    attempts: u32,
}

impl ReconnectPolicy {
    /// Builds a new policy with `backoff` and `platform` (used for
    /// `get_random` jitter). Returns the policy and the timer slot the
    /// caller must fill in with [`ReconnectPolicy::bind_timer`] once the
    /// pipeline it's installed in has been built.
    #[must_use]
    pub fn new(
        backoff: Backoff,
        platform: Arc<dyn Platform>,
    ) -> (Self, Arc<Mutex<Option<PipelineTimer>>>) {
        let timer = Arc::new(Mutex::new(None));
        (
            Self {
                backoff,
                platform,
                timer: timer.clone(),
                attempts: 0,
            },
            timer,
        )
    }

    /// Installs the timer this policy should arm. Call once, after the
    /// pipeline containing this policy has been built and wrapped in an
    /// `Arc`.
    pub fn bind_timer(slot: &Arc<Mutex<Option<PipelineTimer>>>, timer: PipelineTimer) {
        *slot.lock().expect("reconnect timer slot poisoned") = Some(timer);
    }

    /// Number of consecutive reconnect attempts since the last successful
    /// `ConnAck`.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn arm_for_next_attempt(&mut self) {
        let random = self.platform.get_random();
        match self.backoff.next_delay(self.attempts, random) {
            Some(delay) => {
                self.attempts += 1;
                let millis = u32::try_from(delay.as_millis()).unwrap_or(u32::MAX);
                if let Some(timer) = self.timer.lock().expect("reconnect timer slot poisoned").as_ref() {
                    timer.start(millis);
                } else {
                    log::warn!("reconnect policy armed before a timer was bound; dropping attempt");
                }
            }
            None => {
                log::warn!(
                    "reconnect policy giving up after {} attempts",
                    self.attempts
                );
            }
        }
    }
}

impl Machine for ReconnectPolicy {
    type State = ();
    type Context<'a> = PolicyCx<'a>;

    fn parent(&self, _state: ()) -> Option<()> {
        None
    }

    fn dispatch(&mut self, cx: &mut PolicyCx<'_>, _state: (), event: &Event) -> Outcome {
        if event.kind() == ENTRY || event.kind() == EXIT {
            return Outcome::Handled;
        }
        if event.kind() == DISCONNECT {
            if let Payload::Disconnect {
                disconnect_requested: false,
                ..
            } = event.payload()
            {
                self.arm_for_next_attempt();
            }
            return Outcome::Handled;
        }
        if event.kind() == CONN_ACK {
            if let Payload::ConnAck { reason_code: 0, .. } = event.payload() {
                self.attempts = 0;
            }
            return Outcome::Handled;
        }
        if event.kind() == TIMEOUT {
            let _ = cx.send_inbound(&Event::bare(RECONNECT_DUE));
            return Outcome::Handled;
        }
        if matches!(
            event.kind(),
            k if k == OUTBOUND_CONNECT || k == OUTBOUND_SUB || k == OUTBOUND_PUB || k == OUTBOUND_DISCONNECT
        ) {
            // This policy sits between the application and the adapter; any
            // outbound request it doesn't own passes through to the adapter
            // unchanged.
            let _ = cx.send_outbound(event);
            return Outcome::Handled;
        }
        Outcome::HandledBySuperState
    }
}
