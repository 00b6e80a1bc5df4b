// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The bidirectional policy pipeline: an ordered chain of policies through
//! which inbound events (wire toward application) and outbound events
//! (application toward wire) flow, each able to synthesize follow-on events
//! in either direction.
//!
//! Naming follows the crossed convention spelled out alongside the public
//! operations below: [`Pipeline::post_inbound`] is the entry point used by
//! code sitting on the *wire* side (a back-end adapter, a timer) to report
//! something toward the application, so it is delivered first to the
//! outbound-most policy; [`Pipeline::post_outbound`] is the entry point used
//! by the application side, delivered first to the inbound-most policy.

use crate::event::{Event, ErrorCode};
use crate::hfsm::{DispatchError, Machine};
use crate::policy::{ErasedHfsm, PipelineInner, PolicyCx, PolicyEntry, PolicyError, PolicyHandle};

use std::sync::{Arc, Mutex};

/// Invoked when an escalated error itself fails to be handled, or when a
/// policy (such as the adapter) reaches a condition the original C contract
/// treats as an unconditional abort. Shared (`Arc`, not `Box`) so the same
/// hook can be installed on the pipeline and handed to policies that need to
/// invoke it directly. The default hook logs at `error!` and does not abort
/// the process; hosts that want the original contract's abort-on-fatal
/// behavior should install one that does.
pub type CriticalErrorHook = Arc<dyn Fn(&DispatchError) + Send + Sync>;

/// The hook installed when none is given to [`PipelineBuilder`]: logs at
/// `error!` and does not abort the process.
#[must_use]
pub fn default_critical_error_hook() -> CriticalErrorHook {
    Arc::new(|err: &DispatchError| {
        log::error!("pipeline critical error, no policy could handle the escalation: {err}");
    })
}

/// Builds a [`Pipeline`] by appending policies in outbound-to-inbound order
/// (the order in which events posted via `post_inbound` are visited).
pub struct PipelineBuilder {
    inner: PipelineInner,
    critical_error_hook: CriticalErrorHook,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self {
            inner: PipelineInner::default(),
            critical_error_hook: default_critical_error_hook(),
        }
    }
}

impl PipelineBuilder {
    /// Starts an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the hook invoked when an escalated `Error` event also fails
    /// to be handled (see the module-level error propagation notes).
    #[must_use]
    pub fn critical_error_hook(mut self, hook: CriticalErrorHook) -> Self {
        self.critical_error_hook = hook;
        self
    }

    /// Appends a policy, linking it to the previously appended one (if any)
    /// as its outbound neighbor. The first policy appended becomes the
    /// outbound endpoint; the last becomes the inbound endpoint.
    #[must_use]
    pub fn add_policy<M>(mut self, name: &'static str, handle: PolicyHandle<M>) -> Self
    where
        M: for<'a> Machine<Context<'a> = PolicyCx<'a>> + Send + 'static,
    {
        let idx = self.inner.entries.len();
        if idx > 0 {
            self.inner.entries[idx - 1].inbound = Some(idx);
        }
        self.inner.entries.push(PolicyEntry {
            hfsm: Some(Box::new(handle) as Box<dyn ErasedHfsm>),
            inbound: None,
            outbound: if idx > 0 { Some(idx - 1) } else { None },
            name,
        });
        self
    }

    /// Finishes construction, dispatching `Entry` to every policy's initial
    /// state in the order they were added. Fails if any policy's initial
    /// dispatch fails, or if fewer than one policy was added.
    pub fn build(mut self) -> Result<Pipeline, DispatchError> {
        assert!(!self.inner.entries.is_empty(), "pipeline needs at least one policy");
        for idx in 0..self.inner.entries.len() {
            self.inner.init_at(idx)?;
        }
        let outbound_endpoint = 0;
        let inbound_endpoint = self.inner.entries.len() - 1;
        Ok(Pipeline {
            inner: Mutex::new(self.inner),
            outbound_endpoint,
            inbound_endpoint,
            critical_error_hook: self.critical_error_hook,
        })
    }
}

/// An assembled chain of policies. See the module documentation for the
/// inbound/outbound direction convention.
pub struct Pipeline {
    inner: Mutex<PipelineInner>,
    outbound_endpoint: usize,
    inbound_endpoint: usize,
    critical_error_hook: CriticalErrorHook,
}

impl Pipeline {
    /// Delivers `event` starting at the outbound-most policy (the one
    /// closest to the wire). Used by back-ends and timers to report
    /// something toward the application.
    ///
    /// If the dispatch fails, the failure is converted into an `Error`
    /// event and posted at the opposite endpoint (the inbound-most policy);
    /// if that also fails, the critical error hook runs.
    pub fn post_inbound(&self, event: &Event) -> Result<(), PolicyError> {
        self.post(self.outbound_endpoint, self.inbound_endpoint, event)
    }

    /// Delivers `event` starting at the inbound-most policy (the one
    /// closest to the application). Used by application code to push
    /// something toward the wire.
    ///
    /// Error escalation mirrors [`Pipeline::post_inbound`], with the
    /// endpoints swapped.
    pub fn post_outbound(&self, event: &Event) -> Result<(), PolicyError> {
        self.post(self.inbound_endpoint, self.outbound_endpoint, event)
    }

    fn post(&self, target: usize, opposite: usize, event: &Event) -> Result<(), PolicyError> {
        let mut inner = self.inner.lock().expect("pipeline mutex poisoned");
        match inner.dispatch_at(target, event) {
            Ok(()) => Ok(()),
            Err(err) => {
                let escalation = Event::error(event.kind(), ErrorCode::Rejected, Some(err.to_string()));
                match inner.dispatch_at(opposite, &escalation) {
                    Ok(()) => Err(PolicyError::Dispatch(err)),
                    Err(escalation_err) => {
                        (self.critical_error_hook)(&escalation_err);
                        Err(PolicyError::Dispatch(escalation_err))
                    }
                }
            }
        }
    }

    /// Synthesizes a `ProcessLoop` event and posts it in both directions,
    /// for hosts that drive the pipeline cooperatively instead of purely
    /// from back-end callbacks. Only available with the `process-loop`
    /// feature.
    #[cfg(feature = "process-loop")]
    pub fn sync_process_loop(&self) -> Result<(), PolicyError> {
        let event = Event::bare(crate::event::PROCESS_LOOP);
        self.post_inbound(&event)?;
        self.post_outbound(&event)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Facility, Kind, ENTRY, ERROR};
    use crate::hfsm::{HandlerError, Outcome};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    enum S {
        Root,
    }

    const POST_OUTBOUND_0: Kind = Kind::new(Facility::User, 0);
    const POST_INBOUND_0: Kind = Kind::new(Facility::User, 1);
    const SEND_INBOUND_0: Kind = Kind::new(Facility::User, 2);
    const SEND_INBOUND_1: Kind = Kind::new(Facility::User, 3);
    const SEND_INBOUND_2: Kind = Kind::new(Facility::User, 4);
    const SEND_INBOUND_3: Kind = Kind::new(Facility::User, 5);

    #[derive(Default, Clone)]
    struct Counters {
        entries: Arc<AtomicU32>,
        post_outbound_0: Arc<AtomicU32>,
        post_inbound_0: Arc<AtomicU32>,
        send_inbound_0: Arc<AtomicU32>,
        send_inbound_1: Arc<AtomicU32>,
        send_inbound_2: Arc<AtomicU32>,
        send_inbound_3: Arc<AtomicU32>,
    }

    /// Outbound-most test policy: the endpoint `post_inbound` reaches first.
    struct OutboundPolicy {
        counters: Counters,
    }

    impl Machine for OutboundPolicy {
        type State = S;
        type Context<'a> = PolicyCx<'a>;

        fn parent(&self, _state: S) -> Option<S> {
            None
        }

        fn dispatch(&mut self, cx: &mut PolicyCx<'_>, _state: S, event: &Event) -> Outcome {
            if event.kind() == ENTRY {
                self.counters.entries.fetch_add(1, Ordering::SeqCst);
                Outcome::Handled
            } else if event.kind() == POST_INBOUND_0 {
                self.counters.post_inbound_0.fetch_add(1, Ordering::SeqCst);
                Outcome::Handled
            } else if event.kind() == SEND_INBOUND_0 {
                self.counters.send_inbound_0.fetch_add(1, Ordering::SeqCst);
                let _ = cx.send_inbound(&Event::bare(SEND_INBOUND_1));
                Outcome::Handled
            } else if event.kind() == SEND_INBOUND_2 {
                self.counters.send_inbound_2.fetch_add(1, Ordering::SeqCst);
                let _ = cx.send_inbound(&Event::bare(SEND_INBOUND_3));
                Outcome::Handled
            } else {
                Outcome::HandledBySuperState
            }
        }
    }

    struct MiddlePolicy {
        counters: Counters,
        fail_send_inbound_3: bool,
    }

    impl Machine for MiddlePolicy {
        type State = S;
        type Context<'a> = PolicyCx<'a>;

        fn parent(&self, _state: S) -> Option<S> {
            None
        }

        fn dispatch(&mut self, _cx: &mut PolicyCx<'_>, _state: S, event: &Event) -> Outcome {
            if event.kind() == ENTRY {
                self.counters.entries.fetch_add(1, Ordering::SeqCst);
                Outcome::Handled
            } else if event.kind() == SEND_INBOUND_1 {
                self.counters.send_inbound_1.fetch_add(1, Ordering::SeqCst);
                Outcome::Handled
            } else if event.kind() == SEND_INBOUND_3 {
                self.counters.send_inbound_3.fetch_add(1, Ordering::SeqCst);
                if self.fail_send_inbound_3 {
                    Outcome::Failed(HandlerError::new("middle policy rejected SEND_INBOUND_3"))
                } else {
                    Outcome::Handled
                }
            } else if event.kind() == ERROR {
                // Recovers on the redelivered Error for SEND_INBOUND_3 by
                // counting it a second time, as scenario 5 expects.
                self.counters.send_inbound_3.fetch_add(1, Ordering::SeqCst);
                Outcome::Handled
            } else {
                Outcome::HandledBySuperState
            }
        }
    }

    /// Inbound-most test policy: the endpoint `post_outbound` reaches first.
    struct InboundPolicy {
        counters: Counters,
    }

    impl Machine for InboundPolicy {
        type State = S;
        type Context<'a> = PolicyCx<'a>;

        fn parent(&self, _state: S) -> Option<S> {
            None
        }

        fn dispatch(&mut self, _cx: &mut PolicyCx<'_>, _state: S, event: &Event) -> Outcome {
            if event.kind() == ENTRY {
                self.counters.entries.fetch_add(1, Ordering::SeqCst);
                Outcome::Handled
            } else if event.kind() == POST_OUTBOUND_0 {
                self.counters.post_outbound_0.fetch_add(1, Ordering::SeqCst);
                Outcome::Handled
            } else {
                Outcome::HandledBySuperState
            }
        }
    }

    fn build_pipeline(fail_send_inbound_3: bool) -> (Pipeline, Counters) {
        let counters = Counters::default();
        let pipeline = PipelineBuilder::new()
            .add_policy(
                "outbound",
                PolicyHandle::new(
                    OutboundPolicy {
                        counters: counters.clone(),
                    },
                    S::Root,
                ),
            )
            .add_policy(
                "middle",
                PolicyHandle::new(
                    MiddlePolicy {
                        counters: counters.clone(),
                        fail_send_inbound_3,
                    },
                    S::Root,
                ),
            )
            .add_policy(
                "inbound",
                PolicyHandle::new(
                    InboundPolicy {
                        counters: counters.clone(),
                    },
                    S::Root,
                ),
            )
            .build()
            .unwrap();
        (pipeline, counters)
    }

    #[test]
    fn three_policy_init_enters_every_root() {
        let (_pipeline, counters) = build_pipeline(false);
        assert_eq!(counters.entries.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn post_outbound_reaches_only_the_inbound_endpoint() {
        let (pipeline, counters) = build_pipeline(false);
        pipeline.post_outbound(&Event::bare(POST_OUTBOUND_0)).unwrap();
        assert_eq!(counters.post_outbound_0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn post_inbound_reaches_only_the_outbound_endpoint() {
        let (pipeline, counters) = build_pipeline(false);
        pipeline.post_inbound(&Event::bare(POST_INBOUND_0)).unwrap();
        assert_eq!(counters.post_inbound_0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn send_inbound_chains_into_the_next_policy_before_post_returns() {
        let (pipeline, counters) = build_pipeline(false);
        pipeline.post_inbound(&Event::bare(SEND_INBOUND_0)).unwrap();
        assert_eq!(counters.send_inbound_0.load(Ordering::SeqCst), 1);
        assert_eq!(counters.send_inbound_1.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_failure_is_redelivered_once_to_the_same_neighbor() {
        let (pipeline, counters) = build_pipeline(true);
        pipeline.post_inbound(&Event::bare(SEND_INBOUND_2)).unwrap();
        assert_eq!(counters.send_inbound_2.load(Ordering::SeqCst), 1);
        assert_eq!(counters.send_inbound_3.load(Ordering::SeqCst), 2);
    }
}
