// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Arena-backed storage for the policies making up a [`crate::pipeline::Pipeline`].
//!
//! A pipeline's policies form a doubly-linked chain, which is intrinsically
//! cyclic if modeled with ownership in either direction. This module breaks
//! the cycle the way `SPEC_FULL.md`'s own design notes suggest: the pipeline
//! is the sole owner of every policy, held in a single `Vec`, and neighbor
//! links are plain indices into that `Vec` rather than references. Dispatch
//! uses a take/dispatch/restore dance on each policy's boxed state machine so
//! that a handler can call back into a *different* policy (via
//! [`PolicyCx::send_inbound`]/[`PolicyCx::send_outbound`]) while the borrow
//! checker still sees one mutable borrow of the arena at a time.

use crate::event::Event;
use crate::hfsm::{DispatchError, Hfsm, Machine};

/// A policy's boxed, initialized state machine, with its own `State` type
/// erased so heterogeneous policies can share one arena. Requires `Send`
/// so a [`crate::pipeline::Pipeline`] (and hence the arena) can be shared
/// with the timer thread described in `src/timer.rs`.
pub trait ErasedHfsm: Send {
    /// Dispatches `Entry` to the machine's initial state.
    fn init(&mut self, cx: &mut PolicyCx<'_>) -> Result<(), DispatchError>;
    /// Dispatches `event` to the machine's current state.
    fn dispatch(&mut self, cx: &mut PolicyCx<'_>, event: &Event) -> Result<(), DispatchError>;
}

/// Binds a [`Hfsm`] to the initial state it should enter on [`ErasedHfsm::init`].
pub struct PolicyHandle<M>
where
    M: for<'a> Machine<Context<'a> = PolicyCx<'a>>,
{
    hfsm: Hfsm<M>,
    initial: M::State,
}

impl<M> PolicyHandle<M>
where
    M: for<'a> Machine<Context<'a> = PolicyCx<'a>>,
{
    /// Wraps `machine`, to be entered at `initial` once installed in a
    /// pipeline.
    pub fn new(machine: M, initial: M::State) -> Self {
        Self {
            hfsm: Hfsm::new(machine),
            initial,
        }
    }

    /// The wrapped machine.
    pub fn machine(&self) -> &M {
        self.hfsm.machine()
    }

    /// The wrapped machine, mutably.
    pub fn machine_mut(&mut self) -> &mut M {
        self.hfsm.machine_mut()
    }
}

impl<M> ErasedHfsm for PolicyHandle<M>
where
    M: for<'a> Machine<Context<'a> = PolicyCx<'a>> + Send,
{
    fn init(&mut self, cx: &mut PolicyCx<'_>) -> Result<(), DispatchError> {
        self.hfsm.init(cx, self.initial)
    }

    fn dispatch(&mut self, cx: &mut PolicyCx<'_>, event: &Event) -> Result<(), DispatchError> {
        self.hfsm.send(cx, event)
    }
}

/// Failures arising from a policy-level operation rather than from inside
/// a single handler dispatch.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PolicyError {
    /// The policy has no neighbor in the requested direction (it sits at
    /// a pipeline endpoint).
    #[error("no neighbor in that direction")]
    NoNeighbor,
    /// The neighbor's handler failed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Direction {
    Inbound,
    Outbound,
}

pub(crate) struct PolicyEntry {
    pub(crate) hfsm: Option<Box<dyn ErasedHfsm>>,
    pub(crate) inbound: Option<usize>,
    pub(crate) outbound: Option<usize>,
    pub(crate) name: &'static str,
}

/// Owns every policy in a pipeline and implements the take/dispatch/restore
/// pattern that lets one policy's handler synchronously invoke another's.
#[derive(Default)]
pub(crate) struct PipelineInner {
    pub(crate) entries: Vec<PolicyEntry>,
}

impl PipelineInner {
    pub(crate) fn dispatch_at(&mut self, idx: usize, event: &Event) -> Result<(), DispatchError> {
        let mut hfsm = self.entries[idx]
            .hfsm
            .take()
            .unwrap_or_else(|| panic!("reentrant dispatch into policy {}", self.entries[idx].name));
        let mut cx = PolicyCx {
            self_index: idx,
            inner: self,
        };
        let result = hfsm.dispatch(&mut cx, event);
        self.entries[idx].hfsm = Some(hfsm);
        result
    }

    pub(crate) fn init_at(&mut self, idx: usize) -> Result<(), DispatchError> {
        let mut hfsm = self.entries[idx]
            .hfsm
            .take()
            .unwrap_or_else(|| panic!("reentrant init into policy {}", self.entries[idx].name));
        let mut cx = PolicyCx {
            self_index: idx,
            inner: self,
        };
        let result = hfsm.init(&mut cx);
        self.entries[idx].hfsm = Some(hfsm);
        result
    }

    fn neighbor(&self, idx: usize, dir: Direction) -> Option<usize> {
        match dir {
            Direction::Inbound => self.entries[idx].inbound,
            Direction::Outbound => self.entries[idx].outbound,
        }
    }

    /// Implements the one-hop, same-neighbor error redelivery rule for
    /// handler-internal `send_inbound`/`send_outbound`: if the neighbor's
    /// handler fails, the failure is converted into an `Error` event and
    /// redelivered to that same neighbor before being reported upward.
    pub(crate) fn send_toward(
        &mut self,
        from: usize,
        dir: Direction,
        event: &Event,
    ) -> Result<(), PolicyError> {
        let idx = self.neighbor(from, dir).ok_or(PolicyError::NoNeighbor)?;
        match self.dispatch_at(idx, event) {
            Ok(()) => Ok(()),
            Err(err) => {
                let err_event = Event::error(
                    event.kind(),
                    crate::event::ErrorCode::Rejected,
                    Some(err.to_string()),
                );
                // Give the same neighbor one chance to recover; its
                // outcome is ignored here, the original failure is what
                // gets reported to the caller.
                let _ = self.dispatch_at(idx, &err_event);
                Err(PolicyError::Dispatch(err))
            }
        }
    }
}

/// The side-channel context made available to every policy's handlers.
/// Borrows the pipeline's arena for the duration of one dispatch so a
/// handler can synthesize events toward its neighbors.
pub struct PolicyCx<'a> {
    self_index: usize,
    inner: &'a mut PipelineInner,
}

impl<'a> PolicyCx<'a> {
    /// Forwards `event` to this policy's inbound neighbor (the one closer
    /// to the application), if any.
    pub fn send_inbound(&mut self, event: &Event) -> Result<(), PolicyError> {
        self.inner.send_toward(self.self_index, Direction::Inbound, event)
    }

    /// Forwards `event` to this policy's outbound neighbor (the one closer
    /// to the wire), if any.
    pub fn send_outbound(&mut self, event: &Event) -> Result<(), PolicyError> {
        self.inner.send_toward(self.self_index, Direction::Outbound, event)
    }
}

/// A single-entry arena with no neighbors, for unit-testing a policy's
/// machine in isolation (outside any [`crate::pipeline::Pipeline`]).
/// `send_inbound`/`send_outbound` calls made against its context simply
/// report [`PolicyError::NoNeighbor`], which is the correct behavior for
/// a standalone policy anyway.
#[cfg(test)]
pub(crate) struct StandaloneCx {
    inner: PipelineInner,
}

#[cfg(test)]
impl StandaloneCx {
    pub(crate) fn new() -> Self {
        let mut inner = PipelineInner::default();
        inner.entries.push(PolicyEntry {
            hfsm: None,
            inbound: None,
            outbound: None,
            name: "standalone",
        });
        Self { inner }
    }

    pub(crate) fn cx(&mut self) -> PolicyCx<'_> {
        PolicyCx {
            self_index: 0,
            inner: &mut self.inner,
        }
    }
}
