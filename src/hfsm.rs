// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A hierarchical state machine with parent-state fallback and a
//! transition primitive that sequences `Exit`/`Entry` through the
//! closest common ancestor of the source and target states.

use crate::event::{Event, EXIT};
use std::fmt;

/// Outcome of dispatching an event to a single state handler.
#[derive(Debug)]
pub enum Outcome {
    /// The handler consumed the event.
    Handled,
    /// The handler did not recognize the event; re-dispatch to the
    /// parent state, if any.
    HandledBySuperState,
    /// The handler recognized the event but failed to process it.
    Failed(HandlerError),
}

/// A failure returned by a state handler.
#[derive(Debug, Clone)]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    /// Builds a new handler error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The error's message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HandlerError {}

/// Failures `send`/`transition` can report back to the caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    /// No handler up to the root accepted the event.
    #[error("no handler accepted the event")]
    Unhandled,
    /// A handler rejected the event.
    #[error("handler rejected event: {0}")]
    Rejected(#[from] HandlerError),
    /// `transition` was asked to exit from a state that is not the
    /// current state or one of its ancestors.
    #[error("transition source is not the current state or an ancestor of it")]
    InvalidTransitionSource,
}

/// The contract a hierarchical state machine's states are implemented
/// against. `State` identifies a state (commonly a plain enum); `Context`
/// is whatever side-channel data handlers need (for bare `Hfsm<M>` usage
/// this is typically `()`; policies use a richer context that exposes
/// `send_inbound`/`send_outbound`).
pub trait Machine {
    /// Identifies a state. Implementations are expected to be cheap to
    /// copy (an enum discriminant is the common case).
    type State: Copy + Eq + fmt::Debug + Send;
    /// Side-channel data available to handlers during dispatch. Generic
    /// over a lifetime so contexts that borrow from their caller (such as
    /// [`crate::policy::PolicyCx`], which borrows the pipeline's arena for
    /// the duration of one dispatch) can be used without pinning that
    /// borrow's lifetime into the `Machine` implementation itself.
    type Context<'a>;

    /// The immediate parent of `state`, or `None` if `state` is a root.
    fn parent(&self, state: Self::State) -> Option<Self::State>;

    /// Dispatches `event` to `state`'s handler. Implementations must not
    /// call back into their own `send`/`transition` from within this
    /// method; dispatch is strictly non-reentrant.
    fn dispatch(&mut self, cx: &mut Self::Context<'_>, state: Self::State, event: &Event) -> Outcome;
}

/// A running instance of a [`Machine`]: tracks the current state and
/// drives `send`/`transition` against it.
pub struct Hfsm<M: Machine> {
    machine: M,
    current: Option<M::State>,
}

impl<M: Machine> Hfsm<M> {
    /// Wraps `machine`, uninitialized (no current state) until [`init`]
    /// is called.
    ///
    /// [`init`]: Hfsm::init
    pub fn new(machine: M) -> Self {
        Self {
            machine,
            current: None,
        }
    }

    /// The current state, if `init` has run.
    #[must_use]
    pub fn current(&self) -> Option<M::State> {
        self.current
    }

    /// A reference to the wrapped machine.
    pub fn machine(&self) -> &M {
        &self.machine
    }

    /// A mutable reference to the wrapped machine.
    pub fn machine_mut(&mut self) -> &mut M {
        &mut self.machine
    }

    /// Sets the current state to `initial` and synchronously dispatches
    /// `Entry` to it (and, per the usual bubbling rule, to its ancestors
    /// if the initial handler returns `HandledBySuperState`).
    pub fn init(
        &mut self,
        cx: &mut M::Context<'_>,
        initial: M::State,
    ) -> Result<(), DispatchError> {
        self.current = Some(initial);
        self.dispatch_bubbling(cx, initial, &Event::bare(crate::event::ENTRY))
    }

    /// Dispatches `event` to the current state, bubbling to parents on
    /// `HandledBySuperState` until a handler returns `Handled`/`Failed`
    /// or the root itself returns `HandledBySuperState` (an `Unhandled`
    /// error).
    pub fn send(&mut self, cx: &mut M::Context<'_>, event: &Event) -> Result<(), DispatchError> {
        let current = self.current.expect("Hfsm::send called before init");
        self.dispatch_bubbling(cx, current, event)
    }

    fn dispatch_bubbling(
        &mut self,
        cx: &mut M::Context<'_>,
        mut state: M::State,
        event: &Event,
    ) -> Result<(), DispatchError> {
        loop {
            match self.machine.dispatch(cx, state, event) {
                Outcome::Handled => return Ok(()),
                Outcome::Failed(err) => return Err(DispatchError::Rejected(err)),
                Outcome::HandledBySuperState => match self.machine.parent(state) {
                    Some(parent) => state = parent,
                    None => return Err(DispatchError::Unhandled),
                },
            }
        }
    }

    /// Transitions the current state from `source` to `target`, exiting
    /// up from `source` to (but not including) their closest common
    /// ancestor, then entering down from the first uncommon ancestor to
    /// `target`. `source` must be the current state or one of its
    /// ancestors.
    pub fn transition(
        &mut self,
        cx: &mut M::Context<'_>,
        source: M::State,
        target: M::State,
    ) -> Result<(), DispatchError> {
        let current = self.current.expect("Hfsm::transition called before init");
        if !self.is_self_or_ancestor(source, current) {
            return Err(DispatchError::InvalidTransitionSource);
        }

        let source_chain = self.ancestor_chain(source);
        let target_chain = self.ancestor_chain(target);
        let common = source_chain
            .iter()
            .find(|s| target_chain.contains(s))
            .copied();

        let mut exit_state = source;
        loop {
            if Some(exit_state) == common {
                break;
            }
            if let Outcome::Failed(err) = self.machine.dispatch(cx, exit_state, &Event::bare(EXIT)) {
                return Err(DispatchError::Rejected(err));
            }
            match self.machine.parent(exit_state) {
                Some(parent) => exit_state = parent,
                None => break,
            }
        }

        let mut entry_path: Vec<M::State> = Vec::new();
        let mut cursor = target;
        loop {
            if Some(cursor) == common {
                break;
            }
            entry_path.push(cursor);
            match self.machine.parent(cursor) {
                Some(parent) => cursor = parent,
                None => break,
            }
        }
        entry_path.reverse();

        self.current = Some(target);
        for state in entry_path {
            if let Outcome::Failed(err) =
                self.machine.dispatch(cx, state, &Event::bare(crate::event::ENTRY))
            {
                return Err(DispatchError::Rejected(err));
            }
        }

        Ok(())
    }

    fn ancestor_chain(&self, state: M::State) -> Vec<M::State> {
        let mut chain = vec![state];
        let mut cursor = state;
        while let Some(parent) = self.machine.parent(cursor) {
            chain.push(parent);
            cursor = parent;
        }
        chain
    }

    fn is_self_or_ancestor(&self, candidate: M::State, of: M::State) -> bool {
        self.ancestor_chain(of).contains(&candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Kind, ENTRY};

    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    enum S {
        Root,
        A,
        AChild,
        B,
    }

    struct Counting {
        entries: Vec<S>,
        exits: Vec<S>,
    }

    impl Machine for Counting {
        type State = S;
        type Context<'a> = ();

        fn parent(&self, state: S) -> Option<S> {
            match state {
                S::Root => None,
                S::A | S::B => Some(S::Root),
                S::AChild => Some(S::A),
            }
        }

        fn dispatch(&mut self, _cx: &mut (), state: S, event: &Event) -> Outcome {
            if event.kind() == ENTRY {
                self.entries.push(state);
                Outcome::Handled
            } else if event.kind() == EXIT {
                self.exits.push(state);
                Outcome::Handled
            } else {
                Outcome::HandledBySuperState
            }
        }
    }

    #[test]
    fn init_enters_initial_state() {
        let mut hfsm = Hfsm::new(Counting {
            entries: vec![],
            exits: vec![],
        });
        hfsm.init(&mut (), S::AChild).unwrap();
        assert_eq!(hfsm.machine().entries, vec![S::AChild]);
    }

    #[test]
    fn transition_exits_and_enters_through_common_ancestor() {
        let mut hfsm = Hfsm::new(Counting {
            entries: vec![],
            exits: vec![],
        });
        hfsm.init(&mut (), S::AChild).unwrap();
        hfsm.transition(&mut (), S::AChild, S::B).unwrap();
        assert_eq!(hfsm.machine().exits, vec![S::AChild, S::A]);
        assert_eq!(hfsm.machine().entries, vec![S::AChild, S::B]);
        assert_eq!(hfsm.current(), Some(S::B));
    }

    #[test]
    fn unhandled_event_at_root_is_an_error() {
        let mut hfsm = Hfsm::new(Counting {
            entries: vec![],
            exits: vec![],
        });
        hfsm.init(&mut (), S::Root).unwrap();
        let bogus = Event::bare(Kind::new(crate::event::Facility::User, 99));
        let err = hfsm.send(&mut (), &bogus).unwrap_err();
        assert!(matches!(err, DispatchError::Unhandled));
    }
}
