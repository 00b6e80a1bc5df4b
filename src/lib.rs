// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![warn(missing_docs)]

//! A hierarchical finite state machine and bidirectional policy pipeline
//! for building MQTT connection-handling stacks, with a normalized
//! adapter contract for plugging in a concrete broker client.

pub use crate::adapter::{AdapterMachine, AdapterOptions, AdapterOptionsBuilder, Backend};
pub use crate::hfsm::{DispatchError, Hfsm, HandlerError, Machine, Outcome};
pub use crate::pipeline::{CriticalErrorHook, Pipeline, PipelineBuilder};
pub use crate::platform::{Platform, SystemPlatform};
pub use crate::policy::{PolicyCx, PolicyError, PolicyHandle};
pub use crate::timer::PipelineTimer;

pub mod adapter;
pub mod error;
pub mod event;
pub mod hfsm;
pub mod pipeline;
pub mod platform;
pub mod policies;
mod policy;
pub mod timer;

#[macro_use]
extern crate derive_builder;

//----------------------------------------------------------------------

/// Include the README doc on a struct when running doctests to validate that the code in the
/// README can compile to verify that it has not rotted.
/// Note that any code that requires network or environment setup will not be able to run,
/// and thus should be annotated by "no_run" in the README.
#[doc = include_str!("../README.md")]
#[cfg(doctest)]
struct ReadmeDoctests;
