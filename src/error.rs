// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Crate-wide error types, following the struct-wrapping-a-kind-enum
//! pattern used throughout this codebase's error surface.

use std::fmt;
use thiserror::Error;

/// Error executing an MQTT outbound operation against the adapter.
#[derive(Debug, Error, Clone)]
#[error("{kind}")]
pub struct OutboundError {
    kind: OutboundErrorKind,
}

impl OutboundError {
    /// Creates a new [`OutboundError`].
    #[must_use]
    pub fn new(kind: OutboundErrorKind) -> Self {
        Self { kind }
    }

    /// Returns the corresponding [`OutboundErrorKind`] for this error.
    #[must_use]
    pub fn kind(&self) -> &OutboundErrorKind {
        &self.kind
    }
}

/// An enumeration of categories of [`OutboundError`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutboundErrorKind {
    /// The operation was requested while the adapter was not in a state
    /// that permits it (e.g. publishing before `ConnAck`).
    WrongState,
    /// An invalid topic name or filter was supplied.
    InvalidTopic,
}

impl fmt::Display for OutboundErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutboundErrorKind::WrongState => {
                write!(f, "operation is not valid in the adapter's current state")
            }
            OutboundErrorKind::InvalidTopic => write!(f, "invalid topic name or filter"),
        }
    }
}
