// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Example policies built on top of the core pipeline, demonstrating the
//! intended composition pattern. Nothing in the rest of this crate depends
//! on this module.

pub mod reconnect;
