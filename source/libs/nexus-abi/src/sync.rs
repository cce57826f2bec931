// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Atomics used for memory shared across cores.
//!
//! With the `loom` feature the std types are replaced by loom's model-checked
//! equivalents so the shared-memory handshake can be explored exhaustively.

#[cfg(feature = "loom")]
pub use loom::sync::atomic::{fence, AtomicU64, Ordering};
#[cfg(feature = "loom")]
pub use loom::sync::Arc;

#[cfg(not(feature = "loom"))]
pub use alloc::sync::Arc;
#[cfg(not(feature = "loom"))]
pub use core::sync::atomic::{fence, AtomicU64, Ordering};
