// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Userspace IPC transport and marshalling runtime
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module + host integration tests (tests/)
//!
//! PUBLIC API:
//!   - UmpChannel: lock-free shared-memory ring between cores
//!   - DataChannel: buffered, fragmenting byte stream over either transport
//!   - Rpc / RpcBackend: synchronous call/dispatch engine with per-type marshalling,
//!     over a capability or shared-memory channel
//!   - Binding / ArgKind / Arg: hand-declared interface tables
//!   - RuntimeContext: the process' default RPC instances
//!   - IpcConfig: channel sizing loaded from TOML
//!   - HostKernel: in-process endpoint/frame provider for host builds and tests
//!
//! DEPENDENCIES:
//!   - nexus-abi: capability channel contract, shared frame memory
//!   - parking_lot: host kernel state
//!   - log: diagnostics
//!
//! CONCURRENCY:
//!   - Single-threaded cooperative per process; channel objects are not locked
//!   - Only UmpChannel panes are shared across cores (flag handshake + fences)
//!   - Every wait is an unbounded spin through a `Yield` hook; there are no timeouts

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(missing_docs)]

use nexus_abi::ChanError;
use thiserror::Error;

pub mod config;
pub mod context;
pub mod datachan;
pub mod host;
pub mod ringbuf;
pub mod rpc;
pub mod spin;
pub mod ump;

#[cfg(all(test, feature = "loom"))]
mod loom_tests;

pub use config::{ConfigError, IpcConfig};
pub use context::{RuntimeContext, Service};
pub use datachan::{DataBackend, DataChannel, CLOSE_SENTINEL};
pub use host::{Doorbell, HostKernel, LoopbackEndpoint};
pub use ringbuf::RingBuffer;
pub use rpc::{
    Arg, ArgKind, Binding, Dispatch, Handler, MsgType, Rpc, RpcBackend, RESPONSE_BIT,
};
pub use spin::{SpinYield, ThreadYield, Yield};
pub use ump::{Notify, UmpChannel, MAX_MSG_SIZE};

/// Result type returned by IPC operations.
pub type Result<T> = core::result::Result<T, IpcError>;

/// Errors produced by the IPC runtime.
///
/// Transient transport saturation is absorbed by spin loops and never appears here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum IpcError {
    /// The capability channel has no remote endpoint yet.
    #[error("channel has no remote endpoint")]
    NotConnected,
    /// A reassembled fragment does not fit the receive buffer.
    #[error("fragment does not fit the receive buffer")]
    Overflow,
    /// Dispatch found no handler for the message type.
    #[error("no handler registered for message type {0}")]
    NoHandler(MsgType),
    /// The binding needs marshalling beyond the simple calling convention.
    #[error("binding exceeds the simple calling convention")]
    NotImplemented,
    /// Message, pane or buffer size is unusable.
    #[error("invalid channel size")]
    InvalidSize,
    /// No binding is registered for the message type.
    #[error("no binding registered for message type {0}")]
    UnknownBinding(MsgType),
    /// Argument or return values do not match the binding's kinds.
    #[error("values do not match the binding for message type {0}")]
    ArgMismatch(MsgType),
    /// The reply observed by `call` does not answer the outstanding request.
    #[error("expected reply tag {expected:#x}, received {got:#x}")]
    UnexpectedReply {
        /// Tag the caller waited for.
        expected: u64,
        /// Tag found in word 0 of the received message.
        got: u64,
    },
    /// Another call is already outstanding on the channel.
    #[error("a call is already outstanding on this channel")]
    CallInProgress,
    /// The channel already delivers locally through notifications.
    #[error("channel is already in pinged mode")]
    AlreadyPinged,
    /// A string travelled for a binding whose buffer page is not mapped.
    #[error("no buffer page mapped for message type {0}")]
    NoBufferPage(MsgType),
    /// A string does not fit the remaining buffer page.
    #[error("string does not fit the buffer page")]
    StringTooLong,
    /// The byte stream was closed before the request could be satisfied.
    #[error("channel closed")]
    Closed,
    /// The kernel endpoint failed non-transiently.
    #[error("kernel rejected channel operation: {0}")]
    Kernel(ChanError),
}

impl From<ChanError> for IpcError {
    fn from(err: ChanError) -> Self {
        match err {
            ChanError::NotConnected => Self::NotConnected,
            other => Self::Kernel(other),
        }
    }
}
