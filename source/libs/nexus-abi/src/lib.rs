// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(any(test, feature = "loom")), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(missing_docs)]

//! CONTEXT: Capability-channel contract consumed by the userspace IPC runtime
//! OWNERS: @runtime
//! PUBLIC API: CapRef, SendFlags, ChanError, RecvMsg, CapEndpoint, FrameAlloc, MappedFrame
//! DEPENDS_ON: no_std + alloc, bitflags, loom (model checking only)
//! INVARIANTS:
//!   - A capability-channel message is exactly CAP_MSG_WORDS machine words
//!   - At most one capability travels with a message; the receiver re-arms its slot afterwards
//!   - ChanError::Transient is a retry signal, never a terminal failure
//! ADR: docs/adr/0016-kernel-libs-architecture.md

extern crate alloc;

use core::fmt;

pub mod mem;
pub mod sync;

pub use mem::MappedFrame;

/// Size of a machine word in bytes.
pub const WORD_SIZE: usize = core::mem::size_of::<u64>();

/// Number of payload words carried by one capability-channel message.
pub const CAP_MSG_WORDS: usize = 4;

/// Result type returned by ABI helpers.
pub type Result<T> = core::result::Result<T, ChanError>;

/// Errors surfaced by the kernel endpoint primitive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChanError {
    /// Receiver buffer momentarily full; the caller must retry.
    Transient,
    /// No remote endpoint is bound to the channel.
    NotConnected,
    /// No message is queued on the endpoint.
    NoMessage,
    /// Referenced endpoint does not exist.
    NoSuchEndpoint,
    /// Capability reference does not name an object of the expected kind.
    InvalidCap,
    /// Out of capability slots or frame memory.
    NoSpace,
}

impl ChanError {
    /// Returns `true` when the failure clears up by retrying.
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl fmt::Display for ChanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "endpoint buffer full"),
            Self::NotConnected => write!(f, "endpoint not connected"),
            Self::NoMessage => write!(f, "no message pending"),
            Self::NoSuchEndpoint => write!(f, "no such endpoint"),
            Self::InvalidCap => write!(f, "invalid capability"),
            Self::NoSpace => write!(f, "out of capability space"),
        }
    }
}

/// Unforgeable reference to a kernel object, named by its slot in the holder's cspace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CapRef(u32);

impl CapRef {
    /// Wraps a raw capability slot number.
    pub const fn new(slot: u32) -> Self {
        Self(slot)
    }

    /// Returns the raw slot number.
    pub const fn slot(self) -> u32 {
        self.0
    }
}

impl fmt::Display for CapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cap#{}", self.0)
    }
}

bitflags::bitflags! {
    /// Flags accepted by [`CapEndpoint::send`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct SendFlags: u32 {
        /// Yield to the receiver after enqueueing.
        const YIELD = 1 << 0;
        /// Synchronous send: the sender waits for the receiver to acknowledge.
        const SYNC = 1 << 1;
    }
}

impl Default for SendFlags {
    fn default() -> Self {
        Self::YIELD
    }
}

/// Message dequeued from an endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct RecvMsg {
    /// Payload words; word 0 conventionally carries a type or length tag.
    pub words: [u64; CAP_MSG_WORDS],
    /// Capability transferred with the message, if any.
    pub cap: Option<CapRef>,
}

/// Point-to-point, core-local endpoint carrying words plus at most one capability.
///
/// Implementations are owned by exactly one process; none of the methods block.
pub trait CapEndpoint {
    /// Capability naming this end of the channel.
    fn local(&self) -> CapRef;

    /// Capability naming the peer, absent until a bind handshake completes.
    fn remote(&self) -> Option<CapRef>;

    /// Rebinds the channel to a new peer endpoint.
    fn set_remote(&mut self, remote: CapRef);

    /// Enqueues one message on the peer endpoint.
    ///
    /// Returns [`ChanError::Transient`] when the peer's buffer is momentarily full.
    fn send(
        &mut self,
        flags: SendFlags,
        cap: Option<CapRef>,
        words: &[u64; CAP_MSG_WORDS],
    ) -> Result<()>;

    /// Returns `true` if a message is waiting.
    fn can_recv(&self) -> bool;

    /// Dequeues one message, or fails with [`ChanError::NoMessage`].
    fn recv(&mut self) -> Result<RecvMsg>;

    /// Provides a fresh slot for the next incoming capability.
    fn alloc_recv_slot(&mut self) -> Result<()>;

    /// Arms a one-shot receive notification for the event loop.
    fn register_recv(&mut self) -> Result<()>;

    /// Consumes the receive notification if it is armed and a message is waiting.
    fn take_event(&mut self) -> bool;
}

/// Capability and frame allocation collaborator.
pub trait FrameAlloc {
    /// Allocates an empty capability slot.
    fn alloc_slot(&self) -> Result<CapRef>;

    /// Allocates a frame of at least `bytes` bytes and returns its capability.
    fn frame_alloc(&self, bytes: usize) -> Result<CapRef>;

    /// Maps the frame named by `frame` into the caller's address space.
    fn map_frame(&self, frame: CapRef) -> Result<MappedFrame>;
}
