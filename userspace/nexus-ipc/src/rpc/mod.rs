// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Synchronous RPC over capability or shared-memory channels
//! OWNERS: @runtime
//!
//! MESSAGE LAYOUT, capability channel (CAP_MSG_WORDS words + one optional capability):
//!   word 0     message type; bit 63 set marks the response to that type
//!   words 1..  packed Word values and string offsets, in binding order
//!   cap slot   the binding's single Cap value, if any
//!
//! Strings do not travel inline here. The caller copies them, NUL-terminated,
//! into a per-binding buffer page that both ends have mapped and sends the byte
//! offset. The page is set up lazily by an implicit SETUP_PAGE call.
//!
//! MESSAGE LAYOUT, shared-memory channel (one slot payload):
//!   word 0     message type, as above
//!   words 1..  Word values; a string is its byte length followed by the bytes
//!              packed little-endian into words
//!
//! Capabilities cannot cross a shared-memory channel.

use core::fmt;

use nexus_abi::CapRef;

use crate::{IpcError, Result};

mod binding;
mod engine;
pub mod interfaces;

pub use binding::Binding;
pub use engine::{Rpc, RpcBackend};

/// Bit of word 0 that tags a message as a response.
pub const RESPONSE_BIT: u64 = 1 << 63;

/// Message type identifier carried in word 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MsgType(pub u64);

impl MsgType {
    /// Word 0 of the response to this message type.
    pub const fn response_tag(self) -> u64 {
        self.0 | RESPONSE_BIT
    }

    /// Returns `true` if `word0` tags a response.
    pub const fn is_response(word0: u64) -> bool {
        word0 & RESPONSE_BIT != 0
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of one argument or return slot in a binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArgKind {
    /// One machine word.
    Word,
    /// String transferred through the buffer page.
    Str,
    /// Capability transferred in the message's capability slot.
    Cap,
}

/// One argument or return value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Arg {
    /// Machine word.
    Word(u64),
    /// UTF-8 string without interior NUL bytes.
    Str(String),
    /// Capability reference.
    Cap(CapRef),
}

impl Arg {
    /// Kind tag of this value.
    pub fn kind(&self) -> ArgKind {
        match self {
            Self::Word(_) => ArgKind::Word,
            Self::Str(_) => ArgKind::Str,
            Self::Cap(_) => ArgKind::Cap,
        }
    }

    /// The word, if this is a [`Arg::Word`].
    pub fn as_word(&self) -> Option<u64> {
        match self {
            Self::Word(w) => Some(*w),
            _ => None,
        }
    }

    /// The string, if this is a [`Arg::Str`].
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The capability, if this is a [`Arg::Cap`].
    pub fn as_cap(&self) -> Option<CapRef> {
        match self {
            Self::Cap(c) => Some(*c),
            _ => None,
        }
    }
}

impl From<u64> for Arg {
    fn from(word: u64) -> Self {
        Self::Word(word)
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<CapRef> for Arg {
    fn from(cap: CapRef) -> Self {
        Self::Cap(cap)
    }
}

/// Server-side implementation of one message type.
///
/// Receives the unmarshalled arguments in binding order and returns values
/// matching the binding's return kinds.
pub trait Handler {
    /// Handles one request.
    fn handle(&mut self, args: &[Arg]) -> Result<Vec<Arg>>;
}

impl<F> Handler for F
where
    F: FnMut(&[Arg]) -> Result<Vec<Arg>>,
{
    fn handle(&mut self, args: &[Arg]) -> Result<Vec<Arg>> {
        self(args)
    }
}

/// Outcome of handling one incoming message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// A registered handler ran and its reply was sent.
    Handled(MsgType),
    /// A built-in protocol message (page setup, initiate) was served.
    Builtin(MsgType),
    /// A response arrived while no call was waiting for it; it was dropped.
    StrayResponse(u64),
    /// Nothing was waiting.
    Idle,
}

/// Checks that `values` have exactly the kinds listed in `kinds`.
pub(crate) fn check_kinds(msg_type: MsgType, kinds: &[ArgKind], values: &[Arg]) -> Result<()> {
    if kinds.len() != values.len() || kinds.iter().zip(values).any(|(k, v)| *k != v.kind()) {
        return Err(IpcError::ArgMismatch(msg_type));
    }
    Ok(())
}
