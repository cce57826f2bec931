// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hand-declared message shapes.

use nexus_abi::CAP_MSG_WORDS;

use super::{ArgKind, MsgType};

/// Payload words available after the type word.
const PAYLOAD_WORDS: usize = CAP_MSG_WORDS - 1;

/// Argument and return shape of one message type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    msg_type: MsgType,
    args: Vec<ArgKind>,
    rets: Vec<ArgKind>,
}

impl Binding {
    /// Declares `msg_type` as taking `args` and returning `rets`.
    pub fn new(msg_type: MsgType, args: &[ArgKind], rets: &[ArgKind]) -> Self {
        Self { msg_type, args: args.to_vec(), rets: rets.to_vec() }
    }

    /// Message type this binding describes.
    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    /// Argument kinds in wire order.
    pub fn args(&self) -> &[ArgKind] {
        &self.args
    }

    /// Return kinds in wire order.
    pub fn rets(&self) -> &[ArgKind] {
        &self.rets
    }

    /// Returns `true` if both directions fit one message: at most three
    /// word-sized values (strings count as their offset word) and one capability.
    pub fn is_simple(&self) -> bool {
        fits_one_message(&self.args) && fits_one_message(&self.rets)
    }

    /// Returns `true` if any argument or return value is a string.
    pub fn uses_strings(&self) -> bool {
        self.args.iter().chain(&self.rets).any(|k| *k == ArgKind::Str)
    }
}

fn fits_one_message(kinds: &[ArgKind]) -> bool {
    let caps = kinds.iter().filter(|k| **k == ArgKind::Cap).count();
    kinds.len() - caps <= PAYLOAD_WORDS && caps <= 1
}
