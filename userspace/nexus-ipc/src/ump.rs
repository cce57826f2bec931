// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Lock-free shared-memory channel between cores
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (host), loom model (feature `loom`), tests/ump_fifo.rs
//!
//! SLOT LAYOUT (one slot = `msg_size` bytes, normally one cache line):
//!   word 0          flag byte in bits 0..8, remaining bits zero
//!   words 1..W+1    payload, W = msg_size / 8 - 1
//!
//! FLAG STATES:
//!   - FREE (0): never written; a zeroed pane is all FREE
//!   - SENT (1): written by the pane owner, not yet consumed
//!   - RECEIVED (2): consumed by the reader, slot may be reused
//!
//! INVARIANTS:
//!   - Each pane has exactly one writer of payload words (the sender) and the
//!     flag word alternates ownership through the SENT/RECEIVED handshake
//!   - Payload is written before the flag is published (Release) and read
//!     after the flag is observed (Acquire)
//!   - Cursors are private to each party and advance modulo the slot count
//!   - Delivery is FIFO per direction
//!
//! ADR: docs/adr/0003-ipc-runtime-architecture.md

use core::fmt;
use std::sync::Arc;

use nexus_abi::sync::{fence, Ordering};
use nexus_abi::{MappedFrame, WORD_SIZE};

use crate::{IpcError, Result};

/// Largest supported slot, four cache lines.
pub const MAX_MSG_SIZE: usize = 256;

/// Words in the largest supported slot; sizes scratch buffers for one message.
pub(crate) const MAX_MSG_WORDS: usize = MAX_MSG_SIZE / WORD_SIZE;

const FLAG_MASK: u64 = 0xff;
const FLAG_FREE: u64 = 0;
const FLAG_SENT: u64 = 1;
const FLAG_RECEIVED: u64 = 2;

/// Notification target signalled when a peer expects a push on every send.
pub trait Notify: Send + Sync {
    /// Signals the target.
    fn ring(&self);

    /// Consumes a pending signal, returning `true` if one was pending.
    fn take(&self) -> bool;
}

/// One end of a shared-memory channel.
pub struct UmpChannel {
    send_pane: MappedFrame,
    recv_pane: MappedFrame,
    msg_size: usize,
    slots: usize,
    send_index: usize,
    recv_index: usize,
    local_target: Option<Arc<dyn Notify>>,
    remote_target: Option<Arc<dyn Notify>>,
}

impl UmpChannel {
    /// Builds a channel over two disjoint panes with `msg_size`-byte slots.
    ///
    /// Fails with [`IpcError::InvalidSize`] when `msg_size` is not a multiple of
    /// the word size, leaves no payload word after the flag, exceeds
    /// [`MAX_MSG_SIZE`] or does not divide a non-empty pane.
    pub fn new(msg_size: usize, send_pane: MappedFrame, recv_pane: MappedFrame) -> Result<Self> {
        validate_msg_size(msg_size)?;
        for pane in [&send_pane, &recv_pane] {
            if pane.is_empty() || pane.len() % msg_size != 0 {
                return Err(IpcError::InvalidSize);
            }
        }
        if send_pane.len() != recv_pane.len() {
            return Err(IpcError::InvalidSize);
        }
        let slots = send_pane.len() / msg_size;
        Ok(Self {
            send_pane,
            recv_pane,
            msg_size,
            slots,
            send_index: 0,
            recv_index: 0,
            local_target: None,
            remote_target: None,
        })
    }

    /// Builds one end of a channel over a frame mapped by both parties.
    ///
    /// The frame is split into equal halves; the end created with
    /// `first_half == true` sends on the lower half, its peer on the upper.
    pub fn over_frame(frame: &MappedFrame, msg_size: usize, first_half: bool) -> Result<Self> {
        let (low, high) = frame.split_at(frame.len() / 2).ok_or(IpcError::InvalidSize)?;
        if first_half {
            Self::new(msg_size, low, high)
        } else {
            Self::new(msg_size, high, low)
        }
    }

    /// Bytes per slot, including the flag word.
    pub fn msg_size(&self) -> usize {
        self.msg_size
    }

    /// Payload words carried by one message.
    pub fn payload_words(&self) -> usize {
        self.msg_size / WORD_SIZE - 1
    }

    /// Number of slots in each pane.
    pub fn slot_count(&self) -> usize {
        self.slots
    }

    /// Publishes `payload` in the next send slot.
    ///
    /// Returns `Ok(false)` without touching the slot when the peer has not yet
    /// consumed its previous occupant. Missing trailing words are zeroed; a
    /// payload longer than [`UmpChannel::payload_words`] fails with
    /// [`IpcError::InvalidSize`].
    pub fn send(&mut self, payload: &[u64]) -> Result<bool> {
        if payload.len() > self.payload_words() {
            return Err(IpcError::InvalidSize);
        }
        let base = self.slot_base(self.send_index);
        let flag = self.send_pane.load(base, Ordering::Acquire) & FLAG_MASK;
        if flag != FLAG_FREE && flag != FLAG_RECEIVED {
            return Ok(false);
        }
        for i in 0..self.payload_words() {
            let word = payload.get(i).copied().unwrap_or(0);
            self.send_pane.store(base + 1 + i, word, Ordering::Relaxed);
        }
        fence(Ordering::Release);
        self.send_pane.store(base, FLAG_SENT, Ordering::Release);
        self.send_index = (self.send_index + 1) % self.slots;
        if let Some(target) = &self.remote_target {
            target.ring();
        }
        Ok(true)
    }

    /// Returns `true` if the next receive slot holds an unconsumed message.
    pub fn can_receive(&self) -> bool {
        let base = self.slot_base(self.recv_index);
        self.recv_pane.load(base, Ordering::Acquire) & FLAG_MASK == FLAG_SENT
    }

    /// Copies the next message into `out` and hands its slot back to the sender.
    ///
    /// Never blocks; returns `false` when nothing is waiting.
    pub fn receive(&mut self, out: &mut [u64]) -> bool {
        let base = self.slot_base(self.recv_index);
        if self.recv_pane.load(base, Ordering::Acquire) & FLAG_MASK != FLAG_SENT {
            return false;
        }
        fence(Ordering::Acquire);
        for (i, word) in out.iter_mut().take(self.payload_words()).enumerate() {
            *word = self.recv_pane.load(base + 1 + i, Ordering::Relaxed);
        }
        fence(Ordering::Release);
        self.recv_pane.store(base, FLAG_RECEIVED, Ordering::Release);
        self.recv_index = (self.recv_index + 1) % self.slots;
        true
    }

    /// Switches local delivery from polling to notifications on `target`.
    pub fn switch_local_pinged(&mut self, target: Arc<dyn Notify>) -> Result<()> {
        if self.local_target.is_some() {
            return Err(IpcError::AlreadyPinged);
        }
        self.local_target = Some(target);
        Ok(())
    }

    /// Signals `target` after every subsequent send.
    pub fn switch_remote_pinged(&mut self, target: Arc<dyn Notify>) {
        self.remote_target = Some(target);
    }

    /// Returns `true` if local delivery is notification driven.
    pub fn local_is_pinged(&self) -> bool {
        self.local_target.is_some()
    }

    /// Returns `true` if the peer is signalled on every send.
    pub fn remote_is_pinged(&self) -> bool {
        self.remote_target.is_some()
    }

    /// Event-loop check: consumes a pending notification in pinged mode,
    /// falls back to [`UmpChannel::can_receive`] when polled.
    pub fn take_notification(&self) -> bool {
        match &self.local_target {
            Some(target) => target.take(),
            None => self.can_receive(),
        }
    }

    fn slot_base(&self, index: usize) -> usize {
        index * (self.msg_size / WORD_SIZE)
    }
}

impl fmt::Debug for UmpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UmpChannel")
            .field("msg_size", &self.msg_size)
            .field("slots", &self.slots)
            .field("send_index", &self.send_index)
            .field("recv_index", &self.recv_index)
            .field("local_is_pinged", &self.local_is_pinged())
            .field("remote_is_pinged", &self.remote_is_pinged())
            .finish()
    }
}

/// Checks that `msg_size` is word-granular, leaves room for a payload word and
/// fits a scratch buffer of [`MAX_MSG_WORDS`].
pub(crate) fn validate_msg_size(msg_size: usize) -> Result<()> {
    if msg_size % WORD_SIZE != 0 || msg_size / WORD_SIZE < 2 || msg_size > MAX_MSG_SIZE {
        return Err(IpcError::InvalidSize);
    }
    Ok(())
}
