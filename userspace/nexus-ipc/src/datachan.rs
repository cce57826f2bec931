// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Buffered, fragmenting byte stream over either transport
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (host) + tests/datachan_fragments.rs
//!
//! WIRE FORMAT (W = payload words per backend message):
//!   - first message of a logical send: word 0 = total byte length, words 1..W = data
//!   - continuation messages: words 0..W = data
//!   - close notification: word 0 = CLOSE_SENTINEL in place of a length
//!   - bytes are packed little-endian into words; the tail word is zero padded
//!   - W never exceeds MAX_MSG_WORDS, so one message fits a stack scratch buffer
//!
//! INVARIANTS:
//!   - `bytes_left` alone decides whether word 0 of the next message is a length
//!     marker (0) or payload (> 0)
//!   - Bytes that do not fit the ring are parked in arrival order and replayed
//!     before any further backend message is pulled
//!   - `is_closed` only ever goes from false to true
//!
//! ADR: docs/adr/0003-ipc-runtime-architecture.md

use std::collections::VecDeque;

use log::{debug, warn};
use nexus_abi::{CapEndpoint, SendFlags, CAP_MSG_WORDS, WORD_SIZE};

use crate::config::IpcConfig;
use crate::ringbuf::RingBuffer;
use crate::spin::{retry_transient, spin_until, ThreadYield, Yield};
use crate::ump::{UmpChannel, MAX_MSG_WORDS};
use crate::{IpcError, Result};

/// Length marker announcing that the sender closed the stream.
pub const CLOSE_SENTINEL: u64 = u64::MAX;

/// Transport a [`DataChannel`] runs over.
#[derive(Debug)]
pub enum DataBackend<E> {
    /// Kernel capability channel (same core).
    Cap(E),
    /// Shared-memory channel (across cores).
    Ump(UmpChannel),
}

impl<E: CapEndpoint> DataBackend<E> {
    fn words(&self) -> usize {
        match self {
            Self::Cap(_) => CAP_MSG_WORDS,
            Self::Ump(chan) => chan.payload_words(),
        }
    }

    fn can_receive(&self) -> bool {
        match self {
            Self::Cap(ep) => ep.can_recv(),
            Self::Ump(chan) => chan.can_receive(),
        }
    }

    fn receive(&mut self, hook: &dyn Yield, out: &mut [u64]) -> Result<bool> {
        match self {
            Self::Cap(ep) => {
                let msg = match retry_transient(hook, || ep.recv()) {
                    Ok(msg) => msg,
                    Err(nexus_abi::ChanError::NoMessage) => return Ok(false),
                    Err(err) => return Err(err.into()),
                };
                if msg.cap.is_some() {
                    ep.alloc_recv_slot()?;
                }
                out.copy_from_slice(&msg.words);
                Ok(true)
            }
            Self::Ump(chan) => Ok(chan.receive(out)),
        }
    }

    fn send(&mut self, hook: &dyn Yield, words: &[u64], flags: SendFlags) -> Result<()> {
        match self {
            Self::Cap(ep) => {
                let mut msg = [0u64; CAP_MSG_WORDS];
                msg[..words.len()].copy_from_slice(words);
                retry_transient(hook, || ep.send(flags, None, &msg))?;
            }
            Self::Ump(chan) => {
                if words.len() > chan.payload_words() {
                    return Err(IpcError::InvalidSize);
                }
                spin_until(hook, || matches!(chan.send(words), Ok(true)));
            }
        }
        Ok(())
    }

    fn check_connected(&self) -> Result<()> {
        match self {
            Self::Cap(ep) if ep.remote().is_none() => Err(IpcError::NotConnected),
            _ => Ok(()),
        }
    }
}

/// What one backend message contributed to the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fragment {
    Start(u64),
    Continuation,
    Close,
}

/// Byte stream with reassembly over a fixed-size-message transport.
pub struct DataChannel<E> {
    backend: DataBackend<E>,
    ring: RingBuffer,
    pending: VecDeque<u8>,
    bytes_left: u64,
    closed: bool,
    hook: Box<dyn Yield + Send>,
}

impl<E: CapEndpoint> DataChannel<E> {
    /// Creates a channel whose ring buffer is `buffer_len` bytes long.
    pub fn new(backend: DataBackend<E>, buffer_len: usize) -> Result<Self> {
        Ok(Self {
            backend,
            ring: RingBuffer::new(buffer_len)?,
            pending: VecDeque::new(),
            bytes_left: 0,
            closed: false,
            hook: Box::new(ThreadYield),
        })
    }

    /// Creates a channel sized by `config.datachan`.
    pub fn from_config(backend: DataBackend<E>, config: &IpcConfig) -> Result<Self> {
        Self::new(backend, config.datachan.buffer_len)
    }

    /// Replaces the hook used while waiting on the backend.
    pub fn with_yield(mut self, hook: impl Yield + Send + 'static) -> Self {
        self.hook = Box::new(hook);
        self
    }

    /// Underlying transport.
    pub fn backend(&self) -> &DataBackend<E> {
        &self.backend
    }

    /// Underlying transport, mutably (e.g. to switch notification modes).
    pub fn backend_mut(&mut self) -> &mut DataBackend<E> {
        &mut self.backend
    }

    /// Returns `true` once either side closed the stream.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Bytes already reassembled and waiting to be read.
    pub fn buffered(&self) -> usize {
        self.ring.len() + self.pending.len()
    }

    /// Sends `data` as one logical message, fragmenting as needed.
    ///
    /// Spins while the transport is saturated. A closed stream refuses new data.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(IpcError::Closed);
        }
        let total = u64::try_from(data.len()).map_err(|_| IpcError::InvalidSize)?;
        if total == CLOSE_SENTINEL {
            return Err(IpcError::InvalidSize);
        }
        self.backend.check_connected()?;

        let words = self.backend.words();
        let is_cap = matches!(self.backend, DataBackend::Cap(_));
        let mut scratch = [0u64; MAX_MSG_WORDS];
        let msg = &mut scratch[..words];
        let head_len = data.len().min((words - 1) * WORD_SIZE);
        msg[0] = total;
        pack(&data[..head_len], &mut msg[1..]);
        self.backend.send(self.hook.as_ref(), msg, SendFlags::default())?;

        let mut chunks = data[head_len..].chunks(words * WORD_SIZE).peekable();
        while let Some(chunk) = chunks.next() {
            msg.fill(0);
            pack(chunk, msg);
            let flags = if is_cap && chunks.peek().is_none() {
                SendFlags::default() | SendFlags::SYNC
            } else {
                SendFlags::default()
            };
            self.backend.send(self.hook.as_ref(), msg, flags)?;
        }
        Ok(())
    }

    /// Copies whatever is available into `out` without blocking.
    ///
    /// Drains buffered bytes first, then pulls backend messages while more is
    /// wanted and the backend has data ready. May return zero.
    pub fn receive_available(&mut self, out: &mut [u8]) -> Result<usize> {
        let mut got = 0;
        loop {
            got += self.ring.read(&mut out[got..]);
            if got == out.len() {
                return Ok(got);
            }
            if !self.pending.is_empty() {
                self.flush_pending();
                continue;
            }
            if self.closed || self.pull()?.is_none() {
                return Ok(got);
            }
        }
    }

    /// Waits until at least one byte arrives or the stream is closed.
    pub fn receive(&mut self, out: &mut [u8]) -> Result<usize> {
        loop {
            let got = self.receive_available(out)?;
            if got > 0 || out.is_empty() || self.closed {
                return Ok(got);
            }
            self.hook.yield_now();
        }
    }

    /// Fills `out` completely, waiting on the backend as needed.
    ///
    /// Fails with [`IpcError::Closed`] if the stream closes first; bytes read
    /// before the failure are consumed.
    pub fn receive_all(&mut self, out: &mut [u8]) -> Result<()> {
        let mut got = 0;
        while got < out.len() {
            got += self.receive_available(&mut out[got..])?;
            if got == out.len() {
                break;
            }
            if self.closed && self.buffered() == 0 {
                debug!("stream closed with {} of {} bytes delivered", got, out.len());
                return Err(IpcError::Closed);
            }
            self.hook.yield_now();
        }
        Ok(())
    }

    /// Receives one whole logical message into `out` and returns its length.
    ///
    /// Must be called on a message boundary; [`IpcError::InvalidSize`] otherwise.
    /// A message longer than `out` fails with [`IpcError::Overflow`] and stays
    /// buffered for the byte-stream readers.
    pub fn receive_message(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.bytes_left != 0 || self.buffered() != 0 {
            return Err(IpcError::InvalidSize);
        }
        let total = loop {
            if self.closed {
                return Err(IpcError::Closed);
            }
            match self.pull()? {
                Some(Fragment::Start(len)) => break len,
                Some(_) => return Err(IpcError::Closed),
                None => self.hook.yield_now(),
            }
        };
        let total = usize::try_from(total).map_err(|_| IpcError::Overflow)?;
        if total > out.len() {
            return Err(IpcError::Overflow);
        }
        self.receive_all(&mut out[..total])?;
        Ok(total)
    }

    /// Marks the stream closed and tells the peer, best effort.
    ///
    /// Bytes already buffered stay readable. Closing twice sends nothing new.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut scratch = [0u64; MAX_MSG_WORDS];
        let msg = &mut scratch[..self.backend.words()];
        msg[0] = CLOSE_SENTINEL;
        if let Err(err) = self.backend.send(self.hook.as_ref(), msg, SendFlags::default()) {
            debug!("close notification not delivered: {err}");
        }
    }

    fn pull(&mut self) -> Result<Option<Fragment>> {
        if !self.backend.can_receive() {
            return Ok(None);
        }
        let mut scratch = [0u64; MAX_MSG_WORDS];
        let words = &mut scratch[..self.backend.words()];
        if !self.backend.receive(self.hook.as_ref(), words)? {
            return Ok(None);
        }
        Ok(Some(self.absorb(words)))
    }

    fn absorb(&mut self, words: &[u64]) -> Fragment {
        let (payload, fragment) = if self.bytes_left == 0 {
            let marker = words[0];
            if marker == CLOSE_SENTINEL {
                self.closed = true;
                return Fragment::Close;
            }
            self.bytes_left = marker;
            (&words[1..], Fragment::Start(marker))
        } else {
            (words, Fragment::Continuation)
        };
        let room = (payload.len() * WORD_SIZE) as u64;
        let take = self.bytes_left.min(room) as usize;
        let mut bytes = [0u8; MAX_MSG_WORDS * WORD_SIZE];
        unpack(payload, &mut bytes[..take]);
        self.bytes_left -= take as u64;
        self.stash(&bytes[..take]);
        fragment
    }

    fn stash(&mut self, bytes: &[u8]) {
        let written = if self.pending.is_empty() { self.ring.write(bytes) } else { 0 };
        if written < bytes.len() {
            warn!("ring full, parking {} bytes", bytes.len() - written);
            self.pending.extend(&bytes[written..]);
        }
    }

    fn flush_pending(&mut self) {
        while !self.pending.is_empty() && self.ring.free() > 0 {
            let moved = self.ring.write(self.pending.make_contiguous());
            self.pending.drain(..moved);
        }
    }
}

impl<E: CapEndpoint + core::fmt::Debug> core::fmt::Debug for DataChannel<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DataChannel")
            .field("backend", &self.backend)
            .field("buffered", &self.buffered())
            .field("bytes_left", &self.bytes_left)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Packs `bytes` little-endian into `words`, zero padding the last word used.
pub(crate) fn pack(bytes: &[u8], words: &mut [u64]) {
    for (word, chunk) in words.iter_mut().zip(bytes.chunks(WORD_SIZE)) {
        let mut raw = [0u8; WORD_SIZE];
        raw[..chunk.len()].copy_from_slice(chunk);
        *word = u64::from_le_bytes(raw);
    }
}

/// Fills `out` from the little-endian bytes of `words`.
pub(crate) fn unpack(words: &[u64], out: &mut [u8]) {
    for (chunk, word) in out.chunks_mut(WORD_SIZE).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes()[..chunk.len()]);
    }
}
