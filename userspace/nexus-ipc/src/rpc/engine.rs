// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Call/dispatch engine bound to one channel
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (host) + tests/rpc_roundtrip.rs
//!
//! TRANSPORTS:
//!   - Cap: CAP_MSG_WORDS words plus one capability; strings go through a
//!     per-binding buffer page set up lazily with SETUP_PAGE
//!   - Ump: one shared-memory slot; strings travel inline as a byte-length word
//!     followed by the packed bytes, capabilities are not transferable
//!
//! INVARIANTS:
//!   - At most one call is outstanding per channel; a second call while a reply
//!     is still owed fails with CallInProgress
//!   - A call only accepts a reply tagged `msg_type | RESPONSE_BIT`; anything else
//!     fails the call with UnexpectedReply and leaves the reply owed
//!   - Incoming responses are never dispatched to handlers
//!   - The receive registration is re-armed after every dispatch, success or not
//!   - Registration rejects bindings beyond the simple convention and leaves the
//!     registry untouched
//!   - Transient endpoint failures are retried on both send and receive
//!
//! ADR: docs/adr/0003-ipc-runtime-architecture.md

use core::fmt;
use std::collections::HashMap;

use log::{debug, error, warn};
use nexus_abi::{
    CapEndpoint, CapRef, ChanError, FrameAlloc, MappedFrame, RecvMsg, SendFlags, CAP_MSG_WORDS,
    WORD_SIZE,
};

use super::binding::Binding;
use super::interfaces::{INITIATE, SETUP_PAGE};
use super::{check_kinds, Arg, ArgKind, Dispatch, Handler, MsgType};
use crate::config::IpcConfig;
use crate::datachan::{pack, unpack};
use crate::spin::{retry_transient, spin_until, ThreadYield, Yield};
use crate::ump::{UmpChannel, MAX_MSG_WORDS};
use crate::{IpcError, Result};

const DEFAULT_BUF_PAGE_SIZE: usize = 16 * 1024;

/// Transport an [`Rpc`] instance runs over.
#[derive(Debug)]
pub enum RpcBackend<E> {
    /// Kernel capability channel (same core).
    Cap(E),
    /// Shared-memory channel (across cores).
    Ump(UmpChannel),
}

impl<E: CapEndpoint> RpcBackend<E> {
    fn can_receive(&self) -> bool {
        match self {
            Self::Cap(ep) => ep.can_recv(),
            Self::Ump(chan) => chan.can_receive(),
        }
    }

    fn take_event(&mut self) -> bool {
        match self {
            Self::Cap(ep) => ep.take_event(),
            Self::Ump(chan) => chan.take_notification(),
        }
    }

    fn rearm(&mut self) -> Result<()> {
        if let Self::Cap(ep) = self {
            ep.register_recv()?;
        }
        Ok(())
    }

    fn send(&mut self, hook: &dyn Yield, frame: &Frame) -> Result<()> {
        match self {
            Self::Cap(ep) => {
                let mut words = [0u64; CAP_MSG_WORDS];
                words.copy_from_slice(&frame.words[..CAP_MSG_WORDS]);
                retry_transient(hook, || ep.send(SendFlags::default(), frame.cap, &words))?;
            }
            Self::Ump(chan) => {
                let words = frame.words();
                if frame.cap.is_some() {
                    return Err(IpcError::NotImplemented);
                }
                if words.len() > chan.payload_words() {
                    return Err(IpcError::InvalidSize);
                }
                spin_until(hook, || matches!(chan.send(words), Ok(true)));
            }
        }
        Ok(())
    }

    fn receive(&mut self, hook: &dyn Yield) -> Result<Option<Frame>> {
        match self {
            Self::Cap(ep) => {
                let msg = match retry_transient(hook, || ep.recv()) {
                    Ok(msg) => msg,
                    Err(ChanError::NoMessage) => return Ok(None),
                    Err(err) => return Err(err.into()),
                };
                if msg.cap.is_some() {
                    ep.alloc_recv_slot()?;
                }
                Ok(Some(Frame::from(msg)))
            }
            Self::Ump(chan) => {
                let mut frame = Frame::new(chan.payload_words());
                Ok(chan.receive(&mut frame.words[..frame.len]).then_some(frame))
            }
        }
    }

    fn label(&self) -> String {
        match self {
            Self::Cap(ep) => ep.local().to_string(),
            Self::Ump(chan) => format!("ump/{}", chan.msg_size()),
        }
    }
}

/// One transport message: `len` meaningful words and an optional capability.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Frame {
    words: [u64; MAX_MSG_WORDS],
    len: usize,
    cap: Option<CapRef>,
}

impl Frame {
    fn new(len: usize) -> Self {
        Self { words: [0; MAX_MSG_WORDS], len, cap: None }
    }

    fn words(&self) -> &[u64] {
        &self.words[..self.len]
    }

    fn tag(&self) -> u64 {
        self.words[0]
    }
}

impl From<RecvMsg> for Frame {
    fn from(msg: RecvMsg) -> Self {
        let mut frame = Self::new(CAP_MSG_WORDS);
        frame.words[..CAP_MSG_WORDS].copy_from_slice(&msg.words);
        frame.cap = msg.cap;
        frame
    }
}

/// Buffer page mappings of one binding.
///
/// `local` backs strings of calls this end makes; `remote` is the page the peer
/// set up for calls it makes to us.
#[derive(Debug, Default)]
struct BufPage {
    local: Option<MappedFrame>,
    remote: Option<MappedFrame>,
}

#[derive(Debug)]
struct Entry {
    binding: Binding,
    page: BufPage,
}

/// RPC endpoint: caller and callee roles on one channel.
pub struct Rpc<E> {
    backend: RpcBackend<E>,
    frames: Option<Box<dyn FrameAlloc + Send>>,
    bindings: HashMap<MsgType, Entry>,
    handlers: HashMap<MsgType, Box<dyn Handler + Send>>,
    page_size: usize,
    awaiting: Option<MsgType>,
    hook: Box<dyn Yield + Send>,
}

impl<E: CapEndpoint> Rpc<E> {
    /// Binds an RPC instance to `ep` and arms its receive notification.
    ///
    /// The page-setup and initiate bindings are always installed.
    pub fn new(mut ep: E, frames: impl FrameAlloc + Send + 'static) -> Result<Self> {
        ep.alloc_recv_slot()?;
        ep.register_recv()?;
        Self::with_backend(RpcBackend::Cap(ep), Some(Box::new(frames)))
    }

    /// Binds an RPC instance to a shared-memory channel.
    ///
    /// Requests and replies must each fit one slot; capabilities cannot be
    /// transferred and no buffer pages are used.
    pub fn over_ump(chan: UmpChannel) -> Result<Self> {
        Self::with_backend(RpcBackend::Ump(chan), None)
    }

    /// Like [`Rpc::new`] with the buffer page size taken from `config.rpc`.
    pub fn from_config(
        ep: E,
        frames: impl FrameAlloc + Send + 'static,
        config: &IpcConfig,
    ) -> Result<Self> {
        Ok(Self::new(ep, frames)?.with_page_size(config.rpc.buf_page_size))
    }

    fn with_backend(
        backend: RpcBackend<E>,
        frames: Option<Box<dyn FrameAlloc + Send>>,
    ) -> Result<Self> {
        let mut rpc = Self {
            backend,
            frames,
            bindings: HashMap::new(),
            handlers: HashMap::new(),
            page_size: DEFAULT_BUF_PAGE_SIZE,
            awaiting: None,
            hook: Box::new(ThreadYield),
        };
        rpc.register_binding(Binding::new(
            SETUP_PAGE,
            &[ArgKind::Word, ArgKind::Word, ArgKind::Cap],
            &[],
        ))?;
        rpc.register_binding(Binding::new(INITIATE, &[ArgKind::Cap], &[]))?;
        Ok(rpc)
    }

    /// Sets the size of buffer pages allocated from now on.
    pub fn with_page_size(mut self, bytes: usize) -> Self {
        self.page_size = bytes;
        self
    }

    /// Replaces the hook used while waiting for replies.
    pub fn with_yield(mut self, hook: impl Yield + Send + 'static) -> Self {
        self.hook = Box::new(hook);
        self
    }

    /// Underlying transport.
    pub fn backend(&self) -> &RpcBackend<E> {
        &self.backend
    }

    /// Underlying transport, mutably (e.g. to switch notification modes).
    pub fn backend_mut(&mut self) -> &mut RpcBackend<E> {
        &mut self.backend
    }

    /// Capability endpoint, if this instance runs over one.
    pub fn endpoint(&self) -> Option<&E> {
        match &self.backend {
            RpcBackend::Cap(ep) => Some(ep),
            RpcBackend::Ump(_) => None,
        }
    }

    /// Capability endpoint, mutably.
    pub fn endpoint_mut(&mut self) -> Option<&mut E> {
        match &mut self.backend {
            RpcBackend::Cap(ep) => Some(ep),
            RpcBackend::Ump(_) => None,
        }
    }

    /// Binding registered for `msg_type`.
    pub fn binding(&self, msg_type: MsgType) -> Option<&Binding> {
        self.bindings.get(&msg_type).map(|entry| &entry.binding)
    }

    /// Returns `true` while a reply to an earlier call is still owed.
    pub fn is_call_outstanding(&self) -> bool {
        self.awaiting.is_some()
    }

    /// Adds or replaces the binding for its message type.
    ///
    /// Fails with [`IpcError::NotImplemented`] for bindings that do not fit a
    /// single message; the registry is left as it was.
    pub fn register_binding(&mut self, binding: Binding) -> Result<()> {
        if !binding.is_simple() {
            warn!("rejecting binding for message type {}: not simple", binding.msg_type());
            return Err(IpcError::NotImplemented);
        }
        debug!("binding message type {}", binding.msg_type());
        self.bindings.insert(binding.msg_type(), Entry { binding, page: BufPage::default() });
        Ok(())
    }

    /// Installs `handler` for incoming requests of `msg_type`.
    pub fn register_handler(&mut self, msg_type: MsgType, handler: impl Handler + Send + 'static) {
        self.handlers.insert(msg_type, Box::new(handler));
    }

    /// Installs a closure as the handler for `msg_type`.
    pub fn register_fn<F>(&mut self, msg_type: MsgType, handler: F)
    where
        F: FnMut(&[Arg]) -> Result<Vec<Arg>> + Send + 'static,
    {
        self.register_handler(msg_type, handler);
    }

    /// Performs a synchronous call and returns the reply values.
    ///
    /// Spins until the reply arrives; a silent peer blocks forever.
    pub fn call(&mut self, msg_type: MsgType, args: &[Arg]) -> Result<Vec<Arg>> {
        if self.awaiting.is_some() {
            return Err(IpcError::CallInProgress);
        }
        let binding = self
            .bindings
            .get(&msg_type)
            .map(|entry| entry.binding.clone())
            .ok_or(IpcError::UnknownBinding(msg_type))?;
        check_kinds(msg_type, binding.args(), args)?;
        let paged = matches!(self.backend, RpcBackend::Cap(_));
        // A capability on either side could not cross, and the peer would never answer.
        if !paged && binding.args().iter().chain(binding.rets()).any(|k| *k == ArgKind::Cap) {
            return Err(IpcError::NotImplemented);
        }
        if paged && binding.uses_strings() && self.page(msg_type, Side::Local).is_none() {
            self.setup_page(msg_type)?;
        }
        let request = self.encode(msg_type, msg_type.0, args, Side::Local)?;
        let reply = self.transact(msg_type, &request)?;
        self.decode(msg_type, binding.rets(), &reply, Side::Local)
    }

    /// Receives and serves one incoming message.
    ///
    /// Responses are never dispatched: a late reply to a failed call clears
    /// the outstanding marker, anything else is logged and dropped.
    pub fn on_message(&mut self) -> Result<Dispatch> {
        let outcome = self.serve_one();
        if let Err(err) = self.backend.rearm() {
            error!("re-arming receive on {} failed: {err}", self.backend.label());
        }
        if let Err(err) = &outcome {
            error!("dispatch on {} failed: {err}", self.backend.label());
        }
        outcome
    }

    /// Serves one message if the receive notification fired.
    ///
    /// A polled shared-memory channel fires whenever a message is waiting.
    pub fn dispatch_pending(&mut self) -> Result<Dispatch> {
        if !self.backend.take_event() {
            return Ok(Dispatch::Idle);
        }
        self.on_message()
    }

    fn serve_one(&mut self) -> Result<Dispatch> {
        let Some(msg) = self.receive()? else {
            return Ok(Dispatch::Idle);
        };
        let word0 = msg.tag();
        if MsgType::is_response(word0) {
            if self.awaiting.map(MsgType::response_tag) == Some(word0) {
                warn!("discarding late reply {word0:#x}");
                self.awaiting = None;
            } else {
                warn!("stray response {word0:#x}");
            }
            return Ok(Dispatch::StrayResponse(word0));
        }

        let msg_type = MsgType(word0);
        let binding = self
            .bindings
            .get(&msg_type)
            .map(|entry| entry.binding.clone())
            .ok_or(IpcError::UnknownBinding(msg_type))?;
        let args = self.decode(msg_type, binding.args(), &msg, Side::Remote)?;

        let (rets, outcome) = if msg_type == SETUP_PAGE {
            self.install_remote_page(&args)?;
            (Vec::new(), Dispatch::Builtin(msg_type))
        } else if msg_type == INITIATE {
            let remote = args[0].as_cap().ok_or(IpcError::ArgMismatch(msg_type))?;
            let RpcBackend::Cap(ep) = &mut self.backend else {
                return Err(IpcError::NotImplemented);
            };
            debug!("{} bound to {remote}", ep.local());
            ep.set_remote(remote);
            (Vec::new(), Dispatch::Builtin(msg_type))
        } else {
            let handler =
                self.handlers.get_mut(&msg_type).ok_or(IpcError::NoHandler(msg_type))?;
            (handler.handle(&args)?, Dispatch::Handled(msg_type))
        };

        check_kinds(msg_type, binding.rets(), &rets)?;
        let reply = self.encode(msg_type, msg_type.response_tag(), &rets, Side::Remote)?;
        self.send(&reply)?;
        Ok(outcome)
    }

    fn install_remote_page(&mut self, args: &[Arg]) -> Result<()> {
        let (Some(target), Some(size), Some(frame)) =
            (args[0].as_word(), args[1].as_word(), args[2].as_cap())
        else {
            return Err(IpcError::ArgMismatch(SETUP_PAGE));
        };
        let target = MsgType(target);
        let frames = self.frames.as_ref().ok_or(IpcError::NotImplemented)?;
        let mapping = frames.map_frame(frame)?;
        if usize::try_from(size).map_or(true, |size| size > mapping.len()) {
            return Err(IpcError::InvalidSize);
        }
        let entry = self.bindings.get_mut(&target).ok_or(IpcError::UnknownBinding(target))?;
        debug!("mapped peer buffer page for message type {target} ({size} bytes)");
        entry.page.remote = Some(mapping);
        Ok(())
    }

    fn setup_page(&mut self, msg_type: MsgType) -> Result<()> {
        let frames = self.frames.as_ref().ok_or(IpcError::NotImplemented)?;
        let frame = frames.frame_alloc(self.page_size)?;
        let mapping = frames.map_frame(frame)?;
        let args = [Arg::Word(msg_type.0), Arg::Word(self.page_size as u64), Arg::Cap(frame)];
        let request = marshal(SETUP_PAGE, SETUP_PAGE.0, &args, None)?;
        self.transact(SETUP_PAGE, &request)?;
        if let Some(entry) = self.bindings.get_mut(&msg_type) {
            entry.page.local = Some(mapping);
        }
        debug!("buffer page for message type {msg_type} ready ({} bytes)", self.page_size);
        Ok(())
    }

    fn transact(&mut self, msg_type: MsgType, request: &Frame) -> Result<Frame> {
        self.send(request)?;
        self.awaiting = Some(msg_type);

        let reply = loop {
            if self.backend.can_receive() {
                match self.receive() {
                    Ok(Some(reply)) => break reply,
                    Ok(None) => {}
                    Err(err) => {
                        // The reply can no longer be collected on this channel.
                        self.awaiting = None;
                        return Err(err);
                    }
                }
            }
            self.hook.yield_now();
        };
        let expected = msg_type.response_tag();
        if reply.tag() != expected {
            error!(
                "call {msg_type} on {} observed {:#x} instead of its reply",
                self.backend.label(),
                reply.tag()
            );
            return Err(IpcError::UnexpectedReply { expected, got: reply.tag() });
        }
        self.awaiting = None;
        Ok(reply)
    }

    fn send(&mut self, frame: &Frame) -> Result<()> {
        self.backend.send(self.hook.as_ref(), frame)
    }

    fn receive(&mut self) -> Result<Option<Frame>> {
        self.backend.receive(self.hook.as_ref())
    }

    fn encode(&self, msg_type: MsgType, tag: u64, values: &[Arg], side: Side) -> Result<Frame> {
        match &self.backend {
            RpcBackend::Cap(_) => marshal(msg_type, tag, values, self.page(msg_type, side).as_ref()),
            RpcBackend::Ump(chan) => marshal_inline(tag, values, chan.payload_words()),
        }
    }

    fn decode(
        &self,
        msg_type: MsgType,
        kinds: &[ArgKind],
        frame: &Frame,
        side: Side,
    ) -> Result<Vec<Arg>> {
        match &self.backend {
            RpcBackend::Cap(_) => {
                unmarshal(msg_type, kinds, frame, self.page(msg_type, side).as_ref())
            }
            RpcBackend::Ump(_) => unmarshal_inline(msg_type, kinds, frame),
        }
    }

    fn page(&self, msg_type: MsgType, side: Side) -> Option<MappedFrame> {
        let page = &self.bindings.get(&msg_type)?.page;
        match side {
            Side::Local => page.local.clone(),
            Side::Remote => page.remote.clone(),
        }
    }
}

impl<E: CapEndpoint> fmt::Debug for Rpc<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.bindings.keys().map(|t| t.0).collect();
        types.sort_unstable();
        f.debug_struct("Rpc")
            .field("backend", &self.backend.label())
            .field("bindings", &types)
            .field("handlers", &self.handlers.len())
            .field("awaiting", &self.awaiting)
            .finish()
    }
}

#[derive(Clone, Copy)]
enum Side {
    Local,
    Remote,
}

/// Packs `values` behind the tag word: words in order, strings into `page`.
fn marshal(
    msg_type: MsgType,
    tag: u64,
    values: &[Arg],
    page: Option<&MappedFrame>,
) -> Result<Frame> {
    let mut frame = Frame::new(CAP_MSG_WORDS);
    let words = &mut frame.words[..CAP_MSG_WORDS];
    words[0] = tag;
    let mut slot = 1;
    let mut cap = None;
    let mut offset = 0usize;
    for value in values {
        match value {
            Arg::Word(word) => {
                *words.get_mut(slot).ok_or(IpcError::NotImplemented)? = *word;
                slot += 1;
            }
            Arg::Str(s) => {
                let page = page.ok_or(IpcError::NoBufferPage(msg_type))?;
                let bytes = s.as_bytes();
                if bytes.contains(&0) {
                    return Err(IpcError::ArgMismatch(msg_type));
                }
                let end = offset + bytes.len() + 1;
                if end > page.len()
                    || !page.write_bytes(offset, bytes)
                    || !page.write_bytes(end - 1, &[0])
                {
                    return Err(IpcError::StringTooLong);
                }
                *words.get_mut(slot).ok_or(IpcError::NotImplemented)? = offset as u64;
                slot += 1;
                offset = end;
            }
            Arg::Cap(c) => {
                if cap.replace(*c).is_some() {
                    return Err(IpcError::NotImplemented);
                }
            }
        }
    }
    frame.cap = cap;
    Ok(frame)
}

/// Unpacks values of `kinds` from `msg`, reading strings out of `page`.
fn unmarshal(
    msg_type: MsgType,
    kinds: &[ArgKind],
    msg: &Frame,
    page: Option<&MappedFrame>,
) -> Result<Vec<Arg>> {
    let words = msg.words();
    let mut slot = 1;
    let mut cap = msg.cap;
    let mut out = Vec::with_capacity(kinds.len());
    for kind in kinds {
        let value = match kind {
            ArgKind::Word => {
                let word = *words.get(slot).ok_or(IpcError::NotImplemented)?;
                slot += 1;
                Arg::Word(word)
            }
            ArgKind::Str => {
                let offset = *words.get(slot).ok_or(IpcError::NotImplemented)?;
                slot += 1;
                let page = page.ok_or(IpcError::NoBufferPage(msg_type))?;
                let bytes = usize::try_from(offset)
                    .ok()
                    .and_then(|offset| page.read_cstr(offset))
                    .ok_or(IpcError::ArgMismatch(msg_type))?;
                Arg::Str(String::from_utf8(bytes).map_err(|_| IpcError::ArgMismatch(msg_type))?)
            }
            ArgKind::Cap => Arg::Cap(cap.take().ok_or(IpcError::ArgMismatch(msg_type))?),
        };
        out.push(value);
    }
    Ok(out)
}

/// Packs `values` inline behind the tag word of a `width`-word slot payload.
///
/// A string travels as its byte length followed by the bytes, little-endian.
fn marshal_inline(tag: u64, values: &[Arg], width: usize) -> Result<Frame> {
    let mut frame = Frame::new(width);
    frame.words[0] = tag;
    let mut slot = 1;
    for value in values {
        match value {
            Arg::Word(word) => {
                if slot >= width {
                    return Err(IpcError::NotImplemented);
                }
                frame.words[slot] = *word;
                slot += 1;
            }
            Arg::Str(s) => {
                let bytes = s.as_bytes();
                let body = bytes.len().div_ceil(WORD_SIZE);
                if slot + 1 + body > width {
                    return Err(IpcError::StringTooLong);
                }
                frame.words[slot] = bytes.len() as u64;
                pack(bytes, &mut frame.words[slot + 1..slot + 1 + body]);
                slot += 1 + body;
            }
            Arg::Cap(_) => return Err(IpcError::NotImplemented),
        }
    }
    Ok(frame)
}

/// Unpacks values of `kinds` from an inline slot payload.
fn unmarshal_inline(msg_type: MsgType, kinds: &[ArgKind], msg: &Frame) -> Result<Vec<Arg>> {
    let words = msg.words();
    let mut slot = 1;
    let mut out = Vec::with_capacity(kinds.len());
    for kind in kinds {
        let value = match kind {
            ArgKind::Word => {
                let word = *words.get(slot).ok_or(IpcError::ArgMismatch(msg_type))?;
                slot += 1;
                Arg::Word(word)
            }
            ArgKind::Str => {
                let len = words
                    .get(slot)
                    .and_then(|len| usize::try_from(*len).ok())
                    .ok_or(IpcError::ArgMismatch(msg_type))?;
                let body = len.div_ceil(WORD_SIZE);
                let packed = words
                    .get(slot + 1..)
                    .and_then(|rest| rest.get(..body))
                    .ok_or(IpcError::ArgMismatch(msg_type))?;
                let mut bytes = vec![0u8; len];
                unpack(packed, &mut bytes);
                slot += 1 + body;
                Arg::Str(String::from_utf8(bytes).map_err(|_| IpcError::ArgMismatch(msg_type))?)
            }
            ArgKind::Cap => return Err(IpcError::NotImplemented),
        };
        out.push(value);
    }
    Ok(out)
}
