// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: In-process kernel emulation for host-based testing
//!
//! OWNERS: @runtime
//!
//! PUBLIC API:
//!   - HostKernel: endpoint, frame and capability-slot provider shared by both parties
//!   - HostKernel::channel(): bound endpoint pair
//!   - struct LoopbackEndpoint: CapEndpoint backed by bounded in-memory queues
//!   - struct Doorbell: Notify target for pinged shared-memory channels
//!
//! SEMANTICS:
//!   - Capability references are global to the host kernel, so a capability
//!     sent by one party names the same object for the receiver
//!   - A full peer queue reports ChanError::Transient, like a saturated endpoint
//!   - SYNC sends are counted but do not block; the host has no scheduler to hand off to
//!
//! ERROR CONDITIONS:
//!   - ChanError::NotConnected: endpoint has no remote
//!   - ChanError::NoSuchEndpoint: remote was never created
//!   - ChanError::NoMessage: recv on an empty queue
//!   - ChanError::InvalidCap: map_frame on something that is not a frame
//!
//! DEPENDENCIES:
//!   - parking_lot::Mutex: kernel state shared between test threads
//!
//! ADR: docs/adr/0003-ipc-runtime-architecture.md

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use nexus_abi::{
    CapEndpoint, CapRef, ChanError, FrameAlloc, MappedFrame, RecvMsg, SendFlags, CAP_MSG_WORDS,
};
use parking_lot::Mutex;

use crate::config::IpcConfig;
use crate::ump::Notify;

const DEFAULT_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Default)]
struct KernelState {
    next_slot: u32,
    endpoints: HashMap<CapRef, VecDeque<RecvMsg>>,
    frames: HashMap<CapRef, MappedFrame>,
    sync_sends: usize,
    recv_slots: usize,
}

impl KernelState {
    fn alloc_slot(&mut self) -> nexus_abi::Result<CapRef> {
        let slot = self.next_slot;
        self.next_slot = slot.checked_add(1).ok_or(ChanError::NoSpace)?;
        Ok(CapRef::new(slot))
    }
}

/// Shared in-process stand-in for the kernel.
#[derive(Clone, Debug)]
pub struct HostKernel {
    state: Arc<Mutex<KernelState>>,
    queue_depth: usize,
}

impl Default for HostKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl HostKernel {
    /// Creates a kernel whose endpoints queue up to 16 messages.
    pub fn new() -> Self {
        Self::with_queue_depth(DEFAULT_QUEUE_DEPTH)
    }

    /// Creates a kernel whose endpoints queue up to `queue_depth` messages.
    pub fn with_queue_depth(queue_depth: usize) -> Self {
        Self { state: Arc::new(Mutex::new(KernelState::default())), queue_depth: queue_depth.max(1) }
    }

    /// Creates a kernel sized by `config.host`.
    pub fn from_config(config: &IpcConfig) -> Self {
        Self::with_queue_depth(config.host.queue_depth)
    }

    /// Creates an unbound endpoint.
    pub fn endpoint(&self) -> nexus_abi::Result<LoopbackEndpoint> {
        let mut state = self.state.lock();
        let local = state.alloc_slot()?;
        state.endpoints.insert(local, VecDeque::new());
        Ok(LoopbackEndpoint { kernel: self.clone(), local, remote: None, armed: false })
    }

    /// Creates two endpoints bound to each other.
    pub fn channel(&self) -> nexus_abi::Result<(LoopbackEndpoint, LoopbackEndpoint)> {
        let mut a = self.endpoint()?;
        let mut b = self.endpoint()?;
        a.set_remote(b.local());
        b.set_remote(a.local());
        Ok((a, b))
    }

    /// Enqueues `msg` on `endpoint` as if an unrelated sender had sent it.
    pub fn inject(&self, endpoint: CapRef, msg: RecvMsg) -> nexus_abi::Result<()> {
        self.enqueue(endpoint, msg, SendFlags::empty())
    }

    /// Number of messages sent with [`SendFlags::SYNC`] so far.
    pub fn sync_sends(&self) -> usize {
        self.state.lock().sync_sends
    }

    /// Number of capability receive slots handed out so far.
    pub fn recv_slots(&self) -> usize {
        self.state.lock().recv_slots
    }

    /// Messages waiting on `endpoint`.
    pub fn pending(&self, endpoint: CapRef) -> usize {
        self.state.lock().endpoints.get(&endpoint).map_or(0, VecDeque::len)
    }

    fn enqueue(&self, to: CapRef, msg: RecvMsg, flags: SendFlags) -> nexus_abi::Result<()> {
        let mut state = self.state.lock();
        let queue = state.endpoints.get_mut(&to).ok_or(ChanError::NoSuchEndpoint)?;
        if queue.len() >= self.queue_depth {
            return Err(ChanError::Transient);
        }
        queue.push_back(msg);
        if flags.contains(SendFlags::SYNC) {
            state.sync_sends += 1;
        }
        Ok(())
    }
}

impl FrameAlloc for HostKernel {
    fn alloc_slot(&self) -> nexus_abi::Result<CapRef> {
        self.state.lock().alloc_slot()
    }

    fn frame_alloc(&self, bytes: usize) -> nexus_abi::Result<CapRef> {
        let mut state = self.state.lock();
        let cap = state.alloc_slot()?;
        state.frames.insert(cap, MappedFrame::zeroed(bytes));
        Ok(cap)
    }

    fn map_frame(&self, frame: CapRef) -> nexus_abi::Result<MappedFrame> {
        self.state.lock().frames.get(&frame).cloned().ok_or(ChanError::InvalidCap)
    }
}

/// Endpoint backed by a [`HostKernel`] queue.
#[derive(Debug)]
pub struct LoopbackEndpoint {
    kernel: HostKernel,
    local: CapRef,
    remote: Option<CapRef>,
    armed: bool,
}

impl LoopbackEndpoint {
    /// Kernel this endpoint lives in.
    pub fn kernel(&self) -> &HostKernel {
        &self.kernel
    }
}

impl CapEndpoint for LoopbackEndpoint {
    fn local(&self) -> CapRef {
        self.local
    }

    fn remote(&self) -> Option<CapRef> {
        self.remote
    }

    fn set_remote(&mut self, remote: CapRef) {
        self.remote = Some(remote);
    }

    fn send(
        &mut self,
        flags: SendFlags,
        cap: Option<CapRef>,
        words: &[u64; CAP_MSG_WORDS],
    ) -> nexus_abi::Result<()> {
        let remote = self.remote.ok_or(ChanError::NotConnected)?;
        self.kernel.enqueue(remote, RecvMsg { words: *words, cap }, flags)
    }

    fn can_recv(&self) -> bool {
        self.kernel.pending(self.local) > 0
    }

    fn recv(&mut self) -> nexus_abi::Result<RecvMsg> {
        let mut state = self.kernel.state.lock();
        let queue = state.endpoints.get_mut(&self.local).ok_or(ChanError::NoSuchEndpoint)?;
        queue.pop_front().ok_or(ChanError::NoMessage)
    }

    fn alloc_recv_slot(&mut self) -> nexus_abi::Result<()> {
        let mut state = self.kernel.state.lock();
        state.alloc_slot()?;
        state.recv_slots += 1;
        Ok(())
    }

    fn register_recv(&mut self) -> nexus_abi::Result<()> {
        self.armed = true;
        Ok(())
    }

    fn take_event(&mut self) -> bool {
        if self.armed && self.can_recv() {
            self.armed = false;
            return true;
        }
        false
    }
}

#[derive(Debug, Default)]
struct Bell {
    pending: AtomicBool,
    rings: AtomicUsize,
}

/// Cross-core notification target; rings accumulate into one pending flag.
#[derive(Clone, Debug, Default)]
pub struct Doorbell(Arc<Bell>);

impl Doorbell {
    /// Creates a quiet doorbell.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of rings observed.
    pub fn rings(&self) -> usize {
        self.0.rings.load(Ordering::Relaxed)
    }
}

impl Notify for Doorbell {
    fn ring(&self) {
        self.0.rings.fetch_add(1, Ordering::Relaxed);
        self.0.pending.store(true, Ordering::Release);
    }

    fn take(&self) -> bool {
        self.0.pending.swap(false, Ordering::AcqRel)
    }
}
