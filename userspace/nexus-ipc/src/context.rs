// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-process default RPC channels
//! OWNERS: @runtime
//!
//! A process starts with a single channel to init. Dedicated channels to the
//! memory server, process manager or serial driver are added once they are
//! established; until then requests for those services go through init.

use nexus_abi::CapEndpoint;

use crate::rpc::Rpc;

/// Well-known services a process talks to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Service {
    /// The init process.
    Init,
    /// Memory server.
    Memory,
    /// Process manager.
    Process,
    /// Serial driver.
    Serial,
}

/// Default RPC channels of one process.
#[derive(Debug)]
pub struct RuntimeContext<E: CapEndpoint> {
    init: Rpc<E>,
    memory: Option<Rpc<E>>,
    process: Option<Rpc<E>>,
    serial: Option<Rpc<E>>,
}

impl<E: CapEndpoint> RuntimeContext<E> {
    /// Creates a context around the channel to init.
    pub fn new(init: Rpc<E>) -> Self {
        Self { init, memory: None, process: None, serial: None }
    }

    /// Installs a dedicated channel for `service`, returning the one it replaces.
    ///
    /// Installing [`Service::Init`] swaps the init channel itself.
    pub fn install(&mut self, service: Service, rpc: Rpc<E>) -> Option<Rpc<E>> {
        match service {
            Service::Init => Some(core::mem::replace(&mut self.init, rpc)),
            Service::Memory => self.memory.replace(rpc),
            Service::Process => self.process.replace(rpc),
            Service::Serial => self.serial.replace(rpc),
        }
    }

    /// Returns `true` if `service` has its own channel rather than init's.
    pub fn has_dedicated(&self, service: Service) -> bool {
        match service {
            Service::Init => true,
            Service::Memory => self.memory.is_some(),
            Service::Process => self.process.is_some(),
            Service::Serial => self.serial.is_some(),
        }
    }

    /// Channel used to reach `service`.
    pub fn channel(&mut self, service: Service) -> &mut Rpc<E> {
        let dedicated = match service {
            Service::Init => None,
            Service::Memory => self.memory.as_mut(),
            Service::Process => self.process.as_mut(),
            Service::Serial => self.serial.as_mut(),
        };
        match dedicated {
            Some(rpc) => rpc,
            None => &mut self.init,
        }
    }

    /// Channel to init.
    pub fn init(&mut self) -> &mut Rpc<E> {
        self.channel(Service::Init)
    }

    /// Channel to the memory server.
    pub fn memory(&mut self) -> &mut Rpc<E> {
        self.channel(Service::Memory)
    }

    /// Channel to the process manager.
    pub fn process(&mut self) -> &mut Rpc<E> {
        self.channel(Service::Process)
    }

    /// Channel to the serial driver.
    pub fn serial(&mut self) -> &mut Rpc<E> {
        self.channel(Service::Serial)
    }
}
