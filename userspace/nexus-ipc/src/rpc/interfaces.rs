// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Well-known message types and typed client calls
//! OWNERS: @runtime
//!
//! Every process talks to init, the memory server, the process manager and the
//! serial driver through these bindings. Both ends install the same table with
//! [`install_default_bindings`]; servers add handlers for the types they serve.

use nexus_abi::{CapEndpoint, CapRef};

use super::{Arg, ArgKind, Binding, MsgType, Rpc};
use crate::{IpcError, Result};

/// Binds the peer's channel to the caller's endpoint (Cap) -> ().
pub const INITIATE: MsgType = MsgType(0);
/// Delivers one number (Word) -> ().
pub const SEND_NUMBER: MsgType = MsgType(1);
/// Delivers one string (Str) -> ().
pub const SEND_STRING: MsgType = MsgType(2);
/// Requests RAM (bytes: Word, alignment: Word) -> (ram: Cap, bytes: Word).
pub const REQUEST_RAM: MsgType = MsgType(3);
/// Installs a string buffer page (msg_type: Word, size: Word, frame: Cap) -> ().
pub const SETUP_PAGE: MsgType = MsgType(4);
/// Spawns a process (cmdline: Str, core: Word) -> (pid: Word).
pub const PROC_SPAWN: MsgType = MsgType(5);
/// Writes one character to the serial port (Word) -> ().
pub const PUTCHAR: MsgType = MsgType(6);
/// Reads one character from the serial port () -> (Word).
pub const GETCHAR: MsgType = MsgType(7);
/// Does nothing; measures call latency () -> ().
pub const ROUNDTRIP: MsgType = MsgType(10);
/// Looks up a process name (pid: Word) -> (name: Str).
pub const GET_PROC_NAME: MsgType = MsgType(11);
/// Lists running processes () -> (count: Word, pids: Str).
///
/// The list is comma separated with a trailing comma, e.g. `"1,2,3,"`.
pub const GET_PROC_LIST: MsgType = MsgType(12);

/// Installs the default bindings on `rpc`.
pub fn install_default_bindings<E: CapEndpoint>(rpc: &mut Rpc<E>) -> Result<()> {
    use ArgKind::{Cap, Str, Word};
    let table: [(MsgType, &[ArgKind], &[ArgKind]); 9] = [
        (SEND_NUMBER, &[Word], &[]),
        (SEND_STRING, &[Str], &[]),
        (REQUEST_RAM, &[Word, Word], &[Cap, Word]),
        (PROC_SPAWN, &[Str, Word], &[Word]),
        (PUTCHAR, &[Word], &[]),
        (GETCHAR, &[], &[Word]),
        (ROUNDTRIP, &[], &[]),
        (GET_PROC_NAME, &[Word], &[Str]),
        (GET_PROC_LIST, &[], &[Word, Str]),
    ];
    for (msg_type, args, rets) in table {
        rpc.register_binding(Binding::new(msg_type, args, rets))?;
    }
    Ok(())
}

impl<E: CapEndpoint> Rpc<E> {
    /// Sends this end's endpoint so the peer can answer on it.
    ///
    /// Only capability channels have an endpoint to send.
    pub fn initiate(&mut self) -> Result<()> {
        let local = self.endpoint().ok_or(IpcError::NotImplemented)?.local();
        self.call(INITIATE, &[Arg::Cap(local)]).map(drop)
    }

    /// Sends one number.
    pub fn send_number(&mut self, number: u64) -> Result<()> {
        self.call(SEND_NUMBER, &[Arg::Word(number)]).map(drop)
    }

    /// Sends one string.
    pub fn send_string(&mut self, s: &str) -> Result<()> {
        self.call(SEND_STRING, &[Arg::from(s)]).map(drop)
    }

    /// Requests at least `bytes` of RAM; returns the capability and its size.
    pub fn get_ram_cap(&mut self, bytes: u64, alignment: u64) -> Result<(CapRef, u64)> {
        let rets = self.call(REQUEST_RAM, &[Arg::Word(bytes), Arg::Word(alignment)])?;
        Ok((cap_at(REQUEST_RAM, &rets, 0)?, word_at(REQUEST_RAM, &rets, 1)?))
    }

    /// Writes one character to the serial port.
    pub fn serial_putchar(&mut self, c: u8) -> Result<()> {
        self.call(PUTCHAR, &[Arg::Word(u64::from(c))]).map(drop)
    }

    /// Reads one character from the serial port.
    pub fn serial_getchar(&mut self) -> Result<u8> {
        let rets = self.call(GETCHAR, &[])?;
        Ok(word_at(GETCHAR, &rets, 0)? as u8)
    }

    /// Reads characters until carriage return, newline or `max` characters.
    ///
    /// The terminator is not part of the result.
    pub fn get_terminal_input(&mut self, max: usize) -> Result<String> {
        let mut line = Vec::with_capacity(max);
        while line.len() < max {
            match self.serial_getchar()? {
                b'\r' | b'\n' => break,
                c => line.push(c),
            }
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    /// Asks the process manager to spawn `cmdline` on `core`; returns the pid.
    pub fn process_spawn(&mut self, cmdline: &str, core: u64) -> Result<u64> {
        let rets = self.call(PROC_SPAWN, &[Arg::from(cmdline), Arg::Word(core)])?;
        word_at(PROC_SPAWN, &rets, 0)
    }

    /// Looks up the name of process `pid`.
    pub fn process_get_name(&mut self, pid: u64) -> Result<String> {
        let mut rets = self.call(GET_PROC_NAME, &[Arg::Word(pid)])?;
        match rets.pop() {
            Some(Arg::Str(name)) => Ok(name),
            _ => Err(IpcError::ArgMismatch(GET_PROC_NAME)),
        }
    }

    /// Asks the process manager for the pids of all running processes.
    pub fn process_get_all_pids(&mut self) -> Result<Vec<u64>> {
        let rets = self.call(GET_PROC_LIST, &[])?;
        let count = word_at(GET_PROC_LIST, &rets, 0)?;
        let list =
            rets.get(1).and_then(Arg::as_str).ok_or(IpcError::ArgMismatch(GET_PROC_LIST))?;
        parse_pid_list(list, count)
    }

    /// Empty call, for latency measurements.
    pub fn roundtrip(&mut self) -> Result<()> {
        self.call(ROUNDTRIP, &[]).map(drop)
    }
}

fn word_at(msg_type: MsgType, rets: &[Arg], index: usize) -> Result<u64> {
    rets.get(index).and_then(Arg::as_word).ok_or(IpcError::ArgMismatch(msg_type))
}

fn parse_pid_list(list: &str, count: u64) -> Result<Vec<u64>> {
    let pids = list
        .split(',')
        .filter(|pid| !pid.is_empty())
        .map(|pid| pid.trim().parse().map_err(|_| IpcError::ArgMismatch(GET_PROC_LIST)))
        .collect::<Result<Vec<u64>>>()?;
    if pids.len() as u64 != count {
        return Err(IpcError::ArgMismatch(GET_PROC_LIST));
    }
    Ok(pids)
}

fn cap_at(msg_type: MsgType, rets: &[Arg], index: usize) -> Result<CapRef> {
    rets.get(index).and_then(Arg::as_cap).ok_or(IpcError::ArgMismatch(msg_type))
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::host::HostKernel;

    #[test]
    fn default_table_is_simple_and_complete() {
        let kernel = HostKernel::new();
        let (ep, _peer) = kernel.channel().unwrap();
        let mut rpc = Rpc::new(ep, kernel.clone()).unwrap();
        install_default_bindings(&mut rpc).unwrap();
        for t in [
            INITIATE,
            SEND_NUMBER,
            SEND_STRING,
            REQUEST_RAM,
            SETUP_PAGE,
            PROC_SPAWN,
            PUTCHAR,
            GETCHAR,
            ROUNDTRIP,
            GET_PROC_NAME,
            GET_PROC_LIST,
        ] {
            assert!(rpc.binding(t).is_some(), "missing binding {t}");
        }
        assert!(rpc.binding(GET_PROC_NAME).unwrap().uses_strings());
    }

    #[test]
    fn reply_accessors_check_kinds() {
        let rets = [Arg::Cap(CapRef::new(3)), Arg::Word(4096)];
        assert_eq!(cap_at(REQUEST_RAM, &rets, 0), Ok(CapRef::new(3)));
        assert_eq!(word_at(REQUEST_RAM, &rets, 1), Ok(4096));
        assert_eq!(word_at(REQUEST_RAM, &rets, 0), Err(IpcError::ArgMismatch(REQUEST_RAM)));
        assert_eq!(word_at(REQUEST_RAM, &rets, 2), Err(IpcError::ArgMismatch(REQUEST_RAM)));
    }

    #[test]
    fn pid_list_matches_its_count() {
        assert_eq!(parse_pid_list("1,2,30,", 3), Ok(vec![1, 2, 30]));
        assert_eq!(parse_pid_list("", 0), Ok(vec![]));
        assert_eq!(parse_pid_list("4,5", 2), Ok(vec![4, 5]));
        assert_eq!(parse_pid_list("1,2,", 3), Err(IpcError::ArgMismatch(GET_PROC_LIST)));
        assert_eq!(parse_pid_list("1,x,", 2), Err(IpcError::ArgMismatch(GET_PROC_LIST)));
    }

    #[test]
    fn initiate_needs_a_capability_channel() {
        let frame = nexus_abi::MappedFrame::zeroed(256);
        let chan = crate::UmpChannel::over_frame(&frame, 64, true).unwrap();
        let mut rpc = Rpc::<crate::LoopbackEndpoint>::over_ump(chan).unwrap();
        assert_eq!(rpc.initiate(), Err(IpcError::NotImplemented));
    }
}
