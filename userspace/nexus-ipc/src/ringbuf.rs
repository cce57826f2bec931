// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Byte ring buffer backing the data channel's reassembly
//! OWNERS: @runtime
//! INVARIANTS:
//!   - One byte is sacrificed: usable capacity is `length - 1`
//!   - `read == write` means empty; the buffer never reports more than `length - 1` bytes
//!   - Copies that straddle the end of storage are split in two explicit phases

use crate::{IpcError, Result};

/// Fixed-capacity byte FIFO.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    storage: Box<[u8]>,
    read: usize,
    write: usize,
}

impl RingBuffer {
    /// Creates a buffer holding up to `length - 1` bytes.
    pub fn new(length: usize) -> Result<Self> {
        if length < 2 {
            return Err(IpcError::InvalidSize);
        }
        Ok(Self { storage: vec![0; length].into_boxed_slice(), read: 0, write: 0 })
    }

    /// Maximum number of bytes the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.storage.len() - 1
    }

    /// Bytes ready to be read.
    pub fn len(&self) -> usize {
        let length = self.storage.len();
        (self.write + length - self.read) % length
    }

    /// Returns `true` if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    /// Bytes that can be written before the buffer is full.
    pub fn free(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Appends as much of `data` as fits and returns the count written.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let count = data.len().min(self.free());
        let length = self.storage.len();
        let first = count.min(length - self.write);
        self.storage[self.write..self.write + first].copy_from_slice(&data[..first]);
        let rest = count - first;
        self.storage[..rest].copy_from_slice(&data[first..count]);
        self.write = (self.write + count) % length;
        count
    }

    /// Moves up to `out.len()` bytes out of the buffer and returns the count read.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let count = out.len().min(self.len());
        let length = self.storage.len();
        let first = count.min(length - self.read);
        out[..first].copy_from_slice(&self.storage[self.read..self.read + first]);
        let rest = count - first;
        out[first..count].copy_from_slice(&self.storage[..rest]);
        self.read = (self.read + count) % length;
        count
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn rejects_degenerate_lengths() {
        assert_eq!(RingBuffer::new(1).unwrap_err(), IpcError::InvalidSize);
        assert_eq!(RingBuffer::new(2).unwrap().capacity(), 1);
    }

    #[test]
    fn sacrificial_byte_caps_fill() {
        let mut ring = RingBuffer::new(4).unwrap();
        assert_eq!(ring.write(b"abcdef"), 3);
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.free(), 0);
        assert_eq!(ring.write(b"x"), 0);
    }

    #[test]
    fn wraps_in_two_phases() {
        let mut ring = RingBuffer::new(4).unwrap();
        let mut out = [0u8; 4];
        assert_eq!(ring.write(b"ab"), 2);
        assert_eq!(ring.read(&mut out[..2]), 2);
        // write cursor at 2: "cde" straddles the end of storage
        assert_eq!(ring.write(b"cde"), 3);
        assert_eq!(ring.read(&mut out), 3);
        assert_eq!(&out[..3], b"cde");
        assert!(ring.is_empty());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Write(Vec<u8>),
        Read(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            proptest::collection::vec(any::<u8>(), 0..12).prop_map(Op::Write),
            (0usize..12).prop_map(Op::Read),
        ]
    }

    proptest! {
        #[test]
        fn matches_a_bounded_fifo(length in 2usize..9, ops in proptest::collection::vec(op(), 0..64)) {
            let mut ring = RingBuffer::new(length).unwrap();
            let mut model = VecDeque::new();
            for op in ops {
                match op {
                    Op::Write(data) => {
                        let written = ring.write(&data);
                        prop_assert_eq!(written, data.len().min(length - 1 - model.len()));
                        model.extend(&data[..written]);
                    }
                    Op::Read(want) => {
                        let mut out = vec![0u8; want];
                        let got = ring.read(&mut out);
                        let expected: Vec<u8> = model.drain(..got.min(model.len())).collect();
                        prop_assert_eq!(&out[..got], &expected[..]);
                        prop_assert_eq!(got, want.min(got + model.len()));
                    }
                }
                prop_assert!(ring.len() <= length - 1);
                prop_assert_eq!(ring.len(), model.len());
            }
        }
    }
}
