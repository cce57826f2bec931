// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Mapped frame memory shared between processes
//! OWNERS: @runtime
//! INVARIANTS:
//!   - Memory is word-granular; every access goes through an atomic word
//!   - Sub-views never extend past their parent view
//!   - Byte order inside a word is little-endian
//!
//! A [`MappedFrame`] is a cheap, cloneable view of a frame that both parties of a
//! channel have mapped. All accesses are atomic, so the view is safe to hand to
//! another core; ordering between accesses is the caller's responsibility.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use crate::sync::{Arc, AtomicU64, Ordering};
use crate::WORD_SIZE;

/// View of a mapped frame (or a word-aligned window into one).
#[derive(Clone)]
pub struct MappedFrame {
    words: Arc<Box<[AtomicU64]>>,
    start: usize,
    len: usize,
}

impl MappedFrame {
    /// Allocates zeroed backing memory of at least `bytes` bytes.
    pub fn zeroed(bytes: usize) -> Self {
        let len = bytes.div_ceil(WORD_SIZE);
        let words: Vec<AtomicU64> = (0..len).map(|_| AtomicU64::new(0)).collect();
        Self { words: Arc::new(words.into_boxed_slice()), start: 0, len }
    }

    /// Length of the view in bytes.
    pub fn len(&self) -> usize {
        self.len * WORD_SIZE
    }

    /// Returns `true` for a zero-length view.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Length of the view in words.
    pub fn word_len(&self) -> usize {
        self.len
    }

    /// Returns a window of `len` bytes starting at byte `offset`.
    ///
    /// Both values must be word-aligned and lie inside this view.
    pub fn window(&self, offset: usize, len: usize) -> Option<Self> {
        if offset % WORD_SIZE != 0 || len % WORD_SIZE != 0 {
            return None;
        }
        let (first, count) = (offset / WORD_SIZE, len / WORD_SIZE);
        if first.checked_add(count)? > self.len {
            return None;
        }
        Some(Self { words: self.words.clone(), start: self.start + first, len: count })
    }

    /// Splits the view into two disjoint halves at byte `mid`.
    pub fn split_at(&self, mid: usize) -> Option<(Self, Self)> {
        let head = self.window(0, mid)?;
        let tail = self.window(mid, self.len().checked_sub(mid)?)?;
        Some((head, tail))
    }

    /// Loads word `index` of the view.
    ///
    /// # Panics
    /// Panics if `index` is outside the view.
    pub fn load(&self, index: usize, order: Ordering) -> u64 {
        self.word(index).load(order)
    }

    /// Stores `value` into word `index` of the view.
    ///
    /// # Panics
    /// Panics if `index` is outside the view.
    pub fn store(&self, index: usize, value: u64, order: Ordering) {
        self.word(index).store(value, order)
    }

    /// Copies `data` into the view at byte `offset`.
    ///
    /// Returns `false` without writing if the range does not fit.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> bool {
        if !self.fits(offset, data.len()) {
            return false;
        }
        for (i, byte) in data.iter().enumerate() {
            let at = offset + i;
            let shift = (at % WORD_SIZE) * 8;
            let word = self.word(at / WORD_SIZE);
            let old = word.load(Ordering::Relaxed);
            let new = (old & !(0xff << shift)) | (u64::from(*byte) << shift);
            word.store(new, Ordering::Relaxed);
        }
        true
    }

    /// Copies bytes starting at `offset` into `out`.
    ///
    /// Returns `false` without reading if the range does not fit.
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) -> bool {
        if !self.fits(offset, out.len()) {
            return false;
        }
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.byte_at(offset + i);
        }
        true
    }

    /// Reads a NUL-terminated string starting at `offset`.
    ///
    /// Returns `None` if no terminator is found before the end of the view.
    pub fn read_cstr(&self, offset: usize) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        for at in offset..self.len() {
            match self.byte_at(at) {
                0 => return Some(out),
                b => out.push(b),
            }
        }
        None
    }

    fn fits(&self, offset: usize, len: usize) -> bool {
        offset.checked_add(len).is_some_and(|end| end <= self.len())
    }

    fn byte_at(&self, at: usize) -> u8 {
        let shift = (at % WORD_SIZE) * 8;
        (self.word(at / WORD_SIZE).load(Ordering::Relaxed) >> shift) as u8
    }

    fn word(&self, index: usize) -> &AtomicU64 {
        assert!(index < self.len, "word {index} outside frame view of {} words", self.len);
        &self.words[self.start + index]
    }
}

impl fmt::Debug for MappedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedFrame").field("start", &self.start).field("len", &self.len).finish()
    }
}
