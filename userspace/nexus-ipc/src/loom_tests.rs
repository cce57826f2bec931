// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Loom model of the shared-memory slot handshake.
//!
//! Explores every interleaving of one sender and one receiver on a two-slot
//! ring, including wrap-around, and checks that payloads arrive intact and in
//! order.
//!
//! ```bash
//! cargo test -p nexus-ipc --features loom --release -- --test-threads=1 loom
//! ```

use loom::thread;
use nexus_abi::MappedFrame;

use crate::ump::UmpChannel;

const MSG_SIZE: usize = 24;
const SLOTS: usize = 2;

#[test]
fn loom_ump_handshake_is_fifo() {
    loom::model(|| {
        let frame = MappedFrame::zeroed(2 * SLOTS * MSG_SIZE);
        let mut tx = UmpChannel::over_frame(&frame, MSG_SIZE, true).unwrap();
        let mut rx = UmpChannel::over_frame(&frame, MSG_SIZE, false).unwrap();

        let sender = thread::spawn(move || {
            for i in 0..3u64 {
                while !tx.send(&[i, !i]).unwrap() {
                    thread::yield_now();
                }
            }
        });

        let mut out = [0u64; 2];
        for i in 0..3u64 {
            while !rx.receive(&mut out) {
                thread::yield_now();
            }
            assert_eq!(out, [i, !i], "payload torn or reordered");
        }
        sender.join().unwrap();
    });
}

#[test]
fn loom_full_slot_is_never_overwritten() {
    loom::model(|| {
        let frame = MappedFrame::zeroed(2 * MSG_SIZE);
        let mut tx = UmpChannel::over_frame(&frame, MSG_SIZE, true).unwrap();
        let mut rx = UmpChannel::over_frame(&frame, MSG_SIZE, false).unwrap();

        assert!(tx.send(&[1, 1]).unwrap());
        let sender = thread::spawn(move || tx.send(&[2, 2]).unwrap());

        let mut out = [0u64; 2];
        assert!(rx.receive(&mut out));
        assert_eq!(out, [1, 1]);
        if sender.join().unwrap() {
            assert!(rx.receive(&mut out));
            assert_eq!(out, [2, 2]);
        }
    });
}
