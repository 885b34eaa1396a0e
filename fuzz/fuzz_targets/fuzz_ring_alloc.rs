//! Fuzz target: `MsgAlloc` ring safety under arbitrary op schedules.
//!
//! Interprets the fuzz bytes as a schedule of RX pushes, commits, drops,
//! TX stages, and pulls, and asserts the ring never panics and that
//! `is_empty()` is consistent with the queues actually being drained —
//! the ring-safety invariant from spec §8 ("no byte range of an active
//! task is ever read after being overwritten") reduces to "nothing this
//! target does, however adversarial, should make `MsgAlloc` panic or
//! desynchronize its own bookkeeping".
//!
//! cargo fuzz run fuzz_ring_alloc

#![no_main]

use libfuzzer_sys::fuzz_target;
use robus_core::alloc::MsgAlloc;

fuzz_target!(|data: &[u8]| {
    let mut alloc = MsgAlloc::new();
    let mut chunks = data.chunks(3);

    while let Some(chunk) = chunks.next() {
        let op = chunk[0] % 5;
        let len = chunk.get(1).copied().unwrap_or(0) as usize % 16;
        let owner = chunk.get(2).copied().unwrap_or(0) as u16;

        match op {
            0 => {
                alloc.reserve_rx();
                for i in 0..len {
                    alloc.push_rx_byte(i as u8);
                }
                let _ = alloc.commit_rx(&[owner]);
            }
            1 => {
                alloc.reserve_rx();
                for i in 0..len {
                    alloc.push_rx_byte(i as u8);
                }
                alloc.drop_rx();
            }
            2 => {
                let bytes: Vec<u8> = (0..len as u8).collect();
                let _ = alloc.set_tx_task(&bytes, owner % 2 == 0, owner, owner, &[owner], true);
            }
            3 => {
                let _ = alloc.pop_tx_task();
            }
            4 => {
                let _ = alloc.pull_msg_to_interpret();
            }
            _ => unreachable!(),
        }
    }

    // No matter the schedule, an allocator with no open RX frame, no queued
    // TX tasks, and no pending luos tasks must report itself empty.
    if alloc.is_empty() {
        assert!(alloc.tx_all_complete());
    }
});
