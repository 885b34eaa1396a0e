//! Fuzz target: `ReceptionFsm::feed`
//!
//! Drives arbitrary byte sequences into the streaming reception FSM with a
//! filter that accepts every frame (worst case for scratch-buffer
//! bookkeeping, since nothing ever short-circuits into `Skip`) and asserts
//! it never panics and never reports a `Complete` frame whose `size`
//! exceeds `MAX_DATA_MSG_SIZE`.
//!
//! cargo fuzz run fuzz_frame_decoder

#![no_main]

use libfuzzer_sys::fuzz_target;
use robus_core::config::MAX_DATA_MSG_SIZE;
use robus_core::reception::{AddressFilter, ReceptionFsm, RxEvent, SCRATCH_SIZE};

fn crc16(buf: &[u8]) -> u16 {
    let mut c: u16 = 0xFFFF;
    for &b in buf {
        c = c.wrapping_add(b as u16).rotate_left(1);
    }
    c
}

fuzz_target!(|data: &[u8]| {
    let filter = AddressFilter {
        node_id: 1,
        id_shift_mask: 0,
        id_mask: &[0xFF],
        topic_mask: &[0xFF; 16],
        local_types: &[1],
        filter_disabled: true,
    };
    let mut fsm = ReceptionFsm::new();
    let mut scratch = [0u8; SCRATCH_SIZE];

    for &byte in data {
        match fsm.feed(byte, &filter, crc16, &mut scratch) {
            RxEvent::Complete { header, .. } => {
                assert!(header.size as usize <= MAX_DATA_MSG_SIZE, "size exceeds MAX_DATA_MSG_SIZE");
            }
            RxEvent::Pending | RxEvent::Rejected | RxEvent::CrcFailed => {}
        }
    }

    // A reset must always return the FSM to a clean, re-feedable state.
    fsm.reset();
    assert!(fsm.is_idle());
    for &byte in data {
        let _ = fsm.feed(byte, &filter, crc16, &mut scratch);
    }
});
