//! Host-side [`Hal`] standing in for real silicon: a shared in-memory wire
//! (every byte any attached node writes is fanned out to every node's
//! `on_rx_byte`, including the writer's own — the echo a real half-duplex
//! transceiver loops back, which collision detection depends on) plus a
//! fixed per-port PTP neighbor map for topology scenarios.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use robus_core::{Hal, RobusCore};

/// Deterministic CRC16 matching `reception.rs`'s `hal.crc16(0xFFFF, buf)`
/// call — every node in these tests shares this implementation, as spec
/// §6 requires of any two nodes on the same bus.
pub fn crc16(seed: u16, buf: &[u8]) -> u16 {
    const ALGO: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_IBM_SDLC);
    let mut digest = ALGO.digest_with_initial(seed);
    digest.update(buf);
    digest.finalize()
}

pub type Wire = Rc<RefCell<VecDeque<u8>>>;

pub struct MockHal {
    wire: Wire,
    busy: Rc<RefCell<bool>>,
    /// Per-port: does a neighbor answer this node's PTP poke?
    neighbors: Vec<bool>,
}

impl MockHal {
    pub fn new(wire: Wire, busy: Rc<RefCell<bool>>, neighbors: Vec<bool>) -> Self {
        Self { wire, busy, neighbors }
    }
}

impl Hal for MockHal {
    fn byte_tx(&mut self, byte: u8) {
        self.wire.borrow_mut().push_back(byte);
    }

    fn enable_tx(&mut self) {
        *self.busy.borrow_mut() = true;
    }

    fn enable_rx(&mut self) {
        *self.busy.borrow_mut() = false;
    }

    fn line_is_busy(&self) -> bool {
        false
    }

    fn crc16(&self, seed: u16, buf: &[u8]) -> u16 {
        crc16(seed, buf)
    }

    fn systick_ms(&self) -> u32 {
        0
    }

    fn ptp_set(&mut self, _port: usize, _level: bool) {}

    fn ptp_read(&self, port: usize) -> bool {
        !self.neighbors.get(port).copied().unwrap_or(false)
    }

    fn com_init(&mut self, _baudrate: u32) {}
}

/// Fan every byte currently sitting on `wire` out to every node in
/// `nodes`, including each node's own bytes (own-echo, as on a real bus).
pub fn drain(nodes: &mut [&mut RobusCore<MockHal>], wire: &Wire, now_ms: u32) {
    loop {
        let byte = wire.borrow_mut().pop_front();
        let Some(byte) = byte else { break };
        for node in nodes.iter_mut() {
            node.on_rx_byte(byte, now_ms);
        }
    }
}

/// Pump every node's loop once, then drain whatever landed on the wire,
/// repeating until nothing is left moving or `max_ticks` is exhausted.
pub fn settle(nodes: &mut [&mut RobusCore<MockHal>], wire: &Wire, now_ms: u32, max_ticks: u32) {
    for _ in 0..max_ticks {
        for node in nodes.iter_mut() {
            node.loop_once(now_ms);
        }
        drain(nodes, wire, now_ms);
        if wire.borrow().is_empty() && nodes.iter().all(|n| n.alloc.tx_all_complete()) {
            break;
        }
    }
}
