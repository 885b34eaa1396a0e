//! Two nodes on one simulated wire: topology detection, then a broadcast
//! message delivered to both. Run with:
//!
//! ```text
//! RUST_LOG=debug cargo run --example two_node_loopback
//! ```

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use robus_core::config::NodeIdentity;
use robus_core::context::NetworkState;
use robus_core::message::{cmd, TargetMode};
use robus_core::{Hal, RobusCore};

type Wire = Rc<RefCell<VecDeque<u8>>>;

/// CRC16/X-25, same polynomial every node on this simulated bus agrees on.
fn crc16(seed: u16, buf: &[u8]) -> u16 {
    const ALGO: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_IBM_SDLC);
    let mut digest = ALGO.digest_with_initial(seed);
    digest.update(buf);
    digest.finalize()
}

struct LoopbackHal {
    wire: Wire,
    neighbor_on_port0: bool,
}

impl Hal for LoopbackHal {
    fn byte_tx(&mut self, byte: u8) {
        self.wire.borrow_mut().push_back(byte);
    }

    fn enable_tx(&mut self) {}

    fn enable_rx(&mut self) {}

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
        port == 0 && !self.neighbor_on_port0
    }

    fn com_init(&mut self, _baudrate: u32) {}
}

fn drain(nodes: &mut [&mut RobusCore<LoopbackHal>], wire: &Wire, now_ms: u32) {
    loop {
        let byte = wire.borrow_mut().pop_front();
        let Some(byte) = byte else { break };
        for node in nodes.iter_mut() {
            node.on_rx_byte(byte, now_ms);
        }
    }
}

fn settle(nodes: &mut [&mut RobusCore<LoopbackHal>], wire: &Wire, max_ticks: u32) {
    for tick in 0..max_ticks {
        for node in nodes.iter_mut() {
            node.loop_once(tick);
        }
        drain(nodes, wire, tick);
    }
}

fn main() {
    env_logger::init();

    let wire: Wire = Rc::new(RefCell::new(VecDeque::new()));
    let hal_a = LoopbackHal { wire: wire.clone(), neighbor_on_port0: true };
    let hal_b = LoopbackHal { wire: wire.clone(), neighbor_on_port0: true };

    let mut a = RobusCore::new(hal_a, NodeIdentity { is_detector: true, ..NodeIdentity::default() });
    let mut b = RobusCore::new(hal_b, NodeIdentity { is_detector: false, ..NodeIdentity::default() });

    let service_a = a.create_service(1).expect("service table has room");
    let service_b = b.create_service(1).expect("service table has room");

    log::info!("starting topology detection");
    a.begin_detection(0).expect("detector node can begin detection");
    settle(&mut [&mut a, &mut b], &wire, 256);

    assert_eq!(a.ctx.network.state(), NetworkState::DetectionOk);
    assert_eq!(b.ctx.network.state(), NetworkState::DetectionOk);
    log::info!(
        "detection complete: node a id={}, node b id={}",
        a.ctx.node.node_id,
        b.ctx.node.node_id
    );

    a.configure_addressing(a.ctx.node.node_id)
        .expect("base id assigned by detection is always valid");
    b.configure_addressing(b.ctx.node.node_id)
        .expect("base id assigned by detection is always valid");

    a.send(service_a, TargetMode::Broadcast, 0x0FFF, cmd::LUOS_LAST_RESERVED_CMD, b"hello from a", false, 0)
        .expect("network is ready and the command id is not reserved");
    settle(&mut [&mut a, &mut b], &wire, 64);

    while let Some((owner, msg)) = a.poll_inbox() {
        log::info!("node a delivered to service {owner}: {:?}", msg.data);
    }
    while let Some((owner, msg)) = b.poll_inbox() {
        log::info!(
            "node b delivered to service {owner}: {:?}",
            core::str::from_utf8(&msg.data).unwrap_or("<binary>")
        );
    }

    let _ = service_b;
}
