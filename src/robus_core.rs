//! Protocol command dispatch and topology detection.
//!
//! Grounded directly on `original_source/network/robus/src/robus.c`'s
//! `Robus_MsgHandler` / `Robus_TopologyDetection` /
//! `Robus_ResetNetworkDetection` / `Robus_DetectNextNodes`. The original
//! runs these as blocking, recursively-pumped C functions on a single
//! physical node; this crate has no threads and two simulated nodes in one
//! test process would deadlock a literal translation (node A's blocking
//! wait for node B's reply can only be served by the *same* harness that's
//! currently stuck inside node A's call stack). So the walk here is
//! message-driven instead: each step sends one probe and returns, and the
//! next step runs from inside [`RobusCore::on_rx_byte`]'s command dispatch
//! once the corresponding reply arrives — the one case that still recurses
//! (a freshly bootstrapped node immediately continuing its own walk) stays
//! exactly one call deep, same as the original's un-early-returned
//! `Robus_DetectNextNodes()` call in the `WRITE_NODE_ID` size-4 case.
//!
//! This reshaping has a real limitation, noted where it matters below:
//! completion detection (`poll_detection_quiescence`) only watches this
//! node's own TX queue, which is exact for the depth-1 topologies this
//! crate's test scenarios exercise (a detector with directly-attached
//! leaves) but not a general proof of whole-network quiescence for deeper
//! trees.

use core::sync::atomic::Ordering;

use log::{debug, info, warn};

use crate::config::{BROADCAST_VAL, DEFAULTID, DETECTION_SETTLE_MS, HEADER_SIZE, MAX_DATA_MSG_SIZE, NBR_RESET_RETRY};
use crate::context::NetworkState;
use crate::error::{DetectionError, Result};
use crate::hal::Hal;
use crate::message::{cmd, Header, NodeBootstrap, TargetMode};
use crate::port_mng;
use crate::reception::{AddressFilter, RxEvent};
use crate::service::{concerned_service_ids, log_tx_outcome, RobusCore};
use crate::transmission::TxStep;

impl<H: Hal> RobusCore<H> {
    // ── Byte-level dispatch ──────────────────────────────────────────

    /// Route one wire byte to whichever of the reception FSM or the
    /// transmission engine's echo/ACK handling currently owns it. Called by
    /// whatever external glue owns the bus: a real interrupt vector on
    /// target hardware, or a host test harness / `demos/` bus simulator
    /// fanning a just-sent byte back out to every attached node.
    pub fn on_rx_byte(&mut self, byte: u8, now_ms: u32) {
        if self.tx_engine.is_waiting_ack() {
            if let Some(outcome) =
                self.tx_engine
                    .on_ack_byte(&self.ctx, &mut self.alloc, &mut self.hal, byte, now_ms)
            {
                log_tx_outcome(outcome);
            }
            return;
        }
        if self.ctx.tx.lock.load(Ordering::Acquire) {
            if let Some(outcome) =
                self.tx_engine
                    .on_echo(&self.ctx, &mut self.alloc, &mut self.hal, byte, now_ms)
            {
                log_tx_outcome(outcome);
            }
            return;
        }

        if self.rx_fsm.is_idle() {
            self.alloc.reserve_rx();
        }
        self.alloc.push_rx_byte(byte);

        let local_types = self.ctx.local_types();
        let filter = AddressFilter {
            node_id: self.ctx.node.node_id,
            id_shift_mask: self.ctx.id_shift_mask,
            id_mask: &self.ctx.id_mask,
            topic_mask: &self.ctx.topic_mask,
            local_types: &local_types,
            filter_disabled: self.ctx.filter_disabled,
        };
        let hal = &self.hal;
        let event = self
            .rx_fsm
            .feed(byte, &filter, |buf| hal.crc16(0xFFFF, buf), &mut self.scratch);
        match event {
            RxEvent::Pending => {}
            RxEvent::Rejected | RxEvent::CrcFailed => self.alloc.drop_rx(),
            RxEvent::Complete { header, ack_status } => self.on_frame_complete(header, ack_status, now_ms),
        }
    }

    fn on_frame_complete(&mut self, header: Header, ack_status: Option<u8>, now_ms: u32) {
        if ack_status.is_some() {
            let status = self.ctx.rx.status.load(Ordering::Acquire);
            self.hal.enable_tx();
            self.hal.byte_tx(status);
            self.hal.enable_rx();
        }

        if header.cmd < cmd::LUOS_LAST_RESERVED_CMD {
            let size = header.size as usize;
            let mut data = [0u8; MAX_DATA_MSG_SIZE];
            data[..size].copy_from_slice(&self.scratch[HEADER_SIZE..HEADER_SIZE + size]);
            if let Err(e) = self.alloc.commit_rx(&[]) {
                warn!("commit_rx failed for protocol frame: {e}");
            }
            if let Err(e) = self.dispatch_command(header, &data[..size], now_ms) {
                warn!("protocol dispatch failed: {e}");
            }
        } else {
            let owners = concerned_service_ids(&self.ctx, &header);
            if let Err(e) = self.alloc.commit_rx(&owners) {
                warn!("commit_rx failed: {e}");
            }
        }
    }

    // ── Command dispatch (port of `Robus_MsgHandler`) ─────────────────

    fn dispatch_command(&mut self, header: Header, data: &[u8], now_ms: u32) -> Result<()> {
        match header.cmd {
            cmd::WRITE_NODE_ID => self.handle_write_node_id(header, data, now_ms)?,
            cmd::START_DETECTION => {
                self.ctx.network.set_detected(NetworkState::LocalDetection, now_ms);
                self.alloc.init();
                if !self.identity().is_detector {
                    self.ctx.node.node_id = DEFAULTID;
                    self.ctx.port.reset();
                }
                self.detect_quiet_since = None;
                info!("START_DETECTION received");
            }
            cmd::END_DETECTION => {
                self.ctx.network.set_detected(NetworkState::DetectionOk, now_ms);
                info!("network detection complete, node_id={}", self.ctx.node.node_id);
            }
            cmd::SET_BAUDRATE => {
                if let Some(baud) = decode_u32(data) {
                    self.ctx.pending_baudrate = Some(baud);
                    debug!("baudrate change to {baud} deferred until TX queue drains");
                }
            }
            other => debug!("unhandled reserved command {other}"),
        }
        Ok(())
    }

    /// Port of the `WRITE_NODE_ID` case in `Robus_MsgHandler`. `size`
    /// distinguishes the three phases of one hop's id exchange: a remote
    /// request for a fresh id (0 bytes, used only when the node doing the
    /// poking isn't itself the detector — see [`Self::advance_port_walk`]),
    /// the detector's reply carrying that id (2 bytes), and the forwarded
    /// bootstrap that lets the new neighbor adopt it (4 bytes,
    /// [`NodeBootstrap`]).
    fn handle_write_node_id(&mut self, header: Header, data: &[u8], now_ms: u32) -> Result<()> {
        match header.size as usize {
            0 => {
                // Only the detector (node id 1) ever receives this, and only
                // from a *different* node continuing a deeper-tree walk —
                // the detector's own pokes allocate locally instead of
                // round-tripping a message to itself (see `advance_port_walk`;
                // the detector can't observe its own TX as an RX frame, only
                // as a TX echo, so a self-addressed request would never be
                // answered).
                self.ctx.last_node += 1;
                let new_id = self.ctx.last_node;
                self.send_protocol(TargetMode::NodeIdAck, header.source, cmd::WRITE_NODE_ID, &new_id.to_le_bytes(), now_ms)?;
            }
            2 => {
                if data.len() < 2 {
                    return Ok(());
                }
                let new_id = u16::from_le_bytes([data[0], data[1]]);
                self.deliver_new_id(new_id, now_ms)?;
            }
            4 => {
                let Some(bootstrap) = NodeBootstrap::decode(data) else {
                    return Ok(());
                };
                self.ctx.node.node_id = bootstrap.nodeid;
                self.ctx.last_node = bootstrap.nodeid;
                self.ctx.port.reset();
                // Port 0 is, by convention, the uplink we were just
                // bootstrapped over: the crate doesn't model which physical
                // PTP pin gated this particular exchange (see module doc),
                // so record the neighbor we came from on that conventional
                // slot and skip it on our own outward walk rather than
                // re-discovering our own uplink as a fresh neighbor.
                self.ctx.node.port_table[0] = bootstrap.prev_nodeid;
                self.ctx.port.next_port = 1;
                info!("bootstrapped as node {}", bootstrap.nodeid);
                // Intentional fallthrough: the original's size-4 case
                // recurses into the next detection step with no
                // `break`/`return` afterward (DESIGN.md's Open Question
                // decision). This arm mirrors that by not early-returning
                // after `advance_port_walk`.
                self.advance_port_walk(now_ms)?;
            }
            _ => {}
        }
        Ok(())
    }

    // ── Topology detection orchestration ──────────────────────────────

    /// Kick off topology detection. A no-op on every node except the one
    /// configured as detector (`NodeIdentity::is_detector`) — the rest
    /// simply react to `START_DETECTION` and the `WRITE_NODE_ID` exchange
    /// as it reaches them.
    pub fn begin_detection(&mut self, now_ms: u32) -> Result<()> {
        if !self.identity().is_detector {
            return Ok(());
        }
        self.reset_network_detection(now_ms)?;
        self.ctx.node.node_id = 1;
        self.ctx.last_node = 1;
        self.ctx.port.reset();
        self.detect_quiet_since = None;
        self.ctx.network.set_detected(NetworkState::LocalDetection, now_ms);
        self.advance_port_walk(now_ms)
    }

    /// Port of `Robus_ResetNetworkDetection`: broadcast `START_DETECTION`
    /// and reinitialize the ring. The original busy-waits on
    /// `MsgAlloc_TxAllComplete` between the send and the reinit so the
    /// broadcast is actually on the wire before the ring underneath it is
    /// wiped — `drive_tx_to_completion` below is that busy-wait, pumping
    /// the TX engine locally rather than calling `alloc.init()` out from
    /// under a still-queued task. See `DESIGN.md`'s Open Question decision
    /// for why the budget this waits against caps at [`NBR_RESET_RETRY`].
    fn reset_network_detection(&mut self, now_ms: u32) -> Result<()> {
        self.send_protocol(TargetMode::Broadcast, BROADCAST_VAL, cmd::START_DETECTION, &[], now_ms)?;
        self.drive_tx_to_completion(now_ms)?;
        self.alloc.init();
        Ok(())
    }

    /// Pump `tx_engine` until `alloc`'s TX queue is drained, without
    /// relying on an external bus simulator to feed bytes back through
    /// [`Self::on_rx_byte`]. Safe here because `START_DETECTION` is always
    /// a `Broadcast`, which never requests an ACK (`TargetMode::wants_ack`),
    /// so `TxEngine::step` resolves straight to `Delivered` once every byte
    /// is written — no echo confirmation is needed the way a point-to-point
    /// send would need one. A task that still won't drain after a generous
    /// byte budget means the HAL never reports the line free, not that this
    /// call should spin forever.
    fn drive_tx_to_completion(&mut self, now_ms: u32) -> Result<()> {
        let budget = (HEADER_SIZE + MAX_DATA_MSG_SIZE) as u32 * u32::from(NBR_RESET_RETRY);
        let mut spent = 0u32;
        while !self.alloc.tx_all_complete() {
            if self.tx_engine.is_idle() {
                self.tx_engine.try_begin(&self.ctx, &mut self.alloc, &mut self.hal, now_ms);
            }
            let _: TxStep = self.tx_engine.step(&self.ctx, &self.alloc, &mut self.hal, now_ms);
            spent += 1;
            if spent > budget {
                return Err(DetectionError::ResetFailed.into());
            }
        }
        Ok(())
    }

    /// Port of one iteration of `Robus_DetectNextNodes`'s port loop: poke
    /// the next untried port and, if a neighbor answered, ask the detector
    /// for a fresh id on its behalf. Returns without blocking either way —
    /// the reply (if any) resumes the walk from `handle_write_node_id`.
    ///
    /// When *this* node is itself the detector (`node_id == 1`), the
    /// "ask the detector" request would be addressed to our own node id —
    /// but our own transmitted bytes are only ever observed through
    /// [`crate::transmission::TxEngine::on_echo`]/`on_ack_byte`, never fed
    /// back into `rx_fsm`, so a self-addressed `WRITE_NODE_ID` could never
    /// be answered by ourselves. `handle_write_node_id`'s size-0 case is
    /// reserved for a *different* node reaching us over a deeper branch;
    /// here we allocate the next id locally instead, matching the size-0
    /// handler's own bookkeeping one step ahead.
    pub(crate) fn advance_port_walk(&mut self, now_ms: u32) -> Result<()> {
        if port_mng::poke_next_port(&mut self.ctx.port, &mut self.hal) {
            if self.ctx.node.node_id == 1 {
                self.ctx.last_node += 1;
                let new_id = self.ctx.last_node;
                self.deliver_new_id(new_id, now_ms)?;
            } else {
                self.send_protocol(TargetMode::NodeIdAck, 1, cmd::WRITE_NODE_ID, &[], now_ms)?;
            }
            return Ok(());
        }
        self.ctx.port.keep_line = false;
        Ok(())
    }

    /// Record `new_id` as the neighbor on the just-poked active port,
    /// forward the bootstrap so that neighbor can adopt it, and continue
    /// the walk onto this node's remaining ports. Shared by the size-2
    /// `WRITE_NODE_ID` reply handler (a remote detector answering us) and
    /// [`Self::advance_port_walk`]'s local-detector shortcut above.
    fn deliver_new_id(&mut self, new_id: u16, now_ms: u32) -> Result<()> {
        if let Some(port) = self.ctx.port.active {
            self.ctx.node.port_table[port] = new_id;
        }
        let bootstrap = NodeBootstrap {
            prev_nodeid: self.ctx.node.node_id,
            nodeid: new_id,
        };
        // Targets any still-unassigned node (NodeIdAck target=0): on real
        // hardware this only reaches the one neighbor the just-poked PTP
        // port physically isolated for this exchange. See the module doc
        // for why that isolation isn't modeled at this layer.
        self.send_protocol(TargetMode::NodeIdAck, DEFAULTID, cmd::WRITE_NODE_ID, &bootstrap.encode(), now_ms)?;
        self.advance_port_walk(now_ms)
    }

    /// Detector-only: once this node's own ports are exhausted and its TX
    /// queue has sat empty for `DETECTION_SETTLE_MS`, declare detection
    /// complete and broadcast `END_DETECTION`. See the module doc for this
    /// heuristic's depth-1 limitation.
    pub(crate) fn poll_detection_quiescence(&mut self, now_ms: u32) {
        if !self.identity().is_detector || self.ctx.network.state() != NetworkState::LocalDetection {
            self.detect_quiet_since = None;
            return;
        }
        if self.ctx.port.active.is_some() || !self.alloc.tx_all_complete() {
            self.detect_quiet_since = None;
            return;
        }
        let since = *self.detect_quiet_since.get_or_insert(now_ms);
        if now_ms.wrapping_sub(since) >= DETECTION_SETTLE_MS {
            self.detect_quiet_since = None;
            match self.send_protocol(TargetMode::Broadcast, BROADCAST_VAL, cmd::END_DETECTION, &[], now_ms) {
                Err(e) => warn!("failed to broadcast END_DETECTION: {e}"),
                Ok(()) => {
                    // Our own broadcast bytes are only ever observed through
                    // `TxEngine::on_echo` (collision detection), never fed
                    // back into `rx_fsm` — so unlike every other node, we
                    // cannot reach `DetectionOk` by dispatching our own
                    // `END_DETECTION` frame. Apply the same transition the
                    // receiving end performs, directly.
                    self.ctx.network.set_detected(NetworkState::DetectionOk, now_ms);
                    info!("network detection complete, node_id={}", self.ctx.node.node_id);
                }
            }
        }
    }

    /// Send a reserved-command frame. Unlike the public
    /// [`RobusCore::send`](crate::service::RobusCore::send), skips the
    /// network-readiness and reserved-command-id checks — those exist to
    /// keep user code off the protocol's own commands, not to gate the
    /// protocol itself.
    pub(crate) fn send_protocol(&mut self, target_mode: TargetMode, target: u16, cmd_id: u8, data: &[u8], now_ms: u32) -> Result<()> {
        let header = Header {
            config: crate::message::BASE_PROTOCOL,
            target_mode,
            target,
            source: self.ctx.node.node_id,
            cmd: cmd_id,
            size: data.len() as u16,
        };
        self.send_raw(header, data, false, now_ms)
    }
}

fn decode_u32(buf: &[u8]) -> Option<u32> {
    if buf.len() < 4 {
        return None;
    }
    Some(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeIdentity;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// A two-port loopback HAL whose PTP lines and wire are backed by
    /// shared queues, so two [`RobusCore`] instances can exchange bytes and
    /// GPIO pokes within a single test thread.
    struct LinkHal {
        wire_out: Rc<RefCell<VecDeque<u8>>>,
        peer_has_id: Rc<RefCell<bool>>,
        own_has_id: Rc<RefCell<bool>>,
        busy: Rc<RefCell<bool>>,
    }

    impl Hal for LinkHal {
        fn byte_tx(&mut self, byte: u8) {
            self.wire_out.borrow_mut().push_back(byte);
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
            let mut c = seed;
            for &b in buf {
                c = c.wrapping_add(b as u16).rotate_left(1);
            }
            c
        }
        fn systick_ms(&self) -> u32 {
            0
        }
        fn ptp_set(&mut self, _port: usize, _level: bool) {
            *self.own_has_id.borrow_mut() = true;
        }
        fn ptp_read(&self, port: usize) -> bool {
            if port == 0 {
                *self.peer_has_id.borrow()
            } else {
                true // no second neighbor in this two-node test fixture
            }
        }
        fn com_init(&mut self, _baudrate: u32) {}
    }

    /// Pump both nodes until neither produces a byte and neither has a TX
    /// task left, fanning every produced byte to both sides (self included,
    /// matching a real half-duplex transceiver's own-echo wiring).
    ///
    /// Drains `wire` directly rather than trusting `LoopReport::tx_byte`:
    /// an ACK reply in `on_frame_complete` writes straight to `Hal::byte_tx`
    /// outside of `loop_once`, so the shared queue is the only place every
    /// byte — streamed or ACK — is guaranteed to show up.
    fn settle(a: &mut RobusCore<LinkHal>, b: &mut RobusCore<LinkHal>, wire: &Rc<RefCell<VecDeque<u8>>>, now_ms: u32) {
        for _ in 0..256 {
            a.loop_once(now_ms);
            drain(a, b, wire, now_ms);
            b.loop_once(now_ms);
            drain(a, b, wire, now_ms);
            if wire.borrow().is_empty() && a.alloc.tx_all_complete() && b.alloc.tx_all_complete() {
                break;
            }
        }
    }

    fn drain(a: &mut RobusCore<LinkHal>, b: &mut RobusCore<LinkHal>, wire: &Rc<RefCell<VecDeque<u8>>>, now_ms: u32) {
        loop {
            let byte = wire.borrow_mut().pop_front();
            let Some(byte) = byte else { break };
            a.on_rx_byte(byte, now_ms);
            b.on_rx_byte(byte, now_ms);
        }
    }

    #[test]
    fn two_node_detection_assigns_distinct_ids() {
        let a_has_id = Rc::new(RefCell::new(false));
        let b_has_id = Rc::new(RefCell::new(false));
        let wire = Rc::new(RefCell::new(VecDeque::new()));
        let busy = Rc::new(RefCell::new(false));

        let hal_a = LinkHal {
            wire_out: wire.clone(),
            peer_has_id: b_has_id.clone(),
            own_has_id: a_has_id.clone(),
            busy: busy.clone(),
        };
        let hal_b = LinkHal {
            wire_out: wire.clone(),
            peer_has_id: a_has_id.clone(),
            own_has_id: b_has_id.clone(),
            busy: busy.clone(),
        };

        let identity_a = NodeIdentity { is_detector: true, ..NodeIdentity::default() };
        let identity_b = NodeIdentity { is_detector: false, ..NodeIdentity::default() };
        let mut a = RobusCore::new(hal_a, identity_a);
        let mut b = RobusCore::new(hal_b, identity_b);

        a.begin_detection(0).unwrap();
        settle(&mut a, &mut b, &wire, 0);
        // Drain any trailing DETECTION_SETTLE_MS-gated END_DETECTION.
        settle(&mut a, &mut b, &wire, DETECTION_SETTLE_MS + 1);

        assert_eq!(a.ctx.node.node_id, 1);
        assert_eq!(b.ctx.node.node_id, 2);
        assert_eq!(a.ctx.network.state(), NetworkState::DetectionOk);
        assert_eq!(b.ctx.network.state(), NetworkState::DetectionOk);
    }
}
