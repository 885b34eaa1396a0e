//! Public service API — the hexagonal core of this crate.
//!
//! [`RobusCore`] owns the context, ring allocator, reception FSM and
//! transmission engine behind one generic [`Hal`] parameter, and exposes a
//! clean, hardware-agnostic API the way an application service exposes
//! its behavior behind injected hardware ports. All topology detection
//! and protocol command handling lives in `robus_core.rs`, as an
//! additional `impl<H: Hal> RobusCore<H>` block next to this one.

use log::{debug, info, warn};

use crate::alloc::MsgAlloc;
use crate::config::{
    NodeIdentity, HEADER_SIZE, MAX_DATA_MSG_SIZE, MAX_SERVICE_NUMBER, SIZE_MSG_MAX,
};
use crate::context::{RobusContext, Service, VerboseMode};
use crate::error::{AllocError, ConfigError, Error, Result};
use crate::hal::Hal;
use crate::message::{Header, Localhost, Message, TargetMode};
use crate::reception::{AddressFilter, ReceptionFsm, SCRATCH_SIZE};
use crate::routing;
use crate::timestamp::{self, TIMESTAMPED_FLAG};
use crate::transmission::{TxEngine, TxOutcome, TxStep};

/// One tick's worth of observable side effects, reported back to the
/// caller so a host test harness (or `demos/`) can drive a simulated bus
/// and react to delivered/dead outcomes without polling internal state.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopReport {
    /// A byte was written to the wire this tick; fan it out to every node
    /// sharing this bus segment, including this node's own RX input (the
    /// echo collision detection depends on) — that fan-out is the bus
    /// medium's job, not this crate's.
    pub tx_byte: Option<u8>,
    /// A queued TX task left the engine for good this tick.
    pub tx_outcome: Option<TxOutcome>,
    /// A service was marked dead by ring pressure or retry exhaustion.
    pub dead_service: Option<u16>,
}

/// The top-level driver: context + allocator + FSMs behind one `Hal`.
pub struct RobusCore<H: Hal> {
    pub ctx: RobusContext,
    pub alloc: MsgAlloc,
    pub(crate) hal: H,
    pub(crate) rx_fsm: ReceptionFsm,
    pub(crate) tx_engine: TxEngine,
    pub(crate) scratch: [u8; SCRATCH_SIZE],
    identity: NodeIdentity,
    /// Set once this node's own port walk is exhausted and `alloc`'s TX
    /// queue first drains while still in `LocalDetection`; `robus_core`'s
    /// `poll_detection_quiescence` broadcasts `END_DETECTION` once this has
    /// held for `DETECTION_SETTLE_MS`. Driver bookkeeping, not protocol
    /// state, hence kept here rather than on `RobusContext`.
    pub(crate) detect_quiet_since: Option<u32>,
}

impl<H: Hal> RobusCore<H> {
    pub fn new(mut hal: H, identity: NodeIdentity) -> Self {
        hal.com_init(identity.baudrate);
        hal.enable_rx();
        Self {
            ctx: RobusContext::new(),
            alloc: MsgAlloc::new(),
            hal,
            rx_fsm: ReceptionFsm::new(),
            tx_engine: TxEngine::new(),
            scratch: [0u8; SCRATCH_SIZE],
            identity,
            detect_quiet_since: None,
        }
    }

    pub fn identity(&self) -> NodeIdentity {
        self.identity
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    // ── Service lifecycle ────────────────────────────────────────────

    /// Port of `Robus_ServiceCreate`: register a service of the given
    /// `kind` and hand back its id. Ids are assigned sequentially starting
    /// at 1 — the network-wide base id a node owns is set separately via
    /// [`configure_addressing`](Self::configure_addressing) once topology
    /// detection has assigned this node's [`Node::node_id`](crate::context::Node).
    pub fn create_service(&mut self, kind: u16) -> Result<u16> {
        if self.ctx.services.is_full() {
            return Err(ConfigError::ServiceTableFull.into());
        }
        let mut service = Service::new(kind);
        let id = self.ctx.services.len() as u16 + 1;
        service.id = id;
        self.ctx
            .services
            .push(service)
            .map_err(|_| ConfigError::ServiceTableFull)?;
        debug!("service {id} created (kind {kind})");
        Ok(id)
    }

    /// Port of `Robus_IDMaskCalculation`, applied to every service this
    /// node currently owns. Call once a `base_id` has been assigned
    /// (topology detection's `WRITE_NODE_ID` forwarding, or a static
    /// configuration on a single-node bus).
    ///
    /// Also renumbers every owned service's `id` to its network-wide
    /// address (`base_id`, `base_id + 1`, ... in creation order), so a
    /// `ServiceId`/`ServiceIdAck` frame's `target` field — which always
    /// carries a network-wide address, not the provisional local id
    /// [`create_service`](Self::create_service) hands back — can be
    /// resolved against [`RobusContext::find_service_by_id`] directly.
    /// Before this is called (or on a node with more than one contiguous
    /// service past `base_id` 1) the two id spaces only happen to coincide
    /// by accident; afterward they never diverge.
    pub fn configure_addressing(&mut self, base_id: u16) -> Result<()> {
        let count = self.ctx.services.len() as u16;
        routing::id_mask_calculation(&mut self.ctx, base_id, count)?;
        for (i, service) in self.ctx.services.iter_mut().enumerate() {
            service.id = base_id + i as u16;
        }
        Ok(())
    }

    pub fn subscribe(&mut self, service_idx: usize, topic: u16) -> Result<()> {
        routing::topic_subscribe(&mut self.ctx, service_idx, topic)
    }

    pub fn unsubscribe(&mut self, service_idx: usize, topic: u16) -> Result<()> {
        routing::topic_unsubscribe(&mut self.ctx, service_idx, topic)
    }

    // ── Sending ──────────────────────────────────────────────────────

    /// Port of `Robus_SendMsg` for user commands (`cmd >=
    /// LUOS_LAST_RESERVED_CMD`). Reserved protocol commands are sent
    /// through `robus_core`'s internal `send_protocol` instead, which
    /// skips the network-readiness and reserved-command checks below.
    pub fn send(
        &mut self,
        source_service: u16,
        target_mode: TargetMode,
        target: u16,
        cmd: u8,
        data: &[u8],
        timestamped: bool,
        now_ms: u32,
    ) -> Result<()> {
        if cmd < crate::message::cmd::LUOS_LAST_RESERVED_CMD {
            return Err(Error::Prohibited);
        }
        if self.ctx.network.state() != crate::context::NetworkState::DetectionOk {
            return Err(Error::Prohibited);
        }
        let header = Header {
            config: if timestamped { TIMESTAMPED_FLAG } else { 0 },
            target_mode,
            target,
            source: source_service,
            cmd,
            size: data.len().min(MAX_DATA_MSG_SIZE) as u16,
        };
        self.send_raw(header, data, timestamped, now_ms)
    }

    /// Stage a fully-formed frame, splitting local and wire delivery via
    /// the same [`AddressFilter`] logic `reception.rs` uses on the inbound
    /// side (spec §4.1, the `Localhost`/`ExternalHost`/`MultiHost` split).
    pub(crate) fn send_raw(
        &mut self,
        header: Header,
        data: &[u8],
        timestamped: bool,
        now_ms: u32,
    ) -> Result<()> {
        let local_types = self.ctx.local_types();
        let filter = AddressFilter {
            node_id: self.ctx.node.node_id,
            id_shift_mask: self.ctx.id_shift_mask,
            id_mask: &self.ctx.id_mask,
            topic_mask: &self.ctx.topic_mask,
            local_types: &local_types,
            filter_disabled: self.ctx.filter_disabled,
        };
        let point_to_point = matches!(
            header.target_mode,
            TargetMode::ServiceId | TargetMode::ServiceIdAck | TargetMode::NodeId | TargetMode::NodeIdAck
        );
        let any_remote_possible = !point_to_point || self.ctx.verbose == VerboseMode::MultiHost;
        let kind = filter.localhost_kind(&header, any_remote_possible);
        let local = filter.node_concerned(&header);

        let owners = if local {
            concerned_service_ids(&self.ctx, &header)
        } else {
            heapless::Vec::new()
        };
        let stage_for_wire = !matches!(kind, Localhost::Localhost);

        let mut hbuf = [0u8; HEADER_SIZE];
        header.encode(&mut hbuf);
        let n = data.len().min(header.size as usize);
        let mut frame: heapless::Vec<u8, SIZE_MSG_MAX> = heapless::Vec::new();
        frame
            .extend_from_slice(&hbuf)
            .map_err(|_| AllocError::Full)?;
        frame
            .extend_from_slice(&data[..n])
            .map_err(|_| AllocError::Full)?;
        if timestamped {
            frame
                .extend_from_slice(&timestamp::encode(now_ms, now_ms))
                .map_err(|_| AllocError::Full)?;
        }
        let crc = self.hal.crc16(0xFFFF, &frame);
        frame
            .extend_from_slice(&crc.to_le_bytes())
            .map_err(|_| AllocError::Full)?;

        self.alloc.set_tx_task(
            &frame,
            header.target_mode.wants_ack(),
            header.source,
            header.target,
            &owners,
            stage_for_wire,
        )
    }

    // ── Receiving ────────────────────────────────────────────────────

    /// Pull the next locally-queued message, decoded from the ring. `None`
    /// once `alloc`'s luos-task queue is drained for now.
    pub fn poll_inbox(&mut self) -> Option<(u16, Message)> {
        let task = self.alloc.pull_msg_to_interpret()?;
        let mut buf = [0u8; SIZE_MSG_MAX];
        self.alloc.read_into(task.offset, task.size, &mut buf);
        let mut hbuf = [0u8; HEADER_SIZE];
        hbuf.copy_from_slice(&buf[..HEADER_SIZE]);
        let header = Header::decode(&hbuf)?;
        let data = &buf[HEADER_SIZE..HEADER_SIZE + header.size as usize];
        Some((task.owner, Message::new(header, data)))
    }

    // ── Main loop ────────────────────────────────────────────────────

    /// One cooperative scheduling tick (spec §4.5 main loop): advance the
    /// detection timeout, drive the TX engine, and report whatever the
    /// caller needs to act on (a byte to fan out over the bus, a TX
    /// outcome, a dead service). Does not dispatch inbound bytes — those
    /// arrive through [`RobusCore::on_rx_byte`] (`robus_core.rs`), driven
    /// by whatever external glue owns the wire (a real ISR, or a host test
    /// harness / `demos/` bus simulator).
    pub fn loop_once(&mut self, now_ms: u32) -> LoopReport {
        if self.ctx.network.run_timeout(now_ms) {
            warn!("network detection timed out, reverting to NoDetection");
        }
        self.poll_detection_quiescence(now_ms);

        let mut report = LoopReport::default();

        if let Some(outcome) = self.tx_engine.check_timeout(&self.ctx, &mut self.alloc, &mut self.hal, now_ms) {
            self.handle_tx_outcome(outcome, &mut report);
        }

        if self.tx_engine.is_idle() {
            self.tx_engine.try_begin(&self.ctx, &mut self.alloc, &mut self.hal, now_ms);
        }

        match self.tx_engine.step(&self.ctx, &self.alloc, &mut self.hal, now_ms) {
            TxStep::SendByte(b) => report.tx_byte = Some(b),
            TxStep::Delivered(outcome) => self.handle_tx_outcome(outcome, &mut report),
            TxStep::Idle => {}
        }

        if let Some(dead) = self.alloc.take_dead_service() {
            if let Some(idx) = self.ctx.find_service_by_id(dead) {
                let service = &mut self.ctx.services[idx];
                service.dead_service_spotted = service.dead_service_spotted.saturating_add(1);
            }
            report.dead_service = Some(dead);
        }

        if let Some(baud) = self.ctx.pending_baudrate {
            if self.tx_engine.is_idle() && self.alloc.tx_all_complete() {
                self.hal.com_init(baud);
                self.ctx.pending_baudrate = None;
                info!("baudrate reconfigured to {baud}");
            }
        }

        report
    }

    pub(crate) fn handle_tx_outcome(&mut self, outcome: TxOutcome, report: &mut LoopReport) {
        log_tx_outcome(outcome);
        report.tx_outcome = Some(outcome);
    }
}

/// Shared logging for a [`TxOutcome`], used both by [`RobusCore::loop_once`]
/// and `robus_core.rs`'s `on_rx_byte` (which observes outcomes outside a
/// `LoopReport`, via `on_echo`/`on_ack_byte`).
pub(crate) fn log_tx_outcome(outcome: TxOutcome) {
    match outcome {
        TxOutcome::Delivered { target } => info!("delivered to target {target}"),
        TxOutcome::TargetDead { target } => warn!("target {target} presumed dead, retries exhausted"),
    }
}

/// Resolve which locally-owned services a header concerns (spec §4.1's
/// `commit_rx` service-set argument). `NodeId`/`NodeIdAck` frames carrying
/// a reserved command are protocol traffic, dispatched directly by
/// `robus_core::on_rx_byte` rather than queued here.
pub(crate) fn concerned_service_ids(
    ctx: &RobusContext,
    header: &Header,
) -> heapless::Vec<u16, MAX_SERVICE_NUMBER> {
    let mut out = heapless::Vec::new();
    match header.target_mode {
        TargetMode::Broadcast => {
            for s in &ctx.services {
                let _ = out.push(s.id);
            }
        }
        TargetMode::Type => {
            for s in &ctx.services {
                if s.kind == header.target {
                    let _ = out.push(s.id);
                }
            }
        }
        TargetMode::Topic => {
            for s in &ctx.services {
                if s.topic_list.contains(&header.target) {
                    let _ = out.push(s.id);
                }
            }
        }
        TargetMode::ServiceId | TargetMode::ServiceIdAck => {
            if ctx.find_service_by_id(header.target).is_some() {
                let _ = out.push(header.target);
            }
        }
        TargetMode::NodeId | TargetMode::NodeIdAck => {
            // Reserved-command protocol traffic; left empty on purpose.
        }
    }
    out
}
