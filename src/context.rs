//! `RobusContext` — the single owned process-wide state object.
//!
//! Mirrors the upstream `volatile context_t ctx` global: one struct, split
//! into field groups by who writes them. Fields genuinely shared between
//! the HAL's interrupt context and the main loop (`tx.lock`, `tx.collision`,
//! `rx.status`, the network detection state) are word-sized atomics with
//! `Acquire`/`Release` ordering, the same discipline a lock-free SPSC
//! queue's head/tail indices use. Everything else (`node`, `services`,
//! the routing masks, the port walk state) is loop-owned and needs no
//! synchronization — this crate's `Hal` has no real preemptive ISR, so
//! these fields are plain, but the split documents which ones *would*
//! need atomics on a target where the byte-RX path truly runs in an
//! interrupt vector.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use heapless::Vec;

use crate::config::{
    ID_MASK_SIZE, LAST_TOPIC, MAX_SERVICE_NUMBER, NBR_PORT, NETWORK_TIMEOUT_MS, NO_NEIGHBOR,
    TOPIC_MASK_SIZE,
};

/// Topology detection state (spec §3 "Network state").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NetworkState {
    NoDetection = 0,
    LocalDetection = 1,
    ExternalDetection = 2,
    DetectionOk = 3,
}

impl NetworkState {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::LocalDetection,
            2 => Self::ExternalDetection,
            3 => Self::DetectionOk,
            _ => Self::NoDetection,
        }
    }
}

/// Whether localhost messages also go out on the wire. Port of `ctx.verbose`
/// (`LOCALHOST` / `MULTIHOST`) from `original_source/robus.c`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerboseMode {
    #[default]
    LocalhostOnly,
    MultiHost,
}

/// Tracks `NETWORK_TIMEOUT_MS`-bounded detection state. Callable from
/// either side of the ISR/loop split (`Robus_SetNodeDetected` is `_CRITICAL`
/// in the original — callable from interrupt context), hence atomics.
pub struct NetworkStateTracker {
    state: AtomicU8,
    timeout_run: AtomicBool,
    timeout_start_ms: AtomicU32,
}

impl Default for NetworkStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkStateTracker {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(NetworkState::NoDetection as u8),
            timeout_run: AtomicBool::new(false),
            timeout_start_ms: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> NetworkState {
        NetworkState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Port of `Robus_SetNodeDetected`.
    pub fn set_detected(&self, state: NetworkState, now_ms: u32) {
        match state {
            NetworkState::NoDetection | NetworkState::DetectionOk => {
                self.timeout_run.store(false, Ordering::Release);
                self.timeout_start_ms.store(0, Ordering::Release);
            }
            NetworkState::LocalDetection | NetworkState::ExternalDetection => {
                self.timeout_run.store(true, Ordering::Release);
                self.timeout_start_ms.store(now_ms, Ordering::Release);
            }
        }
        self.state.store(state as u8, Ordering::Release);
    }

    /// Port of `Robus_RunNetworkTimeout`. Returns `true` if the timeout
    /// fired and the state reverted to `NoDetection`.
    pub fn run_timeout(&self, now_ms: u32) -> bool {
        if !self.timeout_run.load(Ordering::Acquire) {
            return false;
        }
        let start = self.timeout_start_ms.load(Ordering::Acquire);
        if now_ms.wrapping_sub(start) > NETWORK_TIMEOUT_MS {
            self.set_detected(NetworkState::NoDetection, now_ms);
            return true;
        }
        false
    }
}

/// Word-sized fields toggled by the HAL's RX path and read by the TX engine.
#[derive(Default)]
pub struct RxIsrView {
    /// Our own RX status byte, echoed back as the single-byte ACK reply.
    pub status: AtomicU8,
}

/// Word-sized fields toggled by the HAL's TX/echo path and read by the loop.
#[derive(Default)]
pub struct TxSharedView {
    pub lock: AtomicBool,
    pub collision: AtomicBool,
}

/// A node on the bus (spec §3 "Node").
#[derive(Debug, Clone, Copy)]
pub struct Node {
    pub node_id: u16,
    pub certified: bool,
    pub node_info: u32,
    pub port_table: [u16; NBR_PORT],
}

impl Default for Node {
    fn default() -> Self {
        Self {
            node_id: 0,
            certified: false,
            node_info: 0,
            port_table: [NO_NEIGHBOR; NBR_PORT],
        }
    }
}

/// Per-service retry/fault counters (spec §0 supplement:
/// `ll_stat.max_retry` from `Robus_ServiceCreate`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceStats {
    pub max_retry: u8,
}

/// A link-layer service (spec §3 "Service").
#[derive(Debug, Clone)]
pub struct Service {
    pub id: u16,
    pub kind: u16,
    pub topic_list: Vec<u16, LAST_TOPIC>,
    pub dead_service_spotted: u16,
    pub stats: ServiceStats,
}

impl Service {
    pub fn new(kind: u16) -> Self {
        Self {
            id: 0,
            kind,
            topic_list: Vec::new(),
            dead_service_spotted: 0,
            stats: ServiceStats::default(),
        }
    }
}

/// Bookkeeping for the active topology walk (spec §4.4 `ctx.port`).
#[derive(Debug, Clone, Copy, Default)]
pub struct PortWalkState {
    /// Port currently gated to the wire by the last successful poke.
    pub active: Option<usize>,
    /// Whether the just-poked branch still owns the line.
    pub keep_line: bool,
    /// Next port `poke_next_port` will try.
    pub next_port: usize,
}

impl PortWalkState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// The single owned state object, split into ISR-written, TX-shared, and
/// loop-owned field groups per spec §9 Design Notes.
pub struct RobusContext {
    pub rx: RxIsrView,
    pub tx: TxSharedView,
    pub network: NetworkStateTracker,

    pub node: Node,
    pub services: Vec<Service, MAX_SERVICE_NUMBER>,

    pub id_shift_mask: u16,
    pub id_mask: [u8; ID_MASK_SIZE],
    pub topic_mask: [u8; TOPIC_MASK_SIZE],

    pub filter_disabled: bool,
    pub verbose: VerboseMode,

    pub port: PortWalkState,
    /// Monotonically increasing id counter the detector hands out
    /// (`last_node` upstream).
    pub last_node: u16,
    /// `SET_BAUDRATE` deferred until the TX queue drains (busy-wait in the
    /// original `Robus_MsgHandler`; modeled as a pump-checked flag here).
    pub pending_baudrate: Option<u32>,
}

impl Default for RobusContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RobusContext {
    pub fn new() -> Self {
        Self {
            rx: RxIsrView::default(),
            tx: TxSharedView::default(),
            network: NetworkStateTracker::new(),
            node: Node::default(),
            services: Vec::new(),
            id_shift_mask: 0,
            id_mask: [0; ID_MASK_SIZE],
            topic_mask: [0; TOPIC_MASK_SIZE],
            filter_disabled: false,
            verbose: VerboseMode::LocalhostOnly,
            port: PortWalkState::default(),
            last_node: 0,
            pending_baudrate: None,
        }
    }

    /// Port of `Robus_MaskInit`.
    pub fn mask_init(&mut self) {
        self.id_shift_mask = 0;
        self.id_mask = [0; ID_MASK_SIZE];
    }

    pub fn find_service_by_id(&self, id: u16) -> Option<usize> {
        self.services.iter().position(|s| s.id == id)
    }

    pub fn local_types(&self) -> Vec<u16, MAX_SERVICE_NUMBER> {
        let mut out = Vec::new();
        for s in &self.services {
            let _ = out.push(s.kind);
        }
        out
    }
}
