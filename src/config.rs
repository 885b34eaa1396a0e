//! Network configuration parameters.
//!
//! Most of these are genuinely link-time constants in the upstream protocol
//! (confirmed by `node_config.h`'s `#define` table) — every node on a bus
//! must agree on buffer sizing and retry budgets, so they live as `pub
//! const` rather than a runtime-tunable struct. The one piece of state that
//! is legitimately per-boot is [`NodeIdentity`].

/// Services per node.
pub const MAX_SERVICE_NUMBER: usize = 5;

/// Maximum payload bytes per message, excluding header/CRC/timestamp/ack.
pub const MAX_DATA_MSG_SIZE: usize = 128;

/// Wire header size: cfg(4 bits) | target_mode(4 bits) packed in one byte,
/// target:u16, source:u16, cmd:u8, size:u16.
pub const HEADER_SIZE: usize = 8;

/// CRC trailer size.
pub const CRC_SIZE: usize = 2;

/// Upper bound on a single wire frame: header + data + optional timestamp
/// trailer (`timestamp::TIMESTAMP_SIZE`, duplicated here as a literal since
/// `config` must not depend on `timestamp`) + CRC.
pub const SIZE_MSG_MAX: usize = HEADER_SIZE + MAX_DATA_MSG_SIZE + 4 + CRC_SIZE;

/// Ring buffer size backing [`crate::alloc::MsgAlloc`].
pub const MSG_BUFFER_SIZE: usize = 3 * SIZE_MSG_MAX;

/// Maximum in-flight messages (RX + TX) tracked simultaneously.
pub const MAX_MSG_NB: usize = 2 * MAX_SERVICE_NUMBER;

/// Maximum routing table entries (network-wide service count a node can learn of).
pub const MAX_RTB_ENTRY: usize = 40;

/// PTP branches per node (hard ceiling imposed by the port-table encoding).
pub const NBR_PORT: usize = 2;

/// TX retries on NACK or collision before a target is marked dead.
pub const NBR_RETRY: u8 = 10;

/// Detection reset attempt budget (see `DESIGN.md` Open Question decision).
pub const NBR_RESET_RETRY: u8 = 5;

/// Full detection retry budget before a fatal assertion.
pub const NBR_DETECT_RETRY: u8 = 4;

/// Detection timeout, milliseconds.
pub const NETWORK_TIMEOUT_MS: u32 = 10_000;

/// Highest subscribable topic id.
pub const LAST_TOPIC: usize = 127;

/// Topic mask size in bytes, covering `[0, LAST_TOPIC]`.
pub const TOPIC_MASK_SIZE: usize = (LAST_TOPIC + 1).div_ceil(8);

/// ID mask size in bytes — one byte per 8 contiguous service ids a node may own.
pub const ID_MASK_SIZE: usize = MAX_SERVICE_NUMBER.div_ceil(8).max(1);

/// Sentinel node id: unassigned / not yet detected.
pub const DEFAULTID: u16 = 0;

/// Sentinel "no neighbor on this port" value.
pub const NO_NEIGHBOR: u16 = 0xFFFF;

/// Broadcast pseudo-target.
pub const BROADCAST_VAL: u16 = 0x0FFF;

/// Default UART baudrate a fresh node boots with.
pub const DEFAULT_BAUDRATE: u32 = 1_000_000;

/// How long the TX engine waits for a one-byte ACK reply before retrying.
pub const ACK_TIMEOUT_MS: u32 = 20;

/// Base unit for the node-id-proportional collision backoff.
pub const COLLISION_BACKOFF_BASE_MS: u32 = 2;

/// Inter-phase settle delay used by the detection reset walk.
pub const DETECTION_SETTLE_MS: u32 = 2;

/// Identity and link parameters decided at boot, not wired into the build.
#[derive(Debug, Clone, Copy)]
pub struct NodeIdentity {
    /// Current UART baudrate; may change via `SET_BAUDRATE`.
    pub baudrate: u32,
    /// Whether this node's detector service should initiate topology detection.
    pub is_detector: bool,
}

impl Default for NodeIdentity {
    fn default() -> Self {
        Self {
            baudrate: DEFAULT_BAUDRATE,
            is_detector: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_sizes_cover_their_ranges() {
        assert!(ID_MASK_SIZE * 8 >= MAX_SERVICE_NUMBER);
        assert!(TOPIC_MASK_SIZE * 8 >= LAST_TOPIC + 1);
    }

    #[test]
    fn ring_is_multiple_of_frame_size() {
        assert_eq!(MSG_BUFFER_SIZE, 3 * SIZE_MSG_MAX);
    }
}
