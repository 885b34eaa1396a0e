//! The hardware abstraction port — the only seam between this crate and
//! real silicon. One capability set, one generic parameter at every call
//! site; never `dyn` in the byte-RX path (an indirect call per byte would
//! cost more than the receive FSM itself).

/// Raw byte I/O, timing, CRC, and PTP GPIO control for one bus transceiver.
pub trait Hal {
    /// Write one byte to the line. Only valid while `enable_tx()` is active.
    fn byte_tx(&mut self, byte: u8);

    /// Assert TX_EN / de-assert RX_EN (half-duplex direction switch).
    fn enable_tx(&mut self);

    /// Assert RX_EN / de-assert TX_EN.
    fn enable_rx(&mut self);

    /// True if the line is currently driven by another node.
    fn line_is_busy(&self) -> bool;

    /// Compute CRC16 over `buf`, continuing from `seed`. All nodes on a
    /// bus must agree on the polynomial; this crate never assumes one.
    fn crc16(&self, seed: u16, buf: &[u8]) -> u16;

    /// Free-running millisecond tick, wrapping at `u32::MAX`.
    fn systick_ms(&self) -> u32;

    /// Drive PTP port `port`'s line to `level`.
    fn ptp_set(&mut self, port: usize, level: bool);

    /// Read PTP port `port`'s current line level.
    fn ptp_read(&self, port: usize) -> bool;

    /// Re-initialize the UART peripheral at `baudrate` (used by `SET_BAUDRATE`).
    fn com_init(&mut self, baudrate: u32);
}
