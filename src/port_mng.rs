//! Port manager — PTP branch control and the "poke next port" primitive.
//!
//! Each node has up to `NBR_PORT` point-to-point GPIO lines, one per
//! physical neighbor, independent of the shared data bus. Polled the way
//! a main loop debounces a GPIO edge rather than vectoring through a real
//! IRQ: `poke_next_port` drives a port's line and immediately samples the
//! neighbor's response — drive the line, wait briefly, report success if
//! the neighbor released its line — without needing a registered callback.

use crate::config::NBR_PORT;
use crate::context::PortWalkState;
use crate::hal::Hal;

/// Drive the next untried port and report whether a neighbor answered.
///
/// A neighbor "releases its line" (reads low after we assert it) when it
/// is still waiting to be discovered. Ports already tried this walk are
/// skipped; calling this repeatedly after all ports are exhausted keeps
/// returning `false` until `state.reset()`.
pub fn poke_next_port(state: &mut PortWalkState, hal: &mut impl Hal) -> bool {
    while state.next_port < NBR_PORT {
        let port = state.next_port;
        state.next_port += 1;

        hal.ptp_set(port, true);
        let neighbor_released = !hal.ptp_read(port);
        hal.ptp_set(port, false);

        if neighbor_released {
            state.active = Some(port);
            state.keep_line = true;
            return true;
        }
    }
    state.active = None;
    state.keep_line = false;
    false
}
