//! `robus-core` — the core of a multi-drop serial bus protocol stack.
//!
//! Framing & wire reception, a zero-copy message allocator, the
//! transmission engine, topology detection, and addressing/routing masks,
//! all behind one [`hal::Hal`] port so the crate never assumes a
//! particular MCU. See `SPEC_FULL.md` for the module map and `DESIGN.md`
//! for the grounding ledger.

#![cfg_attr(not(test), no_std)]
#![deny(unused_must_use)]

pub mod alloc;
pub mod config;
pub mod context;
pub mod error;
pub mod hal;
pub mod message;
pub mod port_mng;
pub mod reception;
pub mod robus_core;
pub mod routing;
pub mod service;
pub mod timestamp;
pub mod transmission;

pub use context::{NetworkState, RobusContext};
pub use error::{Error, Result};
pub use hal::Hal;
pub use message::{Header, Message, TargetMode};
pub use service::{LoopReport, RobusCore};
