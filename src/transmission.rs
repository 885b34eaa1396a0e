//! Transmission engine — line arbitration, collision detection via echo
//! mismatch, ACK wait with timeout, bounded retry.
//!
//! On half-duplex hardware the bytes this engine writes loop back through
//! the same RX wire, so collision detection is driven through the same
//! per-byte entry point inbound frames use: whoever owns the "ISR" (real
//! interrupt on a target, the host-test harness here) routes each arriving
//! byte to [`TxEngine::on_echo`] while [`RobusContext::tx`]'s `lock` is
//! held, and to `ReceptionFsm::feed` otherwise — see `robus_core.rs`'s
//! `on_rx_byte` dispatcher. The one-byte ACK reply after a `*ACK` send gets
//! its own entry point, [`TxEngine::on_ack_byte`], since by then the line
//! has been released and the byte is not a fresh frame.
//!
//! Modeled as an explicit state enum driven by `try_begin`/`step`/`on_echo`/
//! `on_ack_byte`/`check_timeout`, in the same style as a typed OTA state
//! machine with a "no stuck states" invariant for the retry/backoff
//! shape, and a `TxState::{Idle, WaitingForAck{..}}` enum for the
//! ACK-wait bookkeeping.

use core::sync::atomic::Ordering;

use crate::alloc::{MsgAlloc, TxTask};
use crate::config::{ACK_TIMEOUT_MS, COLLISION_BACKOFF_BASE_MS, NBR_RETRY};
use crate::context::RobusContext;
use crate::hal::Hal;

/// Result of a TX task that has left the engine for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    /// Streamed to completion; ACK not requested or ACK indicated success.
    Delivered { target: u16 },
    /// Retry budget (`NBR_RETRY`) exhausted; target is presumed dead.
    TargetDead { target: u16 },
}

/// One ACK status byte's meaning (bit 0 set = NACK, per upstream `ll_status_t`).
fn ack_is_nack(byte: u8) -> bool {
    byte & 0x1 != 0
}

/// Result of one `TxEngine::step` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStep {
    /// Caller must write this byte via `Hal::byte_tx` (already done by
    /// `step`) and watch for its echo via `on_echo`.
    SendByte(u8),
    /// The task left the engine without ever needing an ACK wait.
    Delivered(TxOutcome),
    /// Nothing to send right now (idle, awaiting ACK, or backing off).
    Idle,
}

enum State {
    Idle,
    /// Streaming `task`'s bytes (data already includes the CRC trailer —
    /// `set_tx_task` stages a fully-formed frame). `sent` counts bytes
    /// written; `last_sent` is what we wrote, pending its echo.
    Sending { task: TxTask, sent: usize, last_sent: u8 },
    /// All bytes streamed; line released, waiting for the one-byte ACK.
    WaitingAck { task: TxTask, started_ms: u32 },
    /// Collision or NACK/timeout observed; short proportional delay before
    /// the requeued task is retried by the caller's next `try_begin`.
    Backoff { started_ms: u32, duration_ms: u32 },
}

pub struct TxEngine {
    state: State,
}

impl Default for TxEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TxEngine {
    pub fn new() -> Self {
        Self { state: State::Idle }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    /// Whether the engine is waiting on the one-byte ACK reply — the byte
    /// dispatcher routes to [`Self::on_ack_byte`] instead of [`Self::on_echo`]
    /// in this state, since the line has already been released.
    pub fn is_waiting_ack(&self) -> bool {
        matches!(self.state, State::WaitingAck { .. })
    }

    /// Spec §4.3 step 1: lock TX, assert TX_EN, de-assert RX_EN, begin
    /// streaming the oldest queued task. No-op (returns `false`) unless the
    /// line is idle, nothing is already in flight, and a task is queued.
    pub fn try_begin(&mut self, ctx: &RobusContext, alloc: &mut MsgAlloc, hal: &mut impl Hal, now_ms: u32) -> bool {
        match &self.state {
            State::Idle => {}
            State::Backoff { started_ms, duration_ms } => {
                if now_ms.wrapping_sub(*started_ms) < *duration_ms {
                    return false; // not yet elapsed
                }
            }
            _ => return false,
        }
        if ctx.tx.lock.load(Ordering::Acquire) || hal.line_is_busy() {
            return false;
        }
        let Some(task) = alloc.pop_tx_task() else {
            return false;
        };
        ctx.tx.lock.store(true, Ordering::Release);
        ctx.tx.collision.store(false, Ordering::Release);
        hal.enable_tx();
        self.state = State::Sending { task, sent: 0, last_sent: 0 };
        true
    }

    /// Write the next byte, if any is due. Returns the byte just written so
    /// a test harness (or the real ISR glue on an echoing transceiver) can
    /// feed it back via `on_echo`. When the frame's last byte has already
    /// gone out, either moves to `WaitingAck` or — for a message that never
    /// wanted one — releases the line and reports `Delivered` right here.
    pub fn step(&mut self, ctx: &RobusContext, alloc: &MsgAlloc, hal: &mut impl Hal, now_ms: u32) -> TxStep {
        let State::Sending { task, sent, last_sent } = &mut self.state else {
            return TxStep::Idle;
        };
        if *sent >= task.size {
            let task = *task;
            if task.wants_ack {
                hal.enable_rx();
                self.state = State::WaitingAck { task, started_ms: now_ms };
                return TxStep::Idle;
            }
            self.release_line(ctx, hal);
            return TxStep::Delivered(TxOutcome::Delivered { target: task.target });
        }
        let byte = alloc.read_byte(task.offset + *sent);
        *sent += 1;
        *last_sent = byte;
        hal.byte_tx(byte);
        TxStep::SendByte(byte)
    }

    /// Route an echoed byte here while `ctx.tx.lock` is held and bytes are
    /// still being streamed (spec §4.2 "while transmitting, the FSM also
    /// reads back each byte"). A mismatch is a collision.
    pub fn on_echo(&mut self, ctx: &RobusContext, alloc: &mut MsgAlloc, hal: &mut impl Hal, byte: u8, now_ms: u32) -> Option<TxOutcome> {
        let State::Sending { task, last_sent, .. } = &self.state else {
            return None;
        };
        if byte == *last_sent {
            return None;
        }
        ctx.tx.collision.store(true, Ordering::Release);
        let task = *task;
        self.release_line(ctx, hal);
        self.requeue_or_drop(ctx, alloc, task, now_ms)
    }

    /// Route the one-byte ACK reply here once `step` has moved to `WaitingAck`.
    pub fn on_ack_byte(&mut self, ctx: &RobusContext, alloc: &mut MsgAlloc, hal: &mut impl Hal, byte: u8, now_ms: u32) -> Option<TxOutcome> {
        let State::WaitingAck { task, .. } = &self.state else {
            return None;
        };
        let task = *task;
        self.release_line(ctx, hal);
        if ack_is_nack(byte) {
            self.requeue_or_drop(ctx, alloc, task, now_ms)
        } else {
            Some(TxOutcome::Delivered { target: task.target })
        }
    }

    /// Called every loop tick so an ACK wait that never arrives still
    /// resolves (spec §4.3 step 4, "timeout or NACK bit").
    pub fn check_timeout(&mut self, ctx: &RobusContext, alloc: &mut MsgAlloc, hal: &mut impl Hal, now_ms: u32) -> Option<TxOutcome> {
        let State::WaitingAck { task, started_ms } = &self.state else {
            return None;
        };
        if now_ms.wrapping_sub(*started_ms) < ACK_TIMEOUT_MS {
            return None;
        }
        let task = *task;
        self.release_line(ctx, hal);
        self.requeue_or_drop(ctx, alloc, task, now_ms)
    }

    fn release_line(&mut self, ctx: &RobusContext, hal: &mut impl Hal) {
        hal.enable_rx();
        ctx.tx.lock.store(false, Ordering::Release);
        self.state = State::Idle;
    }

    fn requeue_or_drop(&mut self, ctx: &RobusContext, alloc: &mut MsgAlloc, task: TxTask, now_ms: u32) -> Option<TxOutcome> {
        if task.retry_count >= NBR_RETRY {
            alloc.mark_dead(task.owner);
            return Some(TxOutcome::TargetDead { target: task.target });
        }
        let backoff = COLLISION_BACKOFF_BASE_MS * (jitter_bucket(ctx.node.node_id, task.retry_count, now_ms) + 1);
        self.state = State::Backoff { started_ms: now_ms, duration_ms: backoff };
        // `requeue_tx_task` bumps `retry_count` itself.
        let _ = alloc.requeue_tx_task(task);
        None
    }
}

/// Cheap stand-in for spec §4.3's "random" backoff term. The HAL trait
/// exposes no entropy source, so this mixes `node_id`, the task's retry
/// count, and the current tick through a Knuth multiplicative hash —
/// nodes with ids congruent mod 8 land in different buckets across
/// retries instead of re-colliding in lockstep. Returns a value in 0..8.
fn jitter_bucket(node_id: u16, retry_count: u8, now_ms: u32) -> u32 {
    let seed = u32::from(node_id)
        .wrapping_add(u32::from(retry_count))
        .wrapping_add(now_ms)
        .wrapping_mul(2_654_435_761);
    (seed >> 24) % 8
}
