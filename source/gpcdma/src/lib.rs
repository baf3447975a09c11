//! Channel scheduler for the general purpose DMA (GPC-DMA) controller.
//!
//! The controller has a fixed set of independent [`Channel`]s. Clients claim
//! one from the [`Engine`], describe work with the `prepare_*` operations,
//! [`submit`](Channel::submit) it, and [`issue_pending`](Channel::issue_pending)
//! to start the hardware. Completions are split in two halves:
//!
//! - [`Engine::handle_interrupt`] runs in interrupt context, advances the
//!   channel's pending queue, and records which transfers are owed
//!   callbacks.
//! - [`Engine::dispatch`] runs those callbacks later, outside the channel
//!   lock, where they may block.
//!
//! One-shot transfers (memcpy, memset, scatter-gather to or from a
//! peripheral) run in submission order. A cyclic transfer keeps its periods
//! in a ring, loading the next period into the hardware's next-transfer slot
//! while the current one runs. A channel runs one kind or the other until it
//! drains or is terminated.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod channel;
pub mod config;
pub mod descriptor;
mod engine;
pub mod error;
mod pool;
pub mod regs;

#[cfg(test)]
pub(crate) mod test_util;

pub use self::{
    channel::{Channel, ChannelPhase, ChannelPools, IrqReturn, Terminated},
    config::{Direction, PlatformConfig, SlaveConfig},
    descriptor::{
        BusAddr, Callback, Completion, Cookie, PrepFlags, SgEntry, TransferHandle, TransferMode,
        TxState, TxStatus,
    },
    engine::{ClaimedChannel, Engine, Platform},
    error::{DmaError, HardwareError},
    pool::PoolStats,
};
