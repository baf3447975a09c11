//! Transfer descriptors and the hardware segments they are built from.
//!
//! A client-visible [`Transfer`] owns an ordered list of [`Segment`]s, each of
//! which is one burst the hardware can run from a single register
//! programming. Both live in the owning channel's pools and refer to each
//! other by [`Key`].
use alloc::{sync::Arc, vec::Vec};
use core::fmt;

use mycelium_bitfield::bitfield;

use crate::{
    error::HardwareError,
    pool::Key,
    regs::{Csr, HighAddr, McSeq, MmioSeq, Reg, RegisterFile},
};

/// An already-translated bus address.
pub type BusAddr = u64;

/// A client completion callback.
///
/// Invoked from [`Channel::dispatch_completions`](crate::Channel::dispatch_completions),
/// never from the interrupt handler, so it may block.
pub type Callback = Arc<dyn Fn(&Completion) + Send + Sync>;

bitfield! {
    /// Flags accepted by the `prepare_*` operations.
    #[derive(Eq, PartialEq)]
    pub struct PrepFlags<u8> {
        /// Raise an end-of-chain interrupt as each segment completes.
        pub const INTERRUPT: bool;
        /// The client will not [`ack`](crate::Channel::ack) this transfer;
        /// recycle it as soon as it finishes.
        pub const ACK: bool;
    }
}

impl PrepFlags {
    /// Interrupt on completion and recycle without waiting for an ack.
    #[must_use]
    pub fn interrupt_ack() -> Self {
        Self::new()
            .with(Self::INTERRUPT, true)
            .with(Self::ACK, true)
    }
}

/// Ordering token handed out when a transfer is submitted.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Cookie(i32);

/// Refers to a prepared transfer on a particular channel.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TransferHandle {
    pub(crate) channel: u8,
    pub(crate) key: Key,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransferMode {
    /// Each segment is re-armed by software and the transfer finishes.
    OneShot,
    /// The buffer repeats period by period until terminated.
    Cyclic,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TxState {
    InProgress,
    Complete,
    Error,
}

/// Result of [`Channel::query_status`](crate::Channel::query_status).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TxStatus {
    pub state: TxState,
    /// Bytes not yet transferred.
    pub residue: usize,
    pub fault: Option<HardwareError>,
}

/// Snapshot passed to a transfer's completion callback.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Completion {
    pub cookie: Option<Cookie>,
    pub state: TxState,
    pub bytes_transferred: usize,
    pub fault: Option<HardwareError>,
}

/// One scatter-gather entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SgEntry {
    pub addr: BusAddr,
    pub len: usize,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Stage {
    Prepared,
    Submitted,
    Done,
}

pub(crate) struct Transfer {
    pub(crate) mode: TransferMode,
    pub(crate) stage: Stage,
    pub(crate) bytes_requested: usize,
    pub(crate) bytes_transferred: usize,
    pub(crate) state: TxState,
    pub(crate) fault: Option<HardwareError>,
    pub(crate) segments: Vec<Key>,
    pub(crate) cookie: Option<Cookie>,
    pub(crate) acked: bool,
    pub(crate) callback: Option<Callback>,
    /// Callback invocations owed by the deferred dispatcher.
    pub(crate) cb_count: u32,
}

/// Register values for one segment.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct HwConfig {
    pub(crate) csr: Csr,
    pub(crate) src: u32,
    pub(crate) dst: u32,
    pub(crate) high: HighAddr,
    pub(crate) mc_seq: McSeq,
    pub(crate) mmio_seq: MmioSeq,
    pub(crate) wcount: u32,
    pub(crate) fixed_pattern: u32,
}

pub(crate) struct Segment {
    pub(crate) hw: HwConfig,
    pub(crate) len: usize,
    /// Written to the hardware's next-transfer registers.
    pub(crate) configured: bool,
    /// Pre-configuration was skipped because a completion was pending.
    pub(crate) skipped: bool,
    /// Final segment of its transfer.
    pub(crate) last: bool,
    pub(crate) transfer: Option<Key>,
}

// === impl Cookie ===

impl Cookie {
    pub const MIN: i32 = 1;

    #[must_use]
    pub fn get(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Per-channel cookie bookkeeping.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Cookies {
    last_used: i32,
    completed: i32,
}

impl Cookies {
    pub(crate) const fn new() -> Self {
        Self {
            last_used: Cookie::MIN,
            completed: Cookie::MIN,
        }
    }

    pub(crate) fn assign(&mut self) -> Cookie {
        let next = self.last_used.wrapping_add(1);
        self.last_used = if next < Cookie::MIN { Cookie::MIN } else { next };
        Cookie(self.last_used)
    }

    pub(crate) fn complete(&mut self, cookie: Cookie) {
        self.completed = cookie.0;
    }

    /// Whether `cookie` is known to have completed, based only on ordering.
    pub(crate) fn is_complete(&self, cookie: Cookie) -> bool {
        let (completed, used, c) = (self.completed, self.last_used, cookie.0);
        if completed <= used {
            c <= completed || c > used
        } else {
            c <= completed && c > used
        }
    }
}

// === impl TransferMode ===

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OneShot => "one-shot",
            Self::Cyclic => "cyclic",
        })
    }
}

// === impl Transfer ===

impl Transfer {
    pub(crate) fn new(
        mode: TransferMode,
        bytes_requested: usize,
        flags: PrepFlags,
        callback: Option<Callback>,
        segments: Vec<Key>,
    ) -> Self {
        Self {
            mode,
            stage: Stage::Prepared,
            bytes_requested,
            bytes_transferred: 0,
            state: TxState::InProgress,
            fault: None,
            segments,
            cookie: None,
            acked: flags.get(PrepFlags::ACK),
            callback,
            cb_count: 0,
        }
    }

    /// An empty transfer, as preallocated at bring-up.
    pub(crate) fn empty() -> Self {
        Self::new(TransferMode::OneShot, 0, PrepFlags::new(), None, Vec::new())
    }

    pub(crate) fn completion(&self) -> Completion {
        Completion {
            cookie: self.cookie,
            state: self.state,
            bytes_transferred: self.bytes_transferred,
            fault: self.fault,
        }
    }

    pub(crate) fn status(&self) -> TxStatus {
        let residue = match (self.state, self.mode) {
            (TxState::Complete, _) => 0,
            (_, TransferMode::OneShot) => {
                self.bytes_requested.saturating_sub(self.bytes_transferred)
            }
            (_, TransferMode::Cyclic) if self.bytes_requested == 0 => 0,
            (_, TransferMode::Cyclic) => {
                self.bytes_requested - (self.bytes_transferred % self.bytes_requested)
            }
        };
        TxStatus {
            state: self.state,
            residue,
            fault: self.fault,
        }
    }
}

// === impl HwConfig ===

impl HwConfig {
    pub(crate) fn new() -> Self {
        Self {
            csr: Csr::new(),
            src: 0,
            dst: 0,
            high: HighAddr::new(),
            mc_seq: McSeq::new(),
            mmio_seq: MmioSeq::new(),
            wcount: 0,
            fixed_pattern: 0,
        }
    }

    /// Word count register value for a segment of `len` bytes.
    #[must_use]
    pub(crate) fn wcount_for(len: usize) -> u32 {
        ((len - 4) >> 2) as u32
    }

    pub(crate) fn with_addresses(self, src: BusAddr, dst: BusAddr) -> Self {
        Self {
            src: src as u32,
            dst: dst as u32,
            high: HighAddr::new()
                .with(HighAddr::SRC, ((src >> 32) & 0xff) as u32)
                .with(HighAddr::DST, ((dst >> 32) & 0xff) as u32),
            ..self
        }
    }

    /// Writes the full programming for a channel that is not running, and
    /// enables it.
    pub(crate) fn start(&self, regs: &impl RegisterFile) {
        regs.write(Reg::Wcount, self.wcount);
        regs.write(Reg::Csr, 0);
        regs.write(Reg::SrcPtr, self.src);
        regs.write(Reg::DstPtr, self.dst);
        regs.write(Reg::HighAddrPtr, self.high.bits());
        regs.write(Reg::FixedPattern, self.fixed_pattern);
        regs.write(Reg::MmioSeq, self.mmio_seq.bits());
        regs.write(Reg::McSeq, self.mc_seq.bits());
        regs.write(Reg::Csr, self.csr.bits());
        regs.write_barrier();
        regs.write(Reg::Csr, self.csr.with(Csr::ENB, true).bits());
    }

    /// Writes the address and length registers of a running channel, which
    /// the hardware latches when the current burst completes.
    pub(crate) fn load_next(&self, regs: &impl RegisterFile) {
        regs.write(Reg::SrcPtr, self.src);
        regs.write(Reg::DstPtr, self.dst);
        regs.write(Reg::HighAddrPtr, self.high.bits());
        regs.write(Reg::Wcount, self.wcount);
        regs.write_barrier();
        regs.write(Reg::Csr, self.csr.with(Csr::ENB, true).bits());
    }
}

// === impl Segment ===

impl Segment {
    pub(crate) fn new(hw: HwConfig, len: usize) -> Self {
        Self {
            hw,
            len,
            configured: false,
            skipped: false,
            last: false,
            transfer: None,
        }
    }

    pub(crate) fn empty() -> Self {
        Self::new(HwConfig::new(), 0)
    }
}
