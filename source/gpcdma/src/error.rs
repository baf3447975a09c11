//! Errors returned by the channel scheduler.
use core::fmt;

use crate::{descriptor::TransferMode, regs::ErrStatus};

/// Errors returned by channel and engine operations.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum DmaError {
    /// A transfer request failed validation. Nothing was allocated.
    InvalidArgument(InvalidArgument),
    /// A peripheral transfer was prepared before
    /// [`Channel::configure_slave`](crate::Channel::configure_slave).
    NotConfigured,
    /// The channel is in a state that does not allow the operation.
    Busy(BusyReason),
    /// A descriptor pool could not grow.
    OutOfMemory(PoolKind),
    /// The controller reported a bus or security error.
    ///
    /// Channel operations never return this. Faults reach clients through
    /// [`Completion::fault`](crate::Completion) and
    /// [`TxStatus::fault`](crate::TxStatus), and this variant lets a client
    /// fold one into its own `DmaError` with `?` or `From`.
    HardwareFault(HardwareError),
    /// A bounded hardware poll ran out of iterations.
    Timeout,
    /// The requested channel does not exist or is already claimed.
    NoChannel,
    /// A platform collaborator failed during bring-up.
    Platform(&'static str),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum InvalidArgument {
    /// An address or length is not 4-byte aligned.
    Misaligned { operand: Operand, value: u64 },
    ZeroLength,
    /// A single segment is longer than the controller can count.
    TooLong { len: usize, max: usize },
    /// A cyclic buffer length is not a multiple of its period.
    PeriodMismatch { buf_len: usize, period_len: usize },
    EmptyList,
    /// Peripheral transfers must move data to or from a device.
    UnsupportedDirection,
    /// The transfer handle does not name a prepared transfer on this channel.
    StaleHandle,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Operand {
    Source,
    Destination,
    Length,
    Period,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum BusyReason {
    /// Segments are still queued on the channel.
    SegmentsPending,
    /// The channel's completion handler is installed for a different mode.
    ModeConflict { installed: TransferMode },
    /// The hardware is currently running a transfer.
    ChannelRunning,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PoolKind {
    Transfer,
    Segment,
}

/// Categories decoded from a channel's error status register.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum HardwareError {
    BufferFifoFull,
    PeripheralFifoFull,
    InvalidPeripheralId,
    InvalidStreamId,
    MemorySlave,
    MmioSlave,
    SecurityViolation,
}

// === impl DmaError ===

impl fmt::Display for DmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(error) => write!(f, "invalid argument: {error}"),
            Self::NotConfigured => f.write_str("channel has no slave configuration"),
            Self::Busy(reason) => write!(f, "channel busy: {reason}"),
            Self::OutOfMemory(kind) => write!(f, "out of memory allocating a {kind}"),
            Self::HardwareFault(error) => write!(f, "hardware fault: {error}"),
            Self::Timeout => f.write_str("timed out polling channel hardware"),
            Self::NoChannel => f.write_str("no such channel, or channel already claimed"),
            Self::Platform(reason) => write!(f, "platform bring-up failed: {reason}"),
        }
    }
}

impl From<InvalidArgument> for DmaError {
    fn from(error: InvalidArgument) -> Self {
        Self::InvalidArgument(error)
    }
}

impl From<BusyReason> for DmaError {
    fn from(reason: BusyReason) -> Self {
        Self::Busy(reason)
    }
}

impl From<HardwareError> for DmaError {
    fn from(error: HardwareError) -> Self {
        Self::HardwareFault(error)
    }
}

// === impl InvalidArgument ===

impl InvalidArgument {
    #[must_use]
    pub(crate) fn misaligned(operand: Operand, value: u64) -> Self {
        Self::Misaligned { operand, value }
    }
}

impl fmt::Display for InvalidArgument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Misaligned { operand, value } => {
                write!(f, "{operand} {value:#x} is not 4-byte aligned")
            }
            Self::ZeroLength => f.write_str("zero-length transfer"),
            Self::TooLong { len, max } => {
                write!(f, "length {len} is greater than the maximum ({max})")
            }
            Self::PeriodMismatch {
                buf_len,
                period_len,
            } => write!(
                f,
                "buffer length {buf_len} is not a multiple of period length {period_len}"
            ),
            Self::EmptyList => f.write_str("scatter-gather list is empty"),
            Self::UnsupportedDirection => {
                f.write_str("peripheral transfers must be device-to-memory or memory-to-device")
            }
            Self::StaleHandle => f.write_str("transfer handle is stale or was already submitted"),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Source => "source address",
            Self::Destination => "destination address",
            Self::Length => "length",
            Self::Period => "period length",
        })
    }
}

// === impl BusyReason ===

impl fmt::Display for BusyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SegmentsPending => f.write_str("segments are still pending"),
            Self::ModeConflict { installed } => {
                write!(f, "a {installed} completion handler is installed")
            }
            Self::ChannelRunning => f.write_str("hardware is running a transfer"),
        }
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Transfer => "transfer descriptor",
            Self::Segment => "segment",
        })
    }
}

// === impl HardwareError ===

impl HardwareError {
    /// Decodes a raw error status register value.
    ///
    /// Returns `None` if no error is latched.
    #[must_use]
    pub fn from_err_status(raw: u32) -> Option<Self> {
        if raw == 0 {
            return None;
        }
        let err = match ErrStatus::from_bits(raw).get(ErrStatus::ERR_TYPE) {
            0xf => Self::BufferFifoFull,
            0xe => Self::PeripheralFifoFull,
            0xd => Self::InvalidPeripheralId,
            0xc => Self::InvalidStreamId,
            0xb => Self::MemorySlave,
            0xa => Self::MmioSlave,
            _ => Self::SecurityViolation,
        };
        Some(err)
    }
}

impl fmt::Display for HardwareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BufferFifoFull => "buffer manager fifo full",
            Self::PeripheralFifoFull => "peripheral fifo full",
            Self::InvalidPeripheralId => "invalid peripheral id",
            Self::InvalidStreamId => "invalid stream id",
            Self::MemorySlave => "memory slave error",
            Self::MmioSlave => "mmio slave error",
            Self::SecurityViolation => "security violation",
        })
    }
}
