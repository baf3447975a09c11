//! Channel register file layout and access.
//!
//! Every channel owns a private block of registers. The scheduler never
//! touches them directly: all access goes through a [`RegisterFile`], which
//! makes the ordering contract between register writes explicit instead of
//! relying on incidental read-backs.
// Unusual groupings are used in binary literals in this file in order to
// separate the bits by which field they represent, rather than by their byte.
#![allow(clippy::unusual_byte_groupings)]

use core::{
    ptr::NonNull,
    sync::atomic::{fence, Ordering},
};

use mycelium_bitfield::{bitfield, enum_from_bits};

/// Offsets of the per-channel registers, relative to the channel's base.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(usize)]
pub enum Reg {
    Csr = 0x00,
    Status = 0x04,
    Csre = 0x08,
    SrcPtr = 0x0c,
    DstPtr = 0x10,
    HighAddrPtr = 0x14,
    McSeq = 0x18,
    MmioSeq = 0x1c,
    Wcount = 0x20,
    XferCount = 0x24,
    ByteStatus = 0x28,
    ErrStatus = 0x30,
    FixedPattern = 0x34,
}

impl Reg {
    /// Every register, in offset order.
    pub const ALL: [Reg; 13] = [
        Reg::Csr,
        Reg::Status,
        Reg::Csre,
        Reg::SrcPtr,
        Reg::DstPtr,
        Reg::HighAddrPtr,
        Reg::McSeq,
        Reg::MmioSeq,
        Reg::Wcount,
        Reg::XferCount,
        Reg::ByteStatus,
        Reg::ErrStatus,
        Reg::FixedPattern,
    ];

    #[inline]
    #[must_use]
    pub const fn offset(self) -> usize {
        self as usize
    }
}

/// Access to one channel's registers.
///
/// `write` is not assumed to be ordered with respect to later accesses.
/// Callers that need a write to land before a subsequent read (or before
/// handing control back to hardware) must call [`write_barrier`] or use
/// [`read_back`].
///
/// [`write_barrier`]: RegisterFile::write_barrier
/// [`read_back`]: RegisterFile::read_back
pub trait RegisterFile {
    fn read(&self, reg: Reg) -> u32;

    fn write(&self, reg: Reg, value: u32);

    /// Orders all preceding register writes before any subsequent access.
    #[inline]
    fn write_barrier(&self) {
        fence(Ordering::SeqCst);
    }

    /// Reads `reg` after every preceding write has landed.
    #[inline]
    fn read_back(&self, reg: Reg) -> u32 {
        self.write_barrier();
        self.read(reg)
    }
}

impl<R: RegisterFile + ?Sized> RegisterFile for &R {
    #[inline]
    fn read(&self, reg: Reg) -> u32 {
        R::read(self, reg)
    }

    #[inline]
    fn write(&self, reg: Reg, value: u32) {
        R::write(self, reg, value)
    }

    #[inline]
    fn write_barrier(&self) {
        R::write_barrier(self)
    }

    #[inline]
    fn read_back(&self, reg: Reg) -> u32 {
        R::read_back(self, reg)
    }
}

/// A memory-mapped channel register block.
#[derive(Debug)]
pub struct Mmio {
    base: NonNull<u32>,
}

// SAFETY: the register block is device memory; all accesses are volatile and
// word sized, and callers serialize them under the channel lock.
unsafe impl Send for Mmio {}
unsafe impl Sync for Mmio {}

impl Mmio {
    /// # Safety
    ///
    /// `base` must be the 4-byte aligned address of a mapped channel register
    /// block that stays mapped for the lifetime of the returned value, and no
    /// other code may concurrently program the same channel.
    pub unsafe fn new(base: NonNull<u32>) -> Self {
        Self { base }
    }

    #[inline]
    fn ptr(&self, reg: Reg) -> *mut u32 {
        self.base.as_ptr().wrapping_byte_add(reg.offset())
    }
}

impl RegisterFile for Mmio {
    #[inline]
    fn read(&self, reg: Reg) -> u32 {
        // SAFETY: `Mmio::new`'s contract guarantees the block is mapped.
        unsafe { self.ptr(reg).read_volatile() }
    }

    #[inline]
    fn write(&self, reg: Reg, value: u32) {
        // SAFETY: `Mmio::new`'s contract guarantees the block is mapped.
        unsafe { self.ptr(reg).write_volatile(value) }
    }
}

enum_from_bits! {
    #[derive(Debug, Eq, PartialEq)]
    #[cfg_attr(test, derive(proptest_derive::Arbitrary))]
    pub enum DmaMode<u8> {
        Io2MemNoFc = 0,
        Io2MemFc = 1,
        Mem2IoNoFc = 2,
        Mem2IoFc = 3,
        Mem2Mem = 4,
        FixedPattern = 6,
    }
}

enum_from_bits! {
    /// Memory-side burst length.
    #[derive(Debug, Eq, PartialEq)]
    #[cfg_attr(test, derive(proptest_derive::Arbitrary))]
    pub enum McBurst<u8> {
        Words2 = 0b00,
        Words16 = 0b11,
    }
}

enum_from_bits! {
    /// Peripheral-side burst length.
    #[derive(Debug, Eq, PartialEq)]
    #[cfg_attr(test, derive(proptest_derive::Arbitrary))]
    pub enum MmioBurst<u8> {
        Words1 = 0b0000,
        Words2 = 0b0001,
        Words4 = 0b0011,
        Words8 = 0b0111,
        Words16 = 0b1111,
    }
}

enum_from_bits! {
    #[derive(Debug, Eq, PartialEq)]
    #[cfg_attr(test, derive(proptest_derive::Arbitrary))]
    pub enum BusWidth<u8> {
        Bits8 = 0,
        Bits16 = 1,
        Bits32 = 2,
        Bits64 = 3,
        Bits128 = 4,
    }
}

bitfield! {
    /// Channel control and status register.
    #[derive(Eq, PartialEq)]
    pub struct Csr<u32> {
        const _RESERVED_0 = 10;
        /// Arbitration weight.
        pub const WEIGHT = 4;
        const _RESERVED_1 = 1;
        /// Mask the end-of-chain interrupt from the interrupt controller.
        pub const IRQ_MASK: bool;
        /// Peripheral request line.
        pub const REQ_SEL = 5;
        pub const DMA_MODE: DmaMode;
        const _RESERVED_2 = 3;
        /// Run the programmed transfer once, rather than reloading it.
        pub const ONCE: bool;
        const _RESERVED_3 = 2;
        /// Raise an interrupt at end of chain.
        pub const IE_EOC: bool;
        /// Channel enable.
        pub const ENB: bool;
    }
}

impl Csr {
    /// Request line value that is never wired to a peripheral.
    pub const REQ_SEL_RESERVED: u32 = 0x4;
}

bitfield! {
    /// Channel status register.
    #[derive(Eq, PartialEq)]
    pub struct Status<u32> {
        const _RESERVED_0 = 20;
        pub const IRQ_TRIG: bool;
        pub const IRQ: bool;
        const _RESERVED_1 = 1;
        pub const IRQ_INTR: bool;
        /// A transmit burst is in progress.
        pub const CHANNEL_TX: bool;
        /// A receive burst is in progress.
        pub const CHANNEL_RX: bool;
        pub const PAUSED: bool;
        pub const ACTIVITY: bool;
        pub const PING_PONG: bool;
        const _RESERVED_2 = 1;
        /// End of chain. Write one to clear.
        pub const ISE_EOC: bool;
        pub const BUSY: bool;
    }
}

bitfield! {
    /// Channel control-enable register.
    #[derive(Eq, PartialEq)]
    pub struct Csre<u32> {
        const _RESERVED_0 = 31;
        pub const PAUSE: bool;
    }
}

bitfield! {
    /// Upper bits of the 40-bit source and destination addresses.
    #[derive(Eq, PartialEq)]
    pub struct HighAddr<u32> {
        pub const SRC = 8;
        const _RESERVED_0 = 8;
        pub const DST = 8;
    }
}

bitfield! {
    /// Memory-side sequencer configuration.
    #[derive(Eq, PartialEq)]
    pub struct McSeq<u32> {
        pub const STREAM_ID0 = 7;
        pub const STREAM_ID1 = 7;
        pub const MC_PROT = 3;
        pub const WRAP0 = 3;
        pub const WRAP1 = 3;
        pub const BURST: McBurst;
        pub const REQ_COUNT = 6;
        pub const DATA_SWAP: bool;
    }
}

bitfield! {
    /// Peripheral-side (MMIO) sequencer configuration.
    #[derive(Eq, PartialEq)]
    pub struct MmioSeq<u32> {
        const _RESERVED_0 = 7;
        pub const MMIO_PROT = 9;
        pub const WRAP_WORD = 3;
        pub const MASTER_ID = 4;
        pub const BURST: MmioBurst;
        pub const DATA_SWAP: bool;
        pub const BUS_WIDTH: BusWidth;
        pub const DBL_BUF: bool;
    }
}

bitfield! {
    /// Latched bus error information.
    #[derive(Eq, PartialEq)]
    pub struct ErrStatus<u32> {
        const _RESERVED_0 = 8;
        pub const ERR_TYPE = 4;
    }
}

impl ErrStatus {
    /// Value written to the error status register to clear every latched
    /// error.
    pub const CLEAR_ALL: u32 = 0xffff_ffff;
}

#[cfg(test)]
mod tests {
    use proptest::{prop_assert_eq, proptest};

    use super::*;

    #[test]
    fn layouts_are_valid() {
        Csr::assert_valid();
        Status::assert_valid();
        Csre::assert_valid();
        HighAddr::assert_valid();
        McSeq::assert_valid();
        MmioSeq::assert_valid();
        ErrStatus::assert_valid();
    }

    #[test]
    fn control_bits() {
        assert_eq!(Csr::new().with(Csr::ENB, true).bits(), 1 << 31);
        assert_eq!(Csr::new().with(Csr::IE_EOC, true).bits(), 1 << 30);
        assert_eq!(Csr::new().with(Csr::ONCE, true).bits(), 1 << 27);
        assert_eq!(Csr::new().with(Csr::IRQ_MASK, true).bits(), 1 << 15);
        assert_eq!(Csr::new().with(Csr::WEIGHT, 1).bits(), 1 << 10);
        assert_eq!(
            Csr::new().with(Csr::DMA_MODE, DmaMode::Mem2IoFc).bits(),
            3 << 21
        );
        assert_eq!(
            Csr::new().with(Csr::DMA_MODE, DmaMode::FixedPattern).bits(),
            6 << 21
        );
        assert_eq!(Status::new().with(Status::BUSY, true).bits(), 1 << 31);
        assert_eq!(Status::new().with(Status::ISE_EOC, true).bits(), 1 << 30);
        assert_eq!(Status::new().with(Status::CHANNEL_RX, true).bits(), 1 << 25);
        assert_eq!(Status::new().with(Status::CHANNEL_TX, true).bits(), 1 << 24);
        assert_eq!(Csre::new().with(Csre::PAUSE, true).bits(), 1 << 31);
    }

    #[test]
    fn sequencer_bits() {
        assert_eq!(McSeq::new().with(McSeq::BURST, McBurst::Words16).bits(), 3 << 23);
        assert_eq!(McSeq::new().with(McSeq::REQ_COUNT, 1).bits(), 1 << 25);
        assert_eq!(McSeq::new().with(McSeq::STREAM_ID1, 0x20).bits(), 0x20 << 7);
        assert_eq!(
            MmioSeq::new().with(MmioSeq::BUS_WIDTH, BusWidth::Bits32).bits(),
            2 << 28
        );
        assert_eq!(
            MmioSeq::new().with(MmioSeq::BURST, MmioBurst::Words8).bits(),
            7 << 23
        );
        assert_eq!(MmioSeq::new().with(MmioSeq::WRAP_WORD, 1).bits(), 1 << 16);
        assert_eq!(ErrStatus::from_bits(0x0000_0e00).get(ErrStatus::ERR_TYPE), 0xe);
    }

    proptest! {
        #[test]
        fn pack_high_addr(src in 0u32..=0xff, dst in 0u32..=0xff) {
            let high = HighAddr::new()
                .with(HighAddr::SRC, src)
                .with(HighAddr::DST, dst);
            prop_assert_eq!(
                src | (dst << 16),
                high.bits(),
                "\n{:032b} (expected), vs:\n{}",
                src | (dst << 16),
                high
            );
        }

        #[test]
        fn pack_csr(mode: DmaMode, req_sel in 0u32..0x20, once: bool, ie_eoc: bool) {
            let csr = Csr::new()
                .with(Csr::DMA_MODE, mode)
                .with(Csr::REQ_SEL, req_sel)
                .with(Csr::ONCE, once)
                .with(Csr::IE_EOC, ie_eoc);
            let manual = ((mode as u32) << 21)
                | (req_sel << 16)
                | ((once as u32) << 27)
                | ((ie_eoc as u32) << 30);
            prop_assert_eq!(manual, csr.bits(), "\n{:032b} (expected), vs:\n{}", manual, csr);
        }
    }
}
