//! Turning client requests into segments.
use alloc::vec::Vec;

use embedded_hal::blocking::delay::DelayUs;

use super::{Channel, State};
use crate::{
    config::{Direction, SlaveConfig},
    descriptor::{
        BusAddr, Callback, HwConfig, PrepFlags, Segment, SgEntry, Transfer, TransferHandle,
        TransferMode,
    },
    error::{BusyReason, DmaError, InvalidArgument, Operand, PoolKind},
    pool::Key,
    regs::{BusWidth, Csr, DmaMode, McBurst, McSeq, MmioBurst, MmioSeq, Reg, RegisterFile, Status},
};

/// How many times `issue_pending` polls for a cyclic channel to go busy
/// before priming its second period.
const CYCLIC_PRIME_POLLS: usize = 20;

impl<R, D> Channel<R, D>
where
    R: RegisterFile,
    D: DelayUs<u32>,
{
    /// Prepares a memory-to-memory copy of `len` bytes.
    #[tracing::instrument(level = "debug", skip(self, callback), fields(channel = self.id))]
    pub fn prepare_memcpy(
        &self,
        dst: BusAddr,
        src: BusAddr,
        len: usize,
        flags: PrepFlags,
        callback: Option<Callback>,
    ) -> Result<TransferHandle, DmaError> {
        self.check_segment(src, Operand::Source, len)?;
        self.check_segment(dst, Operand::Destination, len)?;

        self.with_state(|state, regs| {
            state.check_mode(TransferMode::OneShot)?;
            let current = McSeq::from_bits(regs.read(Reg::McSeq));
            let mc_seq = memory_mc_seq(current)
                .with(McSeq::STREAM_ID1, current.get(McSeq::STREAM_ID1));
            let hw = HwConfig {
                csr: one_shot_csr(DmaMode::Mem2Mem, flags),
                mc_seq,
                wcount: HwConfig::wcount_for(len),
                ..HwConfig::new()
            }
            .with_addresses(src, dst);

            state.build(TransferMode::OneShot, flags, callback, [Segment::new(hw, len)])
        })
    }

    /// Prepares filling `len` bytes at `dst` with `pattern`.
    #[tracing::instrument(level = "debug", skip(self, callback), fields(channel = self.id))]
    pub fn prepare_memset(
        &self,
        dst: BusAddr,
        pattern: u32,
        len: usize,
        flags: PrepFlags,
        callback: Option<Callback>,
    ) -> Result<TransferHandle, DmaError> {
        self.check_segment(dst, Operand::Destination, len)?;

        self.with_state(|state, regs| {
            state.check_mode(TransferMode::OneShot)?;
            let current = McSeq::from_bits(regs.read(Reg::McSeq));
            let hw = HwConfig {
                csr: one_shot_csr(DmaMode::FixedPattern, flags),
                mc_seq: memory_mc_seq(current),
                wcount: HwConfig::wcount_for(len),
                fixed_pattern: pattern,
                ..HwConfig::new()
            }
            .with_addresses(0, dst);

            state.build(TransferMode::OneShot, flags, callback, [Segment::new(hw, len)])
        })
    }

    /// Prepares a peripheral transfer over a scatter-gather list, one
    /// segment per entry.
    #[tracing::instrument(
        level = "debug",
        skip(self, sgl, callback),
        fields(channel = self.id, entries = sgl.len())
    )]
    pub fn prepare_slave_sg(
        &self,
        sgl: &[SgEntry],
        direction: Direction,
        flags: PrepFlags,
        callback: Option<Callback>,
    ) -> Result<TransferHandle, DmaError> {
        if sgl.is_empty() {
            return Err(InvalidArgument::EmptyList.into());
        }
        let operand = memory_operand(direction)?;
        for entry in sgl {
            self.check_segment(entry.addr, operand, entry.len)?;
        }

        self.with_state(|state, regs| {
            let params = state.slave_params(direction)?;
            state.check_mode(TransferMode::OneShot)?;
            let mc_seq = params.mc_seq(McSeq::from_bits(regs.read(Reg::McSeq)));
            let csr = params.csr(flags).with(Csr::ONCE, true);

            let id = state.id;
            let segments = sgl.iter().map(move |entry| {
                let hw = params.segment(id, csr, mc_seq, entry.addr, entry.len);
                Segment::new(hw, entry.len)
            });
            state.build(TransferMode::OneShot, flags, callback, segments)
        })
    }

    /// Prepares a repeating transfer over `buf_len` bytes at `buf`, split
    /// into periods of `period_len` bytes.
    ///
    /// The channel must not be running.
    #[tracing::instrument(level = "debug", skip(self, callback), fields(channel = self.id))]
    pub fn prepare_cyclic(
        &self,
        buf: BusAddr,
        buf_len: usize,
        period_len: usize,
        direction: Direction,
        flags: PrepFlags,
        callback: Option<Callback>,
    ) -> Result<TransferHandle, DmaError> {
        if buf_len == 0 || period_len == 0 {
            return Err(InvalidArgument::ZeroLength.into());
        }
        if buf_len % period_len != 0 {
            return Err(InvalidArgument::PeriodMismatch {
                buf_len,
                period_len,
            }
            .into());
        }
        let operand = memory_operand(direction)?;
        if period_len % 4 != 0 {
            return Err(InvalidArgument::misaligned(Operand::Period, period_len as u64).into());
        }
        self.check_segment(buf, operand, period_len)?;

        self.with_state(|state, regs| {
            let params = state.slave_params(direction)?;
            if state.busy {
                return Err(BusyReason::ChannelRunning.into());
            }
            state.check_mode(TransferMode::Cyclic)?;
            let mc_seq = params.mc_seq(McSeq::from_bits(regs.read(Reg::McSeq)));
            let csr = params.csr(flags);

            let id = state.id;
            let periods = buf_len / period_len;
            let segments = (0..periods).map(move |period| {
                let addr = buf + (period * period_len) as u64;
                let hw = params.segment(id, csr, mc_seq, addr, period_len);
                Segment::new(hw, period_len)
            });
            state.build(TransferMode::Cyclic, flags, callback, segments)
        })
    }

    /// Starts the hardware on the head of the pending queue, if it is not
    /// already running.
    ///
    /// Cyclic transfers also get their second period loaded into the
    /// hardware's next-transfer slot.
    #[tracing::instrument(level = "debug", skip(self), fields(channel = self.id))]
    pub fn issue_pending(&self) {
        self.with_state(|state, regs| {
            if state.pending.is_empty() {
                tracing::error!(channel = state.id, "no DMA request to issue");
                return;
            }
            if state.busy {
                return;
            }

            state.start_head(regs);
            if state.handler != Some(TransferMode::Cyclic) {
                return;
            }

            for _ in 0..CYCLIC_PRIME_POLLS {
                if Status::from_bits(regs.read(Reg::Status)).get(Status::BUSY) {
                    break;
                }
                state.delay.delay_us(1);
            }
            if let Some(&next) = state.pending.get(1) {
                state.configure_next(regs, next);
            }
        })
    }

    fn check_segment(
        &self,
        addr: BusAddr,
        operand: Operand,
        len: usize,
    ) -> Result<(), InvalidArgument> {
        if len == 0 {
            return Err(InvalidArgument::ZeroLength);
        }
        if len % 4 != 0 {
            return Err(InvalidArgument::misaligned(Operand::Length, len as u64));
        }
        if addr % 4 != 0 {
            return Err(InvalidArgument::misaligned(operand, addr));
        }
        if len > self.max_transfer_count {
            return Err(InvalidArgument::TooLong {
                len,
                max: self.max_transfer_count,
            });
        }
        Ok(())
    }
}

impl<D> State<D> {
    /// Allocates a transfer and its segments and stages it on the channel.
    ///
    /// On failure, everything allocated so far goes back to the pools.
    fn build(
        &mut self,
        mode: TransferMode,
        flags: PrepFlags,
        callback: Option<Callback>,
        segments: impl IntoIterator<Item = Segment>,
    ) -> Result<TransferHandle, DmaError> {
        let key = self
            .transfers
            .acquire(Transfer::new(mode, 0, flags, callback, Vec::new()))?;
        if let Err(error) = self.fill(key, segments) {
            tracing::debug!(channel = self.id, %error, "failed to build transfer");
            self.release_transfer(key);
            return Err(error);
        }

        self.staged += 1;
        self.handler = Some(mode);
        Ok(TransferHandle {
            channel: self.id,
            key,
        })
    }

    fn fill(&mut self, key: Key, segments: impl IntoIterator<Item = Segment>) -> Result<(), DmaError> {
        self.reserve_transfer_lists()?;

        let mut last = None;
        for mut segment in segments {
            segment.transfer = Some(key);
            let len = segment.len;
            let segment = self.segments.acquire(segment)?;
            let Some(transfer) = self.transfers.get_mut(key) else {
                self.segments.release(segment);
                return Err(InvalidArgument::StaleHandle.into());
            };
            if transfer.segments.try_reserve(1).is_err() {
                self.segments.release(segment);
                return Err(DmaError::OutOfMemory(PoolKind::Segment));
            }
            transfer.segments.push(segment);
            transfer.bytes_requested += len;
            last = Some(segment);
        }

        match last.and_then(|segment| self.segments.get_mut(segment)) {
            Some(segment) => {
                segment.last = true;
                Ok(())
            }
            None => Err(InvalidArgument::EmptyList.into()),
        }
    }

    fn slave_params(&self, direction: Direction) -> Result<SlaveParams, DmaError> {
        let (Some(slave), Some(peripheral)) = (self.slave, self.slave_id) else {
            return Err(DmaError::NotConfigured);
        };
        SlaveParams::new(&slave, direction, peripheral)
    }
}

/// Peripheral-side parameters for one direction.
struct SlaveParams {
    direction: Direction,
    mode: DmaMode,
    peripheral: u8,
    dev_addr: BusAddr,
    width: u8,
    maxburst: u32,
}

impl SlaveParams {
    fn new(config: &SlaveConfig, direction: Direction, peripheral: u8) -> Result<Self, DmaError> {
        let (mode, dev_addr, width, maxburst) = match direction {
            Direction::MemToDev => (
                DmaMode::Mem2IoFc,
                config.dst_addr,
                config.dst_addr_width,
                config.dst_maxburst,
            ),
            Direction::DevToMem => (
                DmaMode::Io2MemFc,
                config.src_addr,
                config.src_addr_width,
                config.src_maxburst,
            ),
            Direction::MemToMem => return Err(InvalidArgument::UnsupportedDirection.into()),
        };
        Ok(Self {
            direction,
            mode,
            peripheral,
            dev_addr,
            width,
            maxburst,
        })
    }

    fn csr(&self, flags: PrepFlags) -> Csr {
        base_csr(self.mode, flags).with(Csr::REQ_SEL, self.peripheral.into())
    }

    /// Keeps the first stream id and balances the memory burst against the
    /// peripheral's.
    fn mc_seq(&self, current: McSeq) -> McSeq {
        let burst = if self.maxburst == 64 {
            McBurst::Words16
        } else {
            McBurst::Words2
        };
        McSeq::new()
            .with(McSeq::STREAM_ID0, current.get(McSeq::STREAM_ID0))
            .with(McSeq::REQ_COUNT, 1)
            .with(McSeq::BURST, burst)
    }

    fn segment(&self, channel: u8, csr: Csr, mc_seq: McSeq, mem: BusAddr, len: usize) -> HwConfig {
        let mmio_seq = MmioSeq::new()
            .with(MmioSeq::BUS_WIDTH, bus_width(channel, self.width))
            .with(MmioSeq::WRAP_WORD, 1)
            .with(MmioSeq::BURST, mmio_burst(self.maxburst, self.width, len));
        let (src, dst) = match self.direction {
            Direction::MemToDev => (mem, self.dev_addr),
            _ => (self.dev_addr, mem),
        };
        HwConfig {
            csr,
            mc_seq,
            mmio_seq,
            wcount: HwConfig::wcount_for(len),
            ..HwConfig::new()
        }
        .with_addresses(src, dst)
    }
}

fn memory_operand(direction: Direction) -> Result<Operand, InvalidArgument> {
    match direction {
        Direction::MemToDev => Ok(Operand::Source),
        Direction::DevToMem => Ok(Operand::Destination),
        Direction::MemToMem => Err(InvalidArgument::UnsupportedDirection),
    }
}

fn base_csr(mode: DmaMode, flags: PrepFlags) -> Csr {
    Csr::new()
        .with(Csr::DMA_MODE, mode)
        .with(Csr::IRQ_MASK, true)
        .with(Csr::WEIGHT, 1)
        .with(Csr::IE_EOC, flags.get(PrepFlags::INTERRUPT))
}

fn one_shot_csr(mode: DmaMode, flags: PrepFlags) -> Csr {
    base_csr(mode, flags).with(Csr::ONCE, true)
}

/// Memory-side sequencer for memory-only transfers: first stream id, one
/// outstanding request, 16-word bursts.
fn memory_mc_seq(current: McSeq) -> McSeq {
    McSeq::new()
        .with(McSeq::STREAM_ID0, current.get(McSeq::STREAM_ID0))
        .with(McSeq::REQ_COUNT, 1)
        .with(McSeq::BURST, McBurst::Words16)
}

fn bus_width(channel: u8, bytes: u8) -> BusWidth {
    match bytes {
        1 => BusWidth::Bits8,
        2 => BusWidth::Bits16,
        4 => BusWidth::Bits32,
        8 => BusWidth::Bits64,
        _ => {
            tracing::warn!(channel, bytes, "unsupported bus width, using 32 bits");
            BusWidth::Bits32
        }
    }
}

/// Picks the peripheral burst for a segment of `len` bytes.
///
/// `maxburst` is in units of `width` bytes. Without one, the burst is the
/// largest the length's alignment allows.
pub(crate) fn mmio_burst(maxburst: u32, width: u8, len: usize) -> MmioBurst {
    let words = maxburst.saturating_mul(u32::from(width)) / 4;
    if words == 0 {
        return match len.trailing_zeros() {
            0..=3 => MmioBurst::Words1,
            4 => MmioBurst::Words4,
            5 => MmioBurst::Words8,
            _ => MmioBurst::Words16,
        };
    }
    match words {
        0..=1 => MmioBurst::Words1,
        2..=3 => MmioBurst::Words2,
        4..=7 => MmioBurst::Words4,
        8..=15 => MmioBurst::Words8,
        _ => MmioBurst::Words16,
    }
}
