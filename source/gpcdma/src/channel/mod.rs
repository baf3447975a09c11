//! Per-channel scheduling state.
//!
//! A [`Channel`] owns one hardware register file and everything queued on it:
//! the descriptor pools, the FIFO of pending segments, and the list of
//! transfers waiting for their completion callbacks. All of it sits behind the
//! channel's own spinlock, taken with local interrupts masked because the
//! channel's interrupt handler takes the same lock. Channels never share a
//! lock.
use alloc::{collections::VecDeque, vec::Vec};

use embedded_hal::blocking::delay::DelayUs;
use maitake_sync::spin::Mutex;

use crate::{
    config::{PlatformConfig, SlaveConfig},
    descriptor::{
        Cookie, Cookies, Segment, Stage, Transfer, TransferHandle, TransferMode, TxState,
        TxStatus,
    },
    error::{BusyReason, DmaError, InvalidArgument, PoolKind},
    pool::{Key, PoolStats, Slab},
    regs::{Csr, Csre, McSeq, Reg, RegisterFile, Status},
};

mod isr;
mod prep;
mod terminate;

pub use self::{isr::IrqReturn, terminate::Terminated};

/// Failed transfers whose final status is kept after their descriptors are
/// reused.
const FAILURE_HISTORY: usize = 32;

/// One hardware DMA channel and its software queues.
pub struct Channel<R, D> {
    id: u8,
    max_transfer_count: usize,
    regs: R,
    state: Mutex<State<D>>,
}

/// Coarse channel state, as seen by a client.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChannelPhase {
    /// No segments are pending.
    Idle,
    /// At least one segment is pending. The hardware may or may not be
    /// running it yet.
    Busy,
}

/// Occupancy of a channel's descriptor pools.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ChannelPools {
    pub transfers: PoolStats,
    pub segments: PoolStats,
}

pub(crate) struct State<D> {
    id: u8,
    /// The hardware has been started on the head segment.
    busy: bool,
    /// Completion handler variant in use. Fixed until the channel drains.
    handler: Option<TransferMode>,
    slave: Option<SlaveConfig>,
    /// Peripheral request line.
    slave_id: Option<u8>,
    /// Segments queued on the hardware, head first.
    pending: VecDeque<Key>,
    /// Transfers owed callback invocations.
    cb_list: VecDeque<Key>,
    /// Finished transfers the client has not acknowledged.
    awaiting_ack: Vec<Key>,
    /// Prepared transfers that have not been submitted.
    staged: usize,
    transfers: Slab<Transfer>,
    segments: Slab<Segment>,
    cookies: Cookies,
    /// Most recent failures, oldest first.
    failures: VecDeque<Failure>,
    delay: D,
}

#[derive(Copy, Clone, Debug)]
struct Failure {
    key: Key,
    cookie: Option<Cookie>,
    status: TxStatus,
}

// === impl Channel ===

impl<R, D> Channel<R, D>
where
    R: RegisterFile,
    D: DelayUs<u32>,
{
    pub(crate) fn new(id: u8, regs: R, delay: D, config: &PlatformConfig) -> Self {
        let mut state = State {
            id,
            busy: false,
            handler: None,
            slave: None,
            slave_id: None,
            pending: VecDeque::new(),
            cb_list: VecDeque::new(),
            awaiting_ack: Vec::new(),
            staged: 0,
            transfers: Slab::new(PoolKind::Transfer, config.max_transfers),
            segments: Slab::new(PoolKind::Segment, config.max_segments),
            cookies: Cookies::new(),
            failures: VecDeque::new(),
            delay,
        };

        let transfers = state
            .transfers
            .preallocate(config.preallocated_transfers, Transfer::empty);
        let segments = state
            .segments
            .preallocate(config.preallocated_segments, Segment::empty);
        if transfers < config.preallocated_transfers || segments < config.preallocated_segments {
            tracing::warn!(
                channel = id,
                transfers,
                segments,
                "could not preallocate every descriptor"
            );
        }
        // Room for every preallocated transfer to finish without growing the
        // completion lists from the interrupt handler.
        if state.reserve_transfer_lists().is_err()
            || state.failures.try_reserve_exact(FAILURE_HISTORY).is_err()
        {
            tracing::warn!(channel = id, "could not reserve completion lists");
        }

        let mc_seq = McSeq::from_bits(regs.read(Reg::McSeq))
            .with(McSeq::STREAM_ID0, config.stream_id.into())
            .with(McSeq::STREAM_ID1, config.stream_id.into());
        regs.write(Reg::McSeq, mc_seq.bits());

        Self {
            id,
            max_transfer_count: config.max_transfer_count,
            regs,
            state: Mutex::new(state),
        }
    }

    #[must_use]
    pub fn id(&self) -> u8 {
        self.id
    }

    #[must_use]
    pub fn phase(&self) -> ChannelPhase {
        self.with_state(|state, _| {
            if state.pending.is_empty() {
                ChannelPhase::Idle
            } else {
                ChannelPhase::Busy
            }
        })
    }

    #[must_use]
    pub fn pools(&self) -> ChannelPools {
        self.with_state(|state, _| ChannelPools {
            transfers: state.transfers.stats(),
            segments: state.segments.stats(),
        })
    }

    /// Prepares the channel for a new client.
    #[tracing::instrument(level = "debug", skip(self), fields(channel = self.id))]
    pub fn allocate_resources(&self) -> Result<(), DmaError> {
        self.with_state(|state, _| {
            state.cookies = Cookies::new();
            state.failures.clear();
            state.slave = None;
        });
        Ok(())
    }

    /// Returns the channel to its quiescent state.
    ///
    /// Any running transfer is terminated. Callbacks still owed to the
    /// departing client are dropped without being invoked.
    #[tracing::instrument(level = "debug", skip(self), fields(channel = self.id))]
    pub fn free_resources(&self) {
        self.with_state(|state, regs| {
            let terminated = state.terminate(regs, true);
            if terminated.is_degraded() {
                tracing::warn!(channel = state.id, "freed channel after a degraded termination");
            }
            state.transfers.release_all();
            state.segments.release_all();
            state.awaiting_ack.clear();
            state.staged = 0;
            state.slave = None;
            state.slave_id = None;
            state.handler = None;
        })
    }

    /// Installs peripheral parameters for slave transfers.
    ///
    /// Fails with [`BusyReason::SegmentsPending`] while segments are queued.
    #[tracing::instrument(level = "debug", skip(self), fields(channel = self.id))]
    pub fn configure_slave(&self, config: SlaveConfig) -> Result<(), DmaError> {
        self.with_state(|state, _| {
            if !state.pending.is_empty() {
                return Err(BusyReason::SegmentsPending.into());
            }
            if state.slave_id.is_none() {
                state.slave_id = config.peripheral_id;
            }
            state.slave = Some(config);
            Ok(())
        })
    }

    /// Binds the channel to a peripheral request line.
    pub(crate) fn bind_peripheral(&self, peripheral: Option<u8>) {
        self.with_state(|state, _| state.slave_id = peripheral)
    }

    /// Marks a prepared transfer ready to run and assigns its cookie.
    ///
    /// The hardware is not touched until [`issue_pending`](Self::issue_pending).
    pub fn submit(&self, handle: TransferHandle) -> Result<Cookie, DmaError> {
        self.check_handle(handle)?;
        self.with_state(|state, _| {
            let Some(transfer) = state.transfers.get(handle.key) else {
                return Err(InvalidArgument::StaleHandle.into());
            };
            if transfer.stage != Stage::Prepared {
                return Err(InvalidArgument::StaleHandle.into());
            }
            let mode = transfer.mode;
            state.check_mode(mode)?;

            let segments = transfer.segments.len();
            state
                .pending
                .try_reserve(segments)
                .map_err(|_| DmaError::OutOfMemory(PoolKind::Segment))?;

            let cookie = state.cookies.assign();
            let Some(transfer) = state.transfers.get_mut(handle.key) else {
                return Err(InvalidArgument::StaleHandle.into());
            };
            transfer.stage = Stage::Submitted;
            transfer.cookie = Some(cookie);
            state.pending.extend(transfer.segments.iter().copied());
            state.staged = state.staged.saturating_sub(1);
            state.handler = Some(mode);

            tracing::trace!(channel = state.id, %cookie, segments, "submitted transfer");
            Ok(cookie)
        })
    }

    /// Returns the state of the transfer named by `handle`.
    ///
    /// Recent failures are remembered after their descriptors are reused.
    /// Any other handle whose descriptor has been handed out again is
    /// rejected with [`InvalidArgument::StaleHandle`].
    pub fn query_status(&self, handle: TransferHandle) -> Result<TxStatus, DmaError> {
        self.check_handle(handle)?;
        self.with_state(|state, _| {
            if let Some(transfer) = state.transfers.get_any(handle.key) {
                return Ok(transfer.status());
            }
            state
                .failures
                .iter()
                .find(|failure| failure.key == handle.key)
                .map(|failure| failure.status)
                .ok_or(InvalidArgument::StaleHandle.into())
        })
    }

    /// Returns the state of the transfer submitted with `cookie`.
    pub fn cookie_status(&self, cookie: Cookie) -> TxStatus {
        self.with_state(|state, _| {
            let found = state
                .transfers
                .iter_all()
                .find(|(_, transfer)| transfer.cookie == Some(cookie))
                .map(|(_, transfer)| transfer.status());
            if let Some(status) = found {
                return status;
            }
            let failed = state
                .failures
                .iter()
                .find(|failure| failure.cookie == Some(cookie));
            if let Some(failure) = failed {
                return failure.status;
            }

            let state = if state.cookies.is_complete(cookie) {
                TxState::Complete
            } else {
                tracing::debug!(channel = state.id, %cookie, "no descriptor for cookie");
                TxState::InProgress
            };
            TxStatus {
                state,
                residue: 0,
                fault: None,
            }
        })
    }

    /// Acknowledges a transfer, allowing its descriptor to be recycled once
    /// it has finished.
    pub fn ack(&self, handle: TransferHandle) -> Result<(), DmaError> {
        self.check_handle(handle)?;
        self.with_state(|state, _| {
            let Some(transfer) = state.transfers.get_mut(handle.key) else {
                return Err(InvalidArgument::StaleHandle.into());
            };
            if transfer.acked {
                return Ok(());
            }
            transfer.acked = true;
            if transfer.stage == Stage::Done && transfer.cb_count == 0 {
                state.awaiting_ack.retain(|key| *key != handle.key);
                state.release_transfer(handle.key);
            }
            Ok(())
        })
    }

    fn check_handle(&self, handle: TransferHandle) -> Result<(), DmaError> {
        if handle.channel != self.id {
            return Err(InvalidArgument::StaleHandle.into());
        }
        Ok(())
    }

    /// Runs `f` with this channel's lock held and local interrupts masked.
    fn with_state<T>(&self, f: impl FnOnce(&mut State<D>, &R) -> T) -> T {
        critical_section::with(|_| {
            let mut state = self.state.lock();
            f(&mut state, &self.regs)
        })
    }
}

// === impl State ===

impl<D> State<D> {
    /// Rejects work for `mode` while a different completion handler is
    /// installed.
    fn check_mode(&self, mode: TransferMode) -> Result<(), BusyReason> {
        match self.handler {
            Some(installed) if installed != mode => Err(BusyReason::ModeConflict { installed }),
            _ => Ok(()),
        }
    }

    /// Makes sure every transfer in the pool can sit on the completion and
    /// ack lists at once.
    fn reserve_transfer_lists(&mut self) -> Result<(), DmaError> {
        let transfers = self.transfers.len();
        let oom = |_| DmaError::OutOfMemory(PoolKind::Transfer);
        self.cb_list
            .try_reserve(transfers.saturating_sub(self.cb_list.len()))
            .map_err(oom)?;
        self.awaiting_ack
            .try_reserve(transfers.saturating_sub(self.awaiting_ack.len()))
            .map_err(oom)?;
        Ok(())
    }

    /// Programs the head segment into the idle hardware and enables it.
    fn start_head(&mut self, regs: &impl RegisterFile) {
        let Some(&head) = self.pending.front() else {
            return;
        };
        let Some(segment) = self.segments.get_mut(head) else {
            return;
        };
        tracing::trace!(
            channel = self.id,
            src = segment.hw.src,
            dst = segment.hw.dst,
            wcount = segment.hw.wcount,
            "starting segment"
        );
        segment.hw.start(regs);
        segment.configured = true;
        segment.skipped = false;
        self.busy = true;
    }

    /// Loads `key` into the hardware's next-transfer slot.
    ///
    /// If a completion is already pending, the slot still holds the segment
    /// the hardware is about to retire, so the segment is marked skipped and
    /// left for the interrupt handler.
    fn configure_next(&mut self, regs: &impl RegisterFile, key: Key) {
        let Some(segment) = self.segments.get_mut(key) else {
            return;
        };
        let status = Status::from_bits(regs.read_back(Reg::Status));
        if status.get(Status::ISE_EOC) {
            tracing::debug!(
                channel = self.id,
                "completion pending, skipping configuration of next segment"
            );
            segment.skipped = true;
            regs.write(Reg::Csre, Csre::new().bits());
            return;
        }

        tracing::trace!(
            channel = self.id,
            src = segment.hw.src,
            dst = segment.hw.dst,
            wcount = segment.hw.wcount,
            "configuring next segment"
        );
        segment.hw.load_next(regs);
        segment.configured = true;
        segment.skipped = false;
    }

    /// Disables the channel and its end-of-chain interrupt.
    fn stop(&mut self, regs: &impl RegisterFile) {
        let csr = Csr::from_bits(regs.read(Reg::Csr)).with(Csr::IE_EOC, false);
        regs.write(Reg::Csr, csr.bits());
        regs.write(Reg::Csr, csr.with(Csr::ENB, false).bits());

        let status = Status::from_bits(regs.read_back(Reg::Status));
        if status.get(Status::ISE_EOC) {
            regs.write(Reg::Status, Status::new().with(Status::ISE_EOC, true).bits());
        }
        self.busy = false;
    }

    /// Drops every pending segment. Transfers whose final segment was still
    /// queued end in [`TxState::Error`]. Returns the number of transfers
    /// aborted.
    fn abort_all(&mut self) -> usize {
        let mut aborted = 0;
        while let Some(key) = self.pending.pop_front() {
            let Some(segment) = self.segments.get(key) else {
                continue;
            };
            let (last, transfer) = (segment.last, segment.transfer);
            self.segments.release(key);
            if let (true, Some(transfer)) = (last, transfer) {
                self.finish(transfer, TxState::Error);
                aborted += 1;
            }
        }
        self.handler = None;
        aborted
    }

    /// Queues one callback invocation for `key`, if it has a callback.
    fn notify(&mut self, key: Key) {
        let Some(transfer) = self.transfers.get_mut(key) else {
            return;
        };
        if transfer.callback.is_none() {
            return;
        }
        if transfer.cb_count == 0 {
            // capacity for every transfer is reserved when one is prepared
            self.cb_list.push_back(key);
        }
        transfer.cb_count += 1;
    }

    /// Moves a transfer out of the pending state.
    fn finish(&mut self, key: Key, state: TxState) {
        let Some(transfer) = self.transfers.get_mut(key) else {
            return;
        };
        transfer.state = if transfer.fault.is_some() {
            TxState::Error
        } else {
            state
        };
        transfer.stage = Stage::Done;
        let cookie = transfer.cookie;
        if transfer.state == TxState::Complete {
            if let Some(cookie) = cookie {
                self.cookies.complete(cookie);
            }
        } else {
            let failure = Failure {
                key,
                cookie,
                status: transfer.status(),
            };
            self.record_failure(failure);
        }
        let Some(transfer) = self.transfers.get(key) else {
            return;
        };
        tracing::debug!(
            channel = self.id,
            cookie = ?transfer.cookie,
            state = ?transfer.state,
            bytes = transfer.bytes_transferred,
            "transfer finished"
        );

        self.notify(key);
        if self.transfers.get(key).map_or(false, |t| t.cb_count == 0) {
            self.retire(key);
        }
    }

    /// Remembers a failure, forgetting the oldest one when the history is
    /// full. Never allocates.
    fn record_failure(&mut self, failure: Failure) {
        if self.failures.len() == FAILURE_HISTORY {
            self.failures.pop_front();
        }
        if self.failures.len() < self.failures.capacity() {
            self.failures.push_back(failure);
        }
    }

    /// Recycles a finished transfer whose callbacks have all run, or parks it
    /// until the client acknowledges it.
    fn retire(&mut self, key: Key) {
        match self.transfers.get(key) {
            Some(transfer) if transfer.acked => self.release_transfer(key),
            Some(_) => self.awaiting_ack.push(key),
            None => {}
        }
    }

    fn release_transfer(&mut self, key: Key) {
        let Some(transfer) = self.transfers.get_mut(key) else {
            return;
        };
        for &segment in &transfer.segments {
            self.segments.release(segment);
        }
        transfer.segments.clear();
        self.transfers.release(key);
    }
}
