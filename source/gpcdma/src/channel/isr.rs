//! Interrupt handling and completion dispatch.
//!
//! The top half, [`Channel::handle_interrupt`], runs in interrupt context
//! with the channel lock held. It must never block: it only touches
//! registers, the pending queue, and list capacity reserved in advance. The
//! bottom half, [`Channel::dispatch_completions`], runs client callbacks
//! with the lock released.
use embedded_hal::blocking::delay::DelayUs;

use super::{Channel, State};
use crate::{
    descriptor::{Callback, Completion, Stage, TransferMode, TxState},
    error::HardwareError,
    pool::Key,
    regs::{ErrStatus, Reg, RegisterFile, Status},
};

/// What an interrupt handler tells the interrupt controller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IrqReturn {
    /// Nothing was pending. The interrupt was not for this channel.
    None,
    /// The interrupt was serviced.
    Handled,
    /// The interrupt was serviced and completion callbacks are waiting;
    /// schedule [`Channel::dispatch_completions`].
    WakeThread,
}

impl<R, D> Channel<R, D>
where
    R: RegisterFile,
    D: DelayUs<u32>,
{
    /// Services the channel's hardware interrupt.
    pub fn handle_interrupt(&self) -> IrqReturn {
        self.with_state(|state, regs| {
            let status = Status::from_bits(regs.read(Reg::Status));
            let err_status = regs.read(Reg::ErrStatus);
            let mut ret = IrqReturn::None;

            if let Some(fault) = HardwareError::from_err_status(err_status) {
                tracing::error!(
                    channel = state.id,
                    %fault,
                    err_status = &format_args!("{err_status:#010x}"),
                    "DMA transfer error"
                );
                regs.write(Reg::ErrStatus, ErrStatus::CLEAR_ALL);
                state.record_fault(fault);
                ret = IrqReturn::Handled;
            }

            if status.get(Status::ISE_EOC) {
                regs.write(Reg::Status, Status::new().with(Status::ISE_EOC, true).bits());
                state.run_handler(regs, false);
                ret = IrqReturn::Handled;
            } else if ret == IrqReturn::None {
                tracing::trace!(channel = state.id, status = %status, "interrupt already served");
            }

            if ret == IrqReturn::Handled && !state.cb_list.is_empty() {
                IrqReturn::WakeThread
            } else {
                ret
            }
        })
    }

    /// Invokes every queued completion callback.
    ///
    /// Each callback runs with the channel lock released, so callbacks may
    /// block and may call back into the channel. Returns the number of
    /// invocations.
    pub fn dispatch_completions(&self) -> usize {
        let mut invoked = 0;
        while let Some((key, callback, count, completion)) =
            self.with_state(|state, _| state.take_callback())
        {
            for _ in 0..count {
                callback(&completion);
            }
            invoked += count as usize;
            self.with_state(|state, _| state.after_dispatch(key));
        }
        invoked
    }
}

impl<D> State<D> {
    /// Runs the installed completion handler for the segment the hardware
    /// just retired.
    ///
    /// When `terminating`, byte counts are updated but nothing new is
    /// started.
    pub(super) fn run_handler(&mut self, regs: &impl RegisterFile, terminating: bool) {
        match self.handler {
            Some(TransferMode::OneShot) => self.complete_one_shot(regs, terminating),
            Some(TransferMode::Cyclic) => self.complete_cyclic(regs, terminating),
            None => {
                tracing::debug!(channel = self.id, "completion with no handler installed");
            }
        }
    }

    fn complete_one_shot(&mut self, regs: &impl RegisterFile, terminating: bool) {
        self.busy = false;
        let Some(head) = self.pending.pop_front() else {
            tracing::warn!(channel = self.id, "completion with nothing pending");
            return;
        };
        let Some(segment) = self.segments.get(head) else {
            return;
        };
        let (len, last, transfer) = (segment.len, segment.last, segment.transfer);
        self.segments.release(head);

        if let Some(key) = transfer {
            if let Some(transfer) = self.transfers.get_mut(key) {
                transfer.bytes_transferred += len;
            }
            if last {
                self.finish(key, TxState::Complete);
            }
        }

        if terminating {
            return;
        }
        if self.pending.is_empty() {
            if self.staged == 0 {
                self.handler = None;
            }
        } else {
            self.start_head(regs);
        }
    }

    fn complete_cyclic(&mut self, regs: &impl RegisterFile, terminating: bool) {
        let Some(&head) = self.pending.front() else {
            tracing::warn!(channel = self.id, "completion with nothing pending");
            return;
        };
        let Some(segment) = self.segments.get(head) else {
            return;
        };
        let (len, transfer) = (segment.len, segment.transfer);
        if let Some(key) = transfer {
            if let Some(transfer) = self.transfers.get_mut(key) {
                transfer.bytes_transferred += len;
            }
            self.notify(key);
        }

        if self.pending.len() == 1 {
            // a single period is reloaded by the hardware itself
            return;
        }

        // requeue the retired period for its next lap
        self.pending.rotate_left(1);
        if let Some(segment) = self.segments.get_mut(head) {
            segment.configured = false;
            segment.skipped = false;
        }
        self.continue_cyclic(regs, terminating);
    }

    /// After a period retires, the hardware is running the new head. Loads
    /// the period after it into the next-transfer slot so it never runs
    /// dry.
    fn continue_cyclic(&mut self, regs: &impl RegisterFile, terminating: bool) {
        let Some(&head) = self.pending.front() else {
            return;
        };
        let (configured, skipped) = match self.segments.get(head) {
            Some(segment) => (segment.configured, segment.skipped),
            None => return,
        };

        if !configured && !skipped {
            tracing::error!(
                channel = self.id,
                "cyclic transfer ran past its programmed periods, aborting"
            );
            self.stop(regs);
            self.abort_all();
            return;
        }
        if terminating {
            return;
        }

        // a skipped head counts as in flight: the hardware reran the
        // previous period in its place
        if skipped {
            tracing::debug!(channel = self.id, "head period was skipped");
        }
        if let Some(&next) = self.pending.get(1) {
            self.configure_next(regs, next);
        }
    }

    /// Attaches a decoded hardware error to the transfer the hardware is
    /// working on.
    fn record_fault(&mut self, fault: HardwareError) {
        let transfer = self
            .pending
            .front()
            .and_then(|&head| self.segments.get(head))
            .and_then(|segment| segment.transfer);
        match transfer.and_then(|key| self.transfers.get_mut(key)) {
            Some(transfer) => {
                transfer.fault = Some(fault);
                transfer.state = TxState::Error;
            }
            None => tracing::warn!(channel = self.id, %fault, "error with nothing pending"),
        }
    }

    /// Pops the next transfer owed callbacks.
    fn take_callback(&mut self) -> Option<(Key, Callback, u32, Completion)> {
        loop {
            let key = self.cb_list.pop_front()?;
            let Some(transfer) = self.transfers.get_mut(key) else {
                continue;
            };
            let count = core::mem::take(&mut transfer.cb_count);
            match &transfer.callback {
                Some(callback) if count > 0 => {
                    return Some((key, callback.clone(), count, transfer.completion()));
                }
                _ => continue,
            }
        }
    }

    pub(super) fn after_dispatch(&mut self, key: Key) {
        let done = self
            .transfers
            .get(key)
            .map_or(false, |t| t.stage == Stage::Done && t.cb_count == 0);
        if done {
            self.retire(key);
        }
    }
}
