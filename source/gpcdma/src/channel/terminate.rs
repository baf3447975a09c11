//! Cancelling everything queued on a channel.
use embedded_hal::blocking::delay::DelayUs;

use super::{Channel, State};
use crate::{
    error::DmaError,
    regs::{Csr, Reg, RegisterFile, Status},
};

/// Settling time for an in-flight burst after the request line is parked.
const BURST_COMPLETE_TIME_US: u32 = 20;
/// Upper bound on waiting for the transmit/receive activity bits to clear.
const BURST_COMPLETION_TIMEOUT_US: u32 = 100;
const BURST_POLL_INTERVAL_US: u32 = 5;

/// Outcome of [`Channel::terminate`].
///
/// Termination always finishes and always leaves the hardware disabled.
/// A degraded termination means an in-flight burst did not retire within
/// the bounded wait; the channel registers were dumped to the log.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[must_use]
pub struct Terminated {
    drain_timed_out: bool,
    aborted: usize,
    callbacks_pending: bool,
}

impl Terminated {
    /// Whether the hardware failed to go quiet before being disabled.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.drain_timed_out
    }

    /// Number of transfers forced into the error state.
    #[must_use]
    pub fn aborted(&self) -> usize {
        self.aborted
    }

    /// Converts a degraded termination into [`DmaError::Timeout`], for
    /// callers that treat it as a failure. Otherwise returns the number of
    /// transfers aborted.
    pub fn into_result(self) -> Result<usize, DmaError> {
        if self.drain_timed_out {
            return Err(DmaError::Timeout);
        }
        Ok(self.aborted)
    }

    /// Whether callbacks for the aborted transfers are waiting for
    /// [`Channel::dispatch_completions`].
    #[must_use]
    pub fn needs_dispatch(&self) -> bool {
        self.callbacks_pending
    }
}

impl<R, D> Channel<R, D>
where
    R: RegisterFile,
    D: DelayUs<u32>,
{
    /// Stops the channel and fails every transfer still pending on it.
    ///
    /// The hardware is disabled when this returns. Callbacks for the failed
    /// transfers are queued for [`dispatch_completions`], not invoked here.
    ///
    /// [`dispatch_completions`]: Channel::dispatch_completions
    #[tracing::instrument(level = "debug", skip(self), fields(channel = self.id))]
    pub fn terminate(&self) -> Terminated {
        let terminated = self.with_state(|state, regs| state.terminate(regs, false));
        if terminated.is_degraded() {
            tracing::warn!(channel = self.id, "channel terminated without draining");
        }
        terminated
    }
}

impl<D: DelayUs<u32>> State<D> {
    /// Terminates with the lock held. `discard_callbacks` drops callbacks
    /// still owed, for when the client is going away.
    pub(super) fn terminate(
        &mut self,
        regs: &impl RegisterFile,
        discard_callbacks: bool,
    ) -> Terminated {
        let mut terminated = Terminated::default();

        if !self.pending.is_empty() && self.busy {
            terminated.drain_timed_out = self.drain_burst(regs);

            let mut status = Status::from_bits(regs.read(Reg::Status));
            let mut remaining_words = regs.read(Reg::XferCount);
            if status.get(Status::ISE_EOC) {
                tracing::debug!(channel = self.id, "completion raced with termination");
                self.run_handler(regs, true);
                status = Status::from_bits(regs.read(Reg::Status));
                remaining_words = regs.read(Reg::XferCount);
            }
            tracing::trace!(channel = self.id, %status, remaining_words, "stopping");

            let was_busy = self.busy;
            self.stop(regs);
            if was_busy {
                self.credit_partial_head(remaining_words);
            }
        } else {
            self.stop(regs);
        }

        terminated.aborted = self.abort_all();

        if discard_callbacks {
            while let Some(key) = self.cb_list.pop_front() {
                if let Some(transfer) = self.transfers.get_mut(key) {
                    transfer.cb_count = 0;
                }
                self.after_dispatch(key);
            }
        }
        terminated.callbacks_pending = !self.cb_list.is_empty();
        terminated
    }

    /// Parks the request line on a reserved id so no new burst can start,
    /// then waits a bounded time for the current one to retire. Returns
    /// `true` if it did not.
    fn drain_burst(&mut self, regs: &impl RegisterFile) -> bool {
        let csr = Csr::from_bits(regs.read(Reg::Csr)).with(Csr::REQ_SEL, Csr::REQ_SEL_RESERVED);
        regs.write(Reg::Csr, csr.bits());
        regs.write_barrier();
        self.delay.delay_us(BURST_COMPLETE_TIME_US);

        let mut waited = 0;
        while waited < BURST_COMPLETION_TIMEOUT_US {
            let status = Status::from_bits(regs.read(Reg::Status));
            if !status.get(Status::CHANNEL_TX) && !status.get(Status::CHANNEL_RX) {
                return false;
            }
            self.delay.delay_us(BURST_POLL_INTERVAL_US);
            waited += BURST_POLL_INTERVAL_US;
        }

        tracing::error!(
            channel = self.id,
            timeout_us = BURST_COMPLETION_TIMEOUT_US,
            "timed out waiting for burst completion"
        );
        dump_registers(self.id, regs);
        true
    }

    /// Credits the bytes the hardware moved for the stopped head segment.
    fn credit_partial_head(&mut self, remaining_words: u32) {
        let Some(segment) = self.pending.front().and_then(|&head| self.segments.get(head)) else {
            return;
        };
        let done = segment.len.saturating_sub(remaining_words as usize * 4);
        if let Some(transfer) = segment.transfer.and_then(|key| self.transfers.get_mut(key)) {
            transfer.bytes_transferred += done;
        }
    }
}

fn dump_registers(channel: u8, regs: &impl RegisterFile) {
    for reg in Reg::ALL {
        tracing::error!(
            channel,
            register = ?reg,
            value = &format_args!("{:#010x}", regs.read(reg)),
            "register dump"
        );
    }
}
