//! Controller bring-up, channel claiming, and interrupt routing.
use alloc::vec::Vec;
use core::{fmt, ops::Deref};

use embedded_hal::blocking::delay::DelayUs;
use portable_atomic::{AtomicU64, Ordering::*};

use crate::{
    channel::{Channel, IrqReturn, Terminated},
    config::PlatformConfig,
    error::DmaError,
    regs::RegisterFile,
};

/// Services the engine needs from the platform it runs on.
///
/// Implemented once per SoC integration. Everything here is called only
/// while the engine is being brought up or torn down.
pub trait Platform {
    /// Register access for one channel.
    type Regs: RegisterFile;
    /// Busy-wait delay used by one channel.
    type Delay: DelayUs<u32>;

    /// Pulses the controller's reset line.
    fn reset_controller(&mut self) -> Result<(), DmaError>;

    /// Maps the register block of channel `index`, `offset` bytes from the
    /// controller base.
    fn channel_registers(&mut self, index: u8, offset: usize) -> Result<Self::Regs, DmaError>;

    fn channel_delay(&mut self, index: u8) -> Result<Self::Delay, DmaError>;

    /// Routes interrupt `line` to [`Engine::handle_interrupt`].
    fn request_irq(&mut self, line: u32, channel: u8) -> Result<(), DmaError>;

    fn free_irq(&mut self, line: u32, channel: u8);
}

/// The whole controller: every channel, plus the pool clients claim them
/// from.
pub struct Engine<R, D> {
    channels: Vec<Channel<R, D>>,
    /// One bit per channel. Set bits are claimed; bits past the last channel
    /// are always set.
    claims: AtomicU64,
    config: PlatformConfig,
}

/// A channel claimed by a client.
///
/// Dropping it frees the channel's resources and returns it to the
/// engine's pool.
pub struct ClaimedChannel<'engine, R, D>
where
    R: RegisterFile,
    D: DelayUs<u32>,
{
    engine: &'engine Engine<R, D>,
    index: u8,
}

// === impl Engine ===

impl<R, D> Engine<R, D>
where
    R: RegisterFile,
    D: DelayUs<u32>,
{
    /// Brings up the controller and every channel.
    ///
    /// On failure, interrupts already requested are released again before
    /// the error is returned.
    #[tracing::instrument(level = "info", name = "Engine::new", skip_all)]
    pub fn new<P>(config: PlatformConfig, platform: &mut P) -> Result<Self, DmaError>
    where
        P: Platform<Regs = R, Delay = D>,
    {
        config.validate()?;
        platform.reset_controller()?;

        let count = config.channel_count;
        let mut channels = Vec::new();
        if channels.try_reserve_exact(usize::from(count)).is_err() {
            return Err(DmaError::Platform("could not allocate channels"));
        }

        for index in 0..count {
            match Self::bring_up(&config, platform, index) {
                Ok(channel) => channels.push(channel),
                Err(error) => {
                    tracing::error!(channel = index, %error, "channel bring-up failed");
                    for channel in &channels {
                        platform.free_irq(config.irq_line(channel.id()), channel.id());
                    }
                    return Err(error);
                }
            }
        }

        tracing::info!(
            channels = count,
            stream_id = config.stream_id,
            max_transfer_count = config.max_transfer_count,
            "GPC-DMA engine up"
        );
        Ok(Self {
            channels,
            claims: AtomicU64::new(Self::unused_bits(count)),
            config,
        })
    }

    fn bring_up<P>(
        config: &PlatformConfig,
        platform: &mut P,
        index: u8,
    ) -> Result<Channel<R, D>, DmaError>
    where
        P: Platform<Regs = R, Delay = D>,
    {
        let regs = platform.channel_registers(index, config.channel_offset(index))?;
        let delay = platform.channel_delay(index)?;
        platform.request_irq(config.irq_line(index), index)?;
        tracing::debug!(
            channel = index,
            offset = &format_args!("{:#x}", config.channel_offset(index)),
            irq = config.irq_line(index),
            "channel up"
        );
        Ok(Channel::new(index, regs, delay, config))
    }

    /// Stops every channel and releases its interrupt.
    ///
    /// Callbacks still owed are dropped without being invoked.
    #[tracing::instrument(level = "info", name = "Engine::teardown", skip_all)]
    pub fn teardown<P>(self, platform: &mut P)
    where
        P: Platform<Regs = R, Delay = D>,
    {
        for channel in &self.channels {
            channel.free_resources();
            platform.free_irq(self.config.irq_line(channel.id()), channel.id());
        }
        tracing::info!(channels = self.channels.len(), "GPC-DMA engine down");
    }

    #[must_use]
    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    #[must_use]
    pub fn channel(&self, index: u8) -> Option<&Channel<R, D>> {
        self.channels.get(usize::from(index))
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel<R, D>> + '_ {
        self.channels.iter()
    }

    /// Claims the lowest-numbered free channel, or returns `None` if every
    /// channel is in use.
    ///
    /// If `peripheral` is given, the channel is bound to that request line
    /// for slave transfers.
    pub fn try_claim_channel(&self, peripheral: Option<u8>) -> Option<ClaimedChannel<'_, R, D>> {
        let index = self.allocate()?;
        let claimed = ClaimedChannel {
            engine: self,
            index,
        };
        if let Err(error) = claimed.allocate_resources() {
            tracing::warn!(channel = index, %error, "could not allocate channel resources");
            // dropping `claimed` returns the channel
            return None;
        }
        claimed.bind_peripheral(peripheral);
        tracing::debug!(channel = index, ?peripheral, "claimed channel");
        Some(claimed)
    }

    /// Claims channel `index` specifically.
    ///
    /// Fails with [`DmaError::NoChannel`] if the controller has no such
    /// channel or it is already claimed.
    pub fn claim_channel(
        &self,
        index: u8,
        peripheral: Option<u8>,
    ) -> Result<ClaimedChannel<'_, R, D>, DmaError> {
        if index >= self.config.channel_count {
            return Err(DmaError::NoChannel);
        }
        let bit = 1 << index;
        if (self.claims.fetch_or(bit, AcqRel) & bit) != 0 {
            return Err(DmaError::NoChannel);
        }
        let claimed = ClaimedChannel {
            engine: self,
            index,
        };
        claimed.allocate_resources()?;
        claimed.bind_peripheral(peripheral);
        tracing::debug!(channel = index, ?peripheral, "claimed channel");
        Ok(claimed)
    }

    /// Routes interrupt `line` to its channel.
    ///
    /// Returns [`IrqReturn::None`] for a line no channel is wired to.
    pub fn handle_interrupt(&self, line: u32) -> IrqReturn {
        match self.channel_for_line(line) {
            Some(channel) => channel.handle_interrupt(),
            None => {
                tracing::warn!(line, "interrupt on unknown line");
                IrqReturn::None
            }
        }
    }

    /// Runs the completion callbacks queued by interrupt `line`.
    pub fn dispatch(&self, line: u32) -> usize {
        self.channel_for_line(line)
            .map_or(0, Channel::dispatch_completions)
    }

    /// Terminates every channel.
    pub fn terminate_all(&self) -> Vec<Terminated> {
        self.channels.iter().map(Channel::terminate).collect()
    }

    /// Number of channels currently claimed.
    #[must_use]
    pub fn claimed(&self) -> usize {
        let unused = Self::unused_bits(self.config.channel_count);
        (self.claims.load(Acquire) & !unused).count_ones() as usize
    }

    fn channel_for_line(&self, line: u32) -> Option<&Channel<R, D>> {
        let index = line.checked_sub(u32::from(self.config.start_channel_index))?;
        self.channels.get(usize::try_from(index).ok()?)
    }

    fn allocate(&self) -> Option<u8> {
        let mut bitmap = self.claims.load(Acquire);
        loop {
            let index = (!bitmap).trailing_zeros();
            if index >= u64::BITS {
                return None;
            }
            match self
                .claims
                .compare_exchange_weak(bitmap, bitmap | (1 << index), AcqRel, Acquire)
            {
                Ok(_) => return Some(index as u8),
                Err(actual) => bitmap = actual,
            }
        }
    }

    fn free(&self, index: u8) {
        self.claims.fetch_and(!(1 << index), Release);
    }

    /// Bits for channel indices the controller does not have.
    const fn unused_bits(count: u8) -> u64 {
        if count as u32 >= u64::BITS {
            0
        } else {
            !((1 << count) - 1)
        }
    }
}

impl<R, D> fmt::Debug for Engine<R, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("channels", &self.channels.len())
            .field("claims", &format_args!("{:#b}", self.claims.load(Acquire)))
            .field("config", &self.config)
            .finish()
    }
}

// === impl ClaimedChannel ===

impl<R, D> Deref for ClaimedChannel<'_, R, D>
where
    R: RegisterFile,
    D: DelayUs<u32>,
{
    type Target = Channel<R, D>;

    fn deref(&self) -> &Self::Target {
        &self.engine.channels[usize::from(self.index)]
    }
}

impl<R, D> Drop for ClaimedChannel<'_, R, D>
where
    R: RegisterFile,
    D: DelayUs<u32>,
{
    fn drop(&mut self) {
        // tear down anything still queued so the channel can be reused
        self.free_resources();
        self.engine.free(self.index);
        tracing::debug!(channel = self.index, "released channel");
    }
}

impl<R, D> fmt::Debug for ClaimedChannel<'_, R, D>
where
    R: RegisterFile,
    D: DelayUs<u32>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ClaimedChannel").field(&self.index).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        descriptor::{PrepFlags, TxState},
        test_util::{trace_init, SimPlatform},
    };

    fn config(channels: u8) -> PlatformConfig {
        PlatformConfig {
            channel_count: channels,
            ..PlatformConfig::new()
        }
    }

    #[test]
    fn brings_up_every_channel() {
        trace_init();
        let mut platform = SimPlatform::new();
        let engine = Engine::new(config(4), &mut platform).unwrap();

        assert_eq!(engine.channels().count(), 4);
        assert_eq!(platform.irqs(), vec![0, 1, 2, 3]);
        assert!(platform.was_reset());
        assert_eq!(
            platform.offsets(),
            vec![0x10000, 0x20000, 0x30000, 0x40000]
        );

        engine.teardown(&mut platform);
        assert!(platform.irqs().is_empty());
    }

    #[test]
    fn failed_bring_up_releases_irqs() {
        trace_init();
        let mut platform = SimPlatform::new().fail_irq(2);
        let err = Engine::new(config(4), &mut platform).unwrap_err();

        assert_eq!(err, DmaError::Platform("irq unavailable"));
        assert!(platform.irqs().is_empty(), "irqs leaked: {:?}", platform.irqs());
    }

    #[test]
    fn rejects_bad_channel_count() {
        trace_init();
        let mut platform = SimPlatform::new();
        assert!(matches!(
            Engine::new(config(0), &mut platform),
            Err(DmaError::Platform(_))
        ));
        assert!(matches!(
            Engine::new(config(65), &mut platform),
            Err(DmaError::Platform(_))
        ));
        assert!(!platform.was_reset());
    }

    #[test]
    fn claims_lowest_free_channel() {
        trace_init();
        let mut platform = SimPlatform::new();
        let engine = Engine::new(config(3), &mut platform).unwrap();

        let a = engine.try_claim_channel(None).unwrap();
        let b = engine.try_claim_channel(None).unwrap();
        let c = engine.try_claim_channel(None).unwrap();
        assert_eq!((a.id(), b.id(), c.id()), (0, 1, 2));
        assert!(engine.try_claim_channel(None).is_none());
        assert_eq!(engine.claimed(), 3);

        drop(b);
        assert_eq!(engine.claimed(), 2);
        let again = engine.try_claim_channel(None).unwrap();
        assert_eq!(again.id(), 1);
    }

    #[test]
    fn claims_specific_channel() {
        trace_init();
        let mut platform = SimPlatform::new();
        let engine = Engine::new(config(4), &mut platform).unwrap();

        let two = engine.claim_channel(2, None).unwrap();
        assert_eq!(two.id(), 2);
        assert_eq!(engine.claim_channel(2, None).unwrap_err(), DmaError::NoChannel);
        assert_eq!(engine.claim_channel(4, None).unwrap_err(), DmaError::NoChannel);

        // the lowest free channel skips the one taken by index
        let a = engine.try_claim_channel(None).unwrap();
        let b = engine.try_claim_channel(None).unwrap();
        let c = engine.try_claim_channel(None).unwrap();
        assert_eq!((a.id(), b.id(), c.id()), (0, 1, 3));
        drop(two);
        assert_eq!(engine.claim_channel(2, None).unwrap().id(), 2);
    }

    #[test]
    fn full_width_controller() {
        trace_init();
        let mut platform = SimPlatform::new();
        let engine = Engine::new(config(64), &mut platform).unwrap();

        let claimed: Vec<_> = (0..64)
            .map(|_| engine.try_claim_channel(None).unwrap())
            .collect();
        assert_eq!(claimed.last().map(|c| c.id()), Some(63));
        assert!(engine.try_claim_channel(None).is_none());
    }

    #[test]
    fn dropping_a_claim_stops_the_channel() {
        trace_init();
        let mut platform = SimPlatform::new();
        let engine = Engine::new(config(2), &mut platform).unwrap();

        let channel = engine.try_claim_channel(None).unwrap();
        let handle = channel
            .prepare_memcpy(0x1000, 0x2000, 64, PrepFlags::interrupt_ack(), None)
            .unwrap();
        let cookie = channel.submit(handle).unwrap();
        channel.issue_pending();
        assert!(platform.sim(0).is_enabled());
        drop(channel);

        assert!(!platform.sim(0).is_enabled());
        let channel = engine.channel(0).unwrap();
        assert_eq!(channel.cookie_status(cookie).state, TxState::Error);
        assert_eq!(channel.pools().transfers.outstanding(), 0);
        assert_eq!(channel.pools().segments.outstanding(), 0);
    }

    #[test]
    fn claimed_channel_is_bound_to_its_peripheral() {
        trace_init();
        let mut platform = SimPlatform::new();
        let engine = Engine::new(config(1), &mut platform).unwrap();

        let channel = engine.try_claim_channel(Some(9)).unwrap();
        channel
            .configure_slave(crate::config::SlaveConfig::to_device(0x3000_0000, 4, 8))
            .unwrap();
        let handle = channel
            .prepare_slave_sg(
                &[crate::descriptor::SgEntry { addr: 0x8000, len: 64 }],
                crate::config::Direction::MemToDev,
                PrepFlags::interrupt_ack(),
                None,
            )
            .unwrap();
        channel.submit(handle).unwrap();
        channel.issue_pending();

        let started = platform.sim(0).started();
        assert_eq!(started.len(), 1);
        assert_eq!(
            crate::regs::Csr::from_bits(started[0].csr).get(crate::regs::Csr::REQ_SEL),
            9
        );
    }

    #[test]
    fn routes_interrupts_by_line() {
        trace_init();
        let mut platform = SimPlatform::new();
        let engine = Engine::new(
            PlatformConfig {
                channel_count: 2,
                start_channel_index: 4,
                ..PlatformConfig::new()
            },
            &mut platform,
        )
        .unwrap();
        assert_eq!(platform.irqs(), vec![4, 5]);

        let channel = engine.try_claim_channel(None).unwrap();
        let handle = channel
            .prepare_memcpy(0x1000, 0x2000, 16, PrepFlags::interrupt_ack(), None)
            .unwrap();
        channel.submit(handle).unwrap();
        channel.issue_pending();
        platform.sim(0).complete();

        assert_eq!(engine.handle_interrupt(5), IrqReturn::None);
        assert_eq!(engine.handle_interrupt(99), IrqReturn::None);
        assert_eq!(engine.handle_interrupt(4), IrqReturn::Handled);
        assert_eq!(engine.dispatch(4), 0);
        assert_eq!(channel.query_status(handle).unwrap().state, TxState::Complete);
    }

    #[test]
    fn terminate_all_disables_everything() {
        trace_init();
        let mut platform = SimPlatform::new();
        let engine = Engine::new(config(2), &mut platform).unwrap();

        let a = engine.try_claim_channel(None).unwrap();
        let b = engine.try_claim_channel(None).unwrap();
        for channel in [&a, &b] {
            let handle = channel
                .prepare_memcpy(0x1000, 0x2000, 32, PrepFlags::interrupt_ack(), None)
                .unwrap();
            channel.submit(handle).unwrap();
            channel.issue_pending();
        }

        let results = engine.terminate_all();
        assert_eq!(results.iter().map(Terminated::aborted).sum::<usize>(), 2);
        assert!(!platform.sim(0).is_enabled());
        assert!(!platform.sim(1).is_enabled());
    }
}
