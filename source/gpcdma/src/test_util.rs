//! A simulated channel register file and platform for tests.
use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use embedded_hal::blocking::delay::DelayUs;

use crate::{
    channel::Channel,
    config::PlatformConfig,
    engine::Platform,
    error::DmaError,
    regs::{Csr, Reg, RegisterFile, Status},
};

/// One channel's worth of simulated hardware.
///
/// Models just enough of the channel for the scheduler: enabling latches
/// the programmed addresses, writing a new programming to a running channel
/// fills the next-transfer slot, and [`complete`](Self::complete) retires
/// whatever is running.
#[derive(Clone, Default)]
pub(crate) struct SimChannel(Arc<Mutex<Sim>>);

/// What the hardware was told to run.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct Programmed {
    pub(crate) src: u32,
    pub(crate) dst: u32,
    pub(crate) wcount: u32,
    pub(crate) csr: u32,
}

#[derive(Default)]
struct Sim {
    regs: [u32; 16],
    running: Option<Programmed>,
    next: Option<Programmed>,
    /// Address or length registers written since the last enable.
    dirty: bool,
    eoc: bool,
    active: bool,
    complete_on_start: bool,
    remaining: u32,
    err: u32,
    started: Vec<Programmed>,
    loaded: Vec<Programmed>,
}

/// A delay that returns immediately, counting the time it was asked to
/// wait.
#[derive(Clone, Default)]
pub(crate) struct NoDelay {
    waited: Arc<AtomicU32>,
    on_delay: Option<Arc<dyn Fn() + Send + Sync>>,
}

/// The test host has no interrupts to mask. Channels still exclude each
/// other through their own locks.
struct HostCriticalSection;
critical_section::set_impl!(HostCriticalSection);

unsafe impl critical_section::Impl for HostCriticalSection {
    unsafe fn acquire() -> critical_section::RawRestoreState {}

    unsafe fn release(_: critical_section::RawRestoreState) {}
}

pub(crate) struct SimPlatform {
    sims: Vec<SimChannel>,
    offsets: Vec<usize>,
    irqs: Vec<u32>,
    reset: bool,
    fail_irq: Option<u32>,
}

pub(crate) type TestChannel = Channel<SimChannel, NoDelay>;

pub(crate) fn trace_init() {
    use tracing_subscriber::{
        filter::{EnvFilter, LevelFilter},
        prelude::*,
    };
    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let builder = EnvFilter::builder().with_default_directive(LevelFilter::INFO.into());
    let filter = if env.is_empty() {
        builder.parse("gpcdma=debug").unwrap()
    } else {
        builder.parse_lossy(env)
    };

    let _res = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .with_thread_names(true)
        .without_time()
        .finish()
        .try_init();
}

/// A standalone channel 0 with default platform settings.
pub(crate) fn test_channel() -> (TestChannel, SimChannel, NoDelay) {
    test_channel_with(PlatformConfig::new())
}

pub(crate) fn test_channel_with(config: PlatformConfig) -> (TestChannel, SimChannel, NoDelay) {
    trace_init();
    let sim = SimChannel::default();
    let delay = NoDelay::default();
    let channel = Channel::new(0, sim.clone(), delay.clone(), &config);
    (channel, sim, delay)
}

// === impl SimChannel ===

impl SimChannel {
    fn lock(&self) -> MutexGuard<'_, Sim> {
        self.0.lock().unwrap()
    }

    /// The running segment retires and raises end of chain.
    pub(crate) fn complete(&self) {
        assert!(self.try_complete(), "completed a channel that is not running");
    }

    /// Like [`complete`](Self::complete), but returns `false` if the channel
    /// is not running.
    pub(crate) fn try_complete(&self) -> bool {
        let mut sim = self.lock();
        let Some(running) = sim.running else {
            return false;
        };
        sim.eoc = true;
        if Csr::from_bits(running.csr).get(Csr::ONCE) {
            sim.running = None;
            sim.remaining = 0;
            let csr = Csr::from_bits(sim.regs[reg_index(Reg::Csr)]).with(Csr::ENB, false);
            sim.regs[reg_index(Reg::Csr)] = csr.bits();
            return true;
        }
        let next = sim.next.take().unwrap_or(running);
        sim.remaining = next.wcount + 1;
        sim.running = Some(next);
        true
    }

    /// Latches end of chain without anything retiring.
    pub(crate) fn set_eoc(&self) {
        self.lock().eoc = true;
    }

    /// Latches end of chain as soon as the channel is next enabled.
    pub(crate) fn complete_on_start(&self) {
        self.lock().complete_on_start = true;
    }

    pub(crate) fn raise_error(&self, err_status: u32) {
        self.lock().err = err_status;
    }

    /// Holds the transmit activity bit, so a burst never drains.
    pub(crate) fn set_active(&self, active: bool) {
        self.lock().active = active;
    }

    pub(crate) fn set_remaining(&self, words: u32) {
        self.lock().remaining = words;
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.lock().running.is_some()
    }

    pub(crate) fn eoc_pending(&self) -> bool {
        self.lock().eoc
    }

    /// Every programming the channel was enabled with from idle.
    pub(crate) fn started(&self) -> Vec<Programmed> {
        self.lock().started.clone()
    }

    /// Every programming written to the next-transfer slot of a running
    /// channel.
    pub(crate) fn loaded(&self) -> Vec<Programmed> {
        self.lock().loaded.clone()
    }

    pub(crate) fn reg(&self, reg: Reg) -> u32 {
        self.lock().regs[reg_index(reg)]
    }
}

impl RegisterFile for SimChannel {
    fn read(&self, reg: Reg) -> u32 {
        let sim = self.lock();
        match reg {
            Reg::Status => Status::new()
                .with(Status::BUSY, sim.running.is_some())
                .with(Status::ISE_EOC, sim.eoc)
                .with(Status::CHANNEL_TX, sim.active)
                .bits(),
            Reg::XferCount => sim.remaining,
            Reg::ErrStatus => sim.err,
            reg => sim.regs[reg_index(reg)],
        }
    }

    fn write(&self, reg: Reg, value: u32) {
        let mut sim = self.lock();
        match reg {
            Reg::Status => {
                if Status::from_bits(value).get(Status::ISE_EOC) {
                    sim.eoc = false;
                }
            }
            Reg::ErrStatus => sim.err = 0,
            Reg::SrcPtr | Reg::DstPtr | Reg::HighAddrPtr | Reg::Wcount => {
                sim.regs[reg_index(reg)] = value;
                sim.dirty = true;
            }
            Reg::Csr => {
                sim.regs[reg_index(reg)] = value;
                if !Csr::from_bits(value).get(Csr::ENB) {
                    sim.running = None;
                    sim.next = None;
                    return;
                }
                let programmed = Programmed {
                    src: sim.regs[reg_index(Reg::SrcPtr)],
                    dst: sim.regs[reg_index(Reg::DstPtr)],
                    wcount: sim.regs[reg_index(Reg::Wcount)],
                    csr: value,
                };
                if sim.running.is_none() {
                    sim.running = Some(programmed);
                    sim.remaining = programmed.wcount + 1;
                    sim.started.push(programmed);
                    sim.dirty = false;
                    if core::mem::take(&mut sim.complete_on_start) {
                        sim.eoc = true;
                    }
                } else if sim.dirty {
                    sim.next = Some(programmed);
                    sim.loaded.push(programmed);
                    sim.dirty = false;
                }
            }
            reg => sim.regs[reg_index(reg)] = value,
        }
    }
}

fn reg_index(reg: Reg) -> usize {
    reg.offset() / 4
}

// === impl NoDelay ===

impl NoDelay {
    /// Runs `f` every time the delay is asked to wait.
    pub(crate) fn with_hook(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            waited: Arc::default(),
            on_delay: Some(Arc::new(f)),
        }
    }

    /// Total microseconds waited so far.
    pub(crate) fn waited(&self) -> u32 {
        self.waited.load(Ordering::Relaxed)
    }
}

impl DelayUs<u32> for NoDelay {
    fn delay_us(&mut self, us: u32) {
        self.waited.fetch_add(us, Ordering::Relaxed);
        if let Some(hook) = &self.on_delay {
            hook();
        }
    }
}

impl fmt::Debug for NoDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NoDelay")
            .field("waited", &self.waited())
            .field("hooked", &self.on_delay.is_some())
            .finish()
    }
}

// === impl SimPlatform ===

impl SimPlatform {
    pub(crate) fn new() -> Self {
        Self {
            sims: Vec::new(),
            offsets: Vec::new(),
            irqs: Vec::new(),
            reset: false,
            fail_irq: None,
        }
    }

    /// Makes requesting interrupt `line` fail.
    pub(crate) fn fail_irq(self, line: u32) -> Self {
        Self {
            fail_irq: Some(line),
            ..self
        }
    }

    pub(crate) fn sim(&self, index: usize) -> SimChannel {
        self.sims[index].clone()
    }

    pub(crate) fn irqs(&self) -> Vec<u32> {
        self.irqs.clone()
    }

    pub(crate) fn offsets(&self) -> Vec<usize> {
        self.offsets.clone()
    }

    pub(crate) fn was_reset(&self) -> bool {
        self.reset
    }
}

impl Platform for SimPlatform {
    type Regs = SimChannel;
    type Delay = NoDelay;

    fn reset_controller(&mut self) -> Result<(), DmaError> {
        self.reset = true;
        Ok(())
    }

    fn channel_registers(&mut self, _index: u8, offset: usize) -> Result<SimChannel, DmaError> {
        let sim = SimChannel::default();
        self.sims.push(sim.clone());
        self.offsets.push(offset);
        Ok(sim)
    }

    fn channel_delay(&mut self, _index: u8) -> Result<NoDelay, DmaError> {
        Ok(NoDelay::default())
    }

    fn request_irq(&mut self, line: u32, _channel: u8) -> Result<(), DmaError> {
        if self.fail_irq == Some(line) {
            return Err(DmaError::Platform("irq unavailable"));
        }
        self.irqs.push(line);
        Ok(())
    }

    fn free_irq(&mut self, line: u32, _channel: u8) {
        self.irqs.retain(|&l| l != line);
    }
}
