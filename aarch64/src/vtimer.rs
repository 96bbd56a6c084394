// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The guest virtual timer (CNTV_*) while the vCPU is idle.
//!
//! A running guest uses the hardware virtual timer and its expiry arrives as a physical PPI exit.
//! When the vCPU waits for an interrupt the VMM arms a host one-shot timer for the remaining
//! ticks instead and synthesizes the expiry itself.

use std::time::Duration;

use base::debug;
use base::trace;
use base::TimerTrait;
use devices::irqchip::IrqHandler;
use devices::irqchip::VIRTUAL_TIMER_PPI;
use devices::Vgic;
use hypervisor::TimerRegisters;

use crate::Error;
use crate::Result;

pub const TIMER_CTL_ENABLE: u64 = 1 << 0;
pub const TIMER_CTL_IMASK: u64 = 1 << 1;
pub const TIMER_CTL_ISTATUS: u64 = 1 << 2;

pub struct VirtualTimer {
    timer: Box<dyn TimerTrait>,
    ticks_per_ms: u64,
    /// Guest count at the time the host timer was armed.
    armed_at: Option<u64>,
}

impl VirtualTimer {
    /// Creates the timer for a counter running at `frequency_hz` and registers it as the handler
    /// of the virtual timer PPI.
    pub fn new(timer: Box<dyn TimerTrait>, frequency_hz: u64, gic: &mut Vgic) -> Result<Self> {
        let ticks_per_ms = frequency_hz / 1000;
        if ticks_per_ms == 0 {
            return Err(Error::TimerFrequency(frequency_hz));
        }
        gic.register_handler(VIRTUAL_TIMER_PPI, IrqHandler::VirtualTimer);
        Ok(VirtualTimer {
            timer,
            ticks_per_ms,
            armed_at: None,
        })
    }

    pub fn ticks_per_ms(&self) -> u64 {
        self.ticks_per_ms
    }

    pub fn ticks_to_us(&self, ticks: u64) -> u64 {
        ticks / self.ticks_per_ms * 1000
    }

    pub fn us_to_ticks(&self, us: u64) -> u64 {
        us / 1000 * self.ticks_per_ms
    }

    /// The guest count the pending host timeout was armed at.
    pub fn armed_at(&self) -> Option<u64> {
        self.armed_at
    }

    fn raise(regs: &mut TimerRegisters, gic: &mut Vgic) {
        if regs.control & TIMER_CTL_ENABLE == 0 {
            return;
        }
        regs.control |= TIMER_CTL_ISTATUS;
        if regs.control & TIMER_CTL_IMASK == 0 {
            gic.assert(VIRTUAL_TIMER_PPI);
        }
    }

    /// Arms the host timer for the ticks left until the guest compare value.
    ///
    /// A condition that is already met raises the interrupt right away instead.
    pub fn schedule_timeout(&mut self, regs: &mut TimerRegisters, gic: &mut Vgic) -> Result<()> {
        if regs.control & TIMER_CTL_ISTATUS != 0 {
            if regs.control & TIMER_CTL_IMASK == 0 {
                gic.assert(VIRTUAL_TIMER_PPI);
            }
            return Ok(());
        }
        if regs.control & TIMER_CTL_ENABLE == 0 {
            return Ok(());
        }
        let ticks = regs.compare.saturating_sub(regs.count);
        let usecs = self.ticks_to_us(ticks);
        trace!("vtimer: {} ticks left, arming for {}us", ticks, usecs);
        self.timer
            .reset_oneshot(Duration::from_micros(usecs))
            .map_err(Error::Timer)?;
        self.armed_at = Some(regs.count);
        Ok(())
    }

    /// Disarms the host timer. Nothing changes for the guest.
    pub fn cancel_timeout(&mut self) -> Result<()> {
        self.armed_at = None;
        self.timer.clear().map_err(Error::Timer)
    }

    /// Handles an expiry of the host timer. Returns false if the expiry was stale because the
    /// timer was re-armed or cancelled after it fired.
    pub fn handle_timeout(&mut self, regs: &mut TimerRegisters, gic: &mut Vgic) -> Result<bool> {
        let adjusted = self.timer.mark_waited().map_err(Error::Timer)?;
        if adjusted || self.armed_at.take().is_none() {
            debug!("vtimer: ignoring stale expiry");
            return Ok(false);
        }
        regs.count = regs.compare.wrapping_add(1);
        Self::raise(regs, gic);
        Ok(true)
    }

    /// The hardware virtual timer fired while the guest was running.
    pub fn handle_irq(&mut self, regs: &mut TimerRegisters, gic: &mut Vgic) {
        Self::raise(regs, gic);
    }

    /// The guest completed the timer interrupt.
    pub fn eoi(&mut self, regs: &mut TimerRegisters) {
        regs.control &= !TIMER_CTL_ISTATUS;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use base::FakeClock;
    use base::FakeTimer;
    use devices::irqchip::IrqState;
    use sync::Mutex;

    use super::*;

    const FREQUENCY_HZ: u64 = 62_500_000;
    const TICKS_PER_MS: u64 = 62_500;

    struct Fixture {
        clock: Arc<Mutex<FakeClock>>,
        expiries: Arc<AtomicUsize>,
        gic: Vgic,
        vtimer: VirtualTimer,
        regs: TimerRegisters,
    }

    impl Fixture {
        fn new() -> Fixture {
            let clock = Arc::new(Mutex::new(FakeClock::new()));
            let expiries = Arc::new(AtomicUsize::new(0));
            let cb_expiries = expiries.clone();
            let timer = FakeTimer::new(
                clock.clone(),
                Arc::new(move || {
                    cb_expiries.fetch_add(1, Ordering::SeqCst);
                }),
            );
            let mut gic = Vgic::new();
            gic.enable(VIRTUAL_TIMER_PPI);
            let vtimer = VirtualTimer::new(Box::new(timer), FREQUENCY_HZ, &mut gic).unwrap();
            Fixture {
                clock,
                expiries,
                gic,
                vtimer,
                regs: TimerRegisters {
                    frequency: FREQUENCY_HZ,
                    ..Default::default()
                },
            }
        }

        fn advance_ms(&self, ms: u64) {
            self.clock.lock().add_ns(ms * 1_000_000);
        }

        fn timer_state(&self) -> IrqState {
            self.gic.irq(VIRTUAL_TIMER_PPI).unwrap().state()
        }
    }

    #[test]
    fn conversions_truncate() {
        let f = Fixture::new();
        assert_eq!(f.vtimer.ticks_per_ms(), TICKS_PER_MS);
        assert_eq!(f.vtimer.ticks_to_us(TICKS_PER_MS * 3), 3000);
        assert_eq!(f.vtimer.ticks_to_us(TICKS_PER_MS - 1), 0);
        assert_eq!(f.vtimer.us_to_ticks(2999), 2 * TICKS_PER_MS);
    }

    #[test]
    fn low_frequency_is_rejected() {
        let clock = Arc::new(Mutex::new(FakeClock::new()));
        let timer = FakeTimer::new(clock, Arc::new(|| {}));
        assert!(matches!(
            VirtualTimer::new(Box::new(timer), 999, &mut Vgic::new()),
            Err(Error::TimerFrequency(999))
        ));
    }

    #[test]
    fn round_trip() {
        let mut f = Fixture::new();
        f.regs.count = 1000;
        f.regs.compare = 1000 + 5 * TICKS_PER_MS;
        f.regs.control = TIMER_CTL_ENABLE;
        f.vtimer.schedule_timeout(&mut f.regs, &mut f.gic).unwrap();
        assert_eq!(f.vtimer.armed_at(), Some(1000));

        f.advance_ms(4);
        assert_eq!(f.expiries.load(Ordering::SeqCst), 0);
        f.advance_ms(1);
        assert_eq!(f.expiries.load(Ordering::SeqCst), 1);

        assert!(f.vtimer.handle_timeout(&mut f.regs, &mut f.gic).unwrap());
        assert_eq!(f.regs.count, f.regs.compare + 1);
        assert_ne!(f.regs.control & TIMER_CTL_ISTATUS, 0);
        assert_eq!(f.timer_state(), IrqState::Pending);
        assert_eq!(f.gic.pending_irqs(), vec![VIRTUAL_TIMER_PPI]);

        // Exactly one expiry.
        f.advance_ms(100);
        assert_eq!(f.expiries.load(Ordering::SeqCst), 1);

        f.vtimer.eoi(&mut f.regs);
        assert_eq!(f.regs.control & TIMER_CTL_ISTATUS, 0);
    }

    #[test]
    fn masked_expiry_sets_status_only() {
        let mut f = Fixture::new();
        f.regs.compare = TICKS_PER_MS;
        f.regs.control = TIMER_CTL_ENABLE | TIMER_CTL_IMASK;
        f.vtimer.schedule_timeout(&mut f.regs, &mut f.gic).unwrap();
        f.advance_ms(1);
        assert!(f.vtimer.handle_timeout(&mut f.regs, &mut f.gic).unwrap());
        assert_ne!(f.regs.control & TIMER_CTL_ISTATUS, 0);
        assert_eq!(f.timer_state(), IrqState::Inactive);
    }

    #[test]
    fn cancelled_expiry_is_stale() {
        let mut f = Fixture::new();
        f.regs.compare = TICKS_PER_MS;
        f.regs.control = TIMER_CTL_ENABLE;
        f.vtimer.schedule_timeout(&mut f.regs, &mut f.gic).unwrap();
        f.advance_ms(1);
        f.vtimer.cancel_timeout().unwrap();
        assert!(!f.vtimer.handle_timeout(&mut f.regs, &mut f.gic).unwrap());
        assert_eq!(f.regs.count, 0);
        assert_eq!(f.timer_state(), IrqState::Inactive);
        // Cancelling again is harmless.
        f.vtimer.cancel_timeout().unwrap();
    }

    #[test]
    fn rearmed_expiry_is_stale() {
        let mut f = Fixture::new();
        f.regs.compare = TICKS_PER_MS;
        f.regs.control = TIMER_CTL_ENABLE;
        f.vtimer.schedule_timeout(&mut f.regs, &mut f.gic).unwrap();
        f.advance_ms(1);
        f.regs.compare = 10 * TICKS_PER_MS;
        f.vtimer.schedule_timeout(&mut f.regs, &mut f.gic).unwrap();
        assert!(!f.vtimer.handle_timeout(&mut f.regs, &mut f.gic).unwrap());
    }

    #[test]
    fn pending_condition_raises_immediately() {
        let mut f = Fixture::new();
        f.regs.control = TIMER_CTL_ENABLE | TIMER_CTL_ISTATUS;
        f.vtimer.schedule_timeout(&mut f.regs, &mut f.gic).unwrap();
        assert_eq!(f.vtimer.armed_at(), None);
        assert_eq!(f.timer_state(), IrqState::Pending);
    }

    #[test]
    fn disabled_timer_is_not_armed() {
        let mut f = Fixture::new();
        f.regs.compare = TICKS_PER_MS;
        f.vtimer.schedule_timeout(&mut f.regs, &mut f.gic).unwrap();
        assert_eq!(f.vtimer.armed_at(), None);
        assert_eq!(f.clock.lock().pending_deadlines(), 0);
    }

    #[test]
    fn hardware_expiry() {
        let mut f = Fixture::new();
        f.regs.control = TIMER_CTL_ENABLE;
        f.vtimer.handle_irq(&mut f.regs, &mut f.gic);
        assert_eq!(f.timer_state(), IrqState::Pending);
        assert_ne!(f.regs.control & TIMER_CTL_ISTATUS, 0);
    }
}
