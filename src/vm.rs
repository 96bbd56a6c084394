// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The VM object: owns the trap dispatcher, the interrupt controller, the timer and the devices,
//! and runs every host event through the same pause, mutate, re-arbitrate, resume sequence.

use std::io;
use std::sync::mpsc::channel;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::Sender;
use std::sync::mpsc::TryRecvError;
use std::sync::Arc;

use aarch64::Cpu;
use aarch64::DefaultHypercallHandler;
use aarch64::ExitContext;
use aarch64::HypercallHandler;
use aarch64::PowerEvent;
use aarch64::TrapOutcome;
use aarch64::VirtualTimer;
use anyhow::bail;
use anyhow::Context;
use base::debug;
use base::error;
use base::info;
use base::trace;
use base::warn;
use base::Timer;
use base::TimerCallback;
use base::TimerTrait;
use devices::irqchip::IrqHandler;
use devices::irqchip::IrqNotificationKind;
use devices::irqchip::GICD_SIZE;
use devices::virtio::Console;
use devices::virtio::Net;
use devices::virtio::NetBackend;
use devices::virtio::VirtioMmioDevice;
use devices::virtio::VIRTIO_MMIO_REGION_SZ;
use devices::Bus;
use devices::DeviceContext;
use devices::GicDistributor;
use devices::Pl011;
use devices::Vgic;
use devices::PL011_AMBA_IOMEM_SIZE;
use hypervisor::VcpuAArch64;
use sync::Mutex;
use vm_memory::GuestAddress;
use vm_memory::GuestMemory;

use crate::Error;
use crate::Result;
use crate::VmConfig;

// Device handlers may raise new notifications while theirs are delivered. Bounds the rounds.
const MAX_NOTIFICATION_ROUNDS: usize = 16;

/// Work for the VMM thread. Host side producers only ever send these.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VmEvent {
    /// The vCPU stopped and its state snapshot describes the exit.
    VcpuExit,
    /// The host timer armed for the idle vCPU fired.
    TimerExpired,
    /// Keystrokes for the terminal device at `base`.
    TerminalInput { base: u64, data: Vec<u8> },
    /// A received frame for the network device at `base`.
    NetRx { base: u64, data: Vec<u8> },
    /// Stop the VM.
    Shutdown,
}

/// Why the VM stopped running.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExitReason {
    PowerOff,
    /// The guest asked for a reset. Devices are back in their power-on state.
    Reset,
    /// A `VmEvent::Shutdown` was received.
    Shutdown,
}

impl From<PowerEvent> for ExitReason {
    fn from(event: PowerEvent) -> Self {
        match event {
            PowerEvent::Off => ExitReason::PowerOff,
            PowerEvent::Reset => ExitReason::Reset,
        }
    }
}

/// Host side endpoints of the devices.
pub struct VmBackends {
    /// Output of the PL011 UART.
    pub uart: Box<dyn io::Write + Send>,
    /// Output of the virtio console, required when the console is configured.
    pub console: Option<Box<dyn io::Write + Send>>,
    /// Sink of the virtio network device, required when the device is configured.
    pub net: Option<Box<dyn NetBackend>>,
    pub hypercalls: Box<dyn HypercallHandler>,
}

impl Default for VmBackends {
    fn default() -> Self {
        VmBackends {
            uart: Box::new(io::stdout()),
            console: None,
            net: None,
            hypercalls: Box::new(DefaultHypercallHandler),
        }
    }
}

/// A single vCPU virtual machine.
pub struct Vm<V: VcpuAArch64> {
    vcpu: V,
    cpu: Cpu,
    gic: Vgic,
    bus: Bus,
    mem: GuestMemory,
    timer: VirtualTimer,
    hypercalls: Box<dyn HypercallHandler>,
    events_tx: Sender<VmEvent>,
    events_rx: Receiver<VmEvent>,
    // The guest executed WFI and no interrupt was presented since.
    idle: bool,
    in_envelope: bool,
    halted: bool,
    exit: Option<ExitReason>,
}

impl<V: VcpuAArch64> Vm<V> {
    /// Builds the machine described by `config` around `vcpu`.
    ///
    /// `make_timer` creates the host timer of the idle vCPU from the callback that queues
    /// `VmEvent::TimerExpired`.
    pub fn new<F>(
        config: &VmConfig,
        mut vcpu: V,
        make_timer: F,
        backends: VmBackends,
    ) -> anyhow::Result<Vm<V>>
    where
        F: FnOnce(TimerCallback) -> base::Result<Box<dyn TimerTrait>>,
    {
        config.validate().context("invalid vm config")?;

        let mem = GuestMemory::new(&[(GuestAddress(config.mem_base), config.mem_size)])
            .context("failed to create guest memory")?;

        let (events_tx, events_rx) = channel();
        let timer_tx = Mutex::new(events_tx.clone());
        let callback: TimerCallback = Arc::new(move || {
            // Nothing to do if the VM is gone.
            let _ = timer_tx.lock().send(VmEvent::TimerExpired);
        });
        let host_timer = make_timer(callback).context("failed to create the host timer")?;

        let mut gic = Vgic::new();
        let timer = VirtualTimer::new(host_timer, config.timer.frequency_hz, &mut gic)
            .context("failed to create the virtual timer")?;

        let state = vcpu.state_mut();
        let cpu = Cpu::new(state, &config.cpu_id_overrides).context("failed to set up the cpu")?;
        state.timer.frequency = config.timer.frequency_hz;

        let mut bus = Bus::new();
        bus.insert(
            Box::new(GicDistributor::new()),
            config.gic.distributor_base,
            GICD_SIZE,
        )
        .context("failed to add the gic distributor")?;

        bus.insert(
            Box::new(Pl011::new(config.uart.irq, backends.uart)),
            config.uart.base,
            PL011_AMBA_IOMEM_SIZE,
        )
        .context("failed to add the uart")?;
        gic.register_handler(config.uart.irq, IrqHandler::Mmio(config.uart.base));

        if let Some(console_cfg) = &config.console {
            let out = match backends.console {
                Some(out) => out,
                None => bail!("the virtio console is configured without an output"),
            };
            let console = Console::new(out).with_queue_size(console_cfg.queue_size);
            bus.insert(
                Box::new(VirtioMmioDevice::new(Box::new(console), console_cfg.irq)),
                console_cfg.base,
                VIRTIO_MMIO_REGION_SZ,
            )
            .context("failed to add the virtio console")?;
            gic.register_handler(console_cfg.irq, IrqHandler::Mmio(console_cfg.base));
        }

        if let Some(net_cfg) = &config.net {
            let backend = match backends.net {
                Some(backend) => backend,
                None => bail!("the virtio net device is configured without a backend"),
            };
            let net = Net::new(backend, net_cfg.mac.0).with_queue_size(net_cfg.queue_size);
            bus.insert(
                Box::new(VirtioMmioDevice::new(Box::new(net), net_cfg.irq)),
                net_cfg.base,
                VIRTIO_MMIO_REGION_SZ,
            )
            .context("failed to add the virtio net device")?;
            gic.register_handler(net_cfg.irq, IrqHandler::Mmio(net_cfg.base));
        }

        info!(
            "vm: {} MiB of memory at {:#x}, timer at {} Hz",
            mem.memory_size() >> 20,
            config.mem_base,
            config.timer.frequency_hz
        );

        Ok(Vm {
            vcpu,
            cpu,
            gic,
            bus,
            mem,
            timer,
            hypercalls: backends.hypercalls,
            events_tx,
            events_rx,
            idle: false,
            in_envelope: false,
            halted: false,
            exit: None,
        })
    }

    /// Like `new`, with a `base::Timer` worker thread as the host timer.
    pub fn with_host_timer(
        config: &VmConfig,
        vcpu: V,
        backends: VmBackends,
    ) -> anyhow::Result<Vm<V>> {
        Vm::new(
            config,
            vcpu,
            |callback| Ok(Box::new(Timer::new(callback)?) as Box<dyn TimerTrait>),
            backends,
        )
    }

    /// A handle for host side producers to queue events with.
    pub fn event_sender(&self) -> Sender<VmEvent> {
        self.events_tx.clone()
    }

    pub fn vcpu(&self) -> &V {
        &self.vcpu
    }

    pub fn vcpu_mut(&mut self) -> &mut V {
        &mut self.vcpu
    }

    pub fn guest_memory(&self) -> &GuestMemory {
        &self.mem
    }

    /// True while the vCPU waits for an interrupt.
    pub fn is_idle(&self) -> bool {
        self.idle
    }

    /// True once a fatal error stopped the VM.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.exit
    }

    /// Handles the exit the vCPU state currently describes.
    pub fn handle_exit(&mut self) -> Result<()> {
        self.envelope(Self::dispatch_exit)
    }

    /// Handles one host event.
    pub fn handle_event(&mut self, event: VmEvent) -> Result<()> {
        if self.halted {
            return Err(Error::Halted);
        }
        if self.exit.is_some() {
            debug!("vm: dropping {:?} after exit", event);
            return Ok(());
        }
        trace!("vm: event {:?}", event);
        match event {
            VmEvent::VcpuExit => self.handle_exit(),
            VmEvent::TimerExpired => self.envelope(|vm| {
                let state = vm.vcpu.state_mut();
                vm.timer.handle_timeout(&mut state.timer, &mut vm.gic)?;
                Ok(())
            }),
            VmEvent::TerminalInput { base, data } | VmEvent::NetRx { base, data } => {
                self.envelope(|vm| {
                    let mut ctx = DeviceContext {
                        gic: &mut vm.gic,
                        mem: &vm.mem,
                    };
                    if let Err(e) = vm.bus.backend_input(&mut ctx, base, &data) {
                        warn!("vm: dropping input for device at {:#x}: {}", base, e);
                    }
                    Ok(())
                })
            }
            VmEvent::Shutdown => {
                info!("vm: shutdown requested");
                if self.vcpu.is_running() {
                    self.vcpu.pause().map_err(Error::PauseVcpu)?;
                }
                self.timer.cancel_timeout()?;
                self.exit = Some(ExitReason::Shutdown);
                Ok(())
            }
        }
    }

    /// Handles every queued event without blocking.
    pub fn process_pending_events(&mut self) -> Result<()> {
        while self.exit.is_none() {
            match self.events_rx.try_recv() {
                Ok(event) => self.handle_event(event)?,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Err(Error::EventChannelClosed),
            }
        }
        Ok(())
    }

    /// Starts the guest and handles events until it powers off, a shutdown is requested or a
    /// fatal error occurs.
    pub fn run_until_halt(&mut self) -> Result<ExitReason> {
        self.envelope(|_| Ok(()))?;
        loop {
            if let Some(reason) = self.exit {
                info!("vm: exited: {:?}", reason);
                return Ok(reason);
            }
            let event = self
                .events_rx
                .recv()
                .map_err(|_| Error::EventChannelClosed)?;
            self.handle_event(event)?;
        }
    }

    fn dispatch_exit(&mut self) -> Result<()> {
        let state = self.vcpu.state_mut();
        let mut ctx = ExitContext {
            gic: &mut self.gic,
            bus: &mut self.bus,
            mem: &self.mem,
            timer: &mut self.timer,
            hypercalls: self.hypercalls.as_mut(),
        };
        match self.cpu.handle_exit(state, &mut ctx)? {
            TrapOutcome::Resume => {}
            TrapOutcome::Idle => self.idle = true,
            TrapOutcome::Shutdown(event) => {
                self.timer.cancel_timeout()?;
                if event == PowerEvent::Reset {
                    // Back to power-on register state for whoever restarts the guest.
                    self.bus.reset_devices();
                }
                self.exit = Some(event.into());
            }
        }
        Ok(())
    }

    // Runs `f` with the vCPU stopped, then delivers interrupt notifications, re-arbitrates and
    // resumes the guest unless it is idle without a presented interrupt.
    fn envelope<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        if self.in_envelope {
            warn!("vm: nested event handling rejected");
            return Ok(());
        }
        self.in_envelope = true;
        let result = self.envelope_inner(f);
        self.in_envelope = false;
        result.map_err(|e| self.fail(e))
    }

    fn envelope_inner<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        if self.vcpu.is_running() {
            self.vcpu.pause().map_err(Error::PauseVcpu)?;
        }
        f(self)?;
        if self.exit.is_some() {
            return Ok(());
        }
        self.deliver_notifications();

        let presented = self.gic.pending_irq();
        self.vcpu.state_mut().irqs.virtual_irq = self.gic.presented();
        if let Some(irq) = presented {
            trace!("vm: presenting irq {}", irq);
            if self.idle {
                self.idle = false;
                self.timer.cancel_timeout()?;
            }
        }
        if !self.idle {
            self.vcpu.run().map_err(Error::RunVcpu)?;
        }
        Ok(())
    }

    // Routes the queued end-of-interrupt and level notifications to their handlers.
    fn deliver_notifications(&mut self) {
        for _ in 0..MAX_NOTIFICATION_ROUNDS {
            let notifications = self.gic.take_notifications();
            if notifications.is_empty() {
                return;
            }
            for n in notifications {
                match n.handler {
                    IrqHandler::Mmio(base) => {
                        let mut ctx = DeviceContext {
                            gic: &mut self.gic,
                            mem: &self.mem,
                        };
                        let delivered = match n.kind {
                            IrqNotificationKind::Eoi => self.bus.irq_eoi(&mut ctx, base, n.irq),
                            IrqNotificationKind::LevelChanged(level) => {
                                self.bus.irq_level_changed(&mut ctx, base, n.irq, level)
                            }
                        };
                        if !delivered {
                            warn!("vm: no device at {:#x} for irq {}", base, n.irq);
                        }
                    }
                    IrqHandler::VirtualTimer => {
                        if n.kind == IrqNotificationKind::Eoi {
                            self.timer.eoi(&mut self.vcpu.state_mut().timer);
                        }
                    }
                }
            }
        }
        warn!("vm: interrupt notifications keep arriving, deferring the rest");
    }

    // Logs the CPU state and stops the VM for good.
    fn fail(&mut self, e: Error) -> Error {
        error!("vm: fatal error: {}", e);
        error!("{}", self.vcpu.state());
        self.halted = true;
        if let Err(timer_err) = self.timer.cancel_timeout() {
            warn!("vm: failed to cancel the timer: {}", timer_err);
        }
        e
    }
}
