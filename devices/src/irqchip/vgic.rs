// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use base::trace;
use base::warn;

use super::irq::Irq;
use super::irq::IrqConfig;
use super::irq::IrqHandler;
use super::irq::IrqState;
use super::irq::ListOp;
use super::irq::PendingList;
use super::irq::Transition;
use super::irq::NUM_IRQS;
use super::irq::NUM_PRIVATE_IRQS;
use super::irq::SPURIOUS_IRQ;

/// Physical PPI signalling that the guest completed the presented virtual interrupt.
pub const MAINTENANCE_PPI: u32 = 25;
/// PPI of the virtual generic timer.
pub const VIRTUAL_TIMER_PPI: u32 = 27;

/// What happened to an interrupt that has a registered handler.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IrqNotificationKind {
    /// The interrupt was completed and went inactive.
    Eoi,
    /// The line level was changed.
    LevelChanged(bool),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IrqNotification {
    pub irq: u32,
    pub handler: IrqHandler,
    pub kind: IrqNotificationKind,
}

// State shared by all CPUs: the SPIs, the controller enable and the shared pending list.
struct Distributor {
    enabled: bool,
    spis: Vec<Irq>,
    pending: PendingList,
}

// Per CPU state: SGIs and PPIs, the private pending list and the presented interrupt.
struct CpuBank {
    id: u8,
    private: Vec<Irq>,
    pending: PendingList,
    presented: u32,
}

impl CpuBank {
    fn target_mask(&self) -> u8 {
        1 << self.id
    }
}

/// A virtual GICv2 for a single vCPU.
///
/// Handler notifications are queued instead of being delivered from inside the controller, the
/// owner drains them with `take_notifications` and routes them.
pub struct Vgic {
    distributor: Distributor,
    bank: CpuBank,
    notifications: Vec<IrqNotification>,
}

impl Default for Vgic {
    fn default() -> Self {
        Vgic::new()
    }
}

impl Vgic {
    /// Creates every interrupt of the ID space, all disabled and inactive.
    pub fn new() -> Vgic {
        Vgic {
            distributor: Distributor {
                enabled: false,
                spis: (NUM_PRIVATE_IRQS..NUM_IRQS).map(Irq::new).collect(),
                pending: PendingList::default(),
            },
            bank: CpuBank {
                id: 0,
                private: (0..NUM_PRIVATE_IRQS).map(Irq::new).collect(),
                pending: PendingList::default(),
                presented: SPURIOUS_IRQ,
            },
            notifications: Vec::new(),
        }
    }

    /// Returns the interrupt `number`, or None if it is outside the ID space.
    pub fn irq(&self, number: u32) -> Option<&Irq> {
        if number < NUM_PRIVATE_IRQS {
            self.bank.private.get(number as usize)
        } else {
            self.distributor
                .spis
                .get((number - NUM_PRIVATE_IRQS) as usize)
        }
    }

    fn irq_mut(&mut self, number: u32) -> Option<&mut Irq> {
        let irq = if number < NUM_PRIVATE_IRQS {
            self.bank.private.get_mut(number as usize)
        } else {
            self.distributor
                .spis
                .get_mut((number - NUM_PRIVATE_IRQS) as usize)
        };
        if irq.is_none() {
            warn!("vgic: interrupt {} does not exist", number);
        }
        irq
    }

    fn list_for(&mut self, number: u32) -> &mut PendingList {
        if number < NUM_PRIVATE_IRQS {
            &mut self.bank.pending
        } else {
            &mut self.distributor.pending
        }
    }

    fn transition(&mut self, number: u32, op: fn(&mut Irq) -> Transition) {
        let Some(irq) = self.irq_mut(number) else {
            return;
        };
        let transition = op(irq);
        let priority = irq.priority();
        let handler = irq.handler();
        match transition.list {
            ListOp::Keep => {}
            ListOp::Insert => self.list_for(number).insert(priority, number),
            ListOp::Remove => {
                self.list_for(number).remove(number);
            }
        }
        if transition.eoi {
            if let Some(handler) = handler {
                self.notifications.push(IrqNotification {
                    irq: number,
                    handler,
                    kind: IrqNotificationKind::Eoi,
                });
            }
        }
    }

    pub fn enable_distributor(&mut self) {
        self.distributor.enabled = true;
    }

    pub fn disable_distributor(&mut self) {
        self.distributor.enabled = false;
    }

    pub fn distributor_enabled(&self) -> bool {
        self.distributor.enabled
    }

    pub fn enable(&mut self, number: u32) {
        if let Some(irq) = self.irq_mut(number) {
            irq.set_enabled(true);
        }
    }

    pub fn disable(&mut self, number: u32) {
        if let Some(irq) = self.irq_mut(number) {
            irq.set_enabled(false);
        }
    }

    /// Makes `number` pending. Asserting a pending interrupt does nothing.
    pub fn assert(&mut self, number: u32) {
        trace!("vgic: assert {}", number);
        self.transition(number, Irq::assert);
    }

    /// Withdraws `number` and tells its handler it is complete.
    pub fn deassert(&mut self, number: u32) {
        trace!("vgic: deassert {}", number);
        self.transition(number, Irq::deassert);
    }

    /// Acknowledges a pending interrupt.
    pub fn activate(&mut self, number: u32) {
        self.transition(number, Irq::activate);
    }

    /// Completes an active interrupt without notifying its handler.
    pub fn deactivate(&mut self, number: u32) {
        self.transition(number, Irq::deactivate);
    }

    /// Drops the pending part of the state of `number`, leaving an active interrupt active.
    pub fn clear_pending(&mut self, number: u32) {
        self.transition(number, Irq::clear_pending);
    }

    /// Changes the priority of `number`. A pending interrupt moves to its new place in the list.
    pub fn set_priority(&mut self, number: u32, priority: u8) {
        let Some(irq) = self.irq_mut(number) else {
            return;
        };
        irq.set_priority(priority);
        if irq.pending() {
            let list = self.list_for(number);
            list.remove(number);
            list.insert(priority, number);
        }
    }

    /// Sets the CPU target mask of an SPI. Private interrupts always target their own CPU.
    pub fn set_target(&mut self, number: u32, target: u8) {
        if number < NUM_PRIVATE_IRQS {
            return;
        }
        if let Some(irq) = self.irq_mut(number) {
            irq.set_target(target);
        }
    }

    pub fn set_config(&mut self, number: u32, config: IrqConfig) {
        if let Some(irq) = self.irq_mut(number) {
            irq.set_config(config);
        }
    }

    /// Records the line level of `number` and notifies its handler.
    pub fn set_level(&mut self, number: u32, level: bool) {
        let Some(irq) = self.irq_mut(number) else {
            return;
        };
        irq.set_level(level);
        if let Some(handler) = irq.handler() {
            self.notifications.push(IrqNotification {
                irq: number,
                handler,
                kind: IrqNotificationKind::LevelChanged(level),
            });
        }
    }

    /// Registers who is told about completion and level changes of `number`.
    pub fn register_handler(&mut self, number: u32, handler: IrqHandler) {
        if let Some(irq) = self.irq_mut(number) {
            irq.set_handler(Some(handler));
        }
    }

    /// The interrupt currently presented to the guest, `SPURIOUS_IRQ` if none.
    pub fn presented(&self) -> u32 {
        self.bank.presented
    }

    /// Picks the interrupt to present to the guest.
    ///
    /// A presented interrupt stays presented until it is completed. Otherwise the first enabled
    /// entry of the private list competes with the first enabled SPI targeting this CPU, the
    /// lower priority value wins and private interrupts win ties. The winner is activated.
    pub fn pending_irq(&mut self) -> Option<u32> {
        if self.bank.presented != SPURIOUS_IRQ {
            return Some(self.bank.presented);
        }

        let private = self
            .bank
            .pending
            .iter()
            .find(|&(_, n)| self.bank.private[n as usize].enabled());
        let mask = self.bank.target_mask();
        let shared = if self.distributor.enabled {
            self.distributor.pending.iter().find(|&(_, n)| {
                let irq = &self.distributor.spis[(n - NUM_PRIVATE_IRQS) as usize];
                irq.enabled() && irq.target() & mask != 0
            })
        } else {
            None
        };

        let (_, winner) = match (private, shared) {
            (Some(p), Some(s)) => {
                if p.0 <= s.0 {
                    p
                } else {
                    s
                }
            }
            (Some(p), None) => p,
            (None, Some(s)) => s,
            (None, None) => return None,
        };
        self.activate(winner);
        self.bank.presented = winner;
        trace!("vgic: presenting {}", winner);
        Some(winner)
    }

    /// The guest finished with the presented interrupt. An interrupt that was asserted again
    /// while active goes back to pending, anything else is completed and its handler notified.
    pub fn complete_presented(&mut self) {
        let number = self.bank.presented;
        if number == SPURIOUS_IRQ {
            return;
        }
        match self.irq(number).map(Irq::state) {
            Some(IrqState::ActivePending) => self.deactivate(number),
            _ => self.deassert(number),
        }
        self.bank.presented = SPURIOUS_IRQ;
    }

    /// Takes the handler notifications queued since the last call.
    pub fn take_notifications(&mut self) -> Vec<IrqNotification> {
        std::mem::take(&mut self.notifications)
    }

    /// Pending interrupts of the private list followed by the shared list, for diagnostics.
    pub fn pending_irqs(&self) -> Vec<u32> {
        self.bank
            .pending
            .iter()
            .chain(self.distributor.pending.iter())
            .map(|(_, n)| n)
            .collect()
    }
}
