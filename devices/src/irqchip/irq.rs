// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use serde::Deserialize;
use serde::Serialize;

/// Number of interrupt IDs the controller models: SGIs, PPIs and SPIs up to 1019.
pub const NUM_IRQS: u32 = 1020;
/// SGIs and PPIs are banked per CPU.
pub const NUM_PRIVATE_IRQS: u32 = 32;
/// Number of software generated interrupts at the start of the private range.
pub const NUM_SGIS: u32 = 16;
/// The value of the presented interrupt slot when nothing is presented.
pub const SPURIOUS_IRQ: u32 = 1023;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IrqKind {
    Sgi,
    Ppi,
    Spi,
}

impl IrqKind {
    pub fn of(number: u32) -> IrqKind {
        if number < NUM_SGIS {
            IrqKind::Sgi
        } else if number < NUM_PRIVATE_IRQS {
            IrqKind::Ppi
        } else {
            IrqKind::Spi
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IrqState {
    Inactive,
    Pending,
    Active,
    ActivePending,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IrqConfig {
    Level,
    Edge,
}

/// Names whoever wants to hear about completion or line changes of an interrupt. This is a key,
/// the controller never owns the handler.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IrqHandler {
    /// The MMIO device registered on the bus at this base address.
    Mmio(u64),
    /// The virtual generic timer.
    VirtualTimer,
}

// What a state transition requires of the pending list holding the interrupt.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ListOp {
    Keep,
    Insert,
    Remove,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Transition {
    pub list: ListOp,
    pub eoi: bool,
}

impl Transition {
    const NONE: Transition = Transition {
        list: ListOp::Keep,
        eoi: false,
    };

    const fn new(list: ListOp, eoi: bool) -> Transition {
        Transition { list, eoi }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Irq {
    number: u32,
    kind: IrqKind,
    enabled: bool,
    state: IrqState,
    config: IrqConfig,
    priority: u8,
    target: u8,
    level: bool,
    handler: Option<IrqHandler>,
}

impl Irq {
    pub fn new(number: u32) -> Irq {
        let kind = IrqKind::of(number);
        Irq {
            number,
            kind,
            enabled: false,
            state: IrqState::Inactive,
            config: if kind == IrqKind::Sgi {
                IrqConfig::Edge
            } else {
                IrqConfig::Level
            },
            priority: 0,
            // Single CPU: every SPI targets CPU 0 until the guest says otherwise.
            target: 1,
            level: false,
            handler: None,
        }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn kind(&self) -> IrqKind {
        self.kind
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn state(&self) -> IrqState {
        self.state
    }

    pub fn config(&self) -> IrqConfig {
        self.config
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn target(&self) -> u8 {
        self.target
    }

    pub fn level(&self) -> bool {
        self.level
    }

    pub fn handler(&self) -> Option<IrqHandler> {
        self.handler
    }

    /// True while the interrupt sits on a pending list.
    pub fn pending(&self) -> bool {
        matches!(self.state, IrqState::Pending | IrqState::ActivePending)
    }

    pub fn active(&self) -> bool {
        matches!(self.state, IrqState::Active | IrqState::ActivePending)
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub(crate) fn set_priority(&mut self, priority: u8) {
        self.priority = priority;
    }

    pub(crate) fn set_target(&mut self, target: u8) {
        self.target = target;
    }

    pub(crate) fn set_config(&mut self, config: IrqConfig) {
        self.config = config;
    }

    pub(crate) fn set_level(&mut self, level: bool) {
        self.level = level;
    }

    pub(crate) fn set_handler(&mut self, handler: Option<IrqHandler>) {
        self.handler = handler;
    }

    pub(crate) fn assert(&mut self) -> Transition {
        match self.state {
            IrqState::Inactive => {
                self.state = IrqState::Pending;
                Transition::new(ListOp::Insert, false)
            }
            IrqState::Active => {
                self.state = IrqState::ActivePending;
                Transition::new(ListOp::Insert, false)
            }
            IrqState::Pending | IrqState::ActivePending => Transition::NONE,
        }
    }

    pub(crate) fn deassert(&mut self) -> Transition {
        match self.state {
            IrqState::Inactive => Transition::NONE,
            IrqState::Pending | IrqState::ActivePending => {
                self.state = IrqState::Inactive;
                Transition::new(ListOp::Remove, true)
            }
            IrqState::Active => {
                self.state = IrqState::Inactive;
                Transition::new(ListOp::Keep, true)
            }
        }
    }

    pub(crate) fn activate(&mut self) -> Transition {
        match self.state {
            IrqState::Pending => {
                self.state = IrqState::Active;
                Transition::new(ListOp::Remove, false)
            }
            _ => Transition::NONE,
        }
    }

    pub(crate) fn deactivate(&mut self) -> Transition {
        match self.state {
            IrqState::Active => self.state = IrqState::Inactive,
            IrqState::ActivePending => self.state = IrqState::Pending,
            IrqState::Inactive | IrqState::Pending => {}
        }
        Transition::NONE
    }

    // Drops the pending part of the state without completing the interrupt.
    pub(crate) fn clear_pending(&mut self) -> Transition {
        match self.state {
            IrqState::Pending => {
                self.state = IrqState::Inactive;
                Transition::new(ListOp::Remove, false)
            }
            IrqState::ActivePending => {
                self.state = IrqState::Active;
                Transition::new(ListOp::Remove, false)
            }
            IrqState::Inactive | IrqState::Active => Transition::NONE,
        }
    }
}

/// Interrupts waiting to be presented, kept in non-decreasing priority order. Interrupts of
/// equal priority stay in arrival order.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PendingList {
    entries: Vec<(u8, u32)>,
}

impl PendingList {
    /// Queues `number` ahead of the first entry with a strictly larger priority value.
    pub fn insert(&mut self, priority: u8, number: u32) {
        let index = self
            .entries
            .iter()
            .position(|&(p, _)| p > priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(index, (priority, number));
    }

    /// Removes `number`. Returns false if it was not queued.
    pub fn remove(&mut self, number: u32) -> bool {
        match self.entries.iter().position(|&(_, n)| n == number) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, number: u32) -> bool {
        self.entries.iter().any(|&(_, n)| n == number)
    }

    /// (priority, number) pairs in presentation order.
    pub fn iter(&self) -> impl Iterator<Item = (u8, u32)> + '_ {
        self.entries.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(IrqKind::of(0), IrqKind::Sgi);
        assert_eq!(IrqKind::of(15), IrqKind::Sgi);
        assert_eq!(IrqKind::of(16), IrqKind::Ppi);
        assert_eq!(IrqKind::of(31), IrqKind::Ppi);
        assert_eq!(IrqKind::of(32), IrqKind::Spi);
        assert_eq!(Irq::new(3).config(), IrqConfig::Edge);
        assert_eq!(Irq::new(40).config(), IrqConfig::Level);
    }

    #[test]
    fn pending_list_orders_by_priority_then_arrival() {
        let mut list = PendingList::default();
        list.insert(0x80, 40);
        list.insert(0x10, 41);
        list.insert(0x80, 42);
        list.insert(0x00, 43);
        list.insert(0x10, 44);
        let order: Vec<u32> = list.iter().map(|(_, n)| n).collect();
        assert_eq!(order, vec![43, 41, 44, 40, 42]);
        let priorities: Vec<u8> = list.iter().map(|(p, _)| p).collect();
        assert!(priorities.windows(2).all(|w| w[0] <= w[1]));

        assert!(list.remove(41));
        assert!(!list.remove(41));
        assert!(!list.contains(41));
        assert_eq!(list.len(), 4);
    }

    fn with_state(state: IrqState) -> Irq {
        let mut irq = Irq::new(40);
        irq.state = state;
        irq
    }

    #[test]
    fn transition_table() {
        use IrqState::*;
        use ListOp::*;

        type Op = fn(&mut Irq) -> Transition;
        let ops: [(&str, Op); 4] = [
            ("assert", Irq::assert),
            ("deassert", Irq::deassert),
            ("activate", Irq::activate),
            ("deactivate", Irq::deactivate),
        ];
        // (state, [(next state, list op, eoi) for assert, deassert, activate, deactivate])
        let table = [
            (
                Inactive,
                [
                    (Pending, Insert, false),
                    (Inactive, Keep, false),
                    (Inactive, Keep, false),
                    (Inactive, Keep, false),
                ],
            ),
            (
                Pending,
                [
                    (Pending, Keep, false),
                    (Inactive, Remove, true),
                    (Active, Remove, false),
                    (Pending, Keep, false),
                ],
            ),
            (
                Active,
                [
                    (ActivePending, Insert, false),
                    (Inactive, Keep, true),
                    (Active, Keep, false),
                    (Inactive, Keep, false),
                ],
            ),
            (
                ActivePending,
                [
                    (ActivePending, Keep, false),
                    (Inactive, Remove, true),
                    (ActivePending, Keep, false),
                    (Pending, Keep, false),
                ],
            ),
        ];

        for (state, expected) in table {
            for ((name, op), (next, list, eoi)) in ops.iter().zip(expected) {
                let mut irq = with_state(state);
                let t = op(&mut irq);
                assert_eq!(irq.state(), next, "{:?} {}", state, name);
                assert_eq!(t, Transition { list, eoi }, "{:?} {}", state, name);
            }
        }
    }

    #[test]
    fn clear_pending_keeps_active() {
        let mut irq = with_state(IrqState::ActivePending);
        assert_eq!(irq.clear_pending().list, ListOp::Remove);
        assert_eq!(irq.state(), IrqState::Active);
        assert_eq!(irq.clear_pending(), Transition::NONE);
    }
}
