// Copyright 2018 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::VecDeque;
use std::io;

use base::warn;

use crate::bus::AccessWidth;
use crate::bus::BusAccessInfo;
use crate::bus::BusDevice;
use crate::bus::DeviceContext;
use crate::bus::Direction;
use crate::bus::Result;
use crate::register;
use crate::register_space::RegisterSpace;
use crate::static_register;

// Register offsets
// Data register
const UARTDR: u64 = 0x0;
// Receive status / error clear register
const UARTRSR: u64 = 0x4;
// Flag register
const UARTFR: u64 = 0x18;
// IrDA low-power counter register
const UARTILPR: u64 = 0x20;
// Integer baud rate register
const UARTIBRD: u64 = 0x24;
// Fractional baud rate register
const UARTFBRD: u64 = 0x28;
// Line control register
const UARTLCR_H: u64 = 0x2c;
// Control register
const UARTCR: u64 = 0x30;
// Interrupt FIFO level select register
const UARTIFLS: u64 = 0x34;
// Interrupt mask set/clear register
const UARTIMSC: u64 = 0x38;
// Raw interrupt status register
const UARTRIS: u64 = 0x3c;
// Masked interrupt status register
const UARTMIS: u64 = 0x40;
// Interrupt clear register
const UARTICR: u64 = 0x44;
// DMA control register
const UARTDMACR: u64 = 0x48;

// A single 4K page is mapped for this device
pub const PL011_AMBA_IOMEM_SIZE: u64 = 0x1000;

// AMBA id registers are at the end of the allocated memory space
const AMBA_ID_OFFSET: u64 = PL011_AMBA_IOMEM_SIZE - 0x20;
// UARTPeriphID0-3 followed by UARTPCellID0-3.
const PL011_AMBA_IDS: [u8; 8] = [0x11, 0x10, 0x14, 0x00, 0x0d, 0xf0, 0x05, 0xb1];

const FR_RXFE: u64 = 1 << 4;
const FR_TXFF: u64 = 1 << 5;
const FR_RXFF: u64 = 1 << 6;
const FR_TXFE: u64 = 1 << 7;

/// Receive interrupt bit in RIS/MIS/IMSC/ICR.
pub const INT_RX: u64 = 1 << 4;
/// Transmit interrupt bit in RIS/MIS/IMSC/ICR.
pub const INT_TX: u64 = 1 << 5;
const INT_ALL: u64 = 0x7ff;

const RX_FIFO_SIZE: usize = 32;

/// An emulated ARM PL011 UART.
///
/// Transmitted bytes go straight to `out`. Host input fills a 32 byte receive FIFO. The raw
/// interrupt status masked by IMSC drives the level of the UART's SPI.
pub struct Pl011 {
    regs: RegisterSpace,
    rx_fifo: VecDeque<u8>,
    out: Box<dyn io::Write + Send>,
    irq: u32,
}

impl Pl011 {
    /// Constructs a Pl011 raising `irq` and writing guest output to `out`.
    pub fn new(irq: u32, out: Box<dyn io::Write + Send>) -> Pl011 {
        let mut regs = RegisterSpace::new();
        regs.add_registers([
            register!(name: "UARTRSR", access: ReadWrite, ty: u32, offset: UARTRSR, reset_value: 0,
                      guest_writeable_mask: 0),
            register!(name: "UARTILPR", access: ReadWrite, ty: u32, offset: UARTILPR,
                      reset_value: 0, guest_writeable_mask: 0xff),
            register!(name: "UARTIBRD", access: ReadWrite, ty: u32, offset: UARTIBRD,
                      reset_value: 0, guest_writeable_mask: 0xffff),
            register!(name: "UARTFBRD", access: ReadWrite, ty: u32, offset: UARTFBRD,
                      reset_value: 0, guest_writeable_mask: 0x3f),
            register!(name: "UARTLCR_H", access: ReadWrite, ty: u32, offset: UARTLCR_H,
                      reset_value: 0, guest_writeable_mask: 0xff),
            register!(name: "UARTCR", access: ReadWrite, ty: u32, offset: UARTCR,
                      reset_value: 0x300, guest_writeable_mask: 0xff87),
            register!(name: "UARTIFLS", access: ReadWrite, ty: u32, offset: UARTIFLS,
                      reset_value: 0x12, guest_writeable_mask: 0x3f),
            register!(name: "UARTIMSC", access: ReadWrite, ty: u32, offset: UARTIMSC,
                      reset_value: 0, guest_writeable_mask: INT_ALL),
            register!(name: "UARTRIS", access: ReadOnly, ty: u32, offset: UARTRIS,
                      reset_value: 0),
            register!(name: "UARTICR", access: WriteOnly, ty: u32, offset: UARTICR,
                      reset_value: 0),
            register!(name: "UARTDMACR", access: ReadWrite, ty: u32, offset: UARTDMACR,
                      reset_value: 0, guest_writeable_mask: 0x7),
        ]);
        for (i, id) in PL011_AMBA_IDS.iter().enumerate() {
            regs.add_register(static_register!(
                name: "UARTID",
                ty: u32,
                offset: AMBA_ID_OFFSET + 4 * i as u64,
                value: *id,
            ));
        }
        Pl011 {
            regs,
            rx_fifo: VecDeque::with_capacity(RX_FIFO_SIZE),
            out,
            irq,
        }
    }

    fn flags(&self) -> u64 {
        let mut flags = FR_TXFE;
        if self.rx_fifo.is_empty() {
            flags |= FR_RXFE;
        }
        if self.rx_fifo.len() >= RX_FIFO_SIZE {
            flags |= FR_RXFF;
        }
        debug_assert_eq!(flags & FR_TXFF, 0);
        flags
    }

    fn masked_status(&self) -> u64 {
        self.regs.value(UARTRIS) & self.regs.value(UARTIMSC)
    }

    // Recomputes the interrupt line from the raw status and mask.
    fn update_irq(&mut self, ctx: &mut DeviceContext) {
        if self.rx_fifo.is_empty() {
            self.regs.clear_bits(UARTRIS, INT_RX);
        } else {
            self.regs.set_bits(UARTRIS, INT_RX);
        }
        if self.masked_status() != 0 {
            ctx.gic.assert(self.irq);
        } else {
            ctx.gic.clear_pending(self.irq);
        }
    }

    fn transmit(&mut self, byte: u8) {
        if let Err(e) = self.out.write_all(&[byte]).and_then(|_| self.out.flush()) {
            warn!("pl011: failed to write to output: {}", e);
        }
    }
}

impl BusDevice for Pl011 {
    fn debug_label(&self) -> String {
        "Pl011".to_owned()
    }

    fn read(
        &mut self,
        ctx: &mut DeviceContext,
        info: BusAccessInfo,
        width: AccessWidth,
    ) -> Result<u64> {
        if width == AccessWidth::DoubleWord {
            return Err(info.unsupported(width, Direction::Read));
        }
        let value = match info.offset {
            UARTDR => {
                let byte = self.rx_fifo.pop_front().unwrap_or(0);
                self.update_irq(ctx);
                byte as u64
            }
            UARTFR => self.flags(),
            UARTMIS => self.masked_status(),
            o => match self.regs.read(o, width) {
                Ok(v) => v,
                Err(e) => {
                    warn!("pl011: bad read: {}", e);
                    0
                }
            },
        };
        Ok(value)
    }

    fn write(
        &mut self,
        ctx: &mut DeviceContext,
        info: BusAccessInfo,
        width: AccessWidth,
        value: u64,
    ) -> Result<()> {
        if width == AccessWidth::DoubleWord {
            return Err(info.unsupported(width, Direction::Write));
        }
        match info.offset {
            UARTDR => {
                self.transmit(value as u8);
                self.regs.set_bits(UARTRIS, INT_TX);
                self.update_irq(ctx);
            }
            UARTFR | UARTMIS => {
                warn!("pl011: invalid write to read-only register {:#x}", info.offset);
            }
            o => match self.regs.write(o, width, value) {
                Ok(UARTICR) => {
                    self.regs.clear_bits(UARTRIS, value & INT_ALL);
                    self.update_irq(ctx);
                }
                Ok(UARTIMSC) => self.update_irq(ctx),
                Ok(_) => {}
                Err(e) => warn!("pl011: bad write: {}", e),
            },
        }
        Ok(())
    }

    fn irq_eoi(&mut self, ctx: &mut DeviceContext, _irq: u32) {
        // Level triggered: still raised means pending again.
        if self.masked_status() != 0 {
            ctx.gic.assert(self.irq);
        }
    }

    fn backend_input(&mut self, ctx: &mut DeviceContext, data: &[u8]) -> Result<()> {
        let room = RX_FIFO_SIZE - self.rx_fifo.len();
        if data.len() > room {
            warn!(
                "pl011: receive FIFO full, dropping {} bytes",
                data.len() - room
            );
        }
        self.rx_fifo.extend(data.iter().take(room));
        self.update_irq(ctx);
        Ok(())
    }

    fn reset(&mut self) {
        self.regs.reset();
        self.rx_fifo.clear();
    }
}
