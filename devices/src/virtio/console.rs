// Copyright 2020 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Virtio console device bridging port 0 to a host terminal.

use std::collections::VecDeque;
use std::io;
use std::io::Write;

use anyhow::Context;
use base::error;
use base::trace;
use base::warn;
use vm_memory::GuestMemory;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

use super::virtio_device::copy_config;
use super::DeviceType;
use super::SplitQueue;
use super::VirtioDevice;

pub(crate) const QUEUE_SIZE: u16 = 256;

// For now, just implement port 0 (receiveq and transmitq).

const RX_QUEUE: usize = 0;
const TX_QUEUE: usize = 1;

// Host input kept while the driver has no receive buffers posted.
const MAX_BUFFERED_INPUT: usize = 4096;

#[derive(Copy, Clone, Debug, Default, IntoBytes, Immutable)]
#[repr(C)]
pub struct virtio_console_config {
    pub cols: u16,
    pub rows: u16,
    pub max_nr_ports: u32,
    pub emerg_wr: u32,
}

/// Virtio console device with a single port.
pub struct Console {
    out: Box<dyn io::Write + Send>,
    input: VecDeque<u8>,
    cols: u16,
    rows: u16,
    queue_sizes: [u16; 2],
}

impl Console {
    /// Creates a console whose transmitted bytes are written to `out`.
    pub fn new(out: Box<dyn io::Write + Send>) -> Console {
        Console {
            out,
            input: VecDeque::new(),
            cols: 80,
            rows: 25,
            queue_sizes: [QUEUE_SIZE; 2],
        }
    }

    /// Limits both queues to `size` descriptors.
    pub fn with_queue_size(mut self, size: u16) -> Self {
        self.queue_sizes = [size; 2];
        self
    }

    /// Sets the terminal geometry reported in the configuration space.
    pub fn set_size(&mut self, cols: u16, rows: u16) {
        self.cols = cols;
        self.rows = rows;
    }

    /// Bytes received from the host that the guest has not taken yet.
    pub fn buffered_input(&self) -> usize {
        self.input.len()
    }

    // Drains every available chain of the transmit queue into the terminal.
    fn process_transmit_queue(&mut self, mem: &GuestMemory, queue: &mut SplitQueue) -> bool {
        let mut moved = false;
        loop {
            let chain = match queue.pop(mem) {
                Ok(Some(chain)) => chain,
                Ok(None) => break,
                Err(e) => {
                    error!("console: failed to pop transmit chain: {:#}", e);
                    break;
                }
            };
            trace!("console: transmit {} bytes", chain.readable_len());
            let out = &mut self.out;
            let sent = chain
                .read_chunks(mem, |chunk| {
                    out.write_all(chunk).context("failed to write to terminal")
                })
                .and_then(|_| out.flush().context("failed to flush terminal"));
            if let Err(e) = sent {
                error!("console: transmit failed: {:#}", e);
            }
            if let Err(e) = queue.add_used(mem, &chain, 0) {
                error!("console: failed to return transmit chain: {:#}", e);
                break;
            }
            moved = true;
        }
        moved
    }

    // Moves buffered host input into the receive queue while buffers remain.
    fn handle_input(&mut self, mem: &GuestMemory, queue: &mut SplitQueue) -> bool {
        let mut moved = false;
        while !self.input.is_empty() {
            let chain = match queue.pop(mem) {
                Ok(Some(chain)) => chain,
                Ok(None) => break,
                Err(e) => {
                    error!("console: failed to pop receive chain: {:#}", e);
                    break;
                }
            };
            let len = std::cmp::min(chain.writable_len(), self.input.len());
            let data: Vec<u8> = self.input.iter().take(len).copied().collect();
            let written = match chain.write_all(mem, &data) {
                Ok(n) => n,
                Err(e) => {
                    error!("console: failed to fill receive chain: {:#}", e);
                    0
                }
            };
            self.input.drain(..written);
            if let Err(e) = queue.add_used(mem, &chain, written as u32) {
                error!("console: failed to return receive chain: {:#}", e);
                break;
            }
            moved = true;
        }
        moved
    }
}

impl VirtioDevice for Console {
    fn device_type(&self) -> DeviceType {
        DeviceType::Console
    }

    fn queue_max_sizes(&self) -> &[u16] {
        &self.queue_sizes
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        let config = virtio_console_config {
            cols: self.cols.to_le(),
            rows: self.rows.to_le(),
            max_nr_ports: 1u32.to_le(),
            emerg_wr: 0,
        };
        copy_config(data, offset, config.as_bytes());
    }

    fn notify(
        &mut self,
        mem: &GuestMemory,
        queues: &mut [Option<SplitQueue>],
        index: usize,
    ) -> bool {
        match (index, queues.get_mut(index).and_then(Option::as_mut)) {
            (TX_QUEUE, Some(queue)) => self.process_transmit_queue(mem, queue),
            // New receive buffers: deliver anything that was waiting for them.
            (RX_QUEUE, Some(queue)) => self.handle_input(mem, queue),
            _ => false,
        }
    }

    fn backend_input(
        &mut self,
        mem: &GuestMemory,
        queues: &mut [Option<SplitQueue>],
        data: &[u8],
    ) -> bool {
        let room = MAX_BUFFERED_INPUT.saturating_sub(self.input.len());
        if data.len() > room {
            warn!("console: dropping {} bytes of input", data.len() - room);
        }
        self.input.extend(&data[..std::cmp::min(room, data.len())]);
        match queues.get_mut(RX_QUEUE).and_then(Option::as_mut) {
            Some(queue) => self.handle_input(mem, queue),
            None => false,
        }
    }

    fn reset(&mut self) {
        self.input.clear();
    }
}
