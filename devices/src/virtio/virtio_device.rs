// Copyright 2018 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use vm_memory::GuestMemory;

use super::base_features;
use super::DeviceType;
use super::SplitQueue;

/// Trait for virtio devices to be driven by a virtio transport.
///
/// The transport owns the queues. A device gets the activated ones (`None` for queues the driver
/// has not made ready) whenever the driver notifies a queue or host data arrives for it.
#[allow(unused_variables)]
pub trait VirtioDevice: Send {
    /// Returns a label suitable for debug output.
    fn debug_label(&self) -> String {
        format!("virtio-{}", self.device_type())
    }

    /// The virtio device type.
    fn device_type(&self) -> DeviceType;

    /// The maximum size of each queue that this device supports.
    fn queue_max_sizes(&self) -> &[u16];

    /// The set of feature bits that this device supports.
    fn features(&self) -> u64 {
        base_features()
    }

    /// Acknowledges that this set of features should be enabled.
    fn ack_features(&mut self, value: u64) {}

    /// Reads this device configuration space at `offset`.
    fn read_config(&self, offset: u64, data: &mut [u8]) {}

    /// Writes to this device configuration space at `offset`.
    fn write_config(&mut self, offset: u64, data: &[u8]) {}

    /// The driver notified queue `index`. Returns true if the device moved data through any
    /// queue, in which case the transport interrupts the driver.
    fn notify(
        &mut self,
        mem: &GuestMemory,
        queues: &mut [Option<SplitQueue>],
        index: usize,
    ) -> bool;

    /// Host side data for the device arrived. Returns true if data moved into a queue.
    fn backend_input(
        &mut self,
        mem: &GuestMemory,
        queues: &mut [Option<SplitQueue>],
        data: &[u8],
    ) -> bool {
        false
    }

    /// Drops any state tied to the driver session. Called when the driver resets the device.
    fn reset(&mut self) {}
}

/// Copies the bytes of `config` at `offset` into `data`, leaving bytes past the end untouched.
pub(crate) fn copy_config(data: &mut [u8], offset: u64, config: &[u8]) {
    let Ok(offset) = usize::try_from(offset) else {
        return;
    };
    if offset >= config.len() {
        return;
    }
    let len = std::cmp::min(data.len(), config.len() - offset);
    data[..len].copy_from_slice(&config[offset..offset + len]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_config_clamps() {
        let config = [1u8, 2, 3, 4, 5, 6];
        let mut data = [0u8; 4];
        copy_config(&mut data, 4, &config);
        assert_eq!(data, [5, 6, 0, 0]);
        let mut data = [9u8; 2];
        copy_config(&mut data, 6, &config);
        assert_eq!(data, [9, 9]);
        copy_config(&mut data, 1, &config);
        assert_eq!(data, [2, 3]);
    }
}
