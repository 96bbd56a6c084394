// Copyright 2017 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Virtio network device exchanging ethernet frames with a host backend.

use std::collections::VecDeque;
use std::io;

use base::error;
use base::trace;
use base::warn;
use vm_memory::GuestMemory;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use super::base_features;
use super::virtio_device::copy_config;
use super::DescriptorChain;
use super::DeviceType;
use super::SplitQueue;
use super::VirtioDevice;

/// The maximum buffer size when segmentation offload is disabled.
pub const MAX_BUFFER_SIZE: usize = 65562;
pub const QUEUE_SIZE: u16 = 256;

const RX_QUEUE: usize = 0;
const TX_QUEUE: usize = 1;

// Frames kept while the driver has no receive buffers posted.
const MAX_PENDING_FRAMES: usize = 64;

pub const VIRTIO_NET_F_MAC: u32 = 5;
pub const VIRTIO_NET_F_STATUS: u32 = 16;

pub const VIRTIO_NET_S_LINK_UP: u16 = 1;

/// Header in front of every frame on both queues when VIRTIO_F_VERSION_1 is negotiated.
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct virtio_net_hdr_v1 {
    pub flags: u8,
    pub gso_type: u8,
    pub hdr_len: u16,
    pub gso_size: u16,
    pub csum_start: u16,
    pub csum_offset: u16,
    pub num_buffers: u16,
}

const NET_HDR_LEN: usize = std::mem::size_of::<virtio_net_hdr_v1>();

#[derive(Copy, Clone, Debug, Default, IntoBytes, Immutable)]
#[repr(C, packed)]
pub struct virtio_net_config {
    pub mac: [u8; 6],
    pub status: u16,
}

/// Host side of the network link.
pub trait NetBackend: Send {
    /// Sends one ethernet frame out of the VM.
    fn send(&mut self, frame: &[u8]) -> io::Result<()>;
}

/// Virtio network device with one receive and one transmit queue.
pub struct Net {
    backend: Box<dyn NetBackend>,
    mac: [u8; 6],
    acked_features: u64,
    rx_frames: VecDeque<Vec<u8>>,
    queue_sizes: [u16; 2],
}

impl Net {
    /// Creates a network device with hardware address `mac` sending frames to `backend`.
    pub fn new(backend: Box<dyn NetBackend>, mac: [u8; 6]) -> Net {
        Net {
            backend,
            mac,
            acked_features: 0,
            rx_frames: VecDeque::new(),
            queue_sizes: [QUEUE_SIZE; 2],
        }
    }

    /// Limits both queues to `size` descriptors.
    pub fn with_queue_size(mut self, size: u16) -> Self {
        self.queue_sizes = [size; 2];
        self
    }

    /// Features the driver acknowledged.
    pub fn acked_features(&self) -> u64 {
        self.acked_features
    }

    /// Frames received from the host that the guest has not taken yet.
    pub fn pending_frames(&self) -> usize {
        self.rx_frames.len()
    }

    fn process_tx(&mut self, mem: &GuestMemory, queue: &mut SplitQueue) -> bool {
        let mut moved = false;
        loop {
            let chain = match queue.pop(mem) {
                Ok(Some(chain)) => chain,
                Ok(None) => break,
                Err(e) => {
                    error!("net: failed to pop transmit chain: {:#}", e);
                    break;
                }
            };
            let len = chain.readable_len();
            if len < NET_HDR_LEN {
                warn!("net: transmit chain of {} bytes has no header", len);
            } else if len > NET_HDR_LEN + MAX_BUFFER_SIZE {
                warn!("net: dropping oversized frame of {} bytes", len);
            } else {
                self.transmit(mem, &chain);
            }
            if let Err(e) = queue.add_used(mem, &chain, 0) {
                error!("net: failed to return transmit chain: {:#}", e);
                break;
            }
            moved = true;
        }
        moved
    }

    // Sends the frame behind the header of a chain whose length was checked.
    fn transmit(&mut self, mem: &GuestMemory, chain: &DescriptorChain) {
        match chain.read_all(mem, NET_HDR_LEN + MAX_BUFFER_SIZE) {
            Ok(data) => {
                let frame = &data[NET_HDR_LEN..];
                trace!("net: transmit frame of {} bytes", frame.len());
                if let Err(e) = self.backend.send(frame) {
                    error!("net: failed to send frame: {}", e);
                }
            }
            Err(e) => error!("net: failed to read transmit chain: {:#}", e),
        }
    }

    fn process_rx(&mut self, mem: &GuestMemory, queue: &mut SplitQueue) -> bool {
        let mut moved = false;
        while let Some(frame) = self.rx_frames.front() {
            let chain = match queue.pop(mem) {
                Ok(Some(chain)) => chain,
                Ok(None) => break,
                Err(e) => {
                    error!("net: failed to pop receive chain: {:#}", e);
                    break;
                }
            };
            let hdr = virtio_net_hdr_v1 {
                num_buffers: 1u16.to_le(),
                ..Default::default()
            };
            let mut data = Vec::with_capacity(NET_HDR_LEN + frame.len());
            data.extend_from_slice(hdr.as_bytes());
            data.extend_from_slice(frame);
            if chain.writable_len() < data.len() {
                warn!(
                    "net: receive buffer of {} bytes truncates a {} byte frame",
                    chain.writable_len(),
                    data.len()
                );
            }
            let written = match chain.write_all(mem, &data) {
                Ok(n) => n,
                Err(e) => {
                    error!("net: failed to fill receive chain: {:#}", e);
                    0
                }
            };
            self.rx_frames.pop_front();
            if let Err(e) = queue.add_used(mem, &chain, written as u32) {
                error!("net: failed to return receive chain: {:#}", e);
                break;
            }
            moved = true;
        }
        moved
    }
}

impl VirtioDevice for Net {
    fn device_type(&self) -> DeviceType {
        DeviceType::Net
    }

    fn queue_max_sizes(&self) -> &[u16] {
        &self.queue_sizes
    }

    fn features(&self) -> u64 {
        base_features() | 1 << VIRTIO_NET_F_MAC | 1 << VIRTIO_NET_F_STATUS
    }

    fn ack_features(&mut self, value: u64) {
        self.acked_features = value;
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        let config = virtio_net_config {
            mac: self.mac,
            status: VIRTIO_NET_S_LINK_UP.to_le(),
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
            (TX_QUEUE, Some(queue)) => self.process_tx(mem, queue),
            (RX_QUEUE, Some(queue)) => self.process_rx(mem, queue),
            _ => false,
        }
    }

    fn backend_input(
        &mut self,
        mem: &GuestMemory,
        queues: &mut [Option<SplitQueue>],
        data: &[u8],
    ) -> bool {
        if self.rx_frames.len() >= MAX_PENDING_FRAMES {
            warn!("net: receive backlog full, dropping frame");
        } else {
            self.rx_frames.push_back(data.to_vec());
        }
        match queues.get_mut(RX_QUEUE).and_then(Option::as_mut) {
            Some(queue) => self.process_rx(mem, queue),
            None => false,
        }
    }

    fn reset(&mut self) {
        self.acked_features = 0;
        self.rx_frames.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sync::Mutex;
    use vm_memory::GuestAddress;

    use super::*;
    use crate::virtio::descriptor_chain::Desc;
    use crate::virtio::QueueConfig;
    use crate::virtio::VIRTQ_DESC_F_NEXT;
    use crate::virtio::VIRTQ_DESC_F_WRITE;

    const MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

    #[derive(Clone, Default)]
    struct Frames(Arc<Mutex<Vec<Vec<u8>>>>);

    impl NetBackend for Frames {
        fn send(&mut self, frame: &[u8]) -> io::Result<()> {
            self.0.lock().push(frame.to_vec());
            Ok(())
        }
    }

    fn memory() -> GuestMemory {
        GuestMemory::new(&[(GuestAddress(0), 0x10000)]).unwrap()
    }

    fn queue(mem: &GuestMemory, base: u64) -> SplitQueue {
        let mut config = QueueConfig::new(QUEUE_SIZE);
        config.set_size(4);
        config.set_desc_table(GuestAddress(base));
        config.set_avail_ring(GuestAddress(base + 0x100));
        config.set_used_ring(GuestAddress(base + 0x200));
        mem.write_obj_at_addr(0u16, GuestAddress(base + 0x102))
            .unwrap();
        config.activate().unwrap()
    }

    fn set_desc(mem: &GuestMemory, base: u64, i: u16, desc: Desc) {
        mem.write_obj_at_addr(desc, GuestAddress(base + u64::from(i) * 16))
            .unwrap();
    }

    fn make_available(mem: &GuestMemory, base: u64, head: u16) {
        mem.write_obj_at_addr(head, GuestAddress(base + 0x104))
            .unwrap();
        mem.write_obj_at_addr(1u16, GuestAddress(base + 0x102))
            .unwrap();
    }

    #[test]
    fn transmit_strips_header() {
        let mem = memory();
        let frames = Frames::default();
        let mut net = Net::new(Box::new(frames.clone()), MAC);
        let mut queues = [Some(queue(&mem, 0x1000)), Some(queue(&mem, 0x2000))];

        mem.write_obj_at_addr(virtio_net_hdr_v1::default(), GuestAddress(0x8000))
            .unwrap();
        mem.write_all_at_addr(b"frame", GuestAddress(0x9000)).unwrap();
        set_desc(
            &mem,
            0x2000,
            0,
            Desc {
                addr: 0x8000,
                len: NET_HDR_LEN as u32,
                flags: VIRTQ_DESC_F_NEXT,
                next: 1,
            },
        );
        set_desc(
            &mem,
            0x2000,
            1,
            Desc {
                addr: 0x9000,
                len: 5,
                flags: 0,
                next: 0,
            },
        );
        make_available(&mem, 0x2000, 0);

        assert!(net.notify(&mem, &mut queues, TX_QUEUE));
        assert_eq!(*frames.0.lock(), vec![b"frame".to_vec()]);
    }

    #[test]
    fn short_transmit_is_dropped() {
        let mem = memory();
        let frames = Frames::default();
        let mut net = Net::new(Box::new(frames.clone()), MAC);
        let mut queues = [None, Some(queue(&mem, 0x2000))];
        set_desc(
            &mem,
            0x2000,
            0,
            Desc {
                addr: 0x8000,
                len: 4,
                flags: 0,
                next: 0,
            },
        );
        make_available(&mem, 0x2000, 0);
        // The chain is still consumed.
        assert!(net.notify(&mem, &mut queues, TX_QUEUE));
        assert!(frames.0.lock().is_empty());
    }

    #[test]
    fn oversized_transmit_is_dropped() {
        let mem = memory();
        let frames = Frames::default();
        let mut net = Net::new(Box::new(frames.clone()), MAC);
        let mut queues = [None, Some(queue(&mem, 0x2000))];
        // Four descriptors reusing the same 32 KiB buffer add up to 128 KiB.
        for i in 0..4u16 {
            set_desc(
                &mem,
                0x2000,
                i,
                Desc {
                    addr: 0x8000,
                    len: 0x8000,
                    flags: if i < 3 { VIRTQ_DESC_F_NEXT } else { 0 },
                    next: i + 1,
                },
            );
        }
        make_available(&mem, 0x2000, 0);
        assert!(net.notify(&mem, &mut queues, TX_QUEUE));
        assert!(frames.0.lock().is_empty());
        let used_idx: u16 = mem.read_obj_from_addr(GuestAddress(0x2202)).unwrap();
        assert_eq!(used_idx, 1);
    }

    #[test]
    fn receive_prepends_header() {
        let mem = memory();
        let mut net = Net::new(Box::new(Frames::default()), MAC);
        let mut queues = [Some(queue(&mem, 0x1000)), None];

        assert!(!net.backend_input(&mem, &mut queues, &[0xab; 20]));
        assert_eq!(net.pending_frames(), 1);

        set_desc(
            &mem,
            0x1000,
            0,
            Desc {
                addr: 0xa000,
                len: 1514,
                flags: VIRTQ_DESC_F_WRITE,
                next: 0,
            },
        );
        make_available(&mem, 0x1000, 0);
        assert!(net.notify(&mem, &mut queues, RX_QUEUE));
        assert_eq!(net.pending_frames(), 0);

        let hdr: virtio_net_hdr_v1 = mem.read_obj_from_addr(GuestAddress(0xa000)).unwrap();
        assert_eq!(u16::from_le(hdr.num_buffers), 1);
        assert_eq!(hdr.flags, 0);
        let mut payload = [0u8; 20];
        mem.read_exact_at_addr(&mut payload, GuestAddress(0xa000 + NET_HDR_LEN as u64))
            .unwrap();
        assert_eq!(payload, [0xab; 20]);
        let used_len: u32 = mem.read_obj_from_addr(GuestAddress(0x1208)).unwrap();
        assert_eq!(used_len as usize, NET_HDR_LEN + 20);
    }

    #[test]
    fn features_and_config() {
        let mut net = Net::new(Box::new(Frames::default()), MAC);
        assert_eq!(net.features(), (1 << 32) | (1 << 5) | (1 << 16));
        net.ack_features(1 << 32);
        assert_eq!(net.acked_features(), 1 << 32);
        let mut data = [0u8; 8];
        net.read_config(0, &mut data);
        assert_eq!(&data[..6], &MAC);
        assert_eq!(&data[6..], &[1, 0]);
    }

    #[test]
    fn backlog_is_bounded() {
        let mem = memory();
        let mut net = Net::new(Box::new(Frames::default()), MAC);
        let mut queues = [None, None];
        for _ in 0..MAX_PENDING_FRAMES + 3 {
            net.backend_input(&mem, &mut queues, &[0; 60]);
        }
        assert_eq!(net.pending_frames(), MAX_PENDING_FRAMES);
        net.reset();
        assert_eq!(net.pending_frames(), 0);
    }
}
