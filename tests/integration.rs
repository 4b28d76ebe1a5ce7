//! Black-box scenarios driven entirely through the public API, matching the
//! end-to-end behavior a caller assembling a real MMIO device and DMA
//! buffer would observe. Offsets used here are the VirtIO 1.0 modern MMIO
//! register layout and split-ring memory layout (magic/version/device-id at
//! fixed byte offsets; descriptor table, then available ring, then used
//! ring, each aligned per the wire format) — protocol knowledge, not this
//! crate's internals.

use virtio_drv::{
    activate, negotiate, required_size, setup_queue, Error, Features, IoVec, MmioTransport,
    NullHal, PhysAddr, Result, Status, Transport, VirtQueue,
};

const REG_MAGIC: usize = 0x000;
const REG_VERSION: usize = 0x004;
const REG_DEVICE_ID: usize = 0x008;
const REG_QUEUE_SEL: usize = 0x030;
const REG_QUEUE_NUM_MAX: usize = 0x034;

const MAGIC: u32 = 0x7472_6976;
const MODERN_VERSION: u32 = 2;

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
}

fn mock_mmio_region(device_id: u32, queue_num_max: u32) -> Vec<u8> {
    let mut region = vec![0u8; 0x200];
    write_u32(&mut region, REG_MAGIC, MAGIC);
    write_u32(&mut region, REG_VERSION, MODERN_VERSION);
    write_u32(&mut region, REG_DEVICE_ID, device_id);
    write_u32(&mut region, REG_QUEUE_SEL, 0);
    write_u32(&mut region, REG_QUEUE_NUM_MAX, queue_num_max);
    region
}

#[test]
fn mmio_handshake_round_trip() {
    let _ = env_logger::try_init();
    let mut region = mock_mmio_region(2, 256);
    let transport = unsafe { MmioTransport::<NullHal>::new(region.as_mut_ptr()) };
    assert!(transport.is_valid());
    assert_eq!(transport.device_id(), 2);

    let negotiated =
        negotiate::<NullHal, _>(&transport, (Features::VERSION_1 | Features::EVENT_IDX).bits())
            .unwrap();
    // The mock region offers no features (zeroed DeviceFeatures register),
    // so the intersection with whatever the driver asked for is empty —
    // this just exercises that the handshake completes and FEATURES_OK
    // stays set when nothing in the driver's request is actually required.
    assert!(negotiated.is_empty() || negotiated.contains(Features::VERSION_1));

    setup_queue(
        &transport,
        0,
        128,
        PhysAddr(0x1000),
        PhysAddr(0x2000),
        PhysAddr(0x3000),
    )
    .unwrap();

    activate(&transport).unwrap();
    assert_ne!(transport.status() & Status::DRIVER_OK.bits(), 0);
}

#[test]
fn legacy_version_is_rejected_end_to_end() {
    let mut region = mock_mmio_region(2, 256);
    write_u32(&mut region, REG_VERSION, 1);
    let transport = unsafe { MmioTransport::<NullHal>::new(region.as_mut_ptr()) };
    assert!(!transport.is_valid());
    assert_eq!(
        negotiate::<NullHal, _>(&transport, Features::VERSION_1.bits()),
        Err(Error::TransportNotInitialized)
    );
}

#[test]
fn oversized_queue_is_rejected_before_touching_registers() {
    let mut region = mock_mmio_region(2, 64);
    let transport = unsafe { MmioTransport::<NullHal>::new(region.as_mut_ptr()) };
    assert_eq!(
        setup_queue(&transport, 0, 128, PhysAddr(0), PhysAddr(0), PhysAddr(0)),
        Err(Error::QueueTooLarge)
    );
}

/// A VirtIO split ring's memory layout, computed independently of this
/// crate's own internal helpers (descriptor table, then the available
/// ring, then the used ring, each aligned per the wire format) so this test
/// can script the used ring the way a real device would, through nothing
/// but the shared DMA buffer.
fn used_ring_offset(queue_size: u16, event_idx: bool) -> usize {
    let qs = queue_size as usize;
    let desc_region = 16 * qs;
    let avail_region = 4 + 2 * qs + if event_idx { 2 } else { 0 };
    let after_desc = (desc_region + 15) & !15;
    let after_avail = (after_desc + avail_region + 1) & !1;
    (after_avail + 3) & !3
}

#[test]
fn virtqueue_round_trip_via_submit_and_scripted_used_ring() {
    let queue_size = 8u16;
    let size = required_size(queue_size, false);
    let mut dma_buf = vec![0u8; size];
    let mut q = unsafe { VirtQueue::<NullHal>::new(dma_buf.as_mut_ptr(), queue_size, false).unwrap() };

    let payload = [0xABu8; 512];
    let dest = [0u8; 513];
    let readable = [IoVec::new(payload.as_ptr() as u64, payload.len())];
    let writable = [IoVec::new(dest.as_ptr() as u64, dest.len())];
    let head = q.submit_chain(&readable, &writable).unwrap();

    // Script the device: publish one used-ring entry for `head`.
    let used_off = used_ring_offset(queue_size, false);
    let idx_off = used_off + 2;
    let elem_off = used_off + 4; // slot 0, since this is the first completion
    dma_buf[elem_off..elem_off + 4].copy_from_slice(&(head as u32).to_ne_bytes());
    dma_buf[elem_off + 4..elem_off + 8].copy_from_slice(&513u32.to_ne_bytes());
    dma_buf[idx_off..idx_off + 2].copy_from_slice(&1u16.to_ne_bytes());

    assert!(q.has_used());
    let (completed_head, len) = q.pop_used().unwrap();
    assert_eq!(completed_head, head);
    assert_eq!(len, 513);

    q.free_chain(head).unwrap();
    assert_eq!(q.num_free(), queue_size);
}

struct RefusingTransport;

impl Transport for RefusingTransport {
    fn is_valid(&self) -> bool {
        true
    }
    fn device_id(&self) -> u32 {
        2
    }
    fn vendor_id(&self) -> u32 {
        0
    }
    fn status(&self) -> u32 {
        0
    }
    fn set_status(&self, _value: u32) {}
    fn device_features(&self) -> u64 {
        0
    }
    fn set_driver_features(&self, _features: u64) {}
    fn queue_num_max(&self, _queue_idx: u32) -> u32 {
        0
    }
    fn setup_queue(
        &self,
        _queue_idx: u32,
        _size: u16,
        _desc: PhysAddr,
        _avail: PhysAddr,
        _used: PhysAddr,
    ) -> Result<()> {
        Ok(())
    }
    fn notify(&self, _queue_idx: u32) {}
    fn interrupt_status(&self) -> u32 {
        0
    }
    fn interrupt_ack(&self, _bits: u32) {}
    fn read_config_u32(&self, _offset: usize) -> u32 {
        0
    }
    fn read_config_u64(&self, _offset: usize) -> u64 {
        0
    }
}

#[test]
fn negotiate_is_generic_over_a_caller_supplied_transport() {
    // set_status is a no-op, so FEATURES_OK never reads back set: the
    // handshake fails exactly as it would against real firmware that
    // never raises the bit. Enable env_logger so the Error::Log path
    // negotiate() takes on refusal has somewhere to go.
    let _ = env_logger::try_init();
    let transport = RefusingTransport;
    assert_eq!(
        negotiate::<NullHal, _>(&transport, Features::VERSION_1.bits()),
        Err(Error::FeatureNegotiationFailed)
    );
}
