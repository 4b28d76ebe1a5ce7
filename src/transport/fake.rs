//! Software `Transport` fake for exercising [`crate::init::negotiate`]
//! without real MMIO hardware.
//!
//! A flat byte buffer can only store what the driver last wrote; it cannot
//! play the *device's* role of deciding whether to keep `FEATURES_OK` set,
//! because that decision happens in device firmware, not in memory. This
//! fake plays that role directly, the same way the real `virtio-drivers`
//! crate's test-only fake transport does.

use core::cell::Cell;

use crate::error::Result;
use crate::feature::Status;
use crate::hal::PhysAddr;
use crate::transport::Transport;

pub(crate) struct FakeTransport {
    device_features: u64,
    /// Bits the simulated device insists on seeing in the negotiated set;
    /// anything else gets `FEATURES_OK` revoked on step 6 of the handshake.
    required_features: u64,
    status: Cell<u32>,
    driver_features: Cell<u64>,
    queue_max: u32,
    notified: Cell<u32>,
}

impl FakeTransport {
    pub(crate) fn new(device_features: u64, required_features: u64) -> Self {
        Self {
            device_features,
            required_features,
            status: Cell::new(0),
            driver_features: Cell::new(0),
            queue_max: 8,
            notified: Cell::new(0),
        }
    }

    pub(crate) fn notified_count(&self) -> u32 {
        self.notified.get()
    }
}

impl Transport for FakeTransport {
    fn is_valid(&self) -> bool {
        true
    }
    fn device_id(&self) -> u32 {
        2
    }
    fn vendor_id(&self) -> u32 {
        0x1af4
    }

    fn status(&self) -> u32 {
        self.status.get()
    }

    fn set_status(&self, value: u32) {
        if value & Status::FEATURES_OK.bits() != 0
            && self.driver_features.get() & self.required_features != self.required_features
        {
            self.status.set(value & !Status::FEATURES_OK.bits());
            return;
        }
        self.status.set(value);
    }

    fn device_features(&self) -> u64 {
        self.device_features
    }

    fn set_driver_features(&self, features: u64) {
        self.driver_features.set(features);
    }

    fn queue_num_max(&self, _queue_idx: u32) -> u32 {
        self.queue_max
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

    fn notify(&self, _queue_idx: u32) {
        self.notified.set(self.notified.get() + 1);
    }

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
