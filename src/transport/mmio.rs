//! VirtIO 1.0+ modern MMIO register-file transport.
//!
//! Generalizes the teacher's `MmioRegs` register enum and volatile
//! `read`/`write` pair (`virtio/mod.rs`) from the legacy 32-bit layout
//! (magic-only validation, `version == 1`, page-frame-number queue
//! programming) to the modern layout: 64-bit windowed feature access,
//! `queue_ready` instead of a PFN, split descriptor/driver/device address
//! registers, and a generation-counter-guarded configuration space.

use core::marker::PhantomData;
use core::ptr;

use crate::error::{Error, Result};
use crate::hal::{Hal, PhysAddr};

/// `"virt"` in little-endian ASCII.
const MAGIC: u32 = 0x7472_6976;
/// The only version this transport speaks.
const MODERN_VERSION: u32 = 2;
/// Bounded retry count for the configuration-space generation-counter loop.
const CONFIG_GEN_RETRY_LIMIT: u32 = 1000;

#[repr(usize)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
enum Reg {
    Magic = 0x000,
    Version = 0x004,
    DeviceId = 0x008,
    VendorId = 0x00C,
    DeviceFeatures = 0x010,
    DeviceFeaturesSel = 0x014,
    DriverFeatures = 0x020,
    DriverFeaturesSel = 0x024,
    QueueSel = 0x030,
    QueueNumMax = 0x034,
    QueueNum = 0x038,
    QueueReady = 0x044,
    QueueNotify = 0x050,
    InterruptStatus = 0x060,
    InterruptAck = 0x064,
    Status = 0x070,
    QueueDescLow = 0x080,
    QueueDescHigh = 0x084,
    QueueDriverLow = 0x090,
    QueueDriverHigh = 0x094,
    QueueDeviceLow = 0x0A0,
    QueueDeviceHigh = 0x0A4,
    ConfigGeneration = 0x0FC,
    Config = 0x100,
}

/// A validated MMIO register window for one VirtIO device.
///
/// Move-only: no `Clone`/`Copy` impl. A transport that failed validation at
/// construction reports `is_valid() == false` and every other method is a
/// no-op returning a zeroed value; callers must check `is_valid()` before
/// relying on anything else.
pub struct MmioTransport<H: Hal> {
    base: *mut u8,
    valid: bool,
    device_id: u32,
    vendor_id: u32,
    _hal: PhantomData<H>,
    #[cfg(test)]
    notify_calls: core::cell::Cell<u32>,
}

impl<H: Hal> MmioTransport<H> {
    fn invalid() -> Self {
        Self {
            base: core::ptr::null_mut(),
            valid: false,
            device_id: 0,
            vendor_id: 0,
            _hal: PhantomData,
            #[cfg(test)]
            notify_calls: core::cell::Cell::new(0),
        }
    }

    /// Validate `mmio_base` as a modern VirtIO MMIO device.
    ///
    /// # Safety
    ///
    /// `mmio_base` must either be null or point to a valid, live MMIO
    /// register window of at least 0x100 bytes (plus device-specific
    /// configuration space beyond that), mapped for volatile byte/word
    /// access for the lifetime of the returned transport.
    pub unsafe fn new(mmio_base: *mut u8) -> Self {
        if mmio_base.is_null() {
            return Self::invalid();
        }

        let mut t = Self {
            base: mmio_base,
            valid: false,
            device_id: 0,
            vendor_id: 0,
            _hal: PhantomData,
            #[cfg(test)]
            notify_calls: core::cell::Cell::new(0),
        };

        // SAFETY: base is non-null and the caller's contract covers the
        // fixed register window read here.
        let magic = unsafe { t.read_reg(Reg::Magic) };
        if magic != MAGIC {
            H::log(log::Level::Warn, format_args!("virtio mmio: bad magic {magic:#x}"));
            return Self::invalid();
        }

        let version = unsafe { t.read_reg(Reg::Version) };
        if version != MODERN_VERSION {
            H::log(
                log::Level::Warn,
                format_args!("virtio mmio: unsupported version {version}, want modern (2)"),
            );
            return Self::invalid();
        }

        let device_id = unsafe { t.read_reg(Reg::DeviceId) };
        if device_id == 0 {
            H::log(log::Level::Warn, format_args!("virtio mmio: device id 0"));
            return Self::invalid();
        }

        let vendor_id = unsafe { t.read_reg(Reg::VendorId) };

        t.device_id = device_id;
        t.vendor_id = vendor_id;
        t.valid = true;

        // Reset the device: writing 0 to status.
        unsafe { t.write_reg(Reg::Status, 0) };

        t
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn vendor_id(&self) -> u32 {
        self.vendor_id
    }

    unsafe fn read_reg(&self, reg: Reg) -> u32 {
        // SAFETY: caller contract on `new`/construction guarantees `base`
        // covers the fixed register window these offsets index into.
        unsafe { ptr::read_volatile(self.base.add(reg as usize).cast()) }
    }

    unsafe fn write_reg(&self, reg: Reg, value: u32) {
        // SAFETY: see `read_reg`.
        unsafe { ptr::write_volatile(self.base.add(reg as usize).cast(), value) };
    }

    fn read_reg_checked(&self, reg: Reg) -> u32 {
        if !self.valid {
            return 0;
        }
        // SAFETY: `valid` is only true after `new` validated `base`.
        unsafe { self.read_reg(reg) }
    }

    fn write_reg_checked(&self, reg: Reg, value: u32) {
        if !self.valid {
            return;
        }
        // SAFETY: see `read_reg_checked`.
        unsafe { self.write_reg(reg, value) };
    }

    /// Current device status register value.
    pub fn status(&self) -> u32 {
        self.read_reg_checked(Reg::Status)
    }

    /// Overwrite the device status register.
    pub fn set_status(&self, value: u32) {
        self.write_reg_checked(Reg::Status, value);
    }

    /// Read the 64-bit device feature set through the windowed selector.
    pub fn device_features(&self) -> u64 {
        if !self.valid {
            return 0;
        }
        self.write_reg_checked(Reg::DeviceFeaturesSel, 0);
        let lo = self.read_reg_checked(Reg::DeviceFeatures) as u64;
        self.write_reg_checked(Reg::DeviceFeaturesSel, 1);
        let hi = self.read_reg_checked(Reg::DeviceFeatures) as u64;
        lo | (hi << 32)
    }

    /// Write the 64-bit negotiated driver feature set through the windowed selector.
    pub fn set_driver_features(&self, features: u64) {
        self.write_reg_checked(Reg::DriverFeaturesSel, 0);
        self.write_reg_checked(Reg::DriverFeatures, features as u32);
        self.write_reg_checked(Reg::DriverFeaturesSel, 1);
        self.write_reg_checked(Reg::DriverFeatures, (features >> 32) as u32);
    }

    /// Maximum queue size the device allows for `queue_idx`. Zero means the
    /// queue does not exist.
    pub fn queue_num_max(&self, queue_idx: u32) -> u32 {
        if !self.valid {
            return 0;
        }
        self.write_reg_checked(Reg::QueueSel, queue_idx);
        self.read_reg_checked(Reg::QueueNumMax)
    }

    /// Program one queue's size and the guest-physical addresses of its
    /// three ring regions, then mark it ready.
    pub fn setup_queue(
        &self,
        queue_idx: u32,
        size: u16,
        desc: PhysAddr,
        avail: PhysAddr,
        used: PhysAddr,
    ) -> Result<()> {
        if !self.valid {
            return Err(Error::TransportNotInitialized);
        }
        let max = self.queue_num_max(queue_idx);
        if max == 0 {
            return Err(Error::QueueNotAvailable);
        }
        if size as u32 > max {
            return Err(Error::QueueTooLarge);
        }

        self.write_reg_checked(Reg::QueueSel, queue_idx);
        self.write_reg_checked(Reg::QueueNum, size as u32);
        self.write_reg_checked(Reg::QueueDescLow, desc.as_u64() as u32);
        self.write_reg_checked(Reg::QueueDescHigh, (desc.as_u64() >> 32) as u32);
        self.write_reg_checked(Reg::QueueDriverLow, avail.as_u64() as u32);
        self.write_reg_checked(Reg::QueueDriverHigh, (avail.as_u64() >> 32) as u32);
        self.write_reg_checked(Reg::QueueDeviceLow, used.as_u64() as u32);
        self.write_reg_checked(Reg::QueueDeviceHigh, (used.as_u64() >> 32) as u32);
        self.write_reg_checked(Reg::QueueReady, 1);
        Ok(())
    }

    /// Ring the notification bell for `queue_idx`. Always safe to call;
    /// the block layer is responsible for notification-suppression policy.
    pub fn notify(&self, queue_idx: u32) {
        #[cfg(test)]
        self.notify_calls.set(self.notify_calls.get() + 1);
        self.write_reg_checked(Reg::QueueNotify, queue_idx);
    }

    #[cfg(test)]
    pub(crate) fn notify_count_for_test(&self) -> u32 {
        self.notify_calls.get()
    }

    /// Raw interrupt-status register: bit 0 = used buffer, bit 1 = config change.
    pub fn interrupt_status(&self) -> u32 {
        self.read_reg_checked(Reg::InterruptStatus)
    }

    /// Acknowledge the given interrupt-status bits.
    pub fn interrupt_ack(&self, bits: u32) {
        self.write_reg_checked(Reg::InterruptAck, bits);
    }

    fn config_generation(&self) -> u32 {
        self.read_reg_checked(Reg::ConfigGeneration)
    }

    fn read_config_u32_raw(&self, offset: usize) -> u32 {
        if !self.valid {
            return 0;
        }
        // SAFETY: `valid` implies `base` covers the fixed register window;
        // the device-specific config space begins right after it and the
        // caller is responsible for `offset` staying within it.
        unsafe { ptr::read_volatile(self.base.add(Reg::Config as usize + offset).cast()) }
    }

    /// Read one `u32` from device configuration space (no generation guard
    /// needed: a single 32-bit read cannot observe a torn update).
    pub fn read_config_u32(&self, offset: usize) -> u32 {
        self.read_config_u32_raw(offset)
    }

    /// Read one `u64` from device configuration space, retrying while a
    /// concurrent configuration update is detected via the generation
    /// counter, bounded at [`CONFIG_GEN_RETRY_LIMIT`] attempts.
    pub fn read_config_u64(&self, offset: usize) -> u64 {
        if !self.valid {
            return 0;
        }
        let mut value = 0u64;
        for _ in 0..CONFIG_GEN_RETRY_LIMIT {
            let before = self.config_generation();
            let lo = self.read_config_u32_raw(offset) as u64;
            let hi = self.read_config_u32_raw(offset + 4) as u64;
            value = lo | (hi << 32);
            let after = self.config_generation();
            if before == after {
                return value;
            }
        }
        H::log(
            log::Level::Warn,
            format_args!("virtio mmio: config generation unstable after {CONFIG_GEN_RETRY_LIMIT} retries"),
        );
        value
    }
}

impl<H: Hal> super::Transport for MmioTransport<H> {
    fn is_valid(&self) -> bool {
        self.is_valid()
    }
    fn device_id(&self) -> u32 {
        self.device_id()
    }
    fn vendor_id(&self) -> u32 {
        self.vendor_id()
    }
    fn status(&self) -> u32 {
        self.status()
    }
    fn set_status(&self, value: u32) {
        self.set_status(value)
    }
    fn device_features(&self) -> u64 {
        self.device_features()
    }
    fn set_driver_features(&self, features: u64) {
        self.set_driver_features(features)
    }
    fn queue_num_max(&self, queue_idx: u32) -> u32 {
        self.queue_num_max(queue_idx)
    }
    fn setup_queue(
        &self,
        queue_idx: u32,
        size: u16,
        desc: PhysAddr,
        avail: PhysAddr,
        used: PhysAddr,
    ) -> Result<()> {
        self.setup_queue(queue_idx, size, desc, avail, used)
    }
    fn notify(&self, queue_idx: u32) {
        self.notify(queue_idx)
    }
    fn interrupt_status(&self) -> u32 {
        self.interrupt_status()
    }
    fn interrupt_ack(&self, bits: u32) {
        self.interrupt_ack(bits)
    }
    fn read_config_u32(&self, offset: usize) -> u32 {
        self.read_config_u32(offset)
    }
    fn read_config_u64(&self, offset: usize) -> u64 {
        self.read_config_u64(offset)
    }
}
