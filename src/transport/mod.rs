//! Transport layer (L1): owns the register file for one VirtIO device.
//!
//! Only the modern MMIO transport is implemented; PCI is an external
//! collaborator excluded by this crate's scope (§1 Non-goals). [`Transport`]
//! exists so the device-initialization handshake (`crate::init`) can run
//! identically against the real [`mmio::MmioTransport`] and, in this crate's
//! own tests, a software fake that can *react* to a feature-negotiation
//! attempt the way a real device's firmware would — a flat MMIO byte
//! buffer cannot express that reaction, only live hardware or a stand-in
//! `Transport` impl can. This mirrors the real `virtio-drivers` crate's
//! `Transport` trait (the family of crate RedHatOnTop's kernel already
//! depends on for this exact device), not speculative generality: the base
//! spec's "no run-time dispatch needed" is honored because every call site
//! is monomorphized over a concrete `T: Transport`, never a trait object.
//! [`crate::block::VirtioBlk`] itself stays concretely typed over
//! [`mmio::MmioTransport`], matching the `VirtioBlk::create(mmio_base, ...)`
//! signature the base spec names.

use crate::error::Result;
use crate::hal::PhysAddr;

pub mod mmio;

#[cfg(test)]
pub(crate) mod fake;

pub use mmio::MmioTransport;

/// Register-file operations the device-initialization handshake and block
/// device need from a transport, independent of the wire protocol
/// underneath (MMIO here; PCI is out of scope).
pub trait Transport {
    fn is_valid(&self) -> bool;
    fn device_id(&self) -> u32;
    fn vendor_id(&self) -> u32;

    fn status(&self) -> u32;
    fn set_status(&self, value: u32);

    fn device_features(&self) -> u64;
    fn set_driver_features(&self, features: u64);

    fn queue_num_max(&self, queue_idx: u32) -> u32;
    fn setup_queue(
        &self,
        queue_idx: u32,
        size: u16,
        desc: PhysAddr,
        avail: PhysAddr,
        used: PhysAddr,
    ) -> Result<()>;

    fn notify(&self, queue_idx: u32);

    fn interrupt_status(&self) -> u32;
    fn interrupt_ack(&self, bits: u32);

    fn read_config_u32(&self, offset: usize) -> u32;
    fn read_config_u64(&self, offset: usize) -> u64;
}
