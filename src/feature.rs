//! VirtIO status and feature bit constants.
//!
//! Generalizes the teacher's `VirtIOStatus`/`VirtIOFeatures` `bitflags!`
//! blocks (`virtio/mod.rs`) from the legacy 32-bit feature word to the
//! modern 64-bit feature set, and adds the block-device-specific bits the
//! config space and request marshalling need.

use bitflags::bitflags;

bitflags! {
    /// Device status register bits (cumulative, §4.3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u32 {
        const ACKNOWLEDGE        = 0x01;
        const DRIVER             = 0x02;
        const DRIVER_OK          = 0x04;
        const FEATURES_OK        = 0x08;
        const DEVICE_NEEDS_RESET = 0x40;
        const FAILED             = 0x80;
    }
}

bitflags! {
    /// 64-bit negotiable feature set. Reserved (ring-mechanics) bits plus
    /// the block-device-specific bits this core acts on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u64 {
        /// Device is read-only.
        const BLK_RO          = 1 << 5;
        /// Cache flush command is supported.
        const BLK_FLUSH       = 1 << 9;
        /// Device exports multiple virtqueues (advertised only; not implemented).
        const BLK_MQ          = 1 << 12;

        /// Negotiating buffers with INDIRECT_DESC is declared but not implemented.
        const INDIRECT_DESC = 1 << 28;
        /// Enables used_event / avail_event notification suppression.
        const EVENT_IDX     = 1 << 29;
        /// Required: selects the VirtIO 1.0+ modern layout and semantics.
        const VERSION_1     = 1 << 32;
        /// Packed virtqueue layout; declared, not implemented.
        const RING_PACKED   = 1 << 34;
    }
}

/// Interrupt-status register bits (§4.2).
pub mod isr {
    pub const USED_BUFFER: u32 = 0b01;
    pub const CONFIG_CHANGE: u32 = 0b10;
}
