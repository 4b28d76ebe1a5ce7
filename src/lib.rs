//! VirtIO 1.0+ modern MMIO transport, split virtqueue, and block device
//! driver core for freestanding (bare-metal / kernel) environments.
//!
//! Three layers, each usable on its own:
//!
//! - [`hal`] — the five platform capabilities the core needs (barriers,
//!   address translation, logging), expressed as a zero-sized marker type
//!   implementing [`hal::Hal`]; dispatch is always static, never a vtable.
//! - [`transport::mmio`] and [`queue`] — the register-file handshake and
//!   the split-ring engine, generic over `H: Hal`.
//! - [`init`] and [`block`] — the device-initialization sequence and the
//!   block-device request-slot pool built on top.
//!
//! Nothing here allocates; every buffer (MMIO window, virtqueue DMA region,
//! request-slot storage) is caller-provided or embedded by value.

#![cfg_attr(not(test), no_std)]

pub mod block;
pub mod error;
pub mod feature;
pub mod hal;
pub mod init;
pub mod iovec;
pub mod queue;
pub mod transport;

pub use block::{BlkConfig, RequestStatus, RequestType, Stats, VirtioBlk};
pub use error::{Category, Error, Result};
pub use feature::{Features, Status};
pub use hal::{Hal, NullHal, PhysAddr};
pub use init::{activate, negotiate, setup_queue};
pub use iovec::IoVec;
pub use queue::{required_size, vring_need_event, VirtQueue};
pub use transport::{MmioTransport, Transport};
