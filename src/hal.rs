//! Platform traits (L0).
//!
//! The core consumes exactly five capabilities from its host environment:
//! logging, three memory barriers, and the two directions of guest-physical
//! <-> driver-virtual address translation. Everything else (UART, ACPI, PCI,
//! interrupt controllers) is an external collaborator this crate does not
//! touch.
//!
//! [`Hal`] is implemented by a zero-sized marker type and dispatched
//! statically, the way the teacher crate dispatches over its `Arch` marker
//! type rather than a trait object — every virtqueue/transport/block device
//! instantiation monomorphizes to direct calls, matching the "no run-time
//! dispatch needed" design note.

use core::fmt;

/// A guest-physical address, as seen by the device. Distinct from a driver
/// virtual pointer so the two cannot be confused at a call site; crossing
/// between them always goes through [`Hal::virt_to_phys`] /
/// [`Hal::phys_to_virt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Platform capabilities the VirtIO core needs and nothing more.
///
/// # Safety
///
/// Implementors must ensure:
/// - `mb`/`rmb`/`wmb` are real fences for the memory this crate shares with
///   the device: no implementation may allow the compiler *or* the CPU to
///   reorder device-shared accesses across the barrier.
/// - `virt_to_phys`/`phys_to_virt` are inverses of one another over the
///   lifetime of any buffer handed to the device.
pub unsafe trait Hal {
    /// Full memory barrier: orders both reads and writes on both sides.
    fn mb();

    /// Read memory barrier: orders reads before the barrier against reads
    /// after it.
    fn rmb();

    /// Write memory barrier: orders writes before the barrier against writes
    /// after it.
    fn wmb();

    /// Translate a driver-side virtual address of DMA-allocated memory into
    /// the guest-physical address the device will see.
    fn virt_to_phys(ptr: *const u8) -> PhysAddr;

    /// Inverse of [`Hal::virt_to_phys`].
    fn phys_to_virt(addr: PhysAddr) -> *mut u8;

    /// Emit one diagnostic line. Never fails observably; a platform with no
    /// logging sink simply drops it.
    fn log(level: log::Level, args: fmt::Arguments<'_>) {
        log::log!(level, "{args}");
    }
}

/// A no-op [`Hal`] for freestanding targets (or tests) where address
/// translation is the identity map, barriers are plain compiler fences, and
/// logging goes to the `log` facade's installed logger, if any.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullHal;

// SAFETY: the identity map is trivially bijective, and a full compiler
// fence is a conservative (if non-optimal) memory barrier on every target.
unsafe impl Hal for NullHal {
    #[inline]
    fn mb() {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }

    #[inline]
    fn rmb() {
        core::sync::atomic::fence(core::sync::atomic::Ordering::Acquire);
    }

    #[inline]
    fn wmb() {
        core::sync::atomic::fence(core::sync::atomic::Ordering::Release);
    }

    #[inline]
    fn virt_to_phys(ptr: *const u8) -> PhysAddr {
        PhysAddr(ptr as u64)
    }

    #[inline]
    fn phys_to_virt(addr: PhysAddr) -> *mut u8 {
        addr.0 as *mut u8
    }
}
