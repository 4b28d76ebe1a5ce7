//! Split virtqueue engine (L1).
//!
//! Carves a caller-supplied, zero-initialized DMA buffer into the
//! descriptor table / available ring / used ring regions (§3, §4.4 of
//! `SPEC_FULL.md`) and drives the driver-side half of the split-ring
//! protocol: descriptor allocation, scatter-gather chain assembly, used-ring
//! reclamation, and Event Index notification suppression.
//!
//! Every access to device-shared memory goes through `read_volatile`/
//! `write_volatile` with an explicit barrier at each protocol boundary,
//! generalizing the teacher's `MmioRegs::read`/`write` volatile-access
//! discipline (`virtio/mod.rs`) from MMIO registers to ring memory.
//!
//! Not thread-safe: one producer drives `alloc_desc`/`submit_chain`/
//! `free_desc`/`free_chain`, one consumer (the ISR) drives `has_used`/
//! `pop_used`. Concurrent callers must serialize externally.

use core::marker::PhantomData;
use core::mem::size_of;
use core::ptr;

use bitflags::bitflags;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{Error, Result};
use crate::hal::{Hal, PhysAddr};
use crate::iovec::IoVec;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescFlags: u16 {
        /// Buffer continues via `next`.
        const NEXT     = 1;
        /// Device writes into this buffer (vs. reads from it).
        const WRITE    = 2;
        /// Buffer is a list of further descriptors (not implemented by this core).
        const INDIRECT = 4;
    }
}

/// One 16-byte split-ring descriptor, laid out exactly as the device expects.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
pub struct Desc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}
const_assert_eq!(size_of::<Desc>(), 16);

/// Sentinel `next` value marking the tail of the free list.
const FREE_LIST_END: u16 = 0xFFFF;

/// One used-ring element: a completed chain's head index and byte count.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
pub struct UsedElem {
    pub id: u32,
    pub len: u32,
}
const_assert_eq!(size_of::<UsedElem>(), 8);

const DESC_ALIGN: usize = 16;
const AVAIL_ALIGN: usize = 2;
const USED_ALIGN: usize = 4;

pub const QUEUE_SIZE_MAX: u16 = 1 << 15; // 32768, largest power of two representable as documented

const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Byte size of the DMA region a virtqueue of `queue_size` descriptors needs.
///
/// Deterministic and independent of call count; the result is always
/// aligned to [`USED_ALIGN`].
pub const fn required_size(queue_size: u16, event_idx: bool) -> usize {
    let qs = queue_size as usize;
    let desc_region = DESC_ALIGN * qs;
    let avail_region = 4 + 2 * qs + if event_idx { 2 } else { 0 };
    let used_region = 4 + 8 * qs + if event_idx { 2 } else { 0 };

    let after_desc = align_up(desc_region, DESC_ALIGN);
    let after_avail = align_up(after_desc + avail_region, AVAIL_ALIGN);
    let used_start = align_up(after_avail, USED_ALIGN);
    used_start + used_region
}

const fn is_pow2_in_range(n: u16) -> bool {
    n != 0 && n <= QUEUE_SIZE_MAX && (n & (n - 1)) == 0
}

/// `event` lies in the half-open window `(old, new]` under u16 wraparound
/// arithmetic. Used both for kick suppression (`kick()` in the block layer)
/// and, symmetrically, is the shape of the watermark check the device
/// itself performs against `avail.used_event`.
pub fn vring_need_event(event: u16, new_idx: u16, old_idx: u16) -> bool {
    new_idx.wrapping_sub(event).wrapping_sub(1) < new_idx.wrapping_sub(old_idx)
}

/// Raw byte-offset view over the available ring region. The ring length is
/// a runtime quantity (`queue_size`), so unlike [`Desc`] this cannot be a
/// single `#[repr(C)]` type; offsets are computed by hand instead.
struct AvailView {
    base: *mut u8,
    queue_size: u16,
    event_idx: bool,
}

impl AvailView {
    fn idx_ptr(&self) -> *mut u16 {
        // SAFETY: `base + 2` is within the avail region for any queue_size >= 1.
        unsafe { self.base.add(2).cast() }
    }

    fn ring_ptr(&self, slot: u16) -> *mut u16 {
        debug_assert!(slot < self.queue_size);
        // SAFETY: slot < queue_size keeps this within the ring array.
        unsafe { self.base.add(4 + 2 * slot as usize).cast() }
    }

    fn used_event_ptr(&self) -> Option<*mut u16> {
        if !self.event_idx {
            return None;
        }
        // SAFETY: only called when the trailing used_event field was sized in.
        Some(unsafe { self.base.add(4 + 2 * self.queue_size as usize).cast() })
    }
}

struct UsedView {
    base: *mut u8,
    queue_size: u16,
    event_idx: bool,
}

impl UsedView {
    fn idx_ptr(&self) -> *mut u16 {
        // SAFETY: `base + 2` is within the used region for any queue_size >= 1.
        unsafe { self.base.add(2).cast() }
    }

    fn elem_ptr(&self, slot: u16) -> *mut UsedElem {
        debug_assert!(slot < self.queue_size);
        // SAFETY: slot < queue_size keeps this within the ring array.
        unsafe { self.base.add(4 + 8 * slot as usize).cast() }
    }

    fn avail_event_ptr(&self) -> Option<*mut u16> {
        if !self.event_idx {
            return None;
        }
        // SAFETY: only called when the trailing avail_event field was sized in.
        Some(unsafe { self.base.add(4 + 8 * self.queue_size as usize).cast() })
    }
}

/// Driver-side half of one split virtqueue, carved out of a caller-supplied
/// DMA buffer.
///
/// Move-only: no `Clone`/`Copy` impl, matching §5's "transport, virtqueue,
/// and block device must not be copied".
pub struct VirtQueue<H: Hal> {
    queue_size: u16,
    event_idx: bool,

    desc_base: *mut u8,
    avail: AvailView,
    used: UsedView,

    /// Physical base of the whole DMA region, for programming transport registers.
    phys_base: PhysAddr,

    free_head: u16,
    num_free: u16,

    /// Driver's local copy of `avail.idx`; only the driver writes this field
    /// on the wire, so caching it avoids a volatile read on every submit.
    avail_idx: u16,
    last_used_idx: u16,

    _hal: PhantomData<H>,
}

impl<H: Hal> VirtQueue<H> {
    /// Build a virtqueue over `dma_buf`, a zero-initialized, page-aligned
    /// buffer of at least [`required_size`] bytes.
    ///
    /// # Safety
    ///
    /// `dma_buf` must be valid for reads and writes for its full length for
    /// as long as the returned `VirtQueue` (and the device it is handed to)
    /// is alive, must be zero-initialized, and must not alias any other
    /// live reference.
    pub unsafe fn new(dma_buf: *mut u8, queue_size: u16, event_idx: bool) -> Result<Self> {
        if !is_pow2_in_range(queue_size) {
            return Err(Error::QueueTooLarge);
        }
        if dma_buf.is_null() || (dma_buf as usize) % DESC_ALIGN != 0 {
            return Err(Error::InvalidArgument);
        }

        let desc_region = DESC_ALIGN * queue_size as usize;
        let after_desc = align_up(desc_region, DESC_ALIGN);
        let avail_region = 4 + 2 * queue_size as usize + if event_idx { 2 } else { 0 };
        let after_avail = align_up(after_desc + avail_region, AVAIL_ALIGN);
        let used_start = align_up(after_avail, USED_ALIGN);

        // SAFETY: offsets stay within `required_size(queue_size, event_idx)`,
        // which the caller guaranteed `dma_buf` is at least that large.
        let avail_base = unsafe { dma_buf.add(after_desc) };
        let used_base = unsafe { dma_buf.add(used_start) };

        let mut q = VirtQueue {
            queue_size,
            event_idx,
            desc_base: dma_buf,
            avail: AvailView {
                base: avail_base,
                queue_size,
                event_idx,
            },
            used: UsedView {
                base: used_base,
                queue_size,
                event_idx,
            },
            phys_base: H::virt_to_phys(dma_buf),
            free_head: 0,
            num_free: queue_size,
            avail_idx: 0,
            last_used_idx: 0,
            _hal: PhantomData,
        };

        // SAFETY: the buffer is zero-initialized by caller contract; we
        // overwrite only the `next` links, leaving `addr`/`len`/`flags` at
        // their zeroed defaults (FREED).
        unsafe { q.init_free_list() };

        Ok(q)
    }

    unsafe fn init_free_list(&mut self) {
        for i in 0..self.queue_size {
            let next = if i + 1 == self.queue_size {
                FREE_LIST_END
            } else {
                i + 1
            };
            // SAFETY: i < queue_size.
            unsafe { self.write_desc_next(i, next) };
        }
    }

    fn desc_ptr(&self, idx: u16) -> *mut Desc {
        debug_assert!(idx < self.queue_size);
        // SAFETY: idx < queue_size keeps this within the descriptor table.
        unsafe { self.desc_base.add(DESC_ALIGN * idx as usize).cast() }
    }

    unsafe fn write_desc(&self, idx: u16, d: Desc) {
        // SAFETY: caller guarantees idx < queue_size via desc_ptr's contract.
        unsafe { ptr::write_volatile(self.desc_ptr(idx), d) };
    }

    unsafe fn read_desc(&self, idx: u16) -> Desc {
        // SAFETY: caller guarantees idx < queue_size via desc_ptr's contract.
        unsafe { ptr::read_volatile(self.desc_ptr(idx)) }
    }

    unsafe fn write_desc_next(&self, idx: u16, next: u16) {
        // SAFETY: `next` is the last field of `Desc`; writing it alone
        // through a pointer into the same memory is valid because the
        // region is already zero-initialized for the other fields.
        let ptr = unsafe { self.desc_ptr(idx).cast::<u8>().add(14).cast::<u16>() };
        unsafe { ptr::write_volatile(ptr, next) };
    }

    /// Number of descriptors not currently allocated.
    pub fn num_free(&self) -> u16 {
        self.num_free
    }

    pub fn queue_size(&self) -> u16 {
        self.queue_size
    }

    /// Guest-physical address of the descriptor table, for transport setup.
    pub fn desc_phys(&self) -> PhysAddr {
        self.phys_base
    }

    /// Guest-physical address of the available ring, for transport setup.
    pub fn avail_phys(&self) -> PhysAddr {
        let off = unsafe { self.avail.base.offset_from(self.desc_base) };
        PhysAddr(self.phys_base.0 + off as u64)
    }

    /// Guest-physical address of the used ring, for transport setup.
    pub fn used_phys(&self) -> PhysAddr {
        let off = unsafe { self.used.base.offset_from(self.desc_base) };
        PhysAddr(self.phys_base.0 + off as u64)
    }

    /// Allocate one descriptor from the free list.
    pub fn alloc_desc(&mut self) -> Result<u16> {
        if self.num_free == 0 {
            return Err(Error::NoFreeDescriptors);
        }
        let idx = self.free_head;
        // SAFETY: idx is either 0 initially or was linked in by a prior
        // free_desc/init_free_list call, so it is < queue_size.
        let next = unsafe { self.read_desc(idx) }.next;
        self.free_head = next;
        self.num_free -= 1;
        Ok(idx)
    }

    /// Return `idx` to the head of the free list.
    pub fn free_desc(&mut self, idx: u16) -> Result<()> {
        if idx >= self.queue_size {
            return Err(Error::InvalidDescriptor);
        }
        // SAFETY: idx < queue_size, just checked.
        unsafe { self.write_desc_next(idx, self.free_head) };
        self.free_head = idx;
        self.num_free += 1;
        Ok(())
    }

    /// Assemble one descriptor chain: `readable` segments first
    /// (device-readable), then `writable` segments (device-writable),
    /// publish the chain head in the available ring, and return the head
    /// index as an opaque completion handle.
    pub fn submit_chain(&mut self, readable: &[IoVec], writable: &[IoVec]) -> Result<u16> {
        let total = readable.len() + writable.len();
        if total == 0 {
            return Err(Error::InvalidArgument);
        }
        if total > self.num_free as usize {
            return Err(Error::NoFreeDescriptors);
        }

        let mut head: Option<u16> = None;
        let mut prev: Option<u16> = None;

        for (iov, write) in readable
            .iter()
            .map(|iov| (iov, false))
            .chain(writable.iter().map(|iov| (iov, true)))
        {
            // Infallible: we already checked num_free >= total above.
            let idx = self.alloc_desc().expect("capacity checked above");

            let flags = if write {
                DescFlags::NEXT | DescFlags::WRITE
            } else {
                DescFlags::NEXT
            };
            // SAFETY: idx was just allocated, so idx < queue_size.
            unsafe {
                self.write_desc(
                    idx,
                    Desc {
                        addr: iov.phys_addr,
                        len: iov.len as u32,
                        flags: flags.bits(),
                        next: 0,
                    },
                )
            };

            if let Some(p) = prev {
                // SAFETY: p < queue_size, allocated earlier this call.
                unsafe { self.write_desc_next(p, idx) };
            } else {
                head = Some(idx);
            }
            prev = Some(idx);
        }

        // Clear NEXT on the final descriptor.
        let tail = prev.expect("total > 0 checked above");
        // SAFETY: tail < queue_size.
        let mut tail_desc = unsafe { self.read_desc(tail) };
        tail_desc.flags &= !DescFlags::NEXT.bits();
        unsafe { self.write_desc(tail, tail_desc) };

        H::wmb();

        let head = head.expect("total > 0 checked above");
        let slot = self.avail_idx % self.queue_size;
        // SAFETY: slot < queue_size.
        unsafe { ptr::write_volatile(self.avail.ring_ptr(slot), head) };

        H::mb();

        self.avail_idx = self.avail_idx.wrapping_add(1);
        // SAFETY: idx_ptr is within the avail region.
        unsafe { ptr::write_volatile(self.avail.idx_ptr(), self.avail_idx) };

        Ok(head)
    }

    /// Walk the chain starting at `head`, returning every descriptor to the
    /// free list. Rejects any out-of-range index at every step so a
    /// misbehaving device cannot corrupt driver state.
    pub fn free_chain(&mut self, head: u16) -> Result<()> {
        if head >= self.queue_size {
            return Err(Error::InvalidDescriptor);
        }
        let mut idx = head;
        loop {
            // SAFETY: idx < queue_size, checked before the loop and at the
            // bottom of each iteration.
            let d = unsafe { self.read_desc(idx) };
            let has_next = d.flags & DescFlags::NEXT.bits() != 0;
            let next = d.next;

            self.free_desc(idx)?;

            if !has_next {
                break;
            }
            if next >= self.queue_size {
                return Err(Error::InvalidDescriptor);
            }
            idx = next;
        }
        Ok(())
    }

    /// True iff the device has published at least one used-ring entry we
    /// have not yet consumed.
    pub fn has_used(&self) -> bool {
        // SAFETY: idx_ptr is within the used region.
        let idx = unsafe { ptr::read_volatile(self.used.idx_ptr()) };
        self.last_used_idx != idx
    }

    /// Pop the oldest unconsumed used-ring entry.
    pub fn pop_used(&mut self) -> Result<(u16, u32)> {
        if !self.has_used() {
            return Err(Error::NoUsedBuffers);
        }
        let slot = self.last_used_idx % self.queue_size;
        // SAFETY: slot < queue_size.
        let elem = unsafe { ptr::read_volatile(self.used.elem_ptr(slot)) };
        self.last_used_idx = self.last_used_idx.wrapping_add(1);
        Ok((elem.id as u16, elem.len))
    }

    /// Current driver-local avail index (for kick-suppression bookkeeping).
    pub fn avail_idx(&self) -> u16 {
        self.avail_idx
    }

    pub fn last_used_idx(&self) -> u16 {
        self.last_used_idx
    }

    /// The device-written `avail_event` watermark, if EVENT_IDX was negotiated.
    pub fn read_avail_event(&self) -> Option<u16> {
        self.used
            .avail_event_ptr()
            // SAFETY: pointer is within the used region when Some.
            .map(|p| unsafe { ptr::read_volatile(p) })
    }

    /// Write the driver's consumption watermark into the available ring's
    /// trailing `used_event` field, if EVENT_IDX was negotiated.
    pub fn write_used_event(&mut self, value: u16) {
        if let Some(p) = self.avail.used_event_ptr() {
            // SAFETY: pointer is within the avail region.
            unsafe { ptr::write_volatile(p, value) };
        }
    }

    /// Script the device side of the ring: publish one used-ring entry and
    /// bump the device-owned `idx`, for tests that exercise block-layer
    /// completion handling without a real device.
    #[cfg(test)]
    pub(crate) fn test_publish_used(&mut self, head: u16, len: u32) {
        // SAFETY: idx_ptr is within the used region.
        let cur = unsafe { ptr::read_volatile(self.used.idx_ptr()) };
        let slot = cur % self.queue_size;
        // SAFETY: slot < queue_size.
        unsafe { ptr::write_volatile(self.used.elem_ptr(slot), UsedElem { id: head as u32, len }) };
        H::wmb();
        // SAFETY: idx_ptr is within the used region.
        unsafe { ptr::write_volatile(self.used.idx_ptr(), cur.wrapping_add(1)) };
    }

    /// Write the device's `avail_event` watermark directly, for
    /// notification-suppression tests.
    #[cfg(test)]
    pub(crate) fn test_set_avail_event(&mut self, value: u16) {
        if let Some(p) = self.used.avail_event_ptr() {
            // SAFETY: pointer is within the used region.
            unsafe { ptr::write_volatile(p, value) };
        }
    }
}
