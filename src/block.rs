//! Block device driver (L2): the VirtIO block request state machine layered
//! on one virtqueue.
//!
//! Generalizes the teacher's `VirtioDisk`/`DiskInfo` (`virtio/virtio_disk.rs`)
//! — a fixed descriptor pool, `rw()`/`intr()`, and a bitmap-based free list —
//! from the teacher's legacy three-fixed-descriptor-per-request layout to a
//! request-slot pool sized independently of the virtqueue, and from the
//! teacher's blocking-sleep completion wait (`Proc::sleep`, excluded by this
//! crate's scope) to a bounded spin plus an explicit `handle_interrupt`
//! callback path for asynchronous use.

use core::mem::size_of;

use arrayvec::ArrayVec;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{Error, Result};
use crate::feature::{isr, Features};
use crate::hal::Hal;
use crate::init;
use crate::iovec::IoVec;
use crate::queue::{vring_need_event, VirtQueue};
use crate::transport::MmioTransport;

/// Fixed size of one block-device sector.
pub const SECTOR_SIZE: usize = 512;

/// Upper bound on simultaneously in-flight requests, matching the
/// request-slot pool's fixed capacity.
pub const MAX_REQUESTS: usize = 64;

/// Fixed reply length for a `GET_ID` request.
pub const GET_ID_LEN: usize = 20;

/// Per-request scatter-gather limit: header + data buffers + status must
/// fit in one descriptor chain of at most this many segments.
pub const MAX_SEGMENTS_PER_REQUEST: usize = 18;

const STATUS_UNSET: u8 = 0xFF;
const STATUS_OK: u8 = 0;
const STATUS_IOERR: u8 = 1;
const STATUS_UNSUPP: u8 = 2;

/// Bounded spin budget for the synchronous `read_sector`/`write_sector` API.
/// Not a wall-clock timeout (this core has no notion of time): a fixed
/// number of used-ring polls, generous enough that any responsive device
/// completes well within it.
const SYNC_SPIN_LIMIT: u32 = 100_000_000;

/// VirtIO block request type codes (§5.2 of `virtio-v1.1`).
///
/// Only [`RequestType::In`] and [`RequestType::Out`] are wired into the
/// request-slot pool via [`VirtioBlk::enqueue_read`]/[`VirtioBlk::enqueue_write`].
/// The remaining variants are defined for completeness — a caller who needs
/// them assembles a descriptor chain directly against
/// [`crate::queue::VirtQueue::submit_chain`], bypassing the header/status
/// bookkeeping this module provides.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    In = 0,
    Out = 1,
    Flush = 4,
    GetId = 8,
    GetLifetime = 10,
    Discard = 11,
    WriteZeroes = 13,
    SecureErase = 14,
}

/// Completion status of one request, decoded from the device-written status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Ok,
    IoError,
    Unsupported,
}

/// One discard or write-zeroes payload segment (§5.2.6.2 of `virtio-v1.1`).
/// Defined for callers hand-assembling a `Discard`/`WriteZeroes` chain; the
/// request-slot pool does not marshal this type.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
pub struct DiscardSegment {
    pub sector: u64,
    pub num_sectors: u32,
    pub flags: u32,
}
const_assert_eq!(size_of::<DiscardSegment>(), 16);

/// The three-field request header shared byte-for-byte with the device.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
struct ReqHeader {
    type_: u32,
    reserved: u32,
    sector: u64,
}
const_assert_eq!(size_of::<ReqHeader>(), 16);

/// Device configuration space this driver reads (§5.2.4 of `virtio-v1.1`
/// covers many more fields; only capacity is needed by this core).
#[derive(Debug, Clone, Copy)]
pub struct BlkConfig {
    pub capacity_sectors: u64,
}

/// Counters describing how this device has behaved over its lifetime, for
/// diagnostics. Never affects control flow.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub queue_full_errors: u64,
    pub kicks_elided: u64,
    pub interrupts_handled: u64,
    pub bytes_transferred: u64,
    pub leaked_slots: u32,
}

/// One entry in the request-slot pool: owns the DMA-addressable header and
/// status byte for one in-flight request. Embedded by value in
/// `VirtioBlk::slots` so its address stays stable for the request's
/// lifetime without a heap allocation.
#[derive(Debug, Clone, Copy, Default)]
struct RequestSlot {
    in_use: bool,
    /// Set when a synchronous caller gave up spin-waiting on this slot; the
    /// device may still complete it later. Excluded from normal completion
    /// callbacks, released (not re-delivered) when that stale completion
    /// is eventually observed.
    leaked: bool,
    header: ReqHeader,
    status: u8,
    token: u64,
    desc_head: u16,
}

impl Default for ReqHeader {
    fn default() -> Self {
        ReqHeader { type_: 0, reserved: 0, sector: 0 }
    }
}

fn status_to_result(status: u8) -> Result<RequestStatus> {
    match status {
        STATUS_OK => Ok(RequestStatus::Ok),
        STATUS_IOERR => Err(Error::IoError),
        STATUS_UNSUPP => Err(Error::NotSupported),
        // STATUS_UNSET (0xFF) or any other value: the device published a
        // used-ring entry without writing a recognized status byte.
        _ => Err(Error::ReadFailed),
    }
}

/// A VirtIO block device: one validated [`MmioTransport`], one [`VirtQueue`],
/// and a fixed 64-slot request pool.
///
/// Move-only: no `Clone`/`Copy` impl. Built by the fallible [`VirtioBlk::create`]
/// factory, which runs the full initialization handshake and leaves no
/// partially-initialized device on the error path.
pub struct VirtioBlk<H: Hal> {
    transport: MmioTransport<H>,
    queue: VirtQueue<H>,
    queue_idx: u32,
    event_idx: bool,
    old_avail_idx: u16,
    capacity_sectors: u64,
    slots: [RequestSlot; MAX_REQUESTS],
    stats: Stats,
}

impl<H: Hal> VirtioBlk<H> {
    /// Validate `mmio_base` as a block device, run the feature-negotiation
    /// and queue-setup handshake over queue 0 using `dma_buf` (which must be
    /// at least `crate::queue::required_size(queue_size, event_idx)` bytes,
    /// zero-initialized and page-aligned), and raise `DRIVER_OK`.
    ///
    /// `queue_count` is acknowledged at the API surface but not implemented:
    /// only a single queue (index `0`) is ever set up, so any value other
    /// than `1` fails with [`Error::NotSupported`] rather than silently
    /// behaving as if multi-queue worked.
    ///
    /// `extra_features` are OR'd into the set this driver requests beyond
    /// `VERSION_1` and `EVENT_IDX`, which are always requested if the
    /// device offers them.
    ///
    /// # Safety
    ///
    /// Same contract as [`MmioTransport::new`] for `mmio_base` and
    /// [`VirtQueue::new`] for `dma_buf`.
    pub unsafe fn create(
        mmio_base: *mut u8,
        dma_buf: *mut u8,
        queue_count: u32,
        queue_size: u16,
        extra_features: u64,
    ) -> Result<Self> {
        if queue_count != 1 {
            return Err(Error::NotSupported);
        }

        // SAFETY: forwarded from caller's contract on `mmio_base`.
        let transport = unsafe { MmioTransport::<H>::new(mmio_base) };
        if !transport.is_valid() {
            return Err(Error::TransportNotInitialized);
        }
        // Device type 2 is the VirtIO block device (§5.2).
        if transport.device_id() != 2 {
            return Err(Error::DeviceNotSupported);
        }

        let driver_wants =
            Features::VERSION_1.bits() | Features::EVENT_IDX.bits() | extra_features;
        let negotiated = init::negotiate::<H, _>(&transport, driver_wants)?;
        let event_idx = negotiated.contains(Features::EVENT_IDX);

        // SAFETY: forwarded from caller's contract on `dma_buf`; `event_idx`
        // matches what was just negotiated, so `required_size` agrees with
        // how the caller must have sized `dma_buf`.
        let queue = unsafe { VirtQueue::<H>::new(dma_buf, queue_size, event_idx)? };

        init::setup_queue(
            &transport,
            0,
            queue_size,
            queue.desc_phys(),
            queue.avail_phys(),
            queue.used_phys(),
        )?;
        init::activate(&transport)?;

        let capacity_sectors = transport.read_config_u64(0);

        Ok(Self {
            transport,
            queue,
            queue_idx: 0,
            event_idx,
            old_avail_idx: 0,
            capacity_sectors,
            slots: [RequestSlot::default(); MAX_REQUESTS],
            stats: Stats::default(),
        })
    }

    /// Device-reported capacity, in 512-byte sectors.
    pub fn capacity(&self) -> u64 {
        self.capacity_sectors
    }

    /// Re-read the live configuration space (capacity may change on a
    /// `CONFIG_CHANGE` interrupt for a resizable backing device).
    pub fn read_config(&self) -> BlkConfig {
        BlkConfig { capacity_sectors: self.transport.read_config_u64(0) }
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    fn alloc_request_slot(&mut self) -> Option<usize> {
        let idx = self.slots.iter().position(|s| !s.in_use)?;
        self.slots[idx].in_use = true;
        self.slots[idx].leaked = false;
        Some(idx)
    }

    fn free_request_slot(&mut self, idx: usize) {
        self.slots[idx] = RequestSlot::default();
    }

    fn find_slot_by_desc_head(&self, head: u16) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.in_use && s.desc_head == head)
    }

    fn enqueue_raw(
        &mut self,
        queue_idx: u32,
        req_type: RequestType,
        sector: u64,
        buffers: &[IoVec],
        write_to_device: bool,
        token: u64,
    ) -> Result<u16> {
        if queue_idx != self.queue_idx {
            return Err(Error::QueueNotAvailable);
        }
        if 2 + buffers.len() > MAX_SEGMENTS_PER_REQUEST {
            return Err(Error::InvalidArgument);
        }

        let idx = self.alloc_request_slot().ok_or_else(|| {
            self.stats.queue_full_errors += 1;
            Error::NoFreeRequestSlots
        })?;

        {
            let slot = &mut self.slots[idx];
            slot.header = ReqHeader { type_: req_type as u32, reserved: 0, sector };
            slot.status = STATUS_UNSET;
            slot.token = token;
        }

        let slot = &self.slots[idx];
        let header_phys = H::virt_to_phys((&slot.header as *const ReqHeader).cast());
        let status_phys = H::virt_to_phys(&slot.status as *const u8);
        let header_iov = IoVec::new(header_phys.as_u64(), size_of::<ReqHeader>());
        let status_iov = IoVec::new(status_phys.as_u64(), 1);

        let mut readable: ArrayVec<IoVec, MAX_SEGMENTS_PER_REQUEST> = ArrayVec::new();
        let mut writable: ArrayVec<IoVec, MAX_SEGMENTS_PER_REQUEST> = ArrayVec::new();
        readable.push(header_iov);
        if write_to_device {
            readable.extend(buffers.iter().copied());
        } else {
            writable.extend(buffers.iter().copied());
        }
        writable.push(status_iov);

        H::wmb();
        match self.queue.submit_chain(&readable, &writable) {
            Ok(head) => {
                self.slots[idx].desc_head = head;
                Ok(head)
            }
            Err(e) => {
                self.free_request_slot(idx);
                self.stats.queue_full_errors += 1;
                Err(e)
            }
        }
    }

    /// Enqueue a sector read on `queue_idx` (only `0` is ever valid — this
    /// core acknowledges multi-queue block devices at the API surface
    /// without implementing them): the device will write the concatenated
    /// length of `buffers` starting at `sector * 512`. Returns a completion
    /// handle (the descriptor-chain head) that `token` is associated with in
    /// [`VirtioBlk::handle_interrupt`]'s callback.
    pub fn enqueue_read(
        &mut self,
        queue_idx: u32,
        sector: u64,
        buffers: &[IoVec],
        token: u64,
    ) -> Result<u16> {
        self.enqueue_raw(queue_idx, RequestType::In, sector, buffers, false, token)
    }

    /// Enqueue a sector write on `queue_idx`: the device reads the
    /// concatenated contents of `buffers` and writes them starting at
    /// `sector * 512`.
    pub fn enqueue_write(
        &mut self,
        queue_idx: u32,
        sector: u64,
        buffers: &[IoVec],
        token: u64,
    ) -> Result<u16> {
        self.enqueue_raw(queue_idx, RequestType::Out, sector, buffers, true, token)
    }

    /// Ring the notification bell for `queue_idx`, unless the device's
    /// `avail_event` watermark says it hasn't consumed far enough to need
    /// one yet.
    pub fn kick(&mut self, queue_idx: u32) {
        H::mb();
        let new_idx = self.queue.avail_idx();
        let should_notify = if self.event_idx {
            match self.queue.read_avail_event() {
                Some(event) => vring_need_event(event, new_idx, self.old_avail_idx),
                None => true,
            }
        } else {
            true
        };

        if should_notify {
            self.transport.notify(queue_idx);
        } else {
            self.stats.kicks_elided += 1;
        }
        self.old_avail_idx = new_idx;
    }

    /// Tell the device where the driver's consumption point is, so it can
    /// suppress interrupts until `avail.idx` passes this watermark. A no-op
    /// unless `EVENT_IDX` was negotiated.
    fn publish_used_event(&mut self) {
        if self.event_idx {
            let watermark = self.queue.last_used_idx();
            self.queue.write_used_event(watermark);
            H::wmb();
        }
    }

    /// Finish one completed chain: free its descriptors and slot, and
    /// report `(token, status)` unless the slot had been quarantined by a
    /// synchronous caller that already gave up on it. `len` is the
    /// device-reported transfer length from the used-ring entry.
    fn complete_one(&mut self, head: u16, len: u32) -> Option<(u64, Result<RequestStatus>)> {
        let idx = self.find_slot_by_desc_head(head)?;
        // The device writes the status byte last, in the same transaction
        // as the used-ring entry; order the read after it.
        H::rmb();
        let leaked = self.slots[idx].leaked;
        let status = self.slots[idx].status;
        let token = self.slots[idx].token;
        let _ = self.queue.free_chain(head);

        if leaked {
            self.stats.leaked_slots = self.stats.leaked_slots.saturating_sub(1);
        } else {
            self.stats.bytes_transferred += len as u64;
        }
        self.free_request_slot(idx);

        if leaked {
            None
        } else {
            Some((token, status_to_result(status)))
        }
    }

    /// Drain the interrupt-status register, acknowledge it, and walk every
    /// pending used-ring entry, invoking `callback(token, status)` for each
    /// non-quarantined completion in the order the device published them
    /// (which need not match submission order).
    pub fn handle_interrupt(&mut self, mut callback: impl FnMut(u64, Result<RequestStatus>)) -> Result<()> {
        let bits = self.transport.interrupt_status();
        if bits == 0 {
            return Ok(());
        }
        self.transport.interrupt_ack(bits);
        self.stats.interrupts_handled += 1;

        if bits & isr::USED_BUFFER == 0 {
            return Ok(());
        }

        H::rmb();
        while self.queue.has_used() {
            let (head, len) = self.queue.pop_used()?;
            if let Some((token, result)) = self.complete_one(head, len) {
                callback(token, result);
            }
        }
        self.publish_used_event();
        Ok(())
    }

    fn sync_request(
        &mut self,
        req_type: RequestType,
        sector: u64,
        data: IoVec,
        write_to_device: bool,
    ) -> Result<RequestStatus> {
        let buffers = [data];
        let head = self.enqueue_raw(self.queue_idx, req_type, sector, &buffers, write_to_device, 0)?;
        self.kick(self.queue_idx);

        for _ in 0..SYNC_SPIN_LIMIT {
            if !self.queue.has_used() {
                continue;
            }
            H::rmb();
            let (completed_head, len) = self.queue.pop_used()?;
            let is_ours = completed_head == head;
            if let Some((_token, result)) = self.complete_one(completed_head, len) {
                if is_ours {
                    self.publish_used_event();
                    return result;
                }
                // A different, non-quarantined request completed while we
                // were spinning (caller mixed sync and async use on this
                // device); nothing to deliver it to here, so keep waiting
                // for ours.
            }
        }

        // Timed out: quarantine the slot instead of freeing it out from
        // under the device, which may still complete it later.
        if let Some(idx) = self.find_slot_by_desc_head(head) {
            self.slots[idx].leaked = true;
            self.stats.leaked_slots += 1;
        }
        Err(Error::Timeout)
    }

    /// Synchronously read one request's worth of sectors starting at
    /// `sector`, spin-waiting (never sleeping) for the device to complete
    /// it. `dest.len` bytes are read into `dest`.
    pub fn read_sector(&mut self, sector: u64, dest: IoVec) -> Result<()> {
        self.sync_request(RequestType::In, sector, dest, false).map(|_| ())
    }

    /// Synchronously write one request's worth of sectors starting at
    /// `sector` from `src`.
    pub fn write_sector(&mut self, sector: u64, src: IoVec) -> Result<()> {
        self.sync_request(RequestType::Out, sector, src, true).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::NullHal;
    use crate::queue::required_size;
    use crate::transport::mmio::tests_support::mock_block_device_region;

    fn new_queue(queue_size: u16, event_idx: bool) -> (Vec<u8>, VirtQueue<NullHal>) {
        let size = required_size(queue_size, event_idx);
        let mut buf = vec![0u8; size];
        let q = unsafe { VirtQueue::<NullHal>::new(buf.as_mut_ptr(), queue_size, event_idx).unwrap() };
        (buf, q)
    }

    /// A `VirtioBlk` wired to a real (valid) mock transport and queue,
    /// bypassing `create`'s handshake so tests can drive the request-slot
    /// pool and completion path directly.
    fn bare_device(queue: VirtQueue<NullHal>, mmio_region: &mut Vec<u8>) -> VirtioBlk<NullHal> {
        let transport = unsafe { MmioTransport::<NullHal>::new(mmio_region.as_mut_ptr()) };
        assert!(transport.is_valid());
        VirtioBlk {
            transport,
            queue,
            queue_idx: 0,
            event_idx: false,
            old_avail_idx: 0,
            capacity_sectors: 1024,
            slots: [RequestSlot::default(); MAX_REQUESTS],
            stats: Stats::default(),
        }
    }

    #[test]
    fn request_slot_pool_is_bounded_and_reusable() {
        let (_buf, queue) = new_queue(128, false);
        let mut region = mock_block_device_region();
        let mut dev = bare_device(queue, &mut region);

        let mut heads = Vec::new();
        for i in 0..MAX_REQUESTS {
            let data = [0u8; SECTOR_SIZE];
            let buf = [IoVec::new(data.as_ptr() as u64, SECTOR_SIZE)];
            let head = dev.enqueue_read(0, i as u64, &buf, i as u64).unwrap();
            heads.push(head);
        }
        let data = [0u8; SECTOR_SIZE];
        let buf = [IoVec::new(data.as_ptr() as u64, SECTOR_SIZE)];
        assert_eq!(
            dev.enqueue_read(0, 0, &buf, 0),
            Err(Error::NoFreeRequestSlots)
        );
        assert_eq!(dev.stats().queue_full_errors, 1);

        dev.free_request_slot(dev.find_slot_by_desc_head(heads[0]).unwrap());
        let head = dev.enqueue_read(0, 0, &buf, 99).unwrap();
        assert!(dev.find_slot_by_desc_head(head).is_some());
    }

    #[test]
    fn non_zero_queue_index_is_rejected() {
        let (_buf, queue) = new_queue(8, false);
        let mut region = mock_block_device_region();
        let mut dev = bare_device(queue, &mut region);
        let data = [0u8; SECTOR_SIZE];
        let buf = [IoVec::new(data.as_ptr() as u64, SECTOR_SIZE)];
        assert_eq!(
            dev.enqueue_read(1, 0, &buf, 0),
            Err(Error::QueueNotAvailable)
        );
        assert_eq!(
            dev.enqueue_write(1, 0, &buf, 0),
            Err(Error::QueueNotAvailable)
        );
    }

    #[test]
    fn oversized_buffer_list_is_rejected() {
        let (_buf, queue) = new_queue(32, false);
        let mut region = mock_block_device_region();
        let mut dev = bare_device(queue, &mut region);
        let data = [0u8; SECTOR_SIZE];
        let iov = IoVec::new(data.as_ptr() as u64, SECTOR_SIZE);
        // header + status already occupy 2 of 18 segments; 17 data buffers
        // pushes the chain to 19, one past the limit.
        let buffers = [iov; 17];
        assert_eq!(
            dev.enqueue_read(0, 0, &buffers, 0),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn out_of_order_completion_dispatches_by_desc_head() {
        let (_buf, queue) = new_queue(8, false);
        let mut region = mock_block_device_region();
        let mut dev = bare_device(queue, &mut region);

        let bufs = [[0u8; SECTOR_SIZE]; 3];
        let b0 = [IoVec::new(bufs[0].as_ptr() as u64, SECTOR_SIZE)];
        let b1 = [IoVec::new(bufs[1].as_ptr() as u64, SECTOR_SIZE)];
        let b2 = [IoVec::new(bufs[2].as_ptr() as u64, SECTOR_SIZE)];
        let h1 = dev.enqueue_read(0, 10, &b0, 10).unwrap();
        let h2 = dev.enqueue_read(0, 20, &b1, 20).unwrap();
        let h3 = dev.enqueue_read(0, 30, &b2, 30).unwrap();

        for &h in &[h1, h2, h3] {
            let idx = dev.find_slot_by_desc_head(h).unwrap();
            dev.slots[idx].status = STATUS_OK;
        }

        // Script the used ring to publish {h3}, {h1}, {h2}.
        for &h in &[h3, h1, h2] {
            dev.queue.test_publish_used(h, SECTOR_SIZE as u32);
        }

        let mut order = Vec::new();
        while dev.queue.has_used() {
            let (head, len) = dev.queue.pop_used().unwrap();
            if let Some((token, result)) = dev.complete_one(head, len) {
                assert!(result.is_ok());
                order.push(token);
            }
        }

        assert_eq!(order, vec![30, 10, 20]);
        assert_eq!(dev.queue.num_free(), 8);
        assert_eq!(dev.stats().bytes_transferred, 3 * SECTOR_SIZE as u64);
        assert!(dev.slots.iter().all(|s| !s.in_use));
    }

    #[test]
    fn notification_suppressed_within_event_window() {
        let (_buf, queue) = new_queue(8, true);
        let mut region = mock_block_device_region();
        let mut dev = bare_device(queue, &mut region);
        dev.event_idx = true;

        let buf = [0u8; SECTOR_SIZE];
        let iov = [IoVec::new(buf.as_ptr() as u64, SECTOR_SIZE)];

        // avail_event defaults to 0 (zero-initialized DMA buffer): the
        // first submit (old=0 -> new=1) falls in the half-open window
        // (0, 0] exclusive... i.e. still needs a kick, matching a device
        // that hasn't set a watermark yet.
        dev.enqueue_read(0, 0, &iov, 1).unwrap();
        dev.kick(0);
        assert_eq!(dev.transport.notify_count_for_test(), 1);
        assert_eq!(dev.stats().kicks_elided, 0);

        // Device now asks not to be notified again until avail idx passes 5.
        dev.queue.test_set_avail_event(5);
        dev.enqueue_read(0, 1, &iov, 2).unwrap();
        dev.kick(0);
        assert_eq!(dev.transport.notify_count_for_test(), 1);
        assert_eq!(dev.stats().kicks_elided, 1);
    }
}
