//! Device initializer (L2): the VirtIO §3.1.1 handshake.
//!
//! Generalizes the teacher's inline `VirtioDisk::init` sequence
//! (`virtio/virtio_disk.rs`) — reset, ACKNOWLEDGE, DRIVER, negotiate,
//! FEATURES_OK, DRIVER_OK — into a transport-agnostic, fallible function
//! generic over [`Transport`] so it runs identically against
//! [`crate::transport::MmioTransport`] in production and a software fake in
//! this module's own tests, independent of which virtqueue or how many
//! queues are programmed afterward.

use crate::error::{Error, Result};
use crate::feature::{Features, Status};
use crate::hal::Hal;
use crate::hal::PhysAddr;
use crate::transport::Transport;

/// Run the device-initialization handshake (§4.3 steps 1-6) and negotiate
/// `driver_wants` against the device-offered feature set.
///
/// Returns the negotiated feature set. Does not program any queue or raise
/// `DRIVER_OK`; callers run [`setup_queue`] and [`activate`] afterward.
pub fn negotiate<H: Hal, T: Transport>(transport: &T, driver_wants: u64) -> Result<Features> {
    if !transport.is_valid() {
        return Err(Error::TransportNotInitialized);
    }

    // 1. Reset.
    transport.set_status(0);

    // 2. ACKNOWLEDGE.
    transport.set_status(Status::ACKNOWLEDGE.bits());

    // 3. ACKNOWLEDGE | DRIVER.
    transport.set_status((Status::ACKNOWLEDGE | Status::DRIVER).bits());

    // 4. Negotiate features.
    let offered = transport.device_features();
    let negotiated = offered & driver_wants;
    transport.set_driver_features(negotiated);

    // 5. ACKNOWLEDGE | DRIVER | FEATURES_OK.
    transport.set_status((Status::ACKNOWLEDGE | Status::DRIVER | Status::FEATURES_OK).bits());

    // 6. Check the device accepted the feature set.
    let status = transport.status();
    if status & Status::FEATURES_OK.bits() == 0 {
        H::log(
            log::Level::Error,
            format_args!("virtio: device refused feature set {negotiated:#x}"),
        );
        transport.set_status(status | Status::FAILED.bits());
        return Err(Error::FeatureNegotiationFailed);
    }

    Ok(Features::from_bits_truncate(negotiated))
}

/// Program one queue's size and ring addresses (§4.3 step 7). Thin wrapper
/// kept here so callers run the whole handshake through one module.
pub fn setup_queue<T: Transport>(
    transport: &T,
    queue_idx: u32,
    size: u16,
    desc: PhysAddr,
    avail: PhysAddr,
    used: PhysAddr,
) -> Result<()> {
    transport.setup_queue(queue_idx, size, desc, avail, used)
}

/// Raise `DRIVER_OK` (§4.3 step 8) and confirm the device did not
/// immediately demand a reset.
pub fn activate<T: Transport>(transport: &T) -> Result<()> {
    if !transport.is_valid() {
        return Err(Error::TransportNotInitialized);
    }
    let status = transport.status();
    transport.set_status(status | Status::DRIVER_OK.bits());

    let status = transport.status();
    if status & Status::DEVICE_NEEDS_RESET.bits() != 0 {
        return Err(Error::DeviceError);
    }
    Ok(())
}
