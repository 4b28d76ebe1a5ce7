//! Scatter-gather element handed to the virtqueue.

/// One physically-contiguous buffer segment, already translated to a
/// guest-physical address by the caller via [`crate::hal::Hal::virt_to_phys`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoVec {
    pub phys_addr: u64,
    pub len: usize,
}

impl IoVec {
    pub const fn new(phys_addr: u64, len: usize) -> Self {
        Self { phys_addr, len }
    }
}
