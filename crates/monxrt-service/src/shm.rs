//! The process-global shared-memory region.
//!
//! Created as an anonymous memfd so the file descriptor is the canonical
//! capability: clients receive it over the control socket and map it
//! read-only. Only the service writes. The static sections (device table)
//! are written once at startup; input snapshots and render slots are
//! rewritten at runtime through `&mut self`, which the server keeps behind
//! the global-state lock.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::ptr::NonNull;

use monxrt_common::{Error, Result};
use monxrt_proto::shm::{DeviceTable, InputRecord, RenderSlotRecord, ShmLayout};
use rustix::fs::{ftruncate, memfd_create, MemfdFlags};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use tracing::info;

/// The mapped region plus its backing fd.
pub struct ShmRegion {
    fd: OwnedFd,
    ptr: NonNull<u8>,
    layout: ShmLayout,
}

// The raw pointer is only dereferenced through &self/&mut self, so the
// usual borrow rules serialize access.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Create the region, size it for `table`, and write the header and
    /// static sections.
    pub fn create(table: &DeviceTable, epoch_ns: u64) -> Result<Self> {
        let layout = table.layout();
        let size = layout.total_size as usize;

        let fd = memfd_create("monxrt-shm", MemfdFlags::CLOEXEC | MemfdFlags::ALLOW_SEALING)
            .map_err(std::io::Error::from)?;
        ftruncate(&fd, size as u64).map_err(std::io::Error::from)?;

        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        }
        .map_err(std::io::Error::from)?;

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::runtime("mmap returned null"))?;

        let mut region = Self { fd, ptr, layout };
        table
            .write_region(epoch_ns, region.as_mut_slice())
            .map_err(|e| Error::runtime(format!("shm layout write: {e}")))?;

        info!(size, "created shared-memory region");
        Ok(region)
    }

    /// The fd clients receive and map.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn layout(&self) -> ShmLayout {
        self.layout
    }

    fn as_slice(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.total_size as usize)
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.total_size as usize)
        }
    }

    /// Rewrite input snapshots starting at table index `first_index`.
    pub fn write_inputs(&mut self, first_index: usize, inputs: &[InputRecord]) -> Result<()> {
        let end = first_index
            .checked_add(inputs.len())
            .ok_or_else(|| Error::runtime("input snapshot range overflow"))?;
        if end > self.layout.num_inputs as usize {
            return Err(Error::runtime(format!(
                "input snapshot range {first_index}..{end} out of bounds"
            )));
        }
        for (i, input) in inputs.iter().enumerate() {
            let at = self.layout.input_offset(first_index + i);
            let mut cursor = &mut self.as_mut_slice()[at..at + InputRecord::ENCODED_SIZE];
            input.encode(&mut cursor);
        }
        Ok(())
    }

    /// Mirror a client's scheduled stack into its render slot.
    pub fn write_slot(&mut self, client_index: usize, slot: &RenderSlotRecord) -> Result<()> {
        if client_index >= monxrt_proto::MAX_CLIENTS {
            return Err(Error::runtime(format!("slot index {client_index} out of bounds")));
        }
        if slot.layers.len() > monxrt_proto::MAX_LAYERS {
            return Err(Error::validation("too many layers for a render slot"));
        }
        let at = self.layout.slot_offset(client_index);
        let mut cursor = &mut self.as_mut_slice()[at..at + RenderSlotRecord::ENCODED_SIZE];
        slot.encode(&mut cursor);
        Ok(())
    }

    /// Read a render slot back, mainly for tests and diagnostics.
    pub fn read_slot(&self, client_index: usize) -> Result<RenderSlotRecord> {
        let at = self.layout.slot_offset(client_index);
        let mut cursor = &self.as_slice()[at..at + RenderSlotRecord::ENCODED_SIZE];
        RenderSlotRecord::decode(&mut cursor)
            .map_err(|e| Error::runtime(format!("render slot decode: {e}")))
    }

    /// Parse the whole static table back out of the region.
    pub fn read_table(&self) -> Result<DeviceTable> {
        DeviceTable::read_region(self.as_slice())
            .map(|(_, table)| table)
            .map_err(|e| Error::runtime(format!("shm parse: {e}")))
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(
                self.ptr.as_ptr().cast(),
                self.layout.total_size as usize,
            );
        }
    }
}
