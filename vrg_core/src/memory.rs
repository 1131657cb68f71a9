//! Device memory arena
//!
//! Buffers and textures get their memory from the device's [`MemoryArena`].
//! Each live block is recorded in a generational slot map; the caller holds a
//! [`MemoryAllocation`] token that is neither `Clone` nor `Copy`, so a block
//! is bound to exactly one resource and freed exactly once.

use std::ptr::NonNull;
use std::sync::{Arc, Mutex, PoisonError};

use slotmap::{new_key_type, SlotMap};

use crate::driver::{Driver, MemoryRequirements, RawAllocation};
use crate::error::{Error, Result};
use crate::types::MemoryLocation;
use crate::{vrg_error, vrg_trace, vrg_warn};

new_key_type! {
    /// Generational key of a live allocation
    pub struct AllocationKey;
}

struct AllocationRecord {
    name: String,
    raw: RawAllocation,
}

/// Token for one block of device memory
#[derive(Debug)]
pub struct MemoryAllocation {
    key: AllocationKey,
    raw: RawAllocation,
    location: MemoryLocation,
}

impl MemoryAllocation {
    pub fn key(&self) -> AllocationKey {
        self.key
    }

    pub fn raw(&self) -> &RawAllocation {
        &self.raw
    }

    pub fn size(&self) -> u64 {
        self.raw.size
    }

    pub fn location(&self) -> MemoryLocation {
        self.location
    }

    /// Host address of the block, `None` for device-local memory
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.raw.mapped.map(|p| p.0)
    }
}

/// Allocates and frees device memory blocks
pub struct MemoryArena {
    driver: Arc<dyn Driver>,
    records: Mutex<SlotMap<AllocationKey, AllocationRecord>>,
}

impl MemoryArena {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self { driver, records: Mutex::new(SlotMap::with_key()) }
    }

    /// Allocate a block satisfying `requirements`
    ///
    /// # Errors
    ///
    /// `OutOfMemory` for zero-sized requests or when the driver reports
    /// exhaustion; `CreationFailure` for any other driver failure.
    pub fn allocate(
        &self,
        requirements: &MemoryRequirements,
        location: MemoryLocation,
        name: &str,
    ) -> Result<MemoryAllocation> {
        if requirements.size == 0 {
            vrg_error!("vrg::memory", "Zero-sized allocation requested for '{}'", name);
            return Err(Error::OutOfMemory);
        }

        let raw = self.driver.allocate_memory(requirements, location, name)?;
        if location.is_host_visible() && raw.mapped.is_none() {
            self.driver.free_memory(raw.memory);
            return Err(Error::CreationFailure(format!(
                "Host-visible allocation '{}' was not mapped",
                name
            )));
        }

        let key = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(AllocationRecord { name: name.to_string(), raw });

        vrg_trace!("vrg::memory", "Allocated {} bytes for '{}'", raw.size, name);
        Ok(MemoryAllocation { key, raw, location })
    }

    /// Return a block to the driver
    pub fn free(&self, allocation: MemoryAllocation) {
        let removed = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(allocation.key);

        match removed {
            Some(record) => {
                vrg_trace!("vrg::memory", "Freed {} bytes of '{}'", record.raw.size, record.name);
                self.driver.free_memory(record.raw.memory);
            }
            None => {
                vrg_warn!("vrg::memory", "Ignoring free of unknown allocation {:?}", allocation.key);
            }
        }
    }

    pub fn live_allocations(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|r| r.raw.size)
            .sum()
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
