//! Fixed-size device buffers and views over them

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;

use bytemuck::Pod;

use crate::device::DeviceContext;
use crate::driver::{BufferCreateInfo, BufferHandle, NamedObject};
use crate::error::{Error, Result};
use crate::memory::MemoryAllocation;
use crate::resource::{DeviceResource, ResourceBase};
use crate::types::{BufferUsageFlags, MemoryLocation, SharingMode};
use crate::{vrg_bail, vrg_trace};

/// Buffer creation parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    /// Size in bytes
    pub size: u64,
    pub usage: BufferUsageFlags,
    pub location: MemoryLocation,
    pub sharing_mode: SharingMode,
    /// Queue families allowed to access a `Concurrent` buffer
    pub queue_family_indices: Vec<u32>,
    /// Minimum alignment of the backing memory (raised to the driver's requirement)
    pub alignment: u64,
}

impl Default for BufferDesc {
    fn default() -> Self {
        Self {
            size: 0,
            usage: BufferUsageFlags::empty(),
            location: MemoryLocation::GpuOnly,
            sharing_mode: SharingMode::Exclusive,
            queue_family_indices: Vec::new(),
            alignment: 1,
        }
    }
}

/// Linear byte range on the device
///
/// Host-visible buffers stay persistently mapped for their whole lifetime.
/// Writes through the mapping are not synchronized against GPU reads; the
/// caller orders them with fences.
pub struct Buffer {
    base: ResourceBase,
    handle: BufferHandle,
    allocation: Option<MemoryAllocation>,
    size: u64,
    usage: BufferUsageFlags,
    location: MemoryLocation,
    sharing_mode: SharingMode,
}

impl Buffer {
    /// Create a buffer and bind fresh memory from the device arena
    ///
    /// # Errors
    ///
    /// `InvalidUsage` for a zero size, `CreationFailure`/`OutOfMemory` from
    /// the driver or arena.
    pub fn new(context: &Arc<DeviceContext>, name: &str, desc: &BufferDesc) -> Result<Arc<Buffer>> {
        if desc.size == 0 {
            vrg_bail!("vrg::buffer", "Buffer '{}' must have a non-zero size", name);
        }

        let driver = context.driver();
        let handle = driver.create_buffer(&BufferCreateInfo {
            size: desc.size,
            usage: desc.usage,
            sharing_mode: desc.sharing_mode,
            queue_family_indices: desc.queue_family_indices.clone(),
        })?;

        let mut requirements = driver.buffer_memory_requirements(handle);
        requirements.alignment = requirements.alignment.max(desc.alignment);

        let allocation = match context.memory().allocate(&requirements, desc.location, name) {
            Ok(allocation) => allocation,
            Err(e) => {
                driver.destroy_buffer(handle);
                return Err(e);
            }
        };
        if let Err(e) = driver.bind_buffer_memory(handle, allocation.raw()) {
            context.memory().free(allocation);
            driver.destroy_buffer(handle);
            return Err(e);
        }

        let base = ResourceBase::new(context.clone(), name);
        base.label(NamedObject::Buffer(handle));
        vrg_trace!("vrg::buffer", "Created buffer '{}' ({} bytes)", name, desc.size);

        Ok(Arc::new(Buffer {
            base,
            handle,
            allocation: Some(allocation),
            size: desc.size,
            usage: desc.usage,
            location: desc.location,
            sharing_mode: desc.sharing_mode,
        }))
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> BufferUsageFlags {
        self.usage
    }

    pub fn location(&self) -> MemoryLocation {
        self.location
    }

    pub fn sharing_mode(&self) -> SharingMode {
        self.sharing_mode
    }

    /// Start of the persistent mapping, `None` for device-local buffers
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.allocation.as_ref().and_then(|a| a.mapped_ptr())
    }

    fn mapped_range(&self, offset: u64, len: u64) -> Result<NonNull<u8>> {
        let Some(ptr) = self.mapped_ptr() else {
            vrg_bail!("vrg::buffer", "Buffer '{}' is not host visible", self.name());
        };
        match offset.checked_add(len) {
            Some(end) if end <= self.size => {}
            _ => vrg_bail!(
                "vrg::buffer",
                "Range [{}, +{}) out of bounds of buffer '{}' ({} bytes)",
                offset,
                len,
                self.name(),
                self.size
            ),
        }
        // Bounds were checked above.
        Ok(unsafe { NonNull::new_unchecked(ptr.as_ptr().add(offset as usize)) })
    }

    /// Copy bytes into the mapped memory at `offset`
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let dst = self.mapped_range(offset, data.len() as u64)?;
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst.as_ptr(), data.len()) };
        Ok(())
    }

    /// Copy plain-old-data values into the mapped memory at `offset`
    pub fn write_pod<T: Pod>(&self, offset: u64, values: &[T]) -> Result<()> {
        self.write(offset, bytemuck::cast_slice(values))
    }

    /// Read `count` values back from the mapped memory at `offset`
    pub fn read_pod<T: Pod>(&self, offset: u64, count: usize) -> Result<Vec<T>> {
        let mut values = vec![T::zeroed(); count];
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut values);
        let src = self.mapped_range(offset, bytes.len() as u64)?;
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), bytes.as_mut_ptr(), bytes.len()) };
        Ok(values)
    }
}

impl DeviceResource for Buffer {
    fn base(&self) -> &ResourceBase {
        &self.base
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let context = self.base.context();
        context.driver().destroy_buffer(self.handle);
        if let Some(allocation) = self.allocation.take() {
            context.memory().free(allocation);
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("name", &self.name())
            .field("handle", &self.handle)
            .field("size", &self.size)
            .finish()
    }
}

fn check_range(buffer: &Buffer, offset: u64, size: u64) -> Result<()> {
    match offset.checked_add(size) {
        Some(end) if end <= buffer.size() => Ok(()),
        _ => Err(crate::vrg_err!(
            "vrg::buffer",
            "View [{}, +{}) out of range of buffer '{}' ({} bytes)",
            offset,
            size,
            buffer.name(),
            buffer.size()
        )),
    }
}

// ===== VIEWS =====

/// Typed element range of a buffer
pub struct BufferView<T> {
    buffer: Arc<Buffer>,
    offset: u64,
    len: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> BufferView<T> {
    /// View `len` elements of `T` starting at byte `offset`
    ///
    /// # Errors
    ///
    /// `InvalidUsage` when the range does not fit in the buffer.
    pub fn new(buffer: Arc<Buffer>, offset: u64, len: u64) -> Result<Self> {
        let size = len
            .checked_mul(std::mem::size_of::<T>() as u64)
            .ok_or_else(|| Error::InvalidUsage(format!("View of {} elements overflows", len)))?;
        check_range(&buffer, offset, size)?;
        Ok(Self { buffer, offset, len, _marker: PhantomData })
    }

    /// View of the whole buffer
    pub fn whole(buffer: Arc<Buffer>) -> Result<Self> {
        let len = buffer.size() / (std::mem::size_of::<T>().max(1) as u64);
        Self::new(buffer, 0, len)
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn size_bytes(&self) -> u64 {
        self.len * std::mem::size_of::<T>() as u64
    }

    pub fn stride_view(&self) -> StrideView {
        StrideView {
            buffer: self.buffer.clone(),
            offset: self.offset,
            size: self.size_bytes(),
            stride: std::mem::size_of::<T>() as u64,
        }
    }
}

impl<T> Clone for BufferView<T> {
    fn clone(&self) -> Self {
        Self { buffer: self.buffer.clone(), offset: self.offset, len: self.len, _marker: PhantomData }
    }
}

impl<T> PartialEq for BufferView<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer) && self.offset == other.offset && self.len == other.len
    }
}

impl<T> std::fmt::Debug for BufferView<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferView")
            .field("buffer", &self.buffer.name())
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// Untyped byte range of a buffer with an element stride
///
/// Used for vertex and index bindings; two views are equal when they cover the
/// same bytes of the same buffer with the same stride.
#[derive(Clone)]
pub struct StrideView {
    buffer: Arc<Buffer>,
    offset: u64,
    size: u64,
    stride: u64,
}

impl StrideView {
    pub fn new(buffer: Arc<Buffer>, offset: u64, size: u64, stride: u64) -> Result<Self> {
        if stride == 0 {
            vrg_bail!("vrg::buffer", "Stride view of '{}' needs a non-zero stride", buffer.name());
        }
        check_range(&buffer, offset, size)?;
        Ok(Self { buffer, offset, size, stride })
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size_bytes(&self) -> u64 {
        self.size
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    /// Number of whole elements in the range
    pub fn count(&self) -> u64 {
        self.size / self.stride
    }
}

impl PartialEq for StrideView {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
            && self.offset == other.offset
            && self.size == other.size
            && self.stride == other.stride
    }
}

impl std::fmt::Debug for StrideView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrideView")
            .field("buffer", &self.buffer.name())
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("stride", &self.stride)
            .finish()
    }
}

#[cfg(test)]
#[path = "buffer_tests.rs"]
mod tests;
