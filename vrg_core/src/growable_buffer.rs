//! Geometrically growing vector stored in host-visible device memory
//!
//! Elements live directly in the mapped memory of a backing [`Buffer`], so
//! the GPU can read them without a staging copy. Growing allocates a new,
//! larger buffer and copies the live elements over byte for byte; buffers
//! still referenced by views or in-flight command buffers stay alive until
//! those references drop.
//!
//! The backing buffer is reachable through [`GrowableBuffer::buffer`],
//! [`GrowableBuffer::view`] and GPU copies, all of which write raw bytes, so
//! elements are restricted to plain data (`bytemuck::Pod`).

use bytemuck::Pod;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::buffer::{Buffer, BufferDesc, BufferView};
use crate::device::DeviceContext;
use crate::error::Result;
use crate::types::{BufferUsageFlags, MemoryLocation};
use crate::{vrg_bail, vrg_err, vrg_trace};

/// Vector of `T` backed by device memory
///
/// Invariants: `len <= capacity`; the elements in `[0, len)` are initialized;
/// the capacity never shrinks.
///
/// Element types must be plain data:
///
/// ```compile_fail
/// use vrg_core::growable_buffer::GrowableBuffer;
///
/// fn names(_: GrowableBuffer<String>) {}
/// ```
pub struct GrowableBuffer<T: Pod> {
    context: Arc<DeviceContext>,
    name: String,
    usage: BufferUsageFlags,
    location: MemoryLocation,
    buffer: Option<Arc<Buffer>>,
    capacity: u64,
    len: u64,
    _marker: PhantomData<T>,
}

impl<T: Pod> GrowableBuffer<T> {
    /// Empty vector; no device memory is allocated until the first growth
    ///
    /// # Errors
    ///
    /// `InvalidUsage` for zero-sized `T` or a location that is not host visible.
    pub fn new(
        context: &Arc<DeviceContext>,
        name: &str,
        usage: BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self> {
        if std::mem::size_of::<T>() == 0 {
            vrg_bail!("vrg::growable_buffer", "'{}': zero-sized element types are not supported", name);
        }
        if !location.is_host_visible() {
            vrg_bail!("vrg::growable_buffer", "'{}' needs a host-visible memory location", name);
        }
        Ok(Self {
            context: context.clone(),
            name: name.to_string(),
            usage,
            location,
            buffer: None,
            capacity: 0,
            len: 0,
            _marker: PhantomData,
        })
    }

    pub fn with_capacity(
        context: &Arc<DeviceContext>,
        name: &str,
        usage: BufferUsageFlags,
        location: MemoryLocation,
        capacity: u64,
    ) -> Result<Self> {
        let mut vector = Self::new(context, name, usage, location)?;
        vector.reserve(capacity)?;
        Ok(vector)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of elements the current backing buffer can hold
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Current backing buffer, `None` before the first allocation
    pub fn buffer(&self) -> Option<&Arc<Buffer>> {
        self.buffer.as_ref()
    }

    fn data_ptr(&self) -> *mut T {
        self.buffer
            .as_ref()
            .and_then(|b| b.mapped_ptr())
            .map_or(std::ptr::NonNull::dangling().as_ptr(), |p| p.as_ptr() as *mut T)
    }

    /// Ensure room for at least `n` elements
    ///
    /// Reallocates only when the capacity is insufficient; the new capacity is
    /// `max(n, capacity + capacity / 2, 1)`.
    pub fn reserve(&mut self, n: u64) -> Result<()> {
        if n <= self.capacity {
            return Ok(());
        }

        let new_capacity = n.max(self.capacity + self.capacity / 2).max(1);
        let element_size = std::mem::size_of::<T>() as u64;
        let Some(bytes) = new_capacity.checked_mul(element_size) else {
            vrg_bail!("vrg::growable_buffer", "'{}': capacity {} overflows", self.name, new_capacity);
        };

        let buffer = Buffer::new(
            &self.context,
            &self.name,
            &BufferDesc {
                size: bytes,
                usage: self.usage,
                location: self.location,
                alignment: std::mem::align_of::<T>() as u64,
                ..Default::default()
            },
        )?;
        let Some(dst) = buffer.mapped_ptr() else {
            vrg_bail!("vrg::growable_buffer", "'{}': backing buffer is not mapped", self.name);
        };
        if (dst.as_ptr() as usize) % std::mem::align_of::<T>() != 0 {
            vrg_bail!("vrg::growable_buffer", "'{}': mapped memory is misaligned", self.name);
        }

        if self.len > 0 {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.data_ptr() as *const u8,
                    dst.as_ptr(),
                    (self.len * element_size) as usize,
                );
            }
        }

        vrg_trace!(
            "vrg::growable_buffer",
            "'{}' grew from {} to {} elements",
            self.name,
            self.capacity,
            new_capacity
        );
        self.buffer = Some(buffer);
        self.capacity = new_capacity;
        Ok(())
    }

    /// Append an element, growing when full (EmplaceBack)
    pub fn push(&mut self, value: T) -> Result<&mut T> {
        if self.len == self.capacity {
            self.reserve(self.len + 1)?;
        }
        unsafe {
            let slot = self.data_ptr().add(self.len as usize);
            slot.write(value);
            self.len += 1;
            Ok(&mut *slot)
        }
    }

    /// Remove and return the last element
    pub fn pop(&mut self) -> Option<T> {
        let value = *self.as_slice().last()?;
        self.len -= 1;
        Some(value)
    }

    /// Remove the element at `pos`, shifting the tail down by one slot
    ///
    /// # Errors
    ///
    /// `InvalidUsage` when `pos >= len`.
    pub fn erase(&mut self, pos: u64) -> Result<T> {
        if pos >= self.len {
            return Err(vrg_err!(
                "vrg::growable_buffer",
                "'{}': erase index {} out of range (len {})",
                self.name,
                pos,
                self.len
            ));
        }
        let pos = pos as usize;
        let value = self.as_slice()[pos];
        self.as_mut_slice().copy_within(pos + 1.., pos);
        self.len -= 1;
        Ok(value)
    }

    /// Forget every element past `n`
    pub fn truncate(&mut self, n: u64) {
        self.len = self.len.min(n);
    }

    pub fn clear(&mut self) {
        self.truncate(0);
    }

    /// Bounds-checked access
    ///
    /// # Errors
    ///
    /// `InvalidUsage` when `index >= len`.
    pub fn at(&self, index: u64) -> Result<&T> {
        if index >= self.len {
            return Err(vrg_err!(
                "vrg::growable_buffer",
                "'{}': index {} out of range (len {})",
                self.name,
                index,
                self.len
            ));
        }
        Ok(&self.as_slice()[index as usize])
    }

    pub fn get(&self, index: u64) -> Option<&T> {
        self.as_slice().get(usize::try_from(index).ok()?)
    }

    pub fn get_mut(&mut self, index: u64) -> Option<&mut T> {
        let index = usize::try_from(index).ok()?;
        self.as_mut_slice().get_mut(index)
    }

    pub fn as_slice(&self) -> &[T] {
        unsafe { std::slice::from_raw_parts(self.data_ptr(), self.len as usize) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        unsafe { std::slice::from_raw_parts_mut(self.data_ptr(), self.len as usize) }
    }

    /// Copy into a new backing buffer of exactly `len` elements
    pub fn try_clone(&self) -> Result<Self> {
        let mut copy = Self::new(&self.context, &self.name, self.usage, self.location)?;
        copy.reserve(self.len)?;
        for value in self.as_slice() {
            copy.push(*value)?;
        }
        Ok(copy)
    }

    /// View over the live elements
    ///
    /// # Errors
    ///
    /// `InvalidUsage` while no backing buffer exists.
    pub fn view(&self) -> Result<BufferView<T>> {
        let Some(buffer) = &self.buffer else {
            vrg_bail!("vrg::growable_buffer", "'{}': cannot view a null buffer", self.name);
        };
        BufferView::new(buffer.clone(), 0, self.len)
    }
}

impl<T: Pod + Default> GrowableBuffer<T> {
    /// Grow with default values or drop the tail so that `len == n`
    pub fn resize(&mut self, n: u64) -> Result<()> {
        if n <= self.len {
            self.truncate(n);
            return Ok(());
        }
        self.reserve(n)?;
        while self.len < n {
            unsafe { self.data_ptr().add(self.len as usize).write(T::default()) };
            self.len += 1;
        }
        Ok(())
    }
}


impl<T: Pod> Deref for GrowableBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T: Pod> DerefMut for GrowableBuffer<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}

impl<T: Pod + std::fmt::Debug> std::fmt::Debug for GrowableBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrowableBuffer")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("elements", &self.as_slice())
            .finish()
    }
}

#[cfg(test)]
#[path = "growable_buffer_tests.rs"]
mod tests;
