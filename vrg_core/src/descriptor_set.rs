//! Descriptor set layouts and descriptor sets with deferred writes
//!
//! Assignments to a descriptor set only mark the (binding, array index) key
//! dirty. The next flush, which binding the set to a command buffer always
//! performs, pushes every dirty key to the device in one batched update and
//! empties the dirty set.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

use rustc_hash::FxHashMap;

use crate::buffer::{Buffer, BufferView};
use crate::device::DeviceContext;
use crate::driver::{
    AccelerationStructureHandle, DescriptorSetHandle, DescriptorSetLayoutHandle, DescriptorWrite,
    DescriptorWriteInfo, NamedObject, SamplerHandle,
};
use crate::error::Result;
use crate::resource::{DeviceResource, ResourceBase};
use crate::texture::TextureView;
use crate::types::{DescriptorKind, DescriptorType, ImageLayout, ShaderStageFlags};
use crate::{vrg_bail, vrg_trace};

/// Type, visibility and array size of one binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorBinding {
    pub descriptor_type: DescriptorType,
    pub stage_flags: ShaderStageFlags,
    pub count: u32,
}

// ===== LAYOUT =====

/// Immutable binding table of a descriptor set
pub struct DescriptorSetLayout {
    base: ResourceBase,
    handle: DescriptorSetLayoutHandle,
    bindings: BTreeMap<u32, DescriptorBinding>,
}

impl DescriptorSetLayout {
    pub fn new(
        context: &Arc<DeviceContext>,
        name: &str,
        bindings: BTreeMap<u32, DescriptorBinding>,
    ) -> Result<Arc<DescriptorSetLayout>> {
        let handle = context.driver().create_descriptor_set_layout(&bindings)?;
        let base = ResourceBase::new(context.clone(), name);
        base.label(NamedObject::DescriptorSetLayout(handle));
        Ok(Arc::new(DescriptorSetLayout { base, handle, bindings }))
    }

    pub fn handle(&self) -> DescriptorSetLayoutHandle {
        self.handle
    }

    pub fn bindings(&self) -> &BTreeMap<u32, DescriptorBinding> {
        &self.bindings
    }

    pub fn binding(&self, index: u32) -> Option<&DescriptorBinding> {
        self.bindings.get(&index)
    }
}

impl DeviceResource for DescriptorSetLayout {
    fn base(&self) -> &ResourceBase {
        &self.base
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        self.base.driver().destroy_descriptor_set_layout(self.handle);
    }
}

// ===== DESCRIPTORS =====

/// Value bound to one (binding, array index) slot
#[derive(Debug, Clone)]
pub enum Descriptor {
    /// Byte range of a buffer
    Buffer { buffer: Arc<Buffer>, offset: u64, range: u64 },
    /// Image view, optionally paired with a sampler
    Image { view: TextureView, layout: ImageLayout, sampler: Option<SamplerHandle> },
    /// Opaque acceleration structure
    AccelerationStructure(AccelerationStructureHandle),
}

impl Descriptor {
    /// Buffer descriptor covering a typed view
    pub fn from_view<T>(view: &BufferView<T>) -> Self {
        Descriptor::Buffer { buffer: view.buffer().clone(), offset: view.offset(), range: view.size_bytes() }
    }

    /// Buffer descriptor covering a whole buffer
    pub fn whole_buffer(buffer: &Arc<Buffer>) -> Self {
        Descriptor::Buffer { buffer: buffer.clone(), offset: 0, range: buffer.size() }
    }

    /// Shader-read-only image descriptor
    pub fn sampled(view: &TextureView, sampler: Option<SamplerHandle>) -> Self {
        Descriptor::Image { view: view.clone(), layout: ImageLayout::ShaderReadOnlyOptimal, sampler }
    }

    fn kind(&self) -> DescriptorKind {
        match self {
            Descriptor::Buffer { .. } => DescriptorKind::Buffer,
            Descriptor::Image { .. } => DescriptorKind::Image,
            Descriptor::AccelerationStructure(_) => DescriptorKind::AccelerationStructure,
        }
    }

    fn write_info(&self) -> DescriptorWriteInfo {
        match self {
            Descriptor::Buffer { buffer, offset, range } => {
                DescriptorWriteInfo::Buffer { buffer: buffer.handle(), offset: *offset, range: *range }
            }
            Descriptor::Image { view, layout, sampler } => {
                DescriptorWriteInfo::Image { view: view.handle(), layout: *layout, sampler: *sampler }
            }
            Descriptor::AccelerationStructure(handle) => DescriptorWriteInfo::AccelerationStructure(*handle),
        }
    }
}

impl PartialEq for Descriptor {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Descriptor::Buffer { buffer: a, offset: ao, range: ar },
                Descriptor::Buffer { buffer: b, offset: bo, range: br },
            ) => Arc::ptr_eq(a, b) && ao == bo && ar == br,
            (
                Descriptor::Image { view: a, layout: al, sampler: asam },
                Descriptor::Image { view: b, layout: bl, sampler: bsam },
            ) => a == b && al == bl && asam == bsam,
            (Descriptor::AccelerationStructure(a), Descriptor::AccelerationStructure(b)) => a == b,
            _ => false,
        }
    }
}

// ===== SET =====

#[derive(Default)]
struct SetState {
    bound: FxHashMap<(u32, u32), Descriptor>,
    pending: BTreeSet<(u32, u32)>,
}

/// Descriptor set allocated from the device pool
///
/// Shared between command buffers; assignments and flushes are serialized by
/// an internal lock.
pub struct DescriptorSet {
    base: ResourceBase,
    handle: DescriptorSetHandle,
    layout: Arc<DescriptorSetLayout>,
    state: Mutex<SetState>,
}

impl DescriptorSet {
    pub fn new(
        context: &Arc<DeviceContext>,
        name: &str,
        layout: Arc<DescriptorSetLayout>,
    ) -> Result<Arc<DescriptorSet>> {
        let handle = context.driver().allocate_descriptor_set(context.descriptor_pool(), layout.handle())?;
        let base = ResourceBase::new(context.clone(), name);
        base.label(NamedObject::DescriptorSet(handle));
        vrg_trace!("vrg::descriptor_set", "Allocated descriptor set '{}'", name);
        Ok(Arc::new(DescriptorSet { base, handle, layout, state: Mutex::new(SetState::default()) }))
    }

    pub fn handle(&self) -> DescriptorSetHandle {
        self.handle
    }

    pub fn layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.layout
    }

    /// Store `descriptor` at (binding, index) and mark the slot dirty
    ///
    /// # Errors
    ///
    /// `InvalidUsage` when the layout has no such binding, the index is past
    /// the binding's count, or the payload does not fit the binding type.
    pub fn insert_or_assign(&self, binding: u32, index: u32, descriptor: Descriptor) -> Result<()> {
        let Some(declared) = self.layout.binding(binding) else {
            vrg_bail!("vrg::descriptor_set", "Set '{}' has no binding {}", self.name(), binding);
        };
        if index >= declared.count {
            vrg_bail!(
                "vrg::descriptor_set",
                "Set '{}': index {} out of range for binding {} (count {})",
                self.name(),
                index,
                binding,
                declared.count
            );
        }
        let expected = declared.descriptor_type.kind();
        if matches!(expected, DescriptorKind::TexelBuffer | DescriptorKind::InlineUniform) {
            vrg_bail!(
                "vrg::descriptor_set",
                "Set '{}': {:?} descriptors are not supported",
                self.name(),
                declared.descriptor_type
            );
        }
        if descriptor.kind() != expected {
            vrg_bail!(
                "vrg::descriptor_set",
                "Set '{}': binding {} expects a {:?} descriptor",
                self.name(),
                binding,
                declared.descriptor_type
            );
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.bound.insert((binding, index), descriptor);
        state.pending.insert((binding, index));
        Ok(())
    }

    pub fn get(&self, binding: u32, index: u32) -> Option<Descriptor> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).bound.get(&(binding, index)).cloned()
    }

    /// Buffers and textures referenced by the assigned descriptors, deduplicated
    pub fn referenced_resources(&self) -> Vec<Arc<dyn DeviceResource>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut resources: Vec<Arc<dyn DeviceResource>> = Vec::new();
        for descriptor in state.bound.values() {
            let resource: Arc<dyn DeviceResource> = match descriptor {
                Descriptor::Buffer { buffer, .. } => buffer.clone() as Arc<dyn DeviceResource>,
                Descriptor::Image { view, .. } => view.texture().clone() as Arc<dyn DeviceResource>,
                Descriptor::AccelerationStructure(_) => continue,
            };
            if !resources.iter().any(|held| std::ptr::addr_eq(Arc::as_ptr(held), Arc::as_ptr(&resource))) {
                resources.push(resource);
            }
        }
        resources
    }

    /// Number of slots assigned since the last flush
    pub fn pending_writes(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).pending.len()
    }

    /// Push every dirty slot to the device in one update
    ///
    /// Returns the number of writes issued; a clean set issues no driver call.
    pub fn flush_writes(&self) -> Result<usize> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.pending.is_empty() {
            return Ok(0);
        }

        let mut writes = Vec::with_capacity(state.pending.len());
        for key in &state.pending {
            let (Some(descriptor), Some(declared)) = (state.bound.get(key), self.layout.binding(key.0)) else {
                continue;
            };
            writes.push(DescriptorWrite {
                set: self.handle,
                binding: key.0,
                array_element: key.1,
                descriptor_type: declared.descriptor_type,
                info: descriptor.write_info(),
            });
        }

        self.base.driver().update_descriptor_sets(&writes);
        state.pending.clear();
        vrg_trace!("vrg::descriptor_set", "Flushed {} writes to '{}'", writes.len(), self.name());
        Ok(writes.len())
    }
}

impl DeviceResource for DescriptorSet {
    fn base(&self) -> &ResourceBase {
        &self.base
    }
}

impl Drop for DescriptorSet {
    fn drop(&mut self) {
        let context = self.base.context();
        context.driver().free_descriptor_set(context.descriptor_pool(), self.handle);
    }
}

#[cfg(test)]
#[path = "descriptor_set_tests.rs"]
mod tests;
