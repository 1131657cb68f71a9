//! Images with hazard tracking and cached views
//!
//! Every texture remembers the last synchronization point applied to it on
//! the current execution timeline: layout, pipeline stage and access mask.
//! A transition emits one image barrier from that state to the target layout
//! and records the new state while still holding the tracker lock, so the
//! stored state always matches the last barrier recorded.
//!
//! The lock makes the tracker free of data races, not free of ordering
//! hazards: two command buffers recorded concurrently that transition the
//! same texture must still be serialized by the caller.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashMap;

use crate::command_buffer::CommandBuffer;
use crate::device::DeviceContext;
use crate::driver::{
    ImageBarrier, ImageCreateInfo, ImageHandle, ImageViewCreateInfo, ImageViewHandle, NamedObject,
    SubresourceRange,
};
use crate::error::Result;
use crate::memory::MemoryAllocation;
use crate::render_pass::AttachmentDescription;
use crate::resource::{DeviceResource, ResourceBase};
use crate::types::*;
use crate::{vrg_bail, vrg_trace};

// ===== LAYOUT TABLE =====

/// Pipeline stage at which a resource in `layout` is accessed
pub fn guess_stage(layout: ImageLayout) -> PipelineStageFlags {
    match layout {
        ImageLayout::Undefined => PipelineStageFlags::TOP_OF_PIPE,
        ImageLayout::General => PipelineStageFlags::COMPUTE_SHADER,
        ImageLayout::ColorAttachmentOptimal => PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ImageLayout::DepthStencilAttachmentOptimal
        | ImageLayout::DepthAttachmentOptimal
        | ImageLayout::StencilAttachmentOptimal
        | ImageLayout::DepthReadOnlyStencilAttachmentOptimal
        | ImageLayout::DepthAttachmentStencilReadOnlyOptimal => {
            PipelineStageFlags::EARLY_FRAGMENT_TESTS | PipelineStageFlags::LATE_FRAGMENT_TESTS
        }
        ImageLayout::DepthStencilReadOnlyOptimal
        | ImageLayout::DepthReadOnlyOptimal
        | ImageLayout::StencilReadOnlyOptimal => {
            PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | PipelineStageFlags::LATE_FRAGMENT_TESTS
                | PipelineStageFlags::FRAGMENT_SHADER
        }
        ImageLayout::ShaderReadOnlyOptimal => PipelineStageFlags::FRAGMENT_SHADER,
        ImageLayout::TransferSrcOptimal | ImageLayout::TransferDstOptimal => PipelineStageFlags::TRANSFER,
        ImageLayout::Preinitialized => PipelineStageFlags::HOST,
        ImageLayout::PresentSrc | ImageLayout::SharedPresent => PipelineStageFlags::BOTTOM_OF_PIPE,
    }
}

/// Memory access performed on a resource in `layout`
pub fn guess_access(layout: ImageLayout) -> AccessFlags {
    match layout {
        ImageLayout::Undefined | ImageLayout::PresentSrc | ImageLayout::SharedPresent => {
            AccessFlags::empty()
        }
        ImageLayout::General => AccessFlags::SHADER_READ | AccessFlags::SHADER_WRITE,
        ImageLayout::ColorAttachmentOptimal => {
            AccessFlags::COLOR_ATTACHMENT_READ | AccessFlags::COLOR_ATTACHMENT_WRITE
        }
        ImageLayout::DepthStencilAttachmentOptimal
        | ImageLayout::DepthAttachmentOptimal
        | ImageLayout::StencilAttachmentOptimal
        | ImageLayout::DepthReadOnlyStencilAttachmentOptimal
        | ImageLayout::DepthAttachmentStencilReadOnlyOptimal => {
            AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        }
        ImageLayout::DepthStencilReadOnlyOptimal
        | ImageLayout::DepthReadOnlyOptimal
        | ImageLayout::StencilReadOnlyOptimal => {
            AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | AccessFlags::SHADER_READ
        }
        ImageLayout::ShaderReadOnlyOptimal => AccessFlags::SHADER_READ,
        ImageLayout::TransferSrcOptimal => AccessFlags::TRANSFER_READ,
        ImageLayout::TransferDstOptimal => AccessFlags::TRANSFER_WRITE,
        ImageLayout::Preinitialized => AccessFlags::HOST_WRITE,
    }
}

/// Full mip chain length for an extent
pub fn max_mips(extent: Extent3D) -> u32 {
    let largest = extent.width.max(extent.height).max(extent.depth);
    32 - largest.leading_zeros()
}

/// Last synchronization point applied to a texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackedState {
    pub layout: ImageLayout,
    pub stages: PipelineStageFlags,
    pub access: AccessFlags,
}

impl TrackedState {
    /// State a resource is in right after a transition to `layout`
    pub fn for_layout(layout: ImageLayout) -> Self {
        Self { layout, stages: guess_stage(layout), access: guess_access(layout) }
    }
}

impl Default for TrackedState {
    fn default() -> Self {
        Self {
            layout: ImageLayout::Undefined,
            stages: PipelineStageFlags::TOP_OF_PIPE,
            access: AccessFlags::empty(),
        }
    }
}

// ===== DESCRIPTORS =====

/// Texture creation parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureDesc {
    pub image_type: ImageType,
    pub format: Format,
    pub extent: Extent3D,
    /// `None` selects the full mip chain (one level for multisampled images)
    pub mip_levels: Option<u32>,
    pub array_layers: u32,
    pub samples: SampleCount,
    pub usage: ImageUsageFlags,
    pub location: MemoryLocation,
    pub sharing_mode: SharingMode,
    pub cube_compatible: bool,
}

impl Default for TextureDesc {
    fn default() -> Self {
        Self {
            image_type: ImageType::D2,
            format: Format::R8G8B8A8_UNORM,
            extent: Extent3D::new(1, 1, 1),
            mip_levels: None,
            array_layers: 1,
            samples: SampleCount::S1,
            usage: ImageUsageFlags::SAMPLED | ImageUsageFlags::TRANSFER_DST,
            location: MemoryLocation::GpuOnly,
            sharing_mode: SharingMode::Exclusive,
            cube_compatible: false,
        }
    }
}

/// Requested view subrange; zero counts mean "all remaining", an empty
/// aspect means the texture's own aspect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TextureViewDesc {
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
    pub aspect: ImageAspectFlags,
    pub components: ComponentMapping,
}

// ===== TEXTURE =====

/// Image resource with tracked GPU state
pub struct Texture {
    base: ResourceBase,
    handle: ImageHandle,
    allocation: Option<MemoryAllocation>,
    owns_image: bool,
    image_type: ImageType,
    format: Format,
    extent: Extent3D,
    mip_levels: u32,
    array_layers: u32,
    samples: SampleCount,
    usage: ImageUsageFlags,
    cube_compatible: bool,
    aspect: ImageAspectFlags,
    tracked: Mutex<TrackedState>,
    views: Mutex<FxHashMap<TextureViewDesc, ImageViewHandle>>,
}

impl Texture {
    /// Create an image and bind memory from the device arena
    pub fn new(context: &Arc<DeviceContext>, name: &str, desc: &TextureDesc) -> Result<Arc<Texture>> {
        let extent = desc.extent;
        if extent.width == 0 || extent.height == 0 || extent.depth == 0 || desc.array_layers == 0 {
            vrg_bail!("vrg::texture", "Texture '{}' has an empty extent {:?}", name, extent);
        }
        let mip_levels = resolve_mip_levels(desc);
        if mip_levels == 0 || mip_levels > max_mips(extent) {
            vrg_bail!(
                "vrg::texture",
                "Texture '{}': {} mip levels invalid for extent {:?}",
                name,
                mip_levels,
                extent
            );
        }

        let driver = context.driver();
        let handle = driver.create_image(&ImageCreateInfo {
            image_type: desc.image_type,
            format: desc.format,
            extent,
            mip_levels,
            array_layers: desc.array_layers,
            samples: desc.samples,
            usage: desc.usage,
            sharing_mode: desc.sharing_mode,
            cube_compatible: desc.cube_compatible,
        })?;

        let requirements = driver.image_memory_requirements(handle);
        let allocation = match context.memory().allocate(&requirements, desc.location, name) {
            Ok(allocation) => allocation,
            Err(e) => {
                driver.destroy_image(handle);
                return Err(e);
            }
        };
        if let Err(e) = driver.bind_image_memory(handle, allocation.raw()) {
            context.memory().free(allocation);
            driver.destroy_image(handle);
            return Err(e);
        }

        vrg_trace!("vrg::texture", "Created texture '{}' {:?} {:?}", name, desc.format, extent);
        Ok(Arc::new(Self::assemble(context, name, handle, Some(allocation), true, desc, mip_levels)))
    }

    /// Wrap an image owned elsewhere (e.g. a swapchain image)
    ///
    /// The image is neither destroyed nor given memory by this texture.
    pub fn from_raw(
        context: &Arc<DeviceContext>,
        name: &str,
        image: ImageHandle,
        desc: &TextureDesc,
    ) -> Arc<Texture> {
        let mip_levels = resolve_mip_levels(desc).max(1);
        Arc::new(Self::assemble(context, name, image, None, false, desc, mip_levels))
    }

    /// Texture matching an attachment description
    pub fn for_attachment(
        context: &Arc<DeviceContext>,
        name: &str,
        extent: Extent2D,
        attachment: &AttachmentDescription,
        extra_usage: ImageUsageFlags,
    ) -> Result<Arc<Texture>> {
        let attachment_usage = if attachment.format.is_depth_stencil() {
            ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
        } else {
            ImageUsageFlags::COLOR_ATTACHMENT
        };
        Self::new(
            context,
            name,
            &TextureDesc {
                format: attachment.format,
                extent: Extent3D::new(extent.width, extent.height, 1),
                mip_levels: Some(1),
                samples: attachment.samples,
                usage: attachment_usage | extra_usage,
                ..Default::default()
            },
        )
    }

    fn assemble(
        context: &Arc<DeviceContext>,
        name: &str,
        handle: ImageHandle,
        allocation: Option<MemoryAllocation>,
        owns_image: bool,
        desc: &TextureDesc,
        mip_levels: u32,
    ) -> Texture {
        let base = ResourceBase::new(context.clone(), name);
        base.label(NamedObject::Image(handle));
        Texture {
            base,
            handle,
            allocation,
            owns_image,
            image_type: desc.image_type,
            format: desc.format,
            extent: desc.extent,
            mip_levels,
            array_layers: desc.array_layers.max(1),
            samples: desc.samples,
            usage: desc.usage,
            cube_compatible: desc.cube_compatible,
            aspect: desc.format.aspect_flags(),
            tracked: Mutex::new(TrackedState::default()),
            views: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn handle(&self) -> ImageHandle {
        self.handle
    }

    pub fn image_type(&self) -> ImageType {
        self.image_type
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn extent(&self) -> Extent3D {
        self.extent
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub fn array_layers(&self) -> u32 {
        self.array_layers
    }

    pub fn samples(&self) -> SampleCount {
        self.samples
    }

    pub fn usage(&self) -> ImageUsageFlags {
        self.usage
    }

    pub fn aspect(&self) -> ImageAspectFlags {
        self.aspect
    }

    /// Every mip level and layer of the texture's aspect
    pub fn full_range(&self) -> SubresourceRange {
        SubresourceRange {
            aspect: self.aspect,
            base_mip_level: 0,
            level_count: self.mip_levels,
            base_array_layer: 0,
            layer_count: self.array_layers,
        }
    }

    // ===== HAZARD TRACKING =====

    fn tracker(&self) -> MutexGuard<'_, TrackedState> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn tracked_state(&self) -> TrackedState {
        *self.tracker()
    }

    /// Overwrite the tracked state without recording a barrier
    ///
    /// Used when something other than a barrier (a render pass' final
    /// layout, a presentation engine handoff) moved the image.
    pub fn set_tracked_state(&self, state: TrackedState) {
        *self.tracker() = state;
    }

    /// Transition from the tracked layout to `new_layout`
    pub fn transition_barrier(self: &Arc<Self>, cmd: &mut CommandBuffer, new_layout: ImageLayout) -> Result<()> {
        let mut tracked = self.tracker();
        let old_layout = tracked.layout;
        self.transition_locked(&mut tracked, cmd, old_layout, new_layout)
    }

    /// Transition with an explicit source layout
    ///
    /// No-op when `old_layout == new_layout`. A transition to `Undefined`
    /// discards the contents: tracked state is reset and no barrier is
    /// recorded. Anything else records exactly one barrier whose source
    /// stage/access come from the tracker.
    pub fn transition_barrier_from(
        self: &Arc<Self>,
        cmd: &mut CommandBuffer,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
    ) -> Result<()> {
        let mut tracked = self.tracker();
        self.transition_locked(&mut tracked, cmd, old_layout, new_layout)
    }

    fn transition_locked(
        self: &Arc<Self>,
        tracked: &mut TrackedState,
        cmd: &mut CommandBuffer,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
    ) -> Result<()> {
        if old_layout == new_layout {
            return Ok(());
        }
        if new_layout == ImageLayout::Undefined {
            *tracked = TrackedState::default();
            return Ok(());
        }

        let target = TrackedState::for_layout(new_layout);
        cmd.record_image_barrier(
            self.clone(),
            tracked.stages,
            target.stages,
            ImageBarrier {
                image: self.handle,
                old_layout,
                new_layout,
                src_access: tracked.access,
                dst_access: target.access,
                range: self.full_range(),
            },
        )?;
        *tracked = target;
        Ok(())
    }

    // ===== VIEWS =====

    /// Cached view over a subrange
    ///
    /// Views with the same resolved subrange, aspect and swizzle are created
    /// once and shared.
    pub fn view(self: &Arc<Self>, desc: &TextureViewDesc) -> Result<TextureView> {
        let key = self.resolve_view_desc(desc)?;
        let mut views = self.views.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = match views.get(&key) {
            Some(handle) => *handle,
            None => {
                let handle = self.base.driver().create_image_view(&ImageViewCreateInfo {
                    image: self.handle,
                    view_type: self.view_type(key.layer_count),
                    format: self.format,
                    components: key.components,
                    range: range_of(&key),
                })?;
                self.base.label(NamedObject::ImageView(handle));
                vrg_trace!("vrg::texture", "Created view {:?} of '{}'", key, self.name());
                views.insert(key, handle);
                handle
            }
        };
        Ok(TextureView { texture: self.clone(), handle, range: range_of(&key) })
    }

    /// View of the whole texture
    pub fn default_view(self: &Arc<Self>) -> Result<TextureView> {
        self.view(&TextureViewDesc::default())
    }

    pub fn cached_view_count(&self) -> usize {
        self.views.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn resolve_view_desc(&self, desc: &TextureViewDesc) -> Result<TextureViewDesc> {
        if desc.base_mip >= self.mip_levels || desc.base_layer >= self.array_layers {
            vrg_bail!("vrg::texture", "View {:?} starts outside of '{}'", desc, self.name());
        }
        let mip_count = if desc.mip_count == 0 { self.mip_levels - desc.base_mip } else { desc.mip_count };
        let layer_count =
            if desc.layer_count == 0 { self.array_layers - desc.base_layer } else { desc.layer_count };
        if desc.base_mip + mip_count > self.mip_levels || desc.base_layer + layer_count > self.array_layers {
            vrg_bail!("vrg::texture", "View {:?} exceeds the subresources of '{}'", desc, self.name());
        }
        let aspect = if desc.aspect.is_empty() { self.aspect } else { desc.aspect };
        if !self.aspect.contains(aspect) {
            vrg_bail!("vrg::texture", "Aspect {:?} not present in '{}'", aspect, self.name());
        }
        Ok(TextureViewDesc { mip_count, layer_count, aspect, ..*desc })
    }

    fn view_type(&self, layer_count: u32) -> ImageViewType {
        match self.image_type {
            ImageType::D1 if layer_count > 1 => ImageViewType::D1Array,
            ImageType::D1 => ImageViewType::D1,
            ImageType::D2 if self.cube_compatible && layer_count == 6 => ImageViewType::Cube,
            ImageType::D2 if self.cube_compatible && layer_count % 6 == 0 => ImageViewType::CubeArray,
            ImageType::D2 if layer_count > 1 => ImageViewType::D2Array,
            ImageType::D2 => ImageViewType::D2,
            ImageType::D3 => ImageViewType::D3,
        }
    }
}

fn resolve_mip_levels(desc: &TextureDesc) -> u32 {
    match desc.mip_levels {
        Some(levels) => levels,
        None if desc.samples != SampleCount::S1 => 1,
        None => max_mips(desc.extent),
    }
}

fn range_of(key: &TextureViewDesc) -> SubresourceRange {
    SubresourceRange {
        aspect: key.aspect,
        base_mip_level: key.base_mip,
        level_count: key.mip_count,
        base_array_layer: key.base_layer,
        layer_count: key.layer_count,
    }
}

impl DeviceResource for Texture {
    fn base(&self) -> &ResourceBase {
        &self.base
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        let context = self.base.context().clone();
        let views = self.views.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, view) in views.drain() {
            context.driver().destroy_image_view(view);
        }
        if self.owns_image {
            context.driver().destroy_image(self.handle);
        }
        if let Some(allocation) = self.allocation.take() {
            context.memory().free(allocation);
        }
    }
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("name", &self.name())
            .field("format", &self.format)
            .field("extent", &self.extent)
            .field("tracked", &self.tracked_state())
            .finish()
    }
}

// ===== VIEW =====

/// Immutable subrange of a texture
///
/// Cheap to clone; keeps its texture alive.
#[derive(Clone)]
pub struct TextureView {
    texture: Arc<Texture>,
    handle: ImageViewHandle,
    range: SubresourceRange,
}

impl TextureView {
    pub fn texture(&self) -> &Arc<Texture> {
        &self.texture
    }

    pub fn handle(&self) -> ImageViewHandle {
        self.handle
    }

    pub fn range(&self) -> SubresourceRange {
        self.range
    }
}

impl PartialEq for TextureView {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.texture, &other.texture) && self.handle == other.handle
    }
}

impl std::fmt::Debug for TextureView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextureView")
            .field("texture", &self.texture.name())
            .field("handle", &self.handle)
            .field("range", &self.range)
            .finish()
    }
}

#[cfg(test)]
#[path = "texture_tests.rs"]
mod tests;
