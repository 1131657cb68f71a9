//! Native driver seam
//!
//! Everything the core needs from the GPU API goes through [`Driver`]. Native
//! objects are identified by opaque `u64` handles; a backend maps them onto
//! its own handle types. A driver is shared by every resource of a device, so
//! it must be `Send + Sync`; native objects that the API declares externally
//! synchronized (command pools, command buffers, descriptor sets) are only
//! touched by the core from one recorder at a time.

use std::collections::BTreeMap;
use std::ptr::NonNull;

use crate::descriptor_set::DescriptorBinding;
use crate::error::Result;
use crate::pipeline::{GraphicsPipelineCreateInfo, PushConstantRange};
use crate::render_pass::RenderPassLayout;
use crate::types::*;

#[cfg(test)]
pub(crate) mod mock;

// ===== HANDLES =====

macro_rules! define_handles {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
            pub struct $name(pub u64);

            impl $name {
                pub const NULL: Self = Self(0);

                pub fn is_null(self) -> bool {
                    self.0 == 0
                }
            }
        )*
    };
}

define_handles!(
    /// Device memory block
    MemoryHandle,
    BufferHandle,
    ImageHandle,
    ImageViewHandle,
    SamplerHandle,
    FenceHandle,
    SemaphoreHandle,
    QueueHandle,
    CommandPoolHandle,
    CommandBufferHandle,
    DescriptorPoolHandle,
    DescriptorSetLayoutHandle,
    DescriptorSetHandle,
    RenderPassHandle,
    FramebufferHandle,
    ShaderModuleHandle,
    PipelineLayoutHandle,
    PipelineHandle,
    /// Presentation engine swapchain, owned by the windowing layer
    SwapchainHandle,
    /// Opaque ray-tracing acceleration structure
    AccelerationStructureHandle,
);

/// Native object that can carry a debug name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamedObject {
    Buffer(BufferHandle),
    Image(ImageHandle),
    ImageView(ImageViewHandle),
    Fence(FenceHandle),
    Semaphore(SemaphoreHandle),
    CommandBuffer(CommandBufferHandle),
    DescriptorSet(DescriptorSetHandle),
    DescriptorSetLayout(DescriptorSetLayoutHandle),
    RenderPass(RenderPassHandle),
    Framebuffer(FramebufferHandle),
    ShaderModule(ShaderModuleHandle),
    PipelineLayout(PipelineLayoutHandle),
    Pipeline(PipelineHandle),
}

// ===== MEMORY =====

/// Size/alignment/type constraints reported for a buffer or image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    pub memory_type_bits: u32,
    /// Buffers and linear-tiled images; optimal-tiled images must not share
    /// a granularity page with linear resources
    pub linear: bool,
}

/// Host address of persistently mapped memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedPtr(pub NonNull<u8>);

// The mapping stays valid until the memory is freed; access is ordered by the
// owner of the allocation.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

/// A block of device memory as returned by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawAllocation {
    pub memory: MemoryHandle,
    pub offset: u64,
    pub size: u64,
    pub mapped: Option<MappedPtr>,
}

// ===== CREATE INFOS =====

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferCreateInfo {
    pub size: u64,
    pub usage: BufferUsageFlags,
    pub sharing_mode: SharingMode,
    /// Only read with `SharingMode::Concurrent`
    pub queue_family_indices: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCreateInfo {
    pub image_type: ImageType,
    pub format: Format,
    pub extent: Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: SampleCount,
    pub usage: ImageUsageFlags,
    pub sharing_mode: SharingMode,
    pub cube_compatible: bool,
}

/// Mip/layer/aspect range of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SubresourceRange {
    pub aspect: ImageAspectFlags,
    pub base_mip_level: u32,
    pub level_count: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageViewCreateInfo {
    pub image: ImageHandle,
    pub view_type: ImageViewType,
    pub format: Format,
    pub components: ComponentMapping,
    pub range: SubresourceRange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferCreateInfo {
    pub render_pass: RenderPassHandle,
    pub attachments: Vec<ImageViewHandle>,
    pub extent: Extent2D,
    pub layers: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorPoolCreateInfo {
    pub max_sets: u32,
    pub pool_sizes: Vec<(DescriptorType, u32)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineLayoutCreateInfo {
    pub set_layouts: Vec<DescriptorSetLayoutHandle>,
    pub push_constant_ranges: Vec<PushConstantRange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputePipelineCreateInfo {
    pub layout: PipelineLayoutHandle,
    pub module: ShaderModuleHandle,
    pub entry_point: String,
}

// ===== COMMAND PAYLOADS =====

/// Image layout transition with its memory dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: ImageHandle,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
    pub range: SubresourceRange,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderPassBeginInfo {
    pub render_pass: RenderPassHandle,
    pub framebuffer: FramebufferHandle,
    pub render_area: Rect2D,
    pub clear_values: Vec<ClearValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

/// Payload of one descriptor write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorWriteInfo {
    Buffer {
        buffer: BufferHandle,
        offset: u64,
        range: u64,
    },
    Image {
        view: ImageViewHandle,
        layout: ImageLayout,
        sampler: Option<SamplerHandle>,
    },
    AccelerationStructure(AccelerationStructureHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub set: DescriptorSetHandle,
    pub binding: u32,
    pub array_element: u32,
    pub descriptor_type: DescriptorType,
    pub info: DescriptorWriteInfo,
}

// ===== QUEUES =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyProperties {
    pub index: u32,
    pub flags: QueueFlags,
    pub queue_count: u32,
}

pub struct SubmitInfo<'a> {
    pub command_buffer: CommandBufferHandle,
    pub wait_semaphores: &'a [(SemaphoreHandle, PipelineStageFlags)],
    pub signal_semaphores: &'a [SemaphoreHandle],
    pub fence: FenceHandle,
}

pub struct PresentInfo<'a> {
    pub swapchain: SwapchainHandle,
    pub image_index: u32,
    pub wait_semaphores: &'a [SemaphoreHandle],
}

// ===== DRIVER TRAIT =====

/// Native graphics API as seen by the core
pub trait Driver: Send + Sync {
    // ----- device -----

    fn queue_families(&self) -> Vec<QueueFamilyProperties>;
    fn get_queue(&self, family_index: u32, queue_index: u32) -> QueueHandle;
    fn device_wait_idle(&self) -> Result<()>;

    /// Attach a debug name to a native object (no-op when unsupported)
    fn set_object_name(&self, _object: NamedObject, _name: &str) {}

    // ----- memory -----

    fn allocate_memory(
        &self,
        requirements: &MemoryRequirements,
        location: MemoryLocation,
        name: &str,
    ) -> Result<RawAllocation>;
    fn free_memory(&self, memory: MemoryHandle);

    // ----- buffers and images -----

    fn create_buffer(&self, info: &BufferCreateInfo) -> Result<BufferHandle>;
    fn buffer_memory_requirements(&self, buffer: BufferHandle) -> MemoryRequirements;
    fn bind_buffer_memory(&self, buffer: BufferHandle, allocation: &RawAllocation) -> Result<()>;
    fn destroy_buffer(&self, buffer: BufferHandle);

    fn create_image(&self, info: &ImageCreateInfo) -> Result<ImageHandle>;
    fn image_memory_requirements(&self, image: ImageHandle) -> MemoryRequirements;
    fn bind_image_memory(&self, image: ImageHandle, allocation: &RawAllocation) -> Result<()>;
    fn destroy_image(&self, image: ImageHandle);

    fn create_image_view(&self, info: &ImageViewCreateInfo) -> Result<ImageViewHandle>;
    fn destroy_image_view(&self, view: ImageViewHandle);

    // ----- synchronization -----

    fn create_fence(&self, signaled: bool) -> Result<FenceHandle>;
    fn destroy_fence(&self, fence: FenceHandle);
    /// Non-blocking poll, `true` when signaled
    fn get_fence_status(&self, fence: FenceHandle) -> Result<bool>;
    /// Blocking wait bounded by `timeout_ns`, `false` on timeout
    fn wait_for_fence(&self, fence: FenceHandle, timeout_ns: u64) -> Result<bool>;
    fn reset_fence(&self, fence: FenceHandle) -> Result<()>;

    fn create_semaphore(&self) -> Result<SemaphoreHandle>;
    fn destroy_semaphore(&self, semaphore: SemaphoreHandle);

    // ----- descriptors -----

    fn create_descriptor_pool(&self, info: &DescriptorPoolCreateInfo) -> Result<DescriptorPoolHandle>;
    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle);
    fn create_descriptor_set_layout(
        &self,
        bindings: &BTreeMap<u32, DescriptorBinding>,
    ) -> Result<DescriptorSetLayoutHandle>;
    fn destroy_descriptor_set_layout(&self, layout: DescriptorSetLayoutHandle);
    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
    ) -> Result<DescriptorSetHandle>;
    fn free_descriptor_set(&self, pool: DescriptorPoolHandle, set: DescriptorSetHandle);
    /// One native update call covering every write
    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]);

    // ----- passes and pipelines -----

    fn create_render_pass(&self, layout: &RenderPassLayout) -> Result<RenderPassHandle>;
    fn destroy_render_pass(&self, render_pass: RenderPassHandle);
    fn create_framebuffer(&self, info: &FramebufferCreateInfo) -> Result<FramebufferHandle>;
    fn destroy_framebuffer(&self, framebuffer: FramebufferHandle);

    fn create_shader_module(&self, spirv: &[u32]) -> Result<ShaderModuleHandle>;
    fn destroy_shader_module(&self, module: ShaderModuleHandle);
    fn create_pipeline_layout(&self, info: &PipelineLayoutCreateInfo) -> Result<PipelineLayoutHandle>;
    fn destroy_pipeline_layout(&self, layout: PipelineLayoutHandle);
    fn create_graphics_pipeline(&self, info: &GraphicsPipelineCreateInfo) -> Result<PipelineHandle>;
    fn create_compute_pipeline(&self, info: &ComputePipelineCreateInfo) -> Result<PipelineHandle>;
    fn destroy_pipeline(&self, pipeline: PipelineHandle);

    // ----- command pools and buffers -----

    /// Pool whose buffers can be reset individually
    fn create_command_pool(&self, family_index: u32) -> Result<CommandPoolHandle>;
    fn destroy_command_pool(&self, pool: CommandPoolHandle);
    fn allocate_command_buffer(
        &self,
        pool: CommandPoolHandle,
        level: CommandBufferLevel,
    ) -> Result<CommandBufferHandle>;
    fn free_command_buffer(&self, pool: CommandPoolHandle, command_buffer: CommandBufferHandle);
    /// Open a one-time-submit recording scope
    fn begin_command_buffer(&self, command_buffer: CommandBufferHandle) -> Result<()>;
    fn end_command_buffer(&self, command_buffer: CommandBufferHandle) -> Result<()>;
    fn reset_command_buffer(&self, command_buffer: CommandBufferHandle) -> Result<()>;

    // ----- recording -----

    fn cmd_pipeline_barrier(
        &self,
        command_buffer: CommandBufferHandle,
        src_stage: PipelineStageFlags,
        dst_stage: PipelineStageFlags,
        barriers: &[ImageBarrier],
    );
    fn cmd_begin_render_pass(&self, command_buffer: CommandBufferHandle, info: &RenderPassBeginInfo);
    fn cmd_next_subpass(&self, command_buffer: CommandBufferHandle);
    fn cmd_end_render_pass(&self, command_buffer: CommandBufferHandle);
    fn cmd_bind_pipeline(
        &self,
        command_buffer: CommandBufferHandle,
        bind_point: PipelineBindPoint,
        pipeline: PipelineHandle,
    );
    fn cmd_bind_vertex_buffer(
        &self,
        command_buffer: CommandBufferHandle,
        binding: u32,
        buffer: BufferHandle,
        offset: u64,
    );
    fn cmd_bind_index_buffer(
        &self,
        command_buffer: CommandBufferHandle,
        buffer: BufferHandle,
        offset: u64,
        index_type: IndexType,
    );
    fn cmd_bind_descriptor_set(
        &self,
        command_buffer: CommandBufferHandle,
        bind_point: PipelineBindPoint,
        layout: PipelineLayoutHandle,
        set_index: u32,
        set: DescriptorSetHandle,
    );
    fn cmd_push_constants(
        &self,
        command_buffer: CommandBufferHandle,
        layout: PipelineLayoutHandle,
        stages: ShaderStageFlags,
        offset: u32,
        data: &[u8],
    );
    fn cmd_set_viewport(&self, command_buffer: CommandBufferHandle, viewport: &Viewport);
    fn cmd_set_scissor(&self, command_buffer: CommandBufferHandle, scissor: &Rect2D);
    fn cmd_draw(
        &self,
        command_buffer: CommandBufferHandle,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );
    fn cmd_draw_indexed(
        &self,
        command_buffer: CommandBufferHandle,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
    fn cmd_dispatch(&self, command_buffer: CommandBufferHandle, x: u32, y: u32, z: u32);
    fn cmd_copy_buffer(
        &self,
        command_buffer: CommandBufferHandle,
        src: BufferHandle,
        dst: BufferHandle,
        regions: &[BufferCopy],
    );
    fn cmd_begin_label(&self, command_buffer: CommandBufferHandle, name: &str, color: [f32; 4]);
    fn cmd_end_label(&self, command_buffer: CommandBufferHandle);

    // ----- queues -----

    fn queue_submit(&self, queue: QueueHandle, submit: &SubmitInfo<'_>) -> Result<()>;
    /// Returns `true` when the swapchain is suboptimal
    fn queue_present(&self, queue: QueueHandle, present: &PresentInfo<'_>) -> Result<bool>;
}
