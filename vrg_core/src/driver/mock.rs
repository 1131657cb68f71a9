/// Mock driver for unit tests (no GPU required)
///
/// Records every native call as a string command, keeps host-memory backed
/// allocations so mapped buffers can be read back, and leaves fences
/// unsignaled after submission until a test signals them (or waits idle).

use std::alloc::{self, Layout};
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;

use super::*;
use crate::descriptor_set::DescriptorBinding;
use crate::device::{Device, DeviceConfig};
use crate::error::{Error, Result};
use crate::pipeline::{GraphicsPipelineCreateInfo, ShaderModule, ShaderReflection};
use crate::render_pass::RenderPassLayout;

// ============================================================================
// Mock Driver
// ============================================================================

pub struct MockDriver {
    next_handle: AtomicU64,
    families: Vec<QueueFamilyProperties>,
    commands: Mutex<Vec<String>>,
    barriers: Mutex<Vec<(PipelineStageFlags, PipelineStageFlags, ImageBarrier)>>,
    descriptor_updates: Mutex<Vec<Vec<DescriptorWrite>>>,
    fences: Mutex<FxHashMap<FenceHandle, bool>>,
    buffer_sizes: Mutex<FxHashMap<BufferHandle, u64>>,
    image_sizes: Mutex<FxHashMap<ImageHandle, u64>>,
    host_memory: Mutex<FxHashMap<MemoryHandle, (usize, Layout)>>,
    render_passes: Mutex<Vec<RenderPassLayout>>,
    graphics_pipelines: Mutex<Vec<GraphicsPipelineCreateInfo>>,
    names: Mutex<Vec<(NamedObject, String)>>,
    fail_next_submit: Mutex<bool>,
}

impl MockDriver {
    /// One graphics+compute+transfer family and one transfer-only family
    pub fn new() -> Self {
        Self::with_families(vec![
            QueueFamilyProperties {
                index: 0,
                flags: QueueFlags::GRAPHICS | QueueFlags::COMPUTE | QueueFlags::TRANSFER,
                queue_count: 1,
            },
            QueueFamilyProperties {
                index: 1,
                flags: QueueFlags::TRANSFER,
                queue_count: 1,
            },
        ])
    }

    pub fn with_families(families: Vec<QueueFamilyProperties>) -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            families,
            commands: Mutex::new(Vec::new()),
            barriers: Mutex::new(Vec::new()),
            descriptor_updates: Mutex::new(Vec::new()),
            fences: Mutex::new(FxHashMap::default()),
            buffer_sizes: Mutex::new(FxHashMap::default()),
            image_sizes: Mutex::new(FxHashMap::default()),
            host_memory: Mutex::new(FxHashMap::default()),
            render_passes: Mutex::new(Vec::new()),
            graphics_pipelines: Mutex::new(Vec::new()),
            names: Mutex::new(Vec::new()),
            fail_next_submit: Mutex::new(false),
        }
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn record(&self, command: impl Into<String>) {
        self.commands.lock().unwrap().push(command.into());
    }

    // ===== INSPECTION =====

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Number of recorded commands whose name starts with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.commands.lock().unwrap().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn clear_commands(&self) {
        self.commands.lock().unwrap().clear();
        self.barriers.lock().unwrap().clear();
    }

    pub fn barriers(&self) -> Vec<(PipelineStageFlags, PipelineStageFlags, ImageBarrier)> {
        self.barriers.lock().unwrap().clone()
    }

    pub fn descriptor_updates(&self) -> Vec<Vec<DescriptorWrite>> {
        self.descriptor_updates.lock().unwrap().clone()
    }

    pub fn render_passes(&self) -> Vec<RenderPassLayout> {
        self.render_passes.lock().unwrap().clone()
    }

    pub fn graphics_pipelines(&self) -> Vec<GraphicsPipelineCreateInfo> {
        self.graphics_pipelines.lock().unwrap().clone()
    }

    pub fn object_names(&self) -> Vec<(NamedObject, String)> {
        self.names.lock().unwrap().clone()
    }

    pub fn live_host_allocations(&self) -> usize {
        self.host_memory.lock().unwrap().len()
    }

    // ===== CONTROL =====

    pub fn signal_fence(&self, fence: FenceHandle) {
        if let Some(state) = self.fences.lock().unwrap().get_mut(&fence) {
            *state = true;
        }
    }

    pub fn signal_all_fences(&self) {
        for state in self.fences.lock().unwrap().values_mut() {
            *state = true;
        }
    }

    pub fn fail_next_submit(&self) {
        *self.fail_next_submit.lock().unwrap() = true;
    }
}

impl Drop for MockDriver {
    fn drop(&mut self) {
        for (_, (address, layout)) in self.host_memory.lock().unwrap().drain() {
            unsafe { alloc::dealloc(address as *mut u8, layout) };
        }
    }
}

impl Driver for MockDriver {
    fn queue_families(&self) -> Vec<QueueFamilyProperties> {
        self.families.clone()
    }

    fn get_queue(&self, family_index: u32, queue_index: u32) -> QueueHandle {
        QueueHandle(1000 + (family_index as u64) * 16 + queue_index as u64)
    }

    fn device_wait_idle(&self) -> Result<()> {
        self.record("device_wait_idle");
        self.signal_all_fences();
        Ok(())
    }

    fn set_object_name(&self, object: NamedObject, name: &str) {
        self.names.lock().unwrap().push((object, name.to_string()));
    }

    fn allocate_memory(
        &self,
        requirements: &MemoryRequirements,
        location: MemoryLocation,
        name: &str,
    ) -> Result<RawAllocation> {
        let memory = MemoryHandle(self.handle());
        self.record(format!("allocate_memory({})", name));
        let mapped = if location.is_host_visible() {
            let layout = Layout::from_size_align(
                requirements.size.max(1) as usize,
                requirements.alignment.max(16) as usize,
            )
            .map_err(|_| Error::OutOfMemory)?;
            let ptr = unsafe { alloc::alloc_zeroed(layout) };
            let ptr = NonNull::new(ptr).ok_or(Error::OutOfMemory)?;
            self.host_memory.lock().unwrap().insert(memory, (ptr.as_ptr() as usize, layout));
            Some(MappedPtr(ptr))
        } else {
            None
        };
        Ok(RawAllocation { memory, offset: 0, size: requirements.size, mapped })
    }

    fn free_memory(&self, memory: MemoryHandle) {
        self.record("free_memory");
        if let Some((address, layout)) = self.host_memory.lock().unwrap().remove(&memory) {
            unsafe { alloc::dealloc(address as *mut u8, layout) };
        }
    }

    fn create_buffer(&self, info: &BufferCreateInfo) -> Result<BufferHandle> {
        let buffer = BufferHandle(self.handle());
        self.buffer_sizes.lock().unwrap().insert(buffer, info.size);
        self.record(format!("create_buffer({})", info.size));
        Ok(buffer)
    }

    fn buffer_memory_requirements(&self, buffer: BufferHandle) -> MemoryRequirements {
        let size = self.buffer_sizes.lock().unwrap().get(&buffer).copied().unwrap_or(0);
        MemoryRequirements { size, alignment: 16, memory_type_bits: 1, linear: true }
    }

    fn bind_buffer_memory(&self, _buffer: BufferHandle, _allocation: &RawAllocation) -> Result<()> {
        self.record("bind_buffer_memory");
        Ok(())
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        self.buffer_sizes.lock().unwrap().remove(&buffer);
        self.record("destroy_buffer");
    }

    fn create_image(&self, info: &ImageCreateInfo) -> Result<ImageHandle> {
        let image = ImageHandle(self.handle());
        let texels = info.extent.width as u64
            * info.extent.height as u64
            * info.extent.depth as u64
            * info.array_layers as u64;
        self.image_sizes.lock().unwrap().insert(image, texels * 4);
        self.record("create_image");
        Ok(image)
    }

    fn image_memory_requirements(&self, image: ImageHandle) -> MemoryRequirements {
        let size = self.image_sizes.lock().unwrap().get(&image).copied().unwrap_or(0);
        MemoryRequirements { size, alignment: 256, memory_type_bits: 1, linear: false }
    }

    fn bind_image_memory(&self, _image: ImageHandle, _allocation: &RawAllocation) -> Result<()> {
        self.record("bind_image_memory");
        Ok(())
    }

    fn destroy_image(&self, image: ImageHandle) {
        self.image_sizes.lock().unwrap().remove(&image);
        self.record("destroy_image");
    }

    fn create_image_view(&self, info: &ImageViewCreateInfo) -> Result<ImageViewHandle> {
        self.record(format!("create_image_view({:?})", info.view_type));
        Ok(ImageViewHandle(self.handle()))
    }

    fn destroy_image_view(&self, _view: ImageViewHandle) {
        self.record("destroy_image_view");
    }

    fn create_fence(&self, signaled: bool) -> Result<FenceHandle> {
        let fence = FenceHandle(self.handle());
        self.fences.lock().unwrap().insert(fence, signaled);
        self.record("create_fence");
        Ok(fence)
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        self.fences.lock().unwrap().remove(&fence);
        self.record("destroy_fence");
    }

    fn get_fence_status(&self, fence: FenceHandle) -> Result<bool> {
        self.fences
            .lock()
            .unwrap()
            .get(&fence)
            .copied()
            .ok_or_else(|| Error::AsyncFailure(format!("unknown fence {:?}", fence)))
    }

    fn wait_for_fence(&self, fence: FenceHandle, _timeout_ns: u64) -> Result<bool> {
        self.get_fence_status(fence)
    }

    fn reset_fence(&self, fence: FenceHandle) -> Result<()> {
        self.record("reset_fence");
        if let Some(state) = self.fences.lock().unwrap().get_mut(&fence) {
            *state = false;
        }
        Ok(())
    }

    fn create_semaphore(&self) -> Result<SemaphoreHandle> {
        self.record("create_semaphore");
        Ok(SemaphoreHandle(self.handle()))
    }

    fn destroy_semaphore(&self, _semaphore: SemaphoreHandle) {
        self.record("destroy_semaphore");
    }

    fn create_descriptor_pool(&self, info: &DescriptorPoolCreateInfo) -> Result<DescriptorPoolHandle> {
        self.record(format!("create_descriptor_pool({})", info.max_sets));
        Ok(DescriptorPoolHandle(self.handle()))
    }

    fn destroy_descriptor_pool(&self, _pool: DescriptorPoolHandle) {
        self.record("destroy_descriptor_pool");
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &BTreeMap<u32, DescriptorBinding>,
    ) -> Result<DescriptorSetLayoutHandle> {
        self.record(format!("create_descriptor_set_layout({})", bindings.len()));
        Ok(DescriptorSetLayoutHandle(self.handle()))
    }

    fn destroy_descriptor_set_layout(&self, _layout: DescriptorSetLayoutHandle) {
        self.record("destroy_descriptor_set_layout");
    }

    fn allocate_descriptor_set(
        &self,
        _pool: DescriptorPoolHandle,
        _layout: DescriptorSetLayoutHandle,
    ) -> Result<DescriptorSetHandle> {
        self.record("allocate_descriptor_set");
        Ok(DescriptorSetHandle(self.handle()))
    }

    fn free_descriptor_set(&self, _pool: DescriptorPoolHandle, _set: DescriptorSetHandle) {
        self.record("free_descriptor_set");
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        self.record(format!("update_descriptor_sets({})", writes.len()));
        self.descriptor_updates.lock().unwrap().push(writes.to_vec());
    }

    fn create_render_pass(&self, layout: &RenderPassLayout) -> Result<RenderPassHandle> {
        self.record("create_render_pass");
        self.render_passes.lock().unwrap().push(layout.clone());
        Ok(RenderPassHandle(self.handle()))
    }

    fn destroy_render_pass(&self, _render_pass: RenderPassHandle) {
        self.record("destroy_render_pass");
    }

    fn create_framebuffer(&self, info: &FramebufferCreateInfo) -> Result<FramebufferHandle> {
        self.record(format!("create_framebuffer({})", info.attachments.len()));
        Ok(FramebufferHandle(self.handle()))
    }

    fn destroy_framebuffer(&self, _framebuffer: FramebufferHandle) {
        self.record("destroy_framebuffer");
    }

    fn create_shader_module(&self, spirv: &[u32]) -> Result<ShaderModuleHandle> {
        if spirv.is_empty() {
            return Err(Error::CreationFailure("empty SPIR-V".to_string()));
        }
        self.record("create_shader_module");
        Ok(ShaderModuleHandle(self.handle()))
    }

    fn destroy_shader_module(&self, _module: ShaderModuleHandle) {
        self.record("destroy_shader_module");
    }

    fn create_pipeline_layout(&self, info: &PipelineLayoutCreateInfo) -> Result<PipelineLayoutHandle> {
        self.record(format!("create_pipeline_layout({})", info.set_layouts.len()));
        Ok(PipelineLayoutHandle(self.handle()))
    }

    fn destroy_pipeline_layout(&self, _layout: PipelineLayoutHandle) {
        self.record("destroy_pipeline_layout");
    }

    fn create_graphics_pipeline(&self, info: &GraphicsPipelineCreateInfo) -> Result<PipelineHandle> {
        self.record("create_graphics_pipeline");
        self.graphics_pipelines.lock().unwrap().push(info.clone());
        Ok(PipelineHandle(self.handle()))
    }

    fn create_compute_pipeline(&self, _info: &ComputePipelineCreateInfo) -> Result<PipelineHandle> {
        self.record("create_compute_pipeline");
        Ok(PipelineHandle(self.handle()))
    }

    fn destroy_pipeline(&self, _pipeline: PipelineHandle) {
        self.record("destroy_pipeline");
    }

    fn create_command_pool(&self, family_index: u32) -> Result<CommandPoolHandle> {
        self.record(format!("create_command_pool({})", family_index));
        Ok(CommandPoolHandle(self.handle()))
    }

    fn destroy_command_pool(&self, _pool: CommandPoolHandle) {
        self.record("destroy_command_pool");
    }

    fn allocate_command_buffer(
        &self,
        _pool: CommandPoolHandle,
        level: CommandBufferLevel,
    ) -> Result<CommandBufferHandle> {
        self.record(format!("allocate_command_buffer({:?})", level));
        Ok(CommandBufferHandle(self.handle()))
    }

    fn free_command_buffer(&self, _pool: CommandPoolHandle, _command_buffer: CommandBufferHandle) {
        self.record("free_command_buffer");
    }

    fn begin_command_buffer(&self, _command_buffer: CommandBufferHandle) -> Result<()> {
        self.record("begin_command_buffer");
        Ok(())
    }

    fn end_command_buffer(&self, _command_buffer: CommandBufferHandle) -> Result<()> {
        self.record("end_command_buffer");
        Ok(())
    }

    fn reset_command_buffer(&self, _command_buffer: CommandBufferHandle) -> Result<()> {
        self.record("reset_command_buffer");
        Ok(())
    }

    fn cmd_pipeline_barrier(
        &self,
        _command_buffer: CommandBufferHandle,
        src_stage: PipelineStageFlags,
        dst_stage: PipelineStageFlags,
        barriers: &[ImageBarrier],
    ) {
        self.record(format!("cmd_pipeline_barrier({})", barriers.len()));
        let mut recorded = self.barriers.lock().unwrap();
        for barrier in barriers {
            recorded.push((src_stage, dst_stage, *barrier));
        }
    }

    fn cmd_begin_render_pass(&self, _command_buffer: CommandBufferHandle, info: &RenderPassBeginInfo) {
        self.record(format!("cmd_begin_render_pass({})", info.clear_values.len()));
    }

    fn cmd_next_subpass(&self, _command_buffer: CommandBufferHandle) {
        self.record("cmd_next_subpass");
    }

    fn cmd_end_render_pass(&self, _command_buffer: CommandBufferHandle) {
        self.record("cmd_end_render_pass");
    }

    fn cmd_bind_pipeline(
        &self,
        _command_buffer: CommandBufferHandle,
        bind_point: PipelineBindPoint,
        _pipeline: PipelineHandle,
    ) {
        self.record(format!("cmd_bind_pipeline({:?})", bind_point));
    }

    fn cmd_bind_vertex_buffer(
        &self,
        _command_buffer: CommandBufferHandle,
        binding: u32,
        _buffer: BufferHandle,
        offset: u64,
    ) {
        self.record(format!("cmd_bind_vertex_buffer({}, {})", binding, offset));
    }

    fn cmd_bind_index_buffer(
        &self,
        _command_buffer: CommandBufferHandle,
        _buffer: BufferHandle,
        offset: u64,
        index_type: IndexType,
    ) {
        self.record(format!("cmd_bind_index_buffer({}, {:?})", offset, index_type));
    }

    fn cmd_bind_descriptor_set(
        &self,
        _command_buffer: CommandBufferHandle,
        _bind_point: PipelineBindPoint,
        _layout: PipelineLayoutHandle,
        set_index: u32,
        _set: DescriptorSetHandle,
    ) {
        self.record(format!("cmd_bind_descriptor_set({})", set_index));
    }

    fn cmd_push_constants(
        &self,
        _command_buffer: CommandBufferHandle,
        _layout: PipelineLayoutHandle,
        _stages: ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        self.record(format!("cmd_push_constants({}, {})", offset, data.len()));
    }

    fn cmd_set_viewport(&self, _command_buffer: CommandBufferHandle, _viewport: &Viewport) {
        self.record("cmd_set_viewport");
    }

    fn cmd_set_scissor(&self, _command_buffer: CommandBufferHandle, _scissor: &Rect2D) {
        self.record("cmd_set_scissor");
    }

    fn cmd_draw(
        &self,
        _command_buffer: CommandBufferHandle,
        vertex_count: u32,
        instance_count: u32,
        _first_vertex: u32,
        _first_instance: u32,
    ) {
        self.record(format!("cmd_draw({}, {})", vertex_count, instance_count));
    }

    fn cmd_draw_indexed(
        &self,
        _command_buffer: CommandBufferHandle,
        index_count: u32,
        instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.record(format!("cmd_draw_indexed({}, {})", index_count, instance_count));
    }

    fn cmd_dispatch(&self, _command_buffer: CommandBufferHandle, x: u32, y: u32, z: u32) {
        self.record(format!("cmd_dispatch({}, {}, {})", x, y, z));
    }

    fn cmd_copy_buffer(
        &self,
        _command_buffer: CommandBufferHandle,
        _src: BufferHandle,
        _dst: BufferHandle,
        regions: &[BufferCopy],
    ) {
        let size: u64 = regions.iter().map(|r| r.size).sum();
        self.record(format!("cmd_copy_buffer({})", size));
    }

    fn cmd_begin_label(&self, _command_buffer: CommandBufferHandle, name: &str, _color: [f32; 4]) {
        self.record(format!("cmd_begin_label({})", name));
    }

    fn cmd_end_label(&self, _command_buffer: CommandBufferHandle) {
        self.record("cmd_end_label");
    }

    fn queue_submit(&self, _queue: QueueHandle, submit: &SubmitInfo<'_>) -> Result<()> {
        let mut fail = self.fail_next_submit.lock().unwrap();
        if *fail {
            *fail = false;
            return Err(Error::AsyncFailure("queue submit failed: DEVICE_LOST".to_string()));
        }
        self.record(format!(
            "queue_submit(wait={}, signal={})",
            submit.wait_semaphores.len(),
            submit.signal_semaphores.len()
        ));
        Ok(())
    }

    fn queue_present(&self, _queue: QueueHandle, present: &PresentInfo<'_>) -> Result<bool> {
        self.record(format!("queue_present({})", present.image_index));
        Ok(false)
    }
}

// ============================================================================
// Test helpers
// ============================================================================

/// Device over a fresh mock driver
pub fn mock_device() -> (Device, Arc<MockDriver>) {
    mock_device_with_config(DeviceConfig::default())
}

pub fn mock_device_with_config(config: DeviceConfig) -> (Device, Arc<MockDriver>) {
    let driver = Arc::new(MockDriver::new());
    let device = Device::new(driver.clone(), config).unwrap();
    (device, driver)
}

/// Shader module over a one-word SPIR-V stub
pub fn mock_shader(device: &Device, name: &str, stage: ShaderStageFlags, reflection: ShaderReflection) -> Arc<ShaderModule> {
    ShaderModule::new(device.context(), name, stage, &[0x0723_0203], "main", reflection).unwrap()
}
