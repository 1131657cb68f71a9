//! Command buffer recording and completion tracking
//!
//! # Lifecycle
//!
//! ```text
//! Recording --Device::execute--> InFlight --fence polled--> Done --reset--> Recording
//! ```
//!
//! A command buffer is owned by its recorder while `Recording`; every
//! recording method takes `&mut self`. [`Device::execute`] consumes it and
//! hands back an `Arc` shared with the device pool. From then on only the
//! completion state is touched, through an internal lock, until the pool
//! observes the fence and recycles the buffer.
//!
//! Every resource a command refers to is held by the buffer until the GPU is
//! known to be done with it.
//!
//! [`Device::execute`]: crate::device::Device::execute

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::ThreadId;

use bytemuck::Pod;
use glam::Vec4;
use rustc_hash::FxHashMap;

use crate::buffer::{Buffer, BufferDesc, BufferView, StrideView};
use crate::descriptor_set::DescriptorSet;
use crate::device::DeviceContext;
use crate::driver::{
    BufferCopy, CommandBufferHandle, CommandPoolHandle, ImageBarrier, NamedObject, QueueHandle,
    RenderPassBeginInfo, SemaphoreHandle, SubmitInfo,
};
use crate::error::Result;
use crate::framebuffer::Framebuffer;
use crate::pipeline::Pipeline;
use crate::render_pass::RenderPass;
use crate::resource::{DeviceResource, ResourceBase};
use crate::sync::{Fence, Semaphore};
use crate::texture::{Texture, TrackedState};
use crate::types::*;
use crate::{vrg_bail, vrg_debug, vrg_err, vrg_error, vrg_trace, vrg_warn};

/// Position of a command buffer in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CommandBufferState {
    #[default]
    Recording,
    InFlight,
    Done,
}

// ===== COMMAND POOL =====

/// Native command pool of one (queue family, thread) pair
pub struct CommandPool {
    base: ResourceBase,
    handle: CommandPoolHandle,
    family_index: u32,
}

impl CommandPool {
    pub(crate) fn new(context: &Arc<DeviceContext>, name: &str, family_index: u32) -> Result<Arc<CommandPool>> {
        let handle = context.driver().create_command_pool(family_index)?;
        vrg_trace!("vrg::command_buffer", "Created command pool '{}' for family {}", name, family_index);
        Ok(Arc::new(CommandPool { base: ResourceBase::new(context.clone(), name), handle, family_index }))
    }

    pub fn handle(&self) -> CommandPoolHandle {
        self.handle
    }

    pub fn family_index(&self) -> u32 {
        self.family_index
    }
}

impl DeviceResource for CommandPool {
    fn base(&self) -> &ResourceBase {
        &self.base
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        self.base.driver().destroy_command_pool(self.handle);
    }
}

// ===== STATE =====

/// Everything released when the buffer completes or is cleared
#[derive(Default)]
struct State {
    status: CommandBufferState,
    held: FxHashMap<usize, Arc<dyn DeviceResource>>,
    wait_semaphores: Vec<(Arc<Semaphore>, PipelineStageFlags)>,
    signal_semaphores: Vec<Arc<Semaphore>>,
    render_pass: Option<Arc<RenderPass>>,
    framebuffer: Option<Arc<Framebuffer>>,
    subpass: u32,
    pipeline: Option<Arc<Pipeline>>,
    vertex_buffers: FxHashMap<u32, StrideView>,
    index_buffer: Option<StrideView>,
    descriptor_sets: Vec<Option<Arc<DescriptorSet>>>,
}

impl State {
    fn hold(&mut self, resource: Arc<dyn DeviceResource>) {
        let key = Arc::as_ptr(&resource) as *const () as usize;
        self.held.entry(key).or_insert(resource);
    }

    fn clear(&mut self) {
        self.held.clear();
        self.wait_semaphores.clear();
        self.signal_semaphores.clear();
        self.render_pass = None;
        self.framebuffer = None;
        self.subpass = 0;
        self.pipeline = None;
        self.vertex_buffers.clear();
        self.index_buffer = None;
        self.descriptor_sets.clear();
    }
}

// ===== COMMAND BUFFER =====

/// Recorded GPU work for one queue submission
pub struct CommandBuffer {
    base: ResourceBase,
    handle: CommandBufferHandle,
    level: CommandBufferLevel,
    pool: Arc<CommandPool>,
    queue: QueueHandle,
    thread: ThreadId,
    fence: Fence,
    state: Mutex<State>,
}

/// Borrow the state for recording, failing unless the buffer is `Recording`
fn recording<'a>(state: &'a mut Mutex<State>, base: &ResourceBase) -> Result<&'a mut State> {
    let state = state.get_mut().unwrap_or_else(PoisonError::into_inner);
    if state.status != CommandBufferState::Recording {
        vrg_bail!(
            "vrg::command_buffer",
            "Command buffer '{}' is {:?}, not recording",
            base.name(),
            state.status
        );
    }
    Ok(state)
}

fn bound_pipeline<'a>(state: &'a State, base: &ResourceBase, action: &str) -> Result<&'a Arc<Pipeline>> {
    state.pipeline.as_ref().ok_or_else(|| {
        vrg_err!("vrg::command_buffer", "Command buffer '{}': cannot {} without a bound pipeline", base.name(), action)
    })
}

impl CommandBuffer {
    /// Allocate from `pool` and open the recording scope
    pub(crate) fn new(
        context: &Arc<DeviceContext>,
        name: &str,
        pool: Arc<CommandPool>,
        queue: QueueHandle,
        level: CommandBufferLevel,
        thread: ThreadId,
    ) -> Result<CommandBuffer> {
        let driver = context.driver();
        let handle = driver.allocate_command_buffer(pool.handle(), level)?;
        let fence = match Fence::new(context, &format!("{}_fence", name), false) {
            Ok(fence) => fence,
            Err(e) => {
                driver.free_command_buffer(pool.handle(), handle);
                return Err(e);
            }
        };
        if let Err(e) = driver.begin_command_buffer(handle) {
            driver.free_command_buffer(pool.handle(), handle);
            return Err(e);
        }

        let base = ResourceBase::new(context.clone(), name);
        base.label(NamedObject::CommandBuffer(handle));
        vrg_trace!("vrg::command_buffer", "Allocated {:?} command buffer '{}'", level, name);

        Ok(CommandBuffer {
            base,
            handle,
            level,
            pool,
            queue,
            thread,
            fence,
            state: Mutex::new(State::default()),
        })
    }

    pub fn handle(&self) -> CommandBufferHandle {
        self.handle
    }

    pub fn level(&self) -> CommandBufferLevel {
        self.level
    }

    pub fn family_index(&self) -> u32 {
        self.pool.family_index()
    }

    pub fn queue(&self) -> QueueHandle {
        self.queue
    }

    /// Thread whose pool allocated this buffer
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub fn completion_fence(&self) -> &Fence {
        &self.fence
    }

    pub fn state(&self) -> CommandBufferState {
        self.lock().status
    }

    pub fn held_resource_count(&self) -> usize {
        self.lock().held.len()
    }

    pub fn current_render_pass(&self) -> Option<Arc<RenderPass>> {
        self.lock().render_pass.clone()
    }

    pub fn current_framebuffer(&self) -> Option<Arc<Framebuffer>> {
        self.lock().framebuffer.clone()
    }

    pub fn current_subpass(&self) -> u32 {
        self.lock().subpass
    }

    pub fn bound_pipeline(&self) -> Option<Arc<Pipeline>> {
        self.lock().pipeline.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ===== LIFECYCLE =====

    /// Keep `resource` alive until this buffer completes or is cleared
    pub fn hold_resource<R: DeviceResource>(&mut self, resource: &Arc<R>) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        state.hold(resource.clone());
    }

    /// Drop held resources, semaphores and every binding cache
    pub fn clear(&mut self) {
        self.state.get_mut().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Poll the completion fence; releases everything held once it signals
    ///
    /// Returns `true` when the buffer is `Done`.
    pub fn check_done(&self) -> Result<bool> {
        let mut state = self.lock();
        if state.status == CommandBufferState::InFlight && self.fence.status()? {
            state.status = CommandBufferState::Done;
            state.clear();
            vrg_trace!("vrg::command_buffer", "Command buffer '{}' completed", self.name());
        }
        Ok(state.status == CommandBufferState::Done)
    }

    /// Reopen a `Done` (or never submitted) buffer for recording under a new name
    ///
    /// # Errors
    ///
    /// `InvalidUsage` while the buffer is in flight.
    pub fn reset(&mut self, name: &str) -> Result<()> {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.status == CommandBufferState::InFlight {
            vrg_bail!("vrg::command_buffer", "Cannot reset command buffer '{}' while in flight", self.base.name());
        }
        state.clear();

        let driver = self.base.driver();
        driver.reset_command_buffer(self.handle)?;
        self.fence.reset()?;
        driver.begin_command_buffer(self.handle)?;
        state.status = CommandBufferState::Recording;

        self.base.set_name(name);
        self.base.label(NamedObject::CommandBuffer(self.handle));
        self.fence.rename(&format!("{}_fence", name));
        vrg_debug!("vrg::command_buffer", "Recycled command buffer as '{}'", name);
        Ok(())
    }

    /// End recording and submit to the buffer's queue, signaling its fence
    pub(crate) fn submit(&mut self) -> Result<()> {
        let state = recording(&mut self.state, &self.base)?;
        if let Some(render_pass) = &state.render_pass {
            vrg_bail!(
                "vrg::command_buffer",
                "Command buffer '{}' submitted inside render pass '{}'",
                self.base.name(),
                render_pass.name()
            );
        }
        if self.level != CommandBufferLevel::Primary {
            vrg_bail!("vrg::command_buffer", "Secondary command buffer '{}' cannot be submitted", self.base.name());
        }

        let wait: Vec<(SemaphoreHandle, PipelineStageFlags)> =
            state.wait_semaphores.iter().map(|(semaphore, stage)| (semaphore.handle(), *stage)).collect();
        let signal: Vec<SemaphoreHandle> = state.signal_semaphores.iter().map(|s| s.handle()).collect();

        let driver = self.base.driver();
        driver.end_command_buffer(self.handle)?;
        if let Err(e) = driver.queue_submit(
            self.queue,
            &SubmitInfo {
                command_buffer: self.handle,
                wait_semaphores: &wait,
                signal_semaphores: &signal,
                fence: self.fence.handle(),
            },
        ) {
            vrg_error!("vrg::command_buffer", "Submission of '{}' failed: {}", self.base.name(), e);
            return Err(e);
        }
        state.status = CommandBufferState::InFlight;
        vrg_debug!(
            "vrg::command_buffer",
            "Submitted '{}' (wait {}, signal {}, {} held)",
            self.base.name(),
            wait.len(),
            signal.len(),
            state.held.len()
        );
        Ok(())
    }

    // ===== SYNCHRONIZATION =====

    /// Make the submission wait for `semaphore` at `stage`
    pub fn wait_on(&mut self, semaphore: &Arc<Semaphore>, stage: PipelineStageFlags) -> Result<()> {
        let state = recording(&mut self.state, &self.base)?;
        state.wait_semaphores.push((semaphore.clone(), stage));
        Ok(())
    }

    /// Signal `semaphore` when the submission completes
    pub fn signal_on_complete(&mut self, semaphore: &Arc<Semaphore>) -> Result<()> {
        let state = recording(&mut self.state, &self.base)?;
        state.signal_semaphores.push(semaphore.clone());
        Ok(())
    }

    /// Record one image barrier and hold the texture
    pub(crate) fn record_image_barrier(
        &mut self,
        texture: Arc<Texture>,
        src_stage: PipelineStageFlags,
        dst_stage: PipelineStageFlags,
        barrier: ImageBarrier,
    ) -> Result<()> {
        let state = recording(&mut self.state, &self.base)?;
        self.base.driver().cmd_pipeline_barrier(self.handle, src_stage, dst_stage, &[barrier]);
        state.hold(texture);
        Ok(())
    }

    // ===== RENDER PASSES =====

    /// Transition every attachment to its initial layout and begin the pass
    ///
    /// `render_area` defaults to the whole framebuffer.
    pub fn begin_render_pass(
        &mut self,
        render_pass: &Arc<RenderPass>,
        framebuffer: &Arc<Framebuffer>,
        clear_values: &[ClearValue],
        render_area: Option<Rect2D>,
    ) -> Result<()> {
        {
            let state = recording(&mut self.state, &self.base)?;
            if let Some(active) = &state.render_pass {
                vrg_bail!(
                    "vrg::command_buffer",
                    "Render pass '{}' begun inside active pass '{}'",
                    render_pass.name(),
                    active.name()
                );
            }
        }
        if !Arc::ptr_eq(framebuffer.render_pass(), render_pass) {
            vrg_bail!(
                "vrg::command_buffer",
                "Framebuffer '{}' was not created for render pass '{}'",
                framebuffer.name(),
                render_pass.name()
            );
        }

        for ((_, description), view) in render_pass.attachment_descriptions().iter().zip(framebuffer.attachments()) {
            view.texture().transition_barrier(self, description.initial_layout)?;
        }

        let area = render_area.unwrap_or(Rect2D { offset: Offset2D::default(), extent: framebuffer.extent() });
        self.base.driver().cmd_begin_render_pass(
            self.handle,
            &RenderPassBeginInfo {
                render_pass: render_pass.handle(),
                framebuffer: framebuffer.handle(),
                render_area: area,
                clear_values: clear_values.to_vec(),
            },
        );

        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        state.render_pass = Some(render_pass.clone());
        state.framebuffer = Some(framebuffer.clone());
        state.subpass = 0;
        state.hold(render_pass.clone());
        state.hold(framebuffer.clone());
        Ok(())
    }

    pub fn next_subpass(&mut self) -> Result<()> {
        let state = recording(&mut self.state, &self.base)?;
        let Some(render_pass) = &state.render_pass else {
            vrg_bail!("vrg::command_buffer", "'{}': next_subpass outside of a render pass", self.base.name());
        };
        if state.subpass as usize + 1 >= render_pass.subpass_count() {
            vrg_bail!(
                "vrg::command_buffer",
                "'{}': render pass '{}' has no subpass after {}",
                self.base.name(),
                render_pass.name(),
                state.subpass
            );
        }
        self.base.driver().cmd_next_subpass(self.handle);
        state.subpass += 1;
        Ok(())
    }

    /// End the pass; attachments take their final layout without a barrier
    pub fn end_render_pass(&mut self) -> Result<()> {
        let state = recording(&mut self.state, &self.base)?;
        let (Some(render_pass), Some(framebuffer)) = (state.render_pass.take(), state.framebuffer.take()) else {
            vrg_bail!("vrg::command_buffer", "'{}': end_render_pass without an active pass", self.base.name());
        };
        self.base.driver().cmd_end_render_pass(self.handle);

        for ((_, description), view) in render_pass.attachment_descriptions().iter().zip(framebuffer.attachments()) {
            view.texture().set_tracked_state(TrackedState::for_layout(description.final_layout));
        }
        state.subpass = 0;
        Ok(())
    }

    // ===== BINDING =====

    /// Bind a pipeline; rebinding the bound pipeline records nothing
    ///
    /// A new pipeline invalidates the cached descriptor set, vertex and
    /// index buffer bindings.
    pub fn bind_pipeline(&mut self, pipeline: &Arc<Pipeline>) -> Result<()> {
        let state = recording(&mut self.state, &self.base)?;
        if state.pipeline.as_ref().is_some_and(|bound| Arc::ptr_eq(bound, pipeline)) {
            return Ok(());
        }
        self.base.driver().cmd_bind_pipeline(self.handle, pipeline.bind_point(), pipeline.handle());
        state.pipeline = Some(pipeline.clone());
        state.descriptor_sets.clear();
        state.vertex_buffers.clear();
        state.index_buffer = None;
        state.hold(pipeline.clone());
        Ok(())
    }

    pub fn bind_vertex_buffer(&mut self, binding: u32, view: &StrideView) -> Result<()> {
        let state = recording(&mut self.state, &self.base)?;
        if state.vertex_buffers.get(&binding) == Some(view) {
            return Ok(());
        }
        self.base.driver().cmd_bind_vertex_buffer(self.handle, binding, view.buffer().handle(), view.offset());
        state.hold(view.buffer().clone());
        state.vertex_buffers.insert(binding, view.clone());
        Ok(())
    }

    /// Bind an index buffer; the index type follows the view's stride
    pub fn bind_index_buffer(&mut self, view: &StrideView) -> Result<()> {
        let state = recording(&mut self.state, &self.base)?;
        if state.index_buffer.as_ref() == Some(view) {
            return Ok(());
        }
        let Some(index_type) = IndexType::from_stride(view.stride()) else {
            vrg_bail!("vrg::command_buffer", "No index type has a stride of {} bytes", view.stride());
        };
        self.base.driver().cmd_bind_index_buffer(self.handle, view.buffer().handle(), view.offset(), index_type);
        state.hold(view.buffer().clone());
        state.index_buffer = Some(view.clone());
        Ok(())
    }

    /// Flush the set's pending writes and bind it at `index`
    ///
    /// The set and every buffer or texture it references at this point are
    /// held until completion.
    ///
    /// # Errors
    ///
    /// `InvalidUsage` when no pipeline is bound.
    pub fn bind_descriptor_set(&mut self, index: u32, set: &Arc<DescriptorSet>) -> Result<()> {
        let state = recording(&mut self.state, &self.base)?;
        let pipeline = bound_pipeline(state, &self.base, "bind a descriptor set")?.clone();

        set.flush_writes()?;
        state.hold(set.clone());
        for resource in set.referenced_resources() {
            state.hold(resource);
        }

        let slot = index as usize;
        if slot >= state.descriptor_sets.len() {
            state.descriptor_sets.resize(slot + 1, None);
        }
        state.descriptor_sets[slot] = Some(set.clone());

        self.base.driver().cmd_bind_descriptor_set(
            self.handle,
            pipeline.bind_point(),
            pipeline.layout().handle(),
            index,
            set.handle(),
        );
        Ok(())
    }

    /// Raw push constant update against the bound pipeline's layout
    pub fn push_constants(&mut self, stages: ShaderStageFlags, offset: u32, data: &[u8]) -> Result<()> {
        let state = recording(&mut self.state, &self.base)?;
        let pipeline = bound_pipeline(state, &self.base, "push constants")?;
        self.base.driver().cmd_push_constants(self.handle, pipeline.layout().handle(), stages, offset, data);
        Ok(())
    }

    /// Update the push constant block `name` declared by the bound pipeline
    pub fn push_constant<T: Pod>(&mut self, name: &str, value: &T) -> Result<()> {
        let range = {
            let state = recording(&mut self.state, &self.base)?;
            *bound_pipeline(state, &self.base, "push constants")?.push_constant(name)?
        };
        let data = bytemuck::bytes_of(value);
        if data.len() as u32 > range.size {
            vrg_bail!(
                "vrg::command_buffer",
                "Push constant '{}' is {} bytes, got {}",
                name,
                range.size,
                data.len()
            );
        }
        self.push_constants(range.stages, range.offset, data)
    }

    pub fn set_viewport(&mut self, viewport: &Viewport) -> Result<()> {
        recording(&mut self.state, &self.base)?;
        self.base.driver().cmd_set_viewport(self.handle, viewport);
        Ok(())
    }

    pub fn set_scissor(&mut self, scissor: &Rect2D) -> Result<()> {
        recording(&mut self.state, &self.base)?;
        self.base.driver().cmd_set_scissor(self.handle, scissor);
        Ok(())
    }

    // ===== DRAW / DISPATCH =====

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) -> Result<()> {
        let state = recording(&mut self.state, &self.base)?;
        bound_pipeline(state, &self.base, "draw")?;
        self.base.driver().cmd_draw(self.handle, vertex_count, instance_count, first_vertex, first_instance);
        Ok(())
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<()> {
        let state = recording(&mut self.state, &self.base)?;
        bound_pipeline(state, &self.base, "draw")?;
        if state.index_buffer.is_none() {
            vrg_bail!("vrg::command_buffer", "'{}': indexed draw without an index buffer", self.base.name());
        }
        self.base.driver().cmd_draw_indexed(
            self.handle,
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        );
        Ok(())
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        let state = recording(&mut self.state, &self.base)?;
        let pipeline = bound_pipeline(state, &self.base, "dispatch")?;
        if pipeline.bind_point() != PipelineBindPoint::Compute {
            vrg_bail!("vrg::command_buffer", "Pipeline '{}' is not a compute pipeline", pipeline.name());
        }
        self.base.driver().cmd_dispatch(self.handle, x, y, z);
        Ok(())
    }

    // ===== TRANSFER =====

    /// Copy between two views of equal byte size
    pub fn copy_buffer<T, S>(&mut self, src: &BufferView<T>, dst: &BufferView<S>) -> Result<()> {
        let state = recording(&mut self.state, &self.base)?;
        if src.size_bytes() != dst.size_bytes() {
            vrg_bail!(
                "vrg::command_buffer",
                "Copy size mismatch: {} bytes from '{}' into {} bytes of '{}'",
                src.size_bytes(),
                src.buffer().name(),
                dst.size_bytes(),
                dst.buffer().name()
            );
        }
        if src.size_bytes() == 0 {
            vrg_bail!("vrg::command_buffer", "Empty copy from '{}'", src.buffer().name());
        }
        self.base.driver().cmd_copy_buffer(
            self.handle,
            src.buffer().handle(),
            dst.buffer().handle(),
            &[BufferCopy { src_offset: src.offset(), dst_offset: dst.offset(), size: src.size_bytes() }],
        );
        state.hold(src.buffer().clone());
        state.hold(dst.buffer().clone());
        Ok(())
    }

    /// Copy into a freshly created buffer with `usage | TRANSFER_DST`
    pub fn copy_to_new_buffer<T>(
        &mut self,
        src: &BufferView<T>,
        usage: BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<BufferView<T>> {
        recording(&mut self.state, &self.base)?;
        let dst = Buffer::new(
            self.base.context(),
            src.buffer().name(),
            &BufferDesc {
                size: src.size_bytes(),
                usage: usage | BufferUsageFlags::TRANSFER_DST,
                location,
                ..Default::default()
            },
        )?;
        let dst = BufferView::new(dst, 0, src.len())?;
        self.copy_buffer(src, &dst)?;
        Ok(dst)
    }

    // ===== DEBUG LABELS =====

    pub fn begin_label(&mut self, name: &str, color: Vec4) -> Result<()> {
        recording(&mut self.state, &self.base)?;
        if self.base.context().config().debug_labels {
            self.base.driver().cmd_begin_label(self.handle, name, color.to_array());
        }
        Ok(())
    }

    pub fn end_label(&mut self) -> Result<()> {
        recording(&mut self.state, &self.base)?;
        if self.base.context().config().debug_labels {
            self.base.driver().cmd_end_label(self.handle);
        }
        Ok(())
    }
}

impl DeviceResource for CommandBuffer {
    fn base(&self) -> &ResourceBase {
        &self.base
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.status == CommandBufferState::InFlight {
            vrg_warn!("vrg::command_buffer", "Destroying command buffer '{}' while in flight", self.base.name());
        }
        state.clear();
        self.base.driver().free_command_buffer(self.pool.handle(), self.handle);
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("name", &self.name())
            .field("level", &self.level)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
#[path = "command_buffer_tests.rs"]
mod tests;
