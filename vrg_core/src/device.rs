//! Device context, queue families and command buffer pooling
//!
//! Every recording thread gets its own command pool per queue family, so
//! threads never contend on a native pool. Submitted buffers go back to the
//! list of the thread that allocated them and are recycled once their fence
//! has signaled and nothing outside the pool still references them.

use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use rustc_hash::FxHashMap;

use crate::command_buffer::{CommandBuffer, CommandPool};
use crate::driver::{
    DescriptorPoolCreateInfo, DescriptorPoolHandle, Driver, PresentInfo, QueueFamilyProperties, QueueHandle,
    SemaphoreHandle, SwapchainHandle,
};
use crate::error::{Error, Result};
use crate::memory::MemoryArena;
use crate::resource::DeviceResource;
use crate::sync::Semaphore;
use crate::types::{CommandBufferLevel, DescriptorKind, DescriptorType, QueueFlags};
use crate::{vrg_bail, vrg_debug, vrg_error, vrg_info, vrg_trace};

/// Device-wide tunables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Capacity of the shared descriptor pool, in sets
    pub max_sets: u32,
    /// Capacity of the shared descriptor pool, per descriptor type
    pub max_descriptors_per_type: u32,
    /// Forward resource names and command labels to the driver
    pub debug_labels: bool,
    /// Timeout used by [`Fence::wait_default`](crate::sync::Fence::wait_default)
    pub default_fence_timeout_ns: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            max_sets: 8192,
            max_descriptors_per_type: 1024,
            debug_labels: true,
            default_fence_timeout_ns: u64::MAX,
        }
    }
}

// ===== CONTEXT =====

/// State shared by every resource of a device
///
/// Resources keep the context alive through their [`ResourceBase`], so the
/// driver outlives every native handle created through it.
///
/// [`ResourceBase`]: crate::resource::ResourceBase
pub struct DeviceContext {
    driver: Arc<dyn Driver>,
    memory: MemoryArena,
    descriptor_pool: DescriptorPoolHandle,
    config: DeviceConfig,
}

impl DeviceContext {
    fn new(driver: Arc<dyn Driver>, config: DeviceConfig) -> Result<DeviceContext> {
        let pool_sizes = DescriptorType::ALL
            .iter()
            .filter(|ty| !matches!(ty.kind(), DescriptorKind::TexelBuffer | DescriptorKind::InlineUniform))
            .map(|ty| (*ty, config.max_descriptors_per_type))
            .collect();
        let descriptor_pool = driver.create_descriptor_pool(&DescriptorPoolCreateInfo {
            max_sets: config.max_sets,
            pool_sizes,
        })?;
        Ok(DeviceContext { memory: MemoryArena::new(driver.clone()), driver, descriptor_pool, config })
    }

    pub fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    pub fn memory(&self) -> &MemoryArena {
        &self.memory
    }

    /// Pool every [`DescriptorSet`](crate::descriptor_set::DescriptorSet) allocates from
    pub fn descriptor_pool(&self) -> DescriptorPoolHandle {
        self.descriptor_pool
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        self.driver.destroy_descriptor_pool(self.descriptor_pool);
    }
}

// ===== QUEUE FAMILIES =====

/// Command pool of one recording thread and the buffers it issued
struct ThreadPool {
    pool: Arc<CommandPool>,
    buffers: Vec<Arc<CommandBuffer>>,
}

/// One queue family with its first queue and per-thread pools
pub struct QueueFamily {
    properties: QueueFamilyProperties,
    queue: QueueHandle,
    pools: Mutex<FxHashMap<ThreadId, ThreadPool>>,
}

impl QueueFamily {
    pub fn properties(&self) -> &QueueFamilyProperties {
        &self.properties
    }

    pub fn queue(&self) -> QueueHandle {
        self.queue
    }

    fn pools(&self) -> MutexGuard<'_, FxHashMap<ThreadId, ThreadPool>> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Buffers issued by every thread and not yet recycled
    pub fn pending_buffers(&self) -> usize {
        self.pools().values().map(|slot| slot.buffers.len()).sum()
    }
}

// ===== DEVICE =====

/// Entry point: owns the context and hands out command buffers
pub struct Device {
    context: Arc<DeviceContext>,
    families: Vec<QueueFamily>,
}

impl Device {
    /// Wrap an initialized driver
    ///
    /// # Errors
    ///
    /// `CreationFailure` when the driver reports no queue family, or when the
    /// shared descriptor pool cannot be created.
    pub fn new(driver: Arc<dyn Driver>, config: DeviceConfig) -> Result<Device> {
        let properties = driver.queue_families();
        if properties.is_empty() {
            vrg_error!("vrg::device", "Driver exposes no queue family");
            return Err(Error::CreationFailure("no queue family".to_string()));
        }

        let families = properties
            .into_iter()
            .map(|properties| QueueFamily {
                queue: driver.get_queue(properties.index, 0),
                properties,
                pools: Mutex::new(FxHashMap::default()),
            })
            .collect::<Vec<_>>();

        let context = Arc::new(DeviceContext::new(driver, config)?);
        vrg_info!("vrg::device", "Device ready with {} queue families", families.len());
        Ok(Device { context, families })
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.context
    }

    pub fn memory(&self) -> &MemoryArena {
        self.context.memory()
    }

    pub fn config(&self) -> &DeviceConfig {
        self.context.config()
    }

    pub fn queue_families(&self) -> &[QueueFamily] {
        &self.families
    }

    fn family(&self, flags: QueueFlags) -> Result<&QueueFamily> {
        match self.families.iter().find(|family| family.properties.flags.contains(flags)) {
            Some(family) => Ok(family),
            None => vrg_bail!("vrg::device", "No queue family supports {:?}", flags),
        }
    }

    /// Command buffer in the `Recording` state for the calling thread
    ///
    /// Picks the first queue family whose capabilities contain `flags`. For
    /// primary buffers the calling thread's list is pruned first: completed
    /// buffers that nobody else references are dropped, except the first one
    /// which is reset under `name` and returned.
    pub fn get_command_buffer(
        &self,
        name: &str,
        flags: QueueFlags,
        level: CommandBufferLevel,
    ) -> Result<CommandBuffer> {
        let family = self.family(flags)?;
        let family_index = family.properties.index;
        let thread = thread::current().id();

        let mut pools = family.pools();
        let slot = match pools.entry(thread) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let pool = CommandPool::new(
                    &self.context,
                    &format!("pool{}_{:?}", family_index, thread),
                    family_index,
                )?;
                entry.insert(ThreadPool { pool, buffers: Vec::new() })
            }
        };

        if level == CommandBufferLevel::Primary {
            let mut recycled = None;
            let mut index = 0;
            while index < slot.buffers.len() {
                let eligible = slot.buffers[index].check_done()? && Arc::strong_count(&slot.buffers[index]) == 1;
                if !eligible {
                    index += 1;
                    continue;
                }
                let buffer = slot.buffers.remove(index);
                if recycled.is_some() {
                    vrg_trace!("vrg::device", "Pruned command buffer '{}'", buffer.name());
                    continue;
                }
                match Arc::try_unwrap(buffer) {
                    Ok(buffer) => recycled = Some(buffer),
                    Err(shared) => {
                        slot.buffers.insert(index, shared);
                        index += 1;
                    }
                }
            }

            if let Some(mut buffer) = recycled {
                buffer.reset(name)?;
                return Ok(buffer);
            }
        }

        let pool = slot.pool.clone();
        drop(pools);
        CommandBuffer::new(&self.context, name, pool, family.queue, level, thread)
    }

    /// Submit `cmd` and hand it to the pool of the thread that allocated it
    ///
    /// The returned reference shares ownership with the pool; keeping it
    /// around delays recycling.
    pub fn execute(&self, mut cmd: CommandBuffer) -> Result<Arc<CommandBuffer>> {
        if cmd.level() != CommandBufferLevel::Primary {
            vrg_bail!("vrg::device", "Secondary command buffer '{}' cannot be executed", cmd.name());
        }
        cmd.submit()?;

        let Some(family) = self.families.iter().find(|family| family.properties.index == cmd.family_index()) else {
            vrg_bail!("vrg::device", "Command buffer '{}' belongs to an unknown queue family", cmd.name());
        };

        let cmd = Arc::new(cmd);
        let mut pools = family.pools();
        match pools.get_mut(&cmd.thread()) {
            Some(slot) => slot.buffers.push(cmd.clone()),
            None => vrg_bail!("vrg::device", "Command buffer '{}' outlived its thread pool", cmd.name()),
        }
        vrg_debug!("vrg::device", "Executed '{}' on family {}", cmd.name(), family.properties.index);
        Ok(cmd)
    }

    /// Wait for the device to go idle and release everything completed work held
    ///
    /// Completed buffers move to `Done` and drop their held resources. Their
    /// fences stay signaled, so `completion_fence().wait()` on a returned
    /// buffer still succeeds; a fence is reset when its buffer is recycled by
    /// [`Device::get_command_buffer`].
    pub fn flush(&self) -> Result<()> {
        self.context.driver().device_wait_idle()?;
        let mut completed = 0;
        for family in &self.families {
            for slot in family.pools().values() {
                for buffer in &slot.buffers {
                    if buffer.check_done()? {
                        completed += 1;
                    }
                }
            }
        }
        vrg_debug!("vrg::device", "Flushed device, {} command buffers completed", completed);
        Ok(())
    }

    /// Present a swapchain image on the first queue matching `flags`
    ///
    /// Returns `true` when the swapchain is suboptimal.
    pub fn present(
        &self,
        flags: QueueFlags,
        swapchain: SwapchainHandle,
        image_index: u32,
        wait_semaphores: &[Arc<Semaphore>],
    ) -> Result<bool> {
        let family = self.family(flags)?;
        let wait: Vec<SemaphoreHandle> = wait_semaphores.iter().map(|s| s.handle()).collect();
        self.context.driver().queue_present(
            family.queue,
            &PresentInfo { swapchain, image_index, wait_semaphores: &wait },
        )
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            vrg_error!("vrg::device", "Flush on device drop failed: {}", e);
        }
        for family in &self.families {
            family.pools().clear();
        }
    }
}

#[cfg(test)]
#[path = "device_tests.rs"]
mod tests;
