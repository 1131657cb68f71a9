/// VulkanDriver - Vulkan implementation of the vrg Driver trait
///
/// Owns the instance, the logical device and the gpu-allocator heap. Every
/// queue of every family is created so the core can pick families by flags.
/// Presentation goes through a swapchain created by the windowing layer.

use ash::vk;
use ash::vk::Handle;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::AllocationError;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use vrg_core::descriptor_set::DescriptorBinding;
use vrg_core::driver::*;
use vrg_core::error::{Error, Result};
use vrg_core::pipeline::GraphicsPipelineCreateInfo;
use vrg_core::render_pass::{AttachmentReference, RenderPassLayout};
use vrg_core::types::*;
use vrg_core::{vrg_debug, vrg_error, vrg_info, vrg_warn};

use crate::vulkan_convert::*;

const SOURCE: &str = "vrg::vulkan";

/// Instance and device options
#[derive(Debug, Clone)]
pub struct VulkanDriverConfig {
    pub application_name: String,
    /// Load VK_LAYER_KHRONOS_validation (requires the `vulkan-validation` feature)
    pub enable_validation: bool,
    /// Enable VK_KHR_swapchain on the device so `queue_present` works
    pub enable_swapchain: bool,
    /// Extra instance extensions, e.g. the surface extensions of a window system
    pub instance_extensions: Vec<&'static CStr>,
}

impl Default for VulkanDriverConfig {
    fn default() -> Self {
        Self {
            application_name: "vrg".to_string(),
            enable_validation: cfg!(feature = "vulkan-validation"),
            enable_swapchain: false,
            instance_extensions: Vec::new(),
        }
    }
}

fn creation_failure(what: &str, e: impl std::fmt::Debug) -> Error {
    vrg_error!(SOURCE, "Failed to {}: {:?}", what, e);
    Error::CreationFailure(format!("Failed to {}: {:?}", what, e))
}

fn async_failure(what: &str, e: impl std::fmt::Debug) -> Error {
    vrg_error!(SOURCE, "Failed to {}: {:?}", what, e);
    Error::AsyncFailure(format!("Failed to {}: {:?}", what, e))
}

fn vk_result_to_error(what: &str, e: vk::Result) -> Error {
    match e {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            vrg_error!(SOURCE, "Out of memory while trying to {}", what);
            Error::OutOfMemory
        }
        other => creation_failure(what, other),
    }
}

fn reference_to_vk(reference: &AttachmentReference) -> vk::AttachmentReference {
    vk::AttachmentReference { attachment: reference.attachment, layout: image_layout_to_vk(reference.layout) }
}

/// Vulkan device plus memory allocator
pub struct VulkanDriver {
    _entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,

    /// Dropped before the device is destroyed
    allocator: ManuallyDrop<Mutex<Allocator>>,
    allocations: Mutex<FxHashMap<MemoryHandle, Allocation>>,
    next_memory: AtomicU64,

    queue_families: Vec<QueueFamilyProperties>,
    /// vkQueueSubmit/vkQueuePresentKHR need external synchronization per queue
    queue_locks: FxHashMap<u64, Mutex<()>>,
    secondary_buffers: Mutex<FxHashSet<u64>>,

    swapchain_loader: Option<ash::khr::swapchain::Device>,
    debug_utils: Option<ash::ext::debug_utils::Device>,
    debug_messenger: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanDriver {
    /// Create a headless Vulkan device on the first discrete GPU (or the first GPU found)
    pub fn new(config: VulkanDriverConfig) -> Result<Self> {
        unsafe {
            let entry = ash::Entry::load().map_err(|e| creation_failure("load Vulkan library", e))?;

            let app_name = CString::new(config.application_name.as_str())
                .map_err(|e| creation_failure("encode application name", e))?;
            let app_info = vk::ApplicationInfo::default()
                .application_name(&app_name)
                .application_version(vk::make_api_version(0, 1, 0, 0))
                .engine_name(c"vrg")
                .engine_version(vk::make_api_version(0, 0, 1, 0))
                .api_version(vk::API_VERSION_1_3);

            let debug_enabled = cfg!(feature = "vulkan-validation") && config.enable_validation;

            let mut extension_names: Vec<*const std::os::raw::c_char> =
                config.instance_extensions.iter().map(|name| name.as_ptr()).collect();
            let layer_names = if debug_enabled {
                extension_names.push(ash::ext::debug_utils::NAME.as_ptr());
                vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
            } else {
                vec![]
            };

            let create_info = vk::InstanceCreateInfo::default()
                .application_info(&app_info)
                .enabled_layer_names(&layer_names)
                .enabled_extension_names(&extension_names);

            let instance = entry
                .create_instance(&create_info, None)
                .map_err(|e| creation_failure("create Vulkan instance", e))?;

            let debug_messenger = if debug_enabled {
                Self::create_debug_messenger(&entry, &instance)?
            } else {
                None
            };

            // Pick Physical Device
            let physical_devices = instance
                .enumerate_physical_devices()
                .map_err(|e| creation_failure("enumerate physical devices", e))?;
            let physical_device = physical_devices
                .iter()
                .copied()
                .find(|pd| {
                    instance.get_physical_device_properties(*pd).device_type == vk::PhysicalDeviceType::DISCRETE_GPU
                })
                .or_else(|| physical_devices.first().copied())
                .ok_or_else(|| creation_failure("find a Vulkan-capable GPU", vk::Result::ERROR_INITIALIZATION_FAILED))?;

            let properties = instance.get_physical_device_properties(physical_device);
            let device_name = properties
                .device_name_as_c_str()
                .ok()
                .and_then(|name| name.to_str().ok())
                .unwrap_or("unknown")
                .to_string();
            vrg_info!(SOURCE, "Using GPU '{}'", device_name);

            // Queue families
            let family_properties = instance.get_physical_device_queue_family_properties(physical_device);
            let queue_families: Vec<QueueFamilyProperties> = family_properties
                .iter()
                .enumerate()
                .filter(|(_, family)| family.queue_count > 0)
                .map(|(index, family)| QueueFamilyProperties {
                    index: index as u32,
                    flags: queue_flags_from_vk(family.queue_flags),
                    queue_count: family.queue_count,
                })
                .collect();

            let priorities: Vec<Vec<f32>> =
                queue_families.iter().map(|family| vec![1.0; family.queue_count as usize]).collect();
            let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = queue_families
                .iter()
                .zip(&priorities)
                .map(|(family, priorities)| {
                    vk::DeviceQueueCreateInfo::default()
                        .queue_family_index(family.index)
                        .queue_priorities(priorities)
                })
                .collect();

            let mut device_extension_names = Vec::new();
            if config.enable_swapchain {
                device_extension_names.push(ash::khr::swapchain::NAME.as_ptr());
            }

            let device_create_info = vk::DeviceCreateInfo::default()
                .queue_create_infos(&queue_create_infos)
                .enabled_extension_names(&device_extension_names);

            let device = instance
                .create_device(physical_device, &device_create_info, None)
                .map_err(|e| creation_failure("create logical device", e))?;

            let mut queue_locks = FxHashMap::default();
            for family in &queue_families {
                for queue_index in 0..family.queue_count {
                    let queue = device.get_device_queue(family.index, queue_index);
                    queue_locks.insert(queue.as_raw(), Mutex::new(()));
                }
            }

            let allocator = Allocator::new(&AllocatorCreateDesc {
                instance: instance.clone(),
                device: device.clone(),
                physical_device,
                debug_settings: Default::default(),
                buffer_device_address: false,
                allocation_sizes: Default::default(),
            })
            .map_err(|e| creation_failure("create GPU allocator", e))?;

            let swapchain_loader =
                config.enable_swapchain.then(|| ash::khr::swapchain::Device::new(&instance, &device));
            let debug_utils = debug_enabled.then(|| ash::ext::debug_utils::Device::new(&instance, &device));

            vrg_debug!(SOURCE, "Created device with {} queue families", queue_families.len());

            Ok(Self {
                _entry: entry,
                instance,
                physical_device,
                device,
                allocator: ManuallyDrop::new(Mutex::new(allocator)),
                allocations: Mutex::new(FxHashMap::default()),
                next_memory: AtomicU64::new(1),
                queue_families,
                queue_locks,
                secondary_buffers: Mutex::new(FxHashSet::default()),
                swapchain_loader,
                debug_utils,
                debug_messenger,
            })
        }
    }

    #[cfg(feature = "vulkan-validation")]
    unsafe fn create_debug_messenger(
        entry: &ash::Entry,
        instance: &ash::Instance,
    ) -> Result<Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>> {
        let loader = ash::ext::debug_utils::Instance::new(entry, instance);
        let messenger = loader
            .create_debug_utils_messenger(&crate::vulkan_debug::messenger_create_info(), None)
            .map_err(|e| creation_failure("create debug messenger", e))?;
        Ok(Some((loader, messenger)))
    }

    #[cfg(not(feature = "vulkan-validation"))]
    unsafe fn create_debug_messenger(
        _entry: &ash::Entry,
        _instance: &ash::Instance,
    ) -> Result<Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>> {
        Ok(None)
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    fn name_handle<H: Handle>(&self, handle: H, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        let info = vk::DebugUtilsObjectNameInfoEXT::default().object_handle(handle).object_name(&name);
        if let Err(e) = unsafe { debug_utils.set_debug_utils_object_name(&info) } {
            vrg_warn!(SOURCE, "Failed to name object '{}': {:?}", name.to_string_lossy(), e);
        }
    }

    fn device_memory(&self, allocation: &RawAllocation) -> Result<vk::DeviceMemory> {
        let allocations = self.allocations.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = allocations.get(&allocation.memory).ok_or_else(|| {
            vrg_error!(SOURCE, "Unknown memory handle {:?}", allocation.memory);
            Error::InvalidUsage(format!("Unknown memory handle {:?}", allocation.memory))
        })?;
        Ok(unsafe { entry.memory() })
    }

    fn queue_lock(&self, queue: QueueHandle) -> Result<std::sync::MutexGuard<'_, ()>> {
        let lock = self.queue_locks.get(&queue.0).ok_or_else(|| {
            vrg_error!(SOURCE, "Unknown queue {:?}", queue);
            Error::InvalidUsage(format!("Unknown queue {:?}", queue))
        })?;
        Ok(lock.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Driver for VulkanDriver {
    // ----- device -----

    fn queue_families(&self) -> Vec<QueueFamilyProperties> {
        self.queue_families.clone()
    }

    fn get_queue(&self, family_index: u32, queue_index: u32) -> QueueHandle {
        let queue = unsafe { self.device.get_device_queue(family_index, queue_index) };
        QueueHandle(queue.as_raw())
    }

    fn device_wait_idle(&self) -> Result<()> {
        // Waiting idle touches every queue
        let _guards: Vec<_> =
            self.queue_locks.values().map(|lock| lock.lock().unwrap_or_else(PoisonError::into_inner)).collect();
        unsafe { self.device.device_wait_idle() }.map_err(|e| async_failure("wait for device idle", e))
    }

    fn set_object_name(&self, object: NamedObject, name: &str) {
        match object {
            NamedObject::Buffer(h) => self.name_handle(vk::Buffer::from_raw(h.0), name),
            NamedObject::Image(h) => self.name_handle(vk::Image::from_raw(h.0), name),
            NamedObject::ImageView(h) => self.name_handle(vk::ImageView::from_raw(h.0), name),
            NamedObject::Fence(h) => self.name_handle(vk::Fence::from_raw(h.0), name),
            NamedObject::Semaphore(h) => self.name_handle(vk::Semaphore::from_raw(h.0), name),
            NamedObject::CommandBuffer(h) => self.name_handle(vk::CommandBuffer::from_raw(h.0), name),
            NamedObject::DescriptorSet(h) => self.name_handle(vk::DescriptorSet::from_raw(h.0), name),
            NamedObject::DescriptorSetLayout(h) => self.name_handle(vk::DescriptorSetLayout::from_raw(h.0), name),
            NamedObject::RenderPass(h) => self.name_handle(vk::RenderPass::from_raw(h.0), name),
            NamedObject::Framebuffer(h) => self.name_handle(vk::Framebuffer::from_raw(h.0), name),
            NamedObject::ShaderModule(h) => self.name_handle(vk::ShaderModule::from_raw(h.0), name),
            NamedObject::PipelineLayout(h) => self.name_handle(vk::PipelineLayout::from_raw(h.0), name),
            NamedObject::Pipeline(h) => self.name_handle(vk::Pipeline::from_raw(h.0), name),
        }
    }

    // ----- memory -----

    fn allocate_memory(
        &self,
        requirements: &MemoryRequirements,
        location: MemoryLocation,
        name: &str,
    ) -> Result<RawAllocation> {
        let desc = AllocationCreateDesc {
            name,
            requirements: vk::MemoryRequirements {
                size: requirements.size,
                alignment: requirements.alignment,
                memory_type_bits: requirements.memory_type_bits,
            },
            location: memory_location_to_allocator(location),
            linear: requirements.linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        };

        let allocation = self.allocator.lock().unwrap_or_else(PoisonError::into_inner).allocate(&desc).map_err(
            |e| match e {
                AllocationError::OutOfMemory => {
                    vrg_error!(SOURCE, "Out of device memory allocating '{}'", name);
                    Error::OutOfMemory
                }
                other => creation_failure(&format!("allocate memory for '{}'", name), other),
            },
        )?;

        let handle = MemoryHandle(self.next_memory.fetch_add(1, Ordering::Relaxed));
        let raw = RawAllocation {
            memory: handle,
            offset: allocation.offset(),
            size: allocation.size(),
            mapped: allocation.mapped_ptr().map(|ptr| MappedPtr(ptr.cast())),
        };
        self.allocations.lock().unwrap_or_else(PoisonError::into_inner).insert(handle, allocation);
        Ok(raw)
    }

    fn free_memory(&self, memory: MemoryHandle) {
        let removed = self.allocations.lock().unwrap_or_else(PoisonError::into_inner).remove(&memory);
        match removed {
            Some(allocation) => {
                if let Err(e) = self.allocator.lock().unwrap_or_else(PoisonError::into_inner).free(allocation) {
                    vrg_error!(SOURCE, "Failed to free memory {:?}: {:?}", memory, e);
                }
            }
            None => vrg_warn!(SOURCE, "Ignoring free of unknown memory {:?}", memory),
        }
    }

    // ----- buffers and images -----

    fn create_buffer(&self, info: &BufferCreateInfo) -> Result<BufferHandle> {
        let create_info = vk::BufferCreateInfo::default()
            .size(info.size)
            .usage(vk::BufferUsageFlags::from_raw(info.usage.bits()))
            .sharing_mode(sharing_mode_to_vk(info.sharing_mode))
            .queue_family_indices(&info.queue_family_indices);
        let buffer = unsafe { self.device.create_buffer(&create_info, None) }
            .map_err(|e| vk_result_to_error("create buffer", e))?;
        Ok(BufferHandle(buffer.as_raw()))
    }

    fn buffer_memory_requirements(&self, buffer: BufferHandle) -> MemoryRequirements {
        let req = unsafe { self.device.get_buffer_memory_requirements(vk::Buffer::from_raw(buffer.0)) };
        MemoryRequirements { size: req.size, alignment: req.alignment, memory_type_bits: req.memory_type_bits, linear: true }
    }

    fn bind_buffer_memory(&self, buffer: BufferHandle, allocation: &RawAllocation) -> Result<()> {
        let memory = self.device_memory(allocation)?;
        unsafe { self.device.bind_buffer_memory(vk::Buffer::from_raw(buffer.0), memory, allocation.offset) }
            .map_err(|e| vk_result_to_error("bind buffer memory", e))
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        unsafe { self.device.destroy_buffer(vk::Buffer::from_raw(buffer.0), None) };
    }

    fn create_image(&self, info: &ImageCreateInfo) -> Result<ImageHandle> {
        let flags = if info.cube_compatible {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };
        let create_info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(image_type_to_vk(info.image_type))
            .format(format_to_vk(info.format))
            .extent(extent_to_vk(info.extent))
            .mip_levels(info.mip_levels)
            .array_layers(info.array_layers)
            .samples(sample_count_to_vk(info.samples))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::from_raw(info.usage.bits()))
            .sharing_mode(sharing_mode_to_vk(info.sharing_mode))
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&create_info, None) }
            .map_err(|e| vk_result_to_error("create image", e))?;
        Ok(ImageHandle(image.as_raw()))
    }

    fn image_memory_requirements(&self, image: ImageHandle) -> MemoryRequirements {
        let req = unsafe { self.device.get_image_memory_requirements(vk::Image::from_raw(image.0)) };
        MemoryRequirements {
            size: req.size,
            alignment: req.alignment,
            memory_type_bits: req.memory_type_bits,
            linear: false,
        }
    }

    fn bind_image_memory(&self, image: ImageHandle, allocation: &RawAllocation) -> Result<()> {
        let memory = self.device_memory(allocation)?;
        unsafe { self.device.bind_image_memory(vk::Image::from_raw(image.0), memory, allocation.offset) }
            .map_err(|e| vk_result_to_error("bind image memory", e))
    }

    fn destroy_image(&self, image: ImageHandle) {
        unsafe { self.device.destroy_image(vk::Image::from_raw(image.0), None) };
    }

    fn create_image_view(&self, info: &ImageViewCreateInfo) -> Result<ImageViewHandle> {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(vk::Image::from_raw(info.image.0))
            .view_type(image_view_type_to_vk(info.view_type))
            .format(format_to_vk(info.format))
            .components(component_mapping_to_vk(info.components))
            .subresource_range(subresource_range_to_vk(&info.range));
        let view = unsafe { self.device.create_image_view(&create_info, None) }
            .map_err(|e| vk_result_to_error("create image view", e))?;
        Ok(ImageViewHandle(view.as_raw()))
    }

    fn destroy_image_view(&self, view: ImageViewHandle) {
        unsafe { self.device.destroy_image_view(vk::ImageView::from_raw(view.0), None) };
    }

    // ----- synchronization -----

    fn create_fence(&self, signaled: bool) -> Result<FenceHandle> {
        let flags = if signaled { vk::FenceCreateFlags::SIGNALED } else { vk::FenceCreateFlags::empty() };
        let fence = unsafe { self.device.create_fence(&vk::FenceCreateInfo::default().flags(flags), None) }
            .map_err(|e| vk_result_to_error("create fence", e))?;
        Ok(FenceHandle(fence.as_raw()))
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        unsafe { self.device.destroy_fence(vk::Fence::from_raw(fence.0), None) };
    }

    fn get_fence_status(&self, fence: FenceHandle) -> Result<bool> {
        unsafe { self.device.get_fence_status(vk::Fence::from_raw(fence.0)) }
            .map_err(|e| async_failure("query fence status", e))
    }

    fn wait_for_fence(&self, fence: FenceHandle, timeout_ns: u64) -> Result<bool> {
        match unsafe { self.device.wait_for_fences(&[vk::Fence::from_raw(fence.0)], true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(async_failure("wait for fence", e)),
        }
    }

    fn reset_fence(&self, fence: FenceHandle) -> Result<()> {
        unsafe { self.device.reset_fences(&[vk::Fence::from_raw(fence.0)]) }
            .map_err(|e| async_failure("reset fence", e))
    }

    fn create_semaphore(&self) -> Result<SemaphoreHandle> {
        let semaphore = unsafe { self.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }
            .map_err(|e| vk_result_to_error("create semaphore", e))?;
        Ok(SemaphoreHandle(semaphore.as_raw()))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        unsafe { self.device.destroy_semaphore(vk::Semaphore::from_raw(semaphore.0), None) };
    }

    // ----- descriptors -----

    fn create_descriptor_pool(&self, info: &DescriptorPoolCreateInfo) -> Result<DescriptorPoolHandle> {
        // Inline uniform blocks and acceleration structures need extension structs
        let pool_sizes: Vec<vk::DescriptorPoolSize> = info
            .pool_sizes
            .iter()
            .filter(|(ty, count)| {
                *count > 0
                    && !matches!(ty, DescriptorType::InlineUniformBlock | DescriptorType::AccelerationStructure)
            })
            .map(|(ty, count)| vk::DescriptorPoolSize { ty: descriptor_type_to_vk(*ty), descriptor_count: *count })
            .collect();
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(info.max_sets)
            .pool_sizes(&pool_sizes);
        let pool = unsafe { self.device.create_descriptor_pool(&create_info, None) }
            .map_err(|e| vk_result_to_error("create descriptor pool", e))?;
        Ok(DescriptorPoolHandle(pool.as_raw()))
    }

    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle) {
        unsafe { self.device.destroy_descriptor_pool(vk::DescriptorPool::from_raw(pool.0), None) };
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &BTreeMap<u32, DescriptorBinding>,
    ) -> Result<DescriptorSetLayoutHandle> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|(index, binding)| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(*index)
                    .descriptor_type(descriptor_type_to_vk(binding.descriptor_type))
                    .descriptor_count(binding.count)
                    .stage_flags(vk::ShaderStageFlags::from_raw(binding.stage_flags.bits()))
            })
            .collect();
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        let layout = unsafe { self.device.create_descriptor_set_layout(&create_info, None) }
            .map_err(|e| vk_result_to_error("create descriptor set layout", e))?;
        Ok(DescriptorSetLayoutHandle(layout.as_raw()))
    }

    fn destroy_descriptor_set_layout(&self, layout: DescriptorSetLayoutHandle) {
        unsafe { self.device.destroy_descriptor_set_layout(vk::DescriptorSetLayout::from_raw(layout.0), None) };
    }

    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
    ) -> Result<DescriptorSetHandle> {
        let layouts = [vk::DescriptorSetLayout::from_raw(layout.0)];
        let allocate_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(vk::DescriptorPool::from_raw(pool.0))
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&allocate_info) }.map_err(|e| match e {
            vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                vrg_error!(SOURCE, "Descriptor pool exhausted: {:?}", e);
                Error::OutOfMemory
            }
            other => vk_result_to_error("allocate descriptor set", other),
        })?;
        sets.first()
            .map(|set| DescriptorSetHandle(set.as_raw()))
            .ok_or_else(|| creation_failure("allocate descriptor set", "empty result"))
    }

    fn free_descriptor_set(&self, pool: DescriptorPoolHandle, set: DescriptorSetHandle) {
        let result = unsafe {
            self.device
                .free_descriptor_sets(vk::DescriptorPool::from_raw(pool.0), &[vk::DescriptorSet::from_raw(set.0)])
        };
        if let Err(e) = result {
            vrg_warn!(SOURCE, "Failed to free descriptor set: {:?}", e);
        }
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        enum Payload {
            Buffer(usize),
            Image(usize),
        }

        let mut buffer_infos = Vec::new();
        let mut image_infos = Vec::new();
        let mut payloads = Vec::with_capacity(writes.len());

        for write in writes {
            match write.info {
                DescriptorWriteInfo::Buffer { buffer, offset, range } => {
                    buffer_infos.push(vk::DescriptorBufferInfo {
                        buffer: vk::Buffer::from_raw(buffer.0),
                        offset,
                        range,
                    });
                    payloads.push((write, Payload::Buffer(buffer_infos.len() - 1)));
                }
                DescriptorWriteInfo::Image { view, layout, sampler } => {
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler: sampler.map_or(vk::Sampler::null(), |s| vk::Sampler::from_raw(s.0)),
                        image_view: vk::ImageView::from_raw(view.0),
                        image_layout: image_layout_to_vk(layout),
                    });
                    payloads.push((write, Payload::Image(image_infos.len() - 1)));
                }
                DescriptorWriteInfo::AccelerationStructure(_) => {
                    vrg_warn!(SOURCE, "Skipping acceleration structure write at binding {}", write.binding);
                }
            }
        }

        let vk_writes: Vec<vk::WriteDescriptorSet> = payloads
            .iter()
            .map(|(write, payload)| {
                let vk_write = vk::WriteDescriptorSet::default()
                    .dst_set(vk::DescriptorSet::from_raw(write.set.0))
                    .dst_binding(write.binding)
                    .dst_array_element(write.array_element)
                    .descriptor_type(descriptor_type_to_vk(write.descriptor_type));
                match payload {
                    Payload::Buffer(i) => vk_write.buffer_info(std::slice::from_ref(&buffer_infos[*i])),
                    Payload::Image(i) => vk_write.image_info(std::slice::from_ref(&image_infos[*i])),
                }
            })
            .collect();

        if !vk_writes.is_empty() {
            unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
        }
    }

    // ----- passes and pipelines -----

    fn create_render_pass(&self, layout: &RenderPassLayout) -> Result<RenderPassHandle> {
        struct SubpassRefs {
            input: Vec<vk::AttachmentReference>,
            color: Vec<vk::AttachmentReference>,
            resolve: Vec<vk::AttachmentReference>,
            depth_stencil: Option<vk::AttachmentReference>,
        }

        let attachments: Vec<vk::AttachmentDescription> = layout
            .attachments
            .iter()
            .map(|(_, a)| {
                vk::AttachmentDescription::default()
                    .format(format_to_vk(a.format))
                    .samples(sample_count_to_vk(a.samples))
                    .load_op(load_op_to_vk(a.load_op))
                    .store_op(store_op_to_vk(a.store_op))
                    .stencil_load_op(load_op_to_vk(a.stencil_load_op))
                    .stencil_store_op(store_op_to_vk(a.stencil_store_op))
                    .initial_layout(image_layout_to_vk(a.initial_layout))
                    .final_layout(image_layout_to_vk(a.final_layout))
            })
            .collect();

        let refs: Vec<SubpassRefs> = layout
            .subpasses
            .iter()
            .map(|subpass| SubpassRefs {
                input: subpass.input.iter().map(reference_to_vk).collect(),
                color: subpass.color.iter().map(reference_to_vk).collect(),
                resolve: subpass.resolve.iter().map(reference_to_vk).collect(),
                depth_stencil: subpass.depth_stencil.as_ref().map(reference_to_vk),
            })
            .collect();

        let subpasses: Vec<vk::SubpassDescription> = layout
            .subpasses
            .iter()
            .zip(&refs)
            .map(|(subpass, refs)| {
                let mut description = vk::SubpassDescription::default()
                    .pipeline_bind_point(bind_point_to_vk(subpass.bind_point))
                    .input_attachments(&refs.input)
                    .color_attachments(&refs.color)
                    .preserve_attachments(&subpass.preserve);
                if !refs.resolve.is_empty() {
                    description = description.resolve_attachments(&refs.resolve);
                }
                if let Some(depth_stencil) = &refs.depth_stencil {
                    description = description.depth_stencil_attachment(depth_stencil);
                }
                description
            })
            .collect();

        let dependencies: Vec<vk::SubpassDependency> = layout
            .dependencies
            .iter()
            .map(|d| vk::SubpassDependency {
                src_subpass: d.src_subpass,
                dst_subpass: d.dst_subpass,
                src_stage_mask: vk::PipelineStageFlags::from_raw(d.src_stage_mask.bits()),
                dst_stage_mask: vk::PipelineStageFlags::from_raw(d.dst_stage_mask.bits()),
                src_access_mask: vk::AccessFlags::from_raw(d.src_access_mask.bits()),
                dst_access_mask: vk::AccessFlags::from_raw(d.dst_access_mask.bits()),
                dependency_flags: vk::DependencyFlags::from_raw(d.dependency_flags.bits()),
            })
            .collect();

        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        let render_pass = unsafe { self.device.create_render_pass(&create_info, None) }
            .map_err(|e| vk_result_to_error("create render pass", e))?;
        Ok(RenderPassHandle(render_pass.as_raw()))
    }

    fn destroy_render_pass(&self, render_pass: RenderPassHandle) {
        unsafe { self.device.destroy_render_pass(vk::RenderPass::from_raw(render_pass.0), None) };
    }

    fn create_framebuffer(&self, info: &FramebufferCreateInfo) -> Result<FramebufferHandle> {
        let views: Vec<vk::ImageView> = info.attachments.iter().map(|v| vk::ImageView::from_raw(v.0)).collect();
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(vk::RenderPass::from_raw(info.render_pass.0))
            .attachments(&views)
            .width(info.extent.width)
            .height(info.extent.height)
            .layers(info.layers);
        let framebuffer = unsafe { self.device.create_framebuffer(&create_info, None) }
            .map_err(|e| vk_result_to_error("create framebuffer", e))?;
        Ok(FramebufferHandle(framebuffer.as_raw()))
    }

    fn destroy_framebuffer(&self, framebuffer: FramebufferHandle) {
        unsafe { self.device.destroy_framebuffer(vk::Framebuffer::from_raw(framebuffer.0), None) };
    }

    fn create_shader_module(&self, spirv: &[u32]) -> Result<ShaderModuleHandle> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(spirv);
        let module = unsafe { self.device.create_shader_module(&create_info, None) }
            .map_err(|e| vk_result_to_error("create shader module", e))?;
        Ok(ShaderModuleHandle(module.as_raw()))
    }

    fn destroy_shader_module(&self, module: ShaderModuleHandle) {
        unsafe { self.device.destroy_shader_module(vk::ShaderModule::from_raw(module.0), None) };
    }

    fn create_pipeline_layout(&self, info: &PipelineLayoutCreateInfo) -> Result<PipelineLayoutHandle> {
        let set_layouts: Vec<vk::DescriptorSetLayout> =
            info.set_layouts.iter().map(|l| vk::DescriptorSetLayout::from_raw(l.0)).collect();
        let ranges: Vec<vk::PushConstantRange> = info
            .push_constant_ranges
            .iter()
            .map(|r| vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::from_raw(r.stages.bits()),
                offset: r.offset,
                size: r.size,
            })
            .collect();
        let create_info =
            vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts).push_constant_ranges(&ranges);
        let layout = unsafe { self.device.create_pipeline_layout(&create_info, None) }
            .map_err(|e| vk_result_to_error("create pipeline layout", e))?;
        Ok(PipelineLayoutHandle(layout.as_raw()))
    }

    fn destroy_pipeline_layout(&self, layout: PipelineLayoutHandle) {
        unsafe { self.device.destroy_pipeline_layout(vk::PipelineLayout::from_raw(layout.0), None) };
    }

    fn create_graphics_pipeline(&self, info: &GraphicsPipelineCreateInfo) -> Result<PipelineHandle> {
        let entry_points: Vec<CString> = info
            .stages
            .iter()
            .map(|stage| CString::new(stage.entry_point.as_str()))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| creation_failure("encode shader entry point", e))?;

        let stages: Vec<vk::PipelineShaderStageCreateInfo> = info
            .stages
            .iter()
            .zip(&entry_points)
            .map(|(stage, entry_point)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(vk::ShaderStageFlags::from_raw(stage.stage.bits()))
                    .module(vk::ShaderModule::from_raw(stage.module.0))
                    .name(entry_point)
            })
            .collect();

        let vertex_bindings: Vec<vk::VertexInputBindingDescription> = info
            .vertex_bindings
            .iter()
            .map(|b| vk::VertexInputBindingDescription {
                binding: b.binding,
                stride: b.stride,
                input_rate: input_rate_to_vk(b.input_rate),
            })
            .collect();
        let vertex_attributes: Vec<vk::VertexInputAttributeDescription> = info
            .vertex_attributes
            .iter()
            .map(|a| vk::VertexInputAttributeDescription {
                location: a.location,
                binding: a.binding,
                format: format_to_vk(a.format),
                offset: a.offset,
            })
            .collect();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes);

        let input_assembly =
            vk::PipelineInputAssemblyStateCreateInfo::default().topology(topology_to_vk(info.topology));

        // Viewport and scissor are always set dynamically
        let viewport_state = vk::PipelineViewportStateCreateInfo::default().viewport_count(1).scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(polygon_mode_to_vk(info.rasterization.polygon_mode))
            .cull_mode(cull_mode_to_vk(info.rasterization.cull_mode))
            .front_face(front_face_to_vk(info.rasterization.front_face))
            .line_width(info.rasterization.line_width);

        let multisample =
            vk::PipelineMultisampleStateCreateInfo::default().rasterization_samples(sample_count_to_vk(info.samples));

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(info.depth_stencil.depth_test)
            .depth_write_enable(info.depth_stencil.depth_write)
            .depth_compare_op(compare_op_to_vk(info.depth_stencil.compare_op));

        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> =
            info.blend_states.iter().map(blend_state_to_vk).collect();
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let dynamic_states: Vec<vk::DynamicState> =
            info.dynamic_states.iter().copied().map(dynamic_state_to_vk).collect();
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(vk::PipelineLayout::from_raw(info.layout.0))
            .render_pass(vk::RenderPass::from_raw(info.render_pass.0))
            .subpass(info.subpass);

        let pipelines = unsafe {
            self.device.create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
        }
        .map_err(|(_, e)| vk_result_to_error("create graphics pipeline", e))?;
        pipelines
            .first()
            .map(|p| PipelineHandle(p.as_raw()))
            .ok_or_else(|| creation_failure("create graphics pipeline", "empty result"))
    }

    fn create_compute_pipeline(&self, info: &ComputePipelineCreateInfo) -> Result<PipelineHandle> {
        let entry_point =
            CString::new(info.entry_point.as_str()).map_err(|e| creation_failure("encode shader entry point", e))?;
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(vk::ShaderModule::from_raw(info.module.0))
            .name(&entry_point);
        let create_info =
            vk::ComputePipelineCreateInfo::default().stage(stage).layout(vk::PipelineLayout::from_raw(info.layout.0));

        let pipelines = unsafe {
            self.device.create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
        }
        .map_err(|(_, e)| vk_result_to_error("create compute pipeline", e))?;
        pipelines
            .first()
            .map(|p| PipelineHandle(p.as_raw()))
            .ok_or_else(|| creation_failure("create compute pipeline", "empty result"))
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        unsafe { self.device.destroy_pipeline(vk::Pipeline::from_raw(pipeline.0), None) };
    }

    // ----- command pools and buffers -----

    fn create_command_pool(&self, family_index: u32) -> Result<CommandPoolHandle> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe { self.device.create_command_pool(&create_info, None) }
            .map_err(|e| vk_result_to_error("create command pool", e))?;
        Ok(CommandPoolHandle(pool.as_raw()))
    }

    fn destroy_command_pool(&self, pool: CommandPoolHandle) {
        unsafe { self.device.destroy_command_pool(vk::CommandPool::from_raw(pool.0), None) };
    }

    fn allocate_command_buffer(
        &self,
        pool: CommandPoolHandle,
        level: CommandBufferLevel,
    ) -> Result<CommandBufferHandle> {
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(vk::CommandPool::from_raw(pool.0))
            .level(command_buffer_level_to_vk(level))
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&allocate_info) }
            .map_err(|e| vk_result_to_error("allocate command buffer", e))?;
        let handle = buffers
            .first()
            .map(|cb| CommandBufferHandle(cb.as_raw()))
            .ok_or_else(|| creation_failure("allocate command buffer", "empty result"))?;
        if level == CommandBufferLevel::Secondary {
            self.secondary_buffers.lock().unwrap_or_else(PoisonError::into_inner).insert(handle.0);
        }
        Ok(handle)
    }

    fn free_command_buffer(&self, pool: CommandPoolHandle, command_buffer: CommandBufferHandle) {
        self.secondary_buffers.lock().unwrap_or_else(PoisonError::into_inner).remove(&command_buffer.0);
        unsafe {
            self.device.free_command_buffers(
                vk::CommandPool::from_raw(pool.0),
                &[vk::CommandBuffer::from_raw(command_buffer.0)],
            )
        };
    }

    fn begin_command_buffer(&self, command_buffer: CommandBufferHandle) -> Result<()> {
        let secondary =
            self.secondary_buffers.lock().unwrap_or_else(PoisonError::into_inner).contains(&command_buffer.0);
        let inheritance = vk::CommandBufferInheritanceInfo::default();
        let mut begin_info =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        if secondary {
            begin_info = begin_info.inheritance_info(&inheritance);
        }
        unsafe { self.device.begin_command_buffer(vk::CommandBuffer::from_raw(command_buffer.0), &begin_info) }
            .map_err(|e| async_failure("begin command buffer", e))
    }

    fn end_command_buffer(&self, command_buffer: CommandBufferHandle) -> Result<()> {
        unsafe { self.device.end_command_buffer(vk::CommandBuffer::from_raw(command_buffer.0)) }
            .map_err(|e| async_failure("end command buffer", e))
    }

    fn reset_command_buffer(&self, command_buffer: CommandBufferHandle) -> Result<()> {
        unsafe {
            self.device.reset_command_buffer(
                vk::CommandBuffer::from_raw(command_buffer.0),
                vk::CommandBufferResetFlags::empty(),
            )
        }
        .map_err(|e| async_failure("reset command buffer", e))
    }

    // ----- recording -----

    fn cmd_pipeline_barrier(
        &self,
        command_buffer: CommandBufferHandle,
        src_stage: PipelineStageFlags,
        dst_stage: PipelineStageFlags,
        barriers: &[ImageBarrier],
    ) {
        let image_barriers: Vec<vk::ImageMemoryBarrier> = barriers
            .iter()
            .map(|b| {
                vk::ImageMemoryBarrier::default()
                    .image(vk::Image::from_raw(b.image.0))
                    .old_layout(image_layout_to_vk(b.old_layout))
                    .new_layout(image_layout_to_vk(b.new_layout))
                    .src_access_mask(vk::AccessFlags::from_raw(b.src_access.bits()))
                    .dst_access_mask(vk::AccessFlags::from_raw(b.dst_access.bits()))
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .subresource_range(subresource_range_to_vk(&b.range))
            })
            .collect();
        unsafe {
            self.device.cmd_pipeline_barrier(
                vk::CommandBuffer::from_raw(command_buffer.0),
                vk::PipelineStageFlags::from_raw(src_stage.bits()),
                vk::PipelineStageFlags::from_raw(dst_stage.bits()),
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &image_barriers,
            )
        };
    }

    fn cmd_begin_render_pass(&self, command_buffer: CommandBufferHandle, info: &RenderPassBeginInfo) {
        let clear_values: Vec<vk::ClearValue> = info.clear_values.iter().map(clear_value_to_vk).collect();
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(vk::RenderPass::from_raw(info.render_pass.0))
            .framebuffer(vk::Framebuffer::from_raw(info.framebuffer.0))
            .render_area(rect_to_vk(&info.render_area))
            .clear_values(&clear_values);
        unsafe {
            self.device.cmd_begin_render_pass(
                vk::CommandBuffer::from_raw(command_buffer.0),
                &begin_info,
                vk::SubpassContents::INLINE,
            )
        };
    }

    fn cmd_next_subpass(&self, command_buffer: CommandBufferHandle) {
        unsafe {
            self.device.cmd_next_subpass(vk::CommandBuffer::from_raw(command_buffer.0), vk::SubpassContents::INLINE)
        };
    }

    fn cmd_end_render_pass(&self, command_buffer: CommandBufferHandle) {
        unsafe { self.device.cmd_end_render_pass(vk::CommandBuffer::from_raw(command_buffer.0)) };
    }

    fn cmd_bind_pipeline(
        &self,
        command_buffer: CommandBufferHandle,
        bind_point: PipelineBindPoint,
        pipeline: PipelineHandle,
    ) {
        unsafe {
            self.device.cmd_bind_pipeline(
                vk::CommandBuffer::from_raw(command_buffer.0),
                bind_point_to_vk(bind_point),
                vk::Pipeline::from_raw(pipeline.0),
            )
        };
    }

    fn cmd_bind_vertex_buffer(
        &self,
        command_buffer: CommandBufferHandle,
        binding: u32,
        buffer: BufferHandle,
        offset: u64,
    ) {
        unsafe {
            self.device.cmd_bind_vertex_buffers(
                vk::CommandBuffer::from_raw(command_buffer.0),
                binding,
                &[vk::Buffer::from_raw(buffer.0)],
                &[offset],
            )
        };
    }

    fn cmd_bind_index_buffer(
        &self,
        command_buffer: CommandBufferHandle,
        buffer: BufferHandle,
        offset: u64,
        index_type: IndexType,
    ) {
        unsafe {
            self.device.cmd_bind_index_buffer(
                vk::CommandBuffer::from_raw(command_buffer.0),
                vk::Buffer::from_raw(buffer.0),
                offset,
                index_type_to_vk(index_type),
            )
        };
    }

    fn cmd_bind_descriptor_set(
        &self,
        command_buffer: CommandBufferHandle,
        bind_point: PipelineBindPoint,
        layout: PipelineLayoutHandle,
        set_index: u32,
        set: DescriptorSetHandle,
    ) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                vk::CommandBuffer::from_raw(command_buffer.0),
                bind_point_to_vk(bind_point),
                vk::PipelineLayout::from_raw(layout.0),
                set_index,
                &[vk::DescriptorSet::from_raw(set.0)],
                &[],
            )
        };
    }

    fn cmd_push_constants(
        &self,
        command_buffer: CommandBufferHandle,
        layout: PipelineLayoutHandle,
        stages: ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        unsafe {
            self.device.cmd_push_constants(
                vk::CommandBuffer::from_raw(command_buffer.0),
                vk::PipelineLayout::from_raw(layout.0),
                vk::ShaderStageFlags::from_raw(stages.bits()),
                offset,
                data,
            )
        };
    }

    fn cmd_set_viewport(&self, command_buffer: CommandBufferHandle, viewport: &Viewport) {
        let vk_viewport = vk::Viewport {
            x: viewport.x,
            y: viewport.y,
            width: viewport.width,
            height: viewport.height,
            min_depth: viewport.min_depth,
            max_depth: viewport.max_depth,
        };
        unsafe { self.device.cmd_set_viewport(vk::CommandBuffer::from_raw(command_buffer.0), 0, &[vk_viewport]) };
    }

    fn cmd_set_scissor(&self, command_buffer: CommandBufferHandle, scissor: &Rect2D) {
        unsafe {
            self.device.cmd_set_scissor(vk::CommandBuffer::from_raw(command_buffer.0), 0, &[rect_to_vk(scissor)])
        };
    }

    fn cmd_draw(
        &self,
        command_buffer: CommandBufferHandle,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw(
                vk::CommandBuffer::from_raw(command_buffer.0),
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            )
        };
    }

    fn cmd_draw_indexed(
        &self,
        command_buffer: CommandBufferHandle,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw_indexed(
                vk::CommandBuffer::from_raw(command_buffer.0),
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        };
    }

    fn cmd_dispatch(&self, command_buffer: CommandBufferHandle, x: u32, y: u32, z: u32) {
        unsafe { self.device.cmd_dispatch(vk::CommandBuffer::from_raw(command_buffer.0), x, y, z) };
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: CommandBufferHandle,
        src: BufferHandle,
        dst: BufferHandle,
        regions: &[BufferCopy],
    ) {
        let vk_regions: Vec<vk::BufferCopy> = regions
            .iter()
            .map(|r| vk::BufferCopy { src_offset: r.src_offset, dst_offset: r.dst_offset, size: r.size })
            .collect();
        unsafe {
            self.device.cmd_copy_buffer(
                vk::CommandBuffer::from_raw(command_buffer.0),
                vk::Buffer::from_raw(src.0),
                vk::Buffer::from_raw(dst.0),
                &vk_regions,
            )
        };
    }

    fn cmd_begin_label(&self, command_buffer: CommandBufferHandle, name: &str, color: [f32; 4]) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        let label = vk::DebugUtilsLabelEXT::default().label_name(&name).color(color);
        unsafe { debug_utils.cmd_begin_debug_utils_label(vk::CommandBuffer::from_raw(command_buffer.0), &label) };
    }

    fn cmd_end_label(&self, command_buffer: CommandBufferHandle) {
        if let Some(debug_utils) = &self.debug_utils {
            unsafe { debug_utils.cmd_end_debug_utils_label(vk::CommandBuffer::from_raw(command_buffer.0)) };
        }
    }

    // ----- queues -----

    fn queue_submit(&self, queue: QueueHandle, submit: &SubmitInfo<'_>) -> Result<()> {
        let wait_semaphores: Vec<vk::Semaphore> =
            submit.wait_semaphores.iter().map(|(s, _)| vk::Semaphore::from_raw(s.0)).collect();
        let wait_stages: Vec<vk::PipelineStageFlags> =
            submit.wait_semaphores.iter().map(|(_, stage)| vk::PipelineStageFlags::from_raw(stage.bits())).collect();
        let signal_semaphores: Vec<vk::Semaphore> =
            submit.signal_semaphores.iter().map(|s| vk::Semaphore::from_raw(s.0)).collect();
        let command_buffers = [vk::CommandBuffer::from_raw(submit.command_buffer.0)];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        let _guard = self.queue_lock(queue)?;
        unsafe {
            self.device.queue_submit(
                vk::Queue::from_raw(queue.0),
                &[submit_info],
                vk::Fence::from_raw(submit.fence.0),
            )
        }
        .map_err(|e| async_failure("submit commands to GPU queue", e))
    }

    fn queue_present(&self, queue: QueueHandle, present: &PresentInfo<'_>) -> Result<bool> {
        let Some(swapchain_loader) = &self.swapchain_loader else {
            vrg_error!(SOURCE, "Present requested but the swapchain extension is not enabled");
            return Err(Error::InvalidUsage("Swapchain extension is not enabled".to_string()));
        };

        let wait_semaphores: Vec<vk::Semaphore> =
            present.wait_semaphores.iter().map(|s| vk::Semaphore::from_raw(s.0)).collect();
        let swapchains = [vk::SwapchainKHR::from_raw(present.swapchain.0)];
        let image_indices = [present.image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let _guard = self.queue_lock(queue)?;
        match unsafe { swapchain_loader.queue_present(vk::Queue::from_raw(queue.0), &present_info) } {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                vrg_warn!(SOURCE, "Swapchain out of date on present");
                Ok(true)
            }
            Err(e) => Err(async_failure("present swapchain image", e)),
        }
    }
}

impl Drop for VulkanDriver {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                vrg_error!(SOURCE, "Failed to wait for device idle on shutdown: {:?}", e);
            }

            let leftovers: Vec<Allocation> = self
                .allocations
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner)
                .drain()
                .map(|(_, allocation)| allocation)
                .collect();
            let allocator = ManuallyDrop::take(&mut self.allocator);
            let mut allocator = allocator.into_inner().unwrap_or_else(PoisonError::into_inner);
            if !leftovers.is_empty() {
                vrg_warn!(SOURCE, "{} allocations still alive at shutdown", leftovers.len());
            }
            for allocation in leftovers {
                if let Err(e) = allocator.free(allocation) {
                    vrg_error!(SOURCE, "Failed to free leaked allocation: {:?}", e);
                }
            }
            drop(allocator);

            self.device.destroy_device(None);
            if let Some((loader, messenger)) = self.debug_messenger.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}
