/*!
# VRG Core

Resource lifetime and synchronization layer over an explicit, Vulkan-style
graphics API.

The application describes what it does with resources; the layer derives the
barriers, subpass dependencies and recycling decisions from that description.

## Architecture

- **Driver**: Trait seam to the native API (see `vrg_core_driver_vulkan`)
- **Device**: Per-thread command pools, submission and fence-gated recycling
- **CommandBuffer**: Recording state machine holding every resource it uses
- **Texture**: Image with a hazard tracker (layout, stage, access) and cached views
- **RenderPass**: Subpass dependencies synthesized from attachment roles
- **DescriptorSet**: Deferred descriptor writes flushed in one batch
- **GrowableBuffer**: Geometric vector over device memory

Every device object owns its native handles and releases them when the last
`Arc` goes away.
*/

pub mod buffer;
pub mod command_buffer;
pub mod descriptor_set;
pub mod device;
pub mod driver;
pub mod error;
pub mod framebuffer;
pub mod growable_buffer;
pub mod log;
pub mod memory;
pub mod pipeline;
pub mod render_pass;
pub mod resource;
pub mod sync;
pub mod texture;
pub mod types;

// Main vrg namespace module
pub mod vrg {
    pub use crate::error::{Error, Result};

    pub use crate::device::{Device, DeviceConfig, DeviceContext, QueueFamily};
    pub use crate::driver::Driver;
    pub use crate::resource::{DeviceResource, ResourceBase};

    pub use crate::buffer::{Buffer, BufferDesc, BufferView, StrideView};
    pub use crate::command_buffer::{CommandBuffer, CommandBufferState};
    pub use crate::descriptor_set::{Descriptor, DescriptorBinding, DescriptorSet, DescriptorSetLayout};
    pub use crate::framebuffer::Framebuffer;
    pub use crate::growable_buffer::GrowableBuffer;
    pub use crate::memory::{MemoryAllocation, MemoryArena};
    pub use crate::pipeline::{GraphicsPipelineDesc, Pipeline, PipelineLayout, ShaderModule, ShaderReflection};
    pub use crate::render_pass::{AttachmentDescription, AttachmentRole, RenderPass, SubpassDescription};
    pub use crate::sync::{Fence, Semaphore};
    pub use crate::texture::{Texture, TextureDesc, TextureView, TextureViewDesc, TrackedState};

    // Logging sub-module (types only, macros live at the crate root)
    pub mod log {
        pub use crate::log::{DefaultLogger, LogEntry, LogSeverity, Logger};
    }
}

// Re-export math library at crate root
pub use glam;
