/*!
# VRG Core - Vulkan Driver

Vulkan implementation of the `vrg_core` driver seam.

This crate provides [`VulkanDriver`], which implements `vrg_core::driver::Driver`
using the Ash library for Vulkan bindings and gpu-allocator for memory management.

## Example

```no_run
use std::sync::Arc;
use vrg_core::vrg::{Device, DeviceConfig};
use vrg_core_driver_vulkan::{VulkanDriver, VulkanDriverConfig};

let driver = VulkanDriver::new(VulkanDriverConfig::default())?;
let device = Device::new(Arc::new(driver), DeviceConfig::default())?;
# Ok::<(), vrg_core::vrg::Error>(())
```
*/

mod vulkan_convert;
mod vulkan_driver;

#[cfg(feature = "vulkan-validation")]
mod vulkan_debug;

pub use vulkan_driver::{VulkanDriver, VulkanDriverConfig};

#[cfg(feature = "vulkan-validation")]
pub use vulkan_debug::{validation_stats, ValidationStats};
