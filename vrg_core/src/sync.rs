//! Fences and semaphores
//!
//! A fence is the only CPU-visible completion signal: `status` polls it,
//! `wait` blocks for at most the given timeout. Semaphores order GPU work
//! across submissions and are never observed by the CPU.

use std::sync::Arc;

use crate::device::DeviceContext;
use crate::driver::{FenceHandle, NamedObject, SemaphoreHandle};
use crate::error::Result;
use crate::resource::{DeviceResource, ResourceBase};
use crate::vrg_trace;

pub struct Fence {
    base: ResourceBase,
    handle: FenceHandle,
}

impl Fence {
    pub fn new(context: &Arc<DeviceContext>, name: &str, signaled: bool) -> Result<Fence> {
        let handle = context.driver().create_fence(signaled)?;
        let base = ResourceBase::new(context.clone(), name);
        base.label(NamedObject::Fence(handle));
        vrg_trace!("vrg::sync", "Created fence '{}'", name);
        Ok(Fence { base, handle })
    }

    pub fn handle(&self) -> FenceHandle {
        self.handle
    }

    /// Non-blocking poll, `true` once signaled
    pub fn status(&self) -> Result<bool> {
        self.base.driver().get_fence_status(self.handle)
    }

    /// Block until signaled or `timeout_ns` elapsed; `false` on timeout
    pub fn wait(&self, timeout_ns: u64) -> Result<bool> {
        self.base.driver().wait_for_fence(self.handle, timeout_ns)
    }

    /// Block with the device's default timeout
    pub fn wait_default(&self) -> Result<bool> {
        self.wait(self.base.context().config().default_fence_timeout_ns)
    }

    pub fn reset(&self) -> Result<()> {
        self.base.driver().reset_fence(self.handle)
    }

    pub(crate) fn rename(&mut self, name: &str) {
        self.base.set_name(name);
        self.base.label(NamedObject::Fence(self.handle));
    }
}

impl DeviceResource for Fence {
    fn base(&self) -> &ResourceBase {
        &self.base
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.base.driver().destroy_fence(self.handle);
    }
}

/// Binary GPU-side signal
pub struct Semaphore {
    base: ResourceBase,
    handle: SemaphoreHandle,
}

impl Semaphore {
    pub fn new(context: &Arc<DeviceContext>, name: &str) -> Result<Arc<Semaphore>> {
        let handle = context.driver().create_semaphore()?;
        let base = ResourceBase::new(context.clone(), name);
        base.label(NamedObject::Semaphore(handle));
        Ok(Arc::new(Semaphore { base, handle }))
    }

    pub fn handle(&self) -> SemaphoreHandle {
        self.handle
    }
}

impl DeviceResource for Semaphore {
    fn base(&self) -> &ResourceBase {
        &self.base
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.base.driver().destroy_semaphore(self.handle);
    }
}

#[cfg(test)]
#[path = "sync_tests.rs"]
mod tests;
