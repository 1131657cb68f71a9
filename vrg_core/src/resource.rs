//! Common base of every device object
//!
//! A resource owns one or more native handles, a debug name and a reference
//! to the device context that created it. Handles are released in the
//! owning type's `Drop`, which runs once when the last `Arc` goes away.

use std::sync::Arc;

use crate::device::DeviceContext;
use crate::driver::{Driver, NamedObject};

/// Name and owning device of a resource
pub struct ResourceBase {
    name: String,
    context: Arc<DeviceContext>,
}

impl ResourceBase {
    pub fn new(context: Arc<DeviceContext>, name: impl Into<String>) -> Self {
        Self { name: name.into(), context }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.context
    }

    pub fn driver(&self) -> &dyn Driver {
        self.context.driver()
    }

    /// Forward the debug name to the driver when labels are enabled
    pub fn label(&self, object: NamedObject) {
        if self.context.config().debug_labels {
            self.context.driver().set_object_name(object, &self.name);
        }
    }

    /// Rename for recycled objects
    pub(crate) fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }
}

impl std::fmt::Debug for ResourceBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceBase").field("name", &self.name).finish()
    }
}

/// Any object owning a native GPU handle with managed lifetime
///
/// Command buffers keep `Arc<dyn DeviceResource>` references to everything
/// they record so the objects outlive GPU execution.
pub trait DeviceResource: Send + Sync + 'static {
    fn base(&self) -> &ResourceBase;

    fn name(&self) -> &str {
        self.base().name()
    }
}
