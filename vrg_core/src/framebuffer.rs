//! Framebuffers binding texture views to render pass attachment slots

use std::sync::Arc;

use crate::device::DeviceContext;
use crate::driver::{FramebufferCreateInfo, FramebufferHandle, NamedObject};
use crate::error::Result;
use crate::render_pass::RenderPass;
use crate::resource::{DeviceResource, ResourceBase};
use crate::texture::TextureView;
use crate::types::Extent2D;
use crate::{vrg_bail, vrg_trace};

/// Views attached to every slot of a render pass
///
/// Keeps its render pass and all attached textures alive.
pub struct Framebuffer {
    base: ResourceBase,
    handle: FramebufferHandle,
    render_pass: Arc<RenderPass>,
    /// Indexed by attachment slot
    attachments: Vec<TextureView>,
    extent: Extent2D,
}

impl Framebuffer {
    /// Create a framebuffer from named views
    ///
    /// Every attachment of the render pass must be supplied exactly once, with
    /// a view whose texture format matches the attachment's. The framebuffer
    /// extent is the per-dimension maximum over the attached textures.
    pub fn new(
        context: &Arc<DeviceContext>,
        name: &str,
        render_pass: Arc<RenderPass>,
        views: &[(&str, TextureView)],
    ) -> Result<Arc<Framebuffer>> {
        let descriptions = render_pass.attachment_descriptions();
        let mut slots: Vec<Option<TextureView>> = vec![None; descriptions.len()];

        for (attachment, view) in views {
            let index = render_pass.attachment_index(attachment)?;
            if slots[index].is_some() {
                vrg_bail!("vrg::framebuffer", "Framebuffer '{}': attachment '{}' given twice", name, attachment);
            }
            let expected = descriptions[index].1.format;
            let actual = view.texture().format();
            if expected != actual {
                vrg_bail!(
                    "vrg::framebuffer",
                    "Framebuffer '{}': attachment '{}' expects {:?}, got {:?}",
                    name,
                    attachment,
                    expected,
                    actual
                );
            }
            slots[index] = Some(view.clone());
        }

        let mut attachments = Vec::with_capacity(slots.len());
        for (slot, (attachment, _)) in slots.into_iter().zip(descriptions) {
            match slot {
                Some(view) => attachments.push(view),
                None => vrg_bail!("vrg::framebuffer", "Framebuffer '{}': attachment '{}' missing", name, attachment),
            }
        }

        let extent = attachments.iter().fold(Extent2D::default(), |extent, view| {
            let texture = view.texture().extent();
            Extent2D { width: extent.width.max(texture.width), height: extent.height.max(texture.height) }
        });

        let handle = context.driver().create_framebuffer(&FramebufferCreateInfo {
            render_pass: render_pass.handle(),
            attachments: attachments.iter().map(TextureView::handle).collect(),
            extent,
            layers: 1,
        })?;

        let base = ResourceBase::new(context.clone(), name);
        base.label(NamedObject::Framebuffer(handle));
        vrg_trace!("vrg::framebuffer", "Created framebuffer '{}' {}x{}", name, extent.width, extent.height);

        Ok(Arc::new(Framebuffer { base, handle, render_pass, attachments, extent }))
    }

    pub fn handle(&self) -> FramebufferHandle {
        self.handle
    }

    pub fn render_pass(&self) -> &Arc<RenderPass> {
        &self.render_pass
    }

    /// Attached views in render pass slot order
    pub fn attachments(&self) -> &[TextureView] {
        &self.attachments
    }

    pub fn extent(&self) -> Extent2D {
        self.extent
    }
}

impl DeviceResource for Framebuffer {
    fn base(&self) -> &ResourceBase {
        &self.base
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        self.base.driver().destroy_framebuffer(self.handle);
    }
}

#[cfg(test)]
#[path = "framebuffer_tests.rs"]
mod tests;
