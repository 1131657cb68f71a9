//! Unit tests for framebuffer.rs

use std::sync::Arc;

use crate::device::Device;
use crate::driver::mock::mock_device;
use crate::error::Error;
use crate::framebuffer::Framebuffer;
use crate::render_pass::{AttachmentDescription, AttachmentRole, RenderPass, SubpassDescription};
use crate::texture::{Texture, TextureView};
use crate::types::*;

fn depth() -> AttachmentDescription {
    AttachmentDescription { format: Format::D32_SFLOAT, ..Default::default() }
}

fn forward_pass(device: &Device) -> Arc<RenderPass> {
    RenderPass::new(
        device.context(),
        "forward",
        vec![SubpassDescription::new("main")
            .with_attachment("color", AttachmentDescription::default(), AttachmentRole::Color)
            .with_attachment("depth", depth(), AttachmentRole::DepthStencil)],
    )
    .unwrap()
}

fn attachment_view(device: &Device, name: &str, extent: Extent2D, description: &AttachmentDescription) -> TextureView {
    Texture::for_attachment(device.context(), name, extent, description, ImageUsageFlags::empty())
        .unwrap()
        .default_view()
        .unwrap()
}

#[test]
fn test_views_are_ordered_by_attachment_slot() {
    let (device, driver) = mock_device();
    let pass = forward_pass(&device);
    let extent = Extent2D { width: 320, height: 240 };
    let color = attachment_view(&device, "color", extent, &AttachmentDescription::default());
    let depth = attachment_view(&device, "depth", extent, &depth());

    let framebuffer =
        Framebuffer::new(device.context(), "fb", pass.clone(), &[("depth", depth.clone()), ("color", color.clone())])
            .unwrap();

    assert_eq!(framebuffer.attachments(), &[color, depth]);
    assert_eq!(framebuffer.extent(), extent);
    assert!(Arc::ptr_eq(framebuffer.render_pass(), &pass));
    assert_eq!(driver.count("create_framebuffer(2)"), 1);
}

#[test]
fn test_extent_is_max_of_attachments() {
    let (device, _driver) = mock_device();
    let pass = forward_pass(&device);
    let color = attachment_view(&device, "color", Extent2D { width: 640, height: 100 }, &AttachmentDescription::default());
    let depth = attachment_view(&device, "depth", Extent2D { width: 200, height: 480 }, &depth());

    let framebuffer = Framebuffer::new(device.context(), "fb", pass, &[("color", color), ("depth", depth)]).unwrap();
    assert_eq!(framebuffer.extent(), Extent2D { width: 640, height: 480 });
}

#[test]
fn test_missing_unknown_and_duplicate_attachments() {
    let (device, driver) = mock_device();
    let pass = forward_pass(&device);
    let extent = Extent2D { width: 64, height: 64 };
    let color = attachment_view(&device, "color", extent, &AttachmentDescription::default());
    let depth = attachment_view(&device, "depth", extent, &depth());

    let missing = Framebuffer::new(device.context(), "fb", pass.clone(), &[("color", color.clone())]);
    assert!(matches!(missing, Err(Error::InvalidUsage(_))));

    let unknown = Framebuffer::new(
        device.context(),
        "fb",
        pass.clone(),
        &[("color", color.clone()), ("depth", depth.clone()), ("normals", color.clone())],
    );
    assert!(matches!(unknown, Err(Error::InvalidUsage(_))));

    let duplicate = Framebuffer::new(
        device.context(),
        "fb",
        pass,
        &[("color", color.clone()), ("color", color), ("depth", depth)],
    );
    assert!(matches!(duplicate, Err(Error::InvalidUsage(_))));

    assert_eq!(driver.count("create_framebuffer"), 0);
}

#[test]
fn test_format_mismatch_is_rejected() {
    let (device, _driver) = mock_device();
    let pass = forward_pass(&device);
    let extent = Extent2D { width: 64, height: 64 };
    let color = attachment_view(&device, "color", extent, &AttachmentDescription::default());

    let result = Framebuffer::new(device.context(), "fb", pass, &[("color", color.clone()), ("depth", color)]);
    assert!(matches!(result, Err(Error::InvalidUsage(_))));
}

#[test]
fn test_framebuffer_keeps_pass_and_textures_alive() {
    let (device, driver) = mock_device();
    let pass = forward_pass(&device);
    let extent = Extent2D { width: 16, height: 16 };
    let color = attachment_view(&device, "color", extent, &AttachmentDescription::default());
    let depth = attachment_view(&device, "depth", extent, &depth());

    let framebuffer = Framebuffer::new(device.context(), "fb", pass.clone(), &[("color", color), ("depth", depth)])
        .unwrap();
    drop(pass);
    assert_eq!(driver.count("destroy_render_pass"), 0);
    assert_eq!(driver.count("destroy_image"), 0);

    drop(framebuffer);
    assert_eq!(driver.count("destroy_framebuffer"), 1);
    assert_eq!(driver.count("destroy_render_pass"), 1);
    assert_eq!(driver.count("destroy_image"), 2);
}
