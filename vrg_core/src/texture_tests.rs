//! Unit tests for texture.rs

use std::sync::Arc;

use crate::command_buffer::CommandBuffer;
use crate::device::Device;
use crate::driver::mock::mock_device;
use crate::driver::ImageHandle;
use crate::error::Error;
use crate::texture::*;
use crate::types::*;

fn texture(device: &Device, desc: &TextureDesc) -> Arc<Texture> {
    Texture::new(device.context(), "tex", desc).unwrap()
}

fn command_buffer(device: &Device) -> CommandBuffer {
    device.get_command_buffer("cmd", QueueFlags::GRAPHICS, CommandBufferLevel::Primary).unwrap()
}

// ============================================================================
// Layout table
// ============================================================================

#[test]
fn test_layout_table_samples() {
    assert_eq!(guess_stage(ImageLayout::Undefined), PipelineStageFlags::TOP_OF_PIPE);
    assert_eq!(guess_access(ImageLayout::Undefined), AccessFlags::empty());
    assert_eq!(guess_stage(ImageLayout::ColorAttachmentOptimal), PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
    assert_eq!(
        guess_access(ImageLayout::ColorAttachmentOptimal),
        AccessFlags::COLOR_ATTACHMENT_READ | AccessFlags::COLOR_ATTACHMENT_WRITE
    );
    assert_eq!(guess_stage(ImageLayout::TransferDstOptimal), PipelineStageFlags::TRANSFER);
    assert_eq!(guess_access(ImageLayout::TransferDstOptimal), AccessFlags::TRANSFER_WRITE);
    assert_eq!(guess_access(ImageLayout::ShaderReadOnlyOptimal), AccessFlags::SHADER_READ);
    assert_eq!(guess_stage(ImageLayout::PresentSrc), PipelineStageFlags::BOTTOM_OF_PIPE);
}

#[test]
fn test_max_mips() {
    assert_eq!(max_mips(Extent3D::new(1, 1, 1)), 1);
    assert_eq!(max_mips(Extent3D::new(256, 128, 1)), 9);
    assert_eq!(max_mips(Extent3D::new(100, 3, 1)), 7);
}

// ============================================================================
// Creation
// ============================================================================

#[test]
fn test_full_mip_chain_by_default() {
    let (device, driver) = mock_device();
    let tex = texture(&device, &TextureDesc { extent: Extent3D::new(64, 64, 1), ..Default::default() });
    assert_eq!(tex.mip_levels(), 7);
    assert_eq!(tex.aspect(), ImageAspectFlags::COLOR);
    assert_eq!(tex.tracked_state(), TrackedState::default());
    assert_eq!(driver.count("create_image"), 1);
    assert_eq!(driver.count("bind_image_memory"), 1);
}

#[test]
fn test_multisampled_defaults_to_single_mip() {
    let (device, _driver) = mock_device();
    let tex = texture(
        &device,
        &TextureDesc { extent: Extent3D::new(64, 64, 1), samples: SampleCount::S4, ..Default::default() },
    );
    assert_eq!(tex.mip_levels(), 1);
}

#[test]
fn test_invalid_extent_and_mips_are_rejected() {
    let (device, _driver) = mock_device();
    let empty = Texture::new(
        device.context(),
        "empty",
        &TextureDesc { extent: Extent3D::new(0, 4, 1), ..Default::default() },
    );
    assert!(matches!(empty, Err(Error::InvalidUsage(_))));

    let too_many = Texture::new(
        device.context(),
        "mips",
        &TextureDesc { extent: Extent3D::new(4, 4, 1), mip_levels: Some(4), ..Default::default() },
    );
    assert!(matches!(too_many, Err(Error::InvalidUsage(_))));
}

#[test]
fn test_drop_releases_views_image_and_memory() {
    let (device, driver) = mock_device();
    let tex = texture(&device, &TextureDesc { extent: Extent3D::new(8, 8, 1), ..Default::default() });
    let view = tex.default_view().unwrap();
    drop(tex);
    assert_eq!(driver.count("destroy_image"), 0);

    drop(view);
    assert_eq!(driver.count("destroy_image_view"), 1);
    assert_eq!(driver.count("destroy_image"), 1);
    assert_eq!(device.memory().live_allocations(), 0);
}

#[test]
fn test_from_raw_does_not_destroy_foreign_image() {
    let (device, driver) = mock_device();
    let tex = Texture::from_raw(device.context(), "swapchain0", ImageHandle(77), &TextureDesc::default());
    assert_eq!(tex.handle(), ImageHandle(77));
    drop(tex);
    assert_eq!(driver.count("destroy_image"), 0);
}

// ============================================================================
// Hazard tracking
// ============================================================================

#[test]
fn test_same_layout_transition_records_nothing() {
    let (device, driver) = mock_device();
    let tex = texture(&device, &TextureDesc::default());
    let mut cmd = command_buffer(&device);

    for layout in ImageLayout::ALL {
        tex.set_tracked_state(TrackedState::for_layout(layout));
        tex.transition_barrier(&mut cmd, layout).unwrap();
        tex.transition_barrier_from(&mut cmd, layout, layout).unwrap();
    }

    assert!(driver.barriers().is_empty());
    assert_eq!(driver.count("cmd_pipeline_barrier"), 0);
}

#[test]
fn test_transition_chain_uses_tracked_source() {
    let (device, driver) = mock_device();
    let tex = texture(&device, &TextureDesc::default());
    let mut cmd = command_buffer(&device);

    tex.transition_barrier(&mut cmd, ImageLayout::TransferDstOptimal).unwrap();
    tex.transition_barrier(&mut cmd, ImageLayout::ShaderReadOnlyOptimal).unwrap();

    let barriers = driver.barriers();
    assert_eq!(barriers.len(), 2);

    let (src, dst, upload) = barriers[0];
    assert_eq!(src, PipelineStageFlags::TOP_OF_PIPE);
    assert_eq!(dst, PipelineStageFlags::TRANSFER);
    assert_eq!(upload.old_layout, ImageLayout::Undefined);
    assert_eq!(upload.new_layout, ImageLayout::TransferDstOptimal);
    assert_eq!(upload.src_access, AccessFlags::empty());
    assert_eq!(upload.dst_access, AccessFlags::TRANSFER_WRITE);
    assert_eq!(upload.range, tex.full_range());

    let (src, dst, sample) = barriers[1];
    assert_eq!(src, PipelineStageFlags::TRANSFER);
    assert_eq!(dst, PipelineStageFlags::FRAGMENT_SHADER);
    assert_eq!(sample.src_access, AccessFlags::TRANSFER_WRITE);
    assert_eq!(sample.dst_access, AccessFlags::SHADER_READ);

    assert_eq!(tex.tracked_state(), TrackedState::for_layout(ImageLayout::ShaderReadOnlyOptimal));
}

#[test]
fn test_transition_holds_texture_in_command_buffer() {
    let (device, _driver) = mock_device();
    let tex = texture(&device, &TextureDesc::default());
    let mut cmd = command_buffer(&device);

    tex.transition_barrier(&mut cmd, ImageLayout::General).unwrap();
    tex.transition_barrier(&mut cmd, ImageLayout::TransferSrcOptimal).unwrap();
    assert_eq!(cmd.held_resource_count(), 1);
    assert_eq!(Arc::strong_count(&tex), 2);

    cmd.clear();
    assert_eq!(Arc::strong_count(&tex), 1);
}

#[test]
fn test_transition_to_undefined_discards_state() {
    let (device, driver) = mock_device();
    let tex = texture(&device, &TextureDesc::default());
    let mut cmd = command_buffer(&device);

    tex.transition_barrier(&mut cmd, ImageLayout::ColorAttachmentOptimal).unwrap();
    tex.transition_barrier(&mut cmd, ImageLayout::Undefined).unwrap();

    assert_eq!(driver.barriers().len(), 1);
    assert_eq!(tex.tracked_state(), TrackedState::default());
}

#[test]
fn test_explicit_source_layout_overrides_tracker_layout() {
    let (device, driver) = mock_device();
    let tex = texture(&device, &TextureDesc::default());
    let mut cmd = command_buffer(&device);

    tex.transition_barrier_from(&mut cmd, ImageLayout::PresentSrc, ImageLayout::ColorAttachmentOptimal)
        .unwrap();

    let (_, _, barrier) = driver.barriers()[0];
    assert_eq!(barrier.old_layout, ImageLayout::PresentSrc);
    assert_eq!(barrier.new_layout, ImageLayout::ColorAttachmentOptimal);
}

// ============================================================================
// Views
// ============================================================================

#[test]
fn test_views_are_cached_per_subrange() {
    let (device, driver) = mock_device();
    let tex = texture(&device, &TextureDesc { extent: Extent3D::new(16, 16, 1), ..Default::default() });

    let a = tex.default_view().unwrap();
    let b = tex.default_view().unwrap();
    assert_eq!(a, b);
    assert_eq!(tex.cached_view_count(), 1);

    let mip1 = tex.view(&TextureViewDesc { base_mip: 1, mip_count: 1, ..Default::default() }).unwrap();
    assert_ne!(a, mip1);
    assert_eq!(mip1.range().level_count, 1);
    assert_eq!(a.range().level_count, 5);
    assert_eq!(tex.cached_view_count(), 2);
    assert_eq!(driver.count("create_image_view"), 2);
}

#[test]
fn test_view_type_follows_layers() {
    let (device, driver) = mock_device();
    let cube = texture(
        &device,
        &TextureDesc {
            extent: Extent3D::new(4, 4, 1),
            array_layers: 12,
            cube_compatible: true,
            ..Default::default()
        },
    );

    cube.view(&TextureViewDesc { layer_count: 6, ..Default::default() }).unwrap();
    cube.default_view().unwrap();
    cube.view(&TextureViewDesc { layer_count: 1, ..Default::default() }).unwrap();

    let commands = driver.commands();
    assert!(commands.contains(&"create_image_view(Cube)".to_string()));
    assert!(commands.contains(&"create_image_view(CubeArray)".to_string()));
    assert!(commands.contains(&"create_image_view(D2)".to_string()));
}

#[test]
fn test_view_range_and_aspect_are_validated() {
    let (device, _driver) = mock_device();
    let depth = texture(
        &device,
        &TextureDesc { format: Format::D32_SFLOAT, extent: Extent3D::new(4, 4, 1), ..Default::default() },
    );

    assert!(depth.view(&TextureViewDesc { base_mip: 3, ..Default::default() }).is_err());
    assert!(depth.view(&TextureViewDesc { base_layer: 0, layer_count: 2, ..Default::default() }).is_err());
    assert!(depth.view(&TextureViewDesc { aspect: ImageAspectFlags::COLOR, ..Default::default() }).is_err());
    assert_eq!(depth.default_view().unwrap().range().aspect, ImageAspectFlags::DEPTH);
}
