//! Unit tests for types.rs

use crate::types::*;

// ============================================================================
// FORMAT TESTS
// ============================================================================

#[test]
fn test_depth_formats_have_depth_aspect() {
    assert_eq!(Format::D16_UNORM.aspect_flags(), ImageAspectFlags::DEPTH);
    assert_eq!(Format::D32_SFLOAT.aspect_flags(), ImageAspectFlags::DEPTH);
    assert_eq!(Format::X8_D24_UNORM_PACK32.aspect_flags(), ImageAspectFlags::DEPTH);
}

#[test]
fn test_combined_and_stencil_formats() {
    let both = ImageAspectFlags::DEPTH | ImageAspectFlags::STENCIL;
    assert_eq!(Format::D24_UNORM_S8_UINT.aspect_flags(), both);
    assert_eq!(Format::D32_SFLOAT_S8_UINT.aspect_flags(), both);
    assert_eq!(Format::D16_UNORM_S8_UINT.aspect_flags(), both);
    assert_eq!(Format::S8_UINT.aspect_flags(), ImageAspectFlags::STENCIL);
}

#[test]
fn test_color_formats() {
    assert_eq!(Format::R8G8B8A8_UNORM.aspect_flags(), ImageAspectFlags::COLOR);
    assert_eq!(Format::B8G8R8A8_SRGB.aspect_flags(), ImageAspectFlags::COLOR);
    assert!(!Format::R32_SFLOAT.is_depth_stencil());
    assert!(Format::D32_SFLOAT.is_depth_stencil());
}

// ============================================================================
// MISC TESTS
// ============================================================================

#[test]
fn test_index_type_from_stride() {
    assert_eq!(IndexType::from_stride(4), Some(IndexType::U32));
    assert_eq!(IndexType::from_stride(2), Some(IndexType::U16));
    assert_eq!(IndexType::from_stride(1), Some(IndexType::U8));
    assert_eq!(IndexType::from_stride(3), None);
    assert_eq!(IndexType::from_stride(8), None);
}

#[test]
fn test_descriptor_kinds() {
    assert_eq!(DescriptorType::UniformBuffer.kind(), DescriptorKind::Buffer);
    assert_eq!(DescriptorType::StorageBufferDynamic.kind(), DescriptorKind::Buffer);
    assert_eq!(DescriptorType::CombinedImageSampler.kind(), DescriptorKind::Image);
    assert_eq!(DescriptorType::UniformTexelBuffer.kind(), DescriptorKind::TexelBuffer);
    assert_eq!(
        DescriptorType::AccelerationStructure.kind(),
        DescriptorKind::AccelerationStructure
    );
}

#[test]
fn test_extent_max() {
    let a = Extent3D::new(800, 100, 1);
    let b = Extent3D::new(400, 600, 1);
    assert_eq!(a.max(b), Extent3D::new(800, 600, 1));
}

#[test]
fn test_memory_location_visibility() {
    assert!(!MemoryLocation::GpuOnly.is_host_visible());
    assert!(MemoryLocation::CpuToGpu.is_host_visible());
    assert!(MemoryLocation::GpuToCpu.is_host_visible());
}

#[test]
fn test_default_blend_state_is_opaque() {
    let blend = ColorBlendAttachmentState::default();
    assert!(!blend.blend_enable);
    assert_eq!(blend.color_write_mask, ColorComponentFlags::all());
}
