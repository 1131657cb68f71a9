//! Unit tests for render_pass.rs

use crate::driver::mock::mock_device;
use crate::error::Error;
use crate::render_pass::*;
use crate::types::*;

fn color() -> AttachmentDescription {
    AttachmentDescription::default()
}

fn depth() -> AttachmentDescription {
    AttachmentDescription {
        format: Format::D32_SFLOAT,
        final_layout: ImageLayout::DepthStencilAttachmentOptimal,
        ..Default::default()
    }
}

fn gbuffer_then_lighting() -> Vec<SubpassDescription> {
    vec![
        SubpassDescription::new("gbuffer").with_attachment("albedo", color(), AttachmentRole::Color),
        SubpassDescription::new("lighting")
            .with_attachment("albedo", color(), AttachmentRole::Input)
            .with_attachment("output", color(), AttachmentRole::Color),
    ]
}

// ============================================================================
// Attachment table
// ============================================================================

#[test]
fn test_empty_pass_is_rejected() {
    assert!(matches!(synthesize(&[]), Err(Error::InvalidUsage(_))));
}

#[test]
fn test_single_subpass_has_no_dependencies() {
    let layout = synthesize(&[SubpassDescription::new("main")
        .with_attachment("color", color(), AttachmentRole::Color)
        .with_attachment("depth", depth(), AttachmentRole::DepthStencil)])
    .unwrap();

    assert_eq!(layout.attachments.len(), 2);
    assert!(layout.dependencies.is_empty());
    let subpass = &layout.subpasses[0];
    assert_eq!(
        subpass.color,
        vec![AttachmentReference { attachment: 0, layout: ImageLayout::ColorAttachmentOptimal }]
    );
    assert_eq!(
        subpass.depth_stencil,
        Some(AttachmentReference { attachment: 1, layout: ImageLayout::DepthStencilAttachmentOptimal })
    );
}

#[test]
fn test_attachments_are_deduplicated_in_first_use_order() {
    let mut subpasses = gbuffer_then_lighting();
    subpasses[1].attachments[0].description.final_layout = ImageLayout::TransferSrcOptimal;
    subpasses[1].attachments[0].description.load_op = LoadOp::Load;

    let layout = synthesize(&subpasses).unwrap();
    let names: Vec<&str> = layout.attachments.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["albedo", "output"]);

    let albedo = &layout.attachments[0].1;
    assert_eq!(albedo.final_layout, ImageLayout::TransferSrcOptimal);
    assert_eq!(albedo.load_op, LoadOp::Clear);

    assert_eq!(
        layout.subpasses[1].input,
        vec![AttachmentReference { attachment: 0, layout: ImageLayout::ShaderReadOnlyOptimal }]
    );
}

#[test]
fn test_duplicate_name_in_one_subpass_is_rejected() {
    let result = synthesize(&[SubpassDescription::new("main")
        .with_attachment("color", color(), AttachmentRole::Color)
        .with_attachment("color", color(), AttachmentRole::Input)]);
    assert!(matches!(result, Err(Error::InvalidUsage(_))));
}

#[test]
fn test_two_depth_attachments_are_rejected() {
    let result = synthesize(&[SubpassDescription::new("main")
        .with_attachment("d0", depth(), AttachmentRole::DepthStencil)
        .with_attachment("d1", depth(), AttachmentRole::DepthStencil)]);
    assert!(matches!(result, Err(Error::InvalidUsage(_))));
}

#[test]
fn test_resolve_count_must_match_color_count() {
    let msaa = AttachmentDescription { samples: SampleCount::S4, ..color() };
    let result = synthesize(&[SubpassDescription::new("main")
        .with_attachment("c0", msaa, AttachmentRole::Color)
        .with_attachment("c1", msaa, AttachmentRole::Color)
        .with_attachment("resolved", color(), AttachmentRole::Resolve)]);
    assert!(matches!(result, Err(Error::InvalidUsage(_))));

    let layout = synthesize(&[SubpassDescription::new("main")
        .with_attachment("c0", msaa, AttachmentRole::Color)
        .with_attachment("resolved", color(), AttachmentRole::Resolve)])
    .unwrap();
    assert_eq!(layout.subpasses[0].resolve.len(), 1);
}

#[test]
fn test_format_change_is_a_dependency_violation() {
    let mut subpasses = gbuffer_then_lighting();
    subpasses[1].attachments[0].description.format = Format::R16G16B16A16_SFLOAT;

    match synthesize(&subpasses) {
        Err(Error::DependencyViolation { attachment, .. }) => assert_eq!(attachment, "albedo"),
        other => panic!("expected DependencyViolation, got {:?}", other),
    }
}

// ============================================================================
// Dependencies
// ============================================================================

#[test]
fn test_color_to_input_dependency() {
    let layout = synthesize(&gbuffer_then_lighting()).unwrap();

    assert_eq!(
        layout.dependencies,
        vec![SubpassDependency {
            src_subpass: 0,
            dst_subpass: 1,
            src_stage_mask: PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage_mask: PipelineStageFlags::FRAGMENT_SHADER,
            src_access_mask: AccessFlags::COLOR_ATTACHMENT_WRITE,
            dst_access_mask: AccessFlags::SHADER_READ,
            dependency_flags: DependencyFlags::BY_REGION,
        }]
    );
}

#[test]
fn test_dont_care_producer_is_a_dependency_violation() {
    let mut subpasses = gbuffer_then_lighting();
    subpasses[0].attachments[0].description.store_op = StoreOp::DontCare;

    match synthesize(&subpasses) {
        Err(Error::DependencyViolation { attachment, .. }) => assert_eq!(attachment, "albedo"),
        other => panic!("expected DependencyViolation, got {:?}", other),
    }
}

#[test]
fn test_dont_care_without_consumer_is_fine() {
    let mut subpasses = gbuffer_then_lighting();
    subpasses[1].attachments[1].description.store_op = StoreOp::DontCare;
    assert!(synthesize(&subpasses).is_ok());
}

#[test]
fn test_depth_to_input_waits_at_early_fragment_tests() {
    let layout = synthesize(&[
        SubpassDescription::new("prepass").with_attachment("depth", depth(), AttachmentRole::DepthStencil),
        SubpassDescription::new("resolve_depth")
            .with_attachment("depth", depth(), AttachmentRole::Input)
            .with_attachment("color", color(), AttachmentRole::Color),
    ])
    .unwrap();

    assert_eq!(layout.dependencies.len(), 1);
    let dependency = layout.dependencies[0];
    assert_eq!(dependency.src_subpass, 0);
    assert_eq!(dependency.dst_subpass, 1);
    assert_eq!(dependency.src_stage_mask, PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
    assert_eq!(dependency.dst_stage_mask, PipelineStageFlags::EARLY_FRAGMENT_TESTS);
    assert_eq!(dependency.src_access_mask, AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE);
}

#[test]
fn test_stencil_only_producer_checks_stencil_store() {
    let stencil = AttachmentDescription {
        format: Format::S8_UINT,
        store_op: StoreOp::DontCare,
        stencil_store_op: StoreOp::Store,
        ..Default::default()
    };
    let subpasses = vec![
        SubpassDescription::new("mark").with_attachment("stencil", stencil, AttachmentRole::DepthStencil),
        SubpassDescription::new("test").with_attachment("stencil", stencil, AttachmentRole::DepthStencil),
    ];
    let layout = synthesize(&subpasses).unwrap();
    assert_eq!(layout.dependencies.len(), 1);
    assert_eq!(layout.dependencies[0].dst_stage_mask, PipelineStageFlags::EARLY_FRAGMENT_TESTS);
}

#[test]
fn test_nearest_producer_is_used() {
    let layout = synthesize(&[
        SubpassDescription::new("a").with_attachment("hdr", color(), AttachmentRole::Color),
        SubpassDescription::new("b").with_attachment("hdr", color(), AttachmentRole::Color),
        SubpassDescription::new("c").with_attachment("hdr", color(), AttachmentRole::Input),
    ])
    .unwrap();

    let edges: Vec<(u32, u32)> = layout.dependencies.iter().map(|d| (d.src_subpass, d.dst_subpass)).collect();
    assert_eq!(edges, vec![(0, 1), (1, 2)]);
    assert_eq!(layout.dependencies[0].dst_access_mask, AccessFlags::COLOR_ATTACHMENT_WRITE);
}

#[test]
fn test_input_only_history_produces_nothing() {
    let layout = synthesize(&[
        SubpassDescription::new("a").with_attachment("lut", color(), AttachmentRole::Input),
        SubpassDescription::new("b")
            .with_attachment("lut", color(), AttachmentRole::Input)
            .with_attachment("out", color(), AttachmentRole::Color),
    ])
    .unwrap();
    assert!(layout.dependencies.is_empty());
}

#[test]
fn test_preserve_reference_and_masks() {
    let layout = synthesize(&[
        SubpassDescription::new("a").with_attachment("keep", color(), AttachmentRole::Color),
        SubpassDescription::new("b")
            .with_attachment("keep", color(), AttachmentRole::Preserve)
            .with_attachment("out", color(), AttachmentRole::Color),
    ])
    .unwrap();

    assert_eq!(layout.subpasses[1].preserve, vec![0]);
    assert_eq!(layout.dependencies.len(), 1);
    assert_eq!(layout.dependencies[0].dst_stage_mask, PipelineStageFlags::TOP_OF_PIPE);
    assert_eq!(layout.dependencies[0].dst_access_mask, AccessFlags::SHADER_READ);
}

#[test]
fn test_resolve_producer_masks() {
    let msaa = AttachmentDescription { samples: SampleCount::S4, ..color() };
    let layout = synthesize(&[
        SubpassDescription::new("draw")
            .with_attachment("msaa", msaa, AttachmentRole::Color)
            .with_attachment("resolved", color(), AttachmentRole::Resolve),
        SubpassDescription::new("post")
            .with_attachment("resolved", color(), AttachmentRole::Input)
            .with_attachment("out", color(), AttachmentRole::Color),
    ])
    .unwrap();

    assert_eq!(layout.dependencies.len(), 1);
    assert_eq!(layout.dependencies[0].src_access_mask, AccessFlags::TRANSFER_WRITE);
    assert_eq!(layout.dependencies[0].src_stage_mask, PipelineStageFlags::TRANSFER);
}

// ============================================================================
// RenderPass
// ============================================================================

#[test]
fn test_render_pass_creation() {
    let (device, driver) = mock_device();
    let pass = RenderPass::new(device.context(), "deferred", gbuffer_then_lighting()).unwrap();

    assert_eq!(pass.subpass_count(), 2);
    assert_eq!(pass.attachment_index("output").unwrap(), 1);
    assert!(matches!(pass.attachment_index("missing"), Err(Error::InvalidUsage(_))));
    assert_eq!(pass.dependencies().len(), 1);
    assert_eq!(driver.render_passes(), vec![pass.layout().clone()]);

    drop(pass);
    assert_eq!(driver.count("destroy_render_pass"), 1);
}

#[test]
fn test_failed_synthesis_creates_no_native_pass() {
    let (device, driver) = mock_device();
    let mut subpasses = gbuffer_then_lighting();
    subpasses[0].attachments[0].description.store_op = StoreOp::DontCare;

    assert!(RenderPass::new(device.context(), "broken", subpasses).is_err());
    assert_eq!(driver.count("create_render_pass"), 0);
}
