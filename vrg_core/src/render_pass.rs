//! Declarative render passes with synthesized subpass dependencies
//!
//! A render pass is described as an ordered list of subpasses, each naming
//! the attachments it touches and the role it uses them in. From that alone
//! the pass derives its attachment table, the per-subpass reference lists and
//! every inter-subpass dependency; callers never write a dependency by hand.
//!
//! # Synthesis
//!
//! 1. Attachments are deduplicated by name in declaration order. The first
//!    subpass using a name defines the slot (format, initial layout, load
//!    ops); later subpasses only update its final layout and store ops.
//! 2. Each use becomes an attachment reference in the layout of its role.
//! 3. For each use in subpass `i`, the nearest earlier subpass `j` that used
//!    the same attachment as Color, DepthStencil or Resolve produces a
//!    by-region dependency `j -> i`. The producer must store its results.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::device::DeviceContext;
use crate::driver::{NamedObject, RenderPassHandle};
use crate::error::{Error, Result};
use crate::resource::{DeviceResource, ResourceBase};
use crate::types::*;
use crate::{vrg_bail, vrg_debug, vrg_error};

/// Native description of one attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentDescription {
    pub format: Format,
    pub samples: SampleCount,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub stencil_load_op: LoadOp,
    pub stencil_store_op: StoreOp,
    pub initial_layout: ImageLayout,
    pub final_layout: ImageLayout,
}

impl Default for AttachmentDescription {
    fn default() -> Self {
        Self {
            format: Format::R8G8B8A8_UNORM,
            samples: SampleCount::S1,
            load_op: LoadOp::Clear,
            store_op: StoreOp::Store,
            stencil_load_op: LoadOp::DontCare,
            stencil_store_op: StoreOp::DontCare,
            initial_layout: ImageLayout::Undefined,
            final_layout: ImageLayout::ShaderReadOnlyOptimal,
        }
    }
}

/// How a subpass uses an attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentRole {
    Input,
    Color,
    Resolve,
    DepthStencil,
    Preserve,
}

impl AttachmentRole {
    /// Roles that write the attachment and can therefore feed later subpasses
    pub fn is_producer(self) -> bool {
        matches!(self, AttachmentRole::Color | AttachmentRole::DepthStencil | AttachmentRole::Resolve)
    }

    /// Layout of the attachment while the subpass runs (`None` for Preserve)
    pub fn layout(self) -> Option<ImageLayout> {
        match self {
            AttachmentRole::Color | AttachmentRole::Resolve => Some(ImageLayout::ColorAttachmentOptimal),
            AttachmentRole::DepthStencil => Some(ImageLayout::DepthStencilAttachmentOptimal),
            AttachmentRole::Input => Some(ImageLayout::ShaderReadOnlyOptimal),
            AttachmentRole::Preserve => None,
        }
    }

    /// Access/stage of the write a producer makes visible
    fn source_masks(self) -> (AccessFlags, PipelineStageFlags) {
        match self {
            AttachmentRole::DepthStencil => {
                (AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE, PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            }
            AttachmentRole::Resolve => (AccessFlags::TRANSFER_WRITE, PipelineStageFlags::TRANSFER),
            _ => (AccessFlags::COLOR_ATTACHMENT_WRITE, PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT),
        }
    }

    /// Access/stage at which a consumer first touches the attachment
    fn destination_masks(self) -> (AccessFlags, PipelineStageFlags) {
        match self {
            AttachmentRole::Color => {
                (AccessFlags::COLOR_ATTACHMENT_WRITE, PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            }
            AttachmentRole::DepthStencil => {
                (AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE, PipelineStageFlags::EARLY_FRAGMENT_TESTS)
            }
            AttachmentRole::Resolve => {
                (AccessFlags::TRANSFER_WRITE, PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            }
            AttachmentRole::Input => (AccessFlags::SHADER_READ, PipelineStageFlags::FRAGMENT_SHADER),
            AttachmentRole::Preserve => (AccessFlags::SHADER_READ, PipelineStageFlags::TOP_OF_PIPE),
        }
    }
}

/// One attachment use inside a subpass
#[derive(Debug, Clone, PartialEq)]
pub struct SubpassAttachment {
    pub name: String,
    pub description: AttachmentDescription,
    pub role: AttachmentRole,
    /// Only read for Color attachments
    pub blend: ColorBlendAttachmentState,
}

/// Declarative subpass
#[derive(Debug, Clone, PartialEq)]
pub struct SubpassDescription {
    pub name: String,
    pub bind_point: PipelineBindPoint,
    pub attachments: Vec<SubpassAttachment>,
}

impl SubpassDescription {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), bind_point: PipelineBindPoint::Graphics, attachments: Vec::new() }
    }

    /// Add an attachment with opaque blending
    pub fn with_attachment(self, name: &str, description: AttachmentDescription, role: AttachmentRole) -> Self {
        self.with_blended_attachment(name, description, role, ColorBlendAttachmentState::default())
    }

    pub fn with_blended_attachment(
        mut self,
        name: &str,
        description: AttachmentDescription,
        role: AttachmentRole,
        blend: ColorBlendAttachmentState,
    ) -> Self {
        self.attachments.push(SubpassAttachment { name: name.to_string(), description, role, blend });
        self
    }

    pub fn attachment(&self, name: &str) -> Option<&SubpassAttachment> {
        self.attachments.iter().find(|a| a.name == name)
    }

    /// Color attachments in declaration order
    pub fn color_attachments(&self) -> impl Iterator<Item = &SubpassAttachment> {
        self.attachments.iter().filter(|a| a.role == AttachmentRole::Color)
    }
}

// ===== SYNTHESIZED LAYOUT =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentReference {
    pub attachment: u32,
    pub layout: ImageLayout,
}

/// Attachment references of one subpass, grouped by role
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubpassLayout {
    pub bind_point: PipelineBindPoint,
    pub input: Vec<AttachmentReference>,
    pub color: Vec<AttachmentReference>,
    pub resolve: Vec<AttachmentReference>,
    pub depth_stencil: Option<AttachmentReference>,
    pub preserve: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubpassDependency {
    pub src_subpass: u32,
    pub dst_subpass: u32,
    pub src_stage_mask: PipelineStageFlags,
    pub dst_stage_mask: PipelineStageFlags,
    pub src_access_mask: AccessFlags,
    pub dst_access_mask: AccessFlags,
    pub dependency_flags: DependencyFlags,
}

/// Everything needed to create the native render pass
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RenderPassLayout {
    /// Deduplicated attachment table, in first-use order
    pub attachments: Vec<(String, AttachmentDescription)>,
    pub subpasses: Vec<SubpassLayout>,
    pub dependencies: Vec<SubpassDependency>,
}

fn stores_result(description: &AttachmentDescription) -> bool {
    let aspect = description.format.aspect_flags();
    if aspect == ImageAspectFlags::STENCIL {
        description.stencil_store_op == StoreOp::Store
    } else {
        description.store_op == StoreOp::Store
    }
}

/// Derive attachment table, references and dependencies from subpass declarations
///
/// # Errors
///
/// - `InvalidUsage` for an empty pass, a name used twice in one subpass,
///   several depth/stencil attachments in one subpass, or resolve attachments
///   that do not pair up with the color attachments.
/// - `DependencyViolation` when a producer feeding a later subpass does not
///   store its results, or when a reused attachment changes format.
pub fn synthesize(subpasses: &[SubpassDescription]) -> Result<RenderPassLayout> {
    if subpasses.is_empty() {
        vrg_bail!("vrg::render_pass", "A render pass needs at least one subpass");
    }

    let mut layout = RenderPassLayout::default();
    let mut slots: FxHashMap<&str, usize> = FxHashMap::default();

    // Attachment table and references.
    for subpass in subpasses {
        let mut refs = SubpassLayout { bind_point: subpass.bind_point, ..Default::default() };

        for (k, attachment) in subpass.attachments.iter().enumerate() {
            if subpass.attachments[..k].iter().any(|other| other.name == attachment.name) {
                vrg_bail!(
                    "vrg::render_pass",
                    "Attachment '{}' used twice in subpass '{}'",
                    attachment.name,
                    subpass.name
                );
            }

            let index = match slots.get(attachment.name.as_str()) {
                Some(&index) => {
                    let slot = &mut layout.attachments[index].1;
                    if slot.format != attachment.description.format {
                        vrg_error!(
                            "vrg::render_pass",
                            "Attachment '{}' changes format from {:?} to {:?}",
                            attachment.name,
                            slot.format,
                            attachment.description.format
                        );
                        return Err(Error::DependencyViolation {
                            attachment: attachment.name.clone(),
                            reason: format!(
                                "format changes from {:?} to {:?} in subpass '{}'",
                                slot.format, attachment.description.format, subpass.name
                            ),
                        });
                    }
                    slot.final_layout = attachment.description.final_layout;
                    slot.store_op = attachment.description.store_op;
                    slot.stencil_store_op = attachment.description.stencil_store_op;
                    index
                }
                None => {
                    layout.attachments.push((attachment.name.clone(), attachment.description));
                    slots.insert(attachment.name.as_str(), layout.attachments.len() - 1);
                    layout.attachments.len() - 1
                }
            };

            let reference = |layout: ImageLayout| AttachmentReference { attachment: index as u32, layout };
            match attachment.role {
                AttachmentRole::Color => refs.color.push(reference(ImageLayout::ColorAttachmentOptimal)),
                AttachmentRole::Resolve => refs.resolve.push(reference(ImageLayout::ColorAttachmentOptimal)),
                AttachmentRole::Input => refs.input.push(reference(ImageLayout::ShaderReadOnlyOptimal)),
                AttachmentRole::Preserve => refs.preserve.push(index as u32),
                AttachmentRole::DepthStencil => {
                    if refs.depth_stencil.is_some() {
                        vrg_bail!(
                            "vrg::render_pass",
                            "Subpass '{}' declares more than one depth/stencil attachment",
                            subpass.name
                        );
                    }
                    refs.depth_stencil = Some(reference(ImageLayout::DepthStencilAttachmentOptimal));
                }
            }
        }

        if !refs.resolve.is_empty() && refs.resolve.len() != refs.color.len() {
            vrg_bail!(
                "vrg::render_pass",
                "Subpass '{}' has {} resolve attachments for {} color attachments",
                subpass.name,
                refs.resolve.len(),
                refs.color.len()
            );
        }
        layout.subpasses.push(refs);
    }

    // Dependencies.
    for (i, consumer_pass) in subpasses.iter().enumerate() {
        for consumer in &consumer_pass.attachments {
            let producer = subpasses[..i].iter().enumerate().rev().find_map(|(j, pass)| {
                pass.attachment(&consumer.name)
                    .filter(|a| a.role.is_producer())
                    .map(|a| (j, pass, a))
            });
            let Some((j, producer_pass, producer)) = producer else {
                continue;
            };

            if !stores_result(&producer.description) {
                vrg_error!(
                    "vrg::render_pass",
                    "{:?} attachment '{}' of subpass '{}' must use Store",
                    producer.role,
                    producer.name,
                    producer_pass.name
                );
                return Err(Error::DependencyViolation {
                    attachment: producer.name.clone(),
                    reason: format!(
                        "{:?} attachment written in subpass '{}' and read in subpass '{}' must use Store",
                        producer.role, producer_pass.name, consumer_pass.name
                    ),
                });
            }

            let (src_access_mask, src_stage_mask) = producer.role.source_masks();
            let (dst_access_mask, mut dst_stage_mask) = consumer.role.destination_masks();
            if producer.role == AttachmentRole::DepthStencil && consumer.role == AttachmentRole::Input {
                dst_stage_mask = PipelineStageFlags::EARLY_FRAGMENT_TESTS;
            }

            layout.dependencies.push(SubpassDependency {
                src_subpass: j as u32,
                dst_subpass: i as u32,
                src_stage_mask,
                dst_stage_mask,
                src_access_mask,
                dst_access_mask,
                dependency_flags: DependencyFlags::BY_REGION,
            });
        }
    }

    Ok(layout)
}

// ===== RENDER PASS =====

/// Native render pass built from subpass declarations
///
/// Long-lived; callers are expected to cache it across frames.
pub struct RenderPass {
    base: ResourceBase,
    handle: RenderPassHandle,
    subpasses: Vec<SubpassDescription>,
    layout: RenderPassLayout,
    attachment_map: FxHashMap<String, usize>,
}

impl RenderPass {
    pub fn new(
        context: &Arc<DeviceContext>,
        name: &str,
        subpasses: Vec<SubpassDescription>,
    ) -> Result<Arc<RenderPass>> {
        let layout = synthesize(&subpasses)?;
        let handle = context.driver().create_render_pass(&layout)?;

        let attachment_map = layout
            .attachments
            .iter()
            .enumerate()
            .map(|(index, (name, _))| (name.clone(), index))
            .collect();

        let base = ResourceBase::new(context.clone(), name);
        base.label(NamedObject::RenderPass(handle));
        vrg_debug!(
            "vrg::render_pass",
            "Created render pass '{}': {} subpasses, {} attachments, {} dependencies",
            name,
            subpasses.len(),
            layout.attachments.len(),
            layout.dependencies.len()
        );

        Ok(Arc::new(RenderPass { base, handle, subpasses, layout, attachment_map }))
    }

    pub fn handle(&self) -> RenderPassHandle {
        self.handle
    }

    pub fn subpass_count(&self) -> usize {
        self.subpasses.len()
    }

    pub fn subpass_descriptions(&self) -> &[SubpassDescription] {
        &self.subpasses
    }

    /// Deduplicated attachments with their merged descriptions
    pub fn attachment_descriptions(&self) -> &[(String, AttachmentDescription)] {
        &self.layout.attachments
    }

    pub fn dependencies(&self) -> &[SubpassDependency] {
        &self.layout.dependencies
    }

    pub fn layout(&self) -> &RenderPassLayout {
        &self.layout
    }

    /// Slot of a named attachment
    pub fn attachment_index(&self, name: &str) -> Result<usize> {
        self.attachment_map.get(name).copied().ok_or_else(|| {
            crate::vrg_err!("vrg::render_pass", "Render pass '{}' has no attachment '{}'", self.name(), name)
        })
    }
}

impl DeviceResource for RenderPass {
    fn base(&self) -> &ResourceBase {
        &self.base
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        self.base.driver().destroy_render_pass(self.handle);
    }
}

#[cfg(test)]
#[path = "render_pass_tests.rs"]
mod tests;
