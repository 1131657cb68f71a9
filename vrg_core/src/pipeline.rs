//! Shader modules, pipeline layouts and pipelines
//!
//! Shader reflection is supplied by the caller as a [`ShaderReflection`] per
//! module. A pipeline merges the tables of all of its stages into one
//! descriptor binding table and one push constant table, derives a
//! descriptor set layout per set index from them and builds the native
//! pipeline layout.
//!
//! # Binding merge
//!
//! - same name, set and binding: stage visibility is OR'ed, the larger count
//!   wins; a different descriptor type is an error
//! - same name at another set/binding: kept as a distinct binding under the
//!   key `"{set}.{binding}{name}"`
//! - two names at the same set/binding must agree on the descriptor type

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::descriptor_set::{DescriptorBinding, DescriptorSetLayout};
use crate::device::DeviceContext;
use crate::driver::{
    ComputePipelineCreateInfo, NamedObject, PipelineHandle, PipelineLayoutCreateInfo, PipelineLayoutHandle,
    RenderPassHandle, ShaderModuleHandle,
};
use crate::error::Result;
use crate::render_pass::{AttachmentRole, RenderPass};
use crate::resource::{DeviceResource, ResourceBase};
use crate::types::*;
use crate::{vrg_bail, vrg_debug, vrg_err, vrg_trace};

// ===== REFLECTION =====

/// Semantic class of a vertex attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VertexAttributeType {
    Position,
    Normal,
    Color,
    TexCoord,
    SystemValue,
}

/// Semantic plus index, e.g. `TexCoord 1`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexAttributeId {
    pub attribute_type: VertexAttributeType,
    pub index: u32,
}

impl VertexAttributeId {
    pub fn new(attribute_type: VertexAttributeType, index: u32) -> Self {
        Self { attribute_type, index }
    }
}

/// Input or output variable of a rasterization stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageVariable {
    pub location: u32,
    pub format: Format,
    pub attribute: VertexAttributeId,
}

/// Resource binding declared by a shader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReflectedBinding {
    pub set: u32,
    pub binding: u32,
    pub descriptor_type: DescriptorType,
    pub count: u32,
    pub stages: ShaderStageFlags,
}

/// Byte range of a push constant block, or a native push constant range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PushConstantRange {
    pub offset: u32,
    pub size: u32,
    pub stages: ShaderStageFlags,
}

/// Reflection tables of one shader stage, keyed by variable name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShaderReflection {
    pub stage_inputs: BTreeMap<String, StageVariable>,
    pub bindings: BTreeMap<String, ReflectedBinding>,
    pub push_constants: BTreeMap<String, PushConstantRange>,
}

// ===== SHADER MODULE =====

/// Compiled SPIR-V for one stage plus its reflection
pub struct ShaderModule {
    base: ResourceBase,
    handle: ShaderModuleHandle,
    stage: ShaderStageFlags,
    entry_point: String,
    reflection: ShaderReflection,
}

impl ShaderModule {
    /// # Errors
    ///
    /// `InvalidUsage` when `stage` is not exactly one stage, `CreationFailure`
    /// when the driver rejects the code.
    pub fn new(
        context: &Arc<DeviceContext>,
        name: &str,
        stage: ShaderStageFlags,
        spirv: &[u32],
        entry_point: &str,
        reflection: ShaderReflection,
    ) -> Result<Arc<ShaderModule>> {
        if stage.bits().count_ones() != 1 {
            vrg_bail!("vrg::pipeline", "Shader '{}' must target exactly one stage, got {:?}", name, stage);
        }
        let handle = context.driver().create_shader_module(spirv)?;
        let base = ResourceBase::new(context.clone(), name);
        base.label(NamedObject::ShaderModule(handle));
        vrg_trace!("vrg::pipeline", "Created shader module '{}' ({:?})", name, stage);
        Ok(Arc::new(ShaderModule { base, handle, stage, entry_point: entry_point.to_string(), reflection }))
    }

    pub fn handle(&self) -> ShaderModuleHandle {
        self.handle
    }

    pub fn stage(&self) -> ShaderStageFlags {
        self.stage
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn reflection(&self) -> &ShaderReflection {
        &self.reflection
    }
}

impl DeviceResource for ShaderModule {
    fn base(&self) -> &ResourceBase {
        &self.base
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        self.base.driver().destroy_shader_module(self.handle);
    }
}

// ===== MERGE =====

/// Merge the descriptor bindings of several stages
pub fn merge_bindings(stages: &[(ShaderStageFlags, &ShaderReflection)]) -> Result<BTreeMap<String, ReflectedBinding>> {
    let mut merged: BTreeMap<String, ReflectedBinding> = BTreeMap::new();
    for (stage, reflection) in stages {
        for (name, binding) in &reflection.bindings {
            let binding = ReflectedBinding { stages: binding.stages | *stage, ..*binding };
            let key = match merged.get(name) {
                Some(existing) if existing.set != binding.set || existing.binding != binding.binding => {
                    format!("{}.{}{}", binding.set, binding.binding, name)
                }
                _ => name.clone(),
            };
            match merged.get_mut(&key) {
                Some(existing) => {
                    if existing.descriptor_type != binding.descriptor_type {
                        vrg_bail!(
                            "vrg::pipeline",
                            "Binding '{}' declared as {:?} and {:?}",
                            name,
                            existing.descriptor_type,
                            binding.descriptor_type
                        );
                    }
                    existing.stages |= binding.stages;
                    existing.count = existing.count.max(binding.count);
                }
                None => {
                    merged.insert(key, binding);
                }
            }
        }
    }
    Ok(merged)
}

/// Merge push constant blocks by name
///
/// A block shared by several stages must have the same offset and size in
/// each; its stage visibility is OR'ed.
pub fn merge_push_constants(
    stages: &[(ShaderStageFlags, &ShaderReflection)],
) -> Result<BTreeMap<String, PushConstantRange>> {
    let mut merged: BTreeMap<String, PushConstantRange> = BTreeMap::new();
    for (stage, reflection) in stages {
        for (name, range) in &reflection.push_constants {
            match merged.get_mut(name) {
                Some(existing) => {
                    if existing.offset != range.offset || existing.size != range.size {
                        vrg_bail!(
                            "vrg::pipeline",
                            "Push constant '{}' declared at [{}, +{}) and [{}, +{})",
                            name,
                            existing.offset,
                            existing.size,
                            range.offset,
                            range.size
                        );
                    }
                    existing.stages |= range.stages | *stage;
                }
                None => {
                    merged.insert(name.clone(), PushConstantRange { stages: range.stages | *stage, ..*range });
                }
            }
        }
    }
    Ok(merged)
}

/// One native range per stage, covering every block visible to that stage
pub fn push_constant_ranges(
    stages: &[(ShaderStageFlags, &ShaderReflection)],
    merged: &BTreeMap<String, PushConstantRange>,
) -> Vec<PushConstantRange> {
    let mut ranges = Vec::new();
    for (stage, _) in stages {
        let visible = merged.values().filter(|range| range.stages.contains(*stage));
        let bounds = visible.fold(None, |bounds: Option<(u32, u32)>, range| {
            let end = range.offset + range.size;
            Some(bounds.map_or((range.offset, end), |(first, last)| (first.min(range.offset), last.max(end))))
        });
        if let Some((first, last)) = bounds {
            ranges.push(PushConstantRange { offset: first, size: last - first, stages: *stage });
        }
    }
    ranges
}

/// Binding tables per set index; sets without bindings get an empty table
pub fn set_layout_bindings(
    merged: &BTreeMap<String, ReflectedBinding>,
) -> Result<Vec<BTreeMap<u32, DescriptorBinding>>> {
    let set_count = merged.values().map(|b| b.set + 1).max().unwrap_or(0);
    let mut sets = vec![BTreeMap::new(); set_count as usize];
    for (name, binding) in merged {
        let table: &mut BTreeMap<u32, DescriptorBinding> = &mut sets[binding.set as usize];
        match table.get_mut(&binding.binding) {
            Some(existing) if existing.descriptor_type != binding.descriptor_type => {
                vrg_bail!(
                    "vrg::pipeline",
                    "Binding '{}' at set {} binding {} conflicts: {:?} vs {:?}",
                    name,
                    binding.set,
                    binding.binding,
                    existing.descriptor_type,
                    binding.descriptor_type
                );
            }
            Some(existing) => {
                existing.stage_flags |= binding.stages;
                existing.count = existing.count.max(binding.count);
            }
            None => {
                table.insert(
                    binding.binding,
                    DescriptorBinding {
                        descriptor_type: binding.descriptor_type,
                        stage_flags: binding.stages,
                        count: binding.count,
                    },
                );
            }
        }
    }
    Ok(sets)
}

// ===== PIPELINE LAYOUT =====

/// Descriptor set layouts and push constant ranges of a pipeline
pub struct PipelineLayout {
    base: ResourceBase,
    handle: PipelineLayoutHandle,
    set_layouts: Vec<Arc<DescriptorSetLayout>>,
    push_constant_ranges: Vec<PushConstantRange>,
}

impl PipelineLayout {
    pub fn new(
        context: &Arc<DeviceContext>,
        name: &str,
        set_layouts: Vec<Arc<DescriptorSetLayout>>,
        push_constant_ranges: Vec<PushConstantRange>,
    ) -> Result<Arc<PipelineLayout>> {
        let handle = context.driver().create_pipeline_layout(&PipelineLayoutCreateInfo {
            set_layouts: set_layouts.iter().map(|layout| layout.handle()).collect(),
            push_constant_ranges: push_constant_ranges.clone(),
        })?;
        let base = ResourceBase::new(context.clone(), name);
        base.label(NamedObject::PipelineLayout(handle));
        Ok(Arc::new(PipelineLayout { base, handle, set_layouts, push_constant_ranges }))
    }

    pub fn handle(&self) -> PipelineLayoutHandle {
        self.handle
    }

    pub fn set_layouts(&self) -> &[Arc<DescriptorSetLayout>] {
        &self.set_layouts
    }

    pub fn set_layout(&self, set: u32) -> Option<&Arc<DescriptorSetLayout>> {
        self.set_layouts.get(set as usize)
    }

    pub fn push_constant_ranges(&self) -> &[PushConstantRange] {
        &self.push_constant_ranges
    }
}

impl DeviceResource for PipelineLayout {
    fn base(&self) -> &ResourceBase {
        &self.base
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        self.base.driver().destroy_pipeline_layout(self.handle);
    }
}

// ===== FIXED-FUNCTION STATE =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VertexInputRate {
    #[default]
    Vertex,
    Instance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolygonMode {
    Fill,
    Line,
    Point,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Front,
    Back,
    FrontAndBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrontFace {
    CounterClockwise,
    Clockwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DynamicState {
    Viewport,
    Scissor,
    LineWidth,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterizationState {
    pub polygon_mode: PolygonMode,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub line_width: f32,
}

impl Default for RasterizationState {
    fn default() -> Self {
        Self {
            polygon_mode: PolygonMode::Fill,
            cull_mode: CullMode::Back,
            front_face: FrontFace::CounterClockwise,
            line_width: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthStencilState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub compare_op: CompareOp,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self { depth_test: true, depth_write: true, compare_op: CompareOp::LessOrEqual }
    }
}

// ===== VERTEX INPUT =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexInputBinding {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: VertexInputRate,
}

/// Where a semantic attribute lives in the vertex buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub binding: u32,
    pub format: Format,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexInputAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: Format,
    pub offset: u32,
}

/// Vertex buffer layout of a mesh, keyed by attribute semantic
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VertexLayout {
    pub topology: PrimitiveTopology,
    pub bindings: Vec<VertexInputBinding>,
    pub attributes: BTreeMap<VertexAttributeId, VertexAttribute>,
}

impl VertexLayout {
    /// Native attributes for the inputs a vertex shader consumes, sorted by location
    ///
    /// Attributes the shader does not read are skipped.
    pub fn input_attributes(&self, vertex_shader: &ShaderReflection) -> Vec<VertexInputAttribute> {
        let mut attributes: Vec<VertexInputAttribute> = self
            .attributes
            .iter()
            .filter_map(|(id, attribute)| {
                vertex_shader.stage_inputs.values().find(|input| input.attribute == *id).map(|input| {
                    VertexInputAttribute {
                        location: input.location,
                        binding: attribute.binding,
                        format: attribute.format,
                        offset: attribute.offset,
                    }
                })
            })
            .collect();
        attributes.sort_by_key(|a| a.location);
        attributes
    }
}

// ===== PIPELINE =====

#[derive(Debug, Clone, PartialEq)]
pub struct ShaderStageInfo {
    pub stage: ShaderStageFlags,
    pub module: ShaderModuleHandle,
    pub entry_point: String,
}

/// Native graphics pipeline parameters
#[derive(Debug, Clone, PartialEq)]
pub struct GraphicsPipelineCreateInfo {
    pub layout: PipelineLayoutHandle,
    pub render_pass: RenderPassHandle,
    pub subpass: u32,
    pub stages: Vec<ShaderStageInfo>,
    pub vertex_bindings: Vec<VertexInputBinding>,
    pub vertex_attributes: Vec<VertexInputAttribute>,
    pub topology: PrimitiveTopology,
    pub rasterization: RasterizationState,
    pub depth_stencil: DepthStencilState,
    pub blend_states: Vec<ColorBlendAttachmentState>,
    pub samples: SampleCount,
    pub dynamic_states: Vec<DynamicState>,
}

/// Graphics pipeline request
#[derive(Clone)]
pub struct GraphicsPipelineDesc {
    pub render_pass: Arc<RenderPass>,
    pub subpass: u32,
    pub modules: Vec<Arc<ShaderModule>>,
    pub vertex_layout: VertexLayout,
    pub rasterization: RasterizationState,
    pub depth_stencil: DepthStencilState,
    pub dynamic_states: Vec<DynamicState>,
}

impl GraphicsPipelineDesc {
    /// Subpass 0, back-face culling, less-or-equal depth test, dynamic viewport/scissor/line width
    pub fn new(render_pass: Arc<RenderPass>, modules: Vec<Arc<ShaderModule>>, vertex_layout: VertexLayout) -> Self {
        Self {
            render_pass,
            subpass: 0,
            modules,
            vertex_layout,
            rasterization: RasterizationState::default(),
            depth_stencil: DepthStencilState::default(),
            dynamic_states: vec![DynamicState::Viewport, DynamicState::Scissor, DynamicState::LineWidth],
        }
    }
}

/// Graphics or compute pipeline with its merged reflection
pub struct Pipeline {
    base: ResourceBase,
    handle: PipelineHandle,
    bind_point: PipelineBindPoint,
    layout: Arc<PipelineLayout>,
    modules: Vec<Arc<ShaderModule>>,
    render_pass: Option<Arc<RenderPass>>,
    bindings: BTreeMap<String, ReflectedBinding>,
    push_constants: BTreeMap<String, PushConstantRange>,
}

struct MergedLayout {
    layout: Arc<PipelineLayout>,
    bindings: BTreeMap<String, ReflectedBinding>,
    push_constants: BTreeMap<String, PushConstantRange>,
}

fn build_layout(context: &Arc<DeviceContext>, name: &str, modules: &[Arc<ShaderModule>]) -> Result<MergedLayout> {
    let stages: Vec<(ShaderStageFlags, &ShaderReflection)> =
        modules.iter().map(|module| (module.stage(), module.reflection())).collect();

    let bindings = merge_bindings(&stages)?;
    let push_constants = merge_push_constants(&stages)?;
    let ranges = push_constant_ranges(&stages, &push_constants);

    let set_layouts = set_layout_bindings(&bindings)?
        .into_iter()
        .enumerate()
        .map(|(set, table)| DescriptorSetLayout::new(context, &format!("{}.set{}", name, set), table))
        .collect::<Result<Vec<_>>>()?;

    let layout = PipelineLayout::new(context, name, set_layouts, ranges)?;
    Ok(MergedLayout { layout, bindings, push_constants })
}

impl Pipeline {
    /// Graphics pipeline for one subpass of a render pass
    ///
    /// Blend states come from the subpass color attachments in declaration
    /// order; the sample count from its color/depth attachments; vertex input
    /// from matching the vertex shader inputs against the vertex layout.
    pub fn new_graphics(context: &Arc<DeviceContext>, name: &str, desc: &GraphicsPipelineDesc) -> Result<Arc<Pipeline>> {
        let Some(subpass) = desc.render_pass.subpass_descriptions().get(desc.subpass as usize) else {
            vrg_bail!(
                "vrg::pipeline",
                "Pipeline '{}': render pass '{}' has no subpass {}",
                name,
                desc.render_pass.name(),
                desc.subpass
            );
        };
        let Some(vertex_shader) = desc.modules.iter().find(|m| m.stage() == ShaderStageFlags::VERTEX) else {
            vrg_bail!("vrg::pipeline", "Graphics pipeline '{}' has no vertex stage", name);
        };

        let mut samples = SampleCount::S1;
        let mut blend_states = Vec::new();
        for attachment in &subpass.attachments {
            if matches!(attachment.role, AttachmentRole::Color | AttachmentRole::DepthStencil) {
                samples = attachment.description.samples;
            }
            if attachment.role == AttachmentRole::Color {
                blend_states.push(attachment.blend);
            }
        }

        let merged = build_layout(context, name, &desc.modules)?;

        let info = GraphicsPipelineCreateInfo {
            layout: merged.layout.handle(),
            render_pass: desc.render_pass.handle(),
            subpass: desc.subpass,
            stages: desc
                .modules
                .iter()
                .map(|m| ShaderStageInfo { stage: m.stage(), module: m.handle(), entry_point: m.entry_point().to_string() })
                .collect(),
            vertex_bindings: desc.vertex_layout.bindings.clone(),
            vertex_attributes: desc.vertex_layout.input_attributes(vertex_shader.reflection()),
            topology: desc.vertex_layout.topology,
            rasterization: desc.rasterization,
            depth_stencil: desc.depth_stencil,
            blend_states,
            samples,
            dynamic_states: desc.dynamic_states.clone(),
        };
        let handle = context.driver().create_graphics_pipeline(&info)?;

        vrg_debug!(
            "vrg::pipeline",
            "Created graphics pipeline '{}': {} stages, {} sets",
            name,
            info.stages.len(),
            merged.layout.set_layouts().len()
        );
        Ok(Arc::new(Self::assemble(
            context,
            name,
            handle,
            PipelineBindPoint::Graphics,
            merged,
            desc.modules.clone(),
            Some(desc.render_pass.clone()),
        )))
    }

    /// Compute pipeline from a single compute module
    pub fn new_compute(context: &Arc<DeviceContext>, name: &str, module: Arc<ShaderModule>) -> Result<Arc<Pipeline>> {
        if module.stage() != ShaderStageFlags::COMPUTE {
            vrg_bail!("vrg::pipeline", "Compute pipeline '{}' needs a compute module, got {:?}", name, module.stage());
        }
        let modules = vec![module];
        let merged = build_layout(context, name, &modules)?;
        let handle = context.driver().create_compute_pipeline(&ComputePipelineCreateInfo {
            layout: merged.layout.handle(),
            module: modules[0].handle(),
            entry_point: modules[0].entry_point().to_string(),
        })?;
        vrg_debug!("vrg::pipeline", "Created compute pipeline '{}'", name);
        Ok(Arc::new(Self::assemble(context, name, handle, PipelineBindPoint::Compute, merged, modules, None)))
    }

    fn assemble(
        context: &Arc<DeviceContext>,
        name: &str,
        handle: PipelineHandle,
        bind_point: PipelineBindPoint,
        merged: MergedLayout,
        modules: Vec<Arc<ShaderModule>>,
        render_pass: Option<Arc<RenderPass>>,
    ) -> Pipeline {
        let base = ResourceBase::new(context.clone(), name);
        base.label(NamedObject::Pipeline(handle));
        Pipeline {
            base,
            handle,
            bind_point,
            layout: merged.layout,
            modules,
            render_pass,
            bindings: merged.bindings,
            push_constants: merged.push_constants,
        }
    }

    pub fn handle(&self) -> PipelineHandle {
        self.handle
    }

    pub fn bind_point(&self) -> PipelineBindPoint {
        self.bind_point
    }

    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }

    pub fn modules(&self) -> &[Arc<ShaderModule>] {
        &self.modules
    }

    /// Render pass a graphics pipeline was built against
    pub fn render_pass(&self) -> Option<&Arc<RenderPass>> {
        self.render_pass.as_ref()
    }

    pub fn bindings(&self) -> &BTreeMap<String, ReflectedBinding> {
        &self.bindings
    }

    pub fn binding(&self, name: &str) -> Result<&ReflectedBinding> {
        self.bindings
            .get(name)
            .ok_or_else(|| vrg_err!("vrg::pipeline", "Pipeline '{}' has no descriptor named '{}'", self.name(), name))
    }

    pub fn push_constants(&self) -> &BTreeMap<String, PushConstantRange> {
        &self.push_constants
    }

    pub fn push_constant(&self, name: &str) -> Result<&PushConstantRange> {
        self.push_constants
            .get(name)
            .ok_or_else(|| vrg_err!("vrg::pipeline", "Pipeline '{}' has no push constant named '{}'", self.name(), name))
    }
}

impl DeviceResource for Pipeline {
    fn base(&self) -> &ResourceBase {
        &self.base
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.base.driver().destroy_pipeline(self.handle);
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name())
            .field("bind_point", &self.bind_point)
            .field("handle", &self.handle)
            .finish()
    }
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
