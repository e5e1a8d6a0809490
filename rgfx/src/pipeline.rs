//! Graphics pipelines built from a declarative [`PipelineDesc`].
//!
//! Pipelines target dynamic rendering, so no render pass object exists;
//! attachment formats are part of the description instead. Viewport and
//! scissor are always dynamic.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::descriptor::{CreateDescriptorSetLayoutError, DescriptorBindingDesc, DescriptorSetLayout};
use crate::device::Device;
use crate::shader::{CreateShaderModuleError, ShaderModule, ShaderSource};

#[derive(Debug, Error)]
pub enum CreatePipelineError {
    #[error("No shader stages provided")]
    NoStages,

    #[error("Depth testing requested without a depth attachment format")]
    MissingDepthFormat,

    #[error("Stencil testing requested without a stencil attachment format")]
    MissingStencilFormat,

    #[error("Failed to create descriptor set layout {set}: {source}")]
    SetLayout {
        set: usize,
        #[source]
        source: CreateDescriptorSetLayoutError,
    },

    #[error("Vulkan error creating pipeline layout: {0}")]
    Layout(vk::Result),

    #[error(transparent)]
    Shader(#[from] CreateShaderModuleError),

    #[error("Vulkan error creating graphics pipeline: {0}")]
    Pipeline(vk::Result),
}

// ---------------------------------------------------------------------------
// Fixed-function state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlendMode {
    #[default]
    Opaque,
    /// Straight alpha: `src * a + dst * (1 - a)`.
    Alpha,
    Additive,
}

impl BlendMode {
    pub fn attachment_state(self) -> vk::PipelineColorBlendAttachmentState {
        let base = vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA);
        let (src, dst) = match self {
            Self::Opaque => return base.blend_enable(false),
            Self::Alpha => (vk::BlendFactor::SRC_ALPHA, vk::BlendFactor::ONE_MINUS_SRC_ALPHA),
            Self::Additive => (vk::BlendFactor::SRC_ALPHA, vk::BlendFactor::ONE),
        };
        base.blend_enable(true)
            .src_color_blend_factor(src)
            .dst_color_blend_factor(dst)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorAttachmentDesc {
    pub format: vk::Format,
    pub blend: BlendMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthState {
    pub write: bool,
    pub compare_op: vk::CompareOp,
}

impl Default for DepthState {
    fn default() -> Self {
        Self {
            write: true,
            compare_op: vk::CompareOp::LESS,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StencilState {
    pub front: vk::StencilOpState,
    pub back: vk::StencilOpState,
}

/// Everything needed to build a pipeline except the shaders.
///
/// `set_layouts[i]` describes descriptor set `i`.
#[derive(Debug, Clone)]
pub struct PipelineDesc {
    pub set_layouts: Vec<Vec<DescriptorBindingDesc>>,
    pub push_constants: Vec<vk::PushConstantRange>,
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth: Option<DepthState>,
    pub stencil: Option<StencilState>,
    pub color_attachments: Vec<ColorAttachmentDesc>,
    pub depth_format: Option<vk::Format>,
    pub stencil_format: Option<vk::Format>,
    /// Beyond viewport and scissor, which are always dynamic.
    pub extra_dynamic_states: Vec<vk::DynamicState>,
}

impl Default for PipelineDesc {
    fn default() -> Self {
        Self {
            set_layouts: Vec::new(),
            push_constants: Vec::new(),
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth: None,
            stencil: None,
            color_attachments: Vec::new(),
            depth_format: None,
            stencil_format: None,
            extra_dynamic_states: Vec::new(),
        }
    }
}

impl PipelineDesc {
    pub fn validate(&self) -> Result<(), CreatePipelineError> {
        if self.depth.is_some() && self.depth_format.is_none() {
            return Err(CreatePipelineError::MissingDepthFormat);
        }
        if self.stencil.is_some() && self.stencil_format.is_none() {
            return Err(CreatePipelineError::MissingStencilFormat);
        }
        Ok(())
    }

    pub fn dynamic_states(&self) -> Vec<vk::DynamicState> {
        let mut states = vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        for &s in &self.extra_dynamic_states {
            if !states.contains(&s) {
                states.push(s);
            }
        }
        states
    }

    pub fn depth_stencil_state(&self) -> vk::PipelineDepthStencilStateCreateInfo<'static> {
        let mut info = vk::PipelineDepthStencilStateCreateInfo::default();
        if let Some(depth) = self.depth {
            info = info
                .depth_test_enable(true)
                .depth_write_enable(depth.write)
                .depth_compare_op(depth.compare_op);
        }
        if let Some(stencil) = self.stencil {
            info = info
                .stencil_test_enable(true)
                .front(stencil.front)
                .back(stencil.back);
        }
        info
    }

    pub fn blend_attachments(&self) -> Vec<vk::PipelineColorBlendAttachmentState> {
        self.color_attachments
            .iter()
            .map(|a| a.blend.attachment_state())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// PipelineLayout
// ---------------------------------------------------------------------------

/// A pipeline layout and the set layouts it was built from.
pub struct PipelineLayout {
    parent: Arc<Device>,
    handle: vk::PipelineLayout,
    set_layouts: Vec<DescriptorSetLayout>,
    push_constants: Vec<vk::PushConstantRange>,
}

impl std::fmt::Debug for PipelineLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineLayout")
            .field("handle", &self.handle)
            .field("set_layouts", &self.set_layouts.len())
            .finish_non_exhaustive()
    }
}

impl PipelineLayout {
    pub fn new(
        device: &Arc<Device>,
        sets: &[Vec<DescriptorBindingDesc>],
        push_constants: &[vk::PushConstantRange],
        name: Option<&str>,
    ) -> Result<Self, CreatePipelineError> {
        let set_layouts = sets
            .iter()
            .enumerate()
            .map(|(set, bindings)| {
                DescriptorSetLayout::new(device, bindings, name)
                    .map_err(|source| CreatePipelineError::SetLayout { set, source })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let raw_layouts: Vec<_> = set_layouts
            .iter()
            .map(DescriptorSetLayout::raw_descriptor_set_layout)
            .collect();

        let create_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&raw_layouts)
            .push_constant_ranges(push_constants);
        // SAFETY: the set layouts were just created from device.
        let handle = unsafe { device.create_raw_pipeline_layout(&create_info) }
            .map_err(CreatePipelineError::Layout)?;
        // SAFETY: handle was just created from device.
        unsafe { device.name_or_warn(handle, name) };

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            set_layouts,
            push_constants: push_constants.to_vec(),
        })
    }

    pub fn set_layout(&self, set: u32) -> Option<&DescriptorSetLayout> {
        self.set_layouts.get(set as usize)
    }

    pub fn set_count(&self) -> u32 {
        self.set_layouts.len() as u32
    }

    /// Whether `[offset, offset + size)` lies in a push constant range
    /// visible to every stage in `stages`.
    pub fn covers_push_constants(
        &self,
        stages: vk::ShaderStageFlags,
        offset: u32,
        size: u32,
    ) -> bool {
        let end = offset.saturating_add(size);
        self.push_constants.iter().any(|r| {
            r.stage_flags.contains(stages) && r.offset <= offset && end <= r.offset + r.size
        })
    }

    pub fn raw_pipeline_layout(&self) -> vk::PipelineLayout {
        self.handle
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        tracing::debug!("Dropping pipeline layout {:?}", self.handle);
        // SAFETY: the owning pipeline is destroyed first and the device is
        // idle.
        unsafe { self.parent.destroy_raw_pipeline_layout(self.handle) };
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct Pipeline {
    parent: Arc<Device>,
    handle: vk::Pipeline,
    layout: PipelineLayout,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("handle", &self.handle)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Builds set layouts, the pipeline layout, transient shader modules and
    /// the pipeline. The modules are destroyed before this returns.
    pub fn new(
        device: &Arc<Device>,
        desc: &PipelineDesc,
        shaders: &[ShaderSource],
        name: Option<&str>,
    ) -> Result<Self, CreatePipelineError> {
        if shaders.is_empty() {
            return Err(CreatePipelineError::NoStages);
        }
        desc.validate()?;

        let layout = PipelineLayout::new(device, &desc.set_layouts, &desc.push_constants, name)?;
        let modules = shaders
            .iter()
            .map(|s| ShaderModule::new(device, s, name))
            .collect::<Result<Vec<_>, _>>()?;
        let stages: Vec<_> = modules.iter().map(ShaderModule::stage_create_info).collect();

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&desc.vertex_bindings)
            .vertex_attribute_descriptions(&desc.vertex_attributes);
        let input_assembly =
            vk::PipelineInputAssemblyStateCreateInfo::default().topology(desc.topology);
        // Counts are still required with dynamic viewport and scissor.
        let viewport = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(desc.polygon_mode)
            .cull_mode(desc.cull_mode)
            .front_face(desc.front_face)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil = desc.depth_stencil_state();
        let blend_attachments = desc.blend_attachments();
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);
        let dynamic_states = desc.dynamic_states();
        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let color_formats: Vec<_> = desc.color_attachments.iter().map(|a| a.format).collect();
        let mut rendering = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(desc.depth_format.unwrap_or(vk::Format::UNDEFINED))
            .stencil_attachment_format(desc.stencil_format.unwrap_or(vk::Format::UNDEFINED));

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(layout.raw_pipeline_layout())
            .push_next(&mut rendering);

        // SAFETY: every pointer in create_info borrows a local that outlives
        // the call, and the layout and modules come from device.
        let handle = unsafe { device.create_raw_graphics_pipeline(&create_info) }
            .map_err(CreatePipelineError::Pipeline)?;
        // SAFETY: handle was just created from device.
        unsafe { device.name_or_warn(handle, name) };

        drop(stages);
        drop(modules);

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            layout,
        })
    }

    pub fn layout(&self) -> &PipelineLayout {
        &self.layout
    }

    pub fn raw_pipeline(&self) -> vk::Pipeline {
        self.handle
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        tracing::debug!("Dropping pipeline {:?}", self.handle);
        // SAFETY: the registry idles the device before destroying pipelines.
        unsafe { self.parent.destroy_raw_pipeline(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewport_and_scissor_are_always_dynamic() {
        let desc = PipelineDesc {
            extra_dynamic_states: vec![vk::DynamicState::LINE_WIDTH, vk::DynamicState::SCISSOR],
            ..Default::default()
        };
        assert_eq!(
            desc.dynamic_states(),
            vec![
                vk::DynamicState::VIEWPORT,
                vk::DynamicState::SCISSOR,
                vk::DynamicState::LINE_WIDTH,
            ]
        );
    }

    #[test]
    fn depth_without_format_is_rejected() {
        let desc = PipelineDesc {
            depth: Some(DepthState::default()),
            ..Default::default()
        };
        assert!(matches!(desc.validate(), Err(CreatePipelineError::MissingDepthFormat)));

        let desc = PipelineDesc {
            depth_format: Some(vk::Format::D32_SFLOAT),
            ..desc
        };
        assert!(desc.validate().is_ok());
    }

    #[test]
    fn depth_state_is_off_unless_requested() {
        let info = PipelineDesc::default().depth_stencil_state();
        assert_eq!(info.depth_test_enable, vk::FALSE);
        assert_eq!(info.stencil_test_enable, vk::FALSE);

        let desc = PipelineDesc {
            depth: Some(DepthState {
                write: false,
                compare_op: vk::CompareOp::GREATER,
            }),
            ..Default::default()
        };
        let info = desc.depth_stencil_state();
        assert_eq!(info.depth_test_enable, vk::TRUE);
        assert_eq!(info.depth_write_enable, vk::FALSE);
        assert_eq!(info.depth_compare_op, vk::CompareOp::GREATER);
    }

    #[test]
    fn blend_modes() {
        assert_eq!(BlendMode::Opaque.attachment_state().blend_enable, vk::FALSE);
        let alpha = BlendMode::Alpha.attachment_state();
        assert_eq!(alpha.blend_enable, vk::TRUE);
        assert_eq!(alpha.dst_color_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);
        let add = BlendMode::Additive.attachment_state();
        assert_eq!(add.dst_color_blend_factor, vk::BlendFactor::ONE);
        assert_eq!(add.color_write_mask, vk::ColorComponentFlags::RGBA);
    }

    #[test]
    fn one_blend_state_per_color_attachment() {
        let desc = PipelineDesc {
            color_attachments: vec![
                ColorAttachmentDesc {
                    format: vk::Format::B8G8R8A8_SRGB,
                    blend: BlendMode::Alpha,
                },
                ColorAttachmentDesc {
                    format: vk::Format::R16G16B16A16_SFLOAT,
                    blend: BlendMode::Opaque,
                },
            ],
            ..Default::default()
        };
        let states = desc.blend_attachments();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].blend_enable, vk::TRUE);
        assert_eq!(states[1].blend_enable, vk::FALSE);
    }
}
