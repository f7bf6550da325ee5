// Graphics pipeline creation and management
//
// Descriptor set layouts are derived from reflected shader specs rather than
// written by hand. The pipeline itself uses dynamic viewport and scissor so it
// survives swapchain resizes.

use anyhow::{Context, Result};
use ash::vk;
use std::collections::BTreeMap;
use std::ffi::CStr;

use super::shader::stage_flags;
use super::VulkanDevice;
use crate::shader::{DescriptorKind, ShaderModule};

/// Slots in the `ObjectTextures` combined image sampler array.
pub const OBJECT_TEXTURE_SLOTS: u32 = 6;

const ENTRY_POINT: &CStr = c"main";

/// Which vertex attributes a mesh provides, interleaved in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VertexDataKind {
    #[default]
    CoordsNormalsTexcoords,
    CoordsTexcoords,
    CoordsNormals,
    CoordsNone,
}

impl VertexDataKind {
    /// Float components per attribute: positions, normals, texcoords.
    fn components(self) -> &'static [u32] {
        match self {
            Self::CoordsNormalsTexcoords => &[3, 3, 2],
            Self::CoordsTexcoords => &[3, 2],
            Self::CoordsNormals => &[3, 3],
            Self::CoordsNone => &[],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VertexDescription {
    pub bindings: Vec<vk::VertexInputBindingDescription>,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
}

impl VertexDescription {
    pub fn stride(&self) -> u32 {
        self.bindings.first().map(|b| b.stride).unwrap_or(0)
    }
}

fn float_format(components: u32) -> vk::Format {
    match components {
        1 => vk::Format::R32_SFLOAT,
        2 => vk::Format::R32G32_SFLOAT,
        3 => vk::Format::R32G32B32_SFLOAT,
        _ => vk::Format::R32G32B32A32_SFLOAT,
    }
}

/// Interleaved input description for `kind`: one binding, locations from 0.
pub fn vertex_input_description(kind: VertexDataKind) -> VertexDescription {
    let float = std::mem::size_of::<f32>() as u32;

    let mut attributes = Vec::new();
    let mut offset = 0;
    for (location, &components) in kind.components().iter().enumerate() {
        attributes.push(
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(location as u32)
                .format(float_format(components))
                .offset(offset)
                .build(),
        );
        offset += components * float;
    }

    if attributes.is_empty() {
        return VertexDescription::default();
    }

    let binding = vk::VertexInputBindingDescription::builder()
        .binding(0)
        .stride(offset)
        .input_rate(vk::VertexInputRate::VERTEX)
        .build();

    VertexDescription {
        bindings: vec![binding],
        attributes,
    }
}

fn descriptor_type(kind: DescriptorKind) -> vk::DescriptorType {
    match kind {
        DescriptorKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorKind::InputTextures => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
    }
}

/// Layout bindings per descriptor set, sorted by binding, merged across stages.
pub fn descriptor_layout_bindings(
    modules: &[&ShaderModule],
) -> BTreeMap<u32, Vec<vk::DescriptorSetLayoutBinding>> {
    let mut sets: BTreeMap<u32, BTreeMap<u32, vk::DescriptorSetLayoutBinding>> = BTreeMap::new();

    for module in modules {
        let stage = stage_flags(module.stage);
        for (key, spec) in module.specs.iter() {
            let ty = descriptor_type(spec.kind);
            let bindings = sets.entry(spec.set).or_default();

            match bindings.get_mut(&spec.binding) {
                Some(existing) if existing.descriptor_type == ty => {
                    existing.stage_flags |= stage;
                }
                Some(existing) => {
                    log::warn!(
                        "{} in {} wants set {} binding {} as {:?}, already declared as {:?}",
                        key,
                        module.path.display(),
                        spec.set,
                        spec.binding,
                        ty,
                        existing.descriptor_type
                    );
                }
                None => {
                    bindings.insert(
                        spec.binding,
                        vk::DescriptorSetLayoutBinding::builder()
                            .binding(spec.binding)
                            .descriptor_type(ty)
                            .descriptor_count(1)
                            .stage_flags(stage)
                            .build(),
                    );
                }
            }
        }
    }

    sets.into_iter()
        .map(|(set, bindings)| (set, bindings.into_values().collect()))
        .collect()
}

/// The per-object texture array binding.
pub fn object_textures_binding(binding: u32, stages: vk::ShaderStageFlags) -> vk::DescriptorSetLayoutBinding {
    vk::DescriptorSetLayoutBinding::builder()
        .binding(binding)
        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        .descriptor_count(OBJECT_TEXTURE_SLOTS)
        .stage_flags(stages)
        .build()
}

pub fn create_descriptor_set_layout(
    device: &VulkanDevice,
    bindings: &[vk::DescriptorSetLayoutBinding],
) -> Result<vk::DescriptorSetLayout> {
    let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings);

    unsafe {
        device
            .device
            .create_descriptor_set_layout(&layout_info, None)
            .context("Failed to create descriptor set layout")
    }
}

pub fn create_pipeline_layout(
    device: &VulkanDevice,
    set_layouts: &[vk::DescriptorSetLayout],
) -> Result<vk::PipelineLayout> {
    let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(set_layouts);

    unsafe {
        device
            .device
            .create_pipeline_layout(&layout_info, None)
            .context("Failed to create pipeline layout")
    }
}

/// Fixed-function state for one graphics pipeline.
pub struct GraphicsPipelineDesc<'a> {
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
    pub stages: &'a [(vk::ShaderStageFlags, vk::ShaderModule)],
    pub vertex: &'a VertexDescription,
    pub topology: vk::PrimitiveTopology,
    pub cull_mode: vk::CullModeFlags,
    pub depth_test: bool,
    pub color_attachments: u32,
}

/// A pipeline together with the layout it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineHandle {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl PipelineHandle {
    pub fn destroy(self, device: &VulkanDevice) {
        unsafe {
            device.device.destroy_pipeline(self.pipeline, None);
            device.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// Create a graphics pipeline; `layout` is owned by the returned handle.
pub fn create_graphics_pipeline(
    device: &VulkanDevice,
    desc: &GraphicsPipelineDesc<'_>,
    layout: vk::PipelineLayout,
) -> Result<PipelineHandle> {
    let shader_stages: Vec<_> = desc
        .stages
        .iter()
        .map(|&(stage, module)| {
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(stage)
                .module(module)
                .name(ENTRY_POINT)
                .build()
        })
        .collect();

    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&desc.vertex.bindings)
        .vertex_attribute_descriptions(&desc.vertex.attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(desc.topology)
        .primitive_restart_enable(false);

    // Viewport and scissor are set at record time
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(desc.cull_mode)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(desc.depth_test)
        .depth_write_enable(desc.depth_test)
        .depth_compare_op(vk::CompareOp::LESS)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let color_blend_attachments: Vec<_> = (0..desc.color_attachments)
        .map(|_| {
            vk::PipelineColorBlendAttachmentState::builder()
                .color_write_mask(vk::ColorComponentFlags::RGBA)
                .blend_enable(false)
                .build()
        })
        .collect();
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(desc.render_pass)
        .subpass(desc.subpass)
        .build();

    let pipelines = unsafe {
        device
            .device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
            .map_err(|(_, e)| e)
            .context("Failed to create graphics pipeline")?
    };

    let pipeline = pipelines
        .into_iter()
        .next()
        .context("Driver returned no pipeline")?;

    Ok(PipelineHandle { pipeline, layout })
}
