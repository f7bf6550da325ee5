// Shader module creation
//
// Turns reflected `ShaderModule`s into `vk::ShaderModule`s. The words are
// already aligned, so no byte reinterpretation is needed here.

use anyhow::{bail, Context, Result};
use ash::vk;

use super::VulkanDevice;
use crate::shader::{ShaderModule, ShaderStage};

pub fn stage_flags(stage: ShaderStage) -> vk::ShaderStageFlags {
    match stage {
        ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
        ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
        ShaderStage::Geometry => vk::ShaderStageFlags::GEOMETRY,
        ShaderStage::TessControl => vk::ShaderStageFlags::TESSELLATION_CONTROL,
        ShaderStage::TessEval => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
        ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
    }
}

/// Create a shader module from reflected bytecode
pub fn create_shader_module(device: &VulkanDevice, module: &ShaderModule) -> Result<vk::ShaderModule> {
    if !module.is_usable() {
        bail!("{} failed to compile, no bytecode to upload", module.path.display());
    }

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&module.bytecode);

    unsafe {
        device
            .device
            .create_shader_module(&create_info, None)
            .with_context(|| format!("Failed to create shader module for {}", module.path.display()))
    }
}

pub fn destroy_shader_module(device: &VulkanDevice, module: vk::ShaderModule) {
    unsafe { device.device.destroy_shader_module(module, None) };
}
