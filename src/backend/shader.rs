// Shader module loading
//
// Shaders are compiled to SPIR-V by build.rs and read from disk at startup.

use anyhow::{Context, Result};
use ash::vk;
use std::path::Path;
use super::VulkanDevice;
use crate::error::RenderError;

/// Create a shader module from SPIR-V bytes
pub fn create_shader_module(device: &VulkanDevice, code: &[u8]) -> Result<vk::ShaderModule> {
    // read_spv copies into u32 words, so `code` needn't be aligned
    let words = ash::util::read_spv(&mut std::io::Cursor::new(code))
        .context("Shader is not valid SPIR-V")?;

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);

    let module = unsafe { device.device.create_shader_module(&create_info, None) }
        .map_err(RenderError::creation("shader module"))?;

    Ok(module)
}

pub fn load_shader_module<P: AsRef<Path>>(device: &VulkanDevice, path: P) -> Result<vk::ShaderModule> {
    let path = path.as_ref();
    let code = std::fs::read(path)
        .with_context(|| format!("Failed to read shader {}", path.display()))?;

    log::debug!("Loaded shader {} ({} bytes)", path.display(), code.len());
    create_shader_module(device, &code)
}
