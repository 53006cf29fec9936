use crate::{context::Context, descriptors::ResourceKind};

use std::collections::HashMap;

use vulkanalia::prelude::v1_0::*;
use anyhow::{anyhow, Result};

/// A compiled shader stage: the SPIR-V module plus the binding
/// map reflected from it, consumed by the binding manager to
/// validate resource sets. Cross-compilation and reflection
/// happen offline; the map is supplied alongside the bytecode.
pub struct Shader {
    pub module: vk::ShaderModule,
    pub stage: vk::ShaderStageFlags,
    pub bindings: HashMap<u32, ResourceKind>,
}

impl Shader {
    pub fn new(
        context: &Context,
        bytecode: &[u8],
        stage: vk::ShaderStageFlags,
        bindings: HashMap<u32, ResourceKind>,
    ) -> Result<Self> {
        let module = create_shader_module(&context.device, bytecode)?;
        Ok(Self {
            module,
            stage,
            bindings,
        })
    }

    pub fn destroy(&self, context: &Context) {
        unsafe { context.device.destroy_shader_module(self.module, None) };
    }
}

pub fn create_shader_module(device: &Device, bytecode: &[u8]) -> Result<vk::ShaderModule> {
    // The info struct wants u32 words, but bytecode arrives as
    // bytes. Copying into a Vec first guarantees alignment; the
    // realignment then splits into a prefix, an aligned middle,
    // and a suffix, and any byte landing outside the middle
    // means the bytecode length was not a multiple of four.
    let bytecode = Vec::<u8>::from(bytecode);
    let (prefix, code, suffix) = unsafe { bytecode.align_to::<u32>() };
    if !prefix.is_empty() || !suffix.is_empty() {
        return Err(anyhow!("Shader bytecode is not properly aligned."));
    }

    let info = vk::ShaderModuleCreateInfo::builder()
        .code_size(bytecode.len())
        .code(code);

    Ok(unsafe { device.create_shader_module(&info, None)? })
}
