//! Seam between the backend and the shader toolchain.
//!
//! Shader source loading and cross-compilation live outside this crate. The
//! scene layer hands us a [`ShaderProvider`] for raw source text and a
//! [`ShaderCompiler`] that turns source into SPIR-V; this module only glues
//! the fixed preamble, the per-variant defines and module creation together.

use crate::device::DeviceContext;
use crate::error::*;
use ash::vk;
use snafu::ResultExt;

/// Prepended to every shader before compilation.
pub const SHADER_PREAMBLE: &str = "#version 450\n#extension GL_GOOGLE_include_directive : enable\n";

/// Extra preamble lines when the bindless descriptor layout is active.
pub const BINDLESS_PREAMBLE: &str = "#extension GL_EXT_nonuniform_qualifier : enable\n#define BINDLESS 1\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    pub fn vk_flags(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
        }
    }
}

/// Source text provider for named logical shaders. Implemented by the asset
/// layer; sources are opaque to this crate.
pub trait ShaderProvider {
    fn source(&self, name: &str) -> Option<String>;
}

/// Turns composed source into SPIR-V words. Compile failure is fatal at
/// pipeline-table build time.
pub trait ShaderCompiler {
    fn compile(&self, stage: ShaderStage, name: &str, source: &str) -> Result<Vec<u32>, String>;
}

/// Final source fed to the compiler: preamble, then the `#define` fragment
/// for variant selection, then the body.
pub(crate) fn compose_source(preamble: &str, defines: &str, body: &str) -> String {
    let mut source = String::with_capacity(preamble.len() + defines.len() + body.len() + 1);
    source.push_str(preamble);
    source.push_str(defines);
    if !defines.is_empty() && !defines.ends_with('\n') {
        source.push('\n');
    }
    source.push_str(body);
    source
}

pub(crate) fn build_module(
    device: &DeviceContext,
    provider: &dyn ShaderProvider,
    compiler: &dyn ShaderCompiler,
    name: &'static str,
    stage: ShaderStage,
    defines: &str,
    bindless: bool,
) -> Result<vk::ShaderModule> {
    let body = provider.source(name).ok_or(RenderError::ShaderMissing { name })?;

    let preamble = if bindless {
        format!("{SHADER_PREAMBLE}{BINDLESS_PREAMBLE}")
    } else {
        SHADER_PREAMBLE.to_string()
    };
    let source = compose_source(&preamble, defines, &body);

    let words = compiler
        .compile(stage, name, &source)
        .map_err(|message| RenderError::ShaderCompile { name, message })?;

    let info = vk::ShaderModuleCreateInfo::default().code(&words);
    unsafe { device.device.create_shader_module(&info, None) }
        .context(CreateResourceErr { what: name })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preamble_comes_first() {
        let source = compose_source(SHADER_PREAMBLE, "#define MASKED 1\n", "void main() {}\n");
        assert!(source.starts_with("#version 450\n"));
        let version_pos = source.find("#version").unwrap();
        let define_pos = source.find("#define MASKED").unwrap();
        let body_pos = source.find("void main").unwrap();
        assert!(version_pos < define_pos && define_pos < body_pos);
    }

    #[test]
    fn missing_define_newline_is_inserted() {
        let source = compose_source("P\n", "#define X 1", "body");
        assert!(source.contains("#define X 1\nbody"));
    }

    #[test]
    fn empty_defines_add_nothing() {
        let source = compose_source("P\n", "", "body");
        assert_eq!(source, "P\nbody");
    }
}
