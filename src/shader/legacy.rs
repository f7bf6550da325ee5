// Legacy (desktop GLSL) shader path
//
// The GL backend cannot consume SPIR-V, so reflected modules are turned back
// into GLSL by an external emitter and then stripped of the layout qualifiers
// GLSL 4.10 does not understand.

use super::transpile::strip_layout_qualifiers;
use super::{DescriptorSpecs, ShaderModule, ShaderStage};
use crate::context::BackendContext;
use anyhow::{bail, Context, Result};
use std::io::Write;
use std::process::Command;

/// Emits desktop GLSL text for SPIR-V bytecode.
pub trait GlslEmitter: Send + Sync {
    fn emit(&self, bytecode: &[u32], version: u32) -> Result<String>;
}

/// Runs the `spirv-cross` command-line tool.
#[derive(Debug, Clone)]
pub struct SpirvCrossEmitter {
    executable: String,
}

impl SpirvCrossEmitter {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

impl Default for SpirvCrossEmitter {
    fn default() -> Self {
        Self::new("spirv-cross")
    }
}

impl GlslEmitter for SpirvCrossEmitter {
    fn emit(&self, bytecode: &[u32], version: u32) -> Result<String> {
        let mut input = tempfile::Builder::new()
            .suffix(".spv")
            .tempfile()
            .context("Failed to create scratch file for spirv-cross")?;

        let bytes: Vec<u8> = bytecode.iter().flat_map(|w| w.to_le_bytes()).collect();
        input.write_all(&bytes)?;
        input.flush()?;

        // no --vulkan-semantics: desktop GLSL, non-ES
        let output = Command::new(&self.executable)
            .arg(input.path())
            .args(["--version", &version.to_string(), "--no-es"])
            .output()
            .with_context(|| format!("Failed to run '{}'", self.executable))?;

        if !output.status.success() {
            bail!(
                "{} failed: {}",
                self.executable,
                String::from_utf8_lossy(&output.stderr)
            );
        }

        String::from_utf8(output.stdout).context("spirv-cross emitted invalid UTF-8")
    }
}

/// A shader stage ready for the GL backend.
#[derive(Debug, Clone)]
pub struct LegacyShader {
    pub stage: ShaderStage,
    pub source: String,
    pub specs: DescriptorSpecs,
}

/// Cross-compiles `module` to GLSL `version` and rewrites its layout qualifiers.
pub fn cross_compile(
    module: &ShaderModule,
    emitter: &dyn GlslEmitter,
    version: u32,
    ctx: &BackendContext,
) -> Result<LegacyShader> {
    if !module.is_usable() {
        ctx.error(
            "vkscene::shader",
            format_args!("Refusing to cross-compile {}: no bytecode", module.path.display()),
        );
        bail!("shader {} has no bytecode", module.path.display());
    }

    let emitted = emitter
        .emit(&module.bytecode, version)
        .with_context(|| format!("Failed to emit GLSL for {}", module.path.display()))?;

    log::debug!(
        "Cross-compiled {} to GLSL {} ({} bytes)",
        module.path.display(),
        version,
        emitted.len()
    );

    Ok(LegacyShader {
        stage: module.stage,
        source: strip_layout_qualifiers(&emitted),
        specs: module.specs.clone(),
    })
}
