// GLSL -> SPIR-V compilation
//
// The compiler itself is an external tool. `GlslcCompiler` drives glslc (part
// of the Vulkan SDK) over stdin/stdout so nothing is written next to the
// shader sources.

use super::spirv::{words_from_bytes, SpirvError};
use super::ShaderStage;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("parse failed:\n{0}")]
    Parse(String),

    #[error("link failed:\n{0}")]
    Link(String),

    #[error("failed to run shader compiler '{tool}': {source}")]
    Tool {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("compiler produced invalid SPIR-V: {0}")]
    Output(#[from] SpirvError),
}

/// Compiles shader source text into SPIR-V words.
pub trait ShaderCompiler: Send + Sync {
    /// `origin` is only used for diagnostics and include resolution.
    fn compile(&self, source: &str, stage: ShaderStage, origin: &Path) -> Result<Vec<u32>, CompileError>;
}

/// Compiles through the `glslc` command-line tool.
#[derive(Debug, Clone)]
pub struct GlslcCompiler {
    executable: String,
}

impl GlslcCompiler {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    fn arguments(stage: ShaderStage, origin: &Path) -> Vec<String> {
        let mut args = vec![
            format!("-fshader-stage={}", stage.extension()),
            "--target-env=vulkan1.0".to_string(),
            "-std=450".to_string(),
            // bindings and I/O locations the source leaves implicit
            "-fauto-bind-uniforms".to_string(),
            "-fauto-map-locations".to_string(),
        ];
        if let Some(dir) = origin.parent().filter(|d| !d.as_os_str().is_empty()) {
            args.push(format!("-I{}", dir.display()));
        }
        args.extend(["-o".to_string(), "-".to_string(), "-".to_string()]);
        args
    }
}

impl Default for GlslcCompiler {
    fn default() -> Self {
        Self::new("glslc")
    }
}

/// glslc reports linker problems with this prefix; everything else is a parse error.
fn classify_failure(diagnostics: String) -> CompileError {
    if diagnostics.contains("linking") || diagnostics.contains("Linking") {
        CompileError::Link(diagnostics)
    } else {
        CompileError::Parse(diagnostics)
    }
}

impl ShaderCompiler for GlslcCompiler {
    fn compile(&self, source: &str, stage: ShaderStage, origin: &Path) -> Result<Vec<u32>, CompileError> {
        let tool_error = |err: std::io::Error| CompileError::Tool {
            tool: self.executable.clone(),
            source: err,
        };

        let mut child = Command::new(&self.executable)
            .args(Self::arguments(stage, origin))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(tool_error)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(source.as_bytes()).map_err(tool_error)?;
        }

        let output = child.wait_with_output().map_err(tool_error)?;
        if !output.status.success() {
            let diagnostics = String::from_utf8_lossy(&output.stderr)
                .replace("<stdin>", &origin.display().to_string());
            return Err(classify_failure(diagnostics));
        }

        Ok(words_from_bytes(&output.stdout)?)
    }
}
