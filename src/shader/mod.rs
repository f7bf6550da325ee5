// Shader reflection and cross-compilation
//
// Backend-neutral shader data: SPIR-V words plus the uniform buffer layout
// reflected from them. The Vulkan side turns these into `vk::ShaderModule`s,
// the legacy side into GLSL text.

pub mod compiler;
pub mod legacy;
pub mod reflect;
pub mod spirv;
pub mod transpile;
pub mod watch;

#[cfg(test)]
pub(crate) mod test_utils;

use std::path::{Path, PathBuf};

pub use compiler::{CompileError, GlslcCompiler, ShaderCompiler};
pub use legacy::{cross_compile, GlslEmitter, LegacyShader, SpirvCrossEmitter};
pub use reflect::ShaderReflector;
pub use spirv::{BytecodeIntrospector, ShaderResources, SpirvError, SpirvIntrospector};
pub use transpile::strip_layout_qualifiers;
pub use watch::ShaderWatcher;

/// Name of the combined image-sampler array holding per-object textures.
pub const OBJECT_TEXTURES: &str = "ObjectTextures";

/// Spec name under which non-object textures (framebuffer inputs) are summarized.
pub const INPUT_TEXTURES: &str = "inputs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Geometry,
    TessControl,
    TessEval,
    Compute,
}

impl ShaderStage {
    /// Stage for a source extension (`vert`, `frag`, ...), if known.
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension {
            "vert" => Some(Self::Vertex),
            "frag" => Some(Self::Fragment),
            "geom" => Some(Self::Geometry),
            "tesc" => Some(Self::TessControl),
            "tese" => Some(Self::TessEval),
            "comp" => Some(Self::Compute),
            _ => None,
        }
    }

    /// Extension used for this stage's source files.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Vertex => "vert",
            Self::Fragment => "frag",
            Self::Geometry => "geom",
            Self::TessControl => "tesc",
            Self::TessEval => "tese",
            Self::Compute => "comp",
        }
    }
}

/// One active member of a uniform buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UboMemberSpec {
    pub name: String,
    pub index: u32,
    pub offset: u32,
    pub range: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    UniformBuffer,
    /// Summary entry for a stage's combined image-samplers
    InputTextures,
}

/// Layout of one descriptor as reflected from a shader stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UboSpec {
    pub name: String,
    pub set: u32,
    pub binding: u32,
    pub kind: DescriptorKind,
    /// Sorted by `index`, names unique
    pub members: Vec<UboMemberSpec>,
}

impl UboSpec {
    pub fn member(&self, name: &str) -> Option<&UboMemberSpec> {
        self.members.iter().find(|m| m.name == name)
    }

    /// Bytes needed to back every active member.
    pub fn size(&self) -> u64 {
        self.members
            .iter()
            .map(|m| u64::from(m.offset) + u64::from(m.range))
            .max()
            .unwrap_or(0)
    }
}

/// Descriptor specs of one stage, keyed by name, in reflection order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorSpecs {
    entries: Vec<(String, UboSpec)>,
}

impl DescriptorSpecs {
    pub fn get(&self, key: &str) -> Option<&UboSpec> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, spec)| spec)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Adds `spec` under `key` unless the key is taken. Returns whether it was added.
    pub fn insert_if_absent(&mut self, key: impl Into<String>, spec: UboSpec) -> bool {
        let key = key.into();
        if self.contains(&key) {
            return false;
        }
        self.entries.push((key, spec));
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &UboSpec)> {
        self.entries.iter().map(|(k, spec)| (k.as_str(), spec))
    }

    pub fn uniform_buffers(&self) -> impl Iterator<Item = &UboSpec> {
        self.entries
            .iter()
            .map(|(_, spec)| spec)
            .filter(|spec| spec.kind == DescriptorKind::UniformBuffer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A compiled and reflected shader stage.
#[derive(Debug, Clone)]
pub struct ShaderModule {
    pub stage: ShaderStage,
    /// The artifact the bytecode came from (source or `.spv`)
    pub path: PathBuf,
    pub bytecode: Vec<u32>,
    pub specs: DescriptorSpecs,
    pub stage_inputs: Vec<String>,
}

impl ShaderModule {
    /// Failed compilations leave the bytecode empty; such modules must not be drawn with.
    pub fn is_usable(&self) -> bool {
        !self.bytecode.is_empty()
    }

    pub fn ubo(&self, name: &str) -> Option<&UboSpec> {
        self.specs.get(name)
    }
}

/// Strips a trailing `.spv` (case-insensitive) from `path`.
pub fn source_path_for(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    let split = name.len().checked_sub(4)?;
    let suffix = name.get(split..)?;
    if !suffix.eq_ignore_ascii_case(".spv") {
        return None;
    }
    Some(path.with_file_name(&name[..split]))
}

pub fn is_bytecode_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("spv"))
        .unwrap_or(false)
}

/// Stage extension of `path`, looking through a trailing `.spv`.
pub fn stage_extension(path: &Path) -> String {
    let source = source_path_for(path).unwrap_or_else(|| path.to_path_buf());
    source
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> UboSpec {
        UboSpec {
            name: name.into(),
            set: 0,
            binding: 0,
            kind: DescriptorKind::UniformBuffer,
            members: vec![
                UboMemberSpec { name: "a".into(), index: 0, offset: 0, range: 64 },
                UboMemberSpec { name: "b".into(), index: 1, offset: 64, range: 12 },
            ],
        }
    }

    #[test]
    fn stage_extensions_roundtrip() {
        for ext in ["vert", "frag", "geom", "tesc", "tese", "comp"] {
            assert_eq!(ShaderStage::from_extension(ext).unwrap().extension(), ext);
        }
        assert_eq!(ShaderStage::from_extension("glsl"), None);
    }

    #[test]
    fn spv_paths_pair_with_their_source() {
        assert_eq!(
            source_path_for(Path::new("a/b/phong.frag.spv")),
            Some(PathBuf::from("a/b/phong.frag"))
        );
        assert_eq!(
            source_path_for(Path::new("phong.vert.SPV")),
            Some(PathBuf::from("phong.vert"))
        );
        assert_eq!(source_path_for(Path::new("phong.vert")), None);
        assert!(is_bytecode_path(Path::new("x.comp.spv")));
        assert!(!is_bytecode_path(Path::new("x.comp")));
        assert_eq!(stage_extension(Path::new("x.tese.spv")), "tese");
        assert_eq!(stage_extension(Path::new("x.geom")), "geom");
    }

    #[test]
    fn specs_keep_first_insert_and_order() {
        let mut specs = DescriptorSpecs::default();
        assert!(specs.insert_if_absent("Matrices", spec("Matrices")));
        assert!(specs.insert_if_absent("Light", spec("Light")));

        let mut dup = spec("Matrices");
        dup.binding = 7;
        assert!(!specs.insert_if_absent("Matrices", dup));

        assert_eq!(specs.len(), 2);
        assert_eq!(specs.get("Matrices").unwrap().binding, 0);
        let keys: Vec<_> = specs.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["Matrices", "Light"]);
    }

    #[test]
    fn spec_size_covers_last_member() {
        assert_eq!(spec("x").size(), 76);
        assert_eq!(spec("x").member("b").unwrap().offset, 64);
    }
}
