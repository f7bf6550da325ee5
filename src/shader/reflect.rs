// Shader loading and reflection
//
// Resolves a shader path against the owner's root and the shared default root,
// recompiles when the GLSL source is newer than its `.spv`, and reflects the
// uniform buffer layout out of the bytecode. Results are cached per resolved
// path and rebuilt when the artifact on disk changes.

use super::compiler::{GlslcCompiler, ShaderCompiler};
use super::spirv::{words_from_bytes, BytecodeIntrospector, SpirvIntrospector};
use super::watch::ShaderWatcher;
use super::{
    is_bytecode_path, source_path_for, stage_extension, DescriptorKind, DescriptorSpecs,
    ShaderModule, ShaderStage, UboMemberSpec, UboSpec, INPUT_TEXTURES, OBJECT_TEXTURES,
};
use crate::context::BackendContext;
use crate::error::BackendError;
use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const TARGET: &str = "vkscene::shader";

/// Filesystem timestamps are coarse; a source has to beat its bytecode by this much.
pub const FRESHNESS_BIAS: Duration = Duration::from_millis(500);

/// Whether a source modified at `source` must be recompiled over bytecode
/// modified at `bytecode` (`None` when there is no bytecode file).
pub fn source_is_newer(bytecode: Option<SystemTime>, source: SystemTime) -> bool {
    source > bytecode.unwrap_or(UNIX_EPOCH) + FRESHNESS_BIAS
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// What a load actually reads from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Artifact {
    Bytecode(PathBuf),
    Source(PathBuf),
}

impl Artifact {
    fn path(&self) -> &Path {
        match self {
            Artifact::Bytecode(p) | Artifact::Source(p) => p,
        }
    }
}

struct CacheEntry {
    artifact: Artifact,
    stamp: Option<SystemTime>,
    module: Arc<ShaderModule>,
}

pub struct ShaderReflector {
    ctx: BackendContext,
    default_root: PathBuf,
    compiler: Arc<dyn ShaderCompiler>,
    introspector: Arc<dyn BytecodeIntrospector>,
    cache: RwLock<HashMap<PathBuf, CacheEntry>>,
}

impl ShaderReflector {
    /// A reflector using the configured compiler executable and default root.
    pub fn new(ctx: BackendContext) -> Self {
        let compiler = GlslcCompiler::new(ctx.config().shaders.compiler.clone());
        Self::with_services(ctx, Arc::new(compiler), Arc::new(SpirvIntrospector))
    }

    pub fn with_services(
        ctx: BackendContext,
        compiler: Arc<dyn ShaderCompiler>,
        introspector: Arc<dyn BytecodeIntrospector>,
    ) -> Self {
        let default_root = ctx.config().shaders.default_root.clone();
        Self {
            ctx,
            default_root,
            compiler,
            introspector,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn default_root(&self) -> &Path {
        &self.default_root
    }

    /// Loads `path` (a source or a `.spv` artifact), looking under `owner_root`
    /// before the default root.
    ///
    /// Compilation failures do not fail the load: they are reported through the
    /// diagnostics sink and the returned module has no bytecode.
    pub fn load(&self, path: impl AsRef<Path>, owner_root: Option<&Path>) -> Result<Arc<ShaderModule>> {
        let requested = self.resolve(path.as_ref(), owner_root)?;
        let (artifact, stamp) = active_artifact(&requested);

        if let Some(entry) = self.cache.read().get(&requested) {
            if entry.artifact == artifact && entry.stamp == stamp {
                return Ok(Arc::clone(&entry.module));
            }
        }

        let module = Arc::new(
            self.build(&requested, &artifact)
                .with_context(|| format!("Failed to load shader {}", requested.display()))?,
        );

        self.cache.write().insert(
            requested,
            CacheEntry {
                artifact,
                stamp,
                module: Arc::clone(&module),
            },
        );
        Ok(module)
    }

    /// Drops every cache entry loaded from or through `path`. Returns how many went.
    pub fn invalidate(&self, path: &Path) -> usize {
        let mut cache = self.cache.write();
        let before = cache.len();
        cache.retain(|key, entry| {
            let touches = same_file(key, path)
                || same_file(entry.artifact.path(), path)
                || source_path_for(key).is_some_and(|source| same_file(&source, path));
            if touches {
                log::debug!("Invalidated cached shader {}", key.display());
            }
            !touches
        });
        before - cache.len()
    }

    /// Drops the entries the watcher has seen change since the last call.
    pub fn invalidate_stale(&self, watcher: &ShaderWatcher) -> usize {
        let stale: HashSet<PathBuf> = watcher.drain_stale().into_iter().collect();
        stale.iter().map(|path| self.invalidate(path)).sum()
    }

    pub fn cached_count(&self) -> usize {
        self.cache.read().len()
    }

    fn resolve(&self, path: &Path, owner_root: Option<&Path>) -> Result<PathBuf> {
        let roots = owner_root.into_iter().chain(Some(self.default_root.as_path()));
        for root in roots {
            let candidate = root.join(path);
            let has_source = source_path_for(&candidate).is_some_and(|s| s.exists());
            if candidate.exists() || has_source {
                return Ok(candidate);
            }
        }
        Err(BackendError::ShaderNotFound(path.to_path_buf()).into())
    }

    fn stage_for(&self, path: &Path) -> ShaderStage {
        let extension = stage_extension(path);
        ShaderStage::from_extension(&extension).unwrap_or_else(|| {
            self.ctx.warn(
                TARGET,
                format_args!(
                    "Unknown shader extension '.{}' on {}, assuming vertex stage",
                    extension,
                    path.display()
                ),
            );
            ShaderStage::Vertex
        })
    }

    fn build(&self, requested: &Path, artifact: &Artifact) -> Result<ShaderModule> {
        let stage = self.stage_for(artifact.path());

        let bytecode = match artifact {
            Artifact::Bytecode(path) => {
                let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
                words_from_bytes(&bytes).with_context(|| format!("Invalid SPIR-V in {}", path.display()))?
            }
            Artifact::Source(path) => {
                if path != requested {
                    log::info!(
                        "Recompiling {}, as source file is newer than SPV file",
                        requested.display()
                    );
                }
                self.compile(path, stage)?
            }
        };

        let (specs, stage_inputs) = if bytecode.is_empty() {
            (DescriptorSpecs::default(), Vec::new())
        } else {
            self.reflect(&bytecode, artifact.path())?
        };

        Ok(ShaderModule {
            stage,
            path: artifact.path().to_path_buf(),
            bytecode,
            specs,
            stage_inputs,
        })
    }

    fn compile(&self, path: &Path, stage: ShaderStage) -> Result<Vec<u32>> {
        let source =
            fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;

        log::info!("Compiling {} ({:?})", path.display(), stage);
        match self.compiler.compile(&source, stage, path) {
            Ok(words) => Ok(words),
            Err(e) => {
                self.ctx.error(
                    TARGET,
                    format_args!("Error in shader compilation of {}: {}", path.display(), e),
                );
                Ok(Vec::new())
            }
        }
    }

    fn reflect(&self, bytecode: &[u32], path: &Path) -> Result<(DescriptorSpecs, Vec<String>)> {
        let resources = self
            .introspector
            .introspect(bytecode)
            .with_context(|| format!("Failed to reflect {}", path.display()))?;

        let mut specs = DescriptorSpecs::default();
        for ubo in resources.uniform_buffers {
            log::debug!("{}: {}, set={}, binding={}", path.display(), ubo.name, ubo.set, ubo.binding);

            let mut ranges = ubo.active_ranges;
            ranges.sort_by_key(|r| r.index);
            let mut seen = HashSet::new();
            let members: Vec<UboMemberSpec> = ranges
                .into_iter()
                .filter(|r| seen.insert(r.name.clone()))
                .map(|r| UboMemberSpec {
                    name: r.name,
                    index: r.index,
                    offset: r.offset,
                    range: r.range,
                })
                .collect();

            if members.is_empty() {
                log::debug!("Skipping {}: no active members", ubo.name);
                continue;
            }

            let spec = UboSpec {
                name: ubo.name.clone(),
                set: ubo.set,
                binding: ubo.binding,
                kind: DescriptorKind::UniformBuffer,
                members,
            };
            if !specs.insert_if_absent(ubo.name.clone(), spec) {
                log::debug!("Ignoring second uniform buffer named {}", ubo.name);
            }
        }

        if let Some(first) = resources.sampled_images.first() {
            if first.name != OBJECT_TEXTURES {
                specs.insert_if_absent(
                    first.name.clone(),
                    UboSpec {
                        name: INPUT_TEXTURES.to_string(),
                        set: first.set,
                        binding: 0,
                        kind: DescriptorKind::InputTextures,
                        members: Vec::new(),
                    },
                );
            }
        }

        Ok((specs, resources.stage_inputs))
    }
}

/// Picks the file a load of `requested` reads, with its modification time.
fn active_artifact(requested: &Path) -> (Artifact, Option<SystemTime>) {
    if !is_bytecode_path(requested) {
        return (Artifact::Source(requested.to_path_buf()), modified(requested));
    }

    let bytecode_time = modified(requested);
    if let Some(source) = source_path_for(requested) {
        if let Some(source_time) = modified(&source) {
            if source_is_newer(bytecode_time, source_time) {
                return (Artifact::Source(source), Some(source_time));
            }
        }
    }
    (Artifact::Bytecode(requested.to_path_buf()), bytecode_time)
}
