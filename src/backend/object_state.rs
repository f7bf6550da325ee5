// Per-object GPU state
//
// Everything the renderer keeps for one drawable: draw parameters, vertex
// layout, vertex and uniform buffers, textures, the pipeline, and the
// descriptor set binding those textures into the `ObjectTextures` array.
//
// Texture and buffer maps are published as whole snapshots. Loader threads
// replace a snapshot; the render thread reads whichever snapshot is current
// and never sees a map being mutated.

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use super::buffer::{GpuBuffer, UniformBuffer};
use super::pipeline::{vertex_input_description, PipelineHandle, VertexDataKind, VertexDescription};
use super::VulkanDevice;
use crate::context::BackendContext;
use crate::shader::{DescriptorKind, ShaderModule, UboSpec};

const TARGET: &str = "vkscene::object";

/// Array slot of a texture type in `ObjectTextures`. Unknown types warn and use slot 0.
pub fn canonical_slot(texture_type: &str, ctx: &BackendContext) -> u32 {
    match texture_type {
        "ambient" => 0,
        "diffuse" => 1,
        "specular" => 2,
        "normal" => 3,
        "alphamask" => 4,
        "displacement" => 5,
        _ => {
            ctx.warn(TARGET, format_args!("Unknown texture type: {}", texture_type));
            0
        }
    }
}

/// A value replaced as a whole and read without holding a lock.
pub struct Snapshot<T> {
    current: Arc<RwLock<Arc<T>>>,
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self {
            current: Arc::clone(&self.current),
        }
    }
}

impl<T: Default> Default for Snapshot<T> {
    fn default() -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(T::default()))),
        }
    }
}

impl<T: Clone> Snapshot<T> {
    pub fn load(&self) -> Arc<T> {
        Arc::clone(&self.current.read())
    }

    pub fn store(&self, value: T) {
        *self.current.write() = Arc::new(value);
    }

    /// Publishes a modified copy of the current value.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.current.write();
        let mut next = T::clone(&guard);
        let result = f(&mut next);
        *guard = Arc::new(next);
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureHandle {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
}

pub type TextureMap = BTreeMap<String, TextureHandle>;
pub type UniformBufferMap = BTreeMap<String, Arc<Mutex<UniformBuffer>>>;
pub type VertexBufferMap = BTreeMap<String, Arc<Mutex<GpuBuffer>>>;

/// One combined image sampler to write into a descriptor set.
#[derive(Debug, Clone, Copy)]
pub struct ImageDescriptorWrite {
    pub binding: u32,
    pub array_element: u32,
    pub image: vk::DescriptorImageInfo,
}

/// Descriptor set operations `ObjectGpuState` needs.
pub trait DescriptorBackend {
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet>;

    fn free_descriptor_set(&self, pool: vk::DescriptorPool, set: vk::DescriptorSet) -> Result<()>;

    /// Applies all writes in one update.
    fn write_image_descriptors(&self, set: vk::DescriptorSet, writes: &[ImageDescriptorWrite]);
}

impl DescriptorBackend for VulkanDevice {
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);

        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate descriptor set")?;
        sets.into_iter().next().context("Driver returned no descriptor set")
    }

    fn free_descriptor_set(&self, pool: vk::DescriptorPool, set: vk::DescriptorSet) -> Result<()> {
        unsafe { self.device.free_descriptor_sets(pool, &[set]) }
            .context("Failed to free descriptor set")
    }

    fn write_image_descriptors(&self, set: vk::DescriptorSet, writes: &[ImageDescriptorWrite]) {
        let infos: Vec<[vk::DescriptorImageInfo; 1]> = writes.iter().map(|w| [w.image]).collect();
        let descriptor_writes: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .zip(&infos)
            .map(|(w, info)| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(w.binding)
                    .dst_array_element(w.array_element)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(info)
                    .build()
            })
            .collect();

        unsafe { self.device.update_descriptor_sets(&descriptor_writes, &[]) };
    }
}

/// A pool whose sets can be freed individually, as texture rebinding requires.
pub fn create_descriptor_pool(
    device: &VulkanDevice,
    max_sets: u32,
    sizes: &[vk::DescriptorPoolSize],
) -> Result<vk::DescriptorPool> {
    let pool_info = vk::DescriptorPoolCreateInfo::builder()
        .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
        .max_sets(max_sets)
        .pool_sizes(sizes);

    unsafe { device.device.create_descriptor_pool(&pool_info, None) }
        .context("Failed to create descriptor pool")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrawMode {
    #[default]
    Triangles,
    TriangleStrip,
    Lines,
    LineStrip,
    Points,
}

impl DrawMode {
    pub fn topology(self) -> vk::PrimitiveTopology {
        match self {
            Self::Triangles => vk::PrimitiveTopology::TRIANGLE_LIST,
            Self::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
            Self::Lines => vk::PrimitiveTopology::LINE_LIST,
            Self::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
            Self::Points => vk::PrimitiveTopology::POINT_LIST,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawParams {
    pub mode: DrawMode,
    pub indexed: bool,
    pub index_offset: u32,
    pub index_count: u32,
    pub vertex_count: u32,
    pub instance_count: u32,
}

impl Default for DrawParams {
    fn default() -> Self {
        Self {
            mode: DrawMode::default(),
            indexed: false,
            index_offset: 0,
            index_count: 0,
            vertex_count: 0,
            instance_count: 1,
        }
    }
}

/// Names of the descriptor sets a pipeline over `modules` binds, by set index.
pub fn required_descriptor_sets(modules: &[&ShaderModule]) -> Vec<String> {
    let mut sets: Vec<(u32, String)> = Vec::new();
    for module in modules {
        for (key, spec) in module.specs.iter() {
            let name = match spec.kind {
                DescriptorKind::UniformBuffer => spec.name.clone(),
                DescriptorKind::InputTextures => key.to_string(),
            };
            if !sets.iter().any(|(_, n)| *n == name) {
                sets.push((spec.set, name));
            }
        }
    }
    sets.sort_by_key(|(set, _)| *set);
    sets.into_iter().map(|(_, name)| name).collect()
}

/// Uniform buffer specs across `modules`, first declaration of each name.
pub fn uniform_specs(modules: &[&ShaderModule]) -> Vec<UboSpec> {
    let mut seen = HashSet::new();
    modules
        .iter()
        .flat_map(|m| m.specs.uniform_buffers())
        .filter(|spec| seen.insert(spec.name.clone()))
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Copy)]
struct BoundSet {
    set: vk::DescriptorSet,
    pool: vk::DescriptorPool,
}

/// GPU resources taken out of an [`ObjectGpuState`], for the caller to
/// destroy once the device no longer uses them.
#[derive(Default)]
pub struct DetachedResources {
    pub pipeline: Option<PipelineHandle>,
    pub vertex_buffers: Vec<Arc<Mutex<GpuBuffer>>>,
    pub uniform_buffers: Vec<Arc<Mutex<UniformBuffer>>>,
}

impl DetachedResources {
    pub fn destroy(self, device: &VulkanDevice) -> Result<()> {
        if let Some(pipeline) = self.pipeline {
            pipeline.destroy(device);
        }
        for buffer in &self.vertex_buffers {
            buffer.lock().destroy(device)?;
        }
        for buffer in &self.uniform_buffers {
            buffer.lock().destroy(device)?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct ObjectGpuState {
    pub initialized: bool,
    pub draw: DrawParams,
    pub required_descriptor_sets: Vec<String>,
    pub default_textures_for: HashSet<String>,
    vertex_kind: VertexDataKind,
    vertex_description: Option<VertexDescription>,
    pipeline: Option<PipelineHandle>,
    textures: Snapshot<TextureMap>,
    vertex_buffers: Snapshot<VertexBufferMap>,
    uniform_buffers: Snapshot<UniformBufferMap>,
    texture_set: Option<BoundSet>,
}

impl ObjectGpuState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vertex_kind(&self) -> VertexDataKind {
        self.vertex_kind
    }

    pub fn set_vertex_kind(&mut self, kind: VertexDataKind) {
        self.vertex_kind = kind;
        self.vertex_description = Some(vertex_input_description(kind));
    }

    /// Input description for the current vertex kind.
    pub fn vertex_description(&mut self) -> &VertexDescription {
        let kind = self.vertex_kind;
        self.vertex_description
            .get_or_insert_with(|| vertex_input_description(kind))
    }

    pub fn pipeline(&self) -> Option<&PipelineHandle> {
        self.pipeline.as_ref()
    }

    /// Installs `pipeline`, handing back the one it replaces.
    pub fn set_pipeline(&mut self, pipeline: PipelineHandle) -> Option<PipelineHandle> {
        self.pipeline.replace(pipeline)
    }

    /// Handle loader threads use to publish vertex and index buffers.
    pub fn vertex_buffer_publisher(&self) -> Snapshot<VertexBufferMap> {
        self.vertex_buffers.clone()
    }

    pub fn vertex_buffers(&self) -> Arc<VertexBufferMap> {
        self.vertex_buffers.load()
    }

    pub fn vertex_buffer(&self, name: &str) -> Option<Arc<Mutex<GpuBuffer>>> {
        self.vertex_buffers.load().get(name).cloned()
    }

    /// Publishes `buffer` under `name`. A replaced buffer is returned, since
    /// frames in flight may still read it.
    pub fn set_vertex_buffer(
        &self,
        name: impl Into<String>,
        buffer: GpuBuffer,
    ) -> Option<Arc<Mutex<GpuBuffer>>> {
        let name = name.into();
        self.vertex_buffers
            .update(|map| map.insert(name, Arc::new(Mutex::new(buffer))))
    }

    /// Handle loader threads use to publish textures.
    pub fn texture_publisher(&self) -> Snapshot<TextureMap> {
        self.textures.clone()
    }

    pub fn textures(&self) -> Arc<TextureMap> {
        self.textures.load()
    }

    pub fn set_texture(&self, texture_type: impl Into<String>, texture: TextureHandle) {
        let texture_type = texture_type.into();
        self.textures.update(|map| {
            map.insert(texture_type, texture);
        });
    }

    /// Records that `texture_type` is bound to a renderer-provided fallback.
    pub fn mark_default_texture(&mut self, texture_type: impl Into<String>) {
        self.default_textures_for.insert(texture_type.into());
    }

    pub fn uses_default_texture(&self, texture_type: &str) -> bool {
        self.default_textures_for.contains(texture_type)
    }

    /// Derives the descriptor sets this object binds from its pipeline's modules.
    pub fn configure_for(&mut self, modules: &[&ShaderModule]) {
        self.required_descriptor_sets = required_descriptor_sets(modules);
        log::trace!("Required descriptor sets: {:?}", self.required_descriptor_sets);
    }

    pub fn texture_descriptor_set(&self) -> Option<vk::DescriptorSet> {
        self.texture_set.map(|bound| bound.set)
    }

    /// Binds the current textures into a fresh descriptor set of `layout`.
    ///
    /// The previously bound set goes back to its pool first, so rebinding
    /// never grows pool usage.
    pub fn bind_textures(
        &mut self,
        backend: &dyn DescriptorBackend,
        layout: vk::DescriptorSetLayout,
        pool: vk::DescriptorPool,
        target_binding: u32,
        ctx: &BackendContext,
    ) -> Result<vk::DescriptorSet> {
        self.release_descriptor_set(backend)?;

        let set = backend.allocate_descriptor_set(pool, layout)?;

        let textures = self.textures.load();
        let writes: Vec<ImageDescriptorWrite> = textures
            .iter()
            .map(|(texture_type, texture)| ImageDescriptorWrite {
                binding: target_binding,
                array_element: canonical_slot(texture_type, ctx),
                image: vk::DescriptorImageInfo {
                    sampler: texture.sampler,
                    image_view: texture.view,
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                },
            })
            .collect();
        backend.write_image_descriptors(set, &writes);

        log::trace!(
            "Created texture descriptor set {:?} with {} images, layout {:?}",
            set,
            writes.len(),
            layout
        );

        self.texture_set = Some(BoundSet { set, pool });
        Ok(set)
    }

    /// Returns the texture descriptor set to its pool, if one is held.
    pub fn release_descriptor_set(&mut self, backend: &dyn DescriptorBackend) -> Result<()> {
        if let Some(bound) = self.texture_set.take() {
            backend.free_descriptor_set(bound.pool, bound.set)?;
        }
        Ok(())
    }

    /// Creates buffers for the uniform blocks of `modules` not backed yet.
    pub fn create_uniform_buffers(&mut self, device: &VulkanDevice, modules: &[&ShaderModule]) -> Result<usize> {
        let existing = self.uniform_buffers.load();
        let mut next = UniformBufferMap::clone(&existing);
        let mut created = 0;

        for spec in uniform_specs(modules) {
            if next.contains_key(&spec.name) {
                continue;
            }
            let buffer = UniformBuffer::from_spec(device, &spec)?;
            next.insert(spec.name.clone(), Arc::new(Mutex::new(buffer)));
            created += 1;
        }

        self.uniform_buffers.store(next);
        Ok(created)
    }

    pub fn uniform_buffer(&self, name: &str) -> Option<Arc<Mutex<UniformBuffer>>> {
        self.uniform_buffers.load().get(name).cloned()
    }

    pub fn uniform_buffers(&self) -> Arc<UniformBufferMap> {
        self.uniform_buffers.load()
    }

    /// Returns the descriptor set to its pool and takes the pipeline and all
    /// buffers out of the state. Readers holding an older snapshot keep it.
    pub fn detach(&mut self, backend: &dyn DescriptorBackend) -> Result<DetachedResources> {
        self.release_descriptor_set(backend)?;

        let vertex_buffers = self.vertex_buffers.load();
        self.vertex_buffers.store(VertexBufferMap::new());
        let uniform_buffers = self.uniform_buffers.load();
        self.uniform_buffers.store(UniformBufferMap::new());

        self.initialized = false;
        Ok(DetachedResources {
            pipeline: self.pipeline.take(),
            vertex_buffers: vertex_buffers.values().cloned().collect(),
            uniform_buffers: uniform_buffers.values().cloned().collect(),
        })
    }

    /// Releases the descriptor set, then destroys the pipeline and buffers.
    /// The device must be idle with respect to this object.
    pub fn destroy(&mut self, device: &VulkanDevice) -> Result<()> {
        self.detach(device)?.destroy(device)
    }
}
