use ash::vk::{self, Handle};
use pretty_assertions::assert_eq;
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use vkscene::backend::device::{choose_device, group_queue_families, resolve_queue_families};
use vkscene::backend::object_state::ImageDescriptorWrite;
use vkscene::backend::{
    canonical_slot, DescriptorBackend, DeviceDescriptor, DeviceType, ObjectGpuState, TextureHandle,
};
use vkscene::shader::spirv::{BufferRange, SampledImageResource, UniformBufferResource};
use vkscene::shader::{
    strip_layout_qualifiers, BytecodeIntrospector, CompileError, ShaderCompiler, ShaderReflector,
    ShaderResources, ShaderStage, SpirvError,
};
use vkscene::{BackendContext, BackendError, Config, RecordingDiagnostics};

fn recording(config: Config) -> (BackendContext, Arc<RecordingDiagnostics>) {
    let sink = Arc::new(RecordingDiagnostics::new());
    (BackendContext::with_diagnostics(config, sink.clone()), sink)
}

/// Emits one placeholder word per source; layout comes from `CannedIntrospector`.
struct PlaceholderCompiler;

impl ShaderCompiler for PlaceholderCompiler {
    fn compile(&self, _source: &str, _stage: ShaderStage, _origin: &Path) -> Result<Vec<u32>, CompileError> {
        Ok(vec![0x0723_0203])
    }
}

struct CannedIntrospector(ShaderResources);

impl BytecodeIntrospector for CannedIntrospector {
    fn introspect(&self, _bytecode: &[u32]) -> Result<ShaderResources, SpirvError> {
        Ok(self.0.clone())
    }
}

fn range(index: u32, name: &str, offset: u32) -> BufferRange {
    BufferRange {
        index,
        name: name.into(),
        offset,
        range: 64,
    }
}

#[test]
fn vertex_and_fragment_reflect_the_same_matrices() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("scene.vert"), "void main() {}").unwrap();
    std::fs::write(root.path().join("scene.frag"), "void main() {}").unwrap();

    let resources = ShaderResources {
        uniform_buffers: vec![UniformBufferResource {
            name: "Matrices".into(),
            set: 0,
            binding: 0,
            active_ranges: vec![range(2, "proj", 128), range(0, "model", 0), range(1, "view", 64)],
        }],
        sampled_images: vec![SampledImageResource {
            name: "ObjectTextures".into(),
            set: 1,
            binding: 0,
        }],
        stage_inputs: vec!["vertexPosition".into()],
    };

    let mut config = Config::default();
    config.shaders.default_root = root.path().to_path_buf();
    let (ctx, sink) = recording(config);
    let reflector = ShaderReflector::with_services(
        ctx,
        Arc::new(PlaceholderCompiler),
        Arc::new(CannedIntrospector(resources)),
    );

    for name in ["scene.vert", "scene.frag"] {
        let module = reflector.load(name, None).unwrap();
        let matrices = module.ubo("Matrices").unwrap();
        let names: Vec<_> = matrices.members.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["model", "view", "proj"]);
        assert!(matrices
            .members
            .windows(2)
            .all(|w| w[0].offset + w[0].range <= w[1].offset));
        assert_eq!(module.specs.len(), 1);
    }
    assert!(sink.entries().is_empty());
}

#[test]
fn missing_shader_is_reported() {
    let root = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.shaders.default_root = root.path().to_path_buf();

    let reflector = ShaderReflector::new(BackendContext::new(config));
    let err = reflector.load("absent.frag.spv", None).unwrap_err();
    assert!(matches!(err.downcast_ref::<BackendError>(), Some(BackendError::ShaderNotFound(_))));
}

#[test]
fn config_drives_workaround_switch_and_levels() {
    let config = Config::from_toml(
        r#"
        [device]
        disable_workarounds = true
        validation = true

        [logging]
        level = "trace"
        "#,
    )
    .unwrap();

    assert!(config.device.disable_workarounds);
    assert_eq!(config.enabled_validation_layers(), vec!["VK_LAYER_KHRONOS_validation".to_string()]);
    assert_eq!(config.log_level(), log::LevelFilter::Trace);
}

#[test]
fn cross_compiled_source_loses_descriptor_sets() {
    let glsl = "#version 410\n\
                layout(set = 0, binding = 0, std140) uniform Matrices { mat4 model; } ubo;\n\
                layout(set = 1, binding = 0) uniform sampler2D ObjectTextures[6];\n\
                layout(location = 0) out vec4 fragColor;\n";
    let expected = "#version 410\n\
                    layout(std140) uniform Matrices { mat4 model; } ubo;\n\
                    uniform sampler2D ObjectTextures[6];\n\
                    layout(location = 0) out vec4 fragColor;\n";
    assert_eq!(strip_layout_qualifiers(glsl), expected);
}

#[test]
fn device_and_queue_selection() {
    let gpu = |vendor: &str| DeviceDescriptor {
        vendor: vendor.into(),
        name: "GPU".into(),
        driver_version: "1.0.0".into(),
        api_version: "1.3.0".into(),
        device_type: DeviceType::DiscreteGpu,
    };
    let devices = [gpu("AMD"), gpu("Intel"), gpu("AMD")];
    let amd = |_: usize, d: &DeviceDescriptor| d.vendor == "AMD";
    assert_eq!(choose_device(&devices, &amd).unwrap(), 2);
    assert!(matches!(choose_device(&[], &amd), Err(BackendError::NoDevices)));

    let families = [
        vk::QueueFamilyProperties {
            queue_flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            queue_count: 16,
            ..Default::default()
        },
        vk::QueueFamilyProperties {
            queue_flags: vk::QueueFlags::TRANSFER,
            queue_count: 2,
            ..Default::default()
        },
    ];
    let groups = group_queue_families(&resolve_queue_families(&families));
    let shape: Vec<_> = groups.iter().map(|g| (g.family, g.priorities.clone())).collect();
    assert_eq!(shape, vec![(0, vec![1.0, 1.0]), (1, vec![1.0])]);
}

#[derive(Default)]
struct CountingPool {
    next: Cell<u64>,
    live: RefCell<HashSet<u64>>,
}

impl DescriptorBackend for CountingPool {
    fn allocate_descriptor_set(
        &self,
        _pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> anyhow::Result<vk::DescriptorSet> {
        self.next.set(self.next.get() + 1);
        self.live.borrow_mut().insert(self.next.get());
        Ok(vk::DescriptorSet::from_raw(self.next.get()))
    }

    fn free_descriptor_set(&self, _pool: vk::DescriptorPool, set: vk::DescriptorSet) -> anyhow::Result<()> {
        self.live.borrow_mut().remove(&set.as_raw());
        Ok(())
    }

    fn write_image_descriptors(&self, _set: vk::DescriptorSet, _writes: &[ImageDescriptorWrite]) {}
}

#[test]
fn texture_rebinding_does_not_leak_sets() {
    let (ctx, sink) = recording(Config::default());
    let pool = CountingPool::default();
    let mut state = ObjectGpuState::new();

    let handle = TextureHandle {
        image: vk::Image::from_raw(1),
        view: vk::ImageView::from_raw(2),
        sampler: vk::Sampler::from_raw(3),
    };
    state.set_texture("diffuse", handle);
    state.set_texture("glow", handle);

    for _ in 0..25 {
        state
            .bind_textures(&pool, vk::DescriptorSetLayout::null(), vk::DescriptorPool::null(), 0, &ctx)
            .unwrap();
    }
    assert_eq!(pool.live.borrow().len(), 1);
    assert_eq!(pool.next.get(), 25);

    // one warning per bind for the unknown type
    assert_eq!(sink.warnings().len(), 25);
    assert_eq!(canonical_slot("displacement", &ctx), 5);
}
