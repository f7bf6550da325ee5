// =============================================================================
// VKSCENE - backend diagnostics
// =============================================================================
//
// Small front end over the library:
//   devices    list physical devices and bring up a logical device
//   reflect    compile if needed, then print the reflected descriptor layout
//   transpile  print the desktop GLSL the legacy backend would use
//
// =============================================================================

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

use vkscene::backend::{select_device, DeviceRequest, VulkanInstance};
use vkscene::shader::{
    cross_compile, DescriptorKind, ShaderModule, ShaderReflector, ShaderWatcher,
    SpirvCrossEmitter,
};
use vkscene::{BackendContext, Config};

#[derive(Debug, Parser)]
#[command(name = "vkscene", version, about = "Vulkan backend diagnostics")]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List physical devices and create a logical device on the selected one
    Devices {
        /// Do not request the swapchain extension
        #[arg(long)]
        headless: bool,
    },
    /// Load a shader and print its reflected layout
    Reflect {
        path: PathBuf,
        /// Directory searched before the configured default root
        #[arg(long)]
        owner: Option<PathBuf>,
        /// Keep running and reprint whenever the shader changes
        #[arg(long)]
        watch: bool,
    },
    /// Cross-compile a shader to desktop GLSL
    Transpile {
        path: PathBuf,
        #[arg(long)]
        owner: Option<PathBuf>,
    },
}

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = init_logging();
    let config = Config::load(&cli.config);
    if !env_filter {
        log::set_max_level(config.log_level());
    }

    match cli.command {
        Command::Devices { headless } => devices(config, headless),
        Command::Reflect { path, owner, watch } => reflect(config, &path, owner.as_deref(), watch),
        Command::Transpile { path, owner } => transpile(config, &path, owner.as_deref()),
    }
}

/// Initialize logging before the config is read, at info until the configured
/// level is known. Returns true when `RUST_LOG` governs filtering.
fn init_logging() -> bool {
    use env_logger::Builder;
    use log::LevelFilter;

    let env_filter = std::env::var_os("RUST_LOG").is_some();
    let mut builder = Builder::from_default_env();
    if !env_filter {
        // the global max level does the filtering from here on
        builder.filter_level(LevelFilter::Trace);
    }
    builder.init();
    if !env_filter {
        log::set_max_level(LevelFilter::Info);
    }
    env_filter
}

fn devices(mut config: Config, headless: bool) -> Result<()> {
    config.device.headless |= headless;

    let instance = VulkanInstance::new("vkscene", &config.device)?;
    let request = DeviceRequest::from_config(&config.device);
    let ctx = BackendContext::new(config);

    let device = select_device(&instance, &request, &ctx)?;
    println!("Selected {} ({})", device, device.descriptor.device_type);
    println!(
        "Queue families: graphics={} transfer={} compute={}",
        device.queue_indices.graphics, device.queue_indices.transfer, device.queue_indices.compute
    );
    println!("Extensions: {}", device.extensions.join(", "));

    let pool = device.create_command_pool(device.queue_indices.graphics)?;
    device.destroy_command_pool(pool);

    device.close();
    Ok(())
}

fn print_module(module: &ShaderModule) {
    println!(
        "{} ({:?}, {} words{})",
        module.path.display(),
        module.stage,
        module.bytecode.len(),
        if module.is_usable() { "" } else { ", compilation failed" }
    );

    for (key, spec) in module.specs.iter() {
        match spec.kind {
            DescriptorKind::UniformBuffer => {
                println!("  {}: set={} binding={} size={}", key, spec.set, spec.binding, spec.size());
                for member in &spec.members {
                    println!(
                        "    [{}] {} offset={} range={}",
                        member.index, member.name, member.offset, member.range
                    );
                }
            }
            DescriptorKind::InputTextures => {
                println!("  {}: {} set={} binding={}", key, spec.name, spec.set, spec.binding);
            }
        }
    }

    if !module.stage_inputs.is_empty() {
        println!("  inputs: {}", module.stage_inputs.join(", "));
    }
}

fn reflect(config: Config, path: &Path, owner: Option<&Path>, watch: bool) -> Result<()> {
    let watch = watch || config.shaders.watch;
    let ctx = BackendContext::new(config);
    let reflector = ShaderReflector::new(ctx);

    let module = reflector.load(path, owner)?;
    print_module(&module);
    if !watch {
        return Ok(());
    }

    let roots: Vec<&Path> = owner.into_iter().chain(Some(reflector.default_root())).collect();
    let watcher = ShaderWatcher::new(&roots)?;
    log::info!("Watching for changes, press Ctrl-C to stop");

    loop {
        std::thread::sleep(Duration::from_millis(250));
        if reflector.invalidate_stale(&watcher) == 0 {
            continue;
        }
        match reflector.load(path, owner) {
            Ok(module) => print_module(&module),
            Err(e) => log::error!("{:#}", e),
        }
    }
}

fn transpile(config: Config, path: &Path, owner: Option<&Path>) -> Result<()> {
    let emitter = SpirvCrossEmitter::new(config.shaders.cross_compiler.clone());
    let version = config.shaders.legacy_glsl_version;
    let ctx = BackendContext::new(config);

    let module = ShaderReflector::new(ctx.clone()).load(path, owner)?;
    let shader = cross_compile(&module, &emitter, version, &ctx)?;
    print!("{}", shader.source);
    Ok(())
}
