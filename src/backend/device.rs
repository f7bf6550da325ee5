// Vulkan Device - physical device selection and logical device setup
//
// Responsibilities:
// - Describe every physical device and pick one through a caller predicate
// - Run the device workaround table on the chosen device
// - Group graphics/transfer/compute roles into queue create infos
// - Own the logical device, its queues and the memory allocator
//
// The selection logic lives in plain functions over `DeviceDescriptor`s and
// queue family properties so it can be exercised without a GPU.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::{Mutex, MutexGuard};
use std::ffi::{CStr, CString};
use std::fmt;
use std::sync::Arc;

use super::instance::VulkanInstance;
use super::workarounds::WorkaroundTable;
use crate::config::DeviceConfig;
use crate::context::BackendContext;
use crate::error::BackendError;

const TARGET: &str = "vkscene::device";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Unknown,
    Other,
    IntegratedGpu,
    DiscreteGpu,
    VirtualGpu,
    Cpu,
}

impl DeviceType {
    pub fn from_vk(ty: vk::PhysicalDeviceType) -> Self {
        match ty {
            vk::PhysicalDeviceType::OTHER => Self::Other,
            vk::PhysicalDeviceType::INTEGRATED_GPU => Self::IntegratedGpu,
            vk::PhysicalDeviceType::DISCRETE_GPU => Self::DiscreteGpu,
            vk::PhysicalDeviceType::VIRTUAL_GPU => Self::VirtualGpu,
            vk::PhysicalDeviceType::CPU => Self::Cpu,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "Unknown",
            Self::Other => "Other",
            Self::IntegratedGpu => "IntegratedGPU",
            Self::DiscreteGpu => "DiscreteGPU",
            Self::VirtualGpu => "VirtualGPU",
            Self::Cpu => "CPU",
        };
        f.write_str(name)
    }
}

/// What device selection knows about a physical device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub vendor: String,
    pub name: String,
    pub driver_version: String,
    pub api_version: String,
    pub device_type: DeviceType,
}

impl DeviceDescriptor {
    pub fn from_properties(properties: &vk::PhysicalDeviceProperties) -> Self {
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        Self {
            vendor: vendor_name(properties.vendor_id).to_string(),
            name,
            driver_version: decode_version(properties.driver_version),
            api_version: decode_version(properties.api_version),
            device_type: DeviceType::from_vk(properties.device_type),
        }
    }

    /// Leading component of the driver version string.
    pub fn driver_major(&self) -> Option<u32> {
        self.driver_version.split('.').next()?.parse().ok()
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.vendor, self.name)
    }
}

pub fn vendor_name(vendor_id: u32) -> &'static str {
    match vendor_id {
        0x1002 => "AMD",
        0x10DE => "Nvidia",
        0x8086 => "Intel",
        _ => "(Unknown vendor)",
    }
}

/// `major.minor.patch` with a 10/10/12 bit split, used for driver and API versions.
pub fn decode_version(version: u32) -> String {
    format!(
        "{}.{}.{}",
        version >> 22,
        (version >> 12) & 0x3FF,
        version & 0xFFF
    )
}

pub type DevicePredicate = dyn Fn(usize, &DeviceDescriptor) -> bool + Send + Sync;

/// Index of the device to use: the last one `predicate` accepts, or 0.
pub fn choose_device(
    descriptors: &[DeviceDescriptor],
    predicate: &DevicePredicate,
) -> Result<usize, BackendError> {
    if descriptors.is_empty() {
        return Err(BackendError::NoDevices);
    }

    Ok(descriptors
        .iter()
        .enumerate()
        .filter(|(i, d)| predicate(*i, d))
        .map(|(i, _)| i)
        .last()
        .unwrap_or(0))
}

/// One line per device, in enumeration order, marking `selected`.
pub fn device_listing(descriptors: &[DeviceDescriptor], selected: usize) -> Vec<String> {
    descriptors
        .iter()
        .enumerate()
        .map(|(i, d)| {
            let marker = if i == selected { " (selected)" } else { "" };
            format!(
                "  {}: {} {} ({}, driver version {}, Vulkan API {}){}",
                i, d.vendor, d.name, d.device_type, d.driver_version, d.api_version, marker
            )
        })
        .collect()
}

/// Queue family used for each role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub transfer: u32,
    pub compute: u32,
    /// Presentation support is not queried; always family 0
    pub present: u32,
}

/// Single pass over the families; the last family supporting a role takes it.
pub fn resolve_queue_families(families: &[vk::QueueFamilyProperties]) -> QueueFamilyIndices {
    let mut indices = QueueFamilyIndices::default();

    for (i, family) in families.iter().enumerate() {
        let i = i as u32;
        if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            indices.graphics = i;
        }
        if family.queue_flags.contains(vk::QueueFlags::TRANSFER) {
            indices.transfer = i;
        }
        if family.queue_flags.contains(vk::QueueFlags::COMPUTE) {
            indices.compute = i;
        }
    }

    indices
}

/// Queues requested from one family.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueGroup {
    pub family: u32,
    /// One entry per role sharing the family
    pub priorities: Vec<f32>,
}

impl QueueGroup {
    pub fn count(&self) -> u32 {
        self.priorities.len() as u32
    }
}

/// Groups graphics, transfer and compute by family, in that order of first appearance.
pub fn group_queue_families(indices: &QueueFamilyIndices) -> Vec<QueueGroup> {
    let mut groups: Vec<QueueGroup> = Vec::with_capacity(3);
    for family in [indices.graphics, indices.transfer, indices.compute] {
        match groups.iter_mut().find(|g| g.family == family) {
            Some(group) => group.priorities.push(1.0),
            None => groups.push(QueueGroup {
                family,
                priorities: vec![1.0],
            }),
        }
    }
    groups
}

/// `(family, queue index)` for graphics, transfer and compute. Roles sharing a
/// family take consecutive queues of it.
pub fn queue_slots(indices: &QueueFamilyIndices) -> [(u32, u32); 3] {
    let roles = [indices.graphics, indices.transfer, indices.compute];
    let mut slots = [(0, 0); 3];
    for (i, &family) in roles.iter().enumerate() {
        let taken = roles[..i].iter().filter(|&&f| f == family).count() as u32;
        slots[i] = (family, taken);
    }
    slots
}

/// Memory type indices present in `type_bits` whose flags contain `flags`.
pub fn memory_type_indices(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Vec<u32> {
    (0..properties.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32))
        .filter(|&i| type_bits & (1 << i) != 0)
        .filter(|&i| properties.memory_types[i as usize].property_flags.contains(flags))
        .collect()
}

/// Parameters for [`select_device`].
pub struct DeviceRequest {
    pub predicate: Box<DevicePredicate>,
    pub extensions: Vec<String>,
    pub validation_layers: Vec<String>,
    pub headless: bool,
}

impl DeviceRequest {
    /// Prefers devices whose "<vendor> <name>" contains `preferred_device`.
    pub fn from_config(config: &DeviceConfig) -> Self {
        let preferred = config.preferred_device.clone();
        Self {
            predicate: Box::new(move |_: usize, d: &DeviceDescriptor| {
                !preferred.is_empty() && d.to_string().contains(preferred.as_str())
            }),
            extensions: config.extensions.clone(),
            validation_layers: if config.validation {
                config.validation_layers.clone()
            } else {
                Vec::new()
            },
            headless: config.headless,
        }
    }

    pub fn with_predicate(
        mut self,
        predicate: impl Fn(usize, &DeviceDescriptor) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Box::new(predicate);
        self
    }

    /// Device extensions to enable: swapchain unless headless, then the extras.
    pub fn device_extensions(&self) -> Vec<String> {
        let mut extensions = Vec::with_capacity(self.extensions.len() + 1);
        if !self.headless {
            extensions.push(
                ash::extensions::khr::Swapchain::name()
                    .to_string_lossy()
                    .into_owned(),
            );
        }
        extensions.extend(self.extensions.iter().cloned());
        extensions
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DeviceQueues {
    pub graphics: vk::Queue,
    pub transfer: vk::Queue,
    pub compute: vk::Queue,
}

/// Logical device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Released before the device is destroyed
    allocator: Option<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub descriptor: DeviceDescriptor,
    pub queue_indices: QueueFamilyIndices,
    pub queues: DeviceQueues,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub extensions: Vec<String>,
    closed: bool,
    instance: Arc<VulkanInstance>,
}

/// Selects a physical device and creates the logical device on it, using the
/// built-in workaround table.
pub fn select_device(
    instance: &Arc<VulkanInstance>,
    request: &DeviceRequest,
    ctx: &BackendContext,
) -> Result<VulkanDevice> {
    select_device_with(instance, request, &WorkaroundTable::new(), ctx)
}

pub fn select_device_with(
    instance: &Arc<VulkanInstance>,
    request: &DeviceRequest,
    workarounds: &WorkaroundTable,
    ctx: &BackendContext,
) -> Result<VulkanDevice> {
    let physical_devices = instance.physical_devices()?;

    let descriptors: Vec<DeviceDescriptor> = physical_devices
        .iter()
        .map(|&pd| {
            let properties = unsafe { instance.instance.get_physical_device_properties(pd) };
            DeviceDescriptor::from_properties(&properties)
        })
        .collect();

    let selected = choose_device(&descriptors, request.predicate.as_ref())?;

    log::info!("Physical devices:");
    for line in device_listing(&descriptors, selected) {
        log::info!("{}", line);
    }

    let descriptor = descriptors[selected].clone();
    workarounds.apply(&descriptor, ctx)?;

    VulkanDevice::create(
        Arc::clone(instance),
        physical_devices[selected],
        descriptor,
        request,
        ctx,
    )
}

impl VulkanDevice {
    fn create(
        instance: Arc<VulkanInstance>,
        physical_device: vk::PhysicalDevice,
        descriptor: DeviceDescriptor,
        request: &DeviceRequest,
        ctx: &BackendContext,
    ) -> Result<Self> {
        let families = unsafe {
            instance
                .instance
                .get_physical_device_queue_family_properties(physical_device)
        };
        let queue_indices = resolve_queue_families(&families);
        let groups = group_queue_families(&queue_indices);

        log::info!("Creating {} distinct queue groups", groups.len());
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = groups
            .iter()
            .map(|group| {
                log::debug!(
                    "Adding queue with family index {}, size {}",
                    group.family,
                    group.count()
                );
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(group.family)
                    .queue_priorities(&group.priorities)
                    .build()
            })
            .collect();

        let extensions = request.device_extensions();
        log::debug!("Requested extensions: {}", extensions.join(", "));
        let extension_names = to_cstrings(&extensions).context("Invalid device extension name")?;
        let extension_ptrs: Vec<_> = extension_names.iter().map(|e| e.as_ptr()).collect();

        if !request.validation_layers.is_empty() {
            ctx.warn(TARGET, "Enabled Vulkan API validations. Expect degraded performance.");
        }
        let layer_names =
            to_cstrings(&request.validation_layers).context("Invalid validation layer name")?;
        let layer_ptrs: Vec<_> = layer_names.iter().map(|l| l.as_ptr()).collect();

        let features = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(true)
            .large_points(true)
            .geometry_shader(true);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_ptrs)
            .enabled_layer_names(&layer_ptrs)
            .enabled_features(&features);

        log::debug!("Creating device...");
        let device = unsafe {
            instance
                .instance
                .create_device(physical_device, &create_info, None)
        }
        .map_err(BackendError::DeviceCreation)?;

        let memory_properties = unsafe {
            instance
                .instance
                .get_physical_device_memory_properties(physical_device)
        };

        let [graphics, transfer, compute] =
            queue_slots(&queue_indices).map(|(family, index)| unsafe { device.get_device_queue(family, index) });

        let allocator = match Allocator::new(&AllocatorCreateDesc {
            instance: instance.instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        }) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e).context("Failed to create memory allocator");
            }
        };

        log::debug!("Created logical Vulkan device on {}", descriptor);

        Ok(Self {
            allocator: Some(Mutex::new(allocator)),
            device,
            physical_device,
            descriptor,
            queue_indices,
            queues: DeviceQueues {
                graphics,
                transfer,
                compute,
            },
            memory_properties,
            extensions,
            closed: false,
            instance,
        })
    }

    pub fn instance(&self) -> &Arc<VulkanInstance> {
        &self.instance
    }

    pub fn allocator(&self) -> Result<MutexGuard<'_, Allocator>> {
        self.allocator
            .as_ref()
            .map(|a| a.lock())
            .context("Memory allocator already released")
    }

    /// Memory types bearing `type_bits` and `flags`; may be empty.
    pub fn memory_types(&self, type_bits: u32, flags: vk::MemoryPropertyFlags) -> Vec<u32> {
        let types = memory_type_indices(&self.memory_properties, type_bits, flags);
        if types.is_empty() {
            log::warn!("Memory type {:?} not found for device {}", flags, self.descriptor);
        }
        types
    }

    /// Command pool for `family` whose buffers can be reset individually.
    pub fn create_command_pool(&self, family: u32) -> Result<vk::CommandPool> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = unsafe { self.device.create_command_pool(&pool_info, None) }
            .map_err(|result| BackendError::CommandPool { family, result })?;
        Ok(pool)
    }

    pub fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }

    /// Waits for the device, releases the allocator and destroys the device.
    pub fn close(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        log::debug!("Closing device {}...", self.descriptor);
        if let Err(e) = self.wait_idle() {
            log::warn!("Device wait failed during teardown: {:#}", e);
        }
        drop(self.allocator.take());
        unsafe { self.device.destroy_device(None) };
        log::debug!("Device closed.");
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Display for VulkanDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.descriptor.fmt(f)
    }
}

fn to_cstrings(names: &[String]) -> Result<Vec<CString>> {
    names
        .iter()
        .map(|n| CString::new(n.as_str()).with_context(|| format!("'{}' contains a NUL byte", n)))
        .collect()
}
