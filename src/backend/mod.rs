// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash. Selection and layout logic is kept in plain
// functions; the wrappers only own handles and forward to them.

pub mod buffer;
pub mod device;
pub mod instance;
pub mod object_state;
pub mod pipeline;
pub mod shader;
pub mod workarounds;

pub use buffer::{GpuBuffer, UniformBuffer};
pub use device::{
    select_device, select_device_with, DeviceDescriptor, DeviceRequest, DeviceType,
    QueueFamilyIndices, VulkanDevice,
};
pub use instance::VulkanInstance;
pub use object_state::{
    canonical_slot, DescriptorBackend, DetachedResources, ObjectGpuState, TextureHandle,
};
pub use pipeline::{PipelineHandle, VertexDataKind, VertexDescription};
pub use workarounds::{DeviceWorkaround, WorkaroundTable};
