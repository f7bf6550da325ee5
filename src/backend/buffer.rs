// Object buffers
//
// Host-visible buffers sub-allocated through gpu-allocator: uniform buffers
// backing reflected UBO specs, and vertex/index buffers. Uniform member writes
// are checked against the reflected byte ranges.

use anyhow::{bail, Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::ops::Range;

use super::VulkanDevice;
use crate::shader::UboSpec;

/// std140 base alignment of a uniform block.
const UBO_ALIGNMENT: u64 = 16;

/// `size` rounded up to the block alignment, never zero.
pub fn aligned_ubo_size(size: u64) -> u64 {
    size.max(1).div_ceil(UBO_ALIGNMENT) * UBO_ALIGNMENT
}

/// Byte range of `member` in `spec` for a write of `len` bytes.
pub fn member_write_range(spec: &UboSpec, member: &str, len: usize) -> Result<Range<usize>> {
    let Some(m) = spec.member(member) else {
        bail!("{} has no active member '{}'", spec.name, member);
    };
    if len as u64 > u64::from(m.range) {
        bail!(
            "{}.{} holds {} bytes, got {}",
            spec.name,
            member,
            m.range,
            len
        );
    }
    let start = m.offset as usize;
    Ok(start..start + len)
}

/// Creates a host-visible buffer of `size` bytes and binds freshly allocated
/// memory to it. Nothing is leaked on failure.
fn create_host_buffer(
    device: &VulkanDevice,
    name: &str,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
) -> Result<(vk::Buffer, Allocation)> {
    let buffer_info = vk::BufferCreateInfo::builder()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = unsafe {
        device
            .device
            .create_buffer(&buffer_info, None)
            .with_context(|| format!("Failed to create buffer {}", name))?
    };

    let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };
    let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
    if device.memory_types(requirements.memory_type_bits, host).is_empty() {
        unsafe { device.device.destroy_buffer(buffer, None) };
        bail!("No host-visible memory for buffer {}", name);
    }

    let allocation = device.allocator().and_then(|mut allocator| {
        allocator
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: MemoryLocation::CpuToGpu,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .with_context(|| format!("Failed to allocate memory for {}", name))
    });
    let allocation = match allocation {
        Ok(allocation) => allocation,
        Err(e) => {
            unsafe { device.device.destroy_buffer(buffer, None) };
            return Err(e);
        }
    };

    let bound = unsafe {
        device
            .device
            .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
    };
    if let Err(e) = bound {
        if let Ok(mut allocator) = device.allocator() {
            let _ = allocator.free(allocation);
        }
        unsafe { device.device.destroy_buffer(buffer, None) };
        return Err(e).with_context(|| format!("Failed to bind memory for {}", name));
    }

    Ok((buffer, allocation))
}

fn mapped_write(allocation: Option<&mut Allocation>, name: &str, offset: usize, bytes: &[u8]) -> Result<()> {
    let mapped = allocation
        .and_then(|a| a.mapped_slice_mut())
        .with_context(|| format!("{} is not mapped", name))?;

    let Some(target) = offset
        .checked_add(bytes.len())
        .and_then(|end| mapped.get_mut(offset..end))
    else {
        bail!("Write of {} bytes at {} overflows {}", bytes.len(), offset, name);
    };
    target.copy_from_slice(bytes);
    Ok(())
}

fn free_host_buffer(
    device: &VulkanDevice,
    name: &str,
    buffer: &mut vk::Buffer,
    allocation: &mut Option<Allocation>,
) -> Result<()> {
    let Some(allocation) = allocation.take() else {
        return Ok(());
    };
    device
        .allocator()?
        .free(allocation)
        .with_context(|| format!("Failed to free buffer {}", name))?;
    unsafe { device.device.destroy_buffer(*buffer, None) };
    *buffer = vk::Buffer::null();
    Ok(())
}

/// Vertex or index data for one object.
pub struct GpuBuffer {
    pub name: String,
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    allocation: Option<Allocation>,
}

impl GpuBuffer {
    /// Host-visible buffer holding a copy of `data`.
    pub fn with_data(
        device: &VulkanDevice,
        name: &str,
        usage: vk::BufferUsageFlags,
        data: &[u8],
    ) -> Result<Self> {
        if data.is_empty() {
            bail!("Buffer {} would be empty", name);
        }
        let size = data.len() as vk::DeviceSize;
        let (buffer, allocation) = create_host_buffer(device, name, size, usage)?;

        let mut created = Self {
            name: name.to_string(),
            buffer,
            size,
            usage,
            allocation: Some(allocation),
        };
        if let Err(e) = mapped_write(created.allocation.as_mut(), name, 0, data) {
            created.destroy(device)?;
            return Err(e);
        }

        log::trace!("Created buffer {} ({} bytes, {:?})", name, size, usage);
        Ok(created)
    }

    /// Buffer with no memory behind it, for state bookkeeping in tests.
    #[cfg(test)]
    pub(crate) fn detached(name: &str, buffer: vk::Buffer, size: vk::DeviceSize) -> Self {
        Self {
            name: name.to_string(),
            buffer,
            size,
            usage: vk::BufferUsageFlags::VERTEX_BUFFER,
            allocation: None,
        }
    }

    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        mapped_write(self.allocation.as_mut(), &self.name, offset, bytes)
    }

    /// Frees the memory and the buffer. Safe to call twice.
    pub fn destroy(&mut self, device: &VulkanDevice) -> Result<()> {
        free_host_buffer(device, &self.name, &mut self.buffer, &mut self.allocation)
    }
}

pub struct UniformBuffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    pub spec: UboSpec,
    allocation: Option<Allocation>,
}

impl UniformBuffer {
    /// Buffer large enough for every active member of `spec`.
    pub fn from_spec(device: &VulkanDevice, spec: &UboSpec) -> Result<Self> {
        let size = aligned_ubo_size(spec.size());
        let (buffer, allocation) =
            create_host_buffer(device, &spec.name, size, vk::BufferUsageFlags::UNIFORM_BUFFER)?;

        log::trace!("Created uniform buffer {} ({} bytes)", spec.name, size);

        Ok(Self {
            buffer,
            size,
            spec: spec.clone(),
            allocation: Some(allocation),
        })
    }

    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        mapped_write(self.allocation.as_mut(), &self.spec.name, offset, bytes)
    }

    /// Writes `bytes` into the reflected range of `member`.
    pub fn write_member(&mut self, member: &str, bytes: &[u8]) -> Result<()> {
        let range = member_write_range(&self.spec, member, bytes.len())?;
        self.write(range.start, bytes)
    }

    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.buffer,
            offset: 0,
            range: self.size,
        }
    }

    /// Frees the memory and the buffer. Safe to call twice.
    pub fn destroy(&mut self, device: &VulkanDevice) -> Result<()> {
        free_host_buffer(device, &self.spec.name, &mut self.buffer, &mut self.allocation)
    }
}
