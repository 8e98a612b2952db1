// Buffer utilities for vertex, index, uniform and staging buffers
//
// Every buffer owns exactly one dedicated allocation. Memory types are picked
// by a first-fit scan, never by an allocator heuristic.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::Pod;
use std::sync::Arc;
use super::VulkanDevice;
use crate::error::RenderError;

/// A buffer and its backing memory, destroyed together on drop
pub struct GpuBuffer {
    pub handle: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    device: Arc<VulkanDevice>,
}

impl GpuBuffer {
    /// Allocate a buffer whose memory satisfies `memory_properties`.
    ///
    /// Fails with [`RenderError::NoSuitableMemoryType`] when the device has no
    /// memory type with the exact combination requested.
    pub fn new(
        device: &Arc<VulkanDevice>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = unsafe { device.device.create_buffer(&buffer_info, None) }
            .map_err(RenderError::creation("buffer"))?;

        let mem_requirements = unsafe { device.device.get_buffer_memory_requirements(handle) };

        let memory = match allocate_memory(device, &mem_requirements, memory_properties) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.device.destroy_buffer(handle, None) };
                return Err(e);
            }
        };

        if let Err(result) = unsafe { device.device.bind_buffer_memory(handle, memory, 0) } {
            unsafe {
                device.device.free_memory(memory, None);
                device.device.destroy_buffer(handle, None);
            }
            return Err(RenderError::ResourceCreation { what: "buffer memory binding", result }.into());
        }

        Ok(Self {
            handle,
            memory,
            size,
            device: device.clone(),
        })
    }

    /// Copy `data` into a host-visible buffer (map, copy, unmap)
    pub fn write<T: Pod>(&self, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        anyhow::ensure!(
            bytes.len() as vk::DeviceSize <= self.size,
            "write of {} bytes overflows buffer of {} bytes",
            bytes.len(),
            self.size
        );

        unsafe {
            let ptr = self.map()? as *mut u8;
            ptr.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
        }
        self.unmap();

        Ok(())
    }

    /// Map the whole buffer. The mapping stays valid until `unmap`
    /// or until the buffer is dropped.
    pub fn map(&self) -> Result<*mut std::ffi::c_void> {
        unsafe {
            self.device
                .device
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
                .context("Failed to map buffer memory")
        }
    }

    pub fn unmap(&self) {
        unsafe {
            self.device.device.unmap_memory(self.memory);
        }
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_buffer(self.handle, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

/// Allocate one dedicated block matching `requirements` and `properties`
pub(crate) fn allocate_memory(
    device: &VulkanDevice,
    requirements: &vk::MemoryRequirements,
    properties: vk::MemoryPropertyFlags,
) -> Result<vk::DeviceMemory> {
    let memory_type_index = find_memory_type(
        &device.memory_properties,
        requirements.memory_type_bits,
        properties,
    )?;

    let alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);

    let memory = unsafe { device.device.allocate_memory(&alloc_info, None) }
        .map_err(RenderError::creation("device memory"))?;

    Ok(memory)
}

/// First memory type allowed by `type_filter` whose flags contain `required`
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    required: vk::MemoryPropertyFlags,
) -> Result<u32, RenderError> {
    let count = memory_properties.memory_type_count as usize;

    memory_properties.memory_types[..count]
        .iter()
        .enumerate()
        .find(|(i, memory_type)| {
            type_filter & (1 << i) != 0 && memory_type.property_flags.contains(required)
        })
        .map(|(i, _)| i as u32)
        .ok_or(RenderError::NoSuitableMemoryType {
            type_filter,
            required,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = types.len() as u32;
        for (i, &flags) in types.iter().enumerate() {
            props.memory_types[i] = vk::MemoryType {
                property_flags: flags,
                heap_index: 0,
            };
        }
        props
    }

    fn typical_discrete_gpu() -> vk::PhysicalDeviceMemoryProperties {
        memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT
                | vk::MemoryPropertyFlags::HOST_CACHED,
            vk::MemoryPropertyFlags::DEVICE_LOCAL
                | vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
        ])
    }

    #[test]
    fn picks_first_matching_index() {
        let props = typical_discrete_gpu();
        let staging = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        assert_eq!(find_memory_type(&props, 0b1111, staging).unwrap(), 1);
        assert_eq!(
            find_memory_type(&props, 0b1111, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            0
        );
    }

    #[test]
    fn respects_type_filter() {
        let props = typical_discrete_gpu();
        let staging = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        // Type 1 masked out, next superset is type 2
        assert_eq!(find_memory_type(&props, 0b1100, staging).unwrap(), 2);
        // Only the device-local + host-visible type is allowed
        assert_eq!(
            find_memory_type(&props, 0b1000, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            3
        );
    }

    #[test]
    fn superset_flags_match() {
        let props = typical_discrete_gpu();
        assert_eq!(
            find_memory_type(&props, u32::MAX, vk::MemoryPropertyFlags::HOST_CACHED).unwrap(),
            2
        );
        assert_eq!(
            find_memory_type(&props, u32::MAX, vk::MemoryPropertyFlags::empty()).unwrap(),
            0
        );
    }

    #[test]
    fn selection_is_deterministic() {
        let props = typical_discrete_gpu();
        let wanted = vk::MemoryPropertyFlags::HOST_VISIBLE;
        let first = find_memory_type(&props, 0b1110, wanted).unwrap();
        for _ in 0..16 {
            assert_eq!(find_memory_type(&props, 0b1110, wanted).unwrap(), first);
        }
    }

    #[test]
    fn no_relaxation_when_combination_missing() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        ]);
        let wanted = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        let err = find_memory_type(&props, u32::MAX, wanted).unwrap_err();
        assert!(matches!(
            err,
            RenderError::NoSuitableMemoryType { type_filter: u32::MAX, required } if required == wanted
        ));
    }

    #[test]
    fn ignores_types_past_reported_count() {
        let mut props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        props.memory_types[1].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE;

        assert!(find_memory_type(&props, u32::MAX, vk::MemoryPropertyFlags::HOST_VISIBLE).is_err());
    }

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn staging_buffers_do_not_alias() {
        let instance = crate::backend::VulkanInstance::new("buffer-test", false, None).unwrap();
        let device = VulkanDevice::new(instance, None).unwrap();
        let props = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        let a = GpuBuffer::new(&device, 1024, vk::BufferUsageFlags::TRANSFER_SRC, props).unwrap();
        let b = GpuBuffer::new(&device, 1024, vk::BufferUsageFlags::TRANSFER_SRC, props).unwrap();

        assert_ne!(a.handle, b.handle);
        assert_ne!(a.memory, b.memory);
        assert_eq!(a.size, 1024);

        a.write(&[1u8; 1024]).unwrap();
        b.write(&[2u8; 1024]).unwrap();
        unsafe {
            let ptr = a.map().unwrap() as *const u8;
            assert_eq!(*ptr, 1);
        }
        a.unmap();
    }
}
