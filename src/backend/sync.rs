// Synchronization primitives
//
// One FrameSlot per frame in flight. The slot's fence is the only thing that
// says whether its command buffer (and uniform buffer) may be touched again.

use anyhow::Result;
use ash::vk;
use super::VulkanDevice;
use crate::error::RenderError;

pub struct FrameSlot {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
    pub command_buffer: vk::CommandBuffer,
}

impl FrameSlot {
    /// Create `count` slots with command buffers from `pool`.
    ///
    /// Fences start signaled so the first wait on each slot returns at once.
    pub fn create_all(device: &VulkanDevice, pool: vk::CommandPool, count: usize) -> Result<Vec<Self>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count as u32);

        let command_buffers = unsafe { device.device.allocate_command_buffers(&alloc_info) }
            .map_err(RenderError::creation("frame command buffers"))?;

        let mut slots = Vec::with_capacity(count);
        for command_buffer in command_buffers {
            match Self::new(device, command_buffer) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    for slot in &slots {
                        slot.destroy(&device.device);
                    }
                    return Err(e);
                }
            }
        }

        Ok(slots)
    }

    fn new(device: &VulkanDevice, command_buffer: vk::CommandBuffer) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder()
            .flags(vk::FenceCreateFlags::SIGNALED);

        unsafe {
            let image_available = device.device.create_semaphore(&semaphore_info, None)
                .map_err(RenderError::creation("image-available semaphore"))?;
            let render_finished = match device.device.create_semaphore(&semaphore_info, None) {
                Ok(semaphore) => semaphore,
                Err(result) => {
                    device.device.destroy_semaphore(image_available, None);
                    return Err(RenderError::ResourceCreation { what: "render-finished semaphore", result }.into());
                }
            };
            let in_flight_fence = match device.device.create_fence(&fence_info, None) {
                Ok(fence) => fence,
                Err(result) => {
                    device.device.destroy_semaphore(image_available, None);
                    device.device.destroy_semaphore(render_finished, None);
                    return Err(RenderError::ResourceCreation { what: "in-flight fence", result }.into());
                }
            };

            Ok(Self {
                image_available,
                render_finished,
                in_flight_fence,
                command_buffer,
            })
        }
    }

    /// Command buffers are freed with their pool
    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}
