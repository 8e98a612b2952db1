// Per-frame uniform buffers and the descriptor sets that expose them
//
// Binding 0: uniform buffer (vertex stage)
// Binding 1: combined image sampler (fragment stage)

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use std::sync::Arc;
use super::texture::Texture;
use super::{GpuBuffer, VulkanDevice};
use crate::error::RenderError;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct UniformBufferObject {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

impl UniformBufferObject {
    /// Mesh spinning about Z at 90 degrees per second, camera at (2, 2, 2)
    pub fn spinning(seconds: f32, aspect: f32) -> Self {
        let model = Mat4::from_rotation_z(seconds * 90f32.to_radians());
        let view = Mat4::look_at_rh(Vec3::splat(2.0), Vec3::ZERO, Vec3::Z);

        // glam targets GL clip space; Vulkan's Y points down
        let mut proj = Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 10.0);
        proj.y_axis.y *= -1.0;

        Self { model, view, proj }
    }
}

/// Host-visible uniform buffer, mapped for its whole lifetime
pub struct UniformBuffer {
    pub buffer: GpuBuffer,
    mapped: *mut UniformBufferObject,
}

impl UniformBuffer {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let buffer = GpuBuffer::new(
            device,
            std::mem::size_of::<UniformBufferObject>() as vk::DeviceSize,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .context("Failed to create uniform buffer")?;
        let mapped = buffer.map()? as *mut UniformBufferObject;

        Ok(Self { buffer, mapped })
    }

    /// Only call once the owning frame slot's fence has signaled
    pub fn write(&mut self, ubo: &UniformBufferObject) {
        unsafe { self.mapped.write_unaligned(*ubo) };
    }
}

impl Drop for UniformBuffer {
    fn drop(&mut self) {
        self.buffer.unmap();
    }
}

pub struct FrameDescriptors {
    pub layout: vk::DescriptorSetLayout,
    pub sets: Vec<vk::DescriptorSet>,
    pool: vk::DescriptorPool,
    device: Arc<VulkanDevice>,
}

impl FrameDescriptors {
    /// One set per uniform buffer, all sampling the same texture
    pub fn new(device: &Arc<VulkanDevice>, uniforms: &[UniformBuffer], texture: &Texture) -> Result<Self> {
        let count = uniforms.len() as u32;
        let layout = create_set_layout(device)?;

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: count,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: count,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&pool_sizes)
            .max_sets(count);

        let pool = match unsafe { device.device.create_descriptor_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(result) => {
                unsafe { device.device.destroy_descriptor_set_layout(layout, None) };
                return Err(RenderError::ResourceCreation { what: "descriptor pool", result }.into());
            }
        };

        // From here on Drop cleans up the pool and layout
        let mut descriptors = Self {
            layout,
            sets: Vec::new(),
            pool,
            device: device.clone(),
        };

        let layouts = vec![layout; uniforms.len()];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        descriptors.sets = unsafe { device.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(RenderError::creation("descriptor sets"))?;

        for (&set, uniform) in descriptors.sets.iter().zip(uniforms) {
            let buffer_info = [vk::DescriptorBufferInfo {
                buffer: uniform.buffer.handle,
                offset: 0,
                range: uniform.buffer.size,
            }];
            let image_info = [vk::DescriptorImageInfo {
                sampler: texture.sampler,
                image_view: texture.view,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }];

            let writes = [
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(0)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(&buffer_info)
                    .build(),
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(1)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(&image_info)
                    .build(),
            ];

            unsafe { device.device.update_descriptor_sets(&writes, &[]) };
        }

        Ok(descriptors)
    }
}

impl Drop for FrameDescriptors {
    fn drop(&mut self) {
        unsafe {
            // Sets go with the pool
            self.device.device.destroy_descriptor_pool(self.pool, None);
            self.device.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

fn create_set_layout(device: &VulkanDevice) -> Result<vk::DescriptorSetLayout> {
    let bindings = [
        vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .build(),
        vk::DescriptorSetLayoutBinding::builder()
            .binding(1)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .build(),
    ];
    let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);

    let layout = unsafe { device.device.create_descriptor_set_layout(&layout_info, None) }
        .map_err(RenderError::creation("descriptor set layout"))?;

    Ok(layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    #[test]
    fn uniform_block_is_three_matrices() {
        assert_eq!(std::mem::size_of::<UniformBufferObject>(), 3 * 64);
    }

    #[test]
    fn model_turns_a_quarter_per_second() {
        let at_zero = UniformBufferObject::spinning(0.0, 1.0);
        assert!(at_zero.model.abs_diff_eq(Mat4::IDENTITY, 1e-6));

        let at_one = UniformBufferObject::spinning(1.0, 1.0);
        let x = at_one.model * Vec4::X;
        assert!(x.abs_diff_eq(Vec4::Y, 1e-6));
    }

    #[test]
    fn projection_flips_y_for_vulkan() {
        let ubo = UniformBufferObject::spinning(0.0, 16.0 / 9.0);
        assert!(ubo.proj.y_axis.y < 0.0);
        assert!(ubo.proj.x_axis.x > 0.0);

        // Origin sits in front of the camera
        let eye_space = ubo.view * Vec4::W;
        assert!(eye_space.z < 0.0);
    }
}
