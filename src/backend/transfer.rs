// Transfer engine - host to device uploads and layout transitions
//
// Setup-time only. Every operation records into a one-shot command buffer,
// submits it, and blocks until the queue drains before returning, so callers
// never have to reason about overlap with later GPU work.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::Pod;
use std::sync::Arc;
use super::image::{GpuImage, LayoutTransition};
use super::{GpuBuffer, VulkanDevice};
use crate::error::RenderError;

pub struct TransferEngine {
    pool: vk::CommandPool,
    device: Arc<VulkanDevice>,
}

/// A command buffer in the recording state
pub struct CommandRecorder<'a> {
    pub device: &'a ash::Device,
    pub cmd: vk::CommandBuffer,
}

impl<'a> CommandRecorder<'a> {
    /// Record the barrier for `transition` over `level_count` mips starting at `base_level`
    pub fn image_barrier(
        &mut self,
        image: vk::Image,
        base_level: u32,
        level_count: u32,
        transition: LayoutTransition,
    ) {
        let (old_layout, new_layout) = transition.layouts();
        let scope = transition.scope();

        let barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(scope.src_access)
            .dst_access_mask(scope.dst_access)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: base_level,
                level_count,
                base_array_layer: 0,
                layer_count: 1,
            })
            .build();

        unsafe {
            self.device.cmd_pipeline_barrier(
                self.cmd,
                scope.src_stage,
                scope.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }
}

impl TransferEngine {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .map_err(RenderError::creation("transfer command pool"))?;

        Ok(Self {
            pool,
            device: device.clone(),
        })
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    /// Record with `record`, submit, and wait for the queue to go idle.
    ///
    /// The command buffer is freed whether or not recording succeeded.
    pub fn one_shot<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&mut CommandRecorder<'_>) -> Result<()>,
    {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let cmd = unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
            .map_err(RenderError::creation("one-shot command buffer"))?
            .into_iter()
            .next()
            .context("Driver returned no command buffer")?;

        let result = self.record_and_wait(cmd, record);

        unsafe {
            self.device.device.free_command_buffers(self.pool, &[cmd]);
        }

        result
    }

    fn record_and_wait<F>(&self, cmd: vk::CommandBuffer, record: F) -> Result<()>
    where
        F: FnOnce(&mut CommandRecorder<'_>) -> Result<()>,
    {
        let device = &self.device.device;

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe { device.begin_command_buffer(cmd, &begin_info) }
            .context("Failed to begin one-shot command buffer")?;

        record(&mut CommandRecorder { device, cmd })?;

        unsafe { device.end_command_buffer(cmd) }
            .context("Failed to end one-shot command buffer")?;

        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);

        unsafe {
            device
                .queue_submit(self.device.graphics_queue, &[submit_info.build()], vk::Fence::null())
                .map_err(RenderError::Submission)?;
            device
                .queue_wait_idle(self.device.graphics_queue)
                .map_err(RenderError::Submission)?;
        }

        Ok(())
    }

    /// Host-visible, coherent buffer filled with `bytes`, ready to copy from
    fn staging_buffer(&self, bytes: &[u8]) -> Result<GpuBuffer> {
        anyhow::ensure!(!bytes.is_empty(), "refusing to stage an empty upload");

        let staging = GpuBuffer::new(
            &self.device,
            bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .context("Failed to create staging buffer")?;
        staging.write(bytes)?;

        Ok(staging)
    }

    /// Copy `data` into `dest` through a staging buffer that dies on return
    pub fn upload_to_buffer<T: Pod>(&self, data: &[T], dest: &GpuBuffer) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let size = upload_size(bytes)?;
        anyhow::ensure!(
            size <= dest.size,
            "upload of {} bytes overflows destination of {} bytes",
            size,
            dest.size
        );

        let staging = self.staging_buffer(bytes)?;

        self.one_shot(|rec| {
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size,
            };
            unsafe {
                rec.device.cmd_copy_buffer(rec.cmd, staging.handle, dest.handle, &[region]);
            }
            Ok(())
        })
    }

    /// Device-local buffer with `usage` initialized from `data`
    pub fn create_device_local_buffer<T: Pod>(
        &self,
        data: &[T],
        usage: vk::BufferUsageFlags,
    ) -> Result<GpuBuffer> {
        // Vulkan rejects zero-sized buffers
        let size = upload_size(bytemuck::cast_slice(data))?;

        let buffer = GpuBuffer::new(
            &self.device,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        self.upload_to_buffer(data, &buffer)?;

        Ok(buffer)
    }

    /// Copy tightly packed texels into mip level 0.
    ///
    /// Level 0 must already be in TRANSFER_DST layout.
    pub fn upload_to_image(&self, pixels: &[u8], image: &GpuImage) -> Result<()> {
        ensure_tightly_packed(pixels.len(), image.extent)?;
        anyhow::ensure!(
            image.layouts.level(0) == vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            "image level 0 is in {:?}, expected TRANSFER_DST_OPTIMAL",
            image.layouts.level(0)
        );

        let staging = self.staging_buffer(pixels)?;

        self.one_shot(|rec| {
            let region = vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
                image_extent: vk::Extent3D {
                    width: image.extent.width,
                    height: image.extent.height,
                    depth: 1,
                },
            };
            unsafe {
                rec.device.cmd_copy_buffer_to_image(
                    rec.cmd,
                    staging.handle,
                    image.handle,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
            Ok(())
        })
    }

    /// Move every mip level of `image` to `new_layout` with one barrier.
    ///
    /// The image's tags are only updated once the GPU has executed it.
    pub fn transition_image_layout(&self, image: &mut GpuImage, new_layout: vk::ImageLayout) -> Result<()> {
        let mut next = image.layouts.clone();
        let transition = next.transition_all(new_layout)?;
        let (handle, mip_levels) = (image.handle, image.mip_levels());

        log::debug!("Image {:?}: {:?}", handle, transition);

        self.one_shot(|rec| {
            rec.image_barrier(handle, 0, mip_levels, transition);
            Ok(())
        })?;

        image.layouts = next;
        Ok(())
    }
}

/// Byte size of a non-empty upload
fn upload_size(bytes: &[u8]) -> Result<vk::DeviceSize> {
    anyhow::ensure!(!bytes.is_empty(), "refusing to upload zero bytes");
    Ok(bytes.len() as vk::DeviceSize)
}

/// The copy region always spans the whole extent at 4 bytes per texel
fn ensure_tightly_packed(len: usize, extent: vk::Extent2D) -> Result<()> {
    let expected = extent.width as u64 * extent.height as u64 * 4;
    anyhow::ensure!(
        len as u64 == expected,
        "{}x{} RGBA upload needs {} bytes, got {}",
        extent.width,
        extent.height,
        expected,
        len
    );
    Ok(())
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_command_pool(self.pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::Vertex;

    #[test]
    fn empty_uploads_are_refused_before_allocation() {
        let none: &[Vertex] = &[];
        assert!(upload_size(bytemuck::cast_slice(none)).is_err());

        let indices = [0u32, 1, 2];
        assert_eq!(upload_size(bytemuck::cast_slice(&indices)).unwrap(), 12);
    }

    #[test]
    fn image_upload_must_cover_the_whole_extent() {
        let extent = vk::Extent2D { width: 4, height: 2 };
        assert!(ensure_tightly_packed(32, extent).is_ok());

        // Short data would make the copy read past the staging buffer
        let err = ensure_tightly_packed(31, extent).unwrap_err();
        assert!(err.to_string().contains("needs 32 bytes, got 31"));
        assert!(ensure_tightly_packed(33, extent).is_err());
    }
}
