// Sampled texture: mipmapped image, view and sampler

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use super::image::{GpuImage, ImageDesc};
use super::mipmap::{generate_mipmaps, mip_level_count};
use super::transfer::TransferEngine;
use super::VulkanDevice;
use crate::assets::HostImage;
use crate::error::RenderError;

pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

pub struct Texture {
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
    pub image: GpuImage,
    device: Arc<VulkanDevice>,
}

impl Texture {
    pub fn mip_levels(&self) -> u32 {
        self.image.mip_levels()
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_sampler(self.sampler, None);
            self.device.device.destroy_image_view(self.view, None);
        }
    }
}

/// Upload `host` and generate its full mip chain. Every level is
/// SHADER_READ_ONLY when this returns.
pub fn create_texture_from_host_image(engine: &TransferEngine, host: &HostImage) -> Result<Texture> {
    anyhow::ensure!(
        host.pixels.len() as u64 == host.byte_size(),
        "texture pixels are not tightly packed RGBA8"
    );

    let device = engine.device();
    let mip_levels = mip_level_count(host.width, host.height);

    let mut image = GpuImage::new(
        device,
        &ImageDesc {
            extent: vk::Extent2D {
                width: host.width,
                height: host.height,
            },
            mip_levels,
            samples: vk::SampleCountFlags::TYPE_1,
            format: TEXTURE_FORMAT,
            tiling: vk::ImageTiling::OPTIMAL,
            // Source and destination of the mip blits
            usage: vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::SAMPLED,
            memory_properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
        },
    )
    .context("Failed to create texture image")?;

    engine.transition_image_layout(&mut image, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
    engine.upload_to_image(&host.pixels, &image)?;
    generate_mipmaps(engine, &mut image)?;

    let view = image.create_view(vk::ImageAspectFlags::COLOR)?;

    let sampler = match create_sampler(device, mip_levels) {
        Ok(sampler) => sampler,
        Err(e) => {
            unsafe { device.device.destroy_image_view(view, None) };
            return Err(e);
        }
    };

    log::info!(
        "Texture ready: {}x{}, {} mip levels",
        host.width,
        host.height,
        mip_levels
    );

    Ok(Texture {
        view,
        sampler,
        image,
        device: device.clone(),
    })
}

fn create_sampler(device: &VulkanDevice, mip_levels: u32) -> Result<vk::Sampler> {
    let sampler_info = vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .anisotropy_enable(true)
        .max_anisotropy(device.properties.limits.max_sampler_anisotropy)
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .unnormalized_coordinates(false)
        .compare_enable(false)
        .compare_op(vk::CompareOp::ALWAYS)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .min_lod(0.0)
        .max_lod(mip_levels as f32)
        .mip_lod_bias(0.0);

    let sampler = unsafe { device.device.create_sampler(&sampler_info, None) }
        .map_err(RenderError::creation("texture sampler"))?;

    Ok(sampler)
}
