// Swapchain - Window presentation
//
// Owns the presentable images plus everything sized to them: image views,
// the depth buffer and framebuffers. A Swapchain is never resized in place;
// recreation drops the old one and builds a new one from scratch.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use super::image::{GpuImage, ImageDesc, create_image_view};
use super::pipeline::create_framebuffers;
use super::surface::{Surface, SwapchainSupport};
use super::VulkanDevice;
use crate::error::RenderError;

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: ash::extensions::khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub extent: vk::Extent2D,
    depth_view: vk::ImageView,
    depth_image: Option<GpuImage>,
    device: Arc<VulkanDevice>,
}

/// What stays fixed across recreations
#[derive(Debug, Clone, Copy)]
pub struct SwapchainOptions {
    /// The format the render pass was built for
    pub surface_format: vk::SurfaceFormatKHR,
    pub preferred_present_mode: vk::PresentModeKHR,
    pub render_pass: vk::RenderPass,
    pub depth_format: vk::Format,
}

/// Prefer B8G8R8A8_SRGB with the sRGB color space, else whatever comes first
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
        .context("Surface reports no formats")
}

/// Whether the surface still offers exactly `wanted`
pub fn offers_format(formats: &[vk::SurfaceFormatKHR], wanted: vk::SurfaceFormatKHR) -> bool {
    formats
        .iter()
        .any(|f| f.format == wanted.format && f.color_space == wanted.color_space)
}

/// The preferred mode if the surface offers it, otherwise FIFO (always available)
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// The surface's current extent, unless it leaves the choice to us
/// (width == u32::MAX), in which case `requested` is clamped into range.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, requested: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }

    vk::Extent2D {
        width: requested
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: requested
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum, capped when the surface has a maximum
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        wanted.min(caps.max_image_count)
    } else {
        wanted
    }
}

/// Images are shared between queues only when graphics and present differ
pub fn sharing_mode(graphics_family: u32, present_family: u32) -> (vk::SharingMode, Vec<u32>) {
    if graphics_family != present_family {
        (vk::SharingMode::CONCURRENT, vec![graphics_family, present_family])
    } else {
        (vk::SharingMode::EXCLUSIVE, vec![])
    }
}

pub fn is_zero_extent(extent: vk::Extent2D) -> bool {
    extent.width == 0 || extent.height == 0
}

impl Swapchain {
    pub fn new(
        device: &Arc<VulkanDevice>,
        surface: &Surface,
        support: &SwapchainSupport,
        requested_extent: vk::Extent2D,
        options: &SwapchainOptions,
    ) -> Result<Self> {
        let caps = &support.capabilities;
        let extent = choose_extent(caps, requested_extent);
        anyhow::ensure!(
            !is_zero_extent(extent),
            "refusing to create a {}x{} swapchain",
            extent.width,
            extent.height
        );

        // Framebuffers must stay compatible with the render pass
        let format = options.surface_format;
        anyhow::ensure!(
            offers_format(&support.formats, format),
            "surface no longer offers {:?} / {:?}",
            format.format,
            format.color_space
        );
        let present_mode = choose_present_mode(&support.present_modes, options.preferred_present_mode);
        let image_count = choose_image_count(caps);
        let (sharing, queue_families) =
            sharing_mode(device.graphics_queue_family, device.present_queue_family);

        log::info!(
            "Creating swapchain: {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            image_count,
            format.format,
            present_mode
        );

        let swapchain_loader =
            ash::extensions::khr::Swapchain::new(&device.instance.raw, &device.device);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.handle)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing)
            .queue_family_indices(&queue_families)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
            .map_err(RenderError::creation("swapchain"))?;

        // Everything below is released by Drop if a later step fails
        let mut this = Self {
            swapchain,
            swapchain_loader,
            images: Vec::new(),
            image_views: Vec::new(),
            framebuffers: Vec::new(),
            extent,
            depth_view: vk::ImageView::null(),
            depth_image: None,
            device: device.clone(),
        };

        this.images = unsafe { this.swapchain_loader.get_swapchain_images(swapchain) }
            .context("Failed to get swapchain images")?;

        for &image in &this.images {
            let view = create_image_view(
                &device.device,
                image,
                format.format,
                vk::ImageAspectFlags::COLOR,
                1,
            )?;
            this.image_views.push(view);
        }

        let depth_image = GpuImage::new(
            device,
            &ImageDesc {
                extent,
                mip_levels: 1,
                samples: vk::SampleCountFlags::TYPE_1,
                format: options.depth_format,
                tiling: vk::ImageTiling::OPTIMAL,
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                memory_properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            },
        )
        .context("Failed to create depth image")?;
        this.depth_view = depth_image.create_view(vk::ImageAspectFlags::DEPTH)?;
        this.depth_image = Some(depth_image);

        this.framebuffers = create_framebuffers(
            &device.device,
            &this.image_views,
            this.depth_view,
            options.render_pass,
            extent,
        )?;

        log::info!("Created swapchain with {} images", this.images.len());
        Ok(this)
    }

    /// Acquire the next image, signaling `semaphore` when it is ready.
    ///
    /// Returns the image index and whether the swapchain is suboptimal.
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<(u32, bool), RenderError> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, suboptimal)) => Ok((index, suboptimal)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(RenderError::PresentationStale),
            Err(e) => Err(RenderError::Submission(e)),
        }
    }

    /// Present `image_index` once `wait_semaphores` signal.
    ///
    /// Returns whether the swapchain is suboptimal.
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool, RenderError> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.swapchain_loader.queue_present(queue, &present_info) };

        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(RenderError::PresentationStale),
            Err(e) => Err(RenderError::Submission(e)),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        let device = &self.device.device;
        unsafe {
            device.destroy_image_view(self.depth_view, None);
            drop(self.depth_image.take());

            for &framebuffer in &self.framebuffers {
                device.destroy_framebuffer(framebuffer, None);
            }
            for &view in &self.image_views {
                device.destroy_image_view(view, None);
            }
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: (u32, u32), min: (u32, u32), max: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            current_extent: vk::Extent2D { width: current.0, height: current.1 },
            min_image_extent: vk::Extent2D { width: min.0, height: min.1 },
            max_image_extent: vk::Extent2D { width: max.0, height: max.1 },
            ..Default::default()
        }
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    fn surface_format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR { format, color_space }
    }

    #[test]
    fn prefers_srgb_bgra() {
        let formats = [
            surface_format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            surface_format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(choose_surface_format(&formats).unwrap().format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn falls_back_to_first_format() {
        let formats = [
            surface_format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            surface_format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT),
        ];
        assert_eq!(choose_surface_format(&formats).unwrap().format, vk::Format::R8G8B8A8_UNORM);

        let err = choose_surface_format(&[]).unwrap_err();
        assert!(err.downcast_ref::<RenderError>().is_none());
        assert!(err.to_string().contains("no formats"));
    }

    #[test]
    fn rebuild_format_must_match_exactly() {
        let chosen = surface_format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR);
        let offered = [
            surface_format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            chosen,
        ];
        assert!(offers_format(&offered, chosen));

        // Same format in another color space is a different render target
        let changed = [
            surface_format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT),
        ];
        assert!(!offers_format(&changed, chosen));
        assert!(!offers_format(&[], chosen));
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO], vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn current_extent_is_used_verbatim() {
        let caps = caps((800, 600), (1, 1), (4096, 4096));
        assert_eq!(choose_extent(&caps, extent(1920, 1080)), extent(800, 600));
    }

    #[test]
    fn sentinel_extent_clamps_request() {
        let caps = caps((u32::MAX, u32::MAX), (64, 64), (2048, 1024));
        assert_eq!(choose_extent(&caps, extent(1280, 720)), extent(1280, 720));
        assert_eq!(choose_extent(&caps, extent(4000, 10)), extent(2048, 64));
    }

    #[test]
    fn same_size_requests_give_same_extent() {
        let caps = caps((u32::MAX, u32::MAX), (1, 1), (4096, 4096));
        let first = choose_extent(&caps, extent(1024, 768));
        for _ in 0..8 {
            assert_eq!(choose_extent(&caps, extent(1024, 768)), first);
        }
    }

    #[test]
    fn image_count_respects_maximum() {
        let mut caps = caps((800, 600), (1, 1), (4096, 4096));
        assert_eq!(choose_image_count(&caps), 3);

        caps.max_image_count = 2;
        assert_eq!(choose_image_count(&caps), 2);

        caps.max_image_count = 8;
        assert_eq!(choose_image_count(&caps), 3);
    }

    #[test]
    fn distinct_families_share_concurrently() {
        assert_eq!(sharing_mode(0, 0), (vk::SharingMode::EXCLUSIVE, vec![]));
        assert_eq!(sharing_mode(0, 2), (vk::SharingMode::CONCURRENT, vec![0, 2]));
    }

    #[test]
    fn zero_extent_detection() {
        assert!(is_zero_extent(extent(0, 600)));
        assert!(is_zero_extent(extent(800, 0)));
        assert!(!is_zero_extent(extent(1, 1)));
    }
}
