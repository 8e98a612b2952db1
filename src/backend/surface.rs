// Window surface and the presentation capabilities it reports

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::sync::Arc;
use super::VulkanInstance;

pub struct Surface {
    pub handle: vk::SurfaceKHR,
    pub loader: ash::extensions::khr::Surface,
    _instance: Arc<VulkanInstance>,
}

/// Everything the swapchain provisioner needs to know about the surface
pub struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl Surface {
    pub fn new<W>(instance: &Arc<VulkanInstance>, window: &W) -> Result<Self>
    where
        W: HasRawWindowHandle + HasRawDisplayHandle,
    {
        let loader = ash::extensions::khr::Surface::new(&instance.entry, &instance.raw);

        let handle = unsafe {
            ash_window::create_surface(
                &instance.entry,
                &instance.raw,
                window.raw_display_handle(),
                window.raw_window_handle(),
                None,
            )
        }
        .context("Failed to create window surface")?;

        Ok(Self {
            handle,
            loader,
            _instance: instance.clone(),
        })
    }

    pub fn supports_present(&self, physical_device: vk::PhysicalDevice, queue_family: u32) -> Result<bool> {
        unsafe {
            self.loader
                .get_physical_device_surface_support(physical_device, queue_family, self.handle)
                .context("Failed to query surface support")
        }
    }

    pub fn query_support(&self, physical_device: vk::PhysicalDevice) -> Result<SwapchainSupport> {
        unsafe {
            Ok(SwapchainSupport {
                capabilities: self
                    .loader
                    .get_physical_device_surface_capabilities(physical_device, self.handle)
                    .context("Failed to query surface capabilities")?,
                formats: self
                    .loader
                    .get_physical_device_surface_formats(physical_device, self.handle)
                    .context("Failed to query surface formats")?,
                present_modes: self
                    .loader
                    .get_physical_device_surface_present_modes(physical_device, self.handle)
                    .context("Failed to query present modes")?,
            })
        }
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_surface(self.handle, None);
        }
    }
}
