// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Physical device selection (prefer discrete GPU)
// - Graphics + present queue family lookup
// - Logical device + queue creation

use anyhow::{Context, Result};
use ash::vk;
use std::ffi::CStr;
use std::sync::Arc;
use super::{Surface, VulkanInstance};

/// Required Vulkan device features for our renderer
const REQUIRED_DEVICE_FEATURES: vk::PhysicalDeviceFeatures = vk::PhysicalDeviceFeatures {
    sampler_anisotropy: vk::TRUE,
    ..unsafe { std::mem::zeroed() }
};

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,

    // Queue handles (may be the same queue)
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,
    pub present_queue: vk::Queue,
    pub present_queue_family: u32,

    // Device properties (cached, memory type selection reads these)
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,

    // Dropped after the device
    pub instance: Arc<VulkanInstance>,
}

struct Candidate {
    physical_device: vk::PhysicalDevice,
    graphics_family: u32,
    present_family: u32,
    score: u32,
}

impl VulkanDevice {
    /// Create the logical device.
    ///
    /// With a surface, the chosen GPU must be able to present to it and
    /// support `VK_KHR_swapchain`. Without one the device is headless and
    /// presents on nothing (the present queue aliases the graphics queue).
    pub fn new(instance: Arc<VulkanInstance>, surface: Option<&Surface>) -> Result<Arc<Self>> {
        let candidate = Self::pick_physical_device(&instance, surface)?;

        let (device, graphics_queue, present_queue) = Self::create_logical_device(
            &instance,
            &candidate,
            surface.is_some(),
        )?;

        let physical_device = candidate.physical_device;
        let properties = unsafe { instance.raw.get_physical_device_properties(physical_device) };
        let memory_properties = unsafe {
            instance.raw.get_physical_device_memory_properties(physical_device)
        };

        log::info!("Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
                .to_string_lossy());
        log::info!("API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version));
        log::info!(
            "Queue families: graphics={} present={}",
            candidate.graphics_family,
            candidate.present_family
        );

        Ok(Arc::new(Self {
            device,
            physical_device,
            graphics_queue,
            graphics_queue_family: candidate.graphics_family,
            present_queue,
            present_queue_family: candidate.present_family,
            properties,
            memory_properties,
            instance,
        }))
    }

    fn pick_physical_device(
        instance: &VulkanInstance,
        surface: Option<&Surface>,
    ) -> Result<Candidate> {
        let devices = unsafe { instance.raw.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        let mut best: Option<Candidate> = None;

        for physical_device in devices {
            let props = unsafe { instance.raw.get_physical_device_properties(physical_device) };
            let features = unsafe { instance.raw.get_physical_device_features(physical_device) };

            if features.sampler_anisotropy != vk::TRUE {
                continue;
            }

            if surface.is_some() && !Self::supports_swapchain(instance, physical_device)? {
                continue;
            }

            let queue_families = unsafe {
                instance.raw.get_physical_device_queue_family_properties(physical_device)
            };

            let Some(graphics_family) = queue_families
                .iter()
                .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
                .map(|i| i as u32)
            else {
                continue;
            };

            let present_family = match surface {
                None => Some(graphics_family),
                Some(surface) => {
                    // Prefer a unified family so the swapchain can stay exclusive
                    if surface.supports_present(physical_device, graphics_family)? {
                        Some(graphics_family)
                    } else {
                        let mut found = None;
                        for family in 0..queue_families.len() as u32 {
                            if surface.supports_present(physical_device, family)? {
                                found = Some(family);
                                break;
                            }
                        }
                        found
                    }
                }
            };

            let Some(present_family) = present_family else {
                continue;
            };

            let score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                _ => 1,
            };

            if best.as_ref().map_or(true, |b| score > b.score) {
                best = Some(Candidate {
                    physical_device,
                    graphics_family,
                    present_family,
                    score,
                });
            }
        }

        best.ok_or_else(|| anyhow::anyhow!("No suitable GPU found"))
    }

    fn supports_swapchain(instance: &VulkanInstance, physical_device: vk::PhysicalDevice) -> Result<bool> {
        let extensions = unsafe {
            instance.raw.enumerate_device_extension_properties(physical_device)
        }
        .context("Failed to enumerate device extensions")?;

        let wanted = ash::extensions::khr::Swapchain::name();
        Ok(extensions
            .iter()
            .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == wanted))
    }

    fn create_logical_device(
        instance: &VulkanInstance,
        candidate: &Candidate,
        presenting: bool,
    ) -> Result<(ash::Device, vk::Queue, vk::Queue)> {
        let queue_priorities = [1.0];

        let mut families = vec![candidate.graphics_family];
        if candidate.present_family != candidate.graphics_family {
            families.push(candidate.present_family);
        }

        let queue_create_infos: Vec<_> = families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions = if presenting {
            vec![ash::extensions::khr::Swapchain::name().as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&REQUIRED_DEVICE_FEATURES);

        let device = unsafe {
            instance.raw.create_device(candidate.physical_device, &create_info, None)
        }
        .context("Failed to create logical device")?;

        let graphics_queue = unsafe { device.get_device_queue(candidate.graphics_family, 0) };
        let present_queue = unsafe { device.get_device_queue(candidate.present_family, 0) };

        Ok((device, graphics_queue, present_queue))
    }

    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance
                .raw
                .get_physical_device_format_properties(self.physical_device, format)
        }
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed to wait for device idle")?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        unsafe {
            self.device.destroy_device(None);
        }
    }
}
