// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with safety and ergonomics
// Ownership: every GPU object is released by Drop, in dependency order

pub mod buffer;
pub mod descriptor;
pub mod device;
pub mod frame;
pub mod image;
pub mod instance;
pub mod mesh;
pub mod mipmap;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod texture;
pub mod transfer;

pub use buffer::GpuBuffer;
pub use device::VulkanDevice;
pub use frame::{Acquire, FramePacer, FrameTarget, PresentOutcome};
pub use image::GpuImage;
pub use instance::VulkanInstance;
pub use surface::Surface;
pub use swapchain::Swapchain;
pub use transfer::TransferEngine;
