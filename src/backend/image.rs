// Images, image views, and the layout state we track for them
//
// Vulkan never tells us what layout an image is in; we remember it. Each
// GpuImage owns one layout tag per mip level and those tags change only by
// going through a LayoutTransition, which is the closed set of layout pairs
// this renderer knows how to barrier.

use anyhow::Result;
use ash::vk;
use std::sync::Arc;
use super::buffer::allocate_memory;
use super::VulkanDevice;
use crate::error::RenderError;

/// The supported (old layout, new layout) pairs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutTransition {
    /// Fresh image about to receive a copy
    UndefinedToTransferDst,
    /// Copy finished, image becomes sampleable
    TransferDstToShaderRead,
    /// Mip level finished receiving, about to be blitted from
    TransferDstToTransferSrc,
    /// Mip level done being blitted from
    TransferSrcToShaderRead,
}

/// Access masks and pipeline stages for one barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierScope {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

impl LayoutTransition {
    pub fn lookup(from: vk::ImageLayout, to: vk::ImageLayout) -> Result<Self, RenderError> {
        use vk::ImageLayout as L;

        match (from, to) {
            (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => Ok(Self::UndefinedToTransferDst),
            (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => Ok(Self::TransferDstToShaderRead),
            (L::TRANSFER_DST_OPTIMAL, L::TRANSFER_SRC_OPTIMAL) => Ok(Self::TransferDstToTransferSrc),
            (L::TRANSFER_SRC_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => Ok(Self::TransferSrcToShaderRead),
            _ => Err(RenderError::UnsupportedTransition { from, to }),
        }
    }

    pub fn layouts(self) -> (vk::ImageLayout, vk::ImageLayout) {
        use vk::ImageLayout as L;

        match self {
            Self::UndefinedToTransferDst => (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL),
            Self::TransferDstToShaderRead => (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL),
            Self::TransferDstToTransferSrc => (L::TRANSFER_DST_OPTIMAL, L::TRANSFER_SRC_OPTIMAL),
            Self::TransferSrcToShaderRead => (L::TRANSFER_SRC_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL),
        }
    }

    pub fn scope(self) -> BarrierScope {
        use vk::AccessFlags as A;
        use vk::PipelineStageFlags as S;

        let (src_access, dst_access, src_stage, dst_stage) = match self {
            Self::UndefinedToTransferDst => (A::empty(), A::TRANSFER_WRITE, S::TOP_OF_PIPE, S::TRANSFER),
            Self::TransferDstToShaderRead => {
                (A::TRANSFER_WRITE, A::SHADER_READ, S::TRANSFER, S::FRAGMENT_SHADER)
            }
            Self::TransferDstToTransferSrc => (A::TRANSFER_WRITE, A::TRANSFER_READ, S::TRANSFER, S::TRANSFER),
            Self::TransferSrcToShaderRead => {
                (A::TRANSFER_READ, A::SHADER_READ, S::TRANSFER, S::FRAGMENT_SHADER)
            }
        };

        BarrierScope {
            src_access,
            dst_access,
            src_stage,
            dst_stage,
        }
    }
}

/// Per-mip-level layout tags of one image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelLayouts {
    levels: Vec<vk::ImageLayout>,
}

impl LevelLayouts {
    /// All levels start UNDEFINED, like a freshly created image
    pub fn new(mip_levels: u32) -> Self {
        Self {
            levels: vec![vk::ImageLayout::UNDEFINED; mip_levels as usize],
        }
    }

    pub fn mip_levels(&self) -> u32 {
        self.levels.len() as u32
    }

    pub fn level(&self, level: u32) -> vk::ImageLayout {
        self.levels[level as usize]
    }

    /// The layout shared by every level, if they agree
    pub fn uniform(&self) -> Option<vk::ImageLayout> {
        let first = *self.levels.first()?;
        self.levels.iter().all(|&l| l == first).then_some(first)
    }

    /// Move every level to `to`. All levels must currently agree.
    pub fn transition_all(&mut self, to: vk::ImageLayout) -> Result<LayoutTransition, RenderError> {
        // Mixed levels can't be described by a single barrier; report level 0
        let Some(from) = self.uniform() else {
            return Err(RenderError::UnsupportedTransition { from: self.levels[0], to });
        };

        let transition = LayoutTransition::lookup(from, to)?;
        self.levels.fill(to);
        Ok(transition)
    }

    /// Move a single level to `to`
    pub fn transition_level(&mut self, level: u32, to: vk::ImageLayout) -> Result<LayoutTransition, RenderError> {
        let slot = &mut self.levels[level as usize];
        let transition = LayoutTransition::lookup(*slot, to)?;
        *slot = to;
        Ok(transition)
    }
}

/// A 2-D image and its backing memory, destroyed together on drop
pub struct GpuImage {
    pub handle: vk::Image,
    pub memory: vk::DeviceMemory,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub layouts: LevelLayouts,
    device: Arc<VulkanDevice>,
}

/// Parameters for [`GpuImage::new`]
pub struct ImageDesc {
    pub extent: vk::Extent2D,
    pub mip_levels: u32,
    pub samples: vk::SampleCountFlags,
    pub format: vk::Format,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub memory_properties: vk::MemoryPropertyFlags,
}

impl GpuImage {
    /// Create a 2-D image; all mip levels live in one allocation
    pub fn new(device: &Arc<VulkanDevice>, desc: &ImageDesc) -> Result<Self> {
        anyhow::ensure!(desc.mip_levels >= 1, "image needs at least one mip level");

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(1)
            .format(desc.format)
            .tiling(desc.tiling)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .samples(desc.samples)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = unsafe { device.device.create_image(&image_info, None) }
            .map_err(RenderError::creation("image"))?;

        let mem_requirements = unsafe { device.device.get_image_memory_requirements(handle) };

        let memory = match allocate_memory(device, &mem_requirements, desc.memory_properties) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.device.destroy_image(handle, None) };
                return Err(e);
            }
        };

        if let Err(result) = unsafe { device.device.bind_image_memory(handle, memory, 0) } {
            unsafe {
                device.device.free_memory(memory, None);
                device.device.destroy_image(handle, None);
            }
            return Err(RenderError::ResourceCreation { what: "image memory binding", result }.into());
        }

        Ok(Self {
            handle,
            memory,
            format: desc.format,
            extent: desc.extent,
            layouts: LevelLayouts::new(desc.mip_levels),
            device: device.clone(),
        })
    }

    pub fn mip_levels(&self) -> u32 {
        self.layouts.mip_levels()
    }

    /// View over every mip level of the image
    pub fn create_view(&self, aspect: vk::ImageAspectFlags) -> Result<vk::ImageView> {
        create_image_view(&self.device.device, self.handle, self.format, aspect, self.mip_levels())
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_image(self.handle, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

pub fn create_image_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
    mip_levels: u32,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        });

    let view = unsafe { device.create_image_view(&view_info, None) }
        .map_err(RenderError::creation("image view"))?;

    Ok(view)
}

/// First candidate whose tiling mode supports all of `features`
pub fn find_supported_format(
    candidates: &[vk::Format],
    tiling: vk::ImageTiling,
    features: vk::FormatFeatureFlags,
    properties_of: impl Fn(vk::Format) -> vk::FormatProperties,
) -> Option<vk::Format> {
    candidates.iter().copied().find(|&format| {
        let props = properties_of(format);
        match tiling {
            vk::ImageTiling::LINEAR => props.linear_tiling_features.contains(features),
            vk::ImageTiling::OPTIMAL => props.optimal_tiling_features.contains(features),
            _ => false,
        }
    })
}

pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

pub fn find_depth_format(device: &VulkanDevice) -> Result<vk::Format> {
    find_supported_format(
        &DEPTH_FORMAT_CANDIDATES,
        vk::ImageTiling::OPTIMAL,
        vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        |format| device.format_properties(format),
    )
    .ok_or_else(|| {
        RenderError::UnsupportedFormat {
            format: DEPTH_FORMAT_CANDIDATES[0],
            reason: "no depth format supports optimal-tiling depth attachments",
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vk::ImageLayout as L;

    #[test]
    fn recognized_pairs_round_trip_through_the_table() {
        for transition in [
            LayoutTransition::UndefinedToTransferDst,
            LayoutTransition::TransferDstToShaderRead,
            LayoutTransition::TransferDstToTransferSrc,
            LayoutTransition::TransferSrcToShaderRead,
        ] {
            let (from, to) = transition.layouts();
            assert_eq!(LayoutTransition::lookup(from, to).unwrap(), transition);
        }
    }

    #[test]
    fn upload_transitions_use_expected_scopes() {
        let to_dst = LayoutTransition::lookup(L::UNDEFINED, L::TRANSFER_DST_OPTIMAL)
            .unwrap()
            .scope();
        assert_eq!(to_dst.src_access, vk::AccessFlags::empty());
        assert_eq!(to_dst.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(to_dst.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(to_dst.dst_stage, vk::PipelineStageFlags::TRANSFER);

        let to_read = LayoutTransition::lookup(L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL)
            .unwrap()
            .scope();
        assert_eq!(to_read.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(to_read.dst_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(to_read.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn unknown_pairs_are_rejected() {
        for (from, to) in [
            (L::UNDEFINED, L::SHADER_READ_ONLY_OPTIMAL),
            (L::SHADER_READ_ONLY_OPTIMAL, L::TRANSFER_DST_OPTIMAL),
            (L::TRANSFER_DST_OPTIMAL, L::TRANSFER_DST_OPTIMAL),
            (L::UNDEFINED, L::COLOR_ATTACHMENT_OPTIMAL),
        ] {
            let err = LayoutTransition::lookup(from, to).unwrap_err();
            assert!(matches!(
                err,
                RenderError::UnsupportedTransition { from: f, to: t } if f == from && t == to
            ));
        }
    }

    #[test]
    fn level_layouts_track_whole_image_transitions() {
        let mut layouts = LevelLayouts::new(4);
        assert_eq!(layouts.uniform(), Some(L::UNDEFINED));

        layouts.transition_all(L::TRANSFER_DST_OPTIMAL).unwrap();
        assert_eq!(layouts.uniform(), Some(L::TRANSFER_DST_OPTIMAL));

        layouts.transition_all(L::SHADER_READ_ONLY_OPTIMAL).unwrap();
        assert_eq!(layouts.uniform(), Some(L::SHADER_READ_ONLY_OPTIMAL));
    }

    #[test]
    fn failed_transition_leaves_tags_untouched() {
        let mut layouts = LevelLayouts::new(2);
        assert!(layouts.transition_all(L::SHADER_READ_ONLY_OPTIMAL).is_err());
        assert_eq!(layouts.uniform(), Some(L::UNDEFINED));

        assert!(layouts.transition_level(1, L::TRANSFER_SRC_OPTIMAL).is_err());
        assert_eq!(layouts.level(1), L::UNDEFINED);
    }

    #[test]
    fn mixed_levels_refuse_whole_image_transition() {
        let mut layouts = LevelLayouts::new(3);
        layouts.transition_all(L::TRANSFER_DST_OPTIMAL).unwrap();
        layouts.transition_level(0, L::TRANSFER_SRC_OPTIMAL).unwrap();

        assert_eq!(layouts.uniform(), None);
        assert!(layouts.transition_all(L::SHADER_READ_ONLY_OPTIMAL).is_err());
    }

    #[test]
    fn depth_format_prefers_first_supported_candidate() {
        let supports_only_d24 = |format: vk::Format| {
            let mut props = vk::FormatProperties::default();
            if format == vk::Format::D24_UNORM_S8_UINT {
                props.optimal_tiling_features = vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
            }
            props
        };

        assert_eq!(
            find_supported_format(
                &DEPTH_FORMAT_CANDIDATES,
                vk::ImageTiling::OPTIMAL,
                vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
                supports_only_d24,
            ),
            Some(vk::Format::D24_UNORM_S8_UINT)
        );
        assert_eq!(
            find_supported_format(
                &DEPTH_FORMAT_CANDIDATES,
                vk::ImageTiling::LINEAR,
                vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
                supports_only_d24,
            ),
            None
        );
    }
}
