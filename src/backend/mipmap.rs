// Mip chain generation by successive linear blits
//
// Level i is produced from level i-1 on the GPU. Before the chain is recorded
// every level is in TRANSFER_DST; afterwards every level is SHADER_READ_ONLY.

use anyhow::Result;
use ash::vk;
use super::image::{GpuImage, LayoutTransition, LevelLayouts};
use super::transfer::{CommandRecorder, TransferEngine};
use crate::error::RenderError;

/// Number of levels in a full chain down to 1x1
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Size of `level`, never smaller than 1x1
pub fn mip_extent(width: u32, height: u32, level: u32) -> vk::Extent2D {
    vk::Extent2D {
        width: (width >> level).max(1),
        height: (height >> level).max(1),
    }
}

/// One downsampling step: `src_level` into `src_level + 1`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MipBlit {
    pub src_level: u32,
    pub src_extent: vk::Extent2D,
    pub dst_extent: vk::Extent2D,
}

/// Where the mip chain gets recorded
pub trait BlitRecorder {
    /// Barrier on a single mip level
    fn level_barrier(&mut self, image: vk::Image, level: u32, transition: LayoutTransition);
    fn blit(&mut self, image: vk::Image, blit: &MipBlit);
}

impl BlitRecorder for CommandRecorder<'_> {
    fn level_barrier(&mut self, image: vk::Image, level: u32, transition: LayoutTransition) {
        self.image_barrier(image, level, 1, transition);
    }

    fn blit(&mut self, image: vk::Image, blit: &MipBlit) {
        let corner = |extent: vk::Extent2D| vk::Offset3D {
            x: extent.width as i32,
            y: extent.height as i32,
            z: 1,
        };
        let layer = |mip_level| vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level,
            base_array_layer: 0,
            layer_count: 1,
        };

        let region = vk::ImageBlit::builder()
            .src_offsets([vk::Offset3D::default(), corner(blit.src_extent)])
            .src_subresource(layer(blit.src_level))
            .dst_offsets([vk::Offset3D::default(), corner(blit.dst_extent)])
            .dst_subresource(layer(blit.src_level + 1))
            .build();

        unsafe {
            self.device.cmd_blit_image(
                self.cmd,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
                vk::Filter::LINEAR,
            );
        }
    }
}

/// Linear blits need SAMPLED_IMAGE_FILTER_LINEAR in optimal tiling
pub fn ensure_linear_blit(format: vk::Format, properties: vk::FormatProperties) -> Result<(), RenderError> {
    if properties
        .optimal_tiling_features
        .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
    {
        Ok(())
    } else {
        Err(RenderError::UnsupportedFormat {
            format,
            reason: "linear blitting is not supported in optimal tiling",
        })
    }
}

/// Record the whole chain and update `layouts` to match
pub fn record_mip_chain<R: BlitRecorder>(
    recorder: &mut R,
    image: vk::Image,
    extent: vk::Extent2D,
    layouts: &mut LevelLayouts,
) -> Result<(), RenderError> {
    use vk::ImageLayout as L;

    let mip_levels = layouts.mip_levels();
    if layouts.uniform() != Some(L::TRANSFER_DST_OPTIMAL) {
        let to = if mip_levels > 1 { L::TRANSFER_SRC_OPTIMAL } else { L::SHADER_READ_ONLY_OPTIMAL };
        return Err(RenderError::UnsupportedTransition { from: layouts.level(0), to });
    }

    for level in 1..mip_levels {
        let src = level - 1;

        let transition = layouts.transition_level(src, L::TRANSFER_SRC_OPTIMAL)?;
        recorder.level_barrier(image, src, transition);

        recorder.blit(
            image,
            &MipBlit {
                src_level: src,
                src_extent: mip_extent(extent.width, extent.height, src),
                dst_extent: mip_extent(extent.width, extent.height, level),
            },
        );

        let transition = layouts.transition_level(src, L::SHADER_READ_ONLY_OPTIMAL)?;
        recorder.level_barrier(image, src, transition);
    }

    // The last level was only ever written to
    let last = mip_levels - 1;
    let transition = layouts.transition_level(last, L::SHADER_READ_ONLY_OPTIMAL)?;
    recorder.level_barrier(image, last, transition);

    Ok(())
}

/// Fill levels 1.. of `image` from level 0 and leave every level sampleable
pub fn generate_mipmaps(engine: &TransferEngine, image: &mut GpuImage) -> Result<()> {
    ensure_linear_blit(image.format, engine.device().format_properties(image.format))?;

    let mut next = image.layouts.clone();
    let (handle, extent) = (image.handle, image.extent);

    engine.one_shot(|rec| {
        record_mip_chain(rec, handle, extent, &mut next)?;
        Ok(())
    })?;

    log::debug!(
        "Generated {} mip levels for {}x{} image",
        next.mip_levels(),
        extent.width,
        extent.height
    );

    image.layouts = next;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vk::ImageLayout as L;

    #[derive(Debug, PartialEq)]
    enum Recorded {
        Barrier(u32, LayoutTransition),
        Blit(MipBlit),
    }

    #[derive(Default)]
    struct MockRecorder {
        commands: Vec<Recorded>,
    }

    impl BlitRecorder for MockRecorder {
        fn level_barrier(&mut self, _image: vk::Image, level: u32, transition: LayoutTransition) {
            self.commands.push(Recorded::Barrier(level, transition));
        }

        fn blit(&mut self, _image: vk::Image, blit: &MipBlit) {
            self.commands.push(Recorded::Blit(*blit));
        }
    }

    fn ready_layouts(mip_levels: u32) -> LevelLayouts {
        let mut layouts = LevelLayouts::new(mip_levels);
        layouts.transition_all(L::TRANSFER_DST_OPTIMAL).unwrap();
        layouts
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn level_count_matches_log2() {
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(2, 1), 2);
        assert_eq!(mip_level_count(3, 3), 2);
        assert_eq!(mip_level_count(1024, 1024), 11);
        assert_eq!(mip_level_count(1024, 768), 11);
        assert_eq!(mip_level_count(1, 1025), 11);
    }

    #[test]
    fn every_level_ends_sampleable() {
        for (w, h) in [(1, 1), (2, 2), (7, 3), (256, 256), (1024, 512), (1, 300), (640, 480)] {
            let mip_levels = mip_level_count(w, h);
            let mut layouts = ready_layouts(mip_levels);
            let mut recorder = MockRecorder::default();

            record_mip_chain(&mut recorder, vk::Image::null(), extent(w, h), &mut layouts).unwrap();

            assert_eq!(layouts.uniform(), Some(L::SHADER_READ_ONLY_OPTIMAL), "{}x{}", w, h);
        }
    }

    #[test]
    fn blit_extents_halve_with_floor_of_one() {
        for (w, h) in [(512, 512), (300, 7), (1, 64), (1000, 3)] {
            let mip_levels = mip_level_count(w, h);
            let mut layouts = ready_layouts(mip_levels);
            let mut recorder = MockRecorder::default();

            record_mip_chain(&mut recorder, vk::Image::null(), extent(w, h), &mut layouts).unwrap();

            let blits: Vec<MipBlit> = recorder
                .commands
                .iter()
                .filter_map(|c| match c {
                    Recorded::Blit(b) => Some(*b),
                    _ => None,
                })
                .collect();

            assert_eq!(blits.len() as u32, mip_levels - 1);
            for (i, blit) in blits.iter().enumerate() {
                let i = i as u32;
                assert_eq!(blit.src_level, i);
                assert_eq!(blit.src_extent, extent((w >> i).max(1), (h >> i).max(1)));
                assert_eq!(blit.dst_extent, extent((w >> (i + 1)).max(1), (h >> (i + 1)).max(1)));
            }
            let last = blits.last().unwrap();
            assert_eq!(last.dst_extent, extent(1, 1));
        }
    }

    #[test]
    fn barriers_bracket_each_blit() {
        let mut layouts = ready_layouts(3);
        let mut recorder = MockRecorder::default();

        record_mip_chain(&mut recorder, vk::Image::null(), extent(4, 4), &mut layouts).unwrap();

        assert_eq!(
            recorder.commands,
            vec![
                Recorded::Barrier(0, LayoutTransition::TransferDstToTransferSrc),
                Recorded::Blit(MipBlit { src_level: 0, src_extent: extent(4, 4), dst_extent: extent(2, 2) }),
                Recorded::Barrier(0, LayoutTransition::TransferSrcToShaderRead),
                Recorded::Barrier(1, LayoutTransition::TransferDstToTransferSrc),
                Recorded::Blit(MipBlit { src_level: 1, src_extent: extent(2, 2), dst_extent: extent(1, 1) }),
                Recorded::Barrier(1, LayoutTransition::TransferSrcToShaderRead),
                Recorded::Barrier(2, LayoutTransition::TransferDstToShaderRead),
            ]
        );
    }

    #[test]
    fn single_level_image_skips_blits() {
        let mut layouts = ready_layouts(1);
        let mut recorder = MockRecorder::default();

        record_mip_chain(&mut recorder, vk::Image::null(), extent(1, 1), &mut layouts).unwrap();

        assert_eq!(
            recorder.commands,
            vec![Recorded::Barrier(0, LayoutTransition::TransferDstToShaderRead)]
        );
        assert_eq!(layouts.uniform(), Some(L::SHADER_READ_ONLY_OPTIMAL));
    }

    #[test]
    fn refuses_image_not_ready_for_transfer() {
        let mut layouts = LevelLayouts::new(4);
        let mut recorder = MockRecorder::default();

        let err = record_mip_chain(&mut recorder, vk::Image::null(), extent(8, 8), &mut layouts).unwrap_err();

        assert!(matches!(err, RenderError::UnsupportedTransition { from: L::UNDEFINED, .. }));
        assert!(recorder.commands.is_empty());
        assert_eq!(layouts.uniform(), Some(L::UNDEFINED));
    }

    #[test]
    fn linear_blit_support_is_required() {
        let mut props = vk::FormatProperties::default();
        let err = ensure_linear_blit(vk::Format::R8G8B8A8_SRGB, props).unwrap_err();
        assert!(matches!(
            err,
            RenderError::UnsupportedFormat { format: vk::Format::R8G8B8A8_SRGB, .. }
        ));

        // Linear tiling support alone is not enough
        props.linear_tiling_features = vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR;
        assert!(ensure_linear_blit(vk::Format::R8G8B8A8_SRGB, props).is_err());

        props.optimal_tiling_features = vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR;
        assert!(ensure_linear_blit(vk::Format::R8G8B8A8_SRGB, props).is_ok());
    }
}
