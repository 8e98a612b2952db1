// Renderer - owns every GPU object and implements one frame's GPU work
//
// Setup order: instance -> surface -> device -> texture + mesh uploads ->
// uniforms + descriptors -> render pass + pipeline -> frame slots -> swapchain.
// Teardown runs in reverse; raw handles are destroyed in Drop, RAII wrappers
// follow in field order.

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::HasRawDisplayHandle;
use std::sync::Arc;
use std::time::Instant;
use winit::window::Window;

use crate::assets::{load_mesh, load_texture};
use crate::backend::descriptor::{FrameDescriptors, UniformBuffer, UniformBufferObject};
use crate::backend::image::find_depth_format;
use crate::backend::mesh::{upload_mesh, GpuMesh};
use crate::backend::pipeline::{
    create_graphics_pipeline, create_render_pass, viewport_and_scissor, GraphicsPipeline,
};
use crate::backend::shader::load_shader_module;
use crate::backend::swapchain::{
    choose_extent, choose_surface_format, is_zero_extent, SwapchainOptions,
};
use crate::backend::sync::FrameSlot;
use crate::backend::texture::{create_texture_from_host_image, Texture};
use crate::backend::{
    Acquire, FrameTarget, PresentOutcome, Surface, Swapchain, TransferEngine, VulkanDevice,
    VulkanInstance,
};
use crate::config::Config;
use crate::error::RenderError;

pub struct Renderer {
    // Rebuilt on resize; None until the surface has a usable size
    swapchain: Option<Swapchain>,

    // Raw handles, destroyed in Drop (null-safe)
    frames: Vec<FrameSlot>,
    command_pool: vk::CommandPool,
    pipeline: GraphicsPipeline,
    render_pass: vk::RenderPass,

    // Immutable after setup
    descriptors: FrameDescriptors,
    uniforms: Vec<UniformBuffer>,
    mesh: GpuMesh,
    texture: Texture,

    swapchain_options: SwapchainOptions,
    clear_color: [f32; 4],
    started: Instant,

    device: Arc<VulkanDevice>,
    surface: Surface,
    window: Arc<Window>,
}

impl Renderer {
    pub fn new(window: Arc<Window>, config: &Config) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        let frames_in_flight = config.graphics.max_frames_in_flight;
        let enable_validation = cfg!(debug_assertions) && config.debug.validation_layers;

        let instance = VulkanInstance::new(
            &config.window.title,
            enable_validation,
            Some(window.raw_display_handle()),
        )?;
        let surface = Surface::new(&instance, window.as_ref())?;
        let device = VulkanDevice::new(instance, Some(&surface))?;

        // Only needed for the startup uploads
        let (texture, mesh) = {
            let transfer = TransferEngine::new(&device)?;
            let host_texture = load_texture(&config.assets.texture_path)?;
            let texture = create_texture_from_host_image(&transfer, &host_texture)?;
            let mesh = upload_mesh(&transfer, &load_mesh(&config.assets.model_path)?)?;
            (texture, mesh)
        };

        let uniforms = (0..frames_in_flight)
            .map(|_| UniformBuffer::new(&device))
            .collect::<Result<Vec<_>>>()?;
        let descriptors = FrameDescriptors::new(&device, &uniforms, &texture)?;

        let depth_format = find_depth_format(&device)?;
        let support = surface.query_support(device.physical_device)?;
        let surface_format = choose_surface_format(&support.formats)?;
        log::info!("Color format {:?}, depth format {:?}", surface_format.format, depth_format);

        let mut renderer = Self {
            swapchain: None,
            frames: Vec::new(),
            command_pool: vk::CommandPool::null(),
            pipeline: GraphicsPipeline::default(),
            render_pass: vk::RenderPass::null(),
            descriptors,
            uniforms,
            mesh,
            texture,
            swapchain_options: SwapchainOptions {
                surface_format,
                preferred_present_mode: config.present_mode(),
                render_pass: vk::RenderPass::null(),
                depth_format,
            },
            clear_color: config.graphics.clear_color,
            started: Instant::now(),
            device,
            surface,
            window,
        };

        // From here on a failure still tears everything down through Drop
        renderer.render_pass = create_render_pass(&renderer.device, surface_format.format, depth_format)?;
        renderer.swapchain_options.render_pass = renderer.render_pass;
        renderer.pipeline = renderer.create_pipeline(config)?;
        renderer.command_pool = renderer.create_command_pool()?;
        renderer.frames = FrameSlot::create_all(&renderer.device, renderer.command_pool, frames_in_flight)?;

        if !renderer.recreate_swapchain()? {
            log::info!("Window has zero size, swapchain deferred");
        }

        log::info!(
            "Vulkan initialized ({} frames in flight, {} mip levels)",
            frames_in_flight,
            renderer.texture.mip_levels()
        );
        Ok(renderer)
    }

    fn create_pipeline(&self, config: &Config) -> Result<GraphicsPipeline> {
        let vert = load_shader_module(&self.device, &config.assets.vertex_shader)?;
        let frag = match load_shader_module(&self.device, &config.assets.fragment_shader) {
            Ok(frag) => frag,
            Err(e) => {
                unsafe { self.device.device.destroy_shader_module(vert, None) };
                return Err(e);
            }
        };

        let pipeline = create_graphics_pipeline(
            &self.device,
            self.render_pass,
            self.descriptors.layout,
            vert,
            frag,
        );

        // Modules are baked into the pipeline
        unsafe {
            self.device.device.destroy_shader_module(vert, None);
            self.device.device.destroy_shader_module(frag, None);
        }

        pipeline
    }

    fn create_command_pool(&self) -> Result<vk::CommandPool> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(self.device.graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = unsafe { self.device.device.create_command_pool(&pool_info, None) }
            .map_err(RenderError::creation("frame command pool"))?;

        Ok(pool)
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }

    fn swapchain(&self) -> Result<&Swapchain> {
        self.swapchain.as_ref().context("Swapchain not initialized")
    }

    fn update_uniforms(&mut self, slot: usize, extent: vk::Extent2D) {
        let aspect = extent.width as f32 / extent.height as f32;
        let seconds = self.started.elapsed().as_secs_f32();
        self.uniforms[slot].write(&UniformBufferObject::spinning(seconds, aspect));
    }
}

impl FrameTarget for Renderer {
    fn wait_for_fence(&mut self, slot: usize) -> Result<()> {
        let fence = self.frames[slot].in_flight_fence;
        unsafe { self.device.device.wait_for_fences(&[fence], true, u64::MAX) }
            .map_err(RenderError::Submission)?;
        Ok(())
    }

    fn acquire_image(&mut self, slot: usize) -> Result<Acquire> {
        let Some(swapchain) = self.swapchain.as_ref() else {
            return Ok(Acquire::OutOfDate);
        };

        match swapchain.acquire_next_image(self.frames[slot].image_available) {
            Ok((index, suboptimal)) => Ok(Acquire::Image { index, suboptimal }),
            Err(RenderError::PresentationStale) => Ok(Acquire::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    fn reset_fence(&mut self, slot: usize) -> Result<()> {
        let fence = self.frames[slot].in_flight_fence;
        unsafe { self.device.device.reset_fences(&[fence]) }
            .context("Failed to reset in-flight fence")?;
        Ok(())
    }

    fn record(&mut self, slot: usize, image_index: u32) -> Result<()> {
        let (extent, framebuffer) = {
            let swapchain = self.swapchain()?;
            let framebuffer = *swapchain
                .framebuffers
                .get(image_index as usize)
                .context("Acquired image has no framebuffer")?;
            (swapchain.extent, framebuffer)
        };

        self.update_uniforms(slot, extent);

        let device = &self.device.device;
        let cmd = self.frames[slot].command_buffer;

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue { float32: self.clear_color },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
            },
        ];

        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(&clear_values);

        let (viewport, scissor) = viewport_and_scissor(extent);

        unsafe {
            device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .context("Failed to reset command buffer")?;
            device
                .begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::builder())
                .context("Failed to begin command buffer")?;

            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline.pipeline);
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[scissor]);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.layout,
                0,
                &[self.descriptors.sets[slot]],
                &[],
            );
            self.mesh.record_draw(device, cmd);
            device.cmd_end_render_pass(cmd);

            device
                .end_command_buffer(cmd)
                .context("Failed to record command buffer")?;
        }

        Ok(())
    }

    fn submit(&mut self, slot: usize) -> Result<()> {
        let frame = &self.frames[slot];

        let wait_semaphores = [frame.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [frame.render_finished];
        let command_buffers = [frame.command_buffer];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info.build()],
                frame.in_flight_fence,
            )
        }
        .map_err(RenderError::Submission)?;

        Ok(())
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
        let swapchain = self.swapchain()?;
        let wait = [self.frames[slot].render_finished];

        match swapchain.present(self.device.present_queue, image_index, &wait) {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) | Err(RenderError::PresentationStale) => Ok(PresentOutcome::Stale),
            Err(e) => Err(e.into()),
        }
    }

    fn recreate_swapchain(&mut self) -> Result<bool> {
        let size = self.window.inner_size();
        if size.width == 0 || size.height == 0 {
            return Ok(false);
        }

        // The surface may still report a zero current extent while minimizing
        let support = self.surface.query_support(self.device.physical_device)?;
        let requested = vk::Extent2D {
            width: size.width,
            height: size.height,
        };
        if is_zero_extent(choose_extent(&support.capabilities, requested)) {
            return Ok(false);
        }

        self.device.wait_idle()?;
        self.swapchain = None;

        self.swapchain = Some(Swapchain::new(
            &self.device,
            &self.surface,
            &support,
            requested,
            &self.swapchain_options,
        )?);

        Ok(true)
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        // Wait for GPU to finish before destroying anything
        let _ = self.device.wait_idle();

        self.swapchain = None;

        let device = &self.device.device;
        for frame in &self.frames {
            frame.destroy(device);
        }
        unsafe {
            // Also frees the frame command buffers
            device.destroy_command_pool(self.command_pool, None);
            self.pipeline.destroy(device);
            device.destroy_render_pass(self.render_pass, None);
        }

        log::info!("Cleanup complete");
    }
}
