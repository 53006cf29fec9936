use crate::{
    attachments::Attachment,
    commands::CommandBufferAllocator,
    context::Context,
    display::Display,
    error::submit_error,
    image,
    swapchain::{SurfaceState, SwapChainPresenter},
    sync::FrameSynchronizer,
};

use vulkanalia::prelude::v1_0::*;
use anyhow::Result;
use log::*;

/// Everything a frame needs once recording may begin: the slot's
/// primary command buffer, the frame slot index (for per-slot
/// resources like descriptor sets) and the swapchain image index
/// the frame will render into.
pub struct Frame {
    pub command_buffer: vk::CommandBuffer,
    pub frame_index: usize,
    pub image_index: usize,
}

/// Owns the render pass, the per-image framebuffers, the color
/// and depth attachments, and the frame-pacing machinery. The
/// swapchain image views are borrowed from the presenter; the
/// color/depth attachments are owned and destroyed here.
///
/// One color-subpass render pass: with more than one sample the
/// owned color buffer is the subpass color attachment and the
/// swapchain image the resolve target, with a single sample the
/// swapchain image itself is the color attachment and no resolve
/// list is produced.
pub struct RenderTarget {
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    color: Option<Attachment>,
    depth: Option<Attachment>,
    presenter: SwapChainPresenter,
    sync: FrameSynchronizer,
    commands: CommandBufferAllocator,
    samples: vk::SampleCountFlags,
    buffer_count: usize,
    frame_index: usize,
    clear_color: [f32; 4],
}

impl RenderTarget {
    pub fn new(
        context: &Context,
        display: &Display,
        buffer_count: usize,
        samples: vk::SampleCountFlags,
        clear_color: [f32; 4],
    ) -> Result<Self> {
        let presenter = SwapChainPresenter::new(context, display)?;
        let extent = presenter.extent;

        let color = if samples != vk::SampleCountFlags::_1 {
            Some(Attachment::color(context, extent, presenter.format, samples, clear_color)?)
        } else {
            None
        };
        let depth = Attachment::depth(context, extent, samples)?;

        let render_pass = create_render_pass(context, presenter.format, samples)?;
        let framebuffers =
            create_framebuffers(context, render_pass, &presenter, color.as_ref(), &depth)?;
        let depth = Some(depth);

        let sync = FrameSynchronizer::new(context, buffer_count, presenter.image_count())?;
        let commands = CommandBufferAllocator::new_primary(context, buffer_count)?;

        info!(
            "Render target created ({} frame slots, {} swapchain images).",
            buffer_count,
            presenter.image_count()
        );

        Ok(Self {
            render_pass,
            framebuffers,
            color,
            depth,
            presenter,
            sync,
            commands,
            samples,
            buffer_count,
            frame_index: 0,
            clear_color,
        })
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.presenter.extent
    }

    pub fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    pub fn framebuffer(&self, image_index: usize) -> vk::Framebuffer {
        self.framebuffers[image_index]
    }

    /// The primary allocator, for spawning the secondary
    /// allocators worker threads record into.
    pub fn command_allocator(&self) -> &CommandBufferAllocator {
        &self.commands
    }

    pub fn should_skip(&self) -> bool {
        self.presenter.should_skip()
    }

    /// Paces the CPU to the frame slot, acquires a swapchain image
    /// and opens the slot's primary command buffer. Returns `None`
    /// when the surface went stale during acquisition; the caller
    /// recreates and retries on the next iteration.
    pub fn begin_frame(&mut self, context: &Context) -> Result<Option<Frame>> {
        let (image_available, in_flight) = {
            let slot = self.sync.acquire_slot(context, self.frame_index)?;
            (slot.image_available, slot.in_flight)
        };
        let (image_index, stale) = self.presenter.acquire_next_image(context, image_available)?;
        if stale {
            return Ok(None);
        }

        // A previous frame may still be rendering into this image.
        self.sync.wait_image(context, image_index, in_flight)?;

        let command_buffer = self.commands.lease(&context.device, self.frame_index)?;
        let info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            context.device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;
            context.device.begin_command_buffer(command_buffer, &info)?;
        }

        Ok(Some(Frame {
            command_buffer,
            frame_index: self.frame_index,
            image_index,
        }))
    }

    /// Opens the render pass on the frame's primary buffer. Draw
    /// commands are recorded into secondary buffers and executed
    /// with [`RenderTarget::execute_secondaries`]; the primary
    /// itself records no draws.
    pub fn begin_render_pass(&self, context: &Context, frame: &Frame) {
        let render_area = vk::Rect2D::builder()
            .offset(vk::Offset2D::default())
            .extent(self.presenter.extent);

        let color_clear_value = vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.clear_color,
            },
        };
        let depth_clear_value = vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        };

        let clear_values = &[color_clear_value, depth_clear_value];
        let info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass)
            .framebuffer(self.framebuffers[frame.image_index])
            .render_area(render_area)
            .clear_values(clear_values);

        unsafe {
            context.device.cmd_begin_render_pass(
                frame.command_buffer,
                &info,
                vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
            );
        }
    }

    pub fn execute_secondaries(
        &self,
        context: &Context,
        frame: &Frame,
        secondaries: &[vk::CommandBuffer],
    ) {
        if secondaries.is_empty() {
            return;
        }

        unsafe {
            context.device
                .cmd_execute_commands(frame.command_buffer, secondaries);
        }
    }

    pub fn end_render_pass(&self, context: &Context, frame: &Frame) {
        unsafe { context.device.cmd_end_render_pass(frame.command_buffer) };
    }

    /// Closes the primary buffer, submits it against the slot's
    /// semaphores and fence, presents, and advances the frame
    /// index. Returns `true` when presentation reported a stale
    /// surface and the target must be recreated.
    pub fn submit_frame(&mut self, context: &Context, frame: Frame) -> Result<bool> {
        unsafe { context.device.end_command_buffer(frame.command_buffer)? };

        let slot = self.sync.slot(frame.frame_index)?;
        let (image_available, render_finished, in_flight) =
            (slot.image_available, slot.render_finished, slot.in_flight);

        let wait_semaphores = &[image_available];
        let wait_stages = &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = &[frame.command_buffer];
        let signal_semaphores = &[render_finished];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(wait_semaphores)
            .wait_dst_stage_mask(wait_stages)
            .command_buffers(command_buffers)
            .signal_semaphores(signal_semaphores);

        unsafe {
            context.device
                .queue_submit(context.graphics_queue, &[submit_info], in_flight)
                .map_err(|code| submit_error(code, "frame submit"))?;
        }

        self.presenter.present(context, frame.image_index, render_finished)?;

        self.frame_index = (self.frame_index + 1) % self.buffer_count;
        Ok(self.presenter.state() == SurfaceState::NeedsRecreate)
    }

    /// Tears the extent-dependent half of the target down and
    /// rebuilds it against the display's current extent. Returns
    /// `false` when the extent is degenerate and rendering must
    /// stay skipped until the next resize.
    pub fn recreate(&mut self, context: &Context, display: &mut Display) -> Result<bool> {
        context.wait_idle()?;

        for framebuffer in self.framebuffers.drain(..) {
            unsafe { context.device.destroy_framebuffer(framebuffer, None) };
        }
        if let Some(color) = self.color.take() {
            color.destroy(context);
        }
        if let Some(depth) = self.depth.take() {
            depth.destroy(context);
        }
        unsafe { context.device.destroy_render_pass(self.render_pass, None) };
        self.render_pass = vk::RenderPass::null();

        if !self.presenter.recreate(context, display, display.extent())? {
            // Zero extent. The old attachments are already gone;
            // rebuild nothing and wait for a usable size.
            return Ok(false);
        }

        let extent = self.presenter.extent;
        self.color = if self.samples != vk::SampleCountFlags::_1 {
            Some(Attachment::color(
                context,
                extent,
                self.presenter.format,
                self.samples,
                self.clear_color,
            )?)
        } else {
            None
        };
        let depth = Attachment::depth(context, extent, self.samples)?;

        self.render_pass = create_render_pass(context, self.presenter.format, self.samples)?;
        self.framebuffers = create_framebuffers(
            context,
            self.render_pass,
            &self.presenter,
            self.color.as_ref(),
            &depth,
        )?;
        self.depth = Some(depth);

        // Every fence and semaphore is rebuilt so that a frame
        // skipped mid-flight cannot leave a fence unsignaled.
        self.sync.reset(context, self.presenter.image_count())?;
        self.frame_index = 0;

        Ok(true)
    }

    /// Destroys everything the target owns. The caller must have
    /// waited for device idle first.
    pub fn terminate(&mut self, context: &Context) {
        for framebuffer in self.framebuffers.drain(..) {
            unsafe { context.device.destroy_framebuffer(framebuffer, None) };
        }
        if let Some(color) = self.color.take() {
            color.destroy(context);
        }
        if let Some(depth) = self.depth.take() {
            depth.destroy(context);
        }
        if self.render_pass != vk::RenderPass::null() {
            unsafe { context.device.destroy_render_pass(self.render_pass, None) };
        }

        self.commands.terminate(&context.device);
        self.sync.destroy(context);
        self.presenter.destroy(context);
    }
}

/// One subpass with color + depth, plus two external dependencies
/// so the pass waits for the presenter to be done reading the
/// image and releases it back in a presentable state.
fn create_render_pass(
    context: &Context,
    format: vk::Format,
    samples: vk::SampleCountFlags,
) -> Result<vk::RenderPass> {
    let multisampled = samples != vk::SampleCountFlags::_1;

    // With multisampling the first attachment is the owned color
    // buffer and the swapchain image only receives the resolve;
    // otherwise the swapchain image is rendered to directly.
    let color_attachment = vk::AttachmentDescription::builder()
        .format(format)
        .samples(samples)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(if multisampled {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        } else {
            vk::ImageLayout::PRESENT_SRC_KHR
        });

    let depth_attachment = vk::AttachmentDescription::builder()
        .format(image::get_depth_format(context)?)
        .samples(samples)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

    let resolve_attachment = vk::AttachmentDescription::builder()
        .format(format)
        .samples(vk::SampleCountFlags::_1)
        .load_op(vk::AttachmentLoadOp::DONT_CARE)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR);

    let color_attachment_ref = vk::AttachmentReference::builder()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    let depth_attachment_ref = vk::AttachmentReference::builder()
        .attachment(1)
        .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
    let resolve_attachment_ref = vk::AttachmentReference::builder()
        .attachment(2)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);

    let color_attachments = &[color_attachment_ref];
    let resolve_attachments = &[resolve_attachment_ref];
    let mut subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(color_attachments)
        .depth_stencil_attachment(&depth_attachment_ref);
    if multisampled {
        subpass = subpass.resolve_attachments(resolve_attachments);
    }

    // Inbound: wait for whatever last touched the image (the
    // presentation engine reads it) before writing color.
    let dependency_in = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::BOTTOM_OF_PIPE)
        .src_access_mask(vk::AccessFlags::MEMORY_READ)
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        )
        .dependency_flags(vk::DependencyFlags::BY_REGION);

    // Outbound: make color writes visible before the image is
    // read again outside the pass.
    let dependency_out = vk::SubpassDependency::builder()
        .src_subpass(0)
        .dst_subpass(vk::SUBPASS_EXTERNAL)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        )
        .dst_stage_mask(vk::PipelineStageFlags::BOTTOM_OF_PIPE)
        .dst_access_mask(vk::AccessFlags::MEMORY_READ)
        .dependency_flags(vk::DependencyFlags::BY_REGION);

    let mut attachments = vec![*color_attachment, *depth_attachment];
    if multisampled {
        attachments.push(*resolve_attachment);
    }
    let subpasses = &[*subpass];
    let dependencies = &[*dependency_in, *dependency_out];
    let info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(subpasses)
        .dependencies(dependencies);

    let render_pass = unsafe { context.device.create_render_pass(&info, None)? };
    info!("Render pass created.");

    Ok(render_pass)
}

/// One framebuffer per swapchain image, each over the same owned
/// color/depth views plus that image's borrowed swapchain view.
fn create_framebuffers(
    context: &Context,
    render_pass: vk::RenderPass,
    presenter: &SwapChainPresenter,
    color: Option<&Attachment>,
    depth: &Attachment,
) -> Result<Vec<vk::Framebuffer>> {
    let extent = presenter.extent;

    presenter
        .image_views
        .iter()
        .map(|&swapchain_view| {
            let attachments = match color {
                Some(color) => vec![color.view, depth.view, swapchain_view],
                None => vec![swapchain_view, depth.view],
            };

            let info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            Ok(unsafe { context.device.create_framebuffer(&info, None)? })
        })
        .collect()
}
