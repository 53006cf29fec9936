use crate::{context::Context, image::*};

use vulkanalia::prelude::v1_0::*;
use anyhow::Result;

/// An owned render-target attachment: the image, its memory and
/// view, plus the clear value used at the start of the pass.
/// The swapchain attachment is *not* one of these — its images
/// belong to the presentation surface and are borrowed per
/// framebuffer.
pub struct Attachment {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub clear_value: vk::ClearValue,
}

impl Attachment {
    /// A color buffer matching the swapchain format, used as the
    /// multisampled render destination that resolves into the
    /// swapchain image.
    pub fn color(
        context: &Context,
        extent: vk::Extent2D,
        format: vk::Format,
        samples: vk::SampleCountFlags,
        clear_color: [f32; 4],
    ) -> Result<Self> {
        let (image, memory) = create_image(
            context,
            extent.width,
            extent.height,
            samples,
            format,
            // TRANSIENT because the multisampled contents never
            // outlive the pass; they resolve into the swapchain
            // image.
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
        )?;

        let view = create_image_view(&context.device, image, format, vk::ImageAspectFlags::COLOR)?;

        Ok(Self {
            image,
            memory,
            view,
            format,
            samples,
            clear_value: vk::ClearValue {
                color: vk::ClearColorValue { float32: clear_color },
            },
        })
    }

    pub fn depth(
        context: &Context,
        extent: vk::Extent2D,
        samples: vk::SampleCountFlags,
    ) -> Result<Self> {
        let format = get_depth_format(context)?;
        let (image, memory) = create_image(
            context,
            extent.width,
            extent.height,
            samples,
            format,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        )?;

        let view = create_image_view(&context.device, image, format, vk::ImageAspectFlags::DEPTH)?;

        Ok(Self {
            image,
            memory,
            view,
            format,
            samples,
            clear_value: vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
            },
        })
    }

    pub fn destroy(&self, context: &Context) {
        unsafe {
            context.device.destroy_image_view(self.view, None);
            context.device.destroy_image(self.image, None);
            context.device.free_memory(self.memory, None);
        }
    }
}
