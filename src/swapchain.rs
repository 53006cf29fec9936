use crate::{
    context::Context,
    display::Display,
    error::submit_error,
    image::create_image_view,
};

use vulkanalia::{
    prelude::v1_0::*,
    vk::KhrSurfaceExtension,
    vk::KhrSwapchainExtension,
};
use anyhow::Result;
use log::*;

/// Surface health as observed through acquisition and
/// presentation results.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfaceState {
    /// Images can be acquired and presented.
    Valid,
    /// The surface reported out-of-date or suboptimal; the
    /// caller must skip drawing and recreate before the next
    /// attempt.
    NeedsRecreate,
    /// The surface itself is gone; only a full reinitialization
    /// of the display can recover.
    Lost,
}

/// Owns the set of presentable images. The images themselves
/// belong to the presentation surface, never to the renderer; we
/// hold their handles and views, acquire the next one each frame,
/// and hand it back through the present call.
///
/// Image indices returned by acquisition are only valid until the
/// next acquisition; they must not be cached across frames.
pub struct SwapChainPresenter {
    swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    state: SurfaceState,
    skip: bool,
}

impl SwapChainPresenter {
    pub fn new(context: &Context, display: &Display) -> Result<Self> {
        let mut presenter = Self {
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            image_views: Vec::new(),
            format: vk::Format::UNDEFINED,
            extent: vk::Extent2D::default(),
            state: SurfaceState::Valid,
            skip: false,
        };

        presenter.build(context, display, display.extent())?;
        Ok(presenter)
    }

    pub fn state(&self) -> SurfaceState {
        self.state
    }

    /// True while the display extent is degenerate: drawing
    /// stalls, and no surface work happens until a non-zero
    /// extent is reported again.
    pub fn should_skip(&self) -> bool {
        self.skip
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Acquires the next presentable image, signaling
    /// `image_available` once it is ready. Returns the image
    /// index and whether the surface must be rebuilt; when the
    /// flag is set the index is stale and this frame must be
    /// skipped.
    pub fn acquire_next_image(
        &mut self,
        context: &Context,
        image_available: vk::Semaphore,
    ) -> Result<(usize, bool)> {
        let result = unsafe {
            context.device.acquire_next_image_khr(
                self.swapchain,
                u64::MAX,
                image_available,
                vk::Fence::null(),
            )
        };

        match result {
            // A suboptimal acquisition still hands out a usable
            // image, but the surface properties no longer match;
            // treat it like out-of-date and rebuild before the
            // next frame.
            Ok((index, vk::SuccessCode::SUBOPTIMAL_KHR)) => {
                self.state = SurfaceState::NeedsRecreate;
                Ok((index as usize, true))
            },
            Ok((index, _)) => Ok((index as usize, false)),
            Err(vk::ErrorCode::OUT_OF_DATE_KHR) => {
                self.state = SurfaceState::NeedsRecreate;
                Ok((0, true))
            },
            Err(vk::ErrorCode::SURFACE_LOST_KHR) => {
                self.state = SurfaceState::Lost;
                Err(submit_error(vk::ErrorCode::SURFACE_LOST_KHR, "image acquisition"))
            },
            Err(code) => Err(submit_error(code, "image acquisition")),
        }
    }

    /// Issues the present call, gated on the frame's
    /// render-finished semaphore. Out-of-date and suboptimal
    /// results are soft failures: the presenter transitions to
    /// NeedsRecreate and the call still succeeds.
    pub fn present(
        &mut self,
        context: &Context,
        image_index: usize,
        render_finished: vk::Semaphore,
    ) -> Result<()> {
        let wait_semaphores = &[render_finished];
        let swapchains = &[self.swapchain];
        let image_indices = &[image_index as u32];
        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(swapchains)
            .image_indices(image_indices);

        let result = unsafe {
            context.device.queue_present_khr(context.graphics_queue, &info)
        };

        match result {
            Ok(vk::SuccessCode::SUBOPTIMAL_KHR) => {
                self.state = SurfaceState::NeedsRecreate;
                Ok(())
            },
            Ok(_) => Ok(()),
            Err(vk::ErrorCode::OUT_OF_DATE_KHR) => {
                self.state = SurfaceState::NeedsRecreate;
                Ok(())
            },
            Err(vk::ErrorCode::SURFACE_LOST_KHR) => {
                self.state = SurfaceState::Lost;
                Err(submit_error(vk::ErrorCode::SURFACE_LOST_KHR, "present"))
            },
            Err(code) => Err(submit_error(code, "present")),
        }
    }

    /// Tears down and rebuilds the image set for `new_extent`.
    /// A zero-area extent leaves the old swapchain in place and
    /// enters the skip condition instead; the next recreate with
    /// a real extent resumes drawing. The caller must have waited
    /// the device idle.
    ///
    /// Returns whether the swapchain was actually rebuilt.
    pub fn recreate(&mut self, context: &Context, display: &Display, new_extent: vk::Extent2D) -> Result<bool> {
        if new_extent.width == 0 || new_extent.height == 0 {
            self.skip = true;
            trace!("Degenerate extent reported; presentation paused.");
            return Ok(false);
        }

        self.destroy(context);
        self.build(context, display, new_extent)?;

        self.skip = false;
        self.state = SurfaceState::Valid;
        Ok(true)
    }

    fn build(&mut self, context: &Context, display: &Display, extent: vk::Extent2D) -> Result<()> {
        let capabilities = unsafe {
            context.instance.get_physical_device_surface_capabilities_khr(
                context.physical_device,
                display.surface,
            )?
        };
        let formats = unsafe {
            context.instance.get_physical_device_surface_formats_khr(
                context.physical_device,
                display.surface,
            )?
        };
        let present_modes = unsafe {
            context.instance.get_physical_device_surface_present_modes_khr(
                context.physical_device,
                display.surface,
            )?
        };

        let surface_format = choose_surface_format(&formats);
        let present_mode = choose_present_mode(&present_modes);
        let extent = clamp_extent(extent, &capabilities);

        // One image more than the driver minimum keeps acquire
        // from stalling on the presentation engine; clamp against
        // the maximum (0 means unbounded).
        let mut image_count = capabilities.min_image_count + 1;
        if capabilities.max_image_count != 0 && image_count > capabilities.max_image_count {
            image_count = capabilities.max_image_count;
        }

        let info = vk::SwapchainCreateInfoKHR::builder()
            .surface(display.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(vk::SwapchainKHR::null());

        self.swapchain = unsafe { context.device.create_swapchain_khr(&info, None)? };
        self.images = unsafe { context.device.get_swapchain_images_khr(self.swapchain)? };
        self.format = surface_format.format;
        self.extent = extent;

        self.image_views = self
            .images
            .iter()
            .map(|&image| {
                create_image_view(
                    &context.device,
                    image,
                    self.format,
                    vk::ImageAspectFlags::COLOR,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            "Swapchain created: {} images at {}x{}.",
            self.images.len(),
            extent.width,
            extent.height,
        );
        Ok(())
    }

    pub fn destroy(&mut self, context: &Context) {
        unsafe {
            self.image_views
                .iter()
                .for_each(|&view| context.device.destroy_image_view(view, None));
            context.device.destroy_swapchain_khr(self.swapchain, None);
        }

        self.image_views.clear();
        self.images.clear();
        self.swapchain = vk::SwapchainKHR::null();
    }
}

fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    // Prefer 32-bit sRGB; fall back on whatever the surface
    // offers first.
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .cloned()
        .unwrap_or(formats[0])
}

fn choose_present_mode(present_modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    // MAILBOX replaces queued images instead of blocking (triple
    // buffering); FIFO is the only mode guaranteed to exist.
    present_modes
        .iter()
        .cloned()
        .find(|&m| m == vk::PresentModeKHR::MAILBOX)
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

fn clamp_extent(
    desired: vk::Extent2D,
    capabilities: &vk::SurfaceCapabilitiesKHR,
) -> vk::Extent2D {
    // Window managers that allow swapchain extents different
    // from the surface extent report u32::MAX; otherwise the
    // current extent is mandatory.
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired.width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired.height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(current: (u32, u32), min: (u32, u32), max: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        let mut capabilities = vk::SurfaceCapabilitiesKHR::default();
        capabilities.current_extent = vk::Extent2D { width: current.0, height: current.1 };
        capabilities.min_image_extent = vk::Extent2D { width: min.0, height: min.1 };
        capabilities.max_image_extent = vk::Extent2D { width: max.0, height: max.1 };
        capabilities
    }

    #[test]
    fn mandatory_extent_wins_over_desired() {
        let capabilities = capabilities((800, 600), (1, 1), (4096, 4096));
        let extent = clamp_extent(vk::Extent2D { width: 1920, height: 1080 }, &capabilities);
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn free_extent_is_clamped_to_the_surface_limits() {
        let capabilities = capabilities((u32::MAX, u32::MAX), (64, 64), (2048, 2048));

        let small = clamp_extent(vk::Extent2D { width: 8, height: 8 }, &capabilities);
        assert_eq!((small.width, small.height), (64, 64));

        let large = clamp_extent(vk::Extent2D { width: 8192, height: 8192 }, &capabilities);
        assert_eq!((large.width, large.height), (2048, 2048));
    }

    #[test]
    fn srgb_format_is_preferred() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];

        assert_eq!(choose_surface_format(&formats).format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn first_format_is_the_fallback() {
        let formats = [vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];

        assert_eq!(choose_surface_format(&formats).format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn fifo_is_the_fallback_present_mode() {
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::IMMEDIATE]),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX]),
            vk::PresentModeKHR::MAILBOX
        );
    }
}
