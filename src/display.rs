use vulkanalia::prelude::v1_0::*;

/// The presentation side of the window: the Vulkan surface plus
/// the extent last reported by the windowing system. The window
/// event loop feeds resize notifications in; the presenter reads
/// the extent out when it has to rebuild the swapchain.
///
/// A zero extent means the window is minimised (or being
/// resized through zero); drawing must stall until a non-zero
/// extent is reported again.
pub struct Display {
    pub surface: vk::SurfaceKHR,
    extent: vk::Extent2D,
    resized: bool,
}

impl Display {
    pub fn new(surface: vk::SurfaceKHR, width: u32, height: u32) -> Self {
        Self {
            surface,
            extent: vk::Extent2D { width, height },
            resized: false,
        }
    }

    /// Called from the window event loop on every resize event,
    /// including resizes to zero area.
    pub fn report_extent(&mut self, width: u32, height: u32) {
        self.extent = vk::Extent2D { width, height };
        self.resized = true;
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn is_zero_extent(&self) -> bool {
        self.extent.width == 0 || self.extent.height == 0
    }

    /// Consumes the pending resize notification, if any.
    pub fn take_resized(&mut self) -> bool {
        std::mem::take(&mut self.resized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_notification_is_consumed_once() {
        let mut display = Display::new(vk::SurfaceKHR::null(), 800, 600);
        assert!(!display.take_resized());

        display.report_extent(1024, 576);
        assert!(display.take_resized());
        assert!(!display.take_resized());
        assert_eq!(display.extent().width, 1024);
    }

    #[test]
    fn zero_extent_is_degenerate() {
        let mut display = Display::new(vk::SurfaceKHR::null(), 800, 600);
        assert!(!display.is_zero_extent());

        display.report_extent(0, 0);
        assert!(display.is_zero_extent());

        display.report_extent(800, 600);
        assert!(!display.is_zero_extent());
    }
}
