use crate::{
    context::Context,
    error::{FatalError, InvalidFrameIndex, InvalidImageIndex},
};

use vulkanalia::prelude::v1_0::*;
use anyhow::{anyhow, Result};
use log::*;

/// Synchronization objects for one buffered frame:
/// - the image-available semaphore orders the swapchain
///   acquisition before any color-attachment write;
/// - the render-finished semaphore orders rendering before the
///   present call;
/// - the in-flight fence is the only CPU-visible signal that the
///   GPU is done with this slot's command buffer.
pub struct FrameSlot {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
}

impl FrameSlot {
    fn new(device: &Device) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();

        // The fence starts signaled: the first wait on a slot
        // that has never been submitted must not block.
        let fence_info = vk::FenceCreateInfo::builder()
            .flags(vk::FenceCreateFlags::SIGNALED);

        Ok(unsafe {
            Self {
                image_available: device.create_semaphore(&semaphore_info, None)?,
                render_finished: device.create_semaphore(&semaphore_info, None)?,
                in_flight: device.create_fence(&fence_info, None)?,
            }
        })
    }

    fn destroy(&self, device: &Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight, None);
        }
    }
}

/// Bounds the number of outstanding frames to the buffer count.
///
/// The CPU records and submits frame N while the GPU may still be
/// consuming frames N-1..N-bufferCount+1; a slot is reused only
/// after its fence is observed signaled, so a slot's command
/// buffer is never re-recorded while the GPU reads it. Exactly
/// one submission passes a given slot's fence between consecutive
/// waits on it.
pub struct FrameSynchronizer {
    slots: Vec<FrameSlot>,
    /// Fence of the frame slot last handed each swapchain image,
    /// indexed by acquisition index (which is not the slot
    /// index). Null until an image has been used once.
    images_in_flight: Vec<vk::Fence>,
}

impl FrameSynchronizer {
    pub fn new(context: &Context, buffer_count: usize, image_count: usize) -> Result<Self> {
        let slots = (0..buffer_count)
            .map(|_| FrameSlot::new(&context.device))
            .collect::<Result<Vec<_>>>()?;

        info!("Sync objects created for {} frame slots.", buffer_count);
        Ok(Self {
            slots,
            images_in_flight: vec![vk::Fence::null(); image_count],
        })
    }

    pub fn buffer_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, frame_index: usize) -> Result<&FrameSlot> {
        check_frame_index(frame_index, self.slots.len())?;
        Ok(&self.slots[frame_index])
    }

    /// Blocks (a GPU-side wait, not a busy spin) until the fence
    /// for `frame_index` is signaled, then resets it for the
    /// coming submission. Device loss here is fatal and never
    /// retried.
    pub fn acquire_slot(&self, context: &Context, frame_index: usize) -> Result<&FrameSlot> {
        let slot = self.slot(frame_index)?;
        wait_fence(context, slot.in_flight, "frame slot wait")?;

        unsafe { context.device.reset_fences(&[slot.in_flight])? };
        Ok(slot)
    }

    /// An image acquired again while a previous frame still
    /// renders to it must wait for that frame's fence; the fence
    /// of the current slot then takes its place.
    pub fn wait_image(
        &mut self,
        context: &Context,
        image_index: usize,
        slot_fence: vk::Fence,
    ) -> Result<()> {
        check_image_index(image_index, self.images_in_flight.len())?;

        let fence = self.images_in_flight[image_index];
        if fence != vk::Fence::null() {
            wait_fence(context, fence, "image in flight wait")?;
        }

        self.images_in_flight[image_index] = slot_fence;
        Ok(())
    }

    /// Rebuilds every slot and clears the image-fence array, so
    /// no stale wait can occur after a render-target recreation.
    /// Only safe with the device idle, which recreate guarantees.
    pub fn reset(&mut self, context: &Context, image_count: usize) -> Result<()> {
        for slot in &self.slots {
            slot.destroy(&context.device);
        }

        self.slots = (0..self.slots.len())
            .map(|_| FrameSlot::new(&context.device))
            .collect::<Result<Vec<_>>>()?;
        self.images_in_flight = vec![vk::Fence::null(); image_count];
        Ok(())
    }

    /// Destroys all sync objects. Destroying a fence or semaphore
    /// still referenced by a pending submission is undefined
    /// behavior GPU-side, so the caller must have waited the
    /// device idle first.
    pub fn destroy(&mut self, context: &Context) {
        for slot in &self.slots {
            slot.destroy(&context.device);
        }

        self.slots.clear();
        self.images_in_flight.clear();
        info!("Sync objects destroyed.");
    }
}

fn check_frame_index(index: usize, count: usize) -> Result<(), InvalidFrameIndex> {
    if index < count {
        Ok(())
    } else {
        Err(InvalidFrameIndex { index, count })
    }
}

fn check_image_index(index: usize, count: usize) -> Result<(), InvalidImageIndex> {
    if index < count {
        Ok(())
    } else {
        Err(InvalidImageIndex { index, count })
    }
}

fn wait_fence(context: &Context, fence: vk::Fence, op: &'static str) -> Result<()> {
    let result = unsafe {
        context.device.wait_for_fences(&[fence], true, u64::MAX)
    };

    match result {
        Ok(vk::SuccessCode::TIMEOUT) => Err(anyhow!(FatalError::FenceTimeout(op))),
        Ok(_) => Ok(()),
        Err(vk::ErrorCode::DEVICE_LOST) => Err(anyhow!(FatalError::DeviceLost(op))),
        Err(code) => Err(anyhow!("{} failed: {:?}", op, code)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_index_must_be_below_buffer_count() {
        assert!(check_frame_index(0, 1).is_ok());
        assert!(check_frame_index(2, 3).is_ok());

        let error = check_frame_index(3, 3).unwrap_err();
        assert_eq!(error, InvalidFrameIndex { index: 3, count: 3 });
        assert_eq!(
            error.to_string(),
            "invalid frame index 3 (buffer count is 3)"
        );
    }

    #[test]
    fn image_index_must_be_below_image_count() {
        assert!(check_image_index(2, 3).is_ok());

        let error = check_image_index(3, 3).unwrap_err();
        assert_eq!(error, InvalidImageIndex { index: 3, count: 3 });
        assert_eq!(
            error.to_string(),
            "invalid image index 3 (3 swapchain images)"
        );
    }
}
