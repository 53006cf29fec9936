use crate::{context::Context, error::submit_error};

use vulkanalia::prelude::v1_0::*;
use anyhow::Result;
use log::*;

/// Owns one command pool and the buffers allocated from it.
///
/// Buffers are leased by index and never freed individually; the
/// whole pool goes away in one [`CommandBufferAllocator::terminate`]
/// call. A primary allocator hands out buffers that are submitted
/// directly to a queue; a secondary allocator, created with
/// [`CommandBufferAllocator::new_secondary`], hands out buffers
/// that may only be recorded inside a primary buffer's render-pass
/// scope, with the inheritance information (render pass +
/// framebuffer) supplied by whoever records them.
pub struct CommandBufferAllocator {
    pool: vk::CommandPool,
    buffers: Vec<vk::CommandBuffer>,
    level: vk::CommandBufferLevel,
}

impl CommandBufferAllocator {
    pub fn new_primary(context: &Context, buffer_count: usize) -> Result<Self> {
        Self::new(context, vk::CommandBufferLevel::PRIMARY, buffer_count)
    }

    /// A secondary allocator whose buffers record inside the
    /// parent's render-pass scope. The parent only scopes the
    /// recording; each worker thread owns one of these so no
    /// pool is ever touched from two threads.
    pub fn new_secondary(
        context: &Context,
        _parent: &CommandBufferAllocator,
        buffer_count: usize,
    ) -> Result<Self> {
        Self::new(context, vk::CommandBufferLevel::SECONDARY, buffer_count)
    }

    fn new(context: &Context, level: vk::CommandBufferLevel, buffer_count: usize) -> Result<Self> {
        // Allow buffers to be re-recorded individually; the
        // frame loop resets one buffer per frame slot rather
        // than the whole pool.
        let info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(context.graphics_queue_family);

        let pool = unsafe { context.device.create_command_pool(&info, None)? };

        let mut allocator = Self {
            pool,
            buffers: Vec::new(),
            level,
        };
        allocator.grow(&context.device, buffer_count)?;

        trace!("Command buffer allocator created ({} buffers).", buffer_count);
        Ok(allocator)
    }

    /// Returns the buffer at `index`, allocating more from the
    /// pool if the index has not been leased before.
    pub fn lease(&mut self, device: &Device, index: usize) -> Result<vk::CommandBuffer> {
        if index >= self.buffers.len() {
            let missing = index + 1 - self.buffers.len();
            self.grow(device, missing)?;
        }

        Ok(self.buffers[index])
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_secondary(&self) -> bool {
        self.level == vk::CommandBufferLevel::SECONDARY
    }

    fn grow(&mut self, device: &Device, count: usize) -> Result<()> {
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(self.level)
            .command_buffer_count(count as u32);

        let new = unsafe { device.allocate_command_buffers(&info)? };
        self.buffers.extend(new);
        Ok(())
    }

    /// Frees every allocated buffer in one call and destroys the
    /// pool. Only safe once no fence tied to these buffers is
    /// pending, which the frame synchronizer guarantees before
    /// termination reaches this point.
    pub fn terminate(&mut self, device: &Device) {
        unsafe {
            if !self.buffers.is_empty() {
                device.free_command_buffers(self.pool, &self.buffers);
            }
            device.destroy_command_pool(self.pool, None);
        }

        self.buffers.clear();
    }
}

/// Allocates and begins a throwaway primary buffer for a
/// transfer-sized batch of commands.
pub fn begin_single_command(
    context: &Context,
    pool: vk::CommandPool,
) -> Result<vk::CommandBuffer> {
    let info = vk::CommandBufferAllocateInfo::builder()
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_pool(pool)
        .command_buffer_count(1);

    let command_buffer = unsafe { context.device.allocate_command_buffers(&info)?[0] };

    let info = vk::CommandBufferBeginInfo::builder()
        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

    unsafe { context.device.begin_command_buffer(command_buffer, &info)? };
    Ok(command_buffer)
}

/// Ends, submits and waits for a single-use buffer, then frees
/// it. Staging copies are rare relative to draws, so the
/// queue-idle wait is acceptable here.
pub fn end_single_command(
    context: &Context,
    pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
) -> Result<()> {
    unsafe {
        context.device.end_command_buffer(command_buffer)?;

        let command_buffers = &[command_buffer];
        let info = vk::SubmitInfo::builder().command_buffers(command_buffers);

        context.device
            .queue_submit(context.graphics_queue, &[info], vk::Fence::null())
            .map_err(|code| submit_error(code, "transfer submit"))?;
        context.device
            .queue_wait_idle(context.graphics_queue)
            .map_err(|code| submit_error(code, "transfer wait"))?;

        context.device.free_command_buffers(pool, command_buffers);
    }

    Ok(())
}

/// Creates a transient pool for single-use transfer commands.
pub fn create_transfer_pool(context: &Context) -> Result<vk::CommandPool> {
    let info = vk::CommandPoolCreateInfo::builder()
        .flags(vk::CommandPoolCreateFlags::TRANSIENT)
        .queue_family_index(context.graphics_queue_family);

    Ok(unsafe { context.device.create_command_pool(&info, None)? })
}
