use crate::{
    commands::{begin_single_command, end_single_command},
    context::{Context, SuitabilityError},
};

use vulkanalia::prelude::v1_0::*;
use anyhow::{anyhow, Result};

pub fn create_buffer(
    context: &Context,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    properties: vk::MemoryPropertyFlags,
) -> Result<(vk::Buffer, vk::DeviceMemory)> {
    // Buffers are regions of memory defined by their byte size,
    // their usage (vertex data, index data, staging source, etc)
    // and their sharing mode; all of ours are owned by the
    // graphics queue family, so EXCLUSIVE.
    let buffer_info = vk::BufferCreateInfo::builder()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = unsafe { context.device.create_buffer(&buffer_info, None)? };

    // The buffer has no memory yet; query its requirements and
    // allocate from a memory type that satisfies both the
    // requirements and the properties we want (device-local for
    // draw buffers, host-visible for staging).
    let requirements = unsafe { context.device.get_buffer_memory_requirements(buffer) };

    let memory_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(find_memory_type(context, properties, requirements)?);

    let buffer_memory = unsafe { context.device.allocate_memory(&memory_info, None)? };
    unsafe { context.device.bind_buffer_memory(buffer, buffer_memory, 0)? };

    Ok((buffer, buffer_memory))
}

/// Copies a region between buffers through a single-use command
/// buffer allocated from `pool`. Both offsets are in bytes;
/// geometry resizes use them to shift surviving ranges forward.
pub fn copy_buffer_region(
    context: &Context,
    pool: vk::CommandPool,
    source: vk::Buffer,
    destination: vk::Buffer,
    size: vk::DeviceSize,
    src_offset: vk::DeviceSize,
    dst_offset: vk::DeviceSize,
) -> Result<()> {
    let command_buffer = begin_single_command(context, pool)?;

    let regions = vk::BufferCopy::builder()
        .src_offset(src_offset)
        .dst_offset(dst_offset)
        .size(size);

    unsafe {
        context.device.cmd_copy_buffer(command_buffer, source, destination, &[regions]);
    }

    end_single_command(context, pool, command_buffer)?;
    Ok(())
}

/// Writes `data` into host-visible buffer memory.
pub fn fill_buffer(
    context: &Context,
    memory: vk::DeviceMemory,
    data: &[u8],
) -> Result<()> {
    unsafe {
        let pointer = context.device.map_memory(
            memory,
            0,
            data.len() as u64,
            vk::MemoryMapFlags::empty(),
        )?;

        std::ptr::copy_nonoverlapping(data.as_ptr(), pointer.cast(), data.len());
        context.device.unmap_memory(memory);
    }

    Ok(())
}

pub fn find_memory_type(
    context: &Context,
    properties: vk::MemoryPropertyFlags,
    requirements: vk::MemoryRequirements,
) -> Result<u32> {
    // Each bit of the requirements' memory type field marks a
    // memory type the resource can live in; the chosen type must
    // also carry the properties the caller asked for.
    let memory = unsafe {
        context.instance.get_physical_device_memory_properties(context.physical_device)
    };

    (0..memory.memory_type_count)
        .find(|&i| {
            requirements.memory_type_bits & (1 << i) != 0
                && memory.memory_types[i as usize].property_flags.contains(properties)
        })
        .ok_or(anyhow!(SuitabilityError("Failed to find suitable memory type.")))
}
