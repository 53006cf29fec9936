use crate::{
    buffers::find_memory_type,
    context::{Context, SuitabilityError},
};

use vulkanalia::prelude::v1_0::*;
use anyhow::{anyhow, Result};

pub fn create_image_view(
    device: &Device,
    image: vk::Image,
    format: vk::Format,
    aspects: vk::ImageAspectFlags,
) -> Result<vk::ImageView> {
    // Images are never accessed directly but through views,
    // which describe which part of the image to access and how.
    // All of our attachments are single-layer, single-mip 2D
    // images with identity component mapping.
    let subresource_range = vk::ImageSubresourceRange::builder()
        .aspect_mask(aspects)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
        .build();

    let info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::_2D)
        .format(format)
        .subresource_range(subresource_range);

    Ok(unsafe { device.create_image_view(&info, None)? })
}

pub fn create_image(
    context: &Context,
    width: u32,
    height: u32,
    samples: vk::SampleCountFlags,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
) -> Result<(vk::Image, vk::DeviceMemory)> {
    let info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::_2D)
        .extent(vk::Extent3D { width, height, depth: 1 })
        .format(format)
        .mip_levels(1)
        .array_layers(1)
        .samples(samples)
        .tiling(vk::ImageTiling::OPTIMAL)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let image = unsafe { context.device.create_image(&info, None)? };
    let requirements = unsafe { context.device.get_image_memory_requirements(image) };

    // Attachments live in device-local memory; nothing on the
    // host ever reads them back.
    let info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(find_memory_type(
            context,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            requirements,
        )?);

    let image_memory = unsafe { context.device.allocate_memory(&info, None)? };
    unsafe { context.device.bind_image_memory(image, image_memory, 0)? };

    Ok((image, image_memory))
}

pub fn get_depth_format(context: &Context) -> Result<vk::Format> {
    // Depth formats differ in bit depth and the presence of a
    // stencil component; take the first one the device supports
    // as an optimally tiled depth/stencil attachment.
    let depth_formats = &[
        vk::Format::D32_SFLOAT,
        vk::Format::D32_SFLOAT_S8_UINT,
        vk::Format::D24_UNORM_S8_UINT,
    ];

    depth_formats
        .iter()
        .cloned()
        .find(|&format| {
            let properties = unsafe {
                context.instance.get_physical_device_format_properties(
                    context.physical_device,
                    format,
                )
            };

            properties
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        })
        .ok_or(anyhow!(SuitabilityError("Failed to find supported depth format.")))
}
