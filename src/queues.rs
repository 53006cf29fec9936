use crate::context::SuitabilityError;

use vulkanalia::{prelude::v1_0::*, vk::KhrSurfaceExtension};
use anyhow::{anyhow, Result};

pub struct QueueFamilyIndices {
    pub graphics: u32,
    /// Always equals `graphics`: presentation is issued on the
    /// graphics queue, so device suitability requires one family
    /// supporting both.
    pub present: u32,
}

impl QueueFamilyIndices {
    pub fn get(
        instance: &Instance,
        surface: vk::SurfaceKHR,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        // Every command goes through a queue, and each queue
        // family supports only a subset of operations. Frames
        // are submitted and presented on the same queue, so a
        // family that does graphics but cannot present to our
        // surface is not enough.
        let queues = unsafe {
            instance.get_physical_device_queue_family_properties(physical_device)
        };

        let mut families = Vec::with_capacity(queues.len());
        for (index, properties) in queues.iter().enumerate() {
            let presents = unsafe {
                instance.get_physical_device_surface_support_khr(
                    physical_device,
                    index as u32,
                    surface,
                )?
            };

            families.push((
                properties.queue_flags.contains(vk::QueueFlags::GRAPHICS),
                presents,
            ));
        }

        match pick_graphics_family(&families) {
            Some(graphics) => Ok(Self {
                graphics,
                present: graphics,
            }),
            None => Err(anyhow!(SuitabilityError(
                "No queue family with both graphics and presentation support."
            ))),
        }
    }
}

/// First family flagged for graphics that can also present.
fn pick_graphics_family(families: &[(bool, bool)]) -> Option<u32> {
    families
        .iter()
        .position(|&(graphics, presents)| graphics && presents)
        .map(|index| index as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_graphics_and_present_families_are_not_enough() {
        // One family that only draws, one that only presents.
        assert_eq!(pick_graphics_family(&[(true, false), (false, true)]), None);
    }

    #[test]
    fn combined_family_is_selected() {
        assert_eq!(
            pick_graphics_family(&[(false, true), (true, false), (true, true)]),
            Some(2)
        );
    }

    #[test]
    fn no_families_means_no_pick() {
        assert_eq!(pick_graphics_family(&[]), None);
    }
}
