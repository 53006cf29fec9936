use vulkanalia::prelude::v1_0::*;

/// Pipeline state set at record time rather than baked into the
/// pipeline. A closed enum: each variant carries the values for
/// exactly one piece of dynamic state, and applying is an
/// exhaustive match, so a new kind of state cannot be added
/// without also saying how to record it.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum DynamicState {
    Viewport {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        min_depth: f32,
        max_depth: f32,
    },
    Scissor {
        offset: vk::Offset2D,
        extent: vk::Extent2D,
    },
    LineWidth(f32),
    DepthBias {
        constant: f32,
        clamp: f32,
        slope: f32,
    },
    BlendConstants([f32; 4]),
    DepthBounds {
        min: f32,
        max: f32,
    },
}

impl DynamicState {
    /// The flag to declare in the pipeline's dynamic state list
    /// for this variant.
    pub fn flag(&self) -> vk::DynamicState {
        match self {
            DynamicState::Viewport { .. } => vk::DynamicState::VIEWPORT,
            DynamicState::Scissor { .. } => vk::DynamicState::SCISSOR,
            DynamicState::LineWidth(_) => vk::DynamicState::LINE_WIDTH,
            DynamicState::DepthBias { .. } => vk::DynamicState::DEPTH_BIAS,
            DynamicState::BlendConstants(_) => vk::DynamicState::BLEND_CONSTANTS,
            DynamicState::DepthBounds { .. } => vk::DynamicState::DEPTH_BOUNDS,
        }
    }

    /// Records this state into `command_buffer`.
    pub fn apply(&self, device: &Device, command_buffer: vk::CommandBuffer) {
        match *self {
            DynamicState::Viewport {
                x,
                y,
                width,
                height,
                min_depth,
                max_depth,
            } => {
                let viewport = vk::Viewport::builder()
                    .x(x)
                    .y(y)
                    .width(width)
                    .height(height)
                    .min_depth(min_depth)
                    .max_depth(max_depth);
                unsafe { device.cmd_set_viewport(command_buffer, 0, &[viewport]) };
            }
            DynamicState::Scissor { offset, extent } => {
                let scissor = vk::Rect2D::builder().offset(offset).extent(extent);
                unsafe { device.cmd_set_scissor(command_buffer, 0, &[scissor]) };
            }
            DynamicState::LineWidth(width) => unsafe {
                device.cmd_set_line_width(command_buffer, width);
            },
            DynamicState::DepthBias {
                constant,
                clamp,
                slope,
            } => unsafe {
                device.cmd_set_depth_bias(command_buffer, constant, clamp, slope);
            },
            DynamicState::BlendConstants(constants) => unsafe {
                device.cmd_set_blend_constants(command_buffer, constants);
            },
            DynamicState::DepthBounds { min, max } => unsafe {
                device.cmd_set_depth_bounds(command_buffer, min, max);
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_variant_maps_to_its_own_flag() {
        let states = [
            DynamicState::Viewport {
                x: 0.0,
                y: 0.0,
                width: 1.0,
                height: 1.0,
                min_depth: 0.0,
                max_depth: 1.0,
            },
            DynamicState::Scissor {
                offset: vk::Offset2D::default(),
                extent: vk::Extent2D::default(),
            },
            DynamicState::LineWidth(1.0),
            DynamicState::DepthBias {
                constant: 0.0,
                clamp: 0.0,
                slope: 0.0,
            },
            DynamicState::BlendConstants([0.0; 4]),
            DynamicState::DepthBounds { min: 0.0, max: 1.0 },
        ];

        let flags: Vec<_> = states.iter().map(DynamicState::flag).collect();
        let mut deduped = flags.clone();
        deduped.dedup();
        assert_eq!(flags.len(), deduped.len());
    }
}
