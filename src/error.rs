use vulkanalia::prelude::v1_0::*;
use anyhow::anyhow;
use thiserror::Error;

// The error taxonomy splits in three: transient surface
// conditions (out-of-date, suboptimal, zero extent), which are
// absorbed where they occur and never reach a Result; programmer
// errors, which abort the current call with a named error and
// leave state unchanged; and fatal device conditions, which
// unwind past the frame loop so the application can terminate or
// reinitialize the device.

/// Unrecoverable device failures. Once one of these is returned,
/// the frame loop must stop; continuing would submit work to a
/// device in an undefined state.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalError {
    #[error("device lost during {0}")]
    DeviceLost(&'static str),
    #[error("out of device memory during {0}")]
    OutOfDeviceMemory(&'static str),
    #[error("fence wait timed out during {0}")]
    FenceTimeout(&'static str),
}

/// A frame-slot index outside [0, buffer count).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid frame index {index} (buffer count is {count})")]
pub struct InvalidFrameIndex {
    pub index: usize,
    pub count: usize,
}

/// Resource-binding mistakes caught against the shader
/// reflection data. These are never defaulted: a binding the
/// shader declares must be supplied, with the kind the shader
/// expects.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingError {
    #[error("unbound resource at binding {0}")]
    UnboundResource(u32),
    #[error("binding {binding} expects {expected}, got {got}")]
    KindMismatch {
        binding: u32,
        expected: &'static str,
        got: &'static str,
    },
    #[error("binding {0} is not declared by the shader")]
    UnknownBinding(u32),
    #[error("no binding table with id {0:#018x}")]
    UnknownTable(u64),
}

/// Geometry buffer maps are refused outright: while a
/// staging-mediated resize is in flight, when the store lives in
/// device-local memory with no host mapping at all, and when the
/// region holds no elements (there is no memory to map yet).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    #[error("buffer map refused: a geometry resize is in flight")]
    ResizeInFlight,
    #[error("buffer map refused: geometry memory is device-local")]
    DeviceOnly,
    #[error("buffer map refused: the region is empty")]
    Empty,
}

/// Malformed geometry input. Each keeps the store's byte size
/// equal to count times stride by rejecting the call up front,
/// with the buffers untouched.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryError {
    #[error("removed range of {count} elements at {offset} exceeds the region's {total}")]
    RangeOutOfBounds { offset: u64, count: u64, total: u64 },
    #[error("zero-byte element stride")]
    ZeroStride,
    #[error("data length {len} is not a multiple of the {stride}-byte element stride")]
    MisalignedData { len: u64, stride: u64 },
}

/// A swapchain image index outside the image set.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid image index {index} ({count} swapchain images)")]
pub struct InvalidImageIndex {
    pub index: usize,
    pub count: usize,
}

/// Classifies a Vulkan error code returned from a submission or
/// wait call. Device loss and memory exhaustion become the
/// distinguished fatal kind; everything else is reported as-is
/// with the name of the failing operation.
pub fn submit_error(code: vk::ErrorCode, op: &'static str) -> anyhow::Error {
    match code {
        vk::ErrorCode::DEVICE_LOST => anyhow!(FatalError::DeviceLost(op)),
        vk::ErrorCode::OUT_OF_DEVICE_MEMORY | vk::ErrorCode::OUT_OF_HOST_MEMORY => {
            anyhow!(FatalError::OutOfDeviceMemory(op))
        },
        code => anyhow!("{} failed: {:?}", op, code),
    }
}

/// Whether an error anywhere in the chain is a fatal device
/// condition. The frame loop checks this to decide between
/// recovering and stopping.
pub fn is_fatal(error: &anyhow::Error) -> bool {
    error.chain().any(|e| e.downcast_ref::<FatalError>().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_loss_is_fatal() {
        let error = submit_error(vk::ErrorCode::DEVICE_LOST, "queue submit");
        assert!(is_fatal(&error));
        assert_eq!(
            error.downcast_ref::<FatalError>(),
            Some(&FatalError::DeviceLost("queue submit"))
        );
    }

    #[test]
    fn memory_exhaustion_is_fatal() {
        let error = submit_error(vk::ErrorCode::OUT_OF_DEVICE_MEMORY, "buffer allocation");
        assert!(is_fatal(&error));
    }

    #[test]
    fn other_codes_are_not_fatal() {
        let error = submit_error(vk::ErrorCode::OUT_OF_DATE_KHR, "present");
        assert!(!is_fatal(&error));
    }

    #[test]
    fn programmer_errors_are_not_fatal() {
        let error = anyhow!(BindingError::UnboundResource(3));
        assert!(!is_fatal(&error));
        assert_eq!(error.to_string(), "unbound resource at binding 3");
    }
}
