use crate::{display::Display, queues::QueueFamilyIndices};

use std::collections::HashSet;
use std::sync::Arc;

use winit::window::Window;
use vulkanalia::{
    prelude::v1_0::*,
    window as vk_window,
    loader::{LibloadingLoader, LIBRARY},
    Version,
    vk::ExtDebugUtilsExtension,
    vk::KhrSurfaceExtension,
};
use anyhow::{anyhow, Result};
use log::*;
use thiserror::Error;

pub const VALIDATION_ENABLED: bool = cfg!(debug_assertions);
pub const VALIDATION_LAYER: vk::ExtensionName = vk::ExtensionName::from_bytes(b"VK_LAYER_KHRONOS_validation");
pub const PORTABILITY_MACOS_VERSION: Version = Version::new(1, 3, 216);

/// Device extensions required by the frame core. Only the
/// swapchain extension is needed: presentation is not part of
/// core Vulkan, which is render-agnostic.
pub const REQUIRED_EXTENSIONS: &[vk::ExtensionName] = &[
    vk::KHR_SWAPCHAIN_EXTENSION.name,
];

// The macro will create an error type with a Display impl that
// prints the given string.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct SuitabilityError(pub &'static str);

/// The logical GPU context: instance, selected physical device,
/// logical device and the graphics queue every component submits
/// to. Created once and passed explicitly to the components that
/// need it; its teardown is tied to application shutdown, after
/// every render target has been terminated.
pub struct Context {
    _entry: Entry,
    pub instance: Instance,
    pub physical_device: vk::PhysicalDevice,
    // Shared with the worker threads, which record commands
    // without going through the context.
    pub device: Arc<Device>,
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,
    debug_messenger: vk::DebugUtilsMessengerEXT,
}

impl Context {
    /// Creates the Vulkan instance, the presentation surface for
    /// the given window, and the logical device, in that order
    /// (the physical device pick needs the surface to check
    /// presentation support).
    pub fn new(window: &Window) -> Result<(Self, Display)> {
        // A special function loader first loads the initial
        // commands from the Vulkan DLL; the entry point built
        // from it creates the instance.
        let loader = unsafe { LibloadingLoader::new(LIBRARY)? };
        let entry = unsafe { Entry::new(loader) }.map_err(|b| anyhow!("{}", b))?;
        let (instance, debug_messenger) = create_instance(window, &entry)?;

        // Vulkan is platform agnostic, so it renders to surface
        // objects abstracting the native window; vulkanalia
        // handles the per-platform window handles for us.
        let surface = unsafe { vk_window::create_surface(&instance, window, window)? };
        info!("Surface created.");

        let physical_device = pick_physical_device(&instance, surface)?;
        let indices = QueueFamilyIndices::get(&instance, surface, physical_device)?;
        let device = create_logical_device(&entry, &instance, physical_device, &indices)?;
        let graphics_queue = unsafe { device.get_device_queue(indices.graphics, 0) };

        let size = window.inner_size();
        let display = Display::new(surface, size.width, size.height);

        Ok((
            Self {
                _entry: entry,
                instance,
                physical_device,
                device: Arc::new(device),
                graphics_queue,
                graphics_queue_family: indices.graphics,
                debug_messenger,
            },
            display,
        ))
    }

    /// Blocks until the device has finished all submitted work.
    /// Termination and render-target recreation both drain the
    /// GPU this way before destroying anything it may still
    /// reference.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    /// Destroys the device and instance. Must run last, after
    /// every device-bound object (including the surface, via
    /// [`Context::destroy_display`]) has been destroyed.
    pub fn destroy(&mut self) {
        unsafe {
            self.device.destroy_device(None);

            if VALIDATION_ENABLED {
                self.instance.destroy_debug_utils_messenger_ext(self.debug_messenger, None);
            }

            self.instance.destroy_instance(None);
        }

        info!("Destroyed the Vulkan instance.");
    }

    pub fn destroy_display(&self, display: &Display) {
        unsafe { self.instance.destroy_surface_khr(display.surface, None) };
    }
}

fn create_instance(window: &Window, entry: &Entry) -> Result<(Instance, vk::DebugUtilsMessengerEXT)> {
    // Validation layers hook into Vulkan calls to apply the
    // error checking the API itself omits; they are only
    // available if installed on the system (e.g. with the LunarG
    // SDK), so check the available list first.
    let available_layers = unsafe {
        entry
            .enumerate_instance_layer_properties()?
            .iter()
            .map(|l| l.layer_name)
            .collect::<HashSet<_>>()
    };

    if VALIDATION_ENABLED && !available_layers.contains(&VALIDATION_LAYER) {
        return Err(anyhow!("Validation layer not available."));
    }

    let layers = if VALIDATION_ENABLED {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        Vec::new()
    };

    let application_info = vk::ApplicationInfo::builder()
        .application_name(b"ember-app\0")
        .application_version(vk::make_version(1, 0, 0))
        .engine_name(b"ember\0")
        .engine_version(vk::make_version(1, 0, 0))
        .api_version(vk::make_version(1, 0, 0));

    // Window-integration extensions, plus the debug utils
    // extension when the validation layers are enabled.
    let mut extensions = vk_window::get_required_instance_extensions(window)
        .iter()
        .map(|e| e.as_ptr())
        .collect::<Vec<_>>();

    if VALIDATION_ENABLED {
        extensions.push(vk::EXT_DEBUG_UTILS_EXTENSION.name.as_ptr());
    }

    // Some platforms have not a fully compliant Vulkan
    // implementation, and need since v1.3.216 of the Vulkan API
    // to enable special portability extensions. One of those
    // platforms is none other than macOS.
    let flags = if
        cfg!(target_os = "macos") &&
        entry.version()? >= PORTABILITY_MACOS_VERSION
    {
        info!("Enabling extensions for macOS portability.");
        extensions.push(vk::KHR_GET_PHYSICAL_DEVICE_PROPERTIES2_EXTENSION.name.as_ptr());
        extensions.push(vk::KHR_PORTABILITY_ENUMERATION_EXTENSION.name.as_ptr());

        vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR
    }
    else {
        vk::InstanceCreateFlags::empty()
    };

    let mut info = vk::InstanceCreateInfo::builder()
        .application_info(&application_info)
        .enabled_layer_names(&layers)
        .enabled_extension_names(&extensions)
        .flags(flags);

    // The debug messenger forwards validation messages to our
    // log system for all severity levels and event types.
    let mut debug_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(vk::DebugUtilsMessageSeverityFlagsEXT::all())
        .message_type(vk::DebugUtilsMessageTypeFlagsEXT::all())
        .user_callback(Some(debug_callback));

    if VALIDATION_ENABLED {
        info = info.push_next(&mut debug_info);
    }

    let instance = unsafe { entry.create_instance(&info, None)? };

    let debug_messenger = if VALIDATION_ENABLED {
        unsafe { instance.create_debug_utils_messenger_ext(&debug_info, None)? }
    } else {
        vk::DebugUtilsMessengerEXT::null()
    };

    info!("Vulkan instance created.");
    Ok((instance, debug_messenger))
}

fn check_physical_device_extensions(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<()> {
    let extensions = unsafe {
        instance
            .enumerate_device_extension_properties(physical_device, None)?
            .iter()
            .map(|e| e.extension_name)
            .collect::<HashSet<_>>()
    };

    if REQUIRED_EXTENSIONS.iter().all(|e| extensions.contains(e)) {
        Ok(())
    } else {
        Err(anyhow!(SuitabilityError("Missing required device extensions.")))
    }
}

fn check_physical_device(
    instance: &Instance,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
) -> Result<()> {
    // The device must expose graphics and presentation queue
    // families, support the swapchain extension, and offer at
    // least one surface format and present mode for our window.
    QueueFamilyIndices::get(instance, surface, physical_device)?;
    check_physical_device_extensions(instance, physical_device)?;

    let formats = unsafe {
        instance.get_physical_device_surface_formats_khr(physical_device, surface)?
    };
    let present_modes = unsafe {
        instance.get_physical_device_surface_present_modes_khr(physical_device, surface)?
    };

    if formats.is_empty() || present_modes.is_empty() {
        return Err(anyhow!(SuitabilityError("Insufficient swapchain support.")));
    }

    Ok(())
}

fn pick_physical_device(
    instance: &Instance,
    surface: vk::SurfaceKHR,
) -> Result<vk::PhysicalDevice> {
    // There can be more than one graphics device on the system
    // (a dedicated and an integrated card at the same time, for
    // example); we list the available physical devices and pick
    // the first suitable one.
    for device in unsafe { instance.enumerate_physical_devices()? } {
        let properties = unsafe { instance.get_physical_device_properties(device) };

        if let Err(error) = check_physical_device(instance, surface, device) {
            warn!("Skipping physical device ({}): {}", properties.device_name, error);
        } else {
            info!("Selected physical device: {}", properties.device_name);
            return Ok(device);
        }
    }

    Err(anyhow!(SuitabilityError("Failed to find suitable physical device.")))
}

fn create_logical_device(
    entry: &Entry,
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    indices: &QueueFamilyIndices,
) -> Result<Device> {
    // One queue per distinct family; the graphics and present
    // families are usually the same, so deduplicate.
    let mut unique_indices = HashSet::new();
    unique_indices.insert(indices.graphics);
    unique_indices.insert(indices.present);

    let priorities = &[1.0];
    let queue_infos = unique_indices
        .iter()
        .map(|&i| {
            vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(i)
                .queue_priorities(priorities)
                .build()
        })
        .collect::<Vec<_>>();

    // Device-level validation layers are deprecated, but setting
    // them anyway keeps compatibility with older implementations.
    let layers = if VALIDATION_ENABLED {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        vec![]
    };

    let mut extensions = REQUIRED_EXTENSIONS
        .iter()
        .map(|e| e.as_ptr())
        .collect::<Vec<_>>();

    if cfg!(target_os = "macos") && entry.version()? >= PORTABILITY_MACOS_VERSION {
        extensions.push(vk::KHR_PORTABILITY_ENUMERATION_EXTENSION.name.as_ptr());
    }

    let features = vk::PhysicalDeviceFeatures::builder();

    let info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(&queue_infos)
        .enabled_layer_names(&layers)
        .enabled_extension_names(&extensions)
        .enabled_features(&features);

    let device = unsafe { instance.create_device(physical_device, &info, None)? };

    info!("Logical device created.");
    Ok(device)
}

extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    type_: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _: *mut std::ffi::c_void,
) -> vk::Bool32 {
    // Print validation messages with our own log system instead
    // of the standard output. The 'extern "system"' bit links
    // the function to the system ABI, which is required for
    // Vulkan to call it directly.
    let data = unsafe { *data };
    let message = unsafe { std::ffi::CStr::from_ptr(data.message) }.to_string_lossy();

    if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        error!("({type_:?}) {message}");
    } else if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        warn!("({type_:?}) {message}");
    } else if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::INFO {
        debug!("({type_:?}) {message}");
    } else {
        trace!("({type_:?}) {message}");
    }

    vk::FALSE
}
