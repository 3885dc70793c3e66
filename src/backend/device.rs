// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers and caller-supplied extensions
// - Physical device selection (scored, or dictated by the XR runtime)
// - Logical device + graphics queue creation
// - Memory allocator setup
//
// An XR runtime decides which GPU drives the headset and which instance and
// device extensions it needs, so both are inputs here rather than fixed.

use anyhow::{Context, Result};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// What the device must be created with.
#[derive(Debug, Clone)]
pub struct DeviceRequirements {
    pub app_name: String,
    pub validation: bool,
    pub api_version: u32,
    pub instance_extensions: Vec<CString>,
    pub device_extensions: Vec<CString>,
}

impl DeviceRequirements {
    /// Plain device with no runtime-imposed extensions.
    pub fn standalone(app_name: &str, validation: bool) -> Self {
        Self {
            app_name: app_name.to_string(),
            validation,
            api_version: vk::API_VERSION_1_1,
            instance_extensions: Vec::new(),
            device_extensions: Vec::new(),
        }
    }
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Vulkan handles (order matters for drop!)
    allocator: Mutex<Option<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,

    // Debug utils (if validation enabled)
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    pub properties: vk::PhysicalDeviceProperties,
}

impl VulkanDevice {
    /// Create a device on the best-scoring GPU.
    pub fn new(requirements: &DeviceRequirements) -> Result<Arc<Self>> {
        Self::create(requirements, Self::pick_physical_device)
    }

    /// Create a device on the GPU chosen by `pick` once the instance exists.
    pub fn with_physical_device<F>(requirements: &DeviceRequirements, pick: F) -> Result<Arc<Self>>
    where
        F: FnOnce(&ash::Instance) -> Result<vk::PhysicalDevice>,
    {
        Self::create(requirements, |instance| {
            let physical_device = pick(instance)?;
            let family = Self::graphics_queue_family(instance, physical_device)
                .context("Runtime-selected GPU has no graphics queue")?;
            Ok((physical_device, family))
        })
    }

    fn create<F>(requirements: &DeviceRequirements, pick: F) -> Result<Arc<Self>>
    where
        F: FnOnce(&ash::Instance) -> Result<(vk::PhysicalDevice, u32)>,
    {
        log::info!("Creating Vulkan device: {}", requirements.app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Create instance
        let instance = Self::create_instance(&entry, requirements)?;

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if requirements.validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        // Step 4: Pick physical device (GPU)
        let (physical_device, graphics_queue_family) = pick(&instance)?;

        // Step 5: Create logical device
        let (device, graphics_queue) = Self::create_logical_device(
            &instance,
            physical_device,
            graphics_queue_family,
            &requirements.device_extensions,
        )?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        // Step 6: Create memory allocator
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create GPU allocator")?;

        Ok(Arc::new(Self {
            allocator: Mutex::new(Some(allocator)),
            device,
            physical_device,
            instance,
            _entry: entry,
            graphics_queue,
            graphics_queue_family,
            debug_utils,
            properties,
        }))
    }

    fn create_instance(entry: &Entry, requirements: &DeviceRequirements) -> Result<ash::Instance> {
        let app_name = CString::new(requirements.app_name.as_str())?;
        let engine_name = CString::new("xr-renderer")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(requirements.api_version);

        let mut extensions: Vec<*const c_char> = requirements
            .instance_extensions
            .iter()
            .map(|name| name.as_ptr())
            .collect();
        if requirements.validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }

        let layer_names = if requirements.validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

        Ok((debug_utils, messenger))
    }

    fn graphics_queue_family(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Option<u32> {
        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        queue_families
            .iter()
            .position(|props| props.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .map(|i| i as u32)
    }

    fn pick_physical_device(instance: &ash::Instance) -> Result<(vk::PhysicalDevice, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        // Score each device (prefer discrete GPU)
        devices
            .into_iter()
            .filter_map(|device| {
                let family = Self::graphics_queue_family(instance, device)?;
                let props = unsafe { instance.get_physical_device_properties(device) };
                let score = match props.device_type {
                    vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                    vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                    _ => 1,
                };
                Some((score, device, family))
            })
            .max_by_key(|(score, _, _)| *score)
            .map(|(_, device, family)| (device, family))
            .ok_or_else(|| anyhow::anyhow!("No suitable GPU found"))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_queue_family: u32,
        extensions: &[CString],
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let extension_names: Vec<*const c_char> = extensions.iter().map(|name| name.as_ptr()).collect();
        for name in extensions {
            log::debug!("Device extension: {}", name.to_string_lossy());
        }

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extension_names);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create Vulkan device")?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        Ok((device, graphics_queue))
    }

    /// Run `f` with exclusive access to the allocator.
    pub fn with_allocator<T>(&self, f: impl FnOnce(&mut Allocator) -> Result<T>) -> Result<T> {
        let mut guard = self.allocator.lock();
        let allocator = guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("GPU allocator already destroyed"))?;
        f(allocator)
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        // Allocator memory must go back before the device does
        self.allocator.lock().take();

        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Split a space-separated extension list (as XR runtimes report them).
pub fn parse_extension_list(list: &str) -> Vec<CString> {
    list.split_whitespace()
        .filter_map(|name| CString::new(name).ok())
        .collect()
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_lists_split_on_whitespace() {
        let parsed = parse_extension_list("VK_KHR_external_memory  VK_KHR_dedicated_allocation\n");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].to_str().unwrap(), "VK_KHR_dedicated_allocation");
        assert!(parse_extension_list("").is_empty());
    }
}
