// Vulkan instance
//
// Loads the Vulkan library and creates the instance the device selector works
// against. The debug messenger is only installed when validation is on.

use anyhow::{Context, Result};
use ash::{vk, Entry};
use std::ffi::{CStr, CString};
use std::sync::Arc;

use crate::config::DeviceConfig;

pub struct VulkanInstance {
    pub instance: ash::Instance,
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    // keeps the loader alive for as long as the instance
    _entry: Entry,
}

impl VulkanInstance {
    /// Create a Vulkan instance
    ///
    /// # Arguments
    /// * `app_name` - Application name reported to the driver
    /// * `config` - Validation and headless settings
    pub fn new(app_name: &str, config: &DeviceConfig) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan instance: {}", app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let layers: Vec<String> = if config.validation {
            config.validation_layers.clone()
        } else {
            Vec::new()
        };

        let instance = Self::create_instance(&entry, app_name, &layers, config.headless)?;

        let debug_utils = if layers.is_empty() {
            None
        } else {
            match Self::setup_debug_messenger(&entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        };

        Ok(Arc::new(Self {
            instance,
            debug_utils,
            _entry: entry,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        layers: &[String],
        headless: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("vkscene")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        let mut extensions = Vec::new();
        if !layers.is_empty() {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }
        // the swapchain device extension depends on it
        if !headless {
            extensions.push(ash::extensions::khr::Surface::name().as_ptr());
        }

        let layer_names = layers
            .iter()
            .map(|l| CString::new(l.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .context("Validation layer name contains a NUL byte")?;
        let layer_ptrs: Vec<_> = layer_names.iter().map(|l| l.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_ptrs);

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
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    pub fn physical_devices(&self) -> Result<Vec<vk::PhysicalDevice>> {
        unsafe { self.instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
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
