// Vulkan rendering instance
//
// This holds all of the common instance code for the Vulkan context
//
// Austin Shafer - 2025
use ash::extensions::ext;
use ash::{vk, Entry};

use crate::config::Config;
use crate::platform::WindowBackend;
use crate::{Result, SquallError};

use std::ffi::{CStr, CString};
use std::os::raw::c_void;

// this happy little debug callback is from the ash examples
// all it does is print any errors/warnings thrown.
unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> u32 {
    log::error!(
        "[VK][{:?}][{:?}] {:?}",
        message_severity,
        message_types,
        CStr::from_ptr(p_callback_data.as_ref().unwrap().p_message)
    );
    vk::FALSE
}

/// A Vulkan Instance
///
/// This holds our basic vulkan session data. We use this to create
/// any devices and such which Squall will use internally to render.
pub struct Instance {
    /// debug callback sugar mentioned earlier
    debug_loader: ext::DebugUtils,
    debug_callback: vk::DebugUtilsMessengerEXT,

    /// the entry just loads function pointers from the dynamic library
    /// I am calling it a loader, because that's what it does
    pub(crate) loader: Entry,
    /// the big vulkan instance.
    pub(crate) inst: ash::Instance,
}

impl Instance {
    /// Creates a new debug reporter and registers our function
    /// for debug callbacks so we get nice error messages
    fn setup_debug(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> (ext::DebugUtils, vk::DebugUtilsMessengerEXT) {
        let debug_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
            )
            .pfn_user_callback(Some(vulkan_debug_callback));

        let dr_loader = ext::DebugUtils::new(entry, instance);
        let callback = unsafe {
            dr_loader
                .create_debug_utils_messenger(&debug_info, None)
                .unwrap()
        };
        (dr_loader, callback)
    }

    /// Check that the validation layer is actually installed.
    ///
    /// Requesting a layer that isn't present fails instance creation
    /// with a generic error, so test for it up front and report
    /// something the user can act on.
    fn check_validation_layer(entry: &Entry, name: &CStr) -> Result<()> {
        let layers = entry
            .enumerate_instance_layer_properties()
            .or(Err(SquallError::VALIDATION_LAYER_UNAVAILABLE))?;

        for layer in layers.iter() {
            let lname = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
            if lname == name {
                return Ok(());
            }
        }

        log::error!(
            "Validation layers were requested but {:?} is not installed",
            name
        );
        Err(SquallError::VALIDATION_LAYER_UNAVAILABLE)
    }

    /// Create a vkInstance
    ///
    /// The window backend contributes the platform surface extensions
    /// it needs. All of the work is done in subfunctions.
    pub fn new(config: &Config, backend: &dyn WindowBackend) -> Result<Self> {
        let entry = Entry::linked();
        let app_name = CString::new(config.window.title.as_str()).unwrap();
        let engine_name = CString::new("Squall").unwrap();

        let validation_name = CString::new("VK_LAYER_KHRONOS_validation").unwrap();
        let mut layer_names_raw = Vec::new();
        if config.validation_layers {
            Self::check_validation_layer(&entry, validation_name.as_c_str())?;
            layer_names_raw.push(validation_name.as_ptr());
        }

        let mut extension_names_raw = backend.required_extensions();
        extension_names_raw.push(ext::DebugUtils::name().as_ptr());

        let appinfo = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(0)
            .engine_name(&engine_name)
            .engine_version(0)
            .api_version(vk::API_VERSION_1_2)
            .build();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&appinfo)
            .enabled_layer_names(&layer_names_raw)
            .enabled_extension_names(&extension_names_raw)
            .build();

        let instance: ash::Instance = unsafe {
            entry
                .create_instance(&create_info, None)
                .or(Err(SquallError::NO_VULKAN_DEVICE))?
        };

        let (dr_loader, d_callback) = Self::setup_debug(&entry, &instance);

        Ok(Self {
            loader: entry,
            inst: instance,
            debug_loader: dr_loader,
            debug_callback: d_callback,
        })
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            self.debug_loader
                .destroy_debug_utils_messenger(self.debug_callback, None);
            self.inst.destroy_instance(None);
        }
    }
}
