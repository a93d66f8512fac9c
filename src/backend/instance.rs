// Vulkan instance and presentation surface
//
// Responsibilities:
// - Instance creation with the window system's required extensions
// - Validation layers + debug messenger routed into `log`
// - Surface creation from the platform window handle
//
// Owned by the renderer and destroyed last (surface, messenger, instance).

use std::ffi::{CStr, CString};

use ash::extensions::{ext::DebugUtils, khr::Surface};
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::error::{RendererError, RendererResult};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Instance-level Vulkan state: loader, instance, debug messenger, surface
pub struct InstanceContext {
    pub surface: vk::SurfaceKHR,
    pub surface_loader: Surface,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    pub instance: ash::Instance,
    _entry: Entry,
}

impl InstanceContext {
    /// Create the instance and a surface for the given window.
    ///
    /// # Arguments
    /// * `app_name` - Application name reported to the driver
    /// * `display_handle` / `window_handle` - Platform handles of the window
    /// * `enable_validation` - Enable Vulkan validation layers
    pub fn new(
        app_name: &str,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        enable_validation: bool,
    ) -> RendererResult<Self> {
        log::info!("Creating Vulkan instance: {}", app_name);

        let entry = unsafe { Entry::load() }?;
        let (instance, validation) =
            Self::create_instance(&entry, app_name, display_handle, enable_validation)?;

        // The messenger needs VK_EXT_debug_utils, which is only enabled with the layer
        let debug_utils = if validation {
            match Self::setup_debug_messenger(&entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        let surface_loader = Surface::new(&entry, &instance);
        let surface = match unsafe {
            ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
        } {
            Ok(surface) => surface,
            Err(result) => {
                unsafe {
                    if let Some((utils, messenger)) = &debug_utils {
                        utils.destroy_debug_utils_messenger(*messenger, None);
                    }
                    instance.destroy_instance(None);
                }
                return Err(RendererError::Instance {
                    context: "surface creation",
                    result,
                });
            }
        };

        log::info!("Created surface");

        Ok(Self {
            surface,
            surface_loader,
            debug_utils,
            instance,
            _entry: entry,
        })
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        display_handle: RawDisplayHandle,
        enable_validation: bool,
    ) -> RendererResult<(ash::Instance, bool)> {
        let app_name_cstr = CString::new(app_name).unwrap_or_else(|_| c"SpaceApp".to_owned());
        let engine_name = c"SpaceEngine";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        // Surface extensions for this platform
        let mut extensions = ash_window::enumerate_required_extensions(display_handle)
            .map_err(|result| RendererError::Instance {
                context: "required surface extensions",
                result,
            })?
            .to_vec();

        let available = enable_validation && Self::validation_layer_available(entry);
        let validation = validation_plan(enable_validation, available);

        let mut layer_names = Vec::new();
        if validation {
            extensions.push(DebugUtils::name().as_ptr());
            layer_names.push(VALIDATION_LAYER.as_ptr());
        }

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(|result| {
            RendererError::Instance {
                context: "instance creation",
                result,
            }
        })?;

        log::info!("Created instance (validation: {})", validation);
        Ok((instance, validation))
    }

    fn validation_layer_available(entry: &Entry) -> bool {
        match entry.enumerate_instance_layer_properties() {
            Ok(layers) => layers.iter().any(|layer| {
                let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
                name == VALIDATION_LAYER
            }),
            Err(e) => {
                log::warn!("Could not enumerate instance layers: {}", e);
                false
            }
        }
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> RendererResult<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

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
            .map_err(|result| RendererError::Instance {
                context: "debug messenger",
                result,
            })?;

        Ok((debug_utils, messenger))
    }

    /// Destroy surface, messenger and instance.
    ///
    /// # Safety
    /// Every object created from this instance must already be destroyed.
    pub unsafe fn destroy(&mut self) {
        self.surface_loader.destroy_surface(self.surface, None);
        if let Some((debug_utils, messenger)) = self.debug_utils.take() {
            debug_utils.destroy_debug_utils_messenger(messenger, None);
        }
        self.instance.destroy_instance(None);
    }
}

/// Whether validation layers and the debug messenger get enabled
fn validation_plan(requested: bool, available: bool) -> bool {
    if requested && !available {
        log::warn!("Validation requested but {:?} is not installed", VALIDATION_LAYER);
    }
    requested && available
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_requires_installed_layer() {
        assert!(validation_plan(true, true));
        assert!(!validation_plan(true, false));
    }

    #[test]
    fn test_validation_off_when_not_requested() {
        assert!(!validation_plan(false, true));
        assert!(!validation_plan(false, false));
    }
}
