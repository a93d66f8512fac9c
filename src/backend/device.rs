// Vulkan logical device
//
// Responsibilities:
// - One queue request per distinct queue family (graphics/present deduped)
// - Enable only the required device extensions
// - Resolve graphics and present queue handles

use std::collections::BTreeSet;
use std::ffi::CString;

use ash::vk;

use super::selector::{QueueFamilies, SelectedDevice};
use crate::error::{RendererError, RendererResult};

/// Logical device plus the queues the renderer uses
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub queue_families: QueueFamilies,

    // Queue handles (may be the same queue)
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
}

/// Distinct family indices to request queues from, in ascending order.
///
/// Drivers reject duplicate family entries in `VkDeviceCreateInfo`.
pub fn unique_queue_families(families: &QueueFamilies) -> Vec<u32> {
    BTreeSet::from([families.graphics, families.present])
        .into_iter()
        .collect()
}

impl VulkanDevice {
    /// Create the logical device for the selected physical device
    pub fn new(
        instance: &ash::Instance,
        selected: &SelectedDevice,
        extensions: &[&str],
    ) -> RendererResult<Self> {
        let families = selected.queue_families;

        // One queue per family at maximal priority
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = unique_queue_families(&families)
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extension_names = extensions
            .iter()
            .map(|name| CString::new(*name))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| RendererError::DeviceCreation(vk::Result::ERROR_EXTENSION_NOT_PRESENT))?;
        let extension_ptrs: Vec<_> = extension_names.iter().map(|name| name.as_ptr()).collect();

        let features = vk::PhysicalDeviceFeatures::default();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_ptrs)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(selected.handle, &create_info, None) }
            .map_err(RendererError::DeviceCreation)?;

        let graphics_queue = unsafe { device.get_device_queue(families.graphics, 0) };
        let present_queue = if families.shared() {
            graphics_queue
        } else {
            unsafe { device.get_device_queue(families.present, 0) }
        };

        log::info!(
            "Created a logical device on {} (graphics family {}, present family {})",
            selected.name,
            families.graphics,
            families.present
        );

        Ok(Self {
            device,
            physical_device: selected.handle,
            queue_families: families,
            graphics_queue,
            present_queue,
        })
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> ash::prelude::VkResult<()> {
        unsafe { self.device.device_wait_idle() }
    }

    /// Destroy the logical device.
    ///
    /// # Safety
    /// All objects created from this device must already be destroyed.
    pub unsafe fn destroy(&mut self) {
        log::info!("Destroying Vulkan device...");
        self.device.destroy_device(None);
    }
}
