// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync
// One set per frame in flight

use ash::vk;

use crate::error::{RendererError, RendererResult};

/// Frame synchronization - one per frame in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSlot {
    /// Signaled by the presentation engine when the acquired image is ready
    pub image_available: vk::Semaphore,
    /// Signaled by the graphics queue when the frame's commands finish
    pub render_finished: vk::Semaphore,
    /// CPU-visible completion of the slot's last submission
    pub in_flight: vk::Fence,
}

impl FrameSlot {
    pub fn new(device: &ash::Device) -> RendererResult<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Start signaled so the first wait on this slot returns immediately
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        let mut slot = Self {
            image_available: vk::Semaphore::null(),
            render_finished: vk::Semaphore::null(),
            in_flight: vk::Fence::null(),
        };

        let created: ash::prelude::VkResult<()> = (|| unsafe {
            slot.image_available = device.create_semaphore(&semaphore_info, None)?;
            slot.render_finished = device.create_semaphore(&semaphore_info, None)?;
            slot.in_flight = device.create_fence(&fence_info, None)?;
            Ok(())
        })();

        if let Err(result) = created {
            unsafe { slot.destroy(device) };
            return Err(RendererError::SyncObjects(result));
        }
        Ok(slot)
    }

    /// # Safety
    /// The device must be idle; null handles are skipped.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        if self.image_available != vk::Semaphore::null() {
            device.destroy_semaphore(self.image_available, None);
        }
        if self.render_finished != vk::Semaphore::null() {
            device.destroy_semaphore(self.render_finished, None);
        }
        if self.in_flight != vk::Fence::null() {
            device.destroy_fence(self.in_flight, None);
        }
    }
}
