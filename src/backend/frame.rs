//! Frame pacing.
//!
//! The [`FrameScheduler`] overlaps CPU frame preparation with GPU execution
//! across [`MAX_FRAMES_IN_FLIGHT`] frame slots while making sure the CPU never
//! reuses a slot, or resubmits work against a swapchain image, that the GPU is
//! still consuming.
//!
//! # Synchronization Flow
//!
//! ```text
//! 1. Wait on the slot's in_flight fence      (slot track)
//! 2. Acquire an image, signal image_available
//! 3. Wait on the fence last recorded for that image, if any   (image track)
//! 4. Reset the slot fence, submit the image's command buffer:
//!    - wait image_available at COLOR_ATTACHMENT_OUTPUT
//!    - signal render_finished + in_flight
//! 5. Present, waiting on render_finished
//! 6. Record in_flight against the image, advance the slot cursor
//! ```
//!
//! Slots and images are indexed independently: the presentation engine may
//! hand images back in any order, so step 3 is what keeps two submissions off
//! the same image.
//!
//! All driver calls go through [`FrameDriver`] so the state machine can be
//! exercised against a simulated GPU.

use ash::prelude::VkResult;
use ash::vk;

use super::device::VulkanDevice;
use super::swapchain::Swapchain;
use super::sync::FrameSlot;
use crate::error::{FrameStep, RendererError, RendererResult};

/// Number of frames the CPU may run ahead of the GPU
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// The driver calls one frame needs.
///
/// Every wait is unbounded; the scheduler relies on the display system making
/// progress.
pub trait FrameDriver {
    fn wait_for_fence(&mut self, fence: vk::Fence) -> VkResult<()>;
    fn reset_fence(&mut self, fence: vk::Fence) -> VkResult<()>;
    /// Returns (image index, suboptimal)
    fn acquire_next_image(&mut self, signal: vk::Semaphore) -> VkResult<(u32, bool)>;
    fn submit(
        &mut self,
        image_index: u32,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<()>;
    /// Returns whether the swapchain is suboptimal
    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> VkResult<bool>;
    fn wait_idle(&mut self) -> VkResult<()>;
}

/// What happened to one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Submitted and presented
    Presented,
    /// Submitted and presented, but the swapchain should be rebuilt
    Suboptimal,
    /// The swapchain no longer matches the surface; nothing was submitted if
    /// this came from acquisition
    OutOfDate,
}

impl FrameStatus {
    pub fn needs_rebuild(self) -> bool {
        !matches!(self, FrameStatus::Presented)
    }
}

pub struct FrameScheduler {
    slots: Vec<FrameSlot>,
    /// Fence of the last submission that rendered into each swapchain image
    images_in_flight: Vec<Option<vk::Fence>>,
    current: usize,
}

impl FrameScheduler {
    pub fn new(slots: Vec<FrameSlot>, image_count: usize) -> Self {
        debug_assert!(!slots.is_empty());
        Self {
            slots,
            images_in_flight: vec![None; image_count],
            current: 0,
        }
    }

    /// Create [`MAX_FRAMES_IN_FLIGHT`] slots on `device`
    pub fn create(device: &ash::Device, image_count: usize) -> RendererResult<Self> {
        let mut slots = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            match FrameSlot::new(device) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    for slot in &slots {
                        unsafe { slot.destroy(device) };
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self::new(slots, image_count))
    }

    #[cfg(test)]
    pub fn current_slot(&self) -> usize {
        self.current
    }

    pub fn image_count(&self) -> usize {
        self.images_in_flight.len()
    }

    /// Fence recorded against `image`, if its last submission may be pending
    pub fn image_fence(&self, image: usize) -> Option<vk::Fence> {
        self.images_in_flight.get(image).copied().flatten()
    }

    /// Forget per-image tracking after the swapchain was rebuilt.
    ///
    /// Only valid once the device is idle.
    pub fn reset_images(&mut self, image_count: usize) {
        self.images_in_flight = vec![None; image_count];
    }

    /// Run one iteration of the frame loop
    pub fn draw_frame<D: FrameDriver>(&mut self, gpu: &mut D) -> RendererResult<FrameStatus> {
        let slot = self.slots[self.current];

        // 1. Never more than MAX_FRAMES_IN_FLIGHT submissions outstanding
        gpu.wait_for_fence(slot.in_flight)
            .map_err(frame_error(FrameStep::WaitForSlot))?;

        // The slot's previous submission has retired, so any image still
        // pointing at this fence is free. Dropping those entries keeps an
        // image from later waiting on the fence after it is reused below.
        for entry in &mut self.images_in_flight {
            if *entry == Some(slot.in_flight) {
                *entry = None;
            }
        }

        // 2. Acquire; the fence is untouched until we know we will submit
        let (image_index, acquire_suboptimal) = match gpu.acquire_next_image(slot.image_available) {
            Ok(acquired) => acquired,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => return Ok(FrameStatus::OutOfDate),
            Err(result) => return Err(frame_error(FrameStep::AcquireImage)(result)),
        };

        let image = image_index as usize;
        if image >= self.images_in_flight.len() {
            return Err(RendererError::ImageIndexOutOfRange {
                index: image_index,
                count: self.images_in_flight.len(),
            });
        }

        // 3. Another slot may still be rendering into this image
        if let Some(fence) = self.images_in_flight[image] {
            gpu.wait_for_fence(fence)
                .map_err(frame_error(FrameStep::WaitForImage))?;
            self.images_in_flight[image] = None;
        }

        // 4. Submit
        gpu.reset_fence(slot.in_flight)
            .map_err(frame_error(FrameStep::ResetFence))?;
        gpu.submit(
            image_index,
            slot.image_available,
            slot.render_finished,
            slot.in_flight,
        )
        .map_err(frame_error(FrameStep::Submit))?;

        // 5. Present
        let present = gpu.present(image_index, slot.render_finished);

        // 6. The submission happened whatever present reports
        self.images_in_flight[image] = Some(slot.in_flight);
        self.current = (self.current + 1) % self.slots.len();

        match present {
            Ok(false) if !acquire_suboptimal => Ok(FrameStatus::Presented),
            Ok(_) => Ok(FrameStatus::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(FrameStatus::OutOfDate),
            Err(result) => Err(frame_error(FrameStep::Present)(result)),
        }
    }

    /// Block until the GPU has finished everything submitted so far
    pub fn drain<D: FrameDriver>(&mut self, gpu: &mut D) -> RendererResult<()> {
        gpu.wait_idle().map_err(frame_error(FrameStep::WaitIdle))?;
        self.images_in_flight.iter_mut().for_each(|entry| *entry = None);
        Ok(())
    }

    /// Destroy every slot.
    ///
    /// # Safety
    /// Call [`drain`](Self::drain) first; nothing may still reference the slots.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for slot in self.slots.drain(..) {
            slot.destroy(device);
        }
        self.images_in_flight.clear();
        self.current = 0;
    }
}

fn frame_error(step: FrameStep) -> impl Fn(vk::Result) -> RendererError {
    move |result| RendererError::Frame { step, result }
}

/// [`FrameDriver`] backed by the real device, swapchain and prerecorded buffers
pub struct DeviceFrameDriver<'a> {
    pub device: &'a VulkanDevice,
    pub swapchain: &'a Swapchain,
    /// Indexed by swapchain image
    pub command_buffers: &'a [vk::CommandBuffer],
}

impl FrameDriver for DeviceFrameDriver<'_> {
    fn wait_for_fence(&mut self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.device.wait_for_fences(&[fence], true, u64::MAX) }
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.device.reset_fences(&[fence]) }
    }

    fn acquire_next_image(&mut self, signal: vk::Semaphore) -> VkResult<(u32, bool)> {
        self.swapchain.acquire_next_image(u64::MAX, signal)
    }

    fn submit(
        &mut self,
        image_index: u32,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<()> {
        let cmd = *self
            .command_buffers
            .get(image_index as usize)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;

        let wait_semaphores = [wait];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [cmd];
        let signal_semaphores = [signal];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device
                .device
                .queue_submit(self.device.graphics_queue, &[submit_info.build()], fence)
        }
    }

    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> VkResult<bool> {
        self.swapchain
            .present(self.device.present_queue, image_index, &[wait])
    }

    fn wait_idle(&mut self) -> VkResult<()> {
        self.device.wait_idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::collections::HashMap;

    struct Submission {
        fence: vk::Fence,
        image: u32,
        submitted_at: usize,
        done: bool,
    }

    /// In-order GPU queue that finishes a submission `latency` ticks after it
    /// was made, or earlier when the CPU blocks on its fence.
    struct SimGpu {
        signaled: HashMap<u64, bool>,
        queue: Vec<Submission>,
        acquire_script: Vec<u32>,
        acquires: usize,
        latency: usize,
        tick: usize,
        blocking_waits: usize,
        waited: Vec<vk::Fence>,
        idle_waits: usize,
        fail_wait: Option<vk::Result>,
        out_of_date_on_acquire: Option<usize>,
        present_result: VkResult<bool>,
    }

    impl SimGpu {
        fn new(slots: &[FrameSlot], acquire_script: Vec<u32>, latency: usize) -> Self {
            Self {
                signaled: slots.iter().map(|s| (s.in_flight.as_raw(), true)).collect(),
                queue: Vec::new(),
                acquire_script,
                acquires: 0,
                latency,
                tick: 0,
                blocking_waits: 0,
                waited: Vec::new(),
                idle_waits: 0,
                fail_wait: None,
                out_of_date_on_acquire: None,
                present_result: Ok(false),
            }
        }

        fn complete_through(&mut self, last: usize) {
            for submission in &mut self.queue[..=last] {
                if !submission.done {
                    submission.done = true;
                    self.signaled.insert(submission.fence.as_raw(), true);
                }
            }
        }

        fn advance(&mut self) {
            self.tick += 1;
            let ready = self
                .queue
                .iter()
                .rposition(|s| self.tick - s.submitted_at >= self.latency);
            if let Some(last) = ready {
                self.complete_through(last);
            }
        }

        fn pending(&self) -> impl Iterator<Item = &Submission> {
            self.queue.iter().filter(|s| !s.done)
        }
    }

    impl FrameDriver for SimGpu {
        fn wait_for_fence(&mut self, fence: vk::Fence) -> VkResult<()> {
            if let Some(result) = self.fail_wait {
                return Err(result);
            }
            self.waited.push(fence);
            if self.signaled[&fence.as_raw()] {
                return Ok(());
            }
            self.blocking_waits += 1;
            let last = self
                .queue
                .iter()
                .rposition(|s| s.fence == fence && !s.done)
                .expect("waiting on an unsignaled fence nobody will signal");
            self.complete_through(last);
            Ok(())
        }

        fn reset_fence(&mut self, fence: vk::Fence) -> VkResult<()> {
            assert!(
                self.signaled[&fence.as_raw()],
                "fence reset while its submission is still running"
            );
            self.signaled.insert(fence.as_raw(), false);
            Ok(())
        }

        fn acquire_next_image(&mut self, _signal: vk::Semaphore) -> VkResult<(u32, bool)> {
            let call = self.acquires;
            self.acquires += 1;
            if self.out_of_date_on_acquire == Some(call) {
                return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
            }
            Ok((self.acquire_script[call % self.acquire_script.len()], false))
        }

        fn submit(
            &mut self,
            image_index: u32,
            _wait: vk::Semaphore,
            _signal: vk::Semaphore,
            fence: vk::Fence,
        ) -> VkResult<()> {
            assert!(!self.signaled[&fence.as_raw()], "submitting with a signaled fence");
            assert!(
                self.pending().all(|s| s.image != image_index),
                "image {} already has a running submission",
                image_index
            );
            assert!(
                self.pending().count() < MAX_FRAMES_IN_FLIGHT,
                "more than {} submissions in flight",
                MAX_FRAMES_IN_FLIGHT
            );
            self.queue.push(Submission {
                fence,
                image: image_index,
                submitted_at: self.tick,
                done: false,
            });
            Ok(())
        }

        fn present(&mut self, _image_index: u32, _wait: vk::Semaphore) -> VkResult<bool> {
            self.present_result
        }

        fn wait_idle(&mut self) -> VkResult<()> {
            self.idle_waits += 1;
            if !self.queue.is_empty() {
                let last = self.queue.len() - 1;
                self.complete_through(last);
            }
            Ok(())
        }
    }

    fn slots() -> Vec<FrameSlot> {
        (0..MAX_FRAMES_IN_FLIGHT as u64)
            .map(|i| FrameSlot {
                image_available: vk::Semaphore::from_raw(100 + i),
                render_finished: vk::Semaphore::from_raw(200 + i),
                in_flight: vk::Fence::from_raw(300 + i),
            })
            .collect()
    }

    fn fence(slot: u64) -> vk::Fence {
        vk::Fence::from_raw(300 + slot)
    }

    #[test]
    fn test_max_frames_in_flight_constant() {
        assert_eq!(MAX_FRAMES_IN_FLIGHT, 2);
    }

    #[test]
    fn test_steady_state_fast_gpu() {
        let slots = slots();
        let mut gpu = SimGpu::new(&slots, vec![0, 1, 2], 1);
        let mut scheduler = FrameScheduler::new(slots, 3);

        for frame in 0..100 {
            let before = gpu.blocking_waits;
            assert_eq!(scheduler.current_slot(), frame % MAX_FRAMES_IN_FLIGHT);
            assert_eq!(scheduler.draw_frame(&mut gpu).unwrap(), FrameStatus::Presented);
            assert!(gpu.blocking_waits - before <= 1, "frame {} blocked twice", frame);
            gpu.advance();
        }
        assert_eq!(gpu.queue.len(), 100);
    }

    #[test]
    fn test_reordered_images_on_slow_gpu_keep_invariants() {
        let slots = slots();
        let script = vec![0, 1, 2, 2, 1, 0, 1, 1, 0, 2, 0, 0];
        let mut gpu = SimGpu::new(&slots, script, 3);
        let mut scheduler = FrameScheduler::new(slots, 3);

        // SimGpu::submit asserts both invariants on every frame
        for _ in 0..100 {
            assert!(!scheduler.draw_frame(&mut gpu).unwrap().needs_rebuild());
            gpu.advance();
        }
        assert_eq!(gpu.queue.len(), 100);
    }

    #[test]
    fn test_image_held_by_other_slot_is_waited_on() {
        let slots = slots();
        // GPU never finishes on its own
        let mut gpu = SimGpu::new(&slots, vec![0, 1, 1], usize::MAX);
        let mut scheduler = FrameScheduler::new(slots, 3);

        scheduler.draw_frame(&mut gpu).unwrap(); // slot 0 -> image 0
        scheduler.draw_frame(&mut gpu).unwrap(); // slot 1 -> image 1
        assert_eq!(scheduler.image_fence(1), Some(fence(1)));

        gpu.waited.clear();
        scheduler.draw_frame(&mut gpu).unwrap(); // slot 0 -> image 1 again
        assert_eq!(gpu.waited, vec![fence(0), fence(1)]);
        assert_eq!(scheduler.image_fence(1), Some(fence(0)));
        assert_eq!(scheduler.image_fence(0), None);
    }

    #[test]
    fn test_reused_fence_is_not_waited_on_for_stale_image() {
        let slots = slots();
        let mut gpu = SimGpu::new(&slots, vec![0, 1, 2, 0], usize::MAX);
        let mut scheduler = FrameScheduler::new(slots, 3);

        scheduler.draw_frame(&mut gpu).unwrap(); // slot 0 -> image 0
        scheduler.draw_frame(&mut gpu).unwrap(); // slot 1 -> image 1
        scheduler.draw_frame(&mut gpu).unwrap(); // slot 0 -> image 2, fence 0 reused

        gpu.waited.clear();
        scheduler.draw_frame(&mut gpu).unwrap(); // slot 1 -> image 0
        // Image 0's old fence now guards image 2; only the slot fence is waited on
        assert_eq!(gpu.waited, vec![fence(1)]);
    }

    #[test]
    fn test_out_of_date_acquire_skips_submission() {
        let slots = slots();
        let mut gpu = SimGpu::new(&slots, vec![0, 1], 1);
        gpu.out_of_date_on_acquire = Some(0);
        let mut scheduler = FrameScheduler::new(slots, 2);

        assert_eq!(scheduler.draw_frame(&mut gpu).unwrap(), FrameStatus::OutOfDate);
        assert!(gpu.queue.is_empty());
        assert_eq!(scheduler.current_slot(), 0);
        // Fence was left signaled, so the retry does not block
        assert_eq!(scheduler.draw_frame(&mut gpu).unwrap(), FrameStatus::Presented);
        assert_eq!(gpu.blocking_waits, 0);
    }

    #[test]
    fn test_suboptimal_and_out_of_date_present_still_advance() {
        let slots = slots();
        let mut gpu = SimGpu::new(&slots, vec![0, 1], 1);
        let mut scheduler = FrameScheduler::new(slots, 2);

        gpu.present_result = Ok(true);
        assert_eq!(scheduler.draw_frame(&mut gpu).unwrap(), FrameStatus::Suboptimal);
        assert_eq!(scheduler.current_slot(), 1);

        gpu.present_result = Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        assert_eq!(scheduler.draw_frame(&mut gpu).unwrap(), FrameStatus::OutOfDate);
        assert_eq!(scheduler.current_slot(), 0);
        assert_eq!(scheduler.image_fence(1), Some(fence(1)));
    }

    #[test]
    fn test_device_lost_is_fatal() {
        let slots = slots();
        let mut gpu = SimGpu::new(&slots, vec![0], 1);
        gpu.fail_wait = Some(vk::Result::ERROR_DEVICE_LOST);
        let mut scheduler = FrameScheduler::new(slots, 1);

        match scheduler.draw_frame(&mut gpu) {
            Err(RendererError::Frame { step, result }) => {
                assert_eq!(step, FrameStep::WaitForSlot);
                assert_eq!(result, vk::Result::ERROR_DEVICE_LOST);
            }
            other => panic!("expected frame error, got {:?}", other),
        }
    }

    #[test]
    fn test_present_error_is_fatal() {
        let slots = slots();
        let mut gpu = SimGpu::new(&slots, vec![0], 1);
        gpu.present_result = Err(vk::Result::ERROR_SURFACE_LOST_KHR);
        let mut scheduler = FrameScheduler::new(slots, 1);

        assert!(matches!(
            scheduler.draw_frame(&mut gpu),
            Err(RendererError::Frame {
                step: FrameStep::Present,
                ..
            })
        ));
    }

    #[test]
    fn test_unknown_image_index_rejected() {
        let slots = slots();
        let mut gpu = SimGpu::new(&slots, vec![5], 1);
        let mut scheduler = FrameScheduler::new(slots, 3);

        assert!(matches!(
            scheduler.draw_frame(&mut gpu),
            Err(RendererError::ImageIndexOutOfRange { index: 5, count: 3 })
        ));
        assert!(gpu.queue.is_empty());
    }

    #[test]
    fn test_drain_waits_for_idle_and_clears_tracking() {
        let slots = slots();
        let mut gpu = SimGpu::new(&slots, vec![0, 1], usize::MAX);
        let mut scheduler = FrameScheduler::new(slots, 2);

        scheduler.draw_frame(&mut gpu).unwrap();
        scheduler.draw_frame(&mut gpu).unwrap();
        assert_eq!(gpu.pending().count(), 2);

        scheduler.drain(&mut gpu).unwrap();
        assert_eq!(gpu.idle_waits, 1);
        assert_eq!(gpu.pending().count(), 0);
        assert_eq!(scheduler.image_fence(0), None);
        assert_eq!(scheduler.image_fence(1), None);
    }

    #[test]
    fn test_reset_images_resizes_tracking() {
        let mut scheduler = FrameScheduler::new(slots(), 3);
        scheduler.reset_images(4);
        assert_eq!(scheduler.image_count(), 4);
        assert_eq!(scheduler.image_fence(3), None);
    }
}
