// Frame synchronization primitives
//
// Image-available semaphores and in-flight fences are per frame in
// flight. Render-finished semaphores are per swapchain image: images
// are acquired in no particular order, so a semaphore tied to the
// frame slot could still be pending when the slot comes around
// again. Keying by the acquired image index is the only correct
// binding.
//
// Austin Shafer - 2025
use ash::vk;

use crate::device::Device;
use crate::{Result, SquallError};

use std::sync::Arc;

pub struct SyncSet {
    s_dev: Arc<Device>,
    /// Signaled by acquire, waited on by submit. Indexed by frame.
    s_image_available: Vec<vk::Semaphore>,
    /// Signaled by submit, waited on by present. Indexed by the
    /// acquired swapchain image, never by frame slot.
    s_render_finished: Vec<vk::Semaphore>,
    /// Signaled when frame N's submission retires. Created signaled
    /// so the first wait on each slot falls straight through.
    s_in_flight: Vec<vk::Fence>,
    s_frames: u32,
    s_current_frame: u32,
}

impl SyncSet {
    pub fn new(dev: Arc<Device>, frames_in_flight: u32, image_count: u32) -> Result<Self> {
        if frames_in_flight == 0 || image_count == 0 {
            return Err(SquallError::INVALID);
        }

        let mut ret = Self {
            s_dev: dev,
            s_image_available: Vec::new(),
            s_render_finished: Vec::new(),
            s_in_flight: Vec::new(),
            s_frames: frames_in_flight,
            s_current_frame: 0,
        };

        let sema_info = vk::SemaphoreCreateInfo::default();
        let fence_info =
            vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        // On any failure `ret` drops and releases what was created
        unsafe {
            for _ in 0..frames_in_flight {
                let sema = ret
                    .s_dev
                    .dev
                    .create_semaphore(&sema_info, None)
                    .or(Err(SquallError::ALLOCATION_FAILED))?;
                ret.s_image_available.push(sema);

                let fence = ret
                    .s_dev
                    .dev
                    .create_fence(&fence_info, None)
                    .or(Err(SquallError::ALLOCATION_FAILED))?;
                ret.s_in_flight.push(fence);
            }
            for _ in 0..image_count {
                let sema = ret
                    .s_dev
                    .dev
                    .create_semaphore(&sema_info, None)
                    .or(Err(SquallError::ALLOCATION_FAILED))?;
                ret.s_render_finished.push(sema);
            }
        }

        Ok(ret)
    }

    pub fn frames_in_flight(&self) -> u32 {
        self.s_frames
    }

    pub fn current_frame(&self) -> u32 {
        self.s_current_frame
    }

    pub fn image_available(&self, frame: u32) -> vk::Semaphore {
        self.s_image_available[frame as usize]
    }

    pub fn in_flight_fence(&self, frame: u32) -> vk::Fence {
        self.s_in_flight[frame as usize]
    }

    /// The render-finished semaphore for an acquired image index.
    pub fn render_finished_for_image(&self, image_index: u32) -> vk::Semaphore {
        self.s_render_finished[image_index as usize]
    }

    pub fn advance_frame(&mut self) {
        self.s_current_frame = (self.s_current_frame + 1) % self.s_frames;
    }

    /// Rebuild the per-image semaphores for a new image count.
    ///
    /// Called from swapchain recreation, after the device has gone
    /// idle, when the negotiated image count changed.
    pub fn resize_image_count(&mut self, image_count: u32) -> Result<()> {
        if image_count as usize == self.s_render_finished.len() {
            return Ok(());
        }

        let sema_info = vk::SemaphoreCreateInfo::default();
        unsafe {
            for sema in self.s_render_finished.drain(..) {
                self.s_dev.dev.destroy_semaphore(sema, None);
            }
            for _ in 0..image_count {
                let sema = self
                    .s_dev
                    .dev
                    .create_semaphore(&sema_info, None)
                    .or(Err(SquallError::ALLOCATION_FAILED))?;
                self.s_render_finished.push(sema);
            }
        }
        Ok(())
    }
}

impl Drop for SyncSet {
    fn drop(&mut self) {
        // The frame loop waits for device idle before dropping us
        unsafe {
            for fence in self.s_in_flight.drain(..) {
                self.s_dev.dev.destroy_fence(fence, None);
            }
            for sema in self.s_image_available.drain(..) {
                self.s_dev.dev.destroy_semaphore(sema, None);
            }
            for sema in self.s_render_finished.drain(..) {
                self.s_dev.dev.destroy_semaphore(sema, None);
            }
        }
    }
}
