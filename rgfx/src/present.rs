//! The GPU side of frame pacing: frame slots, the swapchain, and the
//! submit/present calls that tie them together.

use std::sync::Arc;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::command::{
    AllocateCommandBufferError, CreateCommandPoolError, ResettableCommandBuffer,
    ResettableCommandPool,
};
use crate::device::Device;
use crate::device_select::QueueRole;
use crate::frame::{AcquireOutcome, FrameBackend, PresentOutcome};
use crate::image::{full_range, transition_barrier};
use crate::record::RecordError;
use crate::surface::Surface;
use crate::swapchain::{CreateSwapchainError, DepthAttachments, Swapchain};
use crate::sync::{
    CreateFenceError, CreateSemaphoreError, Fence, MarkSubmittedError, ResetFenceError, Semaphore,
    WaitFenceError,
};

#[derive(Debug, Error)]
pub enum CreatePresentTargetError {
    #[error(transparent)]
    Swapchain(#[from] CreateSwapchainError),
    #[error(transparent)]
    CommandPool(#[from] CreateCommandPoolError),
    #[error(transparent)]
    CommandBuffer(#[from] AllocateCommandBufferError),
    #[error(transparent)]
    Fence(#[from] CreateFenceError),
    #[error(transparent)]
    Semaphore(#[from] CreateSemaphoreError),
}

/// A failure inside a frame other than a stale swapchain.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Waiting for frame slot failed: {0}")]
    WaitFence(#[from] WaitFenceError),
    #[error("Resetting frame fence failed: {0}")]
    ResetFence(#[from] ResetFenceError),
    #[error(transparent)]
    MarkSubmitted(#[from] MarkSubmittedError),
    #[error("Vulkan error recording frame commands: {0}")]
    Command(vk::Result),
    #[error("Vulkan error acquiring swapchain image: {0}")]
    Acquire(vk::Result),
    #[error("Vulkan error submitting frame: {0}")]
    Submit(vk::Result),
    #[error("Vulkan error presenting frame: {0}")]
    Present(vk::Result),
    #[error("Swapchain recreation failed: {0}")]
    Resize(#[from] CreateSwapchainError),
    #[error("Replacing acquire semaphore failed: {0}")]
    Semaphore(#[from] CreateSemaphoreError),
    #[error(transparent)]
    Record(#[from] RecordError),
}

/// Everything one frame in flight needs.
#[derive(Debug)]
pub struct FrameSlot {
    command_buffer: ResettableCommandBuffer,
    image_available: Semaphore,
    render_finished: Semaphore,
    in_flight: Fence,
}

impl FrameSlot {
    fn new(
        device: &Arc<Device>,
        pool: &ResettableCommandPool,
        index: usize,
    ) -> Result<Self, CreatePresentTargetError> {
        Ok(Self {
            command_buffer: pool.allocate_command_buffer(Some(&format!("frame {index} commands")))?,
            image_available: Semaphore::new(
                device,
                Some(&format!("frame {index} image available")),
            )?,
            render_finished: Semaphore::new(
                device,
                Some(&format!("frame {index} render finished")),
            )?,
            in_flight: Fence::new(device, true, Some(&format!("frame {index} in flight")))?,
        })
    }

    pub fn command_buffer(&self) -> &ResettableCommandBuffer {
        &self.command_buffer
    }

    pub fn fence(&self) -> &Fence {
        &self.in_flight
    }
}

pub struct PresentTarget<T: HasDisplayHandle + HasWindowHandle> {
    // Field order: command buffers return to the pool before it drops.
    slots: Vec<FrameSlot>,
    _pool: ResettableCommandPool,
    swapchain: Swapchain<T>,
    device: Arc<Device>,
}

impl<T: HasDisplayHandle + HasWindowHandle> std::fmt::Debug for PresentTarget<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresentTarget")
            .field("slots", &self.slots)
            .field("swapchain", &self.swapchain)
            .finish_non_exhaustive()
    }
}

impl<T: HasDisplayHandle + HasWindowHandle> PresentTarget<T> {
    pub fn new(
        device: &Arc<Device>,
        surface: &Arc<Surface<T>>,
        extent: vk::Extent2D,
        frames_in_flight: usize,
    ) -> Result<Self, CreatePresentTargetError> {
        let swapchain = Swapchain::create(device, surface, extent)?;
        let pool = ResettableCommandPool::new(
            device,
            device.queue_family(QueueRole::Graphics),
            Some("frame command pool"),
        )?;
        let slots = (0..frames_in_flight.max(1))
            .map(|index| FrameSlot::new(device, &pool, index))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            slots,
            _pool: pool,
            swapchain,
            device: Arc::clone(device),
        })
    }

    pub fn swapchain(&self) -> &Swapchain<T> {
        &self.swapchain
    }

    pub fn swapchain_mut(&mut self) -> &mut Swapchain<T> {
        &mut self.swapchain
    }

    pub fn slot(&self, slot: usize) -> Option<&FrameSlot> {
        self.slots.get(slot)
    }

    /// The slot's open command buffer alongside the swapchain it targets.
    pub fn recording_parts(
        &mut self,
        slot: usize,
    ) -> (&mut ResettableCommandBuffer, &Swapchain<T>) {
        (&mut self.slots[slot].command_buffer, &self.swapchain)
    }

    fn depth_barriers(
        depth: Option<&DepthAttachments>,
    ) -> impl Iterator<Item = vk::ImageMemoryBarrier2<'static>> + '_ {
        depth.into_iter().flat_map(|d| d.iter()).map(|attachment| {
            // Attachments are shared between slots, so order against the
            // previous frame's depth writes.
            transition_barrier(
                attachment.raw_image(),
                DepthAttachments::range_of(attachment),
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            )
            .src_stage_mask(
                vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
            )
            .src_access_mask(vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE)
        })
    }

    fn swapchain_image(&self, image_index: u32) -> Result<vk::Image, FrameError> {
        self.swapchain
            .images()
            .get(image_index as usize)
            .copied()
            .ok_or(FrameError::Acquire(vk::Result::ERROR_OUT_OF_DATE_KHR))
    }
}

impl<T: HasDisplayHandle + HasWindowHandle> FrameBackend for PresentTarget<T> {
    type Error = FrameError;

    fn wait_for_slot(&mut self, slot: usize) -> Result<(), FrameError> {
        let _span = tracing::trace_span!("wait_for_slot", slot).entered();
        self.slots[slot].in_flight.wait(u64::MAX)?;
        Ok(())
    }

    fn is_presentable(&self) -> bool {
        self.swapchain.is_presentable()
    }

    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome, FrameError> {
        let semaphore = self.slots[slot].image_available.raw_semaphore();
        // SAFETY: the semaphore is unsignaled. Its last signal was waited
        // on by the slot's previous submission, which the slot fence
        // confirmed finished, or it was replaced by the resize path.
        match unsafe { self.swapchain.acquire_next_image(semaphore) } {
            Ok((image_index, false)) => Ok(AcquireOutcome::Acquired { image_index }),
            Ok((_, true)) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::Stale),
            Err(e) => Err(FrameError::Acquire(e)),
        }
    }

    fn begin_slot(&mut self, slot: usize, image_index: u32) -> Result<(), FrameError> {
        let image = self.swapchain_image(image_index)?;
        let depth_barriers: Vec<_> =
            Self::depth_barriers(self.swapchain.depth_attachments()).collect();
        let frame = &mut self.slots[slot];
        frame.in_flight.reset()?;

        let color = transition_barrier(
            image,
            full_range(vk::ImageAspectFlags::COLOR, 1),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        )
        .src_stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT);
        let mut barriers = Vec::with_capacity(1 + depth_barriers.len());
        barriers.push(color);
        barriers.extend(depth_barriers);
        let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);

        let cmd = &mut frame.command_buffer;
        // SAFETY: the slot fence was observed signaled, so the buffer is
        // not pending. The image was just acquired and its contents are
        // discarded by the UNDEFINED source layout.
        unsafe {
            cmd.reset().map_err(FrameError::Command)?;
            cmd.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
                .map_err(FrameError::Command)?;
            cmd.pipeline_barrier2(&dependency);
        }
        Ok(())
    }

    fn end_slot(&mut self, slot: usize, image_index: u32) -> Result<(), FrameError> {
        let image = self.swapchain_image(image_index)?;
        let cmd = &mut self.slots[slot].command_buffer;
        // SAFETY: the buffer is recording, the recorder left no rendering
        // scope open and the image is in COLOR_ATTACHMENT_OPTIMAL.
        unsafe {
            cmd.image_barrier(transition_barrier(
                image,
                full_range(vk::ImageAspectFlags::COLOR, 1),
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
            ));
            cmd.end().map_err(FrameError::Command)
        }
    }

    fn submit_slot(&mut self, slot: usize, _image_index: u32) -> Result<(), FrameError> {
        let frame = &mut self.slots[slot];
        let wait = [vk::SemaphoreSubmitInfo::default()
            .semaphore(frame.image_available.raw_semaphore())
            .stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)];
        let signal = [vk::SemaphoreSubmitInfo::default()
            .semaphore(frame.render_finished.raw_semaphore())
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let commands = [vk::CommandBufferSubmitInfo::default()
            .command_buffer(frame.command_buffer.raw_command_buffer())];
        let submit = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&wait)
            .command_buffer_infos(&commands)
            .signal_semaphore_infos(&signal);

        // SAFETY: the command buffer is executable, the fence was reset in
        // begin_slot and both semaphores belong to this device.
        unsafe {
            self.device.queue_submit2(
                QueueRole::Graphics,
                std::slice::from_ref(&submit),
                frame.in_flight.raw_fence(),
            )
        }
        .map_err(FrameError::Submit)?;
        // SAFETY: the submission above signals the fence.
        unsafe { frame.in_flight.mark_submitted() }?;
        Ok(())
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome, FrameError> {
        let wait = [self.slots[slot].render_finished.raw_semaphore()];
        let swapchains = [self.swapchain.raw_handle()];
        let indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait)
            .swapchains(&swapchains)
            .image_indices(&indices);

        // SAFETY: the image was acquired this frame and moved to
        // PRESENT_SRC_KHR by the submitted commands.
        match unsafe { self.device.queue_present(&present_info) } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::Stale),
            Err(e) => Err(FrameError::Present(e)),
        }
    }

    fn resize(&mut self) -> Result<(), FrameError> {
        let _span = tracing::debug_span!("present_target_resize").entered();
        // Recreation idles the device, so no semaphore below is in use.
        self.swapchain.recreate()?;
        // A suboptimal acquire may have left a signal nobody waits on.
        for (index, frame) in self.slots.iter_mut().enumerate() {
            frame.image_available = Semaphore::new(
                &self.device,
                Some(&format!("frame {index} image available")),
            )?;
        }
        Ok(())
    }

    fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }
}

impl<T: HasDisplayHandle + HasWindowHandle> Drop for PresentTarget<T> {
    fn drop(&mut self) {
        tracing::debug!("Dropping present target");
        if let Err(e) = self.device.wait_idle() {
            tracing::error!("Failed to idle device before dropping frame slots: {e}");
        }
    }
}
