//! One-shot transfers between host and device memory.
//!
//! [`UploadContext`] owns a command buffer and fence used for staging
//! copies. Every call records, submits on the graphics queue and blocks
//! until the GPU is done, so staging buffers can be dropped on return.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::buffer::{
    CreateBufferError, DeviceLocalBuffer, HostVisibleBuffer, RawBuffer, ReadBufferError,
    ReadbackBuffer, UploadBufferError, WriteBufferError, transfer_to_host_barrier,
};
use crate::command::{
    AllocateCommandBufferError, CreateCommandPoolError, ResettableCommandBuffer,
    ResettableCommandPool,
};
use crate::device::Device;
use crate::device_select::QueueRole;
use crate::image::{Texture, UploadImageError};
use crate::sync::{CreateFenceError, Fence, MarkSubmittedError, ResetFenceError, WaitFenceError};

#[derive(Debug, Error)]
pub enum CreateUploadContextError {
    #[error(transparent)]
    CommandPool(#[from] CreateCommandPoolError),
    #[error(transparent)]
    CommandBuffer(#[from] AllocateCommandBufferError),
    #[error(transparent)]
    Fence(#[from] CreateFenceError),
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Failed to create staging buffer: {0}")]
    Staging(#[from] CreateBufferError),
    #[error("Failed to fill staging buffer: {0}")]
    Write(#[from] WriteBufferError),
    #[error("Failed to read back buffer: {0}")]
    Read(#[from] ReadBufferError),
    #[error(transparent)]
    Buffer(#[from] UploadBufferError),
    #[error(transparent)]
    Image(#[from] UploadImageError),
    #[error("Vulkan error recording upload commands: {0}")]
    Record(vk::Result),
    #[error("Vulkan error submitting upload: {0}")]
    Submit(vk::Result),
    #[error("Waiting for upload failed: {0}")]
    Wait(#[from] WaitFenceError),
    #[error("Resetting upload fence failed: {0}")]
    ResetFence(#[from] ResetFenceError),
    #[error(transparent)]
    MarkSubmitted(#[from] MarkSubmittedError),
}

pub struct UploadContext {
    device: Arc<Device>,
    // Field order: the buffer must return to the pool before it is dropped.
    command_buffer: ResettableCommandBuffer,
    _pool: ResettableCommandPool,
    fence: Fence,
}

impl std::fmt::Debug for UploadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadContext")
            .field("command_buffer", &self.command_buffer)
            .field("fence", &self.fence)
            .finish_non_exhaustive()
    }
}

impl UploadContext {
    pub fn new(device: &Arc<Device>) -> Result<Self, CreateUploadContextError> {
        let pool = ResettableCommandPool::new(
            device,
            device.queue_family(QueueRole::Graphics),
            Some("upload pool"),
        )?;
        let command_buffer = pool.allocate_command_buffer(Some("upload commands"))?;
        let fence = Fence::new(device, false, Some("upload fence"))?;
        Ok(Self {
            device: Arc::clone(device),
            command_buffer,
            _pool: pool,
            fence,
        })
    }

    /// Records `record` into the upload command buffer, submits it and
    /// waits for completion.
    pub fn submit_blocking<R>(
        &mut self,
        record: impl FnOnce(&mut ResettableCommandBuffer) -> Result<R, UploadError>,
    ) -> Result<R, UploadError> {
        let _span = tracing::trace_span!("upload_submit").entered();
        let cmd = &mut self.command_buffer;
        // SAFETY: every previous submission was waited on before returning,
        // so the buffer is not pending.
        unsafe {
            cmd.reset().map_err(UploadError::Record)?;
            cmd.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
                .map_err(UploadError::Record)?;
        }
        let recorded = record(cmd);
        // SAFETY: the buffer is recording and no rendering scope is open.
        unsafe { cmd.end() }.map_err(UploadError::Record)?;
        let out = recorded?;

        let cmd_info =
            [vk::CommandBufferSubmitInfo::default().command_buffer(cmd.raw_command_buffer())];
        let submit = vk::SubmitInfo2::default().command_buffer_infos(&cmd_info);
        // SAFETY: the command buffer is executable and the fence is
        // unsignaled.
        unsafe {
            self.device.queue_submit2(
                QueueRole::Graphics,
                std::slice::from_ref(&submit),
                self.fence.raw_fence(),
            )
        }
        .map_err(UploadError::Submit)?;
        // SAFETY: the submission above signals this fence.
        unsafe { self.fence.mark_submitted() }?;
        self.fence.wait(u64::MAX)?;
        self.fence.reset()?;
        Ok(out)
    }

    /// Creates a device-local buffer holding `bytes`. `usage` gains
    /// `TRANSFER_DST` automatically.
    pub fn create_device_local_buffer(
        &mut self,
        bytes: &[u8],
        usage: vk::BufferUsageFlags,
        name: Option<&str>,
    ) -> Result<DeviceLocalBuffer, UploadError> {
        let size = bytes.len() as vk::DeviceSize;
        let mut staging = HostVisibleBuffer::new(
            &self.device,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            Some("staging buffer"),
        )?;
        staging.write_bytes(bytes)?;
        let mut buffer = DeviceLocalBuffer::new(
            &self.device,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            name,
        )?;
        self.submit_blocking(|cmd| {
            // SAFETY: both buffers outlive the blocking submission.
            unsafe { buffer.record_copy_from(cmd, &staging) }?;
            Ok(())
        })?;
        Ok(buffer)
    }

    /// Uploads tightly packed pixels for every layer of `texture` and leaves
    /// it in `SHADER_READ_ONLY_OPTIMAL`.
    pub fn upload_texture(&mut self, texture: &Texture, pixels: &[u8]) -> Result<(), UploadError> {
        let mut staging = HostVisibleBuffer::new(
            &self.device,
            pixels.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            Some("texture staging buffer"),
        )?;
        staging.write_bytes(pixels)?;
        self.submit_blocking(|cmd| {
            // SAFETY: the texture and staging buffer outlive the blocking
            // submission, and the texture was created with TRANSFER_DST.
            unsafe { texture.image().record_upload(cmd, &staging) }?;
            Ok(())
        })
    }

    /// Copies the first `size` bytes of `src` back to the host. `src`
    /// needs `TRANSFER_SRC` usage.
    pub fn read_buffer<B: RawBuffer + ?Sized>(
        &mut self,
        src: &B,
        size: vk::DeviceSize,
    ) -> Result<Vec<u8>, UploadError> {
        let readback = ReadbackBuffer::new(&self.device, size, Some("readback buffer"))?;
        self.submit_blocking(|cmd| {
            let region = vk::BufferCopy::default().size(size);
            let to_host = transfer_to_host_barrier();
            // SAFETY: both buffers outlive the blocking submission and the
            // region fits the readback buffer.
            unsafe {
                cmd.copy_buffer(
                    src.raw_buffer(),
                    readback.raw_buffer(),
                    std::slice::from_ref(&region),
                );
                cmd.pipeline_barrier2(
                    &vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&to_host)),
                );
            }
            Ok(())
        })?;
        Ok(readback.read_bytes()?)
    }
}
