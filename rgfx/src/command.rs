//! Command pools and individually resettable primary command buffers.
//!
//! Buffers carry a CPU-side [`RecordingState`] so recording calls made out
//! of order trip a debug assertion instead of reaching the driver.

use std::{
    marker::PhantomData,
    sync::{Arc, mpsc},
};

use ash::vk;
use thiserror::Error;

use crate::buffer::RawBuffer;
use crate::device::Device;

#[derive(Debug, Error)]
pub enum CreateCommandPoolError {
    #[error("Vulkan error creating command pool: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum AllocateCommandBufferError {
    #[error("Vulkan error allocating command buffer: {0}")]
    Vulkan(vk::Result),
}

/// The raw pool, co-owned by the pool wrapper and every buffer from it so
/// the pool outlives its buffers.
struct CommandPoolShared {
    parent: Arc<Device>,
    pool: vk::CommandPool,
}

impl Drop for CommandPoolShared {
    fn drop(&mut self) {
        tracing::debug!("Dropping command pool {:?}", self.pool);
        // SAFETY: the last pool wrapper and buffer are gone; destroying the
        // pool frees any buffers still allocated from it.
        unsafe { self.parent.destroy_raw_command_pool(self.pool) };
    }
}

// ---------------------------------------------------------------------------
// ResettableCommandPool
// ---------------------------------------------------------------------------

/// A `RESET_COMMAND_BUFFER` pool for one queue family.
///
/// `!Sync`, which satisfies Vulkan's external synchronisation rule for pool
/// operations. Dropped buffers come back through a channel and are
/// recycled by the next allocation.
pub struct ResettableCommandPool {
    shared: Arc<CommandPoolShared>,
    sender: mpsc::Sender<vk::CommandBuffer>,
    receiver: mpsc::Receiver<vk::CommandBuffer>,
    _not_sync: PhantomData<std::cell::Cell<()>>,
}

impl std::fmt::Debug for ResettableCommandPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResettableCommandPool")
            .field("pool", &self.shared.pool)
            .finish_non_exhaustive()
    }
}

impl ResettableCommandPool {
    pub fn new(
        device: &Arc<Device>,
        queue_family: u32,
        name: Option<&str>,
    ) -> Result<Self, CreateCommandPoolError> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        // SAFETY: queue_family comes from the device's own queue roles.
        let pool = unsafe { device.create_raw_command_pool(&create_info) }
            .map_err(CreateCommandPoolError::Vulkan)?;
        // SAFETY: pool was just created from device.
        unsafe { device.name_or_warn(pool, name) };

        let (sender, receiver) = mpsc::channel();
        Ok(Self {
            shared: Arc::new(CommandPoolShared {
                parent: Arc::clone(device),
                pool,
            }),
            sender,
            receiver,
            _not_sync: PhantomData,
        })
    }

    /// Allocates one primary buffer, reusing a returned handle when one is
    /// waiting. Surplus returned handles are freed.
    ///
    /// A recycled handle may still hold old commands; the state is reported
    /// as [`RecordingState::Stale`] until the buffer is reset.
    pub fn allocate_command_buffer(
        &self,
        name: Option<&str>,
    ) -> Result<ResettableCommandBuffer, AllocateCommandBufferError> {
        let mut returned: Vec<vk::CommandBuffer> =
            std::iter::from_fn(|| self.receiver.try_recv().ok()).collect();

        let (handle, state) = match returned.pop() {
            Some(recycled) => {
                // SAFETY: every returned handle came from this pool and was
                // dropped only after its work completed. The pool is !Sync.
                unsafe {
                    self.shared
                        .parent
                        .free_raw_command_buffers(self.shared.pool, &returned)
                };
                (recycled, RecordingState::Stale)
            }
            None => {
                let allocate_info = vk::CommandBufferAllocateInfo::default()
                    .command_pool(self.shared.pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1);
                // SAFETY: the pool is alive and only reachable from this
                // thread.
                let fresh = unsafe {
                    self.shared
                        .parent
                        .allocate_raw_command_buffers(&allocate_info)
                }
                .map_err(AllocateCommandBufferError::Vulkan)?
                .into_iter()
                .next()
                .ok_or(AllocateCommandBufferError::Vulkan(
                    vk::Result::ERROR_UNKNOWN,
                ))?;
                (fresh, RecordingState::Initial)
            }
        };

        // SAFETY: handle belongs to this device.
        unsafe { self.shared.parent.name_or_warn(handle, name) };

        Ok(ResettableCommandBuffer {
            _pool: Arc::clone(&self.shared),
            parent: Arc::clone(&self.shared.parent),
            handle,
            state,
            return_sender: self.sender.clone(),
        })
    }

    pub fn raw_command_pool(&self) -> vk::CommandPool {
        self.shared.pool
    }
}

// ---------------------------------------------------------------------------
// ResettableCommandBuffer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Initial,
    Recording,
    Executable,
    /// Recycled from the pool, contents unknown. Must be reset.
    Stale,
}

/// A primary command buffer from a [`ResettableCommandPool`].
///
/// Every method is `unsafe` because only the caller knows whether the GPU
/// is still executing the buffer.
pub struct ResettableCommandBuffer {
    _pool: Arc<CommandPoolShared>,
    parent: Arc<Device>,
    handle: vk::CommandBuffer,
    state: RecordingState,
    return_sender: mpsc::Sender<vk::CommandBuffer>,
}

impl Drop for ResettableCommandBuffer {
    fn drop(&mut self) {
        // A closed channel means the pool wrapper is gone; destroying the
        // pool reclaims the handle.
        let _ = self.return_sender.send(self.handle);
    }
}

impl std::fmt::Debug for ResettableCommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResettableCommandBuffer")
            .field("handle", &self.handle)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ResettableCommandBuffer {
    fn assert_recording(&self) {
        debug_assert_eq!(
            self.state,
            RecordingState::Recording,
            "command recorded outside begin/end"
        );
    }

    /// # Safety
    /// The buffer must not be pending execution.
    pub unsafe fn reset(&mut self) -> Result<(), vk::Result> {
        // SAFETY: forwarded to the caller.
        unsafe {
            self.parent.reset_raw_command_buffer(
                self.handle,
                vk::CommandBufferResetFlags::empty(),
            )
        }?;
        self.state = RecordingState::Initial;
        Ok(())
    }

    /// # Safety
    /// The buffer must not be pending execution.
    pub unsafe fn begin(
        &mut self,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<(), vk::Result> {
        debug_assert_eq!(self.state, RecordingState::Initial);
        let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
        // SAFETY: forwarded to the caller.
        unsafe {
            self.parent
                .begin_raw_command_buffer(self.handle, &begin_info)
        }?;
        self.state = RecordingState::Recording;
        Ok(())
    }

    /// # Safety
    /// No rendering scope may be open.
    pub unsafe fn end(&mut self) -> Result<(), vk::Result> {
        self.assert_recording();
        // SAFETY: forwarded to the caller.
        unsafe { self.parent.end_raw_command_buffer(self.handle) }?;
        self.state = RecordingState::Executable;
        Ok(())
    }

    pub fn state(&self) -> RecordingState {
        self.state
    }

    /// # Safety
    /// `dependency_info` must match the current state of the resources it
    /// names.
    pub unsafe fn pipeline_barrier2(
        &mut self,
        dependency_info: &vk::DependencyInfo<'_>,
    ) {
        self.assert_recording();
        // SAFETY: forwarded to the caller.
        unsafe {
            self.parent
                .cmd_pipeline_barrier2(self.handle, dependency_info)
        }
    }

    /// Records one image layout transition.
    ///
    /// # Safety
    /// `barrier.image` must be in `barrier.old_layout` when the barrier
    /// executes.
    pub unsafe fn image_barrier(&mut self, barrier: vk::ImageMemoryBarrier2<'_>) {
        let barriers = [barrier];
        let info = vk::DependencyInfo::default().image_memory_barriers(&barriers);
        // SAFETY: forwarded to the caller.
        unsafe { self.pipeline_barrier2(&info) }
    }

    /// # Safety
    /// Attachments must be in the layouts `rendering_info` declares.
    pub unsafe fn begin_rendering(&mut self, rendering_info: &vk::RenderingInfo<'_>) {
        self.assert_recording();
        // SAFETY: forwarded to the caller.
        unsafe {
            self.parent
                .cmd_begin_raw_rendering(self.handle, rendering_info)
        }
    }

    /// # Safety
    /// A rendering scope must be open.
    pub unsafe fn end_rendering(&mut self) {
        self.assert_recording();
        // SAFETY: forwarded to the caller.
        unsafe { self.parent.cmd_end_raw_rendering(self.handle) }
    }

    /// # Safety
    /// `pipeline` must come from the same device.
    pub unsafe fn bind_graphics_pipeline(&mut self, pipeline: vk::Pipeline) {
        self.assert_recording();
        // SAFETY: forwarded to the caller.
        unsafe {
            self.parent
                .cmd_bind_graphics_pipeline(self.handle, pipeline)
        }
    }

    /// # Safety
    /// `layout` must be compatible with the bound pipeline and
    /// `dynamic_offsets` must cover every dynamic descriptor in `sets`.
    pub unsafe fn bind_descriptor_sets(
        &mut self,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        self.assert_recording();
        // SAFETY: forwarded to the caller.
        unsafe {
            self.parent.cmd_bind_descriptor_sets(
                self.handle,
                layout,
                first_set,
                sets,
                dynamic_offsets,
            )
        }
    }

    /// # Safety
    /// The range must fit a push constant range of `layout` for `stages`.
    pub unsafe fn push_constants(
        &mut self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        self.assert_recording();
        // SAFETY: forwarded to the caller.
        unsafe {
            self.parent
                .cmd_push_constants(self.handle, layout, stages, offset, data)
        }
    }

    /// # Safety
    /// `buffer` must come from the same device and have vertex usage.
    pub unsafe fn bind_vertex_buffer<B: RawBuffer + ?Sized>(
        &mut self,
        binding: u32,
        buffer: &B,
        offset: vk::DeviceSize,
    ) {
        self.assert_recording();
        // SAFETY: forwarded to the caller.
        unsafe {
            self.parent.cmd_bind_vertex_buffers(
                self.handle,
                binding,
                &[buffer.raw_buffer()],
                &[offset],
            )
        }
    }

    /// # Safety
    /// `buffer` must come from the same device and have index usage.
    pub unsafe fn bind_index_buffer<B: RawBuffer + ?Sized>(
        &mut self,
        buffer: &B,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        self.assert_recording();
        // SAFETY: forwarded to the caller.
        unsafe {
            self.parent.cmd_bind_index_buffer(
                self.handle,
                buffer.raw_buffer(),
                offset,
                index_type,
            )
        }
    }

    /// # Safety
    /// Regions must be in bounds for both buffers.
    pub unsafe fn copy_buffer(
        &mut self,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        self.assert_recording();
        // SAFETY: forwarded to the caller.
        unsafe { self.parent.cmd_copy_buffer(self.handle, src, dst, regions) }
    }

    /// # Safety
    /// `dst` must be in `TRANSFER_DST_OPTIMAL` and regions in bounds.
    pub unsafe fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        regions: &[vk::BufferImageCopy],
    ) {
        self.assert_recording();
        // SAFETY: forwarded to the caller.
        unsafe {
            self.parent
                .cmd_copy_buffer_to_image(self.handle, src, dst, regions)
        }
    }

    /// # Safety
    /// `src` must be in `TRANSFER_SRC_OPTIMAL` and regions in bounds.
    pub unsafe fn copy_image_to_buffer(
        &mut self,
        src: vk::Image,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        self.assert_recording();
        // SAFETY: forwarded to the caller.
        unsafe {
            self.parent
                .cmd_copy_image_to_buffer(self.handle, src, dst, regions)
        }
    }

    /// # Safety
    /// The bound pipeline must declare dynamic viewport state.
    pub unsafe fn set_viewport(&mut self, viewport: vk::Viewport) {
        self.assert_recording();
        // SAFETY: forwarded to the caller.
        unsafe { self.parent.cmd_set_viewport(self.handle, &[viewport]) }
    }

    /// # Safety
    /// The bound pipeline must declare dynamic scissor state.
    pub unsafe fn set_scissor(&mut self, scissor: vk::Rect2D) {
        self.assert_recording();
        // SAFETY: forwarded to the caller.
        unsafe { self.parent.cmd_set_scissor(self.handle, &[scissor]) }
    }

    /// # Safety
    /// Must be inside a rendering scope with a pipeline bound.
    pub unsafe fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        self.assert_recording();
        // SAFETY: forwarded to the caller.
        unsafe {
            self.parent.cmd_draw(
                self.handle,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            )
        }
    }

    /// # Safety
    /// Must be inside a rendering scope with a pipeline and index buffer
    /// bound.
    pub unsafe fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.assert_recording();
        // SAFETY: forwarded to the caller.
        unsafe {
            self.parent.cmd_draw_indexed(
                self.handle,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        }
    }

    pub fn raw_command_buffer(&self) -> vk::CommandBuffer {
        self.handle
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }
}

// Both types must stay Send so a renderer can move between threads.
#[allow(dead_code)]
trait AssertSend: Send {}
impl AssertSend for ResettableCommandPool {}
impl AssertSend for ResettableCommandBuffer {}
