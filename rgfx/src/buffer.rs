//! GPU buffers.
//!
//! - [`HostVisibleBuffer`]: `CpuToGpu` staging memory.
//! - [`ReadbackBuffer`]: `GpuToCpu` memory the host reads after a copy.
//! - [`DeviceLocalBuffer`]: GPU-only memory, filled through a staging copy.
//! - [`MappedBuffer`]: persistently mapped uniform/storage memory holding
//!   an array of records at a dynamic-offset stride.
//!
//! All of them own their allocation and free it on drop.

use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;
use gpu_allocator::{AllocationError, vulkan::Allocation};
use thiserror::Error;

use crate::command::{RecordingState, ResettableCommandBuffer};
use crate::device::{Device, MemoryUsage};

/// Anything that can hand out a raw `VkBuffer`, so recording helpers can
/// take any buffer wrapper.
pub trait RawBuffer {
    fn raw_buffer(&self) -> vk::Buffer;
}

impl<T> RawBuffer for &T
where
    T: RawBuffer + ?Sized,
{
    fn raw_buffer(&self) -> vk::Buffer {
        (*self).raw_buffer()
    }
}

#[derive(Debug, Error)]
pub enum CreateBufferError {
    #[error("Vulkan error creating buffer: {0}")]
    CreateBuffer(vk::Result),

    #[error("GPU allocator error allocating memory: {0}")]
    AllocateMemory(AllocationError),

    #[error("Vulkan error binding buffer memory: {0}")]
    BindMemory(vk::Result),

    #[error("Buffers cannot be empty")]
    ZeroSize,

    #[error("Buffer of {record_count} records of {record_size} bytes is empty or too large")]
    InvalidLayout {
        record_size: vk::DeviceSize,
        record_count: u32,
    },
}

#[derive(Debug, Error)]
pub enum WriteBufferError {
    #[error(
        "Data size ({data_bytes} bytes) exceeds available space ({buffer_bytes} bytes)"
    )]
    DataTooLarge {
        data_bytes: usize,
        buffer_bytes: vk::DeviceSize,
    },

    #[error("Record {index} out of range for a buffer of {count} records")]
    RecordOutOfRange { index: u32, count: u32 },

    #[error("Vulkan error flushing mapped memory: {0}")]
    FlushMemory(vk::Result),

    #[error("Allocation is not host-mapped")]
    NotMapped,
}

#[derive(Debug, Error)]
pub enum ReadBufferError {
    #[error("Vulkan error invalidating mapped memory: {0}")]
    InvalidateMemory(vk::Result),

    #[error("Allocation is not host-mapped")]
    NotMapped,
}

#[derive(Debug, Error)]
pub enum UploadBufferError {
    #[error(
        "Copy region out of bounds: src(size={src_size}, offset={src_offset}), \
         dst(size={dst_size}, offset={dst_offset}), copy={copy_size}"
    )]
    RegionOutOfBounds {
        src_size: vk::DeviceSize,
        src_offset: vk::DeviceSize,
        dst_size: vk::DeviceSize,
        dst_offset: vk::DeviceSize,
        copy_size: vk::DeviceSize,
    },
}

/// Stride between records that must each start on a multiple of
/// `min_alignment` (a power of two, or zero for no requirement).
pub fn dynamic_alignment(
    record_size: vk::DeviceSize,
    min_alignment: vk::DeviceSize,
) -> vk::DeviceSize {
    if min_alignment == 0 {
        return record_size;
    }
    record_size.max(1).div_ceil(min_alignment) * min_alignment
}

fn check_buffer_size(size: vk::DeviceSize) -> Result<(), CreateBufferError> {
    if size == 0 {
        Err(CreateBufferError::ZeroSize)
    } else {
        Ok(())
    }
}

/// Makes transfer writes visible to later copies and to host reads after
/// the submission's fence is waited on.
pub fn transfer_to_host_barrier() -> vk::MemoryBarrier2<'static> {
    vk::MemoryBarrier2::default()
        .src_stage_mask(vk::PipelineStageFlags2::COPY)
        .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
        .dst_stage_mask(vk::PipelineStageFlags2::COPY | vk::PipelineStageFlags2::HOST)
        .dst_access_mask(vk::AccessFlags2::TRANSFER_READ | vk::AccessFlags2::HOST_READ)
}

/// Widens `[offset, offset + len)` to whole non-coherent atoms, clamped to
/// `limit`. Returns `(offset, size)`.
fn atom_aligned_range(
    offset: vk::DeviceSize,
    len: vk::DeviceSize,
    atom: vk::DeviceSize,
    limit: vk::DeviceSize,
) -> (vk::DeviceSize, vk::DeviceSize) {
    let atom = atom.max(1);
    let start = offset / atom * atom;
    let end = (offset + len).div_ceil(atom) * atom;
    (start, end.min(limit) - start)
}

struct AllocatedBuffer {
    parent: Arc<Device>,
    handle: vk::Buffer,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
}

impl std::fmt::Debug for AllocatedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatedBuffer")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl AllocatedBuffer {
    fn new(
        device: &Arc<Device>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        name: Option<&str>,
        memory_usage: MemoryUsage,
    ) -> Result<Self, CreateBufferError> {
        check_buffer_size(size)?;
        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        // SAFETY: create_info has no borrowed data.
        let handle = unsafe { device.create_raw_buffer(&create_info) }
            .map_err(CreateBufferError::CreateBuffer)?;
        // SAFETY: handle was just created from device.
        unsafe { device.name_or_warn(handle, name) };

        // SAFETY: handle is a live buffer from device.
        let reqs = unsafe { device.get_raw_buffer_memory_requirements(handle) };
        let allocation = device
            .allocate_memory(name.unwrap_or("buffer"), reqs, memory_usage, true)
            .map_err(|e| {
                // SAFETY: handle is unbound and unused.
                unsafe { device.destroy_raw_buffer(handle) };
                CreateBufferError::AllocateMemory(e)
            })?;

        // SAFETY: both the buffer and the allocation belong to device.
        let bind_result = unsafe {
            device.bind_raw_buffer_memory(
                handle,
                allocation.memory(),
                allocation.offset(),
            )
        };
        if let Err(e) = bind_result {
            if let Err(free_err) = device.free_memory(allocation) {
                tracing::error!("Failed to free GPU allocation: {free_err}");
            }
            // SAFETY: handle is owned by this scope and unused.
            unsafe { device.destroy_raw_buffer(handle) };
            return Err(CreateBufferError::BindMemory(e));
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            allocation: Some(allocation),
            size,
        })
    }

    fn allocation(&self) -> &Allocation {
        self.allocation
            .as_ref()
            .expect("allocation is only None during drop")
    }

    fn needs_explicit_sync(&self) -> bool {
        !self
            .allocation()
            .memory_properties()
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    /// Atom-aligned range inside the allocation covering `offset..offset+len`
    /// of the buffer.
    fn mapped_range(
        &self,
        offset: vk::DeviceSize,
        len: vk::DeviceSize,
    ) -> vk::MappedMemoryRange<'static> {
        let allocation = self.allocation();
        let atom = self.parent.non_coherent_atom_size();
        // Device::allocate_memory pads non-coherent allocations to atoms.
        debug_assert_eq!(allocation.offset() % atom, 0);
        let (start, size) =
            atom_aligned_range(offset, len, atom, allocation.size());
        vk::MappedMemoryRange::default()
            // SAFETY: the allocation lives as long as self.
            .memory(unsafe { allocation.memory() })
            .offset(allocation.offset() + start)
            .size(size)
    }

    /// Copies `bytes` to `offset` and flushes the written range if the
    /// memory is not coherent.
    fn write_bytes(
        &mut self,
        offset: vk::DeviceSize,
        bytes: &[u8],
    ) -> Result<(), WriteBufferError> {
        let available = self.size.saturating_sub(offset);
        if bytes.len() as vk::DeviceSize > available {
            return Err(WriteBufferError::DataTooLarge {
                data_bytes: bytes.len(),
                buffer_bytes: available,
            });
        }
        if bytes.is_empty() {
            return Ok(());
        }
        let mapped_ptr = self
            .allocation()
            .mapped_ptr()
            .ok_or(WriteBufferError::NotMapped)?;

        // SAFETY: the mapping covers the whole buffer and the write was
        // bounds-checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                mapped_ptr.as_ptr().cast::<u8>().add(offset as usize),
                bytes.len(),
            );
        }

        if self.needs_explicit_sync() {
            let range = self.mapped_range(offset, bytes.len() as vk::DeviceSize);
            // SAFETY: range lies inside this buffer's mapped allocation.
            unsafe {
                self.parent
                    .flush_raw_mapped_memory_ranges(std::slice::from_ref(&range))
            }
            .map_err(WriteBufferError::FlushMemory)?;
        }
        Ok(())
    }
}

impl Drop for AllocatedBuffer {
    fn drop(&mut self) {
        tracing::debug!("Dropping buffer {:?}", self.handle);
        // SAFETY: owners idle the device before dropping buffers.
        unsafe { self.parent.destroy_raw_buffer(self.handle) };

        if let Some(allocation) = self.allocation.take()
            && let Err(e) = self.parent.free_memory(allocation)
        {
            tracing::error!("Failed to free GPU allocation: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// HostVisibleBuffer
// ---------------------------------------------------------------------------

/// A CPU-writable staging buffer.
#[derive(Debug)]
pub struct HostVisibleBuffer {
    inner: AllocatedBuffer,
}

impl HostVisibleBuffer {
    pub fn new(
        device: &Arc<Device>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        name: Option<&str>,
    ) -> Result<Self, CreateBufferError> {
        Ok(Self {
            inner: AllocatedBuffer::new(
                device,
                size,
                usage,
                name,
                MemoryUsage::CpuToGpu,
            )?,
        })
    }

    pub fn write_pod<T: Pod>(&mut self, data: &[T]) -> Result<(), WriteBufferError> {
        self.inner.write_bytes(0, bytemuck::cast_slice(data))
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), WriteBufferError> {
        self.inner.write_bytes(0, bytes)
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.inner.size
    }
}

impl RawBuffer for HostVisibleBuffer {
    fn raw_buffer(&self) -> vk::Buffer {
        self.inner.handle
    }
}

// ---------------------------------------------------------------------------
// ReadbackBuffer
// ---------------------------------------------------------------------------

/// Host-readable destination for GPU copies.
#[derive(Debug)]
pub struct ReadbackBuffer {
    inner: AllocatedBuffer,
}

impl ReadbackBuffer {
    pub fn new(
        device: &Arc<Device>,
        size: vk::DeviceSize,
        name: Option<&str>,
    ) -> Result<Self, CreateBufferError> {
        Ok(Self {
            inner: AllocatedBuffer::new(
                device,
                size,
                vk::BufferUsageFlags::TRANSFER_DST,
                name,
                MemoryUsage::GpuToCpu,
            )?,
        })
    }

    /// Copies the buffer contents out. Call only after the copy into this
    /// buffer has completed.
    pub fn read_bytes(&self) -> Result<Vec<u8>, ReadBufferError> {
        let mapped_ptr = self
            .inner
            .allocation()
            .mapped_ptr()
            .ok_or(ReadBufferError::NotMapped)?;
        if self.inner.needs_explicit_sync() {
            let range = self.inner.mapped_range(0, self.inner.size);
            // SAFETY: range lies inside this buffer's mapped allocation.
            unsafe {
                self.inner
                    .parent
                    .invalidate_raw_mapped_memory_ranges(std::slice::from_ref(&range))
            }
            .map_err(ReadBufferError::InvalidateMemory)?;
        }
        let mut out = vec![0u8; self.inner.size as usize];
        // SAFETY: the mapping covers `size` bytes and out has that length.
        unsafe {
            std::ptr::copy_nonoverlapping(
                mapped_ptr.as_ptr().cast::<u8>(),
                out.as_mut_ptr(),
                out.len(),
            );
        }
        Ok(out)
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.inner.size
    }
}

impl RawBuffer for ReadbackBuffer {
    fn raw_buffer(&self) -> vk::Buffer {
        self.inner.handle
    }
}

// ---------------------------------------------------------------------------
// DeviceLocalBuffer
// ---------------------------------------------------------------------------

/// A GPU-only buffer. Fill it from a [`HostVisibleBuffer`] with
/// [`record_copy_from`](Self::record_copy_from).
#[derive(Debug)]
pub struct DeviceLocalBuffer {
    inner: AllocatedBuffer,
    usage: vk::BufferUsageFlags,
}

impl DeviceLocalBuffer {
    pub fn new(
        device: &Arc<Device>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        name: Option<&str>,
    ) -> Result<Self, CreateBufferError> {
        Ok(Self {
            inner: AllocatedBuffer::new(
                device,
                size,
                usage,
                name,
                MemoryUsage::GpuOnly,
            )?,
            usage,
        })
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.inner.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Records a copy of the whole of `src` to the start of this buffer.
    ///
    /// # Safety
    /// - `src` and `self` must outlive the GPU execution of the copy.
    /// - `src` needs `TRANSFER_SRC` usage and `self` `TRANSFER_DST`.
    pub unsafe fn record_copy_from(
        &mut self,
        command_buffer: &mut ResettableCommandBuffer,
        src: &HostVisibleBuffer,
    ) -> Result<(), UploadBufferError> {
        // SAFETY: forwarded to the caller.
        unsafe { self.record_copy_region_from(command_buffer, src, 0, 0, src.size()) }
    }

    /// # Safety
    /// Same as [`record_copy_from`](Self::record_copy_from).
    pub unsafe fn record_copy_region_from(
        &mut self,
        command_buffer: &mut ResettableCommandBuffer,
        src: &HostVisibleBuffer,
        src_offset: vk::DeviceSize,
        dst_offset: vk::DeviceSize,
        copy_size: vk::DeviceSize,
    ) -> Result<(), UploadBufferError> {
        debug_assert_eq!(command_buffer.state(), RecordingState::Recording);
        if src_offset.saturating_add(copy_size) > src.size()
            || dst_offset.saturating_add(copy_size) > self.size()
        {
            return Err(UploadBufferError::RegionOutOfBounds {
                src_size: src.size(),
                src_offset,
                dst_size: self.size(),
                dst_offset,
                copy_size,
            });
        }

        let region = vk::BufferCopy::default()
            .src_offset(src_offset)
            .dst_offset(dst_offset)
            .size(copy_size);
        // SAFETY: region was bounds-checked; lifetimes are the caller's.
        unsafe {
            command_buffer.copy_buffer(
                src.raw_buffer(),
                self.raw_buffer(),
                std::slice::from_ref(&region),
            )
        };
        Ok(())
    }
}

impl RawBuffer for DeviceLocalBuffer {
    fn raw_buffer(&self) -> vk::Buffer {
        self.inner.handle
    }
}

// ---------------------------------------------------------------------------
// MappedBuffer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappedBufferKind {
    Uniform,
    Storage,
}

impl MappedBufferKind {
    pub fn usage(self) -> vk::BufferUsageFlags {
        (match self {
            Self::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
            Self::Storage => vk::BufferUsageFlags::STORAGE_BUFFER,
        })
        // Readback copies out of any mapped buffer.
        | vk::BufferUsageFlags::TRANSFER_SRC
    }

    pub fn shader_read_access(self) -> vk::AccessFlags2 {
        match self {
            Self::Uniform => vk::AccessFlags2::UNIFORM_READ,
            Self::Storage => vk::AccessFlags2::SHADER_STORAGE_READ,
        }
    }

    fn min_offset_alignment(self, device: &Device) -> vk::DeviceSize {
        match self {
            Self::Uniform => device.min_uniform_buffer_offset_alignment(),
            // A storage buffer can also be bound as a uniform buffer in
            // some layouts, so honour both limits.
            Self::Storage => device
                .min_storage_buffer_offset_alignment()
                .max(device.min_uniform_buffer_offset_alignment()),
        }
    }
}

/// A persistently mapped uniform or storage buffer holding `record_count`
/// records, each starting at a multiple of [`stride`](Self::stride).
///
/// Bind it with a `*_DYNAMIC` descriptor and pick a record per draw with
/// [`dynamic_offset`](Self::dynamic_offset).
#[derive(Debug)]
pub struct MappedBuffer {
    inner: AllocatedBuffer,
    kind: MappedBufferKind,
    record_size: vk::DeviceSize,
    stride: vk::DeviceSize,
    record_count: u32,
}

impl MappedBuffer {
    pub fn new(
        device: &Arc<Device>,
        kind: MappedBufferKind,
        record_size: vk::DeviceSize,
        record_count: u32,
        name: Option<&str>,
    ) -> Result<Self, CreateBufferError> {
        let stride = dynamic_alignment(record_size, kind.min_offset_alignment(device));
        let size = stride.checked_mul(vk::DeviceSize::from(record_count));
        let size = match size {
            Some(size) if record_size > 0 && size > 0 => size,
            _ => {
                return Err(CreateBufferError::InvalidLayout {
                    record_size,
                    record_count,
                });
            }
        };
        tracing::debug!(
            "Mapped {kind:?} buffer: {record_count} records of {record_size} bytes, stride {stride}"
        );
        Ok(Self {
            inner: AllocatedBuffer::new(
                device,
                size,
                kind.usage(),
                name,
                MemoryUsage::CpuToGpu,
            )?,
            kind,
            record_size,
            stride,
            record_count,
        })
    }

    /// Writes one record and flushes it.
    pub fn write_record(
        &mut self,
        index: u32,
        bytes: &[u8],
    ) -> Result<(), WriteBufferError> {
        if index >= self.record_count {
            return Err(WriteBufferError::RecordOutOfRange {
                index,
                count: self.record_count,
            });
        }
        if bytes.len() as vk::DeviceSize > self.record_size {
            return Err(WriteBufferError::DataTooLarge {
                data_bytes: bytes.len(),
                buffer_bytes: self.record_size,
            });
        }
        let offset = vk::DeviceSize::from(index) * self.stride;
        self.inner.write_bytes(offset, bytes)
    }

    pub fn write_record_pod<T: Pod>(
        &mut self,
        index: u32,
        value: &T,
    ) -> Result<(), WriteBufferError> {
        self.write_record(index, bytemuck::bytes_of(value))
    }

    /// The barrier making host writes to record `index` (or every record)
    /// visible to shader reads. Must be recorded outside a rendering pass.
    pub fn host_write_barrier(&self, index: Option<u32>) -> vk::BufferMemoryBarrier2<'static> {
        let (offset, size) = match index {
            Some(i) => (vk::DeviceSize::from(i) * self.stride, self.stride),
            None => (0, vk::WHOLE_SIZE),
        };
        vk::BufferMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::HOST)
            .src_access_mask(vk::AccessFlags2::HOST_WRITE)
            .dst_stage_mask(
                vk::PipelineStageFlags2::VERTEX_SHADER
                    | vk::PipelineStageFlags2::FRAGMENT_SHADER
                    | vk::PipelineStageFlags2::COMPUTE_SHADER,
            )
            .dst_access_mask(self.kind.shader_read_access())
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(self.inner.handle)
            .offset(offset)
            .size(size)
    }

    /// Dynamic offset selecting record `index`.
    pub fn dynamic_offset(&self, index: u32) -> u32 {
        debug_assert!(index < self.record_count);
        // Offsets beyond u32 are rejected by the driver anyway.
        (vk::DeviceSize::from(index) * self.stride) as u32
    }

    pub fn kind(&self) -> MappedBufferKind {
        self.kind
    }

    pub fn record_size(&self) -> vk::DeviceSize {
        self.record_size
    }

    pub fn stride(&self) -> vk::DeviceSize {
        self.stride
    }

    pub fn record_count(&self) -> u32 {
        self.record_count
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.inner.size
    }
}

impl RawBuffer for MappedBuffer {
    fn raw_buffer(&self) -> vk::Buffer {
        self.inner.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_buffers_are_rejected() {
        assert!(matches!(check_buffer_size(0), Err(CreateBufferError::ZeroSize)));
        assert!(check_buffer_size(1).is_ok());
    }

    #[test]
    fn readback_barrier_reaches_the_host() {
        let barrier = transfer_to_host_barrier();
        assert_eq!(barrier.src_stage_mask, vk::PipelineStageFlags2::COPY);
        assert_eq!(barrier.src_access_mask, vk::AccessFlags2::TRANSFER_WRITE);
        assert!(barrier.dst_stage_mask.contains(vk::PipelineStageFlags2::HOST));
        assert!(barrier.dst_access_mask.contains(vk::AccessFlags2::HOST_READ));
    }

    #[test]
    fn stride_rounds_up_to_alignment() {
        assert_eq!(dynamic_alignment(64, 256), 256);
        assert_eq!(dynamic_alignment(256, 256), 256);
        assert_eq!(dynamic_alignment(257, 256), 512);
        assert_eq!(dynamic_alignment(12, 16), 16);
    }

    #[test]
    fn stride_without_requirement_is_record_size() {
        assert_eq!(dynamic_alignment(48, 0), 48);
        assert_eq!(dynamic_alignment(48, 1), 48);
    }

    #[test]
    fn records_never_overlap() {
        let stride = dynamic_alignment(200, 64);
        for i in 0..8u64 {
            let start = i * stride;
            assert_eq!(start % 64, 0);
            assert!(start + 200 <= (i + 1) * stride);
        }
    }

    #[test]
    fn flush_range_widens_to_atoms() {
        assert_eq!(atom_aligned_range(256, 64, 64, 1024), (256, 64));
        assert_eq!(atom_aligned_range(100, 10, 64, 1024), (64, 64));
        assert_eq!(atom_aligned_range(120, 20, 64, 1024), (64, 128));
    }

    #[test]
    fn flush_range_is_clamped_to_allocation() {
        assert_eq!(atom_aligned_range(960, 40, 128, 1000), (896, 104));
    }
}
