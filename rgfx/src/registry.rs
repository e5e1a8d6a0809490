//! Owner of every pipeline, buffer, texture and descriptor set a caller
//! creates.
//!
//! Callers get `slotmap` keys back. A key stops resolving once its
//! resource is destroyed, so stale handles surface as
//! [`RegistryError::InvalidHandle`] instead of dangling Vulkan objects.
//! Nothing is destroyed implicitly: resources live until the matching
//! `destroy_*` call or until the registry drops.

use std::sync::Arc;

use ash::vk;
use slotmap::{SlotMap, new_key_type};
use thiserror::Error;

use crate::buffer::{
    CreateBufferError, DeviceLocalBuffer, MappedBuffer, MappedBufferKind, RawBuffer,
    WriteBufferError,
};
use crate::descriptor::{DescriptorSet, DescriptorSetLayout};
use crate::descriptor_allocator::{
    AllocateDescriptorSetError, DevicePoolBackend, GrowableDescriptorAllocator, PoolCapacity,
    SetRequest,
};
use crate::device::Device;
use crate::image::{CreateTextureError, Texture, TextureDesc, transition_barrier};
use crate::pipeline::{CreatePipelineError, Pipeline, PipelineDesc};
use crate::shader::ShaderSource;
use crate::upload::{CreateUploadContextError, UploadContext, UploadError};

new_key_type! {
    pub struct PipelineHandle;
    pub struct BufferHandle;
    pub struct TextureHandle;
    pub struct DescriptorSetHandle;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Pipeline,
    Buffer,
    Texture,
    DescriptorSet,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{0:?} handle does not refer to a live resource")]
    InvalidHandle(ResourceKind),
    #[error(transparent)]
    Pipeline(#[from] CreatePipelineError),
    #[error(transparent)]
    Buffer(#[from] CreateBufferError),
    #[error(transparent)]
    Texture(#[from] CreateTextureError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Write(#[from] WriteBufferError),
    #[error(transparent)]
    Descriptor(#[from] AllocateDescriptorSetError),
    #[error("Pipeline has no descriptor set {0}")]
    NoSuchSet(u32),
    #[error("Descriptor set has no binding {0}")]
    NoSuchBinding(u32),
    #[error("Binding {binding} expects {expected:?}, which this resource cannot back")]
    BindingTypeMismatch {
        binding: u32,
        expected: vk::DescriptorType,
    },
    #[error("Buffer is not host mapped")]
    NotMapped,
    #[error("Waiting for device idle failed: {0}")]
    WaitIdle(vk::Result),
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum BufferResource {
    DeviceLocal(DeviceLocalBuffer),
    Mapped(MappedBuffer),
}

impl BufferResource {
    pub fn size(&self) -> vk::DeviceSize {
        match self {
            Self::DeviceLocal(b) => b.size(),
            Self::Mapped(b) => b.size(),
        }
    }

    pub fn as_mapped(&self) -> Option<&MappedBuffer> {
        match self {
            Self::Mapped(b) => Some(b),
            Self::DeviceLocal(_) => None,
        }
    }

    pub fn as_mapped_mut(&mut self) -> Option<&mut MappedBuffer> {
        match self {
            Self::Mapped(b) => Some(b),
            Self::DeviceLocal(_) => None,
        }
    }

    /// Offset and range a descriptor of `descriptor_type` should cover.
    /// Dynamic descriptors see one record; the rest see the whole buffer.
    fn descriptor_range(
        &self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
    ) -> Result<vk::DeviceSize, RegistryError> {
        use vk::DescriptorType as D;
        let mismatch = RegistryError::BindingTypeMismatch {
            binding,
            expected: descriptor_type,
        };
        match (self, descriptor_type) {
            (Self::Mapped(b), D::UNIFORM_BUFFER_DYNAMIC)
                if b.kind() == MappedBufferKind::Uniform =>
            {
                Ok(b.record_size())
            }
            (Self::Mapped(b), D::STORAGE_BUFFER_DYNAMIC)
                if b.kind() == MappedBufferKind::Storage =>
            {
                Ok(b.record_size())
            }
            (Self::Mapped(b), D::UNIFORM_BUFFER) if b.kind() == MappedBufferKind::Uniform => {
                Ok(vk::WHOLE_SIZE)
            }
            (Self::Mapped(b), D::STORAGE_BUFFER) if b.kind() == MappedBufferKind::Storage => {
                Ok(vk::WHOLE_SIZE)
            }
            (Self::DeviceLocal(b), D::UNIFORM_BUFFER)
                if b.usage().contains(vk::BufferUsageFlags::UNIFORM_BUFFER) =>
            {
                Ok(vk::WHOLE_SIZE)
            }
            (Self::DeviceLocal(b), D::STORAGE_BUFFER)
                if b.usage().contains(vk::BufferUsageFlags::STORAGE_BUFFER) =>
            {
                Ok(vk::WHOLE_SIZE)
            }
            _ => Err(mismatch),
        }
    }
}

impl RawBuffer for BufferResource {
    fn raw_buffer(&self) -> vk::Buffer {
        match self {
            Self::DeviceLocal(b) => b.raw_buffer(),
            Self::Mapped(b) => b.raw_buffer(),
        }
    }
}

/// A texture and the layout it rests in between commands.
#[derive(Debug)]
pub struct TextureEntry {
    pub texture: Texture,
    pub layout: vk::ImageLayout,
}

#[derive(Debug)]
pub struct DescriptorSetEntry {
    pub set: DescriptorSet,
    pub pipeline: PipelineHandle,
}

// ---------------------------------------------------------------------------
// ResourceRegistry
// ---------------------------------------------------------------------------

pub struct ResourceRegistry {
    // Field order: sets go before the pools backing them, and everything
    // before the upload context and device.
    sets: SlotMap<DescriptorSetHandle, DescriptorSetEntry>,
    descriptors: GrowableDescriptorAllocator<DevicePoolBackend>,
    pipelines: SlotMap<PipelineHandle, Pipeline>,
    buffers: SlotMap<BufferHandle, BufferResource>,
    textures: SlotMap<TextureHandle, TextureEntry>,
    upload: UploadContext,
    device: Arc<Device>,
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("pipelines", &self.pipelines.len())
            .field("buffers", &self.buffers.len())
            .field("textures", &self.textures.len())
            .field("sets", &self.sets.len())
            .field("descriptors", &self.descriptors)
            .finish_non_exhaustive()
    }
}

impl ResourceRegistry {
    pub fn new(
        device: &Arc<Device>,
        descriptor_capacity: PoolCapacity,
    ) -> Result<Self, CreateUploadContextError> {
        Ok(Self {
            sets: SlotMap::with_key(),
            descriptors: GrowableDescriptorAllocator::new(
                DevicePoolBackend::new(device),
                descriptor_capacity,
            ),
            pipelines: SlotMap::with_key(),
            buffers: SlotMap::with_key(),
            textures: SlotMap::with_key(),
            upload: UploadContext::new(device)?,
            device: Arc::clone(device),
        })
    }

    fn wait_idle(&self) -> Result<(), RegistryError> {
        self.device.wait_idle().map_err(RegistryError::WaitIdle)
    }

    // -- pipelines ----------------------------------------------------------

    pub fn create_pipeline(
        &mut self,
        desc: &PipelineDesc,
        shaders: &[ShaderSource],
        name: Option<&str>,
    ) -> Result<PipelineHandle, RegistryError> {
        let pipeline = Pipeline::new(&self.device, desc, shaders, name)?;
        Ok(self.pipelines.insert(pipeline))
    }

    /// Waits for the device to idle, then destroys the pipeline.
    /// Descriptor sets allocated for it stay valid until freed.
    pub fn destroy_pipeline(&mut self, handle: PipelineHandle) -> Result<(), RegistryError> {
        if !self.pipelines.contains_key(handle) {
            return Err(RegistryError::InvalidHandle(ResourceKind::Pipeline));
        }
        self.wait_idle()?;
        self.pipelines.remove(handle);
        Ok(())
    }

    pub fn pipeline(&self, handle: PipelineHandle) -> Result<&Pipeline, RegistryError> {
        self.pipelines
            .get(handle)
            .ok_or(RegistryError::InvalidHandle(ResourceKind::Pipeline))
    }

    // -- buffers ------------------------------------------------------------

    /// A device-local buffer filled with `bytes` through a staging copy.
    pub fn create_buffer(
        &mut self,
        bytes: &[u8],
        usage: vk::BufferUsageFlags,
        name: Option<&str>,
    ) -> Result<BufferHandle, RegistryError> {
        let buffer = self.upload.create_device_local_buffer(
            bytes,
            usage | vk::BufferUsageFlags::TRANSFER_SRC,
            name,
        )?;
        Ok(self.buffers.insert(BufferResource::DeviceLocal(buffer)))
    }

    /// A persistently mapped buffer of `record_count` records of
    /// `record_size` bytes, each aligned for dynamic offsets.
    pub fn create_mapped_buffer(
        &mut self,
        kind: MappedBufferKind,
        record_size: vk::DeviceSize,
        record_count: u32,
        name: Option<&str>,
    ) -> Result<BufferHandle, RegistryError> {
        let buffer = MappedBuffer::new(&self.device, kind, record_size, record_count, name)?;
        Ok(self.buffers.insert(BufferResource::Mapped(buffer)))
    }

    pub fn create_uniform_buffer(
        &mut self,
        record_size: vk::DeviceSize,
        record_count: u32,
        name: Option<&str>,
    ) -> Result<BufferHandle, RegistryError> {
        self.create_mapped_buffer(MappedBufferKind::Uniform, record_size, record_count, name)
    }

    pub fn create_storage_buffer(
        &mut self,
        record_size: vk::DeviceSize,
        record_count: u32,
        name: Option<&str>,
    ) -> Result<BufferHandle, RegistryError> {
        self.create_mapped_buffer(MappedBufferKind::Storage, record_size, record_count, name)
    }

    /// Writes and flushes one record of a mapped buffer. The GPU only sees
    /// it after a host-write barrier; see
    /// [`RecordContext::update_uniform`](crate::RecordContext::update_uniform).
    pub fn write_record(
        &mut self,
        handle: BufferHandle,
        index: u32,
        bytes: &[u8],
    ) -> Result<(), RegistryError> {
        let buffer = self
            .buffers
            .get_mut(handle)
            .ok_or(RegistryError::InvalidHandle(ResourceKind::Buffer))?
            .as_mapped_mut()
            .ok_or(RegistryError::NotMapped)?;
        buffer.write_record(index, bytes)?;
        Ok(())
    }

    /// Copies the whole buffer back to the host. Blocks on the GPU.
    pub fn read_buffer(&mut self, handle: BufferHandle) -> Result<Vec<u8>, RegistryError> {
        let buffer = self
            .buffers
            .get(handle)
            .ok_or(RegistryError::InvalidHandle(ResourceKind::Buffer))?;
        Ok(self.upload.read_buffer(buffer, buffer.size())?)
    }

    pub fn destroy_buffer(&mut self, handle: BufferHandle) -> Result<(), RegistryError> {
        if !self.buffers.contains_key(handle) {
            return Err(RegistryError::InvalidHandle(ResourceKind::Buffer));
        }
        self.wait_idle()?;
        self.buffers.remove(handle);
        Ok(())
    }

    pub fn buffer(&self, handle: BufferHandle) -> Result<&BufferResource, RegistryError> {
        self.buffers
            .get(handle)
            .ok_or(RegistryError::InvalidHandle(ResourceKind::Buffer))
    }

    // -- textures -----------------------------------------------------------

    /// Creates a texture and leaves it in `SHADER_READ_ONLY_OPTIMAL`,
    /// filled from `pixels` when given. Pixels are tightly packed, layer
    /// after layer.
    pub fn create_texture(
        &mut self,
        desc: &TextureDesc,
        pixels: Option<&[u8]>,
        name: Option<&str>,
    ) -> Result<TextureHandle, RegistryError> {
        let texture = Texture::new(&self.device, desc, name)?;
        match pixels {
            Some(pixels) => self.upload.upload_texture(&texture, pixels)?,
            None => {
                let image = texture.image();
                self.upload.submit_blocking(|cmd| {
                    // SAFETY: the image is new and only this submission
                    // touches it.
                    unsafe {
                        cmd.image_barrier(transition_barrier(
                            image.raw_image(),
                            image.subresource_range(),
                            vk::ImageLayout::UNDEFINED,
                            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        ))
                    };
                    Ok(())
                })?;
            }
        }
        Ok(self.textures.insert(TextureEntry {
            texture,
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }))
    }

    pub fn destroy_texture(&mut self, handle: TextureHandle) -> Result<(), RegistryError> {
        if !self.textures.contains_key(handle) {
            return Err(RegistryError::InvalidHandle(ResourceKind::Texture));
        }
        self.wait_idle()?;
        self.textures.remove(handle);
        Ok(())
    }

    pub fn texture(&self, handle: TextureHandle) -> Result<&TextureEntry, RegistryError> {
        self.textures
            .get(handle)
            .ok_or(RegistryError::InvalidHandle(ResourceKind::Texture))
    }

    pub fn texture_mut(
        &mut self,
        handle: TextureHandle,
    ) -> Result<&mut TextureEntry, RegistryError> {
        self.textures
            .get_mut(handle)
            .ok_or(RegistryError::InvalidHandle(ResourceKind::Texture))
    }

    // -- descriptor sets ----------------------------------------------------

    fn set_layout(
        &self,
        pipeline: PipelineHandle,
        set_index: u32,
    ) -> Result<&DescriptorSetLayout, RegistryError> {
        self.pipeline(pipeline)?
            .layout()
            .set_layout(set_index)
            .ok_or(RegistryError::NoSuchSet(set_index))
    }

    /// Allocates set `set_index` of `pipeline`'s layout from the growable
    /// pools. `variable_count` sizes a variable-count binding.
    pub fn allocate_descriptor_set(
        &mut self,
        pipeline: PipelineHandle,
        set_index: u32,
        variable_count: Option<u32>,
    ) -> Result<DescriptorSetHandle, RegistryError> {
        let layout = self.set_layout(pipeline, set_index)?;
        let request = SetRequest {
            layout: layout.raw_descriptor_set_layout(),
            variable_count: layout.variable_count_binding().and(variable_count),
        };
        let dynamic = layout.dynamic_offset_count();
        let allocation = self.descriptors.allocate(&request)?;
        let set = DescriptorSet::new(allocation.set, allocation.lease, set_index, dynamic);
        Ok(self.sets.insert(DescriptorSetEntry { set, pipeline }))
    }

    fn set_binding_type(
        &self,
        handle: DescriptorSetHandle,
        binding: u32,
    ) -> Result<vk::DescriptorType, RegistryError> {
        let entry = self
            .sets
            .get(handle)
            .ok_or(RegistryError::InvalidHandle(ResourceKind::DescriptorSet))?;
        let layout = self.set_layout(entry.pipeline, entry.set.set_index())?;
        layout
            .binding(binding)
            .map(|b| b.descriptor_type)
            .ok_or(RegistryError::NoSuchBinding(binding))
    }

    /// Queues a write of `buffer` into `binding`. Dynamic bindings cover
    /// one record; pick the record with a dynamic offset when binding.
    pub fn write_buffer_descriptor(
        &mut self,
        set: DescriptorSetHandle,
        binding: u32,
        buffer: BufferHandle,
    ) -> Result<(), RegistryError> {
        let descriptor_type = self.set_binding_type(set, binding)?;
        let resource = self.buffer(buffer)?;
        let range = resource.descriptor_range(binding, descriptor_type)?;
        let raw = resource.raw_buffer();
        let entry = self
            .sets
            .get_mut(set)
            .ok_or(RegistryError::InvalidHandle(ResourceKind::DescriptorSet))?;
        entry.set.pending().buffer(binding, descriptor_type, raw, 0, range);
        Ok(())
    }

    /// Queues a write of `texture` into element `array_element` of
    /// `binding`.
    pub fn write_texture_descriptor(
        &mut self,
        set: DescriptorSetHandle,
        binding: u32,
        array_element: u32,
        texture: TextureHandle,
    ) -> Result<(), RegistryError> {
        let descriptor_type = self.set_binding_type(set, binding)?;
        if descriptor_type != vk::DescriptorType::COMBINED_IMAGE_SAMPLER {
            return Err(RegistryError::BindingTypeMismatch {
                binding,
                expected: descriptor_type,
            });
        }
        let texture = &self.texture(texture)?.texture;
        let (view, sampler) = (texture.raw_image_view(), texture.raw_sampler());
        let entry = self
            .sets
            .get_mut(set)
            .ok_or(RegistryError::InvalidHandle(ResourceKind::DescriptorSet))?;
        entry.set.pending().image(
            binding,
            array_element,
            descriptor_type,
            view,
            sampler,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        Ok(())
    }

    /// Sends every queued write of `set` to the driver in one call.
    ///
    /// Unless the written bindings are update-after-bind, the set must not
    /// be in use by a frame still in flight.
    pub fn flush_descriptor_set(&mut self, set: DescriptorSetHandle) -> Result<(), RegistryError> {
        let entry = self
            .sets
            .get_mut(set)
            .ok_or(RegistryError::InvalidHandle(ResourceKind::DescriptorSet))?;
        debug_assert!(
            self.descriptors.is_live(entry.set.lease()),
            "flushing a descriptor set whose pool was cleared"
        );
        // SAFETY: every written buffer, view and sampler is owned by this
        // registry; the in-flight rule is the documented caller contract.
        unsafe { entry.set.flush(&self.device) };
        Ok(())
    }

    /// Forgets `set`. Its storage returns to the pool on the next
    /// [`clear_descriptor_pools`](Self::clear_descriptor_pools).
    pub fn free_descriptor_set(&mut self, set: DescriptorSetHandle) -> Result<(), RegistryError> {
        self.sets
            .remove(set)
            .map(|_| ())
            .ok_or(RegistryError::InvalidHandle(ResourceKind::DescriptorSet))
    }

    pub fn descriptor_set(
        &self,
        set: DescriptorSetHandle,
    ) -> Result<&DescriptorSetEntry, RegistryError> {
        self.sets
            .get(set)
            .ok_or(RegistryError::InvalidHandle(ResourceKind::DescriptorSet))
    }

    /// Whether `set` still points at live pool storage.
    pub fn is_descriptor_set_live(&self, set: &DescriptorSet) -> bool {
        self.descriptors.is_live(set.lease())
    }

    /// Waits for the device to idle, then resets every descriptor pool.
    ///
    /// Every set allocated so far is invalidated. Their handles keep
    /// resolving until freed, but binding or flushing one is a caller bug
    /// caught only by debug assertions.
    pub fn clear_descriptor_pools(&mut self) -> Result<(), RegistryError> {
        self.wait_idle()?;
        self.descriptors.clear_pools()?;
        Ok(())
    }

    pub fn descriptor_allocator(&self) -> &GrowableDescriptorAllocator<DevicePoolBackend> {
        &self.descriptors
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl Drop for ResourceRegistry {
    fn drop(&mut self) {
        tracing::debug!(
            "Dropping resource registry ({} pipelines, {} buffers, {} textures)",
            self.pipelines.len(),
            self.buffers.len(),
            self.textures.len()
        );
        if let Err(e) = self.device.wait_idle() {
            tracing::error!("Failed to idle device before dropping resources: {e}");
        }
    }
}
