//! The backend's public face: one [`Renderer`] per window.

use std::sync::Arc;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::buffer::MappedBufferKind;
use crate::config::RendererConfig;
use crate::device::{CreateDeviceError, Device};
use crate::frame::{FrameOutcome, FramePacer};
use crate::image::TextureDesc;
use crate::instance::{Instance, InstanceCreationError};
use crate::pipeline::PipelineDesc;
use crate::present::{CreatePresentTargetError, FrameError, PresentTarget};
use crate::record::{FrameRecorder, FrameTargets, RecordContext};
use crate::registry::{
    BufferHandle, DescriptorSetHandle, PipelineHandle, RegistryError, ResourceRegistry,
    TextureHandle,
};
use crate::shader::ShaderSource;
use crate::surface::{CreateSurfaceError, Surface};
use crate::swapchain::Swapchain;
use crate::upload::CreateUploadContextError;

#[derive(Debug, Error)]
pub enum InitError {
    #[error("Instance creation failed: {0}")]
    Instance(#[from] InstanceCreationError),
    #[error("Surface creation failed: {0}")]
    Surface(#[from] CreateSurfaceError),
    #[error("Device creation failed: {0}")]
    Device(#[from] CreateDeviceError),
    #[error("Swapchain setup failed: {0}")]
    PresentTarget(#[from] CreatePresentTargetError),
    #[error("Upload context creation failed: {0}")]
    Upload(#[from] CreateUploadContextError),
}

pub struct Renderer<T: HasDisplayHandle + HasWindowHandle> {
    // Field order is drop order: everything that can reference GPU work
    // goes before the device, the device before the surface.
    registry: ResourceRegistry,
    target: PresentTarget<T>,
    pacer: FramePacer,
    device: Arc<Device>,
    surface: Arc<Surface<T>>,
    instance: Arc<Instance>,
}

impl<T: HasDisplayHandle + HasWindowHandle> std::fmt::Debug for Renderer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("target", &self.target)
            .field("pacer", &self.pacer)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

impl<T: HasDisplayHandle + HasWindowHandle> Renderer<T> {
    /// Brings up instance, surface, device, swapchain, frame slots and the
    /// resource registry for `window`.
    pub fn init(config: &RendererConfig, window: Arc<T>) -> Result<Self, InitError> {
        let _span = tracing::info_span!("renderer_init", app = %config.app_name).entered();

        // SAFETY: loading Vulkan runs the installed loader's initialisation
        // code; there is nothing more we can check here.
        let instance = Arc::new(unsafe {
            Instance::new(&config.app_name, config.validation, window.as_ref())
        }?);
        // SAFETY: the surface is only dropped after `target`, whose drop
        // waits for the device to idle.
        let surface = Arc::new(unsafe { Surface::new(&instance, window) }?);
        let device = Arc::new(Device::create(&instance, &surface, &config.device)?);
        let target = PresentTarget::new(&device, &surface, config.extent, config.frames_in_flight)?;
        let registry = ResourceRegistry::new(&device, config.descriptor_pool.clone())?;
        let pacer = FramePacer::new(config.frames_in_flight);

        tracing::info!(
            "Renderer ready: {} frames in flight, swapchain {:?}",
            pacer.frames_in_flight(),
            target.swapchain().extent()
        );
        Ok(Self {
            registry,
            target,
            pacer,
            device,
            surface,
            instance,
        })
    }

    /// Waits for the GPU to finish and releases everything in reverse
    /// creation order. Dropping the renderer does the same but cannot
    /// report a failed wait.
    pub fn shutdown(self) -> Result<(), vk::Result> {
        let _span = tracing::debug_span!("renderer_shutdown").entered();
        self.device.wait_idle()
    }

    /// Runs one frame, handing `recorder` a context whose swapchain image is
    /// already in `COLOR_ATTACHMENT_OPTIMAL`.
    pub fn draw_frame<R: FrameRecorder + ?Sized>(
        &mut self,
        recorder: &mut R,
    ) -> Result<FrameOutcome, FrameError> {
        let Self {
            registry,
            target,
            pacer,
            ..
        } = self;
        pacer.draw_frame(target, |target, info| {
            let (cmd, swapchain) = target.recording_parts(info.slot);
            let targets = FrameTargets::from_swapchain(swapchain, info.image_index);
            let mut ctx = RecordContext::new(cmd, registry, targets, *info);
            let recorded = recorder.record(&mut ctx);
            ctx.finish();
            recorded.map_err(FrameError::from)
        })
    }

    /// Records the new framebuffer size. The swapchain is rebuilt at the
    /// start of the next frame; `0×0` pauses presentation.
    pub fn on_framebuffer_resize(&mut self, width: u32, height: u32) {
        let extent = vk::Extent2D { width, height };
        tracing::debug!("Framebuffer resized to {extent:?}");
        self.target.swapchain_mut().set_desired_extent(extent);
        self.pacer.request_resize();
    }

    /// Called with the new extent after every successful swapchain rebuild.
    pub fn set_resize_hook(&mut self, hook: impl FnMut(vk::Extent2D) + 'static) {
        self.target.swapchain_mut().set_resize_hook(hook);
    }

    pub fn swapchain(&self) -> &Swapchain<T> {
        self.target.swapchain()
    }

    pub fn frames_in_flight(&self) -> usize {
        self.pacer.frames_in_flight()
    }

    pub fn frame_number(&self) -> u64 {
        self.pacer.frame_number()
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn surface(&self) -> &Arc<Surface<T>> {
        &self.surface
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ResourceRegistry {
        &mut self.registry
    }

    // -----------------------------------------------------------------------
    // Resources
    // -----------------------------------------------------------------------

    pub fn create_pipeline(
        &mut self,
        desc: &PipelineDesc,
        shaders: &[ShaderSource],
        name: Option<&str>,
    ) -> Result<PipelineHandle, RegistryError> {
        self.registry.create_pipeline(desc, shaders, name)
    }

    pub fn destroy_pipeline(&mut self, pipeline: PipelineHandle) -> Result<(), RegistryError> {
        self.registry.destroy_pipeline(pipeline)
    }

    pub fn create_vertex_buffer(
        &mut self,
        bytes: &[u8],
        name: Option<&str>,
    ) -> Result<BufferHandle, RegistryError> {
        self.registry
            .create_buffer(bytes, vk::BufferUsageFlags::VERTEX_BUFFER, name)
    }

    pub fn create_index_buffer(
        &mut self,
        bytes: &[u8],
        name: Option<&str>,
    ) -> Result<BufferHandle, RegistryError> {
        self.registry
            .create_buffer(bytes, vk::BufferUsageFlags::INDEX_BUFFER, name)
    }

    /// A mapped buffer of `record_count` uniform records; bind one record
    /// per draw with a dynamic offset.
    pub fn create_uniform_buffer(
        &mut self,
        record_size: vk::DeviceSize,
        record_count: u32,
        name: Option<&str>,
    ) -> Result<BufferHandle, RegistryError> {
        self.registry
            .create_mapped_buffer(MappedBufferKind::Uniform, record_size, record_count, name)
    }

    pub fn create_storage_buffer(
        &mut self,
        record_size: vk::DeviceSize,
        record_count: u32,
        name: Option<&str>,
    ) -> Result<BufferHandle, RegistryError> {
        self.registry
            .create_mapped_buffer(MappedBufferKind::Storage, record_size, record_count, name)
    }

    /// Copies a buffer back to the host. Blocks until every submitted
    /// frame, and the copy itself, has finished.
    pub fn read_buffer(&mut self, buffer: BufferHandle) -> Result<Vec<u8>, RegistryError> {
        self.device.wait_idle().map_err(RegistryError::WaitIdle)?;
        self.registry.read_buffer(buffer)
    }

    pub fn destroy_buffer(&mut self, buffer: BufferHandle) -> Result<(), RegistryError> {
        self.registry.destroy_buffer(buffer)
    }

    pub fn create_texture(
        &mut self,
        desc: &TextureDesc,
        pixels: Option<&[u8]>,
        name: Option<&str>,
    ) -> Result<TextureHandle, RegistryError> {
        self.registry.create_texture(desc, pixels, name)
    }

    pub fn create_texture_2d(
        &mut self,
        width: u32,
        height: u32,
        format: vk::Format,
        pixels: Option<&[u8]>,
        name: Option<&str>,
    ) -> Result<TextureHandle, RegistryError> {
        self.create_texture(&TextureDesc::new_2d(width, height, format), pixels, name)
    }

    pub fn create_texture_3d(
        &mut self,
        extent: vk::Extent3D,
        format: vk::Format,
        pixels: Option<&[u8]>,
        name: Option<&str>,
    ) -> Result<TextureHandle, RegistryError> {
        let desc = TextureDesc::new_3d(extent.width, extent.height, extent.depth, format);
        self.create_texture(&desc, pixels, name)
    }

    /// `pixels` holds the six faces in +X, -X, +Y, -Y, +Z, -Z order.
    pub fn create_texture_cube(
        &mut self,
        size: u32,
        format: vk::Format,
        pixels: Option<&[u8]>,
        name: Option<&str>,
    ) -> Result<TextureHandle, RegistryError> {
        self.create_texture(&TextureDesc::new_cube(size, format), pixels, name)
    }

    pub fn destroy_texture(&mut self, texture: TextureHandle) -> Result<(), RegistryError> {
        self.registry.destroy_texture(texture)
    }

    pub fn allocate_descriptor_set(
        &mut self,
        pipeline: PipelineHandle,
        set_index: u32,
        variable_count: Option<u32>,
    ) -> Result<DescriptorSetHandle, RegistryError> {
        self.registry
            .allocate_descriptor_set(pipeline, set_index, variable_count)
    }

    pub fn write_buffer_descriptor(
        &mut self,
        set: DescriptorSetHandle,
        binding: u32,
        buffer: BufferHandle,
    ) -> Result<(), RegistryError> {
        self.registry.write_buffer_descriptor(set, binding, buffer)
    }

    pub fn write_texture_descriptor(
        &mut self,
        set: DescriptorSetHandle,
        binding: u32,
        array_element: u32,
        texture: TextureHandle,
    ) -> Result<(), RegistryError> {
        self.registry
            .write_texture_descriptor(set, binding, array_element, texture)
    }

    pub fn flush_descriptor_set(&mut self, set: DescriptorSetHandle) -> Result<(), RegistryError> {
        self.registry.flush_descriptor_set(set)
    }

    pub fn free_descriptor_set(&mut self, set: DescriptorSetHandle) -> Result<(), RegistryError> {
        self.registry.free_descriptor_set(set)
    }

    pub fn clear_descriptor_pools(&mut self) -> Result<(), RegistryError> {
        self.registry.clear_descriptor_pools()
    }
}
