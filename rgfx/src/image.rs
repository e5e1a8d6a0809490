//! GPU images, views and textures.
//!
//! [`DeviceLocalImage`] owns a `GpuOnly` image of any [`TextureKind`].
//! [`AttachmentImage`] pairs one with a view for use as a render target,
//! which is how the swapchain's depth companions are built. [`Texture`]
//! adds a sampler for shader reads.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::{AllocationError, vulkan::Allocation};
use thiserror::Error;

use crate::buffer::{HostVisibleBuffer, RawBuffer};
use crate::command::{RecordingState, ResettableCommandBuffer};
use crate::device::{Device, MemoryUsage};
use crate::format;
use crate::sampler::{CreateSamplerError, Sampler, SamplerDesc};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreateImageError {
    #[error("Vulkan error creating image: {0}")]
    CreateImage(vk::Result),

    #[error("GPU allocator error allocating memory: {0}")]
    AllocateMemory(AllocationError),

    #[error("Vulkan error binding image memory: {0}")]
    BindMemory(vk::Result),

    #[error("Vulkan error creating image view: {0}")]
    CreateView(vk::Result),

    #[error("Invalid {kind:?} extent {extent:?}")]
    InvalidExtent {
        kind: TextureKind,
        extent: vk::Extent3D,
    },
}

#[derive(Debug, Error)]
pub enum CreateTextureError {
    #[error(transparent)]
    Image(#[from] CreateImageError),

    #[error(transparent)]
    Sampler(#[from] CreateSamplerError),
}

#[derive(Debug, Error)]
pub enum UploadImageError {
    #[error("Staging buffer holds {src_bytes} bytes, image needs {needed_bytes}")]
    SizeMismatch {
        src_bytes: vk::DeviceSize,
        needed_bytes: vk::DeviceSize,
    },

    #[error("Uploads are not supported for format {0:?}")]
    UnsupportedFormat(vk::Format),
}

// ---------------------------------------------------------------------------
// Layout transitions
// ---------------------------------------------------------------------------

/// Stage and access scope of the work that uses an image in `layout`.
pub fn layout_scope(layout: vk::ImageLayout) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
    use vk::AccessFlags2 as A;
    use vk::ImageLayout as L;
    use vk::PipelineStageFlags2 as S;
    match layout {
        L::UNDEFINED => (S::TOP_OF_PIPE, A::NONE),
        L::TRANSFER_DST_OPTIMAL => (S::COPY, A::TRANSFER_WRITE),
        L::TRANSFER_SRC_OPTIMAL => (S::COPY, A::TRANSFER_READ),
        L::SHADER_READ_ONLY_OPTIMAL => (
            S::VERTEX_SHADER | S::FRAGMENT_SHADER | S::COMPUTE_SHADER,
            A::SHADER_SAMPLED_READ,
        ),
        L::COLOR_ATTACHMENT_OPTIMAL => (
            S::COLOR_ATTACHMENT_OUTPUT,
            A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
        ),
        L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        | L::DEPTH_ATTACHMENT_OPTIMAL
        | L::STENCIL_ATTACHMENT_OPTIMAL => (
            S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS,
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        L::PRESENT_SRC_KHR => (S::BOTTOM_OF_PIPE, A::NONE),
        _ => (S::ALL_COMMANDS, A::MEMORY_READ | A::MEMORY_WRITE),
    }
}

/// A barrier moving `range` of `image` from `old` to `new`, scoped by
/// [`layout_scope`] on both sides.
pub fn transition_barrier(
    image: vk::Image,
    range: vk::ImageSubresourceRange,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> vk::ImageMemoryBarrier2<'static> {
    let (src_stage, src_access) = layout_scope(old);
    let (dst_stage, dst_access) = layout_scope(new);
    vk::ImageMemoryBarrier2::default()
        .src_stage_mask(src_stage)
        .src_access_mask(src_access)
        .dst_stage_mask(dst_stage)
        .dst_access_mask(dst_access)
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range)
}

pub fn full_range(aspect: vk::ImageAspectFlags, layers: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(aspect)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(layers)
}

// ---------------------------------------------------------------------------
// TextureKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureKind {
    Tex2D,
    Tex3D,
    /// Six square 2D layers in +X, -X, +Y, -Y, +Z, -Z order.
    Cube,
}

impl TextureKind {
    pub fn image_type(self) -> vk::ImageType {
        match self {
            Self::Tex2D | Self::Cube => vk::ImageType::TYPE_2D,
            Self::Tex3D => vk::ImageType::TYPE_3D,
        }
    }

    pub fn view_type(self) -> vk::ImageViewType {
        match self {
            Self::Tex2D => vk::ImageViewType::TYPE_2D,
            Self::Tex3D => vk::ImageViewType::TYPE_3D,
            Self::Cube => vk::ImageViewType::CUBE,
        }
    }

    pub fn layer_count(self) -> u32 {
        match self {
            Self::Cube => 6,
            Self::Tex2D | Self::Tex3D => 1,
        }
    }

    pub fn create_flags(self) -> vk::ImageCreateFlags {
        match self {
            Self::Cube => vk::ImageCreateFlags::CUBE_COMPATIBLE,
            Self::Tex2D | Self::Tex3D => vk::ImageCreateFlags::empty(),
        }
    }

    pub fn validate_extent(self, extent: vk::Extent3D) -> Result<(), CreateImageError> {
        let nonzero = extent.width > 0 && extent.height > 0 && extent.depth > 0;
        let valid = nonzero
            && match self {
                Self::Tex2D => extent.depth == 1,
                Self::Tex3D => true,
                Self::Cube => extent.depth == 1 && extent.width == extent.height,
            };
        if valid {
            Ok(())
        } else {
            Err(CreateImageError::InvalidExtent { kind: self, extent })
        }
    }

    /// Bytes of tightly packed pixel data covering every layer, or `None`
    /// for formats without a known texel size.
    pub fn upload_size(self, extent: vk::Extent3D, format: vk::Format) -> Option<vk::DeviceSize> {
        let texel = vk::DeviceSize::from(format::texel_size(format)?);
        Some(
            texel
                * vk::DeviceSize::from(extent.width)
                * vk::DeviceSize::from(extent.height)
                * vk::DeviceSize::from(extent.depth)
                * vk::DeviceSize::from(self.layer_count()),
        )
    }
}

// ---------------------------------------------------------------------------
// DeviceLocalImage
// ---------------------------------------------------------------------------

/// A `GpuOnly` image with `OPTIMAL` tiling and a single mip level.
pub struct DeviceLocalImage {
    parent: Arc<Device>,
    handle: vk::Image,
    allocation: Option<Allocation>,
    kind: TextureKind,
    extent: vk::Extent3D,
    format: vk::Format,
}

impl std::fmt::Debug for DeviceLocalImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLocalImage")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("extent", &self.extent)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl DeviceLocalImage {
    pub fn new(
        device: &Arc<Device>,
        kind: TextureKind,
        extent: vk::Extent3D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        name: Option<&str>,
    ) -> Result<Self, CreateImageError> {
        kind.validate_extent(extent)?;
        let create_info = vk::ImageCreateInfo::default()
            .flags(kind.create_flags())
            .image_type(kind.image_type())
            .format(format)
            .extent(extent)
            .mip_levels(1)
            .array_layers(kind.layer_count())
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        // SAFETY: create_info has no borrowed data.
        let handle = unsafe { device.create_raw_image(&create_info) }
            .map_err(CreateImageError::CreateImage)?;
        // SAFETY: handle was just created from device.
        unsafe { device.name_or_warn(handle, name) };

        // SAFETY: handle is a live image from device.
        let reqs = unsafe { device.get_raw_image_memory_requirements(handle) };
        let allocation = device
            .allocate_memory(name.unwrap_or("image"), reqs, MemoryUsage::GpuOnly, false)
            .map_err(|e| {
                // SAFETY: handle is unbound and unused.
                unsafe { device.destroy_raw_image(handle) };
                CreateImageError::AllocateMemory(e)
            })?;

        // SAFETY: both the image and the allocation belong to device.
        let bind_result = unsafe {
            device.bind_raw_image_memory(handle, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bind_result {
            if let Err(free_err) = device.free_memory(allocation) {
                tracing::error!("Failed to free GPU image allocation: {free_err}");
            }
            // SAFETY: handle is owned by this scope and unused.
            unsafe { device.destroy_raw_image(handle) };
            return Err(CreateImageError::BindMemory(e));
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            allocation: Some(allocation),
            kind,
            extent,
            format,
        })
    }

    pub fn raw_image(&self) -> vk::Image {
        self.handle
    }

    pub fn kind(&self) -> TextureKind {
        self.kind
    }

    pub fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        format::aspect_mask(self.format)
    }

    pub fn subresource_range(&self) -> vk::ImageSubresourceRange {
        full_range(self.aspect(), self.kind.layer_count())
    }

    /// Records the staging upload of every layer:
    /// `UNDEFINED -> TRANSFER_DST_OPTIMAL`, the copy, then
    /// `TRANSFER_DST_OPTIMAL -> SHADER_READ_ONLY_OPTIMAL`.
    ///
    /// # Safety
    /// - `src` and `self` must outlive the GPU execution of the commands.
    /// - `src` needs `TRANSFER_SRC` usage and `self` `TRANSFER_DST | SAMPLED`.
    pub unsafe fn record_upload(
        &self,
        command_buffer: &mut ResettableCommandBuffer,
        src: &HostVisibleBuffer,
    ) -> Result<(), UploadImageError> {
        debug_assert_eq!(command_buffer.state(), RecordingState::Recording);
        let needed = self
            .kind
            .upload_size(self.extent, self.format)
            .ok_or(UploadImageError::UnsupportedFormat(self.format))?;
        if src.size() < needed {
            return Err(UploadImageError::SizeMismatch {
                src_bytes: src.size(),
                needed_bytes: needed,
            });
        }

        let range = self.subresource_range();
        let region = vk::BufferImageCopy::default()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(range.aspect_mask)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(range.layer_count),
            )
            .image_offset(vk::Offset3D::default())
            .image_extent(self.extent);

        // SAFETY: the image is owned by self and the copy region was sized
        // against src above. Lifetimes are the caller's.
        unsafe {
            command_buffer.image_barrier(transition_barrier(
                self.handle,
                range,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ));
            command_buffer.copy_buffer_to_image(
                src.raw_buffer(),
                self.handle,
                std::slice::from_ref(&region),
            );
            command_buffer.image_barrier(transition_barrier(
                self.handle,
                range,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ));
        }
        Ok(())
    }
}

impl Drop for DeviceLocalImage {
    fn drop(&mut self) {
        tracing::debug!("Dropping image {:?}", self.handle);
        // SAFETY: owners idle the device before dropping images, and views
        // are dropped first.
        unsafe { self.parent.destroy_raw_image(self.handle) };

        if let Some(allocation) = self.allocation.take()
            && let Err(e) = self.parent.free_memory(allocation)
        {
            tracing::error!("Failed to free GPU image allocation: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// ImageView
// ---------------------------------------------------------------------------

/// An owned `VkImageView`. Works for both allocated and swapchain images.
pub struct ImageView {
    parent: Arc<Device>,
    handle: vk::ImageView,
}

impl std::fmt::Debug for ImageView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageView")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl ImageView {
    /// # Safety
    /// `image` must be a live image from `device` compatible with
    /// `view_type`, `format` and `range`, and must outlive the view.
    pub unsafe fn new_raw(
        device: &Arc<Device>,
        image: vk::Image,
        view_type: vk::ImageViewType,
        format: vk::Format,
        range: vk::ImageSubresourceRange,
        name: Option<&str>,
    ) -> Result<Self, CreateImageError> {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(view_type)
            .format(format)
            .subresource_range(range);

        // SAFETY: forwarded to the caller.
        let handle = unsafe { device.create_raw_image_view(&create_info) }
            .map_err(CreateImageError::CreateView)?;
        // SAFETY: handle was just created from device.
        unsafe { device.name_or_warn(handle, name) };

        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    /// A view over every layer of `image`, typed by its kind.
    pub fn of_image(
        device: &Arc<Device>,
        image: &DeviceLocalImage,
        name: Option<&str>,
    ) -> Result<Self, CreateImageError> {
        // SAFETY: the view type, format and range are derived from the
        // image itself. Holders keep the image alive alongside the view.
        unsafe {
            Self::new_raw(
                device,
                image.raw_image(),
                image.kind().view_type(),
                image.format(),
                image.subresource_range(),
                name,
            )
        }
    }

    pub fn raw_image_view(&self) -> vk::ImageView {
        self.handle
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        tracing::debug!("Dropping image view {:?}", self.handle);
        // SAFETY: owners idle the device before dropping views.
        unsafe { self.parent.destroy_raw_image_view(self.handle) };
    }
}

// ---------------------------------------------------------------------------
// AttachmentImage
// ---------------------------------------------------------------------------

/// A 2D render target and its view.
#[derive(Debug)]
pub struct AttachmentImage {
    // Field order: the view is destroyed before the image.
    view: ImageView,
    image: DeviceLocalImage,
}

impl AttachmentImage {
    pub fn new(
        device: &Arc<Device>,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        name: Option<&str>,
    ) -> Result<Self, CreateImageError> {
        let image = DeviceLocalImage::new(
            device,
            TextureKind::Tex2D,
            vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            format,
            usage,
            name,
        )?;
        let view = ImageView::of_image(device, &image, name)?;
        Ok(Self { view, image })
    }

    pub fn image(&self) -> &DeviceLocalImage {
        &self.image
    }

    pub fn raw_image(&self) -> vk::Image {
        self.image.raw_image()
    }

    pub fn raw_image_view(&self) -> vk::ImageView {
        self.view.raw_image_view()
    }

    pub fn format(&self) -> vk::Format {
        self.image.format()
    }
}

// ---------------------------------------------------------------------------
// Texture
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct TextureDesc {
    pub kind: TextureKind,
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    /// Added to `SAMPLED | TRANSFER_DST`.
    pub extra_usage: vk::ImageUsageFlags,
    pub sampler: SamplerDesc,
}

impl TextureDesc {
    pub fn new_2d(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            kind: TextureKind::Tex2D,
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            format,
            extra_usage: vk::ImageUsageFlags::empty(),
            sampler: SamplerDesc::default(),
        }
    }

    pub fn new_3d(width: u32, height: u32, depth: u32, format: vk::Format) -> Self {
        Self {
            kind: TextureKind::Tex3D,
            extent: vk::Extent3D {
                width,
                height,
                depth,
            },
            ..Self::new_2d(width, height, format)
        }
    }

    pub fn new_cube(size: u32, format: vk::Format) -> Self {
        Self {
            kind: TextureKind::Cube,
            ..Self::new_2d(size, size, format)
        }
    }

    pub fn usage(&self) -> vk::ImageUsageFlags {
        vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST | self.extra_usage
    }
}

/// A sampled image: image, full view and sampler.
#[derive(Debug)]
pub struct Texture {
    sampler: Sampler,
    view: ImageView,
    image: DeviceLocalImage,
}

impl Texture {
    pub fn new(
        device: &Arc<Device>,
        desc: &TextureDesc,
        name: Option<&str>,
    ) -> Result<Self, CreateTextureError> {
        let image = DeviceLocalImage::new(
            device,
            desc.kind,
            desc.extent,
            desc.format,
            desc.usage(),
            name,
        )?;
        let view = ImageView::of_image(device, &image, name)?;
        let sampler = Sampler::new(device, &desc.sampler, name)?;
        Ok(Self {
            sampler,
            view,
            image,
        })
    }

    pub fn image(&self) -> &DeviceLocalImage {
        &self.image
    }

    pub fn kind(&self) -> TextureKind {
        self.image.kind()
    }

    pub fn raw_image_view(&self) -> vk::ImageView {
        self.view.raw_image_view()
    }

    pub fn raw_sampler(&self) -> vk::Sampler {
        self.sampler.raw_sampler()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(width: u32, height: u32, depth: u32) -> vk::Extent3D {
        vk::Extent3D {
            width,
            height,
            depth,
        }
    }

    #[test]
    fn cube_needs_square_faces() {
        assert!(TextureKind::Cube.validate_extent(extent(64, 64, 1)).is_ok());
        assert!(TextureKind::Cube.validate_extent(extent(64, 32, 1)).is_err());
        assert!(TextureKind::Cube.validate_extent(extent(64, 64, 2)).is_err());
    }

    #[test]
    fn flat_textures_have_unit_depth() {
        assert!(TextureKind::Tex2D.validate_extent(extent(4, 8, 1)).is_ok());
        assert!(TextureKind::Tex2D.validate_extent(extent(4, 8, 3)).is_err());
        assert!(TextureKind::Tex3D.validate_extent(extent(4, 8, 3)).is_ok());
        assert!(TextureKind::Tex3D.validate_extent(extent(0, 8, 3)).is_err());
    }

    #[test]
    fn upload_size_covers_layers_and_depth() {
        let rgba = vk::Format::R8G8B8A8_UNORM;
        assert_eq!(TextureKind::Tex2D.upload_size(extent(4, 4, 1), rgba), Some(64));
        assert_eq!(TextureKind::Cube.upload_size(extent(4, 4, 1), rgba), Some(384));
        assert_eq!(TextureKind::Tex3D.upload_size(extent(4, 4, 2), rgba), Some(128));
        assert_eq!(
            TextureKind::Tex2D.upload_size(extent(4, 4, 1), vk::Format::BC1_RGB_UNORM_BLOCK),
            None
        );
    }

    #[test]
    fn view_types_follow_kind() {
        assert_eq!(TextureKind::Cube.view_type(), vk::ImageViewType::CUBE);
        assert_eq!(TextureKind::Cube.layer_count(), 6);
        assert!(TextureKind::Cube
            .create_flags()
            .contains(vk::ImageCreateFlags::CUBE_COMPATIBLE));
        assert_eq!(TextureKind::Tex3D.image_type(), vk::ImageType::TYPE_3D);
    }

    #[test]
    fn present_transition_releases_color_writes() {
        let barrier = transition_barrier(
            vk::Image::null(),
            full_range(vk::ImageAspectFlags::COLOR, 1),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
        assert!(barrier
            .src_access_mask
            .contains(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE));
        assert_eq!(barrier.dst_access_mask, vk::AccessFlags2::NONE);
        assert_eq!(barrier.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }
}
