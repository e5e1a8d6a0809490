//! The presentable image chain and its companion depth images.
//!
//! [`SwapchainPlan`] holds every choice made from a surface's reported
//! support and is computed without touching the GPU. [`Swapchain`] turns a
//! plan into live objects and rebuilds them on request.

use std::sync::Arc;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::device::Device;
use crate::device_select::QueueRole;
use crate::format::aspect_mask;
use crate::image::{AttachmentImage, CreateImageError, ImageView, full_range};
use crate::surface::{Surface, SurfaceQueryError, SurfaceSupport};

#[derive(Debug, Error)]
pub enum CreateSwapchainError {
    #[error(
        "Mismatched parameters to Swapchain::create. \
         Device and surface must be derived from the same instance"
    )]
    MismatchedParams,

    #[error("No supported surface formats were reported")]
    NoSurfaceFormats,

    #[error("No supported present modes were reported")]
    NoPresentModes,

    #[error("Failed while querying surface support details: {0}")]
    SurfaceQuery(#[from] SurfaceQueryError),

    #[error("Waiting for device idle before recreation failed: {0}")]
    WaitIdle(vk::Result),

    #[error("Vulkan error creating swapchain: {0}")]
    VulkanCreate(vk::Result),

    #[error("Vulkan error fetching swapchain images: {0}")]
    VulkanGetImages(vk::Result),

    #[error("Failed to create swapchain image view: {0}")]
    ImageView(CreateImageError),

    #[error("Failed to create depth attachment: {0}")]
    DepthAttachment(CreateImageError),
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

const PREFERRED_FORMATS: [vk::Format; 2] = [vk::Format::B8G8R8A8_SRGB, vk::Format::B8G8R8A8_UNORM];

fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    PREFERRED_FORMATS
        .iter()
        .find_map(|&wanted| {
            formats.iter().copied().find(|f| {
                f.format == wanted && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
        })
        .or_else(|| formats.first().copied())
}

fn choose_present_mode(present_modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    present_modes
        .iter()
        .copied()
        .find(|m| *m == vk::PresentModeKHR::MAILBOX)
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_extent: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_extent.width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_extent.height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut image_count = capabilities.min_image_count.saturating_add(1);
    if capabilities.max_image_count > 0 {
        image_count = image_count.min(capabilities.max_image_count);
    }
    image_count
}

fn choose_composite_alpha(capabilities: &vk::SurfaceCapabilitiesKHR) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
    ]
    .into_iter()
    .find(|mode| capabilities.supported_composite_alpha.contains(*mode))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::INHERIT)
}

fn choose_image_usage(capabilities: &vk::SurfaceCapabilitiesKHR) -> vk::ImageUsageFlags {
    let optional = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
    vk::ImageUsageFlags::COLOR_ATTACHMENT | (capabilities.supported_usage_flags & optional)
}

fn is_zero(extent: vk::Extent2D) -> bool {
    extent.width == 0 || extent.height == 0
}

/// Every parameter of a swapchain, derived from surface support and the
/// extent the window asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainPlan {
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub image_usage: vk::ImageUsageFlags,
}

impl SwapchainPlan {
    /// `Ok(None)` means the surface is currently zero-sized (a minimized
    /// window) and nothing can be presented to it.
    pub fn choose(
        support: &SurfaceSupport,
        desired_extent: vk::Extent2D,
    ) -> Result<Option<Self>, CreateSwapchainError> {
        let surface_format =
            choose_surface_format(&support.formats).ok_or(CreateSwapchainError::NoSurfaceFormats)?;
        if support.present_modes.is_empty() {
            return Err(CreateSwapchainError::NoPresentModes);
        }
        if is_zero(desired_extent) {
            return Ok(None);
        }
        let capabilities = &support.capabilities;
        let extent = choose_extent(capabilities, desired_extent);
        if is_zero(extent) {
            return Ok(None);
        }

        Ok(Some(Self {
            format: surface_format.format,
            color_space: surface_format.color_space,
            present_mode: choose_present_mode(&support.present_modes),
            extent,
            image_count: choose_image_count(capabilities),
            composite_alpha: choose_composite_alpha(capabilities),
            pre_transform: capabilities.current_transform,
            image_usage: choose_image_usage(capabilities),
        }))
    }
}

// ---------------------------------------------------------------------------
// Depth attachments
// ---------------------------------------------------------------------------

/// Depth-only, stencil-only and combined attachments matching the
/// swapchain extent, in the formats the device detected.
#[derive(Debug)]
pub struct DepthAttachments {
    pub depth: AttachmentImage,
    pub stencil: AttachmentImage,
    pub depth_stencil: AttachmentImage,
}

impl DepthAttachments {
    pub fn new(device: &Arc<Device>, extent: vk::Extent2D) -> Result<Self, CreateImageError> {
        let formats = device.depth_formats();
        let usage = vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        Ok(Self {
            depth: AttachmentImage::new(
                device,
                extent,
                formats.depth,
                usage,
                Some("depth attachment"),
            )?,
            stencil: AttachmentImage::new(
                device,
                extent,
                formats.stencil,
                usage,
                Some("stencil attachment"),
            )?,
            depth_stencil: AttachmentImage::new(
                device,
                extent,
                formats.depth_stencil,
                usage,
                Some("depth-stencil attachment"),
            )?,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &AttachmentImage> {
        [&self.depth, &self.stencil, &self.depth_stencil].into_iter()
    }

    /// Full subresource range of `attachment`, covering whichever of the
    /// depth and stencil aspects its format has.
    pub fn range_of(attachment: &AttachmentImage) -> vk::ImageSubresourceRange {
        full_range(aspect_mask(attachment.format()), 1)
    }
}

// ---------------------------------------------------------------------------
// Swapchain
// ---------------------------------------------------------------------------

pub type ResizeHook = Box<dyn FnMut(vk::Extent2D)>;

/// A swapchain that may be empty while its window is minimized.
///
/// Image count and extent always describe the last successful build. A
/// swapchain without images is never handed out for presentation.
pub struct Swapchain<T: HasDisplayHandle + HasWindowHandle> {
    // Field order: attachments and views go before the handle they view.
    depth: Option<DepthAttachments>,
    image_views: Vec<ImageView>,
    images: Vec<vk::Image>,
    handle: vk::SwapchainKHR,
    plan: Option<SwapchainPlan>,
    desired_extent: vk::Extent2D,
    generation: u64,
    resize_hook: Option<ResizeHook>,
    surface: Arc<Surface<T>>,
    device: Arc<Device>,
}

impl<T: HasDisplayHandle + HasWindowHandle> std::fmt::Debug for Swapchain<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swapchain")
            .field("handle", &self.handle)
            .field("plan", &self.plan)
            .field("desired_extent", &self.desired_extent)
            .field("images", &self.images.len())
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl<T: HasDisplayHandle + HasWindowHandle> Swapchain<T> {
    pub fn create(
        device: &Arc<Device>,
        surface: &Arc<Surface<T>>,
        desired_extent: vk::Extent2D,
    ) -> Result<Self, CreateSwapchainError> {
        if !Arc::ptr_eq(device.parent(), surface.parent()) {
            return Err(CreateSwapchainError::MismatchedParams);
        }
        let mut swapchain = Self {
            depth: None,
            image_views: Vec::new(),
            images: Vec::new(),
            handle: vk::SwapchainKHR::null(),
            plan: None,
            desired_extent,
            generation: 0,
            resize_hook: None,
            surface: Arc::clone(surface),
            device: Arc::clone(device),
        };
        swapchain.build(vk::SwapchainKHR::null())?;
        Ok(swapchain)
    }

    /// Tears down images, views and depth attachments, then builds again
    /// at the last requested extent. The old swapchain is retired through
    /// `oldSwapchain` and destroyed afterwards.
    pub fn recreate(&mut self) -> Result<(), CreateSwapchainError> {
        let _span = tracing::debug_span!(
            "swapchain_recreate",
            width = self.desired_extent.width,
            height = self.desired_extent.height
        )
        .entered();
        self.device.wait_idle().map_err(CreateSwapchainError::WaitIdle)?;

        self.release_images();
        let old = std::mem::replace(&mut self.handle, vk::SwapchainKHR::null());
        let result = self.build(old);
        if old != vk::SwapchainKHR::null() {
            // SAFETY: the device is idle and every view of the old images
            // was released above.
            unsafe { self.device.destroy_raw_swapchain(old) };
        }
        result?;

        if let Some(plan) = self.plan
            && let Some(hook) = self.resize_hook.as_mut()
        {
            hook(plan.extent);
        }
        Ok(())
    }

    /// Releases every image and the swapchain itself. The caller must make
    /// sure the GPU no longer uses them. Safe to call more than once.
    pub fn destroy(&mut self) {
        self.release_images();
        self.plan = None;
        if self.handle != vk::SwapchainKHR::null() {
            tracing::debug!("Dropping swapchain {:?}", self.handle);
            // SAFETY: views were released above and the caller guarantees
            // no GPU work references the images.
            unsafe { self.device.destroy_raw_swapchain(self.handle) };
            self.handle = vk::SwapchainKHR::null();
        }
    }

    fn release_images(&mut self) {
        self.depth = None;
        self.image_views.clear();
        self.images.clear();
    }

    fn build(&mut self, old: vk::SwapchainKHR) -> Result<(), CreateSwapchainError> {
        // SAFETY: device and surface share an instance, checked in create.
        let support = unsafe { self.surface.query_support(self.device.physical_device()) }?;
        let Some(plan) = SwapchainPlan::choose(&support, self.desired_extent)? else {
            tracing::debug!("Surface is zero-sized; swapchain left empty");
            self.plan = None;
            return Ok(());
        };

        let graphics = self.device.queue_family(QueueRole::Graphics);
        let present = self.device.queue_family(QueueRole::Present);
        let families = [graphics, present];
        let mut create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface.raw_handle())
            .min_image_count(plan.image_count)
            .image_format(plan.format)
            .image_color_space(plan.color_space)
            .image_extent(plan.extent)
            .image_array_layers(1)
            .image_usage(plan.image_usage)
            .pre_transform(plan.pre_transform)
            .composite_alpha(plan.composite_alpha)
            .present_mode(plan.present_mode)
            .clipped(true)
            .old_swapchain(old);
        create_info = if graphics == present {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        } else {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&families)
        };

        // SAFETY: the surface belongs to the device's instance and `old`
        // is null or a swapchain from this device.
        let handle = unsafe { self.device.create_raw_swapchain(&create_info) }
            .map_err(CreateSwapchainError::VulkanCreate)?;
        self.handle = handle;
        self.generation += 1;
        let name = format!("swapchain {}", self.generation);
        // SAFETY: handle was just created from device.
        unsafe { self.device.name_or_warn(handle, Some(&name)) };

        // SAFETY: handle is live.
        let images = unsafe { self.device.get_raw_swapchain_images(handle) }
            .map_err(CreateSwapchainError::VulkanGetImages)?;
        let image_views = images
            .iter()
            .enumerate()
            .map(|(index, &image)| {
                let view_name = format!("{name} view {index}");
                // SAFETY: the image belongs to this swapchain, which
                // outlives the views.
                unsafe {
                    ImageView::new_raw(
                        &self.device,
                        image,
                        vk::ImageViewType::TYPE_2D,
                        plan.format,
                        full_range(vk::ImageAspectFlags::COLOR, 1),
                        Some(&view_name),
                    )
                }
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(CreateSwapchainError::ImageView)?;
        let depth = DepthAttachments::new(&self.device, plan.extent)
            .map_err(CreateSwapchainError::DepthAttachment)?;

        tracing::info!(
            "Created swapchain {:?}: {}x{} {:?} {:?}, {} images",
            handle,
            plan.extent.width,
            plan.extent.height,
            plan.format,
            plan.present_mode,
            images.len()
        );
        self.images = images;
        self.image_views = image_views;
        self.depth = Some(depth);
        self.plan = Some(plan);
        Ok(())
    }

    /// Records the extent the next [`recreate`](Self::recreate) builds at.
    pub fn set_desired_extent(&mut self, extent: vk::Extent2D) {
        self.desired_extent = extent;
    }

    pub fn desired_extent(&self) -> vk::Extent2D {
        self.desired_extent
    }

    /// Called with the new extent after every successful recreation that
    /// produced presentable images.
    pub fn set_resize_hook(&mut self, hook: impl FnMut(vk::Extent2D) + 'static) {
        self.resize_hook = Some(Box::new(hook));
    }

    pub fn is_presentable(&self) -> bool {
        self.handle != vk::SwapchainKHR::null() && self.plan.is_some()
    }

    pub fn plan(&self) -> Option<&SwapchainPlan> {
        self.plan.as_ref()
    }

    /// Current extent, zero while minimized.
    pub fn extent(&self) -> vk::Extent2D {
        self.plan.map(|p| p.extent).unwrap_or_default()
    }

    pub fn format(&self) -> vk::Format {
        self.plan.map(|p| p.format).unwrap_or(vk::Format::UNDEFINED)
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn raw_image_view(&self, index: u32) -> Option<vk::ImageView> {
        self.image_views
            .get(index as usize)
            .map(ImageView::raw_image_view)
    }

    pub fn depth_attachments(&self) -> Option<&DepthAttachments> {
        self.depth.as_ref()
    }

    pub fn raw_handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Acquires with no timeout. A minimized swapchain reports
    /// `ERROR_OUT_OF_DATE_KHR`.
    ///
    /// # Safety
    /// `semaphore` must be unsignaled with no pending signal operation.
    pub unsafe fn acquire_next_image(
        &self,
        semaphore: vk::Semaphore,
    ) -> Result<(u32, bool), vk::Result> {
        if !self.is_presentable() {
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }
        // SAFETY: the handle is live and the semaphore contract is
        // forwarded to the caller.
        unsafe {
            self.device
                .acquire_next_swapchain_image(self.handle, u64::MAX, semaphore)
        }
    }
}

impl<T: HasDisplayHandle + HasWindowHandle> Drop for Swapchain<T> {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface_format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    fn variable_support() -> SurfaceSupport {
        SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR {
                min_image_count: 2,
                max_image_count: 8,
                current_extent: vk::Extent2D {
                    width: u32::MAX,
                    height: u32::MAX,
                },
                min_image_extent: vk::Extent2D { width: 1, height: 1 },
                max_image_extent: vk::Extent2D {
                    width: 4096,
                    height: 4096,
                },
                supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
                supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::TRANSFER_SRC,
                ..Default::default()
            },
            formats: vec![
                surface_format(vk::Format::B8G8R8A8_UNORM),
                surface_format(vk::Format::B8G8R8A8_SRGB),
            ],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        }
    }

    #[test]
    fn choose_surface_format_prefers_bgra_srgb() {
        let formats = [
            surface_format(vk::Format::R8G8B8A8_UNORM),
            surface_format(vk::Format::B8G8R8A8_UNORM),
            surface_format(vk::Format::B8G8R8A8_SRGB),
        ];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);

        let chosen = choose_surface_format(&formats[..2]).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn choose_surface_format_ignores_other_color_spaces() {
        let formats = [
            surface_format(vk::Format::R16G16B16A16_SFLOAT),
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::DISPLAY_P3_NONLINEAR_EXT,
            },
        ];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::R16G16B16A16_SFLOAT);
        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn choose_present_mode_prefers_mailbox() {
        let chosen = choose_present_mode(&[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX]);
        assert_eq!(chosen, vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn choose_present_mode_falls_back_to_fifo() {
        let chosen = choose_present_mode(&[vk::PresentModeKHR::IMMEDIATE]);
        assert_eq!(chosen, vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn choose_extent_uses_current_when_fixed() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            ..Default::default()
        };
        let chosen = choose_extent(
            &capabilities,
            vk::Extent2D {
                width: 1920,
                height: 1080,
            },
        );
        assert_eq!(chosen, vk::Extent2D { width: 1280, height: 720 });
    }

    #[test]
    fn choose_extent_clamps_when_variable() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 640,
                height: 480,
            },
            max_image_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            ..Default::default()
        };
        let chosen = choose_extent(
            &capabilities,
            vk::Extent2D {
                width: 4000,
                height: 200,
            },
        );
        assert_eq!(chosen, vk::Extent2D { width: 1920, height: 480 });
    }

    #[test]
    fn choose_image_count_respects_max_when_set() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 3,
            max_image_count: 3,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&capabilities), 3);

        let unbounded = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&unbounded), 3);
    }

    #[test]
    fn choose_composite_alpha_prefers_opaque_then_pre_multiplied() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED
                | vk::CompositeAlphaFlagsKHR::OPAQUE,
            ..Default::default()
        };
        assert_eq!(
            choose_composite_alpha(&capabilities),
            vk::CompositeAlphaFlagsKHR::OPAQUE
        );

        let capabilities = vk::SurfaceCapabilitiesKHR {
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
            ..Default::default()
        };
        assert_eq!(
            choose_composite_alpha(&capabilities),
            vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED
        );
    }

    #[test]
    fn plan_combines_every_choice() {
        let extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let plan = SwapchainPlan::choose(&variable_support(), extent)
            .unwrap()
            .unwrap();
        assert_eq!(plan.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(plan.present_mode, vk::PresentModeKHR::MAILBOX);
        assert_eq!(plan.extent, extent);
        assert_eq!(plan.image_count, 3);
        assert_eq!(
            plan.image_usage,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC
        );
    }

    #[test]
    fn replanning_with_same_inputs_is_stable() {
        let support = variable_support();
        let extent = vk::Extent2D {
            width: 1024,
            height: 768,
        };
        let first = SwapchainPlan::choose(&support, extent).unwrap();
        let second = SwapchainPlan::choose(&support, extent).unwrap();
        assert_eq!(first, second);
        let first = first.unwrap();
        assert_eq!(first.extent, extent);
    }

    #[test]
    fn zero_extent_is_minimized() {
        let support = variable_support();
        assert_eq!(
            SwapchainPlan::choose(&support, vk::Extent2D { width: 0, height: 0 }).unwrap(),
            None
        );
        assert_eq!(
            SwapchainPlan::choose(&support, vk::Extent2D { width: 640, height: 0 }).unwrap(),
            None
        );

        let mut fixed_zero = variable_support();
        fixed_zero.capabilities.current_extent = vk::Extent2D { width: 0, height: 0 };
        assert_eq!(
            SwapchainPlan::choose(&fixed_zero, vk::Extent2D { width: 800, height: 600 }).unwrap(),
            None
        );
    }

    #[test]
    fn missing_formats_or_modes_are_errors() {
        let mut support = variable_support();
        support.present_modes.clear();
        assert!(matches!(
            SwapchainPlan::choose(&support, vk::Extent2D { width: 1, height: 1 }),
            Err(CreateSwapchainError::NoPresentModes)
        ));
        support.formats.clear();
        assert!(matches!(
            SwapchainPlan::choose(&support, vk::Extent2D { width: 1, height: 1 }),
            Err(CreateSwapchainError::NoSurfaceFormats)
        ));
    }
}
