use std::sync::Arc;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::instance::Instance;

#[derive(Debug, Error)]
pub enum CreateSurfaceError {
    #[error("Couldn't get display handle: {0}")]
    InvalidDisplayHandle(raw_window_handle::HandleError),
    #[error("Couldn't get window handle: {0}")]
    InvalidWindowHandle(raw_window_handle::HandleError),
    #[error("Vulkan surface creation failed: {0}")]
    VulkanError(vk::Result),
}

#[derive(Debug, Error)]
pub enum SurfaceQueryError {
    #[error("Vulkan error querying surface: {0}")]
    Vulkan(vk::Result),
}

/// Everything the swapchain needs to know about a surface on one device.
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// A presentable surface tied to a window.
///
/// Holds the window alive so the native handle outlives the
/// `VkSurfaceKHR`. Must be dropped when the platform invalidates the
/// window, such as a winit suspend.
pub struct Surface<T: HasWindowHandle + HasDisplayHandle> {
    parent: Arc<Instance>,
    handle: vk::SurfaceKHR,
    source: Arc<T>,
}

impl<T: HasWindowHandle + HasDisplayHandle> std::fmt::Debug for Surface<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Surface")
            .field("handle", &self.handle)
            .field("parent", &self.parent)
            .finish_non_exhaustive()
    }
}

impl<T: HasWindowHandle + HasDisplayHandle> Surface<T> {
    /// # Safety
    /// No GPU work referencing the surface (or a swapchain built on it)
    /// may be in flight when the returned value is dropped.
    pub unsafe fn new(
        instance: &Arc<Instance>,
        source: Arc<T>,
    ) -> Result<Self, CreateSurfaceError> {
        // SAFETY: we keep both the instance and the source alive for as
        // long as the surface.
        let handle = unsafe { instance.create_raw_surface(source.as_ref()) }?;
        tracing::debug!("Created surface {handle:?}");
        Ok(Self {
            parent: Arc::clone(instance),
            handle,
            source,
        })
    }

    pub fn parent(&self) -> &Arc<Instance> {
        &self.parent
    }

    pub fn source(&self) -> &Arc<T> {
        &self.source
    }

    pub fn raw_handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    /// # Safety
    /// `physical_device` must come from the same instance as this surface.
    pub unsafe fn supports_queue_family(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family_index: u32,
    ) -> Result<bool, SurfaceQueryError> {
        // SAFETY: forwarded to the caller.
        unsafe {
            self.parent.get_raw_physical_device_surface_support(
                physical_device,
                queue_family_index,
                self.handle,
            )
        }
    }

    /// Capabilities, formats and present modes in one go.
    ///
    /// # Safety
    /// `physical_device` must come from the same instance as this surface.
    pub unsafe fn query_support(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<SurfaceSupport, SurfaceQueryError> {
        // SAFETY: forwarded to the caller for all three queries.
        unsafe {
            Ok(SurfaceSupport {
                capabilities: self
                    .parent
                    .get_surface_capabilities(physical_device, self.handle)?,
                formats: self
                    .parent
                    .get_surface_formats(physical_device, self.handle)?,
                present_modes: self
                    .parent
                    .get_surface_present_modes(physical_device, self.handle)?,
            })
        }
    }
}

impl<T: HasWindowHandle + HasDisplayHandle> Drop for Surface<T> {
    fn drop(&mut self) {
        tracing::debug!("Dropping surface {:?}", self.handle);
        // SAFETY: swapchains built on this surface hold an Arc to it, so
        // none remain.
        unsafe { self.parent.destroy_raw_surface(self.handle) };
    }
}
