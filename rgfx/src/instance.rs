//! Vulkan instance creation and physical device queries.
//!
//! [`Instance`] owns the loader entry point, the `ash::Instance`, the
//! surface extension loader and, when validation was requested and the
//! Khronos layer is installed, a debug messenger that forwards layer
//! output into `tracing` under the `rgfx-debug-messenger` target.

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::device_select::DescriptorIndexingSupport;
use crate::surface::{CreateSurfaceError, SurfaceQueryError};
use std::{
    ffi::{CStr, CString},
    fmt::Debug,
};

const DEBUG_TARGET: &str = "rgfx-debug-messenger";
const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Minimum severity of validation messages forwarded to `tracing`.
///
/// Ordered least to most severe.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum VulkanLogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

impl VulkanLogLevel {
    fn severity_flags(self) -> vk::DebugUtilsMessageSeverityFlagsEXT {
        use vk::DebugUtilsMessageSeverityFlagsEXT as Sev;
        match self {
            VulkanLogLevel::Verbose => {
                Sev::VERBOSE | Sev::INFO | Sev::WARNING | Sev::ERROR
            }
            VulkanLogLevel::Info => Sev::INFO | Sev::WARNING | Sev::ERROR,
            VulkanLogLevel::Warning => Sev::WARNING | Sev::ERROR,
            VulkanLogLevel::Error => Sev::ERROR,
        }
    }
}

/// A packed Vulkan API version word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VkVersion(u32);

impl VkVersion {
    pub const V1_0: VkVersion = VkVersion(vk::API_VERSION_1_0);
    pub const V1_1: VkVersion = VkVersion(vk::API_VERSION_1_1);
    pub const V1_2: VkVersion = VkVersion(vk::API_VERSION_1_2);
    pub const V1_3: VkVersion = VkVersion(vk::API_VERSION_1_3);

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self(vk::make_api_version(0, major, minor, patch))
    }

    pub fn major(&self) -> u32 {
        vk::api_version_major(self.0)
    }

    pub fn minor(&self) -> u32 {
        vk::api_version_minor(self.0)
    }

    pub fn patch(&self) -> u32 {
        vk::api_version_patch(self.0)
    }

    /// Compares major and minor only, so a 1.3.250 driver satisfies 1.3.
    pub fn at_least(&self, other: VkVersion) -> bool {
        (self.major(), self.minor()) >= (other.major(), other.minor())
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for VkVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.patch())
    }
}

/// The root Vulkan object. Everything else keeps an `Arc<Instance>`.
pub struct Instance {
    entry: ash::Entry,
    handle: ash::Instance,
    debug_messenger:
        Option<(vk::DebugUtilsMessengerEXT, ash::ext::debug_utils::Instance)>,
    surface_instance: ash::khr::surface::Instance,
    ver: VkVersion,
}

impl Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("handle", &self.handle.handle())
            .field("version", &self.ver)
            .field("validation", &self.debug_messenger.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum InstanceCreationError {
    #[error("Could not load Vulkan: {0}")]
    Loading(ash::LoadingError),
    #[error("Couldn't get display handle from passed value: {0}")]
    InvalidDisplayHandle(crate::RwhHandleError),
    #[error("Missing mandatory instance extensions: {0:?}")]
    MissingExtensions(Vec<String>),
    #[error("Vulkan 1.1 or newer is required, loader reports {0}")]
    UnsupportedVersion(VkVersion),
    #[error("Unknown Vulkan Error {0}")]
    UnknownVulkan(vk::Result),
    #[error("Application name contains an interior nul byte")]
    InvalidAppName,
}

impl From<vk::Result> for InstanceCreationError {
    fn from(value: vk::Result) -> Self {
        InstanceCreationError::UnknownVulkan(value)
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        tracing::debug!("Dropping instance {:?}", self.handle.handle());
        if let Some((messenger, loader)) = self.debug_messenger.take() {
            // SAFETY: the messenger was created from this instance and is
            // not referenced anywhere else.
            unsafe { loader.destroy_debug_utils_messenger(messenger, None) };
        }
        // SAFETY: every derived object holds an Arc to us, so none remain.
        unsafe { self.handle.destroy_instance(None) };
    }
}

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    // SAFETY: the loader hands us valid callback data for the duration of
    // the call.
    let data = unsafe { &*p_callback_data };
    let message = if data.p_message.is_null() {
        std::borrow::Cow::Borrowed("<no message>")
    } else {
        // SAFETY: p_message is a nul terminated string owned by the loader.
        unsafe { CStr::from_ptr(data.p_message) }.to_string_lossy()
    };

    let kind = if message_type
        .contains(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION)
    {
        "validation"
    } else if message_type
        .contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE)
    {
        "performance"
    } else {
        "general"
    };

    use vk::DebugUtilsMessageSeverityFlagsEXT as Sev;
    if message_severity.contains(Sev::ERROR) {
        tracing::error!(target: DEBUG_TARGET, kind, "{message}");
    } else if message_severity.contains(Sev::WARNING) {
        tracing::warn!(target: DEBUG_TARGET, kind, "{message}");
    } else if message_severity.contains(Sev::INFO) {
        tracing::info!(target: DEBUG_TARGET, kind, "{message}");
    } else {
        tracing::trace!(target: DEBUG_TARGET, kind, "{message}");
    }

    vk::FALSE
}

impl Instance {
    /// Loads Vulkan and creates an instance able to present to surfaces
    /// provided by `display_source`.
    ///
    /// When `validation` is `Some` and both `VK_EXT_debug_utils` and the
    /// Khronos validation layer are installed, layer messages at or above
    /// that level are logged. Missing validation support is not an error.
    ///
    /// # Safety
    /// Loading the Vulkan shared library runs arbitrary initialisation
    /// code from whatever loader is installed.
    pub unsafe fn new(
        app_name: &str,
        validation: Option<VulkanLogLevel>,
        display_source: &impl HasDisplayHandle,
    ) -> Result<Self, InstanceCreationError> {
        use InstanceCreationError as Error;

        let app_name =
            CString::new(app_name).map_err(|_| Error::InvalidAppName)?;

        // SAFETY: forwarded to the caller. Entry outlives every object
        // created through it because Instance owns both.
        let entry = unsafe { ash::Entry::load() }.map_err(Error::Loading)?;

        // SAFETY: entry is loaded; this query has no other preconditions.
        let api_version = unsafe { entry.try_enumerate_instance_version() }
            .ok()
            .flatten()
            .map(VkVersion::from_raw)
            .unwrap_or(VkVersion::V1_0);
        if !api_version.at_least(VkVersion::V1_1) {
            return Err(Error::UnsupportedVersion(api_version));
        }

        let display = display_source
            .display_handle()
            .map_err(Error::InvalidDisplayHandle)?;
        let surface_exts: Vec<&CStr> =
            ash_window::enumerate_required_extensions(display.as_raw())?
                .iter()
                // SAFETY: ash_window returns static nul terminated names.
                .map(|ptr| unsafe { CStr::from_ptr(*ptr) })
                .collect();

        // SAFETY: entry is loaded; None selects the implementation's
        // own extensions.
        let available_exts =
            unsafe { entry.enumerate_instance_extension_properties(None) }?;
        let has_ext = |name: &CStr| {
            available_exts
                .iter()
                .any(|ext| ext.extension_name_as_c_str() == Ok(name))
        };

        let missing: Vec<String> = surface_exts
            .iter()
            .filter(|name| !has_ext(name))
            .map(|name| name.to_string_lossy().into_owned())
            .collect();
        if !missing.is_empty() {
            return Err(Error::MissingExtensions(missing));
        }

        // SAFETY: entry is loaded.
        let has_validation_layer =
            unsafe { entry.enumerate_instance_layer_properties() }
                .map(|layers| {
                    layers.iter().any(|layer| {
                        layer.layer_name_as_c_str() == Ok(VALIDATION_LAYER)
                    })
                })
                .unwrap_or(false);

        let mut ext_ptrs: Vec<*const std::ffi::c_char> =
            surface_exts.iter().map(|name| name.as_ptr()).collect();
        let mut layer_ptrs: Vec<*const std::ffi::c_char> = Vec::new();

        let debug_level = match validation {
            Some(level)
                if has_validation_layer
                    && has_ext(ash::ext::debug_utils::NAME) =>
            {
                ext_ptrs.push(ash::ext::debug_utils::NAME.as_ptr());
                layer_ptrs.push(VALIDATION_LAYER.as_ptr());
                Some(level)
            }
            Some(_) => {
                tracing::warn!(
                    "Validation requested but the Khronos layer or \
                     VK_EXT_debug_utils is not installed"
                );
                None
            }
            None => None,
        };

        let messenger_info = |level: VulkanLogLevel| {
            vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(level.severity_flags())
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(vulkan_debug_callback))
        };

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"rgfx")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(api_version.to_raw());

        // Chained so instance creation and destruction are also covered.
        let mut chained_messenger = debug_level.map(messenger_info);
        let mut create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&ext_ptrs)
            .enabled_layer_names(&layer_ptrs);
        if let Some(info) = chained_messenger.as_mut() {
            create_info = create_info.push_next(info);
        }

        // SAFETY: create_info and everything it points to is alive.
        let handle = unsafe { entry.create_instance(&create_info, None) }?;

        let debug_messenger = debug_level.and_then(|level| {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &handle);
            // SAFETY: fresh create info with no p_next chain.
            match unsafe {
                loader.create_debug_utils_messenger(&messenger_info(level), None)
            } {
                Ok(messenger) => Some((messenger, loader)),
                Err(e) => {
                    tracing::error!(
                        "Failed to create debug messenger, continuing \
                         without validation output: {e}"
                    );
                    None
                }
            }
        });

        let surface_instance = ash::khr::surface::Instance::new(&entry, &handle);

        tracing::info!(
            "Created Vulkan {api_version} instance (validation: {})",
            debug_messenger.is_some()
        );

        Ok(Instance {
            entry,
            handle,
            debug_messenger,
            surface_instance,
            ver: api_version,
        })
    }

    pub fn fetch_raw_physical_devices(
        &self,
    ) -> Result<Vec<vk::PhysicalDevice>, FetchPhysicalDeviceError> {
        // SAFETY: the instance is alive.
        match unsafe { self.handle.enumerate_physical_devices() } {
            Ok(v) => Ok(v),
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
            | Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY) => {
                Err(FetchPhysicalDeviceError::MemoryExhaustion)
            }
            Err(e) => Err(FetchPhysicalDeviceError::UnknownVulkan(e)),
        }
    }

    /// # Safety
    /// `physical_device` must come from this instance.
    pub unsafe fn get_raw_physical_device_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceProperties {
        // SAFETY: caller guarantees provenance.
        unsafe { self.handle.get_physical_device_properties(physical_device) }
    }

    /// # Safety
    /// `physical_device` must come from this instance.
    pub unsafe fn get_raw_physical_device_queue_family_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Vec<vk::QueueFamilyProperties> {
        // SAFETY: caller guarantees provenance.
        unsafe {
            self.handle
                .get_physical_device_queue_family_properties(physical_device)
        }
    }

    /// # Safety
    /// `physical_device` must come from this instance.
    pub unsafe fn get_raw_physical_device_memory_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceMemoryProperties {
        // SAFETY: caller guarantees provenance.
        unsafe {
            self.handle
                .get_physical_device_memory_properties(physical_device)
        }
    }

    /// Tiling and buffer features a physical device supports for `format`.
    ///
    /// # Safety
    /// `physical_device` must come from this instance.
    pub unsafe fn get_raw_physical_device_format_properties(
        &self,
        physical_device: vk::PhysicalDevice,
        format: vk::Format,
    ) -> vk::FormatProperties {
        // SAFETY: caller guarantees provenance.
        unsafe {
            self.handle
                .get_physical_device_format_properties(physical_device, format)
        }
    }

    /// Probes the descriptor indexing feature bits through
    /// `vkGetPhysicalDeviceFeatures2`.
    ///
    /// # Safety
    /// `physical_device` must come from this instance.
    pub unsafe fn get_raw_descriptor_indexing_support(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> DescriptorIndexingSupport {
        let mut indexing = vk::PhysicalDeviceDescriptorIndexingFeatures::default();
        let mut features =
            vk::PhysicalDeviceFeatures2::default().push_next(&mut indexing);
        // SAFETY: caller guarantees provenance and the instance is at least
        // 1.1, which made vkGetPhysicalDeviceFeatures2 core. Drivers that do
        // not know the chained struct leave it zeroed.
        unsafe {
            self.handle
                .get_physical_device_features2(physical_device, &mut features)
        };
        DescriptorIndexingSupport {
            runtime_array: indexing.runtime_descriptor_array == vk::TRUE,
            partially_bound: indexing.descriptor_binding_partially_bound
                == vk::TRUE,
            variable_count: indexing
                .descriptor_binding_variable_descriptor_count
                == vk::TRUE,
            sampled_image_update_after_bind: indexing
                .descriptor_binding_sampled_image_update_after_bind
                == vk::TRUE,
            storage_buffer_update_after_bind: indexing
                .descriptor_binding_storage_buffer_update_after_bind
                == vk::TRUE,
            non_uniform_sampled_image_indexing: indexing
                .shader_sampled_image_array_non_uniform_indexing
                == vk::TRUE,
        }
    }

    /// # Safety
    /// `physical_device` must come from this instance and `create_info`
    /// must be valid along with everything its pointers reference.
    pub unsafe fn create_ash_device(
        &self,
        physical_device: vk::PhysicalDevice,
        create_info: &vk::DeviceCreateInfo<'_>,
    ) -> Result<ash::Device, vk::Result> {
        // SAFETY: forwarded to the caller.
        unsafe {
            self.handle
                .create_device(physical_device, create_info, None)
        }
    }

    /// # Safety
    /// `physical_device` must come from this instance.
    pub unsafe fn enumerate_raw_device_extension_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::ExtensionProperties>, vk::Result> {
        // SAFETY: caller guarantees provenance.
        unsafe {
            self.handle
                .enumerate_device_extension_properties(physical_device)
        }
    }

    /// Version reported by the loader, which is also the version requested.
    pub fn supported_ver(&self) -> VkVersion {
        self.ver
    }

    pub fn validation_enabled(&self) -> bool {
        self.debug_messenger.is_some()
    }

    pub fn raw_instance(&self) -> vk::Instance {
        self.handle.handle()
    }

    pub fn ash_instance(&self) -> &ash::Instance {
        &self.handle
    }
}

#[derive(Debug, Error)]
pub enum FetchPhysicalDeviceError {
    #[error("Error fetching physical devices, memory exhaustion")]
    MemoryExhaustion,
    #[error("Error fetching physical devices, Unknown vulkan: {0}")]
    UnknownVulkan(vk::Result),
}

// ---------------------------------------------------------------------------
// Surface queries
// ---------------------------------------------------------------------------

impl Instance {
    /// # Safety
    /// The surface must be destroyed before `source` goes away and before
    /// this instance is dropped.
    pub unsafe fn create_raw_surface<T: HasDisplayHandle + HasWindowHandle>(
        &self,
        source: &T,
    ) -> Result<vk::SurfaceKHR, CreateSurfaceError> {
        use CreateSurfaceError as Error;
        let display = source
            .display_handle()
            .map_err(Error::InvalidDisplayHandle)?;
        let window = source.window_handle().map_err(Error::InvalidWindowHandle)?;
        // SAFETY: both handles were just borrowed from a live source and the
        // platform surface extensions were enabled at creation.
        unsafe {
            ash_window::create_surface(
                &self.entry,
                &self.handle,
                display.as_raw(),
                window.as_raw(),
                None,
            )
        }
        .map_err(Error::VulkanError)
    }

    /// # Safety
    /// `surface` must come from this instance and nothing derived from it
    /// may still be alive.
    pub unsafe fn destroy_raw_surface(&self, surface: vk::SurfaceKHR) {
        // SAFETY: forwarded to the caller.
        unsafe { self.surface_instance.destroy_surface(surface, None) };
    }

    /// # Safety
    /// `physical_device` and `surface` must come from this instance.
    pub unsafe fn get_raw_physical_device_surface_support(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family_index: u32,
        surface: vk::SurfaceKHR,
    ) -> Result<bool, SurfaceQueryError> {
        // SAFETY: caller guarantees provenance.
        unsafe {
            self.surface_instance.get_physical_device_surface_support(
                physical_device,
                queue_family_index,
                surface,
            )
        }
        .map_err(SurfaceQueryError::Vulkan)
    }

    /// # Safety
    /// `physical_device` and `surface` must come from this instance.
    pub unsafe fn get_surface_capabilities(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<vk::SurfaceCapabilitiesKHR, SurfaceQueryError> {
        // SAFETY: caller guarantees provenance.
        unsafe {
            self.surface_instance
                .get_physical_device_surface_capabilities(physical_device, surface)
        }
        .map_err(SurfaceQueryError::Vulkan)
    }

    /// # Safety
    /// `physical_device` and `surface` must come from this instance.
    pub unsafe fn get_surface_formats(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Vec<vk::SurfaceFormatKHR>, SurfaceQueryError> {
        // SAFETY: caller guarantees provenance.
        unsafe {
            self.surface_instance
                .get_physical_device_surface_formats(physical_device, surface)
        }
        .map_err(SurfaceQueryError::Vulkan)
    }

    /// # Safety
    /// `physical_device` and `surface` must come from this instance.
    pub unsafe fn get_surface_present_modes(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Vec<vk::PresentModeKHR>, SurfaceQueryError> {
        // SAFETY: caller guarantees provenance.
        unsafe {
            self.surface_instance
                .get_physical_device_surface_present_modes(
                    physical_device,
                    surface,
                )
        }
        .map_err(SurfaceQueryError::Vulkan)
    }
}

// ---------------------------------------------------------------------------
// Device extension loaders
// ---------------------------------------------------------------------------

impl Instance {
    pub fn create_swapchain_loader(
        &self,
        device: &ash::Device,
    ) -> ash::khr::swapchain::Device {
        ash::khr::swapchain::Device::new(&self.handle, device)
    }

    pub fn create_dynamic_rendering_loader(
        &self,
        device: &ash::Device,
    ) -> ash::khr::dynamic_rendering::Device {
        ash::khr::dynamic_rendering::Device::new(&self.handle, device)
    }

    pub fn create_synchronization2_loader(
        &self,
        device: &ash::Device,
    ) -> ash::khr::synchronization2::Device {
        ash::khr::synchronization2::Device::new(&self.handle, device)
    }

    /// `None` unless the debug messenger is active.
    pub fn create_debug_utils_device_loader(
        &self,
        device: &ash::Device,
    ) -> Option<ash::ext::debug_utils::Device> {
        self.debug_messenger
            .as_ref()
            .map(|_| ash::ext::debug_utils::Device::new(&self.handle, device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_comparison_ignores_patch() {
        let driver = VkVersion::new(1, 3, 250);
        assert!(driver.at_least(VkVersion::V1_3));
        assert!(driver.at_least(VkVersion::V1_1));
        assert!(!VkVersion::new(1, 2, 999).at_least(VkVersion::V1_3));
    }

    #[test]
    fn version_components_decode() {
        let version = VkVersion::from_raw(vk::make_api_version(0, 1, 3, 275));
        assert_eq!(version.major(), 1);
        assert_eq!(version.minor(), 3);
        assert_eq!(version.patch(), 275);
        assert_eq!(version.to_string(), "1.3.275");
    }

    #[test]
    fn verbose_logging_includes_every_severity() {
        use vk::DebugUtilsMessageSeverityFlagsEXT as Sev;
        let flags = VulkanLogLevel::Verbose.severity_flags();
        assert!(flags.contains(Sev::VERBOSE | Sev::INFO | Sev::ERROR));
        assert_eq!(VulkanLogLevel::Error.severity_flags(), Sev::ERROR);
        assert!(!VulkanLogLevel::Warning.severity_flags().contains(Sev::INFO));
    }
}
