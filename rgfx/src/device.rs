//! Logical device wrapper ([`Device`]).
//!
//! `Device` owns the `VkDevice` together with its `gpu-allocator`
//! allocator, the swapchain / dynamic rendering / synchronization2 /
//! debug utils loaders, one queue per [`QueueRole`] and the depth formats
//! detected for the chosen GPU.
//!
//! Selection itself lives in [`crate::device_select`]; this module only
//! gathers [`PhysicalDeviceCandidate`]s from the driver and turns the
//! winning evaluation into a logical device.
//!
//! Raw Vulkan calls on the device are `unsafe fn` methods named with a
//! `raw_` infix (e.g. `create_raw_buffer`) or a `cmd_` prefix for
//! recording commands. Sibling modules call these instead of reaching
//! into `ash::Device`.

use std::collections::BTreeMap;
use std::ffi::{CStr, CString};
use std::sync::{Arc, Mutex};

use ash::vk;
use gpu_allocator::{
    AllocationError, MemoryLocation,
    vulkan::{
        Allocation, AllocationCreateDesc, AllocationScheme, Allocator,
        AllocatorCreateDesc,
    },
};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::{
    device_select::{
        DeviceRequirements, Evaluation, PhysicalDeviceCandidate,
        QueueFamilyInfo, QueueMode, QueueRole, SelectDeviceError,
        select_candidate,
    },
    format::{DepthFormats, DetectDepthFormatError},
    instance::{FetchPhysicalDeviceError, Instance, VkVersion},
    surface::Surface,
};

enum DynamicRenderingLoader {
    Core,
    Extension(ash::khr::dynamic_rendering::Device),
}

enum Synchronization2Loader {
    Core,
    Extension(ash::khr::synchronization2::Device),
}

/// How an allocation is accessed by the host and the GPU.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryUsage {
    /// GPU-only storage, not mappable.
    GpuOnly,
    /// Host writes, GPU reads. Staging and persistently mapped buffers.
    CpuToGpu,
    /// GPU writes, host reads.
    GpuToCpu,
}

/// A queue shared by every role assigned to the same `(family, index)`.
#[derive(Clone)]
struct RoleQueue {
    queue: Arc<Mutex<vk::Queue>>,
    family: u32,
}

/// A logical device and the per-device state hanging off it.
pub struct Device {
    parent: Arc<Instance>,
    allocator: Option<Mutex<Allocator>>,
    handle: ash::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    properties: vk::PhysicalDeviceProperties,
    swapchain_device: ash::khr::swapchain::Device,
    debug_utils_device: Option<ash::ext::debug_utils::Device>,
    dynamic_rendering: DynamicRenderingLoader,
    synchronization2: Synchronization2Loader,
    physical_device: vk::PhysicalDevice,
    queues: [RoleQueue; 4],
    depth_formats: DepthFormats,
    descriptor_indexing: bool,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("handle", &self.handle.handle())
            .field("physical_device", &self.physical_device)
            .finish_non_exhaustive()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        tracing::debug!("Dropping device {:?}", self.handle.handle());
        // The allocator frees its memory blocks through the device handle.
        self.allocator = None;
        // SAFETY: every child object holds an Arc<Device>, so none remain.
        unsafe { self.handle.destroy_device(None) };
    }
}

#[derive(Debug, Error)]
pub enum CreateDeviceError {
    #[error("Surface was created from a different instance")]
    MismatchedParams,
    #[error("Host memory exhaustion while creating the device")]
    MemoryExhaustion,
    #[error("Unknown Vulkan error while creating the device: {0}")]
    UnknownVulkan(vk::Result),
    #[error(transparent)]
    Select(#[from] SelectDeviceError),
    #[error("Depth format detection failed: {0}")]
    DepthFormat(#[from] DetectDepthFormatError),
    #[error("Failed to create logical device: {0}")]
    DeviceCreationFailed(vk::Result),
    #[error("Failed to create GPU allocator: {0}")]
    AllocatorCreation(AllocationError),
}

impl From<FetchPhysicalDeviceError> for CreateDeviceError {
    fn from(value: FetchPhysicalDeviceError) -> Self {
        match value {
            FetchPhysicalDeviceError::MemoryExhaustion => Self::MemoryExhaustion,
            FetchPhysicalDeviceError::UnknownVulkan(e) => Self::UnknownVulkan(e),
        }
    }
}

#[derive(Debug, Error)]
pub enum NameObjectError {
    #[error("Invalid Vulkan object name (contains interior NUL): {0}")]
    InvalidName(std::ffi::NulError),
    #[error("Vulkan error setting object name: {0}")]
    Vulkan(vk::Result),
}

/// Collects everything selection needs to know about `physical_device`.
///
/// Query failures on individual properties are logged and treated as
/// "unsupported" so one misbehaving driver entry cannot abort enumeration.
///
/// # Safety
/// `physical_device` and `surface` must come from `instance`.
unsafe fn gather_candidate<T: HasDisplayHandle + HasWindowHandle>(
    instance: &Instance,
    surface: &Surface<T>,
    physical_device: vk::PhysicalDevice,
) -> PhysicalDeviceCandidate {
    // SAFETY: provenance is forwarded from the caller for every query
    // below.
    unsafe {
        let props = instance.get_raw_physical_device_properties(physical_device);
        let name = props
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_owned());

        let extensions = instance
            .enumerate_raw_device_extension_properties(physical_device)
            .inspect_err(|e| tracing::debug!("{name}: failed to enumerate extensions: {e}"))
            .unwrap_or_default()
            .iter()
            .filter_map(|ext| ext.extension_name_as_c_str().ok())
            .map(CString::from)
            .collect();

        let queue_families = instance
            .get_raw_physical_device_queue_family_properties(physical_device)
            .iter()
            .enumerate()
            .map(|(idx, family)| QueueFamilyInfo {
                flags: family.queue_flags,
                queue_count: family.queue_count,
                supports_present: surface
                    .supports_queue_family(physical_device, idx as u32)
                    .unwrap_or(false),
            })
            .collect();

        let (surface_format_count, present_mode_count) =
            match surface.query_support(physical_device) {
                Ok(support) => (support.formats.len(), support.present_modes.len()),
                Err(e) => {
                    tracing::debug!("{name}: surface query failed: {e}");
                    (0, 0)
                }
            };

        PhysicalDeviceCandidate {
            name,
            device_type: props.device_type,
            api_version: VkVersion::from_raw(props.api_version),
            extensions,
            queue_families,
            surface_format_count,
            present_mode_count,
            descriptor_indexing: instance.get_raw_descriptor_indexing_support(physical_device),
        }
    }
}

/// Maps each role to a `(family, queue index)` pair and returns the
/// number of queues to request per family.
fn plan_queues(
    eval: &Evaluation,
    families: &[QueueFamilyInfo],
    mode: QueueMode,
) -> ([(u32, u32); 4], BTreeMap<u32, u32>) {
    let mut counts: BTreeMap<u32, u32> = BTreeMap::new();
    let mut slots = [(0, 0); 4];

    for (slot, role) in [QueueRole::Graphics, QueueRole::Compute, QueueRole::Transfer]
        .into_iter()
        .enumerate()
    {
        let family = eval.queues.family(role);
        let available = families[family as usize].queue_count.max(1);
        let used = counts.entry(family).or_insert(0);
        let index = if mode == QueueMode::Single {
            0
        } else {
            (*used).min(available - 1)
        };
        *used = (*used).max(index + 1);
        slots[slot] = (family, index);
    }

    // Present shares an existing queue whenever its family already has one.
    let present_family = eval.queues.present;
    slots[3] = slots[..3]
        .iter()
        .copied()
        .find(|(family, _)| *family == present_family)
        .unwrap_or_else(|| {
            counts.insert(present_family, 1);
            (present_family, 0)
        });

    (slots, counts)
}

impl Device {
    /// Picks the best physical device for `surface` and creates a logical
    /// device on it. Returns [`CreateDeviceError::Select`] when nothing
    /// qualifies.
    pub fn create<T: HasDisplayHandle + HasWindowHandle>(
        instance: &Arc<Instance>,
        surface: &Surface<T>,
        requirements: &DeviceRequirements,
    ) -> Result<Self, CreateDeviceError> {
        if !Arc::ptr_eq(surface.parent(), instance) {
            return Err(CreateDeviceError::MismatchedParams);
        }

        let physical_devices = instance.fetch_raw_physical_devices()?;
        let candidates: Vec<PhysicalDeviceCandidate> = physical_devices
            .iter()
            // SAFETY: every handle was enumerated from this instance and the
            // surface was checked to share it.
            .map(|&pd| unsafe { gather_candidate(instance, surface, pd) })
            .collect();

        let (chosen, eval) = select_candidate(&candidates, requirements)?;
        let physical_device = physical_devices[chosen];
        let candidate = &candidates[chosen];

        // SAFETY: physical_device was enumerated from this instance.
        let properties = unsafe { instance.get_raw_physical_device_properties(physical_device) };
        // SAFETY: as above.
        let memory_properties =
            unsafe { instance.get_raw_physical_device_memory_properties(physical_device) };
        let depth_formats = DepthFormats::detect(|format| {
            // SAFETY: as above.
            unsafe { instance.get_raw_physical_device_format_properties(physical_device, format) }
        })?;

        tracing::info!(
            "Selected physical device {:?} ({:?}, Vulkan {}), queues {:?}, depth formats {:?}",
            candidate.name,
            candidate.device_type,
            candidate.api_version,
            eval.queues,
            depth_formats
        );

        let (slots, counts) =
            plan_queues(&eval, &candidate.queue_families, requirements.queue_mode);
        let priorities: Vec<Vec<f32>> = counts.values().map(|&n| vec![1.0; n as usize]).collect();
        let queue_infos: Vec<vk::DeviceQueueCreateInfo<'_>> = counts
            .keys()
            .zip(&priorities)
            .map(|(&family, prio)| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(prio)
            })
            .collect();

        let ext_ptrs: Vec<*const std::ffi::c_char> =
            eval.extensions.iter().map(|e| e.as_ptr()).collect();

        let mut sync2_features =
            vk::PhysicalDeviceSynchronization2Features::default().synchronization2(true);
        let mut dr_features =
            vk::PhysicalDeviceDynamicRenderingFeatures::default().dynamic_rendering(true);
        let support = candidate.descriptor_indexing;
        let mut indexing_features = vk::PhysicalDeviceDescriptorIndexingFeatures::default()
            .runtime_descriptor_array(support.runtime_array)
            .descriptor_binding_partially_bound(support.partially_bound)
            .descriptor_binding_variable_descriptor_count(support.variable_count)
            .descriptor_binding_sampled_image_update_after_bind(
                support.sampled_image_update_after_bind,
            )
            .descriptor_binding_storage_buffer_update_after_bind(
                support.storage_buffer_update_after_bind,
            )
            .shader_sampled_image_array_non_uniform_indexing(
                support.non_uniform_sampled_image_indexing,
            );

        let mut create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&ext_ptrs)
            .push_next(&mut sync2_features)
            .push_next(&mut dr_features);
        if requirements.descriptor_indexing {
            create_info = create_info.push_next(&mut indexing_features);
        }

        // SAFETY: physical_device comes from this instance and create_info
        // only points at locals that outlive the call.
        let device = unsafe { instance.create_ash_device(physical_device, &create_info) }
            .map_err(CreateDeviceError::DeviceCreationFailed)?;

        let mut shared: Vec<((u32, u32), Arc<Mutex<vk::Queue>>)> = Vec::new();
        let queues = slots.map(|(family, index)| {
            let queue = match shared.iter().find(|(key, _)| *key == (family, index)) {
                Some((_, queue)) => Arc::clone(queue),
                None => {
                    // SAFETY: (family, index) was requested in queue_infos.
                    let raw = unsafe { device.get_device_queue(family, index) };
                    let queue = Arc::new(Mutex::new(raw));
                    shared.push(((family, index), Arc::clone(&queue)));
                    queue
                }
            };
            RoleQueue { queue, family }
        });

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.ash_instance().clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(CreateDeviceError::AllocatorCreation)?;

        let (dynamic_rendering, synchronization2) = if eval.uses_khr_fallbacks {
            (
                DynamicRenderingLoader::Extension(
                    instance.create_dynamic_rendering_loader(&device),
                ),
                Synchronization2Loader::Extension(instance.create_synchronization2_loader(&device)),
            )
        } else {
            (DynamicRenderingLoader::Core, Synchronization2Loader::Core)
        };

        Ok(Self {
            parent: Arc::clone(instance),
            allocator: Some(Mutex::new(allocator)),
            memory_properties,
            properties,
            swapchain_device: instance.create_swapchain_loader(&device),
            debug_utils_device: instance.create_debug_utils_device_loader(&device),
            dynamic_rendering,
            synchronization2,
            handle: device,
            physical_device,
            queues,
            depth_formats,
            descriptor_indexing: requirements.descriptor_indexing,
        })
    }

    pub fn parent(&self) -> &Arc<Instance> {
        &self.parent
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn non_coherent_atom_size(&self) -> vk::DeviceSize {
        self.properties.limits.non_coherent_atom_size
    }

    pub fn min_uniform_buffer_offset_alignment(&self) -> vk::DeviceSize {
        self.properties.limits.min_uniform_buffer_offset_alignment
    }

    pub fn min_storage_buffer_offset_alignment(&self) -> vk::DeviceSize {
        self.properties.limits.min_storage_buffer_offset_alignment
    }

    pub fn depth_formats(&self) -> DepthFormats {
        self.depth_formats
    }

    /// Whether descriptor indexing features were enabled at creation.
    pub fn descriptor_indexing_enabled(&self) -> bool {
        self.descriptor_indexing
    }

    pub fn queue_family(&self, role: QueueRole) -> u32 {
        self.role_queue(role).family
    }

    fn role_queue(&self, role: QueueRole) -> &RoleQueue {
        match role {
            QueueRole::Graphics => &self.queues[0],
            QueueRole::Compute => &self.queues[1],
            QueueRole::Transfer => &self.queues[2],
            QueueRole::Present => &self.queues[3],
        }
    }

    /// Blocks until every queue is idle. Used on teardown and resize, never
    /// per frame.
    pub fn wait_idle(&self) -> Result<(), vk::Result> {
        let _span = tracing::debug_span!("device_wait_idle").entered();
        // SAFETY: the device is alive; this call has no pointer arguments.
        unsafe { self.handle.device_wait_idle() }
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

impl Device {
    /// Preference of a memory type for `usage`, `None` when incompatible.
    fn score_memory_type(
        flags: vk::MemoryPropertyFlags,
        usage: MemoryUsage,
    ) -> Option<u32> {
        use vk::MemoryPropertyFlags as F;
        let device_local = flags.contains(F::DEVICE_LOCAL);
        let host_visible = flags.contains(F::HOST_VISIBLE);
        let host_cached = flags.contains(F::HOST_CACHED);
        match usage {
            MemoryUsage::GpuOnly => {
                device_local.then_some(if host_visible { 1 } else { 2 })
            }
            MemoryUsage::CpuToGpu => {
                host_visible.then_some(if device_local { 2 } else { 1 })
            }
            MemoryUsage::GpuToCpu => {
                host_visible.then_some(if host_cached { 2 } else { 1 })
            }
        }
    }

    fn select_memory_type(
        &self,
        requirements: vk::MemoryRequirements,
        usage: MemoryUsage,
    ) -> Option<u32> {
        self.memory_properties.memory_types
            [..self.memory_properties.memory_type_count as usize]
            .iter()
            .enumerate()
            .filter(|(i, _)| requirements.memory_type_bits & (1 << i) != 0)
            .filter_map(|(i, ty)| {
                Self::score_memory_type(ty.property_flags, usage)
                    .map(|s| (i as u32, s))
            })
            .max_by(|(i1, s1), (i2, s2)| s1.cmp(s2).then(i2.cmp(i1)))
            .map(|(i, _)| i)
    }

    /// Whether `memory_type_index` needs explicit flushes after host writes.
    pub fn is_memory_type_non_coherent(&self, memory_type_index: u32) -> bool {
        use vk::MemoryPropertyFlags as F;
        let flags = self.memory_properties.memory_types
            [memory_type_index as usize]
            .property_flags;
        flags.contains(F::HOST_VISIBLE) && !flags.contains(F::HOST_COHERENT)
    }

    /// Allocates memory through `gpu-allocator`.
    ///
    /// The memory type is narrowed to the best match for `usage`. On
    /// host-visible but non-coherent types the size and alignment are
    /// padded to `nonCoherentAtomSize` so flushes of whole records stay in
    /// bounds.
    pub fn allocate_memory(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        usage: MemoryUsage,
        linear: bool,
    ) -> Result<Allocation, AllocationError> {
        let atom = self.non_coherent_atom_size();
        let requirements = match self.select_memory_type(requirements, usage) {
            Some(idx) => {
                let (size, alignment) = if self.is_memory_type_non_coherent(idx) {
                    (
                        requirements.size.div_ceil(atom) * atom,
                        requirements.alignment.max(atom),
                    )
                } else {
                    (requirements.size, requirements.alignment)
                };
                vk::MemoryRequirements {
                    size,
                    alignment,
                    memory_type_bits: 1 << idx,
                }
            }
            None => requirements,
        };
        let location = match usage {
            MemoryUsage::GpuOnly => MemoryLocation::GpuOnly,
            MemoryUsage::CpuToGpu => MemoryLocation::CpuToGpu,
            MemoryUsage::GpuToCpu => MemoryLocation::GpuToCpu,
        };
        let mut allocator = self
            .allocator
            .as_ref()
            .expect("allocator is dropped only during Device::drop")
            .lock()
            .expect("allocator lock poisoned");
        allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
    }

    pub fn free_memory(&self, allocation: Allocation) -> Result<(), AllocationError> {
        let mut allocator = self
            .allocator
            .as_ref()
            .expect("allocator is dropped only during Device::drop")
            .lock()
            .expect("allocator lock poisoned");
        allocator.free(allocation)
    }

    /// # Safety
    /// Every range must lie within mapped memory allocated from this
    /// device, aligned to `nonCoherentAtomSize`.
    pub unsafe fn flush_raw_mapped_memory_ranges(
        &self,
        ranges: &[vk::MappedMemoryRange<'_>],
    ) -> Result<(), vk::Result> {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.flush_mapped_memory_ranges(ranges) }
    }

    /// # Safety
    /// Same requirements as
    /// [`flush_raw_mapped_memory_ranges`](Self::flush_raw_mapped_memory_ranges).
    pub unsafe fn invalidate_raw_mapped_memory_ranges(
        &self,
        ranges: &[vk::MappedMemoryRange<'_>],
    ) -> Result<(), vk::Result> {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.invalidate_mapped_memory_ranges(ranges) }
    }
}

// ---------------------------------------------------------------------------
// Queues
// ---------------------------------------------------------------------------

impl Device {
    /// Submits to the queue serving `role` with the synchronization2 API.
    ///
    /// # Safety
    /// Every handle in `submits` must come from this device, command
    /// buffers must be executable, and `fence` (if not null) unsignaled.
    pub unsafe fn queue_submit2(
        &self,
        role: QueueRole,
        submits: &[vk::SubmitInfo2<'_>],
        fence: vk::Fence,
    ) -> Result<(), vk::Result> {
        let queue = self
            .role_queue(role)
            .queue
            .lock()
            .expect("queue lock poisoned");
        match &self.synchronization2 {
            // SAFETY: forwarded to the caller; the queue lock is held.
            Synchronization2Loader::Core => unsafe {
                self.handle.queue_submit2(*queue, submits, fence)
            },
            // SAFETY: forwarded to the caller; the queue lock is held.
            Synchronization2Loader::Extension(loader) => unsafe {
                loader.queue_submit2(*queue, submits, fence)
            },
        }
    }

    /// Presents on the present queue. `Ok(true)` means suboptimal.
    ///
    /// # Safety
    /// Handles in `present_info` must come from this device and the images
    /// must be in `PRESENT_SRC_KHR`.
    pub unsafe fn queue_present(
        &self,
        present_info: &vk::PresentInfoKHR<'_>,
    ) -> Result<bool, vk::Result> {
        let queue = self
            .role_queue(QueueRole::Present)
            .queue
            .lock()
            .expect("queue lock poisoned");
        // SAFETY: forwarded to the caller; the queue lock is held.
        unsafe { self.swapchain_device.queue_present(*queue, present_info) }
    }
}

// ---------------------------------------------------------------------------
// Swapchain and views
// ---------------------------------------------------------------------------

impl Device {
    /// # Safety
    /// `create_info` must reference a surface from the parent instance and,
    /// if set, an `old_swapchain` from this device.
    pub unsafe fn create_raw_swapchain(
        &self,
        create_info: &vk::SwapchainCreateInfoKHR<'_>,
    ) -> Result<vk::SwapchainKHR, vk::Result> {
        // SAFETY: forwarded to the caller.
        unsafe { self.swapchain_device.create_swapchain(create_info, None) }
    }

    /// # Safety
    /// `swapchain` must be a live swapchain from this device.
    pub unsafe fn get_raw_swapchain_images(
        &self,
        swapchain: vk::SwapchainKHR,
    ) -> Result<Vec<vk::Image>, vk::Result> {
        // SAFETY: forwarded to the caller.
        unsafe { self.swapchain_device.get_swapchain_images(swapchain) }
    }

    /// # Safety
    /// No view of its images may remain and no GPU work may reference it.
    pub unsafe fn destroy_raw_swapchain(&self, swapchain: vk::SwapchainKHR) {
        // SAFETY: forwarded to the caller.
        unsafe { self.swapchain_device.destroy_swapchain(swapchain, None) };
    }

    /// Returns `(image_index, suboptimal)`.
    ///
    /// # Safety
    /// `swapchain` must come from this device and `semaphore` must be
    /// unsignaled with no pending signal operation.
    pub unsafe fn acquire_next_swapchain_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> Result<(u32, bool), vk::Result> {
        // SAFETY: forwarded to the caller.
        unsafe {
            self.swapchain_device.acquire_next_image(
                swapchain,
                timeout_ns,
                semaphore,
                vk::Fence::null(),
            )
        }
    }

    /// # Safety
    /// `create_info.image` must come from this device.
    pub unsafe fn create_raw_image_view(
        &self,
        create_info: &vk::ImageViewCreateInfo<'_>,
    ) -> Result<vk::ImageView, vk::Result> {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.create_image_view(create_info, None) }
    }

    /// # Safety
    /// No GPU work may still reference `image_view`.
    pub unsafe fn destroy_raw_image_view(&self, image_view: vk::ImageView) {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.destroy_image_view(image_view, None) };
    }
}

// ---------------------------------------------------------------------------
// Images and samplers
// ---------------------------------------------------------------------------

impl Device {
    /// # Safety
    /// `create_info` must be valid for this device.
    pub unsafe fn create_raw_image(
        &self,
        create_info: &vk::ImageCreateInfo<'_>,
    ) -> Result<vk::Image, vk::Result> {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.create_image(create_info, None) }
    }

    /// # Safety
    /// No view or GPU work may still reference `image`.
    pub unsafe fn destroy_raw_image(&self, image: vk::Image) {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.destroy_image(image, None) };
    }

    /// # Safety
    /// `image` must come from this device.
    pub unsafe fn get_raw_image_memory_requirements(
        &self,
        image: vk::Image,
    ) -> vk::MemoryRequirements {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.get_image_memory_requirements(image) }
    }

    /// # Safety
    /// `image` must be unbound and `memory`/`offset` must satisfy its
    /// requirements.
    pub unsafe fn bind_raw_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.bind_image_memory(image, memory, offset) }
    }

    /// # Safety
    /// `create_info` must be valid for this device.
    pub unsafe fn create_raw_sampler(
        &self,
        create_info: &vk::SamplerCreateInfo<'_>,
    ) -> Result<vk::Sampler, vk::Result> {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.create_sampler(create_info, None) }
    }

    /// # Safety
    /// No descriptor in use by the GPU may still reference `sampler`.
    pub unsafe fn destroy_raw_sampler(&self, sampler: vk::Sampler) {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.destroy_sampler(sampler, None) };
    }
}

// ---------------------------------------------------------------------------
// Debug naming
// ---------------------------------------------------------------------------

impl Device {
    /// No-op when debug utils are disabled or `name` is `None`.
    ///
    /// # Safety
    /// `object` must be a live handle owned by this device.
    pub unsafe fn set_object_name<H: vk::Handle>(
        &self,
        object: H,
        name: Option<&CStr>,
    ) -> Result<(), NameObjectError> {
        let (Some(debug_utils), Some(name)) =
            (self.debug_utils_device.as_ref(), name)
        else {
            return Ok(());
        };
        let info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(object)
            .object_name(name);
        // SAFETY: forwarded to the caller.
        unsafe { debug_utils.set_debug_utils_object_name(&info) }
            .map_err(NameObjectError::Vulkan)
    }

    /// # Safety
    /// `object` must be a live handle owned by this device.
    pub unsafe fn set_object_name_str<H: vk::Handle>(
        &self,
        object: H,
        name: Option<&str>,
    ) -> Result<(), NameObjectError> {
        if self.debug_utils_device.is_none() {
            return Ok(());
        }
        let name = name
            .map(CString::new)
            .transpose()
            .map_err(NameObjectError::InvalidName)?;
        // SAFETY: forwarded to the caller.
        unsafe { self.set_object_name(object, name.as_deref()) }
    }

    /// Names `object` and logs instead of failing.
    ///
    /// # Safety
    /// `object` must be a live handle owned by this device.
    pub unsafe fn name_or_warn<H: vk::Handle + std::fmt::Debug + Copy>(
        &self,
        object: H,
        name: Option<&str>,
    ) {
        // SAFETY: forwarded to the caller.
        if let Err(e) = unsafe { self.set_object_name_str(object, name) } {
            tracing::warn!("Failed to name {object:?} as {name:?}: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Shaders and pipelines
// ---------------------------------------------------------------------------

impl Device {
    /// # Safety
    /// `create_info` must hold valid SPIR-V.
    pub unsafe fn create_raw_shader_module(
        &self,
        create_info: &vk::ShaderModuleCreateInfo<'_>,
    ) -> Result<vk::ShaderModule, vk::Result> {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.create_shader_module(create_info, None) }
    }

    /// # Safety
    /// `module` must come from this device.
    pub unsafe fn destroy_raw_shader_module(&self, module: vk::ShaderModule) {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.destroy_shader_module(module, None) };
    }

    /// # Safety
    /// Every set layout referenced must come from this device.
    pub unsafe fn create_raw_pipeline_layout(
        &self,
        create_info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> Result<vk::PipelineLayout, vk::Result> {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.create_pipeline_layout(create_info, None) }
    }

    /// # Safety
    /// No pipeline using `layout` may be in use.
    pub unsafe fn destroy_raw_pipeline_layout(&self, layout: vk::PipelineLayout) {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.destroy_pipeline_layout(layout, None) };
    }

    /// Creates one graphics pipeline. Partially created handles from a
    /// failed batch are destroyed before returning the error.
    ///
    /// # Safety
    /// `create_info` and its whole pointer graph must be valid for this
    /// device.
    pub unsafe fn create_raw_graphics_pipeline(
        &self,
        create_info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> Result<vk::Pipeline, vk::Result> {
        // SAFETY: forwarded to the caller.
        unsafe {
            self.handle.create_graphics_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(create_info),
                None,
            )
        }
        .map_err(|(partial, result)| {
            for p in partial.into_iter().filter(|p| *p != vk::Pipeline::null()) {
                // SAFETY: p was just created by this device and never used.
                unsafe { self.handle.destroy_pipeline(p, None) };
            }
            result
        })
        .and_then(|pipelines| {
            pipelines
                .into_iter()
                .next()
                .ok_or(vk::Result::ERROR_UNKNOWN)
        })
    }

    /// # Safety
    /// No GPU work may still reference `pipeline`.
    pub unsafe fn destroy_raw_pipeline(&self, pipeline: vk::Pipeline) {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.destroy_pipeline(pipeline, None) };
    }
}

// ---------------------------------------------------------------------------
// Buffers
// ---------------------------------------------------------------------------

impl Device {
    /// # Safety
    /// `create_info` must be valid for this device.
    pub unsafe fn create_raw_buffer(
        &self,
        create_info: &vk::BufferCreateInfo<'_>,
    ) -> Result<vk::Buffer, vk::Result> {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.create_buffer(create_info, None) }
    }

    /// # Safety
    /// No GPU work may still reference `buffer`.
    pub unsafe fn destroy_raw_buffer(&self, buffer: vk::Buffer) {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.destroy_buffer(buffer, None) };
    }

    /// # Safety
    /// `buffer` must come from this device.
    pub unsafe fn get_raw_buffer_memory_requirements(
        &self,
        buffer: vk::Buffer,
    ) -> vk::MemoryRequirements {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.get_buffer_memory_requirements(buffer) }
    }

    /// # Safety
    /// `buffer` must be unbound and `memory`/`offset` must satisfy its
    /// requirements.
    pub unsafe fn bind_raw_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.bind_buffer_memory(buffer, memory, offset) }
    }
}

// ---------------------------------------------------------------------------
// Command pools and buffers
// ---------------------------------------------------------------------------

impl Device {
    /// # Safety
    /// `create_info.queue_family_index` must be a family of this device.
    pub unsafe fn create_raw_command_pool(
        &self,
        create_info: &vk::CommandPoolCreateInfo<'_>,
    ) -> Result<vk::CommandPool, vk::Result> {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.create_command_pool(create_info, None) }
    }

    /// # Safety
    /// No command buffer from `pool` may be pending.
    pub unsafe fn destroy_raw_command_pool(&self, pool: vk::CommandPool) {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.destroy_command_pool(pool, None) };
    }

    /// # Safety
    /// `allocate_info.command_pool` must come from this device.
    pub unsafe fn allocate_raw_command_buffers(
        &self,
        allocate_info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> Result<Vec<vk::CommandBuffer>, vk::Result> {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.allocate_command_buffers(allocate_info) }
    }

    /// # Safety
    /// `command_buffer` must not be pending or recording.
    pub unsafe fn begin_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::CommandBufferBeginInfo<'_>,
    ) -> Result<(), vk::Result> {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.begin_command_buffer(command_buffer, begin_info) }
    }

    /// # Safety
    /// `command_buffer` must be recording.
    pub unsafe fn end_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.end_command_buffer(command_buffer) }
    }

    /// # Safety
    /// `command_buffer` must not be pending and its pool must allow
    /// individual resets.
    pub unsafe fn reset_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferResetFlags,
    ) -> Result<(), vk::Result> {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.reset_command_buffer(command_buffer, flags) }
    }

    /// # Safety
    /// All buffers must come from `pool` and none may be pending.
    pub unsafe fn free_raw_command_buffers(
        &self,
        pool: vk::CommandPool,
        command_buffers: &[vk::CommandBuffer],
    ) {
        if command_buffers.is_empty() {
            return;
        }
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.free_command_buffers(pool, command_buffers) }
    }
}

// ---------------------------------------------------------------------------
// Recording commands
// ---------------------------------------------------------------------------

impl Device {
    /// # Safety
    /// `command_buffer` must be recording and `dependency_info` consistent
    /// with the current resource states.
    pub unsafe fn cmd_pipeline_barrier2(
        &self,
        command_buffer: vk::CommandBuffer,
        dependency_info: &vk::DependencyInfo<'_>,
    ) {
        match &self.synchronization2 {
            // SAFETY: forwarded to the caller.
            Synchronization2Loader::Core => unsafe {
                self.handle
                    .cmd_pipeline_barrier2(command_buffer, dependency_info)
            },
            // SAFETY: forwarded to the caller.
            Synchronization2Loader::Extension(loader) => unsafe {
                loader.cmd_pipeline_barrier2(command_buffer, dependency_info)
            },
        }
    }

    /// # Safety
    /// `command_buffer` must be recording outside a rendering scope and all
    /// attachments must be in the layouts `rendering_info` names.
    pub unsafe fn cmd_begin_raw_rendering(
        &self,
        command_buffer: vk::CommandBuffer,
        rendering_info: &vk::RenderingInfo<'_>,
    ) {
        match &self.dynamic_rendering {
            // SAFETY: forwarded to the caller.
            DynamicRenderingLoader::Core => unsafe {
                self.handle
                    .cmd_begin_rendering(command_buffer, rendering_info)
            },
            // SAFETY: forwarded to the caller.
            DynamicRenderingLoader::Extension(loader) => unsafe {
                loader.cmd_begin_rendering(command_buffer, rendering_info)
            },
        }
    }

    /// # Safety
    /// `command_buffer` must be inside a rendering scope.
    pub unsafe fn cmd_end_raw_rendering(&self, command_buffer: vk::CommandBuffer) {
        match &self.dynamic_rendering {
            // SAFETY: forwarded to the caller.
            DynamicRenderingLoader::Core => unsafe {
                self.handle.cmd_end_rendering(command_buffer)
            },
            // SAFETY: forwarded to the caller.
            DynamicRenderingLoader::Extension(loader) => unsafe {
                loader.cmd_end_rendering(command_buffer)
            },
        }
    }

    /// # Safety
    /// `command_buffer` must be recording and `pipeline` must come from
    /// this device.
    pub unsafe fn cmd_bind_graphics_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        pipeline: vk::Pipeline,
    ) {
        // SAFETY: forwarded to the caller.
        unsafe {
            self.handle.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline,
            )
        }
    }

    /// # Safety
    /// `command_buffer` must be recording, `layout` compatible with the
    /// bound pipeline, and `dynamic_offsets` must have one entry per
    /// dynamic descriptor in the sets.
    pub unsafe fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        first_set: u32,
        descriptor_sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        // SAFETY: forwarded to the caller.
        unsafe {
            self.handle.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                first_set,
                descriptor_sets,
                dynamic_offsets,
            )
        }
    }

    /// # Safety
    /// `command_buffer` must be recording and the range must lie within a
    /// push constant range of `layout` for `stages`.
    pub unsafe fn cmd_push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        // SAFETY: forwarded to the caller.
        unsafe {
            self.handle
                .cmd_push_constants(command_buffer, layout, stages, offset, data)
        }
    }

    /// # Safety
    /// `command_buffer` must be recording; `buffers` and `offsets` must
    /// have equal length.
    pub unsafe fn cmd_bind_vertex_buffers(
        &self,
        command_buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        // SAFETY: forwarded to the caller.
        unsafe {
            self.handle.cmd_bind_vertex_buffers(
                command_buffer,
                first_binding,
                buffers,
                offsets,
            )
        }
    }

    /// # Safety
    /// `command_buffer` must be recording; `buffer` must have index usage.
    pub unsafe fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        // SAFETY: forwarded to the caller.
        unsafe {
            self.handle
                .cmd_bind_index_buffer(command_buffer, buffer, offset, index_type)
        }
    }

    /// # Safety
    /// `command_buffer` must be recording with in-bounds regions.
    pub unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.cmd_copy_buffer(command_buffer, src, dst, regions) }
    }

    /// # Safety
    /// `command_buffer` must be recording and `dst` must be in
    /// `TRANSFER_DST_OPTIMAL` for every region.
    pub unsafe fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        regions: &[vk::BufferImageCopy],
    ) {
        // SAFETY: forwarded to the caller.
        unsafe {
            self.handle.cmd_copy_buffer_to_image(
                command_buffer,
                src,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                regions,
            )
        }
    }

    /// # Safety
    /// `command_buffer` must be recording and `src` must be in
    /// `TRANSFER_SRC_OPTIMAL` for every region.
    pub unsafe fn cmd_copy_image_to_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        // SAFETY: forwarded to the caller.
        unsafe {
            self.handle.cmd_copy_image_to_buffer(
                command_buffer,
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                regions,
            )
        }
    }

    /// # Safety
    /// `command_buffer` must be recording with a pipeline that declares
    /// dynamic viewport state.
    pub unsafe fn cmd_set_viewport(
        &self,
        command_buffer: vk::CommandBuffer,
        viewports: &[vk::Viewport],
    ) {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.cmd_set_viewport(command_buffer, 0, viewports) }
    }

    /// # Safety
    /// `command_buffer` must be recording with a pipeline that declares
    /// dynamic scissor state.
    pub unsafe fn cmd_set_scissor(
        &self,
        command_buffer: vk::CommandBuffer,
        scissors: &[vk::Rect2D],
    ) {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.cmd_set_scissor(command_buffer, 0, scissors) }
    }

    /// # Safety
    /// Must be inside a rendering scope with a pipeline bound and its
    /// dynamic state set.
    pub unsafe fn cmd_draw(
        &self,
        command_buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        // SAFETY: forwarded to the caller.
        unsafe {
            self.handle.cmd_draw(
                command_buffer,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            )
        }
    }

    /// # Safety
    /// Same as [`cmd_draw`](Self::cmd_draw), plus an index buffer bound.
    pub unsafe fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        // SAFETY: forwarded to the caller.
        unsafe {
            self.handle.cmd_draw_indexed(
                command_buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        }
    }
}

// ---------------------------------------------------------------------------
// Fences and semaphores
// ---------------------------------------------------------------------------

impl Device {
    /// # Safety
    /// `create_info` must be valid.
    pub unsafe fn create_raw_fence(
        &self,
        create_info: &vk::FenceCreateInfo<'_>,
    ) -> Result<vk::Fence, vk::Result> {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.create_fence(create_info, None) }
    }

    /// # Safety
    /// `fence` must not be associated with pending work.
    pub unsafe fn destroy_raw_fence(&self, fence: vk::Fence) {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.destroy_fence(fence, None) };
    }

    /// # Safety
    /// Every fence must come from this device.
    pub unsafe fn wait_for_raw_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> Result<(), vk::Result> {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.wait_for_fences(fences, wait_all, timeout_ns) }
    }

    /// # Safety
    /// No fence may be pending on a queue.
    pub unsafe fn reset_raw_fences(&self, fences: &[vk::Fence]) -> Result<(), vk::Result> {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.reset_fences(fences) }
    }

    /// # Safety
    /// `fence` must come from this device.
    pub unsafe fn get_raw_fence_status(&self, fence: vk::Fence) -> Result<bool, vk::Result> {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.get_fence_status(fence) }
    }

    /// # Safety
    /// `create_info` must be valid.
    pub unsafe fn create_raw_semaphore(
        &self,
        create_info: &vk::SemaphoreCreateInfo<'_>,
    ) -> Result<vk::Semaphore, vk::Result> {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.create_semaphore(create_info, None) }
    }

    /// # Safety
    /// No queue operation may wait on or signal `semaphore` any more.
    pub unsafe fn destroy_raw_semaphore(&self, semaphore: vk::Semaphore) {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.destroy_semaphore(semaphore, None) };
    }
}

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

impl Device {
    /// # Safety
    /// `create_info` and any chained binding flags must be valid.
    pub unsafe fn create_raw_descriptor_set_layout(
        &self,
        create_info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> Result<vk::DescriptorSetLayout, vk::Result> {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.create_descriptor_set_layout(create_info, None) }
    }

    /// # Safety
    /// `layout` must come from this device.
    pub unsafe fn destroy_raw_descriptor_set_layout(
        &self,
        layout: vk::DescriptorSetLayout,
    ) {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.destroy_descriptor_set_layout(layout, None) };
    }

    /// # Safety
    /// `create_info` must be valid.
    pub unsafe fn create_raw_descriptor_pool(
        &self,
        create_info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> Result<vk::DescriptorPool, vk::Result> {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.create_descriptor_pool(create_info, None) }
    }

    /// # Safety
    /// No set from `pool` may be referenced by pending GPU work.
    pub unsafe fn destroy_raw_descriptor_pool(&self, pool: vk::DescriptorPool) {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.destroy_descriptor_pool(pool, None) };
    }

    /// # Safety
    /// No set from `pool` may be referenced by pending GPU work.
    pub unsafe fn reset_raw_descriptor_pool(
        &self,
        pool: vk::DescriptorPool,
    ) -> Result<(), vk::Result> {
        // SAFETY: forwarded to the caller.
        unsafe {
            self.handle
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())
        }
    }

    /// # Safety
    /// The pool and layouts in `alloc_info` must come from this device.
    pub unsafe fn allocate_raw_descriptor_sets(
        &self,
        alloc_info: &vk::DescriptorSetAllocateInfo<'_>,
    ) -> Result<Vec<vk::DescriptorSet>, vk::Result> {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.allocate_descriptor_sets(alloc_info) }
    }

    /// # Safety
    /// Sets without update-after-bind bindings must not be in use by pending
    /// work; referenced buffers and views must stay alive while bound.
    pub unsafe fn update_raw_descriptor_sets(
        &self,
        writes: &[vk::WriteDescriptorSet<'_>],
    ) {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.update_descriptor_sets(writes, &[]) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_select::QueueFamilyAssignment;

    fn eval(queues: QueueFamilyAssignment) -> Evaluation {
        Evaluation {
            queues,
            extensions: Vec::new(),
            uses_khr_fallbacks: false,
        }
    }

    fn fam(count: u32) -> QueueFamilyInfo {
        QueueFamilyInfo {
            flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
            queue_count: count,
            supports_present: true,
        }
    }

    #[test]
    fn roles_on_one_family_get_distinct_queues_when_available() {
        let e = eval(QueueFamilyAssignment {
            graphics: 0,
            compute: 0,
            transfer: 0,
            present: 0,
        });
        let (slots, counts) = plan_queues(&e, &[fam(16)], QueueMode::Auto);
        assert_eq!(slots, [(0, 0), (0, 1), (0, 2), (0, 0)]);
        assert_eq!(counts[&0], 3);
    }

    #[test]
    fn roles_alias_when_family_has_one_queue() {
        let e = eval(QueueFamilyAssignment {
            graphics: 0,
            compute: 0,
            transfer: 0,
            present: 0,
        });
        let (slots, counts) = plan_queues(&e, &[fam(1)], QueueMode::Auto);
        assert!(slots.iter().all(|s| *s == (0, 0)));
        assert_eq!(counts[&0], 1);
    }

    #[test]
    fn single_mode_uses_one_queue() {
        let e = eval(QueueFamilyAssignment {
            graphics: 0,
            compute: 0,
            transfer: 0,
            present: 0,
        });
        let (slots, counts) = plan_queues(&e, &[fam(16)], QueueMode::Single);
        assert!(slots.iter().all(|s| *s == (0, 0)));
        assert_eq!(counts[&0], 1);
    }

    #[test]
    fn separate_present_family_gets_its_own_queue() {
        let e = eval(QueueFamilyAssignment {
            graphics: 0,
            compute: 1,
            transfer: 1,
            present: 2,
        });
        let (slots, counts) =
            plan_queues(&e, &[fam(1), fam(2), fam(1)], QueueMode::Auto);
        assert_eq!(slots, [(0, 0), (1, 0), (1, 1), (2, 0)]);
        assert_eq!(counts.len(), 3);
    }

    #[test]
    fn memory_scoring_prefers_vram_for_gpu_only() {
        use vk::MemoryPropertyFlags as F;
        assert_eq!(
            Device::score_memory_type(F::DEVICE_LOCAL, MemoryUsage::GpuOnly),
            Some(2)
        );
        assert_eq!(
            Device::score_memory_type(
                F::DEVICE_LOCAL | F::HOST_VISIBLE,
                MemoryUsage::GpuOnly
            ),
            Some(1)
        );
        assert_eq!(
            Device::score_memory_type(F::DEVICE_LOCAL, MemoryUsage::CpuToGpu),
            None
        );
        assert_eq!(
            Device::score_memory_type(
                F::HOST_VISIBLE | F::HOST_CACHED,
                MemoryUsage::GpuToCpu
            ),
            Some(2)
        );
    }
}
