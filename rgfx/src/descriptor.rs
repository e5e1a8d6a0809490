//! Descriptor set layouts, pools and sets.
//!
//! [`DescriptorSetLayout`] carries per-binding flags so a layout can hold
//! partially bound, variable-count, update-after-bind arrays.
//! [`DescriptorSet`] collects writes in a [`PendingWrites`] list and pushes
//! them to the driver in one call on [`flush`](DescriptorSet::flush).

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::descriptor_allocator::{PoolCapacity, PoolLease};
use crate::device::Device;

#[derive(Debug, Error)]
pub enum CreateDescriptorSetLayoutError {
    #[error("Vulkan error creating descriptor set layout: {0}")]
    Vulkan(vk::Result),
    #[error("Binding {0} uses descriptor indexing flags but the device has them disabled")]
    IndexingDisabled(u32),
    #[error("Variable-count binding {0} is not the highest binding in its set")]
    VariableCountNotLast(u32),
}

// ---------------------------------------------------------------------------
// DescriptorBindingDesc
// ---------------------------------------------------------------------------

/// A single binding within a descriptor set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBindingDesc {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    /// Array length, or the upper bound for a variable-count binding.
    pub count: u32,
    pub stage_flags: vk::ShaderStageFlags,
    pub flags: vk::DescriptorBindingFlags,
}

impl DescriptorBindingDesc {
    pub fn new(
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        Self {
            binding,
            descriptor_type,
            count: 1,
            stage_flags,
            flags: vk::DescriptorBindingFlags::empty(),
        }
    }

    /// An unbounded-style sampled texture array: partially bound, variable
    /// count up to `max_count`, and updatable after bind.
    pub fn bindless_textures(
        binding: u32,
        max_count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        Self {
            binding,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            count: max_count,
            stage_flags,
            flags: vk::DescriptorBindingFlags::PARTIALLY_BOUND
                | vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT
                | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(
            self.descriptor_type,
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
        )
    }

    fn raw(&self) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(self.binding)
            .descriptor_type(self.descriptor_type)
            .descriptor_count(self.count)
            .stage_flags(self.stage_flags)
    }
}

/// Layout flags implied by the bindings' flags.
pub fn layout_create_flags(
    bindings: &[DescriptorBindingDesc],
) -> vk::DescriptorSetLayoutCreateFlags {
    if bindings
        .iter()
        .any(|b| b.flags.contains(vk::DescriptorBindingFlags::UPDATE_AFTER_BIND))
    {
        vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL
    } else {
        vk::DescriptorSetLayoutCreateFlags::empty()
    }
}

/// The variable-count binding of a layout, if any. Vulkan only allows it
/// on the highest-numbered binding.
pub fn variable_count_binding(
    bindings: &[DescriptorBindingDesc],
) -> Result<Option<DescriptorBindingDesc>, CreateDescriptorSetLayoutError> {
    let highest = bindings.iter().map(|b| b.binding).max();
    let variable = bindings
        .iter()
        .find(|b| b.flags.contains(vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT));
    match variable {
        Some(b) if Some(b.binding) != highest => {
            Err(CreateDescriptorSetLayoutError::VariableCountNotLast(b.binding))
        }
        other => Ok(other.copied()),
    }
}

// ---------------------------------------------------------------------------
// DescriptorSetLayout
// ---------------------------------------------------------------------------

pub struct DescriptorSetLayout {
    parent: Arc<Device>,
    handle: vk::DescriptorSetLayout,
    bindings: Vec<DescriptorBindingDesc>,
    variable_count: Option<DescriptorBindingDesc>,
}

impl std::fmt::Debug for DescriptorSetLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorSetLayout")
            .field("handle", &self.handle)
            .field("bindings", &self.bindings.len())
            .finish_non_exhaustive()
    }
}

impl DescriptorSetLayout {
    pub fn new(
        device: &Arc<Device>,
        bindings: &[DescriptorBindingDesc],
        name: Option<&str>,
    ) -> Result<Self, CreateDescriptorSetLayoutError> {
        if !device.descriptor_indexing_enabled()
            && let Some(b) = bindings.iter().find(|b| !b.flags.is_empty())
        {
            return Err(CreateDescriptorSetLayoutError::IndexingDisabled(b.binding));
        }
        let variable_count = variable_count_binding(bindings)?;

        let raw_bindings: Vec<_> = bindings.iter().map(DescriptorBindingDesc::raw).collect();
        let binding_flags: Vec<_> = bindings.iter().map(|b| b.flags).collect();
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);
        let mut create_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(layout_create_flags(bindings))
            .bindings(&raw_bindings);
        if binding_flags.iter().any(|f| !f.is_empty()) {
            create_info = create_info.push_next(&mut flags_info);
        }

        // SAFETY: create_info and its chain borrow locals that outlive the
        // call, and the flags were checked against enabled features.
        let handle = unsafe { device.create_raw_descriptor_set_layout(&create_info) }
            .map_err(CreateDescriptorSetLayoutError::Vulkan)?;
        // SAFETY: handle was just created from device.
        unsafe { device.name_or_warn(handle, name) };

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            bindings: bindings.to_vec(),
            variable_count,
        })
    }

    pub fn bindings(&self) -> &[DescriptorBindingDesc] {
        &self.bindings
    }

    pub fn binding(&self, binding: u32) -> Option<&DescriptorBindingDesc> {
        self.bindings.iter().find(|b| b.binding == binding)
    }

    pub fn variable_count_binding(&self) -> Option<&DescriptorBindingDesc> {
        self.variable_count.as_ref()
    }

    /// Number of dynamic offsets a bind of this set must supply.
    pub fn dynamic_offset_count(&self) -> usize {
        self.bindings
            .iter()
            .filter(|b| b.is_dynamic())
            .map(|b| b.count as usize)
            .sum()
    }

    pub fn raw_descriptor_set_layout(&self) -> vk::DescriptorSetLayout {
        self.handle
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        tracing::debug!("Dropping descriptor set layout {:?}", self.handle);
        // SAFETY: pipelines owning this layout idle the device before
        // dropping it.
        unsafe { self.parent.destroy_raw_descriptor_set_layout(self.handle) };
    }
}

// ---------------------------------------------------------------------------
// DescriptorPool
// ---------------------------------------------------------------------------

/// A descriptor pool. Sets allocated from it are freed by
/// [`reset`](Self::reset) or when the pool drops.
pub struct DescriptorPool {
    parent: Arc<Device>,
    handle: vk::DescriptorPool,
}

impl std::fmt::Debug for DescriptorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorPool")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl DescriptorPool {
    pub fn new(
        device: &Arc<Device>,
        capacity: &PoolCapacity,
        update_after_bind: bool,
        name: Option<&str>,
    ) -> Result<Self, vk::Result> {
        let flags = if update_after_bind {
            vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND
        } else {
            vk::DescriptorPoolCreateFlags::empty()
        };
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .flags(flags)
            .max_sets(capacity.max_sets)
            .pool_sizes(&capacity.per_type);
        // SAFETY: create_info borrows capacity for the duration of the call.
        let handle = unsafe { device.create_raw_descriptor_pool(&create_info) }?;
        // SAFETY: handle was just created from device.
        unsafe { device.name_or_warn(handle, name) };
        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    /// Allocates one set of `layout`, sizing its variable-count binding to
    /// `variable_count` when given.
    pub fn allocate(
        &self,
        layout: vk::DescriptorSetLayout,
        variable_count: Option<u32>,
    ) -> Result<vk::DescriptorSet, vk::Result> {
        let layouts = [layout];
        let counts = [variable_count.unwrap_or(0)];
        let mut variable_info = vk::DescriptorSetVariableDescriptorCountAllocateInfo::default()
            .descriptor_counts(&counts);
        let mut alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.handle)
            .set_layouts(&layouts);
        if variable_count.is_some() {
            alloc_info = alloc_info.push_next(&mut variable_info);
        }
        // SAFETY: the pool and layout come from self.parent and the chain
        // borrows locals.
        let sets = unsafe { self.parent.allocate_raw_descriptor_sets(&alloc_info) }?;
        sets.into_iter().next().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    /// # Safety
    /// No set from this pool may be referenced by pending GPU work.
    pub unsafe fn reset(&self) -> Result<(), vk::Result> {
        // SAFETY: forwarded to the caller.
        unsafe { self.parent.reset_raw_descriptor_pool(self.handle) }
    }

    pub fn raw_descriptor_pool(&self) -> vk::DescriptorPool {
        self.handle
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        tracing::debug!("Dropping descriptor pool {:?}", self.handle);
        // SAFETY: the allocator owning this pool is dropped after the device
        // idles.
        unsafe { self.parent.destroy_raw_descriptor_pool(self.handle) };
    }
}

// ---------------------------------------------------------------------------
// PendingWrites
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum WriteInfo {
    Buffer(vk::DescriptorBufferInfo),
    Image(vk::DescriptorImageInfo),
}

#[derive(Debug, Clone, Copy)]
struct PendingWrite {
    binding: u32,
    array_element: u32,
    descriptor_type: vk::DescriptorType,
    info: WriteInfo,
}

/// Ordered descriptor writes waiting for one `vkUpdateDescriptorSets` call.
#[derive(Debug, Default)]
pub struct PendingWrites {
    writes: Vec<PendingWrite>,
}

impl PendingWrites {
    pub fn buffer(
        &mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) {
        self.writes.push(PendingWrite {
            binding,
            array_element: 0,
            descriptor_type,
            info: WriteInfo::Buffer(
                vk::DescriptorBufferInfo::default()
                    .buffer(buffer)
                    .offset(offset)
                    .range(range),
            ),
        });
    }

    pub fn image(
        &mut self,
        binding: u32,
        array_element: u32,
        descriptor_type: vk::DescriptorType,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    ) {
        self.writes.push(PendingWrite {
            binding,
            array_element,
            descriptor_type,
            info: WriteInfo::Image(
                vk::DescriptorImageInfo::default()
                    .image_view(view)
                    .sampler(sampler)
                    .image_layout(layout),
            ),
        });
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Hands every pending write, aimed at `set`, to `submit` in the order
    /// they were added, then clears the list. `submit` is not called when
    /// nothing is pending.
    pub fn flush(
        &mut self,
        set: vk::DescriptorSet,
        submit: impl FnOnce(&[vk::WriteDescriptorSet<'_>]),
    ) {
        if self.writes.is_empty() {
            return;
        }
        let raw: Vec<vk::WriteDescriptorSet<'_>> = self
            .writes
            .iter()
            .map(|w| {
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(w.binding)
                    .dst_array_element(w.array_element)
                    .descriptor_type(w.descriptor_type);
                match &w.info {
                    WriteInfo::Buffer(info) => write.buffer_info(std::slice::from_ref(info)),
                    WriteInfo::Image(info) => write.image_info(std::slice::from_ref(info)),
                }
            })
            .collect();
        submit(&raw);
        drop(raw);
        self.writes.clear();
    }
}

// ---------------------------------------------------------------------------
// DescriptorSet
// ---------------------------------------------------------------------------

/// A set allocated from the growable allocator, plus writes not yet sent
/// to the driver. The set does not own its memory; its pool does.
#[derive(Debug)]
pub struct DescriptorSet {
    handle: vk::DescriptorSet,
    lease: PoolLease,
    set_index: u32,
    dynamic_offsets: usize,
    pending: PendingWrites,
}

impl DescriptorSet {
    /// `dynamic_offsets` is the layout's
    /// [`dynamic_offset_count`](DescriptorSetLayout::dynamic_offset_count).
    pub fn new(
        handle: vk::DescriptorSet,
        lease: PoolLease,
        set_index: u32,
        dynamic_offsets: usize,
    ) -> Self {
        Self {
            handle,
            lease,
            set_index,
            dynamic_offsets,
            pending: PendingWrites::default(),
        }
    }

    pub fn raw_descriptor_set(&self) -> vk::DescriptorSet {
        self.handle
    }

    pub fn lease(&self) -> &PoolLease {
        &self.lease
    }

    /// Index of this set within its pipeline layout.
    pub fn set_index(&self) -> u32 {
        self.set_index
    }

    pub fn dynamic_offset_count(&self) -> usize {
        self.dynamic_offsets
    }

    pub fn pending(&mut self) -> &mut PendingWrites {
        &mut self.pending
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Sends every pending write to the driver.
    ///
    /// # Safety
    /// Unless the written bindings are update-after-bind, the set must not
    /// be in use by pending GPU work. Every written buffer, view and
    /// sampler must stay alive while the set is bound.
    pub unsafe fn flush(&mut self, device: &Device) {
        let handle = self.handle;
        self.pending.flush(handle, |writes| {
            // SAFETY: forwarded to the caller.
            unsafe { device.update_raw_descriptor_sets(writes) }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn stages() -> vk::ShaderStageFlags {
        vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
    }

    #[test]
    fn update_after_bind_sets_pool_flag() {
        let plain = [DescriptorBindingDesc::new(0, vk::DescriptorType::UNIFORM_BUFFER, stages())];
        assert!(layout_create_flags(&plain).is_empty());

        let bindless = [
            plain[0],
            DescriptorBindingDesc::bindless_textures(1, 1024, vk::ShaderStageFlags::FRAGMENT),
        ];
        assert_eq!(
            layout_create_flags(&bindless),
            vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL
        );
    }

    #[test]
    fn variable_count_must_be_last() {
        let ok = [
            DescriptorBindingDesc::new(0, vk::DescriptorType::UNIFORM_BUFFER, stages()),
            DescriptorBindingDesc::bindless_textures(3, 64, stages()),
        ];
        assert_eq!(variable_count_binding(&ok).unwrap().map(|b| b.binding), Some(3));

        let bad = [
            DescriptorBindingDesc::bindless_textures(0, 64, stages()),
            DescriptorBindingDesc::new(1, vk::DescriptorType::UNIFORM_BUFFER, stages()),
        ];
        assert!(matches!(
            variable_count_binding(&bad),
            Err(CreateDescriptorSetLayoutError::VariableCountNotLast(0))
        ));
    }

    #[test]
    fn flush_emits_writes_in_order_and_clears() {
        let mut pending = PendingWrites::default();
        pending.buffer(
            0,
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            vk::Buffer::from_raw(7),
            0,
            256,
        );
        pending.image(
            2,
            5,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::ImageView::from_raw(9),
            vk::Sampler::from_raw(11),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        let set = vk::DescriptorSet::from_raw(3);

        let mut seen = Vec::new();
        pending.flush(set, |writes| {
            for w in writes {
                assert_eq!(w.dst_set, set);
                assert_eq!(w.descriptor_count, 1);
                seen.push((w.dst_binding, w.dst_array_element, w.descriptor_type));
            }
            // SAFETY: the infos live in `pending` for the duration of the
            // callback.
            let buffer = unsafe { &*writes[0].p_buffer_info };
            assert_eq!(buffer.buffer.as_raw(), 7);
            assert_eq!(buffer.range, 256);
            // SAFETY: as above.
            let image = unsafe { &*writes[1].p_image_info };
            assert_eq!(image.sampler.as_raw(), 11);
        });
        assert_eq!(
            seen,
            vec![
                (0, 0, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC),
                (2, 5, vk::DescriptorType::COMBINED_IMAGE_SAMPLER),
            ]
        );
        assert!(pending.is_empty());
    }

    #[test]
    fn empty_flush_skips_driver_call() {
        let mut pending = PendingWrites::default();
        let mut called = false;
        pending.flush(vk::DescriptorSet::null(), |_| called = true);
        assert!(!called);
    }

    #[test]
    fn dynamic_bindings_are_detected() {
        let b = DescriptorBindingDesc::new(0, vk::DescriptorType::STORAGE_BUFFER_DYNAMIC, stages());
        assert!(b.is_dynamic());
        let b = DescriptorBindingDesc::new(0, vk::DescriptorType::STORAGE_BUFFER, stages());
        assert!(!b.is_dynamic());
    }
}
