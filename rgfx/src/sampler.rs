//! Sampler wrapper ([`Sampler`]).

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;

#[derive(Debug, Error)]
pub enum CreateSamplerError {
    #[error("Vulkan error creating sampler: {0}")]
    Vulkan(vk::Result),
}

/// Filtering and addressing state. `address_mode` applies to U, V and W.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerDesc {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
        }
    }
}

impl SamplerDesc {
    pub fn nearest_clamped() -> Self {
        Self {
            mag_filter: vk::Filter::NEAREST,
            min_filter: vk::Filter::NEAREST,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
        }
    }
}

/// An owned `VkSampler`.
pub struct Sampler {
    parent: Arc<Device>,
    handle: vk::Sampler,
    desc: SamplerDesc,
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler")
            .field("handle", &self.handle)
            .field("desc", &self.desc)
            .finish_non_exhaustive()
    }
}

impl Sampler {
    /// Anisotropy is off and the LOD range covers a single mip level.
    pub fn new(
        device: &Arc<Device>,
        desc: &SamplerDesc,
        name: Option<&str>,
    ) -> Result<Self, CreateSamplerError> {
        let create_info = vk::SamplerCreateInfo::default()
            .mag_filter(desc.mag_filter)
            .min_filter(desc.min_filter)
            .mipmap_mode(desc.mipmap_mode)
            .address_mode_u(desc.address_mode)
            .address_mode_v(desc.address_mode)
            .address_mode_w(desc.address_mode)
            .anisotropy_enable(false)
            .compare_enable(false)
            .unnormalized_coordinates(false)
            .min_lod(0.0)
            .max_lod(0.0);

        // SAFETY: create_info has no borrowed data.
        let handle = unsafe { device.create_raw_sampler(&create_info) }
            .map_err(CreateSamplerError::Vulkan)?;
        // SAFETY: handle was just created from device.
        unsafe { device.name_or_warn(handle, name) };

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            desc: *desc,
        })
    }

    pub fn desc(&self) -> &SamplerDesc {
        &self.desc
    }

    pub fn raw_sampler(&self) -> vk::Sampler {
        self.handle
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        tracing::debug!("Dropping sampler {:?}", self.handle);
        // SAFETY: owners idle the device before dropping samplers.
        unsafe { self.parent.destroy_raw_sampler(self.handle) };
    }
}
