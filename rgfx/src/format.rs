//! Depth and stencil format detection.

use ash::vk;
use thiserror::Error;

const DEPTH_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::X8_D24_UNORM_PACK32,
    vk::Format::D16_UNORM,
];

// Some vendors expose no stencil-only format, so the combined formats
// follow S8_UINT.
const STENCIL_CANDIDATES: [vk::Format; 4] = [
    vk::Format::S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D16_UNORM_S8_UINT,
];

const DEPTH_STENCIL_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D16_UNORM_S8_UINT,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DetectDepthFormatError {
    #[error("No depth-only attachment format is supported")]
    NoDepthFormat,
    #[error("No stencil attachment format is supported")]
    NoStencilFormat,
    #[error("No combined depth-stencil attachment format is supported")]
    NoDepthStencilFormat,
}

/// The three attachment formats the swapchain's companion images use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthFormats {
    pub depth: vk::Format,
    pub stencil: vk::Format,
    pub depth_stencil: vk::Format,
}

impl DepthFormats {
    /// Walks each candidate list in order and keeps the first format whose
    /// optimal tiling supports depth-stencil attachments. `probe` returns
    /// the device's properties for a format.
    pub fn detect(
        mut probe: impl FnMut(vk::Format) -> vk::FormatProperties,
    ) -> Result<Self, DetectDepthFormatError> {
        let mut first_supported = |candidates: &[vk::Format]| {
            candidates.iter().copied().find(|&format| {
                probe(format).optimal_tiling_features.contains(
                    vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
                )
            })
        };

        let depth = first_supported(&DEPTH_CANDIDATES)
            .ok_or(DetectDepthFormatError::NoDepthFormat)?;
        let stencil = first_supported(&STENCIL_CANDIDATES)
            .ok_or(DetectDepthFormatError::NoStencilFormat)?;
        let depth_stencil = first_supported(&DEPTH_STENCIL_CANDIDATES)
            .ok_or(DetectDepthFormatError::NoDepthStencilFormat)?;

        Ok(Self {
            depth,
            stencil,
            depth_stencil,
        })
    }
}

pub fn has_depth(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D32_SFLOAT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

pub fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Every aspect present in `format`. Barriers and views on combined
/// formats must name both depth and stencil.
pub fn aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    let mut mask = vk::ImageAspectFlags::empty();
    if has_depth(format) {
        mask |= vk::ImageAspectFlags::DEPTH;
    }
    if has_stencil(format) {
        mask |= vk::ImageAspectFlags::STENCIL;
    }
    if mask.is_empty() {
        vk::ImageAspectFlags::COLOR
    } else {
        mask
    }
}

/// Size of one texel for the uncompressed formats textures are uploaded
/// in. `None` for anything else.
pub fn texel_size(format: vk::Format) -> Option<u32> {
    use vk::Format as F;
    let size = match format {
        F::R8_UNORM | F::R8_SRGB | F::R8_UINT | F::S8_UINT => 1,
        F::R8G8_UNORM | F::R16_SFLOAT | F::R16_UNORM | F::D16_UNORM => 2,
        F::R8G8B8A8_UNORM
        | F::R8G8B8A8_SRGB
        | F::B8G8R8A8_UNORM
        | F::B8G8R8A8_SRGB
        | F::R16G16_SFLOAT
        | F::R32_SFLOAT
        | F::R32_UINT
        | F::A2B10G10R10_UNORM_PACK32
        | F::B10G11R11_UFLOAT_PACK32 => 4,
        F::R16G16B16A16_SFLOAT | F::R32G32_SFLOAT => 8,
        F::R32G32B32A32_SFLOAT => 16,
        _ => return None,
    };
    Some(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supporting(
        supported: &'static [vk::Format],
    ) -> impl FnMut(vk::Format) -> vk::FormatProperties {
        move |format| {
            let features = if supported.contains(&format) {
                vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
            } else {
                vk::FormatFeatureFlags::empty()
            };
            vk::FormatProperties {
                optimal_tiling_features: features,
                ..Default::default()
            }
        }
    }

    #[test]
    fn detection_prefers_candidate_order() {
        let formats = DepthFormats::detect(supporting(&[
            vk::Format::D16_UNORM,
            vk::Format::D32_SFLOAT,
            vk::Format::S8_UINT,
            vk::Format::D24_UNORM_S8_UINT,
            vk::Format::D32_SFLOAT_S8_UINT,
        ]))
        .unwrap();
        assert_eq!(formats.depth, vk::Format::D32_SFLOAT);
        assert_eq!(formats.stencil, vk::Format::S8_UINT);
        assert_eq!(formats.depth_stencil, vk::Format::D32_SFLOAT_S8_UINT);
    }

    #[test]
    fn stencil_falls_back_to_combined_format() {
        let formats = DepthFormats::detect(supporting(&[
            vk::Format::D32_SFLOAT,
            vk::Format::D32_SFLOAT_S8_UINT,
        ]))
        .unwrap();
        assert_eq!(formats.stencil, vk::Format::D32_SFLOAT_S8_UINT);
    }

    #[test]
    fn missing_category_is_fatal() {
        assert_eq!(
            DepthFormats::detect(supporting(&[vk::Format::D32_SFLOAT])),
            Err(DetectDepthFormatError::NoStencilFormat)
        );
        assert_eq!(
            DepthFormats::detect(supporting(&[])),
            Err(DetectDepthFormatError::NoDepthFormat)
        );
    }

    #[test]
    fn aspects_match_components() {
        assert_eq!(
            aspect_mask(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            aspect_mask(vk::Format::S8_UINT),
            vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            aspect_mask(vk::Format::B8G8R8A8_SRGB),
            vk::ImageAspectFlags::COLOR
        );
    }
}
