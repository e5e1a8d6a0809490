use ash::vk;

use crate::descriptor_allocator::PoolCapacity;
use crate::device_select::DeviceRequirements;
use crate::instance::VulkanLogLevel;

pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 3;

/// Everything [`Renderer::init`](crate::Renderer::init) needs besides the
/// window.
#[derive(Debug, Clone)]
pub struct RendererConfig {
    pub app_name: String,
    /// Initial framebuffer size in pixels.
    pub extent: vk::Extent2D,
    pub frames_in_flight: usize,
    /// `None` skips the validation layer entirely.
    pub validation: Option<VulkanLogLevel>,
    pub device: DeviceRequirements,
    pub descriptor_pool: PoolCapacity,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("rgfx"),
            extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            validation: None,
            device: DeviceRequirements::default(),
            descriptor_pool: PoolCapacity::default(),
        }
    }
}

impl RendererConfig {
    pub fn with_extent(mut self, width: u32, height: u32) -> Self {
        self.extent = vk::Extent2D { width, height };
        self
    }

    pub fn with_validation(mut self, level: VulkanLogLevel) -> Self {
        self.validation = Some(level);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_select::QueueMode;

    #[test]
    fn defaults_pace_three_frames() {
        let config = RendererConfig::default();
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.validation, None);
        assert!(config.device.discrete_only);
        assert_eq!(config.device.queue_mode, QueueMode::Auto);
        assert_eq!(config.descriptor_pool, PoolCapacity::default());
    }

    #[test]
    fn builders_override_fields() {
        let config = RendererConfig::default()
            .with_extent(1024, 768)
            .with_validation(VulkanLogLevel::Warning);
        assert_eq!(
            config.extent,
            vk::Extent2D {
                width: 1024,
                height: 768
            }
        );
        assert_eq!(config.validation, Some(VulkanLogLevel::Warning));
    }
}
