//! A Vulkan rendering backend built on [`ash`].
//!
//! `rgfx` picks a physical device, keeps a presentable swapchain alive
//! across resizes, paces CPU recording against GPU execution over a fixed
//! number of frames in flight, and owns every pipeline, buffer, texture
//! and descriptor set behind generation-checked handles.
//!
//! > **Personal project.** This crate is not intended for general use
//! > and makes no API stability guarantees.
//!
//! # Object hierarchy
//!
//! ```text
//! Renderer<T>
//! ├── Instance
//! │   └── Surface<T>
//! ├── Device (queues: graphics / compute / transfer / present)
//! ├── PresentTarget<T>
//! │   ├── Swapchain<T> ── DepthAttachments
//! │   └── FrameSlot × N (command buffer, 2 semaphores, fence)
//! ├── FramePacer
//! └── ResourceRegistry
//!     ├── Pipeline (DescriptorSetLayout × sets, PipelineLayout)
//!     ├── BufferResource (DeviceLocalBuffer / MappedBuffer)
//!     ├── Texture (DeviceLocalImage, ImageView, Sampler)
//!     ├── DescriptorSet
//!     └── GrowableDescriptorAllocator ── DescriptorPool × k
//! ```
//!
//! Each low-level wrapper holds its parent via `Arc` so parents cannot be
//! destroyed while children are alive. Resources handed to callers are
//! identified by `slotmap` keys; a destroyed resource's key never resolves
//! again.
//!
//! # Naming conventions
//!
//! | prefix  | meaning                                   |
//! |---------|-------------------------------------------|
//! | `raw_*` | accepts or returns a raw `ash::vk` handle |
//! | `ash_*` | returns the `ash` wrapper object          |

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

pub mod buffer;
pub mod command;
pub mod config;
pub mod descriptor;
pub mod descriptor_allocator;
pub mod device;
pub mod device_select;
pub mod format;
pub mod frame;
pub mod image;
pub mod instance;
pub mod pipeline;
pub mod present;
pub mod record;
pub mod registry;
pub mod renderer;
pub mod sampler;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod upload;

pub use ash;
pub use raw_window_handle::HandleError as RwhHandleError;

pub use config::RendererConfig;
pub use frame::{FrameInfo, FrameOutcome};
pub use record::{FrameRecorder, RecordContext, RecordError};
pub use registry::{
    BufferHandle, DescriptorSetHandle, PipelineHandle, TextureHandle,
};
pub use renderer::Renderer;
