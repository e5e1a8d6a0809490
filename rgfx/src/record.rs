//! Command recording for one frame.
//!
//! A [`RecordContext`] is handed to the application's [`FrameRecorder`]
//! between acquire and present. It resolves handles through the
//! [`ResourceRegistry`] and tracks enough state (bound pipeline, open
//! rendering scope, texture layouts) to reject misuse before it reaches
//! the driver.

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::buffer::{MappedBufferKind, RawBuffer, transfer_to_host_barrier};
use crate::command::ResettableCommandBuffer;
use crate::frame::FrameInfo;
use crate::image::{TextureKind, transition_barrier};
use crate::registry::{
    BufferHandle, DescriptorSetHandle, PipelineHandle, RegistryError, ResourceRegistry,
    TextureHandle,
};
use crate::swapchain::{DepthAttachments, Swapchain};

#[derive(Debug, Error)]
pub enum RecordError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("No pipeline is bound")]
    NoPipelineBound,
    #[error("Descriptor set needs {expected} dynamic offsets, got {got}")]
    DynamicOffsetCount { expected: usize, got: usize },
    #[error("Push constant range of {size} bytes at {offset} is not declared for {stages:?}")]
    PushConstantRange {
        stages: vk::ShaderStageFlags,
        offset: u32,
        size: u32,
    },
    #[error("Command is not allowed inside a rendering scope")]
    InsideRendering,
    #[error("Command needs an open rendering scope")]
    NotRendering,
    #[error("The swapchain has no depth attachments")]
    NoDepthAttachments,
    #[error("Only 2D textures can be rendered to, got {0:?}")]
    UnsupportedTarget(TextureKind),
    #[error("Buffer holds {buffer_bytes} bytes but the copy needs {needed}")]
    BufferTooSmall {
        needed: vk::DeviceSize,
        buffer_bytes: vk::DeviceSize,
    },
    #[error("Buffer is a {actual:?} buffer, expected {expected:?}")]
    WrongBufferKind {
        expected: MappedBufferKind,
        actual: MappedBufferKind,
    },
}

/// Application code that records one frame.
pub trait FrameRecorder {
    fn record(&mut self, ctx: &mut RecordContext<'_>) -> Result<(), RecordError>;
}

impl<F> FrameRecorder for F
where
    F: FnMut(&mut RecordContext<'_>) -> Result<(), RecordError>,
{
    fn record(&mut self, ctx: &mut RecordContext<'_>) -> Result<(), RecordError> {
        self(ctx)
    }
}

// ---------------------------------------------------------------------------
// Rendering descriptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachmentLoad {
    Load,
    #[default]
    Clear,
    DontCare,
}

impl AttachmentLoad {
    pub fn load_op(self) -> vk::AttachmentLoadOp {
        match self {
            Self::Load => vk::AttachmentLoadOp::LOAD,
            Self::Clear => vk::AttachmentLoadOp::CLEAR,
            Self::DontCare => vk::AttachmentLoadOp::DONT_CARE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorTarget {
    /// The image acquired for this frame.
    Swapchain,
    /// A 2D texture created with `COLOR_ATTACHMENT` usage.
    Texture(TextureHandle),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorAttachment {
    pub target: ColorTarget,
    pub load: AttachmentLoad,
    pub clear: [f32; 4],
}

impl ColorAttachment {
    pub fn swapchain_cleared(clear: [f32; 4]) -> Self {
        Self {
            target: ColorTarget::Swapchain,
            load: AttachmentLoad::Clear,
            clear,
        }
    }

    pub fn texture_cleared(texture: TextureHandle, clear: [f32; 4]) -> Self {
        Self {
            target: ColorTarget::Texture(texture),
            load: AttachmentLoad::Clear,
            clear,
        }
    }
}

/// Which swapchain companion image a pass tests against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthTarget {
    Depth,
    Stencil,
    DepthStencil,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthAttachment {
    pub target: DepthTarget,
    pub load: AttachmentLoad,
    pub clear_depth: f32,
    pub clear_stencil: u32,
}

impl Default for DepthAttachment {
    fn default() -> Self {
        Self {
            target: DepthTarget::Depth,
            load: AttachmentLoad::Clear,
            clear_depth: 1.0,
            clear_stencil: 0,
        }
    }
}

/// One dynamic-rendering pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderingDesc {
    pub color: Vec<ColorAttachment>,
    pub depth: Option<DepthAttachment>,
    /// Defaults to the whole of the first color target, or the frame
    /// extent for depth-only passes.
    pub render_area: Option<vk::Rect2D>,
}

/// A viewport covering `extent` with the standard 0..1 depth range.
pub fn full_viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

pub fn full_scissor(extent: vk::Extent2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    }
}

fn check_dynamic_offsets(expected: usize, got: usize) -> Result<(), RecordError> {
    if expected == got {
        Ok(())
    } else {
        Err(RecordError::DynamicOffsetCount { expected, got })
    }
}

/// Attachments a frame renders to by default.
#[derive(Debug, Clone, Copy)]
pub struct FrameTargets<'a> {
    pub color_view: vk::ImageView,
    pub extent: vk::Extent2D,
    pub depth: Option<&'a DepthAttachments>,
}

impl<'a> FrameTargets<'a> {
    pub fn from_swapchain<T: HasDisplayHandle + HasWindowHandle>(
        swapchain: &'a Swapchain<T>,
        image_index: u32,
    ) -> Self {
        Self {
            color_view: swapchain
                .raw_image_view(image_index)
                .unwrap_or_else(vk::ImageView::null),
            extent: swapchain.extent(),
            depth: swapchain.depth_attachments(),
        }
    }
}

// ---------------------------------------------------------------------------
// RecordContext
// ---------------------------------------------------------------------------

pub struct RecordContext<'a> {
    cmd: &'a mut ResettableCommandBuffer,
    registry: &'a mut ResourceRegistry,
    targets: FrameTargets<'a>,
    info: FrameInfo,
    bound_pipeline: Option<PipelineHandle>,
    rendering: bool,
}

impl std::fmt::Debug for RecordContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordContext")
            .field("info", &self.info)
            .field("bound_pipeline", &self.bound_pipeline)
            .field("rendering", &self.rendering)
            .finish_non_exhaustive()
    }
}

impl<'a> RecordContext<'a> {
    /// `cmd` must be recording for the frame described by `info`, with the
    /// swapchain image in `COLOR_ATTACHMENT_OPTIMAL`.
    pub fn new(
        cmd: &'a mut ResettableCommandBuffer,
        registry: &'a mut ResourceRegistry,
        targets: FrameTargets<'a>,
        info: FrameInfo,
    ) -> Self {
        Self {
            cmd,
            registry,
            targets,
            info,
            bound_pipeline: None,
            rendering: false,
        }
    }

    pub fn info(&self) -> &FrameInfo {
        &self.info
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.targets.extent
    }

    pub fn registry(&mut self) -> &mut ResourceRegistry {
        self.registry
    }

    fn ensure_outside_rendering(&self) -> Result<(), RecordError> {
        if self.rendering {
            Err(RecordError::InsideRendering)
        } else {
            Ok(())
        }
    }

    fn ensure_rendering(&self) -> Result<(), RecordError> {
        if self.rendering {
            Ok(())
        } else {
            Err(RecordError::NotRendering)
        }
    }

    fn bound_layout(&self) -> Result<&crate::pipeline::PipelineLayout, RecordError> {
        let handle = self.bound_pipeline.ok_or(RecordError::NoPipelineBound)?;
        Ok(self.registry.pipeline(handle)?.layout())
    }

    // -- dynamic state -------------------------------------------------------

    pub fn set_viewport(&mut self, viewport: vk::Viewport) {
        // SAFETY: every pipeline built by this crate declares dynamic
        // viewport state.
        unsafe { self.cmd.set_viewport(viewport) };
    }

    pub fn set_scissor(&mut self, scissor: vk::Rect2D) {
        // SAFETY: every pipeline built by this crate declares dynamic
        // scissor state.
        unsafe { self.cmd.set_scissor(scissor) };
    }

    /// Viewport and scissor covering the whole frame.
    pub fn set_full_viewport(&mut self) {
        let extent = self.targets.extent;
        self.set_viewport(full_viewport(extent));
        self.set_scissor(full_scissor(extent));
    }

    // -- rendering scopes ----------------------------------------------------

    /// Opens a dynamic-rendering pass. Texture targets are moved to
    /// `COLOR_ATTACHMENT_OPTIMAL` first and stay there afterwards.
    pub fn begin_rendering(&mut self, desc: &RenderingDesc) -> Result<(), RecordError> {
        self.ensure_outside_rendering()?;

        let mut barriers = Vec::new();
        let mut colors = Vec::with_capacity(desc.color.len());
        let mut first_extent = None;
        for attachment in &desc.color {
            let (view, extent) = match attachment.target {
                ColorTarget::Swapchain => (self.targets.color_view, self.targets.extent),
                ColorTarget::Texture(handle) => {
                    let entry = self.registry.texture_mut(handle)?;
                    let image = entry.texture.image();
                    if image.kind() != TextureKind::Tex2D {
                        return Err(RecordError::UnsupportedTarget(image.kind()));
                    }
                    if entry.layout != vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL {
                        barriers.push(transition_barrier(
                            image.raw_image(),
                            image.subresource_range(),
                            entry.layout,
                            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                        ));
                    }
                    let extent = vk::Extent2D {
                        width: image.extent().width,
                        height: image.extent().height,
                    };
                    let view = entry.texture.raw_image_view();
                    entry.layout = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;
                    (view, extent)
                }
            };
            first_extent.get_or_insert(extent);
            colors.push(
                vk::RenderingAttachmentInfo::default()
                    .image_view(view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(attachment.load.load_op())
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(vk::ClearValue {
                        color: vk::ClearColorValue {
                            float32: attachment.clear,
                        },
                    }),
            );
        }

        let (depth_view, stencil_view) = match desc.depth {
            None => (None, None),
            Some(depth) => {
                let attachments = self.targets.depth.ok_or(RecordError::NoDepthAttachments)?;
                match depth.target {
                    DepthTarget::Depth => (Some(attachments.depth.raw_image_view()), None),
                    DepthTarget::Stencil => (None, Some(attachments.stencil.raw_image_view())),
                    DepthTarget::DepthStencil => {
                        let view = attachments.depth_stencil.raw_image_view();
                        (Some(view), Some(view))
                    }
                }
            }
        };
        let depth_info = |view: vk::ImageView| {
            let depth = desc.depth.unwrap_or_default();
            vk::RenderingAttachmentInfo::default()
                .image_view(view)
                .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .load_op(depth.load.load_op())
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: depth.clear_depth,
                        stencil: depth.clear_stencil,
                    },
                })
        };
        let depth_attachment = depth_view.map(depth_info);
        let stencil_attachment = stencil_view.map(depth_info);

        let render_area = desc
            .render_area
            .unwrap_or_else(|| full_scissor(first_extent.unwrap_or(self.targets.extent)));
        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(&colors);
        if let Some(depth) = depth_attachment.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth);
        }
        if let Some(stencil) = stencil_attachment.as_ref() {
            rendering_info = rendering_info.stencil_attachment(stencil);
        }

        // SAFETY: texture targets were transitioned by the barriers above;
        // the swapchain image and depth attachments were transitioned when
        // the frame began.
        unsafe {
            if !barriers.is_empty() {
                let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
                self.cmd.pipeline_barrier2(&dependency);
            }
            self.cmd.begin_rendering(&rendering_info);
        }
        self.rendering = true;
        Ok(())
    }

    pub fn end_rendering(&mut self) -> Result<(), RecordError> {
        self.ensure_rendering()?;
        // SAFETY: a scope opened by begin_rendering is open.
        unsafe { self.cmd.end_rendering() };
        self.rendering = false;
        Ok(())
    }

    // -- binding -------------------------------------------------------------

    pub fn bind_pipeline(&mut self, pipeline: PipelineHandle) -> Result<(), RecordError> {
        let raw = self.registry.pipeline(pipeline)?.raw_pipeline();
        // SAFETY: the pipeline comes from this registry's device.
        unsafe { self.cmd.bind_graphics_pipeline(raw) };
        self.bound_pipeline = Some(pipeline);
        Ok(())
    }

    /// Binds `set` at the index it was allocated for, against the layout
    /// of the bound pipeline.
    pub fn bind_descriptor_set(
        &mut self,
        set: DescriptorSetHandle,
        dynamic_offsets: &[u32],
    ) -> Result<(), RecordError> {
        let layout = self.bound_layout()?.raw_pipeline_layout();
        let entry = self.registry.descriptor_set(set)?;
        debug_assert!(
            self.registry.is_descriptor_set_live(&entry.set),
            "binding a descriptor set whose pool was cleared"
        );
        debug_assert!(
            !entry.set.has_pending_writes(),
            "binding a descriptor set with unflushed writes"
        );
        check_dynamic_offsets(entry.set.dynamic_offset_count(), dynamic_offsets.len())?;
        let (raw, index) = (entry.set.raw_descriptor_set(), entry.set.set_index());
        // SAFETY: the set was allocated from a layout of a registry
        // pipeline and the offset count matches its dynamic bindings.
        unsafe {
            self.cmd
                .bind_descriptor_sets(layout, index, &[raw], dynamic_offsets)
        };
        Ok(())
    }

    pub fn push_constants(
        &mut self,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) -> Result<(), RecordError> {
        let size = data.len() as u32;
        let layout = self.bound_layout()?;
        if !layout.covers_push_constants(stages, offset, size) {
            return Err(RecordError::PushConstantRange {
                stages,
                offset,
                size,
            });
        }
        let raw = layout.raw_pipeline_layout();
        // SAFETY: the range was checked against the layout.
        unsafe { self.cmd.push_constants(raw, stages, offset, data) };
        Ok(())
    }

    pub fn bind_vertex_buffer(
        &mut self,
        binding: u32,
        buffer: BufferHandle,
        offset: vk::DeviceSize,
    ) -> Result<(), RecordError> {
        let buffer = self.registry.buffer(buffer)?;
        // SAFETY: the buffer is owned by the registry, which outlives the
        // frame.
        unsafe { self.cmd.bind_vertex_buffer(binding, buffer, offset) };
        Ok(())
    }

    pub fn bind_index_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) -> Result<(), RecordError> {
        let buffer = self.registry.buffer(buffer)?;
        // SAFETY: as for vertex buffers.
        unsafe { self.cmd.bind_index_buffer(buffer, offset, index_type) };
        Ok(())
    }

    // -- drawing -------------------------------------------------------------

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<(), RecordError> {
        self.ensure_rendering()?;
        self.bound_pipeline.ok_or(RecordError::NoPipelineBound)?;
        // SAFETY: a rendering scope is open and a pipeline is bound.
        unsafe {
            self.cmd
                .draw(vertex_count, instance_count, first_vertex, first_instance)
        };
        Ok(())
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<(), RecordError> {
        self.ensure_rendering()?;
        self.bound_pipeline.ok_or(RecordError::NoPipelineBound)?;
        // SAFETY: a rendering scope is open and a pipeline is bound. The
        // caller bound an index buffer.
        unsafe {
            self.cmd.draw_indexed(
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        };
        Ok(())
    }

    // -- transfers and barriers ----------------------------------------------

    /// Moves a texture to `layout`, for example back to
    /// `SHADER_READ_ONLY_OPTIMAL` after rendering into it.
    pub fn transition_texture(
        &mut self,
        texture: TextureHandle,
        layout: vk::ImageLayout,
    ) -> Result<(), RecordError> {
        self.ensure_outside_rendering()?;
        let entry = self.registry.texture_mut(texture)?;
        if entry.layout == layout {
            return Ok(());
        }
        let image = entry.texture.image();
        let barrier = transition_barrier(
            image.raw_image(),
            image.subresource_range(),
            entry.layout,
            layout,
        );
        entry.layout = layout;
        // SAFETY: the tracked layout is the one the texture is in at this
        // point of the frame's command stream.
        unsafe { self.cmd.image_barrier(barrier) };
        Ok(())
    }

    /// Copies every layer of `texture` into the start of `buffer`, tightly
    /// packed. Read the result with
    /// [`Renderer::read_buffer`](crate::Renderer::read_buffer) once the
    /// frame has been submitted.
    pub fn copy_texture_to_buffer(
        &mut self,
        texture: TextureHandle,
        buffer: BufferHandle,
    ) -> Result<(), RecordError> {
        self.ensure_outside_rendering()?;
        self.transition_texture(texture, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)?;

        let image = self.registry.texture(texture)?.texture.image();
        let needed = image
            .kind()
            .upload_size(image.extent(), image.format())
            .unwrap_or(vk::DeviceSize::MAX);
        let dst = self.registry.buffer(buffer)?;
        if dst.size() < needed {
            return Err(RecordError::BufferTooSmall {
                needed,
                buffer_bytes: dst.size(),
            });
        }
        let range = image.subresource_range();
        let region = vk::BufferImageCopy::default()
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(range.aspect_mask)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(range.layer_count),
            )
            .image_extent(image.extent());
        let copied = transfer_to_host_barrier();

        // SAFETY: the texture is in TRANSFER_SRC_OPTIMAL and the buffer was
        // checked to hold every texel.
        unsafe {
            self.cmd.copy_image_to_buffer(
                image.raw_image(),
                dst.raw_buffer(),
                std::slice::from_ref(&region),
            );
            self.cmd.pipeline_barrier2(
                &vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&copied)),
            );
        }
        Ok(())
    }

    fn update_mapped(
        &mut self,
        expected: MappedBufferKind,
        buffer: BufferHandle,
        index: u32,
        bytes: &[u8],
    ) -> Result<(), RecordError> {
        self.ensure_outside_rendering()?;
        let mapped = self
            .registry
            .buffer(buffer)?
            .as_mapped()
            .ok_or(RegistryError::NotMapped)?;
        if mapped.kind() != expected {
            return Err(RecordError::WrongBufferKind {
                expected,
                actual: mapped.kind(),
            });
        }
        self.registry.write_record(buffer, index, bytes)?;
        let barrier = self
            .registry
            .buffer(buffer)?
            .as_mapped()
            .ok_or(RegistryError::NotMapped)?
            .host_write_barrier(Some(index));
        // SAFETY: the barrier covers a range of a live registry buffer.
        unsafe {
            self.cmd.pipeline_barrier2(
                &vk::DependencyInfo::default()
                    .buffer_memory_barriers(std::slice::from_ref(&barrier)),
            )
        };
        Ok(())
    }

    /// Writes record `index` of a mapped uniform buffer and makes it
    /// visible to shaders. Must be called outside a rendering scope.
    ///
    /// Frames in flight may still read older records, so pick `index` per
    /// frame slot, e.g. `slot * per_frame + object`.
    pub fn update_uniform(
        &mut self,
        buffer: BufferHandle,
        index: u32,
        bytes: &[u8],
    ) -> Result<(), RecordError> {
        self.update_mapped(MappedBufferKind::Uniform, buffer, index, bytes)
    }

    pub fn update_uniform_pod<T: bytemuck::Pod>(
        &mut self,
        buffer: BufferHandle,
        index: u32,
        value: &T,
    ) -> Result<(), RecordError> {
        self.update_uniform(buffer, index, bytemuck::bytes_of(value))
    }

    /// Storage-buffer counterpart of [`update_uniform`](Self::update_uniform).
    pub fn update_storage(
        &mut self,
        buffer: BufferHandle,
        index: u32,
        bytes: &[u8],
    ) -> Result<(), RecordError> {
        self.update_mapped(MappedBufferKind::Storage, buffer, index, bytes)
    }

    /// Dynamic offset selecting record `index` of a mapped buffer.
    pub fn dynamic_offset(&self, buffer: BufferHandle, index: u32) -> Result<u32, RecordError> {
        let mapped = self
            .registry
            .buffer(buffer)?
            .as_mapped()
            .ok_or(RegistryError::NotMapped)?;
        Ok(mapped.dynamic_offset(index))
    }

    /// Closes a rendering scope the recorder left open.
    pub fn finish(mut self) {
        if self.rendering {
            tracing::warn!("Recorder left a rendering scope open; closing it");
            // SAFETY: a scope opened by begin_rendering is open.
            unsafe { self.cmd.end_rendering() };
            self.rendering = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_ops_map_one_to_one() {
        assert_eq!(AttachmentLoad::Load.load_op(), vk::AttachmentLoadOp::LOAD);
        assert_eq!(AttachmentLoad::Clear.load_op(), vk::AttachmentLoadOp::CLEAR);
        assert_eq!(
            AttachmentLoad::DontCare.load_op(),
            vk::AttachmentLoadOp::DONT_CARE
        );
        assert_eq!(AttachmentLoad::default(), AttachmentLoad::Clear);
    }

    #[test]
    fn full_viewport_tracks_extent() {
        let extent = vk::Extent2D {
            width: 1024,
            height: 768,
        };
        let viewport = full_viewport(extent);
        assert_eq!((viewport.width, viewport.height), (1024.0, 768.0));
        assert_eq!((viewport.min_depth, viewport.max_depth), (0.0, 1.0));

        let scissor = full_scissor(extent);
        assert_eq!(scissor.extent, extent);
        assert_eq!(scissor.offset, vk::Offset2D { x: 0, y: 0 });
    }

    #[test]
    fn dynamic_offset_count_must_match() {
        assert!(check_dynamic_offsets(2, 2).is_ok());
        assert!(matches!(
            check_dynamic_offsets(1, 0),
            Err(RecordError::DynamicOffsetCount {
                expected: 1,
                got: 0
            })
        ));
    }

    #[test]
    fn default_depth_attachment_clears_to_far_plane() {
        let depth = DepthAttachment::default();
        assert_eq!(depth.target, DepthTarget::Depth);
        assert_eq!(depth.clear_depth, 1.0);
        assert_eq!(depth.load, AttachmentLoad::Clear);
    }

    #[test]
    fn closures_are_recorders() {
        fn assert_recorder<R: FrameRecorder>(_: &R) {}
        let recorder = |ctx: &mut RecordContext<'_>| -> Result<(), RecordError> {
            ctx.set_full_viewport();
            Ok(())
        };
        assert_recorder(&recorder);
    }
}
