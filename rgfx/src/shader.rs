//! SPIR-V loading and shader modules.
//!
//! Modules are transient: a pipeline builds them from bytes, links, and
//! drops them straight away.

use std::borrow::Cow;
use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;

const SPIRV_MAGIC: u32 = 0x0723_0203;

#[derive(Debug, Error)]
pub enum CreateShaderModuleError {
    #[error("SPIR-V byte slice length ({0}) is not a non-zero multiple of 4")]
    InvalidLength(usize),

    #[error("SPIR-V magic number mismatch (found {0:#010x})")]
    BadMagic(u32),

    #[error("Entry point name contains a NUL byte")]
    InvalidEntryPoint(#[from] std::ffi::NulError),

    #[error("Vulkan error creating shader module: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
#[error("Failed to read SPIR-V from {path}: {source}")]
pub struct LoadSpirvError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Reads a compiled SPIR-V file.
pub fn load_spirv(path: impl AsRef<Path>) -> Result<Vec<u8>, LoadSpirvError> {
    let path = path.as_ref();
    std::fs::read(path).map_err(|source| LoadSpirvError {
        path: path.to_owned(),
        source,
    })
}

/// Interprets `bytes` as little-endian SPIR-V words, borrowing when the
/// slice is already `u32`-aligned on a little-endian target.
pub fn spirv_words(bytes: &[u8]) -> Result<Cow<'_, [u32]>, CreateShaderModuleError> {
    if bytes.is_empty() || !bytes.len().is_multiple_of(4) {
        return Err(CreateShaderModuleError::InvalidLength(bytes.len()));
    }

    let words = if cfg!(target_endian = "little")
        && let Ok(words) = bytemuck::try_cast_slice::<u8, u32>(bytes)
    {
        Cow::Borrowed(words)
    } else {
        Cow::Owned(
            bytes
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    };

    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        Some(&other) => Err(CreateShaderModuleError::BadMagic(other)),
        None => Err(CreateShaderModuleError::InvalidLength(bytes.len())),
    }
}

/// The stage a single entry point runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
    Geometry,
    TessellationControl,
    TessellationEvaluation,
}

impl From<ShaderStage> for vk::ShaderStageFlags {
    fn from(stage: ShaderStage) -> Self {
        match stage {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
            ShaderStage::Geometry => vk::ShaderStageFlags::GEOMETRY,
            ShaderStage::TessellationControl => vk::ShaderStageFlags::TESSELLATION_CONTROL,
            ShaderStage::TessellationEvaluation => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
        }
    }
}

/// SPIR-V for one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSource {
    pub stage: ShaderStage,
    pub spirv: Vec<u8>,
    pub entry_point: String,
}

impl ShaderSource {
    pub fn new(stage: ShaderStage, spirv: Vec<u8>) -> Self {
        Self {
            stage,
            spirv,
            entry_point: "main".to_owned(),
        }
    }

    pub fn from_file(stage: ShaderStage, path: impl AsRef<Path>) -> Result<Self, LoadSpirvError> {
        Ok(Self::new(stage, load_spirv(path)?))
    }
}

pub struct ShaderModule {
    parent: Arc<Device>,
    handle: vk::ShaderModule,
    stage: ShaderStage,
    entry_point: CString,
}

impl std::fmt::Debug for ShaderModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderModule")
            .field("handle", &self.handle)
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}

impl ShaderModule {
    pub fn new(
        device: &Arc<Device>,
        source: &ShaderSource,
        name: Option<&str>,
    ) -> Result<Self, CreateShaderModuleError> {
        let words = spirv_words(&source.spirv)?;
        let entry_point = CString::new(source.entry_point.as_str())?;
        let create_info = vk::ShaderModuleCreateInfo::default().code(&words);

        // SAFETY: the code is length-checked SPIR-V with a valid header.
        let handle = unsafe { device.create_raw_shader_module(&create_info) }
            .map_err(CreateShaderModuleError::Vulkan)?;
        // SAFETY: handle was just created from device.
        unsafe { device.name_or_warn(handle, name) };

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            stage: source.stage,
            entry_point,
        })
    }

    /// Stage info borrowing this module's entry point name.
    pub fn stage_create_info(&self) -> vk::PipelineShaderStageCreateInfo<'_> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(self.stage.into())
            .module(self.handle)
            .name(&self.entry_point)
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        tracing::debug!("Dropping shader module {:?}", self.handle);
        // SAFETY: modules are only needed until the pipeline is linked.
        unsafe { self.parent.destroy_raw_shader_module(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn accepts_spirv_header() {
        let bytes = module_bytes(&[SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]);
        let words = spirv_words(&bytes).unwrap();
        assert_eq!(words.len(), 5);
        assert_eq!(words[1], 0x0001_0000);
    }

    #[test]
    fn unaligned_input_is_copied() {
        let mut bytes = vec![0u8];
        bytes.extend(module_bytes(&[SPIRV_MAGIC, 7]));
        let words = spirv_words(&bytes[1..]).unwrap();
        assert_eq!(&*words, &[SPIRV_MAGIC, 7]);
    }

    #[test]
    fn rejects_bad_length_and_magic() {
        assert!(matches!(
            spirv_words(&[1, 2, 3]),
            Err(CreateShaderModuleError::InvalidLength(3))
        ));
        assert!(matches!(
            spirv_words(&[]),
            Err(CreateShaderModuleError::InvalidLength(0))
        ));
        let bytes = module_bytes(&[0xdead_beef]);
        assert!(matches!(
            spirv_words(&bytes),
            Err(CreateShaderModuleError::BadMagic(0xdead_beef))
        ));
    }

    #[test]
    fn missing_file_names_path() {
        let err = load_spirv("/nonexistent/shader.spv").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/shader.spv"));
    }
}
