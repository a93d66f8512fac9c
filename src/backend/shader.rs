// Shader module loading
//
// Vulkan consumes SPIR-V bytecode. The blobs are compiled outside the
// renderer (see build.rs); this module only checks that the bytes look like
// SPIR-V and wraps them in shader modules.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use ash::vk;
use thiserror::Error;

use crate::config::ShaderConfig;
use crate::error::{RendererError, RendererResult};

/// First word of every SPIR-V module
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Pipeline stage a blob is compiled for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    pub fn flags(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
        }
    }
}

/// Why a shader blob was refused
#[derive(Error, Debug)]
pub enum ShaderError {
    #[error("cannot read {stage:?} shader {path:?}: {source}")]
    Read {
        stage: ShaderStage,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{stage:?} shader is empty")]
    Empty { stage: ShaderStage },

    #[error("{stage:?} shader is not valid SPIR-V: {reason}")]
    Malformed { stage: ShaderStage, reason: String },
}

/// A validated SPIR-V blob
#[derive(Debug, Clone)]
pub struct ShaderBinary {
    pub stage: ShaderStage,
    pub words: Vec<u32>,
}

impl ShaderBinary {
    /// Read a blob from disk
    pub fn load<P: AsRef<Path>>(stage: ShaderStage, path: P) -> Result<Self, ShaderError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| ShaderError::Read {
            stage,
            path: path.to_path_buf(),
            source,
        })?;
        let binary = Self::from_bytes(stage, &bytes)?;
        log::info!("Loaded {:?} shader {:?} ({} bytes)", stage, path, bytes.len());
        Ok(binary)
    }

    /// Validate raw bytes and decode them into SPIR-V words
    pub fn from_bytes(stage: ShaderStage, bytes: &[u8]) -> Result<Self, ShaderError> {
        if bytes.is_empty() {
            return Err(ShaderError::Empty { stage });
        }

        // read_spv checks the length and fixes up byte order
        let words = ash::util::read_spv(&mut Cursor::new(bytes)).map_err(|e| ShaderError::Malformed {
            stage,
            reason: e.to_string(),
        })?;

        if words.first() != Some(&SPIRV_MAGIC) {
            return Err(ShaderError::Malformed {
                stage,
                reason: "missing SPIR-V magic number".to_string(),
            });
        }

        Ok(Self { stage, words })
    }

    /// Wrap the words in a shader module
    pub fn create_module(&self, device: &ash::Device) -> RendererResult<vk::ShaderModule> {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(&self.words);

        unsafe { device.create_shader_module(&create_info, None) }.map_err(|result| {
            RendererError::Pipeline {
                context: "shader module creation",
                result,
            }
        })
    }
}

/// The vertex and fragment blobs of the fixed pipeline
#[derive(Debug, Clone)]
pub struct ShaderSet {
    pub vertex: ShaderBinary,
    pub fragment: ShaderBinary,
}

impl ShaderSet {
    pub fn load(config: &ShaderConfig) -> Result<Self, ShaderError> {
        Ok(Self {
            vertex: ShaderBinary::load(ShaderStage::Vertex, &config.vertex)?,
            fragment: ShaderBinary::load(ShaderStage::Fragment, &config.fragment)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spirv_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn test_valid_blob_decodes() {
        let bytes = spirv_bytes(&[SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]);
        let binary = ShaderBinary::from_bytes(ShaderStage::Vertex, &bytes).unwrap();
        assert_eq!(binary.words.len(), 5);
        assert_eq!(binary.words[0], SPIRV_MAGIC);
        assert_eq!(binary.stage.flags(), vk::ShaderStageFlags::VERTEX);
    }

    #[test]
    fn test_big_endian_blob_is_swapped() {
        let bytes: Vec<u8> = [SPIRV_MAGIC, 7].iter().flat_map(|w| w.to_be_bytes()).collect();
        let binary = ShaderBinary::from_bytes(ShaderStage::Fragment, &bytes).unwrap();
        assert_eq!(binary.words, vec![SPIRV_MAGIC, 7]);
    }

    #[test]
    fn test_empty_blob_rejected() {
        assert!(matches!(
            ShaderBinary::from_bytes(ShaderStage::Fragment, &[]),
            Err(ShaderError::Empty {
                stage: ShaderStage::Fragment
            })
        ));
    }

    #[test]
    fn test_unaligned_blob_rejected() {
        let mut bytes = spirv_bytes(&[SPIRV_MAGIC, 1]);
        bytes.pop();
        assert!(matches!(
            ShaderBinary::from_bytes(ShaderStage::Vertex, &bytes),
            Err(ShaderError::Malformed { .. })
        ));
    }

    #[test]
    fn test_wrong_magic_rejected() {
        let bytes = spirv_bytes(&[0xdead_beef, 1, 2]);
        let err = ShaderBinary::from_bytes(ShaderStage::Vertex, &bytes).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = ShaderBinary::load(ShaderStage::Vertex, "no/such/shader.spv").unwrap_err();
        assert!(matches!(err, ShaderError::Read { .. }));
        assert!(err.to_string().contains("shader.spv"));
    }
}
