//! File transfer configuration.

use serde::Deserialize;

/// Default FILE_GET_CHUNK length in bytes.
pub const DEFAULT_CHUNK_SIZE: u32 = 1024;

/// Control-topic file transfer configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SftConfig {
    /// Subscribe to the control topic and run the file transfer protocol.
    pub enabled: bool,
    /// Bytes requested per FILE_GET_CHUNK.
    pub chunk_size: u32,
    /// Files the device reports in FILE_INFO and accepts updates for.
    pub updateable_files: Vec<String>,
    /// Ask the service for direct download links.
    pub accept_download_link: bool,
}

impl Default for SftConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            updateable_files: Vec::new(),
            accept_download_link: false,
        }
    }
}

impl SftConfig {
    /// Validate the file transfer configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size == 0 {
            return Err("sft.chunk_size must be at least 1".into());
        }
        if self.updateable_files.iter().any(|name| name.is_empty()) {
            return Err("sft.updateable_files must not contain empty names".into());
        }
        Ok(())
    }
}
