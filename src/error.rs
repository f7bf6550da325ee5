// Fatal backend errors
//
// Anything in here aborts initialization. Callers receive these wrapped in
// `anyhow::Error` and can downcast when they need to tell them apart.

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no Vulkan-compatible devices found")]
    NoDevices,

    #[error("failed to create logical device: {0}")]
    DeviceCreation(vk::Result),

    #[error("failed to create command pool for queue family {family}: {result}")]
    CommandPool { family: u32, result: vk::Result },

    #[error("shader resource not found: {}", .0.display())]
    ShaderNotFound(PathBuf),

    #[error("device workaround '{description}' aborted device setup: {reason}")]
    WorkaroundAborted {
        description: String,
        reason: String,
    },
}
