// vkscene - Vulkan backend core
//
// Device selection, shader reflection and cross-compilation, and per-object
// GPU state for a scene-graph renderer.

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod shader;

pub use config::Config;
pub use context::{BackendContext, Diagnostics, LogDiagnostics, RecordingDiagnostics};
pub use error::BackendError;
