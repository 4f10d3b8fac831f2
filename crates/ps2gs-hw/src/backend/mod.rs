pub mod recording;
pub mod wgpu_backend;

pub use recording::{NativeCall, RecordingBackend};
pub use wgpu_backend::WgpuBackend;
