//! `ps2gs-hw` is the hardware rendering core of a PS2 Graphics Synthesizer
//! emulator.
//!
//! The crate provides:
//! - A GS device ([`GsDevice`]) that turns fully-resolved draw descriptions
//!   ([`draw::config::HwDrawConfig`]) into native draws, including the HDR
//!   round-trip, destination-alpha setup and multi-pass alpha tests.
//! - The display path: merge, interlace, FXAA, shade boost, CAS and
//!   presentation.
//! - Caches for render state, pipelines, shaders and pooled textures, plus
//!   streaming vertex/index uploads.
//! - A narrow backend trait ([`GsBackend`]) with a `wgpu` implementation and a
//!   recording implementation for tests.

mod error;

pub mod backend;
pub mod blend;
pub mod config;
pub mod convert;
pub mod device;
pub mod draw;
pub mod hal;
pub mod pipeline;
pub mod postfx;
pub mod present;
pub mod shader;
pub mod state;
pub mod stats;
pub mod stream;
pub mod texture;
pub mod timing;

pub use backend::{NativeCall, RecordingBackend, WgpuBackend};
pub use config::{GsDeviceConfig, VsyncMode};
pub use device::{DebugMessageCategory, GsDevice};
pub use error::GsError;
pub use hal::{GsBackend, GsFeatures, IntRect, RectF};
pub use postfx::chain::{ChainTarget, InterlaceMode};
pub use postfx::{GsRegExtbuf, GsRegPmode};
pub use present::{GsEvent, PresentResult};
pub use shader::{DirShaderSource, FeatureLevel, MemoryShaderSource, ShaderSource};
pub use stats::{GsStats, GsStatsSnapshot};
pub use texture::{Texture, TextureFormat, TextureType};
