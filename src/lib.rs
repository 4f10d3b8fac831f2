//! Umbrella package for the PS2 GS hardware renderer workspace.

pub use ps2gs_hw::*;
