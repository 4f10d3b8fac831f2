//! GPU-visible vertex and constant layouts.

use std::ops::Range;

use bytemuck::{Pod, Zeroable};

use crate::hal::{InputElement, VertexFormat};

/// GS vertex as produced by the vertex trace, 32 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct GsVertex {
    pub st: [f32; 2],
    pub rgba: [u8; 4],
    pub q: f32,
    /// 12.4 fixed point screen position.
    pub xy: [u16; 2],
    pub z: u32,
    pub uv: [u16; 2],
    /// Fog coefficient in the top byte.
    pub fog: u32,
}

pub const GS_VERTEX_LAYOUT: [InputElement; 7] = [
    InputElement { semantic: "TEXCOORD", semantic_index: 0, format: VertexFormat::Float32x2, offset: 0 },
    InputElement { semantic: "COLOR", semantic_index: 0, format: VertexFormat::Uint8x4, offset: 8 },
    InputElement { semantic: "TEXCOORD", semantic_index: 1, format: VertexFormat::Float32, offset: 12 },
    InputElement { semantic: "POSITION", semantic_index: 0, format: VertexFormat::Uint16x2, offset: 16 },
    InputElement { semantic: "POSITION", semantic_index: 1, format: VertexFormat::Uint32, offset: 20 },
    InputElement { semantic: "TEXCOORD", semantic_index: 2, format: VertexFormat::Uint16x2, offset: 24 },
    InputElement { semantic: "COLOR", semantic_index: 1, format: VertexFormat::Unorm8x4, offset: 28 },
];

/// Position plus texture coordinate, used by every full-screen pass.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ConvertVertex {
    pub pos: [f32; 4],
    pub uv: [f32; 2],
    pub _pad: [u32; 2],
}

impl ConvertVertex {
    pub fn new(x: f32, y: f32, u: f32, v: f32) -> Self {
        Self {
            pos: [x, y, 0.5, 1.0],
            uv: [u, v],
            _pad: [0; 2],
        }
    }
}

pub const CONVERT_VERTEX_LAYOUT: [InputElement; 3] = [
    InputElement { semantic: "POSITION", semantic_index: 0, format: VertexFormat::Float32x4, offset: 0 },
    InputElement { semantic: "TEXCOORD", semantic_index: 0, format: VertexFormat::Float32x2, offset: 16 },
    InputElement { semantic: "COLOR", semantic_index: 0, format: VertexFormat::Unorm8x4, offset: 28 },
];

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct VsConstants {
    pub vertex_scale: [f32; 2],
    pub vertex_offset: [f32; 2],
    pub texture_scale: [f32; 2],
    pub texture_offset: [f32; 2],
    pub point_size: [f32; 2],
    /// `x` is the depth mask; `y` receives the base vertex of expanded draws.
    pub max_depth: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct PsConstants {
    /// Fog color in xyz, alpha-test reference in w.
    pub fog_color_aref: [f32; 4],
    pub wh: [f32; 4],
    pub ta_max_depth_af: [f32; 4],
    pub msk_fix: [u32; 4],
    pub fb_mask: [u32; 4],
    pub half_texel: [f32; 4],
    pub min_max: [f32; 4],
    pub lod_params: [f32; 4],
    pub st_range: [f32; 4],
    pub channel_shuffle: [i32; 4],
    pub tc_offset_hack: [f32; 2],
    pub st_scale: [f32; 2],
    pub dither_matrix: [[f32; 4]; 4],
    pub scale_factor: [f32; 4],
}

impl PsConstants {
    pub fn aref(&self) -> f32 {
        self.fog_color_aref[3]
    }

    pub fn set_aref(&mut self, aref: f32) {
        self.fog_color_aref[3] = aref;
    }
}

/// Last uploaded contents of a constant buffer.
///
/// Diffing happens on 4-byte words so the dirty range can go straight into a
/// buffer update.
#[derive(Debug)]
pub struct ConstantCache<T: Pod> {
    last: Option<T>,
}

impl<T: Pod> Default for ConstantCache<T> {
    fn default() -> Self {
        Self { last: None }
    }
}

impl<T: Pod> ConstantCache<T> {
    /// Records `value` and returns the byte range that changed, if any.
    pub fn update(&mut self, value: &T) -> Option<Range<usize>> {
        let new = bytemuck::bytes_of(value);
        let range = match &self.last {
            None => Some(0..new.len()),
            Some(last) => dirty_range(bytemuck::bytes_of(last), new),
        };
        if range.is_some() {
            self.last = Some(*value);
        }
        range
    }

    pub fn invalidate(&mut self) {
        self.last = None;
    }
}

fn dirty_range(old: &[u8], new: &[u8]) -> Option<Range<usize>> {
    debug_assert_eq!(old.len(), new.len());
    let first = old.iter().zip(new).position(|(a, b)| a != b)?;
    let last = old.iter().zip(new).rposition(|(a, b)| a != b)?;
    let start = first / 4 * 4;
    let end = ((last + 1).div_ceil(4) * 4).min(new.len());
    Some(start..end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_are_stable() {
        assert_eq!(std::mem::size_of::<GsVertex>(), 32);
        assert_eq!(std::mem::size_of::<ConvertVertex>(), 32);
        assert_eq!(std::mem::size_of::<VsConstants>(), 48);
        assert_eq!(std::mem::size_of::<PsConstants>(), 256);
    }

    #[test]
    fn first_update_uploads_everything() {
        let mut cache = ConstantCache::<VsConstants>::default();
        assert_eq!(cache.update(&VsConstants::default()), Some(0..48));
        assert_eq!(cache.update(&VsConstants::default()), None);
    }

    #[test]
    fn aref_change_dirties_one_word() {
        let mut cache = ConstantCache::<PsConstants>::default();
        let mut cb = PsConstants::default();
        cache.update(&cb);
        cb.set_aref(0.5);
        assert_eq!(cache.update(&cb), Some(12..16));
        assert_eq!(cache.update(&cb), None);

        cache.invalidate();
        assert_eq!(cache.update(&cb), Some(0..256));
    }
}
