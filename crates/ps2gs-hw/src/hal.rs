//! Backend abstraction.
//!
//! [`GsBackend`] is the narrow native-API surface the GS device drives: object
//! creation, immediate-context style binds, draws, copies, compute dispatches,
//! timestamp queries and the presentation surface. Every bind call is issued
//! unconditionally; redundant-change suppression lives in
//! [`crate::state::StateCache`], not in the backends.

use std::fmt;

use bitflags::bitflags;
use hashbrown::HashMap;

use crate::error::GsError;
use crate::shader::{FeatureLevel, ShaderMacros, ShaderStage};
use crate::texture::{TextureFormat, TextureType};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u32);

        impl $name {
            pub fn raw(self) -> u32 {
                self.0
            }
        }

        impl ResourceId for $name {
            const KIND: &'static str = $kind;

            fn from_raw(raw: u32) -> Self {
                Self(raw)
            }

            fn raw(self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", $kind, self.0)
            }
        }
    };
}

pub trait ResourceId: Copy + Eq + std::hash::Hash {
    const KIND: &'static str;
    fn from_raw(raw: u32) -> Self;
    fn raw(self) -> u32;
}

define_id!(TextureId, "texture");
define_id!(BufferId, "buffer");
define_id!(ShaderId, "shader");
define_id!(InputLayoutId, "input layout");
define_id!(BlendStateId, "blend state");
define_id!(DepthStencilStateId, "depth-stencil state");
define_id!(SamplerId, "sampler");

/// Owning table of backend objects addressed by typed ids.
///
/// Ids are never reused, so a stale id held by a cache can only miss, never
/// alias a newer object.
pub struct ResourceRegistry<I, T> {
    next: u32,
    entries: HashMap<u32, T>,
    _id: std::marker::PhantomData<I>,
}

impl<I: ResourceId, T> Default for ResourceRegistry<I, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: ResourceId, T> ResourceRegistry<I, T> {
    pub fn new() -> Self {
        Self {
            next: 1,
            entries: HashMap::new(),
            _id: std::marker::PhantomData,
        }
    }

    pub fn insert(&mut self, value: T) -> I {
        let raw = self.next;
        self.next = self.next.wrapping_add(1).max(1);
        self.entries.insert(raw, value);
        I::from_raw(raw)
    }

    pub fn get(&self, id: I) -> Result<&T, GsError> {
        self.entries.get(&id.raw()).ok_or(GsError::InvalidHandle {
            kind: I::KIND,
            id: id.raw(),
        })
    }

    pub fn get_mut(&mut self, id: I) -> Result<&mut T, GsError> {
        self.entries.get_mut(&id.raw()).ok_or(GsError::InvalidHandle {
            kind: I::KIND,
            id: id.raw(),
        })
    }

    pub fn remove(&mut self, id: I) -> Option<T> {
        self.entries.remove(&id.raw())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.values()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (I, T)> + '_ {
        self.entries.drain().map(|(raw, v)| (I::from_raw(raw), v))
    }
}

/// Integer pixel rectangle, right/bottom exclusive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct IntRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl IntRect {
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub const fn from_size(width: u32, height: u32) -> Self {
        Self::new(0, 0, width as i32, height as i32)
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }

    pub fn to_f32(self) -> RectF {
        RectF::new(
            self.left as f32,
            self.top as f32,
            self.right as f32,
            self.bottom as f32,
        )
    }
}

/// Float rectangle; pixels for destinations, normalized UVs for sources.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RectF {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl RectF {
    pub const UNIT: RectF = RectF::new(0.0, 0.0, 1.0, 1.0);

    pub const fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn from_size(width: u32, height: u32) -> Self {
        Self::new(0.0, 0.0, width as f32, height as f32)
    }

    /// Normalizes a pixel rectangle against a surface size.
    pub fn normalized(self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        Self::new(self.left / w, self.top / h, self.right / w, self.bottom / h)
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn offset(self, dx: f32, dy: f32) -> Self {
        Self::new(self.left + dx, self.top + dy, self.right + dx, self.bottom + dy)
    }

    pub fn to_int(self) -> IntRect {
        IntRect::new(
            self.left as i32,
            self.top as i32,
            self.right as i32,
            self.bottom as i32,
        )
    }
}

bitflags! {
    /// Render-target channel write mask.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct ColorMask: u8 {
        const R = 1 << 0;
        const G = 1 << 1;
        const B = 1 << 2;
        const A = 1 << 3;
        const RGB = Self::R.bits() | Self::G.bits() | Self::B.bits();
    }
}

impl ColorMask {
    pub fn from_channels(r: bool, g: bool, b: bool, a: bool) -> Self {
        let mut mask = ColorMask::empty();
        mask.set(ColorMask::R, r);
        mask.set(ColorMask::G, g);
        mask.set(ColorMask::B, b);
        mask.set(ColorMask::A, a);
        mask
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub levels: u32,
    pub format: TextureFormat,
    pub ty: TextureType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Vertex,
    Index,
    /// Shader-readable array of `stride`-sized elements.
    Structured { stride: u32 },
    Constant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferDesc {
    pub label: &'static str,
    pub kind: BufferKind,
    pub size: u32,
}

/// How a streaming write relates to earlier writes into the same buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MapMode {
    /// Previous contents may be discarded; pending GPU reads keep the old storage.
    Discard,
    /// Append into space no pending GPU read touches.
    NoOverwrite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float32,
    Float32x2,
    Float32x4,
    Uint32,
    Uint16x2,
    Uint8x4,
    Unorm8x4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InputElement {
    pub semantic: &'static str,
    pub semantic_index: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    TriangleList,
    TriangleStrip,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    InvSrcColor,
    SrcAlpha,
    InvSrcAlpha,
    DstColor,
    InvDstColor,
    DstAlpha,
    InvDstAlpha,
    Src1Color,
    InvSrc1Color,
    Src1Alpha,
    InvSrc1Alpha,
    /// The blend factor set alongside the blend state.
    Constant,
    InvConstant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlendOp {
    Add,
    Subtract,
    RevSubtract,
    Min,
    Max,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlendDesc {
    pub enable: bool,
    pub src: BlendFactor,
    pub dst: BlendFactor,
    pub op: BlendOp,
    pub src_alpha: BlendFactor,
    pub dst_alpha: BlendFactor,
    pub op_alpha: BlendOp,
    pub write_mask: ColorMask,
}

impl BlendDesc {
    /// Blending off, writing the channels in `write_mask`.
    pub const fn opaque(write_mask: ColorMask) -> Self {
        Self {
            enable: false,
            src: BlendFactor::One,
            dst: BlendFactor::Zero,
            op: BlendOp::Add,
            src_alpha: BlendFactor::One,
            dst_alpha: BlendFactor::Zero,
            op_alpha: BlendOp::Add,
            write_mask,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompareFunc {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StencilOp {
    Keep,
    Zero,
    Replace,
    IncrementClamp,
    DecrementClamp,
    Invert,
    IncrementWrap,
    DecrementWrap,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StencilFaceDesc {
    pub func: CompareFunc,
    pub pass_op: StencilOp,
    pub fail_op: StencilOp,
    pub depth_fail_op: StencilOp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DepthStencilDesc {
    pub depth_enable: bool,
    pub depth_write: bool,
    pub depth_func: CompareFunc,
    pub stencil_enable: bool,
    pub stencil_read_mask: u8,
    pub stencil_write_mask: u8,
    pub stencil: StencilFaceDesc,
}

impl DepthStencilDesc {
    /// Depth and stencil both off.
    pub const DISABLED: DepthStencilDesc = DepthStencilDesc {
        depth_enable: false,
        depth_write: false,
        depth_func: CompareFunc::Always,
        stencil_enable: false,
        stencil_read_mask: 0,
        stencil_write_mask: 0,
        stencil: StencilFaceDesc {
            func: CompareFunc::Always,
            pass_op: StencilOp::Keep,
            fail_op: StencilOp::Keep,
            depth_fail_op: StencilOp::Keep,
        },
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterMode {
    Point,
    Linear,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressMode {
    Clamp,
    Wrap,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SamplerDesc {
    pub mag_filter: FilterMode,
    pub min_filter: FilterMode,
    pub mip_filter: FilterMode,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    /// 0 or 1 disables anisotropic filtering.
    pub max_anisotropy: u8,
    /// Clamp sampling to a fraction of the base level.
    pub lod_clamp: bool,
}

impl SamplerDesc {
    pub const fn clamped(filter: FilterMode) -> Self {
        Self {
            mag_filter: filter,
            min_filter: filter,
            mip_filter: filter,
            address_u: AddressMode::Clamp,
            address_v: AddressMode::Clamp,
            max_anisotropy: 0,
            lod_clamp: false,
        }
    }
}

/// Optional capabilities reported by a backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GsFeatures {
    /// Structured vertex buffers readable from the vertex shader.
    pub vs_expand: bool,
    /// Compute shaders with storage texture writes.
    pub compute_shaders: bool,
    pub dual_source_blend: bool,
    pub timestamp_queries: bool,
    pub debug_markers: bool,
    pub max_texture_size: u32,
}

impl Default for GsFeatures {
    fn default() -> Self {
        Self {
            vs_expand: true,
            compute_shaders: true,
            dual_source_blend: true,
            timestamp_queries: false,
            debug_markers: false,
            max_texture_size: 8192,
        }
    }
}

/// Result of polling one timestamp ring slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimestampReadback {
    NotReady,
    /// The clock was discontinuous while the query was in flight.
    Disjoint,
    Ready { start: u64, end: u64, frequency: u64 },
}

/// Native device surface driven by the GS device.
pub trait GsBackend {
    fn name(&self) -> &'static str;
    fn features(&self) -> GsFeatures;
    fn feature_level(&self) -> FeatureLevel;

    // Object creation.
    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, GsError>;
    fn destroy_texture(&mut self, texture: TextureId);
    /// Uploads `data` (rows of `pitch` bytes) into `rect` of mip level 0.
    fn write_texture(
        &mut self,
        texture: TextureId,
        rect: IntRect,
        data: &[u8],
        pitch: u32,
    ) -> Result<(), GsError>;
    fn create_buffer(&mut self, desc: &BufferDesc, contents: Option<&[u8]>) -> Result<BufferId, GsError>;
    fn destroy_buffer(&mut self, buffer: BufferId);
    /// Streaming write into a vertex, index or structured buffer.
    fn write_buffer(
        &mut self,
        buffer: BufferId,
        offset: u32,
        data: &[u8],
        mode: MapMode,
    ) -> Result<(), GsError>;
    /// Constant-buffer update, ordered with the surrounding draws.
    fn update_buffer(&mut self, buffer: BufferId, offset: u32, data: &[u8]);
    fn compile_shader(
        &mut self,
        stage: ShaderStage,
        source: &str,
        macros: &ShaderMacros,
        entry_point: &str,
    ) -> Result<ShaderId, GsError>;
    fn destroy_shader(&mut self, shader: ShaderId);
    fn create_input_layout(
        &mut self,
        elements: &[InputElement],
        stride: u32,
    ) -> Result<InputLayoutId, GsError>;
    fn create_blend_state(&mut self, desc: &BlendDesc) -> Result<BlendStateId, GsError>;
    fn create_depth_stencil_state(
        &mut self,
        desc: &DepthStencilDesc,
    ) -> Result<DepthStencilStateId, GsError>;
    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerId, GsError>;
    fn destroy_input_layout(&mut self, layout: InputLayoutId);
    fn destroy_blend_state(&mut self, state: BlendStateId);
    fn destroy_depth_stencil_state(&mut self, state: DepthStencilStateId);
    fn destroy_sampler(&mut self, sampler: SamplerId);

    // Binds.
    fn set_vertex_shader(&mut self, shader: Option<ShaderId>);
    fn set_vs_constant_buffer(&mut self, buffer: Option<BufferId>);
    fn set_vs_structured_buffer(&mut self, buffer: Option<BufferId>);
    fn set_pixel_shader(&mut self, shader: Option<ShaderId>);
    fn set_ps_constant_buffer(&mut self, buffer: Option<BufferId>);
    fn set_ps_shader_resource(&mut self, slot: usize, texture: Option<TextureId>);
    fn set_ps_sampler(&mut self, slot: usize, sampler: Option<SamplerId>);
    /// `factor` is broadcast to `(factor, factor, factor, 0)`.
    fn set_blend_state(&mut self, state: BlendStateId, factor: f32);
    fn set_depth_stencil_state(&mut self, state: DepthStencilStateId, stencil_ref: u8);
    fn set_render_targets(&mut self, rt: Option<TextureId>, ds: Option<TextureId>);
    fn set_input_layout(&mut self, layout: Option<InputLayoutId>);
    fn set_primitive_topology(&mut self, topology: PrimitiveTopology);
    fn set_vertex_buffer(&mut self, buffer: BufferId, stride: u32);
    fn set_index_buffer(&mut self, buffer: Option<BufferId>);
    fn set_viewport(&mut self, width: u32, height: u32);
    fn set_scissor(&mut self, rect: IntRect);

    // Work.
    fn draw(&mut self, vertex_count: u32, first_vertex: u32);
    fn draw_indexed(&mut self, index_count: u32, first_index: u32, base_vertex: u32);
    fn clear_render_target(&mut self, texture: TextureId, color: [f32; 4]);
    fn clear_depth(&mut self, texture: TextureId, depth: f32);
    fn clear_stencil(&mut self, texture: TextureId, value: u8);
    /// Contents become undefined; lets tilers skip the load.
    fn invalidate(&mut self, texture: TextureId);
    /// Copies `rect` of `src` (whole surface when `None`) to `(dst_x, dst_y)` in `dst`.
    fn copy_texture_region(
        &mut self,
        src: TextureId,
        dst: TextureId,
        rect: Option<IntRect>,
        dst_x: u32,
        dst_y: u32,
    );

    // Compute.
    fn set_compute_shader(&mut self, shader: Option<ShaderId>);
    fn set_cs_constant_buffer(&mut self, buffer: Option<BufferId>);
    fn set_cs_resources(&mut self, src: Option<TextureId>, dst: Option<TextureId>);
    fn dispatch(&mut self, x: u32, y: u32, z: u32);

    // Timestamp ring.
    fn create_timestamp_queries(&mut self, _count: usize) -> Result<(), GsError> {
        Err(GsError::Unsupported("timestamp queries"))
    }
    fn destroy_timestamp_queries(&mut self) {}
    fn begin_timestamp_query(&mut self, _slot: usize) {}
    fn end_timestamp_query(&mut self, _slot: usize) {}
    fn read_timestamp_query(&mut self, _slot: usize) -> TimestampReadback {
        TimestampReadback::NotReady
    }

    // Debug annotations.
    fn push_debug_group(&mut self, _label: &str) {}
    fn pop_debug_group(&mut self) {}
    fn insert_debug_marker(&mut self, _label: &str) {}

    // Presentation surface.
    fn has_surface(&self) -> bool;
    fn surface_size(&self) -> (u32, u32);
    fn resize_surface(&mut self, width: u32, height: u32);
    fn exclusive_fullscreen_lost(&mut self) -> bool {
        false
    }
    /// Render-target id for the current back buffer.
    fn surface_texture(&mut self) -> Result<TextureId, GsError>;
    fn present(&mut self, vsync: bool) -> Result<(), GsError>;
    /// Submits all recorded work.
    fn flush(&mut self) -> Result<(), GsError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_never_reuses_ids() {
        let mut registry: ResourceRegistry<TextureId, &str> = ResourceRegistry::new();
        let a = registry.insert("a");
        assert_eq!(registry.remove(a), Some("a"));
        let b = registry.insert("b");
        assert_ne!(a, b);
        assert!(matches!(
            registry.get(a),
            Err(GsError::InvalidHandle { kind: "texture", .. })
        ));
        assert_eq!(registry.get(b).copied().ok(), Some("b"));
    }

    #[test]
    fn rect_normalization() {
        let r = IntRect::new(16, 8, 48, 40).to_f32().normalized(64, 32);
        assert_eq!(r, RectF::new(0.25, 0.25, 0.75, 1.25));
        assert_eq!(IntRect::from_size(640, 448).width(), 640);
        assert!(IntRect::new(4, 4, 4, 10).is_empty());
    }

    #[test]
    fn color_mask_from_channels() {
        assert_eq!(ColorMask::from_channels(true, false, false, true), ColorMask::R | ColorMask::A);
        assert_eq!(ColorMask::all().bits(), 0xf);
    }
}
