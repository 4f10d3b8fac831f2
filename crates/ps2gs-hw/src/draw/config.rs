//! Declarative description of one emulated draw.

use crate::blend::{HwBlendFactor, HwBlendOp};
use crate::draw::constants::{GsVertex, PsConstants, VsConstants};
use crate::hal::{ColorMask, CompareFunc, IntRect, PrimitiveTopology};
use crate::texture::Texture;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Topology {
    Point,
    Line,
    #[default]
    Triangle,
}

impl Topology {
    pub fn to_native(self) -> PrimitiveTopology {
        match self {
            Topology::Point => PrimitiveTopology::PointList,
            Topology::Line => PrimitiveTopology::LineList,
            Topology::Triangle => PrimitiveTopology::TriangleList,
        }
    }
}

/// How destination alpha testing (`DATE`) is emulated for a draw.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DestinationAlphaMode {
    #[default]
    Off,
    /// Stencil pre-pass marks pixels whose alpha passes the test.
    Stencil,
    /// Like `Stencil`, but each pixel may only be written once.
    StencilOne,
    /// Track the first primitive that failed the test per pixel.
    PrimIDTracking,
}

/// Shader-side primitive expansion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VsExpand {
    #[default]
    None,
    Point,
    Line,
    Sprite,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct VsSelector {
    pub fst: bool,
    pub tme: bool,
    pub iip: bool,
    pub point_size: bool,
    pub expand: VsExpand,
}

impl VsSelector {
    /// Point and sprite expansion draw quads out of the shared expand index buffer.
    pub fn use_expand_index_buffer(&self) -> bool {
        matches!(self.expand, VsExpand::Point | VsExpand::Sprite)
    }

    /// Index count for expanded draws over `nverts` source vertices.
    pub fn expand_index_count(&self, nverts: u32) -> u32 {
        match self.expand {
            VsExpand::Point => nverts * 6,
            VsExpand::Sprite => nverts / 2 * 6,
            VsExpand::Line => nverts / 2 * 6,
            VsExpand::None => 0,
        }
    }
}

/// Pixel shader permutation bits.
///
/// Field widths follow the GS register fields they are derived from; the
/// pipeline resolver turns each into a `PS_*` macro.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PsSelector {
    // Formats
    pub aem_fmt: u8,
    pub pal_fmt: u8,
    pub dst_fmt: u8,
    pub depth_fmt: u8,
    // Alpha extension
    pub aem: bool,
    pub fba: bool,
    pub fog: bool,
    pub iip: bool,
    // Pixel tests
    /// 0 off, 1/2 stencil based, 3 primitive-ID based.
    pub date: u8,
    pub atst: u8,
    pub afail: u8,
    // Texture sampling
    pub fst: bool,
    pub tfx: u8,
    pub tcc: bool,
    pub wms: u8,
    pub wmt: u8,
    pub adjs: bool,
    pub adjt: bool,
    pub ltf: bool,
    // Shuffles and frame buffer masking
    pub shuffle: bool,
    pub shuffle_same: bool,
    pub real16src: bool,
    pub process_ba: bool,
    pub process_rg: bool,
    pub shuffle_across: bool,
    pub write_rg: bool,
    pub fbmask: bool,
    // Blending
    pub blend_a: u8,
    pub blend_b: u8,
    pub blend_c: u8,
    pub blend_d: u8,
    pub fixed_one_a: bool,
    pub blend_hw: u8,
    pub a_masked: bool,
    pub hdr: bool,
    pub colclip: bool,
    pub blend_mix: u8,
    pub round_inv: bool,
    pub pabe: bool,
    pub no_color: bool,
    pub no_color1: bool,
    pub no_ablend: bool,
    pub only_alpha: bool,
    pub channel: u8,
    pub dither: u8,
    pub zclamp: bool,
    // Game-specific paths
    pub tcoffsethack: bool,
    pub urban_shadows: bool,
    pub tales_of_abyss_hle: bool,
    pub point_sampler: bool,
    pub region_rect: bool,
    // Mipmapping
    pub automatic_lod: bool,
    pub manual_lod: bool,
}

impl PsSelector {
    /// The shader does not sample a texture.
    pub fn is_untextured(&self) -> bool {
        self.tfx == 4
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SamplerSelector {
    /// Wrap in U instead of clamping.
    pub tau: bool,
    pub tav: bool,
    /// Bilinear magnification.
    pub biln: bool,
    /// GS minification filter (`MMIN`), 0..=5.
    pub triln: u8,
    pub aniso: bool,
    pub lodclamp: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ZTest {
    Never,
    #[default]
    Always,
    GEqual,
    Greater,
}

impl ZTest {
    pub fn to_native(self) -> CompareFunc {
        match self {
            ZTest::Never => CompareFunc::Never,
            ZTest::Always => CompareFunc::Always,
            ZTest::GEqual => CompareFunc::GreaterEqual,
            ZTest::Greater => CompareFunc::Greater,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DepthStencilSelector {
    pub ztst: ZTest,
    pub zwe: bool,
    /// Test the stencil bit written by the destination alpha pre-pass.
    pub date: bool,
    /// Clear the stencil bit on pass so each pixel is written once.
    pub date_one: bool,
}

/// GS alpha blend translated to a hardware equation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlendState {
    pub enable: bool,
    /// `AFIX`, 0x80 is 1.0.
    pub constant: u8,
    pub op: HwBlendOp,
    pub src_factor: HwBlendFactor,
    pub dst_factor: HwBlendFactor,
}

impl Default for BlendState {
    fn default() -> Self {
        Self {
            enable: false,
            constant: 0,
            op: HwBlendOp::Add,
            src_factor: HwBlendFactor::ConstOne,
            dst_factor: HwBlendFactor::ConstZero,
        }
    }
}

impl BlendState {
    pub fn new(op: HwBlendOp, src_factor: HwBlendFactor, dst_factor: HwBlendFactor, constant: u8) -> Self {
        Self {
            enable: true,
            constant,
            op,
            src_factor,
            dst_factor,
        }
    }
}

/// Output-merger blend key: write mask plus the color equation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlendSelector {
    pub wrgba: ColorMask,
    pub enable: bool,
    pub src: HwBlendFactor,
    pub dst: HwBlendFactor,
    pub op: HwBlendOp,
}

impl BlendSelector {
    /// Blending off, writing `wrgba`.
    pub fn write_only(wrgba: ColorMask) -> Self {
        Self {
            wrgba,
            enable: false,
            src: HwBlendFactor::ConstOne,
            dst: HwBlendFactor::ConstZero,
            op: HwBlendOp::Add,
        }
    }
}

/// Combines a color mask and blend state into an output-merger key.
///
/// The equation only takes part when blending is enabled, so disabled blends
/// with different leftover factors share one native state.
pub fn convert_sel(colormask: ColorMask, blend: &BlendState) -> BlendSelector {
    let mut sel = BlendSelector::write_only(colormask);
    if blend.enable {
        sel.enable = true;
        sel.src = blend.src_factor;
        sel.dst = blend.dst_factor;
        sel.op = blend.op;
    }
    sel
}

/// Rewrites a pass so it only produces alpha.
///
/// Used for the separate alpha passes that follow a color draw: the shader
/// skips software blending, only alpha is written, hardware blending is off,
/// and depth writes become a `GEQUAL` test so the pass does not fight the
/// depth values the color pass already wrote.
pub fn set_hw_draw_config_for_alpha_pass(
    ps: &mut PsSelector,
    colormask: &mut ColorMask,
    blend: &mut BlendState,
    depth: &mut DepthStencilSelector,
) {
    ps.no_ablend = false;
    ps.only_alpha = true;
    ps.blend_a = 0;
    ps.blend_b = 0;
    ps.blend_c = 0;
    ps.blend_d = 0;

    *colormask = ColorMask::A;
    blend.enable = false;

    if depth.zwe {
        depth.zwe = false;
        depth.ztst = ZTest::GEqual;
    }
}

/// Optional re-run of the draw with a different alpha test outcome.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AlphaSecondPass {
    pub enable: bool,
    pub colormask: ColorMask,
    pub depth: DepthStencilSelector,
    pub ps: PsSelector,
    /// Alpha-test reference for the second pass.
    pub ps_aref: f32,
}

/// Everything needed to issue one emulated GS draw.
#[derive(Clone, Debug, Default)]
pub struct HwDrawConfig<'a> {
    pub rt: Option<Texture>,
    pub ds: Option<Texture>,
    pub tex: Option<Texture>,
    pub pal: Option<Texture>,
    pub verts: &'a [GsVertex],
    /// Ignored when the vertex shader expands points or sprites.
    pub indices: &'a [u16],
    pub topology: Topology,
    /// Bounding box of the draw in target pixels.
    pub drawarea: IntRect,
    pub scissor: IntRect,
    pub vs: VsSelector,
    pub ps: PsSelector,
    pub sampler: SamplerSelector,
    pub colormask: ColorMask,
    pub blend: BlendState,
    pub depth: DepthStencilSelector,
    pub destination_alpha: DestinationAlphaMode,
    /// Alpha test mode for `DATE`: pixels with alpha set pass.
    pub datm: bool,
    /// The shader reads the current target contents.
    pub require_one_barrier: bool,
    /// Per-primitive barriers; never supported.
    pub require_full_barrier: bool,
    pub separate_alpha_pass: bool,
    pub second_separate_alpha_pass: bool,
    pub alpha_second_pass: AlphaSecondPass,
    pub cb_vs: VsConstants,
    pub cb_ps: PsConstants,
}

impl HwDrawConfig<'_> {
    pub fn nverts(&self) -> u32 {
        self.verts.len() as u32
    }

    pub fn nindices(&self) -> u32 {
        if self.vs.use_expand_index_buffer() {
            self.vs.expand_index_count(self.nverts())
        } else {
            self.indices.len() as u32
        }
    }
}
