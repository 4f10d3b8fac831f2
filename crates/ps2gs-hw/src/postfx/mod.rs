//! Full-screen post-processing of the display output.
//!
//! Each `do_*` pass reads one or two textures and writes one destination
//! with a single quad (or, for CAS, a single compute dispatch). Sequencing
//! of the passes over a frame lives in [`chain`].

pub mod chain;

use std::mem::size_of;

use bytemuck::{Pod, Zeroable};
use half::f16;
use tracing::{debug, error, warn};

use crate::convert::{merge_blend_desc, StretchPass};
use crate::device::{create_constant_buffer, GsDevice};
use crate::error::GsError;
use crate::hal::{BlendStateId, BufferId, ColorMask, GsBackend, GsFeatures, RectF, ShaderId};
use crate::shader::{
    cas_shader_source, FeatureLevel, ShaderCache, ShaderConvert, ShaderInterlace, ShaderMacros, ShaderSource,
    ShaderStage, FXAA_SHADER_SOURCE,
};
use crate::texture::Texture;

/// Motion threshold of the MAD deinterlacer.
pub const MAD_SENSITIVITY: f32 = 0.08;
pub const NUM_CAS_CONSTANTS: usize = 10;
/// Pixels covered by one CAS thread group along each axis.
pub const CAS_WORK_REGION_DIM: u32 = 16;

const POSTFX_ENTRY_POINT: &str = "ps_main";
const CAS_ENTRY_POINT: &str = "main";

/// `PMODE` display circuit register fields used by the merge.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GsRegPmode {
    pub en1: bool,
    pub en2: bool,
    /// Blend with the fixed `ALP` value instead of circuit 1's alpha.
    pub mmod: bool,
    pub amod: bool,
    /// Blend circuit 1 with the background color rather than circuit 2.
    pub slbg: bool,
    pub alp: u8,
}

/// `EXTBUF` feedback write register fields used by the merge.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GsRegExtbuf {
    /// 0 writes back circuit 1, 1 circuit 2.
    pub fbin: u8,
    pub emoda: u8,
    pub emodc: u8,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct MergeConstants {
    pub bg_color: [f32; 4],
    pub emoda: u32,
    pub emodc: u32,
    pub _pad: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct InterlaceConstants {
    /// Field buffer index, 1/height, height, MAD sensitivity.
    pub zr_h: [f32; 4],
}

impl InterlaceConstants {
    pub fn new(buf_idx: u32, height: f32) -> Self {
        Self {
            zr_h: [buf_idx as f32, 1.0 / height, height, MAD_SENSITIVITY],
        }
    }
}

/// Thread-group grid covering a `width` x `height` CAS destination.
pub fn cas_dispatch_size(width: u32, height: u32) -> (u32, u32, u32) {
    (
        width.div_ceil(CAS_WORK_REGION_DIM),
        height.div_ceil(CAS_WORK_REGION_DIM),
        1,
    )
}

/// Fills the first eight CAS constants: scaling terms, then sharpness.
///
/// `sharpness` is clamped to 0..=1; entries 8 and 9 (source offset) are left
/// for the caller.
pub fn cas_setup(
    sharpness: f32,
    input_width: f32,
    input_height: f32,
    output_width: f32,
    output_height: f32,
) -> [u32; NUM_CAS_CONSTANTS] {
    let mut c = [0u32; NUM_CAS_CONSTANTS];
    let scale_x = input_width / output_width;
    let scale_y = input_height / output_height;
    c[0] = scale_x.to_bits();
    c[1] = scale_y.to_bits();
    c[2] = (0.5 * scale_x - 0.5).to_bits();
    c[3] = (0.5 * scale_y - 0.5).to_bits();

    let lerp = 8.0 + (5.0 - 8.0) * sharpness.clamp(0.0, 1.0);
    let sharp = -1.0 / lerp;
    c[4] = sharp.to_bits();
    c[5] = u32::from(f16::from_f32(sharp).to_bits()) | (u32::from(f16::from_f32(0.0).to_bits()) << 16);
    c[6] = (8.0 * scale_x).to_bits();
    c[7] = 0;
    c
}

#[derive(Debug)]
pub(crate) struct CasObjects {
    sharpen: ShaderId,
    upscale: ShaderId,
    cb: BufferId,
}

/// Shaders and constant buffers of the post-processing passes.
#[derive(Debug)]
pub(crate) struct PostFxObjects {
    pub(crate) merge_ps: [ShaderId; 2],
    pub(crate) merge_bs: BlendStateId,
    /// Shared with the CLUT and indexed conversions.
    pub(crate) merge_cb: BufferId,
    pub(crate) interlace_ps: [ShaderId; ShaderInterlace::ALL.len()],
    pub(crate) interlace_cb: BufferId,
    pub(crate) shadeboost_ps: ShaderId,
    pub(crate) shadeboost_cb: BufferId,
    /// Compiled on first use.
    pub(crate) fxaa_ps: Option<ShaderId>,
    pub(crate) cas: Option<CasObjects>,
}

impl PostFxObjects {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create<B: GsBackend + ?Sized>(
        backend: &mut B,
        shaders: &mut ShaderCache,
        level: FeatureLevel,
        features: GsFeatures,
        merge_src: &str,
        interlace_src: &str,
        shadeboost_src: &str,
        sources: &dyn ShaderSource,
    ) -> Result<Self, GsError> {
        let macros = ShaderMacros::for_level(level);

        let mut merge_ps = Vec::with_capacity(2);
        for mmod in 0..2 {
            merge_ps.push(shaders.get_or_compile(
                backend,
                ShaderStage::Pixel,
                merge_src,
                &macros,
                &format!("ps_main{mmod}"),
            )?);
        }
        let merge_ps = [merge_ps[0], merge_ps[1]];
        let merge_bs = backend.create_blend_state(&merge_blend_desc())?;
        let merge_cb = create_constant_buffer(backend, "merge constants", size_of::<MergeConstants>())?;

        let mut interlace_ps = [merge_ps[0]; ShaderInterlace::ALL.len()];
        for (slot, shader) in interlace_ps.iter_mut().zip(ShaderInterlace::ALL) {
            *slot = shaders.get_or_compile(backend, ShaderStage::Pixel, interlace_src, &macros, &shader.entry_point())?;
        }
        let interlace_cb = create_constant_buffer(backend, "interlace constants", size_of::<InterlaceConstants>())?;

        let shadeboost_ps =
            shaders.get_or_compile(backend, ShaderStage::Pixel, shadeboost_src, &macros, POSTFX_ENTRY_POINT)?;
        let shadeboost_cb = create_constant_buffer(backend, "shade boost constants", size_of::<[f32; 4]>())?;

        let cas = if features.compute_shaders && level.supports_compute() {
            match CasObjects::create(backend, shaders, level, sources) {
                Ok(cas) => Some(cas),
                Err(err) => {
                    warn!(%err, "CAS shaders unavailable, sharpening disabled");
                    None
                }
            }
        } else {
            debug!(?level, "compute shaders unsupported, CAS disabled");
            None
        };

        Ok(Self {
            merge_ps,
            merge_bs,
            merge_cb,
            interlace_ps,
            interlace_cb,
            shadeboost_ps,
            shadeboost_cb,
            fxaa_ps: None,
            cas,
        })
    }

    pub(crate) fn destroy<B: GsBackend + ?Sized>(&mut self, backend: &mut B) {
        backend.destroy_blend_state(self.merge_bs);
        backend.destroy_buffer(self.merge_cb);
        backend.destroy_buffer(self.interlace_cb);
        backend.destroy_buffer(self.shadeboost_cb);
        if let Some(cas) = self.cas.take() {
            backend.destroy_buffer(cas.cb);
        }
        self.fxaa_ps = None;
    }
}

impl CasObjects {
    fn create<B: GsBackend + ?Sized>(
        backend: &mut B,
        shaders: &mut ShaderCache,
        level: FeatureLevel,
        sources: &dyn ShaderSource,
    ) -> Result<Self, GsError> {
        let source = cas_shader_source(sources)?;
        let mut macros = ShaderMacros::for_level(level);
        let upscale = shaders.get_or_compile(backend, ShaderStage::Compute, &source, &macros, CAS_ENTRY_POINT)?;
        macros.add("CAS_SHARPEN_ONLY", 1);
        let sharpen = shaders.get_or_compile(backend, ShaderStage::Compute, &source, &macros, CAS_ENTRY_POINT)?;
        let cb = create_constant_buffer(backend, "cas constants", NUM_CAS_CONSTANTS * size_of::<u32>())?;
        Ok(Self { sharpen, upscale, cb })
    }
}

impl<B: GsBackend> GsDevice<B> {
    /// Composites the two display circuits and the background color into
    /// `dst`, optionally writing one of them back to `src[2]` as YUV.
    #[allow(clippy::too_many_arguments)]
    pub fn do_merge(
        &mut self,
        src: [Option<&Texture>; 3],
        s_rect: [RectF; 3],
        dst: &Texture,
        d_rect: [RectF; 3],
        pmode: GsRegPmode,
        extbuf: GsRegExtbuf,
        c: [f32; 4],
        linear: bool,
    ) -> Result<(), GsError> {
        let feedback = src[2];
        let fw2 = pmode.en2 && feedback.is_some() && extbuf.fbin == 1;
        let fw1 = pmode.en1 && feedback.is_some() && extbuf.fbin == 0;
        let fw2_bg = fw2 && pmode.slbg;

        self.clear_render_target(dst, c);

        if fw1 || fw2 || src[0].is_some() {
            let cb = MergeConstants {
                bg_color: c,
                emoda: u32::from(extbuf.emoda),
                emodc: u32::from(extbuf.emodc),
                _pad: [0; 2],
            };
            self.backend
                .update_buffer(self.postfx.merge_cb, 0, bytemuck::bytes_of(&cb));
        }

        if let Some(second) = src[1] {
            if !pmode.slbg || fw2_bg {
                let rect = if pmode.slbg { d_rect[2] } else { d_rect[1] };
                self.stretch_rect(second, s_rect[1], dst, rect, ShaderConvert::Copy, linear)?;
            }
        }

        let yuv = StretchPass {
            vs: self.convert.vs,
            ps: self.convert.ps(ShaderConvert::Yuv),
            ps_cb: Some(self.postfx.merge_cb),
            blend: self.convert.bs[ColorMask::all().bits() as usize],
            linear,
        };

        if let (true, Some(feedback)) = (fw2, feedback) {
            self.stretch_rect_with(dst, RectF::UNIT, feedback, d_rect[2], yuv)?;
        }

        if fw2_bg {
            self.clear_render_target(dst, c);
        }

        if let Some(first) = src[0] {
            let pass = StretchPass {
                vs: self.convert.vs,
                ps: self.postfx.merge_ps[usize::from(pmode.mmod)],
                ps_cb: Some(self.postfx.merge_cb),
                blend: self.postfx.merge_bs,
                linear,
            };
            self.stretch_rect_with(first, s_rect[0], dst, d_rect[0], pass)?;

            if let (true, Some(feedback)) = (fw1, feedback) {
                self.stretch_rect_with(first, RectF::UNIT, feedback, d_rect[2], yuv)?;
            }
        }
        Ok(())
    }

    pub fn do_interlace(
        &mut self,
        src: &Texture,
        s_rect: RectF,
        dst: &Texture,
        d_rect: RectF,
        shader: ShaderInterlace,
        linear: bool,
        cb: &InterlaceConstants,
    ) -> Result<(), GsError> {
        self.backend
            .update_buffer(self.postfx.interlace_cb, 0, bytemuck::bytes_of(cb));
        let pass = StretchPass {
            vs: self.convert.vs,
            ps: self.postfx.interlace_ps[shader as usize],
            ps_cb: Some(self.postfx.interlace_cb),
            blend: self.convert.bs[ColorMask::all().bits() as usize],
            linear,
        };
        self.stretch_rect_with(src, s_rect, dst, d_rect, pass)
    }

    /// Runs FXAA over the whole of `dst`. Leaves `dst` untouched when the
    /// FXAA source is missing or fails to compile.
    pub fn do_fxaa(&mut self, src: &Texture, dst: &Texture) -> Result<(), GsError> {
        let ps = match self.postfx.fxaa_ps {
            Some(ps) => ps,
            None => {
                let Some(source) = self.sources.read(FXAA_SHADER_SOURCE) else {
                    error!(source = FXAA_SHADER_SOURCE, "FXAA shader is missing");
                    return Ok(());
                };
                let macros = ShaderMacros::for_level(self.shaders.feature_level());
                match self.shaders.get_or_compile(
                    &mut self.backend,
                    ShaderStage::Pixel,
                    &source,
                    &macros,
                    POSTFX_ENTRY_POINT,
                ) {
                    Ok(ps) => {
                        self.postfx.fxaa_ps = Some(ps);
                        ps
                    }
                    Err(err) => {
                        error!(%err, "failed to compile FXAA shader");
                        return Ok(());
                    }
                }
            }
        };

        let pass = StretchPass {
            vs: self.convert.vs,
            ps,
            ps_cb: None,
            blend: self.convert.bs[ColorMask::all().bits() as usize],
            linear: true,
        };
        self.stretch_rect_with(src, RectF::UNIT, dst, dst.rect().to_f32(), pass)
    }

    /// `params` are brightness, contrast and saturation, 1.0 being neutral.
    pub fn do_shade_boost(&mut self, src: &Texture, dst: &Texture, params: [f32; 4]) -> Result<(), GsError> {
        self.backend
            .update_buffer(self.postfx.shadeboost_cb, 0, bytemuck::bytes_of(&params));
        let pass = StretchPass {
            vs: self.convert.vs,
            ps: self.postfx.shadeboost_ps,
            ps_cb: Some(self.postfx.shadeboost_cb),
            blend: self.convert.bs[ColorMask::all().bits() as usize],
            linear: false,
        };
        self.stretch_rect_with(src, RectF::UNIT, dst, dst.rect().to_f32(), pass)
    }

    /// Contrast adaptive sharpening (and optional upscale) of `src` into the
    /// storage texture `dst`.
    pub fn do_cas(
        &mut self,
        src: &Texture,
        dst: &Texture,
        sharpen_only: bool,
        constants: &[u32; NUM_CAS_CONSTANTS],
    ) -> Result<(), GsError> {
        let Some(cas) = self.postfx.cas.as_ref() else {
            return Err(GsError::Unsupported("contrast adaptive sharpening"));
        };
        let (shader, cb) = (if sharpen_only { cas.sharpen } else { cas.upscale }, cas.cb);
        let (x, y, z) = cas_dispatch_size(dst.width(), dst.height());

        self.state.set_render_targets(&mut self.backend, None, None, None);
        self.backend
            .update_buffer(cb, 0, bytemuck::cast_slice(constants.as_slice()));
        self.backend.set_cs_constant_buffer(Some(cb));
        self.backend.set_compute_shader(Some(shader));
        self.backend.set_cs_resources(Some(src.id()), Some(dst.id()));
        self.backend.dispatch(x, y, z);
        self.stats.inc_dispatches();

        self.backend.set_cs_resources(None, None);
        Ok(())
    }
}
