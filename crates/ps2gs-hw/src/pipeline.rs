//! Selector to native pipeline object resolution.
//!
//! A [`PipelineKey`] names everything a draw needs from the pipeline: shader
//! permutations plus fixed-function state. Resolving a key for the first time
//! compiles or creates the missing pieces through per-selector sub-caches
//! (so two keys differing only in blend state share their shaders) and files
//! the result in an arena. Later lookups are a single hash probe.

use hashbrown::HashMap;
use tracing::debug;

use crate::blend::HwBlendFactor;
use crate::draw::config::{
    BlendSelector, DepthStencilSelector, PsSelector, SamplerSelector, VsExpand, VsSelector, ZTest,
};
use crate::draw::constants::{GsVertex, GS_VERTEX_LAYOUT};
use crate::error::GsError;
use crate::hal::{
    AddressMode, BlendDesc, BlendFactor, BlendOp, BlendStateId, ColorMask, CompareFunc,
    DepthStencilDesc, DepthStencilStateId, FilterMode, GsBackend, GsFeatures, InputLayoutId,
    SamplerDesc, SamplerId, ShaderId, StencilFaceDesc, StencilOp,
};
use crate::shader::{FeatureLevel, ShaderCache, ShaderMacros, ShaderStage};

pub const VS_ENTRY_POINT: &str = "vs_main";
pub const PS_ENTRY_POINT: &str = "ps_main";

/// Composite selector identifying one pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub vs: VsSelector,
    pub ps: PsSelector,
    /// Carries the color write mask in `wrgba`.
    pub blend: BlendSelector,
    pub depth: DepthStencilSelector,
    /// `None` when the pixel shader samples nothing.
    pub sampler: Option<SamplerSelector>,
}

impl PipelineKey {
    pub fn colormask(&self) -> ColorMask {
        self.blend.wrgba
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipelineHandle(u32);

/// Native objects making up one resolved pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipelineObjects {
    pub vs: ShaderId,
    /// `None` for expanding vertex shaders, which read a structured buffer.
    pub layout: Option<InputLayoutId>,
    pub ps: ShaderId,
    pub blend: BlendStateId,
    pub depth: DepthStencilStateId,
    pub sampler: Option<SamplerId>,
}

pub struct PipelineResolver {
    tfx_source: String,
    level: FeatureLevel,
    features: GsFeatures,
    max_anisotropy: u8,
    layout: Option<InputLayoutId>,
    vs: HashMap<VsSelector, ShaderId>,
    ps: HashMap<PsSelector, ShaderId>,
    blend: HashMap<BlendSelector, BlendStateId>,
    depth: HashMap<DepthStencilSelector, DepthStencilStateId>,
    samplers: HashMap<SamplerSelector, SamplerId>,
    keys: HashMap<PipelineKey, PipelineHandle>,
    arena: Vec<PipelineObjects>,
}

impl PipelineResolver {
    pub fn new(tfx_source: String, level: FeatureLevel, features: GsFeatures, max_anisotropy: u8) -> Self {
        Self {
            tfx_source,
            level,
            features,
            max_anisotropy,
            layout: None,
            vs: HashMap::new(),
            ps: HashMap::new(),
            blend: HashMap::new(),
            depth: HashMap::new(),
            samplers: HashMap::new(),
            keys: HashMap::new(),
            arena: Vec::new(),
        }
    }

    /// Number of distinct pipelines resolved so far.
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Returns the cached handle for `key`, creating its objects on a miss.
    ///
    /// # Panics
    ///
    /// If the key asks for something the draw path never supports: red/green
    /// only color writes, or shader expansion on a backend without structured
    /// vertex buffers.
    pub fn resolve<B: GsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        shaders: &mut ShaderCache,
        key: &PipelineKey,
    ) -> Result<PipelineHandle, GsError> {
        assert!(!key.ps.write_rg, "red/green channel writes are not supported");
        assert!(
            key.vs.expand == VsExpand::None || self.features.vs_expand,
            "vertex expansion requested without structured vertex buffer support"
        );

        if let Some(handle) = self.keys.get(key) {
            return Ok(*handle);
        }

        let vs = self.vertex_shader(backend, shaders, &key.vs)?;
        let layout = if key.vs.expand == VsExpand::None {
            Some(self.input_layout(backend)?)
        } else {
            None
        };
        let ps = self.pixel_shader(backend, shaders, &key.ps)?;
        let blend = self.blend_state(backend, &key.blend)?;
        let depth = self.depth_stencil_state(backend, &key.depth)?;
        let sampler = match &key.sampler {
            Some(sel) => Some(self.sampler(backend, sel)?),
            None => None,
        };

        let handle = PipelineHandle(self.arena.len() as u32);
        self.arena.push(PipelineObjects {
            vs,
            layout,
            ps,
            blend,
            depth,
            sampler,
        });
        self.keys.insert(*key, handle);
        debug!(pipeline = handle.0, %vs, %ps, %blend, %depth, "resolved pipeline");
        Ok(handle)
    }

    pub fn objects(&self, handle: PipelineHandle) -> Result<&PipelineObjects, GsError> {
        self.arena.get(handle.0 as usize).ok_or(GsError::InvalidHandle {
            kind: "pipeline",
            id: handle.0,
        })
    }

    fn vertex_shader<B: GsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        shaders: &mut ShaderCache,
        sel: &VsSelector,
    ) -> Result<ShaderId, GsError> {
        if let Some(id) = self.vs.get(sel) {
            return Ok(*id);
        }
        let macros = vs_macros(sel, self.level);
        let id = shaders.get_or_compile(backend, ShaderStage::Vertex, &self.tfx_source, &macros, VS_ENTRY_POINT)?;
        self.vs.insert(*sel, id);
        Ok(id)
    }

    fn input_layout<B: GsBackend + ?Sized>(&mut self, backend: &mut B) -> Result<InputLayoutId, GsError> {
        if let Some(layout) = self.layout {
            return Ok(layout);
        }
        let stride = std::mem::size_of::<GsVertex>() as u32;
        let layout = backend.create_input_layout(&GS_VERTEX_LAYOUT, stride)?;
        self.layout = Some(layout);
        Ok(layout)
    }

    fn pixel_shader<B: GsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        shaders: &mut ShaderCache,
        sel: &PsSelector,
    ) -> Result<ShaderId, GsError> {
        if let Some(id) = self.ps.get(sel) {
            return Ok(*id);
        }
        let macros = ps_macros(sel, self.level);
        let id = shaders.get_or_compile(backend, ShaderStage::Pixel, &self.tfx_source, &macros, PS_ENTRY_POINT)?;
        self.ps.insert(*sel, id);
        Ok(id)
    }

    fn blend_state<B: GsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        sel: &BlendSelector,
    ) -> Result<BlendStateId, GsError> {
        if let Some(id) = self.blend.get(sel) {
            return Ok(*id);
        }
        let id = backend.create_blend_state(&blend_desc(sel, self.features.dual_source_blend))?;
        self.blend.insert(*sel, id);
        Ok(id)
    }

    fn depth_stencil_state<B: GsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        sel: &DepthStencilSelector,
    ) -> Result<DepthStencilStateId, GsError> {
        if let Some(id) = self.depth.get(sel) {
            return Ok(*id);
        }
        let id = backend.create_depth_stencil_state(&depth_stencil_desc(sel))?;
        self.depth.insert(*sel, id);
        Ok(id)
    }

    fn sampler<B: GsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        sel: &SamplerSelector,
    ) -> Result<SamplerId, GsError> {
        if let Some(id) = self.samplers.get(sel) {
            return Ok(*id);
        }
        let id = backend.create_sampler(&sampler_desc(sel, self.max_anisotropy))?;
        self.samplers.insert(*sel, id);
        Ok(id)
    }

    /// Releases every fixed-function object and forgets all pipelines.
    ///
    /// Shaders belong to the [`ShaderCache`] and are released with it.
    pub fn destroy<B: GsBackend + ?Sized>(&mut self, backend: &mut B) {
        if let Some(layout) = self.layout.take() {
            backend.destroy_input_layout(layout);
        }
        for (_, id) in self.blend.drain() {
            backend.destroy_blend_state(id);
        }
        for (_, id) in self.depth.drain() {
            backend.destroy_depth_stencil_state(id);
        }
        for (_, id) in self.samplers.drain() {
            backend.destroy_sampler(id);
        }
        self.vs.clear();
        self.ps.clear();
        self.keys.clear();
        self.arena.clear();
    }
}

pub fn vs_macros(sel: &VsSelector, level: FeatureLevel) -> ShaderMacros {
    let mut m = ShaderMacros::for_level(level);
    m.add("VS_TME", u8::from(sel.tme))
        .add("VS_FST", u8::from(sel.fst))
        .add("VS_IIP", u8::from(sel.iip))
        .add("VS_EXPAND", sel.expand as u8)
        .add("VS_POINT_SIZE", u8::from(sel.point_size));
    m
}

pub fn ps_macros(sel: &PsSelector, level: FeatureLevel) -> ShaderMacros {
    let b = |v: bool| u8::from(v);
    let mut m = ShaderMacros::for_level(level);
    m.add("PS_FST", b(sel.fst))
        .add("PS_WMS", sel.wms)
        .add("PS_WMT", sel.wmt)
        .add("PS_ADJS", b(sel.adjs))
        .add("PS_ADJT", b(sel.adjt))
        .add("PS_AEM_FMT", sel.aem_fmt)
        .add("PS_PAL_FMT", sel.pal_fmt)
        .add("PS_DST_FMT", sel.dst_fmt)
        .add("PS_DEPTH_FMT", sel.depth_fmt)
        .add("PS_CHANNEL_FETCH", sel.channel)
        .add("PS_URBAN_SHADOWS", b(sel.urban_shadows))
        .add("PS_TALES_OF_ABYSS_HLE", b(sel.tales_of_abyss_hle))
        .add("PS_TEX_IS_FB", 0)
        .add("PS_INVALID_TEX0", 0)
        .add("PS_AEM", b(sel.aem))
        .add("PS_TFX", sel.tfx)
        .add("PS_TCC", b(sel.tcc))
        .add("PS_DATE", sel.date)
        .add("PS_ATST", sel.atst)
        .add("PS_AFAIL", sel.afail)
        .add("PS_FOG", b(sel.fog))
        .add("PS_IIP", b(sel.iip))
        .add("PS_BLEND_HW", sel.blend_hw)
        .add("PS_A_MASKED", b(sel.a_masked))
        .add("PS_FBA", b(sel.fba))
        .add("PS_FBMASK", b(sel.fbmask))
        .add("PS_LTF", b(sel.ltf))
        .add("PS_TCOFFSETHACK", b(sel.tcoffsethack))
        .add("PS_POINT_SAMPLER", b(sel.point_sampler))
        .add("PS_REGION_RECT", b(sel.region_rect))
        .add("PS_SHUFFLE", b(sel.shuffle))
        .add("PS_SHUFFLE_SAME", b(sel.shuffle_same))
        .add("PS_PROCESS_BA", b(sel.process_ba))
        .add("PS_PROCESS_RG", b(sel.process_rg))
        .add("PS_SHUFFLE_ACROSS", b(sel.shuffle_across))
        .add("PS_READ16_SRC", b(sel.real16src))
        .add("PS_WRITE_RG", b(sel.write_rg))
        .add("PS_FIXED_ONE_A", b(sel.fixed_one_a))
        .add("PS_BLEND_A", sel.blend_a)
        .add("PS_BLEND_B", sel.blend_b)
        .add("PS_BLEND_C", sel.blend_c)
        .add("PS_BLEND_D", sel.blend_d)
        .add("PS_BLEND_MIX", sel.blend_mix)
        .add("PS_ROUND_INV", b(sel.round_inv))
        .add("PS_HDR", b(sel.hdr))
        .add("PS_COLCLIP", b(sel.colclip))
        .add("PS_PABE", b(sel.pabe))
        .add("PS_DITHER", sel.dither)
        .add("PS_ZCLAMP", b(sel.zclamp))
        .add("PS_AUTOMATIC_LOD", b(sel.automatic_lod))
        .add("PS_MANUAL_LOD", b(sel.manual_lod))
        .add("PS_NO_COLOR", b(sel.no_color))
        .add("PS_NO_COLOR1", b(sel.no_color1))
        .add("PS_NO_ABLEND", b(sel.no_ablend))
        .add("PS_ONLY_ALPHA", b(sel.only_alpha));
    m
}

/// Native blend description for an output-merger selector.
///
/// Alpha is never blended; the GS alpha channel is written as produced.
pub fn blend_desc(sel: &BlendSelector, dual_source_blend: bool) -> BlendDesc {
    if !sel.enable {
        return BlendDesc::opaque(sel.wrgba);
    }
    let factor = |f: HwBlendFactor| {
        if dual_source_blend {
            f.to_native()
        } else {
            f.without_dual_source().to_native()
        }
    };
    BlendDesc {
        enable: true,
        src: factor(sel.src),
        dst: factor(sel.dst),
        op: sel.op.to_native(),
        src_alpha: BlendFactor::One,
        dst_alpha: BlendFactor::Zero,
        op_alpha: BlendOp::Add,
        write_mask: sel.wrgba,
    }
}

pub fn depth_stencil_desc(sel: &DepthStencilSelector) -> DepthStencilDesc {
    let mut desc = DepthStencilDesc::DISABLED;
    if sel.date {
        desc.stencil_enable = true;
        desc.stencil_read_mask = 1;
        desc.stencil_write_mask = 1;
        desc.stencil = StencilFaceDesc {
            func: CompareFunc::Equal,
            pass_op: if sel.date_one { StencilOp::Zero } else { StencilOp::Keep },
            fail_op: StencilOp::Keep,
            depth_fail_op: StencilOp::Keep,
        };
    }
    if sel.ztst != ZTest::Always || sel.zwe {
        desc.depth_enable = true;
        desc.depth_write = sel.zwe;
        desc.depth_func = sel.ztst.to_native();
    }
    desc
}

/// GS texture filtering mapped onto a native sampler.
///
/// `triln` follows the GS `MMIN` field: 0/1 are unmipped nearest/linear,
/// 2..=5 pick nearest or linear for the level and between levels.
pub fn sampler_desc(sel: &SamplerSelector, max_anisotropy: u8) -> SamplerDesc {
    let filter = |linear: bool| if linear { FilterMode::Linear } else { FilterMode::Point };
    let mag_filter = filter(sel.biln);
    let (min_filter, mip_filter) = if sel.triln < 2 {
        (mag_filter, FilterMode::Point)
    } else {
        (filter(matches!(sel.triln, 4 | 5)), filter(matches!(sel.triln, 3 | 5)))
    };
    let address = |wrap: bool| if wrap { AddressMode::Wrap } else { AddressMode::Clamp };

    SamplerDesc {
        mag_filter,
        min_filter,
        mip_filter,
        address_u: address(sel.tau),
        address_v: address(sel.tav),
        max_anisotropy: if max_anisotropy > 1 && sel.aniso { max_anisotropy } else { 0 },
        lod_clamp: sel.lodclamp,
    }
}
