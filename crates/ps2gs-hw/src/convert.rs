//! Full-screen copy passes: stretch, multi-rect, present, CLUT and the
//! destination alpha stencil setup.

use std::mem::size_of;

use bytemuck::{Pod, Zeroable};
use tracing::trace;

use crate::device::{create_constant_buffer, GsDevice};
use crate::draw::constants::{ConvertVertex, CONVERT_VERTEX_LAYOUT};
use crate::error::GsError;
use crate::hal::{
    BlendDesc, BlendFactor, BlendOp, BlendStateId, BufferId, ColorMask, CompareFunc, DepthStencilDesc,
    DepthStencilStateId, FilterMode, GsBackend, InputLayoutId, IntRect, PrimitiveTopology, RectF, SamplerDesc,
    SamplerId, ShaderId, StencilFaceDesc, StencilOp, TextureDesc,
};
use crate::shader::{FeatureLevel, PresentShader, ShaderCache, ShaderConvert, ShaderMacros, ShaderStage};
use crate::stream::{multi_rect_strip_indices, MAX_QUADS_PER_DRAW};
use crate::texture::{Texture, TextureFormat, TextureType};

pub(crate) const CONVERT_VS_ENTRY_POINT: &str = "vs_main";
const PRIMID_INIT_ENTRY_POINTS: [&str; 2] = ["ps_stencil_image_init_0", "ps_stencil_image_init_1"];

/// Constants of the presentation shader.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct DisplayConstants {
    pub source_rect: [f32; 4],
    pub target_rect: [f32; 4],
    pub source_size: [f32; 2],
    pub target_size: [f32; 2],
    pub target_resolution: [f32; 2],
    pub rcp_target_resolution: [f32; 2],
    pub source_resolution: [f32; 2],
    pub rcp_source_resolution: [f32; 2],
    pub time: [f32; 4],
}

impl DisplayConstants {
    /// `s_rect` is normalized; it is scaled to pixels of a `width` x `height` source.
    pub fn set_source(&mut self, s_rect: RectF, width: u32, height: u32) {
        let (w, h) = (width as f32, height as f32);
        let rect = [s_rect.left * w, s_rect.top * h, s_rect.right * w, s_rect.bottom * h];
        self.source_rect = rect;
        self.source_size = [rect[2] - rect[0], rect[3] - rect[1]];
        self.source_resolution = [w, h];
        self.rcp_source_resolution = [1.0 / w, 1.0 / h];
    }

    pub fn set_target(&mut self, d_rect: RectF, width: u32, height: u32) {
        let (w, h) = (width as f32, height as f32);
        self.target_rect = [d_rect.left, d_rect.top, d_rect.right, d_rect.bottom];
        self.target_size = [d_rect.width(), d_rect.height()];
        self.target_resolution = [w, h];
        self.rcp_target_resolution = [1.0 / w, 1.0 / h];
    }

    pub fn set_time(&mut self, time: f32) {
        self.time = [time, 0.0, 0.0, 0.0];
    }
}

/// Layout of the merge constant buffer when converting palettes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ClutConstants {
    pub scale: [f32; 4],
    /// Source x, source y, destination offset.
    pub offset: [u32; 4],
}

/// Layout of the merge constant buffer when converting to indexed texels.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct IndexedConstants {
    pub scale: [f32; 4],
    /// Source and destination buffer widths in 64-pixel units.
    pub sbw_dbw: [u32; 4],
}

/// One source rectangle for [`GsDevice::draw_multi_stretch_rects`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MultiStretchRect {
    pub src: Texture,
    /// Normalized.
    pub src_rect: RectF,
    /// Pixels of the destination.
    pub dst_rect: RectF,
    pub linear: bool,
    pub wmask: ColorMask,
}

/// Objects shared by every convert, present and DATE pass.
#[derive(Debug)]
pub(crate) struct ConvertObjects {
    pub(crate) layout: InputLayoutId,
    pub(crate) vs: ShaderId,
    pub(crate) ps: [ShaderId; ShaderConvert::ALL.len()],
    /// Indexed by the RGBA write mask bits.
    pub(crate) bs: [BlendStateId; 16],
    pub(crate) dss: DepthStencilStateId,
    pub(crate) dss_write: DepthStencilStateId,
    pub(crate) ln: SamplerId,
    pub(crate) pt: SamplerId,
    pub(crate) present_vs: ShaderId,
    pub(crate) present_ps: [ShaderId; PresentShader::ALL.len()],
    pub(crate) present_cb: BufferId,
    pub(crate) date_dss: DepthStencilStateId,
    pub(crate) date_bs: BlendStateId,
    pub(crate) primid_init_ps: [ShaderId; 2],
}

impl ConvertObjects {
    pub(crate) fn create<B: GsBackend + ?Sized>(
        backend: &mut B,
        shaders: &mut ShaderCache,
        level: FeatureLevel,
        convert_src: &str,
        present_src: &str,
    ) -> Result<Self, GsError> {
        let macros = ShaderMacros::for_level(level);
        let stride = size_of::<ConvertVertex>() as u32;
        let layout = backend.create_input_layout(&CONVERT_VERTEX_LAYOUT, stride)?;

        let vs = shaders.get_or_compile(backend, ShaderStage::Vertex, convert_src, &macros, CONVERT_VS_ENTRY_POINT)?;
        let mut ps = [vs; ShaderConvert::ALL.len()];
        for (slot, shader) in ps.iter_mut().zip(ShaderConvert::ALL) {
            *slot = shaders.get_or_compile(backend, ShaderStage::Pixel, convert_src, &macros, shader.entry_point())?;
        }
        let mut primid_init_ps = [vs; 2];
        for (slot, entry) in primid_init_ps.iter_mut().zip(PRIMID_INIT_ENTRY_POINTS) {
            *slot = shaders.get_or_compile(backend, ShaderStage::Pixel, convert_src, &macros, entry)?;
        }

        let present_vs =
            shaders.get_or_compile(backend, ShaderStage::Vertex, present_src, &macros, CONVERT_VS_ENTRY_POINT)?;
        let mut present_ps = [present_vs; PresentShader::ALL.len()];
        for (slot, shader) in present_ps.iter_mut().zip(PresentShader::ALL) {
            *slot = shaders.get_or_compile(backend, ShaderStage::Pixel, present_src, &macros, shader.entry_point())?;
        }
        let present_cb = create_constant_buffer(backend, "present constants", size_of::<DisplayConstants>())?;

        let mut bs = Vec::with_capacity(16);
        for mask in 0..16u8 {
            bs.push(backend.create_blend_state(&BlendDesc::opaque(ColorMask::from_bits_truncate(mask)))?);
        }
        let bs: [BlendStateId; 16] = bs
            .try_into()
            .map_err(|_| GsError::resource("blend state", "convert write-mask table"))?;

        let dss = backend.create_depth_stencil_state(&DepthStencilDesc::DISABLED)?;
        let dss_write = backend.create_depth_stencil_state(&DepthStencilDesc {
            depth_enable: true,
            depth_write: true,
            depth_func: CompareFunc::Always,
            ..DepthStencilDesc::DISABLED
        })?;
        let ln = backend.create_sampler(&SamplerDesc::clamped(FilterMode::Linear))?;
        let pt = backend.create_sampler(&SamplerDesc::clamped(FilterMode::Point))?;

        let date_dss = backend.create_depth_stencil_state(&DepthStencilDesc {
            depth_enable: false,
            depth_write: false,
            depth_func: CompareFunc::Always,
            stencil_enable: true,
            stencil_read_mask: 1,
            stencil_write_mask: 1,
            stencil: StencilFaceDesc {
                func: CompareFunc::Always,
                pass_op: StencilOp::Replace,
                fail_op: StencilOp::Keep,
                depth_fail_op: StencilOp::Keep,
            },
        })?;
        let date_bs = backend.create_blend_state(&BlendDesc::opaque(ColorMask::empty()))?;

        Ok(Self {
            layout,
            vs,
            ps,
            bs,
            dss,
            dss_write,
            ln,
            pt,
            present_vs,
            present_ps,
            present_cb,
            date_dss,
            date_bs,
            primid_init_ps,
        })
    }

    pub(crate) fn ps(&self, shader: ShaderConvert) -> ShaderId {
        self.ps[shader as usize]
    }

    pub(crate) fn sampler(&self, linear: bool) -> SamplerId {
        if linear {
            self.ln
        } else {
            self.pt
        }
    }

    pub(crate) fn destroy<B: GsBackend + ?Sized>(&self, backend: &mut B) {
        backend.destroy_input_layout(self.layout);
        for bs in self.bs {
            backend.destroy_blend_state(bs);
        }
        backend.destroy_blend_state(self.date_bs);
        backend.destroy_depth_stencil_state(self.dss);
        backend.destroy_depth_stencil_state(self.dss_write);
        backend.destroy_depth_stencil_state(self.date_dss);
        backend.destroy_sampler(self.ln);
        backend.destroy_sampler(self.pt);
        backend.destroy_buffer(self.present_cb);
    }
}

/// Blending used when compositing the first display circuit.
pub(crate) fn merge_blend_desc() -> BlendDesc {
    BlendDesc {
        enable: true,
        src: BlendFactor::SrcAlpha,
        dst: BlendFactor::InvSrcAlpha,
        op: BlendOp::Add,
        src_alpha: BlendFactor::One,
        dst_alpha: BlendFactor::Zero,
        op_alpha: BlendOp::Add,
        write_mask: ColorMask::all(),
    }
}

/// Quad covering `d_rect` of a `width` x `height` target, sampling `s_rect`.
pub(crate) fn quad_vertices(s_rect: RectF, d_rect: RectF, width: u32, height: u32) -> [ConvertVertex; 4] {
    let (w, h) = (width as f32, height as f32);
    let left = d_rect.left * 2.0 / w - 1.0;
    let top = 1.0 - d_rect.top * 2.0 / h;
    let right = d_rect.right * 2.0 / w - 1.0;
    let bottom = 1.0 - d_rect.bottom * 2.0 / h;
    [
        ConvertVertex::new(left, top, s_rect.left, s_rect.top),
        ConvertVertex::new(right, top, s_rect.right, s_rect.top),
        ConvertVertex::new(left, bottom, s_rect.left, s_rect.bottom),
        ConvertVertex::new(right, bottom, s_rect.right, s_rect.bottom),
    ]
}

/// Everything a single stretched quad needs besides its rectangles.
#[derive(Clone, Copy, Debug)]
pub(crate) struct StretchPass {
    pub(crate) vs: ShaderId,
    pub(crate) ps: ShaderId,
    pub(crate) ps_cb: Option<BufferId>,
    pub(crate) blend: BlendStateId,
    pub(crate) linear: bool,
}

impl<B: GsBackend> GsDevice<B> {
    /// Draws `s_rect` of `src` into `d_rect` of `dst` with a convert shader.
    ///
    /// # Panics
    ///
    /// If `shader` writes depth but `dst` is a color target (or the reverse),
    /// or does not support the requested filter.
    pub fn stretch_rect(
        &mut self,
        src: &Texture,
        s_rect: RectF,
        dst: &Texture,
        d_rect: RectF,
        shader: ShaderConvert,
        linear: bool,
    ) -> Result<(), GsError> {
        assert_eq!(
            dst.is_depth_stencil(),
            shader.has_depth_output(),
            "{shader:?} cannot write into a {:?}",
            dst.ty()
        );
        assert!(
            if linear { shader.supports_bilinear() } else { shader.supports_nearest() },
            "{shader:?} does not support {} sampling",
            if linear { "bilinear" } else { "nearest" }
        );
        let pass = StretchPass {
            vs: self.convert.vs,
            ps: self.convert.ps(shader),
            ps_cb: None,
            blend: self.convert.bs[ColorMask::all().bits() as usize],
            linear,
        };
        self.stretch_rect_with(src, s_rect, dst, d_rect, pass)
    }

    /// Copies with only the selected channels written.
    #[allow(clippy::too_many_arguments)]
    pub fn stretch_rect_masked(
        &mut self,
        src: &Texture,
        s_rect: RectF,
        dst: &Texture,
        d_rect: RectF,
        red: bool,
        green: bool,
        blue: bool,
        alpha: bool,
    ) -> Result<(), GsError> {
        let mask = ColorMask::from_channels(red, green, blue, alpha);
        let pass = StretchPass {
            vs: self.convert.vs,
            ps: self.convert.ps(ShaderConvert::Copy),
            ps_cb: None,
            blend: self.convert.bs[mask.bits() as usize],
            linear: false,
        };
        self.stretch_rect_with(src, s_rect, dst, d_rect, pass)
    }

    pub(crate) fn stretch_rect_with(
        &mut self,
        src: &Texture,
        s_rect: RectF,
        dst: &Texture,
        d_rect: RectF,
        pass: StretchPass,
    ) -> Result<(), GsError> {
        let draw_in_depth = dst.is_depth_stencil();
        let dss = if draw_in_depth { self.convert.dss_write } else { self.convert.dss };
        self.state.set_depth_stencil_state(&mut self.backend, dss, 0);
        self.state.set_blend_state(&mut self.backend, pass.blend, 0.0);
        if draw_in_depth {
            self.state.set_render_targets(&mut self.backend, None, Some(dst), None);
        } else {
            self.state.set_render_targets(&mut self.backend, Some(dst), None, None);
        }
        self.draw_stretched_quad(src, s_rect, dst.desc(), d_rect, pass)
    }

    fn draw_stretched_quad(
        &mut self,
        src: &Texture,
        s_rect: RectF,
        target: &TextureDesc,
        d_rect: RectF,
        pass: StretchPass,
    ) -> Result<(), GsError> {
        let vertices = quad_vertices(s_rect, d_rect, target.width, target.height);
        let base_vertex = self.ia_set_vertices(&vertices)?;
        self.state.set_input_layout(&mut self.backend, Some(self.convert.layout));
        self.state
            .set_primitive_topology(&mut self.backend, PrimitiveTopology::TriangleStrip);
        self.state.set_vertex_shader(&mut self.backend, Some(pass.vs), None);

        self.state.stage_ps_resources(Some(src.id()), None);
        self.state.stage_ps_sampler(Some(self.convert.sampler(pass.linear)));
        self.state.set_pixel_shader(&mut self.backend, Some(pass.ps), pass.ps_cb);

        self.draw_primitive(4, base_vertex);

        self.state.stage_ps_resources(None, None);
        self.state.commit_ps_resources(&mut self.backend);
        Ok(())
    }

    /// Draws `s_rect` of `src` to the window (`dst == None`) or a target
    /// through one of the presentation shaders.
    #[allow(clippy::too_many_arguments)]
    pub fn present_rect(
        &mut self,
        src: &Texture,
        s_rect: RectF,
        dst: Option<&Texture>,
        d_rect: RectF,
        shader: PresentShader,
        time: f32,
        linear: bool,
    ) -> Result<(), GsError> {
        let target = match dst {
            Some(texture) => *texture.desc(),
            None => {
                let (width, height) = self.backend.surface_size();
                TextureDesc {
                    width,
                    height,
                    levels: 1,
                    format: TextureFormat::Color,
                    ty: TextureType::RenderTarget,
                }
            }
        };

        let mut cb = DisplayConstants::default();
        cb.set_source(s_rect, src.width(), src.height());
        cb.set_target(d_rect, target.width, target.height);
        cb.set_time(time);
        self.backend
            .update_buffer(self.convert.present_cb, 0, bytemuck::bytes_of(&cb));

        self.state
            .set_depth_stencil_state(&mut self.backend, self.convert.dss, 0);
        self.state.set_blend_state(
            &mut self.backend,
            self.convert.bs[ColorMask::all().bits() as usize],
            0.0,
        );
        if let Some(texture) = dst {
            self.state.set_render_targets(&mut self.backend, Some(texture), None, None);
        }

        let pass = StretchPass {
            vs: self.convert.present_vs,
            ps: self.convert.present_ps[shader as usize],
            ps_cb: Some(self.convert.present_cb),
            blend: self.convert.bs[ColorMask::all().bits() as usize],
            linear,
        };
        self.draw_stretched_quad(src, s_rect, &target, d_rect, pass)
    }

    /// Expands a row of palette entries from `src` into the 16 or 256 wide
    /// CLUT texture `dst`.
    #[allow(clippy::too_many_arguments)]
    pub fn update_clut_texture(
        &mut self,
        src: &Texture,
        s_scale: f32,
        offset_x: u32,
        offset_y: u32,
        dst: &Texture,
        d_offset: u32,
        d_size: u32,
    ) -> Result<(), GsError> {
        let cb = ClutConstants {
            scale: [s_scale, 0.0, 0.0, 0.0],
            offset: [offset_x, offset_y, d_offset, 0],
        };
        self.backend
            .update_buffer(self.postfx.merge_cb, 0, bytemuck::bytes_of(&cb));

        let shader = if d_size == 16 { ShaderConvert::Clut4 } else { ShaderConvert::Clut8 };
        let pass = StretchPass {
            vs: self.convert.vs,
            ps: self.convert.ps(shader),
            ps_cb: Some(self.postfx.merge_cb),
            blend: self.convert.bs[ColorMask::all().bits() as usize],
            linear: false,
        };
        let d_rect = RectF::new(0.0, 0.0, d_size as f32, 1.0);
        self.stretch_rect_with(src, RectF::default(), dst, d_rect, pass)
    }

    /// Rewrites a 32 bit target as 8 bit palette indices.
    pub fn convert_to_indexed_texture(
        &mut self,
        src: &Texture,
        s_scale: f32,
        sbw: u32,
        dst: &Texture,
        dbw: u32,
    ) -> Result<(), GsError> {
        let cb = IndexedConstants {
            scale: [s_scale, 0.0, 0.0, 0.0],
            sbw_dbw: [sbw, dbw, 0, 0],
        };
        self.backend
            .update_buffer(self.postfx.merge_cb, 0, bytemuck::bytes_of(&cb));

        let pass = StretchPass {
            vs: self.convert.vs,
            ps: self.convert.ps(ShaderConvert::RgbaTo8I),
            ps_cb: Some(self.postfx.merge_cb),
            blend: self.convert.bs[ColorMask::all().bits() as usize],
            linear: false,
        };
        let d_rect = dst.rect().to_f32();
        self.stretch_rect_with(src, RectF::default(), dst, d_rect, pass)
    }

    /// Copies many rectangles into `dst`, one indexed draw per run of rects
    /// sharing source, filter and write mask. Runs longer than
    /// [`MAX_QUADS_PER_DRAW`] are split.
    pub fn draw_multi_stretch_rects(
        &mut self,
        rects: &[MultiStretchRect],
        dst: &Texture,
        shader: ShaderConvert,
    ) -> Result<(), GsError> {
        if rects.is_empty() {
            return Ok(());
        }

        self.state.set_input_layout(&mut self.backend, Some(self.convert.layout));
        self.state
            .set_primitive_topology(&mut self.backend, PrimitiveTopology::TriangleStrip);
        self.state.set_vertex_shader(&mut self.backend, Some(self.convert.vs), None);
        self.state
            .set_pixel_shader(&mut self.backend, Some(self.convert.ps(shader)), None);

        let dss = if dst.is_render_target() { self.convert.dss } else { self.convert.dss_write };
        self.state.set_depth_stencil_state(&mut self.backend, dss, 0);
        let rt = dst.is_render_target().then_some(dst);
        let ds = dst.is_depth_stencil().then_some(dst);
        self.state.set_render_targets(&mut self.backend, rt, ds, None);

        let mut first = 0;
        for i in 1..=rects.len() {
            let split = i == rects.len()
                || rects[i].src != rects[first].src
                || rects[i].linear != rects[first].linear
                || rects[i].wmask != rects[first].wmask;
            if split {
                for batch in rects[first..i].chunks(MAX_QUADS_PER_DRAW) {
                    self.do_multi_stretch_rects(batch, dst)?;
                }
                first = i;
            }
        }
        Ok(())
    }

    fn do_multi_stretch_rects(&mut self, rects: &[MultiStretchRect], dst: &Texture) -> Result<(), GsError> {
        let (width, height) = dst.size();
        let vertices: Vec<ConvertVertex> = rects
            .iter()
            .flat_map(|r| quad_vertices(r.src_rect, r.dst_rect, width, height))
            .collect();
        let indices = multi_rect_strip_indices(rects.len());
        trace!(rects = rects.len(), src = %rects[0].src.id(), "multi stretch batch");

        let base_vertex = self.ia_set_vertices(&vertices)?;
        let first_index = self.ia_set_indices(&indices)?;

        self.state.stage_ps_resources(Some(rects[0].src.id()), None);
        self.state
            .stage_ps_sampler(Some(self.convert.sampler(rects[0].linear)));
        self.state.set_blend_state(
            &mut self.backend,
            self.convert.bs[rects[0].wmask.bits() as usize],
            0.0,
        );
        self.draw_indexed_primitive(indices.len() as u32, first_index, base_vertex);
        Ok(())
    }

    /// Marks pixels whose alpha passes the DATE test with stencil bit 1.
    pub fn setup_date(&mut self, rt: &Texture, ds: &Texture, datm: bool, bbox: IntRect) -> Result<(), GsError> {
        self.clear_stencil(ds, 0);

        self.state
            .set_depth_stencil_state(&mut self.backend, self.convert.date_dss, 1);
        self.state
            .set_blend_state(&mut self.backend, self.convert.date_bs, 0.0);
        self.state.set_render_targets(&mut self.backend, None, Some(ds), None);

        let src = bbox.to_f32().normalized(ds.width(), ds.height());
        let d_rect = bbox.to_f32();
        let shader = if datm { ShaderConvert::Datm1 } else { ShaderConvert::Datm0 };
        let pass = StretchPass {
            vs: self.convert.vs,
            ps: self.convert.ps(shader),
            ps_cb: None,
            blend: self.convert.date_bs,
            linear: false,
        };
        self.draw_stretched_quad(rt, src, ds.desc(), d_rect, pass)
    }
}

/// Orders rects so batches sharing a source and filter end up adjacent.
pub fn sort_multi_stretch_rects(rects: &mut [MultiStretchRect]) {
    rects.sort_by_key(|r| (r.src.id(), r.linear));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::{NativeCall, RecordingBackend};
    use crate::config::GsDeviceConfig;
    use crate::shader::MemoryShaderSource;

    fn device(backend: RecordingBackend) -> GsDevice<RecordingBackend> {
        GsDevice::create(
            backend,
            GsDeviceConfig::default(),
            Box::new(MemoryShaderSource::with_placeholders()),
        )
        .unwrap()
    }

    #[test]
    fn quad_maps_pixels_to_ndc() {
        let v = quad_vertices(RectF::UNIT, RectF::new(0.0, 0.0, 32.0, 16.0), 64, 32);
        assert_eq!(v[0].pos[..2], [-1.0, 1.0]);
        assert_eq!(v[3].pos[..2], [0.0, 0.0]);
        assert_eq!(v[1].uv, [1.0, 0.0]);
        assert_eq!(v[2].uv, [0.0, 1.0]);
    }

    #[test]
    fn display_constants_scale_source_rect() {
        let mut cb = DisplayConstants::default();
        cb.set_source(RectF::new(0.0, 0.0, 0.5, 1.0), 640, 448);
        cb.set_target(RectF::new(10.0, 0.0, 330.0, 448.0), 1280, 720);
        assert_eq!(cb.source_rect, [0.0, 0.0, 320.0, 448.0]);
        assert_eq!(cb.source_size, [320.0, 448.0]);
        assert_eq!(cb.target_size, [320.0, 448.0]);
        assert_eq!(std::mem::size_of::<DisplayConstants>(), 96);
    }

    #[test]
    fn masked_stretch_writes_selected_channels() {
        let mut dev = device(RecordingBackend::new());
        let src = dev.create_texture(32, 32, 1, TextureFormat::Color, false).unwrap();
        let dst = dev.create_render_target(32, 32, TextureFormat::Color, true).unwrap();
        dev.backend_mut().take_calls();

        dev.stretch_rect_masked(&src, RectF::UNIT, &dst, dst.rect().to_f32(), true, false, false, true)
            .unwrap();

        let mask = ColorMask::R | ColorMask::A;
        assert!(dev.backend().calls().contains(&NativeCall::SetBlendState {
            state: dev.convert.bs[mask.bits() as usize],
            factor: 0.0,
        }));
        assert_eq!(dev.backend().count_calls(|c| matches!(c, NativeCall::Draw { vertex_count: 4, .. })), 1);
    }

    #[test]
    fn clut_update_picks_shader_by_palette_size() {
        let mut dev = device(RecordingBackend::new());
        let src = dev.create_texture(64, 32, 1, TextureFormat::Color, false).unwrap();
        let clut = dev.create_render_target(256, 1, TextureFormat::Color, false).unwrap();
        dev.backend_mut().take_calls();

        dev.update_clut_texture(&src, 1.0, 0, 16, &clut, 0, 16).unwrap();
        let clut4 = dev.convert.ps(ShaderConvert::Clut4);
        assert!(dev.backend().calls().contains(&NativeCall::SetPixelShader(Some(clut4))));

        dev.update_clut_texture(&src, 1.0, 0, 16, &clut, 0, 256).unwrap();
        let clut8 = dev.convert.ps(ShaderConvert::Clut8);
        assert!(dev.backend().calls().contains(&NativeCall::SetPixelShader(Some(clut8))));
        assert_eq!(dev.backend().count_calls(|c| matches!(c, NativeCall::Draw { .. })), 2);
    }

    #[test]
    fn present_rect_draws_into_bound_surface() {
        let mut dev = device(RecordingBackend::new().with_surface(1280, 720));
        let src = dev.create_render_target(640, 448, TextureFormat::Color, true).unwrap();
        dev.backend_mut().take_calls();

        dev.present_rect(
            &src,
            RectF::UNIT,
            None,
            RectF::new(0.0, 0.0, 1280.0, 720.0),
            PresentShader::Scanline,
            0.5,
            true,
        )
        .unwrap();

        let calls = dev.backend().calls();
        let ps = dev.convert.present_ps[PresentShader::Scanline as usize];
        assert!(calls.contains(&NativeCall::SetPixelShader(Some(ps))));
        assert!(calls.contains(&NativeCall::SetPsShaderResource {
            slot: 0,
            texture: Some(src.id())
        }));
        assert!(!calls.iter().any(|c| matches!(c, NativeCall::SetRenderTargets { .. })));
        assert_eq!(dev.backend().count_calls(|c| matches!(c, NativeCall::Draw { vertex_count: 4, .. })), 1);
    }
}
