//! Hardware draw submission.

pub mod config;
pub mod constants;

use tracing::{error, warn};

use crate::blend::{HwBlendFactor, HwBlendOp};
use crate::convert::StretchPass;
use crate::device::GsDevice;
use crate::error::GsError;
use crate::hal::{ColorMask, GsBackend};
use crate::pipeline::PipelineKey;
use crate::shader::ShaderConvert;
use crate::texture::{Texture, TextureFormat};

use self::config::{
    convert_sel, set_hw_draw_config_for_alpha_pass, BlendSelector, DepthStencilSelector, DestinationAlphaMode,
    HwDrawConfig, PsSelector, VsExpand,
};

fn pipeline_key(config: &HwDrawConfig<'_>, ps: PsSelector, blend: BlendSelector, depth: DepthStencilSelector) -> PipelineKey {
    PipelineKey {
        vs: config.vs,
        ps,
        blend,
        depth,
        sampler: (!ps.is_untextured()).then_some(config.sampler),
    }
}

/// Pipeline key of a separate alpha-only pass following a color pass.
fn alpha_pass_key(
    config: &HwDrawConfig<'_>,
    mut ps: PsSelector,
    mut colormask: ColorMask,
    depth: DepthStencilSelector,
) -> PipelineKey {
    let mut blend = config.blend;
    let mut depth = depth;
    set_hw_draw_config_for_alpha_pass(&mut ps, &mut colormask, &mut blend, &mut depth);
    pipeline_key(config, ps, convert_sel(colormask, &blend), depth)
}

/// Geometry bound for the passes of one draw.
#[derive(Clone, Copy, Debug)]
struct DrawRange {
    index_count: u32,
    first_index: u32,
    base_vertex: u32,
}

impl<B: GsBackend> GsDevice<B> {
    /// Issues one emulated GS draw: destination alpha setup, HDR
    /// round-trip, geometry upload, and up to five passes.
    ///
    /// Scratch targets are returned to the pool whether the draw succeeds or
    /// not. A failed draw is counted as abandoned and its error returned.
    ///
    /// # Panics
    ///
    /// If the draw needs per-primitive barriers.
    pub fn render_hw(&mut self, config: &mut HwDrawConfig<'_>) -> Result<(), GsError> {
        assert!(!config.require_full_barrier, "per-primitive barriers are not supported");

        let mut scratch = Vec::new();
        let result = self.render_hw_passes(config, &mut scratch);
        for texture in scratch {
            self.recycle(texture);
        }

        if let Err(err) = &result {
            self.stats.inc_abandoned_draws();
            error!(%err, nverts = config.nverts(), nindices = config.nindices(), "abandoning hardware draw");
        }
        result
    }

    fn render_hw_passes(&mut self, config: &mut HwDrawConfig<'_>, scratch: &mut Vec<Texture>) -> Result<(), GsError> {
        let target = config
            .rt
            .or(config.ds)
            .ok_or(GsError::Unsupported("draw without a color or depth target"))?;
        let (rt_width, rt_height) = target.size();
        let d_rect = config.drawarea.to_f32();
        let s_rect = d_rect.normalized(rt_width, rt_height);

        let mut primid = None;
        match config.destination_alpha {
            DestinationAlphaMode::Off => {}
            DestinationAlphaMode::PrimIDTracking => {
                let rt = config
                    .rt
                    .ok_or(GsError::Unsupported("primitive ID tracking without a color target"))?;
                let tex = self.create_render_target(rt_width, rt_height, TextureFormat::PrimID, false)?;
                scratch.push(tex);
                let pass = StretchPass {
                    vs: self.convert.vs,
                    ps: self.convert.primid_init_ps[usize::from(config.datm)],
                    ps_cb: None,
                    blend: self.convert.bs[ColorMask::all().bits() as usize],
                    linear: false,
                };
                self.stretch_rect_with(&rt, s_rect, &tex, d_rect, pass)?;
                primid = Some(tex);
            }
            DestinationAlphaMode::Stencil | DestinationAlphaMode::StencilOne => {
                match (config.rt, config.ds) {
                    (Some(rt), Some(ds)) => self.setup_date(&rt, &ds, config.datm, config.drawarea)?,
                    (rt, ds) => warn!(
                        has_rt = rt.is_some(),
                        has_ds = ds.is_some(),
                        "stencil destination alpha needs both targets, skipping setup"
                    ),
                }
            }
        }

        let hdr = match (config.ps.hdr, config.rt) {
            (true, Some(rt)) => {
                let hdr = self.create_render_target(rt_width, rt_height, TextureFormat::HDRColor, false)?;
                scratch.push(hdr);
                self.stretch_rect(&rt, s_rect, &hdr, d_rect, ShaderConvert::HdrInit, false)?;
                Some(hdr)
            }
            _ => None,
        };

        let range = self.upload_geometry(config)?;
        self.state
            .set_primitive_topology(&mut self.backend, config.topology.to_native());

        self.state
            .stage_ps_resources(config.tex.map(|t| t.id()), config.pal.map(|t| t.id()));
        self.state.stage_ps_resource(3, None);

        let tex_is_rt = config.tex.is_some() && config.tex == config.rt;
        if config.require_one_barrier || tex_is_rt {
            if let Some(rt) = config.rt {
                let copy = self.clone_texture(&rt, config.drawarea)?;
                scratch.push(copy);
                if config.require_one_barrier {
                    self.stats.inc_barriers();
                    self.state.stage_ps_resource(2, Some(copy.id()));
                }
                if tex_is_rt {
                    self.state.stage_ps_resource(0, Some(copy.id()));
                }
            }
        }
        if config.tex.is_some() && config.tex == config.ds {
            if let Some(ds) = config.ds {
                let copy = self.clone_texture(&ds, config.drawarea)?;
                scratch.push(copy);
                self.state.stage_ps_resource(0, Some(copy.id()));
            }
        }

        self.upload_vs_constants(&config.cb_vs);
        self.upload_ps_constants(&config.cb_ps);

        if let Some(primid) = primid {
            let depth = DepthStencilSelector {
                zwe: false,
                ..config.depth
            };
            let blend = BlendSelector {
                wrgba: ColorMask::R,
                enable: true,
                src: HwBlendFactor::ConstOne,
                dst: HwBlendFactor::ConstOne,
                op: HwBlendOp::Min,
            };
            let key = pipeline_key(config, config.ps, blend, depth);
            self.bind_pipeline(&key, 0.0)?;
            self.state
                .set_render_targets(&mut self.backend, Some(&primid), config.ds.as_ref(), Some(config.scissor));
            self.draw_range(range);

            config.ps.date = 3;
            config.alpha_second_pass.ps.date = 3;
            self.state.stage_ps_resource(3, Some(primid.id()));
        }

        let color_target = hdr.or(config.rt);
        let blend_factor = f32::from(config.blend.constant) / 128.0;

        let key = pipeline_key(config, config.ps, convert_sel(config.colormask, &config.blend), config.depth);
        self.bind_pipeline(&key, blend_factor)?;
        self.state.set_render_targets(
            &mut self.backend,
            color_target.as_ref(),
            config.ds.as_ref(),
            Some(config.scissor),
        );
        self.draw_range(range);

        if config.separate_alpha_pass {
            let key = alpha_pass_key(config, config.ps, config.colormask, config.depth);
            self.upload_ps_constants(&config.cb_ps);
            self.bind_pipeline(&key, blend_factor)?;
            self.draw_range(range);
        }

        if config.alpha_second_pass.enable {
            let second = config.alpha_second_pass;
            if config.cb_ps.aref() != second.ps_aref {
                config.cb_ps.set_aref(second.ps_aref);
                self.upload_ps_constants(&config.cb_ps);
            }

            let key = pipeline_key(config, second.ps, convert_sel(second.colormask, &config.blend), second.depth);
            self.bind_pipeline(&key, blend_factor)?;
            self.draw_range(range);

            if config.second_separate_alpha_pass {
                let key = alpha_pass_key(config, second.ps, second.colormask, second.depth);
                self.bind_pipeline(&key, blend_factor)?;
                self.draw_range(range);
            }
        }

        if let (Some(hdr), Some(rt)) = (hdr, config.rt) {
            self.stretch_rect(&hdr, s_rect, &rt, d_rect, ShaderConvert::HdrResolve, false)?;
        }
        Ok(())
    }

    /// Streams vertices and indices for the draw.
    fn upload_geometry(&mut self, config: &mut HwDrawConfig<'_>) -> Result<DrawRange, GsError> {
        let nverts = config.nverts();
        let base_vertex = if config.vs.expand != VsExpand::None {
            let base = self
                .ia_set_expand_vertices(config.verts)
                .inspect_err(|err| error!(nverts, %err, "failed to upload structured vertices"))?;
            // Expanding shaders index the structured buffer themselves.
            config.cb_vs.max_depth[1] = base;
            0
        } else {
            self.ia_set_vertices(config.verts)
                .inspect_err(|err| error!(nverts, %err, "failed to upload vertices"))?
        };

        let first_index = if config.vs.use_expand_index_buffer() {
            self.ia_set_expand_index_buffer()?;
            0
        } else {
            let nindices = config.indices.len();
            self.ia_set_indices(config.indices)
                .inspect_err(|err| error!(nindices, %err, "failed to upload indices"))?
        };

        Ok(DrawRange {
            index_count: config.nindices(),
            first_index,
            base_vertex,
        })
    }

    fn bind_pipeline(&mut self, key: &PipelineKey, blend_factor: f32) -> Result<(), GsError> {
        let handle = self.pipelines.resolve(&mut self.backend, &mut self.shaders, key)?;
        let objects = *self.pipelines.objects(handle)?;

        self.state
            .set_vertex_shader(&mut self.backend, Some(objects.vs), Some(self.vs_cb));
        self.state.set_input_layout(&mut self.backend, objects.layout);
        self.state
            .set_pixel_shader(&mut self.backend, Some(objects.ps), Some(self.ps_cb));
        self.state
            .set_blend_state(&mut self.backend, objects.blend, blend_factor);
        self.state
            .set_depth_stencil_state(&mut self.backend, objects.depth, 1);
        self.state.stage_ps_sampler(objects.sampler);
        Ok(())
    }

    fn draw_range(&mut self, range: DrawRange) {
        self.draw_indexed_primitive(range.index_count, range.first_index, range.base_vertex);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draw::config::SamplerSelector;

    #[test]
    fn untextured_draws_have_no_sampler() {
        let config = HwDrawConfig {
            sampler: SamplerSelector {
                biln: true,
                ..SamplerSelector::default()
            },
            ..HwDrawConfig::default()
        };
        let textured = PsSelector::default();
        let untextured = PsSelector {
            tfx: 4,
            ..PsSelector::default()
        };
        let blend = BlendSelector::write_only(ColorMask::all());

        assert_eq!(
            pipeline_key(&config, textured, blend, config.depth).sampler,
            Some(config.sampler)
        );
        assert_eq!(pipeline_key(&config, untextured, blend, config.depth).sampler, None);
    }

    #[test]
    fn alpha_pass_key_writes_alpha_only() {
        let config = HwDrawConfig {
            colormask: ColorMask::all(),
            depth: DepthStencilSelector {
                zwe: true,
                ..DepthStencilSelector::default()
            },
            ..HwDrawConfig::default()
        };
        let key = alpha_pass_key(&config, config.ps, config.colormask, config.depth);
        assert_eq!(key.colormask(), ColorMask::A);
        assert!(key.ps.only_alpha);
        assert!(!key.depth.zwe);
    }
}
