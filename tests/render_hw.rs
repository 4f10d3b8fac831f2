use pretty_assertions::assert_eq;
use ps2gs_hw::backend::recording::{NativeCall, RecordingBackend};
use ps2gs_hw::convert::{sort_multi_stretch_rects, MultiStretchRect};
use ps2gs_hw::blend::{HwBlendFactor, HwBlendOp};
use ps2gs_hw::draw::config::{
    AlphaSecondPass, BlendState, DepthStencilSelector, DestinationAlphaMode, HwDrawConfig, PsSelector, VsExpand,
    VsSelector, ZTest,
};
use ps2gs_hw::draw::constants::{ConvertVertex, GsVertex};
use ps2gs_hw::hal::{BlendDesc, BufferId, ColorMask, CompareFunc, DepthStencilDesc, ShaderId};
use ps2gs_hw::stream::MAX_QUADS_PER_DRAW;
use ps2gs_hw::shader::{MemoryShaderSource, ShaderConvert};
use ps2gs_hw::{GsDevice, GsDeviceConfig, GsError, IntRect, RectF, Texture, TextureFormat, TextureType};

const TRIANGLE: [GsVertex; 3] = [GsVertex {
    st: [0.0; 2],
    rgba: [255; 4],
    q: 1.0,
    xy: [0; 2],
    z: 0,
    uv: [0; 2],
    fog: 0,
}; 3];
const TRIANGLE_INDICES: [u16; 3] = [0, 1, 2];

fn device_with(config: GsDeviceConfig) -> GsDevice<RecordingBackend> {
    GsDevice::create(
        RecordingBackend::new(),
        config,
        Box::new(MemoryShaderSource::with_placeholders()),
    )
    .unwrap()
}

fn device() -> GsDevice<RecordingBackend> {
    device_with(GsDeviceConfig::default())
}

fn untextured() -> PsSelector {
    PsSelector {
        tfx: 4,
        ..PsSelector::default()
    }
}

fn draw_config(rt: Texture) -> HwDrawConfig<'static> {
    HwDrawConfig {
        rt: Some(rt),
        verts: &TRIANGLE,
        indices: &TRIANGLE_INDICES,
        drawarea: rt.rect(),
        scissor: rt.rect(),
        colormask: ColorMask::all(),
        ps: untextured(),
        ..HwDrawConfig::default()
    }
}

fn position(calls: &[NativeCall], pred: impl Fn(&NativeCall) -> bool) -> usize {
    calls.iter().position(pred).expect("call not recorded")
}

fn rposition(calls: &[NativeCall], pred: impl Fn(&NativeCall) -> bool) -> usize {
    calls.iter().rposition(pred).expect("call not recorded")
}

fn created_with_format(calls: &[NativeCall], format: TextureFormat) -> Vec<ps2gs_hw::hal::TextureId> {
    calls
        .iter()
        .filter_map(|c| match c {
            NativeCall::CreateTexture { id, desc } if desc.format == format => Some(*id),
            _ => None,
        })
        .collect()
}

fn nth_indexed_draw(calls: &[NativeCall], n: usize) -> usize {
    calls
        .iter()
        .enumerate()
        .filter(|(_, c)| matches!(c, NativeCall::DrawIndexed { .. }))
        .nth(n)
        .map(|(i, _)| i)
        .expect("indexed draw not recorded")
}

/// Blend state, depth state and pixel shader in effect at call `at`.
fn bound_at(dev: &GsDevice<RecordingBackend>, at: usize) -> (BlendDesc, DepthStencilDesc, ShaderId) {
    let calls = &dev.backend().calls()[..at];
    let blend = calls
        .iter()
        .rev()
        .find_map(|c| match c {
            NativeCall::SetBlendState { state, .. } => Some(*state),
            _ => None,
        })
        .unwrap();
    let depth = calls
        .iter()
        .rev()
        .find_map(|c| match c {
            NativeCall::SetDepthStencilState { state, .. } => Some(*state),
            _ => None,
        })
        .unwrap();
    let ps = calls
        .iter()
        .rev()
        .find_map(|c| match c {
            NativeCall::SetPixelShader(Some(id)) => Some(*id),
            _ => None,
        })
        .unwrap();
    (
        dev.backend().blend_desc(blend).unwrap(),
        dev.backend().depth_stencil_desc(depth).unwrap(),
        ps,
    )
}

fn buffer_updates(calls: &[NativeCall]) -> Vec<(BufferId, u32, u32)> {
    calls
        .iter()
        .filter_map(|c| match c {
            NativeCall::UpdateBuffer { buffer, offset, len } => Some((*buffer, *offset, *len)),
            _ => None,
        })
        .collect()
}

/// The convert quad streamed last before call `at`.
fn quad_before(dev: &GsDevice<RecordingBackend>, at: usize) -> [ConvertVertex; 4] {
    let (buffer, offset) = dev.backend().calls()[..at]
        .iter()
        .rev()
        .find_map(|c| match c {
            NativeCall::WriteBuffer { buffer, offset, len: 128, .. } => Some((*buffer, *offset as usize)),
            _ => None,
        })
        .unwrap();
    let bytes = &dev.backend().buffer_contents(buffer).unwrap()[offset..offset + 128];
    std::array::from_fn(|i| bytemuck::pod_read_unaligned(&bytes[i * 32..(i + 1) * 32]))
}

fn depth_tested(rt: Texture, ds: Texture) -> HwDrawConfig<'static> {
    HwDrawConfig {
        ds: Some(ds),
        depth: DepthStencilSelector {
            ztst: ZTest::Greater,
            zwe: true,
            ..DepthStencilSelector::default()
        },
        blend: BlendState::new(HwBlendOp::Add, HwBlendFactor::SrcAlpha, HwBlendFactor::InvSrcAlpha, 0),
        ..draw_config(rt)
    }
}

#[test]
fn plain_draw_binds_target_and_draws_once() {
    let mut dev = device();
    let rt = dev.create_render_target(64, 64, TextureFormat::Color, true).unwrap();
    dev.backend_mut().take_calls();

    dev.render_hw(&mut draw_config(rt)).unwrap();

    let calls = dev.backend().calls();
    assert!(calls.contains(&NativeCall::SetRenderTargets {
        rt: Some(rt.id()),
        ds: None
    }));
    assert_eq!(
        dev.backend()
            .count_calls(|c| matches!(c, NativeCall::DrawIndexed { index_count: 3, .. })),
        1
    );
    // Untextured draws never bind a sampler.
    assert!(!calls
        .iter()
        .any(|c| matches!(c, NativeCall::SetPsSampler { sampler: Some(_), .. })));
    assert_eq!(dev.stats().snapshot().abandoned_draws, 0);
}

#[test]
fn hdr_draw_renders_into_float_target_and_resolves_once() {
    let mut dev = device();
    let rt = dev.create_render_target(64, 64, TextureFormat::Color, true).unwrap();
    dev.backend_mut().take_calls();

    let mut config = draw_config(rt);
    config.ps.hdr = true;
    config.drawarea = IntRect::new(8, 8, 24, 24);
    dev.render_hw(&mut config).unwrap();

    let calls = dev.backend().calls();
    let hdr = created_with_format(calls, TextureFormat::HDRColor);
    assert_eq!(hdr.len(), 1);
    let hdr = hdr[0];

    // Init and resolve stretches.
    assert_eq!(dev.backend().count_calls(|c| matches!(c, NativeCall::Draw { .. })), 2);

    let draw = position(calls, |c| matches!(c, NativeCall::DrawIndexed { .. }));
    let target_before_draw = rposition(&calls[..draw], |c| matches!(c, NativeCall::SetRenderTargets { .. }));
    assert_eq!(
        calls[target_before_draw],
        NativeCall::SetRenderTargets {
            rt: Some(hdr),
            ds: None
        }
    );

    let resolve = rposition(calls, |c| matches!(c, NativeCall::Draw { vertex_count: 4, .. }));
    assert!(resolve > draw);
    let resolve_target = rposition(&calls[..resolve], |c| matches!(c, NativeCall::SetRenderTargets { .. }));
    assert_eq!(
        calls[resolve_target],
        NativeCall::SetRenderTargets {
            rt: Some(rt.id()),
            ds: None
        }
    );

    // The HDR scratch target went back to the pool.
    assert_eq!(dev.texture_pool().len(TextureType::RenderTarget), 1);
}

#[test]
fn primitive_id_tracking_runs_a_prepass() {
    let mut dev = device();
    let rt = dev.create_render_target(64, 64, TextureFormat::Color, true).unwrap();
    dev.backend_mut().take_calls();

    let mut config = draw_config(rt);
    config.destination_alpha = DestinationAlphaMode::PrimIDTracking;
    dev.render_hw(&mut config).unwrap();
    assert_eq!(config.ps.date, 3);

    let calls = dev.backend().calls();
    let primid = created_with_format(calls, TextureFormat::PrimID);
    assert_eq!(primid.len(), 1);
    let primid = primid[0];

    assert_eq!(
        dev.backend()
            .count_calls(|c| matches!(c, NativeCall::DrawIndexed { .. })),
        2
    );
    let first_draw = position(calls, |c| matches!(c, NativeCall::DrawIndexed { .. }));
    let prepass_target = rposition(&calls[..first_draw], |c| matches!(c, NativeCall::SetRenderTargets { .. }));
    assert_eq!(
        calls[prepass_target],
        NativeCall::SetRenderTargets {
            rt: Some(primid),
            ds: None
        }
    );

    let last_draw = rposition(calls, |c| matches!(c, NativeCall::DrawIndexed { .. }));
    let bound = position(calls, |c| {
        *c == NativeCall::SetPsShaderResource {
            slot: 3,
            texture: Some(primid),
        }
    });
    assert!(first_draw < bound && bound < last_draw);

    let ps = calls[..last_draw]
        .iter()
        .rev()
        .find_map(|c| match c {
            NativeCall::SetPixelShader(Some(id)) => Some(*id),
            _ => None,
        })
        .unwrap();
    assert_eq!(dev.backend().shader_macros(ps).unwrap().get("PS_DATE"), Some("3"));
}

#[test]
fn failed_upload_abandons_the_draw() {
    let mut dev = device_with(GsDeviceConfig {
        vertex_buffer_size: 128,
        ..GsDeviceConfig::default()
    });
    let rt = dev.create_render_target(64, 64, TextureFormat::Color, true).unwrap();
    dev.backend_mut().take_calls();

    let verts = [TRIANGLE[0]; 5];
    let mut config = draw_config(rt);
    config.verts = &verts;
    config.ps.hdr = true;

    let err = dev.render_hw(&mut config).unwrap_err();
    assert!(matches!(err, GsError::CapacityExceeded { .. }));
    assert_eq!(dev.stats().snapshot().abandoned_draws, 1);

    // The HDR init ran, the resolve did not.
    assert_eq!(dev.backend().count_calls(|c| matches!(c, NativeCall::Draw { .. })), 1);
    assert_eq!(
        dev.backend()
            .count_calls(|c| matches!(c, NativeCall::DrawIndexed { .. })),
        0
    );
    assert_eq!(dev.texture_pool().len(TextureType::RenderTarget), 1);
}

#[test]
fn draw_without_targets_is_rejected() {
    let mut dev = device();
    let mut config = HwDrawConfig {
        verts: &TRIANGLE,
        indices: &TRIANGLE_INDICES,
        ps: untextured(),
        ..HwDrawConfig::default()
    };
    assert!(matches!(dev.render_hw(&mut config), Err(GsError::Unsupported(_))));
    assert_eq!(dev.stats().snapshot().abandoned_draws, 1);
}

#[test]
fn sampling_the_target_reads_a_copy() {
    let mut dev = device();
    let rt = dev.create_render_target(64, 64, TextureFormat::Color, true).unwrap();
    dev.backend_mut().take_calls();

    let mut config = draw_config(rt);
    config.ps = PsSelector::default();
    config.tex = Some(rt);
    config.require_one_barrier = true;
    config.drawarea = IntRect::new(0, 0, 32, 32);
    dev.render_hw(&mut config).unwrap();

    let calls = dev.backend().calls();
    let copy = calls
        .iter()
        .find_map(|c| match c {
            NativeCall::CopyTextureRegion { src, dst, .. } if *src == rt.id() => Some(*dst),
            _ => None,
        })
        .unwrap();
    assert_ne!(copy, rt.id());
    assert!(calls.contains(&NativeCall::SetPsShaderResource {
        slot: 0,
        texture: Some(copy)
    }));
    assert!(calls.contains(&NativeCall::SetPsShaderResource {
        slot: 2,
        texture: Some(copy)
    }));
    assert!(!calls.contains(&NativeCall::SetPsShaderResource {
        slot: 0,
        texture: Some(rt.id())
    }));

    let stats = dev.stats().snapshot();
    assert_eq!((stats.texture_copies, stats.barriers), (1, 1));
}

#[test]
fn multi_stretch_rects_batch_by_source() {
    let mut dev = device();
    let a = dev.create_texture(32, 32, 1, TextureFormat::Color, false).unwrap();
    let b = dev.create_texture(32, 32, 1, TextureFormat::Color, false).unwrap();
    let dst = dev.create_render_target(128, 128, TextureFormat::Color, true).unwrap();
    dev.backend_mut().take_calls();

    let rect = |src: Texture, x: f32| MultiStretchRect {
        src,
        src_rect: RectF::UNIT,
        dst_rect: RectF::new(x, 0.0, x + 32.0, 32.0),
        linear: false,
        wmask: ColorMask::all(),
    };
    let mut rects = [rect(a, 0.0), rect(b, 32.0), rect(a, 64.0)];
    sort_multi_stretch_rects(&mut rects);
    dev.draw_multi_stretch_rects(&rects, &dst, ShaderConvert::Copy).unwrap();

    let counts: Vec<u32> = dev
        .backend()
        .calls()
        .iter()
        .filter_map(|c| match c {
            NativeCall::DrawIndexed { index_count, .. } => Some(*index_count),
            _ => None,
        })
        .collect();
    // Two quads joined by degenerate triangles, then a lone quad.
    assert_eq!(counts, vec![11, 5]);
    assert!(dev.backend().calls().contains(&NativeCall::SetPsShaderResource {
        slot: 0,
        texture: Some(b.id())
    }));
}

#[test]
fn hdr_resolve_covers_the_draw_area() {
    let mut dev = device();
    let rt = dev.create_render_target(64, 64, TextureFormat::Color, true).unwrap();
    dev.backend_mut().take_calls();

    let mut config = draw_config(rt);
    config.ps.hdr = true;
    config.drawarea = IntRect::new(8, 8, 24, 24);
    dev.render_hw(&mut config).unwrap();

    let calls = dev.backend().calls();
    let resolve = rposition(calls, |c| matches!(c, NativeCall::Draw { vertex_count: 4, .. }));
    let quad = quad_before(&dev, resolve);
    assert_eq!((quad[0].pos[0], quad[0].pos[1]), (-0.75, 0.75));
    assert_eq!((quad[3].pos[0], quad[3].pos[1]), (-0.25, 0.25));
    assert_eq!(quad[0].uv, [0.125, 0.125]);
    assert_eq!(quad[3].uv, [0.375, 0.375]);
}

#[test]
fn alpha_passes_follow_the_color_passes() {
    let mut dev = device();
    let rt = dev.create_render_target(64, 64, TextureFormat::Color, true).unwrap();
    let ds = dev.create_depth_stencil(64, 64, TextureFormat::DepthStencil, true).unwrap();
    dev.backend_mut().take_calls();

    let mut config = depth_tested(rt, ds);
    config.cb_ps.set_aref(0.25);
    config.separate_alpha_pass = true;
    config.second_separate_alpha_pass = true;
    config.alpha_second_pass = AlphaSecondPass {
        enable: true,
        colormask: ColorMask::all(),
        depth: config.depth,
        ps: PsSelector {
            atst: 2,
            ..untextured()
        },
        ps_aref: 0.5,
    };
    dev.render_hw(&mut config).unwrap();

    let calls = dev.backend().calls();
    assert_eq!(dev.backend().count_calls(|c| matches!(c, NativeCall::DrawIndexed { .. })), 4);
    let draws: Vec<usize> = (0..4).map(|n| nth_indexed_draw(calls, n)).collect();

    for &alpha_pass in &[draws[1], draws[3]] {
        let (blend, depth, ps) = bound_at(&dev, alpha_pass);
        assert_eq!(blend.write_mask, ColorMask::A);
        assert!(!blend.enable);
        assert!(!depth.depth_write);
        assert_eq!(depth.depth_func, CompareFunc::GreaterEqual);
        assert_eq!(dev.backend().shader_macros(ps).unwrap().get("PS_ONLY_ALPHA"), Some("1"));
    }

    let (blend, depth, ps) = bound_at(&dev, draws[2]);
    assert_eq!(blend.write_mask, ColorMask::all());
    assert!(depth.depth_write);
    assert_eq!(dev.backend().shader_macros(ps).unwrap().get("PS_ATST"), Some("2"));

    // Only the alpha reference register is rewritten for the second pass.
    let ps_cb = calls[..draws[0]]
        .iter()
        .rev()
        .find_map(|c| match c {
            NativeCall::SetPsConstantBuffer(Some(id)) => Some(*id),
            _ => None,
        })
        .unwrap();
    assert_eq!(buffer_updates(&calls[draws[0]..draws[1]]), vec![]);
    assert_eq!(buffer_updates(&calls[draws[1]..draws[2]]), vec![(ps_cb, 12, 4)]);
    assert_eq!(buffer_updates(&calls[draws[2]..draws[3]]), vec![]);
    let aref = bytemuck::pod_read_unaligned::<f32>(&dev.backend().buffer_contents(ps_cb).unwrap()[12..16]);
    assert_eq!(aref, 0.5);
    assert_eq!(config.cb_ps.aref(), 0.5);
}

#[test]
fn unchanged_alpha_reference_is_not_uploaded() {
    let mut dev = device();
    let rt = dev.create_render_target(64, 64, TextureFormat::Color, true).unwrap();
    dev.backend_mut().take_calls();

    let mut config = draw_config(rt);
    config.cb_ps.set_aref(0.5);
    config.alpha_second_pass = AlphaSecondPass {
        enable: true,
        colormask: ColorMask::RGB,
        ps: untextured(),
        ps_aref: 0.5,
        ..AlphaSecondPass::default()
    };
    dev.render_hw(&mut config).unwrap();

    let calls = dev.backend().calls();
    assert_eq!(dev.backend().count_calls(|c| matches!(c, NativeCall::DrawIndexed { .. })), 2);
    let (first, second) = (nth_indexed_draw(calls, 0), nth_indexed_draw(calls, 1));
    assert_eq!(buffer_updates(&calls[first..second]), vec![]);
    let (blend, _, _) = bound_at(&dev, second);
    assert_eq!(blend.write_mask, ColorMask::RGB);
}

fn stencil_date(mode: DestinationAlphaMode, datm: bool, entry_point: &str) {
    let mut dev = device();
    let rt = dev.create_render_target(64, 64, TextureFormat::Color, true).unwrap();
    let ds = dev.create_depth_stencil(64, 64, TextureFormat::DepthStencil, true).unwrap();
    dev.backend_mut().take_calls();

    let mut config = depth_tested(rt, ds);
    config.destination_alpha = mode;
    config.datm = datm;
    dev.render_hw(&mut config).unwrap();

    let calls = dev.backend().calls();
    let clear = position(calls, |c| {
        *c == NativeCall::ClearStencil {
            texture: ds.id(),
            value: 0,
        }
    });
    let setup = position(calls, |c| matches!(c, NativeCall::Draw { vertex_count: 4, .. }));
    let draw = nth_indexed_draw(calls, 0);
    assert!(clear < setup && setup < draw);

    let (_, depth, ps) = bound_at(&dev, setup);
    assert_eq!(dev.backend().shader_entry(ps), Some(entry_point));
    assert!(depth.stencil_enable);
    let stencil_ref = calls[..setup]
        .iter()
        .rev()
        .find_map(|c| match c {
            NativeCall::SetDepthStencilState { stencil_ref, .. } => Some(*stencil_ref),
            _ => None,
        })
        .unwrap();
    assert_eq!(stencil_ref, 1);

    let setup_target = rposition(&calls[..setup], |c| matches!(c, NativeCall::SetRenderTargets { .. }));
    assert_eq!(
        calls[setup_target],
        NativeCall::SetRenderTargets {
            rt: None,
            ds: Some(ds.id())
        }
    );
    let draw_target = rposition(&calls[..draw], |c| matches!(c, NativeCall::SetRenderTargets { .. }));
    assert_eq!(
        calls[draw_target],
        NativeCall::SetRenderTargets {
            rt: Some(rt.id()),
            ds: Some(ds.id())
        }
    );
}

#[test]
fn stencil_date_marks_passing_pixels_first() {
    stencil_date(DestinationAlphaMode::Stencil, true, "ps_datm1");
}

#[test]
fn stencil_one_date_uses_the_datm_shader() {
    stencil_date(DestinationAlphaMode::StencilOne, false, "ps_datm0");
}

#[test]
fn stencil_date_without_depth_target_draws_plainly() {
    let mut dev = device();
    let rt = dev.create_render_target(64, 64, TextureFormat::Color, true).unwrap();
    dev.backend_mut().take_calls();

    let mut config = draw_config(rt);
    config.destination_alpha = DestinationAlphaMode::Stencil;
    dev.render_hw(&mut config).unwrap();

    assert_eq!(dev.backend().count_calls(|c| matches!(c, NativeCall::ClearStencil { .. })), 0);
    assert_eq!(dev.backend().count_calls(|c| matches!(c, NativeCall::Draw { .. })), 0);
    assert_eq!(dev.backend().count_calls(|c| matches!(c, NativeCall::DrawIndexed { .. })), 1);
}

fn sprite_draw(rt: Texture, verts: &[GsVertex]) -> HwDrawConfig<'_> {
    HwDrawConfig {
        verts,
        indices: &[],
        vs: VsSelector {
            expand: VsExpand::Sprite,
            ..VsSelector::default()
        },
        ..draw_config(rt)
    }
}

#[test]
fn sprite_expansion_reads_structured_vertices() {
    let mut dev = device();
    let rt = dev.create_render_target(64, 64, TextureFormat::Color, true).unwrap();
    dev.backend_mut().take_calls();

    let sprites = [TRIANGLE[0]; 4];

    let mut first = sprite_draw(rt, &sprites);
    dev.render_hw(&mut first).unwrap();
    assert_eq!(first.cb_vs.max_depth[1], 0);

    let mut second = sprite_draw(rt, &sprites);
    dev.render_hw(&mut second).unwrap();
    // The second upload lands after the first four vertices.
    assert_eq!(second.cb_vs.max_depth[1], 4);

    let calls = dev.backend().calls();
    assert!(calls.iter().any(|c| matches!(c, NativeCall::SetVsStructuredBuffer(Some(_)))));
    assert!(calls.contains(&NativeCall::SetInputLayout(None)));
    assert!(!calls.iter().any(|c| matches!(c, NativeCall::SetVertexBuffer { .. })));
    assert_eq!(
        dev.backend()
            .count_calls(|c| *c == NativeCall::DrawIndexed { index_count: 12, first_index: 0, base_vertex: 0 }),
        2
    );

    let vs_cb = calls
        .iter()
        .rev()
        .find_map(|c| match c {
            NativeCall::SetVsConstantBuffer(Some(id)) => Some(*id),
            _ => None,
        })
        .unwrap();
    let base = bytemuck::pod_read_unaligned::<u32>(&dev.backend().buffer_contents(vs_cb).unwrap()[44..48]);
    assert_eq!(base, 4);
}

#[test]
fn long_multi_stretch_runs_are_split() {
    let mut dev = device();
    let src = dev.create_texture(32, 32, 1, TextureFormat::Color, false).unwrap();
    let dst = dev.create_render_target(64, 64, TextureFormat::Color, true).unwrap();
    dev.backend_mut().take_calls();

    let rects = vec![
        MultiStretchRect {
            src,
            src_rect: RectF::UNIT,
            dst_rect: RectF::new(0.0, 0.0, 8.0, 8.0),
            linear: false,
            wmask: ColorMask::all(),
        };
        MAX_QUADS_PER_DRAW + 1
    ];
    dev.draw_multi_stretch_rects(&rects, &dst, ShaderConvert::Copy).unwrap();

    let counts: Vec<u32> = dev
        .backend()
        .calls()
        .iter()
        .filter_map(|c| match c {
            NativeCall::DrawIndexed { index_count, .. } => Some(*index_count),
            _ => None,
        })
        .collect();
    assert_eq!(counts, vec![(MAX_QUADS_PER_DRAW * 6 - 1) as u32, 5]);
}
