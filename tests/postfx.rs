use pretty_assertions::assert_eq;
use ps2gs_hw::backend::recording::{NativeCall, RecordingBackend};
use ps2gs_hw::present::PRESENT_CLEAR_COLOR;
use ps2gs_hw::shader::MemoryShaderSource;
use ps2gs_hw::{
    ChainTarget, FeatureLevel, GsDevice, GsDeviceConfig, GsEvent, GsRegExtbuf, GsRegPmode, IntRect, PresentResult,
    RectF, Texture, TextureFormat,
};

fn device_on(backend: RecordingBackend, config: GsDeviceConfig) -> GsDevice<RecordingBackend> {
    GsDevice::create(backend, config, Box::new(MemoryShaderSource::with_placeholders())).unwrap()
}

fn device() -> GsDevice<RecordingBackend> {
    device_on(RecordingBackend::new(), GsDeviceConfig::default())
}

fn count(dev: &GsDevice<RecordingBackend>, pred: impl Fn(&NativeCall) -> bool) -> usize {
    dev.backend().count_calls(pred)
}

fn draws(dev: &GsDevice<RecordingBackend>) -> usize {
    count(dev, |c| matches!(c, NativeCall::Draw { .. }))
}

fn clears(dev: &GsDevice<RecordingBackend>) -> usize {
    count(dev, |c| matches!(c, NativeCall::ClearRenderTarget { .. }))
}

struct MergeCase {
    pmode: GsRegPmode,
    fbin: u8,
    second: bool,
    feedback: bool,
    clears: usize,
    draws: usize,
}

#[test]
fn merge_passes_follow_circuit_registers() {
    let en1 = GsRegPmode {
        en1: true,
        ..GsRegPmode::default()
    };
    let en2 = GsRegPmode {
        en2: true,
        ..GsRegPmode::default()
    };
    let slbg = |pmode: GsRegPmode| GsRegPmode { slbg: true, ..pmode };

    let cases = [
        // Circuit 1 alone.
        MergeCase { pmode: en1, fbin: 0, second: false, feedback: false, clears: 1, draws: 1 },
        // Circuit 2 under circuit 1.
        MergeCase { pmode: en1, fbin: 0, second: true, feedback: false, clears: 1, draws: 2 },
        // Background color replaces circuit 2.
        MergeCase { pmode: slbg(en1), fbin: 0, second: true, feedback: false, clears: 1, draws: 1 },
        // Circuit 2 written back, then blended.
        MergeCase { pmode: en2, fbin: 1, second: true, feedback: true, clears: 1, draws: 3 },
        // Circuit 2 written back, then cleared to the background color.
        MergeCase { pmode: slbg(en2), fbin: 1, second: true, feedback: true, clears: 2, draws: 3 },
        // Circuit 1 written back after the blend.
        MergeCase { pmode: en1, fbin: 0, second: false, feedback: true, clears: 1, draws: 2 },
        // Feedback selects a disabled circuit.
        MergeCase { pmode: en1, fbin: 1, second: false, feedback: true, clears: 1, draws: 1 },
    ];

    for (i, case) in cases.iter().enumerate() {
        let mut dev = device();
        let first = dev.create_texture(64, 32, 1, TextureFormat::Color, false).unwrap();
        let second = dev.create_texture(64, 32, 1, TextureFormat::Color, false).unwrap();
        let feedback = dev.create_render_target(64, 32, TextureFormat::Color, false).unwrap();
        let dst = dev.create_render_target(64, 32, TextureFormat::Color, false).unwrap();
        dev.backend_mut().take_calls();

        let rect = RectF::from_size(64, 32);
        dev.do_merge(
            [
                Some(&first),
                case.second.then_some(&second),
                case.feedback.then_some(&feedback),
            ],
            [RectF::UNIT; 3],
            &dst,
            [rect; 3],
            case.pmode,
            GsRegExtbuf {
                fbin: case.fbin,
                ..GsRegExtbuf::default()
            },
            [0.0, 0.0, 0.0, 1.0],
            false,
        )
        .unwrap();

        assert_eq!((clears(&dev), draws(&dev)), (case.clears, case.draws), "case {i}");
    }
}

fn merged(dev: &mut GsDevice<RecordingBackend>, width: u32, height: u32) -> Texture {
    let src = dev.create_texture(width, height, 1, TextureFormat::Color, false).unwrap();
    let rect = RectF::from_size(width, height);
    dev.merge(
        [Some(&src), None, None],
        [RectF::UNIT; 3],
        [rect; 3],
        (width, height),
        GsRegPmode {
            en1: true,
            ..GsRegPmode::default()
        },
        GsRegExtbuf::default(),
        [0.0; 4],
    )
    .unwrap();
    *dev.current().unwrap()
}

#[test]
fn merge_becomes_current() {
    let mut dev = device();
    let merge = merged(&mut dev, 64, 32);
    assert_eq!(dev.display_chain().current(), Some(ChainTarget::Merge));
    assert_eq!(merge.size(), (64, 32));
}

#[test]
fn mad_deinterlace_keeps_double_height_history() {
    let mut dev = device();
    merged(&mut dev, 64, 32);
    dev.backend_mut().take_calls();

    dev.interlace((64, 32), 1, 3, 0.0).unwrap();

    let chain = dev.display_chain();
    assert_eq!(chain.current(), Some(ChainTarget::Blend));
    assert_eq!(chain.target(ChainTarget::Mad).unwrap().size(), (64, 64));
    assert_eq!(chain.target(ChainTarget::Blend).unwrap().size(), (64, 32));
    assert_eq!(chain.mad_buffer_index(), 1);
    // Buffer the field, then reconstruct.
    assert_eq!(draws(&dev), 2);
}

/// NDC top and bottom edges of the quad streamed for the first draw.
fn first_quad_ndc_y(dev: &GsDevice<RecordingBackend>) -> (f32, f32) {
    let calls = dev.backend().calls();
    let draw = calls
        .iter()
        .position(|c| matches!(c, NativeCall::Draw { .. }))
        .unwrap();
    let (buffer, offset) = calls[..draw]
        .iter()
        .rev()
        .find_map(|c| match c {
            NativeCall::WriteBuffer { buffer, offset, .. } => Some((*buffer, *offset as usize)),
            _ => None,
        })
        .unwrap();
    let bytes = &dev.backend().buffer_contents(buffer).unwrap()[offset..offset + 128];
    // Vertices are 32 bytes with the position first; 0 is top-left, 2 bottom-left.
    let y = |vertex: usize| bytemuck::pod_read_unaligned::<f32>(&bytes[vertex * 32 + 4..vertex * 32 + 8]);
    (y(0), y(2))
}

#[test]
fn mad_buffer_alternates_history_halves() {
    let mut dev = device();
    merged(&mut dev, 64, 32);

    let mut halves = Vec::new();
    for field in [0, 1, 0, 1] {
        dev.backend_mut().take_calls();
        dev.interlace((64, 32), field, 3, 0.0).unwrap();
        halves.push((dev.display_chain().mad_buffer_index(), first_quad_ndc_y(&dev)));
    }
    assert_eq!(
        halves,
        vec![
            (0, (1.0, 0.0)),
            (1, (1.0, 0.0)),
            (2, (0.0, -1.0)),
            (3, (0.0, -1.0)),
        ]
    );
}

#[test]
fn unknown_interlace_mode_keeps_merge_current() {
    let mut dev = device();
    merged(&mut dev, 64, 32);
    dev.backend_mut().take_calls();

    dev.interlace((64, 32), 0, 9, 0.0).unwrap();
    assert_eq!(dev.display_chain().current(), Some(ChainTarget::Merge));
    assert_eq!(draws(&dev), 0);
}

#[test]
fn interlace_without_merge_output_is_a_no_op() {
    let mut dev = device();
    dev.interlace((64, 32), 0, 0, 0.0).unwrap();
    assert_eq!(dev.display_chain().current(), None);
    assert_eq!(draws(&dev), 0);
}

#[test]
fn shade_boost_uploads_scaled_parameters() {
    let mut dev = device_on(
        RecordingBackend::new(),
        GsDeviceConfig {
            shade_boost_brightness: 75,
            shade_boost_contrast: 50,
            shade_boost_saturation: 25,
            ..GsDeviceConfig::default()
        },
    );
    merged(&mut dev, 64, 32);
    dev.backend_mut().take_calls();

    dev.shade_boost().unwrap();
    assert_eq!(dev.display_chain().current(), Some(ChainTarget::Temp));

    let calls = dev.backend().calls();
    let draw = calls
        .iter()
        .position(|c| matches!(c, NativeCall::Draw { .. }))
        .unwrap();
    let cb = calls[..draw]
        .iter()
        .rev()
        .find_map(|c| match c {
            NativeCall::UpdateBuffer { buffer, len: 16, .. } => Some(*buffer),
            _ => None,
        })
        .unwrap();
    let params: &[f32] = bytemuck::cast_slice(&dev.backend().buffer_contents(cb).unwrap()[..16]);
    assert_eq!(params, [1.5, 1.0, 0.5, 0.0]);
}

#[test]
fn filters_ping_pong_between_targets() {
    let mut dev = device();
    merged(&mut dev, 64, 32);
    dev.shade_boost().unwrap();
    assert_eq!(dev.display_chain().current(), Some(ChainTarget::Temp));
    dev.shade_boost().unwrap();
    assert_eq!(dev.display_chain().current(), Some(ChainTarget::Merge));
}

#[test]
fn fxaa_without_shader_leaves_output_untouched() {
    let mut sources = MemoryShaderSource::with_placeholders();
    sources.remove(ps2gs_hw::shader::FXAA_SHADER_SOURCE);
    let mut dev = GsDevice::create(RecordingBackend::new(), GsDeviceConfig::default(), Box::new(sources)).unwrap();
    merged(&mut dev, 64, 32);
    dev.backend_mut().take_calls();

    dev.fxaa().unwrap();
    assert_eq!(draws(&dev), 0);
}

#[test]
fn cas_sharpens_into_storage_target() {
    let mut dev = device();
    let mut tex = dev.create_render_target(33, 16, TextureFormat::Color, false).unwrap();
    let original = tex;
    dev.backend_mut().take_calls();

    let mut src_rect = IntRect::from_size(33, 16);
    let mut src_uv = RectF::new(0.0, 0.0, 0.5, 0.5);
    dev.cas(&mut tex, &mut src_rect, &mut src_uv, RectF::from_size(66, 32), true);

    assert!(dev
        .backend()
        .calls()
        .contains(&NativeCall::Dispatch { x: 3, y: 1, z: 1 }));
    assert_ne!(tex.id(), original.id());
    assert_eq!(tex.size(), (33, 16));
    assert_eq!(src_rect, IntRect::from_size(33, 16));
    assert_eq!(src_uv, RectF::UNIT);
    assert_eq!(dev.stats().snapshot().dispatches, 1);
}

#[test]
fn cas_upscales_to_draw_rect() {
    let mut dev = device();
    let mut tex = dev.create_render_target(32, 16, TextureFormat::Color, false).unwrap();
    let mut src_rect = IntRect::from_size(32, 16);
    let mut src_uv = RectF::UNIT;
    dev.cas(&mut tex, &mut src_rect, &mut src_uv, RectF::from_size(64, 32), false);
    assert_eq!(tex.size(), (64, 32));
    assert!(dev
        .backend()
        .calls()
        .contains(&NativeCall::Dispatch { x: 4, y: 2, z: 1 }));
}

#[test]
fn cas_is_skipped_without_compute() {
    let mut dev = device_on(
        RecordingBackend::new().with_feature_level(FeatureLevel::Level10_0),
        GsDeviceConfig::default(),
    );
    let mut tex = dev.create_render_target(33, 16, TextureFormat::Color, false).unwrap();
    let original = tex;
    let mut src_rect = IntRect::new(1, 1, 33, 16);
    let mut src_uv = RectF::new(0.0, 0.0, 0.5, 0.5);

    dev.cas(&mut tex, &mut src_rect, &mut src_uv, RectF::from_size(66, 32), true);

    assert_eq!(tex, original);
    assert_eq!(src_rect, IntRect::new(1, 1, 33, 16));
    assert_eq!(src_uv, RectF::new(0.0, 0.0, 0.5, 0.5));
    assert_eq!(count(&dev, |c| matches!(c, NativeCall::Dispatch { .. })), 0);
}

#[test]
fn present_clears_and_binds_the_surface() {
    let mut dev = device_on(RecordingBackend::new().with_surface(640, 480), GsDeviceConfig::default());
    dev.backend_mut().take_calls();

    assert_eq!(dev.present_frame(false).unwrap(), PresentResult::Ok);
    let surface = dev
        .backend()
        .calls()
        .iter()
        .find_map(|c| match c {
            NativeCall::ClearRenderTarget { texture, color } if *color == PRESENT_CLEAR_COLOR => Some(*texture),
            _ => None,
        })
        .unwrap();
    assert!(dev.backend().calls().contains(&NativeCall::SetRenderTargets {
        rt: Some(surface),
        ds: None
    }));

    dev.end_frame();
    assert_eq!(count(&dev, |c| matches!(c, NativeCall::Present { .. })), 1);
    assert_eq!(dev.stats().snapshot().presents, 1);
    assert!(dev.drain_events().is_empty());
}

#[test]
fn skipped_and_headless_frames_bind_nothing() {
    let mut dev = device_on(RecordingBackend::new().with_surface(640, 480), GsDeviceConfig::default());
    assert_eq!(dev.present_frame(true).unwrap(), PresentResult::FrameSkipped);

    let mut headless = device();
    assert_eq!(headless.present_frame(false).unwrap(), PresentResult::FrameSkipped);
}

#[test]
fn failed_present_reports_device_loss() {
    let mut dev = device_on(RecordingBackend::new().with_surface(640, 480), GsDeviceConfig::default());
    dev.present_frame(false).unwrap();
    dev.backend_mut().fail_next_present();
    dev.end_frame();

    let events = dev.drain_events();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], GsEvent::DeviceLost(_)));
    assert_eq!(dev.stats().snapshot().presents, 0);
}

#[test]
fn lost_fullscreen_skips_the_frame() {
    let mut dev = device_on(RecordingBackend::new().with_surface(640, 480), GsDeviceConfig::default());
    dev.backend_mut().lose_exclusive_fullscreen();

    assert_eq!(dev.present_frame(false).unwrap(), PresentResult::FrameSkipped);
    assert_eq!(dev.drain_events(), vec![GsEvent::ExclusiveFullscreenLost]);
}
