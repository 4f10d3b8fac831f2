//! Bound pipeline state with redundant-change suppression.
//!
//! Every setter compares against the last value handed to the backend and
//! only forwards on change. Pixel-stage shader resources and samplers are
//! staged and committed right before a draw so that a texture can never be
//! sampled while it is also bound as the render target or depth-stencil.

use std::sync::Arc;

use tracing::debug;

use crate::hal::{
    BlendStateId, BufferId, DepthStencilStateId, GsBackend, InputLayoutId, IntRect,
    PrimitiveTopology, SamplerId, ShaderId, TextureId,
};
use crate::stats::GsStats;
use crate::texture::Texture;

/// Pixel-stage texture slots: texture, palette, render-target copy, primitive IDs.
pub const MAX_PS_RESOURCES: usize = 4;
pub const MAX_PS_SAMPLERS: usize = 1;

/// Last value applied to one pipeline slot.
///
/// Starts out unknown, so the first update always goes through.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Tracked<T> {
    value: Option<T>,
}

impl<T> Default for Tracked<T> {
    fn default() -> Self {
        Self { value: None }
    }
}

impl<T: PartialEq + Copy> Tracked<T> {
    pub const fn unknown() -> Self {
        Self { value: None }
    }

    /// Records `value`; returns whether it differs from the last one.
    pub fn update(&mut self, value: T) -> bool {
        if self.value == Some(value) {
            return false;
        }
        self.value = Some(value);
        true
    }

    pub fn get(&self) -> Option<T> {
        self.value
    }

    /// Forgets the last value so the next update is forwarded.
    pub fn invalidate(&mut self) {
        self.value = None;
    }
}

#[derive(Debug)]
pub struct StateCache {
    vs: Tracked<Option<ShaderId>>,
    vs_cb: Tracked<Option<BufferId>>,
    vs_structured: Tracked<Option<BufferId>>,
    ps: Tracked<Option<ShaderId>>,
    ps_cb: Tracked<Option<BufferId>>,
    /// Blend factor is tracked by its bit pattern.
    blend: Tracked<(BlendStateId, u32)>,
    depth_stencil: Tracked<(DepthStencilStateId, u8)>,
    targets: Tracked<(Option<TextureId>, Option<TextureId>)>,
    layout: Tracked<Option<InputLayoutId>>,
    topology: Tracked<PrimitiveTopology>,
    vertex_buffer: Tracked<(BufferId, u32)>,
    index_buffer: Tracked<Option<BufferId>>,
    viewport: Tracked<(u32, u32)>,
    scissor: Tracked<IntRect>,
    staged_srvs: [Option<TextureId>; MAX_PS_RESOURCES],
    committed_srvs: [Tracked<Option<TextureId>>; MAX_PS_RESOURCES],
    staged_samplers: [Option<SamplerId>; MAX_PS_SAMPLERS],
    committed_samplers: [Tracked<Option<SamplerId>>; MAX_PS_SAMPLERS],
    stats: Arc<GsStats>,
}

impl StateCache {
    pub fn new(stats: Arc<GsStats>) -> Self {
        Self {
            vs: Tracked::unknown(),
            vs_cb: Tracked::unknown(),
            vs_structured: Tracked::unknown(),
            ps: Tracked::unknown(),
            ps_cb: Tracked::unknown(),
            blend: Tracked::unknown(),
            depth_stencil: Tracked::unknown(),
            targets: Tracked::unknown(),
            layout: Tracked::unknown(),
            topology: Tracked::unknown(),
            vertex_buffer: Tracked::unknown(),
            index_buffer: Tracked::unknown(),
            viewport: Tracked::unknown(),
            scissor: Tracked::unknown(),
            staged_srvs: [None; MAX_PS_RESOURCES],
            committed_srvs: [Tracked::unknown(); MAX_PS_RESOURCES],
            staged_samplers: [None; MAX_PS_SAMPLERS],
            committed_samplers: [Tracked::unknown(); MAX_PS_SAMPLERS],
            stats,
        }
    }

    pub fn set_vertex_shader<B: GsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        vs: Option<ShaderId>,
        cb: Option<BufferId>,
    ) {
        if self.vs.update(vs) {
            backend.set_vertex_shader(vs);
        }
        if self.vs_cb.update(cb) {
            backend.set_vs_constant_buffer(cb);
        }
    }

    pub fn set_vs_structured_buffer<B: GsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        buffer: Option<BufferId>,
    ) {
        if self.vs_structured.update(buffer) {
            backend.set_vs_structured_buffer(buffer);
        }
    }

    pub fn set_pixel_shader<B: GsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        ps: Option<ShaderId>,
        cb: Option<BufferId>,
    ) {
        if self.ps.update(ps) {
            backend.set_pixel_shader(ps);
        }
        if self.ps_cb.update(cb) {
            backend.set_ps_constant_buffer(cb);
        }
    }

    pub fn set_blend_state<B: GsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        state: BlendStateId,
        factor: f32,
    ) {
        if self.blend.update((state, factor.to_bits())) {
            backend.set_blend_state(state, factor);
        }
    }

    pub fn set_depth_stencil_state<B: GsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        state: DepthStencilStateId,
        stencil_ref: u8,
    ) {
        if self.depth_stencil.update((state, stencil_ref)) {
            backend.set_depth_stencil_state(state, stencil_ref);
        }
    }

    /// Binds `rt`/`ds`, then points the viewport at the target and the
    /// scissor at `scissor` (or the whole target).
    pub fn set_render_targets<B: GsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        rt: Option<&Texture>,
        ds: Option<&Texture>,
        scissor: Option<IntRect>,
    ) {
        let rt_id = rt.map(Texture::id);
        let ds_id = ds.map(Texture::id);

        if self.targets.update((rt_id, ds_id)) {
            self.stats.inc_render_passes();
            for slot in 0..MAX_PS_RESOURCES {
                let Some(Some(bound)) = self.committed_srvs[slot].get() else {
                    continue;
                };
                if Some(bound) == rt_id || Some(bound) == ds_id {
                    debug!(slot, texture = %bound, "unbinding shader resource that is about to become a target");
                    self.committed_srvs[slot].update(None);
                    backend.set_ps_shader_resource(slot, None);
                }
            }
            backend.set_render_targets(rt_id, ds_id);
        }

        if let Some(target) = rt.or(ds) {
            let (width, height) = target.size();
            self.set_viewport(backend, width, height);
            self.set_scissor(backend, scissor.unwrap_or(IntRect::from_size(width, height)));
        }
    }

    pub fn render_targets(&self) -> (Option<TextureId>, Option<TextureId>) {
        self.targets.get().unwrap_or((None, None))
    }

    pub fn set_input_layout<B: GsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        layout: Option<InputLayoutId>,
    ) {
        if self.layout.update(layout) {
            backend.set_input_layout(layout);
        }
    }

    pub fn set_primitive_topology<B: GsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        topology: PrimitiveTopology,
    ) {
        if self.topology.update(topology) {
            backend.set_primitive_topology(topology);
        }
    }

    pub fn set_vertex_buffer<B: GsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        buffer: BufferId,
        stride: u32,
    ) {
        if self.vertex_buffer.update((buffer, stride)) {
            backend.set_vertex_buffer(buffer, stride);
        }
    }

    pub fn set_index_buffer<B: GsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        buffer: Option<BufferId>,
    ) {
        if self.index_buffer.update(buffer) {
            backend.set_index_buffer(buffer);
        }
    }

    pub fn set_viewport<B: GsBackend + ?Sized>(&mut self, backend: &mut B, width: u32, height: u32) {
        if self.viewport.update((width, height)) {
            backend.set_viewport(width, height);
        }
    }

    pub fn set_scissor<B: GsBackend + ?Sized>(&mut self, backend: &mut B, rect: IntRect) {
        if self.scissor.update(rect) {
            backend.set_scissor(rect);
        }
    }

    /// Stages texture and palette, clearing the render-target copy slot.
    pub fn stage_ps_resources(&mut self, texture: Option<TextureId>, palette: Option<TextureId>) {
        self.staged_srvs[0] = texture;
        self.staged_srvs[1] = palette;
        self.staged_srvs[2] = None;
    }

    pub fn stage_ps_resource(&mut self, slot: usize, texture: Option<TextureId>) {
        assert!(slot < MAX_PS_RESOURCES, "pixel shader resource slot {slot} out of range");
        self.staged_srvs[slot] = texture;
    }

    pub fn stage_ps_sampler(&mut self, sampler: Option<SamplerId>) {
        self.staged_samplers[0] = sampler;
    }

    pub fn staged_ps_resource(&self, slot: usize) -> Option<TextureId> {
        self.staged_srvs.get(slot).copied().flatten()
    }

    /// Forwards staged resources and samplers that changed since the last commit.
    pub fn commit_ps_resources<B: GsBackend + ?Sized>(&mut self, backend: &mut B) {
        let (rt, ds) = self.render_targets();
        for slot in 0..MAX_PS_RESOURCES {
            let mut texture = self.staged_srvs[slot];
            if let Some(id) = texture {
                if Some(id) == rt || Some(id) == ds {
                    debug!(slot, texture = %id, "shader resource aliases a bound target, leaving slot empty");
                    texture = None;
                }
            }
            if self.committed_srvs[slot].update(texture) {
                backend.set_ps_shader_resource(slot, texture);
            }
        }
        for slot in 0..MAX_PS_SAMPLERS {
            let sampler = self.staged_samplers[slot];
            if self.committed_samplers[slot].update(sampler) {
                backend.set_ps_sampler(slot, sampler);
            }
        }
    }

    /// Drops every reference to `texture`, staged or committed.
    pub fn forget_texture<B: GsBackend + ?Sized>(&mut self, backend: &mut B, texture: TextureId) {
        for slot in 0..MAX_PS_RESOURCES {
            if self.staged_srvs[slot] == Some(texture) {
                self.staged_srvs[slot] = None;
            }
            if self.committed_srvs[slot].get() == Some(Some(texture)) {
                self.committed_srvs[slot].update(None);
                backend.set_ps_shader_resource(slot, None);
            }
        }
        let (rt, ds) = self.render_targets();
        if rt == Some(texture) || ds == Some(texture) {
            let rt = rt.filter(|id| *id != texture);
            let ds = ds.filter(|id| *id != texture);
            self.targets.update((rt, ds));
            backend.set_render_targets(rt, ds);
        }
    }

    /// Forgets every slot, forcing the next binds through.
    pub fn invalidate_all(&mut self) {
        let stats = Arc::clone(&self.stats);
        *self = Self::new(stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::{NativeCall, RecordingBackend};
    use crate::hal::TextureDesc;
    use crate::texture::{TextureFormat, TextureType};

    fn target(backend: &mut RecordingBackend, w: u32, h: u32) -> Texture {
        let desc = TextureDesc {
            width: w,
            height: h,
            levels: 1,
            format: TextureFormat::Color,
            ty: TextureType::RenderTarget,
        };
        let id = backend.create_texture(&desc).unwrap();
        Texture::new(id, desc)
    }

    #[test]
    fn tracked_counts_distinct_consecutive_values() {
        let mut tracked = Tracked::unknown();
        let applied = [1, 1, 2, 2, 2, 1, 3, 3]
            .into_iter()
            .filter(|v| tracked.update(*v))
            .count();
        assert_eq!(applied, 4);
    }

    #[test]
    fn repeated_setters_issue_one_native_call() {
        let stats = Arc::new(GsStats::new());
        let mut cache = StateCache::new(Arc::clone(&stats));
        let mut backend = RecordingBackend::new();

        for _ in 0..3 {
            cache.set_primitive_topology(&mut backend, PrimitiveTopology::TriangleStrip);
            cache.set_viewport(&mut backend, 640, 448);
        }
        cache.set_primitive_topology(&mut backend, PrimitiveTopology::TriangleList);

        let calls = backend.take_calls();
        assert_eq!(
            calls,
            vec![
                NativeCall::SetPrimitiveTopology(PrimitiveTopology::TriangleStrip),
                NativeCall::SetViewport { width: 640, height: 448 },
                NativeCall::SetPrimitiveTopology(PrimitiveTopology::TriangleList),
            ]
        );
    }

    #[test]
    fn target_changes_count_render_passes_and_reset_scissor() {
        let stats = Arc::new(GsStats::new());
        let mut cache = StateCache::new(Arc::clone(&stats));
        let mut backend = RecordingBackend::new();
        let a = target(&mut backend, 64, 32);
        let b = target(&mut backend, 64, 32);
        backend.take_calls();

        cache.set_render_targets(&mut backend, Some(&a), None, Some(IntRect::new(0, 0, 8, 8)));
        cache.set_render_targets(&mut backend, Some(&a), None, None);
        cache.set_render_targets(&mut backend, Some(&b), None, None);

        assert_eq!(stats.snapshot().render_passes, 2);
        let scissors: Vec<_> = backend
            .take_calls()
            .into_iter()
            .filter_map(|call| match call {
                NativeCall::SetScissor(rect) => Some(rect),
                _ => None,
            })
            .collect();
        assert_eq!(scissors, vec![IntRect::new(0, 0, 8, 8), IntRect::new(0, 0, 64, 32)]);
    }

    #[test]
    fn staged_resource_aliasing_the_target_is_not_bound() {
        let mut cache = StateCache::new(Arc::new(GsStats::new()));
        let mut backend = RecordingBackend::new();
        let rt = target(&mut backend, 16, 16);
        backend.take_calls();

        cache.set_render_targets(&mut backend, Some(&rt), None, None);
        cache.stage_ps_resources(Some(rt.id()), None);
        cache.commit_ps_resources(&mut backend);

        assert!(!backend.take_calls().iter().any(|call| matches!(
            call,
            NativeCall::SetPsShaderResource { texture: Some(_), .. }
        )));
    }

    #[test]
    fn binding_a_sampled_texture_as_target_unbinds_it_first() {
        let mut cache = StateCache::new(Arc::new(GsStats::new()));
        let mut backend = RecordingBackend::new();
        let a = target(&mut backend, 16, 16);
        let b = target(&mut backend, 16, 16);

        cache.set_render_targets(&mut backend, Some(&a), None, None);
        cache.stage_ps_resources(Some(b.id()), None);
        cache.commit_ps_resources(&mut backend);
        backend.take_calls();

        cache.set_render_targets(&mut backend, Some(&b), None, None);
        let calls = backend.take_calls();
        assert_eq!(
            calls[..2],
            [
                NativeCall::SetPsShaderResource { slot: 0, texture: None },
                NativeCall::SetRenderTargets { rt: Some(b.id()), ds: None },
            ]
        );
    }

    #[test]
    fn blend_factor_is_part_of_the_key() {
        let mut cache = StateCache::new(Arc::new(GsStats::new()));
        let mut backend = RecordingBackend::new();
        let state = BlendStateId(5);
        cache.set_blend_state(&mut backend, state, 0.0);
        cache.set_blend_state(&mut backend, state, 0.0);
        cache.set_blend_state(&mut backend, state, 0.5);
        assert_eq!(backend.take_calls().len(), 2);
    }
}
