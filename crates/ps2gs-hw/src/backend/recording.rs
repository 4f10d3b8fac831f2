//! Backend that records every native call instead of executing it.
//!
//! Used by the test suites to assert on the exact call sequence a draw
//! produces, and by tooling that wants a textual trace of a frame.

use std::collections::VecDeque;
use std::fmt::Write as _;

use crate::error::GsError;
use crate::hal::{
    BlendDesc, BlendStateId, BufferDesc, BufferId, DepthStencilDesc, DepthStencilStateId, GsBackend,
    GsFeatures, InputElement, InputLayoutId, IntRect, MapMode, PrimitiveTopology, ResourceRegistry,
    SamplerDesc, SamplerId, ShaderId, TextureDesc, TextureId, TimestampReadback,
};
use crate::shader::{FeatureLevel, ShaderMacros, ShaderStage};
use crate::texture::{TextureFormat, TextureType};

/// One call made against the backend, in issue order.
#[derive(Clone, Debug, PartialEq)]
pub enum NativeCall {
    CreateTexture { id: TextureId, desc: TextureDesc },
    DestroyTexture(TextureId),
    WriteTexture { texture: TextureId, rect: IntRect, len: usize },
    CreateBuffer { id: BufferId, desc: BufferDesc },
    DestroyBuffer(BufferId),
    WriteBuffer { buffer: BufferId, offset: u32, len: u32, mode: MapMode },
    UpdateBuffer { buffer: BufferId, offset: u32, len: u32 },
    CompileShader { id: ShaderId, stage: ShaderStage, entry_point: String },
    DestroyShader(ShaderId),
    CreateInputLayout(InputLayoutId),
    CreateBlendState { id: BlendStateId, desc: BlendDesc },
    CreateDepthStencilState { id: DepthStencilStateId, desc: DepthStencilDesc },
    CreateSampler { id: SamplerId, desc: SamplerDesc },
    DestroyInputLayout(InputLayoutId),
    DestroyBlendState(BlendStateId),
    DestroyDepthStencilState(DepthStencilStateId),
    DestroySampler(SamplerId),
    SetVertexShader(Option<ShaderId>),
    SetVsConstantBuffer(Option<BufferId>),
    SetVsStructuredBuffer(Option<BufferId>),
    SetPixelShader(Option<ShaderId>),
    SetPsConstantBuffer(Option<BufferId>),
    SetPsShaderResource { slot: usize, texture: Option<TextureId> },
    SetPsSampler { slot: usize, sampler: Option<SamplerId> },
    SetBlendState { state: BlendStateId, factor: f32 },
    SetDepthStencilState { state: DepthStencilStateId, stencil_ref: u8 },
    SetRenderTargets { rt: Option<TextureId>, ds: Option<TextureId> },
    SetInputLayout(Option<InputLayoutId>),
    SetPrimitiveTopology(PrimitiveTopology),
    SetVertexBuffer { buffer: BufferId, stride: u32 },
    SetIndexBuffer(Option<BufferId>),
    SetViewport { width: u32, height: u32 },
    SetScissor(IntRect),
    Draw { vertex_count: u32, first_vertex: u32 },
    DrawIndexed { index_count: u32, first_index: u32, base_vertex: u32 },
    ClearRenderTarget { texture: TextureId, color: [f32; 4] },
    ClearDepth { texture: TextureId, depth: f32 },
    ClearStencil { texture: TextureId, value: u8 },
    Invalidate(TextureId),
    CopyTextureRegion {
        src: TextureId,
        dst: TextureId,
        rect: Option<IntRect>,
        dst_x: u32,
        dst_y: u32,
    },
    SetComputeShader(Option<ShaderId>),
    SetCsConstantBuffer(Option<BufferId>),
    SetCsResources { src: Option<TextureId>, dst: Option<TextureId> },
    Dispatch { x: u32, y: u32, z: u32 },
    CreateTimestampQueries(usize),
    DestroyTimestampQueries,
    BeginTimestampQuery(usize),
    EndTimestampQuery(usize),
    PushDebugGroup(String),
    PopDebugGroup,
    InsertDebugMarker(String),
    ResizeSurface { width: u32, height: u32 },
    Present { vsync: bool },
    Flush,
}

impl NativeCall {
    /// Draws and dispatches.
    pub fn is_work(&self) -> bool {
        matches!(
            self,
            NativeCall::Draw { .. } | NativeCall::DrawIndexed { .. } | NativeCall::Dispatch { .. }
        )
    }
}

#[derive(Debug)]
struct RecordedBuffer {
    desc: BufferDesc,
    contents: Vec<u8>,
}

#[derive(Debug)]
struct RecordedShader {
    stage: ShaderStage,
    entry_point: String,
    macros: ShaderMacros,
}

pub struct RecordingBackend {
    calls: Vec<NativeCall>,
    features: GsFeatures,
    level: FeatureLevel,
    textures: ResourceRegistry<TextureId, TextureDesc>,
    buffers: ResourceRegistry<BufferId, RecordedBuffer>,
    shaders: ResourceRegistry<ShaderId, RecordedShader>,
    layouts: ResourceRegistry<InputLayoutId, (Vec<InputElement>, u32)>,
    blend_states: ResourceRegistry<BlendStateId, BlendDesc>,
    depth_states: ResourceRegistry<DepthStencilStateId, DepthStencilDesc>,
    samplers: ResourceRegistry<SamplerId, SamplerDesc>,
    surface: Option<(u32, u32)>,
    surface_texture: Option<TextureId>,
    /// Texture creations left before they start failing.
    texture_budget: Option<usize>,
    failing_entry_points: Vec<String>,
    fullscreen_lost: bool,
    fail_next_present: bool,
    timestamp_queries: Option<usize>,
    timestamp_results: VecDeque<TimestampReadback>,
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingBackend {
    /// Headless backend with every optional capability except timestamps.
    pub fn new() -> Self {
        Self {
            calls: Vec::new(),
            features: GsFeatures::default(),
            level: FeatureLevel::Level11_0,
            textures: ResourceRegistry::new(),
            buffers: ResourceRegistry::new(),
            shaders: ResourceRegistry::new(),
            layouts: ResourceRegistry::new(),
            blend_states: ResourceRegistry::new(),
            depth_states: ResourceRegistry::new(),
            samplers: ResourceRegistry::new(),
            surface: None,
            surface_texture: None,
            texture_budget: None,
            failing_entry_points: Vec::new(),
            fullscreen_lost: false,
            fail_next_present: false,
            timestamp_queries: None,
            timestamp_results: VecDeque::new(),
        }
    }

    pub fn with_features(mut self, features: GsFeatures) -> Self {
        self.features = features;
        self
    }

    pub fn with_feature_level(mut self, level: FeatureLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_surface(mut self, width: u32, height: u32) -> Self {
        self.surface = Some((width, height));
        self
    }

    pub fn calls(&self) -> &[NativeCall] {
        &self.calls
    }

    pub fn take_calls(&mut self) -> Vec<NativeCall> {
        std::mem::take(&mut self.calls)
    }

    pub fn count_calls(&self, pred: impl Fn(&NativeCall) -> bool) -> usize {
        self.calls.iter().filter(|c| pred(c)).count()
    }

    /// One call per line.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (i, call) in self.calls.iter().enumerate() {
            let _ = writeln!(out, "{i:5} {call:?}");
        }
        out
    }

    pub fn texture_desc(&self, id: TextureId) -> Option<TextureDesc> {
        self.textures.get(id).ok().copied()
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_shaders(&self) -> usize {
        self.shaders.len()
    }

    pub fn blend_desc(&self, id: BlendStateId) -> Option<BlendDesc> {
        self.blend_states.get(id).ok().copied()
    }

    pub fn depth_stencil_desc(&self, id: DepthStencilStateId) -> Option<DepthStencilDesc> {
        self.depth_states.get(id).ok().copied()
    }

    pub fn sampler_desc(&self, id: SamplerId) -> Option<SamplerDesc> {
        self.samplers.get(id).ok().copied()
    }

    pub fn shader_entry(&self, id: ShaderId) -> Option<&str> {
        self.shaders.get(id).ok().map(|s| s.entry_point.as_str())
    }

    pub fn shader_stage(&self, id: ShaderId) -> Option<ShaderStage> {
        self.shaders.get(id).ok().map(|s| s.stage)
    }

    pub fn shader_macros(&self, id: ShaderId) -> Option<&ShaderMacros> {
        self.shaders.get(id).ok().map(|s| &s.macros)
    }

    pub fn buffer_desc(&self, id: BufferId) -> Option<BufferDesc> {
        self.buffers.get(id).ok().map(|b| b.desc)
    }

    pub fn buffer_contents(&self, id: BufferId) -> Option<&[u8]> {
        self.buffers.get(id).ok().map(|b| b.contents.as_slice())
    }

    /// Lets `remaining` more texture creations succeed, then fails the rest.
    pub fn fail_textures_after(&mut self, remaining: usize) {
        self.texture_budget = Some(remaining);
    }

    pub fn fail_shader(&mut self, entry_point: &str) {
        self.failing_entry_points.push(entry_point.to_owned());
    }

    /// The next fullscreen probe reports the loss once.
    pub fn lose_exclusive_fullscreen(&mut self) {
        self.fullscreen_lost = true;
    }

    pub fn fail_next_present(&mut self) {
        self.fail_next_present = true;
    }

    /// Queues the result of the next ready timestamp read.
    pub fn push_timestamp_readback(&mut self, readback: TimestampReadback) {
        self.timestamp_results.push_back(readback);
    }

    pub fn timestamp_queries(&self) -> Option<usize> {
        self.timestamp_queries
    }

    fn record(&mut self, call: NativeCall) {
        self.calls.push(call);
    }
}

impl GsBackend for RecordingBackend {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn features(&self) -> GsFeatures {
        self.features
    }

    fn feature_level(&self) -> FeatureLevel {
        self.level
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, GsError> {
        if let Some(budget) = self.texture_budget.as_mut() {
            if *budget == 0 {
                return Err(GsError::resource("texture", "recording backend texture budget exhausted"));
            }
            *budget -= 1;
        }
        let id = self.textures.insert(*desc);
        self.record(NativeCall::CreateTexture { id, desc: *desc });
        Ok(id)
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        self.textures.remove(texture);
        self.record(NativeCall::DestroyTexture(texture));
    }

    fn write_texture(&mut self, texture: TextureId, rect: IntRect, data: &[u8], pitch: u32) -> Result<(), GsError> {
        let desc = *self.textures.get(texture)?;
        let needed = u64::from(pitch) * rect.height().max(0) as u64;
        if rect.right as u32 > desc.width || rect.bottom as u32 > desc.height || (data.len() as u64) < needed {
            return Err(GsError::Backend(format!("texture write {rect:?} out of bounds for {texture}")));
        }
        self.record(NativeCall::WriteTexture {
            texture,
            rect,
            len: data.len(),
        });
        Ok(())
    }

    fn create_buffer(&mut self, desc: &BufferDesc, contents: Option<&[u8]>) -> Result<BufferId, GsError> {
        let mut data = vec![0u8; desc.size as usize];
        if let Some(contents) = contents {
            let len = contents.len().min(data.len());
            data[..len].copy_from_slice(&contents[..len]);
        }
        let id = self.buffers.insert(RecordedBuffer {
            desc: *desc,
            contents: data,
        });
        self.record(NativeCall::CreateBuffer { id, desc: *desc });
        Ok(id)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(buffer);
        self.record(NativeCall::DestroyBuffer(buffer));
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u32, data: &[u8], mode: MapMode) -> Result<(), GsError> {
        let stored = self.buffers.get_mut(buffer)?;
        let start = offset as usize;
        let end = start + data.len();
        if end > stored.contents.len() {
            return Err(GsError::Backend(format!(
                "write of {} bytes at {offset} overruns {} ({} bytes)",
                data.len(),
                stored.desc.label,
                stored.desc.size
            )));
        }
        stored.contents[start..end].copy_from_slice(data);
        self.record(NativeCall::WriteBuffer {
            buffer,
            offset,
            len: data.len() as u32,
            mode,
        });
        Ok(())
    }

    fn update_buffer(&mut self, buffer: BufferId, offset: u32, data: &[u8]) {
        if let Ok(stored) = self.buffers.get_mut(buffer) {
            let start = offset as usize;
            let end = (start + data.len()).min(stored.contents.len());
            if start < end {
                stored.contents[start..end].copy_from_slice(&data[..end - start]);
            }
        }
        self.record(NativeCall::UpdateBuffer {
            buffer,
            offset,
            len: data.len() as u32,
        });
    }

    fn compile_shader(
        &mut self,
        stage: ShaderStage,
        _source: &str,
        macros: &ShaderMacros,
        entry_point: &str,
    ) -> Result<ShaderId, GsError> {
        if self.failing_entry_points.iter().any(|e| e == entry_point) {
            return Err(GsError::ShaderCompile {
                entry_point: entry_point.to_owned(),
                message: "rejected by recording backend".into(),
            });
        }
        let id = self.shaders.insert(RecordedShader {
            stage,
            entry_point: entry_point.to_owned(),
            macros: macros.clone(),
        });
        self.record(NativeCall::CompileShader {
            id,
            stage,
            entry_point: entry_point.to_owned(),
        });
        Ok(id)
    }

    fn destroy_shader(&mut self, shader: ShaderId) {
        self.shaders.remove(shader);
        self.record(NativeCall::DestroyShader(shader));
    }

    fn create_input_layout(&mut self, elements: &[InputElement], stride: u32) -> Result<InputLayoutId, GsError> {
        let id = self.layouts.insert((elements.to_vec(), stride));
        self.record(NativeCall::CreateInputLayout(id));
        Ok(id)
    }

    fn create_blend_state(&mut self, desc: &BlendDesc) -> Result<BlendStateId, GsError> {
        let id = self.blend_states.insert(*desc);
        self.record(NativeCall::CreateBlendState { id, desc: *desc });
        Ok(id)
    }

    fn create_depth_stencil_state(&mut self, desc: &DepthStencilDesc) -> Result<DepthStencilStateId, GsError> {
        let id = self.depth_states.insert(*desc);
        self.record(NativeCall::CreateDepthStencilState { id, desc: *desc });
        Ok(id)
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerId, GsError> {
        let id = self.samplers.insert(*desc);
        self.record(NativeCall::CreateSampler { id, desc: *desc });
        Ok(id)
    }

    fn destroy_input_layout(&mut self, layout: InputLayoutId) {
        self.layouts.remove(layout);
        self.record(NativeCall::DestroyInputLayout(layout));
    }

    fn destroy_blend_state(&mut self, state: BlendStateId) {
        self.blend_states.remove(state);
        self.record(NativeCall::DestroyBlendState(state));
    }

    fn destroy_depth_stencil_state(&mut self, state: DepthStencilStateId) {
        self.depth_states.remove(state);
        self.record(NativeCall::DestroyDepthStencilState(state));
    }

    fn destroy_sampler(&mut self, sampler: SamplerId) {
        self.samplers.remove(sampler);
        self.record(NativeCall::DestroySampler(sampler));
    }

    fn set_vertex_shader(&mut self, shader: Option<ShaderId>) {
        self.record(NativeCall::SetVertexShader(shader));
    }

    fn set_vs_constant_buffer(&mut self, buffer: Option<BufferId>) {
        self.record(NativeCall::SetVsConstantBuffer(buffer));
    }

    fn set_vs_structured_buffer(&mut self, buffer: Option<BufferId>) {
        self.record(NativeCall::SetVsStructuredBuffer(buffer));
    }

    fn set_pixel_shader(&mut self, shader: Option<ShaderId>) {
        self.record(NativeCall::SetPixelShader(shader));
    }

    fn set_ps_constant_buffer(&mut self, buffer: Option<BufferId>) {
        self.record(NativeCall::SetPsConstantBuffer(buffer));
    }

    fn set_ps_shader_resource(&mut self, slot: usize, texture: Option<TextureId>) {
        self.record(NativeCall::SetPsShaderResource { slot, texture });
    }

    fn set_ps_sampler(&mut self, slot: usize, sampler: Option<SamplerId>) {
        self.record(NativeCall::SetPsSampler { slot, sampler });
    }

    fn set_blend_state(&mut self, state: BlendStateId, factor: f32) {
        self.record(NativeCall::SetBlendState { state, factor });
    }

    fn set_depth_stencil_state(&mut self, state: DepthStencilStateId, stencil_ref: u8) {
        self.record(NativeCall::SetDepthStencilState { state, stencil_ref });
    }

    fn set_render_targets(&mut self, rt: Option<TextureId>, ds: Option<TextureId>) {
        self.record(NativeCall::SetRenderTargets { rt, ds });
    }

    fn set_input_layout(&mut self, layout: Option<InputLayoutId>) {
        self.record(NativeCall::SetInputLayout(layout));
    }

    fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        self.record(NativeCall::SetPrimitiveTopology(topology));
    }

    fn set_vertex_buffer(&mut self, buffer: BufferId, stride: u32) {
        self.record(NativeCall::SetVertexBuffer { buffer, stride });
    }

    fn set_index_buffer(&mut self, buffer: Option<BufferId>) {
        self.record(NativeCall::SetIndexBuffer(buffer));
    }

    fn set_viewport(&mut self, width: u32, height: u32) {
        self.record(NativeCall::SetViewport { width, height });
    }

    fn set_scissor(&mut self, rect: IntRect) {
        self.record(NativeCall::SetScissor(rect));
    }

    fn draw(&mut self, vertex_count: u32, first_vertex: u32) {
        self.record(NativeCall::Draw {
            vertex_count,
            first_vertex,
        });
    }

    fn draw_indexed(&mut self, index_count: u32, first_index: u32, base_vertex: u32) {
        self.record(NativeCall::DrawIndexed {
            index_count,
            first_index,
            base_vertex,
        });
    }

    fn clear_render_target(&mut self, texture: TextureId, color: [f32; 4]) {
        self.record(NativeCall::ClearRenderTarget { texture, color });
    }

    fn clear_depth(&mut self, texture: TextureId, depth: f32) {
        self.record(NativeCall::ClearDepth { texture, depth });
    }

    fn clear_stencil(&mut self, texture: TextureId, value: u8) {
        self.record(NativeCall::ClearStencil { texture, value });
    }

    fn invalidate(&mut self, texture: TextureId) {
        self.record(NativeCall::Invalidate(texture));
    }

    fn copy_texture_region(&mut self, src: TextureId, dst: TextureId, rect: Option<IntRect>, dst_x: u32, dst_y: u32) {
        self.record(NativeCall::CopyTextureRegion {
            src,
            dst,
            rect,
            dst_x,
            dst_y,
        });
    }

    fn set_compute_shader(&mut self, shader: Option<ShaderId>) {
        self.record(NativeCall::SetComputeShader(shader));
    }

    fn set_cs_constant_buffer(&mut self, buffer: Option<BufferId>) {
        self.record(NativeCall::SetCsConstantBuffer(buffer));
    }

    fn set_cs_resources(&mut self, src: Option<TextureId>, dst: Option<TextureId>) {
        self.record(NativeCall::SetCsResources { src, dst });
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.record(NativeCall::Dispatch { x, y, z });
    }

    fn create_timestamp_queries(&mut self, count: usize) -> Result<(), GsError> {
        if !self.features.timestamp_queries {
            return Err(GsError::Unsupported("timestamp queries"));
        }
        self.timestamp_queries = Some(count);
        self.record(NativeCall::CreateTimestampQueries(count));
        Ok(())
    }

    fn destroy_timestamp_queries(&mut self) {
        self.timestamp_queries = None;
        self.record(NativeCall::DestroyTimestampQueries);
    }

    fn begin_timestamp_query(&mut self, slot: usize) {
        self.record(NativeCall::BeginTimestampQuery(slot));
    }

    fn end_timestamp_query(&mut self, slot: usize) {
        self.record(NativeCall::EndTimestampQuery(slot));
    }

    fn read_timestamp_query(&mut self, _slot: usize) -> TimestampReadback {
        self.timestamp_results
            .pop_front()
            .unwrap_or(TimestampReadback::NotReady)
    }

    fn push_debug_group(&mut self, label: &str) {
        self.record(NativeCall::PushDebugGroup(label.to_owned()));
    }

    fn pop_debug_group(&mut self) {
        self.record(NativeCall::PopDebugGroup);
    }

    fn insert_debug_marker(&mut self, label: &str) {
        self.record(NativeCall::InsertDebugMarker(label.to_owned()));
    }

    fn has_surface(&self) -> bool {
        self.surface.is_some()
    }

    fn surface_size(&self) -> (u32, u32) {
        self.surface.unwrap_or((0, 0))
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        if self.surface.is_none() {
            return;
        }
        self.surface = Some((width, height));
        if let Some(old) = self.surface_texture.take() {
            self.textures.remove(old);
        }
        self.record(NativeCall::ResizeSurface { width, height });
    }

    fn exclusive_fullscreen_lost(&mut self) -> bool {
        std::mem::take(&mut self.fullscreen_lost)
    }

    fn surface_texture(&mut self) -> Result<TextureId, GsError> {
        let (width, height) = self.surface.ok_or(GsError::Unsupported("presentation surface"))?;
        if let Some(id) = self.surface_texture {
            return Ok(id);
        }
        // Back buffers are not counted against the creation budget.
        let id = self.textures.insert(TextureDesc {
            width,
            height,
            levels: 1,
            format: TextureFormat::Color,
            ty: TextureType::RenderTarget,
        });
        self.surface_texture = Some(id);
        Ok(id)
    }

    fn present(&mut self, vsync: bool) -> Result<(), GsError> {
        if std::mem::take(&mut self.fail_next_present) {
            return Err(GsError::DeviceLost("surface lost".into()));
        }
        self.record(NativeCall::Present { vsync });
        Ok(())
    }

    fn flush(&mut self) -> Result<(), GsError> {
        self.record(NativeCall::Flush);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::BufferKind;

    #[test]
    fn texture_budget_fails_creation() {
        let mut backend = RecordingBackend::new();
        backend.fail_textures_after(1);
        let desc = TextureDesc {
            width: 4,
            height: 4,
            levels: 1,
            format: TextureFormat::Color,
            ty: TextureType::Texture,
        };
        assert!(backend.create_texture(&desc).is_ok());
        assert!(matches!(
            backend.create_texture(&desc),
            Err(GsError::ResourceCreation { what: "texture", .. })
        ));
    }

    #[test]
    fn buffer_writes_land_in_contents() {
        let mut backend = RecordingBackend::new();
        let id = backend
            .create_buffer(
                &BufferDesc {
                    label: "index stream",
                    kind: BufferKind::Index,
                    size: 8,
                },
                None,
            )
            .unwrap();
        backend.write_buffer(id, 4, &[1, 2, 3, 4], MapMode::NoOverwrite).unwrap();
        assert_eq!(backend.buffer_contents(id), Some(&[0, 0, 0, 0, 1, 2, 3, 4][..]));
        assert!(backend.write_buffer(id, 6, &[0; 4], MapMode::Discard).is_err());
    }

    #[test]
    fn dump_lists_calls_in_order() {
        let mut backend = RecordingBackend::new();
        backend.set_viewport(64, 32);
        backend.draw(4, 0);
        let dump = backend.dump();
        assert!(dump.contains("SetViewport"));
        assert!(dump.find("SetViewport") < dump.find("Draw"));
    }
}
