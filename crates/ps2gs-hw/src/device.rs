//! The GS device: owns the backend and every object the render paths share.

use std::collections::VecDeque;
use std::mem::size_of;
use std::sync::Arc;

use bytemuck::Pod;
use tracing::{debug, error, info, trace, warn};

use crate::config::{GsDeviceConfig, EXPAND_INDEX_BUFFER_SIZE};
use crate::convert::ConvertObjects;
use crate::draw::constants::{ConstantCache, GsVertex, PsConstants, VsConstants};
use crate::error::GsError;
use crate::hal::{BufferDesc, BufferId, BufferKind, GsBackend, GsFeatures, IntRect, MapMode, TextureDesc};
use crate::pipeline::PipelineResolver;
use crate::postfx::chain::DisplayChain;
use crate::postfx::PostFxObjects;
use crate::present::GsEvent;
use crate::shader::{FeatureLevel, ShaderCache, ShaderSource, REQUIRED_SHADER_SOURCES};
use crate::state::StateCache;
use crate::stats::GsStats;
use crate::stream::{expansion_indices, expansion_quads_for_size, StreamAllocation, StreamBuffer};
use crate::texture::{mipmap_levels_for_size, PoolLimits, Texture, TextureFormat, TexturePool, TextureType};
use crate::timing::GpuTimer;

/// Category of a free-form debug message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DebugMessageCategory {
    Cache,
    Reg,
    Debug,
    Message,
    Performance,
}

/// Ring buffer plus the native buffer it streams into.
#[derive(Debug)]
pub(crate) struct Stream {
    pub(crate) ring: StreamBuffer,
    pub(crate) buffer: BufferId,
}

impl Stream {
    fn create<B: GsBackend + ?Sized>(
        backend: &mut B,
        label: &'static str,
        kind: BufferKind,
        size: u32,
    ) -> Result<Self, GsError> {
        let buffer = backend.create_buffer(&BufferDesc { label, kind, size }, None)?;
        Ok(Self {
            ring: StreamBuffer::new(label, size),
            buffer,
        })
    }
}

pub(crate) fn create_constant_buffer<B: GsBackend + ?Sized>(
    backend: &mut B,
    label: &'static str,
    size: usize,
) -> Result<BufferId, GsError> {
    // Constant buffers are sized in 16-byte registers.
    let size = (size as u32).div_ceil(16) * 16;
    backend.create_buffer(
        &BufferDesc {
            label,
            kind: BufferKind::Constant,
            size,
        },
        None,
    )
}

/// Hardware GS renderer bound to one backend.
pub struct GsDevice<B: GsBackend> {
    pub(crate) backend: B,
    pub(crate) config: GsDeviceConfig,
    pub(crate) features: GsFeatures,
    pub(crate) stats: Arc<GsStats>,
    pub(crate) state: StateCache,
    pub(crate) shaders: ShaderCache,
    pub(crate) sources: Box<dyn ShaderSource>,
    pub(crate) pipelines: PipelineResolver,
    pub(crate) pool: TexturePool,
    pub(crate) vertex: Stream,
    pub(crate) index: Stream,
    /// Structured vertex stream for shader-side expansion.
    pub(crate) expand: Option<Stream>,
    pub(crate) expand_index_buffer: Option<BufferId>,
    pub(crate) vs_cb: BufferId,
    pub(crate) ps_cb: BufferId,
    pub(crate) vs_cb_cache: ConstantCache<VsConstants>,
    pub(crate) ps_cb_cache: ConstantCache<PsConstants>,
    pub(crate) convert: ConvertObjects,
    pub(crate) postfx: PostFxObjects,
    pub(crate) chain: DisplayChain,
    pub(crate) timer: GpuTimer,
    pub(crate) events: VecDeque<GsEvent>,
}

impl<B: GsBackend> GsDevice<B> {
    /// Creates every shared object the render paths need.
    ///
    /// Missing shader sources and compile failures are fatal here; the
    /// optional CAS and timing features only log when unavailable.
    pub fn create(
        mut backend: B,
        config: GsDeviceConfig,
        sources: Box<dyn ShaderSource>,
    ) -> Result<Self, GsError> {
        let features = backend.features();
        let level = config.feature_level.min(backend.feature_level());
        info!(
            backend = backend.name(),
            ?level,
            ?features,
            "creating GS device"
        );

        let mut texts = Vec::with_capacity(REQUIRED_SHADER_SOURCES.len());
        for name in REQUIRED_SHADER_SOURCES {
            let text = sources.read(name).ok_or_else(|| {
                error!(source = name, "required shader source is missing");
                GsError::MissingShaderSource(name.to_owned())
            })?;
            texts.push(text);
        }
        let [tfx_src, convert_src, present_src, merge_src, interlace_src, shadeboost_src]: [String; 6] = texts
            .try_into()
            .map_err(|_| GsError::MissingShaderSource("tfx".to_owned()))?;

        let stats = Arc::new(GsStats::new());
        let mut shaders = ShaderCache::new(level, config.disable_shader_cache);

        let vertex = Stream::create(&mut backend, "vertex stream", BufferKind::Vertex, config.vertex_buffer_size)?;
        let index = Stream::create(&mut backend, "index stream", BufferKind::Index, config.index_buffer_size)?;
        let (expand, expand_index_buffer) = if features.vs_expand {
            let stream = Stream::create(
                &mut backend,
                "expand stream",
                BufferKind::Structured {
                    stride: size_of::<GsVertex>() as u32,
                },
                config.expand_buffer_size,
            )?;
            let indices = expansion_indices(expansion_quads_for_size(EXPAND_INDEX_BUFFER_SIZE));
            let ib = backend.create_buffer(
                &BufferDesc {
                    label: "expand index buffer",
                    kind: BufferKind::Index,
                    size: EXPAND_INDEX_BUFFER_SIZE,
                },
                Some(bytemuck::cast_slice(&indices)),
            )?;
            (Some(stream), Some(ib))
        } else {
            (None, None)
        };

        let vs_cb = create_constant_buffer(&mut backend, "vs constants", size_of::<VsConstants>())?;
        let ps_cb = create_constant_buffer(&mut backend, "ps constants", size_of::<PsConstants>())?;

        let convert = ConvertObjects::create(&mut backend, &mut shaders, level, &convert_src, &present_src)?;
        let postfx = PostFxObjects::create(
            &mut backend,
            &mut shaders,
            level,
            features,
            &merge_src,
            &interlace_src,
            &shadeboost_src,
            sources.as_ref(),
        )?;

        let pipelines = PipelineResolver::new(tfx_src, level, features, config.max_anisotropy);

        let mut device = Self {
            backend,
            config,
            features,
            state: StateCache::new(Arc::clone(&stats)),
            stats,
            shaders,
            sources,
            pipelines,
            pool: TexturePool::new(PoolLimits::default()),
            vertex,
            index,
            expand,
            expand_index_buffer,
            vs_cb,
            ps_cb,
            vs_cb_cache: ConstantCache::default(),
            ps_cb_cache: ConstantCache::default(),
            convert,
            postfx,
            chain: DisplayChain::default(),
            timer: GpuTimer::new(),
            events: VecDeque::new(),
        };

        if device.config.gpu_timing {
            if let Err(err) = device.set_gpu_timing_enabled(true) {
                warn!(%err, "GPU timing requested but unavailable");
            }
        }

        debug!(shaders = device.shaders.len(), "GS device ready");
        Ok(device)
    }

    /// Releases every object the device created and hands the backend back.
    pub fn destroy(mut self) -> B {
        self.timer.destroy(&mut self.backend);
        self.clear_current();
        self.purge_pool();
        self.pipelines.destroy(&mut self.backend);
        self.convert.destroy(&mut self.backend);
        self.postfx.destroy(&mut self.backend);
        self.shaders.clear(&mut self.backend);

        let mut buffers = vec![self.vertex.buffer, self.index.buffer, self.vs_cb, self.ps_cb];
        buffers.extend(self.expand.as_ref().map(|s| s.buffer));
        buffers.extend(self.expand_index_buffer);
        for buffer in buffers {
            self.backend.destroy_buffer(buffer);
        }
        self.state.invalidate_all();
        debug!("GS device destroyed");
        self.backend
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn config(&self) -> &GsDeviceConfig {
        &self.config
    }

    pub fn features(&self) -> GsFeatures {
        self.features
    }

    pub fn feature_level(&self) -> FeatureLevel {
        self.shaders.feature_level()
    }

    pub fn stats(&self) -> Arc<GsStats> {
        Arc::clone(&self.stats)
    }

    pub fn shader_cache(&self) -> &ShaderCache {
        &self.shaders
    }

    pub fn pipelines(&self) -> &PipelineResolver {
        &self.pipelines
    }

    pub fn texture_pool(&self) -> &TexturePool {
        &self.pool
    }

    // Textures

    fn clamp_size(&self, width: u32, height: u32) -> (u32, u32) {
        let max = self.config.max_texture_size.min(self.features.max_texture_size).max(1);
        (width.clamp(1, max), height.clamp(1, max))
    }

    /// Creates a texture directly, bypassing the pool.
    pub fn create_surface(
        &mut self,
        ty: TextureType,
        width: u32,
        height: u32,
        levels: u32,
        format: TextureFormat,
    ) -> Result<Texture, GsError> {
        let (width, height) = self.clamp_size(width, height);
        let desc = TextureDesc {
            width,
            height,
            levels: levels.max(1),
            format,
            ty,
        };
        match self.backend.create_texture(&desc) {
            Ok(id) => Ok(Texture::new(id, desc)),
            Err(err) => {
                error!(width, height, ?format, ?ty, %err, "failed to create texture");
                Err(err)
            }
        }
    }

    /// Takes a matching texture from the pool or creates one.
    ///
    /// Render targets are cleared to zero when `clear`, otherwise their
    /// contents are invalidated; depth targets likewise with depth 0.
    #[allow(clippy::too_many_arguments)]
    pub fn fetch_surface(
        &mut self,
        ty: TextureType,
        width: u32,
        height: u32,
        levels: u32,
        format: TextureFormat,
        clear: bool,
        prefer_reuse: bool,
    ) -> Result<Texture, GsError> {
        let (width, height) = self.clamp_size(width, height);
        let desc = TextureDesc {
            width,
            height,
            levels: levels.max(1),
            format,
            ty,
        };
        let prefer_new = self.config.prefer_new_textures && ty == TextureType::Texture && !prefer_reuse;

        let texture = match self.pool.take(&desc, prefer_new) {
            Some(texture) => texture,
            None => self.create_surface(ty, width, height, levels, format)?,
        };

        match ty {
            TextureType::RenderTarget if clear => self.clear_render_target(&texture, [0.0; 4]),
            TextureType::DepthStencil if clear => self.clear_depth(&texture, 0.0),
            TextureType::RenderTarget | TextureType::DepthStencil => self.invalidate_render_target(&texture),
            TextureType::Texture | TextureType::RWTexture => {}
        }
        Ok(texture)
    }

    pub fn create_render_target(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
        clear: bool,
    ) -> Result<Texture, GsError> {
        self.fetch_surface(TextureType::RenderTarget, width, height, 1, format, clear, false)
    }

    pub fn create_depth_stencil(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
        clear: bool,
    ) -> Result<Texture, GsError> {
        self.fetch_surface(TextureType::DepthStencil, width, height, 1, format, clear, false)
    }

    /// `levels < 0` picks a full mip chain for the size.
    pub fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        levels: i32,
        format: TextureFormat,
        prefer_reuse: bool,
    ) -> Result<Texture, GsError> {
        let levels = u32::try_from(levels).unwrap_or_else(|_| mipmap_levels_for_size(width, height));
        self.fetch_surface(TextureType::Texture, width, height, levels, format, false, prefer_reuse)
    }

    /// Uploads pixel rows into `rect` of a plain texture.
    pub fn update_texture(&mut self, texture: &Texture, rect: IntRect, data: &[u8], pitch: u32) -> Result<(), GsError> {
        self.backend.write_texture(texture.id(), rect, data, pitch)?;
        self.stats.add_upload_bytes(data.len() as u64);
        Ok(())
    }

    pub fn recycle(&mut self, texture: Texture) {
        for evicted in self.pool.recycle(texture) {
            self.destroy_texture(evicted);
        }
    }

    /// Advances the pool's frame and destroys textures that aged out.
    pub fn age_pool(&mut self) {
        let evicted = self.pool.age();
        if !evicted.is_empty() {
            trace!(count = evicted.len(), frame = self.pool.frame(), "aged out pooled textures");
        }
        for texture in evicted {
            self.destroy_texture(texture);
        }
    }

    pub fn purge_pool(&mut self) {
        for texture in self.pool.purge() {
            self.destroy_texture(texture);
        }
    }

    pub(crate) fn destroy_texture(&mut self, texture: Texture) {
        self.state.forget_texture(&mut self.backend, texture.id());
        self.backend.destroy_texture(texture.id());
    }

    // Clears and copies

    pub fn clear_render_target(&mut self, texture: &Texture, color: [f32; 4]) {
        self.backend.clear_render_target(texture.id(), color);
    }

    pub fn clear_depth(&mut self, texture: &Texture, depth: f32) {
        self.backend.clear_depth(texture.id(), depth);
    }

    pub fn clear_stencil(&mut self, texture: &Texture, value: u8) {
        self.backend.clear_stencil(texture.id(), value);
    }

    pub fn invalidate_render_target(&mut self, texture: &Texture) {
        self.backend.invalidate(texture.id());
    }

    /// Copies `rect` of `src` to `(dx, dy)` in `dst`. Depth copies always
    /// take the whole surface.
    pub fn copy_rect(&mut self, src: &Texture, dst: &Texture, rect: IntRect, dx: u32, dy: u32) {
        self.stats.inc_texture_copies();
        if src.is_depth_stencil() {
            self.backend.copy_texture_region(src.id(), dst.id(), None, 0, 0);
        } else {
            self.backend.copy_texture_region(src.id(), dst.id(), Some(rect), dx, dy);
        }
    }

    /// Copies `rect` of `src` into a fresh target of the same size and format.
    pub fn clone_texture(&mut self, src: &Texture, rect: IntRect) -> Result<Texture, GsError> {
        let (width, height) = src.size();
        let clone = if src.is_depth_stencil() {
            self.create_depth_stencil(width, height, src.format(), false)?
        } else {
            self.create_render_target(width, height, src.format(), false)?
        };
        self.copy_rect(src, &clone, rect, rect.left.max(0) as u32, rect.top.max(0) as u32);
        Ok(clone)
    }

    // Input assembly

    fn upload_stream(stats: &GsStats, backend: &mut B, stream: &mut Stream, stride: u32, data: &[u8]) -> Result<StreamAllocation, GsError> {
        let count = u32::try_from(data.len() / stride as usize).map_err(|_| GsError::CapacityExceeded {
            what: stream.ring.what(),
            requested: data.len() as u64,
            capacity: u64::from(stream.ring.capacity()),
        })?;
        let alloc = stream.ring.allocate(stride, count)?;
        if alloc.mode == MapMode::Discard {
            stats.inc_stream_discards();
            trace!(buffer = %stream.buffer, generation = alloc.generation, "stream wrapped");
        }
        backend.write_buffer(stream.buffer, alloc.offset, data, alloc.mode)?;
        stats.add_upload_bytes(data.len() as u64);
        Ok(alloc)
    }

    /// Streams `verts` and binds the vertex buffer; returns the base vertex.
    pub(crate) fn ia_set_vertices<T: Pod>(&mut self, verts: &[T]) -> Result<u32, GsError> {
        let stride = size_of::<T>() as u32;
        let alloc = Self::upload_stream(
            &self.stats,
            &mut self.backend,
            &mut self.vertex,
            stride,
            bytemuck::cast_slice(verts),
        )?;
        self.state.set_vertex_buffer(&mut self.backend, self.vertex.buffer, stride);
        Ok(alloc.base_index)
    }

    /// Streams `verts` into the structured expand buffer; returns the base vertex.
    pub(crate) fn ia_set_expand_vertices(&mut self, verts: &[GsVertex]) -> Result<u32, GsError> {
        let stream = self
            .expand
            .as_mut()
            .ok_or(GsError::Unsupported("structured vertex buffers"))?;
        let stride = size_of::<GsVertex>() as u32;
        let alloc = Self::upload_stream(&self.stats, &mut self.backend, stream, stride, bytemuck::cast_slice(verts))?;
        let buffer = stream.buffer;
        self.state.set_vs_structured_buffer(&mut self.backend, Some(buffer));
        Ok(alloc.base_index)
    }

    /// Streams 16-bit indices and binds the index buffer; returns the first index.
    pub(crate) fn ia_set_indices(&mut self, indices: &[u16]) -> Result<u32, GsError> {
        let alloc = Self::upload_stream(
            &self.stats,
            &mut self.backend,
            &mut self.index,
            size_of::<u16>() as u32,
            bytemuck::cast_slice(indices),
        )?;
        self.state.set_index_buffer(&mut self.backend, Some(self.index.buffer));
        Ok(alloc.base_index)
    }

    pub(crate) fn ia_set_expand_index_buffer(&mut self) -> Result<(), GsError> {
        let buffer = self
            .expand_index_buffer
            .ok_or(GsError::Unsupported("structured vertex buffers"))?;
        self.state.set_index_buffer(&mut self.backend, Some(buffer));
        Ok(())
    }

    pub(crate) fn draw_primitive(&mut self, vertex_count: u32, first_vertex: u32) {
        self.state.commit_ps_resources(&mut self.backend);
        self.backend.draw(vertex_count, first_vertex);
        self.stats.inc_draw_calls();
    }

    pub(crate) fn draw_indexed_primitive(&mut self, index_count: u32, first_index: u32, base_vertex: u32) {
        self.state.commit_ps_resources(&mut self.backend);
        self.backend.draw_indexed(index_count, first_index, base_vertex);
        self.stats.inc_draw_calls();
    }

    // Constants

    pub(crate) fn upload_vs_constants(&mut self, cb: &VsConstants) {
        if let Some(range) = self.vs_cb_cache.update(cb) {
            let bytes = &bytemuck::bytes_of(cb)[range.clone()];
            self.backend.update_buffer(self.vs_cb, range.start as u32, bytes);
        }
    }

    pub(crate) fn upload_ps_constants(&mut self, cb: &PsConstants) {
        if let Some(range) = self.ps_cb_cache.update(cb) {
            let bytes = &bytemuck::bytes_of(cb)[range.clone()];
            self.backend.update_buffer(self.ps_cb, range.start as u32, bytes);
        }
    }

    // Debug annotations

    pub fn push_debug_group(&mut self, name: &str) {
        trace!(group = name, "push debug group");
        if self.config.debug_markers {
            self.backend.push_debug_group(name);
        }
    }

    pub fn pop_debug_group(&mut self) {
        trace!("pop debug group");
        if self.config.debug_markers {
            self.backend.pop_debug_group();
        }
    }

    pub fn insert_debug_message(&mut self, category: DebugMessageCategory, text: &str) {
        trace!(?category, text, "debug message");
        if self.config.debug_markers {
            self.backend.insert_debug_marker(&format!("{category:?}: {text}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::{NativeCall, RecordingBackend};
    use crate::shader::MemoryShaderSource;
    use pretty_assertions::assert_eq;

    fn device() -> GsDevice<RecordingBackend> {
        GsDevice::create(
            RecordingBackend::new(),
            GsDeviceConfig::default(),
            Box::new(MemoryShaderSource::with_placeholders()),
        )
        .unwrap()
    }

    #[test]
    fn missing_source_fails_creation() {
        let mut sources = MemoryShaderSource::with_placeholders();
        sources.remove("merge");
        let err = GsDevice::create(RecordingBackend::new(), GsDeviceConfig::default(), Box::new(sources))
            .err()
            .unwrap();
        assert!(matches!(err, GsError::MissingShaderSource(name) if name == "merge"));
    }

    #[test]
    fn recycled_render_target_is_reused() {
        let mut dev = device();
        let rt = dev.create_render_target(64, 32, TextureFormat::Color, true).unwrap();
        dev.recycle(rt);
        dev.backend_mut().take_calls();

        let again = dev.create_render_target(64, 32, TextureFormat::Color, false).unwrap();
        assert_eq!(again.id(), rt.id());
        assert_eq!(dev.backend_mut().take_calls(), vec![NativeCall::Invalidate(rt.id())]);
    }

    #[test]
    fn aged_out_textures_are_destroyed() {
        let mut dev = device();
        let tex = dev.create_texture(16, 16, -1, TextureFormat::Color, false).unwrap();
        assert_eq!(tex.levels(), 5);
        dev.recycle(tex);
        for _ in 0..PoolLimits::default().max_texture_age {
            dev.age_pool();
        }
        assert!(dev.backend().calls().contains(&NativeCall::DestroyTexture(tex.id())));
        assert!(dev.texture_pool().is_empty());
    }

    #[test]
    fn depth_clone_copies_whole_surface() {
        let mut dev = device();
        let ds = dev.create_depth_stencil(32, 32, TextureFormat::DepthStencil, true).unwrap();
        dev.backend_mut().take_calls();

        let clone = dev.clone_texture(&ds, IntRect::new(4, 4, 8, 8)).unwrap();
        assert!(clone.is_depth_stencil());
        assert!(dev.backend().calls().contains(&NativeCall::CopyTextureRegion {
            src: ds.id(),
            dst: clone.id(),
            rect: None,
            dst_x: 0,
            dst_y: 0,
        }));
        assert_eq!(dev.stats().snapshot().texture_copies, 1);
    }

    #[test]
    fn sizes_are_clamped() {
        let mut dev = device();
        let rt = dev.create_render_target(0, 100_000, TextureFormat::Color, false).unwrap();
        assert_eq!(rt.size(), (1, 8192));
    }

    #[test]
    fn markers_only_forwarded_when_enabled() {
        let mut dev = device();
        dev.backend_mut().take_calls();
        dev.push_debug_group("merge");
        dev.pop_debug_group();
        assert!(dev.backend().calls().is_empty());

        let config = GsDeviceConfig {
            debug_markers: true,
            ..GsDeviceConfig::default()
        };
        let mut dev = GsDevice::create(
            RecordingBackend::new(),
            config,
            Box::new(MemoryShaderSource::with_placeholders()),
        )
        .unwrap();
        dev.backend_mut().take_calls();
        dev.insert_debug_message(DebugMessageCategory::Cache, "hit");
        assert_eq!(
            dev.backend_mut().take_calls(),
            vec![NativeCall::InsertDebugMarker("Cache: hit".into())]
        );
    }

    #[test]
    fn destroy_releases_everything() {
        let mut dev = device();
        let rt = dev.create_render_target(8, 8, TextureFormat::Color, true).unwrap();
        dev.recycle(rt);
        let backend = dev.destroy();
        assert_eq!(backend.live_textures(), 0);
        assert_eq!(backend.live_buffers(), 0);
        assert_eq!(backend.live_shaders(), 0);
    }
}
