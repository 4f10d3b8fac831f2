use std::num::NonZeroUsize;
use std::ops::Range;
use std::sync::Arc;

use hashbrown::HashMap;
use lru::LruCache;
use tracing::{debug, error, trace, warn};
use wgpu::util::DeviceExt;

use crate::error::GsError;
use crate::hal::{
    AddressMode, BlendDesc, BlendFactor, BlendOp, BlendStateId, BufferDesc, BufferId, BufferKind, ColorMask,
    CompareFunc, DepthStencilDesc, DepthStencilStateId, FilterMode, GsBackend, GsFeatures, InputElement,
    InputLayoutId, IntRect, MapMode, PrimitiveTopology, ResourceRegistry, SamplerDesc, SamplerId, ShaderId,
    StencilOp, TextureDesc, TextureId, VertexFormat,
};
use crate::shader::{FeatureLevel, ShaderMacros, ShaderStage};
use crate::state::MAX_PS_RESOURCES;
use crate::texture::{TextureFormat, TextureType};

const PIPELINE_CACHE_CAPACITY: usize = 256;
const DUMMY_BUFFER_SIZE: u64 = 256;

const BINDING_VS_CB: u32 = 0;
const BINDING_PS_CB: u32 = 1;
const BINDING_PS_TEXTURE: u32 = 2;
const BINDING_PS_SAMPLER: u32 = BINDING_PS_TEXTURE + MAX_PS_RESOURCES as u32;
const BINDING_POINT_SAMPLER: u32 = BINDING_PS_SAMPLER + 1;
const BINDING_EXPAND: u32 = BINDING_POINT_SAMPLER + 1;

const BINDING_CS_CB: u32 = 0;
const BINDING_CS_SRC: u32 = 1;
const BINDING_CS_DST: u32 = 2;

struct StoredTexture {
    /// `None` for the acquired surface texture, which the surface owns.
    texture: Option<Arc<wgpu::Texture>>,
    view: Arc<wgpu::TextureView>,
    desc: TextureDesc,
    format: wgpu::TextureFormat,
}

struct StoredBuffer {
    buffer: Arc<wgpu::Buffer>,
    desc: BufferDesc,
    /// CPU copy for buffers written at sub-word granularity.
    shadow: Option<Vec<u8>>,
}

struct StoredShader {
    module: Arc<wgpu::ShaderModule>,
    stage: ShaderStage,
    entry_point: String,
}

struct StoredInputLayout {
    attributes: Vec<wgpu::VertexAttribute>,
    stride: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct RenderPipelineKey {
    vs: ShaderId,
    ps: Option<ShaderId>,
    layout: Option<InputLayoutId>,
    topology: PrimitiveTopology,
    blend: BlendStateId,
    depth_stencil: Option<DepthStencilStateId>,
    color_format: Option<wgpu::TextureFormat>,
    depth_format: Option<wgpu::TextureFormat>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct BindGroupKey {
    vs_cb: Option<BufferId>,
    ps_cb: Option<BufferId>,
    textures: [Option<TextureId>; MAX_PS_RESOURCES],
    sampler: Option<SamplerId>,
    expand: Option<BufferId>,
}

/// Immediate-context state set through the bind calls.
#[derive(Clone, Copy, Debug)]
struct Bindings {
    vs: Option<ShaderId>,
    ps: Option<ShaderId>,
    vs_cb: Option<BufferId>,
    ps_cb: Option<BufferId>,
    expand: Option<BufferId>,
    textures: [Option<TextureId>; MAX_PS_RESOURCES],
    sampler: Option<SamplerId>,
    blend: Option<BlendStateId>,
    blend_factor: f32,
    depth_stencil: Option<DepthStencilStateId>,
    stencil_ref: u8,
    targets: (Option<TextureId>, Option<TextureId>),
    layout: Option<InputLayoutId>,
    topology: PrimitiveTopology,
    vertex_buffer: Option<BufferId>,
    index_buffer: Option<BufferId>,
    viewport: (u32, u32),
    scissor: IntRect,
    cs: Option<ShaderId>,
    cs_cb: Option<BufferId>,
    cs_src: Option<TextureId>,
    cs_dst: Option<TextureId>,
}

impl Default for Bindings {
    fn default() -> Self {
        Self {
            vs: None,
            ps: None,
            vs_cb: None,
            ps_cb: None,
            expand: None,
            textures: [None; MAX_PS_RESOURCES],
            sampler: None,
            blend: None,
            blend_factor: 0.0,
            depth_stencil: None,
            stencil_ref: 0,
            targets: (None, None),
            layout: None,
            topology: PrimitiveTopology::TriangleList,
            vertex_buffer: None,
            index_buffer: None,
            viewport: (0, 0),
            scissor: IntRect::default(),
            cs: None,
            cs_cb: None,
            cs_src: None,
            cs_dst: None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum DrawCall {
    Vertices { count: u32, first: u32 },
    Indexed { count: u32, first_index: u32, base_vertex: u32 },
}

struct DrawCommand {
    pipeline: Arc<wgpu::RenderPipeline>,
    bind_group: Arc<wgpu::BindGroup>,
    vertex_buffer: Option<Arc<wgpu::Buffer>>,
    index_buffer: Option<Arc<wgpu::Buffer>>,
    blend_constant: f32,
    stencil_ref: u8,
    viewport: (u32, u32),
    scissor: IntRect,
    call: DrawCall,
}

/// Draws recorded against one render-target pair, encoded as a single pass.
struct PendingPass {
    color: Option<Arc<wgpu::TextureView>>,
    depth: Option<Arc<wgpu::TextureView>>,
    draws: Vec<DrawCommand>,
}

struct SurfaceState {
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
    current: Option<(TextureId, wgpu::SurfaceTexture)>,
}

struct DummyResources {
    uniform: wgpu::Buffer,
    storage: wgpu::Buffer,
    view: wgpu::TextureView,
    sampler: wgpu::Sampler,
}

/// `wgpu` implementation of [`GsBackend`].
///
/// Binds are recorded as plain state; every draw snapshots that state into a
/// command of the pending render pass. The pass is encoded when the targets
/// change or when a clear, copy, upload or dispatch has to be ordered after
/// it, and everything encoded so far is submitted on [`GsBackend::flush`].
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    features: GsFeatures,
    feature_level: FeatureLevel,
    depth_format: wgpu::TextureFormat,

    textures: ResourceRegistry<TextureId, StoredTexture>,
    buffers: ResourceRegistry<BufferId, StoredBuffer>,
    shaders: ResourceRegistry<ShaderId, StoredShader>,
    input_layouts: ResourceRegistry<InputLayoutId, StoredInputLayout>,
    blend_states: ResourceRegistry<BlendStateId, BlendDesc>,
    depth_stencil_states: ResourceRegistry<DepthStencilStateId, DepthStencilDesc>,
    samplers: ResourceRegistry<SamplerId, Arc<wgpu::Sampler>>,

    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    compute_layouts: Option<(wgpu::BindGroupLayout, wgpu::PipelineLayout)>,
    point_sampler: wgpu::Sampler,
    dummy: DummyResources,

    render_pipelines: LruCache<RenderPipelineKey, Arc<wgpu::RenderPipeline>>,
    compute_pipelines: HashMap<ShaderId, Arc<wgpu::ComputePipeline>>,
    last_bind_group: Option<(BindGroupKey, Arc<wgpu::BindGroup>)>,

    bindings: Bindings,
    pending: Option<PendingPass>,
    encoder: Option<wgpu::CommandEncoder>,
    debug_depth: u32,
    surface: Option<SurfaceState>,
}

fn prepare_runtime_dir() {
    // The GL backend complains when `XDG_RUNTIME_DIR` is unset or world-readable.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let needs_runtime_dir = match std::env::var("XDG_RUNTIME_DIR") {
            Ok(dir) if !dir.is_empty() => match std::fs::metadata(&dir) {
                Ok(meta) => !meta.is_dir() || (meta.permissions().mode() & 0o077) != 0,
                Err(_) => true,
            },
            _ => true,
        };
        if needs_runtime_dir {
            let dir = std::env::temp_dir().join(format!("ps2gs-wgpu-xdg-runtime-{}", std::process::id()));
            let _ = std::fs::create_dir_all(&dir);
            let _ = std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700));
            std::env::set_var("XDG_RUNTIME_DIR", &dir);
        }
    }
}

async fn request_adapter(backends: wgpu::Backends) -> Option<wgpu::Adapter> {
    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends,
        ..Default::default()
    });
    instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        })
        .await
}

impl WgpuBackend {
    /// Creates a backend without a presentation surface.
    pub async fn new_headless() -> Result<Self, GsError> {
        prepare_runtime_dir();

        // GL first on Linux; some Vulkan software adapters are unstable.
        let adapter = if cfg!(target_os = "linux") {
            match request_adapter(wgpu::Backends::GL).await {
                Some(adapter) => Some(adapter),
                None => request_adapter(wgpu::Backends::PRIMARY).await,
            }
        } else {
            request_adapter(wgpu::Backends::PRIMARY).await
        }
        .ok_or_else(|| GsError::Backend("no suitable wgpu adapter found".into()))?;

        Self::from_adapter(adapter, None).await
    }

    /// Creates a backend presenting to `surface`, which must come from
    /// `instance`.
    pub async fn new_with_surface(
        instance: &wgpu::Instance,
        surface: wgpu::Surface<'static>,
        width: u32,
        height: u32,
    ) -> Result<Self, GsError> {
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| GsError::Backend("no wgpu adapter can present to the surface".into()))?;

        let caps = surface.get_capabilities(&adapter);
        let format = caps
            .formats
            .iter()
            .copied()
            .find(|f| !f.is_srgb())
            .or_else(|| caps.formats.first().copied())
            .ok_or_else(|| GsError::Backend("surface reports no formats".into()))?;
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | (caps.usages & wgpu::TextureUsages::COPY_DST),
            format,
            width: width.max(1),
            height: height.max(1),
            present_mode: wgpu::PresentMode::AutoNoVsync,
            desired_maximum_frame_latency: 2,
            alpha_mode: caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
        };

        Self::from_adapter(
            adapter,
            Some(SurfaceState {
                surface,
                config,
                current: None,
            }),
        )
        .await
    }

    async fn from_adapter(adapter: wgpu::Adapter, surface: Option<SurfaceState>) -> Result<Self, GsError> {
        let info = adapter.get_info();
        let downlevel = adapter.get_downlevel_capabilities();
        let limits = if wgpu::Limits::downlevel_defaults().check_limits(&adapter.limits()) {
            wgpu::Limits::downlevel_defaults()
        } else {
            wgpu::Limits::downlevel_webgl2_defaults().using_resolution(adapter.limits())
        };
        let required_features = adapter.features() & wgpu::Features::DUAL_SOURCE_BLENDING;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("ps2gs wgpu backend"),
                    required_features,
                    required_limits: limits.clone(),
                },
                None,
            )
            .await
            .map_err(|err| GsError::Backend(err.to_string()))?;
        device.on_uncaptured_error(Box::new(|err: wgpu::Error| error!(%err, "uncaptured wgpu error")));

        let compute = downlevel.flags.contains(wgpu::DownlevelFlags::COMPUTE_SHADERS)
            && limits.max_storage_textures_per_shader_stage > 0;
        let features = GsFeatures {
            vs_expand: downlevel.flags.contains(wgpu::DownlevelFlags::VERTEX_STORAGE)
                && limits.max_storage_buffers_per_shader_stage > 0,
            compute_shaders: compute,
            dual_source_blend: required_features.contains(wgpu::Features::DUAL_SOURCE_BLENDING),
            timestamp_queries: false,
            debug_markers: true,
            max_texture_size: limits.max_texture_dimension_2d,
        };
        let feature_level = if compute {
            FeatureLevel::Level11_0
        } else {
            FeatureLevel::Level10_0
        };
        debug!(adapter = %info.name, backend = ?info.backend, ?features, "created wgpu device");

        let bind_group_layout = Self::create_render_bind_group_layout(&device, features.vs_expand);
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("gs render layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let compute_layouts = compute.then(|| {
            let bgl = Self::create_compute_bind_group_layout(&device);
            let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("gs compute layout"),
                bind_group_layouts: &[&bgl],
                push_constant_ranges: &[],
            });
            (bgl, layout)
        });

        let point_sampler = device.create_sampler(&map_sampler_desc(&SamplerDesc::clamped(FilterMode::Point)));
        let dummy = DummyResources::create(&device);

        if let Some(state) = &surface {
            state.surface.configure(&device, &state.config);
        }

        Ok(Self {
            device,
            queue,
            features,
            feature_level,
            depth_format: wgpu::TextureFormat::Depth24PlusStencil8,
            textures: ResourceRegistry::new(),
            buffers: ResourceRegistry::new(),
            shaders: ResourceRegistry::new(),
            input_layouts: ResourceRegistry::new(),
            blend_states: ResourceRegistry::new(),
            depth_stencil_states: ResourceRegistry::new(),
            samplers: ResourceRegistry::new(),
            bind_group_layout,
            pipeline_layout,
            compute_layouts,
            point_sampler,
            dummy,
            render_pipelines: LruCache::new(
                NonZeroUsize::new(PIPELINE_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            ),
            compute_pipelines: HashMap::new(),
            last_bind_group: None,
            bindings: Bindings::default(),
            pending: None,
            encoder: None,
            debug_depth: 0,
            surface,
        })
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Number of render pipelines currently cached.
    pub fn cached_pipelines(&self) -> usize {
        self.render_pipelines.len()
    }

    fn create_render_bind_group_layout(device: &wgpu::Device, expand: bool) -> wgpu::BindGroupLayout {
        let uniform = |binding, visibility| wgpu::BindGroupLayoutEntry {
            binding,
            visibility,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let sampler = |binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
            count: None,
        };

        let mut entries = vec![
            uniform(BINDING_VS_CB, wgpu::ShaderStages::VERTEX),
            uniform(BINDING_PS_CB, wgpu::ShaderStages::FRAGMENT),
        ];
        for slot in 0..MAX_PS_RESOURCES as u32 {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: BINDING_PS_TEXTURE + slot,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    multisampled: false,
                    view_dimension: wgpu::TextureViewDimension::D2,
                    sample_type: wgpu::TextureSampleType::Float { filterable: true },
                },
                count: None,
            });
        }
        entries.push(sampler(BINDING_PS_SAMPLER));
        entries.push(sampler(BINDING_POINT_SAMPLER));
        if expand {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: BINDING_EXPAND,
                visibility: wgpu::ShaderStages::VERTEX,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: true },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            });
        }

        device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("gs render bindings"),
            entries: &entries,
        })
    }

    fn create_compute_bind_group_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
        device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("gs compute bindings"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: BINDING_CS_CB,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: BINDING_CS_SRC,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        multisampled: false,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: BINDING_CS_DST,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::StorageTexture {
                        access: wgpu::StorageTextureAccess::WriteOnly,
                        format: wgpu::TextureFormat::Rgba8Unorm,
                        view_dimension: wgpu::TextureViewDimension::D2,
                    },
                    count: None,
                },
            ],
        })
    }

    /// Runs `f` inside validation and out-of-memory error scopes.
    fn scoped<T>(&self, f: impl FnOnce(&wgpu::Device) -> T) -> Result<T, wgpu::Error> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(&self.device);
        let validation = pollster::block_on(self.device.pop_error_scope());
        let oom = pollster::block_on(self.device.pop_error_scope());
        match validation.or(oom) {
            Some(err) => Err(err),
            None => Ok(value),
        }
    }

    fn encoder(&mut self) -> &mut wgpu::CommandEncoder {
        self.encoder.get_or_insert_with(|| {
            self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("gs frame encoder"),
            })
        })
    }

    /// Encodes the pending render pass, if it recorded any draws.
    fn end_pass(&mut self) {
        let Some(pass) = self.pending.take() else {
            return;
        };
        if pass.draws.is_empty() {
            return;
        }
        let encoder = self.encoder();
        encode_render_pass(
            encoder,
            pass.color.as_deref().map(|view| (view, wgpu::LoadOp::Load)),
            pass.depth
                .as_deref()
                .map(|view| (view, wgpu::LoadOp::Load, wgpu::LoadOp::Load)),
            &pass.draws,
        );
    }

    fn texture(&self, id: TextureId) -> Result<&StoredTexture, GsError> {
        self.textures.get(id)
    }

    fn buffer_handle(&self, id: Option<BufferId>) -> Result<Option<Arc<wgpu::Buffer>>, GsError> {
        id.map(|id| self.buffers.get(id).map(|b| Arc::clone(&b.buffer)))
            .transpose()
    }

    fn render_pipeline(&mut self, key: RenderPipelineKey) -> Result<Arc<wgpu::RenderPipeline>, GsError> {
        if let Some(pipeline) = self.render_pipelines.get(&key) {
            return Ok(Arc::clone(pipeline));
        }

        let vs = self.shaders.get(key.vs)?;
        let ps = key.ps.map(|id| self.shaders.get(id)).transpose()?;
        let layout = key.layout.map(|id| self.input_layouts.get(id)).transpose()?;
        let blend = *self.blend_states.get(key.blend)?;
        let depth_stencil = key
            .depth_stencil
            .map(|id| self.depth_stencil_states.get(id).copied())
            .transpose()?;

        let vertex_buffers: Vec<wgpu::VertexBufferLayout<'_>> = layout
            .iter()
            .map(|layout| wgpu::VertexBufferLayout {
                array_stride: u64::from(layout.stride),
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &layout.attributes,
            })
            .collect();
        let targets = [key.color_format.map(|format| wgpu::ColorTargetState {
            format,
            blend: map_blend_state(&blend),
            write_mask: map_color_writes(blend.write_mask),
        })];
        let color_targets: &[Option<wgpu::ColorTargetState>] = if key.color_format.is_some() { &targets } else { &[] };
        let topology = map_topology(key.topology);
        let strip_index_format =
            (key.topology == PrimitiveTopology::TriangleStrip).then_some(wgpu::IndexFormat::Uint16);

        let pipeline = self
            .scoped(|device| {
                device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: Some("gs pipeline"),
                    layout: Some(&self.pipeline_layout),
                    vertex: wgpu::VertexState {
                        module: &vs.module,
                        entry_point: &vs.entry_point,
                        compilation_options: wgpu::PipelineCompilationOptions::default(),
                        buffers: &vertex_buffers,
                    },
                    fragment: ps.map(|ps| wgpu::FragmentState {
                        module: &ps.module,
                        entry_point: &ps.entry_point,
                        compilation_options: wgpu::PipelineCompilationOptions::default(),
                        targets: color_targets,
                    }),
                    primitive: wgpu::PrimitiveState {
                        topology,
                        strip_index_format,
                        cull_mode: None,
                        ..Default::default()
                    },
                    depth_stencil: key
                        .depth_format
                        .map(|format| map_depth_stencil_state(format, depth_stencil.as_ref())),
                    multisample: wgpu::MultisampleState::default(),
                    multiview: None,
                })
            })
            .map_err(|err| GsError::resource("render pipeline", err.to_string()))?;

        let pipeline = Arc::new(pipeline);
        trace!(?key, "created render pipeline");
        self.render_pipelines.put(key, Arc::clone(&pipeline));
        Ok(pipeline)
    }

    fn render_bind_group(&mut self) -> Result<Arc<wgpu::BindGroup>, GsError> {
        let b = &self.bindings;
        let key = BindGroupKey {
            vs_cb: b.vs_cb,
            ps_cb: b.ps_cb,
            textures: b.textures,
            sampler: b.sampler,
            expand: b.expand.filter(|_| self.features.vs_expand),
        };
        if let Some((last, group)) = &self.last_bind_group {
            if *last == key {
                return Ok(Arc::clone(group));
            }
        }

        let vs_cb = self.buffer_handle(key.vs_cb)?;
        let ps_cb = self.buffer_handle(key.ps_cb)?;
        let expand = self.buffer_handle(key.expand)?;
        let mut views = Vec::with_capacity(MAX_PS_RESOURCES);
        for slot in key.textures {
            views.push(slot.map(|id| self.texture(id).map(|t| Arc::clone(&t.view))).transpose()?);
        }
        let sampler = key.sampler.map(|id| self.samplers.get(id).cloned()).transpose()?;

        let mut entries = vec![
            wgpu::BindGroupEntry {
                binding: BINDING_VS_CB,
                resource: vs_cb.as_deref().unwrap_or(&self.dummy.uniform).as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: BINDING_PS_CB,
                resource: ps_cb.as_deref().unwrap_or(&self.dummy.uniform).as_entire_binding(),
            },
        ];
        for (slot, view) in views.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: BINDING_PS_TEXTURE + slot as u32,
                resource: wgpu::BindingResource::TextureView(view.as_deref().unwrap_or(&self.dummy.view)),
            });
        }
        entries.push(wgpu::BindGroupEntry {
            binding: BINDING_PS_SAMPLER,
            resource: wgpu::BindingResource::Sampler(sampler.as_deref().unwrap_or(&self.dummy.sampler)),
        });
        entries.push(wgpu::BindGroupEntry {
            binding: BINDING_POINT_SAMPLER,
            resource: wgpu::BindingResource::Sampler(&self.point_sampler),
        });
        if self.features.vs_expand {
            entries.push(wgpu::BindGroupEntry {
                binding: BINDING_EXPAND,
                resource: expand.as_deref().unwrap_or(&self.dummy.storage).as_entire_binding(),
            });
        }

        let group = Arc::new(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("gs render bind group"),
            layout: &self.bind_group_layout,
            entries: &entries,
        }));
        self.last_bind_group = Some((key, Arc::clone(&group)));
        Ok(group)
    }

    fn record_draw(&mut self, call: DrawCall) -> Result<(), GsError> {
        let b = self.bindings;
        let vs = b.vs.ok_or(GsError::Backend("draw without a vertex shader".into()))?;
        let blend = b.blend.ok_or(GsError::Backend("draw without a blend state".into()))?;
        let (rt, ds) = b.targets;
        let color = rt.map(|id| self.texture(id).map(|t| (Arc::clone(&t.view), t.format))).transpose()?;
        let depth = ds.map(|id| self.texture(id).map(|t| (Arc::clone(&t.view), t.format))).transpose()?;

        let key = RenderPipelineKey {
            vs,
            ps: b.ps,
            layout: b.layout,
            topology: b.topology,
            blend,
            depth_stencil: b.depth_stencil.filter(|_| depth.is_some()),
            color_format: color.as_ref().map(|(_, format)| *format),
            depth_format: depth.as_ref().map(|(_, format)| *format),
        };
        let pipeline = self.render_pipeline(key)?;
        let bind_group = self.render_bind_group()?;
        let vertex_buffer = self.buffer_handle(b.vertex_buffer.filter(|_| b.layout.is_some()))?;
        let index_buffer = match call {
            DrawCall::Indexed { .. } => Some(
                self.buffer_handle(b.index_buffer)?
                    .ok_or(GsError::Backend("indexed draw without an index buffer".into()))?,
            ),
            DrawCall::Vertices { .. } => None,
        };

        let pending = self.pending.get_or_insert_with(|| PendingPass {
            color: color.as_ref().map(|(view, _)| Arc::clone(view)),
            depth: depth.as_ref().map(|(view, _)| Arc::clone(view)),
            draws: Vec::new(),
        });
        pending.draws.push(DrawCommand {
            pipeline,
            bind_group,
            vertex_buffer,
            index_buffer,
            blend_constant: b.blend_factor,
            stencil_ref: b.stencil_ref,
            viewport: b.viewport,
            scissor: b.scissor,
            call,
        });
        Ok(())
    }

    fn compute_pipeline(&mut self, shader: ShaderId) -> Result<Arc<wgpu::ComputePipeline>, GsError> {
        if let Some(pipeline) = self.compute_pipelines.get(&shader) {
            return Ok(Arc::clone(pipeline));
        }
        let (_, layout) = self
            .compute_layouts
            .as_ref()
            .ok_or(GsError::Unsupported("compute shaders"))?;
        let cs = self.shaders.get(shader)?;
        let pipeline = self
            .scoped(|device| {
                device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some("gs compute pipeline"),
                    layout: Some(layout),
                    module: &cs.module,
                    entry_point: &cs.entry_point,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                })
            })
            .map_err(|err| GsError::resource("compute pipeline", err.to_string()))?;
        let pipeline = Arc::new(pipeline);
        self.compute_pipelines.insert(shader, Arc::clone(&pipeline));
        Ok(pipeline)
    }

    fn record_dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<(), GsError> {
        let b = self.bindings;
        let shader = b.cs.ok_or(GsError::Backend("dispatch without a compute shader".into()))?;
        let pipeline = self.compute_pipeline(shader)?;
        let cb = self.buffer_handle(b.cs_cb)?;
        let src = b
            .cs_src
            .map(|id| self.texture(id).map(|t| Arc::clone(&t.view)))
            .transpose()?
            .ok_or(GsError::Backend("dispatch without a source texture".into()))?;
        let dst = b
            .cs_dst
            .map(|id| self.texture(id).map(|t| Arc::clone(&t.view)))
            .transpose()?
            .ok_or(GsError::Backend("dispatch without a destination texture".into()))?;
        let (bgl, _) = self
            .compute_layouts
            .as_ref()
            .ok_or(GsError::Unsupported("compute shaders"))?;

        let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("gs compute bind group"),
            layout: bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: BINDING_CS_CB,
                    resource: cb.as_deref().unwrap_or(&self.dummy.uniform).as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: BINDING_CS_SRC,
                    resource: wgpu::BindingResource::TextureView(&src),
                },
                wgpu::BindGroupEntry {
                    binding: BINDING_CS_DST,
                    resource: wgpu::BindingResource::TextureView(&dst),
                },
            ],
        });

        self.end_pass();
        let encoder = self.encoder();
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("gs compute pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&pipeline);
        pass.set_bind_group(0, &group, &[]);
        pass.dispatch_workgroups(x, y, z);
        Ok(())
    }

    /// Encodes a pass that only clears `texture`.
    fn clear_pass(
        &mut self,
        texture: TextureId,
        color: Option<wgpu::Color>,
        depth: Option<f32>,
        stencil: Option<u32>,
    ) -> Result<(), GsError> {
        let view = Arc::clone(&self.texture(texture)?.view);
        self.end_pass();
        let encoder = self.encoder();
        if let Some(color) = color {
            encode_render_pass(encoder, Some((&view, wgpu::LoadOp::Clear(color))), None, &[]);
        } else {
            let depth_load = depth.map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear);
            let stencil_load = stencil.map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear);
            encode_render_pass(encoder, None, Some((&view, depth_load, stencil_load)), &[]);
        }
        Ok(())
    }

    fn copy_region(
        &mut self,
        src: TextureId,
        dst: TextureId,
        rect: Option<IntRect>,
        dst_x: u32,
        dst_y: u32,
    ) -> Result<(), GsError> {
        let src_entry = self.texture(src)?;
        let dst_entry = self.texture(dst)?;
        let (Some(src_tex), Some(dst_tex)) = (src_entry.texture.clone(), dst_entry.texture.clone()) else {
            return Err(GsError::Unsupported("copies involving the surface texture"));
        };
        if src_entry.desc.format.is_depth() {
            return Err(GsError::Unsupported("depth-stencil texture copies"));
        }
        let (src_w, src_h) = (src_entry.desc.width, src_entry.desc.height);
        let (dst_w, dst_h) = (dst_entry.desc.width, dst_entry.desc.height);
        let (origin, extent, dst_origin) = match rect {
            Some(rect) => {
                let left = rect.left.clamp(0, src_w as i32) as u32;
                let top = rect.top.clamp(0, src_h as i32) as u32;
                let right = rect.right.clamp(0, src_w as i32) as u32;
                let bottom = rect.bottom.clamp(0, src_h as i32) as u32;
                let width = right.saturating_sub(left).min(dst_w.saturating_sub(dst_x));
                let height = bottom.saturating_sub(top).min(dst_h.saturating_sub(dst_y));
                ((left, top), (width, height), (dst_x, dst_y))
            }
            None => ((0, 0), (src_w.min(dst_w), src_h.min(dst_h)), (0, 0)),
        };
        if extent.0 == 0 || extent.1 == 0 {
            return Ok(());
        }

        self.end_pass();
        self.encoder().copy_texture_to_texture(
            wgpu::ImageCopyTexture {
                texture: &src_tex,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: origin.0,
                    y: origin.1,
                    z: 0,
                },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyTexture {
                texture: &dst_tex,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: dst_origin.0,
                    y: dst_origin.1,
                    z: 0,
                },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::Extent3d {
                width: extent.0,
                height: extent.1,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn wgpu_format(&self, format: TextureFormat) -> wgpu::TextureFormat {
        match format {
            TextureFormat::DepthStencil => self.depth_format,
            other => map_texture_format(other),
        }
    }

    fn acquire_surface_texture(&mut self) -> Result<TextureId, GsError> {
        let Some(state) = self.surface.as_mut() else {
            return Err(GsError::Unsupported("presentation without a surface"));
        };
        if let Some((id, _)) = &state.current {
            return Ok(*id);
        }

        let frame = match state.surface.get_current_texture() {
            Ok(frame) => frame,
            Err(wgpu::SurfaceError::Timeout) => return Err(GsError::DeviceTransient),
            Err(wgpu::SurfaceError::Outdated) => {
                state.surface.configure(&self.device, &state.config);
                return Err(GsError::DeviceTransient);
            }
            Err(err) => return Err(GsError::DeviceLost(err.to_string())),
        };
        if frame.suboptimal {
            trace!("surface texture is suboptimal");
        }

        let view = frame.texture.create_view(&wgpu::TextureViewDescriptor::default());
        let desc = TextureDesc {
            width: state.config.width,
            height: state.config.height,
            levels: 1,
            format: TextureFormat::Color,
            ty: TextureType::RenderTarget,
        };
        let format = state.config.format;
        let id = self.textures.insert(StoredTexture {
            texture: None,
            view: Arc::new(view),
            desc,
            format,
        });
        if let Some(state) = self.surface.as_mut() {
            state.current = Some((id, frame));
        }
        Ok(id)
    }

    fn submit(&mut self) {
        self.end_pass();
        if let Some(mut encoder) = self.encoder.take() {
            for _ in 0..std::mem::take(&mut self.debug_depth) {
                encoder.pop_debug_group();
            }
            self.queue.submit(std::iter::once(encoder.finish()));
            let _ = self.device.poll(wgpu::Maintain::Poll);
        }
    }
}

impl DummyResources {
    fn create(device: &wgpu::Device) -> Self {
        let uniform = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("gs dummy uniform"),
            size: DUMMY_BUFFER_SIZE,
            usage: wgpu::BufferUsages::UNIFORM,
            mapped_at_creation: false,
        });
        let storage = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("gs dummy storage"),
            size: DUMMY_BUFFER_SIZE,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("gs dummy texture"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let sampler = device.create_sampler(&map_sampler_desc(&SamplerDesc::clamped(FilterMode::Point)));
        Self {
            uniform,
            storage,
            view,
            sampler,
        }
    }
}

fn encode_render_pass(
    encoder: &mut wgpu::CommandEncoder,
    color: Option<(&wgpu::TextureView, wgpu::LoadOp<wgpu::Color>)>,
    depth: Option<(&wgpu::TextureView, wgpu::LoadOp<f32>, wgpu::LoadOp<u32>)>,
    draws: &[DrawCommand],
) {
    let attachments = [color.map(|(view, load)| wgpu::RenderPassColorAttachment {
        view,
        resolve_target: None,
        ops: wgpu::Operations {
            load,
            store: wgpu::StoreOp::Store,
        },
    })];
    let color_attachments: &[Option<wgpu::RenderPassColorAttachment<'_>>] =
        if attachments[0].is_some() { &attachments } else { &[] };
    let depth_stencil_attachment = depth.map(|(view, depth_load, stencil_load)| {
        wgpu::RenderPassDepthStencilAttachment {
            view,
            depth_ops: Some(wgpu::Operations {
                load: depth_load,
                store: wgpu::StoreOp::Store,
            }),
            stencil_ops: Some(wgpu::Operations {
                load: stencil_load,
                store: wgpu::StoreOp::Store,
            }),
        }
    });

    let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
        label: Some("gs render pass"),
        color_attachments,
        depth_stencil_attachment,
        timestamp_writes: None,
        occlusion_query_set: None,
    });

    for draw in draws {
        let (width, height) = draw.viewport;
        if width == 0 || height == 0 {
            continue;
        }
        let scissor = clamp_scissor(draw.scissor, width, height);
        if scissor.is_empty() {
            continue;
        }

        pass.set_pipeline(&draw.pipeline);
        pass.set_bind_group(0, &draw.bind_group, &[]);
        pass.set_viewport(0.0, 0.0, width as f32, height as f32, 0.0, 1.0);
        pass.set_scissor_rect(
            scissor.left as u32,
            scissor.top as u32,
            scissor.width() as u32,
            scissor.height() as u32,
        );
        let f = f64::from(draw.blend_constant);
        pass.set_blend_constant(wgpu::Color { r: f, g: f, b: f, a: 0.0 });
        pass.set_stencil_reference(u32::from(draw.stencil_ref));
        if let Some(buffer) = &draw.vertex_buffer {
            pass.set_vertex_buffer(0, buffer.slice(..));
        }
        match draw.call {
            DrawCall::Vertices { count, first } => pass.draw(first..first + count, 0..1),
            DrawCall::Indexed {
                count,
                first_index,
                base_vertex,
            } => {
                if let Some(buffer) = &draw.index_buffer {
                    pass.set_index_buffer(buffer.slice(..), wgpu::IndexFormat::Uint16);
                    pass.draw_indexed(first_index..first_index + count, base_vertex as i32, 0..1);
                }
            }
        }
    }
}

fn clamp_scissor(rect: IntRect, width: u32, height: u32) -> IntRect {
    let (w, h) = (width as i32, height as i32);
    IntRect::new(
        rect.left.clamp(0, w),
        rect.top.clamp(0, h),
        rect.right.clamp(0, w),
        rect.bottom.clamp(0, h),
    )
}

/// Widens a byte range to the buffer copy alignment.
fn aligned_range(offset: u64, len: u64, size: u64) -> Range<u64> {
    let align = wgpu::COPY_BUFFER_ALIGNMENT;
    let start = offset / align * align;
    let end = (offset + len).div_ceil(align) * align;
    start..end.min(size)
}

fn map_texture_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Color => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::HDRColor => wgpu::TextureFormat::Rgba16Float,
        TextureFormat::DepthStencil => wgpu::TextureFormat::Depth24PlusStencil8,
        TextureFormat::UNorm8 => wgpu::TextureFormat::R8Unorm,
        TextureFormat::UInt16 => wgpu::TextureFormat::R16Uint,
        TextureFormat::UInt32 => wgpu::TextureFormat::R32Uint,
        TextureFormat::PrimID => wgpu::TextureFormat::R32Float,
    }
}

fn texture_usages(ty: TextureType) -> wgpu::TextureUsages {
    use wgpu::TextureUsages as U;
    match ty {
        TextureType::RenderTarget | TextureType::DepthStencil => {
            U::RENDER_ATTACHMENT | U::TEXTURE_BINDING | U::COPY_SRC | U::COPY_DST
        }
        TextureType::Texture => U::TEXTURE_BINDING | U::COPY_SRC | U::COPY_DST,
        TextureType::RWTexture => U::STORAGE_BINDING | U::TEXTURE_BINDING | U::COPY_SRC,
    }
}

fn buffer_usages(kind: BufferKind) -> wgpu::BufferUsages {
    use wgpu::BufferUsages as U;
    match kind {
        BufferKind::Vertex => U::VERTEX | U::COPY_DST,
        BufferKind::Index => U::INDEX | U::COPY_DST,
        BufferKind::Structured { .. } => U::STORAGE | U::COPY_DST,
        BufferKind::Constant => U::UNIFORM | U::COPY_DST,
    }
}

fn map_vertex_format(format: VertexFormat) -> wgpu::VertexFormat {
    match format {
        VertexFormat::Float32 => wgpu::VertexFormat::Float32,
        VertexFormat::Float32x2 => wgpu::VertexFormat::Float32x2,
        VertexFormat::Float32x4 => wgpu::VertexFormat::Float32x4,
        VertexFormat::Uint32 => wgpu::VertexFormat::Uint32,
        VertexFormat::Uint16x2 => wgpu::VertexFormat::Uint16x2,
        VertexFormat::Uint8x4 => wgpu::VertexFormat::Uint8x4,
        VertexFormat::Unorm8x4 => wgpu::VertexFormat::Unorm8x4,
    }
}

fn map_topology(topology: PrimitiveTopology) -> wgpu::PrimitiveTopology {
    match topology {
        PrimitiveTopology::PointList => wgpu::PrimitiveTopology::PointList,
        PrimitiveTopology::LineList => wgpu::PrimitiveTopology::LineList,
        PrimitiveTopology::TriangleList => wgpu::PrimitiveTopology::TriangleList,
        PrimitiveTopology::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
    }
}

fn map_blend_factor(factor: BlendFactor) -> wgpu::BlendFactor {
    match factor {
        BlendFactor::Zero => wgpu::BlendFactor::Zero,
        BlendFactor::One => wgpu::BlendFactor::One,
        BlendFactor::SrcColor => wgpu::BlendFactor::Src,
        BlendFactor::InvSrcColor => wgpu::BlendFactor::OneMinusSrc,
        BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
        BlendFactor::InvSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
        BlendFactor::DstColor => wgpu::BlendFactor::Dst,
        BlendFactor::InvDstColor => wgpu::BlendFactor::OneMinusDst,
        BlendFactor::DstAlpha => wgpu::BlendFactor::DstAlpha,
        BlendFactor::InvDstAlpha => wgpu::BlendFactor::OneMinusDstAlpha,
        BlendFactor::Src1Color => wgpu::BlendFactor::Src1,
        BlendFactor::InvSrc1Color => wgpu::BlendFactor::OneMinusSrc1,
        BlendFactor::Src1Alpha => wgpu::BlendFactor::Src1Alpha,
        BlendFactor::InvSrc1Alpha => wgpu::BlendFactor::OneMinusSrc1Alpha,
        BlendFactor::Constant => wgpu::BlendFactor::Constant,
        BlendFactor::InvConstant => wgpu::BlendFactor::OneMinusConstant,
    }
}

fn map_blend_op(op: BlendOp) -> wgpu::BlendOperation {
    match op {
        BlendOp::Add => wgpu::BlendOperation::Add,
        BlendOp::Subtract => wgpu::BlendOperation::Subtract,
        BlendOp::RevSubtract => wgpu::BlendOperation::ReverseSubtract,
        BlendOp::Min => wgpu::BlendOperation::Min,
        BlendOp::Max => wgpu::BlendOperation::Max,
    }
}

fn map_blend_state(desc: &BlendDesc) -> Option<wgpu::BlendState> {
    desc.enable.then(|| wgpu::BlendState {
        color: wgpu::BlendComponent {
            src_factor: map_blend_factor(desc.src),
            dst_factor: map_blend_factor(desc.dst),
            operation: map_blend_op(desc.op),
        },
        alpha: wgpu::BlendComponent {
            src_factor: map_blend_factor(desc.src_alpha),
            dst_factor: map_blend_factor(desc.dst_alpha),
            operation: map_blend_op(desc.op_alpha),
        },
    })
}

fn map_color_writes(mask: ColorMask) -> wgpu::ColorWrites {
    let mut out = wgpu::ColorWrites::empty();
    out.set(wgpu::ColorWrites::RED, mask.contains(ColorMask::R));
    out.set(wgpu::ColorWrites::GREEN, mask.contains(ColorMask::G));
    out.set(wgpu::ColorWrites::BLUE, mask.contains(ColorMask::B));
    out.set(wgpu::ColorWrites::ALPHA, mask.contains(ColorMask::A));
    out
}

fn map_compare(func: CompareFunc) -> wgpu::CompareFunction {
    match func {
        CompareFunc::Never => wgpu::CompareFunction::Never,
        CompareFunc::Less => wgpu::CompareFunction::Less,
        CompareFunc::Equal => wgpu::CompareFunction::Equal,
        CompareFunc::LessEqual => wgpu::CompareFunction::LessEqual,
        CompareFunc::Greater => wgpu::CompareFunction::Greater,
        CompareFunc::NotEqual => wgpu::CompareFunction::NotEqual,
        CompareFunc::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
        CompareFunc::Always => wgpu::CompareFunction::Always,
    }
}

fn map_stencil_op(op: StencilOp) -> wgpu::StencilOperation {
    match op {
        StencilOp::Keep => wgpu::StencilOperation::Keep,
        StencilOp::Zero => wgpu::StencilOperation::Zero,
        StencilOp::Replace => wgpu::StencilOperation::Replace,
        StencilOp::IncrementClamp => wgpu::StencilOperation::IncrementClamp,
        StencilOp::DecrementClamp => wgpu::StencilOperation::DecrementClamp,
        StencilOp::Invert => wgpu::StencilOperation::Invert,
        StencilOp::IncrementWrap => wgpu::StencilOperation::IncrementWrap,
        StencilOp::DecrementWrap => wgpu::StencilOperation::DecrementWrap,
    }
}

fn map_depth_stencil_state(format: wgpu::TextureFormat, desc: Option<&DepthStencilDesc>) -> wgpu::DepthStencilState {
    let desc = desc.unwrap_or(&DepthStencilDesc::DISABLED);
    let stencil = if desc.stencil_enable {
        let face = wgpu::StencilFaceState {
            compare: map_compare(desc.stencil.func),
            fail_op: map_stencil_op(desc.stencil.fail_op),
            depth_fail_op: map_stencil_op(desc.stencil.depth_fail_op),
            pass_op: map_stencil_op(desc.stencil.pass_op),
        };
        wgpu::StencilState {
            front: face,
            back: face,
            read_mask: u32::from(desc.stencil_read_mask),
            write_mask: u32::from(desc.stencil_write_mask),
        }
    } else {
        wgpu::StencilState::default()
    };
    wgpu::DepthStencilState {
        format,
        depth_write_enabled: desc.depth_enable && desc.depth_write,
        depth_compare: if desc.depth_enable {
            map_compare(desc.depth_func)
        } else {
            wgpu::CompareFunction::Always
        },
        stencil,
        bias: wgpu::DepthBiasState::default(),
    }
}

fn map_sampler_desc(desc: &SamplerDesc) -> wgpu::SamplerDescriptor<'static> {
    let filter = |mode| match mode {
        FilterMode::Point => wgpu::FilterMode::Nearest,
        FilterMode::Linear => wgpu::FilterMode::Linear,
    };
    let address = |mode| match mode {
        AddressMode::Clamp => wgpu::AddressMode::ClampToEdge,
        AddressMode::Wrap => wgpu::AddressMode::Repeat,
    };
    let all_linear = [desc.mag_filter, desc.min_filter, desc.mip_filter]
        .iter()
        .all(|f| *f == FilterMode::Linear);
    let anisotropy_clamp = if all_linear {
        u16::from(desc.max_anisotropy.max(1))
    } else {
        1
    };
    wgpu::SamplerDescriptor {
        label: Some("gs sampler"),
        address_mode_u: address(desc.address_u),
        address_mode_v: address(desc.address_v),
        address_mode_w: wgpu::AddressMode::ClampToEdge,
        mag_filter: filter(desc.mag_filter),
        min_filter: filter(desc.min_filter),
        mipmap_filter: filter(desc.mip_filter),
        lod_min_clamp: 0.0,
        lod_max_clamp: if desc.lod_clamp { 0.25 } else { 32.0 },
        compare: None,
        anisotropy_clamp,
        border_color: None,
    }
}

/// Prepends the macro set to WGSL source as module-scope constants.
fn wgsl_with_macros(source: &str, macros: &ShaderMacros) -> String {
    let mut out = String::with_capacity(source.len() + macros.len() * 32);
    for (name, value) in macros.iter() {
        out.push_str(&format!("const {name}: i32 = {value};\n"));
    }
    out.push_str(source);
    out
}

impl GsBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn features(&self) -> GsFeatures {
        self.features
    }

    fn feature_level(&self) -> FeatureLevel {
        self.feature_level
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, GsError> {
        if desc.width == 0 || desc.height == 0 {
            return Err(GsError::resource("texture", "width/height must be non-zero"));
        }
        let max_levels = 32 - desc.width.max(desc.height).leading_zeros();
        let format = self.wgpu_format(desc.format);
        let texture = self
            .scoped(|device| {
                device.create_texture(&wgpu::TextureDescriptor {
                    label: Some("gs texture"),
                    size: wgpu::Extent3d {
                        width: desc.width,
                        height: desc.height,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: desc.levels.clamp(1, max_levels),
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format,
                    usage: texture_usages(desc.ty),
                    view_formats: &[],
                })
            })
            .map_err(|err| GsError::resource("texture", err.to_string()))?;
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Ok(self.textures.insert(StoredTexture {
            texture: Some(Arc::new(texture)),
            view: Arc::new(view),
            desc: *desc,
            format,
        }))
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        // Dropped rather than destroyed: unsubmitted passes may still use it.
        if self.textures.remove(texture).is_none() {
            warn!(%texture, "destroying unknown texture");
        }
    }

    fn write_texture(&mut self, texture: TextureId, rect: IntRect, data: &[u8], pitch: u32) -> Result<(), GsError> {
        let entry = self.texture(texture)?;
        let Some(target) = entry.texture.clone() else {
            return Err(GsError::Unsupported("uploads into the surface texture"));
        };
        if entry.desc.format.is_depth() {
            return Err(GsError::Unsupported("depth texture uploads"));
        }
        let bpp = entry.desc.format.bytes_per_pixel();
        let (width, height) = (rect.width().max(0) as u32, rect.height().max(0) as u32);
        if width == 0 || height == 0 {
            return Ok(());
        }
        let in_bounds = rect.left >= 0
            && rect.top >= 0
            && rect.right as u32 <= entry.desc.width
            && rect.bottom as u32 <= entry.desc.height;
        if !in_bounds {
            return Err(GsError::Backend(format!("texture upload {rect:?} out of bounds")));
        }
        let row_bytes = width * bpp;
        let required = pitch as usize * (height as usize - 1) + row_bytes as usize;
        if pitch < row_bytes || data.len() < required {
            return Err(GsError::Backend(format!(
                "texture upload needs {required} bytes at pitch {pitch}, got {}",
                data.len()
            )));
        }

        let padded = wgpu::util::align_to(row_bytes, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let mut staging = vec![0u8; padded as usize * height as usize];
        for (row, chunk) in staging.chunks_exact_mut(padded as usize).enumerate() {
            let start = row * pitch as usize;
            chunk[..row_bytes as usize].copy_from_slice(&data[start..start + row_bytes as usize]);
        }
        let staging = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("gs texture upload"),
            contents: &staging,
            usage: wgpu::BufferUsages::COPY_SRC,
        });

        self.end_pass();
        self.encoder().copy_buffer_to_texture(
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            wgpu::ImageCopyTexture {
                texture: &target,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: rect.left as u32,
                    y: rect.top as u32,
                    z: 0,
                },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn create_buffer(&mut self, desc: &BufferDesc, contents: Option<&[u8]>) -> Result<BufferId, GsError> {
        let size = wgpu::util::align_to(
            u64::from(desc.size).max(wgpu::COPY_BUFFER_ALIGNMENT),
            wgpu::COPY_BUFFER_ALIGNMENT,
        );
        let buffer = self
            .scoped(|device| {
                device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(desc.label),
                    size,
                    usage: buffer_usages(desc.kind),
                    mapped_at_creation: contents.is_some(),
                })
            })
            .map_err(|err| GsError::resource(desc.label, err.to_string()))?;

        let mut shadow = matches!(desc.kind, BufferKind::Index | BufferKind::Constant).then(|| vec![0u8; size as usize]);
        if let Some(contents) = contents {
            let len = contents.len().min(size as usize);
            buffer.slice(..).get_mapped_range_mut()[..len].copy_from_slice(&contents[..len]);
            buffer.unmap();
            if let Some(shadow) = shadow.as_mut() {
                shadow[..len].copy_from_slice(&contents[..len]);
            }
        }

        Ok(self.buffers.insert(StoredBuffer {
            buffer: Arc::new(buffer),
            desc: *desc,
            shadow,
        }))
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        if self.buffers.remove(buffer).is_none() {
            warn!(%buffer, "destroying unknown buffer");
        }
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u32, data: &[u8], mode: MapMode) -> Result<(), GsError> {
        if mode == MapMode::Discard {
            // Queue writes land before the next submission; earlier draws
            // still reading the old contents have to go first.
            self.submit();
        }

        let entry = self.buffers.get_mut(buffer)?;
        let size = entry.buffer.size();
        let (offset, len) = (u64::from(offset), data.len() as u64);
        if offset + len > u64::from(entry.desc.size) {
            return Err(GsError::CapacityExceeded {
                what: entry.desc.label,
                requested: offset + len,
                capacity: u64::from(entry.desc.size),
            });
        }

        match entry.shadow.as_mut() {
            Some(shadow) => {
                shadow[offset as usize..(offset + len) as usize].copy_from_slice(data);
                let range = aligned_range(offset, len, size);
                self.queue
                    .write_buffer(&entry.buffer, range.start, &shadow[range.start as usize..range.end as usize]);
            }
            None => self.queue.write_buffer(&entry.buffer, offset, data),
        }
        Ok(())
    }

    fn update_buffer(&mut self, buffer: BufferId, offset: u32, data: &[u8]) {
        let Ok(entry) = self.buffers.get_mut(buffer) else {
            warn!(%buffer, "update of unknown buffer");
            return;
        };
        let size = entry.buffer.size();
        let (offset, len) = (u64::from(offset), data.len() as u64);
        if offset + len > size {
            error!(%buffer, offset, len, size, "constant update out of bounds");
            return;
        }

        let (target, staging, range) = match entry.shadow.as_mut() {
            Some(shadow) => {
                shadow[offset as usize..(offset + len) as usize].copy_from_slice(data);
                let range = aligned_range(offset, len, size);
                let bytes = &shadow[range.start as usize..range.end as usize];
                let staging = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("gs constant upload"),
                    contents: bytes,
                    usage: wgpu::BufferUsages::COPY_SRC,
                });
                (Arc::clone(&entry.buffer), staging, range)
            }
            None => {
                let range = offset..offset + len;
                let staging = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("gs buffer upload"),
                    contents: data,
                    usage: wgpu::BufferUsages::COPY_SRC,
                });
                (Arc::clone(&entry.buffer), staging, range)
            }
        };

        self.end_pass();
        self.encoder()
            .copy_buffer_to_buffer(&staging, 0, &target, range.start, range.end - range.start);
    }

    fn compile_shader(
        &mut self,
        stage: ShaderStage,
        source: &str,
        macros: &ShaderMacros,
        entry_point: &str,
    ) -> Result<ShaderId, GsError> {
        let wgsl = wgsl_with_macros(source, macros);
        let module = self
            .scoped(|device| {
                device.create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(entry_point),
                    source: wgpu::ShaderSource::Wgsl(wgsl.into()),
                })
            })
            .map_err(|err| GsError::ShaderCompile {
                entry_point: entry_point.to_owned(),
                message: err.to_string(),
            })?;
        Ok(self.shaders.insert(StoredShader {
            module: Arc::new(module),
            stage,
            entry_point: entry_point.to_owned(),
        }))
    }

    fn destroy_shader(&mut self, shader: ShaderId) {
        if let Some(stored) = self.shaders.remove(shader) {
            if stored.stage == ShaderStage::Compute {
                self.compute_pipelines.remove(&shader);
            }
        }
    }

    fn create_input_layout(&mut self, elements: &[InputElement], stride: u32) -> Result<InputLayoutId, GsError> {
        let attributes = elements
            .iter()
            .enumerate()
            .map(|(location, element)| wgpu::VertexAttribute {
                format: map_vertex_format(element.format),
                offset: u64::from(element.offset),
                shader_location: location as u32,
            })
            .collect();
        Ok(self.input_layouts.insert(StoredInputLayout { attributes, stride }))
    }

    fn create_blend_state(&mut self, desc: &BlendDesc) -> Result<BlendStateId, GsError> {
        let uses_dual_source = [desc.src, desc.dst, desc.src_alpha, desc.dst_alpha].iter().any(|f| {
            matches!(
                f,
                BlendFactor::Src1Color | BlendFactor::InvSrc1Color | BlendFactor::Src1Alpha | BlendFactor::InvSrc1Alpha
            )
        });
        if desc.enable && uses_dual_source && !self.features.dual_source_blend {
            return Err(GsError::Unsupported("dual-source blending"));
        }
        Ok(self.blend_states.insert(*desc))
    }

    fn create_depth_stencil_state(&mut self, desc: &DepthStencilDesc) -> Result<DepthStencilStateId, GsError> {
        Ok(self.depth_stencil_states.insert(*desc))
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerId, GsError> {
        let sampler = self.device.create_sampler(&map_sampler_desc(desc));
        Ok(self.samplers.insert(Arc::new(sampler)))
    }

    fn destroy_input_layout(&mut self, layout: InputLayoutId) {
        self.input_layouts.remove(layout);
    }

    fn destroy_blend_state(&mut self, state: BlendStateId) {
        self.blend_states.remove(state);
    }

    fn destroy_depth_stencil_state(&mut self, state: DepthStencilStateId) {
        self.depth_stencil_states.remove(state);
    }

    fn destroy_sampler(&mut self, sampler: SamplerId) {
        self.samplers.remove(sampler);
    }

    fn set_vertex_shader(&mut self, shader: Option<ShaderId>) {
        self.bindings.vs = shader;
    }

    fn set_vs_constant_buffer(&mut self, buffer: Option<BufferId>) {
        self.bindings.vs_cb = buffer;
    }

    fn set_vs_structured_buffer(&mut self, buffer: Option<BufferId>) {
        self.bindings.expand = buffer;
    }

    fn set_pixel_shader(&mut self, shader: Option<ShaderId>) {
        self.bindings.ps = shader;
    }

    fn set_ps_constant_buffer(&mut self, buffer: Option<BufferId>) {
        self.bindings.ps_cb = buffer;
    }

    fn set_ps_shader_resource(&mut self, slot: usize, texture: Option<TextureId>) {
        if let Some(bound) = self.bindings.textures.get_mut(slot) {
            *bound = texture;
        }
    }

    fn set_ps_sampler(&mut self, slot: usize, sampler: Option<SamplerId>) {
        if slot == 0 {
            self.bindings.sampler = sampler;
        }
    }

    fn set_blend_state(&mut self, state: BlendStateId, factor: f32) {
        self.bindings.blend = Some(state);
        self.bindings.blend_factor = factor;
    }

    fn set_depth_stencil_state(&mut self, state: DepthStencilStateId, stencil_ref: u8) {
        self.bindings.depth_stencil = Some(state);
        self.bindings.stencil_ref = stencil_ref;
    }

    fn set_render_targets(&mut self, rt: Option<TextureId>, ds: Option<TextureId>) {
        if self.bindings.targets != (rt, ds) {
            self.end_pass();
            self.bindings.targets = (rt, ds);
        }
    }

    fn set_input_layout(&mut self, layout: Option<InputLayoutId>) {
        self.bindings.layout = layout;
    }

    fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        self.bindings.topology = topology;
    }

    fn set_vertex_buffer(&mut self, buffer: BufferId, _stride: u32) {
        self.bindings.vertex_buffer = Some(buffer);
    }

    fn set_index_buffer(&mut self, buffer: Option<BufferId>) {
        self.bindings.index_buffer = buffer;
    }

    fn set_viewport(&mut self, width: u32, height: u32) {
        self.bindings.viewport = (width, height);
    }

    fn set_scissor(&mut self, rect: IntRect) {
        self.bindings.scissor = rect;
    }

    fn draw(&mut self, vertex_count: u32, first_vertex: u32) {
        let call = DrawCall::Vertices {
            count: vertex_count,
            first: first_vertex,
        };
        if let Err(err) = self.record_draw(call) {
            error!(%err, "dropping draw");
        }
    }

    fn draw_indexed(&mut self, index_count: u32, first_index: u32, base_vertex: u32) {
        let call = DrawCall::Indexed {
            count: index_count,
            first_index,
            base_vertex,
        };
        if let Err(err) = self.record_draw(call) {
            error!(%err, "dropping indexed draw");
        }
    }

    fn clear_render_target(&mut self, texture: TextureId, color: [f32; 4]) {
        let [r, g, b, a] = color.map(f64::from);
        if let Err(err) = self.clear_pass(texture, Some(wgpu::Color { r, g, b, a }), None, None) {
            error!(%texture, %err, "failed to clear render target");
        }
    }

    fn clear_depth(&mut self, texture: TextureId, depth: f32) {
        if let Err(err) = self.clear_pass(texture, None, Some(depth), None) {
            error!(%texture, %err, "failed to clear depth");
        }
    }

    fn clear_stencil(&mut self, texture: TextureId, value: u8) {
        if let Err(err) = self.clear_pass(texture, None, None, Some(u32::from(value))) {
            error!(%texture, %err, "failed to clear stencil");
        }
    }

    fn invalidate(&mut self, texture: TextureId) {
        // Passes always load; nothing to discard.
        trace!(%texture, "invalidate");
    }

    fn copy_texture_region(&mut self, src: TextureId, dst: TextureId, rect: Option<IntRect>, dst_x: u32, dst_y: u32) {
        if let Err(err) = self.copy_region(src, dst, rect, dst_x, dst_y) {
            error!(%src, %dst, %err, "texture copy failed");
        }
    }

    fn set_compute_shader(&mut self, shader: Option<ShaderId>) {
        self.bindings.cs = shader;
    }

    fn set_cs_constant_buffer(&mut self, buffer: Option<BufferId>) {
        self.bindings.cs_cb = buffer;
    }

    fn set_cs_resources(&mut self, src: Option<TextureId>, dst: Option<TextureId>) {
        self.bindings.cs_src = src;
        self.bindings.cs_dst = dst;
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        if let Err(err) = self.record_dispatch(x, y, z) {
            error!(%err, "dropping dispatch");
        }
    }

    fn push_debug_group(&mut self, label: &str) {
        self.end_pass();
        self.encoder().push_debug_group(label);
        self.debug_depth += 1;
    }

    fn pop_debug_group(&mut self) {
        if self.debug_depth == 0 {
            return;
        }
        self.end_pass();
        self.encoder().pop_debug_group();
        self.debug_depth -= 1;
    }

    fn insert_debug_marker(&mut self, label: &str) {
        self.end_pass();
        self.encoder().insert_debug_marker(label);
    }

    fn has_surface(&self) -> bool {
        self.surface.is_some()
    }

    fn surface_size(&self) -> (u32, u32) {
        self.surface
            .as_ref()
            .map_or((0, 0), |s| (s.config.width, s.config.height))
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        let Some(state) = self.surface.as_mut() else {
            return;
        };
        if let Some((id, _)) = state.current.take() {
            self.textures.remove(id);
        }
        state.config.width = width.max(1);
        state.config.height = height.max(1);
        state.surface.configure(&self.device, &state.config);
    }

    fn surface_texture(&mut self) -> Result<TextureId, GsError> {
        self.acquire_surface_texture()
    }

    fn present(&mut self, vsync: bool) -> Result<(), GsError> {
        self.submit();
        let Some(state) = self.surface.as_mut() else {
            return Err(GsError::Unsupported("presentation without a surface"));
        };
        let (id, frame) = state
            .current
            .take()
            .ok_or_else(|| GsError::Backend("present without an acquired surface texture".into()))?;
        self.textures.remove(id);
        frame.present();

        let mode = if vsync {
            wgpu::PresentMode::AutoVsync
        } else {
            wgpu::PresentMode::AutoNoVsync
        };
        if let Some(state) = self.surface.as_mut() {
            if state.config.present_mode != mode {
                state.config.present_mode = mode;
                state.surface.configure(&self.device, &state.config);
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), GsError> {
        self.submit();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ranges_widen_to_copy_alignment() {
        assert_eq!(aligned_range(6, 2, 64), 4..8);
        assert_eq!(aligned_range(0, 6, 64), 0..8);
        assert_eq!(aligned_range(60, 6, 64), 60..64);
    }

    #[test]
    fn scissor_is_clamped_to_target() {
        let rect = clamp_scissor(IntRect::new(-4, 2, 700, 500), 640, 448);
        assert_eq!(rect, IntRect::new(0, 2, 640, 448));
    }

    #[test]
    fn disabled_blend_has_no_equation() {
        let desc = BlendDesc::opaque(ColorMask::RGB);
        assert_eq!(map_blend_state(&desc), None);
        assert_eq!(map_color_writes(desc.write_mask), wgpu::ColorWrites::COLOR);
    }

    #[test]
    fn anisotropy_needs_linear_filters() {
        let mut desc = SamplerDesc::clamped(FilterMode::Linear);
        desc.max_anisotropy = 8;
        assert_eq!(map_sampler_desc(&desc).anisotropy_clamp, 8);
        desc.mip_filter = FilterMode::Point;
        assert_eq!(map_sampler_desc(&desc).anisotropy_clamp, 1);
    }

    #[test]
    fn macros_become_constants() {
        let mut macros = ShaderMacros::new();
        macros.add("PS_TFX", 4);
        let wgsl = wgsl_with_macros("fn main() {}", &macros);
        assert_eq!(wgsl, "const PS_TFX: i32 = 4;\nfn main() {}");
    }
}
