//! Hardware context on top of wgpu.
//!
//! [`GpuContext`] keeps the same object model as the soft context and mirrors it into
//! wgpu resources lazily: buffers, textures and uniform blocks are (re)uploaded at draw
//! time when their revision changed, and render pipelines are built per program and
//! vertex layout the first time they are drawn with.
//!
//! Every call is executed immediately. `clear` and each draw record their own command
//! encoder and submit it before returning.
//!
//! # Render targets
//!
//! A context either presents to a window surface ([`GpuContext::new`], bracket each frame
//! with [`begin_frame`](GpuContext::begin_frame) and [`end_frame`](GpuContext::end_frame))
//! or renders into an off-screen RGBA8 texture ([`GpuContext::headless`]) that can be read
//! back with [`read_target`](GpuContext::read_target).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use wgpu::util::DeviceExt;
use winit::window::Window;

use super::state::{ContextState, DrawPlan, slot_stride};
use super::{
    BindingState, BufferId, BufferTarget, GpuApi, ObjectCounts, ProgramId, ShaderId, TextureFilter,
    TextureId, TextureParameter, UniformLocation, UniformValue, VertexArrayId, VertexAttribute,
};
use crate::error::{ApiErrorCode, ContextError};
use crate::reflect::{self, ShaderStage};

const TEXTURE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
const READBACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Vertex layout of one attribute slot, as baked into a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SlotLayout {
    location: u32,
    components: u32,
    stride: u32,
}

struct ProgramMirror {
    vertex: wgpu::ShaderModule,
    fragment: wgpu::ShaderModule,
    vertex_entry: String,
    fragment_entry: String,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    uniform_buffer: Option<wgpu::Buffer>,
    uploaded_revision: Option<u64>,
    pipelines: HashMap<Vec<SlotLayout>, wgpu::RenderPipeline>,
}

struct BufferMirror {
    revision: u64,
    buffer: wgpu::Buffer,
}

struct TextureMirror {
    revision: u64,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

enum RenderTarget {
    Surface {
        surface: wgpu::Surface<'static>,
        config: wgpu::SurfaceConfiguration,
        frame: Option<(wgpu::SurfaceTexture, wgpu::TextureView)>,
    },
    Offscreen {
        texture: wgpu::Texture,
        view: wgpu::TextureView,
    },
}

/// A rendering context backed by a wgpu device.
pub struct GpuContext {
    /// The logical GPU device.
    pub device: wgpu::Device,
    /// The command queue every call submits to.
    pub queue: wgpu::Queue,
    target: RenderTarget,
    format: wgpu::TextureFormat,
    state: ContextState,
    programs: HashMap<ProgramId, ProgramMirror>,
    buffers: HashMap<BufferId, BufferMirror>,
    textures: HashMap<TextureId, TextureMirror>,
    samplers: HashMap<(TextureFilter, TextureFilter), wgpu::Sampler>,
}

impl GpuContext {
    /// Creates a context presenting to `window`.
    ///
    /// Picks an sRGB surface format when one is offered and uses Fifo presentation.
    pub fn new(window: Arc<Window>) -> Result<Self, ContextError> {
        let size = window.inner_size();

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });
        let surface = instance.create_surface(window)?;

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::default(),
            compatible_surface: Some(&surface),
            force_fallback_adapter: false,
        }))?;
        let (device, queue) = request_device(&adapter)?;

        let surface_caps = surface.get_capabilities(&adapter);
        let format = surface_caps
            .formats
            .iter()
            .find(|f| f.is_srgb())
            .or_else(|| surface_caps.formats.first())
            .copied()
            .ok_or(ContextError::NoSurfaceFormat)?;
        let alpha_mode = surface_caps
            .alpha_modes
            .first()
            .copied()
            .unwrap_or(wgpu::CompositeAlphaMode::Auto);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::Fifo,
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);
        log::info!(
            "gpu context ready: {:?}, {}x{} {:?}",
            adapter.get_info().backend,
            config.width,
            config.height,
            format
        );

        Ok(Self::with_target(
            device,
            queue,
            RenderTarget::Surface {
                surface,
                config,
                frame: None,
            },
            format,
            size.width,
            size.height,
        ))
    }

    /// Creates a context that renders into a `width` x `height` RGBA8 texture.
    pub fn headless(width: u32, height: u32) -> Result<Self, ContextError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::LowPower,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))?;
        let (device, queue) = request_device(&adapter)?;

        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("quadfx offscreen target"),
            size: extent(width.max(1), height.max(1)),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TEXTURE_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        log::info!("headless gpu context ready: {width}x{height}");

        Ok(Self::with_target(
            device,
            queue,
            RenderTarget::Offscreen { texture, view },
            TEXTURE_FORMAT,
            width,
            height,
        ))
    }

    fn with_target(
        device: wgpu::Device,
        queue: wgpu::Queue,
        target: RenderTarget,
        format: wgpu::TextureFormat,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            device,
            queue,
            target,
            format,
            state: ContextState::new(width, height),
            programs: HashMap::new(),
            buffers: HashMap::new(),
            textures: HashMap::new(),
            samplers: HashMap::new(),
        }
    }

    /// Resize the surface. Zero-sized dimensions are ignored (minimized windows).
    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        if let RenderTarget::Surface {
            surface, config, ..
        } = &mut self.target
        {
            config.width = width;
            config.height = height;
            surface.configure(&self.device, config);
        }
    }

    /// Current render target size in pixels.
    pub fn size(&self) -> (u32, u32) {
        match &self.target {
            RenderTarget::Surface { config, .. } => (config.width, config.height),
            RenderTarget::Offscreen { texture, .. } => (texture.width(), texture.height()),
        }
    }

    /// Acquires the next surface texture as the render target.
    ///
    /// Off-screen contexts always have a target and return `Ok(())`.
    pub fn begin_frame(&mut self) -> Result<(), wgpu::SurfaceError> {
        if let RenderTarget::Surface { surface, frame, .. } = &mut self.target {
            let texture = surface.get_current_texture()?;
            let view = texture
                .texture
                .create_view(&wgpu::TextureViewDescriptor::default());
            *frame = Some((texture, view));
        }
        Ok(())
    }

    /// Presents the frame acquired by [`begin_frame`](Self::begin_frame).
    pub fn end_frame(&mut self) {
        if let RenderTarget::Surface { frame, .. } = &mut self.target {
            if let Some((texture, _)) = frame.take() {
                texture.present();
            }
        }
    }

    /// Drops every object, as if the context had been lost, and reconfigures the surface.
    ///
    /// Every previously issued handle becomes invalid. Callers re-create their resources.
    pub fn reset(&mut self) {
        log::warn!("gpu context reset, all objects dropped");
        self.state.lose_everything();
        self.programs.clear();
        self.buffers.clear();
        self.textures.clear();
        if let RenderTarget::Surface {
            surface,
            config,
            frame,
        } = &mut self.target
        {
            *frame = None;
            surface.configure(&self.device, config);
        }
    }

    /// Reads the off-screen target back as tightly packed RGBA8 rows, top row first.
    ///
    /// Returns `None` for surface contexts or when the readback fails.
    pub fn read_target(&mut self) -> Option<Vec<u8>> {
        let RenderTarget::Offscreen { texture, .. } = &self.target else {
            return None;
        };
        read_texture_rgba(&self.device, &self.queue, texture)
    }

    /// Reads a float member back out of a program's uniform block.
    pub fn uniform_f32(&self, program: ProgramId, name: &str) -> Option<f32> {
        self.state.uniform_f32(program, name)
    }

    fn target_view(&self) -> Option<&wgpu::TextureView> {
        match &self.target {
            RenderTarget::Surface { frame, .. } => frame.as_ref().map(|(_, view)| view),
            RenderTarget::Offscreen { view, .. } => Some(view),
        }
    }

    /// Runs `f` inside a validation error scope and records any error under `what`.
    fn scoped<T>(&mut self, what: &str, f: impl FnOnce(&Self) -> T) -> T {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let out = f(self);
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            log::warn!("{what}: {err}");
            self.state.record_error(ApiErrorCode::InvalidOperation, what);
        }
        out
    }

    fn mirror_program(&mut self, program: ProgramId) -> Result<(), String> {
        let object = self
            .state
            .programs
            .get(&program)
            .ok_or_else(|| format!("invalid program handle {}", program.get()))?;
        let interface = object
            .interface
            .as_ref()
            .ok_or_else(|| "program is not linked".to_owned())?;

        let mut sources = object
            .attached
            .iter()
            .filter_map(|id| self.state.shaders.get(id))
            .filter_map(|s| s.compiled.as_ref());
        let vertex_source = sources
            .clone()
            .find(|c| c.stage == ShaderStage::Vertex)
            .map(|c| c.source.clone())
            .ok_or_else(|| "no compiled vertex shader attached".to_owned())?;
        let fragment_source = sources
            .find(|c| c.stage == ShaderStage::Fragment)
            .map(|c| c.source.clone())
            .ok_or_else(|| "no compiled fragment shader attached".to_owned())?;

        let mut entries = Vec::new();
        if interface.uniform_block.is_some() {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: reflect::UNIFORM_BINDING,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            });
        }
        for &unit in &interface.texture_units {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: reflect::texture_binding(unit),
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            });
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: reflect::sampler_binding(unit),
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                count: None,
            });
        }

        let uniform_size = interface
            .uniform_block
            .as_ref()
            .map(|b| u64::from(b.size).next_multiple_of(16));
        let vertex_entry = interface.vertex_entry.clone();
        let fragment_entry = interface.fragment_entry.clone();

        let mirror = self.scoped("link_program", |ctx| {
            let device = &ctx.device;
            let vertex = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("quadfx vertex stage"),
                source: wgpu::ShaderSource::Wgsl(vertex_source.into()),
            });
            let fragment = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("quadfx fragment stage"),
                source: wgpu::ShaderSource::Wgsl(fragment_source.into()),
            });
            let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("quadfx program bind group layout"),
                entries: &entries,
            });
            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("quadfx program pipeline layout"),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });
            let uniform_buffer = uniform_size.map(|size| {
                device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("quadfx uniform block"),
                    size,
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                })
            });
            ProgramMirror {
                vertex,
                fragment,
                vertex_entry,
                fragment_entry,
                bind_group_layout,
                pipeline_layout,
                uniform_buffer,
                uploaded_revision: None,
                pipelines: HashMap::new(),
            }
        });
        self.programs.insert(program, mirror);
        Ok(())
    }

    fn sync_buffer(&mut self, id: BufferId) {
        let Some(object) = self.state.buffers.get(&id) else {
            return;
        };
        if self
            .buffers
            .get(&id)
            .is_some_and(|m| m.revision == object.revision)
        {
            return;
        }
        let mut contents = object.data.clone();
        let padded = contents
            .len()
            .max(4)
            .next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT as usize);
        contents.resize(padded, 0);
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("quadfx buffer"),
                contents: &contents,
                usage: wgpu::BufferUsages::VERTEX
                    | wgpu::BufferUsages::INDEX
                    | wgpu::BufferUsages::COPY_DST,
            });
        self.buffers.insert(
            id,
            BufferMirror {
                revision: object.revision,
                buffer,
            },
        );
    }

    fn sync_texture(&mut self, id: TextureId) {
        let Some(object) = self.state.textures.get(&id) else {
            return;
        };
        if object.pixels.is_empty() {
            return;
        }
        let stale = match self.textures.get(&id) {
            Some(m) if m.revision == object.revision => return,
            Some(m) => m.texture.width() != object.width || m.texture.height() != object.height,
            None => true,
        };
        if stale {
            let texture = self.device.create_texture(&wgpu::TextureDescriptor {
                label: Some("quadfx texture"),
                size: extent(object.width, object.height),
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: TEXTURE_FORMAT,
                usage: wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::COPY_DST
                    | wgpu::TextureUsages::COPY_SRC,
                view_formats: &[],
            });
            let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
            self.textures.insert(
                id,
                TextureMirror {
                    revision: 0,
                    texture,
                    view,
                },
            );
        }
        if let Some(mirror) = self.textures.get_mut(&id) {
            self.queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture: &mirror.texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                &object.pixels,
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(object.width * 4),
                    rows_per_image: Some(object.height),
                },
                extent(object.width, object.height),
            );
            mirror.revision = object.revision;
        }
    }

    fn sync_uniforms(&mut self, program: ProgramId) {
        let (Some(object), Some(mirror)) = (
            self.state.programs.get(&program),
            self.programs.get_mut(&program),
        ) else {
            return;
        };
        if mirror.uploaded_revision == Some(object.revision) {
            return;
        }
        if let Some(buffer) = &mirror.uniform_buffer {
            let mut bytes = object.uniforms.clone();
            bytes.resize(buffer.size() as usize, 0);
            self.queue.write_buffer(buffer, 0, &bytes);
        }
        mirror.uploaded_revision = Some(object.revision);
    }

    fn sampler(&mut self, min: TextureFilter, mag: TextureFilter) -> wgpu::Sampler {
        let device = &self.device;
        self.samplers
            .entry((min, mag))
            .or_insert_with(|| {
                device.create_sampler(&wgpu::SamplerDescriptor {
                    label: Some("quadfx sampler"),
                    address_mode_u: wgpu::AddressMode::ClampToEdge,
                    address_mode_v: wgpu::AddressMode::ClampToEdge,
                    address_mode_w: wgpu::AddressMode::ClampToEdge,
                    mag_filter: filter_mode(mag),
                    min_filter: filter_mode(min),
                    mipmap_filter: wgpu::FilterMode::Nearest,
                    ..Default::default()
                })
            })
            .clone()
    }

    /// Highest vertex index every attribute of `plan` can fetch, plus one.
    fn execute_draw(&mut self, plan: DrawPlan, vertices: std::ops::Range<u32>, indexed: bool) {
        let Some(target_size) = self.target_view().map(|_| self.size()) else {
            self.state
                .record_error(ApiErrorCode::InvalidOperation, "draw: no render target");
            return;
        };
        let Some(viewport) = clamp_viewport(self.state.viewport, target_size) else {
            return;
        };

        for binding in &plan.attributes {
            self.sync_buffer(binding.buffer);
        }
        if let Some(id) = plan.element_buffer {
            self.sync_buffer(id);
        }
        let mut samplers = Vec::with_capacity(plan.textures.len());
        for &(unit, id) in &plan.textures {
            self.sync_texture(id);
            let (min, mag) = self
                .state
                .textures
                .get(&id)
                .map_or((TextureFilter::Nearest, TextureFilter::Linear), |t| {
                    (t.min_filter, t.mag_filter)
                });
            samplers.push((unit, id, self.sampler(min, mag)));
        }
        self.sync_uniforms(plan.program);

        let key: Vec<SlotLayout> = plan
            .attributes
            .iter()
            .map(|b| SlotLayout {
                location: b.attribute.index,
                components: b.attribute.components,
                stride: slot_stride(&b.attribute),
            })
            .collect();

        let needs_pipeline = self
            .programs
            .get(&plan.program)
            .is_some_and(|m| !m.pipelines.contains_key(&key));
        if needs_pipeline {
            let pipeline = self.scoped("create_render_pipeline", |ctx| {
                ctx.programs
                    .get(&plan.program)
                    .map(|m| build_pipeline(&ctx.device, m, &key, ctx.format))
            });
            if let (Some(pipeline), Some(mirror)) = (pipeline, self.programs.get_mut(&plan.program)) {
                mirror.pipelines.insert(key.clone(), pipeline);
            }
        }

        self.scoped("draw", |ctx| {
            let Some(mirror) = ctx.programs.get(&plan.program) else {
                return;
            };
            let Some(pipeline) = mirror.pipelines.get(&key) else {
                return;
            };

            let mut entries = Vec::new();
            if let Some(buffer) = &mirror.uniform_buffer {
                entries.push(wgpu::BindGroupEntry {
                    binding: reflect::UNIFORM_BINDING,
                    resource: buffer.as_entire_binding(),
                });
            }
            for (unit, id, sampler) in &samplers {
                let Some(texture) = ctx.textures.get(id) else {
                    return;
                };
                entries.push(wgpu::BindGroupEntry {
                    binding: reflect::texture_binding(*unit),
                    resource: wgpu::BindingResource::TextureView(&texture.view),
                });
                entries.push(wgpu::BindGroupEntry {
                    binding: reflect::sampler_binding(*unit),
                    resource: wgpu::BindingResource::Sampler(sampler),
                });
            }
            let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("quadfx draw bind group"),
                layout: &mirror.bind_group_layout,
                entries: &entries,
            });

            let Some(view) = ctx.target_view() else {
                return;
            };
            let mut encoder = ctx
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("quadfx draw"),
                });
            {
                let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("quadfx draw pass"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Load,
                            store: wgpu::StoreOp::Store,
                        },
                        depth_slice: None,
                    })],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
                pass.set_pipeline(pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                let [x, y, w, h] = viewport;
                pass.set_viewport(x, y, w, h, 0.0, 1.0);
                for (slot, binding) in plan.attributes.iter().enumerate() {
                    let Some(buffer) = ctx.buffers.get(&binding.buffer) else {
                        return;
                    };
                    let offset = u64::from(binding.attribute.offset);
                    pass.set_vertex_buffer(slot as u32, buffer.buffer.slice(offset..));
                }
                if indexed {
                    let Some(index) = plan.element_buffer.and_then(|id| ctx.buffers.get(&id))
                    else {
                        return;
                    };
                    pass.set_index_buffer(index.buffer.slice(..), wgpu::IndexFormat::Uint32);
                    pass.draw_indexed(vertices, 0, 0..1);
                } else {
                    pass.draw(vertices, 0..1);
                }
            }
            ctx.queue.submit([encoder.finish()]);
        });
    }
}

fn request_device(adapter: &wgpu::Adapter) -> Result<(wgpu::Device, wgpu::Queue), ContextError> {
    let pair = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
        label: Some("quadfx device"),
        required_features: wgpu::Features::empty(),
        required_limits: wgpu::Limits::default(),
        memory_hints: Default::default(),
        trace: Default::default(),
        experimental_features: Default::default(),
    }))?;
    Ok(pair)
}

fn extent(width: u32, height: u32) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width,
        height,
        depth_or_array_layers: 1,
    }
}

fn filter_mode(filter: TextureFilter) -> wgpu::FilterMode {
    match filter {
        TextureFilter::Nearest => wgpu::FilterMode::Nearest,
        TextureFilter::Linear => wgpu::FilterMode::Linear,
    }
}

fn vertex_format(components: u32) -> wgpu::VertexFormat {
    match components {
        1 => wgpu::VertexFormat::Float32,
        2 => wgpu::VertexFormat::Float32x2,
        3 => wgpu::VertexFormat::Float32x3,
        _ => wgpu::VertexFormat::Float32x4,
    }
}

/// GL viewport (origin bottom-left) to a wgpu viewport (origin top-left), clipped to the target.
fn clamp_viewport(
    viewport: super::state::Viewport,
    (target_w, target_h): (u32, u32),
) -> Option<[f32; 4]> {
    let x0 = i64::from(viewport.x).clamp(0, i64::from(target_w));
    let y0 = i64::from(viewport.y).clamp(0, i64::from(target_h));
    let x1 = (i64::from(viewport.x) + i64::from(viewport.width)).clamp(0, i64::from(target_w));
    let y1 = (i64::from(viewport.y) + i64::from(viewport.height)).clamp(0, i64::from(target_h));
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    let top = i64::from(target_h) - y1;
    Some([x0 as f32, top as f32, (x1 - x0) as f32, (y1 - y0) as f32])
}

fn build_pipeline(
    device: &wgpu::Device,
    mirror: &ProgramMirror,
    slots: &[SlotLayout],
    format: wgpu::TextureFormat,
) -> wgpu::RenderPipeline {
    let attributes: Vec<wgpu::VertexAttribute> = slots
        .iter()
        .map(|slot| wgpu::VertexAttribute {
            format: vertex_format(slot.components),
            offset: 0,
            shader_location: slot.location,
        })
        .collect();
    let buffers: Vec<wgpu::VertexBufferLayout<'_>> = slots
        .iter()
        .zip(&attributes)
        .map(|(slot, attribute)| wgpu::VertexBufferLayout {
            array_stride: u64::from(slot.stride),
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: std::slice::from_ref(attribute),
        })
        .collect();

    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("quadfx program pipeline"),
        layout: Some(&mirror.pipeline_layout),
        vertex: wgpu::VertexState {
            module: &mirror.vertex,
            entry_point: Some(&mirror.vertex_entry),
            buffers: &buffers,
            compilation_options: Default::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module: &mirror.fragment,
            entry_point: Some(&mirror.fragment_entry),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend: Some(wgpu::BlendState::REPLACE),
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: Default::default(),
        }),
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            cull_mode: None,
            ..Default::default()
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview: None,
        cache: None,
    })
}

/// Copies an RGBA8 texture into a mappable buffer and returns its tightly packed rows.
fn read_texture_rgba(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    texture: &wgpu::Texture,
) -> Option<Vec<u8>> {
    let width = texture.width();
    let height = texture.height();
    let row = width as usize * 4;
    let padded_row = (row as u32).next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);

    let readback = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("quadfx readback"),
        size: u64::from(padded_row) * u64::from(height),
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("quadfx readback"),
    });
    encoder.copy_texture_to_buffer(
        texture.as_image_copy(),
        wgpu::TexelCopyBufferInfo {
            buffer: &readback,
            layout: wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(padded_row),
                rows_per_image: None,
            },
        },
        extent(width, height),
    );
    queue.submit([encoder.finish()]);

    let slice = readback.slice(..);
    let done = Arc::new(AtomicBool::new(false));
    let ok = Arc::new(AtomicBool::new(false));
    {
        let done = Arc::clone(&done);
        let ok = Arc::clone(&ok);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            ok.store(result.is_ok(), Ordering::Release);
            done.store(true, Ordering::Release);
        });
    }
    let started = Instant::now();
    while !done.load(Ordering::Acquire) {
        if started.elapsed() > READBACK_TIMEOUT {
            log::warn!("texture readback timed out");
            return None;
        }
        let _ = device.poll(wgpu::PollType::Poll);
        std::thread::yield_now();
    }
    if !ok.load(Ordering::Acquire) {
        log::warn!("texture readback failed to map");
        return None;
    }

    let mapped = slice.get_mapped_range();
    let mut pixels = Vec::with_capacity(row * height as usize);
    for chunk in mapped.chunks(padded_row as usize).take(height as usize) {
        pixels.extend_from_slice(&chunk[..row]);
    }
    drop(mapped);
    readback.unmap();
    Some(pixels)
}

impl GpuApi for GpuContext {
    fn create_shader(&mut self, stage: ShaderStage) -> ShaderId {
        self.state.create_shader(stage)
    }

    fn compile_shader(&mut self, shader: ShaderId, source: &str) -> Result<(), String> {
        self.state.compile_shader(shader, source)
    }

    fn delete_shader(&mut self, shader: ShaderId) {
        self.state.delete_shader(shader)
    }

    fn create_program(&mut self) -> ProgramId {
        self.state.create_program()
    }

    fn attach_shader(&mut self, program: ProgramId, shader: ShaderId) {
        self.state.attach_shader(program, shader)
    }

    fn detach_shader(&mut self, program: ProgramId, shader: ShaderId) {
        self.state.detach_shader(program, shader)
    }

    fn link_program(&mut self, program: ProgramId) -> Result<(), String> {
        self.programs.remove(&program);
        self.state.link_program(program)?;
        self.mirror_program(program)
    }

    fn delete_program(&mut self, program: ProgramId) {
        self.programs.remove(&program);
        self.state.delete_program(program)
    }

    fn use_program(&mut self, program: Option<ProgramId>) {
        self.state.use_program(program)
    }

    fn uniform_location(&mut self, program: ProgramId, name: &str) -> Option<UniformLocation> {
        self.state.uniform_location(program, name)
    }

    fn set_uniform(&mut self, location: &UniformLocation, value: UniformValue) {
        self.state.set_uniform(location, value)
    }

    fn create_vertex_array(&mut self) -> VertexArrayId {
        self.state.create_vertex_array()
    }

    fn bind_vertex_array(&mut self, vertex_array: Option<VertexArrayId>) {
        self.state.bind_vertex_array(vertex_array)
    }

    fn delete_vertex_array(&mut self, vertex_array: VertexArrayId) {
        self.state.delete_vertex_array(vertex_array)
    }

    fn create_buffer(&mut self) -> BufferId {
        self.state.create_buffer()
    }

    fn bind_buffer(&mut self, target: BufferTarget, buffer: Option<BufferId>) {
        self.state.bind_buffer(target, buffer)
    }

    fn buffer_data(&mut self, target: BufferTarget, data: &[u8]) {
        self.state.buffer_data(target, data)
    }

    fn delete_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(&buffer);
        self.state.delete_buffer(buffer)
    }

    fn vertex_attrib_pointer(&mut self, attribute: &VertexAttribute) {
        if attribute.stride % wgpu::VERTEX_STRIDE_ALIGNMENT as u32 != 0
            || attribute.offset % 4 != 0
        {
            self.state
                .record_error(ApiErrorCode::InvalidValue, "vertex_attrib_pointer");
            return;
        }
        self.state.vertex_attrib_pointer(attribute)
    }

    fn enable_vertex_attrib_array(&mut self, index: u32) {
        self.state.enable_vertex_attrib_array(index)
    }

    fn active_texture(&mut self, unit: u32) {
        self.state.active_texture(unit)
    }

    fn create_texture(&mut self) -> TextureId {
        self.state.create_texture()
    }

    fn bind_texture(&mut self, texture: Option<TextureId>) {
        self.state.bind_texture(texture)
    }

    fn tex_parameter(&mut self, parameter: TextureParameter) {
        self.state.tex_parameter(parameter)
    }

    fn tex_image_2d(&mut self, width: u32, height: u32, pixels: &[u8]) {
        self.state.tex_image_2d(width, height, pixels)
    }

    fn delete_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture);
        self.state.delete_texture(texture)
    }

    fn read_texture(&mut self, texture: TextureId) -> Option<Vec<u8>> {
        if !self.state.textures.contains_key(&texture) {
            return self.state.read_texture(texture);
        }
        self.sync_texture(texture);
        match self.textures.get(&texture) {
            Some(mirror) => read_texture_rgba(&self.device, &self.queue, &mirror.texture),
            // Nothing uploaded yet.
            None => Some(Vec::new()),
        }
    }

    fn viewport(&mut self, x: i32, y: i32, width: u32, height: u32) {
        self.state.set_viewport(x, y, width, height)
    }

    fn clear_color(&mut self, rgba: [f32; 4]) {
        self.state.clear_color = rgba;
    }

    fn clear(&mut self) {
        if self.target_view().is_none() {
            self.state
                .record_error(ApiErrorCode::InvalidOperation, "clear: no render target");
            return;
        }
        let [r, g, b, a] = self.state.clear_color.map(f64::from);
        self.scoped("clear", |ctx| {
            let Some(view) = ctx.target_view() else {
                return;
            };
            let mut encoder = ctx
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("quadfx clear"),
                });
            encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("quadfx clear pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color { r, g, b, a }),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            ctx.queue.submit([encoder.finish()]);
        });
    }

    fn draw_arrays(&mut self, first: u32, count: u32) {
        let Some(plan) = self.state.plan_draw(None, "draw_arrays") else {
            return;
        };
        let end = u64::from(first) + u64::from(count);
        if end > self.state.vertex_capacity(&plan) {
            self.state
                .record_error(ApiErrorCode::InvalidOperation, "draw_arrays");
            return;
        }
        self.execute_draw(plan, first..first + count, false);
    }

    fn draw_elements(&mut self, count: u32) {
        let Some(plan) = self.state.plan_draw(Some(count), "draw_elements") else {
            return;
        };
        let max_index = plan
            .element_buffer
            .and_then(|id| self.state.buffers.get(&id))
            .and_then(|buffer| {
                buffer
                    .data
                    .chunks_exact(4)
                    .take(count as usize)
                    .map(bytemuck::pod_read_unaligned::<u32>)
                    .max()
            });
        if let Some(max) = max_index {
            if u64::from(max) >= self.state.vertex_capacity(&plan) {
                self.state
                    .record_error(ApiErrorCode::InvalidOperation, "draw_elements");
                return;
            }
        }
        self.execute_draw(plan, 0..count, true);
    }

    fn take_error(&mut self) -> Option<ApiErrorCode> {
        self.state.take_error()
    }

    fn binding_state(&self) -> BindingState {
        self.state.binding_state()
    }

    fn object_counts(&self) -> ObjectCounts {
        self.state.object_counts()
    }
}
