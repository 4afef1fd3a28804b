//! CPU reference context.
//!
//! [`SoftContext`] keeps the full object model of [`ContextState`] and rasterizes
//! triangle draws into an RGBA8 framebuffer. It does not interpret shaders: each
//! fragment takes the texture on unit 0, sampled at the interpolated attribute 1
//! coordinate, or opaque white when the program samples nothing. Rows are stored
//! bottom-up, so `pixel(0, 0)` is the lower-left corner like a GL window.

use super::state::{AttributeBinding, BufferObject, ContextState, DrawPlan, TextureObject};
use super::{
    BindingState, BufferId, BufferTarget, GpuApi, ObjectCounts, ProgramId, ShaderId, TextureFilter,
    TextureId, TextureParameter, UniformLocation, UniformValue, VertexArrayId, VertexAttribute,
};
use crate::error::ApiErrorCode;
use crate::reflect::ShaderStage;

const POSITION_ATTRIBUTE: u32 = 0;
const TEXCOORD_ATTRIBUTE: u32 = 1;

#[derive(Debug, Clone, Copy)]
struct RasterVertex {
    x: f32,
    y: f32,
    u: f32,
    v: f32,
}

/// A context that renders on the CPU.
#[derive(Debug)]
pub struct SoftContext {
    state: ContextState,
    width: u32,
    height: u32,
    framebuffer: Vec<u8>,
}

impl SoftContext {
    /// Creates a context with a `width` x `height` surface, viewport covering it.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            state: ContextState::new(width, height),
            width,
            height,
            framebuffer: vec![0; width as usize * height as usize * 4],
        }
    }

    /// Simulates context loss: every object and binding is gone.
    ///
    /// Handles issued before the loss are never reissued.
    pub fn lose_context(&mut self) {
        log::warn!("soft context lost");
        self.state.lose_everything();
    }

    /// Resizes the surface. The framebuffer is cleared to transparent black.
    pub fn resize_surface(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.framebuffer = vec![0; width as usize * height as usize * 4];
    }

    pub fn surface_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// The pixel at `(x, y)`, counted from the lower-left corner.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 4;
        let px = self.framebuffer.get(i..i + 4)?;
        Some([px[0], px[1], px[2], px[3]])
    }

    /// Raw framebuffer, bottom row first.
    pub fn framebuffer(&self) -> &[u8] {
        &self.framebuffer
    }

    /// Reads a float member back out of a program's uniform block.
    pub fn uniform_f32(&self, program: ProgramId, name: &str) -> Option<f32> {
        self.state.uniform_f32(program, name)
    }

    fn rasterize(&mut self, plan: &DrawPlan, indices: &[u32]) {
        let position = plan
            .attributes
            .iter()
            .find(|b| b.attribute.index == POSITION_ATTRIBUTE);
        let texcoord = plan
            .attributes
            .iter()
            .find(|b| b.attribute.index == TEXCOORD_ATTRIBUTE);
        let Some(position) = position else {
            self.state
                .record_error(ApiErrorCode::InvalidOperation, "draw: no position attribute");
            return;
        };

        let mut vertices = Vec::with_capacity(indices.len());
        for &index in indices {
            let pos = fetch(&self.state, position, index);
            let uv = match texcoord {
                Some(binding) => fetch(&self.state, binding, index),
                None => Some([0.0; 4]),
            };
            let (Some(pos), Some(uv)) = (pos, uv) else {
                self.state
                    .record_error(ApiErrorCode::InvalidOperation, "draw: vertex fetch out of range");
                return;
            };
            vertices.push(self.to_window(pos, uv));
        }

        let texture = plan
            .textures
            .iter()
            .find(|(unit, _)| *unit == 0)
            .and_then(|(_, id)| self.state.textures.get(id));
        let viewport = self.state.viewport;
        let sampler = texture.map(|t| Sampler::new(t, viewport.width, viewport.height));
        let shade = |u: f32, v: f32| match &sampler {
            Some(s) => s.sample(u, v),
            None => [255; 4],
        };

        let mut shaded = Vec::new();
        for tri in vertices.chunks_exact(3) {
            self.cover(tri[0], tri[1], tri[2], &shade, &mut shaded);
        }
        for (offset, rgba) in shaded {
            if let Some(px) = self.framebuffer.get_mut(offset..offset + 4) {
                px.copy_from_slice(&rgba);
            }
        }
    }

    fn to_window(&self, pos: [f32; 4], uv: [f32; 4]) -> RasterVertex {
        let vp = self.state.viewport;
        RasterVertex {
            x: vp.x as f32 + (pos[0] + 1.0) * 0.5 * vp.width as f32,
            y: vp.y as f32 + (pos[1] + 1.0) * 0.5 * vp.height as f32,
            u: uv[0],
            v: uv[1],
        }
    }

    /// Collects `(framebuffer offset, colour)` for every covered pixel center.
    fn cover(
        &self,
        a: RasterVertex,
        b: RasterVertex,
        c: RasterVertex,
        shade: impl Fn(f32, f32) -> [u8; 4],
        out: &mut Vec<(usize, [u8; 4])>,
    ) {
        let area = edge(a, b, c.x, c.y);
        if area == 0.0 {
            return;
        }
        let vp = self.state.viewport;
        let clip_x0 = vp.x.max(0) as f32;
        let clip_y0 = vp.y.max(0) as f32;
        let clip_x1 = ((vp.x as i64 + vp.width as i64).min(self.width as i64)).max(0) as f32;
        let clip_y1 = ((vp.y as i64 + vp.height as i64).min(self.height as i64)).max(0) as f32;

        let x0 = a.x.min(b.x).min(c.x).floor().max(clip_x0) as u32;
        let y0 = a.y.min(b.y).min(c.y).floor().max(clip_y0) as u32;
        let x1 = a.x.max(b.x).max(c.x).ceil().min(clip_x1) as u32;
        let y1 = a.y.max(b.y).max(c.y).ceil().min(clip_y1) as u32;

        for y in y0..y1 {
            for x in x0..x1 {
                let px = x as f32 + 0.5;
                let py = y as f32 + 0.5;
                let w0 = edge(b, c, px, py) / area;
                let w1 = edge(c, a, px, py) / area;
                let w2 = edge(a, b, px, py) / area;
                if w0 < 0.0 || w1 < 0.0 || w2 < 0.0 {
                    continue;
                }
                let u = w0 * a.u + w1 * b.u + w2 * c.u;
                let v = w0 * a.v + w1 * b.v + w2 * c.v;
                let offset = (y as usize * self.width as usize + x as usize) * 4;
                out.push((offset, shade(u, v)));
            }
        }
    }
}

fn edge(a: RasterVertex, b: RasterVertex, px: f32, py: f32) -> f32 {
    (b.x - a.x) * (py - a.y) - (b.y - a.y) * (px - a.x)
}

/// Reads up to four float components of `vertex` from the attribute's buffer.
fn fetch(state: &ContextState, binding: &AttributeBinding, vertex: u32) -> Option<[f32; 4]> {
    let BufferObject { data, .. } = state.buffers.get(&binding.buffer)?;
    let attribute = binding.attribute;
    let stride = match attribute.stride {
        0 => attribute.byte_size() as usize,
        stride => stride as usize,
    };
    let start = attribute.offset as usize + vertex as usize * stride;
    let bytes = data.get(start..start + attribute.byte_size() as usize)?;

    let mut out = [0.0, 0.0, 0.0, 1.0];
    for (slot, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        *slot = bytemuck::pod_read_unaligned(chunk);
    }
    Some(out)
}

struct Sampler<'a> {
    texture: &'a TextureObject,
    filter: TextureFilter,
}

impl<'a> Sampler<'a> {
    /// Picks the magnification filter when the texture is no larger than the viewport.
    fn new(texture: &'a TextureObject, viewport_width: u32, viewport_height: u32) -> Self {
        let magnified = texture.width <= viewport_width && texture.height <= viewport_height;
        let filter = if magnified {
            texture.mag_filter
        } else {
            texture.min_filter
        };
        Self { texture, filter }
    }

    fn texel(&self, x: i64, y: i64) -> [f32; 4] {
        let w = self.texture.width as i64;
        let h = self.texture.height as i64;
        let x = x.clamp(0, w - 1) as usize;
        let y = y.clamp(0, h - 1) as usize;
        let i = (y * w as usize + x) * 4;
        match self.texture.pixels.get(i..i + 4) {
            Some(px) => [px[0] as f32, px[1] as f32, px[2] as f32, px[3] as f32],
            None => [0.0; 4],
        }
    }

    fn sample(&self, u: f32, v: f32) -> [u8; 4] {
        let w = self.texture.width as f32;
        let h = self.texture.height as f32;
        let texel = match self.filter {
            TextureFilter::Nearest => self.texel((u * w).floor() as i64, (v * h).floor() as i64),
            TextureFilter::Linear => {
                let fx = u * w - 0.5;
                let fy = v * h - 0.5;
                let x0 = fx.floor();
                let y0 = fy.floor();
                let tx = fx - x0;
                let ty = fy - y0;
                let (x0, y0) = (x0 as i64, y0 as i64);
                let t00 = self.texel(x0, y0);
                let t10 = self.texel(x0 + 1, y0);
                let t01 = self.texel(x0, y0 + 1);
                let t11 = self.texel(x0 + 1, y0 + 1);
                let mut out = [0.0; 4];
                for c in 0..4 {
                    let top = t00[c] + (t10[c] - t00[c]) * tx;
                    let bottom = t01[c] + (t11[c] - t01[c]) * tx;
                    out[c] = top + (bottom - top) * ty;
                }
                out
            }
        };
        texel.map(|c| c.round().clamp(0.0, 255.0) as u8)
    }
}

impl GpuApi for SoftContext {
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
        self.state.link_program(program)
    }

    fn delete_program(&mut self, program: ProgramId) {
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
        self.state.delete_buffer(buffer)
    }

    fn vertex_attrib_pointer(&mut self, attribute: &VertexAttribute) {
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
        self.state.delete_texture(texture)
    }

    fn read_texture(&mut self, texture: TextureId) -> Option<Vec<u8>> {
        self.state.read_texture(texture)
    }

    fn viewport(&mut self, x: i32, y: i32, width: u32, height: u32) {
        self.state.set_viewport(x, y, width, height)
    }

    fn clear_color(&mut self, rgba: [f32; 4]) {
        self.state.clear_color = rgba;
    }

    fn clear(&mut self) {
        let rgba = self
            .state
            .clear_color
            .map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8);
        for px in self.framebuffer.chunks_exact_mut(4) {
            px.copy_from_slice(&rgba);
        }
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
        let indices: Vec<u32> = (first..first + count).collect();
        self.rasterize(&plan, &indices);
    }

    fn draw_elements(&mut self, count: u32) {
        let Some(plan) = self.state.plan_draw(Some(count), "draw_elements") else {
            return;
        };
        let indices: Vec<u32> = plan
            .element_buffer
            .and_then(|id| self.state.buffers.get(&id))
            .map(|buffer| {
                buffer
                    .data
                    .chunks_exact(4)
                    .take(count as usize)
                    .map(bytemuck::pod_read_unaligned)
                    .collect()
            })
            .unwrap_or_default();
        self.rasterize(&plan, &indices);
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

#[cfg(test)]
mod tests {
    use super::*;

    const VERTEX: &str = include_str!("../shaders/quad.vert.wgsl");
    const FRAGMENT: &str = include_str!("../shaders/texture.frag.wgsl");

    #[rustfmt::skip]
    const QUAD: [f32; 20] = [
         1.0,  1.0, 0.0, 1.0, 1.0,
         1.0, -1.0, 0.0, 1.0, 0.0,
        -1.0, -1.0, 0.0, 0.0, 0.0,
        -1.0,  1.0, 0.0, 0.0, 1.0,
    ];
    const INDICES: [u32; 6] = [0, 1, 3, 1, 2, 3];

    fn program(ctx: &mut SoftContext) -> ProgramId {
        let vs = ctx.create_shader(ShaderStage::Vertex);
        let fs = ctx.create_shader(ShaderStage::Fragment);
        ctx.compile_shader(vs, VERTEX).unwrap();
        ctx.compile_shader(fs, FRAGMENT).unwrap();
        let program = ctx.create_program();
        ctx.attach_shader(program, vs);
        ctx.attach_shader(program, fs);
        ctx.link_program(program).unwrap();
        program
    }

    fn quad(ctx: &mut SoftContext) -> VertexArrayId {
        let vao = ctx.create_vertex_array();
        ctx.bind_vertex_array(Some(vao));
        let vbo = ctx.create_buffer();
        ctx.bind_buffer(BufferTarget::Array, Some(vbo));
        ctx.buffer_data(BufferTarget::Array, bytemuck::cast_slice(&QUAD));
        let ebo = ctx.create_buffer();
        ctx.bind_buffer(BufferTarget::ElementArray, Some(ebo));
        ctx.buffer_data(BufferTarget::ElementArray, bytemuck::cast_slice(&INDICES));
        ctx.vertex_attrib_pointer(&VertexAttribute::new(0, 3, 20, 0));
        ctx.enable_vertex_attrib_array(0);
        ctx.vertex_attrib_pointer(&VertexAttribute::new(1, 2, 20, 12));
        ctx.enable_vertex_attrib_array(1);
        ctx.bind_buffer(BufferTarget::Array, None);
        vao
    }

    #[test]
    fn clear_fills_the_surface() {
        let mut ctx = SoftContext::new(3, 2);
        ctx.clear_color([1.0, 0.0, 0.0, 1.0]);
        ctx.clear();
        assert_eq!(ctx.pixel(2, 1), Some([255, 0, 0, 255]));
        assert_eq!(ctx.pixel(3, 0), None);
    }

    #[test]
    fn textured_quad_covers_the_viewport() {
        let mut ctx = SoftContext::new(4, 4);
        let program = program(&mut ctx);
        quad(&mut ctx);

        // Left column blue, right column green.
        let pixels = [0, 0, 255, 255, 0, 255, 0, 255, 0, 0, 255, 255, 0, 255, 0, 255];
        let texture = ctx.create_texture();
        ctx.bind_texture(Some(texture));
        ctx.tex_parameter(TextureParameter::MagFilter(TextureFilter::Nearest));
        ctx.tex_image_2d(2, 2, &pixels);

        ctx.use_program(Some(program));
        ctx.draw_elements(6);
        assert_eq!(ctx.take_error(), None);

        assert_eq!(ctx.pixel(0, 0), Some([0, 0, 255, 255]));
        assert_eq!(ctx.pixel(3, 3), Some([0, 255, 0, 255]));
    }

    #[test]
    fn draw_without_sampled_texture_is_rejected() {
        let mut ctx = SoftContext::new(2, 2);
        let program = program(&mut ctx);
        quad(&mut ctx);
        ctx.use_program(Some(program));
        ctx.draw_elements(6);
        assert_eq!(ctx.take_error(), Some(ApiErrorCode::InvalidOperation));
        assert_eq!(ctx.pixel(0, 0), Some([0, 0, 0, 0]));
    }

    #[test]
    fn draw_past_the_element_buffer_is_rejected() {
        let mut ctx = SoftContext::new(2, 2);
        let program = program(&mut ctx);
        quad(&mut ctx);
        let texture = ctx.create_texture();
        ctx.bind_texture(Some(texture));
        ctx.tex_image_2d(1, 1, &[9, 9, 9, 255]);
        ctx.use_program(Some(program));
        ctx.draw_elements(7);
        assert_eq!(ctx.take_error(), Some(ApiErrorCode::InvalidOperation));
    }

    #[test]
    fn draw_arrays_past_the_vertex_buffer_is_rejected() {
        let mut ctx = SoftContext::new(2, 2);
        let program = program(&mut ctx);
        quad(&mut ctx);
        let texture = ctx.create_texture();
        ctx.bind_texture(Some(texture));
        ctx.tex_image_2d(1, 1, &[9, 9, 9, 255]);
        ctx.use_program(Some(program));

        ctx.draw_arrays(0, u32::MAX);
        assert_eq!(ctx.take_error(), Some(ApiErrorCode::InvalidOperation));
        ctx.draw_arrays(2, 3);
        assert_eq!(ctx.take_error(), Some(ApiErrorCode::InvalidOperation));
        assert_eq!(ctx.pixel(0, 0), Some([0, 0, 0, 0]));

        ctx.draw_arrays(1, 3);
        assert_eq!(ctx.take_error(), None);
    }

    #[test]
    fn lost_context_forgets_objects() {
        let mut ctx = SoftContext::new(2, 2);
        program(&mut ctx);
        assert_eq!(ctx.object_counts().programs, 1);
        ctx.lose_context();
        assert_eq!(ctx.object_counts().total(), 0);
        assert!(ctx.binding_state().is_baseline());
    }
}
