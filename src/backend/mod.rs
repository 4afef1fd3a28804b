//! The immediate-mode rendering API and its two contexts.
//!
//! [`GpuApi`] is a GL-shaped interface over opaque handles. All binding state (the
//! current program, vertex array, array buffer, active texture unit and the texture
//! bound to each unit) lives inside the context object that implements it. Nothing
//! is process-global, so any number of contexts can coexist.
//!
//! - [`SoftContext`] runs entirely on the CPU. It tracks every object and rasterizes
//!   draws into an RGBA8 framebuffer, which makes it the context used by tests.
//! - [`GpuContext`] drives a real device through wgpu.
//!
//! Failed calls never panic. Like GL, they record an [`ApiErrorCode`] that stays
//! set until [`GpuApi::take_error`] reads it.

mod gpu;
mod soft;
mod state;

use std::num::NonZeroU32;

pub use gpu::GpuContext;
pub use soft::SoftContext;

use crate::error::{ApiErrorCode, GpuApiError};
use crate::reflect::{ShaderStage, ValueType};

/// Number of texture units a context exposes.
pub const MAX_TEXTURE_UNITS: u32 = 16;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(NonZeroU32);

        impl $name {
            /// The raw, always non-zero handle value.
            pub fn get(self) -> u32 {
                self.0.get()
            }
        }
    };
}

handle!(
    /// A shader object.
    ShaderId
);
handle!(
    /// A program object.
    ProgramId
);
handle!(
    /// A vertex array object.
    VertexArrayId
);
handle!(
    /// A vertex or index buffer object.
    BufferId
);
handle!(
    /// A 2D texture object.
    TextureId
);

/// Buffer binding points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferTarget {
    /// Vertex data, captured by [`GpuApi::vertex_attrib_pointer`].
    Array,
    /// Index data, recorded in the bound vertex array.
    ElementArray,
}

/// Texture sampling filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFilter {
    Nearest,
    Linear,
}

/// A texture parameter write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureParameter {
    MinFilter(TextureFilter),
    MagFilter(TextureFilter),
}

/// One float32 vertex attribute: `(index, components, float32, normalized=false, stride, offset)`.
///
/// `stride` and `offset` are in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub index: u32,
    pub components: u32,
    pub stride: u32,
    pub offset: u32,
}

impl VertexAttribute {
    pub const fn new(index: u32, components: u32, stride: u32, offset: u32) -> Self {
        Self {
            index,
            components,
            stride,
            offset,
        }
    }

    /// Size of one element of this attribute in bytes.
    pub const fn byte_size(&self) -> u32 {
        self.components * 4
    }
}

/// A value written to a uniform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    Float(f32),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    Int(i32),
    Uint(u32),
}

impl UniformValue {
    /// The shader-side type this value can be written to.
    pub fn value_type(&self) -> ValueType {
        match self {
            UniformValue::Float(_) => ValueType::Float { components: 1 },
            UniformValue::Vec2(_) => ValueType::Float { components: 2 },
            UniformValue::Vec3(_) => ValueType::Float { components: 3 },
            UniformValue::Vec4(_) => ValueType::Float { components: 4 },
            UniformValue::Int(_) => ValueType::Sint { components: 1 },
            UniformValue::Uint(_) => ValueType::Uint { components: 1 },
        }
    }

    /// Little-endian bytes as laid out in a uniform block.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            UniformValue::Float(v) => bytemuck::bytes_of(v).to_vec(),
            UniformValue::Vec2(v) => bytemuck::cast_slice(v).to_vec(),
            UniformValue::Vec3(v) => bytemuck::cast_slice(v).to_vec(),
            UniformValue::Vec4(v) => bytemuck::cast_slice(v).to_vec(),
            UniformValue::Int(v) => bytemuck::bytes_of(v).to_vec(),
            UniformValue::Uint(v) => bytemuck::bytes_of(v).to_vec(),
        }
    }
}

impl From<f32> for UniformValue {
    fn from(v: f32) -> Self {
        UniformValue::Float(v)
    }
}

impl From<glam::Vec2> for UniformValue {
    fn from(v: glam::Vec2) -> Self {
        UniformValue::Vec2(v.to_array())
    }
}

impl From<glam::Vec3> for UniformValue {
    fn from(v: glam::Vec3) -> Self {
        UniformValue::Vec3(v.to_array())
    }
}

impl From<glam::Vec4> for UniformValue {
    fn from(v: glam::Vec4) -> Self {
        UniformValue::Vec4(v.to_array())
    }
}

impl From<i32> for UniformValue {
    fn from(v: i32) -> Self {
        UniformValue::Int(v)
    }
}

impl From<u32> for UniformValue {
    fn from(v: u32) -> Self {
        UniformValue::Uint(v)
    }
}

/// A resolved uniform: valid only for the program it was queried from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformLocation {
    pub(crate) program: ProgramId,
    pub(crate) offset: u32,
    pub(crate) ty: ValueType,
}

impl UniformLocation {
    pub fn program(&self) -> ProgramId {
        self.program
    }

    /// Byte offset of the member inside the program's uniform block.
    pub fn offset(&self) -> u32 {
        self.offset
    }
}

/// Snapshot of a context's binding points.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BindingState {
    pub program: Option<ProgramId>,
    pub vertex_array: Option<VertexArrayId>,
    pub array_buffer: Option<BufferId>,
    pub active_unit: u32,
    /// `(unit, texture)` pairs, sorted by unit.
    pub textures: Vec<(u32, TextureId)>,
}

impl BindingState {
    /// Everything unbound and unit 0 active.
    pub fn is_baseline(&self) -> bool {
        *self == BindingState::default()
    }
}

/// Live object counts, per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjectCounts {
    pub shaders: usize,
    pub programs: usize,
    pub vertex_arrays: usize,
    pub buffers: usize,
    pub textures: usize,
}

impl ObjectCounts {
    pub fn total(&self) -> usize {
        self.shaders + self.programs + self.vertex_arrays + self.buffers + self.textures
    }
}

/// A GL-shaped immediate-mode rendering context.
///
/// Operations act on the object bound to the relevant binding point, exactly like
/// their GL namesakes. Invalid calls record an error code instead of failing loudly.
pub trait GpuApi {
    fn create_shader(&mut self, stage: ShaderStage) -> ShaderId;
    /// Compiles `source` into `shader`. The error string is the info log.
    fn compile_shader(&mut self, shader: ShaderId, source: &str) -> Result<(), String>;
    /// Deletes `shader`, or flags it for deletion while it is still attached.
    fn delete_shader(&mut self, shader: ShaderId);

    fn create_program(&mut self) -> ProgramId;
    fn attach_shader(&mut self, program: ProgramId, shader: ShaderId);
    fn detach_shader(&mut self, program: ProgramId, shader: ShaderId);
    /// Links the attached shaders. The error string is the info log.
    fn link_program(&mut self, program: ProgramId) -> Result<(), String>;
    fn delete_program(&mut self, program: ProgramId);
    fn use_program(&mut self, program: Option<ProgramId>);
    fn uniform_location(&mut self, program: ProgramId, name: &str) -> Option<UniformLocation>;
    /// Writes `value` into the current program's uniform block.
    fn set_uniform(&mut self, location: &UniformLocation, value: UniformValue);

    fn create_vertex_array(&mut self) -> VertexArrayId;
    fn bind_vertex_array(&mut self, vertex_array: Option<VertexArrayId>);
    fn delete_vertex_array(&mut self, vertex_array: VertexArrayId);

    fn create_buffer(&mut self) -> BufferId;
    fn bind_buffer(&mut self, target: BufferTarget, buffer: Option<BufferId>);
    fn buffer_data(&mut self, target: BufferTarget, data: &[u8]);
    fn delete_buffer(&mut self, buffer: BufferId);
    /// Records `attribute` in the bound vertex array, sourced from the bound array buffer.
    fn vertex_attrib_pointer(&mut self, attribute: &VertexAttribute);
    fn enable_vertex_attrib_array(&mut self, index: u32);

    fn active_texture(&mut self, unit: u32);
    fn create_texture(&mut self) -> TextureId;
    /// Binds `texture` to the active unit.
    fn bind_texture(&mut self, texture: Option<TextureId>);
    fn tex_parameter(&mut self, parameter: TextureParameter);
    /// Uploads tightly packed RGBA8 rows, first row first, to the bound texture.
    fn tex_image_2d(&mut self, width: u32, height: u32, pixels: &[u8]);
    fn delete_texture(&mut self, texture: TextureId);
    /// Reads back the texels of `texture` in upload order.
    fn read_texture(&mut self, texture: TextureId) -> Option<Vec<u8>>;

    fn viewport(&mut self, x: i32, y: i32, width: u32, height: u32);
    fn clear_color(&mut self, rgba: [f32; 4]);
    fn clear(&mut self);
    /// Draws `count` vertices as a triangle list, starting at `first`.
    fn draw_arrays(&mut self, first: u32, count: u32);
    /// Draws `count` u32 indices from the bound vertex array's element buffer as a triangle list.
    fn draw_elements(&mut self, count: u32);

    /// Returns and clears the recorded error, if any.
    fn take_error(&mut self) -> Option<ApiErrorCode>;
    fn binding_state(&self) -> BindingState;
    fn object_counts(&self) -> ObjectCounts;
}

/// Turns a pending context error into a [`GpuApiError`] tagged with `operation`.
pub fn check_error(ctx: &mut impl GpuApi, operation: &str) -> Result<(), GpuApiError> {
    match ctx.take_error() {
        Some(code) => {
            log::error!("{operation}: gpu error {code}");
            Err(GpuApiError {
                operation: operation.to_owned(),
                code,
            })
        }
        None => Ok(()),
    }
}

/// Allocates monotonically increasing, never-zero handle values.
#[derive(Debug)]
pub(crate) struct HandleAllocator {
    next: u32,
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl HandleAllocator {
    fn next(&mut self) -> NonZeroU32 {
        let id = NonZeroU32::new(self.next).unwrap_or(NonZeroU32::MIN);
        self.next = self.next.wrapping_add(1).max(1);
        id
    }

    pub(crate) fn shader(&mut self) -> ShaderId {
        ShaderId(self.next())
    }

    pub(crate) fn program(&mut self) -> ProgramId {
        ProgramId(self.next())
    }

    pub(crate) fn vertex_array(&mut self) -> VertexArrayId {
        VertexArrayId(self.next())
    }

    pub(crate) fn buffer(&mut self) -> BufferId {
        BufferId(self.next())
    }

    pub(crate) fn texture(&mut self) -> TextureId {
        TextureId(self.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_never_zero_and_unique() {
        let mut alloc = HandleAllocator::default();
        let a = alloc.buffer();
        let b = alloc.texture();
        assert_ne!(a.get(), 0);
        assert_ne!(a.get(), b.get());
    }

    #[test]
    fn uniform_value_bytes_are_little_endian_floats() {
        let bytes = UniformValue::Vec2([1.0, 2.0]).to_bytes();
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[0..4], &1.0f32.to_le_bytes());
        assert_eq!(&bytes[4..8], &2.0f32.to_le_bytes());
        assert_eq!(UniformValue::from(glam::Vec2::new(1.0, 2.0)), UniformValue::Vec2([1.0, 2.0]));
    }

    #[test]
    fn default_binding_state_is_baseline() {
        assert!(BindingState::default().is_baseline());
        let bound = BindingState {
            active_unit: 1,
            ..Default::default()
        };
        assert!(!bound.is_baseline());
    }
}
