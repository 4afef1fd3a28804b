//! Object tables and binding state shared by both contexts.
//!
//! `ContextState` implements the logical half of every [`GpuApi`](super::GpuApi) call:
//! handle validation, binding-point bookkeeping, compile/link through
//! [`reflect`](crate::reflect), and error recording. Contexts only add what happens on
//! their device (rasterizing, or mirroring objects into wgpu resources).

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::{
    BindingState, BufferId, BufferTarget, HandleAllocator, MAX_TEXTURE_UNITS, ObjectCounts,
    ProgramId, ShaderId, TextureFilter, TextureId, TextureParameter, UniformLocation,
    UniformValue, VertexArrayId, VertexAttribute,
};
use crate::error::ApiErrorCode;
use crate::reflect::{self, CompiledStage, ProgramInterface, ShaderStage, ValueType};

#[derive(Debug)]
pub(crate) struct ShaderObject {
    pub stage: ShaderStage,
    pub compiled: Option<CompiledStage>,
    pub delete_pending: bool,
}

#[derive(Debug, Default)]
pub(crate) struct ProgramObject {
    pub attached: Vec<ShaderId>,
    pub interface: Option<ProgramInterface>,
    pub uniforms: Vec<u8>,
    pub revision: u64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct AttributeBinding {
    pub attribute: VertexAttribute,
    pub buffer: BufferId,
}

#[derive(Debug, Default)]
pub(crate) struct VertexArrayObject {
    pub attributes: BTreeMap<u32, AttributeBinding>,
    pub enabled: BTreeSet<u32>,
    pub element_buffer: Option<BufferId>,
}

#[derive(Debug, Default)]
pub(crate) struct BufferObject {
    pub data: Vec<u8>,
    pub revision: u64,
}

#[derive(Debug)]
pub(crate) struct TextureObject {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    pub min_filter: TextureFilter,
    pub mag_filter: TextureFilter,
    pub revision: u64,
}

impl Default for TextureObject {
    fn default() -> Self {
        // GL defaults, before any parameter call.
        Self {
            width: 0,
            height: 0,
            pixels: Vec::new(),
            min_filter: TextureFilter::Nearest,
            mag_filter: TextureFilter::Linear,
            revision: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Viewport {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Everything a draw needs, validated.
#[derive(Debug, Clone)]
pub(crate) struct DrawPlan {
    pub program: ProgramId,
    pub vertex_array: VertexArrayId,
    /// Program inputs resolved to their sources, by location.
    pub attributes: Vec<AttributeBinding>,
    pub element_buffer: Option<BufferId>,
    /// `(unit, texture)` for every unit the program samples.
    pub textures: Vec<(u32, TextureId)>,
}

#[derive(Debug, Default)]
pub(crate) struct ContextState {
    handles: HandleAllocator,
    error: Option<ApiErrorCode>,

    pub shaders: HashMap<ShaderId, ShaderObject>,
    pub programs: HashMap<ProgramId, ProgramObject>,
    pub vertex_arrays: HashMap<VertexArrayId, VertexArrayObject>,
    pub buffers: HashMap<BufferId, BufferObject>,
    pub textures: HashMap<TextureId, TextureObject>,

    pub current_program: Option<ProgramId>,
    pub vertex_array: Option<VertexArrayId>,
    pub array_buffer: Option<BufferId>,
    pub active_unit: u32,
    pub units: BTreeMap<u32, TextureId>,

    pub viewport: Viewport,
    pub clear_color: [f32; 4],
}

impl ContextState {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            viewport: Viewport {
                x: 0,
                y: 0,
                width,
                height,
            },
            ..Default::default()
        }
    }

    /// Records `code` unless an earlier error is still pending.
    pub fn record_error(&mut self, code: ApiErrorCode, what: &str) {
        log::debug!("{what}: {code}");
        if self.error.is_none() {
            self.error = Some(code);
        }
    }

    pub fn take_error(&mut self) -> Option<ApiErrorCode> {
        self.error.take()
    }

    /// Drops every object and binding, as if the context had been recreated.
    pub fn lose_everything(&mut self) {
        let viewport = self.viewport;
        let clear_color = self.clear_color;
        *self = Self {
            handles: std::mem::take(&mut self.handles),
            viewport,
            clear_color,
            ..Default::default()
        };
    }

    // Shaders and programs

    pub fn create_shader(&mut self, stage: ShaderStage) -> ShaderId {
        let id = self.handles.shader();
        self.shaders.insert(
            id,
            ShaderObject {
                stage,
                compiled: None,
                delete_pending: false,
            },
        );
        id
    }

    pub fn compile_shader(&mut self, shader: ShaderId, source: &str) -> Result<(), String> {
        let Some(object) = self.shaders.get_mut(&shader) else {
            self.record_error(ApiErrorCode::InvalidValue, "compile_shader");
            return Err(format!("invalid shader handle {}", shader.get()));
        };
        match reflect::compile(object.stage, source) {
            Ok(compiled) => {
                object.compiled = Some(compiled);
                Ok(())
            }
            Err(log) => {
                object.compiled = None;
                Err(log)
            }
        }
    }

    pub fn delete_shader(&mut self, shader: ShaderId) {
        let attached = self
            .programs
            .values()
            .any(|p| p.attached.contains(&shader));
        if !self.shaders.contains_key(&shader) {
            self.record_error(ApiErrorCode::InvalidValue, "delete_shader");
        } else if attached {
            if let Some(object) = self.shaders.get_mut(&shader) {
                object.delete_pending = true;
            }
        } else {
            self.shaders.remove(&shader);
        }
    }

    pub fn create_program(&mut self) -> ProgramId {
        let id = self.handles.program();
        self.programs.insert(id, ProgramObject::default());
        id
    }

    pub fn attach_shader(&mut self, program: ProgramId, shader: ShaderId) {
        if !self.shaders.contains_key(&shader) {
            self.record_error(ApiErrorCode::InvalidValue, "attach_shader");
            return;
        }
        let Some(object) = self.programs.get_mut(&program) else {
            self.record_error(ApiErrorCode::InvalidValue, "attach_shader");
            return;
        };
        if object.attached.contains(&shader) {
            self.record_error(ApiErrorCode::InvalidOperation, "attach_shader");
        } else {
            object.attached.push(shader);
        }
    }

    pub fn detach_shader(&mut self, program: ProgramId, shader: ShaderId) {
        let Some(object) = self.programs.get_mut(&program) else {
            self.record_error(ApiErrorCode::InvalidValue, "detach_shader");
            return;
        };
        let Some(pos) = object.attached.iter().position(|s| *s == shader) else {
            self.record_error(ApiErrorCode::InvalidOperation, "detach_shader");
            return;
        };
        object.attached.remove(pos);
        self.collect_pending_shader(shader);
    }

    fn collect_pending_shader(&mut self, shader: ShaderId) {
        let still_attached = self
            .programs
            .values()
            .any(|p| p.attached.contains(&shader));
        if !still_attached
            && self
                .shaders
                .get(&shader)
                .is_some_and(|s| s.delete_pending)
        {
            self.shaders.remove(&shader);
        }
    }

    pub fn link_program(&mut self, program: ProgramId) -> Result<(), String> {
        let Some(object) = self.programs.get(&program) else {
            self.record_error(ApiErrorCode::InvalidValue, "link_program");
            return Err(format!("invalid program handle {}", program.get()));
        };

        let result = attached_stage(&self.shaders, &object.attached, ShaderStage::Vertex)
            .and_then(|vs| {
                attached_stage(&self.shaders, &object.attached, ShaderStage::Fragment)
                    .map(|fs| (vs, fs))
            })
            .and_then(|(vs, fs)| reflect::link(vs, fs));

        let Some(object) = self.programs.get_mut(&program) else {
            return Err(format!("invalid program handle {}", program.get()));
        };
        match result {
            Ok(interface) => {
                let size = interface.uniform_block.as_ref().map_or(0, |b| b.size);
                object.uniforms = vec![0; size as usize];
                object.interface = Some(interface);
                object.revision += 1;
                Ok(())
            }
            Err(log) => {
                object.interface = None;
                object.uniforms.clear();
                Err(log)
            }
        }
    }

    pub fn delete_program(&mut self, program: ProgramId) {
        let Some(object) = self.programs.remove(&program) else {
            self.record_error(ApiErrorCode::InvalidValue, "delete_program");
            return;
        };
        for shader in object.attached {
            self.collect_pending_shader(shader);
        }
        if self.current_program == Some(program) {
            self.current_program = None;
        }
    }

    pub fn use_program(&mut self, program: Option<ProgramId>) {
        match program {
            None => self.current_program = None,
            Some(id) => match self.programs.get(&id) {
                Some(object) if object.interface.is_some() => self.current_program = Some(id),
                Some(_) => self.record_error(ApiErrorCode::InvalidOperation, "use_program"),
                None => self.record_error(ApiErrorCode::InvalidValue, "use_program"),
            },
        }
    }

    pub fn uniform_location(&mut self, program: ProgramId, name: &str) -> Option<UniformLocation> {
        let interface = match self.programs.get(&program).map(|p| p.interface.as_ref()) {
            Some(Some(interface)) => interface,
            Some(None) => {
                self.record_error(ApiErrorCode::InvalidOperation, "uniform_location");
                return None;
            }
            None => {
                self.record_error(ApiErrorCode::InvalidValue, "uniform_location");
                return None;
            }
        };
        let member = interface.uniform_block.as_ref()?.member(name)?;
        Some(UniformLocation {
            program,
            offset: member.offset,
            ty: member.ty,
        })
    }

    pub fn set_uniform(&mut self, location: &UniformLocation, value: UniformValue) {
        if self.current_program != Some(location.program) {
            self.record_error(ApiErrorCode::InvalidOperation, "set_uniform");
            return;
        }
        if value.value_type() != location.ty || location.ty == ValueType::Unsupported {
            self.record_error(ApiErrorCode::InvalidOperation, "set_uniform");
            return;
        }
        let bytes = value.to_bytes();
        let start = location.offset as usize;
        let written = self.programs.get_mut(&location.program).and_then(|object| {
            object
                .uniforms
                .get_mut(start..start + bytes.len())?
                .copy_from_slice(&bytes);
            object.revision += 1;
            Some(())
        });
        if written.is_none() {
            self.record_error(ApiErrorCode::InvalidOperation, "set_uniform");
        }
    }

    /// Reads a float uniform back out of a program's block.
    pub fn uniform_f32(&self, program: ProgramId, name: &str) -> Option<f32> {
        let object = self.programs.get(&program)?;
        let member = object.interface.as_ref()?.uniform_block.as_ref()?.member(name)?;
        let start = member.offset as usize;
        let bytes = object.uniforms.get(start..start + 4)?;
        Some(bytemuck::pod_read_unaligned(bytes))
    }

    // Vertex arrays and buffers

    pub fn create_vertex_array(&mut self) -> VertexArrayId {
        let id = self.handles.vertex_array();
        self.vertex_arrays.insert(id, VertexArrayObject::default());
        id
    }

    pub fn bind_vertex_array(&mut self, vertex_array: Option<VertexArrayId>) {
        match vertex_array {
            Some(id) if !self.vertex_arrays.contains_key(&id) => {
                self.record_error(ApiErrorCode::InvalidOperation, "bind_vertex_array")
            }
            other => self.vertex_array = other,
        }
    }

    pub fn delete_vertex_array(&mut self, vertex_array: VertexArrayId) {
        if self.vertex_arrays.remove(&vertex_array).is_none() {
            self.record_error(ApiErrorCode::InvalidValue, "delete_vertex_array");
            return;
        }
        if self.vertex_array == Some(vertex_array) {
            self.vertex_array = None;
        }
    }

    pub fn create_buffer(&mut self) -> BufferId {
        let id = self.handles.buffer();
        self.buffers.insert(id, BufferObject::default());
        id
    }

    pub fn bind_buffer(&mut self, target: BufferTarget, buffer: Option<BufferId>) {
        if let Some(id) = buffer {
            if !self.buffers.contains_key(&id) {
                self.record_error(ApiErrorCode::InvalidOperation, "bind_buffer");
                return;
            }
        }
        match target {
            BufferTarget::Array => self.array_buffer = buffer,
            BufferTarget::ElementArray => match self.bound_vertex_array_mut() {
                Some(vao) => vao.element_buffer = buffer,
                None => self.record_error(ApiErrorCode::InvalidOperation, "bind_buffer"),
            },
        }
    }

    fn bound_vertex_array_mut(&mut self) -> Option<&mut VertexArrayObject> {
        let id = self.vertex_array?;
        self.vertex_arrays.get_mut(&id)
    }

    pub fn buffer_data(&mut self, target: BufferTarget, data: &[u8]) {
        let bound = match target {
            BufferTarget::Array => self.array_buffer,
            BufferTarget::ElementArray => self
                .vertex_array
                .and_then(|id| self.vertex_arrays.get(&id))
                .and_then(|vao| vao.element_buffer),
        };
        match bound.and_then(|id| self.buffers.get_mut(&id)) {
            Some(buffer) => {
                buffer.data = data.to_vec();
                buffer.revision += 1;
            }
            None => self.record_error(ApiErrorCode::InvalidOperation, "buffer_data"),
        }
    }

    pub fn delete_buffer(&mut self, buffer: BufferId) {
        if self.buffers.remove(&buffer).is_none() {
            self.record_error(ApiErrorCode::InvalidValue, "delete_buffer");
            return;
        }
        if self.array_buffer == Some(buffer) {
            self.array_buffer = None;
        }
        if let Some(vao) = self.bound_vertex_array_mut() {
            if vao.element_buffer == Some(buffer) {
                vao.element_buffer = None;
            }
        }
    }

    pub fn vertex_attrib_pointer(&mut self, attribute: &VertexAttribute) {
        if !(1..=4).contains(&attribute.components) {
            self.record_error(ApiErrorCode::InvalidValue, "vertex_attrib_pointer");
            return;
        }
        let Some(buffer) = self.array_buffer else {
            self.record_error(ApiErrorCode::InvalidOperation, "vertex_attrib_pointer");
            return;
        };
        match self.bound_vertex_array_mut() {
            Some(vao) => {
                vao.attributes.insert(
                    attribute.index,
                    AttributeBinding {
                        attribute: *attribute,
                        buffer,
                    },
                );
            }
            None => self.record_error(ApiErrorCode::InvalidOperation, "vertex_attrib_pointer"),
        }
    }

    pub fn enable_vertex_attrib_array(&mut self, index: u32) {
        match self.bound_vertex_array_mut() {
            Some(vao) => {
                vao.enabled.insert(index);
            }
            None => self.record_error(ApiErrorCode::InvalidOperation, "enable_vertex_attrib_array"),
        }
    }

    // Textures

    pub fn active_texture(&mut self, unit: u32) {
        if unit >= MAX_TEXTURE_UNITS {
            self.record_error(ApiErrorCode::InvalidEnum, "active_texture");
            return;
        }
        self.active_unit = unit;
    }

    pub fn create_texture(&mut self) -> TextureId {
        let id = self.handles.texture();
        self.textures.insert(id, TextureObject::default());
        id
    }

    pub fn bind_texture(&mut self, texture: Option<TextureId>) {
        match texture {
            Some(id) if !self.textures.contains_key(&id) => {
                self.record_error(ApiErrorCode::InvalidOperation, "bind_texture")
            }
            Some(id) => {
                self.units.insert(self.active_unit, id);
            }
            None => {
                self.units.remove(&self.active_unit);
            }
        }
    }

    fn bound_texture_mut(&mut self) -> Option<&mut TextureObject> {
        let id = *self.units.get(&self.active_unit)?;
        self.textures.get_mut(&id)
    }

    pub fn tex_parameter(&mut self, parameter: TextureParameter) {
        let Some(texture) = self.bound_texture_mut() else {
            self.record_error(ApiErrorCode::InvalidOperation, "tex_parameter");
            return;
        };
        match parameter {
            TextureParameter::MinFilter(filter) => texture.min_filter = filter,
            TextureParameter::MagFilter(filter) => texture.mag_filter = filter,
        }
        texture.revision += 1;
    }

    pub fn tex_image_2d(&mut self, width: u32, height: u32, pixels: &[u8]) {
        if width == 0 || height == 0 || pixels.len() != width as usize * height as usize * 4 {
            self.record_error(ApiErrorCode::InvalidValue, "tex_image_2d");
            return;
        }
        let Some(texture) = self.bound_texture_mut() else {
            self.record_error(ApiErrorCode::InvalidOperation, "tex_image_2d");
            return;
        };
        texture.width = width;
        texture.height = height;
        texture.pixels = pixels.to_vec();
        texture.revision += 1;
    }

    pub fn delete_texture(&mut self, texture: TextureId) {
        if self.textures.remove(&texture).is_none() {
            self.record_error(ApiErrorCode::InvalidValue, "delete_texture");
            return;
        }
        self.units.retain(|_, bound| *bound != texture);
    }

    pub fn read_texture(&mut self, texture: TextureId) -> Option<Vec<u8>> {
        match self.textures.get(&texture) {
            Some(object) => Some(object.pixels.clone()),
            None => {
                self.record_error(ApiErrorCode::InvalidValue, "read_texture");
                None
            }
        }
    }

    // Frame state

    pub fn set_viewport(&mut self, x: i32, y: i32, width: u32, height: u32) {
        self.viewport = Viewport {
            x,
            y,
            width,
            height,
        };
    }

    /// Number of vertices every attribute source of `plan` can supply.
    pub fn vertex_capacity(&self, plan: &DrawPlan) -> u64 {
        plan.attributes
            .iter()
            .map(|binding| {
                let len = self
                    .buffers
                    .get(&binding.buffer)
                    .map_or(0, |b| b.data.len() as u64);
                let a = binding.attribute;
                let stride = u64::from(slot_stride(&a));
                let end = u64::from(a.offset) + u64::from(a.byte_size());
                if len < end { 0 } else { (len - end) / stride + 1 }
            })
            .min()
            .unwrap_or(0)
    }

    /// Validates the bound state for a draw touching vertices `[0, vertex_span)`.
    ///
    /// `indexed` draws also require an element buffer holding `index_count` indices.
    pub fn plan_draw(&mut self, index_count: Option<u32>, what: &str) -> Option<DrawPlan> {
        match self.try_plan_draw(index_count) {
            Ok(plan) => Some(plan),
            Err(code) => {
                self.record_error(code, what);
                None
            }
        }
    }

    fn try_plan_draw(&self, index_count: Option<u32>) -> Result<DrawPlan, ApiErrorCode> {
        use ApiErrorCode::InvalidOperation;

        let program = self.current_program.ok_or(InvalidOperation)?;
        let interface = self
            .programs
            .get(&program)
            .and_then(|p| p.interface.as_ref())
            .ok_or(InvalidOperation)?;
        let vertex_array = self.vertex_array.ok_or(InvalidOperation)?;
        let vao = self.vertex_arrays.get(&vertex_array).ok_or(InvalidOperation)?;

        let mut attributes = Vec::with_capacity(interface.vertex_inputs.len());
        for input in &interface.vertex_inputs {
            let binding = vao
                .attributes
                .get(&input.location)
                .filter(|_| vao.enabled.contains(&input.location))
                .ok_or(InvalidOperation)?;
            if !self.buffers.contains_key(&binding.buffer) {
                return Err(InvalidOperation);
            }
            attributes.push(*binding);
        }

        let element_buffer = match index_count {
            Some(count) => {
                let id = vao.element_buffer.ok_or(InvalidOperation)?;
                let buffer = self.buffers.get(&id).ok_or(InvalidOperation)?;
                if buffer.data.len() < count as usize * 4 {
                    return Err(InvalidOperation);
                }
                Some(id)
            }
            None => None,
        };

        let mut textures = Vec::with_capacity(interface.texture_units.len());
        for unit in &interface.texture_units {
            let id = *self.units.get(unit).ok_or(InvalidOperation)?;
            let texture = self.textures.get(&id).ok_or(InvalidOperation)?;
            if texture.pixels.is_empty() {
                return Err(InvalidOperation);
            }
            textures.push((*unit, id));
        }

        Ok(DrawPlan {
            program,
            vertex_array,
            attributes,
            element_buffer,
            textures,
        })
    }

    pub fn binding_state(&self) -> BindingState {
        BindingState {
            program: self.current_program,
            vertex_array: self.vertex_array,
            array_buffer: self.array_buffer,
            active_unit: self.active_unit,
            textures: self.units.iter().map(|(u, t)| (*u, *t)).collect(),
        }
    }

    pub fn object_counts(&self) -> ObjectCounts {
        ObjectCounts {
            shaders: self.shaders.len(),
            programs: self.programs.len(),
            vertex_arrays: self.vertex_arrays.len(),
            buffers: self.buffers.len(),
            textures: self.textures.len(),
        }
    }
}

fn attached_stage<'a>(
    shaders: &'a HashMap<ShaderId, ShaderObject>,
    attached: &[ShaderId],
    wanted: ShaderStage,
) -> Result<&'a CompiledStage, String> {
    let mut found = attached
        .iter()
        .filter_map(|id| shaders.get(id))
        .filter(|s| s.stage == wanted);
    let shader = found
        .next()
        .ok_or_else(|| format!("no {wanted} shader attached"))?;
    if found.next().is_some() {
        return Err(format!("more than one {wanted} shader attached"));
    }
    shader
        .compiled
        .as_ref()
        .ok_or_else(|| format!("attached {wanted} shader is not compiled"))
}

/// Byte distance between consecutive vertices. A zero stride means tightly packed.
pub(crate) fn slot_stride(attribute: &VertexAttribute) -> u32 {
    match attribute.stride {
        0 => attribute.byte_size(),
        stride => stride,
    }
}
