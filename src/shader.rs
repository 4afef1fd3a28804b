//! Compiled and linked shader programs.
//!
//! [`ShaderProgram::compile_and_link`] drives the full compile/attach/link sequence and
//! cleans up after itself on every path: after a successful link only the program
//! object remains alive, and a failure leaves no objects behind.
//!
//! ```ignore
//! let program = ShaderProgram::compile_and_link(&mut ctx, VERTEX, FRAGMENT)?;
//! program.use_program(&mut ctx);
//! program.set_uniform(&mut ctx, "offset", 0.25);
//! ```

use std::collections::HashMap;

use crate::backend::{GpuApi, ProgramId, ShaderId, UniformLocation, UniformValue};
use crate::error::ShaderError;
use crate::reflect::ShaderStage;

/// Lifecycle of a program object.
///
/// A [`ShaderProgram`] value only exists once linking succeeded, so it always reports
/// `Linked`. A failed [`ShaderProgram::compile_and_link`] reports `Failed` through
/// [`ShaderError::state`], and [`ShaderError::reached`] tells whether the stages got
/// as far as `Compiled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramState {
    Uncompiled,
    Compiled,
    Linked,
    Failed,
}

/// A linked vertex + fragment program owned by a single drawable.
#[derive(Debug)]
pub struct ShaderProgram {
    handle: ProgramId,
    vertex_source: &'static str,
    fragment_source: &'static str,
    locations: HashMap<String, Option<UniformLocation>>,
}

impl ShaderProgram {
    /// Compiles both stages and links them into a program.
    pub fn compile_and_link(
        ctx: &mut impl GpuApi,
        vertex_source: &'static str,
        fragment_source: &'static str,
    ) -> Result<Self, ShaderError> {
        let vs = compile_stage(ctx, ShaderStage::Vertex, vertex_source)?;
        let fs = match compile_stage(ctx, ShaderStage::Fragment, fragment_source) {
            Ok(fs) => fs,
            Err(err) => {
                ctx.delete_shader(vs);
                return Err(err);
            }
        };

        let program = ctx.create_program();
        ctx.attach_shader(program, vs);
        ctx.attach_shader(program, fs);

        if let Err(info_log) = ctx.link_program(program) {
            log::error!("shader program failed to link:\n{info_log}");
            // Deleting the program releases the attachments.
            ctx.delete_program(program);
            ctx.delete_shader(vs);
            ctx.delete_shader(fs);
            return Err(ShaderError::Link { info_log });
        }

        ctx.detach_shader(program, vs);
        ctx.detach_shader(program, fs);
        ctx.delete_shader(vs);
        ctx.delete_shader(fs);
        log::debug!("linked program {}", program.get());

        Ok(Self {
            handle: program,
            vertex_source,
            fragment_source,
            locations: HashMap::new(),
        })
    }

    pub fn handle(&self) -> ProgramId {
        self.handle
    }

    pub fn state(&self) -> ProgramState {
        ProgramState::Linked
    }

    pub fn vertex_source(&self) -> &'static str {
        self.vertex_source
    }

    pub fn fragment_source(&self) -> &'static str {
        self.fragment_source
    }

    /// Makes this the context's current program.
    pub fn use_program(&self, ctx: &mut impl GpuApi) {
        ctx.use_program(Some(self.handle));
    }

    /// Whether the program declares a uniform called `name`.
    pub fn has_uniform(&mut self, ctx: &mut impl GpuApi, name: &str) -> bool {
        self.location(ctx, name).is_some()
    }

    /// Writes `value` to the uniform called `name`.
    ///
    /// The program must be current. Names the program does not declare are ignored.
    pub fn set_uniform(&mut self, ctx: &mut impl GpuApi, name: &str, value: impl Into<UniformValue>) {
        match self.location(ctx, name) {
            Some(location) => ctx.set_uniform(&location, value.into()),
            None => log::debug!("program {}: no uniform named '{name}'", self.handle.get()),
        }
    }

    fn location(&mut self, ctx: &mut impl GpuApi, name: &str) -> Option<UniformLocation> {
        if let Some(cached) = self.locations.get(name) {
            return *cached;
        }
        let location = ctx.uniform_location(self.handle, name);
        self.locations.insert(name.to_owned(), location);
        location
    }

    /// Deletes the program object.
    pub fn release(self, ctx: &mut impl GpuApi) {
        log::debug!("deleting program {}", self.handle.get());
        ctx.delete_program(self.handle);
    }
}

fn compile_stage(
    ctx: &mut impl GpuApi,
    stage: ShaderStage,
    source: &str,
) -> Result<ShaderId, ShaderError> {
    let shader = ctx.create_shader(stage);
    match ctx.compile_shader(shader, source) {
        Ok(()) => Ok(shader),
        Err(info_log) => {
            log::error!("{stage} shader failed to compile:\n{info_log}");
            ctx.delete_shader(shader);
            Err(ShaderError::Compile { stage, info_log })
        }
    }
}
