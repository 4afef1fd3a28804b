//! The per-effect drawable and its lifecycle.
//!
//! A [`Drawable`] owns one [`ShaderProgram`], one [`GpuMesh`] and the textures its
//! effect samples. It moves through a small state machine:
//!
//! ```text
//! Uninitialized --prepare--> Prepared --draw--> Prepared
//! Prepared --context_lost--> Uninitialized
//! Prepared --release-------> Uninitialized
//! ```
//!
//! `prepare` either builds everything or nothing: on failure every object created so
//! far is deleted again. Both `prepare` and `draw` leave the context's binding points
//! at their baseline (nothing bound, texture unit 0 active).
//!
//! # Example
//!
//! ```ignore
//! let mut drawable = Drawable::from_effect(EffectId::Wheel);
//! drawable.prepare(&mut ctx, Some(&image))?;
//! loop {
//!     drawable.draw(&mut ctx, width, height);
//! }
//! ```

use crate::backend::{GpuApi, ProgramId, TextureId, check_error};
use crate::config::RenderConfig;
use crate::effect::{
    AnimationState, EffectDescriptor, EffectId, Geometry, TextureSource, UpdateRule,
};
use crate::error::{PrepareError, ResourceError};
use crate::mesh::GpuMesh;
use crate::procedural::RadarGenerator;
use crate::shader::ShaderProgram;
use crate::texture::{DecodedImage, GpuTexture};

/// Texture unit the effect texture is bound to.
const EFFECT_TEXTURE_UNIT: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawableState {
    Uninitialized,
    Prepared,
}

#[derive(Debug)]
struct Resources {
    program: ShaderProgram,
    mesh: GpuMesh,
    textures: Vec<(u32, GpuTexture)>,
}

impl Resources {
    fn release(self, ctx: &mut impl GpuApi) {
        for (_, texture) in self.textures {
            texture.release(ctx);
        }
        self.mesh.release(ctx);
        self.program.release(ctx);
    }
}

/// Returns every binding point to its baseline and drops errors raised while cleaning up.
fn reset_bindings(ctx: &mut impl GpuApi) {
    ctx.use_program(None);
    ctx.bind_vertex_array(None);
    ctx.active_texture(0);
    let _ = ctx.take_error();
}

/// One effect, ready to be prepared on a context and drawn every frame.
#[derive(Debug)]
pub struct Drawable {
    descriptor: EffectDescriptor,
    config: RenderConfig,
    rule: UpdateRule,
    animation: AnimationState,
    resources: Option<Resources>,
    scratch: Vec<u8>,
}

impl Drawable {
    pub fn new(descriptor: EffectDescriptor, config: RenderConfig) -> Self {
        let rule = config.apply(descriptor.update_rule);
        Self {
            descriptor,
            config,
            rule,
            animation: AnimationState::default(),
            resources: None,
            scratch: Vec::new(),
        }
    }

    /// A built-in effect with the default [`RenderConfig`].
    pub fn from_effect(id: EffectId) -> Self {
        Self::new(id.descriptor(), RenderConfig::default())
    }

    pub fn descriptor(&self) -> &EffectDescriptor {
        &self.descriptor
    }

    /// The update rule in effect, after config overrides.
    pub fn update_rule(&self) -> UpdateRule {
        self.rule
    }

    pub fn animation(&self) -> AnimationState {
        self.animation
    }

    pub fn state(&self) -> DrawableState {
        match self.resources {
            Some(_) => DrawableState::Prepared,
            None => DrawableState::Uninitialized,
        }
    }

    pub fn is_prepared(&self) -> bool {
        self.resources.is_some()
    }

    pub fn program(&self) -> Option<ProgramId> {
        self.resources.as_ref().map(|r| r.program.handle())
    }

    /// Handles of the textures the drawable owns, by unit.
    pub fn textures(&self) -> Vec<(u32, TextureId)> {
        self.resources
            .as_ref()
            .map(|r| r.textures.iter().map(|(u, t)| (*u, t.handle())).collect())
            .unwrap_or_default()
    }

    /// Builds the program, mesh and textures on `ctx`.
    ///
    /// `image` is required by image-backed effects and ignored otherwise. On failure
    /// every object created so far is deleted and the drawable stays uninitialized.
    pub fn prepare(
        &mut self,
        ctx: &mut impl GpuApi,
        image: Option<&DecodedImage>,
    ) -> Result<(), PrepareError> {
        if self.resources.is_some() {
            return Err(PrepareError::AlreadyPrepared);
        }
        if self.descriptor.texture == TextureSource::Image && image.is_none() {
            return Err(ResourceError::MissingImage {
                effect: self.descriptor.id.to_owned(),
            }
            .into());
        }
        if let Some(code) = ctx.take_error() {
            log::debug!("discarding stale context error {code} before prepare");
        }

        match self.build(ctx, image) {
            Ok(resources) => {
                self.resources = Some(resources);
                log::info!("prepared effect '{}'", self.descriptor.id);
                Ok(())
            }
            Err(err) => {
                log::error!("failed to prepare effect '{}': {err}", self.descriptor.id);
                reset_bindings(ctx);
                Err(err)
            }
        }
    }

    fn build(
        &mut self,
        ctx: &mut impl GpuApi,
        image: Option<&DecodedImage>,
    ) -> Result<Resources, PrepareError> {
        let program = ShaderProgram::compile_and_link(
            ctx,
            self.descriptor.vertex_source,
            self.descriptor.fragment_source,
        )?;
        if let Err(err) = check_error(ctx, "compile and link") {
            program.release(ctx);
            return Err(err.into());
        }

        let mesh = match self.build_mesh(ctx) {
            Ok(mesh) => mesh,
            Err(err) => {
                program.release(ctx);
                return Err(err);
            }
        };

        let textures = match self.build_textures(ctx, image) {
            Ok(textures) => textures,
            Err(err) => {
                mesh.release(ctx);
                program.release(ctx);
                return Err(err);
            }
        };

        let resources = Resources {
            program,
            mesh,
            textures,
        };
        ctx.use_program(None);
        ctx.active_texture(0);
        if let Err(err) = check_error(ctx, "reset bindings") {
            resources.release(ctx);
            return Err(err.into());
        }
        Ok(resources)
    }

    fn build_mesh(&self, ctx: &mut impl GpuApi) -> Result<GpuMesh, PrepareError> {
        let mesh = match self.descriptor.geometry {
            Geometry::Quad => GpuMesh::quad(ctx)?,
            Geometry::Triangle => GpuMesh::triangle(ctx)?,
        };
        if let Err(err) = check_error(ctx, "mesh upload") {
            mesh.release(ctx);
            return Err(err.into());
        }
        Ok(mesh)
    }

    fn build_textures(
        &mut self,
        ctx: &mut impl GpuApi,
        image: Option<&DecodedImage>,
    ) -> Result<Vec<(u32, GpuTexture)>, PrepareError> {
        let texture = match (self.descriptor.texture, self.rule, image) {
            (TextureSource::Image, _, Some(image)) => GpuTexture::upload_image(ctx, image)?,
            (
                TextureSource::Procedural,
                UpdateRule::ProceduralTexture {
                    width,
                    height,
                    frames_per_step,
                },
                _,
            ) => {
                RadarGenerator::new(width, height, frames_per_step)
                    .fill(self.animation.frame, &mut self.scratch);
                GpuTexture::upload(ctx, &self.scratch, width, height)?
            }
            (TextureSource::Procedural, _, _) => {
                return Err(ResourceError::InvalidLayout(format!(
                    "effect '{}' has a procedural texture but no procedural update rule",
                    self.descriptor.id
                ))
                .into());
            }
            _ => return Ok(Vec::new()),
        };
        if let Err(err) = check_error(ctx, "texture upload") {
            texture.release(ctx);
            return Err(err.into());
        }
        Ok(vec![(EFFECT_TEXTURE_UNIT, texture)])
    }

    /// Advances the animation one tick and draws into a `width` x `height` viewport.
    ///
    /// Context errors raised while drawing are logged and otherwise ignored.
    pub fn draw(&mut self, ctx: &mut impl GpuApi, width: u32, height: u32) {
        let Some(resources) = self.resources.as_mut() else {
            log::debug!("draw on unprepared effect '{}' ignored", self.descriptor.id);
            return;
        };

        if self.animation.advance(&self.rule) {
            if let UpdateRule::ProceduralTexture {
                width: tex_width,
                height: tex_height,
                frames_per_step,
            } = self.rule
            {
                RadarGenerator::new(tex_width, tex_height, frames_per_step)
                    .fill(self.animation.frame, &mut self.scratch);
                if let Some((_, texture)) = resources.textures.first() {
                    if let Err(err) = texture.reupload(ctx, &self.scratch) {
                        log::warn!("procedural texture update failed: {err}");
                    }
                }
            }
        }

        let program = &mut resources.program;
        program.use_program(ctx);
        if program.has_uniform(ctx, "offset") {
            program.set_uniform(ctx, "offset", self.animation.offset);
        }
        if program.has_uniform(ctx, "resolution") {
            program.set_uniform(
                ctx,
                "resolution",
                glam::Vec2::new(width as f32, height as f32),
            );
        }
        if program.has_uniform(ctx, "frame") {
            program.set_uniform(ctx, "frame", self.animation.frame as u32);
        }

        ctx.viewport(0, 0, width, height);
        ctx.clear_color(self.config.clear_color);
        ctx.clear();

        for (unit, texture) in &resources.textures {
            texture.bind(ctx, *unit);
        }
        ctx.active_texture(0);
        resources.mesh.bind_for_draw(ctx).draw();
        for (unit, _) in &resources.textures {
            GpuTexture::unbind(ctx, *unit);
        }
        ctx.use_program(None);

        if let Some(code) = ctx.take_error() {
            log::warn!("effect '{}' draw raised {code}", self.descriptor.id);
        }
    }

    /// Forgets every handle without deleting anything. The animation state is kept.
    pub fn context_lost(&mut self) {
        if self.resources.take().is_some() {
            log::warn!(
                "context lost, effect '{}' must be prepared again",
                self.descriptor.id
            );
        }
    }

    /// Deletes every owned object.
    pub fn release(&mut self, ctx: &mut impl GpuApi) {
        if let Some(resources) = self.resources.take() {
            resources.release(ctx);
            log::info!("released effect '{}'", self.descriptor.id);
        }
    }
}

impl Drop for Drawable {
    fn drop(&mut self) {
        if self.resources.is_some() {
            log::warn!(
                "effect '{}' dropped while prepared, its GPU objects are leaked",
                self.descriptor.id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        BindingState, BufferId, BufferTarget, ObjectCounts, ShaderId, SoftContext,
        TextureParameter, UniformLocation, UniformValue, VertexArrayId, VertexAttribute,
    };
    use crate::error::{ApiErrorCode, GpuApiError, ShaderError};
    use crate::reflect::ShaderStage;

    /// Forwards to a [`SoftContext`] and raises `code` once, right after the first
    /// call named `fail_after`.
    struct FaultyContext {
        inner: SoftContext,
        fail_after: Option<&'static str>,
        code: ApiErrorCode,
        pending: Option<ApiErrorCode>,
    }

    impl FaultyContext {
        fn new(inner: SoftContext, fail_after: &'static str, code: ApiErrorCode) -> Self {
            Self {
                inner,
                fail_after: Some(fail_after),
                code,
                pending: None,
            }
        }

        fn hit(&mut self, call: &str) {
            if self.fail_after == Some(call) {
                self.fail_after = None;
                if self.pending.is_none() {
                    self.pending = Some(self.code);
                }
            }
        }
    }

    impl GpuApi for FaultyContext {
        fn create_shader(&mut self, stage: ShaderStage) -> ShaderId {
            self.inner.create_shader(stage)
        }
        fn compile_shader(&mut self, shader: ShaderId, source: &str) -> Result<(), String> {
            self.inner.compile_shader(shader, source)
        }
        fn delete_shader(&mut self, shader: ShaderId) {
            self.inner.delete_shader(shader)
        }
        fn create_program(&mut self) -> ProgramId {
            self.inner.create_program()
        }
        fn attach_shader(&mut self, program: ProgramId, shader: ShaderId) {
            self.inner.attach_shader(program, shader)
        }
        fn detach_shader(&mut self, program: ProgramId, shader: ShaderId) {
            self.inner.detach_shader(program, shader)
        }
        fn link_program(&mut self, program: ProgramId) -> Result<(), String> {
            let result = self.inner.link_program(program);
            self.hit("link_program");
            result
        }
        fn delete_program(&mut self, program: ProgramId) {
            self.inner.delete_program(program)
        }
        fn use_program(&mut self, program: Option<ProgramId>) {
            self.inner.use_program(program)
        }
        fn uniform_location(&mut self, program: ProgramId, name: &str) -> Option<UniformLocation> {
            self.inner.uniform_location(program, name)
        }
        fn set_uniform(&mut self, location: &UniformLocation, value: UniformValue) {
            self.inner.set_uniform(location, value)
        }
        fn create_vertex_array(&mut self) -> VertexArrayId {
            self.inner.create_vertex_array()
        }
        fn bind_vertex_array(&mut self, vertex_array: Option<VertexArrayId>) {
            self.inner.bind_vertex_array(vertex_array)
        }
        fn delete_vertex_array(&mut self, vertex_array: VertexArrayId) {
            self.inner.delete_vertex_array(vertex_array)
        }
        fn create_buffer(&mut self) -> BufferId {
            self.inner.create_buffer()
        }
        fn bind_buffer(&mut self, target: BufferTarget, buffer: Option<BufferId>) {
            self.inner.bind_buffer(target, buffer)
        }
        fn buffer_data(&mut self, target: BufferTarget, data: &[u8]) {
            self.inner.buffer_data(target, data);
            self.hit("buffer_data");
        }
        fn delete_buffer(&mut self, buffer: BufferId) {
            self.inner.delete_buffer(buffer)
        }
        fn vertex_attrib_pointer(&mut self, attribute: &VertexAttribute) {
            self.inner.vertex_attrib_pointer(attribute)
        }
        fn enable_vertex_attrib_array(&mut self, index: u32) {
            self.inner.enable_vertex_attrib_array(index)
        }
        fn active_texture(&mut self, unit: u32) {
            self.inner.active_texture(unit)
        }
        fn create_texture(&mut self) -> TextureId {
            self.inner.create_texture()
        }
        fn bind_texture(&mut self, texture: Option<TextureId>) {
            self.inner.bind_texture(texture)
        }
        fn tex_parameter(&mut self, parameter: TextureParameter) {
            self.inner.tex_parameter(parameter)
        }
        fn tex_image_2d(&mut self, width: u32, height: u32, pixels: &[u8]) {
            self.inner.tex_image_2d(width, height, pixels);
            self.hit("tex_image_2d");
        }
        fn delete_texture(&mut self, texture: TextureId) {
            self.inner.delete_texture(texture)
        }
        fn read_texture(&mut self, texture: TextureId) -> Option<Vec<u8>> {
            self.inner.read_texture(texture)
        }
        fn viewport(&mut self, x: i32, y: i32, width: u32, height: u32) {
            self.inner.viewport(x, y, width, height)
        }
        fn clear_color(&mut self, rgba: [f32; 4]) {
            self.inner.clear_color(rgba)
        }
        fn clear(&mut self) {
            self.inner.clear()
        }
        fn draw_arrays(&mut self, first: u32, count: u32) {
            self.inner.draw_arrays(first, count);
            self.hit("draw_arrays");
        }
        fn draw_elements(&mut self, count: u32) {
            self.inner.draw_elements(count);
            self.hit("draw_elements");
        }
        fn take_error(&mut self) -> Option<ApiErrorCode> {
            self.pending.take().or_else(|| self.inner.take_error())
        }
        fn binding_state(&self) -> BindingState {
            self.inner.binding_state()
        }
        fn object_counts(&self) -> ObjectCounts {
            self.inner.object_counts()
        }
    }

    fn red_image() -> DecodedImage {
        DecodedImage::new(2, 2, [255, 0, 0, 255].repeat(4)).unwrap()
    }

    #[test]
    fn missing_image_is_rejected_before_creating_objects() {
        let mut ctx = SoftContext::new(2, 2);
        let mut drawable = Drawable::from_effect(EffectId::Texture);
        let err = drawable.prepare(&mut ctx, None).unwrap_err();
        assert_eq!(
            err,
            PrepareError::Resource(ResourceError::MissingImage {
                effect: "texture".to_owned()
            })
        );
        assert_eq!(ctx.object_counts().total(), 0);
        assert_eq!(drawable.state(), DrawableState::Uninitialized);
    }

    #[test]
    fn failed_prepare_releases_everything() {
        let mut ctx = SoftContext::new(2, 2);
        let mut descriptor = EffectId::Texture.descriptor();
        descriptor.fragment_source = "@fragment fn fs_main() -> @location(0) vec4<f32> {";
        let mut drawable = Drawable::new(descriptor, RenderConfig::default());

        let err = drawable.prepare(&mut ctx, Some(&red_image())).unwrap_err();
        assert!(matches!(err, PrepareError::Shader(ShaderError::Compile { .. })));
        assert_eq!(ctx.object_counts().total(), 0);
        assert!(ctx.binding_state().is_baseline());
    }

    #[test]
    fn bad_image_releases_program_and_mesh() {
        let mut ctx = SoftContext::new(2, 2);
        let mut drawable = Drawable::from_effect(EffectId::Texture);
        let bad = DecodedImage {
            width: 2,
            height: 2,
            pixels: vec![0; 3],
        };
        let err = drawable.prepare(&mut ctx, Some(&bad)).unwrap_err();
        assert!(matches!(
            err,
            PrepareError::Resource(ResourceError::PixelBufferSize { .. })
        ));
        assert_eq!(ctx.object_counts().total(), 0);
    }

    #[test]
    fn draw_advances_the_offset_uniform() {
        let mut ctx = SoftContext::new(4, 4);
        let mut drawable = Drawable::from_effect(EffectId::Dissolve);
        drawable.prepare(&mut ctx, Some(&red_image())).unwrap();

        drawable.draw(&mut ctx, 4, 4);
        drawable.draw(&mut ctx, 4, 4);
        let program = drawable.program().unwrap();
        let offset = ctx.uniform_f32(program, "offset").unwrap();
        assert!((offset - 0.01).abs() < 1e-6);
        assert!((drawable.animation().offset - 0.01).abs() < 1e-6);
        assert!(ctx.binding_state().is_baseline());
    }

    #[test]
    fn draw_before_prepare_is_a_no_op() {
        let mut ctx = SoftContext::new(2, 2);
        let mut drawable = Drawable::from_effect(EffectId::Wheel);
        drawable.draw(&mut ctx, 2, 2);
        assert_eq!(drawable.animation(), AnimationState::default());
        assert_eq!(ctx.pixel(0, 0), Some([0, 0, 0, 0]));
    }

    #[test]
    fn triangle_needs_no_image() {
        let mut ctx = SoftContext::new(8, 8);
        let mut drawable = Drawable::from_effect(EffectId::Triangle);
        drawable.prepare(&mut ctx, None).unwrap();
        drawable.draw(&mut ctx, 8, 8);
        assert_eq!(ctx.take_error(), None);
        // Center is inside the triangle, the top corners are not.
        assert_eq!(ctx.pixel(4, 3), Some([255; 4]));
        assert_eq!(ctx.pixel(0, 7), Some([255, 128, 128, 128]));
        drawable.release(&mut ctx);
        assert_eq!(ctx.object_counts().total(), 0);
    }

    #[test]
    fn upload_error_fails_prepare_and_releases_everything() {
        let soft = SoftContext::new(4, 4);
        let mut ctx = FaultyContext::new(soft, "tex_image_2d", ApiErrorCode::OutOfMemory);
        let mut drawable = Drawable::from_effect(EffectId::Texture);

        let err = drawable.prepare(&mut ctx, Some(&red_image())).unwrap_err();
        assert_eq!(
            err,
            PrepareError::Gpu(GpuApiError {
                operation: "texture upload".to_owned(),
                code: ApiErrorCode::OutOfMemory,
            })
        );
        assert_eq!(drawable.state(), DrawableState::Uninitialized);
        assert_eq!(ctx.object_counts().total(), 0);
        assert!(ctx.binding_state().is_baseline());
        assert_eq!(ctx.take_error(), None);
    }

    #[test]
    fn mesh_error_fails_prepare_before_any_texture() {
        let soft = SoftContext::new(4, 4);
        let mut ctx = FaultyContext::new(soft, "buffer_data", ApiErrorCode::OutOfMemory);
        let mut drawable = Drawable::from_effect(EffectId::Texture);

        let err = drawable.prepare(&mut ctx, Some(&red_image())).unwrap_err();
        assert!(matches!(
            err,
            PrepareError::Gpu(GpuApiError { ref operation, .. }) if operation == "mesh upload"
        ));
        assert_eq!(ctx.object_counts().total(), 0);
        assert!(ctx.binding_state().is_baseline());
    }

    #[test]
    fn draw_error_is_logged_and_drawing_continues() {
        let soft = SoftContext::new(4, 4);
        let mut ctx = FaultyContext::new(soft, "draw_elements", ApiErrorCode::InvalidOperation);
        let mut drawable = Drawable::from_effect(EffectId::Dissolve);
        drawable.prepare(&mut ctx, Some(&red_image())).unwrap();

        drawable.draw(&mut ctx, 4, 4);
        assert_eq!(drawable.state(), DrawableState::Prepared);
        assert_eq!(ctx.take_error(), None);

        drawable.draw(&mut ctx, 4, 4);
        assert_eq!(drawable.state(), DrawableState::Prepared);
        assert!((drawable.animation().offset - 0.01).abs() < 1e-6);
        assert_eq!(ctx.inner.pixel(1, 1), Some([255, 0, 0, 255]));
        assert!(ctx.binding_state().is_baseline());

        drawable.release(&mut ctx);
    }

    #[test]
    fn non_finite_step_override_keeps_offset_in_range() {
        let mut ctx = SoftContext::new(4, 4);
        let config = RenderConfig::new().step(f32::NAN);
        let mut drawable = Drawable::new(EffectId::Dissolve.descriptor(), config);
        assert_eq!(drawable.update_rule(), UpdateRule::UniformAnimated { step: 0.005 });
        drawable.prepare(&mut ctx, Some(&red_image())).unwrap();

        drawable.draw(&mut ctx, 4, 4);
        let offset = drawable.animation().offset;
        assert!((0.0..1.0).contains(&offset), "{offset}");
        assert!((offset - 0.005).abs() < 1e-6);
        drawable.release(&mut ctx);
    }

    #[test]
    fn dropping_a_prepared_drawable_deletes_nothing() {
        let mut ctx = SoftContext::new(4, 4);
        let mut drawable = Drawable::from_effect(EffectId::Texture);
        drawable.prepare(&mut ctx, Some(&red_image())).unwrap();
        let counts = ctx.object_counts();

        drop(drawable);
        assert_eq!(ctx.object_counts(), counts);
        assert_eq!(ctx.take_error(), None);

        drop(Drawable::from_effect(EffectId::Wheel));
        assert_eq!(ctx.object_counts(), counts);
    }
}
