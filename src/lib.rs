//! # quadfx
//!
//! **Textured quads and full-screen shader effects with an explicit GPU lifecycle.**
//!
//! Every effect is a [`Drawable`]: a shader program, a mesh and the textures it
//! samples, built together by [`Drawable::prepare`] and torn down together by
//! [`Drawable::release`]. Drawables talk to a [`GpuApi`] context, either a real
//! device ([`GpuContext`]) or the CPU rasterizer ([`SoftContext`]).
//!
//! ## Quick Start
//!
//! ```
//! use quadfx::{DecodedImage, Drawable, EffectId, GpuApi, SoftContext};
//!
//! let mut ctx = SoftContext::new(64, 64);
//! let image = DecodedImage::checkerboard(16, 16, 4, [255, 255, 255, 255], [0, 0, 0, 255]);
//!
//! let mut wheel = Drawable::from_effect(EffectId::Wheel);
//! wheel.prepare(&mut ctx, Some(&image)).unwrap();
//! for _ in 0..3 {
//!     wheel.draw(&mut ctx, 64, 64);
//! }
//! wheel.release(&mut ctx);
//! assert_eq!(ctx.object_counts().total(), 0);
//! ```
//!
//! ## Context loss
//!
//! When the context goes away, call [`Drawable::context_lost`] to forget the dead
//! handles, then [`Drawable::prepare`] again on the new context. Animation state
//! survives the round trip.

pub mod backend;
mod config;
mod drawable;
mod effect;
mod error;
mod logging;
mod mesh;
mod procedural;
pub mod reflect;
mod shader;
mod texture;

pub use backend::{
    BindingState, BufferId, BufferTarget, GpuApi, GpuContext, ObjectCounts, ProgramId,
    ShaderId, SoftContext, TextureFilter, TextureId, TextureParameter, UniformLocation,
    UniformValue, VertexArrayId, VertexAttribute, check_error,
};
pub use config::{AppConfig, ConfigError, RenderConfig};
pub use drawable::{Drawable, DrawableState};
pub use effect::{
    AnimationState, EffectDescriptor, EffectId, EffectRegistry, Geometry, TextureSource,
    UnknownEffect, UpdateRule, offset_period,
};
pub use error::{
    ApiErrorCode, ContextError, GpuApiError, PrepareError, ResourceError, ShaderError,
};
pub use logging::{LoggingConfig, init_logging};
pub use mesh::{
    GpuMesh, MeshBinding, QUAD_INDICES, QUAD_VERTICES, QuadVertex, TRIANGLE_VERTICES,
    TriangleVertex,
};
pub use procedural::{RADAR_OUTER, RADAR_PALETTE, RadarGenerator};
pub use shader::{ProgramState, ShaderProgram};
pub use texture::{DecodedImage, GpuTexture, flip_rows};
