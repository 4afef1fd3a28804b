//! Built-in effects and their per-frame update rules.
//!
//! Every effect pairs a vertex and fragment stage with the geometry it draws, where its
//! texture comes from, and an [`UpdateRule`] that says how its animation state advances
//! on each draw.
//!
//! # Uniform Interface
//!
//! Animated fragment stages declare a uniform block at `@group(0) @binding(0)`:
//!
//! ```wgsl
//! struct Params {
//!     resolution: vec2<f32>,
//!     offset: f32,
//! }
//! @group(0) @binding(0) var<uniform> params: Params;
//! ```
//!
//! `offset` cycles through `[0, 1)`. `resolution` is the viewport size in pixels. A
//! stage may also declare `frame: u32` to receive the frame counter. Members a stage
//! does not declare are simply not written.

use std::fmt;
use std::str::FromStr;

const QUAD_VS: &str = include_str!("shaders/quad.vert.wgsl");
const TRIANGLE_VS: &str = include_str!("shaders/triangle.vert.wgsl");

/// Identifier of a built-in effect. Parses from and prints as its kebab-case name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectId {
    Triangle,
    Texture,
    DynamicMesh,
    DynamicCircle,
    QuadSplit,
    Blinds,
    Dissolve,
    Splitting,
    Wheel,
    Mosaic,
    Radar,
}

impl EffectId {
    pub const ALL: [EffectId; 11] = [
        EffectId::Triangle,
        EffectId::Texture,
        EffectId::DynamicMesh,
        EffectId::DynamicCircle,
        EffectId::QuadSplit,
        EffectId::Blinds,
        EffectId::Dissolve,
        EffectId::Splitting,
        EffectId::Wheel,
        EffectId::Mosaic,
        EffectId::Radar,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EffectId::Triangle => "triangle",
            EffectId::Texture => "texture",
            EffectId::DynamicMesh => "dynamic-mesh",
            EffectId::DynamicCircle => "dynamic-circle",
            EffectId::QuadSplit => "quad-split",
            EffectId::Blinds => "blinds",
            EffectId::Dissolve => "dissolve",
            EffectId::Splitting => "splitting",
            EffectId::Wheel => "wheel",
            EffectId::Mosaic => "mosaic",
            EffectId::Radar => "radar",
        }
    }

    /// The built-in descriptor for this effect.
    pub fn descriptor(self) -> EffectDescriptor {
        let quad_image = |title, fragment_source, update_rule| EffectDescriptor {
            id: self.as_str(),
            title,
            vertex_source: QUAD_VS,
            fragment_source,
            geometry: Geometry::Quad,
            texture: TextureSource::Image,
            update_rule,
        };
        let animated = |step| UpdateRule::UniformAnimated { step };

        match self {
            EffectId::Triangle => EffectDescriptor {
                id: self.as_str(),
                title: "Triangle",
                vertex_source: TRIANGLE_VS,
                fragment_source: include_str!("shaders/triangle.frag.wgsl"),
                geometry: Geometry::Triangle,
                texture: TextureSource::None,
                update_rule: UpdateRule::Static,
            },
            EffectId::Texture => quad_image(
                "Texture",
                include_str!("shaders/texture.frag.wgsl"),
                UpdateRule::Static,
            ),
            EffectId::DynamicMesh => quad_image(
                "Dynamic mesh",
                include_str!("shaders/dynamic_mesh.frag.wgsl"),
                animated(0.01),
            ),
            EffectId::DynamicCircle => quad_image(
                "Dynamic circle",
                include_str!("shaders/dynamic_circle.frag.wgsl"),
                animated(0.01),
            ),
            EffectId::QuadSplit => quad_image(
                "Quad split",
                include_str!("shaders/quad_split.frag.wgsl"),
                UpdateRule::Static,
            ),
            EffectId::Blinds => quad_image(
                "Blinds",
                include_str!("shaders/blinds.frag.wgsl"),
                animated(0.01),
            ),
            EffectId::Dissolve => quad_image(
                "Dissolve",
                include_str!("shaders/dissolve.frag.wgsl"),
                animated(0.005),
            ),
            EffectId::Splitting => quad_image(
                "Splitting",
                include_str!("shaders/splitting.frag.wgsl"),
                animated(0.01),
            ),
            EffectId::Wheel => quad_image(
                "Wheel",
                include_str!("shaders/wheel.frag.wgsl"),
                animated(0.005),
            ),
            EffectId::Mosaic => quad_image(
                "Mosaic",
                include_str!("shaders/mosaic.frag.wgsl"),
                animated(0.01),
            ),
            EffectId::Radar => EffectDescriptor {
                id: self.as_str(),
                title: "Radar",
                vertex_source: QUAD_VS,
                fragment_source: include_str!("shaders/texture.frag.wgsl"),
                geometry: Geometry::Quad,
                texture: TextureSource::Procedural,
                update_rule: UpdateRule::ProceduralTexture {
                    width: 512,
                    height: 512,
                    frames_per_step: 15,
                },
            },
        }
    }
}

impl fmt::Display for EffectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A name that matches no built-in effect.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown effect '{0}'")]
pub struct UnknownEffect(pub String);

impl FromStr for EffectId {
    type Err = UnknownEffect;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EffectId::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| UnknownEffect(s.to_owned()))
    }
}

/// Geometry an effect draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Geometry {
    /// Full-screen `[x, y, z, u, v]` quad, indexed.
    Quad,
    /// Single position-only triangle, not indexed.
    Triangle,
}

/// Where the texture on unit 0 comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureSource {
    None,
    /// A decoded image supplied to `prepare`.
    Image,
    /// The radar generator, sized by the procedural update rule.
    Procedural,
}

/// How an effect's animation state changes on each draw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpdateRule {
    Static,
    /// `offset = (offset + step) mod 1`.
    UniformAnimated { step: f32 },
    /// `frame += 1`, then the texture is regenerated.
    ProceduralTexture {
        width: u32,
        height: u32,
        frames_per_step: u32,
    },
}

/// Animation state carried by a drawable across context loss.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AnimationState {
    /// Always in `[0, 1)`.
    pub offset: f32,
    pub frame: u64,
}

impl AnimationState {
    /// Advances one tick. Returns `true` when the procedural texture must be regenerated.
    pub fn advance(&mut self, rule: &UpdateRule) -> bool {
        match *rule {
            UpdateRule::Static => false,
            UpdateRule::UniformAnimated { step } => {
                self.offset = (self.offset + step).rem_euclid(1.0);
                // rem_euclid can round up to exactly 1.0.
                if !self.offset.is_finite() || self.offset >= 1.0 {
                    self.offset = 0.0;
                }
                self.frame = self.frame.wrapping_add(1);
                false
            }
            UpdateRule::ProceduralTexture { .. } => {
                self.frame = self.frame.wrapping_add(1);
                true
            }
        }
    }
}

/// Number of ticks after which an animated `offset` returns to its start.
pub fn offset_period(step: f32) -> u32 {
    if step <= 0.0 {
        return 0;
    }
    (1.0 / step).ceil() as u32
}

/// Everything needed to build and animate one effect. Immutable once chosen.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectDescriptor {
    /// Kebab-case identifier.
    pub id: &'static str,
    /// Human-readable name.
    pub title: &'static str,
    pub vertex_source: &'static str,
    pub fragment_source: &'static str,
    pub geometry: Geometry,
    pub texture: TextureSource,
    pub update_rule: UpdateRule,
}

/// Lookup table from effect id to descriptor.
///
/// Starts with every built-in effect; hosts may register their own.
#[derive(Debug, Clone)]
pub struct EffectRegistry {
    effects: Vec<EffectDescriptor>,
}

impl Default for EffectRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl EffectRegistry {
    pub fn builtin() -> Self {
        Self {
            effects: EffectId::ALL.iter().map(|id| id.descriptor()).collect(),
        }
    }

    /// Looks up an effect by its kebab-case id.
    pub fn get(&self, id: &str) -> Option<&EffectDescriptor> {
        self.effects.iter().find(|d| d.id == id)
    }

    /// Like [`get`](Self::get), but unknown ids are an error.
    pub fn resolve(&self, id: &str) -> Result<&EffectDescriptor, UnknownEffect> {
        self.get(id).ok_or_else(|| UnknownEffect(id.to_owned()))
    }

    /// Adds `descriptor`, replacing any effect with the same id.
    pub fn register(&mut self, descriptor: EffectDescriptor) {
        match self.effects.iter_mut().find(|d| d.id == descriptor.id) {
            Some(existing) => *existing = descriptor,
            None => self.effects.push(descriptor),
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.effects.iter().map(|d| d.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EffectDescriptor> {
        self.effects.iter()
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{GpuApi, SoftContext};
    use crate::shader::ShaderProgram;

    fn circular_distance(a: f32, b: f32) -> f32 {
        let d = (a - b).abs();
        d.min(1.0 - d)
    }

    #[test]
    fn ids_round_trip_through_their_names() {
        for id in EffectId::ALL {
            assert_eq!(id.to_string().parse::<EffectId>(), Ok(id));
        }
        assert_eq!(
            "sepia".parse::<EffectId>(),
            Err(UnknownEffect("sepia".to_owned()))
        );
    }

    #[test]
    fn every_builtin_effect_links() {
        let mut ctx = SoftContext::new(4, 4);
        for descriptor in EffectRegistry::builtin().iter() {
            let program = ShaderProgram::compile_and_link(
                &mut ctx,
                descriptor.vertex_source,
                descriptor.fragment_source,
            )
            .unwrap_or_else(|e| panic!("{}: {e}", descriptor.id));
            program.release(&mut ctx);
        }
        assert_eq!(ctx.object_counts().total(), 0);
    }

    #[test]
    fn offset_returns_to_start_after_one_period() {
        for step in [0.01_f32, 0.005] {
            let rule = UpdateRule::UniformAnimated { step };
            let mut state = AnimationState::default();
            for _ in 0..offset_period(step) {
                state.advance(&rule);
                assert!((0.0..1.0).contains(&state.offset));
            }
            assert!(circular_distance(state.offset, 0.0) < 1e-3, "{step}: {}", state.offset);
        }
    }

    #[test]
    fn non_finite_step_keeps_offset_in_range() {
        for step in [f32::NAN, f32::INFINITY, f32::NEG_INFINITY] {
            let rule = UpdateRule::UniformAnimated { step };
            let mut state = AnimationState {
                offset: 0.5,
                frame: 0,
            };
            for _ in 0..3 {
                state.advance(&rule);
                assert!((0.0..1.0).contains(&state.offset), "{step}: {}", state.offset);
            }
        }

        let mut state = AnimationState {
            offset: f32::NAN,
            frame: 0,
        };
        state.advance(&UpdateRule::UniformAnimated { step: 0.01 });
        assert!((0.0..1.0).contains(&state.offset));
    }

    #[test]
    fn procedural_rule_counts_frames() {
        let rule = EffectId::Radar.descriptor().update_rule;
        let mut state = AnimationState::default();
        assert!(state.advance(&rule));
        assert!(state.advance(&rule));
        assert_eq!(state.frame, 2);
        assert_eq!(state.offset, 0.0);
    }

    #[test]
    fn static_rule_changes_nothing() {
        let mut state = AnimationState::default();
        assert!(!state.advance(&UpdateRule::Static));
        assert_eq!(state, AnimationState::default());
    }

    #[test]
    fn register_replaces_by_id() {
        let mut registry = EffectRegistry::builtin();
        let count = registry.len();
        let mut custom = EffectId::Texture.descriptor();
        custom.title = "Plain texture";
        registry.register(custom);
        assert_eq!(registry.len(), count);
        assert_eq!(registry.get("texture").map(|d| d.title), Some("Plain texture"));
    }

    #[test]
    fn resolve_finds_builtins_and_rejects_strangers() {
        let registry = EffectRegistry::builtin();
        for id in EffectId::ALL {
            assert_eq!(registry.resolve(id.as_str()), Ok(&id.descriptor()));
        }
        assert_eq!(
            registry.resolve("sepia"),
            Err(UnknownEffect("sepia".to_owned()))
        );
    }
}
