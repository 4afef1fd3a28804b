//! Render and host configuration.
//!
//! Both configs use the builder style: start from [`Default`] and chain setters.
//!
//! ```
//! use quadfx::{AppConfig, EffectId, RenderConfig};
//!
//! let render = RenderConfig::new().clear_color([0.0, 0.0, 0.0, 1.0]).step(0.02);
//! let app = AppConfig::new().title("Wheel").effect(EffectId::Wheel);
//! ```

use std::path::PathBuf;

use crate::effect::{EffectId, UnknownEffect, UpdateRule};

/// Per-drawable rendering options.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderConfig {
    /// RGBA clear colour applied before every draw.
    pub clear_color: [f32; 4],
    /// Replaces the step of uniform-animated effects.
    pub step_override: Option<f32>,
    /// Replaces the `(width, height)` of procedural textures.
    pub procedural_size: Option<(u32, u32)>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            clear_color: [1.0, 0.5, 0.5, 0.5],
            step_override: None,
            procedural_size: None,
        }
    }
}

impl RenderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear_color(mut self, rgba: [f32; 4]) -> Self {
        self.clear_color = rgba;
        self
    }

    /// Non-finite steps are ignored.
    pub fn step(mut self, step: f32) -> Self {
        if step.is_finite() {
            self.step_override = Some(step);
        } else {
            log::warn!("ignoring non-finite animation step {step}");
        }
        self
    }

    pub fn procedural_size(mut self, width: u32, height: u32) -> Self {
        self.procedural_size = Some((width, height));
        self
    }

    /// `rule` with this config's overrides applied.
    pub fn apply(&self, rule: UpdateRule) -> UpdateRule {
        match rule {
            UpdateRule::UniformAnimated { step } => UpdateRule::UniformAnimated {
                step: self
                    .step_override
                    .filter(|s| s.is_finite())
                    .unwrap_or(step),
            },
            UpdateRule::ProceduralTexture {
                width,
                height,
                frames_per_step,
            } => {
                let (width, height) = self.procedural_size.unwrap_or((width, height));
                UpdateRule::ProceduralTexture {
                    width,
                    height,
                    frames_per_step,
                }
            }
            UpdateRule::Static => UpdateRule::Static,
        }
    }
}

/// Command-line arguments the demo host could not make sense of.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    UnknownEffect(#[from] UnknownEffect),
    #[error("unexpected argument '{0}'")]
    UnexpectedArgument(String),
}

/// Demo host configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub effect: EffectId,
    /// Image for image-backed effects. A generated checkerboard is used when absent.
    pub image_path: Option<PathBuf>,
    pub render: RenderConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "quadfx".to_string(),
            width: 800,
            height: 600,
            effect: EffectId::Texture,
            image_path: None,
            render: RenderConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn effect(mut self, effect: EffectId) -> Self {
        self.effect = effect;
        self
    }

    pub fn image_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.image_path = Some(path.into());
        self
    }

    pub fn render(mut self, render: RenderConfig) -> Self {
        self.render = render;
        self
    }

    /// Parses `[effect-name] [image-path]`, without the program name.
    pub fn from_args<I>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let mut config = Self::default();
        let mut args = args.into_iter().map(Into::into);
        if let Some(effect) = args.next() {
            config.effect = effect.parse()?;
            config.title = format!("quadfx - {}", config.effect);
        }
        if let Some(path) = args.next() {
            config.image_path = Some(PathBuf::from(path));
        }
        if let Some(extra) = args.next() {
            return Err(ConfigError::UnexpectedArgument(extra));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_stock_clear_colour() {
        assert_eq!(RenderConfig::default().clear_color, [1.0, 0.5, 0.5, 0.5]);
        assert_eq!(AppConfig::default().effect, EffectId::Texture);
    }

    #[test]
    fn args_select_effect_and_image() {
        let config = AppConfig::from_args(["wheel", "photo.png"]).unwrap();
        assert_eq!(config.effect, EffectId::Wheel);
        assert_eq!(config.image_path, Some(PathBuf::from("photo.png")));

        assert_eq!(AppConfig::from_args(Vec::<String>::new()).unwrap(), AppConfig::default());
    }

    #[test]
    fn bad_args_are_rejected() {
        assert!(matches!(
            AppConfig::from_args(["sepia"]),
            Err(ConfigError::UnknownEffect(_))
        ));
        assert_eq!(
            AppConfig::from_args(["texture", "a.png", "b.png"]),
            Err(ConfigError::UnexpectedArgument("b.png".to_owned()))
        );
    }

    #[test]
    fn overrides_apply_to_matching_rules() {
        let config = RenderConfig::new().step(0.1).procedural_size(8, 4);
        assert_eq!(
            config.apply(UpdateRule::UniformAnimated { step: 0.01 }),
            UpdateRule::UniformAnimated { step: 0.1 }
        );
        assert_eq!(
            config.apply(UpdateRule::ProceduralTexture {
                width: 512,
                height: 512,
                frames_per_step: 15
            }),
            UpdateRule::ProceduralTexture {
                width: 8,
                height: 4,
                frames_per_step: 15
            }
        );
        assert_eq!(config.apply(UpdateRule::Static), UpdateRule::Static);
    }

    #[test]
    fn non_finite_steps_keep_the_effect_step() {
        let rule = UpdateRule::UniformAnimated { step: 0.005 };
        for step in [f32::NAN, f32::INFINITY, f32::NEG_INFINITY] {
            let config = RenderConfig::new().step(step);
            assert_eq!(config.step_override, None);
            assert_eq!(config.apply(rule), rule);

            let forced = RenderConfig {
                step_override: Some(step),
                ..RenderConfig::default()
            };
            assert_eq!(forced.apply(rule), rule);
        }
    }
}
