//! Drawable lifecycle against the software context.

use quadfx::{
    DecodedImage, Drawable, DrawableState, EffectId, GpuApi, PrepareError, RADAR_PALETTE,
    RenderConfig, SoftContext,
};

const RED: [u8; 4] = [255, 0, 0, 255];
const BLUE: [u8; 4] = [0, 0, 255, 255];

fn solid(width: u32, height: u32, rgba: [u8; 4]) -> DecodedImage {
    DecodedImage::new(width, height, rgba.repeat((width * height) as usize)).unwrap()
}

#[test]
fn texture_effect_fills_the_viewport() {
    let mut ctx = SoftContext::new(4, 4);
    let mut drawable = Drawable::from_effect(EffectId::Texture);
    drawable.prepare(&mut ctx, Some(&solid(2, 2, RED))).unwrap();
    assert!(ctx.binding_state().is_baseline());

    drawable.draw(&mut ctx, 4, 4);
    for y in 0..4 {
        for x in 0..4 {
            assert_eq!(ctx.pixel(x, y), Some(RED), "pixel ({x}, {y})");
        }
    }
    assert!(ctx.binding_state().is_baseline());
    assert_eq!(ctx.take_error(), None);
}

#[test]
fn images_appear_upright() {
    let mut ctx = SoftContext::new(2, 2);
    // Top row red, bottom row blue.
    let image = DecodedImage::new(1, 2, [RED, BLUE].concat()).unwrap();
    let mut drawable = Drawable::from_effect(EffectId::Texture);
    drawable.prepare(&mut ctx, Some(&image)).unwrap();
    drawable.draw(&mut ctx, 2, 2);

    assert_eq!(ctx.pixel(0, 1), Some(RED));
    assert_eq!(ctx.pixel(0, 0), Some(BLUE));
}

#[test]
fn second_prepare_is_rejected_without_side_effects() {
    let mut ctx = SoftContext::new(4, 4);
    let image = solid(2, 2, RED);
    let mut drawable = Drawable::from_effect(EffectId::Wheel);
    drawable.prepare(&mut ctx, Some(&image)).unwrap();
    let counts = ctx.object_counts();
    let program = drawable.program();

    assert_eq!(
        drawable.prepare(&mut ctx, Some(&image)),
        Err(PrepareError::AlreadyPrepared)
    );
    assert_eq!(ctx.object_counts(), counts);
    assert_eq!(drawable.program(), program);
}

#[test]
fn prepare_creates_one_program_mesh_and_texture() {
    let mut ctx = SoftContext::new(4, 4);
    let mut drawable = Drawable::from_effect(EffectId::Blinds);
    drawable.prepare(&mut ctx, Some(&solid(2, 2, RED))).unwrap();

    let counts = ctx.object_counts();
    assert_eq!(counts.shaders, 0);
    assert_eq!(counts.programs, 1);
    assert_eq!(counts.vertex_arrays, 1);
    assert_eq!(counts.buffers, 2);
    assert_eq!(counts.textures, 1);
    assert_eq!(drawable.textures().len(), 1);
}

#[test]
fn context_loss_keeps_animation_and_allows_prepare() {
    let mut ctx = SoftContext::new(4, 4);
    let image = solid(2, 2, RED);
    let mut drawable = Drawable::from_effect(EffectId::Mosaic);
    drawable.prepare(&mut ctx, Some(&image)).unwrap();
    for _ in 0..3 {
        drawable.draw(&mut ctx, 4, 4);
    }
    let before = drawable.animation();
    let old_program = drawable.program();

    ctx.lose_context();
    drawable.context_lost();
    assert_eq!(drawable.state(), DrawableState::Uninitialized);
    assert_eq!(drawable.animation(), before);
    assert_eq!(ctx.object_counts().total(), 0);

    drawable.prepare(&mut ctx, Some(&image)).unwrap();
    assert_eq!(drawable.state(), DrawableState::Prepared);
    assert_ne!(drawable.program(), old_program);

    drawable.draw(&mut ctx, 4, 4);
    assert_eq!(drawable.animation().frame, before.frame + 1);
    assert_eq!(ctx.pixel(1, 1), Some(RED));
}

#[test]
fn release_deletes_everything() {
    let mut ctx = SoftContext::new(4, 4);
    let image = solid(2, 2, RED);
    for id in EffectId::ALL {
        let mut drawable = Drawable::from_effect(id);
        drawable
            .prepare(&mut ctx, Some(&image))
            .unwrap_or_else(|e| panic!("{id}: {e}"));
        drawable.draw(&mut ctx, 4, 4);
        drawable.release(&mut ctx);
        assert!(!drawable.is_prepared());
        assert_eq!(ctx.object_counts().total(), 0, "{id} leaked objects");
        assert!(ctx.binding_state().is_baseline(), "{id} left bindings");
    }
}

#[test]
fn radar_rotates_its_ring_colours() {
    let mut ctx = SoftContext::new(32, 32);
    let config = RenderConfig::new().procedural_size(32, 32);
    let mut drawable = Drawable::new(EffectId::Radar.descriptor(), config);
    drawable.prepare(&mut ctx, None).unwrap();

    drawable.draw(&mut ctx, 32, 32);
    assert_eq!(ctx.pixel(16, 16), Some(RADAR_PALETTE[0]));

    // The colour phase advances every 15 frames.
    for _ in 1..15 {
        drawable.draw(&mut ctx, 32, 32);
    }
    assert_eq!(drawable.animation().frame, 15);
    assert_eq!(ctx.pixel(16, 16), Some(RADAR_PALETTE[1]));
}

#[test]
fn drawables_on_separate_contexts_are_independent() {
    let image = solid(2, 2, RED);
    let mut first = SoftContext::new(4, 4);
    let mut second = SoftContext::new(4, 4);
    let mut a = Drawable::from_effect(EffectId::Texture);
    let mut b = Drawable::from_effect(EffectId::Triangle);
    a.prepare(&mut first, Some(&image)).unwrap();
    b.prepare(&mut second, None).unwrap();

    a.release(&mut first);
    assert_eq!(first.object_counts().total(), 0);
    assert_eq!(second.object_counts().programs, 1);
}
