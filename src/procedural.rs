//! Procedurally generated textures.
//!
//! A generator is a pure function of `(x, y, frame)`, so the same frame always yields
//! the same bytes and the texture can be regenerated from scratch on every tick.

/// Ring colours, rotated by the colour phase: red, green, yellow, cyan.
pub const RADAR_PALETTE: [[u8; 4]; 4] = [
    [255, 0, 0, 255],
    [0, 255, 0, 255],
    [255, 255, 0, 255],
    [0, 255, 255, 255],
];

/// Colour of the outermost ring.
pub const RADAR_OUTER: [u8; 4] = [128, 128, 128, 255];

/// Concentric rings around the texture center whose colours cycle over time.
///
/// Ring radii are `h/16`, `h/8`, `h/4`, `h/2` and `h`, where `h` is the texture height.
/// The inner four rings take palette entries `(ring + phase) % 4`; the phase advances
/// once every `frames_per_step` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadarGenerator {
    pub width: u32,
    pub height: u32,
    pub frames_per_step: u32,
}

impl RadarGenerator {
    pub fn new(width: u32, height: u32, frames_per_step: u32) -> Self {
        Self {
            width,
            height,
            frames_per_step: frames_per_step.max(1),
        }
    }

    /// Number of frames after which the pattern repeats.
    pub fn period(&self) -> u64 {
        RADAR_PALETTE.len() as u64 * u64::from(self.frames_per_step.max(1))
    }

    /// Colour phase at `frame`, in `0..4`.
    pub fn phase(&self, frame: u64) -> usize {
        ((frame / u64::from(self.frames_per_step.max(1))) % RADAR_PALETTE.len() as u64) as usize
    }

    /// Colour of texel `(x, y)` at `frame`.
    pub fn pixel(&self, x: u32, y: u32, frame: u64) -> [u8; 4] {
        self.pixel_at_phase(x, y, self.phase(frame))
    }

    fn pixel_at_phase(&self, x: u32, y: u32, phase: usize) -> [u8; 4] {
        let dx = i64::from(x) - i64::from(self.width / 2);
        let dy = i64::from(y) - i64::from(self.height / 2);
        let d2 = (dx * dx + dy * dy) as f64;

        let h = f64::from(self.height);
        let radii = [h / 16.0, h / 8.0, h / 4.0, h / 2.0];
        if let Some(ring) = radii.iter().position(|r| d2 < r * r) {
            return RADAR_PALETTE[(ring + phase) % RADAR_PALETTE.len()];
        }
        if d2 < h * h {
            RADAR_OUTER
        } else {
            [0; 4]
        }
    }

    /// The full RGBA8 texture at `frame`, row 0 first.
    pub fn generate(&self, frame: u64) -> Vec<u8> {
        let mut pixels = Vec::with_capacity(self.width as usize * self.height as usize * 4);
        self.fill(frame, &mut pixels);
        pixels
    }

    /// Like [`generate`](Self::generate), reusing `pixels`' allocation.
    pub fn fill(&self, frame: u64, pixels: &mut Vec<u8>) {
        let phase = self.phase(frame);
        pixels.clear();
        for y in 0..self.height {
            for x in 0..self.width {
                pixels.extend_from_slice(&self.pixel_at_phase(x, y, phase));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_repeats_after_one_period() {
        let radar = RadarGenerator::new(64, 64, 15);
        assert_eq!(radar.period(), 60);
        for frame in [0, 7, 15, 44] {
            assert_eq!(radar.generate(frame), radar.generate(frame + radar.period()));
        }
        assert_ne!(radar.generate(0), radar.generate(15));
    }

    #[test]
    fn rings_rotate_through_the_palette() {
        let radar = RadarGenerator::new(64, 64, 1);
        let (cx, cy) = (32, 32);
        assert_eq!(radar.pixel(cx, cy, 0), RADAR_PALETTE[0]);
        assert_eq!(radar.pixel(cx, cy, 1), RADAR_PALETTE[1]);
        // Between h/16 and h/8 from the center.
        assert_eq!(radar.pixel(cx + 6, cy, 0), RADAR_PALETTE[1]);
        assert_eq!(radar.pixel(cx + 6, cy, 3), RADAR_PALETTE[0]);
    }

    #[test]
    fn outer_ring_is_grey() {
        let radar = RadarGenerator::new(64, 64, 1);
        // Corner: farther than h/2 but inside h.
        assert_eq!(radar.pixel(0, 0, 0), RADAR_OUTER);
    }

    #[test]
    fn beyond_the_outer_ring_is_transparent() {
        // A wide texture reaches past radius h.
        let radar = RadarGenerator::new(64, 8, 1);
        assert_eq!(radar.pixel(0, 4, 0), [0; 4]);
    }

    #[test]
    fn generate_has_rgba8_length() {
        let radar = RadarGenerator::new(5, 3, 2);
        assert_eq!(radar.generate(0).len(), 5 * 3 * 4);
    }
}
