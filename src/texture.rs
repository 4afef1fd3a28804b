//! 2D RGBA8 textures.
//!
//! [`GpuTexture`] owns one texture object. Uploads are validated before any object is
//! created, filtering is set to nearest for minification and linear for magnification,
//! and the texture is unbound again before returning.
//!
//! Decoded images store their first row at the top, while texture coordinates put
//! `v = 0` at the bottom. [`GpuTexture::upload_image`] flips rows so the image appears
//! upright on the quad.

use crate::backend::{GpuApi, TextureFilter, TextureId, TextureParameter};
use crate::error::ResourceError;

/// Tightly packed RGBA8 pixels, top row first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl DecodedImage {
    /// Wraps an RGBA8 buffer, checking its length.
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, ResourceError> {
        check_dimensions(width, height, pixels.len())?;
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Decodes any format the `image` crate understands.
    pub fn decode(bytes: &[u8]) -> Result<Self, image::ImageError> {
        let img = image::load_from_memory(bytes)?.to_rgba8();
        let (width, height) = img.dimensions();
        Ok(Self {
            width,
            height,
            pixels: img.into_raw(),
        })
    }

    /// Load and decode an image file.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, image::ImageError> {
        let img = image::open(path)?.to_rgba8();
        let (width, height) = img.dimensions();
        Ok(Self {
            width,
            height,
            pixels: img.into_raw(),
        })
    }

    /// A two-colour checkerboard with `cell`-pixel squares.
    pub fn checkerboard(width: u32, height: u32, cell: u32, a: [u8; 4], b: [u8; 4]) -> Self {
        let cell = cell.max(1);
        let mut pixels = Vec::with_capacity(width as usize * height as usize * 4);
        for y in 0..height {
            for x in 0..width {
                let even = ((x / cell) + (y / cell)) % 2 == 0;
                pixels.extend_from_slice(if even { &a } else { &b });
            }
        }
        Self {
            width,
            height,
            pixels,
        }
    }
}

/// Reverses the row order of a tightly packed RGBA8 buffer.
pub fn flip_rows(pixels: &[u8], width: u32, height: u32) -> Vec<u8> {
    let row = (width as usize * 4).max(1);
    let mut out = Vec::with_capacity(pixels.len());
    for line in pixels.chunks_exact(row).take(height as usize).rev() {
        out.extend_from_slice(line);
    }
    out
}

fn check_dimensions(width: u32, height: u32, len: usize) -> Result<(), ResourceError> {
    if width == 0 || height == 0 {
        return Err(ResourceError::ZeroSize { width, height });
    }
    let expected = width as usize * height as usize * 4;
    if len != expected {
        return Err(ResourceError::PixelBufferSize {
            width,
            height,
            expected,
            actual: len,
        });
    }
    Ok(())
}

/// A texture object in a context.
#[derive(Debug)]
pub struct GpuTexture {
    handle: TextureId,
    width: u32,
    height: u32,
    min_filter: TextureFilter,
    mag_filter: TextureFilter,
}

impl GpuTexture {
    /// Uploads `pixels` in row order: row 0 lands at `v = 0`.
    pub fn upload(
        ctx: &mut impl GpuApi,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Self, ResourceError> {
        check_dimensions(width, height, pixels.len())?;

        let handle = ctx.create_texture();
        ctx.active_texture(0);
        ctx.bind_texture(Some(handle));
        ctx.tex_parameter(TextureParameter::MinFilter(TextureFilter::Nearest));
        ctx.tex_parameter(TextureParameter::MagFilter(TextureFilter::Linear));
        ctx.tex_image_2d(width, height, pixels);
        ctx.bind_texture(None);

        log::debug!("uploaded texture {}: {width}x{height}", handle.get());
        Ok(Self {
            handle,
            width,
            height,
            min_filter: TextureFilter::Nearest,
            mag_filter: TextureFilter::Linear,
        })
    }

    /// Uploads a decoded image upright.
    pub fn upload_image(ctx: &mut impl GpuApi, image: &DecodedImage) -> Result<Self, ResourceError> {
        check_dimensions(image.width, image.height, image.pixels.len())?;
        let flipped = flip_rows(&image.pixels, image.width, image.height);
        Self::upload(ctx, &flipped, image.width, image.height)
    }

    /// Replaces the full contents. Dimensions must match the original upload.
    pub fn reupload(&self, ctx: &mut impl GpuApi, pixels: &[u8]) -> Result<(), ResourceError> {
        check_dimensions(self.width, self.height, pixels.len())?;
        ctx.active_texture(0);
        ctx.bind_texture(Some(self.handle));
        ctx.tex_image_2d(self.width, self.height, pixels);
        ctx.bind_texture(None);
        Ok(())
    }

    /// Binds to texture unit `unit`. The active unit is left at `unit`.
    pub fn bind(&self, ctx: &mut impl GpuApi, unit: u32) {
        ctx.active_texture(unit);
        ctx.bind_texture(Some(self.handle));
    }

    /// Clears texture unit `unit` and makes unit 0 active again.
    pub fn unbind(ctx: &mut impl GpuApi, unit: u32) {
        ctx.active_texture(unit);
        ctx.bind_texture(None);
        ctx.active_texture(0);
    }

    pub fn handle(&self) -> TextureId {
        self.handle
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn filters(&self) -> (TextureFilter, TextureFilter) {
        (self.min_filter, self.mag_filter)
    }

    /// Deletes the texture object.
    pub fn release(self, ctx: &mut impl GpuApi) {
        log::debug!("deleting texture {}", self.handle.get());
        ctx.delete_texture(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftContext;

    fn gradient(width: u32, height: u32) -> Vec<u8> {
        (0..width * height)
            .flat_map(|i| [(i % width) as u8, (i / width) as u8, 7, 255])
            .collect()
    }

    #[test]
    fn image_rows_are_flipped_on_upload() {
        let mut ctx = SoftContext::new(1, 1);
        let (w, h) = (3, 4);
        let image = DecodedImage::new(w, h, gradient(w, h)).unwrap();
        let texture = GpuTexture::upload_image(&mut ctx, &image).unwrap();

        let texels = ctx.read_texture(texture.handle()).unwrap();
        for y in 0..h as usize {
            for x in 0..w as usize {
                let t = (y * w as usize + x) * 4;
                let p = ((h as usize - 1 - y) * w as usize + x) * 4;
                assert_eq!(texels[t..t + 4], image.pixels[p..p + 4]);
            }
        }
    }

    #[test]
    fn upload_sets_filters_and_unbinds() {
        let mut ctx = SoftContext::new(1, 1);
        let texture = GpuTexture::upload(&mut ctx, &[1, 2, 3, 4], 1, 1).unwrap();
        assert_eq!(
            texture.filters(),
            (TextureFilter::Nearest, TextureFilter::Linear)
        );
        assert!(ctx.binding_state().is_baseline());
        assert_eq!(ctx.take_error(), None);
    }

    #[test]
    fn wrong_buffer_length_creates_no_texture() {
        let mut ctx = SoftContext::new(1, 1);
        let err = GpuTexture::upload(&mut ctx, &[0; 12], 2, 2).unwrap_err();
        assert_eq!(
            err,
            ResourceError::PixelBufferSize {
                width: 2,
                height: 2,
                expected: 16,
                actual: 12
            }
        );
        assert_eq!(
            GpuTexture::upload(&mut ctx, &[], 0, 4).unwrap_err(),
            ResourceError::ZeroSize {
                width: 0,
                height: 4
            }
        );
        assert_eq!(ctx.object_counts().textures, 0);
    }

    #[test]
    fn reupload_replaces_texels() {
        let mut ctx = SoftContext::new(1, 1);
        let texture = GpuTexture::upload(&mut ctx, &[0; 4], 1, 1).unwrap();
        texture.reupload(&mut ctx, &[9, 8, 7, 6]).unwrap();
        assert_eq!(ctx.read_texture(texture.handle()), Some(vec![9, 8, 7, 6]));
        assert!(texture.reupload(&mut ctx, &[0; 8]).is_err());
    }

    #[test]
    fn checkerboard_alternates_cells() {
        let board = DecodedImage::checkerboard(4, 2, 2, [255; 4], [0, 0, 0, 255]);
        assert_eq!(board.pixels.len(), 32);
        assert_eq!(board.pixels[0..4], [255; 4]);
        assert_eq!(board.pixels[8..12], [0, 0, 0, 255]);
    }
}
