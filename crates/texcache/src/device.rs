//! Boundary to the GPU backend.
//!
//! The cache never talks to a graphics API directly; it asks a [`GpuDevice`]
//! for textures and for the replacement compositing pass. A CPU
//! implementation ([`SoftwareDevice`]) ships for tests and headless use.

use thiserror::Error;

use crate::geom::Rect;

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("failed to allocate {width}x{height} texture")]
    TextureAllocationFailed { width: u32, height: u32 },
    #[error("failed to allocate {width}x{height} replacement render target")]
    RenderTargetAllocationFailed { width: u32, height: u32 },
    #[error("failed to create replacement pipelines")]
    PipelineCreationFailed,
}

/// One replacement image to draw on top of the scaled base page.
pub struct ReplacementBlit<'a> {
    /// Tightly packed RGBA8 bytes, `width * 4` per row.
    pub pixels: &'a [u8],
    pub width: u32,
    pub height: u32,
    /// Destination in output pixels, already scaled.
    pub dst_rect: Rect,
    /// Semitransparent candidates are stored with alpha inverted on disk;
    /// the draw pass inverts it back.
    pub invert_alpha: bool,
}

pub trait GpuDevice {
    type Texture;

    fn max_texture_size(&self) -> u32;

    /// Allocates an RGBA8 2D texture. May hand back a pooled one.
    fn create_texture(&mut self, width: u32, height: u32) -> Result<Self::Texture, GpuError>;

    /// Returns a texture to the device. The cache calls this instead of
    /// dropping so backends can pool.
    fn recycle_texture(&mut self, texture: Self::Texture);

    /// Uploads `pixels` (row stride `stride` texels) into a region.
    fn upload_texture(
        &mut self,
        texture: &mut Self::Texture,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        pixels: &[u32],
        stride: usize,
    );

    /// Renders `base` scaled to `width`x`height`, then each blit on top
    /// (no blending; the base pass skips nothing, subimage passes replace
    /// covered pixels outright). Returns the new texture; `base` is left
    /// untouched for the caller to recycle.
    #[allow(clippy::too_many_arguments)]
    fn composite_replacements(
        &mut self,
        base: &Self::Texture,
        width: u32,
        height: u32,
        blits: &[ReplacementBlit],
        linear_filter: bool,
    ) -> Result<Self::Texture, GpuError>;

    /// Rebuilds the compositing pipelines (e.g. after the filter setting
    /// flips). An error here is unrecoverable for the caller.
    fn recreate_replacement_pipelines(&mut self, linear_filter: bool) -> Result<(), GpuError> {
        let _ = linear_filter;
        Ok(())
    }
}

/// CPU-side RGBA8 texture.
pub struct SoftwareTexture {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u32>,
}

impl SoftwareTexture {
    pub fn pixel(&self, x: u32, y: u32) -> u32 {
        self.pixels[(y * self.width + x) as usize]
    }
}

/// Reference device: nearest/linear scaling in software, (width, height)
/// keyed recycle pool. Tests can force allocation failures.
pub struct SoftwareDevice {
    max_texture_size: u32,
    pool: Vec<SoftwareTexture>,
    pub created: u32,
    pub recycled_hits: u32,
    pub fail_next_allocations: u32,
}

impl Default for SoftwareDevice {
    fn default() -> Self {
        SoftwareDevice::new(4096)
    }
}

impl SoftwareDevice {
    pub fn new(max_texture_size: u32) -> SoftwareDevice {
        SoftwareDevice {
            max_texture_size,
            pool: Vec::new(),
            created: 0,
            recycled_hits: 0,
            fail_next_allocations: 0,
        }
    }

    pub fn pooled(&self) -> usize {
        self.pool.len()
    }
}

fn sample_base(base: &SoftwareTexture, u: f32, v: f32, linear: bool) -> u32 {
    if !linear {
        let x = (u as u32).min(base.width - 1);
        let y = (v as u32).min(base.height - 1);
        return base.pixel(x, y);
    }
    let x0 = (u.floor() as u32).min(base.width - 1);
    let y0 = (v.floor() as u32).min(base.height - 1);
    let x1 = (x0 + 1).min(base.width - 1);
    let y1 = (y0 + 1).min(base.height - 1);
    let fx = u.fract();
    let fy = v.fract();
    let mut out = 0u32;
    for shift in [0, 8, 16, 24] {
        let c = |x: u32, y: u32| ((base.pixel(x, y) >> shift) & 0xff) as f32;
        let top = c(x0, y0) * (1.0 - fx) + c(x1, y0) * fx;
        let bot = c(x0, y1) * (1.0 - fx) + c(x1, y1) * fx;
        let val = (top * (1.0 - fy) + bot * fy).round() as u32;
        out |= (val & 0xff) << shift;
    }
    out
}

impl GpuDevice for SoftwareDevice {
    type Texture = SoftwareTexture;

    fn max_texture_size(&self) -> u32 {
        self.max_texture_size
    }

    fn create_texture(&mut self, width: u32, height: u32) -> Result<SoftwareTexture, GpuError> {
        if self.fail_next_allocations > 0 {
            self.fail_next_allocations -= 1;
            return Err(GpuError::TextureAllocationFailed { width, height });
        }
        if let Some(pos) = self
            .pool
            .iter()
            .position(|t| t.width == width && t.height == height)
        {
            self.recycled_hits += 1;
            let mut tex = self.pool.swap_remove(pos);
            tex.pixels.fill(0);
            return Ok(tex);
        }
        self.created += 1;
        Ok(SoftwareTexture {
            width,
            height,
            pixels: vec![0u32; (width * height) as usize],
        })
    }

    fn recycle_texture(&mut self, texture: SoftwareTexture) {
        self.pool.push(texture);
    }

    fn upload_texture(
        &mut self,
        texture: &mut SoftwareTexture,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        pixels: &[u32],
        stride: usize,
    ) {
        for row in 0..height {
            let src = &pixels[row as usize * stride..][..width as usize];
            let dst_start = ((y + row) * texture.width + x) as usize;
            texture.pixels[dst_start..dst_start + width as usize].copy_from_slice(src);
        }
    }

    fn composite_replacements(
        &mut self,
        base: &SoftwareTexture,
        width: u32,
        height: u32,
        blits: &[ReplacementBlit],
        linear_filter: bool,
    ) -> Result<SoftwareTexture, GpuError> {
        if self.fail_next_allocations > 0 {
            self.fail_next_allocations -= 1;
            return Err(GpuError::RenderTargetAllocationFailed { width, height });
        }
        let mut out = self.create_texture(width, height)?;

        // Base pass: scale the decoded page to fill the target.
        let sx = base.width as f32 / width as f32;
        let sy = base.height as f32 / height as f32;
        for y in 0..height {
            for x in 0..width {
                let p = sample_base(base, x as f32 * sx, y as f32 * sy, linear_filter);
                out.pixels[(y * width + x) as usize] = p;
            }
        }

        // Subimage passes: nearest-scale each blit into its dst rect.
        for blit in blits {
            let dst = blit.dst_rect.intersect(&Rect::from_extents(0, 0, width, height));
            if dst.is_empty() {
                continue;
            }
            let bw = blit.dst_rect.width() as f32;
            let bh = blit.dst_rect.height() as f32;
            for y in dst.top..dst.bottom {
                let sv = ((y - blit.dst_rect.top) as f32 / bh * blit.height as f32) as u32;
                let sv = sv.min(blit.height - 1);
                for x in dst.left..dst.right {
                    let su = ((x - blit.dst_rect.left) as f32 / bw * blit.width as f32) as u32;
                    let su = su.min(blit.width - 1);
                    let idx = ((sv * blit.width + su) * 4) as usize;
                    let [r, g, b, a] = [
                        blit.pixels[idx],
                        blit.pixels[idx + 1],
                        blit.pixels[idx + 2],
                        blit.pixels[idx + 3],
                    ];
                    let a = if blit.invert_alpha { 0xff - a } else { a };
                    out.pixels[(y as u32 * width + x as u32) as usize] = u32::from_le_bytes([r, g, b, a]);
                }
            }
        }
        Ok(out)
    }
}
