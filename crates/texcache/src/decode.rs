//! Palette and direct-color decoders: VRAM halfwords to RGBA8888 texels.

use crate::geom::{page_start_x, page_start_y, TEXTURE_PAGE_HEIGHT, TEXTURE_PAGE_WIDTH};
use crate::vram::{rgba5551_to_rgba8888, PaletteReg, TextureMode, VramView};

#[inline]
fn clut_color(clut: &[u16], index: usize) -> u32 {
    // Clamped palettes can be shorter than the mode's nominal size.
    rgba5551_to_rgba8888(clut.get(index).copied().unwrap_or(0))
}

/// One row of P4 texels. `src` may be short (clamped at the VRAM edge);
/// missing halfwords decode as index 0.
fn decode_row4(src: &[u16], clut: &[u16], dest: &mut [u32]) {
    let width = dest.len();
    // Whole halfwords, 4 texels each.
    let mut x = 0;
    for &hw in src.iter().take(width / 4) {
        dest[x] = clut_color(clut, (hw & 0xf) as usize);
        dest[x + 1] = clut_color(clut, ((hw >> 4) & 0xf) as usize);
        dest[x + 2] = clut_color(clut, ((hw >> 8) & 0xf) as usize);
        dest[x + 3] = clut_color(clut, ((hw >> 12) & 0xf) as usize);
        x += 4;
    }
    while x < width {
        let hw = src.get(x / 4).copied().unwrap_or(0);
        dest[x] = clut_color(clut, ((hw >> ((x % 4) * 4)) & 0xf) as usize);
        x += 1;
    }
}

fn decode_row8(src: &[u16], clut: &[u16], dest: &mut [u32]) {
    let width = dest.len();
    let mut x = 0;
    for &hw in src.iter().take(width / 2) {
        dest[x] = clut_color(clut, (hw & 0xff) as usize);
        dest[x + 1] = clut_color(clut, (hw >> 8) as usize);
        x += 2;
    }
    while x < width {
        let hw = src.get(x / 2).copied().unwrap_or(0);
        dest[x] = clut_color(clut, ((hw >> ((x % 2) * 8)) & 0xff) as usize);
        x += 1;
    }
}

fn decode_row16(src: &[u16], dest: &mut [u32]) {
    for (x, out) in dest.iter_mut().enumerate() {
        *out = rgba5551_to_rgba8888(src.get(x).copied().unwrap_or(0));
    }
}

/// Decodes a rect of VRAM starting at halfword `(x, y)` into `dest`.
/// `width` and `dest_stride` are in texels; the source footprint in
/// halfwords is `width >> mode.shift()` per row.
pub fn decode_rect(
    vram: &VramView,
    mode: TextureMode,
    x: u32,
    y: u32,
    clut: &[u16],
    width: u32,
    height: u32,
    dest: &mut [u32],
    dest_stride: usize,
) {
    let width_hw = (width + ((1 << mode.shift()) - 1)) >> mode.shift();
    for row in 0..height {
        let src = vram.row(x, y + row, width_hw);
        let out = &mut dest[row as usize * dest_stride..][..width as usize];
        match mode {
            TextureMode::Palette4Bit => decode_row4(src, clut, out),
            TextureMode::Palette8Bit => decode_row8(src, clut, out),
            _ => decode_row16(src, out),
        }
    }
}

/// Decodes the full 256x256-texel page into `dest` (stride 256).
pub fn decode_page(
    vram: &VramView,
    page: u32,
    palette: PaletteReg,
    mode: TextureMode,
    dest: &mut [u32],
) {
    debug_assert!(dest.len() >= (TEXTURE_PAGE_WIDTH * TEXTURE_PAGE_HEIGHT) as usize);
    let clut = if mode.has_palette() {
        vram.palette(palette, mode)
    } else {
        &[]
    };
    decode_rect(
        vram,
        mode,
        page_start_x(page),
        page_start_y(page),
        clut,
        TEXTURE_PAGE_WIDTH,
        TEXTURE_PAGE_HEIGHT,
        dest,
        TEXTURE_PAGE_WIDTH as usize,
    );
}
