//! Read-only view over the externally owned VRAM buffer, plus the texture
//! mode and palette-register types shared by every other module.

use crate::geom::{
    page_start_x, page_start_y, Rect, VRAM_HEIGHT, VRAM_PAGE_X_MASK, VRAM_WIDTH,
};

/// Largest palette a mode can address (P8).
pub const MAX_CLUT_SIZE: usize = 256;

/// Pixel interpretation of a texture page.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(u8)]
pub enum TextureMode {
    Palette4Bit = 0,
    Palette8Bit = 1,
    Direct16Bit = 2,
    /// Hardware aliases mode 3 to direct 16-bit.
    ReservedDirect16Bit = 3,
}

impl TextureMode {
    pub const fn from_raw(raw: u8) -> TextureMode {
        match raw & 3 {
            0 => TextureMode::Palette4Bit,
            1 => TextureMode::Palette8Bit,
            2 => TextureMode::Direct16Bit,
            _ => TextureMode::ReservedDirect16Bit,
        }
    }

    pub const fn has_palette(self) -> bool {
        matches!(self, TextureMode::Palette4Bit | TextureMode::Palette8Bit)
    }

    /// log2 of texels per VRAM halfword.
    pub const fn shift(self) -> u32 {
        match self {
            TextureMode::Palette4Bit => 2,
            TextureMode::Palette8Bit => 1,
            _ => 0,
        }
    }

    /// Converts an X coordinate or width from VRAM halfwords to texels.
    pub const fn apply_shift(self, x: i32) -> i32 {
        x << self.shift()
    }

    /// VRAM pages a 256x256-texel page footprint spans horizontally.
    pub const fn texture_page_count(self) -> u32 {
        match self {
            TextureMode::Palette4Bit => 1,
            TextureMode::Palette8Bit => 2,
            _ => 4,
        }
    }

    pub const fn palette_size(self) -> usize {
        match self {
            TextureMode::Palette4Bit => 16,
            TextureMode::Palette8Bit => 256,
            _ => 0,
        }
    }
}

/// Packed CLUT location register: 6 bits of X (in 16-pixel steps), 9 of Y.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PaletteReg(pub u16);

impl PaletteReg {
    pub const fn from_coords(x: u32, y: u32) -> PaletteReg {
        PaletteReg((((x / 16) & 0x3f) | (y << 6)) as u16)
    }

    pub const fn x(self) -> u32 {
        ((self.0 as u32) & 0x3f) * 16
    }

    pub const fn y(self) -> u32 {
        ((self.0 as u32) >> 6) & 0x1ff
    }
}

impl std::fmt::Debug for PaletteReg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CLUT@{},{}", self.x(), self.y())
    }
}

/// One row of VRAM starting at the palette register, clamped at the right
/// edge of VRAM. A P8 palette placed past x=768 comes back short.
pub fn palette_rect(reg: PaletteReg, mode: TextureMode) -> Rect {
    let width = (mode.palette_size() as u32).min(VRAM_WIDTH - reg.x());
    Rect::from_extents(reg.x(), reg.y(), width, 1)
}

/// Footprint of the 256x256-texel page starting at `page`, in VRAM
/// halfwords. Wide modes wrap in X; the wrapped portion is the same rect
/// shifted back to the row start, so the unwrapped rect clamped to VRAM
/// covers it for invalidation purposes.
pub fn texture_page_rect(page: u32, mode: TextureMode) -> Rect {
    let x = page_start_x(page);
    let y = page_start_y(page);
    let width_hw = crate::geom::VRAM_PAGE_WIDTH * mode.texture_page_count();
    let right = (x + width_hw).min(VRAM_WIDTH);
    Rect::new(x as i32, y as i32, right as i32, (y + 256).min(VRAM_HEIGHT) as i32)
}

/// Page of the grid row that contains the palette row start.
pub fn palette_page(reg: PaletteReg) -> u32 {
    let x_page = reg.x() / crate::geom::VRAM_PAGE_WIDTH;
    let y_page = reg.y() / crate::geom::VRAM_PAGE_HEIGHT;
    crate::geom::page_index(x_page & VRAM_PAGE_X_MASK, y_page)
}

/// Borrowed, read-only VRAM. The emulator owns the buffer; the cache only
/// ever hashes and decodes out of it.
#[derive(Clone, Copy)]
pub struct VramView<'a> {
    data: &'a [u16],
}

impl<'a> VramView<'a> {
    pub fn new(data: &'a [u16]) -> VramView<'a> {
        assert_eq!(data.len(), (VRAM_WIDTH * VRAM_HEIGHT) as usize);
        VramView { data }
    }

    pub fn pixel(&self, x: u32, y: u32) -> u16 {
        self.data[(y * VRAM_WIDTH + x) as usize]
    }

    /// `len` halfwords starting at `(x, y)`, clamped at the end of the
    /// buffer. Wide page footprints on the last row can run past the end;
    /// the caller zero-pads the difference.
    pub fn row(&self, x: u32, y: u32, len: u32) -> &'a [u16] {
        let start = (y * VRAM_WIDTH + x) as usize;
        let end = (start + len as usize).min(self.data.len());
        &self.data[start.min(self.data.len())..end]
    }

    /// The CLUT addressed by `reg`, clamped at the right edge of VRAM.
    pub fn palette(&self, reg: PaletteReg, mode: TextureMode) -> &'a [u16] {
        let r = palette_rect(reg, mode);
        self.row(r.left as u32, r.top as u32, r.width() as u32)
    }
}

/// PSX 1555 (mask bit in 15) to RGBA8888, mask bit becoming alpha 0/255.
/// The low three bits of each 5-bit channel are replicated.
pub const fn rgba5551_to_rgba8888(color: u16) -> u32 {
    let r = (color & 31) as u32;
    let g = ((color >> 5) & 31) as u32;
    let b = ((color >> 10) & 31) as u32;
    let a = if (color & 0x8000) != 0 { 0xffu32 } else { 0 };
    let r = (r << 3) | (r & 7);
    let g = (g << 3) | (g & 7);
    let b = (b << 3) | (b & 7);
    r | (g << 8) | (b << 16) | (a << 24)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::VRAM_WIDTH;

    fn vram_buffer() -> Vec<u16> {
        vec![0u16; (VRAM_WIDTH * VRAM_HEIGHT) as usize]
    }

    #[test]
    fn mode_properties() {
        assert_eq!(TextureMode::Palette4Bit.apply_shift(64), 256);
        assert_eq!(TextureMode::Palette8Bit.apply_shift(64), 128);
        assert_eq!(TextureMode::Direct16Bit.apply_shift(64), 64);
        assert_eq!(TextureMode::from_raw(3), TextureMode::ReservedDirect16Bit);
        assert_eq!(TextureMode::ReservedDirect16Bit.texture_page_count(), 4);
        assert!(!TextureMode::Direct16Bit.has_palette());
    }

    #[test]
    fn palette_reg_coords() {
        let reg = PaletteReg::from_coords(512, 480);
        assert_eq!(reg.x(), 512);
        assert_eq!(reg.y(), 480);
    }

    #[test]
    fn palette_clamps_at_vram_edge() {
        let buf = vram_buffer();
        let vram = VramView::new(&buf);
        let reg = PaletteReg::from_coords(960, 100);
        assert_eq!(vram.palette(reg, TextureMode::Palette8Bit).len(), 64);
        assert_eq!(vram.palette(reg, TextureMode::Palette4Bit).len(), 16);
    }

    #[test]
    fn texture_page_rect_clamps() {
        // C16 page at x=960 would span 256 halfwords; VRAM ends at 1024.
        let r = texture_page_rect(15, TextureMode::Direct16Bit);
        assert_eq!(r, Rect::new(960, 0, 1024, 256));
        let r = texture_page_rect(0, TextureMode::Palette4Bit);
        assert_eq!(r, Rect::new(0, 0, 64, 256));
    }

    #[test]
    fn color_conversion() {
        assert_eq!(rgba5551_to_rgba8888(0), 0);
        // Pure white with mask bit.
        assert_eq!(rgba5551_to_rgba8888(0xffff), 0xffff_ffff);
        // Pure red, no mask bit.
        assert_eq!(rgba5551_to_rgba8888(0x001f), 0x0000_00ff);
    }
}
