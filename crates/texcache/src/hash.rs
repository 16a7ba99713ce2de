//! Content hashing. Identity of cached textures, palettes and uploads is
//! entirely content-based: XXH3-64 for cache keys, XXH3-128 for the
//! `vram-write` replacement names.

use xxhash_rust::xxh3::{xxh3_128, Xxh3};

use crate::geom::{page_start_x, page_start_y, Rect, TEXTURE_PAGE_WIDTH};
use crate::vram::{PaletteReg, TextureMode, VramView};

pub type ContentHash = u64;

/// Hashes a rect of raw VRAM halfwords row by row.
pub fn hash_rect(vram: &VramView, rect: &Rect) -> ContentHash {
    let mut hasher = Xxh3::new();
    let width = rect.width() as u32;
    for y in rect.top..rect.bottom {
        let row = vram.row(rect.left as u32, y as u32, width);
        hasher.update(bytemuck::cast_slice(row));
    }
    hasher.digest()
}

/// Hashes the VRAM bytes backing one 256x256-texel page in `mode`. The byte
/// width depends on the mode (wide modes read 2x/4x the halfwords); rows
/// clamped at the end of the buffer are hashed short, matching the decoder's
/// zero-padding by simply not feeding the missing bytes.
pub fn hash_page(vram: &VramView, page: u32, mode: TextureMode) -> ContentHash {
    let x = page_start_x(page);
    let y = page_start_y(page);
    let width_hw = TEXTURE_PAGE_WIDTH >> mode.shift();
    let mut hasher = Xxh3::new();
    for row in 0..crate::geom::VRAM_PAGE_HEIGHT {
        let span = vram.row(x, y + row, width_hw);
        hasher.update(bytemuck::cast_slice(span));
    }
    hasher.digest()
}

/// Hashes the full CLUT for `reg`. A 256-entry palette clamped at the right
/// edge of VRAM hashes only the in-bounds entries.
pub fn hash_palette(vram: &VramView, reg: PaletteReg, mode: TextureMode) -> ContentHash {
    hash_clut(vram.palette(reg, mode))
}

pub fn hash_clut(entries: &[u16]) -> ContentHash {
    let mut hasher = Xxh3::new();
    hasher.update(bytemuck::cast_slice(entries));
    hasher.digest()
}

/// Hashes the first `max - min + 1` palette entries. Both the dumper and the
/// matcher use this same prefix-window form, so reduced-range names
/// round-trip.
pub fn hash_partial_clut(entries: &[u16], min: u8, max: u8) -> ContentHash {
    let len = (max as usize - min as usize) + 1;
    hash_clut(&entries[..len.min(entries.len())])
}

/// 128-bit identity of a whole CPU->VRAM upload, split (low, high) for the
/// `vram-write-{high}{low}` filename.
pub fn vram_upload_hash(pixels: &[u16]) -> (u64, u64) {
    let h = xxh3_128(bytemuck::cast_slice(pixels));
    (h as u64, (h >> 64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::{VRAM_HEIGHT, VRAM_WIDTH};

    fn vram_buffer() -> Vec<u16> {
        (0..VRAM_WIDTH * VRAM_HEIGHT).map(|i| i as u16).collect()
    }

    #[test]
    fn rect_hash_is_position_sensitive() {
        let buf = vram_buffer();
        let vram = VramView::new(&buf);
        let a = hash_rect(&vram, &Rect::from_extents(0, 0, 16, 16));
        let b = hash_rect(&vram, &Rect::from_extents(16, 0, 16, 16));
        assert_ne!(a, b);
        assert_eq!(a, hash_rect(&vram, &Rect::from_extents(0, 0, 16, 16)));
    }

    #[test]
    fn page_hash_width_depends_on_mode() {
        let buf = vram_buffer();
        let vram = VramView::new(&buf);
        assert_ne!(
            hash_page(&vram, 0, TextureMode::Palette4Bit),
            hash_page(&vram, 0, TextureMode::Palette8Bit)
        );
        // Direct modes share the same byte width.
        assert_eq!(
            hash_page(&vram, 0, TextureMode::Direct16Bit),
            hash_page(&vram, 0, TextureMode::ReservedDirect16Bit)
        );
    }

    #[test]
    fn clamped_page_hash_does_not_panic() {
        let buf = vram_buffer();
        let vram = VramView::new(&buf);
        // C16 page 31 spans past the right edge on the last row.
        let _ = hash_page(&vram, 31, TextureMode::Direct16Bit);
    }

    #[test]
    fn palette_hash_narrows_at_edge() {
        let mut buf = vram_buffer();
        // Same leading 64 entries at two spots; one clamped, one not.
        for i in 0..64u32 {
            buf[(100 * VRAM_WIDTH + i) as usize] = i as u16;
            buf[(100 * VRAM_WIDTH + 960 + i) as usize] = i as u16;
        }
        let vram = VramView::new(&buf);
        let clamped = hash_palette(
            &vram,
            PaletteReg::from_coords(960, 100),
            TextureMode::Palette8Bit,
        );
        let full = hash_palette(
            &vram,
            PaletteReg::from_coords(0, 100),
            TextureMode::Palette8Bit,
        );
        // Clamped palette hashes 64 entries, full hashes 256.
        assert_ne!(clamped, full);
        assert_eq!(clamped, hash_clut(&(0..64).collect::<Vec<u16>>()));
    }

    #[test]
    fn partial_clut_is_a_prefix_window() {
        let entries: Vec<u16> = (0..256).collect();
        assert_eq!(hash_partial_clut(&entries, 0, 255), hash_clut(&entries));
        assert_eq!(hash_partial_clut(&entries, 10, 19), hash_clut(&entries[..10]));
    }

    #[test]
    fn upload_hash_splits_128_bits() {
        let pixels: Vec<u16> = (0..128).collect();
        let (low, high) = vram_upload_hash(&pixels);
        let full = xxh3_128(bytemuck::cast_slice(&pixels));
        assert_eq!(low, full as u64);
        assert_eq!(high, (full >> 64) as u64);
    }
}
