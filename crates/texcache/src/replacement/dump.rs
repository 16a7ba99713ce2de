//! Texture and upload dumping.
//!
//! Dumps are deduplicated per session by content key, skipped below the
//! configured size thresholds, and skipped when a replacement already covers
//! the same hash (unless dumping replaced textures is on). I/O failures log
//! and abandon the single dump.

use std::collections::HashSet;
use std::path::Path;

use image::RgbaImage;
use tracing::{debug, error, info};

use crate::cache::SampleFlags;
use crate::config::{CacheSettings, Configuration};
use crate::decode;
use crate::geom::{Rect, VRAM_WIDTH};
use crate::hash::{self, ContentHash};
use crate::replacement::name::{ReplacementKind, TextureName, VramWriteName};
use crate::replacement::store::ReplacementStore;
use crate::vram::{rgba5551_to_rgba8888, PaletteReg, TextureMode, VramView};

/// Session-dedup key: one dump per exact (content, geometry, mode) tuple.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct DumpedTextureKey {
    src_hash: ContentHash,
    pal_hash: ContentHash,
    offset_x: u16,
    offset_y: u16,
    width: u16,
    height: u16,
    kind: ReplacementKind,
    texture_mode: u8,
}

#[derive(Default)]
pub(crate) struct Dumper {
    dumped_vram_writes: HashSet<VramWriteName>,
    dumped_textures: HashSet<DumpedTextureKey>,
}

/// Observed min/max palette index over a VRAM rect (halfword coordinates),
/// clamped so the range never runs past the right edge of VRAM.
pub(crate) fn reduce_palette_bounds(
    vram: &VramView,
    rect: &Rect,
    mode: TextureMode,
    palette: PaletteReg,
) -> (u8, u8) {
    debug_assert!(mode.has_palette());
    let mut pal_min = mode.palette_size() as u32 - 1;
    let mut pal_max = 0u32;

    let width = rect.width() as u32;
    for y in rect.top..rect.bottom {
        for &hw in vram.row(rect.left as u32, y as u32, width) {
            match mode {
                TextureMode::Palette4Bit => {
                    for shift in [0, 4, 8, 12] {
                        let p = ((hw >> shift) & 0xf) as u32;
                        pal_min = pal_min.min(p);
                        pal_max = pal_max.max(p);
                    }
                }
                _ => {
                    let p0 = (hw & 0xff) as u32;
                    let p1 = (hw >> 8) as u32;
                    pal_min = pal_min.min(p0.min(p1));
                    pal_max = pal_max.max(p0.max(p1));
                }
            }
        }
    }

    let x_base = palette.x();
    if x_base + pal_max >= VRAM_WIDTH {
        tracing::warn!(
            "texture with CLUT at {},{} extends outside VRAM, clamping",
            x_base,
            palette.y()
        );
        pal_min = pal_min.min(VRAM_WIDTH - x_base - 1);
        pal_max = pal_max.min(VRAM_WIDTH - x_base - 1);
    }
    (pal_min as u8, pal_max as u8)
}

pub(crate) fn should_dump_vram_write(
    settings: &CacheSettings,
    config: &Configuration,
    width: u32,
    height: u32,
) -> bool {
    settings.dump_vram_writes
        && width >= config.vram_write_dump_width_threshold
        && height >= config.vram_write_dump_height_threshold
}

fn save_image(image: &RgbaImage, path: &Path) {
    if let Err(err) = image.save(path) {
        error!("failed to write texture dump {}: {err}", path.display());
    }
}

impl Dumper {
    pub fn clear(&mut self) {
        self.dumped_vram_writes.clear();
        self.dumped_textures.clear();
    }

    /// Dumps a raw upload as `vram-write-<hash128>.png`.
    pub fn dump_vram_write(
        &mut self,
        store: &ReplacementStore,
        settings: &CacheSettings,
        config: &Configuration,
        width: u32,
        height: u32,
        pixels: &[u16],
    ) {
        let (low, high) = hash::vram_upload_hash(pixels);
        let name = VramWriteName::new(low, high);
        if !self.dumped_vram_writes.insert(name) {
            return;
        }

        let Some(dir) = store.ensure_game_directory(&settings.textures_root, config) else {
            return;
        };
        let path = dir.join("dumps").join(format!("{name}.png"));
        if path.exists() {
            return;
        }

        let mut image = RgbaImage::new(width, height);
        for (i, px) in image.pixels_mut().enumerate() {
            let mut val = rgba5551_to_rgba8888(pixels[i]);
            if config.dump_vram_write_force_alpha_channel {
                val |= 0xff00_0000;
            }
            *px = image::Rgba(val.to_le_bytes());
        }

        info!("dumping {width}x{height} VRAM write to '{name}.png'");
        save_image(&image, &path);
    }

    /// Dumps one texture region. `rect` is in VRAM halfword coordinates;
    /// `offset_x`/`width` in the resulting name are texels. `clut` is the
    /// palette snapshot (or live palette) to decode with.
    #[allow(clippy::too_many_arguments)]
    pub fn dump_texture(
        &mut self,
        store: &ReplacementStore,
        settings: &CacheSettings,
        config: &Configuration,
        vram: &VramView,
        kind: ReplacementKind,
        offset_x: u32,
        offset_y: u32,
        src_width: u32,
        src_height: u32,
        mode: TextureMode,
        src_hash: ContentHash,
        pal_hash: ContentHash,
        pal_min: u8,
        pal_max: u8,
        clut: &[u16],
        rect: &Rect,
        flags: SampleFlags,
    ) {
        let width = mode.apply_shift(rect.width()) as u32;
        let height = rect.height() as u32;
        if width < config.texture_dump_width_threshold || height < config.texture_dump_height_threshold
        {
            return;
        }

        let semitransparent = flags.contains(SampleFlags::HAS_SEMI_TRANSPARENT_DRAWS)
            && !config.dump_texture_force_alpha_channel;
        let texture_mode =
            (mode as u8) | if semitransparent { super::name::MODE_SEMITRANSPARENT } else { 0 };

        let key = DumpedTextureKey {
            src_hash,
            pal_hash,
            offset_x: offset_x as u16,
            offset_y: offset_y as u16,
            width: width as u16,
            height: height as u16,
            kind,
            texture_mode,
        };
        if self.dumped_textures.contains(&key) {
            return;
        }
        let Some(dir) = store.ensure_game_directory(&settings.textures_root, config) else {
            return;
        };
        self.dumped_textures.insert(key);

        let name = TextureName {
            kind,
            texture_mode,
            src_hash,
            pal_hash,
            src_width: src_width as u16,
            src_height: src_height as u16,
            offset_x: offset_x as u16,
            offset_y: offset_y as u16,
            width: width as u16,
            height: height as u16,
            pal_min,
            pal_max,
        };

        // Hash-level match is enough: we could be dumping a smaller part of
        // an already replaced texture.
        if !settings.dump_replaced_textures && store.has_texture_replacement(&name) {
            debug!("not dumping currently-replaced texture {src_hash:016X} [{width}x{height}]");
            return;
        }

        let path = dir.join("dumps").join(format!("{name}.png"));
        if path.exists() {
            return;
        }

        debug!("dumping texture {src_hash:016X} [{width}x{height}] at {rect}");

        let mut pixels = vec![0u32; (width * height) as usize];
        decode::decode_rect(
            vram,
            mode,
            rect.left as u32,
            rect.top as u32,
            clut,
            width,
            height,
            &mut pixels,
            width as usize,
        );

        if config.dump_texture_force_alpha_channel {
            for px in &mut pixels {
                *px |= 0xff00_0000;
            }
        } else if semitransparent {
            // Alpha is inverted on disk: 0 means opaque, the mask bit means
            // semitransparent. All-zero pixels stay fully transparent.
            for px in &mut pixels {
                let val = *px;
                *px = if val == 0 {
                    0
                } else {
                    (val & 0x0fff_ffff) | if (val & 0x8000_0000) != 0 { 0x8000_0000 } else { 0xff00_0000 }
                };
            }
        } else {
            // Only cut out all-zero pixels.
            for px in &mut pixels {
                let val = *px;
                *px = if val == 0 { 0 } else { val | 0xff00_0000 };
            }
        }

        let mut image = RgbaImage::new(width, height);
        for (out, &val) in image.pixels_mut().zip(&pixels) {
            *out = image::Rgba(val.to_le_bytes());
        }
        save_image(&image, &path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::VRAM_HEIGHT;

    fn vram_with(f: impl Fn(u32, u32) -> u16) -> Vec<u16> {
        let mut buf = vec![0u16; (VRAM_WIDTH * VRAM_HEIGHT) as usize];
        for y in 0..VRAM_HEIGHT {
            for x in 0..VRAM_WIDTH {
                buf[(y * VRAM_WIDTH + x) as usize] = f(x, y);
            }
        }
        buf
    }

    #[test]
    fn reduce_bounds_tracks_min_max_indices() {
        // P8 data: indices 3 and 9 only.
        let buf = vram_with(|x, _| if x < 64 { 0x0903 } else { 0 });
        let vram = VramView::new(&buf);
        let (min, max) = reduce_palette_bounds(
            &vram,
            &Rect::new(0, 0, 64, 4),
            TextureMode::Palette8Bit,
            PaletteReg::from_coords(0, 400),
        );
        assert_eq!((min, max), (3, 9));
    }

    #[test]
    fn reduce_bounds_p4_examines_nibbles() {
        let buf = vram_with(|_, _| 0x5121);
        let vram = VramView::new(&buf);
        let (min, max) = reduce_palette_bounds(
            &vram,
            &Rect::new(0, 0, 4, 1),
            TextureMode::Palette4Bit,
            PaletteReg::from_coords(0, 400),
        );
        assert_eq!((min, max), (1, 5));
    }

    #[test]
    fn reduce_bounds_clamps_at_vram_edge() {
        let buf = vram_with(|_, _| 0xffff);
        let vram = VramView::new(&buf);
        // CLUT at x=1008: only indices 0..16 fit before the edge.
        let (min, max) = reduce_palette_bounds(
            &vram,
            &Rect::new(0, 0, 4, 1),
            TextureMode::Palette8Bit,
            PaletteReg::from_coords(1008, 400),
        );
        assert_eq!((min, max), (15, 15));
    }

    #[test]
    fn thresholds_gate_vram_write_dumps() {
        let settings = CacheSettings { dump_vram_writes: true, ..Default::default() };
        let config = Configuration::default();
        assert!(should_dump_vram_write(&settings, &config, 128, 128));
        assert!(!should_dump_vram_write(&settings, &config, 127, 128));
        let settings = CacheSettings::default();
        assert!(!should_dump_vram_write(&settings, &config, 512, 512));
    }

    #[test]
    fn vram_write_dump_is_deduplicated() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = CacheSettings {
            dump_vram_writes: true,
            textures_root: tmp.path().to_path_buf(),
            ..Default::default()
        };
        let store = ReplacementStore::for_game("GAME");
        let mut dumper = Dumper::default();
        let pixels: Vec<u16> = (0..256 * 128).map(|i| i as u16).collect();

        dumper.dump_vram_write(&store, &settings, &settings.config, 256, 128, &pixels);
        let dumps = tmp.path().join("GAME").join("dumps");
        let count = || std::fs::read_dir(&dumps).unwrap().count();
        assert_eq!(count(), 1);

        dumper.dump_vram_write(&store, &settings, &settings.config, 256, 128, &pixels);
        assert_eq!(count(), 1);

        let (low, high) = hash::vram_upload_hash(&pixels);
        let expect = dumps.join(format!("{}.png", VramWriteName::new(low, high)));
        assert!(expect.is_file());
        // Round-trips through the parser.
        assert!(VramWriteName::parse(
            expect.file_stem().unwrap().to_str().unwrap()
        )
        .is_some());
    }

    #[test]
    fn texture_dump_writes_parseable_name() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = CacheSettings {
            dump_textures: true,
            textures_root: tmp.path().to_path_buf(),
            ..Default::default()
        };
        let mut config = Configuration::default();
        config.texture_dump_width_threshold = 1;
        config.texture_dump_height_threshold = 1;
        let store = ReplacementStore::for_game("GAME");
        let mut dumper = Dumper::default();

        let buf = vram_with(|x, y| (x + y) as u16);
        let vram = VramView::new(&buf);
        let clut: Vec<u16> = (0..16).collect();

        dumper.dump_texture(
            &store,
            &settings,
            &config,
            &vram,
            ReplacementKind::TextureFromVramWrite,
            0,
            0,
            64,
            32,
            TextureMode::Palette4Bit,
            0xaabb,
            0xccdd,
            0,
            15,
            &clut,
            &Rect::new(0, 0, 64, 32),
            SampleFlags::empty(),
        );

        let dumps = tmp.path().join("GAME").join("dumps");
        let entry = std::fs::read_dir(&dumps).unwrap().next().unwrap().unwrap();
        let title = entry.path();
        let title = title.file_stem().unwrap().to_str().unwrap().to_string();
        let name = TextureName::parse(&title).unwrap();
        assert_eq!(name.src_hash, 0xaabb);
        assert_eq!(name.width, 256); // 64 halfwords of P4 = 256 texels
        assert_eq!(name.height, 32);

        // Below threshold: nothing new dumped.
        config.texture_dump_width_threshold = 4096;
        dumper.dump_texture(
            &store,
            &settings,
            &config,
            &vram,
            ReplacementKind::TextureFromPage,
            0,
            0,
            64,
            32,
            TextureMode::Palette4Bit,
            0x1,
            0x2,
            0,
            15,
            &clut,
            &Rect::new(0, 0, 64, 32),
            SampleFlags::empty(),
        );
        assert_eq!(std::fs::read_dir(&dumps).unwrap().count(), 1);
    }
}
