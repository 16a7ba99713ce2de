//! Replacement filename grammars.
//!
//! Three grammars, all carried in the file title (extension stripped):
//!
//! - `vram-write-{hash128:032X}` — a whole CPU upload.
//! - `texupload-{MODE}-{src:016X}[-{pal:016X}]-{SW}x{SH}-{OX}-{OY}-{W}x{H}[-P{MIN}-{MAX}]`
//! - `texpage-...` — same shape, keyed by page hash instead of write hash.
//!
//! `MODE` is `P4`/`P8`/`C16`, with an `ST` prefix when the texture was
//! sampled by semitransparent draws (those images store alpha inverted).
//! Offsets/sizes in the name are texels; `SW`x`SH` is the source write (or
//! unwrapped page) size in VRAM halfwords.

use std::fmt;

use crate::geom::Rect;
use crate::hash::ContentHash;
use crate::vram::TextureMode;

/// Semitransparent flag folded into the mode nibble.
pub const MODE_SEMITRANSPARENT: u8 = 4;

const MODE_NAMES: [&str; 8] = ["P4", "P8", "C16", "C16", "STP4", "STP8", "STC16", "STC16"];

fn parse_mode_name(token: &str) -> Option<u8> {
    // First match wins; the reserved direct alias never round-trips as 3/7.
    MODE_NAMES.iter().position(|&n| n == token).map(|i| i as u8)
}

fn parse_hash(token: &str) -> Option<ContentHash> {
    if token.len() != 16 {
        return None;
    }
    ContentHash::from_str_radix(token, 16).ok()
}

fn parse_size(token: &str) -> Option<(u16, u16)> {
    let (w, h) = token.split_once('x')?;
    let w: u16 = w.parse().ok()?;
    let h: u16 = h.parse().ok()?;
    (w > 0 && h > 0).then_some((w, h))
}

/// Identity of a whole-upload replacement: the XXH3-128 of the uploaded
/// halfwords, split low/high.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct VramWriteName {
    pub low: u64,
    pub high: u64,
}

impl VramWriteName {
    pub const PREFIX: &'static str = "vram-write-";

    pub fn new(low: u64, high: u64) -> VramWriteName {
        VramWriteName { low, high }
    }

    pub fn parse(title: &str) -> Option<VramWriteName> {
        let hex = title.strip_prefix(Self::PREFIX)?;
        if hex.len() != 32 {
            return None;
        }
        let high = u64::from_str_radix(&hex[..16], 16).ok()?;
        let low = u64::from_str_radix(&hex[16..], 16).ok()?;
        Some(VramWriteName { low, high })
    }
}

impl fmt::Display for VramWriteName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:016X}{:016X}", Self::PREFIX, self.high, self.low)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ReplacementKind {
    /// Keyed by the hash of a tracked VRAM write.
    TextureFromVramWrite,
    /// Keyed by the hash of a whole texture page.
    TextureFromPage,
}

impl ReplacementKind {
    const fn prefix(self) -> &'static str {
        match self {
            ReplacementKind::TextureFromVramWrite => "texupload",
            ReplacementKind::TextureFromPage => "texpage",
        }
    }

    fn from_prefix(token: &str) -> Option<ReplacementKind> {
        match token {
            "texupload" => Some(ReplacementKind::TextureFromVramWrite),
            "texpage" => Some(ReplacementKind::TextureFromPage),
            _ => None,
        }
    }
}

/// Index key: replacements are bucketed by source hash and mode, the rest of
/// the name is checked at match time.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ReplacementIndex {
    pub src_hash: ContentHash,
    pub mode: TextureMode,
}

/// Fully parsed texture replacement name.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TextureName {
    pub kind: ReplacementKind,
    /// Mode plus [`MODE_SEMITRANSPARENT`].
    pub texture_mode: u8,
    pub src_hash: ContentHash,
    /// Zero for direct-color modes.
    pub pal_hash: ContentHash,
    /// Source (write or unwrapped page) size, VRAM halfwords.
    pub src_width: u16,
    pub src_height: u16,
    /// Offset within the source, texels.
    pub offset_x: u16,
    pub offset_y: u16,
    /// Replaced region size, texels.
    pub width: u16,
    pub height: u16,
    /// Palette index window; `(0, palette_size - 1)` when not reduced.
    pub pal_min: u8,
    pub pal_max: u8,
}

impl TextureName {
    pub fn mode(&self) -> TextureMode {
        TextureMode::from_raw(self.texture_mode & 3)
    }

    pub fn semitransparent(&self) -> bool {
        self.texture_mode >= MODE_SEMITRANSPARENT
    }

    pub fn index(&self) -> ReplacementIndex {
        ReplacementIndex { src_hash: self.src_hash, mode: self.mode() }
    }

    /// Covered region relative to the source origin, texels.
    pub fn dest_rect(&self) -> Rect {
        Rect::from_extents(
            self.offset_x as u32,
            self.offset_y as u32,
            self.width as u32,
            self.height as u32,
        )
    }

    fn has_full_palette_range(&self) -> bool {
        let mode = self.mode();
        !mode.has_palette()
            || (self.pal_min == 0 && self.pal_max as usize == mode.palette_size() - 1)
    }

    pub fn parse(title: &str) -> Option<TextureName> {
        let tokens: Vec<&str> = title.split('-').collect();
        if tokens.len() < 7 {
            return None;
        }
        let kind = ReplacementKind::from_prefix(tokens[0])?;
        let texture_mode = parse_mode_name(tokens[1])?;
        let mode = TextureMode::from_raw(texture_mode & 3);

        let src_hash = parse_hash(tokens[2])?;
        let (pal_hash, rest) = if mode.has_palette() {
            (parse_hash(tokens.get(3)?)?, &tokens[4..])
        } else {
            (0, &tokens[3..])
        };

        // SWxSH, OX, OY, WxH, then optionally Pmin, max.
        if rest.len() != 4 && rest.len() != 6 {
            return None;
        }
        let (src_width, src_height) = parse_size(rest[0])?;
        let offset_x: u16 = rest[1].parse().ok()?;
        let offset_y: u16 = rest[2].parse().ok()?;
        let (width, height) = parse_size(rest[3])?;

        let (pal_min, pal_max) = if rest.len() == 6 {
            if !mode.has_palette() {
                return None;
            }
            let min: u8 = rest[4].strip_prefix('P')?.parse().ok()?;
            let max: u8 = rest[5].parse().ok()?;
            if min > max || max as usize >= mode.palette_size() {
                return None;
            }
            (min, max)
        } else if mode.has_palette() {
            (0, (mode.palette_size() - 1) as u8)
        } else {
            (0, 0)
        };

        Some(TextureName {
            kind,
            texture_mode,
            src_hash,
            pal_hash,
            src_width,
            src_height,
            offset_x,
            offset_y,
            width,
            height,
            pal_min,
            pal_max,
        })
    }
}

impl fmt::Display for TextureName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{:016X}",
            self.kind.prefix(),
            MODE_NAMES[(self.texture_mode & 7) as usize],
            self.src_hash
        )?;
        if self.mode().has_palette() {
            write!(f, "-{:016X}", self.pal_hash)?;
        }
        write!(
            f,
            "-{}x{}-{}-{}-{}x{}",
            self.src_width, self.src_height, self.offset_x, self.offset_y, self.width, self.height
        )?;
        if !self.has_full_palette_range() {
            write!(f, "-P{}-{}", self.pal_min, self.pal_max)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn vram_write_name_round_trip() {
        let name = VramWriteName::new(0x0123_4567_89ab_cdef, 0xfedc_ba98_7654_3210);
        let title = name.to_string();
        assert_eq!(title, "vram-write-FEDCBA98765432100123456789ABCDEF");
        assert_eq!(VramWriteName::parse(&title), Some(name));
    }

    #[test]
    fn vram_write_name_rejects_malformed() {
        assert_eq!(VramWriteName::parse("vram-write-123"), None);
        assert_eq!(
            VramWriteName::parse("vramwrite-FEDCBA98765432100123456789ABCDEF"),
            None
        );
        assert_eq!(
            VramWriteName::parse("vram-write-ZEDCBA98765432100123456789ABCDEF"),
            None
        );
    }

    #[test]
    fn paletted_name_round_trip() {
        let name = TextureName {
            kind: ReplacementKind::TextureFromVramWrite,
            texture_mode: 0,
            src_hash: 0x1111_2222_3333_4444,
            pal_hash: 0x5555_6666_7777_8888,
            src_width: 128,
            src_height: 64,
            offset_x: 32,
            offset_y: 0,
            width: 256,
            height: 64,
            pal_min: 0,
            pal_max: 15,
        };
        let title = name.to_string();
        assert_eq!(
            title,
            "texupload-P4-1111222233334444-5555666677778888-128x64-32-0-256x64"
        );
        assert_eq!(TextureName::parse(&title), Some(name));
    }

    #[test]
    fn reduced_palette_range_round_trip() {
        let name = TextureName {
            kind: ReplacementKind::TextureFromPage,
            texture_mode: 1 | MODE_SEMITRANSPARENT,
            src_hash: 1,
            pal_hash: 2,
            src_width: 128,
            src_height: 256,
            offset_x: 0,
            offset_y: 0,
            width: 256,
            height: 256,
            pal_min: 16,
            pal_max: 47,
        };
        let title = name.to_string();
        assert!(title.starts_with("texpage-STP8-"));
        assert!(title.ends_with("-P16-47"));
        let parsed = TextureName::parse(&title).unwrap();
        assert_eq!(parsed, name);
        assert!(parsed.semitransparent());
        assert_eq!(parsed.mode(), TextureMode::Palette8Bit);
    }

    #[test]
    fn direct_mode_has_no_palette_hash() {
        let name = TextureName {
            kind: ReplacementKind::TextureFromVramWrite,
            texture_mode: 2,
            src_hash: 0xaaaa_bbbb_cccc_dddd,
            pal_hash: 0,
            src_width: 64,
            src_height: 64,
            offset_x: 0,
            offset_y: 0,
            width: 64,
            height: 64,
            pal_min: 0,
            pal_max: 0,
        };
        let title = name.to_string();
        assert_eq!(title, "texupload-C16-AAAABBBBCCCCDDDD-64x64-0-0-64x64");
        assert_eq!(TextureName::parse(&title), Some(name));
    }

    #[test]
    fn parse_rejects_malformed_names() {
        // Wrong prefix.
        assert_eq!(TextureName::parse("texdump-P4-0000000000000000-0000000000000000-1x1-0-0-1x1"), None);
        // Unknown mode.
        assert_eq!(TextureName::parse("texupload-P2-0000000000000000-0000000000000000-1x1-0-0-1x1"), None);
        // Short hash.
        assert_eq!(TextureName::parse("texupload-P4-1234-0000000000000000-1x1-0-0-1x1"), None);
        // Zero size.
        assert_eq!(TextureName::parse("texupload-P4-0000000000000000-0000000000000000-0x1-0-0-1x1"), None);
        // Palette range on a direct mode.
        assert_eq!(TextureName::parse("texupload-C16-0000000000000000-1x1-0-0-1x1-P0-5"), None);
        // Inverted palette range.
        assert_eq!(TextureName::parse("texupload-P4-0000000000000000-0000000000000000-1x1-0-0-1x1-P9-3"), None);
        // Range past the palette size.
        assert_eq!(TextureName::parse("texupload-P4-0000000000000000-0000000000000000-1x1-0-0-1x1-P0-16"), None);
    }

    #[test]
    fn dest_rect_is_texel_space() {
        let name = TextureName::parse("texupload-P8-0000000000000001-0000000000000002-64x32-10-20-30x40").unwrap();
        assert_eq!(name.dest_rect(), Rect::new(10, 20, 40, 60));
        assert_eq!((name.pal_min, name.pal_max), (0, 255));
    }
}
