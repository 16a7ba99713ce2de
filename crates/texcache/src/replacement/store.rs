//! Replacement discovery and matching.
//!
//! The filename is the index: scanning the per-game `replacements/`
//! directory parses every file title into one of the three name grammars and
//! buckets it. Images decode lazily into an `Arc` cache shared with the
//! compositor; `Aliases` in the local config map arbitrary filenames onto
//! canonical names.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::RgbaImage;
use tracing::{debug, error, info, warn};

use crate::config::Configuration;
use crate::geom::{page_start_x, page_start_y, Rect, TEXTURE_PAGE_HEIGHT, TEXTURE_PAGE_WIDTH, VRAM_WIDTH};
use crate::hash::{self, ContentHash};
use crate::replacement::name::{
    ReplacementIndex, ReplacementKind, TextureName, VramWriteName,
};
use crate::vram::{PaletteReg, TextureMode, VramView};

const VALID_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "webp"];

fn has_valid_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| VALID_EXTENSIONS.iter().any(|v| e.eq_ignore_ascii_case(v)))
}

/// A matched replacement, positioned in page texel space. The destination
/// rect is unscaled; the compositor multiplies by the chosen scale.
pub(crate) struct SubImage {
    pub image: Arc<RgbaImage>,
    pub dst_rect: Rect,
    pub scale_x: f32,
    pub scale_y: f32,
    pub invert_alpha: bool,
}

#[derive(Default)]
pub(crate) struct ReplacementStore {
    pub game_id: String,
    vram_replacements: HashMap<VramWriteName, PathBuf>,
    vram_write_replacements: HashMap<ReplacementIndex, Vec<(TextureName, PathBuf)>>,
    page_replacements: Vec<(TextureName, PathBuf)>,
    image_cache: HashMap<PathBuf, Arc<RgbaImage>>,
}

impl ReplacementStore {
    pub fn for_game(game_id: impl Into<String>) -> ReplacementStore {
        ReplacementStore { game_id: game_id.into(), ..Default::default() }
    }

    pub fn clear_indices(&mut self) {
        self.vram_replacements.clear();
        self.vram_write_replacements.clear();
        self.page_replacements.clear();
    }

    pub fn replacement_count(&self) -> usize {
        self.vram_replacements.len()
            + self
                .vram_write_replacements
                .values()
                .map(Vec::len)
                .sum::<usize>()
            + self.page_replacements.len()
    }

    pub fn has_vram_replacements(&self) -> bool {
        !self.vram_replacements.is_empty()
    }

    pub fn has_vram_write_replacements(&self) -> bool {
        !self.vram_write_replacements.is_empty()
    }

    pub fn has_page_replacements(&self) -> bool {
        !self.page_replacements.is_empty()
    }

    pub fn game_directory(&self, root: &Path) -> Option<PathBuf> {
        (!self.game_id.is_empty()).then(|| root.join(&self.game_id))
    }

    pub fn dump_directory(&self, root: &Path) -> Option<PathBuf> {
        self.game_directory(root).map(|d| d.join("dumps"))
    }

    pub fn replacement_directory(&self, root: &Path) -> Option<PathBuf> {
        self.game_directory(root).map(|d| d.join("replacements"))
    }

    /// Creates `<root>/<game>/{config.yaml,dumps/,replacements/}` if absent.
    /// Returns the game directory, or `None` on I/O failure (logged).
    pub fn ensure_game_directory(&self, root: &Path, config: &Configuration) -> Option<PathBuf> {
        let dir = self.game_directory(root)?;
        for sub in [dir.clone(), dir.join("dumps"), dir.join("replacements")] {
            if let Err(err) = std::fs::create_dir_all(&sub) {
                error!("failed to create {}: {err}", sub.display());
                return None;
            }
        }
        let config_path = dir.join("config.yaml");
        if !config_path.exists() {
            if let Err(err) = std::fs::write(&config_path, config.yaml_template()) {
                error!("failed to write {}: {err}", config_path.display());
            }
        }
        Some(dir)
    }

    fn add_file(&mut self, path: PathBuf, load_vram_writes: bool, load_textures: bool) {
        let Some(title) = path.file_stem().and_then(|s| s.to_str()) else {
            return;
        };
        if title.starts_with(VramWriteName::PREFIX) {
            if !load_vram_writes {
                return;
            }
            match VramWriteName::parse(title) {
                Some(name) => {
                    self.vram_replacements.insert(name, path);
                }
                None => warn!("invalid vram-write filename: {}", path.display()),
            }
        } else if title.starts_with("texupload-") || title.starts_with("texpage-") {
            if !load_textures {
                return;
            }
            match TextureName::parse(title) {
                Some(name) => self.add_texture_name(name, path),
                None => warn!("invalid texture replacement filename: {}", path.display()),
            }
        }
    }

    fn add_texture_name(&mut self, name: TextureName, path: PathBuf) {
        match name.kind {
            ReplacementKind::TextureFromVramWrite => {
                self.vram_write_replacements
                    .entry(name.index())
                    .or_default()
                    .push((name, path));
            }
            // Sub-page replacements can match any page hash, so the page
            // list stays flat and is walked in full at lookup time.
            ReplacementKind::TextureFromPage => self.page_replacements.push((name, path)),
        }
    }

    /// Rebuilds the indices from a recursive scan of `replacements/`.
    pub fn find_replacements(&mut self, root: &Path, load_vram_writes: bool, load_textures: bool) {
        self.clear_indices();
        let Some(dir) = self.replacement_directory(root) else {
            return;
        };
        let mut stack = vec![dir];
        while let Some(dir) = stack.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) => {
                    debug!("cannot scan {}: {err}", dir.display());
                    continue;
                }
            };
            for entry in entries {
                let Ok(entry) = entry else { continue };
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if has_valid_extension(&path) {
                    self.add_file(path, load_vram_writes, load_textures);
                }
            }
        }
        info!(
            "found {} replacement images for '{}'",
            self.replacement_count(),
            self.game_id
        );
    }

    /// Applies `Aliases` from the local config: key is a filename under
    /// `replacements/`, value is the canonical name it stands for.
    pub fn load_aliases(
        &mut self,
        aliases: &BTreeMap<String, String>,
        root: &Path,
        load_vram_writes: bool,
        load_textures: bool,
    ) {
        let Some(dir) = self.replacement_directory(root) else {
            return;
        };
        for (file, target) in aliases {
            let path = dir.join(file);
            if !path.is_file() {
                warn!("alias source '{file}' does not exist");
                continue;
            }
            // The target may carry an extension of its own; drop it.
            let title = target
                .rsplit_once('.')
                .filter(|(_, ext)| VALID_EXTENSIONS.iter().any(|v| ext.eq_ignore_ascii_case(v)))
                .map_or(target.as_str(), |(stem, _)| stem);
            if let Some(name) = VramWriteName::parse(title) {
                if load_vram_writes {
                    self.vram_replacements.insert(name, path);
                }
            } else if let Some(name) = TextureName::parse(title) {
                if load_textures {
                    self.add_texture_name(name, path);
                }
            } else {
                warn!("alias '{file}' has unparsable target '{target}'");
            }
        }
    }

    /// Loads (or returns the cached) image at `path`. Failures log and
    /// return `None`; they are not negatively cached.
    pub fn image(&mut self, path: &Path) -> Option<Arc<RgbaImage>> {
        if let Some(img) = self.image_cache.get(path) {
            return Some(img.clone());
        }
        match image::open(path) {
            Ok(img) => {
                let img = Arc::new(img.to_rgba8());
                self.image_cache.insert(path.to_path_buf(), img.clone());
                Some(img)
            }
            Err(err) => {
                error!("failed to load {}: {err}", path.display());
                None
            }
        }
    }

    pub fn preload(&mut self) {
        let paths: Vec<PathBuf> = self
            .vram_replacements
            .values()
            .cloned()
            .chain(
                self.vram_write_replacements
                    .values()
                    .flatten()
                    .map(|(_, p)| p.clone()),
            )
            .chain(self.page_replacements.iter().map(|(_, p)| p.clone()))
            .collect();
        for path in paths {
            self.image(&path);
        }
    }

    /// Drops cached images no index references any more.
    pub fn purge_unreferenced_images(&mut self) {
        let old = std::mem::take(&mut self.image_cache);
        let keep = |path: &Path, cache: &mut HashMap<PathBuf, Arc<RgbaImage>>| {
            if let Some(img) = old.get(path) {
                cache.entry(path.to_path_buf()).or_insert_with(|| img.clone());
            }
        };
        let mut cache = HashMap::new();
        for path in self.vram_replacements.values() {
            keep(path, &mut cache);
        }
        for (_, path) in self.vram_write_replacements.values().flatten() {
            keep(path, &mut cache);
        }
        for (_, path) in &self.page_replacements {
            keep(path, &mut cache);
        }
        self.image_cache = cache;
    }

    /// Whole-upload replacement, if one exists for this 128-bit identity.
    pub fn vram_replacement(&mut self, name: VramWriteName) -> Option<Arc<RgbaImage>> {
        let path = self.vram_replacements.get(&name)?.clone();
        self.image(&path)
    }

    /// True if a replacement of this kind exists for the name's content
    /// hashes. Geometry is ignored: a replacement for any part of the source
    /// counts as covering it.
    pub fn has_texture_replacement(&self, name: &TextureName) -> bool {
        match name.kind {
            ReplacementKind::TextureFromVramWrite => self
                .vram_write_replacements
                .get(&name.index())
                .is_some_and(|v| v.iter().any(|(n, _)| n.pal_hash == name.pal_hash)),
            ReplacementKind::TextureFromPage => self
                .page_replacements
                .iter()
                .any(|(n, _)| n.index() == name.index() && n.pal_hash == name.pal_hash),
        }
    }

    fn palette_matches(
        vram: &VramView,
        full_palette_hash: ContentHash,
        mode: TextureMode,
        palette: PaletteReg,
        name: &TextureName,
    ) -> bool {
        if !mode.has_palette() {
            return true;
        }
        let full_max = (mode.palette_size() - 1) as u8;
        if name.pal_min == 0 && name.pal_max == full_max {
            return name.pal_hash == full_palette_hash;
        }
        // A reduced range running off the edge of VRAM can never match.
        if palette.x() + name.pal_max as u32 >= VRAM_WIDTH {
            return false;
        }
        // Re-hashed per lookup; palettes can't be assumed stable.
        let partial = hash::hash_partial_clut(vram.palette(palette, mode), name.pal_min, name.pal_max);
        partial == name.pal_hash
    }

    /// Collects write-keyed candidates for one tracked upload overlapping
    /// the page being decoded. `offset_to_page` is (page - write) origin
    /// delta, X already converted to texels.
    #[allow(clippy::too_many_arguments)]
    pub fn vram_write_subimages(
        &mut self,
        out: &mut Vec<SubImage>,
        vram: &VramView,
        write_hash: ContentHash,
        palette_hash: ContentHash,
        mode: TextureMode,
        palette: PaletteReg,
        offset_to_page: (i32, i32),
    ) {
        let index = ReplacementIndex { src_hash: write_hash, mode };
        let Some(candidates) = self.vram_write_replacements.get(&index) else {
            return;
        };
        let candidates = candidates.clone();
        for (name, path) in &candidates {
            if !Self::palette_matches(vram, palette_hash, mode, palette, name) {
                continue;
            }
            let Some(image) = self.image(path) else { continue };
            let r = name.dest_rect();
            let dst_rect = Rect::new(
                r.left - offset_to_page.0,
                r.top - offset_to_page.1,
                r.right - offset_to_page.0,
                r.bottom - offset_to_page.1,
            );
            // Skip candidates entirely outside the page.
            if dst_rect.right <= 0
                || dst_rect.bottom <= 0
                || dst_rect.left >= TEXTURE_PAGE_WIDTH as i32
                || dst_rect.top >= TEXTURE_PAGE_HEIGHT as i32
            {
                continue;
            }
            out.push(SubImage {
                scale_x: image.width() as f32 / name.width as f32,
                scale_y: image.height() as f32 / name.height as f32,
                image,
                dst_rect,
                invert_alpha: name.semitransparent(),
            });
        }
    }

    /// Collects page-keyed candidates. Whole-page names check against the
    /// precomputed page hash; sub-page names re-hash their exact rect from
    /// live VRAM, so the whole list is walked.
    #[allow(clippy::too_many_arguments)]
    pub fn page_subimages(
        &mut self,
        out: &mut Vec<SubImage>,
        vram: &VramView,
        page: u32,
        page_hash: ContentHash,
        palette_hash: ContentHash,
        mode: TextureMode,
        palette: PaletteReg,
    ) {
        if self.page_replacements.is_empty() {
            return;
        }
        let shift = mode.shift();
        let px = page_start_x(page) as i32;
        let py = page_start_y(page) as i32;
        let candidates = self.page_replacements.clone();
        for (name, path) in &candidates {
            if name.mode() != mode {
                continue;
            }
            if !Self::palette_matches(vram, palette_hash, mode, palette, name) {
                continue;
            }
            let dst_rect = name.dest_rect();
            if name.width as u32 == TEXTURE_PAGE_WIDTH && name.height as u32 == TEXTURE_PAGE_HEIGHT
            {
                if name.src_hash != page_hash {
                    continue;
                }
            } else {
                // X coordinates back to halfwords for the VRAM re-hash.
                let hash_rect = Rect::new(
                    px + (dst_rect.left >> shift),
                    py + dst_rect.top,
                    px + (dst_rect.right >> shift),
                    py + dst_rect.bottom,
                );
                if hash::hash_rect(vram, &hash_rect) != name.src_hash {
                    continue;
                }
            }
            let Some(image) = self.image(path) else { continue };
            out.push(SubImage {
                scale_x: image.width() as f32 / name.width as f32,
                scale_y: image.height() as f32 / name.height as f32,
                image,
                dst_rect,
                invert_alpha: name.semitransparent(),
            });
        }
    }
}
