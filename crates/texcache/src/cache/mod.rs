//! The engine object: page table, source registry, hash cache and the
//! replacement/dump plumbing around them.
//!
//! One [`TextureCache`] per emulated GPU. The caller owns VRAM and the GPU
//! device; both are passed in per call so the engine never hides a global.

mod draw_rects;
mod writes;

use std::collections::HashMap;
use std::sync::Arc;

use bitflags::bitflags;
use tracing::{error, trace, warn};

use crate::config::{self, CacheSettings, Configuration};
use crate::decode;
use crate::device::{GpuDevice, GpuError, ReplacementBlit};
use crate::geom::{
    for_each_page_in_rect, for_each_wrapped_page, page_rect, Rect, NUM_VRAM_PAGES,
    TEXTURE_PAGE_HEIGHT, TEXTURE_PAGE_WIDTH, VRAM_HEIGHT, VRAM_WIDTH,
};
use crate::hash::{self, ContentHash};
use crate::replacement::dump::Dumper;
use crate::replacement::store::{ReplacementStore, SubImage};
use crate::slab::{Arena, Handle};
use crate::vram::{self, PaletteReg, TextureMode, VramView};

pub(crate) use writes::{PaletteRecord, VramWrite};

/// Pages one tracked upload may span (a full-VRAM write touches all 32).
pub const MAX_PAGE_REFS_PER_WRITE: usize = NUM_VRAM_PAGES as usize;
/// Pages one source may reference: up to 4 texture pages plus a palette row
/// spanning up to 5 pages, and one spare.
pub const MAX_PAGE_REFS_PER_SOURCE: usize = 10;
/// Distinct draw areas tracked per page before falling back to union.
pub const NUM_PAGE_DRAW_RECTS: usize = 4;

/// Hash cache entries unused for this many frames are evicted regardless of
/// budget pressure.
const MAX_HASH_CACHE_AGE: u32 = 600;

bitflags! {
    /// Properties of the draws that sampled a source, carried into palette
    /// records and dump filenames.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SampleFlags: u32 {
        const HAS_SEMI_TRANSPARENT_DRAWS = 1 << 0;
    }
}

/// What the renderer samples: a page origin, pixel interpretation, and (for
/// paletted modes) the CLUT location. Structural identity only; content
/// identity lives in [`HashCacheKey`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SourceKey {
    pub page: u8,
    pub mode: TextureMode,
    pub palette: PaletteReg,
}

impl SourceKey {
    pub fn new(page: u8, palette: PaletteReg, mode: TextureMode) -> SourceKey {
        SourceKey { page, mode, palette }
    }
}

/// Content identity of a decoded page: texture bytes, palette bytes, mode.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct HashCacheKey {
    pub texture_hash: ContentHash,
    pub palette_hash: ContentHash,
    pub mode: TextureMode,
}

pub struct Source {
    pub(crate) key: SourceKey,
    pub(crate) palette_hash: ContentHash,
    pub(crate) cache_key: HashCacheKey,
    /// Unwrapped footprint in VRAM halfwords, clamped at the right edge.
    pub(crate) texture_rect: Rect,
    pub(crate) palette_rect: Rect,
    /// Union of UV rects actually sampled; `Rect::INVALID` until first use.
    pub(crate) active_uv_rect: Rect,
    pub(crate) flags: SampleFlags,
    pub(crate) pages: [u8; MAX_PAGE_REFS_PER_SOURCE],
    pub(crate) num_pages: u8,
}

pub type SourceHandle = Handle<Source>;
pub(crate) type WriteHandle = Handle<VramWrite>;

struct HashCacheEntry<T> {
    texture: T,
    width: u32,
    height: u32,
    ref_count: u32,
    last_used_frame: u32,
    sources: Vec<SourceHandle>,
}

impl<T> HashCacheEntry<T> {
    fn vram_usage(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

#[derive(Default)]
pub(crate) struct PageEntry {
    pub sources: Vec<SourceHandle>,
    pub writes: Vec<WriteHandle>,
    pub num_draw_rects: usize,
    pub total_draw_rect: Rect,
    pub draw_rects: [Rect; NUM_PAGE_DRAW_RECTS],
}

pub struct TextureCache<D: GpuDevice> {
    settings: CacheSettings,
    /// Active configuration: global values overlaid with the game's
    /// `config.yaml`.
    config: Configuration,
    pages: Vec<PageEntry>,
    sources: Arena<Source>,
    pub(crate) writes: Arena<VramWrite>,
    pub(crate) last_write: Option<WriteHandle>,
    hash_cache: HashMap<HashCacheKey, HashCacheEntry<D::Texture>>,
    hash_cache_memory: usize,
    frame_number: u32,
    pub(crate) track_writes: bool,
    pub(crate) store: ReplacementStore,
    pub(crate) dumper: Dumper,
}

impl<D: GpuDevice> TextureCache<D> {
    /// Builds the engine and, when replacements are enabled, the device's
    /// compositing pipelines. Pipeline failure here is unrecoverable.
    pub fn new(settings: CacheSettings, device: &mut D) -> Result<TextureCache<D>, GpuError> {
        let config = settings.config.clone();
        let mut cache = TextureCache {
            settings,
            config,
            pages: (0..NUM_VRAM_PAGES).map(|_| PageEntry::default()).collect(),
            sources: Arena::new(),
            writes: Arena::new(),
            last_write: None,
            hash_cache: HashMap::new(),
            hash_cache_memory: 0,
            frame_number: 0,
            track_writes: false,
            store: ReplacementStore::default(),
            dumper: Dumper::default(),
        };
        cache.load_local_configuration(false, false);
        cache.update_tracking_state();
        if cache.settings.enable_texture_replacements {
            device.recreate_replacement_pipelines(cache.config.replacement_scale_linear_filter)?;
        }
        Ok(cache)
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// The active per-game configuration.
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn frame_number(&self) -> u32 {
        self.frame_number
    }

    pub fn is_tracking_writes(&self) -> bool {
        self.track_writes
    }

    pub fn hash_cache_len(&self) -> usize {
        self.hash_cache.len()
    }

    pub fn hash_cache_memory(&self) -> usize {
        self.hash_cache_memory
    }

    pub fn live_write_count(&self) -> usize {
        self.writes.len()
    }

    pub fn live_source_count(&self) -> usize {
        self.sources.len()
    }

    pub(crate) fn is_dumping_vram_write_textures(&self) -> bool {
        self.settings.dump_textures && !self.config.dump_texture_pages
    }

    pub(crate) fn update_tracking_state(&mut self) {
        self.track_writes = self.is_dumping_vram_write_textures()
            || self.settings.always_track_uploads
            || (self.settings.enable_texture_replacements
                && self.store.has_vram_write_replacements());
    }

    /// Applies new frontend settings. Toggling replacements rebuilds the
    /// device pipelines; an error doing so is unrecoverable for the caller.
    pub fn update_settings(
        &mut self,
        device: &mut D,
        vram: &VramView,
        settings: CacheSettings,
    ) -> Result<(), GpuError> {
        let old = std::mem::replace(&mut self.settings, settings);
        self.update_tracking_state();

        if old.enable_texture_replacements != self.settings.enable_texture_replacements {
            self.invalidate(device, vram);
            device.recreate_replacement_pipelines(self.config.replacement_scale_linear_filter)?;
        }

        let old_linear = self.config.replacement_scale_linear_filter;
        if self.load_local_configuration(false, false) {
            if self.config.replacement_scale_linear_filter != old_linear {
                device.recreate_replacement_pipelines(self.config.replacement_scale_linear_filter)?;
            }
            self.reload_texture_replacements(device, vram);
        }
        Ok(())
    }

    /// Switches the per-game directory. A reload only happens when the id
    /// actually changes; the empty string means "no game".
    pub fn set_game_id(&mut self, device: &mut D, vram: &VramView, game_id: impl Into<String>) {
        let game_id = game_id.into();
        if self.store.game_id == game_id {
            return;
        }
        self.store.game_id = game_id;
        self.reload_texture_replacements(device, vram);
    }

    pub fn game_id(&self) -> &str {
        &self.store.game_id
    }

    /// Rebuilds the replacement indices from disk, re-applies the local
    /// config, and destroys all sources so new lookups see the new set.
    /// Write tracking and draw rects survive.
    pub fn reload_texture_replacements(&mut self, device: &mut D, vram: &VramView) {
        self.store.clear_indices();
        let load_vram_writes = self.settings.enable_vram_write_replacements;
        let load_textures = self.settings.enable_texture_replacements;
        if (load_vram_writes || load_textures) && !self.store.game_id.is_empty() {
            self.store
                .find_replacements(&self.settings.textures_root, load_vram_writes, load_textures);
        }
        self.load_local_configuration(load_vram_writes, load_textures);
        if self.settings.preload_textures {
            self.store.preload();
        }
        self.store.purge_unreferenced_images();
        self.update_tracking_state();
        self.invalidate_sources(device, vram);
    }

    /// Overlays the game's `config.yaml` (if any) on the global config.
    /// Returns true when the active configuration changed.
    fn load_local_configuration(
        &mut self,
        load_vram_write_aliases: bool,
        load_texture_aliases: bool,
    ) -> bool {
        let mut new_config = self.settings.config.clone();
        if let Some(dir) = self.store.game_directory(&self.settings.textures_root) {
            if let Some(local) = config::load_local_configuration(&dir.join("config.yaml")) {
                new_config.apply(&local);
                if let Some(aliases) = &local.aliases {
                    if load_vram_write_aliases || load_texture_aliases {
                        self.store.load_aliases(
                            aliases,
                            &self.settings.textures_root,
                            load_vram_write_aliases,
                            load_texture_aliases,
                        );
                    }
                }
            }
        }
        let changed = new_config != self.config;
        self.config = new_config;
        changed
    }

    /// Resolves a (page, palette, mode) key to a sampleable source,
    /// decoding and (when enabled) replacing on first use. `uv_rect` is the
    /// VRAM-space region the draw will sample, accumulated for dumping.
    pub fn lookup_source(
        &mut self,
        device: &mut D,
        vram: &VramView,
        key: SourceKey,
        uv_rect: &Rect,
        flags: SampleFlags,
    ) -> Result<SourceHandle, GpuError> {
        let pn = key.page as usize;
        let pos = self.pages[pn]
            .sources
            .iter()
            .position(|&h| self.sources.get(h).is_some_and(|s| s.key == key));

        let handle = match pos {
            Some(pos) => {
                trace!("source hit for page {} mode {:?}", key.page, key.mode);
                // Promote to front; lookups have temporal locality.
                let list = &mut self.pages[pn].sources;
                let h = list.remove(pos);
                list.insert(0, h);
                h
            }
            None => self.create_source(device, vram, key)?,
        };
        self.touch_source(handle, uv_rect, flags);
        Ok(handle)
    }

    /// The GPU texture backing a live source.
    pub fn source_texture(&self, handle: SourceHandle) -> Option<&D::Texture> {
        let src = self.sources.get(handle)?;
        self.hash_cache.get(&src.cache_key).map(|e| &e.texture)
    }

    pub fn source_key(&self, handle: SourceHandle) -> Option<SourceKey> {
        self.sources.get(handle).map(|s| s.key)
    }

    pub fn source_is_live(&self, handle: SourceHandle) -> bool {
        self.sources.contains(handle)
    }

    fn touch_source(&mut self, handle: SourceHandle, uv_rect: &Rect, flags: SampleFlags) {
        let frame = self.frame_number;
        let Some(src) = self.sources.get_mut(handle) else {
            return;
        };
        if !uv_rect.is_invalid() {
            // Accumulate only when dumping; otherwise the union just burns
            // cycles on every draw. Degenerate UVs from the renderer are
            // clamped to VRAM so page iteration stays in bounds.
            if self.settings.dump_textures {
                let clamped = uv_rect.intersect(&Rect::from_extents(0, 0, VRAM_WIDTH, VRAM_HEIGHT));
                if !clamped.is_empty() {
                    src.active_uv_rect = src.active_uv_rect.union(&clamped);
                    src.flags |= flags;
                }
            }
        }
        let cache_key = src.cache_key;
        if let Some(entry) = self.hash_cache.get_mut(&cache_key) {
            entry.last_used_frame = frame;
        }
    }

    fn create_source(
        &mut self,
        device: &mut D,
        vram: &VramView,
        key: SourceKey,
    ) -> Result<SourceHandle, GpuError> {
        trace!("create source for page {} mode {:?}", key.page, key.mode);

        let texture_hash = hash::hash_page(vram, key.page as u32, key.mode);
        let palette_hash = if key.mode.has_palette() {
            hash::hash_palette(vram, key.palette, key.mode)
        } else {
            0
        };
        let cache_key = HashCacheKey { texture_hash, palette_hash, mode: key.mode };
        self.ensure_hash_cache_entry(device, vram, key, cache_key)?;

        // Texture pages first (front-linked), palette pages after
        // (back-linked), no duplicates.
        fn add_page(pages: &mut [u8; MAX_PAGE_REFS_PER_SOURCE], num_pages: &mut usize, pn: u32) {
            let pn = pn as u8;
            if pages[..*num_pages].contains(&pn) {
                return;
            }
            assert!(*num_pages < MAX_PAGE_REFS_PER_SOURCE, "source page fan-out exceeded");
            pages[*num_pages] = pn;
            *num_pages += 1;
        }
        let mut pages = [0u8; MAX_PAGE_REFS_PER_SOURCE];
        let mut num_pages = 0usize;
        for_each_wrapped_page(key.page as u32, key.mode.texture_page_count(), |pn| {
            add_page(&mut pages, &mut num_pages, pn)
        });
        let texture_page_count = num_pages;

        let palette_rect = if key.mode.has_palette() {
            let rect = vram::palette_rect(key.palette, key.mode);
            for_each_page_in_rect(&rect, |pn| add_page(&mut pages, &mut num_pages, pn));
            rect
        } else {
            Rect::INVALID
        };

        let handle = self.sources.insert(Source {
            key,
            palette_hash,
            cache_key,
            texture_rect: vram::texture_page_rect(key.page as u32, key.mode),
            palette_rect,
            active_uv_rect: Rect::INVALID,
            flags: SampleFlags::empty(),
            pages,
            num_pages: num_pages as u8,
        });

        for (i, &pn) in pages[..num_pages].iter().enumerate() {
            let list = &mut self.pages[pn as usize].sources;
            if i < texture_page_count {
                list.insert(0, handle);
            } else {
                list.push(handle);
            }
        }
        if let Some(entry) = self.hash_cache.get_mut(&cache_key) {
            entry.ref_count += 1;
            entry.sources.push(handle);
        }
        trace!("appended new source to {num_pages} pages");
        Ok(handle)
    }

    fn ensure_hash_cache_entry(
        &mut self,
        device: &mut D,
        vram: &VramView,
        key: SourceKey,
        cache_key: HashCacheKey,
    ) -> Result<(), GpuError> {
        if self.hash_cache.contains_key(&cache_key) {
            trace!(
                "hash cache hit {:x} {:x}",
                cache_key.texture_hash,
                cache_key.palette_hash
            );
            return Ok(());
        }
        trace!(
            "hash cache miss {:x} {:x}",
            cache_key.texture_hash,
            cache_key.palette_hash
        );

        let mut pixels = vec![0u32; (TEXTURE_PAGE_WIDTH * TEXTURE_PAGE_HEIGHT) as usize];
        decode::decode_page(vram, key.page as u32, key.palette, key.mode, &mut pixels);

        let mut texture = device
            .create_texture(TEXTURE_PAGE_WIDTH, TEXTURE_PAGE_HEIGHT)
            .map_err(|err| {
                error!("failed to allocate page texture: {err}");
                err
            })?;
        device.upload_texture(
            &mut texture,
            0,
            0,
            TEXTURE_PAGE_WIDTH,
            TEXTURE_PAGE_HEIGHT,
            &pixels,
            TEXTURE_PAGE_WIDTH as usize,
        );

        let mut entry = HashCacheEntry {
            texture,
            width: TEXTURE_PAGE_WIDTH,
            height: TEXTURE_PAGE_HEIGHT,
            ref_count: 0,
            last_used_frame: 0,
            sources: Vec::new(),
        };
        if self.settings.enable_texture_replacements {
            self.apply_replacements(device, vram, key, cache_key, &mut entry);
        }
        self.hash_cache_memory += entry.vram_usage();
        self.hash_cache.insert(cache_key, entry);
        Ok(())
    }

    /// Substitutes matching replacement imagery into a freshly decoded
    /// entry. Failure keeps the plain decode (logged, not propagated).
    fn apply_replacements(
        &mut self,
        device: &mut D,
        vram: &VramView,
        key: SourceKey,
        cache_key: HashCacheKey,
        entry: &mut HashCacheEntry<D::Texture>,
    ) {
        let mut subimages: Vec<SubImage> = Vec::new();
        if self.store.has_page_replacements() {
            self.store.page_subimages(
                &mut subimages,
                vram,
                key.page as u32,
                cache_key.texture_hash,
                cache_key.palette_hash,
                key.mode,
                key.palette,
            );
        }
        if self.store.has_vram_write_replacements() {
            let pr = page_rect(key.page as u32);
            let write_handles = self.pages[key.page as usize].writes.clone();
            for wh in write_handles {
                let Some((write_hash, write_rect)) =
                    self.writes.get(wh).map(|w| (w.hash, w.write_rect))
                else {
                    continue;
                };
                if !write_rect.intersects(&pr) {
                    continue;
                }
                // Map the write's texel space onto the page.
                let offset_to_page = (
                    key.mode.apply_shift(pr.left - write_rect.left),
                    pr.top - write_rect.top,
                );
                self.store.vram_write_subimages(
                    &mut subimages,
                    vram,
                    write_hash,
                    cache_key.palette_hash,
                    key.mode,
                    key.palette,
                    offset_to_page,
                );
            }
        }
        if subimages.is_empty() {
            return;
        }

        let mut scale_x = subimages[0].scale_x;
        let mut scale_y = subimages[0].scale_y;
        for si in &subimages {
            scale_x = scale_x.max(si.scale_x);
            scale_y = scale_y.max(si.scale_y);
        }
        let max_possible = device.max_texture_size() as f32 / TEXTURE_PAGE_WIDTH as f32;
        scale_x = scale_x.min(max_possible);
        scale_y = scale_y.min(max_possible);

        let width = (TEXTURE_PAGE_WIDTH as f32 * scale_x).ceil() as u32;
        let height = (TEXTURE_PAGE_HEIGHT as f32 * scale_y).ceil() as u32;

        let images: Vec<Arc<image::RgbaImage>> =
            subimages.iter().map(|si| si.image.clone()).collect();
        let blits: Vec<ReplacementBlit> = subimages
            .iter()
            .zip(&images)
            .map(|(si, image)| ReplacementBlit {
                pixels: image.as_raw(),
                width: image.width(),
                height: image.height(),
                dst_rect: Rect::new(
                    (si.dst_rect.left as f32 * scale_x) as i32,
                    (si.dst_rect.top as f32 * scale_y) as i32,
                    (si.dst_rect.right as f32 * scale_x) as i32,
                    (si.dst_rect.bottom as f32 * scale_y) as i32,
                ),
                invert_alpha: si.invert_alpha,
            })
            .collect();

        match device.composite_replacements(
            &entry.texture,
            width,
            height,
            &blits,
            self.config.replacement_scale_linear_filter,
        ) {
            Ok(new_texture) => {
                let old = std::mem::replace(&mut entry.texture, new_texture);
                device.recycle_texture(old);
                entry.width = width;
                entry.height = height;
            }
            Err(err) => error!("failed to composite {} replacement(s): {err}", blits.len()),
        }
    }

    /// Destroys one source: flushes its sampled region into overlapping
    /// write records (or dumps the page), unlinks it everywhere, and drops
    /// its hash cache reference.
    pub(crate) fn destroy_source(&mut self, vram: &VramView, handle: SourceHandle) {
        let Some(src) = self.sources.remove(handle) else {
            return;
        };
        if self.settings.dump_textures && !src.active_uv_rect.is_invalid() {
            if !self.config.dump_texture_pages {
                let mut write_handles: Vec<WriteHandle> = Vec::new();
                for_each_page_in_rect(&src.active_uv_rect, |pn| {
                    for &wh in &self.pages[pn as usize].writes {
                        if !write_handles.contains(&wh) {
                            write_handles.push(wh);
                        }
                    }
                });
                for wh in write_handles {
                    self.update_write_sources(vram, wh, src.key, &src.active_uv_rect, src.flags);
                }
            } else {
                self.dump_texture_from_page(vram, &src);
            }
        }

        for &pn in &src.pages[..src.num_pages as usize] {
            self.pages[pn as usize].sources.retain(|&h| h != handle);
        }
        if let Some(entry) = self.hash_cache.get_mut(&src.cache_key) {
            debug_assert!(entry.ref_count > 0);
            entry.sources.retain(|&h| h != handle);
            entry.ref_count = entry.ref_count.saturating_sub(1);
        }
    }

    /// Destroys sources on a page; with `rect`, only those whose texture or
    /// palette footprint overlaps it.
    pub(crate) fn invalidate_page_sources(
        &mut self,
        vram: &VramView,
        pn: usize,
        rect: Option<&Rect>,
    ) {
        let handles = self.pages[pn].sources.clone();
        for handle in handles {
            let Some(src) = self.sources.get(handle) else {
                continue;
            };
            if let Some(rc) = rect {
                let overlaps = src.texture_rect.intersects(rc)
                    || (src.key.mode.has_palette() && src.palette_rect.intersects(rc));
                if !overlaps {
                    continue;
                }
            }
            self.destroy_source(vram, handle);
        }
    }

    /// Full reset: every source, write, draw rect and hash cache entry.
    pub fn invalidate(&mut self, device: &mut D, vram: &VramView) {
        for pn in 0..NUM_VRAM_PAGES as usize {
            self.invalidate_page_sources(vram, pn, None);
            let page = &mut self.pages[pn];
            page.num_draw_rects = 0;
            page.total_draw_rect = Rect::default();
            page.draw_rects = [Rect::default(); NUM_PAGE_DRAW_RECTS];
            while let Some(&wh) = self.pages[pn].writes.last() {
                self.remove_vram_write(vram, wh);
            }
        }
        debug_assert!(self.sources.is_empty());
        debug_assert!(self.writes.is_empty());
        self.last_write = None;
        self.clear_hash_cache(device, vram);
    }

    /// Lighter reset after replacement reloads: sources and hash cache go,
    /// write tracking and draw rects stay.
    pub fn invalidate_sources(&mut self, device: &mut D, vram: &VramView) {
        for pn in 0..NUM_VRAM_PAGES as usize {
            self.invalidate_page_sources(vram, pn, None);
        }
        self.clear_hash_cache(device, vram);
    }

    fn remove_from_hash_cache(&mut self, device: &mut D, vram: &VramView, key: HashCacheKey) {
        let Some(handles) = self.hash_cache.get(&key).map(|e| e.sources.clone()) else {
            return;
        };
        for handle in handles {
            self.destroy_source(vram, handle);
        }
        if let Some(entry) = self.hash_cache.remove(&key) {
            debug_assert_eq!(entry.ref_count, 0);
            self.hash_cache_memory -= entry.vram_usage();
            device.recycle_texture(entry.texture);
        }
    }

    fn clear_hash_cache(&mut self, device: &mut D, vram: &VramView) {
        while let Some(&key) = self.hash_cache.keys().next() {
            self.remove_from_hash_cache(device, vram, key);
        }
        debug_assert_eq!(self.hash_cache_memory, 0);
    }

    /// Evicts stale hash cache entries. Entries still referenced by a
    /// source are never evicted.
    pub fn compact(&mut self, device: &mut D, vram: &VramView) {
        let max_entries = self.config.max_hash_cache_entries as usize;
        let max_memory = self.config.max_hash_cache_vram_usage_mb as usize * 1024 * 1024;
        let min_frame = self.frame_number.saturating_sub(MAX_HASH_CACHE_AGE);

        let mut purge_candidates: Vec<(HashCacheKey, u32)> = Vec::new();
        let expired: Vec<HashCacheKey> = self
            .hash_cache
            .iter()
            .filter_map(|(&key, entry)| {
                if entry.ref_count != 0 {
                    return None;
                }
                if entry.last_used_frame < min_frame {
                    Some(key)
                } else {
                    purge_candidates.push((key, entry.last_used_frame));
                    None
                }
            })
            .collect();
        for key in expired {
            self.remove_from_hash_cache(device, vram, key);
        }

        if self.hash_cache.len() <= max_entries && self.hash_cache_memory < max_memory {
            return;
        }

        purge_candidates.sort_by_key(|&(_, frame)| frame);
        let mut index = 0;
        while self.hash_cache.len() > max_entries || self.hash_cache_memory >= max_memory {
            let Some(&(key, _)) = purge_candidates.get(index) else {
                warn!(
                    "cannot find hash cache entries to purge, cache is {:.1} MB in {} textures",
                    self.hash_cache_memory as f64 / 1048576.0,
                    self.hash_cache.len()
                );
                break;
            };
            index += 1;
            self.remove_from_hash_cache(device, vram, key);
        }
    }

    /// End-of-frame hook: compacts, then advances the frame clock used for
    /// eviction ages.
    pub fn end_frame(&mut self, device: &mut D, vram: &VramView) {
        self.compact(device, vram);
        self.frame_number += 1;
    }

    /// Dumps the sampled (or whole) area of a page-keyed source.
    fn dump_texture_from_page(&mut self, vram: &VramView, src: &Source) {
        if !self.config.dump_c16_textures && !src.key.mode.has_palette() {
            return;
        }
        let dump_rect = if self.config.dump_full_texture_pages {
            src.texture_rect
        } else {
            src.active_uv_rect.intersect(&src.texture_rect)
        };
        if dump_rect.is_empty() {
            return;
        }

        let mode = src.key.mode;
        let texture_hash = hash::hash_rect(vram, &dump_rect);
        let clut: Vec<u16> = if mode.has_palette() {
            vram.palette(src.key.palette, mode).to_vec()
        } else {
            Vec::new()
        };

        let mut palette_hash = src.palette_hash;
        let (mut pal_min, mut pal_max) = if mode.has_palette() {
            (0u8, (mode.palette_size() - 1) as u8)
        } else {
            (0, 0)
        };
        if mode.has_palette() && self.config.reduce_palette_range {
            (pal_min, pal_max) = crate::replacement::dump::reduce_palette_bounds(
                vram,
                &dump_rect,
                mode,
                src.key.palette,
            );
            palette_hash = hash::hash_partial_clut(&clut, pal_min, pal_max);
        }

        self.dumper.dump_texture(
            &self.store,
            &self.settings,
            &self.config,
            vram,
            crate::replacement::name::ReplacementKind::TextureFromPage,
            mode.apply_shift(dump_rect.left - src.texture_rect.left) as u32,
            (dump_rect.top - src.texture_rect.top) as u32,
            src.texture_rect.width() as u32,
            src.texture_rect.height() as u32,
            mode,
            texture_hash,
            palette_hash,
            pal_min,
            pal_max,
            &clut,
            &dump_rect,
            src.flags,
        );
    }

    /// Replacement for a whole CPU upload, keyed by its 128-bit content
    /// hash. The renderer blits this instead of the uploaded pixels.
    pub fn vram_write_replacement(
        &mut self,
        width: u32,
        height: u32,
        pixels: &[u16],
    ) -> Option<Arc<image::RgbaImage>> {
        debug_assert_eq!(pixels.len(), (width * height) as usize);
        if !self.settings.enable_vram_write_replacements {
            return None;
        }
        let (low, high) = hash::vram_upload_hash(pixels);
        self.store
            .vram_replacement(crate::replacement::name::VramWriteName::new(low, high))
    }

    pub fn should_dump_vram_write(&self, width: u32, height: u32) -> bool {
        crate::replacement::dump::should_dump_vram_write(&self.settings, &self.config, width, height)
    }

    /// Dumps a raw upload (pre-mask pixels, as sent by the CPU).
    pub fn dump_vram_write(&mut self, width: u32, height: u32, pixels: &[u16]) {
        debug_assert_eq!(pixels.len(), (width * height) as usize);
        self.dumper
            .dump_vram_write(&self.store, &self.settings, &self.config, width, height, pixels);
    }

    pub(crate) fn page_mut(&mut self, pn: usize) -> &mut PageEntry {
        &mut self.pages[pn]
    }

    /// Entry refcount for a content key, if cached. Test/diagnostic hook.
    pub fn hash_cache_ref_count(&self, key: &HashCacheKey) -> Option<u32> {
        self.hash_cache.get(key).map(|e| e.ref_count)
    }

    pub fn source_cache_key(&self, handle: SourceHandle) -> Option<HashCacheKey> {
        self.sources.get(handle).map(|s| s.cache_key)
    }

    pub(crate) fn source_ref(&self, handle: SourceHandle) -> Option<&Source> {
        self.sources.get(handle)
    }
}
