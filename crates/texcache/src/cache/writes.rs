//! Tracked CPU uploads: creation, coalescing, splitting on partial
//! overwrite, palette records, and the write-keyed dump path.

use tracing::{debug, trace};

use crate::geom::{for_each_page_in_rect, Rect};
use crate::hash;
use crate::replacement::dump::reduce_palette_bounds;
use crate::replacement::name::ReplacementKind;
use crate::vram::{VramView, MAX_CLUT_SIZE};

use super::{
    GpuDevice, SampleFlags, SourceKey, TextureCache, WriteHandle, MAX_PAGE_REFS_PER_WRITE,
};

/// One tracked CPU upload. `write_rect` is the original bounds (the dump
/// coordinate frame); `active_rect` shrinks as overwrites split the entry.
pub(crate) struct VramWrite {
    pub active_rect: Rect,
    pub write_rect: Rect,
    pub hash: hash::ContentHash,
    pub num_splits: u32,
    pub palette_records: Vec<PaletteRecord>,
    pub pages: [u8; MAX_PAGE_REFS_PER_WRITE],
    pub num_pages: u8,
}

/// Palette snapshot taken when a source that sampled this write dies. The
/// upload bytes outlive the CLUT, so the CLUT is copied eagerly.
#[derive(Clone)]
pub(crate) struct PaletteRecord {
    /// Sampled region, in VRAM coordinates within the write.
    pub rect: Rect,
    pub key: SourceKey,
    pub flags: SampleFlags,
    pub palette_hash: hash::ContentHash,
    pub palette: [u16; MAX_CLUT_SIZE],
}

fn pages_in_rect(rect: &Rect) -> Vec<u32> {
    let mut pages = Vec::new();
    for_each_page_in_rect(rect, |pn| pages.push(pn));
    pages
}

fn collect_write_pages(rect: &Rect) -> ([u8; MAX_PAGE_REFS_PER_WRITE], u8) {
    let mut pages = [0u8; MAX_PAGE_REFS_PER_WRITE];
    let mut num = 0usize;
    for_each_page_in_rect(rect, |pn| {
        assert!(num < MAX_PAGE_REFS_PER_WRITE, "write page fan-out exceeded");
        pages[num] = pn as u8;
        num += 1;
    });
    (pages, num as u8)
}

fn new_palette_record(
    vram: &VramView,
    key: SourceKey,
    rect: Rect,
    flags: SampleFlags,
) -> PaletteRecord {
    let mut palette = [0u16; MAX_CLUT_SIZE];
    let palette_hash = if key.mode.has_palette() {
        // A CLUT clamped at the VRAM edge hashes short; the tail stays zero.
        let src = vram.palette(key.palette, key.mode);
        palette[..src.len()].copy_from_slice(src);
        hash::hash_clut(src)
    } else {
        0
    };
    PaletteRecord { rect, key, flags, palette_hash, palette }
}

impl<D: GpuDevice> TextureCache<D> {
    /// Call after a CPU upload has been applied to VRAM. Settles existing
    /// state over `bounds`, then (when tracking) records the upload as a
    /// new write or an extension of the previous one.
    pub fn write_vram(&mut self, vram: &VramView, bounds: &Rect) {
        let recovered = self.written_rectangle(vram, bounds, self.track_writes);
        if !self.track_writes || recovered {
            return;
        }
        if let Some(last) = self.last_write {
            if self.try_merge_vram_write(vram, last, bounds) {
                return;
            }
        }

        let hash = hash::hash_rect(vram, bounds);
        let (pages, num_pages) = collect_write_pages(bounds);
        let handle = self.writes.insert(VramWrite {
            active_rect: *bounds,
            write_rect: *bounds,
            hash,
            num_splits: 0,
            palette_records: Vec::new(),
            pages,
            num_pages,
        });
        for &pn in &pages[..num_pages as usize] {
            self.pages[pn as usize].writes.push(handle);
        }
        debug!("new VRAM write {hash:016X} at {bounds} touching {num_pages} page(s)");
        self.last_write = Some(handle);
    }

    /// (active, original upload) bounds of every tracked write. Diagnostic.
    pub fn write_rects(&self) -> Vec<(Rect, Rect)> {
        self.writes
            .iter()
            .map(|(_, w)| (w.active_rect, w.write_rect))
            .collect()
    }

    /// First half of a VRAM-to-VRAM copy: call with the view of VRAM
    /// *before* the copy lands, so convert-copies-to-writes can dump the
    /// bytes being overwritten.
    pub fn copy_vram_begin(&mut self, vram: &VramView, dst_bounds: &Rect) {
        if !self.config.convert_copies_to_writes {
            return;
        }
        let mut handles: Vec<WriteHandle> = Vec::new();
        for pn in pages_in_rect(dst_bounds) {
            for &wh in &self.pages[pn as usize].writes {
                if !handles.contains(&wh) {
                    handles.push(wh);
                }
            }
        }
        for wh in handles {
            let Some(active) = self.writes.get(wh).map(|w| w.active_rect) else {
                continue;
            };
            if !active.intersects(dst_bounds) {
                continue;
            }
            self.sync_write_palette_records(vram, wh);
            let Some((write_rect, write_hash, records)) = self
                .writes
                .get(wh)
                .map(|w| (w.write_rect, w.hash, w.palette_records.clone()))
            else {
                continue;
            };
            self.dump_write_records(vram, &write_rect, write_hash, &records);
        }
    }

    /// Second half of a VRAM-to-VRAM copy: call with the post-copy view.
    /// With convert-copies-to-writes, intact overlapped writes are rehashed
    /// in place rather than destroyed.
    pub fn copy_vram_end(&mut self, vram: &VramView, dst_bounds: &Rect) {
        let update = self.config.convert_copies_to_writes;
        self.written_rectangle(vram, dst_bounds, update);
    }

    /// A rectangle of VRAM changed without being a tracked upload (or as
    /// part of settling one). Destroys overlapped sources and draw rects,
    /// and updates, splits, or removes overlapped writes.
    pub fn add_written_rectangle(&mut self, vram: &VramView, bounds: &Rect) {
        self.written_rectangle(vram, bounds, false);
    }

    /// Returns true when an existing write wholly containing `bounds` was
    /// rehashed in place, meaning the caller must not record a new write
    /// for the same bytes.
    pub(crate) fn written_rectangle(
        &mut self,
        vram: &VramView,
        bounds: &Rect,
        update_writes: bool,
    ) -> bool {
        let mut recovered = false;
        for pn in pages_in_rect(bounds) {
            self.invalidate_page_sources(vram, pn as usize, Some(bounds));
            self.remove_draw_rects_overlapping(pn as usize, bounds);

            let handles = self.pages[pn as usize].writes.clone();
            for wh in handles {
                let Some((active, write_rect, num_splits, old_hash)) = self
                    .writes
                    .get(wh)
                    .map(|w| (w.active_rect, w.write_rect, w.num_splits, w.hash))
                else {
                    continue;
                };
                let intersection = active.intersect(bounds);
                if intersection.is_empty() {
                    continue;
                }
                if update_writes && active.contains(bounds) {
                    let new_hash = hash::hash_rect(vram, &write_rect);
                    trace!("updating VRAM write {old_hash:016X} => {new_hash:016X}");
                    if let Some(w) = self.writes.get_mut(wh) {
                        w.hash = new_hash;
                    }
                    recovered = true;
                } else if num_splits < self.config.max_vram_write_splits
                    && active != intersection
                {
                    self.split_vram_write(vram, wh, &intersection);
                } else {
                    self.remove_vram_write(vram, wh);
                }
            }
        }
        recovered
    }

    /// Grows the previous write to cover an adjacent upload, for games that
    /// stream one image as many row- or column-strips. The write must be
    /// unsplit and unsampled, and the new bounds must extend it exactly.
    fn try_merge_vram_write(
        &mut self,
        vram: &VramView,
        handle: WriteHandle,
        written: &Rect,
    ) -> bool {
        let Some((write_rect, active_rect, num_splits)) = self
            .writes
            .get(handle)
            .map(|w| (w.write_rect, w.active_rect, w.num_splits))
        else {
            return false;
        };
        if num_splits != 0 {
            return false;
        }

        let merge_vertical = written.height() as u32 <= self.config.max_vram_write_coalesce_height
            && write_rect.left == written.left
            && write_rect.right == written.right
            && write_rect.bottom == written.top;
        let merge_horizontal = written.width() as u32 <= self.config.max_vram_write_coalesce_width
            && write_rect.top == written.top
            && write_rect.bottom == written.bottom
            && write_rect.right == written.left;
        if !merge_vertical && !merge_horizontal {
            return false;
        }

        // A sampled source in any of the write's pages means the old bytes
        // are already referenced; merging would change their identity.
        for pn in pages_in_rect(&active_rect) {
            for &sh in &self.pages[pn as usize].sources {
                if self
                    .source_ref(sh)
                    .is_some_and(|s| !s.active_uv_rect.is_invalid())
                {
                    return false;
                }
            }
        }

        let Some((old_pages, old_num)) = self.writes.get(handle).map(|w| (w.pages, w.num_pages))
        else {
            return false;
        };
        for &pn in &old_pages[..old_num as usize] {
            self.pages[pn as usize].writes.retain(|&h| h != handle);
        }

        let new_rect = write_rect.union(written);
        debug!("expanding VRAM write {write_rect} to {new_rect}");
        let new_hash = hash::hash_rect(vram, &new_rect);
        let (pages, num_pages) = collect_write_pages(&new_rect);
        if let Some(w) = self.writes.get_mut(handle) {
            w.active_rect = new_rect;
            w.write_rect = new_rect;
            w.hash = new_hash;
            w.pages = pages;
            w.num_pages = num_pages;
        }
        for &pn in &pages[..num_pages as usize] {
            self.pages[pn as usize].writes.push(handle);
        }
        true
    }

    /// Replaces a write with up to four remainder writes covering
    /// `active_rect` minus `overwritten`. Remainders keep the parent's
    /// upload hash, frame and intersecting palette records.
    fn split_vram_write(&mut self, vram: &VramView, handle: WriteHandle, overwritten: &Rect) {
        self.sync_write_palette_records(vram, handle);
        let Some(w) = self.writes.remove(handle) else {
            return;
        };
        for &pn in &w.pages[..w.num_pages as usize] {
            self.pages[pn as usize].writes.retain(|&h| h != handle);
        }
        if self.last_write == Some(handle) {
            self.last_write = None;
        }

        let a = w.active_rect;
        let o = *overwritten;
        let to_left = o.left - a.left;
        let to_right = a.right - o.right;
        let to_top = o.top - a.top;
        let to_bottom = a.bottom - o.bottom;
        let num_splits = w.num_splits + 1;

        // Keep the larger remainders whole: full-width strips when the cut
        // is mostly vertical, full-height strips otherwise.
        let remainders: [Rect; 4] = if to_top.max(to_bottom) > to_left.max(to_right) {
            [
                Rect::new(a.left, a.top, a.right, o.top),
                Rect::new(a.left, o.bottom, a.right, a.bottom),
                Rect::new(a.left, o.top, o.left, o.bottom),
                Rect::new(o.right, o.top, a.right, o.bottom),
            ]
        } else {
            [
                Rect::new(a.left, a.top, o.left, a.bottom),
                Rect::new(o.right, a.top, a.right, a.bottom),
                Rect::new(o.left, a.top, o.right, o.top),
                Rect::new(o.left, o.bottom, o.right, a.bottom),
            ]
        };

        for rect in remainders {
            if rect.is_empty() {
                continue;
            }
            let palette_records: Vec<PaletteRecord> = w
                .palette_records
                .iter()
                .filter(|r| r.rect.intersects(&rect))
                .cloned()
                .collect();
            let (pages, num_pages) = collect_write_pages(&rect);
            let new_handle = self.writes.insert(VramWrite {
                active_rect: rect,
                write_rect: w.write_rect,
                hash: w.hash,
                num_splits,
                palette_records,
                pages,
                num_pages,
            });
            for &pn in &pages[..num_pages as usize] {
                self.pages[pn as usize].writes.push(new_handle);
            }
            debug!(
                "split VRAM write {:016X} at {} => {}",
                w.hash, a, rect
            );
        }
    }

    /// Unlinks and dumps one write. When a sibling split with the same
    /// upload hash survives, this entry's palette records move to it so the
    /// eventual last sibling dumps the full sampled set once.
    pub(crate) fn remove_vram_write(&mut self, vram: &VramView, handle: WriteHandle) {
        self.sync_write_palette_records(vram, handle);
        let Some(mut w) = self.writes.remove(handle) else {
            return;
        };
        debug!("remove VRAM write {:016X} at {}", w.hash, w.active_rect);

        if w.num_splits > 0 && !w.palette_records.is_empty() {
            let mut sibling: Option<WriteHandle> = None;
            'outer: for pn in pages_in_rect(&w.write_rect) {
                for &other in &self.pages[pn as usize].writes {
                    if other == handle {
                        continue;
                    }
                    if self.writes.get(other).is_some_and(|o| o.hash == w.hash) {
                        sibling = Some(other);
                        break 'outer;
                    }
                }
            }
            if let Some(sh) = sibling {
                let records = std::mem::take(&mut w.palette_records);
                if let Some(other) = self.writes.get_mut(sh) {
                    for rec in records {
                        match other.palette_records.iter_mut().find(|r| r.key == rec.key) {
                            Some(existing) => {
                                existing.rect = existing.rect.union(&rec.rect);
                                existing.flags |= rec.flags;
                            }
                            None => other.palette_records.push(rec),
                        }
                    }
                }
            }
        }

        for &pn in &w.pages[..w.num_pages as usize] {
            self.pages[pn as usize].writes.retain(|&h| h != handle);
        }
        self.dump_textures_from_write(vram, &w);
        if self.last_write == Some(handle) {
            self.last_write = None;
        }
    }

    /// Folds the sampled regions of all live sources in the write's pages
    /// into its palette records, so a later dump sees everything drawn with
    /// these bytes even after the sources die.
    pub(crate) fn sync_write_palette_records(&mut self, vram: &VramView, handle: WriteHandle) {
        if !self.is_dumping_vram_write_textures() {
            return;
        }
        let Some(active) = self.writes.get(handle).map(|w| w.active_rect) else {
            return;
        };
        let mut sampled: Vec<(SourceKey, Rect, SampleFlags)> = Vec::new();
        for pn in pages_in_rect(&active) {
            for &sh in &self.pages[pn as usize].sources {
                if let Some(src) = self.source_ref(sh) {
                    if !src.active_uv_rect.is_invalid() {
                        sampled.push((src.key, src.active_uv_rect, src.flags));
                    }
                }
            }
        }
        for (key, rect, flags) in sampled {
            self.update_write_sources(vram, handle, key, &rect, flags);
        }
    }

    /// Merges one sampled region into a write's palette records, snapping
    /// the CLUT on first sight of a key.
    pub(crate) fn update_write_sources(
        &mut self,
        vram: &VramView,
        handle: WriteHandle,
        key: SourceKey,
        uv_rect: &Rect,
        flags: SampleFlags,
    ) {
        let Some(w) = self.writes.get_mut(handle) else {
            return;
        };
        let intersection = w.active_rect.intersect(uv_rect);
        if intersection.is_empty() {
            return;
        }
        match w.palette_records.iter_mut().find(|r| r.key == key) {
            Some(rec) => {
                rec.rect = rec.rect.union(&intersection);
                rec.flags |= flags;
            }
            None => w
                .palette_records
                .push(new_palette_record(vram, key, intersection, flags)),
        }
    }

    /// Dumps every recorded sampled region of a write, decoding with the
    /// recorded palette snapshot.
    pub(crate) fn dump_textures_from_write(&mut self, vram: &VramView, w: &VramWrite) {
        let records = w.palette_records.clone();
        self.dump_write_records(vram, &w.write_rect, w.hash, &records);
    }

    fn dump_write_records(
        &mut self,
        vram: &VramView,
        write_rect: &Rect,
        write_hash: hash::ContentHash,
        records: &[PaletteRecord],
    ) {
        if !self.is_dumping_vram_write_textures() {
            return;
        }
        for rec in records {
            let mode = rec.key.mode;
            if !mode.has_palette() && !self.config.dump_c16_textures {
                continue;
            }

            let mut palette_hash = rec.palette_hash;
            let (mut pal_min, mut pal_max) = if mode.has_palette() {
                (0u8, (mode.palette_size() - 1) as u8)
            } else {
                (0, 0)
            };
            if mode.has_palette() && self.config.reduce_palette_range {
                (pal_min, pal_max) = reduce_palette_bounds(vram, &rec.rect, mode, rec.key.palette);
                palette_hash = hash::hash_partial_clut(&rec.palette, pal_min, pal_max);
            }

            self.dumper.dump_texture(
                &self.store,
                &self.settings,
                &self.config,
                vram,
                ReplacementKind::TextureFromVramWrite,
                mode.apply_shift(rec.rect.left - write_rect.left) as u32,
                (rec.rect.top - write_rect.top) as u32,
                write_rect.width() as u32,
                write_rect.height() as u32,
                mode,
                write_hash,
                palette_hash,
                pal_min,
                pal_max,
                &rec.palette[..if mode.has_palette() { mode.palette_size() as usize } else { 0 }],
                &rec.rect,
                rec.flags,
            );
        }
    }
}
