//! Per-page drawn-area tracking.
//!
//! Each page keeps up to four disjoint-ish draw rects plus their union, so
//! a draw into one corner of a page does not poison sources reading the
//! other corner.

use tracing::trace;

use crate::geom::{all_pages_in_rect, all_wrapped_pages, for_each_page_in_rect, page_rect, Rect};
use crate::vram::VramView;

use super::{GpuDevice, SourceKey, TextureCache, NUM_PAGE_DRAW_RECTS};

impl<D: GpuDevice> TextureCache<D> {
    /// Records a rasterized rectangle. Overlapped writes die immediately;
    /// overlapped sources die per affected slot. `clip_rect` is the draw's
    /// scissor, used to pick which slot absorbs the new area.
    pub fn add_drawn_rectangle(&mut self, vram: &VramView, rect: &Rect, clip_rect: &Rect) {
        trace!("drawn rect {rect}");
        let mut pages = Vec::new();
        for_each_page_in_rect(rect, |pn| pages.push(pn));
        for pn in pages {
            let handles = self.pages[pn as usize].writes.clone();
            for wh in handles {
                if self
                    .writes
                    .get(wh)
                    .is_some_and(|w| w.active_rect.intersects(rect))
                {
                    self.remove_vram_write(vram, wh);
                }
            }
            let page_local = rect.intersect(&page_rect(pn));
            self.add_draw_rect_to_page(vram, pn as usize, page_local, clip_rect);
        }
    }

    fn add_draw_rect_to_page(&mut self, vram: &VramView, pn: usize, rc: Rect, clip_rect: &Rect) {
        let page = &mut self.pages[pn];
        if page.num_draw_rects == 0 {
            page.total_draw_rect = rc;
            page.draw_rects[0] = rc;
            page.num_draw_rects = 1;
            trace!("new draw rect for page {pn}: {rc}");
            self.invalidate_page_sources(vram, pn, Some(&rc));
            return;
        }

        // Prefer a slot the scissor already touches; draws within one clip
        // tend to cluster.
        let mut candidate = page.num_draw_rects;
        for i in 0..page.num_draw_rects {
            let dr = page.draw_rects[i];
            if dr.contains(&rc) {
                return;
            }
            if clip_rect.intersects(&dr) {
                candidate = i;
            }
        }
        if candidate == NUM_PAGE_DRAW_RECTS {
            trace!("out of draw rects for page {pn}, using closest");
            candidate = 0;
            let mut best = rc.center_distance_sq(&page.draw_rects[0]);
            for i in 1..NUM_PAGE_DRAW_RECTS {
                let dist = rc.center_distance_sq(&page.draw_rects[i]);
                if dist < best {
                    best = dist;
                    candidate = i;
                }
            }
        }

        let invalidate_rect = if candidate != page.num_draw_rects {
            let merged = page.draw_rects[candidate].union(&rc);
            page.draw_rects[candidate] = merged;
            merged
        } else {
            page.draw_rects[candidate] = rc;
            page.num_draw_rects += 1;
            rc
        };
        page.total_draw_rect = page.total_draw_rect.union(&rc);
        trace!("page {pn} draw rect grown to {invalidate_rect}");
        self.invalidate_page_sources(vram, pn, Some(&invalidate_rect));
    }

    /// Drops draw rects a CPU write just overwrote; those pixels are no
    /// longer GPU-rendered.
    pub(crate) fn remove_draw_rects_overlapping(&mut self, pn: usize, rect: &Rect) {
        let page = &mut self.pages[pn];
        if page.num_draw_rects == 0 {
            return;
        }
        let mut i = 0;
        while i < page.num_draw_rects {
            if page.draw_rects[i].intersects(rect) {
                trace!("remove draw rect {} from page {pn}", page.draw_rects[i]);
                // Compact: move the tail down one slot.
                for j in i..page.num_draw_rects - 1 {
                    page.draw_rects[j] = page.draw_rects[j + 1];
                }
                page.num_draw_rects -= 1;
            } else {
                i += 1;
            }
        }
        page.total_draw_rect = Rect::default();
        for j in 0..page.num_draw_rects {
            let dr = page.draw_rects[j];
            page.total_draw_rect = if j == 0 {
                dr
            } else {
                page.total_draw_rect.union(&dr)
            };
        }
    }

    /// True when any draw rect on the page overlaps `rect`.
    pub fn is_page_drawn(&self, pn: usize, rect: &Rect) -> bool {
        let page = &self.pages[pn];
        page.num_draw_rects > 0
            && page.total_draw_rect.intersects(rect)
            && page.draw_rects[..page.num_draw_rects]
                .iter()
                .any(|dr| dr.intersects(rect))
    }

    pub fn is_rect_drawn(&self, rect: &Rect) -> bool {
        !all_pages_in_rect(rect, |pn| !self.is_page_drawn(pn as usize, rect))
    }

    /// True when the draw would read from pixels it (or an earlier draw)
    /// rendered: any texture page of `key`, limited to the sampled UV rect,
    /// has been drawn into.
    pub fn are_source_pages_drawn(&self, key: SourceKey, uv_rect: &Rect) -> bool {
        !all_wrapped_pages(key.page as u32, key.mode.texture_page_count(), |pn| {
            !self.is_page_drawn(pn as usize, uv_rect)
        })
    }
}
