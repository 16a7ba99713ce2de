//! Rectangles and the VRAM page grid.
//!
//! VRAM is a 1024x512 grid of 16-bit pixels, carved into 64x256 pages
//! (16 across, 2 down). Everything in the cache is bookkept per page, so
//! rect-to-page iteration lives here alongside the rect type itself.

use std::fmt;

pub const VRAM_WIDTH: u32 = 1024;
pub const VRAM_HEIGHT: u32 = 512;

pub const VRAM_PAGE_WIDTH: u32 = 64;
pub const VRAM_PAGE_HEIGHT: u32 = 256;
pub const VRAM_PAGES_WIDE: u32 = VRAM_WIDTH / VRAM_PAGE_WIDTH;
pub const VRAM_PAGES_HIGH: u32 = VRAM_HEIGHT / VRAM_PAGE_HEIGHT;
pub const NUM_VRAM_PAGES: u32 = VRAM_PAGES_WIDE * VRAM_PAGES_HIGH;

pub const VRAM_PAGE_X_MASK: u32 = 0x0f;
pub const VRAM_PAGE_Y_MASK: u32 = 0x10;

/// A texture page always addresses 256x256 texels, regardless of how many
/// VRAM pages those texels occupy.
pub const TEXTURE_PAGE_WIDTH: u32 = 256;
pub const TEXTURE_PAGE_HEIGHT: u32 = 256;

/// Half-open rectangle in VRAM coordinates: `[left, right) x [top, bottom)`.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    /// Accumulator identity: `INVALID.union(r) == r` for any `r`.
    pub const INVALID: Rect = Rect {
        left: i32::MAX,
        top: i32::MAX,
        right: i32::MIN,
        bottom: i32::MIN,
    };

    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Rect { left, top, right, bottom }
    }

    pub const fn from_extents(x: u32, y: u32, width: u32, height: u32) -> Self {
        Rect {
            left: x as i32,
            top: y as i32,
            right: (x + width) as i32,
            bottom: (y + height) as i32,
        }
    }

    pub const fn width(&self) -> i32 {
        self.right - self.left
    }

    pub const fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub const fn is_empty(&self) -> bool {
        self.right <= self.left || self.bottom <= self.top
    }

    pub fn is_invalid(&self) -> bool {
        *self == Rect::INVALID
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.left < other.right
            && self.right > other.left
            && self.top < other.bottom
            && self.bottom > other.top
    }

    /// True when `other` lies entirely inside `self`.
    pub fn contains(&self, other: &Rect) -> bool {
        self.left <= other.left
            && self.right >= other.right
            && self.top <= other.top
            && self.bottom >= other.bottom
    }

    pub fn intersect(&self, other: &Rect) -> Rect {
        Rect {
            left: self.left.max(other.left),
            top: self.top.max(other.top),
            right: self.right.min(other.right),
            bottom: self.bottom.min(other.bottom),
        }
    }

    pub fn union(&self, other: &Rect) -> Rect {
        Rect {
            left: self.left.min(other.left),
            top: self.top.min(other.top),
            right: self.right.max(other.right),
            bottom: self.bottom.max(other.bottom),
        }
    }

    /// Squared distance between rect centers, in quarter-pixel units.
    pub fn center_distance_sq(&self, other: &Rect) -> i64 {
        let ax = (self.left + self.right) as i64;
        let ay = (self.top + self.bottom) as i64;
        let bx = (other.left + other.right) as i64;
        let by = (other.top + other.bottom) as i64;
        let dx = ax - bx;
        let dy = ay - by;
        dx * dx + dy * dy
    }
}

impl fmt::Debug for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({},{} => {},{})",
            self.left, self.top, self.right, self.bottom
        )
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub const fn page_index(x_page: u32, y_page: u32) -> u32 {
    y_page * VRAM_PAGES_WIDE + x_page
}

pub const fn page_start_x(page: u32) -> u32 {
    (page & VRAM_PAGE_X_MASK) * VRAM_PAGE_WIDTH
}

pub const fn page_start_y(page: u32) -> u32 {
    ((page & VRAM_PAGE_Y_MASK) >> 4) * VRAM_PAGE_HEIGHT
}

pub const fn page_rect(page: u32) -> Rect {
    Rect::from_extents(
        page_start_x(page),
        page_start_y(page),
        VRAM_PAGE_WIDTH,
        VRAM_PAGE_HEIGHT,
    )
}

/// Calls `f` for every page the rect touches. The rect must lie within VRAM.
pub fn for_each_page_in_rect(rect: &Rect, mut f: impl FnMut(u32)) {
    debug_assert!(!rect.is_empty());
    debug_assert!(rect.left >= 0 && rect.right <= VRAM_WIDTH as i32);
    debug_assert!(rect.top >= 0 && rect.bottom <= VRAM_HEIGHT as i32);
    let x0 = rect.left as u32 / VRAM_PAGE_WIDTH;
    let x1 = (rect.right as u32 - 1) / VRAM_PAGE_WIDTH;
    let y0 = rect.top as u32 / VRAM_PAGE_HEIGHT;
    let y1 = (rect.bottom as u32 - 1) / VRAM_PAGE_HEIGHT;
    for y in y0..=y1 {
        for x in x0..=x1 {
            f(page_index(x, y));
        }
    }
}

/// Early-exit variant: stops (returning false) as soon as `f` returns false.
pub fn all_pages_in_rect(rect: &Rect, mut f: impl FnMut(u32) -> bool) -> bool {
    let x0 = rect.left as u32 / VRAM_PAGE_WIDTH;
    let x1 = (rect.right as u32 - 1) / VRAM_PAGE_WIDTH;
    let y0 = rect.top as u32 / VRAM_PAGE_HEIGHT;
    let y1 = (rect.bottom as u32 - 1) / VRAM_PAGE_HEIGHT;
    for y in y0..=y1 {
        for x in x0..=x1 {
            if !f(page_index(x, y)) {
                return false;
            }
        }
    }
    true
}

/// Iterates `count` pages starting at `page`, wrapping in X within the same
/// row of the page grid. Texture footprints wrap this way.
pub fn for_each_wrapped_page(page: u32, count: u32, mut f: impl FnMut(u32)) {
    let row_base = page & VRAM_PAGE_Y_MASK;
    let mut x = page & VRAM_PAGE_X_MASK;
    for _ in 0..count {
        f(row_base | x);
        x = (x + 1) & VRAM_PAGE_X_MASK;
    }
}

/// Early-exit variant of [`for_each_wrapped_page`].
pub fn all_wrapped_pages(page: u32, count: u32, mut f: impl FnMut(u32) -> bool) -> bool {
    let row_base = page & VRAM_PAGE_Y_MASK;
    let mut x = page & VRAM_PAGE_X_MASK;
    for _ in 0..count {
        if !f(row_base | x) {
            return false;
        }
        x = (x + 1) & VRAM_PAGE_X_MASK;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_basics() {
        let r = Rect::from_extents(64, 0, 64, 256);
        assert_eq!(r.width(), 64);
        assert_eq!(r.height(), 256);
        assert!(!r.is_empty());
        assert!(Rect::new(10, 10, 10, 20).is_empty());
        assert!(Rect::INVALID.is_invalid());
    }

    #[test]
    fn union_with_invalid_is_identity() {
        let r = Rect::new(5, 6, 7, 8);
        assert_eq!(Rect::INVALID.union(&r), r);
    }

    #[test]
    fn intersect_and_contains() {
        let a = Rect::new(0, 0, 100, 100);
        let b = Rect::new(50, 50, 150, 150);
        assert!(a.intersects(&b));
        assert_eq!(a.intersect(&b), Rect::new(50, 50, 100, 100));
        assert!(a.contains(&Rect::new(10, 10, 20, 20)));
        assert!(!a.contains(&b));
        // Touching edges do not intersect.
        assert!(!a.intersects(&Rect::new(100, 0, 200, 100)));
    }

    #[test]
    fn page_grid_layout() {
        assert_eq!(NUM_VRAM_PAGES, 32);
        assert_eq!(page_index(0, 0), 0);
        assert_eq!(page_index(15, 0), 15);
        assert_eq!(page_index(0, 1), 16);
        assert_eq!(page_rect(17), Rect::from_extents(64, 256, 64, 256));
    }

    #[test]
    fn pages_in_rect() {
        let mut pages = Vec::new();
        for_each_page_in_rect(&Rect::from_extents(60, 250, 10, 10), |p| pages.push(p));
        assert_eq!(pages, vec![0, 1, 16, 17]);

        let mut pages = Vec::new();
        for_each_page_in_rect(&Rect::from_extents(0, 0, 64, 256), |p| pages.push(p));
        assert_eq!(pages, vec![0]);
    }

    #[test]
    fn wrapped_pages_wrap_within_row() {
        let mut pages = Vec::new();
        for_each_wrapped_page(page_index(14, 1), 4, |p| pages.push(p));
        assert_eq!(pages, vec![30, 31, 16, 17]);
        assert!(all_wrapped_pages(30, 4, |p| p >= 16));
        assert!(!all_wrapped_pages(30, 4, |p| p != 17));
    }

    #[test]
    fn center_distance() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(10, 0, 20, 10);
        // Centers are 10 apart in x; quarter-pixel units square to 400.
        assert_eq!(a.center_distance_sq(&b), 400);
        assert_eq!(a.center_distance_sq(&a), 0);
    }
}
