//! Texture cache and invalidation engine for an emulated PSX-style GPU.
//!
//! VRAM is a single 1024x512 16bpp surface holding framebuffers, textures
//! and palettes at once, with no hardware notion of object lifetime. This
//! crate tracks how that memory actually gets used: which rectangles were
//! uploaded by the CPU, which were rendered by the GPU, and which decoded
//! textures derived from them are still valid. On top of that bookkeeping
//! sit content-hash deduplication of decoded pages, texture replacement
//! from user-supplied images, and dumping of original textures for
//! replacement authoring.
//!
//! The cache owns no GPU resources directly; the caller supplies a
//! [`GpuDevice`] implementation and the VRAM shadow per call.

pub mod cache;
pub mod config;
pub mod decode;
pub mod device;
pub mod geom;
pub mod hash;
pub mod replacement;
pub mod slab;
pub mod state;
pub mod vram;

pub use cache::{
    HashCacheKey, SampleFlags, SourceHandle, SourceKey, TextureCache, MAX_PAGE_REFS_PER_SOURCE,
    MAX_PAGE_REFS_PER_WRITE, NUM_PAGE_DRAW_RECTS,
};
pub use config::{CacheSettings, Configuration};
pub use device::{GpuDevice, GpuError, ReplacementBlit, SoftwareDevice, SoftwareTexture};
pub use geom::{Rect, NUM_VRAM_PAGES, VRAM_HEIGHT, VRAM_WIDTH};
pub use state::StateError;
pub use vram::{PaletteReg, TextureMode, VramView, MAX_CLUT_SIZE};
