use texcache::{
    CacheSettings, PaletteReg, Rect, SoftwareDevice, SourceKey, TextureCache, TextureMode,
    VRAM_HEIGHT, VRAM_WIDTH,
};

pub fn vram_buffer() -> Vec<u16> {
    vec![0u16; (VRAM_WIDTH * VRAM_HEIGHT) as usize]
}

pub fn fill_rect(buf: &mut [u16], rect: Rect, f: impl Fn(u32, u32) -> u16) {
    for y in rect.top..rect.bottom {
        for x in rect.left..rect.right {
            buf[(y as u32 * VRAM_WIDTH + x as u32) as usize] = f(x as u32, y as u32);
        }
    }
}

pub fn new_cache(settings: CacheSettings) -> (TextureCache<SoftwareDevice>, SoftwareDevice) {
    let mut device = SoftwareDevice::default();
    let cache = TextureCache::new(settings, &mut device).expect("software device cannot fail");
    (cache, device)
}

pub fn p4_key(page: u8) -> SourceKey {
    SourceKey::new(page, PaletteReg::from_coords(0, 511), TextureMode::Palette4Bit)
}

pub fn c16_key(page: u8) -> SourceKey {
    SourceKey::new(page, PaletteReg(0), TextureMode::Direct16Bit)
}
