//! Replacement and dump round trips against real directories, plus state
//! save/load.

mod common;

use pretty_assertions::assert_eq;

use common::{c16_key, fill_rect, new_cache, p4_key, vram_buffer};
use texcache::replacement::name::{ReplacementKind, TextureName, VramWriteName};
use texcache::{
    hash, CacheSettings, Rect, SampleFlags, StateError, TextureMode, VramView,
};

fn write_png(path: &std::path::Path, width: u32, height: u32, color: [u8; 4]) {
    let img = image::RgbaImage::from_pixel(width, height, image::Rgba(color));
    img.save(path).unwrap();
}

fn game_settings(root: &std::path::Path) -> CacheSettings {
    CacheSettings { textures_root: root.to_path_buf(), ..Default::default() }
}

#[test]
fn page_replacement_composites_on_lookup() {
    let tmp = tempfile::tempdir().unwrap();
    let mut buf = vram_buffer();
    fill_rect(&mut buf, Rect::from_extents(0, 0, 256, 256), |x, y| (x * 7 + y) as u16);
    let vram = VramView::new(&buf);

    let page_hash = hash::hash_page(&vram, 0, TextureMode::Direct16Bit);
    let dir = tmp.path().join("GAME").join("replacements");
    std::fs::create_dir_all(&dir).unwrap();
    write_png(
        &dir.join(format!("texpage-C16-{page_hash:016X}-256x256-0-0-256x256.png")),
        512,
        512,
        [10, 20, 30, 255],
    );

    let mut settings = game_settings(tmp.path());
    settings.enable_texture_replacements = true;
    let (mut cache, mut dev) = new_cache(settings);
    cache.set_game_id(&mut dev, &vram, "GAME");

    let uv = Rect::from_extents(0, 0, 16, 16);
    let handle = cache
        .lookup_source(&mut dev, &vram, c16_key(0), &uv, SampleFlags::empty())
        .unwrap();
    let tex = cache.source_texture(handle).unwrap();
    assert_eq!((tex.width, tex.height), (512, 512));
    assert_eq!(tex.pixel(0, 0), u32::from_le_bytes([10, 20, 30, 255]));
    assert_eq!(tex.pixel(511, 511), u32::from_le_bytes([10, 20, 30, 255]));

    // A page with different content decodes plainly at 1x.
    let other = cache
        .lookup_source(&mut dev, &vram, c16_key(4), &uv, SampleFlags::empty())
        .unwrap();
    let tex = cache.source_texture(other).unwrap();
    assert_eq!((tex.width, tex.height), (256, 256));
}

#[test]
fn vram_write_replacement_by_upload_hash() {
    let tmp = tempfile::tempdir().unwrap();
    let pixels: Vec<u16> = (0..128u32 * 64).map(|i| i as u16).collect();
    let (low, high) = hash::vram_upload_hash(&pixels);

    let dir = tmp.path().join("GAME").join("replacements");
    std::fs::create_dir_all(&dir).unwrap();
    write_png(
        &dir.join(format!("{}.png", VramWriteName::new(low, high))),
        256,
        128,
        [1, 2, 3, 255],
    );

    let mut settings = game_settings(tmp.path());
    settings.enable_vram_write_replacements = true;
    let (mut cache, mut dev) = new_cache(settings);
    let buf = vram_buffer();
    let vram = VramView::new(&buf);
    cache.set_game_id(&mut dev, &vram, "GAME");

    let img = cache.vram_write_replacement(128, 64, &pixels).unwrap();
    assert_eq!(img.dimensions(), (256, 128));

    let other: Vec<u16> = vec![0xffff; 128 * 64];
    assert!(cache.vram_write_replacement(128, 64, &other).is_none());
}

#[test]
fn write_replacements_enable_tracking() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("GAME").join("replacements");
    std::fs::create_dir_all(&dir).unwrap();
    write_png(
        &dir.join("texupload-P4-0000000000000001-0000000000000002-64x64-0-0-256x64.png"),
        256,
        64,
        [1, 1, 1, 255],
    );

    let mut settings = game_settings(tmp.path());
    settings.enable_texture_replacements = true;
    let (mut cache, mut dev) = new_cache(settings);
    assert!(!cache.is_tracking_writes());

    let buf = vram_buffer();
    let vram = VramView::new(&buf);
    cache.set_game_id(&mut dev, &vram, "GAME");
    assert!(cache.is_tracking_writes());
}

#[test]
fn sampled_upload_is_dumped_on_invalidation() {
    let tmp = tempfile::tempdir().unwrap();
    let mut buf = vram_buffer();
    fill_rect(&mut buf, Rect::from_extents(0, 0, 64, 64), |x, y| (x + y * 64) as u16);
    let vram = VramView::new(&buf);

    let mut settings = game_settings(tmp.path());
    settings.dump_textures = true;
    let (mut cache, mut dev) = new_cache(settings);
    cache.set_game_id(&mut dev, &vram, "GAME");
    assert!(cache.is_tracking_writes());

    cache.write_vram(&vram, &Rect::from_extents(0, 0, 64, 64));
    let write_hash = hash::hash_rect(&vram, &Rect::from_extents(0, 0, 64, 64));

    // Sample a 64x64-halfword region through a P4 source.
    cache
        .lookup_source(
            &mut dev,
            &vram,
            p4_key(0),
            &Rect::from_extents(0, 0, 64, 64),
            SampleFlags::empty(),
        )
        .unwrap();

    cache.invalidate(&mut dev, &vram);

    let dumps = tmp.path().join("GAME").join("dumps");
    let names: Vec<TextureName> = std::fs::read_dir(&dumps)
        .unwrap()
        .map(|e| {
            let path = e.unwrap().path();
            TextureName::parse(path.file_stem().unwrap().to_str().unwrap()).unwrap()
        })
        .collect();
    assert_eq!(names.len(), 1);
    assert_eq!(names[0].kind, ReplacementKind::TextureFromVramWrite);
    assert_eq!(names[0].src_hash, write_hash);
    assert_eq!(names[0].mode(), TextureMode::Palette4Bit);
    // 64 halfwords of P4 = 256 texels.
    assert_eq!((names[0].width, names[0].height), (256, 64));

    // A second identical run dedups against the session set.
    cache.write_vram(&vram, &Rect::from_extents(0, 0, 64, 64));
    cache
        .lookup_source(
            &mut dev,
            &vram,
            p4_key(0),
            &Rect::from_extents(0, 0, 64, 64),
            SampleFlags::empty(),
        )
        .unwrap();
    cache.invalidate(&mut dev, &vram);
    assert_eq!(std::fs::read_dir(&dumps).unwrap().count(), 1);
}

#[test]
fn unsampled_uploads_dump_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let buf = vram_buffer();
    let vram = VramView::new(&buf);

    let mut settings = game_settings(tmp.path());
    settings.dump_textures = true;
    let (mut cache, mut dev) = new_cache(settings);
    cache.set_game_id(&mut dev, &vram, "GAME");

    cache.write_vram(&vram, &Rect::from_extents(0, 0, 64, 64));
    cache.invalidate(&mut dev, &vram);

    let dumps = tmp.path().join("GAME").join("dumps");
    // The game directory is only created when something is dumped.
    assert!(!dumps.exists() || std::fs::read_dir(&dumps).unwrap().count() == 0);
}

#[test]
fn state_round_trips_tracked_writes() {
    let buf = vram_buffer();
    let vram = VramView::new(&buf);
    let settings = CacheSettings { always_track_uploads: true, ..Default::default() };
    let (mut cache, mut dev) = new_cache(settings);

    cache.write_vram(&vram, &Rect::from_extents(0, 0, 64, 64));
    cache.write_vram(&vram, &Rect::from_extents(512, 128, 32, 32));
    let before = {
        let mut rects = cache.write_rects();
        rects.sort_by_key(|(a, _)| (a.left, a.top));
        rects
    };

    let state = cache.save_state(&vram);
    cache.load_state(&mut dev, &vram, &state).unwrap();
    let mut after = cache.write_rects();
    after.sort_by_key(|(a, _)| (a.left, a.top));
    assert_eq!(before, after);

    // Restored writes are linked: overwriting one still removes it.
    cache.add_written_rectangle(&vram, &Rect::from_extents(0, 0, 64, 64));
    assert_eq!(cache.live_write_count(), 1);
}

#[test]
fn truncated_state_leaves_cache_empty() {
    let buf = vram_buffer();
    let vram = VramView::new(&buf);
    let settings = CacheSettings { always_track_uploads: true, ..Default::default() };
    let (mut cache, mut dev) = new_cache(settings);

    cache.write_vram(&vram, &Rect::from_extents(0, 0, 64, 64));
    let mut state = cache.save_state(&vram);
    state.truncate(state.len() - 4);

    assert_eq!(
        cache.load_state(&mut dev, &vram, &state),
        Err(StateError::UnexpectedEof)
    );
    assert_eq!(cache.live_write_count(), 0);
}

#[test]
fn old_state_version_loads_as_empty() {
    let buf = vram_buffer();
    let vram = VramView::new(&buf);
    let settings = CacheSettings { always_track_uploads: true, ..Default::default() };
    let (mut cache, mut dev) = new_cache(settings);
    cache.write_vram(&vram, &Rect::from_extents(0, 0, 64, 64));

    let mut state = Vec::new();
    state.extend_from_slice(b"TXCS");
    state.extend_from_slice(&0u32.to_le_bytes());
    assert_eq!(cache.load_state(&mut dev, &vram, &state), Ok(()));
    assert_eq!(cache.live_write_count(), 0);

    assert_eq!(
        cache.load_state(&mut dev, &vram, b"NOPE\x01\x00\x00\x00"),
        Err(StateError::BadMagic)
    );
}
