//! Save-state serialization of write tracking.
//!
//! Only tracked uploads and their palette records persist; sources, draw
//! rects and the hash cache are rebuilt on demand after load. The block is
//! versioned: older blocks load as an empty (invalidated) cache, newer
//! blocks are an error.

use thiserror::Error;
use tracing::warn;

use crate::cache::{SampleFlags, SourceKey, TextureCache};
use crate::cache::{PaletteRecord, VramWrite};
use crate::device::GpuDevice;
use crate::geom::{for_each_page_in_rect, Rect};
use crate::vram::{PaletteReg, TextureMode, VramView, MAX_CLUT_SIZE};

const STATE_MAGIC: [u8; 4] = *b"TXCS";
const STATE_VERSION: u32 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("not a texture cache state block")]
    BadMagic,
    #[error("unsupported texture cache state version {0}")]
    UnsupportedVersion(u32),
    #[error("texture cache state block is truncated")]
    UnexpectedEof,
    #[error("texture cache state block is corrupt")]
    Corrupt,
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Writer {
        Writer { buf: Vec::new() }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn rect(&mut self, r: &Rect) {
        self.i32(r.left);
        self.i32(r.top);
        self.i32(r.right);
        self.i32(r.bottom);
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], StateError> {
        let end = self.pos.checked_add(n).ok_or(StateError::UnexpectedEof)?;
        let slice = self.buf.get(self.pos..end).ok_or(StateError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, StateError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, StateError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, StateError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, StateError> {
        let b = self.bytes(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn i32(&mut self) -> Result<i32, StateError> {
        Ok(self.u32()? as i32)
    }

    fn rect(&mut self) -> Result<Rect, StateError> {
        Ok(Rect::new(self.i32()?, self.i32()?, self.i32()?, self.i32()?))
    }
}

impl<D: GpuDevice> TextureCache<D> {
    /// Serializes write tracking. Palette records are synced first so the
    /// sampled regions of still-live sources survive the round trip.
    pub fn save_state(&mut self, vram: &VramView) -> Vec<u8> {
        if self.settings().dump_textures {
            for handle in self.writes.handles() {
                self.sync_write_palette_records(vram, handle);
            }
        }

        let mut w = Writer::new();
        w.buf.extend_from_slice(&STATE_MAGIC);
        w.u32(STATE_VERSION);

        let count = if self.track_writes { self.writes.len() } else { 0 };
        w.u32(count as u32);
        if self.track_writes {
            for (_, write) in self.writes.iter() {
                w.rect(&write.active_rect);
                w.rect(&write.write_rect);
                w.u64(write.hash);
                w.u32(write.num_splits);
                w.u32(write.palette_records.len() as u32);
                for rec in &write.palette_records {
                    w.rect(&rec.rect);
                    w.u8(rec.key.page);
                    w.u8(rec.key.mode as u8);
                    w.u16(rec.key.palette.0);
                    w.u32(rec.flags.bits());
                    w.u64(rec.palette_hash);
                    for &entry in &rec.palette {
                        w.u16(entry);
                    }
                }
            }
        }
        w.buf
    }

    /// Restores write tracking from a state block. The cache is always
    /// invalidated first; an old-version block loads as empty, a corrupt
    /// block leaves the cache empty and reports the error.
    pub fn load_state(
        &mut self,
        device: &mut D,
        vram: &VramView,
        data: &[u8],
    ) -> Result<(), StateError> {
        self.invalidate(device, vram);

        let mut r = Reader::new(data);
        if r.bytes(4)? != STATE_MAGIC {
            return Err(StateError::BadMagic);
        }
        let version = r.u32()?;
        if version < STATE_VERSION {
            warn!("texture cache state version {version} is too old, starting empty");
            return Ok(());
        }
        if version > STATE_VERSION {
            return Err(StateError::UnsupportedVersion(version));
        }

        let result = self.load_writes(&mut r);
        if result.is_err() {
            self.invalidate(device, vram);
        }
        result
    }

    fn load_writes(&mut self, r: &mut Reader) -> Result<(), StateError> {
        let count = r.u32()?;
        for _ in 0..count {
            let active_rect = r.rect()?;
            let write_rect = r.rect()?;
            let hash = r.u64()?;
            let num_splits = r.u32()?;
            if active_rect.is_empty() || !write_rect.contains(&active_rect) {
                return Err(StateError::Corrupt);
            }

            let record_count = r.u32()?;
            let mut palette_records = Vec::new();
            for _ in 0..record_count {
                let rect = r.rect()?;
                let page = r.u8()?;
                let raw_mode = r.u8()?;
                if raw_mode > 3 {
                    return Err(StateError::Corrupt);
                }
                let mode = TextureMode::from_raw(raw_mode);
                let palette = PaletteReg(r.u16()?);
                let flags = SampleFlags::from_bits_truncate(r.u32()?);
                let palette_hash = r.u64()?;
                let mut clut = [0u16; MAX_CLUT_SIZE];
                for entry in &mut clut {
                    *entry = r.u16()?;
                }
                // Records only matter when dumping; parse regardless so the
                // stream stays aligned.
                if self.settings().dump_textures {
                    palette_records.push(PaletteRecord {
                        rect,
                        key: SourceKey::new(page, palette, mode),
                        flags,
                        palette_hash,
                        palette: clut,
                    });
                }
            }

            if !self.track_writes {
                continue;
            }

            let mut pages = [0u8; crate::cache::MAX_PAGE_REFS_PER_WRITE];
            let mut num_pages = 0usize;
            for_each_page_in_rect(&active_rect, |pn| {
                if num_pages < pages.len() {
                    pages[num_pages] = pn as u8;
                    num_pages += 1;
                }
            });
            let handle = self.writes.insert(VramWrite {
                active_rect,
                write_rect,
                hash,
                num_splits,
                palette_records,
                pages,
                num_pages: num_pages as u8,
            });
            for &pn in &pages[..num_pages] {
                self.page_mut(pn as usize).writes.push(handle);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_reports_truncation() {
        let mut r = Reader::new(&[1, 2, 3]);
        assert_eq!(r.u16().unwrap(), 0x0201);
        assert_eq!(r.u32(), Err(StateError::UnexpectedEof));
    }

    #[test]
    fn writer_reader_round_trip() {
        let mut w = Writer::new();
        w.u8(7);
        w.u16(0xbeef);
        w.u32(0xdead_beef);
        w.u64(0x0123_4567_89ab_cdef);
        w.rect(&Rect::new(-1, 2, 3, 4));

        let mut r = Reader::new(&w.buf);
        assert_eq!(r.u8().unwrap(), 7);
        assert_eq!(r.u16().unwrap(), 0xbeef);
        assert_eq!(r.u32().unwrap(), 0xdead_beef);
        assert_eq!(r.u64().unwrap(), 0x0123_4567_89ab_cdef);
        assert_eq!(r.rect().unwrap(), Rect::new(-1, 2, 3, 4));
        assert_eq!(r.u8(), Err(StateError::UnexpectedEof));
    }
}
