use crate::geom::GeoCoord;
use crate::{ImportError, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Buffered little-endian writer for the record-oriented database files.
///
/// Every write advances an internally tracked position so index builders can
/// ask for the offset of the record they are about to write without flushing.
pub struct FileWriter {
    path: PathBuf,
    file: BufWriter<File>,
    pos: u64,
}

impl FileWriter {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|e| ImportError::io(&path, e))?;

        Ok(Self {
            path,
            file: BufWriter::new(file),
            pos: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    fn io_err(&self, e: std::io::Error) -> anyhow::Error {
        ImportError::io(&self.path, e).into()
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.file.write_u8(value).map_err(|e| self.io_err(e))?;
        self.pos += 1;
        Ok(())
    }

    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.file
            .write_u16::<LittleEndian>(value)
            .map_err(|e| self.io_err(e))?;
        self.pos += 2;
        Ok(())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.file
            .write_u32::<LittleEndian>(value)
            .map_err(|e| self.io_err(e))?;
        self.pos += 4;
        Ok(())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.file
            .write_u64::<LittleEndian>(value)
            .map_err(|e| self.io_err(e))?;
        self.pos += 8;
        Ok(())
    }

    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.file
            .write_i64::<LittleEndian>(value)
            .map_err(|e| self.io_err(e))?;
        self.pos += 8;
        Ok(())
    }

    /// 64-bit file offset, fixed width so it can be patched in place
    pub fn write_file_offset(&mut self, value: u64) -> Result<()> {
        self.write_u64(value)
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.write_all(bytes).map_err(|e| self.io_err(e))?;
        self.pos += bytes.len() as u64;
        Ok(())
    }

    /// LEB-128 style unsigned varint, 7 bits per byte
    pub fn write_unsigned(&mut self, mut value: u64) -> Result<()> {
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;

            if value != 0 {
                byte |= 0x80;
            }
            self.write_u8(byte)?;

            if value == 0 {
                return Ok(());
            }
        }
    }

    /// Zig-zag encoded signed varint
    pub fn write_signed(&mut self, value: i64) -> Result<()> {
        self.write_unsigned(((value << 1) ^ (value >> 63)) as u64)
    }

    /// Length-prefixed UTF-8 string
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_unsigned(value.len() as u64)?;
        self.write_bytes(value.as_bytes())
    }

    /// A coordinate as its two quantised unsigned encodings
    pub fn write_coord(&mut self, coord: GeoCoord) -> Result<()> {
        let (lat, lon) = coord.encode();
        self.write_u32(lat)?;
        self.write_u32(lon)
    }

    /// The placeholder record count every record-oriented file starts with
    pub fn write_count_placeholder(&mut self) -> Result<()> {
        self.write_u32(0)
    }

    /// Overwrite a previously written fixed-width u32 without disturbing the
    /// current write position
    pub fn patch_u32(&mut self, at: u64, value: u32) -> Result<()> {
        self.file.flush().map_err(|e| self.io_err(e))?;

        let path = self.path.clone();
        let pos = self.pos;
        let file = self.file.get_mut();
        file.seek(SeekFrom::Start(at))
            .map_err(|e| ImportError::io(&path, e))?;
        file.write_u32::<LittleEndian>(value)
            .map_err(|e| ImportError::io(&path, e))?;
        file.seek(SeekFrom::Start(pos))
            .map_err(|e| ImportError::io(&path, e))?;
        Ok(())
    }

    /// Same as [`FileWriter::patch_u32`] for 64-bit file offsets
    pub fn patch_file_offset(&mut self, at: u64, value: u64) -> Result<()> {
        self.file.flush().map_err(|e| self.io_err(e))?;

        let path = self.path.clone();
        let pos = self.pos;
        let file = self.file.get_mut();
        file.seek(SeekFrom::Start(at))
            .map_err(|e| ImportError::io(&path, e))?;
        file.write_u64::<LittleEndian>(value)
            .map_err(|e| ImportError::io(&path, e))?;
        file.seek(SeekFrom::Start(pos))
            .map_err(|e| ImportError::io(&path, e))?;
        Ok(())
    }

    /// Back-patch the leading record count and flush everything out
    pub fn finish_with_count(&mut self, count: u32) -> Result<()> {
        self.patch_u32(0, count)?;
        self.file.flush().map_err(|e| self.io_err(e))
    }

    pub fn close(mut self) -> Result<()> {
        self.file.flush().map_err(|e| self.io_err(e))
    }

    /// Best-effort flush and close that swallows secondary errors; used on
    /// error paths where the primary failure is already being reported
    pub fn close_failsafe(&mut self) {
        let _ = self.file.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileio::FileScanner;

    fn scratch() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.dat");
        (dir, path)
    }

    #[test]
    fn varints_round_trip() {
        let (_dir, path) = scratch();

        let mut writer = FileWriter::create(&path).unwrap();
        for value in [0u64, 1, 127, 128, 300, 1 << 21, u64::MAX] {
            writer.write_unsigned(value).unwrap();
        }
        for value in [0i64, -1, 1, -300, i64::MIN, i64::MAX] {
            writer.write_signed(value).unwrap();
        }
        writer.close().unwrap();

        let mut scanner = FileScanner::open(&path, false).unwrap();
        for expected in [0u64, 1, 127, 128, 300, 1 << 21, u64::MAX] {
            assert_eq!(scanner.read_unsigned().unwrap(), expected);
        }
        for expected in [0i64, -1, 1, -300, i64::MIN, i64::MAX] {
            assert_eq!(scanner.read_signed().unwrap(), expected);
        }
        assert!(scanner.is_eof());
    }

    #[test]
    fn count_is_back_patched() {
        let (_dir, path) = scratch();

        let mut writer = FileWriter::create(&path).unwrap();
        writer.write_count_placeholder().unwrap();
        writer.write_string("alpha").unwrap();
        writer.write_string("beta").unwrap();
        writer.finish_with_count(2).unwrap();

        let mut scanner = FileScanner::open(&path, false).unwrap();
        assert_eq!(scanner.read_u32().unwrap(), 2);
        assert_eq!(scanner.read_string().unwrap(), "alpha");
        assert_eq!(scanner.read_string().unwrap(), "beta");
    }

    #[test]
    fn position_tracks_writes() {
        let (_dir, path) = scratch();

        let mut writer = FileWriter::create(&path).unwrap();
        writer.write_u32(7).unwrap();
        assert_eq!(writer.position(), 4);
        writer.write_unsigned(128).unwrap();
        assert_eq!(writer.position(), 6);
        writer.write_coord(crate::geom::GeoCoord::new(1.0, 2.0)).unwrap();
        assert_eq!(writer.position(), 14);
    }

    #[test]
    fn patch_preserves_tail_writes() {
        let (_dir, path) = scratch();

        let mut writer = FileWriter::create(&path).unwrap();
        writer.write_file_offset(0).unwrap();
        writer.write_u32(42).unwrap();
        writer.patch_file_offset(0, 99).unwrap();
        writer.write_u32(43).unwrap();
        writer.close().unwrap();

        let mut scanner = FileScanner::open(&path, false).unwrap();
        assert_eq!(scanner.read_file_offset().unwrap(), 99);
        assert_eq!(scanner.read_u32().unwrap(), 42);
        assert_eq!(scanner.read_u32().unwrap(), 43);
    }
}
