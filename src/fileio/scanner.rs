use crate::geom::GeoCoord;
use crate::{ImportError, Result};
use byteorder::{ByteOrder, LittleEndian};
use memmap2::Mmap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

enum Backend {
    Buffered(BufReader<File>),
    Mapped(Mmap),
}

/// Read side of [`crate::fileio::FileWriter`]: buffered or memory-mapped,
/// selected per file by the import parameters.
pub struct FileScanner {
    path: PathBuf,
    backend: Backend,
    pos: u64,
    len: u64,
}

impl FileScanner {
    pub fn open<P: AsRef<Path>>(path: P, memory_mapped: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| ImportError::io(&path, e))?;
        let len = file
            .metadata()
            .map_err(|e| ImportError::io(&path, e))?
            .len();

        let backend = if memory_mapped {
            // Safety: the import owns its files exclusively for the run
            let map = unsafe { Mmap::map(&file) }.map_err(|e| ImportError::io(&path, e))?;
            Backend::Mapped(map)
        } else {
            Backend::Buffered(BufReader::new(file))
        };

        Ok(Self {
            path,
            backend,
            pos: 0,
            len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_eof(&self) -> bool {
        self.pos >= self.len
    }

    pub fn set_pos(&mut self, pos: u64) -> Result<()> {
        match &mut self.backend {
            Backend::Buffered(reader) => {
                reader
                    .seek(SeekFrom::Start(pos))
                    .map_err(|e| ImportError::io(&self.path, e))?;
            }
            Backend::Mapped(_) => {}
        }
        self.pos = pos;
        Ok(())
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        match &mut self.backend {
            Backend::Buffered(reader) => reader
                .read_exact(buf)
                .map_err(|e| ImportError::io(&self.path, e))?,
            Backend::Mapped(map) => {
                let start = self.pos as usize;
                let end = start + buf.len();
                if end > map.len() {
                    return Err(ImportError::format(&self.path, "read past end of file").into());
                }
                buf.copy_from_slice(&map[start..end]);
            }
        }
        self.pos += buf.len() as u64;
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.fill(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.fill(&mut buf)?;
        Ok(LittleEndian::read_u16(&buf))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.fill(&mut buf)?;
        Ok(LittleEndian::read_u32(&buf))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.fill(&mut buf)?;
        Ok(LittleEndian::read_u64(&buf))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.fill(&mut buf)?;
        Ok(LittleEndian::read_i64(&buf))
    }

    pub fn read_file_offset(&mut self) -> Result<u64> {
        self.read_u64()
    }

    pub fn read_unsigned(&mut self) -> Result<u64> {
        let mut value: u64 = 0;
        let mut shift = 0;

        loop {
            let byte = self.read_u8()?;
            value |= ((byte & 0x7f) as u64) << shift;

            if byte & 0x80 == 0 {
                return Ok(value);
            }

            shift += 7;
            if shift >= 64 {
                return Err(ImportError::format(&self.path, "varint longer than 64 bits").into());
            }
        }
    }

    pub fn read_signed(&mut self) -> Result<i64> {
        let raw = self.read_unsigned()?;
        Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_unsigned()? as usize;
        let mut buf = vec![0u8; len];
        self.fill(&mut buf)?;
        String::from_utf8(buf)
            .map_err(|_| ImportError::format(&self.path, "invalid UTF-8 in string").into())
    }

    pub fn read_coord(&mut self) -> Result<GeoCoord> {
        let lat = self.read_u32()?;
        let lon = self.read_u32()?;
        Ok(GeoCoord::decode(lat, lon))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileio::FileWriter;

    #[test]
    fn mapped_and_buffered_read_identically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.dat");

        let mut writer = FileWriter::create(&path).unwrap();
        writer.write_u32(7).unwrap();
        writer.write_signed(-42).unwrap();
        writer.write_string("node").unwrap();
        writer
            .write_coord(GeoCoord::new(51.5, -0.1))
            .unwrap();
        writer.close().unwrap();

        for memory_mapped in [false, true] {
            let mut scanner = FileScanner::open(&path, memory_mapped).unwrap();
            assert_eq!(scanner.read_u32().unwrap(), 7);
            assert_eq!(scanner.read_signed().unwrap(), -42);
            assert_eq!(scanner.read_string().unwrap(), "node");

            let coord = scanner.read_coord().unwrap();
            assert!((coord.lat - 51.5).abs() < 1e-6);
            assert!((coord.lon + 0.1).abs() < 1e-6);
            assert!(scanner.is_eof());
        }
    }

    #[test]
    fn set_pos_allows_random_access() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.dat");

        let mut writer = FileWriter::create(&path).unwrap();
        for i in 0..10u32 {
            writer.write_u32(i).unwrap();
        }
        writer.close().unwrap();

        let mut scanner = FileScanner::open(&path, false).unwrap();
        scanner.set_pos(4 * 7).unwrap();
        assert_eq!(scanner.read_u32().unwrap(), 7);
        scanner.set_pos(0).unwrap();
        assert_eq!(scanner.read_u32().unwrap(), 0);
    }
}
