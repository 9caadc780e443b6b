use crate::fileio::{FileScanner, FileWriter};
use crate::{ImportError, Result};
use std::path::Path;

const ENTRY_SIZE: u64 = 16;

/// Write an id-to-offset index: a record count followed by fixed-width
/// entries. Entries must arrive sorted by increasing id.
pub fn write_numeric_index<P: AsRef<Path>>(path: P, entries: &[(i64, u64)]) -> Result<()> {
    debug_assert!(entries.windows(2).all(|pair| pair[0].0 < pair[1].0));

    let mut writer = FileWriter::create(path)?;
    writer.write_u32(entries.len() as u32)?;

    for (id, offset) in entries {
        writer.write_i64(*id)?;
        writer.write_u64(*offset)?;
    }

    writer.close()
}

/// Binary-searchable reader over an index written by [`write_numeric_index`].
///
/// When the entry count fits into `cache_size` the whole index is pulled
/// into memory; otherwise lookups seek on the file (or the mapping).
pub struct NumericIndex {
    scanner: Option<FileScanner>,
    cached: Option<Vec<(i64, u64)>>,
    count: u64,
}

impl NumericIndex {
    pub fn open<P: AsRef<Path>>(path: P, memory_mapped: bool, cache_size: usize) -> Result<Self> {
        let mut scanner = FileScanner::open(path.as_ref(), memory_mapped)?;
        let count = scanner.read_u32()? as u64;

        let expected = 4 + count * ENTRY_SIZE;
        if scanner.len() < expected {
            return Err(ImportError::format(
                path.as_ref(),
                format!("index truncated: {} < {} bytes", scanner.len(), expected),
            )
            .into());
        }

        if count as usize <= cache_size {
            let mut cached = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let id = scanner.read_i64()?;
                let offset = scanner.read_u64()?;
                cached.push((id, offset));
            }

            Ok(Self {
                scanner: None,
                cached: Some(cached),
                count,
            })
        } else {
            Ok(Self {
                scanner: Some(scanner),
                cached: None,
                count,
            })
        }
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// File offset of the record with the given id
    pub fn offset_of(&mut self, id: i64) -> Result<Option<u64>> {
        if let Some(cached) = &self.cached {
            return Ok(cached
                .binary_search_by_key(&id, |entry| entry.0)
                .ok()
                .map(|i| cached[i].1));
        }

        let scanner = self.scanner.as_mut().unwrap();
        let mut low = 0u64;
        let mut high = self.count;

        while low < high {
            let mid = (low + high) / 2;
            scanner.set_pos(4 + mid * ENTRY_SIZE)?;
            let entry_id = scanner.read_i64()?;

            if entry_id == id {
                return Ok(Some(scanner.read_u64()?));
            } else if entry_id < id {
                low = mid + 1;
            } else {
                high = mid;
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("test.idx");
        let entries: Vec<(i64, u64)> = (0..100).map(|i| (i * 3, (i * 100) as u64)).collect();
        write_numeric_index(&path, &entries).unwrap();
        path
    }

    #[test]
    fn lookups_hit_and_miss() {
        let dir = tempfile::tempdir().unwrap();
        let path = build(dir.path());

        // cached and uncached paths behave the same
        for cache_size in [1000, 0] {
            let mut index = NumericIndex::open(&path, false, cache_size).unwrap();
            assert_eq!(index.len(), 100);
            assert_eq!(index.offset_of(0).unwrap(), Some(0));
            assert_eq!(index.offset_of(99).unwrap(), Some(3300));
            assert_eq!(index.offset_of(297).unwrap(), Some(9900));
            assert_eq!(index.offset_of(1).unwrap(), None);
            assert_eq!(index.offset_of(10_000).unwrap(), None);
        }
    }

    #[test]
    fn memory_mapped_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = build(dir.path());

        let mut index = NumericIndex::open(&path, true, 0).unwrap();
        assert_eq!(index.offset_of(150).unwrap(), Some(5000));
    }
}
