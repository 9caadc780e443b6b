use crate::fileio::{FileScanner, FileWriter};
use crate::{ImportError, Result};
use std::path::Path;

/// Record that can spill to disk during an external sort
pub trait SortableRecord: Sized {
    fn write_to(&self, writer: &mut FileWriter) -> Result<()>;
    fn read_from(scanner: &mut FileScanner) -> Result<Self>;
}

struct ChunkReader<T> {
    scanner: FileScanner,
    remaining: u64,
    current: Option<(u64, T)>,
}

impl<T: SortableRecord> ChunkReader<T> {
    fn advance(&mut self, key: impl Fn(&T) -> u64) -> Result<()> {
        if self.remaining == 0 {
            self.current = None;
            return Ok(());
        }

        self.remaining -= 1;
        let record = T::read_from(&mut self.scanner)?;
        self.current = Some((key(&record), record));
        Ok(())
    }
}

/// Sort a record stream larger than memory: buffer `block_size` records,
/// spill sorted chunks to scratch files in `dir`, then k-way merge.
///
/// The sort is stable: records with equal keys keep their input order, so a
/// re-run over identical input yields byte-identical output.
pub fn external_sort<T, K, I, E>(
    dir: &Path,
    block_size: usize,
    records: I,
    key: K,
    mut emit: E,
) -> Result<()>
where
    T: SortableRecord,
    K: Fn(&T) -> u64 + Copy,
    I: IntoIterator<Item = Result<T>>,
    E: FnMut(T) -> Result<()>,
{
    let mut buffer: Vec<T> = Vec::new();
    let mut chunk_paths = Vec::new();

    for record in records {
        buffer.push(record?);

        if buffer.len() >= block_size {
            chunk_paths.push(spill_chunk(dir, chunk_paths.len(), &mut buffer, key)?);
        }
    }

    if chunk_paths.is_empty() {
        // everything fits in one block
        buffer.sort_by_key(key);
        for record in buffer {
            emit(record)?;
        }
        return Ok(());
    }

    if !buffer.is_empty() {
        chunk_paths.push(spill_chunk(dir, chunk_paths.len(), &mut buffer, key)?);
    }

    let mut chunks: Vec<ChunkReader<T>> = Vec::with_capacity(chunk_paths.len());
    for path in &chunk_paths {
        let mut scanner = FileScanner::open(path, false)?;
        let remaining = scanner.read_u32()? as u64;
        let mut chunk = ChunkReader {
            scanner,
            remaining,
            current: None,
        };
        chunk.advance(key)?;
        chunks.push(chunk);
    }

    // Merge; ties resolve to the lowest chunk index, which preserves the
    // original input order across chunk boundaries.
    loop {
        let mut best: Option<usize> = None;

        for (index, chunk) in chunks.iter().enumerate() {
            if let Some((chunk_key, _)) = &chunk.current {
                match best {
                    None => best = Some(index),
                    Some(current) => {
                        let (current_key, _) = chunks[current].current.as_ref().unwrap();
                        if chunk_key < current_key {
                            best = Some(index);
                        }
                    }
                }
            }
        }

        let Some(index) = best else { break };
        let (_, record) = chunks[index].current.take().unwrap();
        emit(record)?;
        chunks[index].advance(key)?;
    }

    for path in chunk_paths {
        std::fs::remove_file(&path).map_err(|e| ImportError::io(&path, e))?;
    }

    Ok(())
}

fn spill_chunk<T, K>(dir: &Path, index: usize, buffer: &mut Vec<T>, key: K) -> Result<std::path::PathBuf>
where
    T: SortableRecord,
    K: Fn(&T) -> u64,
{
    buffer.sort_by_key(|record| key(record));

    let path = dir.join(format!("sortchunk{}.tmp", index));
    let mut writer = FileWriter::create(&path)?;

    writer.write_u32(buffer.len() as u32)?;
    for record in buffer.iter() {
        record.write_to(&mut writer)?;
    }
    writer.close()?;

    buffer.clear();
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Item {
        key: u64,
        payload: u64,
    }

    impl SortableRecord for Item {
        fn write_to(&self, writer: &mut FileWriter) -> Result<()> {
            writer.write_u64(self.key)?;
            writer.write_u64(self.payload)
        }

        fn read_from(scanner: &mut FileScanner) -> Result<Self> {
            Ok(Item {
                key: scanner.read_u64()?,
                payload: scanner.read_u64()?,
            })
        }
    }

    fn run_sort(block_size: usize, input: Vec<Item>) -> Vec<Item> {
        let dir = tempfile::tempdir().unwrap();
        let mut output = Vec::new();

        external_sort(
            dir.path(),
            block_size,
            input.into_iter().map(Ok),
            |item: &Item| item.key,
            |item| {
                output.push(item);
                Ok(())
            },
        )
        .unwrap();

        output
    }

    #[test]
    fn sorts_in_memory_when_small() {
        let output = run_sort(
            100,
            vec![
                Item { key: 3, payload: 0 },
                Item { key: 1, payload: 1 },
                Item { key: 2, payload: 2 },
            ],
        );

        assert_eq!(
            output.iter().map(|i| i.key).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn merges_across_spilled_chunks() {
        let input: Vec<Item> = (0..50)
            .map(|i| Item {
                key: (97 * i) % 50,
                payload: i,
            })
            .collect();

        let output = run_sort(8, input);

        let keys: Vec<u64> = output.iter().map(|i| i.key).collect();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);
        assert_eq!(output.len(), 50);
    }

    #[test]
    fn equal_keys_keep_input_order() {
        let input: Vec<Item> = (0..20)
            .map(|i| Item {
                key: i % 2,
                payload: i,
            })
            .collect();

        let output = run_sort(4, input);

        let zeros: Vec<u64> = output
            .iter()
            .filter(|i| i.key == 0)
            .map(|i| i.payload)
            .collect();
        assert_eq!(zeros, vec![0, 2, 4, 6, 8, 10, 12, 14, 16, 18]);
    }
}
